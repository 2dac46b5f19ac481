// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};

/// Sensor analog gain multiplier. 1.0 is unity gain; the upper bound covers
/// every sensor we integrate with. Each sensor driver maps this multiplier to
/// its own register encoding.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Gain(f32);

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

impl Gain {
    pub const MIN: f32 = 1.0;
    pub const MAX: f32 = 256.0;

    pub fn new(gain: f32) -> Gain {
        assert!(gain >= Self::MIN);
        assert!(gain <= Self::MAX);
        Gain(gain)
    }

    /// Like new(), but clamps out of range values instead of panicking.
    pub fn clamped(gain: f32) -> Gain {
        Gain(gain.clamp(Self::MIN, Self::MAX))
    }

    pub fn value(&self) -> f32 {
        self.0
    }
}

/// Exposure settings for one frame (or one sub-frame of an HDR capture).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExposureParams {
    pub integration_time: Duration,
    pub analog_gain: Gain,

    /// Applied by the ISP after readout. 1.0 means none.
    pub digital_gain: f32,
}

impl Default for ExposureParams {
    fn default() -> Self {
        ExposureParams {
            integration_time: Duration::from_millis(10),
            analog_gain: Gain::new(1.0),
            digital_gain: 1.0,
        }
    }
}

impl ExposureParams {
    /// ISO equivalent, using the usual convention of ISO 50 at unity gain.
    pub fn iso(&self) -> u32 {
        (50.0 * self.analog_gain.value() * self.digital_gain).round() as u32
    }

    /// Product of integration time (in seconds) and total gain.
    pub fn total_exposure(&self) -> f64 {
        self.integration_time.as_secs_f64() *
            self.analog_gain.value() as f64 * self.digital_gain as f64
    }
}

/// How the sensor and ISP combine exposures into one output frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum WorkingMode {
    /// One exposure per frame.
    #[default]
    Normal,
    /// Two exposures merged by the ISP.
    Hdr2,
    /// Three exposures merged by the ISP.
    Hdr3,
}

impl fmt::Display for WorkingMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl WorkingMode {
    pub fn is_hdr(&self) -> bool {
        !matches!(self, WorkingMode::Normal)
    }

    /// Number of sensor exposures that make up one output frame.
    pub fn exposure_count(&self) -> usize {
        match self {
            WorkingMode::Normal => 1,
            WorkingMode::Hdr2 => 2,
            WorkingMode::Hdr3 => 3,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BayerPattern {
    Rggb, Grbg, Gbrg, Bggr,
}

/// Static description of the sensor mode the pipeline is prepared for.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorDescriptor {
    /// e.g. "imx415".
    pub model: String,

    /// (width, height) of the output frame, in pixels.
    pub dimensions: (u32, u32),

    pub bayer: BayerPattern,

    /// Bounds the exposure algorithm must respect.
    pub max_integration_time: Duration,
    pub max_analog_gain: Gain,

    /// Nominal frame interval.
    pub frame_duration: Duration,
}

impl SensorDescriptor {
    pub fn new(model: &str, width: u32, height: u32) -> Self {
        SensorDescriptor {
            model: model.to_string(),
            dimensions: (width, height),
            bayer: BayerPattern::Rggb,
            max_integration_time: Duration::from_millis(33),
            max_analog_gain: Gain::new(64.0),
            frame_duration: Duration::from_micros(33_333),
        }
    }

    pub fn width(&self) -> u32 {
        self.dimensions.0
    }

    pub fn height(&self) -> u32 {
        self.dimensions.1
    }

    /// Returns InvalidArgument if the descriptor cannot describe a real
    /// sensor mode.
    pub fn validate(&self) -> Result<(), CanonicalError> {
        let (w, h) = self.dimensions;
        if w == 0 || h == 0 {
            return Err(invalid_argument_error(
                format!("sensor {} has empty dimensions {}x{}",
                        self.model, w, h).as_str()));
        }
        // Bayer quads need even dimensions.
        if w % 2 != 0 || h % 2 != 0 {
            return Err(invalid_argument_error(
                format!("sensor {} dimensions {}x{} must be even",
                        self.model, w, h).as_str()));
        }
        if self.max_integration_time.is_zero() {
            return Err(invalid_argument_error(
                format!("sensor {} has zero max integration time", self.model).as_str()));
        }
        if self.frame_duration.is_zero() {
            return Err(invalid_argument_error(
                format!("sensor {} has zero frame duration", self.model).as_str()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_tracks_total_gain() {
        let exp = ExposureParams {
            integration_time: Duration::from_millis(20),
            analog_gain: Gain::new(4.0),
            digital_gain: 2.0,
        };
        assert_eq!(exp.iso(), 400);
        assert!((exp.total_exposure() - 0.16).abs() < 1e-9);
    }

    #[test]
    fn gain_clamps() {
        assert_eq!(Gain::clamped(0.1).value(), Gain::MIN);
        assert_eq!(Gain::clamped(1000.0).value(), Gain::MAX);
    }

    #[test]
    #[should_panic]
    fn gain_below_unity_panics() {
        Gain::new(0.5);
    }

    #[test]
    fn descriptor_validation() {
        assert!(SensorDescriptor::new("imx415", 1920, 1080).validate().is_ok());
        assert!(SensorDescriptor::new("odd", 1921, 1080).validate().is_err());
        assert!(SensorDescriptor::new("empty", 0, 1080).validate().is_err());
    }

    #[test]
    fn hdr_modes() {
        assert!(!WorkingMode::Normal.is_hdr());
        assert_eq!(WorkingMode::Hdr3.exposure_count(), 3);
    }
}
