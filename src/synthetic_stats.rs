// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Fake statistics source that renders a fixed scene. For testing.

use std::time::SystemTime;

use crate::params::FullParams;
use crate::sensor::{ExposureParams, WorkingMode};
use crate::stats::{HISTOGRAM_BINS, IspStatsBuffer, RawAeStats, RawAfStats, RawAwbStats,
                   RawHdrStats, RawOrbStats};

const ZONES: usize = 16;

// Total exposure (seconds x gain) of ExposureParams::default().
const REFERENCE_EXPOSURE: f64 = 0.01;

#[derive(Clone, Debug, PartialEq)]
pub struct Scene {
    /// Mean luma at the reference exposure of 10ms, unity gain.
    pub brightness: f32,
    /// Relative (R, G, B) reflectance of the light source.
    pub color: [f32; 3],
    /// Lens position at which the scene is in focus.
    pub focus_peak: i32,
    pub keypoints: Vec<(u16, u16)>,
}

impl Default for Scene {
    fn default() -> Self {
        Scene {
            brightness: 40.0,
            color: [0.6, 1.0, 0.8],
            focus_peak: 300,
            keypoints: vec![(100, 100), (640, 360), (1200, 700)],
        }
    }
}

pub struct SyntheticStatsSource {
    scene: Scene,
    working_mode: WorkingMode,
    exposure: ExposureParams,
    hdr_exposures: Vec<ExposureParams>,
    lens_position: i32,
    frame_id: u32,
}

impl SyntheticStatsSource {
    pub fn new(scene: Scene, working_mode: WorkingMode) -> Self {
        let exposure = ExposureParams::default();
        SyntheticStatsSource {
            scene,
            working_mode,
            exposure,
            hdr_exposures: vec![exposure; working_mode.exposure_count()],
            lens_position: 0,
            frame_id: 0,
        }
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    pub fn exposure(&self) -> ExposureParams {
        self.exposure
    }

    pub fn set_working_mode(&mut self, working_mode: WorkingMode) {
        self.working_mode = working_mode;
        self.hdr_exposures = vec![self.exposure; working_mode.exposure_count()];
    }

    pub fn set_scene(&mut self, scene: Scene) {
        self.scene = scene;
    }

    /// Programs the "sensor" with the engine's output, closing the loop.
    pub fn apply(&mut self, params: &FullParams) {
        self.exposure = params.exposure;
        self.hdr_exposures.clone_from(&params.hdr_exposures);
        if let Some(pos) = params.lens_position {
            self.lens_position = pos;
        }
    }

    fn luma_at(&self, exposure: &ExposureParams) -> f32 {
        let scale = exposure.total_exposure() / REFERENCE_EXPOSURE;
        (self.scene.brightness as f64 * scale).clamp(0.0, 255.0) as f32
    }

    // Peaked histogram around `luma`, 1000 samples.
    fn histogram(luma: f32) -> Vec<u32> {
        let center = luma.round() as i32;
        let mut histogram = vec![0; HISTOGRAM_BINS];
        for offset in -8i32..=8 {
            let bin = (center + offset).clamp(0, HISTOGRAM_BINS as i32 - 1) as usize;
            histogram[bin] += (9 - offset.abs()) as u32 * 12;
        }
        histogram
    }

    /// Renders statistics for the next frame at the current exposure.
    pub fn next_frame(&mut self) -> IspStatsBuffer {
        self.frame_id += 1;
        let luma = self.luma_at(&self.exposure);
        let zone_luma = (0..ZONES).map(|z| {
            // Slight vignetting towards the last zones.
            (luma * (1.0 - 0.01 * z as f32)).clamp(0.0, 255.0) as u8
        }).collect();

        let [r, g, b] = self.scene.color;
        let level = luma * 100.0;
        let zone_sums = vec![[(r * level) as u32, (g * level) as u32, (b * level) as u32]; ZONES];

        let defocus = (self.lens_position - self.scene.focus_peak).unsigned_abs();
        let sharpness = 10_000u32.saturating_sub(defocus * 20).max(1);

        let hdr = if self.working_mode.is_hdr() {
            Some(RawHdrStats{
                exposure_histograms: self.hdr_exposures.iter()
                    .map(|e| Self::histogram(self.luma_at(e)))
                    .collect(),
            })
        } else {
            None
        };

        IspStatsBuffer {
            frame_id: self.frame_id,
            readout_time: SystemTime::now(),
            exposure: self.exposure,
            ae: Some(RawAeStats{histogram: Self::histogram(luma), zone_luma}),
            awb: Some(RawAwbStats{zone_sums, zone_counts: vec![100; ZONES]}),
            af: Some(RawAfStats{
                zone_sharpness: vec![sharpness / 4; 4],
                lens_position: self.lens_position,
            }),
            hdr,
            orb: Some(RawOrbStats{keypoints: self.scene.keypoints.clone()}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::AnalyzerStats;

    #[test]
    fn brightness_follows_exposure() {
        let mut source = SyntheticStatsSource::new(Scene::default(), WorkingMode::Normal);
        let dim = AnalyzerStats::convert(&source.next_frame(), WorkingMode::Normal);
        let mut params = FullParams::default();
        params.exposure.digital_gain = 2.0;
        source.apply(&params);
        let bright = AnalyzerStats::convert(&source.next_frame(), WorkingMode::Normal);
        assert_eq!(bright.frame_id, 2);
        let (d, b) = (dim.aec.unwrap().mean_luma, bright.aec.unwrap().mean_luma);
        assert!((d - 40.0).abs() < 1.0);
        assert!((b - 80.0).abs() < 1.0);
    }

    #[test]
    fn hdr_stats_only_in_hdr_modes() {
        let mut source = SyntheticStatsSource::new(Scene::default(), WorkingMode::Normal);
        assert!(source.next_frame().hdr.is_none());
        source.set_working_mode(WorkingMode::Hdr3);
        let stats = AnalyzerStats::convert(&source.next_frame(), WorkingMode::Hdr3);
        assert!(stats.hdr_valid());
        assert!(stats.awb_valid() && stats.af_valid() && stats.orb_valid());
    }
}
