// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

/// Identifies an algorithm slot in the per-frame pipeline. Several
/// implementations (ids) can be registered for one type; only one is current.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlgoType {
    Ae,       // Auto exposure.
    Awb,      // Auto white balance.
    Af,       // Auto focus.
    Ablc,     // Black level.
    Adpcc,    // Defect pixel cluster correction.
    Amerge,   // HDR merge.
    Atmo,     // HDR tone mapping.
    Adrc,     // Dynamic range compression.
    Anr,      // Bayer/YUV noise reduction.
    Alsc,     // Lens shading correction.
    Agic,     // Green imbalance correction.
    Adebayer, // Demosaic.
    Accm,     // Color correction matrix.
    A3dlut,   // 3D lookup table.
    Agamma,   // Gamma curve.
    Awdr,     // Wide dynamic range.
    Adehaze,  // Dehaze / contrast enhancement.
    Aldch,    // Lens distortion correction.
    Afec,     // Fisheye correction.
    Acp,      // Color processing (brightness/contrast/saturation/hue).
    Aie,      // Image effects.
    Asharp,   // Sharpening.
    Aorb,     // ORB feature extraction.
    Acgc,     // Color gamut conversion.
    Asd,      // Scene detection.
    Acsm,     // Color space matrix.
}

/// Groups algorithm types that share phase-input fields and result shapes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AlgoFamily {
    Exposure,
    WhiteBalance,
    Focus,
    Hdr,
    ColorCorrection,
    LensShading,
    Orb,
    /// Table-driven modules whose result is a strength plus a calibration
    /// table, interpolated by ISO.
    Tuning,
}

/// Fixed per-frame processing order. Exposure runs first because nearly every
/// other type reads its result; white balance precedes the color modules that
/// consume its gains and color temperature.
pub const PROCESSING_ORDER: [AlgoType; 26] = [
    AlgoType::Ae,
    AlgoType::Ablc,
    AlgoType::Awb,
    AlgoType::Af,
    AlgoType::Amerge,
    AlgoType::Atmo,
    AlgoType::Adrc,
    AlgoType::Alsc,
    AlgoType::Accm,
    AlgoType::A3dlut,
    AlgoType::Adpcc,
    AlgoType::Anr,
    AlgoType::Agic,
    AlgoType::Adebayer,
    AlgoType::Agamma,
    AlgoType::Awdr,
    AlgoType::Adehaze,
    AlgoType::Aldch,
    AlgoType::Afec,
    AlgoType::Acp,
    AlgoType::Aie,
    AlgoType::Asharp,
    AlgoType::Aorb,
    AlgoType::Acgc,
    AlgoType::Asd,
    AlgoType::Acsm,
];

impl AlgoType {
    pub const COUNT: usize = PROCESSING_ORDER.len();

    pub fn family(&self) -> AlgoFamily {
        match self {
            AlgoType::Ae => AlgoFamily::Exposure,
            AlgoType::Awb => AlgoFamily::WhiteBalance,
            AlgoType::Af => AlgoFamily::Focus,
            AlgoType::Amerge | AlgoType::Atmo => AlgoFamily::Hdr,
            AlgoType::Accm | AlgoType::A3dlut => AlgoFamily::ColorCorrection,
            AlgoType::Alsc => AlgoFamily::LensShading,
            AlgoType::Aorb => AlgoFamily::Orb,
            _ => AlgoFamily::Tuning,
        }
    }

    /// Position of this type in PROCESSING_ORDER; also used to index the
    /// per-type result slots.
    pub fn index(&self) -> usize {
        // PROCESSING_ORDER contains every variant exactly once.
        PROCESSING_ORDER.iter().position(|t| t == self).unwrap_or(0)
    }

    pub fn from_index(index: usize) -> Option<AlgoType> {
        PROCESSING_ORDER.get(index).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlgoType::Ae => "ae",
            AlgoType::Awb => "awb",
            AlgoType::Af => "af",
            AlgoType::Ablc => "ablc",
            AlgoType::Adpcc => "adpcc",
            AlgoType::Amerge => "amerge",
            AlgoType::Atmo => "atmo",
            AlgoType::Adrc => "adrc",
            AlgoType::Anr => "anr",
            AlgoType::Alsc => "alsc",
            AlgoType::Agic => "agic",
            AlgoType::Adebayer => "adebayer",
            AlgoType::Accm => "accm",
            AlgoType::A3dlut => "a3dlut",
            AlgoType::Agamma => "agamma",
            AlgoType::Awdr => "awdr",
            AlgoType::Adehaze => "adehaze",
            AlgoType::Aldch => "aldch",
            AlgoType::Afec => "afec",
            AlgoType::Acp => "acp",
            AlgoType::Aie => "aie",
            AlgoType::Asharp => "asharp",
            AlgoType::Aorb => "aorb",
            AlgoType::Acgc => "acgc",
            AlgoType::Asd => "asd",
            AlgoType::Acsm => "acsm",
        }
    }
}

impl fmt::Display for AlgoType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Implementation id within an algorithm type. Id 0 is the built-in reference
/// implementation; anything else is a plugin.
pub type AlgoId = u32;

pub const REFERENCE_ALGO_ID: AlgoId = 0;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn order_is_a_permutation() {
        let unique: HashSet<_> = PROCESSING_ORDER.iter().collect();
        assert_eq!(unique.len(), AlgoType::COUNT);
        for (i, t) in PROCESSING_ORDER.iter().enumerate() {
            assert_eq!(t.index(), i);
            assert_eq!(AlgoType::from_index(i), Some(*t));
        }
    }

    #[test]
    fn dependencies_run_first() {
        assert_eq!(PROCESSING_ORDER[0], AlgoType::Ae);
        assert!(AlgoType::Awb.index() < AlgoType::Accm.index());
        assert!(AlgoType::Awb.index() < AlgoType::Alsc.index());
        assert!(AlgoType::Ae.index() < AlgoType::Af.index());
        assert!(AlgoType::Ae.index() < AlgoType::Anr.index());
    }
}
