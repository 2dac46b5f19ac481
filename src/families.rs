// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Per-family phase parameter types and the policies the generic handle
//! applies on their behalf. Each marker type below implements AlgoTraits for
//! all algorithm types of one AlgoFamily.
//!
//! Bypass conditions per family:
//! * Exposure skips when exposure statistics are invalid. The reference
//!   implementation instead synthesizes a default while the pipeline is
//!   initializing; plugins always see the bypass.
//! * White balance skips when its statistics are invalid (pre_process), and
//!   separately when no exposure result exists yet (processing).
//! * Focus needs both focus and exposure statistics.
//! * HDR merge/tone mapping need HDR statistics, but only in HDR modes.
//! * Color correction needs a white balance result.
//! * ORB needs ORB statistics.

use std::time::Duration;

use crate::algo_type::{AlgoFamily, AlgoType};
use crate::algorithm::{AlgoTraits, CommonInput, PhaseKind};
use crate::calib::IsoTable;
use crate::sensor::{ExposureParams, Gain};
use crate::shared_state::{AlgoResult, SharedAnalysisState};
use crate::stats::{AecStats, AfStats, AwbStats, HdrStats, OrbStats};

// Exposure.

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AeAttrib {
    /// Overrides the calibration's target luma.
    pub target_luma: Option<f32>,
    /// Fixed exposure; disables automatic exposure.
    pub manual: Option<ExposureParams>,
}

#[derive(Clone, Debug)]
pub struct ExposureInput {
    pub aec: Option<AecStats>,
    pub hdr: Option<HdrStats>,
    pub max_integration_time: Duration,
    pub max_analog_gain: Gain,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AeResult {
    pub exposure: ExposureParams,
    /// One entry per sensor exposure, long first. Length 1 in Normal mode.
    pub hdr_exposures: Vec<ExposureParams>,
    pub mean_luma: f32,
    pub converged: bool,
}

pub struct Exposure;

impl AlgoTraits for Exposure {
    const FAMILY: AlgoFamily = AlgoFamily::Exposure;
    type Attrib = AeAttrib;
    type Input = ExposureInput;
    type Result = AeResult;

    fn build_input(_algo_type: AlgoType, shared: &SharedAnalysisState) -> ExposureInput {
        ExposureInput {
            aec: shared.stats.aec.clone(),
            hdr: shared.stats.hdr.clone(),
            max_integration_time: shared.sensor.max_integration_time,
            max_analog_gain: shared.sensor.max_analog_gain,
        }
    }

    fn bypass(phase: PhaseKind, _common: &CommonInput, input: &ExposureInput) -> bool {
        phase == PhaseKind::PreProcess && input.aec.is_none()
    }

    fn reference_default(common: &CommonInput, input: &ExposureInput) -> Option<AeResult> {
        if input.aec.is_some() || !common.init {
            return None;
        }
        Some(AeResult {
            exposure: common.exposure,
            hdr_exposures: vec![common.exposure; common.working_mode.exposure_count()],
            mean_luma: 0.0,
            converged: false,
        })
    }
}

impl From<AeResult> for AlgoResult {
    fn from(r: AeResult) -> Self { AlgoResult::Ae(r) }
}

// White balance.

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WbGains {
    pub r: f32,
    pub gr: f32,
    pub gb: f32,
    pub b: f32,
}

impl WbGains {
    pub fn new(r: f32, b: f32) -> Self {
        WbGains{r, gr: 1.0, gb: 1.0, b}
    }

    pub fn unity() -> Self {
        Self::new(1.0, 1.0)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum AwbMode {
    #[default]
    Auto,
    Manual(WbGains),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AwbAttrib {
    pub mode: AwbMode,
}

#[derive(Clone, Debug)]
pub struct WhiteBalanceInput {
    pub awb: Option<AwbStats>,
    /// Exposure result already produced this frame (or the last committed
    /// one).
    pub ae: Option<AeResult>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AwbResult {
    pub gains: WbGains,
    /// Estimated correlated color temperature, Kelvin.
    pub cct: f32,
    pub converged: bool,
}

pub struct WhiteBalance;

impl AlgoTraits for WhiteBalance {
    const FAMILY: AlgoFamily = AlgoFamily::WhiteBalance;
    type Attrib = AwbAttrib;
    type Input = WhiteBalanceInput;
    type Result = AwbResult;

    fn build_input(_algo_type: AlgoType, shared: &SharedAnalysisState) -> WhiteBalanceInput {
        WhiteBalanceInput {
            awb: shared.stats.awb.clone(),
            ae: shared.comb.ae().cloned(),
        }
    }

    fn bypass(phase: PhaseKind, _common: &CommonInput, input: &WhiteBalanceInput) -> bool {
        match phase {
            PhaseKind::PreProcess => input.awb.is_none(),
            PhaseKind::Processing => input.ae.is_none(),
            _ => false,
        }
    }

    fn reference_default(common: &CommonInput, input: &WhiteBalanceInput)
                         -> Option<AwbResult> {
        if input.awb.is_some() || !common.init {
            return None;
        }
        let (r, b) = common.calib.default_wb_gains;
        Some(AwbResult{gains: WbGains::new(r, b), cct: 5000.0, converged: false})
    }
}

impl From<AwbResult> for AlgoResult {
    fn from(r: AwbResult) -> Self { AlgoResult::Awb(r) }
}

// Focus.

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum AfMode {
    #[default]
    ContinuousAuto,
    Manual(i32),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AfAttrib {
    pub mode: AfMode,
}

#[derive(Clone, Debug)]
pub struct FocusInput {
    pub af: Option<AfStats>,
    pub aec: Option<AecStats>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AfResult {
    pub lens_position: i32,
    pub sharpness: f64,
    pub locked: bool,
}

pub struct Focus;

impl AlgoTraits for Focus {
    const FAMILY: AlgoFamily = AlgoFamily::Focus;
    type Attrib = AfAttrib;
    type Input = FocusInput;
    type Result = AfResult;

    fn build_input(_algo_type: AlgoType, shared: &SharedAnalysisState) -> FocusInput {
        FocusInput {
            af: shared.stats.af.clone(),
            aec: shared.stats.aec.clone(),
        }
    }

    fn bypass(phase: PhaseKind, _common: &CommonInput, input: &FocusInput) -> bool {
        phase == PhaseKind::PreProcess && (input.af.is_none() || input.aec.is_none())
    }
}

impl From<AfResult> for AlgoResult {
    fn from(r: AfResult) -> Self { AlgoResult::Af(r) }
}

// HDR merge and tone mapping.

#[derive(Clone, Debug, PartialEq)]
pub struct HdrAttrib {
    /// 0 disables local tone mapping, 1 is the calibrated strength.
    pub strength: f32,
}

impl Default for HdrAttrib {
    fn default() -> Self {
        HdrAttrib{strength: 1.0}
    }
}

#[derive(Clone, Debug)]
pub struct HdrInput {
    pub hdr: Option<HdrStats>,
    pub ae: Option<AeResult>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HdrResult {
    pub algo_type: AlgoType,
    /// Ratio of the longest to the shortest exposure; 1 in Normal mode.
    pub merge_ratio: f32,
    /// Global tone curve, 0..=4095 output per equally spaced input sample.
    pub tone_curve: Vec<u16>,
}

pub struct Hdr;

impl AlgoTraits for Hdr {
    const FAMILY: AlgoFamily = AlgoFamily::Hdr;
    type Attrib = HdrAttrib;
    type Input = HdrInput;
    type Result = HdrResult;

    fn build_input(_algo_type: AlgoType, shared: &SharedAnalysisState) -> HdrInput {
        HdrInput {
            hdr: shared.stats.hdr.clone(),
            ae: shared.comb.ae().cloned(),
        }
    }

    fn bypass(phase: PhaseKind, common: &CommonInput, input: &HdrInput) -> bool {
        phase == PhaseKind::PreProcess &&
            common.working_mode.is_hdr() && input.hdr.is_none()
    }
}

impl From<HdrResult> for AlgoResult {
    fn from(r: HdrResult) -> Self { AlgoResult::Hdr(r) }
}

// Color correction (CCM and 3D LUT).

#[derive(Clone, Debug, PartialEq)]
pub struct CcmAttrib {
    pub saturation: f32,
}

impl Default for CcmAttrib {
    fn default() -> Self {
        CcmAttrib{saturation: 1.0}
    }
}

#[derive(Clone, Debug)]
pub struct ColorInput {
    /// White balance result of this frame or the last committed one.
    pub awb: Option<AwbResult>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CcmResult {
    pub algo_type: AlgoType,
    pub matrix: [f32; 9],
    /// White balance gains the matrix was derived for.
    pub wb_gains: WbGains,
    pub saturation: f32,
}

pub struct ColorCorrection;

impl AlgoTraits for ColorCorrection {
    const FAMILY: AlgoFamily = AlgoFamily::ColorCorrection;
    type Attrib = CcmAttrib;
    type Input = ColorInput;
    type Result = CcmResult;

    fn build_input(_algo_type: AlgoType, shared: &SharedAnalysisState) -> ColorInput {
        ColorInput{awb: shared.comb.awb().cloned()}
    }

    fn bypass(phase: PhaseKind, _common: &CommonInput, input: &ColorInput) -> bool {
        phase == PhaseKind::Processing && input.awb.is_none()
    }
}

impl From<CcmResult> for AlgoResult {
    fn from(r: CcmResult) -> Self { AlgoResult::Ccm(r) }
}

// Lens shading.

#[derive(Clone, Debug, PartialEq)]
pub struct LscAttrib {
    pub enabled: bool,
}

impl Default for LscAttrib {
    fn default() -> Self {
        LscAttrib{enabled: true}
    }
}

#[derive(Clone, Debug)]
pub struct LensShadingInput {
    pub awb: Option<AwbResult>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LscResult {
    pub enabled: bool,
    pub cct: f32,
    pub table: Vec<u16>,
}

pub struct LensShading;

impl AlgoTraits for LensShading {
    const FAMILY: AlgoFamily = AlgoFamily::LensShading;
    type Attrib = LscAttrib;
    type Input = LensShadingInput;
    type Result = LscResult;

    fn build_input(_algo_type: AlgoType, shared: &SharedAnalysisState) -> LensShadingInput {
        LensShadingInput{awb: shared.comb.awb().cloned()}
    }
}

impl From<LscResult> for AlgoResult {
    fn from(r: LscResult) -> Self { AlgoResult::Lsc(r) }
}

// ORB features.

#[derive(Clone, Debug, PartialEq)]
pub struct OrbAttrib {
    pub max_keypoints: usize,
}

impl Default for OrbAttrib {
    fn default() -> Self {
        OrbAttrib{max_keypoints: 512}
    }
}

#[derive(Clone, Debug)]
pub struct OrbInput {
    pub orb: Option<OrbStats>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrbResult {
    pub keypoints: Vec<(u16, u16)>,
}

pub struct Orb;

impl AlgoTraits for Orb {
    const FAMILY: AlgoFamily = AlgoFamily::Orb;
    type Attrib = OrbAttrib;
    type Input = OrbInput;
    type Result = OrbResult;

    fn build_input(_algo_type: AlgoType, shared: &SharedAnalysisState) -> OrbInput {
        OrbInput{orb: shared.stats.orb.clone()}
    }

    fn bypass(phase: PhaseKind, _common: &CommonInput, input: &OrbInput) -> bool {
        phase == PhaseKind::PreProcess && input.orb.is_none()
    }
}

impl From<OrbResult> for AlgoResult {
    fn from(r: OrbResult) -> Self { AlgoResult::Orb(r) }
}

// Table-driven tuning modules.

#[derive(Clone, Debug, PartialEq)]
pub struct TuningAttrib {
    pub enabled: bool,
    /// Multiplies the calibrated strength.
    pub strength_scale: f32,
}

impl Default for TuningAttrib {
    fn default() -> Self {
        TuningAttrib{enabled: true, strength_scale: 1.0}
    }
}

#[derive(Clone, Debug)]
pub struct TuningInput {
    pub table: IsoTable,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TuningResult {
    pub algo_type: AlgoType,
    pub strength: f32,
    pub enabled: bool,
}

pub struct Tuning;

impl AlgoTraits for Tuning {
    const FAMILY: AlgoFamily = AlgoFamily::Tuning;
    type Attrib = TuningAttrib;
    type Input = TuningInput;
    type Result = TuningResult;

    fn build_input(algo_type: AlgoType, shared: &SharedAnalysisState) -> TuningInput {
        TuningInput{table: shared.calib.tuning_for(algo_type)}
    }
}

impl From<TuningResult> for AlgoResult {
    fn from(r: TuningResult) -> Self { AlgoResult::Tuning(r) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::calib::CalibDb;
    use crate::sensor::{SensorDescriptor, WorkingMode};
    use crate::stats::{AnalyzerStats, IspStatsBuffer, RawAwbStats};

    fn shared(mode: WorkingMode) -> SharedAnalysisState {
        SharedAnalysisState::new(SensorDescriptor::new("imx415", 1920, 1080), mode,
                                 Arc::new(CalibDb::default()))
    }

    #[test]
    fn exposure_default_only_while_initializing() {
        let mut s = shared(WorkingMode::Normal);
        let common = CommonInput::from_shared(AlgoType::Ae, &s);
        let input = Exposure::build_input(AlgoType::Ae, &s);
        assert!(Exposure::bypass(PhaseKind::PreProcess, &common, &input));
        assert!(Exposure::reference_default(&common, &input).is_some());

        s.init = false;
        let common = CommonInput::from_shared(AlgoType::Ae, &s);
        assert!(Exposure::reference_default(&common, &input).is_none());
    }

    #[test]
    fn white_balance_has_two_bypass_points() {
        let mut s = shared(WorkingMode::Normal);
        let mut raw = IspStatsBuffer::empty(1);
        raw.awb = Some(RawAwbStats{zone_sums: vec![[10, 20, 10]], zone_counts: vec![1]});
        s.begin_frame(AnalyzerStats::convert(&raw, WorkingMode::Normal));
        let common = CommonInput::from_shared(AlgoType::Awb, &s);
        let input = WhiteBalance::build_input(AlgoType::Awb, &s);
        assert!(!WhiteBalance::bypass(PhaseKind::PreProcess, &common, &input));
        // No exposure result yet.
        assert!(WhiteBalance::bypass(PhaseKind::Processing, &common, &input));
    }

    #[test]
    fn hdr_bypass_depends_on_mode() {
        let s = shared(WorkingMode::Normal);
        let common = CommonInput::from_shared(AlgoType::Amerge, &s);
        let input = Hdr::build_input(AlgoType::Amerge, &s);
        assert!(!Hdr::bypass(PhaseKind::PreProcess, &common, &input));

        let s = shared(WorkingMode::Hdr2);
        let common = CommonInput::from_shared(AlgoType::Amerge, &s);
        assert!(Hdr::bypass(PhaseKind::PreProcess, &common, &input));
    }

    #[test]
    fn tuning_input_comes_from_calibration() {
        let s = shared(WorkingMode::Normal);
        let input = Tuning::build_input(AlgoType::Anr, &s);
        assert_eq!(input.table, s.calib.tuning_for(AlgoType::Anr));
    }
}
