// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The combined ISP parameter block produced once per analyzed frame, and
//! the per-type generators that compose it from the result slots.

use std::collections::BTreeMap;

use crate::algo_type::{AlgoFamily, AlgoType, PROCESSING_ORDER};
use crate::families::{HdrResult, TuningResult, WbGains};
use crate::pool::Shared;
use crate::sensor::{ExposureParams, WorkingMode};
use crate::shared_state::{AlgoResult, SharedAnalysisState};

#[derive(Clone, Debug, PartialEq)]
pub struct LensShadingParams {
    pub enabled: bool,
    pub table: Vec<u16>,
}

/// Everything the apply stage programs into the ISP for one frame. Blocks
/// whose type has never produced a result carry calibration defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct FullParams {
    pub frame_id: u32,
    pub working_mode: WorkingMode,

    pub exposure: ExposureParams,
    /// One per sensor exposure, long first.
    pub hdr_exposures: Vec<ExposureParams>,

    pub wb_gains: WbGains,
    pub cct: f32,

    /// None until focus has produced a result.
    pub lens_position: Option<i32>,

    pub merge: Option<HdrResult>,
    pub tone_map: Option<HdrResult>,

    pub ccm: [f32; 9],
    pub lut3d_enabled: bool,

    pub lsc: LensShadingParams,

    /// Gray (monochrome) output, from the gray mode setting or the fill light.
    pub gray_mode: bool,

    /// Strength per table-driven module that has produced a result.
    pub tuning: BTreeMap<AlgoType, TuningResult>,

    pub orb_keypoints: Vec<(u16, u16)>,
}

impl Default for FullParams {
    fn default() -> Self {
        let exposure = ExposureParams::default();
        FullParams {
            frame_id: 0,
            working_mode: WorkingMode::Normal,
            exposure,
            hdr_exposures: vec![exposure],
            wb_gains: WbGains::unity(),
            cct: 5000.0,
            lens_position: None,
            merge: None,
            tone_map: None,
            ccm: [1.0, 0.0, 0.0,
                  0.0, 1.0, 0.0,
                  0.0, 0.0, 1.0],
            lut3d_enabled: false,
            lsc: LensShadingParams{enabled: false, table: Vec::new()},
            gray_mode: false,
            tuning: BTreeMap::new(),
            orb_keypoints: Vec::new(),
        }
    }
}

/// Reference-counted, pooled FullParams as handed to the apply stage.
pub type FullParamsRef = Shared<FullParams>;

/// Fills `params` for the frame in `shared`. Every field is rewritten, so a
/// recycled buffer carries nothing over from its previous frame.
pub fn generate(params: &mut FullParams, shared: &SharedAnalysisState) {
    reset(params, shared);
    for algo_type in PROCESSING_ORDER {
        let result = shared.comb.latest(algo_type);
        match algo_type.family() {
            AlgoFamily::Exposure => gen_exposure(params, result),
            AlgoFamily::WhiteBalance => gen_white_balance(params, result),
            AlgoFamily::Focus => gen_focus(params, result),
            AlgoFamily::Hdr => gen_hdr(params, algo_type, result),
            AlgoFamily::ColorCorrection => gen_color(params, algo_type, result),
            AlgoFamily::LensShading => gen_lens_shading(params, result),
            AlgoFamily::Orb => gen_orb(params, result),
            AlgoFamily::Tuning => gen_tuning(params, algo_type, result),
        }
    }
    if params.gray_mode {
        // Luma only: equal gains and a matrix that maps every channel to Y.
        params.wb_gains = WbGains::unity();
        params.ccm = [0.299, 0.587, 0.114,
                      0.299, 0.587, 0.114,
                      0.299, 0.587, 0.114];
    }
}

fn reset(params: &mut FullParams, shared: &SharedAnalysisState) {
    let calib = &shared.calib;
    params.frame_id = shared.frame_id;
    params.working_mode = shared.working_mode;
    params.exposure = shared.cur_exposure;
    params.hdr_exposures.clear();
    params.hdr_exposures.resize(shared.working_mode.exposure_count(), shared.cur_exposure);
    params.wb_gains = WbGains::new(calib.default_wb_gains.0, calib.default_wb_gains.1);
    params.cct = 5000.0;
    params.lens_position = None;
    params.merge = None;
    params.tone_map = None;
    params.ccm = calib.ccm;
    params.lut3d_enabled = false;
    params.lsc.enabled = false;
    params.lsc.table.clone_from(&calib.lsc_table);
    params.gray_mode = shared.gray_mode_active();
    params.tuning.clear();
    params.orb_keypoints.clear();
}

fn gen_exposure(params: &mut FullParams, result: Option<&AlgoResult>) {
    if let Some(ae) = result.and_then(AlgoResult::as_ae) {
        params.exposure = ae.exposure;
        if !ae.hdr_exposures.is_empty() {
            params.hdr_exposures.clone_from(&ae.hdr_exposures);
        }
    }
}

fn gen_white_balance(params: &mut FullParams, result: Option<&AlgoResult>) {
    if let Some(awb) = result.and_then(AlgoResult::as_awb) {
        params.wb_gains = awb.gains;
        params.cct = awb.cct;
    }
}

fn gen_focus(params: &mut FullParams, result: Option<&AlgoResult>) {
    if let Some(af) = result.and_then(AlgoResult::as_af) {
        params.lens_position = Some(af.lens_position);
    }
}

fn gen_hdr(params: &mut FullParams, algo_type: AlgoType, result: Option<&AlgoResult>) {
    let hdr = result.and_then(AlgoResult::as_hdr).cloned();
    match algo_type {
        AlgoType::Amerge => params.merge = hdr,
        _ => params.tone_map = hdr,
    }
}

fn gen_color(params: &mut FullParams, algo_type: AlgoType, result: Option<&AlgoResult>) {
    let Some(ccm) = result.and_then(AlgoResult::as_ccm) else {
        return;
    };
    match algo_type {
        AlgoType::Accm => params.ccm = ccm.matrix,
        _ => params.lut3d_enabled = true,
    }
}

fn gen_lens_shading(params: &mut FullParams, result: Option<&AlgoResult>) {
    if let Some(lsc) = result.and_then(AlgoResult::as_lsc) {
        params.lsc.enabled = lsc.enabled;
        if !lsc.table.is_empty() {
            params.lsc.table.clone_from(&lsc.table);
        }
    }
}

fn gen_orb(params: &mut FullParams, result: Option<&AlgoResult>) {
    if let Some(orb) = result.and_then(AlgoResult::as_orb) {
        params.orb_keypoints.clone_from(&orb.keypoints);
    }
}

fn gen_tuning(params: &mut FullParams, algo_type: AlgoType, result: Option<&AlgoResult>) {
    if let Some(t) = result.and_then(AlgoResult::as_tuning) {
        params.tuning.insert(algo_type, t.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::calib::CalibDb;
    use crate::families::{AwbResult, CcmResult};
    use crate::sensor::SensorDescriptor;
    use crate::shared_state::GrayMode;

    fn shared() -> SharedAnalysisState {
        SharedAnalysisState::new(SensorDescriptor::new("imx415", 1920, 1080),
                                 WorkingMode::Hdr2, Arc::new(CalibDb::default()))
    }

    #[test]
    fn calibration_defaults_without_results() {
        let s = shared();
        let mut p = FullParams::default();
        generate(&mut p, &s);
        assert_eq!(p.wb_gains, WbGains::new(1.8, 1.6));
        assert_eq!(p.hdr_exposures.len(), 2);
        assert_eq!(p.ccm, s.calib.ccm);
        assert!(p.lens_position.is_none());
        assert!(p.tuning.is_empty());
    }

    #[test]
    fn failed_type_uses_last_committed_result() {
        let mut s = shared();
        let gains = WbGains::new(2.0, 1.5);
        s.comb.commit(AlgoType::Awb, AlgoResult::Awb(
            AwbResult{gains, cct: 4000.0, converged: true}));
        s.comb.fail(AlgoType::Awb);
        let mut p = FullParams::default();
        generate(&mut p, &s);
        assert_eq!(p.wb_gains, gains);
        assert_eq!(p.cct, 4000.0);
    }

    #[test]
    fn recycled_buffer_is_fully_rewritten() {
        let mut s = shared();
        s.comb.commit(AlgoType::Accm, AlgoResult::Ccm(CcmResult{
            algo_type: AlgoType::Accm, matrix: [2.0; 9],
            wb_gains: WbGains::unity(), saturation: 1.0}));
        s.comb.commit(AlgoType::Anr, AlgoResult::Tuning(TuningResult{
            algo_type: AlgoType::Anr, strength: 0.3, enabled: true}));
        let mut p = FullParams::default();
        generate(&mut p, &s);
        assert_eq!(p.ccm, [2.0; 9]);
        assert_eq!(p.tuning.len(), 1);

        s.comb.clear();
        generate(&mut p, &s);
        assert_eq!(p.ccm, s.calib.ccm);
        assert!(p.tuning.is_empty());
    }

    #[test]
    fn gray_mode_neutralizes_color() {
        let mut s = shared();
        s.gray_mode = GrayMode::On;
        let mut p = FullParams::default();
        generate(&mut p, &s);
        assert!(p.gray_mode);
        assert_eq!(p.wb_gains, WbGains::unity());
        assert_eq!(p.ccm[0], p.ccm[3]);
    }
}
