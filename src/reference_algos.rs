// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Built-in implementations registered under id 0 for every algorithm type.
//! They keep the pipeline producing sane parameters out of the box; they make
//! no claim to photographic quality.

use std::sync::Arc;
use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};
use log::debug;

use crate::algo_registry::AlgoRegistry;
use crate::algo_type::{AlgoFamily, AlgoType, PROCESSING_ORDER, REFERENCE_ALGO_ID};
use crate::algorithm::{AlgoConfig, AlgoDescriptor, Algorithm, Phase, PhaseInput,
                       PrepareParams};
use crate::calib::CalibDb;
use crate::families::*;
use crate::sensor::{ExposureParams, Gain, WorkingMode};

// Exposure.

/// Proportional exposure control towards the target luma. Integration time
/// is raised first, then analog gain.
pub struct RefAe {
    attrib: AeAttrib,
    target_luma: f32,
    working_mode: WorkingMode,
}

impl RefAe {
    pub fn new(config: &AlgoConfig) -> Self {
        RefAe {
            attrib: AeAttrib::default(),
            target_luma: config.calib.ae_target_luma,
            working_mode: WorkingMode::Normal,
        }
    }

    // Splits a total exposure (seconds x gain) into time and gain.
    fn distribute(total: f64, max_time: Duration, max_gain: Gain) -> ExposureParams {
        let max_secs = max_time.as_secs_f64();
        let (integration_time, gain) = if total <= max_secs {
            (Duration::from_secs_f64(total.max(1e-5)), 1.0)
        } else {
            (max_time, (total / max_secs).min(max_gain.value() as f64))
        };
        ExposureParams {
            integration_time,
            analog_gain: Gain::clamped(gain as f32),
            digital_gain: 1.0,
        }
    }
}

impl Algorithm<Exposure> for RefAe {
    fn prepare(&mut self, params: &PrepareParams) -> Result<(), CanonicalError> {
        self.target_luma = params.calib.ae_target_luma;
        self.working_mode = params.working_mode;
        Ok(())
    }

    fn processing(&mut self, input: &PhaseInput<Exposure>)
                  -> Result<Phase<AeResult>, CanonicalError> {
        let count = self.working_mode.exposure_count();
        if let Some(manual) = self.attrib.manual {
            return Ok(Phase::Done(AeResult {
                exposure: manual,
                hdr_exposures: vec![manual; count],
                mean_luma: input.extra.aec.as_ref().map_or(0.0, |a| a.mean_luma),
                converged: true,
            }));
        }
        let Some(aec) = &input.extra.aec else {
            return Ok(Phase::Bypass);
        };
        let target = self.attrib.target_luma.unwrap_or(self.target_luma);
        let mean = aec.mean_luma.max(1.0);
        // Damped step so one odd frame cannot swing the exposure.
        let ratio = (target / mean).clamp(0.5, 2.0) as f64;
        let total = input.common.exposure.total_exposure() * ratio;
        let exposure = Self::distribute(total, input.extra.max_integration_time,
                                        input.extra.max_analog_gain);
        // Shorter exposures are 1/4 of the previous one each.
        let hdr_exposures = (0..count).map(|i| {
            let mut e = exposure;
            e.integration_time = exposure.integration_time / 4u32.pow(i as u32);
            e
        }).collect();
        Ok(Phase::Done(AeResult {
            exposure,
            hdr_exposures,
            mean_luma: aec.mean_luma,
            converged: (aec.mean_luma - target).abs() <= 0.05 * target,
        }))
    }

    fn update_attrib(&mut self, attrib: &AeAttrib) -> Result<(), CanonicalError> {
        if let Some(t) = attrib.target_luma {
            if !(1.0..=254.0).contains(&t) {
                return Err(invalid_argument_error(
                    format!("target luma {} outside 1..254", t).as_str()));
            }
        }
        self.attrib = attrib.clone();
        Ok(())
    }
}

// White balance.

/// Gray world white balance with the calibration's gains as fallback.
pub struct RefAwb {
    attrib: AwbAttrib,
    prev_gains: Option<WbGains>,
}

impl RefAwb {
    pub fn new(_config: &AlgoConfig) -> Self {
        RefAwb{attrib: AwbAttrib::default(), prev_gains: None}
    }
}

impl Algorithm<WhiteBalance> for RefAwb {
    fn prepare(&mut self, _params: &PrepareParams) -> Result<(), CanonicalError> {
        self.prev_gains = None;
        Ok(())
    }

    fn processing(&mut self, input: &PhaseInput<WhiteBalance>)
                  -> Result<Phase<AwbResult>, CanonicalError> {
        let gains = match self.attrib.mode {
            AwbMode::Manual(gains) => gains,
            AwbMode::Auto => {
                let (r, b) = input.extra.awb.as_ref()
                    .and_then(|awb| awb.gray_world_gains())
                    .unwrap_or(input.common.calib.default_wb_gains);
                WbGains::new(r.clamp(0.5, 4.0), b.clamp(0.5, 4.0))
            },
        };
        let converged = self.prev_gains.is_some_and(|p| {
            (p.r - gains.r).abs() < 0.01 && (p.b - gains.b).abs() < 0.01
        });
        self.prev_gains = Some(gains);
        // Bluer scenes need more red gain relative to blue.
        let cct = (5000.0 * gains.b / gains.r).clamp(2000.0, 10000.0);
        Ok(Phase::Done(AwbResult{gains, cct, converged}))
    }

    fn update_attrib(&mut self, attrib: &AwbAttrib) -> Result<(), CanonicalError> {
        if let AwbMode::Manual(g) = attrib.mode {
            if g.r <= 0.0 || g.b <= 0.0 || g.gr <= 0.0 || g.gb <= 0.0 {
                return Err(invalid_argument_error("white balance gains must be positive"));
            }
        }
        self.attrib = attrib.clone();
        Ok(())
    }
}

// Focus.

/// Hill climbing contrast autofocus.
pub struct RefAf {
    attrib: AfAttrib,
    best: Option<(i32, f64)>,
    step: i32,
}

const AF_INITIAL_STEP: i32 = 32;

impl RefAf {
    pub fn new(_config: &AlgoConfig) -> Self {
        RefAf{attrib: AfAttrib::default(), best: None, step: AF_INITIAL_STEP}
    }
}

impl Algorithm<Focus> for RefAf {
    fn prepare(&mut self, _params: &PrepareParams) -> Result<(), CanonicalError> {
        self.best = None;
        self.step = AF_INITIAL_STEP;
        Ok(())
    }

    fn processing(&mut self, input: &PhaseInput<Focus>)
                  -> Result<Phase<AfResult>, CanonicalError> {
        let Some(af) = &input.extra.af else {
            return Ok(Phase::Bypass);
        };
        if let AfMode::Manual(position) = self.attrib.mode {
            return Ok(Phase::Done(AfResult{
                lens_position: position, sharpness: af.sharpness, locked: true}));
        }
        match self.best {
            Some((_, best)) if af.sharpness <= best => {
                // Overshot: turn around with a smaller step.
                self.step = -self.step / 2;
            },
            _ => self.best = Some((af.lens_position, af.sharpness)),
        }
        let locked = self.step == 0;
        let lens_position = match (locked, self.best) {
            (true, Some((pos, _))) => pos,
            _ => af.lens_position.saturating_add(self.step),
        };
        Ok(Phase::Done(AfResult{lens_position, sharpness: af.sharpness, locked}))
    }

    fn update_attrib(&mut self, attrib: &AfAttrib) -> Result<(), CanonicalError> {
        if attrib.mode != self.attrib.mode {
            self.best = None;
            self.step = AF_INITIAL_STEP;
        }
        self.attrib = attrib.clone();
        Ok(())
    }
}

// HDR.

const TONE_CURVE_POINTS: usize = 33;

/// Merge ratio from the exposure result; a power-law global tone curve.
pub struct RefHdr {
    attrib: HdrAttrib,
}

impl RefHdr {
    pub fn new(_config: &AlgoConfig) -> Self {
        RefHdr{attrib: HdrAttrib::default()}
    }

    fn tone_curve(strength: f32) -> Vec<u16> {
        let gamma = 1.0 / (1.0 + strength.clamp(0.0, 2.0));
        (0..TONE_CURVE_POINTS).map(|i| {
            let x = i as f32 / (TONE_CURVE_POINTS - 1) as f32;
            (x.powf(gamma) * 4095.0).round() as u16
        }).collect()
    }
}

impl Algorithm<Hdr> for RefHdr {
    fn prepare(&mut self, _params: &PrepareParams) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn processing(&mut self, input: &PhaseInput<Hdr>)
                  -> Result<Phase<HdrResult>, CanonicalError> {
        let merge_ratio = match input.extra.ae.as_ref().map(|ae| &ae.hdr_exposures) {
            Some(exposures) if exposures.len() >= 2 => {
                let long = exposures[0].total_exposure();
                let short = exposures[exposures.len() - 1].total_exposure();
                if short > 0.0 { (long / short) as f32 } else { 1.0 }
            },
            _ => 1.0,
        };
        let strength = if input.common.working_mode.is_hdr() { self.attrib.strength } else { 0.0 };
        Ok(Phase::Done(HdrResult{
            algo_type: input.common.algo_type,
            merge_ratio,
            tone_curve: Self::tone_curve(strength),
        }))
    }

    fn update_attrib(&mut self, attrib: &HdrAttrib) -> Result<(), CanonicalError> {
        self.attrib = attrib.clone();
        Ok(())
    }
}

// Color correction.

const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Calibrated matrix with saturation applied around luma.
pub struct RefCcm {
    attrib: CcmAttrib,
}

impl RefCcm {
    pub fn new(_config: &AlgoConfig) -> Self {
        RefCcm{attrib: CcmAttrib::default()}
    }

    fn saturate(ccm: &[f32; 9], saturation: f32) -> [f32; 9] {
        let mut out = [0.0; 9];
        for row in 0..3 {
            for col in 0..3 {
                let i = row * 3 + col;
                out[i] = LUMA_WEIGHTS[col] + saturation * (ccm[i] - LUMA_WEIGHTS[col]);
            }
        }
        out
    }
}

impl Algorithm<ColorCorrection> for RefCcm {
    fn prepare(&mut self, _params: &PrepareParams) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn processing(&mut self, input: &PhaseInput<ColorCorrection>)
                  -> Result<Phase<CcmResult>, CanonicalError> {
        let Some(awb) = &input.extra.awb else {
            return Ok(Phase::Bypass);
        };
        let saturation = if input.common.gray_mode { 0.0 } else { self.attrib.saturation };
        Ok(Phase::Done(CcmResult{
            algo_type: input.common.algo_type,
            matrix: Self::saturate(&input.common.calib.ccm, saturation),
            wb_gains: awb.gains,
            saturation,
        }))
    }

    fn update_attrib(&mut self, attrib: &CcmAttrib) -> Result<(), CanonicalError> {
        if !(0.0..=2.0).contains(&attrib.saturation) {
            return Err(invalid_argument_error(
                format!("saturation {} outside 0..2", attrib.saturation).as_str()));
        }
        self.attrib = attrib.clone();
        Ok(())
    }
}

// Lens shading.

pub struct RefLsc {
    attrib: LscAttrib,
    table: Vec<u16>,
}

impl RefLsc {
    pub fn new(config: &AlgoConfig) -> Self {
        RefLsc{attrib: LscAttrib::default(), table: config.calib.lsc_table.clone()}
    }
}

impl Algorithm<LensShading> for RefLsc {
    fn prepare(&mut self, params: &PrepareParams) -> Result<(), CanonicalError> {
        self.table.clone_from(&params.calib.lsc_table);
        Ok(())
    }

    fn processing(&mut self, input: &PhaseInput<LensShading>)
                  -> Result<Phase<LscResult>, CanonicalError> {
        Ok(Phase::Done(LscResult{
            enabled: self.attrib.enabled,
            cct: input.extra.awb.as_ref().map_or(5000.0, |awb| awb.cct),
            table: self.table.clone(),
        }))
    }

    fn update_attrib(&mut self, attrib: &LscAttrib) -> Result<(), CanonicalError> {
        self.attrib = attrib.clone();
        Ok(())
    }
}

// ORB.

pub struct RefOrb {
    attrib: OrbAttrib,
}

impl RefOrb {
    pub fn new(_config: &AlgoConfig) -> Self {
        RefOrb{attrib: OrbAttrib::default()}
    }
}

impl Algorithm<Orb> for RefOrb {
    fn prepare(&mut self, _params: &PrepareParams) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn processing(&mut self, input: &PhaseInput<Orb>)
                  -> Result<Phase<OrbResult>, CanonicalError> {
        let Some(orb) = &input.extra.orb else {
            return Ok(Phase::Bypass);
        };
        let keypoints = orb.keypoints.iter().take(self.attrib.max_keypoints).copied().collect();
        Ok(Phase::Done(OrbResult{keypoints}))
    }

    fn update_attrib(&mut self, attrib: &OrbAttrib) -> Result<(), CanonicalError> {
        self.attrib = attrib.clone();
        Ok(())
    }
}

// Table-driven tuning.

/// Strength interpolated from the calibration table at the current ISO.
pub struct RefTuning {
    attrib: TuningAttrib,
}

impl RefTuning {
    pub fn new(_config: &AlgoConfig) -> Self {
        RefTuning{attrib: TuningAttrib::default()}
    }
}

impl Algorithm<Tuning> for RefTuning {
    fn prepare(&mut self, _params: &PrepareParams) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn processing(&mut self, input: &PhaseInput<Tuning>)
                  -> Result<Phase<TuningResult>, CanonicalError> {
        let strength = input.extra.table.interpolate(input.common.iso) *
            self.attrib.strength_scale;
        Ok(Phase::Done(TuningResult{
            algo_type: input.common.algo_type,
            strength,
            enabled: self.attrib.enabled,
        }))
    }

    fn update_attrib(&mut self, attrib: &TuningAttrib) -> Result<(), CanonicalError> {
        if attrib.strength_scale < 0.0 {
            return Err(invalid_argument_error("strength scale must not be negative"));
        }
        self.attrib = attrib.clone();
        Ok(())
    }
}

fn descriptor<T, A, F>(algo_type: AlgoType, make: F) -> AlgoDescriptor<T>
where T: crate::algorithm::AlgoTraits,
      A: Algorithm<T> + 'static,
      F: Fn(&AlgoConfig) -> A + Send + Sync + 'static
{
    let name = format!("reference-{}", algo_type.name());
    AlgoDescriptor::new(algo_type, REFERENCE_ALGO_ID, &name, move |config| {
        Ok(Box::new(make(config)) as Box<dyn Algorithm<T>>)
    })
}

/// Registers the reference implementation of every algorithm type.
pub fn register_reference_algos(registry: &AlgoRegistry, calib: &Arc<CalibDb>)
                                -> Result<(), CanonicalError> {
    for algo_type in PROCESSING_ORDER {
        let calib = calib.clone();
        match algo_type.family() {
            AlgoFamily::Exposure =>
                drop(registry.add_algo(descriptor::<Exposure, _, _>(algo_type, RefAe::new), calib)?),
            AlgoFamily::WhiteBalance =>
                drop(registry.add_algo(descriptor::<WhiteBalance, _, _>(algo_type, RefAwb::new), calib)?),
            AlgoFamily::Focus =>
                drop(registry.add_algo(descriptor::<Focus, _, _>(algo_type, RefAf::new), calib)?),
            AlgoFamily::Hdr =>
                drop(registry.add_algo(descriptor::<Hdr, _, _>(algo_type, RefHdr::new), calib)?),
            AlgoFamily::ColorCorrection =>
                drop(registry.add_algo(descriptor::<ColorCorrection, _, _>(algo_type, RefCcm::new), calib)?),
            AlgoFamily::LensShading =>
                drop(registry.add_algo(descriptor::<LensShading, _, _>(algo_type, RefLsc::new), calib)?),
            AlgoFamily::Orb =>
                drop(registry.add_algo(descriptor::<Orb, _, _>(algo_type, RefOrb::new), calib)?),
            AlgoFamily::Tuning =>
                drop(registry.add_algo(descriptor::<Tuning, _, _>(algo_type, RefTuning::new), calib)?),
        }
    }
    debug!("Registered {} reference algorithms", PROCESSING_ORDER.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use crate::sensor::SensorDescriptor;
    use crate::shared_state::SharedAnalysisState;
    use crate::stats::{AecStats, AfStats, HISTOGRAM_BINS};

    fn config() -> AlgoConfig {
        AlgoConfig{algo_type: AlgoType::Ae, id: 0, calib: Arc::new(CalibDb::default())}
    }

    fn shared() -> SharedAnalysisState {
        SharedAnalysisState::new(SensorDescriptor::new("imx415", 1920, 1080),
                                 WorkingMode::Normal, Arc::new(CalibDb::default()))
    }

    #[test]
    fn every_type_gets_a_reference() {
        let registry = AlgoRegistry::new(Arc::new(AtomicBool::new(false)));
        register_reference_algos(&registry, &Arc::new(CalibDb::default())).unwrap();
        assert_eq!(registry.current_handles().len(), AlgoType::COUNT);
        assert!(registry.describe().iter().all(|i| i.id == REFERENCE_ALGO_ID));
    }

    #[test]
    fn dark_scene_raises_exposure() {
        let s = shared();
        let mut input = PhaseInput::<Exposure>::build(AlgoType::Ae, &s);
        input.extra.aec = Some(AecStats{
            histogram: vec![0; HISTOGRAM_BINS], mean_luma: 10.0, zone_luma: vec![]});
        let mut ae = RefAe::new(&config());
        let Phase::Done(r) = ae.processing(&input).unwrap() else {
            panic!("unexpected bypass");
        };
        assert!(r.exposure.total_exposure() > s.cur_exposure.total_exposure());
        assert!(!r.converged);
    }

    #[test]
    fn manual_exposure_wins() {
        let s = shared();
        let input = PhaseInput::<Exposure>::build(AlgoType::Ae, &s);
        let mut ae = RefAe::new(&config());
        let manual = ExposureParams{
            integration_time: Duration::from_millis(5),
            analog_gain: Gain::new(2.0),
            digital_gain: 1.0,
        };
        ae.update_attrib(&AeAttrib{target_luma: None, manual: Some(manual)}).unwrap();
        let Phase::Done(r) = ae.processing(&input).unwrap() else {
            panic!("unexpected bypass");
        };
        assert_eq!(r.exposure, manual);
        assert!(ae.update_attrib(&AeAttrib{target_luma: Some(300.0), manual: None}).is_err());
    }

    #[test]
    fn long_exposures_spill_into_gain() {
        let e = RefAe::distribute(0.066, Duration::from_millis(33), Gain::new(64.0));
        assert_eq!(e.integration_time, Duration::from_millis(33));
        assert!((e.analog_gain.value() - 2.0).abs() < 1e-4);
    }

    #[test]
    fn saturation_zero_is_luma_only() {
        let m = RefCcm::saturate(&CalibDb::default().ccm, 0.0);
        assert_eq!(&m[0..3], &LUMA_WEIGHTS);
        assert_eq!(&m[6..9], &LUMA_WEIGHTS);
        let unchanged = RefCcm::saturate(&CalibDb::default().ccm, 1.0);
        for (a, b) in unchanged.iter().zip(CalibDb::default().ccm.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn af_climb_saturates_at_lens_range_end() {
        let s = shared();
        let mut input = PhaseInput::<Focus>::build(AlgoType::Af, &s);
        input.extra.af = Some(AfStats{
            sharpness: 10.0, zone_sharpness: vec![], lens_position: i32::MAX - 1});
        let mut af = RefAf::new(&config());
        let Phase::Done(r) = af.processing(&input).unwrap() else {
            panic!("unexpected bypass");
        };
        assert_eq!(r.lens_position, i32::MAX);
        assert!(!r.locked);
    }

    #[test]
    fn tone_curve_is_monotonic() {
        let curve = RefHdr::tone_curve(1.0);
        assert_eq!(curve.len(), TONE_CURVE_POINTS);
        assert_eq!(curve[0], 0);
        assert_eq!(curve[TONE_CURVE_POINTS - 1], 4095);
        assert!(curve.windows(2).all(|w| w[0] <= w[1]));
    }
}
