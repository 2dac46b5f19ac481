// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;

use crate::algo_type::AlgoType;
use crate::calib::CalibDb;
use crate::families::{AeResult, AfResult, AwbResult, CcmResult, HdrResult,
                      LscResult, OrbResult, TuningResult};
use crate::sensor::{ExposureParams, SensorDescriptor, WorkingMode};
use crate::stats::AnalyzerStats;

/// Result of one algorithm type for one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum AlgoResult {
    Ae(AeResult),
    Awb(AwbResult),
    Af(AfResult),
    Hdr(HdrResult),
    Ccm(CcmResult),
    Lsc(LscResult),
    Orb(OrbResult),
    Tuning(TuningResult),
}

impl AlgoResult {
    pub fn as_ae(&self) -> Option<&AeResult> {
        match self { AlgoResult::Ae(r) => Some(r), _ => None }
    }
    pub fn as_awb(&self) -> Option<&AwbResult> {
        match self { AlgoResult::Awb(r) => Some(r), _ => None }
    }
    pub fn as_af(&self) -> Option<&AfResult> {
        match self { AlgoResult::Af(r) => Some(r), _ => None }
    }
    pub fn as_hdr(&self) -> Option<&HdrResult> {
        match self { AlgoResult::Hdr(r) => Some(r), _ => None }
    }
    pub fn as_ccm(&self) -> Option<&CcmResult> {
        match self { AlgoResult::Ccm(r) => Some(r), _ => None }
    }
    pub fn as_lsc(&self) -> Option<&LscResult> {
        match self { AlgoResult::Lsc(r) => Some(r), _ => None }
    }
    pub fn as_orb(&self) -> Option<&OrbResult> {
        match self { AlgoResult::Orb(r) => Some(r), _ => None }
    }
    pub fn as_tuning(&self) -> Option<&TuningResult> {
        match self { AlgoResult::Tuning(r) => Some(r), _ => None }
    }
}

/// Per-type result slots ("Comb"). `current` is what the type produced in the
/// most recent pass that ran it: Some after success, None after a failure,
/// untouched after a bypass or while the type is disabled. `committed` is the
/// last successful result and is what falls through when `current` is empty.
#[derive(Clone, Debug)]
pub struct CombSlots {
    current: Vec<Option<AlgoResult>>,
    committed: Vec<Option<AlgoResult>>,
}

impl Default for CombSlots {
    fn default() -> Self {
        CombSlots {
            current: vec![None; AlgoType::COUNT],
            committed: vec![None; AlgoType::COUNT],
        }
    }
}

impl CombSlots {
    pub fn commit(&mut self, algo_type: AlgoType, result: AlgoResult) {
        let i = algo_type.index();
        self.committed[i] = Some(result.clone());
        self.current[i] = Some(result);
    }

    /// Clears the current slot after a failed phase. The committed value is
    /// kept for the result generators.
    pub fn fail(&mut self, algo_type: AlgoType) {
        self.current[algo_type.index()] = None;
    }

    pub fn current(&self, algo_type: AlgoType) -> Option<&AlgoResult> {
        self.current[algo_type.index()].as_ref()
    }

    pub fn committed(&self, algo_type: AlgoType) -> Option<&AlgoResult> {
        self.committed[algo_type.index()].as_ref()
    }

    /// Current result if any, else the last committed one.
    pub fn latest(&self, algo_type: AlgoType) -> Option<&AlgoResult> {
        self.current(algo_type).or_else(|| self.committed(algo_type))
    }

    pub fn clear(&mut self) {
        *self = CombSlots::default();
    }

    pub fn ae(&self) -> Option<&AeResult> {
        self.latest(AlgoType::Ae).and_then(AlgoResult::as_ae)
    }

    pub fn awb(&self) -> Option<&AwbResult> {
        self.latest(AlgoType::Awb).and_then(AlgoResult::as_awb)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum GrayMode {
    #[default]
    Off,
    On,
    /// Gray while an infrared fill light is on.
    Auto,
}

/// Per-engine analysis state. Written only by the orchestrator thread.
#[derive(Clone, Debug)]
pub struct SharedAnalysisState {
    /// True from prepare() until the first frame pass completes.
    pub init: bool,

    pub frame_id: u32,
    pub working_mode: WorkingMode,
    pub sensor: SensorDescriptor,
    pub calib: Arc<CalibDb>,

    /// Statistics of the frame being analyzed.
    pub stats: AnalyzerStats,

    pub comb: CombSlots,

    pub iso: u32,
    pub gray_mode: GrayMode,
    pub fill_light_on: bool,
    pub fill_light_infrared: bool,

    pub prev_exposure: ExposureParams,
    pub cur_exposure: ExposureParams,

    /// Exposure reported by the sensor or a tx buffer, with the first frame it
    /// applies to. Consumed by that frame's begin_frame().
    pub latched_exposure: Option<(u32, ExposureParams)>,
}

impl SharedAnalysisState {
    pub fn new(sensor: SensorDescriptor, working_mode: WorkingMode,
               calib: Arc<CalibDb>) -> Self {
        let exposure = ExposureParams::default();
        SharedAnalysisState {
            init: true,
            frame_id: 0,
            working_mode,
            sensor,
            calib,
            stats: AnalyzerStats::empty(0),
            comb: CombSlots::default(),
            iso: exposure.iso(),
            gray_mode: GrayMode::Off,
            fill_light_on: false,
            fill_light_infrared: false,
            prev_exposure: exposure,
            cur_exposure: exposure,
            latched_exposure: None,
        }
    }

    /// Resets per-stream state for a (re-)prepare. Results from a previous
    /// stream never leak into the next one; gray mode and fill light settings
    /// persist.
    pub fn reset_for_prepare(&mut self, sensor: SensorDescriptor,
                             working_mode: WorkingMode) {
        self.init = true;
        self.frame_id = 0;
        self.sensor = sensor;
        self.working_mode = working_mode;
        self.stats = AnalyzerStats::empty(0);
        self.comb.clear();
        self.latched_exposure = None;
    }

    /// Installs the statistics of a new frame. This is the only place the
    /// exposure history advances, once per frame.
    pub fn begin_frame(&mut self, stats: AnalyzerStats) {
        self.frame_id = stats.frame_id;
        let exposure = match self.latched_exposure {
            Some((from, latched)) if from <= stats.frame_id => {
                self.latched_exposure = None;
                latched
            },
            _ => stats.exposure,
        };
        self.record_exposure(exposure);
        self.stats = stats;
    }

    /// Notes an exposure the sensor applies from `frame_id` on. A later
    /// report for an earlier frame is ignored.
    pub fn latch_exposure(&mut self, frame_id: u32, exposure: ExposureParams) {
        match self.latched_exposure {
            Some((from, _)) if from > frame_id => (),
            _ => self.latched_exposure = Some((frame_id, exposure)),
        }
    }

    fn record_exposure(&mut self, exposure: ExposureParams) {
        if exposure != self.cur_exposure {
            self.prev_exposure = self.cur_exposure;
            self.cur_exposure = exposure;
        }
        self.iso = exposure.iso();
    }

    pub fn gray_mode_active(&self) -> bool {
        match self.gray_mode {
            GrayMode::Off => false,
            GrayMode::On => true,
            GrayMode::Auto => self.fill_light_on && self.fill_light_infrared,
        }
    }
}
