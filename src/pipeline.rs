// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The per-frame analysis pass and the handling of everything else that
//! reaches the orchestrator thread (hardware events, raw buffers, control
//! commands).
//!
//! A Pipeline owns the SharedAnalysisState. It is driven from one thread at a
//! time: the orchestrator worker while the engine is started, the engine's
//! caller otherwise.

use std::sync::Arc;
use std::time::Instant;

use canonical_error::{CanonicalError, resource_exhausted_error};
use log::{debug, info, trace, warn};

use crate::algo_registry::AlgoRegistry;
use crate::algo_type::AlgoType;
use crate::calib::CalibDb;
use crate::handle::FrameOutcome;
use crate::metrics::PipelineMetrics;
use crate::params::{self, FullParams, FullParamsRef};
use crate::pool::Pool;
use crate::queue::SyncSignal;
use crate::sensor::{ExposureParams, SensorDescriptor, WorkingMode};
use crate::shared_state::{GrayMode, SharedAnalysisState};
use crate::stats::{AnalyzerStats, IspStatsBuffer};
use crate::stats_sharing::StatsSharingPool;

/// Notifications from the ISP driver.
#[derive(Clone, Debug, PartialEq)]
pub enum HwEvent {
    StartOfFrame { frame_id: u32 },
    /// The sensor has latched `exposure`, starting with `frame_id`.
    ExposureEffective { frame_id: u32, exposure: ExposureParams },
    /// The driver switched sensor modes on its own.
    SensorModeChanged { mode: WorkingMode },
}

/// Raw frame buffer on its way to the ISP, with the exposure it was captured
/// with.
#[derive(Clone, Debug)]
pub struct TxBuffer {
    pub frame_id: u32,
    pub data: Arc<Vec<u8>>,
    pub exposure: ExposureParams,
}

/// Fill light and IR-cut filter configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct CpsLtCfg {
    pub fill_light_on: bool,
    /// Infrared fill light (IR-cut filter removed).
    pub infrared: bool,
}

#[derive(Clone, Debug)]
pub enum ControlCommand {
    SetWorkingMode(WorkingMode),
    SetCpsLtCfg(CpsLtCfg),
    SetGrayMode(GrayMode),
    UpdateCalib(Arc<CalibDb>),
}

/// Everything the orchestrator thread consumes, in arrival order.
pub enum PipelineMsg {
    Stats(IspStatsBuffer),
    Event(HwEvent),
    TxBuf(TxBuffer),
    Command(ControlCommand, Option<SyncSignal>),
}

impl PipelineMsg {
    /// Frame data may be shed under load; a newer frame supersedes it.
    /// Events and commands may not.
    pub fn is_droppable(&self) -> bool {
        matches!(self, PipelineMsg::Stats(_) | PipelineMsg::TxBuf(_))
    }
}

/// Per-type tally of one frame pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassSummary {
    pub frame_id: u32,
    pub committed: Vec<AlgoType>,
    pub bypassed: Vec<AlgoType>,
    pub failed: Vec<AlgoType>,
}

pub struct Pipeline {
    registry: Arc<AlgoRegistry>,
    shared: SharedAnalysisState,
    stats_pool: Arc<StatsSharingPool>,
    params_pool: Pool<FullParams>,
    metrics: Arc<PipelineMetrics>,
    last_pass: PassSummary,
}

impl Pipeline {
    /// Creates the pipeline and prepares every registered handle for
    /// `sensor` in `working_mode`.
    pub fn new(registry: Arc<AlgoRegistry>, sensor: SensorDescriptor,
               working_mode: WorkingMode, calib: Arc<CalibDb>,
               stats_pool: Arc<StatsSharingPool>, params_pool: Pool<FullParams>,
               metrics: Arc<PipelineMetrics>) -> Result<Self, CanonicalError> {
        let mut pipeline = Pipeline {
            registry,
            shared: SharedAnalysisState::new(sensor.clone(), working_mode, calib),
            stats_pool,
            params_pool,
            metrics,
            last_pass: PassSummary::default(),
        };
        pipeline.prepare(sensor, working_mode)?;
        Ok(pipeline)
    }

    pub fn shared(&self) -> &SharedAnalysisState {
        &self.shared
    }

    pub fn last_pass(&self) -> &PassSummary {
        &self.last_pass
    }

    /// (Re-)prepares all registered handles, enabled or not, and resets the
    /// per-stream analysis state.
    pub fn prepare(&mut self, sensor: SensorDescriptor, working_mode: WorkingMode)
                   -> Result<(), CanonicalError> {
        sensor.validate()?;
        info!("Preparing {} {}x{} in {} mode", sensor.model,
              sensor.width(), sensor.height(), working_mode);
        self.shared.reset_for_prepare(sensor, working_mode);
        for handle in self.registry.all_handles() {
            if let Err(e) = handle.prepare(&self.shared.sensor, working_mode,
                                           &self.shared.calib) {
                warn!("Prepare of {} id {} failed: {}",
                      handle.algo_type(), handle.id(), e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Runs one frame pass over the current handles, publishes the frame's
    /// statistics and returns the composed parameters.
    pub fn analyze(&mut self, raw: &IspStatsBuffer)
                   -> Result<FullParamsRef, CanonicalError> {
        let start = Instant::now();
        let stats = AnalyzerStats::convert(raw, self.shared.working_mode);
        self.shared.begin_frame(stats);
        let frame_id = self.shared.frame_id;
        let mut summary = PassSummary{frame_id, ..Default::default()};

        for handle in self.registry.current_handles() {
            let algo_type = handle.algo_type();
            // Added or re-enabled since the last prepare.
            if !handle.is_prepared() {
                if let Err(e) = handle.prepare(&self.shared.sensor,
                                               self.shared.working_mode,
                                               &self.shared.calib) {
                    warn!("Frame {}: late prepare of {} id {} failed: {}",
                          frame_id, algo_type, handle.id(), e);
                    self.shared.comb.fail(algo_type);
                    self.metrics.record_failure(algo_type);
                    summary.failed.push(algo_type);
                    continue;
                }
            }
            match handle.run_frame(&self.shared) {
                FrameOutcome::Committed(result) => {
                    trace!("Frame {}: {} committed", frame_id, algo_type);
                    self.shared.comb.commit(algo_type, result);
                    summary.committed.push(algo_type);
                },
                FrameOutcome::Bypassed(phase) => {
                    debug!("Frame {}: {} bypassed in {}", frame_id, algo_type, phase);
                    self.metrics.record_bypass(algo_type);
                    summary.bypassed.push(algo_type);
                },
                FrameOutcome::Failed(phase, e) => {
                    warn!("Frame {}: {} id {} failed in {}: {}",
                          frame_id, algo_type, handle.id(), phase, e);
                    self.shared.comb.fail(algo_type);
                    self.metrics.record_failure(algo_type);
                    summary.failed.push(algo_type);
                },
            }
            if handle.update_config() {
                debug!("Frame {}: applied staged attributes of {}", frame_id, algo_type);
            }
        }
        self.shared.init = false;

        self.stats_pool.publish(&self.shared.stats, self.shared.working_mode);

        let result = match self.params_pool.try_acquire() {
            Some(mut p) => {
                params::generate(&mut p, &self.shared);
                Ok(p.share())
            },
            None => {
                self.metrics.record_dropped_params();
                Err(resource_exhausted_error(
                    format!("no free params buffer for frame {}", frame_id).as_str()))
            },
        };
        self.metrics.record_pass(start.elapsed());
        debug!("Frame {} analyzed in {:?}: {} committed, {} bypassed, {} failed",
               frame_id, start.elapsed(), summary.committed.len(),
               summary.bypassed.len(), summary.failed.len());
        self.last_pass = summary;
        result
    }

    pub fn handle_event(&mut self, event: &HwEvent) -> Result<(), CanonicalError> {
        match event {
            HwEvent::StartOfFrame{frame_id} => {
                trace!("Start of frame {}", frame_id);
                Ok(())
            },
            HwEvent::ExposureEffective{frame_id, exposure} => {
                trace!("Exposure {:?} effective from frame {}", exposure, frame_id);
                self.shared.latch_exposure(*frame_id, *exposure);
                Ok(())
            },
            HwEvent::SensorModeChanged{mode} => {
                if *mode == self.shared.working_mode {
                    return Ok(());
                }
                info!("Sensor switched to {} mode", mode);
                self.prepare(self.shared.sensor.clone(), *mode)
            },
        }
    }

    pub fn handle_tx_buf(&mut self, buf: &TxBuffer) {
        trace!("Tx buffer for frame {} ({} bytes)", buf.frame_id, buf.data.len());
        self.shared.latch_exposure(buf.frame_id, buf.exposure);
    }

    pub fn handle_command(&mut self, command: ControlCommand) -> Result<(), CanonicalError> {
        match command {
            ControlCommand::SetWorkingMode(mode) => {
                if mode == self.shared.working_mode {
                    return Ok(());
                }
                info!("Working mode {} -> {}", self.shared.working_mode, mode);
                self.prepare(self.shared.sensor.clone(), mode)
            },
            ControlCommand::SetCpsLtCfg(cfg) => {
                self.shared.fill_light_on = cfg.fill_light_on;
                self.shared.fill_light_infrared = cfg.infrared;
                // An IR fill light makes color meaningless.
                if cfg.fill_light_on && cfg.infrared &&
                    self.shared.gray_mode == GrayMode::Off
                {
                    info!("Infrared fill light on; gray mode now follows the fill light");
                    self.shared.gray_mode = GrayMode::Auto;
                }
                Ok(())
            },
            ControlCommand::SetGrayMode(mode) => {
                self.shared.gray_mode = mode;
                Ok(())
            },
            ControlCommand::UpdateCalib(calib) => {
                calib.validate()?;
                if !calib.checksum_matches() {
                    warn!("Calibration {} checksum mismatch", calib.name);
                }
                info!("Switching to calibration {}", calib.name);
                let previous = std::mem::replace(&mut self.shared.calib, calib);
                let (sensor, mode) = (self.shared.sensor.clone(), self.shared.working_mode);
                if let Err(e) = self.prepare(sensor.clone(), mode) {
                    warn!("Calibration {} rejected, keeping {}",
                          self.shared.calib.name, previous.name);
                    self.shared.calib = previous;
                    if let Err(e2) = self.prepare(sensor, mode) {
                        warn!("Re-prepare with calibration {} failed: {}",
                              self.shared.calib.name, e2);
                    }
                    return Err(e);
                }
                Ok(())
            },
        }
    }
}

/// Applies staged attribute updates of every handle, acknowledging their
/// callers. Used when no further frame pass will reach the safe point.
pub(crate) fn flush_attribs(registry: &AlgoRegistry) {
    for handle in registry.all_handles() {
        if handle.update_config() {
            debug!("Applied staged attributes of {} id {}", handle.algo_type(), handle.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use canonical_error::{CanonicalErrorCode, internal_error, invalid_argument_error};

    use crate::algo_type::AlgoId;
    use crate::algorithm::{AlgoDescriptor, Algorithm, Phase, PhaseInput, PrepareParams};
    use crate::families::{Tuning, TuningAttrib, TuningResult};
    use crate::reference_algos::register_reference_algos;
    use crate::stats::{RawAeStats, RawAwbStats, HISTOGRAM_BINS};

    struct Flaky {
        fail_on: u32,
    }

    impl Algorithm<Tuning> for Flaky {
        fn prepare(&mut self, _params: &PrepareParams) -> Result<(), CanonicalError> {
            Ok(())
        }
        fn processing(&mut self, input: &PhaseInput<Tuning>)
                      -> Result<Phase<TuningResult>, CanonicalError> {
            if input.common.frame_id == self.fail_on {
                return Err(internal_error("flaky"));
            }
            Ok(Phase::Done(TuningResult{
                algo_type: input.common.algo_type,
                strength: input.common.frame_id as f32,
                enabled: true}))
        }
        fn update_attrib(&mut self, _attrib: &TuningAttrib) -> Result<(), CanonicalError> {
            Ok(())
        }
    }

    fn pipeline() -> Pipeline {
        let calib = Arc::new(CalibDb::default());
        let registry = Arc::new(AlgoRegistry::new(Arc::new(AtomicBool::new(false))));
        register_reference_algos(&registry, &calib).unwrap();
        Pipeline::new(registry, SensorDescriptor::new("imx415", 1920, 1080),
                      WorkingMode::Normal, calib,
                      Arc::new(StatsSharingPool::new(4, 2)),
                      Pool::new("params", 2, FullParams::default),
                      Arc::new(PipelineMetrics::new())).unwrap()
    }

    fn full_stats(frame_id: u32) -> IspStatsBuffer {
        let mut raw = IspStatsBuffer::empty(frame_id);
        let mut histogram = vec![0; HISTOGRAM_BINS];
        histogram[40] = 100;
        raw.ae = Some(RawAeStats{histogram, zone_luma: vec![40; 4]});
        raw.awb = Some(RawAwbStats{zone_sums: vec![[100, 200, 120]; 4],
                                   zone_counts: vec![10; 4]});
        raw.exposure = ExposureParams::default();
        raw
    }

    fn add_flaky(p: &Pipeline, id: AlgoId, fail_on: u32) {
        p.registry.enable_algo(AlgoType::Anr, 0, false).unwrap();
        p.registry.add_algo(AlgoDescriptor::<Tuning>::new(
            AlgoType::Anr, id, "flaky", move |_| {
                Ok(Box::new(Flaky{fail_on}) as Box<dyn Algorithm<Tuning>>)
            }), p.shared.calib.clone()).unwrap();
    }

    #[test]
    fn first_frame_without_stats_still_produces_params() {
        let mut p = pipeline();
        let params = p.analyze(&IspStatsBuffer::empty(1)).unwrap();
        assert_eq!(params.frame_id, 1);
        assert!(!p.shared().init);
        // Reference exposure synthesized a default during init.
        assert!(p.last_pass().committed.contains(&AlgoType::Ae));
        assert!(p.last_pass().bypassed.contains(&AlgoType::Af));
    }

    #[test]
    fn failure_is_contained_to_its_type() {
        let mut p = pipeline();
        add_flaky(&p, 9, 2);
        drop(p.analyze(&full_stats(1)).unwrap());
        let params = p.analyze(&full_stats(2)).unwrap();
        assert_eq!(p.last_pass().failed, vec![AlgoType::Anr]);
        assert!(p.last_pass().committed.contains(&AlgoType::Awb));
        assert!(p.shared().comb.current(AlgoType::Anr).is_none());
        // The generator fell back to frame 1's result.
        assert_eq!(params.tuning[&AlgoType::Anr].strength, 1.0);
        assert_eq!(p.metrics.failures(AlgoType::Anr), 1);
    }

    #[test]
    fn handles_added_after_prepare_are_prepared_lazily() {
        let mut p = pipeline();
        add_flaky(&p, 4, 0);
        drop(p.analyze(&full_stats(5)).unwrap());
        assert!(p.registry.find(AlgoType::Anr, 4).unwrap().is_prepared());
        assert!(p.last_pass().committed.contains(&AlgoType::Anr));
    }

    #[test]
    fn params_pool_exhaustion_fails_the_frame_only() {
        let mut p = pipeline();
        let a = p.analyze(&full_stats(1)).unwrap();
        let b = p.analyze(&full_stats(2)).unwrap();
        assert!(p.analyze(&full_stats(3)).is_err());
        drop((a, b));
        assert!(p.analyze(&full_stats(4)).is_ok());
    }

    #[test]
    fn working_mode_switch_reprepares() {
        let mut p = pipeline();
        drop(p.analyze(&full_stats(1)).unwrap());
        p.handle_command(ControlCommand::SetWorkingMode(WorkingMode::Hdr2)).unwrap();
        assert!(p.shared().init);
        assert_eq!(p.shared().working_mode, WorkingMode::Hdr2);
        assert!(p.shared().comb.latest(AlgoType::Ae).is_none());
    }

    #[test]
    fn infrared_fill_light_forces_gray() {
        let mut p = pipeline();
        p.handle_command(ControlCommand::SetCpsLtCfg(
            CpsLtCfg{fill_light_on: true, infrared: true})).unwrap();
        assert!(p.shared().gray_mode_active());
        let params = p.analyze(&full_stats(1)).unwrap();
        assert!(params.gray_mode);

        p.handle_command(ControlCommand::SetCpsLtCfg(CpsLtCfg::default())).unwrap();
        assert!(!p.shared().gray_mode_active());
    }

    #[test]
    fn exposure_events_update_history() {
        let mut p = pipeline();
        let mut exposure = ExposureParams::default();
        exposure.digital_gain = 4.0;
        p.handle_event(&HwEvent::ExposureEffective{frame_id: 3, exposure}).unwrap();
        p.handle_tx_buf(&TxBuffer{frame_id: 3, exposure, data: Arc::new(Vec::new())});
        drop(p.analyze(&full_stats(2)).unwrap());
        assert_eq!(p.shared().cur_exposure, ExposureParams::default());

        drop(p.analyze(&full_stats(3)).unwrap());
        assert_eq!(p.shared().cur_exposure, exposure);
        assert_eq!(p.shared().prev_exposure, ExposureParams::default());
        assert_eq!(p.shared().iso, 200);

        // Frame 4 carries the same exposure; history does not move.
        let mut stats = full_stats(4);
        stats.exposure = exposure;
        drop(p.analyze(&stats).unwrap());
        assert_eq!(p.shared().prev_exposure, ExposureParams::default());
    }

    #[test]
    fn calibration_update_reprepares() {
        let mut p = pipeline();
        let mut db = CalibDb::default();
        db.name = "night".to_string();
        db.ae_target_luma = 30.0;
        db.checksum = db.compute_checksum();
        p.handle_command(ControlCommand::UpdateCalib(Arc::new(db))).unwrap();
        assert_eq!(p.shared().calib.name, "night");
        assert!(p.shared().init);
    }

    struct Picky;

    impl Algorithm<Tuning> for Picky {
        fn prepare(&mut self, params: &PrepareParams) -> Result<(), CanonicalError> {
            if params.calib.name == "broken" {
                return Err(invalid_argument_error("table does not fit this sensor"));
            }
            Ok(())
        }
        fn processing(&mut self, input: &PhaseInput<Tuning>)
                      -> Result<Phase<TuningResult>, CanonicalError> {
            Ok(Phase::Done(TuningResult{
                algo_type: input.common.algo_type, strength: 0.5, enabled: true}))
        }
        fn update_attrib(&mut self, _attrib: &TuningAttrib) -> Result<(), CanonicalError> {
            Ok(())
        }
    }

    #[test]
    fn calibration_rejected_on_prepare_keeps_previous() {
        let mut p = pipeline();
        p.registry.add_algo(AlgoDescriptor::<Tuning>::new(
            AlgoType::Anr, 6, "picky", |_| {
                Ok(Box::new(Picky) as Box<dyn Algorithm<Tuning>>)
            }), p.shared.calib.clone()).unwrap();
        let before = p.shared().calib.name.clone();

        let mut db = CalibDb::default();
        db.name = "broken".to_string();
        db.checksum = db.compute_checksum();
        let err = p.handle_command(ControlCommand::UpdateCalib(Arc::new(db))).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::InvalidArgument));
        assert_eq!(p.shared().calib.name, before);
        // Everything was re-prepared against the kept table.
        assert!(p.registry.find(AlgoType::Anr, 6).unwrap().is_prepared());
        assert!(p.analyze(&full_stats(1)).is_ok());
    }
}
