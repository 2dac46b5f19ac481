// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! One generic handle type drives every algorithm type through its phases.
//! The family's AlgoTraits supply the input construction and bypass policy,
//! the boxed Algorithm supplies the behavior.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use canonical_error::CanonicalError;
use log::trace;

use crate::algo_type::{AlgoId, AlgoType, REFERENCE_ALGO_ID};
use crate::algorithm::{AlgoConfig, AlgoDescriptor, AlgoTraits, Algorithm, Phase,
                       PhaseInput, PhaseKind, PrepareParams};
use crate::calib::CalibDb;
use crate::reconfig::{AttribUpdate, ReconfigChannel};
use crate::sensor::{SensorDescriptor, WorkingMode};
use crate::shared_state::{AlgoResult, SharedAnalysisState};

/// What happened to one algorithm type during one frame pass.
#[derive(Debug)]
pub enum FrameOutcome {
    /// All phases completed; the result replaces the type's slot.
    Committed(AlgoResult),
    /// A precondition was not met in the given phase.
    Bypassed(PhaseKind),
    /// The given phase failed.
    Failed(PhaseKind, CanonicalError),
}

/// Type-erased view of an AlgoHandle, used by the registry and orchestrator.
pub trait DynAlgoHandle: Send + Sync {
    fn algo_type(&self) -> AlgoType;
    fn id(&self) -> AlgoId;
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn is_prepared(&self) -> bool;

    fn prepare(&self, sensor: &SensorDescriptor, working_mode: WorkingMode,
               calib: &Arc<CalibDb>) -> Result<(), CanonicalError>;

    /// Runs pre_process, processing and post_process for the current frame.
    fn run_frame(&self, shared: &SharedAnalysisState) -> FrameOutcome;

    /// The per-frame safe point: applies any staged attribute update. Returns
    /// true if one was applied.
    fn update_config(&self) -> bool;

    fn has_pending_attrib(&self) -> bool;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub struct AlgoHandle<T: AlgoTraits> {
    algo_type: AlgoType,
    id: AlgoId,
    name: String,
    enabled: AtomicBool,
    prepared: AtomicBool,

    // Shared with the engine; true while the orchestrator is running.
    running: Arc<AtomicBool>,

    ctx: Mutex<Box<dyn Algorithm<T>>>,
    attrib: ReconfigChannel<T::Attrib>,
}

impl<T: AlgoTraits> fmt::Debug for AlgoHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AlgoHandle")
            .field("algo_type", &self.algo_type)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl<T: AlgoTraits> AlgoHandle<T> {
    /// Creates the algorithm context through the descriptor's factory.
    pub(crate) fn create(desc: AlgoDescriptor<T>, calib: Arc<CalibDb>,
                         running: Arc<AtomicBool>) -> Result<Self, CanonicalError> {
        let config = AlgoConfig {
            algo_type: desc.algo_type,
            id: desc.id,
            calib,
        };
        let ctx = (desc.factory)(&config)?;
        Ok(AlgoHandle {
            algo_type: desc.algo_type,
            id: desc.id,
            name: desc.name,
            enabled: AtomicBool::new(true),
            prepared: AtomicBool::new(false),
            running,
            ctx: Mutex::new(ctx),
            attrib: ReconfigChannel::new(T::Attrib::default()),
        })
    }

    /// Requests new attributes. While the orchestrator runs the value is
    /// staged and a ticket is returned; otherwise it is applied at once.
    pub fn set_attrib(&self, attrib: T::Attrib) -> Result<AttribUpdate, CanonicalError> {
        let running = self.running.load(Ordering::Acquire);
        self.attrib.request(attrib, running, |a| {
            self.ctx.lock().unwrap().update_attrib(a)
        })
    }

    /// Returns the attributes currently in effect.
    pub fn get_attrib(&self) -> T::Attrib {
        self.attrib.current()
    }

    fn run_phases(&self, shared: &SharedAnalysisState) -> FrameOutcome {
        let input = PhaseInput::<T>::build(self.algo_type, shared);

        if self.id == REFERENCE_ALGO_ID {
            if let Some(result) = T::reference_default(&input.common, &input.extra) {
                trace!("{} frame {}: reference default", self.algo_type, input.common.frame_id);
                return FrameOutcome::Committed(result.into());
            }
        }

        let mut ctx = self.ctx.lock().unwrap();

        if T::bypass(PhaseKind::PreProcess, &input.common, &input.extra) {
            return FrameOutcome::Bypassed(PhaseKind::PreProcess);
        }
        match ctx.pre_process(&input) {
            Ok(Phase::Done(())) => (),
            Ok(Phase::Bypass) => return FrameOutcome::Bypassed(PhaseKind::PreProcess),
            Err(e) => return FrameOutcome::Failed(PhaseKind::PreProcess, e),
        }

        if T::bypass(PhaseKind::Processing, &input.common, &input.extra) {
            return FrameOutcome::Bypassed(PhaseKind::Processing);
        }
        let mut result = match ctx.processing(&input) {
            Ok(Phase::Done(r)) => r,
            Ok(Phase::Bypass) => return FrameOutcome::Bypassed(PhaseKind::Processing),
            Err(e) => return FrameOutcome::Failed(PhaseKind::Processing, e),
        };

        if T::bypass(PhaseKind::PostProcess, &input.common, &input.extra) {
            return FrameOutcome::Bypassed(PhaseKind::PostProcess);
        }
        match ctx.post_process(&input, &mut result) {
            Ok(Phase::Done(())) => FrameOutcome::Committed(result.into()),
            Ok(Phase::Bypass) => FrameOutcome::Bypassed(PhaseKind::PostProcess),
            Err(e) => FrameOutcome::Failed(PhaseKind::PostProcess, e),
        }
    }
}

impl<T: AlgoTraits> DynAlgoHandle for AlgoHandle<T> {
    fn algo_type(&self) -> AlgoType { self.algo_type }
    fn id(&self) -> AlgoId { self.id }
    fn name(&self) -> &str { &self.name }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
    fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    fn prepare(&self, sensor: &SensorDescriptor, working_mode: WorkingMode,
               calib: &Arc<CalibDb>) -> Result<(), CanonicalError> {
        let params = PrepareParams {
            algo_type: self.algo_type,
            sensor: sensor.clone(),
            working_mode,
            calib: calib.clone(),
            reprepare: self.is_prepared(),
        };
        self.ctx.lock().unwrap().prepare(&params)?;
        self.prepared.store(true, Ordering::Release);
        Ok(())
    }

    fn run_frame(&self, shared: &SharedAnalysisState) -> FrameOutcome {
        self.run_phases(shared)
    }

    fn update_config(&self) -> bool {
        self.attrib.update_config(|a| self.ctx.lock().unwrap().update_attrib(a))
    }

    fn has_pending_attrib(&self) -> bool {
        self.attrib.has_pending()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonical_error::internal_error;

    use crate::families::{Exposure, AeResult, Tuning, TuningResult};
    use crate::stats::{AnalyzerStats, IspStatsBuffer, RawAeStats, HISTOGRAM_BINS};

    struct FixedTuning {
        strength: f32,
        fail: bool,
    }

    impl Algorithm<Tuning> for FixedTuning {
        fn prepare(&mut self, _params: &PrepareParams) -> Result<(), CanonicalError> {
            Ok(())
        }
        fn processing(&mut self, input: &PhaseInput<Tuning>)
                      -> Result<Phase<TuningResult>, CanonicalError> {
            if self.fail {
                return Err(internal_error("boom"));
            }
            Ok(Phase::Done(TuningResult{
                algo_type: input.common.algo_type, strength: self.strength, enabled: true}))
        }
        fn update_attrib(&mut self, attrib: &crate::families::TuningAttrib)
                         -> Result<(), CanonicalError> {
            self.strength = attrib.strength_scale;
            Ok(())
        }
    }

    struct CountingAe {
        calls: usize,
    }

    impl Algorithm<Exposure> for CountingAe {
        fn prepare(&mut self, _params: &PrepareParams) -> Result<(), CanonicalError> {
            Ok(())
        }
        fn processing(&mut self, input: &PhaseInput<Exposure>)
                      -> Result<Phase<AeResult>, CanonicalError> {
            self.calls += 1;
            Ok(Phase::Done(AeResult{
                exposure: input.common.exposure,
                hdr_exposures: vec![input.common.exposure],
                mean_luma: input.extra.aec.as_ref().map(|a| a.mean_luma).unwrap_or(0.0),
                converged: true,
            }))
        }
        fn update_attrib(&mut self, _attrib: &crate::families::AeAttrib)
                         -> Result<(), CanonicalError> {
            Ok(())
        }
    }

    fn shared() -> SharedAnalysisState {
        SharedAnalysisState::new(SensorDescriptor::new("imx415", 1920, 1080),
                                 WorkingMode::Normal, Arc::new(CalibDb::default()))
    }

    fn tuning_handle(id: AlgoId, fail: bool, running: bool) -> AlgoHandle<Tuning> {
        let desc = AlgoDescriptor::<Tuning>::new(AlgoType::Anr, id, "fixed", move |_| {
            Ok(Box::new(FixedTuning{strength: 0.25, fail}) as Box<dyn Algorithm<Tuning>>)
        });
        AlgoHandle::create(desc, Arc::new(CalibDb::default()),
                           Arc::new(AtomicBool::new(running))).unwrap()
    }

    #[test]
    fn successful_pass_commits() {
        let handle = tuning_handle(0, false, false);
        match handle.run_frame(&shared()) {
            FrameOutcome::Committed(AlgoResult::Tuning(r)) => assert_eq!(r.strength, 0.25),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn failure_is_reported_with_phase() {
        let handle = tuning_handle(3, true, false);
        assert!(matches!(handle.run_frame(&shared()),
                         FrameOutcome::Failed(PhaseKind::Processing, _)));
    }

    #[test]
    fn attrib_inline_when_not_running() {
        let handle = tuning_handle(0, false, false);
        let mut attrib = handle.get_attrib();
        attrib.strength_scale = 0.75;
        assert!(matches!(handle.set_attrib(attrib.clone()).unwrap(), AttribUpdate::Applied));
        assert_eq!(handle.get_attrib(), attrib);
        match handle.run_frame(&shared()) {
            FrameOutcome::Committed(AlgoResult::Tuning(r)) => assert_eq!(r.strength, 0.75),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn attrib_staged_when_running() {
        let handle = tuning_handle(0, false, true);
        let mut attrib = handle.get_attrib();
        attrib.strength_scale = 0.75;
        assert!(matches!(handle.set_attrib(attrib).unwrap(), AttribUpdate::Pending(_)));
        assert!(handle.has_pending_attrib());
        assert!(handle.update_config());
        assert!(!handle.has_pending_attrib());
        assert_eq!(handle.get_attrib().strength_scale, 0.75);
    }

    fn ae_handle(id: AlgoId) -> AlgoHandle<Exposure> {
        let desc = AlgoDescriptor::<Exposure>::new(AlgoType::Ae, id, "counting", |_| {
            Ok(Box::new(CountingAe{calls: 0}) as Box<dyn Algorithm<Exposure>>)
        });
        AlgoHandle::create(desc, Arc::new(CalibDb::default()),
                           Arc::new(AtomicBool::new(false))).unwrap()
    }

    #[test]
    fn reference_exposure_synthesizes_default_during_init() {
        let s = shared();
        assert!(s.init && !s.stats.aec_valid());
        assert!(matches!(ae_handle(0).run_frame(&s),
                         FrameOutcome::Committed(AlgoResult::Ae(_))));
        // A plugin sees the bypass under the same conditions.
        assert!(matches!(ae_handle(5).run_frame(&s),
                         FrameOutcome::Bypassed(PhaseKind::PreProcess)));
    }

    #[test]
    fn exposure_runs_with_valid_stats() {
        let mut s = shared();
        let mut raw = IspStatsBuffer::empty(3);
        let mut histogram = vec![0; HISTOGRAM_BINS];
        histogram[64] = 10;
        raw.ae = Some(RawAeStats{histogram, zone_luma: vec![]});
        s.begin_frame(AnalyzerStats::convert(&raw, WorkingMode::Normal));
        match ae_handle(5).run_frame(&s) {
            FrameOutcome::Committed(AlgoResult::Ae(r)) => assert_eq!(r.mean_luma, 64.0),
            other => panic!("unexpected {:?}", other),
        }
    }
}
