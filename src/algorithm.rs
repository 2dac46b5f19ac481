// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The capability interface every pluggable algorithm implements, and the
//! per-family traits that fix its phase parameter types.

use std::fmt;
use std::sync::Arc;

use canonical_error::CanonicalError;

use crate::algo_type::{AlgoFamily, AlgoId, AlgoType};
use crate::calib::CalibDb;
use crate::sensor::{ExposureParams, SensorDescriptor, WorkingMode};
use crate::shared_state::{AlgoResult, SharedAnalysisState};

/// Outcome of a phase that did not fail. Bypass means "not ready yet": the
/// type is skipped for this frame and its previous result stays in effect.
#[derive(Clone, Debug, PartialEq)]
pub enum Phase<R> {
    Done(R),
    Bypass,
}

impl<R> Phase<R> {
    pub fn is_bypass(&self) -> bool {
        matches!(self, Phase::Bypass)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Prepare,
    PreProcess,
    Processing,
    PostProcess,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Phase input fields common to every algorithm type.
#[derive(Clone, Debug)]
pub struct CommonInput {
    pub algo_type: AlgoType,
    pub frame_id: u32,
    pub sensor_dimensions: (u32, u32),
    pub working_mode: WorkingMode,

    /// True until the first frame pass has completed after prepare().
    pub init: bool,

    pub exposure: ExposureParams,
    pub prev_exposure: ExposureParams,
    pub iso: u32,
    pub gray_mode: bool,
    pub fill_light_on: bool,
    pub calib: Arc<CalibDb>,
}

impl CommonInput {
    pub fn from_shared(algo_type: AlgoType, shared: &SharedAnalysisState) -> Self {
        CommonInput {
            algo_type,
            frame_id: shared.frame_id,
            sensor_dimensions: shared.sensor.dimensions,
            working_mode: shared.working_mode,
            init: shared.init,
            exposure: shared.cur_exposure,
            prev_exposure: shared.prev_exposure,
            iso: shared.iso,
            gray_mode: shared.gray_mode_active(),
            fill_light_on: shared.fill_light_on,
            calib: shared.calib.clone(),
        }
    }
}

/// Everything an algorithm sees in one phase call.
pub struct PhaseInput<T: AlgoTraits> {
    pub common: CommonInput,
    pub extra: T::Input,
}

impl<T: AlgoTraits> PhaseInput<T> {
    pub fn build(algo_type: AlgoType, shared: &SharedAnalysisState) -> Self {
        PhaseInput {
            common: CommonInput::from_shared(algo_type, shared),
            extra: T::build_input(algo_type, shared),
        }
    }
}

/// Passed to Algorithm::prepare() on every (re-)prepare.
#[derive(Clone, Debug)]
pub struct PrepareParams {
    pub algo_type: AlgoType,
    pub sensor: SensorDescriptor,
    pub working_mode: WorkingMode,
    pub calib: Arc<CalibDb>,

    /// True when this context was already prepared before, e.g. a working
    /// mode switch or a calibration update.
    pub reprepare: bool,
}

/// Instance-scoped configuration handed to a descriptor's factory when its
/// context is created.
#[derive(Clone, Debug)]
pub struct AlgoConfig {
    pub algo_type: AlgoType,
    pub id: AlgoId,
    pub calib: Arc<CalibDb>,
}

/// Fixes the phase parameter types for one family of algorithm types and
/// supplies the family's shared input construction and bypass policy. Marker
/// types implementing this live in the `families` module.
pub trait AlgoTraits: Sized + Send + Sync + 'static {
    const FAMILY: AlgoFamily;

    /// Externally settable attributes (see `AlgoHandle::set_attrib`).
    type Attrib: Clone + PartialEq + Default + fmt::Debug + Send + 'static;

    /// Family-specific phase input, built fresh for every frame.
    type Input: Clone + fmt::Debug + Send;

    type Result: Clone + fmt::Debug + Send + Into<AlgoResult>;

    fn build_input(algo_type: AlgoType, shared: &SharedAnalysisState) -> Self::Input;

    /// Returns true if `phase` must be skipped this frame because an upstream
    /// validity condition is not met.
    fn bypass(_phase: PhaseKind, _common: &CommonInput, _input: &Self::Input) -> bool {
        false
    }

    /// For the reference implementation only: a result synthesized without
    /// calling into the algorithm, used while the pipeline is initializing and
    /// the algorithm has nothing to work from yet.
    fn reference_default(_common: &CommonInput, _input: &Self::Input)
                         -> Option<Self::Result> {
        None
    }
}

/// Capability interface implemented by the reference algorithms and by
/// third-party plugins alike.
///
/// Phases are called from the orchestrator thread only, in the order
/// pre_process, processing, post_process, once per frame. Returning
/// `Phase::Bypass` from any phase skips the rest of the frame for this type
/// without being treated as an error. Returning an error also skips the rest
/// of the frame for this type and clears its current result slot; other types
/// are unaffected.
pub trait Algorithm<T: AlgoTraits>: Send {
    /// Called before the first frame and again on every re-prepare.
    fn prepare(&mut self, params: &PrepareParams) -> Result<(), CanonicalError>;

    fn pre_process(&mut self, _input: &PhaseInput<T>)
                   -> Result<Phase<()>, CanonicalError> {
        Ok(Phase::Done(()))
    }

    fn processing(&mut self, input: &PhaseInput<T>)
                  -> Result<Phase<T::Result>, CanonicalError>;

    /// May adjust the result produced by processing().
    fn post_process(&mut self, _input: &PhaseInput<T>, _result: &mut T::Result)
                    -> Result<Phase<()>, CanonicalError> {
        Ok(Phase::Done(()))
    }

    /// Applies new attributes. Called with the handle's attribute lock held,
    /// never concurrently with a phase.
    fn update_attrib(&mut self, attrib: &T::Attrib) -> Result<(), CanonicalError>;
}

pub type AlgoFactory<T> = Box<
    dyn Fn(&AlgoConfig) -> Result<Box<dyn Algorithm<T>>, CanonicalError> + Send + Sync>;

/// Registration record for one algorithm implementation. The factory plays
/// the role of create_context; dropping the returned context destroys it.
pub struct AlgoDescriptor<T: AlgoTraits> {
    pub algo_type: AlgoType,
    pub id: AlgoId,
    pub name: String,
    pub factory: AlgoFactory<T>,
}

impl<T: AlgoTraits> AlgoDescriptor<T> {
    pub fn new<F>(algo_type: AlgoType, id: AlgoId, name: &str, factory: F) -> Self
    where F: Fn(&AlgoConfig) -> Result<Box<dyn Algorithm<T>>, CanonicalError>
        + Send + Sync + 'static
    {
        AlgoDescriptor {
            algo_type,
            id,
            name: name.to_string(),
            factory: Box::new(factory),
        }
    }
}

impl<T: AlgoTraits> fmt::Debug for AlgoDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AlgoDescriptor")
            .field("algo_type", &self.algo_type)
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
