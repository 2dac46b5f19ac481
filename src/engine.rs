// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The public face of the analysis engine: lifecycle, the inbound queues and
//! their worker threads, algorithm registry management, statistics sharing
//! and live attribute updates.
//!
//! Threads, while started:
//! * stats, events, tx-buffer and command workers drain their own queues and
//!   forward into the orchestrator queue, so that producers never wait on a
//!   frame pass;
//! * the orchestrator owns the frame pass;
//! * the apply worker hands finished parameter blocks to the ParamsSink.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{CanonicalError, CanonicalErrorCode, failed_precondition_error,
                      invalid_argument_error};
use log::{debug, info, warn};

use crate::algo_registry::{AlgoInfo, AlgoRegistry};
use crate::algo_type::{AlgoId, AlgoType};
use crate::algorithm::{AlgoDescriptor, AlgoTraits};
use crate::calib::{CalibDb, CalibSource, CalibStore};
use crate::handle::{AlgoHandle, DynAlgoHandle};
use crate::metrics::PipelineMetrics;
use crate::params::{FullParams, FullParamsRef};
use crate::pipeline::{self, ControlCommand, CpsLtCfg, HwEvent, Pipeline, PipelineMsg,
                      TxBuffer};
use crate::pool::Pool;
use crate::queue::{MessageQueue, SyncSignal, Worker, sync_pair};
use crate::reconfig::AttribUpdate;
use crate::reference_algos::register_reference_algos;
use crate::sensor::{SensorDescriptor, WorkingMode};
use crate::shared_state::GrayMode;
use crate::stats::IspStatsBuffer;
use crate::stats_sharing::{DEFAULT_CACHE_LEN, DEFAULT_POOL_SIZE, StatsRef,
                           StatsSharingPool};

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Slots in the shared statistics pool.
    pub stats_pool_size: usize,
    /// Most recent snapshots retained for lookup by frame id.
    pub stats_cache_len: usize,
    /// Parameter blocks in flight between the orchestrator and the sink.
    pub params_pool_size: usize,
    /// How long set_attrib() waits for the orchestrator to apply an update.
    pub attrib_ack_timeout: Duration,
    /// Queue length beyond which the oldest frame (stats or tx buffer) is
    /// dropped. Commands and events are never dropped.
    pub queue_soft_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            stats_pool_size: DEFAULT_POOL_SIZE,
            stats_cache_len: DEFAULT_CACHE_LEN,
            params_pool_size: 4,
            attrib_ack_timeout: Duration::from_millis(300),
            queue_soft_limit: 16,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.stats_pool_size == 0 || self.params_pool_size == 0 ||
            self.queue_soft_limit == 0
        {
            return Err(invalid_argument_error(
                format!("pool and queue sizes must be non-zero: {:?}", self).as_str()));
        }
        if self.stats_cache_len == 0 || self.stats_cache_len > self.stats_pool_size {
            return Err(invalid_argument_error(
                format!("stats cache length {} must be in 1..={}",
                        self.stats_cache_len, self.stats_pool_size).as_str()));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Invalid,
    Inited,
    Prepared,
    /// Workers are up; no frame analyzed yet.
    Started,
    /// At least one frame analyzed since start().
    Running,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Receives the result of every analyzed frame, on the apply thread.
pub trait ParamsSink: Send + Sync {
    fn apply(&self, params: &FullParamsRef);

    /// A frame was analyzed but produced no parameters.
    fn on_failure(&self, frame_id: u32, message: &str) {
        warn!("Frame {} produced no parameters: {}", frame_id, message);
    }
}

#[derive(Debug)]
pub enum SinkEvent {
    Applied(FullParamsRef),
    Failed { frame_id: u32, message: String },
}

/// ParamsSink forwarding into a channel. Holding an Applied event keeps its
/// parameter block out of the pool.
pub struct ChannelSink {
    tx: Mutex<Sender<SinkEvent>>,
}

impl ChannelSink {
    pub fn new() -> (Arc<ChannelSink>, Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelSink{tx: Mutex::new(tx)}), rx)
    }
}

impl ParamsSink for ChannelSink {
    fn apply(&self, params: &FullParamsRef) {
        let _ = self.tx.lock().unwrap().send(SinkEvent::Applied(params.clone()));
    }

    fn on_failure(&self, frame_id: u32, message: &str) {
        let _ = self.tx.lock().unwrap().send(
            SinkEvent::Failed{frame_id, message: message.to_string()});
    }
}

/// Outcome of Engine::set_attrib().
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttribOutcome {
    /// Same as the value in effect; nothing to do.
    Unchanged,
    /// In effect for the next frame pass.
    Applied,
    /// Not acknowledged in time; stays staged and is applied at the next
    /// safe point (or at stop()).
    Queued,
}

struct CommandMsg {
    command: ControlCommand,
    sync: Option<SyncSignal>,
}

enum ApplyMsg {
    Params(FullParamsRef),
    Failure { frame_id: u32, message: String },
}

struct Queues {
    stats: Arc<MessageQueue<IspStatsBuffer>>,
    events: Arc<MessageQueue<HwEvent>>,
    tx_bufs: Arc<MessageQueue<TxBuffer>>,
    commands: Arc<MessageQueue<CommandMsg>>,
    orchestrator: Arc<MessageQueue<PipelineMsg>>,
    apply: Arc<MessageQueue<ApplyMsg>>,
}

impl Queues {
    fn new(soft_limit: usize) -> Self {
        Queues {
            stats: Arc::new(MessageQueue::new("stats", soft_limit)),
            // Events and commands change state; they are never dropped.
            events: Arc::new(MessageQueue::with_drop_policy("events", soft_limit, |_| false)),
            tx_bufs: Arc::new(MessageQueue::new("txbuf", soft_limit)),
            commands: Arc::new(MessageQueue::with_drop_policy("commands", soft_limit, |_| false)),
            // Carries everything the four inbound queues can hold.
            orchestrator: Arc::new(MessageQueue::with_drop_policy(
                "orchestrator", 4 * soft_limit, PipelineMsg::is_droppable)),
            apply: Arc::new(MessageQueue::with_drop_policy(
                "apply", soft_limit, |m| matches!(m, ApplyMsg::Params(_)))),
        }
    }

    fn start_all(&self) {
        // Downstream first so nothing forwarded is discarded.
        self.apply.trigger_start();
        self.orchestrator.trigger_start();
        self.stats.trigger_start();
        self.events.trigger_start();
        self.tx_bufs.trigger_start();
        self.commands.trigger_start();
    }

    fn stop_all(&self) {
        self.stats.trigger_stop(true);
        self.events.trigger_stop(true);
        self.tx_bufs.trigger_stop(true);
        self.commands.trigger_stop(true);
        self.orchestrator.trigger_stop(true);
        self.apply.trigger_stop(true);
    }
}

pub struct Engine {
    config: EngineConfig,

    // Serializes prepare/start/stop. `state` itself is only locked briefly,
    // since the orchestrator thread updates it too.
    lifecycle: Mutex<()>,
    state: Arc<Mutex<EngineState>>,

    // True while the worker threads exist; selects staged over inline
    // attribute updates.
    running: Arc<AtomicBool>,

    registry: Arc<AlgoRegistry>,
    calib: Mutex<Arc<CalibDb>>,

    // None until the first prepare().
    pipeline: Arc<Mutex<Option<Pipeline>>>,

    stats_pool: Arc<StatsSharingPool>,
    params_pool: Pool<FullParams>,
    metrics: Arc<PipelineMetrics>,
    sink: Arc<dyn ParamsSink>,

    queues: Queues,
    workers: Mutex<Vec<Worker>>,
}

impl Engine {
    /// Loads calibration `calib_name` through `store`, and creates an engine
    /// with the reference algorithm of every type registered. A calibration
    /// that cannot be loaded is fatal.
    pub fn init(calib_name: &str, source: &dyn CalibSource, store: &CalibStore,
                config: EngineConfig, sink: Arc<dyn ParamsSink>)
                -> Result<Engine, CanonicalError> {
        config.validate()?;
        let calib = store.load(calib_name, source)?;
        let running = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(AlgoRegistry::new(running.clone()));
        register_reference_algos(&registry, &calib)?;
        info!("Engine initialized with calibration {}", calib.name);
        Ok(Engine {
            stats_pool: Arc::new(StatsSharingPool::new(config.stats_pool_size,
                                                       config.stats_cache_len)),
            params_pool: Pool::new("params", config.params_pool_size, FullParams::default),
            queues: Queues::new(config.queue_soft_limit),
            config,
            lifecycle: Mutex::new(()),
            state: Arc::new(Mutex::new(EngineState::Inited)),
            running,
            registry,
            calib: Mutex::new(calib),
            pipeline: Arc::new(Mutex::new(None)),
            metrics: Arc::new(PipelineMetrics::new()),
            sink,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn calib(&self) -> Arc<CalibDb> {
        self.calib.lock().unwrap().clone()
    }

    /// Prepares for `sensor` in `working_mode`. Legal whenever the engine is
    /// not started, including again after stop().
    pub fn prepare(&self, sensor: SensorDescriptor, working_mode: WorkingMode)
                   -> Result<(), CanonicalError> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        match self.state() {
            EngineState::Inited | EngineState::Prepared | EngineState::Stopped => (),
            other => return Err(failed_precondition_error(
                format!("prepare() not allowed in state {}", other).as_str())),
        }
        let mut pipeline = self.pipeline.lock().unwrap();
        match pipeline.as_mut() {
            Some(p) => p.prepare(sensor, working_mode)?,
            None => {
                *pipeline = Some(Pipeline::new(
                    self.registry.clone(), sensor, working_mode, self.calib(),
                    self.stats_pool.clone(), self.params_pool.clone(),
                    self.metrics.clone())?);
            },
        }
        self.set_state(EngineState::Prepared);
        info!("Engine prepared");
        Ok(())
    }

    /// Clears anything queued while stopped and starts the worker threads.
    pub fn start(&self) -> Result<(), CanonicalError> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        match self.state() {
            EngineState::Prepared | EngineState::Stopped => (),
            EngineState::Started | EngineState::Running => return Err(
                failed_precondition_error("engine already started")),
            other => return Err(failed_precondition_error(
                format!("start() not allowed in state {}", other).as_str())),
        }
        self.queues.start_all();
        self.running.store(true, Ordering::Release);
        if let Err(e) = self.spawn_workers() {
            self.shut_down_workers();
            return Err(e);
        }
        self.set_state(EngineState::Started);
        info!("Engine started");
        Ok(())
    }

    /// Stops and joins the worker threads. A phase already running completes
    /// first. Attribute updates still staged are applied before returning.
    /// A no-op unless started.
    pub fn stop(&self) -> Result<(), CanonicalError> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        match self.state() {
            EngineState::Started | EngineState::Running => (),
            other => {
                debug!("stop() in state {} ignored", other);
                return Ok(());
            },
        }
        self.shut_down_workers();
        self.set_state(EngineState::Stopped);
        info!("Engine stopped");
        Ok(())
    }

    fn shut_down_workers(&self) {
        self.queues.stop_all();
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.join();
        }
        self.running.store(false, Ordering::Release);
        pipeline::flush_attribs(&self.registry);
    }

    fn spawn_workers(&self) -> Result<(), CanonicalError> {
        let mut workers = self.workers.lock().unwrap();
        let q = &self.queues;

        let orchestrator = q.orchestrator.clone();
        let metrics = self.metrics.clone();
        let mut last_frame: Option<u32> = None;
        workers.push(Worker::spawn("stats", q.stats.clone(), move |stats: IspStatsBuffer| {
            if last_frame.is_some_and(|last| stats.frame_id <= last) {
                metrics.record_dropped_frame();
                warn!("Dropping stats of frame {}: not newer than frame {:?}",
                      stats.frame_id, last_frame);
                return Ok(());
            }
            last_frame = Some(stats.frame_id);
            orchestrator.push(PipelineMsg::Stats(stats));
            Ok(())
        })?);

        let orchestrator = q.orchestrator.clone();
        workers.push(Worker::spawn("events", q.events.clone(), move |event: HwEvent| {
            orchestrator.push(PipelineMsg::Event(event));
            Ok(())
        })?);

        let orchestrator = q.orchestrator.clone();
        workers.push(Worker::spawn("txbuf", q.tx_bufs.clone(), move |buf: TxBuffer| {
            orchestrator.push(PipelineMsg::TxBuf(buf));
            Ok(())
        })?);

        let orchestrator = q.orchestrator.clone();
        workers.push(Worker::spawn("commands", q.commands.clone(), move |msg: CommandMsg| {
            orchestrator.push(PipelineMsg::Command(msg.command, msg.sync));
            Ok(())
        })?);

        let pipeline = self.pipeline.clone();
        let state = self.state.clone();
        let apply = q.apply.clone();
        workers.push(Worker::spawn("orchestrator", q.orchestrator.clone(),
                                   move |msg: PipelineMsg| {
            let mut guard = pipeline.lock().unwrap();
            let Some(p) = guard.as_mut() else {
                return Err(failed_precondition_error("pipeline not prepared"));
            };
            match msg {
                PipelineMsg::Stats(stats) => {
                    match p.analyze(&stats) {
                        Ok(params) => {
                            mark_running(&state);
                            apply.push(ApplyMsg::Params(params));
                        },
                        Err(e) => apply.push(ApplyMsg::Failure{
                            frame_id: stats.frame_id, message: e.to_string()}),
                    }
                    Ok(())
                },
                PipelineMsg::Event(event) => p.handle_event(&event),
                PipelineMsg::TxBuf(buf) => {
                    p.handle_tx_buf(&buf);
                    Ok(())
                },
                PipelineMsg::Command(command, sync) => {
                    let result = p.handle_command(command);
                    match sync {
                        Some(signal) => {
                            signal.done(result);
                            Ok(())
                        },
                        None => result,
                    }
                },
            }
        })?);

        let sink = self.sink.clone();
        workers.push(Worker::spawn("apply", q.apply.clone(), move |msg: ApplyMsg| {
            match msg {
                ApplyMsg::Params(params) => sink.apply(&params),
                ApplyMsg::Failure{frame_id, message} => sink.on_failure(frame_id, &message),
            }
            Ok(())
        })?);
        Ok(())
    }

    fn is_started(&self) -> bool {
        matches!(self.state(), EngineState::Started | EngineState::Running)
    }

    // Inbound.

    /// Queues one frame's statistics for analysis. Ignored (with the frame
    /// discarded at the next start()) while the engine is not started.
    pub fn push_stats(&self, stats: IspStatsBuffer) {
        self.queues.stats.push(stats);
    }

    pub fn push_evts(&self, event: HwEvent) {
        self.queues.events.push(event);
    }

    pub fn push_tx_buf(&self, buf: TxBuffer) {
        self.queues.tx_bufs.push(buf);
    }

    // Control commands.

    /// Runs `command` at a frame boundary. While not started there is no
    /// frame pass to wait for and the command runs on the caller's thread.
    fn send_command(&self, command: ControlCommand, sync: bool)
                    -> Result<(), CanonicalError> {
        if !self.is_started() {
            let mut pipeline = self.pipeline.lock().unwrap();
            return match pipeline.as_mut() {
                Some(p) => p.handle_command(command),
                None => Err(failed_precondition_error(
                    "commands require a prepared engine")),
            };
        }
        if !sync {
            self.queues.commands.push(CommandMsg{command, sync: None});
            return Ok(());
        }
        let (signal, waiter) = sync_pair();
        self.queues.commands.push(CommandMsg{command, sync: Some(signal)});
        waiter.wait()
    }

    /// Switches working mode and re-prepares every algorithm. Returns once the
    /// switch has taken effect.
    pub fn set_working_mode(&self, mode: WorkingMode) -> Result<(), CanonicalError> {
        self.send_command(ControlCommand::SetWorkingMode(mode), true)
    }

    pub fn set_cps_lt_cfg(&self, cfg: CpsLtCfg) -> Result<(), CanonicalError> {
        self.send_command(ControlCommand::SetCpsLtCfg(cfg), false)
    }

    pub fn set_gray_mode(&self, mode: GrayMode) -> Result<(), CanonicalError> {
        self.send_command(ControlCommand::SetGrayMode(mode), false)
    }

    /// Swaps in a new calibration and re-prepares every algorithm. Returns
    /// once the switch has taken effect.
    pub fn update_calib(&self, calib: Arc<CalibDb>) -> Result<(), CanonicalError> {
        calib.validate()?;
        self.send_command(ControlCommand::UpdateCalib(calib.clone()), true)?;
        *self.calib.lock().unwrap() = calib;
        Ok(())
    }

    // Registry.

    /// Registers a plugin implementation. It is prepared before its first
    /// frame; unless an earlier registered implementation of its type is
    /// enabled it becomes the current one.
    pub fn add_algo<T: AlgoTraits>(&self, desc: AlgoDescriptor<T>)
                                   -> Result<Arc<AlgoHandle<T>>, CanonicalError> {
        self.registry.add_algo(desc, self.calib())
    }

    pub fn rm_algo(&self, algo_type: AlgoType, id: AlgoId) -> Result<(), CanonicalError> {
        self.registry.rm_algo(algo_type, id)
    }

    pub fn enable_algo(&self, algo_type: AlgoType, id: AlgoId, enable: bool)
                       -> Result<(), CanonicalError> {
        self.registry.enable_algo(algo_type, id, enable)
    }

    /// The handle the orchestrator currently runs for `algo_type`.
    pub fn get_axlib_ctx(&self, algo_type: AlgoType) -> Option<Arc<dyn DynAlgoHandle>> {
        self.registry.current(algo_type)
    }

    /// Typed access to the current handle of `algo_type`.
    pub fn get_aiq_algo_handle<T: AlgoTraits>(&self, algo_type: AlgoType)
                                              -> Result<Arc<AlgoHandle<T>>, CanonicalError> {
        self.registry.current_typed::<T>(algo_type)
    }

    pub fn describe_algos(&self) -> Vec<AlgoInfo> {
        self.registry.describe()
    }

    // Statistics sharing.

    /// Newest statistics snapshot not yet returned by this method, waiting up
    /// to `timeout`. Dropping the returned reference (or passing it to
    /// release_3a_stats_ref) returns its slot.
    pub fn get_3a_stats_from_cached_list(&self, timeout: Duration)
                                         -> Result<StatsRef, CanonicalError> {
        self.stats_pool.get_3a_stats(timeout)
    }

    pub async fn get_3a_stats_async(&self, timeout: Duration)
                                    -> Result<StatsRef, CanonicalError> {
        self.stats_pool.clone().get_3a_stats_async(timeout).await
    }

    pub fn get_cached_stats(&self, frame_id: u32) -> Option<StatsRef> {
        self.stats_pool.get_by_frame(frame_id)
    }

    pub fn release_3a_stats_ref(&self, stats: StatsRef) {
        self.stats_pool.release(stats);
    }

    // Attributes.

    /// Sets the attributes of the current `algo_type` implementation. While
    /// started, waits up to the configured acknowledge timeout for the
    /// orchestrator to apply them.
    pub fn set_attrib<T: AlgoTraits>(&self, algo_type: AlgoType, attrib: T::Attrib)
                                     -> Result<AttribOutcome, CanonicalError> {
        let handle = self.registry.current_typed::<T>(algo_type)?;
        match handle.set_attrib(attrib)? {
            AttribUpdate::Unchanged => Ok(AttribOutcome::Unchanged),
            AttribUpdate::Applied => Ok(AttribOutcome::Applied),
            AttribUpdate::Pending(ticket) => {
                match ticket.wait(self.config.attrib_ack_timeout) {
                    Ok(()) => Ok(AttribOutcome::Applied),
                    Err(e) if matches!(e.code, CanonicalErrorCode::DeadlineExceeded) => {
                        warn!("{} attribute update still queued after {:?}",
                              algo_type, self.config.attrib_ack_timeout);
                        Ok(AttribOutcome::Queued)
                    },
                    Err(e) => Err(e),
                }
            },
        }
    }

    pub fn get_attrib<T: AlgoTraits>(&self, algo_type: AlgoType)
                                     -> Result<T::Attrib, CanonicalError> {
        Ok(self.registry.current_typed::<T>(algo_type)?.get_attrib())
    }
}

fn mark_running(state: &Mutex<EngineState>) {
    let mut state = state.lock().unwrap();
    if *state == EngineState::Started {
        *state = EngineState::Running;
        info!("Engine running");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error stopping engine: {}", e);
        }
    }
}
