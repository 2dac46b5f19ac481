// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use isp_engine::calib::{CalibDb, CalibStore, StaticCalibSource};
use isp_engine::engine::{ChannelSink, Engine, EngineConfig, SinkEvent};
use isp_engine::params::FullParamsRef;
use isp_engine::sensor::{SensorDescriptor, WorkingMode};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub fn sensor() -> SensorDescriptor {
    SensorDescriptor::new("imx415", 1920, 1080)
}

pub fn engine_with(config: EngineConfig) -> (Engine, Receiver<SinkEvent>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (sink, rx) = ChannelSink::new();
    let engine = Engine::init("default", &StaticCalibSource::new().with(CalibDb::default()),
                              &CalibStore::new(), config, sink).unwrap();
    (engine, rx)
}

pub fn engine() -> (Engine, Receiver<SinkEvent>) {
    engine_with(EngineConfig::default())
}

pub fn prepared_engine() -> (Engine, Receiver<SinkEvent>) {
    let (engine, rx) = engine();
    engine.prepare(sensor(), WorkingMode::Normal).unwrap();
    (engine, rx)
}

/// Next parameter block delivered to the sink; panics on a failure event or
/// timeout.
pub fn next_params(rx: &Receiver<SinkEvent>) -> FullParamsRef {
    match rx.recv_timeout(RECV_TIMEOUT) {
        Ok(SinkEvent::Applied(params)) => params,
        Ok(SinkEvent::Failed{frame_id, message}) => {
            panic!("frame {} failed: {}", frame_id, message)
        },
        Err(e) => panic!("no parameters delivered: {}", e),
    }
}

/// Asserts nothing more arrives at the sink within `wait`.
pub fn assert_idle(rx: &Receiver<SinkEvent>, wait: Duration) {
    if let Ok(event) = rx.recv_timeout(wait) {
        panic!("unexpected sink event {:?}", event);
    }
}

pub fn calib() -> Arc<CalibDb> {
    Arc::new(CalibDb::default())
}
