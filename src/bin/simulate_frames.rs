// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use chrono::offset::Local;
use chrono::DateTime;
use clap::{Parser, ValueEnum};
use env_logger;
use log::{info, warn};

use isp_engine::algo_type::AlgoType;
use isp_engine::calib::{CalibDb, CalibStore, StaticCalibSource};
use isp_engine::engine::{ChannelSink, Engine, EngineConfig, SinkEvent};
use isp_engine::families::{Exposure, AeAttrib};
use isp_engine::sensor::{SensorDescriptor, WorkingMode};
use isp_engine::synthetic_stats::{Scene, SyntheticStatsSource};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Normal,
    Hdr2,
    Hdr3,
}

impl From<Mode> for WorkingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Normal => WorkingMode::Normal,
            Mode::Hdr2 => WorkingMode::Hdr2,
            Mode::Hdr3 => WorkingMode::Hdr3,
        }
    }
}

/// Runs the analysis engine against synthetic statistics, feeding each
/// frame's exposure and focus result back into the simulated sensor.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Number of frames to simulate.
    #[arg(short, long, default_value_t = 60)]
    frames: u32,

    #[arg(short, long, value_enum, default_value_t = Mode::Normal)]
    mode: Mode,

    /// Scene mean luma at 10ms exposure, unity gain.
    #[arg(short, long, default_value_t = 12.0)]
    brightness: f32,

    /// Exposure target luma; the calibration's target if omitted.
    #[arg(short, long)]
    target: Option<f32>,

    /// Frame interval in milliseconds.
    #[arg(short, long, default_value_t = 33)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mode = WorkingMode::from(args.mode);

    let (sink, rx) = ChannelSink::new();
    let engine = Engine::init("default", &StaticCalibSource::new().with(CalibDb::default()),
                              &CalibStore::new(), EngineConfig::default(), sink).unwrap();
    engine.prepare(SensorDescriptor::new("imx415", 3840, 2160), mode).unwrap();
    if let Some(target) = args.target {
        engine.set_attrib::<Exposure>(
            AlgoType::Ae, AeAttrib{target_luma: Some(target), manual: None}).unwrap();
    }
    engine.start().unwrap();

    let scene = Scene{brightness: args.brightness, ..Default::default()};
    let mut source = SyntheticStatsSource::new(scene, mode);
    let interval = Duration::from_millis(args.interval_ms);
    for _ in 0..args.frames {
        engine.push_stats(source.next_frame());
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(SinkEvent::Applied(params)) => {
                source.apply(&params);
                info!("frame {}: exposure {:?} gain {} wb r/b {:.2}/{:.2} lens {:?}",
                      params.frame_id, params.exposure.integration_time,
                      params.exposure.analog_gain, params.wb_gains.r, params.wb_gains.b,
                      params.lens_position);
            },
            Ok(SinkEvent::Failed{frame_id, message}) => {
                warn!("frame {} failed: {}", frame_id, message);
            },
            Err(RecvTimeoutError::Timeout) => warn!("no result within 1s"),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if let Ok(stats) = engine.get_3a_stats_async(Duration::ZERO).await {
            let datetime: DateTime<Local> = stats.stats.readout_time.into();
            info!("stats of frame {} read out at {}; mean luma {:?}",
                  stats.frame_id, datetime.format("%T%.3f"),
                  stats.stats.aec.as_ref().map(|a| a.mean_luma));
        }
        tokio::time::sleep(interval).await;
    }
    engine.stop().unwrap();

    let summary = engine.metrics().summary();
    info!("{} frames analyzed ({} dropped), last pass {:?}",
          summary.frames_analyzed, summary.frames_dropped, summary.last_pass);
    info!("bypasses: {:?}", summary.bypasses);
    info!("failures: {:?}", summary.failures);
}
