// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use env_logger;

use isp_engine::algo_type::PROCESSING_ORDER;
use isp_engine::calib::{CalibDb, CalibStore, StaticCalibSource};
use isp_engine::engine::{ChannelSink, Engine, EngineConfig};

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let (sink, _rx) = ChannelSink::new();
    let engine = Engine::init("default", &StaticCalibSource::new().with(CalibDb::default()),
                              &CalibStore::new(), EngineConfig::default(), sink).unwrap();

    let infos = engine.describe_algos();
    println!("Found {} algorithm implementations: ", infos.len());
    for algo_type in PROCESSING_ORDER {
        for info in infos.iter().filter(|i| i.algo_type == algo_type) {
            println!("{:8} id {:3} {:24} family {:?}{}{}",
                     algo_type.name(), info.id, info.name, algo_type.family(),
                     if info.enabled { "" } else { " (disabled)" },
                     if info.current { " *" } else { "" });
        }
    }
}
