// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod algo_registry;
pub mod algo_type;
pub mod algorithm;
pub mod calib;
pub mod engine;
pub mod families;
pub mod handle;
pub mod metrics;
pub mod params;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod reconfig;
pub mod reference_algos;
pub mod sensor;
pub mod shared_state;
pub mod stats;
pub mod stats_sharing;
pub mod synthetic_stats;
