// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Counters updated by the orchestrator and read by anyone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::algo_type::{AlgoType, PROCESSING_ORDER};

#[derive(Debug)]
pub struct PipelineMetrics {
    frames_analyzed: AtomicU64,
    frames_dropped: AtomicU64,
    params_dropped: AtomicU64,
    // Indexed by AlgoType::index().
    bypass_counts: Vec<AtomicU64>,
    failure_counts: Vec<AtomicU64>,
    last_pass_us: AtomicU64,
    started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        PipelineMetrics {
            frames_analyzed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            params_dropped: AtomicU64::new(0),
            bypass_counts: (0..AlgoType::COUNT).map(|_| AtomicU64::new(0)).collect(),
            failure_counts: (0..AlgoType::COUNT).map(|_| AtomicU64::new(0)).collect(),
            last_pass_us: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_pass(&self, elapsed: Duration) {
        self.frames_analyzed.fetch_add(1, Ordering::Relaxed);
        self.last_pass_us.store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A pass completed but no params buffer was free to carry its result.
    pub fn record_dropped_params(&self) {
        self.params_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self, algo_type: AlgoType) {
        self.bypass_counts[algo_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, algo_type: AlgoType) {
        self.failure_counts[algo_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_analyzed(&self) -> u64 {
        self.frames_analyzed.load(Ordering::Relaxed)
    }

    pub fn bypasses(&self, algo_type: AlgoType) -> u64 {
        self.bypass_counts[algo_type.index()].load(Ordering::Relaxed)
    }

    pub fn failures(&self, algo_type: AlgoType) -> u64 {
        self.failure_counts[algo_type.index()].load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> MetricsSummary {
        let per_type = |counts: &[AtomicU64]| -> Vec<(AlgoType, u64)> {
            PROCESSING_ORDER.iter()
                .map(|t| (*t, counts[t.index()].load(Ordering::Relaxed)))
                .filter(|(_, n)| *n > 0)
                .collect()
        };
        let frames = self.frames_analyzed();
        let elapsed = self.started_at.elapsed().as_secs_f64();
        MetricsSummary {
            frames_analyzed: frames,
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            params_dropped: self.params_dropped.load(Ordering::Relaxed),
            bypasses: per_type(&self.bypass_counts),
            failures: per_type(&self.failure_counts),
            last_pass: Duration::from_micros(self.last_pass_us.load(Ordering::Relaxed)),
            fps: if elapsed > 0.01 { frames as f64 / elapsed } else { 0.0 },
        }
    }
}

/// Point-in-time copy of PipelineMetrics. Per-type lists omit zero counts.
#[derive(Clone, Debug)]
pub struct MetricsSummary {
    pub frames_analyzed: u64,
    pub frames_dropped: u64,
    pub params_dropped: u64,
    pub bypasses: Vec<(AlgoType, u64)>,
    pub failures: Vec<(AlgoType, u64)>,
    pub last_pass: Duration,
    pub fps: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_type_counts() {
        let m = PipelineMetrics::new();
        m.record_bypass(AlgoType::Awb);
        m.record_bypass(AlgoType::Awb);
        m.record_failure(AlgoType::Anr);
        m.record_pass(Duration::from_micros(1500));
        let s = m.summary();
        assert_eq!(s.frames_analyzed, 1);
        assert_eq!(s.bypasses, vec![(AlgoType::Awb, 2)]);
        assert_eq!(s.failures, vec![(AlgoType::Anr, 1)]);
        assert_eq!(s.last_pass, Duration::from_micros(1500));
        assert_eq!(m.bypasses(AlgoType::Ae), 0);
    }
}
