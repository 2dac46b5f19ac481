// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Recent statistics snapshots shared with external readers.
//!
//! The orchestrator publishes one snapshot per analyzed frame into a pooled,
//! reference-counted slot. Readers either wait for the next fresh snapshot
//! (get_3a_stats) or look one up by frame id (get_by_frame). A reader's
//! reference keeps its slot out of circulation until dropped, so the pool is
//! sized well above the expected number of concurrently held snapshots. When
//! it runs dry anyway the producer evicts the newest snapshot nobody holds,
//! and failing that drops the incoming frame; it never waits for a reader.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, deadline_exceeded_error, internal_error};
use log::{trace, warn};

use crate::pool::{Loaned, Pool, Shared, ref_count};
use crate::sensor::WorkingMode;
use crate::stats::AnalyzerStats;

/// Generous relative to the handful of snapshots a reader typically holds.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Number of most recent snapshots retained for lookup by frame id.
pub const DEFAULT_CACHE_LEN: usize = 4;

#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    pub frame_id: u32,
    pub working_mode: WorkingMode,
    pub stats: AnalyzerStats,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        StatsSnapshot {
            frame_id: 0,
            working_mode: WorkingMode::Normal,
            stats: AnalyzerStats::empty(0),
        }
    }
}

pub type StatsRef = Shared<StatsSnapshot>;

struct Entry {
    snapshot: StatsRef,
    // Set once get_3a_stats() has handed this (or a newer) snapshot out.
    delivered: bool,
}

pub struct StatsSharingPool {
    pool: Pool<StatsSnapshot>,
    entries: Mutex<VecDeque<Entry>>,
    ready: Condvar,
    cache_len: usize,
}

impl StatsSharingPool {
    pub fn new(pool_size: usize, cache_len: usize) -> Self {
        StatsSharingPool {
            pool: Pool::new("stats", pool_size, StatsSnapshot::default),
            entries: Mutex::new(VecDeque::with_capacity(cache_len + 1)),
            ready: Condvar::new(),
            cache_len,
        }
    }

    /// Copies `stats` into a pool slot and publishes it. Returns false if the
    /// frame had to be dropped because every slot is held by readers.
    pub fn publish(&self, stats: &AnalyzerStats, working_mode: WorkingMode) -> bool {
        let Some(mut slot) = self.acquire_slot() else {
            warn!("Stats pool exhausted, dropping snapshot of frame {}", stats.frame_id);
            return false;
        };
        slot.frame_id = stats.frame_id;
        slot.working_mode = working_mode;
        slot.stats.clone_from(stats);
        let snapshot = slot.share();

        let mut entries = self.entries.lock().unwrap();
        entries.push_back(Entry{snapshot, delivered: false});
        while entries.len() > self.cache_len {
            entries.pop_front();
        }
        trace!("Published stats of frame {}", stats.frame_id);
        self.ready.notify_all();
        true
    }

    fn acquire_slot(&self) -> Option<Loaned<StatsSnapshot>> {
        if let Some(slot) = self.pool.try_acquire() {
            return Some(slot);
        }
        {
            let mut entries = self.entries.lock().unwrap();
            // Only the cache holds a reference to these.
            if let Some(pos) = entries.iter().rposition(|e| ref_count(&e.snapshot) == 1) {
                let evicted = entries.remove(pos);
                if let Some(e) = &evicted {
                    trace!("Evicting stats of frame {}", e.snapshot.frame_id);
                }
            }
        }
        self.pool.try_acquire()
    }

    /// Returns the newest snapshot not yet handed out by this method, waiting
    /// up to `timeout` for one to be published. Older undelivered snapshots
    /// are skipped. Returns DeadlineExceeded if none became ready in time.
    pub fn get_3a_stats(&self, timeout: Duration) -> Result<StatsRef, CanonicalError> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock().unwrap();
        loop {
            if let Some(pos) = entries.iter().rposition(|e| !e.delivered) {
                for e in entries.iter_mut().take(pos + 1) {
                    e.delivered = true;
                }
                return Ok(entries[pos].snapshot.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(deadline_exceeded_error(
                    format!("no 3A stats ready within {:?}", timeout).as_str()));
            }
            entries = self.ready.wait_timeout(entries, deadline - now).unwrap().0;
        }
    }

    /// As get_3a_stats(), for callers running inside a tokio runtime.
    pub async fn get_3a_stats_async(self: Arc<Self>, timeout: Duration)
                                    -> Result<StatsRef, CanonicalError> {
        match tokio::task::spawn_blocking(move || self.get_3a_stats(timeout)).await {
            Ok(result) => result,
            Err(e) => Err(internal_error(&e.to_string())),
        }
    }

    /// Snapshot of `frame_id` if it is still among the retained ones.
    pub fn get_by_frame(&self, frame_id: u32) -> Option<StatsRef> {
        self.entries.lock().unwrap().iter()
            .rev()
            .find(|e| e.snapshot.frame_id == frame_id)
            .map(|e| e.snapshot.clone())
    }

    /// Gives a reference back. Equivalent to dropping it.
    pub fn release(&self, stats: StatsRef) {
        drop(stats);
    }

    /// Forgets all retained snapshots. References held by readers stay valid.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn free_slots(&self) -> usize {
        self.pool.available()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn stats(frame_id: u32) -> AnalyzerStats {
        AnalyzerStats::empty(frame_id)
    }

    #[test]
    fn empty_pool_times_out() {
        let pool = StatsSharingPool::new(4, 2);
        let start = Instant::now();
        assert!(pool.get_3a_stats(Duration::from_millis(30)).is_err());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn newest_snapshot_is_delivered_once() {
        let pool = StatsSharingPool::new(4, 3);
        pool.publish(&stats(1), WorkingMode::Normal);
        pool.publish(&stats(2), WorkingMode::Normal);
        let s = pool.get_3a_stats(Duration::ZERO).unwrap();
        assert_eq!(s.frame_id, 2);
        // Frame 1 was skipped, frame 2 already delivered.
        assert!(pool.get_3a_stats(Duration::ZERO).is_err());
        // Both are still available by frame id.
        assert_eq!(pool.get_by_frame(1).unwrap().frame_id, 1);
    }

    #[test]
    fn waiter_wakes_on_publish() {
        let pool = Arc::new(StatsSharingPool::new(4, 2));
        let reader = {
            let pool = pool.clone();
            thread::spawn(move || pool.get_3a_stats(Duration::from_secs(5)).map(|s| s.frame_id))
        };
        thread::sleep(Duration::from_millis(20));
        pool.publish(&stats(9), WorkingMode::Normal);
        assert_eq!(reader.join().unwrap().unwrap(), 9);
    }

    #[test]
    fn cache_is_bounded() {
        let pool = StatsSharingPool::new(4, 2);
        for f in 1..=5 {
            assert!(pool.publish(&stats(f), WorkingMode::Normal));
        }
        assert!(pool.get_by_frame(3).is_none());
        assert!(pool.get_by_frame(4).is_some());
        assert!(pool.get_by_frame(5).is_some());
        // Cache references 2 slots; the rest are free.
        assert_eq!(pool.free_slots(), 2);
    }

    #[test]
    fn held_references_are_never_recycled() {
        let pool = StatsSharingPool::new(2, 2);
        pool.publish(&stats(1), WorkingMode::Normal);
        let held1 = pool.get_by_frame(1).unwrap();
        pool.publish(&stats(2), WorkingMode::Normal);
        let held2 = pool.get_by_frame(2).unwrap();
        // Both slots are held by readers: the new frame is dropped.
        assert!(!pool.publish(&stats(3), WorkingMode::Normal));
        assert_eq!(held1.frame_id, 1);
        assert_eq!(held2.frame_id, 2);

        // Releasing one lets the producer evict it and continue.
        pool.release(held2);
        assert!(pool.publish(&stats(4), WorkingMode::Normal));
        assert!(pool.get_by_frame(2).is_none());
        assert_eq!(held1.frame_id, 1);
    }
}
