// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Blocking FIFO queues, the worker threads that drain them, and the
//! rendezvous used by synchronous messages.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, aborted_error, deadline_exceeded_error,
                      resource_exhausted_error};
use log::{debug, error, info, warn};

struct QueueState<T> {
    items: VecDeque<T>,
    paused: bool,
}

/// FIFO whose push never blocks and whose pop blocks until an item arrives or
/// the queue is paused. A new queue starts paused.
pub struct MessageQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    cond: Condvar,
    // Beyond this many queued items the oldest droppable item is dropped.
    soft_limit: usize,
    droppable: fn(&T) -> bool,
}

impl<T> MessageQueue<T> {
    pub fn new(name: &'static str, soft_limit: usize) -> Self {
        Self::with_drop_policy(name, soft_limit, |_| true)
    }

    /// Only items for which `droppable` holds are evicted at the soft limit.
    /// When none is, the queue grows past the limit rather than lose one.
    pub fn with_drop_policy(name: &'static str, soft_limit: usize,
                            droppable: fn(&T) -> bool) -> Self {
        MessageQueue {
            name,
            state: Mutex::new(QueueState{items: VecDeque::new(), paused: true}),
            cond: Condvar::new(),
            soft_limit: soft_limit.max(1),
            droppable,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        if state.items.len() >= self.soft_limit {
            match state.items.iter().position(|i| (self.droppable)(i)) {
                Some(pos) => {
                    warn!("{} queue full ({} items), dropping oldest",
                          self.name, self.soft_limit);
                    state.items.remove(pos);
                }
                None => {
                    warn!("{} queue over its limit of {} ({} items kept)",
                          self.name, self.soft_limit, state.items.len() + 1);
                }
            }
        }
        state.items.push_back(item);
        self.cond.notify_one();
    }

    /// Blocks until an item is available. Returns None once the queue is
    /// paused, even if items remain.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.paused {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Pauses the queue so that blocked and future pops return None,
    /// optionally discarding queued items.
    pub fn trigger_stop(&self, clear: bool) {
        let mut state = self.state.lock().unwrap();
        state.paused = true;
        if clear {
            state.items.clear();
        }
        self.cond.notify_all();
    }

    /// Discards anything queued while stopped, then resumes pops.
    pub fn trigger_start(&self) {
        let mut state = self.state.lock().unwrap();
        let stale = state.items.len();
        if stale > 0 {
            debug!("{} queue: discarding {} stale items", self.name, stale);
        }
        state.items.clear();
        state.paused = false;
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }
}

/// Thread draining one MessageQueue. The loop ends when the queue is paused;
/// handler errors are logged and never end the loop.
pub struct Worker {
    name: String,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<T, F>(name: &str, queue: Arc<MessageQueue<T>>, mut handler: F)
                       -> Result<Worker, CanonicalError>
    where T: Send + 'static,
          F: FnMut(T) -> Result<(), CanonicalError> + Send + 'static
    {
        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("{} worker started", thread_name);
                while let Some(item) = queue.pop() {
                    if let Err(e) = handler(item) {
                        warn!("{} worker: {}", thread_name, e);
                    }
                }
                debug!("{} worker exiting", thread_name);
            })
            .map_err(|e| resource_exhausted_error(
                format!("cannot spawn {} worker: {}", name, e).as_str()))?;
        Ok(Worker{name: name.to_string(), thread: Some(thread)})
    }

    /// Waits for the thread to exit. The caller must have paused its queue.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{} worker panicked", self.name);
            } else {
                info!("{} worker joined", self.name);
            }
        }
    }
}

type SyncState = Arc<(Mutex<Option<Result<(), CanonicalError>>>, Condvar)>;

/// Completion side of a synchronous message; travels with the message. If it
/// is dropped without done() (e.g. the message was discarded by a stop), the
/// waiter is released with Aborted.
pub struct SyncSignal {
    state: Option<SyncState>,
}

/// Caller side of a synchronous message.
pub struct SyncWaiter {
    state: SyncState,
}

pub fn sync_pair() -> (SyncSignal, SyncWaiter) {
    let state: SyncState = Arc::new((Mutex::new(None), Condvar::new()));
    (SyncSignal{state: Some(state.clone())}, SyncWaiter{state})
}

impl SyncSignal {
    pub fn done(mut self, result: Result<(), CanonicalError>) {
        if let Some(state) = self.state.take() {
            Self::complete(&state, result);
        }
    }

    fn complete(state: &SyncState, result: Result<(), CanonicalError>) {
        let (lock, cond) = &**state;
        *lock.lock().unwrap() = Some(result);
        cond.notify_all();
    }
}

impl Drop for SyncSignal {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            Self::complete(&state, Err(aborted_error("message discarded")));
        }
    }
}

impl SyncWaiter {
    /// Blocks until the consumer has handled the message.
    pub fn wait(self) -> Result<(), CanonicalError> {
        let (lock, cond) = &*self.state;
        let mut done = lock.lock().unwrap();
        while done.is_none() {
            done = cond.wait(done).unwrap();
        }
        done.take().unwrap_or_else(|| Err(aborted_error("no completion recorded")))
    }

    /// Like wait(), bounded by `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<(), CanonicalError> {
        let deadline = Instant::now() + timeout;
        let (lock, cond) = &*self.state;
        let mut done = lock.lock().unwrap();
        while done.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return Err(deadline_exceeded_error(
                    format!("synchronous message not handled within {:?}", timeout).as_str()));
            }
            done = cond.wait_timeout(done, deadline - now).unwrap().0;
        }
        done.take().unwrap_or_else(|| Err(aborted_error("no completion recorded")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use canonical_error::{CanonicalErrorCode, invalid_argument_error, not_found_error};

    #[test]
    fn fifo_order() {
        let q = MessageQueue::new("test", 16);
        q.trigger_start();
        for i in 0..5 {
            q.push(i);
        }
        let popped: Vec<i32> = (0..5).map(|_| q.pop().unwrap()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn paused_queue_pops_none() {
        let q = MessageQueue::new("test", 16);
        q.push(1);
        assert!(q.pop().is_none());
    }

    #[test]
    fn start_discards_items_pushed_while_stopped() {
        let q = MessageQueue::new("test", 16);
        q.trigger_start();
        q.push(1);
        q.trigger_stop(false);
        q.push(2);
        q.trigger_start();
        assert!(q.is_empty());
        q.push(3);
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn soft_limit_drops_oldest() {
        let q = MessageQueue::new("test", 2);
        q.trigger_start();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn soft_limit_never_drops_kept_items() {
        // Negative values stand in for control messages.
        let q = MessageQueue::with_drop_policy("test", 3, |n: &i32| *n >= 0);
        q.trigger_start();
        q.push(-1);
        for i in 0..10 {
            q.push(i);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(-1));
        assert_eq!(q.pop(), Some(8));
        assert_eq!(q.pop(), Some(9));

        // With nothing droppable the queue grows.
        for _ in 0..5 {
            q.push(-2);
        }
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn stop_releases_worker() {
        let q = Arc::new(MessageQueue::new("test", 16));
        q.trigger_start();
        let seen = Arc::new(AtomicUsize::new(0));
        let worker = {
            let seen = seen.clone();
            Worker::spawn("test", q.clone(), move |n: usize| {
                seen.fetch_add(n, Ordering::SeqCst);
                if n == 2 {
                    return Err(aborted_error("handler errors do not stop the loop"));
                }
                Ok(())
            }).unwrap()
        };
        q.push(1);
        q.push(2);
        q.push(3);
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) < 6 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        q.trigger_stop(true);
        worker.join();
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn sync_message_rendezvous() {
        let (signal, waiter) = sync_pair();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.done(Ok(()));
        });
        assert!(waiter.wait().is_ok());
        t.join().unwrap();
    }

    #[test]
    fn discarded_sync_message_releases_waiter() {
        let (signal, waiter) = sync_pair();
        drop(signal);
        let err = waiter.wait_timeout(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::Aborted));
    }

    #[test]
    fn sync_error_keeps_its_code() {
        let (signal, waiter) = sync_pair();
        signal.done(Err(invalid_argument_error("gain out of range")));
        let err = waiter.wait().unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::InvalidArgument));
        assert!(err.to_string().contains("gain out of range"));

        let (signal, waiter) = sync_pair();
        signal.done(Err(not_found_error("no such mode")));
        let err = waiter.wait_timeout(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::NotFound));
    }

    #[test]
    fn sync_wait_times_out() {
        let (_signal, waiter) = sync_pair();
        assert!(waiter.wait_timeout(Duration::from_millis(10)).is_err());
    }
}
