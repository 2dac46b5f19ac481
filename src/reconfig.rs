// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Live attribute updates for one algorithm handle.
//!
//! A caller stages a new attribute value; the orchestrator applies it at the
//! safe point after the handle's post_process and acknowledges the caller.
//! When no orchestrator is running there is nobody to rendezvous with, so the
//! update is applied inline instead. Which of the two happened is visible in
//! the returned AttribUpdate.

use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use canonical_error::{CanonicalError, aborted_error, deadline_exceeded_error,
                      failed_precondition_error, internal_error};

/// What set_attrib() did with the request.
#[derive(Debug)]
pub enum AttribUpdate {
    /// The value equals the current (or already staged) one.
    Unchanged,
    /// Applied inline; effective for the next frame pass.
    Applied,
    /// Staged for the orchestrator; the ticket resolves once it is applied.
    Pending(AckTicket),
}

/// Resolves when the orchestrator has applied a staged attribute update.
#[derive(Debug)]
pub struct AckTicket {
    rx: Receiver<Result<(), String>>,
}

impl AckTicket {
    /// Blocks for at most `timeout`. Returns DeadlineExceeded if the update is
    /// still staged when the timeout elapses; the update then stays queued for
    /// the next pass.
    pub fn wait(self, timeout: Duration) -> Result<(), CanonicalError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(failed_precondition_error(
                format!("attribute update rejected: {}", msg).as_str())),
            Err(RecvTimeoutError::Timeout) => Err(deadline_exceeded_error(
                format!("attribute update not applied within {:?}", timeout).as_str())),
            Err(RecvTimeoutError::Disconnected) => Err(aborted_error(
                "attribute update discarded before it was applied")),
        }
    }

    /// As wait(), for callers running inside a tokio runtime.
    pub async fn wait_async(self, timeout: Duration) -> Result<(), CanonicalError> {
        match tokio::task::spawn_blocking(move || self.wait(timeout)).await {
            Ok(result) => result,
            Err(e) => Err(internal_error(&e.to_string())),
        }
    }
}

struct AttribSlots<A> {
    current: A,
    staged: Option<A>,
    waiters: Vec<Sender<Result<(), String>>>,
}

/// New/current attribute pair plus the pending acknowledgements, guarded by a
/// per-handle mutex.
pub struct ReconfigChannel<A> {
    slots: Mutex<AttribSlots<A>>,
}

impl<A: Clone + PartialEq> ReconfigChannel<A> {
    pub fn new(initial: A) -> Self {
        ReconfigChannel {
            slots: Mutex::new(AttribSlots {
                current: initial,
                staged: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Requests `attrib`. With `running` false, `apply` is called inline and
    /// its error (if any) is returned with no state change. With `running`
    /// true, the value replaces any previously staged one and a ticket is
    /// returned; all outstanding tickets resolve together when applied.
    pub fn request<F>(&self, attrib: A, running: bool, apply: F)
                      -> Result<AttribUpdate, CanonicalError>
    where F: FnOnce(&A) -> Result<(), CanonicalError>
    {
        let mut slots = self.slots.lock().unwrap();
        let target = slots.staged.as_ref().unwrap_or(&slots.current);
        if *target == attrib && slots.staged.is_none() {
            return Ok(AttribUpdate::Unchanged);
        }
        if !running {
            apply(&attrib)?;
            slots.current = attrib;
            slots.staged = None;
            for waiter in slots.waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            return Ok(AttribUpdate::Applied);
        }
        slots.staged = Some(attrib);
        let (tx, rx) = mpsc::channel();
        slots.waiters.push(tx);
        Ok(AttribUpdate::Pending(AckTicket{rx}))
    }

    /// Applies the staged value, if any, and acknowledges its waiters. On
    /// failure the current value is kept. Returns true if a staged value was
    /// consumed.
    pub fn update_config<F>(&self, apply: F) -> bool
    where F: FnOnce(&A) -> Result<(), CanonicalError>
    {
        let mut slots = self.slots.lock().unwrap();
        let Some(staged) = slots.staged.take() else {
            return false;
        };
        let result = apply(&staged).map_err(|e| e.to_string());
        if result.is_ok() {
            slots.current = staged;
        }
        for waiter in slots.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        true
    }

    pub fn current(&self) -> A {
        self.slots.lock().unwrap().current.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.slots.lock().unwrap().staged.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use canonical_error::invalid_argument_error;

    #[test]
    fn unchanged_value_is_a_no_op() {
        let chan = ReconfigChannel::new(5);
        let update = chan.request(5, true, |_| panic!("must not apply")).unwrap();
        assert!(matches!(update, AttribUpdate::Unchanged));
        assert!(!chan.has_pending());
    }

    #[test]
    fn not_running_applies_inline() {
        let chan = ReconfigChannel::new(5);
        let mut applied = None;
        let update = chan.request(7, false, |v| { applied = Some(*v); Ok(()) }).unwrap();
        assert!(matches!(update, AttribUpdate::Applied));
        assert_eq!(applied, Some(7));
        assert_eq!(chan.current(), 7);
    }

    #[test]
    fn inline_failure_changes_nothing() {
        let chan = ReconfigChannel::new(5);
        let result = chan.request(7, false, |_| Err(invalid_argument_error("bad")));
        assert!(result.is_err());
        assert_eq!(chan.current(), 5);
    }

    #[test]
    fn running_update_is_acknowledged_at_safe_point() {
        let chan = Arc::new(ReconfigChannel::new(5));
        let AttribUpdate::Pending(ticket) = chan.request(9, true, |_| Ok(())).unwrap() else {
            panic!("expected a pending update");
        };
        assert_eq!(chan.current(), 5);
        let applier = {
            let chan = chan.clone();
            thread::spawn(move || chan.update_config(|_| Ok(())))
        };
        assert!(ticket.wait(Duration::from_secs(5)).is_ok());
        assert!(applier.join().unwrap());
        assert_eq!(chan.current(), 9);
    }

    #[test]
    fn wait_times_out_when_nobody_applies() {
        let chan = ReconfigChannel::new(5);
        let AttribUpdate::Pending(ticket) = chan.request(9, true, |_| Ok(())).unwrap() else {
            panic!("expected a pending update");
        };
        assert!(ticket.wait(Duration::from_millis(20)).is_err());
        // Still staged for the next pass.
        assert!(chan.has_pending());
        assert!(chan.update_config(|_| Ok(())));
        assert_eq!(chan.current(), 9);
    }

    #[test]
    fn restaging_supersedes_but_acks_everyone() {
        let chan = ReconfigChannel::new(1);
        let AttribUpdate::Pending(t1) = chan.request(2, true, |_| Ok(())).unwrap() else {
            panic!();
        };
        let AttribUpdate::Pending(t2) = chan.request(3, true, |_| Ok(())).unwrap() else {
            panic!();
        };
        let mut seen = None;
        chan.update_config(|v| { seen = Some(*v); Ok(()) });
        assert_eq!(seen, Some(3));
        assert!(t1.wait(Duration::from_millis(10)).is_ok());
        assert!(t2.wait(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn rejected_update_reports_error() {
        let chan = ReconfigChannel::new(1);
        let AttribUpdate::Pending(ticket) = chan.request(2, true, |_| Ok(())).unwrap() else {
            panic!();
        };
        chan.update_config(|_| Err(invalid_argument_error("nope")));
        assert!(ticket.wait(Duration::from_millis(10)).is_err());
        assert_eq!(chan.current(), 1);
    }

    #[tokio::test]
    async fn async_wait() {
        let chan = ReconfigChannel::new(1);
        let AttribUpdate::Pending(ticket) = chan.request(2, true, |_| Ok(())).unwrap() else {
            panic!();
        };
        chan.update_config(|_| Ok(()));
        assert!(ticket.wait_async(Duration::from_secs(1)).await.is_ok());
    }
}
