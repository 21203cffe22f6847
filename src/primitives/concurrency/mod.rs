use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{CacheError, Result};

/// One-shot barrier that releases waiters once every initial population unit
/// has finished.
///
/// Each unit brackets its listing with [`ReadinessGate::add`] and
/// [`ReadinessGate::remove`] (or holds a [`GateTicket`]). [`ReadinessGate::wait`]
/// parks until the counter first reaches zero; after that the gate stays open
/// and later add/remove pairs never block waiters again.
#[derive(Clone, Default)]
pub struct ReadinessGate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    state: Mutex<GateState>,
    opened: Condvar,
}

#[derive(Default, Debug)]
struct GateState {
    pending: usize,
    open: bool,
}

/// Snapshot of gate state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    /// Population units still in flight.
    pub pending: usize,
    /// Whether the gate has released its waiters at least once.
    pub open: bool,
}

impl ReadinessGate {
    /// Creates a gate with no pending units.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one outstanding population unit.
    pub fn add(&self) {
        let mut state = self.inner.state.lock();
        state.pending += 1;
        debug!(pending = state.pending, "readiness.add");
    }

    /// Completes one population unit, releasing waiters when none remain.
    pub fn remove(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.pending == 0 {
            error!("readiness.remove.underflow");
            return Err(CacheError::GateUnderflow);
        }
        state.pending -= 1;
        debug!(pending = state.pending, "readiness.remove");
        if state.pending == 0 && !state.open {
            state.open = true;
            self.inner.opened.notify_all();
            debug!("readiness.open");
        }
        Ok(())
    }

    /// Registers a unit and returns a guard that completes it on drop.
    pub fn enter(&self) -> GateTicket {
        self.add();
        GateTicket {
            gate: Some(self.clone()),
        }
    }

    /// Blocks until the gate is open or nothing is pending.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.open && state.pending > 0 {
            self.inner.opened.wait(&mut state);
        }
    }

    /// Like [`ReadinessGate::wait`] with an upper bound. Returns true when the
    /// gate let the caller through.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.open && state.pending > 0 {
            if self
                .inner
                .opened
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.open || state.pending == 0;
            }
        }
        true
    }

    /// Number of population units still in flight.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending
    }

    /// Returns a snapshot of the current gate state.
    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.inner.state.lock();
        GateSnapshot {
            pending: state.pending,
            open: state.open,
        }
    }
}

/// Guard for one population unit; completes the unit when dropped.
pub struct GateTicket {
    gate: Option<ReadinessGate>,
}

impl GateTicket {
    /// Completes the unit now instead of at drop time.
    pub fn complete(mut self) -> Result<()> {
        match self.gate.take() {
            Some(gate) => gate.remove(),
            None => Ok(()),
        }
    }
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            if let Err(_err) = gate.remove() {
                #[cfg(debug_assertions)]
                eprintln!("failed to release readiness ticket: {_err:?}");
            }
        }
    }
}

/// Cooperative cancellation flag shared by background workers.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl CancelToken {
    /// Creates a live token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token and wakes every sleeper.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.wakeup.notify_all();
    }

    /// Returns true once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleeps for `duration` unless cancelled first. Returns true when the
    /// sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self
                .inner
                .wakeup
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                break;
            }
        }
        *cancelled
    }
}
