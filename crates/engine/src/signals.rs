//! Lifecycle signals
//!
//! The host delivers shutdown, reload and worker-exit notifications through
//! [`ControlSignals`]. Each notification raises an edge-triggered flag and
//! sets the wake latch, so the orchestrator never busy-polls for them.

use crate::latch::{WakeEvents, WakeLatch};
use hibernator_core::CancelFlag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct SignalsInner {
    shutdown: AtomicBool,
    reload: AtomicBool,
    cancel: CancelFlag,
    latch: WakeLatch,
}

/// Shared handle for delivering lifecycle notifications.
///
/// Clones refer to the same flags and latch.
#[derive(Clone)]
pub struct ControlSignals {
    inner: Arc<SignalsInner>,
}

impl Default for ControlSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSignals {
    /// Create a fresh set of signals with nothing raised
    pub fn new() -> Self {
        ControlSignals {
            inner: Arc::new(SignalsInner {
                shutdown: AtomicBool::new(false),
                reload: AtomicBool::new(false),
                cancel: CancelFlag::new(),
                latch: WakeLatch::new(),
            }),
        }
    }

    /// The host is shutting down.
    ///
    /// Also cancels running restore jobs, which stop at their next record.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cancel.cancel();
        self.inner.latch.set();
    }

    /// The configuration should be reread
    pub fn request_reload(&self) {
        self.inner.reload.store(true, Ordering::Release);
        self.inner.latch.set();
    }

    /// A restore worker exited
    pub fn notify_worker_exit(&self) {
        self.inner.latch.set();
    }

    /// The supervising host process died
    pub fn host_died(&self) {
        self.inner.latch.mark_host_dead();
    }

    /// Whether shutdown was requested
    pub fn shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Consume a pending reload request
    pub fn take_reload(&self) -> bool {
        self.inner.reload.swap(false, Ordering::AcqRel)
    }

    /// Cancellation flag shared with restore jobs
    pub fn cancel_flag(&self) -> CancelFlag {
        self.inner.cancel.clone()
    }

    /// The wake latch
    pub fn latch(&self) -> &WakeLatch {
        &self.inner.latch
    }

    /// Wait for the next notification or `timeout`
    pub fn wait(&self, timeout: Duration) -> WakeEvents {
        self.inner.latch.wait(timeout)
    }
}
