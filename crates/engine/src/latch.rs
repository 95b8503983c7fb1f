//! Wake latch
//!
//! A latch is set from any thread and waited on with a timeout by the
//! orchestrator. Setting it wakes a waiter immediately; a set that happens
//! before the wait is not lost, because the flag stays set until `reset`.
//! Host death is sticky: once marked, every wait returns at once.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a wait returned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WakeEvents {
    /// The latch was set
    pub latch_set: bool,
    /// The timeout elapsed
    pub timeout: bool,
    /// The supervising host process went away
    pub host_died: bool,
}

#[derive(Default)]
struct LatchState {
    set: bool,
    host_dead: bool,
}

/// Settable, resettable wake-up primitive
#[derive(Default)]
pub struct WakeLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl WakeLatch {
    /// Create an unset latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake any waiter
    pub fn set(&self) {
        let mut state = self.state.lock();
        state.set = true;
        self.cond.notify_all();
    }

    /// Clear the latch
    pub fn reset(&self) {
        self.state.lock().set = false;
    }

    /// Whether the latch is currently set
    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Record that the host process died and wake any waiter
    pub fn mark_host_dead(&self) {
        let mut state = self.state.lock();
        state.host_dead = true;
        self.cond.notify_all();
    }

    /// Whether host death has been recorded
    pub fn is_host_dead(&self) -> bool {
        self.state.lock().host_dead
    }

    /// Block until the latch is set, the host dies or `timeout` elapses.
    ///
    /// Does not reset the latch.
    pub fn wait(&self, timeout: Duration) -> WakeEvents {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if state.set || state.host_dead {
                return WakeEvents {
                    latch_set: state.set,
                    timeout: false,
                    host_died: state.host_dead,
                };
            }

            // Spurious wakeups go round the loop again
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return WakeEvents {
                    latch_set: state.set,
                    timeout: !state.set && !state.host_dead,
                    host_died: state.host_dead,
                };
            }
        }
    }
}
