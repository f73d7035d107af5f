//! Counting wakeup signal.
//!
//! A level-style primitive: every `notify` is remembered, so a wait that
//! starts after the wakeup it cares about still succeeds. One-shot edge
//! triggers would lose wakeups delivered between releasing a channel lock
//! and parking the waiter.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a failed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed before a wakeup arrived.
    Timeout,
    /// The signal was interrupted; the owning channel is going away.
    Interrupted,
}

struct SignalState {
    count: u32,
    interrupted: bool,
}

/// A counting, interruptible wakeup signal.
pub struct Signal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState {
                count: 0,
                interrupted: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Record one wakeup and wake all waiters.
    pub fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        state.count = state.count.saturating_add(1);
        drop(state);
        self.cv.notify_all();
    }

    /// Abort all current and future waits with `Interrupted`.
    pub fn interrupt(&self) {
        self.state.lock().unwrap().interrupted = true;
        self.cv.notify_all();
    }

    /// Consume one wakeup, blocking until one is available.
    ///
    /// `deadline` of `None` waits forever. The deadline is absolute: retries
    /// inside this call never extend the total blocking time.
    pub fn wait_deadline(&self, deadline: Option<Instant>) -> Result<(), WaitError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.interrupted {
                return Err(WaitError::Interrupted);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            match deadline {
                None => state = self.cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitError::Timeout);
                    }
                    let (guard, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }
}

/// Absolute deadline for a channel timeout, where zero means wait forever.
pub fn deadline_after_ms(timeout_ms: u32) -> Option<Instant> {
    if timeout_ms == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
    }
}
