// Trailing-edge throttle
//
// Holds the most recent value offered and releases it once the window armed by
// the first offer has elapsed. Intermediate values are overwritten, never queued.

use std::time::Duration;
use tokio::time::Instant;

/// Rate limiter emitting at most one value per window, always the latest
#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Throttle {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Replace the pending value; arms the timer if it is not running.
    pub fn offer(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    /// When the pending value becomes due, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take the pending value if its window has elapsed
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Drop the pending value and disarm the timer
    pub fn stop(&mut self) {
        self.pending = None;
        self.deadline = None;
    }
}
