//! Submission gate bounding the number of in-flight requests.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::AioError;

/// Counter + condition variable enforcing `in_flight <= depth`.
///
/// Waiters poll with a bounded timeout and log each time it elapses; the wait
/// itself is unbounded.
pub struct SubmissionGate {
    name: String,
    depth: u32,
    poll_interval: Duration,
    in_flight: Mutex<u32>,
    available: Condvar,
}

impl SubmissionGate {
    /// Creates a gate admitting at most `depth` concurrent requests.
    pub fn new(name: impl Into<String>, depth: u32, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            depth,
            poll_interval,
            in_flight: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    /// Blocks until a slot is free, then takes it.
    pub fn acquire(&self) {
        let mut in_flight = self.in_flight.lock();
        while *in_flight >= self.depth {
            if self
                .available
                .wait_for(&mut in_flight, self.poll_interval)
                .timed_out()
            {
                let waited = AioError::Timeout {
                    what: "a submission slot",
                };
                warn!(
                    "gate {}: {} after {:?}, in_flight={} depth={}",
                    self.name, waited, self.poll_interval, *in_flight, self.depth
                );
            }
        }
        *in_flight += 1;
    }

    /// Takes a slot if one is free without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut in_flight = self.in_flight.lock();
        if *in_flight >= self.depth {
            return false;
        }
        *in_flight += 1;
        true
    }

    /// Gives back `count` slots, waking waiters if the gate was saturated.
    pub fn release(&self, count: u32) {
        let mut in_flight = self.in_flight.lock();
        if *in_flight == self.depth {
            self.available.notify_all();
        }
        *in_flight = in_flight.saturating_sub(count);
    }

    /// Current number of in-flight requests.
    pub fn in_flight(&self) -> u32 {
        *self.in_flight.lock()
    }

    /// Configured depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }
}
