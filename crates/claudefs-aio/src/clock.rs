//! Process-wide timing and thread-naming state.
//!
//! Latency samples are nanosecond offsets from a single process epoch so that
//! timestamps taken on the caller, harvest and dispatch threads compare
//! directly. [`init`] pins the epoch; calling it is optional (the first
//! [`now_ns`] call pins it too) but doing so at startup keeps the first sample
//! from paying for initialization.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();
static THREAD_INDEX: AtomicU32 = AtomicU32::new(1);

/// Pins the process epoch used by [`now_ns`].
pub fn init() {
    let _ = EPOCH.get_or_init(Instant::now);
}

/// Monotonic nanoseconds since the process epoch.
#[inline]
pub fn now_ns() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Next value of the process-wide worker thread counter.
pub fn next_thread_index() -> u32 {
    THREAD_INDEX.fetch_add(1, Ordering::Relaxed)
}
