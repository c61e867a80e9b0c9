//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::sys::IoOp;

/// Lock-free counters updated by submitters and both worker threads.
#[derive(Debug, Default)]
pub struct AioStats {
    reads_submitted: AtomicU64,
    writes_submitted: AtomicU64,
    completions: AtomicU64,
    bytes_completed: AtomicU64,
    errors: AtomicU64,
    submit_failures: AtomicU64,
    inline_dispatches: AtomicU64,
}

impl AioStats {
    /// Counts an accepted submission and returns its per-opcode sequence number.
    pub(crate) fn add_submit(&self, op: IoOp) -> u64 {
        let counter = match op {
            IoOp::Read => &self.reads_submitted,
            IoOp::Write => &self.writes_submitted,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn add_completion(&self, bytes: u64) {
        self.completions.fetch_add(1, Ordering::Relaxed);
        self.bytes_completed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_submit_failure(&self) {
        self.submit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_inline_dispatch(&self) {
        self.inline_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> AioStatsSnapshot {
        AioStatsSnapshot {
            reads_submitted: self.reads_submitted.load(Ordering::Relaxed),
            writes_submitted: self.writes_submitted.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            bytes_completed: self.bytes_completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            submit_failures: self.submit_failures.load(Ordering::Relaxed),
            inline_dispatches: self.inline_dispatches.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`AioStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AioStatsSnapshot {
    /// Reads handed to the kernel.
    pub reads_submitted: u64,
    /// Writes handed to the kernel.
    pub writes_submitted: u64,
    /// Completions reaped from the kernel.
    pub completions: u64,
    /// Bytes transferred by successful completions.
    pub bytes_completed: u64,
    /// Completions carrying an error or short transfer.
    pub errors: u64,
    /// Requests that never reached the kernel.
    pub submit_failures: u64,
    /// Completions notified on the harvest thread because the queue was full.
    pub inline_dispatches: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_per_opcode() {
        let stats = AioStats::default();
        assert_eq!(stats.add_submit(IoOp::Read), 1);
        assert_eq!(stats.add_submit(IoOp::Read), 2);
        assert_eq!(stats.add_submit(IoOp::Write), 1);
    }

    #[test]
    fn test_snapshot() {
        let stats = AioStats::default();
        stats.add_submit(IoOp::Write);
        stats.add_completion(4096);
        stats.add_completion(512);
        stats.add_error();
        stats.add_submit_failure();
        stats.add_inline_dispatch();

        let snap = stats.snapshot();
        assert_eq!(snap.writes_submitted, 1);
        assert_eq!(snap.completions, 2);
        assert_eq!(snap.bytes_completed, 4608);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.submit_failures, 1);
        assert_eq!(snap.inline_dispatches, 1);

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"bytes_completed\":4608"));
    }
}
