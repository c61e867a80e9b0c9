//! I/O pattern tracking and per-request classification.
//!
//! [`IoPatternState`] is updated by submitters and records how many requests
//! of the same opcode were issued back to back. [`PatternClassifier`] runs on
//! the harvest thread and labels each completed request as random,
//! sequential or unclassified, computing the latency sample the slow-disk
//! detector consumes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::SlowDiskPolicy;
use crate::sys::IoOp;

/// Block size used to normalize the cost of large requests.
pub const BASE_BLOCK_SIZE: u64 = 8192;

/// Below this many requests in flight the cost policy does not trust its sample.
pub const MIN_BATCH_IN_FLIGHT: u32 = 16;

/// Access pattern of a completed request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoClass {
    /// Not contiguous with the previous request.
    Random,
    /// Contiguous with the previous request.
    Sequential,
    /// Not counted in latency statistics.
    #[default]
    Unclassified,
}

#[derive(Debug, Default)]
struct PatternRun {
    opcode: Option<IoOp>,
    contiguous: u16,
}

/// Run length of consecutive same-opcode submissions.
#[derive(Debug, Default)]
pub struct IoPatternState {
    run: Mutex<PatternRun>,
}

impl IoPatternState {
    /// Creates an empty pattern state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes a submission of `op` and returns the current run length.
    ///
    /// The first request after an opcode change has run length zero.
    pub fn on_submit(&self, op: IoOp) -> u16 {
        let mut run = self.run.lock();
        if run.opcode == Some(op) {
            run.contiguous = run.contiguous.saturating_add(1);
        } else {
            run.contiguous = 0;
            run.opcode = Some(op);
        }
        run.contiguous
    }
}

/// Attributes of one completed request needed for classification.
#[derive(Debug, Clone, Copy)]
pub struct CompletedIo {
    /// Operation kind.
    pub op: IoOp,
    /// File offset.
    pub offset: u64,
    /// Length in bytes.
    pub len: u64,
    /// Submission timestamp.
    pub submitted_at_ns: u64,
    /// Harvest timestamp.
    pub completed_at_ns: u64,
    /// Same-opcode run length at submission.
    pub contiguous: u16,
}

/// Context of the completion batch a request was harvested in.
#[derive(Debug, Clone, Copy)]
pub struct HarvestBatch {
    /// Timestamp taken before waiting for events.
    pub start_ns: u64,
    /// Number of events returned together.
    pub events: usize,
    /// Requests in flight when the batch was reaped.
    pub in_flight: u32,
}

/// Outcome of classifying one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Access pattern.
    pub class: IoClass,
    /// Latency sample in nanoseconds.
    pub cost_ns: u64,
}

/// Harvest-side cursor over the completion stream.
#[derive(Debug, Default)]
pub struct PatternClassifier {
    last_offset: u64,
    last_op: Option<IoOp>,
}

impl PatternClassifier {
    /// Creates a classifier with `last_offset = 0` and no previous opcode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `io` under `policy`.
    ///
    /// Returns `None` when the policy is disabled. Otherwise the cursor moves to
    /// the end of `io` whatever the outcome.
    pub fn classify(
        &mut self,
        policy: SlowDiskPolicy,
        io: &CompletedIo,
        batch: &HarvestBatch,
    ) -> Option<Classification> {
        let classification = match policy {
            SlowDiskPolicy::Disabled => return None,
            SlowDiskPolicy::Await => self.classify_await(io),
            SlowDiskPolicy::Cost => self.classify_cost(io, batch),
        };

        self.last_offset = io.offset + io.len;
        self.last_op = Some(io.op);
        Some(classification)
    }

    fn classify_await(&self, io: &CompletedIo) -> Classification {
        let class = if io.offset == self.last_offset {
            IoClass::Sequential
        } else {
            IoClass::Random
        };
        Classification {
            class,
            cost_ns: io.completed_at_ns.saturating_sub(io.submitted_at_ns),
        }
    }

    fn classify_cost(&self, io: &CompletedIo, batch: &HarvestBatch) -> Classification {
        let same_op = self.last_op == Some(io.op);
        let mut class = if io.offset == self.last_offset {
            if same_op && io.contiguous > 0 {
                IoClass::Sequential
            } else {
                IoClass::Unclassified
            }
        } else if same_op {
            IoClass::Random
        } else {
            IoClass::Unclassified
        };

        let start = io.submitted_at_ns.max(batch.start_ns);
        let mut cost = io.completed_at_ns.saturating_sub(start) / batch.events.max(1) as u64;
        let blocks = io.len / BASE_BLOCK_SIZE;
        if blocks > 1 {
            cost /= blocks;
        }

        if batch.in_flight < MIN_BATCH_IN_FLIGHT {
            class = IoClass::Unclassified;
        }

        Classification {
            class,
            cost_ns: cost,
        }
    }

    /// End offset of the last classified request.
    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io(op: IoOp, offset: u64, len: u64, contiguous: u16) -> CompletedIo {
        CompletedIo {
            op,
            offset,
            len,
            submitted_at_ns: 1_000,
            completed_at_ns: 5_000,
            contiguous,
        }
    }

    fn batch(in_flight: u32) -> HarvestBatch {
        HarvestBatch {
            start_ns: 0,
            events: 1,
            in_flight,
        }
    }

    #[test]
    fn test_pattern_state_run_length() {
        let state = IoPatternState::new();
        assert_eq!(state.on_submit(IoOp::Write), 0);
        assert_eq!(state.on_submit(IoOp::Write), 1);
        assert_eq!(state.on_submit(IoOp::Write), 2);
        assert_eq!(state.on_submit(IoOp::Read), 0);
        assert_eq!(state.on_submit(IoOp::Read), 1);
        assert_eq!(state.on_submit(IoOp::Write), 0);
    }

    #[test]
    fn test_disabled_policy_leaves_cursor() {
        let mut classifier = PatternClassifier::new();
        let result = classifier.classify(SlowDiskPolicy::Disabled, &io(IoOp::Read, 0, 8, 0), &batch(32));
        assert!(result.is_none());
        assert_eq!(classifier.last_offset(), 0);
    }

    #[test]
    fn test_await_offsets_sequence() {
        let mut classifier = PatternClassifier::new();
        let classes: Vec<IoClass> = [100u64, 108, 108, 200]
            .iter()
            .map(|&offset| {
                classifier
                    .classify(SlowDiskPolicy::Await, &io(IoOp::Write, offset, 8, 0), &batch(1))
                    .unwrap()
                    .class
            })
            .collect();
        assert_eq!(
            classes,
            vec![
                IoClass::Random,
                IoClass::Sequential,
                IoClass::Random,
                IoClass::Random
            ]
        );
        assert_eq!(classifier.last_offset(), 208);
    }

    #[test]
    fn test_await_first_request_at_zero_is_sequential() {
        let mut classifier = PatternClassifier::new();
        let c = classifier
            .classify(SlowDiskPolicy::Await, &io(IoOp::Read, 0, 4096, 0), &batch(1))
            .unwrap();
        assert_eq!(c.class, IoClass::Sequential);
    }

    #[test]
    fn test_await_cost_is_raw_latency() {
        let mut classifier = PatternClassifier::new();
        let c = classifier
            .classify(SlowDiskPolicy::Await, &io(IoOp::Read, 64, 65536, 0), &batch(1))
            .unwrap();
        assert_eq!(c.cost_ns, 4_000);
    }

    #[test]
    fn test_cost_sequential_needs_same_op_and_run() {
        let mut classifier = PatternClassifier::new();
        let b = batch(32);

        // No previous op: contiguous offset 0 but opcode differs.
        let c = classifier.classify(SlowDiskPolicy::Cost, &io(IoOp::Write, 0, 4096, 0), &b).unwrap();
        assert_eq!(c.class, IoClass::Unclassified);

        let c = classifier.classify(SlowDiskPolicy::Cost, &io(IoOp::Write, 4096, 4096, 1), &b).unwrap();
        assert_eq!(c.class, IoClass::Sequential);

        // Contiguous, same op, but the run was broken at submission.
        let c = classifier.classify(SlowDiskPolicy::Cost, &io(IoOp::Write, 8192, 4096, 0), &b).unwrap();
        assert_eq!(c.class, IoClass::Unclassified);

        // Contiguous, different op.
        let c = classifier.classify(SlowDiskPolicy::Cost, &io(IoOp::Read, 12288, 4096, 3), &b).unwrap();
        assert_eq!(c.class, IoClass::Unclassified);
    }

    #[test]
    fn test_cost_random_needs_same_op() {
        let mut classifier = PatternClassifier::new();
        let b = batch(32);
        classifier.classify(SlowDiskPolicy::Cost, &io(IoOp::Read, 0, 4096, 0), &b);

        let c = classifier.classify(SlowDiskPolicy::Cost, &io(IoOp::Read, 1 << 20, 4096, 1), &b).unwrap();
        assert_eq!(c.class, IoClass::Random);

        let c = classifier.classify(SlowDiskPolicy::Cost, &io(IoOp::Write, 1 << 30, 4096, 0), &b).unwrap();
        assert_eq!(c.class, IoClass::Unclassified);
    }

    #[test]
    fn test_cost_small_batch_is_unclassified() {
        let mut classifier = PatternClassifier::new();
        classifier.classify(SlowDiskPolicy::Cost, &io(IoOp::Read, 0, 4096, 0), &batch(32));
        let c = classifier
            .classify(SlowDiskPolicy::Cost, &io(IoOp::Read, 1 << 20, 4096, 1), &batch(MIN_BATCH_IN_FLIGHT - 1))
            .unwrap();
        assert_eq!(c.class, IoClass::Unclassified);
        assert_eq!(classifier.last_offset(), (1 << 20) + 4096);
    }

    #[test]
    fn test_cost_normalization() {
        let mut classifier = PatternClassifier::new();
        let completed = CompletedIo {
            op: IoOp::Read,
            offset: 0,
            len: 4 * BASE_BLOCK_SIZE,
            submitted_at_ns: 1_000,
            completed_at_ns: 17_000,
            contiguous: 0,
        };

        // Batch started after submission: cost is measured from batch start.
        let b = HarvestBatch {
            start_ns: 9_000,
            events: 2,
            in_flight: 32,
        };
        let c = classifier.classify(SlowDiskPolicy::Cost, &completed, &b).unwrap();
        assert_eq!(c.cost_ns, (17_000 - 9_000) / 2 / 4);

        // Submission after batch start: measured from submission.
        let b = HarvestBatch {
            start_ns: 0,
            events: 1,
            in_flight: 32,
        };
        let single = CompletedIo {
            len: BASE_BLOCK_SIZE,
            ..completed
        };
        let c = classifier.classify(SlowDiskPolicy::Cost, &single, &b).unwrap();
        assert_eq!(c.cost_ns, 16_000);
    }
}
