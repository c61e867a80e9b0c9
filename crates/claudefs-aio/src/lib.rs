#![warn(missing_docs)]

//! ClaudeFS AIO subsystem: Linux kernel AIO disk engine with slow-disk detection
//!
//! This crate drives positional reads and writes on a file through the
//! kernel's native AIO interface. An [`IoContext`] bounds the number of
//! requests in flight, reaps completions on a harvest thread and delivers
//! callbacks from a dispatch thread. Completion latencies are classified by
//! access pattern and fed to ring windows that flag a degrading disk.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod context;
pub mod detector;
pub mod error;
pub mod file;
pub mod gate;
pub mod mock;
pub mod pattern;
pub mod pool;
pub mod queue;
pub mod ring_window;
pub mod select;
pub mod stats;
pub mod sys;

pub use buffer::{AlignedBuffer, DEFAULT_ALIGNMENT};
pub use config::{AioConfig, SlowDiskConfig, SlowDiskPolicy};
pub use context::{ContextState, IoCallback, IoCompletion, IoContext};
pub use detector::{SlowDiskCallback, SlowDiskDetector, SlowDiskReport};
pub use error::{AioError, AioResult};
pub use file::AsyncFile;
pub use gate::SubmissionGate;
pub use mock::MockAio;
pub use pattern::{IoClass, IoPatternState, PatternClassifier, BASE_BLOCK_SIZE};
pub use pool::{ControlBlock, ControlBlockPool, SlotId};
pub use queue::HandoffQueue;
pub use ring_window::{RingLatencyWindow, MAX_OVER_TIMES};
pub use select::{percentile, select};
pub use stats::{AioStats, AioStatsSnapshot};
pub use sys::{AioBackend, IoEvent, IoOp, Iocb, LinuxAio};
