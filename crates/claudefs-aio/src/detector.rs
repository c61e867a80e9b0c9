//! Slow-disk detector.
//!
//! Routes classified latency samples into one of three ring windows (random,
//! sequential read, sequential write) and reports the first window that turns
//! slow. Delivery of the report is the caller's business; see
//! [`IoContext::enable_disk_check`](crate::context::IoContext::enable_disk_check).

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{SlowDiskConfig, SlowDiskPolicy};
use crate::error::{AioError, AioResult};
use crate::pattern::IoClass;
use crate::ring_window::RingLatencyWindow;
use crate::sys::IoOp;

/// Window size of every class under [`SlowDiskPolicy::Await`].
pub const AWAIT_WINDOW: usize = 600;
/// Random window size under [`SlowDiskPolicy::Cost`].
pub const COST_RANDOM_WINDOW: usize = 1000;
/// Sequential read and write window size under [`SlowDiskPolicy::Cost`].
pub const COST_SEQUENTIAL_WINDOW: usize = 30_000;

/// Notification fired once when a disk is judged slow.
pub type SlowDiskCallback = Box<dyn FnOnce(SlowDiskReport) + Send + 'static>;

/// What the detector saw when it flagged the disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlowDiskReport {
    /// File the context was opened on.
    pub path: String,
    /// Policy in effect.
    pub policy: SlowDiskPolicy,
    /// Window that reported slow.
    pub window: &'static str,
    /// Sample that tipped the window.
    pub sample_ns: u64,
    /// Threshold applied to that window.
    pub threshold_ns: u64,
    /// Samples observed since the detector was enabled.
    pub samples_seen: u64,
}

/// Three latency windows plus the thresholds applied to them.
#[derive(Debug)]
pub struct SlowDiskDetector {
    path: String,
    config: SlowDiskConfig,
    random: RingLatencyWindow,
    seq_read: RingLatencyWindow,
    seq_write: RingLatencyWindow,
    seq: u64,
}

impl SlowDiskDetector {
    /// Builds a detector for the file at `path`.
    ///
    /// Fails if `config` is invalid or its policy is
    /// [`Disabled`](SlowDiskPolicy::Disabled).
    pub fn new(path: impl Into<String>, config: SlowDiskConfig) -> AioResult<Self> {
        config.validate()?;
        let (random, sequential) = match config.policy {
            SlowDiskPolicy::Disabled => {
                return Err(AioError::InvalidArgument(
                    "slow-disk detector needs an active policy".into(),
                ))
            }
            SlowDiskPolicy::Await => (AWAIT_WINDOW, AWAIT_WINDOW),
            SlowDiskPolicy::Cost => (COST_RANDOM_WINDOW, COST_SEQUENTIAL_WINDOW),
        };

        let path = path.into();
        debug!(
            "slow-disk detector for {}: policy={:?} random_window={} sequential_window={}",
            path, config.policy, random, sequential
        );
        Ok(Self {
            path,
            config,
            random: RingLatencyWindow::new("random", random).with_quantile(config.quantile),
            seq_read: RingLatencyWindow::new("sequential-read", sequential)
                .with_quantile(config.quantile),
            seq_write: RingLatencyWindow::new("sequential-write", sequential)
                .with_quantile(config.quantile),
            seq: 0,
        })
    }

    /// Feeds one classified completion.
    ///
    /// Returns a report when the sample pushed its window into the slow state.
    /// Unclassified samples are dropped.
    pub fn observe(&mut self, op: IoOp, class: IoClass, cost_ns: u64) -> Option<SlowDiskReport> {
        let (window, threshold) = match (class, op) {
            (IoClass::Random, _) => (&mut self.random, self.config.random_threshold_ns),
            (IoClass::Sequential, IoOp::Read) => {
                (&mut self.seq_read, self.config.sequential_threshold_ns)
            }
            (IoClass::Sequential, IoOp::Write) => {
                (&mut self.seq_write, self.config.sequential_threshold_ns)
            }
            (IoClass::Unclassified, _) => return None,
        };

        self.seq += 1;
        if !window.record(cost_ns, threshold) {
            return None;
        }

        warn!(
            "{}: {} window slow after {} overflows (sample={}ns threshold={}ns)",
            self.path,
            window.name(),
            window.over_times(),
            cost_ns,
            threshold
        );
        Some(SlowDiskReport {
            path: self.path.clone(),
            policy: self.config.policy,
            window: window.name(),
            sample_ns: cost_ns,
            threshold_ns: threshold,
            samples_seen: self.seq,
        })
    }

    /// Policy in effect.
    pub fn policy(&self) -> SlowDiskPolicy {
        self.config.policy
    }

    /// Samples routed to a window so far.
    pub fn samples_seen(&self) -> u64 {
        self.seq
    }

    /// Window sizes as `(random, sequential read, sequential write)`.
    pub fn window_capacities(&self) -> (usize, usize, usize) {
        (
            self.random.capacity(),
            self.seq_read.capacity(),
            self.seq_write.capacity(),
        )
    }
}
