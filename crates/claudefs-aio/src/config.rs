//! Engine and slow-disk detector configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AioError, AioResult};

/// Configuration for an [`IoContext`](crate::context::IoContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AioConfig {
    /// Maximum number of requests in flight. Default: 128.
    pub io_depth: u32,
    /// Open the file with `O_DIRECT`. Default: true.
    pub direct_io: bool,
    /// Hand-off queue capacity. Default: 1024.
    pub queue_capacity: usize,
    /// Maximum records the dispatch thread drains at once. Default: 64.
    pub dispatch_batch: usize,
    /// Maximum events reaped per `io_getevents`. Default: 8.
    pub max_events: usize,
    /// Events requested from `io_setup`. Default: 1024.
    pub aio_nr: u32,
    /// Poll interval of the gate and both worker loops. Default: 1000 ms.
    pub poll_interval_ms: u64,
    /// Budget for each close phase. Default: 5000 ms.
    pub close_timeout_ms: u64,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            io_depth: 128,
            direct_io: true,
            queue_capacity: 1024,
            dispatch_batch: 64,
            max_events: 8,
            aio_nr: 1024,
            poll_interval_ms: 1000,
            close_timeout_ms: 5000,
        }
    }
}

impl AioConfig {
    /// Parses a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> AioResult<Self> {
        let config: AioConfig = serde_json::from_str(json)
            .map_err(|e| AioError::InvalidArgument(format!("bad AIO config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> AioResult<()> {
        if self.io_depth == 0 {
            return Err(AioError::InvalidArgument("io_depth must be > 0".into()));
        }
        if self.io_depth > self.aio_nr {
            return Err(AioError::InvalidArgument(format!(
                "io_depth {} exceeds aio_nr {}",
                self.io_depth, self.aio_nr
            )));
        }
        if self.queue_capacity == 0 || self.dispatch_batch == 0 || self.max_events == 0 {
            return Err(AioError::InvalidArgument(
                "queue_capacity, dispatch_batch and max_events must be > 0".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(AioError::InvalidArgument(
                "poll_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Records that may sit between harvest and dispatch at once.
    pub fn pool_slack(&self) -> usize {
        self.queue_capacity + self.dispatch_batch
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-phase close budget as a [`Duration`].
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Latency classification policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlowDiskPolicy {
    /// No latency checking.
    #[default]
    Disabled,
    /// Raw completion latency, offset-only pattern detection.
    Await,
    /// Batch-normalized cost, opcode-aware pattern detection.
    Cost,
}

impl SlowDiskPolicy {
    /// Maps a numeric policy code (0, 1, 2) to a policy.
    pub fn from_code(code: u32) -> AioResult<Self> {
        match code {
            0 => Ok(SlowDiskPolicy::Disabled),
            1 => Ok(SlowDiskPolicy::Await),
            2 => Ok(SlowDiskPolicy::Cost),
            other => Err(AioError::InvalidArgument(format!(
                "unknown slow-disk policy {}",
                other
            ))),
        }
    }
}

/// Slow-disk detection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlowDiskConfig {
    /// Latency above which a sequential sample counts as slow.
    pub sequential_threshold_ns: u64,
    /// Latency above which a random sample counts as slow.
    pub random_threshold_ns: u64,
    /// Quantile reported in overflow diagnostics, in (0, 1).
    pub quantile: f64,
    /// Classification policy.
    pub policy: SlowDiskPolicy,
}

impl Default for SlowDiskConfig {
    fn default() -> Self {
        Self {
            sequential_threshold_ns: 10_000_000,
            random_threshold_ns: 50_000_000,
            quantile: 0.99,
            policy: SlowDiskPolicy::Cost,
        }
    }
}

impl SlowDiskConfig {
    /// Checks thresholds and quantile.
    pub fn validate(&self) -> AioResult<()> {
        if !(self.quantile > 0.0 && self.quantile < 1.0) {
            return Err(AioError::InvalidArgument(format!(
                "quantile {} must lie in (0, 1)",
                self.quantile
            )));
        }
        if self.sequential_threshold_ns == 0 || self.random_threshold_ns == 0 {
            return Err(AioError::InvalidArgument(
                "slow-disk thresholds must be > 0".into(),
            ));
        }
        Ok(())
    }
}
