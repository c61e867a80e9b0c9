//! Fixed-capacity latency window with hysteresis.
//!
//! A [`RingLatencyWindow`] keeps the most recent `capacity` latency samples of
//! one I/O class and counts how many sit above and below a threshold. Each time
//! the window fills up with a majority of slow samples it is cleared and the
//! overflow counter is bumped; a fill with a fast majority resets the counter.
//! The window reports "slow" once [`MAX_OVER_TIMES`] consecutive overflows
//! have been seen.

use tracing::warn;

use crate::select;

/// Consecutive overflowing fills needed before a window reports slow.
pub const MAX_OVER_TIMES: u16 = 3;

/// Windows at or below this size skip the percentile dump.
const MIN_DIAGNOSTIC_SAMPLES: usize = 100;

/// Sliding latency sample of one I/O class.
#[derive(Debug, Clone)]
pub struct RingLatencyWindow {
    name: &'static str,
    capacity: usize,
    size: usize,
    pos: usize,
    less: u32,
    more: u32,
    over_times: u16,
    quantile: f64,
    ring: Vec<u64>,
}

impl RingLatencyWindow {
    /// Creates an empty window holding at most `capacity` samples.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "ring window capacity must be non-zero");
        Self {
            name,
            capacity,
            size: 0,
            pos: 0,
            less: 0,
            more: 0,
            over_times: 0,
            quantile: 0.99,
            ring: vec![0; capacity],
        }
    }

    /// Sets the quantile reported in the overflow diagnostic.
    pub fn with_quantile(mut self, quantile: f64) -> Self {
        self.quantile = quantile;
        self
    }

    /// Records one latency sample and returns true when the window is slow.
    ///
    /// A zero sample is ignored.
    pub fn record(&mut self, sample: u64, threshold: u64) -> bool {
        if sample == 0 {
            return false;
        }

        if self.size == self.capacity {
            let evicted = self.ring[self.pos];
            if evicted > threshold {
                self.more -= 1;
            } else {
                self.less -= 1;
            }
            self.size -= 1;
        }

        self.ring[self.pos] = sample;
        self.pos = (self.pos + 1) % self.capacity;
        self.size += 1;

        if sample > threshold {
            self.more += 1;
        } else {
            self.less += 1;
        }

        if self.size < self.capacity {
            return false;
        }

        if self.less < self.more {
            self.over_times = self.over_times.saturating_add(1);
            self.log_percentiles(threshold);
            self.clear();
        } else {
            self.over_times = 0;
        }

        self.over_times >= MAX_OVER_TIMES
    }

    fn clear(&mut self) {
        self.ring.iter_mut().for_each(|s| *s = 0);
        self.size = 0;
        self.pos = 0;
        self.less = 0;
        self.more = 0;
    }

    fn log_percentiles(&self, threshold: u64) {
        if self.size <= MIN_DIAGNOSTIC_SAMPLES {
            return;
        }

        let samples = &self.ring[..self.size];
        let p50 = select::percentile(samples, 0.5);
        let p90 = select::percentile(samples, 0.9);
        let pq = select::percentile(samples, self.quantile);
        let max = samples.iter().copied().max().unwrap_or(0);
        warn!(
            "{} overflow #{}: threshold={}ns less={} more={} p50={:?} p90={:?} p{}={:?} max={}",
            self.name,
            self.over_times,
            threshold,
            self.less,
            self.more,
            p50,
            p90,
            self.quantile * 100.0,
            pq,
            max
        );
    }

    /// Diagnostic name of this window.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum number of samples held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of samples currently held.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Samples at or below the threshold they were recorded with.
    pub fn less(&self) -> u32 {
        self.less
    }

    /// Samples above the threshold they were recorded with.
    pub fn more(&self) -> u32 {
        self.more
    }

    /// Consecutive overflowing fills seen so far.
    pub fn over_times(&self) -> u16 {
        self.over_times
    }
}
