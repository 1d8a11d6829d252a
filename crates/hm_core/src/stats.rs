//! Round-trip latency statistics.
//!
//! A job records the time between enqueuing a run and receiving its
//! completion. The pool merges the per-job trackers into one report.

/// Number of histogram buckets. The last bucket collects everything beyond.
pub const BUCKETS: usize = 20;

/// Width of one histogram bucket in nanoseconds (250 us).
pub const BUCKET_NS: u64 = 250_000;

/// Tracks latency statistics with minimal overhead.
///
/// Accumulates min, max, sum, count and a fixed histogram so that recording
/// a sample is a handful of integer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
    pub buckets: [u64; BUCKETS],
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    /// Creates an empty tracker. `min` starts at `u64::MAX` so the first
    /// sample becomes the minimum.
    pub fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            buckets: [0; BUCKETS],
        }
    }

    /// Records one latency sample in nanoseconds.
    pub fn update(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum = self.sum.saturating_add(nanos);
        self.count += 1;

        let idx = (nanos / BUCKET_NS).min(BUCKETS as u64 - 1) as usize;
        self.buckets[idx] += 1;
    }

    /// Folds another tracker into this one.
    pub fn merge(&mut self, other: &LatencyStats) {
        if other.count == 0 {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum = self.sum.saturating_add(other.sum);
        self.count += other.count;
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
    }

    /// Average latency in nanoseconds, or 0.0 without samples.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}
