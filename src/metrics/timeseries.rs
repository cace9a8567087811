//! Timestamped sample buffers with retention-based pruning.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// A single timestamped sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub at: Instant,
    pub value: f64,
}

/// Append-only buffer of samples, oldest first.
#[derive(Debug)]
pub struct TimeSeries {
    samples: Mutex<VecDeque<Sample>>,
    max_points: usize,
}

impl TimeSeries {
    pub fn new(max_points: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            max_points: max_points.max(1),
        }
    }

    /// Record a value at the current instant.
    pub fn record(&self, value: f64) {
        self.record_at(Instant::now(), value);
    }

    pub(crate) fn record_at(&self, at: Instant, value: f64) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.max_points {
            samples.pop_front();
        }
        samples.push_back(Sample { at, value });
    }

    /// Samples recorded at or after `since`.
    pub fn since(&self, since: Instant) -> Vec<Sample> {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.at >= since)
            .copied()
            .collect()
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<Sample> {
        self.samples.lock().back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop samples older than `retention`. Returns the number removed.
    pub fn prune(&self, retention: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(retention) else {
            return 0;
        };
        let mut samples = self.samples.lock();
        let before = samples.len();
        while samples.front().is_some_and(|s| s.at < cutoff) {
            samples.pop_front();
        }
        before - samples.len()
    }
}
