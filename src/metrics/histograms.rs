//! Histogram metrics for measuring distributions of values.
//!
//! A [`Histogram`] keeps cumulative Prometheus buckets for exposition and a
//! bounded buffer of the most recent raw samples, from which exact
//! percentiles are computed on demand.

use super::counters::add_f64;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Default histogram buckets (in seconds) for latency measurements.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Default number of raw samples retained per histogram.
pub const DEFAULT_MAX_SAMPLES: usize = 10_000;

/// A histogram for measuring distributions.
#[derive(Debug)]
pub struct Histogram {
    name: String,
    help: String,
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum: AtomicU64, // Store as bits
    count: AtomicU64,
    samples: Mutex<VecDeque<f64>>,
    max_samples: usize,
}

impl Histogram {
    /// Create a new histogram with default buckets.
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::with_buckets(name, help, DEFAULT_BUCKETS.to_vec(), DEFAULT_MAX_SAMPLES)
    }

    /// Create a new histogram with custom buckets and sample capacity.
    pub fn with_buckets(
        name: impl Into<String>,
        help: impl Into<String>,
        mut buckets: Vec<f64>,
        max_samples: usize,
    ) -> Self {
        buckets.retain(|b| b.is_finite());
        buckets.sort_by(|a, b| a.total_cmp(b));
        buckets.dedup();

        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            name: name.into(),
            help: help.into(),
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::new()),
            max_samples: max_samples.max(1),
        }
    }

    /// Get the histogram name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the histogram help text.
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Get the bucket boundaries.
    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }

    /// Observe a value.
    pub fn observe(&self, value: f64) {
        if !value.is_finite() {
            return;
        }

        self.count.fetch_add(1, Ordering::Relaxed);
        add_f64(&self.sum, value);

        for (i, &upper) in self.buckets.iter().enumerate() {
            if value <= upper {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut samples = self.samples.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    /// Observe a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Start a timer that will observe when dropped.
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            start: Instant::now(),
        }
    }

    /// Get the total count of observations.
    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the sum of all observations.
    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    /// Get a snapshot of the cumulative bucket data.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: self.get_sum(),
            count: self.get_count(),
        }
    }

    /// Compute order statistics over the retained sample buffer.
    ///
    /// Returns `None` when nothing has been observed yet.
    pub fn stats(&self) -> Option<HistogramStats> {
        let mut values: Vec<f64> = self.samples.lock().iter().copied().collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));

        let sum: f64 = values.iter().sum();
        Some(HistogramStats {
            count: values.len(),
            sum,
            min: values[0],
            max: values[values.len() - 1],
            mean: sum / values.len() as f64,
            p50: percentile(&values, 50.0),
            p90: percentile(&values, 90.0),
            p95: percentile(&values, 95.0),
            p99: percentile(&values, 99.0),
        })
    }

    /// Reset the histogram.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0f64.to_bits(), Ordering::Relaxed);
        for bucket in &self.bucket_counts {
            bucket.store(0, Ordering::Relaxed);
        }
        self.samples.lock().clear();
    }
}

/// Linear-interpolated percentile over a sorted, non-empty slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (sorted.len() - 1) as f64 * p / 100.0;
    let lower = rank.floor() as usize;
    let upper = lower + 1;
    if upper >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// A timer that observes duration when dropped.
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl<'a> HistogramTimer<'a> {
    /// Stop the timer and observe the duration.
    pub fn observe(self) -> Duration {
        let duration = self.start.elapsed();
        self.histogram.observe_duration(duration);
        std::mem::forget(self); // Don't observe twice
        duration
    }

    /// Get elapsed time without observing.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        self.histogram.observe_duration(self.start.elapsed());
    }
}

/// A snapshot of histogram bucket data.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    /// Bucket boundaries.
    pub buckets: Vec<f64>,
    /// Count of observations <= each bucket boundary.
    pub bucket_counts: Vec<u64>,
    /// Sum of all observations.
    pub sum: f64,
    /// Total count of observations.
    pub count: u64,
}

impl HistogramSnapshot {
    /// Calculate the mean.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Order statistics computed from the retained samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramStats {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}
