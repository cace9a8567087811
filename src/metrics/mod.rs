//! Metrics module for monitoring and observability.
//!
//! Every component of the pipeline reports through a shared
//! [`MetricsCollector`]. Series are created on first use and addressed by
//! name plus an optional, order-independent label set:
//! - Counters for request counts, errors, retries
//! - Gauges for current values like queue depth or pool size
//! - Histograms for latency distributions (buckets + exact percentiles)
//! - Summaries for quantile-only distributions
//!
//! Each mutation also appends to a per-series [`TimeSeries`] that the
//! auto-scaler and dashboards can read back. Samples older than the
//! configured retention are pruned by [`MetricsCollector::prune`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     MetricsCollector                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │  Counters    │  │   Gauges     │  │ Histograms /     │  │
//! │  │ - requests   │  │ - queue size │  │ Summaries        │  │
//! │  │ - rejections │  │ - workers    │  │ - stage latency  │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘  │
//! │                  ┌─────────────────────┐                    │
//! │                  │ TimeSeries (pruned) │                    │
//! │                  └─────────────────────┘                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use pipeguard::metrics::MetricsCollector;
//!
//! let metrics = MetricsCollector::default();
//! metrics.increment_counter("requests_total", &[("client", "a")], 1.0);
//! metrics.observe_histogram("stage_latency_seconds", &[], 0.042);
//!
//! let stats = metrics.histogram_stats("stage_latency_seconds", &[]).unwrap();
//! assert_eq!(stats.count, 1);
//! println!("{}", metrics.to_prometheus());
//! ```

mod counters;
mod gauges;
mod histograms;
mod timeseries;

pub use counters::Counter;
pub use gauges::Gauge;
pub use histograms::{
    Histogram, HistogramSnapshot, HistogramStats, HistogramTimer, DEFAULT_BUCKETS,
    DEFAULT_MAX_SAMPLES,
};
pub use timeseries::{Sample, TimeSeries};

use crate::config::MetricsConfig;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Identity of one series: metric name plus sorted label pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: String,
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    /// Render the label set in exposition syntax, with an optional extra pair
    /// (`le` for buckets, `quantile` for summaries).
    fn render_labels(&self, extra: Option<(&str, &str)>) -> String {
        let pairs: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(extra)
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
            .collect();
        if pairs.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", pairs.join(","))
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.name, self.render_labels(None))
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

type SeriesMap<M> = RwLock<BTreeMap<SeriesKey, Arc<M>>>;

fn get_or_insert<M>(
    map: &SeriesMap<M>,
    key: SeriesKey,
    make: impl FnOnce(&SeriesKey) -> M,
) -> Arc<M> {
    if let Some(existing) = map.read().get(&key) {
        return Arc::clone(existing);
    }
    let mut map = map.write();
    Arc::clone(map.entry(key).or_insert_with_key(|k| Arc::new(make(k))))
}

/// Registry of dynamically created metric series.
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    counters: SeriesMap<Counter>,
    gauges: SeriesMap<Gauge>,
    histograms: SeriesMap<Histogram>,
    summaries: SeriesMap<Histogram>,
    series: SeriesMap<TimeSeries>,
    help: RwLock<HashMap<String, String>>,
}

impl MetricsCollector {
    /// Create a new collector.
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
            summaries: RwLock::new(BTreeMap::new()),
            series: RwLock::new(BTreeMap::new()),
            help: RwLock::new(HashMap::new()),
        }
    }

    /// Get the collector configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Attach help text to a metric name for the exposition output.
    pub fn describe(&self, name: &str, help: &str) {
        self.help.write().insert(name.to_string(), help.to_string());
    }

    fn help_for(&self, name: &str) -> String {
        self.help.read().get(name).cloned().unwrap_or_default()
    }

    fn record_point(&self, key: &SeriesKey, value: f64) {
        let max_points = self.config.max_points;
        get_or_insert(&self.series, key.clone(), |_| TimeSeries::new(max_points)).record(value);
    }

    /// Add `delta` to a counter. Non-positive deltas are ignored.
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = SeriesKey::new(name, labels);
        let counter = get_or_insert(&self.counters, key.clone(), |k| {
            Counter::new(k.name.clone(), self.help_for(&k.name))
        });
        counter.inc_by(delta);
        self.record_point(&key, counter.get());
    }

    /// Set a gauge. Last write wins.
    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels);
        let gauge = get_or_insert(&self.gauges, key.clone(), |k| {
            Gauge::new(k.name.clone(), self.help_for(&k.name))
        });
        gauge.set(value);
        self.record_point(&key, value);
    }

    /// Observe a value into a histogram.
    pub fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels);
        let histogram = get_or_insert(&self.histograms, key.clone(), |k| {
            Histogram::with_buckets(
                k.name.clone(),
                self.help_for(&k.name),
                self.config.buckets.clone(),
                self.config.max_samples,
            )
        });
        histogram.observe(value);
        self.record_point(&key, value);
    }

    /// Observe a duration, in seconds, into a histogram.
    pub fn observe_duration(&self, name: &str, labels: &[(&str, &str)], duration: Duration) {
        self.observe_histogram(name, labels, duration.as_secs_f64());
    }

    /// Observe a value into a summary (quantiles only, no buckets).
    pub fn observe_summary(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels);
        let summary = get_or_insert(&self.summaries, key.clone(), |k| {
            Histogram::with_buckets(
                k.name.clone(),
                self.help_for(&k.name),
                Vec::new(),
                self.config.max_samples,
            )
        });
        summary.observe(value);
        self.record_point(&key, value);
    }

    /// Current counter value, 0 if the series does not exist.
    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.counters
            .read()
            .get(&SeriesKey::new(name, labels))
            .map(|c| c.get())
            .unwrap_or(0.0)
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> f64 {
        self.counters
            .read()
            .iter()
            .filter(|(k, _)| k.name == name)
            .map(|(_, c)| c.get())
            .sum()
    }

    /// Current gauge value, if the series exists.
    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges
            .read()
            .get(&SeriesKey::new(name, labels))
            .map(|g| g.get())
    }

    /// Percentile statistics for a histogram or summary series.
    pub fn histogram_stats(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramStats> {
        let key = SeriesKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            return h.stats();
        }
        self.summaries.read().get(&key).and_then(|s| s.stats())
    }

    /// Samples of one series recorded at or after `since`.
    pub fn timeseries(&self, name: &str, labels: &[(&str, &str)], since: Instant) -> Vec<Sample> {
        self.series
            .read()
            .get(&SeriesKey::new(name, labels))
            .map(|s| s.since(since))
            .unwrap_or_default()
    }

    /// Latest recorded value of a series of any kind.
    pub fn latest(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.series
            .read()
            .get(&SeriesKey::new(name, labels))
            .and_then(|s| s.latest())
            .map(|s| s.value)
    }

    /// Drop time-series samples older than the retention window.
    pub fn prune(&self) -> usize {
        let retention = self.config.retention;
        let removed: usize = self
            .series
            .read()
            .values()
            .map(|s| s.prune(retention))
            .sum();
        if removed > 0 {
            debug!(removed, "Pruned expired metric samples");
        }
        removed
    }

    /// Point-in-time copy of every series.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, c)| (k.to_string(), c.get()))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, g)| (k.to_string(), g.get()))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .chain(self.summaries.read().iter())
                .filter_map(|(k, h)| h.stats().map(|s| (k.to_string(), s)))
                .collect(),
        }
    }

    /// Format metrics in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let mut last_name: Option<String> = None;
        let mut header = |out: &mut String, name: &str, kind: &str| {
            if last_name.as_deref() != Some(name) {
                let help = self.help_for(name);
                if !help.is_empty() {
                    let _ = writeln!(out, "# HELP {} {}", name, help);
                }
                let _ = writeln!(out, "# TYPE {} {}", name, kind);
                last_name = Some(name.to_string());
            }
        };

        for (key, counter) in self.counters.read().iter() {
            header(&mut output, &key.name, "counter");
            let _ = writeln!(output, "{} {}", key, counter.get());
        }

        for (key, gauge) in self.gauges.read().iter() {
            header(&mut output, &key.name, "gauge");
            let _ = writeln!(output, "{} {}", key, gauge.get());
        }

        for (key, histogram) in self.histograms.read().iter() {
            header(&mut output, &key.name, "histogram");
            let snap = histogram.snapshot();
            for (upper, count) in snap.buckets.iter().zip(&snap.bucket_counts) {
                let le = upper.to_string();
                let _ = writeln!(
                    output,
                    "{}_bucket{} {}",
                    key.name,
                    key.render_labels(Some(("le", &le))),
                    count
                );
            }
            let _ = writeln!(
                output,
                "{}_bucket{} {}",
                key.name,
                key.render_labels(Some(("le", "+Inf"))),
                snap.count
            );
            let labels = key.render_labels(None);
            let _ = writeln!(output, "{}_sum{} {}", key.name, labels, snap.sum);
            let _ = writeln!(output, "{}_count{} {}", key.name, labels, snap.count);
        }

        for (key, summary) in self.summaries.read().iter() {
            header(&mut output, &key.name, "summary");
            if let Some(stats) = summary.stats() {
                let quantiles = [
                    ("0.5", stats.p50),
                    ("0.9", stats.p90),
                    ("0.95", stats.p95),
                    ("0.99", stats.p99),
                ];
                for (q, value) in quantiles {
                    let _ = writeln!(
                        output,
                        "{}{} {}",
                        key.name,
                        key.render_labels(Some(("quantile", q))),
                        value
                    );
                }
            }
            let labels = key.render_labels(None);
            let _ = writeln!(output, "{}_sum{} {}", key.name, labels, summary.get_sum());
            let _ = writeln!(output, "{}_count{} {}", key.name, labels, summary.get_count());
        }

        output
    }

    /// Periodically prune old samples until shutdown is signalled.
    pub async fn run_pruning_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.prune_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.prune();
                }
                _ = shutdown_rx.recv() => {
                    info!("Metrics pruning loop shutting down");
                    break;
                }
            }
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

/// A snapshot of every metric series, keyed by rendered series name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, f64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_with_labels() {
        let metrics = MetricsCollector::default();

        metrics.increment_counter("requests_total", &[("client", "a"), ("kind", "x")], 1.0);
        metrics.increment_counter("requests_total", &[("kind", "x"), ("client", "a")], 2.0);
        metrics.increment_counter("requests_total", &[("client", "b")], 1.0);

        // Label order does not matter.
        assert_eq!(metrics.get_counter("requests_total", &[("client", "a"), ("kind", "x")]), 3.0);
        assert_eq!(metrics.get_counter("requests_total", &[("client", "b")]), 1.0);
        assert_eq!(metrics.get_counter("requests_total", &[]), 0.0);
        assert_eq!(metrics.counter_total("requests_total"), 4.0);
    }

    #[test]
    fn test_gauge_last_write_wins() {
        let metrics = MetricsCollector::default();
        assert_eq!(metrics.get_gauge("queue_depth", &[]), None);

        metrics.set_gauge("queue_depth", &[], 10.0);
        metrics.set_gauge("queue_depth", &[], 3.0);
        assert_eq!(metrics.get_gauge("queue_depth", &[]), Some(3.0));
        assert_eq!(metrics.latest("queue_depth", &[]), Some(3.0));
    }

    #[test]
    fn test_histogram_stats() {
        let metrics = MetricsCollector::default();
        for i in 1..=10 {
            metrics.observe_histogram("latency", &[], i as f64);
        }

        let stats = metrics.histogram_stats("latency", &[]).unwrap();
        assert_eq!(stats.count, 10);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 10.0);
        assert!((stats.p50 - 5.5).abs() < 1e-9);
        assert!(metrics.histogram_stats("missing", &[]).is_none());
    }

    #[test]
    fn test_summary_stats() {
        let metrics = MetricsCollector::default();
        metrics.observe_summary("payload_bytes", &[], 100.0);
        metrics.observe_summary("payload_bytes", &[], 300.0);

        let stats = metrics.histogram_stats("payload_bytes", &[]).unwrap();
        assert_eq!(stats.mean, 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_respects_retention() {
        let config = MetricsConfig::default().with_retention(Duration::from_secs(60));
        let metrics = MetricsCollector::new(config);
        let start = Instant::now();

        metrics.set_gauge("workers", &[], 1.0);
        tokio::time::advance(Duration::from_secs(120)).await;
        metrics.set_gauge("workers", &[], 2.0);

        assert_eq!(metrics.timeseries("workers", &[], start).len(), 2);
        assert_eq!(metrics.prune(), 1);

        let remaining = metrics.timeseries("workers", &[], start);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value, 2.0);
        // The gauge itself is untouched by pruning.
        assert_eq!(metrics.get_gauge("workers", &[]), Some(2.0));
    }

    #[test]
    fn test_snapshot() {
        let metrics = MetricsCollector::default();
        metrics.increment_counter("hits", &[("tier", "l1")], 1.0);
        metrics.set_gauge("size", &[], 5.0);
        metrics.observe_histogram("latency", &[], 0.1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counters.get("hits{tier=\"l1\"}"), Some(&1.0));
        assert_eq!(snapshot.gauges.get("size"), Some(&5.0));
        assert!(snapshot.histograms.contains_key("latency"));
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = MetricsCollector::default();
        metrics.describe("requests_total", "Total requests");
        metrics.increment_counter("requests_total", &[("client", "a")], 1.0);
        metrics.increment_counter("requests_total", &[("client", "b")], 2.0);
        metrics.set_gauge("pool_size", &[("pool", "cpu")], 4.0);
        metrics.observe_histogram("latency_seconds", &[], 0.003);
        metrics.observe_summary("batch_size", &[], 8.0);

        let output = metrics.to_prometheus();

        assert!(output.contains("# HELP requests_total Total requests"));
        assert_eq!(output.matches("# TYPE requests_total counter").count(), 1);
        assert!(output.contains("requests_total{client=\"a\"} 1"));
        assert!(output.contains("requests_total{client=\"b\"} 2"));
        assert!(output.contains("pool_size{pool=\"cpu\"} 4"));
        assert!(output.contains("# TYPE latency_seconds histogram"));
        assert!(output.contains("latency_seconds_bucket{le=\"0.005\"} 1"));
        assert!(output.contains("latency_seconds_bucket{le=\"0.001\"} 0"));
        assert!(output.contains("latency_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(output.contains("latency_seconds_count 1"));
        assert!(output.contains("# TYPE batch_size summary"));
        assert!(output.contains("batch_size{quantile=\"0.5\"} 8"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let key = SeriesKey::new("m", &[("path", "a\"b")]);
        assert_eq!(key.to_string(), "m{path=\"a\\\"b\"}");
    }
}
