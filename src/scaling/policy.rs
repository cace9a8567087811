//! Scaling policies.

use super::trend::TrendMethod;
use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Signal a policy watches.
///
/// Built-in signals are unlabeled gauges the orchestrator refreshes before
/// every evaluation; `Custom` reads any unlabeled gauge by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ScalingMetric {
    CpuUtilization,
    QueueDepth,
    Latency,
    ErrorRate,
    RequestRate,
    Custom(String),
}

impl ScalingMetric {
    /// Gauge the value is read from.
    pub fn gauge_name(&self) -> &str {
        match self {
            ScalingMetric::CpuUtilization => "pipeline_cpu_utilization",
            ScalingMetric::QueueDepth => "pipeline_queue_depth",
            ScalingMetric::Latency => "pipeline_latency_seconds",
            ScalingMetric::ErrorRate => "pipeline_error_rate",
            ScalingMetric::RequestRate => "pipeline_request_rate",
            ScalingMetric::Custom(name) => name,
        }
    }
}

impl fmt::Display for ScalingMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingMetric::CpuUtilization => write!(f, "cpu_utilization"),
            ScalingMetric::QueueDepth => write!(f, "queue_depth"),
            ScalingMetric::Latency => write!(f, "latency"),
            ScalingMetric::ErrorRate => write!(f, "error_rate"),
            ScalingMetric::RequestRate => write!(f, "request_rate"),
            ScalingMetric::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// When and how far to scale for one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub metric: ScalingMetric,

    /// Scale up when the observed or projected value reaches this.
    pub scale_up_threshold: f64,

    /// Scale down when both observed and projected values are at or below this.
    pub scale_down_threshold: f64,

    pub scale_up_step: usize,
    pub scale_down_step: usize,

    /// Minimum time between two scaling actions this policy votes for.
    pub cooldown: Duration,

    /// Observations averaged per decision; also the history needed to vote.
    pub evaluation_periods: usize,

    pub min_instances: usize,
    pub max_instances: usize,

    /// Trend used for predictive scaling; `None` reacts to the average only.
    pub trend: Option<TrendMethod>,

    /// Evaluations ahead the trend is projected.
    pub horizon: u32,
}

impl ScalingPolicy {
    pub fn new(metric: ScalingMetric, scale_up_threshold: f64, scale_down_threshold: f64) -> Self {
        Self {
            metric,
            scale_up_threshold,
            scale_down_threshold,
            scale_up_step: 1,
            scale_down_step: 1,
            cooldown: Duration::from_secs(60),
            evaluation_periods: 2,
            min_instances: 1,
            max_instances: 10,
            trend: None,
            horizon: 5,
        }
    }

    pub fn with_steps(mut self, up: usize, down: usize) -> Self {
        self.scale_up_step = up;
        self.scale_down_step = down;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_evaluation_periods(mut self, periods: usize) -> Self {
        self.evaluation_periods = periods;
        self
    }

    pub fn with_bounds(mut self, min_instances: usize, max_instances: usize) -> Self {
        self.min_instances = min_instances;
        self.max_instances = max_instances;
        self
    }

    /// Enable predictive scaling.
    pub fn with_trend(mut self, trend: TrendMethod, horizon: u32) -> Self {
        self.trend = Some(trend);
        self.horizon = horizon;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Config(format!("scaling policy {}: {}", self.metric, msg)));
        if self.scale_down_threshold >= self.scale_up_threshold {
            return invalid("scale_down_threshold must be below scale_up_threshold".into());
        }
        if self.scale_up_step == 0 || self.scale_down_step == 0 {
            return invalid("steps must be > 0".into());
        }
        if self.evaluation_periods == 0 {
            return invalid("evaluation_periods must be > 0".into());
        }
        if self.min_instances == 0 || self.min_instances > self.max_instances {
            return invalid(format!(
                "bounds must satisfy 1 <= min <= max, got {}..{}",
                self.min_instances, self.max_instances
            ));
        }
        if let Some(TrendMethod::Ema { alpha }) = self.trend {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return invalid(format!("ema alpha must be in (0, 1], got {}", alpha));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(ScalingPolicy::new(ScalingMetric::CpuUtilization, 0.8, 0.2)
            .validate()
            .is_ok());
        assert!(ScalingPolicy::new(ScalingMetric::CpuUtilization, 0.2, 0.8)
            .validate()
            .is_err());
        assert!(ScalingPolicy::new(ScalingMetric::QueueDepth, 100.0, 10.0)
            .with_bounds(5, 2)
            .validate()
            .is_err());
        assert!(ScalingPolicy::new(ScalingMetric::Latency, 1.0, 0.1)
            .with_trend(TrendMethod::Ema { alpha: 1.5 }, 3)
            .validate()
            .is_err());
    }

    #[test]
    fn test_gauge_names() {
        assert_eq!(ScalingMetric::QueueDepth.gauge_name(), "pipeline_queue_depth");
        assert_eq!(
            ScalingMetric::Custom("gpu_busy".into()).gauge_name(),
            "gpu_busy"
        );
    }
}
