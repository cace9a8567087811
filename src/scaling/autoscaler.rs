//! Policy evaluation and scaling decisions.

use super::policy::{ScalingMetric, ScalingPolicy};
use super::ScaleTarget;
use crate::config::AutoScalerConfig;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Called before each evaluation to publish fresh signal gauges.
pub type SignalRefresh = Arc<dyn Fn(&MetricsCollector) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingDirection {
    Up,
    Down,
    Hold,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct ScalingDecision {
    pub direction: ScalingDirection,
    pub from: usize,
    pub to: usize,
    pub reason: String,
}

impl ScalingDecision {
    fn hold(instances: usize, reason: impl Into<String>) -> Self {
        Self {
            direction: ScalingDirection::Hold,
            from: instances,
            to: instances,
            reason: reason.into(),
        }
    }
}

struct PolicyState {
    policy: ScalingPolicy,
    history: VecDeque<f64>,
}

impl PolicyState {
    /// Vote from the current history, or `None` while it is too short.
    fn vote(&self) -> Option<(ScalingDirection, f64, Option<f64>)> {
        let periods = self.policy.evaluation_periods;
        if self.history.len() < periods {
            return None;
        }
        let recent = self.history.iter().rev().take(periods);
        let average = recent.sum::<f64>() / periods as f64;

        let projected = self.policy.trend.and_then(|trend| {
            let history: Vec<f64> = self.history.iter().copied().collect();
            trend.project(&history, self.policy.horizon)
        });

        let up = average >= self.policy.scale_up_threshold
            || projected.is_some_and(|p| p >= self.policy.scale_up_threshold);
        let down = average <= self.policy.scale_down_threshold
            && projected.map_or(true, |p| p <= self.policy.scale_down_threshold);

        let direction = if up {
            ScalingDirection::Up
        } else if down {
            ScalingDirection::Down
        } else {
            ScalingDirection::Hold
        };
        Some((direction, average, projected))
    }
}

/// Adjusts a [`ScaleTarget`] from metric-driven policies.
///
/// Any policy voting up scales up. Scaling down needs at least one down vote
/// and no up vote. The step is the largest among the voters and the result
/// is clamped to the tightest bound among them.
pub struct AutoScaler {
    target: Arc<dyn ScaleTarget>,
    metrics: Arc<MetricsCollector>,
    policies: Mutex<Vec<PolicyState>>,
    history_size: usize,
    evaluation_interval: Duration,
    refresh: Option<SignalRefresh>,
    last_scaled_at: Mutex<Option<Instant>>,
    last_decision: Mutex<Option<ScalingDecision>>,
    evaluations: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
}

impl AutoScaler {
    pub fn new(
        config: AutoScalerConfig,
        target: Arc<dyn ScaleTarget>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let policies = config
            .policies
            .into_iter()
            .map(|policy| PolicyState {
                policy,
                history: VecDeque::new(),
            })
            .collect();
        Self {
            target,
            metrics,
            policies: Mutex::new(policies),
            history_size: config.history_size.max(1),
            evaluation_interval: config.evaluation_interval,
            refresh: None,
            last_scaled_at: Mutex::new(None),
            last_decision: Mutex::new(None),
            evaluations: AtomicU64::new(0),
            scale_ups: AtomicU64::new(0),
            scale_downs: AtomicU64::new(0),
        }
    }

    pub fn with_refresh(mut self, refresh: SignalRefresh) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn add_policy(&self, policy: ScalingPolicy) -> Result<()> {
        policy.validate()?;
        info!(metric = %policy.metric, "Adding scaling policy");
        self.policies.lock().push(PolicyState {
            policy,
            history: VecDeque::new(),
        });
        Ok(())
    }

    /// Drop every policy watching `metric`. Returns how many were removed.
    pub fn remove_policy(&self, metric: &ScalingMetric) -> usize {
        let mut policies = self.policies.lock();
        let before = policies.len();
        policies.retain(|state| &state.policy.metric != metric);
        before - policies.len()
    }

    /// Record one observation per policy and act on the votes.
    pub fn evaluate(&self) -> Result<ScalingDecision> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        if let Some(refresh) = &self.refresh {
            refresh(&self.metrics);
        }
        let current = self.target.current_instances();

        let mut up_voters: Vec<ScalingPolicy> = Vec::new();
        let mut down_voters: Vec<ScalingPolicy> = Vec::new();
        {
            let mut policies = self.policies.lock();
            if policies.is_empty() {
                return Ok(self.remember(ScalingDecision::hold(current, "no policies")));
            }
            for state in policies.iter_mut() {
                let Some(value) = self.metrics.get_gauge(state.policy.metric.gauge_name(), &[])
                else {
                    continue;
                };
                state.history.push_back(value);
                while state.history.len() > self.history_size {
                    state.history.pop_front();
                }

                if let Some((direction, average, projected)) = state.vote() {
                    debug!(
                        metric = %state.policy.metric,
                        average,
                        projected = projected.unwrap_or(f64::NAN),
                        vote = ?direction,
                        "Policy evaluated"
                    );
                    match direction {
                        ScalingDirection::Up => up_voters.push(state.policy.clone()),
                        ScalingDirection::Down => down_voters.push(state.policy.clone()),
                        ScalingDirection::Hold => {}
                    }
                }
            }
        }

        let (direction, voters) = if !up_voters.is_empty() {
            (ScalingDirection::Up, up_voters)
        } else if !down_voters.is_empty() {
            (ScalingDirection::Down, down_voters)
        } else {
            return Ok(self.remember(ScalingDecision::hold(current, "within thresholds")));
        };

        let cooldown = voters.iter().map(|p| p.cooldown).max().unwrap_or_default();
        if let Some(at) = *self.last_scaled_at.lock() {
            if at.elapsed() < cooldown {
                return Ok(self.remember(ScalingDecision::hold(current, "cooling down")));
            }
        }

        let metrics: Vec<String> = voters.iter().map(|p| p.metric.to_string()).collect();
        let desired = match direction {
            ScalingDirection::Up => {
                let step = voters.iter().map(|p| p.scale_up_step).max().unwrap_or(1);
                let ceiling = voters.iter().map(|p| p.max_instances).min().unwrap_or(current);
                current.saturating_add(step).min(ceiling)
            }
            _ => {
                let step = voters.iter().map(|p| p.scale_down_step).max().unwrap_or(1);
                let floor = voters.iter().map(|p| p.min_instances).max().unwrap_or(current);
                current.saturating_sub(step).max(floor)
            }
        };

        let moves = match direction {
            ScalingDirection::Up => desired > current,
            _ => desired < current,
        };
        if !moves {
            return Ok(self.remember(ScalingDecision::hold(current, "at instance bound")));
        }

        if let Err(e) = self.target.scale_to(desired) {
            warn!(scale_target = %self.target.name(), desired, error = %e, "Scaling failed");
            return Err(e);
        }
        *self.last_scaled_at.lock() = Some(Instant::now());

        let label = match direction {
            ScalingDirection::Up => {
                self.scale_ups.fetch_add(1, Ordering::Relaxed);
                "up"
            }
            _ => {
                self.scale_downs.fetch_add(1, Ordering::Relaxed);
                "down"
            }
        };
        let target = self.target.name();
        info!(
            scale_target = %target,
            from = current,
            to = desired,
            direction = label,
            metrics = ?metrics,
            "Scaled"
        );
        self.metrics.increment_counter(
            "autoscaler_decisions_total",
            &[("target", &target), ("direction", label)],
            1.0,
        );
        self.metrics
            .set_gauge("autoscaler_instances", &[("target", &target)], desired as f64);

        Ok(self.remember(ScalingDecision {
            direction,
            from: current,
            to: desired,
            reason: format!("{} voted {}", metrics.join(","), label),
        }))
    }

    /// Where the history of `metric` is heading, without acting on it.
    pub fn predict(&self, metric: &ScalingMetric) -> Option<ScalingDirection> {
        let policies = self.policies.lock();
        let state = policies.iter().find(|s| &s.policy.metric == metric)?;
        let trend = state.policy.trend?;
        let history: Vec<f64> = state.history.iter().copied().collect();
        let projected = trend.project(&history, state.policy.horizon)?;
        Some(if projected >= state.policy.scale_up_threshold {
            ScalingDirection::Up
        } else if projected <= state.policy.scale_down_threshold {
            ScalingDirection::Down
        } else {
            ScalingDirection::Hold
        })
    }

    fn remember(&self, decision: ScalingDecision) -> ScalingDecision {
        *self.last_decision.lock() = Some(decision.clone());
        decision
    }

    pub fn stats(&self) -> AutoScalerStats {
        AutoScalerStats {
            target: self.target.name(),
            current_instances: self.target.current_instances(),
            policies: self.policies.lock().len(),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            scale_ups: self.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.scale_downs.load(Ordering::Relaxed),
            last_decision: self.last_decision.lock().clone(),
            since_last_scale: self.last_scaled_at.lock().map(|at| at.elapsed()),
        }
    }

    /// Evaluate on every tick until shutdown is signalled.
    pub async fn run_evaluation_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.evaluation_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.evaluate() {
                        warn!(error = %e, "Auto-scaler evaluation failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Auto-scaler shutting down");
                    break;
                }
            }
        }
    }
}

/// Auto-scaler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct AutoScalerStats {
    pub target: String,
    pub current_instances: usize,
    pub policies: usize,
    pub evaluations: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub last_decision: Option<ScalingDecision>,
    pub since_last_scale: Option<Duration>,
}
