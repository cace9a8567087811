//! Fault injection for pipeline stages and backends.
//!
//! A [`ChaosController`] decides, per stage call, whether to pass, fail
//! (retryable or fatal) or delay. [`ChaosStage`] applies those decisions in
//! front of a real stage; [`ChaosProbe`] does the same for backend health.

use crate::balancer::{Backend, HealthProbe};
use crate::error::StageError;
use crate::stage::{PipelineStage, StageContext, StageRef};
use crate::types::ResourceClass;
use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for chaos testing.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of a retryable failure (0.0 - 1.0).
    pub failure_probability: f64,

    /// Probability of a fatal failure (0.0 - 1.0).
    pub fatal_probability: f64,

    /// Probability of a delay before the stage runs (0.0 - 1.0).
    pub delay_probability: f64,

    /// Minimum injected delay.
    pub delay_min: Duration,

    /// Maximum injected delay.
    pub delay_max: Duration,

    /// Random seed for reproducibility.
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_probability: 0.0,
            fatal_probability: 0.0,
            delay_probability: 0.0,
            delay_min: Duration::from_millis(10),
            delay_max: Duration::from_millis(100),
            seed: None,
        }
    }
}

impl ChaosConfig {
    /// Create a config for light chaos testing.
    pub fn light() -> Self {
        Self {
            failure_probability: 0.01,
            delay_probability: 0.05,
            ..Default::default()
        }
    }

    /// Create a config for moderate chaos testing.
    pub fn moderate() -> Self {
        Self {
            failure_probability: 0.05,
            fatal_probability: 0.005,
            delay_probability: 0.1,
            ..Default::default()
        }
    }

    /// Create a config for heavy chaos testing.
    pub fn heavy() -> Self {
        Self {
            failure_probability: 0.2,
            fatal_probability: 0.02,
            delay_probability: 0.2,
            ..Default::default()
        }
    }

    /// Disable all chaos.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// What happens to one stage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosAction {
    Pass,
    Fail,
    FailFatal,
    Delay(Duration),
}

/// Chaos controller for injecting failures.
#[derive(Debug)]
pub struct ChaosController {
    config: ChaosConfig,
    enabled: AtomicBool,
    rng: Mutex<StdRng>,
    /// Actions consumed before any random decision, enabled or not.
    scripted: Mutex<VecDeque<ChaosAction>>,
    calls: AtomicU64,
    failures_injected: AtomicU64,
    fatals_injected: AtomicU64,
    delays_injected: AtomicU64,
}

impl ChaosController {
    pub fn new(config: ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            enabled: AtomicBool::new(false),
            rng: Mutex::new(rng),
            scripted: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            failures_injected: AtomicU64::new(0),
            fatals_injected: AtomicU64::new(0),
            delays_injected: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChaosConfig::default())
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Queue deterministic actions for the next calls.
    pub fn script(&self, actions: impl IntoIterator<Item = ChaosAction>) {
        self.scripted.lock().extend(actions);
    }

    /// Make the next `n` calls fail with a retryable error.
    pub fn fail_next(&self, n: usize) {
        self.script(std::iter::repeat(ChaosAction::Fail).take(n));
    }

    /// Decide the fate of the next call.
    pub fn next_action(&self) -> ChaosAction {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let action = match self.scripted.lock().pop_front() {
            Some(action) => action,
            None if !self.is_enabled() => ChaosAction::Pass,
            None => self.roll(),
        };
        match action {
            ChaosAction::Fail => self.failures_injected.fetch_add(1, Ordering::Relaxed),
            ChaosAction::FailFatal => self.fatals_injected.fetch_add(1, Ordering::Relaxed),
            ChaosAction::Delay(_) => self.delays_injected.fetch_add(1, Ordering::Relaxed),
            ChaosAction::Pass => 0,
        };
        action
    }

    fn roll(&self) -> ChaosAction {
        let mut rng = self.rng.lock();
        let roll: f64 = rng.random();
        let fatal = self.config.fatal_probability;
        let failure = fatal + self.config.failure_probability;
        let delay = failure + self.config.delay_probability;

        if roll < fatal {
            ChaosAction::FailFatal
        } else if roll < failure {
            ChaosAction::Fail
        } else if roll < delay {
            let min_ms = self.config.delay_min.as_millis() as u64;
            let max_ms = self.config.delay_max.as_millis().max(min_ms as u128) as u64;
            ChaosAction::Delay(Duration::from_millis(rng.random_range(min_ms..=max_ms)))
        } else {
            ChaosAction::Pass
        }
    }

    pub fn stats(&self) -> ChaosStats {
        ChaosStats {
            calls: self.calls.load(Ordering::Relaxed),
            failures_injected: self.failures_injected.load(Ordering::Relaxed),
            fatals_injected: self.fatals_injected.load(Ordering::Relaxed),
            delays_injected: self.delays_injected.load(Ordering::Relaxed),
            enabled: self.is_enabled(),
        }
    }
}

/// Chaos testing statistics.
#[derive(Debug, Clone)]
pub struct ChaosStats {
    pub calls: u64,
    pub failures_injected: u64,
    pub fatals_injected: u64,
    pub delays_injected: u64,
    pub enabled: bool,
}

/// Wraps a stage and injects the controller's decisions before it runs.
pub struct ChaosStage<T> {
    inner: StageRef<T>,
    controller: Arc<ChaosController>,
}

impl<T> ChaosStage<T> {
    pub fn new(inner: StageRef<T>, controller: Arc<ChaosController>) -> Self {
        Self { inner, controller }
    }
}

#[async_trait]
impl<T: Send + 'static> PipelineStage<T> for ChaosStage<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn resource_class(&self) -> ResourceClass {
        self.inner.resource_class()
    }

    async fn process(&self, item: T, ctx: &StageContext) -> Result<T, StageError> {
        match self.controller.next_action() {
            ChaosAction::Pass => {}
            ChaosAction::Fail => {
                return Err(StageError::failed(self.name(), "injected failure"));
            }
            ChaosAction::FailFatal => {
                return Err(StageError::fatal(self.name(), "injected fatal failure"));
            }
            ChaosAction::Delay(delay) => tokio::time::sleep(delay).await,
        }
        self.inner.process(item, ctx).await
    }
}

/// Health probe whose answers are set by the test.
#[derive(Debug, Default)]
pub struct ChaosProbe {
    down: DashSet<String>,
}

impl ChaosProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, backend_id: &str, down: bool) {
        if down {
            self.down.insert(backend_id.to_string());
        } else {
            self.down.remove(backend_id);
        }
    }
}

#[async_trait]
impl HealthProbe for ChaosProbe {
    async fn probe(&self, backend: &Backend) -> bool {
        !self.down.contains(backend.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_controller_passes() {
        let controller = ChaosController::new(ChaosConfig::heavy().with_seed(7));
        for _ in 0..100 {
            assert_eq!(controller.next_action(), ChaosAction::Pass);
        }
        assert_eq!(controller.stats().calls, 100);
    }

    #[test]
    fn test_script_runs_first() {
        let controller = ChaosController::with_defaults();
        controller.fail_next(2);
        controller.script([ChaosAction::FailFatal]);

        assert_eq!(controller.next_action(), ChaosAction::Fail);
        assert_eq!(controller.next_action(), ChaosAction::Fail);
        assert_eq!(controller.next_action(), ChaosAction::FailFatal);
        assert_eq!(controller.next_action(), ChaosAction::Pass);

        let stats = controller.stats();
        assert_eq!(stats.failures_injected, 2);
        assert_eq!(stats.fatals_injected, 1);
    }

    #[test]
    fn test_seeded_rolls_are_reproducible() {
        let a = ChaosController::new(ChaosConfig::heavy().with_seed(42));
        let b = ChaosController::new(ChaosConfig::heavy().with_seed(42));
        a.enable();
        b.enable();
        let run_a: Vec<_> = (0..50).map(|_| a.next_action()).collect();
        let run_b: Vec<_> = (0..50).map(|_| b.next_action()).collect();
        assert_eq!(run_a, run_b);
        assert!(run_a.iter().any(|action| *action != ChaosAction::Pass));
    }
}
