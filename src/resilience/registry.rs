//! Lazily populated set of breakers, one per dependency.

use super::breaker::{BreakerStats, CircuitBreaker, CircuitState};
use crate::config::CircuitBreakerConfig;
use crate::metrics::MetricsCollector;
use dashmap::DashMap;
use std::sync::Arc;

/// One [`CircuitBreaker`] per dependency id, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            metrics: None,
        }
    }

    /// Attach a metrics collector to every breaker created from now on.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the breaker for `dependency`, creating it if needed.
    pub fn get_or_create(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::new(dependency, self.config.clone());
                if let Some(metrics) = &self.metrics {
                    breaker = breaker.with_metrics(Arc::clone(metrics));
                }
                Arc::new(breaker)
            });
        Arc::clone(breaker.value())
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(dependency).map(|b| Arc::clone(b.value()))
    }

    /// Current state of `dependency`, `Closed` if it has no breaker yet.
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.get(dependency)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Forget a dependency.
    pub fn remove(&self, dependency: &str) {
        self.breakers.remove(dependency);
    }

    /// Dependencies whose circuit is currently open.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|b| b.value().state() == CircuitState::Open)
            .map(|b| b.key().clone())
            .collect();
        open.sort();
        open
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        stats
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }
}
