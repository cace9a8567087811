//! Backend selection, failover and health checking.

use super::backend::{Backend, HealthTransition};
use super::health::HealthProbe;
use super::LoadBalancingStrategy;
use crate::config::LoadBalancerConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::partitioning::HashRing;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Distributes work across a set of backends.
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    backends: RwLock<Vec<Arc<Backend>>>,
    /// Placement ring for sticky sessions.
    ring: RwLock<HashRing>,
    rr_cursor: AtomicUsize,
    /// Smooth weighted round-robin running weights.
    current_weights: Mutex<HashMap<String, i64>>,
    probe: Option<Arc<dyn HealthProbe>>,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    failovers: AtomicU64,
    metrics: Option<Arc<MetricsCollector>>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            backends: RwLock::new(Vec::new()),
            ring: RwLock::new(HashRing::new()),
            rr_cursor: AtomicUsize::new(0),
            current_weights: Mutex::new(HashMap::new()),
            probe: None,
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    /// Register a backend. Fails if the id is already taken.
    pub fn add_backend(
        &self,
        id: &str,
        address: impl Into<String>,
        weight: u32,
    ) -> Result<Arc<Backend>> {
        let mut backends = self.backends.write();
        if backends.iter().any(|b| b.id() == id) {
            return Err(Error::Config(format!("backend {} already registered", id)));
        }
        let backend = Arc::new(
            Backend::new(id, address, weight).with_latency_window(self.config.latency_window),
        );
        backends.push(backend.clone());
        self.ring.write().add_node(id);
        self.update_gauges(&backends);
        info!(backend_id = %id, address = %backend.address(), weight, "Backend added");
        Ok(backend)
    }

    pub fn remove_backend(&self, id: &str) -> bool {
        let mut backends = self.backends.write();
        let before = backends.len();
        backends.retain(|b| b.id() != id);
        if backends.len() == before {
            return false;
        }
        self.ring.write().remove_node(id);
        self.current_weights.lock().remove(id);
        self.update_gauges(&backends);
        info!(backend_id = %id, "Backend removed");
        true
    }

    pub fn get_backend(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.read().iter().find(|b| b.id() == id).cloned()
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.read().iter().filter(|b| b.is_healthy()).count()
    }

    /// Pick a healthy backend for `client_key`.
    pub fn select(&self, client_key: Option<&str>) -> Result<Arc<Backend>> {
        self.select_excluding(client_key, &[])
    }

    fn select_excluding(
        &self,
        client_key: Option<&str>,
        exclude: &[String],
    ) -> Result<Arc<Backend>> {
        let candidates: Vec<Arc<Backend>> = {
            let backends = self.backends.read();
            let healthy: Vec<Arc<Backend>> = backends
                .iter()
                .filter(|b| b.is_healthy() && !exclude.iter().any(|e| e == b.id()))
                .cloned()
                .collect();
            if healthy.is_empty() {
                return Err(Error::BackendUnavailable {
                    total: backends.len(),
                });
            }
            healthy
        };

        if self.config.sticky_sessions {
            if let Some(key) = client_key {
                if let Some(backend) = self.sticky(key, &candidates) {
                    return Ok(backend);
                }
            }
        }

        let index = match self.config.strategy {
            LoadBalancingStrategy::RoundRobin => {
                self.rr_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            LoadBalancingStrategy::WeightedRoundRobin => self.smooth_weighted(&candidates),
            LoadBalancingStrategy::LeastConnections => min_index(&candidates, |b| {
                b.active_connections() as f64
            }),
            LoadBalancingStrategy::LeastResponseTime => min_index(&candidates, |b| {
                b.avg_latency().as_secs_f64()
            }),
            LoadBalancingStrategy::Random => rand::rng().random_range(0..candidates.len()),
            LoadBalancingStrategy::Adaptive => self.adaptive(&candidates),
        };
        Ok(candidates[index].clone())
    }

    /// First healthy candidate in ring order from the key's position.
    fn sticky(&self, key: &str, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let ring = self.ring.read();
        ring.walk(key.as_bytes())
            .into_iter()
            .find_map(|id| candidates.iter().find(|b| b.id() == id).cloned())
    }

    /// Smooth weighted round-robin: every candidate gains its weight, the
    /// largest running weight wins and pays back the total.
    fn smooth_weighted(&self, candidates: &[Arc<Backend>]) -> usize {
        let mut current = self.current_weights.lock();
        let total: i64 = candidates.iter().map(|b| b.weight() as i64).sum();
        let mut best = 0;
        let mut best_weight = i64::MIN;
        for (i, backend) in candidates.iter().enumerate() {
            let w = current.entry(backend.id().to_string()).or_insert(0);
            *w += backend.weight() as i64;
            if *w > best_weight {
                best_weight = *w;
                best = i;
            }
        }
        if let Some(w) = current.get_mut(candidates[best].id()) {
            *w -= total;
        }
        best
    }

    /// Lowest blended score of normalized latency, error rate, load and
    /// (inverted) weight.
    fn adaptive(&self, candidates: &[Arc<Backend>]) -> usize {
        let w = self.config.adaptive_weights;
        let max_latency = candidates
            .iter()
            .map(|b| b.avg_latency().as_secs_f64())
            .fold(0.0_f64, f64::max);
        let max_connections = candidates
            .iter()
            .map(|b| b.active_connections())
            .max()
            .unwrap_or(0)
            .max(1) as f64;
        let max_weight = candidates.iter().map(|b| b.weight()).max().unwrap_or(1) as f64;

        min_index(candidates, |b| {
            let latency = if max_latency > 0.0 {
                b.avg_latency().as_secs_f64() / max_latency
            } else {
                0.0
            };
            w.latency * latency
                + w.error_rate * b.error_rate()
                + w.connections * (b.active_connections() as f64 / max_connections)
                + w.weight * (1.0 - b.weight() as f64 / max_weight)
        })
    }

    /// Run `f` on a selected backend, failing over to other healthy
    /// backends on error.
    ///
    /// At most `max_attempts` distinct backends are tried. Latency and
    /// outcome are recorded on every attempt.
    pub async fn execute_request<T, F, Fut>(&self, client_key: Option<&str>, f: F) -> Result<T>
    where
        F: Fn(Arc<Backend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut tried: Vec<String> = Vec::new();
        let mut last_error = None;

        while tried.len() < self.config.max_attempts {
            let backend = match self.select_excluding(client_key, &tried) {
                Ok(backend) => backend,
                Err(e) => {
                    if last_error.is_none() {
                        last_error = Some(e);
                    }
                    break;
                }
            };
            if !tried.is_empty() {
                self.failovers.fetch_add(1, Ordering::Relaxed);
                debug!(backend_id = %backend.id(), attempt = tried.len() + 1, "Failing over");
            }
            tried.push(backend.id().to_string());

            let guard = backend.acquire();
            let start = Instant::now();
            let result = f(guard.backend().clone()).await;
            let latency = start.elapsed();
            drop(guard);

            let success = result.is_ok();
            backend.record_request(latency, success);
            self.record_metrics(&backend, latency, success);
            match result {
                Ok(value) => {
                    backend.record_passive_success();
                    return Ok(value);
                }
                Err(e) => {
                    self.total_errors.fetch_add(1, Ordering::Relaxed);
                    self.apply_transition(
                        &backend,
                        backend.observe_health(
                            false,
                            self.config.unhealthy_threshold,
                            self.config.healthy_threshold,
                        ),
                    );
                    warn!(backend_id = %backend.id(), error = %e, "Backend request failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::BackendUnavailable {
            total: self.backends.read().len(),
        }))
    }

    fn record_metrics(&self, backend: &Backend, latency: std::time::Duration, success: bool) {
        if let Some(metrics) = &self.metrics {
            let outcome = if success { "success" } else { "error" };
            metrics.increment_counter(
                "backend_requests_total",
                &[("backend", backend.id()), ("outcome", outcome)],
                1.0,
            );
            metrics.observe_duration(
                "backend_request_duration_seconds",
                &[("backend", backend.id())],
                latency,
            );
        }
    }

    fn apply_transition(&self, backend: &Backend, transition: Option<HealthTransition>) {
        match transition {
            Some(HealthTransition::BecameUnhealthy) => {
                warn!(backend_id = %backend.id(), "Backend marked unhealthy");
            }
            Some(HealthTransition::BecameHealthy) => {
                info!(backend_id = %backend.id(), "Backend restored");
            }
            None => return,
        }
        self.update_gauges(&self.backends.read());
    }

    fn update_gauges(&self, backends: &[Arc<Backend>]) {
        if let Some(metrics) = &self.metrics {
            let healthy = backends.iter().filter(|b| b.is_healthy()).count();
            metrics.set_gauge("backends_healthy", &[], healthy as f64);
            metrics.set_gauge("backends_total", &[], backends.len() as f64);
        }
    }

    /// Probe every backend once. Returns the number of healthy backends.
    pub async fn check_health_once(&self) -> usize {
        let Some(probe) = self.probe.clone() else {
            return self.healthy_count();
        };
        let backends = self.backends();
        let timeout = self.config.probe_timeout;

        let results = join_all(backends.iter().map(|backend| {
            let probe = probe.clone();
            async move {
                tokio::time::timeout(timeout, probe.probe(backend))
                    .await
                    .unwrap_or(false)
            }
        }))
        .await;

        for (backend, ok) in backends.iter().zip(results) {
            let transition = backend.observe_health(
                ok,
                self.config.unhealthy_threshold,
                self.config.healthy_threshold,
            );
            self.apply_transition(backend, transition);
        }
        self.healthy_count()
    }

    /// Probe backends on the configured interval until shutdown is signalled.
    pub async fn run_health_check_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let healthy = self.check_health_once().await;
                    if healthy == 0 && !self.backends.read().is_empty() {
                        warn!("No healthy backends");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Health check loop shutting down");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let backends = self.backends.read();
        LoadBalancerStats {
            strategy: self.config.strategy,
            sticky_sessions: self.config.sticky_sessions,
            total_backends: backends.len(),
            healthy_backends: backends.iter().filter(|b| b.is_healthy()).count(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            backends: backends.iter().map(|b| b.stats()).collect(),
        }
    }
}

fn min_index<F>(candidates: &[Arc<Backend>], score: F) -> usize
where
    F: Fn(&Backend) -> f64,
{
    candidates
        .iter()
        .enumerate()
        .map(|(i, b)| (i, score(b)))
        .fold((0, f64::INFINITY), |best, (i, s)| if s < best.1 { (i, s) } else { best })
        .0
}

/// Load balancer statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub strategy: LoadBalancingStrategy,
    pub sticky_sessions: bool,
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub failovers: u64,
    pub backends: Vec<super::BackendStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use async_trait::async_trait;
    use dashmap::DashSet;
    use std::time::Duration;

    fn balancer(strategy: LoadBalancingStrategy, ids: &[(&str, u32)]) -> LoadBalancer {
        let lb = LoadBalancer::new(LoadBalancerConfig::new(strategy));
        for (id, weight) in ids {
            lb.add_backend(id, format!("{}:8080", id), *weight).unwrap();
        }
        lb
    }

    fn pick(lb: &LoadBalancer, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| lb.select(None).unwrap().id().to_string())
            .collect()
    }

    #[test]
    fn test_round_robin() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, &[("a", 1), ("b", 1), ("c", 1)]);
        assert_eq!(pick(&lb, 6), vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_smooth_weighted_round_robin() {
        let lb = balancer(
            LoadBalancingStrategy::WeightedRoundRobin,
            &[("a", 5), ("b", 1), ("c", 1)],
        );
        let picks = pick(&lb, 7);
        assert_eq!(picks, vec!["a", "a", "b", "a", "c", "a", "a"]);
    }

    #[test]
    fn test_least_connections() {
        let lb = balancer(LoadBalancingStrategy::LeastConnections, &[("a", 1), ("b", 1)]);
        let a = lb.get_backend("a").unwrap();
        let _busy = a.acquire();
        assert_eq!(lb.select(None).unwrap().id(), "b");
    }

    #[test]
    fn test_least_response_time_and_adaptive() {
        for strategy in [
            LoadBalancingStrategy::LeastResponseTime,
            LoadBalancingStrategy::Adaptive,
        ] {
            let lb = balancer(strategy, &[("slow", 1), ("fast", 1)]);
            lb.get_backend("slow")
                .unwrap()
                .record_request(Duration::from_millis(500), true);
            lb.get_backend("fast")
                .unwrap()
                .record_request(Duration::from_millis(5), true);
            assert_eq!(lb.select(None).unwrap().id(), "fast", "{}", strategy);
        }
    }

    #[test]
    fn test_adaptive_penalizes_errors() {
        let lb = balancer(LoadBalancingStrategy::Adaptive, &[("flaky", 1), ("solid", 1)]);
        let flaky = lb.get_backend("flaky").unwrap();
        let solid = lb.get_backend("solid").unwrap();
        for _ in 0..10 {
            flaky.record_request(Duration::from_millis(10), false);
            solid.record_request(Duration::from_millis(12), true);
        }
        assert_eq!(lb.select(None).unwrap().id(), "solid");
    }

    #[test]
    fn test_random_only_returns_healthy() {
        let lb = balancer(LoadBalancingStrategy::Random, &[("a", 1), ("b", 1)]);
        lb.get_backend("a").unwrap().set_healthy(false);
        assert!(pick(&lb, 20).iter().all(|id| id == "b"));
    }

    #[test]
    fn test_sticky_sessions() {
        let lb = LoadBalancer::new(
            LoadBalancerConfig::new(LoadBalancingStrategy::RoundRobin).with_sticky_sessions(true),
        );
        for id in ["a", "b", "c", "d"] {
            lb.add_backend(id, id, 1).unwrap();
        }

        let first = lb.select(Some("client-42")).unwrap().id().to_string();
        for _ in 0..10 {
            assert_eq!(lb.select(Some("client-42")).unwrap().id(), first);
        }

        lb.get_backend(&first).unwrap().set_healthy(false);
        let fallback = lb.select(Some("client-42")).unwrap().id().to_string();
        assert_ne!(fallback, first);
        assert_eq!(lb.select(Some("client-42")).unwrap().id(), fallback);

        lb.get_backend(&first).unwrap().set_healthy(true);
        assert_eq!(lb.select(Some("client-42")).unwrap().id(), first);
    }

    #[test]
    fn test_no_healthy_backend() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, &[("a", 1)]);
        lb.get_backend("a").unwrap().set_healthy(false);
        assert!(matches!(
            lb.select(None),
            Err(Error::BackendUnavailable { total: 1 })
        ));
        assert!(lb.remove_backend("a"));
        assert!(!lb.remove_backend("a"));
    }

    #[tokio::test]
    async fn test_execute_request_fails_over() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, &[("bad", 1), ("good", 1)]);

        let result = lb
            .execute_request(None, |backend| async move {
                if backend.id() == "bad" {
                    Err(Error::from(StageError::failed("call", "refused")))
                } else {
                    Ok(backend.id().to_string())
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "good");

        let stats = lb.stats();
        assert_eq!(stats.failovers, 1);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(lb.get_backend("bad").unwrap().active_connections(), 0);
    }

    #[tokio::test]
    async fn test_execute_request_exhausts_backends() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, &[("a", 1), ("b", 1)]);
        let err = lb
            .execute_request(None, |_| async {
                Err::<(), _>(Error::from(StageError::failed("call", "down")))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stage(_)));
        assert_eq!(lb.stats().total_errors, 2);
    }

    #[tokio::test]
    async fn test_interleaved_successes_reset_failure_streak() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, &[("a", 1)]);
        for fail in [true, false, true, false, true] {
            let _ = lb
                .execute_request(None, |backend| async move {
                    if fail {
                        Err(Error::from(StageError::failed("call", "flaky")))
                    } else {
                        Ok(backend.id().to_string())
                    }
                })
                .await;
        }
        assert!(lb.get_backend("a").unwrap().is_healthy());

        // Three failures in a row still trip it.
        for _ in 0..3 {
            let _ = lb
                .execute_request(None, |_| async {
                    Err::<(), _>(Error::from(StageError::failed("call", "down")))
                })
                .await;
        }
        assert!(!lb.get_backend("a").unwrap().is_healthy());
        assert_eq!(lb.stats().healthy_backends, 0);
    }

    struct FlagProbe {
        down: DashSet<String>,
    }

    #[async_trait]
    impl HealthProbe for FlagProbe {
        async fn probe(&self, backend: &Backend) -> bool {
            !self.down.contains(backend.id())
        }
    }

    #[tokio::test]
    async fn test_health_checks_mark_and_restore() {
        let probe = Arc::new(FlagProbe {
            down: DashSet::new(),
        });
        let lb = LoadBalancer::new(LoadBalancerConfig::default()).with_probe(probe.clone());
        lb.add_backend("a", "a", 1).unwrap();
        lb.add_backend("b", "b", 1).unwrap();

        probe.down.insert("a".to_string());
        assert_eq!(lb.check_health_once().await, 2);
        assert_eq!(lb.check_health_once().await, 2);
        assert_eq!(lb.check_health_once().await, 1);
        assert!(!lb.get_backend("a").unwrap().is_healthy());

        probe.down.clear();
        assert_eq!(lb.check_health_once().await, 1);
        assert_eq!(lb.check_health_once().await, 2);
    }
}
