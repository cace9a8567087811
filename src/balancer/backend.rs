//! Backend instances and their live statistics.

use crate::types::BackendId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A backend the balancer can route work to.
///
/// Counters are atomics so selection never takes a lock; only the rolling
/// latency window is behind a mutex.
#[derive(Debug)]
pub struct Backend {
    id: BackendId,
    address: String,
    weight: u32,
    healthy: AtomicBool,
    active_connections: AtomicUsize,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    latencies: Mutex<VecDeque<Duration>>,
    latency_window: usize,
}

/// Health transition produced by a probe or request outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    BecameHealthy,
    BecameUnhealthy,
}

impl Backend {
    pub fn new(id: impl Into<BackendId>, address: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: weight.max(1),
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            latencies: Mutex::new(VecDeque::new()),
            latency_window: 100,
        }
    }

    pub(crate) fn with_latency_window(mut self, window: usize) -> Self {
        self.latency_window = window.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Force the health flag, resetting the consecutive counters.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Mean of the recent latency window; zero before any request.
    pub fn avg_latency(&self) -> Duration {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return Duration::ZERO;
        }
        latencies.iter().sum::<Duration>() / latencies.len() as u32
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.total_errors.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Track an in-flight request until the guard drops.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    /// Record a completed request.
    pub fn record_request(&self, latency: Duration, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut latencies = self.latencies.lock();
        if latencies.len() >= self.latency_window {
            latencies.pop_front();
        }
        latencies.push_back(latency);
    }

    /// A served request breaks the failure streak. Bringing an unhealthy
    /// backend back is left to the active probe.
    pub fn record_passive_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Feed one health observation through the consecutive thresholds.
    pub fn observe_health(
        &self,
        ok: bool,
        unhealthy_threshold: u32,
        healthy_threshold: u32,
    ) -> Option<HealthTransition> {
        if ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.is_healthy() && successes >= healthy_threshold {
                self.healthy.store(true, Ordering::Release);
                self.consecutive_successes.store(0, Ordering::Relaxed);
                return Some(HealthTransition::BecameHealthy);
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if self.is_healthy() && failures >= unhealthy_threshold {
                self.healthy.store(false, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                return Some(HealthTransition::BecameUnhealthy);
            }
        }
        None
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            id: self.id.clone(),
            address: self.address.clone(),
            weight: self.weight,
            healthy: self.is_healthy(),
            active_connections: self.active_connections(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            error_rate: self.error_rate(),
            avg_latency_ms: self.avg_latency().as_secs_f64() * 1000.0,
        }
    }
}

/// Holds one active connection on a backend.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time statistics for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub id: BackendId,
    pub address: String,
    pub weight: u32,
    pub healthy: bool,
    pub active_connections: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}
