//! Load balancing across backend instances.
//!
//! The [`LoadBalancer`] keeps a set of [`Backend`]s, selects a healthy one
//! per request with the configured [`LoadBalancingStrategy`], and runs an
//! optional health-check loop driven by a [`HealthProbe`]. With sticky
//! sessions a client key is placed on the crate's consistent hash ring so it
//! keeps landing on the same backend while that backend is healthy.

mod backend;
mod health;
mod selector;

pub use backend::{Backend, BackendStats, ConnectionGuard, HealthTransition};
pub use health::{HealthProbe, NoopProbe};
pub use selector::{LoadBalancer, LoadBalancerStats};

use serde::Serialize;
use std::fmt;

/// Backend selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    /// Smooth weighted round-robin (deterministic).
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    Random,
    /// Blend of latency, error rate, load and weight; lowest score wins.
    Adaptive,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::WeightedRoundRobin => "weighted_round_robin",
            LoadBalancingStrategy::LeastConnections => "least_connections",
            LoadBalancingStrategy::LeastResponseTime => "least_response_time",
            LoadBalancingStrategy::Random => "random",
            LoadBalancingStrategy::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}
