//! Active health probing.

use super::backend::Backend;
use async_trait::async_trait;

/// Checks whether a backend can serve traffic.
///
/// Implementations should return promptly; the balancer bounds each probe
/// with its configured timeout and counts a timeout as a failure.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, backend: &Backend) -> bool;
}

/// Probe that reports every backend healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProbe;

#[async_trait]
impl HealthProbe for NoopProbe {
    async fn probe(&self, _backend: &Backend) -> bool {
        true
    }
}
