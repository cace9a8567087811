//! Distributed task processing.
//!
//! Work is split between two worker pools by [`ResourceClass`]:
//!
//! ```text
//!   submit(Task) ──► ┌──────────── CPU pool ────────────┐
//!                    │ priority heap ─► N workers        │──► spawn_blocking
//!                    └──────────────────────────────────┘
//!                    ┌──────────── IO pool ─────────────┐
//!                    │ priority heap ─► M workers        │──► awaited inline
//!                    └──────────────────────────────────┘
//! ```
//!
//! Each attempt is bounded by a deadline. Retryable failures back off
//! exponentially; after the last attempt the task resolves to
//! [`Error::TaskFailedPermanently`](crate::Error::TaskFailedPermanently).
//!
//! [`ResourceClass`]: crate::types::ResourceClass

mod distributed;
mod pool;
mod task;

pub use distributed::{DistributedProcessor, ProcessorStats};
pub use pool::{PoolStats, WorkerPool};
pub use task::{AttemptFn, Task, TaskHandle, TaskOutcome};

use std::time::Duration;

/// Exponential backoff between task attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
