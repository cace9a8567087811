//! Per-client admission control.
//!
//! [`RateLimiter`] keeps one lazily created bucket per client and supports
//! five algorithms:
//!
//! | Strategy | Limit | Behaviour |
//! |---|---|---|
//! | `TokenBucket` | burst | refills continuously, allows bursts up to capacity |
//! | `LeakyBucket` | burst | drains continuously, smooths output |
//! | `FixedWindow` | rate | counter reset on window boundaries |
//! | `SlidingWindowLog` | rate | exact, keeps one timestamp per unit |
//! | `SlidingWindowCounter` | rate | ten sub-buckets per window |
//!
//! # Example
//!
//! ```rust
//! use pipeguard::config::RateLimitConfig;
//! use pipeguard::ratelimit::{RateLimitStrategy, RateLimiter};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(RateLimitConfig::new(
//!     RateLimitStrategy::TokenBucket,
//!     100,
//!     Duration::from_secs(1),
//! ));
//! let result = limiter.check_limit("client-42", 1);
//! assert!(result.allowed);
//! # }
//! ```

mod algorithms;
mod limiter;

pub use limiter::{ClientStats, RateLimiter, RateLimiterStats};

use serde::Serialize;
use std::time::Duration;

/// Admission algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateLimitStrategy {
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindowLog,
    SlidingWindowCounter,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Units left after this check.
    pub remaining: u32,
    /// When a denied request may be retried.
    pub retry_after: Option<Duration>,
    /// When the client's budget is fully restored.
    pub reset_after: Duration,
}
