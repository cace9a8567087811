//! Failure isolation for calls to external dependencies.
//!
//! A [`CircuitBreaker`] tracks consecutive failures of one dependency (a
//! backend, a shard) and short-circuits calls while that dependency is
//! considered down. [`BreakerRegistry`] hands out one breaker per dependency
//! id so the orchestrator, load balancer and shard manager share state.
//!
//! # Example
//!
//! ```rust
//! use pipeguard::config::CircuitBreakerConfig;
//! use pipeguard::resilience::BreakerRegistry;
//!
//! # async fn example() -> pipeguard::Result<()> {
//! let registry = BreakerRegistry::new(CircuitBreakerConfig::default());
//! let breaker = registry.get_or_create("scoring-service");
//! let value = breaker.call(|| async { Ok(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

mod breaker;
mod registry;

pub use breaker::{BreakerStats, CircuitBreaker, CircuitState};
pub use registry::BreakerRegistry;
