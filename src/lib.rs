//! Resilience and scaling layer for multi-stage processing pipelines.
//!
//! This crate wraps a chain of user-supplied stages with the machinery a
//! pipeline needs to survive real traffic:
//! - **Admission control** with five rate limiting algorithms
//! - **Circuit breakers** per downstream dependency
//! - **Two-tier result cache** with pluggable eviction
//! - **Prioritized message queue** with acknowledgements and a dead-letter topic
//! - **Load balancing** across backends with active and passive health checks
//! - **Sharded state** with replica failover and scatter-gather
//! - **Worker pools** for CPU- and IO-bound work, with retries and deadlines
//! - **Auto-scaling** of worker pools from metric thresholds and trends
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use pipeguard::{Orchestrator, OrchestratorConfig, PipelineStage, StageContext, StageError};
//! use std::sync::Arc;
//!
//! struct Normalize;
//!
//! #[async_trait]
//! impl PipelineStage<String> for Normalize {
//!     fn name(&self) -> &str {
//!         "normalize"
//!     }
//!
//!     async fn process(&self, item: String, _ctx: &StageContext) -> Result<String, StageError> {
//!         Ok(item.trim().to_lowercase())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::<String>::builder(OrchestratorConfig::default())
//!         .stage(Arc::new(Normalize))
//!         .build()?;
//!     orchestrator.start()?;
//!
//!     let out = orchestrator.process("  Hello ".to_string(), "client-1").await?;
//!     assert_eq!(out, "hello");
//!
//!     println!("{}", orchestrator.metrics_exposition());
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Orchestrator                 │
//! │  • process(item, client) -> Result<item>    │
//! │  • process_batch(items, client)             │
//! │  • get_comprehensive_stats()                │
//! └─────────────────────────────────────────────┘
//!        │ admit        │ lookup        │ publish
//!        ▼              ▼               ▼
//! ┌────────────┐  ┌───────────┐  ┌──────────────┐
//! │RateLimiter │  │CacheManager│ │ MessageQueue │
//! └────────────┘  └───────────┘  └──────────────┘
//!                                       │ dispatch
//!                                       ▼
//!                          ┌────────────────────────┐
//!                          │  DistributedProcessor  │◄── AutoScaler
//!                          │   (cpu / io pools)     │
//!                          └────────────────────────┘
//!                                       │
//!               ┌───────────────────────┼──────────────────┐
//!               ▼                       ▼                  ▼
//!        ┌─────────────┐        ┌──────────────┐   ┌──────────────┐
//!        │ShardManager │        │ LoadBalancer │   │BreakerRegistry│
//!        └─────────────┘        └──────────────┘   └──────────────┘
//! ```
//!
//! Every component reports into one [`MetricsCollector`], which renders a
//! Prometheus-style text exposition.
//!
//! # Failure Model
//!
//! - **Retryable** errors (transient stage failures, timeouts, open circuits)
//!   are retried with exponential backoff up to the configured attempts
//! - **Fatal** stage errors fail the request at once and are dead-lettered
//! - **Admission** and **backpressure** errors are returned to the caller
//!   without entering the pipeline

pub mod balancer;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod partitioning;
mod pattern;
pub mod processor;
pub mod queue;
pub mod ratelimit;
pub mod resilience;
pub mod scaling;
pub mod sharding;
pub mod stage;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{
    AutoScalerConfig, CacheConfig, CircuitBreakerConfig, LoadBalancerConfig, MetricsConfig,
    OrchestratorConfig, ProcessorConfig, QueueConfig, RateLimitConfig, ShardingConfig,
    TierConfig,
};
pub use error::{Error, Result, StageError};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorStats, RequestStats};
pub use stage::{PipelineItem, PipelineStage, StageContext, StageRef};
pub use types::{BackendId, ClientId, MessageId, Priority, ResourceClass, ShardId};

// Re-export component types
pub use balancer::{Backend, HealthProbe, LoadBalancer, LoadBalancingStrategy};
pub use cache::{CacheLevel, CacheLookup, CacheManager, EvictionStrategy};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use processor::{DistributedProcessor, RetryPolicy, Task, TaskOutcome};
pub use queue::{ExchangeKind, Message, MessageBroker, MessageQueue, OverflowPolicy};
pub use ratelimit::{RateLimitStrategy, RateLimiter};
pub use resilience::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use scaling::{AutoScaler, ScaleTarget, ScalingMetric, ScalingPolicy, TrendMethod};
pub use sharding::{InMemoryShardStore, ShardManager, ShardStore, ShardingStrategy};
