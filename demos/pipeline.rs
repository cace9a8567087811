//! End-to-end example: a two-stage pipeline behind every resilience layer.
//!
//! Run with:
//!   RUST_LOG=pipeguard=debug,info cargo run --example pipeline
//!
//! Demonstrates:
//! - Admission control per client
//! - Result caching on repeated requests
//! - Backend failover when one backend keeps failing
//! - Sharded result storage with replicas
//! - Auto-scaling the IO pool from queue depth

use async_trait::async_trait;
use pipeguard::testing::{ChaosConfig, ChaosController, ChaosStage};
use pipeguard::{
    AutoScalerConfig, Error, Orchestrator, OrchestratorConfig, PipelineStage, ProcessorConfig,
    RateLimitConfig, RateLimitStrategy, ResourceClass, ScalingMetric, ScalingPolicy,
    ShardingConfig, StageContext, StageError,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Rejects empty input and normalizes the rest.
struct Validate;

#[async_trait]
impl PipelineStage<String> for Validate {
    fn name(&self) -> &str {
        "validate"
    }

    async fn process(&self, item: String, _ctx: &StageContext) -> Result<String, StageError> {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            return Err(StageError::fatal(self.name(), "empty input"));
        }
        Ok(trimmed.to_lowercase())
    }
}

/// Simulates a call to a remote enrichment service.
struct Enrich;

#[async_trait]
impl PipelineStage<String> for Enrich {
    fn name(&self) -> &str {
        "enrich"
    }

    fn resource_class(&self) -> ResourceClass {
        ResourceClass::Io
    }

    async fn process(&self, item: String, ctx: &StageContext) -> Result<String, StageError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if ctx.backend.as_deref() == Some("enrich-2") {
            return Err(StageError::failed(self.name(), "enrich-2 connection reset"));
        }
        Ok(format!(
            "{} [via {} on {}]",
            item,
            ctx.backend.as_deref().unwrap_or("local"),
            ctx.shard_id.as_deref().unwrap_or("-")
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "pipeguard=info".to_string()))
        .init();

    let config = OrchestratorConfig::default()
        .with_rate_limit_config(RateLimitConfig::new(
            RateLimitStrategy::SlidingWindowLog,
            20,
            Duration::from_secs(1),
        ))
        .with_processor_config(ProcessorConfig::default().with_workers(2, 2))
        .with_sharding_config(ShardingConfig::default().with_replication_factor(2))
        .with_autoscaler_config(
            AutoScalerConfig::default()
                .with_evaluation_interval(Duration::from_millis(200))
                .with_policy(
                    ScalingPolicy::new(ScalingMetric::QueueDepth, 4.0, 1.0)
                        .with_evaluation_periods(1)
                        .with_cooldown(Duration::from_millis(500))
                        .with_bounds(2, 8),
                ),
        );

    // A little random latency on the enrichment stage.
    let chaos = Arc::new(ChaosController::new(
        ChaosConfig {
            delay_probability: 0.3,
            ..Default::default()
        }
        .with_seed(7),
    ));
    chaos.enable();

    let orchestrator = Orchestrator::<String>::builder(config)
        .stage(Arc::new(Validate))
        .stage(Arc::new(ChaosStage::new(Arc::new(Enrich), chaos.clone())))
        .build()?;
    orchestrator.add_backend("enrich-1", "10.0.0.1:8080", 1)?;
    orchestrator.add_backend("enrich-2", "10.0.0.2:8080", 1)?;
    orchestrator.add_in_memory_shard("shard-a")?;
    orchestrator.add_in_memory_shard("shard-b")?;
    orchestrator.start()?;

    println!("--- Single requests ---");
    let out = orchestrator.process("  Hello World ".to_string(), "alice").await?;
    println!("first:  {}", out);
    let out = orchestrator.process("  Hello World ".to_string(), "alice").await?;
    println!("cached: {}", out);

    match orchestrator.process("   ".to_string(), "alice").await {
        Err(e) => println!("empty input rejected: {}", e.root_cause()),
        Ok(out) => println!("unexpected success: {}", out),
    }

    println!("\n--- Burst from one client ---");
    let items: Vec<String> = (0..30).map(|i| format!("order-{}", i)).collect();
    let results = orchestrator.process_batch(items, "bob").await;
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let throttled = results
        .iter()
        .filter(|r| matches!(r, Err(Error::AdmissionRejected { .. })))
        .count();
    println!("succeeded: {}, throttled: {}", ok, throttled);

    println!("\n--- Reading stored results ---");
    let read = orchestrator.shards().read("order-1").await?;
    println!(
        "order-1 on {} (served by {}, stale: {}): {:?}",
        read.shard_id, read.served_by, read.stale, read.value
    );

    // Give the autoscaler a few ticks.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stats = orchestrator.get_comprehensive_stats();
    println!("\n--- Stats ---");
    println!("  Requests:      {}", stats.requests.total);
    println!("  Succeeded:     {}", stats.requests.succeeded);
    println!("  Rejected:      {}", stats.requests.rejected);
    println!("  Cache hits:    {}", stats.requests.cache_hits);
    println!("  Failovers:     {}", stats.balancer.failovers);
    println!("  Open circuits: {:?}", stats.open_circuits);
    println!("  IO workers:    {}", stats.processor.io.workers);
    println!("  Chaos delays:  {}", chaos.stats().delays_injected);

    println!("\n--- Full stats (JSON) ---");
    println!("{}", serde_json::to_string_pretty(&stats)?);

    println!("\n--- Metrics ---");
    println!("{}", orchestrator.metrics_exposition());

    println!("Shutting down...");
    orchestrator.shutdown().await;

    Ok(())
}
