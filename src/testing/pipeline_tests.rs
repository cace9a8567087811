//! End-to-end behavior of the orchestrator under injected faults.

use super::utils::wait_for;
use super::{BrokenBackendStage, ChaosAction, GateStage, TestPipeline, UppercaseStage};
use crate::config::{
    AutoScalerConfig, CircuitBreakerConfig, OrchestratorConfig, ProcessorConfig, QueueConfig,
};
use crate::error::Error;
use crate::processor::RetryPolicy;
use crate::queue::OverflowPolicy;
use crate::resilience::CircuitState;
use crate::scaling::{ScalingDirection, ScalingMetric, ScalingPolicy};
use crate::types::ResourceClass;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_processor_config(
            ProcessorConfig::default()
                .with_workers(2, 2)
                .with_retry_policy(RetryPolicy {
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(50),
                }),
        )
        .with_result_timeout(Duration::from_secs(10))
}

#[test(tokio::test)]
async fn test_transient_failures_are_retried() {
    let pipeline = TestPipeline::new(fast_config(), Arc::new(UppercaseStage)).unwrap();
    pipeline.chaos.fail_next(2);

    let out = pipeline
        .orchestrator
        .process("hello".into(), "alice")
        .await
        .unwrap();
    assert_eq!(out, "HELLO");

    let stats = pipeline.orchestrator.get_comprehensive_stats();
    assert_eq!(stats.processor.cpu.retries, 2);
    assert_eq!(stats.processor.cpu.completed, 1);
    assert_eq!(pipeline.stats().failures_injected, 2);
    // Two failures stay below the local breaker's threshold.
    assert!(stats.open_circuits.is_empty());
    pipeline.shutdown().await;
}

#[test(tokio::test)]
async fn test_fatal_failure_skips_retries() {
    let pipeline = TestPipeline::new(fast_config(), Arc::new(UppercaseStage)).unwrap();
    pipeline.chaos.script([ChaosAction::FailFatal]);

    let err = pipeline
        .orchestrator
        .process("hello".into(), "alice")
        .await
        .unwrap_err();
    match err {
        Error::TaskFailedPermanently { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(pipeline.orchestrator.get_comprehensive_stats().queue.dead_lettered, 1);
    pipeline.shutdown().await;
}

#[test(tokio::test)]
async fn test_seeded_chaos_never_loses_requests() {
    let pipeline = TestPipeline::with_chaos(
        fast_config()
            .with_processor_config(
                ProcessorConfig::default()
                    .with_workers(2, 2)
                    .with_max_attempts(5)
                    .with_retry_policy(RetryPolicy {
                        base_delay: Duration::from_millis(1),
                        max_delay: Duration::from_millis(5),
                    }),
            )
            .with_breaker_config(CircuitBreakerConfig::default().with_failure_threshold(1000))
            .with_cache_results(false),
        Arc::new(UppercaseStage),
        super::ChaosConfig {
            failure_probability: 0.2,
            delay_min: Duration::from_millis(1),
            delay_max: Duration::from_millis(5),
            delay_probability: 0.1,
            ..Default::default()
        }
        .with_seed(11),
    )
    .unwrap();
    pipeline.enable_chaos();

    let items: Vec<String> = (0..40).map(|i| format!("item-{}", i)).collect();
    let results = pipeline.orchestrator.process_batch(items, "alice").await;

    let stats = pipeline.orchestrator.get_comprehensive_stats();
    let succeeded = results.iter().filter(|r| r.is_ok()).count() as u64;
    assert_eq!(succeeded, stats.requests.succeeded);
    assert_eq!(stats.requests.succeeded + stats.requests.failed, 40);
    assert_eq!(stats.queue.acked + stats.queue.dead_lettered, 40);
    assert_eq!(stats.requests.in_flight, 0);
    for (i, result) in results.iter().enumerate() {
        if let Ok(out) = result {
            assert_eq!(out, &format!("ITEM-{}", i));
        }
    }
    pipeline.shutdown().await;
}

#[test(tokio::test)]
async fn test_failing_backend_trips_its_breaker() {
    let pipeline = TestPipeline::new(
        fast_config()
            .with_breaker_config(CircuitBreakerConfig::default().with_failure_threshold(2))
            .with_cache_results(false),
        Arc::new(BrokenBackendStage::new("b1")),
    )
    .unwrap();
    let o = &pipeline.orchestrator;
    o.add_backend("b1", "10.0.0.1:80", 1).unwrap();
    o.add_backend("b2", "10.0.0.2:80", 1).unwrap();

    for i in 0..4 {
        let out = o.process(format!("req-{}", i), "alice").await.unwrap();
        assert_eq!(out, format!("req-{}@b2", i));
    }

    assert_eq!(o.breakers().state("backend:b1"), CircuitState::Open);
    assert_eq!(o.breakers().state("backend:b2"), CircuitState::Closed);
    let stats = o.get_comprehensive_stats();
    assert!(stats.balancer.failovers >= 3);
    assert_eq!(stats.open_circuits, vec!["backend:b1".to_string()]);
    // Failover happens inside one attempt, so the processor never retried.
    assert_eq!(stats.processor.io.retries, 0);
    pipeline.shutdown().await;
}

#[test(tokio::test)]
async fn test_probe_removes_backend_from_rotation() {
    let pipeline = TestPipeline::new(
        fast_config().with_cache_results(false),
        Arc::new(BrokenBackendStage::new("none")),
    )
    .unwrap();
    let o = &pipeline.orchestrator;
    o.add_backend("b1", "10.0.0.1:80", 1).unwrap();
    o.add_backend("b2", "10.0.0.2:80", 1).unwrap();

    pipeline.probe.set_down("b1", true);
    for _ in 0..3 {
        o.balancer().check_health_once().await;
    }
    assert!(!o.balancer().get_backend("b1").unwrap().is_healthy());

    for i in 0..4 {
        let out = o.process(format!("req-{}", i), "alice").await.unwrap();
        assert!(out.ends_with("@b2"));
    }
    pipeline.shutdown().await;
}

#[test(tokio::test)]
async fn test_full_queue_applies_backpressure() {
    let gate = Arc::new(GateStage::new());
    let pipeline = TestPipeline::new(
        fast_config()
            .with_processor_config(ProcessorConfig::default().with_workers(1, 1))
            .with_queue_config(
                QueueConfig::default()
                    .with_capacity(2)
                    .with_overflow(OverflowPolicy::Reject),
            ),
        gate.clone(),
    )
    .unwrap();
    let o = Arc::new(pipeline);

    let spawn = |item: &str| {
        let o = Arc::clone(&o);
        let item = item.to_string();
        tokio::spawn(async move { o.orchestrator.process(item, "alice").await })
    };

    let first = spawn("one");
    assert!(wait_for(|| gate.entered() == 1, Duration::from_secs(5)).await);
    let queued = vec![spawn("two"), spawn("three")];
    assert!(
        wait_for(
            || o.orchestrator.get_comprehensive_stats().queue.pending == 2,
            Duration::from_secs(5)
        )
        .await
    );

    let err = o.orchestrator.process("four".into(), "alice").await.unwrap_err();
    assert!(matches!(err, Error::QueueFull { capacity: 2, .. }));

    gate.open();
    assert_eq!(first.await.unwrap().unwrap(), "one");
    for handle in queued {
        assert!(handle.await.unwrap().is_ok());
    }
    let stats = o.orchestrator.get_comprehensive_stats();
    assert_eq!(stats.requests.succeeded, 3);
    assert_eq!(stats.requests.failed, 1);
    o.shutdown().await;
}

#[test(tokio::test)]
async fn test_queue_depth_scales_the_worker_pool() {
    let gate = Arc::new(GateStage::new());
    let policy = ScalingPolicy::new(ScalingMetric::QueueDepth, 2.0, 0.5)
        .with_evaluation_periods(1)
        .with_cooldown(Duration::ZERO)
        .with_bounds(1, 4);
    let pipeline = TestPipeline::new(
        fast_config()
            .with_processor_config(ProcessorConfig::default().with_workers(1, 1))
            .with_autoscaler_config(
                AutoScalerConfig::default()
                    .with_policy(policy)
                    .with_evaluation_interval(Duration::from_secs(3600)),
            ),
        gate.clone(),
    )
    .unwrap();
    let o = Arc::new(pipeline);
    let io_pool_size = || o.orchestrator.processor().pool(ResourceClass::Io).size();

    let handles: Vec<_> = ["one", "two", "three"]
        .into_iter()
        .map(|item| {
            let o = Arc::clone(&o);
            tokio::spawn(async move { o.orchestrator.process(item.to_string(), "alice").await })
        })
        .collect();
    assert!(
        wait_for(
            || gate.entered() == 1
                && o.orchestrator.get_comprehensive_stats().queue.pending == 2,
            Duration::from_secs(5)
        )
        .await
    );

    let decision = o.orchestrator.autoscaler().evaluate().unwrap();
    assert_eq!(decision.direction, ScalingDirection::Up);
    assert_eq!((decision.from, decision.to), (1, 2));
    assert_eq!(io_pool_size(), 2);
    // The dispatcher picks up the extra slot.
    assert!(wait_for(|| gate.entered() == 2, Duration::from_secs(5)).await);

    gate.open();
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let decision = o.orchestrator.autoscaler().evaluate().unwrap();
    assert_eq!(decision.direction, ScalingDirection::Down);
    assert_eq!(io_pool_size(), 1);

    let stats = o.orchestrator.get_comprehensive_stats();
    assert_eq!(stats.autoscaler.scale_ups, 1);
    assert_eq!(stats.autoscaler.scale_downs, 1);
    o.shutdown().await;
}
