//! Queue consumer that turns request envelopes into processor tasks.

use super::stats::RequestCounters;
use crate::balancer::{Backend, LoadBalancer};
use crate::cache::CacheManager;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result, StageError};
use crate::metrics::MetricsCollector;
use crate::processor::{DistributedProcessor, Task, TaskOutcome, WorkerPool};
use crate::queue::{Message, MessageQueue};
use crate::resilience::BreakerRegistry;
use crate::sharding::ShardManager;
use crate::stage::{run_stages, PipelineItem, StageContext, StageRef};
use crate::types::{ClientId, Priority, ResourceClass};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Consumer group the dispatcher reads the request topic with.
pub(crate) const DISPATCH_GROUP: &str = "dispatcher";

/// Breaker guarding stage execution when no backends are registered.
pub(crate) const LOCAL_DEPENDENCY: &str = "local";

const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// A request as it travels through the queue.
#[derive(Debug, Clone)]
pub(crate) struct Envelope<T> {
    pub request_id: Uuid,
    pub client_id: ClientId,
    pub item: T,
}

pub(crate) fn backend_dependency(backend_id: &str) -> String {
    format!("backend:{}", backend_id)
}

struct SignalWindow {
    at: Instant,
    total: u64,
    succeeded: u64,
    failed: u64,
}

pub(crate) struct Dispatcher<T> {
    pub config: OrchestratorConfig,
    pub stages: Arc<[StageRef<T>]>,
    pub class: ResourceClass,
    pub metrics: Arc<MetricsCollector>,
    pub breakers: Arc<BreakerRegistry>,
    pub cache: Arc<CacheManager<T>>,
    pub queue: Arc<MessageQueue<Envelope<T>>>,
    pub balancer: Arc<LoadBalancer>,
    pub shards: Arc<ShardManager<T>>,
    pub processor: Arc<DistributedProcessor>,
    pub counters: RequestCounters,
    waiters: DashMap<Uuid, oneshot::Sender<Result<T>>>,
    in_flight: AtomicUsize,
    slot_freed: Notify,
    signals: Mutex<SignalWindow>,
}

impl<T: PipelineItem> Dispatcher<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        stages: Arc<[StageRef<T>]>,
        class: ResourceClass,
        metrics: Arc<MetricsCollector>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<CacheManager<T>>,
        queue: Arc<MessageQueue<Envelope<T>>>,
        balancer: Arc<LoadBalancer>,
        shards: Arc<ShardManager<T>>,
        processor: Arc<DistributedProcessor>,
    ) -> Self {
        queue.subscribe(DISPATCH_GROUP, &config.request_topic);
        Self {
            config,
            stages,
            class,
            metrics,
            breakers,
            cache,
            queue,
            balancer,
            shards,
            processor,
            counters: RequestCounters::default(),
            waiters: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            slot_freed: Notify::new(),
            signals: Mutex::new(SignalWindow {
                at: Instant::now(),
                total: 0,
                succeeded: 0,
                failed: 0,
            }),
        }
    }

    /// The pool the stage chain runs on.
    pub fn pool(&self) -> &WorkerPool {
        self.processor.pool(self.class)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Publish `item` and wait for its result.
    pub async fn submit(&self, item: T, client_id: &str, priority: Priority) -> Result<T> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id, tx);

        let envelope = Envelope {
            request_id,
            client_id: client_id.to_string(),
            item,
        };
        if let Err(e) = self
            .queue
            .publish(&self.config.request_topic, envelope, priority)
            .await
        {
            self.waiters.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.result_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.waiters.remove(&request_id);
                warn!(request_id = %request_id, "Request timed out waiting for its result");
                Err(Error::TaskTimeout {
                    task_id: request_id,
                    attempt: 0,
                    elapsed: self.config.result_timeout,
                })
            }
        }
    }

    /// Drop every pending waiter; their callers see `Error::Cancelled`.
    pub fn cancel_waiters(&self) -> usize {
        let pending = self.waiters.len();
        self.waiters.clear();
        pending
    }

    /// Consume requests until shutdown is signalled.
    ///
    /// At most one request per worker of the dispatch pool is in flight, so
    /// a saturated pool leaves work in the queue, where capacity limits
    /// apply.
    pub async fn run_dispatch_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(topic = %self.config.request_topic, pool = %self.class, "Dispatcher started");
        loop {
            tokio::select! {
                message = self.next_message() => {
                    if let Some(message) = message {
                        self.dispatch(message);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Dispatcher shutting down");
                    break;
                }
            }
        }
    }

    async fn next_message(&self) -> Option<Message<Envelope<T>>> {
        loop {
            let freed = self.slot_freed.notified();
            if self.in_flight() < self.pool().size() {
                break;
            }
            // Also re-checks periodically in case the pool was resized.
            let _ = tokio::time::timeout(DISPATCH_POLL, freed).await;
        }
        self.queue
            .consume(DISPATCH_GROUP, &[self.config.request_topic.as_str()], DISPATCH_POLL)
            .await
    }

    fn dispatch(self: &Arc<Self>, message: Message<Envelope<T>>) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let core = Arc::clone(self);
        let envelope = message.payload.clone();
        let task = Task::new(self.class, move |ctx| {
            let core = Arc::clone(&core);
            let envelope = envelope.clone();
            async move { core.run_attempt(&envelope, ctx).await }
        })
        .with_id(message.payload.request_id)
        .with_priority(message.priority);

        match self.processor.submit(task) {
            Ok(handle) => {
                debug!(request_id = %message.payload.request_id, "Request dispatched");
                let core = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = handle.outcome().await;
                    core.complete(message, outcome).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "Processor refused request, requeueing");
                let _ = self.queue.nack(message.id, true);
                self.release_slot();
            }
        }
    }

    /// One attempt: resolve the shard, pick a backend, run the stages.
    async fn run_attempt(&self, envelope: &Envelope<T>, mut ctx: StageContext) -> Result<T> {
        if self.shards.shard_count() > 0 {
            ctx.shard_id = Some(self.shards.shard_for_key(&envelope.item.partition_key())?);
        }

        let outcome = if self.balancer.backends().is_empty() {
            self.guarded(LOCAL_DEPENDENCY, envelope.item.clone(), ctx).await
        } else {
            self.balancer
                .execute_request(Some(&envelope.client_id), |backend: Arc<Backend>| {
                    let mut ctx = ctx.clone();
                    ctx.backend = Some(backend.id().to_string());
                    let item = envelope.item.clone();
                    async move {
                        self.guarded(&backend_dependency(backend.id()), item, ctx)
                            .await
                    }
                })
                .await
        };
        outcome?.map_err(Error::from)
    }

    /// Run the stage chain behind the breaker for `dependency`.
    ///
    /// Fatal stage errors mean the dependency answered; they are passed
    /// through as an inner error and do not count against the breaker.
    async fn guarded(
        &self,
        dependency: &str,
        item: T,
        ctx: StageContext,
    ) -> Result<std::result::Result<T, StageError>> {
        let breaker = self.breakers.get_or_create(dependency);
        breaker
            .call(move || async move {
                match run_stages(&self.stages, item, &ctx).await {
                    Err(e) if e.is_retryable() => Err(Error::from(e)),
                    other => Ok(other),
                }
            })
            .await
    }

    async fn complete(&self, message: Message<Envelope<T>>, outcome: TaskOutcome<T>) {
        let request_id = message.payload.request_id;
        match &outcome.result {
            Ok(value) => {
                if self.config.cache_results {
                    self.cache.set(&message.payload.item.cache_key(), value.clone(), None);
                }
                if self.shards.shard_count() > 0 {
                    let key = message.payload.item.partition_key();
                    if let Err(e) = self.shards.write(&key, value.clone()).await {
                        warn!(
                            request_id = %request_id,
                            key = %key,
                            error = %e,
                            "Failed to persist result"
                        );
                    }
                }
                if let Err(e) = self.queue.ack(message.id) {
                    debug!(request_id = %request_id, error = %e, "Ack after redelivery");
                }
            }
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    attempts = outcome.attempts,
                    error = %e,
                    "Request failed, dead-lettering"
                );
                if let Err(e) = self.queue.nack(message.id, false) {
                    debug!(request_id = %request_id, error = %e, "Nack after redelivery");
                }
            }
        }
        self.release_slot();

        if let Some((_, waiter)) = self.waiters.remove(&request_id) {
            let _ = waiter.send(outcome.result);
        }
    }

    fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.slot_freed.notify_one();
    }

    /// Publish the unlabeled gauges scaling policies read.
    pub fn publish_signals(&self, metrics: &MetricsCollector) {
        let pool = self.pool().stats();
        metrics.set_gauge(
            "pipeline_cpu_utilization",
            &[],
            pool.active as f64 / pool.workers.max(1) as f64,
        );
        metrics.set_gauge(
            "pipeline_queue_depth",
            &[],
            (self.queue.depth(&self.config.request_topic) + pool.queued) as f64,
        );
        if let Some(latency) = metrics.histogram_stats("pipeline_request_duration_seconds", &[]) {
            metrics.set_gauge("pipeline_latency_seconds", &[], latency.p95);
        }

        let total = self.counters.total.load(Ordering::Relaxed);
        let succeeded = self.counters.succeeded.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let mut window = self.signals.lock();
        let elapsed = window.at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            metrics.set_gauge(
                "pipeline_request_rate",
                &[],
                total.saturating_sub(window.total) as f64 / elapsed,
            );
        }
        let done = (succeeded + failed).saturating_sub(window.succeeded + window.failed);
        let errors = failed.saturating_sub(window.failed);
        metrics.set_gauge(
            "pipeline_error_rate",
            &[],
            if done == 0 { 0.0 } else { errors as f64 / done as f64 },
        );
        *window = SignalWindow {
            at: Instant::now(),
            total,
            succeeded,
            failed,
        };
    }

    /// Ping shard primaries on the balancer's health interval.
    pub async fn run_shard_health_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.balancer.health_check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let healthy = self.shards.check_health_once().await;
                    debug!(healthy, total = self.shards.shard_count(), "Shard health checked");
                }
                _ = shutdown_rx.recv() => {
                    info!("Shard health checker shutting down");
                    break;
                }
            }
        }
    }
}
