//! The two-pool task processor.

use super::pool::{PoolCounters, PoolStats, WorkerPool};
use super::task::{AttemptFn, Task, TaskHandle, TaskOutcome};
use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::stage::{StageContext, StageRef};
use crate::types::{ResourceClass, TaskId};
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runs tasks on a CPU pool and an IO pool with retry and deadlines.
///
/// Keeping the pools apart means a backlog of slow external calls cannot
/// starve compute-bound work. CPU attempts execute on Tokio's blocking
/// threads; IO attempts are awaited on the runtime directly.
pub struct DistributedProcessor {
    config: ProcessorConfig,
    cpu: WorkerPool,
    io: WorkerPool,
    submitted: AtomicU64,
    metrics: Option<Arc<MetricsCollector>>,
}

impl DistributedProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            cpu: WorkerPool::new(ResourceClass::Cpu, config.cpu_workers, None),
            io: WorkerPool::new(ResourceClass::Io, config.io_workers, None),
            config,
            submitted: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.cpu = WorkerPool::new(ResourceClass::Cpu, self.config.cpu_workers, Some(metrics.clone()));
        self.io = WorkerPool::new(ResourceClass::Io, self.config.io_workers, Some(metrics.clone()));
        self.metrics = Some(metrics);
        self
    }

    /// Spawn the pool workers on the current Tokio runtime.
    pub fn start(&self) -> Result<()> {
        Handle::try_current()
            .map_err(|e| Error::Internal(format!("processor needs a Tokio runtime: {}", e)))?;
        self.cpu.start();
        self.io.start();
        info!(
            cpu_workers = self.cpu.size(),
            io_workers = self.io.size(),
            "Distributed processor started"
        );
        Ok(())
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn pool(&self, class: ResourceClass) -> &WorkerPool {
        match class {
            ResourceClass::Cpu => &self.cpu,
            ResourceClass::Io => &self.io,
        }
    }

    /// Queue `task` on its pool. The handle resolves once it succeeds or
    /// fails permanently.
    pub fn submit<T: Send + 'static>(&self, task: Task<T>) -> Result<TaskHandle<T>> {
        let pool = self.pool(task.class);
        if pool.is_shut_down() {
            return Err(Error::Cancelled);
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle::new(task.id, rx);
        let run = TaskRun {
            task_id: task.id,
            class: task.class,
            attempt: task.attempt,
            timeout: task.timeout.or(self.config.task_timeout),
            max_attempts: self.config.max_attempts.max(1),
            retry: self.config.retry,
            counters: pool.counters(),
            metrics: self.metrics.clone(),
        };
        pool.enqueue(
            task.priority,
            task.id,
            Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    let outcome = run.execute().await;
                    // The submitter may have stopped waiting.
                    let _ = tx.send(outcome);
                })
            }),
        );
        Ok(handle)
    }

    /// Run `f` over every item on the `class` pool; outcomes keep input order.
    pub async fn process_batch<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        class: ResourceClass,
        f: F,
    ) -> Vec<TaskOutcome<T>>
    where
        I: Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(I, StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<Result<TaskHandle<T>>> = items
            .into_iter()
            .map(|item| {
                let f = f.clone();
                self.submit(Task::new(class, move |ctx| f(item.clone(), ctx)))
            })
            .collect();

        join_all(handles.into_iter().map(|handle| async move {
            match handle {
                Ok(handle) => handle.outcome().await,
                Err(e) => TaskOutcome {
                    task_id: TaskId::nil(),
                    result: Err(e),
                    attempts: 0,
                    elapsed: Duration::ZERO,
                },
            }
        }))
        .await
    }

    /// Run items through `stages` one phase at a time.
    ///
    /// Each phase runs on its stage's pool. An item that fails a phase keeps
    /// its error and skips the remaining phases.
    pub async fn process_pipeline<T>(&self, items: Vec<T>, stages: &[StageRef<T>]) -> Vec<Result<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut results: Vec<Result<T>> = items.into_iter().map(Ok).collect();
        for stage in stages {
            let pending: Vec<(usize, T)> = results
                .iter()
                .enumerate()
                .filter_map(|(i, r)| r.as_ref().ok().map(|item| (i, item.clone())))
                .collect();
            if pending.is_empty() {
                break;
            }
            debug!(stage = stage.name(), items = pending.len(), "Pipeline phase");

            let (indices, batch): (Vec<usize>, Vec<T>) = pending.into_iter().unzip();
            let phase_stage = stage.clone();
            let outcomes = self
                .process_batch(batch, stage.resource_class(), move |item, ctx| {
                    let stage = phase_stage.clone();
                    async move { stage.process(item, &ctx).await.map_err(Error::from) }
                })
                .await;
            for (index, outcome) in indices.into_iter().zip(outcomes) {
                results[index] = outcome.result;
            }
        }
        results
    }

    /// Resize one pool without dropping in-flight tasks.
    pub fn set_pool_size(&self, class: ResourceClass, workers: usize) -> Result<()> {
        if workers == 0 {
            return Err(Error::Config("pool size must be > 0".into()));
        }
        self.pool(class).resize(workers);
        Ok(())
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            cpu: self.cpu.stats(),
            io: self.io.stats(),
        }
    }

    /// Stop both pools. Queued tasks resolve to `Error::Cancelled`; running
    /// tasks finish.
    pub fn shutdown(&self) {
        let dropped = self.cpu.shutdown() + self.io.shutdown();
        info!(dropped, "Distributed processor shut down");
    }
}

/// Everything a queued task needs to run its attempts.
struct TaskRun<T> {
    task_id: TaskId,
    class: ResourceClass,
    attempt: AttemptFn<T>,
    timeout: Option<Duration>,
    max_attempts: u32,
    retry: super::RetryPolicy,
    counters: Arc<PoolCounters>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<T: Send + 'static> TaskRun<T> {
    async fn execute(self) -> TaskOutcome<T> {
        let started = Instant::now();
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let ctx = StageContext {
                task_id: self.task_id,
                attempt,
                ..Default::default()
            };
            match self.run_attempt(ctx).await {
                Ok(value) => break Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.record_counter("task_retries_total", None);
                    debug!(
                        task_id = %self.task_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Task attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(task_id = %self.task_id, attempts = attempt, error = %e, "Task failed permanently");
                    break Err(Error::TaskFailedPermanently {
                        task_id: self.task_id,
                        attempts: attempt,
                        last_error: Box::new(e),
                    });
                }
            }
        };

        let elapsed = started.elapsed();
        let outcome = if result.is_ok() {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            "success"
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            "failure"
        };
        self.record_counter("tasks_total", Some(outcome));
        if let Some(metrics) = &self.metrics {
            let pool = self.class.to_string();
            metrics.observe_duration("task_duration_seconds", &[("pool", &pool)], elapsed);
        }

        TaskOutcome {
            task_id: self.task_id,
            result,
            attempts: attempt,
            elapsed,
        }
    }

    /// One attempt, bounded by the deadline.
    ///
    /// A CPU attempt that overruns is reported as timed out, but the
    /// blocking thread running it finishes on its own.
    async fn run_attempt(&self, ctx: StageContext) -> Result<T> {
        let attempt = ctx.attempt;
        let future = (self.attempt)(ctx);
        let class = self.class;
        let work = async move {
            match class {
                ResourceClass::Io => future.await,
                ResourceClass::Cpu => {
                    let handle = Handle::current();
                    match tokio::task::spawn_blocking(move || handle.block_on(future)).await {
                        Ok(result) => result,
                        Err(e) => Err(Error::Internal(format!("task panicked: {}", e))),
                    }
                }
            }
        };

        let started = Instant::now();
        match self.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(result) => result,
                Err(_) => Err(Error::TaskTimeout {
                    task_id: self.task_id,
                    attempt,
                    elapsed: started.elapsed(),
                }),
            },
            None => work.await,
        }
    }

    fn record_counter(&self, name: &str, outcome: Option<&str>) {
        if let Some(metrics) = &self.metrics {
            let pool = self.class.to_string();
            match outcome {
                Some(outcome) => {
                    metrics.increment_counter(name, &[("pool", &pool), ("outcome", outcome)], 1.0)
                }
                None => metrics.increment_counter(name, &[("pool", &pool)], 1.0),
            }
        }
    }
}

/// Processor statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    pub submitted: u64,
    pub cpu: PoolStats,
    pub io: PoolStats,
}
