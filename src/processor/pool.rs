//! Priority-ordered worker pool.

use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::scaling::ScaleTarget;
use crate::types::{Priority, ResourceClass, TaskId};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Type-erased queued job.
pub(crate) struct WorkItem {
    pub priority: Priority,
    pub seq: u64,
    pub task_id: TaskId,
    pub run: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct PoolCounters {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
}

struct PoolShared {
    class: ResourceClass,
    queue: Mutex<BinaryHeap<WorkItem>>,
    notify: Notify,
    target_workers: AtomicUsize,
    live_workers: AtomicUsize,
    active: AtomicUsize,
    seq: AtomicU64,
    started: AtomicBool,
    shutdown: AtomicBool,
    counters: Arc<PoolCounters>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl PoolShared {
    /// Retire the calling worker if the pool has shrunk below it.
    fn try_retire(&self) -> bool {
        let mut live = self.live_workers.load(Ordering::Acquire);
        loop {
            let over = live > self.target_workers.load(Ordering::Acquire)
                || self.shutdown.load(Ordering::Acquire);
            if !over {
                return false;
            }
            match self.live_workers.compare_exchange(
                live,
                live - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
    }

    fn report_depth(&self, depth: usize) {
        if let Some(metrics) = &self.metrics {
            let pool = self.class.to_string();
            metrics.set_gauge("worker_pool_queue_depth", &[("pool", &pool)], depth as f64);
        }
    }
}

/// A resizable set of workers draining one priority queue.
///
/// Higher priorities run first; equal priorities run in submission order.
/// Shrinking the pool only retires idle workers, so running jobs always
/// finish.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub(crate) fn new(
        class: ResourceClass,
        workers: usize,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                class,
                queue: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                target_workers: AtomicUsize::new(workers.max(1)),
                live_workers: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                seq: AtomicU64::new(0),
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                counters: Arc::new(PoolCounters::default()),
                metrics,
            }),
        }
    }

    pub fn class(&self) -> ResourceClass {
        self.shared.class
    }

    pub(crate) fn counters(&self) -> Arc<PoolCounters> {
        self.shared.counters.clone()
    }

    /// Spawn workers up to the target size. Needs a Tokio runtime.
    pub(crate) fn start(&self) {
        self.shared.started.store(true, Ordering::Release);
        self.spawn_missing();
    }

    fn spawn_missing(&self) {
        if !self.shared.started.load(Ordering::Acquire) || self.shared.shutdown.load(Ordering::Acquire)
        {
            return;
        }
        loop {
            let live = self.shared.live_workers.load(Ordering::Acquire);
            if live >= self.shared.target_workers.load(Ordering::Acquire) {
                break;
            }
            if self
                .shared
                .live_workers
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tokio::spawn(worker_loop(self.shared.clone(), live));
            }
        }
    }

    pub(crate) fn enqueue(
        &self,
        priority: Priority,
        task_id: TaskId,
        run: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
    ) {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let depth = {
            let mut queue = self.shared.queue.lock();
            queue.push(WorkItem {
                priority,
                seq,
                task_id,
                run,
            });
            queue.len()
        };
        self.shared.report_depth(depth);
        self.shared.notify.notify_one();
    }

    /// Change the worker count. Running jobs are never interrupted.
    pub fn resize(&self, workers: usize) {
        let workers = workers.max(1);
        let previous = self.shared.target_workers.swap(workers, Ordering::AcqRel);
        if previous != workers {
            info!(pool = %self.shared.class, from = previous, to = workers, "Resizing worker pool");
        }
        if let Some(metrics) = &self.shared.metrics {
            let pool = self.shared.class.to_string();
            metrics.set_gauge("worker_pool_size", &[("pool", &pool)], workers as f64);
        }
        self.spawn_missing();
        // Wake idle workers so surplus ones can retire.
        self.shared.notify.notify_waiters();
    }

    pub fn size(&self) -> usize {
        self.shared.target_workers.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stop accepting work and drop everything still queued.
    pub(crate) fn shutdown(&self) -> usize {
        self.shared.shutdown.store(true, Ordering::Release);
        let dropped = {
            let mut queue = self.shared.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        self.shared.report_depth(0);
        self.shared.notify.notify_waiters();
        dropped
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            class: shared.class,
            workers: shared.target_workers.load(Ordering::Acquire),
            live_workers: shared.live_workers.load(Ordering::Acquire),
            queued: self.queued(),
            active: shared.active.load(Ordering::Acquire),
            completed: shared.counters.completed.load(Ordering::Relaxed),
            failed: shared.counters.failed.load(Ordering::Relaxed),
            retries: shared.counters.retries.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("class", &self.shared.class)
            .field("workers", &self.size())
            .finish()
    }
}

impl ScaleTarget for WorkerPool {
    fn name(&self) -> String {
        format!("{}_pool", self.shared.class)
    }

    fn current_instances(&self) -> usize {
        self.size()
    }

    fn scale_to(&self, instances: usize) -> Result<()> {
        self.resize(instances);
        Ok(())
    }
}

async fn worker_loop(shared: Arc<PoolShared>, worker_id: usize) {
    debug!(pool = %shared.class, worker_id, "Worker started");
    loop {
        if shared.try_retire() {
            debug!(pool = %shared.class, worker_id, "Worker retired");
            return;
        }

        let notified = shared.notify.notified();
        let item = shared.queue.lock().pop();
        match item {
            Some(item) => {
                shared.active.fetch_add(1, Ordering::AcqRel);
                debug!(pool = %shared.class, worker_id, task_id = %item.task_id, "Running task");
                (item.run)().await;
                shared.active.fetch_sub(1, Ordering::AcqRel);
            }
            None => notified.await,
        }
    }
}

/// Statistics for one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub class: ResourceClass,
    pub workers: usize,
    pub live_workers: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
}
