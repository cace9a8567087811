//! Units of work submitted to the processor.

use crate::error::{Error, Result};
use crate::stage::{chain_resource_class, run_stages, StageContext, StageRef};
use crate::types::{Priority, ResourceClass, TaskId};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// Produces one attempt of a task. Called again for every retry.
pub type AttemptFn<T> = Arc<dyn Fn(StageContext) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// A retryable unit of work.
pub struct Task<T> {
    pub id: TaskId,
    pub priority: Priority,
    pub class: ResourceClass,
    /// Overrides the processor's per-attempt deadline.
    pub timeout: Option<Duration>,
    pub created_at: Instant,
    pub(crate) attempt: AttemptFn<T>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new<F, Fut>(class: ResourceClass, f: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            priority: Priority::default(),
            class,
            timeout: None,
            created_at: Instant::now(),
            attempt: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    /// Run `item` through `stages`; the pool follows the chain's resource class.
    pub fn from_stages(item: T, stages: Vec<StageRef<T>>) -> Self
    where
        T: Clone + Sync,
    {
        let class = chain_resource_class(&stages);
        let stages: Arc<[StageRef<T>]> = stages.into();
        Self::new(class, move |ctx| {
            let stages = stages.clone();
            let item = item.clone();
            async move { run_stages(&stages, item, &ctx).await.map_err(Error::from) }
        })
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("class", &self.class)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Final state of a task.
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub task_id: TaskId,
    /// Either the value or [`Error::TaskFailedPermanently`].
    pub result: Result<T>,
    /// Attempts made, first included.
    pub attempts: u32,
    /// Time from the first attempt starting to the outcome.
    pub elapsed: Duration,
}

/// Resolves to the outcome of a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    task_id: TaskId,
    rx: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(task_id: TaskId, rx: oneshot::Receiver<TaskOutcome<T>>) -> Self {
        Self { task_id, rx }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Wait for the task. A task dropped by shutdown yields `Error::Cancelled`.
    pub async fn outcome(self) -> TaskOutcome<T> {
        let task_id = self.task_id;
        self.rx.await.unwrap_or_else(|_| TaskOutcome {
            task_id,
            result: Err(Error::Cancelled),
            attempts: 0,
            elapsed: Duration::ZERO,
        })
    }

    pub async fn result(self) -> Result<T> {
        self.outcome().await.result
    }
}
