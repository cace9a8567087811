//! The pipeline stage abstraction wrapped by this crate.
//!
//! Stages are opaque: the orchestrator only knows that a stage takes an item
//! and returns a transformed item or a [`StageError`]. Everything else
//! (retry, placement, caching, breakers) happens around the call.

use crate::error::StageError;
use crate::types::{BackendId, ResourceClass, ShardId, TaskId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// An item flowing through the pipeline.
pub trait PipelineItem: Clone + Send + Sync + 'static {
    /// Key under which the processed result is cached.
    fn cache_key(&self) -> String;

    /// Key used to choose the owning shard. Defaults to the cache key.
    fn partition_key(&self) -> String {
        self.cache_key()
    }
}

impl PipelineItem for String {
    fn cache_key(&self) -> String {
        self.clone()
    }
}

/// Execution context handed to every stage invocation.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Backend the load balancer picked for this attempt.
    pub backend: Option<BackendId>,
    /// Shard owning the item's partition key.
    pub shard_id: Option<ShardId>,
}

/// A single step of a processing pipeline.
#[async_trait]
pub trait PipelineStage<T>: Send + Sync + 'static {
    /// Stage name, used in logs, metrics and errors.
    fn name(&self) -> &str;

    /// Pool the stage should run on.
    fn resource_class(&self) -> ResourceClass {
        ResourceClass::Cpu
    }

    async fn process(&self, item: T, ctx: &StageContext) -> Result<T, StageError>;
}

/// Shared handle to a stage.
pub type StageRef<T> = Arc<dyn PipelineStage<T>>;

/// Run `item` through `stages` in order, stopping at the first failure.
pub async fn run_stages<T: Send + 'static>(
    stages: &[StageRef<T>],
    mut item: T,
    ctx: &StageContext,
) -> Result<T, StageError> {
    for stage in stages {
        debug!(task_id = %ctx.task_id, stage = stage.name(), attempt = ctx.attempt, "Running stage");
        item = stage.process(item, ctx).await?;
    }
    Ok(item)
}

/// The pool a chain of stages should run on: IO if any stage is IO-bound.
pub fn chain_resource_class<T: 'static>(stages: &[StageRef<T>]) -> ResourceClass {
    if stages
        .iter()
        .any(|s| s.resource_class() == ResourceClass::Io)
    {
        ResourceClass::Io
    } else {
        ResourceClass::Cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Append(&'static str);

    #[async_trait]
    impl PipelineStage<String> for Append {
        fn name(&self) -> &str {
            self.0
        }

        async fn process(&self, item: String, _ctx: &StageContext) -> Result<String, StageError> {
            Ok(format!("{}>{}", item, self.0))
        }
    }

    struct Reject;

    #[async_trait]
    impl PipelineStage<String> for Reject {
        fn name(&self) -> &str {
            "reject"
        }

        fn resource_class(&self) -> ResourceClass {
            ResourceClass::Io
        }

        async fn process(&self, _item: String, _ctx: &StageContext) -> Result<String, StageError> {
            Err(StageError::fatal("reject", "no"))
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let stages: Vec<StageRef<String>> = vec![Arc::new(Append("a")), Arc::new(Append("b"))];
        let out = run_stages(&stages, "x".to_string(), &StageContext::default())
            .await
            .unwrap();
        assert_eq!(out, "x>a>b");
        assert_eq!(chain_resource_class(&stages), ResourceClass::Cpu);
    }

    #[tokio::test]
    async fn test_chain_stops_at_failure() {
        let stages: Vec<StageRef<String>> = vec![Arc::new(Reject), Arc::new(Append("never"))];
        let err = run_stages(&stages, "x".to_string(), &StageContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "reject");
        assert_eq!(chain_resource_class(&stages), ResourceClass::Io);
    }
}
