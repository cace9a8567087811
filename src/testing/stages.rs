//! Small stages used to drive the pipeline in tests and demos.

use crate::error::StageError;
use crate::stage::{PipelineStage, StageContext};
use crate::types::ResourceClass;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// Upper-cases its input. Items starting with `"bad"` fail fatally.
#[derive(Debug, Default)]
pub struct UppercaseStage;

#[async_trait]
impl PipelineStage<String> for UppercaseStage {
    fn name(&self) -> &str {
        "uppercase"
    }

    async fn process(&self, item: String, _ctx: &StageContext) -> Result<String, StageError> {
        if item.starts_with("bad") {
            return Err(StageError::fatal(self.name(), format!("rejected {}", item)));
        }
        Ok(item.to_uppercase())
    }
}

/// IO stage that appends the backend and shard the attempt ran with,
/// as `item@backend/shard`.
#[derive(Debug, Default)]
pub struct PlacementStage;

#[async_trait]
impl PipelineStage<String> for PlacementStage {
    fn name(&self) -> &str {
        "placement"
    }

    fn resource_class(&self) -> ResourceClass {
        ResourceClass::Io
    }

    async fn process(&self, item: String, ctx: &StageContext) -> Result<String, StageError> {
        Ok(format!(
            "{}@{}/{}",
            item,
            ctx.backend.as_deref().unwrap_or("-"),
            ctx.shard_id.as_deref().unwrap_or("-")
        ))
    }
}

/// IO stage that blocks every call until the gate is opened.
#[derive(Debug)]
pub struct GateStage {
    gate: Semaphore,
    entered: AtomicUsize,
}

impl GateStage {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            entered: AtomicUsize::new(0),
        }
    }

    /// Let every waiting and future call through.
    pub fn open(&self) {
        // A closed semaphore fails all acquires immediately.
        self.gate.close();
    }

    /// Calls that reached the gate so far.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::Acquire)
    }
}

impl Default for GateStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage<String> for GateStage {
    fn name(&self) -> &str {
        "gate"
    }

    fn resource_class(&self) -> ResourceClass {
        ResourceClass::Io
    }

    async fn process(&self, item: String, _ctx: &StageContext) -> Result<String, StageError> {
        self.entered.fetch_add(1, Ordering::AcqRel);
        let _ = self.gate.acquire().await;
        Ok(item)
    }
}

/// Fails with a retryable error whenever it runs on the given backend.
#[derive(Debug)]
pub struct BrokenBackendStage {
    backend: String,
}

impl BrokenBackendStage {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
        }
    }
}

#[async_trait]
impl PipelineStage<String> for BrokenBackendStage {
    fn name(&self) -> &str {
        "broken-backend"
    }

    fn resource_class(&self) -> ResourceClass {
        ResourceClass::Io
    }

    async fn process(&self, item: String, ctx: &StageContext) -> Result<String, StageError> {
        match ctx.backend.as_deref() {
            Some(backend) if backend == self.backend => Err(StageError::failed(
                self.name(),
                format!("{} refused connection", backend),
            )),
            backend => Ok(format!("{}@{}", item, backend.unwrap_or("-"))),
        }
    }
}
