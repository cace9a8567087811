//! Testing utilities for pipelines built on pipeguard.
//!
//! This module provides:
//! - Fault injection for stages and backend health
//! - Reusable test stages
//! - A harness wiring an orchestrator to a chaos controller
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        TestPipeline                             │
//! │                                                                 │
//! │   process() ──► Orchestrator ──► ChaosStage ──► inner stage     │
//! │                      │               ▲                          │
//! │                      │               │ decides pass/fail/delay  │
//! │                      ▼               │                          │
//! │                 LoadBalancer   ChaosController                  │
//! │                      ▲         (seeded rng + scripted actions)  │
//! │                      │                                          │
//! │                 ChaosProbe (backend up/down)                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use pipeguard::testing::{ChaosConfig, TestPipeline, UppercaseStage};
//! use std::sync::Arc;
//!
//! let pipeline = TestPipeline::new(Default::default(), Arc::new(UppercaseStage))?;
//! pipeline.chaos.fail_next(2);
//! let out = pipeline.orchestrator.process("hi".to_string(), "client").await?;
//! ```
//!
//! # Chaos Testing Presets
//!
//! - `ChaosConfig::none()` - No failures (default)
//! - `ChaosConfig::light()` - Low probability of failures
//! - `ChaosConfig::moderate()` - Medium failure rates
//! - `ChaosConfig::heavy()` - High failure rates for stress testing

mod chaos;
mod stages;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod utils;

pub use chaos::{ChaosAction, ChaosConfig, ChaosController, ChaosProbe, ChaosStage, ChaosStats};
pub use stages::{BrokenBackendStage, GateStage, PlacementStage, UppercaseStage};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::stage::StageRef;
use std::sync::Arc;

/// An orchestrator whose single stage runs behind a chaos controller.
pub struct TestPipeline {
    pub orchestrator: Orchestrator<String>,
    pub chaos: Arc<ChaosController>,
    pub probe: Arc<ChaosProbe>,
}

impl TestPipeline {
    /// Build and start a pipeline with chaos disabled.
    pub fn new(config: OrchestratorConfig, stage: StageRef<String>) -> Result<Self> {
        Self::with_chaos(config, stage, ChaosConfig::none())
    }

    /// Build and start a pipeline with a custom chaos config.
    pub fn with_chaos(
        config: OrchestratorConfig,
        stage: StageRef<String>,
        chaos: ChaosConfig,
    ) -> Result<Self> {
        let chaos = Arc::new(ChaosController::new(chaos));
        let probe = Arc::new(ChaosProbe::new());
        let orchestrator = Orchestrator::builder(config)
            .stage(Arc::new(ChaosStage::new(stage, Arc::clone(&chaos))))
            .health_probe(probe.clone())
            .build()?;
        orchestrator.start()?;
        Ok(Self {
            orchestrator,
            chaos,
            probe,
        })
    }

    /// Enable chaos testing.
    pub fn enable_chaos(&self) {
        self.chaos.enable();
    }

    /// Disable chaos testing.
    pub fn disable_chaos(&self) {
        self.chaos.disable();
    }

    /// Get chaos statistics.
    pub fn stats(&self) -> ChaosStats {
        self.chaos.stats()
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}
