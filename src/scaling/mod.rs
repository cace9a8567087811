//! Metric-driven auto-scaling.
//!
//! An [`AutoScaler`] samples one gauge per [`ScalingPolicy`] on every tick,
//! keeps a short history and votes. Policies with a [`TrendMethod`] also
//! extrapolate that history, so capacity grows before load is sustained.

mod autoscaler;
mod policy;
mod trend;

pub use autoscaler::{AutoScaler, AutoScalerStats, ScalingDecision, ScalingDirection, SignalRefresh};
pub use policy::{ScalingMetric, ScalingPolicy};
pub use trend::{linear_slope, TrendMethod};

use crate::error::Result;

/// Something whose instance count the auto-scaler controls.
pub trait ScaleTarget: Send + Sync {
    fn name(&self) -> String;

    fn current_instances(&self) -> usize;

    /// Apply a new instance count.
    fn scale_to(&self, instances: usize) -> Result<()>;
}
