//! Core types used throughout the pipeline layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a processor task.
pub type TaskId = Uuid;

/// Identifier of a queued message.
pub type MessageId = Uuid;

/// Shard identifier.
pub type ShardId = String;

/// Backend identifier.
pub type BackendId = String;

/// Client identifier used for admission and sticky sessions.
pub type ClientId = String;

/// Scheduling priority. Higher priorities are always served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Worker pool a piece of work runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    /// Compute-bound work, executed on blocking threads.
    #[default]
    Cpu,
    /// Work that mostly waits on external calls.
    Io,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::Cpu => write!(f, "cpu"),
            ResourceClass::Io => write!(f, "io"),
        }
    }
}
