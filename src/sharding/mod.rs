//! Partitioning of pipeline state across shards.
//!
//! A partition key is mapped to a shard by the configured
//! [`ShardingStrategy`]. Each shard has a primary [`ShardStore`] and
//! `replication_factor - 1` replicas. Writes commit on the primary and are
//! copied to replicas asynchronously, so replica reads are eventually
//! consistent.
//!
//! ```text
//!   key ──► strategy ──► shard ──► primary ──(async)──► replicas
//!                                     │ down / breaker open
//!                                     ▼
//!                                  replica read (stale)
//! ```

mod manager;
mod store;

pub use manager::{
    ScatterGather, ShardManager, ShardManagerStats, ShardRange, ShardRead, ShardStats, StoreRef,
};
pub use store::{InMemoryShardStore, ShardStore};

use serde::Serialize;
use std::fmt;

/// How partition keys map to shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShardingStrategy {
    /// xxHash64 of the key modulo the shard count.
    Modulo,
    /// Lexicographic key ranges registered with `add_range`.
    Range,
    /// Explicit key assignments registered with `assign`.
    Directory,
    /// Consistent hash ring with virtual nodes.
    ConsistentHash,
}

impl fmt::Display for ShardingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingStrategy::Modulo => write!(f, "modulo"),
            ShardingStrategy::Range => write!(f, "range"),
            ShardingStrategy::Directory => write!(f, "directory"),
            ShardingStrategy::ConsistentHash => write!(f, "consistent_hash"),
        }
    }
}
