//! Partitioning module for distributing keys across members.
//!
//! The consistent hash ring here is shared by the shard manager (key ->
//! shard placement) and the load balancer (sticky sessions), ensuring:
//! - Even distribution of keys across members
//! - Minimal key redistribution when members join/leave
//! - A deterministic successor order for replicas and failover
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    HashRing                           │
//! │  ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐   │
//! │  │s1:0 │→│s2:0 │→│s3:0 │→│s1:1 │→│s2:1 │→│s3:1 │   │
//! │  └─────┘ └─────┘ └─────┘ └─────┘ └─────┘ └─────┘   │
//! │      256 virtual nodes per member                    │
//! └──────────────────────────────────────────────────────┘
//!
//!   Key "user:123" → hash → next vnode → s2 (owner)
//!                                      → s3 (successor)
//! ```
//!
//! # Example
//!
//! ```rust
//! use pipeguard::partitioning::HashRing;
//!
//! let mut ring = HashRing::new();
//! ring.add_node("shard-1");
//! ring.add_node("shard-2");
//! ring.add_node("shard-3");
//!
//! let owners = ring.get_owners(b"user:123", 2);
//! println!("Primary: {}, Replica: {:?}", owners[0], &owners[1..]);
//! ```

mod hashring;

pub use hashring::{hash_key, HashRing, DEFAULT_VNODES_PER_NODE};
