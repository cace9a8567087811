//! Message queue between request admission and the worker pools.
//!
//! A bounded, in-process broker. Topics carry priority-ordered backlogs,
//! consumer groups share a topic's backlog, and unacked deliveries are
//! redelivered until they are moved to the topic's dead-letter list.
//! Subscriptions and consume calls accept `*`/`?` topic globs.
//!
//! A [`MessageBroker`] holds named queues and routes into them through
//! direct, fanout or topic exchanges.
//!
//! # Example
//!
//! ```rust
//! use pipeguard::config::QueueConfig;
//! use pipeguard::queue::{MessageQueue, DEFAULT_GROUP};
//! use pipeguard::types::Priority;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> pipeguard::Result<()> {
//! let queue = MessageQueue::new(QueueConfig::default());
//! queue.publish("jobs", "payload".to_string(), Priority::High).await?;
//!
//! if let Some(message) = queue.consume(DEFAULT_GROUP, &["jobs"], Duration::from_secs(1)).await {
//!     queue.ack(message.id)?;
//! }
//! # Ok(())
//! # }
//! ```

mod broker;
mod exchange;
mod message;

pub use broker::{MessageQueue, QueueStats, DEFAULT_GROUP};
pub use exchange::{BrokerStats, ExchangeKind, ExchangeStats, MessageBroker};
pub use message::{dead_letter_topic, DeadLetter, Message};

use serde::Serialize;

/// What `publish` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverflowPolicy {
    /// Wait until a consumer frees space.
    Block,
    /// Fail with `Error::QueueFull`.
    Reject,
}
