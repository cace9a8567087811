//! Message envelopes and their queue ordering.

use crate::types::{MessageId, Priority};
use std::cmp::Ordering;
use tokio::time::Instant;

/// A message as handed to a consumer.
#[derive(Debug, Clone)]
pub struct Message<T> {
    /// Unique per delivered copy; each subscribing group gets its own copy.
    pub id: MessageId,
    pub topic: String,
    pub group: String,
    pub priority: Priority,
    pub payload: T,
    pub published_at: Instant,
    /// Number of times this copy has been handed to a consumer.
    pub delivery_count: u32,
    pub(crate) seq: u64,
}

/// Heap entry: higher priority first, then lower sequence (older) first.
#[derive(Debug)]
pub(crate) struct Queued<T>(pub Message<T>);

impl<T> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.seq == other.0.seq
    }
}

impl<T> Eq for Queued<T> {}

impl<T> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Queued<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// A delivered message waiting for its ack.
#[derive(Debug)]
pub(crate) struct InFlight<T> {
    pub message: Message<T>,
    pub deadline: Instant,
}

/// A message that exhausted its redeliveries or was rejected outright.
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    pub message: Message<T>,
    /// Dead-letter topic the message was moved to.
    pub topic: String,
    pub reason: String,
    pub dead_lettered_at: Instant,
}

/// Name of the dead-letter topic for `topic`.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{}.dlq", topic)
}
