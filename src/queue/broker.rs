//! In-process topic broker with priorities, acks and dead letters.

use super::message::{dead_letter_topic, DeadLetter, InFlight, Message, Queued};
use super::OverflowPolicy;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::pattern::GlobPattern;
use crate::types::{MessageId, Priority};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Group that receives messages for topics nobody subscribed to.
pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug)]
struct TopicState<T> {
    subscribers: BTreeSet<String>,
    backlogs: BTreeMap<String, BinaryHeap<Queued<T>>>,
}

impl<T> Default for TopicState<T> {
    fn default() -> Self {
        Self {
            subscribers: BTreeSet::new(),
            backlogs: BTreeMap::new(),
        }
    }
}

/// A group subscribed to every topic matching a glob.
#[derive(Debug)]
struct PatternSubscription {
    group: String,
    pattern: GlobPattern,
}

/// One entry of a consume call's topic list.
#[derive(Debug)]
enum TopicSelector {
    Exact(String),
    Pattern(GlobPattern),
}

impl TopicSelector {
    fn parse(topic: &str) -> Self {
        if GlobPattern::is_glob(topic) {
            if let Ok(pattern) = GlobPattern::new(topic) {
                return TopicSelector::Pattern(pattern);
            }
        }
        TopicSelector::Exact(topic.to_string())
    }

    fn parse_all(topics: &[&str]) -> Vec<Self> {
        topics.iter().map(|t| Self::parse(t)).collect()
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicSelector::Exact(name) => name == topic,
            TopicSelector::Pattern(pattern) => pattern.matches(topic),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    published: u64,
    consumed: u64,
    acked: u64,
    nacked: u64,
    redelivered: u64,
    dead_lettered: u64,
}

#[derive(Debug)]
struct QueueInner<T> {
    topics: HashMap<String, TopicState<T>>,
    pattern_subscriptions: Vec<PatternSubscription>,
    in_flight: HashMap<MessageId, InFlight<T>>,
    dead_letters: VecDeque<DeadLetter<T>>,
    pending: usize,
    seq: u64,
    counters: Counters,
}

impl<T> QueueInner<T> {
    fn enqueue(&mut self, message: Message<T>) {
        let topic = self.topics.entry(message.topic.clone()).or_default();
        topic
            .backlogs
            .entry(message.group.clone())
            .or_default()
            .push(Queued(message));
        self.pending += 1;
    }

    /// Groups that receive a copy of a message published to `topic`.
    fn groups_for(&self, topic: &str) -> BTreeSet<String> {
        let mut groups: BTreeSet<String> = self
            .topics
            .get(topic)
            .map(|t| t.subscribers.clone())
            .unwrap_or_default();
        groups.extend(
            self.pattern_subscriptions
                .iter()
                .filter(|s| s.pattern.matches(topic))
                .map(|s| s.group.clone()),
        );
        if groups.is_empty() {
            groups.insert(DEFAULT_GROUP.to_string());
        }
        groups
    }

    /// Pop the best message for `group` across the selected topics.
    fn pop_for(&mut self, group: &str, selectors: &[TopicSelector]) -> Option<Message<T>> {
        let mut best: Option<(&str, &Queued<T>)> = None;
        for (name, state) in &self.topics {
            if !selectors.iter().any(|s| s.matches(name)) {
                continue;
            }
            if let Some(head) = state.backlogs.get(group).and_then(|heap| heap.peek()) {
                if best.map_or(true, |(_, b)| head > b) {
                    best = Some((name.as_str(), head));
                }
            }
        }

        let topic = best?.0.to_string();
        let message = self
            .topics
            .get_mut(&topic)?
            .backlogs
            .get_mut(group)?
            .pop()?
            .0;
        self.pending -= 1;
        Some(message)
    }

    fn dead_letter(&mut self, message: Message<T>, reason: String) {
        warn!(
            message_id = %message.id,
            topic = %message.topic,
            deliveries = message.delivery_count,
            reason = %reason,
            "Message dead-lettered"
        );
        self.counters.dead_lettered += 1;
        self.dead_letters.push_back(DeadLetter {
            topic: dead_letter_topic(&message.topic),
            message,
            reason,
            dead_lettered_at: Instant::now(),
        });
    }

    /// Requeue or dead-letter a message that was not acked.
    fn settle_failed(
        &mut self,
        message: Message<T>,
        requeue: bool,
        max_redeliveries: u32,
        reason: &str,
    ) -> bool {
        if requeue && message.delivery_count <= max_redeliveries {
            self.counters.redelivered += 1;
            self.enqueue(message);
            true
        } else {
            let reason = if requeue {
                format!("{} after {} deliveries", reason, message.delivery_count)
            } else {
                reason.to_string()
            };
            self.dead_letter(message, reason);
            false
        }
    }
}

/// Bounded, topic-keyed priority queue.
///
/// Each subscribing consumer group receives its own copy of every message
/// published to a topic; within a group each copy is delivered to exactly
/// one consumer. Delivered messages must be acked before their deadline or
/// they are redelivered, up to `max_redeliveries`, and then dead-lettered.
pub struct MessageQueue<T> {
    config: QueueConfig,
    inner: Mutex<QueueInner<T>>,
    /// Signalled when pending messages are added.
    message_available: Notify,
    /// Signalled when pending capacity is freed.
    space_available: Notify,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<T: Clone + Send + 'static> MessageQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner {
                topics: HashMap::new(),
                pattern_subscriptions: Vec::new(),
                in_flight: HashMap::new(),
                dead_letters: VecDeque::new(),
                pending: 0,
                seq: 0,
                counters: Counters::default(),
            }),
            message_available: Notify::new(),
            space_available: Notify::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn record(&self, event: &str, count: usize, inner: &QueueInner<T>) {
        if let Some(metrics) = &self.metrics {
            if count > 0 {
                metrics.increment_counter(
                    "queue_messages_total",
                    &[("event", event)],
                    count as f64,
                );
            }
            metrics.set_gauge("queue_depth", &[], inner.pending as f64);
            metrics.set_gauge("queue_in_flight", &[], inner.in_flight.len() as f64);
        }
    }

    /// Subscribe `group` to `topic`. Later publishes deliver a copy to it.
    ///
    /// A topic containing `*` or `?` subscribes to every topic the glob
    /// matches, including topics first published after the subscription.
    pub fn subscribe(&self, group: &str, topic: &str) {
        let mut inner = self.inner.lock();
        if let TopicSelector::Pattern(pattern) = TopicSelector::parse(topic) {
            let exists = inner
                .pattern_subscriptions
                .iter()
                .any(|s| s.group == group && s.pattern.as_str() == topic);
            if !exists {
                inner.pattern_subscriptions.push(PatternSubscription {
                    group: group.to_string(),
                    pattern,
                });
                debug!(group, pattern = topic, "Group subscribed to pattern");
            }
            return;
        }
        let state = inner.topics.entry(topic.to_string()).or_default();
        if state.subscribers.insert(group.to_string()) {
            debug!(group, topic, "Group subscribed");
        }
    }

    /// Undo a [`subscribe`](Self::subscribe) with the same topic or pattern.
    pub fn unsubscribe(&self, group: &str, topic: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.pattern_subscriptions.len();
        inner
            .pattern_subscriptions
            .retain(|s| !(s.group == group && s.pattern.as_str() == topic));
        if inner.pattern_subscriptions.len() < before {
            return true;
        }
        inner
            .topics
            .get_mut(topic)
            .is_some_and(|t| t.subscribers.remove(group))
    }

    /// Publish one message. Returns the id of each group's copy.
    ///
    /// At capacity this waits for space or fails with [`Error::QueueFull`],
    /// depending on the overflow policy.
    pub async fn publish(
        &self,
        topic: &str,
        payload: T,
        priority: Priority,
    ) -> Result<Vec<MessageId>> {
        loop {
            // Registered before the capacity check so a concurrent release
            // between the check and the await is not lost.
            let space = self.space_available.notified();
            match self.try_publish(topic, &payload, priority) {
                Ok(ids) => return Ok(ids),
                Err(Error::QueueFull { .. }) if self.config.overflow == OverflowPolicy::Block => {
                    space.await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_publish(&self, topic: &str, payload: &T, priority: Priority) -> Result<Vec<MessageId>> {
        let mut inner = self.inner.lock();
        let groups = inner.groups_for(topic);
        if inner.pending + groups.len() > self.config.capacity {
            return Err(Error::QueueFull {
                capacity: self.config.capacity,
                pending: inner.pending,
            });
        }

        let now = Instant::now();
        inner.seq += 1;
        let seq = inner.seq;
        let mut ids = Vec::with_capacity(groups.len());
        for group in groups {
            let id = Uuid::new_v4();
            ids.push(id);
            inner.enqueue(Message {
                id,
                topic: topic.to_string(),
                group,
                priority,
                payload: payload.clone(),
                published_at: now,
                delivery_count: 0,
                seq,
            });
        }
        inner.counters.published += 1;
        self.record("published", 1, &inner);
        drop(inner);

        self.message_available.notify_waiters();
        Ok(ids)
    }

    /// Publish several payloads to one topic; stops at the first failure.
    pub async fn publish_batch<I>(
        &self,
        topic: &str,
        payloads: I,
        priority: Priority,
    ) -> Result<Vec<MessageId>>
    where
        I: IntoIterator<Item = T>,
    {
        let mut ids = Vec::new();
        for payload in payloads {
            ids.extend(self.publish(topic, payload, priority).await?);
        }
        Ok(ids)
    }

    /// Take the highest-priority, oldest message for `group` across `topics`.
    /// Entries containing `*` or `?` select every topic they match.
    ///
    /// Waits up to `timeout` for one to arrive. The message stays in flight
    /// until acked, nacked, or its ack deadline passes.
    pub async fn consume(
        &self,
        group: &str,
        topics: &[&str],
        timeout: Duration,
    ) -> Option<Message<T>> {
        let selectors = TopicSelector::parse_all(topics);
        self.consume_selected(group, &selectors, timeout).await
    }

    async fn consume_selected(
        &self,
        group: &str,
        selectors: &[TopicSelector],
        timeout: Duration,
    ) -> Option<Message<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let available = self.message_available.notified();
            if let Some(message) = self.take_selected(group, selectors) {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, available).await.is_err() {
                return None;
            }
        }
    }

    /// Non-blocking variant of [`consume`](Self::consume).
    pub fn try_consume(&self, group: &str, topics: &[&str]) -> Option<Message<T>> {
        self.take_selected(group, &TopicSelector::parse_all(topics))
    }

    fn take_selected(&self, group: &str, selectors: &[TopicSelector]) -> Option<Message<T>> {
        let mut inner = self.inner.lock();
        let mut message = inner.pop_for(group, selectors)?;
        message.delivery_count += 1;
        inner.in_flight.insert(
            message.id,
            InFlight {
                message: message.clone(),
                deadline: Instant::now() + self.config.ack_timeout,
            },
        );
        inner.counters.consumed += 1;
        self.record("consumed", 1, &inner);
        drop(inner);

        self.space_available.notify_waiters();
        Some(message)
    }

    /// Consume up to `max` messages, waiting only for the first.
    pub async fn consume_batch(
        &self,
        group: &str,
        topics: &[&str],
        max: usize,
        timeout: Duration,
    ) -> Vec<Message<T>> {
        let mut batch = Vec::new();
        if max == 0 {
            return batch;
        }
        let selectors = TopicSelector::parse_all(topics);
        if let Some(first) = self.consume_selected(group, &selectors, timeout).await {
            batch.push(first);
            while batch.len() < max {
                match self.take_selected(group, &selectors) {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }
        }
        batch
    }

    /// Finalize a delivered message.
    pub fn ack(&self, id: MessageId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.in_flight.remove(&id).is_none() {
            return Err(Error::NotFound(format!("in-flight message {}", id)));
        }
        inner.counters.acked += 1;
        self.record("acked", 1, &inner);
        Ok(())
    }

    /// Reject a delivered message.
    ///
    /// With `requeue` the message goes back to its backlog unless it has
    /// used up its redeliveries; without it, it is dead-lettered at once.
    pub fn nack(&self, id: MessageId, requeue: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let in_flight = inner
            .in_flight
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("in-flight message {}", id)))?;
        inner.counters.nacked += 1;
        let requeued = inner.settle_failed(
            in_flight.message,
            requeue,
            self.config.max_redeliveries,
            if requeue { "rejected" } else { "rejected without requeue" },
        );
        self.record(if requeued { "redelivered" } else { "dead_lettered" }, 1, &inner);
        drop(inner);

        if requeued {
            self.message_available.notify_waiters();
        }
        Ok(())
    }

    /// Redeliver or dead-letter every in-flight message past its deadline.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<MessageId> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut requeued = 0;
        for id in &expired {
            if let Some(in_flight) = inner.in_flight.remove(id) {
                debug!(message_id = %id, "Ack deadline missed");
                let max = self.config.max_redeliveries;
                if inner.settle_failed(in_flight.message, true, max, "ack timeout") {
                    requeued += 1;
                }
            }
        }
        self.record("redelivered", requeued, &inner);
        self.record("dead_lettered", expired.len() - requeued, &inner);
        drop(inner);

        if requeued > 0 {
            self.message_available.notify_waiters();
        }
        expired.len()
    }

    /// Dead letters, optionally only those from `topic`. Expired ones are dropped.
    pub fn dead_letters(&self, topic: Option<&str>) -> Vec<DeadLetter<T>> {
        let now = Instant::now();
        let ttl = self.config.dead_letter_ttl;
        let mut inner = self.inner.lock();
        inner
            .dead_letters
            .retain(|d| now.saturating_duration_since(d.dead_lettered_at) < ttl);
        inner
            .dead_letters
            .iter()
            .filter(|d| topic.map_or(true, |t| d.message.topic == t))
            .cloned()
            .collect()
    }

    /// Move a dead letter back to its backlog with a fresh delivery count.
    pub fn retry_dead_letter(&self, id: MessageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let pos = inner
            .dead_letters
            .iter()
            .position(|d| d.message.id == id)
            .ok_or_else(|| Error::NotFound(format!("dead letter {}", id)))?;
        if inner.pending >= self.config.capacity {
            return Err(Error::QueueFull {
                capacity: self.config.capacity,
                pending: inner.pending,
            });
        }
        let Some(dead) = inner.dead_letters.remove(pos) else {
            return Err(Error::NotFound(format!("dead letter {}", id)));
        };
        let mut message = dead.message;
        message.delivery_count = 0;
        info!(message_id = %id, topic = %message.topic, "Retrying dead letter");
        inner.enqueue(message);
        drop(inner);

        self.message_available.notify_waiters();
        Ok(())
    }

    /// Drop pending messages for `topic`, or for every topic with `None`.
    pub fn purge(&self, topic: Option<&str>) -> usize {
        let mut inner = self.inner.lock();
        let mut purged = 0;
        for (name, state) in inner.topics.iter_mut() {
            if topic.map_or(true, |t| t == name.as_str()) {
                for heap in state.backlogs.values_mut() {
                    purged += heap.len();
                    heap.clear();
                }
            }
        }
        inner.pending -= purged;
        self.record("purged", purged, &inner);
        drop(inner);

        if purged > 0 {
            info!(topic = ?topic, purged, "Purged queue");
            self.space_available.notify_waiters();
        }
        purged
    }

    /// Pending messages for `topic` across all groups.
    pub fn depth(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.backlogs.values().map(|h| h.len()).sum())
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let c = &inner.counters;
        QueueStats {
            published: c.published,
            consumed: c.consumed,
            acked: c.acked,
            nacked: c.nacked,
            redelivered: c.redelivered,
            dead_lettered: c.dead_lettered,
            pending: inner.pending,
            in_flight: inner.in_flight.len(),
            dead_letter_size: inner.dead_letters.len(),
            capacity: self.config.capacity,
            utilization: inner.pending as f64 / self.config.capacity.max(1) as f64,
            topics: inner
                .topics
                .iter()
                .map(|(name, t)| (name.clone(), t.backlogs.values().map(|h| h.len()).sum()))
                .collect(),
        }
    }

    /// Reap missed ack deadlines periodically until shutdown is signalled.
    pub async fn run_ack_monitor_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.monitor_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let expired = self.reap_expired();
                    if expired > 0 {
                        debug!(expired, "Reaped overdue deliveries");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Queue ack monitor shutting down");
                    break;
                }
            }
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub published: u64,
    pub consumed: u64,
    pub acked: u64,
    pub nacked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    pub pending: usize,
    pub in_flight: usize,
    pub dead_letter_size: usize,
    pub capacity: usize,
    pub utilization: f64,
    /// Pending messages per topic.
    pub topics: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(config: QueueConfig) -> MessageQueue<String> {
        MessageQueue::new(config)
    }

    async fn publish(q: &MessageQueue<String>, topic: &str, body: &str, priority: Priority) -> MessageId {
        q.publish(topic, body.to_string(), priority).await.unwrap()[0]
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let q = queue(QueueConfig::default());
        publish(&q, "jobs", "low", Priority::Low).await;
        publish(&q, "jobs", "high-1", Priority::High).await;
        publish(&q, "jobs", "high-2", Priority::High).await;
        publish(&q, "other", "urgent", Priority::Urgent).await;

        let mut order = Vec::new();
        while let Some(m) = q.try_consume(DEFAULT_GROUP, &["jobs", "other"]) {
            order.push(m.payload.clone());
            q.ack(m.id).unwrap();
        }
        assert_eq!(order, vec!["urgent", "high-1", "high-2", "low"]);
        assert_eq!(q.stats().acked, 4);
    }

    #[tokio::test]
    async fn test_reject_at_capacity() {
        let q = queue(QueueConfig::default().with_capacity(2));
        publish(&q, "t", "1", Priority::Medium).await;
        publish(&q, "t", "2", Priority::Medium).await;

        let err = q.publish("t", "3".into(), Priority::Medium).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull { capacity: 2, pending: 2 }));
    }

    #[tokio::test]
    async fn test_block_waits_for_space() {
        let q = Arc::new(queue(
            QueueConfig::default()
                .with_capacity(1)
                .with_overflow(OverflowPolicy::Block),
        ));
        publish(&q, "t", "first", Priority::Medium).await;

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.publish("t", "second".into(), Priority::Medium).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        let m = q.try_consume(DEFAULT_GROUP, &["t"]).unwrap();
        assert_eq!(m.payload, "first");
        producer.await.unwrap().unwrap();
        assert_eq!(q.depth("t"), 1);
    }

    #[tokio::test]
    async fn test_consume_waits_for_publish() {
        let q = Arc::new(queue(QueueConfig::default()));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.consume(DEFAULT_GROUP, &["t"], Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        publish(&q, "t", "hello", Priority::Medium).await;

        let m = consumer.await.unwrap().unwrap();
        assert_eq!(m.payload, "hello");
        assert_eq!(m.delivery_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_times_out() {
        let q = queue(QueueConfig::default());
        assert!(q.consume(DEFAULT_GROUP, &["t"], Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_consumer_groups_each_get_a_copy() {
        let q = queue(QueueConfig::default());
        q.subscribe("audit", "orders");
        q.subscribe("billing", "orders");
        let ids = q.publish("orders", "o-1".into(), Priority::Medium).await.unwrap();
        assert_eq!(ids.len(), 2);

        let a = q.try_consume("audit", &["orders"]).unwrap();
        let b = q.try_consume("billing", &["orders"]).unwrap();
        assert_eq!(a.payload, b.payload);
        assert_ne!(a.id, b.id);
        // Exactly one delivery per group.
        assert!(q.try_consume("audit", &["orders"]).is_none());
        assert!(q.try_consume(DEFAULT_GROUP, &["orders"]).is_none());
    }

    #[tokio::test]
    async fn test_wildcard_subscription_matches_new_topics() {
        let q = queue(QueueConfig::default());
        q.subscribe("orders", "orders.*");
        q.subscribe("everything", "*");

        let ids = q.publish("orders.created", "o-1".into(), Priority::Medium).await.unwrap();
        assert_eq!(ids.len(), 2);
        publish(&q, "users.created", "u-1", Priority::Medium).await;

        let m = q.try_consume("orders", &["orders.*"]).unwrap();
        assert_eq!(m.payload, "o-1");
        assert_eq!(m.topic, "orders.created");
        assert!(q.try_consume("orders", &["orders.*"]).is_none());

        let mut seen = Vec::new();
        while let Some(m) = q.try_consume("everything", &["*"]) {
            seen.push(m.payload);
        }
        assert_eq!(seen, vec!["o-1", "u-1"]);
        // Matched by a pattern subscriber, so nothing went to the default group.
        assert!(q.try_consume(DEFAULT_GROUP, &["*"]).is_none());
    }

    #[tokio::test]
    async fn test_exact_and_pattern_subscriptions_share_one_copy() {
        let q = queue(QueueConfig::default());
        q.subscribe("audit", "orders.created");
        q.subscribe("audit", "orders.*");
        let ids = q.publish("orders.created", "o-1".into(), Priority::Medium).await.unwrap();
        assert_eq!(ids.len(), 1);

        assert!(q.unsubscribe("audit", "orders.*"));
        assert!(!q.unsubscribe("audit", "orders.*"));
        let ids = q.publish("orders.shipped", "o-2".into(), Priority::Medium).await.unwrap();
        assert_eq!(ids.len(), 1);
        let m = q.try_consume(DEFAULT_GROUP, &["orders.shipped"]).unwrap();
        assert_eq!(m.payload, "o-2");
    }

    #[tokio::test]
    async fn test_glob_metacharacters_in_exact_topics() {
        let q = queue(QueueConfig::default());
        q.subscribe("g", "a.b");
        publish(&q, "axb", "wrong", Priority::Medium).await;
        publish(&q, "a.b", "right", Priority::Medium).await;
        assert_eq!(q.try_consume("g", &["a.b"]).unwrap().payload, "right");
        assert!(q.try_consume("g", &["a.b"]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_deadline_redelivers_then_dead_letters() {
        let q = queue(
            QueueConfig::default()
                .with_ack_timeout(Duration::from_secs(1))
                .with_max_redeliveries(2),
        );
        let id = publish(&q, "t", "flaky", Priority::Medium).await;

        for attempt in 1..=3 {
            let m = q.try_consume(DEFAULT_GROUP, &["t"]).unwrap();
            assert_eq!(m.id, id);
            assert_eq!(m.delivery_count, attempt);
            tokio::time::advance(Duration::from_secs(2)).await;
            assert_eq!(q.reap_expired(), 1);
        }

        assert!(q.try_consume(DEFAULT_GROUP, &["t"]).is_none());
        let dead = q.dead_letters(Some("t"));
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].topic, "t.dlq");
        let stats = q.stats();
        assert_eq!(stats.redelivered, 2);
        assert_eq!(stats.dead_lettered, 1);

        q.retry_dead_letter(id).unwrap();
        let m = q.try_consume(DEFAULT_GROUP, &["t"]).unwrap();
        assert_eq!(m.delivery_count, 1);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let q = queue(QueueConfig::default());
        publish(&q, "t", "bad", Priority::Medium).await;
        let m = q.try_consume(DEFAULT_GROUP, &["t"]).unwrap();

        q.nack(m.id, false).unwrap();
        assert_eq!(q.dead_letters(None).len(), 1);
        assert!(q.ack(m.id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letters_expire() {
        let q = queue(QueueConfig::default().with_dead_letter_ttl(Duration::from_secs(10)));
        publish(&q, "t", "x", Priority::Medium).await;
        let m = q.try_consume(DEFAULT_GROUP, &["t"]).unwrap();
        q.nack(m.id, false).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(q.dead_letters(None).is_empty());
    }

    #[tokio::test]
    async fn test_purge_and_batches() {
        let q = queue(QueueConfig::default());
        q.publish_batch("a", ["1", "2", "3"].map(String::from), Priority::Medium)
            .await
            .unwrap();
        publish(&q, "b", "4", Priority::Medium).await;

        let batch = q
            .consume_batch(DEFAULT_GROUP, &["a"], 2, Duration::from_millis(10))
            .await;
        assert_eq!(batch.len(), 2);

        assert_eq!(q.purge(Some("a")), 1);
        let stats = q.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.topics.get("b"), Some(&1));
    }
}
