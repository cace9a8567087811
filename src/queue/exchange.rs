//! Named queues behind direct, fanout and topic exchanges.

use super::broker::{MessageQueue, QueueStats};
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::pattern::GlobPattern;
use crate::types::{MessageId, Priority};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// How an exchange matches a routing key against its bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExchangeKind {
    /// Routing key equals the binding key.
    Direct,
    /// Every bound queue, whatever the key.
    Fanout,
    /// Binding key is a `*`/`?` glob over the routing key.
    Topic,
}

#[derive(Debug)]
struct Binding {
    queue: String,
    key: String,
    pattern: Option<GlobPattern>,
}

impl Binding {
    fn routes(&self, kind: ExchangeKind, routing_key: &str) -> bool {
        match kind {
            ExchangeKind::Direct => self.key == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => self.pattern.as_ref().is_some_and(|p| p.matches(routing_key)),
        }
    }
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

/// Registry of named [`MessageQueue`]s and the exchanges routing into them.
///
/// Publishing to an exchange puts one message on each bound queue whose
/// binding matches, using the routing key as the topic. A queue bound more
/// than once still receives a single copy.
pub struct MessageBroker<T> {
    queues: RwLock<HashMap<String, Arc<MessageQueue<T>>>>,
    exchanges: RwLock<HashMap<String, Exchange>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<T: Clone + Send + 'static> Default for MessageBroker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> MessageBroker<T> {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            exchanges: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create a queue, or return the existing one with that name.
    pub fn create_queue(&self, name: &str, config: QueueConfig) -> Arc<MessageQueue<T>> {
        let mut queues = self.queues.write();
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(queue = name, capacity = config.capacity, "Queue created");
                Arc::new(MessageQueue::new(config))
            })
            .clone()
    }

    pub fn queue(&self, name: &str) -> Option<Arc<MessageQueue<T>>> {
        self.queues.read().get(name).cloned()
    }

    /// Remove a queue and every binding to it.
    pub fn delete_queue(&self, name: &str) -> bool {
        if self.queues.write().remove(name).is_none() {
            return false;
        }
        for exchange in self.exchanges.write().values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
        info!(queue = name, "Queue deleted");
        true
    }

    /// Declare an exchange. Redeclaring with the same kind is a no-op.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut exchanges = self.exchanges.write();
        match exchanges.get(name) {
            Some(existing) if existing.kind == kind => Ok(()),
            Some(existing) => Err(Error::Config(format!(
                "exchange {} already declared as {:?}",
                name, existing.kind
            ))),
            None => {
                exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                info!(exchange = name, kind = ?kind, "Exchange declared");
                Ok(())
            }
        }
    }

    pub fn delete_exchange(&self, name: &str) -> bool {
        self.exchanges.write().remove(name).is_some()
    }

    /// Bind `queue` to `exchange` under `binding_key`.
    ///
    /// Fanout exchanges ignore the key. Topic exchanges treat it as a glob.
    pub fn bind(&self, exchange: &str, queue: &str, binding_key: &str) -> Result<()> {
        if !self.queues.read().contains_key(queue) {
            return Err(Error::NotFound(format!("queue {}", queue)));
        }
        let mut exchanges = self.exchanges.write();
        let target = exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::NotFound(format!("exchange {}", exchange)))?;
        if target
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.key == binding_key)
        {
            return Ok(());
        }
        let pattern = match target.kind {
            ExchangeKind::Topic => Some(GlobPattern::new(binding_key)?),
            _ => None,
        };
        target.bindings.push(Binding {
            queue: queue.to_string(),
            key: binding_key.to_string(),
            pattern,
        });
        debug!(exchange, queue, binding_key, "Queue bound");
        Ok(())
    }

    pub fn unbind(&self, exchange: &str, queue: &str, binding_key: &str) -> bool {
        let mut exchanges = self.exchanges.write();
        let Some(target) = exchanges.get_mut(exchange) else {
            return false;
        };
        let before = target.bindings.len();
        target
            .bindings
            .retain(|b| !(b.queue == queue && b.key == binding_key));
        target.bindings.len() < before
    }

    /// Route one message through `exchange`. Returns the id of every copy.
    ///
    /// A key no binding matches is dropped and yields no ids. Stops at the
    /// first queue that refuses the message; queues already published to
    /// keep their copy.
    pub async fn publish_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: T,
        priority: Priority,
    ) -> Result<Vec<MessageId>> {
        let targets = self.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!(exchange, routing_key, "No binding matched, message dropped");
            self.record(exchange, "unroutable");
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for queue in targets {
            ids.extend(queue.publish(routing_key, payload.clone(), priority).await?);
        }
        self.record(exchange, "routed");
        Ok(ids)
    }

    /// Queues a routing key reaches, resolved before any await.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<MessageQueue<T>>>> {
        let names: BTreeSet<String> = {
            let exchanges = self.exchanges.read();
            let target = exchanges
                .get(exchange)
                .ok_or_else(|| Error::NotFound(format!("exchange {}", exchange)))?;
            target
                .bindings
                .iter()
                .filter(|b| b.routes(target.kind, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };
        let queues = self.queues.read();
        Ok(names.iter().filter_map(|n| queues.get(n).cloned()).collect())
    }

    fn record(&self, exchange: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(
                "exchange_messages_total",
                &[("exchange", exchange), ("outcome", outcome)],
                1.0,
            );
        }
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            queues: self
                .queues
                .read()
                .iter()
                .map(|(name, q)| (name.clone(), q.stats()))
                .collect(),
            exchanges: self
                .exchanges
                .read()
                .iter()
                .map(|(name, e)| {
                    (
                        name.clone(),
                        ExchangeStats {
                            kind: e.kind,
                            bindings: e.bindings.len(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeStats {
    pub kind: ExchangeKind,
    pub bindings: usize,
}

/// Per-queue and per-exchange statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub queues: BTreeMap<String, QueueStats>,
    pub exchanges: BTreeMap<String, ExchangeStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DEFAULT_GROUP;

    fn broker(queues: &[&str]) -> MessageBroker<String> {
        let broker = MessageBroker::new();
        for name in queues {
            broker.create_queue(name, QueueConfig::default());
        }
        broker
    }

    fn drain(broker: &MessageBroker<String>, queue: &str) -> Vec<(String, String)> {
        let q = broker.queue(queue).unwrap();
        let mut out = Vec::new();
        while let Some(m) = q.try_consume(DEFAULT_GROUP, &["*"]) {
            out.push((m.topic.clone(), m.payload.clone()));
        }
        out
    }

    #[tokio::test]
    async fn test_direct_exchange_routes_on_exact_key() {
        let broker = broker(&["created", "deleted"]);
        broker.declare_exchange("events", ExchangeKind::Direct).unwrap();
        broker.bind("events", "created", "user.created").unwrap();
        broker.bind("events", "deleted", "user.deleted").unwrap();

        let ids = broker
            .publish_to_exchange("events", "user.created", "u-1".into(), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        // A direct key is literal, not a glob.
        broker.bind("events", "deleted", "user.*").unwrap();
        broker
            .publish_to_exchange("events", "user.renamed", "u-2".into(), Priority::Medium)
            .await
            .unwrap();

        assert_eq!(drain(&broker, "created"), vec![("user.created".to_string(), "u-1".to_string())]);
        assert!(drain(&broker, "deleted").is_empty());
    }

    #[tokio::test]
    async fn test_fanout_exchange_ignores_key() {
        let broker = broker(&["a", "b", "unbound"]);
        broker.declare_exchange("broadcast", ExchangeKind::Fanout).unwrap();
        broker.bind("broadcast", "a", "").unwrap();
        broker.bind("broadcast", "b", "whatever").unwrap();

        let ids = broker
            .publish_to_exchange("broadcast", "anything", "hello".into(), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(drain(&broker, "a").len(), 1);
        assert_eq!(drain(&broker, "b").len(), 1);
        assert!(drain(&broker, "unbound").is_empty());
    }

    #[tokio::test]
    async fn test_topic_exchange_matches_globs() {
        let broker = broker(&["orders", "eu"]);
        broker.declare_exchange("regional", ExchangeKind::Topic).unwrap();
        broker.bind("regional", "orders", "orders.*").unwrap();
        broker.bind("regional", "eu", "*.eu").unwrap();

        let both = broker
            .publish_to_exchange("regional", "orders.eu", "o-1".into(), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(both.len(), 2);
        let none = broker
            .publish_to_exchange("regional", "users.us", "u-1".into(), Priority::Medium)
            .await
            .unwrap();
        assert!(none.is_empty());

        assert_eq!(drain(&broker, "orders"), vec![("orders.eu".to_string(), "o-1".to_string())]);
        assert_eq!(drain(&broker, "eu"), vec![("orders.eu".to_string(), "o-1".to_string())]);
    }

    #[tokio::test]
    async fn test_overlapping_bindings_deliver_once() {
        let broker = broker(&["q"]);
        broker.declare_exchange("t", ExchangeKind::Topic).unwrap();
        broker.bind("t", "q", "a.*").unwrap();
        broker.bind("t", "q", "*.b").unwrap();

        let ids = broker
            .publish_to_exchange("t", "a.b", "x".into(), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(broker.stats().exchanges["t"].bindings, 2);
    }

    #[test]
    fn test_bind_and_declare_errors() {
        let broker = broker(&["q"]);
        assert!(matches!(
            broker.bind("missing", "q", "k"),
            Err(Error::NotFound(_))
        ));
        broker.declare_exchange("x", ExchangeKind::Direct).unwrap();
        assert!(matches!(
            broker.bind("x", "missing", "k"),
            Err(Error::NotFound(_))
        ));
        broker.declare_exchange("x", ExchangeKind::Direct).unwrap();
        assert!(matches!(
            broker.declare_exchange("x", ExchangeKind::Fanout),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        let broker = broker(&[]);
        let err = broker
            .publish_to_exchange("nope", "k", "x".into(), Priority::Medium)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_deleting_queue_drops_its_bindings() {
        let broker = broker(&["a", "b"]);
        broker.declare_exchange("f", ExchangeKind::Fanout).unwrap();
        broker.bind("f", "a", "").unwrap();
        broker.bind("f", "b", "").unwrap();
        assert!(broker.unbind("f", "b", ""));
        assert!(!broker.unbind("f", "b", ""));

        assert!(broker.delete_queue("a"));
        let ids = broker
            .publish_to_exchange("f", "k", "x".into(), Priority::Medium)
            .await
            .unwrap();
        assert!(ids.is_empty());

        let stats = broker.stats();
        assert_eq!(stats.queues.len(), 1);
        assert_eq!(stats.exchanges["f"].kind, ExchangeKind::Fanout);
        assert_eq!(stats.exchanges["f"].bindings, 0);
    }

    #[test]
    fn test_create_queue_is_idempotent() {
        let broker: MessageBroker<String> = MessageBroker::new();
        let first = broker.create_queue("q", QueueConfig::default().with_capacity(5));
        let second = broker.create_queue("q", QueueConfig::default());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().capacity, 5);
    }
}
