//! Shard routing, replication and scatter-gather.

use super::store::{InMemoryShardStore, ShardStore};
use super::ShardingStrategy;
use crate::config::ShardingConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::partitioning::{hash_key, HashRing};
use crate::resilience::BreakerRegistry;
use crate::types::ShardId;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Shared handle to a shard store.
pub type StoreRef<V> = Arc<dyn ShardStore<V>>;

enum ReplicaOp<V> {
    Put { key: String, value: V },
    Delete { key: String },
    /// Answered once every op queued before it has been applied.
    Flush(oneshot::Sender<()>),
}

/// One replica and the worker that applies committed ops to it in commit
/// order. The worker is spawned on first use and exits when the link drops.
struct ReplicaLink<V> {
    store: StoreRef<V>,
    sender: Mutex<Option<mpsc::UnboundedSender<ReplicaOp<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> ReplicaLink<V> {
    fn new(store: StoreRef<V>) -> Self {
        Self {
            store,
            sender: Mutex::new(None),
        }
    }

    fn enqueue(
        &self,
        op: ReplicaOp<V>,
        shard_id: &str,
        counters: &Arc<Counters>,
        metrics: &Option<Arc<MetricsCollector>>,
    ) {
        let mut sender = self.sender.lock();
        if sender.as_ref().map_or(true, |tx| tx.is_closed()) {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_replica_worker(
                shard_id.to_string(),
                self.store.clone(),
                rx,
                counters.clone(),
                metrics.clone(),
            ));
            *sender = Some(tx);
        }
        let delivered = sender.as_ref().is_some_and(|tx| tx.send(op).is_ok());
        if !delivered {
            warn!(shard_id = %shard_id, replica = %self.store.id(), "Replication worker gone");
        }
    }

    /// Resolves once everything queued so far has been applied.
    fn flush(&self) -> Option<oneshot::Receiver<()>> {
        let sender = self.sender.lock();
        let tx = sender.as_ref()?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(ReplicaOp::Flush(done_tx)).ok()?;
        Some(done_rx)
    }
}

async fn run_replica_worker<V: Send + 'static>(
    shard_id: ShardId,
    replica: StoreRef<V>,
    mut rx: mpsc::UnboundedReceiver<ReplicaOp<V>>,
    counters: Arc<Counters>,
    metrics: Option<Arc<MetricsCollector>>,
) {
    debug!(shard_id = %shard_id, replica = %replica.id(), "Replication worker started");
    while let Some(op) = rx.recv().await {
        let result = match op {
            ReplicaOp::Put { key, value } => replica.put(&key, value).await,
            ReplicaOp::Delete { key } => replica.delete(&key).await.map(|_| ()),
            ReplicaOp::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        if let Err(e) = result {
            counters.replication_failures.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &metrics {
                metrics.increment_counter(
                    "shard_replication_failures_total",
                    &[("shard", &shard_id)],
                    1.0,
                );
            }
            warn!(
                shard_id = %shard_id,
                replica = %replica.id(),
                error = %e,
                "Replication failed"
            );
        }
    }
}

struct Shard<V> {
    id: ShardId,
    primary: StoreRef<V>,
    replicas: Vec<ReplicaLink<V>>,
    healthy: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    failovers: AtomicU64,
    replication_failures: AtomicU64,
    scatter_gather_queries: AtomicU64,
}

/// A key range `[start, end)` owned by one shard, compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardRange {
    pub start: String,
    pub end: String,
    pub shard_id: ShardId,
}

impl ShardRange {
    pub fn contains(&self, key: &str) -> bool {
        self.start.as_str() <= key && key < self.end.as_str()
    }
}

#[derive(Debug)]
struct Routing {
    /// Shards in registration order.
    order: Vec<ShardId>,
    ring: HashRing,
    ranges: Vec<ShardRange>,
    directory: HashMap<String, ShardId>,
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRead<V> {
    pub value: Option<V>,
    pub shard_id: ShardId,
    /// Store that answered.
    pub served_by: String,
    /// True when a replica answered; it may lag the primary.
    pub stale: bool,
}

/// Best-effort aggregate of a fan-out to every shard.
#[derive(Debug)]
pub struct ScatterGather<R> {
    pub results: Vec<(ShardId, R)>,
    pub failed: Vec<(ShardId, Error)>,
}

impl<R> ScatterGather<R> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_shards(&self) -> Vec<&str> {
        self.failed.iter().map(|(id, _)| id.as_str()).collect()
    }
}

/// Routes partition keys to shards and keeps their replicas in sync.
///
/// Writes go to the primary; once it commits, the op is queued for every
/// replica and applied there in commit order by a background worker. Reads prefer the primary and fall back to replicas
/// (flagged `stale`) while the primary is down, marked unhealthy, or its
/// circuit breaker is open.
pub struct ShardManager<V> {
    config: ShardingConfig,
    shards: DashMap<ShardId, Arc<Shard<V>>>,
    routing: RwLock<Routing>,
    breakers: Option<Arc<BreakerRegistry>>,
    counters: Arc<Counters>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<V: Clone + Send + Sync + 'static> ShardManager<V> {
    pub fn new(config: ShardingConfig) -> Self {
        let ring = HashRing::with_vnodes(config.virtual_nodes);
        Self {
            config,
            shards: DashMap::new(),
            routing: RwLock::new(Routing {
                order: Vec::new(),
                ring,
                ranges: Vec::new(),
                directory: HashMap::new(),
            }),
            breakers: None,
            counters: Arc::new(Counters::default()),
            metrics: None,
        }
    }

    /// Guard each primary with a breaker from `registry`.
    pub fn with_breakers(mut self, registry: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    fn breaker_dependency(shard_id: &str) -> String {
        format!("shard:{}", shard_id)
    }

    /// Register a shard. Replicas beyond `replication_factor - 1` are ignored.
    pub fn add_shard(
        &self,
        id: &str,
        primary: StoreRef<V>,
        replicas: Vec<StoreRef<V>>,
    ) -> Result<()> {
        let wanted = self.config.replication_factor.saturating_sub(1);
        if replicas.len() < wanted {
            warn!(
                shard_id = %id,
                replicas = replicas.len(),
                wanted,
                "Shard has fewer replicas than the replication factor"
            );
        }

        let mut routing = self.routing.write();
        if self.shards.contains_key(id) {
            return Err(Error::Config(format!("shard {} already registered", id)));
        }
        let shard = Shard {
            id: id.to_string(),
            primary,
            replicas: replicas
                .into_iter()
                .take(wanted)
                .map(ReplicaLink::new)
                .collect(),
            healthy: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        };
        let replica_count = shard.replicas.len();
        self.shards.insert(id.to_string(), Arc::new(shard));
        routing.order.push(id.to_string());
        routing.ring.add_node(id);
        self.update_gauges(routing.order.len());
        info!(shard_id = %id, replicas = replica_count, "Shard added");
        Ok(())
    }

    /// Register a shard whose primary and replicas are in-memory stores.
    pub fn add_in_memory_shard(&self, id: &str) -> Result<()> {
        let primary: StoreRef<V> = Arc::new(InMemoryShardStore::new(id));
        let replicas = (1..self.config.replication_factor)
            .map(|i| {
                Arc::new(InMemoryShardStore::new(format!("{}-replica-{}", id, i))) as StoreRef<V>
            })
            .collect();
        self.add_shard(id, primary, replicas)
    }

    /// Unregister a shard and every route pointing at it.
    pub fn remove_shard(&self, id: &str) -> bool {
        let mut routing = self.routing.write();
        if self.shards.remove(id).is_none() {
            return false;
        }
        routing.order.retain(|s| s != id);
        routing.ring.remove_node(id);
        routing.ranges.retain(|r| r.shard_id != id);
        routing.directory.retain(|_, s| s != id);
        self.update_gauges(routing.order.len());
        info!(shard_id = %id, "Shard removed");
        true
    }

    /// Route keys in `[start, end)` to `shard_id` under range sharding.
    pub fn add_range(&self, start: &str, end: &str, shard_id: &str) -> Result<()> {
        if start >= end {
            return Err(Error::Config(format!("empty range [{}, {})", start, end)));
        }
        // Shards are only added or removed under this lock.
        let mut routing = self.routing.write();
        if !self.shards.contains_key(shard_id) {
            return Err(Error::NotFound(format!("shard {}", shard_id)));
        }
        if let Some(overlap) = routing
            .ranges
            .iter()
            .find(|r| start < r.end.as_str() && r.start.as_str() < end)
        {
            return Err(Error::Config(format!(
                "range [{}, {}) overlaps [{}, {}) on {}",
                start, end, overlap.start, overlap.end, overlap.shard_id
            )));
        }
        routing.ranges.push(ShardRange {
            start: start.to_string(),
            end: end.to_string(),
            shard_id: shard_id.to_string(),
        });
        routing.ranges.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(())
    }

    /// Pin `key` to `shard_id` under directory sharding.
    pub fn assign(&self, key: &str, shard_id: &str) -> Result<()> {
        let mut routing = self.routing.write();
        if !self.shards.contains_key(shard_id) {
            return Err(Error::NotFound(format!("shard {}", shard_id)));
        }
        routing
            .directory
            .insert(key.to_string(), shard_id.to_string());
        Ok(())
    }

    /// Shard owning `key` under the configured strategy.
    pub fn shard_for_key(&self, key: &str) -> Result<ShardId> {
        let routing = self.routing.read();
        let found = match self.config.strategy {
            ShardingStrategy::Modulo => {
                if routing.order.is_empty() {
                    None
                } else {
                    let index = hash_key(key.as_bytes()) % routing.order.len() as u64;
                    routing.order.get(index as usize).cloned()
                }
            }
            ShardingStrategy::Range => routing
                .ranges
                .iter()
                .find(|r| r.contains(key))
                .map(|r| r.shard_id.clone()),
            ShardingStrategy::Directory => routing.directory.get(key).cloned(),
            ShardingStrategy::ConsistentHash => {
                routing.ring.get_primary(key.as_bytes()).map(str::to_string)
            }
        };
        found.ok_or_else(|| Error::NotFound(format!("no shard for key {:?}", key)))
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.routing.read().order.clone()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, id: &str) -> Result<Arc<Shard<V>>> {
        self.shards
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::NotFound(format!("shard {}", id)))
    }

    fn primary_available(&self, shard: &Shard<V>) -> bool {
        if !shard.healthy.load(Ordering::Acquire) {
            return false;
        }
        match &self.breakers {
            Some(registry) => registry
                .get(&Self::breaker_dependency(&shard.id))
                .map_or(true, |b| b.is_call_permitted()),
            None => true,
        }
    }

    async fn call_primary<T, F, Fut>(&self, shard: &Shard<V>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.breakers {
            Some(registry) => {
                registry
                    .get_or_create(&Self::breaker_dependency(&shard.id))
                    .call(f)
                    .await
            }
            None => f().await,
        }
    }

    fn unavailable(shard_id: &str, reason: impl ToString) -> Error {
        Error::ShardUnavailable {
            shard_id: shard_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Write `value` under `key` to its shard. Returns the shard id.
    pub async fn write(&self, key: &str, value: V) -> Result<ShardId> {
        let shard_id = self.shard_for_key(key)?;
        let shard = self.shard(&shard_id)?;
        if !shard.healthy.load(Ordering::Acquire) {
            return Err(Self::unavailable(&shard_id, "primary marked unhealthy"));
        }

        let primary = shard.primary.clone();
        let committed = value.clone();
        self.call_primary(&shard, || async move { primary.put(key, committed).await })
            .await
            .map_err(|e| Self::unavailable(&shard_id, e))?;

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        shard.writes.fetch_add(1, Ordering::Relaxed);
        self.replicate(
            &shard,
            |key| ReplicaOp::Put {
                key,
                value: value.clone(),
            },
            key,
        );
        Ok(shard_id)
    }

    /// Delete `key` from its shard. Returns whether the primary held it.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let shard_id = self.shard_for_key(key)?;
        let shard = self.shard(&shard_id)?;
        if !shard.healthy.load(Ordering::Acquire) {
            return Err(Self::unavailable(&shard_id, "primary marked unhealthy"));
        }

        let primary = shard.primary.clone();
        let existed = self
            .call_primary(&shard, || async move { primary.delete(key).await })
            .await
            .map_err(|e| Self::unavailable(&shard_id, e))?;
        self.replicate(&shard, |key| ReplicaOp::Delete { key }, key);
        Ok(existed)
    }

    /// Queue a committed op for every replica of `shard`.
    fn replicate<F>(&self, shard: &Shard<V>, op: F, key: &str)
    where
        F: Fn(String) -> ReplicaOp<V>,
    {
        for replica in &shard.replicas {
            replica.enqueue(op(key.to_string()), &shard.id, &self.counters, &self.metrics);
        }
    }

    /// Wait until every replica has applied all ops queued so far.
    pub async fn flush_replication(&self) {
        let pending: Vec<oneshot::Receiver<()>> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .replicas
                    .iter()
                    .filter_map(|replica| replica.flush())
                    .collect::<Vec<_>>()
            })
            .collect();
        for result in join_all(pending).await {
            if result.is_err() {
                warn!("Replication worker stopped before flushing");
            }
        }
    }

    /// Read `key`, failing over to replicas when the primary cannot answer.
    pub async fn read(&self, key: &str) -> Result<ShardRead<V>> {
        let shard_id = self.shard_for_key(key)?;
        let shard = self.shard(&shard_id)?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        shard.reads.fetch_add(1, Ordering::Relaxed);

        let mut last_error = None;
        if self.primary_available(&shard) {
            let primary = shard.primary.clone();
            match self
                .call_primary(&shard, || async move { primary.get(key).await })
                .await
            {
                Ok(value) => {
                    return Ok(ShardRead {
                        value,
                        served_by: shard.primary.id().to_string(),
                        shard_id,
                        stale: false,
                    })
                }
                Err(e) => {
                    debug!(shard_id = %shard_id, error = %e, "Primary read failed");
                    last_error = Some(e);
                }
            }
        }

        for replica in shard.replicas.iter().map(|r| &r.store) {
            match replica.get(key).await {
                Ok(value) => {
                    self.counters.failovers.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.increment_counter(
                            "shard_failovers_total",
                            &[("shard", &shard_id)],
                            1.0,
                        );
                    }
                    debug!(shard_id = %shard_id, replica = %replica.id(), "Read served by replica");
                    return Ok(ShardRead {
                        value,
                        served_by: replica.id().to_string(),
                        shard_id,
                        stale: true,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        let reason = last_error.map_or_else(
            || "primary unavailable and no replicas".to_string(),
            |e| e.to_string(),
        );
        Err(Self::unavailable(&shard_id, reason))
    }

    /// Mark a shard's primary up or down by hand.
    pub fn set_shard_health(&self, id: &str, healthy: bool) -> Result<()> {
        let shard = self.shard(id)?;
        let was = shard.healthy.swap(healthy, Ordering::AcqRel);
        if was != healthy {
            if healthy {
                info!(shard_id = %id, "Shard primary restored");
            } else {
                warn!(shard_id = %id, "Shard primary marked unhealthy");
            }
        }
        Ok(())
    }

    /// Ping every primary and update its health. Returns the healthy count.
    pub async fn check_health_once(&self) -> usize {
        let shards: Vec<Arc<Shard<V>>> =
            self.shards.iter().map(|s| Arc::clone(s.value())).collect();
        let pings = join_all(shards.iter().map(|s| s.primary.ping())).await;
        let mut healthy = 0;
        for (shard, ping) in shards.iter().zip(pings) {
            let ok = ping.is_ok();
            if ok {
                healthy += 1;
            }
            // The shard is known to exist, so this cannot fail.
            let _ = self.set_shard_health(&shard.id, ok);
        }
        healthy
    }

    /// Run `op` against every shard's primary in parallel.
    ///
    /// Shards whose primary is unavailable, or whose `op` fails, are listed
    /// in `failed`; the rest contribute to `results` in registration order.
    pub async fn scatter_gather<R, F, Fut>(&self, op: F) -> ScatterGather<R>
    where
        F: Fn(ShardId, StoreRef<V>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.counters
            .scatter_gather_queries
            .fetch_add(1, Ordering::Relaxed);
        let shards: Vec<Arc<Shard<V>>> = self
            .shard_ids()
            .iter()
            .filter_map(|id| self.shard(id).ok())
            .collect();

        let op = &op;
        let outcomes = join_all(shards.iter().map(|shard| async move {
            if !self.primary_available(shard) {
                let error = Self::unavailable(&shard.id, "primary unavailable");
                return (shard.id.clone(), Err(error));
            }
            let id = shard.id.clone();
            let store = shard.primary.clone();
            let result = self.call_primary(shard, || op(id, store)).await;
            (shard.id.clone(), result)
        }))
        .await;

        let mut gathered = ScatterGather {
            results: Vec::new(),
            failed: Vec::new(),
        };
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(value) => gathered.results.push((shard_id, value)),
                Err(e) => gathered.failed.push((shard_id, e)),
            }
        }
        if !gathered.failed.is_empty() {
            warn!(
                failed = ?gathered.failed_shards(),
                succeeded = gathered.results.len(),
                "Scatter-gather incomplete"
            );
        }
        gathered
    }

    fn update_gauges(&self, shards: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge("shards_total", &[], shards as f64);
        }
    }

    pub fn stats(&self) -> ShardManagerStats {
        let per_shard: Vec<ShardStats> = self
            .shard_ids()
            .iter()
            .filter_map(|id| self.shard(id).ok())
            .map(|s| ShardStats {
                id: s.id.clone(),
                healthy: s.healthy.load(Ordering::Acquire),
                replicas: s.replicas.len(),
                reads: s.reads.load(Ordering::Relaxed),
                writes: s.writes.load(Ordering::Relaxed),
            })
            .collect();
        ShardManagerStats {
            strategy: self.config.strategy,
            replication_factor: self.config.replication_factor,
            total_shards: per_shard.len(),
            healthy_shards: per_shard.iter().filter(|s| s.healthy).count(),
            total_replicas: per_shard.iter().map(|s| s.replicas).sum(),
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            failovers: self.counters.failovers.load(Ordering::Relaxed),
            replication_failures: self.counters.replication_failures.load(Ordering::Relaxed),
            scatter_gather_queries: self.counters.scatter_gather_queries.load(Ordering::Relaxed),
            shards: per_shard,
        }
    }
}

/// Per-shard statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub id: ShardId,
    pub healthy: bool,
    pub replicas: usize,
    pub reads: u64,
    pub writes: u64,
}

/// Shard manager statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ShardManagerStats {
    pub strategy: ShardingStrategy,
    pub replication_factor: usize,
    pub total_shards: usize,
    pub healthy_shards: usize,
    pub total_replicas: usize,
    pub reads: u64,
    pub writes: u64,
    pub failovers: u64,
    pub replication_failures: u64,
    pub scatter_gather_queries: u64,
    pub shards: Vec<ShardStats>,
}
