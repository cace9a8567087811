//! Storage behind a shard.

use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A key-value store holding one shard's (or one replica's) data.
#[async_trait]
pub trait ShardStore<V>: Send + Sync {
    /// Identifier used in errors and logs.
    fn id(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<V>>;

    async fn put(&self, key: &str, value: V) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<()>;
}

/// Process-local store backed by a concurrent map.
///
/// Can be switched offline to simulate an outage.
#[derive(Debug)]
pub struct InMemoryShardStore<V> {
    id: String,
    data: DashMap<String, V>,
    available: AtomicBool,
}

impl<V> InMemoryShardStore<V> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::ShardUnavailable {
                shard_id: self.id.clone(),
                reason: "store offline".into(),
            })
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> ShardStore<V> for InMemoryShardStore<V> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        self.check()?;
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: V) -> Result<()> {
        self.check()?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.data.remove(key).is_some())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}
