//! Per-region key-value store abstraction
//!
//! Each region runs its own store instance behind the `RegionStore` trait;
//! connection handling lives in the implementation. The cache layer
//! namespaces every logical key with the region id before it reaches a
//! store, so the same logical key never collides across regions.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Store-level transport and backend errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connection(String),

    /// The operation exceeded its timeout budget
    #[error("operation timed out")]
    Timeout,

    /// Backend-reported failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Namespace a logical key under a region so underlying storage never
/// collides across regions
pub fn namespaced_key(region_id: &str, key: &str) -> String {
    format!("{region_id}:{key}")
}

/// One region's key-value store
#[async_trait]
pub trait RegionStore: Send + Sync {
    /// Fetch a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Store a value with an optional TTL
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a key, reporting whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Batch fetch; the result aligns with `keys` positionally
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError>;

    /// Cheap liveness probe
    async fn ping(&self) -> Result<(), StoreError>;
}

/// In-memory store used by tests and single-node deployments
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, (Bytes, Option<Instant>)>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<Bytes> {
        let entry = self.entries.get(key)?;
        let (value, expires) = entry.value();
        match expires {
            Some(deadline) if *deadline <= Instant::now() => {
                drop(entry);
                self.entries.remove(key);
                None
            }
            _ => Some(value.clone()),
        }
    }

    /// Number of stored entries, expired ones included until next touch
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RegionStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires = ttl.map(|t| Instant::now() + t);
        self.entries.insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError> {
        Ok(keys.iter().map(|k| self.live(k)).collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
