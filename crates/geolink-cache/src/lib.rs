//! GeoLink Geo-Distributed Cache
//!
//! Presents a logically single cache value across independent per-region
//! key-value stores: reads fall back across regions with opportunistic
//! back-replication, writes replicate synchronously or through a queued
//! asynchronous drain loop, and a background health checker gates which
//! regions participate.
//!
//! There is no cross-region locking or ordering: concurrent writers resolve
//! by last-write-wins at each region independently, a deliberate
//! weak-consistency trade-off.

#![warn(missing_docs)]

pub mod cache;
pub mod envelope;
pub mod health;
pub mod replication;
pub mod stats;
pub mod store;

pub use cache::{Consistency, DeleteOptions, GeoCache, GetOptions, RegionClient, SetOptions};
pub use envelope::{Envelope, ValueKind};
pub use health::{HealthMonitor, HealthState, RegionHealth};
pub use replication::{ReplicationJob, ReplicationQueue, ReplicationTarget};
pub use stats::{CacheStats, RegionStatsSnapshot};
pub use store::{MemoryStore, RegionStore, StoreError};

use std::time::Duration;
use thiserror::Error;

/// Geo-distributed cache configuration, supplied once at construction
#[derive(Debug, Clone)]
pub struct GeoCacheConfig {
    /// Region used when nothing healthier can be resolved
    pub primary_region: String,
    /// Default TTL applied to writes that do not specify one
    pub default_ttl: Option<Duration>,
    /// Envelope size above which values are compressed
    pub compression_threshold: usize,
    /// Per-region operation timeout
    pub op_timeout: Duration,
    /// Background health-check cadence
    pub health_check_interval: Duration,
    /// Background replication-drain cadence
    pub replication_interval: Duration,
    /// Replication attempts before a job is dropped
    pub max_replication_retries: u32,
    /// Bound on the pending-replication queue
    pub replication_queue_capacity: usize,
    /// Consecutive per-region errors that flip a region unhealthy
    pub error_threshold: u32,
}

impl Default for GeoCacheConfig {
    fn default() -> Self {
        Self {
            primary_region: String::new(),
            default_ttl: Some(Duration::from_secs(3600)),
            compression_threshold: 1024,
            op_timeout: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(10),
            replication_interval: Duration::from_millis(500),
            max_replication_retries: 3,
            replication_queue_capacity: 10_000,
            error_threshold: 5,
        }
    }
}

/// Geo-distributed cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// The primary-region write failed; the durability contract requires at
    /// least one replica before a write is acknowledged
    #[error("primary write to region {region} failed: {source}")]
    PrimaryWriteFailed {
        /// Region that refused the write
        region: String,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// Every region in the fallback chain failed with a real error
    #[error("all regions failed for key {0}")]
    AllRegionsFailed(String),

    /// Referenced region is not in the registry
    #[error("unknown region: {0}")]
    UnknownRegion(String),

    /// A registry region has no store wired to it
    #[error("no store configured for region {0}")]
    MissingStore(String),

    /// Envelope encoding failed
    #[error("envelope encode failed: {0}")]
    Encode(String),

    /// Envelope decoding failed
    #[error("envelope decode failed: {0}")]
    Decode(String),

    /// Store-level failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Region registry error
    #[error(transparent)]
    Registry(#[from] geolink_common::RegistryError),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
