//! The geo-distributed cache service
//!
//! One logical client per region; a primary region resolved per request by
//! explicit preference, caller geo-hint, or priority fallback; reads with
//! cross-region fallback and opportunistic back-replication; writes with
//! immediate or queued-eventual replication.
//!
//! Region selection here is "closest healthy", not the router's "closest
//! covering": the cache only cares about latency, the router honors
//! coverage contracts. The asymmetry is intentional.

use crate::envelope::{self, Envelope};
use crate::health::{run_health_loop, HealthMonitor, HealthState};
use crate::replication::{
    drain_once, run_replication_loop, ReplicationJob, ReplicationQueue, ReplicationTarget,
};
use crate::stats::{CacheCounters, CacheStats, RegionCounters, RegionStatsSnapshot};
use crate::store::{namespaced_key, RegionStore, StoreError};
use crate::{CacheError, CacheResult, GeoCacheConfig};
use bytes::Bytes;
use geolink_common::{GeoPoint, Region, RegionRegistry};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Write replication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Fan out to every other healthy region and wait for all to settle
    Immediate,
    /// Acknowledge after the primary write; replicate via the drain loop
    Eventual,
}

impl Default for Consistency {
    fn default() -> Self {
        Self::Eventual
    }
}

/// Read options
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Caller location hint for primary-region selection
    pub user_point: Option<GeoPoint>,
    /// Explicit region preference; used only while healthy
    pub preferred_region: Option<String>,
    /// Error instead of returning empty when every region failed with a
    /// real error (a clean miss anywhere still returns empty)
    pub throw_on_error: bool,
}

/// Write options
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// TTL override; falls back to the configured default
    pub ttl: Option<Duration>,
    /// Replication mode
    pub consistency: Consistency,
    /// Whether to replicate at all
    pub replicate: bool,
    /// Caller location hint for primary-region selection
    pub user_point: Option<GeoPoint>,
    /// Explicit region preference; used only while healthy
    pub preferred_region: Option<String>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            consistency: Consistency::Eventual,
            replicate: true,
            user_point: None,
            preferred_region: None,
        }
    }
}

/// Delete options
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Replication mode: immediate waits for all regions, eventual is
    /// fire-and-forget (stale positives are bounded by TTL)
    pub consistency: Consistency,
}

/// One region's store client with its running counters
pub struct RegionClient {
    /// Region configuration
    pub region: Region,
    /// The region's key-value store
    pub store: Arc<dyn RegionStore>,
    /// Request/error/latency counters
    pub counters: RegionCounters,
}

/// The geo-distributed cache
pub struct GeoCache {
    config: GeoCacheConfig,
    registry: Arc<RegionRegistry>,
    clients: Arc<HashMap<String, Arc<RegionClient>>>,
    primary: Arc<RegionClient>,
    health: Arc<HealthMonitor>,
    queue: Arc<ReplicationQueue>,
    counters: CacheCounters,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GeoCache {
    /// Wire one store per registry region
    pub fn new(
        config: GeoCacheConfig,
        registry: Arc<RegionRegistry>,
        mut stores: HashMap<String, Arc<dyn RegionStore>>,
    ) -> CacheResult<Self> {
        if registry.lookup(&config.primary_region).is_none() {
            return Err(CacheError::UnknownRegion(config.primary_region.clone()));
        }

        let mut clients = HashMap::with_capacity(registry.len());
        for region in registry.all() {
            let store = stores
                .remove(&region.id)
                .ok_or_else(|| CacheError::MissingStore(region.id.clone()))?;
            clients.insert(
                region.id.clone(),
                Arc::new(RegionClient {
                    region: region.clone(),
                    store,
                    counters: RegionCounters::default(),
                }),
            );
        }

        let primary = clients
            .get(&config.primary_region)
            .cloned()
            .ok_or_else(|| CacheError::UnknownRegion(config.primary_region.clone()))?;

        let health = Arc::new(HealthMonitor::new(
            registry.all().iter().map(|r| r.id.clone()),
        ));
        let queue = Arc::new(ReplicationQueue::new(config.replication_queue_capacity));

        Ok(Self {
            config,
            registry,
            clients: Arc::new(clients),
            primary,
            health,
            queue,
            counters: CacheCounters::default(),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background health-check and replication-drain loops
    pub fn start(&self) {
        let mut guard = self.shutdown.lock();
        if guard.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);

        let health_task = tokio::spawn(run_health_loop(
            self.clients.clone(),
            self.health.clone(),
            self.config.health_check_interval,
            self.config.op_timeout,
            rx.clone(),
        ));
        let replication_task = tokio::spawn(run_replication_loop(
            self.queue.clone(),
            self.clients.clone(),
            self.health.clone(),
            self.config.replication_interval,
            self.config.op_timeout,
            self.config.max_replication_retries,
            rx,
        ));

        *guard = Some(tx);
        self.tasks.lock().extend([health_task, replication_task]);
        info!("geo cache background loops started");
    }

    /// Signal both loops and wait for them; the replication loop performs a
    /// final best-effort drain on the way out
    pub async fn shutdown(&self) {
        let sender = self.shutdown.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("geo cache background loops stopped");
    }

    /// Resolve the primary region for a request
    ///
    /// Preference wins while healthy; a geo-hint picks the closest healthy
    /// region (no radius gate); otherwise priority order, first healthy;
    /// with nothing healthy the designated primary serves degraded.
    pub fn optimal_region(
        &self,
        user_point: Option<&GeoPoint>,
        preferred: Option<&str>,
    ) -> Arc<RegionClient> {
        if let Some(id) = preferred {
            if let Some(client) = self.clients.get(id) {
                if self.health.is_healthy(id) {
                    return client.clone();
                }
                debug!(region = id, "preferred region not healthy, falling through");
            }
        }

        if let Some(point) = user_point {
            let closest = self
                .clients
                .values()
                .filter(|c| self.health.is_healthy(&c.region.id))
                .min_by(|a, b| {
                    point
                        .distance_m(&a.region.location)
                        .partial_cmp(&point.distance_m(&b.region.location))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            if let Some(client) = closest {
                return client.clone();
            }
        }

        for region in self.registry.all() {
            if self.health.is_healthy(&region.id) {
                if let Some(client) = self.clients.get(&region.id) {
                    return client.clone();
                }
            }
        }

        // Nothing healthy: serve degraded rather than fail outright
        self.primary.clone()
    }

    /// Read a value, falling back across healthy regions
    pub async fn get(&self, key: &str, options: &GetOptions) -> CacheResult<Option<Value>> {
        let primary = self.optimal_region(options.user_point.as_ref(), options.preferred_region.as_deref());
        let mut clean_miss = false;
        let mut errored = false;

        match self.read_region(&primary, key).await {
            Ok(Some(bytes)) => {
                self.counters.hit();
                return Ok(Some(envelope::decode(&bytes)?.v));
            }
            Ok(None) => clean_miss = true,
            Err(error) => {
                debug!(key, region = %primary.region.id, %error, "primary read failed");
                errored = true;
            }
        }

        for region in self.registry.all() {
            if region.id == primary.region.id || !self.health.is_healthy(&region.id) {
                continue;
            }
            let Some(client) = self.clients.get(&region.id) else {
                continue;
            };

            match self.read_region(client, key).await {
                Ok(Some(bytes)) => {
                    self.counters.hit();
                    // Warm the primary so the next read is local
                    self.queue.push(ReplicationJob::new(
                        key,
                        bytes.clone(),
                        self.config.default_ttl,
                        ReplicationTarget::Region(primary.region.id.clone()),
                    ));
                    info!(
                        key,
                        found_in = %region.id,
                        warming = %primary.region.id,
                        "cross-region fallback hit"
                    );
                    return Ok(Some(envelope::decode(&bytes)?.v));
                }
                Ok(None) => clean_miss = true,
                Err(error) => {
                    debug!(key, region = %region.id, %error, "fallback read failed");
                    errored = true;
                }
            }
        }

        self.counters.miss();
        if options.throw_on_error && errored && !clean_miss {
            return Err(CacheError::AllRegionsFailed(key.to_string()));
        }
        Ok(None)
    }

    /// Write a value; the primary write must succeed before anything is
    /// acknowledged, replication follows the requested consistency
    pub async fn set(&self, key: &str, value: &Value, options: &SetOptions) -> CacheResult<()> {
        let primary = self.optimal_region(options.user_point.as_ref(), options.preferred_region.as_deref());
        let ttl = options.ttl.or(self.config.default_ttl);

        let envelope = Envelope::wrap(value.clone());
        let bytes = envelope::encode(&envelope, self.config.compression_threshold)?;

        let start = Instant::now();
        let target_key = namespaced_key(&primary.region.id, key);
        let write = primary.store.set(&target_key, bytes.clone(), ttl);
        match tokio::time::timeout(self.config.op_timeout, write).await {
            Ok(Ok(())) => primary.counters.record_success(start.elapsed()),
            Ok(Err(error)) => {
                self.note_region_error(&primary, &error);
                return Err(CacheError::PrimaryWriteFailed {
                    region: primary.region.id.clone(),
                    source: error,
                });
            }
            Err(_) => {
                let error = StoreError::Timeout;
                self.note_region_error(&primary, &error);
                return Err(CacheError::PrimaryWriteFailed {
                    region: primary.region.id.clone(),
                    source: error,
                });
            }
        }

        if options.replicate {
            match options.consistency {
                Consistency::Immediate => {
                    self.replicate_immediate(key, &primary, bytes, ttl).await;
                }
                Consistency::Eventual => {
                    self.queue.push(ReplicationJob::new(
                        key,
                        bytes,
                        ttl,
                        ReplicationTarget::AllExcept(primary.region.id.clone()),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Synchronous fan-out to every other healthy region; partial failures
    /// degrade the region and warn, never fail the write
    async fn replicate_immediate(
        &self,
        key: &str,
        primary: &RegionClient,
        bytes: Bytes,
        ttl: Option<Duration>,
    ) {
        let mut join = JoinSet::new();
        for client in self.clients.values() {
            if client.region.id == primary.region.id || !self.health.is_healthy(&client.region.id) {
                continue;
            }
            let client = client.clone();
            let bytes = bytes.clone();
            let key = key.to_string();
            let op_timeout = self.config.op_timeout;

            join.spawn(async move {
                let start = Instant::now();
                let target_key = namespaced_key(&client.region.id, &key);
                let write = client.store.set(&target_key, bytes, ttl);
                let result = match tokio::time::timeout(op_timeout, write).await {
                    Ok(Ok(())) => Ok(start.elapsed()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(StoreError::Timeout),
                };
                (client, result)
            });
        }

        while let Some(joined) = join.join_next().await {
            let Ok((client, result)) = joined else {
                continue;
            };
            match result {
                Ok(elapsed) => client.counters.record_success(elapsed),
                Err(error) => {
                    self.note_region_error(&client, &error);
                    warn!(key, region = %client.region.id, %error, "immediate replication failed");
                }
            }
        }
    }

    /// Delete from every healthy region
    pub async fn delete(&self, key: &str, options: &DeleteOptions) -> CacheResult<bool> {
        let targets: Vec<Arc<RegionClient>> = self
            .clients
            .values()
            .filter(|c| self.health.is_healthy(&c.region.id))
            .cloned()
            .collect();

        match options.consistency {
            Consistency::Immediate => {
                let mut join = JoinSet::new();
                for client in targets {
                    let key = key.to_string();
                    let op_timeout = self.config.op_timeout;
                    join.spawn(async move {
                        let target_key = namespaced_key(&client.region.id, &key);
                        let result = match tokio::time::timeout(op_timeout, client.store.delete(&target_key)).await
                        {
                            Ok(Ok(removed)) => Ok(removed),
                            Ok(Err(e)) => Err(e),
                            Err(_) => Err(StoreError::Timeout),
                        };
                        (client, result)
                    });
                }

                let mut any_removed = false;
                while let Some(joined) = join.join_next().await {
                    let Ok((client, result)) = joined else {
                        continue;
                    };
                    match result {
                        Ok(removed) => any_removed |= removed,
                        Err(error) => {
                            self.note_region_error(&client, &error);
                            warn!(key, region = %client.region.id, %error, "delete failed");
                        }
                    }
                }
                Ok(any_removed)
            }
            Consistency::Eventual => {
                for client in targets {
                    let key = namespaced_key(&client.region.id, key);
                    tokio::spawn(async move {
                        if let Err(error) = client.store.delete(&key).await {
                            debug!(%key, region = %client.region.id, %error, "eventual delete failed");
                        }
                    });
                }
                Ok(true)
            }
        }
    }

    /// Batch read: primary first, then the other healthy regions for only
    /// the keys still missing, back-replicating off-primary hits
    pub async fn mget(
        &self,
        keys: &[String],
        options: &GetOptions,
    ) -> CacheResult<HashMap<String, Value>> {
        let mut found = HashMap::new();
        if keys.is_empty() {
            return Ok(found);
        }

        let primary = self.optimal_region(options.user_point.as_ref(), options.preferred_region.as_deref());
        let mut missing: Vec<String> = keys.to_vec();

        match self.read_region_batch(&primary, &missing).await {
            Ok(values) => {
                let mut still_missing = Vec::new();
                for (key, value) in missing.iter().zip(values) {
                    match value {
                        Some(bytes) => {
                            self.counters.hit();
                            found.insert(key.clone(), envelope::decode(&bytes)?.v);
                        }
                        None => still_missing.push(key.clone()),
                    }
                }
                missing = still_missing;
            }
            Err(error) => {
                debug!(region = %primary.region.id, %error, "primary batch read failed");
            }
        }

        for region in self.registry.all() {
            if missing.is_empty() {
                break;
            }
            if region.id == primary.region.id || !self.health.is_healthy(&region.id) {
                continue;
            }
            let Some(client) = self.clients.get(&region.id) else {
                continue;
            };

            match self.read_region_batch(client, &missing).await {
                Ok(values) => {
                    let mut still_missing = Vec::new();
                    for (key, value) in missing.iter().zip(values) {
                        match value {
                            Some(bytes) => {
                                self.counters.hit();
                                self.queue.push(ReplicationJob::new(
                                    key,
                                    bytes.clone(),
                                    self.config.default_ttl,
                                    ReplicationTarget::Region(primary.region.id.clone()),
                                ));
                                found.insert(key.clone(), envelope::decode(&bytes)?.v);
                            }
                            None => still_missing.push(key.clone()),
                        }
                    }
                    missing = still_missing;
                }
                Err(error) => {
                    debug!(region = %region.id, %error, "fallback batch read failed");
                }
            }
        }

        for _ in &missing {
            self.counters.miss();
        }
        Ok(found)
    }

    /// Structured stats for monitoring collaborators
    pub fn stats(&self) -> CacheStats {
        let (hits, misses, errors) = self.counters.snapshot();
        let health = self.health.snapshot();

        let regions = self
            .registry
            .all()
            .iter()
            .filter_map(|r| self.clients.get(&r.id))
            .map(|client| {
                let record = health.get(&client.region.id);
                RegionStatsSnapshot {
                    region_id: client.region.id.clone(),
                    requests: client.counters.requests(),
                    errors: client.counters.errors(),
                    avg_latency_ms: client.counters.avg_latency_ms(),
                    state: record.map(|h| h.state).unwrap_or(HealthState::Healthy),
                    last_error: record.and_then(|h| h.last_error.clone()),
                }
            })
            .collect();

        CacheStats {
            hits,
            misses,
            errors,
            hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            replication_dropped: self.queue.dropped(),
            replication_pending: self.queue.len(),
            regions,
        }
    }

    /// Drain the pending replication queue once, synchronously
    pub async fn flush_replication(&self) {
        drain_once(
            &self.queue,
            &self.clients,
            &self.health,
            self.config.op_timeout,
            self.config.max_replication_retries,
        )
        .await;
    }

    /// Health map handle, for monitoring and transport-layer integration
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Transport integration hook, see [`HealthMonitor::mark_reconnecting`]
    pub fn mark_reconnecting(&self, region_id: &str) {
        self.health.mark_reconnecting(region_id);
    }

    /// Pending replication job count
    pub fn pending_replication(&self) -> usize {
        self.queue.len()
    }

    async fn read_region(
        &self,
        client: &RegionClient,
        key: &str,
    ) -> Result<Option<Bytes>, StoreError> {
        let start = Instant::now();
        let target_key = namespaced_key(&client.region.id, key);
        let result = match tokio::time::timeout(self.config.op_timeout, client.store.get(&target_key)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::Timeout),
        };

        match &result {
            Ok(_) => client.counters.record_success(start.elapsed()),
            Err(error) => self.note_region_error(client, error),
        }
        result
    }

    async fn read_region_batch(
        &self,
        client: &RegionClient,
        keys: &[String],
    ) -> Result<Vec<Option<Bytes>>, StoreError> {
        let start = Instant::now();
        let target_keys: Vec<String> = keys
            .iter()
            .map(|k| namespaced_key(&client.region.id, k))
            .collect();
        let result = match tokio::time::timeout(self.config.op_timeout, client.store.mget(&target_keys)).await
        {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::Timeout),
        };

        match &result {
            Ok(_) => client.counters.record_success(start.elapsed()),
            Err(error) => self.note_region_error(client, error),
        }
        result
    }

    /// Count an error against a region; a long enough streak flips it
    /// unhealthy until the next successful probe
    fn note_region_error(&self, client: &RegionClient, error: &StoreError) {
        self.counters.error();
        let streak = client.counters.record_error();
        if streak >= self.config.error_threshold {
            self.health.set_unhealthy(&client.region.id, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use geolink_common::EndpointKind;
    use serde_json::json;

    /// Store that fails every operation
    struct FailStore;

    #[async_trait]
    impl RegionStore for FailStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn set(
            &self,
            _key: &str,
            _value: Bytes,
            _ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn mget(&self, _keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
    }

    fn region(id: &str, lat: f64, lng: f64, radius: f64, priority: u32, fallback: bool) -> Region {
        let mut endpoints = HashMap::new();
        endpoints.insert(EndpointKind::Api, format!("https://api.{id}.example.com"));
        Region {
            id: id.to_string(),
            name: id.to_string(),
            location: GeoPoint::new(lat, lng),
            coverage_radius_m: radius,
            priority,
            endpoints,
            datacenter: format!("dc-{id}"),
            fallback,
        }
    }

    fn registry() -> Arc<RegionRegistry> {
        Arc::new(
            RegionRegistry::new(vec![
                region("stockholm", 59.3293, 18.0686, 150_000.0, 1, false),
                region("gothenburg", 57.7089, 11.9746, 120_000.0, 2, false),
                // Anchored away from the others so geo-hint tests are
                // deterministic
                region("global", 50.1109, 8.6821, f64::MAX, 100, true),
            ])
            .unwrap(),
        )
    }

    fn config() -> GeoCacheConfig {
        GeoCacheConfig {
            primary_region: "stockholm".to_string(),
            error_threshold: 1,
            op_timeout: Duration::from_millis(500),
            ..GeoCacheConfig::default()
        }
    }

    fn memory_stores() -> (
        HashMap<String, Arc<dyn RegionStore>>,
        Arc<MemoryStore>,
        Arc<MemoryStore>,
        Arc<MemoryStore>,
    ) {
        let sto = Arc::new(MemoryStore::new());
        let got = Arc::new(MemoryStore::new());
        let glo = Arc::new(MemoryStore::new());
        let mut stores: HashMap<String, Arc<dyn RegionStore>> = HashMap::new();
        stores.insert("stockholm".to_string(), sto.clone());
        stores.insert("gothenburg".to_string(), got.clone());
        stores.insert("global".to_string(), glo.clone());
        (stores, sto, got, glo)
    }

    fn cache_with(stores: HashMap<String, Arc<dyn RegionStore>>) -> GeoCache {
        GeoCache::new(config(), registry(), stores).unwrap()
    }

    async fn seed(store: &MemoryStore, region_id: &str, key: &str, value: &Value) {
        let bytes = envelope::encode(&Envelope::wrap(value.clone()), 1024).unwrap();
        store
            .set(&namespaced_key(region_id, key), bytes, None)
            .await
            .unwrap();
    }

    async fn read_envelope(store: &MemoryStore, region_id: &str, key: &str) -> Option<Envelope> {
        let bytes = store.get(&namespaced_key(region_id, key)).await.unwrap()?;
        Some(envelope::decode(&bytes).unwrap())
    }

    #[test]
    fn test_construction_validates_wiring() {
        let (stores, ..) = memory_stores();
        assert!(GeoCache::new(config(), registry(), stores).is_ok());

        let bad_primary = GeoCacheConfig {
            primary_region: "mars".to_string(),
            ..config()
        };
        let (stores, ..) = memory_stores();
        assert!(matches!(
            GeoCache::new(bad_primary, registry(), stores),
            Err(CacheError::UnknownRegion(_))
        ));

        let mut partial: HashMap<String, Arc<dyn RegionStore>> = HashMap::new();
        partial.insert("stockholm".to_string(), Arc::new(MemoryStore::new()));
        assert!(matches!(
            GeoCache::new(config(), registry(), partial),
            Err(CacheError::MissingStore(_))
        ));
    }

    #[tokio::test]
    async fn test_set_get_roundtrip_deep_equality() {
        let (stores, ..) = memory_stores();
        let cache = cache_with(stores);

        let values = vec![
            json!({"nested": {"objects": [1, 2, {"deep": true}]}, "n": 3.5}),
            json!([1, "two", null, [3.0]]),
            json!(42),
            json!("short string"),
            // Exceeds the compression threshold
            json!("y".repeat(5000)),
        ];

        for (i, value) in values.iter().enumerate() {
            let key = format!("key-{i}");
            cache.set(&key, value, &SetOptions::default()).await.unwrap();
            let got = cache.get(&key, &GetOptions::default()).await.unwrap();
            assert_eq!(got.as_ref(), Some(value));
        }

        let stats = cache.stats();
        assert_eq!(stats.hits, values.len() as u64);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_get_missing_counts_miss() {
        let (stores, ..) = memory_stores();
        let cache = cache_with(stores);
        let got = cache.get("absent", &GetOptions::default()).await.unwrap();
        assert!(got.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_failing_primary_falls_back_and_warms() {
        let (_, _, got_store, glo) = memory_stores();
        let mut stores: HashMap<String, Arc<dyn RegionStore>> = HashMap::new();
        stores.insert("stockholm".to_string(), Arc::new(FailStore));
        stores.insert("gothenburg".to_string(), got_store.clone());
        stores.insert("global".to_string(), glo);
        let cache = cache_with(stores);

        seed(&got_store, "gothenburg", "session", &json!({"user": 7})).await;

        let got = cache.get("session", &GetOptions::default()).await.unwrap();
        assert_eq!(got, Some(json!({"user": 7})));

        // The fallback hit scheduled a warm-the-primary job targeting the
        // failed region
        assert_eq!(cache.pending_replication(), 1);

        // The error streak (threshold 1) flipped the primary unhealthy
        assert_eq!(
            cache.health().state("stockholm"),
            Some(HealthState::Unhealthy)
        );
    }

    #[tokio::test]
    async fn test_unhealthy_primary_excluded_from_selection() {
        let (stores, _, got_store, _) = memory_stores();
        let cache = cache_with(stores);

        cache
            .health()
            .set_unhealthy("stockholm", &StoreError::Timeout);

        seed(&got_store, "gothenburg", "k", &json!("from-b")).await;
        let got = cache.get("k", &GetOptions::default()).await.unwrap();
        assert_eq!(got, Some(json!("from-b")));

        // Gothenburg was resolved as primary directly, so no warm job
        assert_eq!(cache.pending_replication(), 0);
    }

    #[tokio::test]
    async fn test_optimal_region_rules() {
        let (stores, ..) = memory_stores();
        let cache = cache_with(stores);

        // Explicit healthy preference wins
        let client = cache.optimal_region(None, Some("gothenburg"));
        assert_eq!(client.region.id, "gothenburg");

        // Unhealthy preference falls through to priority order
        cache
            .health()
            .set_unhealthy("gothenburg", &StoreError::Timeout);
        let client = cache.optimal_region(None, Some("gothenburg"));
        assert_eq!(client.region.id, "stockholm");
        cache.health().set_healthy("gothenburg", Duration::from_millis(1));

        // Geo-hint picks closest healthy with no radius gate: a point far
        // outside every coverage circle still resolves to the closest
        // region, not the fallback
        let client = cache.optimal_region(Some(&GeoPoint::new(62.0, 20.0)), None);
        assert_eq!(client.region.id, "stockholm");

        let client = cache.optimal_region(Some(&GeoPoint::new(57.7, 11.9)), None);
        assert_eq!(client.region.id, "gothenburg");

        // No hint at all: priority order
        let client = cache.optimal_region(None, None);
        assert_eq!(client.region.id, "stockholm");

        // Nothing healthy: designated primary serves degraded
        for id in ["stockholm", "gothenburg", "global"] {
            cache.health().set_unhealthy(id, &StoreError::Timeout);
        }
        let client = cache.optimal_region(Some(&GeoPoint::new(57.7, 11.9)), None);
        assert_eq!(client.region.id, "stockholm");
    }

    #[tokio::test]
    async fn test_eventual_set_replicates_on_drain() {
        let (stores, sto, got_store, glo) = memory_stores();
        let cache = cache_with(stores);

        cache
            .set("k", &json!({"v": 1}), &SetOptions::default())
            .await
            .unwrap();

        // Acknowledged after the primary write only
        assert!(read_envelope(&sto, "stockholm", "k").await.is_some());
        assert!(read_envelope(&got_store, "gothenburg", "k").await.is_none());
        assert_eq!(cache.pending_replication(), 1);

        cache.flush_replication().await;
        assert_eq!(cache.pending_replication(), 0);
        assert_eq!(
            read_envelope(&got_store, "gothenburg", "k").await.unwrap().v,
            json!({"v": 1})
        );
        assert_eq!(
            read_envelope(&glo, "global", "k").await.unwrap().v,
            json!({"v": 1})
        );
    }

    #[tokio::test]
    async fn test_immediate_set_fans_out_synchronously() {
        let (stores, sto, got_store, glo) = memory_stores();
        let cache = cache_with(stores);

        cache
            .set(
                "k",
                &json!("everywhere"),
                &SetOptions {
                    consistency: Consistency::Immediate,
                    ..SetOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(cache.pending_replication(), 0);
        for (store, region) in [(&sto, "stockholm"), (&got_store, "gothenburg"), (&glo, "global")] {
            assert_eq!(
                read_envelope(store, region, "k").await.unwrap().v,
                json!("everywhere")
            );
        }
    }

    #[tokio::test]
    async fn test_immediate_set_survives_partial_replication_failure() {
        let (_, sto, _, glo) = memory_stores();
        let mut stores: HashMap<String, Arc<dyn RegionStore>> = HashMap::new();
        stores.insert("stockholm".to_string(), sto.clone());
        stores.insert("gothenburg".to_string(), Arc::new(FailStore));
        stores.insert("global".to_string(), glo.clone());
        let cache = cache_with(stores);

        // Partial replication failure warns but does not fail the write
        cache
            .set(
                "k",
                &json!(1),
                &SetOptions {
                    consistency: Consistency::Immediate,
                    ..SetOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(read_envelope(&sto, "stockholm", "k").await.is_some());
        assert!(read_envelope(&glo, "global", "k").await.is_some());
        assert_eq!(
            cache.health().state("gothenburg"),
            Some(HealthState::Unhealthy)
        );
    }

    #[tokio::test]
    async fn test_primary_write_failure_is_hard_error() {
        let (_, _, got_store, glo) = memory_stores();
        let mut stores: HashMap<String, Arc<dyn RegionStore>> = HashMap::new();
        stores.insert("stockholm".to_string(), Arc::new(FailStore));
        stores.insert("gothenburg".to_string(), got_store);
        stores.insert("global".to_string(), glo);
        let cache = cache_with(stores);

        let err = cache
            .set("k", &json!(1), &SetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::PrimaryWriteFailed { region, .. } if region == "stockholm"
        ));
        // Nothing was queued for a write that never had a replica
        assert_eq!(cache.pending_replication(), 0);
    }

    #[tokio::test]
    async fn test_delete_immediate_reports_removal() {
        let (stores, ..) = memory_stores();
        let cache = cache_with(stores);

        cache
            .set(
                "k",
                &json!(1),
                &SetOptions {
                    consistency: Consistency::Immediate,
                    ..SetOptions::default()
                },
            )
            .await
            .unwrap();

        let removed = cache
            .delete(
                "k",
                &DeleteOptions {
                    consistency: Consistency::Immediate,
                },
            )
            .await
            .unwrap();
        assert!(removed);

        let removed_again = cache
            .delete(
                "k",
                &DeleteOptions {
                    consistency: Consistency::Immediate,
                },
            )
            .await
            .unwrap();
        assert!(!removed_again);
        assert!(cache.get("k", &GetOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_eventual_always_reports_success() {
        let (stores, sto, ..) = memory_stores();
        let cache = cache_with(stores);

        cache.set("k", &json!(1), &SetOptions::default()).await.unwrap();
        let removed = cache.delete("k", &DeleteOptions::default()).await.unwrap();
        assert!(removed);

        // Fire-and-forget tasks land shortly after
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(read_envelope(&sto, "stockholm", "k").await.is_none());
    }

    #[tokio::test]
    async fn test_mget_merges_across_regions() {
        let (stores, sto, got_store, _) = memory_stores();
        let cache = cache_with(stores);

        seed(&sto, "stockholm", "k1", &json!("primary")).await;
        seed(&got_store, "gothenburg", "k2", &json!("fallback")).await;

        let got = cache
            .mget(
                &["k1".to_string(), "k2".to_string(), "k3".to_string()],
                &GetOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(got.len(), 2);
        assert_eq!(got["k1"], json!("primary"));
        assert_eq!(got["k2"], json!("fallback"));
        assert!(!got.contains_key("k3"));

        // k2 was found off-primary: one warm job; k3 missed everywhere
        assert_eq!(cache.pending_replication(), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_get_throw_on_error_when_all_regions_fail() {
        let mut stores: HashMap<String, Arc<dyn RegionStore>> = HashMap::new();
        stores.insert("stockholm".to_string(), Arc::new(FailStore));
        stores.insert("gothenburg".to_string(), Arc::new(FailStore));
        stores.insert("global".to_string(), Arc::new(FailStore));
        let cache = cache_with(stores);

        let err = cache
            .get(
                "k",
                &GetOptions {
                    throw_on_error: true,
                    ..GetOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::AllRegionsFailed(_)));

        // Without the opt-in the same situation degrades to empty
        let got = cache.get("k", &GetOptions::default()).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_clean_miss_beats_throw_on_error() {
        let (_, _, got_store, _) = memory_stores();
        let mut stores: HashMap<String, Arc<dyn RegionStore>> = HashMap::new();
        stores.insert("stockholm".to_string(), Arc::new(FailStore));
        stores.insert("gothenburg".to_string(), got_store);
        stores.insert("global".to_string(), Arc::new(FailStore));
        let cache = cache_with(stores);

        // Gothenburg answers with a clean miss, so the overall call reports
        // empty even under throw_on_error
        let got = cache
            .get(
                "k",
                &GetOptions {
                    throw_on_error: true,
                    ..GetOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_lww_converges_per_region_independently() {
        let (stores, sto, got_store, glo) = memory_stores();
        let cache = cache_with(stores);

        // Two writers land on different primaries for the same key
        cache
            .set(
                "k",
                &json!("from-stockholm"),
                &SetOptions {
                    preferred_region: Some("stockholm".to_string()),
                    ..SetOptions::default()
                },
            )
            .await
            .unwrap();
        cache
            .set(
                "k",
                &json!("from-gothenburg"),
                &SetOptions {
                    preferred_region: Some("gothenburg".to_string()),
                    ..SetOptions::default()
                },
            )
            .await
            .unwrap();

        cache.flush_replication().await;

        // Each region keeps the last write it observed; no cross-region
        // ordering is asserted
        let sto_env = read_envelope(&sto, "stockholm", "k").await.unwrap();
        let got_env = read_envelope(&got_store, "gothenburg", "k").await.unwrap();
        let glo_env = read_envelope(&glo, "global", "k").await.unwrap();

        assert_eq!(sto_env.v, json!("from-gothenburg"));
        assert_eq!(got_env.v, json!("from-stockholm"));
        assert_eq!(glo_env.v, json!("from-gothenburg"));
        // Write timestamps travel with the envelope for LWW diagnostics
        assert!(got_env.at <= sto_env.at);
    }

    #[tokio::test]
    async fn test_replication_retries_then_drops() {
        let (_, sto, _, glo) = memory_stores();
        let mut stores: HashMap<String, Arc<dyn RegionStore>> = HashMap::new();
        stores.insert("stockholm".to_string(), sto);
        stores.insert("gothenburg".to_string(), Arc::new(FailStore));
        stores.insert("global".to_string(), glo);

        let mut cfg = config();
        cfg.max_replication_retries = 2;
        // Keep gothenburg looking healthy so the drain keeps targeting it
        cfg.error_threshold = 100;
        let cache = GeoCache::new(cfg, registry(), stores).unwrap();

        cache.set("k", &json!(1), &SetOptions::default()).await.unwrap();
        assert_eq!(cache.pending_replication(), 1);

        // First drain: global succeeds, gothenburg fails and re-enqueues
        cache.flush_replication().await;
        assert_eq!(cache.pending_replication(), 1);

        // Second drain: retry cap reached, job dropped silently
        cache.flush_replication().await;
        assert_eq!(cache.pending_replication(), 0);
        assert_eq!(cache.stats().replication_dropped, 1);
    }

    #[tokio::test]
    async fn test_background_loops_start_and_shutdown() {
        let (_, sto, got_store, glo) = memory_stores();
        let mut stores: HashMap<String, Arc<dyn RegionStore>> = HashMap::new();
        stores.insert("stockholm".to_string(), sto.clone());
        stores.insert("gothenburg".to_string(), Arc::new(FailStore));
        stores.insert("global".to_string(), glo);
        let _ = got_store;

        let mut cfg = config();
        cfg.health_check_interval = Duration::from_millis(20);
        cfg.replication_interval = Duration::from_millis(20);
        let cache = GeoCache::new(cfg, registry(), stores).unwrap();

        cache.start();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The ping loop has found the broken region
        assert_eq!(
            cache.health().state("gothenburg"),
            Some(HealthState::Unhealthy)
        );
        assert_eq!(cache.health().state("stockholm"), Some(HealthState::Healthy));

        // A queued write drains in the background against healthy regions
        cache.set("k", &json!(1), &SetOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.pending_replication(), 0);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let (stores, ..) = memory_stores();
        let cache = cache_with(stores);

        cache.set("k", &json!(1), &SetOptions::default()).await.unwrap();
        cache.get("k", &GetOptions::default()).await.unwrap();
        cache.get("missing", &GetOptions::default()).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.regions.len(), 3);
        assert!(stats.regions.iter().all(|r| r.state == HealthState::Healthy));

        // Serializable for monitoring collaborators
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"hit_rate\""));
    }
}
