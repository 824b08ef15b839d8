//! Replication jobs, the bounded pending queue, and the drain loop
//!
//! Jobs live only in memory; a crash loses unflushed jobs, which the
//! eventual-consistency contract accepts. The drain loop takes the whole
//! queue each tick, executes every job against healthy targets, re-enqueues
//! failures up to the retry cap, then drops them (logged, never surfaced).

use crate::cache::RegionClient;
use crate::health::HealthMonitor;
use crate::store::namespaced_key;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where a replication job should land
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationTarget {
    /// A single region
    Region(String),
    /// Every other healthy region
    AllExcept(String),
}

/// One pending replication
#[derive(Debug, Clone)]
pub struct ReplicationJob {
    /// Job id for log correlation
    pub id: Uuid,
    /// Logical key (un-namespaced)
    pub key: String,
    /// Envelope bytes exactly as stored at the origin
    pub payload: Bytes,
    /// TTL to apply at the target
    pub ttl: Option<Duration>,
    /// Target region or fan-out directive
    pub target: ReplicationTarget,
    /// When the job entered the queue
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempts so far
    pub attempts: u32,
}

impl ReplicationJob {
    /// Build a fresh job
    pub fn new(key: &str, payload: Bytes, ttl: Option<Duration>, target: ReplicationTarget) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.to_string(),
            payload,
            ttl,
            target,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Bounded in-memory queue of pending replication jobs
pub struct ReplicationQueue {
    jobs: Mutex<VecDeque<ReplicationJob>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl ReplicationQueue {
    /// Create a queue bounded at `capacity` jobs
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a job; a full queue drops the incoming job and reports false
    pub fn push(&self, job: ReplicationJob) -> bool {
        let mut jobs = self.jobs.lock();
        if jobs.len() >= self.capacity {
            drop(jobs);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(key = %job.key, "replication queue full, dropping job");
            return false;
        }
        jobs.push_back(job);
        true
    }

    /// Take every pending job
    pub fn drain(&self) -> Vec<ReplicationJob> {
        self.jobs.lock().drain(..).collect()
    }

    /// Pending job count
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Jobs dropped on overflow or retry exhaustion
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Execute every pending job once, re-enqueueing failures below the retry cap
pub(crate) async fn drain_once(
    queue: &ReplicationQueue,
    clients: &HashMap<String, Arc<RegionClient>>,
    health: &HealthMonitor,
    op_timeout: Duration,
    max_retries: u32,
) {
    let jobs = queue.drain();
    if jobs.is_empty() {
        return;
    }
    debug!(pending = jobs.len(), "draining replication queue");

    for job in jobs {
        let targets: Vec<&Arc<RegionClient>> = match &job.target {
            ReplicationTarget::Region(id) => clients
                .get(id)
                .filter(|c| health.is_healthy(&c.region.id))
                .into_iter()
                .collect(),
            ReplicationTarget::AllExcept(excluded) => clients
                .values()
                .filter(|c| c.region.id != *excluded && health.is_healthy(&c.region.id))
                .collect(),
        };

        for client in targets {
            let key = namespaced_key(&client.region.id, &job.key);
            let write = client.store.set(&key, job.payload.clone(), job.ttl);
            let outcome = match tokio::time::timeout(op_timeout, write).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(crate::store::StoreError::Timeout),
            };

            if let Err(error) = outcome {
                let attempts = job.attempts + 1;
                if attempts < max_retries {
                    warn!(
                        job = %job.id,
                        region = %client.region.id,
                        %error,
                        attempts,
                        "replication failed, re-enqueueing"
                    );
                    queue.push(ReplicationJob {
                        target: ReplicationTarget::Region(client.region.id.clone()),
                        attempts,
                        ..job.clone()
                    });
                } else {
                    warn!(
                        job = %job.id,
                        region = %client.region.id,
                        %error,
                        "replication retries exhausted, dropping job"
                    );
                    queue.record_dropped();
                }
            }
        }
    }
}

/// Background replication-drain loop; runs until shutdown is signalled
pub(crate) async fn run_replication_loop(
    queue: Arc<ReplicationQueue>,
    clients: Arc<HashMap<String, Arc<RegionClient>>>,
    health: Arc<HealthMonitor>,
    interval: Duration,
    op_timeout: Duration,
    max_retries: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                drain_once(&queue, &clients, &health, op_timeout, max_retries).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Final best-effort drain so graceful shutdown flushes
                    // whatever is already queued
                    drain_once(&queue, &clients, &health, op_timeout, max_retries).await;
                    debug!("replication loop shutting down");
                    return;
                }
            }
        }
    }
}
