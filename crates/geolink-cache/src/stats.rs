//! Cache statistics
//!
//! Aggregate hit/miss/error counters plus per-region request counts, error
//! counts, and a rolling latency average. Counters are lock-free atomics
//! updated by whichever task touched the region; regions are independent,
//! so no shared mutex is involved.

use crate::health::HealthState;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Aggregate hit/miss/error counters
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl CacheCounters {
    /// Record a hit
    #[inline]
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss
    #[inline]
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error
    #[inline]
    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current (hits, misses, errors)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// Per-region running counters with an EWMA latency
#[derive(Debug, Default)]
pub struct RegionCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU32,
    /// EWMA latency in microseconds; 0 = no sample yet
    latency_ewma_us: AtomicU64,
}

impl RegionCounters {
    /// Record a successful round-trip, folding the latency into the EWMA
    /// and resetting the consecutive-error streak
    pub fn record_success(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);

        let sample = latency.as_micros() as u64;
        let prev = self.latency_ewma_us.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            // alpha = 1/8
            prev - prev / 8 + sample / 8
        };
        self.latency_ewma_us.store(next, Ordering::Relaxed);
    }

    /// Record a failed round-trip; returns the new consecutive-error streak
    pub fn record_error(&self) -> u32 {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Total requests observed
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Total errors observed
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Rolling average latency in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        self.latency_ewma_us.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Point-in-time view of one region's counters and health
#[derive(Debug, Clone, Serialize)]
pub struct RegionStatsSnapshot {
    /// Region id
    pub region_id: String,
    /// Requests issued to this region
    pub requests: u64,
    /// Errors observed from this region
    pub errors: u64,
    /// Rolling average latency in milliseconds
    pub avg_latency_ms: f64,
    /// Current health state
    pub state: HealthState,
    /// Last error message, if any
    pub last_error: Option<String>,
}

/// Structured stats for external monitoring collaborators
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Total hits across all regions
    pub hits: u64,
    /// Total misses (no region yielded a value)
    pub misses: u64,
    /// Total errors across all regions
    pub errors: u64,
    /// hits / (hits + misses), 0.0 when idle
    pub hit_rate: f64,
    /// Replication jobs dropped on queue overflow or retry exhaustion
    pub replication_dropped: u64,
    /// Pending replication jobs
    pub replication_pending: usize,
    /// Per-region detail
    pub regions: Vec<RegionStatsSnapshot>,
}
