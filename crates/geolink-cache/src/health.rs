//! Region health tracking and the background health-check loop
//!
//! Health is the sole gate for whether a region participates in selection,
//! fallback, or replication. The loop pings every region store on a fixed
//! interval; inline error streaks on the read/write paths can flip a region
//! unhealthy between ticks. `Reconnecting` is only ever entered through the
//! transport integration hook; this layer never drives that transition.

use crate::cache::RegionClient;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Region participation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Eligible for selection, fallback, and replication
    Healthy,
    /// Ineligible until the next successful probe
    Unhealthy,
    /// Transport layer is re-establishing the connection; ineligible
    Reconnecting,
}

/// Per-region health record
#[derive(Debug, Clone, Serialize)]
pub struct RegionHealth {
    /// Current state
    pub state: HealthState,
    /// When the record was last updated
    pub last_check: DateTime<Utc>,
    /// Last observed probe latency
    pub latency_ms: Option<u64>,
    /// Last error observed, if any
    pub last_error: Option<String>,
}

impl RegionHealth {
    fn healthy(latency: Duration) -> Self {
        Self {
            state: HealthState::Healthy,
            last_check: Utc::now(),
            latency_ms: Some(latency.as_millis() as u64),
            last_error: None,
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            state: HealthState::Unhealthy,
            last_check: Utc::now(),
            latency_ms: None,
            last_error: Some(error),
        }
    }
}

/// Shared health map, updated by the check loop and inline failure streaks
pub struct HealthMonitor {
    regions: DashMap<String, RegionHealth>,
}

impl HealthMonitor {
    /// Create a monitor with every region initially healthy, so traffic can
    /// flow before the first probe tick
    pub fn new(region_ids: impl IntoIterator<Item = String>) -> Self {
        let regions = DashMap::new();
        for id in region_ids {
            regions.insert(
                id,
                RegionHealth {
                    state: HealthState::Healthy,
                    last_check: Utc::now(),
                    latency_ms: None,
                    last_error: None,
                },
            );
        }
        Self { regions }
    }

    /// Whether a region may participate in selection and replication
    pub fn is_healthy(&self, region_id: &str) -> bool {
        self.regions
            .get(region_id)
            .map(|h| h.state == HealthState::Healthy)
            .unwrap_or(false)
    }

    /// Mark a region healthy after a successful probe
    pub fn set_healthy(&self, region_id: &str, latency: Duration) {
        self.regions
            .insert(region_id.to_string(), RegionHealth::healthy(latency));
    }

    /// Mark a region unhealthy, recording the error
    pub fn set_unhealthy(&self, region_id: &str, error: &StoreError) {
        warn!(region = region_id, %error, "region marked unhealthy");
        self.regions
            .insert(region_id.to_string(), RegionHealth::unhealthy(error.to_string()));
    }

    /// Transport integration hook: the client library reported it is
    /// re-establishing the connection. Never called by this layer itself.
    pub fn mark_reconnecting(&self, region_id: &str) {
        if let Some(mut entry) = self.regions.get_mut(region_id) {
            entry.state = HealthState::Reconnecting;
            entry.last_check = Utc::now();
        }
    }

    /// Current state for one region
    pub fn state(&self, region_id: &str) -> Option<HealthState> {
        self.regions.get(region_id).map(|h| h.state)
    }

    /// Point-in-time copy of every region's record
    pub fn snapshot(&self) -> HashMap<String, RegionHealth> {
        self.regions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Ping one region and update its record
pub(crate) async fn check_region(
    client: &RegionClient,
    health: &HealthMonitor,
    timeout: Duration,
) {
    let start = Instant::now();
    let outcome = match tokio::time::timeout(timeout, client.store.ping()).await {
        Ok(Ok(())) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(StoreError::Timeout),
    };

    match outcome {
        Ok(latency) => {
            debug!(region = %client.region.id, latency_ms = latency.as_millis() as u64, "ping ok");
            health.set_healthy(&client.region.id, latency);
        }
        Err(error) => health.set_unhealthy(&client.region.id, &error),
    }
}

/// Background health-check loop; runs until shutdown is signalled
pub(crate) async fn run_health_loop(
    clients: Arc<HashMap<String, Arc<RegionClient>>>,
    health: Arc<HealthMonitor>,
    interval: Duration,
    op_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for client in clients.values() {
                    check_region(client, &health, op_timeout).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("health loop shutting down");
                    return;
                }
            }
        }
    }
}
