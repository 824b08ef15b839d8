//! Advisory regional health probing
//!
//! Probes every named endpoint of each non-fallback region with a cheap TCP
//! connect and aggregates per-region and overall status. This is telemetry:
//! it orders the failover list in routing decisions but never removes a
//! region from selection. Selection gating on health is the cache layer's
//! job, and the two deliberately use different signals.

use chrono::{DateTime, Utc};
use geolink_common::{EndpointKind, Region};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Probe outcome for one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointProbe {
    /// Endpoint kind probed
    pub kind: EndpointKind,
    /// Endpoint address
    pub address: String,
    /// Whether the probe succeeded
    pub healthy: bool,
    /// Observed connect latency in milliseconds
    pub latency_ms: Option<u64>,
    /// Failure detail, if any
    pub error: Option<String>,
}

/// Aggregate status of one region's endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionProbeStatus {
    /// Every endpoint probe succeeded
    Healthy,
    /// Some endpoint probes failed
    Degraded,
    /// Every endpoint probe failed
    Unhealthy,
}

/// Per-region health summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionHealthSummary {
    /// Region id
    pub region_id: String,
    /// Aggregate status
    pub status: RegionProbeStatus,
    /// Individual endpoint probes
    pub probes: Vec<EndpointProbe>,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

/// Overall service status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// All regions healthy
    Healthy,
    /// At least one region non-healthy
    Degraded,
}

/// The full advisory health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionalHealthReport {
    /// Overall service status
    pub overall: ServiceStatus,
    /// Per-region summaries
    pub regions: Vec<RegionHealthSummary>,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

/// Probe all named endpoints of a region
pub async fn probe_region(region: &Region, timeout: Duration) -> RegionHealthSummary {
    let mut probes = Vec::with_capacity(region.endpoints.len());

    for (&kind, address) in &region.endpoints {
        probes.push(probe_endpoint(kind, address, timeout).await);
    }

    let passed = probes.iter().filter(|p| p.healthy).count();
    let status = if passed == probes.len() && !probes.is_empty() {
        RegionProbeStatus::Healthy
    } else if passed > 0 {
        RegionProbeStatus::Degraded
    } else {
        RegionProbeStatus::Unhealthy
    };

    if status != RegionProbeStatus::Healthy {
        warn!(region = %region.id, ?status, "region endpoint probes degraded");
    }

    RegionHealthSummary {
        region_id: region.id.clone(),
        status,
        probes,
        checked_at: Utc::now(),
    }
}

async fn probe_endpoint(kind: EndpointKind, address: &str, timeout: Duration) -> EndpointProbe {
    let start = std::time::Instant::now();

    let result = match host_and_port(address) {
        Some((host, port)) => {
            match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
                Ok(Ok(_)) => Ok(start.elapsed().as_millis() as u64),
                Ok(Err(e)) => Err(format!("connect failed: {e}")),
                Err(_) => Err("connect timeout".to_string()),
            }
        }
        None => Err(format!("unparsable endpoint address: {address}")),
    };

    match result {
        Ok(latency_ms) => {
            debug!(?kind, address, latency_ms, "endpoint probe ok");
            EndpointProbe {
                kind,
                address: address.to_string(),
                healthy: true,
                latency_ms: Some(latency_ms),
                error: None,
            }
        }
        Err(error) => EndpointProbe {
            kind,
            address: address.to_string(),
            healthy: false,
            latency_ms: None,
            error: Some(error),
        },
    }
}

/// Extract host and port from an endpoint address like
/// `https://api.example.com` or `wss://voice.example.com:8443/path`
fn host_and_port(address: &str) -> Option<(String, u16)> {
    let (scheme, rest) = address.split_once("://")?;
    let default_port = match scheme {
        "https" | "wss" => 443,
        "http" | "ws" => 80,
        _ => return None,
    };

    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((authority.to_string(), default_port)),
    }
}
