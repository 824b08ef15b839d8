//! The location router service
//!
//! Ties the region registry, token sealer, render cache and advisory health
//! snapshot together behind the four routing operations: generate a location
//! code, validate a presented code, route a request, and export routing
//! rules for a business's full location set.

use crate::health::{probe_region, RegionProbeStatus, RegionalHealthReport, ServiceStatus};
use crate::scancode::{compose_scan_url, render_svg, LocationCode, RenderCache, RenderCacheConfig};
use crate::selection::{estimate_latency_ms, select_region, FailoverTarget, RouteDecision};
use crate::token::{TokenPayload, TokenSealer};
use crate::{RouterError, RouterResult};
use chrono::Utc;
use geolink_common::{EndpointKind, GeoPoint, RegionRegistry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Router configuration, supplied once at construction
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Host the scan URL points at
    pub scan_host: String,
    /// Token freshness window
    pub token_ttl: Duration,
    /// Maximum accepted distance between observed and embedded point
    pub proximity_limit_m: f64,
    /// Render cache tuning
    pub render_cache: RenderCacheConfig,
    /// Per-endpoint probe timeout for regional health checks
    pub probe_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            scan_host: "scan.geolink.example.com".to_string(),
            token_ttl: Duration::from_secs(7 * 24 * 3600),
            proximity_limit_m: 500.0,
            render_cache: RenderCacheConfig::default(),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// One business location in a routing-rules request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationEntry {
    /// Location identifier
    pub location_id: String,
    /// Location coordinate
    pub point: GeoPoint,
}

/// Routing for one location inside a rules document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRouting {
    /// Location identifier
    pub location_id: String,
    /// Resolved region id
    pub region_id: String,
    /// API endpoint of the resolved region, if configured
    pub api_endpoint: Option<String>,
    /// Coarse latency estimate in milliseconds
    pub estimated_latency_ms: f64,
}

/// Declarative routing-rule document for a business's location set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRules {
    /// Business identifier
    pub business_id: String,
    /// Generation time
    pub generated_at: chrono::DateTime<Utc>,
    /// Locations grouped by resolved region
    pub regions: BTreeMap<String, Vec<LocationRouting>>,
}

/// Result of validating a presented location token
#[derive(Debug, Clone, Serialize)]
pub struct TokenValidation {
    /// Decrypted payload
    pub payload: TokenPayload,
    /// Token age in seconds at validation time
    pub age_secs: i64,
    /// Distance between observed and embedded point, when an observation was supplied
    pub distance_m: Option<f64>,
    /// Soft signal: the optimal region for the payload's point has changed
    /// since generation; used for cache warnings, never a failure
    pub region_changed: bool,
    /// Fresh routing decision for the payload's point
    pub route: RouteDecision,
}

/// The location router
pub struct LocationRouter {
    registry: Arc<RegionRegistry>,
    sealer: TokenSealer,
    render_cache: RenderCache,
    config: RouterConfig,
    /// Advisory status snapshot from the last regional health check
    health: RwLock<HashMap<String, RegionProbeStatus>>,
}

impl LocationRouter {
    /// Create a router over a shared registry
    pub fn new(config: RouterConfig, registry: Arc<RegionRegistry>, sealer: TokenSealer) -> Self {
        let render_cache = RenderCache::new(config.render_cache);
        Self {
            registry,
            sealer,
            render_cache,
            config,
            health: RwLock::new(HashMap::new()),
        }
    }

    /// Generate (or return a cached) scannable location code
    ///
    /// Any sealing or rendering failure aborts the whole call; nothing
    /// partial is ever cached.
    pub fn generate_location_code(
        &self,
        business_id: &str,
        location_id: &str,
        point: GeoPoint,
    ) -> RouterResult<Arc<LocationCode>> {
        if let Some(cached) = self.render_cache.get(business_id, location_id) {
            debug!(business_id, location_id, "returning cached location code");
            return Ok(cached);
        }

        let region = select_region(&self.registry, &point);
        let api = region
            .endpoint(EndpointKind::Api)
            .ok_or_else(|| RouterError::MissingEndpoint {
                region: region.id.clone(),
                kind: EndpointKind::Api,
            })?;
        let ws = region
            .endpoint(EndpointKind::Voice)
            .ok_or_else(|| RouterError::MissingEndpoint {
                region: region.id.clone(),
                kind: EndpointKind::Voice,
            })?;

        let created_at = Utc::now();
        let payload = TokenPayload::new(
            business_id,
            location_id,
            region,
            point,
            api,
            ws,
            created_at.timestamp_millis(),
        );

        let token = self.sealer.seal(&payload)?;
        let url = compose_scan_url(&self.config.scan_host, &token, &region.id);
        let svg = render_svg(&url)?;

        let code = Arc::new(LocationCode {
            url,
            svg,
            payload,
            region_id: region.id.clone(),
            created_at,
            token_expires_at: created_at + chrono::Duration::from_std(self.config.token_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(7)),
        });

        self.render_cache.insert(business_id, location_id, code.clone());
        info!(business_id, location_id, region = %code.region_id, "generated location code");
        Ok(code)
    }

    /// Validate a presented token against freshness and proximity windows
    ///
    /// Expiry is inclusive: a token aged exactly the freshness window still
    /// validates; strictly older is rejected.
    pub fn validate_location_code(
        &self,
        token: &str,
        observed: Option<GeoPoint>,
    ) -> RouterResult<TokenValidation> {
        let payload = self.sealer.open(token)?;

        let now_ms = Utc::now().timestamp_millis();
        let age_ms = now_ms - payload.t;
        if age_ms > self.config.token_ttl.as_millis() as i64 {
            return Err(RouterError::TokenExpired {
                age_secs: age_ms / 1000,
            });
        }

        let embedded: GeoPoint = payload.geo.into();
        let distance_m = match observed {
            Some(observed) => {
                let distance = observed.distance_m(&embedded);
                if distance > self.config.proximity_limit_m {
                    return Err(RouterError::TooFarFromLocation {
                        distance_m: distance,
                        limit_m: self.config.proximity_limit_m,
                    });
                }
                Some(distance)
            }
            None => None,
        };

        let current = select_region(&self.registry, &embedded);
        let region_changed = current.id != payload.r;
        if region_changed {
            warn!(
                token_region = %payload.r,
                current_region = %current.id,
                "optimal region changed since token generation"
            );
        }

        let route = self.route(&embedded, EndpointKind::Api)?;

        Ok(TokenValidation {
            payload,
            age_secs: age_ms / 1000,
            distance_m,
            region_changed,
            route,
        })
    }

    /// Route a request from a point to a named endpoint kind
    pub fn route(&self, point: &GeoPoint, kind: EndpointKind) -> RouterResult<RouteDecision> {
        let region = select_region(&self.registry, point);
        let endpoint = region
            .endpoint(kind)
            .ok_or_else(|| RouterError::MissingEndpoint {
                region: region.id.clone(),
                kind,
            })?
            .to_string();

        let health = self.health.read();
        let failover = self
            .registry
            .all()
            .iter()
            .filter(|r| r.id != region.id)
            .filter(|r| health.get(&r.id) != Some(&RegionProbeStatus::Unhealthy))
            .map(|r| FailoverTarget {
                region_id: r.id.clone(),
                endpoint: r.endpoint(kind).map(str::to_string),
                priority: r.priority,
            })
            .collect();

        Ok(RouteDecision {
            region_id: region.id.clone(),
            endpoint,
            endpoint_kind: kind,
            estimated_latency_ms: estimate_latency_ms(point, region),
            priority: region.priority,
            failover,
        })
    }

    /// Compute per-location routing for a batch and group by resolved region
    pub fn generate_routing_rules(
        &self,
        business_id: &str,
        locations: &[LocationEntry],
    ) -> RoutingRules {
        let mut regions: BTreeMap<String, Vec<LocationRouting>> = BTreeMap::new();

        for entry in locations {
            let region = select_region(&self.registry, &entry.point);
            regions
                .entry(region.id.clone())
                .or_default()
                .push(LocationRouting {
                    location_id: entry.location_id.clone(),
                    region_id: region.id.clone(),
                    api_endpoint: region.endpoint(EndpointKind::Api).map(str::to_string),
                    estimated_latency_ms: estimate_latency_ms(&entry.point, region),
                });
        }

        RoutingRules {
            business_id: business_id.to_string(),
            generated_at: Utc::now(),
            regions,
        }
    }

    /// Probe every non-fallback region's endpoints and refresh the advisory
    /// snapshot used for failover ordering
    pub async fn check_regional_health(&self) -> RegionalHealthReport {
        let mut regions = Vec::new();
        for region in self.registry.non_fallback() {
            regions.push(probe_region(region, self.config.probe_timeout).await);
        }

        {
            let mut health = self.health.write();
            for summary in &regions {
                health.insert(summary.region_id.clone(), summary.status);
            }
        }

        let overall = if regions
            .iter()
            .all(|r| r.status == RegionProbeStatus::Healthy)
        {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Degraded
        };

        RegionalHealthReport {
            overall,
            regions,
            checked_at: Utc::now(),
        }
    }

    /// Shared registry handle
    pub fn registry(&self) -> &Arc<RegionRegistry> {
        &self.registry
    }

    #[cfg(test)]
    pub(crate) fn record_health(&self, region_id: &str, status: RegionProbeStatus) {
        self.health.write().insert(region_id.to_string(), status);
    }
}
