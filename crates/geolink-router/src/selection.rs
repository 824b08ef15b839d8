//! Deterministic region selection
//!
//! The routing rule: a region is a candidate only if the query point lies
//! within its coverage radius (hard cutoff, not a soft preference); among
//! candidates the smallest distance wins; no candidate means the fallback
//! region. The cache layer deliberately uses a different rule (closest
//! healthy, no radius gate): routing honors coverage contracts, caching
//! only cares about latency.

use geolink_common::{EndpointKind, GeoPoint, Region, RegionRegistry};
use serde::{Deserialize, Serialize};

/// Base latency attributed to any regional round-trip, in milliseconds
const BASE_LATENCY_MS: f64 = 15.0;

/// Select the optimal region for a point
pub fn select_region<'a>(registry: &'a RegionRegistry, point: &GeoPoint) -> &'a Region {
    let mut best: Option<(&Region, f64)> = None;

    for region in registry.non_fallback() {
        let distance = point.distance_m(&region.location);
        if distance > region.coverage_radius_m {
            continue;
        }
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((region, distance)),
        }
    }

    best.map(|(r, _)| r).unwrap_or_else(|| registry.fallback())
}

/// Coarse latency estimate: base cost plus 1 ms per 100 km of distance
pub(crate) fn estimate_latency_ms(point: &GeoPoint, region: &Region) -> f64 {
    BASE_LATENCY_MS + point.distance_m(&region.location) / 100_000.0
}

/// A failover alternative to the chosen region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverTarget {
    /// Region id
    pub region_id: String,
    /// Endpoint address for the requested kind, if the region exposes one
    pub endpoint: Option<String>,
    /// Region priority (lower = preferred)
    pub priority: u32,
}

/// The outcome of a routing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    /// Chosen region id
    pub region_id: String,
    /// Endpoint address for the requested kind
    pub endpoint: String,
    /// Kind of endpoint resolved
    pub endpoint_kind: EndpointKind,
    /// Estimated round-trip latency in milliseconds
    pub estimated_latency_ms: f64,
    /// Chosen region's priority
    pub priority: u32,
    /// Remaining regions, health-filtered, ordered by priority
    pub failover: Vec<FailoverTarget>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

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

    fn registry() -> RegionRegistry {
        RegionRegistry::new(vec![
            region("stockholm", 59.3293, 18.0686, 150_000.0, 1, false),
            region("gothenburg", 57.7089, 11.9746, 120_000.0, 2, false),
            region("global", 59.3293, 18.0686, f64::MAX, 100, true),
        ])
        .unwrap()
    }

    #[test]
    fn test_point_inside_single_circle() {
        let registry = registry();
        // ~37 km south of the Stockholm anchor, outside Gothenburg's circle
        let point = GeoPoint::new(59.0, 18.0);
        assert_eq!(select_region(&registry, &point).id, "stockholm");
    }

    #[test]
    fn test_point_outside_every_circle_falls_back() {
        let registry = registry();
        let point = GeoPoint::new(62.0, 20.0);
        assert_eq!(select_region(&registry, &point).id, "global");
    }

    #[test]
    fn test_overlap_resolved_by_distance() {
        let registry = RegionRegistry::new(vec![
            region("near", 59.0, 18.0, 500_000.0, 2, false),
            region("far", 57.0, 12.0, 500_000.0, 1, false),
            region("global", 59.0, 18.0, f64::MAX, 100, true),
        ])
        .unwrap();

        // Inside both circles, much closer to "near"; priority must not win
        let point = GeoPoint::new(58.9, 17.9);
        assert_eq!(select_region(&registry, &point).id, "near");
    }

    #[test]
    fn test_radius_is_hard_cutoff() {
        let registry = RegionRegistry::new(vec![
            // Tiny radius: anchor is close but never a candidate
            region("tiny", 59.0, 18.0, 10.0, 1, false),
            region("wide", 57.7089, 11.9746, 1_000_000.0, 2, false),
            region("global", 59.0, 18.0, f64::MAX, 100, true),
        ])
        .unwrap();

        let point = GeoPoint::new(59.1, 18.1);
        assert_eq!(select_region(&registry, &point).id, "wide");
    }

    #[test]
    fn test_latency_estimate_grows_with_distance() {
        let registry = registry();
        let sthlm = registry.lookup("stockholm").unwrap();
        let near = estimate_latency_ms(&GeoPoint::new(59.33, 18.07), sthlm);
        let far = estimate_latency_ms(&GeoPoint::new(55.6, 13.0), sthlm);
        assert!(near < far);
        assert!(near >= BASE_LATENCY_MS);
    }
}
