//! Region model and registry

use crate::error::{RegistryError, RegistryResult};
use crate::geo::GeoPoint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named service endpoint exposed by a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// REST API endpoint
    Api,
    /// Dashboard endpoint
    Dashboard,
    /// Voice/streaming endpoint
    Voice,
}

/// A geographically anchored deployment unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    /// Region identifier, e.g. "stockholm"
    pub id: String,
    /// Display name
    pub name: String,
    /// Anchor coordinate
    pub location: GeoPoint,
    /// Coverage radius in meters; a routing candidate only within this distance
    pub coverage_radius_m: f64,
    /// Priority, lower = preferred
    pub priority: u32,
    /// Named service endpoints
    pub endpoints: HashMap<EndpointKind, String>,
    /// Datacenter identifier for diagnostics
    pub datacenter: String,
    /// Catch-all region used when no coverage radius contains a point
    #[serde(default)]
    pub fallback: bool,
}

impl Region {
    /// Endpoint address for the given kind, if configured
    pub fn endpoint(&self, kind: EndpointKind) -> Option<&str> {
        self.endpoints.get(&kind).map(String::as_str)
    }

    /// Whether the point lies within this region's coverage radius
    pub fn covers(&self, point: &GeoPoint) -> bool {
        point.distance_m(&self.location) <= self.coverage_radius_m
    }
}

/// Immutable table of known regions
///
/// Built once at startup and shared by reference; there is no runtime API to
/// add or remove regions.
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    /// Regions ordered by priority ascending
    regions: Vec<Region>,
    /// Index into `regions` by id
    by_id: HashMap<String, usize>,
    /// Index of the fallback region
    fallback_idx: usize,
}

impl RegionRegistry {
    /// Build a registry, validating the region set
    pub fn new(mut regions: Vec<Region>) -> RegistryResult<Self> {
        if regions.is_empty() {
            return Err(RegistryError::Empty);
        }

        regions.sort_by_key(|r| r.priority);

        let mut by_id = HashMap::with_capacity(regions.len());
        let mut fallback_idx = None;

        for (idx, region) in regions.iter().enumerate() {
            if by_id.insert(region.id.clone(), idx).is_some() {
                return Err(RegistryError::DuplicateRegion(region.id.clone()));
            }
            if region.fallback {
                if let Some(prev) = fallback_idx {
                    let prev_id: &Region = &regions[prev];
                    return Err(RegistryError::MultipleFallbacks(
                        prev_id.id.clone(),
                        region.id.clone(),
                    ));
                }
                fallback_idx = Some(idx);
            }
        }

        let fallback_idx = fallback_idx.ok_or(RegistryError::NoFallback)?;

        Ok(Self {
            regions,
            by_id,
            fallback_idx,
        })
    }

    /// Look up a region by id
    pub fn lookup(&self, id: &str) -> Option<&Region> {
        self.by_id.get(id).map(|&idx| &self.regions[idx])
    }

    /// All regions ordered by priority ascending
    pub fn all(&self) -> &[Region] {
        &self.regions
    }

    /// The catch-all fallback region
    pub fn fallback(&self) -> &Region {
        &self.regions[self.fallback_idx]
    }

    /// Regions with bounded coverage, ordered by priority
    pub fn non_fallback(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().filter(|r| !r.fallback)
    }

    /// Number of regions including the fallback
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the registry is empty (never true after construction)
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
