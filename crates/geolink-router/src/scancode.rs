//! Scannable code rendering and the render cache
//!
//! A generated code is a QR image of the scan URL. Renders are cached per
//! business location with TTL eviction: a stale render is simply regenerated
//! on the next request, never invalidated mid-flight.

use crate::token::TokenPayload;
use crate::{RouterError, RouterResult};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use qrcode::render::svg;
use qrcode::QrCode;
use std::sync::Arc;
use std::time::Duration;

/// Compose the scan URL embedding the sealed token and a region hint
pub fn compose_scan_url(host: &str, token: &str, region_id: &str) -> String {
    format!(
        "https://{host}/scan/{token}?r={}",
        region_id.to_lowercase()
    )
}

/// Render a QR code of the URL as SVG bytes
pub fn render_svg(url: &str) -> RouterResult<String> {
    let code = QrCode::new(url.as_bytes())
        .map_err(|e| RouterError::Render(format!("QR encoding failed: {e}")))?;
    Ok(code
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .build())
}

/// A generated location code bundle
#[derive(Debug, Clone)]
pub struct LocationCode {
    /// Scan URL embedding the sealed token
    pub url: String,
    /// Rendered QR image as SVG
    pub svg: String,
    /// Raw payload that was sealed
    pub payload: TokenPayload,
    /// Region the location resolved to
    pub region_id: String,
    /// Generation time
    pub created_at: DateTime<Utc>,
    /// When the embedded token stops validating
    pub token_expires_at: DateTime<Utc>,
}

/// Render-cache tuning; both knobs are constructor parameters
#[derive(Debug, Clone, Copy)]
pub struct RenderCacheConfig {
    /// Maximum cached renders
    pub capacity: u64,
    /// Render freshness window
    pub ttl: Duration,
}

impl Default for RenderCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// TTL-evicted cache of rendered location codes, keyed by business+location
pub struct RenderCache {
    cache: Cache<String, Arc<LocationCode>>,
}

impl RenderCache {
    /// Create a cache with the given capacity and TTL
    pub fn new(config: RenderCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.capacity)
            .time_to_live(config.ttl)
            .build();
        Self { cache }
    }

    fn key(business_id: &str, location_id: &str) -> String {
        format!("{business_id}:{location_id}")
    }

    /// Fresh render for the location, if cached
    pub fn get(&self, business_id: &str, location_id: &str) -> Option<Arc<LocationCode>> {
        self.cache.get(&Self::key(business_id, location_id))
    }

    /// Store a freshly generated render
    pub fn insert(&self, business_id: &str, location_id: &str, code: Arc<LocationCode>) {
        self.cache.insert(Self::key(business_id, location_id), code);
    }

    /// Number of cached renders
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.entry_count() == 0
    }
}
