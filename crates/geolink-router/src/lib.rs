//! GeoLink Location Router
//!
//! Maps geographic points to the closest covering region, seals
//! time-bounded location tokens into scannable codes, and validates
//! presented tokens against freshness and proximity windows.
//!
//! # Components
//!
//! - Region selection: deterministic closest-covering-region rule
//! - Location tokens: AES-256-GCM sealed payloads embedded in scan URLs
//! - Scannable codes: QR rendering with a bounded render cache
//! - Regional health: advisory endpoint probing for failover ordering

#![warn(missing_docs)]

pub mod health;
pub mod router;
pub mod scancode;
pub mod selection;
pub mod token;

pub use health::{
    EndpointProbe, RegionHealthSummary, RegionProbeStatus, RegionalHealthReport, ServiceStatus,
};
pub use router::{
    LocationEntry, LocationRouter, LocationRouting, RouterConfig, RoutingRules, TokenValidation,
};
pub use scancode::{LocationCode, RenderCache, RenderCacheConfig};
pub use selection::{select_region, FailoverTarget, RouteDecision};
pub use token::{TokenPayload, TokenSealer};

use thiserror::Error;

/// Location router errors
#[derive(Error, Debug)]
pub enum RouterError {
    /// Token could not be decoded or authenticated
    #[error("invalid or corrupted location token")]
    InvalidToken,

    /// Token is older than the freshness window
    #[error("location token expired: age {age_secs}s exceeds freshness window")]
    TokenExpired {
        /// Token age in seconds at validation time
        age_secs: i64,
    },

    /// Presented point is too far from the token's embedded location
    #[error("observed point is {distance_m:.0}m from token location (limit {limit_m:.0}m)")]
    TooFarFromLocation {
        /// Computed great-circle distance in meters
        distance_m: f64,
        /// Configured proximity limit in meters
        limit_m: f64,
    },

    /// Encryption key material missing or malformed
    #[error("token key error: {0}")]
    MissingKey(String),

    /// Cryptographic operation failed
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Scannable code rendering failed
    #[error("render failure: {0}")]
    Render(String),

    /// Region has no endpoint of the requested kind
    #[error("region {region} has no {kind:?} endpoint")]
    MissingEndpoint {
        /// Region id
        region: String,
        /// Endpoint kind requested
        kind: geolink_common::EndpointKind,
    },

    /// Region registry error
    #[error(transparent)]
    Registry(#[from] geolink_common::RegistryError),
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;
