//! Error types for the region registry

use thiserror::Error;

/// Registry construction errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No regions supplied
    #[error("region set is empty")]
    Empty,

    /// No fallback region configured
    #[error("no fallback region configured")]
    NoFallback,

    /// More than one fallback region configured
    #[error("multiple fallback regions configured: {0} and {1}")]
    MultipleFallbacks(String, String),

    /// Duplicate region identifier
    #[error("duplicate region id: {0}")]
    DuplicateRegion(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
