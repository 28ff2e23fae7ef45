use thiserror::Error;

/// Errors that can reach callers of the cache.
///
/// Remote-tier problems never show up here: they are absorbed by the
/// remote client and degrade the cache to local-only operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Missing or invalid namespace, key part or configuration value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A value could not be encoded for storage.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
