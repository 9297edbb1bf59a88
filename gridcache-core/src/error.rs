//! Error types for gridcache operations

use crate::{AccessType, RegionKind};
use std::time::Duration;
use thiserror::Error;

/// Failures of the distributed grid (map or topic).
///
/// These are transient. The access layer absorbs them and degrades to
/// cache-miss behavior; they never reach the ORM as fatal errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Grid unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Grid operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl BackendError {
    pub fn unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Caller misuse of an access strategy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("Region {region} is read-only, {operation} is not allowed")]
    UnsupportedMutation { region: String, operation: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Access type {access_type} is not supported for {kind:?} region {region}")]
    UnsupportedAccessType {
        region: String,
        kind: RegionKind,
        access_type: AccessType,
    },

    #[error("Unknown access type: {value}")]
    UnknownAccessType { value: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Region factory has not been started")]
    NotStarted,
}

/// Master error type for all gridcache errors.
#[derive(Debug, Clone, Error)]
pub enum GridCacheError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl GridCacheError {
    /// True for failures the access layer treats as a cache miss.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Result type alias for gridcache operations.
pub type CacheResult<T> = Result<T, GridCacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display_timeout() {
        let err = BackendError::timeout("map.get", Duration::from_millis(250));
        let msg = format!("{}", err);
        assert!(msg.contains("map.get"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_access_error_display_unsupported_mutation() {
        let err = AccessError::UnsupportedMutation {
            region: "app.Country".to_string(),
            operation: "after_update".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("read-only"));
        assert!(msg.contains("app.Country"));
        assert!(msg.contains("after_update"));
    }

    #[test]
    fn test_config_error_display_unsupported_access_type() {
        let err = ConfigError::UnsupportedAccessType {
            region: "default-query-results-region".to_string(),
            kind: RegionKind::QueryResults,
            access_type: AccessType::ReadWrite,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("read-write"));
        assert!(msg.contains("QueryResults"));
    }

    #[test]
    fn test_grid_cache_error_from_variants() {
        let backend = GridCacheError::from(BackendError::unavailable("map.put", "partition lost"));
        assert!(matches!(backend, GridCacheError::Backend(_)));
        assert!(backend.is_transient());

        let access = GridCacheError::from(AccessError::UnsupportedMutation {
            region: "r".to_string(),
            operation: "lock_item".to_string(),
        });
        assert!(matches!(access, GridCacheError::Access(_)));
        assert!(!access.is_transient());

        let config = GridCacheError::from(ConfigError::NotStarted);
        assert!(matches!(config, GridCacheError::Config(_)));
    }
}
