//! Enumerations shared by regions and access strategies

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Consistency contract a data region must honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessType {
    /// Data is never updated once cached
    ReadOnly,
    /// Updates evict, readers may briefly miss
    NonstrictReadWrite,
    /// Soft locks guard in-flight writes
    ReadWrite,
    /// Writes are bound to the enclosing transaction
    Transactional,
}

impl AccessType {
    pub const ALL: [AccessType; 4] = [
        AccessType::ReadOnly,
        AccessType::NonstrictReadWrite,
        AccessType::ReadWrite,
        AccessType::Transactional,
    ];

    /// Name used in ORM configuration.
    pub fn as_config_str(&self) -> &'static str {
        match self {
            AccessType::ReadOnly => "read-only",
            AccessType::NonstrictReadWrite => "nonstrict-read-write",
            AccessType::ReadWrite => "read-write",
            AccessType::Transactional => "transactional",
        }
    }

    /// Parse from configuration, accepting both `read-write` and `READ_WRITE` spellings.
    pub fn from_config_str(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "read-only" => Ok(AccessType::ReadOnly),
            "nonstrict-read-write" => Ok(AccessType::NonstrictReadWrite),
            "read-write" => Ok(AccessType::ReadWrite),
            "transactional" => Ok(AccessType::Transactional),
            _ => Err(ConfigError::UnknownAccessType {
                value: s.to_string(),
            }),
        }
    }

    /// Whether delegates of this type may ever write updated state.
    pub fn allows_updates(&self) -> bool {
        !matches!(self, AccessType::ReadOnly)
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_config_str())
    }
}

impl FromStr for AccessType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_config_str(s)
    }
}

/// What a region caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    Entity,
    Collection,
    NaturalId,
    QueryResults,
    Timestamps,
}

impl RegionKind {
    /// Data regions hold entity state and accept access strategies.
    pub fn is_data_region(&self) -> bool {
        matches!(
            self,
            RegionKind::Entity | RegionKind::Collection | RegionKind::NaturalId
        )
    }

    /// Check that `access_type` can be served by a region of this kind.
    pub fn supports(&self, access_type: AccessType) -> bool {
        match self {
            RegionKind::Entity | RegionKind::Collection => true,
            RegionKind::NaturalId => access_type != AccessType::Transactional,
            RegionKind::QueryResults | RegionKind::Timestamps => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_type_roundtrip() {
        for access_type in AccessType::ALL {
            let parsed = AccessType::from_config_str(access_type.as_config_str()).unwrap();
            assert_eq!(access_type, parsed);
        }
    }

    #[test]
    fn test_access_type_accepts_enum_spelling() {
        assert_eq!(
            "NONSTRICT_READ_WRITE".parse::<AccessType>().unwrap(),
            AccessType::NonstrictReadWrite
        );
        assert!(matches!(
            "eventual".parse::<AccessType>(),
            Err(ConfigError::UnknownAccessType { .. })
        ));
    }

    #[test]
    fn test_region_kind_support_matrix() {
        assert!(RegionKind::Entity.supports(AccessType::Transactional));
        assert!(RegionKind::Collection.supports(AccessType::ReadOnly));
        assert!(!RegionKind::NaturalId.supports(AccessType::Transactional));
        assert!(!RegionKind::QueryResults.supports(AccessType::ReadWrite));
        assert!(!RegionKind::Timestamps.is_data_region());
    }
}
