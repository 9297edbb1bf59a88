//! Entity versions and the data description supplied by the ORM.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Optimistic-locking version of a cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    /// Integral version column.
    Number(i64),
    /// Timestamp version column, epoch millis.
    Timestamp(i64),
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Number(n) => write!(f, "v{}", n),
            Version::Timestamp(ts) => write!(f, "t{}", ts),
        }
    }
}

/// Orders two versions of the same entity.
pub trait VersionComparator: Send + Sync + fmt::Debug {
    fn compare(&self, stored: &Version, incoming: &Version) -> Ordering;
}

/// Compares numbers with numbers and timestamps with timestamps.
///
/// Mixed kinds never happen for one mapped entity; they compare as equal so
/// the incoming write is treated as not newer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalVersionComparator;

impl VersionComparator for NaturalVersionComparator {
    fn compare(&self, stored: &Version, incoming: &Version) -> Ordering {
        match (stored, incoming) {
            (Version::Number(a), Version::Number(b)) => a.cmp(b),
            (Version::Timestamp(a), Version::Timestamp(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Describes the data cached in a region.
#[derive(Debug, Clone)]
pub struct CacheDataDescription {
    mutable: bool,
    comparator: Option<Arc<dyn VersionComparator>>,
}

impl CacheDataDescription {
    /// Mutable, unversioned data.
    pub fn mutable() -> Self {
        Self {
            mutable: true,
            comparator: None,
        }
    }

    /// Immutable data (read-only regions).
    pub fn immutable() -> Self {
        Self {
            mutable: false,
            comparator: None,
        }
    }

    /// Mutable data versioned with the natural ordering.
    pub fn versioned() -> Self {
        Self::mutable().with_comparator(Arc::new(NaturalVersionComparator))
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn VersionComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn is_versioned(&self) -> bool {
        self.comparator.is_some()
    }

    pub fn comparator(&self) -> Option<&Arc<dyn VersionComparator>> {
        self.comparator.as_ref()
    }
}

impl Default for CacheDataDescription {
    fn default() -> Self {
        Self::mutable()
    }
}
