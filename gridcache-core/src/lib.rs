//! gridcache Core - Region Types
//!
//! Data types shared by every gridcache crate: keys, versions, stored
//! entries, clocks, configuration and the error taxonomy. No grid access
//! happens here.

use uuid::Uuid;

pub mod clock;
pub mod config;
pub mod entry;
pub mod enums;
pub mod error;
pub mod key;
pub mod memo;
pub mod version;

pub use clock::{ManualTimestamper, SystemTimestamper, Timestamper};
pub use config::{GridCacheConfig, RegionConfig};
pub use entry::{CacheEntry, CacheLookup, LockMarker, SoftLock, VersionedValue, WriteOutcome};
pub use enums::{AccessType, RegionKind};
pub use error::{AccessError, BackendError, CacheResult, ConfigError, GridCacheError};
pub use key::{CacheKey, CacheValue};
pub use memo::Memoized;
pub use version::{CacheDataDescription, NaturalVersionComparator, Version, VersionComparator};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Cluster member identifier.
pub type MemberId = Uuid;

/// ORM session identifier; owner of soft locks.
pub type SessionId = Uuid;

/// Transaction identifier.
pub type TransactionId = Uuid;

/// Soft-lock marker identifier.
pub type LockId = Uuid;

/// Cluster time in epoch milliseconds.
pub type ClusterTime = i64;

/// Generate a new UUIDv7 identifier (timestamp-sortable).
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}
