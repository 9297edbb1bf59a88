//! gridcache Storage - Regions over a Distributed Grid
//!
//! Region caches sit on a cluster-wide map and an invalidation topic, with a
//! member-local near-cache in front:
//!
//! - [`RegionCache`]: entity, collection, natural-id and query-result data
//! - [`TimestampsRegionCache`]: per-table last-update marks for the query cache
//! - [`InMemoryCluster`]: in-process grid used by tests and embedded setups
//! - [`cleanup_task`]: background TTL expiry and size trimming

pub mod cleanup;
pub mod grid;
pub mod invalidation;
pub mod memory;
pub mod near_cache;
pub mod region_cache;
pub mod timestamps;

pub use cleanup::{cleanup_task, Cleanable, CleanupMetrics, CleanupRegistry, CleanupSnapshot};
pub use grid::{DistributedMap, Grid, GridValue, Topic, TopicSubscription};
pub use invalidation::{
    InvalidationEvent, InvalidationListener, InvalidationTarget, ListenerMetrics,
};
pub use memory::{GridMember, InMemoryCluster};
pub use near_cache::{CleanupReport, LocalInvalidation, NearCache, NearCacheStats};
pub use region_cache::RegionCache;
pub use timestamps::{TimestampEntry, TimestampsRegionCache};
