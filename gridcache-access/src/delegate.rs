//! Access strategy seam.
//!
//! The ORM drives a region through one [`AccessDelegate`] chosen when the
//! region is built. All strategies share the same [`RegionCache`]; they
//! differ only in which lifecycle hooks write to it and how.
//!
//! Grid failures never escape a delegate: reads degrade to misses, writes
//! report that nothing was cached, and a warning is logged. The only errors
//! returned are caller misuse ([`AccessError`]).

use async_trait::async_trait;
use gridcache_core::{
    AccessError, AccessType, CacheKey, CacheLookup, CacheResult, CacheValue, ClusterTime,
    GridCacheError, SoftLock, Version, WriteOutcome,
};
use gridcache_storage::RegionCache;
use std::sync::Arc;
use tracing::warn;

use crate::session::SessionContext;

#[async_trait]
pub trait AccessDelegate: Send + Sync + std::fmt::Debug {
    fn access_type(&self) -> AccessType;

    fn region(&self) -> &Arc<RegionCache>;

    /// Cached value visible to a transaction started at `tx_timestamp`.
    async fn get(
        &self,
        session: &SessionContext,
        key: &CacheKey,
        tx_timestamp: ClusterTime,
    ) -> Option<CacheValue>;

    /// Offer state just read from the database. Returns true if cached.
    ///
    /// With `minimal_put_override` an existing value is left alone without
    /// comparing versions.
    async fn put_from_load(
        &self,
        session: &SessionContext,
        key: CacheKey,
        value: CacheValue,
        tx_timestamp: ClusterTime,
        version: Option<Version>,
        minimal_put_override: bool,
    ) -> bool;

    /// Soft-lock `key` before the ORM updates or deletes it.
    async fn lock_item(
        &self,
        session: &SessionContext,
        key: &CacheKey,
        version: Option<Version>,
    ) -> CacheResult<Option<SoftLock>>;

    /// Release a lock taken by [`AccessDelegate::lock_item`].
    async fn unlock_item(
        &self,
        session: &SessionContext,
        key: &CacheKey,
        lock: Option<&SoftLock>,
    ) -> CacheResult<()>;

    /// Pre-commit hook for an inserted row.
    async fn insert(
        &self,
        _session: &SessionContext,
        _key: &CacheKey,
        _value: &CacheValue,
        _version: Option<&Version>,
    ) -> CacheResult<bool> {
        Ok(false)
    }

    /// Post-commit hook for an inserted row. Returns true if cached.
    async fn after_insert(
        &self,
        session: &SessionContext,
        key: CacheKey,
        value: CacheValue,
        version: Option<Version>,
    ) -> CacheResult<bool>;

    /// Pre-commit hook for an updated row.
    async fn update(
        &self,
        session: &SessionContext,
        key: &CacheKey,
        value: &CacheValue,
        version: Option<&Version>,
    ) -> CacheResult<bool>;

    /// Post-commit hook for an updated row. Returns true if cached.
    async fn after_update(
        &self,
        session: &SessionContext,
        key: CacheKey,
        value: CacheValue,
        version: Option<Version>,
        lock: Option<&SoftLock>,
    ) -> CacheResult<bool>;

    /// The row was deleted.
    async fn remove(&self, session: &SessionContext, key: &CacheKey) -> CacheResult<()>;

    /// Every row of the region may have changed.
    async fn remove_all(&self, session: &SessionContext) -> CacheResult<()>;

    /// Lock the whole region for a bulk operation.
    async fn lock_region(&self, _session: &SessionContext) -> CacheResult<Option<SoftLock>> {
        Ok(None)
    }

    /// End of a bulk operation; the region's contents are no longer trusted.
    async fn unlock_region(
        &self,
        session: &SessionContext,
        _lock: Option<&SoftLock>,
    ) -> CacheResult<()> {
        self.remove_all(session).await
    }

    /// Drop `key` from the cache outside any transaction.
    async fn evict(&self, key: &CacheKey) -> CacheResult<()> {
        let region = self.region();
        absorb(region, "evict", region.remove(key, None).await, false);
        Ok(())
    }

    /// Drop the whole region outside any transaction.
    async fn evict_all(&self) -> CacheResult<()> {
        let region = self.region();
        absorb(region, "evict_all", region.evict_all().await.map(|_| true), false);
        Ok(())
    }
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// Replace a grid failure with `fallback`, logging it.
pub(crate) fn absorb<T>(
    region: &RegionCache,
    operation: &str,
    result: CacheResult<T>,
    fallback: T,
) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            warn!(
                region = region.name(),
                operation = operation,
                error = %err,
                "Cache operation failed, continuing without cache"
            );
            fallback
        }
    }
}

/// Read path shared by every strategy.
pub(crate) async fn read_value(
    region: &RegionCache,
    key: &CacheKey,
    tx_timestamp: ClusterTime,
) -> Option<CacheValue> {
    absorb(region, "get", region.read(key, tx_timestamp).await, None)
}

/// True if a value (not a lock) is already cached for `key`.
pub(crate) async fn holds_value(region: &RegionCache, key: &CacheKey) -> bool {
    let lookup = absorb(region, "get", region.get(key).await, CacheLookup::Miss);
    matches!(lookup.entry(), Some(entry) if !entry.is_locked())
}

pub(crate) fn written(
    region: &RegionCache,
    operation: &str,
    result: CacheResult<WriteOutcome>,
) -> bool {
    absorb(region, operation, result.map(|o| o.is_written()), false)
}

pub(crate) fn read_only_violation(region: &RegionCache, operation: &str) -> GridCacheError {
    AccessError::UnsupportedMutation {
        region: region.name().to_string(),
        operation: operation.to_string(),
    }
    .into()
}
