//! Nonstrict read-write access.
//!
//! No soft locks. A committed update removes the cached entry instead of
//! writing the new state, so the next read reloads from the database.
//! Between the update and that removal reaching every member a reader may
//! still see the old state from its near-cache; the window is bounded by
//! invalidation delivery and, at worst, by the region's near-cache TTL.

use async_trait::async_trait;
use gridcache_core::{AccessType, CacheKey, CacheResult, CacheValue, ClusterTime, SoftLock, Version};
use gridcache_storage::RegionCache;
use std::sync::Arc;

use crate::delegate::{absorb, holds_value, read_value, written, AccessDelegate};
use crate::session::SessionContext;

#[derive(Debug)]
pub struct NonStrictReadWriteAccess {
    region: Arc<RegionCache>,
}

impl NonStrictReadWriteAccess {
    pub fn new(region: Arc<RegionCache>) -> Self {
        Self { region }
    }

    async fn drop_entry(&self, session: &SessionContext, key: &CacheKey, operation: &str) {
        let result = self.region.remove(key, Some(session.id())).await;
        absorb(&self.region, operation, result, false);
    }
}

#[async_trait]
impl AccessDelegate for NonStrictReadWriteAccess {
    fn access_type(&self) -> AccessType {
        AccessType::NonstrictReadWrite
    }

    fn region(&self) -> &Arc<RegionCache> {
        &self.region
    }

    async fn get(
        &self,
        _session: &SessionContext,
        key: &CacheKey,
        tx_timestamp: ClusterTime,
    ) -> Option<CacheValue> {
        read_value(&self.region, key, tx_timestamp).await
    }

    /// Versions are not compared; only write times decide.
    async fn put_from_load(
        &self,
        _session: &SessionContext,
        key: CacheKey,
        value: CacheValue,
        tx_timestamp: ClusterTime,
        _version: Option<Version>,
        minimal_put_override: bool,
    ) -> bool {
        if minimal_put_override && holds_value(&self.region, &key).await {
            return false;
        }
        let result = self.region.put(key, value, tx_timestamp, None).await;
        written(&self.region, "put_from_load", result)
    }

    async fn lock_item(
        &self,
        _session: &SessionContext,
        _key: &CacheKey,
        _version: Option<Version>,
    ) -> CacheResult<Option<SoftLock>> {
        Ok(None)
    }

    async fn unlock_item(
        &self,
        _session: &SessionContext,
        _key: &CacheKey,
        _lock: Option<&SoftLock>,
    ) -> CacheResult<()> {
        Ok(())
    }

    async fn after_insert(
        &self,
        _session: &SessionContext,
        _key: CacheKey,
        _value: CacheValue,
        _version: Option<Version>,
    ) -> CacheResult<bool> {
        Ok(false)
    }

    async fn update(
        &self,
        _session: &SessionContext,
        _key: &CacheKey,
        _value: &CacheValue,
        _version: Option<&Version>,
    ) -> CacheResult<bool> {
        Ok(false)
    }

    async fn after_update(
        &self,
        session: &SessionContext,
        key: CacheKey,
        _value: CacheValue,
        _version: Option<Version>,
        _lock: Option<&SoftLock>,
    ) -> CacheResult<bool> {
        self.drop_entry(session, &key, "after_update").await;
        Ok(false)
    }

    async fn remove(&self, session: &SessionContext, key: &CacheKey) -> CacheResult<()> {
        self.drop_entry(session, key, "remove").await;
        Ok(())
    }

    async fn remove_all(&self, _session: &SessionContext) -> CacheResult<()> {
        self.evict_all().await
    }
}
