//! Read-only access: data that never changes once written.
//!
//! The first state cached for a key stays until evicted. Updates are caller
//! errors; deletes and evictions are allowed.

use async_trait::async_trait;
use gridcache_core::{AccessType, CacheKey, CacheResult, CacheValue, ClusterTime, SoftLock, Version};
use gridcache_storage::RegionCache;
use std::sync::Arc;

use crate::delegate::{absorb, read_only_violation, read_value, written, AccessDelegate};
use crate::session::SessionContext;

#[derive(Debug)]
pub struct ReadOnlyAccess {
    region: Arc<RegionCache>,
}

impl ReadOnlyAccess {
    pub fn new(region: Arc<RegionCache>) -> Self {
        Self { region }
    }
}

#[async_trait]
impl AccessDelegate for ReadOnlyAccess {
    fn access_type(&self) -> AccessType {
        AccessType::ReadOnly
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

    async fn put_from_load(
        &self,
        _session: &SessionContext,
        key: CacheKey,
        value: CacheValue,
        tx_timestamp: ClusterTime,
        version: Option<Version>,
        _minimal_put_override: bool,
    ) -> bool {
        let result = self
            .region
            .put_if_absent(key, value, tx_timestamp, version)
            .await;
        written(&self.region, "put_from_load", result)
    }

    async fn lock_item(
        &self,
        _session: &SessionContext,
        _key: &CacheKey,
        _version: Option<Version>,
    ) -> CacheResult<Option<SoftLock>> {
        Err(read_only_violation(&self.region, "lock_item"))
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
        key: CacheKey,
        value: CacheValue,
        version: Option<Version>,
    ) -> CacheResult<bool> {
        let result = self.region.insert(key, value, version).await;
        Ok(written(&self.region, "after_insert", result))
    }

    async fn update(
        &self,
        _session: &SessionContext,
        _key: &CacheKey,
        _value: &CacheValue,
        _version: Option<&Version>,
    ) -> CacheResult<bool> {
        Err(read_only_violation(&self.region, "update"))
    }

    async fn after_update(
        &self,
        _session: &SessionContext,
        _key: CacheKey,
        _value: CacheValue,
        _version: Option<Version>,
        _lock: Option<&SoftLock>,
    ) -> CacheResult<bool> {
        Err(read_only_violation(&self.region, "after_update"))
    }

    async fn remove(&self, session: &SessionContext, key: &CacheKey) -> CacheResult<()> {
        let result = self.region.remove(key, Some(session.id())).await;
        absorb(&self.region, "remove", result, false);
        Ok(())
    }

    async fn remove_all(&self, _session: &SessionContext) -> CacheResult<()> {
        self.evict_all().await
    }
}
