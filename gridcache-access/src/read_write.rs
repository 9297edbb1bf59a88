//! Read-write access with soft locks.
//!
//! Before the ORM updates or deletes a row it locks the key, replacing the
//! cached value with a lock marker every member can see. Reads of a locked
//! key miss and loads cannot overwrite the marker. After commit the lock
//! holder writes the new state through its token, or releases the marker,
//! which keeps rejecting loads from transactions that began before the
//! release. Locks are never waited on; a holder that disappears is cut off
//! when the marker expires.

use async_trait::async_trait;
use gridcache_core::{
    AccessType, CacheKey, CacheLookup, CacheResult, CacheValue, ClusterTime, SoftLock, Version,
};
use gridcache_storage::RegionCache;
use std::sync::Arc;
use tracing::debug;

use crate::delegate::{absorb, holds_value, read_value, written, AccessDelegate};
use crate::session::SessionContext;

#[derive(Debug)]
pub struct ReadWriteAccess {
    region: Arc<RegionCache>,
}

impl ReadWriteAccess {
    pub fn new(region: Arc<RegionCache>) -> Self {
        Self { region }
    }

    /// Drop whatever is cached when no token protects the write.
    async fn discard(&self, session: &SessionContext, key: &CacheKey, operation: &str) {
        let result = self.region.remove(key, Some(session.id())).await;
        absorb(&self.region, operation, result, false);
    }
}

#[async_trait]
impl AccessDelegate for ReadWriteAccess {
    fn access_type(&self) -> AccessType {
        AccessType::ReadWrite
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
        minimal_put_override: bool,
    ) -> bool {
        if minimal_put_override && holds_value(&self.region, &key).await {
            return false;
        }
        let result = self.region.put(key, value, tx_timestamp, version).await;
        written(&self.region, "put_from_load", result)
    }

    async fn lock_item(
        &self,
        session: &SessionContext,
        key: &CacheKey,
        version: Option<Version>,
    ) -> CacheResult<Option<SoftLock>> {
        let result = self
            .region
            .try_lock(key, session.id(), version)
            .await
            .map(Some);
        Ok(absorb(&self.region, "lock_item", result, None))
    }

    async fn unlock_item(
        &self,
        session: &SessionContext,
        key: &CacheKey,
        lock: Option<&SoftLock>,
    ) -> CacheResult<()> {
        match lock {
            Some(lock) => {
                let result = self.region.unlock(key, lock).await;
                if !absorb(&self.region, "unlock_item", result, true) {
                    debug!(
                        region = self.region.name(),
                        key = %key,
                        lock_id = %lock.lock_id,
                        "Lock was taken over before unlock"
                    );
                }
            }
            None => self.discard(session, key, "unlock_item").await,
        }
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
        Ok(false)
    }

    async fn after_update(
        &self,
        session: &SessionContext,
        key: CacheKey,
        value: CacheValue,
        version: Option<Version>,
        lock: Option<&SoftLock>,
    ) -> CacheResult<bool> {
        match lock {
            Some(lock) => {
                let result = self.region.update(&key, value, version, lock).await;
                Ok(written(&self.region, "after_update", result))
            }
            None => {
                self.discard(session, &key, "after_update").await;
                Ok(false)
            }
        }
    }

    /// A locked key is left to its lock holder's unlock; anything else is
    /// dropped.
    async fn remove(&self, session: &SessionContext, key: &CacheKey) -> CacheResult<()> {
        let lookup = absorb(
            &self.region,
            "remove",
            self.region.get(key).await,
            CacheLookup::Miss,
        );
        if let Some(entry) = lookup.entry() {
            if entry.is_locked() {
                return Ok(());
            }
        }
        self.discard(session, key, "remove").await;
        Ok(())
    }

    async fn remove_all(&self, _session: &SessionContext) -> CacheResult<()> {
        self.evict_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcache_core::{
        new_id, CacheDataDescription, CacheEntry, GridCacheConfig, ManualTimestamper,
        NaturalVersionComparator, RegionKind, Timestamper,
    };
    use gridcache_storage::InMemoryCluster;
    use serde_json::json;
    use std::time::Duration;

    fn access() -> (Arc<ManualTimestamper>, ReadWriteAccess) {
        let clock = ManualTimestamper::shared(1_000);
        let region = RegionCache::open(
            "app.Order",
            RegionKind::Entity,
            CacheDataDescription::versioned().with_comparator(Arc::new(NaturalVersionComparator)),
            InMemoryCluster::new().join().as_ref(),
            clock.clone(),
            &GridCacheConfig::new().with_lock_timeout(Duration::from_millis(500)),
        );
        (clock, ReadWriteAccess::new(region))
    }

    #[tokio::test]
    async fn test_update_cycle_writes_new_version() {
        let (clock, access) = access();
        let session = SessionContext::open(clock.as_ref());
        let key = CacheKey::entity("Order", 7);
        access
            .put_from_load(&session, key.clone(), json!("v1"), 1_100, Some(Version::Number(1)), false)
            .await;

        let lock = access
            .lock_item(&session, &key, Some(Version::Number(1)))
            .await
            .unwrap();
        assert!(lock.is_some());
        assert_eq!(access.get(&session, &key, i64::MAX).await, None);

        let cached = access
            .after_update(&session, key.clone(), json!("v2"), Some(Version::Number(2)), lock.as_ref())
            .await
            .unwrap();
        assert!(cached);
        assert_eq!(access.get(&session, &key, i64::MAX).await, Some(json!("v2")));
    }

    #[tokio::test]
    async fn test_taken_over_lock_cannot_write() {
        let (clock, access) = access();
        let first = SessionContext::new(new_id(), clock.next_timestamp());
        let key = CacheKey::entity("Order", 7);

        let stale = access.lock_item(&first, &key, None).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let second = SessionContext::new(new_id(), clock.next_timestamp());
        let fresh = access.lock_item(&second, &key, None).await.unwrap();
        assert_ne!(
            stale.as_ref().map(|l| l.lock_id),
            fresh.as_ref().map(|l| l.lock_id)
        );

        let cached = access
            .after_update(&first, key.clone(), json!("stale"), None, stale.as_ref())
            .await
            .unwrap();
        assert!(!cached);
        access.unlock_item(&first, &key, stale.as_ref()).await.unwrap();
        assert_eq!(access.get(&second, &key, i64::MAX).await, None);

        assert!(access
            .after_update(&second, key.clone(), json!("fresh"), None, fresh.as_ref())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_remove_keeps_lock_marker() {
        let (clock, access) = access();
        let session = SessionContext::open(clock.as_ref());
        let key = CacheKey::entity("Order", 7);

        let lock = access.lock_item(&session, &key, None).await.unwrap();
        access.remove(&session, &key).await.unwrap();
        assert!(access.region().get(&key).await.unwrap().entry().is_some());

        access.unlock_item(&session, &key, lock.as_ref()).await.unwrap();
        let loaded_before = session.tx_timestamp();
        assert!(
            !access
                .put_from_load(&session, key.clone(), json!("old"), loaded_before, None, false)
                .await
        );
    }

    #[tokio::test]
    async fn test_overlapping_updates_never_write_through() {
        let (clock, access) = access();
        let key = CacheKey::entity("Order", 7);
        let first = SessionContext::new(new_id(), clock.next_timestamp());
        let second = SessionContext::new(new_id(), clock.next_timestamp());

        let first_lock = access.lock_item(&first, &key, None).await.unwrap();
        let second_lock = access.lock_item(&second, &key, None).await.unwrap();

        let first_wrote = access
            .after_update(&first, key.clone(), json!("t1"), None, first_lock.as_ref())
            .await
            .unwrap();
        let second_wrote = access
            .after_update(&second, key.clone(), json!("t2"), None, second_lock.as_ref())
            .await
            .unwrap();
        assert!(!first_wrote);
        assert!(!second_wrote);

        let reader = SessionContext::new(new_id(), clock.next_timestamp());
        assert_eq!(access.get(&reader, &key, reader.tx_timestamp()).await, None);
        match access.region().get(&key).await.unwrap().into_entry() {
            Some(CacheEntry::Locked(marker)) => assert!(marker.is_released()),
            other => panic!("expected released marker, got {:?}", other),
        }

        // The next load from the database caches the committed row.
        assert!(
            access
                .put_from_load(&reader, key.clone(), json!("db"), reader.tx_timestamp(), None, false)
                .await
        );
        assert_eq!(access.get(&reader, &key, i64::MAX).await, Some(json!("db")));
    }
}
