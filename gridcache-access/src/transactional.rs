//! Transactional access.
//!
//! Writes made inside an active [`Transaction`](crate::session::Transaction)
//! are staged in it and reach the region only when it commits; a rollback
//! discards them. The transaction sees its own staged writes. Without an
//! active transaction writes go straight to the region.

use async_trait::async_trait;
use gridcache_core::{AccessType, CacheKey, CacheResult, CacheValue, ClusterTime, SoftLock, Version};
use gridcache_storage::RegionCache;
use std::sync::Arc;

use crate::delegate::{absorb, holds_value, read_value, written, AccessDelegate};
use crate::session::{SessionContext, StagedRead, StagedWrite};

#[derive(Debug)]
pub struct TransactionalAccess {
    region: Arc<RegionCache>,
}

impl TransactionalAccess {
    pub fn new(region: Arc<RegionCache>) -> Self {
        Self { region }
    }

    /// Stage `write` in the session's transaction, or apply it now.
    async fn write(&self, session: &SessionContext, write: StagedWrite) -> bool {
        if let Some(tx) = session.transaction() {
            if tx.stage(self.region.clone(), write.clone()) {
                return true;
            }
        }
        match write {
            StagedWrite::Put {
                key,
                value,
                version,
            } => {
                let ts = self.region.next_timestamp();
                let result = self.region.put(key, value, ts, version).await;
                written(&self.region, "update", result)
            }
            StagedWrite::Insert {
                key,
                value,
                version,
            } => {
                let result = self.region.insert(key, value, version).await;
                written(&self.region, "insert", result)
            }
            StagedWrite::Remove { key } => {
                let result = self.region.remove(&key, Some(session.id())).await;
                absorb(&self.region, "remove", result.map(|_| true), false)
            }
            StagedWrite::Clear => {
                let result = self.region.evict_all().await;
                absorb(&self.region, "remove_all", result.map(|_| true), false)
            }
        }
    }
}

#[async_trait]
impl AccessDelegate for TransactionalAccess {
    fn access_type(&self) -> AccessType {
        AccessType::Transactional
    }

    fn region(&self) -> &Arc<RegionCache> {
        &self.region
    }

    async fn get(
        &self,
        session: &SessionContext,
        key: &CacheKey,
        tx_timestamp: ClusterTime,
    ) -> Option<CacheValue> {
        if let Some(tx) = session.transaction() {
            match tx.staged_read(self.region.name(), key) {
                Some(StagedRead::Value(value)) => return Some(value),
                Some(StagedRead::Removed) => return None,
                None => {}
            }
        }
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

    async fn insert(
        &self,
        session: &SessionContext,
        key: &CacheKey,
        value: &CacheValue,
        version: Option<&Version>,
    ) -> CacheResult<bool> {
        let write = StagedWrite::Insert {
            key: key.clone(),
            value: value.clone(),
            version: version.cloned(),
        };
        Ok(self.write(session, write).await)
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
        session: &SessionContext,
        key: &CacheKey,
        value: &CacheValue,
        version: Option<&Version>,
    ) -> CacheResult<bool> {
        let write = StagedWrite::Put {
            key: key.clone(),
            value: value.clone(),
            version: version.cloned(),
        };
        Ok(self.write(session, write).await)
    }

    async fn after_update(
        &self,
        _session: &SessionContext,
        _key: CacheKey,
        _value: CacheValue,
        _version: Option<Version>,
        _lock: Option<&SoftLock>,
    ) -> CacheResult<bool> {
        Ok(false)
    }

    async fn remove(&self, session: &SessionContext, key: &CacheKey) -> CacheResult<()> {
        self.write(session, StagedWrite::Remove { key: key.clone() })
            .await;
        Ok(())
    }

    async fn remove_all(&self, session: &SessionContext) -> CacheResult<()> {
        self.write(session, StagedWrite::Clear).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Transaction;
    use gridcache_core::{
        new_id, CacheDataDescription, GridCacheConfig, ManualTimestamper, RegionKind,
    };
    use gridcache_storage::InMemoryCluster;
    use serde_json::json;

    fn access() -> (Arc<ManualTimestamper>, TransactionalAccess) {
        let clock = ManualTimestamper::shared(1_000);
        let region = RegionCache::open(
            "app.Ledger",
            RegionKind::Entity,
            CacheDataDescription::mutable(),
            InMemoryCluster::new().join().as_ref(),
            clock.clone(),
            &GridCacheConfig::new(),
        );
        (clock, TransactionalAccess::new(region))
    }

    #[tokio::test]
    async fn test_staged_writes_visible_only_to_own_transaction() {
        let (clock, access) = access();
        let tx = Transaction::begin(new_id(), clock.clone());
        let writer = SessionContext::new(new_id(), 0).with_transaction(tx.clone());
        let reader = SessionContext::open(clock.as_ref());
        let key = CacheKey::entity("Ledger", 1);

        assert!(access.insert(&writer, &key, &json!(10), None).await.unwrap());
        assert_eq!(access.get(&writer, &key, writer.tx_timestamp()).await, Some(json!(10)));
        assert_eq!(access.get(&reader, &key, i64::MAX).await, None);

        tx.commit().await;
        assert_eq!(access.get(&reader, &key, i64::MAX).await, Some(json!(10)));
    }

    #[tokio::test]
    async fn test_rollback_leaves_cache_untouched() {
        let (clock, access) = access();
        let key = CacheKey::entity("Ledger", 1);
        let plain = SessionContext::open(clock.as_ref());
        access.insert(&plain, &key, &json!(1), None).await.unwrap();

        let tx = Transaction::begin(new_id(), clock.clone());
        let session = SessionContext::new(new_id(), 0).with_transaction(tx.clone());
        access.update(&session, &key, &json!(2), None).await.unwrap();
        access.remove(&session, &key).await.unwrap();
        assert_eq!(access.get(&session, &key, i64::MAX).await, None);

        assert_eq!(tx.rollback(), 2);
        assert_eq!(access.get(&plain, &key, i64::MAX).await, Some(json!(1)));
    }
}
