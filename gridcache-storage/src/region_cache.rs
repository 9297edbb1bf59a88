//! Region cache: one named region over a distributed map.
//!
//! A region combines the cluster-wide map, the region's invalidation topic
//! and a member-local near-cache. Reads consult the near-cache first and
//! fall back to the map. Every mutation follows the same order:
//!
//! 1. compare-and-set against the map until it wins or the stored state
//!    says the write must not happen,
//! 2. publish exactly one invalidation event when the map changed,
//! 3. refresh the local near-cache, unless a remote invalidation for the
//!    key arrived since the operation started.
//!
//! Any grid failure evicts the key from the near-cache before the error is
//! returned, so a member never keeps serving state it could not confirm.

use gridcache_core::{
    BackendError, CacheDataDescription, CacheEntry, CacheKey, CacheLookup, CacheResult,
    CacheValue, ClusterTime, GridCacheConfig, GridCacheError, LockMarker, MemberId, RegionConfig,
    RegionKind, SessionId, SoftLock, Timestamper, Version, VersionedValue, WriteOutcome,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cleanup::Cleanable;
use crate::grid::{bounded, DistributedMap, Grid, Topic};
use crate::invalidation::{InvalidationEvent, InvalidationListener, InvalidationTarget};
use crate::near_cache::{CleanupReport, NearCache, NearCacheStats};

/// One data region (entity, collection, natural-id or query results).
pub struct RegionCache {
    name: String,
    kind: RegionKind,
    description: CacheDataDescription,
    member: MemberId,
    map: Arc<dyn DistributedMap<CacheEntry>>,
    topic: Arc<dyn Topic>,
    near: Arc<NearCache<CacheEntry>>,
    clock: Arc<dyn Timestamper>,
    lock_timeout: Duration,
    operation_timeout: Duration,
    listener: InvalidationListener,
}

impl std::fmt::Debug for RegionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionCache")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("member", &self.member)
            .field("near_entries", &self.near.len())
            .finish()
    }
}

impl RegionCache {
    /// Open region `name` on `grid` and start its invalidation listener.
    ///
    /// `name` is used as given for the map and the topic; qualify it first
    /// when a prefix is configured. Must be called inside a Tokio runtime.
    pub fn open(
        name: impl Into<String>,
        kind: RegionKind,
        description: CacheDataDescription,
        grid: &dyn Grid,
        clock: Arc<dyn Timestamper>,
        config: &GridCacheConfig,
    ) -> Arc<Self> {
        let name = name.into();
        let region_config: RegionConfig = config.region_config(&name);
        let near = Arc::new(NearCache::new(region_config, clock.clone()));
        let topic = grid.topic(&name);
        let listener = InvalidationListener::spawn(
            name.clone(),
            grid.member_id(),
            topic.subscribe(),
            near.clone(),
        );
        debug!(region = %name, kind = ?kind, member_id = %grid.member_id(), "Region opened");

        Arc::new(Self {
            map: grid.entry_map(&name),
            topic,
            near,
            clock,
            member: grid.member_id(),
            lock_timeout: config.lock_timeout,
            operation_timeout: config.operation_timeout,
            listener,
            description,
            kind,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn description(&self) -> &CacheDataDescription {
        &self.description
    }

    pub fn member_id(&self) -> MemberId {
        self.member
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn next_timestamp(&self) -> ClusterTime {
        self.clock.next_timestamp()
    }

    pub fn near_cache(&self) -> &Arc<NearCache<CacheEntry>> {
        &self.near
    }

    pub fn listener(&self) -> &InvalidationListener {
        &self.listener
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Current entry for `key`, from the near-cache or the grid.
    pub async fn get(&self, key: &CacheKey) -> CacheResult<CacheLookup> {
        if let Some(entry) = self.near.get(key) {
            trace!(region = %self.name, key = %key, "Near-cache hit");
            return Ok(CacheLookup::Hit(entry));
        }
        let since = self.near.reserve();
        let fetched = self
            .guarded(key, "get", async { self.call("map.get", self.map.get(key)).await })
            .await?;
        Ok(match fetched {
            Some(entry) => {
                if !self.near.put_if_fresh(key.clone(), entry.clone(), since) {
                    trace!(region = %self.name, key = %key, "Invalidated during read, not cached locally");
                }
                CacheLookup::Hit(entry)
            }
            None => CacheLookup::Miss,
        })
    }

    /// Value for `key` as seen by a transaction started at `tx_timestamp`.
    pub async fn read(
        &self,
        key: &CacheKey,
        tx_timestamp: ClusterTime,
    ) -> CacheResult<Option<CacheValue>> {
        let lookup = self.get(key).await?;
        Ok(lookup
            .entry()
            .and_then(|e| e.readable(tx_timestamp))
            .cloned())
    }

    /// Entries held locally by this member.
    pub fn size(&self) -> usize {
        self.near.len()
    }

    pub fn element_count_in_memory(&self) -> usize {
        self.near.len()
    }

    /// Entries held cluster-wide.
    pub async fn distributed_size(&self) -> CacheResult<usize> {
        let key = CacheKey::space(&self.name);
        self.guarded(&key, "size", async { self.call("map.size", self.map.size()).await })
            .await
    }

    pub fn local_keys(&self) -> Vec<CacheKey> {
        self.near.keys()
    }

    pub fn stats(&self) -> NearCacheStats {
        self.near.stats()
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Cache state loaded by a transaction started at `tx_timestamp`.
    ///
    /// The write wins only if the stored entry is replaceable by it: an
    /// older version, an older write, or a lock marker that lapsed before
    /// the transaction began.
    pub async fn put(
        &self,
        key: CacheKey,
        value: CacheValue,
        tx_timestamp: ClusterTime,
        version: Option<Version>,
    ) -> CacheResult<WriteOutcome> {
        let since = self.near.reserve();
        let comparator = self.description.comparator().cloned();
        let candidate = CacheEntry::Value(VersionedValue::new(value, version.clone(), tx_timestamp));
        let fut = async {
            loop {
                let current = self.call("map.get", self.map.get(&key)).await?;
                match current {
                    None => {
                        let existing = self
                            .call(
                                "map.put_if_absent",
                                self.map.put_if_absent(key.clone(), candidate.clone()),
                            )
                            .await?;
                        if existing.is_none() {
                            return Ok(WriteOutcome::Written);
                        }
                    }
                    Some(existing) => {
                        let replaceable = existing.is_replaceable_by(
                            tx_timestamp,
                            version.as_ref(),
                            comparator.as_deref(),
                        );
                        if !replaceable {
                            return Ok(refused(&existing));
                        }
                        if self
                            .call(
                                "map.replace",
                                self.map.replace_if_same(&key, &existing, candidate.clone()),
                            )
                            .await?
                        {
                            return Ok(WriteOutcome::Written);
                        }
                    }
                }
            }
        };
        let outcome = self.guarded(&key, "put", fut).await?;
        self.after_write(&key, outcome, &candidate, None, version, since)
            .await?;
        Ok(outcome)
    }

    /// Cache state only if nothing is stored under `key`.
    pub async fn put_if_absent(
        &self,
        key: CacheKey,
        value: CacheValue,
        timestamp: ClusterTime,
        version: Option<Version>,
    ) -> CacheResult<WriteOutcome> {
        let since = self.near.reserve();
        let candidate = CacheEntry::Value(VersionedValue::new(value, version.clone(), timestamp));
        let fut = async {
            let existing = self
                .call(
                    "map.put_if_absent",
                    self.map.put_if_absent(key.clone(), candidate.clone()),
                )
                .await?;
            Ok(match existing {
                None => WriteOutcome::Written,
                Some(existing) => refused(&existing),
            })
        };
        let outcome = self.guarded(&key, "put_if_absent", fut).await?;
        self.after_write(&key, outcome, &candidate, None, version, since)
            .await?;
        Ok(outcome)
    }

    /// Cache a freshly inserted row, stamped with a new cluster timestamp.
    pub async fn insert(
        &self,
        key: CacheKey,
        value: CacheValue,
        version: Option<Version>,
    ) -> CacheResult<WriteOutcome> {
        let timestamp = self.clock.next_timestamp();
        self.put_if_absent(key, value, timestamp, version).await
    }

    /// Remove `key` cluster-wide. Publishes an event even if nothing was
    /// stored, since other members may still hold a local copy.
    pub async fn remove(&self, key: &CacheKey, session: Option<SessionId>) -> CacheResult<bool> {
        let fut = async {
            let removed = self.call("map.remove", self.map.remove(key)).await?;
            self.publish(InvalidationTarget::Key(key.clone()), session, None)
                .await?;
            Ok(removed.is_some())
        };
        let removed = self.guarded(key, "remove", fut).await?;
        self.near.evict(key);
        Ok(removed)
    }

    /// Clear the region on every member.
    pub async fn evict_all(&self) -> CacheResult<()> {
        let key = CacheKey::space(&self.name);
        let fut = async {
            self.call("map.clear", self.map.clear()).await?;
            self.publish(InvalidationTarget::EvictAll, None, None).await
        };
        let result = self.guarded(&key, "evict_all", fut).await;
        let cleared = self.near.clear();
        debug!(region = %self.name, cleared = cleared, "Region evicted");
        result
    }

    /// Drop this member's local copies only.
    pub fn evict_data(&self) -> usize {
        self.near.clear()
    }

    // ------------------------------------------------------------------------
    // Soft locks
    // ------------------------------------------------------------------------

    /// Install or join the soft-lock marker for `key` on behalf of `owner`.
    ///
    /// A value (or absence) is replaced by a fresh marker holding the given
    /// version, a live marker gains a holder, and an expired or released
    /// marker is taken over with a new lock id.
    pub async fn try_lock(
        &self,
        key: &CacheKey,
        owner: SessionId,
        version: Option<Version>,
    ) -> CacheResult<SoftLock> {
        let since = self.near.reserve();
        let fut = async {
            loop {
                let now = self.clock.next_timestamp();
                let current = self.call("map.get", self.map.get(key)).await?;
                let marker = match &current {
                    None => LockMarker::new(owner, version.clone(), now, self.lock_timeout),
                    Some(CacheEntry::Value(v)) => LockMarker::new(
                        owner,
                        version.clone().or_else(|| v.version.clone()),
                        now,
                        self.lock_timeout,
                    ),
                    Some(CacheEntry::Locked(m)) if m.is_released() || m.is_expired(now) => {
                        LockMarker::new(owner, version.clone(), now, self.lock_timeout)
                    }
                    Some(CacheEntry::Locked(m)) => m.clone().join(now, self.lock_timeout),
                };
                let next = CacheEntry::Locked(marker.clone());
                if self.swap(key, current.as_ref(), next.clone()).await? {
                    return Ok((marker.token(owner), next));
                }
            }
        };
        let (token, entry) = self.guarded(key, "lock", fut).await?;
        self.after_write(key, WriteOutcome::Written, &entry, Some(owner), version, since)
            .await?;
        debug!(region = %self.name, key = %key, lock_id = %token.lock_id, "Soft lock acquired");
        Ok(token)
    }

    /// Release one hold on the marker `lock` refers to.
    ///
    /// Returns false without touching the map when the stored marker is not
    /// the one the token was issued for.
    pub async fn unlock(&self, key: &CacheKey, lock: &SoftLock) -> CacheResult<bool> {
        let since = self.near.reserve();
        let fut = async {
            loop {
                let current = self.call("map.get", self.map.get(key)).await?;
                let marker = match &current {
                    Some(CacheEntry::Locked(m)) if m.matches(lock) => m.clone(),
                    _ => return Ok(None),
                };
                let released = CacheEntry::Locked(marker.release(self.clock.next_timestamp()));
                if self.swap(key, current.as_ref(), released.clone()).await? {
                    return Ok(Some(released));
                }
            }
        };
        match self.guarded(key, "unlock", fut).await? {
            Some(released) => {
                self.after_write(
                    key,
                    WriteOutcome::Written,
                    &released,
                    Some(lock.owner),
                    None,
                    since,
                )
                .await?;
                Ok(true)
            }
            None => {
                debug!(region = %self.name, key = %key, "Unlock ignored, marker no longer matches");
                Ok(false)
            }
        }
    }

    /// Replace the marker `lock` refers to with `value`.
    ///
    /// Only a marker that was never shared writes through. Once a second
    /// session joined it, neither session's value can be trusted (the order
    /// of their calls here is not their commit order), so every holder only
    /// releases and the key is reloaded from the database later. Such calls
    /// report [`WriteOutcome::Locked`]; a marker that no longer matches is
    /// left untouched.
    pub async fn update(
        &self,
        key: &CacheKey,
        value: CacheValue,
        version: Option<Version>,
        lock: &SoftLock,
    ) -> CacheResult<WriteOutcome> {
        let since = self.near.reserve();
        let fut = async {
            loop {
                let current = self.call("map.get", self.map.get(key)).await?;
                let marker = match &current {
                    Some(CacheEntry::Locked(m)) if m.matches(lock) => m.clone(),
                    _ => return Ok((WriteOutcome::Locked, None)),
                };
                let now = self.clock.next_timestamp();
                let (outcome, next) = if marker.is_concurrent() {
                    (WriteOutcome::Locked, CacheEntry::Locked(marker.release(now)))
                } else {
                    let written = VersionedValue::new(value.clone(), version.clone(), now);
                    (WriteOutcome::Written, CacheEntry::Value(written))
                };
                if self.swap(key, current.as_ref(), next.clone()).await? {
                    return Ok((outcome, Some(next)));
                }
            }
        };
        let (outcome, next) = self.guarded(key, "update", fut).await?;
        if let Some(next) = next {
            self.after_write(key, WriteOutcome::Written, &next, Some(lock.owner), version, since)
                .await?;
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Compare-and-set from `current` (absent when None) to `next`.
    async fn swap(
        &self,
        key: &CacheKey,
        current: Option<&CacheEntry>,
        next: CacheEntry,
    ) -> Result<bool, BackendError> {
        match current {
            None => Ok(self
                .call("map.put_if_absent", self.map.put_if_absent(key.clone(), next))
                .await?
                .is_none()),
            Some(existing) => {
                self.call("map.replace", self.map.replace_if_same(key, existing, next))
                    .await
            }
        }
    }

    /// Publish and refresh the near-cache after a successful write.
    ///
    /// `since` is the near-cache sequence reserved before the write started.
    async fn after_write(
        &self,
        key: &CacheKey,
        outcome: WriteOutcome,
        entry: &CacheEntry,
        session: Option<SessionId>,
        version: Option<Version>,
        since: u64,
    ) -> CacheResult<()> {
        if !outcome.is_written() {
            trace!(region = %self.name, key = %key, outcome = ?outcome, "Write skipped");
            return Ok(());
        }
        let published = self
            .publish(InvalidationTarget::Key(key.clone()), session, version)
            .await;
        if let Err(err) = published {
            self.near.evict(key);
            warn!(region = %self.name, key = %key, error = %err, "Invalidation publish failed");
            return Err(err.into());
        }
        self.near.put_if_fresh(key.clone(), entry.clone(), since);
        Ok(())
    }

    async fn publish(
        &self,
        target: InvalidationTarget,
        session: Option<SessionId>,
        version: Option<Version>,
    ) -> Result<(), BackendError> {
        let event = InvalidationEvent {
            region: self.name.clone(),
            target,
            origin: self.member,
            session,
            timestamp: self.clock.now(),
            version,
        };
        self.call("topic.publish", self.topic.publish(event)).await
    }

    /// Bound a grid call by the operation timeout.
    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        bounded(self.operation_timeout, operation, fut).await
    }

    /// Run `fut`, evicting `key` locally if the grid fails.
    async fn guarded<T, F>(&self, key: &CacheKey, operation: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        fut.await.map_err(|err| {
            self.near.evict(key);
            warn!(
                region = %self.name,
                key = %key,
                operation = operation,
                error = %err,
                "Grid operation failed, local entry evicted"
            );
            GridCacheError::from(err)
        })
    }

    /// Stop the invalidation listener and drop local state.
    ///
    /// Returns the listener task the first time, for the caller to join.
    pub fn destroy(&self) -> Option<JoinHandle<()>> {
        let handle = self.listener.shutdown();
        self.near.clear();
        debug!(region = %self.name, "Region destroyed");
        handle
    }
}

fn refused(existing: &CacheEntry) -> WriteOutcome {
    if existing.is_locked() {
        WriteOutcome::Locked
    } else {
        WriteOutcome::StaleDiscarded
    }
}

impl Cleanable for RegionCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn cleanup(&self) -> CleanupReport {
        self.near.cleanup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GridMember, InMemoryCluster};
    use crate::TimestampEntry;
    use async_trait::async_trait;
    use gridcache_core::{new_id, ManualTimestamper, NaturalVersionComparator};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Member whose entry-map reads can be held after they return from the
    /// grid, before the caller sees the result.
    struct GatedGrid {
        inner: Arc<GridMember>,
        gate: Arc<Gate>,
    }

    #[derive(Default)]
    struct Gate {
        armed: AtomicBool,
        read_done: Notify,
        release: Notify,
    }

    struct GatedMap {
        inner: Arc<dyn DistributedMap<CacheEntry>>,
        gate: Arc<Gate>,
    }

    impl Grid for GatedGrid {
        fn member_id(&self) -> MemberId {
            self.inner.member_id()
        }

        fn entry_map(&self, name: &str) -> Arc<dyn DistributedMap<CacheEntry>> {
            Arc::new(GatedMap {
                inner: self.inner.entry_map(name),
                gate: self.gate.clone(),
            })
        }

        fn timestamp_map(&self, name: &str) -> Arc<dyn DistributedMap<TimestampEntry>> {
            self.inner.timestamp_map(name)
        }

        fn topic(&self, name: &str) -> Arc<dyn Topic> {
            self.inner.topic(name)
        }
    }

    #[async_trait]
    impl DistributedMap<CacheEntry> for GatedMap {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
            let read = self.inner.get(key).await;
            if self.gate.armed.swap(false, Ordering::SeqCst) {
                self.gate.read_done.notify_one();
                self.gate.release.notified().await;
            }
            read
        }

        async fn put(&self, key: CacheKey, value: CacheEntry) -> Result<Option<CacheEntry>, BackendError> {
            self.inner.put(key, value).await
        }

        async fn put_if_absent(
            &self,
            key: CacheKey,
            value: CacheEntry,
        ) -> Result<Option<CacheEntry>, BackendError> {
            self.inner.put_if_absent(key, value).await
        }

        async fn replace_if_same(
            &self,
            key: &CacheKey,
            expected: &CacheEntry,
            value: CacheEntry,
        ) -> Result<bool, BackendError> {
            self.inner.replace_if_same(key, expected, value).await
        }

        async fn remove(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
            self.inner.remove(key).await
        }

        async fn remove_if_same(&self, key: &CacheKey, expected: &CacheEntry) -> Result<bool, BackendError> {
            self.inner.remove_if_same(key, expected).await
        }

        async fn clear(&self) -> Result<(), BackendError> {
            self.inner.clear().await
        }

        async fn size(&self) -> Result<usize, BackendError> {
            self.inner.size().await
        }
    }

    async fn settle<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    struct Fixture {
        cluster: InMemoryCluster,
        clock: Arc<ManualTimestamper>,
        config: GridCacheConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                cluster: InMemoryCluster::new(),
                clock: ManualTimestamper::shared(1_000),
                config: GridCacheConfig::new().with_lock_timeout(Duration::from_millis(500)),
            }
        }

        fn region(&self, description: CacheDataDescription) -> Arc<RegionCache> {
            let member = self.cluster.join();
            RegionCache::open(
                "app.Person",
                RegionKind::Entity,
                description,
                member.as_ref(),
                self.clock.clone(),
                &self.config,
            )
        }
    }

    fn key(id: i64) -> CacheKey {
        CacheKey::entity("Person", id)
    }

    #[tokio::test]
    async fn test_put_then_read_respects_visibility() {
        let fx = Fixture::new();
        let region = fx.region(CacheDataDescription::mutable());

        let outcome = region.put(key(1), json!("a"), 1_100, None).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(region.read(&key(1), 1_100).await.unwrap(), Some(json!("a")));
        assert_eq!(region.read(&key(1), 1_099).await.unwrap(), None);
        assert_eq!(region.size(), 1);
    }

    #[tokio::test]
    async fn test_put_never_downgrades_version() {
        let fx = Fixture::new();
        let description =
            CacheDataDescription::versioned().with_comparator(Arc::new(NaturalVersionComparator));
        let region = fx.region(description);

        region
            .put(key(1), json!("v2"), 1_100, Some(Version::Number(2)))
            .await
            .unwrap();
        let stale = region
            .put(key(1), json!("v1"), 1_200, Some(Version::Number(1)))
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::StaleDiscarded);
        assert_eq!(region.read(&key(1), 2_000).await.unwrap(), Some(json!("v2")));
    }

    #[tokio::test]
    async fn test_lock_blocks_puts_until_update() {
        let fx = Fixture::new();
        let region = fx.region(CacheDataDescription::mutable());
        region.put(key(1), json!("old"), 1_100, None).await.unwrap();

        let lock = region.try_lock(&key(1), new_id(), None).await.unwrap();
        let blocked = region.put(key(1), json!("x"), 1_300, None).await.unwrap();
        assert_eq!(blocked, WriteOutcome::Locked);
        assert_eq!(region.read(&key(1), i64::MAX).await.unwrap(), None);

        let outcome = region.update(&key(1), json!("new"), None, &lock).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(region.read(&key(1), i64::MAX).await.unwrap(), Some(json!("new")));
    }

    #[tokio::test]
    async fn test_concurrent_lock_releases_instead_of_writing() {
        let fx = Fixture::new();
        let region = fx.region(CacheDataDescription::mutable());

        let first = region.try_lock(&key(1), new_id(), None).await.unwrap();
        let second = region.try_lock(&key(1), new_id(), None).await.unwrap();
        assert_eq!(first.lock_id, second.lock_id);

        let outcome = region.update(&key(1), json!("a"), None, &first).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Locked);
        // The remaining holder is alone now, but the marker was shared.
        let outcome = region.update(&key(1), json!("b"), None, &second).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Locked);
        assert!(region.unlock(&key(1), &second).await.unwrap());

        match region.get(&key(1)).await.unwrap() {
            CacheLookup::Hit(CacheEntry::Locked(m)) => assert!(m.is_released()),
            other => panic!("expected released marker, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_token_does_not_touch_new_marker() {
        let fx = Fixture::new();
        let region = fx.region(CacheDataDescription::mutable());

        let stale = region.try_lock(&key(1), new_id(), None).await.unwrap();
        fx.clock.advance(Duration::from_secs(1));
        let fresh = region.try_lock(&key(1), new_id(), None).await.unwrap();
        assert_ne!(stale.lock_id, fresh.lock_id);

        assert!(!region.unlock(&key(1), &stale).await.unwrap());
        let outcome = region.update(&key(1), json!("x"), None, &stale).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Locked);
        assert!(region.update(&key(1), json!("y"), None, &fresh).await.unwrap().is_written());
    }

    #[tokio::test]
    async fn test_released_marker_rejects_loads_from_older_transactions() {
        let fx = Fixture::new();
        let region = fx.region(CacheDataDescription::mutable());

        let tx_before = fx.clock.next_timestamp();
        let lock = region.try_lock(&key(1), new_id(), None).await.unwrap();
        region.unlock(&key(1), &lock).await.unwrap();

        let stale = region.put(key(1), json!("old"), tx_before, None).await.unwrap();
        assert_eq!(stale, WriteOutcome::Locked);

        let tx_after = fx.clock.next_timestamp();
        let fresh = region.put(key(1), json!("new"), tx_after, None).await.unwrap();
        assert_eq!(fresh, WriteOutcome::Written);
    }

    #[tokio::test]
    async fn test_backend_failure_evicts_local_entry() {
        let fx = Fixture::new();
        let region = fx.region(CacheDataDescription::mutable());
        region.put(key(1), json!("a"), 1_100, None).await.unwrap();
        assert_eq!(region.size(), 1);

        fx.cluster.set_available(false);
        let err = region.remove(&key(1), None).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(region.size(), 0);
    }

    #[tokio::test]
    async fn test_slow_grid_times_out() {
        let mut fx = Fixture::new();
        fx.config = fx.config.clone().with_operation_timeout(Duration::from_millis(20));
        let region = fx.region(CacheDataDescription::mutable());
        fx.cluster.set_latency(Duration::from_millis(200));

        let err = region.get(&key(1)).await.unwrap_err();
        assert!(matches!(
            err,
            GridCacheError::Backend(BackendError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_each_write_publishes_one_event() {
        let fx = Fixture::new();
        let region = fx.region(CacheDataDescription::mutable());

        region.put(key(1), json!("a"), 1_100, None).await.unwrap();
        region.put(key(1), json!("a"), 1_050, None).await.unwrap();
        assert_eq!(fx.cluster.published_events(), 1);

        region.remove(&key(1), None).await.unwrap();
        region.evict_all().await.unwrap();
        assert_eq!(fx.cluster.published_events(), 3);
    }

    #[tokio::test]
    async fn test_expired_near_entry_is_reread_from_grid() {
        let mut fx = Fixture::new();
        fx.config = fx
            .config
            .clone()
            .with_default_region(RegionConfig::default().with_ttl(Duration::from_millis(100)));
        let region = fx.region(CacheDataDescription::mutable());
        region.put(key(1), json!("a"), 1_100, None).await.unwrap();
        assert_eq!(region.size(), 1);

        fx.clock.advance(Duration::from_millis(200));
        let lookup = tokio::time::timeout(Duration::from_secs(5), region.get(&key(1)))
            .await
            .expect("expired read must not hang")
            .unwrap();
        assert!(matches!(lookup, CacheLookup::Hit(CacheEntry::Value(_))));
        assert_eq!(region.stats().evictions, 1);
        assert_eq!(region.size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_racing_remote_update_is_not_cached_locally() {
        let fx = Fixture::new();
        let gate = Arc::new(Gate::default());
        let gated = GatedGrid {
            inner: fx.cluster.join(),
            gate: gate.clone(),
        };
        let a = RegionCache::open(
            "app.Person",
            RegionKind::Entity,
            CacheDataDescription::mutable(),
            &gated,
            fx.clock.clone(),
            &fx.config,
        );
        let b = fx.region(CacheDataDescription::mutable());

        b.put(key(1), json!("v1"), 1_100, None).await.unwrap();
        settle(|| a.listener().metrics().applied() >= 1).await;

        // A reads v1 from the grid and is held before filling its near-cache.
        gate.armed.store(true, Ordering::SeqCst);
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.get(&key(1)).await })
        };
        gate.read_done.notified().await;

        let lock = b.try_lock(&key(1), new_id(), None).await.unwrap();
        assert!(b.update(&key(1), json!("v2"), None, &lock).await.unwrap().is_written());
        settle(|| a.listener().metrics().applied() >= 3).await;

        gate.release.notify_one();
        let raced = reader.await.unwrap().unwrap();
        assert!(matches!(raced, CacheLookup::Hit(CacheEntry::Value(_))));

        assert!(a.near_cache().get(&key(1)).is_none());
        assert_eq!(a.read(&key(1), i64::MAX).await.unwrap(), Some(json!("v2")));
    }
}
