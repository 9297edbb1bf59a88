//! Timestamps region.
//!
//! Records, per table ("query space"), when it was last modified. Query
//! results cached at time `T` are usable only while every table they read
//! has an effective last-update strictly before `T`.
//!
//! A write transaction marks its tables twice. Before the write it
//! pre-invalidates them, which pushes the effective mark a lock timeout into
//! the future so no query cached meanwhile is considered fresh. After commit
//! it invalidates them, which records the commit time. Marks from concurrent
//! writers are counted so one writer finishing does not clear another's
//! pending mark.
//!
//! Entries are only ever overwritten, never removed: a table that lost its
//! mark would make every cached query over it look fresh.

use gridcache_core::{
    BackendError, CacheKey, CacheResult, ClusterTime, GridCacheConfig, MemberId, SessionId,
    Timestamper,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cleanup::Cleanable;
use crate::grid::{bounded, DistributedMap, Grid, Topic};
use crate::invalidation::{InvalidationEvent, InvalidationListener};
use crate::near_cache::{CleanupReport, NearCache};

/// Stored last-update state of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampEntry {
    /// Latest commit time recorded for the table.
    pub committed: ClusterTime,
    /// Writers between pre-invalidation and invalidation.
    pub pending: u32,
    /// Latest expiry among pending marks.
    pub pending_until: ClusterTime,
}

impl TimestampEntry {
    /// The last-update time queries must compare against.
    pub fn effective(&self) -> ClusterTime {
        if self.pending > 0 {
            self.committed.max(self.pending_until)
        } else {
            self.committed
        }
    }

    /// State after one more writer starts modifying the table.
    ///
    /// If every earlier pending mark has lapsed their writers are presumed
    /// gone and the count restarts.
    pub fn pre_invalidated(current: Option<&Self>, now: ClusterTime, lock_timeout: Duration) -> Self {
        let mut next = current.copied().unwrap_or_default();
        if next.pending > 0 && next.pending_until <= now {
            next.pending = 0;
        }
        next.pending += 1;
        next.pending_until = next
            .pending_until
            .max(now.saturating_add(lock_timeout.as_millis() as i64));
        next
    }

    /// State after one writer commits at `now`.
    pub fn invalidated(current: Option<&Self>, now: ClusterTime) -> Self {
        let mut next = current.copied().unwrap_or_default();
        next.committed = next.committed.max(now);
        next.pending = next.pending.saturating_sub(1);
        if next.pending == 0 {
            next.pending_until = 0;
        }
        next
    }
}

/// The cluster-wide timestamps region.
pub struct TimestampsRegionCache {
    name: String,
    member: MemberId,
    map: Arc<dyn DistributedMap<TimestampEntry>>,
    topic: Arc<dyn Topic>,
    near: Arc<NearCache<TimestampEntry>>,
    clock: Arc<dyn Timestamper>,
    lock_timeout: Duration,
    operation_timeout: Duration,
    listener: InvalidationListener,
}

impl std::fmt::Debug for TimestampsRegionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampsRegionCache")
            .field("name", &self.name)
            .field("member", &self.member)
            .field("near_entries", &self.near.len())
            .finish()
    }
}

impl TimestampsRegionCache {
    /// Open the timestamps region. Must be called inside a Tokio runtime.
    pub fn open(
        name: impl Into<String>,
        grid: &dyn Grid,
        clock: Arc<dyn Timestamper>,
        config: &GridCacheConfig,
    ) -> Arc<Self> {
        let name = name.into();
        let near = Arc::new(NearCache::new(config.region_config(&name), clock.clone()));
        let topic = grid.topic(&name);
        let listener = InvalidationListener::spawn(
            name.clone(),
            grid.member_id(),
            topic.subscribe(),
            near.clone(),
        );
        debug!(region = %name, member_id = %grid.member_id(), "Timestamps region opened");

        Arc::new(Self {
            map: grid.timestamp_map(&name),
            member: grid.member_id(),
            lock_timeout: config.lock_timeout,
            operation_timeout: config.operation_timeout,
            topic,
            near,
            clock,
            listener,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_timestamp(&self) -> ClusterTime {
        self.clock.next_timestamp()
    }

    pub fn listener(&self) -> &InvalidationListener {
        &self.listener
    }

    /// Tables held locally.
    pub fn size(&self) -> usize {
        self.near.len()
    }

    /// Mark `spaces` as being modified.
    pub async fn pre_invalidate(
        &self,
        spaces: &[String],
        session: Option<SessionId>,
    ) -> CacheResult<()> {
        let lock_timeout = self.lock_timeout;
        for space in spaces {
            let entry = self
                .mutate(space, session, |current, now| {
                    TimestampEntry::pre_invalidated(current, now, lock_timeout)
                })
                .await?;
            debug!(region = %self.name, space = %space, pending = entry.pending, "Pre-invalidated");
        }
        Ok(())
    }

    /// Record that `spaces` were modified by a committed transaction.
    pub async fn invalidate(&self, spaces: &[String], session: Option<SessionId>) -> CacheResult<()> {
        for space in spaces {
            let entry = self
                .mutate(space, session, TimestampEntry::invalidated)
                .await?;
            debug!(
                region = %self.name,
                space = %space,
                committed = entry.committed,
                "Invalidated"
            );
        }
        Ok(())
    }

    /// True if results computed at `result_timestamp` over `spaces` are
    /// still current.
    ///
    /// A grid failure answers false: a query result is never used on
    /// information that could not be read.
    pub async fn is_up_to_date(&self, spaces: &[String], result_timestamp: ClusterTime) -> bool {
        for space in spaces {
            match self.lookup(space).await {
                Ok(Some(entry)) if entry.effective() >= result_timestamp => return false,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        region = %self.name,
                        space = %space,
                        error = %err,
                        "Timestamps lookup failed, treating results as stale"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Effective last update of `space`, if it was ever modified.
    pub async fn last_update(&self, space: &str) -> CacheResult<Option<ClusterTime>> {
        Ok(self.lookup(space).await?.map(|e| e.effective()))
    }

    pub async fn entry(&self, space: &str) -> CacheResult<Option<TimestampEntry>> {
        self.lookup(space).await
    }

    /// Drop this member's local copies; the grid keeps every mark.
    pub fn evict_data(&self) -> usize {
        self.near.clear()
    }

    /// Stop the invalidation listener and return its task to join.
    pub fn destroy(&self) -> Option<JoinHandle<()>> {
        let handle = self.listener.shutdown();
        self.near.clear();
        handle
    }

    async fn lookup(&self, space: &str) -> CacheResult<Option<TimestampEntry>> {
        let key = CacheKey::space(space);
        if let Some(entry) = self.near.get(&key) {
            return Ok(Some(entry));
        }
        let since = self.near.reserve();
        match bounded(self.operation_timeout, "map.get", self.map.get(&key)).await {
            Ok(Some(entry)) => {
                self.near.put_if_fresh(key, entry, since);
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.near.evict(&key);
                Err(err.into())
            }
        }
    }

    /// Compare-and-set the entry for `space` to `f(current, now)`, then
    /// publish one event for it.
    async fn mutate<F>(
        &self,
        space: &str,
        session: Option<SessionId>,
        f: F,
    ) -> CacheResult<TimestampEntry>
    where
        F: Fn(Option<&TimestampEntry>, ClusterTime) -> TimestampEntry,
    {
        let key = CacheKey::space(space);
        let since = self.near.reserve();
        let result: Result<TimestampEntry, BackendError> = async {
            loop {
                let now = self.clock.next_timestamp();
                let current = bounded(self.operation_timeout, "map.get", self.map.get(&key)).await?;
                let next = f(current.as_ref(), now);
                let swapped = match &current {
                    None => bounded(
                        self.operation_timeout,
                        "map.put_if_absent",
                        self.map.put_if_absent(key.clone(), next),
                    )
                    .await?
                    .is_none(),
                    Some(existing) => {
                        bounded(
                            self.operation_timeout,
                            "map.replace",
                            self.map.replace_if_same(&key, existing, next),
                        )
                        .await?
                    }
                };
                if swapped {
                    let mut event =
                        InvalidationEvent::key(&self.name, key.clone(), self.member, now);
                    event.session = session;
                    bounded(self.operation_timeout, "topic.publish", self.topic.publish(event))
                        .await?;
                    return Ok(next);
                }
            }
        }
        .await;

        match result {
            Ok(next) => {
                self.near.put_if_fresh(key, next, since);
                Ok(next)
            }
            Err(err) => {
                self.near.evict(&key);
                warn!(region = %self.name, space = %space, error = %err, "Timestamp update failed");
                Err(err.into())
            }
        }
    }
}

impl Cleanable for TimestampsRegionCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn cleanup(&self) -> CleanupReport {
        self.near.cleanup()
    }
}
