//! Cluster-wide invalidation.
//!
//! Every mutation of a region publishes one [`InvalidationEvent`] on the
//! region's topic. Each member runs an [`InvalidationListener`] that applies
//! events from other members to its near-cache. Applying an event only ever
//! removes local state, so redelivery is harmless.
//!
//! A listener that falls behind the topic's buffer cannot know which events
//! it missed, so it clears the whole near-cache and carries on.

use gridcache_core::{CacheKey, ClusterTime, MemberId, SessionId, Version};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::grid::TopicSubscription;
use crate::near_cache::LocalInvalidation;

// ============================================================================
// EVENT
// ============================================================================

/// What an event invalidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "key")]
pub enum InvalidationTarget {
    Key(CacheKey),
    EvictAll,
}

/// Notification that a region's entry (or the whole region) changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub region: String,
    pub target: InvalidationTarget,
    /// Member that performed the mutation.
    pub origin: MemberId,
    /// Session that performed the mutation, when known.
    pub session: Option<SessionId>,
    pub timestamp: ClusterTime,
    pub version: Option<Version>,
}

impl InvalidationEvent {
    pub fn key(
        region: impl Into<String>,
        key: CacheKey,
        origin: MemberId,
        timestamp: ClusterTime,
    ) -> Self {
        Self {
            region: region.into(),
            target: InvalidationTarget::Key(key),
            origin,
            session: None,
            timestamp,
            version: None,
        }
    }

    pub fn evict_all(region: impl Into<String>, origin: MemberId, timestamp: ClusterTime) -> Self {
        Self {
            region: region.into(),
            target: InvalidationTarget::EvictAll,
            origin,
            session: None,
            timestamp,
            version: None,
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_version(mut self, version: Option<Version>) -> Self {
        self.version = version;
        self
    }

    /// Remove the affected local state; returns how many entries went.
    pub fn apply(&self, local: &dyn LocalInvalidation) -> usize {
        match &self.target {
            InvalidationTarget::Key(key) => usize::from(local.invalidate_key(key)),
            InvalidationTarget::EvictAll => local.invalidate_all(),
        }
    }
}

// ============================================================================
// LISTENER
// ============================================================================

/// Counters for one region's listener.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    /// Events from other members applied locally.
    pub applied: AtomicU64,
    /// Events this member published itself.
    pub ignored_own: AtomicU64,
    /// Times the listener fell behind and cleared its cache.
    pub lagged: AtomicU64,
}

impl ListenerMetrics {
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn ignored_own(&self) -> u64 {
        self.ignored_own.load(Ordering::Relaxed)
    }

    pub fn lagged(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }
}

/// Background task applying remote invalidations to one near-cache.
#[derive(Debug)]
pub struct InvalidationListener {
    metrics: Arc<ListenerMetrics>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationListener {
    /// Start listening on `subscription`.
    ///
    /// Must be called inside a Tokio runtime. The subscription should be
    /// taken before the region performs any write so no event is missed.
    pub fn spawn(
        region: String,
        member: MemberId,
        subscription: TopicSubscription,
        local: Arc<dyn LocalInvalidation>,
    ) -> Self {
        let metrics = Arc::new(ListenerMetrics::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(listen(
            region,
            member,
            subscription,
            local,
            metrics.clone(),
            shutdown_rx,
        ));
        Self {
            metrics,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn metrics(&self) -> &Arc<ListenerMetrics> {
        &self.metrics
    }

    /// Signal the task to stop. Returns its handle the first time.
    pub fn shutdown(&self) -> Option<JoinHandle<()>> {
        let _ = self.shutdown_tx.send(true);
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }
}

impl Drop for InvalidationListener {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn listen(
    region: String,
    member: MemberId,
    mut subscription: TopicSubscription,
    local: Arc<dyn LocalInvalidation>,
    metrics: Arc<ListenerMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(region = %region, member_id = %member, "Invalidation listener started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            received = subscription.recv() => match received {
                Ok(event) => {
                    if event.origin == member {
                        metrics.ignored_own.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    if event.region != region {
                        continue;
                    }
                    let removed = event.apply(local.as_ref());
                    metrics.applied.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        region = %region,
                        origin = %event.origin,
                        removed = removed,
                        "Applied remote invalidation"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let cleared = local.invalidate_all();
                    metrics.lagged.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        region = %region,
                        skipped = skipped,
                        cleared = cleared,
                        "Invalidation listener lagged, near-cache cleared"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    info!(
        region = %region,
        applied = metrics.applied(),
        lagged = metrics.lagged(),
        "Invalidation listener stopped"
    );
}
