//! Distributed grid abstraction.
//!
//! The cache consumes two primitives from the data grid: a named key/value
//! map with per-key compare-and-set, and a named publish/subscribe topic with
//! at-least-once, per-publisher ordered delivery. Both are traits so the
//! region logic does not depend on a particular grid client.

use async_trait::async_trait;
use gridcache_core::{BackendError, CacheEntry, CacheKey, MemberId};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::invalidation::InvalidationEvent;
use crate::timestamps::TimestampEntry;

/// Values a distributed map can hold.
///
/// Values cross the wire, so they must be serializable, and compare-and-set
/// compares them for equality.
pub trait GridValue:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
}

impl<T> GridValue for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
}

/// Cluster-wide key/value map.
///
/// Every operation is linearizable per key for the member performing it.
/// Implementations report transport failures as [`BackendError`].
#[async_trait]
pub trait DistributedMap<V: GridValue>: Send + Sync {
    /// Map name (one per region).
    fn name(&self) -> &str;

    async fn get(&self, key: &CacheKey) -> Result<Option<V>, BackendError>;

    /// Unconditional write, returning the previous value.
    async fn put(&self, key: CacheKey, value: V) -> Result<Option<V>, BackendError>;

    /// Write only if the key is absent; returns the existing value otherwise.
    async fn put_if_absent(&self, key: CacheKey, value: V) -> Result<Option<V>, BackendError>;

    /// Replace the value only if it still equals `expected`.
    async fn replace_if_same(
        &self,
        key: &CacheKey,
        expected: &V,
        value: V,
    ) -> Result<bool, BackendError>;

    async fn remove(&self, key: &CacheKey) -> Result<Option<V>, BackendError>;

    /// Remove the key only if its value still equals `expected`.
    async fn remove_if_same(&self, key: &CacheKey, expected: &V) -> Result<bool, BackendError>;

    async fn clear(&self) -> Result<(), BackendError>;

    async fn size(&self) -> Result<usize, BackendError>;
}

/// Subscription handle for a topic.
pub type TopicSubscription = broadcast::Receiver<InvalidationEvent>;

/// Cluster-wide publish/subscribe channel carrying invalidation events.
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    /// Broadcast to every subscriber, including the publisher's own.
    async fn publish(&self, event: InvalidationEvent) -> Result<(), BackendError>;

    /// Receive every event published after this call.
    fn subscribe(&self) -> TopicSubscription;
}

/// One member's connection to the grid.
pub trait Grid: Send + Sync {
    /// Identity of this member; stamped on published events.
    fn member_id(&self) -> MemberId;

    /// Map holding a data region's entries.
    fn entry_map(&self, name: &str) -> Arc<dyn DistributedMap<CacheEntry>>;

    /// Map holding the timestamps region's entries.
    fn timestamp_map(&self, name: &str) -> Arc<dyn DistributedMap<TimestampEntry>>;

    fn topic(&self, name: &str) -> Arc<dyn Topic>;
}

/// Bound a grid call by `limit`, reporting overruns as [`BackendError::Timeout`].
pub(crate) async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::timeout(operation, limit)),
    }
}
