//! In-process grid.
//!
//! `InMemoryCluster` holds the shared state of a simulated cluster; each
//! [`GridMember`] joined to it behaves like a separate node with its own
//! identity. Values are stored serialized, the way a real grid keeps them,
//! so members never share Rust objects. Availability and latency can be
//! changed at runtime to exercise failure paths.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gridcache_core::{new_id, BackendError, CacheEntry, CacheKey, GridCacheConfig, MemberId};
use serde_json::Value as JsonValue;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::grid::{DistributedMap, Grid, GridValue, Topic, TopicSubscription};
use crate::invalidation::InvalidationEvent;
use crate::timestamps::TimestampEntry;

type MapData = Arc<DashMap<CacheKey, JsonValue>>;

#[derive(Debug)]
struct ClusterState {
    maps: DashMap<String, MapData>,
    topics: DashMap<String, broadcast::Sender<InvalidationEvent>>,
    topic_capacity: usize,
    available: AtomicBool,
    latency_ms: AtomicU64,
    published: AtomicU64,
}

impl ClusterState {
    fn map_data(&self, name: &str) -> MapData {
        self.maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone()
    }

    fn sender(&self, name: &str) -> broadcast::Sender<InvalidationEvent> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.topic_capacity).0)
            .clone()
    }

    /// Apply configured latency, then fail if the grid is down.
    async fn enter(&self, operation: &str) -> Result<(), BackendError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BackendError::unavailable(operation, "cluster is unreachable"))
        }
    }
}

/// Shared state of a simulated cluster.
#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_topic_capacity(gridcache_core::config::DEFAULT_TOPIC_CAPACITY)
    }

    /// Cluster sized from `config.topic_capacity`.
    pub fn from_config(config: &GridCacheConfig) -> Self {
        Self::with_topic_capacity(config.topic_capacity)
    }

    /// Cluster whose topics buffer at most `capacity` undelivered events per
    /// subscriber.
    pub fn with_topic_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(ClusterState {
                maps: DashMap::new(),
                topics: DashMap::new(),
                topic_capacity: capacity.max(1),
                available: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                published: AtomicU64::new(0),
            }),
        }
    }

    pub fn topic_capacity(&self) -> usize {
        self.state.topic_capacity
    }

    /// Add a member with a fresh identity.
    pub fn join(&self) -> Arc<GridMember> {
        let member = GridMember {
            id: new_id(),
            state: self.state.clone(),
        };
        debug!(member_id = %member.id, "Member joined cluster");
        Arc::new(member)
    }

    /// Make every map and topic operation fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::Acquire)
    }

    /// Delay every grid operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Total events published on all topics since the cluster was created.
    pub fn published_events(&self) -> u64 {
        self.state.published.load(Ordering::Relaxed)
    }

    /// Number of entries stored in the named map.
    pub fn map_len(&self, name: &str) -> usize {
        self.state.maps.get(name).map(|m| m.len()).unwrap_or(0)
    }
}

/// One node of an [`InMemoryCluster`].
#[derive(Debug)]
pub struct GridMember {
    id: MemberId,
    state: Arc<ClusterState>,
}

impl GridMember {
    fn map<V: GridValue>(&self, name: &str) -> Arc<dyn DistributedMap<V>> {
        Arc::new(MemoryMap::<V> {
            name: name.to_string(),
            data: self.state.map_data(name),
            state: self.state.clone(),
            _value: PhantomData,
        })
    }
}

impl Grid for GridMember {
    fn member_id(&self) -> MemberId {
        self.id
    }

    fn entry_map(&self, name: &str) -> Arc<dyn DistributedMap<CacheEntry>> {
        self.map(name)
    }

    fn timestamp_map(&self, name: &str) -> Arc<dyn DistributedMap<TimestampEntry>> {
        self.map(name)
    }

    fn topic(&self, name: &str) -> Arc<dyn Topic> {
        Arc::new(MemoryTopic {
            name: name.to_string(),
            sender: self.state.sender(name),
            state: self.state.clone(),
        })
    }
}

// ============================================================================
// MAP
// ============================================================================

struct MemoryMap<V> {
    name: String,
    data: MapData,
    state: Arc<ClusterState>,
    _value: PhantomData<fn() -> V>,
}

impl<V: GridValue> MemoryMap<V> {
    fn encode(&self, value: &V) -> Result<JsonValue, BackendError> {
        serde_json::to_value(value)
            .map_err(|e| BackendError::unavailable(format!("{}.encode", self.name), e.to_string()))
    }

    fn decode(&self, raw: JsonValue) -> Result<V, BackendError> {
        serde_json::from_value(raw)
            .map_err(|e| BackendError::unavailable(format!("{}.decode", self.name), e.to_string()))
    }

    fn decode_opt(&self, raw: Option<JsonValue>) -> Result<Option<V>, BackendError> {
        raw.map(|r| self.decode(r)).transpose()
    }
}

#[async_trait]
impl<V: GridValue> DistributedMap<V> for MemoryMap<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<V>, BackendError> {
        self.state.enter("map.get").await?;
        let raw = self.data.get(key).map(|v| v.value().clone());
        self.decode_opt(raw)
    }

    async fn put(&self, key: CacheKey, value: V) -> Result<Option<V>, BackendError> {
        self.state.enter("map.put").await?;
        let raw = self.encode(&value)?;
        self.decode_opt(self.data.insert(key, raw))
    }

    async fn put_if_absent(&self, key: CacheKey, value: V) -> Result<Option<V>, BackendError> {
        self.state.enter("map.put_if_absent").await?;
        let raw = self.encode(&value)?;
        let existing = match self.data.entry(key) {
            Entry::Occupied(slot) => Some(slot.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(raw);
                None
            }
        };
        self.decode_opt(existing)
    }

    async fn replace_if_same(
        &self,
        key: &CacheKey,
        expected: &V,
        value: V,
    ) -> Result<bool, BackendError> {
        self.state.enter("map.replace").await?;
        let expected = self.encode(expected)?;
        let raw = self.encode(&value)?;
        Ok(match self.data.get_mut(key) {
            Some(mut slot) if *slot == expected => {
                *slot = raw;
                true
            }
            _ => false,
        })
    }

    async fn remove(&self, key: &CacheKey) -> Result<Option<V>, BackendError> {
        self.state.enter("map.remove").await?;
        let removed = self.data.remove(key).map(|(_, v)| v);
        self.decode_opt(removed)
    }

    async fn remove_if_same(&self, key: &CacheKey, expected: &V) -> Result<bool, BackendError> {
        self.state.enter("map.remove_if_same").await?;
        let expected = self.encode(expected)?;
        Ok(self.data.remove_if(key, |_, v| *v == expected).is_some())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.state.enter("map.clear").await?;
        self.data.clear();
        Ok(())
    }

    async fn size(&self) -> Result<usize, BackendError> {
        self.state.enter("map.size").await?;
        Ok(self.data.len())
    }
}

// ============================================================================
// TOPIC
// ============================================================================

struct MemoryTopic {
    name: String,
    sender: broadcast::Sender<InvalidationEvent>,
    state: Arc<ClusterState>,
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, event: InvalidationEvent) -> Result<(), BackendError> {
        self.state.enter("topic.publish").await?;
        self.state.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(receivers) => {
                debug!(topic = %self.name, receivers = receivers, "Published invalidation");
            }
            Err(_) => {
                debug!(topic = %self.name, "No subscribers for invalidation");
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> TopicSubscription {
        self.sender.subscribe()
    }
}
