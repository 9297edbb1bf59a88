//! Operational view over this member's regions.
//!
//! Counts are read from the local near-caches and memoized for the refresh
//! period (30 seconds by default), so polling does not walk every region on
//! each request. Region counts and evictions are always live.

use gridcache_core::{Memoized, Timestamper};
use gridcache_storage::RegionCache;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

type Registry = RwLock<BTreeMap<String, Arc<RegionCache>>>;

/// Snapshot of everything the status view reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub entity_regions: BTreeMap<String, u64>,
    pub query_regions: Vec<String>,
    pub total_entities: u64,
    pub total_queries: u64,
}

/// Entity and query region counters for one member.
#[derive(Debug)]
pub struct RegionStatus {
    name: String,
    refresh: Duration,
    clock: Arc<dyn Timestamper>,
    entity_regions: Registry,
    query_regions: Registry,
    total_entities: Memoized<u64>,
    entity_region_names: Memoized<Vec<String>>,
    entities_by_region: Memoized<BTreeMap<String, u64>>,
    per_region: Mutex<HashMap<String, Arc<Memoized<u64>>>>,
    query_region_names: Memoized<Vec<String>>,
    total_queries: Memoized<u64>,
}

fn read(registry: &Registry) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<RegionCache>>> {
    registry.read().unwrap_or_else(|p| p.into_inner())
}

fn write(
    registry: &Registry,
) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<RegionCache>>> {
    registry.write().unwrap_or_else(|p| p.into_inner())
}

fn count(region: &RegionCache) -> u64 {
    region.element_count_in_memory() as u64
}

impl RegionStatus {
    pub fn new(name: impl Into<String>, refresh: Duration, clock: Arc<dyn Timestamper>) -> Self {
        let name = name.into();
        info!(status = %name, refresh_ms = refresh.as_millis() as u64, "Region status registered");
        Self {
            total_entities: Memoized::new(refresh, clock.clone()),
            entity_region_names: Memoized::new(refresh, clock.clone()),
            entities_by_region: Memoized::new(refresh, clock.clone()),
            query_region_names: Memoized::new(refresh, clock.clone()),
            total_queries: Memoized::new(refresh, clock.clone()),
            per_region: Mutex::new(HashMap::new()),
            entity_regions: RwLock::new(BTreeMap::new()),
            query_regions: RwLock::new(BTreeMap::new()),
            refresh,
            clock,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_entity_region(&self, region: Arc<RegionCache>) {
        write(&self.entity_regions).insert(region.name().to_string(), region);
    }

    pub fn register_query_region(&self, region: Arc<RegionCache>) {
        write(&self.query_regions).insert(region.name().to_string(), region);
    }

    /// Forget every region.
    pub fn unregister(&self) {
        write(&self.entity_regions).clear();
        write(&self.query_regions).clear();
        self.per_region
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        info!(status = %self.name, "Region status unregistered");
    }

    // ------------------------------------------------------------------------
    // Entity regions
    // ------------------------------------------------------------------------

    pub fn count_all_entities(&self) -> u64 {
        self.total_entities
            .get_or_refresh(|| read(&self.entity_regions).values().map(|r| count(r)).sum())
    }

    pub fn count_entity_regions(&self) -> usize {
        read(&self.entity_regions).len()
    }

    pub fn list_entity_regions(&self) -> Vec<String> {
        self.entity_region_names
            .get_or_refresh(|| read(&self.entity_regions).keys().cloned().collect())
    }

    /// Entries held for `region`, or None if no such entity region exists.
    pub fn count_entities_for_region(&self, region: &str) -> Option<u64> {
        let cache = read(&self.entity_regions).get(region).cloned()?;
        let memo = self
            .per_region
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(region.to_string())
            .or_insert_with(|| Arc::new(Memoized::new(self.refresh, self.clock.clone())))
            .clone();
        Some(memo.get_or_refresh(|| count(&cache)))
    }

    pub fn map_entities_by_region(&self) -> BTreeMap<String, u64> {
        self.entities_by_region.get_or_refresh(|| {
            read(&self.entity_regions)
                .iter()
                .map(|(name, r)| (name.clone(), count(r)))
                .collect()
        })
    }

    /// Drop this member's local copies for `region`; returns how many were
    /// held, or None if no such entity region exists.
    pub fn evict_cache_of_region(&self, region: &str) -> Option<u64> {
        let cache = read(&self.entity_regions).get(region).cloned()?;
        let evicted = cache.evict_data() as u64;
        if let Some(memo) = self
            .per_region
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(region)
        {
            memo.invalidate();
        }
        debug!(status = %self.name, region = region, evicted = evicted, "Region evicted locally");
        Some(evicted)
    }

    // ------------------------------------------------------------------------
    // Query regions
    // ------------------------------------------------------------------------

    pub fn count_query_regions(&self) -> usize {
        read(&self.query_regions).len()
    }

    pub fn list_query_regions(&self) -> Vec<String> {
        self.query_region_names
            .get_or_refresh(|| read(&self.query_regions).keys().cloned().collect())
    }

    pub fn count_all_queries(&self) -> u64 {
        self.total_queries
            .get_or_refresh(|| read(&self.query_regions).values().map(|r| count(r)).sum())
    }

    pub fn evict_cache_of_query_region(&self, region: &str) -> Option<u64> {
        let cache = read(&self.query_regions).get(region).cloned()?;
        Some(cache.evict_data() as u64)
    }

    pub fn evict_cache_of_all_queries(&self) -> u64 {
        let regions: Vec<_> = read(&self.query_regions).values().cloned().collect();
        regions.iter().map(|r| r.evict_data() as u64).sum()
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            name: self.name.clone(),
            entity_regions: self.map_entities_by_region(),
            query_regions: self.list_query_regions(),
            total_entities: self.count_all_entities(),
            total_queries: self.count_all_queries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcache_core::{
        CacheDataDescription, CacheKey, GridCacheConfig, ManualTimestamper, RegionKind,
    };
    use gridcache_storage::InMemoryCluster;
    use serde_json::json;

    fn region(cluster: &InMemoryCluster, name: &str, clock: Arc<ManualTimestamper>) -> Arc<RegionCache> {
        RegionCache::open(
            name,
            RegionKind::Entity,
            CacheDataDescription::mutable(),
            cluster.join().as_ref(),
            clock,
            &GridCacheConfig::new(),
        )
    }

    #[tokio::test]
    async fn test_counts_are_memoized_for_refresh_period() {
        let cluster = InMemoryCluster::new();
        let clock = ManualTimestamper::shared(1_000);
        let people = region(&cluster, "app.Person", clock.clone());
        let status = RegionStatus::new("test", Duration::from_secs(30), clock.clone());
        status.register_entity_region(people.clone());

        people.put(CacheKey::entity("Person", 1), json!(1), 1_100, None).await.unwrap();
        assert_eq!(status.count_all_entities(), 1);

        people.put(CacheKey::entity("Person", 2), json!(2), 1_100, None).await.unwrap();
        assert_eq!(status.count_all_entities(), 1);
        assert_eq!(status.count_entity_regions(), 1);

        clock.advance(Duration::from_secs(30));
        assert_eq!(status.count_all_entities(), 2);
        assert_eq!(status.map_entities_by_region().get("app.Person"), Some(&2));
    }

    #[tokio::test]
    async fn test_evict_region_resets_its_count() {
        let cluster = InMemoryCluster::new();
        let clock = ManualTimestamper::shared(1_000);
        let people = region(&cluster, "app.Person", clock.clone());
        let status = RegionStatus::new("test", Duration::from_secs(30), clock.clone());
        status.register_entity_region(people.clone());
        people.put(CacheKey::entity("Person", 1), json!(1), 1_100, None).await.unwrap();

        assert_eq!(status.count_entities_for_region("app.Person"), Some(1));
        assert_eq!(status.evict_cache_of_region("app.Person"), Some(1));
        assert_eq!(status.count_entities_for_region("app.Person"), Some(0));
        assert_eq!(status.count_entities_for_region("app.Missing"), None);
        assert_eq!(status.evict_cache_of_region("app.Missing"), None);
    }

    #[tokio::test]
    async fn test_query_regions() {
        let cluster = InMemoryCluster::new();
        let clock = ManualTimestamper::shared(1_000);
        let queries = region(&cluster, "default-query-results-region", clock.clone());
        let status = RegionStatus::new("test", Duration::from_secs(30), clock.clone());
        status.register_query_region(queries.clone());
        queries.put(CacheKey::query("from Person"), json!([1]), 1_100, None).await.unwrap();

        assert_eq!(status.count_query_regions(), 1);
        assert_eq!(status.list_query_regions(), vec!["default-query-results-region"]);
        assert_eq!(status.count_all_queries(), 1);
        assert_eq!(status.evict_cache_of_all_queries(), 1);
        assert_eq!(status.report().total_queries, 1);
    }
}
