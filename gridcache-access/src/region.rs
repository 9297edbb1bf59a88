//! Region handles returned by the factory.

use dashmap::DashMap;
use gridcache_core::{
    AccessType, CacheEntry, CacheKey, CacheLookup, CacheResult, CacheValue, ClusterTime,
    ConfigError, RegionKind,
};
use gridcache_storage::{RegionCache, TimestampsRegionCache};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::delegate::{absorb, written, AccessDelegate};
use crate::nonstrict::NonStrictReadWriteAccess;
use crate::read_only::ReadOnlyAccess;
use crate::read_write::ReadWriteAccess;
use crate::transactional::TransactionalAccess;

/// Build the strategy for `access_type` over `region`.
///
/// Fails for region kinds that do not take an access strategy and for
/// combinations the kind does not support.
pub fn build_access_delegate(
    region: Arc<RegionCache>,
    access_type: AccessType,
) -> Result<Arc<dyn AccessDelegate>, ConfigError> {
    if !region.kind().supports(access_type) {
        return Err(ConfigError::UnsupportedAccessType {
            region: region.name().to_string(),
            kind: region.kind(),
            access_type,
        });
    }
    Ok(match access_type {
        AccessType::ReadOnly => Arc::new(ReadOnlyAccess::new(region)),
        AccessType::NonstrictReadWrite => Arc::new(NonStrictReadWriteAccess::new(region)),
        AccessType::ReadWrite => Arc::new(ReadWriteAccess::new(region)),
        AccessType::Transactional => Arc::new(TransactionalAccess::new(region)),
    })
}

/// Entity, collection or natural-id region.
///
/// Each access type's strategy is built on first request and reused.
#[derive(Debug)]
pub struct DomainDataRegion {
    cache: Arc<RegionCache>,
    strategies: DashMap<AccessType, Arc<dyn AccessDelegate>>,
}

impl DomainDataRegion {
    pub fn new(cache: Arc<RegionCache>) -> Self {
        Self {
            cache,
            strategies: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.cache.name()
    }

    pub fn kind(&self) -> RegionKind {
        self.cache.kind()
    }

    pub fn cache(&self) -> &Arc<RegionCache> {
        &self.cache
    }

    pub fn access_strategy(
        &self,
        access_type: AccessType,
    ) -> Result<Arc<dyn AccessDelegate>, ConfigError> {
        if let Some(existing) = self.strategies.get(&access_type) {
            return Ok(existing.clone());
        }
        let built = build_access_delegate(self.cache.clone(), access_type)?;
        let strategy = self
            .strategies
            .entry(access_type)
            .or_insert(built)
            .clone();
        debug!(region = self.name(), access_type = %access_type, "Access strategy built");
        Ok(strategy)
    }
}

/// Query-result region checked against the timestamps region.
#[derive(Debug)]
pub struct QueryResultsRegion {
    cache: Arc<RegionCache>,
    timestamps: Arc<TimestampsRegionCache>,
}

impl QueryResultsRegion {
    pub fn new(cache: Arc<RegionCache>, timestamps: Arc<TimestampsRegionCache>) -> Self {
        Self { cache, timestamps }
    }

    pub fn name(&self) -> &str {
        self.cache.name()
    }

    pub fn cache(&self) -> &Arc<RegionCache> {
        &self.cache
    }

    pub fn timestamps(&self) -> &Arc<TimestampsRegionCache> {
        &self.timestamps
    }

    /// Cache `results` of `query`, computed by a transaction started at
    /// `result_timestamp`.
    pub async fn put(
        &self,
        query: CacheKey,
        results: CacheValue,
        result_timestamp: ClusterTime,
    ) -> bool {
        let result = self.cache.put(query, results, result_timestamp, None).await;
        written(&self.cache, "query.put", result)
    }

    /// Cached results of `query`, unless any of `spaces` changed since they
    /// were computed.
    pub async fn get(&self, query: &CacheKey, spaces: &[String]) -> Option<CacheValue> {
        let lookup = absorb(
            &self.cache,
            "query.get",
            self.cache.get(query).await,
            CacheLookup::Miss,
        );
        let cached = match lookup.into_entry() {
            Some(CacheEntry::Value(cached)) => cached,
            _ => return None,
        };
        if self.timestamps.is_up_to_date(spaces, cached.timestamp).await {
            Some(cached.value)
        } else {
            debug!(region = self.name(), query = %query, "Cached query results are stale");
            None
        }
    }

    pub async fn evict(&self, query: &CacheKey) -> CacheResult<()> {
        if let Err(err) = self.cache.remove(query, None).await {
            warn!(region = self.name(), error = %err, "Query eviction failed");
        }
        Ok(())
    }

    pub async fn evict_all(&self) -> CacheResult<()> {
        if let Err(err) = self.cache.evict_all().await {
            warn!(region = self.name(), error = %err, "Query region eviction failed");
        }
        Ok(())
    }
}
