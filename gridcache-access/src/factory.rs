//! Region factory.
//!
//! Entry point for the ORM: started once with the ORM's properties, it builds
//! every region the ORM asks for on the member's grid connection, runs the
//! near-cache cleanup task, and tears everything down on stop.

use gridcache_core::{
    AccessType, CacheDataDescription, CacheResult, ClusterTime, ConfigError, GridCacheConfig, RegionKind,
    SystemTimestamper, Timestamper,
};
use gridcache_storage::{
    cleanup_task, CleanupMetrics, CleanupRegistry, Grid, RegionCache, TimestampsRegionCache,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::delegate::AccessDelegate;
use crate::region::{DomainDataRegion, QueryResultsRegion};
use crate::status::RegionStatus;

/// Default name of the query-results region.
pub const DEFAULT_QUERY_RESULTS_REGION: &str = "default-query-results-region";

/// Default name of the timestamps region.
pub const DEFAULT_TIMESTAMPS_REGION: &str = "default-update-timestamps-region";

struct FactoryState {
    config: GridCacheConfig,
    domain_regions: BTreeMap<String, Arc<DomainDataRegion>>,
    query_regions: BTreeMap<String, Arc<QueryResultsRegion>>,
    timestamps: BTreeMap<String, Arc<TimestampsRegionCache>>,
    cleanup: Arc<CleanupRegistry>,
    shutdown_tx: watch::Sender<bool>,
    cleanup_handle: JoinHandle<Arc<CleanupMetrics>>,
    status: Option<Arc<RegionStatus>>,
}

/// Builds and owns the regions of one member.
pub struct RegionFactory {
    grid: Arc<dyn Grid>,
    clock: Arc<dyn Timestamper>,
    state: RwLock<Option<FactoryState>>,
}

impl std::fmt::Debug for RegionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionFactory")
            .field("member", &self.grid.member_id())
            .field("started", &self.is_started())
            .finish()
    }
}

impl RegionFactory {
    pub fn new(grid: Arc<dyn Grid>, clock: Arc<dyn Timestamper>) -> Self {
        Self {
            grid,
            clock,
            state: RwLock::new(None),
        }
    }

    /// Factory on the wall clock.
    pub fn with_system_clock(grid: Arc<dyn Grid>) -> Self {
        Self::new(grid, SystemTimestamper::shared())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Option<FactoryState>> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_started(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Start from ORM properties (`gridcache.*` keys).
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(&self, properties: &HashMap<String, String>) -> CacheResult<()> {
        let config = GridCacheConfig::from_properties(properties)?;
        self.start_with_config(config)
    }

    /// Start with an explicit configuration. Starting twice is a no-op.
    pub fn start_with_config(&self, config: GridCacheConfig) -> CacheResult<()> {
        config.validate()?;
        let mut state = self.write_state();
        if state.is_some() {
            warn!("Region factory already started");
            return Ok(());
        }

        let cleanup = Arc::new(CleanupRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cleanup_handle = tokio::spawn(cleanup_task(
            cleanup.clone(),
            config.cleanup_interval,
            shutdown_rx,
        ));
        let status = config.status_name.as_ref().map(|name| {
            Arc::new(RegionStatus::new(
                name.clone(),
                config.status_refresh,
                self.clock.clone(),
            ))
        });

        info!(
            member_id = %self.grid.member_id(),
            lock_timeout_ms = config.lock_timeout.as_millis() as u64,
            operation_timeout_ms = config.operation_timeout.as_millis() as u64,
            region_prefix = config.region_prefix.as_deref().unwrap_or(""),
            status = status.is_some(),
            "Region factory started"
        );

        *state = Some(FactoryState {
            config,
            domain_regions: BTreeMap::new(),
            query_regions: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            cleanup,
            shutdown_tx,
            cleanup_handle,
            status,
        });
        Ok(())
    }

    /// Stop the cleanup task, destroy every region and wait for their
    /// invalidation listeners to exit.
    pub async fn stop(&self) {
        let Some(state) = self.write_state().take() else {
            return;
        };

        let _ = state.shutdown_tx.send(true);
        match state.cleanup_handle.await {
            Ok(metrics) => {
                let snapshot = metrics.snapshot();
                debug!(cleanup_cycles = snapshot.cleanup_cycles, "Cleanup task joined");
            }
            Err(err) => warn!(error = %err, "Cleanup task ended abnormally"),
        }

        let listeners: Vec<JoinHandle<()>> = state
            .domain_regions
            .values()
            .map(|r| r.cache().destroy())
            .chain(state.query_regions.values().map(|r| r.cache().destroy()))
            .chain(state.timestamps.values().map(|r| r.destroy()))
            .flatten()
            .collect();
        let mut joined = 0usize;
        for handle in listeners {
            match handle.await {
                Ok(()) => joined += 1,
                Err(err) => warn!(error = %err, "Invalidation listener ended abnormally"),
            }
        }
        debug!(listeners = joined, "Invalidation listeners joined");

        if let Some(status) = &state.status {
            status.unregister();
        }

        info!(
            domain_regions = state.domain_regions.len(),
            query_regions = state.query_regions.len(),
            "Region factory stopped"
        );
    }

    pub fn config(&self) -> CacheResult<GridCacheConfig> {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|s| s.config.clone())
            .ok_or_else(|| ConfigError::NotStarted.into())
    }

    /// Next value of the cluster clock shared by every region.
    pub fn next_timestamp(&self) -> ClusterTime {
        self.clock.next_timestamp()
    }

    pub fn clock(&self) -> &Arc<dyn Timestamper> {
        &self.clock
    }

    pub fn grid(&self) -> &Arc<dyn Grid> {
        &self.grid
    }

    /// The status view, when a status name is configured.
    pub fn status(&self) -> Option<Arc<RegionStatus>> {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(|s| s.status.clone())
    }

    // ------------------------------------------------------------------------
    // Region builders (must be called inside a Tokio runtime)
    // ------------------------------------------------------------------------

    pub fn build_entity_region(
        &self,
        name: &str,
        description: CacheDataDescription,
    ) -> CacheResult<Arc<DomainDataRegion>> {
        self.build_domain_region(name, RegionKind::Entity, description)
    }

    pub fn build_collection_region(
        &self,
        name: &str,
        description: CacheDataDescription,
    ) -> CacheResult<Arc<DomainDataRegion>> {
        self.build_domain_region(name, RegionKind::Collection, description)
    }

    pub fn build_natural_id_region(
        &self,
        name: &str,
        description: CacheDataDescription,
    ) -> CacheResult<Arc<DomainDataRegion>> {
        self.build_domain_region(name, RegionKind::NaturalId, description)
    }

    /// Build (or return the already built) data region `name`.
    pub fn build_domain_region(
        &self,
        name: &str,
        kind: RegionKind,
        description: CacheDataDescription,
    ) -> CacheResult<Arc<DomainDataRegion>> {
        if !kind.is_data_region() {
            return Err(ConfigError::InvalidValue {
                field: "kind".to_string(),
                value: format!("{:?}", kind),
                reason: "not a data region".to_string(),
            }
            .into());
        }

        let mut guard = self.write_state();
        let state = guard.as_mut().ok_or(ConfigError::NotStarted)?;
        let qualified = state.config.qualify(name);
        if let Some(existing) = state.domain_regions.get(&qualified) {
            return Ok(existing.clone());
        }

        let cache = RegionCache::open(
            qualified.clone(),
            kind,
            description,
            self.grid.as_ref(),
            self.clock.clone(),
            &state.config,
        );
        state.cleanup.register(cache.clone());
        if let Some(status) = &state.status {
            status.register_entity_region(cache.clone());
        }
        let region = Arc::new(DomainDataRegion::new(cache));
        state.domain_regions.insert(qualified.clone(), region.clone());
        info!(region = %qualified, kind = ?kind, "Region built");
        Ok(region)
    }

    /// Strategy of `access_type` for `region`, built once per pair.
    pub fn build_access_strategy(
        &self,
        region: &DomainDataRegion,
        access_type: AccessType,
    ) -> CacheResult<Arc<dyn AccessDelegate>> {
        if !self.is_started() {
            return Err(ConfigError::NotStarted.into());
        }
        Ok(region.access_strategy(access_type)?)
    }

    /// Build the query-results region `name`, checked against the default
    /// timestamps region.
    pub fn build_query_results_region(&self, name: &str) -> CacheResult<Arc<QueryResultsRegion>> {
        let timestamps = self.build_timestamps_region(DEFAULT_TIMESTAMPS_REGION)?;

        let mut guard = self.write_state();
        let state = guard.as_mut().ok_or(ConfigError::NotStarted)?;
        let qualified = state.config.qualify(name);
        if let Some(existing) = state.query_regions.get(&qualified) {
            return Ok(existing.clone());
        }

        let cache = RegionCache::open(
            qualified.clone(),
            RegionKind::QueryResults,
            CacheDataDescription::mutable(),
            self.grid.as_ref(),
            self.clock.clone(),
            &state.config,
        );
        state.cleanup.register(cache.clone());
        if let Some(status) = &state.status {
            status.register_query_region(cache.clone());
        }
        let region = Arc::new(QueryResultsRegion::new(cache, timestamps));
        state.query_regions.insert(qualified.clone(), region.clone());
        info!(region = %qualified, "Query results region built");
        Ok(region)
    }

    pub fn build_timestamps_region(&self, name: &str) -> CacheResult<Arc<TimestampsRegionCache>> {
        let mut guard = self.write_state();
        let state = guard.as_mut().ok_or(ConfigError::NotStarted)?;
        let qualified = state.config.qualify(name);
        if let Some(existing) = state.timestamps.get(&qualified) {
            return Ok(existing.clone());
        }

        let region = TimestampsRegionCache::open(
            qualified.clone(),
            self.grid.as_ref(),
            self.clock.clone(),
            &state.config,
        );
        state.cleanup.register(region.clone());
        state.timestamps.insert(qualified.clone(), region.clone());
        info!(region = %qualified, "Timestamps region built");
        Ok(region)
    }
}
