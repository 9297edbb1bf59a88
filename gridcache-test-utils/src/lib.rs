//! gridcache Test Utilities
//!
//! Shared test infrastructure for the gridcache workspace:
//! - Proptest generators for keys, versions, values and access types
//! - Fixtures for clusters, factories and sessions
//! - Custom assertions for gridcache error variants
//! - [`OrmHarness`]: drives regions the way an ORM session would
//! - [`InvalidationCounter`]: counts events published per region topic

pub mod counter;
pub mod harness;

pub use counter::InvalidationCounter;
pub use harness::{
    DummyEntity, DummyProperty, Loaded, OrmHarness, ENTITY_REGION, ENTITY_TABLE, NAMES_QUERY,
    PROPERTIES_COLLECTION_REGION, PROPERTY_REGION, PROPERTY_TABLE,
};

// Re-export core types for convenience
pub use gridcache_core::{
    AccessType, CacheDataDescription, CacheEntry, CacheKey, CacheLookup, CacheResult, CacheValue,
    ClusterTime, ConfigError, GridCacheConfig, GridCacheError, ManualTimestamper, RegionKind,
    SoftLock, Timestamper, Version, WriteOutcome,
};
pub use gridcache_storage::{InMemoryCluster, RegionCache, TimestampsRegionCache};

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes.
///
/// Returns whether the condition was met. Invalidation listeners run as
/// separate tasks, so cross-member assertions wait for them with this.
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating gridcache types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    pub fn arb_entity_name() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["Person", "Order", "Invoice", "Account"]).prop_map(String::from)
    }

    pub fn arb_entity_key() -> impl Strategy<Value = CacheKey> {
        (arb_entity_name(), 0u64..64).prop_map(|(entity, id)| CacheKey::entity(entity, id))
    }

    pub fn arb_collection_key() -> impl Strategy<Value = CacheKey> {
        (arb_entity_name(), 0u64..64)
            .prop_map(|(entity, owner)| CacheKey::collection(format!("{}.children", entity), owner))
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        prop_oneof![
            3 => arb_entity_key(),
            1 => arb_collection_key(),
            1 => "[a-z]{3,12}".prop_map(|v| CacheKey::natural_id("Person", [v])),
            1 => "from [A-Z][a-z]{2,8}".prop_map(CacheKey::query),
        ]
    }

    pub fn arb_version() -> impl Strategy<Value = Version> {
        (0i64..1_000).prop_map(Version::Number)
    }

    pub fn arb_optional_version() -> impl Strategy<Value = Option<Version>> {
        prop::option::of(arb_version())
    }

    pub fn arb_cache_value() -> impl Strategy<Value = CacheValue> {
        prop_oneof![
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 ]{0,24}".prop_map(|s| json!(s)),
            (any::<u32>(), "[a-z]{1,8}").prop_map(|(id, name)| json!({"id": id, "name": name})),
        ]
    }

    pub fn arb_access_type() -> impl Strategy<Value = AccessType> {
        prop::sample::select(AccessType::ALL.to_vec())
    }

    /// Access types that cache updated state (everything but read-only).
    pub fn arb_mutable_access_type() -> impl Strategy<Value = AccessType> {
        prop::sample::select(vec![
            AccessType::NonstrictReadWrite,
            AccessType::ReadWrite,
            AccessType::Transactional,
        ])
    }

    pub fn arb_table_name() -> impl Strategy<Value = String> {
        "[a-z]{3,10}(_[a-z]{3,8})?"
    }

    /// Strictly increasing version sequence of length `1..=max`.
    pub fn arb_version_sequence(max: usize) -> impl Strategy<Value = Vec<i64>> {
        prop::collection::vec(1i64..10, 1..=max).prop_map(|steps| {
            steps
                .into_iter()
                .scan(0i64, |acc, step| {
                    *acc += step;
                    Some(*acc)
                })
                .collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;
    use gridcache_access::{RegionFactory, SessionContext, Transaction};
    use gridcache_core::new_id;
    use std::sync::Arc;

    /// Start time of every manual test clock.
    pub const CLOCK_START: ClusterTime = 1_700_000_000_000;

    pub fn manual_clock() -> Arc<ManualTimestamper> {
        ManualTimestamper::shared(CLOCK_START)
    }

    /// Configuration with short timeouts suited to tests.
    ///
    /// Topics are sized so bursty scenarios never lag a listener.
    pub fn test_config() -> GridCacheConfig {
        GridCacheConfig::new()
            .with_lock_timeout(Duration::from_secs(2))
            .with_operation_timeout(Duration::from_millis(250))
            .with_cleanup_interval(Duration::from_secs(60))
            .with_topic_capacity(4096)
    }

    /// Cluster built from [`test_config`].
    pub fn cluster() -> InMemoryCluster {
        InMemoryCluster::from_config(&test_config())
    }

    /// Started factory for a fresh member of `cluster`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn started_factory(
        cluster: &InMemoryCluster,
        clock: Arc<ManualTimestamper>,
        config: GridCacheConfig,
    ) -> CacheResult<Arc<RegionFactory>> {
        let factory = Arc::new(RegionFactory::new(cluster.join(), clock));
        factory.start_with_config(config)?;
        Ok(factory)
    }

    /// Region opened directly on a new member of `cluster`.
    pub fn open_region(
        cluster: &InMemoryCluster,
        name: &str,
        description: CacheDataDescription,
        clock: Arc<ManualTimestamper>,
    ) -> Arc<RegionCache> {
        RegionCache::open(
            name,
            RegionKind::Entity,
            description,
            cluster.join().as_ref(),
            clock,
            &test_config(),
        )
    }

    /// Session whose transaction starts now.
    pub fn session(clock: &ManualTimestamper) -> SessionContext {
        SessionContext::open(clock)
    }

    /// Session bound to a freshly begun transaction.
    pub fn transactional_session(clock: Arc<ManualTimestamper>) -> (SessionContext, Arc<Transaction>) {
        let session_id = new_id();
        let tx = Transaction::begin(session_id, clock);
        (SessionContext::new(session_id, 0).with_transaction(tx.clone()), tx)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for gridcache results.

    use super::*;
    use gridcache_core::{AccessError, BackendError};

    /// Assert that a CacheResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a CacheResult is Err.
    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that a CacheResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(GridCacheError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult rejects an access type for its region kind.
    #[track_caller]
    pub fn assert_unsupported_access<T: std::fmt::Debug>(
        result: &CacheResult<T>,
        access_type: AccessType,
    ) {
        match result {
            Err(GridCacheError::Config(ConfigError::UnsupportedAccessType {
                access_type: got,
                ..
            })) => assert_eq!(*got, access_type, "Wrong access type in error"),
            other => panic!("Expected UnsupportedAccessType({}), got: {:?}", access_type, other),
        }
    }

    /// Assert that a CacheResult is a read-only violation.
    #[track_caller]
    pub fn assert_unsupported_mutation<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(GridCacheError::Access(AccessError::UnsupportedMutation { .. })) => {}
            other => panic!("Expected UnsupportedMutation, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is a transient backend failure.
    #[track_caller]
    pub fn assert_backend_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(GridCacheError::Backend(
                BackendError::Unavailable { .. } | BackendError::Timeout { .. },
            )) => {}
            other => panic!("Expected Backend error, got: {:?}", other),
        }
    }

    /// Assert that a lookup found a value equal to `expected`.
    #[track_caller]
    pub fn assert_cached_value(lookup: &CacheLookup, expected: &CacheValue) {
        match lookup.entry() {
            Some(CacheEntry::Value(v)) => assert_eq!(&v.value, expected, "Wrong cached value"),
            other => panic!("Expected cached value {}, got: {:?}", expected, other),
        }
    }

    /// Assert that a lookup found a soft-lock marker.
    #[track_caller]
    pub fn assert_locked(lookup: &CacheLookup) {
        match lookup.entry() {
            Some(entry) if entry.is_locked() => {}
            other => panic!("Expected lock marker, got: {:?}", other),
        }
    }
}
