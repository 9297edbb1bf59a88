//! Property-Based Tests for Cache Consistency
//!
//! Randomized operation sequences against regions and strategies on an
//! in-memory cluster, checked against a simple model of what the cache
//! must hold afterwards.

use gridcache_access::{AccessDelegate, NonStrictReadWriteAccess, SessionContext};
use gridcache_core::{new_id, RegionConfig};
use gridcache_storage::{InvalidationEvent, NearCache};
use gridcache_test_utils::fixtures::{manual_clock, open_region, test_config};
use gridcache_test_utils::generators::{arb_cache_value, arb_entity_key, arb_table_name};
use gridcache_test_utils::{
    CacheDataDescription, CacheEntry, CacheKey, InMemoryCluster, TimestampsRegionCache,
    Timestamper, Version,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> Result<tokio::runtime::Runtime, TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

// ============================================================================
// VERSIONING
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// **Property: Monotonic Versions**
    ///
    /// A put succeeds only with a strictly newer version, and a read after
    /// any sequence of puts returns the value written with the highest
    /// version (the first one written, among equals).
    #[test]
    fn prop_newer_version_wins(
        key in arb_entity_key(),
        versions in prop::collection::vec(0i64..20, 1..24),
    ) {
        let rt = runtime()?;
        rt.block_on(async {
            let clock = manual_clock();
            let cluster = InMemoryCluster::new();
            let region = open_region(&cluster, "app.Versioned", CacheDataDescription::versioned(), clock.clone());

            let mut expected: Option<(i64, usize)> = None;
            for (i, v) in versions.iter().enumerate() {
                let outcome = region
                    .put(key.clone(), json!(i), clock.next_timestamp(), Some(Version::Number(*v)))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let newer = expected.map_or(true, |(current, _)| *v > current);
                prop_assert_eq!(outcome.is_written(), newer, "version {} after {:?}", v, expected);
                if newer {
                    expected = Some((*v, i));
                }
            }

            let read = region
                .read(&key, i64::MAX)
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(read, expected.map(|(_, i)| json!(i)));
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// ============================================================================
// SOFT-LOCK TOKENS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// **Property: Lock Token Ownership**
    ///
    /// For any interleaving of lock acquisitions (joining a live marker or
    /// taking over an expired one) and unlocks in any order, an unlock
    /// changes the entry exactly when its token matches the marker
    /// currently installed.
    #[test]
    fn prop_only_matching_token_unlocks(
        expire_before in prop::collection::vec(any::<bool>(), 1..8),
        order_seed in prop::collection::vec(any::<prop::sample::Index>(), 8),
    ) {
        let rt = runtime()?;
        rt.block_on(async {
            let clock = manual_clock();
            let cluster = InMemoryCluster::new();
            let region = open_region(&cluster, "app.Locked", CacheDataDescription::versioned(), clock.clone());
            let key = CacheKey::entity("Locked", 1);
            let fail = |e: gridcache_test_utils::GridCacheError| TestCaseError::fail(e.to_string());

            let mut tokens = Vec::new();
            for expire in &expire_before {
                if *expire {
                    clock.advance(region.lock_timeout() + Duration::from_millis(1));
                }
                tokens.push(region.try_lock(&key, new_id(), None).await.map_err(fail)?);
            }

            let mut remaining = tokens;
            let mut step = 0;
            while !remaining.is_empty() {
                let token = remaining.remove(order_seed[step % order_seed.len()].index(remaining.len()));
                step += 1;

                let before = region.get(&key).await.map_err(fail)?.into_entry();
                let matches = matches!(&before, Some(CacheEntry::Locked(m)) if m.matches(&token));
                let changed = region.unlock(&key, &token).await.map_err(fail)?;
                prop_assert_eq!(changed, matches);

                let after = region.get(&key).await.map_err(fail)?.into_entry();
                if !matches {
                    prop_assert_eq!(after, before);
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// ============================================================================
// NONSTRICT READ-WRITE
// ============================================================================

#[derive(Debug, Clone)]
enum NonstrictOp {
    Load(serde_json::Value),
    AfterUpdate(serde_json::Value),
}

fn nonstrict_op() -> impl Strategy<Value = NonstrictOp> {
    prop_oneof![
        arb_cache_value().prop_map(NonstrictOp::Load),
        arb_cache_value().prop_map(NonstrictOp::AfterUpdate),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// **Property: Nonstrict Updates Remove**
    ///
    /// After any `after_update` the entry is absent, whatever value the
    /// update carried, until the next load caches it again.
    #[test]
    fn prop_nonstrict_after_update_leaves_entry_absent(
        key in arb_entity_key(),
        ops in prop::collection::vec(nonstrict_op(), 1..16),
    ) {
        let rt = runtime()?;
        rt.block_on(async {
            let clock = manual_clock();
            let cluster = InMemoryCluster::new();
            let region = open_region(&cluster, "app.Loose", CacheDataDescription::versioned(), clock.clone());
            let access = NonStrictReadWriteAccess::new(region.clone());

            for op in ops {
                let session = SessionContext::open(clock.as_ref());
                match op {
                    NonstrictOp::Load(value) => {
                        access
                            .put_from_load(&session, key.clone(), value.clone(), session.tx_timestamp(), None, false)
                            .await;
                        let reader = SessionContext::open(clock.as_ref());
                        prop_assert_eq!(access.get(&reader, &key, reader.tx_timestamp()).await, Some(value));
                    }
                    NonstrictOp::AfterUpdate(value) => {
                        access
                            .after_update(&session, key.clone(), value, Some(Version::Number(1)), None)
                            .await
                            .map_err(|e| TestCaseError::fail(e.to_string()))?;
                        let lookup = region
                            .get(&key)
                            .await
                            .map_err(|e| TestCaseError::fail(e.to_string()))?;
                        prop_assert!(lookup.entry().is_none());
                        prop_assert_eq!(cluster.map_len("app.Loose"), 0);
                    }
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// ============================================================================
// TIMESTAMPS REGION
// ============================================================================

#[derive(Debug, Clone)]
enum TableOp {
    PreInvalidate(usize),
    Invalidate(usize),
    Query(usize),
    Tick(u64),
}

fn table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        2 => (0usize..3).prop_map(TableOp::PreInvalidate),
        2 => (0usize..3).prop_map(TableOp::Invalidate),
        3 => (0usize..3).prop_map(TableOp::Query),
        1 => (1u64..5_000).prop_map(TableOp::Tick),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// **Property: No Stale Query Results**
    ///
    /// A query started at T is considered up to date for a table exactly
    /// when the table's last update (a pending modification counting as an
    /// update until it lapses) is strictly before T.
    #[test]
    fn prop_query_never_uses_results_older_than_last_update(
        tables in prop::collection::vec(arb_table_name(), 3),
        ops in prop::collection::vec(table_op(), 1..32),
    ) {
        let rt = runtime()?;
        rt.block_on(async {
            let clock = manual_clock();
            let cluster = InMemoryCluster::new();
            let timestamps = TimestampsRegionCache::open(
                "timestamps",
                cluster.join().as_ref(),
                clock.clone(),
                &test_config(),
            );
            let fail = |e: gridcache_test_utils::GridCacheError| TestCaseError::fail(e.to_string());
            let mut queries: Vec<(i64, String)> = Vec::new();

            for op in ops {
                match op {
                    TableOp::PreInvalidate(t) => {
                        timestamps.pre_invalidate(&[tables[t].clone()], None).await.map_err(fail)?;
                    }
                    TableOp::Invalidate(t) => {
                        timestamps.invalidate(&[tables[t].clone()], None).await.map_err(fail)?;
                    }
                    TableOp::Query(t) => queries.push((clock.next_timestamp(), tables[t].clone())),
                    TableOp::Tick(ms) => {
                        clock.advance(Duration::from_millis(ms));
                    }
                }

                for (started, table) in &queries {
                    let last = timestamps.last_update(table).await.map_err(fail)?;
                    let fresh = timestamps.is_up_to_date(&[table.clone()], *started).await;
                    match last {
                        Some(last) if last >= *started => prop_assert!(!fresh),
                        _ => prop_assert!(fresh),
                    }
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// ============================================================================
// REDELIVERY
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// **Property: Idempotent Invalidation**
    ///
    /// Delivering every event twice leaves a near-cache in the same state
    /// as delivering each once.
    #[test]
    fn prop_redelivery_is_idempotent(
        keys in prop::collection::btree_set(arb_entity_key(), 1..16),
        targets in prop::collection::vec(prop::option::weighted(0.9, arb_entity_key()), 1..12),
    ) {
        let clock: Arc<dyn Timestamper> = manual_clock();
        let once = NearCache::new(RegionConfig::default(), clock.clone());
        let twice = NearCache::new(RegionConfig::default(), clock.clone());
        for key in &keys {
            once.put(key.clone(), json!(key.to_string()));
            twice.put(key.clone(), json!(key.to_string()));
        }

        let origin = new_id();
        let events: Vec<InvalidationEvent> = targets
            .into_iter()
            .map(|target| match target {
                Some(key) => InvalidationEvent::key("app.Redelivered", key, origin, clock.now()),
                None => InvalidationEvent::evict_all("app.Redelivered", origin, clock.now()),
            })
            .collect();

        for event in &events {
            event.apply(&once);
        }
        for event in &events {
            event.apply(&twice);
            event.apply(&twice);
        }

        let snapshot = |cache: &NearCache<serde_json::Value>| -> BTreeMap<String, Option<serde_json::Value>> {
            cache
                .keys()
                .into_iter()
                .map(|k| (k.to_string(), cache.get(&k)))
                .collect()
        };
        prop_assert_eq!(snapshot(&once), snapshot(&twice));
    }
}
