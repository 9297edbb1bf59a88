//! ORM session simulator.
//!
//! [`OrmHarness`] plays the part of an ORM using the cache: a small table of
//! `DummyEntity` rows, each owning `DummyProperty` rows through a
//! `properties` collection, kept in an in-memory "database". Every write goes
//! through the access strategy hooks in the order an ORM calls them, and
//! through the timestamps region (pre-invalidation before the change,
//! invalidation after commit) for each affected table.

use gridcache_access::{
    AccessDelegate, DomainDataRegion, QueryResultsRegion, RegionFactory, SessionContext,
    Transaction, DEFAULT_QUERY_RESULTS_REGION, DEFAULT_TIMESTAMPS_REGION,
};
use gridcache_core::{
    new_id, AccessType, CacheDataDescription, CacheKey, CacheResult, CacheValue, SoftLock,
    Timestamper, Version,
};
use gridcache_storage::TimestampsRegionCache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::counter::InvalidationCounter;

pub const ENTITY_REGION: &str = "DummyEntity";
pub const PROPERTY_REGION: &str = "DummyProperty";
pub const PROPERTIES_COLLECTION_REGION: &str = "DummyEntity.properties";

pub const ENTITY_TABLE: &str = "dummy_entity";
pub const PROPERTY_TABLE: &str = "dummy_property";

/// Query whose results are kept in the query cache.
pub const NAMES_QUERY: &str = "select e.name from DummyEntity e order by e.id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyEntity {
    pub id: u64,
    pub name: String,
    pub version: i64,
    pub properties: Vec<u64>,
}

impl DummyEntity {
    fn state(&self) -> CacheValue {
        json!({
            "id": self.id,
            "name": self.name,
            "version": self.version,
            "properties": self.properties,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyProperty {
    pub id: u64,
    pub key: String,
    pub version: i64,
    pub entity: u64,
}

impl DummyProperty {
    fn state(&self) -> CacheValue {
        json!({
            "id": self.id,
            "key": self.key,
            "version": self.version,
            "entity": self.entity,
        })
    }
}

/// A value and whether it was served by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded<T> {
    pub value: T,
    pub from_cache: bool,
}

#[derive(Debug, Default)]
struct Database {
    entities: BTreeMap<u64, DummyEntity>,
    properties: BTreeMap<u64, DummyProperty>,
    next_entity: u64,
    next_property: u64,
}

fn entity_key(id: u64) -> CacheKey {
    CacheKey::entity(ENTITY_REGION, id)
}

fn property_key(id: u64) -> CacheKey {
    CacheKey::entity(PROPERTY_REGION, id)
}

fn collection_key(owner: u64) -> CacheKey {
    CacheKey::collection(PROPERTIES_COLLECTION_REGION, owner)
}

fn spaces(tables: &[&str]) -> Vec<String> {
    tables.iter().map(|t| t.to_string()).collect()
}

/// ORM-shaped driver over one member's regions.
pub struct OrmHarness {
    factory: Arc<RegionFactory>,
    access_type: AccessType,
    entities: Arc<dyn AccessDelegate>,
    properties: Arc<dyn AccessDelegate>,
    collections: Arc<dyn AccessDelegate>,
    queries: Arc<QueryResultsRegion>,
    timestamps: Arc<TimestampsRegionCache>,
    database: Arc<Mutex<Database>>,
}

impl std::fmt::Debug for OrmHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrmHarness")
            .field("access_type", &self.access_type)
            .field("entities", &self.entities.region().name())
            .finish()
    }
}

impl OrmHarness {
    /// Build the regions on `factory` with an empty database.
    ///
    /// The factory must be started. Must be called inside a Tokio runtime.
    pub fn start(factory: Arc<RegionFactory>, access_type: AccessType) -> CacheResult<Self> {
        Self::attach(factory, access_type, Arc::new(Mutex::new(Database::default())))
    }

    /// Same ORM on another member: new regions on `factory`, same database.
    pub fn join(&self, factory: Arc<RegionFactory>) -> CacheResult<Self> {
        Self::attach(factory, self.access_type, self.database.clone())
    }

    fn attach(
        factory: Arc<RegionFactory>,
        access_type: AccessType,
        database: Arc<Mutex<Database>>,
    ) -> CacheResult<Self> {
        let strategy =
            |region: Arc<DomainDataRegion>| factory.build_access_strategy(&region, access_type);
        let entities = strategy(
            factory.build_entity_region(ENTITY_REGION, CacheDataDescription::versioned())?,
        )?;
        let properties = strategy(
            factory.build_entity_region(PROPERTY_REGION, CacheDataDescription::versioned())?,
        )?;
        let collections = strategy(factory.build_collection_region(
            PROPERTIES_COLLECTION_REGION,
            CacheDataDescription::mutable(),
        )?)?;
        let queries = factory.build_query_results_region(DEFAULT_QUERY_RESULTS_REGION)?;
        let timestamps = factory.build_timestamps_region(DEFAULT_TIMESTAMPS_REGION)?;

        Ok(Self {
            factory,
            access_type,
            entities,
            properties,
            collections,
            queries,
            timestamps,
            database,
        })
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.database.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn clock(&self) -> &Arc<dyn Timestamper> {
        self.factory.clock()
    }

    /// Open a session, with a transaction when the strategy stages writes.
    fn begin(&self) -> (SessionContext, Option<Arc<Transaction>>) {
        if self.access_type == AccessType::Transactional {
            let session_id = new_id();
            let tx = Transaction::begin(session_id, self.clock().clone());
            let session = SessionContext::new(session_id, 0).with_transaction(tx.clone());
            (session, Some(tx))
        } else {
            (SessionContext::open(self.clock().as_ref()), None)
        }
    }

    async fn commit(&self, tx: Option<Arc<Transaction>>) {
        if let Some(tx) = tx {
            let summary = tx.commit().await;
            debug!(applied = summary.applied, failed = summary.failed, "Harness transaction committed");
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn factory(&self) -> &Arc<RegionFactory> {
        &self.factory
    }

    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    pub fn entities(&self) -> &Arc<dyn AccessDelegate> {
        &self.entities
    }

    pub fn properties(&self) -> &Arc<dyn AccessDelegate> {
        &self.properties
    }

    pub fn collections(&self) -> &Arc<dyn AccessDelegate> {
        &self.collections
    }

    pub fn queries(&self) -> &Arc<QueryResultsRegion> {
        &self.queries
    }

    pub fn timestamps(&self) -> &Arc<TimestampsRegionCache> {
        &self.timestamps
    }

    pub fn entity_region_name(&self) -> &str {
        self.entities.region().name()
    }

    pub fn property_region_name(&self) -> &str {
        self.properties.region().name()
    }

    pub fn collection_region_name(&self) -> &str {
        self.collections.region().name()
    }

    pub fn timestamps_region_name(&self) -> &str {
        self.timestamps.name()
    }

    /// Counter watching all four regions of this harness from now on.
    pub fn counter(&self) -> InvalidationCounter {
        InvalidationCounter::watching(
            self.factory.grid().as_ref(),
            [
                self.entity_region_name(),
                self.property_region_name(),
                self.collection_region_name(),
                self.timestamps_region_name(),
            ],
        )
    }

    /// Row as stored in the database.
    pub fn entity_row(&self, id: u64) -> Option<DummyEntity> {
        self.db().entities.get(&id).cloned()
    }

    pub fn entity_ids(&self) -> Vec<u64> {
        self.db().entities.keys().copied().collect()
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Insert `count` entities owning `properties_each` properties, in one
    /// transaction. Returns the new entity ids.
    pub async fn insert_dummy_entities(
        &self,
        count: usize,
        properties_each: usize,
    ) -> CacheResult<Vec<u64>> {
        let (session, tx) = self.begin();
        let tables = spaces(&[ENTITY_TABLE, PROPERTY_TABLE]);
        self.timestamps
            .pre_invalidate(&tables, Some(session.id()))
            .await?;

        let rows: Vec<(DummyEntity, Vec<DummyProperty>)> = {
            let mut db = self.db();
            let mut rows = Vec::with_capacity(count);
            for _ in 0..count {
                let id = db.next_entity;
                db.next_entity += 1;
                let mut owned = Vec::with_capacity(properties_each);
                for n in 0..properties_each {
                    let property = DummyProperty {
                        id: db.next_property,
                        key: format!("key-{}", n),
                        version: 0,
                        entity: id,
                    };
                    db.next_property += 1;
                    db.properties.insert(property.id, property.clone());
                    owned.push(property);
                }
                let entity = DummyEntity {
                    id,
                    name: format!("dummy:{}", id),
                    version: 0,
                    properties: owned.iter().map(|p| p.id).collect(),
                };
                db.entities.insert(id, entity.clone());
                rows.push((entity, owned));
            }
            rows
        };

        for (entity, owned) in &rows {
            for property in owned {
                let version = Version::Number(property.version);
                self.properties
                    .insert(&session, &property_key(property.id), &property.state(), Some(&version))
                    .await?;
            }
            let version = Version::Number(entity.version);
            self.entities
                .insert(&session, &entity_key(entity.id), &entity.state(), Some(&version))
                .await?;
        }
        self.commit(tx).await;

        for (entity, owned) in rows.iter() {
            for property in owned {
                self.properties
                    .after_insert(
                        &session,
                        property_key(property.id),
                        property.state(),
                        Some(Version::Number(property.version)),
                    )
                    .await?;
            }
            self.entities
                .after_insert(
                    &session,
                    entity_key(entity.id),
                    entity.state(),
                    Some(Version::Number(entity.version)),
                )
                .await?;
        }
        self.timestamps.invalidate(&tables, Some(session.id())).await?;

        Ok(rows.into_iter().map(|(entity, _)| entity.id).collect())
    }

    /// Rename one entity. Returns false if it does not exist.
    pub async fn update_dummy_entity_name(&self, id: u64, name: &str) -> CacheResult<bool> {
        let Some(current) = self.entity_row(id) else {
            return Ok(false);
        };
        let (session, tx) = self.begin();
        let tables = spaces(&[ENTITY_TABLE]);
        let key = entity_key(id);

        let lock = self
            .entities
            .lock_item(&session, &key, Some(Version::Number(current.version)))
            .await?;
        self.timestamps
            .pre_invalidate(&tables, Some(session.id()))
            .await?;

        let updated = DummyEntity {
            name: name.to_string(),
            version: current.version + 1,
            ..current
        };
        self.db().entities.insert(id, updated.clone());
        let version = Version::Number(updated.version);
        self.entities
            .update(&session, &key, &updated.state(), Some(&version))
            .await?;
        self.commit(tx).await;

        self.entities
            .after_update(&session, key, updated.state(), Some(version), lock.as_ref())
            .await?;
        self.timestamps.invalidate(&tables, Some(session.id())).await?;
        Ok(true)
    }

    /// Delete one entity with its properties. Returns false if it does not
    /// exist.
    pub async fn delete_dummy_entity(&self, id: u64) -> CacheResult<bool> {
        let Some(entity) = self.entity_row(id) else {
            return Ok(false);
        };
        let owned: Vec<DummyProperty> = {
            let db = self.db();
            entity
                .properties
                .iter()
                .filter_map(|p| db.properties.get(p).cloned())
                .collect()
        };
        let (session, tx) = self.begin();
        let tables = spaces(&[ENTITY_TABLE, PROPERTY_TABLE]);

        let mut locks: Vec<(&Arc<dyn AccessDelegate>, CacheKey, Option<SoftLock>)> = Vec::new();
        for property in &owned {
            let key = property_key(property.id);
            let lock = self
                .properties
                .lock_item(&session, &key, Some(Version::Number(property.version)))
                .await?;
            self.properties.remove(&session, &key).await?;
            locks.push((&self.properties, key, lock));
        }
        let key = collection_key(id);
        let lock = self.collections.lock_item(&session, &key, None).await?;
        self.collections.remove(&session, &key).await?;
        locks.push((&self.collections, key, lock));

        let key = entity_key(id);
        let lock = self
            .entities
            .lock_item(&session, &key, Some(Version::Number(entity.version)))
            .await?;
        self.entities.remove(&session, &key).await?;
        locks.push((&self.entities, key, lock));

        self.timestamps
            .pre_invalidate(&tables, Some(session.id()))
            .await?;
        {
            let mut db = self.db();
            for property in &owned {
                db.properties.remove(&property.id);
            }
            db.entities.remove(&id);
        }
        self.commit(tx).await;

        for (delegate, key, lock) in &locks {
            delegate.unlock_item(&session, key, lock.as_ref()).await?;
        }
        self.timestamps.invalidate(&tables, Some(session.id())).await?;
        Ok(true)
    }

    /// Bulk rename of every entity, as an HQL update statement would do it.
    pub async fn rename_all_entities(&self, name: &str) -> CacheResult<usize> {
        let (session, tx) = self.begin();
        let tables = spaces(&[ENTITY_TABLE]);
        let lock = self.entities.lock_region(&session).await?;
        self.timestamps
            .pre_invalidate(&tables, Some(session.id()))
            .await?;

        let renamed = {
            let mut db = self.db();
            for entity in db.entities.values_mut() {
                entity.name = name.to_string();
                entity.version += 1;
            }
            db.entities.len()
        };
        self.commit(tx).await;
        self.entities.unlock_region(&session, lock.as_ref()).await?;
        self.timestamps.invalidate(&tables, Some(session.id())).await?;
        Ok(renamed)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Load an entity through the cache, caching it on a miss.
    pub async fn load_dummy_entity(&self, id: u64) -> Option<Loaded<DummyEntity>> {
        let session = SessionContext::open(self.clock().as_ref());
        let key = entity_key(id);
        if let Some(cached) = self.entities.get(&session, &key, session.tx_timestamp()).await {
            if let Ok(value) = serde_json::from_value(cached) {
                return Some(Loaded {
                    value,
                    from_cache: true,
                });
            }
        }

        let row = self.entity_row(id)?;
        self.entities
            .put_from_load(
                &session,
                key,
                row.state(),
                session.tx_timestamp(),
                Some(Version::Number(row.version)),
                false,
            )
            .await;
        Some(Loaded {
            value: row,
            from_cache: false,
        })
    }

    /// Load every entity through the cache.
    pub async fn load_dummy_entities(&self) -> Vec<Loaded<DummyEntity>> {
        let mut loaded = Vec::new();
        for id in self.entity_ids() {
            if let Some(entity) = self.load_dummy_entity(id).await {
                loaded.push(entity);
            }
        }
        loaded
    }

    /// Load an entity's properties through the collection and property
    /// caches.
    pub async fn load_properties(&self, owner: u64) -> Option<Loaded<Vec<DummyProperty>>> {
        let session = SessionContext::open(self.clock().as_ref());
        let key = collection_key(owner);
        let cached_ids: Option<Vec<u64>> = self
            .collections
            .get(&session, &key, session.tx_timestamp())
            .await
            .and_then(|v| serde_json::from_value(v).ok());

        let (ids, mut from_cache) = match cached_ids {
            Some(ids) => (ids, true),
            None => {
                let ids = self.entity_row(owner)?.properties;
                self.collections
                    .put_from_load(&session, key, json!(ids), session.tx_timestamp(), None, false)
                    .await;
                (ids, false)
            }
        };

        let mut properties = Vec::with_capacity(ids.len());
        for id in ids {
            let key = property_key(id);
            let cached = self
                .properties
                .get(&session, &key, session.tx_timestamp())
                .await
                .and_then(|v| serde_json::from_value::<DummyProperty>(v).ok());
            match cached {
                Some(property) => properties.push(property),
                None => {
                    from_cache = false;
                    let Some(row) = self.db().properties.get(&id).cloned() else {
                        continue;
                    };
                    self.properties
                        .put_from_load(
                            &session,
                            key,
                            row.state(),
                            session.tx_timestamp(),
                            Some(Version::Number(row.version)),
                            false,
                        )
                        .await;
                    properties.push(row);
                }
            }
        }
        Some(Loaded {
            value: properties,
            from_cache,
        })
    }

    /// Run [`NAMES_QUERY`] through the query cache.
    pub async fn query_entity_names(&self) -> Loaded<Vec<String>> {
        let session = SessionContext::open(self.clock().as_ref());
        let key = CacheKey::query(NAMES_QUERY);
        let tables = spaces(&[ENTITY_TABLE]);
        if let Some(cached) = self.queries.get(&key, &tables).await {
            if let Ok(value) = serde_json::from_value(cached) {
                return Loaded {
                    value,
                    from_cache: true,
                };
            }
        }

        let names: Vec<String> = self.db().entities.values().map(|e| e.name.clone()).collect();
        self.queries
            .put(key, json!(names), session.tx_timestamp())
            .await;
        Loaded {
            value: names,
            from_cache: false,
        }
    }
}
