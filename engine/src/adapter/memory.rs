//! In-process backend built on ordered maps.
//!
//! Records live in a `BTreeMap` per store and every index is a
//! `BTreeMap<index value, BTreeSet<primary key>>`, so range scans and counts
//! are native. All state for a database sits behind one `parking_lot` mutex
//! that is never held across an await: every read-modify-write runs to
//! completion without yielding.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    Adapter, Capabilities, Connection, RecordStream, ScanOptions, SnapshotTransaction,
    Snapshotting, TransactionScope,
};
use crate::snapshot::{DatabaseSnapshot, StoreSnapshot};
use crate::{
    error::Result, key, Direction, Error, IndexName, Key, KeyRange, Schema, StoreName,
    StoreSchema,
};

const NAME: &str = "memory";

/// Index value to the primary keys sharing it.
type IndexMap = BTreeMap<Key, BTreeSet<Key>>;

/// Position of a cursor: (sort key, primary key).
type Position = (Key, Key);

#[derive(Debug, Clone)]
struct StoreData {
    records: BTreeMap<Key, Value>,
    indexes: BTreeMap<IndexName, IndexMap>,
    next_key: i64,
}

impl StoreData {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
            next_key: 1,
        }
    }

    /// Rebuild a store from plain records, re-checking keys and unique indexes.
    fn rebuild(
        schema: &StoreSchema,
        records: impl IntoIterator<Item = Value>,
        next_key: i64,
    ) -> Result<Self> {
        let mut data = Self::new();
        for record in records {
            data.insert(schema, record)?;
        }
        data.next_key = data.next_key.max(next_key);
        Ok(data)
    }

    fn insert(&mut self, schema: &StoreSchema, mut value: Value) -> Result<Key> {
        let key = match schema.validate_record(&value)? {
            Some(key) => key,
            None => {
                let key = key::generated_key(&schema.name, &schema.key_path, self.next_key)?;
                key::set_key(&mut value, &schema.key_path, &key)?;
                key
            }
        };

        for index in schema.indexes.iter().filter(|idx| idx.unique) {
            let Some(indexed) = index.value_of(&value) else {
                continue;
            };
            let taken = self
                .indexes
                .get(&index.name)
                .and_then(|map| map.get(&indexed))
                .is_some_and(|owners| owners.iter().any(|owner| owner != &key));
            if taken {
                return Err(Error::Constraint {
                    store: schema.name.clone(),
                    index: index.name.clone(),
                    key: indexed.to_string(),
                });
            }
        }

        if schema.auto_increment {
            self.next_key = key::advance_generator(self.next_key, &key);
        }

        self.remove(schema, &key);
        for index in &schema.indexes {
            if let Some(indexed) = index.value_of(&value) {
                self.indexes
                    .entry(index.name.clone())
                    .or_default()
                    .entry(indexed)
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.records.insert(key.clone(), value);
        Ok(key)
    }

    fn remove(&mut self, schema: &StoreSchema, key: &Key) -> Option<Value> {
        let old = self.records.remove(key)?;
        for index in &schema.indexes {
            let (Some(indexed), Some(map)) = (index.value_of(&old), self.indexes.get_mut(&index.name))
            else {
                continue;
            };
            if let Some(owners) = map.get_mut(&indexed) {
                owners.remove(key);
                if owners.is_empty() {
                    map.remove(&indexed);
                }
            }
        }
        Some(old)
    }

    fn clear(&mut self) {
        self.records.clear();
        self.indexes.clear();
    }

    /// (sort key, primary key) pairs inside `range`, in `direction` order.
    fn entries<'a>(
        &'a self,
        index: Option<&str>,
        range: &KeyRange,
        direction: Direction,
    ) -> Box<dyn Iterator<Item = (&'a Key, &'a Key)> + 'a> {
        // BTreeMap::range panics on inverted bounds
        if range.is_empty() {
            return Box::new(std::iter::empty());
        }
        let bounds = (range.start_bound(), range.end_bound());
        match index {
            None => {
                let iter = self.records.range::<Key, _>(bounds).map(|(k, _)| (k, k));
                if direction.is_reverse() {
                    Box::new(iter.rev())
                } else {
                    Box::new(iter)
                }
            }
            Some(name) => {
                let Some(map) = self.indexes.get(name) else {
                    return Box::new(std::iter::empty());
                };
                let iter = map.range::<Key, _>(bounds);
                if direction.is_reverse() {
                    Box::new(
                        iter.rev()
                            .flat_map(|(iv, pks)| pks.iter().rev().map(move |pk| (iv, pk))),
                    )
                } else {
                    Box::new(iter.flat_map(|(iv, pks)| pks.iter().map(move |pk| (iv, pk))))
                }
            }
        }
    }

    /// The first entry strictly after `last` in traversal order.
    fn next_after(
        &self,
        index: Option<&str>,
        range: &KeyRange,
        direction: Direction,
        last: Option<&Position>,
    ) -> Option<(Position, Value)> {
        let narrowed = match last {
            None => range.clone(),
            Some((sort, _)) if direction.is_reverse() => {
                range.intersect(&KeyRange::upper_bound(sort.clone(), false))
            }
            Some((sort, _)) => range.intersect(&KeyRange::lower_bound(sort.clone(), false)),
        };
        let wanted = if direction.is_reverse() {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        };
        self.entries(index, &narrowed, direction)
            .find(|(sort, pk)| match last {
                None => true,
                Some((last_sort, last_pk)) => (*sort, *pk).cmp(&(last_sort, last_pk)) == wanted,
            })
            .and_then(|(sort, pk)| {
                let value = self.records.get(pk)?.clone();
                Some(((sort.clone(), pk.clone()), value))
            })
    }
}

#[derive(Debug)]
struct MemoryDatabase {
    schema: Schema,
    stores: BTreeMap<StoreName, StoreData>,
}

impl MemoryDatabase {
    fn store(&self, name: &str) -> Result<(&StoreSchema, &StoreData)> {
        let schema = self.schema.store(name)?;
        let data = self
            .stores
            .get(name)
            .ok_or_else(|| Error::store_not_found(name, self.stores.keys()))?;
        Ok((schema, data))
    }

    fn store_mut(&mut self, name: &str) -> Result<(&StoreSchema, &mut StoreData)> {
        let schema = self.schema.store(name)?;
        let data = self
            .stores
            .get_mut(name)
            .ok_or_else(|| Error::store_not_found(name, self.schema.stores.keys()))?;
        Ok((schema, data))
    }

    /// Bring the stored data in line with a new schema.
    fn upgrade(&mut self, schema: &Schema) -> Result<()> {
        let mut stores = BTreeMap::new();
        for (name, store_schema) in &schema.stores {
            let data = match (self.stores.remove(name), self.schema.stores.get(name)) {
                (Some(data), Some(old)) if old == store_schema => data,
                (Some(data), _) => StoreData::rebuild(
                    store_schema,
                    data.records.into_values(),
                    data.next_key,
                )?,
                (None, _) => StoreData::new(),
            };
            stores.insert(name.clone(), data);
        }
        self.stores = stores;
        self.schema = schema.clone();
        Ok(())
    }
}

/// Backend keeping every database in process memory.
///
/// Databases persist for the life of the adapter, so reopening a name on the
/// same adapter sees earlier writes.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    databases: Arc<DashMap<String, Arc<Mutex<MemoryDatabase>>>>,
}

impl MemoryAdapter {
    /// Create an adapter with its own empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide adapter used when a database is opened without one.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<MemoryAdapter>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(MemoryAdapter::new())).clone()
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn describe(&self, database: &str) -> Result<Option<Schema>> {
        Ok(self
            .databases
            .get(database)
            .map(|db| db.lock().schema.clone()))
    }

    async fn open(&self, database: &str, schema: &Schema) -> Result<Arc<dyn Connection>> {
        let db = self
            .databases
            .entry(database.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(MemoryDatabase {
                    schema: Schema::default(),
                    stores: BTreeMap::new(),
                }))
            })
            .clone();
        {
            let mut guard = db.lock();
            if guard.schema != *schema {
                guard.upgrade(schema)?;
            }
        }
        tracing::debug!(database, version = schema.version, "opened memory database");
        Ok(Arc::new(MemoryConnection {
            db,
            schema: Arc::new(schema.clone()),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn destroy(&self, database: &str) -> Result<()> {
        self.databases.remove(database);
        Ok(())
    }
}

#[derive(Clone)]
struct MemoryConnection {
    db: Arc<Mutex<MemoryDatabase>>,
    schema: Arc<Schema>,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Validate the store and index named by a scan.
    fn check_scan(&self, store: &str, options: &ScanOptions) -> Result<()> {
        self.ensure_open()?;
        let store = self.schema.store(store)?;
        if let Some(index) = &options.index {
            store.index(index)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn adapter_name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_ordering: true,
            native_count: true,
            native_transactions: false,
        }
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        self.ensure_open()?;
        let db = self.db.lock();
        let (_, data) = db.store(store)?;
        Ok(data.records.get(key).cloned())
    }

    async fn get_all(&self, store: &str, options: &ScanOptions) -> Result<Vec<Value>> {
        self.check_scan(store, options)?;
        let db = self.db.lock();
        let (_, data) = db.store(store)?;
        let range = options.range.clone().unwrap_or_default();
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(data
            .entries(options.index.as_deref(), &range, options.direction)
            .take(limit)
            .filter_map(|(_, pk)| data.records.get(pk).cloned())
            .collect())
    }

    async fn get_many(&self, store: &str, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        self.ensure_open()?;
        let db = self.db.lock();
        let (_, data) = db.store(store)?;
        Ok(keys.iter().map(|k| data.records.get(k).cloned()).collect())
    }

    async fn count(&self, store: &str, options: &ScanOptions) -> Result<usize> {
        self.check_scan(store, options)?;
        let db = self.db.lock();
        let (_, data) = db.store(store)?;
        match (&options.index, &options.range) {
            (None, None) => Ok(data.records.len()),
            (index, range) => Ok(data
                .entries(
                    index.as_deref(),
                    &range.clone().unwrap_or_default(),
                    Direction::Next,
                )
                .count()),
        }
    }

    async fn put(&self, store: &str, value: Value) -> Result<Key> {
        self.ensure_open()?;
        let mut db = self.db.lock();
        let (schema, data) = db.store_mut(store)?;
        data.insert(schema, value)
    }

    async fn put_many(&self, store: &str, values: Vec<Value>) -> Result<Vec<Key>> {
        self.ensure_open()?;
        let mut db = self.db.lock();
        let (schema, data) = db.store_mut(store)?;
        let before = data.clone();
        let mut keys = Vec::with_capacity(values.len());
        for value in values {
            match data.insert(schema, value) {
                Ok(key) => keys.push(key),
                Err(err) => {
                    *data = before;
                    return Err(err);
                }
            }
        }
        Ok(keys)
    }

    async fn delete(&self, store: &str, key: &Key) -> Result<()> {
        self.ensure_open()?;
        let mut db = self.db.lock();
        let (schema, data) = db.store_mut(store)?;
        data.remove(schema, key);
        Ok(())
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.ensure_open()?;
        let mut db = self.db.lock();
        let (_, data) = db.store_mut(store)?;
        data.clear();
        Ok(())
    }

    async fn cursor(&self, store: &str, options: &ScanOptions) -> Result<RecordStream> {
        self.check_scan(store, options)?;
        if options.range.as_ref().is_some_and(KeyRange::is_empty) {
            return Ok(stream::empty().boxed());
        }
        let cursor = MemoryCursor {
            db: self.db.clone(),
            store: store.to_string(),
            index: options.index.clone(),
            range: options.range.clone().unwrap_or_default(),
            direction: options.direction,
            last: None,
        };
        Ok(stream::unfold(Some(cursor), |state| async move {
            let mut cursor = state?;
            match cursor.advance() {
                Ok(Some(value)) => Some((Ok(value), Some(cursor))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed())
    }

    async fn begin(&self, stores: &[StoreName]) -> Result<Box<dyn TransactionScope>> {
        self.ensure_open()?;
        let tx = SnapshotTransaction::begin(Arc::new(self.clone()), stores)?;
        Ok(Box::new(tx))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Snapshotting for MemoryConnection {
    fn snapshot(&self, stores: &[StoreName]) -> Result<DatabaseSnapshot> {
        let db = self.db.lock();
        let mut snapshot = DatabaseSnapshot::new(db.schema.version);
        for name in stores {
            let (_, data) = db.store(name)?;
            snapshot.insert(
                name.clone(),
                StoreSnapshot::new(data.records.values().cloned().collect(), data.next_key),
            );
        }
        Ok(snapshot)
    }

    fn restore(&self, snapshot: DatabaseSnapshot) -> Result<()> {
        let mut db = self.db.lock();
        for (name, contents) in snapshot.stores {
            let (schema, data) = db.store_mut(&name)?;
            let mut rebuilt = StoreData::rebuild(schema, contents.records, contents.next_key)?;
            rebuilt.next_key = contents.next_key;
            *data = rebuilt;
        }
        Ok(())
    }
}

/// A cursor that re-locates its position on every step.
struct MemoryCursor {
    db: Arc<Mutex<MemoryDatabase>>,
    store: StoreName,
    index: Option<IndexName>,
    range: KeyRange,
    direction: Direction,
    last: Option<Position>,
}

impl MemoryCursor {
    fn advance(&mut self) -> Result<Option<Value>> {
        let db = self.db.lock();
        let (_, data) = db.store(&self.store)?;
        let next = data.next_after(
            self.index.as_deref(),
            &self.range,
            self.direction,
            self.last.as_ref(),
        );
        Ok(next.map(|(position, value)| {
            self.last = Some(position);
            value
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IndexDef, StoreOptions};
    use futures::TryStreamExt;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(1)
            .with_store(StoreSchema::new(
                "users",
                StoreOptions::key("id")
                    .index(IndexDef::unique("email"))
                    .index(IndexDef::new("age")),
            ))
            .with_store(StoreSchema::new(
                "logs",
                StoreOptions::default().auto_increment(),
            ))
    }

    async fn open() -> Arc<dyn Connection> {
        MemoryAdapter::new().open("test", &schema()).await.unwrap()
    }

    #[tokio::test]
    async fn index_scan_orders_ties_by_primary_key() {
        let conn = open().await;
        for (id, age) in [(3, 30), (1, 30), (2, 20)] {
            conn.put("users", json!({"id": id, "email": format!("{id}@x"), "age": age}))
                .await
                .unwrap();
        }
        let ids = |records: Vec<Value>| -> Vec<i64> {
            records.iter().map(|r| r["id"].as_i64().unwrap()).collect()
        };

        let forward = conn
            .get_all("users", &ScanOptions::new().index("age"))
            .await
            .unwrap();
        assert_eq!(ids(forward), vec![2, 1, 3]);

        let backward: Vec<Value> = conn
            .cursor(
                "users",
                &ScanOptions::new().index("age").direction(Direction::Prev),
            )
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids(backward), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicates() {
        let conn = open().await;
        conn.put("users", json!({"id": 1, "email": "a@x"})).await.unwrap();
        // Overwriting the owner is fine
        conn.put("users", json!({"id": 1, "email": "a@x", "age": 5}))
            .await
            .unwrap();
        let err = conn
            .put("users", json!({"id": 2, "email": "a@x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Constraint { .. }));
        assert_eq!(conn.count("users", &ScanOptions::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_many_is_atomic() {
        let conn = open().await;
        conn.put("users", json!({"id": 1, "email": "a@x"})).await.unwrap();
        let result = conn
            .put_many(
                "users",
                vec![json!({"id": 2, "email": "b@x"}), json!({"id": 3, "email": "a@x"})],
            )
            .await;
        assert!(result.is_err());
        assert_eq!(conn.get("users", &Key::from(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn generator_is_never_reused() {
        let conn = open().await;
        assert_eq!(conn.put("logs", json!({"m": "a"})).await.unwrap(), Key::from(1));
        assert_eq!(conn.put("logs", json!({"id": 10, "m": "b"})).await.unwrap(), Key::from(10));
        assert_eq!(conn.put("logs", json!({"m": "c"})).await.unwrap(), Key::from(11));
        conn.clear("logs").await.unwrap();
        let key = conn.put("logs", json!({"m": "d"})).await.unwrap();
        assert_eq!(key, Key::from(12));
        let stored = conn.get("logs", &key).await.unwrap().unwrap();
        assert_eq!(stored["id"], json!(12));
    }

    #[tokio::test]
    async fn cursor_sees_writes_made_while_iterating() {
        let conn = open().await;
        for id in 1..=3 {
            conn.put("users", json!({"id": id, "email": format!("{id}@x")}))
                .await
                .unwrap();
        }
        let mut cursor = conn.cursor("users", &ScanOptions::new()).await.unwrap();
        let first = cursor.next().await.unwrap().unwrap();
        assert_eq!(first["id"], json!(1));

        conn.delete("users", &Key::from(2)).await.unwrap();
        let second = cursor.next().await.unwrap().unwrap();
        assert_eq!(second["id"], json!(3));
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn rollback_restores_snapshot() {
        let conn = open().await;
        conn.put("users", json!({"id": 1, "email": "a@x"})).await.unwrap();

        let scope = conn.begin(&["users".to_string()]).await.unwrap();
        let tx = scope.connection();
        tx.put("users", json!({"id": 2, "email": "b@x"})).await.unwrap();
        tx.delete("users", &Key::from(1)).await.unwrap();
        assert!(matches!(
            tx.get("logs", &Key::from(1)).await,
            Err(Error::StoreNotInTransaction(_))
        ));
        scope.rollback().await.unwrap();

        assert!(matches!(
            tx.get("users", &Key::from(1)).await,
            Err(Error::TransactionFinished)
        ));
        assert!(conn.get("users", &Key::from(1)).await.unwrap().is_some());
        assert!(conn.get("users", &Key::from(2)).await.unwrap().is_none());
        // Index entries were rebuilt along with the records
        assert!(conn
            .put("users", json!({"id": 3, "email": "a@x"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reopening_shares_data() {
        let adapter = MemoryAdapter::new();
        let first = adapter.open("shared", &schema()).await.unwrap();
        first.put("users", json!({"id": 1, "email": "a@x"})).await.unwrap();
        first.close().await.unwrap();
        assert!(matches!(
            first.get("users", &Key::from(1)).await,
            Err(Error::Closed)
        ));

        let second = adapter.open("shared", &schema()).await.unwrap();
        assert!(second.get("users", &Key::from(1)).await.unwrap().is_some());
        assert_eq!(adapter.describe("shared").await.unwrap(), Some(schema()));

        adapter.destroy("shared").await.unwrap();
        assert_eq!(adapter.describe("shared").await.unwrap(), None);
    }
}
