//! Backend over a flat blob keyspace.
//!
//! Each record is one serialized blob named after its store and key, the way a
//! simple key/value blob service stores objects. The keyspace is unordered, so
//! ranges, indexes, ordering, unique checks and counts are all computed
//! in-process by listing blob names and decoding bodies. Cursors list and sort
//! their candidate keys when opened, then fetch one body per step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    order_entries, Adapter, Capabilities, Connection, RecordStream, ScanOptions,
    SnapshotTransaction, Snapshotting, TransactionScope,
};
use crate::snapshot::{DatabaseSnapshot, StoreSnapshot};
use crate::{error::Result, key, Error, Key, Schema, StoreName, StoreSchema};

const NAME: &str = "blob";
const SEP: char = '\u{1f}';
const SCHEMA_BLOB: &str = "schema";

fn record_prefix(store: &str) -> String {
    format!("r{SEP}{store}{SEP}")
}

fn record_name(store: &str, key: &Key) -> String {
    format!("{}{key}", record_prefix(store))
}

fn next_key_name(store: &str) -> String {
    format!("n{SEP}{store}")
}

#[derive(Debug, Clone, Default)]
struct BlobDatabase {
    blobs: HashMap<String, Vec<u8>>,
}

impl BlobDatabase {
    fn schema(&self) -> Result<Option<Schema>> {
        self.blobs
            .get(SCHEMA_BLOB)
            .map(|bytes| serde_json::from_slice::<Schema>(bytes).map_err(Error::from))
            .transpose()
    }

    fn keys(&self, store: &str) -> Result<Vec<Key>> {
        let prefix = record_prefix(store);
        self.blobs
            .keys()
            .filter_map(|name| name.strip_prefix(&prefix))
            .map(|encoded| serde_json::from_str::<Key>(encoded).map_err(Error::from))
            .collect()
    }

    fn read(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        self.blobs
            .get(&record_name(store, key))
            .map(|bytes| serde_json::from_slice::<Value>(bytes).map_err(Error::from))
            .transpose()
    }

    fn records(&self, store: &str) -> Result<Vec<(Key, Value)>> {
        let mut records = Vec::new();
        for key in self.keys(store)? {
            if let Some(value) = self.read(store, &key)? {
                records.push((key, value));
            }
        }
        Ok(records)
    }

    fn next_key(&self, store: &str) -> i64 {
        self.blobs
            .get(&next_key_name(store))
            .and_then(|bytes| serde_json::from_slice::<i64>(bytes).ok())
            .unwrap_or(1)
    }

    fn set_next_key(&mut self, store: &str, next: i64) -> Result<()> {
        self.blobs
            .insert(next_key_name(store), serde_json::to_vec(&next)?);
        Ok(())
    }

    fn insert(&mut self, schema: &StoreSchema, mut value: Value) -> Result<Key> {
        let next = self.next_key(&schema.name);
        let key = match schema.validate_record(&value)? {
            Some(key) => key,
            None => {
                let key = key::generated_key(&schema.name, &schema.key_path, next)?;
                key::set_key(&mut value, &schema.key_path, &key)?;
                key
            }
        };

        let unique: Vec<_> = schema.indexes.iter().filter(|idx| idx.unique).collect();
        if !unique.is_empty() {
            for (other, existing) in self.records(&schema.name)? {
                if other == key {
                    continue;
                }
                for index in &unique {
                    let indexed = index.value_of(&value);
                    if indexed.is_some() && indexed == index.value_of(&existing) {
                        return Err(Error::Constraint {
                            store: schema.name.clone(),
                            index: index.name.clone(),
                            key: indexed.map(|k| k.to_string()).unwrap_or_default(),
                        });
                    }
                }
            }
        }

        if schema.auto_increment {
            let advanced = key::advance_generator(next, &key);
            if advanced != next {
                self.set_next_key(&schema.name, advanced)?;
            }
        }
        self.blobs
            .insert(record_name(&schema.name, &key), serde_json::to_vec(&value)?);
        Ok(key)
    }

    fn clear(&mut self, store: &str) {
        let prefix = record_prefix(store);
        self.blobs.retain(|name, _| !name.starts_with(&prefix));
    }

    /// Primary keys matching a scan, in traversal order.
    fn scan(&self, schema: &StoreSchema, options: &ScanOptions) -> Result<Vec<Key>> {
        let range = options.range.clone().unwrap_or_default();
        let entries = match &options.index {
            None => self
                .keys(&schema.name)?
                .into_iter()
                .filter(|key| range.contains(key))
                .map(|key| (key.clone(), key, ()))
                .collect(),
            Some(index) => {
                let index = schema.index(index)?;
                self.records(&schema.name)?
                    .into_iter()
                    .filter_map(|(key, value)| {
                        let indexed = index.value_of(&value)?;
                        range.contains(&indexed).then_some((indexed, key, ()))
                    })
                    .collect()
            }
        };
        Ok(order_entries(entries, options)
            .into_iter()
            .map(|(_, key, _)| key)
            .collect())
    }

    fn snapshot_store(&self, store: &str) -> Result<StoreSnapshot> {
        let mut records = self.records(store)?;
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(StoreSnapshot::new(
            records.into_iter().map(|(_, value)| value).collect(),
            self.next_key(store),
        ))
    }

    fn restore_store(&mut self, schema: &StoreSchema, contents: StoreSnapshot) -> Result<()> {
        self.clear(&schema.name);
        for record in contents.records {
            let key = schema.validate_record(&record)?.ok_or_else(|| {
                Error::DataError(format!("snapshot record in '{}' has no key", schema.name))
            })?;
            self.blobs
                .insert(record_name(&schema.name, &key), serde_json::to_vec(&record)?);
        }
        self.set_next_key(&schema.name, contents.next_key)
    }

    /// Bring stored blobs in line with a new schema.
    fn upgrade(&mut self, schema: &Schema) -> Result<()> {
        let previous = self.schema()?.unwrap_or_default();
        for name in previous.stores.keys() {
            if !schema.stores.contains_key(name) {
                self.clear(name);
                self.blobs.remove(&next_key_name(name));
            }
        }
        for (name, store) in &schema.stores {
            match previous.stores.get(name) {
                Some(old) if old == store => {}
                Some(_) => {
                    // Re-insert so changed keys and unique indexes are re-checked
                    let next = self.next_key(name);
                    let records = self.records(name)?;
                    self.clear(name);
                    for (_, record) in records {
                        self.insert(store, record)?;
                    }
                    if self.next_key(name) < next {
                        self.set_next_key(name, next)?;
                    }
                }
                None => {}
            }
        }
        self.blobs
            .insert(SCHEMA_BLOB.to_string(), serde_json::to_vec(schema)?);
        Ok(())
    }
}

/// Backend over an unordered in-process blob keyspace.
///
/// Serves as the reference for backends with no native ordering, counting or
/// transactions.
#[derive(Clone, Default)]
pub struct BlobAdapter {
    databases: Arc<DashMap<String, Arc<Mutex<BlobDatabase>>>>,
}

impl BlobAdapter {
    /// Create an adapter with an empty keyspace.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Adapter for BlobAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn describe(&self, database: &str) -> Result<Option<Schema>> {
        match self.databases.get(database) {
            Some(db) => db.lock().schema(),
            None => Ok(None),
        }
    }

    async fn open(&self, database: &str, schema: &Schema) -> Result<Arc<dyn Connection>> {
        let db = self
            .databases
            .entry(database.to_string())
            .or_default()
            .clone();
        {
            let mut guard = db.lock();
            if guard.schema()?.as_ref() != Some(schema) {
                let mut upgraded = guard.clone();
                upgraded.upgrade(schema)?;
                *guard = upgraded;
            }
        }
        tracing::debug!(database, version = schema.version, "opened blob database");
        Ok(Arc::new(BlobConnection {
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
struct BlobConnection {
    db: Arc<Mutex<BlobDatabase>>,
    schema: Arc<Schema>,
    closed: Arc<AtomicBool>,
}

impl BlobConnection {
    fn store_schema(&self, store: &str) -> Result<&StoreSchema> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.schema.store(store)
    }
}

#[async_trait]
impl Connection for BlobConnection {
    fn adapter_name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_ordering: false,
            native_count: false,
            native_transactions: false,
        }
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        self.store_schema(store)?;
        self.db.lock().read(store, key)
    }

    async fn get_all(&self, store: &str, options: &ScanOptions) -> Result<Vec<Value>> {
        let schema = self.store_schema(store)?;
        if options.is_empty_range() {
            return Ok(Vec::new());
        }
        let db = self.db.lock();
        let mut records = Vec::new();
        for key in db.scan(schema, options)? {
            if let Some(value) = db.read(store, &key)? {
                records.push(value);
            }
        }
        Ok(records)
    }

    async fn get_many(&self, store: &str, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        self.store_schema(store)?;
        let db = self.db.lock();
        keys.iter().map(|key| db.read(store, key)).collect()
    }

    async fn count(&self, store: &str, options: &ScanOptions) -> Result<usize> {
        let schema = self.store_schema(store)?;
        let options = ScanOptions {
            limit: None,
            ..options.clone()
        };
        if options.is_empty_range() {
            return Ok(0);
        }
        Ok(self.db.lock().scan(schema, &options)?.len())
    }

    async fn put(&self, store: &str, value: Value) -> Result<Key> {
        let schema = self.store_schema(store)?;
        self.db.lock().insert(schema, value)
    }

    async fn put_many(&self, store: &str, values: Vec<Value>) -> Result<Vec<Key>> {
        let schema = self.store_schema(store)?;
        let mut db = self.db.lock();
        let before = db.snapshot_store(store)?;
        let mut keys = Vec::with_capacity(values.len());
        for value in values {
            match db.insert(schema, value) {
                Ok(key) => keys.push(key),
                Err(err) => {
                    db.restore_store(schema, before)?;
                    return Err(err);
                }
            }
        }
        Ok(keys)
    }

    async fn delete(&self, store: &str, key: &Key) -> Result<()> {
        self.store_schema(store)?;
        self.db.lock().blobs.remove(&record_name(store, key));
        Ok(())
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.store_schema(store)?;
        self.db.lock().clear(store);
        Ok(())
    }

    async fn cursor(&self, store: &str, options: &ScanOptions) -> Result<RecordStream> {
        let schema = self.store_schema(store)?;
        let options = ScanOptions {
            limit: None,
            ..options.clone()
        };
        if options.is_empty_range() {
            return Ok(stream::empty().boxed());
        }
        let keys = self.db.lock().scan(schema, &options)?;
        let db = self.db.clone();
        let store = store.to_string();
        // Records deleted after the cursor opened are skipped
        Ok(stream::iter(keys)
            .filter_map(move |key| {
                let fetched = db.lock().read(&store, &key).transpose();
                async move { fetched }
            })
            .boxed())
    }

    async fn begin(&self, stores: &[StoreName]) -> Result<Box<dyn TransactionScope>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let tx = SnapshotTransaction::begin(Arc::new(self.clone()), stores)?;
        Ok(Box::new(tx))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Snapshotting for BlobConnection {
    fn snapshot(&self, stores: &[StoreName]) -> Result<DatabaseSnapshot> {
        let db = self.db.lock();
        let mut snapshot = DatabaseSnapshot::new(self.schema.version);
        for store in stores {
            snapshot.insert(store.clone(), db.snapshot_store(store)?);
        }
        Ok(snapshot)
    }

    fn restore(&self, snapshot: DatabaseSnapshot) -> Result<()> {
        let mut db = self.db.lock();
        for (name, contents) in snapshot.stores {
            db.restore_store(self.schema.store(&name)?, contents)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Direction, IndexDef, KeyRange, StoreOptions};
    use futures::TryStreamExt;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(1).with_store(StoreSchema::new(
            "notes",
            StoreOptions::key("id")
                .auto_increment()
                .index(IndexDef::new("tag"))
                .index(IndexDef::unique("slug")),
        ))
    }

    #[tokio::test]
    async fn orders_mixed_keys_in_process() {
        let conn = BlobAdapter::new().open("db", &schema()).await.unwrap();
        for id in [json!("b"), json!(10), json!("a"), json!(2)] {
            conn.put("notes", json!({"id": id})).await.unwrap();
        }
        let ids: Vec<Value> = conn
            .get_all("notes", &ScanOptions::new())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(2), json!(10), json!("a"), json!("b")]);

        let range = KeyRange::bound(2, "a", true, false).unwrap();
        let count = conn
            .count("notes", &ScanOptions::new().range(range))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn index_scan_and_cursor() {
        let conn = BlobAdapter::new().open("db", &schema()).await.unwrap();
        for (tag, slug) in [("x", "one"), ("y", "two"), ("x", "three")] {
            conn.put("notes", json!({"tag": tag, "slug": slug})).await.unwrap();
        }
        let slugs: Vec<Value> = conn
            .cursor(
                "notes",
                &ScanOptions::new()
                    .index("tag")
                    .range(KeyRange::only("x"))
                    .direction(Direction::Prev),
            )
            .await
            .unwrap()
            .map_ok(|r| r["slug"].clone())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(slugs, vec![json!("three"), json!("one")]);

        let err = conn
            .put("notes", json!({"slug": "two"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Constraint { .. }));
    }

    #[tokio::test]
    async fn snapshot_transaction_rolls_back() {
        let conn = BlobAdapter::new().open("db", &schema()).await.unwrap();
        conn.put("notes", json!({"slug": "kept"})).await.unwrap();

        let scope = conn.begin(&["notes".to_string()]).await.unwrap();
        scope
            .connection()
            .put("notes", json!({"slug": "dropped"}))
            .await
            .unwrap();
        scope.rollback().await.unwrap();

        assert_eq!(conn.count("notes", &ScanOptions::new()).await.unwrap(), 1);
        // The generator is restored too
        assert_eq!(conn.put("notes", json!({"slug": "next"})).await.unwrap(), Key::from(2));
    }
}
