//! Per-store record access.
//!
//! A [`StoreAccessor`] binds a store name to a connection. Outside a
//! transaction its writes are dispatched to watchers as soon as they succeed;
//! inside one they are buffered and dispatched only after commit.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::adapter::{Connection, ScanOptions};
use crate::{
    error::Result, key, Database, Key, MutationEvent, Query, StoreSchema, WatchOptions, Watcher,
};

/// Events written inside a transaction, waiting for commit.
pub(crate) type PendingEvents = Arc<Mutex<Vec<MutationEvent>>>;

/// Record operations on one store.
#[derive(Clone)]
pub struct StoreAccessor {
    db: Database,
    conn: Arc<dyn Connection>,
    schema: StoreSchema,
    pending: Option<PendingEvents>,
}

impl StoreAccessor {
    pub(crate) fn new(
        db: Database,
        conn: Arc<dyn Connection>,
        schema: StoreSchema,
        pending: Option<PendingEvents>,
    ) -> Self {
        Self {
            db,
            conn,
            schema,
            pending,
        }
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Store definition.
    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    fn emit(&self, event: MutationEvent) {
        match &self.pending {
            Some(pending) => pending.lock().push(event),
            None => self.db.emit(&event),
        }
    }

    /// The record as stored: the written value with its (possibly generated)
    /// key filled in.
    fn stored(&self, mut value: Value, key: &Key) -> Result<Value> {
        if self.schema.key_of(&value).as_ref() != Some(key) {
            key::set_key(&mut value, &self.schema.key_path, key)?;
        }
        Ok(value)
    }

    /// Fetch a record by primary key.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.conn.get(self.name(), &key.into()).await
    }

    /// Fetch records in key (or index) order.
    pub async fn get_all(&self, options: ScanOptions) -> Result<Vec<Value>> {
        self.conn.get_all(self.name(), &options).await
    }

    /// Fetch records positionally; missing keys yield `None`.
    pub async fn get_many(&self, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        self.conn.get_many(self.name(), keys).await
    }

    /// Count records, optionally through an index and range.
    pub async fn count(&self, options: ScanOptions) -> Result<usize> {
        self.conn.count(self.name(), &options).await
    }

    /// Insert or replace a record, returning its key.
    pub async fn put(&self, value: Value) -> Result<Key> {
        let record = value.clone();
        let key = self.conn.put(self.name(), value).await?;
        let stored = self.stored(record, &key)?;
        self.emit(MutationEvent::put(self.name(), key.clone(), stored));
        Ok(key)
    }

    /// Write several records, returning how many were written.
    pub async fn put_many(&self, values: Vec<Value>) -> Result<usize> {
        let records = values.clone();
        let keys = self.conn.put_many(self.name(), values).await?;
        for (record, key) in records.into_iter().zip(&keys) {
            let stored = self.stored(record, key)?;
            self.emit(MutationEvent::put(self.name(), key.clone(), stored));
        }
        Ok(keys.len())
    }

    /// Remove a record. Missing keys are not an error.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        self.conn.delete(self.name(), &key).await?;
        self.emit(MutationEvent::delete(self.name(), key));
        Ok(())
    }

    /// Remove every record.
    pub async fn clear(&self) -> Result<()> {
        self.conn.clear(self.name()).await?;
        self.emit(MutationEvent::clear(self.name()));
        Ok(())
    }

    /// Query the store by primary key.
    pub fn all(&self) -> Query {
        Query::new(self.clone(), None)
    }

    /// Same as [`StoreAccessor::all`].
    pub fn query(&self) -> Query {
        self.all()
    }

    /// Query the store through a secondary index.
    pub fn where_index(&self, index: &str) -> Result<Query> {
        self.schema.index(index)?;
        Ok(Query::new(self.clone(), Some(index.to_string())))
    }

    /// Stream committed changes to this store.
    pub fn watch(&self, options: WatchOptions) -> Watcher {
        Watcher::new(self.db.hub(), self.name(), options)
    }
}

impl std::fmt::Debug for StoreAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreAccessor")
            .field("database", &self.db.name())
            .field("store", &self.schema.name)
            .field("in_transaction", &self.pending.is_some())
            .finish()
    }
}
