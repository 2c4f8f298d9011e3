//! Transactions for backends without native ones.
//!
//! [`ScopedConnection`] restricts a connection to the stores a transaction
//! declared and refuses work once the transaction has finished.
//! [`SnapshotTransaction`] pairs it with a [`DatabaseSnapshot`] taken at
//! begin, restored on rollback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Capabilities, Connection, RecordStream, ScanOptions, TransactionScope};
use crate::snapshot::DatabaseSnapshot;
use crate::{error::Result, Error, Key, Schema, StoreName};

/// A connection that can copy and restore store contents.
pub trait Snapshotting: Connection {
    /// Copy the contents of `stores`.
    fn snapshot(&self, stores: &[StoreName]) -> Result<DatabaseSnapshot>;

    /// Replace the contents of every store in `snapshot`.
    fn restore(&self, snapshot: DatabaseSnapshot) -> Result<()>;
}

/// A connection view limited to a transaction's stores.
pub struct ScopedConnection {
    inner: Arc<dyn Connection>,
    stores: Vec<StoreName>,
    finished: AtomicBool,
}

impl ScopedConnection {
    /// Wrap `inner`, allowing only `stores`.
    pub fn new(inner: Arc<dyn Connection>, stores: &[StoreName]) -> Self {
        Self {
            inner,
            stores: stores.to_vec(),
            finished: AtomicBool::new(false),
        }
    }

    /// Refuse all further operations.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    fn check(&self, store: &str) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(Error::TransactionFinished);
        }
        if !self.stores.iter().any(|s| s == store) {
            return Err(Error::StoreNotInTransaction(store.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for ScopedConnection {
    fn adapter_name(&self) -> &'static str {
        self.inner.adapter_name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    async fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        self.check(store)?;
        self.inner.get(store, key).await
    }

    async fn get_all(&self, store: &str, options: &ScanOptions) -> Result<Vec<Value>> {
        self.check(store)?;
        self.inner.get_all(store, options).await
    }

    async fn get_many(&self, store: &str, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        self.check(store)?;
        self.inner.get_many(store, keys).await
    }

    async fn count(&self, store: &str, options: &ScanOptions) -> Result<usize> {
        self.check(store)?;
        self.inner.count(store, options).await
    }

    async fn put(&self, store: &str, value: Value) -> Result<Key> {
        self.check(store)?;
        self.inner.put(store, value).await
    }

    async fn put_many(&self, store: &str, values: Vec<Value>) -> Result<Vec<Key>> {
        self.check(store)?;
        self.inner.put_many(store, values).await
    }

    async fn delete(&self, store: &str, key: &Key) -> Result<()> {
        self.check(store)?;
        self.inner.delete(store, key).await
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.check(store)?;
        self.inner.clear(store).await
    }

    async fn cursor(&self, store: &str, options: &ScanOptions) -> Result<RecordStream> {
        self.check(store)?;
        self.inner.cursor(store, options).await
    }

    async fn begin(&self, _stores: &[StoreName]) -> Result<Box<dyn TransactionScope>> {
        Err(Error::NestedTransaction)
    }

    async fn close(&self) -> Result<()> {
        self.finish();
        Ok(())
    }
}

/// Snapshot+restore transaction over a [`Snapshotting`] connection.
pub struct SnapshotTransaction<C: Snapshotting + 'static> {
    inner: Arc<C>,
    scoped: Arc<ScopedConnection>,
    snapshot: DatabaseSnapshot,
}

impl<C: Snapshotting + 'static> SnapshotTransaction<C> {
    /// Snapshot `stores` and hand out a scoped connection over them.
    pub fn begin(inner: Arc<C>, stores: &[StoreName]) -> Result<Self> {
        for store in stores {
            inner.schema().store(store)?;
        }
        let snapshot = inner.snapshot(stores)?;
        let as_dyn: Arc<dyn Connection> = inner.clone();
        Ok(Self {
            inner,
            scoped: Arc::new(ScopedConnection::new(as_dyn, stores)),
            snapshot,
        })
    }
}

#[async_trait]
impl<C: Snapshotting + 'static> TransactionScope for SnapshotTransaction<C> {
    fn connection(&self) -> Arc<dyn Connection> {
        self.scoped.clone()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.scoped.finish();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.scoped.finish();
        tracing::debug!(
            adapter = this.inner.adapter_name(),
            schema_version = this.snapshot.schema_version,
            records = this.snapshot.record_count(),
            "restoring transaction snapshot"
        );
        this.inner.restore(this.snapshot)
    }
}
