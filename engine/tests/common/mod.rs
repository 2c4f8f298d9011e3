//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use stow_engine::adapter::{
    Adapter, BlobAdapter, Capabilities, Connection, MemoryAdapter, RecordStream, ScanOptions,
    TransactionScope,
};
use stow_engine::{
    Database, IndexDef, Key, OpenOptions, Result, Schema, StoreName, StoreOptions,
};

/// Calls observed by a [`CountingAdapter`].
#[derive(Debug, Default)]
pub struct Counters {
    pub gets: AtomicUsize,
    pub get_alls: AtomicUsize,
    pub counts: AtomicUsize,
    pub cursors_opened: AtomicUsize,
    pub cursor_pulls: AtomicUsize,
    pub cursors_dropped: AtomicUsize,
}

impl Counters {
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn get_alls(&self) -> usize {
        self.get_alls.load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }

    pub fn cursors_opened(&self) -> usize {
        self.cursors_opened.load(Ordering::SeqCst)
    }

    pub fn cursor_pulls(&self) -> usize {
        self.cursor_pulls.load(Ordering::SeqCst)
    }

    pub fn cursors_dropped(&self) -> usize {
        self.cursors_dropped.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        for counter in [
            &self.gets,
            &self.get_alls,
            &self.counts,
            &self.cursors_opened,
            &self.cursor_pulls,
            &self.cursors_dropped,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }
}

/// Wraps another adapter and counts reads on its connections.
pub struct CountingAdapter {
    inner: Arc<dyn Adapter>,
    counters: Arc<Counters>,
}

impl CountingAdapter {
    pub fn new(inner: Arc<dyn Adapter>) -> Self {
        Self {
            inner,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }
}

#[async_trait]
impl Adapter for CountingAdapter {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn describe(&self, database: &str) -> Result<Option<Schema>> {
        self.inner.describe(database).await
    }

    async fn open(&self, database: &str, schema: &Schema) -> Result<Arc<dyn Connection>> {
        let inner = self.inner.open(database, schema).await?;
        Ok(Arc::new(CountingConnection {
            inner,
            counters: self.counters.clone(),
        }))
    }

    async fn destroy(&self, database: &str) -> Result<()> {
        self.inner.destroy(database).await
    }
}

struct CountingConnection {
    inner: Arc<dyn Connection>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Connection for CountingConnection {
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
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(store, key).await
    }

    async fn get_all(&self, store: &str, options: &ScanOptions) -> Result<Vec<Value>> {
        self.counters.get_alls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_all(store, options).await
    }

    async fn get_many(&self, store: &str, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        self.inner.get_many(store, keys).await
    }

    async fn count(&self, store: &str, options: &ScanOptions) -> Result<usize> {
        self.counters.counts.fetch_add(1, Ordering::SeqCst);
        self.inner.count(store, options).await
    }

    async fn put(&self, store: &str, value: Value) -> Result<Key> {
        self.inner.put(store, value).await
    }

    async fn put_many(&self, store: &str, values: Vec<Value>) -> Result<Vec<Key>> {
        self.inner.put_many(store, values).await
    }

    async fn delete(&self, store: &str, key: &Key) -> Result<()> {
        self.inner.delete(store, key).await
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.inner.clear(store).await
    }

    async fn cursor(&self, store: &str, options: &ScanOptions) -> Result<RecordStream> {
        let inner = self.inner.cursor(store, options).await?;
        self.counters.cursors_opened.fetch_add(1, Ordering::SeqCst);
        Ok(CountedCursor {
            inner,
            counters: self.counters.clone(),
        }
        .boxed())
    }

    async fn begin(&self, stores: &[StoreName]) -> Result<Box<dyn TransactionScope>> {
        self.inner.begin(stores).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

struct CountedCursor {
    inner: RecordStream,
    counters: Arc<Counters>,
}

impl Stream for CountedCursor {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.counters.cursor_pulls.fetch_add(1, Ordering::SeqCst);
        }
        polled
    }
}

impl Drop for CountedCursor {
    fn drop(&mut self) {
        self.counters.cursors_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Every bundled adapter, fresh.
pub fn adapters() -> Vec<Arc<dyn Adapter>> {
    #[allow(unused_mut)]
    let mut adapters: Vec<Arc<dyn Adapter>> =
        vec![Arc::new(MemoryAdapter::new()), Arc::new(BlobAdapter::new())];
    #[cfg(feature = "sqlite")]
    adapters.push(Arc::new(stow_engine::adapter::SqliteAdapter::in_memory()));
    adapters
}

/// `users` keyed by `id` (indexed by `age` and unique `email`) and an
/// auto-increment `logs` store.
pub fn test_options(adapter: Arc<dyn Adapter>) -> OpenOptions {
    OpenOptions::new().adapter(adapter).schema(|builder, _| {
        builder.create_store(
            "users",
            StoreOptions::key("id")
                .index(IndexDef::new("age"))
                .index(IndexDef::unique("email")),
        );
        builder.create_store("logs", StoreOptions::key("id").auto_increment());
        Ok(())
    })
}

pub async fn open_test_db(name: &str, adapter: Arc<dyn Adapter>) -> Database {
    Database::open(name, test_options(adapter))
        .await
        .expect("open test database")
}

pub fn user(id: i64, age: i64) -> Value {
    json!({"id": id, "age": age, "email": format!("user{id}@example.com")})
}

/// Users 1..=n with ages cycling through 20, 30, 40.
pub async fn seed_users(db: &Database, n: i64) {
    let users = db.store("users").expect("users store");
    let records = (1..=n).map(|id| user(id, 20 + 10 * ((id - 1) % 3))).collect();
    users.put_many(records).await.expect("seed users");
}

pub fn ids(records: &[Value]) -> Vec<i64> {
    records.iter().filter_map(|r| r["id"].as_i64()).collect()
}
