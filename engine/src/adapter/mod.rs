//! The adapter contract every storage backend satisfies.
//!
//! An [`Adapter`] is the backend factory: it opens and destroys named
//! databases. A [`Connection`] is one open database and carries the record
//! operations the rest of the engine is written against. Backends are sibling
//! implementations chosen at runtime through `Arc<dyn Adapter>`.
//!
//! Bundled backends:
//!
//! - [`MemoryAdapter`] - ordered in-process maps with native range scans.
//! - [`BlobAdapter`] - a flat blob keyspace with no native ordering; ranges,
//!   indexes and ordering are computed in-process.
//! - `SqliteAdapter` (feature `sqlite`) - SQLite through `sqlx`.

mod blob;
mod memory;
mod scoped;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use blob::BlobAdapter;
pub use memory::MemoryAdapter;
pub use scoped::{ScopedConnection, SnapshotTransaction, Snapshotting};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::{error::Result, Direction, IndexName, Key, KeyRange, Schema, StoreName};

/// A lazy sequence of records produced by [`Connection::cursor`].
///
/// Each poll advances the backend by at most one record. Dropping the stream
/// releases whatever the backend holds for it.
pub type RecordStream = BoxStream<'static, Result<Value>>;

/// What a backend does natively and what it emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Range scans and ordering are served by the backend itself
    pub native_ordering: bool,
    /// Counting does not touch record bodies
    pub native_count: bool,
    /// Transactions are isolated by the backend. When false, transactions are
    /// snapshot+restore: atomic, but concurrent writers are not isolated.
    pub native_transactions: bool,
}

/// Parameters for bulk reads, counts and cursors.
///
/// `count` ignores `limit` and `direction`; `cursor` ignores `limit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Read through this index instead of the primary key
    pub index: Option<IndexName>,
    /// Restrict keys (or index values) to this range
    pub range: Option<KeyRange>,
    /// Maximum number of records
    pub limit: Option<usize>,
    /// Traversal order
    pub direction: Direction,
}

impl ScanOptions {
    /// Scan every record by primary key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style index selection.
    pub fn index(mut self, index: impl Into<IndexName>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Builder-style range.
    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Builder-style limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Builder-style direction.
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Whether the range (if any) can match nothing.
    pub fn is_empty_range(&self) -> bool {
        self.range.as_ref().is_some_and(KeyRange::is_empty) || self.limit == Some(0)
    }
}

/// One open database on some backend.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Name of the backend, used in error and log context.
    fn adapter_name(&self) -> &'static str;

    /// Fidelity flags for this backend.
    fn capabilities(&self) -> Capabilities;

    /// The schema this connection was opened with.
    fn schema(&self) -> &Schema;

    /// Fetch one record by primary key.
    async fn get(&self, store: &str, key: &Key) -> Result<Option<Value>>;

    /// Fetch records ordered by key (or index value, ties by primary key).
    async fn get_all(&self, store: &str, options: &ScanOptions) -> Result<Vec<Value>>;

    /// Fetch records positionally; missing keys yield `None`.
    async fn get_many(&self, store: &str, keys: &[Key]) -> Result<Vec<Option<Value>>>;

    /// Count records without materializing them where the backend allows.
    async fn count(&self, store: &str, options: &ScanOptions) -> Result<usize>;

    /// Insert or replace a record, returning its key. Auto-increment stores
    /// assign the next key when the record has none.
    async fn put(&self, store: &str, value: Value) -> Result<Key>;

    /// Write several records in order, returning their keys. Bundled adapters
    /// apply the batch atomically.
    async fn put_many(&self, store: &str, values: Vec<Value>) -> Result<Vec<Key>>;

    /// Remove a record. Missing keys are not an error.
    async fn delete(&self, store: &str, key: &Key) -> Result<()>;

    /// Remove every record in a store.
    async fn clear(&self, store: &str) -> Result<()>;

    /// Open a lazy cursor.
    async fn cursor(&self, store: &str, options: &ScanOptions) -> Result<RecordStream>;

    /// Start a transaction over the named stores.
    async fn begin(&self, stores: &[StoreName]) -> Result<Box<dyn TransactionScope>>;

    /// Release backend resources. Further calls fail with `Closed`.
    async fn close(&self) -> Result<()>;
}

/// The adapter half of a transaction.
#[async_trait]
pub trait TransactionScope: Send + Sync {
    /// A connection whose operations run inside this transaction and are
    /// restricted to its stores.
    fn connection(&self) -> Arc<dyn Connection>;

    /// Make all writes permanent.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Undo all writes made through [`TransactionScope::connection`].
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A storage backend: opens and destroys named databases.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Backend name.
    fn name(&self) -> &'static str;

    /// The persisted schema of a database, or `None` if it does not exist.
    async fn describe(&self, database: &str) -> Result<Option<Schema>>;

    /// Open (creating or upgrading as needed) a database with `schema`.
    async fn open(&self, database: &str, schema: &Schema) -> Result<Arc<dyn Connection>>;

    /// Delete a database and all its data. Missing databases are not an error.
    async fn destroy(&self, database: &str) -> Result<()>;
}

/// Primary key and record pairs ordered for a scan.
///
/// Used by adapters that order in-process: sorts `(sort_key, primary_key)`
/// pairs, applies direction and limit.
pub(crate) fn order_entries<T>(
    mut entries: Vec<(Key, Key, T)>,
    options: &ScanOptions,
) -> Vec<(Key, Key, T)> {
    entries.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    if options.direction.is_reverse() {
        entries.reverse();
    }
    if let Some(limit) = options.limit {
        entries.truncate(limit);
    }
    entries
}
