//! SQLite backend through `sqlx`.
//!
//! One table per store holds `(key, value)` rows where `value` is the record
//! as JSON text. The key column has no declared type, so integers, reals and
//! text keep SQLite's native cross-type order, which matches [`Key`] ordering.
//! Indexes are expression indexes over `json_extract`, restricted to rows
//! whose indexed field is a number or string. Transactions are native.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode,
    SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Adapter, Capabilities, Connection, RecordStream, ScanOptions, TransactionScope};
use crate::{error::Result, key, Direction, Error, IndexDef, Key, Schema, StoreName, StoreSchema};

const NAME: &str = "sqlite";

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Run `$body` with `$conn: &mut SqliteConnection` borrowed from either the
/// pool or the open transaction.
macro_rules! with_conn {
    ($target:expr, $conn:ident => $body:expr) => {
        match $target {
            Target::Pool(pool) => {
                let mut pooled = pool.acquire().await?;
                let $conn: &mut SqliteConnection = &mut pooled;
                $body
            }
            Target::Tx(slot) => {
                let mut guard = slot.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionFinished)?;
                let $conn: &mut SqliteConnection = &mut **tx;
                $body
            }
        }
    };
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn table(store: &str) -> String {
    quote_ident(&format!("s_{store}"))
}

fn index_ident(store: &str, index: &str) -> String {
    quote_ident(&format!("i_{store}_{index}"))
}

fn json_path(path: &str) -> String {
    let segments: Vec<String> = path
        .split('.')
        .map(|segment| format!("\"{}\"", segment.replace('"', "")))
        .collect();
    quote_literal(&format!("$.{}", segments.join(".")))
}

fn index_expr(index: &IndexDef) -> String {
    format!("json_extract(value, {})", json_path(&index.key_path))
}

fn index_guard(index: &IndexDef) -> String {
    format!(
        "json_type(value, {}) IN ('integer', 'real', 'text')",
        json_path(&index.key_path)
    )
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

fn bind_keys<'q>(mut query: SqliteQuery<'q>, keys: &[Key]) -> SqliteQuery<'q> {
    for key in keys {
        query = match key {
            Key::Text(s) => query.bind(s.clone()),
            Key::Number(n) => match key.as_integer() {
                Some(i) => query.bind(i),
                None => query.bind(*n),
            },
        };
    }
    query
}

fn decode(row: &SqliteRow) -> Result<Value> {
    let body: String = row.try_get("value")?;
    Ok(serde_json::from_str(&body)?)
}

/// Map a write failure, turning unique index violations into `Constraint`.
fn write_error(store: &StoreSchema, record: &Value, err: sqlx::Error) -> Error {
    let Some(db_err) = err.as_database_error() else {
        return err.into();
    };
    if !db_err.is_unique_violation() {
        return err.into();
    }
    let message = db_err.message().to_string();
    let index = store
        .indexes
        .iter()
        .find(|idx| message.contains(&format!("i_{}_{}", store.name, idx.name)));
    Error::Constraint {
        store: store.name.clone(),
        index: index.map(|idx| idx.name.clone()).unwrap_or_default(),
        key: index
            .and_then(|idx| idx.value_of(record))
            .map(|k| k.to_string())
            .unwrap_or_default(),
    }
}

/// WHERE clauses and ordering for a scan.
#[derive(Debug, Clone)]
struct Scan {
    sort: String,
    clauses: Vec<String>,
    binds: Vec<Key>,
}

impl Scan {
    fn new(store: &StoreSchema, options: &ScanOptions) -> Result<Self> {
        let (sort, mut clauses) = match &options.index {
            None => ("key".to_string(), Vec::new()),
            Some(name) => {
                let index = store.index(name)?;
                (index_expr(index), vec![index_guard(index)])
            }
        };
        let mut binds = Vec::new();
        if let Some(range) = &options.range {
            if let Some(lower) = &range.lower {
                let op = if range.lower_open { ">" } else { ">=" };
                clauses.push(format!("{sort} {op} ?"));
                binds.push(lower.clone());
            }
            if let Some(upper) = &range.upper {
                let op = if range.upper_open { "<" } else { "<=" };
                clauses.push(format!("{sort} {op} ?"));
                binds.push(upper.clone());
            }
        }
        Ok(Self {
            sort,
            clauses,
            binds,
        })
    }

    fn order_sql(&self, direction: Direction) -> String {
        let dir = if direction.is_reverse() { "DESC" } else { "ASC" };
        if self.sort == "key" {
            format!("ORDER BY key {dir}")
        } else {
            format!("ORDER BY {} {dir}, key {dir}", self.sort)
        }
    }
}

async fn read_schema(conn: &mut SqliteConnection) -> Result<Option<Schema>> {
    let row = sqlx::query("SELECT value FROM _stow_meta WHERE name = 'schema'")
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|row| -> Result<Schema> {
        let body: String = row.try_get("value")?;
        Ok(serde_json::from_str(&body)?)
    })
    .transpose()
}

async fn ensure_meta(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS _stow_meta (name TEXT PRIMARY KEY, value TEXT NOT NULL)")
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _stow_sequences (store TEXT PRIMARY KEY, next INTEGER NOT NULL)",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn next_key(conn: &mut SqliteConnection, store: &str) -> Result<i64> {
    let row = sqlx::query("SELECT next FROM _stow_sequences WHERE store = ?")
        .bind(store)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(row.try_get::<i64, _>("next")?),
        None => Ok(1),
    }
}

async fn set_next_key(conn: &mut SqliteConnection, store: &str, next: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO _stow_sequences (store, next) VALUES (?, ?) \
         ON CONFLICT(store) DO UPDATE SET next = excluded.next",
    )
    .bind(store)
    .bind(next)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn put_one(conn: &mut SqliteConnection, store: &StoreSchema, mut value: Value) -> Result<Key> {
    let key = match store.validate_record(&value)? {
        Some(key) => key,
        None => {
            let next = next_key(conn, &store.name).await?;
            let key = key::generated_key(&store.name, &store.key_path, next)?;
            key::set_key(&mut value, &store.key_path, &key)?;
            key
        }
    };
    if store.auto_increment {
        let next = next_key(conn, &store.name).await?;
        let advanced = key::advance_generator(next, &key);
        if advanced != next {
            set_next_key(conn, &store.name, advanced).await?;
        }
    }
    let body = serde_json::to_string(&value)?;
    let sql = format!(
        "INSERT INTO {} (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        table(&store.name)
    );
    bind_keys(sqlx::query(&sql), std::slice::from_ref(&key))
        .bind(body)
        .execute(&mut *conn)
        .await
        .map_err(|err| write_error(store, &value, err))?;
    Ok(key)
}

async fn create_indexes(conn: &mut SqliteConnection, store: &StoreSchema) -> Result<()> {
    for index in &store.indexes {
        let sql = format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({}) WHERE {}",
            if index.unique { "UNIQUE " } else { "" },
            index_ident(&store.name, &index.name),
            table(&store.name),
            index_expr(index),
            index_guard(index),
        );
        sqlx::query(&sql)
            .execute(&mut *conn)
            .await
            .map_err(|err| write_error(store, &Value::Null, err))?;
    }
    Ok(())
}

async fn create_store(conn: &mut SqliteConnection, store: &StoreSchema) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (key PRIMARY KEY, value TEXT NOT NULL)",
        table(&store.name)
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    create_indexes(conn, store).await
}

async fn drop_store(conn: &mut SqliteConnection, name: &str) -> Result<()> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", table(name)))
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM _stow_sequences WHERE store = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Bring tables and indexes in line with `schema` inside one transaction.
async fn migrate(pool: &SqlitePool, schema: &Schema) -> Result<()> {
    let mut tx = pool.begin().await?;
    ensure_meta(&mut tx).await?;
    let previous = read_schema(&mut tx).await?.unwrap_or_default();

    for name in previous.stores.keys() {
        if !schema.stores.contains_key(name) {
            drop_store(&mut tx, name).await?;
        }
    }
    for (name, store) in &schema.stores {
        match previous.stores.get(name) {
            Some(old) if old == store => {}
            Some(old) if old.key_path != store.key_path => {
                // Keys move with the key path: rewrite every row
                let sql = format!("SELECT value FROM {} ORDER BY key", table(name));
                let rows = sqlx::query(&sql).fetch_all(&mut *tx).await?;
                let next = next_key(&mut tx, name).await?;
                sqlx::query(&format!("DROP TABLE {}", table(name)))
                    .execute(&mut *tx)
                    .await?;
                create_store(&mut tx, store).await?;
                for row in rows {
                    put_one(&mut tx, store, decode(&row)?).await?;
                }
                if next_key(&mut tx, name).await? < next {
                    set_next_key(&mut tx, name, next).await?;
                }
            }
            Some(old) => {
                for index in &old.indexes {
                    let sql = format!("DROP INDEX IF EXISTS {}", index_ident(name, &index.name));
                    sqlx::query(&sql).execute(&mut *tx).await?;
                }
                create_indexes(&mut tx, store).await?;
            }
            None => create_store(&mut tx, store).await?,
        }
    }

    sqlx::query(
        "INSERT INTO _stow_meta (name, value) VALUES ('schema', ?) \
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
    )
    .bind(serde_json::to_string(schema)?)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Clone)]
enum Location {
    /// Databases are named `/stow-<id>-<name>` in the process-wide `memdb` VFS.
    Memory(Uuid),
    Directory(PathBuf),
}

/// Backend storing each database in SQLite.
///
/// In-memory databases live as long as the adapter and are private to it.
/// They use SQLite's `memdb` VFS, so every pooled connection sees the same
/// database with ordinary file locking: reads outside an open transaction see
/// the last committed state, while outside writes wait for the commit.
#[derive(Clone)]
pub struct SqliteAdapter {
    location: Location,
    pools: Arc<DashMap<String, SqlitePool>>,
}

impl SqliteAdapter {
    /// Keep databases in memory.
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory(Uuid::new_v4()),
            pools: Arc::new(DashMap::new()),
        }
    }

    /// Keep each database in `<dir>/<name>.sqlite3`.
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::Directory(dir.into()),
            pools: Arc::new(DashMap::new()),
        }
    }

    fn path(&self, database: &str) -> Option<PathBuf> {
        match &self.location {
            Location::Memory(_) => None,
            Location::Directory(dir) => Some(dir.join(format!("{database}.sqlite3"))),
        }
    }

    async fn pool(&self, database: &str) -> Result<SqlitePool> {
        if let Some(pool) = self.pools.get(database) {
            return Ok(pool.clone());
        }
        let pool = match &self.location {
            Location::Memory(id) => {
                let options = SqliteConnectOptions::new()
                    .filename(format!("/stow-{id}-{database}"))
                    .vfs("memdb")
                    .journal_mode(SqliteJournalMode::Memory)
                    .create_if_missing(true);
                // The database lives while one connection stays open
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .min_connections(1)
                    .idle_timeout(None::<Duration>)
                    .max_lifetime(None::<Duration>)
                    .connect_with(options)
                    .await?
            }
            Location::Directory(dir) => {
                let options = SqliteConnectOptions::new()
                    .filename(dir.join(format!("{database}.sqlite3")))
                    .create_if_missing(true);
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await?
            }
        };
        Ok(self
            .pools
            .entry(database.to_string())
            .or_insert(pool)
            .clone())
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn describe(&self, database: &str) -> Result<Option<Schema>> {
        let known = self.pools.contains_key(database)
            || self.path(database).is_some_and(|path| path.exists());
        if !known {
            return Ok(None);
        }
        let pool = self.pool(database).await?;
        let mut conn = pool.acquire().await?;
        ensure_meta(&mut conn).await?;
        read_schema(&mut conn).await
    }

    async fn open(&self, database: &str, schema: &Schema) -> Result<Arc<dyn Connection>> {
        let pool = self.pool(database).await?;
        migrate(&pool, schema).await?;
        tracing::debug!(database, version = schema.version, "opened sqlite database");
        Ok(Arc::new(SqliteHandle {
            target: Target::Pool(pool),
            schema: Arc::new(schema.clone()),
            scope: None,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn destroy(&self, database: &str) -> Result<()> {
        if let Some((_, pool)) = self.pools.remove(database) {
            pool.close().await;
        }
        if let Some(path) = self.path(database) {
            for suffix in ["", "-wal", "-shm"] {
                let mut file = path.clone().into_os_string();
                file.push(suffix);
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(Error::backend(NAME, err)),
                }
            }
        }
        Ok(())
    }
}

type TxSlot = Arc<Mutex<Option<sqlx::Transaction<'static, Sqlite>>>>;

#[derive(Clone)]
enum Target {
    Pool(SqlitePool),
    Tx(TxSlot),
}

#[derive(Clone)]
struct SqliteHandle {
    target: Target,
    schema: Arc<Schema>,
    /// Stores a transaction may touch; `None` outside transactions.
    scope: Option<Arc<Vec<StoreName>>>,
    closed: Arc<AtomicBool>,
}

impl SqliteHandle {
    fn store_schema(&self, store: &str) -> Result<&StoreSchema> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if let Some(scope) = &self.scope {
            if !scope.iter().any(|s| s == store) {
                return Err(Error::StoreNotInTransaction(store.to_string()));
            }
        }
        self.schema.store(store)
    }
}

#[async_trait]
impl Connection for SqliteHandle {
    fn adapter_name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_ordering: true,
            native_count: true,
            native_transactions: true,
        }
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        self.store_schema(store)?;
        let sql = format!("SELECT value FROM {} WHERE key = ?", table(store));
        let row = with_conn!(&self.target, conn => {
            bind_keys(sqlx::query(&sql), std::slice::from_ref(key))
                .fetch_optional(conn)
                .await?
        });
        row.as_ref().map(decode).transpose()
    }

    async fn get_all(&self, store: &str, options: &ScanOptions) -> Result<Vec<Value>> {
        let schema = self.store_schema(store)?;
        if options.is_empty_range() {
            return Ok(Vec::new());
        }
        let scan = Scan::new(schema, options)?;
        let sql = format!(
            "SELECT value FROM {} {} {} LIMIT ?",
            table(store),
            where_sql(&scan.clauses),
            scan.order_sql(options.direction)
        );
        let limit = options.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = with_conn!(&self.target, conn => {
            bind_keys(sqlx::query(&sql), &scan.binds)
                .bind(limit)
                .fetch_all(conn)
                .await?
        });
        rows.iter().map(decode).collect()
    }

    async fn get_many(&self, store: &str, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        self.store_schema(store)?;
        let sql = format!("SELECT value FROM {} WHERE key = ?", table(store));
        with_conn!(&self.target, conn => {
            let mut records = Vec::with_capacity(keys.len());
            for key in keys {
                let row = bind_keys(sqlx::query(&sql), std::slice::from_ref(key))
                    .fetch_optional(&mut *conn)
                    .await?;
                records.push(row.as_ref().map(decode).transpose()?);
            }
            Ok(records)
        })
    }

    async fn count(&self, store: &str, options: &ScanOptions) -> Result<usize> {
        let schema = self.store_schema(store)?;
        if options.range.as_ref().is_some_and(|r| r.is_empty()) {
            return Ok(0);
        }
        let scan = Scan::new(schema, options)?;
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} {}",
            table(store),
            where_sql(&scan.clauses)
        );
        let row = with_conn!(&self.target, conn => {
            bind_keys(sqlx::query(&sql), &scan.binds).fetch_one(conn).await?
        });
        Ok(row.try_get::<i64, _>("n")? as usize)
    }

    async fn put(&self, store: &str, value: Value) -> Result<Key> {
        let schema = self.store_schema(store)?;
        with_conn!(&self.target, conn => {
            let mut tx = sqlx::Connection::begin(conn).await?;
            let key = put_one(&mut tx, schema, value).await?;
            tx.commit().await?;
            Ok(key)
        })
    }

    async fn put_many(&self, store: &str, values: Vec<Value>) -> Result<Vec<Key>> {
        let schema = self.store_schema(store)?;
        with_conn!(&self.target, conn => {
            let mut tx = sqlx::Connection::begin(conn).await?;
            let mut keys = Vec::with_capacity(values.len());
            for value in values {
                keys.push(put_one(&mut tx, schema, value).await?);
            }
            tx.commit().await?;
            Ok(keys)
        })
    }

    async fn delete(&self, store: &str, key: &Key) -> Result<()> {
        self.store_schema(store)?;
        let sql = format!("DELETE FROM {} WHERE key = ?", table(store));
        with_conn!(&self.target, conn => {
            bind_keys(sqlx::query(&sql), std::slice::from_ref(key))
                .execute(conn)
                .await?;
        });
        Ok(())
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.store_schema(store)?;
        let sql = format!("DELETE FROM {}", table(store));
        with_conn!(&self.target, conn => {
            sqlx::query(&sql).execute(conn).await?;
        });
        Ok(())
    }

    async fn cursor(&self, store: &str, options: &ScanOptions) -> Result<RecordStream> {
        let schema = self.store_schema(store)?;
        let scan = Scan::new(schema, options)?;
        if options.range.as_ref().is_some_and(|r| r.is_empty()) {
            return Ok(stream::empty().boxed());
        }
        let index = match &options.index {
            Some(name) => Some(schema.index(name)?.clone()),
            None => None,
        };
        let cursor = SqliteCursor {
            target: self.target.clone(),
            store: schema.clone(),
            index,
            scan,
            direction: options.direction,
            last: None,
        };
        Ok(stream::unfold(Some(cursor), |state| async move {
            let mut cursor = state?;
            match cursor.advance().await {
                Ok(Some(value)) => Some((Ok(value), Some(cursor))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed())
    }

    async fn begin(&self, stores: &[StoreName]) -> Result<Box<dyn TransactionScope>> {
        let pool = match (&self.target, &self.scope) {
            (Target::Pool(pool), None) => pool,
            _ => return Err(Error::NestedTransaction),
        };
        for store in stores {
            self.store_schema(store)?;
        }
        let tx: TxSlot = Arc::new(Mutex::new(Some(pool.begin().await?)));
        let handle = SqliteHandle {
            target: Target::Tx(tx.clone()),
            schema: self.schema.clone(),
            scope: Some(Arc::new(stores.to_vec())),
            closed: self.closed.clone(),
        };
        Ok(Box::new(SqliteTransaction {
            tx,
            handle: Arc::new(handle),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Keyset-paginated cursor: each step is a single-row query after the last
/// position.
struct SqliteCursor {
    target: Target,
    store: StoreSchema,
    index: Option<IndexDef>,
    scan: Scan,
    direction: Direction,
    last: Option<(Key, Key)>,
}

impl SqliteCursor {
    async fn advance(&mut self) -> Result<Option<Value>> {
        let mut clauses = self.scan.clauses.clone();
        let mut binds = self.scan.binds.clone();
        if let Some((sort, pk)) = &self.last {
            let op = if self.direction.is_reverse() { "<" } else { ">" };
            match &self.index {
                None => {
                    clauses.push(format!("key {op} ?"));
                    binds.push(pk.clone());
                }
                Some(_) => {
                    clauses.push(format!("({}, key) {op} (?, ?)", self.scan.sort));
                    binds.push(sort.clone());
                    binds.push(pk.clone());
                }
            }
        }
        let sql = format!(
            "SELECT value FROM {} {} {} LIMIT 1",
            table(&self.store.name),
            where_sql(&clauses),
            self.scan.order_sql(self.direction)
        );
        let row = with_conn!(&self.target, conn => {
            bind_keys(sqlx::query(&sql), &binds).fetch_optional(conn).await?
        });
        let Some(row) = row else {
            return Ok(None);
        };
        let value = decode(&row)?;
        let pk = self.store.key_of(&value).ok_or_else(|| {
            Error::DataError(format!("stored record in '{}' has no key", self.store.name))
        })?;
        let sort = match &self.index {
            Some(index) => index.value_of(&value).unwrap_or_else(|| pk.clone()),
            None => pk.clone(),
        };
        self.last = Some((sort, pk));
        Ok(Some(value))
    }
}

struct SqliteTransaction {
    tx: TxSlot,
    handle: Arc<SqliteHandle>,
}

#[async_trait]
impl TransactionScope for SqliteTransaction {
    fn connection(&self) -> Arc<dyn Connection> {
        self.handle.clone()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or(Error::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or(Error::TransactionFinished)?;
        tx.rollback().await?;
        Ok(())
    }
}
