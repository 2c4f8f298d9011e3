//! Lazy query descriptors.
//!
//! A [`Query`] is an immutable description: every builder method returns a new
//! query and leaves the receiver untouched. Nothing touches the backend until
//! a terminal method runs.
//!
//! Terminal methods pick the cheapest plan:
//!
//! - `to_array` with no filter and no skip is a single `get_all` call.
//! - `count` with no filter is a single adapter `count` call.
//! - Everything else pulls records one at a time through one cursor, applies
//!   filters, then skip, then limit, and drops the cursor as soon as the limit
//!   is reached.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::adapter::{RecordStream, ScanOptions};
use crate::{error::Result, Direction, IndexName, Key, KeyRange, StoreAccessor};

/// A record filter.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A lazily evaluated query over one store.
#[derive(Clone)]
pub struct Query {
    store: StoreAccessor,
    index: Option<IndexName>,
    range: Option<KeyRange>,
    predicates: Vec<Predicate>,
    limit: Option<usize>,
    skip: usize,
    direction: Direction,
}

impl Query {
    pub(crate) fn new(store: StoreAccessor, index: Option<IndexName>) -> Self {
        Self {
            store,
            index,
            range: None,
            predicates: Vec::new(),
            limit: None,
            skip: 0,
            direction: Direction::Next,
        }
    }

    fn with(&self, update: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        update(&mut next);
        next
    }

    /// Narrow the key (or index value) range. Successive calls intersect.
    pub fn range(&self, range: KeyRange) -> Self {
        self.with(|q| {
            q.range = Some(match &q.range {
                Some(current) => current.intersect(&range),
                None => range,
            })
        })
    }

    /// Keys strictly above `key`.
    pub fn gt(&self, key: impl Into<Key>) -> Self {
        self.range(KeyRange::lower_bound(key, true))
    }

    /// Keys at or above `key`.
    pub fn gte(&self, key: impl Into<Key>) -> Self {
        self.range(KeyRange::lower_bound(key, false))
    }

    /// Keys strictly below `key`.
    pub fn lt(&self, key: impl Into<Key>) -> Self {
        self.range(KeyRange::upper_bound(key, true))
    }

    /// Keys at or below `key`.
    pub fn lte(&self, key: impl Into<Key>) -> Self {
        self.range(KeyRange::upper_bound(key, false))
    }

    /// Keys between `lower` and `upper`, both inclusive.
    pub fn between(&self, lower: impl Into<Key>, upper: impl Into<Key>) -> Self {
        self.gte(lower).lte(upper)
    }

    /// Exactly `key`.
    pub fn equals(&self, key: impl Into<Key>) -> Self {
        self.range(KeyRange::only(key))
    }

    /// Keep only records matching `predicate`. Filters compose with AND.
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let predicate: Predicate = Arc::new(predicate);
        self.with(|q| q.predicates.push(predicate))
    }

    /// Yield at most `n` records.
    pub fn limit(&self, n: usize) -> Self {
        self.with(|q| q.limit = Some(n))
    }

    /// Skip the first `n` matching records.
    pub fn skip(&self, n: usize) -> Self {
        self.with(|q| q.skip = n)
    }

    /// Ascending order.
    pub fn asc(&self) -> Self {
        self.with(|q| q.direction = Direction::Next)
    }

    /// Descending order.
    pub fn desc(&self) -> Self {
        self.with(|q| q.direction = Direction::Prev)
    }

    /// The accumulated range, if any.
    pub fn key_range(&self) -> Option<&KeyRange> {
        self.range.as_ref()
    }

    fn matches_nothing(&self) -> bool {
        self.limit == Some(0) || self.range.as_ref().is_some_and(KeyRange::is_empty)
    }

    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            index: self.index.clone(),
            range: self.range.clone(),
            limit: None,
            direction: self.direction,
        }
    }

    fn accepts(&self, record: &Value) -> bool {
        self.predicates.iter().all(|p| p(record))
    }

    /// Collect every matching record.
    pub async fn to_array(&self) -> Result<Vec<Value>> {
        if self.matches_nothing() {
            return Ok(Vec::new());
        }
        if self.predicates.is_empty() && self.skip == 0 {
            let options = ScanOptions {
                limit: self.limit,
                ..self.scan_options()
            };
            return self
                .store
                .connection()
                .get_all(self.store.name(), &options)
                .await;
        }
        self.stream().try_collect().await
    }

    /// The first matching record.
    pub async fn first(&self) -> Result<Option<Value>> {
        Ok(self.limit(1).to_array().await?.into_iter().next())
    }

    /// Count matching records. Limit and skip do not apply.
    pub async fn count(&self) -> Result<usize> {
        if self.range.as_ref().is_some_and(KeyRange::is_empty) {
            return Ok(0);
        }
        if self.predicates.is_empty() {
            return self
                .store
                .connection()
                .count(self.store.name(), &self.scan_options())
                .await;
        }
        let unbounded = self.with(|q| {
            q.limit = None;
            q.skip = 0;
        });
        unbounded
            .stream()
            .try_fold(0usize, |n, _| async move { Ok(n + 1) })
            .await
    }

    /// Primary keys of matching records.
    pub async fn keys(&self) -> Result<Vec<Key>> {
        let schema = self.store.schema();
        Ok(self
            .to_array()
            .await?
            .iter()
            .filter_map(|record| schema.key_of(record))
            .collect())
    }

    /// Delete every matching record, returning how many were deleted.
    pub async fn delete(&self) -> Result<usize> {
        let keys = self.keys().await?;
        for key in &keys {
            self.store.delete(key.clone()).await?;
        }
        Ok(keys.len())
    }

    /// Pull matching records one at a time.
    ///
    /// The cursor is opened on first poll and released when the stream ends,
    /// fails, reaches its limit, or is dropped.
    pub fn stream(&self) -> BoxStream<'static, Result<Value>> {
        if self.matches_nothing() {
            return stream::empty().boxed();
        }
        let state = QueryCursor {
            query: self.clone(),
            cursor: None,
            skipped: 0,
            yielded: 0,
        };
        stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            match state.next().await? {
                Ok(record) => Some((Ok(record), Some(state))),
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }

    /// Consume the query into its record stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<Value>> {
        self.stream()
    }
}

impl From<Query> for BoxStream<'static, Result<Value>> {
    fn from(query: Query) -> Self {
        query.stream()
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("store", &self.store.name())
            .field("index", &self.index)
            .field("range", &self.range)
            .field("filters", &self.predicates.len())
            .field("limit", &self.limit)
            .field("skip", &self.skip)
            .field("direction", &self.direction)
            .finish()
    }
}

struct QueryCursor {
    query: Query,
    cursor: Option<RecordStream>,
    skipped: usize,
    yielded: usize,
}

impl QueryCursor {
    async fn next(&mut self) -> Option<Result<Value>> {
        if self.query.limit.is_some_and(|limit| self.yielded >= limit) {
            self.cursor = None;
            return None;
        }
        if self.cursor.is_none() {
            let store = &self.query.store;
            match store
                .connection()
                .cursor(store.name(), &self.query.scan_options())
                .await
            {
                Ok(cursor) => self.cursor = Some(cursor),
                Err(err) => return Some(Err(err)),
            }
        }
        let cursor = self.cursor.as_mut()?;
        let outcome = loop {
            match cursor.next().await {
                None => break None,
                Some(Err(err)) => break Some(Err(err)),
                Some(Ok(record)) => {
                    if !self.query.accepts(&record) {
                        continue;
                    }
                    if self.skipped < self.query.skip {
                        self.skipped += 1;
                        continue;
                    }
                    self.yielded += 1;
                    break Some(Ok(record));
                }
            }
        };
        let exhausted = !matches!(outcome, Some(Ok(_)))
            || self.query.limit.is_some_and(|limit| self.yielded >= limit);
        if exhausted {
            self.cursor = None;
        }
        outcome
    }
}
