//! Point-in-time copies of store contents.
//!
//! Backends without native transactions take a [`DatabaseSnapshot`] of the
//! stores a transaction touches and restore it on rollback.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{SchemaVersion, StoreName};

/// Contents of one store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreSnapshot {
    /// Records in ascending primary key order
    pub records: Vec<Value>,
    /// Next key the auto-increment generator hands out
    pub next_key: i64,
}

impl StoreSnapshot {
    /// Create a snapshot from key-ordered records.
    pub fn new(records: Vec<Value>, next_key: i64) -> Self {
        Self { records, next_key }
    }
}

/// Contents of a set of stores in one database.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseSnapshot {
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// Store contents by name
    pub stores: BTreeMap<StoreName, StoreSnapshot>,
}

impl DatabaseSnapshot {
    /// Create an empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            schema_version,
            stores: BTreeMap::new(),
        }
    }

    /// Add a store's contents.
    pub fn insert(&mut self, store: impl Into<StoreName>, contents: StoreSnapshot) {
        self.stores.insert(store.into(), contents);
    }

    /// Count records across all stores.
    pub fn record_count(&self) -> usize {
        self.stores.values().map(|s| s.records.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_records_across_stores() {
        let mut snapshot = DatabaseSnapshot::new(1);
        assert_eq!(snapshot.record_count(), 0);

        snapshot.insert(
            "users",
            StoreSnapshot::new(vec![json!({"id": 1}), json!({"id": 2})], 3),
        );
        snapshot.insert("logs", StoreSnapshot::new(vec![json!({"id": 1})], 2));
        assert_eq!(snapshot.record_count(), 3);
        assert_eq!(snapshot.stores["users"].next_key, 3);
    }

    #[test]
    fn inserting_a_store_twice_replaces_it() {
        let mut snapshot = DatabaseSnapshot::new(1);
        snapshot.insert("users", StoreSnapshot::new(vec![json!({"id": 1})], 2));
        snapshot.insert("users", StoreSnapshot::default());
        assert_eq!(snapshot.record_count(), 0);
        assert_eq!(snapshot.stores.len(), 1);
    }
}
