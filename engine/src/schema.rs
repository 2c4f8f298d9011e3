//! Schema definition and the builder used while opening a database.
//!
//! A [`Schema`] describes every store in a database: its primary key path,
//! whether keys are generated, and its secondary indexes. Schemas are built by
//! running caller callbacks against a [`SchemaBuilder`], either once (a plain
//! schema callback) or once per version step (migrations).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Result, key, Error, IndexName, Key, SchemaVersion, StoreName};

/// Definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    /// Index name, used by `where_index`
    pub name: IndexName,
    /// Field path the index is built over
    pub key_path: String,
    /// Whether two records may share an index value
    pub unique: bool,
}

impl IndexDef {
    /// A non-unique index named after its field.
    pub fn new(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: field.clone(),
            key_path: field,
            unique: false,
        }
    }

    /// A unique index named after its field.
    pub fn unique(field: impl Into<String>) -> Self {
        Self {
            unique: true,
            ..Self::new(field)
        }
    }

    /// Rename the index while keeping its field path.
    pub fn named(mut self, name: impl Into<IndexName>) -> Self {
        self.name = name.into();
        self
    }

    /// Extract this index's value from a record.
    pub fn value_of(&self, record: &Value) -> Option<Key> {
        key::key_at(record, &self.key_path)
    }
}

/// Options accepted by [`SchemaBuilder::create_store`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreOptions {
    /// Primary key field path (defaults to `id`)
    pub key: Option<String>,
    /// Generate integer keys for records that lack one
    pub auto_increment: bool,
    /// Secondary indexes
    pub indexes: Vec<IndexDef>,
}

impl StoreOptions {
    /// Options with the given primary key path.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Builder-style autoIncrement switch.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Builder-style index addition.
    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }
}

/// Schema for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    /// Store name
    pub name: StoreName,
    /// Primary key field path
    pub key_path: String,
    /// Whether keys are generated on insert
    pub auto_increment: bool,
    /// Secondary indexes
    pub indexes: Vec<IndexDef>,
}

impl StoreSchema {
    /// Create a store schema from builder options.
    pub fn new(name: impl Into<StoreName>, options: StoreOptions) -> Self {
        Self {
            name: name.into(),
            key_path: options.key.unwrap_or_else(|| "id".to_string()),
            auto_increment: options.auto_increment,
            indexes: options.indexes,
        }
    }

    /// Get an index definition by name.
    pub fn index(&self, name: &str) -> Result<&IndexDef> {
        self.indexes
            .iter()
            .find(|idx| idx.name == name)
            .ok_or_else(|| Error::IndexNotFound {
                store: self.name.clone(),
                index: name.to_string(),
            })
    }

    /// Extract the primary key of a record, if present.
    pub fn key_of(&self, record: &Value) -> Option<Key> {
        key::key_at(record, &self.key_path)
    }

    /// Validate a record before it is written.
    ///
    /// Returns the record's key, or `None` when the store will generate one.
    pub fn validate_record(&self, record: &Value) -> Result<Option<Key>> {
        if !record.is_object() {
            return Err(Error::DataError(format!(
                "records in '{}' must be objects",
                self.name
            )));
        }
        match key::field(record, &self.key_path) {
            None | Some(Value::Null) if self.auto_increment => Ok(None),
            None | Some(Value::Null) => Err(Error::DataError(format!(
                "record in '{}' is missing its key '{}'",
                self.name, self.key_path
            ))),
            Some(value) => Key::try_from_value(value).map(Some),
        }
    }
}

/// Schema for the entire database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version
    pub version: SchemaVersion,
    /// Store schemas by name
    pub stores: BTreeMap<StoreName, StoreSchema>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            stores: BTreeMap::new(),
        }
    }

    /// Builder-style method to add a store.
    pub fn with_store(mut self, store: StoreSchema) -> Self {
        self.stores.insert(store.name.clone(), store);
        self
    }

    /// Get a store schema by name, failing with the list of declared stores.
    pub fn store(&self, name: &str) -> Result<&StoreSchema> {
        self.stores
            .get(name)
            .ok_or_else(|| Error::store_not_found(name, self.stores.keys()))
    }

    /// Names of all declared stores, sorted.
    pub fn store_names(&self) -> Vec<StoreName> {
        self.stores.keys().cloned().collect()
    }
}

/// Builder handed to schema and migration callbacks.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    stores: BTreeMap<StoreName, StoreSchema>,
}

impl SchemaBuilder {
    /// Start from the stores of an existing schema.
    pub fn from_existing(existing: Option<&Schema>) -> Self {
        Self {
            stores: existing.map(|s| s.stores.clone()).unwrap_or_default(),
        }
    }

    /// Declare a store. Re-declaring an existing store replaces its definition.
    pub fn create_store(&mut self, name: impl Into<StoreName>, options: StoreOptions) -> &mut Self {
        let store = StoreSchema::new(name, options);
        self.stores.insert(store.name.clone(), store);
        self
    }

    /// Remove a store.
    pub fn delete_store(&mut self, name: &str) -> &mut Self {
        self.stores.remove(name);
        self
    }

    /// Whether a store is declared.
    pub fn has_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Finish with the given version.
    pub fn build(self, version: SchemaVersion) -> Schema {
        Schema {
            version,
            stores: self.stores,
        }
    }
}

/// Callback run against the builder. The second argument is the version the
/// database had before this step (0 for a new database).
pub type SchemaFn = Arc<dyn Fn(&mut SchemaBuilder, SchemaVersion) -> Result<()> + Send + Sync>;

/// Wrap a closure as a [`SchemaFn`].
pub fn schema_fn<F>(f: F) -> SchemaFn
where
    F: Fn(&mut SchemaBuilder, SchemaVersion) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Either a single schema callback or a set of versioned migrations.
#[derive(Clone)]
pub enum SchemaSource {
    /// One callback describing the whole schema.
    Callback(SchemaFn),
    /// Callbacks keyed by the version they upgrade to.
    Migrations(BTreeMap<SchemaVersion, SchemaFn>),
}

impl std::fmt::Debug for SchemaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaSource::Callback(_) => f.write_str("Callback(..)"),
            SchemaSource::Migrations(m) => f
                .debug_tuple("Migrations")
                .field(&m.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

impl SchemaSource {
    /// The version this source targets when none is requested explicitly.
    pub fn inferred_version(&self) -> Option<SchemaVersion> {
        match self {
            SchemaSource::Callback(_) => None,
            SchemaSource::Migrations(m) => m.keys().next_back().copied(),
        }
    }

    /// Produce the schema for `version`, starting from what is persisted.
    pub fn resolve(&self, existing: Option<&Schema>, version: SchemaVersion) -> Result<Schema> {
        if version == 0 {
            return Err(Error::Config("schema version must be at least 1".into()));
        }
        let previous = existing.map(|s| s.version).unwrap_or(0);
        if version < previous {
            return Err(Error::VersionError {
                requested: version,
                existing: previous,
            });
        }

        let mut builder = SchemaBuilder::from_existing(existing);
        match self {
            SchemaSource::Callback(callback) => {
                callback(&mut builder, previous)?;
            }
            SchemaSource::Migrations(migrations) => {
                let mut current = previous;
                let pending = migrations
                    .iter()
                    .filter(|(step, _)| **step > previous && **step <= version);
                for (step, migration) in pending {
                    tracing::debug!(from = current, to = step, "running migration");
                    migration(&mut builder, current)?;
                    current = *step;
                }
            }
        }
        Ok(builder.build(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> StoreSchema {
        StoreSchema::new(
            "users",
            StoreOptions::key("id").index(IndexDef::unique("email")),
        )
    }

    #[test]
    fn validate_record_requires_key() {
        let store = users();
        assert_eq!(
            store.validate_record(&json!({"id": 1})).unwrap(),
            Some(Key::from(1))
        );
        assert!(matches!(
            store.validate_record(&json!({"name": "x"})),
            Err(Error::DataError(_))
        ));
        assert!(store.validate_record(&json!([1])).is_err());
        assert!(store.validate_record(&json!({"id": true})).is_err());
    }

    #[test]
    fn auto_increment_allows_missing_key() {
        let store = StoreSchema::new("logs", StoreOptions::default().auto_increment());
        assert_eq!(store.key_path, "id");
        assert_eq!(store.validate_record(&json!({"msg": "hi"})).unwrap(), None);
    }

    #[test]
    fn unknown_store_lists_available() {
        let schema = Schema::new(1).with_store(users());
        let err = schema.store("posts").unwrap_err();
        assert_eq!(
            err,
            Error::StoreNotFound {
                store: "posts".into(),
                available: vec!["users".into()],
            }
        );
        assert!(users().index("name").is_err());
    }

    #[test]
    fn migrations_run_above_existing_version() {
        let mut migrations: BTreeMap<SchemaVersion, SchemaFn> = BTreeMap::new();
        migrations.insert(
            1,
            schema_fn(|b, _| {
                b.create_store("users", StoreOptions::key("id"));
                Ok(())
            }),
        );
        migrations.insert(
            2,
            schema_fn(|b, prev| {
                assert_eq!(prev, 1);
                b.create_store("posts", StoreOptions::key("id"));
                Ok(())
            }),
        );
        let source = SchemaSource::Migrations(migrations);
        assert_eq!(source.inferred_version(), Some(2));

        let v1 = Schema::new(1).with_store(StoreSchema::new("users", StoreOptions::key("id")));
        let schema = source.resolve(Some(&v1), 2).unwrap();
        assert_eq!(schema.version, 2);
        assert_eq!(schema.store_names(), vec!["posts", "users"]);
    }

    #[test]
    fn downgrade_is_rejected() {
        let source = SchemaSource::Callback(schema_fn(|_, _| Ok(())));
        let existing = Schema::new(3);
        assert_eq!(
            source.resolve(Some(&existing), 2),
            Err(Error::VersionError {
                requested: 2,
                existing: 3
            })
        );
        assert!(matches!(source.resolve(None, 0), Err(Error::Config(_))));
    }
}
