//! Edge case tests for stow-engine
//!
//! These tests cover boundary conditions and unusual inputs on every bundled
//! adapter.

mod common;

use common::{adapters, open_test_db};
use serde_json::{json, Value};
use stow_engine::adapter::Adapter;
use stow_engine::{Database, Error, IndexDef, Key, KeyRange, OpenOptions, StoreOptions};

use std::sync::Arc;

async fn open_items(name: &str, adapter: Arc<dyn Adapter>) -> Database {
    Database::open(
        name,
        OpenOptions::new().adapter(adapter).schema(|builder, _| {
            builder.create_store(
                "items",
                StoreOptions::key("id").index(IndexDef::new("name")),
            );
            builder.create_store(
                "nested",
                StoreOptions::key("meta.ref").index(IndexDef::new("meta.rank").named("rank")),
            );
            Ok(())
        }),
    )
    .await
    .unwrap()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[tokio::test]
async fn empty_string_key_and_fields() {
    for adapter in adapters() {
        let db = open_items("empty-strings", adapter).await;
        let items = db.store("items").unwrap();

        items.put(json!({"id": "", "name": ""})).await.unwrap();
        let record = items.get("").await.unwrap().unwrap();
        assert_eq!(record["name"], "");
        assert_eq!(
            items.where_index("name").unwrap().equals("").count().await.unwrap(),
            1,
            "{}",
            db.adapter_name()
        );
    }
}

#[tokio::test]
async fn unicode_keys_sort_by_bytes() {
    for adapter in adapters() {
        let db = open_items("unicode", adapter).await;
        let items = db.store("items").unwrap();

        let names = ["日本語", "Привет", "🎉🚀", "Zebra", "apple", "Hello\nWorld"];
        for name in names {
            items.put(json!({"id": name, "name": name})).await.unwrap();
        }

        let mut expected: Vec<&str> = names.to_vec();
        expected.sort();
        let found: Vec<Value> = items.all().keys().await.unwrap().iter().map(Key::to_value).collect();
        let expected: Vec<Value> = expected.into_iter().map(Value::from).collect();
        assert_eq!(found, expected, "{}", db.adapter_name());
    }
}

#[tokio::test]
async fn very_long_strings() {
    for adapter in adapters() {
        let db = open_items("long-strings", adapter).await;
        let items = db.store("items").unwrap();
        let long = "x".repeat(100_000);

        items.put(json!({"id": long.clone(), "name": long})).await.unwrap();
        let record = items.get(long.as_str()).await.unwrap().unwrap();
        assert_eq!(record["name"].as_str().map(str::len), Some(100_000));
    }
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[tokio::test]
async fn integer_and_float_keys_are_the_same_key() {
    for adapter in adapters() {
        let db = open_items("int-float", adapter).await;
        let items = db.store("items").unwrap();

        items.put(json!({"id": 1, "name": "int"})).await.unwrap();
        items.put(json!({"id": 1.0, "name": "float"})).await.unwrap();
        assert_eq!(items.all().count().await.unwrap(), 1, "{}", db.adapter_name());
        assert_eq!(items.get(1).await.unwrap().unwrap()["name"], "float");
    }
}

#[tokio::test]
async fn negative_zero_normalizes() {
    assert_eq!(Key::number(-0.0), Key::number(0.0));
    assert_eq!(Key::from_value(&json!(-0.0)), Some(Key::from(0)));

    for adapter in adapters() {
        let db = open_items("negative-zero", adapter).await;
        let items = db.store("items").unwrap();
        items.put(json!({"id": -0.0, "name": "zero"})).await.unwrap();
        assert!(items.get(0).await.unwrap().is_some(), "{}", db.adapter_name());
    }
}

#[tokio::test]
async fn large_and_fractional_keys_order_numerically() {
    for adapter in adapters() {
        let db = open_items("numeric-order", adapter).await;
        let items = db.store("items").unwrap();
        for id in [json!(1e15), json!(-2.5), json!(0.25), json!(-1e15), json!(3)] {
            items.put(json!({"id": id, "name": "n"})).await.unwrap();
        }

        let keys: Vec<Value> = items.all().keys().await.unwrap().iter().map(Key::to_value).collect();
        assert_eq!(
            keys,
            vec![json!(-1_000_000_000_000_000i64), json!(-2.5), json!(0.25), json!(3), json!(1_000_000_000_000_000i64)],
            "{}",
            db.adapter_name()
        );
    }
}

#[test]
fn nan_and_infinity_are_not_keys() {
    assert_eq!(Key::number(f64::NAN), None);
    assert_eq!(Key::number(f64::INFINITY), None);
    assert!(matches!(
        Key::try_from_value(&json!(null)),
        Err(Error::DataError(_))
    ));
}

// ============================================================================
// JSON Edge Cases
// ============================================================================

#[tokio::test]
async fn deeply_nested_json_round_trips() {
    for adapter in adapters() {
        let db = open_items("nested-json", adapter).await;
        let items = db.store("items").unwrap();

        let mut nested = json!({"leaf": [1, 2.5, "three", null, true, {}]});
        for depth in 0..40 {
            nested = json!({"level": depth, "child": nested});
        }
        let record = json!({"id": 1, "name": "deep", "tree": nested});
        items.put(record.clone()).await.unwrap();
        assert_eq!(items.get(1).await.unwrap(), Some(record), "{}", db.adapter_name());
    }
}

#[tokio::test]
async fn dotted_key_paths() {
    for adapter in adapters() {
        let db = open_items("dotted", adapter).await;
        let nested = db.store("nested").unwrap();

        nested.put(json!({"meta": {"ref": "b", "rank": 2}})).await.unwrap();
        nested.put(json!({"meta": {"ref": "a", "rank": 1}})).await.unwrap();
        assert!(matches!(
            nested.put(json!({"meta": {}})).await,
            Err(Error::DataError(_))
        ));

        let ranked = nested.where_index("rank").unwrap().desc().keys().await.unwrap();
        assert_eq!(ranked, vec![Key::from("b"), Key::from("a")], "{}", db.adapter_name());
    }
}

// ============================================================================
// Range Edge Cases
// ============================================================================

#[tokio::test]
async fn ranges_spanning_numbers_and_strings() {
    for adapter in adapters() {
        let db = open_items("spanning", adapter).await;
        let items = db.store("items").unwrap();
        for id in [json!(5), json!(50), json!("5"), json!("a")] {
            items.put(json!({"id": id, "name": "x"})).await.unwrap();
        }

        let from_ten: Vec<Value> = items.all().gte(10).keys().await.unwrap().iter().map(Key::to_value).collect();
        assert_eq!(from_ten, vec![json!(50), json!("5"), json!("a")], "{}", db.adapter_name());

        let below_text = items.all().lt("").count().await.unwrap();
        assert_eq!(below_text, 2, "{}", db.adapter_name());
    }
}

#[test]
fn range_serializes_with_camel_case_keys() {
    let range = KeyRange::bound(1, "z", true, false).unwrap();
    assert_eq!(
        serde_json::to_value(&range).unwrap(),
        json!({"lower": 1, "lowerOpen": true, "upper": "z"})
    );
    let parsed: KeyRange = serde_json::from_value(json!({"upper": 3, "upperOpen": true})).unwrap();
    assert_eq!(parsed, KeyRange::upper_bound(3, true));
}

// ============================================================================
// Key Generator Edge Cases
// ============================================================================

#[tokio::test]
async fn huge_explicit_key_exhausts_the_generator() {
    for adapter in adapters() {
        let db = open_test_db("generator-exhausted", adapter).await;
        let logs = db.store("logs").unwrap();

        logs.put(json!({"id": 1e300, "m": "far"})).await.unwrap();
        for _ in 0..3 {
            let err = logs.put(json!({"m": "next"})).await.unwrap_err();
            assert!(matches!(err, Error::Constraint { .. }), "{}: {err}", db.adapter_name());
        }

        assert_eq!(logs.all().count().await.unwrap(), 1, "{}", db.adapter_name());
        let far = logs.all().first().await.unwrap().unwrap();
        assert_eq!(far["m"], "far");

        // Explicit keys still work once the generator is spent
        logs.put(json!({"id": 7, "m": "seven"})).await.unwrap();
        assert_eq!(logs.all().count().await.unwrap(), 2);
    }
}

#[tokio::test]
async fn generator_hands_out_keys_up_to_two_pow_53() {
    for adapter in adapters() {
        let db = open_test_db("generator-limit", adapter).await;
        let logs = db.store("logs").unwrap();

        let last = (1i64 << 53) - 1;
        logs.put(json!({"id": last - 1})).await.unwrap();
        assert_eq!(logs.put(json!({})).await.unwrap(), Key::from(last));
        assert_eq!(logs.put(json!({})).await.unwrap(), Key::from(1i64 << 53));
        assert!(
            matches!(logs.put(json!({})).await, Err(Error::Constraint { .. })),
            "{}",
            db.adapter_name()
        );
        assert_eq!(logs.all().count().await.unwrap(), 3);
    }
}

// ============================================================================
// Schema Edge Cases
// ============================================================================

#[tokio::test]
async fn schema_with_many_stores() {
    for adapter in adapters() {
        let db = Database::open(
            "many-stores",
            OpenOptions::new().adapter(adapter).schema(|builder, _| {
                for i in 0..40 {
                    builder.create_store(format!("store_{i:02}"), StoreOptions::key("id"));
                }
                Ok(())
            }),
        )
        .await
        .unwrap();

        assert_eq!(db.stores().len(), 40);
        let store = db.store("store_39").unwrap();
        store.put(json!({"id": 1})).await.unwrap();
        assert_eq!(store.all().count().await.unwrap(), 1);
    }
}

#[tokio::test]
async fn store_names_with_special_characters() {
    for adapter in adapters() {
        let db = Database::open(
            "special-names",
            OpenOptions::new().adapter(adapter).schema(|builder, _| {
                builder.create_store(
                    "user's \"data\"",
                    StoreOptions::key("the key").index(IndexDef::new("a-b")),
                );
                Ok(())
            }),
        )
        .await
        .unwrap();

        let store = db.store("user's \"data\"").unwrap();
        store.put(json!({"the key": "k'1", "a-b": 1})).await.unwrap();
        assert_eq!(
            store.where_index("a-b").unwrap().equals(1).keys().await.unwrap(),
            vec![Key::from("k'1")],
            "{}",
            db.adapter_name()
        );
    }
}

// ============================================================================
// Volume
// ============================================================================

#[tokio::test]
async fn many_records_in_one_batch() {
    for adapter in adapters() {
        let db = open_items("volume", adapter).await;
        let items = db.store("items").unwrap();
        let records = (0..2_000)
            .map(|i| json!({"id": i, "name": format!("n{}", i % 7)}))
            .collect();
        assert_eq!(items.put_many(records).await.unwrap(), 2_000);

        assert_eq!(items.all().count().await.unwrap(), 2_000);
        let last = items.all().desc().first().await.unwrap().unwrap();
        assert_eq!(last["id"], 1_999, "{}", db.adapter_name());
        let sevens = items.where_index("name").unwrap().equals("n0").count().await.unwrap();
        assert_eq!(sevens, 286);
    }
}
