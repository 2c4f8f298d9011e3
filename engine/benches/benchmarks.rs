//! Performance benchmarks for stow-engine

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use stow_engine::adapter::{Adapter, BlobAdapter, MemoryAdapter};
use stow_engine::{Database, Error, IndexDef, Key, OpenOptions, StoreOptions};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn adapters() -> Vec<(&'static str, Arc<dyn Adapter>)> {
    #[allow(unused_mut)]
    let mut list: Vec<(&'static str, Arc<dyn Adapter>)> = vec![
        ("memory", Arc::new(MemoryAdapter::new())),
        ("blob", Arc::new(BlobAdapter::new())),
    ];
    #[cfg(feature = "sqlite")]
    list.push(("sqlite", Arc::new(stow_engine::adapter::SqliteAdapter::in_memory())));
    list
}

fn open(rt: &Runtime, adapter: Arc<dyn Adapter>) -> Database {
    rt.block_on(Database::open(
        "bench",
        OpenOptions::new().adapter(adapter).schema(|builder, _| {
            builder.create_store(
                "users",
                StoreOptions::key("id").index(IndexDef::new("age")),
            );
            Ok(())
        }),
    ))
    .expect("open")
}

fn user(id: i64) -> Value {
    json!({"id": id, "name": format!("User {id}"), "age": id % 80})
}

fn seeded(rt: &Runtime, adapter: Arc<dyn Adapter>, size: i64) -> Database {
    let db = open(rt, adapter);
    let users = db.store("users").expect("users");
    rt.block_on(users.put_many((0..size).map(user).collect()))
        .expect("seed");
    db
}

fn bench_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("writes");
    let rt = runtime();

    for (name, adapter) in adapters() {
        let db = open(&rt, adapter);
        let users = db.store("users").expect("users");
        let mut id = 0i64;

        group.bench_function(BenchmarkId::new("put", name), |b| {
            b.iter(|| {
                id += 1;
                rt.block_on(users.put(black_box(user(id))))
            })
        });

        group.bench_function(BenchmarkId::new("put_many_100", name), |b| {
            b.iter(|| {
                let batch = (0..100).map(|_| {
                    id += 1;
                    user(id)
                });
                rt.block_on(users.put_many(black_box(batch.collect())))
            })
        });

        group.bench_function(BenchmarkId::new("transaction_10", name), |b| {
            b.iter(|| {
                let start = id;
                id += 10;
                rt.block_on(db.transaction(&["users"], |tx| async move {
                    let users = tx.store("users")?;
                    for i in start..start + 10 {
                        users.put(user(i)).await?;
                    }
                    Ok::<_, Error>(())
                }))
            })
        });
    }

    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("reads");
    let rt = runtime();

    for (name, adapter) in adapters() {
        let db = seeded(&rt, adapter, 1_000);
        let users = db.store("users").expect("users");

        group.bench_function(BenchmarkId::new("get", name), |b| {
            b.to_async(&rt).iter(|| users.get(black_box(500)))
        });

        let keys: Vec<Key> = (0..1_000i64).step_by(10).map(Key::from).collect();
        group.bench_function(BenchmarkId::new("get_many_100", name), |b| {
            b.to_async(&rt).iter(|| users.get_many(black_box(&keys)))
        });
    }

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");
    let rt = runtime();

    for size in [100i64, 1_000] {
        for (name, adapter) in adapters() {
            let db = seeded(&rt, adapter, size);
            let users = db.store("users").expect("users");
            let label = format!("{name}/{size}");

            // Bulk read path
            group.bench_function(BenchmarkId::new("range_to_array", &label), |b| {
                b.to_async(&rt)
                    .iter(|| async { users.all().between(10, size / 2).to_array().await })
            });

            // Filter forces the cursor path
            group.bench_function(BenchmarkId::new("filtered_to_array", &label), |b| {
                b.to_async(&rt).iter(|| async {
                    users
                        .all()
                        .between(10, size / 2)
                        .filter(|_| true)
                        .to_array()
                        .await
                })
            });

            group.bench_function(BenchmarkId::new("index_count", &label), |b| {
                b.to_async(&rt).iter(|| async {
                    users.where_index("age")?.gte(40).count().await
                })
            });

            group.bench_function(BenchmarkId::new("first_desc", &label), |b| {
                b.to_async(&rt).iter(|| async { users.all().desc().first().await })
            });
        }
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    group.bench_function("key_from_value", |b| {
        let value = json!("user_500");
        b.iter(|| Key::from_value(black_box(&value)))
    });

    group.bench_function("key_order", |b| {
        let keys: Vec<Key> = (0..1_000i64)
            .map(|i| {
                if i % 2 == 0 {
                    Key::from(i)
                } else {
                    Key::from(format!("k{i}"))
                }
            })
            .collect();
        b.iter(|| {
            let mut sorted = keys.clone();
            sorted.sort();
            sorted
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_writes,
    bench_reads,
    bench_queries,
    bench_serialization,
);
criterion_main!(benches);
