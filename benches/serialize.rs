use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::{json, Value as JsonValue};

use tbone::{Collection, DerivedValue, Field, MemoryStore, Model, ModelSignals, Schema, Value};

fn order_schema() -> Arc<Schema> {
    let line = Schema::builder("Line")
        .field("sku", Field::string().required())
        .field("qty", Field::integer().min(1.0))
        .field("price", Field::float())
        .build()
        .unwrap();
    Schema::builder("Order")
        .field("_id", Field::object_id().primary_key())
        .field("customer", Field::email())
        .field("placed_at", Field::datetime())
        .field("lines", Field::list(Field::model(&line)))
        .field("tags", Field::dict(Field::string()))
        .derived(DerivedValue::computed("line_count", |m| {
            let n = m.get("lines").and_then(Value::as_list).map_or(0, <[Value]>::len);
            Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
        }))
        .build()
        .unwrap()
}

fn order_data(lines: usize) -> JsonValue {
    let lines: Vec<JsonValue> = (0..lines)
        .map(|i| json!({"sku": format!("sku-{i}"), "qty": i + 1, "price": 9.5}))
        .collect();
    json!({
        "customer": "buyer@example.com",
        "placed_at": "2024-05-01T12:00:00Z",
        "lines": lines,
        "tags": {"channel": "web", "promo": "spring"},
    })
}

fn bench_import(c: &mut Criterion) {
    let schema = order_schema();
    let data = order_data(32);
    let mut group = c.benchmark_group("model/import");
    group.throughput(Throughput::Elements(32));
    group.bench_function("order_32_lines", |b| {
        b.iter(|| Model::from_data(&schema, black_box(&data)).unwrap());
    });
    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let schema = order_schema();
    let model = Model::from_data(&schema, &order_data(32)).unwrap();
    c.bench_function("model/serialize_order_32_lines", |b| {
        b.iter(|| runtime.block_on(black_box(&model).serialize()).unwrap());
    });

    let models: Vec<Model> = (0..64)
        .map(|_| Model::from_data(&schema, &order_data(8)).unwrap())
        .collect();
    let orders = Collection::builder(&schema)
        .signals(Arc::new(ModelSignals::new()))
        .build()
        .unwrap();
    let mut group = c.benchmark_group("collection/serialize_many");
    group.throughput(Throughput::Elements(64));
    group.bench_function("orders_64", |b| {
        b.iter(|| runtime.block_on(orders.serialize_many(black_box(&models))).unwrap());
    });
    group.finish();
}

fn bench_save(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let schema = order_schema();
    let orders = Collection::builder(&schema)
        .signals(Arc::new(ModelSignals::new()))
        .build()
        .unwrap();
    let data = order_data(4);
    c.bench_function("collection/save_new_order", |b| {
        b.iter_batched(
            || {
                (
                    MemoryStore::new().into_handle(),
                    Model::from_data(&schema, &data).unwrap(),
                )
            },
            |(store, mut order)| runtime.block_on(orders.save(&store, &mut order)).unwrap(),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(serialize, bench_import, bench_serialize, bench_save);
criterion_main!(serialize);
