use criterion::{Criterion, black_box, criterion_group, criterion_main};
use feast_core::key_serialization::{deserialize_key, serialize_key, serialize_key_with_schema};
use feast_core::model::{Field, ValueType};
use feast_core::types::{EntityKey, Value};

fn composite_key() -> EntityKey {
    EntityKey::new(
        vec!["customer_id".to_string(), "driver_id".to_string()],
        vec![Value::string("customer-000042"), Value::int64(1005)],
    )
}

fn bench_key_serialization(c: &mut Criterion) {
    let single = EntityKey::single("driver_id", Value::int64(1005));
    let composite = composite_key();
    let schema = vec![
        Field::new("customer_id", ValueType::String),
        Field::new("driver_id", ValueType::Int64),
    ];
    let encoded = serialize_key(&composite).expect("composite key encodes");

    c.bench_function("serialize_single_int64_key", |b| {
        b.iter(|| black_box(serialize_key(black_box(&single))))
    });
    c.bench_function("serialize_composite_key_with_schema", |b| {
        b.iter(|| {
            black_box(serialize_key_with_schema(
                black_box(&schema),
                black_box(&composite.entity_values),
            ))
        })
    });
    c.bench_function("deserialize_composite_key", |b| {
        b.iter(|| black_box(deserialize_key(black_box(&encoded))))
    });
}

criterion_group!(key_serialization_benches, bench_key_serialization);
criterion_main!(key_serialization_benches);
