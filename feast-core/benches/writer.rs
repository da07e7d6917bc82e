use chrono::{Duration, Utc};
use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use feast_core::model::{DataSource, FeatureRow, FeatureView, Field, ValueType};
use feast_core::onlinestore::memory::InMemoryOnlineStore;
use feast_core::types::{EntityKey, Value};
use feast_core::writer::ConflictResolvingWriter;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn view() -> FeatureView {
    FeatureView {
        name: "driver_hourly_stats".to_string(),
        entity_names: vec!["driver".to_string()],
        entity_columns: vec![Field::new("driver_id", ValueType::Int64)],
        features: vec![
            Field::new("conv_rate", ValueType::Float),
            Field::new("acc_rate", ValueType::Float),
        ],
        ttl: Duration::hours(2),
        source: DataSource::default(),
    }
}

fn rows(count: i64, distinct_keys: i64) -> Vec<FeatureRow> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            FeatureRow::new(
                EntityKey::single("driver_id", Value::int64(i % distinct_keys)),
                now + Duration::seconds(i),
            )
            .with_value("conv_rate", Value::float(i as f32 / 100.0))
            .with_value("acc_rate", Value::float(0.5))
        })
        .collect()
}

fn bench_writer(c: &mut Criterion) {
    let runtime = Runtime::new().expect("failed to create tokio runtime");
    let view = Arc::new(view());

    for (name, distinct) in [("write_batch_distinct_keys", 1000), ("write_batch_hot_keys", 10)] {
        c.bench_function(name, |b| {
            b.to_async(&runtime).iter_batched(
                || {
                    let store = Arc::new(InMemoryOnlineStore::new("bench".to_string()));
                    (ConflictResolvingWriter::new(store), rows(1000, distinct))
                },
                |(writer, rows)| {
                    let view = view.clone();
                    async move {
                        let summary = writer
                            .write_batch(&view, rows, None)
                            .await
                            .expect("write batch failed");
                        black_box(summary);
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
}

criterion_group!(writer_benches, bench_writer);
criterion_main!(writer_benches);
