//! Benchmarks for the ingest hot path
//!
//! Run with: cargo bench

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use meterline::ingest::{normalize_event, Deduplicator};
use meterline::storage::{EventIdentity, SqliteStore};
use std::sync::Arc;

fn payload(seq: i64) -> Vec<u8> {
    format!(
        r#"{{"DEVICE_ID":100000,"ID":{seq},"TS":{},"Type":6,"Details":{{"cell_info":{{"cell_towers":{{"mcc":404,"mnc":45,"lac":1234,"cid":56789}}}}}}}}"#,
        1_699_000_000 + seq
    )
    .into_bytes()
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");
    let raw = payload(1);

    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("event", |b| {
        b.iter(|| normalize_event(black_box(&raw), Utc::now()).unwrap())
    });

    let invalid = br#"{"ID":1,"TS":1000,"Type":6}"#.to_vec();
    group.bench_function("missing_device_id", |b| {
        b.iter(|| normalize_event(black_box(&invalid), Utc::now()).unwrap_err())
    });

    group.finish();
}

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for capacity in [1_000, 10_000] {
        let dedup = Deduplicator::new(Arc::new(SqliteStore::open_in_memory().unwrap()), capacity);

        group.bench_function(format!("fresh_cap_{}", capacity), |b| {
            let mut seq = 0;
            b.iter(|| {
                seq += 1;
                rt.block_on(dedup.check(EventIdentity::new(100000, seq, 1000)))
            })
        });

        let repeated = EventIdentity::new(1, 1, 1000);
        rt.block_on(dedup.check(repeated));
        group.bench_function(format!("repeat_cap_{}", capacity), |b| {
            b.iter(|| rt.block_on(dedup.check(black_box(repeated))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_normalize, bench_dedup);
criterion_main!(benches);
