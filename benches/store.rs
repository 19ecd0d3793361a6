//! Storage engine benchmarks
//!
//! Measures the hot paths of the store: record insertion, cached and
//! uncached point reads, and the sequential bitmap scan.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::tempdir;

use pagedb::{LenPrefixReader, PageStore, Record, Session, Storage};

fn setup(records: u32) -> (tempfile::TempDir, Arc<PageStore>, Storage, Vec<u32>) {
    let dir = tempdir().unwrap();
    let store = PageStore::builder()
        .path(dir.path().join("bench.db"))
        .page_size(1024)
        .open()
        .unwrap();
    let session = Session::new(1);
    let storage = store.get_storage(7, Arc::new(LenPrefixReader));
    let mut positions = Vec::with_capacity(records as usize);
    for i in 0..records {
        let mut rec = Record::new(LenPrefixReader::encode(&i.to_be_bytes()));
        positions.push(storage.add_record(&session, &mut rec, None).unwrap());
    }
    (dir, store, storage, positions)
}

fn bench_add_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_record");

    for payload in [16usize, 100, 500] {
        group.bench_with_input(
            BenchmarkId::from_parameter(payload),
            &payload,
            |b, &payload| {
                let dir = tempdir().unwrap();
                let store = PageStore::builder()
                    .path(dir.path().join("bench.db"))
                    .page_size(1024)
                    .open()
                    .unwrap();
                let session = Session::new(1);
                let storage = store.get_storage(7, Arc::new(LenPrefixReader));
                let body = vec![0xABu8; payload];
                b.iter(|| {
                    let mut rec = Record::new(LenPrefixReader::encode(black_box(&body)));
                    storage.add_record(&session, &mut rec, None).unwrap()
                });
            },
        );
    }

    group.finish();
}

fn bench_get_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_record");

    group.bench_function("cached", |b| {
        let (_dir, _store, storage, positions) = setup(256);
        let session = Session::new(1);
        let mut i = 0usize;
        b.iter(|| {
            let pos = positions[i % positions.len()];
            i += 1;
            storage.get_record(&session, black_box(pos)).unwrap()
        });
    });

    group.bench_function("from_disk", |b| {
        let (_dir, store, storage, positions) = setup(4096);
        store.checkpoint().unwrap();
        let session = Session::new(1);
        let mut i = 0usize;
        b.iter(|| {
            // With 4096 records against a 512-entry cache most probes miss.
            let pos = positions[(i * 17) % positions.len()];
            i += 1;
            storage.get_record(&session, black_box(pos)).unwrap()
        });
    });

    group.finish();
}

fn bench_sequential_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_scan");
    group.sample_size(20);

    group.bench_function("get_next_4096", |b| {
        let (_dir, _store, storage, _positions) = setup(4096);
        let session = Session::new(1);
        b.iter(|| {
            let mut count = 0u32;
            let mut current: Option<Record> = None;
            while let Some(pos) = storage.get_next(current.as_ref()) {
                current = Some(storage.get_record(&session, pos).unwrap());
                count += 1;
            }
            black_box(count)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_add_record,
    bench_get_record,
    bench_sequential_scan
);
criterion_main!(benches);
