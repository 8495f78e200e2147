//! Benchmarks for seqkeep counters and reconciliation.
//!
//! Run with: cargo bench
//! View results in: target/criterion/report/index.html

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tempfile::TempDir;

use seqkeep::contracts::{Document, RecordRepository, SequenceStore};
use seqkeep::reconcile::{ReconcileConfig, SequencedCollection, TypeReconciler};
use seqkeep::storage::RocksDbStore;

fn create_store() -> (Arc<RocksDbStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RocksDbStore::open(dir.path()).unwrap());
    (store, dir)
}

// =============================================================================
// Allocation Benchmarks
// =============================================================================

fn bench_allocate_single_key(c: &mut Criterion) {
    let (store, _dir) = create_store();
    let mut group = c.benchmark_group("allocate");
    group.throughput(Throughput::Elements(1));
    group.bench_function("single_key", |b| {
        b.iter(|| store.allocate(black_box("orders")).unwrap());
    });
    group.finish();
}

fn bench_allocate_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_contended");
    group.sample_size(10);

    for threads in [2usize, 4, 8].iter() {
        let (store, _dir) = create_store();
        let per_thread = 200;
        group.throughput(Throughput::Elements((threads * per_thread) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let s = Arc::clone(&store);
                        thread::spawn(move || {
                            for _ in 0..per_thread {
                                s.allocate("orders").unwrap();
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_peek(c: &mut Criterion) {
    let (store, _dir) = create_store();
    store.advance_to("orders", 1_000).unwrap();
    c.bench_function("peek", |b| {
        b.iter(|| store.peek(black_box("orders")).unwrap());
    });
}

// =============================================================================
// Reconciliation Benchmarks
// =============================================================================

fn bench_reconcile_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");
    group.sample_size(10);

    for size in [1_000usize, 10_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_with_setup(
                || {
                    let (store, dir) = create_store();
                    for i in 0..size {
                        let doc = Document::new(format!("o-{:06}", i))
                            .with("order_number", json!(i.to_string()));
                        store.insert("orders", &doc).unwrap();
                    }
                    (store, dir)
                },
                |(store, _dir)| {
                    let reconciler = TypeReconciler::new(store, ReconcileConfig::default());
                    reconciler
                        .run(&SequencedCollection::new("orders", "order_number", "orders"))
                        .unwrap()
                },
            );
        });
    }

    group.finish();
}

criterion_group!(
    allocate_benches,
    bench_allocate_single_key,
    bench_allocate_contended,
    bench_peek,
);

criterion_group!(reconcile_benches, bench_reconcile_collection,);

criterion_main!(allocate_benches, reconcile_benches);
