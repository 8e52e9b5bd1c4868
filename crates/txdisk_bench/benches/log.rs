//! Durable log benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use txdisk_bench::commit_entry;
use txdisk_core::log::{DurableLog, LogOptions, LogOwner};
use txdisk_core::TransactionIdentifier;
use txdisk_storage::{DirSegmentStore, MemorySegmentStore, SegmentStore};

fn options() -> LogOptions {
    LogOptions {
        max_segment_size: 64 * 1024 * 1024,
        group_commit_window: Duration::from_millis(1),
        max_batch_bytes: 1024 * 1024,
        write_retries: 3,
    }
}

fn open(store: Arc<dyn SegmentStore>) -> DurableLog {
    DurableLog::open(store, options(), Vec::new()).unwrap()
}

/// Frame encoding cost per entry size.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_encode");

    for size in [64usize, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let entry = commit_entry(1, size);
            b.iter(|| entry.encode_frame().unwrap());
        });
    }

    group.finish();
}

/// A single committer waiting for each append.
fn bench_single_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_single_append");
    group.sample_size(20);

    group.bench_function("memory", |b| {
        let log = open(Arc::new(MemorySegmentStore::new()));
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let ident = TransactionIdentifier::Local(n);
            log.append_one(commit_entry(n, 256), LogOwner::Transaction(ident))
                .unwrap();
        });
        log.close();
    });

    group.bench_function("file", |b| {
        let dir = TempDir::new().unwrap();
        let log = open(Arc::new(DirSegmentStore::new(dir.path()).unwrap()));
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let ident = TransactionIdentifier::Local(n);
            log.append_one(commit_entry(n, 256), LogOwner::Transaction(ident))
                .unwrap();
        });
        log.close();
    });

    group.finish();
}

/// Concurrent committers sharing syncs through group commit.
fn bench_group_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_group_commit");
    group.sample_size(10);

    for threads in [1usize, 4, 16].iter() {
        group.throughput(Throughput::Elements((*threads * 16) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            let dir = TempDir::new().unwrap();
            let log = open(Arc::new(DirSegmentStore::new(dir.path()).unwrap()));
            b.iter(|| {
                thread::scope(|scope| {
                    for t in 0..threads {
                        let log = &log;
                        scope.spawn(move || {
                            for i in 0..16u64 {
                                let n = ((t as u64) << 32) | i;
                                let ident = TransactionIdentifier::Local(n);
                                log.append_one(commit_entry(n, 256), LogOwner::Transaction(ident))
                                    .unwrap();
                            }
                        });
                    }
                });
            });
            log.close();
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_single_append, bench_group_commit);
criterion_main!(benches);
