//! Lock manager benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use txdisk_bench::deep_path;
use txdisk_core::lock::LockManager;
use txdisk_core::{LockMode, TransactionId};

/// Uncontended acquire and release at increasing path depth.
fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_acquire_release");

    for depth in [1usize, 4, 16].iter() {
        for (name, mode) in [("shared", LockMode::Shared), ("exclusive", LockMode::Exclusive)] {
            group.bench_with_input(BenchmarkId::new(name, depth), depth, |b, &depth| {
                let locks = LockManager::new();
                let tx = TransactionId::new(1);
                let path = deep_path(depth, 0);
                b.iter(|| {
                    let grant = locks.acquire(tx, black_box(&path), mode, Duration::ZERO).unwrap();
                    black_box(grant);
                    locks.release(tx, &path);
                });
            });
        }
    }

    group.finish();
}

/// Many shared holders on one resource.
fn bench_shared_holders(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_shared_holders");

    for holders in [1u64, 16, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(holders), holders, |b, &holders| {
            let locks = LockManager::new();
            let path = deep_path(2, 0);
            for n in 0..holders {
                locks
                    .acquire(TransactionId::new(n + 1), &path, LockMode::Shared, Duration::ZERO)
                    .unwrap();
            }
            let tx = TransactionId::new(holders + 1);
            b.iter(|| {
                locks.acquire(tx, &path, LockMode::Shared, Duration::ZERO).unwrap();
                locks.release(tx, &path);
            });
        });
    }

    group.finish();
}

/// Releasing everything a transaction holds.
fn bench_release_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_release_all");

    for count in [10usize, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let locks = LockManager::new();
            let tx = TransactionId::new(1);
            let paths: Vec<_> = (0..count).map(|n| deep_path(3, n)).collect();
            b.iter(|| {
                for path in &paths {
                    locks.acquire(tx, path, LockMode::Exclusive, Duration::ZERO).unwrap();
                }
                locks.release_all(tx);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_shared_holders, bench_release_all);
criterion_main!(benches);
