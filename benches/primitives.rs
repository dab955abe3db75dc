//! Benchmarks for the uncontended fast paths and pipeline throughput
//!
//! This benchmark measures:
//! - Permit acquire/release round trip
//! - Keyed lock/unlock with map bookkeeping
//! - Circuit breaker admission overhead
//! - End-to-end items per second through a two-stage pipeline

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowguard::pipeline::{BoxError, PipelineBuilder};
use flowguard::resilience::{CircuitBreaker, CircuitBreakerConfig};
use flowguard::{CancellationToken, KeyedLock, PermitPool};

fn bench_sync(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("sync");

    let pool = PermitPool::new(8).unwrap();
    group.bench_function("permit_try_acquire", |b| {
        b.iter(|| {
            let permit = pool.try_acquire();
            black_box(permit.is_some())
        })
    });
    group.bench_function("permit_acquire", |b| {
        b.to_async(&rt).iter(|| async {
            let permit = pool.acquire().await.unwrap();
            black_box(&permit);
        })
    });

    let locks: KeyedLock<u64> = KeyedLock::new();
    group.bench_function("keyed_lock_cycle", |b| {
        let mut key = 0u64;
        b.to_async(&rt).iter(|| {
            key = key.wrapping_add(1);
            let locks = locks.clone();
            let k = key % 64;
            async move {
                let guard = locks.lock(k).await;
                black_box(guard.key());
            }
        })
    });

    group.finish();
}

fn bench_breaker(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::new());

    c.bench_function("breaker_execute_ok", |b| {
        b.to_async(&rt).iter(|| async {
            breaker
                .execute(|| async { Ok::<_, std::io::Error>(black_box(1u32)) })
                .await
                .unwrap()
        })
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("pipeline");

    for concurrency in [1usize, 4].iter() {
        let pipeline = PipelineBuilder::<u64>::new()
            .queue_capacity(256)
            .add_stage("double", *concurrency, |x: u64| async move {
                Ok::<_, BoxError>(x * 2)
            })
            .add_stage("increment", *concurrency, |x: u64| async move {
                Ok::<_, BoxError>(x + 1)
            })
            .build()
            .unwrap();

        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(
            BenchmarkId::new("two_stage_1k", concurrency),
            concurrency,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    let run = pipeline
                        .run_iter(0..1_000u64, &CancellationToken::new())
                        .unwrap();
                    let (out, _) = run.collect().await.unwrap();
                    black_box(out.len())
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_sync, bench_breaker, bench_pipeline);
criterion_main!(benches);
