//! Hybrid pool benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crosspool::config::PoolConfig;
use crosspool::graphics::NoGraphics;
use crosspool::pool::HybridMemoryPool;
use crosspool::segment::SharedSegment;
use std::sync::Arc;

fn bench_pool(name: &str) -> (String, Arc<HybridMemoryPool>) {
    let segment_name = format!("crosspool-bench-{}-{}", name, std::process::id());
    let segment = SharedSegment::create(&segment_name, 64 * 1024 * 1024).unwrap();
    let pool = HybridMemoryPool::new(
        segment,
        Arc::new(NoGraphics),
        PoolConfig {
            cpu_budget: 48 * 1024 * 1024,
            enable_auditor: false,
            ..Default::default()
        },
    )
    .unwrap();
    (segment_name, Arc::new(pool))
}

fn bench_request_recycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_recycle");

    for size in [4 * 1024usize, 64 * 1024, 1024 * 1024] {
        let (name, pool) = bench_pool(&format!("recycle-{}", size));
        // Prime the free-list so the hot path is the recycle hit.
        drop(pool.request_shm(size));

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &pool, |b, pool| {
            b.iter(|| {
                let buf = pool.request_shm(size);
                std::hint::black_box(buf.as_ptr());
                drop(buf);
            });
        });

        drop(pool);
        let _ = SharedSegment::unlink(&name);
    }

    group.finish();
}

fn bench_request_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_concurrent");

    let (name, pool) = bench_pool("concurrent");
    group.throughput(Throughput::Elements(4 * 100));
    group.bench_function("4_threads_100_ops_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            let buf = pool.request_shm(16 * 1024);
                            std::hint::black_box(buf.as_ptr());
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    });

    drop(pool);
    let _ = SharedSegment::unlink(&name);
    group.finish();
}

criterion_group!(benches, bench_request_recycle, bench_request_concurrent);
criterion_main!(benches);
