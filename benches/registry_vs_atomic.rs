use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use statshm::Registry;

const BATCH: usize = 1_000;

fn bench_counter_add(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(0, "bench_stats", 1, ["pid", "ops"]).with_root(dir.path());
    registry.init().unwrap();
    let set = registry.alloc().unwrap();
    let ops = set.index_of("ops").unwrap();

    let mut group = c.benchmark_group("counter_add");

    group.bench_function(BenchmarkId::new("CounterSet (by index)", BATCH), |b| {
        b.iter(|| {
            for _ in 0..BATCH {
                set.add(ops, 1).unwrap();
            }
            black_box(set.get(ops).unwrap())
        })
    });

    group.bench_function(BenchmarkId::new("CounterSet (by name)", BATCH), |b| {
        b.iter(|| {
            for _ in 0..BATCH {
                set.add("ops", 1).unwrap();
            }
            black_box(set.get("ops").unwrap())
        })
    });

    group.bench_function(BenchmarkId::new("AtomicUsize (heap)", BATCH), |b| {
        let counter = AtomicUsize::new(0);
        b.iter(|| {
            for _ in 0..BATCH {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            black_box(counter.load(Ordering::SeqCst))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_counter_add);
criterion_main!(benches);
