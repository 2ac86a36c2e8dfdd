//! Sweep-path benchmarks: allocate garbage, collect, measure the cycle.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use loam_gc::{ArrayBody, Collector, Config, ObjectBody, Value};

fn config() -> Config {
    Config {
        min_arena_slots: 20_000,
        free_min: 512,
        ..Config::default()
    }
}

fn fill_with_garbage(gc: &mut Collector, count: usize) {
    for _ in 0..count {
        let _ = gc
            .new_object(Value::True, ObjectBody::Array(ArrayBody::Owned(Vec::new())))
            .expect("allocation");
    }
}

fn bench_collect_garbage(c: &mut Criterion) {
    c.bench_function("collect_10k_garbage_inline", |b| {
        b.iter_batched_ref(
            || {
                let mut gc = Collector::with_config(config()).expect("collector");
                fill_with_garbage(&mut gc, 10_000);
                gc
            },
            |gc| gc.collect().expect("cycle"),
            BatchSize::LargeInput,
        );
    });

    c.bench_function("collect_10k_garbage_bitfield", |b| {
        b.iter_batched_ref(
            || {
                let mut gc = Collector::with_config(config()).expect("collector");
                gc.use_bitfield_strategy();
                fill_with_garbage(&mut gc, 10_000);
                gc
            },
            |gc| gc.collect().expect("cycle"),
            BatchSize::LargeInput,
        );
    });
}

fn bench_empty_cycle(c: &mut Criterion) {
    let mut gc = Collector::with_config(config()).expect("collector");
    c.bench_function("empty_cycle", |b| {
        b.iter(|| gc.collect().expect("cycle"));
    });
}

criterion_group!(benches, bench_collect_garbage, bench_empty_cycle);
criterion_main!(benches);
