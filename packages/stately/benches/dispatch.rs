use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::Value;

use stately::{compute, Entity, HandlerTable, Mode, Snapshot, Store};

fn store(count: usize) -> Store {
    let counter = HandlerTable::new().on("tick", |entity, _, _| {
        let ticks = entity.get("ticks").and_then(Value::as_u64).unwrap_or(0);
        entity.set("ticks", ticks + 1);
        Ok(())
    });

    let entities = (0..count).fold(Snapshot::empty(), |snapshot, idx| {
        let type_name = if idx % 2 == 0 { "counter" } else { "idle" };
        snapshot.with(Entity::new(format!("e{}", idx), type_name))
    });

    Store::builder()
        .type_def("counter", counter)
        .type_def("idle", HandlerTable::new())
        .entities(entities)
        .mode(Mode::Manual)
        .build()
        .unwrap()
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");

    for count in [100, 1_000, 10_000] {
        let store = store(count);
        store.update().unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                store.notify("tick", Value::Null).unwrap();
                store.update().unwrap();
                black_box(store.state());
            });
        });
    }

    group.finish();
}

fn bench_scoped(c: &mut Criterion) {
    let store = store(10_000);
    store.update().unwrap();

    c.bench_function("scoped_10k", |b| {
        b.iter(|| {
            store.notify("#e0:tick", Value::Null).unwrap();
            store.update().unwrap();
            black_box(store.state());
        });
    });
}

fn bench_memo(c: &mut Criterion) {
    let store = store(10_000);
    store.update().unwrap();
    let memo = compute(
        |state: &Arc<Snapshot>| state.get("e1").cloned(),
        |e1| e1.as_ref().map(|e| e.attrs().len()),
    );

    c.bench_function("memo_hit_10k", |b| {
        b.iter(|| {
            store.notify("#e0:tick", Value::Null).unwrap();
            store.update().unwrap();
            black_box(store.select(|state| memo.get(state)));
        });
    });
}

criterion_group!(benches, bench_broadcast, bench_scoped, bench_memo);
criterion_main!(benches);
