use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use stratadb::{Engine, EngineConfig};
use tempfile::tempdir;

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_1k_committed", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let engine = Engine::create(dir.path(), EngineConfig::default()).unwrap();
                (dir, engine)
            },
            |(_dir, engine)| {
                let mut txn = engine.begin().unwrap();
                for i in 0..1000u32 {
                    let key = format!("key-{:06}", i);
                    engine.put(&mut txn, key.as_bytes(), &i.to_le_bytes()).unwrap();
                }
                engine.commit(txn).unwrap();
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_point_read(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let engine = Engine::create(dir.path(), EngineConfig::default()).unwrap();
    let mut txn = engine.begin().unwrap();
    for i in 0..10_000u32 {
        let key = format!("key-{:06}", i);
        engine.put(&mut txn, key.as_bytes(), &i.to_le_bytes()).unwrap();
    }
    engine.commit(txn).unwrap();

    c.bench_function("point_read_cached", |b| {
        let txn = engine.begin().unwrap();
        let mut i = 0u32;
        b.iter(|| {
            let key = format!("key-{:06}", i % 10_000);
            i = i.wrapping_add(7919);
            engine.get(&txn, key.as_bytes()).unwrap()
        });
    });
}

fn bench_scan(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let engine = Engine::create(dir.path(), EngineConfig::default()).unwrap();
    let mut txn = engine.begin().unwrap();
    for i in 0..10_000u32 {
        let key = format!("key-{:06}", i);
        engine.put(&mut txn, key.as_bytes(), &i.to_le_bytes()).unwrap();
    }
    engine.commit(txn).unwrap();

    c.bench_function("scan_10k", |b| {
        let txn = engine.begin().unwrap();
        b.iter(|| {
            let mut scan = engine
                .scan(&txn, b"key-000000", b"key-009999")
                .unwrap();
            let mut count = 0usize;
            while scan.next_entry().unwrap().is_some() {
                count += 1;
            }
            count
        });
    });
}

criterion_group!(benches, bench_insert, bench_point_read, bench_scan);
criterion_main!(benches);
