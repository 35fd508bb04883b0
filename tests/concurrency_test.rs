//! # Concurrency Tests
//!
//! Parallel writers across threads: disjoint keys all land, overlapping
//! writers resolve to exactly one winner, and retry loops converge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use stratadb::{engine_error, Engine, EngineConfig};
use tempfile::tempdir;

fn small_config() -> EngineConfig {
    EngineConfig {
        page_size: 4096,
        ..EngineConfig::default()
    }
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{:04}", i).into_bytes()
}

#[test]
fn ten_threads_commit_one_hundred_keys_each() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::create(dir.path(), small_config()).unwrap());
    let barrier = Arc::new(Barrier::new(10));

    let mut handles = Vec::new();
    for t in 0..10u32 {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            let mut txn = engine.begin().unwrap();
            for i in (t * 100 + 1)..=(t * 100 + 100) {
                engine.put(&mut txn, &key(i), &i.to_le_bytes()).unwrap();
            }
            engine.commit(txn).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // A scan of [1, 1000] must return all 1000 keys in ascending order
    // with no duplicates.
    let txn = engine.begin().unwrap();
    let mut scan = engine.scan(&txn, &key(1), &key(1000)).unwrap();
    let mut seen = Vec::new();
    while let Some((k, v)) = scan.next_entry().unwrap() {
        let i = u32::from_le_bytes(v.as_slice().try_into().unwrap());
        assert_eq!(k, key(i));
        seen.push(i);
    }
    assert_eq!(seen.len(), 1000);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(engine.check_integrity().unwrap(), 1000);
}

#[test]
fn overlapping_writers_resolve_to_one_winner() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::create(dir.path(), small_config()).unwrap());
    let barrier = Arc::new(Barrier::new(4));
    let commits = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        let commits = Arc::clone(&commits);
        handles.push(std::thread::spawn(move || {
            // All transactions begin before any writes.
            let mut txn = engine.begin().unwrap();
            barrier.wait();
            match engine.put(&mut txn, b"contested", &t.to_le_bytes()) {
                Ok(()) => {
                    engine.commit(txn).unwrap();
                    commits.fetch_add(1, Ordering::SeqCst);
                }
                Err(report) => {
                    assert!(
                        engine_error(&report)
                            .map(|e| e.is_retryable())
                            .unwrap_or(false),
                        "losers must see a retryable error: {:#}",
                        report
                    );
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        commits.load(Ordering::SeqCst),
        1,
        "exactly one overlapping writer may commit"
    );

    let txn = engine.begin().unwrap();
    assert!(engine.get(&txn, b"contested").unwrap().is_some());
}

#[test]
fn retry_loops_converge_on_a_counter() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::create(dir.path(), small_config()).unwrap());

    {
        let mut txn = engine.begin().unwrap();
        engine.put(&mut txn, b"counter", &0u64.to_le_bytes()).unwrap();
        engine.commit(txn).unwrap();
    }

    const THREADS: u64 = 4;
    const INCREMENTS: u64 = 25;

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            for _ in 0..INCREMENTS {
                loop {
                    let mut txn = engine.begin().unwrap();
                    let current = engine
                        .get(&txn, b"counter")
                        .unwrap()
                        .map(|v| u64::from_le_bytes(v.as_slice().try_into().unwrap()))
                        .unwrap_or(0);
                    let attempt = engine
                        .put(&mut txn, b"counter", &(current + 1).to_le_bytes())
                        .and_then(|()| engine.commit(txn).map(|_| ()));
                    match attempt {
                        Ok(()) => break,
                        Err(report) => {
                            assert!(
                                engine_error(&report)
                                    .map(|e| e.is_retryable())
                                    .unwrap_or(false),
                                "unexpected error in retry loop: {:#}",
                                report
                            );
                        }
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let txn = engine.begin().unwrap();
    let value = engine.get(&txn, b"counter").unwrap().unwrap();
    assert_eq!(
        u64::from_le_bytes(value.as_slice().try_into().unwrap()),
        THREADS * INCREMENTS
    );
}

#[test]
fn concurrent_readers_see_stable_snapshots() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::create(dir.path(), small_config()).unwrap());

    {
        let mut txn = engine.begin().unwrap();
        for i in 0..100u32 {
            engine.put(&mut txn, &key(i), &0u32.to_le_bytes()).unwrap();
        }
        engine.commit(txn).unwrap();
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    // Writer: bump every key in its own transaction, repeatedly.
    let writer = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut round = 1u32;
            while !stop.load(Ordering::SeqCst) {
                let mut txn = engine.begin().unwrap();
                for i in 0..100u32 {
                    engine.put(&mut txn, &key(i), &round.to_le_bytes()).unwrap();
                }
                engine.commit(txn).unwrap();
                round += 1;
            }
        })
    };

    // Readers: within one transaction, every key must show one round.
    let mut readers = Vec::new();
    for _ in 0..3 {
        let engine = Arc::clone(&engine);
        readers.push(std::thread::spawn(move || {
            for _ in 0..20 {
                let txn = engine.begin().unwrap();
                let first = engine.get(&txn, &key(0)).unwrap().unwrap();
                for i in 1..100u32 {
                    let v = engine.get(&txn, &key(i)).unwrap().unwrap();
                    assert_eq!(v, first, "snapshot tore between keys");
                }
            }
        }));
    }

    for reader in readers {
        reader.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    writer.join().unwrap();
}
