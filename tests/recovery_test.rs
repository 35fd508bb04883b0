//! # Crash Recovery Tests
//!
//! Crash simulation by dropping the engine without a checkpoint (dirty
//! pages are lost, the WAL survives) and by leaking transaction handles
//! (no rollback runs, exactly as if the process died mid-transaction).
//!
//! The atomicity contract: commits durable before the crash are visible
//! after recovery; everything else leaves no trace.

use stratadb::{Engine, EngineConfig};
use tempfile::tempdir;

fn small_config() -> EngineConfig {
    EngineConfig {
        page_size: 4096,
        ..EngineConfig::default()
    }
}

mod atomicity_tests {
    use super::*;

    #[test]
    fn committed_transaction_survives_crash() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();
            let mut txn = engine.begin().unwrap();
            engine.put(&mut txn, b"k", b"survives").unwrap();
            engine.commit(txn).unwrap();
            // Dropped without close(): no checkpoint, dirty pages lost.
        }

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(engine.get(&txn, b"k").unwrap(), Some(b"survives".to_vec()));
    }

    #[test]
    fn uncommitted_transaction_leaves_no_trace() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();
            let mut txn = engine.begin().unwrap();
            engine.put(&mut txn, b"k", b"lost").unwrap();
            // Simulate dying mid-transaction: no commit, no rollback.
            std::mem::forget(txn);
        }

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(engine.get(&txn, b"k").unwrap(), None);
        assert_eq!(engine.check_integrity().unwrap(), 0);
    }

    #[test]
    fn mixed_outcome_recovers_only_the_commit() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();

            let mut committed = engine.begin().unwrap();
            engine.put(&mut committed, b"kept", b"yes").unwrap();
            engine.commit(committed).unwrap();

            let mut lost = engine.begin().unwrap();
            engine.put(&mut lost, b"dropped", b"no").unwrap();
            std::mem::forget(lost);
        }

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(engine.get(&txn, b"kept").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(engine.get(&txn, b"dropped").unwrap(), None);
    }

    #[test]
    fn crashed_update_rolls_back_to_prior_version() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();
            let mut setup = engine.begin().unwrap();
            engine.put(&mut setup, b"k", b"stable").unwrap();
            engine.commit(setup).unwrap();

            let mut crashed = engine.begin().unwrap();
            engine.put(&mut crashed, b"k", b"torn").unwrap();
            engine.delete(&mut crashed, b"k").unwrap();
            std::mem::forget(crashed);
        }

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(engine.get(&txn, b"k").unwrap(), Some(b"stable".to_vec()));
    }

    #[test]
    fn committed_delete_survives_crash() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();
            let mut setup = engine.begin().unwrap();
            engine.put(&mut setup, b"k", b"v").unwrap();
            engine.commit(setup).unwrap();

            let mut deleter = engine.begin().unwrap();
            engine.delete(&mut deleter, b"k").unwrap();
            engine.commit(deleter).unwrap();
        }

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(engine.get(&txn, b"k").unwrap(), None);
    }
}

mod replay_tests {
    use super::*;

    #[test]
    fn repeated_crash_cycles_accumulate_commits() {
        let dir = tempdir().unwrap();
        Engine::create(dir.path(), small_config()).unwrap();

        for round in 0..3u32 {
            let engine = Engine::open(dir.path(), small_config()).unwrap();
            let mut txn = engine.begin().unwrap();
            let key = format!("round-{}", round);
            engine.put(&mut txn, key.as_bytes(), b"done").unwrap();
            engine.commit(txn).unwrap();
            // Crash.
        }

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        let txn = engine.begin().unwrap();
        for round in 0..3u32 {
            let key = format!("round-{}", round);
            assert_eq!(
                engine.get(&txn, key.as_bytes()).unwrap(),
                Some(b"done".to_vec()),
                "round {} lost",
                round
            );
        }
    }

    #[test]
    fn commits_after_a_checkpoint_replay() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();
            let mut txn = engine.begin().unwrap();
            engine.put(&mut txn, b"before", b"1").unwrap();
            engine.commit(txn).unwrap();
            engine.checkpoint().unwrap();

            let mut txn = engine.begin().unwrap();
            engine.put(&mut txn, b"after", b"2").unwrap();
            engine.commit(txn).unwrap();
            // Crash with the second commit only in the WAL.
        }

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(engine.get(&txn, b"before").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(&txn, b"after").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn recovery_is_idempotent_across_reopens() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();
            let mut txn = engine.begin().unwrap();
            for i in 0..200u32 {
                let key = format!("key-{:04}", i);
                engine.put(&mut txn, key.as_bytes(), &i.to_le_bytes()).unwrap();
            }
            engine.commit(txn).unwrap();
        }

        for _ in 0..3 {
            let engine = Engine::open(dir.path(), small_config()).unwrap();
            assert_eq!(engine.check_integrity().unwrap(), 200);
            // Crash again without a clean close.
        }
    }

    #[test]
    fn splits_replay_from_the_log() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();
            let mut txn = engine.begin().unwrap();
            // Enough 64-byte values to split 4KB leaves several times.
            for i in 0..300u32 {
                let key = format!("key-{:04}", i);
                engine.put(&mut txn, key.as_bytes(), &[7u8; 64]).unwrap();
            }
            engine.commit(txn).unwrap();
        }

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        assert_eq!(engine.check_integrity().unwrap(), 300);
        let txn = engine.begin().unwrap();
        assert_eq!(
            engine.get(&txn, b"key-0250").unwrap(),
            Some(vec![7u8; 64])
        );
    }
}

mod corrupt_tail_tests {
    use super::*;

    #[test]
    fn garbage_tail_is_truncated_and_commits_survive() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();
            let mut txn = engine.begin().unwrap();
            engine.put(&mut txn, b"k", b"good").unwrap();
            engine.commit(txn).unwrap();
        }

        // A torn write left garbage at the end of the log.
        let wal_path = dir.path().join("data.wal");
        let mut raw = std::fs::read(&wal_path).unwrap();
        raw.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03]);
        std::fs::write(&wal_path, &raw).unwrap();

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(engine.get(&txn, b"k").unwrap(), Some(b"good".to_vec()));

        // The engine stays fully usable.
        drop(txn);
        let mut txn = engine.begin().unwrap();
        engine.put(&mut txn, b"k2", b"after").unwrap();
        engine.commit(txn).unwrap();
    }

    #[test]
    fn truncated_final_record_loses_only_that_record() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::create(dir.path(), small_config()).unwrap();
            let mut txn = engine.begin().unwrap();
            engine.put(&mut txn, b"first", b"1").unwrap();
            engine.commit(txn).unwrap();

            let mut txn = engine.begin().unwrap();
            engine.put(&mut txn, b"second", b"2").unwrap();
            engine.commit(txn).unwrap();
        }

        // Chop bytes off the end, tearing the last commit's record.
        let wal_path = dir.path().join("data.wal");
        let len = std::fs::metadata(&wal_path).unwrap().len();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&wal_path)
            .unwrap();
        file.set_len(len - 4).unwrap();
        drop(file);

        let engine = Engine::open(dir.path(), small_config()).unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(engine.get(&txn, b"first").unwrap(), Some(b"1".to_vec()));
        // The second transaction's commit record was torn; its writes
        // must have been rolled back, not half-applied.
        assert_eq!(engine.get(&txn, b"second").unwrap(), None);
    }
}
