//! # Snapshot Isolation Tests
//!
//! The visibility and conflict guarantees from the engine's contract:
//! snapshots fixed at begin, first-writer-wins conflicts, exactly one of
//! two overlapping committers succeeding, and rollback on abort.

use stratadb::{engine_error, Engine, EngineConfig, EngineError};
use tempfile::tempdir;

fn small_config() -> EngineConfig {
    EngineConfig {
        page_size: 4096,
        ..EngineConfig::default()
    }
}

mod snapshot_tests {
    use super::*;

    #[test]
    fn snapshot_fixed_at_begin() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        // T1 writes k but has not committed when T2 begins.
        let mut t1 = engine.begin().unwrap();
        engine.put(&mut t1, b"k", b"a").unwrap();

        let t2 = engine.begin().unwrap();
        assert_eq!(engine.get(&t2, b"k").unwrap(), None);

        engine.commit(t1).unwrap();

        // T2's snapshot predates T1's commit; still invisible.
        assert_eq!(engine.get(&t2, b"k").unwrap(), None);

        // A fresh transaction sees it.
        let t3 = engine.begin().unwrap();
        assert_eq!(engine.get(&t3, b"k").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn repeatable_reads_within_transaction() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        let mut setup = engine.begin().unwrap();
        engine.put(&mut setup, b"k", b"v1").unwrap();
        engine.commit(setup).unwrap();

        let reader = engine.begin().unwrap();
        assert_eq!(engine.get(&reader, b"k").unwrap(), Some(b"v1".to_vec()));

        let mut writer = engine.begin().unwrap();
        engine.put(&mut writer, b"k", b"v2").unwrap();
        engine.commit(writer).unwrap();

        // Same read, same answer, despite the concurrent commit.
        assert_eq!(engine.get(&reader, b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn concurrent_delete_invisible_to_old_snapshot() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        let mut setup = engine.begin().unwrap();
        engine.put(&mut setup, b"k", b"v").unwrap();
        engine.commit(setup).unwrap();

        let reader = engine.begin().unwrap();

        let mut deleter = engine.begin().unwrap();
        engine.delete(&mut deleter, b"k").unwrap();
        engine.commit(deleter).unwrap();

        // The delete was stamped after the reader's snapshot.
        assert_eq!(engine.get(&reader, b"k").unwrap(), Some(b"v".to_vec()));

        let after = engine.begin().unwrap();
        assert_eq!(engine.get(&after, b"k").unwrap(), None);
    }

    #[test]
    fn scan_respects_snapshot() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        let mut setup = engine.begin().unwrap();
        engine.put(&mut setup, b"a", b"1").unwrap();
        engine.put(&mut setup, b"c", b"3").unwrap();
        engine.commit(setup).unwrap();

        let reader = engine.begin().unwrap();

        let mut writer = engine.begin().unwrap();
        engine.put(&mut writer, b"b", b"2").unwrap();
        engine.commit(writer).unwrap();

        let mut scan = engine.scan(&reader, b"a", b"z").unwrap();
        let mut keys = Vec::new();
        while let Some((key, _)) = scan.next_entry().unwrap() {
            keys.push(key);
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
    }
}

mod conflict_tests {
    use super::*;

    #[test]
    fn write_against_active_writer_conflicts() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        let mut t1 = engine.begin().unwrap();
        engine.put(&mut t1, b"k", b"t1").unwrap();

        let mut t2 = engine.begin().unwrap();
        let err = engine.put(&mut t2, b"k", b"t2").unwrap_err();
        assert!(matches!(
            engine_error(&err),
            Some(EngineError::Conflict { .. })
        ));

        engine.commit(t1).unwrap();
        let t3 = engine.begin().unwrap();
        assert_eq!(engine.get(&t3, b"k").unwrap(), Some(b"t1".to_vec()));
    }

    #[test]
    fn exactly_one_of_two_overlapping_committers_wins() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        // Both begin before either commits; t1 writes and commits, then
        // t2 (whose snapshot predates that commit) tries the same key.
        let mut t1 = engine.begin().unwrap();
        let mut t2 = engine.begin().unwrap();

        engine.put(&mut t1, b"k", b"t1").unwrap();
        engine.commit(t1).unwrap();

        let err = engine.put(&mut t2, b"k", b"t2").unwrap_err();
        assert!(matches!(
            engine_error(&err),
            Some(EngineError::SerializationFailure)
        ));

        let t3 = engine.begin().unwrap();
        assert_eq!(engine.get(&t3, b"k").unwrap(), Some(b"t1".to_vec()));
    }

    #[test]
    fn delete_conflicts_like_writes() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        let mut setup = engine.begin().unwrap();
        engine.put(&mut setup, b"k", b"v").unwrap();
        engine.commit(setup).unwrap();

        let mut t1 = engine.begin().unwrap();
        let mut t2 = engine.begin().unwrap();
        engine.put(&mut t1, b"k", b"newer").unwrap();

        let err = engine.delete(&mut t2, b"k").unwrap_err();
        assert!(matches!(
            engine_error(&err),
            Some(EngineError::Conflict { .. })
        ));
        engine.commit(t1).unwrap();
    }

    #[test]
    fn no_conflict_on_distinct_keys() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        let mut t1 = engine.begin().unwrap();
        let mut t2 = engine.begin().unwrap();
        engine.put(&mut t1, b"a", b"1").unwrap();
        engine.put(&mut t2, b"b", b"2").unwrap();
        engine.commit(t1).unwrap();
        engine.commit(t2).unwrap();

        let t3 = engine.begin().unwrap();
        assert_eq!(engine.get(&t3, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(&t3, b"b").unwrap(), Some(b"2".to_vec()));
    }
}

mod abort_tests {
    use super::*;

    #[test]
    fn abort_discards_writes() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        let mut txn = engine.begin().unwrap();
        engine.put(&mut txn, b"k", b"never").unwrap();
        engine.abort(txn).unwrap();

        let reader = engine.begin().unwrap();
        assert_eq!(engine.get(&reader, b"k").unwrap(), None);
        assert_eq!(engine.check_integrity().unwrap(), 0);
    }

    #[test]
    fn abort_restores_previous_version() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        let mut setup = engine.begin().unwrap();
        engine.put(&mut setup, b"k", b"keep").unwrap();
        engine.commit(setup).unwrap();

        let mut txn = engine.begin().unwrap();
        engine.put(&mut txn, b"k", b"discard").unwrap();
        engine.delete(&mut txn, b"k").unwrap();
        engine.abort(txn).unwrap();

        let reader = engine.begin().unwrap();
        assert_eq!(engine.get(&reader, b"k").unwrap(), Some(b"keep".to_vec()));
    }

    #[test]
    fn dropped_handle_rolls_back() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        {
            let mut txn = engine.begin().unwrap();
            engine.put(&mut txn, b"k", b"leaked").unwrap();
            // Dropped without commit or abort.
        }

        let reader = engine.begin().unwrap();
        assert_eq!(engine.get(&reader, b"k").unwrap(), None);
    }

    #[test]
    fn aborted_writer_releases_the_key() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(dir.path(), small_config()).unwrap();

        let mut t1 = engine.begin().unwrap();
        engine.put(&mut t1, b"k", b"t1").unwrap();
        engine.abort(t1).unwrap();

        // No active writer left; a new transaction writes freely.
        let mut t2 = engine.begin().unwrap();
        engine.put(&mut t2, b"k", b"t2").unwrap();
        engine.commit(t2).unwrap();

        let reader = engine.begin().unwrap();
        assert_eq!(engine.get(&reader, b"k").unwrap(), Some(b"t2".to_vec()));
    }
}
