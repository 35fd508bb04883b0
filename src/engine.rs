//! # Engine Facade
//!
//! The public surface a query layer consumes: open/create, transactions,
//! point reads and writes, range scans, checkpointing and the maintenance
//! sweep. Everything is owned by the engine value — no ambient singletons —
//! so multiple engines coexist in one process.
//!
//! ## Files
//!
//! An engine lives in a directory:
//!
//! ```text
//! database_dir/
//! ├── data.sdb        # page file (header + tree + versions + overflow)
//! └── data.wal        # write-ahead log
//! ```
//!
//! ## Transaction Flow
//!
//! ```text
//! let mut txn = engine.begin()?;
//! engine.put(&mut txn, b"k", b"v")?;
//! match engine.get(&txn, b"k")? { ... }
//! engine.commit(txn)?;                 // durable on return
//! ```
//!
//! `put`/`delete` take the key's write lock for the duration of the
//! operation and surface conflicts per Snapshot Isolation: a loss to an
//! active writer or to a transaction committed after `begin()` aborts the
//! transaction immediately with a retryable error. Dropping an unfinished
//! handle rolls it back.
//!
//! ## Durability
//!
//! Commit appends the Commit record and blocks until the WAL is synced;
//! the affected pages follow lazily under the WAL-before-page-flush rule.
//! `checkpoint()` flushes all dirty pages, stamps the file header and
//! truncates the WAL prefix recovery no longer needs. The optional
//! background thread checkpoints when the WAL tail exceeds the configured
//! threshold and runs the version sweep.
//!
//! ## Isolation Caveat
//!
//! Snapshot Isolation: repeatable point reads, no dirty or non-repeatable
//! reads. Range predicates are *not* protected against phantoms — two
//! scans in one transaction see the same committed versions, but a
//! concurrent committer can add keys a re-issued predicate would match.
//! Callers needing serializable ranges must layer their own predicate
//! locking.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use crate::btree::sweep::SweepStats;
use crate::btree::{BTree, Cursor, UndoEntry};
use crate::buffer::BufferPool;
use crate::config::{
    DEFAULT_BUFFER_POOL_CAPACITY, DEFAULT_CHECKPOINT_THRESHOLD, DEFAULT_LOCK_TIMEOUT_MS,
    DEFAULT_PAGE_SIZE, FILE_HEADER_SIZE,
};
use crate::error::EngineError;
use crate::mvcc::{
    LockTable, Snapshot, TransactionManager, TxnState, VersionStore,
};
use crate::recovery;
use crate::storage::page::{PageHeader, PageType};
use crate::storage::{Allocator, FileHeader, PageFile};
use crate::wal::{LogRecord, Lsn, RecordBody, TxnId, Wal, NULL_LSN};

const DATA_FILE: &str = "data.sdb";
const WAL_FILE: &str = "data.wal";
/// Initial B+Tree root, formatted at create time.
const INITIAL_ROOT: u32 = 1;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes per page; fixed at creation, validated on open.
    pub page_size: usize,
    /// Buffer pool frames.
    pub buffer_pool_capacity: usize,
    /// Bound on key-lock waits; `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// WAL bytes after which background maintenance checkpoints.
    pub checkpoint_threshold: u64,
    /// Run the checkpoint/sweep thread.
    pub background_maintenance: bool,
    /// How often the maintenance thread wakes.
    pub maintenance_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_capacity: DEFAULT_BUFFER_POOL_CAPACITY,
            lock_timeout: Some(Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS)),
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            background_maintenance: false,
            maintenance_interval: Duration::from_millis(500),
        }
    }
}

pub(crate) struct EngineShared {
    file: Arc<PageFile>,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    tree: BTree,
    tm: TransactionManager,
    locks: LockTable,
    config: EngineConfig,
    /// Serializes checkpoints and sweeps.
    maintenance_lock: Mutex<()>,
    last_checkpoint: AtomicU64,
}

impl EngineShared {
    /// Rolls back a transaction's write set in reverse order, emitting
    /// Clr records, then appends the Abort record and retires the ID.
    fn rollback(&self, txn_id: TxnId, undo: &[UndoEntry], last_lsn: Lsn) -> Result<()> {
        let mut chain = last_lsn;
        for entry in undo.iter().rev() {
            chain = self.tree.apply_undo(txn_id, &entry.op, entry.prev_lsn)?;
            // Keep the active table's last-LSN current so a checkpoint
            // taken mid-rollback never points recovery's undo at a
            // record that is already compensated.
            self.tm.note_lsn(txn_id, chain);
        }
        self.wal
            .append(LogRecord::new(txn_id, chain, RecordBody::Abort))?;
        self.tm.finish(txn_id);
        Ok(())
    }
}

/// A transaction handle. Dropping an unfinished handle rolls it back.
pub struct TxnHandle {
    shared: Arc<EngineShared>,
    snapshot: Snapshot,
    state: TxnState,
    last_lsn: Lsn,
    undo: Vec<UndoEntry>,
    finished: bool,
}

impl TxnHandle {
    pub fn id(&self) -> TxnId {
        self.snapshot.txn_id()
    }

    pub fn state(&self) -> TxnState {
        self.state
    }
}

impl Drop for TxnHandle {
    fn drop(&mut self) {
        if !self.finished {
            // Best effort; an unreachable page at drop time leaves the
            // versions for recovery or the sweep to deal with.
            let _ = self
                .shared
                .rollback(self.snapshot.txn_id(), &self.undo, self.last_lsn);
            self.state = TxnState::Aborted;
            self.finished = true;
        }
    }
}

pub struct Engine {
    shared: Arc<EngineShared>,
    shutdown: Arc<AtomicBool>,
    maintenance: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Engine {
    /// Creates a fresh engine directory: formatted page file (header plus
    /// an empty root leaf) and empty WAL.
    pub fn create(path: &Path, config: EngineConfig) -> Result<Engine> {
        std::fs::create_dir_all(path)
            .wrap_err_with(|| format!("failed to create engine directory {:?}", path))?;

        let file = Arc::new(PageFile::create(&path.join(DATA_FILE), config.page_size)?);
        file.grow(2)?;

        {
            let mut page = vec![0u8; config.page_size];
            let mut header = FileHeader::new(config.page_size);
            header.set_root_page(INITIAL_ROOT);
            header.write_to(&mut page)?;
            file.write_page(0, &page)?;
        }
        {
            let mut page = vec![0u8; config.page_size];
            PageHeader::new(PageType::BTreeLeaf, config.page_size).write_to(&mut page)?;
            file.write_page(INITIAL_ROOT, &page)?;
        }
        file.sync()?;

        let wal = Arc::new(Wal::create(&path.join(WAL_FILE))?);
        Self::assemble(file, wal, config)
    }

    /// Opens an existing engine, running crash recovery before any
    /// operation is accepted.
    pub fn open(path: &Path, config: EngineConfig) -> Result<Engine> {
        let data_path = path.join(DATA_FILE);

        // The stored page size is authoritative; the config must agree.
        let stored_page_size = {
            use std::io::Read;
            let mut file = std::fs::File::open(&data_path)
                .wrap_err_with(|| format!("failed to open page file at {:?}", data_path))?;
            let mut header = vec![0u8; FILE_HEADER_SIZE];
            file.read_exact(&mut header)
                .wrap_err("failed to read the file header")?;
            FileHeader::from_bytes(&header)?.page_size()
        };
        ensure!(
            config.page_size == stored_page_size,
            "configured page size {} does not match the file's {}",
            config.page_size,
            stored_page_size
        );

        let file = Arc::new(PageFile::open(&data_path, stored_page_size)?);
        let wal = Arc::new(Wal::open_or_create(&path.join(WAL_FILE))?);
        Self::assemble(file, wal, config)
    }

    fn assemble(file: Arc<PageFile>, wal: Arc<Wal>, config: EngineConfig) -> Result<Engine> {
        let pool = Arc::new(BufferPool::new(
            Arc::clone(&file),
            Arc::clone(&wal),
            config.buffer_pool_capacity,
        )?);
        let structural = Arc::new(Mutex::new(()));
        let alloc = Arc::new(Allocator::new(Arc::clone(&pool), Arc::clone(&file)));
        let versions = Arc::new(VersionStore::new(
            Arc::clone(&pool),
            Arc::clone(&alloc),
            Arc::clone(&wal),
            Arc::clone(&structural),
        ));
        let tree = BTree::new(
            Arc::clone(&pool),
            Arc::clone(&wal),
            alloc,
            versions,
            structural,
        );

        let report = recovery::run(&pool, &file, &wal, &tree)?;
        if report.losers_undone > 0 || report.corrupt_tail.is_some() {
            eprintln!(
                "[recovery] {} records scanned, {} redo applied, {} transactions rolled back",
                report.records_scanned, report.redo_applied, report.losers_undone
            );
        }

        let tm = TransactionManager::starting_at(report.max_txn_id + 1);
        let shared = Arc::new(EngineShared {
            file,
            pool,
            wal,
            tree,
            tm,
            locks: LockTable::new(),
            config,
            maintenance_lock: Mutex::new(()),
            last_checkpoint: AtomicU64::new(NULL_LSN),
        });

        let engine = Engine {
            shared,
            shutdown: Arc::new(AtomicBool::new(false)),
            maintenance: Mutex::new(None),
        };

        // Recovery replayed work; bound the next recovery right away.
        if report.records_scanned > 0 {
            engine.checkpoint()?;
        }

        if engine.shared.config.background_maintenance {
            engine.spawn_maintenance();
        }
        Ok(engine)
    }

    fn spawn_maintenance(&self) {
        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = shared.config.maintenance_interval;
        let handle = std::thread::Builder::new()
            .name("strata-maintenance".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    std::thread::park_timeout(interval);
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let since = shared.last_checkpoint.load(Ordering::Acquire);
                    if shared.wal.tail_bytes_since(since) >= shared.config.checkpoint_threshold {
                        if let Err(e) = checkpoint_shared(&shared) {
                            eprintln!("[maintenance] checkpoint failed: {:#}", e);
                        }
                        if let Err(e) = sweep_shared(&shared) {
                            eprintln!("[maintenance] sweep failed: {:#}", e);
                        }
                    }
                }
            })
            .expect("failed to spawn maintenance thread");
        *self.maintenance.lock() = Some(handle);
    }

    // ---- Transactions ----------------------------------------------------

    pub fn begin(&self) -> Result<TxnHandle> {
        let snapshot = self.shared.tm.begin()?;
        let txn_id = snapshot.txn_id();
        let begin_lsn = self
            .shared
            .wal
            .append(LogRecord::new(txn_id, NULL_LSN, RecordBody::Begin))?;
        self.shared.tm.note_lsn(txn_id, begin_lsn);

        Ok(TxnHandle {
            shared: Arc::clone(&self.shared),
            snapshot,
            state: TxnState::Active,
            last_lsn: begin_lsn,
            undo: Vec::new(),
            finished: false,
        })
    }

    fn check_handle(&self, txn: &TxnHandle) -> Result<()> {
        ensure!(
            Arc::ptr_eq(&self.shared, &txn.shared),
            "transaction handle belongs to a different engine"
        );
        ensure!(
            matches!(txn.state, TxnState::Active),
            "transaction {} is no longer active",
            txn.id()
        );
        Ok(())
    }

    pub fn get(&self, txn: &TxnHandle, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_handle(txn)?;
        self.shared.tree.get(&txn.snapshot, key)
    }

    /// Inserts or updates. A write conflict aborts the transaction before
    /// the error is returned; retry from `begin()`.
    pub fn put(&self, txn: &mut TxnHandle, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_handle(txn)?;
        let txn_id = txn.id();

        let _key_lock = match self
            .shared
            .locks
            .acquire(txn_id, key, self.shared.config.lock_timeout)
        {
            Ok(guard) => guard,
            Err(report) => return Err(self.fail_write(txn, report)),
        };

        match self
            .shared
            .tree
            .put(&txn.snapshot, &self.shared.tm, txn.last_lsn, key, value)
        {
            Ok(entry) => {
                txn.last_lsn = entry.lsn;
                txn.undo.push(entry);
                Ok(())
            }
            Err(report) => Err(self.fail_write(txn, report)),
        }
    }

    /// Deletes the visible version of `key`; `false` when nothing was
    /// there to delete.
    pub fn delete(&self, txn: &mut TxnHandle, key: &[u8]) -> Result<bool> {
        self.check_handle(txn)?;
        let txn_id = txn.id();

        let _key_lock = match self
            .shared
            .locks
            .acquire(txn_id, key, self.shared.config.lock_timeout)
        {
            Ok(guard) => guard,
            Err(report) => return Err(self.fail_write(txn, report)),
        };

        match self
            .shared
            .tree
            .delete(&txn.snapshot, &self.shared.tm, txn.last_lsn, key)
        {
            Ok(Some(entry)) => {
                txn.last_lsn = entry.lsn;
                txn.undo.push(entry);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(report) => Err(self.fail_write(txn, report)),
        }
    }

    /// First-writer-wins and deadlock victims: the transaction is aborted
    /// before the error surfaces. Lock timeouts leave it active (the
    /// operation itself is retryable).
    fn fail_write(&self, txn: &mut TxnHandle, report: eyre::Report) -> eyre::Report {
        let aborts = matches!(
            report.downcast_ref::<EngineError>(),
            Some(EngineError::Conflict { .. })
                | Some(EngineError::SerializationFailure)
                | Some(EngineError::Deadlock { .. })
        );
        if aborts {
            if self
                .shared
                .rollback(txn.id(), &txn.undo, txn.last_lsn)
                .is_ok()
            {
                txn.state = TxnState::Aborted;
                txn.finished = true;
            }
        }
        report
    }

    /// Lazy ordered scan of `[low, high]` under the transaction's
    /// snapshot. Structural invalidation surfaces as `StaleCursor`.
    pub fn scan(&self, txn: &TxnHandle, low: &[u8], high: &[u8]) -> Result<Scan<'_>> {
        self.check_handle(txn)?;
        self.shared
            .tree
            .cursor(txn.snapshot.clone(), low.to_vec(), high.to_vec())
    }

    /// Makes the transaction durable. The commit point is the WAL sync:
    /// once this returns, the writes survive any crash.
    pub fn commit(&self, mut txn: TxnHandle) -> Result<Lsn> {
        self.check_handle(&txn)?;
        let txn_id = txn.id();

        let lsn = self
            .shared
            .wal
            .append(LogRecord::new(txn_id, txn.last_lsn, RecordBody::Commit))?;
        self.shared.wal.sync()?;

        self.shared.tm.finish(txn_id);
        txn.state = TxnState::Committed;
        txn.finished = true;
        Ok(lsn)
    }

    pub fn abort(&self, mut txn: TxnHandle) -> Result<()> {
        self.check_handle(&txn)?;
        self.shared
            .rollback(txn.id(), &txn.undo, txn.last_lsn)?;
        txn.state = TxnState::Aborted;
        txn.finished = true;
        Ok(())
    }

    // ---- Maintenance -----------------------------------------------------

    /// Flushes all dirty pages (WAL first), stamps the checkpoint LSN and
    /// truncates the WAL prefix recovery no longer needs.
    pub fn checkpoint(&self) -> Result<Lsn> {
        checkpoint_shared(&self.shared)
    }

    /// Version garbage collection plus underflow repair.
    pub fn vacuum(&self) -> Result<SweepStats> {
        sweep_shared(&self.shared)
    }

    /// Structural self-check; returns the number of cells in the tree.
    pub fn check_integrity(&self) -> Result<usize> {
        self.shared.tree.check_integrity()
    }

    /// Stops background maintenance and checkpoints one last time.
    pub fn close(self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.maintenance.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        self.checkpoint()?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.maintenance.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

/// Ordered range scan handle.
pub type Scan<'a> = Cursor<'a>;

fn checkpoint_shared(shared: &EngineShared) -> Result<Lsn> {
    let _guard = shared.maintenance_lock.lock();

    let begin = shared
        .wal
        .append(LogRecord::new(0, NULL_LSN, RecordBody::CheckpointBegin))?;
    let active = shared.tm.checkpoint_snapshot();
    shared
        .wal
        .append(LogRecord::new(0, begin, RecordBody::CheckpointEnd { active }))?;

    shared.pool.flush_all()?;

    {
        let pin = shared.pool.fetch(0)?;
        let mut page = pin.write();
        FileHeader::from_bytes_mut(&mut page)?.set_checkpoint_lsn(begin);
    }
    shared.pool.flush_page(0)?;
    shared.file.sync()?;

    let cutoff = shared
        .tm
        .oldest_active_first_lsn()
        .map_or(begin, |first| first.min(begin));
    shared.wal.truncate_before(cutoff)?;

    shared.last_checkpoint.store(begin, Ordering::Release);
    Ok(begin)
}

fn sweep_shared(shared: &EngineShared) -> Result<SweepStats> {
    let _guard = shared.maintenance_lock.lock();
    shared.tree.sweep(shared.tm.watermark())
}
