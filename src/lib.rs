//! # StrataDB - Transactional Page-Based Storage Engine
//!
//! StrataDB is a B+Tree-indexed key/record store with write-ahead logging
//! and MVCC snapshot isolation. It is the storage half of a database: a
//! SQL layer, wire protocol, or application sits on top and consumes the
//! key/record API and cursor interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratadb::{Engine, EngineConfig};
//!
//! let engine = Engine::create(path, EngineConfig::default())?;
//!
//! let mut txn = engine.begin()?;
//! engine.put(&mut txn, b"user:1", b"alice")?;
//! engine.commit(txn)?;                       // durable on return
//!
//! let txn = engine.begin()?;
//! assert_eq!(engine.get(&txn, b"user:1")?, Some(b"alice".to_vec()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Public API (Engine)            │
//! ├─────────────────────────────────────────┤
//! │  Transactions │ Snapshots │ Key Locks   │
//! ├───────────────┴───────────┴─────────────┤
//! │     B+Tree Index + Version Chains       │
//! ├─────────────────────────────────────────┤
//! │  Buffer Pool (SIEVE, pins, latches)     │
//! ├──────────────────────┬──────────────────┤
//! │  Page File + Freelist│  Write-Ahead Log │
//! └──────────────────────┴──────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! database_dir/
//! ├── data.sdb        # single page file: header, tree, versions, overflow
//! └── data.wal        # length-prefixed, checksummed log records
//! ```
//!
//! ## Guarantees
//!
//! - **Durability**: a transaction is committed exactly when its Commit
//!   record is synced; pages follow lazily, never ahead of their log
//!   records.
//! - **Snapshot Isolation**: repeatable point reads against a snapshot
//!   fixed at `begin()`; of two overlapping writers to one key, exactly
//!   one commits. Range-predicate phantoms are a documented limitation.
//! - **Crash recovery**: ARIES-style Analysis / Redo / Undo on open,
//!   idempotent via per-page LSN stamps; corrupt log tails are truncated
//!   with a warning, never silently absorbed.
//!
//! ## Module Overview
//!
//! - [`storage`]: page file, page/file headers, free-list allocator
//! - [`buffer`]: SIEVE page cache with pins and per-page latches
//! - [`wal`]: log records, the append path, readers, truncation
//! - [`btree`]: the index, overflow chains, the maintenance sweep
//! - [`mvcc`]: versions, snapshots, transactions, key locks
//! - [`recovery`]: the three-pass startup protocol
//! - [`engine`]: the public facade

pub mod btree;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod mvcc;
pub mod recovery;
pub mod storage;
pub mod wal;

pub use btree::sweep::SweepStats;
pub use engine::{Engine, EngineConfig, Scan, TxnHandle};
pub use error::{engine_error, EngineError};
pub use mvcc::{TxnId, TxnState};
pub use recovery::RecoveryReport;
pub use wal::Lsn;
