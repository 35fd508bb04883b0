//! # Transaction Management
//!
//! Transaction IDs are 64-bit values from a global atomic counter: unique,
//! naturally ordered for visibility checks, never reused. `0` is reserved
//! for bootstrapped always-visible data and for system (structural) WAL
//! records.
//!
//! ## The Active Table
//!
//! The manager tracks every in-flight transaction along with its first and
//! last WAL record LSNs. The table serves four consumers:
//!
//! - `begin()` snapshots the active IDs as the new transaction's exclusion
//!   set;
//! - conflict checks ask `is_active` to distinguish first-writer-wins
//!   conflicts from lost-update serialization failures;
//! - checkpoints snapshot the table (IDs + LSNs) into `CheckpointEnd` for
//!   recovery's Analysis pass, and use the minimum `first_lsn` to bound
//!   WAL truncation;
//! - the garbage sweep uses the minimum active ID as its watermark.
//!
//! ## Snapshot Semantics
//!
//! A snapshot is the pair (own ID, exclusion set). `sees(t)` is true for
//! the transaction's own writes, bootstrapped data, and any transaction
//! that both began and finished before this one began — which, because
//! aborted transactions' versions are physically rolled back, is exactly
//! "committed and visible".
//!
//! ## Concurrency
//!
//! ID allocation is a lock-free `fetch_add`; the active table sits behind
//! one short mutex. The capacity cap keeps the exclusion-set copy in
//! `begin()` bounded.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{Lsn, TxnId};
use crate::config::MAX_CONCURRENT_TXNS;
use crate::error::EngineError;
use crate::wal::{ActiveTxn, NULL_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    Active,
    Committed,
    Aborted,
}

/// A transaction's fixed visibility boundary: its own ID plus the set of
/// transactions that were active when it began.
#[derive(Debug, Clone)]
pub struct Snapshot {
    txn_id: TxnId,
    /// Sorted, for binary search.
    active: SmallVec<[TxnId; 8]>,
}

impl Snapshot {
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Whether `t`'s effects are inside this snapshot.
    pub fn sees(&self, t: TxnId) -> bool {
        if t == self.txn_id || t == 0 {
            return true;
        }
        t < self.txn_id && self.active.binary_search(&t).is_err()
    }

    #[cfg(test)]
    pub fn for_test(txn_id: TxnId, active: &[TxnId]) -> Self {
        let mut active: SmallVec<[TxnId; 8]> = active.iter().copied().collect();
        active.sort_unstable();
        Self { txn_id, active }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveInfo {
    first_lsn: Lsn,
    last_lsn: Lsn,
}

pub struct TransactionManager {
    next_txn: AtomicU64,
    active: Mutex<HashMap<TxnId, ActiveInfo>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Recovery seeds the counter past every ID seen in the WAL.
    pub fn starting_at(next: TxnId) -> Self {
        Self {
            next_txn: AtomicU64::new(next.max(1)),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates an ID and captures the active set as the snapshot.
    pub fn begin(&self) -> Result<Snapshot> {
        let mut active = self.active.lock();
        if active.len() >= MAX_CONCURRENT_TXNS {
            return Err(EngineError::TooManyTransactions {
                max: MAX_CONCURRENT_TXNS,
            }
            .into());
        }

        let txn_id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        let mut exclusion: SmallVec<[TxnId; 8]> = active.keys().copied().collect();
        exclusion.sort_unstable();

        active.insert(
            txn_id,
            ActiveInfo {
                first_lsn: NULL_LSN,
                last_lsn: NULL_LSN,
            },
        );

        Ok(Snapshot {
            txn_id,
            active: exclusion,
        })
    }

    /// Removes a transaction from the active table. For a commit this
    /// publishes visibility to future snapshots; for an abort the caller
    /// has already rolled the versions back.
    pub fn finish(&self, txn_id: TxnId) {
        self.active.lock().remove(&txn_id);
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active.lock().contains_key(&txn_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Records a WAL append on behalf of `txn_id`.
    pub fn note_lsn(&self, txn_id: TxnId, lsn: Lsn) {
        if let Some(info) = self.active.lock().get_mut(&txn_id) {
            if info.first_lsn == NULL_LSN {
                info.first_lsn = lsn;
            }
            info.last_lsn = lsn;
        }
    }

    /// The active table as a `CheckpointEnd` payload.
    pub fn checkpoint_snapshot(&self) -> Vec<ActiveTxn> {
        self.active
            .lock()
            .iter()
            .map(|(&txn_id, info)| ActiveTxn {
                txn_id,
                first_lsn: info.first_lsn,
                last_lsn: info.last_lsn,
            })
            .collect()
    }

    /// Earliest first-LSN among active transactions; bounds WAL truncation.
    pub fn oldest_active_first_lsn(&self) -> Option<Lsn> {
        self.active
            .lock()
            .values()
            .filter(|info| info.first_lsn != NULL_LSN)
            .map(|info| info.first_lsn)
            .min()
    }

    /// Versions created below this ID are visible to every current and
    /// future snapshot (GC watermark).
    pub fn watermark(&self) -> TxnId {
        let active = self.active.lock();
        active
            .keys()
            .copied()
            .min()
            .unwrap_or_else(|| self.next_txn.load(Ordering::SeqCst))
    }

    /// Recovery inserts crash-time losers so their versions stay invisible
    /// until undo finishes.
    pub fn adopt_active(&self, txn_id: TxnId, first_lsn: Lsn, last_lsn: Lsn) {
        self.active
            .lock()
            .insert(txn_id, ActiveInfo { first_lsn, last_lsn });
        // Keep the counter ahead of anything we adopt.
        let mut next = self.next_txn.load(Ordering::SeqCst);
        while txn_id >= next {
            match self.next_txn.compare_exchange(
                next,
                txn_id + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => next = actual,
            }
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
