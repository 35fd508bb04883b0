//! # Key Lock Table
//!
//! Operation-scoped exclusive locks on keys. A writer holds a key's lock
//! only for the duration of one `put`/`delete` — never across commit I/O —
//! so the table serializes concurrent writers mid-operation while the
//! *transactional* conflict decisions stay with the version headers.
//!
//! ## Waiting
//!
//! A blocked acquirer parks on the key's condvar with an optional
//! wall-clock bound; timeout surfaces as a retryable
//! [`EngineError::LockTimeout`], distinct from a permanent conflict.
//!
//! ## Deadlock Detection
//!
//! Before each wait the acquirer records a waits-for edge to the current
//! holder and runs a cycle check over the whole graph. A cycle aborts the
//! requester with [`EngineError::Deadlock`] — with operation-scoped locks
//! the requester is the newest arrival closing the cycle, which makes it
//! the youngest transaction involved.
//!
//! ## Housekeeping
//!
//! Each queue carries a reference count of interested parties (holder and
//! waiters, counted from the moment the queue is looked up under the table
//! lock). The entry is removed only when the count hits zero, which it can
//! only do with no thread still parked on the condvar — so a waiter can
//! never be orphaned on a queue that a later acquirer cannot find.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use super::TxnId;
use crate::error::EngineError;

#[derive(Default)]
struct QueueState {
    holder: Option<TxnId>,
    waiters: u32,
}

#[derive(Default)]
struct KeyQueue {
    state: Mutex<QueueState>,
    cvar: Condvar,
    /// Holders + waiters + in-flight acquirers referencing this queue.
    refs: AtomicU32,
}

pub struct LockTable {
    table: Mutex<HashMap<Vec<u8>, Arc<KeyQueue>>>,
    waits_for: Mutex<HashMap<TxnId, SmallVec<[TxnId; 4]>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires the exclusive lock on `key` for `txn_id`, waiting up to
    /// `timeout` (forever if `None`). Re-acquisition by the current holder
    /// returns a non-owning guard.
    pub fn acquire(
        &self,
        txn_id: TxnId,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<KeyLockGuard<'_>> {
        let queue = {
            let mut table = self.table.lock();
            let queue = Arc::clone(table.entry(key.to_vec()).or_default());
            queue.refs.fetch_add(1, Ordering::AcqRel);
            queue
        };

        let mut state = queue.state.lock();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);

        loop {
            match state.holder {
                None => {
                    state.holder = Some(txn_id);
                    drop(state);
                    self.waits_for.lock().remove(&txn_id);
                    return Ok(KeyLockGuard {
                        locks: self,
                        queue,
                        key: key.to_vec(),
                        txn_id,
                        owns: true,
                    });
                }
                Some(holder) if holder == txn_id => {
                    drop(state);
                    return Ok(KeyLockGuard {
                        locks: self,
                        queue,
                        key: key.to_vec(),
                        txn_id,
                        owns: false,
                    });
                }
                Some(holder) => {
                    if self.would_deadlock(txn_id, holder) {
                        drop(state);
                        self.waits_for.lock().remove(&txn_id);
                        self.drop_ref(&queue, key);
                        return Err(EngineError::Deadlock { victim: txn_id }.into());
                    }

                    state.waiters += 1;
                    let timed_out = match deadline {
                        Some(deadline) => {
                            queue.cvar.wait_until(&mut state, deadline).timed_out()
                        }
                        None => {
                            queue.cvar.wait(&mut state);
                            false
                        }
                    };
                    state.waiters -= 1;

                    if timed_out {
                        drop(state);
                        self.waits_for.lock().remove(&txn_id);
                        self.drop_ref(&queue, key);
                        let waited_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                        return Err(EngineError::LockTimeout { waited_ms }.into());
                    }
                }
            }
        }
    }

    /// Records the edge `txn_id -> holder` and reports whether it closes a
    /// cycle in the waits-for graph.
    fn would_deadlock(&self, txn_id: TxnId, holder: TxnId) -> bool {
        let mut graph = self.waits_for.lock();
        let edges = graph.entry(txn_id).or_default();
        if !edges.contains(&holder) {
            edges.push(holder);
        }

        let mut stack: SmallVec<[TxnId; 8]> = SmallVec::new();
        let mut seen: HashSet<TxnId> = HashSet::new();
        stack.push(holder);
        while let Some(t) = stack.pop() {
            if t == txn_id {
                return true;
            }
            if !seen.insert(t) {
                continue;
            }
            if let Some(next) = graph.get(&t) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    /// Drops one interest reference; the last one out removes the table
    /// entry. New references are only handed out under the table lock, so
    /// the zero check cannot race with a lookup.
    fn drop_ref(&self, queue: &Arc<KeyQueue>, key: &[u8]) {
        if queue.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut table = self.table.lock();
            if let Some(entry) = table.get(key) {
                if Arc::ptr_eq(entry, queue) && queue.refs.load(Ordering::Acquire) == 0 {
                    table.remove(key);
                }
            }
        }
    }

    fn release(&self, queue: &Arc<KeyQueue>, txn_id: TxnId) {
        let mut state = queue.state.lock();
        debug_assert_eq!(state.holder, Some(txn_id));
        state.holder = None;
        let has_waiters = state.waiters > 0;
        drop(state);

        self.waits_for.lock().remove(&txn_id);
        if has_waiters {
            queue.cvar.notify_all();
        }
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII key lock. Dropping releases the lock and wakes waiters.
pub struct KeyLockGuard<'a> {
    locks: &'a LockTable,
    queue: Arc<KeyQueue>,
    key: Vec<u8>,
    txn_id: TxnId,
    owns: bool,
}

impl std::fmt::Debug for KeyLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self.key)
            .field("txn_id", &self.txn_id)
            .field("owns", &self.owns)
            .finish()
    }
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        if self.owns {
            self.locks.release(&self.queue, self.txn_id);
        }
        self.locks.drop_ref(&self.queue, &self.key);
    }
}
