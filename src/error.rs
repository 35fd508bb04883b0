//! # Engine Error Taxonomy
//!
//! All fallible paths in StrataDB return `eyre::Result`. Recoverable
//! conditions additionally carry a typed [`EngineError`] at the root of the
//! report chain so callers can decide whether to retry:
//!
//! ```ignore
//! match engine.put(&mut txn, key, value) {
//!     Ok(()) => {}
//!     Err(report) => match report.downcast_ref::<EngineError>() {
//!         Some(e) if e.is_retryable() => retry_transaction(),
//!         _ => return Err(report),
//!     },
//! }
//! ```
//!
//! ## Classes
//!
//! - `Conflict` / `SerializationFailure`: the write lost a race with a
//!   concurrent transaction. The losing transaction is already aborted when
//!   the error surfaces; the caller retries from `begin()`.
//! - `LockTimeout` / `Deadlock`: key-lock acquisition failed. Retryable.
//! - `StaleCursor`: a range scan was invalidated by a structural change
//!   (split/merge moved the cursor's position). The caller re-issues the scan.
//! - `TooManyTransactions`: the active-transaction table is full.
//!
//! Storage faults, checksum mismatches and corrupt-log conditions are plain
//! `eyre` reports with `wrap_err` context; they are fatal to the affected
//! operation but leave the engine usable for other pages.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("write-write conflict: key is locked by active transaction {holder}")]
    Conflict { holder: u64 },

    #[error("serialization failure: key was modified by a transaction committed after this snapshot")]
    SerializationFailure,

    #[error("lock wait timed out after {waited_ms} ms")]
    LockTimeout { waited_ms: u64 },

    #[error("deadlock detected: transaction {victim} aborted as victim")]
    Deadlock { victim: u64 },

    #[error("cursor invalidated by a structural change; re-issue the scan")]
    StaleCursor,

    #[error("too many concurrent transactions (max {max})")]
    TooManyTransactions { max: usize },
}

impl EngineError {
    /// Whether the caller can expect a retry of the whole transaction
    /// (or scan, for `StaleCursor`) to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. }
                | EngineError::SerializationFailure
                | EngineError::LockTimeout { .. }
                | EngineError::Deadlock { .. }
                | EngineError::StaleCursor
                | EngineError::TooManyTransactions { .. }
        )
    }
}

/// Extracts the typed engine error from a report chain, if present.
pub fn engine_error(report: &eyre::Report) -> Option<&EngineError> {
    report.downcast_ref::<EngineError>()
}
