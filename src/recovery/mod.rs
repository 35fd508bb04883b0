//! # Recovery Manager
//!
//! Startup runs the classic three-pass protocol before the engine accepts
//! a single operation. Recovery is an explicit, finite iteration over log
//! records with idempotent apply — no recursion, resumable, and testable
//! against a bare WAL.
//!
//! ## Analysis
//!
//! Scan forward from the last checkpoint, reconstituting the active
//! transaction table: the `CheckpointEnd` snapshot seeds it, `Begin`
//! records add, value records advance a transaction's last LSN, `Commit`
//! and `Abort` retire. Whatever remains at the scan end lost the crash.
//!
//! ## Redo
//!
//! Replay *everything* from the checkpoint forward — winners, losers,
//! structural changes alike ("repeat history"). Every apply is gated on
//! the target page's stamped LSN: a page already at or past the record's
//! LSN was flushed after the change and is skipped. Structural records
//! restore full page images; value records re-run the cell-level change.
//!
//! ## Undo
//!
//! Losers roll back in global reverse-LSN order, following each
//! transaction's `prev_lsn` chain. Every compensating change is logged as
//! a Clr whose `undo_next` skips what has already been undone, so a crash
//! during recovery never double-applies an undo. Reaching a `Begin`
//! appends the final `Abort`.
//!
//! ## Corrupt Tails
//!
//! A torn or corrupt record marks the end of the usable log. The tail is
//! truncated at the last valid record with a warning on stderr — a crash
//! mid-write loses the unacknowledged suffix, never fabricates data, and
//! never hides the cut.

use std::sync::Arc;

use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;

use crate::btree::{node, tree::BTree};
use crate::buffer::BufferPool;
use crate::mvcc::version_store;
use crate::mvcc::VersionHeader;
use crate::storage::page::{page_lsn, set_page_lsn, PageHeader};
use crate::storage::{FileHeader, PageFile};
use crate::wal::{LogRecord, Lsn, RecordBody, TxnId, ValueOp, Wal, NULL_LSN};

/// What recovery did, for the engine's log line and for tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub records_scanned: usize,
    pub redo_applied: usize,
    pub losers_undone: usize,
    pub corrupt_tail: Option<Lsn>,
    /// Highest transaction ID seen; the manager's counter starts past it.
    pub max_txn_id: TxnId,
}

#[derive(Debug, Clone, Copy)]
struct LoserState {
    last_lsn: Lsn,
    /// Where the eventual Abort record chains from.
    undo_chain: Lsn,
}

/// Runs Analysis, Redo and Undo. The caller constructs the tree over a
/// pool whose pages may be arbitrarily stale; on return the store
/// reflects exactly the committed history.
pub fn run(
    pool: &Arc<BufferPool>,
    file: &Arc<PageFile>,
    wal: &Arc<Wal>,
    tree: &BTree,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    report.corrupt_tail = wal.truncated_tail();

    let start_lsn = {
        let pin = pool.fetch(0)?;
        let page = pin.read();
        FileHeader::from_bytes(&page)?.checkpoint_lsn()
    };
    let start_lsn = if start_lsn == NULL_LSN {
        crate::wal::FIRST_LSN
    } else {
        start_lsn
    };

    // ---- Analysis --------------------------------------------------------

    let mut losers: HashMap<TxnId, LoserState> = HashMap::new();
    {
        let mut reader = wal.reader_from(start_lsn).wrap_err("analysis scan failed")?;
        while let Some(record) = reader.next_record()? {
            report.records_scanned += 1;
            report.max_txn_id = report.max_txn_id.max(record.txn_id);
            match &record.body {
                RecordBody::CheckpointEnd { active } => {
                    for t in active {
                        report.max_txn_id = report.max_txn_id.max(t.txn_id);
                        losers.entry(t.txn_id).or_insert(LoserState {
                            last_lsn: t.last_lsn,
                            undo_chain: t.last_lsn,
                        });
                    }
                }
                RecordBody::Begin => {
                    losers.insert(
                        record.txn_id,
                        LoserState {
                            last_lsn: record.lsn,
                            undo_chain: record.lsn,
                        },
                    );
                }
                RecordBody::Value(_) | RecordBody::Clr { .. } => {
                    let entry = losers.entry(record.txn_id).or_insert(LoserState {
                        last_lsn: record.lsn,
                        undo_chain: record.lsn,
                    });
                    entry.last_lsn = record.lsn;
                    entry.undo_chain = record.lsn;
                }
                RecordBody::Commit | RecordBody::Abort => {
                    losers.remove(&record.txn_id);
                }
                RecordBody::Structural { .. } | RecordBody::CheckpointBegin => {}
            }
        }
        if let Some(tail) = reader.corrupt_tail() {
            report.corrupt_tail = Some(report.corrupt_tail.map_or(tail, |t| t.min(tail)));
        }
    }

    if let Some(tail) = report.corrupt_tail {
        eprintln!(
            "[recovery] corrupt WAL tail truncated at LSN {}; proceeding with the valid prefix",
            tail
        );
    }

    // ---- Redo ------------------------------------------------------------

    {
        let mut reader = wal.reader_from(start_lsn).wrap_err("redo scan failed")?;
        while let Some(record) = reader.next_record()? {
            match &record.body {
                RecordBody::Value(op) => {
                    report.redo_applied += redo_value_op(pool, file, op, record.lsn)?;
                }
                RecordBody::Clr { op, .. } => {
                    report.redo_applied += redo_value_op(pool, file, op, record.lsn)?;
                }
                RecordBody::Structural { pages } => {
                    for image in pages {
                        report.redo_applied +=
                            redo_page_image(pool, file, image.page_no, &image.image, record.lsn)?;
                    }
                }
                _ => {}
            }
        }
    }

    // ---- Undo ------------------------------------------------------------

    while !losers.is_empty() {
        let (&txn_id, _) = losers
            .iter()
            .max_by_key(|(_, state)| state.last_lsn)
            .expect("non-empty losers");
        let state = losers.get_mut(&txn_id).expect("loser state");

        if state.last_lsn == NULL_LSN {
            losers.remove(&txn_id);
            continue;
        }

        let record = wal
            .read_record_at(state.last_lsn)
            .wrap_err("undo could not read a loser's record")?;
        match record.body {
            RecordBody::Begin => {
                let undo_chain = state.undo_chain;
                wal.append(LogRecord::new(txn_id, undo_chain, RecordBody::Abort))?;
                losers.remove(&txn_id);
                report.losers_undone += 1;
            }
            RecordBody::Clr { undo_next, .. } => {
                state.last_lsn = undo_next;
            }
            RecordBody::Value(ref op) => {
                let undo_op = invert(op)?;
                let clr = tree.apply_undo(txn_id, &undo_op, record.prev_lsn)?;
                state.last_lsn = record.prev_lsn;
                state.undo_chain = clr;
            }
            ref other => bail!(
                "unexpected {:?} record in transaction {}'s undo chain",
                other,
                txn_id
            ),
        }
    }

    wal.sync().wrap_err("failed to sync WAL after recovery")?;
    Ok(report)
}

/// The compensating op for a forward value op.
fn invert(op: &ValueOp) -> Result<ValueOp> {
    Ok(match op {
        ValueOp::Insert { page, key, .. } => ValueOp::UndoInsert {
            page: *page,
            key: key.clone(),
        },
        ValueOp::Update {
            page,
            key,
            old_cell,
            vpage,
            voffset,
            ..
        } => ValueOp::UndoUpdate {
            page: *page,
            key: key.clone(),
            old_cell: old_cell.clone(),
            vpage: *vpage,
            voffset: *voffset,
        },
        ValueOp::Delete { page, key, .. } => ValueOp::UndoDelete {
            page: *page,
            key: key.clone(),
        },
        other => bail!("cannot invert undo op {:?}", other),
    })
}

fn fetch_grown(
    pool: &Arc<BufferPool>,
    file: &Arc<PageFile>,
    page_no: u32,
) -> Result<crate::buffer::PagePin> {
    if page_no >= file.page_count() {
        file.grow(page_no + 1)?;
    }
    pool.fetch(page_no)
}

/// Restores one page image if the page has not already seen this LSN.
fn redo_page_image(
    pool: &Arc<BufferPool>,
    file: &Arc<PageFile>,
    page_no: u32,
    image: &[u8],
    lsn: Lsn,
) -> Result<usize> {
    let pin = fetch_grown(pool, file, page_no)?;
    let mut page = pin.write();

    let current = if page_no == 0 {
        FileHeader::from_bytes(&page)
            .map(|h| h.page_lsn())
            .unwrap_or(0)
    } else {
        page_lsn(&page)
    };
    if current >= lsn {
        return Ok(0);
    }

    page.copy_from_slice(image);
    if page_no == 0 {
        FileHeader::from_bytes_mut(&mut page)?.set_page_lsn(lsn);
    } else {
        set_page_lsn(&mut page, lsn);
    }
    Ok(1)
}

/// Re-applies one cell-level change, gating each touched page on its LSN.
fn redo_value_op(
    pool: &Arc<BufferPool>,
    file: &Arc<PageFile>,
    op: &ValueOp,
    lsn: Lsn,
) -> Result<usize> {
    let mut applied = 0;

    // The Version-page half of updates and their undos.
    match op {
        ValueOp::Update {
            vpage,
            voffset,
            old_cell,
            ..
        } => {
            let pin = fetch_grown(pool, file, *vpage)?;
            let mut page = pin.write();
            if page_lsn(&page) < lsn {
                version_store::write_entry(&mut page, *voffset, old_cell);
                set_page_lsn(&mut page, lsn);
                applied += 1;
            }
        }
        ValueOp::UndoUpdate { vpage, .. } => {
            let pin = fetch_grown(pool, file, *vpage)?;
            let mut page = pin.write();
            if page_lsn(&page) < lsn {
                version_store::dec_live(&mut page);
                set_page_lsn(&mut page, lsn);
                applied += 1;
            }
        }
        _ => {}
    }

    // The leaf half.
    let leaf_no = op.page();
    let pin = fetch_grown(pool, file, leaf_no)?;
    let mut page = pin.write();
    if page_lsn(&page) >= lsn {
        return Ok(applied);
    }

    match op {
        ValueOp::Insert { key, cell, .. } => match node::find_key(&page, key) {
            Ok(idx) => node::replace_cell(&mut page, idx, key, cell)?,
            Err(idx) => node::insert_cell(&mut page, idx, key, cell)?,
        },
        ValueOp::Update { key, new_cell, .. } => match node::find_key(&page, key) {
            Ok(idx) => node::replace_cell(&mut page, idx, key, new_cell)?,
            Err(idx) => node::insert_cell(&mut page, idx, key, new_cell)?,
        },
        ValueOp::Delete {
            key, deleted_by, ..
        } => {
            if let Ok(idx) = node::find_key(&page, key) {
                let body = node::body_at_mut(&mut page, idx);
                let mut header = VersionHeader::from_bytes(body);
                header.deleted_by = *deleted_by;
                header.write_to(body);
            }
        }
        ValueOp::UndoInsert { key, .. } => {
            if let Ok(idx) = node::find_key(&page, key) {
                node::remove_cell(&mut page, idx)?;
            }
        }
        ValueOp::UndoUpdate { key, old_cell, .. } => match node::find_key(&page, key) {
            Ok(idx) => node::replace_cell(&mut page, idx, key, old_cell)?,
            Err(idx) => node::insert_cell(&mut page, idx, key, old_cell)?,
        },
        ValueOp::UndoDelete { key, .. } => {
            if let Ok(idx) = node::find_key(&page, key) {
                let body = node::body_at_mut(&mut page, idx);
                let mut header = VersionHeader::from_bytes(body);
                header.deleted_by = 0;
                header.write_to(body);
            }
        }
    }
    set_page_lsn(&mut page, lsn);
    // A leaf touched by redo must parse as a leaf afterwards.
    debug_assert!(PageHeader::from_bytes(&page).is_ok());
    Ok(applied + 1)
}
