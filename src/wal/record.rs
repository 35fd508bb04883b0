//! # WAL Record Format
//!
//! Every mutation is described by a log record tagged with a monotonic Log
//! Sequence Number before the corresponding page change can reach disk.
//! Records chain backwards per transaction through `prev_lsn`, which is how
//! rollback and recovery undo walk a transaction's history without scanning
//! the whole log.
//!
//! ## Record Taxonomy
//!
//! - `Begin` / `Commit` / `Abort`: transaction lifecycle. Commit durability
//!   *is* transaction durability.
//! - `Value(ValueOp)`: one logical change to one key — insert a cell,
//!   replace a cell (carrying both before and after images), or stamp a
//!   deletion. Redo is page-targeted and idempotent; the before image is
//!   sufficient for undo.
//! - `Clr`: compensation record written while undoing. Carries the
//!   compensating op (replayed like a value op during redo) and `undo_next`,
//!   the next record to undo, so that undo itself is crash-safe and never
//!   repeated.
//! - `Structural`: full images of every page touched by one structural
//!   change (split, merge, page allocation/free). One record per change
//!   keeps structural redo atomic — a torn tail either has the whole change
//!   or none of it.
//! - `CheckpointBegin` / `CheckpointEnd`: bracket a checkpoint;
//!   `CheckpointEnd` snapshots the active-transaction table for the
//!   Analysis pass.
//!
//! ## Wire Format
//!
//! ```text
//! +-----------+--------+----------+--------+------+---------+--------+
//! | total_len | lsn    | prev_lsn | txn_id | kind | payload | crc    |
//! | u32       | u64    | u64      | u64    | u8   | ...     | u64    |
//! +-----------+--------+----------+--------+------+---------+--------+
//! ```
//!
//! `total_len` counts everything after itself. The CRC-64 covers the length
//! prefix through the payload; validation failure means the crash tail
//! starts here. All integers little-endian.

use bytes::{Buf, BufMut};
use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result};

use crate::config::MAX_WAL_RECORD_SIZE;

/// Log Sequence Number: a logical byte offset into the log, stable across
/// prefix truncation. `0` is the null LSN (no record).
pub type Lsn = u64;

pub const NULL_LSN: Lsn = 0;

/// Transactions are identified by the same monotonic counter space the
/// transaction manager allocates from. `0` marks system records (structural
/// changes survive aborts and belong to no transaction).
pub type TxnId = u64;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Fixed bytes after the length prefix: lsn + prev_lsn + txn_id + kind.
pub const RECORD_HEADER_SIZE: usize = 8 + 8 + 8 + 1;
pub const RECORD_CRC_SIZE: usize = 8;
/// Length prefix plus smallest possible record.
pub const MIN_RECORD_SIZE: usize = 4 + RECORD_HEADER_SIZE + RECORD_CRC_SIZE;

mod kind {
    pub const BEGIN: u8 = 0x01;
    pub const COMMIT: u8 = 0x02;
    pub const ABORT: u8 = 0x03;
    pub const INSERT: u8 = 0x10;
    pub const UPDATE: u8 = 0x11;
    pub const DELETE: u8 = 0x12;
    pub const CLR: u8 = 0x30;
    pub const STRUCTURAL: u8 = 0x20;
    pub const CHECKPOINT_BEGIN: u8 = 0x40;
    pub const CHECKPOINT_END: u8 = 0x41;
}

/// One logical change to one key, with enough context for both redo
/// (page-targeted, gated on the page LSN) and undo (before images).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueOp {
    /// A new cell appeared in `page`. Undo removes it.
    Insert {
        page: u32,
        key: Vec<u8>,
        cell: Vec<u8>,
    },
    /// The cell for `key` in `page` was replaced; the prior cell body was
    /// copied into the Version page at (`vpage`, `voffset`). Undo restores
    /// `old_cell` and releases the version copy.
    Update {
        page: u32,
        vpage: u32,
        voffset: u16,
        key: Vec<u8>,
        old_cell: Vec<u8>,
        new_cell: Vec<u8>,
    },
    /// `deleted_by` was stamped on the newest version in place. Undo clears
    /// the stamp.
    Delete {
        page: u32,
        key: Vec<u8>,
        deleted_by: TxnId,
    },
    /// Compensation: remove the cell `Insert` created.
    UndoInsert { page: u32, key: Vec<u8> },
    /// Compensation: restore the pre-update cell and release the version
    /// copy at (`vpage`, `voffset`).
    UndoUpdate {
        page: u32,
        key: Vec<u8>,
        old_cell: Vec<u8>,
        vpage: u32,
        voffset: u16,
    },
    /// Compensation: clear a `deleted_by` stamp.
    UndoDelete { page: u32, key: Vec<u8> },
}

impl ValueOp {
    /// The leaf page this op targets (redo locality hint; undo re-locates
    /// by key since splits may have moved the cell).
    pub fn page(&self) -> u32 {
        match self {
            ValueOp::Insert { page, .. }
            | ValueOp::Update { page, .. }
            | ValueOp::Delete { page, .. }
            | ValueOp::UndoInsert { page, .. }
            | ValueOp::UndoUpdate { page, .. }
            | ValueOp::UndoDelete { page, .. } => *page,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            ValueOp::Insert { key, .. }
            | ValueOp::Update { key, .. }
            | ValueOp::Delete { key, .. }
            | ValueOp::UndoInsert { key, .. }
            | ValueOp::UndoUpdate { key, .. }
            | ValueOp::UndoDelete { key, .. } => key,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            ValueOp::Insert { .. } => 1,
            ValueOp::Update { .. } => 2,
            ValueOp::Delete { .. } => 3,
            ValueOp::UndoInsert { .. } => 4,
            ValueOp::UndoUpdate { .. } => 5,
            ValueOp::UndoDelete { .. } => 6,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.tag());
        match self {
            ValueOp::Insert { page, key, cell } => {
                buf.put_u32_le(*page);
                put_bytes16(buf, key);
                put_bytes32(buf, cell);
            }
            ValueOp::Update {
                page,
                vpage,
                voffset,
                key,
                old_cell,
                new_cell,
            } => {
                buf.put_u32_le(*page);
                buf.put_u32_le(*vpage);
                buf.put_u16_le(*voffset);
                put_bytes16(buf, key);
                put_bytes32(buf, old_cell);
                put_bytes32(buf, new_cell);
            }
            ValueOp::Delete {
                page,
                key,
                deleted_by,
            } => {
                buf.put_u32_le(*page);
                put_bytes16(buf, key);
                buf.put_u64_le(*deleted_by);
            }
            ValueOp::UndoInsert { page, key } => {
                buf.put_u32_le(*page);
                put_bytes16(buf, key);
            }
            ValueOp::UndoUpdate {
                page,
                key,
                old_cell,
                vpage,
                voffset,
            } => {
                buf.put_u32_le(*page);
                put_bytes16(buf, key);
                put_bytes32(buf, old_cell);
                buf.put_u32_le(*vpage);
                buf.put_u16_le(*voffset);
            }
            ValueOp::UndoDelete { page, key } => {
                buf.put_u32_le(*page);
                put_bytes16(buf, key);
            }
        }
    }

    fn decode(data: &mut &[u8]) -> Result<Self> {
        ensure!(data.remaining() >= 1, "truncated value op");
        let tag = data.get_u8();
        let op = match tag {
            1 => {
                let page = get_u32(data)?;
                let key = get_bytes16(data)?;
                let cell = get_bytes32(data)?;
                ValueOp::Insert { page, key, cell }
            }
            2 => {
                let page = get_u32(data)?;
                let vpage = get_u32(data)?;
                let voffset = get_u16(data)?;
                let key = get_bytes16(data)?;
                let old_cell = get_bytes32(data)?;
                let new_cell = get_bytes32(data)?;
                ValueOp::Update {
                    page,
                    vpage,
                    voffset,
                    key,
                    old_cell,
                    new_cell,
                }
            }
            3 => {
                let page = get_u32(data)?;
                let key = get_bytes16(data)?;
                let deleted_by = get_u64(data)?;
                ValueOp::Delete {
                    page,
                    key,
                    deleted_by,
                }
            }
            4 => {
                let page = get_u32(data)?;
                let key = get_bytes16(data)?;
                ValueOp::UndoInsert { page, key }
            }
            5 => {
                let page = get_u32(data)?;
                let key = get_bytes16(data)?;
                let old_cell = get_bytes32(data)?;
                let vpage = get_u32(data)?;
                let voffset = get_u16(data)?;
                ValueOp::UndoUpdate {
                    page,
                    key,
                    old_cell,
                    vpage,
                    voffset,
                }
            }
            6 => {
                let page = get_u32(data)?;
                let key = get_bytes16(data)?;
                ValueOp::UndoDelete { page, key }
            }
            _ => bail!("invalid value op tag: {}", tag),
        };
        Ok(op)
    }
}

/// A full page image inside a structural record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub page_no: u32,
    pub image: Vec<u8>,
}

/// An active transaction snapshotted by `CheckpointEnd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTxn {
    pub txn_id: TxnId,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Begin,
    Commit,
    Abort,
    Value(ValueOp),
    Clr { undo_next: Lsn, op: ValueOp },
    Structural { pages: Vec<PageImage> },
    CheckpointBegin,
    CheckpointEnd { active: Vec<ActiveTxn> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txn_id: TxnId,
    pub body: RecordBody,
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, body: RecordBody) -> Self {
        Self {
            lsn: NULL_LSN,
            prev_lsn,
            txn_id,
            body,
        }
    }

    pub fn kind(&self) -> u8 {
        match &self.body {
            RecordBody::Begin => kind::BEGIN,
            RecordBody::Commit => kind::COMMIT,
            RecordBody::Abort => kind::ABORT,
            RecordBody::Value(op) => match op {
                ValueOp::Insert { .. } => kind::INSERT,
                ValueOp::Update { .. } | ValueOp::UndoUpdate { .. } => kind::UPDATE,
                ValueOp::Delete { .. } | ValueOp::UndoDelete { .. } => kind::DELETE,
                ValueOp::UndoInsert { .. } => kind::INSERT,
            },
            RecordBody::Clr { .. } => kind::CLR,
            RecordBody::Structural { .. } => kind::STRUCTURAL,
            RecordBody::CheckpointBegin => kind::CHECKPOINT_BEGIN,
            RecordBody::CheckpointEnd { .. } => kind::CHECKPOINT_END,
        }
    }

    /// Serializes the full wire form: length prefix, header, payload, CRC.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match &self.body {
            RecordBody::Begin
            | RecordBody::Commit
            | RecordBody::Abort
            | RecordBody::CheckpointBegin => {}
            RecordBody::Value(op) => op.encode(&mut payload),
            RecordBody::Clr { undo_next, op } => {
                payload.put_u64_le(*undo_next);
                op.encode(&mut payload);
            }
            RecordBody::Structural { pages } => {
                payload.put_u16_le(pages.len() as u16);
                for p in pages {
                    payload.put_u32_le(p.page_no);
                    put_bytes32(&mut payload, &p.image);
                }
            }
            RecordBody::CheckpointEnd { active } => {
                payload.put_u16_le(active.len() as u16);
                for t in active {
                    payload.put_u64_le(t.txn_id);
                    payload.put_u64_le(t.first_lsn);
                    payload.put_u64_le(t.last_lsn);
                }
            }
        }

        let total_len = (RECORD_HEADER_SIZE + payload.len() + RECORD_CRC_SIZE) as u32;
        let mut buf = Vec::with_capacity(4 + total_len as usize);
        buf.put_u32_le(total_len);
        buf.put_u64_le(self.lsn);
        buf.put_u64_le(self.prev_lsn);
        buf.put_u64_le(self.txn_id);
        buf.put_u8(self.kind());
        buf.extend_from_slice(&payload);

        let crc = CRC64.checksum(&buf);
        buf.put_u64_le(crc);
        buf
    }

    /// Total on-disk bytes this record occupies.
    pub fn encoded_len(&self) -> usize {
        self.encode().len()
    }

    /// Decodes a full wire record (length prefix included). The caller has
    /// already framed the slice using the length prefix.
    pub fn decode(wire: &[u8]) -> Result<Self> {
        ensure!(wire.len() >= MIN_RECORD_SIZE, "record too short");
        ensure!(
            wire.len() <= 4 + MAX_WAL_RECORD_SIZE,
            "record too large: {} bytes",
            wire.len()
        );

        let crc_start = wire.len() - RECORD_CRC_SIZE;
        let stored_crc = u64::from_le_bytes(wire[crc_start..].try_into().unwrap());
        let computed = CRC64.checksum(&wire[..crc_start]);
        ensure!(
            stored_crc == computed,
            "WAL record checksum mismatch: stored={:#x}, computed={:#x}",
            stored_crc,
            computed
        );

        let mut data = &wire[4..crc_start];
        let lsn = data.get_u64_le();
        let prev_lsn = data.get_u64_le();
        let txn_id = data.get_u64_le();
        let k = data.get_u8();

        let body = match k {
            kind::BEGIN => RecordBody::Begin,
            kind::COMMIT => RecordBody::Commit,
            kind::ABORT => RecordBody::Abort,
            kind::CHECKPOINT_BEGIN => RecordBody::CheckpointBegin,
            kind::INSERT | kind::UPDATE | kind::DELETE => {
                RecordBody::Value(ValueOp::decode(&mut data)?)
            }
            kind::CLR => {
                let undo_next = get_u64(&mut data)?;
                let op = ValueOp::decode(&mut data)?;
                RecordBody::Clr { undo_next, op }
            }
            kind::STRUCTURAL => {
                let count = get_u16(&mut data)? as usize;
                let mut pages = Vec::with_capacity(count);
                for _ in 0..count {
                    let page_no = get_u32(&mut data)?;
                    let image = get_bytes32(&mut data)?;
                    pages.push(PageImage { page_no, image });
                }
                RecordBody::Structural { pages }
            }
            kind::CHECKPOINT_END => {
                let count = get_u16(&mut data)? as usize;
                let mut active = Vec::with_capacity(count);
                for _ in 0..count {
                    active.push(ActiveTxn {
                        txn_id: get_u64(&mut data)?,
                        first_lsn: get_u64(&mut data)?,
                        last_lsn: get_u64(&mut data)?,
                    });
                }
                RecordBody::CheckpointEnd { active }
            }
            _ => bail!("invalid WAL record kind: {:#04x}", k),
        };

        ensure!(data.is_empty(), "trailing bytes after WAL record payload");

        Ok(Self {
            lsn,
            prev_lsn,
            txn_id,
            body,
        })
    }
}

fn put_bytes16(buf: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= u16::MAX as usize);
    buf.put_u16_le(data.len() as u16);
    buf.extend_from_slice(data);
}

fn put_bytes32(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.extend_from_slice(data);
}

fn get_u16(data: &mut &[u8]) -> Result<u16> {
    ensure!(data.remaining() >= 2, "truncated WAL payload");
    Ok(data.get_u16_le())
}

fn get_u32(data: &mut &[u8]) -> Result<u32> {
    ensure!(data.remaining() >= 4, "truncated WAL payload");
    Ok(data.get_u32_le())
}

fn get_u64(data: &mut &[u8]) -> Result<u64> {
    ensure!(data.remaining() >= 8, "truncated WAL payload");
    Ok(data.get_u64_le())
}

fn get_bytes16(data: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_u16(data)? as usize;
    ensure!(data.remaining() >= len, "truncated WAL payload");
    let mut out = vec![0u8; len];
    data.copy_to_slice(&mut out);
    Ok(out)
}

fn get_bytes32(data: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_u32(data)? as usize;
    ensure!(data.remaining() >= len, "truncated WAL payload");
    let mut out = vec![0u8; len];
    data.copy_to_slice(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: LogRecord) {
        let wire = record.encode();
        let back = LogRecord::decode(&wire).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn begin_commit_abort_roundtrip() {
        for body in [RecordBody::Begin, RecordBody::Commit, RecordBody::Abort] {
            let mut rec = LogRecord::new(7, 100, body);
            rec.lsn = 200;
            roundtrip(rec);
        }
    }

    #[test]
    fn insert_op_roundtrip() {
        let mut rec = LogRecord::new(
            3,
            50,
            RecordBody::Value(ValueOp::Insert {
                page: 12,
                key: b"user:1".to_vec(),
                cell: vec![1, 2, 3, 4],
            }),
        );
        rec.lsn = 99;
        roundtrip(rec);
    }

    #[test]
    fn update_op_carries_both_images() {
        let op = ValueOp::Update {
            page: 4,
            vpage: 9,
            voffset: 64,
            key: b"k".to_vec(),
            old_cell: vec![0xAA; 30],
            new_cell: vec![0xBB; 40],
        };
        let mut rec = LogRecord::new(5, 10, RecordBody::Value(op));
        rec.lsn = 11;
        roundtrip(rec);
    }

    #[test]
    fn clr_roundtrip() {
        let mut rec = LogRecord::new(
            5,
            300,
            RecordBody::Clr {
                undo_next: 120,
                op: ValueOp::UndoInsert {
                    page: 3,
                    key: b"gone".to_vec(),
                },
            },
        );
        rec.lsn = 400;
        roundtrip(rec);
    }

    #[test]
    fn structural_roundtrip() {
        let mut rec = LogRecord::new(
            0,
            NULL_LSN,
            RecordBody::Structural {
                pages: vec![
                    PageImage {
                        page_no: 1,
                        image: vec![7u8; 4096],
                    },
                    PageImage {
                        page_no: 8,
                        image: vec![9u8; 4096],
                    },
                ],
            },
        );
        rec.lsn = 1000;
        roundtrip(rec);
    }

    #[test]
    fn checkpoint_end_roundtrip() {
        let mut rec = LogRecord::new(
            0,
            NULL_LSN,
            RecordBody::CheckpointEnd {
                active: vec![
                    ActiveTxn {
                        txn_id: 4,
                        first_lsn: 10,
                        last_lsn: 88,
                    },
                    ActiveTxn {
                        txn_id: 9,
                        first_lsn: 50,
                        last_lsn: 60,
                    },
                ],
            },
        );
        rec.lsn = 90;
        roundtrip(rec);
    }

    #[test]
    fn corrupted_record_fails_checksum() {
        let mut rec = LogRecord::new(1, NULL_LSN, RecordBody::Begin);
        rec.lsn = 1;
        let mut wire = rec.encode();
        wire[10] ^= 0xFF;
        let err = LogRecord::decode(&wire).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn truncated_record_rejected() {
        let mut rec = LogRecord::new(1, NULL_LSN, RecordBody::Begin);
        rec.lsn = 1;
        let wire = rec.encode();
        assert!(LogRecord::decode(&wire[..wire.len() - 3]).is_err());
    }
}
