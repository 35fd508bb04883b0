//! # B+Tree Operations
//!
//! Descent, MVCC value operations, structural maintenance and cursors.
//!
//! ## Descent Protocol
//!
//! The tree is rooted in the file header, so every descent starts by
//! latching page 0, reading the root page number, latching the root, and
//! only then releasing page 0 — the same latch-coupling step applied at
//! every level below: child latched before parent released. Value writers
//! end the descent holding exactly one leaf write latch.
//!
//! ## Value Operations
//!
//! `put` and `delete` never restructure pages. When a leaf lacks room the
//! writer backs out (dropping all latches), runs `make_room` — a
//! structural descent under the engine-wide structural mutex that splits
//! full nodes preemptively top-down — and retries. Version-page space is
//! reserved *before* the final descent so no latch is ever held while
//! waiting on the structural mutex.
//!
//! ## Two-Phase Writes
//!
//! An update copies the prior cell body into a Version page and installs
//! the new version over the old cell:
//!
//! ```text
//! phase 1: read descent    — conflict check, capture old body length
//! phase 2: no latches      — reserve version slot, build overflow chain
//! phase 3: write descent   — re-validate, append WAL record, mutate,
//!                            stamp both pages with the record LSN
//! ```
//!
//! The caller holds the key's write lock across all three phases, so the
//! only interference possible between phases is a split moving the cell
//! (handled by re-descending) or the sweep purging a dead cell (handled
//! by falling back to the insert path).
//!
//! ## Splits
//!
//! Midpoint split; the promoted separator is the right half's first key
//! for leaves and the removed middle key for interior nodes. Each split
//! is logged as one structural record carrying images of every touched
//! page (node, new sibling, parent, and any free-list pages), captured
//! while their write latches are held.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::node;
use super::overflow;
use crate::buffer::{BufferPool, OwnedPageReadGuard, OwnedPageWriteGuard};
use crate::config::{max_inline_cell, MAX_KEY_LEN};
use crate::error::EngineError;
use crate::mvcc::version_store::{self, VersionStore};
use crate::mvcc::{Snapshot, TransactionManager, VersionHeader};
use crate::storage::page::{set_page_lsn, PageHeader, PageType};
use crate::storage::{Allocator, FileHeader, TouchedPages};
use crate::wal::structural::log_structural;
use crate::wal::{LogRecord, Lsn, RecordBody, TxnId, ValueOp, Wal};

/// What a write appended to the WAL and how to roll it back.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub op: ValueOp,
}

pub struct BTree {
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    alloc: Arc<Allocator>,
    versions: Arc<VersionStore>,
    pub(crate) structural: Arc<Mutex<()>>,
    page_size: usize,
}

impl BTree {
    pub fn new(
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        alloc: Arc<Allocator>,
        versions: Arc<VersionStore>,
        structural: Arc<Mutex<()>>,
    ) -> Self {
        let page_size = pool.page_size();
        Self {
            pool,
            wal,
            alloc,
            versions,
            structural,
            page_size,
        }
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub(crate) fn alloc(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    fn is_leaf(data: &[u8]) -> Result<bool> {
        match PageHeader::from_bytes(data)?.page_type() {
            PageType::BTreeLeaf => Ok(true),
            PageType::BTreeInterior => Ok(false),
            other => bail!("unexpected page type {:?} on B+Tree descent", other),
        }
    }

    /// Read descent to the leaf covering `key`, latch-coupled from page 0.
    fn descend_read(&self, key: &[u8]) -> Result<OwnedPageReadGuard> {
        let meta = self.pool.fetch(0)?.into_read();
        let root = FileHeader::from_bytes(&meta)?.root_page();
        let mut guard = self.pool.fetch(root)?.into_read();
        drop(meta);

        loop {
            if Self::is_leaf(&guard)? {
                return Ok(guard);
            }
            let (child, _) = node::find_child(&guard, key);
            let child_guard = self.pool.fetch(child)?.into_read();
            guard = child_guard;
        }
    }

    /// Descent that ends with a write latch on the leaf and nothing else.
    fn descend_write(&self, key: &[u8]) -> Result<OwnedPageWriteGuard> {
        let meta = self.pool.fetch(0)?.into_read();
        let root = FileHeader::from_bytes(&meta)?.root_page();

        let root_pin = self.pool.fetch(root)?;
        let root_is_leaf = Self::is_leaf(&root_pin.read())?;
        if root_is_leaf {
            let guard = root_pin.into_write();
            drop(meta);
            return Ok(guard);
        }
        let mut guard = root_pin.into_read();
        drop(meta);

        loop {
            let (child, _) = node::find_child(&guard, key);
            let pin = self.pool.fetch(child)?;
            let child_is_leaf = Self::is_leaf(&pin.read())?;
            if child_is_leaf {
                // Parent read latch is still held while the leaf write
                // latch is acquired, then released on return.
                return Ok(pin.into_write());
            }
            guard = pin.into_read();
        }
    }

    // ---- Reads -----------------------------------------------------------

    /// The newest version of `key` visible to `snap`, fully materialized.
    pub fn get(&self, snap: &Snapshot, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let body = {
            let leaf = self.descend_read(key)?;
            match node::find_key(&leaf, key) {
                Ok(idx) => node::body_at(&leaf, idx).to_vec(),
                Err(_) => return Ok(None),
            }
        };
        self.resolve_visible(snap, &body)
    }

    /// Walks a version chain (newest first) to the version `snap` sees.
    fn resolve_visible(&self, snap: &Snapshot, newest_body: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut header = VersionHeader::from_bytes(newest_body);
        let mut payload = newest_body[VersionHeader::SIZE..].to_vec();

        loop {
            if header.visible_to(snap) {
                return Ok(Some(self.load_payload(&header, &payload)?));
            }
            if snap.sees(header.created_by) {
                // Created by something visible but deleted by something
                // visible: the key is deleted for this snapshot, and all
                // chain versions are older than what we can already see.
                return Ok(None);
            }
            if !header.has_prev() {
                return Ok(None);
            }
            let (vpage, voffset) = VersionHeader::decode_ptr(header.prev);
            let (h, p) = self.versions.read(vpage, voffset)?;
            header = h;
            payload = p;
        }
    }

    fn load_payload(&self, header: &VersionHeader, payload: &[u8]) -> Result<Vec<u8>> {
        if header.is_overflow() {
            let (head, total_len) = overflow::decode_ref(payload)?;
            overflow::read_chain(&self.pool, head, total_len)
        } else {
            Ok(payload.to_vec())
        }
    }

    // ---- Writes ----------------------------------------------------------

    /// Builds the payload for a new version, spilling large values to an
    /// overflow chain. Returns the payload bytes and the overflow flag.
    fn build_payload(&self, key: &[u8], value: &[u8]) -> Result<(Vec<u8>, bool)> {
        let inline_limit = max_inline_cell(self.page_size);
        let inline_cell = key.len() + VersionHeader::SIZE + value.len();

        if inline_cell <= inline_limit {
            Ok((value.to_vec(), false))
        } else {
            let head = overflow::write_chain(
                &self.pool,
                &self.alloc,
                &self.wal,
                &self.structural,
                value,
            )?;
            Ok((
                overflow::encode_ref(head, value.len() as u32).to_vec(),
                true,
            ))
        }
    }

    fn assemble_body(header: &VersionHeader, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; VersionHeader::SIZE + payload.len()];
        header.write_to(&mut body);
        body[VersionHeader::SIZE..].copy_from_slice(payload);
        body
    }

    /// Inserts or updates `key` for the writing transaction. The engine
    /// holds the key's write lock across this call.
    pub fn put(
        &self,
        snap: &Snapshot,
        tm: &TransactionManager,
        prev_lsn: Lsn,
        key: &[u8],
        value: &[u8],
    ) -> Result<UndoEntry> {
        ensure!(!key.is_empty(), "keys must be non-empty");
        ensure!(
            key.len() <= MAX_KEY_LEN,
            "key of {} bytes exceeds the {} byte maximum",
            key.len(),
            MAX_KEY_LEN
        );

        // Phase 1: find what is there and check for conflicts.
        let old_body: Option<Vec<u8>> = {
            let leaf = self.descend_read(key)?;
            match node::find_key(&leaf, key) {
                Ok(idx) => {
                    let body = node::body_at(&leaf, idx);
                    let header = VersionHeader::from_bytes(body);
                    if let Some(err) = header.write_conflict(snap, |t| tm.is_active(t)) {
                        return Err(err.into());
                    }
                    Some(body.to_vec())
                }
                Err(_) => None,
            }
        };

        match old_body {
            Some(old) => self.put_update(snap, tm, prev_lsn, key, value, old),
            None => self.put_insert(snap, tm, prev_lsn, key, value),
        }
    }

    fn put_insert(
        &self,
        snap: &Snapshot,
        tm: &TransactionManager,
        prev_lsn: Lsn,
        key: &[u8],
        value: &[u8],
    ) -> Result<UndoEntry> {
        let txn_id = snap.txn_id();
        let (payload, is_overflow) = self.build_payload(key, value)?;
        let mut header = VersionHeader::new(txn_id);
        header.set_overflow(is_overflow);
        let new_body = Self::assemble_body(&header, &payload);

        for _attempt in 0..8 {
            let mut leaf = self.descend_write(key)?;
            match node::find_key(&leaf, key) {
                Ok(_) => {
                    // A cell appeared despite the key lock; the only
                    // writer that can race us here is ourselves through a
                    // retry, so restart through the full path.
                    drop(leaf);
                    return self.put(snap, tm, prev_lsn, key, value);
                }
                Err(idx) => {
                    if !node::has_room(&leaf, key.len(), new_body.len()) {
                        drop(leaf);
                        self.make_room(key, key.len(), new_body.len())?;
                        continue;
                    }
                    let page = leaf.page_no();
                    let record = LogRecord::new(
                        txn_id,
                        prev_lsn,
                        RecordBody::Value(ValueOp::Insert {
                            page,
                            key: key.to_vec(),
                            cell: new_body.clone(),
                        }),
                    );
                    let lsn = self.wal.append(record)?;
                    node::insert_cell(&mut leaf, idx, key, &new_body)?;
                    set_page_lsn(&mut leaf, lsn);
                    tm.note_lsn(txn_id, lsn);
                    return Ok(UndoEntry {
                        lsn,
                        prev_lsn,
                        op: ValueOp::UndoInsert {
                            page,
                            key: key.to_vec(),
                        },
                    });
                }
            }
        }
        bail!("insert of key could not find room after repeated splits")
    }

    fn put_update(
        &self,
        snap: &Snapshot,
        tm: &TransactionManager,
        prev_lsn: Lsn,
        key: &[u8],
        value: &[u8],
        mut old_body: Vec<u8>,
    ) -> Result<UndoEntry> {
        let txn_id = snap.txn_id();
        // The overflow chain (if any) is built once; only the version
        // header changes across reservation retries.
        let (payload, is_overflow) = self.build_payload(key, value)?;

        'reserve: loop {
            // Phase 2: reserve chain space with no latches held.
            let (vpage, voffset) = self.versions.reserve(old_body.len())?;
            let mut header = VersionHeader::new(txn_id);
            header.set_overflow(is_overflow);
            header.prev = VersionHeader::encode_ptr(vpage, voffset);
            let new_body = Self::assemble_body(&header, &payload);

            // Phase 3: write descent, re-validate, apply.
            for _attempt in 0..8 {
                let mut leaf = self.descend_write(key)?;
                let idx = match node::find_key(&leaf, key) {
                    Ok(idx) => idx,
                    Err(_) => {
                        // The sweep purged a dead cell under us; insert
                        // fresh (the reservation leaks a harmless hole).
                        drop(leaf);
                        return self.put_insert(snap, tm, prev_lsn, key, value);
                    }
                };

                let current = node::body_at(&leaf, idx);
                let cur_header = VersionHeader::from_bytes(current);
                if let Some(err) = cur_header.write_conflict(snap, |t| tm.is_active(t)) {
                    return Err(err.into());
                }
                if current.len() > old_body.len() {
                    // Our own earlier retry grew the cell; re-reserve.
                    old_body = current.to_vec();
                    drop(leaf);
                    continue 'reserve;
                }
                if current != old_body.as_slice() {
                    old_body = current.to_vec();
                }

                if !node::room_for_replace(&leaf, idx, new_body.len()) {
                    drop(leaf);
                    self.make_room(key, key.len(), new_body.len())?;
                    continue;
                }

                let page = leaf.page_no();
                let vpin = self.pool.fetch(vpage)?;
                let mut vguard = vpin.write();

                let record = LogRecord::new(
                    txn_id,
                    prev_lsn,
                    RecordBody::Value(ValueOp::Update {
                        page,
                        vpage,
                        voffset,
                        key: key.to_vec(),
                        old_cell: old_body.clone(),
                        new_cell: new_body.clone(),
                    }),
                );
                let lsn = self.wal.append(record)?;

                version_store::write_entry(&mut vguard, voffset, &old_body);
                set_page_lsn(&mut vguard, lsn);
                node::replace_cell(&mut leaf, idx, key, &new_body)?;
                set_page_lsn(&mut leaf, lsn);
                tm.note_lsn(txn_id, lsn);

                return Ok(UndoEntry {
                    lsn,
                    prev_lsn,
                    op: ValueOp::UndoUpdate {
                        page,
                        key: key.to_vec(),
                        old_cell: old_body,
                        vpage,
                        voffset,
                    },
                });
            }
            bail!("update of key could not find room after repeated splits")
        }
    }

    /// Stamps `deleted_by` on the newest version. Returns `None` when no
    /// visible version exists to delete.
    pub fn delete(
        &self,
        snap: &Snapshot,
        tm: &TransactionManager,
        prev_lsn: Lsn,
        key: &[u8],
    ) -> Result<Option<UndoEntry>> {
        let txn_id = snap.txn_id();
        let mut leaf = self.descend_write(key)?;
        let idx = match node::find_key(&leaf, key) {
            Ok(idx) => idx,
            Err(_) => return Ok(None),
        };

        let body = node::body_at(&leaf, idx);
        let header = VersionHeader::from_bytes(body);
        if let Some(err) = header.write_conflict(snap, |t| tm.is_active(t)) {
            return Err(err.into());
        }
        if !header.visible_to(snap) {
            // Nothing this snapshot could see; already deleted or only
            // older versions remain.
            return Ok(None);
        }

        let page = leaf.page_no();
        let record = LogRecord::new(
            txn_id,
            prev_lsn,
            RecordBody::Value(ValueOp::Delete {
                page,
                key: key.to_vec(),
                deleted_by: txn_id,
            }),
        );
        let lsn = self.wal.append(record)?;

        let body = node::body_at_mut(&mut leaf, idx);
        let mut header = VersionHeader::from_bytes(body);
        header.deleted_by = txn_id;
        header.write_to(body);
        set_page_lsn(&mut leaf, lsn);
        tm.note_lsn(txn_id, lsn);

        Ok(Some(UndoEntry {
            lsn,
            prev_lsn,
            op: ValueOp::UndoDelete {
                page,
                key: key.to_vec(),
            },
        }))
    }

    // ---- Undo ------------------------------------------------------------

    /// Applies a compensating change for one value op, emitting a Clr
    /// record. Used by runtime rollback and by recovery's undo pass; the
    /// op's page field is a hint only — the key is re-located through the
    /// tree.
    pub fn apply_undo(&self, txn_id: TxnId, op: &ValueOp, undo_next: Lsn) -> Result<Lsn> {
        match op {
            ValueOp::UndoInsert { key, .. } => {
                let freed_overflow;
                let lsn;
                {
                    let mut leaf = self.descend_write(key)?;
                    let page = leaf.page_no();
                    lsn = self.wal.append(LogRecord::new(
                        txn_id,
                        undo_next,
                        RecordBody::Clr {
                            undo_next,
                            op: ValueOp::UndoInsert {
                                page,
                                key: key.clone(),
                            },
                        },
                    ))?;
                    freed_overflow = match node::find_key(&leaf, key) {
                        Ok(idx) => {
                            let body = node::body_at(&leaf, idx);
                            let header = VersionHeader::from_bytes(body);
                            let head = if header.is_overflow() {
                                Some(overflow::decode_ref(&body[VersionHeader::SIZE..])?.0)
                            } else {
                                None
                            };
                            node::remove_cell(&mut leaf, idx)?;
                            set_page_lsn(&mut leaf, lsn);
                            head
                        }
                        Err(_) => None,
                    };
                }
                if let Some(head) = freed_overflow {
                    overflow::free_chain(&self.pool, &self.alloc, &self.wal, &self.structural, head)?;
                }
                Ok(lsn)
            }

            ValueOp::UndoUpdate {
                key,
                old_cell,
                vpage,
                voffset,
                ..
            } => {
                for _attempt in 0..8 {
                    let mut leaf = self.descend_write(key)?;
                    let idx = match node::find_key(&leaf, key) {
                        Ok(idx) => idx,
                        Err(_) => {
                            // The cell is gone; log progress and stop.
                            return self.wal.append(LogRecord::new(
                                txn_id,
                                undo_next,
                                RecordBody::Clr {
                                    undo_next,
                                    op: op.clone(),
                                },
                            ));
                        }
                    };
                    if !node::room_for_replace(&leaf, idx, old_cell.len()) {
                        drop(leaf);
                        self.make_room(key, key.len(), old_cell.len())?;
                        continue;
                    }

                    let page = leaf.page_no();
                    let discarded = {
                        let body = node::body_at(&leaf, idx);
                        let header = VersionHeader::from_bytes(body);
                        if header.is_overflow() {
                            Some(overflow::decode_ref(&body[VersionHeader::SIZE..])?.0)
                        } else {
                            None
                        }
                    };

                    let vpin = self.pool.fetch(*vpage)?;
                    let mut vguard = vpin.write();
                    let lsn = self.wal.append(LogRecord::new(
                        txn_id,
                        undo_next,
                        RecordBody::Clr {
                            undo_next,
                            op: ValueOp::UndoUpdate {
                                page,
                                key: key.clone(),
                                old_cell: old_cell.clone(),
                                vpage: *vpage,
                                voffset: *voffset,
                            },
                        },
                    ))?;

                    node::replace_cell(&mut leaf, idx, key, old_cell)?;
                    set_page_lsn(&mut leaf, lsn);
                    version_store::dec_live(&mut vguard);
                    set_page_lsn(&mut vguard, lsn);
                    drop(vguard);
                    drop(leaf);

                    if let Some(head) = discarded {
                        overflow::free_chain(
                            &self.pool,
                            &self.alloc,
                            &self.wal,
                            &self.structural,
                            head,
                        )?;
                    }
                    return Ok(lsn);
                }
                bail!("undo of update could not find room after repeated splits")
            }

            ValueOp::UndoDelete { key, .. } => {
                let mut leaf = self.descend_write(key)?;
                let page = leaf.page_no();
                let lsn = self.wal.append(LogRecord::new(
                    txn_id,
                    undo_next,
                    RecordBody::Clr {
                        undo_next,
                        op: ValueOp::UndoDelete {
                            page,
                            key: key.clone(),
                        },
                    },
                ))?;
                if let Ok(idx) = node::find_key(&leaf, key) {
                    let body = node::body_at_mut(&mut leaf, idx);
                    let mut header = VersionHeader::from_bytes(body);
                    header.deleted_by = 0;
                    header.write_to(body);
                    set_page_lsn(&mut leaf, lsn);
                }
                Ok(lsn)
            }

            other => bail!("not an undo op: {:?}", other),
        }
    }

    // ---- Structural maintenance ------------------------------------------

    /// Splits whatever stands between `key` and a cell of the given shape
    /// fitting its leaf. Serialized on the structural mutex; retains write
    /// latches on the whole descent path and splits full interior nodes
    /// preemptively on the way down.
    pub(crate) fn make_room(&self, key: &[u8], need_key: usize, need_body: usize) -> Result<()> {
        let _structural = self.structural.lock();

        // Structural latch protocol: the page-0 write latch comes first
        // (matching the descent order), then the path top-down.
        let meta_pin = self.pool.fetch(0)?;
        let mut meta = meta_pin.write();
        let root = FileHeader::from_bytes(&meta)?.root_page();

        // (guard, slot the parent used to reach it; None for the root or
        // a right_child edge)
        let mut path: Vec<(OwnedPageWriteGuard, Option<usize>)> = Vec::new();
        path.push((self.pool.fetch(root)?.into_write(), None));

        loop {
            let last = path.len() - 1;
            if Self::is_leaf(&path[last].0)? {
                break;
            }
            if !node::has_room(&path[last].0, MAX_KEY_LEN, 4) {
                self.split_in_path(&mut meta, &mut path, last, key)?;
            }
            let last = path.len() - 1;
            let (child, slot) = node::find_child(&path[last].0, key);
            let guard = self.pool.fetch(child)?.into_write();
            path.push((guard, slot));
        }

        let last = path.len() - 1;
        if !node::has_room(&path[last].0, need_key, need_body) {
            self.split_in_path(&mut meta, &mut path, last, key)?;
        }
        Ok(())
    }

    /// Splits the node at `path[at]`, creating a new root first if the
    /// node is the root. After the split, `path[at]` is the half that
    /// covers `descent_key`. `meta` is the latched page 0.
    fn split_in_path(
        &self,
        meta: &mut [u8],
        path: &mut Vec<(OwnedPageWriteGuard, Option<usize>)>,
        at: usize,
        descent_key: &[u8],
    ) -> Result<()> {
        let mut at = at;
        if at == 0 {
            self.grow_root(meta, path)?;
            at = 1;
        }

        let mut touched = TouchedPages::new();
        let new_page = self.alloc.allocate(meta, &mut touched)?;
        let mut new_guard = self.pool.fetch(new_page)?.into_write();

        let (left_slice, right_slice) = path.split_at_mut(at);
        let (parent, _) = left_slice.last_mut().expect("parent on path");
        let (node_guard, node_slot) = &mut right_slice[0];
        let node_page = node_guard.page_no();
        let leaf = Self::is_leaf(node_guard)?;

        let count = node::cell_count(node_guard);
        ensure!(count >= 2, "cannot split a node with {} cells", count);
        let mid = count / 2;

        let sep: Vec<u8>;
        if leaf {
            let mut header = PageHeader::new(PageType::BTreeLeaf, self.page_size);
            header.set_next_leaf(PageHeader::from_bytes(node_guard)?.next_leaf());
            header.write_to(&mut new_guard)?;

            sep = node::key_at(node_guard, mid).to_vec();
            for (i, idx) in (mid..count).enumerate() {
                let key = node::key_at(node_guard, idx).to_vec();
                let body = node::body_at(node_guard, idx).to_vec();
                node::insert_cell(&mut new_guard, i, &key, &body)?;
            }
            for _ in mid..count {
                node::remove_cell(node_guard, mid)?;
            }
            PageHeader::from_bytes_mut(node_guard)?.set_next_leaf(new_page);
        } else {
            // Promote the middle key; the left half keeps [0, mid), the
            // right half takes (mid, count).
            let mut header = PageHeader::new(PageType::BTreeInterior, self.page_size);
            header.set_right_child(PageHeader::from_bytes(node_guard)?.right_child());
            header.write_to(&mut new_guard)?;

            sep = node::key_at(node_guard, mid).to_vec();
            for (i, idx) in (mid + 1..count).enumerate() {
                let key = node::key_at(node_guard, idx).to_vec();
                let body = node::body_at(node_guard, idx).to_vec();
                node::insert_cell(&mut new_guard, i, &key, &body)?;
            }
            let mid_child = node::child_at(node_guard, mid);
            for _ in mid..count {
                node::remove_cell(node_guard, mid)?;
            }
            PageHeader::from_bytes_mut(node_guard)?.set_right_child(mid_child);
        }

        node::install_separator(parent, &sep, node_page, new_page, *node_slot)?;

        // One record for the whole split: page 0, node, sibling, parent,
        // plus any free-list trunk the allocation touched.
        {
            let mut extra: Vec<OwnedPageWriteGuard> = Vec::new();
            for t in touched.iter() {
                if t != 0 && t != new_page && t != node_page && t != parent.page_no() {
                    extra.push(self.pool.fetch(t)?.into_write());
                }
            }
            let parent_no = parent.page_no();
            let mut pages: Vec<(u32, &mut [u8])> = vec![
                (0, &mut *meta),
                (node_page, &mut node_guard[..]),
                (new_page, &mut new_guard[..]),
                (parent_no, &mut parent[..]),
            ];
            for guard in extra.iter_mut() {
                let no = guard.page_no();
                pages.push((no, &mut guard[..]));
            }
            log_structural(&self.wal, &mut pages)?;
        }

        // Route the path through the half that covers the descent key.
        if descent_key >= sep.as_slice() {
            let new_slot = node_slot.map(|i| i + 1);
            path[at] = (new_guard, new_slot);
        }
        Ok(())
    }

    /// Installs a fresh empty root above the current one. `meta` is the
    /// latched page 0.
    fn grow_root(
        &self,
        meta: &mut [u8],
        path: &mut Vec<(OwnedPageWriteGuard, Option<usize>)>,
    ) -> Result<()> {
        let mut touched = TouchedPages::new();
        let new_root = self.alloc.allocate(meta, &mut touched)?;
        let mut root_guard = self.pool.fetch(new_root)?.into_write();

        let old_root = path[0].0.page_no();
        let mut header = PageHeader::new(PageType::BTreeInterior, self.page_size);
        header.set_right_child(old_root);
        header.write_to(&mut root_guard)?;

        FileHeader::from_bytes_mut(meta)?.set_root_page(new_root);

        {
            let mut extra: Vec<OwnedPageWriteGuard> = Vec::new();
            for t in touched.iter() {
                if t != 0 && t != new_root {
                    extra.push(self.pool.fetch(t)?.into_write());
                }
            }
            let mut pages: Vec<(u32, &mut [u8])> =
                vec![(0, &mut *meta), (new_root, &mut root_guard[..])];
            for guard in extra.iter_mut() {
                let no = guard.page_no();
                pages.push((no, &mut guard[..]));
            }
            log_structural(&self.wal, &mut pages)?;
        }

        path.insert(0, (root_guard, None));
        Ok(())
    }

    // ---- Cursors ---------------------------------------------------------

    /// A lazy ordered scan of `[low, high]` under `snap`.
    pub fn cursor(&self, snap: Snapshot, low: Vec<u8>, high: Vec<u8>) -> Result<Cursor<'_>> {
        let (leaf_page, next_slot, leaf_lsn) = {
            let leaf = self.descend_read(&low)?;
            let slot = match node::find_key(&leaf, &low) {
                Ok(idx) => idx,
                Err(idx) => idx,
            };
            let lsn = PageHeader::from_bytes(&leaf)?.page_lsn();
            (leaf.page_no(), slot, lsn)
        };

        Ok(Cursor {
            tree: self,
            snap,
            high,
            leaf_page,
            next_slot,
            leaf_lsn: Some(leaf_lsn),
            resume_key: low,
            resume_exclusive: false,
            exhausted: false,
        })
    }

    // ---- Integrity -------------------------------------------------------

    /// Checks the structural invariants: equal leaf depth, strictly
    /// ascending keys in traversal order, intact leaf links. Returns the
    /// number of keys (live cells, visibility ignored).
    pub fn check_integrity(&self) -> Result<usize> {
        let root = {
            let meta = self.pool.fetch(0)?.into_read();
            FileHeader::from_bytes(&meta)?.root_page()
        };

        let mut leftmost_leaf = None;
        let mut depths: SmallVec<[usize; 8]> = SmallVec::new();
        self.check_subtree(root, 0, &mut depths, &mut leftmost_leaf, None, None)?;
        let first_depth = depths.first().copied().unwrap_or(0);
        ensure!(
            depths.iter().all(|&d| d == first_depth),
            "leaves at unequal depths: {:?}",
            depths
        );

        // In-order traversal along the leaf chain.
        let mut count = 0usize;
        let mut last_key: Option<Vec<u8>> = None;
        let mut page_no = leftmost_leaf.unwrap_or(root);
        while page_no != 0 {
            let pin = self.pool.fetch(page_no)?;
            let page = pin.read();
            ensure!(
                PageHeader::from_bytes(&page)?.page_type() == PageType::BTreeLeaf,
                "leaf chain reached non-leaf page {}",
                page_no
            );
            for idx in 0..node::cell_count(&page) {
                let key = node::key_at(&page, idx).to_vec();
                if let Some(prev) = &last_key {
                    ensure!(
                        *prev < key,
                        "keys out of order across traversal at page {}",
                        page_no
                    );
                }
                last_key = Some(key);
                count += 1;
            }
            page_no = PageHeader::from_bytes(&page)?.next_leaf();
        }
        Ok(count)
    }

    fn check_subtree(
        &self,
        page_no: u32,
        depth: usize,
        depths: &mut SmallVec<[usize; 8]>,
        leftmost_leaf: &mut Option<u32>,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<()> {
        let pin = self.pool.fetch(page_no)?;
        let page = pin.read();
        let header = PageHeader::from_bytes(&page)?;

        match header.page_type() {
            PageType::BTreeLeaf => {
                if leftmost_leaf.is_none() {
                    *leftmost_leaf = Some(page_no);
                }
                depths.push(depth);
                for idx in 0..node::cell_count(&page) {
                    let key = node::key_at(&page, idx);
                    if let Some(low) = low {
                        ensure!(key >= low, "leaf {} holds a key below its bound", page_no);
                    }
                    if let Some(high) = high {
                        ensure!(key < high, "leaf {} holds a key above its bound", page_no);
                    }
                }
                Ok(())
            }
            PageType::BTreeInterior => {
                let count = node::cell_count(&page);
                ensure!(count > 0 || header.right_child() != 0, "empty interior node");
                let mut child_low = low.map(|l| l.to_vec());
                for idx in 0..count {
                    let key = node::key_at(&page, idx).to_vec();
                    let child = node::child_at(&page, idx);
                    self.check_subtree(
                        child,
                        depth + 1,
                        depths,
                        leftmost_leaf,
                        child_low.as_deref(),
                        Some(&key),
                    )?;
                    child_low = Some(key);
                }
                self.check_subtree(
                    header.right_child(),
                    depth + 1,
                    depths,
                    leftmost_leaf,
                    child_low.as_deref(),
                    high,
                )?;
                Ok(())
            }
            other => bail!("page {} has type {:?} inside the tree", page_no, other),
        }
    }
}

/// Lazy range scan. Structural changes that move the cursor's position
/// surface as [`EngineError::StaleCursor`]; value-level changes (new
/// versions, delete stamps) do not invalidate it.
pub struct Cursor<'a> {
    tree: &'a BTree,
    snap: Snapshot,
    high: Vec<u8>,
    leaf_page: u32,
    next_slot: usize,
    /// Page LSN observed when `next_slot` was computed; `None` right
    /// after moving to a new leaf.
    leaf_lsn: Option<u64>,
    resume_key: Vec<u8>,
    resume_exclusive: bool,
    exhausted: bool,
}

impl Cursor<'_> {
    /// The next visible `(key, value)` at or below the high bound.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if self.exhausted {
                return Ok(None);
            }
            if self.leaf_page == 0 {
                self.exhausted = true;
                return Ok(None);
            }

            enum Step {
                Yield { key: Vec<u8>, body: Vec<u8> },
                NextLeaf(u32),
            }

            let step = {
                let pin = self.tree.pool.fetch(self.leaf_page)?;
                let page = pin.read();
                let header = PageHeader::from_bytes(&page)?;
                if header.page_type() != PageType::BTreeLeaf {
                    return Err(EngineError::StaleCursor.into());
                }

                let lsn = header.page_lsn();
                match self.leaf_lsn {
                    Some(seen) if seen != lsn => {
                        // The leaf changed since we computed next_slot;
                        // re-locate, treating a vanished resume key as a
                        // structural invalidation.
                        match node::find_key(&page, &self.resume_key) {
                            Ok(idx) => {
                                self.next_slot =
                                    if self.resume_exclusive { idx + 1 } else { idx };
                            }
                            Err(idx) => {
                                if self.resume_exclusive {
                                    return Err(EngineError::StaleCursor.into());
                                }
                                self.next_slot = idx;
                            }
                        }
                    }
                    _ => {}
                }
                self.leaf_lsn = Some(lsn);

                let count = node::cell_count(&page);
                let mut found = None;
                while self.next_slot < count {
                    let idx = self.next_slot;
                    self.next_slot += 1;
                    let key = node::key_at(&page, idx);
                    if key > self.high.as_slice() {
                        self.exhausted = true;
                        return Ok(None);
                    }
                    found = Some(Step::Yield {
                        key: key.to_vec(),
                        body: node::body_at(&page, idx).to_vec(),
                    });
                    break;
                }
                match found {
                    Some(step) => step,
                    None => Step::NextLeaf(header.next_leaf()),
                }
            };

            match step {
                Step::Yield { key, body, .. } => {
                    self.resume_key = key.clone();
                    self.resume_exclusive = true;
                    if let Some(value) = self.tree.resolve_visible(&self.snap, &body)? {
                        return Ok(Some((key, value)));
                    }
                    // Invisible to this snapshot; keep scanning.
                }
                Step::NextLeaf(next) => {
                    self.leaf_page = next;
                    self.next_slot = 0;
                    self.leaf_lsn = None;
                }
            }
        }
    }
}
