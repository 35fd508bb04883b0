//! # Maintenance Sweep
//!
//! Version garbage collection and underflow repair, run by the background
//! maintenance thread or an explicit `vacuum()`.
//!
//! ## What Gets Collected
//!
//! - **Chain suffixes**: a chain needs history only back to the first
//!   version visible to every active snapshot (`created_by` below the
//!   watermark). Everything older is unreachable and is unlinked, its
//!   Version-page live count decremented, its overflow chains freed.
//! - **Dead cells**: a newest version whose `deleted_by` is below the
//!   watermark is a tombstone every snapshot agrees on; the whole cell
//!   and its chain are removed.
//! - **Empty Version pages**: pages whose live count reaches zero are
//!   unlinked from the Version-page chain and returned to the free list
//!   (the current append target is always kept).
//! - **Underfull leaves**: leaves below the occupancy threshold borrow
//!   from their right sibling, or absorb it entirely when the combined
//!   cells fit; emptied interior nodes collapse upward. Borrowing is
//!   preferred to merging to avoid cascading merges.
//!
//! ## Locking
//!
//! Each leaf is processed in its own structural critical section, so the
//! sweep never starves writers that need a split. Overflow chains
//! collected during a leaf pass are freed between sections. The engine
//! runs at most one sweep at a time.

use eyre::Result;
use hashbrown::HashMap;

use super::node;
use super::overflow;
use super::tree::BTree;
use crate::buffer::OwnedPageWriteGuard;
use crate::config::underflow_threshold;
use crate::mvcc::version_store;
use crate::mvcc::{TxnId, VersionHeader};
use crate::storage::page::{PageHeader, PageType};
use crate::storage::{FileHeader, TouchedPages};
use crate::wal::structural::log_structural;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Chain versions unlinked.
    pub versions_pruned: usize,
    /// Dead cells removed from leaves.
    pub cells_purged: usize,
    /// Version pages returned to the free list.
    pub version_pages_freed: usize,
    /// Leaves merged into their left neighbor.
    pub leaves_merged: usize,
    /// Cells moved by borrowing.
    pub cells_borrowed: usize,
}

impl BTree {
    /// One full garbage-collection and rebalance pass. `watermark` is the
    /// oldest active transaction ID; versions below it are visible to
    /// every current and future snapshot.
    pub fn sweep(&self, watermark: TxnId) -> Result<SweepStats> {
        let mut stats = SweepStats::default();

        let mut leaf_no = self.leftmost_leaf()?;
        let mut route_keys: Vec<Vec<u8>> = Vec::new();
        while leaf_no != 0 {
            let outcome = {
                let _structural = self.structural.lock();
                self.sweep_leaf(leaf_no, watermark, &mut stats)?
            };
            for head in outcome.freed_overflow {
                overflow::free_chain(
                    self.pool(),
                    self.alloc(),
                    self.wal(),
                    &self.structural,
                    head,
                )?;
            }
            if let Some(key) = outcome.underfull_route {
                route_keys.push(key);
            }
            leaf_no = outcome.next_leaf;
        }

        self.free_empty_version_pages(&mut stats)?;

        for key in route_keys {
            self.rebalance_leaf(&key, &mut stats)?;
        }

        Ok(stats)
    }

    fn leftmost_leaf(&self) -> Result<u32> {
        let meta = self.pool().fetch(0)?.into_read();
        let root = FileHeader::from_bytes(&meta)?.root_page();
        let mut guard = self.pool().fetch(root)?.into_read();
        drop(meta);
        loop {
            let header = PageHeader::from_bytes(&guard)?;
            match header.page_type() {
                PageType::BTreeLeaf => return Ok(guard.page_no()),
                PageType::BTreeInterior => {
                    let child = if node::cell_count(&guard) > 0 {
                        node::child_at(&guard, 0)
                    } else {
                        header.right_child()
                    };
                    let next = self.pool().fetch(child)?.into_read();
                    guard = next;
                }
                other => eyre::bail!("unexpected page type {:?} walking to leftmost leaf", other),
            }
        }
    }

    fn sweep_leaf(
        &self,
        leaf_no: u32,
        watermark: TxnId,
        stats: &mut SweepStats,
    ) -> Result<LeafSweepOutcome> {
        let pin = self.pool().fetch(leaf_no)?;
        let mut leaf = pin.write();
        let header = PageHeader::from_bytes(&leaf)?;
        let next_leaf = header.next_leaf();
        if header.page_type() != PageType::BTreeLeaf {
            return Ok(LeafSweepOutcome {
                next_leaf: 0,
                freed_overflow: Vec::new(),
                underfull_route: None,
            });
        }

        let route_key = if node::cell_count(&leaf) > 0 {
            Some(node::key_at(&leaf, 0).to_vec())
        } else {
            None
        };

        let mut vguards: HashMap<u32, OwnedPageWriteGuard> = HashMap::new();
        let mut freed_overflow: Vec<u32> = Vec::new();
        let mut leaf_changed = false;

        for idx in (0..node::cell_count(&leaf)).rev() {
            let body = node::body_at(&leaf, idx).to_vec();
            let newest = VersionHeader::from_bytes(&body);

            let dead = newest.deleted_by != 0
                && newest.deleted_by < watermark
                && newest.created_by < watermark;

            if dead {
                if newest.is_overflow() {
                    freed_overflow
                        .push(overflow::decode_ref(&body[VersionHeader::SIZE..])?.0);
                }
                self.prune_chain_from(
                    newest.prev,
                    &mut vguards,
                    &mut freed_overflow,
                    stats,
                )?;
                node::remove_cell(&mut leaf, idx)?;
                leaf_changed = true;
                stats.cells_purged += 1;
                continue;
            }

            if newest.created_by < watermark {
                // The leaf version anchors the chain; everything below is
                // unreachable.
                if newest.has_prev() {
                    self.prune_chain_from(
                        newest.prev,
                        &mut vguards,
                        &mut freed_overflow,
                        stats,
                    )?;
                    let body_mut = node::body_at_mut(&mut leaf, idx);
                    let mut h = VersionHeader::from_bytes(body_mut);
                    h.prev = 0;
                    h.write_to(body_mut);
                    leaf_changed = true;
                }
                continue;
            }

            // Walk the chain to the first universally visible version and
            // cut below it.
            let mut ptr = newest.prev;
            while ptr != 0 {
                let (vpage, voffset) = VersionHeader::decode_ptr(ptr);
                let guard = match vguards.entry(vpage) {
                    hashbrown::hash_map::Entry::Occupied(e) => e.into_mut(),
                    hashbrown::hash_map::Entry::Vacant(e) => {
                        e.insert(self.pool().fetch(vpage)?.into_write())
                    }
                };
                let body = version_store::entry_body(guard, voffset)?;
                let mut h = VersionHeader::from_bytes(body);
                if h.created_by < watermark {
                    if h.has_prev() {
                        let below = h.prev;
                        h.prev = 0;
                        let off = voffset as usize + 2;
                        h.write_to(&mut guard[off..off + VersionHeader::SIZE]);
                        self.prune_chain_from(below, &mut vguards, &mut freed_overflow, stats)?;
                    }
                    break;
                }
                ptr = h.prev;
            }
        }

        // Capture one structural record for everything this leaf pass
        // touched, while all latches are still held.
        let touched_any = leaf_changed || !vguards.is_empty();
        if touched_any {
            let mut pages: Vec<(u32, &mut [u8])> = Vec::new();
            if leaf_changed {
                pages.push((leaf_no, &mut leaf[..]));
            }
            for (page_no, guard) in vguards.iter_mut() {
                pages.push((*page_no, &mut guard[..]));
            }
            log_structural(self.wal(), &mut pages)?;
        }

        let usable = underflow_threshold(self.pool().page_size());
        let underfull_route = if node::used_bytes(&leaf) < usable {
            route_key
        } else {
            None
        };

        Ok(LeafSweepOutcome {
            next_leaf,
            freed_overflow,
            underfull_route,
        })
    }

    /// Unlinks every chain entry reachable from `ptr`, decrementing live
    /// counts and collecting overflow heads.
    fn prune_chain_from(
        &self,
        mut ptr: u64,
        vguards: &mut HashMap<u32, OwnedPageWriteGuard>,
        freed_overflow: &mut Vec<u32>,
        stats: &mut SweepStats,
    ) -> Result<()> {
        while ptr != 0 {
            let (vpage, voffset) = VersionHeader::decode_ptr(ptr);
            let guard = match vguards.entry(vpage) {
                hashbrown::hash_map::Entry::Occupied(e) => e.into_mut(),
                hashbrown::hash_map::Entry::Vacant(e) => {
                    e.insert(self.pool().fetch(vpage)?.into_write())
                }
            };
            let body = version_store::entry_body(guard, voffset)?;
            let header = VersionHeader::from_bytes(body);
            if header.is_overflow() {
                freed_overflow.push(overflow::decode_ref(&body[VersionHeader::SIZE..])?.0);
            }
            version_store::dec_live(guard);
            stats.versions_pruned += 1;
            ptr = header.prev;
        }
        Ok(())
    }

    /// Returns zero-live Version pages (except the current append target)
    /// to the free list, unlinking them from the Version-page chain.
    /// Structural latch protocol: page 0 first.
    fn free_empty_version_pages(&self, stats: &mut SweepStats) -> Result<()> {
        let _structural = self.structural.lock();
        let meta_pin = self.pool().fetch(0)?;
        let mut meta = meta_pin.write();

        let head = FileHeader::from_bytes(&meta)?.version_page();
        if head == 0 {
            return Ok(());
        }

        // The head is the live append target; start behind it.
        let mut prev = head;
        let mut cur = {
            let pin = self.pool().fetch(head)?;
            let page = pin.read();
            PageHeader::from_bytes(&page)?.right_child()
        };

        while cur != 0 {
            let (next, live) = {
                let pin = self.pool().fetch(cur)?;
                let page = pin.read();
                let header = PageHeader::from_bytes(&page)?;
                (header.right_child(), header.cell_count())
            };

            if live > 0 {
                prev = cur;
                cur = next;
                continue;
            }

            // Unlink, then free; one structural record covers both.
            let prev_pin = self.pool().fetch(prev)?;
            let mut prev_guard = prev_pin.write();
            PageHeader::from_bytes_mut(&mut prev_guard)?.set_right_child(next);

            let mut touched = TouchedPages::new();
            self.alloc().free(&mut meta, cur, &mut touched)?;

            let mut guards: Vec<OwnedPageWriteGuard> = Vec::new();
            for t in touched.iter() {
                if t != 0 && t != prev {
                    guards.push(self.pool().fetch(t)?.into_write());
                }
            }
            let mut pages: Vec<(u32, &mut [u8])> =
                vec![(0, &mut meta[..]), (prev, &mut prev_guard[..])];
            for guard in guards.iter_mut() {
                let no = guard.page_no();
                pages.push((no, &mut guard[..]));
            }
            log_structural(self.wal(), &mut pages)?;

            stats.version_pages_freed += 1;
            cur = next;
        }
        Ok(())
    }

    /// Borrow-or-merge for one underfull leaf, located by a key that
    /// routed to it. Prefers borrowing; merges the right sibling in when
    /// everything fits; collapses emptied ancestors.
    fn rebalance_leaf(&self, route_key: &[u8], stats: &mut SweepStats) -> Result<()> {
        let _structural = self.structural.lock();

        // Structural latch protocol: page 0 first, then the path.
        let meta_pin = self.pool().fetch(0)?;
        let mut meta = meta_pin.write();
        let root = FileHeader::from_bytes(&meta)?.root_page();

        let mut path: Vec<(OwnedPageWriteGuard, Option<usize>)> = Vec::new();
        path.push((self.pool().fetch(root)?.into_write(), None));
        loop {
            let (last, _) = path.last().expect("path");
            if PageHeader::from_bytes(last)?.page_type() == PageType::BTreeLeaf {
                break;
            }
            let (child, slot) = node::find_child(last, route_key);
            let guard = self.pool().fetch(child)?.into_write();
            path.push((guard, slot));
        }

        if path.len() < 2 {
            // The root leaf cannot underflow by definition.
            return Ok(());
        }

        let page_size = self.pool().page_size();
        let threshold = underflow_threshold(page_size);
        let leaf_idx = path.len() - 1;
        let leaf_slot = path[leaf_idx].1;
        if node::used_bytes(&path[leaf_idx].0) >= threshold {
            return Ok(());
        }

        // The right sibling must share this parent.
        let slot = match leaf_slot {
            Some(slot) => slot,
            None => return Ok(()),
        };
        let (parent_view, _) = &path[leaf_idx - 1];
        let parent_count = node::cell_count(parent_view);
        let right_no = if slot + 1 < parent_count {
            node::child_at(parent_view, slot + 1)
        } else {
            PageHeader::from_bytes(parent_view)?.right_child()
        };
        let right_is_last = slot + 1 >= parent_count;

        let right_pin = self.pool().fetch(right_no)?;
        let mut right = right_pin.into_write();
        if PageHeader::from_bytes(&right)?.page_type() != PageType::BTreeLeaf {
            return Ok(());
        }

        let (front, back) = path.split_at_mut(leaf_idx);
        let (parent, _) = front.last_mut().expect("parent");
        let (leaf, _) = &mut back[0];
        let leaf_no = leaf.page_no();
        let parent_no = parent.page_no();

        let leaf_used = node::used_bytes(leaf);
        let right_used = node::used_bytes(&right);
        let capacity = page_size - crate::config::PAGE_HEADER_SIZE;

        if leaf_used + right_used <= capacity {
            // Merge the right sibling in.
            let count = node::cell_count(&right);
            let mut insert_at = node::cell_count(leaf);
            for idx in 0..count {
                let key = node::key_at(&right, idx).to_vec();
                let body = node::body_at(&right, idx).to_vec();
                node::insert_cell(leaf, insert_at, &key, &body)?;
                insert_at += 1;
            }
            let right_next = PageHeader::from_bytes(&right)?.next_leaf();
            PageHeader::from_bytes_mut(leaf)?.set_next_leaf(right_next);

            node::remove_cell(parent, slot)?;
            if right_is_last {
                PageHeader::from_bytes_mut(parent)?.set_right_child(leaf_no);
            } else {
                node::set_child_at(parent, slot, leaf_no);
            }

            drop(right);
            let mut touched = TouchedPages::new();
            self.alloc().free(&mut meta, right_no, &mut touched)?;

            let mut extra: Vec<OwnedPageWriteGuard> = Vec::new();
            for t in touched.iter() {
                if t != 0 && t != leaf_no && t != parent_no {
                    extra.push(self.pool().fetch(t)?.into_write());
                }
            }
            let mut pages: Vec<(u32, &mut [u8])> = vec![
                (0, &mut meta[..]),
                (leaf_no, &mut leaf[..]),
                (parent_no, &mut parent[..]),
            ];
            for guard in extra.iter_mut() {
                let no = guard.page_no();
                pages.push((no, &mut guard[..]));
            }
            log_structural(self.wal(), &mut pages)?;

            stats.leaves_merged += 1;
            drop(back);
            self.collapse_empty_ancestors(&mut meta, &mut path[..leaf_idx])?;
            return Ok(());
        }

        // Borrow until the leaf reaches the threshold. The separator in
        // the parent becomes the right sibling's new first key.
        let mut moved = 0usize;
        let mut need = threshold.saturating_sub(leaf_used);
        let right_count = node::cell_count(&right);
        while moved + 1 < right_count && need > 0 {
            let key = node::key_at(&right, moved);
            let cost = node::SLOT_SIZE + key.len() + node::body_at(&right, moved).len();
            need = need.saturating_sub(cost);
            moved += 1;
        }
        if moved == 0 {
            return Ok(());
        }
        let new_sep = node::key_at(&right, moved).to_vec();
        if !node::room_for_replace(parent, slot, 4)
            || !sep_replacement_fits(parent, slot, &new_sep)
        {
            // The parent cannot take the wider separator; leave the leaf
            // underfull for a later pass.
            return Ok(());
        }

        let mut insert_at = node::cell_count(leaf);
        for _ in 0..moved {
            let key = node::key_at(&right, 0).to_vec();
            let body = node::body_at(&right, 0).to_vec();
            node::insert_cell(leaf, insert_at, &key, &body)?;
            node::remove_cell(&mut right, 0)?;
            insert_at += 1;
        }
        node::replace_cell(parent, slot, &new_sep, &leaf_no.to_le_bytes())?;

        let mut pages: Vec<(u32, &mut [u8])> = vec![
            (leaf_no, &mut leaf[..]),
            (right_no, &mut right[..]),
            (parent_no, &mut parent[..]),
        ];
        log_structural(self.wal(), &mut pages)?;
        stats.cells_borrowed += moved;
        Ok(())
    }

    /// Walks the retained path upward, replacing emptied interior nodes
    /// (zero cells, only a right child) with their single child; the root
    /// collapses through the file header. `meta` is the latched page 0.
    fn collapse_empty_ancestors(
        &self,
        meta: &mut [u8],
        path: &mut [(OwnedPageWriteGuard, Option<usize>)],
    ) -> Result<()> {
        let mut level = path.len();
        while level > 0 {
            level -= 1;
            let (node_page, node_slot) = {
                let (guard, slot) = &path[level];
                if PageHeader::from_bytes(guard)?.page_type() != PageType::BTreeInterior {
                    return Ok(());
                }
                if node::cell_count(guard) > 0 {
                    return Ok(());
                }
                (guard.page_no(), *slot)
            };

            let only_child = {
                let (guard, _) = &path[level];
                PageHeader::from_bytes(guard)?.right_child()
            };

            if level == 0 {
                // Empty root: its single child becomes the root. Release
                // the old root's guard before freeing it.
                FileHeader::from_bytes_mut(meta)?.set_root_page(only_child);

                let child_guard = self.pool().fetch(only_child)?.into_write();
                let old = std::mem::replace(&mut path[0], (child_guard, None));
                drop(old);

                let mut touched = TouchedPages::new();
                self.alloc().free(meta, node_page, &mut touched)?;
                let mut guards: Vec<OwnedPageWriteGuard> = Vec::new();
                for t in touched.iter() {
                    if t != 0 {
                        guards.push(self.pool().fetch(t)?.into_write());
                    }
                }
                let mut pages: Vec<(u32, &mut [u8])> = vec![(0, &mut *meta)];
                for guard in guards.iter_mut() {
                    let no = guard.page_no();
                    pages.push((no, &mut guard[..]));
                }
                log_structural(self.wal(), &mut pages)?;
                return Ok(());
            }

            // Point the grandparent at the only child, release the empty
            // node's guard, free it, and log everything as one record.
            {
                let (front, _back) = path.split_at_mut(level);
                let (gp, _) = front.last_mut().expect("grandparent");
                match node_slot {
                    Some(slot) => node::set_child_at(gp, slot, only_child),
                    None => PageHeader::from_bytes_mut(gp)?.set_right_child(only_child),
                }
            }

            let child_guard = self.pool().fetch(only_child)?.into_write();
            let old = std::mem::replace(&mut path[level], (child_guard, node_slot));
            drop(old);

            let mut touched = TouchedPages::new();
            self.alloc().free(meta, node_page, &mut touched)?;
            let mut guards: Vec<OwnedPageWriteGuard> = Vec::new();
            for t in touched.iter() {
                if t != 0 {
                    guards.push(self.pool().fetch(t)?.into_write());
                }
            }
            let (front, _back) = path.split_at_mut(level);
            let (gp, _) = front.last_mut().expect("grandparent");
            let gp_no = gp.page_no();
            let mut pages: Vec<(u32, &mut [u8])> =
                vec![(0, &mut *meta), (gp_no, &mut gp[..])];
            for guard in guards.iter_mut() {
                let no = guard.page_no();
                pages.push((no, &mut guard[..]));
            }
            log_structural(self.wal(), &mut pages)?;
        }
        Ok(())
    }
}

struct LeafSweepOutcome {
    next_leaf: u32,
    freed_overflow: Vec<u32>,
    underfull_route: Option<Vec<u8>>,
}

/// Whether swapping the separator cell's key for `new_sep` fits the
/// parent page.
fn sep_replacement_fits(parent: &[u8], slot: usize, new_sep: &[u8]) -> bool {
    let old = node::slot_at(parent, slot);
    let new_cell = new_sep.len() + 4;
    if new_cell <= old.cell_len as usize {
        return true;
    }
    let header = PageHeader::from_bytes(parent).expect("page header");
    header.free_space() as usize + header.frag_bytes() as usize + old.cell_len as usize
        >= new_cell
}
