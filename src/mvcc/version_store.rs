//! # Version Store
//!
//! Older record versions live in Version pages, appended sequentially and
//! linked from leaf cells via `(page << 16) | offset` pointers. The store
//! manages the current append target (rooted in the file header), chains
//! retired Version pages for the garbage sweep, and reads chain entries
//! for visibility walks.
//!
//! ## Version Page Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------
//! 0       32    PageHeader (type = Version,
//!               cell_count = live entries,
//!               free_start = next append offset,
//!               right_child = previously current Version page)
//! 32      ...   entries: [len u16][body], appended upward
//! ```
//!
//! An entry body is a version header plus its payload (or overflow
//! reference) — exactly the leaf cell body it was copied from.
//!
//! ## Live Accounting
//!
//! `cell_count` counts entries still reachable from some chain. Updates
//! increment it; undo and the garbage sweep decrement it. A Version page
//! whose count reaches zero is returned to the free list by the sweep.
//!
//! ## Recovery
//!
//! Entry writes are carried inside Update/Clr records and replayed through
//! [`write_entry`], which also advances `free_start` monotonically — so a
//! replayed page never hands out offsets that would overwrite live
//! entries. Reservations themselves are soft state: a reservation lost to
//! a crash merely leaves a hole.

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use super::version::VersionHeader;
use crate::buffer::BufferPool;
use crate::config::PAGE_HEADER_SIZE;
use crate::storage::page::{PageHeader, PageType};
use crate::storage::{Allocator, FileHeader, TouchedPages};
use crate::wal::structural::log_structural;
use crate::wal::Wal;

/// Entry prefix: a u16 body length.
const ENTRY_LEN_SIZE: usize = 2;

pub struct VersionStore {
    pool: Arc<BufferPool>,
    alloc: Arc<Allocator>,
    wal: Arc<Wal>,
    /// The engine-wide structural critical section.
    structural: Arc<Mutex<()>>,
}

impl VersionStore {
    pub fn new(
        pool: Arc<BufferPool>,
        alloc: Arc<Allocator>,
        wal: Arc<Wal>,
        structural: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            pool,
            alloc,
            wal,
            structural,
        }
    }

    /// Reserves space for a chain entry of `body_len` bytes, allocating a
    /// fresh Version page if the current one is full (a structural
    /// change). Returns the `(page, offset)` the caller writes under its
    /// own latches via [`write_entry`].
    pub fn reserve(&self, body_len: usize) -> Result<(u32, u16)> {
        let needed = ENTRY_LEN_SIZE + body_len;
        let page_size = self.pool.page_size();
        ensure!(
            needed <= page_size - PAGE_HEADER_SIZE,
            "version entry of {} bytes cannot fit a page",
            body_len
        );

        // Fast path: the current Version page has room.
        let current = {
            let meta_pin = self.pool.fetch(0)?;
            let meta = meta_pin.read();
            FileHeader::from_bytes(&meta)?.version_page()
        };
        if current != 0 {
            if let Some(slot) = self.try_bump(current, needed)? {
                return Ok((current, slot));
            }
        }

        // Slow path: allocate and install a new Version page. Structural
        // latch protocol: structural mutex first, then the page-0 write
        // latch, then everything else.
        let _structural = self.structural.lock();
        let meta_pin = self.pool.fetch(0)?;
        let mut meta = meta_pin.write();

        // Re-check under the structural lock; another thread may have
        // already installed a fresh page.
        let current = FileHeader::from_bytes(&meta)?.version_page();
        if current != 0 {
            if let Some(slot) = self.try_bump(current, needed)? {
                return Ok((current, slot));
            }
        }

        let mut touched = TouchedPages::new();
        let new_page = self.alloc.allocate(&mut meta, &mut touched)?;

        let vpage_pin = self.pool.fetch(new_page)?;
        let mut vpage = vpage_pin.write();

        let mut header = PageHeader::new(PageType::Version, page_size);
        header.set_right_child(current);
        header.write_to(&mut vpage)?;
        FileHeader::from_bytes_mut(&mut meta)?.set_version_page(new_page);

        // Fold the allocator's page mutations (page 0, trunk) plus the new
        // page into one structural record.
        let mut guards: Vec<crate::buffer::OwnedPageWriteGuard> = Vec::new();
        for page_no in touched.iter() {
            if page_no == 0 || page_no == new_page {
                continue;
            }
            guards.push(self.pool.fetch(page_no)?.into_write());
        }

        let voffset = {
            let mut pages: Vec<(u32, &mut [u8])> = Vec::new();
            pages.push((0, &mut meta[..]));
            pages.push((new_page, &mut vpage[..]));
            for guard in guards.iter_mut() {
                let page_no = guard.page_no();
                pages.push((page_no, &mut guard[..]));
            }
            log_structural(&self.wal, &mut pages)?;

            PageHeader::from_bytes(&vpage)?.free_start()
        };

        // Bump free_start for the reservation.
        {
            let header = PageHeader::from_bytes_mut(&mut vpage)?;
            header.set_free_start(voffset + needed as u16);
        }

        Ok((new_page, voffset))
    }

    /// Bumps `free_start` on an existing Version page if it has room.
    fn try_bump(&self, vpage: u32, needed: usize) -> Result<Option<u16>> {
        let pin = self.pool.fetch(vpage)?;
        let mut page = pin.write();
        let header = PageHeader::from_bytes(&page)?;
        ensure!(
            header.page_type() == PageType::Version,
            "page {} is not a Version page",
            vpage
        );
        if (header.free_space() as usize) < needed {
            return Ok(None);
        }
        let slot = header.free_start();
        PageHeader::from_bytes_mut(&mut page)?.set_free_start(slot + needed as u16);
        Ok(Some(slot))
    }

    /// Reads a chain entry, returning its parsed header and payload bytes
    /// (the body minus the version header).
    pub fn read(&self, vpage: u32, voffset: u16) -> Result<(VersionHeader, Vec<u8>)> {
        let pin = self.pool.fetch(vpage)?;
        let page = pin.read();
        let body = entry_body(&page, voffset)?;
        ensure!(
            body.len() >= VersionHeader::SIZE,
            "version entry at {}:{} too short",
            vpage,
            voffset
        );
        let header = VersionHeader::from_bytes(body);
        Ok((header, body[VersionHeader::SIZE..].to_vec()))
    }
}

/// Writes an entry body at `voffset`, incrementing the live count and
/// advancing `free_start` monotonically. Used by writers and by redo.
pub fn write_entry(page: &mut [u8], voffset: u16, body: &[u8]) {
    let off = voffset as usize;
    page[off..off + ENTRY_LEN_SIZE].copy_from_slice(&(body.len() as u16).to_le_bytes());
    page[off + ENTRY_LEN_SIZE..off + ENTRY_LEN_SIZE + body.len()].copy_from_slice(body);

    let header = PageHeader::from_bytes_mut(page).expect("version page header");
    header.set_cell_count(header.cell_count() + 1);
    let end = (off + ENTRY_LEN_SIZE + body.len()) as u16;
    if header.free_start() < end {
        header.set_free_start(end);
    }
}

/// The body bytes of the entry at `voffset`.
pub fn entry_body(page: &[u8], voffset: u16) -> Result<&[u8]> {
    let off = voffset as usize;
    ensure!(
        off + ENTRY_LEN_SIZE <= page.len(),
        "version entry offset {} out of bounds",
        voffset
    );
    let len = u16::from_le_bytes(page[off..off + ENTRY_LEN_SIZE].try_into().unwrap()) as usize;
    ensure!(
        off + ENTRY_LEN_SIZE + len <= page.len(),
        "version entry at offset {} overruns the page",
        voffset
    );
    Ok(&page[off + ENTRY_LEN_SIZE..off + ENTRY_LEN_SIZE + len])
}

/// Drops one live entry from the page's accounting; returns the remaining
/// live count.
pub fn dec_live(page: &mut [u8]) -> u16 {
    let header = PageHeader::from_bytes_mut(page).expect("version page header");
    let remaining = header.cell_count().saturating_sub(1);
    header.set_cell_count(remaining);
    remaining
}
