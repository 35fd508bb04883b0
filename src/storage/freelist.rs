//! # Free-Space Management
//!
//! Freed pages are tracked in a linked chain of trunk pages so the file can
//! reuse space instead of growing forever. The chain head and total count
//! live in the file header on page 0.
//!
//! ## Trunk Page Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------
//! 0       32    PageHeader (type = FreeListTrunk,
//!               right_child = next trunk or 0)
//! 32      4     count: free page numbers in this trunk
//! 36      4*N   page_numbers
//! ```
//!
//! ## Allocation Strategy
//!
//! - Trunk has entries: pop one.
//! - Trunk is empty: the trunk page *itself* is the allocation; the head
//!   moves to the next trunk.
//! - No free pages at all: zero-extend the file by one page.
//!
//! Freeing pushes onto the head trunk, or converts the freed page into a
//! new head trunk when there is none (or the head is full). Freed pages
//! are stamped `PageType::Free`.
//!
//! ## Latch Protocol
//!
//! Every caller is a structural operation that already holds the
//! engine-wide structural mutex *and* the page-0 write latch — page 0 is
//! always the first latch a structural change takes, matching the
//! descent order, which is what keeps the latch graph acyclic. The
//! allocator therefore operates on the caller's latched page-0 bytes and
//! only latches trunk and freed pages itself (always after page 0).
//!
//! ## WAL Discipline
//!
//! Every page the allocator touches (page 0, trunks, the freed page) is
//! recorded in the caller's [`TouchedPages`] set, and the caller folds
//! those images into the one structural WAL record covering the whole
//! structural change. The allocator never logs by itself.
//!
//! Growing the file mutates no page content, so it needs no logging;
//! recovery re-grows on demand when replaying records that target pages
//! past the current end.

use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use super::page::{PageHeader, PageType};
use super::{FileHeader, PageFile, PAGE_HEADER_SIZE};
use crate::buffer::BufferPool;

/// Pages mutated during one structural change, deduplicated, in first-touch
/// order. The caller snapshots their images into the structural record.
#[derive(Debug, Default)]
pub struct TouchedPages {
    pages: SmallVec<[u32; 8]>,
}

impl TouchedPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note(&mut self, page_no: u32) {
        if !self.pages.contains(&page_no) {
            self.pages.push(page_no);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

const TRUNK_COUNT_OFFSET: usize = PAGE_HEADER_SIZE;
const TRUNK_ENTRIES_OFFSET: usize = PAGE_HEADER_SIZE + 4;

fn trunk_capacity(page_size: usize) -> usize {
    (page_size - TRUNK_ENTRIES_OFFSET) / 4
}

fn trunk_count(data: &[u8]) -> u32 {
    u32::from_le_bytes(
        data[TRUNK_COUNT_OFFSET..TRUNK_COUNT_OFFSET + 4]
            .try_into()
            .unwrap(),
    )
}

fn set_trunk_count(data: &mut [u8], count: u32) {
    data[TRUNK_COUNT_OFFSET..TRUNK_COUNT_OFFSET + 4].copy_from_slice(&count.to_le_bytes());
}

fn trunk_entry(data: &[u8], idx: usize) -> u32 {
    let off = TRUNK_ENTRIES_OFFSET + idx * 4;
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn set_trunk_entry(data: &mut [u8], idx: usize, page_no: u32) {
    let off = TRUNK_ENTRIES_OFFSET + idx * 4;
    data[off..off + 4].copy_from_slice(&page_no.to_le_bytes());
}

pub struct Allocator {
    pool: Arc<BufferPool>,
    file: Arc<PageFile>,
}

impl Allocator {
    pub fn new(pool: Arc<BufferPool>, file: Arc<PageFile>) -> Self {
        Self { pool, file }
    }

    /// Hands out a page: from the free list if possible, otherwise by
    /// growing the file. `meta` is the caller's write-latched page 0.
    /// The returned page's content is stale or zeroed; the caller
    /// reinitializes it under its own write latch.
    pub fn allocate(&self, meta: &mut [u8], touched: &mut TouchedPages) -> Result<u32> {
        let head = FileHeader::from_bytes(meta)?.freelist_head();

        if head == 0 {
            let page_no = self.file.page_count();
            self.file.grow(page_no + 1)?;
            return Ok(page_no);
        }

        let trunk_pin = self.pool.fetch(head)?;
        let mut trunk = trunk_pin.write();
        ensure!(
            PageHeader::from_bytes(&trunk)?.page_type() == PageType::FreeListTrunk,
            "free list head page {} is not a trunk",
            head
        );

        let count = trunk_count(&trunk);
        let allocated = if count > 0 {
            let page_no = trunk_entry(&trunk, count as usize - 1);
            set_trunk_count(&mut trunk, count - 1);
            touched.note(head);
            page_no
        } else {
            // Empty trunk: the trunk page itself is the allocation.
            let next = PageHeader::from_bytes(&trunk)?.right_child();
            FileHeader::from_bytes_mut(meta)?.set_freelist_head(next);
            head
        };

        let header = FileHeader::from_bytes_mut(meta)?;
        header.set_freelist_count(header.freelist_count().saturating_sub(1));
        touched.note(0);

        Ok(allocated)
    }

    /// Returns a page to the free list, stamping it `PageType::Free` (or
    /// converting it into a new trunk when the head is full or absent).
    /// `meta` is the caller's write-latched page 0; the caller must not
    /// hold a latch on `page_no`.
    pub fn free(&self, meta: &mut [u8], page_no: u32, touched: &mut TouchedPages) -> Result<()> {
        ensure!(page_no != 0, "page 0 can never be freed");

        let head = FileHeader::from_bytes(meta)?.freelist_head();
        let page_size = self.pool.page_size();

        let mut push_into_head = false;
        if head != 0 {
            let trunk_pin = self.pool.fetch(head)?;
            let trunk = trunk_pin.read();
            push_into_head = (trunk_count(&trunk) as usize) < trunk_capacity(page_size);
        }

        if push_into_head {
            let trunk_pin = self.pool.fetch(head)?;
            let mut trunk = trunk_pin.write();
            let count = trunk_count(&trunk);
            set_trunk_entry(&mut trunk, count as usize, page_no);
            set_trunk_count(&mut trunk, count + 1);
            touched.note(head);

            let freed_pin = self.pool.fetch(page_no)?;
            let mut freed = freed_pin.write();
            PageHeader::new(PageType::Free, page_size).write_to(&mut freed)?;
            touched.note(page_no);
        } else {
            // The freed page becomes the new head trunk.
            let freed_pin = self.pool.fetch(page_no)?;
            let mut freed = freed_pin.write();
            let mut trunk_header = PageHeader::new(PageType::FreeListTrunk, page_size);
            trunk_header.set_right_child(head);
            trunk_header.write_to(&mut freed)?;
            set_trunk_count(&mut freed, 0);
            touched.note(page_no);

            FileHeader::from_bytes_mut(meta)?.set_freelist_head(page_no);
        }

        let header = FileHeader::from_bytes_mut(meta)?;
        header.set_freelist_count(header.freelist_count() + 1);
        touched.note(0);

        Ok(())
    }

    /// Total pages available for reuse (trunk pages included).
    pub fn free_count(&self) -> Result<u32> {
        let pin = self.pool.fetch(0)?;
        let page = pin.read();
        Ok(FileHeader::from_bytes(&page)?.freelist_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Wal;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 4096;

    fn setup() -> (tempfile::TempDir, Arc<PageFile>, Arc<BufferPool>, Allocator) {
        let dir = tempdir().unwrap();
        let file = Arc::new(PageFile::create(&dir.path().join("t.sdb"), PAGE_SIZE).unwrap());
        let wal = Arc::new(Wal::create(&dir.path().join("t.wal")).unwrap());

        // Format page 0.
        {
            let mut page = vec![0u8; PAGE_SIZE];
            FileHeader::new(PAGE_SIZE).write_to(&mut page).unwrap();
            file.write_page(0, &page).unwrap();
        }

        let pool = Arc::new(BufferPool::new(Arc::clone(&file), wal, 64).unwrap());
        let alloc = Allocator::new(Arc::clone(&pool), Arc::clone(&file));
        (dir, file, pool, alloc)
    }

    fn with_meta<T>(pool: &BufferPool, f: impl FnOnce(&mut [u8]) -> T) -> T {
        let pin = pool.fetch(0).unwrap();
        let mut meta = pin.write();
        f(&mut meta)
    }

    #[test]
    fn allocate_grows_when_freelist_empty() {
        let (_dir, file, pool, alloc) = setup();
        let mut touched = TouchedPages::new();

        let (a, b) = with_meta(&pool, |meta| {
            (
                alloc.allocate(meta, &mut touched).unwrap(),
                alloc.allocate(meta, &mut touched).unwrap(),
            )
        });
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(file.page_count(), 3);
        assert!(touched.is_empty()); // growth mutates no pages
    }

    #[test]
    fn free_then_allocate_reuses_page() {
        let (_dir, file, pool, alloc) = setup();
        let mut touched = TouchedPages::new();

        let (a, b) = with_meta(&pool, |meta| {
            (
                alloc.allocate(meta, &mut touched).unwrap(),
                alloc.allocate(meta, &mut touched).unwrap(),
            )
        });
        with_meta(&pool, |meta| {
            alloc.free(meta, a, &mut touched).unwrap();
            alloc.free(meta, b, &mut touched).unwrap();
        });
        assert_eq!(alloc.free_count().unwrap(), 2);

        let pages_before = file.page_count();
        let c = with_meta(&pool, |meta| alloc.allocate(meta, &mut touched).unwrap());
        assert!(c == a || c == b);
        assert_eq!(file.page_count(), pages_before);
        assert_eq!(alloc.free_count().unwrap(), 1);
    }

    #[test]
    fn empty_trunk_is_itself_allocated() {
        let (_dir, _file, pool, alloc) = setup();
        let mut touched = TouchedPages::new();

        let a = with_meta(&pool, |meta| alloc.allocate(meta, &mut touched).unwrap());
        with_meta(&pool, |meta| alloc.free(meta, a, &mut touched).unwrap());

        // One free page: the trunk itself (entry list empty).
        let back = with_meta(&pool, |meta| alloc.allocate(meta, &mut touched).unwrap());
        assert_eq!(back, a);
        assert_eq!(alloc.free_count().unwrap(), 0);
    }

    #[test]
    fn touched_pages_dedup() {
        let mut touched = TouchedPages::new();
        touched.note(5);
        touched.note(0);
        touched.note(5);
        assert_eq!(touched.iter().collect::<Vec<_>>(), vec![5, 0]);
    }
}
