//! # Buffer Pool
//!
//! A bounded in-memory cache of pages with SIEVE eviction and 64-way lock
//! sharding. Every page the engine touches flows through here; the pool is
//! the single owner of in-memory page buffers and the enforcement point for
//! the write-ahead invariant.
//!
//! ## Why SIEVE Instead of LRU?
//!
//! Strict LRU lets one sequential scan evict the whole cache. SIEVE keeps a
//! "visited" flag per frame and an eviction hand: a visited frame gets its
//! flag cleared and a second chance; an unvisited frame is evicted. Pages
//! touched once (scans) leave quickly, pages touched repeatedly stay.
//!
//! ## Pin/Latch Protocol
//!
//! ```text
//! let pin = pool.fetch(page_no)?;    // pinned: cannot be evicted
//! {
//!     let page = pin.read();         // shared page latch
//!     ... read page bytes ...
//! }
//! {
//!     let mut page = pin.write();    // exclusive page latch, marks dirty
//!     ... mutate, stamp page LSN ...
//! }
//! // latches drop with their guards, the pin drops last
//! ```
//!
//! Pins are reference-counted; latches are per-frame `RwLock`s scoped to
//! their guards, released on all exit paths. Latch coupling during B+Tree
//! descent acquires the child's pin+latch before releasing the parent's,
//! which is just guard ordering at the call site.
//!
//! ## The Write-Ahead Invariant
//!
//! A dirty page is written back (eviction or flush) only after the WAL is
//! durable up to the page's stamped LSN: the pool reads `page_lsn` from the
//! frame and calls `Wal::sync_to` before `PageFile::write_page`. Nothing
//! else in the engine writes pages to disk.
//!
//! ## Lock Sharding
//!
//! Frames are distributed over 64 shards by page number; each shard owns
//! its map, its SIEVE ring and its hand under one mutex. Eviction I/O
//! happens while holding only that shard's mutex, never a page latch of a
//! pinned page (pinned frames are exempt from eviction, and an unpinned
//! frame by construction has no outstanding latch guards).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::config::CACHE_SHARD_COUNT;
use crate::storage::page::page_lsn;
use crate::storage::PageFile;
use crate::wal::Wal;

pub struct Frame {
    page_no: u32,
    data: Arc<RwLock<Box<[u8]>>>,
    pin_count: AtomicU32,
    visited: AtomicBool,
    dirty: AtomicBool,
}

impl Frame {
    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }
}

struct Shard {
    frames: HashMap<u32, Arc<Frame>>,
    ring: Vec<Arc<Frame>>,
    hand: usize,
    capacity: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            frames: HashMap::with_capacity(capacity),
            ring: Vec::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    /// SIEVE: pick an unpinned, unvisited victim, giving visited frames a
    /// second chance. `None` when every frame is pinned.
    fn pick_victim(&mut self) -> Option<Arc<Frame>> {
        if self.ring.is_empty() {
            return None;
        }
        let mut passes = 0;
        let start = self.hand;
        loop {
            let frame = &self.ring[self.hand];
            if frame.is_pinned() {
                self.advance_hand(start, &mut passes)?;
                continue;
            }
            if frame.visited.swap(false, Ordering::AcqRel) {
                self.advance_hand(start, &mut passes)?;
                continue;
            }
            return Some(Arc::clone(frame));
        }
    }

    fn advance_hand(&mut self, start: usize, passes: &mut u32) -> Option<()> {
        self.hand = (self.hand + 1) % self.ring.len();
        if self.hand == start {
            *passes += 1;
            // Two full passes: first clears visited flags, second confirms
            // everything left is pinned.
            if *passes >= 2 {
                return None;
            }
        }
        Some(())
    }

    fn remove(&mut self, page_no: u32) {
        self.frames.remove(&page_no);
        if let Some(idx) = self.ring.iter().position(|f| f.page_no == page_no) {
            self.ring.swap_remove(idx);
            if self.hand >= self.ring.len() {
                self.hand = 0;
            }
        }
    }
}

pub struct BufferPool {
    shards: Vec<Mutex<Shard>>,
    file: Arc<PageFile>,
    wal: Arc<Wal>,
    page_size: usize,
}

impl BufferPool {
    pub fn new(file: Arc<PageFile>, wal: Arc<Wal>, total_capacity: usize) -> Result<Self> {
        ensure!(
            total_capacity >= CACHE_SHARD_COUNT,
            "buffer pool capacity {} must be at least {} (one frame per shard)",
            total_capacity,
            CACHE_SHARD_COUNT
        );

        let per_shard = total_capacity / CACHE_SHARD_COUNT;
        let remainder = total_capacity % CACHE_SHARD_COUNT;
        let shards = (0..CACHE_SHARD_COUNT)
            .map(|i| {
                let cap = if i < remainder { per_shard + 1 } else { per_shard };
                Mutex::new(Shard::new(cap))
            })
            .collect();

        let page_size = file.page_size();
        Ok(Self {
            shards,
            file,
            wal,
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn shard_for(&self, page_no: u32) -> &Mutex<Shard> {
        &self.shards[page_no as usize % CACHE_SHARD_COUNT]
    }

    /// Pins the page, loading it from the page file on a miss (evicting if
    /// the shard is full). The returned pin blocks eviction until dropped.
    pub fn fetch(&self, page_no: u32) -> Result<PagePin> {
        let mut shard = self.shard_for(page_no).lock();

        if let Some(frame) = shard.frames.get(&page_no) {
            frame.pin_count.fetch_add(1, Ordering::AcqRel);
            frame.visited.store(true, Ordering::Release);
            return Ok(PagePin {
                frame: Arc::clone(frame),
            });
        }

        if shard.ring.len() >= shard.capacity {
            let victim = shard.pick_victim().ok_or_else(|| {
                eyre::eyre!(
                    "buffer pool shard full and all {} frames pinned",
                    shard.capacity
                )
            })?;
            self.write_back(&victim)
                .wrap_err_with(|| format!("failed to evict page {}", victim.page_no))?;
            shard.remove(victim.page_no);
        }

        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        self.file
            .read_page(page_no, &mut buf)
            .wrap_err_with(|| format!("failed to load page {} into the pool", page_no))?;

        let frame = Arc::new(Frame {
            page_no,
            data: Arc::new(RwLock::new(buf)),
            pin_count: AtomicU32::new(1),
            visited: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
        });
        shard.frames.insert(page_no, Arc::clone(&frame));
        shard.ring.push(Arc::clone(&frame));

        Ok(PagePin { frame })
    }

    /// WAL-before-page-flush, then write back and clear dirty.
    fn write_back(&self, frame: &Frame) -> Result<()> {
        if !frame.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let data = frame.data.read();
        let lsn = if frame.page_no == 0 {
            crate::storage::FileHeader::from_bytes(&data)?.page_lsn()
        } else {
            page_lsn(&data)
        };
        self.wal
            .sync_to(lsn)
            .wrap_err("WAL sync before page write-back failed")?;
        self.file.write_page(frame.page_no, &data)?;
        frame.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Flushes every dirty frame (pinned or not; a frame's page latch
    /// serializes against in-flight mutators) and syncs the page file.
    /// Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        for shard in &self.shards {
            let frames: Vec<Arc<Frame>> = {
                let guard = shard.lock();
                guard.ring.iter().map(Arc::clone).collect()
            };
            for frame in frames {
                if frame.dirty.load(Ordering::Acquire) {
                    self.write_back(&frame)?;
                    flushed += 1;
                }
            }
        }
        self.file.sync().wrap_err("failed to sync page file")?;
        Ok(flushed)
    }

    /// Flushes one page if cached and dirty.
    pub fn flush_page(&self, page_no: u32) -> Result<bool> {
        let frame = {
            let shard = self.shard_for(page_no).lock();
            shard.frames.get(&page_no).map(Arc::clone)
        };
        match frame {
            Some(frame) if frame.dirty.load(Ordering::Acquire) => {
                self.write_back(&frame)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Cached page count across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().ring.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pinned page. Dropping the pin re-admits the frame to eviction.
pub struct PagePin {
    frame: Arc<Frame>,
}

impl std::fmt::Debug for PagePin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePin")
            .field("page_no", &self.frame.page_no)
            .finish()
    }
}

impl PagePin {
    pub fn page_no(&self) -> u32 {
        self.frame.page_no
    }

    /// Shared page latch.
    pub fn read(&self) -> PageReadGuard<'_> {
        PageReadGuard {
            guard: self.frame.data.read_arc(),
            _pin: std::marker::PhantomData,
        }
    }

    /// Exclusive page latch; the frame is dirty from this point.
    pub fn write(&self) -> PageWriteGuard<'_> {
        let guard = self.frame.data.write_arc();
        self.frame.dirty.store(true, Ordering::Release);
        PageWriteGuard {
            guard,
            _pin: std::marker::PhantomData,
        }
    }

    /// Consumes the pin into a self-contained exclusive latch, for descent
    /// stacks and multi-page structural brackets.
    pub fn into_write(self) -> OwnedPageWriteGuard {
        let guard = self.frame.data.write_arc();
        self.frame.dirty.store(true, Ordering::Release);
        OwnedPageWriteGuard { guard, pin: self }
    }

    /// Consumes the pin into a self-contained shared latch.
    pub fn into_read(self) -> OwnedPageReadGuard {
        OwnedPageReadGuard {
            guard: self.frame.data.read_arc(),
            pin: self,
        }
    }
}

impl Drop for PagePin {
    fn drop(&mut self) {
        let prev = self.frame.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of an unpinned page");
    }
}

/// Shared latch guard. Lifetime-bound to the pin so a latch can never
/// outlive the pin that admitted it.
pub struct PageReadGuard<'a> {
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    _pin: std::marker::PhantomData<&'a PagePin>,
}

impl std::ops::Deref for PageReadGuard<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive latch guard.
pub struct PageWriteGuard<'a> {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    _pin: std::marker::PhantomData<&'a PagePin>,
}

impl std::ops::Deref for PageWriteGuard<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

/// Exclusive latch that owns its pin. Field order drops the latch before
/// the pin.
pub struct OwnedPageWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    pin: PagePin,
}

impl OwnedPageWriteGuard {
    pub fn page_no(&self) -> u32 {
        self.pin.page_no()
    }
}

impl std::ops::Deref for OwnedPageWriteGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for OwnedPageWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

/// Shared latch that owns its pin.
pub struct OwnedPageReadGuard {
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    pin: PagePin,
}

impl OwnedPageReadGuard {
    pub fn page_no(&self) -> u32 {
        self.pin.page_no()
    }
}

impl std::ops::Deref for OwnedPageReadGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}
