//! # Overflow Chains
//!
//! A value whose cell would exceed a quarter of the usable page spills to
//! a chain of Overflow pages; the leaf cell keeps a fixed 8-byte reference
//! (head page + total length) after the version header.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------
//! 0       32    PageHeader (type = Overflow,
//!               right_child = next page in chain,
//!               free_start = 32 + chunk length)
//! 32      ...   chunk bytes
//! ```
//!
//! Chain pages are written before the value record that references them
//! and logged as structural page images, one record per page — a crash
//! between chain write and value record leaves unreferenced pages, never
//! a dangling reference.
//!
//! Each per-page critical section follows the structural latch protocol:
//! structural mutex, then the page-0 write latch, then everything else.

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::buffer::{BufferPool, OwnedPageWriteGuard};
use crate::config::PAGE_HEADER_SIZE;
use crate::storage::page::{PageHeader, PageType};
use crate::storage::{Allocator, TouchedPages};
use crate::wal::structural::log_structural;
use crate::wal::Wal;

/// Reference stored in a leaf cell body after the version header.
pub const OVERFLOW_REF_SIZE: usize = 8;

pub fn encode_ref(head: u32, total_len: u32) -> [u8; OVERFLOW_REF_SIZE] {
    let mut buf = [0u8; OVERFLOW_REF_SIZE];
    buf[..4].copy_from_slice(&head.to_le_bytes());
    buf[4..].copy_from_slice(&total_len.to_le_bytes());
    buf
}

pub fn decode_ref(body: &[u8]) -> Result<(u32, u32)> {
    ensure!(
        body.len() >= OVERFLOW_REF_SIZE,
        "overflow reference too short: {} bytes",
        body.len()
    );
    Ok((
        u32::from_le_bytes(body[..4].try_into().unwrap()),
        u32::from_le_bytes(body[4..8].try_into().unwrap()),
    ))
}

/// Writes `value` into a fresh overflow chain, returning the head page.
pub fn write_chain(
    pool: &Arc<BufferPool>,
    alloc: &Allocator,
    wal: &Wal,
    structural: &Mutex<()>,
    value: &[u8],
) -> Result<u32> {
    let page_size = pool.page_size();
    let chunk_size = page_size - PAGE_HEADER_SIZE;
    let chunks: Vec<&[u8]> = value.chunks(chunk_size).collect();

    // Build back to front so each page can link to its successor.
    let mut next = 0u32;
    for chunk in chunks.iter().rev() {
        let _guard = structural.lock();
        let meta_pin = pool.fetch(0)?;
        let mut meta = meta_pin.write();

        let mut touched = TouchedPages::new();
        let page_no = alloc.allocate(&mut meta, &mut touched)?;

        let pin = pool.fetch(page_no)?;
        let mut page = pin.write();
        let mut header = PageHeader::new(PageType::Overflow, page_size);
        header.set_right_child(next);
        header.set_free_start((PAGE_HEADER_SIZE + chunk.len()) as u16);
        header.write_to(&mut page)?;
        page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);

        let mut extra: Vec<OwnedPageWriteGuard> = Vec::new();
        for t in touched.iter() {
            if t != page_no && t != 0 {
                extra.push(pool.fetch(t)?.into_write());
            }
        }
        let mut pages: Vec<(u32, &mut [u8])> =
            vec![(0, &mut meta[..]), (page_no, &mut page[..])];
        for guard in extra.iter_mut() {
            let no = guard.page_no();
            pages.push((no, &mut guard[..]));
        }
        log_structural(wal, &mut pages)?;

        next = page_no;
    }

    Ok(next)
}

/// Reads a full chain back into memory.
pub fn read_chain(pool: &Arc<BufferPool>, head: u32, total_len: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_len as usize);
    let mut page_no = head;
    while page_no != 0 && out.len() < total_len as usize {
        let pin = pool.fetch(page_no)?;
        let page = pin.read();
        let header = PageHeader::from_bytes(&page)?;
        ensure!(
            header.page_type() == PageType::Overflow,
            "page {} in overflow chain is not an Overflow page",
            page_no
        );
        let end = header.free_start() as usize;
        out.extend_from_slice(&page[PAGE_HEADER_SIZE..end]);
        page_no = header.right_child();
    }
    ensure!(
        out.len() == total_len as usize,
        "overflow chain truncated: {} of {} bytes",
        out.len(),
        total_len
    );
    Ok(out)
}

/// Returns every page of a chain to the free list.
pub fn free_chain(
    pool: &Arc<BufferPool>,
    alloc: &Allocator,
    wal: &Wal,
    structural: &Mutex<()>,
    head: u32,
) -> Result<usize> {
    let mut freed = 0;
    let mut page_no = head;
    while page_no != 0 {
        let next = {
            let pin = pool.fetch(page_no)?;
            let page = pin.read();
            PageHeader::from_bytes(&page)?.right_child()
        };

        let _guard = structural.lock();
        let meta_pin = pool.fetch(0)?;
        let mut meta = meta_pin.write();

        let mut touched = TouchedPages::new();
        alloc.free(&mut meta, page_no, &mut touched)?;

        let mut guards: Vec<OwnedPageWriteGuard> = Vec::new();
        for t in touched.iter() {
            if t != 0 {
                guards.push(pool.fetch(t)?.into_write());
            }
        }
        let mut pages: Vec<(u32, &mut [u8])> = vec![(0, &mut meta[..])];
        for guard in guards.iter_mut() {
            let no = guard.page_no();
            pages.push((no, &mut guard[..]));
        }
        log_structural(wal, &mut pages)?;

        freed += 1;
        page_no = next;
    }
    Ok(freed)
}
