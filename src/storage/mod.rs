//! # Storage Module
//!
//! The foundational storage layer: a single page file accessed through
//! fixed-size block I/O, with per-page checksums, a 128-byte file header on
//! page 0, and free-space management as a linked chain of trunk pages.
//!
//! ## Layering
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  btree / mvcc / recovery             │
//! ├──────────────────────────────────────┤
//! │  freelist (Allocator)                │   page mutations flow through
//! ├──────────────────────────────────────┤   the buffer pool and are
//! │  buffer (BufferPool)                 │   WAL-logged like any other
//! ├──────────────────────────────────────┤   page change
//! │  file (PageFile)                     │
//! └──────────────────────────────────────┘
//! ```
//!
//! The page file itself is deliberately dumb: raw block transfer plus
//! checksum discipline. Everything that *decides* anything — what lives in
//! a page, when it is flushed, which pages are free — sits above, where the
//! write-ahead invariant can be enforced.
//!
//! ## Why Not mmap?
//!
//! Memory-mapping would let the OS write back dirty pages at arbitrary
//! times, which is fatal here: a page image must never reach disk before
//! the WAL records describing it are durable. Routing every page through
//! the buffer pool makes the flush ordering enforceable in one place.
//!
//! ## Module Organization
//!
//! - `file`: single-file page store (`PageFile`)
//! - `page`: page types, 32-byte header, LSN stamp, CRC-64 helpers
//! - `header`: the page-0 file header (`FileHeader`)
//! - `freelist`: trunk-chain free list (`Allocator`)

pub mod file;
pub mod freelist;
pub mod header;
pub mod page;

pub use file::PageFile;
pub use freelist::{Allocator, TouchedPages};
pub use header::FileHeader;
pub use page::{PageHeader, PageType};

pub use crate::config::{FILE_HEADER_SIZE, PAGE_HEADER_SIZE};
