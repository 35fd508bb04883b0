//! # StrataDB Configuration Constants
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (configurable: 4096 | 8192 | 16384, default 16384)
//!       │
//!       ├─> PAGE_HEADER_SIZE (32 bytes, fixed)
//!       │     Every page starts with type/bookkeeping/page-LSN/checksum.
//!       │
//!       ├─> FILE_HEADER_SIZE (128 bytes, page 0 only)
//!       │
//!       └─> max_inline_cell(page_size) (usable / 4)
//!             A leaf must hold at least four cells or a midpoint split
//!             cannot reduce occupancy. Larger values go to Overflow pages.
//!
//! DEFAULT_BUFFER_POOL_CAPACITY (256 pages)
//!       │
//!       └─> must be >= CACHE_SHARD_COUNT (64), one frame per shard minimum
//!
//! DEFAULT_CHECKPOINT_THRESHOLD (16 MiB of WAL)
//!       │
//!       └─> background maintenance checkpoints once the WAL tail
//!           exceeds this many bytes
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `MIN_PAGE_SIZE` and `MAX_PAGE_SIZE` are powers of two
//! 2. `DEFAULT_BUFFER_POOL_CAPACITY >= CACHE_SHARD_COUNT`
//! 3. `MAX_KEY_LEN` fits a leaf slot's u16 key-length field with room for
//!    the version header

/// Fixed per-page header: type, flags, cell bookkeeping, page LSN, checksum.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Page 0 carries the file header instead of a page header.
pub const FILE_HEADER_SIZE: usize = 128;

/// WAL file prelude: magic, version, base LSN.
pub const WAL_HEADER_SIZE: usize = 32;

pub const DEFAULT_PAGE_SIZE: usize = 16384;
pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 16384;

/// Total buffer pool frames by default. Must be at least one per shard.
pub const DEFAULT_BUFFER_POOL_CAPACITY: usize = 256;

/// Lock shards in the buffer pool; reduces contention ~64x for random access.
pub const CACHE_SHARD_COUNT: usize = 64;

/// Hard cap on simultaneously active transactions.
pub const MAX_CONCURRENT_TXNS: usize = 64;

/// WAL bytes after which the background maintenance thread checkpoints.
pub const DEFAULT_CHECKPOINT_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Default bound on key-lock waits. `None` in `EngineConfig` disables it.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Keys longer than this are rejected at the API boundary.
pub const MAX_KEY_LEN: usize = 1024;

/// Largest single WAL record. Structural records carry full page images —
/// a sweep pass over a long version chain can touch dozens of pages in
/// one record. Reads reject anything larger as corruption.
pub const MAX_WAL_RECORD_SIZE: usize = 8 * 1024 * 1024;

/// Cells larger than a quarter of the usable page spill the value to
/// Overflow pages, keeping at least four cells per leaf so splits always
/// reduce occupancy.
pub fn max_inline_cell(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 4
}

/// Below this payload occupancy a leaf is considered underfull and becomes
/// a candidate for borrow-or-merge during the maintenance sweep.
pub fn underflow_threshold(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 4
}

const _: () = assert!(MIN_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGE_SIZE.is_power_of_two());
const _: () = assert!(DEFAULT_PAGE_SIZE >= MIN_PAGE_SIZE && DEFAULT_PAGE_SIZE <= MAX_PAGE_SIZE);
const _: () = assert!(DEFAULT_BUFFER_POOL_CAPACITY >= CACHE_SHARD_COUNT);
const _: () = assert!(MAX_KEY_LEN < u16::MAX as usize);
const _: () = assert!(FILE_HEADER_SIZE < MIN_PAGE_SIZE);
