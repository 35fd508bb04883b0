//! # File Header
//!
//! Page 0 of the page file begins with a 128-byte header carrying the
//! metadata that roots everything else: page size, free-list head, B+Tree
//! root page, the current Version page, and the LSN of the last completed
//! checkpoint. The remaining bytes of page 0 are unused.
//!
//! ## Layout (128 bytes)
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  ----------------------------------------
//! 0       16    magic           b"StrataDB v1" + NUL padding
//! 16      4     version         Format version (currently 1)
//! 20      4     page_size       Bytes per page, fixed at creation
//! 24      4     root_page       B+Tree root page number
//! 28      4     freelist_head   First trunk page (0 = empty free list)
//! 32      4     freelist_count  Total free pages across all trunks
//! 36      4     version_page    Current Version page for chain appends
//! 40      8     checkpoint_lsn  LSN of the last CheckpointBegin record
//! 48      8     page_lsn        Recovery LSN stamp for page 0 itself
//! 56      72    reserved
//! ```
//!
//! Page 0 mutations (root change, free-list update, checkpoint stamp) flow
//! through the buffer pool like any other page and are captured in
//! structural WAL records, so the header participates in recovery. Page 0
//! is exempt from the per-page CRC; the magic and version fields validate
//! it on open.
//!
//! All multi-byte fields are little-endian via zerocopy wrappers.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::FILE_HEADER_SIZE;
use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};

pub const FILE_MAGIC: &[u8; 16] = b"StrataDB v1\x00\x00\x00\x00\x00";
pub const CURRENT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    root_page: U32,
    freelist_head: U32,
    freelist_count: U32,
    version_page: U32,
    checkpoint_lsn: U64,
    page_lsn: U64,
    reserved: [u8; 72],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(page_size: usize) -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: U32::new(CURRENT_VERSION),
            page_size: U32::new(page_size as u32),
            root_page: U32::new(0),
            freelist_head: U32::new(0),
            freelist_count: U32::new(0),
            version_page: U32::new(0),
            checkpoint_lsn: U64::new(0),
            page_lsn: U64::new(0),
            reserved: [0u8; 72],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;

        ensure!(
            &header.magic == FILE_MAGIC,
            "invalid magic bytes: not a StrataDB page file"
        );
        ensure!(
            header.version.get() == CURRENT_VERSION,
            "unsupported file format version: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );

        let page_size = header.page_size.get() as usize;
        ensure!(
            page_size.is_power_of_two()
                && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "invalid page size in header: {}",
            page_size
        );

        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        bytes[..FILE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size.get() as usize
    }

    pub fn root_page(&self) -> u32 {
        self.root_page.get()
    }

    pub fn set_root_page(&mut self, page_no: u32) {
        self.root_page.set(page_no);
    }

    pub fn freelist_head(&self) -> u32 {
        self.freelist_head.get()
    }

    pub fn set_freelist_head(&mut self, page_no: u32) {
        self.freelist_head.set(page_no);
    }

    pub fn freelist_count(&self) -> u32 {
        self.freelist_count.get()
    }

    pub fn set_freelist_count(&mut self, count: u32) {
        self.freelist_count.set(count);
    }

    pub fn version_page(&self) -> u32 {
        self.version_page.get()
    }

    pub fn set_version_page(&mut self, page_no: u32) {
        self.version_page.set(page_no);
    }

    pub fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn.get()
    }

    pub fn set_checkpoint_lsn(&mut self, lsn: u64) {
        self.checkpoint_lsn.set(lsn);
    }

    pub fn page_lsn(&self) -> u64 {
        self.page_lsn.get()
    }

    pub fn set_page_lsn(&mut self, lsn: u64) {
        self.page_lsn.set(lsn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_is_128_bytes() {
        assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn new_header_roundtrips() {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        let mut header = FileHeader::new(16384);
        header.set_root_page(1);
        header.set_freelist_head(7);
        header.set_freelist_count(3);
        header.set_checkpoint_lsn(42);
        header.write_to(&mut buf).unwrap();

        let parsed = FileHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed.page_size(), 16384);
        assert_eq!(parsed.root_page(), 1);
        assert_eq!(parsed.freelist_head(), 7);
        assert_eq!(parsed.freelist_count(), 3);
        assert_eq!(parsed.checkpoint_lsn(), 42);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; FILE_HEADER_SIZE];
        assert!(FileHeader::from_bytes(&buf).is_err());
    }

    #[test]
    fn rejects_bad_page_size() {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        let header = FileHeader::new(16384);
        header.write_to(&mut buf).unwrap();
        buf[20..24].copy_from_slice(&12345u32.to_le_bytes());
        assert!(FileHeader::from_bytes(&buf).is_err());
    }

    #[test]
    fn rejects_future_version() {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        let header = FileHeader::new(16384);
        header.write_to(&mut buf).unwrap();
        buf[16..20].copy_from_slice(&99u32.to_le_bytes());
        assert!(FileHeader::from_bytes(&buf).is_err());
    }
}
