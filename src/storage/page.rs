//! # Page Types and Header Layout
//!
//! Every page begins with a 32-byte header containing metadata about the
//! page contents, the LSN of the last WAL record applied to the page, and a
//! CRC-64 checksum covering the full page.
//!
//! ## Page Header Layout (32 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       1     page_type    Type of page (BTreeLeaf, Version, etc.)
//! 1       1     flags        Page flags
//! 2       2     cell_count   Cells in this page (live records, for Version)
//! 4       2     free_start   Offset where free space begins
//! 6       2     free_end     Offset where free space ends
//! 8       1     frag_bytes   Fragmented free bytes within the cell area
//! 9       3     reserved     Reserved
//! 12      4     right_child  Interior right child / leaf next / chain next
//! 16      8     page_lsn     LSN of the last WAL record applied
//! 24      8     checksum     CRC-64 over the page with this field zeroed
//! ```
//!
//! ## Page Types
//!
//! - **Free** (0x01): On the free list, content meaningless
//! - **BTreeInterior** (0x02): Separator keys and child page pointers
//! - **BTreeLeaf** (0x03): Keys with newest record versions
//! - **Version** (0x10): Older record versions forming MVCC chains
//! - **Overflow** (0x20): Spilled values too large to inline in a leaf
//! - **FreeListTrunk** (0x30): Free page list trunk
//!
//! ## Page LSN
//!
//! The `page_lsn` field orders recovery: a WAL record is re-applied to a
//! page only when `page_lsn < record.lsn`, making both value and structural
//! redo idempotent. Mutators stamp the field immediately after appending the
//! record that describes their change, while still holding the page's write
//! latch.
//!
//! ## Checksum
//!
//! The checksum is stamped by the page store on write-back and verified on
//! every read from disk; it is stale while a page sits dirty in the buffer
//! pool, which is fine because only the on-disk image needs torn-write
//! detection. Page 0 is exempt: the file header's magic and version fields
//! validate it instead.
//!
//! ## Cell Layout (B+Tree pages)
//!
//! ```text
//! +-------------------+
//! | Header (32 bytes) |
//! +-------------------+
//! | Slot Array        |  <- grows toward the end of the page
//! | (6 bytes each)    |
//! +-------------------+
//! | Free Space        |
//! +-------------------+
//! | Cell Content      |  <- grows toward the header
//! +-------------------+
//! ```

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::PAGE_HEADER_SIZE;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const CHECKSUM_OFFSET: usize = 24;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Free = 0x01,
    BTreeInterior = 0x02,
    BTreeLeaf = 0x03,
    Version = 0x10,
    Overflow = 0x20,
    FreeListTrunk = 0x30,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Free,
            0x02 => PageType::BTreeInterior,
            0x03 => PageType::BTreeLeaf,
            0x10 => PageType::Version,
            0x20 => PageType::Overflow,
            0x30 => PageType::FreeListTrunk,
            _ => PageType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    page_type: u8,
    flags: u8,
    cell_count: U16,
    free_start: U16,
    free_end: U16,
    frag_bytes: u8,
    reserved: [u8; 3],
    right_child: U32,
    page_lsn: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(page_type: PageType, page_size: usize) -> Self {
        Self {
            page_type: page_type as u8,
            flags: 0,
            cell_count: U16::new(0),
            free_start: U16::new(PAGE_HEADER_SIZE as u16),
            free_end: U16::new(page_size as u16),
            frag_bytes: 0,
            reserved: [0; 3],
            right_child: U32::new(0),
            page_lsn: U64::new(0),
            checksum: U64::new(0),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        data[..PAGE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type as u8;
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn cell_count(&self) -> u16 {
        self.cell_count.get()
    }

    pub fn set_cell_count(&mut self, count: u16) {
        self.cell_count.set(count);
    }

    pub fn free_start(&self) -> u16 {
        self.free_start.get()
    }

    pub fn set_free_start(&mut self, offset: u16) {
        self.free_start.set(offset);
    }

    pub fn free_end(&self) -> u16 {
        self.free_end.get()
    }

    pub fn set_free_end(&mut self, offset: u16) {
        self.free_end.set(offset);
    }

    pub fn free_space(&self) -> u16 {
        self.free_end.get().saturating_sub(self.free_start.get())
    }

    pub fn frag_bytes(&self) -> u8 {
        self.frag_bytes
    }

    pub fn set_frag_bytes(&mut self, bytes: u8) {
        self.frag_bytes = bytes;
    }

    pub fn right_child(&self) -> u32 {
        self.right_child.get()
    }

    pub fn set_right_child(&mut self, page_no: u32) {
        self.right_child.set(page_no);
    }

    pub fn next_leaf(&self) -> u32 {
        self.right_child.get()
    }

    pub fn set_next_leaf(&mut self, page_no: u32) {
        self.right_child.set(page_no);
    }

    pub fn page_lsn(&self) -> u64 {
        self.page_lsn.get()
    }

    pub fn set_page_lsn(&mut self, lsn: u64) {
        self.page_lsn.set(lsn);
    }
}

/// Reads the page LSN directly from raw page bytes.
pub fn page_lsn(data: &[u8]) -> u64 {
    debug_assert!(data.len() >= PAGE_HEADER_SIZE);
    u64::from_le_bytes(data[16..24].try_into().unwrap())
}

/// Stamps the page LSN directly into raw page bytes.
pub fn set_page_lsn(data: &mut [u8], lsn: u64) {
    debug_assert!(data.len() >= PAGE_HEADER_SIZE);
    data[16..24].copy_from_slice(&lsn.to_le_bytes());
}

/// CRC-64 over the page with the checksum field treated as zero.
pub fn compute_page_checksum(data: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&data[..CHECKSUM_OFFSET]);
    digest.update(&[0u8; 8]);
    digest.update(&data[CHECKSUM_OFFSET + 8..]);
    digest.finalize()
}

pub fn stamp_page_checksum(data: &mut [u8]) {
    let sum = compute_page_checksum(data);
    data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8].copy_from_slice(&sum.to_le_bytes());
}

pub fn verify_page_checksum(data: &[u8]) -> bool {
    let stored = u64::from_le_bytes(data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8].try_into().unwrap());
    stored == compute_page_checksum(data)
}

/// Structural sanity check on a page image. A fully zeroed page is valid
/// (freshly grown, never written).
pub fn validate_page(data: &[u8], page_size: usize) -> Result<()> {
    ensure!(
        data.len() == page_size,
        "invalid page size: {} != {}",
        data.len(),
        page_size
    );

    let header = PageHeader::from_bytes(data)?;

    let is_zeroed = header.page_type == 0
        && header.flags == 0
        && header.cell_count.get() == 0
        && header.free_start.get() == 0
        && header.free_end.get() == 0;
    if is_zeroed {
        return Ok(());
    }

    ensure!(
        header.page_type() != PageType::Unknown,
        "invalid page type: {:02x}",
        header.page_type
    );
    ensure!(
        header.free_start() >= PAGE_HEADER_SIZE as u16,
        "free_start {} < PAGE_HEADER_SIZE {}",
        header.free_start(),
        PAGE_HEADER_SIZE
    );
    ensure!(
        header.free_end() as usize <= page_size,
        "free_end {} > page size {}",
        header.free_end(),
        page_size
    );
    ensure!(
        header.free_start() <= header.free_end(),
        "free_start {} > free_end {}",
        header.free_start(),
        header.free_end()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 16384;

    #[test]
    fn page_header_size_is_32_bytes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), 32);
    }

    #[test]
    fn page_type_from_byte_roundtrip() {
        for t in [
            PageType::Free,
            PageType::BTreeInterior,
            PageType::BTreeLeaf,
            PageType::Version,
            PageType::Overflow,
            PageType::FreeListTrunk,
        ] {
            assert_eq!(PageType::from_byte(t as u8), t);
        }
        assert_eq!(PageType::from_byte(0xFF), PageType::Unknown);
    }

    #[test]
    fn page_header_new_initializes_bounds() {
        let header = PageHeader::new(PageType::BTreeLeaf, PAGE_SIZE);
        assert_eq!(header.page_type(), PageType::BTreeLeaf);
        assert_eq!(header.cell_count(), 0);
        assert_eq!(header.free_start(), PAGE_HEADER_SIZE as u16);
        assert_eq!(header.free_end(), PAGE_SIZE as u16);
        assert_eq!(header.page_lsn(), 0);
    }

    #[test]
    fn page_lsn_raw_accessors_match_header() {
        let mut data = vec![0u8; PAGE_SIZE];
        let header = PageHeader::new(PageType::Version, PAGE_SIZE);
        header.write_to(&mut data).unwrap();

        set_page_lsn(&mut data, 0xDEAD_BEEF);
        assert_eq!(page_lsn(&data), 0xDEAD_BEEF);
        assert_eq!(PageHeader::from_bytes(&data).unwrap().page_lsn(), 0xDEAD_BEEF);
    }

    #[test]
    fn checksum_roundtrip() {
        let mut data = vec![0u8; PAGE_SIZE];
        data[100] = 7;
        stamp_page_checksum(&mut data);
        assert!(verify_page_checksum(&data));
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut data = vec![0u8; PAGE_SIZE];
        data[100] = 7;
        stamp_page_checksum(&mut data);
        data[5000] ^= 1;
        assert!(!verify_page_checksum(&data));
    }

    #[test]
    fn checksum_ignores_its_own_field() {
        let mut a = vec![0u8; PAGE_SIZE];
        let mut b = vec![0u8; PAGE_SIZE];
        a[40] = 9;
        b[40] = 9;
        b[CHECKSUM_OFFSET] = 0xFF;
        assert_eq!(compute_page_checksum(&a), compute_page_checksum(&b));
    }

    #[test]
    fn validate_page_zeroed_is_valid() {
        let data = vec![0u8; PAGE_SIZE];
        assert!(validate_page(&data, PAGE_SIZE).is_ok());
    }

    #[test]
    fn validate_page_rejects_bad_bounds() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut header = PageHeader::new(PageType::BTreeLeaf, PAGE_SIZE);
        header.set_free_start(8);
        header.write_to(&mut data).unwrap();
        assert!(validate_page(&data, PAGE_SIZE).is_err());
    }

    #[test]
    fn validate_page_rejects_wrong_length() {
        let data = vec![0u8; 100];
        assert!(validate_page(&data, PAGE_SIZE).is_err());
    }
}
