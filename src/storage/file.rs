//! # Page File
//!
//! Fixed-size block I/O over a single file. The page file knows nothing
//! about page contents beyond the checksum discipline: every write stamps a
//! fresh CRC-64 into the page header, every read verifies it, and a
//! mismatch surfaces as an error rather than silently returning corrupt
//! data. Page 0 is exempt (the file header's magic validates it instead).
//!
//! ## Contract
//!
//! - `read_page` / `write_page` transfer exactly one page; the buffer pool
//!   guarantees callers never present torn or partial data
//! - `grow` zero-extends the file, so a freshly allocated page reads back
//!   as all zeroes (a valid, never-written page)
//! - `sync` flushes the OS write cache; the buffer pool invokes it as part
//!   of checkpointing, after the WAL is durable
//!
//! ## Concurrency
//!
//! A single `parking_lot::Mutex` serializes file operations. Positioned
//! reads and writes are short; the interesting concurrency (latching,
//! eviction ordering) lives in the buffer pool above.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use super::page::{stamp_page_checksum, verify_page_checksum};
use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};

pub struct PageFile {
    inner: Mutex<FileInner>,
    page_size: usize,
}

struct FileInner {
    file: File,
    page_count: u32,
}

impl PageFile {
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        ensure!(
            page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "invalid page size: {}",
            page_size
        );

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page file at {:?}", path))?;

        file.set_len(page_size as u64)
            .wrap_err("failed to reserve page 0")?;

        Ok(Self {
            inner: Mutex::new(FileInner {
                file,
                page_count: 1,
            }),
            page_size,
        })
    }

    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file at {:?}", path))?;

        let len = file
            .metadata()
            .wrap_err("failed to stat page file")?
            .len();
        ensure!(
            len >= page_size as u64 && len % page_size as u64 == 0,
            "page file length {} is not a multiple of page size {}",
            len,
            page_size
        );

        Ok(Self {
            inner: Mutex::new(FileInner {
                file,
                page_count: (len / page_size as u64) as u32,
            }),
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.inner.lock().page_count
    }

    /// Reads one page into `buf`, verifying the stored checksum. A page of
    /// all zeroes (grown, never written) passes without a checksum.
    pub fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == self.page_size,
            "read buffer is {} bytes, page size is {}",
            buf.len(),
            self.page_size
        );

        let mut inner = self.inner.lock();
        ensure!(
            page_no < inner.page_count,
            "page {} out of bounds (file has {} pages)",
            page_no,
            inner.page_count
        );

        inner
            .file
            .seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))
            .wrap_err("failed to seek for page read")?;
        inner
            .file
            .read_exact(buf)
            .wrap_err_with(|| format!("failed to read page {}", page_no))?;
        drop(inner);

        if page_no != 0 && !buf.iter().all(|&b| b == 0) {
            ensure!(
                verify_page_checksum(buf),
                "checksum mismatch reading page {}",
                page_no
            );
        }

        Ok(())
    }

    /// Writes one page, stamping a fresh checksum (except page 0).
    pub fn write_page(&self, page_no: u32, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == self.page_size,
            "write buffer is {} bytes, page size is {}",
            data.len(),
            self.page_size
        );

        let mut scratch;
        let out: &[u8] = if page_no == 0 {
            data
        } else {
            scratch = data.to_vec();
            stamp_page_checksum(&mut scratch);
            &scratch
        };

        let mut inner = self.inner.lock();
        ensure!(
            page_no < inner.page_count,
            "page {} out of bounds (file has {} pages)",
            page_no,
            inner.page_count
        );

        inner
            .file
            .seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))
            .wrap_err("failed to seek for page write")?;
        inner
            .file
            .write_all(out)
            .wrap_err_with(|| format!("failed to write page {}", page_no))?;

        Ok(())
    }

    /// Zero-extends the file to hold at least `new_count` pages.
    pub fn grow(&self, new_count: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if new_count <= inner.page_count {
            return Ok(());
        }
        inner
            .file
            .set_len(new_count as u64 * self.page_size as u64)
            .wrap_err_with(|| format!("failed to grow page file to {} pages", new_count))?;
        inner.page_count = new_count;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.inner
            .lock()
            .file
            .sync_all()
            .wrap_err("failed to sync page file")
    }
}
