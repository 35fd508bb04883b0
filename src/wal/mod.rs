//! # Write-Ahead Log
//!
//! An append-only sequential log of mutations, written before the
//! corresponding page changes can be flushed. The WAL provides the two
//! durability primitives everything else is built on:
//!
//! 1. **Commit durability**: a transaction is committed exactly when its
//!    Commit record is durable — not when its pages are.
//! 2. **WAL-before-page-flush**: the buffer pool calls [`Wal::sync_to`]
//!    with a page's stamped LSN before writing that page back, so no page
//!    change ever reaches disk ahead of the record describing it.
//!
//! ## File Layout
//!
//! ```text
//! +------------------+------------------+------------------+----
//! | WAL Header (32B) | Record           | Record           | ...
//! | magic, version,  | (length-prefixed,| (length-prefixed,|
//! | base_lsn         |  checksummed)    |  checksummed)    |
//! +------------------+------------------+------------------+----
//! ```
//!
//! An LSN is a logical byte offset into the record stream. The header's
//! `base_lsn` maps logical offsets to physical file positions, which keeps
//! LSN addressing stable across prefix truncation: `truncate_before(lsn)`
//! rewrites the surviving tail into a fresh file whose `base_lsn` is the
//! truncation point and atomically renames it over the log.
//!
//! ## Write Protocol
//!
//! Appends serialize into an in-memory tail buffer under the single writer
//! mutex; `sync()` flushes the buffer and fsyncs, advancing the durable
//! LSN. Commit paths call `sync()`; everything else stays buffered until a
//! sync, a reader, or the buffer pool's flush ordering forces it out.
//! Append order defines the global commit order.
//!
//! ## Read Protocol
//!
//! [`WalReader`] iterates records from any LSN, validating each checksum
//! and each record's self-declared LSN. The first invalid record marks the
//! crash tail: iteration stops there and the reader reports the position so
//! recovery can warn and truncate rather than silently losing the signal.
//!
//! ## Concurrency
//!
//! One mutex guards the tail (single-writer append discipline); the durable
//! and next LSNs are mirrored in atomics so flush-ordering checks never
//! take the mutex. Readers open their own file handle and never contend
//! with the writer beyond a buffer flush at creation.

pub mod record;
pub mod structural;

pub use record::{
    ActiveTxn, LogRecord, Lsn, PageImage, RecordBody, TxnId, ValueOp, NULL_LSN,
};

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{MAX_WAL_RECORD_SIZE, WAL_HEADER_SIZE};
use record::MIN_RECORD_SIZE;

pub const WAL_MAGIC: &[u8; 16] = b"StrataDB WAL\x00\x00\x00\x00";
pub const WAL_VERSION: u32 = 1;

/// The first assignable LSN; 0 is reserved as the null LSN.
pub const FIRST_LSN: Lsn = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WalFileHeader {
    magic: [u8; 16],
    version: U32,
    base_lsn: U64,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<WalFileHeader>() == WAL_HEADER_SIZE);

pub struct Wal {
    path: PathBuf,
    state: Mutex<WalState>,
    /// All log bytes below this LSN are fsynced. Always a record boundary.
    durable: AtomicU64,
    /// Mirror of `state.next_lsn` for lock-free reads.
    next: AtomicU64,
}

struct WalState {
    file: File,
    base_lsn: Lsn,
    /// Serialized records not yet written to the file.
    buffer: Vec<u8>,
    /// LSN of the first byte in `buffer`.
    buffer_start: Lsn,
    next_lsn: Lsn,
    /// Where a torn/corrupt tail was cut off at open, for recovery's warning.
    truncated_tail: Option<Lsn>,
}

impl Wal {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create WAL at {:?}", path))?;

        let header = WalFileHeader {
            magic: *WAL_MAGIC,
            version: U32::new(WAL_VERSION),
            base_lsn: U64::new(FIRST_LSN),
            reserved: [0u8; 4],
        };
        file.write_all(header.as_bytes())
            .wrap_err("failed to write WAL header")?;
        file.sync_all().wrap_err("failed to sync new WAL")?;

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                file,
                base_lsn: FIRST_LSN,
                buffer: Vec::new(),
                buffer_start: FIRST_LSN,
                next_lsn: FIRST_LSN,
                truncated_tail: None,
            }),
            durable: AtomicU64::new(FIRST_LSN),
            next: AtomicU64::new(FIRST_LSN),
        })
    }

    /// Opens an existing log, scanning to the end of the valid record
    /// stream. A torn or corrupt tail is physically truncated; the cut
    /// position is reported via [`Wal::truncated_tail`].
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;

        let mut header_bytes = [0u8; WAL_HEADER_SIZE];
        file.read_exact(&mut header_bytes)
            .wrap_err("failed to read WAL header")?;
        let header = WalFileHeader::ref_from_bytes(&header_bytes)
            .map_err(|e| eyre::eyre!("failed to parse WAL header: {:?}", e))?;
        ensure!(&header.magic == WAL_MAGIC, "invalid WAL magic bytes");
        ensure!(
            header.version.get() == WAL_VERSION,
            "unsupported WAL version: {}",
            header.version.get()
        );
        let base_lsn = header.base_lsn.get();

        // Scan forward to the last valid record.
        let file_len = file.metadata().wrap_err("failed to stat WAL")?.len();
        let mut reader = BufReader::new(
            file.try_clone().wrap_err("failed to clone WAL handle")?,
        );
        reader
            .seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))
            .wrap_err("failed to seek WAL")?;
        let mut scan = WalReader {
            reader,
            next_lsn: base_lsn,
            base_lsn,
            corrupt_tail: None,
        };
        while scan.next_record()?.is_some() {}
        let next_lsn = scan.next_lsn;
        let truncated_tail = scan.corrupt_tail;

        let valid_end = WAL_HEADER_SIZE as u64 + (next_lsn - base_lsn);
        if valid_end < file_len {
            file.set_len(valid_end)
                .wrap_err("failed to truncate corrupt WAL tail")?;
            file.sync_all().wrap_err("failed to sync truncated WAL")?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                file,
                base_lsn,
                buffer: Vec::new(),
                buffer_start: next_lsn,
                next_lsn,
                truncated_tail,
            }),
            durable: AtomicU64::new(next_lsn),
            next: AtomicU64::new(next_lsn),
        })
    }

    pub fn open_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Where the corrupt tail was cut at open, if it was.
    pub fn truncated_tail(&self) -> Option<Lsn> {
        self.state.lock().truncated_tail
    }

    /// Assigns the next LSN and buffers the record. Not durable until a
    /// sync; Commit callers follow up with [`Wal::sync`].
    pub fn append(&self, mut record: LogRecord) -> Result<Lsn> {
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        record.lsn = lsn;
        let wire = record.encode();
        ensure!(
            wire.len() <= 4 + MAX_WAL_RECORD_SIZE,
            "WAL record of {} bytes exceeds the maximum",
            wire.len()
        );
        state.buffer.extend_from_slice(&wire);
        state.next_lsn += wire.len() as u64;
        self.next.store(state.next_lsn, Ordering::Release);
        Ok(lsn)
    }

    fn flush_locked(state: &mut WalState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let offset = WAL_HEADER_SIZE as u64 + (state.buffer_start - state.base_lsn);
        state
            .file
            .seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek WAL tail")?;
        state
            .file
            .write_all(&state.buffer)
            .wrap_err("failed to write WAL tail")?;
        state.buffer_start = state.next_lsn;
        state.buffer.clear();
        Ok(())
    }

    /// Flushes the tail buffer and fsyncs; everything appended so far is
    /// durable on return.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::flush_locked(&mut state)?;
        state.file.sync_data().wrap_err("failed to sync WAL")?;
        self.durable.store(state.next_lsn, Ordering::Release);
        Ok(())
    }

    /// Ensures the record at `lsn` is durable (WAL-before-page-flush).
    pub fn sync_to(&self, lsn: Lsn) -> Result<()> {
        if lsn == NULL_LSN || self.durable.load(Ordering::Acquire) > lsn {
            return Ok(());
        }
        self.sync()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable.load(Ordering::Acquire)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next.load(Ordering::Acquire)
    }

    /// Bytes of log past the given LSN; the checkpoint trigger.
    pub fn tail_bytes_since(&self, lsn: Lsn) -> u64 {
        self.next_lsn().saturating_sub(lsn.max(FIRST_LSN))
    }

    /// A reader positioned at `lsn` (which must be a record boundary at or
    /// after the base). Pending appends are flushed first so the reader
    /// sees every record appended before this call.
    pub fn reader_from(&self, lsn: Lsn) -> Result<WalReader> {
        let mut state = self.state.lock();
        Self::flush_locked(&mut state)?;
        let base_lsn = state.base_lsn;
        ensure!(
            lsn >= base_lsn && lsn <= state.next_lsn,
            "LSN {} outside log range [{}, {}]",
            lsn,
            base_lsn,
            state.next_lsn
        );
        drop(state);

        let file = File::open(&self.path).wrap_err("failed to open WAL for reading")?;
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(WAL_HEADER_SIZE as u64 + (lsn - base_lsn)))
            .wrap_err("failed to seek WAL reader")?;

        Ok(WalReader {
            reader,
            next_lsn: lsn,
            base_lsn,
            corrupt_tail: None,
        })
    }

    /// Random-access read of the single record at `lsn` (undo walks).
    pub fn read_record_at(&self, lsn: Lsn) -> Result<LogRecord> {
        let mut reader = self.reader_from(lsn)?;
        reader
            .next_record()?
            .ok_or_else(|| eyre::eyre!("no valid WAL record at LSN {}", lsn))
    }

    /// Discards the log prefix before `lsn` (a record boundary). The
    /// surviving tail is rewritten into a fresh file with `base_lsn = lsn`
    /// and atomically renamed over the log, so LSN addressing is unchanged.
    pub fn truncate_before(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        Self::flush_locked(&mut state)?;
        state.file.sync_data().wrap_err("failed to sync WAL")?;
        self.durable.store(state.next_lsn, Ordering::Release);

        if lsn <= state.base_lsn {
            return Ok(());
        }
        ensure!(
            lsn <= state.next_lsn,
            "cannot truncate past the log end: {} > {}",
            lsn,
            state.next_lsn
        );

        let tmp_path = self.path.with_extension("wal.tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .wrap_err("failed to create WAL truncation temp file")?;

        let header = WalFileHeader {
            magic: *WAL_MAGIC,
            version: U32::new(WAL_VERSION),
            base_lsn: U64::new(lsn),
            reserved: [0u8; 4],
        };
        tmp.write_all(header.as_bytes())
            .wrap_err("failed to write truncated WAL header")?;

        let tail_offset = WAL_HEADER_SIZE as u64 + (lsn - state.base_lsn);
        state
            .file
            .seek(SeekFrom::Start(tail_offset))
            .wrap_err("failed to seek surviving WAL tail")?;
        let mut tail = Vec::new();
        state
            .file
            .read_to_end(&mut tail)
            .wrap_err("failed to read surviving WAL tail")?;
        tmp.write_all(&tail)
            .wrap_err("failed to copy surviving WAL tail")?;
        tmp.sync_all().wrap_err("failed to sync truncated WAL")?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.path)
            .wrap_err("failed to swap truncated WAL into place")?;

        state.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .wrap_err("failed to reopen truncated WAL")?;
        state.base_lsn = lsn;
        Ok(())
    }
}

/// Iterates records from a starting LSN, stopping at the crash tail.
pub struct WalReader {
    reader: BufReader<File>,
    next_lsn: Lsn,
    #[allow(dead_code)]
    base_lsn: Lsn,
    corrupt_tail: Option<Lsn>,
}

impl WalReader {
    /// The next valid record, or `None` at clean end-of-log *or* at the
    /// first torn/corrupt record (check [`WalReader::corrupt_tail`]).
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if self.corrupt_tail.is_some() {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).wrap_err("failed to read WAL record length"),
        }

        let total_len = u32::from_le_bytes(len_bytes) as usize;
        if total_len + 4 < MIN_RECORD_SIZE || total_len > MAX_WAL_RECORD_SIZE {
            self.corrupt_tail = Some(self.next_lsn);
            return Ok(None);
        }

        let mut wire = vec![0u8; 4 + total_len];
        wire[..4].copy_from_slice(&len_bytes);
        if self.reader.read_exact(&mut wire[4..]).is_err() {
            self.corrupt_tail = Some(self.next_lsn);
            return Ok(None);
        }

        let record = match LogRecord::decode(&wire) {
            Ok(r) => r,
            Err(_) => {
                self.corrupt_tail = Some(self.next_lsn);
                return Ok(None);
            }
        };

        // A record claiming a different LSN than its position means the
        // tail was overwritten by an older generation of the log.
        if record.lsn != self.next_lsn {
            self.corrupt_tail = Some(self.next_lsn);
            return Ok(None);
        }

        self.next_lsn += wire.len() as u64;
        Ok(Some(record))
    }

    /// LSN of the next record this reader would return.
    pub fn position(&self) -> Lsn {
        self.next_lsn
    }

    pub fn corrupt_tail(&self) -> Option<Lsn> {
        self.corrupt_tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn begin(txn: TxnId) -> LogRecord {
        LogRecord::new(txn, NULL_LSN, RecordBody::Begin)
    }

    #[test]
    fn append_assigns_increasing_lsns() {
        let dir = tempdir().unwrap();
        let wal = Wal::create(&dir.path().join("t.wal")).unwrap();

        let a = wal.append(begin(1)).unwrap();
        let b = wal.append(begin(2)).unwrap();
        assert_eq!(a, FIRST_LSN);
        assert!(b > a);
        assert_eq!(wal.next_lsn(), b + (b - a));
    }

    #[test]
    fn sync_advances_durable_lsn() {
        let dir = tempdir().unwrap();
        let wal = Wal::create(&dir.path().join("t.wal")).unwrap();

        wal.append(begin(1)).unwrap();
        assert_eq!(wal.durable_lsn(), FIRST_LSN);
        wal.sync().unwrap();
        assert_eq!(wal.durable_lsn(), wal.next_lsn());
    }

    #[test]
    fn sync_to_is_noop_when_already_durable() {
        let dir = tempdir().unwrap();
        let wal = Wal::create(&dir.path().join("t.wal")).unwrap();
        let lsn = wal.append(begin(1)).unwrap();
        wal.sync().unwrap();
        wal.sync_to(lsn).unwrap();
        assert_eq!(wal.durable_lsn(), wal.next_lsn());
    }

    #[test]
    fn reader_replays_appended_records() {
        let dir = tempdir().unwrap();
        let wal = Wal::create(&dir.path().join("t.wal")).unwrap();

        for txn in 1..=5 {
            wal.append(begin(txn)).unwrap();
        }

        let mut reader = wal.reader_from(FIRST_LSN).unwrap();
        let mut seen = Vec::new();
        while let Some(rec) = reader.next_record().unwrap() {
            seen.push(rec.txn_id);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(reader.corrupt_tail().is_none());
    }

    #[test]
    fn reopen_resumes_at_log_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.wal");

        let end = {
            let wal = Wal::create(&path).unwrap();
            wal.append(begin(1)).unwrap();
            wal.append(begin(2)).unwrap();
            wal.sync().unwrap();
            wal.next_lsn()
        };

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.next_lsn(), end);
        assert_eq!(wal.durable_lsn(), end);
        assert!(wal.truncated_tail().is_none());
    }

    #[test]
    fn torn_tail_is_cut_at_last_valid_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.wal");

        let second;
        {
            let wal = Wal::create(&path).unwrap();
            wal.append(begin(1)).unwrap();
            second = wal.append(begin(2)).unwrap();
            wal.sync().unwrap();
        }

        // Chop the file mid-way through the second record.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.truncated_tail(), Some(second));
        assert_eq!(wal.next_lsn(), second);

        let mut reader = wal.reader_from(FIRST_LSN).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn corrupted_record_stops_iteration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.wal");

        let second;
        {
            let wal = Wal::create(&path).unwrap();
            wal.append(begin(1)).unwrap();
            second = wal.append(begin(2)).unwrap();
            wal.sync().unwrap();
        }

        // Flip a payload byte inside the second record.
        let mut raw = std::fs::read(&path).unwrap();
        let offset = WAL_HEADER_SIZE as u64 + (second - FIRST_LSN);
        raw[offset as usize + 10] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.truncated_tail(), Some(second));
    }

    #[test]
    fn truncate_before_preserves_lsn_addressing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let wal = Wal::create(&path).unwrap();

        let mut lsns = Vec::new();
        for txn in 1..=4 {
            lsns.push(wal.append(begin(txn)).unwrap());
        }
        wal.sync().unwrap();

        wal.truncate_before(lsns[2]).unwrap();

        let mut reader = wal.reader_from(lsns[2]).unwrap();
        let rec = reader.next_record().unwrap().unwrap();
        assert_eq!(rec.lsn, lsns[2]);
        assert_eq!(rec.txn_id, 3);

        // The dropped prefix is gone.
        assert!(wal.reader_from(lsns[0]).is_err());
    }

    #[test]
    fn truncate_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.wal");

        let keep;
        let end;
        {
            let wal = Wal::create(&path).unwrap();
            wal.append(begin(1)).unwrap();
            keep = wal.append(begin(2)).unwrap();
            wal.sync().unwrap();
            wal.truncate_before(keep).unwrap();
            end = wal.next_lsn();
        }

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.next_lsn(), end);
        let mut reader = wal.reader_from(keep).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap().txn_id, 2);
    }

    #[test]
    fn read_record_at_fetches_single_record() {
        let dir = tempdir().unwrap();
        let wal = Wal::create(&dir.path().join("t.wal")).unwrap();
        wal.append(begin(1)).unwrap();
        let lsn = wal.append(begin(9)).unwrap();
        let rec = wal.read_record_at(lsn).unwrap();
        assert_eq!(rec.txn_id, 9);
    }
}
