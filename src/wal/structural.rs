//! # Structural Record Logging
//!
//! One structural change — a split, a merge, a page allocation — touches
//! several pages that must survive or vanish together across a crash. The
//! engine captures full images of every touched page into a *single*
//! Structural WAL record (one checksum unit, so a torn tail keeps all of
//! it or none), then stamps each page with the record's LSN.
//!
//! ## Ordering Discipline
//!
//! The caller holds the write latch of every page in the list across
//! mutation, capture, append and stamp. Combined with the same rule for
//! value records, any image captured here reflects exactly the records
//! with LSN at or below the page's stamp — which is what makes the
//! per-page LSN gate during redo sound.
//!
//! Page 0 stores its recovery stamp in the file header rather than a page
//! header; the helper handles both.

use eyre::Result;

use super::record::{LogRecord, Lsn, PageImage, RecordBody, NULL_LSN};
use super::Wal;
use crate::storage::page::set_page_lsn;
use crate::storage::FileHeader;

/// Captures `pages` into one Structural record, appends it, and stamps
/// every page with the new LSN. Pages are `(page_no, latched bytes)`.
pub fn log_structural(wal: &Wal, pages: &mut [(u32, &mut [u8])]) -> Result<Lsn> {
    debug_assert!(!pages.is_empty());

    let images = pages
        .iter()
        .map(|(page_no, data)| PageImage {
            page_no: *page_no,
            image: data.to_vec(),
        })
        .collect();

    let lsn = wal.append(LogRecord::new(
        0,
        NULL_LSN,
        RecordBody::Structural { pages: images },
    ))?;

    for (page_no, data) in pages.iter_mut() {
        if *page_no == 0 {
            FileHeader::from_bytes_mut(data)?.set_page_lsn(lsn);
        } else {
            set_page_lsn(data, lsn);
        }
    }

    Ok(lsn)
}
