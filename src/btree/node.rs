//! # B+Tree Node Layout
//!
//! Low-level cell operations on a single page. Both node kinds share the
//! slot-array mechanics; they differ only in what a cell body means.
//!
//! ## Slot Array
//!
//! ```text
//! Slot (6 bytes):
//! +-------------+--------------+--------------+
//! | offset (2B) | key_len (2B) | cell_len (2B)|
//! +-------------+--------------+--------------+
//! ```
//!
//! Slots are sorted by key and grow from the header toward the end of the
//! page; cell content grows from the end of the page toward the header.
//! `free_start` is the end of the slot array, `free_end` the lowest cell
//! offset.
//!
//! ## Cell Content
//!
//! ```text
//! Cell: [ key (key_len bytes) ][ body (cell_len - key_len bytes) ]
//! ```
//!
//! - **Leaf** body: a 25-byte version header followed by the payload (or
//!   an 8-byte overflow reference).
//! - **Interior** body: a 4-byte child page number. Cell *i*'s child
//!   covers keys strictly below cell *i*'s key; the page header's
//!   `right_child` covers keys at or above the last cell's key.
//!
//! ## Fragmentation
//!
//! Removing a cell whose content is not adjacent to `free_end` leaves a
//! hole, accounted in `frag_bytes`. Holes are reclaimed by compaction,
//! triggered when an insert needs the space or when the u8 counter would
//! saturate.

use eyre::{ensure, Result};

use crate::config::PAGE_HEADER_SIZE;
use crate::storage::page::PageHeader;

pub const SLOT_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: u16,
    pub key_len: u16,
    pub cell_len: u16,
}

fn slot_pos(idx: usize) -> usize {
    PAGE_HEADER_SIZE + idx * SLOT_SIZE
}

pub fn slot_at(data: &[u8], idx: usize) -> Slot {
    let pos = slot_pos(idx);
    Slot {
        offset: u16::from_le_bytes(data[pos..pos + 2].try_into().unwrap()),
        key_len: u16::from_le_bytes(data[pos + 2..pos + 4].try_into().unwrap()),
        cell_len: u16::from_le_bytes(data[pos + 4..pos + 6].try_into().unwrap()),
    }
}

fn set_slot(data: &mut [u8], idx: usize, slot: Slot) {
    let pos = slot_pos(idx);
    data[pos..pos + 2].copy_from_slice(&slot.offset.to_le_bytes());
    data[pos + 2..pos + 4].copy_from_slice(&slot.key_len.to_le_bytes());
    data[pos + 4..pos + 6].copy_from_slice(&slot.cell_len.to_le_bytes());
}

pub fn cell_count(data: &[u8]) -> usize {
    PageHeader::from_bytes(data)
        .expect("page header")
        .cell_count() as usize
}

pub fn key_at(data: &[u8], idx: usize) -> &[u8] {
    let slot = slot_at(data, idx);
    &data[slot.offset as usize..slot.offset as usize + slot.key_len as usize]
}

/// The cell body (everything after the key).
pub fn body_at(data: &[u8], idx: usize) -> &[u8] {
    let slot = slot_at(data, idx);
    let start = slot.offset as usize + slot.key_len as usize;
    &data[start..slot.offset as usize + slot.cell_len as usize]
}

pub fn body_at_mut(data: &mut [u8], idx: usize) -> &mut [u8] {
    let slot = slot_at(data, idx);
    let start = slot.offset as usize + slot.key_len as usize;
    &mut data[start..slot.offset as usize + slot.cell_len as usize]
}

/// Binary search for `key`: `Ok(idx)` if present, `Err(idx)` with the
/// insertion point otherwise.
pub fn find_key(data: &[u8], key: &[u8]) -> std::result::Result<usize, usize> {
    let count = cell_count(data);
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match key_at(data, mid).cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

pub fn free_space(data: &[u8]) -> usize {
    PageHeader::from_bytes(data)
        .expect("page header")
        .free_space() as usize
}

/// Whether a cell of this shape fits, counting reclaimable fragments.
pub fn has_room(data: &[u8], key_len: usize, body_len: usize) -> bool {
    let header = PageHeader::from_bytes(data).expect("page header");
    let needed = SLOT_SIZE + key_len + body_len;
    header.free_space() as usize + header.frag_bytes() as usize >= needed
}

/// Rewrites all cell content tightly against the end of the page,
/// clearing fragmentation. Slot order is preserved.
pub fn compact(data: &mut [u8]) {
    let page_size = data.len();
    let count = cell_count(data);

    let mut scratch = vec![0u8; page_size];
    let mut write_pos = page_size;
    let mut new_slots = Vec::with_capacity(count);

    for idx in 0..count {
        let slot = slot_at(data, idx);
        let cell = &data[slot.offset as usize..slot.offset as usize + slot.cell_len as usize];
        write_pos -= cell.len();
        scratch[write_pos..write_pos + cell.len()].copy_from_slice(cell);
        new_slots.push(Slot {
            offset: write_pos as u16,
            ..slot
        });
    }

    data[write_pos..page_size].copy_from_slice(&scratch[write_pos..page_size]);
    for (idx, slot) in new_slots.into_iter().enumerate() {
        set_slot(data, idx, slot);
    }

    let header = PageHeader::from_bytes_mut(data).expect("page header");
    header.set_free_end(write_pos as u16);
    header.set_frag_bytes(0);
}

/// Inserts a cell at slot `idx`, shifting later slots. The caller has
/// verified `has_room`.
pub fn insert_cell(data: &mut [u8], idx: usize, key: &[u8], body: &[u8]) -> Result<()> {
    let cell_len = key.len() + body.len();
    let count = cell_count(data);
    ensure!(idx <= count, "slot index {} out of bounds", idx);

    {
        let header = PageHeader::from_bytes(data)?;
        if (header.free_space() as usize) < SLOT_SIZE + cell_len {
            ensure!(
                header.free_space() as usize + header.frag_bytes() as usize
                    >= SLOT_SIZE + cell_len,
                "page full: cell of {} bytes does not fit",
                cell_len
            );
            compact(data);
        }
    }

    let header = PageHeader::from_bytes(data)?;
    let new_offset = header.free_end() as usize - cell_len;
    data[new_offset..new_offset + key.len()].copy_from_slice(key);
    data[new_offset + key.len()..new_offset + cell_len].copy_from_slice(body);

    // Shift slots [idx..count) up by one.
    let src = slot_pos(idx);
    let end = slot_pos(count);
    data.copy_within(src..end, src + SLOT_SIZE);

    set_slot(
        data,
        idx,
        Slot {
            offset: new_offset as u16,
            key_len: key.len() as u16,
            cell_len: cell_len as u16,
        },
    );

    let header = PageHeader::from_bytes_mut(data)?;
    header.set_cell_count(header.cell_count() + 1);
    header.set_free_start(header.free_start() + SLOT_SIZE as u16);
    header.set_free_end(new_offset as u16);
    Ok(())
}

/// Removes the cell at slot `idx`, reclaiming its space immediately when
/// adjacent to the free region, otherwise via the fragment counter.
pub fn remove_cell(data: &mut [u8], idx: usize) -> Result<()> {
    let count = cell_count(data);
    ensure!(idx < count, "slot index {} out of bounds", idx);
    let slot = slot_at(data, idx);

    // Shift slots [idx+1..count) down by one.
    let src = slot_pos(idx + 1);
    let end = slot_pos(count);
    data.copy_within(src..end, slot_pos(idx));

    let freed = slot.cell_len as usize;
    let adjacent = {
        let header = PageHeader::from_bytes_mut(data)?;
        header.set_cell_count(header.cell_count() - 1);
        header.set_free_start(header.free_start() - SLOT_SIZE as u16);
        slot.offset == header.free_end()
    };

    if adjacent {
        let header = PageHeader::from_bytes_mut(data)?;
        header.set_free_end(header.free_end() + freed as u16);
    } else {
        let frag = PageHeader::from_bytes(data)?.frag_bytes() as usize + freed;
        if frag > u8::MAX as usize {
            compact(data);
        } else {
            PageHeader::from_bytes_mut(data)?.set_frag_bytes(frag as u8);
        }
    }
    Ok(())
}

/// Replaces the cell at `idx` (same key) with a new body. Equal-length
/// bodies are overwritten in place; otherwise the cell is reallocated.
/// The caller has verified capacity for a larger body via
/// [`room_for_replace`].
pub fn replace_cell(data: &mut [u8], idx: usize, key: &[u8], body: &[u8]) -> Result<()> {
    let slot = slot_at(data, idx);
    if slot.cell_len as usize == key.len() + body.len() {
        let start = slot.offset as usize + slot.key_len as usize;
        data[start..slot.offset as usize + slot.cell_len as usize].copy_from_slice(body);
        return Ok(());
    }
    remove_cell(data, idx)?;
    insert_cell(data, idx, key, body)
}

/// Whether replacing `idx`'s body with `new_body_len` bytes fits.
pub fn room_for_replace(data: &[u8], idx: usize, new_body_len: usize) -> bool {
    let slot = slot_at(data, idx);
    let new_cell = slot.key_len as usize + new_body_len;
    if new_cell <= slot.cell_len as usize {
        return true;
    }
    let header = PageHeader::from_bytes(data).expect("page header");
    // After removal the old cell's bytes are reclaimable (free or frag).
    header.free_space() as usize + header.frag_bytes() as usize + slot.cell_len as usize
        >= new_cell
}

/// Bytes of payload (slots + cells) currently in use.
pub fn used_bytes(data: &[u8]) -> usize {
    let header = PageHeader::from_bytes(data).expect("page header");
    let count = header.cell_count() as usize;
    let mut used = count * SLOT_SIZE;
    for idx in 0..count {
        used += slot_at(data, idx).cell_len as usize;
    }
    used
}

// ---- Interior node helpers ----------------------------------------------

pub fn child_at(data: &[u8], idx: usize) -> u32 {
    let body = body_at(data, idx);
    u32::from_le_bytes(body[..4].try_into().unwrap())
}

pub fn set_child_at(data: &mut [u8], idx: usize, child: u32) {
    let body = body_at_mut(data, idx);
    body[..4].copy_from_slice(&child.to_le_bytes());
}

/// The child to descend into for `key`: the first cell whose key is
/// strictly greater, or the right child.
pub fn find_child(data: &[u8], key: &[u8]) -> (u32, Option<usize>) {
    let count = cell_count(data);
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if key_at(data, mid) <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo < count {
        (child_at(data, lo), Some(lo))
    } else {
        (
            PageHeader::from_bytes(data)
                .expect("page header")
                .right_child(),
            None,
        )
    }
}

/// Installs the separator produced by splitting `left_child`: the left
/// half keeps keys below `sep`, `right_child` takes the rest. `slot` is
/// the position `find_child` reported for the split child.
pub fn install_separator(
    data: &mut [u8],
    sep: &[u8],
    left_child: u32,
    right_child: u32,
    slot: Option<usize>,
) -> Result<()> {
    match slot {
        Some(idx) => {
            insert_cell(data, idx, sep, &left_child.to_le_bytes())?;
            set_child_at(data, idx + 1, right_child);
        }
        None => {
            let count = cell_count(data);
            insert_cell(data, count, sep, &left_child.to_le_bytes())?;
            PageHeader::from_bytes_mut(data)?.set_right_child(right_child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{PageHeader, PageType};

    const PAGE_SIZE: usize = 4096;

    fn empty_leaf() -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        PageHeader::new(PageType::BTreeLeaf, PAGE_SIZE)
            .write_to(&mut data)
            .unwrap();
        data
    }

    fn empty_interior() -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        PageHeader::new(PageType::BTreeInterior, PAGE_SIZE)
            .write_to(&mut data)
            .unwrap();
        data
    }

    fn insert_sorted(data: &mut [u8], key: &[u8], body: &[u8]) {
        let idx = find_key(data, key).unwrap_err();
        insert_cell(data, idx, key, body).unwrap();
    }

    #[test]
    fn insert_and_find_in_order() {
        let mut page = empty_leaf();
        for key in [b"banana".as_ref(), b"apple", b"cherry"] {
            insert_sorted(&mut page, key, b"v");
        }
        assert_eq!(cell_count(&page), 3);
        assert_eq!(key_at(&page, 0), b"apple");
        assert_eq!(key_at(&page, 1), b"banana");
        assert_eq!(key_at(&page, 2), b"cherry");
        assert_eq!(find_key(&page, b"banana"), Ok(1));
        assert_eq!(find_key(&page, b"blueberry"), Err(2));
    }

    #[test]
    fn bodies_are_preserved() {
        let mut page = empty_leaf();
        insert_sorted(&mut page, b"k1", b"first");
        insert_sorted(&mut page, b"k2", b"second");
        assert_eq!(body_at(&page, 0), b"first");
        assert_eq!(body_at(&page, 1), b"second");
    }

    #[test]
    fn remove_reclaims_adjacent_space() {
        let mut page = empty_leaf();
        insert_sorted(&mut page, b"a", b"1111");
        insert_sorted(&mut page, b"b", b"2222");
        let free_before = free_space(&page);

        // "b" was inserted last, so its cell sits at free_end.
        remove_cell(&mut page, 1).unwrap();
        assert_eq!(cell_count(&page), 1);
        assert!(free_space(&page) > free_before);
    }

    #[test]
    fn remove_middle_fragments_then_compacts() {
        let mut page = empty_leaf();
        insert_sorted(&mut page, b"a", b"xxxx");
        insert_sorted(&mut page, b"b", b"yyyy");
        insert_sorted(&mut page, b"c", b"zzzz");

        // "a"'s cell is not adjacent to free_end.
        remove_cell(&mut page, 0).unwrap();
        let header = PageHeader::from_bytes(&page).unwrap();
        assert!(header.frag_bytes() > 0);

        compact(&mut page);
        let header = PageHeader::from_bytes(&page).unwrap();
        assert_eq!(header.frag_bytes(), 0);
        assert_eq!(key_at(&page, 0), b"b");
        assert_eq!(body_at(&page, 1), b"zzzz");
    }

    #[test]
    fn replace_in_place_and_resized() {
        let mut page = empty_leaf();
        insert_sorted(&mut page, b"k", b"aaaa");
        replace_cell(&mut page, 0, b"k", b"bbbb").unwrap();
        assert_eq!(body_at(&page, 0), b"bbbb");

        replace_cell(&mut page, 0, b"k", b"longer-body").unwrap();
        assert_eq!(body_at(&page, 0), b"longer-body");
        assert_eq!(cell_count(&page), 1);
    }

    #[test]
    fn fill_page_until_room_runs_out() {
        let mut page = empty_leaf();
        let body = vec![0u8; 64];
        let mut inserted = 0;
        loop {
            let key = format!("key-{:05}", inserted).into_bytes();
            if !has_room(&page, key.len(), body.len()) {
                break;
            }
            insert_sorted(&mut page, &key, &body);
            inserted += 1;
        }
        assert!(inserted > 40);
        assert_eq!(cell_count(&page), inserted);
        // Everything is still findable.
        for i in 0..inserted {
            let key = format!("key-{:05}", i).into_bytes();
            assert!(find_key(&page, &key).is_ok());
        }
    }

    #[test]
    fn interior_child_navigation() {
        let mut page = empty_interior();
        // children: [10) -> 1, [10,20) -> 2, [20,..) -> 3
        insert_cell(&mut page, 0, b"10", &1u32.to_le_bytes()).unwrap();
        insert_cell(&mut page, 1, b"20", &2u32.to_le_bytes()).unwrap();
        PageHeader::from_bytes_mut(&mut page)
            .unwrap()
            .set_right_child(3);

        assert_eq!(find_child(&page, b"05"), (1, Some(0)));
        assert_eq!(find_child(&page, b"10"), (2, Some(1)));
        assert_eq!(find_child(&page, b"15"), (2, Some(1)));
        assert_eq!(find_child(&page, b"20"), (3, None));
        assert_eq!(find_child(&page, b"99"), (3, None));
    }

    #[test]
    fn install_separator_mid_and_right() {
        let mut page = empty_interior();
        insert_cell(&mut page, 0, b"m", &5u32.to_le_bytes()).unwrap();
        PageHeader::from_bytes_mut(&mut page)
            .unwrap()
            .set_right_child(9);

        // Split child 5 (covers keys < "m") at separator "g" into 5 | 12.
        install_separator(&mut page, b"g", 5, 12, Some(0)).unwrap();
        assert_eq!(key_at(&page, 0), b"g");
        assert_eq!(child_at(&page, 0), 5);
        assert_eq!(key_at(&page, 1), b"m");
        assert_eq!(child_at(&page, 1), 12);

        // Split the right child 9 at "t" into 9 | 20.
        install_separator(&mut page, b"t", 9, 20, None).unwrap();
        assert_eq!(key_at(&page, 2), b"t");
        assert_eq!(child_at(&page, 2), 9);
        assert_eq!(
            PageHeader::from_bytes(&page).unwrap().right_child(),
            20
        );
    }

    #[test]
    fn used_bytes_accounts_slots_and_cells() {
        let mut page = empty_leaf();
        insert_sorted(&mut page, b"ab", b"cdef");
        assert_eq!(used_bytes(&page), SLOT_SIZE + 6);
    }
}
