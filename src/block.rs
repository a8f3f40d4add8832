//! The in-buffer layout of a log block.
//!
//! A block is the unit the allocator hands out: a fixed header, `nrec + 1`
//! record slots, then the payload region. The final slot is always a skip
//! record naming the offset at which the next block begins, so recovery can
//! walk the log without consulting any other structure. Block memory is a
//! slice of the log window, never heap.

use crate::LsnOffset;

/// Payload lengths passed to `allocate` must be a multiple of this.
pub const LOG_ALIGN: usize = 16;

/// Length of the fixed block header: checksum, record count, LSN offset.
pub const BLOCK_HEADER_LEN: usize = 16;

/// Length of one record slot.
pub const RECORD_SLOT_LEN: usize = 24;

/// The smallest possible block: a bare header plus its skip record.
/// No valid block can begin closer than this to the end of a segment.
pub const MIN_LOG_BLOCK_SIZE: u64 = (BLOCK_HEADER_LEN + RECORD_SLOT_LEN) as u64;

/// A byte used to disambiguate record slot types.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RecordKind {
    /// The slot's sole content is the offset where the next block begins.
    Skip = 0,
    /// A caller-filled record slot.
    Payload = 1,
}

impl RecordKind {
    pub(crate) const fn into(self) -> u8 {
        self as u8
    }
}

/// Number of bytes a block with `nrec` records and `payload_bytes` of
/// payload occupies in the log, including its trailing skip record.
pub const fn block_size(nrec: u32, payload_bytes: usize) -> u64 {
    (BLOCK_HEADER_LEN + RECORD_SLOT_LEN * (nrec as usize + 1) + payload_bytes)
        as u64
}

const fn slot_base(i: u32) -> usize {
    BLOCK_HEADER_LEN + RECORD_SLOT_LEN * i as usize
}

/// Offset of the payload region inside a block with `nrec` records.
pub const fn payload_base(nrec: u32) -> usize {
    slot_base(nrec + 1)
}

/// Offset of record slot `i` inside a block.
pub const fn record_base(i: u32) -> usize {
    slot_base(i)
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

pub(crate) fn get_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

/// Record count stored in a block image.
pub fn nrec_of(buf: &[u8]) -> u32 {
    get_u32(buf, 4)
}

/// LSN offset stored in a block image.
pub fn lsn_offset_of(buf: &[u8]) -> LsnOffset {
    get_u64(buf, 8)
}

/// Offset where the block after this one begins, taken from the skip slot.
pub fn skip_target_of(buf: &[u8]) -> LsnOffset {
    let nrec = nrec_of(buf);
    get_u64(buf, slot_base(nrec) + 8)
}

fn fill_skip_slot(buf: &mut [u8], slot: u32, next_offset: LsnOffset, payload_end: u32) {
    let base = slot_base(slot);
    buf[base..base + RECORD_SLOT_LEN].fill(0);
    buf[base] = RecordKind::Skip.into();
    put_u32(buf, base + 4, payload_end);
    put_u64(buf, base + 8, next_offset);
}

/// Lay down a fresh block header over freshly reserved window bytes:
/// record count, LSN offset, and the trailing skip record pointing at
/// `next_offset`. Record slots and the checksum are zeroed; the caller
/// fills the record slots and payload before releasing, and `seal` stamps
/// the checksum.
pub(crate) fn init_block(
    buf: &mut [u8],
    lsn_offset: LsnOffset,
    nrec: u32,
    next_offset: LsnOffset,
    payload_bytes: usize,
) {
    assert!(buf.len() >= block_size(nrec, payload_bytes) as usize);
    put_u32(buf, 0, 0);
    put_u32(buf, 4, nrec);
    put_u64(buf, 8, lsn_offset);
    for i in 0..nrec {
        let base = slot_base(i);
        buf[base..base + RECORD_SLOT_LEN].fill(0);
        buf[base] = RecordKind::Payload.into();
    }
    fill_skip_slot(buf, nrec, next_offset, payload_bytes as u32);
}

/// Rewrite a block in place into a minimal valid skip block: move the
/// trailing skip record to slot 0, zero its payload-end pointer, and drop
/// the record count to zero. The block still occupies its full extent in
/// the log; recovery reads the skip and jumps past it.
pub(crate) fn rewrite_as_skip(buf: &mut [u8]) {
    let nrec = nrec_of(buf);
    let target = get_u64(buf, slot_base(nrec) + 8);
    fill_skip_slot(buf, 0, target, 0);
    put_u32(buf, 4, 0);
}

/// Stamp the block checksum: a crc32 of everything after the checksum
/// field itself.
pub(crate) fn seal(buf: &mut [u8]) {
    let crc = crc32fast::hash(&buf[4..]);
    put_u32(buf, 0, crc);
}

/// Recompute and compare the stored checksum.
pub fn verify(buf: &[u8]) -> bool {
    get_u32(buf, 0) == crc32fast::hash(&buf[4..])
}
