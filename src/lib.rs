//! `walcore` is the allocation and durability core of a write-ahead log:
//! lock-free LSN range issuance for concurrent writers, a bounded
//! in-memory window over the log's tail, and a single daemon thread that
//! retires released bytes to on-disk segment files while publishing a
//! durable watermark that commit paths can wait on.
//!
//! ```no_run
//! let wal = walcore::Config::new()
//!     .path("wal")
//!     .segment_size(1024 * 1024)
//!     .buffer_size(64 * 1024)
//!     .open()
//!     .unwrap();
//!
//! let mut block = wal.allocate(1, 64);
//! block.payload_mut().fill(7);
//! let end = block.next_lsn_offset();
//! block.release();
//!
//! wal.wait_for_durable(end);
//! ```

mod block;
mod block_list;
mod config;
mod daemon;
mod debug_delay;
mod result;
mod ring;
mod segment;
mod store;
mod wal;

pub use crate::block::{
    block_size, lsn_offset_of, nrec_of, payload_base, record_base,
    skip_target_of, verify, RecordKind, BLOCK_HEADER_LEN, LOG_ALIGN,
    MIN_LOG_BLOCK_SIZE, RECORD_SLOT_LEN,
};
pub use crate::config::Config;
pub use crate::result::{Error, Result};
pub use crate::segment::{
    Lsn, Segment, SegmentAssignment, SegmentStore, NUM_LOG_SEGMENTS,
};
pub use crate::store::DirStore;
pub use crate::wal::{LogAllocation, Wal};

pub(crate) use crate::debug_delay::debug_delay;

/// A 64-bit monotonically increasing byte position spanning the entire
/// log history. Never reused, never decreasing.
pub type LsnOffset = u64;
