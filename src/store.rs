//! A file-backed segment store: fixed-size segments installed on demand,
//! each backed by one file, plus a small checksummed file holding the
//! durable mark for recovery to find the tail of the log.
//!
//! This is a deliberately simple stand-in for a full recovery manager: it
//! trusts the durable mark rather than scanning segment contents, and it
//! never reclaims segments.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::block::MIN_LOG_BLOCK_SIZE;
use crate::segment::{
    Lsn, Segment, SegmentAssignment, SegmentStore, NUM_LOG_SEGMENTS,
};
use crate::{Error, LsnOffset, Result};

const MARK_FILE: &str = "durable.mark";
const MARK_MAGIC: u32 = 0x574d_524b;
const MARK_LEN: usize = 28;

pub struct DirStore {
    dir: PathBuf,
    segment_size: u64,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    /// Installed segments, oldest to newest. Slot numbers cycle modulo
    /// `NUM_LOG_SEGMENTS`; lookups by slot resolve to the newest match.
    segments: Vec<Arc<Segment>>,
    durable_mark: Lsn,
}

impl StoreInner {
    fn install_successor(
        &mut self,
        prev: &Arc<Segment>,
        start: LsnOffset,
        segment_size: u64,
    ) -> Arc<Segment> {
        // buffer space continues exactly where the predecessor's contents
        // stop; the dead zone (if any) occupies LSN space only
        let used = start.min(prev.end_offset) - prev.start_offset;
        let seg = Arc::new(Segment {
            segnum: (prev.segnum + 1) % NUM_LOG_SEGMENTS,
            start_offset: start,
            end_offset: start + segment_size,
            byte_offset: prev.byte_offset + used,
        });
        debug!(
            "installing log segment {} at offset {}",
            seg.segnum, seg.start_offset
        );
        self.segments.push(seg.clone());
        seg
    }
}

impl DirStore {
    pub fn open<P: AsRef<Path>>(dir: P, segment_size: u64) -> Result<DirStore> {
        assert!(
            segment_size >= 4 * MIN_LOG_BLOCK_SIZE,
            "segment size {} is too small to hold log blocks",
            segment_size,
        );
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let (initial, mark) = match read_mark(&dir.join(MARK_FILE))? {
            Some((segnum, seg_start, offset)) => {
                let seg = Arc::new(Segment {
                    segnum,
                    start_offset: seg_start,
                    end_offset: seg_start + segment_size,
                    byte_offset: 0,
                });
                if offset < seg.start_offset || offset > seg.end_offset {
                    return Err(Error::Corruption { at: 0 });
                }
                debug!("recovered durable mark {}.{}", segnum, offset);
                (seg, Lsn::new(segnum, offset))
            }
            None => {
                let seg = Arc::new(Segment {
                    segnum: 0,
                    start_offset: 0,
                    end_offset: segment_size,
                    byte_offset: 0,
                });
                (seg, Lsn::new(0, 0))
            }
        };

        Ok(DirStore {
            dir,
            segment_size,
            inner: Mutex::new(StoreInner {
                segments: vec![initial],
                durable_mark: mark,
            }),
        })
    }

    fn segment_path(&self, segment: &Segment) -> PathBuf {
        self.dir.join(format!("log-{:016x}", segment.start_offset))
    }
}

impl SegmentStore for DirStore {
    fn durable_mark(&self) -> Lsn {
        self.inner.lock().durable_mark
    }

    fn segment(&self, segnum: u32) -> Option<Arc<Segment>> {
        let inner = self.inner.lock();
        inner
            .segments
            .iter()
            .rev()
            .find(|s| s.segnum == segnum)
            .cloned()
    }

    fn assign_segment(&self, lo: LsnOffset, hi: LsnOffset) -> SegmentAssignment {
        let mut inner = self.inner.lock();

        // newest-first: after a segment change, most traffic lands in the
        // youngest segment
        for idx in (0..inner.segments.len()).rev() {
            let sid = &inner.segments[idx];
            if sid.start_offset > lo
                || lo + MIN_LOG_BLOCK_SIZE > sid.end_offset
            {
                continue;
            }
            let sid = sid.clone();
            if hi <= sid.end_offset {
                let next_lsn = sid.make_lsn(hi);
                return SegmentAssignment {
                    segment: Some(sid),
                    next_lsn,
                    full_size: true,
                };
            }
            // the range straddles the segment end: whoever owns it closes
            // the segment, and the successor begins at the range's end
            let succ = match inner.segments.get(idx + 1).cloned() {
                Some(s) => s,
                None => {
                    inner.install_successor(&sid, hi, self.segment_size)
                }
            };
            return SegmentAssignment {
                segment: Some(sid),
                next_lsn: succ.make_lsn(succ.start_offset),
                full_size: false,
            };
        }

        let newest = inner.segments.last().expect("no segments installed").clone();
        if lo < newest.start_offset {
            // the range begins between two segments: it has no physical
            // home and must be discarded by the caller
            let next_lsn = newest.make_lsn(newest.start_offset);
            return SegmentAssignment {
                segment: None,
                next_lsn,
                full_size: false,
            };
        }

        // past the usable end of everything installed: this range is the
        // first of a new segment, which begins exactly where it does
        let succ = inner.install_successor(&newest, lo, self.segment_size);
        debug_assert!(hi <= succ.end_offset);
        let next_lsn = succ.make_lsn(hi);
        SegmentAssignment {
            segment: Some(succ),
            next_lsn,
            full_size: true,
        }
    }

    fn update_durable_mark(&self, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        let seg_start = inner
            .segments
            .iter()
            .rev()
            .find(|s| s.segnum == lsn.segment())
            .map(|s| s.start_offset)
            .ok_or(Error::ReportableBug(
                "durable mark names an uninstalled segment",
            ))?;

        let mut buf = [0_u8; MARK_LEN];
        buf[0..4].copy_from_slice(&MARK_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&lsn.segment().to_le_bytes());
        buf[8..16].copy_from_slice(&seg_start.to_le_bytes());
        buf[16..24].copy_from_slice(&lsn.offset().to_le_bytes());
        let crc = crc32fast::hash(&buf[0..24]);
        buf[24..28].copy_from_slice(&crc.to_le_bytes());

        let path = self.dir.join(MARK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        use std::io::Write;
        (&file).write_all(&buf)?;
        file.sync_all()?;

        debug!("persisted durable mark {}", lsn);
        inner.durable_mark = lsn;
        Ok(())
    }

    fn open_for_write(&self, segment: &Segment) -> Result<File> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.segment_path(segment))?;
        file.set_len(self.segment_size)?;
        Ok(file)
    }
}

fn read_mark(path: &Path) -> Result<Option<(u32, u64, u64)>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    };
    if data.len() != MARK_LEN {
        return Err(Error::Corruption { at: 0 });
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let crc = u32::from_le_bytes(data[24..28].try_into().unwrap());
    if magic != MARK_MAGIC || crc != crc32fast::hash(&data[0..24]) {
        return Err(Error::Corruption { at: 0 });
    }
    let segnum = u32::from_le_bytes(data[4..8].try_into().unwrap());
    let seg_start = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let offset = u64::from_le_bytes(data[16..24].try_into().unwrap());
    Ok(Some((segnum, seg_start, offset)))
}
