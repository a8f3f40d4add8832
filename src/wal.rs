//! The allocation manager: hands out contiguous LSN ranges backed by
//! window space, tracks their release, and coordinates durability waits
//! with the write daemon.

use std::ptr::NonNull;
use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::SeqCst,
};
use std::sync::Arc;
use std::thread;

use crossbeam_epoch::pin;
use crossbeam_utils::CachePadded;
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::block::{self, block_size, LOG_ALIGN, RECORD_SLOT_LEN};
use crate::block_list::{BlockList, BlockNode};
use crate::config::Config;
use crate::ring::LogBuffer;
use crate::segment::{Lsn, SegmentStore};
use crate::{daemon, Error, LsnOffset, Result};

/// Coordination state shared between clients and the write daemon. The
/// wait sentinels are monotone high-water marks, not counts: many waiters'
/// targets collapse into a single value the daemon compares against.
/// They are only mutated while the daemon mutex is held.
pub(crate) struct DaemonState {
    pub(crate) mutex: Mutex<()>,
    /// Signals durable (and durable-mark) progress to waiting clients.
    pub(crate) write_complete: Condvar,
    /// Wakes the daemon itself.
    pub(crate) daemon_wakeup: Condvar,
    /// Highest offset any client is waiting to see become durable.
    pub(crate) waiting_for_durable: AtomicU64,
    /// Highest offset any client is waiting to see in the on-disk mark.
    pub(crate) waiting_for_dmark: AtomicU64,
    pub(crate) wait_count: AtomicU64,
    pub(crate) kick_count: AtomicU64,
    pub(crate) should_stop: AtomicBool,
}

pub(crate) struct LogCore {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn SegmentStore>,
    pub(crate) buf: LogBuffer,
    pub(crate) block_list: BlockList,
    pub(crate) durable_lsn_offset: CachePadded<AtomicU64>,
    pub(crate) daemon: DaemonState,
}

impl LogCore {
    /// Wake the write daemon if it happens to be asleep.
    ///
    /// Caller must hold the daemon mutex.
    pub(crate) fn kick_write_daemon(&self) {
        let d = &self.daemon;
        if d.kick_count.load(SeqCst) < d.wait_count.load(SeqCst) {
            d.kick_count.fetch_add(1, SeqCst);
            d.daemon_wakeup.notify_one();
        }
    }
}

/// The log allocation and durability core.
///
/// Any number of threads may call [`allocate`](Wal::allocate) /
/// [`wait_for_durable`](Wal::wait_for_durable) concurrently; one internal
/// daemon thread moves released bytes to the segment files. Dropping the
/// `Wal` drains the log completely, persists a final durable mark, and
/// joins the daemon. It is the caller's responsibility that no new
/// allocations are attempted once the drop has begun.
pub struct Wal {
    core: Arc<LogCore>,
    daemon: Option<thread::JoinHandle<()>>,
}

impl Wal {
    /// Start the core over `store`, beginning at its recovered durable
    /// mark.
    pub fn start(config: Config, store: Arc<dyn SegmentStore>) -> Result<Wal> {
        let dmark = store.durable_mark();
        let sid = store.segment(dmark.segment()).ok_or(Error::ReportableBug(
            "the durable mark names an uninstalled segment",
        ))?;
        let start_byte = sid.buf_offset(dmark.offset());
        let buf = LogBuffer::new(config.buffer_size, start_byte)?;
        debug!("starting log core at {}", dmark);

        let core = Arc::new(LogCore {
            store,
            buf,
            block_list: BlockList::new(dmark.offset()),
            durable_lsn_offset: CachePadded::new(AtomicU64::new(
                dmark.offset(),
            )),
            daemon: DaemonState {
                mutex: Mutex::new(()),
                write_complete: Condvar::new(),
                daemon_wakeup: Condvar::new(),
                waiting_for_durable: AtomicU64::new(0),
                waiting_for_dmark: AtomicU64::new(0),
                wait_count: AtomicU64::new(0),
                kick_count: AtomicU64::new(0),
                should_stop: AtomicBool::new(false),
            },
            config,
        });

        let daemon = thread::Builder::new()
            .name("walcore-writer".to_owned())
            .spawn({
                let core = core.clone();
                move || daemon::run(&core)
            })?;

        Ok(Wal { core, daemon: Some(daemon) })
    }

    /// The offset one past the newest allocated range: where the next
    /// allocation will begin.
    pub fn cur_lsn_offset(&self) -> LsnOffset {
        let guard = pin();
        self.core.block_list.newest(&guard).next_lsn_offset()
    }

    /// The durable watermark: every byte below it has reached disk.
    pub fn dur_lsn_offset(&self) -> LsnOffset {
        self.core.durable_lsn_offset.load(SeqCst)
    }

    /// Allocate a block with `nrec` record slots and `payload_bytes` of
    /// payload. Returns an owned block the caller must terminate with
    /// exactly one of [`release`](LogAllocation::release) or
    /// [`discard`](LogAllocation::discard); an unterminated allocation is
    /// discarded when dropped.
    ///
    /// May block waiting for window space, and only for that.
    ///
    /// # Panics
    ///
    /// Panics if called after shutdown has begun, and aborts the process
    /// if the allocation protocol is interrupted after an LSN range has
    /// been advertised: abandoning the range would leave a hole that
    /// truncates the log.
    pub fn allocate(&self, nrec: u32, payload_bytes: usize) -> LogAllocation<'_> {
        assert_eq!(
            payload_bytes % LOG_ALIGN,
            0,
            "payload length {} is not a multiple of the {}-byte alignment quantum",
            payload_bytes,
            LOG_ALIGN,
        );
        let core = &*self.core;
        let nbytes = block_size(nrec, payload_bytes);
        assert!(
            nbytes <= core.config.segment_size,
            "a {}-byte block cannot fit in a {}-byte segment",
            nbytes,
            core.config.segment_size,
        );
        assert!(
            nbytes <= core.buf.window_size(),
            "a {}-byte block cannot fit in a {}-byte log window",
            nbytes,
            core.buf.window_size(),
        );

        loop {
            // Join the block list to obtain an LSN range. All we learn
            // here is the range; which segment (if any) holds it comes
            // next. This step never blocks.
            let node: NonNull<BlockNode> = {
                let guard = pin();
                let node = core
                    .block_list
                    .push_with(
                        |prev| {
                            let lo = prev.next_lsn_offset();
                            (lo, lo + nbytes)
                        },
                        &guard,
                    )
                    .unwrap_or_else(|| {
                        panic!("log allocation attempted after shutdown")
                    });
                NonNull::from(node)
            };
            // Live nodes are never unlinked or reclaimed, so the
            // reference stays valid without an epoch pin until the node
            // is released.
            let node_ref = unsafe { node.as_ref() };
            // We now advertise this range to the rest of the system. If
            // anything interrupts the protocol before the block commits,
            // the bytes at an already-advertised range stay undefined,
            // which recovery would read as the end of the log. Fail stop
            // instead.
            let mut commit_guard = CommitGuard { armed: true };

            let lo = node_ref.lsn_offset();
            let hi = node_ref.next_lsn_offset();

            let rval = core.store.assign_segment(lo, hi);
            let sid = match rval.segment {
                Some(ref sid) => sid.clone(),
                None => {
                    // The range lies between two segments: we lost a
                    // segment-install race and the range has no physical
                    // location. Nothing was written anywhere, so plain
                    // removal is safe here.
                    trace!("range {}..{} fell in a dead zone; retrying", lo, hi);
                    commit_guard.disarm();
                    let guard = pin();
                    core.block_list.remove_fast(node_ref, &guard);
                    continue;
                }
            };
            let lsn = sid.make_lsn(lo);

            let (eff_nbytes, eff_nrec, eff_payload) = if rval.full_size {
                (nbytes, nrec, payload_bytes)
            } else {
                // The block straddles the segment end. It shrinks to an
                // empty block covering the remainder of the segment, and
                // we go around again for the real one.
                let newsz = sid.end_offset - lo;
                assert!(newsz < nbytes);
                (newsz, 0, 0)
            };

            // Claim window space, waiting out backpressure. Unconsumed
            // window bytes are just not-yet-durable log, so the wait
            // target is whichever durable offset frees our span. The
            // byte mapping is non-linear across segment boundaries, so
            // the target may overshoot, which is harmless.
            let buf: &mut [u8] = loop {
                if let Some(buf) =
                    core.buf.write_buf(sid.buf_offset(lo), eff_nbytes as usize)
                {
                    break buf;
                }
                let needed = lo.saturating_sub(core.buf.window_size());
                trace!(
                    "log window full at {}; waiting for {} to become durable",
                    lo,
                    needed,
                );
                let mut mx = core.daemon.mutex.lock();
                core.daemon.waiting_for_durable.fetch_max(needed, SeqCst);
                core.kick_write_daemon();
                core.daemon.write_complete.wait(&mut mx);
            };

            if !rval.full_size {
                buf.fill(0);
            }
            block::init_block(
                buf,
                lo,
                eff_nrec,
                rval.next_lsn.offset(),
                eff_payload,
            );
            commit_guard.disarm();

            let allocation = LogAllocation {
                core,
                node,
                buf,
                lsn,
                nrec: eff_nrec,
                done: false,
            };
            if !rval.full_size {
                allocation.discard();
                continue;
            }
            return allocation;
        }
    }

    /// Block until everything below `offset` is durable.
    pub fn wait_for_durable(&self, offset: LsnOffset) {
        let core = &*self.core;
        while self.dur_lsn_offset() < offset {
            let mut mx = core.daemon.mutex.lock();
            core.daemon.waiting_for_durable.fetch_max(offset, SeqCst);
            core.kick_write_daemon();
            core.daemon.write_complete.wait(&mut mx);
        }
    }

    /// Block until the on-disk durable mark covers `offset`, waiting for
    /// durability itself first.
    pub fn update_durable_mark(&self, offset: LsnOffset) {
        self.wait_for_durable(offset);
        let core = &*self.core;
        while core.store.durable_mark().offset() < offset {
            let mut mx = core.daemon.mutex.lock();
            core.daemon.waiting_for_dmark.fetch_max(offset, SeqCst);
            core.kick_write_daemon();
            core.daemon.write_complete.wait(&mut mx);
        }
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        {
            let _mx = self.core.daemon.mutex.lock();
            self.core.daemon.should_stop.store(true, SeqCst);
            self.core.kick_write_daemon();
        }
        if let Some(daemon) = self.daemon.take() {
            if daemon.join().is_err() {
                error!("log write daemon panicked during shutdown");
            }
        }
    }
}

/// An owned, in-flight log block: a contiguous LSN range whose bytes live
/// in the log window. The holder fills the record slots and payload, then
/// terminates it with exactly one of `release` or `discard`; dropping an
/// unterminated allocation discards it.
pub struct LogAllocation<'a> {
    core: &'a LogCore,
    node: NonNull<BlockNode>,
    buf: &'a mut [u8],
    lsn: Lsn,
    nrec: u32,
    done: bool,
}

impl<'a> LogAllocation<'a> {
    /// The block's LSN.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// The first offset of the block's range.
    pub fn lsn_offset(&self) -> LsnOffset {
        unsafe { self.node.as_ref() }.lsn_offset()
    }

    /// One past the last offset of the block's range.
    pub fn next_lsn_offset(&self) -> LsnOffset {
        unsafe { self.node.as_ref() }.next_lsn_offset()
    }

    /// Number of caller-fillable record slots.
    pub fn nrec(&self) -> u32 {
        self.nrec
    }

    /// Caller-writable bytes of record slot `i`.
    pub fn record_mut(&mut self, i: u32) -> &mut [u8] {
        assert!(i < self.nrec);
        let base = block::record_base(i);
        &mut self.buf[base..base + RECORD_SLOT_LEN]
    }

    /// Caller-writable payload region.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let base = block::payload_base(self.nrec);
        &mut self.buf[base..]
    }

    /// Seal the block and hand it to the write daemon.
    pub fn release(mut self) {
        self.finish(false);
    }

    /// Rewrite the block in place into an empty skip block and release
    /// it. The block still occupies its LSN range on disk; recovery skips
    /// straight over it.
    pub fn discard(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, discard: bool) {
        debug_assert!(!self.done);
        self.done = true;

        if discard {
            block::rewrite_as_skip(self.buf);
        }
        block::seal(self.buf);

        let core = self.core;
        {
            let guard = pin();
            core.block_list
                .remove_fast(unsafe { self.node.as_ref() }, &guard);
        }

        // the daemon is usually already busy; be ready to give it a kick
        let d = &core.daemon;
        if d.kick_count.load(SeqCst) < d.wait_count.load(SeqCst) {
            let _mx = d.mutex.lock();
            core.kick_write_daemon();
        }
    }
}

impl<'a> Drop for LogAllocation<'a> {
    fn drop(&mut self) {
        if !self.done {
            trace!(
                "discarding unterminated log allocation at {}",
                self.lsn
            );
            self.finish(true);
        }
    }
}

/// Arms the fail-stop policy of the allocation protocol: dropping this
/// without a disarm means an advertised LSN range is being abandoned with
/// undefined contents, which would truncate the log for every committed
/// record behind it.
struct CommitGuard {
    armed: bool,
}

impl CommitGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        if self.armed {
            error!(
                "log allocation did not complete normally; terminating to \
                 avoid losing committed work"
            );
            std::process::abort();
        }
    }
}
