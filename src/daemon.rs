//! The log write daemon.
//!
//! Its only job is to move released log blocks to disk. In steady state
//! new blocks are released during every write, keeping it busy; whenever
//! the log is fully durable it sleeps on its own condition variable. At
//! clean shutdown it exits only after everything has reached disk and a
//! final durable mark has been persisted. Failures here are fail-stop:
//! the daemon has nobody to return an error to, and a log that cannot be
//! written cannot be allowed to keep accepting commits.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_epoch::pin;
use log::{debug, error, trace};

use crate::block::MIN_LOG_BLOCK_SIZE;
use crate::segment::{Segment, NUM_LOG_SEGMENTS};
use crate::wal::LogCore;

fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    file.write_all_at(buf, offset)
}

fn die(msg: std::fmt::Arguments<'_>) -> ! {
    error!("{}", msg);
    std::process::abort();
}

/// Persist `durable` as the new on-disk durable mark. The mark claims
/// everything below it is on disk, so the active segment is synced first.
fn persist_mark(
    core: &LogCore,
    durable_sid: &Arc<Segment>,
    active: &File,
    durable: u64,
) {
    if let Err(e) = active.sync_all() {
        die(format_args!(
            "unable to sync log segment {}: {}",
            durable_sid.segnum, e
        ));
    }
    let lsn = durable_sid.make_lsn(durable);
    if let Err(e) = core.store.update_durable_mark(lsn) {
        die(format_args!("unable to persist durable mark {}: {}", lsn, e));
    }
}

pub(crate) fn run(core: &Arc<LogCore>) {
    let store = &core.store;

    let dlsn = store.durable_mark();
    let mut durable_sid = store
        .segment(dlsn.segment())
        .expect("durable mark names an uninstalled segment");
    debug_assert_eq!(core.durable_lsn_offset.load(SeqCst), dlsn.offset());
    let mut durable_byte = durable_sid.buf_offset(dlsn.offset());
    let mut active = match store.open_for_write(&durable_sid) {
        Ok(file) => file,
        Err(e) => die(format_args!(
            "unable to open log segment {} for writing: {}",
            durable_sid.segnum, e
        )),
    };
    let mut last_mark = Instant::now();
    debug!("log write daemon starting at {}", dlsn);

    let mut guard = pin();
    loop {
        // a quiescent point: nothing observed in earlier rounds is still
        // held, so the block list may reclaim behind us
        guard.repin();

        // publish the durable mark if it is due: either someone is
        // waiting on it, or the periodic timer has elapsed
        let durable = core.durable_lsn_offset.load(SeqCst);
        let dmark = store.durable_mark().offset();
        let can_update = dmark < durable;
        let want_update =
            dmark < core.daemon.waiting_for_dmark.load(SeqCst);
        if can_update
            && (want_update || last_mark.elapsed() >= core.config.mark_interval)
        {
            persist_mark(core, &durable_sid, &active, durable);
            last_mark = Instant::now();
            if want_update {
                let _mx = core.daemon.mutex.lock();
                core.daemon.write_complete.notify_all();
            }
        }

        // Find the oldest live allocation. Everything older than it has
        // been released (in whatever order) and may be written out. Dead
        // nodes ahead of it are unlinked along the way.
        core.block_list.collect(&guard);
        let cur_offset = core.block_list.newest(&guard).next_lsn_offset();
        let oldest_offset = core
            .block_list
            .oldest_live(&guard)
            .map(|n| n.lsn_offset())
            .unwrap_or(cur_offset);
        let durable = core.durable_lsn_offset.load(SeqCst);

        if oldest_offset == durable {
            // nothing to write out
            let mut mx = core.daemon.mutex.lock();

            // before blocking: did somebody ask for a durable mark we
            // are able to publish right now?
            let dmark = store.durable_mark().offset();
            let waiting_for_dmark =
                core.daemon.waiting_for_dmark.load(SeqCst);
            if dmark < waiting_for_dmark && waiting_for_dmark <= durable {
                continue;
            }

            core.daemon.write_complete.notify_all();

            if durable == cur_offset
                && core.daemon.should_stop.load(SeqCst)
            {
                if dmark < durable {
                    persist_mark(core, &durable_sid, &active, durable);
                }

                // The log has drained. Push a probe so the kill check is
                // atomic against racing pushes: if the probe is still the
                // newest node, nobody slipped in and the list dies with
                // it.
                let probe = core
                    .block_list
                    .push_with(
                        |prev| {
                            let o = prev.next_lsn_offset();
                            (o, o)
                        },
                        &guard,
                    )
                    .expect("block list killed while the daemon still ran");

                if probe.lsn_offset() == oldest_offset {
                    if core.block_list.remove_and_kill(probe, &guard) {
                        let stranded_durable =
                            core.daemon.waiting_for_durable.load(SeqCst);
                        let stranded_dmark =
                            core.daemon.waiting_for_dmark.load(SeqCst);
                        if durable < stranded_durable {
                            die(format_args!(
                                "thread(s) waiting for durable offset {} \
                                 past the end of the log at shutdown",
                                stranded_durable
                            ));
                        }
                        if durable < stranded_dmark {
                            die(format_args!(
                                "thread(s) waiting for a durable mark at {} \
                                 past the end of the log at shutdown",
                                stranded_dmark
                            ));
                        }
                        core.daemon.write_complete.notify_all();
                        debug!("log write daemon exiting at offset {}", durable);
                        return;
                    }
                    // a push raced in; fall out and deal with it
                } else {
                    core.block_list.remove_fast(probe, &guard);
                }
            }

            // Wait for a kick; spurious wakeups are fine. The wait is
            // bounded by the mark interval so the periodic durable-mark
            // publication still happens on an otherwise idle log.
            core.daemon.wait_count.fetch_add(1, SeqCst);
            let _ = core
                .daemon
                .daemon_wakeup
                .wait_for(&mut mx, core.config.mark_interval);
            continue;
        }

        // We have some amount of data to write out, possibly spanning
        // multiple segments. Finish each segment before moving on.
        while core.durable_lsn_offset.load(SeqCst) < oldest_offset {
            let durable = core.durable_lsn_offset.load(SeqCst);

            let (new_sid, new_offset, new_byte) = if durable_sid.end_offset
                < oldest_offset + MIN_LOG_BLOCK_SIZE
            {
                // The flush target is at or beyond this segment's red
                // zone: no block can begin there, so whatever landed past
                // it has already forced the successor into existence. Its
                // byte_offset pins down where this segment's contents
                // truly end.
                let slot = (durable_sid.segnum + 1) % NUM_LOG_SEGMENTS;
                match store.segment(slot) {
                    Some(sid) => {
                        let offset = sid.start_offset;
                        let byte = sid.byte_offset;
                        (sid, offset, byte)
                    }
                    None => {
                        // the installing thread holds its range but has
                        // not reached the segment manager yet
                        trace!(
                            "successor of segment {} not yet visible",
                            durable_sid.segnum
                        );
                        std::thread::yield_now();
                        break;
                    }
                }
            } else {
                (
                    durable_sid.clone(),
                    oldest_offset,
                    durable_sid.buf_offset(oldest_offset),
                )
            };

            assert_eq!(durable_byte, core.buf.read_begin());
            assert!(durable_byte < new_byte);

            // Insertions don't advance the window's writer frontier
            // because they complete out of order; do it for them now that
            // the safe bound is known.
            core.buf.advance_writer(new_byte);

            let nbytes = (new_byte - durable_byte) as usize;
            let data = core.buf.read_buf(durable_byte, nbytes);
            let file_offset = durable_sid.file_offset(durable);
            trace!(
                "writing log offsets {}..{} to segment {} at file offset {}",
                durable,
                new_offset,
                durable_sid.segnum,
                file_offset,
            );
            if let Err(e) = pwrite_all(&active, data, file_offset) {
                die(format_args!(
                    "incomplete log write to segment {}: {}",
                    durable_sid.segnum, e
                ));
            }
            core.buf.advance_reader(new_byte);

            if !Arc::ptr_eq(&new_sid, &durable_sid) {
                // segment change: retire the old file only once its
                // contents are truly down
                if let Err(e) = active.sync_all() {
                    die(format_args!(
                        "unable to sync log segment {}: {}",
                        durable_sid.segnum, e
                    ));
                }
                active = match store.open_for_write(&new_sid) {
                    Ok(file) => file,
                    Err(e) => die(format_args!(
                        "unable to open log segment {} for writing: {}",
                        new_sid.segnum, e
                    )),
                };
                debug!(
                    "log writer rotated from segment {} to segment {}",
                    durable_sid.segnum, new_sid.segnum
                );
            }

            {
                let _mx = core.daemon.mutex.lock();
                core.durable_lsn_offset.store(new_offset, SeqCst);
                if durable < core.daemon.waiting_for_durable.load(SeqCst) {
                    core.daemon.write_complete.notify_all();
                }
            }

            durable_sid = new_sid;
            durable_byte = new_byte;
        }
    }
}
