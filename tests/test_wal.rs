use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use quickcheck::QuickCheck;

use walcore::{
    block_size, lsn_offset_of, nrec_of, skip_target_of, verify, Config,
    DirStore, Lsn, LsnOffset, Segment, SegmentAssignment, SegmentStore, Wal,
    MIN_LOG_BLOCK_SIZE,
};

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wal_at(path: PathBuf, segment_size: u64, buffer_size: usize) -> Wal {
    Config::new()
        .path(path)
        .segment_size(segment_size)
        .buffer_size(buffer_size)
        .open()
        .unwrap()
}

#[test]
fn single_allocation() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal");
    let wal = wal_at(path.clone(), 1024, 4096);

    let mut block = wal.allocate(1, 64);
    assert_eq!(block.lsn_offset(), 0);
    assert_eq!(block.next_lsn_offset(), 128);
    assert_eq!(block.lsn(), Lsn::new(0, 0));
    block.payload_mut().fill(0xeb);
    block.release();

    wal.wait_for_durable(128);
    assert!(wal.dur_lsn_offset() >= 128);
    wal.update_durable_mark(128);

    // the bytes are on disk at the positions the segment store assigned
    let data = fs::read(path.join("log-0000000000000000")).unwrap();
    let image = &data[0..128];
    assert!(verify(image));
    assert_eq!(nrec_of(image), 1);
    assert_eq!(lsn_offset_of(image), 0);
    assert_eq!(skip_target_of(image), 128);
    assert!(data[64..128].iter().all(|b| *b == 0xeb));

    drop(wal);
    let store = DirStore::open(&path, 1024).unwrap();
    assert!(store.durable_mark().offset() >= 128);
}

#[test]
fn concurrent_allocations_partition_the_lsn_space() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let wal =
        Arc::new(wal_at(dir.path().join("wal"), 1 << 20, 1 << 16));
    let ranges = Arc::new(Mutex::new(Vec::new()));

    // sample both watermarks while the writers hammer the log
    let sampling = Arc::new(AtomicBool::new(true));
    let sampler = thread::Builder::new()
        .name("sampler".to_owned())
        .spawn({
            let wal = wal.clone();
            let sampling = sampling.clone();
            move || {
                let (mut last_cur, mut last_dur) = (0, 0);
                while sampling.load(Ordering::SeqCst) {
                    // read dur first: it can only trail the tip
                    let dur = wal.dur_lsn_offset();
                    let cur = wal.cur_lsn_offset();
                    assert!(dur <= cur);
                    assert!(cur >= last_cur, "log tip went backwards");
                    assert!(dur >= last_dur, "durable offset went backwards");
                    last_cur = cur;
                    last_dur = dur;
                    thread::yield_now();
                }
            }
        })
        .unwrap();

    let n_threads: usize = 8;
    let per_thread: usize = 100;
    let mut handles = vec![];
    for tid in 0..n_threads {
        let wal = wal.clone();
        let ranges = ranges.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("writer-{}", tid))
                .spawn(move || {
                    for i in 0..per_thread {
                        let mut block = wal.allocate(1, 64);
                        block.payload_mut().fill(tid as u8);
                        ranges.lock().unwrap().push((
                            block.lsn_offset(),
                            block.next_lsn_offset(),
                        ));
                        if i % 2 == 0 {
                            block.release();
                        } else {
                            // dropping unterminated discards, which still
                            // burns the range
                            drop(block);
                        }
                    }
                })
                .unwrap(),
        );
    }
    for h in handles {
        h.join().unwrap();
    }

    let total = (n_threads * per_thread) as u64 * 128;
    let mut ranges = Arc::try_unwrap(ranges).unwrap().into_inner().unwrap();
    ranges.sort_unstable();
    assert_eq!(ranges.len(), n_threads * per_thread);
    let mut expected = 0;
    for (lo, hi) in ranges {
        assert_eq!(lo, expected, "gap or overlap in allocated LSN space");
        assert_eq!(hi, lo + 128);
        expected = hi;
    }

    assert_eq!(wal.cur_lsn_offset(), total);
    wal.wait_for_durable(total);
    assert_eq!(wal.dur_lsn_offset(), total);

    sampling.store(false, Ordering::SeqCst);
    sampler.join().unwrap();
}

#[test]
fn segment_overflow_leaves_a_skip_block() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal");
    let wal = wal_at(path.clone(), 1024, 4096);

    // 160-byte blocks: six fit in [0, 960), the seventh straddles 1024
    for i in 0..6u64 {
        let block = wal.allocate(1, 96);
        assert_eq!(block.lsn_offset(), i * 160);
        block.release();
    }

    let block = wal.allocate(1, 96);
    assert_eq!(block.lsn_offset(), 1120);
    assert_eq!(block.next_lsn_offset(), 1280);
    assert_eq!(block.lsn(), Lsn::new(1, 1120));
    block.release();

    wal.wait_for_durable(1280);
    wal.update_durable_mark(1280);

    // the remainder of segment 0 was filled by a discarded skip-only
    // block pointing at segment 1's first record
    let data = fs::read(path.join("log-0000000000000000")).unwrap();
    let skip = &data[960..1024];
    assert!(verify(skip));
    assert_eq!(nrec_of(skip), 0);
    assert_eq!(lsn_offset_of(skip), 960);
    assert_eq!(skip_target_of(skip), 1120);

    // the regular block begins at segment 1's start offset
    let data1 = fs::read(path.join(format!("log-{:016x}", 1120))).unwrap();
    assert!(verify(&data1[0..160]));
    assert_eq!(lsn_offset_of(&data1[0..160]), 1120);

    drop(wal);
    let store = DirStore::open(&path, 1024).unwrap();
    assert_eq!(store.durable_mark().offset(), 1280);
}

#[test]
fn window_backpressure_blocks_until_the_daemon_catches_up() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let wal = Arc::new(wal_at(dir.path().join("wal"), 4096, 512));

    // wedge the daemon: it cannot retire anything while the oldest
    // allocation is still live
    let oldest = wal.allocate(1, 64);
    for _ in 0..3 {
        wal.allocate(1, 64).release();
    }
    // the window now holds [0, 512); the next block cannot fit

    let entered = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let waiter = thread::Builder::new()
        .name("blocked-writer".to_owned())
        .spawn({
            let wal = wal.clone();
            let entered = entered.clone();
            let done = done.clone();
            move || {
                entered.store(true, Ordering::SeqCst);
                let block = wal.allocate(1, 64);
                assert_eq!(block.lsn_offset(), 512);
                block.release();
                done.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();

    while !entered.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(100));
    assert!(
        !done.load(Ordering::SeqCst),
        "allocation completed while the window was exhausted"
    );

    oldest.release();
    waiter.join().unwrap();
    assert!(done.load(Ordering::SeqCst));

    wal.wait_for_durable(640);
}

#[test]
fn wait_for_durable_wakes_across_threads() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let wal = Arc::new(wal_at(dir.path().join("wal"), 1 << 20, 1 << 16));

    let waiter = thread::Builder::new()
        .name("committer".to_owned())
        .spawn({
            let wal = wal.clone();
            move || {
                wal.wait_for_durable(10_000);
                assert!(wal.dur_lsn_offset() >= 10_000);
            }
        })
        .unwrap();

    // 94 * 128 = 12032 pushes the tip past the waiter's target
    for _ in 0..94 {
        wal.allocate(1, 64).release();
    }

    waiter.join().unwrap();
}

#[test]
fn clean_shutdown_drains_and_persists_the_mark() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal");
    let wal = Config::new()
        .path(path.clone())
        .segment_size(4096)
        .buffer_size(4096)
        .mark_every_ms(10)
        .open()
        .unwrap();

    for _ in 0..50 {
        let mut block = wal.allocate(2, 32);
        block.payload_mut().fill(3);
        block.release();
    }
    let cur = wal.cur_lsn_offset();
    wal.wait_for_durable(cur);
    assert_eq!(wal.dur_lsn_offset(), cur);

    drop(wal);

    let store = DirStore::open(&path, 4096).unwrap();
    assert_eq!(store.durable_mark().offset(), cur);
}

#[test]
fn durable_mark_follows_load_without_explicit_waits() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store =
        Arc::new(DirStore::open(dir.path().join("wal"), 1 << 20).unwrap());
    let config = Config::new()
        .segment_size(1 << 20)
        .buffer_size(1 << 16)
        .mark_every_ms(20);
    let wal = Wal::start(config, store.clone()).unwrap();

    let block = wal.allocate(1, 64);
    let end = block.next_lsn_offset();
    block.release();
    wal.wait_for_durable(end);

    // nobody asked for the mark, but the periodic timer publishes it
    let deadline = Instant::now() + Duration::from_secs(2);
    while store.durable_mark().offset() < end {
        assert!(
            Instant::now() < deadline,
            "durable mark not published within its interval"
        );
        thread::sleep(Duration::from_millis(5));
    }
}

/// A scripted segment store reproducing the install-race geometry: a
/// short segment 0, a dead zone, then segment 1. Exercises the
/// dead-zone retry path serialized stores cannot produce.
struct RaceyStore {
    segs: Vec<Arc<Segment>>,
    mark: Mutex<Lsn>,
    dir: PathBuf,
}

impl SegmentStore for RaceyStore {
    fn durable_mark(&self) -> Lsn {
        *self.mark.lock().unwrap()
    }

    fn segment(&self, segnum: u32) -> Option<Arc<Segment>> {
        self.segs.iter().find(|s| s.segnum == segnum).cloned()
    }

    fn assign_segment(&self, lo: LsnOffset, hi: LsnOffset) -> SegmentAssignment {
        for sid in &self.segs {
            if sid.start_offset > lo
                || lo + MIN_LOG_BLOCK_SIZE > sid.end_offset
            {
                continue;
            }
            if hi <= sid.end_offset {
                return SegmentAssignment {
                    next_lsn: sid.make_lsn(hi),
                    segment: Some(sid.clone()),
                    full_size: true,
                };
            }
            let succ = &self.segs[1];
            return SegmentAssignment {
                segment: Some(sid.clone()),
                next_lsn: succ.make_lsn(succ.start_offset),
                full_size: false,
            };
        }
        // between segment 0's red zone and segment 1's start
        SegmentAssignment {
            segment: None,
            next_lsn: self.segs[1].make_lsn(self.segs[1].start_offset),
            full_size: false,
        }
    }

    fn update_durable_mark(&self, lsn: Lsn) -> walcore::Result<()> {
        *self.mark.lock().unwrap() = lsn;
        Ok(())
    }

    fn open_for_write(&self, segment: &Segment) -> walcore::Result<fs::File> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.dir.join(format!("seg-{}", segment.segnum)))?;
        Ok(file)
    }
}

#[test]
fn dead_zone_ranges_are_discarded_and_retried() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RaceyStore {
        segs: vec![
            Arc::new(Segment {
                segnum: 0,
                start_offset: 0,
                end_offset: 96,
                byte_offset: 0,
            }),
            // the winner of the install race started its block at 256,
            // leaving [96, 256) owned by no segment
            Arc::new(Segment {
                segnum: 1,
                start_offset: 256,
                end_offset: 1280,
                byte_offset: 96,
            }),
        ],
        mark: Mutex::new(Lsn::new(0, 0)),
        dir: dir.path().to_path_buf(),
    });
    let config = Config::new().segment_size(1024).buffer_size(4096);
    let wal = Wal::start(config, store.clone()).unwrap();

    // [0, 128) straddles segment 0, shrinking to a skip over [0, 96);
    // the retry at [128, 256) lands in the dead zone and is abandoned;
    // the next retry at [256, 384) is the first block of segment 1
    let block = wal.allocate(1, 64);
    assert_eq!(block.lsn_offset(), 256);
    assert_eq!(block.lsn(), Lsn::new(1, 256));
    block.release();

    wal.wait_for_durable(384);
    wal.update_durable_mark(384);
    drop(wal);

    let seg0 = fs::read(dir.path().join("seg-0")).unwrap();
    let skip = &seg0[0..96];
    assert!(verify(skip));
    assert_eq!(nrec_of(skip), 0);
    assert_eq!(lsn_offset_of(skip), 0);
    assert_eq!(skip_target_of(skip), 256);

    let seg1 = fs::read(dir.path().join("seg-1")).unwrap();
    assert_eq!(lsn_offset_of(&seg1[0..128]), 256);
    assert_eq!(store.durable_mark(), Lsn::new(1, 384));
}

#[test]
fn allocation_sequences_partition_and_drain() {
    setup();

    fn prop(sizes: Vec<(u8, u8)>) -> bool {
        let sizes: Vec<(u32, usize)> = sizes
            .into_iter()
            .take(40)
            .map(|(n, p)| (u32::from(n % 3), usize::from(p % 4) * 16))
            .collect();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal");
        let wal = wal_at(path.clone(), 2048, 1024);

        let mut expected = 0;
        for (nrec, payload) in sizes {
            let block = wal.allocate(nrec, payload);
            // overflow retries may skip ranges, but never go backwards
            // or overlap
            if block.lsn_offset() < expected {
                return false;
            }
            if block.next_lsn_offset()
                != block.lsn_offset() + block_size(nrec, payload)
            {
                return false;
            }
            expected = block.next_lsn_offset();
            block.release();
        }
        wal.wait_for_durable(expected);
        let cur = wal.cur_lsn_offset();
        drop(wal);

        let store = DirStore::open(&path, 2048).unwrap();
        store.durable_mark().offset() == cur
    }

    QuickCheck::new()
        .tests(30)
        .quickcheck(prop as fn(Vec<(u8, u8)>) -> bool);
}
