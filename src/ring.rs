//! A fixed-capacity sliding window over the log's byte space.
//!
//! Buffer offsets are 64-bit and monotone, derived from LSN offsets via
//! each segment's `byte_offset`. Producers reserve writable slices with
//! `write_buf`; the single consumer (the write daemon) takes readable
//! slices with `read_buf` and is the only party that moves the two
//! frontiers. Producers complete out of order, so they never advance the
//! writer frontier themselves.
//!
//! The backing memory is a file-backed mapping placed twice back-to-back
//! in virtual memory, so any span of at most one mapping length is
//! contiguous no matter where it falls relative to the physical wrap
//! point. The logical window (the backpressure bound) is exactly the
//! configured size; the mapping length is that size rounded up to the
//! page size, and physical indices are taken modulo the mapping length.

#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{
    AtomicU64, AtomicUsize,
    Ordering::SeqCst,
};

use crossbeam_utils::CachePadded;

use crate::{debug_delay, Error, Result};

static RING_SALT: AtomicUsize = AtomicUsize::new(0);

pub(crate) struct LogBuffer {
    base: *mut u8,
    map_len: usize,
    window: u64,
    read_begin: CachePadded<AtomicU64>,
    write_end: CachePadded<AtomicU64>,
}

unsafe impl Send for LogBuffer {}
unsafe impl Sync for LogBuffer {}

impl LogBuffer {
    /// Create a window of `window` bytes whose frontiers both start at
    /// `start_byte` (the buffer offset of the recovered durable position).
    pub(crate) fn new(window: usize, start_byte: u64) -> Result<LogBuffer> {
        assert!(window > 0, "log window must be non-empty");

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let map_len = (window + page - 1) / page * page;

        // Anonymous backing would do, but a file is the portable way to
        // get the same pages mapped at two addresses. The name is unlinked
        // immediately; the mappings keep it alive.
        let path = std::env::temp_dir().join(format!(
            "walcore-window-{}-{}",
            std::process::id(),
            RING_SALT.fetch_add(1, SeqCst),
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let _ = std::fs::remove_file(&path);
        file.set_len(map_len as u64)?;
        let fd = file.as_raw_fd();

        let base = unsafe {
            let reservation = libc::mmap(
                std::ptr::null_mut(),
                map_len * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if reservation == libc::MAP_FAILED {
                return Err(Error::Io(
                    std::io::Error::last_os_error().kind(),
                    "unable to reserve address space for the log window",
                ));
            }

            let lo = libc::mmap(
                reservation,
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            );
            let hi = libc::mmap(
                (reservation as *mut u8).add(map_len) as *mut libc::c_void,
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            );
            if lo == libc::MAP_FAILED || hi == libc::MAP_FAILED {
                let err = std::io::Error::last_os_error();
                libc::munmap(reservation, map_len * 2);
                return Err(Error::Io(
                    err.kind(),
                    "unable to mirror-map the log window",
                ));
            }

            reservation as *mut u8
        };

        Ok(LogBuffer {
            base,
            map_len,
            window: window as u64,
            read_begin: CachePadded::new(AtomicU64::new(start_byte)),
            write_end: CachePadded::new(AtomicU64::new(start_byte)),
        })
    }

    pub(crate) fn window_size(&self) -> u64 {
        self.window
    }

    /// The consumer frontier: everything before it has reached disk.
    pub(crate) fn read_begin(&self) -> u64 {
        debug_delay();
        self.read_begin.load(SeqCst)
    }

    /// The producer frontier: everything before it may be read.
    pub(crate) fn write_end(&self) -> u64 {
        debug_delay();
        self.write_end.load(SeqCst)
    }

    fn ptr(&self, off: u64) -> *mut u8 {
        let phys = (off % self.map_len as u64) as usize;
        unsafe { self.base.add(phys) }
    }

    /// Reserve `len` writable bytes at buffer offset `off`, or `None` if
    /// granting the slice would overwrite bytes the consumer has not yet
    /// retired. The returned slice is contiguous even when the span
    /// straddles the physical wrap point.
    ///
    /// # Safety discipline
    ///
    /// Callers hold disjoint LSN ranges, so no two outstanding slices
    /// overlap, and the consumer only reads a span after the writer
    /// frontier has been advanced past it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn write_buf(&self, off: u64, len: usize) -> Option<&mut [u8]> {
        debug_delay();
        assert!(
            len as u64 <= self.window,
            "requested span of {} bytes exceeds the {}-byte log window",
            len,
            self.window,
        );
        let read_begin = self.read_begin.load(SeqCst);
        debug_assert!(off >= read_begin);
        if off + len as u64 > read_begin + self.window {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr(off), len) })
    }

    /// Take a readable slice of `len` bytes at buffer offset `off`.
    /// Single-consumer: only the write daemon calls this, after advancing
    /// the writer frontier past `off + len`.
    pub(crate) fn read_buf(&self, off: u64, len: usize) -> &[u8] {
        debug_assert!(off + len as u64 <= self.write_end());
        unsafe { std::slice::from_raw_parts(self.ptr(off), len) }
    }

    /// Move the producer frontier up to `to`. Daemon-only: producers
    /// complete out of order, so the daemon computes the highest safe
    /// value just before each flush.
    pub(crate) fn advance_writer(&self, to: u64) {
        debug_delay();
        assert!(to <= self.read_begin.load(SeqCst) + self.window);
        self.write_end.fetch_max(to, SeqCst);
    }

    /// Retire consumed bytes, freeing window space for producers.
    pub(crate) fn advance_reader(&self, to: u64) {
        debug_delay();
        assert!(to <= self.write_end.load(SeqCst));
        self.read_begin.fetch_max(to, SeqCst);
    }
}

impl Drop for LogBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len * 2);
        }
    }
}
