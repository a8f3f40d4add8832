use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::store::DirStore;
use crate::{Result, Wal};

/// Top-level configuration for the log core.
///
/// ```no_run
/// let wal = walcore::Config::new()
///     .path("/var/lib/mydb/wal")
///     .segment_size(8 * 1024 * 1024)
///     .buffer_size(1024 * 1024)
///     .open()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) path: PathBuf,
    pub(crate) segment_size: u64,
    pub(crate) buffer_size: usize,
    pub(crate) mark_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: PathBuf::from("walcore_data"),
            segment_size: 8 * 1024 * 1024,
            buffer_size: 1024 * 1024,
            mark_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Set the directory the log's segment files live in.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Config {
        self.path = path.as_ref().to_path_buf();
        self
    }

    /// Set the size of each log segment in bytes.
    pub fn segment_size(mut self, segment_size: u64) -> Config {
        self.segment_size = segment_size;
        self
    }

    /// Set the size of the in-memory log window. Allocation throughput is
    /// bounded by how far this window lets the log tip run ahead of the
    /// durable offset.
    pub fn buffer_size(mut self, buffer_size: usize) -> Config {
        self.buffer_size = buffer_size;
        self
    }

    /// Set how often the daemon persists the durable mark when nobody is
    /// explicitly waiting on it.
    pub fn mark_every_ms(mut self, ms: u64) -> Config {
        self.mark_interval = Duration::from_millis(ms);
        self
    }

    /// Open a log rooted at `path` using a [`DirStore`] for its segments.
    pub fn open(self) -> Result<Wal> {
        let store = Arc::new(DirStore::open(&self.path, self.segment_size)?);
        Wal::start(self, store)
    }
}
