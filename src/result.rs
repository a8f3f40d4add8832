use std::{
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

/// The top-level result type for fallible operations. Errors here are
/// fail-stop: transient conditions (segment overflow, dead-zone assignment,
/// a full log window) are retried internally and never surface as an
/// `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// An error encapsulating the ways constructing or persisting the log can
/// go wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A read or write error happened while interacting with the file
    /// system.
    Io(io::ErrorKind, &'static str),
    /// Corruption has been detected in a persisted structure.
    Corruption {
        /// File offset the corrupt data was found at.
        at: u64,
    },
    /// An unexpected internal state was encountered. Please open an issue!
    ReportableBug(&'static str),
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error.kind(), "io error")
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        use std::io::ErrorKind;
        match error {
            Error::Io(kind, reason) => io::Error::new(kind, reason),
            Error::Corruption { .. } => io::Error::new(
                ErrorKind::InvalidData,
                format!("corruption encountered: {:?}", error),
            ),
            Error::ReportableBug(what) => io::Error::new(
                ErrorKind::Other,
                format!("unexpected bug: {:?}", what),
            ),
        }
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref kind, ref reason) => {
                write!(f, "IO error: ({:?}, {})", kind, reason)
            }
            Error::Corruption { at } => {
                write!(f, "Read corrupted data at file offset {}", at)
            }
            Error::ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. PLEASE REPORT THIS BUG!",
                e
            ),
        }
    }
}
