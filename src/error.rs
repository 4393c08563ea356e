use std::fmt::{self, Display};

use crate::Ts;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error kinds.
///
/// `Rollback` is a first-class return value: the retry loop belongs to the
/// caller, not to an exception handler. Transient kinds (`Rollback`,
/// `BufferUnavailable`, `Timeout`, `Interrupted`) may be retried; the
/// corruption kinds (`PageStructure`, `CorruptJournal`, `ChecksumMismatch`)
/// put the engine into a read-only fatal state.
#[derive(Debug)]
pub enum Error {
    /// Write-write conflict or explicit abort. Retry the transaction.
    Rollback,
    /// The buffer pool has no evictable slot (or the pin deadline expired).
    BufferUnavailable,
    /// A pin or group-commit wait exceeded its deadline.
    Timeout,
    /// The operation observed the engine interruption flag.
    Interrupted,
    /// Key (plus its value header) cannot fit even in a split page.
    KeyTooLong(usize),
    /// Value exceeds the representable long-record length.
    ValueTooLong(usize),
    /// Malformed key bytes (bad tag, bad escape, truncated segment).
    InvalidKey(&'static str),
    /// A page's free-space accounting is inconsistent.
    PageStructure(String),
    /// A journal record failed its length/type checks before the
    /// crash-truncation point.
    CorruptJournal(String),
    /// Head-page (or tool-side) checksum verification failed.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Journal rollover is blocked (copier stalled past the file budget).
    JournalFull,
    /// The volume head page cannot hold the tree directory.
    VolumeOverflow,
    /// Named tree does not exist and creation was not requested.
    TreeNotFound(String),
    /// Named volume is not open.
    VolumeNotFound(String),
    /// begin/commit/rollback/end called out of order.
    IllegalTransactionState(&'static str),
    /// The engine hit a fatal error earlier and refuses new work.
    Fatal(Ts),
    Io(std::io::Error),
    /// Raised by an external codec; propagated unchanged.
    Conversion(String),
}

impl Error {
    /// True for kinds the caller may retry after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Rollback | Error::BufferUnavailable | Error::Timeout | Error::Interrupted
        )
    }

    /// True for kinds that move the engine to the read-only fatal state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::PageStructure(_) | Error::CorruptJournal(_) | Error::ChecksumMismatch { .. }
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Rollback => write!(f, "transaction rolled back"),
            Error::BufferUnavailable => write!(f, "buffer pool exhausted"),
            Error::Timeout => write!(f, "operation deadline expired"),
            Error::Interrupted => write!(f, "operation interrupted"),
            Error::KeyTooLong(n) => write!(f, "key of {n} bytes does not fit a split page"),
            Error::ValueTooLong(n) => write!(f, "value of {n} bytes exceeds long-record limit"),
            Error::InvalidKey(why) => write!(f, "invalid key: {why}"),
            Error::PageStructure(why) => write!(f, "page structure: {why}"),
            Error::CorruptJournal(why) => write!(f, "corrupt journal: {why}"),
            Error::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch, expected {expected:#010x}, got {actual:#010x}")
            }
            Error::JournalFull => write!(f, "journal full, copy-back stalled"),
            Error::VolumeOverflow => write!(f, "volume head page overflow"),
            Error::TreeNotFound(name) => write!(f, "tree {name:?} not found"),
            Error::VolumeNotFound(name) => write!(f, "volume {name:?} not found"),
            Error::IllegalTransactionState(why) => write!(f, "illegal transaction state: {why}"),
            Error::Fatal(ts) => write!(f, "engine fatal since timestamp {ts}"),
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::Conversion(why) => write!(f, "conversion: {why}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn test_classification() {
        assert!(Error::Rollback.is_transient());
        assert!(!Error::Rollback.is_fatal());
        assert!(Error::CorruptJournal("truncated envelope".into()).is_fatal());
        assert!(!Error::KeyTooLong(9000).is_transient());
    }

    #[test]
    fn test_io_source() {
        use std::error::Error as _;
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(err.source().is_some());
    }
}
