use std::io;
use std::path::PathBuf;
use std::result;

use thiserror::Error;

use crate::database::KeyOrdering;
use crate::types::TxnState;

/// Custom result type for lumokv operations
pub type Result<T> = result::Result<T, Error>;

/// Broad classification of an [`Error`].
///
/// Callers that embed the store usually only need to branch on the kind:
/// `TransactionState` and `ResourceExhausted` are the ones worth retrying
/// (after backing off, or after reopening with a larger map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid environment or database setup
    Configuration,
    /// Underlying storage could not be opened, read or written, or is
    /// already open in another handle
    Io,
    /// Operation attempted on a transaction in the wrong state or mode
    TransactionState,
    /// Cursor or environment used in the wrong state
    InvalidState,
    /// Stored or framed bytes are malformed
    CorruptData,
    /// A configured bound (map size, readers, databases) was reached
    ResourceExhausted,
    /// Key/data pair already exists
    KeyExists,
    /// Key or value size not accepted
    InvalidArgument,
}

/// lumokv errors
#[derive(Debug, Error)]
pub enum Error {
    /// Environment map size is invalid
    #[error("invalid map size {0}: must hold at least the two meta pages")]
    InvalidMapSize(usize),
    /// Invalid environment configuration
    #[error("invalid environment configuration: {0}")]
    InvalidConfig(&'static str),
    /// Environment path is not a usable directory
    #[error("environment path is not a directory: {}", .0.display())]
    InvalidPath(PathBuf),
    /// Database was created with a different key ordering
    #[error("database `{name}` uses {stored:?} ordering, {requested:?} was requested")]
    IncompatibleOrdering {
        name: String,
        stored: KeyOrdering,
        requested: KeyOrdering,
    },
    /// Named database does not exist
    #[error("database `{0}` not found")]
    DatabaseNotFound(String),
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Transaction already committed or aborted
    #[error("transaction is already {0}")]
    TxnFinished(TxnState),
    /// Operation not allowed in read-only transaction
    #[error("operation not allowed in read-only transaction")]
    TxnReadOnly,
    /// Another handle holds the environment lock
    #[error("environment {} is locked by another handle", .0.display())]
    EnvLocked(PathBuf),
    /// Environment closed while transactions were still active
    #[error("environment has {0} active transaction(s)")]
    EnvBusy(usize),
    /// Cursor is not positioned on an entry
    #[error("cursor is not positioned on an entry")]
    CursorNotPositioned,
    /// Varint did not terminate within 5 bytes or exceeds 32 bits
    #[error("invalid 7-bit encoded length: more than 5 bytes or wider than 32 bits")]
    VarintOverflow,
    /// Fewer bytes available than the encoding requires
    #[error("truncated data: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    /// Integer key doesn't match the database's fixed width
    #[error("integer key width mismatch: expected {expected} bytes, got {found}")]
    KeyWidthMismatch { expected: usize, found: usize },
    /// Integer keys must be 4 or 8 bytes
    #[error("unsupported integer key width {0}: must be 4 or 8 bytes")]
    UnsupportedKeyWidth(usize),
    /// Data file is not a valid lumokv file
    #[error("not a valid data file: {0}")]
    Invalid(&'static str),
    /// Data file version mismatch
    #[error("data file version mismatch: found {found:#x}, expected {expected:#x}")]
    VersionMismatch { found: u32, expected: u32 },
    /// Data file is corrupted
    #[error("data file is corrupted: {0}")]
    Corrupted(String),
    /// Environment mapsize limit reached
    #[error("map full: {required} bytes required, map size is {map_size}")]
    MapFull { required: usize, map_size: usize },
    /// Environment maxreaders limit reached
    #[error("reader slots exhausted: limit is {0}")]
    ReadersFull(u32),
    /// Environment maxdbs limit reached
    #[error("database slots exhausted: limit is {0}")]
    DbsFull(u32),
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// Unsupported size of key or data
    #[error("unsupported {what} size {size}: limit is {max}")]
    BadValSize {
        what: &'static str,
        size: usize,
        max: usize,
    },
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidMapSize(_)
            | Error::InvalidConfig(_)
            | Error::InvalidPath(_)
            | Error::IncompatibleOrdering { .. }
            | Error::DatabaseNotFound(_) => ErrorKind::Configuration,
            Error::Io(_) | Error::EnvLocked(_) => ErrorKind::Io,
            Error::TxnFinished(_) | Error::TxnReadOnly => ErrorKind::TransactionState,
            Error::EnvBusy(_) | Error::CursorNotPositioned => ErrorKind::InvalidState,
            Error::VarintOverflow
            | Error::Truncated { .. }
            | Error::KeyWidthMismatch { .. }
            | Error::UnsupportedKeyWidth(_)
            | Error::Invalid(_)
            | Error::VersionMismatch { .. }
            | Error::Corrupted(_) => ErrorKind::CorruptData,
            Error::MapFull { .. } | Error::ReadersFull(_) | Error::DbsFull(_) => {
                ErrorKind::ResourceExhausted
            }
            Error::KeyExist => ErrorKind::KeyExists,
            Error::BadValSize { .. } => ErrorKind::InvalidArgument,
        }
    }
}
