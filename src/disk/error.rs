//! Disk IO error types.
//!
//! Block level errors are non-fatal: the affected peer or piece recovers
//! and the disk task carries on. A persistent storage error (disk full,
//! permissions) is surfaced to the torrent, which transitions to its error
//! state and stops requesting blocks.

use std::{fmt, io};

/// A storage error classified into the cases the torrent may want to
/// message differently.
#[derive(Debug)]
pub(crate) enum StorageError {
    /// The disk holding the download is out of space.
    DiskFull,
    /// The download path is not writable (or readable) by us.
    PermissionDenied,
    /// The process hit its open file descriptor limit even after the pool
    /// evicted everything it could.
    TooManyOpenFiles,
    /// Any other IO error.
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => match e.raw_os_error() {
                // ENOSPC
                Some(28) => Self::DiskFull,
                // EMFILE and ENFILE
                Some(24) | Some(23) => Self::TooManyOpenFiles,
                _ => Self::Io(e),
            },
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiskFull => write!(f, "disk full"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::TooManyOpenFiles => write!(f, "too many open files"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

/// Error type returned on failed torrent allocations.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// The torrent entry already exists in the disk task's torrent table.
    AlreadyExists,
    /// IO error while creating the torrent's directory structure.
    Storage(StorageError),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => {
                write!(f, "disk torrent entry already exists")
            }
            Self::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for NewTorrentError {
    fn from(e: io::Error) -> Self {
        Self::Storage(e.into())
    }
}

/// Error type returned on failed block writes.
#[derive(Debug)]
pub(crate) enum WriteError {
    /// The block's piece index or offset is invalid.
    InvalidBlock,
    /// The write failed at the file system level.
    Storage(StorageError),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBlock => write!(f, "invalid block"),
            Self::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        Self::Storage(e.into())
    }
}

/// Error type returned on failed block reads.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The block's piece index or offset is invalid.
    InvalidBlock,
    /// The block is valid within the torrent but its data has not been
    /// downloaded yet or has been deleted.
    DataMissing,
    /// The read failed at the file system level.
    Storage(StorageError),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBlock => write!(f, "invalid block"),
            Self::DataMissing => write!(f, "torrent data missing"),
            Self::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        // reading past the end of a sparse, not yet downloaded region comes
        // back as an unexpected EOF
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::DataMissing
        } else {
            Self::Storage(e.into())
        }
    }
}
