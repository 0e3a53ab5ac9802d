//! The crate level error type and the conversions into it.
//!
//! Recoverable per-domain errors (peer protocol violations, tracker
//! failures, disk read errors) live next to the code that produces them and
//! are handled there; only errors that cross the engine's public surface are
//! mapped into [`Error`].

use std::fmt;

use crate::{bencode, metainfo::MetainfoError, TorrentId};

pub use crate::magnet::MagnetError;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by the engine's public operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Bencode parsing or validation failed.
    Bencode(bencode::Error),
    /// The torrent metainfo was syntactically valid bencode but semantically
    /// invalid.
    Metainfo(MetainfoError),
    /// A magnet URI could not be parsed.
    Magnet(MagnetError),
    /// The configuration file could not be read or parsed.
    Config(String),
    /// A torrent with this info hash is already in the engine.
    TorrentExists,
    /// No torrent with this id is registered in the engine.
    TorrentNotFound(TorrentId),
    /// An IO error occurred.
    Io(std::io::Error),
    /// The engine (or one of its tasks) is shutting down and can no longer
    /// accept commands.
    EngineShutDown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "{}", e),
            Self::Metainfo(e) => write!(f, "{}", e),
            Self::Magnet(e) => write!(f, "{}", e),
            Self::Config(e) => write!(f, "configuration error: {}", e),
            Self::TorrentExists => write!(f, "torrent already exists"),
            Self::TorrentNotFound(id) => {
                write!(f, "torrent {} not found", id)
            }
            Self::Io(e) => write!(f, "{}", e),
            Self::EngineShutDown => write!(f, "engine is shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bencode(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bencode::Error> for Error {
    fn from(e: bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<MetainfoError> for Error {
    fn from(e: MetainfoError) -> Self {
        Self::Metainfo(e)
    }
}

impl From<MagnetError> for Error {
    fn from(e: MagnetError) -> Self {
        Self::Magnet(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// Any channel send failure means the receiving task is gone, which only
// happens on shutdown.
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::EngineShutDown
    }
}
