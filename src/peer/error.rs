//! The peer session error taxonomy.
//!
//! Peer errors are always recovered from at the torrent level: the session
//! is torn down and the peer slot freed, but the torrent carries on.

use std::fmt;

pub(crate) type Result<T, E = PeerError> = std::result::Result<T, E>;

/// The ways a peer session can end abnormally.
#[derive(Debug)]
pub(crate) enum PeerError {
    /// The handshake was malformed, carried the wrong info hash, or didn't
    /// arrive in time.
    Handshake,
    /// The peer violated the wire protocol (bad frame, invalid message
    /// order, bogus block info, oversized frame).
    Protocol,
    /// The peer sent nothing for longer than the inactivity limit.
    Timeout,
    /// The connection was closed by the peer or the OS.
    Closed,
    /// The peer served too many corrupt blocks and is banned from the
    /// torrent.
    Banned,
    /// The channel to the torrent or disk task is gone, meaning the torrent
    /// is shutting down.
    TorrentGone,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake => write!(f, "peer handshake failed"),
            Self::Protocol => write!(f, "peer protocol violation"),
            Self::Timeout => write!(f, "peer inactivity timeout"),
            Self::Closed => write!(f, "peer connection closed"),
            Self::Banned => write!(f, "peer banned"),
            Self::TorrentGone => write!(f, "torrent is shutting down"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::InvalidData
            | std::io::ErrorKind::InvalidInput => Self::Protocol,
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Closed,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PeerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::TorrentGone
    }
}
