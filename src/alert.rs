//! The alerts the engine sends the embedding application.
//!
//! Communication of alerts is performed via an unbounded [tokio mpsc
//! channel](tokio::sync::mpsc), so the application may be driven partially
//! or entirely by engine alerts.

use std::path::PathBuf;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{torrent::stats::TorrentStats, Sha1Hash, TorrentId};

pub(crate) type AlertSender = UnboundedSender<Alert>;
/// The channel on which alerts from the engine can be received. See
/// [`Alert`] for the type of messages that can be received.
pub type AlertReceiver = UnboundedReceiver<Alert>;

/// The events the engine reports to the library user.
#[derive(Debug)]
#[non_exhaustive]
pub enum Alert {
    /// A torrent was added and assigned this id.
    TorrentAdded {
        id: TorrentId,
        info_hash: Sha1Hash,
        name: String,
    },
    /// A magnet started torrent acquired its metadata from the swarm. The
    /// reconstructed .torrent file has been persisted.
    MetadataComplete { id: TorrentId },
    /// All wanted pieces finished downloading and verifying.
    TorrentComplete { id: TorrentId },
    /// The torrent stopped (by request or because it hit its seed ratio
    /// limit).
    TorrentStopped { id: TorrentId },
    /// The torrent was removed from the session.
    TorrentRemoved { id: TorrentId },
    /// The torrent hit a persistent storage error and stopped
    /// transferring.
    TorrentError { id: TorrentId, error: String },
    /// Each running torrent sends an update of its latest statistics about
    /// once a second.
    TorrentStats {
        id: TorrentId,
        stats: Box<TorrentStats>,
    },
    /// A torrent creation job finished (or failed).
    TorrentCreated {
        /// Where the .torrent was written, or the failure reason.
        result: Result<PathBuf, String>,
    },
}
