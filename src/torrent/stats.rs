//! The per torrent statistics snapshot exposed to the embedding
//! application.

use std::time::Duration;

use crate::{Sha1Hash, TorrentId};

/// The lifecycle state of a torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentState {
    /// Not transferring and not announced.
    Stopped,
    /// Waiting for the verification worker to get to us.
    CheckWait,
    /// The verification worker is hashing our files.
    Checking,
    /// Transferring, with pieces still missing (for a magnet start this
    /// includes the metadata download phase).
    Downloading,
    /// All wanted pieces are complete; uploading only.
    Seeding,
}

/// A point in time snapshot of a torrent, emitted about once a second on
/// the alert channel and queryable through the engine handle.
#[derive(Clone, Debug)]
pub struct TorrentStats {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    /// The torrent's name, or the magnet display name until the metadata
    /// arrives.
    pub name: String,
    pub state: TorrentState,
    /// Set when the torrent hit a persistent storage error. The torrent
    /// stays registered but won't transfer until restarted.
    pub error: Option<String>,

    /// Piece counts. Zero until the metainfo is known.
    pub piece_count: usize,
    pub pieces_complete: usize,
    /// Completion of the wanted files, in [0, 1]. A torrent whose unwanted
    /// files are missing still reaches 1.
    pub percent_done: f64,

    /// Payload rates, bytes per second.
    pub rate_down: u64,
    pub rate_up: u64,
    /// Lifetime payload totals (survive restarts via the resume data).
    pub downloaded_ever: u64,
    pub uploaded_ever: u64,
    pub corrupt_ever: u64,
    /// Upload/download ratio, if anything was downloaded yet.
    pub ratio: Option<f64>,
    /// Estimated seconds to completion at the current download rate.
    pub eta: Option<Duration>,

    pub peers_connected: usize,
    /// Peers currently sending payload to us (we are unchoked by them and
    /// have requests in flight).
    pub peers_sending_to_us: usize,
    /// Peers we are currently sending payload to.
    pub peers_getting_from_us: usize,
    /// Swarm totals from the latest announce or scrape, if known.
    pub seeder_count: Option<usize>,
    pub leecher_count: Option<usize>,
}
