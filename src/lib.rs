//! A BitTorrent V1 session engine.
//!
//! The engine drives a set of torrents, each started from a .torrent file or
//! a magnet link, to completion: it verifies and repairs on-disk state,
//! exchanges pieces with swarms of peers over framed TCP connections,
//! announces to HTTP and UDP trackers, and persists resume state across
//! restarts. The embedding application (a daemon, GUI, or RPC shell) drives
//! the engine through [`EngineHandle`] and observes it through the
//! [`alert`](crate::alert) channel.
//!
//! # Example
//!
//! ```no_run
//! use tidetorrent::{conf::Conf, engine, TorrentParams};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conf = Conf::new("/tmp/downloads");
//!     let (handle, mut alerts) = engine::spawn(conf)?;
//!     let metainfo =
//!         tidetorrent::metainfo::Metainfo::from_bytes(&std::fs::read(
//!             "/tmp/test.torrent",
//!         )?)?;
//!     handle.add_torrent(TorrentParams::new_metainfo(metainfo))?;
//!     while let Some(alert) = alerts.recv().await {
//!         println!("{:?}", alert);
//!     }
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate serde_derive;

pub mod alert;
mod avg;
pub mod bencode;
pub mod blocklist;
mod choker;
pub mod conf;
mod counter;
pub mod creator;
mod disk;
mod download;
pub mod engine;
pub mod error;
pub mod magnet;
mod metadata;
pub mod metainfo;
mod peer;
mod piece_picker;
mod resume;
pub mod storage_info;
mod torrent;
mod tracker;
mod verify;

use std::fmt;

use bitvec::prelude::{BitVec, Msb0};

pub use engine::{spawn, EngineHandle, TorrentParams};
pub use torrent::stats::{TorrentState, TorrentStats};

/// Each engine gets a randomly generated client id that is sent to peers and
/// trackers to identify this instance.
pub type PeerId = [u8; 20];

/// A 20 byte SHA-1 digest. Used for both piece hashes and info hashes.
pub type Sha1Hash = [u8; 20];

/// Identifies a torrent within its engine.
///
/// This is a small integer handle issued by the engine when the torrent is
/// added; every cross component reference to a torrent (from peers, the disk
/// task, the verifier) uses this id rather than a pointer.
pub type TorrentId = u32;

/// The zero based index of a piece in a torrent.
pub(crate) type PieceIndex = usize;

/// The zero based index of a file in a torrent.
pub(crate) type FileIndex = usize;

/// The bitfield represents piece availability: one bit per piece, in most
/// significant bit first order, that is, the highest bit of the first byte
/// represents the first piece (e.g. `0b1100_0001` means pieces 0, 1, and 7).
pub type Bitfield = BitVec<u8, Msb0>;

/// The length of a block, the unit in which peers request data within
/// a piece. This is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A file's download priority within its torrent.
///
/// A piece inherits the highest priority of the files it intersects, and
/// higher priority pieces are picked before lower priority ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FilePriority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Default for FilePriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl FilePriority {
    pub(crate) fn from_u8(priority: u8) -> Self {
        match priority {
            0 => Self::Low,
            2 => Self::High,
            _ => Self::Normal,
        }
    }
}

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happens at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB, except possibly for the
    /// last block in a piece.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the default
    /// block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        // we need to use the constant as self.len may be shorter for the
        // last block in piece
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(piece: {} offset: {} len: {})",
            self.piece_index, self.offset, self.len
        )
    }
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// Returns the length of the block at the index in a piece of the given
/// length.
///
/// # Panics
///
/// Panics if the index is out of bounds for the piece.
pub(crate) fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_index = block_index as u32;
    let block_offset = block_index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN), 1);
        assert_eq!(block_count(BLOCK_LEN + 1), 2);
        assert_eq!(block_count(4 * BLOCK_LEN), 4);
        assert_eq!(block_count(4 * BLOCK_LEN + 16), 5);
    }

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(4 * BLOCK_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(4 * BLOCK_LEN, 3), BLOCK_LEN);
        assert_eq!(block_len(3 * BLOCK_LEN + 16, 3), 16);
    }

    #[test]
    #[should_panic]
    fn test_block_len_out_of_bounds() {
        block_len(4 * BLOCK_LEN, 4);
    }
}
