//! The in-progress piece write buffer.
//!
//! Blocks arrive from peers out of order and from multiple sessions at
//! once; they are buffered here until the piece is complete, then the piece
//! is hashed in memory and, if valid, flushed to disk in one pass.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use crate::{block_count, Sha1Hash};

/// An in-progress piece download: the blocks received so far and what the
/// piece must hash to.
pub(super) struct PieceBuf {
    /// The piece's expected hash from the metainfo.
    pub expected_hash: Sha1Hash,
    /// The piece's length in bytes.
    pub len: u32,
    /// The received blocks, keyed and ordered by their offset within the
    /// piece.
    pub blocks: BTreeMap<u32, Vec<u8>>,
}

impl PieceBuf {
    pub fn new(expected_hash: Sha1Hash, len: u32) -> Self {
        Self {
            expected_hash,
            len,
            blocks: BTreeMap::new(),
        }
    }

    /// Buffers a block. A block at an already buffered offset is dropped;
    /// the first arrival wins (relevant in endgame, when the same block may
    /// arrive from two peers).
    ///
    /// Returns whether the block was new.
    pub fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) -> bool {
        use std::collections::btree_map::Entry;
        match self.blocks.entry(offset) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(data);
                true
            }
        }
    }

    /// Returns true if all of the piece's blocks are buffered.
    pub fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Hashes the buffered blocks and compares against the expected hash.
    ///
    /// Should only be called on a complete piece.
    pub fn matches_hash(&self) -> bool {
        debug_assert!(self.is_complete());
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let digest: [u8; 20] = hasher.finalize().into();
        digest == self.expected_hash
    }

    /// Flattens the buffered blocks into the piece's contiguous bytes.
    pub fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len as usize);
        for block in self.blocks.values() {
            buf.extend_from_slice(block);
        }
        debug_assert_eq!(buf.len(), self.len as usize);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    #[test]
    fn test_piece_assembly() {
        let piece: Vec<u8> = (0..2 * BLOCK_LEN + 100)
            .map(|i| (i % 251) as u8)
            .collect();
        let expected_hash: [u8; 20] = Sha1::digest(&piece).into();

        let mut buf = PieceBuf::new(expected_hash, piece.len() as u32);

        // blocks arrive out of order
        assert!(buf.enqueue_block(
            2 * BLOCK_LEN,
            piece[2 * BLOCK_LEN as usize..].to_vec()
        ));
        assert!(!buf.is_complete());
        assert!(buf.enqueue_block(0, piece[..BLOCK_LEN as usize].to_vec()));
        assert!(buf.enqueue_block(
            BLOCK_LEN,
            piece[BLOCK_LEN as usize..2 * BLOCK_LEN as usize].to_vec()
        ));

        // a duplicate block is dropped
        assert!(!buf.enqueue_block(0, vec![0; BLOCK_LEN as usize]));

        assert!(buf.is_complete());
        assert!(buf.matches_hash());
        assert_eq!(buf.assemble(), piece);
    }

    #[test]
    fn test_hash_mismatch() {
        let mut buf = PieceBuf::new([0; 20], 16);
        buf.enqueue_block(0, vec![1; 16]);
        assert!(buf.is_complete());
        assert!(!buf.matches_hash());
    }
}
