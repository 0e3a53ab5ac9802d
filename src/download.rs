//! Tracks the completion of an ongoing piece download.
//!
//! While a piece is in flight its blocks move through a free → requested →
//! received table shared by all peer sessions participating in the
//! download. In endgame a block may be requested from several peers at
//! once, so requests are counted rather than flagged.

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

#[derive(Clone, Copy, Debug)]
enum Block {
    Free,
    /// Requested from this many peers. Outside endgame the count is always
    /// 1; in endgame the same block may be in flight from several peers.
    Requested(usize),
    Received,
}

impl Default for Block {
    fn default() -> Self {
        Self::Free
    }
}

/// Tracks an in-flight piece and hands out its missing blocks to peer
/// sessions.
pub(crate) struct PieceDownload {
    /// The piece's index.
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    /// The blocks in this piece. The vec is preallocated to the number of
    /// blocks in piece.
    blocks: Vec<Block>,
}

impl PieceDownload {
    /// Creates a new piece download instance for the given piece.
    pub fn new(index: PieceIndex, len: u32) -> Self {
        let mut blocks = Vec::new();
        blocks.resize_with(block_count(len), Default::default);
        Self { index, len, blocks }
    }

    /// Returns the index of the piece that is downloaded.
    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks at most `count` blocks to request and appends them to `blocks`.
    ///
    /// Outside endgame only free blocks are picked. In endgame mode blocks
    /// that are already requested (but not received) may be picked again;
    /// the caller must not double-request a block it already has in flight,
    /// which is what `exclude` (the session's own outstanding requests) is
    /// for.
    pub fn pick_blocks(
        &mut self,
        count: usize,
        blocks: &mut Vec<BlockInfo>,
        in_endgame: bool,
        exclude: &[BlockInfo],
    ) -> usize {
        let mut picked = 0;

        for (i, block) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }

            let can_pick = match block {
                Block::Free => true,
                Block::Requested(_) if in_endgame => {
                    let info = block_info(self.index, self.len, i);
                    !exclude.contains(&info)
                }
                _ => false,
            };
            if can_pick {
                blocks.push(block_info(self.index, self.len, i));
                *block = match block {
                    Block::Free => Block::Requested(1),
                    Block::Requested(n) => Block::Requested(*n + 1),
                    Block::Received => unreachable!(),
                };
                picked += 1;
            }
        }

        if picked > 0 {
            log::trace!(
                "Picked {} block(s) for piece {}",
                picked,
                self.index
            );
        }
        picked
    }

    /// Marks the given block as received so that it is not picked again.
    ///
    /// Returns true if the block was not already received, that is, whether
    /// this was the first copy of the block to arrive.
    pub fn received_block(&mut self, block: &BlockInfo) -> bool {
        debug_assert_eq!(block.piece_index, self.index);
        debug_assert!(block.offset < self.len);
        debug_assert!(block.len <= self.len);

        let slot = &mut self.blocks[block.index_in_piece()];
        match slot {
            Block::Received => false,
            _ => {
                *slot = Block::Received;
                true
            }
        }
    }

    /// Releases one peer's request for the block so it may be picked again.
    /// Used when a peer chokes us or disconnects with requests in flight.
    pub fn cancel_request(&mut self, block: &BlockInfo) {
        debug_assert_eq!(block.piece_index, self.index);
        let slot = &mut self.blocks[block.index_in_piece()];
        if let Block::Requested(n) = slot {
            *slot = if *n > 1 {
                Block::Requested(*n - 1)
            } else {
                Block::Free
            };
        }
    }

    /// Frees all blocks, putting the piece back to its starting state. Used
    /// when the completed piece failed its hash check and must be fetched
    /// again.
    pub fn restart(&mut self) {
        for block in self.blocks.iter_mut() {
            *block = Block::Free;
        }
    }

    /// Returns true if no block has been received or requested, that is,
    /// the download can be abandoned and its piece released for re-picking.
    pub fn is_untouched(&self) -> bool {
        self.blocks.iter().all(|block| matches!(block, Block::Free))
    }

    /// Returns true if all blocks in the piece have been received.
    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|block| matches!(block, Block::Received))
    }

    /// Returns the number of blocks not yet received.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|block| !matches!(block, Block::Received))
            .count()
    }
}

fn block_info(
    piece_index: PieceIndex,
    piece_len: u32,
    block_index: usize,
) -> BlockInfo {
    BlockInfo {
        piece_index,
        offset: block_index as u32 * BLOCK_LEN,
        len: block_len(piece_len, block_index),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    // Tests that repeatedly picking single blocks returns all blocks in the
    // piece, none of them twice.
    #[test]
    fn test_pick_all_blocks_one_by_one() {
        let piece_len = 6 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let block_count = block_count(piece_len);
        let mut picked = HashSet::with_capacity(block_count);

        for _ in 0..block_count {
            let mut blocks = Vec::new();
            assert_eq!(download.pick_blocks(1, &mut blocks, false, &[]), 1);
            let block = *blocks.first().unwrap();
            assert!(!picked.contains(&block));
            picked.insert(block);
        }

        assert_eq!(picked.len(), block_count);
        // outside endgame nothing more can be picked
        let mut blocks = Vec::new();
        assert_eq!(download.pick_blocks(1, &mut blocks, false, &[]), 0);
    }

    // Tests that the last block of a short last piece has the runt length.
    #[test]
    fn test_pick_blocks_short_piece() {
        let piece_len = 2 * BLOCK_LEN + 16;
        let mut download = PieceDownload::new(3, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(3, &mut blocks, false, &[]);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].len, 16);
        assert_eq!(blocks[2].offset, 2 * BLOCK_LEN);
    }

    // Tests that receiving all blocks completes the piece and that the
    // first copy of a block is distinguished from duplicates.
    #[test]
    fn test_receive_all_blocks() {
        let piece_len = 4 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(block_count(piece_len), &mut blocks, false, &[]);

        for block in blocks.iter() {
            assert!(download.received_block(block));
            // a duplicate arrival of the same block is reported as such
            assert!(!download.received_block(block));
        }

        assert!(download.is_complete());
        assert_eq!(download.count_missing_blocks(), 0);
    }

    // Tests that a canceled request makes the block pickable again.
    #[test]
    fn test_cancel_request() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks, false, &[]);
        download.cancel_request(&blocks[0]);

        let mut repicked = Vec::new();
        assert_eq!(download.pick_blocks(2, &mut repicked, false, &[]), 1);
        assert_eq!(repicked[0], blocks[0]);
    }

    // Tests endgame block picking: requested blocks may be picked again,
    // except the ones the asking peer itself has in flight.
    #[test]
    fn test_endgame_duplicate_requests() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        // peer A requests both blocks
        let mut peer_a_requests = Vec::new();
        download.pick_blocks(2, &mut peer_a_requests, false, &[]);
        assert_eq!(peer_a_requests.len(), 2);

        // outside endgame, peer B gets nothing
        let mut peer_b_requests = Vec::new();
        assert_eq!(
            download.pick_blocks(2, &mut peer_b_requests, false, &[]),
            0
        );

        // in endgame, peer B may duplicate-request both blocks
        assert_eq!(
            download.pick_blocks(2, &mut peer_b_requests, true, &[]),
            2
        );

        // but peer A, which already has them in flight, may not
        let mut dupes = Vec::new();
        assert_eq!(
            download.pick_blocks(2, &mut dupes, true, &peer_a_requests),
            0
        );

        // once a block is received it can't be picked even in endgame
        assert!(download.received_block(&peer_a_requests[0]));
        let mut more = Vec::new();
        assert_eq!(download.pick_blocks(2, &mut more, true, &[]), 0);
    }

    // Tests that restarting a piece (after a failed hash check) frees all
    // blocks.
    #[test]
    fn test_restart() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks, false, &[]);
        for block in blocks.iter() {
            download.received_block(block);
        }
        assert!(download.is_complete());

        download.restart();
        assert!(!download.is_complete());
        let mut repicked = Vec::new();
        assert_eq!(download.pick_blocks(2, &mut repicked, false, &[]), 2);
    }
}
