//! Decides which piece to download next.
//!
//! The picker tracks, for every piece, whether we have it, whether it is
//! already being downloaded, how many of our peers have it (its rarity) and
//! the priority it inherits from the files it intersects. Selection
//! considers wanted pieces only and orders them by priority first, then
//! rarest first, with the piece index as the tiebreak. Two policies modify
//! this: while we have fewer than a handful of complete pieces, picks are
//! uniformly random to avoid swarm wide convergence on the globally rarest
//! piece during bootstrap, and in sequential mode ascending index order
//! replaces rarest first.

use rand::{seq::SliceRandom, Rng};

use crate::{
    storage_info::StorageInfo, Bitfield, FilePriority, PieceIndex,
};

/// While we have fewer than this many complete pieces, pieces are picked at
/// random instead of rarest first.
const RANDOM_FIRST_PIECE_COUNT: usize = 4;

/// Metadata about a piece relevant for the piece picker.
#[derive(Clone, Copy, Debug, Default)]
struct Piece {
    /// The number of peers in the swarm (that we can request from) that have
    /// this piece.
    frequency: usize,
    /// The highest priority of the files this piece intersects.
    priority: Option<FilePriority>,
    /// Whether any file this piece intersects is wanted.
    is_wanted: bool,
    /// Whether the piece is currently being downloaded. Set when the piece
    /// is picked so that it is not picked again while in flight.
    is_pending: bool,
}

pub(crate) struct PiecePicker {
    /// Represents the pieces that we have downloaded and verified.
    ///
    /// The bitfield is preallocated to the number of pieces in the torrent.
    own_pieces: Bitfield,
    /// Piece metadata, preallocated to the number of pieces in the torrent.
    pieces: Vec<Piece>,
    /// Download pieces in ascending index order instead of rarest first.
    sequential: bool,
}

impl PiecePicker {
    /// Creates a piece picker for a torrent whose pieces we already
    /// (partially) have, with every file wanted at normal priority.
    pub fn new(own_pieces: Bitfield) -> Self {
        let mut pieces = Vec::new();
        pieces.resize_with(own_pieces.len(), || Piece {
            priority: Some(FilePriority::Normal),
            is_wanted: true,
            ..Piece::default()
        });
        Self {
            own_pieces,
            pieces,
            sequential: false,
        }
    }

    /// Creates an empty piece picker for the given number of pieces.
    pub fn empty(piece_count: usize) -> Self {
        Self::new(Bitfield::repeat(false, piece_count))
    }

    pub fn set_sequential(&mut self, sequential: bool) {
        self.sequential = sequential;
    }

    /// Returns the pieces we have.
    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    /// Replaces our piece set wholesale. Used after a verification pass
    /// rewrites what is actually on disk.
    pub fn set_own_pieces(&mut self, own_pieces: Bitfield) {
        debug_assert_eq!(own_pieces.len(), self.own_pieces.len());
        self.own_pieces = own_pieces;
        for piece in self.pieces.iter_mut() {
            piece.is_pending = false;
        }
    }

    /// Recomputes every piece's priority and wanted bit from its
    /// intersecting files.
    pub fn set_file_priorities(
        &mut self,
        info: &StorageInfo,
        priorities: &[FilePriority],
        wanted: &[bool],
    ) {
        debug_assert_eq!(priorities.len(), info.files.len());
        debug_assert_eq!(wanted.len(), info.files.len());
        for (index, piece) in self.pieces.iter_mut().enumerate() {
            let files = match info.files_intersecting_piece(index) {
                Some(files) => files,
                None => continue,
            };
            // a piece is wanted if any of its files is wanted, and inherits
            // the highest priority among them
            piece.is_wanted = wanted[files.clone()].iter().any(|w| *w);
            piece.priority =
                priorities[files].iter().max().copied();
        }
    }

    /// Returns the number of missing wanted pieces.
    pub fn count_missing_pieces(&self) -> usize {
        self.own_pieces
            .iter()
            .zip(self.pieces.iter())
            .filter(|(have, piece)| !**have && piece.is_wanted)
            .count()
    }

    /// Returns the indices of the missing wanted pieces.
    pub fn missing_pieces(&self) -> Vec<PieceIndex> {
        self.own_pieces
            .iter()
            .zip(self.pieces.iter())
            .enumerate()
            .filter(|(_, (have, piece))| !**have && piece.is_wanted)
            .map(|(index, _)| index)
            .collect()
    }

    /// Returns `(complete, missing)` counts over the wanted pieces only.
    pub fn wanted_piece_counts(&self) -> (usize, usize) {
        let mut complete = 0;
        let mut missing = 0;
        for (have, piece) in self.own_pieces.iter().zip(self.pieces.iter()) {
            if piece.is_wanted {
                if *have {
                    complete += 1;
                } else {
                    missing += 1;
                }
            }
        }
        (complete, missing)
    }

    /// Returns whether all wanted pieces are downloaded.
    pub fn is_complete(&self) -> bool {
        self.count_missing_pieces() == 0
    }

    /// Registers the availability of a peer's pieces and returns whether
    /// the peer has any piece we are missing.
    pub fn register_peer_pieces(&mut self, pieces: &Bitfield) -> bool {
        debug_assert_eq!(pieces.len(), self.own_pieces.len());
        let mut interested = false;
        for (index, peer_has_piece) in pieces.iter().enumerate() {
            if *peer_has_piece {
                self.pieces[index].frequency += 1;
                if !self.own_pieces[index] {
                    interested = true;
                }
            }
        }
        interested
    }

    /// Registers that a peer announced a single new piece (a `have`
    /// message) and returns whether we are missing it.
    pub fn register_peer_piece(&mut self, index: PieceIndex) -> bool {
        debug_assert!(index < self.pieces.len());
        self.pieces[index].frequency += 1;
        !self.own_pieces[index]
    }

    /// Removes a disconnected peer's pieces from the frequency counts.
    pub fn unregister_peer_pieces(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.own_pieces.len());
        for (index, peer_has_piece) in pieces.iter().enumerate() {
            if *peer_has_piece {
                let frequency = &mut self.pieces[index].frequency;
                *frequency = frequency.saturating_sub(1);
            }
        }
    }

    /// Returns whether the peer with the given pieces has anything we are
    /// missing and want.
    pub fn is_interested(&self, pieces: &Bitfield) -> bool {
        debug_assert_eq!(pieces.len(), self.own_pieces.len());
        self.own_pieces
            .iter()
            .zip(pieces.iter())
            .zip(self.pieces.iter())
            .any(|((own, peer_has), piece)| {
                !*own && *peer_has && piece.is_wanted
            })
    }

    /// Picks the next piece to download from the given peer, or `None` if
    /// the peer has no piece we could start on.
    ///
    /// The picked piece is marked pending so concurrent picks (by other
    /// peer sessions) don't start the same piece.
    pub fn pick_piece(
        &mut self,
        peer_pieces: &Bitfield,
    ) -> Option<PieceIndex> {
        debug_assert_eq!(peer_pieces.len(), self.own_pieces.len());

        let mut candidates: Vec<PieceIndex> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(index, piece)| {
                piece.is_wanted
                    && !piece.is_pending
                    && !self.own_pieces[*index]
                    && peer_pieces[*index]
            })
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let index = if self.own_pieces.count_ones() < RANDOM_FIRST_PIECE_COUNT
        {
            // bootstrap: pick uniformly at random so the swarm doesn't
            // converge on the globally rarest piece
            *candidates
                .choose(&mut rand::thread_rng())
                .expect("candidates not empty")
        } else if self.sequential {
            // candidates are generated in index order
            candidates[0]
        } else {
            // priority DESC, then rarity ASC, then index ASC; the sort is
            // stable so equal keys stay in index order
            candidates.sort_by_key(|index| {
                let piece = &self.pieces[*index];
                (std::cmp::Reverse(piece.priority), piece.frequency)
            });
            candidates[0]
        };

        self.pieces[index].is_pending = true;
        log::trace!("Picked piece {}", index);
        Some(index)
    }

    /// Tells the piece picker that we have downloaded and verified the
    /// piece at the given index.
    pub fn received_piece(&mut self, index: PieceIndex) {
        debug_assert!(index < self.own_pieces.len());
        self.own_pieces.set(index, true);
        // clear pending so that if the piece is later invalidated it can be
        // picked again
        self.pieces[index].is_pending = false;
    }

    /// Puts a previously picked piece back into the pickable pool. Used
    /// when a piece download is abandoned (its only peer disconnected) or
    /// failed its hash check.
    pub fn release_piece(&mut self, index: PieceIndex) {
        debug_assert!(index < self.own_pieces.len());
        self.pieces[index].is_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, path::PathBuf};

    use super::*;
    use crate::storage_info::FileInfo;

    // Makes a picker that is past the random-first bootstrap phase: the
    // first `own` pieces are already downloaded.
    fn picker_past_bootstrap(piece_count: usize, own: usize) -> PiecePicker {
        assert!(own >= RANDOM_FIRST_PIECE_COUNT);
        let mut picker = PiecePicker::empty(piece_count);
        for index in 0..own {
            picker.received_piece(index);
        }
        picker
    }

    // Tests that repeatedly picking pieces returns all missing pieces, none
    // of them twice.
    #[test]
    fn test_pick_all_pieces() {
        let piece_count = 16;
        let mut picker = picker_past_bootstrap(piece_count, 4);
        let peer_pieces = Bitfield::repeat(true, piece_count);
        picker.register_peer_pieces(&peer_pieces);

        let mut picked = HashSet::new();
        for _ in 4..piece_count {
            let index = picker.pick_piece(&peer_pieces).unwrap();
            assert!(!picked.contains(&index));
            picked.insert(index);
        }
        // all missing pieces picked, nothing left
        assert_eq!(picked.len(), piece_count - 4);
        assert_eq!(picker.pick_piece(&peer_pieces), None);
    }

    // Tests that rarer pieces are picked before more common ones.
    #[test]
    fn test_rarest_first() {
        let piece_count = 8;
        let mut picker = picker_past_bootstrap(piece_count, 4);

        // three peers have everything, one peer only has piece 6
        let all = Bitfield::repeat(true, piece_count);
        for _ in 0..3 {
            picker.register_peer_pieces(&all);
        }
        let mut only_six = Bitfield::repeat(false, piece_count);
        only_six.set(6, true);
        picker.register_peer_pieces(&only_six);

        // piece 6 now has frequency 4, the others 3, so the others are
        // picked first, in index order
        assert_eq!(picker.pick_piece(&all), Some(4));
        assert_eq!(picker.pick_piece(&all), Some(5));
        assert_eq!(picker.pick_piece(&all), Some(7));
        assert_eq!(picker.pick_piece(&all), Some(6));
    }

    // Tests that higher priority pieces beat rarer lower priority pieces.
    #[test]
    fn test_priority_beats_rarity() {
        let piece_count = 6;
        let mut picker = picker_past_bootstrap(piece_count, 4);

        // two files of two pieces each (piece length 16): file 0 has
        // pieces 4, file 1 piece 5
        let info = StorageInfo {
            piece_count,
            piece_len: 16,
            last_piece_len: 16,
            download_len: 6 * 16,
            download_dir: PathBuf::from("/"),
            files: vec![
                FileInfo {
                    path: PathBuf::from("a"),
                    torrent_offset: 0,
                    len: 5 * 16,
                },
                FileInfo {
                    path: PathBuf::from("b"),
                    torrent_offset: 5 * 16,
                    len: 16,
                },
            ],
        };
        picker.set_file_priorities(
            &info,
            &[FilePriority::Normal, FilePriority::High],
            &[true, true],
        );

        let all = Bitfield::repeat(true, piece_count);
        picker.register_peer_pieces(&all);
        // make piece 4 much rarer than piece 5
        let mut has_four = Bitfield::repeat(false, piece_count);
        has_four.set(4, true);
        picker.register_peer_pieces(&has_four);
        let mut has_five = Bitfield::repeat(false, piece_count);
        has_five.set(5, true);
        for _ in 0..3 {
            picker.register_peer_pieces(&has_five);
        }

        // the high priority piece 5 is picked despite being more common
        assert_eq!(picker.pick_piece(&all), Some(5));
        assert_eq!(picker.pick_piece(&all), Some(4));
    }

    // Tests that unwanted files' pieces are not picked and don't count as
    // missing.
    #[test]
    fn test_unwanted_files_skipped() {
        let piece_count = 6;
        let mut picker = picker_past_bootstrap(piece_count, 4);

        let info = StorageInfo {
            piece_count,
            piece_len: 16,
            last_piece_len: 16,
            download_len: 6 * 16,
            download_dir: PathBuf::from("/"),
            files: vec![
                FileInfo {
                    path: PathBuf::from("a"),
                    torrent_offset: 0,
                    len: 5 * 16,
                },
                FileInfo {
                    path: PathBuf::from("b"),
                    torrent_offset: 5 * 16,
                    len: 16,
                },
            ],
        };
        picker.set_file_priorities(
            &info,
            &[FilePriority::Normal, FilePriority::Normal],
            &[true, false],
        );

        let all = Bitfield::repeat(true, piece_count);
        picker.register_peer_pieces(&all);

        assert_eq!(picker.count_missing_pieces(), 1);
        assert_eq!(picker.pick_piece(&all), Some(4));
        assert_eq!(picker.pick_piece(&all), None);
        // the unwanted piece doesn't block completion
        picker.received_piece(4);
        assert!(picker.is_complete());
        // and an otherwise interesting peer isn't interesting for it
        assert!(!picker.is_interested(&all));
    }

    // Tests that in sequential mode pieces are picked in index order
    // regardless of rarity.
    #[test]
    fn test_sequential_mode() {
        let piece_count = 8;
        let mut picker = picker_past_bootstrap(piece_count, 4);
        picker.set_sequential(true);

        let all = Bitfield::repeat(true, piece_count);
        picker.register_peer_pieces(&all);
        // make piece 7 the rarest
        for _ in 0..2 {
            let mut most = Bitfield::repeat(true, piece_count);
            most.set(7, false);
            picker.register_peer_pieces(&most);
        }

        assert_eq!(picker.pick_piece(&all), Some(4));
        assert_eq!(picker.pick_piece(&all), Some(5));
        assert_eq!(picker.pick_piece(&all), Some(6));
        assert_eq!(picker.pick_piece(&all), Some(7));
    }

    // Tests that during bootstrap (fewer than 4 complete pieces) a random
    // candidate is picked, but always a valid one.
    #[test]
    fn test_random_first_pick_is_valid() {
        let piece_count = 32;
        for _ in 0..16 {
            let mut picker = PiecePicker::empty(piece_count);
            let mut peer_pieces = Bitfield::repeat(false, piece_count);
            for index in [3, 9, 20] {
                peer_pieces.set(index, true);
            }
            picker.register_peer_pieces(&peer_pieces);

            let index = picker.pick_piece(&peer_pieces).unwrap();
            assert!(peer_pieces[index]);
        }
    }

    // Tests that a released piece can be picked again while a received one
    // can't.
    #[test]
    fn test_release_piece() {
        let piece_count = 6;
        let mut picker = picker_past_bootstrap(piece_count, 4);
        let all = Bitfield::repeat(true, piece_count);
        picker.register_peer_pieces(&all);

        let index = picker.pick_piece(&all).unwrap();
        picker.release_piece(index);
        assert_eq!(picker.pick_piece(&all), Some(index));

        picker.received_piece(index);
        let next = picker.pick_piece(&all).unwrap();
        assert_ne!(next, index);
    }

    // Tests interest bookkeeping as availability is registered and
    // unregistered.
    #[test]
    fn test_interest() {
        let piece_count = 8;
        let mut picker = PiecePicker::empty(piece_count);

        let all = Bitfield::repeat(true, piece_count);
        assert!(picker.register_peer_pieces(&all));
        assert!(picker.is_interested(&all));

        // a peer with only pieces we own is not interesting
        for index in 0..piece_count {
            picker.received_piece(index);
        }
        assert!(!picker.is_interested(&all));

        picker.unregister_peer_pieces(&all);
        for piece in picker.pieces.iter() {
            assert_eq!(piece.frequency, 0);
        }
    }
}
