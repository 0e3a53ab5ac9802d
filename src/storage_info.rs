//! Piece and file geometry: where a piece's bytes live on disk.
//!
//! Files in a torrent are viewed as one contiguous byte array in metainfo
//! order; pieces span that array without regard for file boundaries, so
//! a single block may map to byte ranges in several files. This module does
//! that arithmetic; the disk layer only issues per file positioned reads and
//! writes with the offsets computed here.

use std::{
    ops::Range,
    path::{Path, PathBuf},
};

use crate::{metainfo::Metainfo, FileIndex, PieceIndex};

/// Information about a torrent's file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's path, relative to the torrent's root. For a single file
    /// torrent this is just the torrent name; for multi file torrents it is
    /// the in-archive path (without the torrent name).
    pub path: PathBuf,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for the first file.
    pub torrent_offset: u64,
    /// The file's length, in bytes.
    pub len: u64,
}

impl FileInfo {
    /// Returns a range of the file's first and one past its last byte
    /// offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns one past the file's last byte offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the slice within this file that overlaps the range of `len`
    /// torrent bytes starting at `torrent_offset`.
    ///
    /// The returned slice is clamped to the file's end, so its length may be
    /// smaller than `len` when the range crosses into the next file.
    ///
    /// # Panics
    ///
    /// Panics if `torrent_offset` is outside the file.
    pub(crate) fn file_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(torrent_offset >= self.torrent_offset);
        assert!(torrent_offset < self.torrent_end_offset());
        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(self.torrent_end_offset() - torrent_offset),
        }
    }
}

/// A range of bytes within a single file, relative to the file's start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    pub offset: u64,
    pub len: u64,
}

/// Defines the file system structure of the download.
#[derive(Clone, Debug)]
pub enum FsStructure {
    /// This is a single file download.
    File(FileInfo),
    /// The download is for multiple files, possibly with nested directories.
    Archive { files: Vec<FileInfo> },
}

impl FsStructure {
    /// Returns the total download size in bytes.
    pub fn download_len(&self) -> u64 {
        match self {
            Self::File(file) => file.len,
            Self::Archive { files } => files.iter().map(|f| f.len).sum(),
        }
    }
}

/// Information about a torrent's storage details: piece counts and lengths,
/// download length, and the flattened file list the disk layer works with.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the lengths of all files in the torrent.
    pub download_len: u64,
    /// The directory the torrent's content is placed in. For a multi file
    /// torrent this already includes the torrent's name directory.
    pub download_dir: PathBuf,
    /// All files in the torrent in metainfo order, with paths relative to
    /// `download_dir`.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: &Path) -> Self {
        let piece_count = metainfo.piece_count();
        let piece_len = metainfo.piece_len;
        let download_len = metainfo.download_len();
        let last_piece_len =
            (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;

        let (download_dir, files) = match &metainfo.structure {
            FsStructure::File(file) => {
                (download_dir.to_path_buf(), vec![file.clone()])
            }
            // a multi file torrent's content root is a directory named after
            // the torrent
            FsStructure::Archive { files } => {
                (download_dir.join(&metainfo.name), files.clone())
            }
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files,
        }
    }

    /// Returns the length of the piece at the given index, or `None` if the
    /// index is out of bounds.
    pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
        if index + 1 == self.piece_count {
            Some(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Some(self.piece_len)
        } else {
            None
        }
    }

    /// Returns the byte offset of the piece within the torrent.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Returns the zero based indices of the files that intersect with the
    /// piece, or `None` if the piece index is out of bounds.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Option<Range<FileIndex>> {
        let piece_offset = self.piece_offset(index);
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Some(self.files_intersecting_bytes(piece_offset..piece_end))
    }

    /// Returns the files that overlap with the given left-inclusive range of
    /// torrent bytes.
    pub(crate) fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        // find the index of the file that contains the first byte of the
        // range
        let first = match self
            .files
            .iter()
            .position(|file| file.byte_range().contains(&byte_range.start))
        {
            Some(index) => index,
            None => return 0..0,
        };

        let mut range = first..first + 1;

        // extend over every subsequent file whose first byte the range still
        // contains
        for (index, file) in self.files.iter().enumerate().skip(first + 1) {
            if !byte_range.contains(&file.torrent_offset) {
                break;
            }
            // one past the last intersecting file, as this is left-inclusive
            range.end = index + 1;
        }

        range
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_info(files: Vec<FileInfo>, piece_len: u32) -> StorageInfo {
        let download_len: u64 = files.iter().map(|f| f.len).sum();
        // sanity check that the file offsets follow each other and add up to
        // the download length
        debug_assert_eq!(
            files.iter().fold(0, |offset, file| {
                debug_assert_eq!(offset, file.torrent_offset);
                offset + file.len
            }),
            download_len,
        );
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len =
            (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/"),
            files,
        }
    }

    fn file(path: &str, torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            torrent_offset,
            len,
        }
    }

    #[test]
    fn test_piece_len() {
        let info = make_info(vec![file("a", 0, 14)], 4);
        assert_eq!(info.piece_count, 4);
        assert_eq!(info.piece_len(0), Some(4));
        assert_eq!(info.piece_len(2), Some(4));
        assert_eq!(info.piece_len(3), Some(2));
        assert_eq!(info.piece_len(4), None);
    }

    #[test]
    fn test_files_intersecting_piece() {
        // pieces: (index:first byte offset)
        // --------------------------------------------------------------
        // |0:0         |1:16          |2:32          |3:48        |4:64|
        // --------------------------------------------------------------
        // files: (index:first byte offset,last byte offset)
        // --------------------------------------------------------------
        // |0:0,8 |1:9,19  |2:20,26|3:27,35 |4:36,47  |5:48,63     |6:64,71|
        // --------------------------------------------------------------
        let info = make_info(
            vec![
                file("0", 0, 9),
                file("1", 9, 11),
                file("2", 20, 7),
                file("3", 27, 9),
                file("4", 36, 12),
                file("5", 48, 16),
                file("6", 64, 8),
            ],
            16,
        );
        assert_eq!(info.piece_count, 5);
        assert_eq!(info.last_piece_len, 8);
        // piece 0 intersects with files 0 and 1
        assert_eq!(info.files_intersecting_piece(0), Some(0..2));
        // piece 1 intersects with files 1, 2, 3
        assert_eq!(info.files_intersecting_piece(1), Some(1..4));
        // piece 2 intersects with files 3 and 4
        assert_eq!(info.files_intersecting_piece(2), Some(3..5));
        // piece 3 intersects with only file 5
        assert_eq!(info.files_intersecting_piece(3), Some(5..6));
        // last piece 4 intersects with only file 6
        assert_eq!(info.files_intersecting_piece(4), Some(6..7));
        // piece 5 is invalid
        assert_eq!(info.files_intersecting_piece(5), None);
    }

    #[test]
    fn test_files_intersecting_bytes() {
        let info = make_info(
            vec![
                file("0", 0, 4),
                file("1", 4, 9),
                file("2", 13, 3),
                file("3", 16, 10),
            ],
            8,
        );
        // bytes only in the first file
        assert_eq!(info.files_intersecting_bytes(0..4), 0..1);
        // bytes intersecting two files
        assert_eq!(info.files_intersecting_bytes(0..5), 0..2);
        // bytes ending exactly at a file boundary don't include the next file
        assert_eq!(info.files_intersecting_bytes(0..13), 0..2);
        // bytes intersecting three files
        assert_eq!(info.files_intersecting_bytes(0..15), 0..3);
        // bytes intersecting all files
        assert_eq!(info.files_intersecting_bytes(0..18), 0..4);
        // bytes in the last file only
        assert_eq!(info.files_intersecting_bytes(25..26), 3..4);
        // bytes spanning the middle files
        assert_eq!(info.files_intersecting_bytes(4..16), 1..3);
        assert_eq!(info.files_intersecting_bytes(8..14), 1..3);
        assert_eq!(info.files_intersecting_bytes(13..14), 2..3);
        // bytes past the end of the torrent
        assert_eq!(info.files_intersecting_bytes(30..38), 0..0);
    }

    #[test]
    fn test_file_slice() {
        let file = file("a", 10, 20);
        // a range fully inside the file
        assert_eq!(
            file.file_slice(15, 5),
            FileSlice { offset: 5, len: 5 }
        );
        // a range overhanging the file's end is clamped
        assert_eq!(
            file.file_slice(25, 16),
            FileSlice { offset: 15, len: 5 }
        );
    }
}
