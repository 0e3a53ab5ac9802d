//! Torrent files on disk and the descriptor pool that opens them on
//! demand.
//!
//! A session may have thousands of files across its torrents but only
//! a bounded number of file descriptors; handles are opened lazily and
//! kept in an LRU pool, evicting the least recently used handle when the
//! cap is reached. An in-progress file may be staged in the incomplete
//! directory under a `.part` suffix and is moved to its final path once
//! every piece it intersects is complete.

use std::{
    fs,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use lru::LruCache;

use crate::storage_info::FileInfo;

/// One file of a torrent, with its staging state.
#[derive(Debug)]
pub(super) struct TorrentFile {
    /// The file's geometry within the torrent.
    pub info: FileInfo,
    /// Where the finished file lives.
    final_path: PathBuf,
    /// Where the file is staged while incomplete, if an incomplete
    /// directory is configured.
    part_path: Option<PathBuf>,
    /// Whether the content has been moved to (or always lived at) the final
    /// path.
    finalized: bool,
}

impl TorrentFile {
    pub fn new(
        download_dir: &Path,
        incomplete_dir: Option<&Path>,
        info: FileInfo,
    ) -> Self {
        let final_path = download_dir.join(&info.path);
        let part_path = incomplete_dir.map(|dir| {
            let mut path = dir.join(&info.path).into_os_string();
            path.push(".part");
            PathBuf::from(path)
        });
        // if the finished file already exists (a re-added or seeded
        // torrent), don't stage writes elsewhere
        let finalized = part_path.is_none() || final_path.exists();
        Self {
            info,
            final_path,
            part_path,
            finalized,
        }
    }

    /// The path IO currently goes to.
    pub fn current_path(&self) -> &Path {
        if self.finalized {
            &self.final_path
        } else {
            // the constructor only leaves finalized unset with a part path
            self.part_path.as_ref().expect("part path set")
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Moves a staged file to its final path. The rename is atomic on the
    /// same file system; the caller must have evicted the file's handle
    /// from the pool first.
    pub fn finalize(&mut self) -> io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        let part_path = self.part_path.as_ref().expect("part path set");
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        log::debug!(
            "Moving completed file {:?} to {:?}",
            part_path,
            self.final_path
        );
        fs::rename(part_path, &self.final_path)?;
        self.finalized = true;
        Ok(())
    }
}

/// The session wide LRU pool of open file handles.
///
/// Only used from blocking contexts (the disk task's `spawn_blocking`
/// closures), hence the std mutexes. The pool lock is only held while
/// looking up or opening a handle, not during IO.
pub(crate) struct FilePool {
    files: Mutex<LruCache<PathBuf, Arc<Mutex<fs::File>>>>,
}

impl FilePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            files: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    /// Runs the closure with the file at the path, opening (and, for
    /// writes, creating) it if it is not pooled.
    pub fn with_file<R>(
        &self,
        path: &Path,
        create: bool,
        f: impl FnOnce(&mut fs::File) -> io::Result<R>,
    ) -> io::Result<R> {
        let handle = {
            let mut files = self.files.lock().expect("file pool poisoned");
            match files.get(&path.to_path_buf()) {
                Some(handle) => Arc::clone(handle),
                None => {
                    if create {
                        if let Some(parent) = path.parent() {
                            fs::create_dir_all(parent)?;
                        }
                    }
                    let file = fs::OpenOptions::new()
                        .read(true)
                        .write(create)
                        .create(create)
                        .open(path)?;
                    let handle = Arc::new(Mutex::new(file));
                    files.put(path.to_path_buf(), Arc::clone(&handle));
                    handle
                }
            }
        };
        let mut file = handle.lock().expect("file handle poisoned");
        f(&mut file)
    }

    /// Drops the pooled handle for the path, if any. Must be called before
    /// renaming or deleting the underlying file.
    pub fn evict(&self, path: &Path) {
        let mut files = self.files.lock().expect("file pool poisoned");
        files.pop(&path.to_path_buf());
    }
}

/// Writes the whole buffer at the byte offset in the file.
pub(super) fn write_all_at(
    file: &mut fs::File,
    offset: u64,
    buf: &[u8],
) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

/// Reads exactly `buf.len()` bytes at the byte offset in the file.
pub(super) fn read_exact_at(
    file: &mut fs::File,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_info(path: &str, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            torrent_offset: 0,
            len,
        }
    }

    // Tests positioned IO through the pool, including lazy creation of the
    // file and its parent directories.
    #[test]
    fn test_pool_io() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FilePool::new(4);
        let path = dir.path().join("sub").join("test.bin");

        pool.with_file(&path, true, |file| {
            write_all_at(file, 100, b"hello")
        })
        .unwrap();

        let mut buf = [0; 5];
        pool.with_file(&path, false, |file| read_exact_at(file, 100, &mut buf))
            .unwrap();
        assert_eq!(&buf, b"hello");

        // reading past what was written reports EOF
        let mut buf = [0; 5];
        let err = pool
            .with_file(&path, false, |file| {
                read_exact_at(file, 1000, &mut buf)
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    // Tests that the pool evicts handles past its capacity and that
    // evicted files can still be used again (by reopening).
    #[test]
    fn test_pool_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FilePool::new(2);

        let paths: Vec<_> =
            (0..4).map(|i| dir.path().join(format!("{}.bin", i))).collect();
        for (i, path) in paths.iter().enumerate() {
            pool.with_file(path, true, |file| {
                write_all_at(file, 0, &[i as u8])
            })
            .unwrap();
        }
        assert!(pool.files.lock().unwrap().len() <= 2);

        // all files remain accessible
        for (i, path) in paths.iter().enumerate() {
            let mut buf = [0; 1];
            pool.with_file(path, false, |file| {
                read_exact_at(file, 0, &mut buf)
            })
            .unwrap();
            assert_eq!(buf[0], i as u8);
        }
    }

    // Tests the staging lifecycle: writes go to the .part path until the
    // file is finalized, which moves it to the download directory.
    #[test]
    fn test_part_file_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join("done");
        let incomplete_dir = dir.path().join("incomplete");

        let mut file = TorrentFile::new(
            &download_dir,
            Some(&incomplete_dir),
            file_info("test.bin", 5),
        );
        assert!(!file.is_finalized());
        assert_eq!(
            file.current_path(),
            incomplete_dir.join("test.bin.part")
        );

        let pool = FilePool::new(4);
        pool.with_file(file.current_path(), true, |f| {
            write_all_at(f, 0, b"data!")
        })
        .unwrap();

        pool.evict(file.current_path());
        file.finalize().unwrap();
        assert!(file.is_finalized());
        assert_eq!(file.current_path(), download_dir.join("test.bin"));
        assert_eq!(fs::read(file.current_path()).unwrap(), b"data!");
        assert!(!incomplete_dir.join("test.bin.part").exists());
    }

    // Tests that a torrent without an incomplete dir writes straight to the
    // final path.
    #[test]
    fn test_no_staging_without_incomplete_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file =
            TorrentFile::new(dir.path(), None, file_info("test.bin", 5));
        assert!(file.is_finalized());
        assert_eq!(file.current_path(), dir.path().join("test.bin"));
    }
}
