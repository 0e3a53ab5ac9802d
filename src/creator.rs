//! The .torrent creator.
//!
//! Given a file or directory, walks the tree, hashes the content in
//! piece sized chunks and emits a canonical bencoded metainfo file.
//! Hashing large inputs takes a while, so jobs run on a dedicated worker
//! thread, queued and served one at a time, each with a cooperative cancel
//! flag checked between pieces.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::SystemTime,
};

use sha1::{Digest, Sha1};

use crate::{
    alert::{Alert, AlertSender},
    bencode::Value,
};

/// Parameters of one torrent creation job.
#[derive(Clone, Debug)]
pub struct CreateParams {
    /// The file or directory to create the torrent from.
    pub source: PathBuf,
    /// Where the .torrent file is written.
    pub output: PathBuf,
    /// Announce URL tiers, in the same shape as the metainfo's
    /// announce-list.
    pub trackers: Vec<Vec<String>>,
    pub comment: Option<String>,
    /// Mark the torrent private (BEP-27).
    pub is_private: bool,
    /// Overrides the piece length computed from the content size. Must be
    /// a power of two of at least 16 KiB.
    pub piece_len: Option<u32>,
    /// Whether the tree walk follows symlinks. Off by default: a stray
    /// link can otherwise pull unbounded content into the torrent.
    pub follow_symlinks: bool,
}

impl CreateParams {
    pub fn new(
        source: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            trackers: Vec::new(),
            comment: None,
            is_private: false,
            piece_len: None,
            follow_symlinks: false,
        }
    }
}

/// Picks the piece size for a torrent of the given total content size,
/// aiming for a piece table that is neither bloated nor too coarse.
pub fn best_piece_size(total_size: u64) -> u32 {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    let size = if total_size >= 2 * GIB {
        2 * MIB
    } else if total_size >= GIB {
        MIB
    } else if total_size >= 512 * MIB {
        512 * KIB
    } else if total_size >= 350 * MIB {
        256 * KIB
    } else if total_size >= 150 * MIB {
        128 * KIB
    } else if total_size >= 50 * MIB {
        64 * KIB
    } else {
        32 * KIB
    };
    size as u32
}

struct Job {
    params: CreateParams,
    cancel: Arc<AtomicBool>,
    alert_tx: AlertSender,
}

struct Shared {
    queue: Mutex<Vec<Job>>,
    queue_cond: Condvar,
    shutdown: AtomicBool,
}

/// Handle to the creator worker thread. The worker is only spawned when
/// the first job arrives.
pub(crate) struct Creator {
    shared: Arc<Shared>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Creator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Vec::new()),
                queue_cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            join_handle: Mutex::new(None),
        }
    }

    /// Queues a creation job. Jobs are served one at a time, in order.
    /// The result arrives as an [`Alert::TorrentCreated`]; the returned
    /// flag cancels the job.
    pub fn enqueue(
        &self,
        params: CreateParams,
        alert_tx: AlertSender,
    ) -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut queue =
                self.shared.queue.lock().expect("creator queue poisoned");
            queue.push(Job {
                params,
                cancel: Arc::clone(&cancel),
                alert_tx,
            });
        }

        let mut join_handle =
            self.join_handle.lock().expect("creator handle poisoned");
        if join_handle.is_none() {
            let shared = Arc::clone(&self.shared);
            *join_handle = Some(
                thread::Builder::new()
                    .name("creator".into())
                    .spawn(move || worker(shared))
                    .expect("failed to spawn creator worker"),
            );
        }
        self.shared.queue_cond.notify_one();
        cancel
    }

    /// Discards pending jobs and waits for the worker to finish its
    /// current one.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        {
            let mut queue =
                self.shared.queue.lock().expect("creator queue poisoned");
            for job in queue.drain(..) {
                job.cancel.store(true, Ordering::Relaxed);
            }
        }
        self.shared.queue_cond.notify_all();
        if let Some(join_handle) = self
            .join_handle
            .lock()
            .expect("creator handle poisoned")
            .take()
        {
            let _ = join_handle.join();
        }
    }
}

fn worker(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue =
                shared.queue.lock().expect("creator queue poisoned");
            loop {
                if shared.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if !queue.is_empty() {
                    break queue.remove(0);
                }
                queue = shared
                    .queue_cond
                    .wait(queue)
                    .expect("creator queue poisoned");
            }
        };

        let result = create(&job.params, &job.cancel)
            .map_err(|e| e.to_string());
        if job.cancel.load(Ordering::Relaxed) {
            continue;
        }
        let _ = job.alert_tx.send(Alert::TorrentCreated { result });
    }
}

/// Runs one creation job to completion (or cancellation).
fn create(
    params: &CreateParams,
    cancel: &AtomicBool,
) -> std::io::Result<PathBuf> {
    let name = params
        .source
        .file_name()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "source path has no name",
            )
        })?
        .to_string_lossy()
        .into_owned();

    let metadata = entry_metadata(&params.source, params.follow_symlinks)?
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "source is a symlink",
            )
        })?;

    // gather the (relative path, size) list
    let files = if metadata.is_dir() {
        let mut files = Vec::new();
        walk(
            &params.source,
            Path::new(""),
            params.follow_symlinks,
            &mut files,
        )?;
        if files.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "source directory has no files",
            ));
        }
        files
    } else {
        vec![(PathBuf::new(), metadata.len())]
    };
    let total_size: u64 = files.iter().map(|(_, len)| len).sum();
    if total_size == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "source is empty",
        ));
    }

    let piece_len = params.piece_len.unwrap_or_else(|| {
        best_piece_size(total_size)
    });
    log::info!(
        "Creating torrent `{}`: {} bytes, {} byte pieces",
        name,
        total_size,
        piece_len
    );

    let pieces = hash_pieces(
        &params.source,
        &files,
        metadata.is_dir(),
        piece_len,
        cancel,
    )?;
    if cancel.load(Ordering::Relaxed) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "canceled",
        ));
    }

    // the info dictionary
    let mut info = vec![
        (b"name".to_vec(), Value::from_str(&name)),
        (b"piece length".to_vec(), Value::Int(piece_len as i64)),
        (b"pieces".to_vec(), Value::Bytes(pieces)),
    ];
    if params.is_private {
        info.push((b"private".to_vec(), Value::Int(1)));
    }
    if metadata.is_dir() {
        let files = files
            .iter()
            .map(|(path, len)| {
                let components = path
                    .components()
                    .map(|c| {
                        Value::from_bytes(
                            c.as_os_str().to_string_lossy().as_bytes().to_vec(),
                        )
                    })
                    .collect();
                Value::Dict(vec![
                    (b"length".to_vec(), Value::Int(*len as i64)),
                    (b"path".to_vec(), Value::List(components)),
                ])
            })
            .collect();
        info.push((b"files".to_vec(), Value::List(files)));
    } else {
        info.push((b"length".to_vec(), Value::Int(total_size as i64)));
    }

    // the outer dictionary
    let mut torrent = vec![(b"info".to_vec(), Value::Dict(info))];
    if let Some(tracker) = params.trackers.first().and_then(|t| t.first()) {
        torrent.push((b"announce".to_vec(), Value::from_str(tracker)));
        let tiers = params
            .trackers
            .iter()
            .map(|tier| {
                Value::List(tier.iter().map(|t| Value::from_str(t)).collect())
            })
            .collect();
        torrent.push((b"announce-list".to_vec(), Value::List(tiers)));
    }
    if let Some(comment) = &params.comment {
        torrent.push((b"comment".to_vec(), Value::from_str(comment)));
    }
    torrent.push((
        b"created by".to_vec(),
        Value::from_str(concat!("tidetorrent/", env!("CARGO_PKG_VERSION"))),
    ));
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    torrent.push((b"creation date".to_vec(), Value::Int(now)));
    torrent.push((b"encoding".to_vec(), Value::from_str("UTF-8")));

    fs::write(&params.output, Value::Dict(torrent).encode())?;
    Ok(params.output.clone())
}

/// Returns the entry's metadata, or `None` for symlinks that shouldn't be
/// followed.
fn entry_metadata(
    path: &Path,
    follow_symlinks: bool,
) -> std::io::Result<Option<fs::Metadata>> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        if !follow_symlinks {
            return Ok(None);
        }
        return fs::metadata(path).map(Some);
    }
    Ok(Some(metadata))
}

/// Walks the tree depth first, collecting `(relative path, size)` of every
/// file. Hidden entries (dot files) are skipped, as are symlinks unless
/// enabled. The resulting list is sorted by path for a deterministic piece
/// table.
fn walk(
    root: &Path,
    relative: &Path,
    follow_symlinks: bool,
    files: &mut Vec<(PathBuf, u64)>,
) -> std::io::Result<()> {
    let mut entries: Vec<_> =
        fs::read_dir(root.join(relative))?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }
        let entry_relative = relative.join(&file_name);
        let metadata =
            match entry_metadata(&entry.path(), follow_symlinks)? {
                Some(metadata) => metadata,
                None => {
                    log::debug!("Skipping symlink {:?}", entry.path());
                    continue;
                }
            };
        if metadata.is_dir() {
            walk(root, &entry_relative, follow_symlinks, files)?;
        } else if metadata.is_file() {
            files.push((entry_relative, metadata.len()));
        }
    }
    Ok(())
}

/// The SHA-1 pass over the concatenated file contents in piece sized
/// chunks. Checks the cancel flag once per piece.
fn hash_pieces(
    source: &Path,
    files: &[(PathBuf, u64)],
    is_dir: bool,
    piece_len: u32,
    cancel: &AtomicBool,
) -> std::io::Result<Vec<u8>> {
    let mut pieces = Vec::new();
    let mut hasher = Sha1::new();
    let mut piece_fill = 0usize;
    let mut buf = vec![0u8; piece_len as usize];

    for (path, len) in files {
        let path = if is_dir { source.join(path) } else { source.to_path_buf() };
        let mut file = fs::File::open(&path)?;
        let mut remaining = *len;
        while remaining > 0 {
            if cancel.load(Ordering::Relaxed) {
                return Ok(pieces);
            }
            let want =
                (piece_len as usize - piece_fill).min(remaining as usize);
            file.read_exact(&mut buf[..want])?;
            hasher.update(&buf[..want]);
            piece_fill += want;
            remaining -= want as u64;

            if piece_fill == piece_len as usize {
                let digest: [u8; 20] =
                    std::mem::take(&mut hasher).finalize().into();
                pieces.extend_from_slice(&digest);
                piece_fill = 0;
            }
        }
    }
    // the runt last piece
    if piece_fill > 0 {
        let digest: [u8; 20] = hasher.finalize().into();
        pieces.extend_from_slice(&digest);
    }
    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::metainfo::Metainfo;

    // Tests the piece size table against its reference points.
    #[test]
    fn test_best_piece_size() {
        const KIB: u64 = 1024;
        const MIB: u64 = 1024 * KIB;
        const GIB: u64 = 1024 * MIB;
        assert_eq!(best_piece_size(100 * MIB), 64 * KIB as u32);
        assert_eq!(best_piece_size(GIB), MIB as u32);
        assert_eq!(best_piece_size(4 * GIB), 2 * MIB as u32);
        assert_eq!(best_piece_size(10 * KIB), 32 * KIB as u32);
        assert_eq!(best_piece_size(200 * MIB), 128 * KIB as u32);
        assert_eq!(best_piece_size(400 * MIB), 256 * KIB as u32);
        assert_eq!(best_piece_size(600 * MIB), 512 * KIB as u32);
    }

    // Tests creating a torrent from a directory tree: the output parses,
    // the file list is sorted and complete, hidden files are skipped, and
    // the piece hashes match the content.
    #[tokio::test]
    async fn test_create_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("content");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("b.bin"), vec![0xbb; 3000]).unwrap();
        fs::write(source.join("a.bin"), vec![0xaa; 2000]).unwrap();
        fs::write(source.join("sub").join("c.bin"), vec![0xcc; 1000])
            .unwrap();
        fs::write(source.join(".hidden"), b"skip me").unwrap();

        let output = dir.path().join("content.torrent");
        let mut params = CreateParams::new(&source, &output);
        params.trackers =
            vec![vec!["http://tracker.example/announce".to_owned()]];
        params.comment = Some("test torrent".to_owned());
        params.piece_len = Some(1024);

        let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();
        let creator = Creator::new();
        creator.enqueue(params, alert_tx);

        let created = match alert_rx.recv().await.unwrap() {
            Alert::TorrentCreated { result } => result.unwrap(),
            other => panic!("unexpected alert: {:?}", other),
        };
        assert_eq!(created, output);

        let metainfo = Metainfo::from_bytes(&fs::read(&output).unwrap())
            .unwrap();
        assert_eq!(metainfo.name, "content");
        assert_eq!(metainfo.piece_len, 1024);
        assert_eq!(metainfo.download_len(), 6000);
        assert_eq!(metainfo.piece_count(), 6);
        assert_eq!(metainfo.comment.as_deref(), Some("test torrent"));
        match &metainfo.structure {
            crate::storage_info::FsStructure::Archive { files } => {
                let paths: Vec<_> =
                    files.iter().map(|f| f.path.clone()).collect();
                // sorted by path, no hidden file
                assert_eq!(
                    paths,
                    vec![
                        PathBuf::from("a.bin"),
                        PathBuf::from("b.bin"),
                        PathBuf::from("sub/c.bin"),
                    ]
                );
            }
            _ => panic!("expected archive"),
        }

        // the piece hashes match hashing the concatenated content
        let mut content = vec![0xaa; 2000];
        content.extend_from_slice(&vec![0xbb; 3000]);
        content.extend_from_slice(&vec![0xcc; 1000]);
        for (index, chunk) in content.chunks(1024).enumerate() {
            let digest: [u8; 20] = Sha1::digest(chunk).into();
            assert_eq!(metainfo.piece_hash(index), digest, "piece {}", index);
        }

        creator.close();
    }

    // Tests creating a single file torrent with the automatic piece size.
    #[tokio::test]
    async fn test_create_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("single.bin");
        fs::write(&source, vec![0x42; 5000]).unwrap();
        let output = dir.path().join("single.torrent");

        let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();
        let creator = Creator::new();
        creator.enqueue(CreateParams::new(&source, &output), alert_tx);

        match alert_rx.recv().await.unwrap() {
            Alert::TorrentCreated { result } => {
                result.unwrap();
            }
            other => panic!("unexpected alert: {:?}", other),
        }

        let metainfo =
            Metainfo::from_bytes(&fs::read(&output).unwrap()).unwrap();
        assert_eq!(metainfo.name, "single.bin");
        assert_eq!(metainfo.piece_len, 32 * 1024);
        assert_eq!(metainfo.piece_count(), 1);
        assert!(matches!(
            metainfo.structure,
            crate::storage_info::FsStructure::File(_)
        ));
        assert!(metainfo
            .created_by
            .as_deref()
            .unwrap()
            .starts_with("tidetorrent/"));

        creator.close();
    }

    // Tests that symlinks are not followed by default.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("content");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("real.bin"), vec![1; 100]).unwrap();
        fs::write(dir.path().join("outside.bin"), vec![2; 100]).unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("outside.bin"),
            source.join("link.bin"),
        )
        .unwrap();

        let output = dir.path().join("out.torrent");
        let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();
        let creator = Creator::new();
        creator.enqueue(CreateParams::new(&source, &output), alert_tx);

        match alert_rx.recv().await.unwrap() {
            Alert::TorrentCreated { result } => {
                result.unwrap();
            }
            other => panic!("unexpected alert: {:?}", other),
        }
        let metainfo =
            Metainfo::from_bytes(&fs::read(&output).unwrap()).unwrap();
        assert_eq!(metainfo.download_len(), 100);

        creator.close();
    }

    // Tests that jobs queue and are served in order.
    #[tokio::test]
    async fn test_serial_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();
        let creator = Creator::new();

        let mut outputs = Vec::new();
        for i in 0..3usize {
            let source = dir.path().join(format!("{}.bin", i));
            fs::write(&source, vec![i as u8; 100 + i]).unwrap();
            let output = dir.path().join(format!("{}.torrent", i));
            outputs.push(output.clone());
            creator
                .enqueue(CreateParams::new(&source, &output), alert_tx.clone());
        }

        for expected in outputs {
            match alert_rx.recv().await.unwrap() {
                Alert::TorrentCreated { result } => {
                    assert_eq!(result.unwrap(), expected)
                }
                other => panic!("unexpected alert: {:?}", other),
            }
        }

        creator.close();
    }
}
