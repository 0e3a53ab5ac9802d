//! The background verification worker.
//!
//! Verification reads a torrent's files back from disk and checks every
//! piece hash against the metainfo, producing the completion bitfield
//! a (re)started torrent resumes from. One dedicated OS thread serves all
//! torrents of a session, draining a priority queue ordered by torrent
//! priority first and on-disk size second, so small high priority torrents
//! get verified (and can start transferring) first.
//!
//! Jobs are cancelable at piece boundaries and the worker voluntarily
//! sleeps a little every wall clock second to cap its IO pressure.

use std::{
    fs,
    io::{Read, Seek, SeekFrom},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};
use tokio::sync::mpsc::UnboundedSender;

use crate::{Bitfield, FilePriority, TorrentId};

/// The verify read granularity.
const READ_BUF_LEN: usize = 128 * 1024;

/// Per wall clock second of work, the worker sleeps this long.
const YIELD_INTERVAL: Duration = Duration::from_secs(1);
const YIELD_DURATION: Duration = Duration::from_millis(100);

/// One file of the torrent under verification, with its path resolved (to
/// the staged or the final location) by the torrent.
#[derive(Clone, Debug)]
pub(crate) struct VerifyFile {
    pub path: PathBuf,
    pub len: u64,
}

/// A queued verification job.
pub(crate) struct VerifyJob {
    pub torrent_id: TorrentId,
    /// The torrent's priority; higher priority torrents verify first.
    pub priority: FilePriority,
    /// The bytes the torrent currently occupies on disk; among equal
    /// priorities, smaller torrents verify first.
    pub size_on_disk: u64,
    /// The files in torrent order. Piece geometry is derived from
    /// `piece_len` and the file lengths.
    pub files: Vec<VerifyFile>,
    pub piece_len: u32,
    /// The concatenated expected piece hashes.
    pub piece_hashes: Vec<u8>,
    /// Checked at every piece boundary; a set flag abandons the job.
    pub cancel: Arc<AtomicBool>,
    /// Where the result is delivered.
    pub result_tx: UnboundedSender<VerifyResult>,
}

/// The outcome of a completed (non-canceled) verification.
#[derive(Debug)]
pub(crate) struct VerifyResult {
    pub torrent_id: TorrentId,
    /// One bit per piece: whether the piece on disk hashed correctly.
    pub pieces: Bitfield,
}

struct Shared {
    queue: Mutex<Vec<VerifyJob>>,
    queue_cond: Condvar,
    shutdown: AtomicBool,
}

/// Handle to the verification worker thread.
pub(crate) struct Verifier {
    shared: Arc<Shared>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Verifier {
    /// Spawns the worker thread.
    pub fn spawn() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Vec::new()),
            queue_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let join_handle = thread::Builder::new()
            .name("verify".into())
            .spawn(move || worker(worker_shared))
            .expect("failed to spawn verify worker");
        Self {
            shared,
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    /// Enqueues a job. The queue is drained in priority order, not FIFO.
    pub fn enqueue(&self, job: VerifyJob) {
        let mut queue =
            self.shared.queue.lock().expect("verify queue poisoned");
        queue.push(job);
        self.shared.queue_cond.notify_one();
    }

    /// Cancels the torrent's verification: a queued job is dequeued, and
    /// a running one is abandoned at its next piece boundary (its cancel
    /// flag is assumed to have been set by the caller, which owns it).
    pub fn remove(&self, torrent_id: TorrentId) {
        let mut queue =
            self.shared.queue.lock().expect("verify queue poisoned");
        queue.retain(|job| {
            if job.torrent_id == torrent_id {
                job.cancel.store(true, Ordering::Relaxed);
                false
            } else {
                true
            }
        });
    }

    /// Discards pending jobs and waits for the worker to exit after its
    /// current checkpoint.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        {
            let mut queue =
                self.shared.queue.lock().expect("verify queue poisoned");
            for job in queue.drain(..) {
                job.cancel.store(true, Ordering::Relaxed);
            }
        }
        self.shared.queue_cond.notify_all();
        if let Some(join_handle) = self
            .join_handle
            .lock()
            .expect("verify handle poisoned")
            .take()
        {
            let _ = join_handle.join();
        }
    }
}

impl Drop for Verifier {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker(shared: Arc<Shared>) {
    log::info!("Verify worker started");
    loop {
        let job = {
            let mut queue =
                shared.queue.lock().expect("verify queue poisoned");
            loop {
                if shared.shutdown.load(Ordering::Relaxed) {
                    log::info!("Verify worker shutting down");
                    return;
                }
                if let Some(index) = best_job_index(&queue) {
                    break queue.remove(index);
                }
                queue = shared
                    .queue_cond
                    .wait(queue)
                    .expect("verify queue poisoned");
            }
        };
        // the queue lock is not held while the job runs
        run_job(job);
    }
}

/// Picks the queued job with the highest priority, breaking ties by the
/// smallest size on disk.
fn best_job_index(queue: &[VerifyJob]) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .max_by_key(|(_, job)| {
            (job.priority, std::cmp::Reverse(job.size_on_disk))
        })
        .map(|(index, _)| index)
}

fn run_job(job: VerifyJob) {
    let piece_count = job.piece_hashes.len() / 20;
    let mut pieces = Bitfield::repeat(false, piece_count);
    log::info!(
        "Verifying torrent {} ({} pieces)",
        job.torrent_id,
        piece_count
    );

    let mut reader = TorrentReader {
        files: &job.files,
        file_index: 0,
        file: None,
        file_pos: 0,
    };
    let mut buf = vec![0; READ_BUF_LEN];
    let mut last_yield = Instant::now();

    for index in 0..piece_count {
        // cancellation is checked once per piece; worst case latency is
        // the time to hash a single piece
        if job.cancel.load(Ordering::Relaxed) {
            log::info!("Verification of torrent {} canceled", job.torrent_id);
            return;
        }

        let total_len: u64 = job.files.iter().map(|f| f.len).sum();
        let piece_offset = index as u64 * job.piece_len as u64;
        let piece_len =
            (job.piece_len as u64).min(total_len - piece_offset) as usize;

        let mut hasher = Sha1::new();
        let mut remaining = piece_len;
        let mut ok = true;
        while remaining > 0 {
            let chunk_len = remaining.min(READ_BUF_LEN);
            match reader.read_exact(&mut buf[..chunk_len]) {
                Ok(()) => hasher.update(&buf[..chunk_len]),
                Err(_) => {
                    // a missing or short file is not fatal: the piece is
                    // simply incomplete and the scan continues at the next
                    // piece boundary
                    ok = false;
                    reader.skip_to(piece_offset + piece_len as u64);
                    break;
                }
            }
            remaining -= chunk_len;
        }

        if ok {
            let digest: [u8; 20] = hasher.finalize().into();
            let expected = &job.piece_hashes[index * 20..index * 20 + 20];
            pieces.set(index, digest == *expected);
        }

        // cap the IO pressure: sleep a beat every wall clock second
        if last_yield.elapsed() >= YIELD_INTERVAL {
            thread::sleep(YIELD_DURATION);
            last_yield = Instant::now();
        }
    }

    log::info!(
        "Torrent {} verified: {}/{} pieces valid",
        job.torrent_id,
        pieces.count_ones(),
        piece_count
    );
    let _ = job.result_tx.send(VerifyResult {
        torrent_id: job.torrent_id,
        pieces,
    });
}

/// Reads the torrent's files as one contiguous byte stream.
struct TorrentReader<'a> {
    files: &'a [VerifyFile],
    file_index: usize,
    file: Option<fs::File>,
    /// The stream position, as a torrent-wide byte offset.
    file_pos: u64,
}

impl TorrentReader<'_> {
    /// Fills the whole buffer from the stream, crossing file boundaries as
    /// needed.
    fn read_exact(&mut self, mut buf: &mut [u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            // skip zero length files
            while self.file_index < self.files.len()
                && self.remaining_in_file() == 0
            {
                self.file_index += 1;
                self.file = None;
            }
            if self.file_index >= self.files.len() {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }

            let info = &self.files[self.file_index];
            if self.file.is_none() {
                let mut file = fs::File::open(&info.path)?;
                if self.offset_in_file() > 0 {
                    file.seek(SeekFrom::Start(self.offset_in_file()))?;
                }
                self.file = Some(file);
            }

            let want = (buf.len() as u64).min(self.remaining_in_file()) as usize;
            self.file
                .as_mut()
                .expect("file opened above")
                .read_exact(&mut buf[..want])?;
            self.file_pos += want as u64;
            buf = &mut buf[want..];
        }
        Ok(())
    }

    /// Repositions the stream to the torrent-wide offset after a read
    /// error, so the scan can resume at the next piece.
    fn skip_to(&mut self, torrent_offset: u64) {
        self.file_pos = torrent_offset;
        self.file = None;
        // find the file containing the offset
        let mut start = 0;
        for (index, file) in self.files.iter().enumerate() {
            if torrent_offset < start + file.len {
                self.file_index = index;
                return;
            }
            start += file.len;
        }
        self.file_index = self.files.len();
    }

    fn file_start(&self) -> u64 {
        self.files[..self.file_index].iter().map(|f| f.len).sum()
    }

    fn offset_in_file(&self) -> u64 {
        self.file_pos - self.file_start()
    }

    fn remaining_in_file(&self) -> u64 {
        let info = &self.files[self.file_index];
        self.file_start() + info.len - self.file_pos
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    // Writes two files making up a little torrent and returns the verify
    // file list, the piece hashes, and the content.
    fn make_files(
        dir: &std::path::Path,
        piece_len: u32,
        total_len: usize,
    ) -> (Vec<VerifyFile>, Vec<u8>, Vec<u8>) {
        let content: Vec<u8> =
            (0..total_len).map(|i| (i % 249) as u8).collect();
        let split = total_len * 2 / 3;

        let path_a = dir.join("a.bin");
        let path_b = dir.join("b.bin");
        fs::write(&path_a, &content[..split]).unwrap();
        fs::write(&path_b, &content[split..]).unwrap();

        let mut hashes = Vec::new();
        for chunk in content.chunks(piece_len as usize) {
            let digest: [u8; 20] = Sha1::digest(chunk).into();
            hashes.extend_from_slice(&digest);
        }

        let files = vec![
            VerifyFile {
                path: path_a,
                len: split as u64,
            },
            VerifyFile {
                path: path_b,
                len: (total_len - split) as u64,
            },
        ];
        (files, hashes, content)
    }

    fn make_job(
        files: Vec<VerifyFile>,
        piece_len: u32,
        piece_hashes: Vec<u8>,
        result_tx: UnboundedSender<VerifyResult>,
    ) -> VerifyJob {
        VerifyJob {
            torrent_id: 7,
            priority: FilePriority::Normal,
            size_on_disk: files.iter().map(|f| f.len).sum(),
            files,
            piece_len,
            piece_hashes,
            cancel: Arc::new(AtomicBool::new(false)),
            result_tx,
        }
    }

    // Tests that intact files verify completely, including the short last
    // piece and the file boundary crossing.
    #[tokio::test]
    async fn test_verify_intact() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = 1024;
        let (files, hashes, _) = make_files(dir.path(), piece_len, 10_000);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let verifier = Verifier::spawn();
        verifier.enqueue(make_job(files, piece_len, hashes, tx));

        let result = rx.recv().await.unwrap();
        assert_eq!(result.torrent_id, 7);
        assert_eq!(result.pieces.len(), 10);
        assert!(result.pieces.all());
    }

    // Tests that corrupted bytes invalidate exactly the affected pieces.
    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = 1024;
        let (files, hashes, mut content) =
            make_files(dir.path(), piece_len, 10_000);

        // corrupt one byte in piece 3 (in file a)
        content[3 * 1024 + 10] ^= 0xff;
        let split = 10_000 * 2 / 3;
        fs::write(&files[0].path, &content[..split]).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let verifier = Verifier::spawn();
        verifier.enqueue(make_job(files, piece_len, hashes, tx));

        let result = rx.recv().await.unwrap();
        for index in 0..10 {
            assert_eq!(result.pieces[index], index != 3, "piece {}", index);
        }
    }

    // Tests that a missing file fails its pieces but the rest of the
    // torrent still verifies.
    #[tokio::test]
    async fn test_verify_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = 1024;
        let (files, hashes, _) = make_files(dir.path(), piece_len, 10_000);

        fs::remove_file(&files[1].path).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let verifier = Verifier::spawn();
        verifier.enqueue(make_job(files, piece_len, hashes, tx));

        let result = rx.recv().await.unwrap();
        // file b starts at byte 6666, within piece 6; pieces 0..6 are
        // entirely in file a and stay valid
        for index in 0..6 {
            assert!(result.pieces[index], "piece {}", index);
        }
        for index in 6..10 {
            assert!(!result.pieces[index], "piece {}", index);
        }
    }

    // Tests that a canceled job reports nothing.
    #[tokio::test]
    async fn test_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = 1024;
        let (files, hashes, _) = make_files(dir.path(), piece_len, 10_000);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let verifier = Verifier::spawn();
        let mut job = make_job(files, piece_len, hashes, tx);
        job.cancel = Arc::new(AtomicBool::new(true));
        verifier.enqueue(job);

        // queue another, valid job behind it to prove the worker moved on
        let dir2 = tempfile::tempdir().unwrap();
        let (files2, hashes2, _) = make_files(dir2.path(), piece_len, 2048);
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let mut job2 = make_job(files2, piece_len, hashes2, tx2);
        job2.torrent_id = 8;
        verifier.enqueue(job2);

        let result = rx2.recv().await.unwrap();
        assert_eq!(result.torrent_id, 8);
        // the canceled job never delivered
        assert!(rx.try_recv().is_err());
    }

    // Tests the queue ordering: higher priority wins, then smaller size.
    #[test]
    fn test_job_ordering() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut queue = Vec::new();
        for (id, priority, size) in [
            (0, FilePriority::Normal, 500),
            (1, FilePriority::High, 1000),
            (2, FilePriority::High, 100),
            (3, FilePriority::Low, 1),
        ] {
            queue.push(VerifyJob {
                torrent_id: id,
                priority,
                size_on_disk: size,
                files: vec![],
                piece_len: 1,
                piece_hashes: vec![],
                cancel: Arc::new(AtomicBool::new(false)),
                result_tx: tx.clone(),
            });
        }

        // high priority + smallest size first
        let best = best_job_index(&queue).unwrap();
        assert_eq!(queue[best].torrent_id, 2);
        queue.remove(best);
        let best = best_job_index(&queue).unwrap();
        assert_eq!(queue[best].torrent_id, 1);
        queue.remove(best);
        let best = best_job_index(&queue).unwrap();
        assert_eq!(queue[best].torrent_id, 0);
    }
}
