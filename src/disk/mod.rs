//! The disk IO task.
//!
//! All storage commands of a session are serialized through this task:
//! buffering and hashing in-flight pieces, flushing valid pieces to disk,
//! serving block reads for uploads, and moving completed files out of the
//! incomplete directory. Blocking file IO and hashing run under
//! `spawn_blocking` so the async reactor is never stalled.

mod error;
mod file;
mod piece;

pub(crate) use error::*;

use std::{
    collections::HashMap,
    fs,
    ops::Range,
    path::PathBuf,
    sync::Arc,
};

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task,
};

use crate::{
    peer, storage_info::StorageInfo, Bitfield, BlockInfo, PieceIndex,
    TorrentId, BLOCK_LEN,
};
use file::{FilePool, TorrentFile};
use piece::PieceBuf;

/// Spawns a disk IO task and returns its join handle and the handle used
/// for sending it commands.
pub(crate) fn spawn(
    open_file_limit: usize,
) -> (task::JoinHandle<()>, DiskHandle) {
    log::info!("Spawning disk IO task");
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let mut disk = Disk {
        torrents: HashMap::new(),
        file_pool: Arc::new(FilePool::new(open_file_limit)),
    };
    let join_handle = task::spawn(async move { disk.run(cmd_rx).await });
    (join_handle, DiskHandle(cmd_tx))
}

/// The handle for the disk task, used to execute disk IO related commands.
///
/// It may be cloned an arbitrary number of times; all clones feed the same
/// task.
#[derive(Clone)]
pub(crate) struct DiskHandle(UnboundedSender<Command>);

impl DiskHandle {
    /// Sets up the disk task state and directory structure for a new
    /// torrent and returns the channel on which the torrent will receive
    /// disk alerts.
    ///
    /// `incomplete_dir`, if set, must already be scoped to this torrent
    /// (that is, include the torrent's name directory for multi file
    /// torrents) so staged files of different torrents can't collide.
    pub async fn new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        incomplete_dir: Option<PathBuf>,
        complete_pieces: Bitfield,
    ) -> Result<TorrentAlertReceiver, NewTorrentError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.0
            .send(Command::NewTorrent {
                id,
                info,
                piece_hashes,
                incomplete_dir,
                complete_pieces,
                result_tx,
            })
            .map_err(|_| NewTorrentError::Storage(shut_down_error()))?;
        result_rx
            .await
            .map_err(|_| NewTorrentError::Storage(shut_down_error()))?
    }

    /// Queues a block for eventual writing to disk. Once the block's piece
    /// is complete, it is hashed and flushed, and the result is advertised
    /// on the torrent's alert channel.
    pub fn write_block(&self, id: TorrentId, info: BlockInfo, data: Vec<u8>) {
        let _ = self.0.send(Command::WriteBlock { id, info, data });
    }

    /// Requests a block from disk to serve to a peer. The block is
    /// delivered directly to the peer session's command channel.
    pub fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        peer_tx: peer::CommandSender,
    ) {
        let _ = self.0.send(Command::ReadBlock { id, info, peer_tx });
    }

    /// Removes the torrent's disk state. In-flight but incomplete pieces
    /// are dropped; their blocks will be requested again if the torrent is
    /// restarted.
    pub fn remove_torrent(&self, id: TorrentId) {
        let _ = self.0.send(Command::RemoveTorrent { id });
    }

    /// Shuts down the disk task after the queued commands are served.
    pub fn shutdown(&self) {
        let _ = self.0.send(Command::Shutdown);
    }
}

fn shut_down_error() -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "disk task is shut down",
    ))
}

enum Command {
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        incomplete_dir: Option<PathBuf>,
        complete_pieces: Bitfield,
        result_tx:
            oneshot::Sender<Result<TorrentAlertReceiver, NewTorrentError>>,
    },
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        peer_tx: peer::CommandSender,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    Shutdown,
}

pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// The alerts the disk task sends a torrent.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// A piece was fully downloaded, hashed, and, if valid, written to
    /// disk.
    PieceWritten { index: PieceIndex, is_valid: bool },
    /// A piece could not be written. This is a persistent storage failure;
    /// the torrent should stop requesting blocks and surface the error.
    WriteFailure(WriteError),
    /// A block could not be read for serving a peer. Non-fatal.
    ReadError { block: BlockInfo, error: ReadError },
}

struct Disk {
    torrents: HashMap<TorrentId, Torrent>,
    file_pool: Arc<FilePool>,
}

/// Torrent state tracked by the disk task.
struct Torrent {
    info: StorageInfo,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    files: Vec<TorrentFile>,
    /// The in-progress pieces, that is, the torrent's write buffer. Each
    /// piece is mapped to its index.
    write_buf: HashMap<PieceIndex, PieceBuf>,
    /// Which pieces are verified on disk. Used to decide when a file can be
    /// moved out of the incomplete directory.
    complete_pieces: Bitfield,
    alert_tx: TorrentAlertSender,
}

impl Disk {
    async fn run(&mut self, mut cmd_rx: UnboundedReceiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    incomplete_dir,
                    complete_pieces,
                    result_tx,
                } => {
                    let _ = result_tx.send(self.new_torrent(
                        id,
                        info,
                        piece_hashes,
                        incomplete_dir,
                        complete_pieces,
                    ));
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await;
                }
                Command::ReadBlock { id, info, peer_tx } => {
                    self.read_block(id, info, peer_tx);
                }
                Command::RemoveTorrent { id } => {
                    log::debug!("Removing torrent {} from disk task", id);
                    if let Some(torrent) = self.torrents.remove(&id) {
                        for file in torrent.files.iter() {
                            self.file_pool.evict(file.current_path());
                        }
                    }
                }
                Command::Shutdown => {
                    log::info!("Disk task shutting down");
                    break;
                }
            }
        }
    }

    fn new_torrent(
        &mut self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        incomplete_dir: Option<PathBuf>,
        complete_pieces: Bitfield,
    ) -> Result<TorrentAlertReceiver, NewTorrentError> {
        if self.torrents.contains_key(&id) {
            return Err(NewTorrentError::AlreadyExists);
        }
        debug_assert_eq!(complete_pieces.len(), info.piece_count);

        if !info.download_dir.is_dir() {
            log::info!(
                "Creating missing download directory {:?}",
                info.download_dir
            );
            fs::create_dir_all(&info.download_dir)?;
        }
        if let Some(dir) = &incomplete_dir {
            if !dir.is_dir() {
                fs::create_dir_all(dir)?;
            }
        }

        let files = info
            .files
            .iter()
            .map(|file| {
                TorrentFile::new(
                    &info.download_dir,
                    incomplete_dir.as_deref(),
                    file.clone(),
                )
            })
            .collect();

        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let mut torrent = Torrent {
            info,
            piece_hashes,
            files,
            write_buf: HashMap::new(),
            complete_pieces,
            alert_tx,
        };
        // files that were already complete when the torrent was added (a
        // restarted, partially seeded torrent) can leave staging right away
        torrent.finalize_complete_files(&self.file_pool);
        self.torrents.insert(id, torrent);

        Ok(alert_rx)
    }

    async fn write_block(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) {
        let torrent = match self.torrents.get_mut(&id) {
            Some(torrent) => torrent,
            None => return,
        };
        log::trace!("Torrent {}: saving block {} to disk", id, info);

        if !torrent.is_valid_block(&info) || info.len as usize != data.len() {
            log::warn!("Torrent {}: invalid block {}", id, info);
            // invalid input from some peer; the disk task itself carries on
            return;
        }

        let piece_index = info.piece_index;
        let piece = torrent.write_buf.entry(piece_index).or_insert_with(|| {
            let mut expected_hash = [0; 20];
            expected_hash.copy_from_slice(
                &torrent.piece_hashes[piece_index * 20..piece_index * 20 + 20],
            );
            // the piece index was validated above
            let len = torrent.info.piece_len(piece_index).expect("valid piece");
            PieceBuf::new(expected_hash, len)
        });
        piece.enqueue_block(info.offset, data);

        // if the piece has all its blocks we can hash it, and save it to
        // disk if valid
        if !piece.is_complete() {
            return;
        }
        let piece = torrent
            .write_buf
            .remove(&piece_index)
            .expect("in-flight piece in write buffer");

        // everything the blocking closure needs, gathered up front: the
        // (path, offset in file, range in piece) triples of the piece's
        // bytes
        let write_targets = torrent.write_targets(piece_index, piece.len);
        let file_pool = Arc::clone(&self.file_pool);

        log::debug!(
            "Torrent {}: piece {} complete, hashing and flushing",
            id,
            piece_index
        );

        // don't block the reactor with the potentially expensive hashing
        // and file writing
        let write_result = task::spawn_blocking(move || -> std::io::Result<bool> {
            if !piece.matches_hash() {
                log::warn!("Piece {} failed hash check", piece_index);
                return Ok(false);
            }
            let bytes = piece.assemble();
            for (path, file_offset, piece_range) in write_targets {
                file_pool.with_file(&path, true, |file| {
                    file::write_all_at(
                        file,
                        file_offset,
                        &bytes[piece_range.clone()],
                    )
                })?;
            }
            Ok(true)
        })
        .await
        .expect("disk write task panicked");

        match write_result {
            Ok(is_valid) => {
                if is_valid {
                    torrent.complete_pieces.set(piece_index, true);
                    torrent.finalize_complete_files(&self.file_pool);
                }
                let _ = torrent.alert_tx.send(TorrentAlert::PieceWritten {
                    index: piece_index,
                    is_valid,
                });
            }
            Err(e) => {
                let error = WriteError::from(e);
                log::error!("Torrent {}: disk write error: {}", id, error);
                let _ = torrent
                    .alert_tx
                    .send(TorrentAlert::WriteFailure(error));
            }
        }
    }

    /// Reads a block and sends it directly to the requesting peer session.
    ///
    /// The read runs on a blocking thread and does not hold up the disk
    /// task.
    fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        peer_tx: peer::CommandSender,
    ) {
        let torrent = match self.torrents.get(&id) {
            Some(torrent) => torrent,
            None => return,
        };
        log::trace!("Torrent {}: reading block {} from disk", id, info);

        if !torrent.is_valid_block(&info) {
            let _ = torrent.alert_tx.send(TorrentAlert::ReadError {
                block: info,
                error: ReadError::InvalidBlock,
            });
            return;
        }
        // a block may only be served once its piece is complete
        if !torrent.complete_pieces[info.piece_index] {
            let _ = torrent.alert_tx.send(TorrentAlert::ReadError {
                block: info,
                error: ReadError::DataMissing,
            });
            return;
        }

        let read_targets = torrent.read_targets(&info);
        let file_pool = Arc::clone(&self.file_pool);
        let alert_tx = torrent.alert_tx.clone();

        task::spawn_blocking(move || {
            let mut data = vec![0; info.len as usize];
            let result: Result<(), ReadError> = read_targets.iter().try_fold(
                (),
                |(), (path, file_offset, block_range)| {
                    file_pool.with_file(path, false, |file| {
                        file::read_exact_at(
                            file,
                            *file_offset,
                            &mut data[block_range.clone()],
                        )
                    })?;
                    Ok(())
                },
            );
            match result {
                Ok(()) => {
                    let _ = peer_tx
                        .send(peer::Command::BlockRead { info, data });
                }
                Err(error) => {
                    log::warn!("Error reading block {}: {}", info, error);
                    let _ = alert_tx
                        .send(TorrentAlert::ReadError { block: info, error });
                }
            }
        });
    }
}

/// A resolved IO target: the file's current path, the offset within the
/// file, and the byte range within the piece or block buffer.
type IoTarget = (PathBuf, u64, Range<usize>);

impl Torrent {
    fn is_valid_block(&self, info: &BlockInfo) -> bool {
        let piece_len = match self.info.piece_len(info.piece_index) {
            Some(len) => len,
            None => return false,
        };
        info.offset % BLOCK_LEN == 0
            && info.len > 0
            && info
                .offset
                .checked_add(info.len)
                .map(|end| end <= piece_len)
                .unwrap_or(false)
    }

    /// Resolves the piece's bytes into per file IO targets.
    fn write_targets(
        &self,
        piece_index: PieceIndex,
        piece_len: u32,
    ) -> Vec<IoTarget> {
        self.io_targets(
            self.info.piece_offset(piece_index),
            piece_len as u64,
        )
    }

    /// Resolves a block's bytes into per file IO targets.
    fn read_targets(&self, info: &BlockInfo) -> Vec<IoTarget> {
        self.io_targets(
            self.info.piece_offset(info.piece_index) + info.offset as u64,
            info.len as u64,
        )
    }

    /// Maps `len` bytes starting at the torrent-wide offset onto the
    /// file(s) they live in. The returned targets are contiguous and cover
    /// the whole range.
    fn io_targets(&self, torrent_offset: u64, len: u64) -> Vec<IoTarget> {
        let file_range = self
            .info
            .files_intersecting_bytes(torrent_offset..torrent_offset + len);
        let mut targets = Vec::with_capacity(file_range.len());
        let mut offset = torrent_offset;
        let mut remaining = len;
        for index in file_range {
            let file = &self.files[index];
            let slice = file.info.file_slice(offset, remaining);
            let buf_start = (offset - torrent_offset) as usize;
            targets.push((
                file.current_path().to_path_buf(),
                slice.offset,
                buf_start..buf_start + slice.len as usize,
            ));
            offset += slice.len;
            remaining -= slice.len;
        }
        debug_assert_eq!(remaining, 0);
        targets
    }

    /// Moves every staged file whose pieces are all complete to its final
    /// path.
    fn finalize_complete_files(&mut self, file_pool: &FilePool) {
        let info = &self.info;
        let complete_pieces = &self.complete_pieces;
        for file in self.files.iter_mut() {
            if file.is_finalized() || file.info.len == 0 {
                continue;
            }
            // the pieces the file's byte range intersects
            let first_piece =
                (file.info.torrent_offset / info.piece_len as u64) as usize;
            let last_piece = ((file.info.torrent_end_offset() - 1)
                / info.piece_len as u64) as usize;
            let file_complete = (first_piece..=last_piece)
                .all(|piece| complete_pieces[piece]);
            if file_complete {
                file_pool.evict(file.current_path());
                if let Err(e) = file.finalize() {
                    log::error!(
                        "Failed to move completed file {:?}: {}",
                        file.info.path,
                        e
                    );
                }
            }
        }
    }
}
