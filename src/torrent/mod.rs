//! The torrent task: the runtime state of one infohash.
//!
//! Each added torrent runs as its own task owning its peers, piece picker,
//! choker, tracker set and statistics. It is driven by a one second tick
//! and by event channels from its peer sessions, the disk task, the
//! verifier, and in-flight announce passes. The engine steers it through
//! a command channel and refers to it only by its [`TorrentId`].

pub(crate) mod stats;

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use bytes::BytesMut;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, RwLock, Semaphore,
    },
    time::{self, Instant},
};

use crate::{
    alert::{Alert, AlertSender},
    block_count,
    choker::{ChokeCandidate, ChokeDecision, Choker, CHOKE_INTERVAL},
    conf::TorrentConf,
    counter::ThruputCounters,
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
    download::PieceDownload,
    magnet::MagnetUri,
    metadata::{MetadataDownload, PexMsg},
    metainfo::Metainfo,
    peer::{self, codec::Handshake, PeerError, SessionStats},
    piece_picker::PiecePicker,
    resume::ResumeData,
    storage_info::StorageInfo,
    tracker::{self, Announce, TrackerSet, TrackerUpdate},
    verify::{Verifier, VerifyFile, VerifyJob, VerifyResult},
    Bitfield, FilePriority, PeerId, PieceIndex, Sha1Hash, TorrentId,
};
pub use stats::{TorrentState, TorrentStats};

/// When fewer than this many blocks are missing torrent wide, endgame mode
/// starts and missing blocks may be requested from several peers at once.
const ENDGAME_THRESHOLD: usize = 20;

/// How many peers we ask trackers for.
const DEFAULT_NUMWANT: usize = 50;

/// How often the resume record is rewritten while the torrent runs.
const RESUME_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// How often the front tracker is scraped for swarm totals.
const SCRAPE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// How often peer exchange updates are sent.
const PEX_INTERVAL: Duration = Duration::from_secs(60);

/// A peer is banned from the torrent after serving this many corrupt
/// pieces.
const MAX_PEER_CORRUPT_PIECES: u32 = 3;

/// The most candidate addresses kept waiting for a free peer slot.
const MAX_QUEUED_PEERS: usize = 200;

/// The state a torrent shares with its peer sessions.
///
/// Peer sessions refer back to their torrent only through this context and
/// the torrent's id, never through a direct handle.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    /// The piece picker, `None` until the metainfo is known.
    pub piece_picker: RwLock<Option<PiecePicker>>,
    /// The in-flight piece downloads, shared by all sessions.
    pub downloads: RwLock<HashMap<PieceIndex, PieceDownload>>,
    /// The storage geometry, `None` until the metainfo is known.
    pub storage: RwLock<Option<StorageInfo>>,
    /// The raw info dictionary, served to magnet peers over the extension
    /// protocol. `None` until the metainfo is known.
    pub metadata_bytes: RwLock<Option<Vec<u8>>>,
    /// Whether the torrent is in endgame mode.
    pub in_endgame: AtomicBool,
    pub disk: DiskHandle,
}

/// The commands the engine sends a torrent.
pub(crate) enum TorrentCommand {
    Start,
    Stop,
    /// Candidate peers from any source (manual, engine level discovery).
    AddPeers(Vec<SocketAddr>),
    /// An accepted connection whose handshake the engine routed to us.
    InboundPeer {
        addr: SocketAddr,
        stream: TcpStream,
        read_buf: BytesMut,
        handshake: Handshake,
    },
    /// Replace the per file priorities and wanted flags.
    SetFileSelection {
        priorities: Vec<FilePriority>,
        wanted: Vec<bool>,
    },
    /// One-off statistics query (the 1 Hz alert stream exists besides).
    QueryStats(oneshot::Sender<TorrentStats>),
    /// Stop, persist, and exit the task. The ack is sent after the
    /// stopped announce was dispatched and state persisted.
    Shutdown(oneshot::Sender<()>),
}

/// Everything a torrent needs at spawn time.
pub(crate) struct TorrentArgs {
    pub id: TorrentId,
    pub client_id: PeerId,
    pub metainfo: Option<Metainfo>,
    pub magnet: Option<MagnetUri>,
    pub conf: TorrentConf,
    pub priority: FilePriority,
    pub resume: Option<ResumeData>,
    /// Where `.torrent` and `.resume` files are persisted.
    pub torrents_dir: PathBuf,
    pub resume_dir: PathBuf,
    pub listen_port: u16,
    pub pex_enabled: bool,
    pub disk: DiskHandle,
    pub verifier: Arc<Verifier>,
    pub announce_permits: Arc<Semaphore>,
    pub alert_tx: AlertSender,
    pub cmd_rx: UnboundedReceiver<TorrentCommand>,
}

/// A connected (or connecting) peer as the torrent tracks it.
struct Peer {
    cmd_tx: peer::CommandSender,
    /// Set once the session reports a completed handshake.
    peer_id: Option<PeerId>,
    /// The latest per second statistics snapshot from the session.
    stats: SessionStats,
    /// How many corrupt pieces this peer contributed to.
    corrupt_count: u32,
    /// From the peer's extended handshake.
    metadata_size: Option<usize>,
    supports_metadata: bool,
    supports_pex: bool,
    /// When we last asked this peer for a metadata piece.
    last_metadata_request: Option<Instant>,
}

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    conf: TorrentConf,
    priority: FilePriority,
    name: String,
    /// The metainfo. `None` while a magnet start is fetching it.
    metainfo: Option<Metainfo>,
    /// The metadata reassembly, while the metainfo is missing.
    metadata_download: Option<MetadataDownload>,

    state: TorrentState,
    error: Option<String>,
    /// Whether the `started` event was announced since the last start.
    announced_started: bool,
    /// The completion bitfield from the resume record, consumed on the
    /// first start (fast resume: trusted without a verification pass).
    resume_bitfield: Option<Vec<u8>>,

    /// The announce URL tiers the torrent was created with, for carrying
    /// magnet trackers into a reconstructed metainfo.
    announce_tiers: Vec<Vec<String>>,
    trackers: TrackerSet,
    announce_permits: Arc<Semaphore>,
    tracker_update_tx: UnboundedSender<TrackerUpdate>,
    tracker_update_rx: UnboundedReceiver<TrackerUpdate>,
    seeder_count: Option<usize>,
    leecher_count: Option<usize>,
    last_scrape: Instant,

    peers: HashMap<SocketAddr, Peer>,
    /// Candidates waiting for a free peer slot, deduplicated against
    /// `peers` and each other.
    peer_queue: Vec<SocketAddr>,
    banned_peers: HashSet<SocketAddr>,
    peer_event_tx: peer::EventSender,
    peer_event_rx: UnboundedReceiver<peer::Event>,
    /// Peers announced via PEX in the previous round, to compute deltas.
    last_pex_sent: HashSet<SocketAddr>,
    last_pex_time: Instant,

    /// The peers that contributed blocks to each in-flight piece, for
    /// corruption attribution.
    piece_contributors: HashMap<PieceIndex, Vec<SocketAddr>>,

    disk_alert_rx: Option<TorrentAlertReceiver>,

    verifier: Arc<Verifier>,
    verify_cancel: Arc<AtomicBool>,
    verify_result_tx: UnboundedSender<VerifyResult>,
    verify_result_rx: UnboundedReceiver<VerifyResult>,

    /// Per file selection, in metainfo file order.
    file_priorities: Vec<FilePriority>,
    file_wanted: Vec<bool>,

    counters: ThruputCounters,
    corrupt_ever: u64,
    /// Duplicate and unsolicited payload received, mostly endgame
    /// races.
    wasted_ever: u64,
    /// Bytes of wanted pieces still missing. Kept current on piece
    /// completion and selection changes; reported to trackers.
    bytes_left: u64,
    choker: Choker,
    last_choke_round: Instant,

    added_date: i64,
    activity_date: i64,
    done_date: i64,
    last_resume_save: Instant,

    torrents_dir: PathBuf,
    resume_dir: PathBuf,
    listen_port: u16,
    pex_enabled: bool,
    alert_tx: AlertSender,
    cmd_rx: UnboundedReceiver<TorrentCommand>,
}

impl Torrent {
    pub fn new(args: TorrentArgs) -> Self {
        let (info_hash, name, trackers) = match (&args.metainfo, &args.magnet)
        {
            (Some(metainfo), _) => (
                metainfo.info_hash,
                metainfo.name.clone(),
                metainfo.trackers.clone(),
            ),
            (None, Some(magnet)) => (
                magnet.info_hash,
                magnet
                    .name
                    .clone()
                    .unwrap_or_else(|| hex::encode(magnet.info_hash)),
                // each magnet tracker becomes its own tier
                magnet
                    .trackers
                    .iter()
                    .map(|url| vec![url.clone()])
                    .collect(),
            ),
            (None, None) => unreachable!("checked by the engine"),
        };

        let ctx = Arc::new(TorrentContext {
            id: args.id,
            info_hash,
            client_id: args.client_id,
            piece_picker: RwLock::new(None),
            downloads: RwLock::new(HashMap::new()),
            storage: RwLock::new(None),
            metadata_bytes: RwLock::new(None),
            in_endgame: AtomicBool::new(false),
            disk: args.disk,
        });

        let (peer_event_tx, peer_event_rx) = mpsc::unbounded_channel();
        let (tracker_update_tx, tracker_update_rx) =
            mpsc::unbounded_channel();
        let (verify_result_tx, verify_result_rx) = mpsc::unbounded_channel();

        let now_ts = unix_now();
        let now = Instant::now();
        let mut counters = ThruputCounters::default();
        let (added_date, activity_date, done_date) = match &args.resume {
            Some(resume) => {
                // lifetime totals carry over; rates start from zero
                counters.down.add_total(resume.downloaded_ever);
                counters.up.add_total(resume.uploaded_ever);
                (resume.added_date, resume.activity_date, resume.done_date)
            }
            None => (now_ts, now_ts, 0),
        };
        let file_count = args
            .metainfo
            .as_ref()
            .map(|metainfo| {
                StorageInfo::new(metainfo, &args.conf.download_dir)
                    .files
                    .len()
            })
            .unwrap_or(0);
        let (file_priorities, file_wanted) = match &args.resume {
            Some(resume) if resume.priorities.len() == file_count => {
                (resume.priorities.clone(), resume.wanted.clone())
            }
            _ => (
                vec![FilePriority::Normal; file_count],
                vec![true; file_count],
            ),
        };
        let corrupt_ever =
            args.resume.as_ref().map(|r| r.corrupt_ever).unwrap_or(0);

        let mut torrent = Self {
            ctx,
            conf: args.conf,
            priority: args.priority,
            name,
            metainfo: args.metainfo,
            metadata_download: None,
            state: TorrentState::Stopped,
            error: None,
            announced_started: false,
            resume_bitfield: None,
            trackers: TrackerSet::new(&trackers),
            announce_tiers: trackers,
            announce_permits: args.announce_permits,
            tracker_update_tx,
            tracker_update_rx,
            seeder_count: None,
            leecher_count: None,
            last_scrape: now,
            peers: HashMap::new(),
            peer_queue: Vec::new(),
            banned_peers: HashSet::new(),
            peer_event_tx,
            peer_event_rx,
            last_pex_sent: HashSet::new(),
            last_pex_time: now,
            piece_contributors: HashMap::new(),
            disk_alert_rx: None,
            verifier: args.verifier,
            verify_cancel: Arc::new(AtomicBool::new(false)),
            verify_result_tx,
            verify_result_rx,
            file_priorities,
            file_wanted,
            counters,
            corrupt_ever,
            wasted_ever: 0,
            bytes_left: 0,
            choker: Choker::new(),
            last_choke_round: now,
            added_date,
            activity_date,
            done_date,
            last_resume_save: now,
            torrents_dir: args.torrents_dir,
            resume_dir: args.resume_dir,
            listen_port: args.listen_port,
            pex_enabled: args.pex_enabled,
            alert_tx: args.alert_tx,
            cmd_rx: args.cmd_rx,
        };

        // seed the peer queue and fast resume state from the resume record
        if let Some(resume) = args.resume {
            torrent.peer_queue = resume.peers;
            if !resume.bitfield.is_empty() {
                torrent.resume_bitfield = Some(resume.bitfield);
            }
        }
        torrent
    }

    pub async fn run(mut self, start_paused: bool) {
        log::info!("Torrent {} ({}) task starting", self.ctx.id, self.name);
        if !start_paused {
            self.start().await;
        }

        let mut tick = time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(TorrentCommand::Shutdown(ack)) => {
                            self.stop().await;
                            let _ = ack.send(());
                            break;
                        }
                        Some(cmd) => self.handle_cmd(cmd).await,
                        // the engine is gone
                        None => break,
                    }
                }
                Some(event) = self.peer_event_rx.recv() => {
                    self.handle_peer_event(event).await;
                }
                alert = recv_disk_alert(&mut self.disk_alert_rx) => {
                    self.handle_disk_alert(alert).await;
                }
                Some(update) = self.tracker_update_rx.recv() => {
                    self.handle_tracker_update(update).await;
                }
                Some(result) = self.verify_result_rx.recv() => {
                    self.handle_verify_result(result).await;
                }
                _ = tick.tick() => {
                    self.tick().await;
                }
            }
        }
        log::info!("Torrent {} task exited", self.ctx.id);
    }

    /// Brings the torrent from stopped into its running state.
    async fn start(&mut self) {
        self.error = None;
        if self.metainfo.is_some() {
            // a restarted torrent resumes from its in-memory piece set;
            // a freshly added one from its resume record, if any
            let bitfield = match self.resume_bitfield.take() {
                Some(bitfield) => Some(bitfield),
                None => {
                    self.ctx.piece_picker.read().await.as_ref().map(
                        |picker| picker.own_pieces().as_raw_slice().to_vec(),
                    )
                }
            };
            self.init_with_metainfo(bitfield).await;
        } else {
            // a magnet start: transfer state says downloading even though
            // only metadata moves until the metainfo is assembled
            self.state = TorrentState::Downloading;
            self.announce(Some(tracker::Event::Started));
            self.announced_started = true;
        }
    }

    /// Sets up storage, picker and disk state from the metainfo and kicks
    /// off verification (or trusts the resume bitfield when one exists).
    async fn init_with_metainfo(&mut self, resume_bitfield: Option<Vec<u8>>) {
        let metainfo = self.metainfo.as_ref().expect("metainfo available");
        let info = StorageInfo::new(metainfo, &self.conf.download_dir);
        let piece_count = info.piece_count;

        if self.file_priorities.len() != info.files.len() {
            self.file_priorities =
                vec![FilePriority::Normal; info.files.len()];
            self.file_wanted = vec![true; info.files.len()];
        }

        *self.ctx.storage.write().await = Some(info.clone());
        *self.ctx.metadata_bytes.write().await =
            Some(metainfo.info_bytes.clone());

        // a resume bitfield of the right size is trusted (fast resume);
        // anything else means a full verification pass
        let resumed_pieces = resume_bitfield.and_then(|bytes| {
            let mut bitfield = Bitfield::from_vec(bytes);
            if bitfield.len() < piece_count {
                return None;
            }
            bitfield.truncate(piece_count);
            Some(bitfield)
        });

        match resumed_pieces {
            Some(pieces) => {
                self.finish_init(info, pieces).await;
            }
            None => {
                self.state = TorrentState::CheckWait;
                self.enqueue_verify(&info).await;
            }
        }
    }

    /// Queues the verification job that produces our completion bitfield.
    async fn enqueue_verify(&mut self, info: &StorageInfo) {
        let metainfo = self.metainfo.as_ref().expect("metainfo available");
        let incomplete_dir = self.incomplete_dir();
        let files = info
            .files
            .iter()
            .map(|file| {
                let final_path = info.download_dir.join(&file.path);
                // files still staged in the incomplete directory carry
                // a .part suffix
                let path = match &incomplete_dir {
                    Some(dir) if !final_path.exists() => {
                        let mut path =
                            dir.join(&file.path).into_os_string();
                        path.push(".part");
                        PathBuf::from(path)
                    }
                    _ => final_path,
                };
                VerifyFile {
                    path,
                    len: file.len,
                }
            })
            .collect::<Vec<_>>();
        let size_on_disk = files
            .iter()
            .map(|file| {
                file.path
                    .metadata()
                    .map(|metadata| metadata.len())
                    .unwrap_or(0)
            })
            .sum();

        self.verify_cancel = Arc::new(AtomicBool::new(false));
        self.verifier.enqueue(VerifyJob {
            torrent_id: self.ctx.id,
            priority: self.priority,
            size_on_disk,
            files,
            piece_len: info.piece_len,
            piece_hashes: metainfo.pieces.clone(),
            cancel: Arc::clone(&self.verify_cancel),
            result_tx: self.verify_result_tx.clone(),
        });
        self.state = TorrentState::Checking;
    }

    /// The torrent's staging directory, scoped to this torrent for multi
    /// file content.
    fn incomplete_dir(&self) -> Option<PathBuf> {
        let dir = self.conf.incomplete_dir.as_ref()?;
        let metainfo = self.metainfo.as_ref()?;
        Some(match &metainfo.structure {
            crate::storage_info::FsStructure::Archive { .. } => {
                dir.join(&metainfo.name)
            }
            _ => dir.clone(),
        })
    }

    async fn handle_verify_result(&mut self, result: VerifyResult) {
        if result.torrent_id != self.ctx.id
            || self.state != TorrentState::Checking
        {
            return;
        }
        let info = match self.ctx.storage.read().await.clone() {
            Some(info) => info,
            None => return,
        };
        self.finish_init(info, result.pieces).await;
    }

    /// Completes initialization once the completion bitfield is known:
    /// registers with the disk task, builds the picker, announces, and
    /// informs waiting peers.
    async fn finish_init(&mut self, info: StorageInfo, pieces: Bitfield) {
        let metainfo = self.metainfo.as_ref().expect("metainfo available");

        let alert_rx = match self
            .ctx
            .disk
            .new_torrent(
                self.ctx.id,
                info.clone(),
                metainfo.pieces.clone(),
                self.incomplete_dir(),
                pieces.clone(),
            )
            .await
        {
            Ok(alert_rx) => alert_rx,
            Err(e) => {
                self.enter_error(format!("storage setup failed: {}", e))
                    .await;
                return;
            }
        };
        self.disk_alert_rx = Some(alert_rx);

        let mut picker = PiecePicker::new(pieces);
        picker.set_sequential(self.conf.sequential_download);
        picker.set_file_priorities(
            &info,
            &self.file_priorities,
            &self.file_wanted,
        );
        let complete = picker.is_complete();
        self.bytes_left = bytes_left(&picker, &info);
        *self.ctx.piece_picker.write().await = Some(picker);

        self.state = if complete {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        };
        if complete && self.done_date == 0 {
            self.done_date = unix_now();
        }

        if !self.announced_started {
            self.announce(Some(tracker::Event::Started));
            self.announced_started = true;
        }

        // peers connected during checking (or during a magnet metadata
        // fetch) can now exchange availability and start requesting
        for peer in self.peers.values() {
            let _ = peer.cmd_tx.send(peer::Command::MetainfoAvailable);
        }
        self.save_resume();
    }

    /// Transitions to the error state: transfers stop but the torrent
    /// stays registered and queryable.
    async fn enter_error(&mut self, reason: String) {
        log::error!("Torrent {} error: {}", self.ctx.id, reason);
        self.error = Some(reason.clone());
        self.disconnect_all_peers();
        self.state = TorrentState::Stopped;
        if self.announced_started {
            self.announce(Some(tracker::Event::Stopped));
            self.announced_started = false;
        }
        let _ = self.alert_tx.send(Alert::TorrentError {
            id: self.ctx.id,
            error: reason,
        });
    }

    /// Stops the torrent: stopped announce, peer teardown, state
    /// persistence.
    async fn stop(&mut self) {
        if self.state == TorrentState::Stopped {
            return;
        }
        log::info!("Stopping torrent {}", self.ctx.id);

        self.verify_cancel.store(true, Ordering::Relaxed);
        self.verifier.remove(self.ctx.id);

        self.disconnect_all_peers();
        self.ctx.disk.remove_torrent(self.ctx.id);
        self.disk_alert_rx = None;

        if self.announced_started {
            // best effort: fired and forgotten with the pass's own timeout
            self.announce(Some(tracker::Event::Stopped));
            self.announced_started = false;
        }

        self.save_resume();
        self.state = TorrentState::Stopped;
        let _ = self
            .alert_tx
            .send(Alert::TorrentStopped { id: self.ctx.id });
    }

    fn disconnect_all_peers(&mut self) {
        for peer in self.peers.values() {
            let _ = peer
                .cmd_tx
                .send(peer::Command::Shutdown { banned: false });
        }
        self.peers.clear();
        self.peer_queue.clear();
        self.piece_contributors.clear();
    }

    async fn handle_cmd(&mut self, cmd: TorrentCommand) {
        match cmd {
            TorrentCommand::Start => {
                if self.state == TorrentState::Stopped {
                    self.start().await;
                }
            }
            TorrentCommand::Stop => self.stop().await,
            TorrentCommand::AddPeers(addrs) => {
                self.add_peer_candidates(addrs);
            }
            TorrentCommand::InboundPeer {
                addr,
                stream,
                read_buf,
                handshake,
            } => {
                self.accept_inbound_peer(addr, stream, read_buf, handshake);
            }
            TorrentCommand::SetFileSelection { priorities, wanted } => {
                self.set_file_selection(priorities, wanted).await;
            }
            TorrentCommand::QueryStats(tx) => {
                let _ = tx.send(self.make_stats().await);
            }
            // handled by the caller
            TorrentCommand::Shutdown(_) => unreachable!(),
        }
    }

    async fn set_file_selection(
        &mut self,
        priorities: Vec<FilePriority>,
        wanted: Vec<bool>,
    ) {
        if priorities.len() != self.file_priorities.len()
            || wanted.len() != self.file_wanted.len()
        {
            log::warn!(
                "Torrent {}: file selection length mismatch",
                self.ctx.id
            );
            return;
        }
        self.file_priorities = priorities;
        self.file_wanted = wanted;

        let storage = self.ctx.storage.read().await.clone();
        if let Some(info) = storage {
            let mut picker = self.ctx.piece_picker.write().await;
            if let Some(picker) = picker.as_mut() {
                picker.set_file_priorities(
                    &info,
                    &self.file_priorities,
                    &self.file_wanted,
                );
                self.bytes_left = bytes_left(picker, &info);
            }
        }
        self.save_resume();
    }

    /// Adds candidate addresses from any discovery source, respecting the
    /// per torrent connection cap and the wait queue bound.
    fn add_peer_candidates(&mut self, addrs: Vec<SocketAddr>) {
        for addr in addrs {
            if self.peers.contains_key(&addr)
                || self.peer_queue.contains(&addr)
                || self.banned_peers.contains(&addr)
            {
                continue;
            }
            if self.is_running() && self.peers.len() < self.conf.peer_limit {
                self.connect_peer(addr);
            } else if self.peer_queue.len() < MAX_QUEUED_PEERS {
                self.peer_queue.push(addr);
            }
        }
    }

    fn is_running(&self) -> bool {
        !matches!(self.state, TorrentState::Stopped) && self.error.is_none()
    }

    fn connect_peer(&mut self, addr: SocketAddr) {
        log::debug!("Torrent {}: connecting peer {}", self.ctx.id, addr);
        let cmd_tx = peer::spawn_outbound(
            Arc::clone(&self.ctx),
            addr,
            self.peer_event_tx.clone(),
        );
        self.peers.insert(addr, new_peer(cmd_tx));
    }

    fn accept_inbound_peer(
        &mut self,
        addr: SocketAddr,
        stream: TcpStream,
        read_buf: BytesMut,
        handshake: Handshake,
    ) {
        if !self.is_running()
            || self.banned_peers.contains(&addr)
            || self.peers.contains_key(&addr)
            || self.peers.len() >= self.conf.peer_limit
        {
            log::debug!(
                "Torrent {}: rejecting inbound peer {}",
                self.ctx.id,
                addr
            );
            // dropping the stream closes the connection
            return;
        }
        let cmd_tx = peer::spawn_inbound(
            Arc::clone(&self.ctx),
            addr,
            stream,
            read_buf,
            handshake,
            self.peer_event_tx.clone(),
        );
        self.peers.insert(addr, new_peer(cmd_tx));
    }

    async fn handle_peer_event(&mut self, event: peer::Event) {
        match event {
            peer::Event::Connected { addr, peer_id } => {
                // a peer id already present means a duplicate connection
                // (e.g. both sides connecting simultaneously): drop the
                // new one
                let duplicate = self.peers.iter().any(|(other, peer)| {
                    *other != addr && peer.peer_id == Some(peer_id)
                });
                if duplicate || peer_id == self.ctx.client_id {
                    if let Some(peer) = self.peers.get(&addr) {
                        let _ = peer
                            .cmd_tx
                            .send(peer::Command::Shutdown { banned: false });
                    }
                    return;
                }
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_id = Some(peer_id);
                }
            }
            peer::Event::ExtendedHandshake { addr, handshake } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.supports_metadata = handshake.ut_metadata.is_some();
                    peer.supports_pex = handshake.ut_pex.is_some();
                    peer.metadata_size = handshake.metadata_size;
                }
                self.maybe_start_metadata_download().await;
            }
            peer::Event::Disconnected { addr, error } => {
                if let Some(peer) = self.peers.remove(&addr) {
                    if matches!(error, Some(PeerError::Banned)) {
                        self.banned_peers.insert(addr);
                    }
                    drop(peer);
                }
                // promote a queued candidate into the freed slot
                if self.is_running()
                    && self.peers.len() < self.conf.peer_limit
                {
                    if let Some(next) = self.pop_queued_peer() {
                        self.connect_peer(next);
                    }
                }
            }
            peer::Event::Stats { addr, stats } => {
                // fold the session's round into the torrent's aggregate
                self.counters.down.add(stats.round_down);
                self.counters.up.add(stats.round_up);
                self.wasted_ever += stats.round_waste;
                if stats.round_down > 0 || stats.round_up > 0 {
                    self.activity_date = unix_now();
                }
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.stats = stats;
                }
            }
            peer::Event::BlockReceived { addr, block } => {
                self.piece_contributors
                    .entry(block.piece_index)
                    .or_default()
                    .push(addr);
                // endgame: cancel everyone else's duplicate request
                if self.ctx.in_endgame.load(Ordering::Relaxed) {
                    for (other, peer) in self.peers.iter() {
                        if *other != addr {
                            let _ = peer
                                .cmd_tx
                                .send(peer::Command::CancelBlock { block });
                        }
                    }
                }
            }
            peer::Event::MetadataPiece {
                addr: _,
                piece,
                total_size,
                payload,
            } => {
                self.handle_metadata_piece(piece, total_size, payload).await;
            }
            peer::Event::MetadataReject { addr: _, piece } => {
                if let Some(download) = &mut self.metadata_download {
                    download.on_reject(piece);
                }
            }
            peer::Event::Pex { addr: _, added } => {
                let private = self
                    .metainfo
                    .as_ref()
                    .map(|metainfo| metainfo.is_private)
                    .unwrap_or(false);
                if self.pex_enabled && !private {
                    self.add_peer_candidates(added);
                }
            }
        }
    }

    fn pop_queued_peer(&mut self) -> Option<SocketAddr> {
        while !self.peer_queue.is_empty() {
            let addr = self.peer_queue.remove(0);
            if !self.peers.contains_key(&addr)
                && !self.banned_peers.contains(&addr)
            {
                return Some(addr);
            }
        }
        None
    }

    /// Starts the metadata download once some peer advertised a metadata
    /// size (BEP-9).
    async fn maybe_start_metadata_download(&mut self) {
        if self.metainfo.is_some() || self.metadata_download.is_some() {
            return;
        }
        let size = self
            .peers
            .values()
            .filter(|peer| peer.supports_metadata)
            .find_map(|peer| peer.metadata_size);
        if let Some(size) = size {
            match MetadataDownload::new(size) {
                Some(download) => {
                    log::info!(
                        "Torrent {}: starting metadata download ({} bytes)",
                        self.ctx.id,
                        size
                    );
                    self.metadata_download = Some(download);
                    self.request_metadata_pieces();
                }
                None => log::warn!(
                    "Torrent {}: implausible metadata size {}",
                    self.ctx.id,
                    size
                ),
            }
        }
    }

    /// Requests due metadata pieces, each from the least recently asked
    /// peer that speaks the extension.
    fn request_metadata_pieces(&mut self) {
        let download = match &mut self.metadata_download {
            Some(download) => download,
            None => return,
        };
        let now = Instant::now();
        while let Some(piece) = download.next_request(now.into()) {
            // least recently asked advertising peer
            let peer = self
                .peers
                .values_mut()
                .filter(|peer| peer.supports_metadata)
                .min_by_key(|peer| peer.last_metadata_request);
            match peer {
                Some(peer) => {
                    peer.last_metadata_request = Some(now);
                    let _ = peer
                        .cmd_tx
                        .send(peer::Command::RequestMetadata { piece });
                }
                None => break,
            }
        }
    }

    async fn handle_metadata_piece(
        &mut self,
        piece: usize,
        total_size: usize,
        payload: Vec<u8>,
    ) {
        let download = match &mut self.metadata_download {
            Some(download) => download,
            None => return,
        };
        if total_size != download.metadata_size() {
            return;
        }
        download.on_data(piece, &payload);
        if !download.is_complete() {
            return;
        }

        let info_bytes = match download.verify(&self.ctx.info_hash) {
            Some(bytes) => bytes.to_vec(),
            // hash mismatch: the download was reset, fetch again
            None => return,
        };

        let mut metainfo = match Metainfo::from_info_bytes(&info_bytes) {
            Ok(metainfo) => metainfo,
            Err(e) => {
                log::warn!(
                    "Torrent {}: reassembled metadata invalid: {}",
                    self.ctx.id,
                    e
                );
                // treat like a hash mismatch: start over
                self.metadata_download = None;
                return;
            }
        };
        log::info!(
            "Torrent {}: metadata complete, `{}`",
            self.ctx.id,
            metainfo.name
        );

        // carry the magnet's trackers into the reconstructed metainfo
        metainfo.trackers = self.announce_tiers.clone();
        self.name = metainfo.name.clone();
        self.metadata_download = None;

        // persist the reconstructed .torrent for the next session
        let torrent_path = self
            .torrents_dir
            .join(format!("{}.torrent", hex::encode(self.ctx.info_hash)));
        if let Err(e) = std::fs::write(&torrent_path, metainfo.encode()) {
            log::warn!(
                "Torrent {}: failed to persist .torrent: {}",
                self.ctx.id,
                e
            );
        }

        self.metainfo = Some(metainfo);
        let _ = self
            .alert_tx
            .send(Alert::MetadataComplete { id: self.ctx.id });

        // on-disk files may already partially exist, so this goes through
        // a verification pass
        self.init_with_metainfo(None).await;
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) {
        match alert {
            TorrentAlert::PieceWritten { index, is_valid } => {
                if is_valid {
                    self.on_piece_complete(index).await;
                } else {
                    self.on_piece_corrupt(index).await;
                }
            }
            TorrentAlert::WriteFailure(error) => {
                self.enter_error(format!("write failed: {}", error)).await;
            }
            TorrentAlert::ReadError { block, error } => {
                log::warn!(
                    "Torrent {}: read of block {} failed: {}",
                    self.ctx.id,
                    block,
                    error
                );
            }
        }
    }

    /// A downloaded piece passed its hash check and is on disk.
    async fn on_piece_complete(&mut self, index: PieceIndex) {
        let piece_len = {
            let storage = self.ctx.storage.read().await;
            storage
                .as_ref()
                .and_then(|info| info.piece_len(index))
                .unwrap_or(0)
        };

        // ordering: the completion bit is set before any `have` goes out
        let all_complete = {
            let mut downloads = self.ctx.downloads.write().await;
            let mut picker = self.ctx.piece_picker.write().await;
            downloads.remove(&index);
            match picker.as_mut() {
                Some(picker) => {
                    picker.received_piece(index);
                    picker.is_complete()
                }
                None => false,
            }
        };
        self.piece_contributors.remove(&index);
        self.activity_date = unix_now();
        self.bytes_left = self.bytes_left.saturating_sub(piece_len as u64);

        for peer in self.peers.values() {
            let _ = peer
                .cmd_tx
                .send(peer::Command::PieceCompleted { index });
        }

        self.update_endgame().await;

        if all_complete {
            log::info!(
                "Torrent {} complete ({} bytes wasted on the way)",
                self.ctx.id,
                self.wasted_ever
            );
            self.state = TorrentState::Seeding;
            if self.done_date == 0 {
                self.done_date = unix_now();
            }
            self.trackers.announce_now();
            self.announce(Some(tracker::Event::Completed));
            let _ = self
                .alert_tx
                .send(Alert::TorrentComplete { id: self.ctx.id });
            self.save_resume();
        } else {
            log::debug!(
                "Torrent {}: piece {} complete ({} bytes)",
                self.ctx.id,
                index,
                piece_len
            );
        }
    }

    /// A downloaded piece failed its hash check: discard it, re-request,
    /// and hold its contributors accountable.
    async fn on_piece_corrupt(&mut self, index: PieceIndex) {
        let piece_len = {
            let storage = self.ctx.storage.read().await;
            storage
                .as_ref()
                .and_then(|info| info.piece_len(index))
                .unwrap_or(0)
        };
        self.corrupt_ever += piece_len as u64;
        log::warn!(
            "Torrent {}: piece {} corrupt ({} bytes)",
            self.ctx.id,
            index,
            piece_len
        );

        {
            let mut downloads = self.ctx.downloads.write().await;
            let mut picker = self.ctx.piece_picker.write().await;
            downloads.remove(&index);
            if let Some(picker) = picker.as_mut() {
                picker.release_piece(index);
            }
        }

        for addr in self
            .piece_contributors
            .remove(&index)
            .unwrap_or_default()
        {
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.corrupt_count += 1;
                if peer.corrupt_count >= MAX_PEER_CORRUPT_PIECES {
                    log::info!(
                        "Torrent {}: banning peer {} after {} corrupt pieces",
                        self.ctx.id,
                        addr,
                        peer.corrupt_count
                    );
                    let _ = peer
                        .cmd_tx
                        .send(peer::Command::Shutdown { banned: true });
                }
            }
        }
    }

    async fn handle_tracker_update(&mut self, update: TrackerUpdate) {
        match &update {
            TrackerUpdate::AnnounceOk { response, .. } => {
                log::debug!(
                    "Torrent {}: announce ok, {} peers",
                    self.ctx.id,
                    response.peers.len()
                );
                if let Some(seeders) = response.seeder_count {
                    self.seeder_count = Some(seeders);
                }
                if let Some(leechers) = response.leecher_count {
                    self.leecher_count = Some(leechers);
                }
                let peers = response.peers.clone();
                self.trackers.handle_update(&update);
                if self.is_running() {
                    self.add_peer_candidates(peers);
                }
            }
            TrackerUpdate::AnnounceFailed => {
                log::info!(
                    "Torrent {}: all trackers failed, backing off",
                    self.ctx.id
                );
                self.trackers.handle_update(&update);
            }
            TrackerUpdate::ScrapeOk(response) => {
                if let Some(seeders) = response.seeder_count {
                    self.seeder_count = Some(seeders);
                }
                if let Some(leechers) = response.leecher_count {
                    self.leecher_count = Some(leechers);
                }
            }
            TrackerUpdate::ScrapeFailed => {}
        }
    }

    /// Dispatches an announce pass with the given event.
    fn announce(&mut self, event: Option<tracker::Event>) {
        if !self.trackers.has_trackers() {
            return;
        }
        let (left, downloaded) = self.transfer_totals();
        let params = Announce {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.listen_port,
            downloaded,
            uploaded: self.counters.up.total(),
            left,
            numwant: if event == Some(tracker::Event::Stopped) {
                0
            } else {
                DEFAULT_NUMWANT
            },
            event,
            tracker_id: self.trackers.tracker_id(),
        };
        self.trackers.announce(
            params,
            Arc::clone(&self.announce_permits),
            self.tracker_update_tx.clone(),
        );
    }

    /// Returns `(bytes left to download, bytes downloaded)`. While the
    /// metainfo is unknown the size is reported as one block so trackers
    /// don't count us as a seed.
    fn transfer_totals(&self) -> (u64, u64) {
        let downloaded = self.counters.down.total();
        if self.metainfo.is_none() {
            return (crate::BLOCK_LEN as u64, downloaded);
        }
        (self.bytes_left, downloaded)
    }

    /// Recomputes whether the torrent is in endgame: fewer than the
    /// threshold of blocks missing across all wanted pieces.
    async fn update_endgame(&mut self) {
        // lock order: downloads before picker before storage, everywhere
        let missing_blocks = {
            let downloads = self.ctx.downloads.read().await;
            let picker = self.ctx.piece_picker.read().await;
            let storage = self.ctx.storage.read().await;
            let (picker, info) = match (picker.as_ref(), storage.as_ref()) {
                (Some(picker), Some(info)) => (picker, info),
                _ => return,
            };
            let missing = picker.missing_pieces();
            if missing.is_empty() {
                self.ctx.in_endgame.store(false, Ordering::Relaxed);
                return;
            }
            // each missing piece contributes at least one block, so a long
            // list can short-circuit
            if missing.len() >= ENDGAME_THRESHOLD {
                self.ctx.in_endgame.store(false, Ordering::Relaxed);
                return;
            }
            missing
                .iter()
                .map(|index| match downloads.get(index) {
                    Some(download) => download.count_missing_blocks(),
                    None => info
                        .piece_len(*index)
                        .map(block_count)
                        .unwrap_or(0),
                })
                .sum::<usize>()
        };
        let in_endgame = missing_blocks < ENDGAME_THRESHOLD;
        if in_endgame != self.ctx.in_endgame.load(Ordering::Relaxed) {
            log::debug!(
                "Torrent {}: endgame {}",
                self.ctx.id,
                if in_endgame { "on" } else { "off" }
            );
            self.ctx.in_endgame.store(in_endgame, Ordering::Relaxed);
        }
    }

    /// The per second housekeeping.
    async fn tick(&mut self) {
        let now = Instant::now();
        self.counters.tick();

        if self.is_running() {
            // periodic announces and scrapes
            if self.trackers.should_announce(now) {
                self.announce(None);
            }
            if now.duration_since(self.last_scrape) >= SCRAPE_INTERVAL {
                self.last_scrape = now;
                self.trackers.scrape(
                    self.ctx.info_hash,
                    Arc::clone(&self.announce_permits),
                    self.tracker_update_tx.clone(),
                );
            }

            // the choke round
            if now.duration_since(self.last_choke_round) >= CHOKE_INTERVAL {
                self.last_choke_round = now;
                self.run_choke_round(now);
            }

            self.request_metadata_pieces();
            self.update_endgame().await;
            self.maybe_send_pex(now);

            // the seed ratio stop policy
            if self.state == TorrentState::Seeding {
                if let (Some(limit), Some(ratio)) =
                    (self.conf.ratio_limit, self.counters.ratio())
                {
                    if ratio >= limit {
                        log::info!(
                            "Torrent {}: seed ratio limit {} reached",
                            self.ctx.id,
                            limit
                        );
                        self.stop().await;
                        return;
                    }
                }
            }

            if now.duration_since(self.last_resume_save)
                >= RESUME_SAVE_INTERVAL
            {
                self.last_resume_save = now;
                self.save_resume();
            }
        }

        let stats = self.make_stats().await;
        let _ = self.alert_tx.send(Alert::TorrentStats {
            id: self.ctx.id,
            stats: Box::new(stats),
        });
    }

    fn run_choke_round(&mut self, now: Instant) {
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.peer_id.is_some())
            .map(|(addr, peer)| ChokeCandidate {
                addr: *addr,
                is_interested: peer.stats.status.is_peer_interested,
                rate_down: peer.stats.rate_down,
                rate_up: peer.stats.rate_up,
            })
            .collect();
        let is_seeding = self.state == TorrentState::Seeding;
        let ChokeDecision { unchoke, choke } =
            self.choker.run_round(&candidates, is_seeding, now.into());

        for addr in unchoke {
            if let Some(peer) = self.peers.get(&addr) {
                let _ = peer.cmd_tx.send(peer::Command::Unchoke);
            }
        }
        for addr in choke {
            if let Some(peer) = self.peers.get(&addr) {
                let _ = peer.cmd_tx.send(peer::Command::Choke);
            }
        }
    }

    /// Sends peer exchange deltas to the peers that speak `ut_pex`.
    fn maybe_send_pex(&mut self, now: Instant) {
        if !self.pex_enabled
            || self
                .metainfo
                .as_ref()
                .map(|metainfo| metainfo.is_private)
                .unwrap_or(false)
            || now.duration_since(self.last_pex_time) < PEX_INTERVAL
        {
            return;
        }
        self.last_pex_time = now;

        let connected: HashSet<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.peer_id.is_some())
            .map(|(addr, _)| *addr)
            .collect();
        let added: Vec<SocketAddr> =
            connected.difference(&self.last_pex_sent).copied().collect();
        let dropped: Vec<SocketAddr> =
            self.last_pex_sent.difference(&connected).copied().collect();
        if added.is_empty() && dropped.is_empty() {
            return;
        }
        self.last_pex_sent = connected;

        let msg = PexMsg { added, dropped };
        for peer in self.peers.values() {
            if peer.supports_pex {
                let _ = peer.cmd_tx.send(peer::Command::Pex(msg.clone()));
            }
        }
    }

    async fn make_stats(&self) -> TorrentStats {
        let (piece_count, pieces_complete, percent_done) = {
            let picker = self.ctx.piece_picker.read().await;
            match picker.as_ref() {
                Some(picker) => {
                    let own = picker.own_pieces();
                    let (complete, missing) = picker.wanted_piece_counts();
                    let percent = if complete + missing == 0 {
                        1.0
                    } else {
                        complete as f64 / (complete + missing) as f64
                    };
                    (own.len(), own.count_ones(), percent)
                }
                None => (0, 0, 0.0),
            }
        };

        let rate_down = self.counters.down.avg();
        let (left, _) = self.transfer_totals();
        let eta = if self.state == TorrentState::Downloading
            && rate_down > 0
            && self.metainfo.is_some()
        {
            Some(Duration::from_secs(left / rate_down))
        } else {
            None
        };

        let peers_sending_to_us = self
            .peers
            .values()
            .filter(|peer| {
                !peer.stats.status.is_choked
                    && peer.stats.outstanding_request_count > 0
            })
            .count();
        let peers_getting_from_us = self
            .peers
            .values()
            .filter(|peer| {
                !peer.stats.status.is_peer_choked
                    && peer.stats.status.is_peer_interested
            })
            .count();

        TorrentStats {
            id: self.ctx.id,
            info_hash: self.ctx.info_hash,
            name: self.name.clone(),
            state: self.state,
            error: self.error.clone(),
            piece_count,
            pieces_complete,
            percent_done,
            rate_down,
            rate_up: self.counters.up.avg(),
            downloaded_ever: self.counters.down.total(),
            uploaded_ever: self.counters.up.total(),
            corrupt_ever: self.corrupt_ever,
            ratio: self.counters.ratio(),
            eta,
            peers_connected: self
                .peers
                .values()
                .filter(|peer| peer.peer_id.is_some())
                .count(),
            peers_sending_to_us,
            peers_getting_from_us,
            seeder_count: self.seeder_count,
            leecher_count: self.leecher_count,
        }
    }

    /// Writes the resume record. Failures are logged, not fatal: the
    /// torrent re-verifies on the next start in the worst case.
    fn save_resume(&mut self) {
        let bitfield = self
            .ctx
            .piece_picker
            .try_read()
            .ok()
            .and_then(|picker| {
                picker
                    .as_ref()
                    .map(|picker| picker.own_pieces().as_raw_slice().to_vec())
            })
            .unwrap_or_default();

        let resume = ResumeData {
            bitfield,
            priorities: self.file_priorities.clone(),
            wanted: self.file_wanted.clone(),
            download_dir: self.conf.download_dir.clone(),
            added_date: self.added_date,
            activity_date: self.activity_date,
            done_date: self.done_date,
            download_rate_limit: None,
            upload_rate_limit: None,
            peers: self
                .peers
                .keys()
                .copied()
                .chain(self.peer_queue.iter().copied())
                .collect(),
            downloaded_ever: self.counters.down.total(),
            uploaded_ever: self.counters.up.total(),
            corrupt_ever: self.corrupt_ever,
        };
        let path = self
            .resume_dir
            .join(format!("{}.resume", hex::encode(self.ctx.info_hash)));
        if let Err(e) = resume.save(&path) {
            log::warn!(
                "Torrent {}: failed to save resume data: {}",
                self.ctx.id,
                e
            );
        }
    }
}

fn new_peer(cmd_tx: peer::CommandSender) -> Peer {
    Peer {
        cmd_tx,
        peer_id: None,
        stats: SessionStats::default(),
        corrupt_count: 0,
        metadata_size: None,
        supports_metadata: false,
        supports_pex: false,
        last_metadata_request: None,
    }
}

/// Receives from the disk alert channel, pending forever while the torrent
/// has no disk state yet (so the select arm simply never fires).
async fn recv_disk_alert(
    rx: &mut Option<TorrentAlertReceiver>,
) -> TorrentAlert {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(alert) => alert,
            None => futures::future::pending().await,
        },
        None => futures::future::pending().await,
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Sums the lengths of the missing wanted pieces.
fn bytes_left(picker: &PiecePicker, info: &StorageInfo) -> u64 {
    picker
        .missing_pieces()
        .iter()
        .map(|index| info.piece_len(*index).unwrap_or(0) as u64)
        .sum()
}
