//! The engine: the session core owning the torrent table and the shared
//! services every torrent uses.
//!
//! The engine runs as a task listening on a command channel; all mutations
//! of session state happen there, so nothing else ever touches the torrent
//! table concurrently. It also owns the inbound peer listener (with the
//! blocklist gate at accept time), the watch directory poller, the disk
//! task, the verification and creation workers, and the persisted state
//! layout under the configuration directory.

use std::{
    collections::HashMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use bytes::BytesMut;
use futures::StreamExt;
use rand::Rng;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, Semaphore,
    },
    task, time,
};
use tokio_util::codec::Framed;

use crate::{
    alert::{Alert, AlertReceiver, AlertSender},
    blocklist::Blocklist,
    conf::Conf,
    creator::{CreateParams, Creator},
    disk::{self, DiskHandle},
    error::{Error, Result},
    magnet::MagnetUri,
    metainfo::Metainfo,
    peer::codec::{Handshake, HandshakeCodec},
    peer::HANDSHAKE_TIMEOUT,
    torrent::{
        stats::TorrentStats, Torrent, TorrentArgs, TorrentCommand,
    },
    verify::Verifier,
    FilePriority, PeerId, Sha1Hash, TorrentId,
};

/// The directories the engine keeps under its config dir.
const TORRENTS_DIR: &str = "torrents";
const RESUME_DIR: &str = "resume";
const BLOCKLISTS_DIR: &str = "blocklists";

/// The compiled blocklist cache file.
const BLOCKLIST_CACHE: &str = "blocklist.bin";

/// Everything needed to add a torrent to the engine.
#[derive(Debug)]
pub struct TorrentParams {
    /// The full metainfo, for a .torrent based add.
    pub metainfo: Option<Metainfo>,
    /// The magnet link, for a metadata-less add. Exactly one of `metainfo`
    /// and `magnet` must be set.
    pub magnet: Option<MagnetUri>,
    /// Overrides the engine's default download directory.
    pub download_dir: Option<PathBuf>,
    /// The torrent's priority, which among other things orders the
    /// verification queue.
    pub priority: FilePriority,
    /// Download pieces in order instead of rarest first.
    pub sequential: bool,
    /// Add the torrent without starting it.
    pub start_paused: bool,
}

impl TorrentParams {
    pub fn new_metainfo(metainfo: Metainfo) -> Self {
        Self {
            metainfo: Some(metainfo),
            magnet: None,
            download_dir: None,
            priority: FilePriority::Normal,
            sequential: false,
            start_paused: false,
        }
    }

    pub fn new_magnet(magnet: MagnetUri) -> Self {
        Self {
            metainfo: None,
            magnet: Some(magnet),
            download_dir: None,
            priority: FilePriority::Normal,
            sequential: false,
            start_paused: false,
        }
    }
}

/// Spawns an engine with the given configuration.
///
/// Returns the handle the application drives the engine with and the
/// channel its alerts arrive on. Fails if the configured state directories
/// cannot be created or the peer listen port cannot be bound.
pub fn spawn(conf: Conf) -> Result<(EngineHandle, AlertReceiver)> {
    let config_dir = conf.engine.config_dir.clone();
    for dir in [TORRENTS_DIR, RESUME_DIR, BLOCKLISTS_DIR] {
        fs::create_dir_all(config_dir.join(dir))?;
    }

    let client_id = generate_client_id();
    let listen_port = if conf.engine.randomize_listen_port {
        let range = conf.engine.listen_port_range.clone();
        rand::thread_rng().gen_range(range)
    } else {
        conf.engine.listen_port
    };

    // a failure to bind the peer port is fatal to the session
    let listener = std::net::TcpListener::bind(("0.0.0.0", listen_port))?;
    listener.set_nonblocking(true)?;

    // the blocklist starts from its compiled cache, if one exists
    let blocklist = Arc::new(RwLock::new(
        if conf.engine.blocklist_enabled {
            let cache = config_dir.join(BLOCKLISTS_DIR).join(BLOCKLIST_CACHE);
            match Blocklist::load_cache(&cache) {
                Ok(blocklist) => {
                    log::info!(
                        "Loaded blocklist cache with {} ranges",
                        blocklist.len()
                    );
                    blocklist
                }
                Err(_) => Blocklist::default(),
            }
        } else {
            Blocklist::default()
        },
    ));

    let (alert_tx, alert_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let (_disk_join, disk) = disk::spawn(conf.engine.open_file_limit);
    let announce_permits =
        Arc::new(Semaphore::new(conf.engine.concurrent_announce_limit.max(1)));

    let engine = Engine {
        conf,
        client_id,
        listen_port,
        torrents: HashMap::new(),
        torrents_by_hash: HashMap::new(),
        next_torrent_id: 1,
        disk,
        verifier: Arc::new(Verifier::spawn()),
        creator: Arc::new(Creator::new()),
        announce_permits,
        blocklist: Arc::clone(&blocklist),
        watched_files: HashMap::new(),
        alert_tx,
        cmd_tx: cmd_tx.clone(),
    };

    // the inbound peer listener runs besides the engine loop
    let listener = TcpListener::from_std(listener)?;
    task::spawn(listen_for_peers(listener, cmd_tx.clone(), blocklist));
    task::spawn(engine.run(cmd_rx));

    log::info!("Engine started, listening on port {}", listen_port);
    Ok((EngineHandle { cmd_tx }, alert_rx))
}

/// The handle the embedding application drives the engine with.
///
/// May be cloned freely; all clones address the same engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: UnboundedSender<Command>,
}

impl EngineHandle {
    /// Adds a torrent. The assigned id arrives in the
    /// [`Alert::TorrentAdded`] alert.
    pub fn add_torrent(&self, params: TorrentParams) -> Result<()> {
        self.cmd_tx
            .send(Command::AddTorrent { params })
            .map_err(|_| Error::EngineShutDown)
    }

    /// Removes the torrent from the session: stops it, deletes its resume
    /// record and persisted .torrent. Downloaded content stays on disk.
    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.cmd_tx
            .send(Command::RemoveTorrent { id })
            .map_err(|_| Error::EngineShutDown)
    }

    pub fn start_torrent(&self, id: TorrentId) -> Result<()> {
        self.cmd_tx
            .send(Command::StartTorrent { id })
            .map_err(|_| Error::EngineShutDown)
    }

    pub fn stop_torrent(&self, id: TorrentId) -> Result<()> {
        self.cmd_tx
            .send(Command::StopTorrent { id })
            .map_err(|_| Error::EngineShutDown)
    }

    /// Hands the torrent candidate peer addresses (e.g. from the
    /// application's own discovery).
    pub fn add_peers(&self, id: TorrentId, peers: Vec<SocketAddr>) -> Result<()> {
        self.cmd_tx
            .send(Command::AddPeers { id, peers })
            .map_err(|_| Error::EngineShutDown)
    }

    /// Sets the torrent's per file priorities and wanted flags.
    pub fn set_file_selection(
        &self,
        id: TorrentId,
        priorities: Vec<FilePriority>,
        wanted: Vec<bool>,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::SetFileSelection {
                id,
                priorities,
                wanted,
            })
            .map_err(|_| Error::EngineShutDown)
    }

    /// Queries a torrent's current statistics snapshot.
    pub async fn stats(&self, id: TorrentId) -> Result<TorrentStats> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::QueryStats { id, result_tx })
            .map_err(|_| Error::EngineShutDown)?;
        result_rx.await.map_err(|_| Error::EngineShutDown)?
    }

    /// Queues a torrent creation job; the outcome arrives as an
    /// [`Alert::TorrentCreated`].
    pub fn create_torrent(&self, params: CreateParams) -> Result<()> {
        self.cmd_tx
            .send(Command::CreateTorrent { params })
            .map_err(|_| Error::EngineShutDown)
    }

    /// Loads (or fetches) the configured blocklist and compiles its cache.
    /// Returns the number of ranges loaded.
    pub async fn update_blocklist(&self) -> Result<usize> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::UpdateBlocklist { result_tx })
            .map_err(|_| Error::EngineShutDown)?;
        result_rx.await.map_err(|_| Error::EngineShutDown)?
    }

    /// Re-reads `settings.json` and applies the mutable settings. Running
    /// torrents are not restarted.
    pub async fn reload_conf(&self) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReloadConf { result_tx })
            .map_err(|_| Error::EngineShutDown)?;
        result_rx.await.map_err(|_| Error::EngineShutDown)?
    }

    /// Gracefully shuts the engine down: every torrent announces
    /// `stopped` and persists its state, then the workers exit.
    pub async fn shutdown(&self) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { result_tx })
            .map_err(|_| Error::EngineShutDown)?;
        result_rx.await.map_err(|_| Error::EngineShutDown)
    }
}

enum Command {
    AddTorrent {
        params: TorrentParams,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    StartTorrent {
        id: TorrentId,
    },
    StopTorrent {
        id: TorrentId,
    },
    AddPeers {
        id: TorrentId,
        peers: Vec<SocketAddr>,
    },
    SetFileSelection {
        id: TorrentId,
        priorities: Vec<FilePriority>,
        wanted: Vec<bool>,
    },
    QueryStats {
        id: TorrentId,
        result_tx: oneshot::Sender<Result<TorrentStats>>,
    },
    CreateTorrent {
        params: CreateParams,
    },
    UpdateBlocklist {
        result_tx: oneshot::Sender<Result<usize>>,
    },
    ReloadConf {
        result_tx: oneshot::Sender<Result<()>>,
    },
    /// An accepted inbound connection whose handshake was read by the
    /// listener; the engine routes it to the torrent with that info hash.
    RoutedInbound {
        addr: SocketAddr,
        stream: TcpStream,
        read_buf: BytesMut,
        handshake: Handshake,
    },
    Shutdown {
        result_tx: oneshot::Sender<()>,
    },
}

struct TorrentEntry {
    cmd_tx: UnboundedSender<TorrentCommand>,
    info_hash: Sha1Hash,
}

struct Engine {
    conf: Conf,
    client_id: PeerId,
    listen_port: u16,
    torrents: HashMap<TorrentId, TorrentEntry>,
    torrents_by_hash: HashMap<Sha1Hash, TorrentId>,
    next_torrent_id: TorrentId,
    disk: DiskHandle,
    verifier: Arc<Verifier>,
    creator: Arc<Creator>,
    announce_permits: Arc<Semaphore>,
    blocklist: Arc<RwLock<Blocklist>>,
    /// Watch directory candidates: size at the last poll. A file is only
    /// added once two consecutive polls see the same size, so half written
    /// files aren't picked up.
    watched_files: HashMap<PathBuf, u64>,
    alert_tx: AlertSender,
    cmd_tx: UnboundedSender<Command>,
}

impl Engine {
    async fn run(mut self, mut cmd_rx: UnboundedReceiver<Command>) {
        let mut tick = time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown { result_tx }) => {
                            self.shutdown().await;
                            let _ = result_tx.send(());
                            break;
                        }
                        Some(cmd) => self.handle_cmd(cmd).await,
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.poll_watch_dir();
                }
            }
        }
        log::info!("Engine task exited");
    }

    async fn handle_cmd(&mut self, cmd: Command) {
        match cmd {
            Command::AddTorrent { params } => {
                if let Err(e) = self.add_torrent(params) {
                    log::warn!("Failed to add torrent: {}", e);
                }
            }
            Command::RemoveTorrent { id } => self.remove_torrent(id).await,
            Command::StartTorrent { id } => {
                self.send_to_torrent(id, TorrentCommand::Start);
            }
            Command::StopTorrent { id } => {
                self.send_to_torrent(id, TorrentCommand::Stop);
            }
            Command::AddPeers { id, peers } => {
                // the blocklist gates every peer source
                let peers = {
                    let blocklist =
                        self.blocklist.read().expect("blocklist poisoned");
                    peers
                        .into_iter()
                        .filter(|addr| !blocklist.contains(addr.ip()))
                        .collect()
                };
                self.send_to_torrent(id, TorrentCommand::AddPeers(peers));
            }
            Command::SetFileSelection {
                id,
                priorities,
                wanted,
            } => {
                self.send_to_torrent(
                    id,
                    TorrentCommand::SetFileSelection { priorities, wanted },
                );
            }
            Command::QueryStats { id, result_tx } => {
                match self.torrents.get(&id) {
                    Some(entry) => {
                        let (tx, rx) = oneshot::channel();
                        if entry
                            .cmd_tx
                            .send(TorrentCommand::QueryStats(tx))
                            .is_ok()
                        {
                            // answer from the torrent task without blocking
                            // the engine loop
                            task::spawn(async move {
                                let result = rx
                                    .await
                                    .map_err(|_| Error::TorrentNotFound(id));
                                let _ = result_tx.send(result);
                            });
                        } else {
                            let _ = result_tx
                                .send(Err(Error::TorrentNotFound(id)));
                        }
                    }
                    None => {
                        let _ =
                            result_tx.send(Err(Error::TorrentNotFound(id)));
                    }
                }
            }
            Command::CreateTorrent { params } => {
                self.creator.enqueue(params, self.alert_tx.clone());
            }
            Command::UpdateBlocklist { result_tx } => {
                self.update_blocklist(result_tx);
            }
            Command::ReloadConf { result_tx } => {
                let _ = result_tx.send(self.reload_conf());
            }
            Command::RoutedInbound {
                addr,
                stream,
                read_buf,
                handshake,
            } => {
                let id = self.torrents_by_hash.get(&handshake.info_hash);
                match id {
                    Some(id) => {
                        self.send_to_torrent(
                            *id,
                            TorrentCommand::InboundPeer {
                                addr,
                                stream,
                                read_buf,
                                handshake,
                            },
                        );
                    }
                    None => {
                        log::debug!(
                            "Inbound peer {} for unknown torrent",
                            addr
                        );
                    }
                }
            }
            // handled in the run loop
            Command::Shutdown { .. } => unreachable!(),
        }
    }

    fn send_to_torrent(&self, id: TorrentId, cmd: TorrentCommand) {
        match self.torrents.get(&id) {
            Some(entry) => {
                let _ = entry.cmd_tx.send(cmd);
            }
            None => log::warn!("No torrent with id {}", id),
        }
    }

    fn add_torrent(&mut self, params: TorrentParams) -> Result<TorrentId> {
        let info_hash = match (&params.metainfo, &params.magnet) {
            (Some(metainfo), _) => metainfo.info_hash,
            (None, Some(magnet)) => magnet.info_hash,
            (None, None) => {
                return Err(Error::Config(
                    "torrent params have neither metainfo nor magnet".into(),
                ))
            }
        };
        if self.torrents_by_hash.contains_key(&info_hash) {
            return Err(Error::TorrentExists);
        }

        let id = self.next_torrent_id;
        self.next_torrent_id += 1;

        let torrents_dir = self.conf.engine.config_dir.join(TORRENTS_DIR);
        let resume_dir = self.conf.engine.config_dir.join(RESUME_DIR);

        // persist the .torrent so the session can re-add it on restart
        if let Some(metainfo) = &params.metainfo {
            let path = torrents_dir
                .join(format!("{}.torrent", hex::encode(info_hash)));
            if !path.exists() {
                if let Err(e) = fs::write(&path, metainfo.encode()) {
                    log::warn!("Failed to persist .torrent: {}", e);
                }
            }
        }

        // an earlier session may have left a resume record
        let resume = crate::resume::ResumeData::load(
            &resume_dir.join(format!("{}.resume", hex::encode(info_hash))),
        )
        .ok();

        let mut conf = self.conf.torrent.clone();
        if let Some(download_dir) = params.download_dir {
            conf.download_dir = download_dir;
        } else if let Some(resume) = &resume {
            conf.download_dir = resume.download_dir.clone();
        }
        conf.sequential_download = params.sequential;

        let name = params
            .metainfo
            .as_ref()
            .map(|metainfo| metainfo.name.clone())
            .or_else(|| {
                params.magnet.as_ref().and_then(|magnet| magnet.name.clone())
            })
            .unwrap_or_else(|| hex::encode(info_hash));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let torrent = Torrent::new(TorrentArgs {
            id,
            client_id: self.client_id,
            metainfo: params.metainfo,
            magnet: params.magnet,
            conf,
            priority: params.priority,
            resume,
            torrents_dir,
            resume_dir,
            listen_port: self.listen_port,
            pex_enabled: self.conf.engine.pex_enabled,
            disk: self.disk.clone(),
            verifier: Arc::clone(&self.verifier),
            announce_permits: Arc::clone(&self.announce_permits),
            alert_tx: self.alert_tx.clone(),
            cmd_rx,
        });
        task::spawn(torrent.run(params.start_paused));

        self.torrents.insert(id, TorrentEntry { cmd_tx, info_hash });
        self.torrents_by_hash.insert(info_hash, id);

        log::info!("Added torrent {} ({})", id, name);
        let _ = self.alert_tx.send(Alert::TorrentAdded {
            id,
            info_hash,
            name,
        });
        Ok(id)
    }

    async fn remove_torrent(&mut self, id: TorrentId) {
        let entry = match self.torrents.remove(&id) {
            Some(entry) => entry,
            None => return,
        };
        self.torrents_by_hash.remove(&entry.info_hash);

        // let the torrent stop cleanly (stopped announce, resume save)
        let (ack_tx, ack_rx) = oneshot::channel();
        if entry.cmd_tx.send(TorrentCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }

        // the torrent is forgotten: drop its session state (downloaded
        // content stays)
        let hash = hex::encode(entry.info_hash);
        let _ = fs::remove_file(
            self.conf
                .engine
                .config_dir
                .join(RESUME_DIR)
                .join(format!("{}.resume", hash)),
        );
        let _ = fs::remove_file(
            self.conf
                .engine
                .config_dir
                .join(TORRENTS_DIR)
                .join(format!("{}.torrent", hash)),
        );

        log::info!("Removed torrent {}", id);
        let _ = self.alert_tx.send(Alert::TorrentRemoved { id });
    }

    /// Fetches (or reads) the configured blocklist, compiles and installs
    /// it. Runs on a separate task as the download may take a while.
    fn update_blocklist(
        &mut self,
        result_tx: oneshot::Sender<Result<usize>>,
    ) {
        let url = self.conf.engine.blocklist_url.clone();
        let cache_path = self
            .conf
            .engine
            .config_dir
            .join(BLOCKLISTS_DIR)
            .join(BLOCKLIST_CACHE);
        let blocklist = Arc::clone(&self.blocklist);

        task::spawn(async move {
            let result = async {
                let url = url.ok_or_else(|| {
                    Error::Config("no blocklist-url configured".into())
                })?;
                let text = if let Some(path) = url.strip_prefix("file://") {
                    fs::read_to_string(path)?
                } else {
                    reqwest::get(&url)
                        .await
                        .and_then(|resp| resp.error_for_status())
                        .map_err(|e| Error::Config(e.to_string()))?
                        .text()
                        .await
                        .map_err(|e| Error::Config(e.to_string()))?
                };

                let (new_blocklist, skipped) = Blocklist::parse(&text);
                if skipped > 0 {
                    log::warn!(
                        "Blocklist: skipped {} malformed lines",
                        skipped
                    );
                }
                new_blocklist.write_cache(&cache_path)?;
                let len = new_blocklist.len();
                *blocklist.write().expect("blocklist poisoned") =
                    new_blocklist;
                log::info!("Blocklist updated: {} ranges", len);
                Ok(len)
            }
            .await;
            let _ = result_tx.send(result);
        });
    }

    /// Re-reads `settings.json` and applies what can change at runtime.
    fn reload_conf(&mut self) -> Result<()> {
        let loaded = Conf::load(self.conf.engine.config_dir.clone())
            .map_err(|e| Error::Config(e.to_string()))?;

        // the listen port and state directories are fixed for the
        // session's lifetime; everything else is applied
        let config_dir = self.conf.engine.config_dir.clone();
        let listen_port = self.conf.engine.listen_port;
        self.conf = loaded;
        self.conf.engine.config_dir = config_dir;
        self.conf.engine.listen_port = listen_port;

        log::info!("Configuration reloaded");
        Ok(())
    }

    /// Polls the watch directory: a `.torrent` file whose size was stable
    /// across two polls is added and renamed out of the way (or deleted,
    /// per configuration).
    fn poll_watch_dir(&mut self) {
        let watch_dir = match &self.conf.engine.watch_dir {
            Some(dir) => dir.clone(),
            None => return,
        };
        let entries = match fs::read_dir(&watch_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let mut seen = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|ext| ext != "torrent").unwrap_or(true) {
                continue;
            }
            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(_) => continue,
            };
            seen.push(path.clone());

            match self.watched_files.get(&path) {
                // the size was stable across two polls: safe to add
                Some(last_size) if *last_size == size => {
                    self.watched_files.remove(&path);
                    self.add_watched_torrent(&path);
                }
                _ => {
                    self.watched_files.insert(path, size);
                }
            }
        }
        // forget files that disappeared from the directory
        self.watched_files.retain(|path, _| seen.contains(path));
    }

    fn add_watched_torrent(&mut self, path: &Path) {
        log::info!("Adding torrent from watch dir: {:?}", path);
        let added = fs::read(path)
            .map_err(Error::from)
            .and_then(|buf| Metainfo::from_bytes(&buf).map_err(Error::from))
            .and_then(|metainfo| {
                self.add_torrent(TorrentParams::new_metainfo(metainfo))
            });

        match added {
            Ok(_) => {
                if self.conf.engine.trash_watched_torrents {
                    let _ = fs::remove_file(path);
                } else {
                    let mut renamed = path.to_path_buf().into_os_string();
                    renamed.push(".added");
                    let _ = fs::rename(path, renamed);
                }
            }
            Err(e) => {
                log::warn!("Failed to add watched torrent {:?}: {}", path, e)
            }
        }
    }

    /// The orderly shutdown: every torrent stops (announcing `stopped`
    /// and saving its resume record), then the workers are drained.
    async fn shutdown(&mut self) {
        log::info!("Engine shutting down");

        let mut acks = Vec::new();
        for (_, entry) in self.torrents.drain() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if entry.cmd_tx.send(TorrentCommand::Shutdown(ack_tx)).is_ok() {
                acks.push(ack_rx);
            }
        }
        self.torrents_by_hash.clear();
        for ack in acks {
            let _ = ack.await;
        }

        self.disk.shutdown();

        // joining the worker threads blocks, so it is pushed off the
        // async runtime
        let verifier = Arc::clone(&self.verifier);
        let creator = Arc::clone(&self.creator);
        let _ = task::spawn_blocking(move || {
            creator.close();
            verifier.close();
        })
        .await;
    }
}

/// The inbound peer listener: accepts connections, drops blocklisted
/// addresses, reads the handshake (to learn which torrent the peer wants)
/// and routes the connection to the engine.
async fn listen_for_peers(
    listener: TcpListener,
    cmd_tx: UnboundedSender<Command>,
    blocklist: Arc<RwLock<Blocklist>>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Failed to accept peer connection: {}", e);
                continue;
            }
        };
        log::debug!("Inbound connection from {}", addr);

        {
            let blocklist = blocklist.read().expect("blocklist poisoned");
            if blocklist.contains(addr.ip()) {
                log::info!("Rejecting blocklisted peer {}", addr);
                continue;
            }
        }

        // read the handshake on a separate task so a slow peer can't stall
        // the accept loop
        let cmd_tx = cmd_tx.clone();
        task::spawn(async move {
            let mut socket = Framed::new(stream, HandshakeCodec);
            let handshake =
                time::timeout(HANDSHAKE_TIMEOUT, socket.next()).await;
            let handshake = match handshake {
                Ok(Some(Ok(handshake))) => handshake,
                _ => {
                    log::debug!("Inbound peer {} handshake failed", addr);
                    return;
                }
            };
            let parts = socket.into_parts();
            let _ = cmd_tx.send(Command::RoutedInbound {
                addr,
                stream: parts.io,
                read_buf: parts.read_buf,
                handshake,
            });
        });
    }
}

/// Generates an Azureus style peer id: `-TT<version>-` followed by random
/// alphanumerics.
fn generate_client_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-TT0100-");
    let mut rng = rand::thread_rng();
    const ALPHANUMERIC: &[u8] =
        b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    for b in id[8..].iter_mut() {
        *b = ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())];
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_client_id() {
        let id = generate_client_id();
        assert_eq!(&id[..8], b"-TT0100-");
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        // ids are random
        assert_ne!(generate_client_id()[8..], id[8..]);
    }

    // Tests the engine lifecycle at the API level: spawn, add a torrent,
    // observe the added alert, query stats, remove, shut down.
    #[tokio::test]
    async fn test_engine_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = Conf::new(dir.path().join("downloads"));
        // pick an ephemeral port to not collide with other tests
        conf.engine.randomize_listen_port = true;

        let (handle, mut alerts) = spawn(conf).unwrap();

        // a tiny single file torrent
        let info = crate::bencode::Value::Dict(vec![
            (b"length".to_vec(), crate::bencode::Value::Int(16)),
            (
                b"name".to_vec(),
                crate::bencode::Value::from_str("t.bin"),
            ),
            (b"piece length".to_vec(), crate::bencode::Value::Int(16)),
            (
                b"pieces".to_vec(),
                crate::bencode::Value::Bytes(vec![0xab; 20]),
            ),
        ]);
        let buf = crate::bencode::Value::Dict(vec![(
            b"info".to_vec(),
            info,
        )])
        .encode();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let info_hash = metainfo.info_hash;

        handle
            .add_torrent(TorrentParams::new_metainfo(metainfo))
            .unwrap();

        // the added alert carries the assigned id
        let id = loop {
            match alerts.recv().await.unwrap() {
                Alert::TorrentAdded {
                    id,
                    info_hash: added_hash,
                    name,
                } => {
                    assert_eq!(added_hash, info_hash);
                    assert_eq!(name, "t.bin");
                    break id;
                }
                _ => continue,
            }
        };

        // adding the same torrent twice is refused (observable through
        // stats still working on the single instance)
        let metainfo2 = Metainfo::from_bytes(&buf).unwrap();
        handle
            .add_torrent(TorrentParams::new_metainfo(metainfo2))
            .unwrap();

        let stats = handle.stats(id).await.unwrap();
        assert_eq!(stats.id, id);
        assert_eq!(stats.info_hash, info_hash);

        handle.remove_torrent(id).unwrap();
        loop {
            match alerts.recv().await.unwrap() {
                Alert::TorrentRemoved { id: removed } => {
                    assert_eq!(removed, id);
                    break;
                }
                _ => continue,
            }
        }

        handle.shutdown().await.unwrap();
    }

    // Tests that the persisted state directories are created at spawn.
    #[tokio::test]
    async fn test_state_directories_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = Conf::new(dir.path().join("downloads"));
        conf.engine.randomize_listen_port = true;
        let config_dir = conf.engine.config_dir.clone();

        let (handle, _alerts) = spawn(conf).unwrap();
        assert!(config_dir.join(TORRENTS_DIR).is_dir());
        assert!(config_dir.join(RESUME_DIR).is_dir());
        assert!(config_dir.join(BLOCKLISTS_DIR).is_dir());

        handle.shutdown().await.unwrap();
    }
}
