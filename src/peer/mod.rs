//! Peer sessions: one task per connected peer, owning the socket and the
//! per peer protocol state.
//!
//! A session drives the connection from the TCP connect (or accept) through
//! the handshake and availability exchange into the steady message loop.
//! Message processing within one session is strictly FIFO. The session
//! shares the torrent's piece picker and in-flight piece downloads through
//! the torrent context and talks to its torrent through an event channel;
//! the torrent steers it (choking, metadata requests, piece completion
//! announcements) through a command channel.

pub(crate) mod codec;
mod error;
mod state;

pub(crate) use error::PeerError;
pub(crate) use state::{ConnState, SessionStats, SessionStatus};

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{self, Instant},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    download::PieceDownload,
    metadata::{
        ExtendedHandshake, MetadataDownload, MetadataMsg, PexMsg,
        UT_METADATA_ID, UT_PEX_ID,
    },
    torrent::TorrentContext,
    Bitfield, BlockInfo, PeerId, PieceIndex,
};
use codec::{Handshake, HandshakeCodec, Message, PeerCodec};
use error::Result;
use state::{target_request_queue_len, RequestTiming};

/// The byte stream capability set a peer transport must provide. TCP is
/// the transport the engine ships; a uTP stream implementing the same
/// traits plugs in here without the session noticing.
pub(crate) trait Transport:
    AsyncRead + AsyncWrite + Unpin + Send + 'static
{
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

type MessageSink<T> = SplitSink<Framed<T, PeerCodec>, Message>;

/// The handshake must complete within this window.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer that has sent nothing for this long is disconnected.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(150);

/// A keepalive is sent if nothing else was sent for this long.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// The default window after which an unserved block request is given up on
/// and freed for other peers to pick. Once round trip samples exist, the
/// window adapts to a multiple of the observed latency, within these
/// bounds.
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// When the bytes queued for sending to a peer (pending block uploads)
/// exceed this, the peer is congested: we stop requesting from it and stop
/// accepting its requests until the queue drains.
const MAX_SEND_QUEUE_BYTES: usize = 1024 * 1024;

/// The most requests a peer may keep queued with us.
const MAX_INCOMING_REQUESTS: usize = 512;

pub(crate) type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;
pub(crate) type EventSender = UnboundedSender<Event>;

/// The commands a peer session accepts from its torrent (and, for block
/// reads, from the disk task).
#[derive(Debug)]
pub(crate) enum Command {
    /// A block read has completed and can be sent to the peer.
    BlockRead { info: BlockInfo, data: Vec<u8> },
    /// The torrent completed and verified a piece: announce it with `have`
    /// and withdraw any of our own in-flight requests for it.
    PieceCompleted { index: PieceIndex },
    /// Endgame: another session received this block first; cancel our
    /// duplicate request if we have one in flight.
    CancelBlock { block: BlockInfo },
    /// Choke or unchoke the peer (decided by the torrent's choker).
    Choke,
    Unchoke,
    /// The torrent's metainfo just became available (magnet start): piece
    /// geometry can now be used and any buffered availability registered.
    MetainfoAvailable,
    /// Request a metadata piece from this peer (BEP-9).
    RequestMetadata { piece: usize },
    /// Send a peer exchange update to this peer.
    Pex(PexMsg),
    /// Disconnect, optionally because the peer was banned.
    Shutdown { banned: bool },
}

/// The events a peer session reports to its torrent, keyed by the peer's
/// address.
#[derive(Debug)]
pub(crate) enum Event {
    /// The handshake completed.
    Connected { addr: SocketAddr, peer_id: PeerId },
    /// The peer sent its extended handshake.
    ExtendedHandshake {
        addr: SocketAddr,
        handshake: ExtendedHandshake,
    },
    /// The session ended; the slot can be given to a queued peer.
    Disconnected {
        addr: SocketAddr,
        error: Option<PeerError>,
    },
    /// Per second statistics snapshot.
    Stats {
        addr: SocketAddr,
        stats: SessionStats,
    },
    /// A new (first arrival) block was received and handed to the disk
    /// task.
    BlockReceived { addr: SocketAddr, block: BlockInfo },
    /// The peer served a metadata piece.
    MetadataPiece {
        addr: SocketAddr,
        piece: usize,
        total_size: usize,
        payload: Vec<u8>,
    },
    /// The peer rejected a metadata request.
    MetadataReject { addr: SocketAddr, piece: usize },
    /// The peer sent a peer exchange update.
    Pex {
        addr: SocketAddr,
        added: Vec<SocketAddr>,
    },
}

/// Information about a peer learned in its handshakes.
struct PeerInfo {
    /// Whether the peer's handshake advertised extension protocol support.
    supports_extended: bool,
    /// Whether the peer's handshake advertised the fast extension.
    supports_fast: bool,
    /// The peer's extended handshake, once received.
    extended: Option<ExtendedHandshake>,
    /// All pieces the peer has, sized once the torrent's piece count is
    /// known.
    pieces: Option<Bitfield>,
}

/// Piece availability the peer announced before we knew the torrent's piece
/// count (magnet starts): buffered raw and replayed once the metainfo
/// arrives.
#[derive(Debug, Default)]
struct PendingAvailability {
    have_all: bool,
    bitfield: Option<Vec<u8>>,
    haves: Vec<PieceIndex>,
}

pub(crate) struct PeerSession {
    ctx: Arc<TorrentContext>,
    /// The remote address of the peer.
    addr: SocketAddr,
    cmd_rx: CommandReceiver,
    event_tx: EventSender,
    /// Our own command sender, handed to the disk task with block read
    /// requests so results come back into our FIFO.
    cmd_tx: CommandSender,

    state: ConnState,
    status: SessionStatus,
    peer: Option<PeerInfo>,
    pending_availability: PendingAvailability,
    counters: crate::counter::ThruputCounters,
    /// Payload bytes that arrived duplicated or unsolicited this round.
    waste_round: u64,
    timing: RequestTiming,

    /// Our in-flight block requests to the peer and when each was sent.
    /// A block not in this list that arrives anyway is dropped.
    outgoing_requests: Vec<(BlockInfo, Instant)>,
    /// The peer's requests queued with us (some may be waiting on a disk
    /// read).
    incoming_requests: Vec<BlockInfo>,
    /// Bytes promised to the peer but not yet sent: the sizes of
    /// `incoming_requests`. The congestion signal.
    pending_send_bytes: usize,

    last_recv_time: Instant,
    last_send_time: Instant,
}

/// Spawns an outbound peer session: connects, handshakes, runs the message
/// loop until disconnection or shutdown.
pub(crate) fn spawn_outbound(
    ctx: Arc<TorrentContext>,
    addr: SocketAddr,
    event_tx: EventSender,
) -> CommandSender {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let session = PeerSession::new(ctx, addr, cmd_rx, event_tx, cmd_tx.clone());
    tokio::spawn(session.run_outbound());
    cmd_tx
}

/// Spawns an inbound peer session over an accepted socket whose handshake
/// the engine has already read (to route it to this torrent).
pub(crate) fn spawn_inbound(
    ctx: Arc<TorrentContext>,
    addr: SocketAddr,
    stream: TcpStream,
    read_buf: BytesMut,
    peer_handshake: Handshake,
    event_tx: EventSender,
) -> CommandSender {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let session = PeerSession::new(ctx, addr, cmd_rx, event_tx, cmd_tx.clone());
    tokio::spawn(session.run_inbound(stream, read_buf, peer_handshake));
    cmd_tx
}

impl PeerSession {
    fn new(
        ctx: Arc<TorrentContext>,
        addr: SocketAddr,
        cmd_rx: CommandReceiver,
        event_tx: EventSender,
        cmd_tx: CommandSender,
    ) -> Self {
        let now = Instant::now();
        Self {
            ctx,
            addr,
            cmd_rx,
            event_tx,
            cmd_tx,
            state: ConnState::default(),
            status: SessionStatus::default(),
            peer: None,
            pending_availability: PendingAvailability::default(),
            counters: Default::default(),
            waste_round: 0,
            timing: RequestTiming::default(),
            outgoing_requests: Vec::new(),
            incoming_requests: Vec::new(),
            pending_send_bytes: 0,
            last_recv_time: now,
            last_send_time: now,
        }
    }

    async fn run_outbound(mut self) {
        log::info!("Connecting to peer {}", self.addr);
        self.state = ConnState::Connecting;

        let result = async {
            let stream = time::timeout(
                HANDSHAKE_TIMEOUT,
                TcpStream::connect(self.addr),
            )
            .await
            .map_err(|_| PeerError::Timeout)?
            .map_err(PeerError::from)?;

            self.state = ConnState::Handshaking;
            let mut socket = Framed::new(stream, HandshakeCodec);

            // this is an outbound connection, so we send the first
            // handshake
            let handshake =
                Handshake::new(self.ctx.info_hash, self.ctx.client_id);
            socket.send(handshake).await.map_err(PeerError::from)?;

            let peer_handshake =
                time::timeout(HANDSHAKE_TIMEOUT, socket.next())
                    .await
                    .map_err(|_| PeerError::Timeout)?
                    .ok_or(PeerError::Closed)?
                    .map_err(PeerError::from)?;

            self.check_handshake(&peer_handshake)?;

            // switch to the message codec, keeping whatever bytes arrived
            // after the handshake
            let parts = socket.into_parts();
            Ok::<_, PeerError>((parts.io, parts.read_buf, peer_handshake))
        }
        .await;

        match result {
            Ok((stream, read_buf, peer_handshake)) => {
                self.run_connected(stream, read_buf, peer_handshake).await
            }
            Err(e) => self.disconnect(Some(e)).await,
        }
    }

    async fn run_inbound(
        mut self,
        stream: TcpStream,
        read_buf: BytesMut,
        peer_handshake: Handshake,
    ) {
        log::info!("Peer {} connected to us", self.addr);
        self.state = ConnState::Handshaking;

        // the engine validated the info hash to route the connection here;
        // we still owe the peer our side of the handshake
        let result = async {
            self.check_handshake(&peer_handshake)?;
            let mut socket = Framed::new(stream, HandshakeCodec);
            let handshake =
                Handshake::new(self.ctx.info_hash, self.ctx.client_id);
            socket.send(handshake).await.map_err(PeerError::from)?;
            let parts = socket.into_parts();
            debug_assert!(parts.read_buf.is_empty());
            Ok::<_, PeerError>(parts.io)
        }
        .await;

        match result {
            Ok(stream) => {
                self.run_connected(stream, read_buf, peer_handshake).await
            }
            Err(e) => self.disconnect(Some(e)).await,
        }
    }

    fn check_handshake(&mut self, peer_handshake: &Handshake) -> Result<()> {
        if peer_handshake.info_hash != self.ctx.info_hash {
            log::info!("Peer {} handshake with wrong info hash", self.addr);
            return Err(PeerError::Handshake);
        }
        self.peer = Some(PeerInfo {
            supports_extended: peer_handshake.supports_extended(),
            supports_fast: peer_handshake.supports_fast(),
            extended: None,
            pieces: None,
        });
        Ok(())
    }

    /// The post-handshake session: availability exchange followed by the
    /// steady message loop. Generic over the transport byte stream.
    async fn run_connected<T: Transport>(
        mut self,
        stream: T,
        read_buf: BytesMut,
        peer_handshake: Handshake,
    ) {
        let _ = self.event_tx.send(Event::Connected {
            addr: self.addr,
            peer_id: peer_handshake.peer_id,
        });

        // once the piece length is known, no valid frame can be larger
        // than a piece plus the block message header
        let mut codec = PeerCodec::new();
        if let Some(info) = self.ctx.storage.read().await.as_ref() {
            codec.set_max_frame_len(info.piece_len);
        }
        let mut parts = FramedParts::new(stream, codec);
        // reuse the bytes the peer sent right after its handshake
        parts.read_buf = read_buf;
        let socket = Framed::from_parts(parts);
        let (mut sink, mut msg_stream) = socket.split();

        self.state = ConnState::AvailabilityExchange;

        let result = async {
            // our side of the availability exchange: our bitfield (or its
            // fast extension abbreviations), then the extended handshake
            self.send_availability(&mut sink).await?;
            if self.peer_supports_extended() {
                let metadata_size = self
                    .ctx
                    .metadata_bytes
                    .read()
                    .await
                    .as_ref()
                    .map(|m| m.len());
                let payload =
                    ExtendedHandshake::ours(metadata_size).encode();
                self.send(
                    &mut sink,
                    Message::Extended { id: 0, payload },
                )
                .await?;
            }

            let mut tick = time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(
                time::MissedTickBehavior::Delay,
            );

            loop {
                tokio::select! {
                    msg = msg_stream.next() => {
                        let msg = match msg {
                            Some(msg) => msg.map_err(PeerError::from)?,
                            None => return Err(PeerError::Closed),
                        };
                        self.last_recv_time = Instant::now();
                        self.handle_msg(&mut sink, msg).await?;
                    }
                    cmd = self.cmd_rx.recv() => {
                        match cmd {
                            Some(cmd) => {
                                self.handle_cmd(&mut sink, cmd).await?
                            }
                            // torrent is gone
                            None => return Ok(()),
                        }
                    }
                    _ = tick.tick() => {
                        self.tick(&mut sink).await?;
                    }
                }
            }
        }
        .await;

        match result {
            Ok(()) => self.disconnect(None).await,
            Err(e) => self.disconnect(Some(e)).await,
        }
    }

    fn peer_supports_extended(&self) -> bool {
        self.peer
            .as_ref()
            .map(|peer| peer.supports_extended)
            .unwrap_or(false)
    }

    fn peer_supports_fast(&self) -> bool {
        self.peer
            .as_ref()
            .map(|peer| peer.supports_fast)
            .unwrap_or(false)
    }

    async fn send<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
        msg: Message,
    ) -> Result<()> {
        log::trace!("Sending {:?} to peer {}", msg.id(), self.addr);
        sink.send(msg).await.map_err(PeerError::from)?;
        self.last_send_time = Instant::now();
        Ok(())
    }

    /// Sends our piece availability right after the handshake: have-all or
    /// have-none where the fast extension allows, otherwise a bitfield
    /// (omitted entirely if we have nothing, per the base protocol).
    async fn send_availability<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
    ) -> Result<()> {
        let own_pieces = match self.ctx.piece_picker.read().await.as_ref() {
            Some(picker) => picker.own_pieces().clone(),
            // magnet start before metadata: nothing to announce
            None => return Ok(()),
        };
        if self.peer_supports_fast() {
            if own_pieces.all() {
                return self.send(sink, Message::HaveAll).await;
            } else if own_pieces.not_any() {
                return self.send(sink, Message::HaveNone).await;
            }
        }
        if own_pieces.any() {
            return self.send(sink, Message::Bitfield(own_pieces)).await;
        }
        Ok(())
    }

    async fn handle_msg<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
        msg: Message,
    ) -> Result<()> {
        // a bitfield (or its fast extension stand-ins) may only arrive
        // directly after the handshake
        if self.state == ConnState::AvailabilityExchange {
            match &msg {
                Message::Bitfield(bitfield) => {
                    let raw = bitfield.as_raw_slice().to_vec();
                    self.register_availability_bitfield(raw).await?;
                    self.state = ConnState::Connected;
                    self.update_interest(sink).await?;
                    return Ok(());
                }
                Message::HaveAll => {
                    if !self.peer_supports_fast() {
                        return Err(PeerError::Protocol);
                    }
                    self.pending_availability.have_all = true;
                    self.register_pending_availability().await?;
                    self.state = ConnState::Connected;
                    self.update_interest(sink).await?;
                    return Ok(());
                }
                Message::HaveNone => {
                    if !self.peer_supports_fast() {
                        return Err(PeerError::Protocol);
                    }
                    // an empty availability needs no registration
                    self.init_empty_peer_pieces().await;
                    self.state = ConnState::Connected;
                    return Ok(());
                }
                // any other message implicitly ends the exchange with an
                // empty availability and is then processed normally
                _ => {
                    self.init_empty_peer_pieces().await;
                    self.state = ConnState::Connected;
                }
            }
        } else if matches!(
            msg,
            Message::Bitfield(_) | Message::HaveAll | Message::HaveNone
        ) {
            log::warn!(
                "Peer {} sent availability mid-session",
                self.addr
            );
            return Err(PeerError::Protocol);
        }

        match msg {
            Message::KeepAlive => {
                log::trace!("Peer {} sent keepalive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::debug!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // we can't expect our outstanding requests to be served
                    self.free_outgoing_requests().await;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::debug!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
            }
            Message::Have { piece_index } => {
                self.register_availability_have(piece_index).await?;
                self.update_interest(sink).await?;
            }
            Message::Block { info, data } => {
                self.handle_block(info, data).await?;
                self.make_requests(sink).await?;
            }
            Message::Request(block) => {
                self.handle_request(sink, block).await?;
            }
            Message::Cancel(block) => {
                self.incoming_requests.retain(|queued| {
                    if queued == &block {
                        self.pending_send_bytes -= block.len as usize;
                        false
                    } else {
                        true
                    }
                });
            }
            Message::Reject(block) => {
                if !self.peer_supports_fast() {
                    return Err(PeerError::Protocol);
                }
                self.free_outgoing_request(block).await;
            }
            Message::Port(port) => {
                // no DHT in the core; the message is valid, just unused
                log::trace!("Peer {} DHT port: {}", self.addr, port);
            }
            Message::Suggest { piece_index } => {
                log::trace!(
                    "Peer {} suggests piece {}",
                    self.addr,
                    piece_index
                );
            }
            Message::AllowedFast { .. } => {
                // we never request while choked, so allowed-fast sets are
                // acknowledged but not used
            }
            Message::Extended { id, payload } => {
                self.handle_extended(sink, id, payload).await?;
            }
            // handled above
            Message::Bitfield(_) | Message::HaveAll | Message::HaveNone => {
                unreachable!()
            }
        }

        Ok(())
    }

    async fn handle_cmd<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
        cmd: Command,
    ) -> Result<()> {
        match cmd {
            Command::BlockRead { info, data } => {
                // the peer may have canceled the request or been choked
                // since we asked the disk for the block
                let still_wanted = self
                    .incoming_requests
                    .iter()
                    .any(|queued| queued == &info);
                if still_wanted && !self.status.is_peer_choked {
                    self.incoming_requests.retain(|queued| queued != &info);
                    self.pending_send_bytes -= info.len as usize;
                    self.counters.up.add(info.len as u64);
                    self.send(sink, Message::Block { info, data }).await?;
                } else if still_wanted {
                    self.incoming_requests.retain(|queued| queued != &info);
                    self.pending_send_bytes -= info.len as usize;
                }
            }
            Command::PieceCompleted { index } => {
                // withdraw our own requests for the piece and announce it;
                // the `have` may only be sent once the completion bit is
                // set, which the torrent guarantees by ordering this
                // command after it
                let ours: Vec<BlockInfo> = self
                    .outgoing_requests
                    .iter()
                    .map(|(block, _)| *block)
                    .filter(|block| block.piece_index == index)
                    .collect();
                for block in ours {
                    self.outgoing_requests
                        .retain(|(queued, _)| queued != &block);
                    self.send(sink, Message::Cancel(block)).await?;
                }
                self.send(sink, Message::Have { piece_index: index })
                    .await?;
                self.update_interest(sink).await?;
                self.make_requests(sink).await?;
            }
            Command::CancelBlock { block } => {
                if self
                    .outgoing_requests
                    .iter()
                    .any(|(queued, _)| queued == &block)
                {
                    self.outgoing_requests
                        .retain(|(queued, _)| queued != &block);
                    self.send(sink, Message::Cancel(block)).await?;
                    self.make_requests(sink).await?;
                }
            }
            Command::Choke => {
                if !self.status.is_peer_choked {
                    self.status.is_peer_choked = true;
                    // drop the peer's queued requests; with the fast
                    // extension each one must be explicitly rejected
                    let dropped: Vec<_> =
                        self.incoming_requests.drain(..).collect();
                    self.pending_send_bytes = 0;
                    self.send(sink, Message::Choke).await?;
                    if self.peer_supports_fast() {
                        for block in dropped {
                            self.send(sink, Message::Reject(block)).await?;
                        }
                    }
                }
            }
            Command::Unchoke => {
                if self.status.is_peer_choked {
                    self.status.is_peer_choked = false;
                    self.send(sink, Message::Unchoke).await?;
                }
            }
            Command::MetainfoAvailable => {
                self.register_pending_availability().await?;
                self.update_interest(sink).await?;
            }
            Command::RequestMetadata { piece } => {
                if let Some(id) = self.peer_ut_metadata_id() {
                    let payload = MetadataMsg::Request { piece }.encode();
                    self.send(sink, Message::Extended { id, payload })
                        .await?;
                }
            }
            Command::Pex(pex) => {
                if let Some(id) = self.peer_ut_pex_id() {
                    let payload = pex.encode();
                    self.send(sink, Message::Extended { id, payload })
                        .await?;
                }
            }
            Command::Shutdown { banned } => {
                return Err(if banned {
                    PeerError::Banned
                } else {
                    PeerError::Closed
                });
            }
        }
        Ok(())
    }

    /// The per second housekeeping: counters, stats reporting, keepalives,
    /// inactivity and request timeouts, and topping up the request
    /// pipeline.
    async fn tick<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
    ) -> Result<()> {
        let now = Instant::now();

        if now.duration_since(self.last_recv_time) >= INACTIVITY_TIMEOUT {
            log::info!("Peer {} inactive, disconnecting", self.addr);
            return Err(PeerError::Timeout);
        }
        if now.duration_since(self.last_send_time) >= KEEPALIVE_INTERVAL {
            self.send(sink, Message::KeepAlive).await?;
        }

        // give up on requests that have been in flight too long so their
        // blocks don't stay locked to a dead peer
        let request_timeout = if self.timing.round_trip.has_samples() {
            (self.timing.round_trip.mean() * 4)
                .clamp(MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT)
        } else {
            MAX_REQUEST_TIMEOUT
        };
        let timed_out: Vec<BlockInfo> = self
            .outgoing_requests
            .iter()
            .filter(|(_, sent_at)| {
                now.duration_since(*sent_at) >= request_timeout
            })
            .map(|(block, _)| *block)
            .collect();
        for block in timed_out {
            log::debug!(
                "Peer {} request {} timed out",
                self.addr,
                block
            );
            self.free_outgoing_request(block).await;
        }

        let stats = SessionStats {
            rate_down: self.counters.down.avg(),
            rate_up: self.counters.up.avg(),
            round_down: self.counters.down.round(),
            round_up: self.counters.up.round(),
            round_waste: self.waste_round,
            status: self.status,
            is_congested: self.is_congested(),
            outstanding_request_count: self.outgoing_requests.len(),
        };
        self.counters.tick();
        self.waste_round = 0;
        let _ = self.event_tx.send(Event::Stats {
            addr: self.addr,
            stats,
        });

        self.make_requests(sink).await?;
        Ok(())
    }

    fn is_congested(&self) -> bool {
        self.pending_send_bytes > MAX_SEND_QUEUE_BYTES
    }

    fn peer_ut_metadata_id(&self) -> Option<u8> {
        self.peer
            .as_ref()
            .and_then(|peer| peer.extended.as_ref())
            .and_then(|extended| extended.ut_metadata)
    }

    fn peer_ut_pex_id(&self) -> Option<u8> {
        self.peer
            .as_ref()
            .and_then(|peer| peer.extended.as_ref())
            .and_then(|extended| extended.ut_pex)
    }

    /// Initializes the peer's piece bitfield to all zeros if the piece
    /// count is known.
    async fn init_empty_peer_pieces(&mut self) {
        let piece_count = match self.ctx.storage.read().await.as_ref() {
            Some(info) => info.piece_count,
            None => return,
        };
        if let Some(peer) = &mut self.peer {
            if peer.pieces.is_none() {
                peer.pieces = Some(Bitfield::repeat(false, piece_count));
            }
        }
    }

    /// Registers a raw bitfield the peer sent. If the torrent's piece
    /// count is not yet known (magnet start) the bits are buffered and
    /// replayed when it is.
    async fn register_availability_bitfield(
        &mut self,
        raw: Vec<u8>,
    ) -> Result<()> {
        let piece_count = match self.ctx.storage.read().await.as_ref() {
            Some(info) => info.piece_count,
            None => {
                self.pending_availability.bitfield = Some(raw);
                return Ok(());
            }
        };

        // the bitfield must be exactly as long as the piece count, padded
        // with zeros to a byte boundary
        let mut bitfield = Bitfield::from_vec(raw);
        if bitfield.len() < piece_count
            || bitfield.len() - piece_count >= 8
            || bitfield[piece_count..].any()
        {
            log::warn!("Peer {} sent invalid bitfield", self.addr);
            return Err(PeerError::Protocol);
        }
        bitfield.truncate(piece_count);

        let mut picker = self.ctx.piece_picker.write().await;
        if let Some(picker) = picker.as_mut() {
            // the interest flag itself is updated (and announced) by
            // `update_interest`, which the caller invokes next
            picker.register_peer_pieces(&bitfield);
        }
        drop(picker);
        if let Some(peer) = &mut self.peer {
            peer.pieces = Some(bitfield);
        }
        Ok(())
    }

    /// Registers a single `have` announcement.
    async fn register_availability_have(
        &mut self,
        piece_index: PieceIndex,
    ) -> Result<()> {
        let piece_count = match self.ctx.storage.read().await.as_ref() {
            Some(info) => info.piece_count,
            None => {
                self.pending_availability.haves.push(piece_index);
                return Ok(());
            }
        };
        if piece_index >= piece_count {
            log::warn!(
                "Peer {} sent have with invalid index {}",
                self.addr,
                piece_index
            );
            return Err(PeerError::Protocol);
        }

        let mut picker = self.ctx.piece_picker.write().await;
        if let Some(picker) = picker.as_mut() {
            picker.register_peer_piece(piece_index);
        }
        drop(picker);
        self.init_empty_peer_pieces().await;
        if let Some(pieces) =
            self.peer.as_mut().and_then(|peer| peer.pieces.as_mut())
        {
            pieces.set(piece_index, true);
        }
        Ok(())
    }

    /// Replays availability buffered before the metainfo arrived.
    async fn register_pending_availability(&mut self) -> Result<()> {
        let piece_count = match self.ctx.storage.read().await.as_ref() {
            Some(info) => info.piece_count,
            None => return Ok(()),
        };
        let pending = std::mem::take(&mut self.pending_availability);

        if pending.have_all {
            let all = Bitfield::repeat(true, piece_count);
            let mut picker = self.ctx.piece_picker.write().await;
            if let Some(picker) = picker.as_mut() {
                picker.register_peer_pieces(&all);
            }
            drop(picker);
            if let Some(peer) = &mut self.peer {
                peer.pieces = Some(all);
            }
            return Ok(());
        }
        if let Some(raw) = pending.bitfield {
            self.register_availability_bitfield(raw).await?;
        }
        for piece_index in pending.haves {
            self.register_availability_have(piece_index).await?;
        }
        Ok(())
    }

    /// Sends `interested`/`not interested` when our interest in the peer
    /// changed.
    async fn update_interest<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
    ) -> Result<()> {
        let peer_pieces = match self
            .peer
            .as_ref()
            .and_then(|peer| peer.pieces.as_ref())
        {
            Some(pieces) => pieces,
            None => return Ok(()),
        };
        let interested = match self.ctx.piece_picker.read().await.as_ref() {
            Some(picker) => picker.is_interested(peer_pieces),
            None => false,
        };
        if interested && !self.status.is_interested {
            self.status.is_interested = true;
            self.send(sink, Message::Interested).await?;
            self.make_requests(sink).await?;
        } else if !interested && self.status.is_interested {
            self.status.is_interested = false;
            self.send(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    /// Tops up the request pipeline: picks blocks from the in-flight piece
    /// downloads the peer can serve (starting new piece downloads as
    /// needed) until the target queue length is reached.
    async fn make_requests<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
    ) -> Result<()> {
        if self.status.is_choked
            || !self.status.is_interested
            || self.is_congested()
        {
            return Ok(());
        }
        let peer_pieces = match self
            .peer
            .as_ref()
            .and_then(|peer| peer.pieces.as_ref())
        {
            Some(pieces) => pieces.clone(),
            None => return Ok(()),
        };

        let target = target_request_queue_len(self.counters.down.avg());
        if self.outgoing_requests.len() >= target {
            return Ok(());
        }
        let mut want = target - self.outgoing_requests.len();
        let in_endgame =
            self.ctx.in_endgame.load(std::sync::atomic::Ordering::Relaxed);
        let own_requests: Vec<BlockInfo> = self
            .outgoing_requests
            .iter()
            .map(|(block, _)| *block)
            .collect();
        let mut to_request = Vec::with_capacity(want);

        {
            let mut downloads = self.ctx.downloads.write().await;

            // first continue the piece downloads the peer participates in
            for download in downloads.values_mut() {
                if want == 0 {
                    break;
                }
                if !peer_pieces[download.piece_index()] {
                    continue;
                }
                want -= download.pick_blocks(
                    want,
                    &mut to_request,
                    in_endgame,
                    &own_requests,
                );
            }

            // then start new piece downloads
            while want > 0 {
                let mut picker = self.ctx.piece_picker.write().await;
                let (index, piece_len) = {
                    let picker = match picker.as_mut() {
                        Some(picker) => picker,
                        None => break,
                    };
                    let index = match picker.pick_piece(&peer_pieces) {
                        Some(index) => index,
                        None => break,
                    };
                    let storage = self.ctx.storage.read().await;
                    let piece_len = storage
                        .as_ref()
                        .and_then(|info| info.piece_len(index))
                        .expect("picked piece in bounds");
                    (index, piece_len)
                };
                drop(picker);
                let download = downloads
                    .entry(index)
                    .or_insert_with(|| PieceDownload::new(index, piece_len));
                let picked = download.pick_blocks(
                    want,
                    &mut to_request,
                    in_endgame,
                    &own_requests,
                );
                if picked == 0 {
                    break;
                }
                want -= picked;
            }
        }

        let now = Instant::now();
        for block in to_request {
            self.outgoing_requests.push((block, now));
            self.send(sink, Message::Request(block)).await?;
        }
        Ok(())
    }

    /// Handles a received block: validates it against our requests, hands
    /// it to the disk task and reports it to the torrent.
    async fn handle_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let pos = self
            .outgoing_requests
            .iter()
            .position(|(block, _)| block == &info);
        let sent_at = match pos {
            Some(pos) => self.outgoing_requests.remove(pos).1,
            None => {
                // an unsolicited block: either we canceled the request (in
                // endgame) or the peer is misbehaving; count it as waste
                // and move on
                log::debug!(
                    "Peer {} sent unrequested block {}",
                    self.addr,
                    info
                );
                self.waste_round += info.len as u64;
                return Ok(());
            }
        };
        self.timing.round_trip.update(sent_at.elapsed());
        self.counters.down.add(info.len as u64);

        let mut downloads = self.ctx.downloads.write().await;
        let download = match downloads.get_mut(&info.piece_index) {
            Some(download) => download,
            // the piece completed from other peers and was flushed already
            None => {
                self.waste_round += info.len as u64;
                return Ok(());
            }
        };
        if download.received_block(&info) {
            self.ctx.disk.write_block(self.ctx.id, info, data);
            let _ = self.event_tx.send(Event::BlockReceived {
                addr: self.addr,
                block: info,
            });
        } else {
            // an endgame duplicate: someone else won the race
            self.waste_round += info.len as u64;
        }
        Ok(())
    }

    /// Handles the peer requesting a block from us.
    async fn handle_request<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
        block: BlockInfo,
    ) -> Result<()> {
        // requests while choked are a protocol wrinkle: base protocol peers
        // may have not yet processed our choke, so ignore; fast extension
        // peers get an explicit reject
        if self.status.is_peer_choked {
            if self.peer_supports_fast() {
                self.send(sink, Message::Reject(block)).await?;
            }
            return Ok(());
        }
        if self.incoming_requests.len() >= MAX_INCOMING_REQUESTS {
            log::warn!("Peer {} request queue overflow", self.addr);
            return Err(PeerError::Protocol);
        }
        if self.is_congested() {
            if self.peer_supports_fast() {
                self.send(sink, Message::Reject(block)).await?;
            }
            return Ok(());
        }
        if self.incoming_requests.contains(&block) {
            return Ok(());
        }
        self.incoming_requests.push(block);
        self.pending_send_bytes += block.len as usize;
        // the disk task delivers the block bytes back into our command
        // channel
        self.ctx
            .disk
            .read_block(self.ctx.id, block, self.cmd_tx.clone());
        Ok(())
    }

    async fn handle_extended<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        if !self.peer_supports_extended() {
            return Err(PeerError::Protocol);
        }
        match id {
            // the extended handshake itself
            0 => {
                let handshake = ExtendedHandshake::decode(&payload)
                    .map_err(|_| PeerError::Protocol)?;
                log::debug!(
                    "Peer {} extended handshake: {:?}",
                    self.addr,
                    handshake
                );
                if let Some(peer) = &mut self.peer {
                    peer.extended = Some(handshake.clone());
                }
                let _ = self.event_tx.send(Event::ExtendedHandshake {
                    addr: self.addr,
                    handshake,
                });
            }
            UT_METADATA_ID => {
                let msg = MetadataMsg::decode(&payload)
                    .ok_or(PeerError::Protocol)?;
                match msg {
                    MetadataMsg::Request { piece } => {
                        self.serve_metadata_request(sink, piece).await?;
                    }
                    MetadataMsg::Data {
                        piece,
                        total_size,
                        payload,
                    } => {
                        let _ = self.event_tx.send(Event::MetadataPiece {
                            addr: self.addr,
                            piece,
                            total_size,
                            payload,
                        });
                    }
                    MetadataMsg::Reject { piece } => {
                        let _ = self.event_tx.send(Event::MetadataReject {
                            addr: self.addr,
                            piece,
                        });
                    }
                }
            }
            UT_PEX_ID => {
                let pex =
                    PexMsg::decode(&payload).ok_or(PeerError::Protocol)?;
                if !pex.added.is_empty() {
                    let _ = self.event_tx.send(Event::Pex {
                        addr: self.addr,
                        added: pex.added,
                    });
                }
            }
            _ => {
                // an extension we didn't advertise; harmless
                log::trace!(
                    "Peer {} sent unknown extended message {}",
                    self.addr,
                    id
                );
            }
        }
        Ok(())
    }

    /// Serves one piece of our metadata to a magnet peer, or rejects the
    /// request if we don't have the metadata (or the piece is bogus).
    async fn serve_metadata_request<T: Transport>(
        &mut self,
        sink: &mut MessageSink<T>,
        piece: usize,
    ) -> Result<()> {
        let id = match self.peer_ut_metadata_id() {
            Some(id) => id,
            // the peer asked without completing the extended handshake
            None => return Err(PeerError::Protocol),
        };
        let reply = {
            let metadata = self.ctx.metadata_bytes.read().await;
            match metadata
                .as_ref()
                .and_then(|m| MetadataDownload::piece_of(m, piece))
            {
                Some(piece_bytes) => MetadataMsg::Data {
                    piece,
                    total_size: metadata
                        .as_ref()
                        .expect("piece served from metadata")
                        .len(),
                    payload: piece_bytes.to_vec(),
                },
                None => MetadataMsg::Reject { piece },
            }
        };
        let payload = reply.encode();
        self.send(sink, Message::Extended { id, payload }).await
    }

    /// Releases a single outgoing request so its block can be picked
    /// again.
    async fn free_outgoing_request(&mut self, block: BlockInfo) {
        let had = self
            .outgoing_requests
            .iter()
            .any(|(queued, _)| queued == &block);
        if !had {
            return;
        }
        self.outgoing_requests
            .retain(|(queued, _)| queued != &block);
        let mut downloads = self.ctx.downloads.write().await;
        if let Some(download) = downloads.get_mut(&block.piece_index) {
            download.cancel_request(&block);
        }
    }

    /// Releases all outgoing requests (on choke or disconnect).
    async fn free_outgoing_requests(&mut self) {
        let requests: Vec<BlockInfo> = self
            .outgoing_requests
            .drain(..)
            .map(|(block, _)| block)
            .collect();
        if requests.is_empty() {
            return;
        }
        let mut downloads = self.ctx.downloads.write().await;
        for block in requests {
            if let Some(download) = downloads.get_mut(&block.piece_index) {
                download.cancel_request(&block);
            }
        }
    }

    /// Tears the session down: frees in-flight state shared with the
    /// torrent and reports the disconnection.
    async fn disconnect(mut self, error: Option<PeerError>) {
        log::info!(
            "Peer {} session ended{}",
            self.addr,
            error
                .as_ref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        );
        self.state = ConnState::Disconnected;

        self.free_outgoing_requests().await;

        // abandoned piece downloads (no blocks received or requested by
        // anyone) are released so the picker can hand them out again
        {
            let mut downloads = self.ctx.downloads.write().await;
            let mut picker = self.ctx.piece_picker.write().await;
            downloads.retain(|index, download| {
                if download.is_untouched() {
                    if let Some(picker) = picker.as_mut() {
                        picker.release_piece(*index);
                    }
                    false
                } else {
                    true
                }
            });
        }

        // remove the peer's pieces from the rarity counts
        if let Some(pieces) =
            self.peer.as_ref().and_then(|peer| peer.pieces.as_ref())
        {
            let mut picker = self.ctx.piece_picker.write().await;
            if let Some(picker) = picker.as_mut() {
                picker.unregister_peer_pieces(pieces);
            }
        }

        let _ = self.event_tx.send(Event::Disconnected {
            addr: self.addr,
            error,
        });
    }
}
