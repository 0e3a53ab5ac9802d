//! The UDP tracker protocol (BEP-15): a connect/announce/scrape exchange
//! over fixed layout datagrams, with a 60 second connection id cache.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use rand::Rng;
use tokio::{net::UdpSocket, sync::Mutex, time};
use url::Url;

use super::{Announce, AnnounceResponse, Event, ScrapeResponse, TrackerError};
use crate::Sha1Hash;

const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// How long a connection id stays valid (per BEP-15, one minute).
const CONNECTION_TTL: Duration = Duration::from_secs(60);

/// A request is retried or failed if no response arrives within this
/// window.
const UDP_TIMEOUT: Duration = Duration::from_secs(15);

/// A UDP tracker for a torrent.
///
/// The connection id obtained from the connect exchange is cached between
/// requests until it expires.
pub(crate) struct UdpTracker {
    addr: SocketAddr,
    /// The cached connection id and when it was obtained.
    connection: Mutex<Option<(u64, Instant)>>,
}

impl UdpTracker {
    /// Creates a tracker from a `udp://host:port/...` announce URL,
    /// resolving the host. Returns `None` for URLs that aren't UDP or
    /// don't resolve.
    pub async fn from_url(url: &Url) -> Option<Self> {
        if url.scheme() != "udp" {
            return None;
        }
        let host = url.host_str()?;
        let port = url.port()?;
        let addr = tokio::net::lookup_host((host, port))
            .await
            .ok()?
            // prefer IPv4: the compact announce response is IPv4 only
            .find(|addr| addr.is_ipv4())?;
        Some(Self {
            addr,
            connection: Mutex::new(None),
        })
    }

    pub async fn announce(
        &self,
        params: &Announce,
    ) -> Result<AnnounceResponse, TrackerError> {
        let socket = self.bind().await?;
        let connection_id = self.connection_id(&socket).await?;

        let transaction_id: u32 = rand::thread_rng().gen();
        let mut req = Vec::with_capacity(98);
        req.extend_from_slice(&connection_id.to_be_bytes());
        req.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());
        req.extend_from_slice(&params.info_hash);
        req.extend_from_slice(&params.peer_id);
        req.extend_from_slice(&params.downloaded.to_be_bytes());
        req.extend_from_slice(&params.left.to_be_bytes());
        req.extend_from_slice(&params.uploaded.to_be_bytes());
        let event: u32 = match params.event {
            None => 0,
            Some(Event::Completed) => 1,
            Some(Event::Started) => 2,
            Some(Event::Stopped) => 3,
        };
        req.extend_from_slice(&event.to_be_bytes());
        // IP address (0 = source address), key, numwant, port
        req.extend_from_slice(&0u32.to_be_bytes());
        req.extend_from_slice(&rand::thread_rng().gen::<u32>().to_be_bytes());
        req.extend_from_slice(&(params.numwant as u32).to_be_bytes());
        req.extend_from_slice(&params.port.to_be_bytes());

        let resp = exchange(&socket, &req, transaction_id).await?;
        if resp.len() < 16 {
            return Err(TrackerError::Protocol);
        }
        let interval = u64::from(read_u32(&resp[4..8]));
        let leecher_count = read_u32(&resp[8..12]) as usize;
        let seeder_count = read_u32(&resp[12..16]) as usize;

        // the rest of the datagram is the compact IPv4 peer list
        let peer_bytes = &resp[16..];
        if peer_bytes.len() % 6 != 0 {
            return Err(TrackerError::Protocol);
        }
        let peers = peer_bytes
            .chunks_exact(6)
            .map(|entry| {
                let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
                let port = u16::from_be_bytes([entry[4], entry[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect();

        Ok(AnnounceResponse {
            interval: Some(Duration::from_secs(interval)),
            min_interval: None,
            tracker_id: None,
            seeder_count: Some(seeder_count),
            leecher_count: Some(leecher_count),
            peers,
        })
    }

    pub async fn scrape(
        &self,
        info_hash: &Sha1Hash,
    ) -> Result<ScrapeResponse, TrackerError> {
        let socket = self.bind().await?;
        let connection_id = self.connection_id(&socket).await?;

        let transaction_id: u32 = rand::thread_rng().gen();
        let mut req = Vec::with_capacity(36);
        req.extend_from_slice(&connection_id.to_be_bytes());
        req.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());
        req.extend_from_slice(info_hash);

        let resp = exchange(&socket, &req, transaction_id).await?;
        if resp.len() < 20 {
            return Err(TrackerError::Protocol);
        }
        Ok(ScrapeResponse {
            seeder_count: Some(read_u32(&resp[8..12]) as usize),
            download_count: Some(read_u32(&resp[12..16]) as usize),
            leecher_count: Some(read_u32(&resp[16..20]) as usize),
        })
    }

    async fn bind(&self) -> Result<UdpSocket, TrackerError> {
        let bind_addr: SocketAddr = if self.addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid bind address")
        } else {
            "[::]:0".parse().expect("valid bind address")
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.addr).await?;
        Ok(socket)
    }

    /// Returns a valid connection id, performing the connect exchange if
    /// the cached one expired.
    async fn connection_id(
        &self,
        socket: &UdpSocket,
    ) -> Result<u64, TrackerError> {
        let mut connection = self.connection.lock().await;
        if let Some((id, obtained_at)) = *connection {
            if obtained_at.elapsed() < CONNECTION_TTL {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::thread_rng().gen();
        let mut req = Vec::with_capacity(16);
        req.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        req.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());

        let resp = exchange(socket, &req, transaction_id).await?;
        if resp.len() < 16 {
            return Err(TrackerError::Protocol);
        }
        let id = u64::from_be_bytes(
            resp[8..16].try_into().expect("sliced to 8 bytes"),
        );
        *connection = Some((id, Instant::now()));
        Ok(id)
    }
}

/// Sends the request and awaits the matching response: same transaction
/// id, non-error action, within the timeout.
async fn exchange(
    socket: &UdpSocket,
    req: &[u8],
    transaction_id: u32,
) -> Result<Vec<u8>, TrackerError> {
    socket.send(req).await?;

    let expected_action = read_u32(&req[8..12]);
    let deadline = time::Instant::now() + UDP_TIMEOUT;
    let mut buf = vec![0; 4096];
    loop {
        let n = time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                TrackerError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "udp tracker timed out",
                ))
            })??;
        if n < 8 {
            continue;
        }
        let action = read_u32(&buf[0..4]);
        if read_u32(&buf[4..8]) != transaction_id {
            // a stale response to an earlier request; keep waiting
            continue;
        }
        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&buf[8..n]).into_owned();
            return Err(TrackerError::Announced(message));
        }
        if action != expected_action {
            return Err(TrackerError::Protocol);
        }
        return Ok(buf[..n].to_vec());
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[0..4].try_into().expect("sliced to 4 bytes"))
}
