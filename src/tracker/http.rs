//! The HTTP(S) tracker protocol: announce and scrape over GET requests
//! with bencoded responses.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Url};
use serde::de;

use super::{Announce, AnnounceResponse, Event, ScrapeResponse, TrackerError};
use crate::Sha1Hash;

/// HTTP announces that take longer than this fail and the tier moves on.
pub(super) const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// An HTTP tracker for a torrent, to which we can announce transfer
/// progress and from which we can request peers.
pub(crate) struct HttpTracker {
    client: Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, url }
    }

    /// Sends an announce request to the tracker with the specified
    /// parameters.
    ///
    /// This may be used by a torrent to request peers to download from and
    /// to report statistics to the tracker.
    ///
    /// # Important
    ///
    /// The tracker may not be contacted more often than the minimum
    /// interval returned in the first announce response.
    pub async fn announce(
        &self,
        params: &Announce,
    ) -> Result<AnnounceResponse, TrackerError> {
        // announce parameters are built up in the query string, see:
        // https://www.bittorrent.org/beps/bep_0003.html trackers section
        let mut query = vec![
            ("port", params.port.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("left", params.left.to_string()),
            // Indicates that client accepts a compact response (each peer
            // takes up only 6 bytes where the first four bytes constitute
            // the IP address and the last 2 the port number, in network
            // byte order). This is always true to save network traffic
            // (many trackers don't consider this and send compact lists
            // anyway).
            ("compact", "1".to_string()),
            ("numwant", params.numwant.to_string()),
        ];
        if let Some(event) = params.event {
            let event = match event {
                Event::Started => "started",
                Event::Completed => "completed",
                Event::Stopped => "stopped",
            };
            query.push(("event", event.to_string()));
        }
        if let Some(tracker_id) = &params.tracker_id {
            query.push(("trackerid", tracker_id.clone()));
        }

        // Hack: reqwest uses serde_urlencoded which doesn't support
        // encoding a raw byte array into a percent encoded string, but the
        // tracker expects the URL encoded form of the raw info hash and
        // peer id. We work around by hard-coding them into the URL string;
        // this is the only way reqwest doesn't URL encode the custom
        // encoding again.
        let url = format!(
            "{url}\
            ?info_hash={info_hash}\
            &peer_id={peer_id}",
            url = self.url,
            info_hash = percent_encoding::percent_encode(
                &params.info_hash,
                URL_ENCODE_RESERVED
            ),
            peer_id = percent_encoding::percent_encode(
                &params.peer_id,
                URL_ENCODE_RESERVED
            ),
        );

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let resp: RawAnnounceResponse = serde_bencode::from_bytes(&resp)?;

        // a failure reason means no other field is valid
        if let Some(reason) = resp.failure_reason {
            return Err(TrackerError::Announced(reason));
        }
        if let Some(warning) = resp.warning_message {
            log::warn!("Tracker {} warning: {}", self.url, warning);
        }

        Ok(AnnounceResponse {
            interval: resp.interval,
            min_interval: resp.min_interval,
            tracker_id: resp.tracker_id,
            seeder_count: resp.seeder_count,
            leecher_count: resp.leecher_count,
            peers: resp.peers,
        })
    }

    /// Sends a scrape request for the torrent, using the conventional
    /// announce URL substitution. Fails if the URL has no `announce`
    /// component to substitute.
    pub async fn scrape(
        &self,
        info_hash: &Sha1Hash,
    ) -> Result<ScrapeResponse, TrackerError> {
        let url = scrape_url(&self.url).ok_or(TrackerError::NoScrape)?;
        let separator = if url.query().is_some() { '&' } else { '?' };
        let url = format!(
            "{url}{separator}info_hash={info_hash}",
            url = url,
            separator = separator,
            info_hash = percent_encoding::percent_encode(
                info_hash,
                URL_ENCODE_RESERVED
            ),
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let resp: RawScrapeResponse = serde_bencode::from_bytes(&resp)?;

        // the response maps the raw info hash to the stats
        let stats = resp
            .files
            .into_iter()
            .map(|(_, stats)| stats)
            .next()
            .ok_or_else(|| {
                TrackerError::Announced("scrape without stats".into())
            })?;
        Ok(ScrapeResponse {
            seeder_count: stats.complete,
            leecher_count: stats.incomplete,
            download_count: stats.downloaded,
        })
    }
}

impl fmt::Display for HttpTracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}'", self.url)
    }
}

/// Derives the scrape URL from an announce URL per the convention: the
/// `announce` at the start of the last path component is replaced with
/// `scrape`.
fn scrape_url(announce: &Url) -> Option<Url> {
    let path = announce.path();
    let (dir, last) = path.rsplit_once('/')?;
    let rest = last.strip_prefix("announce")?;
    let mut scrape = announce.clone();
    scrape.set_path(&format!("{}/scrape{}", dir, rest));
    Some(scrape)
}

/// The raw bencoded announce response.
#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    /// If this is not empty, no other field in the response is valid. It
    /// contains a human readable error message as to why the request was
    /// invalid.
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    /// Optional. Similar to failure_reason, but the response is still
    /// processed.
    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    /// The number of seconds the client should wait before recontacting
    /// the tracker.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_seconds")]
    interval: Option<Duration>,

    /// If present, the client must not reannounce itself before the end of
    /// this interval.
    #[serde(default)]
    #[serde(rename = "min interval")]
    #[serde(deserialize_with = "deserialize_seconds")]
    min_interval: Option<Duration>,

    /// The tracker id. If set, we must send it with each subsequent
    /// announce.
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,

    #[serde(rename = "complete")]
    seeder_count: Option<usize>,
    #[serde(rename = "incomplete")]
    leecher_count: Option<usize>,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_peers")]
    peers: Vec<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct RawScrapeResponse {
    #[serde(default)]
    files: std::collections::HashMap<serde_bytes::ByteBuf, RawScrapeStats>,
}

#[derive(Debug, Deserialize)]
struct RawScrapeStats {
    #[serde(default)]
    complete: Option<usize>,
    #[serde(default)]
    incomplete: Option<usize>,
    #[serde(default)]
    downloaded: Option<usize>,
}

/// Peers can be sent in two ways: as a bencoded list of dicts including
/// full peer metadata, or as a single bencoded string that contains only
/// the peer IP and port (compact representation). This helper deserializes
/// both into the same type, discarding the peer id present in the full
/// representation, as most trackers send the compact response and the peer
/// id is not used at this stage anyway.
fn deserialize_peers<'de, D>(
    deserializer: D,
) -> Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or list of dicts representing peers")
        }

        /// Deserializes a compact string of peers.
        ///
        /// Each entry is 6 bytes long, where the first 4 bytes are the
        /// IPv4 address of the peer, and the last 2 bytes are the port of
        /// the peer. Both are in network byte order.
        fn visit_bytes<E>(self, mut b: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            // in the compact representation each peer must be 6 bytes long
            const ENTRY_LEN: usize = 6;
            let buf_len = b.len();

            if buf_len % ENTRY_LEN != 0 {
                return Err(E::custom(
                    "peers compact string must be a multiple of 6",
                ));
            }

            let mut peers = Vec::with_capacity(buf_len / ENTRY_LEN);
            for _ in (0..buf_len).step_by(ENTRY_LEN) {
                let addr = Ipv4Addr::from(b.get_u32());
                let port = b.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(addr), port));
            }

            Ok(peers)
        }

        /// Deserializes a list of dicts containing the peer information.
        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Debug, Deserialize)]
            struct RawPeer {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                let ip = if let Ok(ip) = ip.parse() {
                    ip
                } else {
                    continue;
                };
                peers.push(SocketAddr::new(ip, port));
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Deserializes an integer representing seconds into a `Duration`.
fn deserialize_seconds<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s: Option<u64> = de::Deserialize::deserialize(deserializer)?;
    Ok(s.map(Duration::from_secs))
}

/// Contains the characters that need to be URL encoded according to:
/// https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');
