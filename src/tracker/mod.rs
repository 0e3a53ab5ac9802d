//! The tracker announce controller.
//!
//! A torrent holds its announce URLs in ordered tiers (BEP-12). Within
//! a tier the order is randomized once at creation; a tracker that
//! answers is promoted to the front of its tier and tried first from then
//! on. An announce pass walks the tiers in order until one tracker
//! succeeds; if the whole pass fails, the next attempt is scheduled with
//! exponential backoff. Passes run as spawned tasks so a slow tracker
//! never stalls the torrent, and a session wide semaphore bounds how many
//! announces are in flight at once.

pub(crate) mod http;
pub(crate) mod udp;

use std::{fmt, sync::Arc, time::Duration};

use rand::{seq::SliceRandom, Rng};
use tokio::{
    sync::{mpsc::UnboundedSender, OnceCell, Semaphore},
    time::Instant,
};
use url::Url;

use crate::{PeerId, Sha1Hash};
pub(crate) use http::HttpTracker;
pub(crate) use udp::UdpTracker;

/// The default announce interval when the tracker doesn't dictate one.
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// The backoff start after the first full announce pass failure.
const BACKOFF_BASE: Duration = Duration::from_secs(15);

/// Backoff never exceeds this.
const BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);

/// The ways in which contacting a tracker may fail.
#[derive(Debug)]
pub(crate) enum TrackerError {
    /// HTTP transport errors.
    Http(reqwest::Error),
    /// The response was not valid bencode (or not a valid datagram).
    Bencode(serde_bencode::Error),
    /// The response was malformed at the protocol level.
    Protocol,
    /// The tracker itself reported a failure, with its message.
    Announced(String),
    /// The announce URL has no scrape equivalent.
    NoScrape,
    /// Socket level errors (UDP) or timeouts.
    Io(std::io::Error),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "{}", e),
            Self::Bencode(e) => write!(f, "{}", e),
            Self::Protocol => write!(f, "malformed tracker response"),
            Self::Announced(reason) => write!(f, "tracker: {}", reason),
            Self::NoScrape => write!(f, "tracker does not support scrape"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<serde_bencode::Error> for TrackerError {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The optional announce event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    /// The first announce of a (re)started torrent must carry this.
    Started,
    /// Sent once when the download completes. Must not be sent by
    /// a torrent that started as a seed.
    Completed,
    /// Sent when the torrent stops, so the tracker can drop us from the
    /// swarm.
    Stopped,
}

/// Parameters for announcing to a tracker.
#[derive(Clone, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port on which we accept peer connections.
    pub port: u16,
    /// Payload byte totals for this torrent.
    pub downloaded: u64,
    pub uploaded: u64,
    /// The number of bytes left to download. 0 makes the tracker count us
    /// as a seed.
    pub left: u64,
    /// How many peers we'd like.
    pub numwant: usize,
    pub event: Option<Event>,
    /// Echoed back if the tracker gave us one earlier.
    pub tracker_id: Option<String>,
}

/// A successful announce.
#[derive(Debug)]
pub(crate) struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub tracker_id: Option<String>,
    pub seeder_count: Option<usize>,
    pub leecher_count: Option<usize>,
    pub peers: Vec<std::net::SocketAddr>,
}

/// A successful scrape.
#[derive(Debug)]
pub(crate) struct ScrapeResponse {
    pub seeder_count: Option<usize>,
    pub leecher_count: Option<usize>,
    pub download_count: Option<usize>,
}

/// What an announce pass reports back to the torrent.
#[derive(Debug)]
pub(crate) enum TrackerUpdate {
    /// Some tracker in the pass answered. `tier` and `index` identify it
    /// for promotion.
    AnnounceOk {
        tier: usize,
        index: usize,
        response: AnnounceResponse,
    },
    /// Every tracker in every tier failed.
    AnnounceFailed,
    ScrapeOk(ScrapeResponse),
    ScrapeFailed,
}

/// One announce URL and its lazily initialized protocol client.
#[derive(Clone)]
struct TrackerEntry {
    url: Url,
    client: TrackerClient,
}

#[derive(Clone)]
enum TrackerClient {
    Http(Arc<HttpTracker>),
    /// UDP trackers need async host resolution, done on first use and
    /// cached (`None` caches a failed resolution).
    Udp(Arc<OnceCell<Option<Arc<UdpTracker>>>>),
    /// A scheme we don't speak; always fails.
    Unsupported,
}

impl TrackerEntry {
    fn new(url: Url) -> Self {
        let client = match url.scheme() {
            "http" | "https" => {
                TrackerClient::Http(Arc::new(HttpTracker::new(url.clone())))
            }
            "udp" => TrackerClient::Udp(Arc::new(OnceCell::new())),
            _ => TrackerClient::Unsupported,
        };
        Self { url, client }
    }

    async fn announce(
        &self,
        params: &Announce,
    ) -> Result<AnnounceResponse, TrackerError> {
        match &self.client {
            TrackerClient::Http(tracker) => tracker.announce(params).await,
            TrackerClient::Udp(cell) => {
                let tracker = cell
                    .get_or_init(|| async {
                        UdpTracker::from_url(&self.url).await.map(Arc::new)
                    })
                    .await;
                match tracker {
                    Some(tracker) => tracker.announce(params).await,
                    None => Err(TrackerError::Protocol),
                }
            }
            TrackerClient::Unsupported => Err(TrackerError::Protocol),
        }
    }

    async fn scrape(
        &self,
        info_hash: &Sha1Hash,
    ) -> Result<ScrapeResponse, TrackerError> {
        match &self.client {
            TrackerClient::Http(tracker) => tracker.scrape(info_hash).await,
            TrackerClient::Udp(cell) => {
                let tracker = cell
                    .get_or_init(|| async {
                        UdpTracker::from_url(&self.url).await.map(Arc::new)
                    })
                    .await;
                match tracker {
                    Some(tracker) => tracker.scrape(info_hash).await,
                    None => Err(TrackerError::Protocol),
                }
            }
            TrackerClient::Unsupported => Err(TrackerError::NoScrape),
        }
    }
}

/// A torrent's announce state: the tiers, the schedule, and the backoff.
pub(crate) struct TrackerSet {
    tiers: Vec<Vec<TrackerEntry>>,
    /// When the next periodic announce is due.
    next_announce_at: Instant,
    /// The tracker-dictated floor on announce frequency.
    min_interval: Option<Duration>,
    /// Full pass failures since the last success.
    consecutive_failures: u32,
    /// Whether an announce pass is currently in flight.
    is_announcing: bool,
    tracker_id: Option<String>,
}

impl TrackerSet {
    /// Builds the tier list from announce URL tiers, randomizing the order
    /// within each tier. Unparsable URLs are dropped.
    pub fn new(tiers: &[Vec<String>]) -> Self {
        let mut rng = rand::thread_rng();
        let tiers = tiers
            .iter()
            .map(|tier| {
                let mut tier: Vec<TrackerEntry> = tier
                    .iter()
                    .filter_map(|url| url.parse().ok())
                    .map(TrackerEntry::new)
                    .collect();
                tier.shuffle(&mut rng);
                tier
            })
            .filter(|tier: &Vec<TrackerEntry>| !tier.is_empty())
            .collect();
        Self {
            tiers,
            next_announce_at: Instant::now(),
            min_interval: None,
            consecutive_failures: 0,
            is_announcing: false,
            tracker_id: None,
        }
    }

    pub fn has_trackers(&self) -> bool {
        !self.tiers.is_empty()
    }

    pub fn tracker_id(&self) -> Option<String> {
        self.tracker_id.clone()
    }

    /// Whether a periodic announce should be started now.
    pub fn should_announce(&self, now: Instant) -> bool {
        self.has_trackers() && !self.is_announcing && now >= self.next_announce_at
    }

    /// Makes the next announce happen immediately (for `completed` and
    /// `stopped` events), still respecting the tracker's minimum interval
    /// is not needed for events per the protocol.
    pub fn announce_now(&mut self) {
        self.next_announce_at = Instant::now();
    }

    /// Spawns an announce pass over the tiers. The result is delivered to
    /// `update_tx` and must be fed back via [`Self::handle_update`].
    pub fn announce(
        &mut self,
        params: Announce,
        announce_permits: Arc<Semaphore>,
        update_tx: UnboundedSender<TrackerUpdate>,
    ) {
        if !self.has_trackers() {
            return;
        }
        self.is_announcing = true;
        // push the schedule out in case the result never arrives
        self.next_announce_at = Instant::now() + DEFAULT_ANNOUNCE_INTERVAL;

        let tiers: Vec<Vec<TrackerEntry>> = self.tiers.clone();
        tokio::spawn(async move {
            for (tier_index, tier) in tiers.iter().enumerate() {
                for (index, entry) in tier.iter().enumerate() {
                    // bound concurrent announces across the session
                    let _permit = announce_permits.acquire().await;
                    log::debug!("Announcing to {}", entry.url);
                    match entry.announce(&params).await {
                        Ok(response) => {
                            let _ = update_tx.send(TrackerUpdate::AnnounceOk {
                                tier: tier_index,
                                index,
                                response,
                            });
                            return;
                        }
                        Err(e) => {
                            log::info!(
                                "Announce to {} failed: {}",
                                entry.url,
                                e
                            );
                        }
                    }
                }
            }
            let _ = update_tx.send(TrackerUpdate::AnnounceFailed);
        });
    }

    /// Spawns a scrape of the preferred (front) tracker.
    pub fn scrape(
        &self,
        info_hash: Sha1Hash,
        announce_permits: Arc<Semaphore>,
        update_tx: UnboundedSender<TrackerUpdate>,
    ) {
        let entry = match self.tiers.first().and_then(|tier| tier.first()) {
            Some(entry) => entry.clone(),
            None => return,
        };
        tokio::spawn(async move {
            let _permit = announce_permits.acquire().await;
            let update = match entry.scrape(&info_hash).await {
                Ok(response) => TrackerUpdate::ScrapeOk(response),
                Err(e) => {
                    log::info!("Scrape of {} failed: {}", entry.url, e);
                    TrackerUpdate::ScrapeFailed
                }
            };
            let _ = update_tx.send(update);
        });
    }

    /// Applies an announce pass result: promotes the answering tracker to
    /// its tier front and schedules the next announce, or backs off
    /// exponentially after a full pass failure.
    pub fn handle_update(&mut self, update: &TrackerUpdate) {
        match update {
            TrackerUpdate::AnnounceOk {
                tier,
                index,
                response,
            } => {
                self.is_announcing = false;
                self.consecutive_failures = 0;

                // the tracker that answered is tried first next time
                if let Some(tier) = self.tiers.get_mut(*tier) {
                    if *index < tier.len() {
                        let entry = tier.remove(*index);
                        tier.insert(0, entry);
                    }
                }

                if let Some(tracker_id) = &response.tracker_id {
                    self.tracker_id = Some(tracker_id.clone());
                }
                self.min_interval = response.min_interval;

                let mut interval = response
                    .interval
                    .unwrap_or(DEFAULT_ANNOUNCE_INTERVAL);
                if let Some(min_interval) = response.min_interval {
                    interval = interval.max(min_interval);
                }
                self.next_announce_at = Instant::now() + interval;
            }
            TrackerUpdate::AnnounceFailed => {
                self.is_announcing = false;
                self.consecutive_failures =
                    self.consecutive_failures.saturating_add(1);
                self.next_announce_at = Instant::now()
                    + backoff_interval(self.consecutive_failures);
            }
            TrackerUpdate::ScrapeOk(_) | TrackerUpdate::ScrapeFailed => {}
        }
    }
}

/// The exponential backoff: `base * 2^failures` capped at 30 minutes,
/// jittered by ±10% so a swarm of clients doesn't reconverge on the
/// tracker in lockstep.
fn backoff_interval(failures: u32) -> Duration {
    let base = BACKOFF_BASE.as_secs_f64();
    let unjittered =
        (base * 2f64.powi(failures.min(16) as i32)).min(BACKOFF_CAP.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(unjittered * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_set(tiers: &[&[&str]]) -> TrackerSet {
        let tiers: Vec<Vec<String>> = tiers
            .iter()
            .map(|tier| tier.iter().map(|s| s.to_string()).collect())
            .collect();
        TrackerSet::new(&tiers)
    }

    #[test]
    fn test_tier_construction() {
        let set = make_set(&[
            &["http://a/announce", "not a url", "udp://b:80/announce"],
            &["http://c/announce"],
            &[],
        ]);
        // the empty tier and the invalid URL are dropped
        assert_eq!(set.tiers.len(), 2);
        assert_eq!(set.tiers[0].len(), 2);
        assert_eq!(set.tiers[1].len(), 1);
        assert!(set.has_trackers());

        assert!(!make_set(&[]).has_trackers());
    }

    // Tests that a successful announce promotes the answering tracker to
    // the front of its tier.
    #[test]
    fn test_promotion_on_success() {
        let mut set = make_set(&[&[
            "http://a/announce",
            "http://b/announce",
            "http://c/announce",
        ]]);
        let last = set.tiers[0][2].url.clone();

        set.handle_update(&TrackerUpdate::AnnounceOk {
            tier: 0,
            index: 2,
            response: AnnounceResponse {
                interval: Some(Duration::from_secs(60)),
                min_interval: None,
                tracker_id: Some("tid".into()),
                seeder_count: None,
                leecher_count: None,
                peers: vec![],
            },
        });

        assert_eq!(set.tiers[0][0].url, last);
        assert_eq!(set.tracker_id(), Some("tid".into()));
        assert_eq!(set.consecutive_failures, 0);
        // the next announce respects the returned interval
        assert!(!set.should_announce(Instant::now()));
    }

    // Tests exponential backoff growth with its cap.
    #[test]
    fn test_backoff() {
        // the jitter is ±10%, so compare against loose bounds
        let first = backoff_interval(1);
        assert!(first >= Duration::from_secs(27), "{:?}", first);
        assert!(first <= Duration::from_secs(33), "{:?}", first);

        let eighth = backoff_interval(8);
        // 15 * 2^8 = 3840, over the 1800 cap
        assert!(eighth >= Duration::from_secs(1620), "{:?}", eighth);
        assert!(eighth <= Duration::from_secs(1980), "{:?}", eighth);

        // large failure counts don't overflow
        let many = backoff_interval(1000);
        assert!(many <= Duration::from_secs(1980));
    }

    #[test]
    fn test_failure_schedules_backoff() {
        let mut set = make_set(&[&["http://a/announce"]]);
        assert!(set.should_announce(Instant::now()));

        set.is_announcing = true;
        assert!(!set.should_announce(Instant::now()));

        set.handle_update(&TrackerUpdate::AnnounceFailed);
        assert_eq!(set.consecutive_failures, 1);
        // backed off: not due now, but due within the backoff bound
        assert!(!set.should_announce(Instant::now()));
        assert!(set.should_announce(
            Instant::now() + Duration::from_secs(34)
        ));
    }

    // Tests a full announce pass against a mock HTTP tracker, end to end
    // through the spawned task.
    #[tokio::test]
    async fn test_announce_pass() {
        // keyed on this test's info hash so concurrently running tracker
        // tests don't cross-match
        let _m = mockito::mock("GET", "/")
            .match_query(mockito::Matcher::Regex(
                "info_hash=%01%01".into(),
            ))
            .with_status(200)
            .with_body(b"d8:intervali120e5:peers0:e".to_vec())
            .create();

        let mut set = make_set(&[&[mockito::server_url().as_str()]]);
        let (update_tx, mut update_rx) =
            tokio::sync::mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(4));

        let params = Announce {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            downloaded: 0,
            uploaded: 0,
            left: 100,
            numwant: 50,
            event: Some(Event::Started),
            tracker_id: None,
        };
        set.announce(params, permits, update_tx);
        assert!(set.is_announcing);

        let update = update_rx.recv().await.unwrap();
        match &update {
            TrackerUpdate::AnnounceOk { response, .. } => {
                assert_eq!(
                    response.interval,
                    Some(Duration::from_secs(120))
                );
            }
            other => panic!("unexpected update: {:?}", other),
        }
        set.handle_update(&update);
        assert!(!set.is_announcing);
    }
}
