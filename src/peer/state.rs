//! Peer session state: the connection state machine and the choke/interest
//! flags both sides maintain.

use crate::{avg::SlidingDurationAvg, BLOCK_LEN};

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ConnState {
    /// The peer connection has not been started yet, or has been shut down.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The handshakes are being exchanged.
    Handshaking,
    /// The handshakes are exchanged and we expect the peer's piece
    /// availability next: a bitfield, have-all, or have-none message is only
    /// valid directly after the handshake, and anything else implicitly
    /// ends this state with an unknown availability.
    AvailabilityExchange,
    /// The normal state of a peer session in which any message other than
    /// a handshake or an availability message may be exchanged.
    Connected,
}

impl Default for ConnState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The choke and interest flags of a session.
///
/// By default both sides of a connection start off choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SessionStatus {
    /// Whether the peer is choking us. While choked, our requests are not
    /// served.
    pub is_choked: bool,
    /// Whether we are interested in the peer: it has pieces we are missing.
    pub is_interested: bool,
    /// Whether we are choking the peer.
    pub is_peer_choked: bool,
    /// Whether the peer is interested in something we have.
    pub is_peer_interested: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// The smallest and largest request pipelines we run per peer.
pub(crate) const MIN_REQUEST_QUEUE_LEN: usize = 2;
pub(crate) const MAX_REQUEST_QUEUE_LEN: usize = 512;

/// Returns the number of block requests to keep in flight to a peer moving
/// blocks at the given rate: roughly a second's worth of blocks, plus slack
/// so the pipe never runs dry between a block arriving and the next request
/// going out.
pub(crate) fn target_request_queue_len(rate_in: u64) -> usize {
    let per_second = (rate_in as usize + BLOCK_LEN as usize - 1)
        / BLOCK_LEN as usize;
    (per_second + 2).clamp(MIN_REQUEST_QUEUE_LEN, MAX_REQUEST_QUEUE_LEN)
}

/// Throughput statistics of a live session, snapshotted for the torrent
/// once a second. The torrent's choker ranks peers by these.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SessionStats {
    /// Payload bytes per second, as running averages.
    pub rate_down: u64,
    pub rate_up: u64,
    /// Payload byte totals for the torrent's aggregate counters.
    pub round_down: u64,
    pub round_up: u64,
    /// Wasted payload: duplicate or unsolicited blocks.
    pub round_waste: u64,
    pub status: SessionStatus,
    /// Whether the peer's outgoing queue is backed up (see the session's
    /// congestion accounting).
    pub is_congested: bool,
    /// The number of in flight block requests to the peer.
    pub outstanding_request_count: usize,
}

/// Per session request latency tracking, used to time out stuck requests.
#[derive(Debug, Default)]
pub(crate) struct RequestTiming {
    /// A running average of the time a request takes to be served.
    pub round_trip: SlidingDurationAvg,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests the pipeline sizing formula: ceil(rate / block size) + 2,
    // clamped.
    #[test]
    fn test_target_request_queue_len() {
        // an idle link keeps the minimum pipeline
        assert_eq!(target_request_queue_len(0), MIN_REQUEST_QUEUE_LEN);
        // one block per second
        assert_eq!(target_request_queue_len(BLOCK_LEN as u64), 3);
        // 10 MiB/s: 640 blocks per second, clamped to the cap
        assert_eq!(
            target_request_queue_len(10 * 1024 * 1024),
            MAX_REQUEST_QUEUE_LEN
        );
    }
}
