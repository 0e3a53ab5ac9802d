//! The choking algorithm.
//!
//! Every 10 seconds the torrent runs a choke round: the peers interested in
//! us are ranked by how fast they upload to us (or, when seeding, how fast
//! we upload to them) and the top few get the regular unchoke slots. Every
//! third round one uniformly random interested-but-choked peer is unchoked
//! besides (the optimistic unchoke), which is how new upload partners are
//! discovered. A freshly unchoked peer is protected from being choked
//! again for a short window so the slots don't oscillate.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

/// The number of regular unchoke slots.
pub(crate) const UNCHOKE_SLOTS: usize = 4;

/// How often a choke round runs.
pub(crate) const CHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// Every this many rounds an optimistic unchoke happens.
const OPTIMISTIC_ROUND_INTERVAL: u64 = 3;

/// A peer unchoked within this window is not choked again (anti
/// oscillation).
const RECHOKE_PROTECTION: Duration = Duration::from_secs(20);

/// What the choker needs to know about a peer to rank it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChokeCandidate {
    pub addr: SocketAddr,
    /// Whether the peer is interested in our pieces. Only interested peers
    /// compete for slots.
    pub is_interested: bool,
    /// The peer's payload upload rate to us, bytes per second.
    pub rate_down: u64,
    /// Our payload upload rate to the peer, bytes per second.
    pub rate_up: u64,
}

/// The outcome of a round: who to unchoke and who to choke. Peers already
/// in the right state are included; the torrent only sends commands on
/// actual transitions.
#[derive(Debug, Default)]
pub(crate) struct ChokeDecision {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

pub(crate) struct Choker {
    round: u64,
    /// When each currently unchoked peer got its slot.
    unchoked_at: HashMap<SocketAddr, Instant>,
    /// The current optimistic unchoke, kept until the next optimistic
    /// round.
    optimistic: Option<SocketAddr>,
}

impl Choker {
    pub fn new() -> Self {
        Self {
            round: 0,
            unchoked_at: HashMap::new(),
            optimistic: None,
        }
    }

    /// Runs one choke round over the connected peers.
    ///
    /// When `is_seeding`, peers are ranked by how fast we upload to them
    /// (favoring peers that actually take our data); otherwise by how fast
    /// they upload to us.
    pub fn run_round(
        &mut self,
        candidates: &[ChokeCandidate],
        is_seeding: bool,
        now: Instant,
    ) -> ChokeDecision {
        self.round += 1;

        // drop state of peers that disconnected
        self.unchoked_at
            .retain(|addr, _| candidates.iter().any(|c| &c.addr == addr));
        if let Some(optimistic) = self.optimistic {
            if !candidates.iter().any(|c| c.addr == optimistic) {
                self.optimistic = None;
            }
        }

        // rank the interested peers by transfer rate
        let mut ranked: Vec<&ChokeCandidate> =
            candidates.iter().filter(|c| c.is_interested).collect();
        ranked.sort_by_key(|c| {
            std::cmp::Reverse(if is_seeding { c.rate_up } else { c.rate_down })
        });

        let mut unchoke: Vec<SocketAddr> = ranked
            .iter()
            .take(UNCHOKE_SLOTS)
            .map(|c| c.addr)
            .collect();

        // the optimistic unchoke: every third round a random interested
        // choked peer gets an extra slot, and keeps it until the next
        // optimistic round
        if self.round % OPTIMISTIC_ROUND_INTERVAL == 0 {
            let choked: Vec<SocketAddr> = ranked
                .iter()
                .map(|c| c.addr)
                .filter(|addr| {
                    !unchoke.contains(addr)
                        && !self.unchoked_at.contains_key(addr)
                })
                .collect();
            self.optimistic =
                choked.choose(&mut rand::thread_rng()).copied();
        }
        if let Some(optimistic) = self.optimistic {
            if !unchoke.contains(&optimistic) {
                unchoke.push(optimistic);
            }
        }

        // a peer unchoked only moments ago keeps its slot even if it fell
        // out of the ranking
        for (addr, since) in self.unchoked_at.iter() {
            if now.duration_since(*since) < RECHOKE_PROTECTION
                && !unchoke.contains(addr)
            {
                unchoke.push(*addr);
            }
        }

        // record slot grant times, keeping the original time of peers that
        // stay unchoked
        for addr in unchoke.iter() {
            self.unchoked_at.entry(*addr).or_insert(now);
        }
        self.unchoked_at.retain(|addr, _| unchoke.contains(addr));

        let choke = candidates
            .iter()
            .map(|c| c.addr)
            .filter(|addr| !unchoke.contains(addr))
            .collect();

        ChokeDecision { unchoke, choke }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", i).parse().unwrap()
    }

    fn candidates(rates: &[u64]) -> Vec<ChokeCandidate> {
        rates
            .iter()
            .enumerate()
            .map(|(i, rate)| ChokeCandidate {
                addr: addr(i as u8),
                is_interested: true,
                rate_down: *rate,
                rate_up: 0,
            })
            .collect()
    }

    // Tests the ranking round: with 8 interested peers at descending rates
    // the top 4 get the regular slots, and after the optimistic round one
    // of the remaining 4 is additionally unchoked.
    #[test]
    fn test_ranking_and_optimistic_round() {
        let mut choker = Choker::new();
        let now = Instant::now();
        let peers = candidates(&[
            10_000, 9_000, 8_000, 7_000, 6_000, 5_000, 4_000, 3_000,
        ]);

        // rounds 1 and 2 are regular
        let decision = choker.run_round(&peers, false, now);
        let top: Vec<SocketAddr> =
            (0..4).map(|i| addr(i as u8)).collect();
        assert_eq!(decision.unchoke, top);
        assert_eq!(decision.choke.len(), 4);

        let now = now + CHOKE_INTERVAL;
        choker.run_round(&peers, false, now);

        // round 3 is optimistic: one of the slower peers is additionally
        // unchoked
        let now = now + CHOKE_INTERVAL;
        let decision = choker.run_round(&peers, false, now);
        assert_eq!(decision.unchoke.len(), 5);
        let optimistic = decision
            .unchoke
            .iter()
            .find(|addr| !top.contains(addr))
            .unwrap();
        assert!((4..8).map(|i| addr(i as u8)).any(|a| &a == optimistic));
        assert_eq!(decision.choke.len(), 3);
    }

    // Tests that only interested peers get slots.
    #[test]
    fn test_uninterested_never_unchoked() {
        let mut choker = Choker::new();
        let mut peers = candidates(&[10_000, 9_000]);
        peers[0].is_interested = false;

        for _ in 0..4 {
            let decision =
                choker.run_round(&peers, false, Instant::now());
            assert!(!decision.unchoke.contains(&peers[0].addr));
            assert!(decision.choke.contains(&peers[0].addr));
        }
    }

    // Tests that when seeding the ranking uses our upload rate to the
    // peers.
    #[test]
    fn test_seeding_ranks_by_upload() {
        let mut choker = Choker::new();
        let mut peers = candidates(&[0; 6]);
        for (i, peer) in peers.iter_mut().enumerate() {
            peer.rate_up = (i as u64) * 1000;
        }

        let decision = choker.run_round(&peers, true, Instant::now());
        // the four fastest-taking peers are 5, 4, 3, 2
        assert_eq!(
            decision.unchoke,
            vec![addr(5), addr(4), addr(3), addr(2)]
        );
    }

    // Tests the anti oscillation window: a peer that just got a slot keeps
    // it through the next round even if its rate collapses.
    #[test]
    fn test_recent_unchoke_protected() {
        let mut choker = Choker::new();
        let now = Instant::now();
        let mut peers = candidates(&[10_000, 9_000, 8_000, 7_000, 6_000]);

        let decision = choker.run_round(&peers, false, now);
        assert!(decision.unchoke.contains(&addr(0)));

        // peer 0's rate collapses below everyone's
        peers[0].rate_down = 0;
        let now = now + CHOKE_INTERVAL;
        let decision = choker.run_round(&peers, false, now);
        // within the protection window it keeps its slot besides the new
        // top 4
        assert!(decision.unchoke.contains(&addr(0)));

        // but once the window passes it is choked
        let now = now + RECHOKE_PROTECTION;
        let decision = choker.run_round(&peers, false, now);
        assert!(!decision.unchoke.contains(&addr(0)));
        assert!(decision.choke.contains(&addr(0)));
    }
}
