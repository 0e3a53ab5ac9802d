//! Transfer counters used for per peer, per torrent, and session wide rate
//! accounting.
//!
//! A counter tallies bytes as they are transferred and is rolled over once
//! a second by its owner's tick; rolling over folds the round's tally into
//! a weighed running average so that one spiky round does not distort the
//! reported rate.

// some of these APIs are not used yet but will be once per torrent rate
// limits are enforced
#![allow(dead_code)]

use std::ops::AddAssign;

/// Counts the total and per round transferred bytes and derives a 5 second
/// weighed running average from them:
///
/// `avg = avg * 4/5 + round / 5`
#[derive(Clone, Debug, Default)]
pub(crate) struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {
    /// The number of rounds the average is effectively taken over.
    const WEIGHT: f64 = 5.0;

    /// Records transferred bytes in the current round.
    pub fn add(&mut self, bytes: u64) {
        self.total += bytes;
        self.round += bytes;
    }

    /// Adds to the lifetime total without touching the current round or
    /// the rate. Used to restore totals from resume data.
    pub fn add_total(&mut self, bytes: u64) {
        self.total += bytes;
    }

    /// Closes the current round, folding it into the running average.
    ///
    /// Must be called once a second for the average to be a per second rate.
    pub fn tick(&mut self) {
        self.avg = self.avg * (Self::WEIGHT - 1.0) / Self::WEIGHT
            + self.round as f64 / Self::WEIGHT;
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    /// The current rate in bytes per second, as a weighed running average.
    pub fn avg(&self) -> u64 {
        self.avg.round() as u64
    }

    /// The highest rate observed so far.
    pub fn peak(&self) -> u64 {
        self.peak.round() as u64
    }

    /// All bytes recorded since creation.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes recorded in the current (unclosed) round.
    pub fn round(&self) -> u64 {
        self.round
    }
}

impl AddAssign<u64> for Counter {
    fn add_assign(&mut self, bytes: u64) {
        self.add(bytes);
    }
}

/// The counter pair every transfer endpoint keeps: payload bytes down and
/// up. Protocol chatter (handshakes, keepalives, requests) is not counted
/// here; rates and ratios are defined over payload only.
#[derive(Clone, Debug, Default)]
pub(crate) struct ThruputCounters {
    pub down: Counter,
    pub up: Counter,
}

impl ThruputCounters {
    /// Closes the current round on both channels.
    pub fn tick(&mut self) {
        self.down.tick();
        self.up.tick();
    }

    /// Folds another endpoint's unclosed round into this one. Used to
    /// aggregate per peer counters into the torrent's counters before the
    /// tick.
    pub fn merge_round(&mut self, other: &ThruputCounters) {
        self.down.add(other.down.round());
        self.up.add(other.up.round());
    }

    /// The up/down ratio, the metric seeding limits are defined over.
    /// Returns `None` until at least one byte has been downloaded.
    pub fn ratio(&self) -> Option<f64> {
        if self.down.total() == 0 {
            return None;
        }
        Some(self.up.total() as f64 / self.down.total() as f64)
    }
}
