//! A bias corrected exponential moving average.
//!
//! Used for smoothing request round trip times when sizing the per peer
//! request pipeline. A plain EMA initialized with zero (or with the first
//! sample) is biased toward that initial value; here the gain starts at 1
//! and decreases with each sample until the configured inverted gain is
//! reached, so early samples carry appropriate weight.
//!
//! The approach follows libtorrent's running averages:
//! https://blog.libtorrent.org/2014/09/running-averages/

use std::time::Duration;

#[derive(Clone, Debug)]
pub(crate) struct SlidingAvg {
    mean: f64,
    /// The number of samples seen, saturating at `inverted_gain`.
    sample_count: usize,
    /// Once this many samples have arrived the average behaves like an EMA
    /// with gain `1 / inverted_gain`.
    inverted_gain: usize,
}

impl SlidingAvg {
    pub fn new(inverted_gain: usize) -> Self {
        debug_assert!(inverted_gain > 0);
        Self {
            mean: 0.0,
            sample_count: 0,
            inverted_gain,
        }
    }

    pub fn update(&mut self, sample: u64) {
        if self.sample_count < self.inverted_gain {
            self.sample_count += 1;
        }
        self.mean += (sample as f64 - self.mean) / self.sample_count as f64;
    }

    pub fn mean(&self) -> u64 {
        self.mean.round() as u64
    }

    pub fn has_samples(&self) -> bool {
        self.sample_count > 0
    }
}

impl Default for SlidingAvg {
    /// Creates a sliding average with an inverted gain of 20.
    fn default() -> Self {
        Self::new(20)
    }
}

/// A [`SlidingAvg`] over durations, kept internally in milliseconds.
#[derive(Clone, Debug, Default)]
pub(crate) struct SlidingDurationAvg(SlidingAvg);

impl SlidingDurationAvg {
    pub fn update(&mut self, sample: Duration) {
        self.0.update(sample.as_millis() as u64);
    }

    pub fn mean(&self) -> Duration {
        Duration::from_millis(self.0.mean())
    }

    pub fn has_samples(&self) -> bool {
        self.0.has_samples()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that the first sample is taken verbatim and later samples are
    // progressively dampened.
    #[test]
    fn test_bias_correction() {
        let mut avg = SlidingAvg::new(4);
        assert!(!avg.has_samples());

        avg.update(100);
        // gain 1: the average IS the first sample
        assert_eq!(avg.mean(), 100);

        avg.update(0);
        // gain 1/2
        assert_eq!(avg.mean(), 50);

        avg.update(0);
        // gain 1/3: 50 - 50/3
        assert_eq!(avg.mean(), 33);

        // after inverted_gain samples the gain stays at 1/4
        avg.update(0);
        avg.update(0);
        assert_eq!(avg.mean(), 19);
    }

    #[test]
    fn test_duration_avg() {
        let mut avg = SlidingDurationAvg::default();
        avg.update(Duration::from_millis(200));
        assert_eq!(avg.mean(), Duration::from_millis(200));
        avg.update(Duration::from_millis(100));
        assert_eq!(avg.mean(), Duration::from_millis(150));
    }
}
