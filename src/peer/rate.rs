use std::collections::VecDeque;
use std::time::Duration;

/// Seconds of history kept by [`AverageFill`].
const AVERAGE_WINDOW: u64 = 10;

/// Smoothed block round-trip delay, overall and per pipeline depth.
///
/// Every sample is folded in as `(old * 7 + sample) / 8`; the first sample
/// for a slot seeds it directly.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    block_delay: Option<Duration>,
    depth_delay: Vec<Option<Duration>>,
}

impl RateEstimator {
    pub fn new(depths: usize) -> Self {
        Self {
            block_delay: None,
            depth_delay: vec![None; depths.max(1)],
        }
    }

    /// Records one completed request sent at pipeline depth `depth`.
    ///
    /// Returns `true` when this was the first sample since the last reset.
    pub fn record(&mut self, depth: usize, sample: Duration) -> bool {
        let first = self.block_delay.is_none();
        self.block_delay = Some(smooth(self.block_delay, sample));

        let slot = depth.min(self.depth_delay.len() - 1);
        self.depth_delay[slot] = Some(smooth(self.depth_delay[slot], sample));
        first
    }

    pub fn block_delay(&self) -> Option<Duration> {
        self.block_delay
    }

    pub fn depth_delay(&self, depth: usize) -> Option<Duration> {
        self.depth_delay.get(depth).copied().flatten()
    }

    pub fn depths(&self) -> usize {
        self.depth_delay.len()
    }

    pub fn reset(&mut self) {
        self.block_delay = None;
        self.depth_delay.iter_mut().for_each(|slot| *slot = None);
    }
}

fn smooth(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        Some(previous) => (previous * 7 + sample) / 8,
        None => sample,
    }
}

/// Bytes-per-second sampler fed with a running byte total, keyed by second.
#[derive(Debug, Clone, Default)]
pub struct AverageFill {
    samples: VecDeque<(u64, u64)>,
}

impl AverageFill {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the cumulative `total` observed during `second`.
    pub fn fill(&mut self, second: u64, total: u64) {
        match self.samples.back_mut() {
            Some((last, value)) if *last == second => *value = total,
            _ => self.samples.push_back((second, total)),
        }

        while let Some(&(oldest, _)) = self.samples.front() {
            if second.saturating_sub(oldest) <= AVERAGE_WINDOW {
                break;
            }
            self.samples.pop_front();
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(&(first_sec, first)), Some(&(last_sec, last))) if last_sec > first_sec => {
                last.saturating_sub(first) / (last_sec - first_sec)
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn first_sample_seeds() {
        let mut rate = RateEstimator::new(10);
        assert!(rate.record(0, MS * 80));
        assert_eq!(rate.block_delay(), Some(MS * 80));
        assert!(!rate.record(0, MS * 160));
        // (80 * 7 + 160) / 8
        assert_eq!(rate.block_delay(), Some(MS * 90));
        assert_eq!(rate.depth_delay(0), Some(MS * 90));
    }

    #[test]
    fn depths_are_independent() {
        let mut rate = RateEstimator::new(10);
        rate.record(0, MS * 10);
        rate.record(1, MS * 20);
        rate.record(2, MS * 30);
        assert_eq!(rate.depth_delay(0), Some(MS * 10));
        assert_eq!(rate.depth_delay(1), Some(MS * 20));
        assert_eq!(rate.depth_delay(2), Some(MS * 30));
        assert_eq!(rate.depth_delay(3), None);
    }

    #[test]
    fn deep_pipelines_land_in_last_slot() {
        let mut rate = RateEstimator::new(4);
        rate.record(17, MS * 5);
        assert_eq!(rate.depth_delay(3), Some(MS * 5));
    }

    #[test]
    fn reset_forgets_samples() {
        let mut rate = RateEstimator::new(2);
        rate.record(1, MS);
        rate.reset();
        assert_eq!(rate.block_delay(), None);
        assert_eq!(rate.depth_delay(1), None);
        assert!(rate.record(1, MS));
    }

    #[test]
    fn average_fill_rate() {
        let mut avg = AverageFill::new();
        assert_eq!(avg.bytes_per_second(), 0);
        avg.fill(100, 0);
        avg.fill(101, 1000);
        avg.fill(101, 2000);
        avg.fill(102, 4000);
        assert_eq!(avg.bytes_per_second(), 2000);

        // Old seconds fall out of the window
        avg.fill(120, 6000);
        assert_eq!(avg.bytes_per_second(), 0);
        avg.fill(121, 7000);
        assert_eq!(avg.bytes_per_second(), 1000);
    }
}
