//! Packet rate estimation from the monotonically increasing packet counter.

use tokio::time::Instant;

/// Turns successive `(packet_count, time)` samples into packets per second.
#[derive(Debug, Default)]
pub struct RateEstimator {
    previous: Option<(u64, Instant)>,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample and return the rate since the previous one.
    ///
    /// Returns `None` for the first sample (warm-up) and when no time has
    /// passed since the previous sample; in the latter case the previous
    /// sample is kept so the next tick measures over the full interval.
    /// A counter that moved backwards counts as zero packets.
    pub fn sample(&mut self, packet_count: u64, now: Instant) -> Option<f64> {
        let (prev_count, prev_time) = match self.previous {
            Some(prev) => prev,
            None => {
                self.previous = Some((packet_count, now));
                return None;
            }
        };

        let elapsed = now.saturating_duration_since(prev_time).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        self.previous = Some((packet_count, now));
        let delta = packet_count.saturating_sub(prev_count);
        Some(delta as f64 / elapsed)
    }
}
