//! Progress aggregation: byte samples in a ring, instantaneous speed as
//! the slope of the newest window.
//!
//! Snapshots are read-only and safe to request from any task.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// How far back the speed window reaches.
const SPEED_WINDOW: Duration = Duration::from_secs(10);
/// Ring capacity; at one sample per chunk this covers well past the window.
const MAX_SAMPLES: usize = 256;

struct Ring {
    samples: VecDeque<(Instant, u64)>,
    /// Running total of bytes ticked in; survives ring eviction.
    total: u64,
}

/// Per-job speed meter. Workers push a tick per chunk; the API layer polls
/// `speed_bps` for the descriptor snapshot.
pub struct ProgressReporter {
    ring: Mutex<Ring>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                samples: VecDeque::with_capacity(MAX_SAMPLES),
                total: 0,
            }),
        }
    }

    /// Record `bytes` freshly downloaded.
    pub fn tick(&self, bytes: u64) {
        let mut ring = self.ring.lock().expect("reporter lock");
        let now = Instant::now();
        ring.total += bytes;
        let total = ring.total;
        ring.samples.push_back((now, total));
        if ring.samples.len() > MAX_SAMPLES {
            ring.samples.pop_front();
        }
    }

    /// Instantaneous speed in bytes/second: slope over the newest window.
    /// Zero when fewer than two samples fall inside it.
    pub fn speed_bps(&self) -> u64 {
        let ring = self.ring.lock().expect("reporter lock");
        let now = Instant::now();
        let cutoff = now.checked_sub(SPEED_WINDOW).unwrap_or(now);

        let mut oldest: Option<(Instant, u64)> = None;
        for &(t, total) in ring.samples.iter() {
            if t >= cutoff {
                oldest = Some((t, total));
                break;
            }
        }
        let Some((t0, b0)) = oldest else {
            return 0;
        };
        let Some(&(t1, b1)) = ring.samples.back() else {
            return 0;
        };
        let dt = t1.saturating_duration_since(t0).as_secs_f64();
        if dt <= 0.0 || b1 <= b0 {
            return 0;
        }
        ((b1 - b0) as f64 / dt) as u64
    }

    /// Total bytes ticked since creation.
    pub fn total_bytes(&self) -> u64 {
        self.ring.lock().expect("reporter lock").total
    }

    /// Forget history (job pause/resume boundaries) so stale samples do
    /// not fake a speed after an idle stretch.
    pub fn reset_window(&self) {
        let mut ring = self.ring.lock().expect("reporter lock");
        ring.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn speed_is_slope_of_window() {
        let r = ProgressReporter::new();
        r.tick(0);
        tokio::time::advance(Duration::from_secs(1)).await;
        r.tick(1000);
        tokio::time::advance(Duration::from_secs(1)).await;
        r.tick(1000);
        // 2000 bytes over 2 seconds.
        let speed = r.speed_bps();
        assert!((900..=1100).contains(&speed), "speed = {}", speed);
    }

    #[tokio::test(start_paused = true)]
    async fn old_samples_fall_out_of_window() {
        let r = ProgressReporter::new();
        r.tick(10_000);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(r.speed_bps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_samples_but_not_total() {
        let r = ProgressReporter::new();
        r.tick(500);
        r.reset_window();
        assert_eq!(r.speed_bps(), 0);
        assert_eq!(r.total_bytes(), 500);
    }

    #[test]
    fn no_samples_means_zero_speed() {
        let r = ProgressReporter::new();
        assert_eq!(r.speed_bps(), 0);
    }
}
