//! Outbound request gate: token bucket + minimum inter-request spacing.
//!
//! Every wire call admits through here, so one flood-wait holds the whole
//! session, not just the worker that triggered it. Uses tokio's clock so
//! tests can run under a paused runtime.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Requests admitted per second once the bucket is drained.
const DEFAULT_REFILL_PER_SEC: f64 = 4.0;
/// Burst capacity.
const DEFAULT_CAPACITY: f64 = 8.0;
/// Minimum spacing between any two admitted requests.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(50);

struct GateState {
    tokens: f64,
    last_refill: Instant,
    /// No request is admitted before this instant; advanced by both the
    /// min-interval spacing and flood-wait holds.
    not_before: Instant,
}

/// Token-bucket gate with a hard floor between requests and a hold
/// mechanism for server-mandated cooldowns.
pub struct RateGate {
    state: Mutex<GateState>,
    capacity: f64,
    refill_per_sec: f64,
    min_interval: Duration,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(
            DEFAULT_CAPACITY,
            DEFAULT_REFILL_PER_SEC,
            DEFAULT_MIN_INTERVAL,
        )
    }
}

impl RateGate {
    pub fn new(capacity: f64, refill_per_sec: f64, min_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(GateState {
                tokens: capacity,
                last_refill: now,
                not_before: now,
            }),
            capacity,
            refill_per_sec,
            min_interval,
        }
    }

    /// Wait until a request may be sent, then consume one token. Callers
    /// suspend here during flood-wait holds.
    pub async fn admit(&self) {
        loop {
            let wait = {
                let mut s = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut s, now);

                let hold_wait = s.not_before.saturating_duration_since(now);
                if hold_wait.is_zero() && s.tokens >= 1.0 {
                    s.tokens -= 1.0;
                    s.not_before = now + self.min_interval;
                    return;
                }
                let token_wait = if s.tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64((1.0 - s.tokens) / self.refill_per_sec)
                };
                hold_wait.max(token_wait)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(5))).await;
        }
    }

    /// Hold the gate shut for `duration` plus a small jitter so resumed
    /// workers do not stampede the instant the cooldown ends.
    pub async fn hold_for(&self, duration: Duration) {
        let jitter = Duration::from_millis(rand::random_range(250..1250));
        let until = Instant::now() + duration + jitter;
        let mut s = self.state.lock().await;
        if until > s.not_before {
            s.not_before = until;
        }
    }

    fn refill(&self, s: &mut GateState, now: Instant) {
        let elapsed = now.saturating_duration_since(s.last_refill);
        s.tokens = (s.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        s.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn min_interval_spaces_requests() {
        let gate = RateGate::new(100.0, 100.0, Duration::from_millis(200));
        let start = Instant::now();
        gate.admit().await;
        gate.admit().await;
        gate.admit().await;
        // Two spacings of 200ms (tokens are plentiful).
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_blocks_all_admissions() {
        let gate = RateGate::new(100.0, 100.0, Duration::from_millis(1));
        gate.admit().await;
        gate.hold_for(Duration::from_secs(30)).await;
        let start = Instant::now();
        gate.admit().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let gate = RateGate::new(2.0, 1.0, Duration::from_millis(1));
        gate.admit().await;
        gate.admit().await;
        // Bucket drained; the third admission must wait ~1s for a token.
        let start = Instant::now();
        gate.admit().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_extends_but_never_shortens() {
        let gate = RateGate::new(10.0, 10.0, Duration::from_millis(1));
        gate.hold_for(Duration::from_secs(60)).await;
        gate.hold_for(Duration::from_secs(5)).await;
        let start = Instant::now();
        gate.admit().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }
}
