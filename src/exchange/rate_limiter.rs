//! Rolling-window request limiter.
//!
//! Keeps the timestamps of the last `capacity` dispatched requests in a ring.
//! A new request waits until the oldest of those is at least `period` old, so
//! no trailing window of `period` ever holds more than `capacity` requests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Poloniex allows 6 calls per second per IP.
pub const DEFAULT_REQUESTS_PER_PERIOD: usize = 6;
pub const DEFAULT_PERIOD_MS: u64 = 1000;

/// Clean responses in a row before a widened period is restored.
pub const RECOVERY_STREAK: u32 = 60;

/// Sliding-window limiter with an adaptively widened period.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    default_period_ms: u64,
    period_ms: AtomicU64,
    clean_streak: AtomicU32,
    history: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(capacity: usize, period_ms: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            default_period_ms: period_ms,
            period_ms: AtomicU64::new(period_ms),
            clean_streak: AtomicU32::new(0),
            history: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms.load(Ordering::SeqCst)
    }

    pub fn default_period_ms(&self) -> u64 {
        self.default_period_ms
    }

    fn max_period_ms(&self) -> u64 {
        self.default_period_ms + self.default_period_ms / 2
    }

    /// Wait until one more request fits in the window, then record it.
    ///
    /// The ring stays locked while sleeping, so concurrent callers cannot
    /// both observe the same free slot.
    pub async fn acquire(&self) {
        let mut history = self.history.lock().await;

        if history.len() >= self.capacity {
            if let Some(&oldest) = history.front() {
                let period = Duration::from_millis(self.period_ms());
                let elapsed = oldest.elapsed();
                if elapsed < period {
                    let wait = period - elapsed;
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
            history.pop_front();
        }

        history.push_back(Instant::now());
    }

    /// Widen the window after a ban signal, capped at 1.5x the default.
    pub fn increase_period(&self, delta_ms: u64) -> u64 {
        self.clean_streak.store(0, Ordering::SeqCst);
        let max = self.max_period_ms();
        let prev = self
            .period_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                Some(p.saturating_add(delta_ms).min(max))
            })
            .unwrap_or_else(|p| p);
        let current = prev.saturating_add(delta_ms).min(max);
        if current != prev {
            warn!(period_ms = current, "Request period increased");
        }
        current
    }

    /// Restore the default period once requests succeed again.
    pub fn reset_period(&self) {
        self.clean_streak.store(0, Ordering::SeqCst);
        let prev = self.period_ms.swap(self.default_period_ms, Ordering::SeqCst);
        if prev != self.default_period_ms {
            debug!(period_ms = self.default_period_ms, "Request period reset");
        }
    }

    /// Note a clean response; restore the default period once enough of
    /// them arrive in a row after a ban.
    pub fn record_clean_response(&self) {
        if self.period_ms() == self.default_period_ms {
            return;
        }
        let streak = self.clean_streak.fetch_add(1, Ordering::SeqCst) + 1;
        if streak >= RECOVERY_STREAK {
            self.reset_period();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_PERIOD, DEFAULT_PERIOD_MS)
    }
}
