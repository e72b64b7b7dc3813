// =============================================================================
// Request throttle — sliding-window limiter for the exchange adapter
// =============================================================================
//
// At most `max_per_window` requests may start within any rolling window.
// Callers await `acquire` before every request; when the window is full the
// caller is suspended until the oldest in-window request ages out. Counters
// are shared process-wide so concurrent collection tasks stay within the
// exchange budget together.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Sliding-window rate limiter that suspends callers instead of failing them.
pub struct RateLimiter {
    window: Duration,
    max_per_window: usize,
    sent: Mutex<VecDeque<Instant>>,
}

/// Serialisable view of the limiter for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub in_window: usize,
    pub max_per_window: usize,
}

impl RateLimiter {
    /// A limiter allowing `max_per_window` requests per rolling `window`.
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            window,
            max_per_window: max_per_window.max(1),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// The standard per-second limiter used by the exchange adapter.
    pub fn per_second(max_per_sec: u32) -> Self {
        Self::new(max_per_sec as usize, Duration::from_secs(1))
    }

    /// Wait until a request slot is free, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut sent = self.sent.lock();
                let now = Instant::now();
                while let Some(front) = sent.front() {
                    if now.duration_since(*front) >= self.window {
                        sent.pop_front();
                    } else {
                        break;
                    }
                }

                if sent.len() < self.max_per_window {
                    sent.push_back(now);
                    return;
                }

                // Window full: sleep until the oldest entry expires.
                let oldest = *sent.front().expect("window full implies non-empty");
                self.window.saturating_sub(now.duration_since(oldest))
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limiter suspending caller");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Non-blocking view of the current window occupancy.
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut sent = self.sent.lock();
        let now = Instant::now();
        while let Some(front) = sent.front() {
            if now.duration_since(*front) >= self.window {
                sent.pop_front();
            } else {
                break;
            }
        }
        RateLimiterSnapshot {
            in_window: sent.len(),
            max_per_window: self.max_per_window,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RateLimiter")
            .field("in_window", &snap.in_window)
            .field("max_per_window", &snap.max_per_window)
            .field("window", &self.window)
            .finish()
    }
}
