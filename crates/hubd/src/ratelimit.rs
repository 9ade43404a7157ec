use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window rate limiter: at most `limit` admitted frames per
/// `window` of wall time.
///
/// Unlike a fixed window that resets at interval boundaries, this tracks
/// individual admit timestamps and counts only those still inside the
/// window, so a burst straddling a boundary cannot double the effective
/// rate. The deque never grows past `limit` entries.
#[derive(Debug)]
pub struct RateLimiter {
    window: VecDeque<Instant>,
    limit: usize,
    window_len: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: u32, window_len: Duration) -> Self {
        Self {
            window: VecDeque::with_capacity(limit as usize),
            limit: limit as usize,
            window_len,
        }
    }

    /// Drop timestamps that have aged out of the window.
    fn expire_old_entries(&mut self, now: Instant) {
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) >= self.window_len {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit a frame observed at `now`, recording it, or deny without
    /// recording. Denied frames do not extend the window.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        self.expire_old_entries(now);
        if self.window.len() >= self.limit {
            return false;
        }
        self.window.push_back(now);
        true
    }
}
