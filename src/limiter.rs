//! Per-connection sliding-window rate limiter.
//!
//! Each socket may send `max_messages` within `window`. The first overflow
//! in a window produces an error reply and drops the message; a second
//! overflow in the same window closes the socket.

use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(60_000);
pub const DEFAULT_MAX_MESSAGES: u32 = 100;

/// Verdict for one incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateVerdict {
    /// Within budget, process normally.
    Allowed,
    /// Over budget for the first time this window — warn and drop.
    Warned,
    /// Over budget again in the same window — close the socket.
    Exceeded,
}

/// Sliding-window counter owned by a single connection task; no locking.
pub struct RateLimiter {
    window: Duration,
    max_messages: u32,
    window_start: Instant,
    count: u32,
    warned: bool,
}

impl RateLimiter {
    pub fn new(window: Duration, max_messages: u32) -> Self {
        Self {
            window,
            max_messages,
            window_start: Instant::now(),
            count: 0,
            warned: false,
        }
    }

    /// Record one message at `now` and classify it.
    pub fn check_at(&mut self, now: Instant) -> RateVerdict {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
            self.warned = false;
        }

        self.count += 1;
        if self.count <= self.max_messages {
            return RateVerdict::Allowed;
        }

        if self.warned {
            RateVerdict::Exceeded
        } else {
            self.warned = true;
            RateVerdict::Warned
        }
    }

    pub fn check(&mut self) -> RateVerdict {
        self.check_at(Instant::now())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_MESSAGES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let mut limiter = RateLimiter::new(Duration::from_secs(60), 5);
        let now = Instant::now();
        for _ in 0..5 {
            assert_eq!(limiter.check_at(now), RateVerdict::Allowed);
        }
    }

    #[test]
    fn test_first_overflow_warns_second_closes() {
        let mut limiter = RateLimiter::new(Duration::from_secs(60), 3);
        let now = Instant::now();
        for _ in 0..3 {
            limiter.check_at(now);
        }
        assert_eq!(limiter.check_at(now), RateVerdict::Warned);
        assert_eq!(limiter.check_at(now), RateVerdict::Exceeded);
        assert_eq!(limiter.check_at(now), RateVerdict::Exceeded);
    }

    #[test]
    fn test_window_rollover_resets() {
        let mut limiter = RateLimiter::new(Duration::from_millis(100), 2);
        let start = Instant::now();
        limiter.check_at(start);
        limiter.check_at(start);
        assert_eq!(limiter.check_at(start), RateVerdict::Warned);

        let later = start + Duration::from_millis(150);
        assert_eq!(limiter.check_at(later), RateVerdict::Allowed);
        assert_eq!(limiter.check_at(later), RateVerdict::Allowed);
        assert_eq!(limiter.check_at(later), RateVerdict::Warned);
    }
}
