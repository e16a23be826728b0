//! Exponential backoff and reconnect log throttling.
//!
//! Pure state machines; callers pass `now_ms` explicitly.

use serde::{Deserialize, Serialize};

// ---- Constants ----

/// Log the reconnect attempt on every Nth attempt.
const LOG_EVERY_NTH_ATTEMPT: u32 = 5;
/// Log the reconnect attempt when this much time passed since the last log line.
const LOG_INTERVAL_MS: u64 = 300_000;

// ─── Backoff ─────────────────────────────────────────────────────

/// Exponential delay: `initial`, `initial*factor`, ... capped at `max`.
/// [`reset`](Self::reset) returns to `initial` after a success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    initial_ms: u64,
    factor: f64,
    max_ms: u64,
    current_ms: u64,
    failures: u32,
}

impl Backoff {
    pub fn new(initial_ms: u64, factor: f64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            factor,
            max_ms,
            current_ms: initial_ms,
            failures: 0,
        }
    }

    /// Source-device reconnect supervisor: 10s, x3, capped at 60s.
    pub fn reconnect() -> Self {
        Self::new(10_000, 3.0, 60_000)
    }

    /// Display command failures: 5s, x2, capped at 5min.
    pub fn connection() -> Self {
        Self::new(5_000, 2.0, 300_000)
    }

    /// Delay to wait after the failure just recorded; grows the next one.
    pub fn next_delay(&mut self) -> u64 {
        let delay = self.current_ms.min(self.max_ms);
        let grown = (self.current_ms as f64 * self.factor).round() as u64;
        self.current_ms = grown.min(self.max_ms).max(self.initial_ms);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Delay that the next failure would produce, without consuming it.
    pub fn peek(&self) -> u64 {
        self.current_ms.min(self.max_ms)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// ─── Log Throttle ────────────────────────────────────────────────

/// Decides whether a repeated attempt should be logged: the first one,
/// every 5th, or when 5 minutes passed since the last logged one.
#[derive(Debug, Clone, Default)]
pub struct LogThrottle {
    attempts: u32,
    last_logged_ms: Option<u64>,
}

impl LogThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an attempt at `now_ms`. Returns `true` when it should be logged.
    pub fn attempt(&mut self, now_ms: u64) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        let due = match self.last_logged_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= LOG_INTERVAL_MS,
        };
        if self.attempts == 1 || self.attempts % LOG_EVERY_NTH_ATTEMPT == 0 || due {
            self.last_logged_ms = Some(now_ms);
            return true;
        }
        false
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_logged_ms = None;
    }
}

/// Rate limit for a recurring message: at most once per `interval_ms`.
#[derive(Debug, Clone)]
pub struct MessageThrottle {
    interval_ms: u64,
    last_ms: Option<u64>,
}

impl MessageThrottle {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_ms: None,
        }
    }

    pub fn allow(&mut self, now_ms: u64) -> bool {
        match self.last_ms {
            Some(last) if now_ms.saturating_sub(last) < self.interval_ms => false,
            _ => {
                self.last_ms = Some(now_ms);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Backoff ──

    #[test]
    fn reconnect_sequence_caps_at_max() {
        let mut b = Backoff::reconnect();
        assert_eq!(b.next_delay(), 10_000);
        assert_eq!(b.next_delay(), 30_000);
        assert_eq!(b.next_delay(), 60_000);
        assert_eq!(b.next_delay(), 60_000);
        assert_eq!(b.failures(), 4);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = Backoff::connection();
        b.next_delay();
        b.next_delay();
        assert_eq!(b.peek(), 20_000);
        b.reset();
        assert_eq!(b.peek(), 5_000);
        assert_eq!(b.failures(), 0);
    }

    #[test]
    fn connection_sequence() {
        let mut b = Backoff::connection();
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay()).collect();
        assert_eq!(
            delays,
            vec![5_000, 10_000, 20_000, 40_000, 80_000, 160_000, 300_000, 300_000]
        );
    }

    // ── LogThrottle ──

    #[test]
    fn logs_first_and_every_fifth() {
        let mut t = LogThrottle::new();
        let logged: Vec<bool> = (0..10).map(|i| t.attempt(i * 1_000)).collect();
        assert_eq!(
            logged,
            vec![true, false, false, false, true, false, false, false, false, true]
        );
    }

    #[test]
    fn logs_after_interval() {
        let mut t = LogThrottle::new();
        assert!(t.attempt(0));
        assert!(!t.attempt(1_000));
        assert!(t.attempt(1_000 + LOG_INTERVAL_MS));
    }

    #[test]
    fn message_throttle() {
        let mut m = MessageThrottle::new(300_000);
        assert!(m.allow(0));
        assert!(!m.allow(299_999));
        assert!(m.allow(300_000));
    }
}
