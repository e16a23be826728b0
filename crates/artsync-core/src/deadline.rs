//! Single monotonic deadline type used for every controller timer.
//!
//! Control decisions compare monotonic milliseconds only. A wall-clock
//! rendering is derived at presentation time from the remaining duration.

use chrono::{DateTime, Duration, Utc};

/// A deadline on the monotonic clock. Inactive until started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    until_ms: Option<u64>,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the deadline `duration_ms` after `now_ms`, replacing any previous one.
    pub fn start(&mut self, now_ms: u64, duration_ms: u64) {
        self.until_ms = Some(now_ms.saturating_add(duration_ms));
    }

    /// Arm at an absolute monotonic instant.
    pub fn set_at(&mut self, until_ms: u64) {
        self.until_ms = Some(until_ms);
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        matches!(self.until_ms, Some(until) if now_ms < until)
    }

    /// Armed and reached.
    pub fn has_expired(&self, now_ms: u64) -> bool {
        matches!(self.until_ms, Some(until) if now_ms >= until)
    }

    pub fn is_set(&self) -> bool {
        self.until_ms.is_some()
    }

    pub fn until_ms(&self) -> Option<u64> {
        self.until_ms
    }

    pub fn clear(&mut self) {
        self.until_ms = None;
    }

    /// Remaining time at `now_ms` (0 if not active).
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        match self.until_ms {
            Some(until) if now_ms < until => until - now_ms,
            _ => 0,
        }
    }

    /// Wall-clock rendering for status output. `None` when inactive.
    pub fn wall_clock(&self, now_ms: u64, wall_now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_active(now_ms) {
            return None;
        }
        let remaining = i64::try_from(self.remaining_ms(now_ms)).ok()?;
        Some(wall_now + Duration::milliseconds(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_active_initially() {
        let d = Deadline::new();
        assert!(!d.is_active(0));
        assert!(!d.has_expired(u64::MAX));
        assert_eq!(d.remaining_ms(0), 0);
    }

    #[test]
    fn expires_at_boundary() {
        let mut d = Deadline::new();
        d.start(1_000, 5_000);
        assert!(d.is_active(5_999));
        assert!(!d.is_active(6_000));
        assert!(d.has_expired(6_000));
        assert_eq!(d.remaining_ms(3_000), 3_000);
    }

    #[test]
    fn restart_replaces() {
        let mut d = Deadline::new();
        d.start(0, 10_000);
        d.start(5_000, 1_000);
        assert_eq!(d.until_ms(), Some(6_000));
        d.clear();
        assert!(!d.is_set());
    }

    #[test]
    fn wall_clock_is_derived_from_remaining() {
        let mut d = Deadline::new();
        d.start(0, 90_000);
        let wall = DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let at = d.wall_clock(30_000, wall).unwrap();
        assert_eq!(at.to_rfc3339(), "2026-01-01T12:01:00+00:00");
        assert!(d.wall_clock(90_000, wall).is_none());
    }
}
