//! Safety governor: startup grace, cooldown, command-rate breaker and
//! connection backoff for a single pair.
//!
//! Pure state machine. All time values are monotonic milliseconds passed in
//! by the caller; nothing here reads a clock.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::deadline::Deadline;

// ---- Constants ----

/// Sliding window for the command-rate breaker.
pub const RATE_WINDOW_MS: u64 = 5 * 60 * 1_000;

/// Thresholds the governor enforces. Replaced wholesale on reconfigure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorLimits {
    pub cooldown_ms: u64,
    /// Breaker opens when the 5-minute window holds more than this many commands.
    pub max_commands: u32,
    pub breaker_ms: u64,
}

/// Why enforcement may not proceed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum Gate {
    Open,
    StartupGrace { remaining_ms: u64 },
    Cooldown { remaining_ms: u64 },
    BreakerOpen { remaining_ms: u64 },
    /// `first_report` is true only the first time this backoff period blocks.
    Backoff { remaining_ms: u64, first_report: bool },
}

impl Gate {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Outcome of recording a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRecord {
    Counted { in_window: usize },
    BreakerOpened { in_window: usize },
}

#[derive(Debug, Clone)]
pub struct SafetyGovernor {
    limits: GovernorLimits,
    startup: Deadline,
    cooldown: Deadline,
    breaker_open: bool,
    breaker: Deadline,
    backoff: Backoff,
    backoff_until: Deadline,
    backoff_reported: bool,
    commands: VecDeque<u64>,
}

impl SafetyGovernor {
    pub fn new(limits: GovernorLimits) -> Self {
        Self {
            limits,
            startup: Deadline::new(),
            cooldown: Deadline::new(),
            breaker_open: false,
            breaker: Deadline::new(),
            backoff: Backoff::connection(),
            backoff_until: Deadline::new(),
            backoff_reported: false,
            commands: VecDeque::new(),
        }
    }

    pub fn set_limits(&mut self, limits: GovernorLimits) {
        self.limits = limits;
    }

    // ── Pre-decision gate ──

    pub fn start_startup_grace(&mut self, now_ms: u64, grace_ms: u64) {
        if grace_ms > 0 {
            self.startup.start(now_ms, grace_ms);
        }
    }

    pub fn end_startup_grace(&mut self) {
        self.startup.clear();
    }

    /// Gate checked before the decision engine runs: startup grace, then
    /// cooldown. An expired cooldown is cleared.
    pub fn pre_check(&mut self, now_ms: u64) -> Gate {
        if self.startup.is_active(now_ms) {
            return Gate::StartupGrace {
                remaining_ms: self.startup.remaining_ms(now_ms),
            };
        }
        if self.cooldown.is_active(now_ms) {
            return Gate::Cooldown {
                remaining_ms: self.cooldown.remaining_ms(now_ms),
            };
        }
        self.cooldown.clear();
        Gate::Open
    }

    // ── Dispatch gate ──

    /// Gate checked right before any device IO: breaker, then backoff.
    /// An expired backoff is cleared; the breaker only closes via
    /// [`tick`](Self::tick) or [`clear_breaker`](Self::clear_breaker).
    pub fn dispatch_check(&mut self, now_ms: u64) -> Gate {
        if self.breaker_open {
            return Gate::BreakerOpen {
                remaining_ms: self.breaker.remaining_ms(now_ms),
            };
        }
        if self.backoff_until.is_active(now_ms) {
            let first_report = !self.backoff_reported;
            self.backoff_reported = true;
            return Gate::Backoff {
                remaining_ms: self.backoff_until.remaining_ms(now_ms),
                first_report,
            };
        }
        self.backoff_until.clear();
        self.backoff_reported = false;
        Gate::Open
    }

    // ── Bookkeeping ──

    /// Count one dispatched command. Opens the breaker when the window
    /// holds more than `max_commands` entries.
    pub fn record_command(&mut self, now_ms: u64) -> CommandRecord {
        self.commands.push_back(now_ms);
        self.prune(now_ms);
        let in_window = self.commands.len();
        if in_window > self.limits.max_commands as usize && !self.breaker_open {
            self.breaker_open = true;
            self.breaker.start(now_ms, self.limits.breaker_ms);
            return CommandRecord::BreakerOpened { in_window };
        }
        CommandRecord::Counted { in_window }
    }

    /// Command or verification failure: arm the next backoff period.
    /// Returns the backoff delay applied.
    pub fn record_failure(&mut self, now_ms: u64) -> u64 {
        let delay = self.backoff.next_delay();
        self.backoff_until.start(now_ms, delay);
        self.backoff_reported = false;
        delay
    }

    /// Successful enforcement: reset backoff, and start the cooldown unless
    /// the request was manual.
    pub fn record_success(&mut self, now_ms: u64, start_cooldown: bool) {
        self.backoff.reset();
        self.backoff_until.clear();
        self.backoff_reported = false;
        if start_cooldown && self.limits.cooldown_ms > 0 {
            self.cooldown.start(now_ms, self.limits.cooldown_ms);
        }
    }

    /// Periodic maintenance. Returns `true` if the breaker auto-closed.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        self.prune(now_ms);
        if self.breaker_open && self.breaker.has_expired(now_ms) {
            self.breaker_open = false;
            self.breaker.clear();
            return true;
        }
        false
    }

    /// Manual breaker clear. Returns whether it was open.
    pub fn clear_breaker(&mut self) -> bool {
        let was_open = self.breaker_open;
        self.breaker_open = false;
        self.breaker.clear();
        was_open
    }

    pub fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(RATE_WINDOW_MS);
        while self.commands.front().is_some_and(|&ts| ts < cutoff) {
            self.commands.pop_front();
        }
    }

    // ── Status ──

    pub fn breaker_open(&self) -> bool {
        self.breaker_open
    }

    pub fn commands_in_window(&self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(RATE_WINDOW_MS);
        self.commands.iter().filter(|&&ts| ts >= cutoff).count()
    }

    pub fn cooldown(&self) -> &Deadline {
        &self.cooldown
    }

    pub fn breaker(&self) -> &Deadline {
        &self.breaker
    }

    pub fn backoff_deadline(&self) -> &Deadline {
        &self.backoff_until
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.failures()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: u32) -> GovernorLimits {
        GovernorLimits {
            cooldown_ms: 30_000,
            max_commands: max,
            breaker_ms: 15 * 60_000,
        }
    }

    // ── breaker ──

    #[test]
    fn exactly_threshold_does_not_open() {
        let mut g = SafetyGovernor::new(limits(3));
        for i in 0..3 {
            assert!(matches!(g.record_command(i * 1_000), CommandRecord::Counted { .. }));
        }
        assert!(!g.breaker_open());
    }

    #[test]
    fn threshold_plus_one_opens() {
        let mut g = SafetyGovernor::new(limits(3));
        for i in 0..3 {
            g.record_command(i * 1_000);
        }
        assert_eq!(
            g.record_command(3_000),
            CommandRecord::BreakerOpened { in_window: 4 }
        );
        assert!(matches!(g.dispatch_check(3_000), Gate::BreakerOpen { .. }));
    }

    #[test]
    fn old_commands_fall_out_of_window() {
        let mut g = SafetyGovernor::new(limits(3));
        for i in 0..3 {
            g.record_command(i * 1_000);
        }
        // First three are older than 5 minutes by now.
        let later = 2_000 + RATE_WINDOW_MS + 1;
        assert_eq!(g.record_command(later), CommandRecord::Counted { in_window: 1 });
        assert!(!g.breaker_open());
    }

    #[test]
    fn breaker_closes_only_via_tick_or_clear() {
        let mut g = SafetyGovernor::new(limits(0));
        g.record_command(0);
        assert!(g.breaker_open());
        let after = 15 * 60_000;
        // Still reported open until the tick runs.
        assert!(matches!(g.dispatch_check(after), Gate::BreakerOpen { remaining_ms: 0 }));
        assert!(!g.tick(after - 1));
        assert!(g.tick(after));
        assert!(g.dispatch_check(after).is_open());

        g.record_command(after);
        assert!(g.breaker_open());
        assert!(g.clear_breaker());
        assert!(!g.breaker_open());
    }

    // ── cooldown / startup ──

    #[test]
    fn cooldown_only_after_non_manual_success() {
        let mut g = SafetyGovernor::new(limits(10));
        g.record_success(0, false);
        assert!(g.pre_check(1).is_open());
        g.record_success(0, true);
        assert_eq!(g.pre_check(10_000), Gate::Cooldown { remaining_ms: 20_000 });
        assert!(g.pre_check(30_000).is_open());
    }

    #[test]
    fn startup_grace_blocks_first() {
        let mut g = SafetyGovernor::new(limits(10));
        g.start_startup_grace(0, 10_000);
        assert_eq!(g.pre_check(4_000), Gate::StartupGrace { remaining_ms: 6_000 });
        g.end_startup_grace();
        assert!(g.pre_check(4_000).is_open());
    }

    // ── backoff ──

    #[test]
    fn backoff_grows_and_reports_once() {
        let mut g = SafetyGovernor::new(limits(10));
        assert_eq!(g.record_failure(0), 5_000);
        assert_eq!(
            g.dispatch_check(1_000),
            Gate::Backoff { remaining_ms: 4_000, first_report: true }
        );
        assert_eq!(
            g.dispatch_check(2_000),
            Gate::Backoff { remaining_ms: 3_000, first_report: false }
        );
        assert!(g.dispatch_check(5_000).is_open());
        assert_eq!(g.record_failure(5_000), 10_000);
        assert_eq!(g.consecutive_failures(), 2);
        g.record_success(6_000, true);
        assert!(g.dispatch_check(6_000).is_open());
        assert_eq!(g.record_failure(7_000), 5_000);
    }
}
