//! Drift detection bookkeeping and override activation.
//!
//! Drift is a mismatch between the desired mode and the display state seen
//! by a periodic resync. Three drifts inside a trailing 5-minute streak are
//! read as a human fighting the automation and open a temporary override.

use std::collections::VecDeque;

use crate::deadline::Deadline;
use crate::types::{DesiredMode, DisplayState};

// ---- Constants ----

/// A drift within this long of the previous one extends the streak.
pub const DRIFT_STREAK_WINDOW_MS: u64 = 5 * 60 * 1_000;
/// Streak length that activates the override.
pub const OVERRIDE_THRESHOLD: u32 = 3;
/// Window over which corrections are counted against the hourly cap.
pub const CORRECTION_WINDOW_MS: u64 = 60 * 60 * 1_000;

/// Whether `actual` is drift for `desired`.
///
/// `Art` requires a definite `On`; `Off` requires a definite `Off`.
/// `Source` only drifts on a definite `On`, since an unreadable display
/// showing the source is indistinguishable from a powered-down panel.
pub fn is_drift(desired: DesiredMode, actual: DisplayState) -> bool {
    match desired {
        DesiredMode::Art => actual != DisplayState::On,
        DesiredMode::Source => actual == DisplayState::On,
        DesiredMode::Off => actual != DisplayState::Off,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftOutcome {
    pub consecutive: u32,
    /// The override was activated by this drift.
    pub override_activated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftLimits {
    pub max_corrections_per_hour: u32,
    pub correction_cooldown_ms: u64,
    pub override_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DriftTracker {
    limits: DriftLimits,
    consecutive: u32,
    last_drift_ms: Option<u64>,
    override_until: Deadline,
    corrections: VecDeque<u64>,
    last_correction_ms: Option<u64>,
    total_drifts: u64,
}

impl DriftTracker {
    pub fn new(limits: DriftLimits) -> Self {
        Self {
            limits,
            consecutive: 0,
            last_drift_ms: None,
            override_until: Deadline::new(),
            corrections: VecDeque::new(),
            last_correction_ms: None,
            total_drifts: 0,
        }
    }

    pub fn set_limits(&mut self, limits: DriftLimits) {
        self.limits = limits;
    }

    /// Record a detected drift. Activates the override when the streak
    /// reaches the threshold and no override is currently active.
    pub fn record_drift(&mut self, now_ms: u64) -> DriftOutcome {
        self.total_drifts = self.total_drifts.saturating_add(1);
        self.consecutive = match self.last_drift_ms {
            Some(last) if now_ms.saturating_sub(last) < DRIFT_STREAK_WINDOW_MS => {
                self.consecutive.saturating_add(1)
            }
            _ => 1,
        };
        self.last_drift_ms = Some(now_ms);

        let override_activated =
            self.consecutive >= OVERRIDE_THRESHOLD && !self.override_until.is_active(now_ms);
        if override_activated {
            self.override_until.start(now_ms, self.limits.override_ms);
        }
        DriftOutcome {
            consecutive: self.consecutive,
            override_activated,
        }
    }

    /// Whether a drift correction may be dispatched now: the per-correction
    /// cooldown has passed and the hourly cap is not reached.
    pub fn correction_allowed(&mut self, now_ms: u64) -> bool {
        self.prune(now_ms);
        let cooling = self
            .last_correction_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < self.limits.correction_cooldown_ms);
        if cooling {
            return false;
        }
        self.corrections.len() < self.limits.max_corrections_per_hour as usize
    }

    pub fn record_correction(&mut self, now_ms: u64) {
        self.corrections.push_back(now_ms);
        self.last_correction_ms = Some(now_ms);
    }

    pub fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(CORRECTION_WINDOW_MS);
        while self.corrections.front().is_some_and(|&ts| ts < cutoff) {
            self.corrections.pop_front();
        }
    }

    // ── Override ──

    pub fn override_active(&self, now_ms: u64) -> bool {
        self.override_until.is_active(now_ms)
    }

    pub fn override_deadline(&self) -> &Deadline {
        &self.override_until
    }

    /// Clear the override and the streak that produced it.
    pub fn clear_override(&mut self) -> bool {
        let was_set = self.override_until.is_set();
        self.override_until.clear();
        self.consecutive = 0;
        self.last_drift_ms = None;
        was_set
    }

    /// Drop an expired override so status stops reporting it.
    pub fn expire_override(&mut self, now_ms: u64) -> bool {
        if self.override_until.has_expired(now_ms) {
            self.override_until.clear();
            return true;
        }
        false
    }

    // ── Status ──

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn corrections_in_window(&self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(CORRECTION_WINDOW_MS);
        self.corrections.iter().filter(|&&ts| ts >= cutoff).count()
    }

    pub fn total_drifts(&self) -> u64 {
        self.total_drifts
    }
}
