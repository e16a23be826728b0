//! Source-device activity: policy mapping, debounce and disconnect grace.
//!
//! [`ActivityTracker`] is the pure half of the activity monitor. The async
//! task feeds it connection events and raw reports, sleeps until
//! [`ActivityTracker::next_deadline`], then calls [`ActivityTracker::poll`]
//! to commit whatever became due.

use serde::{Deserialize, Serialize};

use crate::deadline::Deadline;
use crate::types::{PlaybackState, PowerState};

// ─── Policy ──────────────────────────────────────────────────────

/// How raw playback/power state maps to "active".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveMode {
    PlayingOnly,
    #[default]
    PlayingOrPaused,
    PowerOn,
}

impl ActiveMode {
    pub fn is_active(self, playback: PlaybackState, power: PowerState) -> bool {
        match self {
            Self::PlayingOnly => playback.is_playing_like(),
            Self::PlayingOrPaused => playback.is_playing_like() || playback == PlaybackState::Paused,
            Self::PowerOn => power == PowerState::On,
        }
    }
}

/// Connection state of the source-device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Authentication or pairing rejected; reconnection is suspended until
    /// an external re-pair.
    NotPaired,
}

/// One raw reading from the source device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceReport {
    pub playback: PlaybackState,
    pub power: PowerState,
}

/// Committed activity as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActivitySignal {
    pub active: bool,
    pub playback: PlaybackState,
    pub power: PowerState,
    /// Monotonic ms of the last commit.
    pub last_update_ms: Option<u64>,
    /// Monotonic ms until which `active` is held after a disconnect.
    pub grace_until_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    active: bool,
    playback: PlaybackState,
    power: PowerState,
    due_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityTiming {
    pub debounce_ms: u64,
    pub grace_ms: u64,
}

// ─── Tracker ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ActivityTracker {
    mode: ActiveMode,
    timing: ActivityTiming,
    connection: ConnectionState,
    raw: SourceReport,
    committed: ActivitySignal,
    pending: Option<Pending>,
    grace: Deadline,
}

impl ActivityTracker {
    pub fn new(mode: ActiveMode, timing: ActivityTiming) -> Self {
        Self {
            mode,
            timing,
            connection: ConnectionState::Disconnected,
            raw: SourceReport::default(),
            committed: ActivitySignal::default(),
            pending: None,
            grace: Deadline::new(),
        }
    }

    pub fn signal(&self) -> ActivitySignal {
        self.committed
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn on_connecting(&mut self) {
        if self.connection != ConnectionState::NotPaired {
            self.connection = ConnectionState::Connecting;
        }
    }

    /// A connect attempt failed. Unlike a lost link this leaves any running
    /// grace period and committed value alone.
    pub fn on_connect_failed(&mut self) {
        if self.connection == ConnectionState::Connecting {
            self.connection = ConnectionState::Disconnected;
        }
    }

    /// Link established with an initial reading. Ends any grace period.
    pub fn on_connected(&mut self, now_ms: u64, initial: SourceReport) {
        self.connection = ConnectionState::Connected;
        self.grace.clear();
        self.committed.grace_until_ms = None;
        self.on_report(now_ms, initial);
    }

    /// Raw push update. Ignored unless connected.
    pub fn on_report(&mut self, now_ms: u64, report: SourceReport) {
        if self.connection != ConnectionState::Connected {
            return;
        }
        self.raw = report;
        let active = self.mode.is_active(report.playback, report.power);
        self.schedule(now_ms, active, report.playback, report.power);
    }

    /// Link lost. Holds an active signal for the grace period, otherwise
    /// debounces towards inactive.
    pub fn on_disconnected(&mut self, now_ms: u64) {
        if self.connection == ConnectionState::NotPaired {
            return;
        }
        self.connection = ConnectionState::Disconnected;
        self.pending = None;
        self.raw = SourceReport::default();
        if self.committed.active && self.timing.grace_ms > 0 {
            self.grace.start(now_ms, self.timing.grace_ms);
            self.committed.grace_until_ms = self.grace.until_ms();
        } else {
            self.schedule_unconditional(now_ms, false, PlaybackState::Unknown, PowerState::Unknown);
        }
    }

    /// Pairing rejected. Terminal until [`reset_pairing`](Self::reset_pairing).
    pub fn on_not_paired(&mut self, now_ms: u64) {
        self.connection = ConnectionState::NotPaired;
        self.grace.clear();
        self.committed.grace_until_ms = None;
        self.raw = SourceReport::default();
        self.schedule_unconditional(now_ms, false, PlaybackState::Unknown, PowerState::Unknown);
    }

    pub fn reset_pairing(&mut self) {
        if self.connection == ConnectionState::NotPaired {
            self.connection = ConnectionState::Disconnected;
        }
    }

    /// Swap policy and timings. Re-derives the active value from the raw
    /// state when connected.
    pub fn set_policy(&mut self, now_ms: u64, mode: ActiveMode, timing: ActivityTiming) {
        let changed = mode != self.mode;
        self.mode = mode;
        self.timing = timing;
        if changed && self.connection == ConnectionState::Connected {
            let raw = self.raw;
            let active = mode.is_active(raw.playback, raw.power);
            self.schedule(now_ms, active, raw.playback, raw.power);
        }
    }

    /// Earliest monotonic instant at which [`poll`](Self::poll) has work.
    pub fn next_deadline(&self) -> Option<u64> {
        let pending = self.pending.map(|p| p.due_ms);
        match (pending, self.grace.until_ms()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn in_grace(&self, now_ms: u64) -> bool {
        self.grace.is_active(now_ms)
    }

    /// Commit whatever is due at `now_ms`. Returns the new signal when the
    /// committed `(active, playback)` pair changed.
    pub fn poll(&mut self, now_ms: u64) -> Option<ActivitySignal> {
        let before = (self.committed.active, self.committed.playback);

        if self.grace.has_expired(now_ms) {
            self.grace.clear();
            self.committed.grace_until_ms = None;
            if self.connection != ConnectionState::Connected {
                self.commit(now_ms, false, PlaybackState::Unknown, PowerState::Unknown);
            }
        }

        if let Some(p) = self.pending.filter(|p| now_ms >= p.due_ms) {
            self.pending = None;
            self.commit(now_ms, p.active, p.playback, p.power);
        }

        let after = (self.committed.active, self.committed.playback);
        (before != after).then_some(self.committed)
    }

    // ── internals ──

    /// Start or replace the debounce timer for a raw value. A value equal
    /// to the in-flight one keeps its timer; a value equal to the committed
    /// one cancels the timer.
    fn schedule(&mut self, now_ms: u64, active: bool, playback: PlaybackState, power: PowerState) {
        if self.grace.is_active(now_ms) {
            return;
        }
        self.committed.power = power;
        match self.pending {
            Some(p) if p.active == active && p.playback == playback => {
                self.pending = Some(Pending { power, ..p });
            }
            _ if self.committed.active == active && self.committed.playback == playback => {
                self.pending = None;
            }
            _ => self.schedule_unconditional(now_ms, active, playback, power),
        }
    }

    fn schedule_unconditional(
        &mut self,
        now_ms: u64,
        active: bool,
        playback: PlaybackState,
        power: PowerState,
    ) {
        self.pending = Some(Pending {
            active,
            playback,
            power,
            due_ms: now_ms.saturating_add(self.timing.debounce_ms),
        });
    }

    fn commit(&mut self, now_ms: u64, active: bool, playback: PlaybackState, power: PowerState) {
        self.committed.active = active;
        self.committed.playback = playback;
        self.committed.power = power;
        self.committed.last_update_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: u64 = 2_000;
    const GRACE: u64 = 30_000;

    fn tracker() -> ActivityTracker {
        ActivityTracker::new(
            ActiveMode::PlayingOrPaused,
            ActivityTiming { debounce_ms: DEBOUNCE, grace_ms: GRACE },
        )
    }

    fn report(playback: PlaybackState) -> SourceReport {
        SourceReport { playback, power: PowerState::On }
    }

    fn connected_active() -> ActivityTracker {
        let mut t = tracker();
        t.on_connected(0, report(PlaybackState::Playing));
        t.poll(DEBOUNCE).expect("commit");
        assert!(t.signal().active);
        t
    }

    // ── policy ──

    #[test]
    fn policy_mapping() {
        use PlaybackState::*;
        assert!(ActiveMode::PlayingOnly.is_active(Loading, PowerState::Off));
        assert!(!ActiveMode::PlayingOnly.is_active(Paused, PowerState::On));
        assert!(ActiveMode::PlayingOrPaused.is_active(Paused, PowerState::Unknown));
        assert!(ActiveMode::PlayingOrPaused.is_active(Seeking, PowerState::Unknown));
        assert!(!ActiveMode::PlayingOrPaused.is_active(Idle, PowerState::On));
        assert!(ActiveMode::PowerOn.is_active(Idle, PowerState::On));
        assert!(!ActiveMode::PowerOn.is_active(Playing, PowerState::Off));
    }

    // ── debounce ──

    #[test]
    fn commit_waits_for_debounce() {
        let mut t = tracker();
        t.on_connected(0, report(PlaybackState::Playing));
        assert_eq!(t.next_deadline(), Some(DEBOUNCE));
        assert!(t.poll(DEBOUNCE - 1).is_none());
        let sig = t.poll(DEBOUNCE).unwrap();
        assert!(sig.active);
        assert_eq!(sig.playback, PlaybackState::Playing);
        assert_eq!(sig.last_update_ms, Some(DEBOUNCE));
    }

    #[test]
    fn rapid_toggles_collapse_to_last_value() {
        let mut t = tracker();
        t.on_connected(0, report(PlaybackState::Idle));
        t.poll(DEBOUNCE);

        let seq = [
            PlaybackState::Playing,
            PlaybackState::Idle,
            PlaybackState::Playing,
            PlaybackState::Paused,
            PlaybackState::Playing,
        ];
        let mut now = 10_000;
        let mut commits = 0;
        for p in seq {
            t.on_report(now, report(p));
            if t.poll(now + 500).is_some() {
                commits += 1;
            }
            now += 500;
        }
        while let Some(deadline) = t.next_deadline() {
            if t.poll(deadline).is_some() {
                commits += 1;
            }
        }
        assert_eq!(commits, 1);
        assert_eq!(t.signal().playback, PlaybackState::Playing);
        assert!(t.signal().active);
    }

    #[test]
    fn repeated_identical_reports_keep_timer() {
        let mut t = tracker();
        t.on_connected(0, report(PlaybackState::Playing));
        t.on_report(1_000, report(PlaybackState::Playing));
        t.on_report(1_500, report(PlaybackState::Playing));
        assert_eq!(t.next_deadline(), Some(DEBOUNCE));
    }

    #[test]
    fn toggle_back_to_committed_cancels() {
        let mut t = connected_active();
        t.on_report(3_000, report(PlaybackState::Idle));
        t.on_report(3_500, report(PlaybackState::Playing));
        assert_eq!(t.next_deadline(), None);
        assert!(t.poll(10_000).is_none());
    }

    // ── grace ──

    #[test]
    fn grace_holds_active_across_disconnect() {
        let mut t = connected_active();
        t.on_disconnected(5_000);
        assert_eq!(t.signal().grace_until_ms, Some(5_000 + GRACE));
        for now in [5_000, 10_000, 20_000, 5_000 + GRACE - 1] {
            assert!(t.poll(now).is_none());
            assert!(t.signal().active);
            // reports while disconnected are ignored
            t.on_report(now, report(PlaybackState::Idle));
        }
        let sig = t.poll(5_000 + GRACE).unwrap();
        assert!(!sig.active);
        assert_eq!(sig.grace_until_ms, None);
    }

    #[test]
    fn failed_reconnects_do_not_extend_grace() {
        let mut t = connected_active();
        t.on_disconnected(5_000);
        for now in [15_000, 25_000] {
            t.on_connecting();
            t.on_connect_failed();
            assert_eq!(t.connection(), ConnectionState::Disconnected);
            assert_eq!(t.signal().grace_until_ms, Some(5_000 + GRACE));
            assert!(t.poll(now).is_none());
        }
        assert!(!t.poll(5_000 + GRACE).unwrap().active);
    }

    #[test]
    fn reconnect_during_grace_keeps_value() {
        let mut t = connected_active();
        t.on_disconnected(5_000);
        t.on_connected(6_000, report(PlaybackState::Playing));
        assert!(!t.in_grace(6_000));
        assert!(t.poll(6_000 + DEBOUNCE).is_none());
        assert!(t.signal().active);
    }

    #[test]
    fn inactive_disconnect_debounces_without_grace() {
        let mut t = ActivityTracker::new(
            ActiveMode::PlayingOnly,
            ActivityTiming { debounce_ms: DEBOUNCE, grace_ms: GRACE },
        );
        t.on_connected(0, report(PlaybackState::Paused));
        t.poll(DEBOUNCE);
        assert!(!t.signal().active);
        t.on_disconnected(3_000);
        assert!(!t.in_grace(3_000));
        let sig = t.poll(3_000 + DEBOUNCE).unwrap();
        assert_eq!(sig.playback, PlaybackState::Unknown);
        assert!(!sig.active);
    }

    #[test]
    fn zero_grace_drops_after_debounce() {
        let mut t = ActivityTracker::new(
            ActiveMode::PlayingOrPaused,
            ActivityTiming { debounce_ms: DEBOUNCE, grace_ms: 0 },
        );
        t.on_connected(0, report(PlaybackState::Playing));
        t.poll(DEBOUNCE);
        t.on_disconnected(5_000);
        assert!(t.poll(5_000 + DEBOUNCE - 1).is_none());
        assert!(!t.poll(5_000 + DEBOUNCE).unwrap().active);
    }

    // ── pairing ──

    #[test]
    fn not_paired_is_terminal_until_reset() {
        let mut t = connected_active();
        t.on_not_paired(4_000);
        assert_eq!(t.connection(), ConnectionState::NotPaired);
        t.on_connecting();
        assert_eq!(t.connection(), ConnectionState::NotPaired);
        assert!(!t.poll(4_000 + DEBOUNCE).unwrap().active);
        t.reset_pairing();
        assert_eq!(t.connection(), ConnectionState::Disconnected);
    }

    #[test]
    fn policy_change_rederives() {
        let mut t = tracker();
        t.on_connected(0, report(PlaybackState::Paused));
        t.poll(DEBOUNCE);
        assert!(t.signal().active);
        t.set_policy(
            5_000,
            ActiveMode::PlayingOnly,
            ActivityTiming { debounce_ms: DEBOUNCE, grace_ms: GRACE },
        );
        assert!(!t.poll(5_000 + DEBOUNCE).unwrap().active);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn playback() -> impl Strategy<Value = PlaybackState> {
            prop_oneof![
                Just(PlaybackState::Playing),
                Just(PlaybackState::Paused),
                Just(PlaybackState::Idle),
                Just(PlaybackState::Unknown),
            ]
        }

        proptest! {
            #[test]
            fn active_held_for_whole_grace(
                events in proptest::collection::vec((1u64..GRACE, playback(), any::<bool>()), 0..20)
            ) {
                let mut t = connected_active();
                let start = 10_000;
                t.on_disconnected(start);
                let mut offsets: Vec<_> = events;
                offsets.sort_by_key(|e| e.0);
                for (offset, p, reconnect_attempt) in offsets {
                    let now = start + offset;
                    if reconnect_attempt {
                        t.on_connecting();
                    }
                    t.on_report(now, report(p));
                    t.poll(now);
                    prop_assert!(t.signal().active);
                }
            }
        }
    }
}
