//! Activity monitor: owns the source-device link for one pair.
//!
//! A single task drives the pure [`ActivityTracker`] from connection
//! events, push reports and its own deadlines, and supervises reconnection
//! with exponential backoff. Committed changes go out on a bounded channel;
//! the monitor never touches controller state directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use artsync_core::activity::{
    ActiveMode, ActivitySignal, ActivityTiming, ActivityTracker, ConnectionState, SourceReport,
};
use artsync_core::backoff::{Backoff, LogThrottle};
use artsync_device::{DeviceError, SourceDevice};

use crate::clock::Clock;

/// Capacity of the monitor → controller event channel.
pub const ACTIVITY_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEvent {
    /// The committed `(active, playback)` pair changed.
    Signal(ActivitySignal),
    /// The link state changed.
    Connection {
        state: ConnectionState,
        signal: ActivitySignal,
    },
}

#[derive(Debug)]
enum MonitorCommand {
    SetPolicy { mode: ActiveMode, timing: ActivityTiming },
    Repair,
}

/// Control handle held by the controller.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
    /// Swap the active-mode policy and debounce/grace timings.
    pub async fn set_policy(&self, mode: ActiveMode, timing: ActivityTiming) -> bool {
        self.commands
            .send(MonitorCommand::SetPolicy { mode, timing })
            .await
            .is_ok()
    }

    /// Leave the not-paired state and reconnect now.
    pub async fn repair(&self) -> bool {
        self.commands.send(MonitorCommand::Repair).await.is_ok()
    }
}

pub struct ActivityMonitor {
    pair: String,
    source: Arc<dyn SourceDevice>,
    clock: Arc<dyn Clock>,
    tracker: ActivityTracker,
    backoff: Backoff,
    throttle: LogThrottle,
    session: Option<mpsc::Receiver<SourceReport>>,
    retry_at_ms: Option<u64>,
    reported: ConnectionState,
    events: mpsc::Sender<ActivityEvent>,
    commands: mpsc::Receiver<MonitorCommand>,
    commands_closed: bool,
    cancel: CancellationToken,
}

impl ActivityMonitor {
    pub fn new(
        pair: impl Into<String>,
        source: Arc<dyn SourceDevice>,
        clock: Arc<dyn Clock>,
        mode: ActiveMode,
        timing: ActivityTiming,
        events: mpsc::Sender<ActivityEvent>,
        cancel: CancellationToken,
    ) -> (Self, MonitorHandle) {
        let (tx, rx) = mpsc::channel(8);
        let monitor = Self {
            pair: pair.into(),
            source,
            clock,
            tracker: ActivityTracker::new(mode, timing),
            backoff: Backoff::reconnect(),
            throttle: LogThrottle::new(),
            session: None,
            retry_at_ms: None,
            reported: ConnectionState::Disconnected,
            events,
            commands: rx,
            commands_closed: false,
            cancel,
        };
        (monitor, MonitorHandle { commands: tx })
    }

    /// Run until cancelled or the controller drops its event receiver.
    pub async fn run(mut self) {
        info!(pair = %self.pair, "activity monitor started");
        self.retry_at_ms = Some(self.clock.now_ms());

        loop {
            let now = self.clock.now_ms();
            let wake_at = match (self.tracker.next_deadline(), self.retry_at_ms) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.commands.recv(), if !self.commands_closed => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => self.commands_closed = true,
                },
                report = next_report(&mut self.session) => match report {
                    Some(report) => self.tracker.on_report(self.clock.now_ms(), report),
                    None => self.link_lost(),
                },
                _ = sleep_until_ms(now, wake_at) => {}
            }

            let now = self.clock.now_ms();
            if self.retry_at_ms.is_some_and(|at| now >= at) && !self.connect().await {
                break;
            }
            if !self.flush().await {
                break;
            }
        }

        self.session = None;
        self.source.disconnect().await;
        info!(pair = %self.pair, "activity monitor stopped");
    }

    fn handle_command(&mut self, cmd: MonitorCommand) {
        let now = self.clock.now_ms();
        match cmd {
            MonitorCommand::SetPolicy { mode, timing } => {
                debug!(pair = %self.pair, ?mode, "activity policy updated");
                self.tracker.set_policy(now, mode, timing);
            }
            MonitorCommand::Repair => {
                info!(pair = %self.pair, "source re-pair requested");
                self.tracker.reset_pairing();
                self.backoff.reset();
                self.throttle.reset();
                if self.tracker.connection() != ConnectionState::Connected {
                    self.retry_at_ms = Some(now);
                }
            }
        }
    }

    /// One connect attempt. Returns `false` if cancelled meanwhile.
    async fn connect(&mut self) -> bool {
        self.retry_at_ms = None;
        if self.tracker.connection() == ConnectionState::NotPaired {
            return true;
        }
        self.tracker.on_connecting();
        if !self.flush().await {
            return false;
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            result = self.source.connect() => result,
        };
        let now = self.clock.now_ms();

        match result {
            Ok(session) => {
                info!(
                    pair = %self.pair,
                    attempts = self.throttle.attempts() + 1,
                    playback = session.initial.playback.as_str(),
                    "source connected"
                );
                self.backoff.reset();
                self.throttle.reset();
                self.tracker.on_connected(now, session.initial);
                self.session = Some(session.updates);
            }
            Err(DeviceError::AuthRequired(detail)) => {
                warn!(
                    pair = %self.pair,
                    "source rejected pairing; reconnection suspended until re-pair: {detail}"
                );
                self.tracker.on_not_paired(now);
            }
            Err(e) => {
                self.tracker.on_connect_failed();
                let delay_ms = self.backoff.next_delay();
                self.retry_at_ms = Some(now.saturating_add(delay_ms));
                if self.throttle.attempt(now) {
                    warn!(
                        pair = %self.pair,
                        attempt = self.throttle.attempts(),
                        delay_ms,
                        "source connect failed: {e}"
                    );
                } else {
                    debug!(pair = %self.pair, attempt = self.throttle.attempts(), delay_ms, "source connect failed: {e}");
                }
            }
        }
        true
    }

    fn link_lost(&mut self) {
        let now = self.clock.now_ms();
        self.session = None;
        self.tracker.on_disconnected(now);
        let delay_ms = self.backoff.next_delay();
        self.retry_at_ms = Some(now.saturating_add(delay_ms));
        info!(
            pair = %self.pair,
            grace_until_ms = ?self.tracker.signal().grace_until_ms,
            retry_in_ms = delay_ms,
            "source link lost"
        );
    }

    /// Commit due values and publish changes. Returns `false` once the
    /// receiver is gone.
    async fn flush(&mut self) -> bool {
        let now = self.clock.now_ms();
        let connection = self.tracker.connection();
        if connection != self.reported {
            self.reported = connection;
            let event = ActivityEvent::Connection {
                state: connection,
                signal: self.tracker.signal(),
            };
            if self.events.send(event).await.is_err() {
                return false;
            }
        }
        if let Some(signal) = self.tracker.poll(now) {
            debug!(pair = %self.pair, active = signal.active, playback = signal.playback.as_str(), "activity committed");
            if self.events.send(ActivityEvent::Signal(signal)).await.is_err() {
                return false;
            }
        }
        true
    }
}

async fn next_report(session: &mut Option<mpsc::Receiver<SourceReport>>) -> Option<SourceReport> {
    match session {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_ms(now_ms: u64, at_ms: Option<u64>) {
    match at_ms {
        Some(at) => tokio::time::sleep(Duration::from_millis(at.saturating_sub(now_ms))).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use artsync_core::types::{PlaybackState, PowerState};
    use artsync_device::fake::FakeSource;
    use tokio::time::Instant;

    const TIMING: ActivityTiming = ActivityTiming {
        debounce_ms: 2_000,
        grace_ms: 30_000,
    };

    struct Harness {
        source: Arc<FakeSource>,
        events: mpsc::Receiver<ActivityEvent>,
        handle: MonitorHandle,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(source: Arc<FakeSource>) -> Harness {
        let (tx, rx) = mpsc::channel(ACTIVITY_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let (monitor, handle) = ActivityMonitor::new(
            "living-room",
            source.clone(),
            Arc::new(SystemClock::new()),
            ActiveMode::PlayingOrPaused,
            TIMING,
            tx,
            cancel.clone(),
        );
        let task = tokio::spawn(monitor.run());
        Harness { source, events: rx, handle, cancel, task }
    }

    async fn next_signal(rx: &mut mpsc::Receiver<ActivityEvent>) -> ActivitySignal {
        loop {
            match rx.recv().await.expect("monitor alive") {
                ActivityEvent::Signal(s) => return s,
                ActivityEvent::Connection { .. } => {}
            }
        }
    }

    async fn next_connection(rx: &mut mpsc::Receiver<ActivityEvent>) -> ConnectionState {
        loop {
            if let ActivityEvent::Connection { state, .. } = rx.recv().await.expect("monitor alive") {
                return state;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn commits_initial_reading_after_debounce() {
        let source = FakeSource::new();
        source.set_initial(PlaybackState::Playing, PowerState::On);
        let mut h = start(source);
        let t0 = Instant::now();
        let sig = next_signal(&mut h.events).await;
        assert!(sig.active);
        assert_eq!(t0.elapsed(), Duration::from_secs(2));
        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.source.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backs_off_then_resets() {
        let source = FakeSource::new();
        source.fail_connects([
            DeviceError::Transport("refused".into()),
            DeviceError::Timeout(Duration::from_secs(35)),
        ]);
        let h = start(source);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(h.source.connects(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.source.connects(), 2);
        // second delay is 30s
        tokio::time::sleep(Duration::from_secs(28)).await;
        assert_eq!(h.source.connects(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.source.connects(), 3);
        assert!(h.source.is_linked());
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_suspends_until_repair() {
        let source = FakeSource::new();
        source.fail_connects([DeviceError::AuthRequired("pairing rejected".into())]);
        let mut h = start(source);
        assert_eq!(next_connection(&mut h.events).await, ConnectionState::Connecting);
        assert_eq!(next_connection(&mut h.events).await, ConnectionState::NotPaired);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.source.connects(), 1);

        assert!(h.handle.repair().await);
        assert_eq!(next_connection(&mut h.events).await, ConnectionState::Connecting);
        assert_eq!(next_connection(&mut h.events).await, ConnectionState::Connected);
        assert_eq!(h.source.connects(), 2);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn grace_holds_active_after_link_loss() {
        let source = FakeSource::new();
        source.set_initial(PlaybackState::Playing, PowerState::On);
        let mut h = start(source);
        assert!(next_signal(&mut h.events).await.active);

        h.source.fail_connects((0..5).map(|_| DeviceError::Transport("refused".into())));
        h.source.drop_link();
        let lost = Instant::now();
        let sig = next_signal(&mut h.events).await;
        assert!(!sig.active);
        assert_eq!(lost.elapsed(), Duration::from_secs(30));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn push_updates_are_debounced() {
        let source = FakeSource::new();
        source.set_initial(PlaybackState::Idle, PowerState::On);
        let mut h = start(source);
        assert_eq!(next_connection(&mut h.events).await, ConnectionState::Connecting);
        assert_eq!(next_connection(&mut h.events).await, ConnectionState::Connected);
        assert_eq!(next_signal(&mut h.events).await.playback, PlaybackState::Idle);

        for p in [PlaybackState::Playing, PlaybackState::Idle, PlaybackState::Paused] {
            assert!(h.source.push(p, PowerState::On));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let sig = next_signal(&mut h.events).await;
        assert_eq!(sig.playback, PlaybackState::Paused);
        assert!(sig.active);
        h.cancel.cancel();
    }
}
