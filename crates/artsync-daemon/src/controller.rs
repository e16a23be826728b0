//! Pair controller: the reconciliation state machine for one display and
//! its source.
//!
//! All mutable pair state sits behind one async mutex. Every enforcement
//! path (activity, presence, window, delayed return, resync, manual,
//! reconfigure) takes that lock, so at most one command sequence runs per
//! pair. Status is published on a `watch` channel after every transition
//! and can be read without the lock.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use artsync_core::{
    ActionResult, ActivitySignal, CommandRecord, ConfigError, ConnectionState, DecisionInputs,
    Deadline, DesiredMode, DisplayState, DriftTracker, EventKind, EventLog, EventLogEntry, Gate,
    Health, MessageThrottle, PairConfig, Phase, Presence, SafetyGovernor, Trigger,
    classify_presence, decide, is_drift,
};
use artsync_device::{DisplayDevice, PresenceSource, RemoteWake, SourceDevice};

use crate::activity_monitor::{ACTIVITY_CHANNEL_CAPACITY, ActivityEvent, ActivityMonitor, MonitorHandle};
use crate::clock::Clock;
use crate::executor::DisplayExecutor;
use crate::wake::{self, WakeReport, WakeSettings};

// ---- Constants ----

/// How often the active window is re-evaluated.
pub const WINDOW_RECHECK: Duration = Duration::from_secs(30);

/// "Display unreachable" is reported at most this often.
const UNREACHABLE_LOG_INTERVAL_MS: u64 = 5 * 60 * 1_000;

// ─── Public types ─────────────────────────────────────────────────

/// Collaborators for one pair.
#[derive(Clone)]
pub struct PairDevices {
    pub display: Arc<dyn DisplayDevice>,
    pub source: Arc<dyn SourceDevice>,
    pub presence: Option<Arc<dyn PresenceSource>>,
    pub remote: Option<Arc<dyn RemoteWake>>,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("manual commands are rate limited; retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("pair controller is shut down")]
    ShutDown,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What an enforcement request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnforceOutcome {
    Blocked { gate: Gate },
    Disabled,
    /// Outside the window with `do_nothing`: desired mode is informational.
    Advisory,
    Override,
    ReturnScheduled,
    ResyncInFlight,
    AlreadyCorrect,
    DryRun,
    Applied,
    Failed,
    Unreachable,
    CorrectionLimited,
}

/// Observable snapshot of one pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairStatus {
    pub pair: String,
    pub phase: Phase,
    pub health: Health,
    pub enabled: bool,
    pub dry_run: bool,
    pub desired: Option<DesiredMode>,
    pub advisory: bool,
    pub actual: DisplayState,
    pub activity: ActivitySignal,
    pub connection: ConnectionState,
    pub in_window: bool,
    pub presence: Presence,
    pub presence_raw: Option<String>,
    pub override_active: bool,
    pub override_remaining_secs: u64,
    pub override_until: Option<DateTime<Utc>>,
    pub breaker_open: bool,
    pub breaker_remaining_secs: u64,
    pub breaker_until: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub backoff_remaining_secs: u64,
    pub return_pending: bool,
    pub last_trigger: Option<Trigger>,
    pub last_action: Option<String>,
    pub last_result: Option<ActionResult>,
    pub last_error: Option<String>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub commands_in_window: usize,
    pub consecutive_failures: u32,
    pub command_failures: u64,
    pub consecutive_drifts: u32,
    pub total_drifts: u64,
    pub drift_corrections_last_hour: usize,
    pub updated_at: DateTime<Utc>,
}

// ─── Internal state ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Auto,
    Manual,
    Correction,
}

impl Origin {
    fn event_kind(self) -> EventKind {
        match self {
            Self::Auto => EventKind::Enforcement,
            Self::Manual => EventKind::Manual,
            Self::Correction => EventKind::Drift,
        }
    }
}

/// Spacing between manual commands, checked before the pair lock so a
/// queued duplicate is rejected rather than run after the first finishes.
#[derive(Debug)]
struct ManualGate {
    last_ms: Option<u64>,
    spacing_ms: u64,
}

impl ManualGate {
    fn admit(&mut self, now_ms: u64) -> Result<(), u64> {
        if let Some(last) = self.last_ms {
            let since = now_ms.saturating_sub(last);
            if since < self.spacing_ms {
                return Err(self.spacing_ms - since);
            }
        }
        self.last_ms = Some(now_ms);
        Ok(())
    }
}

struct PairState {
    config: PairConfig,
    executor: DisplayExecutor,
    wake: WakeSettings,
    phase: Phase,
    governor: SafetyGovernor,
    drift: DriftTracker,
    activity: ActivitySignal,
    connection: ConnectionState,
    presence_raw: Option<String>,
    in_window: bool,
    desired: Option<DesiredMode>,
    advisory: bool,
    actual: DisplayState,
    last_trigger: Option<Trigger>,
    last_action: Option<String>,
    last_result: Option<ActionResult>,
    last_error: Option<String>,
    last_action_at: Option<DateTime<Utc>>,
    command_failures: u64,
    unreachable_log: MessageThrottle,
    pending_return: Option<CancellationToken>,
    started_ms: u64,
}

impl PairState {
    fn presence(&self) -> Presence {
        classify_presence(
            self.presence_raw.as_deref(),
            &self.config.home_states,
            &self.config.away_states,
        )
    }

    fn decision_inputs(&self) -> DecisionInputs {
        DecisionInputs {
            source_active: self.activity.active,
            in_window: self.in_window,
            night_behavior: self.config.night_behavior,
            presence_mode: self.config.presence_mode,
            presence: self.presence(),
            away_policy: self.config.away_policy,
            unknown_behavior: self.config.unknown_behavior,
        }
    }

    fn health(&self) -> Health {
        if self.governor.breaker_open() {
            Health::BreakerOpen
        } else if self.phase == Phase::Degraded || self.connection == ConnectionState::NotPaired {
            Health::Degraded
        } else {
            Health::Ok
        }
    }

    fn snapshot(&self, pair: &str, now_ms: u64, wall: DateTime<Utc>) -> PairStatus {
        let secs = |d: &Deadline| d.remaining_ms(now_ms).div_ceil(1_000);
        let override_active = self.drift.override_active(now_ms);
        PairStatus {
            pair: pair.to_string(),
            phase: self.phase,
            health: self.health(),
            enabled: self.config.enabled,
            dry_run: self.config.dry_run,
            desired: self.desired,
            advisory: self.advisory,
            actual: self.actual,
            activity: self.activity,
            connection: self.connection,
            in_window: self.in_window,
            presence: self.presence(),
            presence_raw: self.presence_raw.clone(),
            override_active,
            override_remaining_secs: secs(self.drift.override_deadline()),
            override_until: self.drift.override_deadline().wall_clock(now_ms, wall),
            breaker_open: self.governor.breaker_open(),
            breaker_remaining_secs: secs(self.governor.breaker()),
            breaker_until: self.governor.breaker().wall_clock(now_ms, wall),
            cooldown_remaining_secs: secs(self.governor.cooldown()),
            cooldown_until: self.governor.cooldown().wall_clock(now_ms, wall),
            backoff_remaining_secs: secs(self.governor.backoff_deadline()),
            return_pending: self.pending_return.is_some(),
            last_trigger: self.last_trigger,
            last_action: self.last_action.clone(),
            last_result: self.last_result,
            last_error: self.last_error.clone(),
            last_action_at: self.last_action_at,
            commands_in_window: self.governor.commands_in_window(now_ms),
            consecutive_failures: self.governor.consecutive_failures(),
            command_failures: self.command_failures,
            consecutive_drifts: self.drift.consecutive(),
            total_drifts: self.drift.total_drifts(),
            drift_corrections_last_hour: self.drift.corrections_in_window(now_ms),
            updated_at: wall,
        }
    }
}

fn executor_for(pair: &str, display: &Arc<dyn DisplayDevice>, cfg: &PairConfig) -> DisplayExecutor {
    DisplayExecutor::new(
        pair,
        Arc::clone(display),
        Duration::from_secs(cfg.command_timeout_secs),
        Duration::from_secs(cfg.verify_timeout_secs),
    )
}

fn lock_std<T>(m: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the resync flag when the resync finishes or is dropped.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    id: String,
    clock: Arc<dyn Clock>,
    display: Arc<dyn DisplayDevice>,
    remote: Option<Arc<dyn RemoteWake>>,
    state: Mutex<PairState>,
    events: StdMutex<EventLog>,
    manual: StdMutex<ManualGate>,
    status: watch::Sender<PairStatus>,
    monitor: MonitorHandle,
    resync_in_flight: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

// ─── Controller ───────────────────────────────────────────────────

/// Handle to one running pair. Cheap to clone.
#[derive(Clone)]
pub struct PairController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PairController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairController")
            .field("id", &self.inner.id)
            .field("display", &self.inner.display.address())
            .finish()
    }
}

impl PairController {
    /// Validate `config` and start the pair's background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        id: impl Into<String>,
        config: PairConfig,
        devices: PairDevices,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ControlError> {
        Self::with_cancel(id, config, devices, clock, CancellationToken::new())
    }

    pub fn with_cancel(
        id: impl Into<String>,
        config: PairConfig,
        devices: PairDevices,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let id = id.into();
        let now = clock.now_ms();
        let tasks = TaskTracker::new();

        let (event_tx, event_rx) = mpsc::channel(ACTIVITY_CHANNEL_CAPACITY);
        let (monitor, monitor_handle) = ActivityMonitor::new(
            id.clone(),
            Arc::clone(&devices.source),
            Arc::clone(&clock),
            config.active_mode,
            config.activity_timing(),
            event_tx,
            cancel.clone(),
        );

        let presence_rx = devices.presence.as_ref().map(|p| p.subscribe());
        let presence_raw = presence_rx.as_ref().and_then(|rx| rx.borrow().clone());

        let mut governor = SafetyGovernor::new(config.governor_limits());
        governor.start_startup_grace(now, config.startup_grace_secs * 1_000);

        let state = PairState {
            executor: executor_for(&id, &devices.display, &config),
            wake: WakeSettings::from_config(&config),
            phase: Phase::Idle,
            governor,
            drift: DriftTracker::new(config.drift_limits()),
            activity: ActivitySignal::default(),
            connection: ConnectionState::Disconnected,
            presence_raw,
            in_window: config.window().contains(clock.time_of_day()),
            desired: None,
            advisory: false,
            actual: DisplayState::Unknown,
            last_trigger: None,
            last_action: None,
            last_result: None,
            last_error: None,
            last_action_at: None,
            command_failures: 0,
            unreachable_log: MessageThrottle::new(UNREACHABLE_LOG_INTERVAL_MS),
            pending_return: None,
            started_ms: now,
            config,
        };

        let (status, _) = watch::channel(state.snapshot(&id, now, clock.wall_now()));
        let manual = ManualGate {
            last_ms: None,
            spacing_ms: state.config.manual_min_spacing_secs * 1_000,
        };

        let inner = Arc::new(Inner {
            id,
            clock,
            display: devices.display,
            remote: devices.remote,
            state: Mutex::new(state),
            events: StdMutex::new(EventLog::default()),
            manual: StdMutex::new(manual),
            status,
            monitor: monitor_handle,
            resync_in_flight: AtomicBool::new(false),
            cancel,
            tasks,
        });

        inner.tasks.spawn(monitor.run());
        inner.tasks.spawn(Arc::clone(&inner).consume(event_rx, presence_rx));
        inner.tasks.spawn(Arc::clone(&inner).startup());
        inner.tasks.spawn(Arc::clone(&inner).resync_loop());
        inner.tasks.spawn(Arc::clone(&inner).window_loop());

        info!(pair = %inner.id, display = %inner.display.address(), "pair controller started");
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn display_address(&self) -> &str {
        self.inner.display.address()
    }

    pub fn status(&self) -> PairStatus {
        self.inner.status.borrow().clone()
    }

    /// Newest first, at most `limit` entries.
    pub fn events(&self, limit: usize) -> Vec<EventLogEntry> {
        self.inner.event_log().recent(limit)
    }

    // ─── Operations ───────────────────────────────────────────────

    /// Run the enforcement pipeline once. `force` skips startup grace and cooldown.
    pub async fn enforce(&self, trigger: Trigger, force: bool) -> Result<EnforceOutcome, ControlError> {
        let inner = &self.inner;
        inner
            .until_cancelled(async {
                let mut st = inner.state.lock().await;
                let outcome = inner.enforce_locked(&mut st, trigger, force).await;
                inner.publish(&st);
                outcome
            })
            .await
    }

    pub async fn force_art(&self) -> Result<EnforceOutcome, ControlError> {
        self.manual(DesiredMode::Art).await
    }

    pub async fn force_source(&self) -> Result<EnforceOutcome, ControlError> {
        self.manual(DesiredMode::Source).await
    }

    pub async fn force_off(&self) -> Result<EnforceOutcome, ControlError> {
        self.manual(DesiredMode::Off).await
    }

    pub async fn resync_now(&self) -> Result<EnforceOutcome, ControlError> {
        self.inner.ensure_running()?;
        self.inner.until_cancelled(self.inner.resync(Trigger::Manual)).await
    }

    /// Drop the override and immediately enforce the computed mode.
    pub async fn clear_override(&self) -> Result<EnforceOutcome, ControlError> {
        let inner = &self.inner;
        inner
            .until_cancelled(async {
                let mut st = inner.state.lock().await;
                let was_active = st.drift.clear_override();
                if st.phase == Phase::ManualOverride {
                    st.phase = Phase::Idle;
                }
                info!(pair = %inner.id, was_active, "override cleared manually");
                inner.log_event(
                    EventKind::Override,
                    ActionResult::Success,
                    if was_active { "override cleared manually" } else { "override clear requested; none active" },
                );
                let outcome = inner.enforce_locked(&mut st, Trigger::OverrideCleared, true).await;
                inner.publish(&st);
                outcome
            })
            .await
    }

    /// Close the breaker. Returns whether it was open. Does not enforce.
    pub async fn clear_breaker(&self) -> Result<bool, ControlError> {
        let inner = &self.inner;
        inner
            .until_cancelled(async {
                let mut st = inner.state.lock().await;
                let was_open = st.governor.clear_breaker();
                if st.phase == Phase::BreakerOpen {
                    st.phase = Phase::Idle;
                }
                info!(pair = %inner.id, was_open, "breaker cleared manually");
                inner.log_event(EventKind::Breaker, ActionResult::Success, "breaker cleared manually");
                inner.publish(&st);
                was_open
            })
            .await
    }

    /// Resume source reconnection after the user re-paired the device.
    pub async fn repair_source(&self) -> Result<bool, ControlError> {
        self.inner.ensure_running()?;
        let sent = self.inner.monitor.repair().await;
        if sent {
            self.inner
                .log_event(EventKind::Connection, ActionResult::Info, "source re-pair requested");
        }
        Ok(sent)
    }

    /// Apply new settings in place. Counters, deadlines and the event log survive.
    pub async fn reconfigure(&self, config: PairConfig) -> Result<EnforceOutcome, ControlError> {
        config.validate()?;
        let inner = &self.inner;
        let mode = config.active_mode;
        let timing = config.activity_timing();
        lock_std(&inner.manual).spacing_ms = config.manual_min_spacing_secs * 1_000;

        let outcome = inner
            .until_cancelled(async {
                let mut st = inner.state.lock().await;
                st.governor.set_limits(config.governor_limits());
                st.drift.set_limits(config.drift_limits());
                st.executor = executor_for(&inner.id, &inner.display, &config);
                st.wake = WakeSettings::from_config(&config);
                st.config = config;
                info!(pair = %inner.id, "pair reconfigured");
                inner.log_event(EventKind::Config, ActionResult::Info, "configuration reloaded");
                let outcome = inner.enforce_locked(&mut st, Trigger::Reconfigure, false).await;
                inner.publish(&st);
                outcome
            })
            .await?;

        // Outside the pair lock: the monitor may be waiting on the consumer.
        inner.monitor.set_policy(mode, timing).await;
        Ok(outcome)
    }

    /// Cancel every task, wait for them, then release the display session.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!(pair = %inner.id, "pair controller stopping");
        inner.cancel.cancel();
        inner.tasks.close();
        inner.tasks.wait().await;
        inner.display.disconnect().await;
        info!(pair = %inner.id, "pair controller stopped");
    }

    async fn manual(&self, mode: DesiredMode) -> Result<EnforceOutcome, ControlError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let now = inner.clock.now_ms();
        if let Err(retry_after_ms) = lock_std(&inner.manual).admit(now) {
            warn!(pair = %inner.id, %mode, retry_after_ms, "manual command rate limited");
            return Err(ControlError::RateLimited { retry_after_ms });
        }
        inner
            .until_cancelled(async {
                let mut st = inner.state.lock().await;
                st.last_trigger = Some(Trigger::Manual);
                inner.cancel_return(&mut st);
                info!(pair = %inner.id, %mode, "manual command");
                let outcome = inner.dispatch(&mut st, mode, Trigger::Manual, Origin::Manual).await;
                inner.publish(&st);
                outcome
            })
            .await
    }
}

// ─── Background tasks ─────────────────────────────────────────────

impl Inner {
    fn ensure_running(&self) -> Result<(), ControlError> {
        if self.cancel.is_cancelled() {
            Err(ControlError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, ControlError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ControlError::ShutDown),
            out = fut => Ok(out),
        }
    }

    fn event_log(&self) -> StdMutexGuard<'_, EventLog> {
        lock_std(&self.events)
    }

    fn log_event(&self, kind: EventKind, result: ActionResult, message: impl Into<String>) {
        let now = self.clock.wall_now();
        self.event_log().push(now, kind, result, message);
    }

    fn publish(&self, st: &PairState) {
        let snapshot = st.snapshot(&self.id, self.clock.now_ms(), self.clock.wall_now());
        self.status.send_replace(snapshot);
    }

    async fn consume(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ActivityEvent>,
        mut presence: Option<watch::Receiver<Option<String>>>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let handled = match event {
                        ActivityEvent::Signal(signal) => self.until_cancelled(self.on_activity(signal)).await,
                        ActivityEvent::Connection { state, signal } => {
                            self.until_cancelled(self.on_connection(state, signal)).await
                        }
                    };
                    if handled.is_err() {
                        break;
                    }
                }
                raw = presence_changed(&mut presence) => {
                    if self.until_cancelled(self.on_presence(raw)).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(pair = %self.id, "event consumer stopped");
    }

    async fn on_activity(self: &Arc<Self>, signal: ActivitySignal) {
        let mut st = self.state.lock().await;
        st.activity = signal;
        info!(
            pair = %self.id,
            active = signal.active,
            playback = signal.playback.as_str(),
            "source activity changed"
        );
        self.enforce_locked(&mut st, Trigger::Activity, false).await;
        self.publish(&st);
    }

    async fn on_connection(self: &Arc<Self>, state: ConnectionState, signal: ActivitySignal) {
        let mut st = self.state.lock().await;
        st.connection = state;
        st.activity = signal;
        match state {
            ConnectionState::Connected => {
                self.log_event(EventKind::Connection, ActionResult::Success, "source connected")
            }
            ConnectionState::Disconnected => {
                self.log_event(EventKind::Connection, ActionResult::Info, "source disconnected")
            }
            ConnectionState::NotPaired => {
                warn!(pair = %self.id, "source rejected pairing; reconnection suspended");
                self.log_event(
                    EventKind::Connection,
                    ActionResult::Failure,
                    "source pairing rejected; re-pair required",
                );
            }
            ConnectionState::Connecting => {}
        }
        self.publish(&st);
    }

    async fn on_presence(self: &Arc<Self>, raw: Option<String>) {
        let mut st = self.state.lock().await;
        let before = st.presence();
        st.presence_raw = raw;
        let after = st.presence();
        debug!(pair = %self.id, raw = ?st.presence_raw, ?after, "presence reading");
        if before != after && st.config.presence_mode == artsync_core::PresenceMode::Entity {
            info!(pair = %self.id, from = ?before, to = ?after, "presence changed");
            self.enforce_locked(&mut st, Trigger::Presence, false).await;
        }
        self.publish(&st);
    }

    async fn startup(self: Arc<Self>) {
        let grace = Duration::from_secs(self.state.lock().await.config.startup_grace_secs);
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }
        let _ = self
            .until_cancelled(async {
                let mut st = self.state.lock().await;
                st.governor.end_startup_grace();
                info!(pair = %self.id, "startup grace elapsed");
                self.enforce_locked(&mut st, Trigger::Startup, false).await;
                self.publish(&st);
            })
            .await;
    }

    async fn resync_loop(self: Arc<Self>) {
        loop {
            let interval = Duration::from_secs(self.state.lock().await.config.resync_interval_secs);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if self.until_cancelled(self.resync(Trigger::Resync)).await.is_err() {
                break;
            }
        }
    }

    async fn window_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(WINDOW_RECHECK) => {}
            }
            if self.until_cancelled(self.check_window()).await.is_err() {
                break;
            }
        }
    }

    async fn check_window(self: &Arc<Self>) {
        let mut st = self.state.lock().await;
        if self.cross_window(&mut st) {
            self.enforce_window(&mut st).await;
        }
        self.publish(&st);
    }

    /// Enforce a window flip. A gated flip is rolled back so the next
    /// watcher tick retries it.
    async fn enforce_window(self: &Arc<Self>, st: &mut PairState) -> EnforceOutcome {
        let outcome = self.enforce_locked(st, Trigger::TimeWindow, false).await;
        if matches!(outcome, EnforceOutcome::Blocked { .. }) {
            st.in_window = !st.in_window;
        }
        outcome
    }

    /// Record a crossed window boundary. True when membership flipped; the
    /// caller owes a `TimeWindow` enforcement.
    fn cross_window(&self, st: &mut PairState) -> bool {
        let in_window = st.config.window().contains(self.clock.time_of_day());
        if in_window == st.in_window {
            return false;
        }
        info!(pair = %self.id, in_window, "active window boundary crossed");
        st.in_window = in_window;
        true
    }

    // ─── Delayed return ───────────────────────────────────────────

    fn cancel_return(&self, st: &mut PairState) {
        if let Some(token) = st.pending_return.take() {
            token.cancel();
            debug!(pair = %self.id, "pending return cancelled");
        }
    }

    fn schedule_return(self: &Arc<Self>, st: &mut PairState) {
        self.cancel_return(st);
        let token = self.cancel.child_token();
        st.pending_return = Some(token.clone());
        st.phase = Phase::ReturningToDisplay;
        let delay = Duration::from_secs(st.config.return_delay_secs);
        info!(pair = %self.id, delay_secs = delay.as_secs(), "source inactive; return to art scheduled");

        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut st = tokio::select! {
                _ = token.cancelled() => return,
                st = inner.state.lock() => st,
            };
            // Replaced or cancelled while waiting for the lock.
            if token.is_cancelled() {
                return;
            }
            st.pending_return = None;
            tokio::select! {
                _ = token.cancelled() => {}
                _ = inner.enforce_locked(&mut st, Trigger::ReturnDelay, true) => {}
            }
            inner.publish(&st);
        });
    }

    // ─── Enforcement ──────────────────────────────────────────────

    async fn enforce_locked(
        self: &Arc<Self>,
        st: &mut PairState,
        trigger: Trigger,
        force: bool,
    ) -> EnforceOutcome {
        let now = self.clock.now_ms();
        st.last_trigger = Some(trigger);

        if !force {
            let gate = st.governor.pre_check(now);
            if !gate.is_open() {
                debug!(pair = %self.id, %trigger, ?gate, "enforcement deferred");
                return EnforceOutcome::Blocked { gate };
            }
        }

        st.in_window = st.config.window().contains(self.clock.time_of_day());
        let decision = decide(&st.decision_inputs());
        let previous = st.desired.replace(decision.mode);
        st.advisory = decision.advisory;
        if previous != Some(decision.mode) {
            info!(
                pair = %self.id,
                %trigger,
                from = previous.map(DesiredMode::as_str),
                to = decision.mode.as_str(),
                active = st.activity.active,
                in_window = st.in_window,
                "desired mode changed"
            );
        }

        if decision.advisory {
            self.cancel_return(st);
            st.phase = Phase::Idle;
            debug!(pair = %self.id, "outside active window with do_nothing; not enforcing");
            return EnforceOutcome::Advisory;
        }

        if !st.config.enabled {
            self.cancel_return(st);
            st.phase = Phase::Idle;
            debug!(pair = %self.id, mode = %decision.mode, "pair disabled; not enforcing");
            return EnforceOutcome::Disabled;
        }

        if st.drift.override_active(now) {
            if decision.mode != DesiredMode::Source {
                st.phase = Phase::ManualOverride;
                debug!(pair = %self.id, %trigger, "override active; not enforcing");
                return EnforceOutcome::Override;
            }
            st.drift.clear_override();
            info!(pair = %self.id, "override cleared by source activity");
            self.log_event(
                EventKind::Override,
                ActionResult::Success,
                "override cleared: source became active",
            );
        } else if st.drift.expire_override(now) {
            info!(pair = %self.id, "override expired");
            self.log_event(EventKind::Override, ActionResult::Info, "override expired");
        }

        if decision.mode == DesiredMode::Art && trigger != Trigger::ReturnDelay {
            if st.pending_return.is_some() {
                return EnforceOutcome::ReturnScheduled;
            }
            if trigger == Trigger::Activity
                && previous == Some(DesiredMode::Source)
                && st.config.return_delay_secs > 0
            {
                self.schedule_return(st);
                return EnforceOutcome::ReturnScheduled;
            }
        }

        self.cancel_return(st);
        self.dispatch(st, decision.mode, trigger, Origin::Auto).await
    }

    /// Gate, read, wake if needed, then run the ladder for `mode`.
    async fn dispatch(
        &self,
        st: &mut PairState,
        mode: DesiredMode,
        trigger: Trigger,
        origin: Origin,
    ) -> EnforceOutcome {
        let now = self.clock.now_ms();
        let kind = origin.event_kind();

        if !st.config.enabled {
            st.phase = Phase::Idle;
            info!(pair = %self.id, %mode, "pair disabled; command not sent");
            return EnforceOutcome::Disabled;
        }

        match st.governor.dispatch_check(now) {
            Gate::Open => {}
            gate @ Gate::BreakerOpen { remaining_ms } => {
                if st.phase != Phase::BreakerOpen || origin == Origin::Manual {
                    warn!(pair = %self.id, %mode, remaining_ms, "breaker open; command blocked");
                    self.log_event(
                        EventKind::Breaker,
                        ActionResult::Skipped,
                        format!("{mode} blocked: breaker open ({}s left)", remaining_ms.div_ceil(1_000)),
                    );
                }
                st.phase = Phase::BreakerOpen;
                return EnforceOutcome::Blocked { gate };
            }
            gate @ Gate::Backoff { remaining_ms, first_report } => {
                if first_report {
                    info!(pair = %self.id, %mode, remaining_ms, "in connection backoff; command deferred");
                    self.log_event(
                        kind,
                        ActionResult::Skipped,
                        format!("{mode} deferred: backoff ({}s left)", remaining_ms.div_ceil(1_000)),
                    );
                }
                return EnforceOutcome::Blocked { gate };
            }
            gate => return EnforceOutcome::Blocked { gate },
        }

        let exec = st.executor.clone();
        let mut actual = exec.read_state().await;
        if actual == DisplayState::Unknown && !exec.reachable().await {
            if mode == DesiredMode::Off {
                st.actual = DisplayState::Unknown;
                st.phase = Phase::Idle;
                debug!(pair = %self.id, "display unreachable and desired off; nothing to do");
                return EnforceOutcome::AlreadyCorrect;
            }
            let report = wake::bring_up(&self.id, &exec, self.remote.as_ref(), &st.wake).await;
            if !report.reachable {
                st.actual = DisplayState::Unknown;
                return self.unreachable(st, &report);
            }
            self.log_event(
                EventKind::Wake,
                ActionResult::Success,
                format!("display woken ({})", report.summary()),
            );
            actual = exec.read_state().await;
        }
        st.actual = actual;

        if mode.is_satisfied_by(actual) {
            debug!(pair = %self.id, %mode, %actual, "already in desired state");
            if st.phase != Phase::BreakerOpen {
                st.phase = Phase::Idle;
            }
            return EnforceOutcome::AlreadyCorrect;
        }

        if st.config.dry_run {
            st.phase = Phase::DryRun;
            info!(pair = %self.id, %mode, %actual, "dry run; would switch display");
            self.log_event(
                kind,
                ActionResult::DryRun,
                format!("dry run: would set {mode} (display {actual})"),
            );
            return EnforceOutcome::DryRun;
        }

        if origin == Origin::Correction {
            st.drift.record_correction(now);
        }
        st.phase = match mode {
            DesiredMode::Source => Phase::SwitchingToSource,
            DesiredMode::Art | DesiredMode::Off => Phase::ReturningToDisplay,
        };
        self.publish(st);

        let (action, outcome) = match mode {
            DesiredMode::Art => ("art_on", exec.force_art_on().await),
            DesiredMode::Source => ("art_off", exec.force_art_off().await),
            DesiredMode::Off => ("off", exec.turn_off().await),
        };
        if outcome.success && mode == DesiredMode::Source {
            if let Some(key) = st.config.input.key() {
                if !exec.set_input(key).await {
                    warn!(pair = %self.id, key, "input switch failed");
                }
            }
        }

        let now = self.clock.now_ms();
        let record = st.governor.record_command(now);
        st.last_action = Some(format!("{action}:{}", outcome.step));
        st.last_action_at = Some(self.clock.wall_now());

        let result = if outcome.success {
            st.governor.record_success(now, origin != Origin::Manual);
            st.actual = mode.expected_display();
            st.last_result = Some(ActionResult::Success);
            st.last_error = None;
            st.phase = Phase::Idle;
            info!(pair = %self.id, %trigger, %mode, step = outcome.step, elapsed_ms = outcome.elapsed_ms, "display switched");
            self.log_event(
                kind,
                ActionResult::Success,
                format!("{trigger}: {mode} via {} in {} ms", outcome.step, outcome.elapsed_ms),
            );
            EnforceOutcome::Applied
        } else {
            let backoff_ms = st.governor.record_failure(now);
            st.command_failures += 1;
            st.actual = DisplayState::Unknown;
            let message = format!(
                "{trigger}: {mode} not verified after {} ({} ms); backing off {}s",
                outcome.step,
                outcome.elapsed_ms,
                backoff_ms.div_ceil(1_000)
            );
            warn!(pair = %self.id, %mode, step = outcome.step, backoff_ms, "display command failed");
            st.last_result = Some(ActionResult::Failure);
            st.last_error = Some(message.clone());
            st.phase = Phase::Degraded;
            self.log_event(kind, ActionResult::Failure, message);
            EnforceOutcome::Failed
        };

        if let CommandRecord::BreakerOpened { in_window } = record {
            st.phase = Phase::BreakerOpen;
            warn!(pair = %self.id, in_window, "breaker opened");
            self.log_event(
                EventKind::Breaker,
                ActionResult::Failure,
                format!("breaker opened: {in_window} commands in 5 minutes"),
            );
        }
        result
    }

    fn unreachable(&self, st: &mut PairState, report: &WakeReport) -> EnforceOutcome {
        let now = self.clock.now_ms();
        let backoff_ms = st.governor.record_failure(now);
        let in_grace = now.saturating_sub(st.started_ms) < st.config.wake_startup_grace_secs * 1_000;
        if in_grace {
            debug!(pair = %self.id, wake = %report.summary(), "display unreachable during wake startup grace");
            return EnforceOutcome::Unreachable;
        }
        st.phase = Phase::Degraded;
        st.last_result = Some(ActionResult::Failure);
        st.last_error = Some(format!("display unreachable ({})", report.summary()));
        if st.unreachable_log.allow(now) {
            warn!(pair = %self.id, wake = %report.summary(), backoff_ms, "display unreachable");
            self.log_event(
                EventKind::Wake,
                ActionResult::Failure,
                format!("display unreachable ({})", report.summary()),
            );
        }
        EnforceOutcome::Unreachable
    }

    // ─── Resync ───────────────────────────────────────────────────

    async fn resync(self: &Arc<Self>, trigger: Trigger) -> EnforceOutcome {
        if self.resync_in_flight.swap(true, Ordering::AcqRel) {
            debug!(pair = %self.id, "resync already running");
            return EnforceOutcome::ResyncInFlight;
        }
        let _flight = FlightGuard(&self.resync_in_flight);
        let mut st = self.state.lock().await;
        let outcome = self.resync_locked(&mut st, trigger).await;
        self.publish(&st);
        outcome
    }

    async fn resync_locked(self: &Arc<Self>, st: &mut PairState, trigger: Trigger) -> EnforceOutcome {
        let now = self.clock.now_ms();
        st.last_trigger = Some(trigger);

        if st.governor.tick(now) {
            info!(pair = %self.id, "breaker closed after cooldown");
            if st.phase == Phase::BreakerOpen {
                st.phase = Phase::Idle;
            }
            self.log_event(EventKind::Breaker, ActionResult::Success, "breaker auto-closed");
        }
        st.drift.prune(now);
        if st.drift.expire_override(now) {
            info!(pair = %self.id, "override expired");
            if st.phase == Phase::ManualOverride {
                st.phase = Phase::Idle;
            }
            self.log_event(EventKind::Override, ActionResult::Info, "override expired");
        }

        // A scheduled boundary is not drift.
        if self.cross_window(st) {
            return self.enforce_window(st).await;
        }

        if let gate @ Gate::StartupGrace { .. } = st.governor.pre_check(now) {
            return EnforceOutcome::Blocked { gate };
        }
        if !st.config.enabled {
            return EnforceOutcome::Disabled;
        }
        if st.drift.override_active(now) {
            st.phase = Phase::ManualOverride;
            return EnforceOutcome::Override;
        }
        if st.pending_return.is_some() {
            return EnforceOutcome::ReturnScheduled;
        }

        let actual = st.executor.read_state().await;
        st.actual = actual;
        let decision = decide(&st.decision_inputs());
        st.desired = Some(decision.mode);
        st.advisory = decision.advisory;
        if decision.advisory {
            return EnforceOutcome::Advisory;
        }
        if !is_drift(decision.mode, actual) {
            debug!(pair = %self.id, desired = %decision.mode, %actual, "resync: in sync");
            return EnforceOutcome::AlreadyCorrect;
        }

        let now = self.clock.now_ms();
        let drift = st.drift.record_drift(now);
        warn!(
            pair = %self.id,
            desired = %decision.mode,
            %actual,
            consecutive = drift.consecutive,
            "drift detected"
        );
        self.log_event(
            EventKind::Drift,
            ActionResult::Info,
            format!(
                "drift: desired {} but display {actual} (streak {})",
                decision.mode, drift.consecutive
            ),
        );

        if drift.override_activated {
            st.phase = Phase::ManualOverride;
            warn!(pair = %self.id, minutes = st.config.override_minutes, "override activated");
            self.log_event(
                EventKind::Override,
                ActionResult::Success,
                format!(
                    "override activated for {} min after {} consecutive drifts",
                    st.config.override_minutes, drift.consecutive
                ),
            );
            return EnforceOutcome::Override;
        }

        if !st.drift.correction_allowed(now) {
            info!(pair = %self.id, "drift correction limited");
            self.log_event(
                EventKind::Drift,
                ActionResult::Skipped,
                "correction skipped: correction cooldown or hourly cap",
            );
            return EnforceOutcome::CorrectionLimited;
        }

        self.dispatch(st, decision.mode, trigger, Origin::Correction).await
    }
}

/// Next presence value. Pends forever once the source is gone.
async fn presence_changed(rx: &mut Option<watch::Receiver<Option<String>>>) -> Option<String> {
    loop {
        let Some(r) = rx.as_mut() else {
            return std::future::pending().await;
        };
        if r.changed().await.is_ok() {
            return r.borrow_and_update().clone();
        }
        *rx = None;
    }
}
