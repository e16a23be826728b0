//! Display command executor.
//!
//! Wraps a [`DisplayDevice`] with the rules the controller relies on:
//! reads never fail (errors become `Unknown`), every send is verified by
//! reading back, a stale session gets exactly one reconnect-and-retry, and
//! mode changes walk a fallback ladder. Every ladder step is logged with
//! its outcome and elapsed time.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use artsync_core::types::DisplayState;
use artsync_device::{DeviceError, DeviceResult, DisplayDevice};

// ---- Constants ----

pub const VERIFY_ATTEMPTS: u32 = 10;
pub const VERIFY_INTERVAL: Duration = Duration::from_millis(800);
/// Wait after a power toggle before the next command.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Result of a fallback ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadderOutcome {
    pub success: bool,
    /// Name of the step that succeeded, or of the last step tried.
    pub step: &'static str,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy)]
enum Call<'a> {
    Read,
    SetArt(bool),
    PowerToggle,
    SetInput(&'a str),
}

impl Call<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Read => "read_art_state",
            Self::SetArt(_) => "set_art_state",
            Self::PowerToggle => "power_toggle",
            Self::SetInput(_) => "set_input",
        }
    }
}

enum Reply {
    State(DisplayState),
    Ack(bool),
}

#[derive(Clone)]
pub struct DisplayExecutor {
    pair: String,
    display: Arc<dyn DisplayDevice>,
    call_timeout: Duration,
    verify_budget: Duration,
}

impl DisplayExecutor {
    pub fn new(
        pair: impl Into<String>,
        display: Arc<dyn DisplayDevice>,
        call_timeout: Duration,
        verify_budget: Duration,
    ) -> Self {
        Self {
            pair: pair.into(),
            display,
            call_timeout,
            verify_budget,
        }
    }

    pub fn display(&self) -> &Arc<dyn DisplayDevice> {
        &self.display
    }

    // ─── Primitive operations ────────────────────────────────────

    /// Current art-mode state. Any failure reads as `Unknown`.
    pub async fn read_state(&self) -> DisplayState {
        match self.call(Call::Read).await {
            Ok(Reply::State(state)) => state,
            Ok(Reply::Ack(_)) => DisplayState::Unknown,
            Err(e) => {
                debug!(pair = %self.pair, "art state read failed: {e}");
                DisplayState::Unknown
            }
        }
    }

    pub async fn set_state(&self, on: bool) -> bool {
        self.ack(Call::SetArt(on)).await
    }

    pub async fn power_toggle(&self) -> bool {
        self.ack(Call::PowerToggle).await
    }

    /// Best effort; unsupported adapters report `false` quietly.
    pub async fn set_input(&self, key: &str) -> bool {
        self.ack(Call::SetInput(key)).await
    }

    pub async fn reachable(&self) -> bool {
        tokio::time::timeout(self.call_timeout, self.display.reachable())
            .await
            .unwrap_or(false)
    }

    /// Read until `accept` holds, at most [`VERIFY_ATTEMPTS`] times spaced
    /// [`VERIFY_INTERVAL`] apart and within the verify budget.
    pub async fn verify(&self, accept: impl Fn(DisplayState) -> bool) -> bool {
        let start = Instant::now();
        let mut last = DisplayState::Unknown;
        for attempt in 1..=VERIFY_ATTEMPTS {
            let elapsed = start.elapsed();
            if elapsed >= self.verify_budget {
                break;
            }
            last = self.read_state().await;
            if accept(last) {
                debug!(pair = %self.pair, attempt, state = %last, "verified");
                return true;
            }
            let remaining = self.verify_budget.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(VERIFY_INTERVAL.min(remaining)).await;
        }
        debug!(
            pair = %self.pair,
            last = %last,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "verification failed"
        );
        false
    }

    // ─── Ladders ─────────────────────────────────────────────────

    /// Turn ambient mode on: direct set, then toggle + set, then double
    /// toggle + set. Each step runs only if the previous one did not verify.
    pub async fn force_art_on(&self) -> LadderOutcome {
        let start = Instant::now();
        let on = |s: DisplayState| s == DisplayState::On;

        let ok = self.set_state(true).await && self.verify(on).await;
        self.log_step("art_on", "direct", ok, start);
        if ok {
            return self.outcome(true, "direct", start);
        }

        let mut ok = false;
        if self.power_toggle().await {
            tokio::time::sleep(SETTLE_DELAY).await;
            ok = self.set_state(true).await && self.verify(on).await;
        }
        self.log_step("art_on", "power_toggle", ok, start);
        if ok {
            return self.outcome(true, "power_toggle", start);
        }

        if self.power_toggle().await {
            tokio::time::sleep(SETTLE_DELAY).await;
        }
        if self.power_toggle().await {
            tokio::time::sleep(SETTLE_DELAY).await;
        }
        let ok = self.set_state(true).await && self.verify(on).await;
        self.log_step("art_on", "double_toggle", ok, start);
        self.outcome(ok, "double_toggle", start)
    }

    /// Turn ambient mode off so the source shows: direct set, then a power
    /// toggle.
    pub async fn force_art_off(&self) -> LadderOutcome {
        let start = Instant::now();
        let off = |s: DisplayState| s == DisplayState::Off;

        let ok = self.set_state(false).await && self.verify(off).await;
        self.log_step("art_off", "direct", ok, start);
        if ok {
            return self.outcome(true, "direct", start);
        }

        let mut ok = false;
        if self.power_toggle().await {
            tokio::time::sleep(SETTLE_DELAY).await;
            ok = self.verify(off).await;
        }
        self.log_step("art_off", "power_toggle", ok, start);
        self.outcome(ok, "power_toggle", start)
    }

    /// Fully off: ambient mode off, power toggle, then confirm the panel no
    /// longer reports ambient mode on. A panel that stops answering counts
    /// as off.
    pub async fn turn_off(&self) -> LadderOutcome {
        let start = Instant::now();
        let sent = self.set_state(false).await;
        let toggled = self.power_toggle().await;
        let mut ok = false;
        if sent || toggled {
            tokio::time::sleep(SETTLE_DELAY).await;
            ok = self
                .verify(|s| matches!(s, DisplayState::Off | DisplayState::Unknown))
                .await;
        }
        self.log_step("off", "art_off_power_toggle", ok, start);
        self.outcome(ok, "art_off_power_toggle", start)
    }

    // ─── internals ───────────────────────────────────────────────

    async fn ack(&self, call: Call<'_>) -> bool {
        match self.call(call).await {
            Ok(Reply::Ack(acked)) => acked,
            Ok(Reply::State(_)) => false,
            Err(DeviceError::Unsupported(op)) => {
                debug!(pair = %self.pair, "{op} not supported by display adapter");
                false
            }
            Err(e) => {
                warn!(pair = %self.pair, call = call.name(), "display command failed: {e}");
                false
            }
        }
    }

    /// One call, plus a single reconnect-and-retry on session expiry.
    async fn call(&self, call: Call<'_>) -> DeviceResult<Reply> {
        match self.once(call).await {
            Err(e) if e.is_session_expiry() => {
                info!(pair = %self.pair, call = call.name(), "stale display session, reconnecting: {e}");
                self.bounded(self.display.reconnect()).await?;
                self.once(call).await
            }
            other => other,
        }
    }

    async fn once(&self, call: Call<'_>) -> DeviceResult<Reply> {
        let d = &self.display;
        match call {
            Call::Read => self.bounded(d.read_art_state()).await.map(Reply::State),
            Call::SetArt(on) => self.bounded(d.set_art_state(on)).await.map(Reply::Ack),
            Call::PowerToggle => self.bounded(d.power_toggle()).await.map(Reply::Ack),
            Call::SetInput(key) => self.bounded(d.set_input(key)).await.map(Reply::Ack),
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = DeviceResult<T>>) -> DeviceResult<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(self.call_timeout)),
        }
    }

    fn log_step(&self, action: &'static str, step: &'static str, ok: bool, start: Instant) {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if ok {
            info!(pair = %self.pair, action, step, outcome = "verified", elapsed_ms, "display command attempt");
        } else {
            warn!(pair = %self.pair, action, step, outcome = "failed", elapsed_ms, "display command attempt");
        }
    }

    fn outcome(&self, success: bool, step: &'static str, start: Instant) -> LadderOutcome {
        LadderOutcome {
            success,
            step,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }
}
