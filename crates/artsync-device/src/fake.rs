//! In-memory collaborators for controller tests.
//!
//! Every call is recorded so tests can assert on exact command counts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use artsync_core::activity::SourceReport;
use artsync_core::types::{DisplayState, PlaybackState, PowerState};

use crate::error::{DeviceError, DeviceResult};
use crate::traits::{DisplayDevice, PresenceSource, RemoteWake, SourceDevice, SourceSession};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Display ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayCall {
    Read,
    SetArt(bool),
    PowerToggle,
    SetInput(String),
    Reachable,
    WakeBroadcast,
    Reconnect,
    Disconnect,
}

impl DisplayCall {
    /// Calls that change device state.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::SetArt(_) | Self::PowerToggle | Self::SetInput(_) | Self::WakeBroadcast
        )
    }
}

#[derive(Debug)]
struct DisplayModel {
    reachable: bool,
    powered: bool,
    art: bool,
    ignore_sets: u32,
    reject_sets: bool,
    expire_next: u32,
    wake_on_broadcast: bool,
    calls: Vec<DisplayCall>,
}

/// Simulated frame display.
///
/// Power toggling flips `powered`; powering on lands on the source input
/// with art mode off. Art-mode sets are ignored while in standby.
#[derive(Debug)]
pub struct FakeDisplay {
    address: String,
    model: Mutex<DisplayModel>,
}

impl FakeDisplay {
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            model: Mutex::new(DisplayModel {
                reachable: true,
                powered: true,
                art: true,
                ignore_sets: 0,
                reject_sets: false,
                expire_next: 0,
                wake_on_broadcast: false,
                calls: Vec::new(),
            }),
        })
    }

    pub fn set_art(&self, on: bool) {
        let mut m = lock(&self.model);
        m.powered = true;
        m.art = on;
    }

    pub fn set_powered(&self, powered: bool) {
        lock(&self.model).powered = powered;
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.model).reachable = reachable;
    }

    /// Acknowledge the next `n` art-mode sets without applying them.
    pub fn ignore_next_sets(&self, n: u32) {
        lock(&self.model).ignore_sets = n;
    }

    pub fn reject_sets(&self, reject: bool) {
        lock(&self.model).reject_sets = reject;
    }

    /// Fail the next `n` session calls with a stale-session error.
    pub fn expire_next(&self, n: u32) {
        lock(&self.model).expire_next = n;
    }

    pub fn wake_on_broadcast(&self, wake: bool) {
        lock(&self.model).wake_on_broadcast = wake;
    }

    pub fn art(&self) -> bool {
        lock(&self.model).art
    }

    pub fn powered(&self) -> bool {
        lock(&self.model).powered
    }

    pub fn calls(&self) -> Vec<DisplayCall> {
        lock(&self.model).calls.clone()
    }

    /// State-changing calls only.
    pub fn commands(&self) -> Vec<DisplayCall> {
        lock(&self.model)
            .calls
            .iter()
            .filter(|c| c.is_command())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.model).calls.clear();
    }

    fn session(&self, call: DisplayCall) -> DeviceResult<MutexGuard<'_, DisplayModel>> {
        let mut m = lock(&self.model);
        m.calls.push(call);
        if m.expire_next > 0 {
            m.expire_next -= 1;
            return Err(DeviceError::SessionExpired("ms.channel.connect".into()));
        }
        if !m.reachable {
            return Err(DeviceError::Transport("display unreachable".into()));
        }
        Ok(m)
    }
}

#[async_trait]
impl DisplayDevice for FakeDisplay {
    fn address(&self) -> &str {
        &self.address
    }

    async fn read_art_state(&self) -> DeviceResult<DisplayState> {
        let m = self.session(DisplayCall::Read)?;
        if !m.powered {
            return Ok(DisplayState::Off);
        }
        Ok(DisplayState::from_bool(m.art))
    }

    async fn set_art_state(&self, on: bool) -> DeviceResult<bool> {
        let mut m = self.session(DisplayCall::SetArt(on))?;
        if m.reject_sets {
            return Err(DeviceError::Transport("set rejected".into()));
        }
        if m.ignore_sets > 0 {
            m.ignore_sets -= 1;
            return Ok(true);
        }
        if m.powered {
            m.art = on;
        }
        Ok(true)
    }

    async fn power_toggle(&self) -> DeviceResult<bool> {
        let mut m = self.session(DisplayCall::PowerToggle)?;
        m.powered = !m.powered;
        m.art = false;
        Ok(true)
    }

    async fn set_input(&self, key: &str) -> DeviceResult<bool> {
        self.session(DisplayCall::SetInput(key.to_string()))?;
        Ok(true)
    }

    async fn reachable(&self) -> bool {
        let mut m = lock(&self.model);
        m.calls.push(DisplayCall::Reachable);
        m.reachable
    }

    async fn wake_broadcast(&self, _mac: &str, _broadcast: &str) -> DeviceResult<bool> {
        let mut m = lock(&self.model);
        m.calls.push(DisplayCall::WakeBroadcast);
        if m.wake_on_broadcast {
            m.reachable = true;
            m.powered = true;
        }
        Ok(true)
    }

    async fn reconnect(&self) -> DeviceResult<()> {
        let mut m = lock(&self.model);
        m.calls.push(DisplayCall::Reconnect);
        if m.reachable {
            Ok(())
        } else {
            Err(DeviceError::Transport("display unreachable".into()))
        }
    }

    async fn disconnect(&self) {
        lock(&self.model).calls.push(DisplayCall::Disconnect);
    }
}

// ─── Remote ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FakeRemote {
    calls: Mutex<Vec<String>>,
    fail: Mutex<bool>,
    wakes: Mutex<Option<Arc<FakeDisplay>>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(&self, fail: bool) {
        *lock(&self.fail) = fail;
    }

    /// A successful wake makes `display` reachable and powered.
    pub fn wakes(&self, display: Arc<FakeDisplay>) {
        *lock(&self.wakes) = Some(display);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl RemoteWake for FakeRemote {
    async fn send_wake_command(&self, target: &str) -> DeviceResult<()> {
        lock(&self.calls).push(target.to_string());
        if *lock(&self.fail) {
            return Err(DeviceError::Transport("remote unavailable".into()));
        }
        if let Some(display) = lock(&self.wakes).as_ref() {
            display.set_reachable(true);
            display.set_powered(true);
        }
        Ok(())
    }
}

// ─── Source ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SourceModel {
    initial: SourceReport,
    failures: VecDeque<DeviceError>,
    tx: Option<mpsc::Sender<SourceReport>>,
    connects: u32,
    disconnects: u32,
}

#[derive(Debug, Default)]
pub struct FakeSource {
    model: Mutex<SourceModel>,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reading returned by the next successful connect.
    pub fn set_initial(&self, playback: PlaybackState, power: PowerState) {
        lock(&self.model).initial = SourceReport { playback, power };
    }

    /// Queue failures for upcoming connect attempts.
    pub fn fail_connects(&self, errors: impl IntoIterator<Item = DeviceError>) {
        lock(&self.model).failures.extend(errors);
    }

    /// Push an update on the live session. Returns `false` if none is live.
    pub fn push(&self, playback: PlaybackState, power: PowerState) -> bool {
        let m = lock(&self.model);
        match &m.tx {
            Some(tx) => tx.try_send(SourceReport { playback, power }).is_ok(),
            None => false,
        }
    }

    /// Simulate the link dropping.
    pub fn drop_link(&self) {
        lock(&self.model).tx = None;
    }

    pub fn is_linked(&self) -> bool {
        lock(&self.model).tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn connects(&self) -> u32 {
        lock(&self.model).connects
    }

    pub fn disconnects(&self) -> u32 {
        lock(&self.model).disconnects
    }
}

#[async_trait]
impl SourceDevice for FakeSource {
    async fn connect(&self) -> DeviceResult<SourceSession> {
        let mut m = lock(&self.model);
        m.connects += 1;
        if let Some(err) = m.failures.pop_front() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(32);
        m.tx = Some(tx);
        Ok(SourceSession {
            initial: m.initial,
            updates: rx,
        })
    }

    async fn disconnect(&self) {
        let mut m = lock(&self.model);
        m.disconnects += 1;
        m.tx = None;
    }
}

// ─── Presence ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FakePresence {
    tx: watch::Sender<Option<String>>,
}

impl FakePresence {
    pub fn new(initial: Option<&str>) -> Arc<Self> {
        let (tx, _rx) = watch::channel(initial.map(str::to_string));
        Arc::new(Self { tx })
    }

    pub fn set(&self, value: Option<&str>) {
        self.tx.send_replace(value.map(str::to_string));
    }
}

impl PresenceSource for FakePresence {
    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}
