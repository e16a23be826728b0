//! Collaborator traits the pair controller drives.
//!
//! Implementations must bound every call with a timeout and map failures
//! onto [`DeviceError`] instead of swallowing them.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use artsync_core::activity::SourceReport;
use artsync_core::types::DisplayState;

use crate::error::DeviceResult;

/// The display whose art mode is being managed.
#[async_trait]
pub trait DisplayDevice: Send + Sync + 'static {
    /// Network address; used to reject two pairs sharing one display.
    fn address(&self) -> &str;

    /// Current art-mode state. `Ok(Unknown)` when the display answers but
    /// cannot tell.
    async fn read_art_state(&self) -> DeviceResult<DisplayState>;

    /// Send an art-mode change. `Ok(true)` only acknowledges the send; the
    /// caller still has to verify.
    async fn set_art_state(&self, on: bool) -> DeviceResult<bool>;

    async fn power_toggle(&self) -> DeviceResult<bool>;

    /// Select an input by remote key name, e.g. `KEY_HDMI1`.
    async fn set_input(&self, key: &str) -> DeviceResult<bool>;

    /// Cheap reachability check (e.g. TCP connect). Never errors.
    async fn reachable(&self) -> bool;

    /// Broadcast a wake packet for `mac` to `broadcast`.
    async fn wake_broadcast(&self, mac: &str, broadcast: &str) -> DeviceResult<bool>;

    /// Drop and re-establish the control session.
    async fn reconnect(&self) -> DeviceResult<()>;

    async fn disconnect(&self);
}

/// An established link to the source device.
pub struct SourceSession {
    pub initial: SourceReport,
    /// Push updates. The channel closing means the link was lost.
    pub updates: mpsc::Receiver<SourceReport>,
}

impl std::fmt::Debug for SourceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSession")
            .field("initial", &self.initial)
            .finish_non_exhaustive()
    }
}

/// The streaming device whose activity drives the display.
#[async_trait]
pub trait SourceDevice: Send + Sync + 'static {
    /// Connect and return the initial reading plus the update stream.
    /// [`DeviceError::AuthRequired`](crate::DeviceError::AuthRequired)
    /// means re-pairing is needed.
    async fn connect(&self) -> DeviceResult<SourceSession>;

    async fn disconnect(&self);
}

/// Remote-control path used as the primary wake method.
#[async_trait]
pub trait RemoteWake: Send + Sync + 'static {
    async fn send_wake_command(&self, target: &str) -> DeviceResult<()>;
}

/// Household presence as a raw state string. The receiver carries both
/// the current value and change notifications.
pub trait PresenceSource: Send + Sync + 'static {
    fn subscribe(&self) -> watch::Receiver<Option<String>>;
}
