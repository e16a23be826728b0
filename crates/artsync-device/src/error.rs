//! Error types for device collaborators.

use std::time::Duration;

use thiserror::Error;

/// Marker carried by protocol-level session events that arrive in place of
/// a real response on a stale connection.
const SESSION_EVENT_MARKER: &str = "ms.channel";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device call timed out after {0:?}")]
    Timeout(Duration),

    /// Pairing or credentials rejected. Not retried automatically.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Stale session: warrants exactly one forced reconnect-and-retry.
    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    pub fn is_session_expiry(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }

    /// Classify a transport failure message, promoting session-event
    /// payloads to [`DeviceError::SessionExpired`].
    pub fn from_transport(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if looks_like_session_expiry(&detail) {
            Self::SessionExpired(detail)
        } else {
            Self::Transport(detail)
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::Transport(format!("timed out: {e}")),
            _ => Self::Transport(e.to_string()),
        }
    }
}

/// Whether a payload looks like a protocol session event rather than a
/// genuine response.
pub fn looks_like_session_expiry(payload: &str) -> bool {
    payload.contains(SESSION_EVENT_MARKER)
}
