use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── Modes & Display State ────────────────────────────────────────

/// Visual mode the display should be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredMode {
    /// Ambient art display.
    Art,
    /// Passthrough of the source device.
    Source,
    /// Fully off.
    Off,
}

impl DesiredMode {
    /// Art-mode reading that satisfies this mode.
    ///
    /// `Source` and `Off` both expect art mode to read `Off`; the power
    /// state itself is not observable through the art-mode channel.
    pub fn expected_display(self) -> DisplayState {
        match self {
            Self::Art => DisplayState::On,
            Self::Source | Self::Off => DisplayState::Off,
        }
    }

    /// Whether `actual` already satisfies this mode.
    pub fn is_satisfied_by(self, actual: DisplayState) -> bool {
        actual != DisplayState::Unknown && actual == self.expected_display()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Art => "art",
            Self::Source => "source",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for DesiredMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Art-mode state as read from the display. Stale as soon as a command is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    On,
    Off,
    #[default]
    Unknown,
}

impl DisplayState {
    pub fn from_bool(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisplayState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Ok(Self::On),
            "off" | "false" | "0" => Ok(Self::Off),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(format!("unknown display state: {other}")),
        }
    }
}

// ─── Source Device Signals ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Paused,
    Loading,
    Seeking,
    Idle,
    #[default]
    Unknown,
}

impl PlaybackState {
    /// Loading and seeking count as playing for activity purposes.
    pub fn is_playing_like(self) -> bool {
        matches!(self, Self::Playing | Self::Loading | Self::Seeking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Loading => "loading",
            Self::Seeking => "seeking",
            Self::Idle => "idle",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for PlaybackState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "playing" => Ok(Self::Playing),
            "paused" => Ok(Self::Paused),
            "loading" => Ok(Self::Loading),
            "seeking" => Ok(Self::Seeking),
            "idle" | "stopped" => Ok(Self::Idle),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(format!("unknown playback state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

impl FromStr for PowerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "unknown" | "" => Ok(Self::Unknown),
            other => Err(format!("unknown power state: {other}")),
        }
    }
}

/// Classified household presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Home,
    Away,
    #[default]
    Unknown,
}

// ─── Controller State ─────────────────────────────────────────────

/// Phase of the pair controller state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    SwitchingToSource,
    ReturningToDisplay,
    ManualOverride,
    Degraded,
    BreakerOpen,
    DryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Ok,
    Degraded,
    BreakerOpen,
}

/// What caused an enforcement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Startup,
    Activity,
    Presence,
    TimeWindow,
    ReturnDelay,
    Resync,
    Manual,
    OverrideCleared,
    Reconfigure,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Activity => "activity",
            Self::Presence => "presence",
            Self::TimeWindow => "time_window",
            Self::ReturnDelay => "return_delay",
            Self::Resync => "resync",
            Self::Manual => "manual",
            Self::OverrideCleared => "override_cleared",
            Self::Reconfigure => "reconfigure",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Enforcement,
    Manual,
    Drift,
    Override,
    Breaker,
    Wake,
    Connection,
    Config,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enforcement => "enforcement",
            Self::Manual => "manual",
            Self::Drift => "drift",
            Self::Override => "override",
            Self::Breaker => "breaker",
            Self::Wake => "wake",
            Self::Connection => "connection",
            Self::Config => "config",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Success,
    Failure,
    Skipped,
    DryRun,
    Info,
}

impl ActionResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
            Self::DryRun => "dry_run",
            Self::Info => "info",
        }
    }
}
