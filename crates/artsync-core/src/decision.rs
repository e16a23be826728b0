//! Decision engine: signals in, desired display mode out.
//!
//! Pure functions only. Presence policy takes precedence over the active
//! time window, which takes precedence over the night behavior.

use std::fmt;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::types::{DesiredMode, Presence};

// ─── Policies ─────────────────────────────────────────────────────

/// What to do outside the active window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NightBehavior {
    #[default]
    ForceOff,
    ForceArt,
    /// Compute a mode for display, never enforce it.
    DoNothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceMode {
    #[default]
    Disabled,
    Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwayPolicy {
    #[default]
    Disabled,
    TurnOff,
    KeepArt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownBehavior {
    #[default]
    Ignore,
    TreatAsHome,
    TreatAsAway,
}

// ─── Time Window ──────────────────────────────────────────────────

/// Wall-clock time of day, serialized as `HH:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(pub NaiveTime);

impl TimeOfDay {
    /// Parse `HH:MM` or `HH:MM:SS`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(format!("invalid time of day: {s:?} (expected HH:MM or HH:MM:SS)"));
        }
        let field = |p: &str| p.parse::<u32>().map_err(|_| format!("invalid time of day: {s:?}"));
        let hour = field(parts[0])?;
        let minute = field(parts[1])?;
        let second = match parts.get(2) {
            Some(p) => field(p)?,
            None => 0,
        };
        NaiveTime::from_hms_opt(hour, minute, second)
            .map(Self)
            .ok_or_else(|| format!("time of day out of range: {s:?}"))
    }

    pub fn hms(h: u32, m: u32, s: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(h, m, s).map(Self)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.0.hour(),
            self.0.minute(),
            self.0.second()
        )
    }
}

/// Configured active window. Crosses midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl ActiveWindow {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { start, end }
    }

    /// Inclusive at both ends.
    pub fn contains(&self, now: NaiveTime) -> bool {
        let (start, end) = (self.start.0, self.end.0);
        if start <= end {
            start <= now && now <= end
        } else {
            now >= start || now <= end
        }
    }
}

// ─── Presence ─────────────────────────────────────────────────────

/// Map a raw presence string onto home/away/unknown using the configured
/// state lists (case-insensitive). `None` means no reading is available.
pub fn classify_presence(raw: Option<&str>, home_states: &[String], away_states: &[String]) -> Presence {
    let Some(raw) = raw else {
        return Presence::Unknown;
    };
    let value = raw.trim().to_ascii_lowercase();
    if home_states.iter().any(|s| s.eq_ignore_ascii_case(&value)) {
        Presence::Home
    } else if away_states.iter().any(|s| s.eq_ignore_ascii_case(&value)) {
        Presence::Away
    } else {
        Presence::Unknown
    }
}

// ─── Decision ─────────────────────────────────────────────────────

/// Everything the decision engine looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionInputs {
    pub source_active: bool,
    pub in_window: bool,
    pub night_behavior: NightBehavior,
    pub presence_mode: PresenceMode,
    pub presence: Presence,
    pub away_policy: AwayPolicy,
    pub unknown_behavior: UnknownBehavior,
}

/// A computed mode plus whether the caller may enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub mode: DesiredMode,
    /// Set only for [`NightBehavior::DoNothing`] outside the window: the
    /// mode is informational and must not be enforced.
    pub advisory: bool,
}

pub fn decide(inputs: &DecisionInputs) -> Decision {
    let enforced = |mode| Decision { mode, advisory: false };

    if inputs.presence_mode == PresenceMode::Entity {
        let away = match inputs.presence {
            Presence::Away => true,
            Presence::Unknown => inputs.unknown_behavior == UnknownBehavior::TreatAsAway,
            Presence::Home => false,
        };
        if away {
            match inputs.away_policy {
                AwayPolicy::TurnOff => return enforced(DesiredMode::Off),
                AwayPolicy::KeepArt => return enforced(DesiredMode::Art),
                AwayPolicy::Disabled => {}
            }
        }
    }

    let follow_source = if inputs.source_active {
        DesiredMode::Source
    } else {
        DesiredMode::Art
    };

    if inputs.in_window {
        return enforced(follow_source);
    }

    match inputs.night_behavior {
        NightBehavior::ForceOff => enforced(DesiredMode::Off),
        NightBehavior::ForceArt => enforced(DesiredMode::Art),
        NightBehavior::DoNothing => Decision {
            mode: follow_source,
            advisory: true,
        },
    }
}
