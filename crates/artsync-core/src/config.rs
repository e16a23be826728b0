//! Per-pair configuration with TOML loading and validation.
//!
//! Every field has a default so a pair table may list only what it changes.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::activity::{ActiveMode, ActivityTiming};
use crate::decision::{ActiveWindow, AwayPolicy, NightBehavior, PresenceMode, TimeOfDay, UnknownBehavior};
use crate::drift::DriftLimits;
use crate::governor::GovernorLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {detail}")]
    InvalidValue { field: &'static str, detail: String },

    #[error("invalid MAC address: {0:?}")]
    InvalidMac(String),

    #[error("duplicate pair id: {0}")]
    DuplicatePair(String),

    #[error("pairs `{first}` and `{second}` share display {address}")]
    SharedDisplay {
        address: String,
        first: String,
        second: String,
    },

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Display input to select after switching to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    None,
    #[default]
    Hdmi1,
    Hdmi2,
    Hdmi3,
}

impl InputSource {
    /// Remote key name for the input, `None` when switching is disabled.
    pub fn key(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Hdmi1 => Some("KEY_HDMI1"),
            Self::Hdmi2 => Some("KEY_HDMI2"),
            Self::Hdmi3 => Some("KEY_HDMI3"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Hdmi1 => "hdmi1",
            Self::Hdmi2 => "hdmi2",
            Self::Hdmi3 => "hdmi3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PairConfig {
    pub enabled: bool,
    pub dry_run: bool,

    // ── decision ──
    pub active_start: TimeOfDay,
    pub active_end: TimeOfDay,
    pub night_behavior: NightBehavior,
    pub presence_mode: PresenceMode,
    pub home_states: Vec<String>,
    pub away_states: Vec<String>,
    pub unknown_behavior: UnknownBehavior,
    pub away_policy: AwayPolicy,

    // ── activity ──
    pub active_mode: ActiveMode,
    pub debounce_secs: u64,
    pub grace_secs: u64,
    pub return_delay_secs: u64,

    // ── governor ──
    pub cooldown_secs: u64,
    pub max_commands_per_5min: u32,
    pub breaker_cooldown_minutes: u64,

    // ── drift ──
    pub resync_interval_secs: u64,
    pub max_drift_corrections_per_hour: u32,
    pub drift_correction_cooldown_secs: u64,
    pub override_minutes: u64,

    // ── startup ──
    pub startup_grace_secs: u64,
    pub wake_startup_grace_secs: u64,

    // ── wake ──
    pub enable_remote_wake: bool,
    /// Identifier handed to the remote-wake collaborator.
    pub wake_target: Option<String>,
    pub remote_wake_retries: u32,
    pub remote_wake_delay_secs: u64,
    pub enable_wol_fallback: bool,
    pub wol_mac: Option<String>,
    pub wol_retries: u32,
    pub wol_delay_secs: u64,
    pub wol_broadcast: String,

    // ── display ──
    pub input: InputSource,
    pub verify_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub manual_min_spacing_secs: u64,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            active_start: TimeOfDay(NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default()),
            active_end: TimeOfDay(NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default()),
            night_behavior: NightBehavior::ForceOff,
            presence_mode: PresenceMode::Disabled,
            home_states: vec!["home".into(), "on".into(), "true".into()],
            away_states: vec![
                "not_home".into(),
                "away".into(),
                "off".into(),
                "false".into(),
            ],
            unknown_behavior: UnknownBehavior::Ignore,
            away_policy: AwayPolicy::Disabled,
            active_mode: ActiveMode::PlayingOrPaused,
            debounce_secs: 2,
            grace_secs: 30,
            return_delay_secs: 10,
            cooldown_secs: 30,
            max_commands_per_5min: 10,
            breaker_cooldown_minutes: 15,
            resync_interval_secs: 60,
            max_drift_corrections_per_hour: 10,
            drift_correction_cooldown_secs: 60,
            override_minutes: 60,
            startup_grace_secs: 10,
            wake_startup_grace_secs: 120,
            enable_remote_wake: true,
            wake_target: None,
            remote_wake_retries: 2,
            remote_wake_delay_secs: 3,
            enable_wol_fallback: false,
            wol_mac: None,
            wol_retries: 3,
            wol_delay_secs: 2,
            wol_broadcast: "255.255.255.255".into(),
            input: InputSource::Hdmi1,
            verify_timeout_secs: 8,
            command_timeout_secs: 10,
            manual_min_spacing_secs: 2,
        }
    }
}

impl PairConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_commands_per_5min == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_commands_per_5min",
                detail: "must be at least 1".into(),
            });
        }
        if self.resync_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resync_interval_secs",
                detail: "must be at least 1".into(),
            });
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "command_timeout_secs",
                detail: "every device call needs a timeout".into(),
            });
        }
        if self.enable_wol_fallback {
            match self.wol_mac.as_deref() {
                None | Some("") => {
                    return Err(ConfigError::InvalidValue {
                        field: "wol_mac",
                        detail: "required when enable_wol_fallback is set".into(),
                    });
                }
                Some(mac) => {
                    parse_mac(mac)?;
                }
            }
        }
        if self.wol_broadcast.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "wol_broadcast",
                detail: format!("not an IPv4 address: {:?}", self.wol_broadcast),
            });
        }
        Ok(())
    }

    pub fn window(&self) -> ActiveWindow {
        ActiveWindow::new(self.active_start, self.active_end)
    }

    pub fn governor_limits(&self) -> GovernorLimits {
        GovernorLimits {
            cooldown_ms: self.cooldown_secs * 1_000,
            max_commands: self.max_commands_per_5min,
            breaker_ms: self.breaker_cooldown_minutes * 60_000,
        }
    }

    pub fn drift_limits(&self) -> DriftLimits {
        DriftLimits {
            max_corrections_per_hour: self.max_drift_corrections_per_hour,
            correction_cooldown_ms: self.drift_correction_cooldown_secs * 1_000,
            override_ms: self.override_minutes * 60_000,
        }
    }

    pub fn activity_timing(&self) -> ActivityTiming {
        ActivityTiming {
            debounce_ms: self.debounce_secs * 1_000,
            grace_ms: self.grace_secs * 1_000,
        }
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated) into six bytes.
pub fn parse_mac(s: &str) -> Result<[u8; 6], ConfigError> {
    let parts: Vec<&str> = s.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(ConfigError::InvalidMac(s.to_string()));
    }
    let mut mac = [0u8; 6];
    for (slot, part) in mac.iter_mut().zip(parts) {
        if part.len() != 2 {
            return Err(ConfigError::InvalidMac(s.to_string()));
        }
        *slot = u8::from_str_radix(part, 16).map_err(|_| ConfigError::InvalidMac(s.to_string()))?;
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_uses_defaults() {
        let cfg = PairConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, PairConfig::default());
        assert_eq!(cfg.active_start.to_string(), "06:00:00");
        assert_eq!(cfg.active_end.to_string(), "22:00:00");
        assert_eq!(cfg.governor_limits().breaker_ms, 15 * 60_000);
    }

    #[test]
    fn parses_overrides() {
        let cfg = PairConfig::from_toml_str(
            r#"
            active_start = "22:00"
            active_end = "06:30"
            night_behavior = "do_nothing"
            presence_mode = "entity"
            away_policy = "turn_off"
            active_mode = "power_on"
            input = "hdmi3"
            max_commands_per_5min = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.night_behavior, NightBehavior::DoNothing);
        assert_eq!(cfg.presence_mode, PresenceMode::Entity);
        assert_eq!(cfg.active_mode, ActiveMode::PowerOn);
        assert_eq!(cfg.input.key(), Some("KEY_HDMI3"));
        assert_eq!(cfg.governor_limits().max_commands, 4);
        let w = cfg.window();
        assert!(w.contains(NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
    }

    #[test]
    fn rejects_bad_time() {
        let err = PairConfig::from_toml_str(r#"active_start = "24:61""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_unknown_field() {
        assert!(PairConfig::from_toml_str("debounce = 3").is_err());
    }

    #[test]
    fn rejects_zero_thresholds() {
        let err = PairConfig::from_toml_str("max_commands_per_5min = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "max_commands_per_5min", .. }));
        let err = PairConfig::from_toml_str("resync_interval_secs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "resync_interval_secs", .. }));
    }

    #[test]
    fn wol_requires_valid_mac() {
        let err = PairConfig::from_toml_str("enable_wol_fallback = true").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "wol_mac", .. }));
        let err = PairConfig::from_toml_str(
            "enable_wol_fallback = true\nwol_mac = \"zz:00:11:22:33:44\"",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMac(_)));
        PairConfig::from_toml_str("enable_wol_fallback = true\nwol_mac = \"AA-BB-CC-00-11-22\"")
            .unwrap();
    }

    #[test]
    fn mac_parse() {
        assert_eq!(
            parse_mac("aa:bb:cc:00:11:22").unwrap(),
            [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]
        );
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("aaa:bb:cc:00:11:2").is_err());
    }
}
