//! Runtime config file: pair settings plus the device adapters behind them.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use artsync_core::{ConfigError, PairConfig};
use artsync_daemon::PairDevices;
use artsync_device::{
    CommandDisplay, CommandPresence, CommandRemote, CommandSource, CommandSpec, DisplayCommands,
    PresenceSource, RemoteWake,
};

// ---- Constants ----

const SOURCE_CONNECT_TIMEOUT: Duration = Duration::from_secs(35);
const DEFAULT_PRESENCE_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default, rename = "pair")]
    pub pairs: Vec<PairEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairEntry {
    pub id: String,
    #[serde(default)]
    pub settings: PairConfig,
    pub devices: DevicesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevicesConfig {
    pub display: DisplayEntry,
    pub source: SourceEntry,
    pub presence: Option<PresenceEntry>,
    pub remote: Option<RemoteEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayEntry {
    /// Host or IP; also the identity that pairs must not share.
    pub address: String,
    #[serde(default)]
    pub reach_ports: Vec<u16>,
    pub commands: DisplayCommands,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
    /// Long-running watcher printing one JSON report per line.
    pub watch: CommandSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceEntry {
    pub query: CommandSpec,
    #[serde(default = "default_presence_interval")]
    pub interval_secs: u64,
}

fn default_presence_interval() -> u64 {
    DEFAULT_PRESENCE_INTERVAL_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteEntry {
    /// Called with the pair's `wake_target` as trailing argument.
    pub send: CommandSpec,
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Per-pair validation plus the cross-pair rules: unique ids, and no
    /// two pairs driving the same display.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        let mut displays: BTreeMap<&str, &str> = BTreeMap::new();
        for pair in &self.pairs {
            if pair.id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "id",
                    detail: "pair id must not be empty".into(),
                });
            }
            if !ids.insert(pair.id.as_str()) {
                return Err(ConfigError::DuplicatePair(pair.id.clone()));
            }
            let address = pair.devices.display.address.as_str();
            if let Some(first) = displays.insert(address, pair.id.as_str()) {
                return Err(ConfigError::SharedDisplay {
                    address: address.to_string(),
                    first: first.to_string(),
                    second: pair.id.clone(),
                });
            }
            pair.settings.validate()?;
        }
        Ok(())
    }

    pub fn pair(&self, id: &str) -> Option<&PairEntry> {
        self.pairs.iter().find(|p| p.id == id)
    }
}

impl PairEntry {
    /// Instantiate the command-driven adapters. Must run inside a tokio
    /// runtime: the presence poller starts immediately.
    pub fn build_devices(&self) -> PairDevices {
        let timeout = Duration::from_secs(self.settings.command_timeout_secs);
        let d = &self.devices;

        let display = CommandDisplay::new(d.display.address.clone(), d.display.commands.clone(), timeout)
            .with_reach_ports(d.display.reach_ports.clone());
        let source = CommandSource::new(d.source.watch.clone(), SOURCE_CONNECT_TIMEOUT);
        let presence = d.presence.as_ref().map(|p| {
            Arc::new(CommandPresence::spawn(
                p.query.clone(),
                Duration::from_secs(p.interval_secs.max(1)),
                timeout,
            )) as Arc<dyn PresenceSource>
        });
        let remote = d
            .remote
            .as_ref()
            .map(|r| Arc::new(CommandRemote::new(r.send.clone(), timeout)) as Arc<dyn RemoteWake>);

        PairDevices {
            display: Arc::new(display),
            source: Arc::new(source),
            presence,
            remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[pair]]
        id = "living-room"

        [pair.settings]
        active_start = "07:00"
        active_end = "23:30"
        return_delay_secs = 15

        [pair.devices.display]
        address = "192.168.1.40"
        commands.read_art = ["frame-ctl", "192.168.1.40", "art-status"]
        commands.set_art = ["frame-ctl", "192.168.1.40", "art"]
        commands.power_toggle = ["frame-ctl", "192.168.1.40", "key", "KEY_POWER"]

        [pair.devices.source]
        watch = ["source-watch", "--host", "192.168.1.41"]

        [[pair]]
        id = "bedroom"

        [pair.devices.display]
        address = "192.168.1.50"
        commands.read_art = ["frame-ctl", "192.168.1.50", "art-status"]
        commands.set_art = ["frame-ctl", "192.168.1.50", "art"]
        commands.power_toggle = ["frame-ctl", "192.168.1.50", "key", "KEY_POWER"]

        [pair.devices.source]
        watch = ["source-watch", "--host", "192.168.1.51"]

        [pair.devices.presence]
        query = ["presence-query", "person.alex"]
    "#;

    #[test]
    fn parses_sample() {
        let cfg = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.pairs.len(), 2);
        let living = cfg.pair("living-room").unwrap();
        assert_eq!(living.settings.return_delay_secs, 15);
        assert_eq!(living.settings.cooldown_secs, 30);
        assert_eq!(living.devices.display.commands.set_input, None);
        let bedroom = cfg.pair("bedroom").unwrap();
        assert_eq!(bedroom.settings, PairConfig::default());
        assert_eq!(
            bedroom.devices.presence.as_ref().map(|p| p.interval_secs),
            Some(DEFAULT_PRESENCE_INTERVAL_SECS)
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let text = SAMPLE.replace("id = \"bedroom\"", "id = \"living-room\"");
        let err = RuntimeConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePair(id) if id == "living-room"));
    }

    #[test]
    fn rejects_shared_display() {
        let text = SAMPLE.replace("address = \"192.168.1.50\"", "address = \"192.168.1.40\"");
        let err = RuntimeConfig::from_toml_str(&text).unwrap_err();
        match err {
            ConfigError::SharedDisplay { first, second, .. } => {
                assert_eq!(first, "living-room");
                assert_eq!(second, "bedroom");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn rejects_invalid_pair_settings() {
        let text = SAMPLE.replace("return_delay_secs = 15", "max_commands_per_5min = 0");
        assert!(matches!(
            RuntimeConfig::from_toml_str(&text),
            Err(ConfigError::InvalidValue { field: "max_commands_per_5min", .. })
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        let text = SAMPLE.replace("return_delay_secs = 15", "retrun_delay_secs = 15");
        assert!(matches!(RuntimeConfig::from_toml_str(&text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_empty_command() {
        let text = SAMPLE.replace(
            "watch = [\"source-watch\", \"--host\", \"192.168.1.41\"]",
            "watch = []",
        );
        assert!(RuntimeConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artsync.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = RuntimeConfig::load(&path).unwrap();
        assert_eq!(cfg.pairs.len(), 2);
        assert!(matches!(
            RuntimeConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn shipped_example_is_valid() {
        let cfg = RuntimeConfig::from_toml_str(include_str!("../../../artsync.example.toml")).unwrap();
        let pair = cfg.pair("living-room").unwrap();
        assert!(pair.settings.enable_wol_fallback);
        assert!(pair.devices.remote.is_some());
        assert!(pair.devices.display.commands.set_input.is_some());
    }

    #[test]
    fn empty_file_has_no_pairs() {
        let cfg = RuntimeConfig::from_toml_str("").unwrap();
        assert!(cfg.pairs.is_empty());
    }
}
