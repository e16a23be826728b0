//! Display adapter that drives the panel through external commands.
//!
//! Each operation is an argv from the config; art state and input keys are
//! appended as trailing arguments. Reachability is a plain TCP connect to
//! the control ports.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use artsync_core::types::DisplayState;

use crate::error::{DeviceError, DeviceResult};
use crate::process::CommandSpec;
use crate::traits::DisplayDevice;
use crate::wol;

/// Per-port connect timeout for the reachability check.
const REACH_TIMEOUT: Duration = Duration::from_secs(1);
/// Secure control port first, then the legacy one.
pub const DEFAULT_REACH_PORTS: [u16; 2] = [8002, 8001];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayCommands {
    /// Prints `on`, `off` or `unknown`.
    pub read_art: CommandSpec,
    /// Called with a trailing `on` / `off`.
    pub set_art: CommandSpec,
    pub power_toggle: CommandSpec,
    /// Called with a trailing key such as `KEY_HDMI1`.
    pub set_input: Option<CommandSpec>,
    /// Forces the adapter to drop a cached session.
    pub reconnect: Option<CommandSpec>,
}

pub struct CommandDisplay {
    address: String,
    reach_ports: Vec<u16>,
    commands: DisplayCommands,
    timeout: Duration,
}

impl CommandDisplay {
    pub fn new(address: impl Into<String>, commands: DisplayCommands, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            reach_ports: DEFAULT_REACH_PORTS.to_vec(),
            commands,
            timeout,
        }
    }

    #[must_use]
    pub fn with_reach_ports(mut self, ports: Vec<u16>) -> Self {
        if !ports.is_empty() {
            self.reach_ports = ports;
        }
        self
    }

    async fn ack(&self, spec: &CommandSpec, extra: &[&str]) -> DeviceResult<bool> {
        spec.run(extra, self.timeout).await?;
        Ok(true)
    }
}

#[async_trait]
impl DisplayDevice for CommandDisplay {
    fn address(&self) -> &str {
        &self.address
    }

    async fn read_art_state(&self) -> DeviceResult<DisplayState> {
        let out = self.commands.read_art.run(&[], self.timeout).await?;
        let line = out.lines().last().unwrap_or("");
        line.parse::<DisplayState>()
            .map_err(DeviceError::from_transport)
    }

    async fn set_art_state(&self, on: bool) -> DeviceResult<bool> {
        let arg = if on { "on" } else { "off" };
        self.ack(&self.commands.set_art, &[arg]).await
    }

    async fn power_toggle(&self) -> DeviceResult<bool> {
        self.ack(&self.commands.power_toggle, &[]).await
    }

    async fn set_input(&self, key: &str) -> DeviceResult<bool> {
        match &self.commands.set_input {
            Some(spec) => self.ack(spec, &[key]).await,
            None => Err(DeviceError::Unsupported("set_input")),
        }
    }

    async fn reachable(&self) -> bool {
        for &port in &self.reach_ports {
            let target = (self.address.as_str(), port);
            match tokio::time::timeout(REACH_TIMEOUT, TcpStream::connect(target)).await {
                Ok(Ok(_)) => {
                    tracing::debug!(address = %self.address, port, "display reachable");
                    return true;
                }
                Ok(Err(e)) => {
                    tracing::debug!(address = %self.address, port, "reachability check failed: {e}");
                }
                Err(_) => {
                    tracing::debug!(address = %self.address, port, "reachability check timed out");
                }
            }
        }
        false
    }

    async fn wake_broadcast(&self, mac: &str, broadcast: &str) -> DeviceResult<bool> {
        wol::send_magic_packet(mac, broadcast).await?;
        Ok(true)
    }

    async fn reconnect(&self) -> DeviceResult<()> {
        if let Some(spec) = &self.commands.reconnect {
            spec.run(&[], self.timeout).await?;
        }
        Ok(())
    }

    async fn disconnect(&self) {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    fn display(read: &str) -> CommandDisplay {
        CommandDisplay::new(
            "127.0.0.1",
            DisplayCommands {
                read_art: sh(read),
                set_art: sh("test \"$0\" = on || test \"$0\" = off"),
                power_toggle: sh("true"),
                set_input: None,
                reconnect: None,
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn reads_last_line_of_output() {
        let d = display("echo connecting; echo on");
        assert_eq!(d.read_art_state().await.unwrap(), DisplayState::On);
        let d = display("echo unknown");
        assert_eq!(d.read_art_state().await.unwrap(), DisplayState::Unknown);
    }

    #[tokio::test]
    async fn garbage_state_is_transport_error() {
        let d = display("echo maybe");
        assert!(matches!(d.read_art_state().await, Err(DeviceError::Transport(_))));
    }

    #[tokio::test]
    async fn set_art_passes_state_argument() {
        let d = display("echo on");
        assert!(d.set_art_state(true).await.unwrap());
        assert!(d.set_art_state(false).await.unwrap());
    }

    #[tokio::test]
    async fn input_unsupported_without_command() {
        let d = display("echo on");
        assert_eq!(
            d.set_input("KEY_HDMI1").await.unwrap_err(),
            DeviceError::Unsupported("set_input")
        );
    }

    #[tokio::test]
    async fn reachable_when_listener_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let d = display("echo on").with_reach_ports(vec![port]);
        assert!(d.reachable().await);
        drop(listener);
        let closed = display("echo on").with_reach_ports(vec![port]);
        assert!(!closed.reachable().await);
    }
}
