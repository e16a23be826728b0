//! Source adapter backed by a long-running watcher process.
//!
//! The watcher prints one JSON object per line:
//! `{"playback": "playing", "power": "on"}`. The first line is the initial
//! reading; EOF or a dead child means the link is lost. A line of the form
//! `{"error": "not_paired"}`, or exit status 77 before the first line,
//! reports rejected pairing.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{Mutex, mpsc, oneshot};

use artsync_core::activity::SourceReport;
use artsync_core::types::{PlaybackState, PowerState};

use crate::error::{DeviceError, DeviceResult};
use crate::process::{CommandSpec, EXIT_AUTH_REQUIRED};
use crate::traits::{SourceDevice, SourceSession};

/// Capacity of the per-session update channel.
const UPDATE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Deserialize)]
struct WatcherLine {
    #[serde(default)]
    playback: Option<String>,
    #[serde(default)]
    power: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse one watcher line. Unknown state strings fall back to `Unknown`.
pub fn parse_watcher_line(line: &str) -> DeviceResult<SourceReport> {
    let parsed: WatcherLine = serde_json::from_str(line)
        .map_err(|e| DeviceError::Transport(format!("bad watcher line {line:?}: {e}")))?;
    if let Some(err) = parsed.error {
        if err == "not_paired" || err == "auth" {
            return Err(DeviceError::AuthRequired(err));
        }
        return Err(DeviceError::from_transport(err));
    }
    Ok(SourceReport {
        playback: parsed
            .playback
            .and_then(|p| p.parse::<PlaybackState>().ok())
            .unwrap_or_default(),
        power: parsed
            .power
            .and_then(|p| p.parse::<PowerState>().ok())
            .unwrap_or_default(),
    })
}

pub struct CommandSource {
    watch: CommandSpec,
    connect_timeout: Duration,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl CommandSource {
    pub fn new(watch: CommandSpec, connect_timeout: Duration) -> Self {
        Self {
            watch,
            connect_timeout,
            stop: Mutex::new(None),
        }
    }

    async fn first_report(
        child: &mut Child,
        lines: &mut tokio::io::Lines<BufReader<ChildStdout>>,
    ) -> DeviceResult<SourceReport> {
        match lines.next_line().await? {
            Some(line) => parse_watcher_line(&line),
            None => {
                let status = child.wait().await?;
                if status.code() == Some(EXIT_AUTH_REQUIRED) {
                    return Err(DeviceError::AuthRequired("watcher reported not paired".into()));
                }
                Err(DeviceError::Transport(format!(
                    "watcher exited before first report ({status})"
                )))
            }
        }
    }
}

#[async_trait]
impl SourceDevice for CommandSource {
    async fn connect(&self) -> DeviceResult<SourceSession> {
        self.disconnect().await;

        let mut cmd = self.watch.command(&[]);
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| {
            DeviceError::Transport(format!("failed to spawn {}: {e}", self.watch.program()))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Transport("watcher stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let initial = match tokio::time::timeout(
            self.connect_timeout,
            Self::first_report(&mut child, &mut lines),
        )
        .await
        {
            Ok(report) => report?,
            Err(_) => return Err(DeviceError::Timeout(self.connect_timeout)),
        };

        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.stop.lock().await = Some(stop_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match parse_watcher_line(&line) {
                            Ok(report) => {
                                if tx.send(report).await.is_err() {
                                    break;
                                }
                            }
                            Err(DeviceError::AuthRequired(_)) => break,
                            Err(e) => tracing::debug!("ignoring watcher line: {e}"),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!("watcher read error: {e}");
                            break;
                        }
                    },
                }
            }
            let _ = child.kill().await;
        });

        Ok(SourceSession { initial, updates: rx })
    }

    async fn disconnect(&self) {
        if let Some(stop) = self.stop.lock().await.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lines() {
        let r = parse_watcher_line(r#"{"playback":"Playing","power":"on"}"#).unwrap();
        assert_eq!(r.playback, PlaybackState::Playing);
        assert_eq!(r.power, PowerState::On);
        let r = parse_watcher_line(r#"{"playback":"weird"}"#).unwrap();
        assert_eq!(r.playback, PlaybackState::Unknown);
        assert_eq!(r.power, PowerState::Unknown);
        assert!(matches!(
            parse_watcher_line(r#"{"error":"not_paired"}"#),
            Err(DeviceError::AuthRequired(_))
        ));
        assert!(parse_watcher_line("not json").is_err());
    }

    #[cfg(unix)]
    fn sh(script: &str) -> CommandSource {
        CommandSource::new(CommandSpec::new("sh", ["-c", script]), Duration::from_secs(5))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_updates_until_eof() {
        let source = sh(r#"echo '{"playback":"idle"}'; echo '{"playback":"playing"}'; echo '{"playback":"paused"}'"#);
        let mut session = source.connect().await.unwrap();
        assert_eq!(session.initial.playback, PlaybackState::Idle);
        assert_eq!(session.updates.recv().await.unwrap().playback, PlaybackState::Playing);
        assert_eq!(session.updates.recv().await.unwrap().playback, PlaybackState::Paused);
        assert!(session.updates.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_77_is_auth_required() {
        let err = sh("exit 77").connect().await.unwrap_err();
        assert!(matches!(err, DeviceError::AuthRequired(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_watcher_times_out() {
        let source = CommandSource::new(
            CommandSpec::new("sh", ["-c", "sleep 5"]),
            Duration::from_millis(100),
        );
        assert_eq!(
            source.connect().await.unwrap_err(),
            DeviceError::Timeout(Duration::from_millis(100))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn disconnect_closes_stream() {
        let source = sh(r#"echo '{"playback":"playing"}'; sleep 30"#);
        let mut session = source.connect().await.unwrap();
        source.disconnect().await;
        assert!(session.updates.recv().await.is_none());
    }
}
