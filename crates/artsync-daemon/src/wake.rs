//! Wake orchestrator: remote-control wake first, broadcast wake second.
//!
//! Only invoked when the display cannot be read and does not answer a
//! reachability check.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use artsync_core::config::PairConfig;
use artsync_device::RemoteWake;

use crate::executor::DisplayExecutor;

/// Per-call timeout for the remote-wake collaborator.
pub const REMOTE_WAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeSettings {
    pub remote_target: Option<String>,
    pub remote_retries: u32,
    pub remote_delay: Duration,
    pub wol_mac: Option<String>,
    pub wol_broadcast: String,
    pub wol_retries: u32,
    pub wol_delay: Duration,
}

impl WakeSettings {
    /// Disabled methods come out as `None` targets.
    pub fn from_config(cfg: &PairConfig) -> Self {
        Self {
            remote_target: cfg
                .wake_target
                .clone()
                .filter(|_| cfg.enable_remote_wake),
            remote_retries: cfg.remote_wake_retries.max(1),
            remote_delay: Duration::from_secs(cfg.remote_wake_delay_secs),
            wol_mac: cfg.wol_mac.clone().filter(|_| cfg.enable_wol_fallback),
            wol_broadcast: cfg.wol_broadcast.clone(),
            wol_retries: cfg.wol_retries.max(1),
            wol_delay: Duration::from_secs(cfg.wol_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeMethod {
    Remote,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeReport {
    pub reachable: bool,
    /// Method that brought the display up.
    pub method: Option<WakeMethod>,
    pub remote_attempts: u32,
    pub broadcast_attempts: u32,
}

impl WakeReport {
    /// Short human summary, e.g. `remote=failed, wol=attempted`.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.remote_attempts > 0 {
            let ok = self.method == Some(WakeMethod::Remote);
            parts.push(format!("remote={}", if ok { "success" } else { "failed" }));
        }
        if self.broadcast_attempts > 0 {
            let ok = self.method == Some(WakeMethod::Broadcast);
            parts.push(format!("wol={}", if ok { "success" } else { "attempted" }));
        }
        if parts.is_empty() {
            "no wake method configured".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Try to bring the display up. Returns as soon as the display is reachable.
pub async fn bring_up(
    pair: &str,
    exec: &DisplayExecutor,
    remote: Option<&Arc<dyn RemoteWake>>,
    settings: &WakeSettings,
) -> WakeReport {
    let mut report = WakeReport {
        reachable: false,
        method: None,
        remote_attempts: 0,
        broadcast_attempts: 0,
    };

    if let (Some(remote), Some(target)) = (remote, settings.remote_target.as_deref()) {
        for attempt in 1..=settings.remote_retries {
            report.remote_attempts = attempt;
            let sent = match tokio::time::timeout(REMOTE_WAKE_TIMEOUT, remote.send_wake_command(target)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(pair, attempt, "remote wake failed: {e}");
                    false
                }
                Err(_) => {
                    warn!(pair, attempt, "remote wake timed out");
                    false
                }
            };
            tokio::time::sleep(settings.remote_delay).await;
            if sent && exec.reachable().await {
                info!(pair, attempt, "display reachable after remote wake");
                report.reachable = true;
                report.method = Some(WakeMethod::Remote);
                return report;
            }
        }
    } else {
        debug!(pair, "remote wake not configured");
    }

    if let Some(mac) = settings.wol_mac.as_deref() {
        for attempt in 1..=settings.wol_retries {
            report.broadcast_attempts = attempt;
            let sent = tokio::time::timeout(
                REMOTE_WAKE_TIMEOUT,
                exec.display().wake_broadcast(mac, &settings.wol_broadcast),
            )
            .await;
            match sent {
                Ok(Ok(_)) => debug!(pair, attempt, "wake packet sent"),
                Ok(Err(e)) => warn!(pair, attempt, "wake packet failed: {e}"),
                Err(_) => warn!(pair, attempt, "wake packet timed out"),
            }
            tokio::time::sleep(settings.wol_delay).await;
            if exec.reachable().await {
                info!(pair, attempt, "display reachable after wake packet");
                report.reachable = true;
                report.method = Some(WakeMethod::Broadcast);
                return report;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use artsync_device::fake::{DisplayCall, FakeDisplay, FakeRemote};

    fn settings() -> WakeSettings {
        WakeSettings {
            remote_target: Some("media_player.frame".into()),
            remote_retries: 2,
            remote_delay: Duration::from_secs(3),
            wol_mac: Some("00:11:22:33:44:55".into()),
            wol_broadcast: "255.255.255.255".into(),
            wol_retries: 3,
            wol_delay: Duration::from_secs(2),
        }
    }

    fn exec(d: &Arc<FakeDisplay>) -> DisplayExecutor {
        DisplayExecutor::new("den", d.clone(), Duration::from_secs(1), Duration::from_secs(8))
    }

    #[tokio::test(start_paused = true)]
    async fn remote_wake_brings_display_up() {
        let d = FakeDisplay::new("10.0.0.7");
        d.set_reachable(false);
        let remote = FakeRemote::new();
        remote.wakes(d.clone());
        let remote: Arc<dyn RemoteWake> = remote;
        let report = bring_up("den", &exec(&d), Some(&remote), &settings()).await;
        assert!(report.reachable);
        assert_eq!(report.method, Some(WakeMethod::Remote));
        assert_eq!(report.remote_attempts, 1);
        assert!(!d.calls().contains(&DisplayCall::WakeBroadcast));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_broadcast() {
        let d = FakeDisplay::new("10.0.0.7");
        d.set_reachable(false);
        d.wake_on_broadcast(true);
        let fake = FakeRemote::new();
        fake.failing(true);
        let remote: Arc<dyn RemoteWake> = fake.clone();
        let report = bring_up("den", &exec(&d), Some(&remote), &settings()).await;
        assert!(report.reachable);
        assert_eq!(report.method, Some(WakeMethod::Broadcast));
        assert_eq!(fake.calls().len(), 2);
        assert_eq!(report.summary(), "remote=failed, wol=success");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_all_retries() {
        let d = FakeDisplay::new("10.0.0.7");
        d.set_reachable(false);
        let report = bring_up("den", &exec(&d), None, &settings()).await;
        assert!(!report.reachable);
        assert_eq!(report.remote_attempts, 0);
        assert_eq!(report.broadcast_attempts, 3);
    }

    #[test]
    fn disabled_methods_have_no_target() {
        let cfg = PairConfig {
            wake_target: Some("remote.frame".into()),
            enable_remote_wake: false,
            wol_mac: Some("00:11:22:33:44:55".into()),
            ..PairConfig::default()
        };
        let s = WakeSettings::from_config(&cfg);
        assert_eq!(s.remote_target, None);
        assert_eq!(s.wol_mac, None);
    }
}
