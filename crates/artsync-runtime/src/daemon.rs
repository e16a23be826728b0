//! Daemon entry: loads pairs, serves the control socket, reloads on SIGHUP.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use artsync_daemon::{PairController, PairRegistry, SystemClock};

use crate::config::RuntimeConfig;
use crate::server::{self, SharedRegistry};

/// Run the daemon until ctrl-c or SIGTERM.
pub async fn run_daemon(config_path: &str, socket_path: &str) -> anyhow::Result<()> {
    let mut config = RuntimeConfig::load(config_path)
        .map_err(|e| anyhow::anyhow!("cannot load {config_path}: {e}"))?;
    if config.pairs.is_empty() {
        tracing::warn!("{config_path} defines no pairs");
    }

    let cancel = CancellationToken::new();
    let registry: SharedRegistry = Arc::new(RwLock::new(PairRegistry::with_cancel(
        Arc::new(SystemClock::new()),
        cancel.child_token(),
    )));
    {
        let mut reg = registry.write().await;
        for entry in &config.pairs {
            reg.spawn_pair(entry.id.clone(), entry.settings.clone(), entry.build_devices())?;
        }
    }

    let listener = server::bind(socket_path).await?;
    let mut server_handle = tokio::spawn(server::serve(
        listener,
        Arc::clone(&registry),
        cancel.child_token(),
    ));

    #[cfg(unix)]
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        #[cfg(unix)]
        let reload = sighup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = reload => {
                tracing::info!("received SIGHUP, reloading {config_path}");
                match RuntimeConfig::load(config_path) {
                    Ok(next) => {
                        apply_reload(&registry, &config, &next).await;
                        config = next;
                    }
                    Err(e) => tracing::error!("reload failed, keeping current config: {e}"),
                }
            }
            joined = &mut server_handle => {
                match joined {
                    Ok(Ok(())) => tracing::warn!("control socket exited unexpectedly"),
                    Ok(Err(e)) => tracing::error!("control socket failed: {e}"),
                    Err(e) => tracing::error!("control socket task panicked: {e}"),
                }
                break;
            }
        }
    }

    cancel.cancel();
    registry.write().await.shutdown_all().await;
    let _ = std::fs::remove_file(socket_path);
    tracing::info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        tracing::info!("received ctrl-c, shutting down");
    }

    Ok(())
}

/// Bring the running pairs in line with `next`. Pairs whose devices changed
/// are restarted; settings-only changes go through `reconfigure`, which keeps
/// the pair's counters. The registry lock is only held for map updates, never
/// while a pair finishes a command.
pub(crate) async fn apply_reload(registry: &SharedRegistry, current: &RuntimeConfig, next: &RuntimeConfig) {
    // Removals first so a display can move between pairs.
    let stopping: Vec<PairController> = {
        let mut reg = registry.write().await;
        reg.ids()
            .into_iter()
            .filter(|id| match (current.pair(id), next.pair(id)) {
                (Some(old), Some(new)) => old.devices != new.devices,
                (None, Some(_)) => false,
                (_, None) => true,
            })
            .filter_map(|id| reg.detach(&id))
            .collect()
    };
    for controller in &stopping {
        controller.shutdown().await;
        tracing::info!(pair = %controller.id(), "pair stopped for reload");
    }

    let mut changed = Vec::new();
    {
        let mut reg = registry.write().await;
        for entry in &next.pairs {
            match reg.get(&entry.id) {
                Some(controller) => {
                    let unchanged = current
                        .pair(&entry.id)
                        .is_some_and(|old| old.settings == entry.settings);
                    if !unchanged {
                        changed.push((controller.clone(), entry.settings.clone()));
                    }
                }
                None => {
                    if let Err(e) =
                        reg.spawn_pair(entry.id.clone(), entry.settings.clone(), entry.build_devices())
                    {
                        tracing::error!("cannot start pair: {e}");
                    }
                }
            }
        }
    }

    for (controller, settings) in changed {
        match controller.reconfigure(settings).await {
            Ok(outcome) => tracing::info!(pair = %controller.id(), ?outcome, "pair reconfigured"),
            Err(e) => tracing::error!(pair = %controller.id(), "reconfigure failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use artsync_core::EventKind;

    fn pair_toml(id: &str, address: &str, delay: u64) -> String {
        format!(
            r#"
            [[pair]]
            id = "{id}"

            [pair.settings]
            startup_grace_secs = 3600
            return_delay_secs = {delay}

            [pair.devices.display]
            address = "{address}"
            commands.read_art = ["true"]
            commands.set_art = ["true"]
            commands.power_toggle = ["true"]

            [pair.devices.source]
            watch = ["sleep", "3600"]
            "#
        )
    }

    async fn running(config: &RuntimeConfig) -> SharedRegistry {
        let mut reg = PairRegistry::new(Arc::new(SystemClock::new()));
        for entry in &config.pairs {
            reg.spawn_pair(entry.id.clone(), entry.settings.clone(), entry.build_devices())
                .unwrap();
        }
        Arc::new(RwLock::new(reg))
    }

    #[tokio::test]
    async fn reload_adds_removes_and_moves_displays() {
        let first = RuntimeConfig::from_toml_str(
            &(pair_toml("den", "10.0.0.7", 10) + &pair_toml("office", "10.0.0.8", 10)),
        )
        .unwrap();
        let registry = running(&first).await;

        // office is dropped; its display moves to a new pair.
        let second = RuntimeConfig::from_toml_str(
            &(pair_toml("den", "10.0.0.7", 10) + &pair_toml("attic", "10.0.0.8", 10)),
        )
        .unwrap();
        apply_reload(&registry, &first, &second).await;
        assert_eq!(
            registry.read().await.ids(),
            vec!["attic".to_string(), "den".to_string()]
        );

        registry.write().await.shutdown_all().await;
    }

    #[tokio::test]
    async fn reload_reconfigures_in_place() {
        let first = RuntimeConfig::from_toml_str(&pair_toml("den", "10.0.0.7", 10)).unwrap();
        let registry = running(&first).await;
        let before = registry.read().await.get("den").cloned().unwrap();

        let second = RuntimeConfig::from_toml_str(&pair_toml("den", "10.0.0.7", 45)).unwrap();
        apply_reload(&registry, &first, &second).await;

        // The running controller took the new settings; no restart.
        assert!(before.events(10).iter().any(|e| e.kind == EventKind::Config));
        apply_reload(&registry, &second, &second).await;
        let configs = before
            .events(10)
            .iter()
            .filter(|e| e.kind == EventKind::Config)
            .count();
        assert_eq!(configs, 1);

        registry.write().await.shutdown_all().await;
    }

    #[tokio::test]
    async fn reload_leaves_registry_readable_while_pair_is_busy() {
        // No startup grace: the first enforcement holds the pair lock for
        // the whole slow read.
        let slow = |delay: u64| {
            pair_toml("den", "10.0.0.7", delay)
                .replace("startup_grace_secs = 3600", "startup_grace_secs = 0")
                .replace(r#"commands.read_art = ["true"]"#, r#"commands.read_art = ["sleep", "3"]"#)
        };
        let first = RuntimeConfig::from_toml_str(&slow(10)).unwrap();
        let second = RuntimeConfig::from_toml_str(&slow(45)).unwrap();
        let registry = running(&first).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let reload = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { apply_reload(&registry, &first, &second).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ids = tokio::time::timeout(Duration::from_millis(500), async {
            registry.read().await.ids()
        })
        .await
        .expect("registry blocked by reload");
        assert_eq!(ids, vec!["den".to_string()]);
        assert!(!reload.is_finished());

        reload.await.unwrap();
        registry.write().await.shutdown_all().await;
    }
}
