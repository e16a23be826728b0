//! Presence adapter that polls an external command.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::process::CommandSpec;
use crate::traits::PresenceSource;

pub struct CommandPresence {
    rx: watch::Receiver<Option<String>>,
    task: JoinHandle<()>,
}

impl CommandPresence {
    /// Start polling `query` every `interval`. Each run's trimmed stdout
    /// becomes the presence value; a failed run clears it to `None`.
    pub fn spawn(query: CommandSpec, interval: Duration, timeout: Duration) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let value = match query.run(&[], timeout).await {
                    Ok(out) if !out.is_empty() => Some(out),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!("presence query failed: {e}");
                        None
                    }
                };
                tx.send_if_modified(|current| {
                    if *current == value {
                        return false;
                    }
                    *current = value;
                    true
                });
                if tx.is_closed() {
                    break;
                }
            }
        });
        Self { rx, task }
    }
}

impl PresenceSource for CommandPresence {
    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.rx.clone()
    }
}

impl Drop for CommandPresence {
    fn drop(&mut self) {
        self.task.abort();
    }
}
