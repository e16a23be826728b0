//! Registry of running pair controllers.
//!
//! One controller per pair; a display may belong to at most one pair.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use artsync_core::PairConfig;

use crate::clock::Clock;
use crate::controller::{ControlError, PairController, PairDevices};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("pair `{0}` is already running")]
    DuplicatePair(String),

    #[error("pairs `{first}` and `{second}` share display {address}")]
    SharedDisplay {
        address: String,
        first: String,
        second: String,
    },

    #[error("pair `{pair}`: {source}")]
    Pair {
        pair: String,
        #[source]
        source: ControlError,
    },
}

pub struct PairRegistry {
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    pairs: BTreeMap<String, PairController>,
}

impl PairRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_cancel(clock, CancellationToken::new())
    }

    /// Every controller gets a child of `cancel`.
    pub fn with_cancel(clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            clock,
            cancel,
            pairs: BTreeMap::new(),
        }
    }

    pub fn spawn_pair(
        &mut self,
        id: impl Into<String>,
        config: PairConfig,
        devices: PairDevices,
    ) -> Result<&PairController, RegistryError> {
        let id = id.into();
        if self.pairs.contains_key(&id) {
            return Err(RegistryError::DuplicatePair(id));
        }
        let address = devices.display.address().to_string();
        if let Some(other) = self.pairs.values().find(|p| p.display_address() == address) {
            return Err(RegistryError::SharedDisplay {
                address,
                first: other.id().to_string(),
                second: id,
            });
        }

        let controller = PairController::with_cancel(
            id.clone(),
            config,
            devices,
            Arc::clone(&self.clock),
            self.cancel.child_token(),
        )
        .map_err(|source| RegistryError::Pair {
            pair: id.clone(),
            source,
        })?;
        info!(pair = %id, display = %address, "pair registered");
        Ok(self.pairs.entry(id).or_insert(controller))
    }

    pub fn get(&self, id: &str) -> Option<&PairController> {
        self.pairs.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.pairs.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PairController> {
        self.pairs.values()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Forget one pair without stopping it. The caller owns its shutdown.
    pub fn detach(&mut self, id: &str) -> Option<PairController> {
        self.pairs.remove(id)
    }

    /// Stop and forget one pair.
    pub async fn remove(&mut self, id: &str) -> bool {
        match self.detach(id) {
            Some(controller) => {
                controller.shutdown().await;
                info!(pair = %id, "pair removed");
                true
            }
            None => false,
        }
    }

    /// Stop every pair. The registry is empty afterwards.
    pub async fn shutdown_all(&mut self) {
        let pairs = std::mem::take(&mut self.pairs);
        for controller in pairs.values() {
            controller.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use artsync_device::fake::{FakeDisplay, FakeSource};

    fn devices(address: &str) -> PairDevices {
        PairDevices {
            display: FakeDisplay::new(address),
            source: FakeSource::new(),
            presence: None,
            remote: None,
        }
    }

    fn registry() -> PairRegistry {
        PairRegistry::new(Arc::new(ManualClock::at(12, 0)))
    }

    #[tokio::test(start_paused = true)]
    async fn spawns_and_lists_pairs() {
        let mut reg = registry();
        reg.spawn_pair("den", PairConfig::default(), devices("10.0.0.7")).unwrap();
        reg.spawn_pair("bedroom", PairConfig::default(), devices("10.0.0.8")).unwrap();
        assert_eq!(reg.ids(), vec!["bedroom".to_string(), "den".to_string()]);
        assert_eq!(reg.get("den").map(|p| p.display_address()), Some("10.0.0.7"));
        reg.shutdown_all().await;
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_duplicate_id() {
        let mut reg = registry();
        reg.spawn_pair("den", PairConfig::default(), devices("10.0.0.7")).unwrap();
        let err = reg
            .spawn_pair("den", PairConfig::default(), devices("10.0.0.9"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePair(id) if id == "den"));
        reg.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_shared_display() {
        let mut reg = registry();
        reg.spawn_pair("den", PairConfig::default(), devices("10.0.0.7")).unwrap();
        let err = reg
            .spawn_pair("office", PairConfig::default(), devices("10.0.0.7"))
            .unwrap_err();
        match err {
            RegistryError::SharedDisplay { first, second, .. } => {
                assert_eq!(first, "den");
                assert_eq!(second, "office");
            }
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(reg.len(), 1);
        reg.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_is_rejected() {
        let mut reg = registry();
        let cfg = PairConfig {
            max_commands_per_5min: 0,
            ..PairConfig::default()
        };
        let err = reg.spawn_pair("den", cfg, devices("10.0.0.7")).unwrap_err();
        assert!(matches!(err, RegistryError::Pair { .. }));
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_stops_the_pair() {
        let mut reg = registry();
        reg.spawn_pair("den", PairConfig::default(), devices("10.0.0.7")).unwrap();
        let handle = reg.get("den").cloned().unwrap();
        assert!(reg.remove("den").await);
        assert!(!reg.remove("den").await);
        assert!(handle.force_art().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn detach_frees_the_display() {
        let mut reg = registry();
        reg.spawn_pair("den", PairConfig::default(), devices("10.0.0.7")).unwrap();
        let old = reg.detach("den").unwrap();
        assert!(reg.is_empty());
        assert!(reg.detach("den").is_none());
        old.shutdown().await;
        reg.spawn_pair("office", PairConfig::default(), devices("10.0.0.7")).unwrap();
        reg.shutdown_all().await;
    }
}
