//! Gateway shared state.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use parley_core::config::Config;
use parley_core::profile::SessionProfile;

use crate::connector::Connector;
use crate::registry::SessionRegistry;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: RwLock<Arc<Config>>,
    /// Where the config came from; watched for changes when set.
    pub config_path: Option<PathBuf>,
    pub registry: SessionRegistry,
    /// Used for knowledge refreshes.
    pub http: reqwest::Client,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        profile: SessionProfile,
        config_path: Option<PathBuf>,
        connector: Arc<dyn Connector>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config: RwLock::new(profile.config.clone()),
            config_path,
            registry: SessionRegistry::new(profile, connector),
            http,
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub async fn read_config(&self) -> Arc<Config> {
        self.config.read().await.clone()
    }

    /// Adopt a new config and profile. Live sessions are untouched.
    pub async fn apply_profile(&self, profile: SessionProfile) {
        *self.config.write().await = profile.config.clone();
        self.registry.swap_profile(profile);
    }
}
