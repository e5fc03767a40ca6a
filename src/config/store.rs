use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration loaded from a TOML file
///
/// Uses `ArcSwap` for lock-free reads. The relay and the session loop keep a
/// clone and call `get` when they need policy, so `set` takes effect on their
/// next read.
#[derive(Clone)]
pub struct ConfigStore {
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Load configuration from `path`. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str::<AppConfig>(&text)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config file at {}, using defaults", path.display());
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::new(config))
    }

    /// Build a store around an in-memory config
    pub fn new(config: AppConfig) -> Self {
        Self {
            cache: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration for every holder of this store
    pub fn set(&self, config: AppConfig) {
        self.cache.store(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(store.get().relay.port, 8090);
    }

    #[tokio::test]
    async fn test_file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("classroom-rtc.toml");
        tokio::fs::write(
            &path,
            "[relay]\nport = 9000\n\n[telemetry]\nendpoint = \"http://collector.local/samples\"\n",
        )
        .await
        .unwrap();

        let store = ConfigStore::load(&path).await.unwrap();
        let config = store.get();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(
            config.telemetry.endpoint.as_deref(),
            Some("http://collector.local/samples")
        );
        assert_eq!(config.client.join_retries, AppConfig::default().client.join_retries);
    }

    #[test]
    fn test_set_is_seen_by_clones() {
        let store = ConfigStore::new(AppConfig::default());
        let reader = store.clone();

        let mut config = (*store.get()).clone();
        config.quality.poor_threshold_secs = 1;
        store.set(config);

        assert_eq!(reader.get().quality.poor_threshold_secs, 1);
    }

    #[tokio::test]
    async fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        tokio::fs::write(&path, "relay = 12").await.unwrap();

        let err = ConfigStore::load(&path).await.err().unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }
}
