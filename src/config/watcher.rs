//! Configuration file watcher for hot-reload support.
//!
//! Polls the configuration file for modification-time changes and swaps
//! validated documents into a shared [`ConfigStore`]. A document that
//! fails to parse or validate is reported and the active configuration
//! stays in place.

use super::error::ConfigResult;
use super::store::{load_path, ConfigStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Polling interval for file changes.
    pub poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl WatcherConfig {
    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Event emitted when the watched file changes.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A new document was validated and installed.
    Reloaded,

    /// The changed file was rejected; the active configuration is kept.
    Error(String),
}

/// Watches a configuration file and hot-reloads a [`ConfigStore`].
pub struct ConfigWatcher {
    config_path: PathBuf,
    watcher_config: WatcherConfig,
    store: Arc<ConfigStore>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ConfigWatcher {
    /// Create a watcher that loads the initial configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial configuration cannot be loaded.
    pub fn new(path: impl AsRef<Path>, watcher_config: WatcherConfig) -> ConfigResult<Self> {
        let config_path = path.as_ref().to_path_buf();
        let store = Arc::new(ConfigStore::new(load_path(&config_path)?)?);
        Ok(Self {
            config_path,
            watcher_config,
            store,
            shutdown_tx: None,
        })
    }

    /// Create a watcher over an existing store.
    #[must_use]
    pub fn with_store(
        path: impl AsRef<Path>,
        store: Arc<ConfigStore>,
        watcher_config: WatcherConfig,
    ) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
            watcher_config,
            store,
            shutdown_tx: None,
        }
    }

    /// The store the watcher reloads into.
    #[must_use]
    pub fn store(&self) -> Arc<ConfigStore> {
        Arc::clone(&self.store)
    }

    /// Start polling. Returns a receiver for reload events.
    pub fn start(&mut self) -> mpsc::Receiver<ConfigEvent> {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let config_path = self.config_path.clone();
        let poll_interval = self.watcher_config.poll_interval;
        let store = Arc::clone(&self.store);
        let mut last_modified = modified_time(&config_path);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(new_mtime) = modified_time(&config_path) else {
                            continue;
                        };
                        if last_modified.map_or(false, |old| new_mtime <= old) {
                            continue;
                        }
                        last_modified = Some(new_mtime);

                        match store.reload_from(&config_path) {
                            Ok(()) => {
                                info!(path = %config_path.display(), "configuration hot-reloaded");
                                let _ = event_tx.send(ConfigEvent::Reloaded).await;
                            }
                            Err(e) => {
                                error!(path = %config_path.display(), error = %e,
                                    "hot-reload rejected, keeping active configuration");
                                let _ = event_tx.send(ConfigEvent::Error(e.to_string())).await;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        event_rx
    }

    /// Stop polling.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Reload immediately without waiting for the poll tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or validated.
    pub fn reload(&self) -> ConfigResult<()> {
        self.store.reload_from(&self.config_path)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_watcher_config_default() {
        let config = WatcherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_watcher_loads_initial_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("limits.toml");
        std::fs::write(
            &path,
            r#"
            [limits.address]
            per_minute = 7
            per_hour = 70
        "#,
        )
        .unwrap();

        let watcher = ConfigWatcher::new(&path, WatcherConfig::default()).unwrap();
        assert_eq!(watcher.store().snapshot().limits.address.per_minute, 7);
    }

    #[tokio::test]
    async fn test_force_reload_applies_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("limits.toml");
        std::fs::write(
            &path,
            r#"
            [limits.identity]
            per_minute = 5
            per_hour = 50
        "#,
        )
        .unwrap();

        let watcher = ConfigWatcher::new(&path, WatcherConfig::default()).unwrap();

        std::fs::write(
            &path,
            r#"
            [limits.identity]
            per_minute = 9
            per_hour = 90
        "#,
        )
        .unwrap();

        watcher.reload().unwrap();
        assert_eq!(watcher.store().snapshot().limits.identity.per_minute, 9);
    }

    #[tokio::test]
    async fn test_force_reload_rejects_invalid_and_keeps_active() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("limits.toml");
        std::fs::write(
            &path,
            r#"
            [limits.identity]
            per_minute = 5
            per_hour = 50
        "#,
        )
        .unwrap();

        let watcher = ConfigWatcher::new(&path, WatcherConfig::default()).unwrap();

        std::fs::write(
            &path,
            r#"
            [limits.identity]
            per_minute = 0
            per_hour = 0
        "#,
        )
        .unwrap();

        assert!(watcher.reload().is_err());
        assert_eq!(watcher.store().snapshot().limits.identity.per_minute, 5);
    }
}
