//! Shared configuration snapshot with hot reload.
//!
//! The parsed config lives behind a lock; every retry decision clones a
//! snapshot, so a live edit of the config file (or an admin API update)
//! affects future attempts without touching in-flight executor calls. An
//! invalid file logs a warning and keeps the previous snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use remedy_common::Config;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// Thread-safe shared config handle.
pub type SharedConfig = Arc<RwLock<Config>>;

pub fn shared(config: Config) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

/// Owned snapshot for one decision.
pub async fn snapshot(config: &SharedConfig) -> Config {
    config.read().await.clone()
}

/// Replace the shared config (admin API).
pub async fn replace(config: &SharedConfig, next: Config) {
    *config.write().await = next;
    info!("Configuration snapshot replaced");
}

/// Watches the config file and swaps the shared snapshot on change.
/// Keep the returned watcher alive for the lifetime of the daemon.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn spawn(path: impl Into<PathBuf>, config: SharedConfig) -> Result<Self> {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!("Config watch error: {:?}", e),
            })?;

        // Watch the parent directory: editors replace the file inode
        let watch_target = path
            .parent()
            .filter(|p| p.exists())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.clone());
        watcher.watch(&watch_target, RecursiveMode::NonRecursive)?;
        info!("Config watcher active on {}", path.display());

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Coalesce bursts of editor events
                while rx.try_recv().is_ok() {}
                match Config::load_from_path(&path) {
                    Ok(next) => replace(&config, next).await,
                    Err(e) => {
                        warn!(
                            "Config reload failed, keeping previous snapshot: {}",
                            e
                        );
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_is_independent_copy() {
        let shared = shared(Config::default());
        let snap = snapshot(&shared).await;

        let mut next = Config::default();
        next.healing.enabled = false;
        replace(&shared, next).await;

        // Earlier snapshot unaffected; new snapshot sees the change
        assert!(snap.healing.enabled);
        assert!(!snapshot(&shared).await.healing.enabled);
    }
}
