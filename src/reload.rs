//! Hot reload of the limits file.
//!
//! The file's directory is watched for changes. Bursts of events are
//! debounced into one reload; a changed file is parsed and validated in full
//! before it replaces the limiter's rules and policies, and a file that fails
//! validation is logged while the running snapshot is kept.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LimitsConfig;
use crate::error::{RatewardenError, Result};
use crate::ratelimit::Limiter;
use crate::task::TaskHandle;

/// Pending change notifications; extra events are dropped, one is enough.
const EVENT_BUFFER: usize = 16;

/// Watches a limits file and applies changes to a limiter.
pub struct ConfigReloader {
    path: PathBuf,
    limiter: Arc<Limiter>,
    debounce: Duration,
}

impl ConfigReloader {
    /// Create a reloader. The file's current contents are taken as already applied.
    pub fn new(path: impl Into<PathBuf>, limiter: Arc<Limiter>, debounce: Duration) -> Self {
        Self {
            path: path.into(),
            limiter,
            debounce,
        }
    }

    /// Load the file, validate it and swap it into the limiter.
    pub fn reload(&self) -> Result<()> {
        let limits = LimitsConfig::from_file(&self.path)?;
        self.limiter.reload(&limits)
    }

    /// Start watching on a background task.
    ///
    /// The parent directory is watched rather than the file itself so that
    /// editors which replace the file by rename are still noticed.
    pub fn spawn(self) -> Result<TaskHandle> {
        let file_name = self.path.file_name().map(|name| name.to_os_string()).ok_or_else(|| {
            RatewardenError::Config(format!(
                "Limits path '{}' does not name a file",
                self.path.display()
            ))
        })?;
        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_change(&event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|path| path.file_name() == Some(file_name.as_os_str()));
                    if ours {
                        let _ = event_tx.try_send(());
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Limits file watch error"),
            },
            Config::default(),
        )?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        info!(
            path = %self.path.display(),
            debounce_ms = u64::try_from(self.debounce.as_millis()).unwrap_or(u64::MAX),
            "Limits file watcher started"
        );

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            // Events stop when the watcher is dropped.
            let _watcher = watcher;
            let debounce = tokio::time::sleep(Duration::ZERO);
            tokio::pin!(debounce);
            let mut pending = false;

            loop {
                tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(()) => {
                            debug!(path = %self.path.display(), "Limits file changed");
                            pending = true;
                            debounce.as_mut().reset(Instant::now() + self.debounce);
                        }
                        None => break,
                    },
                    _ = &mut debounce, if pending => {
                        pending = false;
                        if let Err(e) = self.reload() {
                            error!(
                                path = %self.path.display(),
                                error = %e,
                                "Failed to reload limits, keeping previous configuration"
                            );
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Limits file watcher stopped");
                        break;
                    }
                }
            }
        });

        Ok(TaskHandle::new("limits-reloader", shutdown_tx, join))
    }
}

fn is_change(event: &Event) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryCounterStore;
    use std::path::Path;

    const ONE_PER_MINUTE: &str = r#"
rules:
  - endpoint: "*"
    period: 1m
    limit: 1
"#;

    const TEN_PER_MINUTE: &str = r#"
rules:
  - endpoint: "*"
    period: 1m
    limit: 10
"#;

    const BROKEN: &str = "rules:\n  - endpoint: \"/api/*/x\"\n    period: 1m\n    limit: 1\n";

    fn limiter(path: &Path) -> Arc<Limiter> {
        let limits = LimitsConfig::from_file(path).unwrap();
        Arc::new(Limiter::from_config(&limits, Arc::new(MemoryCounterStore::new())).unwrap())
    }

    fn current_limit(limiter: &Limiter) -> u64 {
        limiter.rules().rules()[0].limit()
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    #[test]
    fn test_reload_applies_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yaml");
        std::fs::write(&path, ONE_PER_MINUTE).unwrap();

        let limiter = limiter(&path);
        let reloader = ConfigReloader::new(&path, limiter.clone(), Duration::from_millis(10));

        std::fs::write(&path, TEN_PER_MINUTE).unwrap();
        reloader.reload().unwrap();
        assert_eq!(current_limit(&limiter), 10);
    }

    #[test]
    fn test_invalid_file_keeps_previous_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yaml");
        std::fs::write(&path, ONE_PER_MINUTE).unwrap();

        let limiter = limiter(&path);
        let reloader = ConfigReloader::new(&path, limiter.clone(), Duration::from_millis(10));

        std::fs::write(&path, BROKEN).unwrap();
        assert!(matches!(reloader.reload(), Err(RatewardenError::Config(_))));
        assert_eq!(current_limit(&limiter), 1);

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(reloader.reload(), Err(RatewardenError::Io(_))));
        assert_eq!(current_limit(&limiter), 1);
    }

    #[tokio::test]
    async fn test_watcher_applies_changed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yaml");
        std::fs::write(&path, ONE_PER_MINUTE).unwrap();

        let limiter = limiter(&path);
        let handle = ConfigReloader::new(&path, limiter.clone(), Duration::from_millis(50))
            .spawn()
            .unwrap();

        std::fs::write(&path, TEN_PER_MINUTE).unwrap();
        assert!(eventually(|| current_limit(&limiter) == 10).await);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_watcher_survives_broken_edit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yaml");
        std::fs::write(&path, ONE_PER_MINUTE).unwrap();

        let limiter = limiter(&path);
        let handle = ConfigReloader::new(&path, limiter.clone(), Duration::from_millis(50))
            .spawn()
            .unwrap();

        std::fs::write(&path, BROKEN).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(current_limit(&limiter), 1);

        std::fs::write(&path, TEN_PER_MINUTE).unwrap();
        assert!(eventually(|| current_limit(&limiter) == 10).await);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_other_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yaml");
        std::fs::write(&path, ONE_PER_MINUTE).unwrap();

        let limiter = limiter(&path);
        let handle = ConfigReloader::new(&path, limiter.clone(), Duration::from_millis(50))
            .spawn()
            .unwrap();

        // A sibling file with valid contents must not be picked up
        std::fs::write(dir.path().join("other.yaml"), TEN_PER_MINUTE).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(current_limit(&limiter), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_requires_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yaml");
        std::fs::write(&path, ONE_PER_MINUTE).unwrap();

        let reloader = ConfigReloader::new("/", limiter(&path), Duration::from_millis(50));
        assert!(matches!(reloader.spawn(), Err(RatewardenError::Config(_))));
    }

    #[tokio::test]
    async fn test_spawned_reloader_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yaml");
        std::fs::write(&path, ONE_PER_MINUTE).unwrap();

        let handle = ConfigReloader::new(&path, limiter(&path), Duration::from_secs(1))
            .spawn()
            .unwrap();
        assert_eq!(handle.name(), "limits-reloader");
        handle.shutdown().await;
    }
}
