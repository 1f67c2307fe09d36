//! Handles for background tasks.

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

/// A running background task that can be asked to stop.
pub struct TaskHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Wrap a spawned task together with its shutdown trigger.
    pub fn new(name: &'static str, shutdown: oneshot::Sender<()>, join: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown: Some(shutdown),
            join,
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task has already exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.join).await {
            warn!(task = self.name, error = %e, "Background task failed");
        }
    }
}
