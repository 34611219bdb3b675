//! The processor's fixed-delay background loop.
//!
//! The task runs once immediately, then again a fixed delay after each run
//! finishes. Shutdown is only observed between runs, so a run that has
//! started always finishes (or hits the shutdown timeout and is aborted).

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct FixedDelayTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl FixedDelayTask {
    /// Spawn `task`. Runs never overlap, and a slow run pushes the next one
    /// back instead of queueing it.
    pub fn spawn<F, Fut>(name: &'static str, delay: Duration, mut task: F) -> Self
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut tick = 0u64;
            loop {
                task(tick).await;
                tick = tick.wrapping_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut shutdown_rx => {
                        tracing::debug!(task = name, runs = tick, "Fixed-delay task stopping");
                        break;
                    }
                }
            }
        });
        tracing::info!(
            task = name,
            delay_ms = delay.as_millis() as u64,
            "Spawned background task"
        );

        Self {
            name,
            handle: Some(handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Signal the task and wait for it. A task still running at the deadline
    /// is aborted.
    pub async fn shutdown(&mut self, timeout: Duration) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        let Some(handle) = self.handle.take() else {
            return;
        };

        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => tracing::debug!(task = self.name, "Task shutdown complete"),
            Ok(Err(e)) => {
                tracing::warn!(task = self.name, error = %e, "Task panicked during shutdown")
            }
            Err(_) => {
                tracing::warn!(task = self.name, "Task did not respond to shutdown, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for FixedDelayTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(task = self.name, "Aborting task on drop");
            handle.abort();
        }
    }
}
