//! Supervised background tasks.
//!
//! Every loop in the pipeline runs as a tokio task owned by a [`WorkerHandle`].
//! Loops only observe cancellation between units of work, so an item that was
//! picked up is always finished before the task exits.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle to control and join a background task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `run` with a fresh cancellation token.
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run(cancel.clone()));
        info!(worker = name, "background worker started");
        Self {
            name,
            cancel,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request shutdown and wait for the task to stop.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(worker = self.name, error = %e, "background worker panicked");
            }
        }
        info!(worker = self.name, "background worker stopped");
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // A dropped handle must not leave an orphaned loop behind.
        self.cancel.cancel();
    }
}

/// Sleep for `period`, returning `false` if cancellation arrived first.
pub(crate) async fn pause(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

/// Run `tick` every `period` until cancelled.
pub(crate) async fn run_every<F, Fut>(cancel: CancellationToken, period: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    while pause(&cancel, period).await {
        tick().await;
    }
}
