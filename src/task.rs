//! Background loop handles
//!
//! Every periodic loop in the runtime (network probing, connection liveness,
//! health checks, maintenance, dispatch workers) is a tokio task that watches
//! a shutdown flag. Stopping signals the flag, waits up to a deadline and
//! aborts the task if it has not finished by then.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiver side of a shutdown signal
pub type Shutdown = watch::Receiver<bool>;

/// A spawned loop plus the means to stop it
pub struct BackgroundTask {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn a single loop
    pub fn spawn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            name: name.into(),
            shutdown_tx,
            handles: vec![tokio::spawn(f(shutdown_rx))],
        }
    }

    /// Spawn `count` loops sharing one shutdown signal
    pub fn spawn_many<F, Fut>(name: impl Into<String>, count: usize, mut f: F) -> Self
    where
        F: FnMut(usize, Shutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..count)
            .map(|index| tokio::spawn(f(index, shutdown_rx.clone())))
            .collect();
        Self {
            name: name.into(),
            shutdown_tx,
            handles,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    /// Signal shutdown and wait up to `timeout` for every loop to exit.
    /// Returns `false` if any loop had to be aborted.
    pub async fn stop(self, timeout: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut clean = true;

        for mut handle in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    warn!("[TASK] {} loop panicked", self.name);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("[TASK] {} did not stop within {:?}, aborting", self.name, timeout);
                    handle.abort();
                    clean = false;
                }
            }
        }

        debug!("[TASK] {} stopped", self.name);
        clean
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
/// Returns `true` when the caller should exit.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut Shutdown) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let closed = tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    closed || *shutdown.borrow()
}
