//! Status-change subscriber lists
//!
//! Used by the network monitor and the connection manager. Subscribers may be
//! synchronous closures or closures returning a future; a subscriber that
//! errors or panics is logged and skipped so the remaining ones still run.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

type Callback<S, T> = Arc<dyn Fn(S, S, T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A list of `(old_status, new_status, state)` callbacks
pub struct Subscribers<S, T> {
    component: &'static str,
    callbacks: RwLock<Vec<Callback<S, T>>>,
}

impl<S, T> Subscribers<S, T>
where
    S: Copy + std::fmt::Debug + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a synchronous callback
    pub async fn add<F>(&self, callback: F)
    where
        F: Fn(S, S, T) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.callbacks.write().await.push(Arc::new(move |old, new, state| {
            let callback = callback.clone();
            async move {
                callback(old, new, state);
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        }));
    }

    /// Register an asynchronous callback
    pub async fn add_async<F, Fut>(&self, callback: F)
    where
        F: Fn(S, S, T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks
            .write()
            .await
            .push(Arc::new(move |old, new, state| callback(old, new, state).boxed()));
    }

    pub async fn len(&self) -> usize {
        self.callbacks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.callbacks.read().await.is_empty()
    }

    /// Invoke every callback in registration order
    pub async fn notify(&self, old: S, new: S, state: T) {
        // Snapshot so callbacks may register further subscribers
        let callbacks: Vec<Callback<S, T>> = self.callbacks.read().await.clone();

        for (index, callback) in callbacks.iter().enumerate() {
            let call = AssertUnwindSafe(async { callback(old, new, state.clone()).await });
            match call.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "[{}] Status callback #{} failed on {:?} -> {:?}: {}",
                    self.component, index, old, new, e
                ),
                Err(_) => warn!(
                    "[{}] Status callback #{} panicked on {:?} -> {:?}",
                    self.component, index, old, new
                ),
            }
        }
    }
}
