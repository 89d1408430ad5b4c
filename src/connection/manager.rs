//! Connection manager with backoff reconnection

use super::connector::Connector;
use crate::config::duration_ms;
use crate::error::{Result, RuntimeError};
use crate::health::HealthReport;
use crate::notify::Subscribers;
use crate::task::{sleep_or_shutdown, BackgroundTask};
use edge_shared::{defaults, now_ms, ConnectionStatus};
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

/// Configuration for connection manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Queue backend address
    pub endpoint: String,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Delay before the first reconnect attempt
    #[serde(rename = "initial_reconnect_delay_ms", with = "duration_ms")]
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnection delay
    #[serde(rename = "max_reconnect_delay_ms", with = "duration_ms")]
    pub max_reconnect_delay: Duration,
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
    /// Reconnect attempts before the connection is marked FAILED
    pub max_reconnect_attempts: u32,
    /// Liveness check period while connected
    #[serde(rename = "check_interval_ms", with = "duration_ms")]
    pub check_interval: Duration,
    /// Reconnect automatically when the liveness loop sees a loss
    pub auto_reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:5672".into(),
            connect_timeout: Duration::from_secs(5),
            initial_reconnect_delay: Duration::from_millis(defaults::RECONNECT_INITIAL_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(defaults::RECONNECT_MAX_DELAY_MS),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            max_reconnect_attempts: defaults::RECONNECT_MAX_ATTEMPTS,
            check_interval: Duration::from_secs(5),
            auto_reconnect: true,
        }
    }
}

impl ConnectionConfig {
    /// Deterministic delay before reconnect attempt `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = self.initial_reconnect_delay.as_secs_f64() * factor;
        let max = self.max_reconnect_delay.as_secs_f64();
        if !delay.is_finite() || delay >= max {
            self.max_reconnect_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// `backoff_delay` spread by up to `jitter` either way, still capped
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
        base.mul_f64(factor).min(self.max_reconnect_delay)
    }
}

/// Snapshot of a managed connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub endpoint: String,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    /// Milliseconds since Unix epoch of the last successful connect
    pub connected_at: Option<u64>,
}

/// Manages the lifecycle of one logical connection
pub struct ConnectionManager {
    name: String,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: RwLock<ConnectionState>,
    subscribers: Subscribers<ConnectionStatus, ConnectionState>,
    /// Serializes connect/disconnect/reconnect
    op_lock: Mutex<()>,
    /// Set by `disconnect` to abandon a running reconnect
    cancel_requested: AtomicBool,
    cancel: Notify,
    task: Mutex<Option<BackgroundTask>>,
}

impl ConnectionManager {
    pub fn new(name: impl Into<String>, config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let endpoint = connector.endpoint();
        Self {
            name: name.into(),
            config,
            connector,
            state: RwLock::new(ConnectionState {
                status: ConnectionStatus::Disconnected,
                endpoint,
                reconnect_attempts: 0,
                last_error: None,
                connected_at: None,
            }),
            subscribers: Subscribers::new("CONN"),
            op_lock: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
            cancel: Notify::new(),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    pub async fn is_connected(&self) -> bool {
        self.status().await.is_connected()
    }

    /// Register a status-change callback
    ///
    /// Callbacks run while the operation lock is held, so `disconnect` waits
    /// for them. Long work belongs in a task the callback only signals.
    pub async fn add_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionStatus, ConnectionStatus, ConnectionState) + Send + Sync + 'static,
    {
        self.subscribers.add(callback).await;
    }

    pub async fn add_async_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(ConnectionStatus, ConnectionStatus, ConnectionState) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribers.add_async(callback).await;
    }

    /// Apply a status transition and notify subscribers if the status changed
    async fn transition<F>(&self, to: ConnectionStatus, update: F) -> bool
    where
        F: FnOnce(&mut ConnectionState),
    {
        let (from, snapshot) = {
            let mut state = self.state.write().await;
            let from = state.status;
            if !from.can_transition_to(to) {
                warn!("[CONN] {}: rejected transition {} -> {}", self.name, from, to);
                return false;
            }
            state.status = to;
            update(&mut state);
            (from, state.clone())
        };

        if from != to {
            debug!("[CONN] {}: {} -> {}", self.name, from, to);
            self.subscribers.notify(from, to, snapshot).await;
        }
        true
    }

    /// Call the connector, converting errors and panics into `Err(reason)`
    async fn try_connect(&self) -> std::result::Result<(), String> {
        match AssertUnwindSafe(self.connector.connect()).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("connect handler panicked".into()),
        }
    }

    fn mark_connected(state: &mut ConnectionState) {
        state.reconnect_attempts = 0;
        state.last_error = None;
        state.connected_at = Some(now_ms());
    }

    /// Connect once; a no-op returning `true` when already connected
    pub async fn connect(&self) -> bool {
        let _op = self.op_lock.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> bool {
        match self.status().await {
            ConnectionStatus::Connected => return true,
            ConnectionStatus::Failed => {
                warn!("[CONN] {}: connection FAILED, reset required", self.name);
                return false;
            }
            // Left behind by `mark_lost` with nobody retrying
            ConnectionStatus::Reconnecting => return self.reconnect_locked().await,
            _ => {}
        }

        if !self.transition(ConnectionStatus::Connecting, |_| {}).await {
            return false;
        }
        match self.try_connect().await {
            Ok(()) => {
                info!("[CONN] {}: connected to {}", self.name, self.connector.endpoint());
                self.transition(ConnectionStatus::Connected, Self::mark_connected)
                    .await
            }
            Err(reason) => {
                warn!("[CONN] {}: connect failed: {}", self.name, reason);
                self.transition(ConnectionStatus::Disconnected, |s| {
                    s.last_error = Some(reason)
                })
                .await;
                false
            }
        }
    }

    /// Disconnect; a no-op returning `true` when already disconnected
    ///
    /// A FAILED connection stays FAILED; only `reset` clears it.
    pub async fn disconnect(&self) -> bool {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
        let _op = self.op_lock.lock().await;
        self.cancel_requested.store(false, Ordering::SeqCst);

        let status = self.status().await;
        if status == ConnectionStatus::Disconnected {
            return true;
        }

        if let Err(e) = AssertUnwindSafe(self.connector.disconnect())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("disconnect handler panicked")))
        {
            warn!("[CONN] {}: disconnect handler failed: {}", self.name, e);
        }

        if status != ConnectionStatus::Failed {
            self.transition(ConnectionStatus::Disconnected, |_| {}).await;
            info!("[CONN] {}: disconnected", self.name);
        }
        true
    }

    /// Retry the connector with exponential backoff and jitter
    ///
    /// Returns `true` once connected. Exhausting `max_reconnect_attempts`
    /// leaves the connection FAILED; a concurrent `disconnect` abandons the
    /// attempt and leaves it DISCONNECTED.
    pub async fn reconnect(&self) -> bool {
        let _op = self.op_lock.lock().await;
        self.reconnect_locked().await
    }

    async fn reconnect_locked(&self) -> bool {
        match self.status().await {
            ConnectionStatus::Connected => return true,
            ConnectionStatus::Failed => return false,
            _ => {}
        }
        self.transition(ConnectionStatus::Reconnecting, |_| {}).await;

        loop {
            let attempt = self.state.read().await.reconnect_attempts + 1;
            if attempt > self.config.max_reconnect_attempts {
                error!(
                    "[CONN] {}: giving up after {} reconnect attempts",
                    self.name, self.config.max_reconnect_attempts
                );
                self.transition(ConnectionStatus::Failed, |_| {}).await;
                return false;
            }
            self.state.write().await.reconnect_attempts = attempt;

            let delay = self.config.jittered_delay(attempt);
            debug!(
                "[CONN] {}: reconnect attempt {}/{} in {:?}",
                self.name, attempt, self.config.max_reconnect_attempts, delay
            );

            let cancelled = {
                let notified = self.cancel.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.cancel_requested.load(Ordering::SeqCst) {
                    true
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = notified => true,
                    }
                }
            };
            if cancelled {
                info!("[CONN] {}: reconnect abandoned", self.name);
                self.transition(ConnectionStatus::Disconnected, |_| {}).await;
                return false;
            }

            match self.try_connect().await {
                Ok(()) => {
                    info!(
                        "[CONN] {}: reconnected after {} attempt(s)",
                        self.name, attempt
                    );
                    return self
                        .transition(ConnectionStatus::Connected, Self::mark_connected)
                        .await;
                }
                Err(reason) => {
                    warn!("[CONN] {}: reconnect attempt {} failed: {}", self.name, attempt, reason);
                    self.state.write().await.last_error = Some(reason);
                }
            }
        }
    }

    /// Connect, falling back to the backoff loop when `auto_reconnect` is set
    ///
    /// Fails with `Exhausted` when no connection could be established.
    pub async fn ensure_connected(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.connect_locked().await
            || (self.config.auto_reconnect && self.reconnect_locked().await)
        {
            return Ok(());
        }

        let state = self.state().await;
        let attempts = if state.status == ConnectionStatus::Failed {
            self.config.max_reconnect_attempts
        } else {
            state.reconnect_attempts.max(1)
        };
        Err(RuntimeError::Exhausted {
            what: format!("connection {} to {}", self.name, state.endpoint),
            attempts,
        })
    }

    /// Record a detected loss of an established connection
    pub async fn mark_lost(&self, reason: &str) -> bool {
        let _op = self.op_lock.lock().await;
        if self.status().await != ConnectionStatus::Connected {
            return false;
        }
        warn!("[CONN] {}: connection lost: {}", self.name, reason);
        let reason = reason.to_string();
        self.transition(ConnectionStatus::Reconnecting, |s| s.last_error = Some(reason))
            .await
    }

    /// Clear FAILED back to DISCONNECTED
    pub async fn reset(&self) -> bool {
        let _op = self.op_lock.lock().await;
        if self.status().await != ConnectionStatus::Failed {
            return false;
        }
        info!("[CONN] {}: reset from FAILED", self.name);
        self.transition(ConnectionStatus::Disconnected, |s| s.reconnect_attempts = 0)
            .await
    }

    /// Connect and run the liveness loop; no-op if already running
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let manager = self.clone();
        let interval = self.config.check_interval;
        *task = Some(BackgroundTask::spawn(
            format!("connection-{}", self.name),
            move |mut shutdown| async move {
                if let Err(e) = manager.ensure_connected().await {
                    warn!("[CONN] {}: {}", manager.name, e);
                }

                while !sleep_or_shutdown(interval, &mut shutdown).await {
                    if manager.status().await != ConnectionStatus::Connected {
                        continue;
                    }
                    if manager.connector.is_alive().await {
                        continue;
                    }
                    manager.mark_lost("liveness check failed").await;
                    if manager.config.auto_reconnect {
                        manager.reconnect().await;
                    }
                }
            },
        ));
        info!("[CONN] {}: manager started", self.name);
    }

    /// Stop the liveness loop and disconnect
    pub async fn stop(&self, timeout: Duration) -> bool {
        let task = self.task.lock().await.take();
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();

        let clean = match task {
            Some(task) => task.stop(timeout).await,
            None => true,
        };
        let disconnected = tokio::time::timeout(timeout, self.disconnect())
            .await
            .unwrap_or(false);
        info!("[CONN] {}: manager stopped", self.name);
        clean && disconnected
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    pub async fn health_check(&self) -> HealthReport {
        let state = self.state().await;
        let report = match state.status {
            ConnectionStatus::Connected => HealthReport::healthy(),
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                HealthReport::degraded(format!("connection {}", state.status))
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Failed => {
                HealthReport::unhealthy(format!("connection {}", state.status))
            }
        };
        report
            .with("name", self.name.clone())
            .with("connection_state", serde_json::to_value(&state).unwrap_or_default())
    }
}
