//! Service coordinator
//!
//! Registers named services, starts them with bounded linear retry, runs a
//! periodic health loop and restarts services that keep failing it. Every
//! call into a service is isolated: errors, panics and timeouts become
//! ERROR/UNHEALTHY status and an alert, never a coordinator failure.

use super::service::{Service, ServiceConfig};
use crate::config::duration_ms;
use crate::error::{Result, RuntimeError};
use crate::health::{HealthReport, HealthStatus};
use crate::task::{sleep_or_shutdown, BackgroundTask};
use edge_shared::{defaults, now_ms, Payload, ServiceStatus};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Coordinator-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[serde(rename = "health_check_interval_ms", with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Upper bound for a single health check call
    #[serde(rename = "health_check_timeout_ms", with = "duration_ms")]
    pub health_check_timeout: Duration,
    /// Consecutive failed checks before alerting and auto-restarting
    pub failure_threshold: u32,
    /// Grace period handed to each service's `stop`
    #[serde(rename = "stop_timeout_ms", with = "duration_ms")]
    pub stop_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_millis(defaults::HEALTH_CHECK_INTERVAL_MS),
            health_check_timeout: Duration::from_secs(10),
            failure_threshold: defaults::HEALTH_FAILURE_THRESHOLD,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Discriminator carried in every alert context as `alert_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    StartupRetry,
    StartupFailed,
    HealthCheckFailed,
    AutoRestart,
    RestartFailed,
    RestartExhausted,
    StopFailed,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::StartupRetry => "startup_retry",
            AlertType::StartupFailed => "startup_failed",
            AlertType::HealthCheckFailed => "health_check_failed",
            AlertType::AutoRestart => "auto_restart",
            AlertType::RestartFailed => "restart_failed",
            AlertType::RestartExhausted => "restart_exhausted",
            AlertType::StopFailed => "stop_failed",
        }
    }
}

/// `(title, body, context)` alert sink
pub type AlertCallback = Arc<dyn Fn(&str, &str, &Payload) + Send + Sync>;

/// Supervision state of one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceState {
    pub name: String,
    pub status: ServiceStatus,
    pub consecutive_failures: u32,
    pub startup_retry_count: u32,
    pub restart_count: u32,
    /// Milliseconds since Unix epoch
    pub last_health_check: Option<u64>,
    pub last_error: Option<String>,
    pub config: ServiceConfig,
}

impl ServiceState {
    fn new(name: String, config: ServiceConfig) -> Self {
        Self {
            name,
            status: ServiceStatus::Stopped,
            consecutive_failures: 0,
            startup_retry_count: 0,
            restart_count: 0,
            last_health_check: None,
            last_error: None,
            config,
        }
    }
}

struct ServiceEntry {
    name: String,
    service: Arc<dyn Service>,
    state: RwLock<ServiceState>,
    /// Serializes start/stop/health-check for this service only
    op_lock: Mutex<()>,
}

impl ServiceEntry {
    async fn status(&self) -> ServiceStatus {
        self.state.read().await.status
    }

    async fn set_status(&self, to: ServiceStatus) -> bool {
        let mut state = self.state.write().await;
        let from = state.status;
        if !from.can_transition_to(to) {
            warn!("[COORD] {}: rejected transition {} -> {}", self.name, from, to);
            return false;
        }
        if from != to {
            debug!("[COORD] {}: {} -> {}", self.name, from, to);
        }
        state.status = to;
        true
    }

    async fn is_live(&self) -> bool {
        let status = self.status().await;
        status.is_active() || status == ServiceStatus::Starting || self.service.is_running().await
    }
}

/// Run a service call with a deadline, folding errors, panics and timeouts
/// into `Err(reason)`
async fn contained<T, F>(what: &str, timeout: Duration, call: F) -> std::result::Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let guarded = AssertUnwindSafe(call).catch_unwind();
    let outcome = if timeout.is_zero() {
        Ok(guarded.await)
    } else {
        tokio::time::timeout(timeout, guarded).await
    };
    match outcome {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(format!("{} failed: {:#}", what, e)),
        Ok(Err(_)) => Err(format!("{} panicked", what)),
        Err(_) => Err(format!("{} timed out after {:?}", what, timeout)),
    }
}

/// Process supervisor for named services
pub struct ServiceCoordinator {
    config: CoordinatorConfig,
    /// Registration order; stop runs in reverse
    services: RwLock<Vec<Arc<ServiceEntry>>>,
    alert_callback: RwLock<Option<AlertCallback>>,
    task: Mutex<Option<BackgroundTask>>,
}

impl ServiceCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            services: RwLock::new(Vec::new()),
            alert_callback: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn set_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &str, &Payload) + Send + Sync + 'static,
    {
        *self.alert_callback.write().await = Some(Arc::new(callback));
    }

    async fn alert(&self, alert_type: AlertType, service: &str, title: String, body: String, fields: Value) {
        let mut context = Payload::new();
        context.insert("alert_type".into(), json!(alert_type.as_str()));
        context.insert("service".into(), json!(service));
        context.insert("timestamp".into(), json!(now_ms()));
        if let Value::Object(fields) = fields {
            context.extend(fields);
        }

        warn!("[COORD] ALERT {}: {} - {}", alert_type.as_str(), title, body);
        let callback = self.alert_callback.read().await.clone();
        if let Some(callback) = callback {
            let call = std::panic::AssertUnwindSafe(|| callback(&title, &body, &context));
            if std::panic::catch_unwind(call).is_err() {
                error!("[COORD] Alert callback panicked on {}", alert_type.as_str());
            }
        }
    }

    async fn entry(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.services
            .read()
            .await
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    async fn require(&self, name: &str) -> Result<Arc<ServiceEntry>> {
        self.entry(name)
            .await
            .ok_or_else(|| RuntimeError::NotRegistered(name.to_string()))
    }

    /// Register a service under its own name
    ///
    /// Fails with `AlreadyRegistered` if a service of that name is registered
    /// and running; a stopped one is replaced.
    pub async fn register_service(
        &self,
        service: Arc<dyn Service>,
        config: Option<ServiceConfig>,
    ) -> Result<()> {
        let name = service.name().to_string();
        let mut services = self.services.write().await;
        let position = services.iter().position(|e| e.name == name);

        if let Some(index) = position {
            if services[index].is_live().await {
                return Err(RuntimeError::AlreadyRegistered(name));
            }
            warn!("[COORD] Re-registering stopped service {}", name);
        }

        let entry = Arc::new(ServiceEntry {
            state: RwLock::new(ServiceState::new(name.clone(), config.unwrap_or_default())),
            name: name.clone(),
            service,
            op_lock: Mutex::new(()),
        });
        match position {
            Some(index) => services[index] = entry,
            None => services.push(entry),
        }
        info!("[COORD] Registered service {}", name);
        Ok(())
    }

    /// Stop (if needed) and remove a service
    pub async fn unregister_service(&self, name: &str) -> Result<()> {
        let entry = self.require(name).await?;
        if entry.is_live().await {
            self.stop_entry(&entry).await;
        }
        self.services.write().await.retain(|e| !Arc::ptr_eq(e, &entry));
        info!("[COORD] Unregistered service {}", name);
        Ok(())
    }

    /// Swap in a new implementation for a stopped service
    pub async fn replace_service(
        &self,
        service: Arc<dyn Service>,
        config: Option<ServiceConfig>,
    ) -> Result<()> {
        let name = service.name().to_string();
        let existing = self.require(&name).await?;
        if existing.is_live().await {
            return Err(RuntimeError::ServiceRunning(name));
        }
        let config = match config {
            Some(config) => config,
            None => existing.state.read().await.config.clone(),
        };
        self.register_service(service, Some(config)).await
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.services.read().await.iter().map(|e| e.name.clone()).collect()
    }

    /// Start one service, retrying per its config
    pub async fn start_service(&self, name: &str) -> Result<bool> {
        let entry = self.require(name).await?;
        let _op = entry.op_lock.lock().await;
        if entry.status().await.is_active() {
            return Ok(true);
        }
        {
            let mut state = entry.state.write().await;
            state.restart_count = 0;
            state.consecutive_failures = 0;
        }
        Ok(self.start_entry(&entry).await)
    }

    /// Start with linear retry; caller holds the op lock
    async fn start_entry(&self, entry: &ServiceEntry) -> bool {
        let config = entry.state.read().await.config.clone();
        let total_attempts = config.total_startup_attempts();
        entry.state.write().await.startup_retry_count = 0;

        let mut last_error = String::new();
        for attempt in 1..=total_attempts {
            entry.set_status(ServiceStatus::Starting).await;
            info!("[COORD] Starting {} (attempt {}/{})", entry.name, attempt, total_attempts);

            match contained("start", config.startup_timeout(), entry.service.start()).await {
                Ok(()) => {
                    let mut state = entry.state.write().await;
                    state.last_error = None;
                    state.consecutive_failures = 0;
                    drop(state);
                    entry.set_status(ServiceStatus::Running).await;
                    info!("[COORD] {} is running", entry.name);
                    return true;
                }
                Err(reason) => {
                    warn!("[COORD] {}: {}", entry.name, reason);
                    entry.state.write().await.last_error = Some(reason.clone());
                    last_error = reason;
                }
            }

            if attempt < total_attempts {
                entry.state.write().await.startup_retry_count = attempt;
                let delay = config.startup_retry_delay();
                self.alert(
                    AlertType::StartupRetry,
                    &entry.name,
                    format!("Service {} failed to start, retrying", entry.name),
                    format!(
                        "Attempt {} of {} failed: {}. Retrying in {:?}.",
                        attempt, total_attempts, last_error, delay
                    ),
                    json!({
                        "retry_attempt": attempt,
                        "max_retries": config.max_startup_retry_attempts,
                        "retry_delay_seconds": config.startup_retry_delay_seconds,
                        "error": last_error,
                    }),
                )
                .await;
                tokio::time::sleep(delay).await;
            }
        }

        entry.set_status(ServiceStatus::Error).await;
        error!(
            "[COORD] {} failed to start after {} attempts",
            entry.name, total_attempts
        );
        self.alert(
            AlertType::StartupFailed,
            &entry.name,
            format!("Service {} failed to start", entry.name),
            format!("Gave up after {} attempts: {}", total_attempts, last_error),
            json!({
                "total_attempts": total_attempts,
                "error": last_error,
            }),
        )
        .await;
        false
    }

    pub async fn stop_service(&self, name: &str) -> Result<bool> {
        let entry = self.require(name).await?;
        Ok(self.stop_entry(&entry).await)
    }

    async fn stop_entry(&self, entry: &ServiceEntry) -> bool {
        let _op = entry.op_lock.lock().await;
        self.stop_entry_locked(entry).await
    }

    /// Caller holds the op lock
    async fn stop_entry_locked(&self, entry: &ServiceEntry) -> bool {
        if entry.status().await == ServiceStatus::Stopped && !entry.service.is_running().await {
            return true;
        }
        if !entry.set_status(ServiceStatus::Stopping).await {
            // Stopped but the service reports itself running
            entry.set_status(ServiceStatus::Error).await;
            entry.set_status(ServiceStatus::Stopping).await;
        }

        let timeout = self.config.stop_timeout;
        // The outer deadline leaves the service its own grace period first
        match contained("stop", timeout * 2, entry.service.stop(timeout)).await {
            Ok(()) => {
                entry.set_status(ServiceStatus::Stopped).await;
                info!("[COORD] {} stopped", entry.name);
                true
            }
            Err(reason) => {
                entry.state.write().await.last_error = Some(reason.clone());
                entry.set_status(ServiceStatus::Error).await;
                self.alert(
                    AlertType::StopFailed,
                    &entry.name,
                    format!("Service {} failed to stop", entry.name),
                    reason.clone(),
                    json!({ "error": reason }),
                )
                .await;
                false
            }
        }
    }

    /// Stop then start, without resetting the restart budget
    pub async fn restart_service(&self, name: &str) -> Result<bool> {
        let entry = self.require(name).await?;
        let _op = entry.op_lock.lock().await;
        self.stop_entry_locked(&entry).await;
        Ok(self.start_entry(&entry).await)
    }

    /// Start every enabled service in registration order
    ///
    /// Disabled services count as successes without being started.
    pub async fn start_all_services(&self) -> BTreeMap<String, bool> {
        let entries: Vec<Arc<ServiceEntry>> = self.services.read().await.clone();
        let mut results = BTreeMap::new();
        for entry in entries {
            let enabled = entry.state.read().await.config.enabled;
            let started = if enabled {
                self.start_service(&entry.name).await.unwrap_or(false)
            } else {
                info!("[COORD] {} is disabled, skipping", entry.name);
                true
            };
            results.insert(entry.name.clone(), started);
        }
        results
    }

    /// Stop every service in reverse registration order
    pub async fn stop_all_services(&self) -> BTreeMap<String, bool> {
        let entries: Vec<Arc<ServiceEntry>> = self.services.read().await.clone();
        let mut results = BTreeMap::new();
        for entry in entries.iter().rev() {
            results.insert(entry.name.clone(), self.stop_entry(entry).await);
        }
        results
    }

    pub async fn get_service_state(&self, name: &str) -> Option<ServiceState> {
        match self.entry(name).await {
            Some(entry) => Some(entry.state.read().await.clone()),
            None => None,
        }
    }

    pub async fn get_all_states(&self) -> Vec<ServiceState> {
        let entries: Vec<Arc<ServiceEntry>> = self.services.read().await.clone();
        let mut states = Vec::with_capacity(entries.len());
        for entry in entries {
            states.push(entry.state.read().await.clone());
        }
        states
    }

    /// Run one health pass over every active service, concurrently
    pub async fn check_all_services(&self) {
        let entries: Vec<Arc<ServiceEntry>> = self.services.read().await.clone();
        join_all(entries.iter().map(|e| self.check_service(e))).await;
    }

    async fn check_service(&self, entry: &ServiceEntry) {
        let _op = entry.op_lock.lock().await;
        let (status, config, last_check) = {
            let state = entry.state.read().await;
            (state.status, state.config.clone(), state.last_health_check)
        };
        if !status.is_active() {
            return;
        }
        if let Some(last) = last_check {
            let due = last + config.health_check_interval().as_millis() as u64;
            if now_ms() < due {
                return;
            }
        }

        let outcome = contained(
            "health check",
            self.config.health_check_timeout,
            entry.service.health_check(),
        )
        .await;
        let failure = match outcome {
            Ok(report) if report.is_healthy() => None,
            Ok(report) => Some(format!("reported {:?}", report.status)),
            Err(reason) => Some(reason),
        };

        let failures = {
            let mut state = entry.state.write().await;
            state.last_health_check = Some(now_ms());
            match &failure {
                None => state.consecutive_failures = 0,
                Some(reason) => {
                    state.consecutive_failures += 1;
                    state.last_error = Some(reason.clone());
                }
            }
            state.consecutive_failures
        };

        let Some(reason) = failure else {
            entry.set_status(ServiceStatus::Healthy).await;
            return;
        };

        entry.set_status(ServiceStatus::Unhealthy).await;
        warn!(
            "[COORD] {} health check failed ({}/{}): {}",
            entry.name, failures, self.config.failure_threshold, reason
        );
        if failures < self.config.failure_threshold {
            return;
        }

        if failures == self.config.failure_threshold {
            self.alert(
                AlertType::HealthCheckFailed,
                &entry.name,
                format!("Service {} is unhealthy", entry.name),
                format!("{} consecutive failed health checks: {}", failures, reason),
                json!({
                    "consecutive_failures": failures,
                    "error": reason,
                }),
            )
            .await;
        }

        if config.auto_restart {
            self.auto_restart(entry, &config).await;
        }
    }

    /// Caller holds the op lock
    async fn auto_restart(&self, entry: &ServiceEntry, config: &ServiceConfig) {
        let restart_count = entry.state.read().await.restart_count;
        if restart_count >= config.max_restart_attempts {
            entry.set_status(ServiceStatus::Error).await;
            error!(
                "[COORD] {} exhausted {} restart attempts",
                entry.name, config.max_restart_attempts
            );
            self.alert(
                AlertType::RestartExhausted,
                &entry.name,
                format!("Service {} will not be restarted again", entry.name),
                format!("{} restart attempts used", restart_count),
                json!({ "max_restart_attempts": config.max_restart_attempts }),
            )
            .await;
            return;
        }

        let attempt = restart_count + 1;
        entry.state.write().await.restart_count = attempt;
        self.alert(
            AlertType::AutoRestart,
            &entry.name,
            format!("Restarting service {}", entry.name),
            format!("Restart {} of {}", attempt, config.max_restart_attempts),
            json!({
                "restart_attempt": attempt,
                "max_restart_attempts": config.max_restart_attempts,
            }),
        )
        .await;

        self.stop_entry_locked(entry).await;
        tokio::time::sleep(config.restart_delay()).await;
        if self.start_entry(entry).await {
            info!("[COORD] {} restarted", entry.name);
        } else {
            self.alert(
                AlertType::RestartFailed,
                &entry.name,
                format!("Service {} did not come back", entry.name),
                format!("Restart {} failed", attempt),
                json!({ "restart_attempt": attempt }),
            )
            .await;
        }
    }

    /// Start every enabled service and the health loop
    ///
    /// Returns `false` if any enabled service failed to start; the ones that
    /// did start keep running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let results = self.start_all_services().await;
        let failed: Vec<&String> = results
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name)
            .collect();

        let mut task = self.task.lock().await;
        if task.is_none() {
            let coordinator = self.clone();
            let interval = self.config.health_check_interval;
            *task = Some(BackgroundTask::spawn("coordinator-health", move |mut shutdown| async move {
                while !sleep_or_shutdown(interval, &mut shutdown).await {
                    coordinator.check_all_services().await;
                }
            }));
        }

        if failed.is_empty() {
            info!("[COORD] All services started");
            true
        } else {
            error!("[COORD] Services failed to start: {:?}", failed);
            false
        }
    }

    /// Stop the health loop, then every service in reverse order
    pub async fn stop(&self, timeout: Duration) -> bool {
        let task = self.task.lock().await.take();
        let loop_clean = match task {
            Some(task) => task.stop(timeout).await,
            None => true,
        };
        let stopped = tokio::time::timeout(timeout, self.stop_all_services())
            .await
            .map(|results| results.values().all(|ok| *ok))
            .unwrap_or_else(|_| {
                error!("[COORD] Services did not stop within {:?}", timeout);
                false
            });
        info!("[COORD] Coordinator stopped");
        loop_clean && stopped
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Aggregate over every enabled service
    pub async fn health_check(&self) -> HealthReport {
        let states = self.get_all_states().await;
        let mut services = serde_json::Map::new();
        let mut status = HealthStatus::Healthy;

        for state in &states {
            services.insert(
                state.name.clone(),
                json!({
                    "status": state.status,
                    "consecutive_failures": state.consecutive_failures,
                    "restart_count": state.restart_count,
                }),
            );
            if !state.config.enabled {
                continue;
            }
            match state.status {
                ServiceStatus::Running | ServiceStatus::Healthy => {}
                ServiceStatus::Unhealthy | ServiceStatus::Starting | ServiceStatus::Stopping => {
                    if status == HealthStatus::Healthy {
                        status = HealthStatus::Degraded;
                    }
                }
                ServiceStatus::Error | ServiceStatus::Stopped => status = HealthStatus::Unhealthy,
            }
        }

        HealthReport::healthy()
            .with_status(status)
            .with("running", self.is_running().await)
            .with("service_count", states.len())
            .with("services", Value::Object(services))
    }
}
