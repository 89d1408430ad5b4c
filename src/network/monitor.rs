//! Network monitor
//!
//! Periodically probes a reference endpoint and smooths the raw results into
//! an ONLINE/OFFLINE status with separate failure and recovery thresholds.

use super::probe::{Probe, TcpProbe};
use crate::config::duration_ms;
use crate::health::HealthReport;
use crate::notify::Subscribers;
use crate::task::{sleep_or_shutdown, BackgroundTask};
use edge_shared::{defaults, now_ms, NetworkStatus};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Configuration for the network monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Reference endpoint probed for reachability
    pub host: String,
    pub port: u16,
    #[serde(rename = "check_interval_ms", with = "duration_ms")]
    pub check_interval: Duration,
    #[serde(rename = "probe_timeout_ms", with = "duration_ms")]
    pub probe_timeout: Duration,
    /// Consecutive failed probes before going OFFLINE
    pub failure_threshold: u32,
    /// Consecutive successful probes before going ONLINE
    pub recovery_threshold: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "8.8.8.8".into(),
            port: 53,
            check_interval: Duration::from_millis(defaults::NETWORK_CHECK_INTERVAL_MS),
            probe_timeout: Duration::from_secs(3),
            failure_threshold: defaults::NETWORK_FAILURE_THRESHOLD,
            recovery_threshold: defaults::NETWORK_RECOVERY_THRESHOLD,
        }
    }
}

/// Smoothed view of network reachability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkState {
    pub status: NetworkStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Latency of the last successful probe
    pub latency_ms: Option<f64>,
    /// Milliseconds since Unix epoch of the last probe
    pub last_check: Option<u64>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            status: NetworkStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            latency_ms: None,
            last_check: None,
        }
    }
}

impl NetworkState {
    /// Fold one probe result in; returns the new status if it changed
    fn record(&mut self, latency: Option<Duration>, config: &NetworkConfig) -> Option<NetworkStatus> {
        self.last_check = Some(now_ms());
        match latency {
            Some(latency) => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
                self.latency_ms = Some(latency.as_secs_f64() * 1000.0);
                if self.status != NetworkStatus::Online
                    && self.consecutive_successes >= config.recovery_threshold
                {
                    self.status = NetworkStatus::Online;
                    return Some(NetworkStatus::Online);
                }
            }
            None => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
                self.latency_ms = None;
                if self.status != NetworkStatus::Offline
                    && self.consecutive_failures >= config.failure_threshold
                {
                    self.status = NetworkStatus::Offline;
                    return Some(NetworkStatus::Offline);
                }
            }
        }
        None
    }
}

/// Probes reachability and notifies subscribers on status transitions
pub struct NetworkMonitor {
    config: NetworkConfig,
    probe: Arc<dyn Probe>,
    state: RwLock<NetworkState>,
    subscribers: Subscribers<NetworkStatus, NetworkState>,
    /// One probe at a time so counters advance in order
    check_lock: Mutex<()>,
    task: Mutex<Option<BackgroundTask>>,
}

impl NetworkMonitor {
    /// Monitor probing `config.host:config.port` over TCP
    pub fn new(config: NetworkConfig) -> Self {
        let probe = Arc::new(TcpProbe::new(config.host.as_str(), config.port, config.probe_timeout));
        Self::with_probe(config, probe)
    }

    pub fn with_probe(config: NetworkConfig, probe: Arc<dyn Probe>) -> Self {
        Self {
            config,
            probe,
            state: RwLock::new(NetworkState::default()),
            subscribers: Subscribers::new("NET"),
            check_lock: Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub async fn state(&self) -> NetworkState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> NetworkStatus {
        self.state.read().await.status
    }

    pub async fn is_online(&self) -> bool {
        self.status().await.is_online()
    }

    /// Register a synchronous status-change callback
    pub async fn add_callback<F>(&self, callback: F)
    where
        F: Fn(NetworkStatus, NetworkStatus, NetworkState) + Send + Sync + 'static,
    {
        self.subscribers.add(callback).await;
    }

    /// Register an asynchronous status-change callback
    pub async fn add_async_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(NetworkStatus, NetworkStatus, NetworkState) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribers.add_async(callback).await;
    }

    /// Run one probe and update the smoothed state
    ///
    /// Returns whether the probe itself succeeded. Subscribers are notified
    /// only when the smoothed status actually changes.
    pub async fn check_connection(&self) -> bool {
        let guard = self.check_lock.lock().await;

        let latency = match AssertUnwindSafe(self.probe.probe()).catch_unwind().await {
            Ok(Ok(latency)) => Some(latency),
            Ok(Err(e)) => {
                debug!("[NET] Probe of {} failed: {}", self.probe.target(), e);
                None
            }
            Err(_) => {
                warn!("[NET] Probe of {} panicked", self.probe.target());
                None
            }
        };

        let (old, transition, snapshot) = {
            let mut state = self.state.write().await;
            let old = state.status;
            let transition = state.record(latency, &self.config);
            (old, transition, state.clone())
        };

        // Subscribers run outside the lock so a slow one cannot stall checks
        drop(guard);

        if let Some(new) = transition {
            match new {
                NetworkStatus::Online => info!("[NET] {} -> {} ({})", old, new, self.probe.target()),
                _ => warn!("[NET] {} -> {} ({})", old, new, self.probe.target()),
            }
            self.subscribers.notify(old, new, snapshot).await;
        }

        latency.is_some()
    }

    /// Start the periodic prober; no-op if already running
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let monitor = self.clone();
        let interval = self.config.check_interval;
        *task = Some(BackgroundTask::spawn("network-monitor", move |mut shutdown| async move {
            loop {
                monitor.check_connection().await;
                if sleep_or_shutdown(interval, &mut shutdown).await {
                    break;
                }
            }
        }));
        info!(
            "[NET] Monitoring {} every {:?}",
            self.probe.target(),
            interval
        );
    }

    /// Stop the prober, waiting up to `timeout` for an in-flight probe
    pub async fn stop(&self, timeout: Duration) -> bool {
        let task = self.task.lock().await.take();
        match task {
            Some(task) => {
                let clean = task.stop(timeout).await;
                info!("[NET] Monitoring stopped");
                clean
            }
            None => true,
        }
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
        let running = self.is_running().await;
        let state = self.state().await;

        let report = if !running {
            HealthReport::unhealthy("monitor not running")
        } else if state.status == NetworkStatus::Offline {
            HealthReport::degraded("network offline")
        } else {
            HealthReport::healthy()
        };
        report
            .with("running", running)
            .with("target", self.probe.target())
            .with("network_state", serde_json::to_value(&state).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Probe that replays a fixed script, then keeps failing
    struct ScriptedProbe {
        script: std::sync::Mutex<VecDeque<bool>>,
    }

    impl ScriptedProbe {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.iter().copied().collect()),
            })
        }

        fn push(&self, outcome: bool) {
            self.script.lock().unwrap().push_back(outcome);
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self) -> anyhow::Result<Duration> {
            match self.script.lock().unwrap().pop_front() {
                Some(true) => Ok(Duration::from_millis(4)),
                _ => Err(anyhow!("scripted failure")),
            }
        }

        fn target(&self) -> String {
            "scripted".into()
        }
    }

    struct PanickingProbe;

    #[async_trait]
    impl Probe for PanickingProbe {
        async fn probe(&self) -> anyhow::Result<Duration> {
            panic!("probe bug")
        }

        fn target(&self) -> String {
            "panicking".into()
        }
    }

    fn config(failure_threshold: u32, recovery_threshold: u32) -> NetworkConfig {
        NetworkConfig {
            failure_threshold,
            recovery_threshold,
            check_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn transition_log(
        monitor: &NetworkMonitor,
    ) -> Arc<std::sync::Mutex<Vec<(NetworkStatus, NetworkStatus)>>> {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = log.clone();
        monitor
            .add_callback(move |old, new, _state| sink.lock().unwrap().push((old, new)))
            .await;
        log
    }

    #[tokio::test]
    async fn test_hysteresis_requires_consecutive_results() {
        let probe = ScriptedProbe::new(&[true, true, false, true, false, false]);
        let monitor = NetworkMonitor::with_probe(config(2, 2), probe);
        let log = transition_log(&monitor).await;

        assert!(monitor.check_connection().await);
        assert_eq!(monitor.status().await, NetworkStatus::Unknown);
        monitor.check_connection().await;
        assert_eq!(monitor.status().await, NetworkStatus::Online);

        // A single flip below threshold changes nothing
        assert!(!monitor.check_connection().await);
        monitor.check_connection().await;
        assert_eq!(monitor.status().await, NetworkStatus::Online);
        assert_eq!(log.lock().unwrap().len(), 1);

        monitor.check_connection().await;
        monitor.check_connection().await;
        assert_eq!(monitor.status().await, NetworkStatus::Offline);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (NetworkStatus::Unknown, NetworkStatus::Online),
                (NetworkStatus::Online, NetworkStatus::Offline),
            ]
        );
    }

    #[tokio::test]
    async fn test_thresholds_are_independent() {
        let probe = ScriptedProbe::new(&[false]);
        let monitor = NetworkMonitor::with_probe(config(1, 3), probe.clone());
        monitor.check_connection().await;
        assert_eq!(monitor.status().await, NetworkStatus::Offline);

        for _ in 0..2 {
            probe.push(true);
            monitor.check_connection().await;
            assert_eq!(monitor.status().await, NetworkStatus::Offline);
        }
        probe.push(true);
        monitor.check_connection().await;
        assert_eq!(monitor.status().await, NetworkStatus::Online);

        let state = monitor.state().await;
        assert_eq!(state.consecutive_successes, 3);
        assert!(state.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_panicking_probe_counts_as_failure() {
        let monitor = NetworkMonitor::with_probe(config(1, 1), Arc::new(PanickingProbe));
        assert!(!monitor.check_connection().await);
        assert_eq!(monitor.status().await, NetworkStatus::Offline);
    }

    #[tokio::test]
    async fn test_background_prober_drives_callbacks() {
        let probe = ScriptedProbe::new(&[true, true]);
        let monitor = Arc::new(NetworkMonitor::with_probe(config(2, 2), probe));
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        monitor
            .add_async_callback(move |_old, new, state| {
                let counter = counter.clone();
                async move {
                    assert_eq!(new, state.status);
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        monitor.start().await;
        monitor.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.is_running().await);
        assert!(monitor.stop(Duration::from_secs(1)).await);
        assert!(!monitor.is_running().await);

        // Online, then offline once the script runs dry
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.status().await, NetworkStatus::Offline);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_stall_checks() {
        let probe = ScriptedProbe::new(&[false, true]);
        let monitor = Arc::new(NetworkMonitor::with_probe(config(1, 2), probe));
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        monitor
            .add_async_callback(move |_, _, _| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            })
            .await;

        // Goes OFFLINE and parks inside the subscriber
        let first = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.check_connection().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(monitor.status().await, NetworkStatus::Offline);

        let second = tokio::time::timeout(Duration::from_millis(200), monitor.check_connection())
            .await
            .expect("second probe blocked behind the subscriber");
        assert!(second);
        assert_eq!(monitor.state().await.consecutive_successes, 1);

        release.notify_one();
        assert!(!first.await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check_reports_state() {
        let monitor = Arc::new(NetworkMonitor::with_probe(
            config(1, 1),
            ScriptedProbe::new(&[]),
        ));
        let report = monitor.health_check().await;
        assert_eq!(report.details["running"], false);
        assert_eq!(report.details["network_state"]["status"], "unknown");
        assert!(!report.is_healthy());
    }
}
