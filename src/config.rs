//! Runtime configuration
//!
//! Every section has working defaults, so an empty file (or no file at all)
//! yields a runnable runtime. Durations are written as integer milliseconds.

use crate::buffer::BufferConfig;
use crate::connection::ConnectionConfig;
use crate::coordinator::{CoordinatorConfig, ProcessSpec, ServiceConfig};
use crate::error::{Result, RuntimeError};
use crate::network::NetworkConfig;
use crate::queue::QueueConfig;
use crate::runtime::OfflineQueueConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "EDGE_RUNTIME_CONFIG";
/// Environment override for `device_id`
pub const DEVICE_ID_ENV: &str = "EDGE_RUNTIME_DEVICE_ID";
/// Environment override for `buffer.path`
pub const BUFFER_PATH_ENV: &str = "EDGE_RUNTIME_BUFFER_PATH";

/// Top-level configuration for the edge runtime
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Identifier of the robot this runtime serves
    pub device_id: String,
    /// Default tracing directive when `RUST_LOG` is unset
    pub log_filter: String,
    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
    /// Grace period for the whole shutdown sequence
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    pub queue: QueueConfig,
    pub buffer: BufferConfig,
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
    pub coordinator: CoordinatorConfig,
    pub runtime: OfflineQueueConfig,
    /// Per-service supervision options keyed by service name
    pub services: HashMap<String, ServiceConfig>,
    /// External processes supervised by the coordinator
    pub processes: Vec<ProcessSpec>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_id: "edge-001".into(),
            log_filter: "info".into(),
            log_json: false,
            shutdown_timeout: Duration::from_secs(10),
            queue: QueueConfig::default(),
            buffer: BufferConfig::default(),
            network: NetworkConfig::default(),
            connection: ConnectionConfig::default(),
            coordinator: CoordinatorConfig::default(),
            runtime: OfflineQueueConfig::default(),
            services: HashMap::new(),
            processes: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML document
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    /// Load from `path`, or from `EDGE_RUNTIME_CONFIG`, or fall back to
    /// defaults. Environment overrides are applied and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path: Option<PathBuf> = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let source = std::fs::read_to_string(&path).map_err(|e| {
                    RuntimeError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&source)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(device_id) = std::env::var(DEVICE_ID_ENV) {
            if !device_id.is_empty() {
                self.device_id = device_id;
            }
        }
        if let Some(path) = std::env::var_os(BUFFER_PATH_ENV) {
            self.buffer.path = Some(PathBuf::from(path));
        }
    }

    /// Reject settings that would make a component unusable
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(RuntimeError::Config("device_id must not be empty".into()));
        }
        if self.queue.max_size == 0 {
            return Err(RuntimeError::Config("queue.max_size must be > 0".into()));
        }
        if self.buffer.max_size == 0 {
            return Err(RuntimeError::Config("buffer.max_size must be > 0".into()));
        }
        if self.network.failure_threshold == 0 || self.network.recovery_threshold == 0 {
            return Err(RuntimeError::Config(
                "network thresholds must be > 0".into(),
            ));
        }
        if self.network.check_interval.is_zero() {
            return Err(RuntimeError::Config(
                "network.check_interval_ms must be > 0".into(),
            ));
        }
        if self.connection.initial_reconnect_delay > self.connection.max_reconnect_delay {
            return Err(RuntimeError::Config(
                "connection.initial_reconnect_delay_ms exceeds max_reconnect_delay_ms".into(),
            ));
        }
        if self.coordinator.failure_threshold == 0 {
            return Err(RuntimeError::Config(
                "coordinator.failure_threshold must be > 0".into(),
            ));
        }
        if self.runtime.worker_count == 0 {
            return Err(RuntimeError::Config("runtime.worker_count must be > 0".into()));
        }
        for spec in &self.processes {
            if spec.name.is_empty() || spec.program.is_empty() {
                return Err(RuntimeError::Config(
                    "every process needs a name and a program".into(),
                ));
            }
        }
        Ok(())
    }

    /// Supervision options for `name`, falling back to defaults
    pub fn service_config(&self, name: &str) -> ServiceConfig {
        self.services.get(name).cloned().unwrap_or_default()
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
