//! Supervised service contract

use crate::health::HealthReport;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A long-running component the coordinator starts, checks and restarts
///
/// Errors and panics from any method are contained by the coordinator and
/// turned into ERROR/UNHEALTHY status plus an alert.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the service up; `Err` means it is not running
    async fn start(&self) -> Result<()>;

    /// Bring the service down within `timeout`
    async fn stop(&self, timeout: Duration) -> Result<()>;

    /// Only a `healthy` report passes
    async fn health_check(&self) -> Result<HealthReport>;

    async fn is_running(&self) -> bool;
}

/// Per-service supervision options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Disabled services are skipped by `start_all_services`
    pub enabled: bool,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub restart_delay_seconds: f64,
    pub health_check_interval_seconds: f64,
    pub startup_timeout_seconds: f64,
    pub startup_retry_enabled: bool,
    /// Retries after the first failed start
    pub max_startup_retry_attempts: u32,
    pub startup_retry_delay_seconds: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_restart: true,
            max_restart_attempts: 3,
            restart_delay_seconds: 5.0,
            health_check_interval_seconds: 30.0,
            startup_timeout_seconds: 30.0,
            startup_retry_enabled: true,
            max_startup_retry_attempts: 3,
            startup_retry_delay_seconds: 2.0,
        }
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

impl ServiceConfig {
    pub fn restart_delay(&self) -> Duration {
        seconds(self.restart_delay_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        seconds(self.health_check_interval_seconds)
    }

    /// Zero disables the startup timeout
    pub fn startup_timeout(&self) -> Duration {
        seconds(self.startup_timeout_seconds)
    }

    pub fn startup_retry_delay(&self) -> Duration {
        seconds(self.startup_retry_delay_seconds)
    }

    /// First attempt plus the configured retries
    pub fn total_startup_attempts(&self) -> u32 {
        if self.startup_retry_enabled {
            1 + self.max_startup_retry_attempts
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_attempts_follow_retry_switch() {
        let mut config = ServiceConfig {
            max_startup_retry_attempts: 4,
            ..Default::default()
        };
        assert_eq!(config.total_startup_attempts(), 5);
        config.startup_retry_enabled = false;
        assert_eq!(config.total_startup_attempts(), 1);
    }

    #[test]
    fn test_negative_and_nan_seconds_clamp_to_zero() {
        let config = ServiceConfig {
            restart_delay_seconds: -1.0,
            startup_timeout_seconds: f64::NAN,
            startup_retry_delay_seconds: 0.25,
            ..Default::default()
        };
        assert_eq!(config.restart_delay(), Duration::ZERO);
        assert_eq!(config.startup_timeout(), Duration::ZERO);
        assert_eq!(config.startup_retry_delay(), Duration::from_millis(250));
    }
}
