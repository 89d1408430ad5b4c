//! Edge Runtime Shared Types
//!
//! This crate provides the message model and status types shared by the
//! queue, offline buffer, monitors and service coordinator of the edge
//! command runtime.

pub mod command;
pub mod message;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use command::{CommandPayload, PayloadError};
pub use message::{Message, Payload, Priority};
pub use state_machine::{ConnectionStatus, NetworkStatus, ServiceStatus};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default tuning parameters for the runtime
pub mod defaults {
    /// Maximum number of ready messages held by the live queue
    pub const QUEUE_MAX_SIZE: usize = 10_000;

    /// Maximum redeliveries of a message before it is dead-lettered
    pub const MESSAGE_MAX_RETRIES: u32 = 3;

    /// Maximum dead-lettered messages retained for inspection
    pub const DEAD_LETTER_CAPACITY: usize = 1_000;

    /// Maximum entries held by the offline buffer
    pub const BUFFER_MAX_SIZE: usize = 5_000;

    /// Time-to-live for a buffered entry
    pub const BUFFER_TTL_MS: u64 = 24 * 60 * 60 * 1000;

    /// Flush attempts before a buffered entry is dropped
    pub const BUFFER_MAX_ATTEMPTS: u32 = 5;

    /// Interval between network probes
    pub const NETWORK_CHECK_INTERVAL_MS: u64 = 5_000;

    /// Consecutive failed probes before reporting OFFLINE
    pub const NETWORK_FAILURE_THRESHOLD: u32 = 2;

    /// Consecutive successful probes before reporting ONLINE
    pub const NETWORK_RECOVERY_THRESHOLD: u32 = 2;

    /// Initial reconnect delay
    pub const RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;

    /// Upper bound for the reconnect delay
    pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

    /// Reconnect attempts before a connection is marked FAILED
    pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;

    /// Coordinator-wide health check interval
    pub const HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

    /// Consecutive failed health checks before alerting and restarting
    pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_thresholds_are_small() {
        assert!(defaults::NETWORK_FAILURE_THRESHOLD >= 1);
        assert!(defaults::NETWORK_RECOVERY_THRESHOLD >= 1);
        assert!(defaults::RECONNECT_INITIAL_DELAY_MS <= defaults::RECONNECT_MAX_DELAY_MS);
    }
}
