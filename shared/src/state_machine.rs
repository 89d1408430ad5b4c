//! Status State Machines
//!
//! Defines the status values reported by the network monitor, connection
//! manager and service coordinator, together with the transitions each one
//! accepts.

use serde::{Deserialize, Serialize};

/// Smoothed reachability of the reference endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    /// No threshold has been reached yet
    Unknown,
    Online,
    Offline,
}

/// Lifecycle of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Connection was lost and backoff reconnection is in progress
    Reconnecting,
    /// Reconnect budget exhausted; terminal until an explicit reset
    Failed,
}

/// Lifecycle of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Healthy,
    Unhealthy,
    Stopping,
    Error,
}

impl NetworkStatus {
    pub fn is_online(self) -> bool {
        self == NetworkStatus::Online
    }
}

impl ConnectionStatus {
    /// Check if a transition from this status to `to` is valid
    pub fn can_transition_to(self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        match (self, to) {
            // Same state is always valid
            (a, b) if a == b => true,

            // Disconnect is unconditional except out of FAILED
            (Connecting | Connected | Reconnecting, Disconnected) => true,

            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Reconnecting) => true,
            // Explicit reconnect from idle
            (Disconnected, Reconnecting) => true,
            (Reconnecting, Connected) => true,
            (Reconnecting, Failed) => true,

            // Explicit operator reset
            (Failed, Disconnected) => true,

            _ => false,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

impl ServiceStatus {
    /// Health checks only run for services in these states
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ServiceStatus::Running | ServiceStatus::Healthy | ServiceStatus::Unhealthy
        )
    }

    /// Check if a transition from this status to `to` is valid
    pub fn can_transition_to(self, to: ServiceStatus) -> bool {
        use ServiceStatus::*;

        match (self, to) {
            (a, b) if a == b => true,

            // Any failure lands in ERROR
            (_, Error) => true,

            (Stopped | Error, Starting) => true,
            (Starting, Running) => true,
            (Running | Healthy | Unhealthy, Healthy | Unhealthy) => true,
            (Running | Healthy | Unhealthy | Error, Stopping) => true,
            (Stopping, Stopped) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkStatus::Unknown => write!(f, "unknown"),
            NetworkStatus::Online => write!(f, "online"),
            NetworkStatus::Offline => write!(f, "offline"),
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_happy_path() {
        use ConnectionStatus::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
    }

    #[test]
    fn test_connection_failed_is_terminal() {
        use ConnectionStatus::*;
        assert!(Reconnecting.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Connected));
        assert!(Failed.can_transition_to(Disconnected));
    }

    #[test]
    fn test_connection_cannot_skip_connecting() {
        assert!(!ConnectionStatus::Disconnected.can_transition_to(ConnectionStatus::Connected));
    }

    #[test]
    fn test_service_lifecycle() {
        use ServiceStatus::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Unhealthy));
        assert!(Unhealthy.can_transition_to(Healthy));
        assert!(Healthy.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Starting.can_transition_to(Error));
    }

    #[test]
    fn test_service_cannot_run_without_starting() {
        assert!(!ServiceStatus::Stopped.can_transition_to(ServiceStatus::Running));
        assert!(!ServiceStatus::Error.can_transition_to(ServiceStatus::Healthy));
    }

    #[test]
    fn test_health_checks_only_for_active_services() {
        assert!(ServiceStatus::Running.is_active());
        assert!(ServiceStatus::Unhealthy.is_active());
        assert!(!ServiceStatus::Starting.is_active());
        assert!(!ServiceStatus::Error.is_active());
        assert!(!ServiceStatus::Stopped.is_active());
    }
}
