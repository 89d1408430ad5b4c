//! Edge command runtime
//!
//! Carries commands from local producers to the robot's execution backend
//! across unreliable links. Messages flow through a bounded priority queue
//! while the backend is reachable and spill into a durable offline buffer
//! when it is not; network and connection monitors decide which, and a
//! service coordinator keeps every component running.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod network;
pub mod notify;
pub mod queue;
pub mod runtime;
pub mod sender;
pub mod task;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use health::{HealthReport, HealthStatus};
pub use runtime::{OfflineQueueService, RuntimeContext, SubmitOutcome};

pub use edge_shared::{
    CommandPayload, ConnectionStatus, Message, NetworkStatus, Payload, Priority, ServiceStatus,
};
