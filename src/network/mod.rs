//! Network reachability monitoring
//!
//! This module handles:
//! - Periodic probing of a reference endpoint
//! - Hysteresis between ONLINE and OFFLINE
//! - Status-change notification for the buffer and coordinator

mod monitor;
mod probe;

pub use monitor::{NetworkConfig, NetworkMonitor, NetworkState};
pub use probe::{Probe, TcpProbe};
