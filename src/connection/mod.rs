//! Connection management for external endpoints
//!
//! This module handles:
//! - Connect/disconnect lifecycle behind a pluggable connector
//! - Exponential backoff with jitter on reconnection
//! - FAILED as a terminal state until an explicit reset
//! - A named pool for tracking several endpoints uniformly

mod connector;
mod manager;
mod pool;

pub use connector::{Connector, TcpConnector};
pub use manager::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use pool::{ConnectionPool, PoolStats};
