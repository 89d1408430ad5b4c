//! Service supervision
//!
//! This module handles:
//! - Registration of named services behind a common lifecycle trait
//! - Startup with bounded linear retry and alerts
//! - Periodic health checks with threshold-triggered auto-restart
//! - Supervision of external OS processes

mod process;
mod service;
mod supervisor;

pub use process::{ProcessService, ProcessSpec};
pub use service::{Service, ServiceConfig};
pub use supervisor::{
    AlertCallback, AlertType, CoordinatorConfig, ServiceCoordinator, ServiceState,
};
