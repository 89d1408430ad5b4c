//! Runtime composition
//!
//! This module handles:
//! - Routing submissions to the live queue or the offline buffer
//! - Flushing the buffer when the network and backend connection recover
//! - Dispatch workers with ack/nack delivery to the downstream dispatcher
//! - Assembling every component and registering it with the coordinator

mod context;
mod service;

pub use context::{RuntimeContext, BACKEND_CONNECTION};
pub use service::{
    OfflineQueueConfig, OfflineQueueService, QueueForwarder, RuntimeStatistics, SubmitOutcome,
};
