//! Priority message queue
//!
//! This module handles:
//! - Strict priority ordering with FIFO inside each tier
//! - In-flight tracking for ack/nack (at-least-once delivery)
//! - Bounded capacity as the backpressure signal
//! - Dead-lettering of messages that exhaust their retry budget

mod broker;
mod priority;
mod traits;

pub use broker::QueueDeclaration;
pub use priority::{DeadLetter, PriorityQueue, QueueConfig, QueueStatistics};
pub use traits::MessageQueue;
