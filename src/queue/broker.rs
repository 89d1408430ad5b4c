//! Queue topology for broker-backed deployments
//!
//! A broker-backed queue must be durable and paired with a dead-letter
//! exchange so that exhausted messages stay observable. This describes the
//! declaration in broker-neutral terms; a transport maps it onto its client.

use edge_shared::message::BROKER_MAX_PRIORITY;
use serde::Serialize;

/// Declaration of a durable priority queue and its dead-letter route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDeclaration {
    pub queue: String,
    pub durable: bool,
    /// Value for `x-max-priority`
    pub max_priority: u8,
    /// Value for `x-dead-letter-exchange`
    pub dead_letter_exchange: String,
    /// Value for `x-dead-letter-routing-key`
    pub dead_letter_routing_key: String,
    /// Queue bound to the dead-letter exchange
    pub dead_letter_queue: String,
}

impl QueueDeclaration {
    pub fn durable_with_dead_letter(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            dead_letter_exchange: format!("{}.dlx", queue),
            dead_letter_routing_key: format!("{}.dead", queue),
            dead_letter_queue: format!("{}.dlq", queue),
            max_priority: BROKER_MAX_PRIORITY,
            durable: true,
            queue,
        }
    }

    /// Queue arguments in the `x-*` form brokers expect
    pub fn arguments(&self) -> Vec<(&'static str, serde_json::Value)> {
        vec![
            ("x-max-priority", self.max_priority.into()),
            (
                "x-dead-letter-exchange",
                self.dead_letter_exchange.clone().into(),
            ),
            (
                "x-dead-letter-routing-key",
                self.dead_letter_routing_key.clone().into(),
            ),
        ]
    }
}
