//! Queue abstraction for pluggable delivery backends

use crate::health::HealthReport;
use async_trait::async_trait;
use edge_shared::Message;
use std::time::Duration;

/// A priority queue with at-least-once delivery
///
/// Implementations hand out the highest-priority, oldest message first and
/// keep it in flight until it is acknowledged or negatively acknowledged.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Add a message; `false` when the queue is full or the message is invalid
    async fn enqueue(&self, message: Message) -> bool;

    /// Take the next message, waiting up to `timeout` (zero polls once)
    async fn dequeue(&self, timeout: Duration) -> Option<Message>;

    /// Permanently remove a message; `false` for unknown or already acked ids
    async fn ack(&self, id: &str) -> bool;

    /// Requeue (within the retry budget) or dead-letter an in-flight message
    async fn nack(&self, id: &str, requeue: bool) -> bool;

    /// Number of messages ready for delivery
    async fn size(&self) -> usize;

    async fn health_check(&self) -> HealthReport;

    /// Human-readable backend name
    fn name(&self) -> &'static str;
}
