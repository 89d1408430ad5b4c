//! In-process priority queue with in-flight tracking and a dead-letter sink

use super::traits::MessageQueue;
use crate::health::HealthReport;
use async_trait::async_trait;
use edge_shared::{defaults, now_ms, Message, Priority};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for the live queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Name used in logs and health reports
    pub name: String,
    /// Maximum number of ready messages
    pub max_size: usize,
    /// Dead-lettered messages kept for inspection
    pub dead_letter_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "commands".into(),
            max_size: defaults::QUEUE_MAX_SIZE,
            dead_letter_capacity: defaults::DEAD_LETTER_CAPACITY,
        }
    }
}

/// A message that exhausted its retry budget or was rejected outright
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
    pub dead_at: u64,
}

/// Lifetime counters for the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
    pub total_requeued: u64,
    pub total_dead_lettered: u64,
    pub rejected_full: u64,
    pub in_flight: usize,
    pub dead_letter_count: usize,
}

#[derive(Default)]
struct QueueState {
    /// Ready messages, one FIFO per tier, indexed by `Priority::rank`
    tiers: [VecDeque<Message>; 4],
    /// Delivered but not yet acked or nacked
    in_flight: HashMap<String, Message>,
    dead_letters: VecDeque<DeadLetter>,
    stats: QueueStatistics,
}

impl QueueState {
    fn ready_len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn contains(&self, id: &str) -> bool {
        self.in_flight.contains_key(id) || self.tiers.iter().any(|t| t.iter().any(|m| m.id == id))
    }

    fn pop_next(&mut self) -> Option<Message> {
        Priority::DESCENDING
            .iter()
            .find_map(|p| self.tiers[p.rank()].pop_front())
    }

    fn remove_ready(&mut self, id: &str) -> Option<Message> {
        for tier in self.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|m| m.id == id) {
                return tier.remove(pos);
            }
        }
        None
    }

    fn dead_letter(&mut self, message: Message, reason: String, capacity: usize) {
        self.stats.total_dead_lettered += 1;
        if capacity == 0 {
            return;
        }
        while self.dead_letters.len() >= capacity {
            self.dead_letters.pop_front();
        }
        self.dead_letters.push_back(DeadLetter {
            message,
            reason,
            dead_at: now_ms(),
        });
    }
}

/// Strict-priority, FIFO-within-tier queue
///
/// Messages move from a ready tier to the in-flight set on `dequeue` and
/// leave it on `ack` (discarded) or `nack` (requeued at the back of their
/// tier, or dead-lettered once the retry budget is spent).
pub struct PriorityQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    available: Notify,
}

impl PriorityQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self::new(QueueConfig {
            max_size,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    /// Number of messages delivered but not yet settled
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Ready messages per tier, most urgent first
    pub async fn tier_sizes(&self) -> Vec<(Priority, usize)> {
        let state = self.state.lock().await;
        Priority::DESCENDING
            .iter()
            .map(|p| (*p, state.tiers[p.rank()].len()))
            .collect()
    }

    pub async fn statistics(&self) -> QueueStatistics {
        let state = self.state.lock().await;
        QueueStatistics {
            in_flight: state.in_flight.len(),
            dead_letter_count: state.dead_letters.len(),
            ..state.stats.clone()
        }
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.iter().cloned().collect()
    }

    /// Return every in-flight message to the front of its tier, e.g. after
    /// the consumers holding them were shut down
    pub async fn requeue_in_flight(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut returned: Vec<Message> = state.in_flight.drain().map(|(_, m)| m).collect();
        // Oldest ends up first once pushed to the front in reverse
        returned.sort_by_key(|m| std::cmp::Reverse(m.timestamp));
        let count = returned.len();
        for message in returned {
            let rank = message.priority.rank();
            state.tiers[rank].push_front(message);
        }
        drop(state);
        if count > 0 {
            self.available.notify_waiters();
            debug!("[QUEUE] Returned {} in-flight messages", count);
        }
        count
    }

    /// Put one in-flight message back at the front of its tier with its
    /// retry count untouched; `false` if it is not in flight
    pub async fn release(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(message) = state.in_flight.remove(id) else {
            warn!("[QUEUE] Release of unknown message {}", id);
            return false;
        };
        let rank = message.priority.rank();
        state.tiers[rank].push_front(message);
        drop(state);

        self.available.notify_one();
        debug!("[QUEUE] Released {} undelivered", id);
        true
    }

    async fn try_take(&self) -> Option<Message> {
        let mut state = self.state.lock().await;
        let message = state.pop_next()?;
        state.stats.total_dequeued += 1;
        state.in_flight.insert(message.id.clone(), message.clone());
        Some(message)
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl MessageQueue for PriorityQueue {
    async fn enqueue(&self, message: Message) -> bool {
        if message.id.is_empty() {
            warn!("[QUEUE] Rejected message without id");
            return false;
        }

        let mut state = self.state.lock().await;
        if state.ready_len() >= self.config.max_size {
            state.stats.rejected_full += 1;
            debug!(
                "[QUEUE] {} full ({}), rejecting {}",
                self.config.name, self.config.max_size, message.id
            );
            return false;
        }
        if state.contains(&message.id) {
            warn!("[QUEUE] Duplicate message id {}", message.id);
            return false;
        }

        debug!(
            "[QUEUE] Enqueued {} priority={} trace={}",
            message.id, message.priority, message.trace_id
        );
        let rank = message.priority.rank();
        state.tiers[rank].push_back(message);
        state.stats.total_enqueued += 1;
        drop(state);

        self.available.notify_one();
        true
    }

    async fn dequeue(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before looking so a concurrent enqueue is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_take().await {
                return Some(message);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.try_take().await;
            }
        }
    }

    async fn ack(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.in_flight.remove(id).or_else(|| state.remove_ready(id));

        match removed {
            Some(message) => {
                state.stats.total_acked += 1;
                debug!("[QUEUE] Acked {} (trace={})", id, message.trace_id);
                true
            }
            None => {
                warn!("[QUEUE] Ack for unknown or already acked message {}", id);
                false
            }
        }
    }

    async fn nack(&self, id: &str, requeue: bool) -> bool {
        let mut state = self.state.lock().await;
        let Some(mut message) = state.in_flight.remove(id) else {
            warn!("[QUEUE] Nack for unknown message {}", id);
            return false;
        };
        state.stats.total_nacked += 1;

        if requeue && message.can_retry() {
            message.retry_count += 1;
            debug!(
                "[QUEUE] Requeued {} (retry {}/{})",
                id, message.retry_count, message.max_retries
            );
            let rank = message.priority.rank();
            state.tiers[rank].push_back(message);
            state.stats.total_requeued += 1;
            drop(state);
            self.available.notify_one();
        } else {
            let reason = if requeue {
                format!("retry budget of {} exhausted", message.max_retries)
            } else {
                "rejected without requeue".to_string()
            };
            warn!("[QUEUE] Dead-lettered {}: {}", id, reason);
            let capacity = self.config.dead_letter_capacity;
            state.dead_letter(message, reason, capacity);
        }
        true
    }

    async fn size(&self) -> usize {
        self.state.lock().await.ready_len()
    }

    async fn health_check(&self) -> HealthReport {
        let stats = self.statistics().await;
        let total_size = self.size().await;
        let tiers: serde_json::Map<String, serde_json::Value> = self
            .tier_sizes()
            .await
            .into_iter()
            .map(|(p, n)| (p.to_string(), json!(n)))
            .collect();

        // A full queue is backpressure, not a fault
        HealthReport::healthy()
            .with("type", self.name())
            .with("at_capacity", total_size >= self.config.max_size)
            .with("queue", self.config.name.clone())
            .with("total_size", total_size)
            .with("max_size", self.config.max_size)
            .with("tiers", serde_json::Value::Object(tiers))
            .with("statistics", serde_json::to_value(&stats).unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "in_memory_priority"
    }
}
