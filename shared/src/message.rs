//! Message value object carried through the queue and offline buffer

use crate::{defaults, now_ms};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, insertion-ordered payload mapping
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Delivery priority tiers, lowest first so that `Ord` follows urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Highest priority value understood by AMQP-style brokers (`x-max-priority`)
pub const BROKER_MAX_PRIORITY: u8 = 9;

impl Priority {
    /// All tiers from most to least urgent
    pub const DESCENDING: [Priority; 4] =
        [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low];

    /// Index of the tier, 0 for LOW up to 3 for URGENT
    pub fn rank(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    /// Inverse of [`Priority::rank`]
    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            _ => None,
        }
    }

    /// Map the tier onto a broker's native 0..=9 priority range
    pub fn broker_priority(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 4,
            Priority::High => 7,
            Priority::Urgent => BROKER_MAX_PRIORITY,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Urgent => write!(f, "URGENT"),
        }
    }
}

/// A command message with its retry bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: Payload,
    pub priority: Priority,
    /// Creation time in milliseconds since Unix epoch
    pub timestamp: u64,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Message {
    /// Create a NORMAL priority message with a fresh id and trace id
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            priority: Priority::Normal,
            timestamp: now_ms(),
            trace_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            retry_count: 0,
            max_retries: defaults::MESSAGE_MAX_RETRIES,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether a negative acknowledgement may still requeue this message
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
