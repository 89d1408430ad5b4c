//! Persistence boundary for the offline buffer

use crate::error::Result;
use edge_shared::Message;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// A spooled message awaiting delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEntry {
    pub message: Message,
    /// Milliseconds since Unix epoch
    pub buffered_at: u64,
    /// Milliseconds since Unix epoch; past this the entry may be purged
    pub expires_at: u64,
    pub attempt_count: u32,
}

impl BufferedEntry {
    pub fn new(message: Message, buffered_at: u64, ttl_ms: u64) -> Self {
        Self {
            message,
            buffered_at,
            expires_at: buffered_at.saturating_add(ttl_ms),
            attempt_count: 0,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at
    }
}

/// Result of a bounded insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The store already holds `max_size` entries
    Full,
    /// An entry with the same message id is already spooled
    Duplicate,
}

/// Durable (or in-memory) storage for buffered entries
///
/// Every method is individually atomic. Calls may block, so async callers
/// run them on the blocking pool.
pub trait BufferStore: Send + Sync {
    /// Insert unless the store already holds `max_size` entries
    fn insert_bounded(&self, entry: &BufferedEntry, max_size: usize) -> Result<InsertOutcome>;

    /// Entries ordered by priority (most urgent first), then by age
    fn pending(&self) -> Result<Vec<BufferedEntry>>;

    /// Persist a new attempt count for the entry with this message id
    fn record_attempt(&self, id: &str, attempt_count: u32) -> Result<()>;

    /// Remove the entry; `false` if it was not present
    fn remove(&self, id: &str) -> Result<bool>;

    /// Remove every entry with `expires_at < now_ms`, returning how many
    fn remove_expired(&self, now_ms: u64) -> Result<usize>;

    fn count(&self) -> Result<usize>;

    /// Backend name for health reports
    fn kind(&self) -> &'static str;
}

/// Volatile store for tests and deployments without a writable disk
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<BufferedEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferStore for MemoryStore {
    fn insert_bounded(&self, entry: &BufferedEntry, max_size: usize) -> Result<InsertOutcome> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|e| e.message.id == entry.message.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        if entries.len() >= max_size {
            return Ok(InsertOutcome::Full);
        }
        entries.push(entry.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn pending(&self) -> Result<Vec<BufferedEntry>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pending = entries.clone();
        // Stable sort keeps insertion order among equal keys
        pending.sort_by(|a, b| {
            b.message
                .priority
                .cmp(&a.message.priority)
                .then(a.buffered_at.cmp(&b.buffered_at))
        });
        Ok(pending)
    }

    fn record_attempt(&self, id: &str, attempt_count: u32) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.iter_mut().find(|e| e.message.id == id) {
            entry.attempt_count = attempt_count;
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.message.id != id);
        Ok(entries.len() != before)
    }

    fn remove_expired(&self, now_ms: u64) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| !e.is_expired(now_ms));
        Ok(before - entries.len())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.entries.lock().unwrap_or_else(PoisonError::into_inner).len())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_shared::{Payload, Priority};

    fn entry(id: &str, priority: Priority, at: u64) -> BufferedEntry {
        let msg = Message::new(Payload::new()).with_id(id).with_priority(priority);
        BufferedEntry::new(msg, at, 1_000)
    }

    #[test]
    fn test_expiry_boundary() {
        let e = entry("a", Priority::Low, 100);
        assert_eq!(e.expires_at, 1_100);
        assert!(!e.is_expired(1_100));
        assert!(e.is_expired(1_101));
    }

    #[test]
    fn test_memory_store_orders_by_priority_then_age() {
        let store = MemoryStore::new();
        store.insert_bounded(&entry("old-low", Priority::Low, 1), 10).unwrap();
        store.insert_bounded(&entry("new-high", Priority::High, 5), 10).unwrap();
        store.insert_bounded(&entry("old-high", Priority::High, 2), 10).unwrap();

        let ids: Vec<String> = store.pending().unwrap().into_iter().map(|e| e.message.id).collect();
        assert_eq!(ids, vec!["old-high", "new-high", "old-low"]);
    }

    #[test]
    fn test_memory_store_bounds_and_duplicates() {
        let store = MemoryStore::new();
        assert_eq!(
            store.insert_bounded(&entry("a", Priority::Low, 1), 1).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_bounded(&entry("a", Priority::Low, 1), 1).unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(
            store.insert_bounded(&entry("b", Priority::Low, 1), 1).unwrap(),
            InsertOutcome::Full
        );
    }
}
