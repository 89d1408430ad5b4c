//! Offline buffer
//!
//! Spools messages while the delivery path is down and replays them through
//! the installed send handler once the buffer is told it is online again.

use super::sqlite::SqliteStore;
use super::store::{BufferStore, BufferedEntry, InsertOutcome, MemoryStore};
use crate::config::duration_ms;
use crate::error::{Result, RuntimeError};
use crate::health::HealthReport;
use crate::sender::{send_guarded, MessageSender};
use edge_shared::{defaults, now_ms, Message};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Configuration for the offline buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// SQLite file backing the spool; `None` keeps entries in memory only
    pub path: Option<PathBuf>,
    pub max_size: usize,
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// Failed flush attempts before an entry is dropped
    pub max_attempts: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("data/offline_buffer.db")),
            max_size: defaults::BUFFER_MAX_SIZE,
            ttl: Duration::from_millis(defaults::BUFFER_TTL_MS),
            max_attempts: defaults::BUFFER_MAX_ATTEMPTS,
        }
    }
}

impl BufferConfig {
    /// Volatile buffer, mostly for tests
    pub fn in_memory() -> Self {
        Self {
            path: None,
            ..Default::default()
        }
    }
}

/// Outcome of one flush pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Entries delivered and removed
    pub sent: usize,
    /// Entries whose send failed (including the dropped ones)
    pub failed: usize,
    /// Entries removed after reaching `max_attempts`
    pub dropped: usize,
    /// The buffer was offline and nothing was attempted
    pub skipped: bool,
    /// The send handler reported backpressure; the rest waits for a later pass
    pub deferred: bool,
}

impl FlushResult {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferStatistics {
    pub pending: usize,
    pub total_buffered: u64,
    pub is_online: bool,
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_dropped: u64,
    pub total_expired: u64,
    pub rejected_full: u64,
    pub flush_in_progress: bool,
    pub max_size: usize,
}

#[derive(Default)]
struct Counters {
    buffered: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    expired: AtomicU64,
    rejected_full: AtomicU64,
}

/// Durable spool for messages that could not be delivered
pub struct OfflineBuffer {
    config: BufferConfig,
    store: Arc<dyn BufferStore>,
    sender: RwLock<Option<Arc<dyn MessageSender>>>,
    online: AtomicBool,
    /// Serializes flush passes so no entry is sent twice
    flush_lock: Mutex<()>,
    flushing: AtomicBool,
    counters: Counters,
}

impl OfflineBuffer {
    /// Open the store named by `config.path`, or an in-memory one
    pub fn open(config: BufferConfig) -> Result<Self> {
        let store: Arc<dyn BufferStore> = match &config.path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => {
                warn!("[BUFFER] No spool path configured; buffered messages will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: BufferConfig, store: Arc<dyn BufferStore>) -> Self {
        Self {
            config,
            store,
            sender: RwLock::new(None),
            online: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            flushing: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Backing store name, `sqlite` or `memory`
    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    /// Run a store call on the blocking pool
    async fn with_store_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn BufferStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref())).await?
    }

    /// Spool a message; `false` when the buffer is full or the store failed
    pub async fn buffer(&self, message: Message) -> bool {
        let id = message.id.clone();
        let entry = BufferedEntry::new(message, now_ms(), self.config.ttl.as_millis() as u64);
        let max_size = self.config.max_size;

        match self
            .with_store_blocking(move |store| store.insert_bounded(&entry, max_size))
            .await
        {
            Ok(InsertOutcome::Inserted) => {
                self.counters.buffered.fetch_add(1, Ordering::Relaxed);
                debug!("[BUFFER] Buffered {}", id);
                true
            }
            Ok(InsertOutcome::Duplicate) => {
                debug!("[BUFFER] {} is already buffered", id);
                true
            }
            Ok(InsertOutcome::Full) => {
                self.counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                warn!("[BUFFER] Buffer full ({}), rejecting {}", max_size, id);
                false
            }
            Err(e) => {
                error!("[BUFFER] Failed to buffer {}: {}", id, e);
                false
            }
        }
    }

    /// Install the handler used by `flush`
    pub async fn set_send_handler(&self, sender: Arc<dyn MessageSender>) {
        *self.sender.write().await = Some(sender);
    }

    /// The single switch that allows or forbids flushing
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(
                "[BUFFER] Marked {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Replay pending entries, most urgent and oldest first
    ///
    /// Returns immediately with `skipped` while offline. Going offline in the
    /// middle of a pass stops it before the next entry.
    pub async fn flush(&self) -> Result<FlushResult> {
        if !self.is_online() {
            return Ok(FlushResult::skipped());
        }
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or(RuntimeError::NotInitialized("offline buffer send handler"))?;

        let _guard = self.flush_lock.lock().await;
        self.flushing.store(true, Ordering::SeqCst);
        let result = self.flush_entries(sender.as_ref()).await;
        self.flushing.store(false, Ordering::SeqCst);

        if let Ok(result) = &result {
            if result.sent > 0 || result.failed > 0 || result.deferred {
                info!(
                    "[BUFFER] Flush: sent={} failed={} dropped={} deferred={}",
                    result.sent, result.failed, result.dropped, result.deferred
                );
            }
        }
        result
    }

    async fn flush_entries(&self, sender: &dyn MessageSender) -> Result<FlushResult> {
        let pending = self.with_store_blocking(|store| store.pending()).await?;
        let mut result = FlushResult::default();

        for entry in pending {
            if !self.is_online() {
                debug!("[BUFFER] Went offline mid-flush, stopping");
                break;
            }

            if !sender.ready().await {
                debug!("[BUFFER] Send handler has no capacity, deferring the rest");
                result.deferred = true;
                break;
            }

            let id = entry.message.id.clone();
            if send_guarded(sender, &entry.message).await {
                self.with_store_blocking(move |store| store.remove(&id)).await?;
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                result.sent += 1;
                continue;
            }

            // Refused because it filled up since the readiness check
            if !sender.ready().await {
                debug!("[BUFFER] {} refused under backpressure, deferring", id);
                result.deferred = true;
                break;
            }

            result.failed += 1;
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let attempts = entry.attempt_count + 1;

            if attempts >= self.config.max_attempts {
                warn!(
                    "[BUFFER] Dropping {} after {} failed attempts",
                    entry.message.id, attempts
                );
                self.with_store_blocking(move |store| store.remove(&id)).await?;
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                result.dropped += 1;
            } else {
                debug!(
                    "[BUFFER] Send failed for {} (attempt {}/{})",
                    id, attempts, self.config.max_attempts
                );
                self.with_store_blocking(move |store| store.record_attempt(&id, attempts))
                    .await?;
            }
        }

        Ok(result)
    }

    /// Purge every entry past its `expires_at`
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = now_ms();
        let removed = self
            .with_store_blocking(move |store| store.remove_expired(now))
            .await?;
        if removed > 0 {
            self.counters.expired.fetch_add(removed as u64, Ordering::Relaxed);
            info!("[BUFFER] Purged {} expired entries", removed);
        }
        Ok(removed)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.with_store_blocking(|store| store.count()).await
    }

    pub async fn get_statistics(&self) -> Result<BufferStatistics> {
        Ok(BufferStatistics {
            pending: self.pending_count().await?,
            total_buffered: self.counters.buffered.load(Ordering::Relaxed),
            is_online: self.is_online(),
            total_sent: self.counters.sent.load(Ordering::Relaxed),
            total_failed: self.counters.failed.load(Ordering::Relaxed),
            total_dropped: self.counters.dropped.load(Ordering::Relaxed),
            total_expired: self.counters.expired.load(Ordering::Relaxed),
            rejected_full: self.counters.rejected_full.load(Ordering::Relaxed),
            flush_in_progress: self.flushing.load(Ordering::SeqCst),
            max_size: self.config.max_size,
        })
    }

    pub async fn health_check(&self) -> HealthReport {
        let stats = match self.get_statistics().await {
            Ok(stats) => stats,
            Err(e) => {
                return HealthReport::unhealthy(format!("store unavailable: {}", e))
                    .with("type", self.store.kind());
            }
        };

        // Rejecting new entries is backpressure, not a fault
        HealthReport::healthy()
            .with("type", self.store.kind())
            .with("at_capacity", stats.pending >= stats.max_size)
            .with("pending", stats.pending)
            .with("max_size", stats.max_size)
            .with("is_online", stats.is_online)
            .with("statistics", serde_json::to_value(&stats).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::sender_fn;
    use async_trait::async_trait;
    use edge_shared::{Payload, Priority};
    use std::sync::atomic::AtomicUsize;

    fn msg(id: &str, priority: Priority) -> Message {
        Message::new(Payload::new()).with_id(id).with_priority(priority)
    }

    fn memory_buffer(max_size: usize) -> OfflineBuffer {
        OfflineBuffer::open(BufferConfig {
            max_size,
            max_attempts: 3,
            ..BufferConfig::in_memory()
        })
        .unwrap()
    }

    fn recording_sender(succeed: bool) -> (Arc<dyn MessageSender>, Arc<std::sync::Mutex<Vec<String>>>) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        let sender = sender_fn(move |m: Message| {
            log.lock().unwrap().push(m.id.clone());
            async move { succeed }
        });
        (sender, seen)
    }

    #[tokio::test]
    async fn test_offline_flush_is_skipped_without_sends() {
        let buffer = memory_buffer(10);
        let (sender, seen) = recording_sender(true);
        buffer.set_send_handler(sender).await;
        buffer.buffer(msg("a", Priority::High)).await;

        let result = buffer.flush().await.unwrap();
        assert!(result.skipped);
        assert_eq!(result.sent, 0);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(buffer.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_online_flush_empties_in_priority_order() {
        let buffer = memory_buffer(10);
        let (sender, seen) = recording_sender(true);
        buffer.set_send_handler(sender).await;
        buffer.buffer(msg("low", Priority::Low)).await;
        buffer.buffer(msg("urgent", Priority::Urgent)).await;
        buffer.buffer(msg("normal", Priority::Normal)).await;

        buffer.set_online(true);
        let result = buffer.flush().await.unwrap();
        assert_eq!(result.sent, 3);
        assert!(!result.skipped);
        assert_eq!(*seen.lock().unwrap(), vec!["urgent", "normal", "low"]);
        assert_eq!(buffer.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_sends_are_retried_then_dropped() {
        let buffer = memory_buffer(10);
        let (sender, _) = recording_sender(false);
        buffer.set_send_handler(sender).await;
        buffer.buffer(msg("a", Priority::Normal)).await;
        buffer.set_online(true);

        for _ in 0..2 {
            let result = buffer.flush().await.unwrap();
            assert_eq!(result.failed, 1);
            assert_eq!(result.dropped, 0);
            assert_eq!(buffer.pending_count().await.unwrap(), 1);
        }

        let result = buffer.flush().await.unwrap();
        assert_eq!(result.dropped, 1);
        assert_eq!(buffer.pending_count().await.unwrap(), 0);
        assert_eq!(buffer.get_statistics().await.unwrap().total_dropped, 1);
    }

    struct GatedSender {
        open: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageSender for GatedSender {
        async fn send(&self, _message: &Message) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Takes one message, then fills up
            self.open.swap(false, Ordering::SeqCst)
        }

        async fn ready(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_backpressure_defers_without_charging_attempts() {
        let buffer = memory_buffer(10);
        let gate = Arc::new(GatedSender {
            open: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        buffer.set_send_handler(gate.clone()).await;
        for id in ["a", "b", "c"] {
            buffer.buffer(msg(id, Priority::Normal)).await;
        }
        buffer.set_online(true);

        // More passes than max_attempts while the receiver is full
        for _ in 0..5 {
            let result = buffer.flush().await.unwrap();
            assert!(result.deferred);
            assert_eq!((result.sent, result.failed, result.dropped), (0, 0, 0));
        }
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);

        gate.open.store(true, Ordering::SeqCst);
        let result = buffer.flush().await.unwrap();
        assert_eq!(result.sent, 1);
        assert!(result.deferred);
        assert_eq!(buffer.pending_count().await.unwrap(), 2);

        let stats = buffer.get_statistics().await.unwrap();
        assert_eq!(stats.total_failed, 0);
        assert_eq!(stats.total_dropped, 0);
    }

    #[tokio::test]
    async fn test_full_buffer_is_still_healthy() {
        let buffer = memory_buffer(1);
        buffer.buffer(msg("a", Priority::Low)).await;
        let report = buffer.health_check().await;
        assert!(report.is_healthy());
        assert_eq!(report.details["at_capacity"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_capacity_is_separate_and_bounded() {
        let buffer = memory_buffer(2);
        assert!(buffer.buffer(msg("a", Priority::Low)).await);
        assert!(buffer.buffer(msg("b", Priority::Low)).await);
        assert!(!buffer.buffer(msg("c", Priority::Urgent)).await);

        let stats = buffer.get_statistics().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.total_buffered, 2);
        assert_eq!(stats.rejected_full, 1);
        assert!(!stats.is_online);
    }

    #[tokio::test]
    async fn test_flush_without_handler_is_not_initialized() {
        let buffer = memory_buffer(10);
        buffer.set_online(true);
        assert!(matches!(
            buffer.flush().await,
            Err(RuntimeError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_entries() {
        let store = Arc::new(MemoryStore::new());
        let buffer = OfflineBuffer::with_store(BufferConfig::in_memory(), store.clone());

        let stale = BufferedEntry {
            attempt_count: 0,
            ..BufferedEntry::new(msg("stale", Priority::Urgent), 0, 10)
        };
        let stale_retried = BufferedEntry {
            attempt_count: 2,
            ..BufferedEntry::new(msg("stale-retried", Priority::Low), 0, 10)
        };
        store.insert_bounded(&stale, 10).unwrap();
        store.insert_bounded(&stale_retried, 10).unwrap();
        buffer.buffer(msg("fresh", Priority::Low)).await;

        assert_eq!(buffer.cleanup_expired().await.unwrap(), 2);
        let left: Vec<String> = store.pending().unwrap().into_iter().map(|e| e.message.id).collect();
        assert_eq!(left, vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_flush_sends_expired_entries_too() {
        let store = Arc::new(MemoryStore::new());
        let buffer = OfflineBuffer::with_store(BufferConfig::in_memory(), store.clone());
        store
            .insert_bounded(&BufferedEntry::new(msg("stale", Priority::Low), 0, 10), 10)
            .unwrap();

        let (sender, seen) = recording_sender(true);
        buffer.set_send_handler(sender).await;
        buffer.set_online(true);
        assert_eq!(buffer.flush().await.unwrap().sent, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["stale"]);
    }

    #[tokio::test]
    async fn test_going_offline_mid_flush_stops_the_pass() {
        let buffer = Arc::new(memory_buffer(10));
        for id in ["a", "b", "c"] {
            buffer.buffer(msg(id, Priority::Normal)).await;
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = buffer.clone();
        buffer
            .set_send_handler(sender_fn(move |_m: Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                handle.set_online(false);
                async { true }
            }))
            .await;

        buffer.set_online(true);
        let result = buffer.flush().await.unwrap();
        assert_eq!(result.sent, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_flushes_send_each_entry_once() {
        let buffer = Arc::new(memory_buffer(100));
        for i in 0..20 {
            buffer.buffer(msg(&format!("m{}", i), Priority::Normal)).await;
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        buffer
            .set_send_handler(sender_fn(move |_m: Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::task::yield_now().await;
                    true
                }
            }))
            .await;
        buffer.set_online(true);

        let (a, b) = tokio::join!(buffer.flush(), buffer.flush());
        assert_eq!(a.unwrap().sent + b.unwrap().sent, 20);
        assert_eq!(calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_sqlite_spool_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = BufferConfig {
            path: Some(dir.path().join("buffer.db")),
            ..Default::default()
        };

        {
            let buffer = OfflineBuffer::open(config.clone()).unwrap();
            assert!(buffer.buffer(msg("persisted", Priority::High)).await);
        }

        let reopened = OfflineBuffer::open(config).unwrap();
        assert_eq!(reopened.pending_count().await.unwrap(), 1);
        let report = reopened.health_check().await;
        assert!(report.is_healthy());
        assert_eq!(report.details["type"], "sqlite");
    }
}
