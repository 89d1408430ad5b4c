//! Offline-aware queue service
//!
//! The composition root of the data path: submissions go straight into the
//! live queue while the backend is reachable and into the offline buffer
//! otherwise. Network and connection transitions flip the buffer online and
//! wake the maintenance task, which flushes the buffer back into the queue;
//! dispatch workers drain the queue into the downstream dispatcher with
//! ack/nack.

use crate::buffer::{BufferStatistics, OfflineBuffer};
use crate::config::duration_ms;
use crate::connection::ConnectionManager;
use crate::coordinator::Service;
use crate::error::{Result, RuntimeError};
use crate::health::{HealthReport, HealthStatus};
use crate::network::NetworkMonitor;
use crate::queue::{MessageQueue, PriorityQueue, QueueStatistics};
use crate::sender::{send_guarded, MessageSender};
use crate::task::{sleep_or_shutdown, BackgroundTask, Shutdown};
use async_trait::async_trait;
use edge_shared::{CommandPayload, ConnectionStatus, Message, NetworkStatus, Priority};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineQueueConfig {
    /// Name under which the coordinator supervises this service
    pub service_name: String,
    /// Concurrent dispatch workers draining the live queue
    pub worker_count: usize,
    #[serde(rename = "poll_timeout_ms", with = "duration_ms")]
    pub poll_timeout: Duration,
    /// Period of the cleanup-and-flush maintenance pass
    #[serde(rename = "flush_interval_ms", with = "duration_ms")]
    pub flush_interval: Duration,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            service_name: "offline-queue".into(),
            worker_count: 2,
            poll_timeout: Duration::from_secs(1),
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// Where a submitted message ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Accepted by the live queue
    Queued,
    /// Spooled in the offline buffer
    Buffered,
    /// Both the queue and the buffer refused it
    Rejected,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    queued: AtomicU64,
    buffered: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatistics {
    pub submitted: u64,
    pub queued: u64,
    pub buffered: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub dispatch_failed: u64,
    pub backend_available: bool,
    pub network_status: NetworkStatus,
    pub connection_status: ConnectionStatus,
    pub queue_size: usize,
    pub queue: QueueStatistics,
    /// Absent when the buffer store could not be read
    pub buffer: Option<BufferStatistics>,
}

/// Send handler used by buffer flushes: hands entries back to the live queue
pub struct QueueForwarder {
    queue: Arc<PriorityQueue>,
}

impl QueueForwarder {
    pub fn new(queue: Arc<PriorityQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl MessageSender for QueueForwarder {
    async fn send(&self, message: &Message) -> bool {
        self.queue.enqueue(message.clone()).await
    }

    async fn ready(&self) -> bool {
        self.queue.size().await < self.queue.max_size()
    }
}

/// Wakes the maintenance task for a flush outside its regular interval
#[derive(Default)]
struct FlushSignal {
    requested: Notify,
    /// The last flush stopped on a full queue
    deferred: AtomicBool,
}

impl FlushSignal {
    fn request(&self) {
        self.requested.notify_one();
    }

    /// Called as the queue drains; resumes a flush that stopped on backpressure
    fn resume_if_deferred(&self) {
        if self.deferred.swap(false, Ordering::AcqRel) {
            self.request();
        }
    }
}

/// Backend is usable when connected and the network is not known to be down
async fn backend_available(network: &NetworkMonitor, connection: &ConnectionManager) -> bool {
    connection.is_connected().await && network.status().await != NetworkStatus::Offline
}

/// Push the current availability into the buffer and return it
async fn refresh_backend_state(
    network: &NetworkMonitor,
    connection: &ConnectionManager,
    buffer: &OfflineBuffer,
) -> bool {
    let available = backend_available(network, connection).await;
    buffer.set_online(available);
    available
}

async fn flush_buffer(buffer: &OfflineBuffer, signal: &FlushSignal) {
    match buffer.flush().await {
        Ok(result) => {
            if result.sent > 0 {
                info!("[RUNTIME] Flushed {} buffered messages", result.sent);
            }
            signal.deferred.store(result.deferred, Ordering::Release);
        }
        Err(e) => error!("[RUNTIME] Buffer flush failed: {}", e),
    }
}

/// Composition root wiring monitor, connection, queue and buffer together
pub struct OfflineQueueService {
    config: OfflineQueueConfig,
    queue: Arc<PriorityQueue>,
    buffer: Arc<OfflineBuffer>,
    network: Arc<NetworkMonitor>,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<RwLock<Option<Arc<dyn MessageSender>>>>,
    counters: Arc<Counters>,
    flush: Arc<FlushSignal>,
    wired: AtomicBool,
    tasks: Mutex<Vec<BackgroundTask>>,
}

impl OfflineQueueService {
    pub fn new(
        config: OfflineQueueConfig,
        queue: Arc<PriorityQueue>,
        buffer: Arc<OfflineBuffer>,
        network: Arc<NetworkMonitor>,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            config,
            queue,
            buffer,
            network,
            connection,
            dispatcher: Arc::new(RwLock::new(None)),
            counters: Arc::new(Counters::default()),
            flush: Arc::new(FlushSignal::default()),
            wired: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn buffer(&self) -> &Arc<OfflineBuffer> {
        &self.buffer
    }

    /// Install the downstream dispatcher the workers deliver to
    pub async fn set_dispatcher(&self, dispatcher: Arc<dyn MessageSender>) {
        *self.dispatcher.write().await = Some(dispatcher);
    }

    pub async fn is_backend_available(&self) -> bool {
        backend_available(&self.network, &self.connection).await
    }

    /// Route a message to the live queue or, failing that, the buffer
    pub async fn submit(&self, message: Message) -> SubmitOutcome {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let id = message.id.clone();

        if self.is_backend_available().await {
            if self.queue.enqueue(message.clone()).await {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                return SubmitOutcome::Queued;
            }
            warn!("[RUNTIME] Live queue refused {}, buffering", id);
        }

        if self.buffer.buffer(message).await {
            self.counters.buffered.fetch_add(1, Ordering::Relaxed);
            debug!("[RUNTIME] Buffered {}", id);
            SubmitOutcome::Buffered
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            error!("[RUNTIME] Rejected {}: queue and buffer both refused it", id);
            SubmitOutcome::Rejected
        }
    }

    /// Like `submit`, but a message neither the queue nor the buffer would
    /// take is an error
    pub async fn try_submit(&self, message: Message) -> Result<SubmitOutcome> {
        match self.submit(message).await {
            SubmitOutcome::Rejected => Err(RuntimeError::CapacityExceeded {
                what: "offline buffer",
                capacity: self.buffer.config().max_size,
            }),
            outcome => Ok(outcome),
        }
    }

    /// Normalize a raw command document and submit it
    pub async fn submit_command(&self, raw: Value, priority: Priority) -> Result<SubmitOutcome> {
        let command = CommandPayload::normalize(raw)?;
        debug!("[RUNTIME] Normalized {} command", command.kind());
        let message = Message::new(command.into_payload()).with_priority(priority);
        Ok(self.submit(message).await)
    }

    /// Register the status callbacks that keep the buffer's online flag in sync
    ///
    /// The callbacks only flip the flag and wake the maintenance task; the
    /// flush itself never runs inside a monitor or connection callback.
    async fn wire(&self) {
        if self.wired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.buffer
            .set_send_handler(Arc::new(QueueForwarder::new(self.queue.clone())))
            .await;

        let network: Weak<NetworkMonitor> = Arc::downgrade(&self.network);
        let connection: Weak<ConnectionManager> = Arc::downgrade(&self.connection);

        let (net, conn) = (network.clone(), connection.clone());
        let (buffer, flush) = (self.buffer.clone(), self.flush.clone());
        self.network
            .add_async_callback(move |old, new, _state| {
                let (net, conn) = (net.clone(), conn.clone());
                let (buffer, flush) = (buffer.clone(), flush.clone());
                async move {
                    debug!("[RUNTIME] Network {} -> {}", old, new);
                    if let (Some(net), Some(conn)) = (net.upgrade(), conn.upgrade()) {
                        if refresh_backend_state(&net, &conn, &buffer).await {
                            flush.request();
                        }
                    }
                    Ok(())
                }
            })
            .await;

        let (buffer, flush) = (self.buffer.clone(), self.flush.clone());
        self.connection
            .add_async_callback(move |old, new, _state| {
                let (net, conn) = (network.clone(), connection.clone());
                let (buffer, flush) = (buffer.clone(), flush.clone());
                async move {
                    debug!("[RUNTIME] Connection {} -> {}", old, new);
                    if let (Some(net), Some(conn)) = (net.upgrade(), conn.upgrade()) {
                        if refresh_backend_state(&net, &conn, &buffer).await {
                            flush.request();
                        }
                    }
                    Ok(())
                }
            })
            .await;
    }

    fn spawn_workers(&self) -> BackgroundTask {
        let poll = self.config.poll_timeout;
        BackgroundTask::spawn_many("dispatch-workers", self.config.worker_count, |index, shutdown| {
            dispatch_loop(
                index,
                self.queue.clone(),
                self.dispatcher.clone(),
                self.counters.clone(),
                self.flush.clone(),
                poll,
                shutdown,
            )
        })
    }

    fn spawn_maintenance(&self) -> BackgroundTask {
        let interval = self.config.flush_interval;
        let (network, connection, buffer, flush) = (
            self.network.clone(),
            self.connection.clone(),
            self.buffer.clone(),
            self.flush.clone(),
        );
        BackgroundTask::spawn("buffer-maintenance", move |mut shutdown| async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let periodic = tokio::select! {
                    _ = tokio::time::sleep(interval) => true,
                    _ = flush.requested.notified() => false,
                    _ = shutdown.changed() => break,
                };
                if periodic {
                    if let Err(e) = buffer.cleanup_expired().await {
                        error!("[RUNTIME] Buffer cleanup failed: {}", e);
                    }
                }
                if refresh_backend_state(&network, &connection, &buffer).await {
                    flush_buffer(&buffer, &flush).await;
                }
            }
        })
    }

    /// Move everything still in the live queue into the durable buffer
    async fn spill_to_buffer(&self) -> usize {
        self.queue.requeue_in_flight().await;
        let mut spilled = 0;
        while let Some(message) = self.queue.dequeue(Duration::ZERO).await {
            let id = message.id.clone();
            if self.buffer.buffer(message).await {
                self.queue.ack(&id).await;
                spilled += 1;
            } else {
                // Leave it in memory, retry count untouched; the buffer is full
                self.queue.release(&id).await;
                warn!("[RUNTIME] Could not spill {} to the buffer", id);
                break;
            }
        }
        if spilled > 0 {
            info!("[RUNTIME] Spilled {} queued messages to the buffer", spilled);
        }
        spilled
    }

    pub async fn get_statistics(&self) -> RuntimeStatistics {
        let buffer = match self.buffer.get_statistics().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("[RUNTIME] Buffer statistics unavailable: {}", e);
                None
            }
        };
        RuntimeStatistics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            buffered: self.counters.buffered.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            dispatch_failed: self.counters.dispatch_failed.load(Ordering::Relaxed),
            backend_available: self.is_backend_available().await,
            network_status: self.network.status().await,
            connection_status: self.connection.status().await,
            queue_size: self.queue.size().await,
            queue: self.queue.statistics().await,
            buffer,
        }
    }

    /// Aggregate report
    ///
    /// Being offline is not a fault: messages are buffered. A full queue or
    /// buffer is not one either; it shows up as `queue_at_capacity` and
    /// `buffer_at_capacity`. A FAILED connection or an unreadable buffer is,
    /// and makes the report unhealthy.
    pub async fn runtime_health(&self) -> HealthReport {
        let running = !self.tasks.lock().await.is_empty();
        let queue = self.queue.health_check().await;
        let buffer = self.buffer.health_check().await;
        let network = self.network.health_check().await;
        let connection = self.connection.health_check().await;
        let connection_status = self.connection.status().await;

        let status = if !running
            || buffer.status == HealthStatus::Unhealthy
            || connection_status == ConnectionStatus::Failed
        {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        let at_capacity = |report: &HealthReport| {
            report.details.get("at_capacity").cloned().unwrap_or(Value::Bool(false))
        };

        HealthReport::healthy()
            .with_status(status)
            .with("running", running)
            .with("backend_available", self.is_backend_available().await)
            .with("queue_at_capacity", at_capacity(&queue))
            .with("buffer_at_capacity", at_capacity(&buffer))
            .with("queue", queue.to_json())
            .with("buffer", buffer.to_json())
            .with("network", network.to_json())
            .with("connection", connection.to_json())
    }
}

async fn dispatch_loop(
    index: usize,
    queue: Arc<PriorityQueue>,
    dispatcher: Arc<RwLock<Option<Arc<dyn MessageSender>>>>,
    counters: Arc<Counters>,
    flush: Arc<FlushSignal>,
    poll: Duration,
    mut shutdown: Shutdown,
) {
    debug!("[RUNTIME] Dispatch worker {} started", index);
    loop {
        let sender = dispatcher.read().await.clone();
        let Some(sender) = sender else {
            if sleep_or_shutdown(poll, &mut shutdown).await {
                break;
            }
            continue;
        };

        let message = tokio::select! {
            message = queue.dequeue(poll) => message,
            _ = shutdown.changed() => break,
        };
        if *shutdown.borrow() {
            if let Some(message) = message {
                queue.release(&message.id).await;
            }
            break;
        }
        let Some(message) = message else {
            continue;
        };

        if send_guarded(sender.as_ref(), &message).await {
            queue.ack(&message.id).await;
            counters.dispatched.fetch_add(1, Ordering::Relaxed);
            flush.resume_if_deferred();
        } else {
            counters.dispatch_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[RUNTIME] Dispatch of {} failed (retry {}/{})",
                message.id, message.retry_count, message.max_retries
            );
            queue.nack(&message.id, true).await;
        }
    }
    debug!("[RUNTIME] Dispatch worker {} stopped", index);
}

#[async_trait]
impl Service for OfflineQueueService {
    fn name(&self) -> &str {
        &self.config.service_name
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }
        self.wire().await;

        if self.connection.status().await == ConnectionStatus::Failed {
            self.connection.reset().await;
        }
        self.network.start().await;
        self.connection.start().await;
        if refresh_backend_state(&self.network, &self.connection, &self.buffer).await {
            self.flush.request();
        }

        tasks.push(self.spawn_workers());
        tasks.push(self.spawn_maintenance());
        info!(
            "[RUNTIME] {} started with {} workers",
            self.config.service_name, self.config.worker_count
        );
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> anyhow::Result<()> {
        let tasks: Vec<BackgroundTask> = self.tasks.lock().await.drain(..).collect();
        let mut clean = true;
        for task in tasks {
            clean &= task.stop(timeout).await;
        }
        clean &= self.connection.stop(timeout).await;
        clean &= self.network.stop(timeout).await;
        self.buffer.set_online(false);
        self.spill_to_buffer().await;

        info!("[RUNTIME] {} stopped", self.config.service_name);
        if clean {
            Ok(())
        } else {
            Err(anyhow::anyhow!("some background loops had to be aborted"))
        }
    }

    async fn health_check(&self) -> anyhow::Result<HealthReport> {
        Ok(self.runtime_health().await)
    }

    async fn is_running(&self) -> bool {
        !self.tasks.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use crate::connection::{ConnectionConfig, Connector};
    use crate::network::{NetworkConfig, Probe};
    use crate::sender::sender_fn;
    use anyhow::anyhow;
    use serde_json::json;

    struct SwitchProbe(Arc<AtomicBool>);

    #[async_trait]
    impl Probe for SwitchProbe {
        async fn probe(&self) -> anyhow::Result<Duration> {
            if self.0.load(Ordering::SeqCst) {
                Ok(Duration::from_millis(1))
            } else {
                Err(anyhow!("unreachable"))
            }
        }

        fn target(&self) -> String {
            "switch".into()
        }
    }

    struct SwitchConnector(Arc<AtomicBool>);

    #[async_trait]
    impl Connector for SwitchConnector {
        async fn connect(&self) -> anyhow::Result<()> {
            if self.0.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(anyhow!("refused"))
            }
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn endpoint(&self) -> String {
            "switch:1".into()
        }
    }

    fn service(queue_size: usize, buffer_size: usize) -> (OfflineQueueService, Arc<AtomicBool>) {
        let link = Arc::new(AtomicBool::new(false));
        let network = Arc::new(NetworkMonitor::with_probe(
            NetworkConfig {
                check_interval: Duration::from_millis(5),
                failure_threshold: 1,
                recovery_threshold: 1,
                ..Default::default()
            },
            Arc::new(SwitchProbe(link.clone())),
        ));
        let connection = Arc::new(ConnectionManager::new(
            "backend",
            ConnectionConfig {
                initial_reconnect_delay: Duration::from_millis(5),
                max_reconnect_delay: Duration::from_millis(20),
                max_reconnect_attempts: 1_000,
                check_interval: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(SwitchConnector(link.clone())),
        ));
        let buffer = Arc::new(
            OfflineBuffer::open(BufferConfig {
                max_size: buffer_size,
                ..BufferConfig::in_memory()
            })
            .unwrap(),
        );
        let service = OfflineQueueService::new(
            OfflineQueueConfig {
                worker_count: 1,
                poll_timeout: Duration::from_millis(10),
                flush_interval: Duration::from_millis(20),
                ..Default::default()
            },
            Arc::new(PriorityQueue::with_capacity(queue_size)),
            buffer,
            network,
            connection,
        );
        (service, link)
    }

    #[tokio::test]
    async fn test_submit_buffers_while_backend_down() {
        let (service, _link) = service(10, 10);
        let outcome = service
            .submit(Message::new(Default::default()).with_id("a"))
            .await;
        assert_eq!(outcome, SubmitOutcome::Buffered);
        assert_eq!(service.buffer().pending_count().await.unwrap(), 1);
        assert_eq!(service.queue().size().await, 0);
    }

    #[tokio::test]
    async fn test_submit_queues_when_connected() {
        let (service, link) = service(10, 10);
        link.store(true, Ordering::SeqCst);
        assert!(service.connection.connect().await);

        let outcome = service
            .submit_command(json!({"toolName": "move", "arguments": {"x": 1}}), Priority::High)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Queued);

        let queued = service.queue().dequeue(Duration::ZERO).await.unwrap();
        assert_eq!(queued.priority, Priority::High);
        assert_eq!(queued.payload["kind"], "tool");
    }

    #[tokio::test]
    async fn test_full_queue_fails_closed_into_buffer_then_rejects() {
        let (service, link) = service(1, 1);
        link.store(true, Ordering::SeqCst);
        service.connection.connect().await;

        let mut outcomes = Vec::new();
        for id in ["a", "b", "c"] {
            outcomes.push(service.submit(Message::new(Default::default()).with_id(id)).await);
        }
        assert_eq!(
            outcomes,
            vec![
                SubmitOutcome::Queued,
                SubmitOutcome::Buffered,
                SubmitOutcome::Rejected
            ]
        );

        let stats = service.get_statistics().await;
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_invalid_command_is_an_error() {
        let (service, _link) = service(10, 10);
        assert!(service
            .submit_command(json!("not an object"), Priority::Normal)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_recovery_flushes_and_workers_dispatch() {
        let (service, link) = service(10, 10);
        let delivered = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = delivered.clone();
        service
            .set_dispatcher(sender_fn(move |m: Message| {
                sink.lock().unwrap().push(m.id.clone());
                async { true }
            }))
            .await;

        service.start().await.unwrap();
        for id in ["a", "b"] {
            assert_eq!(
                service.submit(Message::new(Default::default()).with_id(id)).await,
                SubmitOutcome::Buffered
            );
        }

        link.store(true, Ordering::SeqCst);
        for _ in 0..100 {
            if delivered.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut ids = delivered.lock().unwrap().clone();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(service.buffer().pending_count().await.unwrap(), 0);
        assert!(service.health_check().await.unwrap().is_healthy());

        service.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_spills_queue_into_buffer() {
        let (service, link) = service(10, 10);
        link.store(true, Ordering::SeqCst);
        service.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(service.is_backend_available().await);

        // No dispatcher: queued messages stay put until shutdown
        assert_eq!(
            service.submit(Message::new(Default::default()).with_id("late")).await,
            SubmitOutcome::Queued
        );
        service.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(service.queue().size().await, 0);
        assert_eq!(service.buffer().pending_count().await.unwrap(), 1);
    }

    async fn buffered(service: &OfflineQueueService, ids: &[&str]) {
        for id in ids {
            assert_eq!(
                service.submit(Message::new(Default::default()).with_id(*id)).await,
                SubmitOutcome::Buffered
            );
        }
    }

    #[tokio::test]
    async fn test_flush_into_full_queue_keeps_buffered_messages() {
        let (service, link) = service(1, 10);
        buffered(&service, &["a", "b", "c"]).await;
        service.wire().await;
        link.store(true, Ordering::SeqCst);
        assert!(service.connection.connect().await);
        assert!(service.buffer().is_online());

        // Well past max_attempts while the queue stays full
        let attempts = service.buffer().config().max_attempts as usize;
        for pass in 0..attempts + 2 {
            let result = service.buffer().flush().await.unwrap();
            assert!(result.deferred);
            assert_eq!(result.sent, usize::from(pass == 0));
            assert_eq!((result.failed, result.dropped), (0, 0));
        }

        assert_eq!(service.queue().size().await, 1);
        assert_eq!(service.buffer().pending_count().await.unwrap(), 2);
        let stats = service.buffer().get_statistics().await.unwrap();
        assert_eq!(stats.total_dropped, 0);
        assert_eq!(stats.total_failed, 0);
    }

    #[tokio::test]
    async fn test_small_queue_drains_large_buffer_without_drops() {
        let (service, link) = service(1, 10);
        let delivered = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = delivered.clone();
        service
            .set_dispatcher(sender_fn(move |m: Message| {
                sink.lock().unwrap().push(m.id.clone());
                async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    true
                }
            }))
            .await;

        service.start().await.unwrap();
        buffered(&service, &["a", "b", "c", "d", "e"]).await;
        link.store(true, Ordering::SeqCst);
        for _ in 0..200 {
            if delivered.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(delivered.lock().unwrap().len(), 5);
        let stats = service.buffer().get_statistics().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total_dropped, 0);
        service.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_callback_leaves_flush_to_maintenance() {
        let (service, link) = service(10, 10);
        buffered(&service, &["a"]).await;
        service.wire().await;

        link.store(true, Ordering::SeqCst);
        assert!(service.connection.connect().await);
        assert!(service.buffer().is_online());
        assert_eq!(service.buffer().pending_count().await.unwrap(), 1);

        tokio::time::timeout(Duration::from_secs(1), service.flush.requested.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_keeps_runtime_healthy() {
        let (service, link) = service(1, 10);
        link.store(true, Ordering::SeqCst);
        service.start().await.unwrap();
        for _ in 0..100 {
            if service.is_backend_available().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // No dispatcher: the queue stays full
        assert_eq!(
            service.submit(Message::new(Default::default()).with_id("a")).await,
            SubmitOutcome::Queued
        );
        let report = service.health_check().await.unwrap();
        assert!(report.is_healthy());
        assert_eq!(report.details["queue_at_capacity"], json!(true));
        assert_eq!(report.details["buffer_at_capacity"], json!(false));
        service.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_service_is_unhealthy() {
        let (service, _link) = service(10, 10);
        assert!(!service.health_check().await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_spill_keeps_retry_count() {
        let (service, link) = service(10, 1);
        link.store(true, Ordering::SeqCst);
        assert!(service.connection.connect().await);
        for id in ["a", "b"] {
            assert_eq!(
                service.submit(Message::new(Default::default()).with_id(id)).await,
                SubmitOutcome::Queued
            );
        }

        assert_eq!(service.spill_to_buffer().await, 1);
        assert_eq!(service.queue().size().await, 1);
        let left = service.queue().dequeue(Duration::ZERO).await.unwrap();
        assert_eq!(left.id, "b");
        assert_eq!(left.retry_count, 0);
        assert!(service.queue().dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_try_submit_reports_capacity() {
        let (service, _link) = service(10, 1);
        assert_eq!(
            service
                .try_submit(Message::new(Default::default()).with_id("a"))
                .await
                .unwrap(),
            SubmitOutcome::Buffered
        );
        let err = service
            .try_submit(Message::new(Default::default()).with_id("b"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::CapacityExceeded { what: "offline buffer", capacity: 1 }
        ));
        assert_eq!(service.get_statistics().await.rejected, 1);
    }
}
