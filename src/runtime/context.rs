//! Runtime assembly

use super::service::OfflineQueueService;
use crate::buffer::OfflineBuffer;
use crate::config::RuntimeConfig;
use crate::connection::{ConnectionManager, ConnectionPool, Connector, TcpConnector};
use crate::coordinator::{ProcessService, Service, ServiceCoordinator};
use crate::error::Result;
use crate::health::HealthReport;
use crate::network::{NetworkMonitor, Probe, TcpProbe};
use crate::queue::PriorityQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Name of the queue backend connection in the pool
pub const BACKEND_CONNECTION: &str = "queue-backend";

/// Every long-lived component of one runtime instance
pub struct RuntimeContext {
    pub config: RuntimeConfig,
    pub queue: Arc<PriorityQueue>,
    pub buffer: Arc<OfflineBuffer>,
    pub network: Arc<NetworkMonitor>,
    pub connections: Arc<ConnectionPool>,
    pub backend: Arc<ConnectionManager>,
    pub service: Arc<OfflineQueueService>,
    pub coordinator: Arc<ServiceCoordinator>,
}

impl RuntimeContext {
    /// Build against the configured TCP endpoints
    pub async fn build(config: RuntimeConfig) -> Result<Self> {
        let probe = Arc::new(TcpProbe::new(
            config.network.host.clone(),
            config.network.port,
            config.network.probe_timeout,
        ));
        let connector = Arc::new(TcpConnector::new(
            config.connection.endpoint.clone(),
            config.connection.connect_timeout,
        ));
        Self::build_with(config, probe, connector).await
    }

    /// Build with caller-supplied reachability probe and backend connector
    pub async fn build_with(
        config: RuntimeConfig,
        probe: Arc<dyn Probe>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(PriorityQueue::new(config.queue.clone()));
        let buffer = Arc::new(OfflineBuffer::open(config.buffer.clone())?);
        let network = Arc::new(NetworkMonitor::with_probe(config.network.clone(), probe));
        let backend = Arc::new(ConnectionManager::new(
            BACKEND_CONNECTION,
            config.connection.clone(),
            connector,
        ));
        let connections = Arc::new(ConnectionPool::new());
        connections.add(backend.clone()).await?;

        let service = Arc::new(OfflineQueueService::new(
            config.runtime.clone(),
            queue.clone(),
            buffer.clone(),
            network.clone(),
            backend.clone(),
        ));

        let coordinator = Arc::new(ServiceCoordinator::new(config.coordinator.clone()));
        // Backend-hosting processes first so they are stopped last
        for spec in &config.processes {
            let process: Arc<dyn Service> = Arc::new(ProcessService::new(spec.clone()));
            coordinator
                .register_service(process, Some(config.service_config(&spec.name)))
                .await?;
        }
        let queue_service: Arc<dyn Service> = service.clone();
        coordinator
            .register_service(
                queue_service,
                Some(config.service_config(&config.runtime.service_name)),
            )
            .await?;

        info!(
            "[RUNTIME] Built runtime for {} (buffer: {}, {} supervised processes)",
            config.device_id,
            buffer.store_kind(),
            config.processes.len()
        );

        Ok(Self {
            config,
            queue,
            buffer,
            network,
            connections,
            backend,
            service,
            coordinator,
        })
    }

    /// Start every supervised service and the health loop
    pub async fn start(&self) -> bool {
        self.coordinator.start().await
    }

    /// Stop the coordinator and, through it, every service
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!("[RUNTIME] Shutting down {}", self.config.device_id);
        self.coordinator.stop(timeout).await
    }

    pub async fn health_check(&self) -> HealthReport {
        let coordinator = self.coordinator.health_check().await;
        let connections = self.connections.health_check().await;
        HealthReport::healthy()
            .with_status(coordinator.status)
            .with("device_id", self.config.device_id.clone())
            .with("coordinator", coordinator.to_json())
            .with("connections", connections.to_json())
            .with("runtime", self.service.runtime_health().await.to_json())
    }
}
