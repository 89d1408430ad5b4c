//! Named registry of managed connections

use super::manager::ConnectionManager;
use crate::error::{Result, RuntimeError};
use crate::health::HealthReport;
use edge_shared::ConnectionStatus;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Aggregate connection counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub connecting: usize,
    pub reconnecting: usize,
    pub failed: usize,
}

/// Tracks several independent endpoints uniformly
#[derive(Default)]
pub struct ConnectionPool {
    connections: RwLock<BTreeMap<String, Arc<ConnectionManager>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager under its name
    pub async fn add(&self, manager: Arc<ConnectionManager>) -> Result<()> {
        let mut connections = self.connections.write().await;
        let name = manager.name().to_string();
        if connections.contains_key(&name) {
            return Err(RuntimeError::ConnectionExists(name));
        }
        info!("[CONN] Pool: added {}", name);
        connections.insert(name, manager);
        Ok(())
    }

    /// Remove and return a manager; the caller decides whether to stop it
    pub async fn remove(&self, name: &str) -> Option<Arc<ConnectionManager>> {
        self.connections.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ConnectionManager>> {
        self.connections.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    async fn snapshot(&self) -> Vec<Arc<ConnectionManager>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn start_all(&self) {
        for manager in self.snapshot().await {
            manager.start().await;
        }
    }

    /// Stop every manager concurrently; `false` if any did not stop cleanly
    pub async fn stop_all(&self, timeout: Duration) -> bool {
        let managers = self.snapshot().await;
        join_all(managers.iter().map(|m| m.stop(timeout)))
            .await
            .into_iter()
            .all(|clean| clean)
    }

    /// Connect every manager once, concurrently
    pub async fn connect_all(&self) -> BTreeMap<String, bool> {
        let managers = self.snapshot().await;
        let results = join_all(managers.iter().map(|m| m.connect())).await;
        managers
            .iter()
            .map(|m| m.name().to_string())
            .zip(results)
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for manager in self.snapshot().await {
            stats.total += 1;
            match manager.status().await {
                ConnectionStatus::Connected => stats.connected += 1,
                ConnectionStatus::Disconnected => stats.disconnected += 1,
                ConnectionStatus::Connecting => stats.connecting += 1,
                ConnectionStatus::Reconnecting => stats.reconnecting += 1,
                ConnectionStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub async fn health_check(&self) -> HealthReport {
        let stats = self.stats().await;
        let report = if stats.connected == stats.total {
            HealthReport::healthy()
        } else if stats.connected > 0 {
            HealthReport::degraded("some connections are down")
        } else {
            HealthReport::unhealthy("no connections are up")
        };
        report.with("statistics", serde_json::to_value(&stats).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, Connector};
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct StaticConnector {
        ok: bool,
    }

    #[async_trait]
    impl Connector for StaticConnector {
        async fn connect(&self) -> anyhow::Result<()> {
            if self.ok {
                Ok(())
            } else {
                Err(anyhow!("unreachable"))
            }
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn endpoint(&self) -> String {
            "static".into()
        }
    }

    fn manager(name: &str, ok: bool) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(
            name,
            ConnectionConfig::default(),
            Arc::new(StaticConnector { ok }),
        ))
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_names() {
        let pool = ConnectionPool::new();
        pool.add(manager("broker", true)).await.unwrap();
        assert!(matches!(
            pool.add(manager("broker", true)).await,
            Err(RuntimeError::ConnectionExists(_))
        ));
        assert!(pool.get("broker").await.is_some());
        assert!(pool.remove("broker").await.is_some());
        assert!(pool.get("broker").await.is_none());
    }

    #[tokio::test]
    async fn test_connect_all_reports_aggregate_counts() {
        let pool = ConnectionPool::new();
        pool.add(manager("broker", true)).await.unwrap();
        pool.add(manager("cloud", false)).await.unwrap();
        pool.add(manager("mqtt", true)).await.unwrap();

        let results = pool.connect_all().await;
        assert_eq!(results["broker"], true);
        assert_eq!(results["cloud"], false);

        let stats = pool.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.connected, 2);
        assert_eq!(stats.disconnected, 1);
        assert!(!pool.health_check().await.is_healthy());

        assert!(pool.stop_all(Duration::from_secs(1)).await);
        assert_eq!(pool.stats().await.disconnected, 3);
    }
}
