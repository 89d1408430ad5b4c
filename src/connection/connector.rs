//! Connector abstraction for managed endpoints

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Opens and closes one logical connection to an external service
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the connection
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down
    async fn disconnect(&self) -> Result<()>;

    /// Cheap liveness check of an established connection
    async fn is_alive(&self) -> bool {
        true
    }

    /// Human-readable endpoint
    fn endpoint(&self) -> String;
}

/// Plain TCP connection to `host:port`
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", self.address))??;
        stream.set_nodelay(true)?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        let guard = self.stream.lock().await;
        let Some(stream) = guard.as_ref() else {
            return false;
        };
        let mut buf = [0u8; 1];
        // Pending peek means the socket is open with nothing to read
        match stream.peek(&mut buf).now_or_never() {
            None => true,
            Some(Ok(0)) => false,
            Some(Ok(_)) => true,
            Some(Err(_)) => false,
        }
    }

    fn endpoint(&self) -> String {
        self.address.clone()
    }
}
