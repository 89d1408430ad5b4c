//! Reachability probes

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// One reachability check against a reference endpoint
#[async_trait]
pub trait Probe: Send + Sync {
    /// Succeed with the measured round-trip latency, or fail
    async fn probe(&self) -> Result<Duration>;

    /// Human-readable target, for logs and health reports
    fn target(&self) -> String;
}

/// Probe that opens (and immediately drops) a TCP connection
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            address: format!("{}:{}", host.into(), port),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self) -> Result<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(anyhow!("connect to {} failed: {}", self.address, e)),
            Err(_) => Err(anyhow!(
                "connect to {} timed out after {:?}",
                self.address,
                self.timeout
            )),
        }
    }

    fn target(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_sock, _)) = listener.accept().await {}
        });

        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(probe.probe().await.is_ok());
        assert_eq!(probe.target(), format!("127.0.0.1:{}", port));
    }

    #[tokio::test]
    async fn test_tcp_probe_fails_on_closed_port() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_millis(500));
        assert!(probe.probe().await.is_err());
    }
}
