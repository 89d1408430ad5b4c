//! Supervised OS processes

use super::service::Service;
use crate::config::duration_ms;
use crate::health::HealthReport;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// An external program run under the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    /// The process must survive this long for `start` to succeed
    #[serde(rename = "startup_grace_ms", with = "duration_ms")]
    pub startup_grace: Duration,
}

impl Default for ProcessSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            program: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            startup_grace: Duration::from_millis(500),
        }
    }
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Runs one child process; health is "still running"
pub struct ProcessService {
    spec: ProcessSpec,
    child: Mutex<Option<Child>>,
}

impl ProcessService {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            child: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl Service for ProcessService {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait()?.is_none() {
                return Ok(());
            }
        }

        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {}", self.spec.program))?;

        tokio::time::sleep(self.spec.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            bail!("{} exited during startup with {}", self.spec.program, status);
        }

        info!(
            "[COORD] Process {} running (pid {:?})",
            self.spec.name,
            child.id()
        );
        *guard = Some(child);
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        child.start_kill()?;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!("[COORD] Process {} stopped ({})", self.spec.name, status);
                Ok(())
            }
            Err(_) => {
                warn!("[COORD] Process {} did not exit within {:?}", self.spec.name, timeout);
                Err(anyhow!("{} did not exit within {:?}", self.spec.name, timeout))
            }
        }
    }

    async fn health_check(&self) -> Result<HealthReport> {
        let mut guard = self.child.lock().await;
        let report = match guard.as_mut() {
            None => HealthReport::unhealthy("not started"),
            Some(child) => match child.try_wait()? {
                None => HealthReport::healthy().with("pid", child.id()),
                Some(status) => HealthReport::unhealthy(format!("exited with {}", status)),
            },
        };
        Ok(report.with("program", self.spec.program.clone()))
    }

    async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper() -> ProcessService {
        ProcessService::new(ProcessSpec {
            startup_grace: Duration::from_millis(50),
            ..ProcessSpec::new("sleeper", "sleep").arg("30")
        })
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let service = sleeper();
        assert!(!service.is_running().await);
        assert!(!service.health_check().await.unwrap().is_healthy());

        service.start().await.unwrap();
        assert!(service.is_running().await);
        assert!(service.pid().await.is_some());
        assert!(service.health_check().await.unwrap().is_healthy());

        service.stop(Duration::from_secs(2)).await.unwrap();
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_process_exiting_during_grace_fails_start() {
        let service = ProcessService::new(ProcessSpec {
            startup_grace: Duration::from_millis(200),
            ..ProcessSpec::new("short", "true")
        });
        assert!(service.start().await.is_err());
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_missing_program_fails_start() {
        let service = ProcessService::new(ProcessSpec::new("ghost", "/nonexistent/edge-binary"));
        assert!(service.start().await.is_err());
    }
}
