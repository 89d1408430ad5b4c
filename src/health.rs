//! Health reports returned by every component

use edge_shared::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A `status` plus free-form details, serialized as one flat mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(flatten)]
    pub details: Payload,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            details: Payload::new(),
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self::healthy()
            .with_status(HealthStatus::Degraded)
            .with("reason", reason.into())
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::healthy()
            .with_status(HealthStatus::Unhealthy)
            .with("reason", reason.into())
    }

    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach a detail field
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Only an exact `healthy` status passes a supervisor health check
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_serializes_flat() {
        let report = HealthReport::healthy().with("type", "priority_queue").with("total_size", 3);
        assert_eq!(
            report.to_json(),
            json!({"status": "healthy", "type": "priority_queue", "total_size": 3})
        );
    }

    #[test]
    fn test_only_healthy_passes() {
        assert!(HealthReport::healthy().is_healthy());
        assert!(!HealthReport::degraded("slow").is_healthy());
        assert!(!HealthReport::unhealthy("down").is_healthy());
    }
}
