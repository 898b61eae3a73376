//! Bridge status reporting.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::Result;
use crate::publisher::Publisher;

/// Bridge status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (e.g., "opcua").
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current status ("running", "offline", "error").
    pub status: String,
    /// Additional metadata (protocol-specific).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeStatus {
    fn with_state(bridge: impl Into<String>, version: impl Into<String>, status: &str) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status: status.to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a new status with "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, "running")
    }

    /// Create a status with "offline" state.
    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, "offline")
    }

    /// Create a status with "error" state.
    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_state(bridge, version, "error")
            .with_metadata(serde_json::json!({ "error": error.into() }))
    }

    /// Status to announce at startup: "error" if a failure was already
    /// reported, otherwise "running" with `metadata`.
    pub fn startup(
        bridge: &str,
        version: &str,
        failure: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        match (failure, metadata) {
            (Some(error), _) => Self::error(bridge, version, error),
            (None, Some(meta)) => Self::running(bridge, version).with_metadata(meta),
            (None, None) => Self::running(bridge, version),
        }
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Publish this status to `{key_prefix}/@/status`.
    pub async fn publish(&self, publisher: &Publisher) -> Result<()> {
        let key = publisher.keys().status_key();
        publisher.publish_json(&key, self).await
    }
}

/// Helper to publish bridge status on startup, failure and shutdown.
///
/// Once a failure is reported the bridge stays in "error": a later
/// "running" announcement repeats the error instead.
pub struct StatusPublisher {
    publisher: Publisher,
    bridge_name: String,
    version: String,
    failure: Mutex<Option<String>>,
}

impl StatusPublisher {
    /// Create a new status publisher.
    pub fn new(
        publisher: Publisher,
        bridge_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            bridge_name: bridge_name.into(),
            version: version.into(),
            failure: Mutex::new(None),
        }
    }

    /// Publish "running" status with optional metadata.
    pub async fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        let failure = self.failure.lock().await;
        BridgeStatus::startup(&self.bridge_name, &self.version, failure.as_deref(), metadata)
            .publish(&self.publisher)
            .await
    }

    /// Publish "offline" status.
    pub async fn publish_offline(&self) -> Result<()> {
        BridgeStatus::offline(&self.bridge_name, &self.version)
            .publish(&self.publisher)
            .await
    }

    /// Record a failure and publish "error" status.
    pub async fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        let mut failure = self.failure.lock().await;
        let status = BridgeStatus::error(&self.bridge_name, &self.version, error.as_str());
        *failure = Some(error);
        status.publish(&self.publisher).await
    }

    /// The failure reported so far, if any.
    pub async fn failure(&self) -> Option<String> {
        self.failure.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_running() {
        let status = BridgeStatus::running("opcua", "0.1.0");
        assert_eq!(status.bridge, "opcua");
        assert_eq!(status.status, "running");
    }

    #[test]
    fn test_status_error_carries_message() {
        let status = BridgeStatus::error("opcua", "0.1.0", "endpoint unreachable");
        assert_eq!(status.status, "error");
        assert_eq!(status.metadata["error"], "endpoint unreachable");
    }

    #[test]
    fn test_startup_status_keeps_reported_failure() {
        let meta = serde_json::json!({ "endpoint": "opc.tcp://localhost:4840/" });

        let running = BridgeStatus::startup("opcua", "0.1.0", None, Some(meta.clone()));
        assert_eq!(running.status, "running");
        assert_eq!(running.metadata["endpoint"], "opc.tcp://localhost:4840/");

        let failed = BridgeStatus::startup("opcua", "0.1.0", Some("commands: declare failed"), Some(meta));
        assert_eq!(failed.status, "error");
        assert_eq!(failed.metadata["error"], "commands: declare failed");
    }

    #[test]
    fn test_status_serialization_flattens_metadata() {
        let status = BridgeStatus::running("opcua", "1.0.0").with_metadata(serde_json::json!({
            "endpoint": "opc.tcp://localhost:4840/",
            "telemetry_interval_secs": 5
        }));

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"bridge\":\"opcua\""));
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"telemetry_interval_secs\":5"));
    }
}
