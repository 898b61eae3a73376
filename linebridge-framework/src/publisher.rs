//! Outbound event publishing.

use std::sync::Arc;

use async_trait::async_trait;
use linebridge_common::{ErrorEvent, Format, KeyExprBuilder, TelemetryEvent, encode};
use zenoh::bytes::Encoding;

use crate::error::{BridgeError, Result};

/// Destination for the events a bridge produces.
///
/// Delivery is at-least-once from the caller's point of view: a failed
/// publish is reported and logged, never retried here.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Publish one telemetry snapshot.
    async fn publish_telemetry(&self, event: &TelemetryEvent) -> Result<()>;

    /// Publish one rising-edge error event.
    async fn publish_error(&self, event: &ErrorEvent) -> Result<()>;
}

/// Publisher for sending events to Zenoh.
///
/// Wraps a Zenoh session and builds per-device key expressions from the
/// configured prefix.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    keys: KeyExprBuilder,
    format: Format,
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(
        session: Arc<zenoh::Session>,
        key_prefix: impl Into<String>,
        format: Format,
    ) -> Self {
        Self {
            session,
            keys: KeyExprBuilder::new(key_prefix),
            format,
        }
    }

    /// Get the key expression builder.
    pub fn keys(&self) -> &KeyExprBuilder {
        &self.keys
    }

    /// Encode a value with the configured format and put it on `key`.
    pub async fn publish_encoded<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let payload =
            encode(value, self.format).map_err(|e| BridgeError::Serialization(e.to_string()))?;
        self.put(key, payload, encoding_for(self.format)).await
    }

    /// Publish a JSON value to a key, regardless of the configured format.
    pub async fn publish_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.put(key, payload, Encoding::APPLICATION_JSON).await
    }

    async fn put(&self, key: &str, payload: Vec<u8>, encoding: Encoding) -> Result<()> {
        self.session
            .put(key, payload)
            .encoding(encoding)
            .await
            .map_err(|e| BridgeError::publish(key, e))?;

        Ok(())
    }
}

/// Zenoh encoding announced for payloads serialized as `format`.
pub fn encoding_for(format: Format) -> Encoding {
    match format {
        Format::Json => Encoding::APPLICATION_JSON,
        Format::Cbor => Encoding::APPLICATION_CBOR,
    }
}

#[async_trait]
impl EventSink for Publisher {
    async fn publish_telemetry(&self, event: &TelemetryEvent) -> Result<()> {
        let key = self.keys.telemetry_key(&event.device_name);
        self.publish_encoded(&key, event).await?;
        tracing::debug!(key = %key, device = %event.device_name, "Published telemetry");
        Ok(())
    }

    async fn publish_error(&self, event: &ErrorEvent) -> Result<()> {
        let key = self.keys.error_key(&event.device_name);
        self.publish_encoded(&key, event).await?;
        tracing::debug!(
            key = %key,
            device = %event.device_name,
            bit = event.error_bit,
            "Published error event"
        );
        Ok(())
    }
}

/// Statistics from one publishing pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    /// Number of successfully published events.
    pub success: usize,
    /// Number of failed publishes.
    pub failed: usize,
}

impl PublishStats {
    /// Record the outcome of one publish.
    pub fn record<T, E>(&mut self, outcome: &std::result::Result<T, E>) {
        if outcome.is_ok() {
            self.success += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Total number of attempted publishes.
    pub fn total(&self) -> usize {
        self.success + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            100.0
        } else {
            (self.success as f64 / self.total() as f64) * 100.0
        }
    }
}
