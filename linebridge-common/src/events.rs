//! Messages exchanged with the outbound event channel.
//!
//! Outbound: [`TelemetryEvent`] on the telemetry cadence and one
//! [`ErrorEvent`] per error bit that rose since the last observation.
//! Inbound: [`CommandRequest`] answered with a [`CommandResponse`], and
//! [`DesiredProperties`] updates.

use serde::{Deserialize, Serialize};

/// Periodic telemetry for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    /// Device display name.
    pub device_name: String,
    /// Production status as last read from the device.
    pub production_status: String,
    /// Current work order, empty when none is loaded.
    pub workorder_id: String,
    /// Good parts produced.
    pub good_count: u64,
    /// Rejected parts produced.
    pub bad_count: u64,
    /// Temperature, passed through without unit conversion.
    pub temperature: f64,
    /// Unix epoch milliseconds when the snapshot was taken.
    #[serde(default)]
    pub timestamp: i64,
}

/// Rising-edge error event for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    /// Device display name.
    pub device_name: String,
    /// Index of the bit that was set (0 = least significant).
    pub error_bit: u8,
    /// `1 << error_bit`.
    pub error_code: u32,
    /// Unix epoch milliseconds when the edge was observed.
    #[serde(default)]
    pub timestamp: i64,
}

impl ErrorEvent {
    /// Build an event for `bit`, deriving the error code from it.
    pub fn rising(device_name: impl Into<String>, bit: u8) -> Self {
        Self {
            device_name: device_name.into(),
            error_bit: bit,
            error_code: 1u32 << bit,
            timestamp: current_timestamp_millis(),
        }
    }
}

/// Inbound direct-method call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub command: String,
}

/// Reply to a [`CommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// 200, 400, 404 or 500.
    pub status: u16,
    pub message: String,
}

impl CommandResponse {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(200, message)
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Desired-state update pushed to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredProperties {
    /// Target device; falls back to the key expression segment when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Requested production rate in percent.
    pub production_rate: i64,
}

/// Get the current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
