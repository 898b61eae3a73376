//! Per-device state snapshot and device mutators.

use linebridge_common::{TelemetryEvent, current_timestamp_millis};
use serde::Serialize;
use tracing::{debug, warn};

use crate::client::Variant;
use crate::connection::DeviceConnection;

/// Variable names under a device node.
pub mod field {
    pub const WORKORDER_ID: &str = "WorkorderId";
    pub const PRODUCTION_STATUS: &str = "ProductionStatus";
    pub const PRODUCTION_RATE: &str = "ProductionRate";
    pub const GOOD_COUNT: &str = "GoodCount";
    pub const BAD_COUNT: &str = "BadCount";
    pub const TEMPERATURE: &str = "Temperature";
    pub const DEVICE_ERROR: &str = "DeviceError";
}

/// Method names under a device node.
pub mod method {
    pub const EMERGENCY_STOP: &str = "EmergencyStop";
    pub const RESET_ERROR_STATUS: &str = "ResetErrorStatus";
}

/// Production rate bounds, in percent.
pub const MIN_PRODUCTION_RATE: i64 = 0;
pub const MAX_PRODUCTION_RATE: i64 = 100;
/// Rates move in steps of this size.
pub const PRODUCTION_RATE_STEP: i64 = 10;

/// Whether `rate` is an acceptable production rate (0..=100, multiple of 10).
pub fn is_valid_production_rate(rate: i64) -> bool {
    (MIN_PRODUCTION_RATE..=MAX_PRODUCTION_RATE).contains(&rate)
        && rate % PRODUCTION_RATE_STEP == 0
}

/// Last-read state of one device.
///
/// Every refresh builds a whole new record; fields are never merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub name: String,
    pub workorder_id: String,
    pub production_status: String,
    pub production_rate: i64,
    pub good_count: u64,
    pub bad_count: u64,
    pub temperature: f64,
    pub error_bits: u32,
}

impl DeviceRecord {
    /// A record with every field at its default, as created on first discovery.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Read every field of `name`.
    ///
    /// A field that cannot be read keeps its default value.
    pub async fn read(connection: &DeviceConnection, name: &str) -> Self {
        let workorder_id = read_or_default(connection, name, field::WORKORDER_ID, |v| {
            Some(v.as_text())
        })
        .await;
        let production_status = read_or_default(connection, name, field::PRODUCTION_STATUS, |v| {
            Some(v.as_text())
        })
        .await;
        let production_rate =
            read_or_default(connection, name, field::PRODUCTION_RATE, Variant::as_i64).await;
        let good_count = read_or_default(connection, name, field::GOOD_COUNT, as_count).await;
        let bad_count = read_or_default(connection, name, field::BAD_COUNT, as_count).await;
        let temperature =
            read_or_default(connection, name, field::TEMPERATURE, Variant::as_f64).await;
        let error_bits = read_or_default(connection, name, field::DEVICE_ERROR, as_mask).await;

        Self {
            name: name.to_string(),
            workorder_id,
            production_status,
            production_rate,
            good_count,
            bad_count,
            temperature,
            error_bits,
        }
    }

    /// Telemetry event for this snapshot.
    pub fn telemetry(&self) -> TelemetryEvent {
        TelemetryEvent {
            device_name: self.name.clone(),
            production_status: self.production_status.clone(),
            workorder_id: self.workorder_id.clone(),
            good_count: self.good_count,
            bad_count: self.bad_count,
            temperature: self.temperature,
            timestamp: current_timestamp_millis(),
        }
    }

    /// Write a new production rate to the device.
    ///
    /// Returns `false` without touching the device if the rate is invalid.
    pub async fn set_production_rate(&self, connection: &DeviceConnection, rate: i64) -> bool {
        if !is_valid_production_rate(rate) {
            warn!(device = %self.name, rate, "Rejected production rate");
            return false;
        }
        connection
            .write_field(&self.name, field::PRODUCTION_RATE, Variant::Int(rate))
            .await
    }

    /// Trigger the device's emergency stop.
    pub async fn emergency_stop(&self, connection: &DeviceConnection) -> bool {
        connection.invoke(&self.name, method::EMERGENCY_STOP).await
    }

    /// Clear the device's error register.
    pub async fn reset_error_status(&self, connection: &DeviceConnection) -> bool {
        connection.invoke(&self.name, method::RESET_ERROR_STATUS).await
    }
}

/// Read only the error register of `name`; `None` when it cannot be read.
pub async fn read_error_bits(connection: &DeviceConnection, name: &str) -> Option<u32> {
    match connection.read_field(name, field::DEVICE_ERROR).await {
        Ok(value) => as_mask(&value),
        Err(e) => {
            debug!(device = %name, error = %e, "Error register unreadable");
            None
        }
    }
}

async fn read_or_default<T: Default>(
    connection: &DeviceConnection,
    device: &str,
    field_name: &str,
    convert: impl Fn(&Variant) -> Option<T>,
) -> T {
    match connection.read_field(device, field_name).await {
        Ok(value) => convert(&value).unwrap_or_else(|| {
            debug!(device = %device, field = field_name, value = ?value, "Unexpected field type");
            T::default()
        }),
        Err(e) => {
            debug!(device = %device, field = field_name, error = %e, "Field read failed");
            T::default()
        }
    }
}

fn as_count(value: &Variant) -> Option<u64> {
    value.as_i64().and_then(|v| u64::try_from(v).ok())
}

/// The error register is a 32-bit mask; wider values keep their low word.
fn as_mask(value: &Variant) -> Option<u32> {
    value.as_i64().map(|v| (v & 0xFFFF_FFFF) as u32)
}
