//! Configuration for the OPC UA bridge.

use std::collections::HashSet;
use std::time::Duration;

use linebridge_framework::{
    BridgeConfig, BridgeError, Format, LoggingConfig, Result as BridgeResult, ZenohConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::is_valid_production_rate;
use crate::simulator::SimulatedDevice;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcuaBridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Payload encoding for published events
    #[serde(default)]
    pub serialization: Format,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// OPC UA endpoint and polling settings
    pub opcua: OpcuaConfig,
}

/// When the device connection is re-established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Keep the session until a call reports it lost.
    #[default]
    OnFailure,
    /// Open a fresh session before every discovery pass.
    EveryDiscovery,
}

/// OPC UA protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcuaConfig {
    /// Endpoint URL (e.g. "opc.tcp://localhost:4840/")
    pub endpoint: String,

    /// Key expression prefix (default: "linebridge/opcua")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Namespace index device nodes live in
    #[serde(default = "default_namespace_index")]
    pub namespace_index: u16,

    /// Identifier prefix a node must carry to count as a device
    #[serde(default = "default_device_prefix")]
    pub device_prefix: String,

    /// Telemetry cadence in seconds
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_secs: u64,

    /// Error register polling cadence in milliseconds
    #[serde(default = "default_error_poll_interval")]
    pub error_poll_interval_ms: u64,

    /// Wait before retrying when the endpoint is unreachable
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,

    /// Upper bound for every protocol call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    #[serde(default)]
    pub reconnect_policy: ReconnectPolicy,

    /// Which device-protocol client to use
    #[serde(default)]
    pub client: ClientConfig,
}

fn default_key_prefix() -> String {
    linebridge_framework::KeyExprBuilder::default()
        .prefix()
        .to_string()
}

fn default_namespace_index() -> u16 {
    2
}

fn default_device_prefix() -> String {
    "Device".to_string()
}

fn default_telemetry_interval() -> u64 {
    5
}

fn default_error_poll_interval() -> u64 {
    100
}

fn default_reconnect_backoff() -> u64 {
    2
}

fn default_call_timeout() -> u64 {
    2000
}

/// Endpoint scheme served by the OPC UA client.
pub const OPCUA_SCHEME: &str = "opc.tcp://";

/// Device-protocol client selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientConfig {
    /// OPC UA session to an `opc.tcp://` endpoint
    Opcua(OpcuaClientConfig),
    /// In-process simulated endpoint
    Simulated {
        #[serde(default)]
        devices: Vec<SimulatedDevice>,
    },
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::Opcua(OpcuaClientConfig::default())
    }
}

impl ClientConfig {
    /// Short name reported in the bridge status.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientConfig::Opcua(_) => "opcua",
            ClientConfig::Simulated { .. } => "simulated",
        }
    }
}

/// OPC UA client identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcuaClientConfig {
    pub application_name: String,
    pub application_uri: String,
    /// Accept server certificates without a trust store entry
    pub trust_server_certs: bool,
}

impl Default for OpcuaClientConfig {
    fn default() -> Self {
        Self {
            application_name: "Linebridge OPC UA bridge".to_string(),
            application_uri: "urn:linebridge:opcua".to_string(),
            trust_server_certs: true,
        }
    }
}

impl OpcuaConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    pub fn error_poll_interval(&self) -> Duration {
        Duration::from_millis(self.error_poll_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Endpoint cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Validation(
                "Key prefix cannot be empty".to_string(),
            ));
        }

        if self.device_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "Device prefix cannot be empty".to_string(),
            ));
        }

        let durations = [
            ("telemetry_interval_secs", self.telemetry_interval_secs),
            ("error_poll_interval_ms", self.error_poll_interval_ms),
            ("reconnect_backoff_secs", self.reconnect_backoff_secs),
            ("call_timeout_ms", self.call_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        let opcua_endpoint = self.endpoint.starts_with(OPCUA_SCHEME);
        match &self.client {
            ClientConfig::Opcua(settings) => {
                if !opcua_endpoint {
                    return Err(ConfigError::Validation(format!(
                        "Client type \"opcua\" needs an {} endpoint, got '{}'",
                        OPCUA_SCHEME, self.endpoint
                    )));
                }
                if settings.application_uri.trim().is_empty() {
                    return Err(ConfigError::Validation(
                        "OPC UA application_uri cannot be empty".to_string(),
                    ));
                }
                if !cfg!(feature = "opcua") {
                    return Err(ConfigError::Validation(
                        "Client type \"opcua\" is not compiled in, rebuild with --features opcua"
                            .to_string(),
                    ));
                }
            }
            ClientConfig::Simulated { devices } => {
                if opcua_endpoint {
                    return Err(ConfigError::Validation(format!(
                        "Endpoint '{}' needs client type \"opcua\", the simulated client never contacts it",
                        self.endpoint
                    )));
                }
                let mut seen = HashSet::new();
                for device in devices {
                    if device.name.is_empty() {
                        return Err(ConfigError::Validation(
                            "Simulated device name cannot be empty".to_string(),
                        ));
                    }
                    if !seen.insert(device.name.as_str()) {
                        return Err(ConfigError::Validation(format!(
                            "Duplicate simulated device '{}'",
                            device.name
                        )));
                    }
                    if !is_valid_production_rate(device.production_rate) {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': production_rate must be 0-100 in steps of 10",
                            device.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

impl BridgeConfig for OpcuaBridgeConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> &str {
        &self.opcua.key_prefix
    }

    fn format(&self) -> Format {
        self.serialization
    }

    fn validate(&self) -> BridgeResult<()> {
        self.opcua
            .validate()
            .map_err(|e| BridgeError::validation(e.to_string()))
    }
}
