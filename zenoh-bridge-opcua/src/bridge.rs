//! Assembles the core components around one device connection.

use std::sync::Arc;

use linebridge_framework::EventSink;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::DeviceClient;
use crate::config::{ClientConfig, ConfigError, OpcuaConfig};
use crate::connection::DeviceConnection;
use crate::dispatcher::CommandDispatcher;
use crate::errors::ErrorDiffLoop;
#[cfg(feature = "opcua")]
use crate::opcua_client::OpcuaClient;
use crate::registry::{DeviceRegistry, DiscoveryFilter};
use crate::simulator::SimulatedClient;
use crate::telemetry::TelemetryLoop;

/// A device-protocol client built from configuration.
pub struct BuiltClient {
    pub client: Arc<dyn DeviceClient>,
    /// Set when the client is the in-process simulator, so it can be ticked.
    pub simulator: Option<Arc<SimulatedClient>>,
}

/// Instantiate the configured device-protocol client.
pub fn build_client(config: &OpcuaConfig) -> Result<BuiltClient, ConfigError> {
    match &config.client {
        #[cfg(feature = "opcua")]
        ClientConfig::Opcua(settings) => Ok(BuiltClient {
            client: Arc::new(OpcuaClient::new(settings)?),
            simulator: None,
        }),
        #[cfg(not(feature = "opcua"))]
        ClientConfig::Opcua(_) => Err(ConfigError::Validation(
            "Client type \"opcua\" is not compiled in, rebuild with --features opcua".to_string(),
        )),
        ClientConfig::Simulated { devices } => {
            let sim = Arc::new(SimulatedClient::with_devices(
                config.namespace_index,
                devices.iter().cloned(),
            ));
            Ok(BuiltClient {
                client: sim.clone(),
                simulator: Some(sim),
            })
        }
    }
}

/// Connection, registry, both polling loops and the dispatcher.
pub struct LineBridge {
    pub connection: Arc<DeviceConnection>,
    pub registry: Arc<DeviceRegistry>,
    pub telemetry: Arc<TelemetryLoop>,
    pub errors: Arc<ErrorDiffLoop>,
    pub dispatcher: CommandDispatcher,
}

impl LineBridge {
    pub fn new(config: &OpcuaConfig, client: Arc<dyn DeviceClient>, sink: Arc<dyn EventSink>) -> Self {
        let connection = Arc::new(DeviceConnection::new(
            client,
            config.endpoint.clone(),
            config.namespace_index,
            config.call_timeout(),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            connection.clone(),
            DiscoveryFilter::new(config.namespace_index, config.device_prefix.clone()),
            config.reconnect_policy,
        ));
        let telemetry = Arc::new(TelemetryLoop::new(
            registry.clone(),
            sink.clone(),
            config.telemetry_interval(),
            config.reconnect_backoff(),
        ));
        let errors = Arc::new(ErrorDiffLoop::new(
            registry.clone(),
            sink,
            config.error_poll_interval(),
        ));
        let dispatcher = CommandDispatcher::new(registry.clone());

        Self {
            connection,
            registry,
            telemetry,
            errors,
            dispatcher,
        }
    }

    /// Start both loops under `shutdown`.
    pub fn start(&self, shutdown: &CancellationToken) {
        self.telemetry.start(shutdown);
        self.errors.start(shutdown);
    }

    /// Stop both loops and close the device connection. Safe to repeat.
    pub async fn stop(&self) {
        self.telemetry.stop().await;
        self.errors.stop().await;
        self.connection.disconnect().await;
        info!("Line bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> OpcuaConfig {
        json5::from_str(json).unwrap()
    }

    #[test]
    fn test_build_simulated_client() {
        let built = build_client(&config(
            r#"{ endpoint: "sim://line", client: { type: "simulated", devices: [{ name: "Device 1" }] } }"#,
        ))
        .unwrap();
        assert!(built.simulator.is_some());
    }

    #[cfg(not(feature = "opcua"))]
    #[test]
    fn test_opcua_client_unavailable_without_feature() {
        let result = build_client(&config(r#"{ endpoint: "opc.tcp://plc.example:4840/" }"#));
        assert!(result.is_err_and(|e| e.to_string().contains("--features opcua")));
    }

    #[cfg(feature = "opcua")]
    #[test]
    fn test_build_opcua_client() {
        let built = build_client(&config(r#"{ endpoint: "opc.tcp://plc.example:4840/" }"#)).unwrap();
        assert!(built.simulator.is_none());
    }
}
