//! Zenoh transport for inbound commands and desired-property updates.
//!
//! - `<prefix>/@/commands` is a queryable: the query payload is a
//!   [`CommandRequest`], the reply a JSON [`CommandResponse`].
//! - `<prefix>/*/desired` is subscribed to: each sample carries
//!   [`DesiredProperties`] for the device named in the payload or, failing
//!   that, in the key expression.

use std::sync::Arc;

use linebridge_common::{
    CommandRequest, CommandResponse, DesiredProperties, KeyExprBuilder, decode_auto,
};
use linebridge_framework::{BridgeError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zenoh::bytes::Encoding;
use zenoh::sample::SampleKind;

use crate::dispatcher::{CommandDispatcher, CommandError};

/// Decode a command payload and run it.
///
/// Undecodable payloads are answered with 400 and never reach a device.
pub async fn handle_command(dispatcher: &CommandDispatcher, payload: &[u8]) -> CommandResponse {
    match decode_auto::<CommandRequest>(payload) {
        Ok(request) => dispatcher.handle(&request).await,
        Err(e) => {
            debug!(error = %e, payload_len = payload.len(), "Malformed command payload");
            CommandResponse::new(400, format!("Malformed command payload: {}", e))
        }
    }
}

/// Decode a desired-property sample received on `key` and apply it.
pub async fn handle_desired(
    dispatcher: &CommandDispatcher,
    keys: &KeyExprBuilder,
    key: &str,
    payload: &[u8],
) -> std::result::Result<(), CommandError> {
    let desired: DesiredProperties = decode_auto(payload).map_err(|e| {
        debug!(key = %key, error = %e, "Malformed desired properties");
        CommandError::Malformed
    })?;

    let device = match desired.device.as_deref() {
        Some(device) => device,
        None => keys.parse_desired_key(key).ok_or(CommandError::Malformed)?,
    };

    dispatcher
        .apply_desired_rate(device, desired.production_rate)
        .await
}

/// Serves the command queryable and the desired-property subscriber.
pub struct CommandServer {
    session: Arc<zenoh::Session>,
    keys: KeyExprBuilder,
    dispatcher: CommandDispatcher,
}

impl CommandServer {
    pub fn new(
        session: Arc<zenoh::Session>,
        keys: KeyExprBuilder,
        dispatcher: CommandDispatcher,
    ) -> Self {
        Self {
            session,
            keys,
            dispatcher,
        }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let command_key = self.keys.command_key();
        let desired_key = self.keys.desired_wildcard();

        let queryable = self
            .session
            .declare_queryable(&command_key)
            .await
            .map_err(|e| BridgeError::ZenohSession(format!("Failed to declare queryable: {}", e)))?;
        let subscriber = self
            .session
            .declare_subscriber(&desired_key)
            .await
            .map_err(|e| BridgeError::ZenohSession(format!("Failed to declare subscriber: {}", e)))?;

        info!(commands = %command_key, desired = %desired_key, "Accepting commands");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                query = queryable.recv_async() => {
                    let query = match query {
                        Ok(query) => query,
                        Err(e) => {
                            warn!(error = %e, "Command queryable closed");
                            break;
                        }
                    };

                    let payload = query
                        .payload()
                        .map(|p| p.to_bytes().into_owned())
                        .unwrap_or_default();
                    let response = handle_command(&self.dispatcher, &payload).await;

                    let reply = match serde_json::to_vec(&response) {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode command response");
                            continue;
                        }
                    };
                    if let Err(e) = query
                        .reply(query.key_expr().clone(), reply)
                        .encoding(Encoding::APPLICATION_JSON)
                        .await
                    {
                        warn!(error = %e, status = response.status, "Failed to reply to command");
                    }
                }

                sample = subscriber.recv_async() => {
                    let sample = match sample {
                        Ok(sample) => sample,
                        Err(e) => {
                            warn!(error = %e, "Desired-property subscriber closed");
                            break;
                        }
                    };
                    if sample.kind() == SampleKind::Delete {
                        continue;
                    }

                    let key = sample.key_expr().as_str().to_string();
                    let payload = sample.payload().to_bytes();
                    if let Err(e) = handle_desired(&self.dispatcher, &self.keys, &key, &payload).await {
                        warn!(key = %key, status = e.status(), error = %e, "Desired properties rejected");
                    }
                }
            }
        }

        if let Err(e) = queryable.undeclare().await {
            warn!(error = %e, "Failed to undeclare command queryable");
        }
        if let Err(e) = subscriber.undeclare().await {
            warn!(error = %e, "Failed to undeclare desired-property subscriber");
        }

        info!("Command transport stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DeviceClient;
    use crate::config::ReconnectPolicy;
    use crate::connection::DeviceConnection;
    use crate::registry::{DeviceRegistry, DiscoveryFilter};
    use crate::simulator::{SimulatedClient, SimulatedDevice};
    use std::time::Duration;

    fn setup() -> (Arc<SimulatedClient>, CommandDispatcher) {
        let sim = Arc::new(SimulatedClient::with_devices(
            2,
            [SimulatedDevice::new("Device 1")],
        ));
        let client: Arc<dyn DeviceClient> = sim.clone();
        let conn = Arc::new(DeviceConnection::new(
            client,
            "sim://line",
            2,
            Duration::from_millis(200),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            conn,
            DiscoveryFilter::new(2, "Device"),
            ReconnectPolicy::OnFailure,
        ));
        (sim, CommandDispatcher::new(registry))
    }

    #[tokio::test]
    async fn test_garbage_payload_is_400() {
        let (_sim, dispatcher) = setup();
        let response = handle_command(&dispatcher, b"not json").await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_command_payload_dispatched() {
        let (sim, dispatcher) = setup();
        let payload = br#"{"device": "Device 1", "command": "EmergencyStop"}"#;

        let response = handle_command(&dispatcher, payload).await;
        assert_eq!(response.status, 200);
        assert_eq!(sim.device("Device 1").unwrap().production_status, 0);
    }

    #[tokio::test]
    async fn test_desired_uses_key_segment() {
        let (sim, dispatcher) = setup();
        let keys = KeyExprBuilder::default();

        handle_desired(
            &dispatcher,
            &keys,
            "linebridge/opcua/Device_1/desired",
            br#"{"productionRate": 30}"#,
        )
        .await
        .unwrap();
        assert_eq!(sim.device("Device 1").unwrap().production_rate, 30);
    }

    #[tokio::test]
    async fn test_desired_payload_device_wins() {
        let (sim, dispatcher) = setup();
        let keys = KeyExprBuilder::default();

        handle_desired(
            &dispatcher,
            &keys,
            "linebridge/opcua/whatever/desired",
            br#"{"device": "Device 1", "productionRate": 90}"#,
        )
        .await
        .unwrap();
        assert_eq!(sim.device("Device 1").unwrap().production_rate, 90);
    }

    #[tokio::test]
    async fn test_desired_invalid_rate_rejected() {
        let (sim, dispatcher) = setup();
        let keys = KeyExprBuilder::default();

        let result = handle_desired(
            &dispatcher,
            &keys,
            "linebridge/opcua/Device_1/desired",
            br#"{"productionRate": 45}"#,
        )
        .await;
        assert_eq!(result, Err(CommandError::InvalidRate(45)));
        assert_eq!(sim.device("Device 1").unwrap().production_rate, 50);
    }
}
