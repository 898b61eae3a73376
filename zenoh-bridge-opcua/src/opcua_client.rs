//! [`DeviceClient`] backed by a real OPC UA session (`async-opcua`).
//!
//! Sessions are anonymous and unsecured, matching the endpoints the bridge
//! is deployed against. The client never reconnects on its own:
//! [`crate::connection::DeviceConnection`] decides when to reopen.

use std::sync::Arc;

use async_trait::async_trait;
use opcua::client::{Client, ClientBuilder, IdentityToken, Session};
use opcua::crypto::SecurityPolicy;
use opcua::types::{
    AttributeId, BrowseDescription, BrowseDirection, CallMethodRequest, DataValue, Identifier,
    MessageSecurityMode, ObjectId, ReadValueId, ReferenceTypeId, StatusCode, TimestampsToReturn,
    UAString, UserTokenPolicy, Variant as UaVariant, WriteValue,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{ClientError, DeviceClient, NodeId, NodeInfo, Variant};
use crate::config::{ConfigError, OpcuaClientConfig};

/// Return every attribute of a browsed reference.
const BROWSE_RESULT_MASK: u32 = 0x3F;

/// Status codes meaning the session or its channel is gone.
const SESSION_LOSS: [StatusCode; 8] = [
    StatusCode::BadNotConnected,
    StatusCode::BadConnectionClosed,
    StatusCode::BadSessionIdInvalid,
    StatusCode::BadSessionClosed,
    StatusCode::BadTimeout,
    StatusCode::BadCommunicationError,
    StatusCode::BadSecureChannelClosed,
    StatusCode::BadServerNotConnected,
];

struct OpenSession {
    session: Arc<Session>,
    event_loop: JoinHandle<StatusCode>,
}

/// OPC UA client speaking `opc.tcp://`.
pub struct OpcuaClient {
    client: Mutex<Client>,
    open: Mutex<Option<OpenSession>>,
}

impl OpcuaClient {
    pub fn new(config: &OpcuaClientConfig) -> Result<Self, ConfigError> {
        let client = ClientBuilder::new()
            .application_name(config.application_name.as_str())
            .application_uri(config.application_uri.as_str())
            .trust_server_certs(config.trust_server_certs)
            .create_sample_keypair(true)
            .session_retry_limit(0)
            .client()
            .map_err(|errors| {
                ConfigError::Validation(format!("Invalid OPC UA client: {}", errors.join(", ")))
            })?;

        Ok(Self {
            client: Mutex::new(client),
            open: Mutex::new(None),
        })
    }

    async fn session(&self) -> Result<Arc<Session>, ClientError> {
        self.open
            .lock()
            .await
            .as_ref()
            .map(|open| open.session.clone())
            .ok_or(ClientError::NotConnected)
    }
}

#[async_trait]
impl DeviceClient for OpcuaClient {
    async fn connect(&self, endpoint: &str) -> Result<(), ClientError> {
        let (session, event_loop) = {
            let mut client = self.client.lock().await;
            client
                .connect_to_matching_endpoint(
                    (
                        endpoint,
                        SecurityPolicy::None.to_str(),
                        MessageSecurityMode::None,
                        UserTokenPolicy::anonymous(),
                    ),
                    IdentityToken::Anonymous,
                )
                .await
                .map_err(|e| ClientError::ConnectionRefused(format!("{:?}", StatusCode::from(e))))?
        };

        // Kept before waiting so a cancelled connect is still torn down.
        *self.open.lock().await = Some(OpenSession {
            session: session.clone(),
            event_loop: event_loop.spawn(),
        });

        if session.wait_for_connection().await {
            debug!(endpoint, "OPC UA session activated");
            Ok(())
        } else {
            self.disconnect().await?;
            Err(ClientError::ConnectionRefused(format!(
                "session to {} was not activated",
                endpoint
            )))
        }
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let Some(open) = self.open.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = open.session.disconnect().await {
            debug!(status = ?StatusCode::from(e), "OPC UA session closed uncleanly");
        }
        open.event_loop.abort();
        Ok(())
    }

    async fn browse_objects(&self) -> Result<Vec<NodeInfo>, ClientError> {
        let session = self.session().await?;
        let description = BrowseDescription {
            node_id: ObjectId::ObjectsFolder.into(),
            browse_direction: BrowseDirection::Forward,
            reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
            include_subtypes: true,
            node_class_mask: 0,
            result_mask: BROWSE_RESULT_MASK,
        };

        let results = session
            .browse(&[description], 0, None)
            .await
            .map_err(|e| session_error(StatusCode::from(e)))?;

        let mut nodes = Vec::new();
        for result in results {
            if !result.status_code.is_good() {
                return Err(session_error(result.status_code));
            }
            for reference in result.references.unwrap_or_default() {
                // Numeric and GUID identifiers never name a device.
                let Some(node_id) = from_ua_node(&reference.node_id.node_id) else {
                    continue;
                };
                nodes.push(NodeInfo {
                    node_id,
                    display_name: ua_text(&reference.display_name.text),
                });
            }
        }
        Ok(nodes)
    }

    async fn read(&self, node: &NodeId) -> Result<Variant, ClientError> {
        let session = self.session().await?;
        let request = ReadValueId {
            node_id: to_ua_node(node),
            attribute_id: AttributeId::Value as u32,
            ..Default::default()
        };

        let values = session
            .read(&[request], TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(|e| session_error(StatusCode::from(e)))?;
        let value = values
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::BadNodeId(node.to_string()))?;

        if let Some(status) = value.status {
            if !status.is_good() {
                return Err(node_error(status, || ClientError::BadNodeId(node.to_string())));
            }
        }
        let value = value
            .value
            .ok_or_else(|| ClientError::BadNodeId(node.to_string()))?;
        from_ua_variant(&value).ok_or_else(|| ClientError::BadValue {
            node: node.to_string(),
            reason: format!("unsupported value {:?}", value),
        })
    }

    async fn write(&self, node: &NodeId, value: Variant) -> Result<(), ClientError> {
        let session = self.session().await?;
        let request = WriteValue {
            node_id: to_ua_node(node),
            attribute_id: AttributeId::Value as u32,
            index_range: Default::default(),
            value: DataValue::new_now(to_ua_variant(&value)),
        };

        let results = session
            .write(&[request])
            .await
            .map_err(|e| session_error(StatusCode::from(e)))?;
        match results.first() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(node_error(*status, || ClientError::WriteRejected {
                node: node.to_string(),
                reason: format!("{:?}", status),
            })),
            None => Err(ClientError::WriteRejected {
                node: node.to_string(),
                reason: "no result returned".to_string(),
            }),
        }
    }

    async fn call(&self, object: &NodeId, method: &NodeId) -> Result<(), ClientError> {
        let session = self.session().await?;
        let request = CallMethodRequest {
            object_id: to_ua_node(object),
            method_id: to_ua_node(method),
            input_arguments: None,
        };

        let result = session
            .call_one(request)
            .await
            .map_err(|e| session_error(StatusCode::from(e)))?;
        if result.status_code.is_good() {
            Ok(())
        } else {
            warn!(method = %method, status = ?result.status_code, "OPC UA method call failed");
            Err(node_error(result.status_code, || ClientError::MethodFailed {
                method: method.to_string(),
                reason: format!("{:?}", result.status_code),
            }))
        }
    }
}

fn is_session_loss(status: StatusCode) -> bool {
    SESSION_LOSS.contains(&status)
}

/// Error for a failed service call as a whole.
fn session_error(status: StatusCode) -> ClientError {
    if is_session_loss(status) {
        ClientError::ConnectionLost(format!("{:?}", status))
    } else {
        ClientError::BadValue {
            node: "service".to_string(),
            reason: format!("{:?}", status),
        }
    }
}

/// Error for a single failed operation; session loss wins over `otherwise`.
fn node_error(status: StatusCode, otherwise: impl FnOnce() -> ClientError) -> ClientError {
    if is_session_loss(status) {
        ClientError::ConnectionLost(format!("{:?}", status))
    } else {
        otherwise()
    }
}

fn to_ua_node(node: &NodeId) -> opcua::types::NodeId {
    opcua::types::NodeId::new(node.namespace, node.identifier.clone())
}

fn from_ua_node(node: &opcua::types::NodeId) -> Option<NodeId> {
    match &node.identifier {
        Identifier::String(s) => Some(NodeId::new(node.namespace, ua_text(s))),
        _ => None,
    }
}

fn ua_text(s: &UAString) -> String {
    s.value().clone().unwrap_or_default()
}

fn to_ua_variant(value: &Variant) -> UaVariant {
    match value {
        Variant::Bool(v) => UaVariant::Boolean(*v),
        Variant::Int(v) => match i32::try_from(*v) {
            Ok(v) => UaVariant::Int32(v),
            Err(_) => UaVariant::Int64(*v),
        },
        Variant::Float(v) => UaVariant::Double(*v),
        Variant::String(v) => UaVariant::String(UAString::from(v.as_str())),
    }
}

fn from_ua_variant(value: &UaVariant) -> Option<Variant> {
    let value = match value {
        UaVariant::Boolean(v) => Variant::Bool(*v),
        UaVariant::SByte(v) => Variant::Int(i64::from(*v)),
        UaVariant::Byte(v) => Variant::Int(i64::from(*v)),
        UaVariant::Int16(v) => Variant::Int(i64::from(*v)),
        UaVariant::UInt16(v) => Variant::Int(i64::from(*v)),
        UaVariant::Int32(v) => Variant::Int(i64::from(*v)),
        UaVariant::UInt32(v) => Variant::Int(i64::from(*v)),
        UaVariant::Int64(v) => Variant::Int(*v),
        UaVariant::UInt64(v) => Variant::Int(i64::try_from(*v).ok()?),
        UaVariant::Float(v) => Variant::Float(f64::from(*v)),
        UaVariant::Double(v) => Variant::Float(*v),
        UaVariant::String(v) => Variant::String(ua_text(v)),
        _ => return None,
    };
    Some(value)
}
