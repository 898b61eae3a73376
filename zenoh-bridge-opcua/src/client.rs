//! Device-protocol boundary.
//!
//! [`DeviceClient`] is the request/response surface of the OPC UA endpoint
//! the bridge talks to: connect, browse the Objects folder, read and write
//! variable nodes, and call methods. Everything above this module speaks
//! in device names and field names; everything below it in node ids.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors raised by a [`DeviceClient`] implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Unknown node: {0}")]
    BadNodeId(String),
    #[error("Write rejected for {node}: {reason}")]
    WriteRejected { node: String, reason: String },
    #[error("Bad value at {node}: {reason}")]
    BadValue { node: String, reason: String },
    #[error("Method {method} failed: {reason}")]
    MethodFailed { method: String, reason: String },
}

impl ClientError {
    /// Whether this error means the session itself is unusable.
    ///
    /// Node-level errors leave the connection intact.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ClientError::NotConnected
                | ClientError::ConnectionRefused(_)
                | ClientError::ConnectionLost(_)
        )
    }
}

/// OPC UA node identifier with a string identifier (`ns=2;s=Device 1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: String,
}

impl NodeId {
    pub fn new(namespace: u16, identifier: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: identifier.into(),
        }
    }

    /// Node of a device object.
    pub fn device(namespace: u16, device: &str) -> Self {
        Self::new(namespace, device)
    }

    /// Child node of a device (`<device>/<child>`), used for fields and methods.
    pub fn child(namespace: u16, device: &str, child: &str) -> Self {
        Self::new(namespace, format!("{}/{}", device, child))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};s={}", self.namespace, self.identifier)
    }
}

/// A browsed child of the Objects folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub display_name: String,
}

/// Dynamically typed value read from or written to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Variant {
    /// Integer view, converting floats (truncated), bools and numeric strings.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Variant::Int(v) => Some(*v),
            Variant::Float(v) if v.is_finite() => Some(*v as i64),
            Variant::Float(_) => None,
            Variant::Bool(v) => Some(i64::from(*v)),
            Variant::String(s) => s.trim().parse().ok(),
        }
    }

    /// Floating point view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Float(v) => Some(*v),
            Variant::Int(v) => Some(*v as f64),
            Variant::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Variant::String(s) => s.trim().parse().ok(),
        }
    }

    /// Text view; every variant has one.
    pub fn as_text(&self) -> String {
        match self {
            Variant::String(s) => s.clone(),
            Variant::Int(v) => v.to_string(),
            Variant::Float(v) => v.to_string(),
            Variant::Bool(v) => v.to_string(),
        }
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Float(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Bool(v)
    }
}

/// Request/response client for the device-protocol endpoint.
///
/// Implementations keep their own session state; [`crate::connection::DeviceConnection`]
/// owns the single instance and serializes connect/disconnect.
#[async_trait]
pub trait DeviceClient: Send + Sync + 'static {
    /// Open a session to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<(), ClientError>;

    /// Close the session. Closing an already closed session is not an error.
    async fn disconnect(&self) -> Result<(), ClientError>;

    /// List the children of the server's Objects folder.
    async fn browse_objects(&self) -> Result<Vec<NodeInfo>, ClientError>;

    /// Read the value of a variable node.
    async fn read(&self, node: &NodeId) -> Result<Variant, ClientError>;

    /// Write the value of a variable node.
    async fn write(&self, node: &NodeId, value: Variant) -> Result<(), ClientError>;

    /// Call `method` on `object` without arguments.
    async fn call(&self, object: &NodeId, method: &NodeId) -> Result<(), ClientError>;
}
