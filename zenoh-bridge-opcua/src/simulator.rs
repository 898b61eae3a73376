//! In-process simulated OPC UA endpoint.
//!
//! Exposes production-line devices with the same node layout as the real
//! line server: device objects `ns=<ns>;s=<name>` under the Objects folder,
//! variables `<name>/<Field>` and methods `<name>/<Method>`. The test suite
//! and local runs (`client.type = "simulated"`) drive the bridge with it.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::{ClientError, DeviceClient, NodeId, NodeInfo, Variant};
use crate::record::{field, method};

/// `DeviceError` bit raised by an emergency stop.
pub const EMERGENCY_STOP_BIT: i64 = 1;

/// Initial state of a simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedDevice {
    pub name: String,
    #[serde(default)]
    pub workorder_id: String,
    #[serde(default = "default_status")]
    pub production_status: i64,
    #[serde(default = "default_rate")]
    pub production_rate: i64,
    #[serde(default)]
    pub good_count: i64,
    #[serde(default)]
    pub bad_count: i64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub device_error: i64,
}

fn default_status() -> i64 {
    1
}

fn default_rate() -> i64 {
    50
}

fn default_temperature() -> f64 {
    60.0
}

impl SimulatedDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workorder_id: String::new(),
            production_status: default_status(),
            production_rate: default_rate(),
            good_count: 0,
            bad_count: 0,
            temperature: default_temperature(),
            device_error: 0,
        }
    }

    fn read(&self, field_name: &str) -> Option<Variant> {
        let value = match field_name {
            field::WORKORDER_ID => Variant::String(self.workorder_id.clone()),
            field::PRODUCTION_STATUS => Variant::Int(self.production_status),
            field::PRODUCTION_RATE => Variant::Int(self.production_rate),
            field::GOOD_COUNT => Variant::Int(self.good_count),
            field::BAD_COUNT => Variant::Int(self.bad_count),
            field::TEMPERATURE => Variant::Float(self.temperature),
            field::DEVICE_ERROR => Variant::Int(self.device_error),
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    reachable: bool,
    connects: u64,
    devices: BTreeMap<String, SimulatedDevice>,
    foreign_nodes: Vec<NodeInfo>,
    failing_fields: HashSet<(String, String)>,
}

/// Simulated device-protocol endpoint.
#[derive(Debug)]
pub struct SimulatedClient {
    namespace: u16,
    state: Mutex<SimState>,
}

impl SimulatedClient {
    /// Create a reachable endpoint with no devices.
    pub fn new(namespace: u16) -> Self {
        let state = SimState {
            reachable: true,
            foreign_nodes: vec![NodeInfo {
                node_id: NodeId::new(0, "Server"),
                display_name: "Server".to_string(),
            }],
            ..Default::default()
        };

        Self {
            namespace,
            state: Mutex::new(state),
        }
    }

    /// Create an endpoint pre-populated with devices.
    pub fn with_devices(namespace: u16, devices: impl IntoIterator<Item = SimulatedDevice>) -> Self {
        let client = Self::new(namespace);
        for device in devices {
            client.add_device(device);
        }
        client
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add (or replace) a device.
    pub fn add_device(&self, device: SimulatedDevice) {
        self.state().devices.insert(device.name.clone(), device);
    }

    /// Remove a device; returns whether it existed.
    pub fn remove_device(&self, name: &str) -> bool {
        self.state().devices.remove(name).is_some()
    }

    /// Current state of a device.
    pub fn device(&self, name: &str) -> Option<SimulatedDevice> {
        self.state().devices.get(name).cloned()
    }

    /// Overwrite a device's `DeviceError` register.
    pub fn set_error_bits(&self, name: &str, mask: i64) {
        if let Some(device) = self.state().devices.get_mut(name) {
            device.device_error = mask;
        }
    }

    /// Overwrite a device's production rate.
    pub fn set_production_rate(&self, name: &str, rate: i64) {
        if let Some(device) = self.state().devices.get_mut(name) {
            device.production_rate = rate;
        }
    }

    /// Publish an extra node in the Objects folder (e.g. a non-device folder).
    pub fn add_foreign_node(&self, node: NodeInfo) {
        self.state().foreign_nodes.push(node);
    }

    /// Make reads of one field fail with a node error.
    pub fn fail_field(&self, device: &str, field_name: &str) {
        self.state()
            .failing_fields
            .insert((device.to_string(), field_name.to_string()));
    }

    /// Take the endpoint down (dropping any session) or bring it back.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state();
        state.reachable = reachable;
        if !reachable {
            state.connected = false;
        }
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.state().connects
    }

    /// Advance production by one tick on every running device.
    pub fn advance(&self) {
        for device in self.state().devices.values_mut() {
            if device.production_status != 1 {
                continue;
            }
            device.good_count += device.production_rate / 10;
            if device.good_count % 10 == 0 && device.production_rate > 0 {
                device.bad_count += 1;
            }
            device.temperature = 60.0 + device.production_rate as f64 * 0.2;
        }
    }

    fn split_node<'a>(&self, node: &'a NodeId) -> Result<(&'a str, &'a str), ClientError> {
        if node.namespace != self.namespace {
            return Err(ClientError::BadNodeId(node.to_string()));
        }
        node.identifier
            .rsplit_once('/')
            .ok_or_else(|| ClientError::BadNodeId(node.to_string()))
    }

    fn session(&self) -> Result<MutexGuard<'_, SimState>, ClientError> {
        let state = self.state();
        if !state.reachable {
            return Err(ClientError::ConnectionLost("endpoint unreachable".to_string()));
        }
        if !state.connected {
            return Err(ClientError::NotConnected);
        }
        Ok(state)
    }
}

#[async_trait]
impl DeviceClient for SimulatedClient {
    async fn connect(&self, endpoint: &str) -> Result<(), ClientError> {
        let mut state = self.state();
        if !state.reachable {
            return Err(ClientError::ConnectionRefused(endpoint.to_string()));
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.state().connected = false;
        Ok(())
    }

    async fn browse_objects(&self) -> Result<Vec<NodeInfo>, ClientError> {
        let state = self.session()?;
        let mut nodes = state.foreign_nodes.clone();
        nodes.extend(state.devices.keys().map(|name| NodeInfo {
            node_id: NodeId::device(self.namespace, name),
            display_name: name.clone(),
        }));
        Ok(nodes)
    }

    async fn read(&self, node: &NodeId) -> Result<Variant, ClientError> {
        let (device, field_name) = self.split_node(node)?;
        let state = self.session()?;

        if state
            .failing_fields
            .contains(&(device.to_string(), field_name.to_string()))
        {
            return Err(ClientError::BadNodeId(node.to_string()));
        }

        state
            .devices
            .get(device)
            .and_then(|d| d.read(field_name))
            .ok_or_else(|| ClientError::BadNodeId(node.to_string()))
    }

    async fn write(&self, node: &NodeId, value: Variant) -> Result<(), ClientError> {
        let (device, field_name) = self.split_node(node)?;
        let mut state = self.session()?;

        let target = state
            .devices
            .get_mut(device)
            .ok_or_else(|| ClientError::BadNodeId(node.to_string()))?;

        match (field_name, value.as_i64()) {
            (field::PRODUCTION_RATE, Some(rate)) => {
                target.production_rate = rate;
                Ok(())
            }
            (field::PRODUCTION_RATE, None) => Err(ClientError::WriteRejected {
                node: node.to_string(),
                reason: "type mismatch".to_string(),
            }),
            _ => Err(ClientError::WriteRejected {
                node: node.to_string(),
                reason: "not writable".to_string(),
            }),
        }
    }

    async fn call(&self, object: &NodeId, method_node: &NodeId) -> Result<(), ClientError> {
        let (device, method_name) = self.split_node(method_node)?;
        let mut state = self.session()?;

        if object.identifier != device {
            return Err(ClientError::MethodFailed {
                method: method_node.to_string(),
                reason: format!("method does not belong to {}", object),
            });
        }

        let target = state
            .devices
            .get_mut(device)
            .ok_or_else(|| ClientError::BadNodeId(object.to_string()))?;

        match method_name {
            method::EMERGENCY_STOP => {
                target.production_status = 0;
                target.device_error |= EMERGENCY_STOP_BIT;
                Ok(())
            }
            method::RESET_ERROR_STATUS => {
                target.device_error = 0;
                Ok(())
            }
            _ => Err(ClientError::MethodFailed {
                method: method_node.to_string(),
                reason: "unknown method".to_string(),
            }),
        }
    }
}
