//! Device discovery and the live device registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use linebridge_common::device_segment;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::client::NodeInfo;
use crate::config::ReconnectPolicy;
use crate::connection::{ConnectionError, DeviceConnection};
use crate::record::{self, DeviceRecord};

/// Structural rule deciding which browsed nodes are devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub namespace: u16,
    pub prefix: String,
}

impl DiscoveryFilter {
    pub fn new(namespace: u16, prefix: impl Into<String>) -> Self {
        Self {
            namespace,
            prefix: prefix.into(),
        }
    }

    pub fn matches(&self, node: &NodeInfo) -> bool {
        node.node_id.namespace == self.namespace && node.node_id.identifier.starts_with(&self.prefix)
    }
}

/// Membership change produced by one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Replace the membership of `devices` with exactly `present`.
///
/// Names that disappeared are dropped, new names get a fresh record and
/// names present in both keep their record.
pub fn reconcile(devices: &mut HashMap<String, DeviceRecord>, present: &[String]) -> MembershipChange {
    let keep: HashSet<&str> = present.iter().map(String::as_str).collect();

    let mut removed: Vec<String> = devices
        .keys()
        .filter(|name| !keep.contains(name.as_str()))
        .cloned()
        .collect();
    removed.sort();
    for name in &removed {
        devices.remove(name);
    }

    let mut added = Vec::new();
    for name in present {
        if !devices.contains_key(name) {
            devices.insert(name.clone(), DeviceRecord::new(name.clone()));
            added.push(name.clone());
        }
    }

    MembershipChange { added, removed }
}

/// Pairs of names that map onto the same key-expression segment.
pub fn segment_collisions(names: &[String]) -> Vec<(String, String)> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    let mut collisions = Vec::new();
    for name in names {
        if let Some(first) = seen.insert(device_segment(name), name) {
            collisions.push((first.to_string(), name.clone()));
        }
    }
    collisions
}

/// Live view of the devices exposed by the endpoint.
///
/// Membership changes only through [`discover`](Self::discover). The lock is
/// never held across a protocol call: discovery browses first and reconciles
/// afterwards, snapshots read first and store afterwards.
#[derive(Debug)]
pub struct DeviceRegistry {
    connection: Arc<DeviceConnection>,
    filter: DiscoveryFilter,
    policy: ReconnectPolicy,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    discovered: AtomicBool,
}

impl DeviceRegistry {
    pub fn new(
        connection: Arc<DeviceConnection>,
        filter: DiscoveryFilter,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            connection,
            filter,
            policy,
            devices: RwLock::new(HashMap::new()),
            discovered: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<DeviceConnection> {
        &self.connection
    }

    /// Whether at least one discovery pass has succeeded.
    pub fn has_discovered(&self) -> bool {
        self.discovered.load(Ordering::Acquire)
    }

    /// Browse the endpoint and replace the registry's membership.
    ///
    /// Returns the names of the devices now present. On failure the previous
    /// membership is left untouched.
    pub async fn discover(&self) -> Result<Vec<String>, ConnectionError> {
        if self.policy == ReconnectPolicy::EveryDiscovery && !self.connection.reconnect().await {
            return Err(ConnectionError::NotConnected);
        }

        let nodes = self.connection.browse().await?;

        let mut names: Vec<String> = Vec::new();
        for node in nodes.iter().filter(|n| self.filter.matches(n)) {
            if names.contains(&node.display_name) {
                debug!(device = %node.display_name, "Duplicate device node ignored");
                continue;
            }
            names.push(node.display_name.clone());
        }

        for (first, second) in segment_collisions(&names) {
            warn!(
                device = %second,
                other = %first,
                segment = %device_segment(&second),
                "Devices share a key segment, their events publish on the same keys"
            );
        }

        let change = {
            let mut devices = self.devices.write().await;
            reconcile(&mut devices, &names)
        };
        self.discovered.store(true, Ordering::Release);

        if !change.is_empty() {
            info!(
                added = ?change.added,
                removed = ?change.removed,
                total = names.len(),
                "Device membership changed"
            );
        }

        Ok(names)
    }

    /// Re-read every field of `name` and store the result.
    ///
    /// Returns `None` if the device is not registered, was removed while it
    /// was being read, or the session was lost or replaced during the read.
    pub async fn snapshot(&self, name: &str) -> Option<DeviceRecord> {
        if !self.devices.read().await.contains_key(name) {
            return None;
        }

        let session = self.connection.session_id()?;
        let record = DeviceRecord::read(&self.connection, name).await;

        // Fields read across two sessions may mix real and default values.
        if self.connection.session_id() != Some(session) {
            warn!(device = %name, "Session changed during snapshot, discarding it");
            return None;
        }

        let mut devices = self.devices.write().await;
        match devices.get_mut(name) {
            Some(slot) => {
                *slot = record.clone();
                Some(record)
            }
            None => {
                debug!(device = %name, "Device removed during snapshot");
                None
            }
        }
    }

    /// Current records, in no particular order.
    pub async fn get_all(&self) -> Vec<DeviceRecord> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Names of the registered devices.
    pub async fn names(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Look a device up by name, or by its key-expression segment.
    pub async fn find_by_name(&self, name: &str) -> Option<DeviceRecord> {
        let devices = self.devices.read().await;
        if let Some(record) = devices.get(name) {
            return Some(record.clone());
        }

        let mut by_segment = devices.values().filter(|r| device_segment(&r.name) == name);
        match (by_segment.next(), by_segment.next()) {
            (Some(record), None) => Some(record.clone()),
            _ => None,
        }
    }

    /// Find a device, running a discovery pass if it is not known yet.
    pub async fn resolve(&self, name: &str) -> Result<Option<DeviceRecord>, ConnectionError> {
        if let Some(record) = self.find_by_name(name).await {
            return Ok(Some(record));
        }

        debug!(device = %name, "Unknown device, refreshing registry");
        self.discover().await?;
        Ok(self.find_by_name(name).await)
    }

    /// Read the error register of `name` and cache it on the record.
    pub async fn read_error_bits(&self, name: &str) -> Option<u32> {
        let bits = record::read_error_bits(&self.connection, name).await?;
        if let Some(record) = self.devices.write().await.get_mut(name) {
            record.error_bits = bits;
        }
        Some(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NodeId;
    use crate::connection::gated::GatedClient;
    use crate::record::field;
    use crate::simulator::{SimulatedClient, SimulatedDevice};
    use std::time::Duration;

    fn setup(names: &[&str], policy: ReconnectPolicy) -> (Arc<SimulatedClient>, DeviceRegistry) {
        let sim = Arc::new(SimulatedClient::with_devices(
            2,
            names.iter().map(|n| SimulatedDevice::new(*n)),
        ));
        let conn = Arc::new(DeviceConnection::new(
            sim.clone(),
            "sim://line",
            2,
            Duration::from_millis(200),
        ));
        let registry = DeviceRegistry::new(conn, DiscoveryFilter::new(2, "Device"), policy);
        (sim, registry)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reconcile_replaces_membership() {
        let mut devices = HashMap::new();

        let change = reconcile(&mut devices, &names(&["A", "B"]));
        assert_eq!(change.added, names(&["A", "B"]));
        assert!(change.removed.is_empty());

        devices.get_mut("B").unwrap().good_count = 42;

        let change = reconcile(&mut devices, &names(&["B", "C"]));
        assert_eq!(change.added, names(&["C"]));
        assert_eq!(change.removed, names(&["A"]));
        assert_eq!(devices.len(), 2);
        assert!(!devices.contains_key("A"));
        assert_eq!(devices["B"].good_count, 42);

        let change = reconcile(&mut devices, &[]);
        assert_eq!(change.removed, names(&["B", "C"]));
        assert!(devices.is_empty());
    }

    #[test]
    fn test_reconcile_readded_is_fresh() {
        let mut devices = HashMap::new();
        reconcile(&mut devices, &names(&["A"]));
        devices.get_mut("A").unwrap().error_bits = 0b101;

        reconcile(&mut devices, &[]);
        reconcile(&mut devices, &names(&["A"]));
        assert_eq!(devices["A"], DeviceRecord::new("A"));
    }

    #[test]
    fn test_filter() {
        let filter = DiscoveryFilter::new(2, "Device");
        let node = |ns, id: &str| NodeInfo {
            node_id: NodeId::new(ns, id),
            display_name: id.to_string(),
        };

        assert!(filter.matches(&node(2, "Device 1")));
        assert!(!filter.matches(&node(0, "Device 1")));
        assert!(!filter.matches(&node(2, "Folder")));
    }

    #[tokio::test]
    async fn test_discover_filters_foreign_nodes() {
        let (sim, registry) = setup(&["Device 1", "Device 2"], ReconnectPolicy::OnFailure);
        sim.add_foreign_node(NodeInfo {
            node_id: NodeId::new(2, "Diagnostics"),
            display_name: "Diagnostics".to_string(),
        });
        assert!(registry.connection().ensure_connected().await);

        let mut found = registry.discover().await.unwrap();
        found.sort();
        assert_eq!(found, names(&["Device 1", "Device 2"]));
        assert_eq!(registry.len().await, 2);
        assert!(registry.has_discovered());
    }

    #[tokio::test]
    async fn test_removed_device_disappears() {
        let (sim, registry) = setup(&["Device 1", "Device 2"], ReconnectPolicy::OnFailure);
        assert!(registry.connection().ensure_connected().await);
        registry.discover().await.unwrap();

        sim.remove_device("Device 2");
        registry.discover().await.unwrap();

        let all = registry.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Device 1");
        assert!(registry.find_by_name("Device 2").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_discovery_keeps_membership() {
        let (sim, registry) = setup(&["Device 1"], ReconnectPolicy::OnFailure);
        assert!(registry.connection().ensure_connected().await);
        registry.discover().await.unwrap();

        sim.set_reachable(false);
        assert!(registry.discover().await.is_err());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_reads_fields() {
        let (sim, registry) = setup(&["Device 1"], ReconnectPolicy::OnFailure);
        sim.set_error_bits("Device 1", 0b100);
        assert!(registry.connection().ensure_connected().await);
        registry.discover().await.unwrap();

        let record = registry.snapshot("Device 1").await.unwrap();
        assert_eq!(record.production_rate, 50);
        assert_eq!(record.production_status, "1");
        assert_eq!(record.error_bits, 0b100);
        assert_eq!(registry.find_by_name("Device 1").await, Some(record));
    }

    #[tokio::test]
    async fn test_snapshot_defaults_failed_field() {
        let (sim, registry) = setup(&["Device 1"], ReconnectPolicy::OnFailure);
        sim.set_production_rate("Device 1", 80);
        sim.fail_field("Device 1", field::TEMPERATURE);
        assert!(registry.connection().ensure_connected().await);
        registry.discover().await.unwrap();

        let record = registry.snapshot("Device 1").await.unwrap();
        assert_eq!(record.temperature, 0.0);
        assert_eq!(record.production_rate, 80);
    }

    #[tokio::test]
    async fn test_snapshot_unknown_device() {
        let (_sim, registry) = setup(&["Device 1"], ReconnectPolicy::OnFailure);
        assert!(registry.connection().ensure_connected().await);
        assert!(registry.snapshot("Device 1").await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_triggers_discovery() {
        let (_sim, registry) = setup(&["Device 1"], ReconnectPolicy::OnFailure);
        assert!(registry.connection().ensure_connected().await);
        assert!(registry.is_empty().await);

        let record = registry.resolve("Device 1").await.unwrap();
        assert_eq!(record.map(|r| r.name), Some("Device 1".to_string()));
        assert_eq!(registry.resolve("Device 9").await, Ok(None));
    }

    #[tokio::test]
    async fn test_find_by_key_segment() {
        let (_sim, registry) = setup(&["Device 1"], ReconnectPolicy::OnFailure);
        assert!(registry.connection().ensure_connected().await);
        registry.discover().await.unwrap();

        let record = registry.find_by_name("Device_1").await.unwrap();
        assert_eq!(record.name, "Device 1");
    }

    #[test]
    fn test_segment_collisions() {
        assert!(segment_collisions(&names(&["Device 1", "Device 2"])).is_empty());
        assert_eq!(
            segment_collisions(&names(&["Device 1", "Device 2", "Device_1"])),
            vec![("Device 1".to_string(), "Device_1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_colliding_devices_are_both_registered() {
        let (_sim, registry) = setup(&["Device 1", "Device_1"], ReconnectPolicy::OnFailure);
        assert!(registry.connection().ensure_connected().await);
        registry.discover().await.unwrap();

        assert_eq!(registry.len().await, 2);
        assert_eq!(
            registry.find_by_name("Device 1").await.map(|r| r.name),
            Some("Device 1".to_string())
        );
        assert_eq!(
            registry.find_by_name("Device_1").await.map(|r| r.name),
            Some("Device_1".to_string())
        );
    }

    #[tokio::test]
    async fn test_snapshot_across_reconnect_is_discarded() {
        let sim = Arc::new(SimulatedClient::with_devices(
            2,
            [SimulatedDevice::new("Device 1")],
        ));
        let client = Arc::new(GatedClient::new(sim.clone(), field::TEMPERATURE));
        let conn = Arc::new(DeviceConnection::new(
            client.clone(),
            "sim://line",
            2,
            Duration::from_secs(5),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            conn.clone(),
            DiscoveryFilter::new(2, "Device"),
            ReconnectPolicy::OnFailure,
        ));
        assert!(conn.ensure_connected().await);
        registry.discover().await.unwrap();
        let stored = registry.snapshot("Device 1").await.unwrap();
        assert_eq!(stored.production_rate, 50);

        sim.set_production_rate("Device 1", 80);
        client.arm();
        let snapshot = tokio::spawn({
            let registry = registry.clone();
            async move { registry.snapshot("Device 1").await }
        });
        client.entered.notified().await;

        assert!(conn.reconnect().await);
        client.release.notify_one();

        assert_eq!(snapshot.await.unwrap(), None);
        assert!(conn.is_connected());
        assert_eq!(registry.find_by_name("Device 1").await, Some(stored));
    }

    #[tokio::test]
    async fn test_snapshot_while_disconnected() {
        let (_sim, registry) = setup(&["Device 1"], ReconnectPolicy::OnFailure);
        assert!(registry.connection().ensure_connected().await);
        registry.discover().await.unwrap();

        registry.connection().disconnect().await;
        assert!(registry.snapshot("Device 1").await.is_none());
        assert_eq!(
            registry.find_by_name("Device 1").await,
            Some(DeviceRecord::new("Device 1"))
        );
    }

    #[tokio::test]
    async fn test_every_discovery_reconnects() {
        let (sim, registry) = setup(&["Device 1"], ReconnectPolicy::EveryDiscovery);

        registry.discover().await.unwrap();
        registry.discover().await.unwrap();
        assert_eq!(sim.connect_count(), 2);
    }
}
