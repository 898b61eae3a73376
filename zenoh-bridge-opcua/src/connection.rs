//! The bridge's single connection to the device-protocol endpoint.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::{ClientError, DeviceClient, NodeId, NodeInfo, Variant};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Failure of a primitive issued through [`DeviceConnection`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Not connected to the device endpoint")]
    NotConnected,
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Owns the one device-protocol session of a bridge instance.
///
/// Connect and disconnect transitions are serialized by an async mutex so
/// concurrent reconnect attempts from the polling loops cannot interleave.
/// Every primitive is bounded by the per-call timeout; a timeout or a
/// session-level client error flips the state to `Disconnected`, so the next
/// [`ensure_connected`](Self::ensure_connected) opens a fresh session instead
/// of reading through a stale one.
///
/// Each opened session gets a new id. A failure only tears down the session
/// it was issued on; a late error from a replaced session is ignored.
pub struct DeviceConnection {
    client: Arc<dyn DeviceClient>,
    endpoint: String,
    namespace: u16,
    call_timeout: Duration,
    /// Id of the open session, 0 when disconnected.
    session: AtomicU64,
    last_session: AtomicU64,
    transition: Mutex<()>,
}

impl DeviceConnection {
    /// Wrap a client. No connection is attempted until asked for.
    pub fn new(
        client: Arc<dyn DeviceClient>,
        endpoint: impl Into<String>,
        namespace: u16,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            namespace,
            call_timeout,
            session: AtomicU64::new(0),
            last_session: AtomicU64::new(0),
            transition: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn namespace(&self) -> u16 {
        self.namespace
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session_id().is_some()
    }

    /// Id of the current session; a different id means the session was replaced.
    pub fn session_id(&self) -> Option<u64> {
        match self.session.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Connect if not already connected.
    ///
    /// Never fails past this boundary: errors are logged and reported as `false`.
    pub async fn ensure_connected(&self) -> bool {
        if self.is_connected() {
            return true;
        }

        let _guard = self.transition.lock().await;
        // Another task may have connected while we waited for the lock.
        if self.is_connected() {
            return true;
        }
        self.open_session().await
    }

    /// Drop the current session (if any) and open a new one.
    pub async fn reconnect(&self) -> bool {
        let _guard = self.transition.lock().await;
        self.close_session().await;
        self.open_session().await
    }

    /// Close the session. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let _guard = self.transition.lock().await;
        self.close_session().await;
    }

    /// List the children of the Objects folder.
    pub async fn browse(&self) -> Result<Vec<NodeInfo>, ConnectionError> {
        self.guarded("browse", self.client.browse_objects()).await
    }

    /// Read `<device>/<field>`.
    pub async fn read_field(&self, device: &str, field: &str) -> Result<Variant, ConnectionError> {
        let node = NodeId::child(self.namespace, device, field);
        self.guarded("read", self.client.read(&node)).await
    }

    /// Write `<device>/<field>`; `true` once the endpoint confirmed the write.
    pub async fn write_field(&self, device: &str, field: &str, value: Variant) -> bool {
        let node = NodeId::child(self.namespace, device, field);
        match self.guarded("write", self.client.write(&node, value)).await {
            Ok(()) => {
                debug!(node = %node, "Write confirmed");
                true
            }
            Err(e) => {
                warn!(node = %node, error = %e, "Write failed");
                false
            }
        }
    }

    /// Call the stateless method `<device>/<method>` on the device object.
    pub async fn invoke(&self, device: &str, method: &str) -> bool {
        let object = NodeId::device(self.namespace, device);
        let method_node = NodeId::child(self.namespace, device, method);
        match self
            .guarded("call", self.client.call(&object, &method_node))
            .await
        {
            Ok(()) => {
                info!(device = %device, method = %method, "Method invoked");
                true
            }
            Err(e) => {
                warn!(device = %device, method = %method, error = %e, "Method call failed");
                false
            }
        }
    }

    /// Must be called with the transition lock held.
    async fn open_session(&self) -> bool {
        // Drop any half-open session left behind by a lost connection.
        let _ = tokio::time::timeout(self.call_timeout, self.client.disconnect()).await;

        match tokio::time::timeout(self.call_timeout, self.client.connect(&self.endpoint)).await {
            Ok(Ok(())) => {
                let id = self.last_session.fetch_add(1, Ordering::Relaxed) + 1;
                self.session.store(id, Ordering::Release);
                info!(endpoint = %self.endpoint, session = id, "Connected to device endpoint");
                true
            }
            Ok(Err(e)) => {
                warn!(endpoint = %self.endpoint, error = %e, "Failed to connect to device endpoint");
                false
            }
            Err(_) => {
                warn!(
                    endpoint = %self.endpoint,
                    timeout = ?self.call_timeout,
                    "Timed out connecting to device endpoint"
                );
                false
            }
        }
    }

    /// Must be called with the transition lock held.
    async fn close_session(&self) {
        if self.session.swap(0, Ordering::AcqRel) == 0 {
            return;
        }

        match tokio::time::timeout(self.call_timeout, self.client.disconnect()).await {
            Ok(Ok(())) => info!(endpoint = %self.endpoint, "Disconnected from device endpoint"),
            Ok(Err(e)) => warn!(endpoint = %self.endpoint, error = %e, "Disconnect reported an error"),
            Err(_) => warn!(endpoint = %self.endpoint, "Timed out disconnecting"),
        }
    }

    fn mark_lost(&self, session: u64, reason: &dyn std::fmt::Display) {
        match self
            .session
            .compare_exchange(session, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                warn!(endpoint = %self.endpoint, session, reason = %reason, "Connection to device endpoint lost")
            }
            Err(_) => debug!(session, reason = %reason, "Ignoring failure from a replaced session"),
        }
    }

    async fn guarded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ConnectionError> {
        let Some(session) = self.session_id() else {
            return Err(ConnectionError::NotConnected);
        };

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_connection_loss() {
                    self.mark_lost(session, &e);
                }
                Err(e.into())
            }
            Err(_) => {
                let err = ConnectionError::Timeout {
                    operation,
                    timeout: self.call_timeout,
                };
                self.mark_lost(session, &err);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("endpoint", &self.endpoint)
            .field("namespace", &self.namespace)
            .field("state", &self.state())
            .finish()
    }
}


/// Client whose next read of one field parks until released and then fails
/// the way a dropped session does.
#[cfg(test)]
pub(crate) mod gated {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::client::{ClientError, DeviceClient, NodeId, NodeInfo, Variant};
    use crate::simulator::SimulatedClient;

    pub struct GatedClient {
        pub inner: Arc<SimulatedClient>,
        field: String,
        armed: AtomicBool,
        pub entered: Notify,
        pub release: Notify,
    }

    impl GatedClient {
        pub fn new(inner: Arc<SimulatedClient>, field: &str) -> Self {
            Self {
                inner,
                field: format!("/{}", field),
                armed: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }

        pub fn arm(&self) {
            self.armed.store(true, Ordering::Release);
        }
    }

    #[async_trait]
    impl DeviceClient for GatedClient {
        async fn connect(&self, endpoint: &str) -> Result<(), ClientError> {
            self.inner.connect(endpoint).await
        }
        async fn disconnect(&self) -> Result<(), ClientError> {
            self.inner.disconnect().await
        }
        async fn browse_objects(&self) -> Result<Vec<NodeInfo>, ClientError> {
            self.inner.browse_objects().await
        }
        async fn read(&self, node: &NodeId) -> Result<Variant, ClientError> {
            if node.identifier.ends_with(&self.field) && self.armed.swap(false, Ordering::AcqRel) {
                self.entered.notify_one();
                self.release.notified().await;
                return Err(ClientError::ConnectionLost("session closed".to_string()));
            }
            self.inner.read(node).await
        }
        async fn write(&self, node: &NodeId, value: Variant) -> Result<(), ClientError> {
            self.inner.write(node, value).await
        }
        async fn call(&self, object: &NodeId, method: &NodeId) -> Result<(), ClientError> {
            self.inner.call(object, method).await
        }
    }
}
