// Connection context
// One Connection describes one established (or not yet established) link.
// The handle is what the rest of the program holds; re-initialising swaps in
// a whole new Connection so holders of the old snapshot keep a consistent
// view.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::poison::{read, write};
use crate::rpc::RpcEngine;

#[derive(Debug, Clone)]
pub struct Connection {
    rpc: Option<RpcEngine>,
    using_fallback: bool,
    is_initiator: bool,
}

impl Connection {
    /// Fresh, unconnected state
    pub fn init(is_initiator: bool) -> Self {
        Self {
            rpc: None,
            using_fallback: false,
            is_initiator,
        }
    }

    pub fn connected(rpc: RpcEngine, using_fallback: bool, is_initiator: bool) -> Self {
        Self {
            rpc: Some(rpc),
            using_fallback,
            is_initiator,
        }
    }

    pub fn rpc(&self) -> Option<&RpcEngine> {
        self.rpc.as_ref()
    }

    /// Traffic is tunneled through the signaling server
    pub fn using_fallback(&self) -> bool {
        self.using_fallback
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Whether an engine is installed. Does not touch the network.
    pub fn check_connection(&self) -> bool {
        self.rpc.is_some()
    }

    /// Ping the remote side. False when no engine is installed, the ping
    /// fails, or no answer arrives within `timeout`.
    pub async fn verify(&self, timeout: Duration) -> bool {
        let Some(rpc) = &self.rpc else {
            return false;
        };
        match tokio::time::timeout(timeout, rpc.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Connection check failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Connection check timed out after {:?}", timeout);
                false
            }
        }
    }
}

/// Shared handle to the current [`Connection`]
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    current: Arc<RwLock<Arc<Connection>>>,
}

impl ConnectionHandle {
    pub fn new(is_initiator: bool) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(Connection::init(is_initiator)))),
        }
    }

    pub fn current(&self) -> Arc<Connection> {
        read(&self.current).clone()
    }

    /// Replace the current connection with a fresh, unconnected one
    pub fn reset(&self, is_initiator: bool) -> Arc<Connection> {
        self.replace(Connection::init(is_initiator))
    }

    /// Install a connected engine, keeping the current role
    pub fn install(&self, rpc: RpcEngine, using_fallback: bool) -> Arc<Connection> {
        let is_initiator = self.current().is_initiator();
        info!(
            "Installing {} connection",
            if using_fallback { "relayed" } else { "direct" }
        );
        self.replace(Connection::connected(rpc, using_fallback, is_initiator))
    }

    fn replace(&self, connection: Connection) -> Arc<Connection> {
        let connection = Arc::new(connection);
        *write(&self.current) = connection.clone();
        connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{handler, method_not_found, RpcRequest};
    use crate::testing::MemoryTransport;
    use serde_json::json;

    #[test]
    fn test_init_is_unconnected() {
        let handle = ConnectionHandle::new(true);
        let current = handle.current();
        assert!(current.is_initiator());
        assert!(!current.using_fallback());
        assert!(!current.check_connection());
        assert!(current.rpc().is_none());
    }

    #[tokio::test]
    async fn test_reset_replaces_whole_object() {
        let handle = ConnectionHandle::new(false);
        let engine = RpcEngine::new(Arc::new(MemoryTransport::new()), method_not_found());
        let installed = handle.install(engine, true);
        assert!(installed.check_connection());
        assert!(installed.using_fallback());
        assert!(!installed.is_initiator());

        let old = handle.current();
        let fresh = handle.reset(true);
        assert!(!fresh.check_connection());
        assert!(fresh.is_initiator());
        assert!(Arc::ptr_eq(&fresh, &handle.current()));

        // The earlier snapshot is untouched
        assert!(old.check_connection());
        assert!(old.using_fallback());
    }

    #[tokio::test]
    async fn test_verify_pings_remote() {
        let (left, right) = MemoryTransport::pair();
        let local = RpcEngine::new(left, method_not_found());
        let _remote = RpcEngine::new(
            right,
            handler(|_: RpcRequest| async move { Ok(json!("pong")) }),
        );

        let connection = Connection::connected(local, false, true);
        assert!(connection.verify(Duration::from_secs(1)).await);
        assert!(!Connection::init(true).verify(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_verify_times_out_without_answer() {
        let engine = RpcEngine::new(Arc::new(MemoryTransport::new()), method_not_found());
        let connection = Connection::connected(engine, false, true);
        assert!(!connection.verify(Duration::from_millis(20)).await);
    }
}
