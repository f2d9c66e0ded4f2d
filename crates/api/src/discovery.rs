//! Seam traits for the collaborators the node runtime consumes but does
//! not implement: peer discovery and NAT port mapping.

use crate::{BoxFut, NodeId, WeftResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Address discovery for peers configured with the literal address
/// `dynamic`.
pub trait Discovery: 'static + Send + Sync + std::fmt::Debug {
    /// Resolve dial addresses for a peer.
    fn lookup(&self, node: NodeId) -> BoxFut<'_, Vec<String>>;

    /// Start answering and sending local multicast announcements.
    fn start_local(&self);

    /// Start announcing to the global announce server.
    fn start_global(&self, server: String, external_port: u16);
}

/// Trait object [Discovery].
pub type DynDiscovery = Arc<dyn Discovery>;

/// A NAT gateway a port mapping can be installed on.
pub trait Gateway: 'static + Send + Sync + std::fmt::Debug {
    /// Map `external` on the gateway to `internal` on this host, TCP,
    /// with an unlimited lease.
    fn add_port_mapping(
        &self,
        external: u16,
        internal: u16,
        description: String,
    ) -> BoxFut<'_, WeftResult<()>>;
}

/// Trait object [Gateway].
pub type DynGateway = Arc<dyn Gateway>;

/// NAT gateway discovery.
pub trait PortMapper: 'static + Send + Sync + std::fmt::Debug {
    /// Find the internet gateway device, if any.
    fn discover(&self) -> BoxFut<'_, WeftResult<DynGateway>>;
}

/// Trait object [PortMapper].
pub type DynPortMapper = Arc<dyn PortMapper>;

/// A [Discovery] that never resolves anything. The default when no
/// discovery collaborator is wired in.
#[derive(Debug, Default)]
pub struct NullDiscovery;

impl NullDiscovery {
    /// Construct a new NullDiscovery.
    pub fn create() -> DynDiscovery {
        Arc::new(Self)
    }
}

impl Discovery for NullDiscovery {
    fn lookup(&self, _node: NodeId) -> BoxFut<'_, Vec<String>> {
        Box::pin(async { Vec::new() })
    }

    fn start_local(&self) {}

    fn start_global(&self, _server: String, _external_port: u16) {}
}

/// A [Discovery] answering from a fixed table. Useful for tests and for
/// clusters with out-of-band address distribution.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    table: std::sync::Mutex<HashMap<NodeId, Vec<String>>>,
}

impl StaticDiscovery {
    /// Construct a new StaticDiscovery.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the addresses for a peer.
    pub fn publish(&self, node: NodeId, addresses: Vec<String>) {
        self.table.lock().unwrap().insert(node, addresses);
    }
}

impl Discovery for StaticDiscovery {
    fn lookup(&self, node: NodeId) -> BoxFut<'_, Vec<String>> {
        let out = self
            .table
            .lock()
            .unwrap()
            .get(&node)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { out })
    }

    fn start_local(&self) {}

    fn start_global(&self, _server: String, _external_port: u16) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn static_discovery_lookup() {
        let disc = StaticDiscovery::create();
        disc.publish("AAAA".into(), vec!["192.0.2.1:22000".into()]);

        assert_eq!(
            vec!["192.0.2.1:22000".to_string()],
            disc.lookup("AAAA".into()).await
        );
        assert!(disc.lookup("BBBB".into()).await.is_empty());
    }
}
