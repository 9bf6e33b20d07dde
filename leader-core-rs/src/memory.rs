//! In-process datagram network with fault injection.
//!
//! Nodes exchange datagrams over unbounded channels. Crashes and partitions
//! silently drop traffic the way a lossy link would.

use crate::transport::{PeerDirectory, Transport, TransportError};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, trace};

#[derive(Default)]
struct NetworkInner {
    nodes: BTreeMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    isolated: BTreeSet<NodeId>,
    /// Partition groups; empty when the network is whole
    groups: Vec<BTreeSet<NodeId>>,
}

impl NetworkInner {
    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return false;
        }
        if self.groups.is_empty() {
            return true;
        }
        self.groups
            .iter()
            .any(|group| group.contains(&from) && group.contains(&to))
    }
}

/// Shared hub of an in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, returning its transport and inbox
    pub fn register(&self, id: NodeId) -> (MemoryTransport, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().nodes.insert(id, tx);
        let transport = MemoryTransport {
            id,
            network: self.clone(),
        };
        (transport, rx)
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.inner.read().nodes.keys().copied().collect()
    }

    /// Cut a node off from everyone
    pub fn isolate(&self, id: NodeId) {
        info!("Network: Isolating {}", id);
        self.inner.write().isolated.insert(id);
    }

    pub fn restore(&self, id: NodeId) {
        info!("Network: Restoring {}", id);
        self.inner.write().isolated.remove(&id);
    }

    /// Split the network; nodes missing from every group are unreachable
    pub fn partition(&self, groups: Vec<Vec<NodeId>>) {
        info!("Network: Partitioning into {:?}", groups);
        self.inner.write().groups = groups
            .into_iter()
            .map(|group| group.into_iter().collect())
            .collect();
    }

    /// Remove partitions and isolation
    pub fn heal(&self) {
        info!("Network: Healed");
        let mut inner = self.inner.write();
        inner.groups.clear();
        inner.isolated.clear();
    }

    pub fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        self.inner.read().reachable(from, to)
    }
}

impl PeerDirectory for MemoryNetwork {
    fn peers(&self) -> Vec<NodeId> {
        self.nodes()
    }
}

/// A node's handle on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    id: NodeId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: NodeId, datagram: Vec<u8>) -> Result<(), TransportError> {
        let inner = self.network.inner.read();
        let tx = inner.nodes.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        if !inner.reachable(self.id, to) {
            trace!("Network: Dropping datagram {} -> {}", self.id, to);
            return Ok(());
        }
        tx.send(datagram).map_err(|_| TransportError::Closed)
    }
}

impl PeerDirectory for MemoryTransport {
    fn peers(&self) -> Vec<NodeId> {
        self.network.nodes()
    }
}
