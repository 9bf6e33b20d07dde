//! Best-effort datagram transport used by the invitation election

use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Default UDP port for election traffic
pub const DEFAULT_PORT: u16 = 7777;

/// Maximum datagram size
const MAX_MSG_SIZE: usize = 65536;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error("Unknown interface: {0}")]
    UnknownInterface(String),

    #[error("Channel closed")]
    Closed,
}

/// Sends datagrams to peers addressed by id.
///
/// Delivery is not guaranteed; a successful send only means the datagram left.
pub trait Transport: Send + Sync {
    fn send(&self, to: NodeId, datagram: Vec<u8>) -> Result<(), TransportError>;
}

/// Candidate peers for the invitation election
pub trait PeerDirectory: Send + Sync {
    fn peers(&self) -> Vec<NodeId>;
}

/// A fixed address list
#[derive(Debug, Clone, Default)]
pub struct StaticPeers(pub Vec<NodeId>);

impl PeerDirectory for StaticPeers {
    fn peers(&self) -> Vec<NodeId> {
        self.0.clone()
    }
}

/// UDP transport with a static `NodeId -> SocketAddr` table
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: RwLock<BTreeMap<NodeId, SocketAddr>>,
}

impl UdpTransport {
    /// Bind a socket on `addr`
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            peers: RwLock::new(BTreeMap::new()),
        })
    }

    /// Get the local address this transport is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn add_peer(&self, id: NodeId, addr: SocketAddr) {
        self.peers.write().insert(id, addr);
    }

    /// Start receiving datagrams in background.
    ///
    /// The task ends once the returned receiver is dropped.
    pub fn start_receive(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let socket = self.socket.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MSG_SIZE];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        trace!("Received {} bytes from {}", len, src);
                        if tx.send(buf[..len].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                    }
                }
            }
            debug!("UDP receive loop stopped");
        });

        rx
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: NodeId, datagram: Vec<u8>) -> Result<(), TransportError> {
        let addr = self
            .peers
            .read()
            .get(&to)
            .copied()
            .ok_or(TransportError::UnknownPeer(to))?;
        self.socket.try_send_to(&datagram, addr)?;
        Ok(())
    }
}

impl PeerDirectory for UdpTransport {
    fn peers(&self) -> Vec<NodeId> {
        self.peers.read().keys().copied().collect()
    }
}
