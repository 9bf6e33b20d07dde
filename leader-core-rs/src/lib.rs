//! Leader Core Library
//!
//! Distributed leader election for modular robots. Provides wave/echo and
//! token-traversal elections driven by an interface multiplexer, the LR
//! logical-clock election with its heartbeat broadcast helper, and the
//! crash-tolerant invitation election over a datagram transport.

pub mod types;
pub mod protocol;
pub mod echo;
pub mod traversal;
pub mod lr_helper;
pub mod lr;
pub mod transport;
pub mod memory;
pub mod invitation;
pub mod sim;

pub use types::*;
pub use protocol::{Multiplexer, Protocol};
pub use echo::EchoElection;
pub use traversal::{Round, TraversalElection};
pub use lr_helper::{LrHelper, LrMessage};
pub use lr::{LrConfig, LrElect};
pub use transport::{PeerDirectory, StaticPeers, Transport, TransportError, UdpTransport};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use invitation::{InvitationConfig, InvitationElection, InvitationStatus, Workload};
pub use sim::{FaultConfig, SimNetwork, Topology};
