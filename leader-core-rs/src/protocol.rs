//! Contract between the interface multiplexer and an election protocol.
//!
//! The multiplexer drives a protocol sequentially:
//! - an inbound packet goes to [`Protocol::on_message`]
//! - if that produced an effect, every managed interface is offered to
//!   [`Protocol::after_message`] so the protocol can emit this round's packet
//! - connector changes go to [`Protocol::on_interface_event`]
//! - pending [`ConfigChange`]s are drained with [`Protocol::clear_updates`]
//!
//! Malformed or stale packets never surface as errors: the protocol returns
//! `false` and leaves its state untouched.

use crate::types::{ConfigChange, ElectionStatus, Interface, NodeId};
use std::net::Ipv6Addr;

/// Multicast group shared by the wave and traversal elections
pub const ELECTION_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0xea, 0xea);

/// Multicast group of the LR heartbeat broadcast
pub const LR_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0xee, 0xda);

/// A multiplexer-driven election protocol
pub trait Protocol: Send {
    /// Decode and process a packet received on `interface`.
    ///
    /// Returns whether the packet produced an outbound message or config change.
    fn on_message(&mut self, interface: &str, packet: &[u8]) -> bool;

    /// Offer `interface` for this round's outbound packet.
    ///
    /// `send` is called at most once.
    fn after_message(&mut self, interface: &Interface, send: &mut dyn FnMut(Vec<u8>)) -> bool;

    /// Topology change on a managed interface
    fn on_interface_event(&mut self, interface: &Interface, connected: bool) -> bool;

    /// Start managing an interface; `false` if it is already managed
    fn add_interface(&mut self, interface: &Interface) -> bool;

    /// Stop managing an interface; `false` if it was not managed
    fn remove_interface(&mut self, interface: &Interface) -> bool;

    fn manages(&self, interface: &str) -> bool;

    fn has_config_updates(&self) -> bool;

    fn config_updates(&self) -> Vec<ConfigChange>;

    fn clear_updates(&mut self);

    /// Group address the protocol is registered under
    fn address(&self) -> Ipv6Addr;

    fn name(&self) -> &'static str;

    fn info(&self) -> String {
        self.name().to_string()
    }

    /// Leader this node currently recognises, if any
    fn leader(&self) -> Option<NodeId> {
        None
    }

    fn election_status(&self) -> ElectionStatus {
        ElectionStatus::Undecided
    }
}

impl<P: Protocol + ?Sized> Protocol for Box<P> {
    fn on_message(&mut self, interface: &str, packet: &[u8]) -> bool {
        (**self).on_message(interface, packet)
    }

    fn after_message(&mut self, interface: &Interface, send: &mut dyn FnMut(Vec<u8>)) -> bool {
        (**self).after_message(interface, send)
    }

    fn on_interface_event(&mut self, interface: &Interface, connected: bool) -> bool {
        (**self).on_interface_event(interface, connected)
    }

    fn add_interface(&mut self, interface: &Interface) -> bool {
        (**self).add_interface(interface)
    }

    fn remove_interface(&mut self, interface: &Interface) -> bool {
        (**self).remove_interface(interface)
    }

    fn manages(&self, interface: &str) -> bool {
        (**self).manages(interface)
    }

    fn has_config_updates(&self) -> bool {
        (**self).has_config_updates()
    }

    fn config_updates(&self) -> Vec<ConfigChange> {
        (**self).config_updates()
    }

    fn clear_updates(&mut self) {
        (**self).clear_updates()
    }

    fn address(&self) -> Ipv6Addr {
        (**self).address()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn info(&self) -> String {
        (**self).info()
    }

    fn leader(&self) -> Option<NodeId> {
        (**self).leader()
    }

    fn election_status(&self) -> ElectionStatus {
        (**self).election_status()
    }
}

/// Outbound side of the interface multiplexer, used by periodic drivers
pub trait Multiplexer: Send + Sync {
    /// Snapshot of the interfaces and their connection state
    fn interfaces(&self) -> Vec<Interface>;

    /// Send a packet on a named interface
    fn send(&self, interface: &str, packet: Vec<u8>) -> Result<(), crate::transport::TransportError>;
}

/// Relay rule selecting which interfaces receive the pending message
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Relay {
    /// Every connected interface
    Flood,
    /// Every connected interface except the named one
    AllExcept(String),
    /// Only the named interface
    Only(String),
}

impl Relay {
    pub(crate) fn selects(&self, interface: &str) -> bool {
        match self {
            Relay::Flood => true,
            Relay::AllExcept(skip) => skip != interface,
            Relay::Only(target) => target == interface,
        }
    }
}
