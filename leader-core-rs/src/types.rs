//! Core types shared by every election protocol

use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;

/// Unique, totally ordered identifier of a module.
///
/// Doubles as network address and as election priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        NodeId(id)
    }
}

/// Name of the loopback interface; never carries protocol traffic
pub const LOOPBACK: &str = "lo";

/// A named, independently connectable endpoint of the multiplexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    name: String,
    connected: bool,
}

impl Interface {
    pub fn new(name: impl Into<String>, connected: bool) -> Self {
        Self {
            name: name.into(),
            connected,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_loopback(&self) -> bool {
        self.name == LOOPBACK
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
}

/// Address a leader assigns to itself on the loopback interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaderAddress {
    pub ip: Ipv6Addr,
    pub mask: u8,
}

impl Default for LeaderAddress {
    fn default() -> Self {
        Self {
            ip: Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            mask: 128,
        }
    }
}

/// Side effect a protocol hands back to its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    /// Assign a local address (the node became leader)
    AddAddress {
        interface: String,
        address: LeaderAddress,
    },
    /// Drop a local address (the node stepped down)
    RemoveAddress {
        interface: String,
        address: LeaderAddress,
    },
    /// Flush a pending reply on the interface now
    Respond { interface: String },
}

/// Externally observable election outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionStatus {
    /// No decision yet, or a restart is in progress
    Undecided,
    /// This node is the leader of its component
    Leader,
    /// Another node is the leader
    Follower,
    /// Re-elected leader of a component whose membership changed
    FollowersChanged,
}

impl Default for ElectionStatus {
    fn default() -> Self {
        ElectionStatus::Undecided
    }
}

impl ElectionStatus {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionStatus::Leader | ElectionStatus::FollowersChanged)
    }
}

impl std::fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionStatus::Undecided => write!(f, "undecided"),
            ElectionStatus::Leader => write!(f, "leader"),
            ElectionStatus::Follower => write!(f, "follower"),
            ElectionStatus::FollowersChanged => write!(f, "followers-changed"),
        }
    }
}

/// Callback invoked with `(leader, status)` on every status transition
pub type StatusCallback = Box<dyn Fn(NodeId, ElectionStatus) + Send + Sync>;
