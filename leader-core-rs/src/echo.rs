//! Wave/echo leader election.
//!
//! Every node floods a wave carrying its own id. A node adopts any wave with
//! a lower id than its current one, remembers the arrival interface as its
//! spanning-tree parent and forwards the wave to every other interface. Once
//! the current wave came back on every connected interface the node echoes
//! it to its parent, or, if the wave is its own, declares itself leader and
//! floods a `LEADER` announcement.
//!
//! Each round runs in an explicit epoch. A topology change moves the node to
//! the next epoch and restarts the round; a message from a newer epoch pulls
//! the receiver into that epoch, messages from older epochs are dropped.

use crate::protocol::{Protocol, Relay, ELECTION_GROUP};
use crate::types::{
    ConfigChange, ElectionStatus, Interface, LeaderAddress, NodeId, StatusCallback, LOOPBACK,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use tracing::{debug, error, info, trace};

/// Wave/echo election messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EchoMessage {
    /// Candidate wave, also used as the echo towards the parent
    #[serde(rename = "WAVE")]
    Wave { epoch: u64, wave: NodeId },

    /// Announcement of the elected leader
    #[serde(rename = "LEADER")]
    Leader { epoch: u64, leader: NodeId },
}

impl EchoMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn epoch(&self) -> u64 {
        match self {
            EchoMessage::Wave { epoch, .. } => *epoch,
            EchoMessage::Leader { epoch, .. } => *epoch,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Link {
    connected: bool,
    /// Current wave was received on this link
    regular: bool,
}

/// Wave/echo election state machine
pub struct EchoElection {
    id: NodeId,
    expected_interfaces: usize,
    links: BTreeMap<String, Link>,
    started: bool,
    epoch: u64,
    current_wave: NodeId,
    parent: Option<String>,
    /// Leader announcement already handled in this epoch
    announced: bool,
    /// Node was leader when the current epoch began
    led_previous_epoch: bool,
    leader: Option<NodeId>,
    status: ElectionStatus,
    outbound: Option<(Relay, EchoMessage)>,
    updates: Vec<ConfigChange>,
    leader_address: LeaderAddress,
    on_status: Option<StatusCallback>,
}

impl EchoElection {
    /// Create an election that starts once `expected_interfaces` are registered
    pub fn new(id: NodeId, expected_interfaces: usize) -> Self {
        Self {
            id,
            expected_interfaces,
            links: BTreeMap::new(),
            started: false,
            epoch: 0,
            current_wave: id,
            parent: None,
            announced: false,
            led_previous_epoch: false,
            leader: None,
            status: ElectionStatus::Undecided,
            outbound: None,
            updates: Vec::new(),
            leader_address: LeaderAddress::default(),
            on_status: None,
        }
    }

    pub fn with_leader_address(mut self, address: LeaderAddress) -> Self {
        self.leader_address = address;
        self
    }

    /// Set callback for status changes
    pub fn set_status_callback<F>(&mut self, callback: F)
    where
        F: Fn(NodeId, ElectionStatus) + Send + Sync + 'static,
    {
        self.on_status = Some(Box::new(callback));
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn current_wave(&self) -> NodeId {
        self.current_wave
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn status(&self) -> ElectionStatus {
        self.status
    }

    fn connected_links(&self) -> impl Iterator<Item = (&String, &Link)> {
        self.links.iter().filter(|(_, link)| link.connected)
    }

    fn all_received(&self) -> bool {
        self.connected_links().all(|(_, link)| link.regular)
    }

    fn set_status(&mut self, leader: NodeId, status: ElectionStatus) {
        self.status = status;
        if let Some(ref callback) = self.on_status {
            callback(leader, status);
        }
    }

    /// Give up leadership before a new round
    fn relinquish(&mut self) {
        self.led_previous_epoch = self.status.is_leader();
        if self.led_previous_epoch {
            info!("Echo: Node {} relinquishing leadership (epoch {})", self.id, self.epoch);
            self.updates.push(ConfigChange::RemoveAddress {
                interface: LOOPBACK.to_string(),
                address: self.leader_address,
            });
        }
        if self.status != ElectionStatus::Undecided {
            self.set_status(self.id, ElectionStatus::Undecided);
        }
    }

    /// Move to `epoch`, clearing every per-round field
    fn enter_epoch(&mut self, epoch: u64) {
        self.relinquish();
        self.started = true;
        self.epoch = epoch;
        self.current_wave = self.id;
        self.parent = None;
        self.announced = false;
        self.leader = None;
        for link in self.links.values_mut() {
            link.regular = false;
        }
        debug!("Echo: Node {} entered epoch {}", self.id, epoch);
    }

    /// Enter `epoch` and flood the node's own wave
    fn restart(&mut self, epoch: u64) {
        self.enter_epoch(epoch);
        if self.connected_links().next().is_none() {
            self.become_leader();
        } else {
            self.outbound = Some((
                Relay::Flood,
                EchoMessage::Wave {
                    epoch,
                    wave: self.id,
                },
            ));
        }
    }

    fn become_leader(&mut self) {
        let status = if self.led_previous_epoch {
            ElectionStatus::FollowersChanged
        } else {
            ElectionStatus::Leader
        };
        info!("Echo: Node {} elected leader (epoch {})", self.id, self.epoch);
        self.leader = Some(self.id);
        self.announced = true;
        self.updates.push(ConfigChange::AddAddress {
            interface: LOOPBACK.to_string(),
            address: self.leader_address,
        });
        self.set_status(self.id, status);
        if self.connected_links().next().is_some() {
            self.outbound = Some((
                Relay::Flood,
                EchoMessage::Leader {
                    epoch: self.epoch,
                    leader: self.id,
                },
            ));
        }
    }

    fn handle_wave(&mut self, interface: &str, epoch: u64, wave: NodeId) -> bool {
        if epoch < self.epoch && self.started {
            trace!("Echo: Dropping stale wave {} (epoch {} < {})", wave, epoch, self.epoch);
            return false;
        }
        let mut changed = false;
        if epoch > self.epoch || !self.started {
            self.restart(epoch);
            changed = true;
        }

        if wave > self.current_wave {
            // Extinguished: the local wave outranks it
            return changed;
        }

        if wave < self.current_wave {
            debug!("Echo: Node {} adopting wave {} from {}", self.id, wave, interface);
            self.current_wave = wave;
            self.parent = Some(interface.to_string());
            for link in self.links.values_mut() {
                link.regular = false;
            }
            self.mark(interface);
            let message = EchoMessage::Wave { epoch, wave };
            let relay = if self.all_received() {
                Relay::Only(interface.to_string())
            } else {
                Relay::AllExcept(interface.to_string())
            };
            self.outbound = Some((relay, message));
            return true;
        }

        if self.links.get(interface).map_or(false, |link| link.regular) {
            trace!("Echo: Duplicate wave {} on {}", wave, interface);
            return changed;
        }
        self.mark(interface);
        if !self.all_received() {
            return true;
        }

        if wave == self.id {
            self.become_leader();
        } else if let Some(parent) = self.parent.clone() {
            debug!("Echo: Node {} echoing wave {} to {}", self.id, wave, parent);
            self.outbound = Some((Relay::Only(parent), EchoMessage::Wave { epoch, wave }));
        }
        true
    }

    fn handle_leader(&mut self, interface: &str, epoch: u64, leader: NodeId) -> bool {
        if epoch < self.epoch && self.started {
            trace!("Echo: Dropping stale leader {} (epoch {})", leader, epoch);
            return false;
        }
        if epoch > self.epoch || !self.started {
            self.enter_epoch(epoch);
        } else if self.announced {
            return false;
        }

        info!("Echo: Node {} recognised {} as leader (epoch {})", self.id, leader, epoch);
        self.announced = true;
        self.leader = Some(leader);
        self.led_previous_epoch = false;
        self.set_status(leader, ElectionStatus::Follower);
        self.outbound = Some((
            Relay::AllExcept(interface.to_string()),
            EchoMessage::Leader { epoch, leader },
        ));
        true
    }

    /// Queue a reply flush on `interface` unless the node just won
    fn respond(&mut self, interface: &str) {
        if self.outbound.is_some() && !self.status.is_leader() {
            self.updates.push(ConfigChange::Respond {
                interface: interface.to_string(),
            });
        }
    }

    fn mark(&mut self, interface: &str) {
        if let Some(link) = self.links.get_mut(interface) {
            link.regular = true;
        }
    }
}

impl Protocol for EchoElection {
    fn on_message(&mut self, interface: &str, packet: &[u8]) -> bool {
        self.outbound = None;
        if !self.links.get(interface).map_or(false, |link| link.connected) {
            return false;
        }
        let message = match EchoMessage::from_bytes(packet) {
            Ok(message) => message,
            Err(e) => {
                debug!("Echo: Malformed packet on {}: {}", interface, e);
                return false;
            }
        };
        let changed = match message {
            EchoMessage::Wave { epoch, wave } => self.handle_wave(interface, epoch, wave),
            EchoMessage::Leader { epoch, leader } => self.handle_leader(interface, epoch, leader),
        };
        if changed {
            self.respond(interface);
        }
        changed
    }

    fn after_message(&mut self, interface: &Interface, send: &mut dyn FnMut(Vec<u8>)) -> bool {
        if !interface.is_connected() || interface.is_loopback() {
            return false;
        }
        let Some((relay, message)) = &self.outbound else {
            return false;
        };
        if !relay.selects(interface.name()) || !self.manages(interface.name()) {
            return false;
        }
        match message.to_bytes() {
            Ok(bytes) => {
                send(bytes);
                false
            }
            Err(e) => {
                error!("Echo: Failed to encode {:?}: {}", message, e);
                false
            }
        }
    }

    fn on_interface_event(&mut self, interface: &Interface, connected: bool) -> bool {
        self.outbound = None;
        let Some(link) = self.links.get_mut(interface.name()) else {
            return false;
        };
        link.connected = connected;
        if !self.started {
            return false;
        }
        info!(
            "Echo: Node {} restarting, {} {}",
            self.id,
            interface.name(),
            if connected { "connected" } else { "disconnected" }
        );
        self.restart(self.epoch + 1);
        self.respond(interface.name());
        true
    }

    fn add_interface(&mut self, interface: &Interface) -> bool {
        self.outbound = None;
        if interface.is_loopback() || self.links.contains_key(interface.name()) {
            return false;
        }
        self.links.insert(
            interface.name().to_string(),
            Link {
                connected: interface.is_connected(),
                regular: false,
            },
        );
        if self.started {
            self.restart(self.epoch + 1);
        } else if self.links.len() >= self.expected_interfaces {
            self.restart(self.epoch);
        }
        true
    }

    fn remove_interface(&mut self, interface: &Interface) -> bool {
        self.outbound = None;
        if self.links.remove(interface.name()).is_none() {
            return false;
        }
        if self.started {
            self.restart(self.epoch + 1);
        }
        true
    }

    fn manages(&self, interface: &str) -> bool {
        self.links.contains_key(interface)
    }

    fn has_config_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    fn config_updates(&self) -> Vec<ConfigChange> {
        self.updates.clone()
    }

    fn clear_updates(&mut self) {
        self.updates.clear();
    }

    fn address(&self) -> Ipv6Addr {
        ELECTION_GROUP
    }

    fn name(&self) -> &'static str {
        "echo"
    }

    fn info(&self) -> String {
        format!(
            "echo id={} epoch={} wave={} leader={:?} status={}",
            self.id, self.epoch, self.current_wave, self.leader, self.status
        )
    }

    fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    fn election_status(&self) -> ElectionStatus {
        self.status
    }
}
