//! Token-traversal leader election (Korach–Kutten–Moran construction).
//!
//! Candidates launch phase-tagged annexing tokens that traverse the network
//! depth-first. A token that completes its traversal unopposed elects the node
//! where it terminates. When two tokens of the same phase meet, one waits and
//! the other chases it; a chaser catching a waiting token merges both into a
//! single token of the next phase owned by the meeting node.
//!
//! Bootstrap: once every expected interface is registered a node announces
//! its id with `INITIATE`. Nodes whose id is lower than every neighbour's
//! start phase 0 with their own token.
//!
//! Every token carries a [`Round`]: the restart epoch, then the phase. A
//! topology change moves the node to the epoch after the highest one it has
//! seen and launches a fresh token there, which outranks every token of the
//! interrupted election. Tokens of a round a node has already decided are
//! dropped.
//!
//! Chasing relies on each link delivering in order; tokens on different links
//! may interleave arbitrarily.

use crate::protocol::{Protocol, Relay, ELECTION_GROUP};
use crate::types::{
    ConfigChange, ElectionStatus, Interface, LeaderAddress, NodeId, StatusCallback, LOOPBACK,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use tracing::{debug, error, info, trace};

/// Position of a token: restart epoch first, then phase within the epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Round {
    pub epoch: u32,
    pub phase: u32,
}

impl Round {
    pub fn new(epoch: u32, phase: u32) -> Self {
        Self { epoch, phase }
    }

    /// Round of the token formed by merging two tokens of this round
    pub fn next_phase(self) -> Self {
        Self {
            epoch: self.epoch,
            phase: self.phase + 1,
        }
    }

    /// First round of the following epoch
    pub fn next_epoch(self) -> Self {
        Self {
            epoch: self.epoch + 1,
            phase: 0,
        }
    }
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.epoch, self.phase)
    }
}

/// Traversal election tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TraversalMessage {
    /// Neighbour discovery before the first phase
    #[serde(rename = "INITIATE")]
    Initiate { id: NodeId },

    /// Token claiming the nodes it passes
    #[serde(rename = "ANNEXING")]
    Annexing { round: Round, id: NodeId, hops: u32 },

    /// Pursuit of a token of the same round
    #[serde(rename = "CHASING")]
    Chasing { round: Round, id: NodeId, hops: u32 },

    /// Announcement of the elected leader
    #[serde(rename = "LEADER")]
    Leader { round: Round, id: NodeId },
}

impl TraversalMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, Default)]
struct Link {
    connected: bool,
    /// Local token was sent on this link in the current round
    sent: bool,
    /// Neighbour id learned from `INITIATE`
    neighbor: Option<NodeId>,
}

/// Where the local token goes next
#[derive(Debug, Clone, PartialEq, Eq)]
enum Next {
    Link(String),
    Terminate,
}

/// Token-traversal election state machine
pub struct TraversalElection {
    id: NodeId,
    expected_interfaces: usize,
    links: BTreeMap<String, Link>,
    bootstrapped: bool,
    /// Highest round joined; `None` until the node is annexed or launches
    round: Option<Round>,
    token_id: NodeId,
    chased: Option<Round>,
    max_hops: u32,
    waiting: Option<NodeId>,
    parent: Option<String>,
    last_forward: Option<String>,
    /// Last topology event handled since the previous decision
    last_event: Option<(String, bool)>,
    leader: Option<NodeId>,
    status: ElectionStatus,
    outbound: Option<(Relay, TraversalMessage)>,
    updates: Vec<ConfigChange>,
    leader_address: LeaderAddress,
    on_status: Option<StatusCallback>,
}

impl TraversalElection {
    /// Create an election that bootstraps once `expected_interfaces` are registered
    pub fn new(id: NodeId, expected_interfaces: usize) -> Self {
        Self {
            id,
            expected_interfaces,
            links: BTreeMap::new(),
            bootstrapped: false,
            round: None,
            token_id: id,
            chased: None,
            max_hops: 0,
            waiting: None,
            parent: None,
            last_forward: None,
            last_event: None,
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

    pub fn round(&self) -> Option<Round> {
        self.round
    }

    pub fn token_id(&self) -> NodeId {
        self.token_id
    }

    pub fn waiting(&self) -> Option<NodeId> {
        self.waiting
    }

    pub fn status(&self) -> ElectionStatus {
        self.status
    }

    fn is_connected(&self, interface: &str) -> bool {
        self.links.get(interface).map_or(false, |link| link.connected)
    }

    /// A leader was recognised in the current round
    fn decided(&self) -> bool {
        self.leader.is_some()
    }

    fn set_status(&mut self, leader: NodeId, status: ElectionStatus) {
        self.status = status;
        if let Some(ref callback) = self.on_status {
            callback(leader, status);
        }
    }

    /// Queue a reply flush on `interface` unless the node just won
    fn respond(&mut self, interface: &str) {
        if self.outbound.is_some() && !self.status.is_leader() {
            self.updates.push(ConfigChange::Respond {
                interface: interface.to_string(),
            });
        }
    }

    fn next(&self) -> Next {
        let unsent = self.links.iter().find(|(name, link)| {
            link.connected && !link.sent && self.parent.as_deref() != Some(name.as_str())
        });
        if let Some((name, _)) = unsent {
            return Next::Link(name.clone());
        }
        match &self.parent {
            Some(parent) if self.links.get(parent).map_or(false, |l| l.connected && !l.sent) => {
                Next::Link(parent.clone())
            }
            _ => Next::Terminate,
        }
    }

    fn reset_sent(&mut self) {
        for link in self.links.values_mut() {
            link.sent = false;
        }
    }

    /// Drop any previous decision before taking part in a new traversal
    fn undecide(&mut self) {
        if self.status.is_leader() {
            info!("Traversal: Node {} relinquishing leadership", self.id);
            self.updates.push(ConfigChange::RemoveAddress {
                interface: LOOPBACK.to_string(),
                address: self.leader_address,
            });
        }
        self.leader = None;
        if self.status != ElectionStatus::Undecided {
            self.set_status(self.id, ElectionStatus::Undecided);
        }
    }

    /// Forward the local token to `next`, or win if the traversal is complete
    fn advance(&mut self) -> bool {
        match self.next() {
            Next::Terminate => self.become_leader(),
            Next::Link(name) => {
                if let Some(link) = self.links.get_mut(&name) {
                    link.sent = true;
                }
                self.max_hops += 1;
                self.last_forward = Some(name.clone());
                let round = self.round.unwrap_or_default();
                trace!(
                    "Traversal: Node {} forwarding token {} (round {}) to {}",
                    self.id,
                    self.token_id,
                    round,
                    name
                );
                self.outbound = Some((
                    Relay::Only(name),
                    TraversalMessage::Annexing {
                        round,
                        id: self.token_id,
                        hops: self.max_hops,
                    },
                ));
            }
        }
        true
    }

    /// Launch a fresh own token in `round`
    fn launch(&mut self, round: Round) -> bool {
        debug!("Traversal: Node {} launching token in round {}", self.id, round);
        self.round = Some(round);
        self.token_id = self.id;
        self.max_hops = 0;
        self.waiting = None;
        self.parent = None;
        self.last_forward = None;
        self.reset_sent();
        self.advance()
    }

    fn become_leader(&mut self) {
        let round = self.round.unwrap_or_default();
        info!("Traversal: Node {} elected leader (round {})", self.id, round);
        self.updates.push(ConfigChange::AddAddress {
            interface: LOOPBACK.to_string(),
            address: self.leader_address,
        });
        self.settle(round, self.id);
        self.set_status(self.id, ElectionStatus::Leader);
        self.outbound = Some((
            Relay::Flood,
            TraversalMessage::Leader { round, id: self.id },
        ));
    }

    fn settle(&mut self, round: Round, leader: NodeId) {
        self.round = Some(round);
        self.leader = Some(leader);
        self.chased = None;
        self.waiting = None;
        self.parent = None;
        self.last_forward = None;
        self.max_hops = 0;
        self.last_event = None;
        self.reset_sent();
    }

    fn handle_initiate(&mut self, interface: &str, id: NodeId) -> bool {
        let Some(link) = self.links.get_mut(interface) else {
            return false;
        };
        if link.neighbor == Some(id) {
            return false;
        }
        link.neighbor = Some(id);
        self.try_bootstrap()
    }

    /// Start round 0.0 if every neighbour has reported and this node is a local minimum
    fn try_bootstrap(&mut self) -> bool {
        if !self.bootstrapped || self.round.is_some() || self.status != ElectionStatus::Undecided {
            return false;
        }
        let mut neighbors = self.links.values().filter(|link| link.connected);
        let local_minimum = neighbors.all(|link| link.neighbor.map_or(false, |n| n > self.id));
        let reported = self
            .links
            .values()
            .filter(|link| link.connected)
            .all(|link| link.neighbor.is_some());
        if reported && local_minimum {
            return self.launch(Round::default());
        }
        false
    }

    fn handle_annexing(&mut self, interface: &str, round: Round, id: NodeId, hops: u32) -> bool {
        let current = self.round;
        if current.map_or(false, |cr| round < cr) {
            trace!("Traversal: Dropping stale annexing token {} (round {})", id, round);
            return false;
        }

        if current.map_or(true, |cr| round > cr) {
            debug!(
                "Traversal: Node {} annexed by token {} (round {}) from {}",
                self.id, id, round, interface
            );
            self.undecide();
            self.round = Some(round);
            self.token_id = id;
            self.max_hops = hops;
            self.waiting = None;
            self.parent = Some(interface.to_string());
            self.last_forward = None;
            self.reset_sent();
            return self.advance();
        }

        if self.decided() {
            trace!("Traversal: Dropping token {} of decided round {}", id, round);
            return false;
        }

        if id == self.token_id && hops <= self.max_hops {
            trace!("Traversal: Duplicate token {} on {}", id, interface);
            return false;
        }

        if self.waiting.is_some() {
            return self.merge(round);
        }

        let chased = self.chased == Some(round);
        if id == self.token_id && !chased {
            self.max_hops = hops;
            return self.advance();
        }

        if chased || self.token_id > id {
            debug!("Traversal: Node {} parking token {} (round {})", self.id, id, round);
            self.waiting = Some(id);
            return false;
        }

        self.chased = Some(round);
        self.chase(round)
    }

    fn handle_chasing(&mut self, interface: &str, round: Round, id: NodeId, hops: u32) -> bool {
        if self.round != Some(round) || self.decided() {
            trace!("Traversal: Dropping chasing token {} (round {}) on {}", id, round, interface);
            return false;
        }

        if id == self.token_id
            && self.max_hops > hops
            && self.chased != Some(round)
            && self.waiting.is_none()
        {
            self.chased = Some(round);
            return self.chase(round);
        }

        if self.waiting.is_some() {
            return self.merge(round);
        }

        debug!("Traversal: Node {} parking chaser of {} (round {})", self.id, id, round);
        self.waiting = Some(id);
        false
    }

    /// Pursue the local token along the link it left through
    fn chase(&mut self, round: Round) -> bool {
        let Some(target) = self.last_forward.clone().filter(|name| self.is_connected(name)) else {
            self.waiting = Some(self.token_id);
            return false;
        };
        debug!(
            "Traversal: Node {} chasing token {} (round {}) via {}",
            self.id, self.token_id, round, target
        );
        self.outbound = Some((
            Relay::Only(target),
            TraversalMessage::Chasing {
                round,
                id: self.token_id,
                hops: self.max_hops,
            },
        ));
        true
    }

    /// Two tokens of `round` met here: continue with an own token one phase higher
    fn merge(&mut self, round: Round) -> bool {
        debug!("Traversal: Node {} merging tokens of round {}", self.id, round);
        self.launch(round.next_phase())
    }

    fn handle_leader(&mut self, interface: &str, round: Round, id: NodeId) -> bool {
        if self.round.map_or(false, |cr| round < cr) {
            trace!("Traversal: Dropping stale leader {} (round {})", id, round);
            return false;
        }
        if self.round == Some(round) && self.decided() {
            return false;
        }
        if id == self.id {
            return false;
        }

        self.undecide();
        info!("Traversal: Node {} recognised {} as leader (round {})", self.id, id, round);
        self.settle(round, id);
        self.set_status(id, ElectionStatus::Follower);
        self.outbound = Some((
            Relay::AllExcept(interface.to_string()),
            TraversalMessage::Leader { round, id },
        ));
        true
    }

    fn bootstrap(&mut self) -> bool {
        self.bootstrapped = true;
        if self.links.values().all(|link| !link.connected) {
            self.round = Some(Round::default());
            self.become_leader();
            return true;
        }
        self.outbound = Some((Relay::Flood, TraversalMessage::Initiate { id: self.id }));
        // Neighbours that registered first may already have reported
        self.try_bootstrap();
        true
    }

    /// Launch an own token in the epoch after every round seen so far
    fn restart(&mut self) -> bool {
        self.undecide();
        self.chased = None;
        let round = self.round.unwrap_or_default().next_epoch();
        self.launch(round)
    }
}

impl Protocol for TraversalElection {
    fn on_message(&mut self, interface: &str, packet: &[u8]) -> bool {
        self.outbound = None;
        if !self.is_connected(interface) {
            return false;
        }
        let message = match TraversalMessage::from_bytes(packet) {
            Ok(message) => message,
            Err(e) => {
                debug!("Traversal: Malformed packet on {}: {}", interface, e);
                return false;
            }
        };
        let changed = match message {
            TraversalMessage::Initiate { id } => self.handle_initiate(interface, id),
            TraversalMessage::Annexing { round, id, hops } => {
                self.handle_annexing(interface, round, id, hops)
            }
            TraversalMessage::Chasing { round, id, hops } => {
                self.handle_chasing(interface, round, id, hops)
            }
            TraversalMessage::Leader { round, id } => self.handle_leader(interface, round, id),
        };
        if changed {
            self.respond(interface);
        }
        changed
    }

    fn after_message(&mut self, interface: &Interface, send: &mut dyn FnMut(Vec<u8>)) -> bool {
        if !interface.is_connected() || !self.is_connected(interface.name()) {
            return false;
        }
        let Some((relay, message)) = &self.outbound else {
            return false;
        };
        if !relay.selects(interface.name()) {
            return false;
        }
        match message.to_bytes() {
            Ok(bytes) => send(bytes),
            Err(e) => error!("Traversal: Failed to encode {:?}: {}", message, e),
        }
        false
    }

    fn on_interface_event(&mut self, interface: &Interface, connected: bool) -> bool {
        self.outbound = None;
        let event = (interface.name().to_string(), connected);
        if self.last_event.as_ref() == Some(&event) {
            trace!("Traversal: Ignoring repeated event on {}", interface.name());
            return false;
        }
        let Some(link) = self.links.get_mut(interface.name()) else {
            return false;
        };
        link.connected = connected;
        link.sent = false;
        if !connected {
            link.neighbor = None;
        }
        if !self.bootstrapped {
            return false;
        }
        self.last_event = Some(event);
        info!(
            "Traversal: Node {} restarting, {} {}",
            self.id,
            interface.name(),
            if connected { "connected" } else { "disconnected" }
        );
        let changed = self.restart();
        self.respond(interface.name());
        changed
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
                ..Link::default()
            },
        );
        if !self.bootstrapped && self.links.len() >= self.expected_interfaces {
            self.bootstrap();
        }
        true
    }

    fn remove_interface(&mut self, interface: &Interface) -> bool {
        self.outbound = None;
        if self.links.remove(interface.name()).is_none() {
            return false;
        }
        if self.parent.as_deref() == Some(interface.name()) {
            self.parent = None;
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
        "traversal"
    }

    fn info(&self) -> String {
        format!(
            "traversal id={} round={:?} token={} leader={:?} status={}",
            self.id, self.round, self.token_id, self.leader, self.status
        )
    }

    fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    fn election_status(&self) -> ElectionStatus {
        self.status
    }
}
