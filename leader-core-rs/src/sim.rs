//! In-process interface multiplexer.
//!
//! Hosts one [`Protocol`] per node, wires named interfaces into point-to-point
//! links and delivers packets one at a time, enabling deterministic testing
//! of the multiplexer-driven elections. Dispatch follows the multiplexer
//! contract: `on_message`, then `after_message` on every managed interface,
//! then the pending config changes are applied and cleared.

use crate::protocol::Protocol;
use crate::types::{ConfigChange, ElectionStatus, Interface, LeaderAddress, NodeId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, trace, warn};

/// Delivery faults
///
/// Every link stays FIFO: reordering only interleaves packets of different
/// links, and a duplicate is delivered right after its original.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Interleave in-flight packets of different links randomly
    pub reorder: bool,
    /// Probability of delivering a packet twice (0.0-1.0)
    pub duplicate_rate: f64,
}

impl FaultConfig {
    /// In-order, exactly-once delivery
    pub fn none() -> Self {
        Self::default()
    }

    /// Random interleaving across links
    pub fn shuffled() -> Self {
        Self {
            reorder: true,
            ..Default::default()
        }
    }

    /// Random order with 10% duplicates
    pub fn noisy() -> Self {
        Self {
            reorder: true,
            duplicate_rate: 0.10,
        }
    }
}

/// Node of the simulated network
struct SimNode {
    protocol: Box<dyn Protocol>,
    interfaces: BTreeMap<String, Interface>,
    addresses: HashSet<(String, LeaderAddress)>,
}

#[derive(Debug, Clone)]
struct Endpoint {
    node: NodeId,
    interface: String,
}

#[derive(Debug, Clone)]
struct Link {
    a: Endpoint,
    b: Endpoint,
    connected: bool,
}

impl Link {
    fn peer_of(&self, node: NodeId, interface: &str) -> Option<&Endpoint> {
        if self.a.node == node && self.a.interface == interface {
            Some(&self.b)
        } else if self.b.node == node && self.b.interface == interface {
            Some(&self.a)
        } else {
            None
        }
    }

    fn joins(&self, a: NodeId, b: NodeId) -> bool {
        (self.a.node == a && self.b.node == b) || (self.a.node == b && self.b.node == a)
    }
}

#[derive(Debug, Clone)]
struct Packet {
    link: usize,
    to: NodeId,
    interface: String,
    bytes: Vec<u8>,
}

/// Simulated interface multiplexer
pub struct SimNetwork {
    nodes: BTreeMap<NodeId, SimNode>,
    links: Vec<Link>,
    queue: VecDeque<Packet>,
    faults: FaultConfig,
    rng: StdRng,
    started: bool,
    delivered: u64,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::with_faults(0, FaultConfig::none())
    }

    /// Network whose fault decisions are driven by `seed`
    pub fn with_faults(seed: u64, faults: FaultConfig) -> Self {
        Self {
            nodes: BTreeMap::new(),
            links: Vec::new(),
            queue: VecDeque::new(),
            faults,
            rng: StdRng::seed_from_u64(seed),
            started: false,
            delivered: 0,
        }
    }

    pub fn add_node<P: Protocol + 'static>(&mut self, id: NodeId, protocol: P) {
        self.nodes.insert(
            id,
            SimNode {
                protocol: Box::new(protocol),
                interfaces: BTreeMap::new(),
                addresses: HashSet::new(),
            },
        );
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Wire a new link between `a` and `b`, returning the interface names
    pub fn link(&mut self, a: NodeId, b: NodeId) -> Option<(String, String)> {
        let name_a = self.allocate_interface(a)?;
        let name_b = self.allocate_interface(b)?;
        self.links.push(Link {
            a: Endpoint {
                node: a,
                interface: name_a.clone(),
            },
            b: Endpoint {
                node: b,
                interface: name_b.clone(),
            },
            connected: true,
        });
        if self.started {
            self.register(a, &name_a);
            self.register(b, &name_b);
        }
        Some((name_a, name_b))
    }

    fn allocate_interface(&mut self, id: NodeId) -> Option<String> {
        let node = self.nodes.get_mut(&id)?;
        let name = format!("port{}", node.interfaces.len());
        node.interfaces
            .insert(name.clone(), Interface::new(name.clone(), true));
        Some(name)
    }

    fn register(&mut self, id: NodeId, name: &str) {
        let changed = match self.nodes.get_mut(&id) {
            Some(node) => match node.interfaces.get(name) {
                Some(interface) => node.protocol.add_interface(interface),
                None => false,
            },
            None => false,
        };
        if changed {
            self.flush(id);
        }
    }

    /// Register every interface with its protocol, starting the elections
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let registrations: Vec<(NodeId, String)> = self
            .nodes
            .iter()
            .flat_map(|(id, node)| node.interfaces.keys().map(move |name| (*id, name.clone())))
            .collect();
        for (id, name) in registrations {
            self.register(id, &name);
        }
    }

    pub fn disconnect(&mut self, a: NodeId, b: NodeId) -> bool {
        self.set_link(a, b, false)
    }

    pub fn connect(&mut self, a: NodeId, b: NodeId) -> bool {
        self.set_link(a, b, true)
    }

    fn set_link(&mut self, a: NodeId, b: NodeId, connected: bool) -> bool {
        let Some(index) = self
            .links
            .iter()
            .position(|link| link.joins(a, b) && link.connected != connected)
        else {
            return false;
        };
        self.links[index].connected = connected;
        if !connected {
            self.queue.retain(|packet| packet.link != index);
        }
        debug!(
            "Sim: Link {}-{} {}",
            a,
            b,
            if connected { "connected" } else { "disconnected" }
        );

        let endpoints = [self.links[index].a.clone(), self.links[index].b.clone()];
        for endpoint in endpoints {
            let changed = match self.nodes.get_mut(&endpoint.node) {
                Some(node) => match node.interfaces.get_mut(&endpoint.interface) {
                    Some(interface) => {
                        interface.set_connected(connected);
                        let interface = interface.clone();
                        node.protocol.on_interface_event(&interface, connected)
                    }
                    None => false,
                },
                None => false,
            };
            if changed {
                self.flush(endpoint.node);
            }
        }
        true
    }

    /// Collect this round's outbound packets and apply pending config changes
    fn flush(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };

        let mut outgoing = Vec::new();
        for interface in node.interfaces.values() {
            if !node.protocol.manages(interface.name()) {
                continue;
            }
            node.protocol.after_message(interface, &mut |bytes| {
                outgoing.push((interface.name().to_string(), bytes));
            });
        }

        if node.protocol.has_config_updates() {
            for change in node.protocol.config_updates() {
                match change {
                    ConfigChange::AddAddress { interface, address } => {
                        node.addresses.insert((interface, address));
                    }
                    ConfigChange::RemoveAddress { interface, address } => {
                        node.addresses.remove(&(interface, address));
                    }
                    ConfigChange::Respond { interface } => {
                        trace!("Sim: Node {} responding on {}", id, interface);
                    }
                }
            }
            node.protocol.clear_updates();
        }

        for (interface, bytes) in outgoing {
            self.enqueue(id, &interface, bytes);
        }
    }

    fn enqueue(&mut self, from: NodeId, interface: &str, bytes: Vec<u8>) {
        let route = self.links.iter().enumerate().find_map(|(index, link)| {
            link.peer_of(from, interface)
                .map(|peer| (index, link.connected, peer.clone()))
        });
        match route {
            Some((index, true, peer)) => self.queue.push_back(Packet {
                link: index,
                to: peer.node,
                interface: peer.interface,
                bytes,
            }),
            Some((_, false, _)) => trace!("Sim: Dropping packet on disconnected {}", interface),
            None => warn!("Sim: Node {} has no link on {}", from, interface),
        }
    }

    /// Send `bytes` from `node` on every connected interface
    pub fn broadcast_from(&mut self, node: NodeId, bytes: &[u8]) {
        let names: Vec<String> = match self.nodes.get(&node) {
            Some(sim_node) => sim_node
                .interfaces
                .values()
                .filter(|interface| interface.is_connected() && !interface.is_loopback())
                .map(|interface| interface.name().to_string())
                .collect(),
            None => return,
        };
        for name in names {
            self.enqueue(node, &name, bytes.to_vec());
        }
    }

    /// Deliver `bytes` to `node` as if received on `interface`
    pub fn inject(&mut self, node: NodeId, interface: &str, bytes: &[u8]) -> bool {
        let changed = match self.nodes.get_mut(&node) {
            Some(sim_node) => sim_node.protocol.on_message(interface, bytes),
            None => return false,
        };
        if changed {
            self.flush(node);
        }
        changed
    }

    /// Deliver one in-flight packet. Returns `false` when nothing is in flight.
    pub fn step(&mut self) -> bool {
        let packet = if self.faults.reorder && self.queue.len() > 1 {
            // Random link, oldest packet on it
            let picked = self.rng.gen_range(0..self.queue.len());
            let (link, to) = (self.queue[picked].link, self.queue[picked].to);
            let index = self
                .queue
                .iter()
                .position(|packet| packet.link == link && packet.to == to)
                .unwrap_or(picked);
            self.queue.remove(index)
        } else {
            self.queue.pop_front()
        };
        let Some(packet) = packet else {
            return false;
        };

        if self.faults.duplicate_rate > 0.0 && self.rng.gen_bool(self.faults.duplicate_rate) {
            self.queue.push_front(packet.clone());
        }

        self.delivered += 1;
        self.inject(packet.to, &packet.interface, &packet.bytes);
        true
    }

    /// Deliver packets until none are in flight or `max_steps` were taken
    pub fn run(&mut self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps && self.step() {
            steps += 1;
        }
        steps
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn protocol(&self, node: NodeId) -> Option<&dyn Protocol> {
        self.nodes.get(&node).map(|n| n.protocol.as_ref())
    }

    pub fn leader(&self, node: NodeId) -> Option<NodeId> {
        self.protocol(node).and_then(|p| p.leader())
    }

    pub fn status(&self, node: NodeId) -> ElectionStatus {
        self.protocol(node)
            .map_or(ElectionStatus::Undecided, |p| p.election_status())
    }

    /// Nodes currently reporting leadership
    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.protocol.election_status().is_leader())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Leader addresses currently assigned on `node`
    pub fn addresses(&self, node: NodeId) -> Vec<LeaderAddress> {
        self.nodes
            .get(&node)
            .map(|n| n.addresses.iter().map(|(_, address)| *address).collect())
            .unwrap_or_default()
    }

    pub fn interfaces(&self, node: NodeId) -> Vec<Interface> {
        self.nodes
            .get(&node)
            .map(|n| n.interfaces.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Standard test topologies over nodes `1..=n`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Line,
    Ring,
    Star,
}

impl Topology {
    pub fn edges(&self, n: u32) -> Vec<(NodeId, NodeId)> {
        let mut edges: Vec<(NodeId, NodeId)> =
            (1..n).map(|i| (NodeId(i), NodeId(i + 1))).collect();
        match self {
            Topology::Line => {}
            Topology::Ring if n > 2 => edges.push((NodeId(n), NodeId(1))),
            Topology::Ring => {}
            Topology::Star => {
                edges = (2..=n).map(|i| (NodeId(1), NodeId(i))).collect();
            }
        }
        edges
    }
}

/// Number of edges touching `node`
pub fn degree(edges: &[(NodeId, NodeId)], node: NodeId) -> usize {
    edges
        .iter()
        .filter(|(a, b)| *a == node || *b == node)
        .count()
}

impl std::str::FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "line" => Ok(Topology::Line),
            "ring" => Ok(Topology::Ring),
            "star" => Ok(Topology::Star),
            other => Err(format!("unknown topology: {}", other)),
        }
    }
}
