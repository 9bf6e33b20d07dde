//! End-to-end election scenarios on the simulated multiplexer

use leader_core::sim::degree;
use leader_core::{
    ElectionStatus, EchoElection, LrConfig, LrElect, NodeId, SimNetwork, Topology,
    TraversalElection,
};

const MAX_STEPS: usize = 100_000;

fn echo_network(edges: &[(NodeId, NodeId)]) -> SimNetwork {
    let mut sim = SimNetwork::new();
    let mut ids: Vec<NodeId> = edges.iter().flat_map(|(a, b)| [*a, *b]).collect();
    ids.sort();
    ids.dedup();
    for id in ids {
        sim.add_node(id, EchoElection::new(id, degree(edges, id)));
    }
    for (a, b) in edges {
        sim.link(*a, *b);
    }
    sim
}

fn traversal_network(edges: &[(NodeId, NodeId)]) -> SimNetwork {
    let mut sim = SimNetwork::new();
    let mut ids: Vec<NodeId> = edges.iter().flat_map(|(a, b)| [*a, *b]).collect();
    ids.sort();
    ids.dedup();
    for id in ids {
        sim.add_node(id, TraversalElection::new(id, degree(edges, id)));
    }
    for (a, b) in edges {
        sim.link(*a, *b);
    }
    sim
}

/// Every node agrees on a single leader; returns it
fn agreed_leader(sim: &SimNetwork) -> NodeId {
    let leaders = sim.leaders();
    assert_eq!(leaders.len(), 1, "expected one leader, got {:?}", leaders);
    let leader = leaders[0];
    for id in sim.node_ids() {
        assert_eq!(sim.leader(id), Some(leader), "node {} disagrees", id);
        if id != leader {
            assert_eq!(sim.status(id), ElectionStatus::Follower);
            assert!(sim.addresses(id).is_empty());
        }
    }
    assert_eq!(sim.addresses(leader).len(), 1);
    leader
}

fn edge(a: u32, b: u32) -> (NodeId, NodeId) {
    (NodeId(a), NodeId(b))
}

// ============================================================================
// Wave/echo
// ============================================================================

#[test]
fn test_echo_line_elects_minimum() {
    let mut sim = echo_network(&[edge(1, 2), edge(2, 3)]);
    sim.start();
    sim.run(MAX_STEPS);

    assert_eq!(agreed_leader(&sim), NodeId(1));
    assert_eq!(sim.status(NodeId(1)), ElectionStatus::Leader);
}

#[test]
fn test_echo_standard_topologies() {
    for topology in [Topology::Line, Topology::Ring, Topology::Star] {
        let mut sim = echo_network(&topology.edges(6));
        sim.start();
        sim.run(MAX_STEPS);
        assert_eq!(agreed_leader(&sim), NodeId(1), "{:?}", topology);
    }
}

#[test]
fn test_echo_minimum_in_the_middle() {
    let mut sim = echo_network(&[edge(5, 1), edge(1, 7), edge(7, 3), edge(5, 9)]);
    sim.start();
    sim.run(MAX_STEPS);
    assert_eq!(agreed_leader(&sim), NodeId(1));
}

#[test]
fn test_echo_split_and_rejoin() {
    let mut sim = echo_network(&[edge(1, 2), edge(2, 3)]);
    sim.start();
    sim.run(MAX_STEPS);
    agreed_leader(&sim);

    sim.disconnect(NodeId(2), NodeId(3));
    sim.run(MAX_STEPS);
    assert_eq!(sim.leaders(), vec![NodeId(1), NodeId(3)]);
    assert_eq!(sim.leader(NodeId(2)), Some(NodeId(1)));
    assert_eq!(sim.addresses(NodeId(3)).len(), 1);

    sim.connect(NodeId(2), NodeId(3));
    sim.run(MAX_STEPS);
    assert_eq!(agreed_leader(&sim), NodeId(1));
    assert_eq!(sim.status(NodeId(1)), ElectionStatus::FollowersChanged);
}

#[test]
fn test_echo_ring_survives_single_cut() {
    let mut sim = echo_network(&Topology::Ring.edges(5));
    sim.start();
    sim.run(MAX_STEPS);

    sim.disconnect(NodeId(1), NodeId(2));
    sim.run(MAX_STEPS);
    assert_eq!(agreed_leader(&sim), NodeId(1));
}

// ============================================================================
// Token traversal
// ============================================================================

#[test]
fn test_traversal_two_nodes_lower_id_wins() {
    let mut sim = traversal_network(&[edge(1, 2)]);
    sim.start();
    sim.run(MAX_STEPS);
    assert_eq!(agreed_leader(&sim), NodeId(1));
}

#[test]
fn test_traversal_single_candidate_topologies() {
    // Node 1 is the only local minimum in each of these
    for topology in [Topology::Line, Topology::Ring, Topology::Star] {
        let mut sim = traversal_network(&topology.edges(5));
        sim.start();
        sim.run(MAX_STEPS);
        assert_eq!(agreed_leader(&sim), NodeId(1), "{:?}", topology);
    }
}

#[test]
fn test_traversal_competing_candidates_merge() {
    // 1 and 2 are both local minima and race through 3
    let mut sim = traversal_network(&[edge(1, 3), edge(3, 2)]);
    sim.start();
    sim.run(MAX_STEPS);

    let leader = agreed_leader(&sim);
    assert!(leader == NodeId(2) || leader == NodeId(3));
}

#[test]
fn test_traversal_disconnect_and_reconnect() {
    let mut sim = traversal_network(&[edge(1, 2)]);
    sim.start();
    sim.run(MAX_STEPS);

    sim.disconnect(NodeId(1), NodeId(2));
    sim.run(MAX_STEPS);
    assert_eq!(sim.leaders(), vec![NodeId(1), NodeId(2)]);

    sim.connect(NodeId(1), NodeId(2));
    sim.run(MAX_STEPS);
    agreed_leader(&sim);
}

#[test]
fn test_traversal_link_flap_mid_election() {
    // Cut a ring link at every point of the first election
    for cut_after in 0..30 {
        let mut sim = traversal_network(&Topology::Ring.edges(5));
        sim.start();
        sim.run(cut_after);

        sim.disconnect(NodeId(2), NodeId(3));
        sim.run(cut_after / 2);
        sim.connect(NodeId(2), NodeId(3));
        sim.run(MAX_STEPS);

        assert_eq!(sim.in_flight(), 0, "cut after {} steps", cut_after);
        agreed_leader(&sim);
    }
}

#[test]
fn test_traversal_partition_heals_to_one_leader() {
    let mut sim = traversal_network(&Topology::Line.edges(6));
    sim.start();
    sim.run(4);

    sim.disconnect(NodeId(3), NodeId(4));
    sim.run(MAX_STEPS);
    assert_eq!(sim.leaders().len(), 2);

    sim.connect(NodeId(3), NodeId(4));
    sim.run(MAX_STEPS);
    agreed_leader(&sim);
}

// ============================================================================
// LR
// ============================================================================

struct LrCluster {
    sim: SimNetwork,
    elects: Vec<LrElect>,
}

impl LrCluster {
    fn new(edges: &[(NodeId, NodeId)]) -> Self {
        let mut sim = SimNetwork::new();
        let mut ids: Vec<NodeId> = edges.iter().flat_map(|(a, b)| [*a, *b]).collect();
        ids.sort();
        ids.dedup();
        let mut elects = Vec::new();
        for id in ids {
            let (elect, helper) = LrElect::new(id, LrConfig::default());
            sim.add_node(id, helper);
            elects.push(elect);
        }
        for (a, b) in edges {
            sim.link(*a, *b);
        }
        sim.start();
        Self { sim, elects }
    }

    /// One heartbeat period on every node
    fn round(&mut self) {
        for elect in &self.elects {
            if let Some(heartbeat) = elect.tick() {
                self.sim
                    .broadcast_from(elect.id(), &heartbeat.to_bytes().unwrap());
            }
        }
        self.sim.run(MAX_STEPS);
    }

    fn rounds(&mut self, n: usize) {
        for _ in 0..n {
            self.round();
        }
    }

    fn elect(&self, id: u32) -> &LrElect {
        self.elects.iter().find(|e| e.id() == NodeId(id)).unwrap()
    }

    fn assert_settled_on(&self, ids: &[u32], leader: u32) {
        for id in ids {
            assert_eq!(
                self.elect(*id).leader(),
                (NodeId(leader), true),
                "node {}",
                id
            );
        }
    }
}

fn two_rings() -> Vec<(NodeId, NodeId)> {
    vec![
        edge(1, 2),
        edge(2, 3),
        edge(3, 1),
        edge(4, 5),
        edge(5, 6),
        edge(6, 4),
        edge(3, 4),
    ]
}

#[test]
fn test_lr_converges_on_lowest_id() {
    let mut cluster = LrCluster::new(&Topology::Ring.edges(4));
    cluster.rounds(3);
    cluster.assert_settled_on(&[1, 2, 3, 4], 1);
}

#[test]
fn test_lr_partition_and_merge() {
    let mut cluster = LrCluster::new(&two_rings());
    cluster.sim.disconnect(NodeId(3), NodeId(4));
    assert_eq!(cluster.elect(3).time_joined(), 1);
    assert_eq!(cluster.elect(4).time_joined(), 1);

    cluster.rounds(3);
    cluster.assert_settled_on(&[1, 2, 3], 1);
    // 4 saw the cut, so 5 has the oldest view in its ring
    cluster.assert_settled_on(&[4, 5, 6], 5);

    cluster.sim.connect(NodeId(3), NodeId(4));
    cluster.rounds(3);
    cluster.assert_settled_on(&[1, 2, 3, 4, 5, 6], 1);
}

#[test]
fn test_lr_leader_failure_takeover() {
    let mut cluster = LrCluster::new(&Topology::Ring.edges(3));
    cluster.rounds(3);
    cluster.assert_settled_on(&[1, 2, 3], 1);

    cluster.elect(1).switch_down();
    cluster.rounds(5);
    cluster.assert_settled_on(&[2, 3], 2);

    cluster.elect(1).switch_down();
    cluster.rounds(3);
    cluster.assert_settled_on(&[1, 2, 3], 1);
}
