//! Property tests for the wave/echo election
//!
//! Tests election invariants on random connected graphs:
//! - Safety: at most one node claims leadership
//! - Liveness: every node ends up following the lowest id
//! - Only the leader holds the leader address

use leader_core::sim::degree;
use leader_core::{EchoElection, ElectionStatus, FaultConfig, NodeId, SimNetwork};
use proptest::prelude::*;

const MAX_STEPS: usize = 200_000;

// ============================================================================
// Strategies
// ============================================================================

/// Random spanning tree plus a few extra edges over `n` nodes (indices)
fn graph_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..10usize).prop_flat_map(|n| {
        let tree = proptest::collection::vec(any::<prop::sample::Index>(), n - 1);
        let extra = proptest::collection::vec((0..n, 0..n), 0..4);
        (Just(n), tree, extra).prop_map(|(n, tree, extra)| {
            let mut edges: Vec<(usize, usize)> = tree
                .iter()
                .enumerate()
                .map(|(i, parent)| (parent.index(i + 1), i + 1))
                .collect();
            for (a, b) in extra {
                let (a, b) = (a.min(b), a.max(b));
                if a != b && !edges.iter().any(|&(x, y)| x.min(y) == a && x.max(y) == b) {
                    edges.push((a, b));
                }
            }
            (n, edges)
        })
    })
}

/// Distinct node ids for `n` nodes
fn ids_strategy(n: usize) -> impl Strategy<Value = Vec<u32>> {
    proptest::collection::btree_set(1u32..1000u32, n).prop_map(|set| set.into_iter().collect())
}

fn network(
    ids: &[u32],
    edges: &[(usize, usize)],
    seed: u64,
    faults: FaultConfig,
) -> SimNetwork {
    let edges: Vec<(NodeId, NodeId)> = edges
        .iter()
        .map(|&(a, b)| (NodeId(ids[a]), NodeId(ids[b])))
        .collect();
    let mut sim = SimNetwork::with_faults(seed, faults);
    for &id in ids {
        let id = NodeId(id);
        sim.add_node(id, EchoElection::new(id, degree(&edges, id)));
    }
    for &(a, b) in &edges {
        sim.link(a, b);
    }
    sim
}

// ============================================================================
// Election Property Tests
// ============================================================================

proptest! {
    /// CORE INVARIANT: exactly one leader, the lowest id, under reordering
    #[test]
    fn lowest_id_elected_under_reordering(
        (ids, edges) in graph_strategy()
            .prop_flat_map(|(n, edges)| (ids_strategy(n), Just(edges))),
        seed in any::<u64>()
    ) {
        let mut sim = network(&ids, &edges, seed, FaultConfig::shuffled());
        sim.start();
        sim.run(MAX_STEPS);
        prop_assert_eq!(sim.in_flight(), 0);

        let lowest = NodeId(ids.iter().copied().min().unwrap());
        prop_assert_eq!(sim.leaders(), vec![lowest]);
        for &id in &ids {
            prop_assert_eq!(sim.leader(NodeId(id)), Some(lowest));
        }
    }

    /// Duplicated packets never produce a second leader
    #[test]
    fn duplicates_do_not_break_safety(
        (ids, edges) in graph_strategy()
            .prop_flat_map(|(n, edges)| (ids_strategy(n), Just(edges))),
        seed in any::<u64>()
    ) {
        let mut sim = network(&ids, &edges, seed, FaultConfig::noisy());
        sim.start();
        sim.run(MAX_STEPS);

        let lowest = NodeId(ids.iter().copied().min().unwrap());
        prop_assert_eq!(sim.leaders(), vec![lowest]);
        for &id in &ids {
            let id = NodeId(id);
            if id == lowest {
                prop_assert_eq!(sim.addresses(id).len(), 1);
            } else {
                prop_assert_eq!(sim.status(id), ElectionStatus::Follower);
                prop_assert!(sim.addresses(id).is_empty());
            }
        }
    }

    /// A cut that keeps the graph connected re-elects the same leader
    #[test]
    fn cut_of_extra_edge_keeps_leader(
        (ids, edges) in graph_strategy()
            .prop_flat_map(|(n, edges)| (ids_strategy(n), Just(edges))),
        seed in any::<u64>()
    ) {
        let mut sim = network(&ids, &edges, seed, FaultConfig::shuffled());
        sim.start();
        sim.run(MAX_STEPS);

        // Edges past the spanning tree are redundant
        let tree_edges = ids.len() - 1;
        if let Some(&(a, b)) = edges.get(tree_edges) {
            sim.disconnect(NodeId(ids[a]), NodeId(ids[b]));
            sim.run(MAX_STEPS);
        }

        let lowest = NodeId(ids.iter().copied().min().unwrap());
        prop_assert_eq!(sim.leaders(), vec![lowest]);
        for &id in &ids {
            prop_assert_eq!(sim.leader(NodeId(id)), Some(lowest));
        }
    }
}
