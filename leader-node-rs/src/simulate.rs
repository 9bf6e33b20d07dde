//! Topology simulation of the multiplexer-driven elections

use clap::ValueEnum;
use leader_core::sim::degree;
use leader_core::{
    EchoElection, ElectionStatus, FaultConfig, LrConfig, LrElect, NodeId, SimNetwork, Topology,
    TraversalElection,
};
use serde::Serialize;
use tracing::{debug, info};

/// Upper bound on packet deliveries per run
const MAX_STEPS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Algorithm {
    Echo,
    Traversal,
    Lr,
}

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub algorithm: Algorithm,
    pub topology: Topology,
    pub nodes: u32,
    pub seed: u64,
    pub shuffle: bool,
    /// Heartbeat periods to run for LR
    pub rounds: usize,
}

/// Final view of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub leader: Option<NodeId>,
    pub status: String,
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub delivered: u64,
    pub nodes: Vec<NodeReport>,
}

impl SimulationReport {
    /// Leader every node agrees on, if any
    pub fn agreed_leader(&self) -> Option<NodeId> {
        let first = self.nodes.first()?.leader?;
        self.nodes
            .iter()
            .all(|node| node.leader == Some(first))
            .then_some(first)
    }
}

pub fn run(config: &SimulationConfig) -> SimulationReport {
    let edges = config.topology.edges(config.nodes);
    let faults = if config.shuffle {
        FaultConfig::shuffled()
    } else {
        FaultConfig::none()
    };
    let mut sim = SimNetwork::with_faults(config.seed, faults);
    info!(
        "Simulating {:?} on {:?} of {} nodes (seed {})",
        config.algorithm, config.topology, config.nodes, config.seed
    );

    match config.algorithm {
        Algorithm::Echo | Algorithm::Traversal => {
            for id in (1..=config.nodes).map(NodeId) {
                let expected = degree(&edges, id);
                let on_status = move |leader: NodeId, status: ElectionStatus| {
                    debug!("Node {} -> {} (leader {})", id, status, leader);
                };
                if config.algorithm == Algorithm::Echo {
                    let mut election = EchoElection::new(id, expected);
                    election.set_status_callback(on_status);
                    sim.add_node(id, election);
                } else {
                    let mut election = TraversalElection::new(id, expected);
                    election.set_status_callback(on_status);
                    sim.add_node(id, election);
                }
            }
            for (a, b) in &edges {
                sim.link(*a, *b);
            }
            sim.start();
            sim.run(MAX_STEPS);

            let nodes = sim
                .node_ids()
                .into_iter()
                .map(|id| NodeReport {
                    id,
                    leader: sim.leader(id),
                    status: sim.status(id).to_string(),
                })
                .collect();
            SimulationReport {
                delivered: sim.delivered(),
                nodes,
            }
        }
        Algorithm::Lr => {
            let mut elects = Vec::new();
            for id in (1..=config.nodes).map(NodeId) {
                let (elect, helper) = LrElect::new(id, LrConfig::default());
                sim.add_node(id, helper);
                elects.push(elect);
            }
            for (a, b) in &edges {
                sim.link(*a, *b);
            }
            sim.start();

            for round in 0..config.rounds {
                for elect in &elects {
                    let Some(heartbeat) = elect.tick() else {
                        continue;
                    };
                    match heartbeat.to_bytes() {
                        Ok(bytes) => sim.broadcast_from(elect.id(), &bytes),
                        Err(e) => tracing::error!("Failed to encode heartbeat: {}", e),
                    }
                }
                let steps = sim.run(MAX_STEPS);
                debug!("Round {}: {} deliveries", round, steps);
            }

            let nodes = elects
                .iter()
                .map(|elect| {
                    let (leader, settled) = elect.leader();
                    let role = if leader == elect.id() {
                        "leader"
                    } else {
                        "follower"
                    };
                    NodeReport {
                        id: elect.id(),
                        leader: Some(leader),
                        status: if settled {
                            role.to_string()
                        } else {
                            format!("{} (unconfirmed)", role)
                        },
                    }
                })
                .collect();
            SimulationReport {
                delivered: sim.delivered(),
                nodes,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(algorithm: Algorithm, topology: Topology) -> SimulationConfig {
        SimulationConfig {
            algorithm,
            topology,
            nodes: 5,
            seed: 1,
            shuffle: false,
            rounds: 3,
        }
    }

    #[test]
    fn test_every_algorithm_agrees_on_node_one() {
        for algorithm in [Algorithm::Echo, Algorithm::Traversal, Algorithm::Lr] {
            let report = run(&config(algorithm, Topology::Ring));
            assert_eq!(report.nodes.len(), 5);
            assert_eq!(report.agreed_leader(), Some(NodeId(1)), "{:?}", algorithm);
            assert!(report.delivered > 0);
        }
    }

    #[test]
    fn test_shuffled_echo_star() {
        let mut config = config(Algorithm::Echo, Topology::Star);
        config.shuffle = true;
        let report = run(&config);
        assert_eq!(report.agreed_leader(), Some(NodeId(1)));
        assert_eq!(report.nodes[0].status, "leader");
    }
}
