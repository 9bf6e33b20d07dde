//! Leader Node
//!
//! Command-line front end for the leader election library:
//! - `invitation` - run the crash-tolerant invitation election over UDP
//! - `simulate` - run a multiplexer-driven election on a simulated topology

mod config;
mod simulate;
mod workload;

use clap::{Parser, Subcommand};
use config::NodeConfig;
use leader_core::{InvitationElection, Topology, UdpTransport};
use rand::Rng;
use simulate::{Algorithm, SimulationConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use workload::DemoWorkload;

#[derive(Parser)]
#[command(name = "leader-node")]
#[command(about = "Distributed leader election node and topology simulator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the invitation election over UDP
    Invitation {
        /// Path to the node configuration JSON
        #[arg(short, long)]
        config: PathBuf,

        /// Chance in percent, per period, of toggling a simulated crash
        #[arg(long, default_value = "0")]
        crash_chance: u32,
    },

    /// Simulate an election on a generated topology
    Simulate {
        /// Election algorithm
        #[arg(short, long, value_enum, default_value = "echo")]
        algorithm: Algorithm,

        /// Topology (line, ring, star)
        #[arg(short, long, default_value = "ring")]
        topology: Topology,

        /// Number of nodes
        #[arg(short, long, default_value = "5")]
        nodes: u32,

        /// Seed for the delivery order
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Deliver packets in random order
        #[arg(long)]
        shuffle: bool,

        /// Heartbeat periods to run (LR only)
        #[arg(long, default_value = "5")]
        rounds: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Invitation {
            config,
            crash_chance,
        } => run_invitation(config, crash_chance).await?,

        Commands::Simulate {
            algorithm,
            topology,
            nodes,
            seed,
            shuffle,
            rounds,
            json,
        } => {
            if nodes == 0 {
                return Err("at least one node is required".into());
            }
            let report = simulate::run(&SimulationConfig {
                algorithm,
                topology,
                nodes,
                seed,
                shuffle,
                rounds,
            });

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n{:>6}  {:>6}  status", "node", "leader");
                for node in &report.nodes {
                    let leader = node
                        .leader
                        .map_or_else(|| "-".to_string(), |l| l.to_string());
                    println!("{:>6}  {:>6}  {}", node.id, leader, node.status);
                }
                println!("\nDelivered {} packets", report.delivered);
                match report.agreed_leader() {
                    Some(leader) => println!("All nodes agree on leader {}", leader),
                    None => println!("Nodes disagree on the leader"),
                }
            }
        }
    }

    Ok(())
}

async fn run_invitation(
    path: PathBuf,
    crash_chance: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::load(&path)?;
    info!("Leader node {} starting on {}", config.id, config.listen);

    let transport = Arc::new(UdpTransport::bind(config.listen).await?);
    for peer in &config.peers {
        transport.add_peer(peer.id, peer.addr);
    }
    let inbox = transport.start_receive();

    let workload = Arc::new(DemoWorkload::new(config.id));
    let election = InvitationElection::new(
        config.election_config(),
        transport.clone(),
        transport.clone(),
        inbox,
        workload.clone(),
    );
    let id = config.id;
    election.set_status_callback(move |leader, status| {
        info!("Node {} is {} (coordinator {})", id, status, leader);
    });
    election.start();

    let mut ticker = interval(config.election_config().period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if crash_chance > 0 && rand::thread_rng().gen_range(0..100) < crash_chance {
                    warn!("Node {} toggling simulated crash", id);
                    election.switch_down();
                }

                let (leader, settled) = election.leader();
                if settled && workload.is_working() {
                    let task = workload.task().unwrap_or_default();
                    info!("Node {} working under leader {} on {}", id, leader, task);
                } else {
                    info!("Node {} waiting ({:?}, leader {})", id, election.status(), leader);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    election.shutdown().await;
    Ok(())
}
