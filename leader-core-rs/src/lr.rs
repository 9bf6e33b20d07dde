//! LR election: leadership by minimum `(time_joined, id)`.
//!
//! Each node keeps a logical clock counting the connector events it has
//! seen. The node with the smallest clock, ties broken by id, leads and
//! broadcasts a heartbeat every period through [`LrHelper`]. A follower that
//! hears nothing from its leader for a whole period declares the leader
//! failed and takes over until a better heartbeat arrives.

use crate::lr_helper::{LrHelper, LrMessage};
use crate::protocol::Multiplexer;
use crate::types::{ElectionStatus, NodeId, StatusCallback};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Default heartbeat period
pub const DEFAULT_PERIOD_MS: u64 = 3000;

/// LR election configuration
#[derive(Debug, Clone)]
pub struct LrConfig {
    pub period: Duration,
}

impl Default for LrConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(DEFAULT_PERIOD_MS),
        }
    }
}

impl LrConfig {
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }
}

#[derive(Debug, Clone)]
struct LrState {
    leader: NodeId,
    time_joined: u64,
    min_time_joined: u64,
    sequence: u64,
    contact: bool,
    settled: bool,
    down: bool,
}

struct LrShared {
    id: NodeId,
    state: Mutex<LrState>,
    on_status: RwLock<Option<StatusCallback>>,
}

impl LrShared {
    fn notify(&self, leader: NodeId) {
        let status = if leader == self.id {
            ElectionStatus::Leader
        } else {
            ElectionStatus::Follower
        };
        if let Some(ref callback) = *self.on_status.read() {
            callback(leader, status);
        }
    }

    fn received(&self, sender: NodeId, log_time: u64) {
        let adopted = {
            let mut state = self.state.lock();
            if state.down {
                return;
            }
            let adopted = (log_time, sender) < (state.min_time_joined, state.leader);
            if adopted {
                state.leader = sender;
                state.min_time_joined = log_time;
            }
            if sender == state.leader {
                state.contact = true;
            }
            adopted
        };
        if adopted {
            info!("LR: Node {} follows {} (time joined {})", self.id, sender, log_time);
            self.notify(sender);
        }
    }

    fn increase_time_joined(&self) {
        let mut state = self.state.lock();
        state.time_joined += 1;
        if state.leader == self.id {
            state.min_time_joined = state.time_joined;
        }
        debug!("LR: Node {} time joined now {}", self.id, state.time_joined);
    }

    fn tick(&self) -> Option<LrMessage> {
        let mut failed = false;
        let heartbeat = {
            let mut state = self.state.lock();
            if state.down {
                return None;
            }
            if state.leader == self.id {
                let heartbeat = LrMessage::Heartbeat {
                    sender: self.id,
                    log_time: state.time_joined,
                    seq: state.sequence,
                };
                state.sequence += 1;
                state.settled = true;
                Some(heartbeat)
            } else {
                if !state.contact {
                    warn!("LR: Node {} lost contact with leader {}", self.id, state.leader);
                    state.leader = self.id;
                    state.min_time_joined = state.time_joined;
                    failed = true;
                }
                state.settled = state.contact;
                state.contact = false;
                None
            }
        };
        if failed {
            self.notify(self.id);
        }
        heartbeat
    }
}

/// Periodic driver of the LR election
pub struct LrElect {
    shared: Arc<LrShared>,
    config: LrConfig,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl LrElect {
    /// Create the driver together with the helper protocol it feeds on.
    ///
    /// The helper must be registered with the multiplexer for heartbeats to flow.
    pub fn new(id: NodeId, config: LrConfig) -> (Self, LrHelper) {
        let shared = Arc::new(LrShared {
            id,
            state: Mutex::new(LrState {
                leader: id,
                time_joined: 0,
                min_time_joined: 0,
                sequence: 0,
                contact: false,
                settled: false,
                down: false,
            }),
            on_status: RwLock::new(None),
        });

        let on_heartbeat = shared.clone();
        let on_topology = shared.clone();
        let helper = LrHelper::new(
            id,
            move |sender, log_time| on_heartbeat.received(sender, log_time),
            move || on_topology.increase_time_joined(),
        );

        let elect = Self {
            shared,
            config,
            shutdown_tx: None,
            task: None,
        };
        (elect, helper)
    }

    /// Set callback for leader changes
    pub fn set_status_callback<F>(&self, callback: F)
    where
        F: Fn(NodeId, ElectionStatus) + Send + Sync + 'static,
    {
        *self.shared.on_status.write() = Some(Box::new(callback));
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    /// Current leader and whether it was confirmed during the last period
    pub fn leader(&self) -> (NodeId, bool) {
        let state = self.shared.state.lock();
        (state.leader, state.settled)
    }

    pub fn time_joined(&self) -> u64 {
        self.shared.state.lock().time_joined
    }

    pub fn is_down(&self) -> bool {
        self.shared.state.lock().down
    }

    /// Toggle simulated crash; a down node neither sends nor accepts heartbeats
    pub fn switch_down(&self) {
        let mut state = self.shared.state.lock();
        state.down = !state.down;
        if !state.down {
            state.leader = self.shared.id;
            state.min_time_joined = state.time_joined;
            state.contact = false;
            state.settled = false;
        }
        info!("LR: Node {} switched {}", self.shared.id, if state.down { "down" } else { "up" });
    }

    /// Run one period. Returns the heartbeat to broadcast when leading.
    pub fn tick(&self) -> Option<LrMessage> {
        self.shared.tick()
    }

    /// Spawn the periodic driver; a second call is a no-op
    pub fn start(&mut self, mux: Arc<dyn Multiplexer>) {
        if self.task.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let period = self.config.period;

        info!("LR: Node {} starting (period {:?})", shared.id, period);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(heartbeat) = shared.tick() {
                            broadcast(mux.as_ref(), &heartbeat);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("LR: Node {} driver stopped", shared.id);
        }));
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Stop the periodic driver and wait for it to finish
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("LR: Driver task failed: {}", e);
            }
        }
    }
}

/// Send a heartbeat on every connected, non-loopback interface
pub fn broadcast(mux: &dyn Multiplexer, heartbeat: &LrMessage) {
    let bytes = match heartbeat.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("LR: Failed to encode {:?}: {}", heartbeat, e);
            return;
        }
    };
    for interface in mux.interfaces() {
        if !interface.is_connected() || interface.is_loopback() {
            continue;
        }
        if let Err(e) = mux.send(interface.name(), bytes.clone()) {
            warn!("LR: Failed to send heartbeat on {}: {}", interface.name(), e);
        }
    }
}
