//! Crash-tolerant invitation election.
//!
//! Nodes form groups, each led by a coordinator and versioned by a
//! [`GroupNumber`]. Coordinators periodically probe every known peer; the
//! highest-addressed coordinator that finds rivals invites them and their
//! members into a new group and hands out work once they accept. Followers
//! check on their coordinator and fall back to a singleton group of their
//! own (recovery) when it stops answering.
//!
//! The election runs two tasks over a [`Transport`]: one handles inbound
//! datagrams, the other drives the periodic checks. Both share one lock that
//! is never held across I/O or `.await`. Request/response exchanges use a
//! single pending-reply slot, so at most one request is outstanding.

use crate::transport::{PeerDirectory, Transport};
use crate::types::{ElectionStatus, NodeId, StatusCallback};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

/// Default reply timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default period between checks
pub const DEFAULT_PERIOD_MS: u64 = 3000;

/// Reply timeouts a merging coordinator waits for `ACCEPT`s
pub const DEFAULT_MERGE_WAIT: u32 = 3;

/// Lifecycle of a node in the invitation election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationStatus {
    NotStarted,
    /// Simulated crash; all traffic is ignored
    Down,
    /// Joining or forming a group
    Election,
    /// Waiting for the coordinator to hand out work
    Reorganization,
    Normal,
}

impl Default for InvitationStatus {
    fn default() -> Self {
        InvitationStatus::NotStarted
    }
}

/// Version stamp of a group
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct GroupNumber {
    pub coordinator: NodeId,
    pub sequence: u64,
}

impl std::fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.coordinator, self.sequence)
    }
}

/// Invitation election messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InvitationMessage {
    /// Follower asking whether its coordinator still leads `group`
    #[serde(rename = "ARE_YOU_THERE")]
    AreYouThere { group: GroupNumber },

    #[serde(rename = "ARE_YOU_THERE_RES")]
    AreYouThereRes { answer: bool },

    /// Coordinator probing for rival coordinators
    #[serde(rename = "ARE_YOU_COORDINATOR")]
    AreYouCoordinator { group: GroupNumber },

    #[serde(rename = "ARE_YOU_COORDINATOR_RES")]
    AreYouCoordinatorRes { answer: bool },

    /// Invitation into a new group
    #[serde(rename = "INVITATION")]
    Invitation {
        group: GroupNumber,
        coordinator: NodeId,
    },

    /// Work assignment for a member of the new group
    #[serde(rename = "READY")]
    Ready { group: GroupNumber, task: Value },

    #[serde(rename = "READY_RES")]
    ReadyRes,

    /// Member accepting an invitation
    #[serde(rename = "ACCEPT")]
    Accept { group: GroupNumber },

    #[serde(rename = "ACCEPT_RES")]
    AcceptRes { group: GroupNumber },
}

/// Datagram payload: a message and its sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: InvitationMessage,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Work distributed by coordinators
pub trait Workload: Send + Sync {
    /// Task for `member` of `group`, whose members are `members`
    fn calculate_task(&self, member: NodeId, group: GroupNumber, members: &[NodeId]) -> Value;

    fn receive_task(&self, task: Value);

    fn stop_work(&self);
}

/// Workload that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct Idle;

impl Workload for Idle {
    fn calculate_task(&self, _member: NodeId, _group: GroupNumber, _members: &[NodeId]) -> Value {
        Value::Null
    }

    fn receive_task(&self, _task: Value) {}

    fn stop_work(&self) {}
}

/// Invitation election configuration
#[derive(Debug, Clone)]
pub struct InvitationConfig {
    pub id: NodeId,
    /// How long to wait for a single reply
    pub timeout: Duration,
    /// Pause between periodic checks
    pub period: Duration,
    /// Multiple of `timeout` a merging coordinator collects `ACCEPT`s for
    pub merge_wait: u32,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            id: NodeId::default(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            period: Duration::from_millis(DEFAULT_PERIOD_MS),
            merge_wait: DEFAULT_MERGE_WAIT,
        }
    }
}

impl InvitationConfig {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_merge_wait(mut self, merge_wait: u32) -> Self {
        self.merge_wait = merge_wait;
        self
    }
}

/// Reply a pending request waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    AreYouThere,
    AreYouCoordinator,
    Ready,
}

struct Pending {
    from: NodeId,
    kind: ReplyKind,
    tx: oneshot::Sender<bool>,
}

struct State {
    status: InvitationStatus,
    group: GroupNumber,
    counter: u64,
    coordinator: NodeId,
    up: BTreeSet<NodeId>,
    found: BTreeSet<NodeId>,
    pending: Option<Pending>,
    /// Coordinator probed us since the last check
    contacted: bool,
}

struct Inner {
    config: InvitationConfig,
    transport: Arc<dyn Transport>,
    peers: Arc<dyn PeerDirectory>,
    workload: Arc<dyn Workload>,
    state: Mutex<State>,
    on_status: RwLock<Option<StatusCallback>>,
}

impl Inner {
    fn id(&self) -> NodeId {
        self.config.id
    }

    fn notify(&self, coordinator: NodeId) {
        let status = if coordinator == self.id() {
            ElectionStatus::Leader
        } else {
            ElectionStatus::Follower
        };
        if let Some(ref callback) = *self.on_status.read() {
            callback(coordinator, status);
        }
    }

    fn send(&self, to: NodeId, message: InvitationMessage) -> bool {
        let envelope = Envelope {
            from: self.id(),
            message,
        };
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Invitation: Failed to encode {:?}: {}", envelope, e);
                return false;
            }
        };
        trace!("Invitation: {} -> {}: {:?}", self.id(), to, envelope.message);
        match self.transport.send(to, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("Invitation: Failed to send to {}: {}", to, e);
                false
            }
        }
    }

    /// Send `message` and wait up to the timeout for the matching reply
    async fn request(&self, to: NodeId, message: InvitationMessage, kind: ReplyKind) -> Option<bool> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().pending = Some(Pending { from: to, kind, tx });

        if !self.send(to, message) {
            self.state.lock().pending = None;
            return None;
        }

        match timeout(self.config.timeout, rx).await {
            Ok(Ok(answer)) => Some(answer),
            _ => {
                debug!("Invitation: No {:?} reply from {}", kind, to);
                self.state.lock().pending = None;
                None
            }
        }
    }

    fn resolve(&self, from: NodeId, kind: ReplyKind, answer: bool) {
        let mut state = self.state.lock();
        let matches = state
            .pending
            .as_ref()
            .map_or(false, |pending| pending.from == from && pending.kind == kind);
        if !matches {
            trace!("Invitation: Unexpected {:?} reply from {}", kind, from);
            return;
        }
        if let Some(pending) = state.pending.take() {
            let _ = pending.tx.send(answer);
        }
    }

    /// Become the coordinator of a fresh singleton group
    fn recovery(&self) {
        let id = self.id();
        let group = {
            let mut state = self.state.lock();
            state.status = InvitationStatus::Election;
            state.counter += 1;
            state.group = GroupNumber {
                coordinator: id,
                sequence: state.counter,
            };
            state.coordinator = id;
            state.up = BTreeSet::from([id]);
            state.found.clear();
            state.contacted = false;
            state.status = InvitationStatus::Reorganization;
            state.group
        };
        info!("Invitation: Node {} recovering into group {}", id, group);

        self.workload.stop_work();
        let task = self.workload.calculate_task(id, group, &[id]);
        self.workload.receive_task(task);

        let settled = {
            let mut state = self.state.lock();
            let settled = state.group == group && state.status == InvitationStatus::Reorganization;
            if settled {
                state.status = InvitationStatus::Normal;
            }
            settled
        };
        if settled {
            self.notify(id);
        }
    }

    /// Node is still in `group` with `status`
    fn holds(&self, group: GroupNumber, status: InvitationStatus) -> bool {
        let state = self.state.lock();
        state.group == group && state.status == status
    }

    fn handle_datagram(&self, bytes: &[u8]) {
        let Envelope { from, message } = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Invitation: Malformed datagram: {}", e);
                return;
            }
        };

        {
            let state = self.state.lock();
            if matches!(
                state.status,
                InvitationStatus::Down | InvitationStatus::NotStarted
            ) {
                trace!("Invitation: Node {} ignoring {:?} while {:?}", self.id(), message, state.status);
                return;
            }
        }

        match message {
            InvitationMessage::AreYouThere { group } => self.on_are_you_there(from, group),
            InvitationMessage::AreYouThereRes { answer } => {
                self.resolve(from, ReplyKind::AreYouThere, answer)
            }
            InvitationMessage::AreYouCoordinator { group } => self.on_are_you_coordinator(from, group),
            InvitationMessage::AreYouCoordinatorRes { answer } => {
                self.resolve(from, ReplyKind::AreYouCoordinator, answer)
            }
            InvitationMessage::Invitation { group, coordinator } => {
                self.on_invitation(group, coordinator)
            }
            InvitationMessage::Ready { group, task } => self.on_ready(from, group, task),
            InvitationMessage::ReadyRes => self.resolve(from, ReplyKind::Ready, true),
            InvitationMessage::Accept { group } => self.on_accept(from, group),
            InvitationMessage::AcceptRes { group } => self.on_accept_res(from, group),
        }
    }

    fn on_are_you_there(&self, from: NodeId, group: GroupNumber) {
        let answer = {
            let state = self.state.lock();
            group == state.group && state.coordinator == self.id() && state.up.contains(&from)
        };
        self.send(from, InvitationMessage::AreYouThereRes { answer });
    }

    fn on_are_you_coordinator(&self, from: NodeId, group: GroupNumber) {
        let answer = {
            let mut state = self.state.lock();
            if from == state.coordinator && group == state.group {
                state.contacted = true;
            }
            state.status == InvitationStatus::Normal && state.coordinator == self.id()
        };
        self.send(from, InvitationMessage::AreYouCoordinatorRes { answer });
    }

    fn on_invitation(&self, group: GroupNumber, coordinator: NodeId) {
        let id = self.id();
        let former_members = {
            let mut state = self.state.lock();
            if state.status != InvitationStatus::Normal || coordinator == id {
                return;
            }
            let current = state.group;
            if group.coordinator == current.coordinator && group.sequence <= current.sequence {
                debug!(
                    "Invitation: Node {} ignoring stale invitation {} (in {})",
                    id, group, current
                );
                return;
            }
            state.status = InvitationStatus::Election;
            let was_coordinator = state.coordinator == id;
            let former = std::mem::take(&mut state.up);
            state.coordinator = coordinator;
            state.group = group;
            state.contacted = false;
            if was_coordinator {
                former.into_iter().filter(|member| *member != id).collect()
            } else {
                Vec::new()
            }
        };
        info!("Invitation: Node {} invited into group {} by {}", id, group, coordinator);

        self.workload.stop_work();
        for member in former_members {
            self.send(member, InvitationMessage::Invitation { group, coordinator });
        }
        if !self.send(coordinator, InvitationMessage::Accept { group }) {
            self.recovery();
        }
    }

    fn on_accept(&self, from: NodeId, group: GroupNumber) {
        let accepted = {
            let mut state = self.state.lock();
            let accepted = state.status == InvitationStatus::Election
                && group == state.group
                && state.coordinator == self.id();
            if accepted {
                state.up.insert(from);
            }
            accepted
        };
        if accepted {
            debug!("Invitation: Node {} accepted into group {}", from, group);
            self.send(from, InvitationMessage::AcceptRes { group });
        }
    }

    fn on_accept_res(&self, from: NodeId, group: GroupNumber) {
        let mut state = self.state.lock();
        if state.status == InvitationStatus::Election
            && from == state.coordinator
            && group == state.group
        {
            state.status = InvitationStatus::Reorganization;
        }
    }

    fn on_ready(&self, from: NodeId, group: GroupNumber, task: Value) {
        {
            let mut state = self.state.lock();
            let expected = matches!(
                state.status,
                InvitationStatus::Election | InvitationStatus::Reorganization
            ) && group == state.group
                && from == state.coordinator;
            if !expected {
                return;
            }
            state.status = InvitationStatus::Normal;
        }
        info!("Invitation: Node {} joined group {}", self.id(), group);
        self.workload.receive_task(task);
        self.send(from, InvitationMessage::ReadyRes);
        self.notify(from);
    }

    async fn periodic_check(&self) {
        let id = self.id();
        let (status, coordinator) = {
            let state = self.state.lock();
            (state.status, state.coordinator)
        };
        match status {
            InvitationStatus::Down | InvitationStatus::NotStarted => return,
            InvitationStatus::Normal if coordinator == id => return self.check_for_groups().await,
            _ if coordinator == id => return,
            _ => {}
        }

        let contacted = std::mem::take(&mut self.state.lock().contacted);
        if !contacted {
            self.check_coordinator().await;
        }
    }

    async fn check_coordinator(&self) {
        let (coordinator, group) = {
            let state = self.state.lock();
            (state.coordinator, state.group)
        };
        let answer = self
            .request(coordinator, InvitationMessage::AreYouThere { group }, ReplyKind::AreYouThere)
            .await;
        if answer == Some(true) {
            return;
        }

        let unchanged = {
            let state = self.state.lock();
            state.status != InvitationStatus::Down
                && state.coordinator == coordinator
                && state.group == group
        };
        if unchanged {
            warn!("Invitation: Node {} lost coordinator {}", self.id(), coordinator);
            self.recovery();
        }
    }

    async fn check_for_groups(&self) {
        let id = self.id();
        self.state.lock().found.clear();

        for peer in self.peers.peers() {
            if peer == id {
                continue;
            }
            let group = {
                let state = self.state.lock();
                if state.status != InvitationStatus::Normal || state.coordinator != id {
                    return;
                }
                state.group
            };
            let answer = self
                .request(peer, InvitationMessage::AreYouCoordinator { group }, ReplyKind::AreYouCoordinator)
                .await;
            if answer == Some(true) {
                self.state.lock().found.insert(peer);
            }
        }

        let found = self.state.lock().found.clone();
        let Some(highest) = found.last().copied() else {
            return;
        };
        if highest > id {
            debug!("Invitation: Node {} yielding to coordinator {}", id, highest);
            return;
        }
        self.merge_groups(found).await;
    }

    async fn merge_groups(&self, found: BTreeSet<NodeId>) {
        let id = self.id();
        let (group, former_members) = {
            let mut state = self.state.lock();
            if state.status != InvitationStatus::Normal || state.coordinator != id {
                return;
            }
            state.status = InvitationStatus::Election;
            state.counter += 1;
            state.group = GroupNumber {
                coordinator: id,
                sequence: state.counter,
            };
            let former = std::mem::replace(&mut state.up, BTreeSet::from([id]));
            (state.group, former)
        };
        info!("Invitation: Node {} merging {:?} into group {}", id, found, group);

        self.workload.stop_work();
        let invitees: BTreeSet<NodeId> = found
            .into_iter()
            .chain(former_members)
            .filter(|node| *node != id)
            .collect();
        for node in invitees {
            self.send(node, InvitationMessage::Invitation { group, coordinator: id });
        }

        sleep(self.config.timeout * self.config.merge_wait).await;

        let members: Vec<NodeId> = {
            let mut state = self.state.lock();
            if state.status != InvitationStatus::Election || state.group != group {
                return;
            }
            state.status = InvitationStatus::Reorganization;
            state.up.iter().copied().collect()
        };

        for member in &members {
            let task = self.workload.calculate_task(*member, group, &members);
            if *member == id {
                self.workload.receive_task(task);
                continue;
            }
            if !self.holds(group, InvitationStatus::Reorganization) {
                return;
            }
            let answer = self
                .request(*member, InvitationMessage::Ready { group, task }, ReplyKind::Ready)
                .await;
            if answer != Some(true) {
                if !self.holds(group, InvitationStatus::Reorganization) {
                    debug!("Invitation: Node {} left group {} during reorganization", id, group);
                    return;
                }
                warn!("Invitation: Member {} never confirmed group {}", member, group);
                self.recovery();
                return;
            }
        }

        let settled = {
            let mut state = self.state.lock();
            let settled = state.group == group && state.status == InvitationStatus::Reorganization;
            if settled {
                state.status = InvitationStatus::Normal;
            }
            settled
        };
        if settled {
            info!("Invitation: Node {} coordinating {:?}", id, members);
            self.notify(id);
        }
    }
}

/// Invitation election bound to a transport
pub struct InvitationElection {
    inner: Arc<Inner>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InvitationElection {
    /// Create an election; `inbox` yields the datagrams addressed to this node
    pub fn new(
        config: InvitationConfig,
        transport: Arc<dyn Transport>,
        peers: Arc<dyn PeerDirectory>,
        inbox: mpsc::UnboundedReceiver<Vec<u8>>,
        workload: Arc<dyn Workload>,
    ) -> Self {
        let id = config.id;
        let inner = Arc::new(Inner {
            config,
            transport,
            peers,
            workload,
            state: Mutex::new(State {
                status: InvitationStatus::NotStarted,
                group: GroupNumber {
                    coordinator: id,
                    sequence: 0,
                },
                counter: 0,
                coordinator: id,
                up: BTreeSet::new(),
                found: BTreeSet::new(),
                pending: None,
                contacted: false,
            }),
            on_status: RwLock::new(None),
        });
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner,
            inbox: Mutex::new(Some(inbox)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Set callback invoked when the node settles into a group
    pub fn set_status_callback<F>(&self, callback: F)
    where
        F: Fn(NodeId, ElectionStatus) + Send + Sync + 'static,
    {
        *self.inner.on_status.write() = Some(Box::new(callback));
    }

    pub fn id(&self) -> NodeId {
        self.inner.id()
    }

    /// Start the receive and periodic tasks; later calls are no-ops
    pub fn start(&self) {
        let Some(mut inbox) = self.inbox.lock().take() else {
            return;
        };
        info!("Invitation: Node {} starting", self.id());
        self.inner.recovery();

        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let receiver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    datagram = inbox.recv() => match datagram {
                        Some(datagram) => inner.handle_datagram(&datagram),
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let periodic = tokio::spawn(async move {
            let period = inner.config.period;
            loop {
                tokio::select! {
                    _ = inner.periodic_check() => {}
                    _ = shutdown_rx.changed() => break,
                }
                tokio::select! {
                    _ = sleep(period) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        self.tasks.lock().extend([receiver, periodic]);
    }

    /// Stop both tasks and wait for them
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Invitation: Task failed: {}", e);
            }
        }
        debug!("Invitation: Node {} stopped", self.id());
    }

    /// Believed coordinator and whether the node is settled in its group
    pub fn leader(&self) -> (NodeId, bool) {
        let state = self.inner.state.lock();
        (state.coordinator, state.status == InvitationStatus::Normal)
    }

    pub fn status(&self) -> InvitationStatus {
        self.inner.state.lock().status
    }

    pub fn group(&self) -> GroupNumber {
        self.inner.state.lock().group
    }

    /// Members this node believes are in its group
    pub fn up(&self) -> Vec<NodeId> {
        self.inner.state.lock().up.iter().copied().collect()
    }

    /// Toggle simulated crash; coming back up runs recovery
    pub fn switch_down(&self) {
        let resumed = {
            let mut state = self.inner.state.lock();
            match state.status {
                InvitationStatus::NotStarted => return,
                InvitationStatus::Down => true,
                _ => {
                    state.status = InvitationStatus::Down;
                    state.pending = None;
                    false
                }
            }
        };
        if resumed {
            info!("Invitation: Node {} back up", self.id());
            self.inner.recovery();
        } else {
            info!("Invitation: Node {} down", self.id());
            self.inner.workload.stop_work();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::transport::TransportError;

    fn election(network: &MemoryNetwork, id: u32) -> InvitationElection {
        let (transport, inbox) = network.register(NodeId(id));
        InvitationElection::new(
            InvitationConfig::new(NodeId(id)),
            Arc::new(transport),
            Arc::new(network.clone()),
            inbox,
            Arc::new(Idle),
        )
    }

    #[test]
    fn test_message_serialization() {
        let envelope = Envelope {
            from: NodeId(2),
            message: InvitationMessage::Invitation {
                group: GroupNumber {
                    coordinator: NodeId(3),
                    sequence: 4,
                },
                coordinator: NodeId(3),
            },
        };
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_group_number_order() {
        let older = GroupNumber {
            coordinator: NodeId(1),
            sequence: 9,
        };
        let newer = GroupNumber {
            coordinator: NodeId(2),
            sequence: 1,
        };
        assert!(older < newer);
        assert_eq!(newer.to_string(), "2/1");
    }

    #[test]
    fn test_config_builder() {
        let config = InvitationConfig::new(NodeId(4))
            .with_timeout(Duration::from_millis(200))
            .with_period(Duration::from_millis(600));
        assert_eq!(config.id, NodeId(4));
        assert_eq!(config.timeout, Duration::from_millis(200));
        assert_eq!(config.period, Duration::from_millis(600));
        assert_eq!(config.merge_wait, DEFAULT_MERGE_WAIT);
        assert_eq!(config.with_merge_wait(5).merge_wait, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_forms_singleton_group() {
        let network = MemoryNetwork::new();
        let node = election(&network, 5);
        assert_eq!(node.status(), InvitationStatus::NotStarted);

        node.start();
        assert_eq!(node.leader(), (NodeId(5), true));
        assert_eq!(node.up(), vec![NodeId(5)]);
        let group = node.group();

        // Second start is a no-op
        node.start();
        assert_eq!(node.group(), group);
        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_node_ignores_traffic() {
        let network = MemoryNetwork::new();
        let node = election(&network, 2);
        node.start();
        node.switch_down();
        assert_eq!(node.status(), InvitationStatus::Down);

        node.inner.handle_datagram(
            &Envelope {
                from: NodeId(9),
                message: InvitationMessage::Invitation {
                    group: GroupNumber {
                        coordinator: NodeId(9),
                        sequence: 1,
                    },
                    coordinator: NodeId(9),
                },
            }
            .to_bytes()
            .unwrap(),
        );
        assert_eq!(node.status(), InvitationStatus::Down);

        let before = node.group().sequence;
        node.switch_down();
        assert_eq!(node.leader(), (NodeId(2), true));
        assert!(node.group().sequence > before);
        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invitation_only_honoured_in_normal() {
        let network = MemoryNetwork::new();
        let node = election(&network, 1);
        let (_coordinator, _inbox) = network.register(NodeId(7));
        node.start();

        let group = GroupNumber {
            coordinator: NodeId(7),
            sequence: 3,
        };
        let invite = Envelope {
            from: NodeId(7),
            message: InvitationMessage::Invitation {
                group,
                coordinator: NodeId(7),
            },
        }
        .to_bytes()
        .unwrap();

        node.inner.handle_datagram(&invite);
        assert_eq!(node.status(), InvitationStatus::Election);
        assert_eq!(node.leader(), (NodeId(7), false));
        assert_eq!(node.group(), group);

        // A second invitation during the election is ignored
        let other = GroupNumber {
            coordinator: NodeId(8),
            sequence: 1,
        };
        node.inner.handle_datagram(
            &Envelope {
                from: NodeId(8),
                message: InvitationMessage::Invitation {
                    group: other,
                    coordinator: NodeId(8),
                },
            }
            .to_bytes()
            .unwrap(),
        );
        assert_eq!(node.group(), group);
        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_settles_follower() {
        let network = MemoryNetwork::new();
        let node = election(&network, 1);
        let (_coordinator, _inbox) = network.register(NodeId(7));
        node.start();

        let group = GroupNumber {
            coordinator: NodeId(7),
            sequence: 3,
        };
        for message in [
            InvitationMessage::Invitation {
                group,
                coordinator: NodeId(7),
            },
            InvitationMessage::AcceptRes { group },
        ] {
            node.inner.handle_datagram(
                &Envelope {
                    from: NodeId(7),
                    message,
                }
                .to_bytes()
                .unwrap(),
            );
        }
        assert_eq!(node.status(), InvitationStatus::Reorganization);

        // Ready for a stale group is dropped
        let stale = Envelope {
            from: NodeId(7),
            message: InvitationMessage::Ready {
                group: GroupNumber {
                    coordinator: NodeId(7),
                    sequence: 2,
                },
                task: Value::Null,
            },
        };
        node.inner.handle_datagram(&stale.to_bytes().unwrap());
        assert_eq!(node.status(), InvitationStatus::Reorganization);

        let ready = Envelope {
            from: NodeId(7),
            message: InvitationMessage::Ready {
                group,
                task: Value::Null,
            },
        };
        node.inner.handle_datagram(&ready.to_bytes().unwrap());
        assert_eq!(node.leader(), (NodeId(7), true));
        node.shutdown().await;
    }

    fn from_seven(message: InvitationMessage) -> Vec<u8> {
        Envelope {
            from: NodeId(7),
            message,
        }
        .to_bytes()
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_invitation_from_own_coordinator_ignored() {
        let network = MemoryNetwork::new();
        let node = election(&network, 1);
        let (_coordinator, _inbox) = network.register(NodeId(7));
        node.start();

        let group = GroupNumber {
            coordinator: NodeId(7),
            sequence: 3,
        };
        let older = GroupNumber {
            coordinator: NodeId(7),
            sequence: 2,
        };
        node.inner.handle_datagram(&from_seven(InvitationMessage::Invitation {
            group,
            coordinator: NodeId(7),
        }));
        // Answer for a group the node never joined
        node.inner
            .handle_datagram(&from_seven(InvitationMessage::AcceptRes { group: older }));
        assert_eq!(node.status(), InvitationStatus::Election);

        node.inner
            .handle_datagram(&from_seven(InvitationMessage::AcceptRes { group }));
        node.inner.handle_datagram(&from_seven(InvitationMessage::Ready {
            group,
            task: Value::Null,
        }));
        assert_eq!(node.leader(), (NodeId(7), true));

        // Delayed invitation into the group it replaced
        node.inner.handle_datagram(&from_seven(InvitationMessage::Invitation {
            group: older,
            coordinator: NodeId(7),
        }));
        assert_eq!(node.leader(), (NodeId(7), true));
        assert_eq!(node.group(), group);
        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_during_merge_stays_down() {
        let network = MemoryNetwork::new();
        let node = election(&network, 2);
        let (peer, mut inbox) = network.register(NodeId(1));
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();

        // Rival coordinator that accepts the merge but never confirms its task
        let rival = tokio::spawn(async move {
            while let Some(bytes) = inbox.recv().await {
                let Ok(envelope) = Envelope::from_bytes(&bytes) else {
                    continue;
                };
                let reply = match envelope.message {
                    InvitationMessage::AreYouCoordinator { .. } => {
                        InvitationMessage::AreYouCoordinatorRes { answer: true }
                    }
                    InvitationMessage::Invitation { group, .. } => {
                        InvitationMessage::Accept { group }
                    }
                    InvitationMessage::Ready { group, .. } => {
                        let _ = ready_tx.send(group);
                        continue;
                    }
                    _ => continue,
                };
                let reply = Envelope {
                    from: NodeId(1),
                    message: reply,
                };
                let _ = peer.send(envelope.from, reply.to_bytes().unwrap());
            }
        });

        node.start();
        let group = ready_rx.recv().await.unwrap();
        assert_eq!(node.status(), InvitationStatus::Reorganization);
        assert_eq!(node.group(), group);

        node.switch_down();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(node.status(), InvitationStatus::Down);
        assert_eq!(node.group(), group);

        node.shutdown().await;
        rival.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_election_stops_tasks() {
        let network = MemoryNetwork::new();
        let node = election(&network, 3);
        let (peer, _inbox) = network.register(NodeId(4));
        node.start();
        assert!(peer.send(NodeId(3), vec![]).is_ok());

        drop(node);
        sleep(Duration::from_millis(1)).await;
        assert!(matches!(
            peer.send(NodeId(3), vec![]),
            Err(TransportError::Closed)
        ));
    }
}
