//! Broadcast helper for the LR election.
//!
//! Floods heartbeat records through the network. Every record is forwarded
//! once to every connected interface except the one it arrived on; a bounded
//! history of `(sender, log_time, seq)` drops re-deliveries.

use crate::protocol::{Protocol, LR_GROUP};
use crate::types::{ConfigChange, Interface, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::net::Ipv6Addr;
use tracing::{debug, error, trace};

/// Records kept for duplicate detection
pub const HISTORY_CAPACITY: usize = 64;

/// Heartbeat broadcast of the LR election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LrMessage {
    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        sender: NodeId,
        log_time: u64,
        seq: u64,
    },
}

impl LrMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

type HeartbeatCallback = Box<dyn Fn(NodeId, u64) + Send>;
type TopologyCallback = Box<dyn Fn() + Send>;

/// Multiplexer-side half of the LR election
pub struct LrHelper {
    id: NodeId,
    interfaces: BTreeSet<String>,
    history: VecDeque<LrMessage>,
    /// Interface the record being forwarded arrived on
    sender: Option<String>,
    forward: Option<LrMessage>,
    updates: Vec<ConfigChange>,
    on_heartbeat: HeartbeatCallback,
    on_topology: TopologyCallback,
}

impl LrHelper {
    pub fn new<H, T>(id: NodeId, on_heartbeat: H, on_topology: T) -> Self
    where
        H: Fn(NodeId, u64) + Send + 'static,
        T: Fn() + Send + 'static,
    {
        Self {
            id,
            interfaces: BTreeSet::new(),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            sender: None,
            forward: None,
            updates: Vec::new(),
            on_heartbeat: Box::new(on_heartbeat),
            on_topology: Box::new(on_topology),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn remember(&mut self, record: LrMessage) {
        let LrMessage::Heartbeat { sender, seq, .. } = record;
        self.history.retain(|old| {
            let LrMessage::Heartbeat {
                sender: old_sender,
                seq: old_seq,
                ..
            } = old;
            *old_sender != sender || *old_seq >= seq
        });
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

impl Protocol for LrHelper {
    fn on_message(&mut self, interface: &str, packet: &[u8]) -> bool {
        self.forward = None;
        let record = match LrMessage::from_bytes(packet) {
            Ok(record) => record,
            Err(e) => {
                debug!("LR: Malformed heartbeat on {}: {}", interface, e);
                return false;
            }
        };
        let LrMessage::Heartbeat {
            sender, log_time, ..
        } = record;
        if sender == self.id || self.history.contains(&record) {
            trace!("LR: Ignoring known heartbeat {:?}", record);
            return false;
        }

        self.remember(record);
        self.sender = Some(interface.to_string());
        self.forward = Some(record);
        (self.on_heartbeat)(sender, log_time);
        self.updates.push(ConfigChange::Respond {
            interface: interface.to_string(),
        });
        true
    }

    fn after_message(&mut self, interface: &Interface, send: &mut dyn FnMut(Vec<u8>)) -> bool {
        let Some(record) = self.forward else {
            return false;
        };
        if self.sender.as_deref() == Some(interface.name())
            || !interface.is_connected()
            || interface.is_loopback()
        {
            return false;
        }
        match record.to_bytes() {
            Ok(bytes) => send(bytes),
            Err(e) => error!("LR: Failed to encode {:?}: {}", record, e),
        }
        false
    }

    fn on_interface_event(&mut self, interface: &Interface, connected: bool) -> bool {
        self.forward = None;
        debug!(
            "LR: Connector {} {}",
            interface.name(),
            if connected { "connected" } else { "disconnected" }
        );
        (self.on_topology)();
        false
    }

    fn add_interface(&mut self, interface: &Interface) -> bool {
        self.forward = None;
        if interface.is_loopback() {
            return false;
        }
        self.interfaces.insert(interface.name().to_string())
    }

    fn remove_interface(&mut self, interface: &Interface) -> bool {
        self.interfaces.remove(interface.name())
    }

    fn manages(&self, interface: &str) -> bool {
        self.interfaces.contains(interface)
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
        LR_GROUP
    }

    fn name(&self) -> &'static str {
        "lr-helper"
    }

    fn info(&self) -> String {
        format!("lr-helper id={} history={}", self.id, self.history.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn heartbeat(sender: u32, log_time: u64, seq: u64) -> Vec<u8> {
        LrMessage::Heartbeat {
            sender: NodeId(sender),
            log_time,
            seq,
        }
        .to_bytes()
        .unwrap()
    }

    fn helper() -> (LrHelper, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let received = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(AtomicUsize::new(0));
        let (r, e) = (received.clone(), events.clone());
        let mut helper = LrHelper::new(
            NodeId(1),
            move |_, _| {
                r.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                e.fetch_add(1, Ordering::SeqCst);
            },
        );
        helper.add_interface(&Interface::new("port0", true));
        helper.add_interface(&Interface::new("port1", true));
        (helper, received, events)
    }

    #[test]
    fn test_forwards_except_arrival() {
        let (mut helper, received, _) = helper();
        assert!(helper.on_message("port0", &heartbeat(2, 0, 0)));
        assert_eq!(received.load(Ordering::SeqCst), 1);

        let mut sent = Vec::new();
        for name in ["port0", "port1", "lo"] {
            helper.after_message(&Interface::new(name, true), &mut |_| sent.push(name));
        }
        assert_eq!(sent, vec!["port1"]);
    }

    #[test]
    fn test_duplicates_and_own_records_dropped() {
        let (mut helper, received, _) = helper();
        assert!(helper.on_message("port0", &heartbeat(2, 0, 0)));
        assert!(!helper.on_message("port1", &heartbeat(2, 0, 0)));
        assert!(!helper.on_message("port1", &heartbeat(1, 0, 0)));
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_newer_sequence_evicts_older() {
        let (mut helper, _, _) = helper();
        helper.on_message("port0", &heartbeat(2, 0, 0));
        helper.on_message("port0", &heartbeat(2, 0, 1));
        helper.on_message("port0", &heartbeat(3, 0, 0));
        assert_eq!(helper.history_len(), 2);
    }

    #[test]
    fn test_history_bounded() {
        let (mut helper, _, _) = helper();
        for sender in 0..(HISTORY_CAPACITY as u32 + 10) {
            helper.on_message("port0", &heartbeat(sender + 10, 0, 0));
        }
        assert_eq!(helper.history_len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_interface_event_reports_topology_change() {
        let (mut helper, _, events) = helper();
        assert!(!helper.on_interface_event(&Interface::new("port0", false), false));
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registration_bookkeeping() {
        let (mut helper, _, _) = helper();
        assert!(!helper.add_interface(&Interface::new("port0", true)));
        assert!(helper.manages("port1"));
        assert!(helper.remove_interface(&Interface::new("port1", true)));
        assert!(!helper.remove_interface(&Interface::new("port1", true)));
    }
}
