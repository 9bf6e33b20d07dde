//! Demo workload distributed by invitation coordinators
//!
//! The coordinator splits a fixed list of work items round-robin across the
//! group members; members log what they were given and pause while an
//! election is in progress.

use leader_core::invitation::{GroupNumber, Workload};
use leader_core::NodeId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Number of work items split across a group
pub const WORK_ITEMS: usize = 5;

pub struct DemoWorkload {
    id: NodeId,
    working: AtomicBool,
    task: Mutex<Option<Value>>,
}

impl DemoWorkload {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            working: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    pub fn task(&self) -> Option<Value> {
        self.task.lock().clone()
    }
}

impl Workload for DemoWorkload {
    fn calculate_task(&self, member: NodeId, group: GroupNumber, members: &[NodeId]) -> Value {
        let position = members.iter().position(|m| *m == member).unwrap_or(0);
        let share = members.len().max(1);
        let items: Vec<usize> = (0..WORK_ITEMS).filter(|i| i % share == position).collect();
        json!({
            "group": group.to_string(),
            "items": items,
        })
    }

    fn receive_task(&self, task: Value) {
        info!("Node {} received task {}", self.id, task);
        *self.task.lock() = Some(task);
        self.working.store(true, Ordering::SeqCst);
    }

    fn stop_work(&self) {
        if self.working.swap(false, Ordering::SeqCst) {
            info!("Node {} stopping work", self.id);
        }
    }
}
