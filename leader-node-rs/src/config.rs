//! Node configuration file
//!
//! ```json
//! {
//!   "id": 2,
//!   "listen": "127.0.0.1:7702",
//!   "peers": [
//!     { "id": 1, "addr": "127.0.0.1:7701" },
//!     { "id": 3, "addr": "127.0.0.1:7703" }
//!   ],
//!   "timeout_ms": 1000,
//!   "period_ms": 3000,
//!   "merge_wait": 3
//! }
//! ```

use leader_core::invitation::{
    InvitationConfig, DEFAULT_MERGE_WAIT, DEFAULT_PERIOD_MS, DEFAULT_TIMEOUT_MS,
};
use leader_core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors loading a node configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Another election participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Configuration of a UDP invitation node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub listen: SocketAddr,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Timeouts a merging coordinator waits for accepts
    #[serde(default = "default_merge_wait")]
    pub merge_wait: u32,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_period_ms() -> u64 {
    DEFAULT_PERIOD_MS
}

fn default_merge_wait() -> u32 {
    DEFAULT_MERGE_WAIT
}

impl NodeConfig {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 || self.period_ms == 0 || self.merge_wait == 0 {
            return Err(ConfigError::Invalid(
                "timeout_ms, period_ms and merge_wait must be positive".to_string(),
            ));
        }
        if self.period_ms < self.timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "period_ms ({}) shorter than timeout_ms ({})",
                self.period_ms, self.timeout_ms
            )));
        }

        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            if peer.id == self.id {
                return Err(ConfigError::Invalid(format!(
                    "peer list contains own id {}",
                    self.id
                )));
            }
            if !seen.insert(peer.id) {
                return Err(ConfigError::Invalid(format!("duplicate peer {}", peer.id)));
            }
        }
        Ok(())
    }

    pub fn election_config(&self) -> InvitationConfig {
        InvitationConfig::new(self.id)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_period(Duration::from_millis(self.period_ms))
            .with_merge_wait(self.merge_wait)
    }
}
