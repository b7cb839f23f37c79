use crate::{error::Error, quorum, retry::RetryPolicy, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Deadline for every store call.
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { op_timeout_ms: 500 }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Names the leadership lease, `leader:<cluster>`.
    pub cluster: String,
    /// Voting members, this node included.
    pub cluster_size: usize,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub lease_ttl_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            cluster: "default".to_string(),
            cluster_size: 1,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            lease_ttl_ms: 1_000,
        }
    }
}

impl ElectionConfig {
    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn lease_key(&self) -> String {
        format!("leader:{}", self.cluster)
    }

    pub fn quorum(&self) -> usize {
        quorum(self.cluster_size)
    }

    /// Timing rules. Membership is checked by [`CoordinatorConfig::validate`].
    pub fn validate(&self) -> Result<()> {
        if self.cluster.is_empty() {
            return Err(Error::InvalidConfig("cluster name is empty".into()));
        }
        if self.cluster_size == 0 {
            return Err(Error::InvalidConfig("cluster_size must be at least 1".into()));
        }
        if self.heartbeat_interval_ms == 0 || self.rpc_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms and rpc_timeout_ms must be non-zero".into(),
            ));
        }
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(Error::InvalidConfig(format!(
                "election_timeout_min_ms ({}) must be below election_timeout_max_ms ({})",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms.saturating_mul(2) >= self.election_timeout_min_ms {
            return Err(Error::InvalidConfig(format!(
                "heartbeat_interval_ms ({}) must be under half of election_timeout_min_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.lease_ttl_ms <= self.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "lease_ttl_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.lease_ttl_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

/// Everything one node needs. Loaded from TOML or built in code.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Generated when absent.
    pub node_id: Option<NodeId>,
    /// Other voting members.
    pub peers: Vec<NodeId>,
    pub store: StoreConfig,
    pub retry: RetryPolicy,
    pub election: ElectionConfig,
}

impl CoordinatorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.op_timeout_ms == 0 {
            return Err(Error::InvalidConfig("store.op_timeout_ms must be non-zero".into()));
        }
        self.election.validate()?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(*peer) {
                return Err(Error::InvalidConfig(format!("peer {peer} listed twice")));
            }
            if Some(*peer) == self.node_id {
                return Err(Error::InvalidConfig(format!("node {peer} lists itself as a peer")));
            }
        }

        let members = self.peers.len() + 1;
        if members > self.election.cluster_size {
            return Err(Error::InvalidConfig(format!(
                "{members} members configured but cluster_size is {}",
                self.election.cluster_size
            )));
        }
        let needed = self.election.quorum();
        if members < needed {
            return Err(Error::ClusterBelowQuorum {
                available: members,
                quorum: needed,
            });
        }
        Ok(())
    }
}
