//! Record types stored in the metadata tree.

use serde::{Deserialize, Serialize};

/// Index lifecycle. `Announced` is written by the admin client; all later
/// transitions are driven by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Announced,
    Deploying,
    Deployed,
    DeployError,
    Replicating,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            IndexState::Announced => "ANNOUNCED",
            IndexState::Deploying => "DEPLOYING",
            IndexState::Deployed => "DEPLOYED",
            IndexState::DeployError => "DEPLOY_ERROR",
            IndexState::Replicating => "REPLICATING",
        };
        f.write_str(label)
    }
}

/// Content of `/indexes/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetaData {
    pub path: String,
    pub analyzer: String,
    pub replication_level: usize,
    pub state: IndexState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl IndexMetaData {
    pub fn announced(path: String, analyzer: String, replication_level: usize) -> Self {
        Self {
            path,
            analyzer,
            replication_level: replication_level.max(1),
            state: IndexState::Announced,
            error_message: None,
        }
    }
}

/// Per-replica deployment progress. Written only by the owning node after
/// the master creates the record as `Assigned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployState {
    Assigned,
    Fetching,
    Open,
    Error,
}

impl std::fmt::Display for DeployState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeployState::Assigned => "ASSIGNED",
            DeployState::Fetching => "FETCHING",
            DeployState::Open => "OPEN",
            DeployState::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Content of `/shard-to-node/<shard>/<node>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployedShard {
    pub state: DeployState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_size: Option<u64>,
}

impl DeployedShard {
    pub fn assigned() -> Self {
        Self {
            state: DeployState::Assigned,
            error_message: None,
            shard_size: None,
        }
    }

    pub fn fetching() -> Self {
        Self {
            state: DeployState::Fetching,
            error_message: None,
            shard_size: None,
        }
    }

    pub fn open(shard_size: u64) -> Self {
        Self {
            state: DeployState::Open,
            error_message: None,
            shard_size: Some(shard_size),
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            state: DeployState::Error,
            error_message: Some(message),
            shard_size: None,
        }
    }
}

/// Content of `/nodes/<name>`; the entry itself is ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub host: String,
    pub port: u16,
    pub start_time_ms: u64,
    pub healthy: bool,
    pub status: String,
}

impl NodeDescriptor {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Content of `/indexes/<name>/<shard>` and `/node-to-shard/<node>/<shard>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSource {
    pub source: String,
}

/// Unix time in milliseconds, saturating.
pub fn unix_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_meta_json_round_trip() {
        let meta = IndexMetaData::announced("/data/wiki".into(), "standard".into(), 2);
        let bytes = serde_json::to_vec(&meta).unwrap();
        let back: IndexMetaData = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.state, IndexState::Announced);
        assert_eq!(back.replication_level, 2);
        assert!(back.error_message.is_none());
    }

    #[test]
    fn replication_is_clamped_to_one() {
        let meta = IndexMetaData::announced("/p".into(), "a".into(), 0);
        assert_eq!(meta.replication_level, 1);
    }

    #[test]
    fn deploy_record_states() {
        let open = DeployedShard::open(42);
        assert_eq!(open.state, DeployState::Open);
        assert_eq!(open.shard_size, Some(42));

        let failed = DeployedShard::failed("corrupt".into());
        assert_eq!(failed.state, DeployState::Error);
        assert_eq!(failed.error_message.as_deref(), Some("corrupt"));
    }
}
