//! Error kinds that cross component boundaries.
//!
//! Lower layers convert their failures into one of these kinds at the seam;
//! only `ShardUnavailable` and `MalformedQuery` surface to search callers,
//! the rest are logged with context or handled by retry/failover.

use seine_meta::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("metadata store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("metadata store write conflict at '{0}'")]
    StoreConflict(String),

    #[error("shard '{shard}' failed to open: {message}")]
    ShardOpenFailure { shard: String, message: String },

    #[error("rpc to node '{node}' failed: {message}")]
    RpcTimeout { node: String, message: String },

    #[error("shard '{shard}' has no live replica")]
    ShardUnavailable { shard: String },

    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("deploy of index '{index}' failed: {message}")]
    DeployFailure { index: String, message: String },
}

impl From<StoreError> for ClusterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { path, .. } => ClusterError::StoreConflict(path),
            other => ClusterError::StoreUnavailable(other.to_string()),
        }
    }
}
