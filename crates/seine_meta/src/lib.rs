//! Hierarchical metadata store facade.
//!
//! The cluster coordinates exclusively through a small, watchable,
//! hierarchical path store: ephemeral registration is the liveness signal,
//! persistent entries are the shared ground truth, and one-shot watches
//! drive every controller. This crate provides the `PathStore` trait, an
//! in-memory backend with real session semantics, a TCP-served remote
//! backend, and the continuous-subscription adapter built on top of the
//! one-shot watch primitives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

pub mod memory;
pub mod remote;
pub mod watch;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

/// How an entry is bound to the creating session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Deleted when the creating session ends.
    Ephemeral,
    /// Ephemeral with a monotonically increasing suffix appended to the path.
    EphemeralSequential,
}

/// Entry data plus the revision used for optimistic writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub data: Vec<u8>,
    pub version: u64,
}

/// Store-level failures. Callers map these onto their own error kinds.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("no entry at '{0}'")]
    NotFound(String),
    #[error("entry already exists at '{0}'")]
    AlreadyExists(String),
    #[error("version conflict at '{path}': expected {expected}, found {actual}")]
    Conflict {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("'{0}' has children; delete them first or use delete_recursive")]
    NotEmpty(String),
    #[error("invalid path '{0}'")]
    BadPath(String),
    #[error("store session disconnected")]
    Disconnected,
    #[error("store i/o failure: {0}")]
    Io(String),
}

/// Session lifecycle notifications, delivered once per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Disconnected,
    Reconnected,
}

/// Outcome of a one-shot watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEvent {
    /// The watched entry (or child set) changed.
    Changed,
    /// The watch was invalidated by session loss; re-arm after reconnect.
    Expired,
}

/// A one-shot watch registration. Await `fired` to observe the event.
pub struct WatchHandle {
    rx: oneshot::Receiver<WatchEvent>,
}

impl WatchHandle {
    pub fn new(rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Resolves when the watch fires. A dropped registration counts as
    /// expiry so subscribers always unblock.
    pub async fn fired(self) -> WatchEvent {
        self.rx.await.unwrap_or(WatchEvent::Expired)
    }
}

/// Watchable hierarchical path store.
///
/// Watches are one-shot, matching the underlying coordination service;
/// the [`watch`] module re-arms them for continuous consumption. All
/// operations may fail with [`StoreError::Disconnected`] while the session
/// is down; callers retry after the next [`SessionEvent::Reconnected`].
#[async_trait]
pub trait PathStore: Send + Sync + 'static {
    /// Create an entry, returning the actual path (sequential modes append
    /// a suffix). Parent must exist.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, StoreError>;

    async fn read(&self, path: &str) -> Result<Versioned, StoreError>;

    /// Unconditional overwrite; bumps the version.
    async fn write(&self, path: &str, data: Vec<u8>) -> Result<u64, StoreError>;

    /// Optimistic overwrite. Returns the new version, or
    /// [`StoreError::Conflict`] when `expected_version` is stale.
    async fn compare_and_write(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    async fn delete_recursive(&self, path: &str) -> Result<(), StoreError>;

    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Child names (not full paths), sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Child names plus a watch that fires on the next child add/remove.
    async fn children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, WatchHandle), StoreError>;

    /// Current data (`None` when absent) plus a watch that fires on the
    /// next write, create, or delete of the entry.
    async fn data_watch(
        &self,
        path: &str,
    ) -> Result<(Option<Versioned>, WatchHandle), StoreError>;

    /// Existence plus a watch that fires on the next create or delete.
    async fn exists_watch(&self, path: &str) -> Result<(bool, WatchHandle), StoreError>;

    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}

/// Validate an absolute, normalized store path.
pub fn validate_path(path: &str) -> Result<(), StoreError> {
    let ok = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && !path.contains("//")
            && !path.split('/').skip(1).any(str::is_empty));
    if ok {
        Ok(())
    } else {
        Err(StoreError::BadPath(path.to_string()))
    }
}

/// Parent of a normalized path (`/a/b` -> `/a`, `/a` -> `/`).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

/// Final component of a normalized path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/nodes").is_ok());
        assert!(validate_path("/nodes/n1").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("nodes").is_err());
        assert!(validate_path("/nodes/").is_err());
        assert!(validate_path("/nodes//n1").is_err());
    }

    #[test]
    fn path_helpers() {
        assert_eq!(parent_path("/nodes/n1"), "/nodes");
        assert_eq!(parent_path("/nodes"), "/");
        assert_eq!(base_name("/nodes/n1"), "n1");
    }
}
