//! Store path layout. The paths are the wire contract between master,
//! nodes, clients, and admin tooling; everything else is JSON content.

use std::sync::Arc;

use seine_meta::{CreateMode, PathStore, StoreError};

/// Ephemeral election token; content is the active master's name.
pub const MASTER: &str = "/master";
/// Ephemeral node descriptors; existence is the liveness signal.
pub const NODES: &str = "/nodes";
/// Persistent index declarations, one child per shard.
pub const INDEXES: &str = "/indexes";
/// Persistent assignments, written by the master, watched by each node.
pub const NODE_TO_SHARD: &str = "/node-to-shard";
/// Persistent deployment records, written by nodes, watched by master and
/// clients.
pub const SHARD_TO_NODE: &str = "/shard-to-node";

pub fn node(name: &str) -> String {
    format!("{NODES}/{name}")
}

pub fn index(name: &str) -> String {
    format!("{INDEXES}/{name}")
}

pub fn index_shard(index: &str, shard: &str) -> String {
    format!("{INDEXES}/{index}/{shard}")
}

pub fn node_shards(node: &str) -> String {
    format!("{NODE_TO_SHARD}/{node}")
}

pub fn node_shard(node: &str, shard: &str) -> String {
    format!("{NODE_TO_SHARD}/{node}/{shard}")
}

pub fn shard_nodes(shard: &str) -> String {
    format!("{SHARD_TO_NODE}/{shard}")
}

pub fn shard_node(shard: &str, node: &str) -> String {
    format!("{SHARD_TO_NODE}/{shard}/{node}")
}

/// Shard names are `<index>#<stem>`: unique within the flat
/// `/shard-to-node` layout, and trivially mapped back to the owning index.
pub fn shard_name(index: &str, stem: &str) -> String {
    format!("{index}#{stem}")
}

/// Owning index of a shard name, if well-formed.
pub fn shard_index(shard: &str) -> Option<&str> {
    shard.split_once('#').map(|(index, _)| index)
}

/// Create the root folders if missing. Every component calls this on
/// startup; concurrent calls race benignly.
pub async fn ensure_layout(store: &Arc<dyn PathStore>) -> Result<(), StoreError> {
    for root in [NODES, INDEXES, NODE_TO_SHARD, SHARD_TO_NODE] {
        match store.create(root, Vec::new(), CreateMode::Persistent).await {
            Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_names_round_trip() {
        let shard = shard_name("wiki", "part-003");
        assert_eq!(shard, "wiki#part-003");
        assert_eq!(shard_index(&shard), Some("wiki"));
        assert_eq!(shard_index("no-separator"), None);
    }

    #[test]
    fn layout_paths() {
        assert_eq!(node("n1"), "/nodes/n1");
        assert_eq!(node_shard("n1", "wiki#a"), "/node-to-shard/n1/wiki#a");
        assert_eq!(shard_node("wiki#a", "n1"), "/shard-to-node/wiki#a/n1");
    }
}
