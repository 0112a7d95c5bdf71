//! Placement policy: which node hosts which shard replica.
//!
//! Pure functions over snapshots of the assignment table so the decisions
//! are unit-testable and deterministic: pick the least-loaded live node
//! not already hosting the shard, ties broken by node name.

use std::collections::{BTreeMap, BTreeSet};

/// Current shard-to-nodes assignment view, rebuilt from the store on every
/// reconcile pass.
#[derive(Debug, Default, Clone)]
pub struct PlacementTable {
    shard_nodes: BTreeMap<String, BTreeSet<String>>,
}

impl PlacementTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, shard: &str, node: &str) {
        self.shard_nodes
            .entry(shard.to_string())
            .or_default()
            .insert(node.to_string());
    }

    pub fn remove(&mut self, shard: &str, node: &str) {
        if let Some(nodes) = self.shard_nodes.get_mut(shard) {
            nodes.remove(node);
            if nodes.is_empty() {
                self.shard_nodes.remove(shard);
            }
        }
    }

    pub fn nodes_for(&self, shard: &str) -> BTreeSet<String> {
        self.shard_nodes.get(shard).cloned().unwrap_or_default()
    }

    /// Number of shard replicas assigned to `node`.
    pub fn load_of(&self, node: &str) -> usize {
        self.shard_nodes
            .values()
            .filter(|nodes| nodes.contains(node))
            .count()
    }

    pub fn shards(&self) -> impl Iterator<Item = &String> {
        self.shard_nodes.keys()
    }
}

/// Least-loaded live node that does not already host the shard; ties break
/// by node name for determinism.
pub fn choose_replica(
    table: &PlacementTable,
    live_nodes: &BTreeSet<String>,
    exclude: &BTreeSet<String>,
) -> Option<String> {
    live_nodes
        .iter()
        .filter(|node| !exclude.contains(*node))
        .min_by_key(|node| (table.load_of(node), (*node).clone()))
        .cloned()
}

/// Plan the replicas still missing for `shard` to reach
/// `min(replication, live)` distinct nodes, extending the table as it
/// assigns so one pass spreads load evenly.
pub fn plan_missing_replicas(
    table: &mut PlacementTable,
    shard: &str,
    replication: usize,
    live_nodes: &BTreeSet<String>,
    exclude: &BTreeSet<String>,
) -> Vec<String> {
    let target = replication.min(
        live_nodes
            .iter()
            .filter(|node| !exclude.contains(*node))
            .count(),
    );
    let mut chosen = Vec::new();
    loop {
        let current = table.nodes_for(shard);
        if current.len() >= target {
            break;
        }
        let mut unavailable = exclude.clone();
        unavailable.extend(current);
        let Some(node) = choose_replica(table, live_nodes, &unavailable) else {
            break;
        };
        table.assign(shard, &node);
        chosen.push(node);
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn chooses_least_loaded_node() {
        let mut table = PlacementTable::new();
        table.assign("i#a", "n1");
        table.assign("i#b", "n1");
        table.assign("i#c", "n2");
        let choice = choose_replica(&table, &live(&["n1", "n2", "n3"]), &BTreeSet::new());
        assert_eq!(choice.as_deref(), Some("n3"));
    }

    #[test]
    fn ties_break_by_node_name() {
        let table = PlacementTable::new();
        let choice = choose_replica(&table, &live(&["n2", "n1", "n3"]), &BTreeSet::new());
        assert_eq!(choice.as_deref(), Some("n1"));
    }

    #[test]
    fn excluded_nodes_are_skipped() {
        let table = PlacementTable::new();
        let choice = choose_replica(&table, &live(&["n1", "n2"]), &live(&["n1"]));
        assert_eq!(choice.as_deref(), Some("n2"));
        assert_eq!(
            choose_replica(&table, &live(&["n1"]), &live(&["n1"])),
            None
        );
    }

    #[test]
    fn plan_fills_to_replication_level() {
        let mut table = PlacementTable::new();
        let added = plan_missing_replicas(
            &mut table,
            "i#a",
            2,
            &live(&["n1", "n2", "n3"]),
            &BTreeSet::new(),
        );
        assert_eq!(added.len(), 2);
        assert_eq!(table.nodes_for("i#a").len(), 2);
    }

    #[test]
    fn plan_clamps_to_live_node_count() {
        let mut table = PlacementTable::new();
        let added = plan_missing_replicas(
            &mut table,
            "i#a",
            3,
            &live(&["n1"]),
            &BTreeSet::new(),
        );
        assert_eq!(added, vec!["n1".to_string()]);
    }

    #[test]
    fn plan_avoids_existing_hosts() {
        let mut table = PlacementTable::new();
        table.assign("i#a", "n1");
        let added = plan_missing_replicas(
            &mut table,
            "i#a",
            2,
            &live(&["n1", "n2"]),
            &BTreeSet::new(),
        );
        assert_eq!(added, vec!["n2".to_string()]);
    }

    #[test]
    fn plan_spreads_load_across_shards() {
        let mut table = PlacementTable::new();
        let nodes = live(&["n1", "n2", "n3"]);
        for shard in ["i#a", "i#b", "i#c"] {
            plan_missing_replicas(&mut table, shard, 1, &nodes, &BTreeSet::new());
        }
        assert_eq!(table.load_of("n1"), 1);
        assert_eq!(table.load_of("n2"), 1);
        assert_eq!(table.load_of("n3"), 1);
    }

    #[test]
    fn plan_is_idempotent_once_satisfied() {
        let mut table = PlacementTable::new();
        let nodes = live(&["n1", "n2"]);
        plan_missing_replicas(&mut table, "i#a", 2, &nodes, &BTreeSet::new());
        let again = plan_missing_replicas(&mut table, "i#a", 2, &nodes, &BTreeSet::new());
        assert!(again.is_empty());
    }
}
