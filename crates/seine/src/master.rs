//! Master / placement controller.
//!
//! Exactly one master is active at a time, elected by creating the
//! ephemeral `/master` token; stand-bys watch the token and re-run the
//! election when it disappears. The active master is a reducer over store
//! events: node and index changes, plus per-shard deployment reports, all
//! funnel into one trigger queue, and every trigger runs a full idempotent
//! reconcile pass against the store. Placement state lives in the store
//! itself, so standing assignments survive failover.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use seine_meta::{CreateMode, PathStore, SessionEvent, StoreError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::meta::{DeployState, DeployedShard, IndexMetaData, IndexState, ShardSource};
use crate::paths;
use crate::placement::{choose_replica, PlacementTable};
use crate::subs::{forward_children, TriggerPath, TriggerRegistry};

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub name: String,
    /// Debounce window applied after each trigger before reconciling.
    pub debounce: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            name: "master".to_string(),
            debounce: Duration::from_millis(20),
        }
    }
}

/// One shard of a freshly announced index.
#[derive(Debug, Clone)]
pub struct ShardSpec {
    pub stem: String,
    pub source: String,
}

/// Enumerates the shards of an index source path once, on announcement.
pub trait ShardEnumerator: Send + Sync + 'static {
    fn enumerate(&self, index_path: &str) -> anyhow::Result<Vec<ShardSpec>>;
}

/// Filesystem enumeration: every `*.jsonl` file or subdirectory of the
/// index path is one shard.
pub struct FsShardEnumerator;

impl ShardEnumerator for FsShardEnumerator {
    fn enumerate(&self, index_path: &str) -> anyhow::Result<Vec<ShardSpec>> {
        let mut shards = Vec::new();
        let entries = std::fs::read_dir(index_path)
            .with_context(|| format!("list index path '{index_path}'"))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_shard = path.is_dir()
                || path.extension().map(|ext| ext == "jsonl").unwrap_or(false);
            if !is_shard {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow::anyhow!("unreadable shard name in '{index_path}'"))?
                .to_string();
            shards.push(ShardSpec {
                stem,
                source: path.display().to_string(),
            });
        }
        shards.sort_by(|a, b| a.stem.cmp(&b.stem));
        if shards.is_empty() {
            anyhow::bail!("index path '{index_path}' contains no shards");
        }
        Ok(shards)
    }
}

/// Enumeration from a registered map; used with [`crate::engine::MemoryEngine`].
#[derive(Default)]
pub struct StaticShardEnumerator {
    layouts: RwLock<std::collections::HashMap<String, Vec<ShardSpec>>>,
}

impl StaticShardEnumerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, index_path: &str, shards: Vec<ShardSpec>) {
        self.layouts
            .write()
            .unwrap()
            .insert(index_path.to_string(), shards);
    }
}

impl ShardEnumerator for StaticShardEnumerator {
    fn enumerate(&self, index_path: &str) -> anyhow::Result<Vec<ShardSpec>> {
        self.layouts
            .read()
            .unwrap()
            .get(index_path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no shards registered for '{index_path}'"))
    }
}

pub struct Master {
    name: String,
    store: Arc<dyn PathStore>,
    active: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Start a master (or stand-by). Returns immediately; election runs in
/// the background.
pub async fn start_master(
    store: Arc<dyn PathStore>,
    enumerator: Arc<dyn ShardEnumerator>,
    config: MasterConfig,
) -> anyhow::Result<Master> {
    paths::ensure_layout(&store)
        .await
        .context("create store layout")?;
    let active = Arc::new(AtomicBool::new(false));

    let task = {
        let store = store.clone();
        let active = active.clone();
        let config = config.clone();
        tokio::spawn(async move {
            election_loop(store, enumerator, config, active).await;
        })
    };

    Ok(Master {
        name: config.name,
        store,
        active,
        task: Mutex::new(Some(task)),
    })
}

impl Master {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this process currently holds the election token.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop and release the election token if held.
    pub async fn shutdown(self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        if let Ok(current) = self.store.read(paths::MASTER).await {
            if current.data == self.name.as_bytes() {
                let _ = self.store.delete(paths::MASTER).await;
            }
        }
        self.active.store(false, Ordering::Release);
        tracing::info!(master = %self.name, "master stopped");
    }
}

async fn election_loop(
    store: Arc<dyn PathStore>,
    enumerator: Arc<dyn ShardEnumerator>,
    config: MasterConfig,
    active: Arc<AtomicBool>,
) {
    loop {
        match store
            .create(
                paths::MASTER,
                config.name.as_bytes().to_vec(),
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(_) => {
                tracing::info!(master = %config.name, "election won, master active");
                active.store(true, Ordering::Release);
                run_active(&store, &enumerator, &config).await;
                active.store(false, Ordering::Release);
                tracing::info!(master = %config.name, "master deactivated");
            }
            Err(StoreError::AlreadyExists(_)) => {
                // Stand by until the token disappears.
                match store.exists_watch(paths::MASTER).await {
                    Ok((true, watch)) => {
                        watch.fired().await;
                    }
                    Ok((false, _)) => {}
                    Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
                }
            }
            Err(StoreError::Disconnected) => {
                wait_reconnected(&store).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "election attempt failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn wait_reconnected(store: &Arc<dyn PathStore>) {
    let mut events = store.session_events();
    loop {
        match events.recv().await {
            Ok(SessionEvent::Reconnected) => return,
            Ok(SessionEvent::Disconnected) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                tokio::time::sleep(Duration::from_secs(1)).await;
                return;
            }
        }
    }
}

/// Drive reconcile passes until deposed or the session drops.
async fn run_active(
    store: &Arc<dyn PathStore>,
    enumerator: &Arc<dyn ShardEnumerator>,
    config: &MasterConfig,
) {
    let (tx, mut rx) = mpsc::channel::<()>(64);
    let roots: Vec<JoinHandle<()>> = [paths::NODES, paths::INDEXES, paths::SHARD_TO_NODE]
        .into_iter()
        .map(|root| forward_children(store.clone(), root.to_string(), tx.clone()))
        .collect();
    let mut registry = TriggerRegistry::new(store.clone(), tx.clone());
    let mut events = store.session_events();

    loop {
        match reconcile(store, enumerator, &config.name, &mut registry).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                // Transient store trouble; retry without waiting for a
                // trigger that may never come.
                tracing::warn!(error = %err, "reconcile pass failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        }

        tokio::select! {
            maybe = rx.recv() => {
                if maybe.is_none() {
                    break;
                }
                // Coalesce the burst of triggers a single change produces.
                tokio::time::sleep(config.debounce).await;
                while rx.try_recv().is_ok() {}
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Disconnected) => break,
                Ok(SessionEvent::Reconnected) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    for task in roots {
        task.abort();
    }
    registry.shutdown();
}

/// Per-shard deployment health used by the index state machine.
#[derive(Debug, Clone)]
pub(crate) struct ShardHealth {
    pub open: usize,
    pub needed: usize,
    /// First terminal error when no spare placement exists.
    pub terminal_error: Option<String>,
}

impl ShardHealth {
    fn complete(&self) -> bool {
        self.needed > 0 && self.open >= self.needed
    }
}

/// Pure index state transition over aggregated shard health. Returns the
/// new state (and error message) when one is due; reapplying the same
/// inputs yields no further transition.
pub(crate) fn next_index_state(
    current: IndexState,
    shards: &[ShardHealth],
) -> Option<(IndexState, Option<String>)> {
    if shards.is_empty() {
        return None;
    }
    let all_complete = shards.iter().all(ShardHealth::complete);
    let first_error = shards
        .iter()
        .find_map(|health| health.terminal_error.clone());

    match current {
        IndexState::Announced => None,
        IndexState::Deploying | IndexState::Replicating => {
            if let Some(message) = first_error {
                Some((IndexState::DeployError, Some(message)))
            } else if all_complete {
                Some((IndexState::Deployed, None))
            } else {
                None
            }
        }
        IndexState::Deployed => {
            if let Some(message) = first_error {
                Some((IndexState::DeployError, Some(message)))
            } else if !all_complete {
                Some((IndexState::Replicating, None))
            } else {
                None
            }
        }
        IndexState::DeployError => None,
    }
}

/// One full idempotent pass: prune dead-node state, clean up removed
/// indexes, place announced indexes, converge deploying/replicating ones.
/// Returns false when this master has been deposed.
async fn reconcile(
    store: &Arc<dyn PathStore>,
    enumerator: &Arc<dyn ShardEnumerator>,
    name: &str,
    registry: &mut TriggerRegistry,
) -> anyhow::Result<bool> {
    match store.read(paths::MASTER).await {
        Ok(token) if token.data == name.as_bytes() => {}
        Ok(_) | Err(StoreError::NotFound(_)) | Err(StoreError::Disconnected) => {
            return Ok(false)
        }
        Err(err) => return Err(err.into()),
    }

    let live: BTreeSet<String> = store.children(paths::NODES).await?.into_iter().collect();
    let index_names: BTreeSet<String> =
        store.children(paths::INDEXES).await?.into_iter().collect();

    // Rebuild the placement table from standing assignments, pruning
    // entries for nodes whose ephemeral descriptor is gone.
    let mut table = PlacementTable::new();
    for node in store.children(paths::NODE_TO_SHARD).await? {
        let shards = match store.children(&paths::node_shards(&node)).await {
            Ok(shards) => shards,
            Err(StoreError::NotFound(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        if live.contains(&node) {
            for shard in shards {
                let owned = paths::shard_index(&shard)
                    .map(|index| index_names.contains(index))
                    .unwrap_or(false);
                if owned {
                    table.assign(&shard, &node);
                } else {
                    // Index was removed; withdraw so the node unloads.
                    let _ = store.delete(&paths::node_shard(&node, &shard)).await;
                }
            }
        } else {
            tracing::info!(node = %node, "pruning assignments of failed node");
            for shard in shards {
                let _ = store.delete(&paths::node_shard(&node, &shard)).await;
                // The node cannot clean its own record any more.
                let _ = store.delete(&paths::shard_node(&shard, &node)).await;
            }
            let _ = store.delete(&paths::node_shards(&node)).await;
        }
    }

    // Deployment trees of removed indexes.
    for shard in store.children(paths::SHARD_TO_NODE).await? {
        let owned = paths::shard_index(&shard)
            .map(|index| index_names.contains(index))
            .unwrap_or(false);
        if !owned {
            let _ = store.delete_recursive(&paths::shard_nodes(&shard)).await;
        }
    }

    let mut watch_paths = HashSet::new();
    for index in &index_names {
        let versioned = match store.read(&paths::index(index)).await {
            Ok(versioned) => versioned,
            Err(StoreError::NotFound(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        let meta: IndexMetaData = match serde_json::from_slice(&versioned.data) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(index = %index, error = %err, "unreadable index record");
                continue;
            }
        };
        match meta.state {
            IndexState::Announced => {
                announce_index(store, enumerator, index, &meta, versioned.version, &mut table, &live)
                    .await?;
            }
            IndexState::Deploying | IndexState::Deployed | IndexState::Replicating => {
                converge_index(
                    store,
                    index,
                    &meta,
                    versioned.version,
                    &mut table,
                    &live,
                    &mut watch_paths,
                )
                .await?;
            }
            IndexState::DeployError => {
                // Parked until an admin removes or redeploys it.
            }
        }
    }
    registry.sync(watch_paths);
    Ok(true)
}

/// Enumerate shards of an announced index, record them, place initial
/// replicas, and move the index to Deploying.
async fn announce_index(
    store: &Arc<dyn PathStore>,
    enumerator: &Arc<dyn ShardEnumerator>,
    index: &str,
    meta: &IndexMetaData,
    meta_version: u64,
    table: &mut PlacementTable,
    live: &BTreeSet<String>,
) -> anyhow::Result<()> {
    let specs = match enumerator.enumerate(&meta.path) {
        Ok(specs) => specs,
        Err(err) => {
            tracing::error!(index = %index, error = %err, "shard enumeration failed");
            let mut failed = meta.clone();
            failed.state = IndexState::DeployError;
            failed.error_message = Some(err.to_string());
            write_index_meta(store, index, &failed, meta_version).await;
            return Ok(());
        }
    };
    tracing::info!(index = %index, shards = specs.len(), replication = meta.replication_level, "deploying index");

    for spec in &specs {
        let shard = paths::shard_name(index, &spec.stem);
        let source = serde_json::to_vec(&ShardSource {
            source: spec.source.clone(),
        })?;
        create_if_absent(store, &paths::index_shard(index, &shard), source.clone()).await?;
        create_if_absent(store, &paths::shard_nodes(&shard), Vec::new()).await?;
        let chosen = crate::placement::plan_missing_replicas(
            table,
            &shard,
            meta.replication_level,
            live,
            &BTreeSet::new(),
        );
        for node in chosen {
            assign_shard(store, &shard, &node, &spec.source).await?;
        }
    }

    let mut deploying = meta.clone();
    deploying.state = IndexState::Deploying;
    deploying.error_message = None;
    write_index_meta(store, index, &deploying, meta_version).await;
    Ok(())
}

/// Keep an index at its replication target and advance its state from the
/// aggregated deployment reports.
async fn converge_index(
    store: &Arc<dyn PathStore>,
    index: &str,
    meta: &IndexMetaData,
    meta_version: u64,
    table: &mut PlacementTable,
    live: &BTreeSet<String>,
    watch_paths: &mut HashSet<TriggerPath>,
) -> anyhow::Result<()> {
    let shards = match store.children(&paths::index(index)).await {
        Ok(shards) => shards,
        Err(StoreError::NotFound(_)) => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let mut health = Vec::with_capacity(shards.len());
    for shard in &shards {
        let source = shard_source(store, index, shard).await?;
        watch_paths.insert(TriggerPath::Children(paths::shard_nodes(shard)));

        let mut open = 0usize;
        let mut errors: BTreeSet<String> = BTreeSet::new();
        let mut first_error: Option<String> = None;
        let records = match store.children(&paths::shard_nodes(shard)).await {
            Ok(records) => records,
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        for node in records {
            let path = paths::shard_node(shard, &node);
            watch_paths.insert(TriggerPath::Data(path.clone()));
            let record = match store.read(&path).await {
                Ok(versioned) => {
                    serde_json::from_slice::<DeployedShard>(&versioned.data).ok()
                }
                Err(_) => None,
            };
            let Some(record) = record else { continue };
            match record.state {
                DeployState::Open if live.contains(&node) => open += 1,
                DeployState::Error => {
                    errors.insert(node.clone());
                    if first_error.is_none() {
                        first_error = record.error_message.clone().or_else(|| {
                            Some(format!("shard '{shard}' failed on node '{node}'"))
                        });
                    }
                }
                _ => {}
            }
        }

        // A node that failed this shard is not placement capacity for it.
        let capacity = live.iter().filter(|node| !errors.contains(*node)).count();
        let needed = meta.replication_level.min(capacity);

        // Top up missing replicas on spare nodes.
        let mut healthy: BTreeSet<String> = table
            .nodes_for(shard)
            .into_iter()
            .filter(|node| !errors.contains(node))
            .collect();
        while healthy.len() < needed {
            let mut exclude = errors.clone();
            exclude.extend(table.nodes_for(shard));
            let Some(node) = choose_replica(table, live, &exclude) else {
                break;
            };
            assign_shard(store, shard, &node, &source).await?;
            table.assign(shard, &node);
            healthy.insert(node);
        }

        let terminal_error = if needed == 0 && !live.is_empty() {
            // Every capable node rejected the shard.
            first_error
        } else if !errors.is_empty() && healthy.len() < needed {
            first_error
        } else {
            None
        };
        health.push(ShardHealth {
            open,
            needed,
            terminal_error,
        });
    }

    if let Some((state, error_message)) = next_index_state(meta.state, &health) {
        tracing::info!(index = %index, from = %meta.state, to = %state, "index state transition");
        let mut updated = meta.clone();
        updated.state = state;
        updated.error_message = error_message;
        write_index_meta(store, index, &updated, meta_version).await;
    }
    Ok(())
}

async fn shard_source(
    store: &Arc<dyn PathStore>,
    index: &str,
    shard: &str,
) -> anyhow::Result<String> {
    let versioned = store.read(&paths::index_shard(index, shard)).await?;
    let spec: ShardSource = serde_json::from_slice(&versioned.data)
        .with_context(|| format!("unreadable shard source for '{shard}'"))?;
    Ok(spec.source)
}

/// Write the assignment entry plus the Assigned record, both create-only so
/// a worker's later progress is never clobbered.
async fn assign_shard(
    store: &Arc<dyn PathStore>,
    shard: &str,
    node: &str,
    source: &str,
) -> anyhow::Result<()> {
    tracing::info!(shard = %shard, node = %node, "assigning shard replica");
    create_if_absent(store, &paths::node_shards(node), Vec::new()).await?;
    let assignment = serde_json::to_vec(&ShardSource {
        source: source.to_string(),
    })?;
    create_if_absent(store, &paths::node_shard(node, shard), assignment).await?;
    create_if_absent(store, &paths::shard_nodes(shard), Vec::new()).await?;
    let record = serde_json::to_vec(&DeployedShard::assigned())?;
    create_if_absent(store, &paths::shard_node(shard, node), record).await?;
    Ok(())
}

async fn create_if_absent(
    store: &Arc<dyn PathStore>,
    path: &str,
    data: Vec<u8>,
) -> Result<(), StoreError> {
    match store.create(path, data, CreateMode::Persistent).await {
        Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Optimistic index-record update; a conflict means another writer (a
/// newer master) got there first, so the change is dropped and the next
/// pass re-evaluates.
async fn write_index_meta(
    store: &Arc<dyn PathStore>,
    index: &str,
    meta: &IndexMetaData,
    expected_version: u64,
) {
    let data = match serde_json::to_vec(meta) {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(index = %index, error = %err, "index record serialize failed");
            return;
        }
    };
    match store
        .compare_and_write(&paths::index(index), data, expected_version)
        .await
    {
        Ok(_) => {}
        Err(StoreError::Conflict { .. }) => {
            tracing::debug!(index = %index, "stale index update rejected");
        }
        Err(err) => {
            tracing::warn!(index = %index, error = %err, "index record write failed");
        }
    }
}
