//! Worker node: hosts shard replicas and serves shard-local search RPCs.
//!
//! Startup order matters: the RPC listener opens first, then the ephemeral
//! descriptor is registered (its existence is the liveness signal), then
//! the assignment folder subscription starts, and finally the node marks
//! itself healthy. Assignment changes are diffed against the locally known
//! shard set; added shards walk Fetching → Open/Error with bounded
//! exponential-backoff retries, removed shards wait for in-flight searches
//! before the reader closes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use seine_meta::{watch, CreateMode, PathStore, SessionEvent, StoreError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::engine::IndexEngine;
use crate::meta::{unix_time_ms, DeployedShard, NodeDescriptor, ShardSource};
use crate::paths;
use crate::rpc;
use crate::search::{SearchConfig, SearchService};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node name; defaults to `host:port` after binding.
    pub name: Option<String>,
    pub host: String,
    /// RPC port; 0 picks an ephemeral port.
    pub port: u16,
    /// Attempts per shard before a terminal Error record is left behind.
    pub deploy_attempts: u32,
    /// Base retry delay, doubled per attempt.
    pub deploy_backoff: Duration,
    pub search: SearchConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            host: "127.0.0.1".to_string(),
            port: 0,
            deploy_attempts: 3,
            deploy_backoff: Duration::from_millis(500),
            search: SearchConfig::default(),
        }
    }
}

pub struct WorkerNode {
    name: String,
    addr: SocketAddr,
    store: Arc<dyn PathStore>,
    search: Arc<SearchService>,
    tasks: Vec<JoinHandle<()>>,
}

/// Start a worker node and return once it is registered and serving.
pub async fn start_node(
    store: Arc<dyn PathStore>,
    engine: Arc<dyn IndexEngine>,
    config: NodeConfig,
) -> anyhow::Result<WorkerNode> {
    config.search.validate()?;
    paths::ensure_layout(&store)
        .await
        .context("create store layout")?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("bind rpc listener on {}:{}", config.host, config.port))?;
    let addr = listener.local_addr()?;
    let name = config
        .name
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.host, addr.port()));

    let search = SearchService::new(name.clone(), config.search.clone());
    let rpc_service = search.clone();
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = rpc::serve(listener, rpc_service).await {
            tracing::warn!(error = %err, "search rpc listener stopped");
        }
    }));

    register_node(&store, &name, &config.host, addr.port(), false, "starting")
        .await
        .context("register node descriptor")?;
    ensure_assignment_dir(&store, &name).await?;

    // Assignment folder subscription: diff every snapshot against the
    // locally known shard set, deploy additions, unload removals.
    {
        let store = store.clone();
        let engine = engine.clone();
        let search = search.clone();
        let name = name.clone();
        let config = config.clone();
        tasks.push(tokio::spawn(async move {
            let mut known: HashSet<String> = HashSet::new();
            let mut sub = watch::subscribe_children(store.clone(), paths::node_shards(&name));
            while let Some(assigned) = sub.recv().await {
                let assigned: HashSet<String> = assigned.into_iter().collect();
                let added: Vec<String> =
                    assigned.difference(&known).cloned().collect();
                let removed: Vec<String> =
                    known.difference(&assigned).cloned().collect();
                for shard in added {
                    deploy_shard(&store, &engine, &search, &name, &shard, &config).await;
                    known.insert(shard);
                }
                for shard in removed {
                    undeploy_shard(&store, &search, &name, &shard).await;
                    known.remove(&shard);
                }
            }
        }));
    }

    // Session recovery: the ephemeral descriptor died with the old session,
    // so re-register and re-announce what is actually open here.
    {
        let store = store.clone();
        let search = search.clone();
        let name = name.clone();
        let host = config.host.clone();
        let port = addr.port();
        let mut events = store.session_events();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Reconnected) => {
                        tracing::info!(node = %name, "session restored, re-registering");
                        if let Err(err) =
                            register_node(&store, &name, &host, port, true, "running").await
                        {
                            tracing::warn!(node = %name, error = %err, "re-register failed");
                            continue;
                        }
                        let _ = ensure_assignment_dir(&store, &name).await;
                        for shard in search.shards() {
                            let size = search.shard_size(&shard).unwrap_or(0);
                            if let Err(err) = publish_record(
                                &store,
                                &shard,
                                &name,
                                &DeployedShard::open(size),
                            )
                            .await
                            {
                                tracing::warn!(
                                    node = %name,
                                    shard = %shard,
                                    error = %err,
                                    "failed to re-announce shard"
                                );
                            }
                        }
                    }
                    Ok(SessionEvent::Disconnected) => {
                        tracing::warn!(node = %name, "store session lost");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }));
    }

    // Startup complete: flip the descriptor to healthy.
    register_node(&store, &name, &config.host, addr.port(), true, "running")
        .await
        .context("mark node healthy")?;
    tracing::info!(node = %name, addr = %addr, "worker node started");

    Ok(WorkerNode {
        name,
        addr,
        store,
        search,
        tasks,
    })
}

impl WorkerNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn search(&self) -> &Arc<SearchService> {
        &self.search
    }

    /// Graceful shutdown: deregister, give in-flight RPCs a short grace,
    /// close shard readers, stop background tasks.
    pub async fn shutdown(self) {
        let _ = self.store.delete(&paths::node(&self.name)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        for task in &self.tasks {
            task.abort();
        }
        self.search.shutdown();
        tracing::info!(node = %self.name, "worker node stopped");
    }
}

/// Create or overwrite the ephemeral node descriptor. A leftover entry
/// from a previous incarnation under the same name is replaced.
async fn register_node(
    store: &Arc<dyn PathStore>,
    name: &str,
    host: &str,
    port: u16,
    healthy: bool,
    status: &str,
) -> Result<(), StoreError> {
    let descriptor = NodeDescriptor {
        host: host.to_string(),
        port,
        start_time_ms: unix_time_ms(),
        healthy,
        status: status.to_string(),
    };
    let data = serde_json::to_vec(&descriptor).map_err(|err| StoreError::Io(err.to_string()))?;
    let path = paths::node(name);
    match store
        .create(&path, data.clone(), CreateMode::Ephemeral)
        .await
    {
        Ok(_) => Ok(()),
        Err(StoreError::AlreadyExists(_)) => {
            // Same-session update or stale incarnation; a write covers both.
            store.write(&path, data).await.map(|_| ())
        }
        Err(err) => Err(err),
    }
}

async fn ensure_assignment_dir(
    store: &Arc<dyn PathStore>,
    name: &str,
) -> anyhow::Result<()> {
    match store
        .create(&paths::node_shards(name), Vec::new(), CreateMode::Persistent)
        .await
    {
        Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
        Err(err) => Err(err).context("create assignment folder"),
    }
}

/// Create or overwrite this node's deployment record for `shard`.
async fn publish_record(
    store: &Arc<dyn PathStore>,
    shard: &str,
    node: &str,
    record: &DeployedShard,
) -> Result<(), StoreError> {
    let dir = paths::shard_nodes(shard);
    match store.create(&dir, Vec::new(), CreateMode::Persistent).await {
        Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
        Err(err) => return Err(err),
    }
    let path = paths::shard_node(shard, node);
    let data = serde_json::to_vec(record).map_err(|err| StoreError::Io(err.to_string()))?;
    match store.write(&path, data.clone()).await {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound(_)) => {
            match store.create(&path, data.clone(), CreateMode::Persistent).await {
                Ok(_) => Ok(()),
                Err(StoreError::AlreadyExists(_)) => store.write(&path, data).await.map(|_| ()),
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

/// Fetch and open one assigned shard, reporting progress through the
/// deployment record.
async fn deploy_shard(
    store: &Arc<dyn PathStore>,
    engine: &Arc<dyn IndexEngine>,
    search: &Arc<SearchService>,
    node: &str,
    shard: &str,
    config: &NodeConfig,
) {
    let source = match store.read(&paths::node_shard(node, shard)).await {
        Ok(versioned) => match serde_json::from_slice::<ShardSource>(&versioned.data) {
            Ok(spec) => spec.source,
            Err(err) => {
                tracing::warn!(node, shard, error = %err, "unreadable shard assignment");
                return;
            }
        },
        // Assignment withdrawn before we got to it.
        Err(StoreError::NotFound(_)) => return,
        Err(err) => {
            tracing::warn!(node, shard, error = %err, "failed to read shard assignment");
            return;
        }
    };
    let analyzer = index_analyzer(store, shard).await;

    if let Err(err) = publish_record(store, shard, node, &DeployedShard::fetching()).await {
        tracing::warn!(node, shard, error = %err, "failed to publish fetching record");
    }

    let attempts = config.deploy_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 0..attempts {
        let open_engine = engine.clone();
        let open_shard = shard.to_string();
        let open_source = source.clone();
        let open_analyzer = analyzer.clone();
        let opened = tokio::task::spawn_blocking(move || {
            open_engine.open_shard(&open_shard, &open_source, &open_analyzer)
        })
        .await;

        match opened {
            Ok(Ok(reader)) => {
                let size = reader.num_docs();
                search.add_shard(shard, reader);
                if let Err(err) =
                    publish_record(store, shard, node, &DeployedShard::open(size)).await
                {
                    tracing::warn!(node, shard, error = %err, "failed to publish open record");
                }
                tracing::info!(node, shard, docs = size, "shard deployed");
                return;
            }
            Ok(Err(err)) => last_error = err.to_string(),
            Err(err) => last_error = format!("open task failed: {err}"),
        }
        tracing::warn!(
            node,
            shard,
            attempt = attempt + 1,
            attempts,
            error = %last_error,
            "shard open failed"
        );
        if attempt + 1 < attempts {
            tokio::time::sleep(config.deploy_backoff * 2u32.pow(attempt)).await;
        }
    }

    // Terminal: leave the error record for administrative inspection.
    if let Err(err) =
        publish_record(store, shard, node, &DeployedShard::failed(last_error.clone())).await
    {
        tracing::warn!(node, shard, error = %err, "failed to publish error record");
    }
    tracing::error!(node, shard, error = %last_error, "shard deploy failed terminally");
}

async fn undeploy_shard(
    store: &Arc<dyn PathStore>,
    search: &Arc<SearchService>,
    node: &str,
    shard: &str,
) {
    search.remove_shard(shard).await;
    match store.delete(&paths::shard_node(shard, node)).await {
        Ok(()) | Err(StoreError::NotFound(_)) => {}
        Err(err) => {
            tracing::warn!(node, shard, error = %err, "failed to delete deployment record");
        }
    }
    tracing::info!(node, shard, "shard unloaded");
}

/// Analyzer named by the owning index, or a default when unreadable.
async fn index_analyzer(store: &Arc<dyn PathStore>, shard: &str) -> String {
    let Some(index) = paths::shard_index(shard) else {
        return "standard".to_string();
    };
    match store.read(&paths::index(index)).await {
        Ok(versioned) => serde_json::from_slice::<crate::meta::IndexMetaData>(&versioned.data)
            .map(|meta| meta.analyzer)
            .unwrap_or_else(|_| "standard".to_string()),
        Err(_) => "standard".to_string(),
    }
}
