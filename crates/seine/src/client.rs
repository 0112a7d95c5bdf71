//! Query coordinator: reactive shard map plus two-phase scatter/gather.
//!
//! The client keeps an in-memory view of Open replicas, index layouts, and
//! node addresses, refreshed from watches on the store. A query resolves
//! its index names to shards, picks one replica per shard (sticky
//! round-robin, skipping recently unreachable nodes), fetches global
//! document frequencies, then searches with those frequencies so scores
//! are comparable across shards. Shard-level failures retry on the next
//! replica; a shard with nothing left fails the query.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use seine_meta::{PathStore, StoreError};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::engine::{Document, GlobalFreqs, SortSpec};
use crate::error::ClusterError;
use crate::merge::{self, Hit};
use crate::meta::{DeployState, DeployedShard, NodeDescriptor};
use crate::paths;
use crate::rpc::{NodeClient, SearchRequest};
use crate::subs::{forward_children, TriggerPath, TriggerRegistry};

/// Index-name wildcard resolving to every deployed index.
pub const ALL_INDEXES: &str = "*";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-RPC budget for frequency and detail calls.
    pub rpc_timeout: Duration,
    /// Margin reserved for transport overhead when forwarding the caller
    /// deadline to workers.
    pub rpc_overhead: Duration,
    /// How long a node stays skipped after a failed RPC.
    pub node_quarantine: Duration,
    /// Debounce window for shard-map refreshes.
    pub debounce: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
            rpc_overhead: Duration::from_millis(200),
            node_quarantine: Duration::from_secs(30),
            debounce: Duration::from_millis(20),
        }
    }
}

/// Search parameters beyond the plain query.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub query: Vec<u8>,
    pub filter: Option<Vec<u8>>,
    pub index_names: Vec<String>,
    pub limit: usize,
    pub sort: Option<SortSpec>,
    pub timeout: Duration,
}

impl QuerySpec {
    pub fn new(query: impl Into<Vec<u8>>, index_names: Vec<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            filter: None,
            index_names,
            limit,
            sort: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Globally merged search result.
#[derive(Debug, Clone)]
pub struct SearchHits {
    pub total_hits: u64,
    pub hits: Vec<Hit>,
}

/// Snapshot of cluster state the coordinator routes by.
#[derive(Debug, Default, Clone)]
struct ClusterView {
    /// Shard to nodes currently reporting Open.
    shard_open: HashMap<String, BTreeSet<String>>,
    index_shards: HashMap<String, BTreeSet<String>>,
    node_addrs: HashMap<String, SocketAddr>,
}

pub struct SearchClient {
    config: ClientConfig,
    view: Arc<RwLock<ClusterView>>,
    /// Sticky per-shard replica cursor; advanced on failure.
    affinity: Mutex<HashMap<String, usize>>,
    /// Nodes that recently failed an RPC, with the failure time.
    quarantined: Mutex<HashMap<String, Instant>>,
    refresher: JoinHandle<()>,
}

impl Drop for SearchClient {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

impl SearchClient {
    /// Connect and block until the initial shard-map snapshot is loaded.
    pub async fn connect(
        store: Arc<dyn PathStore>,
        config: ClientConfig,
    ) -> anyhow::Result<Self> {
        paths::ensure_layout(&store)
            .await
            .context("create store layout")?;
        let view = Arc::new(RwLock::new(ClusterView::default()));

        let initial = load_view(&store).await.context("load initial shard map")?;
        *view.write().unwrap() = initial.0;

        let refresher = {
            let store = store.clone();
            let view = view.clone();
            let debounce = config.debounce;
            tokio::spawn(async move {
                refresh_loop(store, view, debounce).await;
            })
        };

        Ok(Self {
            config,
            view,
            affinity: Mutex::new(HashMap::new()),
            quarantined: Mutex::new(HashMap::new()),
            refresher,
        })
    }

    /// Shards currently reporting at least one Open replica.
    pub fn open_shards(&self) -> Vec<String> {
        let view = self.view.read().unwrap();
        let mut shards: Vec<String> = view
            .shard_open
            .iter()
            .filter(|(_, nodes)| !nodes.is_empty())
            .map(|(shard, _)| shard.clone())
            .collect();
        shards.sort();
        shards
    }

    /// Resolve index names (or `*`) to the union of their shards.
    fn resolve_shards(&self, index_names: &[String]) -> Result<Vec<String>, ClusterError> {
        let view = self.view.read().unwrap();
        let mut shards = BTreeSet::new();
        if index_names.iter().any(|name| name == ALL_INDEXES) {
            for set in view.index_shards.values() {
                shards.extend(set.iter().cloned());
            }
        } else {
            for name in index_names {
                let set = view.index_shards.get(name).ok_or_else(|| {
                    ClusterError::ShardUnavailable {
                        shard: name.clone(),
                    }
                })?;
                shards.extend(set.iter().cloned());
            }
        }
        Ok(shards.into_iter().collect())
    }

    fn quarantine(&self, node: &str) {
        self.quarantined
            .lock()
            .unwrap()
            .insert(node.to_string(), Instant::now());
    }

    fn is_quarantined(&self, node: &str) -> bool {
        let quarantined = self.quarantined.lock().unwrap();
        quarantined
            .get(node)
            .map(|since| since.elapsed() < self.config.node_quarantine)
            .unwrap_or(false)
    }

    /// Pick one replica for `shard`, sticky round-robin over the Open set,
    /// skipping quarantined nodes unless nothing else remains, never
    /// revisiting `tried`.
    fn pick_replica(
        &self,
        shard: &str,
        tried: &HashSet<String>,
    ) -> Result<(String, SocketAddr), ClusterError> {
        let view = self.view.read().unwrap();
        let replicas: Vec<String> = view
            .shard_open
            .get(shard)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default();
        drop(view);

        let fresh: Vec<&String> = replicas
            .iter()
            .filter(|node| !tried.contains(*node) && !self.is_quarantined(node))
            .collect();
        let stale: Vec<&String> = replicas
            .iter()
            .filter(|node| !tried.contains(*node))
            .collect();
        let candidates = if fresh.is_empty() { stale } else { fresh };
        if candidates.is_empty() {
            return Err(ClusterError::ShardUnavailable {
                shard: shard.to_string(),
            });
        }

        let cursor = {
            let affinity = self.affinity.lock().unwrap();
            affinity.get(shard).copied().unwrap_or(0)
        };
        let node = candidates[cursor % candidates.len()].clone();
        let addr = {
            let view = self.view.read().unwrap();
            view.node_addrs.get(&node).copied()
        }
        .ok_or_else(|| ClusterError::ShardUnavailable {
            shard: shard.to_string(),
        })?;
        Ok((node, addr))
    }

    fn advance_affinity(&self, shard: &str) {
        let mut affinity = self.affinity.lock().unwrap();
        *affinity.entry(shard.to_string()).or_insert(0) += 1;
    }

    /// Fan one RPC out over a covering set with per-shard failover: group
    /// the shards by chosen replica, call every group in parallel, retry
    /// failed groups shard-by-shard on their next replicas.
    async fn scatter<T, F, Fut>(
        &self,
        shards: &[String],
        timeout: Duration,
        call: F,
    ) -> Result<Vec<T>, ClusterError>
    where
        T: Send + 'static,
        F: Fn(NodeClient, Vec<String>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ClusterError>> + Send + 'static,
    {
        let mut remaining: BTreeSet<String> = shards.iter().cloned().collect();
        let mut tried: HashMap<String, HashSet<String>> = HashMap::new();
        let mut results = Vec::new();

        while !remaining.is_empty() {
            // Covering set for the still-unserved shards.
            let mut groups: HashMap<String, (SocketAddr, Vec<String>)> = HashMap::new();
            for shard in &remaining {
                let shard_tried = tried.entry(shard.clone()).or_default();
                let (node, addr) = self.pick_replica(shard, shard_tried)?;
                groups
                    .entry(node)
                    .or_insert_with(|| (addr, Vec::new()))
                    .1
                    .push(shard.clone());
            }

            let mut calls: JoinSet<(String, Vec<String>, Result<T, ClusterError>)> =
                JoinSet::new();
            for (node, (addr, group)) in groups {
                let client = NodeClient::new(node.clone(), addr, timeout);
                let fut = call(client, group.clone());
                calls.spawn(async move { (node, group, fut.await) });
            }

            while let Some(joined) = calls.join_next().await {
                let Ok((node, group, outcome)) = joined else {
                    continue;
                };
                match outcome {
                    Ok(value) => {
                        results.push(value);
                        for shard in &group {
                            remaining.remove(shard);
                        }
                    }
                    Err(ClusterError::MalformedQuery(message)) => {
                        // Caller error; retrying elsewhere cannot help.
                        return Err(ClusterError::MalformedQuery(message));
                    }
                    Err(err) => {
                        tracing::warn!(
                            node = %node,
                            shards = group.len(),
                            error = %err,
                            "shard rpc failed, trying next replicas"
                        );
                        if matches!(err, ClusterError::RpcTimeout { .. }) {
                            self.quarantine(&node);
                        }
                        for shard in &group {
                            tried.entry(shard.clone()).or_default().insert(node.clone());
                            self.advance_affinity(shard);
                        }
                    }
                }
            }
        }
        Ok(results)
    }

    /// Phase 1: combined global document frequencies for `shards`.
    async fn global_freqs(
        &self,
        query: &[u8],
        shards: &[String],
    ) -> Result<GlobalFreqs, ClusterError> {
        let query = query.to_vec();
        let parts = self
            .scatter(shards, self.config.rpc_timeout, move |client, group| {
                let query = query.clone();
                async move { client.doc_freqs(&query, &group).await }
            })
            .await?;
        let mut combined = GlobalFreqs::default();
        for part in parts {
            combined.merge(part);
        }
        Ok(combined)
    }

    /// Two-phase scatter/gather search over the named indexes.
    pub async fn search(&self, spec: QuerySpec) -> Result<SearchHits, ClusterError> {
        let shards = self.resolve_shards(&spec.index_names)?;
        if shards.is_empty() {
            return Ok(SearchHits {
                total_hits: 0,
                hits: Vec::new(),
            });
        }

        let freqs = self.global_freqs(&spec.query, &shards).await?;

        // Reserve transport overhead out of the caller budget, but never so
        // much that a tight deadline collapses to an unbounded worker search.
        let overhead = self.config.rpc_overhead.min(spec.timeout / 5);
        let worker_timeout = spec.timeout.saturating_sub(overhead);
        let request = SearchRequest {
            query: spec.query.clone(),
            filter: spec.filter.clone(),
            freqs,
            shards: Vec::new(),
            timeout_ms: worker_timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            limit: spec.limit as u64,
            sort: spec.sort.clone(),
        };
        let parts = self
            .scatter(&shards, spec.timeout, move |client, group| {
                let mut request = request.clone();
                request.shards = group;
                async move { client.search(request).await }
            })
            .await?;

        let mut total_hits = 0u64;
        let mut lists = Vec::new();
        for part in parts {
            total_hits += part.total_hits;
            for (shard, entries) in part.by_shard {
                lists.push(
                    entries
                        .into_iter()
                        .map(|entry| Hit {
                            node: part.node.clone(),
                            shard: shard.clone(),
                            doc_id: entry.doc_id,
                            score: entry.score,
                            sort_fields: entry.sort_fields,
                        })
                        .collect(),
                );
            }
        }
        let hits = match &spec.sort {
            Some(sort) => merge::merge_by_sort(lists, sort, spec.limit),
            None => merge::merge_by_score(lists, spec.limit),
        };
        Ok(SearchHits { total_hits, hits })
    }

    /// Total hit count: frequency phase plus a limit-1 search that only
    /// reads `total_hits`.
    pub async fn count(
        &self,
        query: &[u8],
        index_names: &[String],
        timeout: Duration,
    ) -> Result<u64, ClusterError> {
        let hits = self
            .search(QuerySpec {
                query: query.to_vec(),
                filter: None,
                index_names: index_names.to_vec(),
                limit: 1,
                sort: None,
                timeout,
            })
            .await?;
        Ok(hits.total_hits)
    }

    /// Stored fields for previously returned hits, one record per hit in
    /// input order.
    pub async fn get_details(
        &self,
        hits: &[Hit],
        fields: Option<&[String]>,
    ) -> Result<Vec<Document>, ClusterError> {
        // Group by serving node, preserving per-shard id order.
        let mut by_node: HashMap<String, HashMap<String, Vec<u32>>> = HashMap::new();
        for hit in hits {
            by_node
                .entry(hit.node.clone())
                .or_default()
                .entry(hit.shard.clone())
                .or_default()
                .push(hit.doc_id);
        }

        let mut calls: JoinSet<
            Result<(String, HashMap<String, Vec<u32>>, HashMap<String, Vec<Document>>), ClusterError>,
        > = JoinSet::new();
        for (node, doc_ids) in by_node {
            let addr = {
                let view = self.view.read().unwrap();
                view.node_addrs.get(&node).copied()
            };
            let Some(addr) = addr else {
                return Err(ClusterError::RpcTimeout {
                    node: node.clone(),
                    message: "node address unknown".to_string(),
                });
            };
            let client = NodeClient::new(node.clone(), addr, self.config.rpc_timeout);
            let fields = fields.map(<[String]>::to_vec);
            calls.spawn(async move {
                let shards: Vec<String> = doc_ids.keys().cloned().collect();
                let details = client
                    .get_details(&shards, &doc_ids, fields.as_deref())
                    .await?;
                Ok((node, doc_ids, details))
            });
        }

        let mut lookup: HashMap<(String, String, u32), Document> = HashMap::new();
        while let Some(joined) = calls.join_next().await {
            let Ok(outcome) = joined else { continue };
            let (node, doc_ids, details) = outcome?;
            for (shard, ids) in doc_ids {
                let docs = details.get(&shard).cloned().unwrap_or_default();
                for (id, doc) in ids.into_iter().zip(docs) {
                    lookup.insert((node.clone(), shard.clone(), id), doc);
                }
            }
        }

        Ok(hits
            .iter()
            .map(|hit| {
                lookup
                    .remove(&(hit.node.clone(), hit.shard.clone(), hit.doc_id))
                    .unwrap_or_default()
            })
            .collect())
    }
}

/// Read the full routing view plus the watch paths that should trigger the
/// next refresh.
async fn load_view(
    store: &Arc<dyn PathStore>,
) -> Result<(ClusterView, HashSet<TriggerPath>), StoreError> {
    let mut view = ClusterView::default();
    let mut wanted = HashSet::new();

    for node in store.children(paths::NODES).await? {
        let path = paths::node(&node);
        wanted.insert(TriggerPath::Data(path.clone()));
        let Ok(versioned) = store.read(&path).await else {
            continue;
        };
        let Ok(descriptor) = serde_json::from_slice::<NodeDescriptor>(&versioned.data) else {
            continue;
        };
        if let Ok(addr) = descriptor.addr().parse() {
            view.node_addrs.insert(node, addr);
        }
    }

    for index in store.children(paths::INDEXES).await? {
        wanted.insert(TriggerPath::Children(paths::index(&index)));
        let shards = match store.children(&paths::index(&index)).await {
            Ok(shards) => shards,
            Err(StoreError::NotFound(_)) => continue,
            Err(err) => return Err(err),
        };
        view.index_shards
            .insert(index, shards.into_iter().collect());
    }

    for shard in store.children(paths::SHARD_TO_NODE).await? {
        wanted.insert(TriggerPath::Children(paths::shard_nodes(&shard)));
        let nodes = match store.children(&paths::shard_nodes(&shard)).await {
            Ok(nodes) => nodes,
            Err(StoreError::NotFound(_)) => continue,
            Err(err) => return Err(err),
        };
        for node in nodes {
            let record_path = paths::shard_node(&shard, &node);
            wanted.insert(TriggerPath::Data(record_path.clone()));
            let Ok(versioned) = store.read(&record_path).await else {
                continue;
            };
            let Ok(record) = serde_json::from_slice::<DeployedShard>(&versioned.data) else {
                continue;
            };
            if record.state == DeployState::Open && view.node_addrs.contains_key(&node) {
                view.shard_open
                    .entry(shard.clone())
                    .or_default()
                    .insert(node);
            }
        }
    }

    Ok((view, wanted))
}

/// Reactive refresh: any watched change reloads the view.
async fn refresh_loop(
    store: Arc<dyn PathStore>,
    view: Arc<RwLock<ClusterView>>,
    debounce: Duration,
) {
    let (tx, mut rx) = mpsc::channel::<()>(64);
    let _roots: Vec<JoinHandle<()>> = [paths::NODES, paths::INDEXES, paths::SHARD_TO_NODE]
        .into_iter()
        .map(|root| forward_children(store.clone(), root.to_string(), tx.clone()))
        .collect();
    let mut registry = TriggerRegistry::new(store.clone(), tx.clone());

    loop {
        match load_view(&store).await {
            Ok((fresh, wanted)) => {
                *view.write().unwrap() = fresh;
                registry.sync(wanted);
            }
            Err(err) => {
                tracing::debug!(error = %err, "shard map refresh failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        }

        if rx.recv().await.is_none() {
            return;
        }
        tokio::time::sleep(debounce).await;
        while rx.try_recv().is_ok() {}
    }
}
