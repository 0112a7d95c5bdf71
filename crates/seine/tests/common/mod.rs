//! Shared in-process cluster harness for integration tests.
//!
//! Components share one in-memory metadata store but each gets its own
//! session, so a test can expire or close a single component's session to
//! simulate crashes. RPC traffic runs over real TCP on ephemeral ports.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use seine::client::{ClientConfig, SearchClient};
use seine::engine::{Document, FieldValue, MemoryEngine};
use seine::master::{
    start_master, Master, MasterConfig, ShardSpec, StaticShardEnumerator,
};
use seine::meta::{DeployState, DeployedShard, IndexMetaData, IndexState};
use seine::node::{start_node, NodeConfig, WorkerNode};
use seine::paths;
use seine::search::SearchConfig;
use seine_meta::memory::MemorySession;
use seine_meta::{CreateMode, MemoryStore, PathStore};

pub const WAIT: Duration = Duration::from_secs(15);

pub struct TestNode {
    pub node: WorkerNode,
    pub session: Arc<MemorySession>,
}

pub struct TestCluster {
    pub store: MemoryStore,
    pub engine: Arc<MemoryEngine>,
    pub enumerator: Arc<StaticShardEnumerator>,
    pub admin: Arc<MemorySession>,
    pub master: Option<Master>,
    pub master_session: Option<Arc<MemorySession>>,
    pub nodes: Vec<TestNode>,
}

pub fn doc(fields: &[(&str, &str)]) -> Document {
    fields
        .iter()
        .map(|(name, value)| (name.to_string(), FieldValue::Text(value.to_string())))
        .collect()
}

/// `count` docs, each containing the shared term "alice" plus a unique one.
pub fn alice_corpus(tag: &str, count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            doc(&[
                ("body", &format!("alice {tag} entry{i}")[..]),
                ("year", &format!("{}", 1900 + i)[..]),
            ])
        })
        .collect()
}

impl TestCluster {
    pub async fn start(node_count: usize) -> Self {
        let store = MemoryStore::new();
        let engine = MemoryEngine::new();
        let enumerator = StaticShardEnumerator::new();
        let admin = Arc::new(store.session());

        let mut cluster = Self {
            store,
            engine,
            enumerator,
            admin,
            master: None,
            master_session: None,
            nodes: Vec::new(),
        };
        cluster.start_master("master-1").await;
        for _ in 0..node_count {
            cluster.start_node().await;
        }
        cluster
    }

    pub async fn start_master(&mut self, name: &str) {
        let session = Arc::new(self.store.session());
        let master = start_master(
            session.clone() as Arc<dyn PathStore>,
            self.enumerator.clone(),
            MasterConfig {
                name: name.to_string(),
                ..MasterConfig::default()
            },
        )
        .await
        .expect("start master");
        self.master = Some(master);
        self.master_session = Some(session);
    }

    /// Start a stand-by master on its own session and return it.
    pub async fn start_standby(&self, name: &str) -> (Master, Arc<MemorySession>) {
        let session = Arc::new(self.store.session());
        let master = start_master(
            session.clone() as Arc<dyn PathStore>,
            self.enumerator.clone(),
            MasterConfig {
                name: name.to_string(),
                ..MasterConfig::default()
            },
        )
        .await
        .expect("start standby master");
        (master, session)
    }

    pub async fn start_node(&mut self) {
        let session = Arc::new(self.store.session());
        let node = start_node(
            session.clone() as Arc<dyn PathStore>,
            self.engine.clone(),
            NodeConfig {
                deploy_backoff: Duration::from_millis(20),
                search: SearchConfig::default(),
                ..NodeConfig::default()
            },
        )
        .await
        .expect("start node");
        self.nodes.push(TestNode { node, session });
    }

    /// Stop a node and its session for good, as seen from the cluster: the
    /// ephemeral descriptor disappears and the RPC endpoint goes dark.
    pub async fn kill_node(&mut self, index: usize) {
        let TestNode { node, session } = self.nodes.remove(index);
        node.shutdown().await;
        session.close();
    }

    pub fn node_hosting(&self, node_name: &str) -> Option<&TestNode> {
        self.nodes
            .iter()
            .find(|entry| entry.node.name() == node_name)
    }

    /// Register corpora and announce an index; does not wait.
    pub async fn announce_index(
        &self,
        name: &str,
        shard_docs: &[(&str, Vec<Document>)],
        replication: usize,
    ) {
        let index_path = format!("mem://{name}");
        let mut specs = Vec::new();
        for (stem, docs) in shard_docs {
            let source = format!("mem://{name}/{stem}");
            self.engine.register_corpus(&source, docs.clone());
            specs.push(ShardSpec {
                stem: stem.to_string(),
                source,
            });
        }
        self.enumerator.register(&index_path, specs);

        let meta =
            IndexMetaData::announced(index_path, "standard".to_string(), replication);
        paths::ensure_layout(&(self.admin.clone() as Arc<dyn PathStore>))
            .await
            .expect("layout");
        self.admin
            .create(
                &paths::index(name),
                serde_json::to_vec(&meta).unwrap(),
                CreateMode::Persistent,
            )
            .await
            .expect("announce index");
    }

    /// Announce and wait until the index reaches Deployed.
    pub async fn add_index(
        &self,
        name: &str,
        shard_docs: &[(&str, Vec<Document>)],
        replication: usize,
    ) {
        self.announce_index(name, shard_docs, replication).await;
        self.wait_index_state(name, IndexState::Deployed).await;
    }

    pub async fn index_state(&self, name: &str) -> Option<IndexMetaData> {
        let versioned = self.admin.read(&paths::index(name)).await.ok()?;
        serde_json::from_slice(&versioned.data).ok()
    }

    pub async fn wait_index_state(&self, name: &str, state: IndexState) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(meta) = self.index_state(name).await {
                if meta.state == state {
                    return;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "index '{name}' never reached {state}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Deployment records of one shard, keyed by node name.
    pub async fn shard_records(&self, shard: &str) -> BTreeMap<String, DeployedShard> {
        let mut records = BTreeMap::new();
        let Ok(nodes) = self.admin.children(&paths::shard_nodes(shard)).await else {
            return records;
        };
        for node in nodes {
            if let Ok(versioned) = self.admin.read(&paths::shard_node(shard, &node)).await {
                if let Ok(record) = serde_json::from_slice(&versioned.data) {
                    records.insert(node, record);
                }
            }
        }
        records
    }

    pub async fn open_nodes(&self, shard: &str) -> Vec<String> {
        self.shard_records(shard)
            .await
            .into_iter()
            .filter(|(_, record)| record.state == DeployState::Open)
            .map(|(node, _)| node)
            .collect()
    }

    pub async fn wait_open_replicas(&self, shard: &str, expected: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let open = self.open_nodes(shard).await;
            if open.len() == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "shard '{shard}' has {} open replicas, expected {expected}",
                open.len()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn client(&self) -> SearchClient {
        self.client_with(ClientConfig::default()).await
    }

    pub async fn client_with(&self, config: ClientConfig) -> SearchClient {
        let session = Arc::new(self.store.session());
        SearchClient::connect(session as Arc<dyn PathStore>, config)
            .await
            .expect("connect search client")
    }
}
