// Seine command line: cluster daemons plus the administrative surface.
//
// `start-master` hosts the metadata store and runs the placement master
// (stand-bys connect to an existing store); `start-node` runs a worker.
// The remaining subcommands are one-shot admin or search operations that
// connect to the store, act, and exit with 0 on success, 1 on usage
// errors, and 2 on operation failures.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use seine_meta::{remote, CreateMode, MemoryStore, PathStore, RemoteStore, StoreError};

use seine::client::{ClientConfig, QuerySpec, SearchClient};
use seine::engine::JsonlEngine;
use seine::master::{start_master, FsShardEnumerator, MasterConfig};
use seine::meta::{DeployedShard, IndexMetaData, IndexState, NodeDescriptor};
use seine::node::{start_node, NodeConfig};
use seine::paths;
use seine::search::SearchConfig;

#[derive(Parser)]
#[command(name = "seine", about = "Distributed search cluster", version)]
struct Args {
    /// Metadata store endpoint (host:port).
    #[arg(
        long,
        env = "SEINE_STORE",
        default_value = "127.0.0.1:24630",
        global = true
    )]
    store: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the metadata store and run the placement master.
    StartMaster {
        /// Connect to an existing store as a stand-by instead of hosting it.
        #[arg(long, default_value_t = false)]
        standby: bool,
        /// Master name recorded in the election token.
        #[arg(long, env = "SEINE_MASTER_NAME")]
        name: Option<String>,
    },
    /// Run a worker node serving shard replicas.
    StartNode {
        /// Node name; defaults to host:port after binding.
        #[arg(long, env = "SEINE_NODE_NAME")]
        name: Option<String>,
        #[arg(long, env = "SEINE_NODE_HOST", default_value = "127.0.0.1")]
        host: String,
        /// Search RPC port; 0 picks an ephemeral port.
        #[arg(long, env = "SEINE_NODE_PORT", default_value_t = 0)]
        port: u16,
        /// Shard open attempts before a terminal error record.
        #[arg(long, env = "SEINE_DEPLOY_ATTEMPTS", default_value_t = 3)]
        deploy_attempts: u32,
        /// Base shard-open retry delay (ms), doubled per attempt.
        #[arg(long, env = "SEINE_DEPLOY_BACKOFF_MS", default_value_t = 500)]
        deploy_backoff_ms: u64,
        /// Fraction of the caller timeout granted to each shard collector.
        #[arg(long, env = "SEINE_COLLECTOR_TIMEOUT_PCT", default_value_t = 0.75)]
        collector_timeout_pct: f64,
        /// Upper bound on concurrently searching shards.
        #[arg(long, env = "SEINE_SEARCHER_PARALLELISM", default_value_t = 100)]
        searcher_parallelism: usize,
        #[arg(long, env = "SEINE_FILTER_CACHE_ENABLED", default_value_t = true)]
        filter_cache_enabled: bool,
        #[arg(long, env = "SEINE_FILTER_CACHE_CAPACITY", default_value_t = 1000)]
        filter_cache_capacity: usize,
        /// Filter cache entry lifetime since last access (ms).
        #[arg(long, env = "SEINE_FILTER_CACHE_TTL_MS", default_value_t = 600_000)]
        filter_cache_ttl_ms: u64,
        /// Deadline ticker resolution (ms).
        #[arg(long, env = "SEINE_TIMER_RESOLUTION_MS", default_value_t = 20)]
        timer_resolution_ms: u64,
    },
    /// Announce an index and wait until it is deployed.
    AddIndex {
        name: String,
        /// Index source path; every *.jsonl file or subdirectory is a shard.
        path: String,
        /// Analyzer identifier passed through to the index engine.
        analyzer: String,
        #[arg(default_value_t = 3)]
        replication: usize,
    },
    /// Remove an index; nodes unload its shards.
    RemoveIndex { name: String },
    /// Remove and re-announce an index with its recorded settings.
    RedeployIndex { name: String },
    ListIndexes,
    ListNodes,
    /// List per-replica deploy errors recorded for an index.
    ListErrors { name: String },
    /// Dump the metadata tree.
    ShowStructure,
    /// Search indexes (comma separated, * for all). With a count, hit
    /// details are printed; without, only the total is reported.
    Search {
        index_names: String,
        query: String,
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

async fn connect_store(addr: SocketAddr) -> anyhow::Result<Arc<dyn PathStore>> {
    let store = RemoteStore::connect(addr)
        .await
        .with_context(|| format!("connect to metadata store at {addr}"))?;
    Ok(Arc::new(store))
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::StartMaster { standby, name } => {
            let store: Arc<dyn PathStore> = if standby {
                connect_store(args.store).await?
            } else {
                let hosted = MemoryStore::new();
                let serve_store = hosted.clone();
                let addr = args.store;
                tokio::spawn(async move {
                    if let Err(err) = remote::run(addr, serve_store).await {
                        tracing::error!(error = %err, "metadata store server failed");
                    }
                });
                Arc::new(hosted.session())
            };
            let name = name.unwrap_or_else(|| format!("master-{}", std::process::id()));
            let master = start_master(
                store,
                Arc::new(FsShardEnumerator),
                MasterConfig {
                    name,
                    ..MasterConfig::default()
                },
            )
            .await?;
            tokio::signal::ctrl_c().await?;
            master.shutdown().await;
            Ok(())
        }
        Command::StartNode {
            name,
            host,
            port,
            deploy_attempts,
            deploy_backoff_ms,
            collector_timeout_pct,
            searcher_parallelism,
            filter_cache_enabled,
            filter_cache_capacity,
            filter_cache_ttl_ms,
            timer_resolution_ms,
        } => {
            let store = connect_store(args.store).await?;
            let config = NodeConfig {
                name,
                host,
                port,
                deploy_attempts,
                deploy_backoff: Duration::from_millis(deploy_backoff_ms),
                search: SearchConfig {
                    timeout_percentage: collector_timeout_pct,
                    parallelism: searcher_parallelism,
                    filter_cache_enabled,
                    filter_cache_capacity,
                    filter_cache_ttl: Duration::from_millis(filter_cache_ttl_ms),
                    timer_resolution: Duration::from_millis(timer_resolution_ms),
                },
            };
            let node = start_node(store, JsonlEngine::new(), config).await?;
            tokio::signal::ctrl_c().await?;
            node.shutdown().await;
            Ok(())
        }
        Command::AddIndex {
            name,
            path,
            analyzer,
            replication,
        } => {
            let store = connect_store(args.store).await?;
            add_index(&store, &name, &path, &analyzer, replication).await
        }
        Command::RemoveIndex { name } => {
            let store = connect_store(args.store).await?;
            match store.delete_recursive(&paths::index(&name)).await {
                Ok(()) => {
                    println!("removed index {name}.");
                    Ok(())
                }
                Err(StoreError::NotFound(_)) => anyhow::bail!("unknown index: {name}"),
                Err(err) => Err(err).context("remove index"),
            }
        }
        Command::RedeployIndex { name } => {
            let store = connect_store(args.store).await?;
            let versioned = store
                .read(&paths::index(&name))
                .await
                .map_err(|_| anyhow::anyhow!("index '{name}' not found"))?;
            let meta: IndexMetaData =
                serde_json::from_slice(&versioned.data).context("read index record")?;
            store
                .delete_recursive(&paths::index(&name))
                .await
                .context("remove index")?;
            // Give nodes a moment to unload before re-announcing.
            tokio::time::sleep(Duration::from_secs(5)).await;
            add_index(&store, &name, &meta.path, &meta.analyzer, meta.replication_level)
                .await
        }
        Command::ListIndexes => {
            let store = connect_store(args.store).await?;
            let mut table =
                TextTable::new(&["Name", "State", "Replication", "Analyzer", "Path"]);
            for index in store.children(paths::INDEXES).await.unwrap_or_default() {
                let Ok(versioned) = store.read(&paths::index(&index)).await else {
                    continue;
                };
                let Ok(meta) = serde_json::from_slice::<IndexMetaData>(&versioned.data)
                else {
                    continue;
                };
                table.add_row(&[
                    &index,
                    &meta.state.to_string(),
                    &meta.replication_level.to_string(),
                    &meta.analyzer,
                    &meta.path,
                ]);
            }
            println!("{table}");
            Ok(())
        }
        Command::ListNodes => {
            let store = connect_store(args.store).await?;
            let nodes = store.children(paths::NODES).await.unwrap_or_default();
            let mut healthy_count = 0usize;
            let mut table = TextTable::new(&["Name", "Address", "Healthy", "Status"]);
            for node in &nodes {
                let Ok(versioned) = store.read(&paths::node(node)).await else {
                    continue;
                };
                let Ok(descriptor) =
                    serde_json::from_slice::<NodeDescriptor>(&versioned.data)
                else {
                    continue;
                };
                if descriptor.healthy {
                    healthy_count += 1;
                }
                table.add_row(&[
                    node,
                    &descriptor.addr(),
                    &descriptor.healthy.to_string(),
                    &descriptor.status,
                ]);
            }
            println!("{table}");
            println!("{healthy_count}/{} nodes in service.", nodes.len());
            Ok(())
        }
        Command::ListErrors { name } => {
            let store = connect_store(args.store).await?;
            let shards = store
                .children(&paths::index(&name))
                .await
                .map_err(|_| anyhow::anyhow!("index '{name}' not found"))?;
            let mut table = TextTable::new(&["Shard", "Node", "Error"]);
            for shard in shards {
                let nodes = store
                    .children(&paths::shard_nodes(&shard))
                    .await
                    .unwrap_or_default();
                for node in nodes {
                    let Ok(versioned) = store.read(&paths::shard_node(&shard, &node)).await
                    else {
                        continue;
                    };
                    let Ok(record) = serde_json::from_slice::<DeployedShard>(&versioned.data)
                    else {
                        continue;
                    };
                    if let Some(message) = record.error_message {
                        table.add_row(&[&shard, &node, &message]);
                    }
                }
            }
            println!("{table}");
            Ok(())
        }
        Command::ShowStructure => {
            let store = connect_store(args.store).await?;
            print_structure(&store, "/", 0).await;
            Ok(())
        }
        Command::Search {
            index_names,
            query,
            count,
        } => {
            let store = connect_store(args.store).await?;
            let client = SearchClient::connect(store, ClientConfig::default()).await?;
            let indexes: Vec<String> =
                index_names.split(',').map(|s| s.trim().to_string()).collect();
            let start = Instant::now();
            match count {
                Some(limit) => {
                    let hits = client
                        .search(QuerySpec::new(query.as_bytes().to_vec(), indexes, limit))
                        .await?;
                    println!(
                        "{} hits found in {:.3}sec.",
                        hits.total_hits,
                        start.elapsed().as_secs_f64()
                    );
                    let mut table =
                        TextTable::new(&["Hit", "Node", "Shard", "DocId", "Score"]);
                    for (position, hit) in hits.hits.iter().enumerate() {
                        table.add_row(&[
                            &position.to_string(),
                            &hit.node,
                            &hit.shard,
                            &hit.doc_id.to_string(),
                            &format!("{:.4}", hit.score),
                        ]);
                    }
                    println!("{table}");
                }
                None => {
                    let total = client
                        .count(query.as_bytes(), &indexes, Duration::from_secs(10))
                        .await?;
                    println!(
                        "{total} hits found in {:.3}sec.",
                        start.elapsed().as_secs_f64()
                    );
                }
            }
            Ok(())
        }
    }
}

/// Announce an index and block until it deploys. Announcing an existing
/// name reports and succeeds.
async fn add_index(
    store: &Arc<dyn PathStore>,
    name: &str,
    path: &str,
    analyzer: &str,
    replication: usize,
) -> anyhow::Result<()> {
    if name.trim() == "*" {
        anyhow::bail!("index name '*' is reserved");
    }
    paths::ensure_layout(store).await.context("store layout")?;
    let meta = IndexMetaData::announced(path.to_string(), analyzer.to_string(), replication);
    let data = serde_json::to_vec(&meta)?;
    match store
        .create(&paths::index(name), data, CreateMode::Persistent)
        .await
    {
        Ok(_) => {}
        Err(StoreError::AlreadyExists(_)) => {
            println!("index {name} already exists.");
            return Ok(());
        }
        Err(err) => return Err(err).context("announce index"),
    }

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let Ok(versioned) = store.read(&paths::index(name)).await else {
            continue;
        };
        let Ok(meta) = serde_json::from_slice::<IndexMetaData>(&versioned.data) else {
            continue;
        };
        match meta.state {
            IndexState::Deployed => {
                println!("deployed index {name}.");
                return Ok(());
            }
            IndexState::DeployError => {
                anyhow::bail!(
                    "index {name} not deployed: {}",
                    meta.error_message.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            _ => {
                print!(".");
                use std::io::Write as _;
                std::io::stdout().flush().ok();
            }
        }
    }
}

/// Indented dump of the metadata tree with record previews.
async fn print_structure(store: &Arc<dyn PathStore>, path: &str, depth: usize) {
    let name = if path == "/" { "/" } else { seine_meta::base_name(path) };
    let preview = match store.read(path).await {
        Ok(versioned) if !versioned.data.is_empty() => {
            let text = String::from_utf8_lossy(&versioned.data).replace('\n', " ");
            format!("  {}", text.chars().take(96).collect::<String>())
        }
        _ => String::new(),
    };
    println!("{}{name}{preview}", "  ".repeat(depth));

    let Ok(children) = store.children(path).await else {
        return;
    };
    for child in children {
        let child_path = if path == "/" {
            format!("/{child}")
        } else {
            format!("{path}/{child}")
        };
        Box::pin(print_structure(store, &child_path, depth + 1)).await;
    }
}

/// Minimal aligned text table for the listing commands.
struct TextTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TextTable {
    fn new(header: &[&str]) -> Self {
        Self {
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    fn add_row(&mut self, row: &[&str]) {
        self.rows.push(row.iter().map(|c| c.to_string()).collect());
    }
}

impl std::fmt::Display for TextTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut widths: Vec<usize> = self.header.iter().map(String::len).collect();
        for row in &self.rows {
            for (idx, cell) in row.iter().enumerate() {
                if idx < widths.len() {
                    widths[idx] = widths[idx].max(cell.len());
                }
            }
        }
        let print_row = |f: &mut std::fmt::Formatter<'_>, row: &[String]| {
            write!(f, "| ")?;
            for (idx, cell) in row.iter().enumerate() {
                write!(f, "{cell:width$} | ", width = widths[idx])?;
            }
            writeln!(f)
        };
        print_row(f, &self.header)?;
        let total: usize = widths.iter().map(|w| w + 3).sum::<usize>() + 1;
        writeln!(f, "{}", "=".repeat(total))?;
        for row in &self.rows {
            print_row(f, row)?;
        }
        Ok(())
    }
}
