//! Shard-local search service hosted by every worker node.
//!
//! Per-shard work runs on the blocking pool behind a semaphore bound and
//! is gathered in completion order. A shared ticker drives collector
//! deadlines: each shard search gets `timeout × timeout_percentage` of the
//! caller's budget and returns whatever it collected when that expires.
//! Shard readers are reference counted so an undeploy waits for in-flight
//! searches instead of yanking the reader out from under them.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::engine::{
    Deadline, GlobalFreqs, NoDeadline, ShardReader, ShardSearchResult, Document,
};
use crate::error::ClusterError;
use crate::rpc::{HitEntry, Hits, SearchRequest};

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Fraction of the caller timeout granted to each shard collector.
    pub timeout_percentage: f64,
    /// Upper bound on concurrently searching shards.
    pub parallelism: usize,
    pub filter_cache_enabled: bool,
    pub filter_cache_capacity: usize,
    pub filter_cache_ttl: Duration,
    /// Granularity of the shared deadline ticker.
    pub timer_resolution: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            timeout_percentage: 0.75,
            parallelism: 100,
            filter_cache_enabled: true,
            filter_cache_capacity: 1000,
            filter_cache_ttl: Duration::from_secs(600),
            timer_resolution: Duration::from_millis(20),
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.timeout_percentage) {
            anyhow::bail!(
                "timeout percentage {} out of range; only values between 0 and 1 are allowed",
                self.timeout_percentage
            );
        }
        Ok(())
    }
}

/// Open reader plus in-flight acquisition count.
struct ShardHandle {
    reader: Arc<dyn ShardReader>,
    refs: AtomicUsize,
    idle: Notify,
}

/// Acquired reader; release is tied to drop so every exit path pays it.
struct ReaderGuard {
    reader: Arc<dyn ShardReader>,
    handle: Arc<ShardHandle>,
}

impl ReaderGuard {
    fn acquire(handle: &Arc<ShardHandle>) -> Self {
        handle.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            reader: handle.reader.clone(),
            handle: handle.clone(),
        }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if self.handle.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.handle.idle.notify_waiters();
        }
    }
}

/// Deadline backed by the shared ticker.
struct TickDeadline {
    ticks: Arc<AtomicU64>,
    expires_at: u64,
}

impl Deadline for TickDeadline {
    fn expired(&self) -> bool {
        self.ticks.load(Ordering::Relaxed) >= self.expires_at
    }
}

/// Filter evaluated per shard, cached by filter identity.
struct CachedFilter {
    raw: Vec<u8>,
    by_shard: Mutex<HashMap<String, Arc<HashSet<u32>>>>,
}

impl CachedFilter {
    fn docs_for(
        &self,
        shard: &str,
        reader: &dyn ShardReader,
    ) -> Result<Arc<HashSet<u32>>, ClusterError> {
        if let Some(docs) = self.by_shard.lock().unwrap().get(shard) {
            return Ok(docs.clone());
        }
        let docs = Arc::new(
            reader
                .evaluate_filter(&self.raw)
                .map_err(|err| ClusterError::MalformedQuery(err.to_string()))?,
        );
        self.by_shard
            .lock()
            .unwrap()
            .insert(shard.to_string(), docs.clone());
        Ok(docs)
    }
}

struct FilterCacheEntry {
    filter: Arc<CachedFilter>,
    last_access: Instant,
}

/// Access-expiring LRU of evaluated filters.
struct FilterCache {
    entries: Mutex<lru::LruCache<Vec<u8>, FilterCacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FilterCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(lru::LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get_or_insert(&self, raw: &[u8]) -> Arc<CachedFilter> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(raw) {
            if entry.last_access.elapsed() <= self.ttl {
                entry.last_access = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return entry.filter.clone();
            }
            entries.pop(raw);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let filter = Arc::new(CachedFilter {
            raw: raw.to_vec(),
            by_shard: Mutex::new(HashMap::new()),
        });
        entries.put(
            raw.to_vec(),
            FilterCacheEntry {
                filter: filter.clone(),
                last_access: Instant::now(),
            },
        );
        filter
    }
}

pub struct SearchService {
    node_name: String,
    config: SearchConfig,
    handles: RwLock<HashMap<String, Arc<ShardHandle>>>,
    permits: Arc<Semaphore>,
    ticks: Arc<AtomicU64>,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    filter_cache: Option<FilterCache>,
}

impl SearchService {
    pub fn new(node_name: impl Into<String>, config: SearchConfig) -> Arc<Self> {
        let ticks = Arc::new(AtomicU64::new(0));
        let ticker_ticks = ticks.clone();
        let resolution = config.timer_resolution.max(Duration::from_millis(1));
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(resolution);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                ticker_ticks.fetch_add(1, Ordering::Relaxed);
            }
        });
        let filter_cache = config.filter_cache_enabled.then(|| {
            FilterCache::new(config.filter_cache_capacity, config.filter_cache_ttl)
        });
        Arc::new(Self {
            node_name: node_name.into(),
            permits: Arc::new(Semaphore::new(config.parallelism.max(1))),
            config,
            handles: RwLock::new(HashMap::new()),
            ticks,
            ticker: Mutex::new(Some(ticker)),
            filter_cache,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn add_shard(&self, shard: &str, reader: Arc<dyn ShardReader>) {
        tracing::info!(node = %self.node_name, shard, "shard added to search service");
        self.handles.write().unwrap().insert(
            shard.to_string(),
            Arc::new(ShardHandle {
                reader,
                refs: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        );
    }

    /// Detach a shard and wait for in-flight searches to release it.
    pub async fn remove_shard(&self, shard: &str) {
        let Some(handle) = self.handles.write().unwrap().remove(shard) else {
            return;
        };
        loop {
            let idle = handle.idle.notified();
            if handle.refs.load(Ordering::Acquire) == 0 {
                break;
            }
            idle.await;
        }
        tracing::info!(node = %self.node_name, shard, "shard removed from search service");
    }

    pub fn shards(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn shard_size(&self, shard: &str) -> Option<u64> {
        let handles = self.handles.read().unwrap();
        handles.get(shard).map(|h| h.reader.num_docs())
    }

    /// (hits, misses) of the filter cache since startup.
    pub fn filter_cache_stats(&self) -> (u64, u64) {
        match &self.filter_cache {
            Some(cache) => (
                cache.hits.load(Ordering::Relaxed),
                cache.misses.load(Ordering::Relaxed),
            ),
            None => (0, 0),
        }
    }

    pub fn shutdown(&self) {
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            ticker.abort();
        }
        self.handles.write().unwrap().clear();
    }

    fn acquire(&self, shard: &str) -> Result<ReaderGuard, ClusterError> {
        let handles = self.handles.read().unwrap();
        let handle = handles.get(shard).ok_or_else(|| ClusterError::ShardUnavailable {
            shard: shard.to_string(),
        })?;
        Ok(ReaderGuard::acquire(handle))
    }

    /// Collector budget for one shard given the caller's timeout.
    fn deadline_for(&self, timeout_ms: u64) -> Option<TickDeadline> {
        if timeout_ms == 0 {
            return None;
        }
        let budget_ms = (timeout_ms as f64 * self.config.timeout_percentage).max(1.0);
        let resolution_ms = self.config.timer_resolution.as_millis().max(1) as f64;
        let budget_ticks = (budget_ms / resolution_ms).ceil() as u64;
        Some(TickDeadline {
            ticks: self.ticks.clone(),
            expires_at: self.ticks.load(Ordering::Relaxed) + budget_ticks.max(1),
        })
    }

    /// Sum per-term document frequencies and doc counts over `shards`.
    pub async fn doc_freqs(
        &self,
        query: &[u8],
        shards: &[String],
    ) -> Result<GlobalFreqs, ClusterError> {
        let mut freqs = GlobalFreqs::default();
        for shard in shards {
            let guard = self.acquire(shard)?;
            let parsed = guard
                .reader
                .parse_query(query)
                .map_err(|err| ClusterError::MalformedQuery(err.to_string()))?;
            for term in &parsed.terms {
                freqs.add_term(term, guard.reader.doc_freq(term));
            }
            freqs.add_num_docs(guard.reader.num_docs());
        }
        Ok(freqs)
    }

    pub async fn search(&self, request: SearchRequest) -> Result<Hits, ClusterError> {
        let SearchRequest {
            query,
            filter,
            freqs,
            shards,
            timeout_ms,
            limit,
            sort,
        } = request;
        let limit = limit as usize;

        let filter = match (&self.filter_cache, filter) {
            (Some(cache), Some(raw)) => Some(cache.get_or_insert(&raw)),
            (None, Some(raw)) => Some(Arc::new(CachedFilter {
                raw,
                by_shard: Mutex::new(HashMap::new()),
            })),
            (_, None) => None,
        };

        // Acquire every shard up front so a miss fails the request before
        // any work is spawned.
        let mut guards = Vec::with_capacity(shards.len());
        for shard in &shards {
            guards.push((shard.clone(), self.acquire(shard)?));
        }

        let freqs = Arc::new(freqs);
        let query = Arc::new(query);
        let sort = sort.map(Arc::new);
        let mut tasks: JoinSet<(String, Result<ShardSearchResult, ClusterError>)> =
            JoinSet::new();
        for (shard, guard) in guards {
            let permits = self.permits.clone();
            let deadline = self.deadline_for(timeout_ms);
            let freqs = freqs.clone();
            let query = query.clone();
            let sort = sort.clone();
            let filter = filter.clone();
            tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            shard.clone(),
                            Err(ClusterError::ShardUnavailable { shard }),
                        )
                    }
                };
                let task_shard = shard.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let parsed = guard
                        .reader
                        .parse_query(&query)
                        .map_err(|err| ClusterError::MalformedQuery(err.to_string()))?;
                    let filter_docs = match &filter {
                        Some(cached) => {
                            Some(cached.docs_for(&task_shard, guard.reader.as_ref())?)
                        }
                        None => None,
                    };
                    let result = guard.reader.search(
                        &parsed,
                        &freqs,
                        limit,
                        sort.as_deref(),
                        filter_docs.as_deref(),
                        deadline
                            .as_ref()
                            .map(|d| d as &dyn Deadline)
                            .unwrap_or(&NoDeadline),
                    );
                    drop(guard);
                    Ok(result)
                })
                .await
                .unwrap_or_else(|err| {
                    Err(ClusterError::ShardOpenFailure {
                        shard: shard.clone(),
                        message: format!("search task failed: {err}"),
                    })
                });
                (shard, result)
            });
        }

        let mut hits = Hits {
            total_hits: 0,
            node: self.node_name.clone(),
            by_shard: HashMap::new(),
        };
        while let Some(joined) = tasks.join_next().await {
            let Ok((shard, result)) = joined else {
                continue;
            };
            let result = result?;
            hits.total_hits += result.total_hits;
            let entries = result
                .docs
                .into_iter()
                .map(|doc| HitEntry {
                    score: doc.score,
                    doc_id: doc.doc_id,
                    sort_fields: doc.sort_fields,
                })
                .collect();
            hits.by_shard.insert(shard, entries);
        }
        Ok(hits)
    }

    pub async fn get_details(
        &self,
        shards: &[String],
        doc_ids: &HashMap<String, Vec<u32>>,
        fields: Option<&[String]>,
    ) -> Result<HashMap<String, Vec<Document>>, ClusterError> {
        let mut by_shard = HashMap::new();
        for shard in shards {
            let guard = self.acquire(shard)?;
            let ids = doc_ids.get(shard).cloned().unwrap_or_default();
            let docs = ids
                .iter()
                .map(|&doc_id| {
                    guard
                        .reader
                        .document(doc_id, fields)
                        .unwrap_or_default()
                })
                .collect();
            by_shard.insert(shard.clone(), docs);
        }
        Ok(by_shard)
    }

    /// Total hit count: frequency pass plus a limit-1 search.
    pub async fn result_count(
        &self,
        query: &[u8],
        shards: &[String],
        timeout_ms: u64,
    ) -> Result<u64, ClusterError> {
        let freqs = self.doc_freqs(query, shards).await?;
        let hits = self
            .search(SearchRequest {
                query: query.to_vec(),
                filter: None,
                freqs,
                shards: shards.to_vec(),
                timeout_ms,
                limit: 1,
                sort: None,
            })
            .await?;
        Ok(hits.total_hits)
    }
}

impl Drop for SearchService {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{doc, IndexEngine, MemoryEngine};

    fn service_with_shards(shards: &[(&str, Vec<Document>)]) -> Arc<SearchService> {
        let engine = MemoryEngine::new();
        let service = SearchService::new("test-node", SearchConfig::default());
        for (name, docs) in shards {
            let source = format!("mem://{name}");
            engine.register_corpus(&source, docs.clone());
            let reader = engine.open_shard(name, &source, "standard").unwrap();
            service.add_shard(name, reader);
        }
        service
    }

    fn corpus(prefix: &str, n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| doc(&[("body", &format!("alice {prefix} entry{i}")[..])]))
            .collect()
    }

    #[tokio::test]
    async fn doc_freqs_sum_across_shards() {
        let service = service_with_shards(&[
            ("books#a", corpus("a", 3)),
            ("books#b", corpus("b", 5)),
        ]);
        let shards = service.shards();
        let freqs = service.doc_freqs(b"alice", &shards).await.unwrap();
        assert_eq!(freqs.num_docs, 8);
        assert_eq!(
            freqs
                .doc_freqs
                .get(&("*".to_string(), "alice".to_string()))
                .copied(),
            Some(8)
        );
    }

    #[tokio::test]
    async fn search_returns_per_shard_top_k() {
        let service = service_with_shards(&[
            ("books#a", corpus("a", 4)),
            ("books#b", corpus("b", 2)),
        ]);
        let shards = service.shards();
        let freqs = service.doc_freqs(b"alice", &shards).await.unwrap();
        let hits = service
            .search(SearchRequest {
                query: b"alice".to_vec(),
                filter: None,
                freqs,
                shards: shards.clone(),
                timeout_ms: 1000,
                limit: 3,
                sort: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.total_hits, 6);
        assert_eq!(hits.node, "test-node");
        assert_eq!(hits.by_shard["books#a"].len(), 3);
        assert_eq!(hits.by_shard["books#b"].len(), 2);
    }

    #[tokio::test]
    async fn unknown_shard_is_unavailable() {
        let service = service_with_shards(&[("books#a", corpus("a", 1))]);
        let err = service
            .doc_freqs(b"alice", &["books#missing".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ShardUnavailable { .. }));
    }

    #[tokio::test]
    async fn malformed_query_is_reported() {
        let service = service_with_shards(&[("books#a", corpus("a", 1))]);
        let err = service
            .doc_freqs(b"", &service.shards())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::MalformedQuery(_)));
    }

    #[tokio::test]
    async fn filter_cache_hits_are_counted() {
        let service = service_with_shards(&[("books#a", corpus("a", 4))]);
        let shards = service.shards();
        let freqs = service.doc_freqs(b"alice", &shards).await.unwrap();
        let request = SearchRequest {
            query: b"alice".to_vec(),
            filter: Some(b"body:entry1".to_vec()),
            freqs,
            shards,
            timeout_ms: 1000,
            limit: 10,
            sort: None,
        };
        let first = service.search(request.clone()).await.unwrap();
        assert_eq!(service.filter_cache_stats(), (0, 1));
        let second = service.search(request).await.unwrap();
        assert_eq!(service.filter_cache_stats(), (1, 1));
        assert_eq!(first.total_hits, 1);
        assert_eq!(first.total_hits, second.total_hits);
    }

    #[tokio::test]
    async fn remove_shard_waits_for_inflight_guard() {
        let service = service_with_shards(&[("books#a", corpus("a", 1))]);
        let guard = service.acquire("books#a").unwrap();

        let service_clone = service.clone();
        let remover =
            tokio::spawn(async move { service_clone.remove_shard("books#a").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!remover.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), remover)
            .await
            .expect("remove_shard should finish once the guard drops")
            .unwrap();
    }

    #[tokio::test]
    async fn result_count_reads_total_hits() {
        let service = service_with_shards(&[
            ("books#a", corpus("a", 4)),
            ("books#b", corpus("b", 2)),
        ]);
        let count = service
            .result_count(b"alice", &service.shards(), 1000)
            .await
            .unwrap();
        assert_eq!(count, 6);
    }
}
