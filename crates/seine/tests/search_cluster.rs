//! Scatter/gather query-plane scenarios.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{alice_corpus, TestCluster};
use seine::client::{ClientConfig, QuerySpec};
use seine::engine::FieldValue;
use seine::error::ClusterError;
use seine::meta::{DeployedShard, NodeDescriptor};
use seine::paths;
use seine_meta::{CreateMode, PathStore};

fn spec(query: &str, indexes: &[&str], limit: usize) -> QuerySpec {
    QuerySpec::new(
        query.as_bytes().to_vec(),
        indexes.iter().map(|s| s.to_string()).collect(),
        limit,
    )
}

#[tokio::test]
async fn wildcard_search_merges_across_indexes() {
    let cluster = TestCluster::start(3).await;
    cluster
        .add_index(
            "books",
            &[("s0", alice_corpus("b0", 4)), ("s1", alice_corpus("b1", 4))],
            2,
        )
        .await;
    cluster
        .add_index(
            "journals",
            &[("s0", alice_corpus("j0", 4)), ("s1", alice_corpus("j1", 4))],
            2,
        )
        .await;

    let client = cluster.client().await;
    let hits = client.search(spec("alice", &["*"], 10)).await.unwrap();

    assert_eq!(hits.total_hits, 16);
    assert_eq!(hits.hits.len(), 10);
    // Scores descend and every (shard, doc) pair is unique.
    assert!(hits
        .hits
        .windows(2)
        .all(|w| w[0].score >= w[1].score));
    let mut seen = std::collections::HashSet::new();
    for hit in &hits.hits {
        assert!(seen.insert((hit.shard.clone(), hit.doc_id)));
    }
}

#[tokio::test]
async fn scores_are_identical_across_replica_choices() {
    let cluster = TestCluster::start(2).await;
    cluster
        .add_index("books", &[("s0", alice_corpus("s0", 6))], 2)
        .await;

    let client = cluster.client().await;
    let first = client.search(spec("alice", &["books"], 6)).await.unwrap();
    let second = client.search(spec("alice", &["books"], 6)).await.unwrap();

    // Global IDF makes scores replica independent even when round-robin
    // lands on the other node.
    let flat = |hits: &seine::client::SearchHits| {
        hits.hits
            .iter()
            .map(|h| (h.shard.clone(), h.doc_id, h.score))
            .collect::<Vec<_>>()
    };
    assert_eq!(flat(&first), flat(&second));
}

#[tokio::test]
async fn sorted_search_merges_by_field() {
    let cluster = TestCluster::start(2).await;
    cluster
        .add_index(
            "books",
            &[("s0", alice_corpus("s0", 3)), ("s1", alice_corpus("s1", 3))],
            1,
        )
        .await;

    let client = cluster.client().await;
    let mut request = spec("alice", &["books"], 6);
    request.sort = Some(seine::engine::SortSpec {
        fields: vec![seine::engine::SortField {
            field: "year".to_string(),
            reverse: true,
        }],
    });
    let hits = client.search(request).await.unwrap();
    assert_eq!(hits.hits.len(), 6);
    let years: Vec<f64> = hits
        .hits
        .iter()
        .map(|hit| match hit.sort_fields.as_ref().unwrap()[0] {
            seine::engine::SortValue::Number(n) => n,
            _ => panic!("expected numeric sort key"),
        })
        .collect();
    assert!(years.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn limit_zero_keeps_total_hits() {
    let cluster = TestCluster::start(1).await;
    cluster
        .add_index("books", &[("s0", alice_corpus("s0", 5))], 1)
        .await;

    let client = cluster.client().await;
    let hits = client.search(spec("alice", &["books"], 0)).await.unwrap();
    assert!(hits.hits.is_empty());
    assert_eq!(hits.total_hits, 5);
}

#[tokio::test]
async fn count_equals_search_total() {
    let cluster = TestCluster::start(2).await;
    cluster
        .add_index(
            "books",
            &[("s0", alice_corpus("s0", 4)), ("s1", alice_corpus("s1", 3))],
            2,
        )
        .await;

    let client = cluster.client().await;
    let count = client
        .count(b"alice", &["books".to_string()], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(count, 7);
}

#[tokio::test]
async fn details_round_trip_one_record_per_hit_in_order() {
    let cluster = TestCluster::start(2).await;
    cluster
        .add_index(
            "books",
            &[("s0", alice_corpus("s0", 4)), ("s1", alice_corpus("s1", 4))],
            1,
        )
        .await;

    let client = cluster.client().await;
    let hits = client.search(spec("alice", &["books"], 5)).await.unwrap();
    assert_eq!(hits.hits.len(), 5);

    let details = client.get_details(&hits.hits, None).await.unwrap();
    assert_eq!(details.len(), hits.hits.len());
    for detail in &details {
        let FieldValue::Text(body) = detail.get("body").expect("stored body field") else {
            panic!("body should be text");
        };
        assert!(body.contains("alice"), "stored fields belong to the hit");
        assert!(detail.contains_key("year"));
    }

    // Field projection narrows the record.
    let projected = client
        .get_details(&hits.hits, Some(&["year".to_string()]))
        .await
        .unwrap();
    assert!(projected.iter().all(|d| d.contains_key("year") && !d.contains_key("body")));
}

#[tokio::test]
async fn queries_fail_with_shard_unavailable_when_no_replicas() {
    let cluster = TestCluster::start(0).await;
    cluster
        .announce_index("books", &[("s0", alice_corpus("s0", 2))], 1)
        .await;
    cluster
        .wait_index_state("books", seine::meta::IndexState::Deploying)
        .await;

    let client = cluster.client().await;
    let err = client
        .search(spec("alice", &["books"], 5))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ShardUnavailable { .. }));
}

#[tokio::test]
async fn single_node_holding_every_shard_serves_queries() {
    let cluster = TestCluster::start(1).await;
    cluster
        .add_index(
            "books",
            &[("s0", alice_corpus("s0", 3)), ("s1", alice_corpus("s1", 3))],
            3,
        )
        .await;

    let client = cluster.client().await;
    let hits = client.search(spec("alice", &["books"], 10)).await.unwrap();
    assert_eq!(hits.total_hits, 6);
    assert_eq!(hits.hits.len(), 6);
}

#[tokio::test]
async fn malformed_query_surfaces_without_retry() {
    let cluster = TestCluster::start(1).await;
    cluster
        .add_index("books", &[("s0", alice_corpus("s0", 2))], 1)
        .await;

    let client = cluster.client().await;
    let err = client.search(spec("title:", &["books"], 5)).await.unwrap_err();
    assert!(matches!(err, ClusterError::MalformedQuery(_)));
}

#[tokio::test]
async fn slow_shard_returns_partial_results_within_deadline() {
    let cluster = TestCluster::start(1).await;
    // 50 docs at 10ms per scanned doc: a full scan would take ~500ms.
    cluster.engine.set_scan_delay("mem://slow/s0", Duration::from_millis(10));
    cluster
        .add_index("slow", &[("s0", alice_corpus("slow", 50))], 1)
        .await;

    let client = cluster
        .client_with(ClientConfig {
            rpc_overhead: Duration::from_millis(40),
            ..ClientConfig::default()
        })
        .await;

    let started = Instant::now();
    let mut request = spec("alice", &["slow"], 10);
    request.timeout = Duration::from_millis(200);
    let hits = client.search(request).await.unwrap();
    let elapsed = started.elapsed();

    // The shard collector gave up at its budget: partial totals, no error.
    assert!(hits.total_hits > 0, "some documents were collected");
    assert!(
        hits.total_hits < 50,
        "partial scan expected, saw {}",
        hits.total_hits
    );
    assert!(
        elapsed < Duration::from_secs(1),
        "deadline was not honored: {elapsed:?}"
    );
}

#[tokio::test]
async fn repeated_filter_hits_the_cache_with_identical_results() {
    let cluster = TestCluster::start(1).await;
    cluster
        .add_index("books", &[("s0", alice_corpus("s0", 6))], 1)
        .await;

    let client = cluster.client().await;
    let mut request = spec("alice", &["books"], 10);
    request.filter = Some(b"body:entry2".to_vec());

    let first = client.search(request.clone()).await.unwrap();
    let second = client.search(request).await.unwrap();

    let (hits, misses) = cluster.nodes[0].node.search().filter_cache_stats();
    assert_eq!(misses, 1, "first use populates the cache");
    assert!(hits >= 1, "second use must hit the cache");

    assert_eq!(first.total_hits, 1);
    assert_eq!(second.total_hits, 1);
    assert_eq!(first.hits[0].doc_id, second.hits[0].doc_id);
}

#[tokio::test]
async fn failed_replica_fails_over_to_the_next_one() {
    let cluster = TestCluster::start(1).await;
    cluster
        .add_index("books", &[("s0", alice_corpus("s0", 3))], 1)
        .await;

    // Forge a second "replica" on a node that is registered but dark: its
    // descriptor points at a dead port. The name sorts first so the sticky
    // cursor picks it before the healthy replica.
    let ghost = "aaa-ghost";
    let descriptor = NodeDescriptor {
        host: "127.0.0.1".to_string(),
        port: 1,
        start_time_ms: 0,
        healthy: true,
        status: "running".to_string(),
    };
    let admin = cluster.admin.clone() as Arc<dyn PathStore>;
    admin
        .create(
            &paths::node(ghost),
            serde_json::to_vec(&descriptor).unwrap(),
            CreateMode::Ephemeral,
        )
        .await
        .unwrap();
    admin
        .create(
            &paths::shard_node("books#s0", ghost),
            serde_json::to_vec(&DeployedShard::open(3)).unwrap(),
            CreateMode::Persistent,
        )
        .await
        .unwrap();

    let client = cluster.client().await;
    let mut request = spec("alice", &["books"], 5);
    request.timeout = Duration::from_secs(2);
    let hits = client.search(request).await.unwrap();
    assert_eq!(hits.total_hits, 3, "query succeeds on the healthy replica");

    // Cleanup so the master does not chase the forged record.
    let _ = admin.delete(&paths::shard_node("books#s0", ghost)).await;
    let _ = admin.delete(&paths::node(ghost)).await;
}
