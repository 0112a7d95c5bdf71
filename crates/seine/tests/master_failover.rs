//! Master election and failover scenarios.

mod common;

use std::time::Duration;

use common::{alice_corpus, TestCluster};
use seine::meta::IndexState;
use seine::paths;
use seine_meta::PathStore;

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + common::WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn standby_completes_deploy_after_active_master_dies() {
    let mut cluster = TestCluster::start(0).await;
    wait_until("master-1 active", || {
        cluster.master.as_ref().unwrap().is_active()
    })
    .await;

    // Mid-flight deploy: announced with no capacity, so it parks in
    // Deploying under master-1.
    cluster
        .announce_index("books", &[("s0", alice_corpus("s0", 3))], 2)
        .await;
    cluster.wait_index_state("books", IndexState::Deploying).await;

    let (standby, _standby_session) = cluster.start_standby("master-2").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!standby.is_active(), "stand-by must not act while the token holds");

    cluster.master.take().unwrap().shutdown().await;
    wait_until("standby takes over", || standby.is_active()).await;

    cluster.start_node().await;
    cluster.start_node().await;
    cluster.wait_index_state("books", IndexState::Deployed).await;
    cluster.wait_open_replicas("books#s0", 2).await;
    standby.shutdown().await;
}

#[tokio::test]
async fn session_loss_deactivates_then_reelects() {
    let cluster = TestCluster::start(1).await;
    let master = cluster.master.as_ref().unwrap();
    wait_until("master active", || master.is_active()).await;

    cluster.master_session.as_ref().unwrap().expire();

    // The token died with the session; the same process re-elects itself
    // after its session reconnects.
    wait_until("master re-elected", || master.is_active()).await;
    let deadline = tokio::time::Instant::now() + common::WAIT;
    loop {
        if let Ok(token) = cluster.admin.read(paths::MASTER).await {
            if token.data == b"master-1" {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "election token was not re-created"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn deploy_survives_master_failover_with_nodes_running() {
    let mut cluster = TestCluster::start(2).await;
    cluster
        .add_index("books", &[("s0", alice_corpus("s0", 3))], 2)
        .await;

    let (standby, _session) = cluster.start_standby("master-2").await;
    cluster.master.take().unwrap().shutdown().await;
    wait_until("standby takes over", || standby.is_active()).await;

    // Standing assignments survive failover; a new index deploys under the
    // new master.
    cluster
        .add_index("more", &[("s0", alice_corpus("more", 2))], 2)
        .await;
    cluster.wait_open_replicas("books#s0", 2).await;
    cluster.wait_open_replicas("more#s0", 2).await;
    standby.shutdown().await;
}
