//! Continuous subscriptions built on one-shot watches.
//!
//! The underlying store arms watches once; these helpers re-arm inside the
//! same dispatch turn so consumers observe a continuous stream. Each
//! subscription is served by its own task, which keeps delivery serial per
//! subscription while different subscriptions run concurrently. Delivery
//! is at-least-once across reconnects; consumers must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::{PathStore, SessionEvent, StoreError, Versioned, WatchEvent};

/// Delay before retrying a subscription whose target path is missing or
/// whose store call failed for a non-session reason.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Stream the child set of `path`. The current snapshot is delivered
/// immediately, then again after every change. The subscription ends when
/// the receiver is dropped.
pub fn subscribe_children(
    store: Arc<dyn PathStore>,
    path: impl Into<String>,
) -> mpsc::Receiver<Vec<String>> {
    let path = path.into();
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        // Subscribed up front so session events raised while this task is
        // parked on a watch are buffered rather than missed.
        let mut events = store.session_events();
        loop {
            match store.children_watch(&path).await {
                Ok((names, watch)) => {
                    if tx.send(names).await.is_err() {
                        return;
                    }
                    match watch.fired().await {
                        WatchEvent::Changed => continue,
                        WatchEvent::Expired => {
                            if await_reconnected(&mut events).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(StoreError::Disconnected) => {
                    if await_reconnected(&mut events).await.is_err() {
                        return;
                    }
                }
                Err(StoreError::NotFound(_)) => {
                    // Parent not created yet; poll until it appears.
                    if tx.is_closed() {
                        return;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "children subscription error");
                    if tx.is_closed() {
                        return;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    });
    rx
}

/// Stream the data of `path` (`None` while absent), initial snapshot first.
pub fn subscribe_data(
    store: Arc<dyn PathStore>,
    path: impl Into<String>,
) -> mpsc::Receiver<Option<Versioned>> {
    let path = path.into();
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut events = store.session_events();
        loop {
            match store.data_watch(&path).await {
                Ok((current, watch)) => {
                    if tx.send(current).await.is_err() {
                        return;
                    }
                    match watch.fired().await {
                        WatchEvent::Changed => continue,
                        WatchEvent::Expired => {
                            if await_reconnected(&mut events).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(StoreError::Disconnected) => {
                    if await_reconnected(&mut events).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "data subscription error");
                    if tx.is_closed() {
                        return;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    });
    rx
}

/// Block until the session reports `Reconnected`. Errors only when the
/// session event channel is gone, which means the store handle is dead.
/// A buffered stale `Reconnected` merely causes one harmless early re-arm.
async fn await_reconnected(
    events: &mut broadcast::Receiver<SessionEvent>,
) -> Result<(), ()> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Reconnected) => return Ok(()),
            Ok(SessionEvent::Disconnected) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CreateMode, MemoryStore};

    #[tokio::test]
    async fn children_subscription_replays_after_change() {
        let store = MemoryStore::new();
        let sess: Arc<dyn PathStore> = Arc::new(store.session());
        sess.create("/dir", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        let mut sub = subscribe_children(sess.clone(), "/dir");
        assert!(sub.recv().await.unwrap().is_empty());

        sess.create("/dir/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap(), ["a"]);

        sess.create("/dir/b", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn children_subscription_waits_for_missing_parent() {
        let store = MemoryStore::new();
        let sess: Arc<dyn PathStore> = Arc::new(store.session());
        let mut sub = subscribe_children(sess.clone(), "/late");

        tokio::time::sleep(Duration::from_millis(50)).await;
        sess.create("/late", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert!(sub.recv().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn data_subscription_sees_writes_and_deletes() {
        let store = MemoryStore::new();
        let sess: Arc<dyn PathStore> = Arc::new(store.session());
        sess.create("/item", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let mut sub = subscribe_data(sess.clone(), "/item");
        assert_eq!(sub.recv().await.unwrap().unwrap().data, b"v0");

        sess.write("/item", b"v1".to_vec()).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().unwrap().data, b"v1");

        sess.delete("/item").await.unwrap();
        assert!(sub.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subscription_survives_session_expiry() {
        let store = MemoryStore::new();
        let sess = Arc::new(store.session());
        sess.create("/dir", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        let mut sub = subscribe_children(sess.clone() as Arc<dyn PathStore>, "/dir");
        assert!(sub.recv().await.unwrap().is_empty());

        // Expiry fires the armed watch as Expired; the subscription waits
        // for Reconnected and re-arms, replaying the snapshot at least once.
        sess.expire();
        let replay = sub.recv().await.unwrap();
        assert!(replay.is_empty());

        let other = store.session();
        other
            .create("/dir/kid", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let mut latest = sub.recv().await.unwrap();
        while latest.is_empty() {
            latest = sub.recv().await.unwrap();
        }
        assert_eq!(latest, ["kid"]);
    }
}
