//! Event-trigger plumbing shared by the master and the query coordinator.
//!
//! Both components are reducers: every relevant store change funnels into
//! one trigger channel, and the consumer re-reads the state it cares about.
//! The registry manages the dynamic set of per-shard and per-record
//! subscriptions that grows and shrinks with the cluster.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use seine_meta::{watch, PathStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Forward every children change of `path` as a unit trigger.
pub(crate) fn forward_children(
    store: Arc<dyn PathStore>,
    path: String,
    tx: mpsc::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sub = watch::subscribe_children(store, path);
        while sub.recv().await.is_some() {
            if tx.send(()).await.is_err() {
                return;
            }
        }
    })
}

/// Forward every data change of `path` as a unit trigger.
pub(crate) fn forward_data(
    store: Arc<dyn PathStore>,
    path: String,
    tx: mpsc::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sub = watch::subscribe_data(store, path);
        while sub.recv().await.is_some() {
            if tx.send(()).await.is_err() {
                return;
            }
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TriggerPath {
    Children(String),
    Data(String),
}

/// Dynamic set of trigger subscriptions, reconciled against the paths the
/// consumer currently cares about.
pub(crate) struct TriggerRegistry {
    store: Arc<dyn PathStore>,
    tx: mpsc::Sender<()>,
    tasks: HashMap<TriggerPath, JoinHandle<()>>,
}

impl TriggerRegistry {
    pub fn new(store: Arc<dyn PathStore>, tx: mpsc::Sender<()>) -> Self {
        Self {
            store,
            tx,
            tasks: HashMap::new(),
        }
    }

    /// Start missing subscriptions, stop ones no longer wanted.
    pub fn sync(&mut self, wanted: HashSet<TriggerPath>) {
        self.tasks.retain(|path, task| {
            if wanted.contains(path) {
                true
            } else {
                task.abort();
                false
            }
        });
        for path in wanted {
            if self.tasks.contains_key(&path) {
                continue;
            }
            let task = match &path {
                TriggerPath::Children(p) => {
                    forward_children(self.store.clone(), p.clone(), self.tx.clone())
                }
                TriggerPath::Data(p) => {
                    forward_data(self.store.clone(), p.clone(), self.tx.clone())
                }
            };
            self.tasks.insert(path, task);
        }
    }

    pub fn shutdown(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

impl Drop for TriggerRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
