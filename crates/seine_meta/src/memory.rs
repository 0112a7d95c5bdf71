//! In-memory store backend with real session semantics.
//!
//! One `MemoryStore` is the shared tree; each component opens its own
//! [`MemorySession`]. Ephemeral entries are owned by the creating session
//! and vanish when it closes or expires. `expire()` simulates coordination
//! session loss for tests: owned ephemerals are dropped, watches fire, and
//! the handle reconnects under a fresh session id.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use crate::{
    base_name, parent_path, validate_path, CreateMode, PathStore, SessionEvent, StoreError,
    Versioned, WatchEvent, WatchHandle,
};

struct Entry {
    data: Vec<u8>,
    version: u64,
    mode: CreateMode,
    owner: Option<u64>,
    /// Counter for sequential children created under this entry.
    seq: u64,
}

struct Registration {
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct WatchTable {
    data: HashMap<String, Vec<Registration>>,
    children: HashMap<String, Vec<Registration>>,
    exists: HashMap<String, Vec<Registration>>,
}

struct Inner {
    entries: BTreeMap<String, Entry>,
    watches: WatchTable,
}

/// Shared in-memory tree. Sessions are opened with [`MemoryStore::session`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    next_session: Arc<AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/".to_string(),
            Entry {
                data: Vec::new(),
                version: 0,
                mode: CreateMode::Persistent,
                owner: None,
                seq: 0,
            },
        );
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries,
                watches: WatchTable::default(),
            })),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new session against the shared tree.
    pub fn session(&self) -> MemorySession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (events_tx, _) = broadcast::channel(16);
        MemorySession {
            store: self.clone(),
            session_id: Arc::new(AtomicU64::new(id)),
            events_tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// One client session over a [`MemoryStore`].
pub struct MemorySession {
    store: MemoryStore,
    session_id: Arc<AtomicU64>,
    events_tx: broadcast::Sender<SessionEvent>,
    closed: Arc<AtomicBool>,
}

/// Watch senders collected under the lock, fired after it is released.
type Fired = Vec<(oneshot::Sender<WatchEvent>, WatchEvent)>;

fn take_watches(slot: Option<Vec<Registration>>, fired: &mut Fired) {
    if let Some(regs) = slot {
        for reg in regs {
            fired.push((reg.tx, WatchEvent::Changed));
        }
    }
}

fn notify_entry_changed(watches: &mut WatchTable, path: &str, fired: &mut Fired) {
    take_watches(watches.data.remove(path), fired);
}

fn notify_entry_created_or_deleted(watches: &mut WatchTable, path: &str, fired: &mut Fired) {
    take_watches(watches.data.remove(path), fired);
    take_watches(watches.exists.remove(path), fired);
    take_watches(watches.children.remove(parent_path(path)), fired);
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn child_names(entries: &BTreeMap<String, Entry>, path: &str) -> Vec<String> {
    let prefix = child_prefix(path);
    entries
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter(|(key, _)| !key[prefix.len()..].contains('/'))
        .map(|(key, _)| key[prefix.len()..].to_string())
        .collect()
}

impl MemorySession {
    fn id(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    fn check_connected(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Simulate session loss: drop owned ephemerals, expire owned watches,
    /// then reconnect under a fresh session id. Emits the
    /// Disconnected/Reconnected pair exactly once.
    pub fn expire(&self) {
        let old = self.id();
        let mut fired = self.drop_session_state(old);
        let new = self.store.next_session.fetch_add(1, Ordering::Relaxed);
        self.session_id.store(new, Ordering::Release);
        for (tx, event) in fired.drain(..) {
            let _ = tx.send(event);
        }
        let _ = self.events_tx.send(SessionEvent::Disconnected);
        let _ = self.events_tx.send(SessionEvent::Reconnected);
    }

    /// Close the session for good. Ephemerals are removed; all further
    /// operations fail with `Disconnected`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let old = self.id();
        let mut fired = self.drop_session_state(old);
        for (tx, event) in fired.drain(..) {
            let _ = tx.send(event);
        }
    }

    /// Remove ephemerals and watches owned by `session`, returning the
    /// watch notifications to deliver once the lock is released.
    fn drop_session_state(&self, session: u64) -> Fired {
        let mut inner = self.store.inner.lock().unwrap();
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        let mut fired = Fired::new();
        for path in doomed {
            inner.entries.remove(&path);
            notify_entry_created_or_deleted(&mut inner.watches, &path, &mut fired);
        }
        let watches = &mut inner.watches;
        for table in [&mut watches.data, &mut watches.children, &mut watches.exists] {
            for regs in table.values_mut() {
                let mut kept = Vec::with_capacity(regs.len());
                for reg in regs.drain(..) {
                    if reg.session == session {
                        fired.push((reg.tx, WatchEvent::Expired));
                    } else {
                        kept.push(reg);
                    }
                }
                *regs = kept;
            }
            table.retain(|_, regs| !regs.is_empty());
        }
        fired
    }

    fn with_inner<T>(
        &self,
        op: impl FnOnce(&mut Inner, u64, &mut Fired) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_connected()?;
        let session = self.id();
        let mut fired = Fired::new();
        let result = {
            let mut inner = self.store.inner.lock().unwrap();
            op(&mut inner, session, &mut fired)
        };
        for (tx, event) in fired {
            let _ = tx.send(event);
        }
        result
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl PathStore for MemorySession {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, StoreError> {
        validate_path(path)?;
        if path == "/" {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        self.with_inner(|inner, session, fired| {
            let parent = parent_path(path).to_string();
            let actual = match mode {
                CreateMode::EphemeralSequential => {
                    let parent_entry = inner
                        .entries
                        .get_mut(&parent)
                        .ok_or_else(|| StoreError::NotFound(parent.clone()))?;
                    let seq = parent_entry.seq;
                    parent_entry.seq += 1;
                    format!("{path}{seq:010}")
                }
                _ => {
                    if !inner.entries.contains_key(&parent) {
                        return Err(StoreError::NotFound(parent));
                    }
                    path.to_string()
                }
            };
            if inner.entries.contains_key(&actual) {
                return Err(StoreError::AlreadyExists(actual));
            }
            let owner = match mode {
                CreateMode::Persistent => None,
                CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(session),
            };
            inner.entries.insert(
                actual.clone(),
                Entry {
                    data,
                    version: 0,
                    mode,
                    owner,
                    seq: 0,
                },
            );
            notify_entry_created_or_deleted(&mut inner.watches, &actual, fired);
            Ok(actual)
        })
    }

    async fn read(&self, path: &str) -> Result<Versioned, StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, _, _| {
            inner
                .entries
                .get(path)
                .map(|e| Versioned {
                    data: e.data.clone(),
                    version: e.version,
                })
                .ok_or_else(|| StoreError::NotFound(path.to_string()))
        })
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<u64, StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, _, fired| {
            let entry = inner
                .entries
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            entry.data = data;
            entry.version += 1;
            let version = entry.version;
            notify_entry_changed(&mut inner.watches, path, fired);
            Ok(version)
        })
    }

    async fn compare_and_write(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, _, fired| {
            let entry = inner
                .entries
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            if entry.version != expected_version {
                return Err(StoreError::Conflict {
                    path: path.to_string(),
                    expected: expected_version,
                    actual: entry.version,
                });
            }
            entry.data = data;
            entry.version += 1;
            let version = entry.version;
            notify_entry_changed(&mut inner.watches, path, fired);
            Ok(version)
        })
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, _, fired| {
            if !inner.entries.contains_key(path) {
                return Err(StoreError::NotFound(path.to_string()));
            }
            if !child_names(&inner.entries, path).is_empty() {
                return Err(StoreError::NotEmpty(path.to_string()));
            }
            inner.entries.remove(path);
            notify_entry_created_or_deleted(&mut inner.watches, path, fired);
            Ok(())
        })
    }

    async fn delete_recursive(&self, path: &str) -> Result<(), StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, _, fired| {
            if !inner.entries.contains_key(path) {
                return Err(StoreError::NotFound(path.to_string()));
            }
            let prefix = child_prefix(path);
            let doomed: Vec<String> = inner
                .entries
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .chain(std::iter::once(path.to_string()))
                .collect();
            for victim in doomed {
                inner.entries.remove(&victim);
                notify_entry_created_or_deleted(&mut inner.watches, &victim, fired);
            }
            Ok(())
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, _, _| Ok(inner.entries.contains_key(path)))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, _, _| {
            if !inner.entries.contains_key(path) {
                return Err(StoreError::NotFound(path.to_string()));
            }
            Ok(child_names(&inner.entries, path))
        })
    }

    async fn children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, WatchHandle), StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, session, _| {
            if !inner.entries.contains_key(path) {
                return Err(StoreError::NotFound(path.to_string()));
            }
            let names = child_names(&inner.entries, path);
            let (tx, rx) = oneshot::channel();
            inner
                .watches
                .children
                .entry(path.to_string())
                .or_default()
                .push(Registration { session, tx });
            Ok((names, WatchHandle::new(rx)))
        })
    }

    async fn data_watch(
        &self,
        path: &str,
    ) -> Result<(Option<Versioned>, WatchHandle), StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, session, _| {
            let current = inner.entries.get(path).map(|e| Versioned {
                data: e.data.clone(),
                version: e.version,
            });
            let (tx, rx) = oneshot::channel();
            inner
                .watches
                .data
                .entry(path.to_string())
                .or_default()
                .push(Registration { session, tx });
            Ok((current, WatchHandle::new(rx)))
        })
    }

    async fn exists_watch(&self, path: &str) -> Result<(bool, WatchHandle), StoreError> {
        validate_path(path)?;
        self.with_inner(|inner, session, _| {
            let present = inner.entries.contains_key(path);
            let (tx, rx) = oneshot::channel();
            inner
                .watches
                .exists
                .entry(path.to_string())
                .or_default()
                .push(Registration { session, tx });
            Ok((present, WatchHandle::new(rx)))
        })
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}
