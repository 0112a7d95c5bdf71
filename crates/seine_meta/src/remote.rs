//! TCP remoting for the metadata store.
//!
//! The master process hosts the authoritative [`MemoryStore`] and serves it
//! over length-delimited bincode frames; nodes, clients, and admin tools
//! connect with [`RemoteStore`]. A server session is bound to its TCP
//! connection, so a dropped connection kills the session and its ephemeral
//! entries. The client reconnects in the background under a fresh session
//! and surfaces exactly one Disconnected/Reconnected event pair per outage.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    CreateMode, MemoryStore, PathStore, SessionEvent, StoreError, Versioned, WatchEvent,
    WatchHandle,
};

/// Delay between client reconnect attempts, doubled up to [`RECONNECT_MAX`].
const RECONNECT_BASE: Duration = Duration::from_millis(200);
const RECONNECT_MAX: Duration = Duration::from_secs(5);
/// Window for the initial connection before `RemoteStore::connect` fails.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
enum StoreRequest {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Read {
        path: String,
    },
    Write {
        path: String,
        data: Vec<u8>,
    },
    CompareAndWrite {
        path: String,
        data: Vec<u8>,
        expected_version: u64,
    },
    Delete {
        path: String,
    },
    DeleteRecursive {
        path: String,
    },
    Exists {
        path: String,
    },
    Children {
        path: String,
    },
    ChildrenWatch {
        path: String,
    },
    DataWatch {
        path: String,
    },
    ExistsWatch {
        path: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum StoreReply {
    Created(String),
    Data(Versioned),
    Version(u64),
    Unit,
    Bool(bool),
    Names(Vec<String>),
    NamesWatch { names: Vec<String>, watch_id: u64 },
    DataWatch {
        current: Option<Versioned>,
        watch_id: u64,
    },
    BoolWatch { value: bool, watch_id: u64 },
    Failed(StoreError),
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientFrame {
    request_id: u64,
    request: StoreRequest,
}

#[derive(Debug, Serialize, Deserialize)]
enum ServerFrame {
    Reply { request_id: u64, reply: StoreReply },
    WatchFired { watch_id: u64, event: WatchEvent },
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, StoreError> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|err| StoreError::Io(err.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|err| StoreError::Io(err.to_string()))
}

/// Serve `store` on `addr` until the task is aborted.
pub async fn run(addr: SocketAddr, store: MemoryStore) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metadata store listening");
    run_on(listener, store).await
}

/// Serve `store` on an already-bound listener (tests bind port 0 first).
pub async fn run_on(listener: TcpListener, store: MemoryStore) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true).ok();
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(socket, store).await {
                tracing::debug!(peer = %peer, error = %err, "store connection closed");
            }
        });
    }
}

async fn serve_connection(socket: TcpStream, store: MemoryStore) -> anyhow::Result<()> {
    let session = Arc::new(store.session());
    let framed = Framed::new(socket, LengthDelimitedCodec::new());
    let (mut sink, mut stream) = framed.split();

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let bytes = match encode(&frame) {
                Ok(bytes) => bytes,
                Err(_) => break,
            };
            if sink.send(bytes).await.is_err() {
                break;
            }
        }
    });

    let mut next_watch_id = 1u64;
    while let Some(frame) = stream.next().await {
        let frame = frame?;
        let ClientFrame {
            request_id,
            request,
        } = decode(&frame)?;
        let reply = handle_request(&session, request, &mut next_watch_id, &out_tx).await;
        if out_tx
            .send(ServerFrame::Reply { request_id, reply })
            .await
            .is_err()
        {
            break;
        }
    }

    // Connection gone: the session dies with it, releasing ephemerals.
    session.close();
    writer.abort();
    Ok(())
}

/// Forward a one-shot watch to the connection as a `WatchFired` frame.
fn spawn_watch_forwarder(
    watch: WatchHandle,
    watch_id: u64,
    out_tx: &mpsc::Sender<ServerFrame>,
) {
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let event = watch.fired().await;
        let _ = out_tx.send(ServerFrame::WatchFired { watch_id, event }).await;
    });
}

async fn handle_request(
    session: &Arc<crate::memory::MemorySession>,
    request: StoreRequest,
    next_watch_id: &mut u64,
    out_tx: &mpsc::Sender<ServerFrame>,
) -> StoreReply {
    let result = match request {
        StoreRequest::Create { path, data, mode } => session
            .create(&path, data, mode)
            .await
            .map(StoreReply::Created),
        StoreRequest::Read { path } => session.read(&path).await.map(StoreReply::Data),
        StoreRequest::Write { path, data } => {
            session.write(&path, data).await.map(StoreReply::Version)
        }
        StoreRequest::CompareAndWrite {
            path,
            data,
            expected_version,
        } => session
            .compare_and_write(&path, data, expected_version)
            .await
            .map(StoreReply::Version),
        StoreRequest::Delete { path } => session.delete(&path).await.map(|_| StoreReply::Unit),
        StoreRequest::DeleteRecursive { path } => session
            .delete_recursive(&path)
            .await
            .map(|_| StoreReply::Unit),
        StoreRequest::Exists { path } => session.exists(&path).await.map(StoreReply::Bool),
        StoreRequest::Children { path } => {
            session.children(&path).await.map(StoreReply::Names)
        }
        StoreRequest::ChildrenWatch { path } => {
            match session.children_watch(&path).await {
                Ok((names, watch)) => {
                    let watch_id = *next_watch_id;
                    *next_watch_id += 1;
                    spawn_watch_forwarder(watch, watch_id, out_tx);
                    Ok(StoreReply::NamesWatch { names, watch_id })
                }
                Err(err) => Err(err),
            }
        }
        StoreRequest::DataWatch { path } => match session.data_watch(&path).await {
            Ok((current, watch)) => {
                let watch_id = *next_watch_id;
                *next_watch_id += 1;
                spawn_watch_forwarder(watch, watch_id, out_tx);
                Ok(StoreReply::DataWatch { current, watch_id })
            }
            Err(err) => Err(err),
        },
        StoreRequest::ExistsWatch { path } => match session.exists_watch(&path).await {
            Ok((value, watch)) => {
                let watch_id = *next_watch_id;
                *next_watch_id += 1;
                spawn_watch_forwarder(watch, watch_id, out_tx);
                Ok(StoreReply::BoolWatch { value, watch_id })
            }
            Err(err) => Err(err),
        },
    };
    result.unwrap_or_else(StoreReply::Failed)
}

struct ClientShared {
    addr: SocketAddr,
    pending: Mutex<HashMap<u64, oneshot::Sender<StoreReply>>>,
    watches: Mutex<HashMap<u64, oneshot::Sender<WatchEvent>>>,
    out_tx: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    events_tx: broadcast::Sender<SessionEvent>,
    next_request: AtomicU64,
}

impl ClientShared {
    /// Tear down per-connection state after a connection loss.
    fn fail_connection(&self) {
        *self.out_tx.lock().unwrap() = None;
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(StoreReply::Failed(StoreError::Disconnected));
        }
        let watches: Vec<_> = self.watches.lock().unwrap().drain().collect();
        for (_, tx) in watches {
            let _ = tx.send(WatchEvent::Expired);
        }
    }
}

/// Store client connected to a remote [`MemoryStore`] server.
#[derive(Clone)]
pub struct RemoteStore {
    shared: Arc<ClientShared>,
}

impl RemoteStore {
    /// Connect, retrying for a bounded window, and start the background
    /// reconnect supervisor.
    pub async fn connect(addr: SocketAddr) -> Result<Self, StoreError> {
        let (events_tx, _) = broadcast::channel(16);
        let shared = Arc::new(ClientShared {
            addr,
            pending: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            out_tx: Mutex::new(None),
            events_tx,
            next_request: AtomicU64::new(1),
        });

        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        let socket = loop {
            match TcpStream::connect(addr).await {
                Ok(socket) => break socket,
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StoreError::Io(format!(
                            "store at {addr} unreachable: {err}"
                        )));
                    }
                    tokio::time::sleep(RECONNECT_BASE).await;
                }
            }
        };
        start_io(&shared, socket);

        let supervisor = Arc::downgrade(&shared);
        tokio::spawn(async move { supervise(supervisor).await });

        Ok(Self { shared })
    }

    async fn request(&self, request: StoreRequest) -> Result<StoreReply, StoreError> {
        let out_tx = self
            .shared
            .out_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(StoreError::Disconnected)?;
        let request_id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(request_id, tx);

        if out_tx
            .send(ClientFrame {
                request_id,
                request,
            })
            .await
            .is_err()
        {
            self.shared.pending.lock().unwrap().remove(&request_id);
            return Err(StoreError::Disconnected);
        }
        match rx.await {
            Ok(StoreReply::Failed(err)) => Err(err),
            Ok(reply) => Ok(reply),
            Err(_) => Err(StoreError::Disconnected),
        }
    }

    fn register_watch(&self, watch_id: u64) -> WatchHandle {
        let (tx, rx) = oneshot::channel();
        self.shared.watches.lock().unwrap().insert(watch_id, tx);
        WatchHandle::new(rx)
    }
}

/// Spin up the read/write tasks for a fresh connection. Both tasks hold
/// only weak references so the connection is torn down once every
/// `RemoteStore` clone is gone.
fn start_io(shared: &Arc<ClientShared>, socket: TcpStream) {
    socket.set_nodelay(true).ok();
    let framed = Framed::new(socket, LengthDelimitedCodec::new());
    let (mut sink, mut stream) = framed.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(64);
    *shared.out_tx.lock().unwrap() = Some(out_tx);

    // Writer: exits when the last handle drops (channel closes) or on a
    // socket error; dropping the sink releases its half of the stream.
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let bytes = match encode(&frame) {
                Ok(bytes) => bytes,
                Err(_) => break,
            };
            if sink.send(bytes).await.is_err() {
                break;
            }
        }
    });

    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        loop {
            let frame = match tokio::time::timeout(Duration::from_millis(500), stream.next())
                .await
            {
                // Periodically check whether anyone still needs this session.
                Err(_) => {
                    if weak.upgrade().is_none() {
                        return;
                    }
                    continue;
                }
                Ok(Some(Ok(frame))) => frame,
                Ok(_) => break,
            };
            let frame: ServerFrame = match decode(&frame) {
                Ok(frame) => frame,
                Err(_) => break,
            };
            let Some(shared) = weak.upgrade() else { return };
            match frame {
                ServerFrame::Reply { request_id, reply } => {
                    if let Some(tx) = shared.pending.lock().unwrap().remove(&request_id) {
                        let _ = tx.send(reply);
                    }
                }
                ServerFrame::WatchFired { watch_id, event } => {
                    if let Some(tx) = shared.watches.lock().unwrap().remove(&watch_id) {
                        let _ = tx.send(event);
                    }
                }
            }
        }
        if let Some(shared) = weak.upgrade() {
            shared.fail_connection();
            let _ = shared.events_tx.send(SessionEvent::Disconnected);
        }
    });
}

/// Background reconnect loop. Runs while any `RemoteStore` clone is alive.
async fn supervise(shared: Weak<ClientShared>) {
    loop {
        // Wait for the current connection to drop. Subscribing before the
        // connectivity check avoids missing a racing Disconnected event.
        {
            let Some(strong) = shared.upgrade() else { return };
            let mut events = strong.events_tx.subscribe();
            let connected = strong.out_tx.lock().unwrap().is_some();
            drop(strong);
            if connected {
                match events.recv().await {
                    Ok(SessionEvent::Disconnected) => {}
                    Ok(SessionEvent::Reconnected) => continue,
                    Err(_) => {
                        tokio::time::sleep(RECONNECT_BASE).await;
                        continue;
                    }
                }
            }
        }

        let mut backoff = RECONNECT_BASE;
        loop {
            let Some(strong) = shared.upgrade() else { return };
            match TcpStream::connect(strong.addr).await {
                Ok(socket) => {
                    start_io(&strong, socket);
                    let _ = strong.events_tx.send(SessionEvent::Reconnected);
                    tracing::info!(addr = %strong.addr, "store session re-established");
                    break;
                }
                Err(err) => {
                    tracing::debug!(addr = %strong.addr, error = %err, "store reconnect failed");
                    drop(strong);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                }
            }
        }
    }
}

macro_rules! expect_reply {
    ($reply:expr, $variant:ident) => {
        match $reply {
            StoreReply::$variant(value) => Ok(value),
            other => Err(StoreError::Io(format!(
                "unexpected store reply: {other:?}"
            ))),
        }
    };
}

#[async_trait]
impl PathStore for RemoteStore {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, StoreError> {
        let reply = self
            .request(StoreRequest::Create {
                path: path.to_string(),
                data,
                mode,
            })
            .await?;
        expect_reply!(reply, Created)
    }

    async fn read(&self, path: &str) -> Result<Versioned, StoreError> {
        let reply = self
            .request(StoreRequest::Read {
                path: path.to_string(),
            })
            .await?;
        expect_reply!(reply, Data)
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<u64, StoreError> {
        let reply = self
            .request(StoreRequest::Write {
                path: path.to_string(),
                data,
            })
            .await?;
        expect_reply!(reply, Version)
    }

    async fn compare_and_write(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let reply = self
            .request(StoreRequest::CompareAndWrite {
                path: path.to_string(),
                data,
                expected_version,
            })
            .await?;
        expect_reply!(reply, Version)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let reply = self
            .request(StoreRequest::Delete {
                path: path.to_string(),
            })
            .await?;
        match reply {
            StoreReply::Unit => Ok(()),
            other => Err(StoreError::Io(format!("unexpected store reply: {other:?}"))),
        }
    }

    async fn delete_recursive(&self, path: &str) -> Result<(), StoreError> {
        let reply = self
            .request(StoreRequest::DeleteRecursive {
                path: path.to_string(),
            })
            .await?;
        match reply {
            StoreReply::Unit => Ok(()),
            other => Err(StoreError::Io(format!("unexpected store reply: {other:?}"))),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let reply = self
            .request(StoreRequest::Exists {
                path: path.to_string(),
            })
            .await?;
        expect_reply!(reply, Bool)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let reply = self
            .request(StoreRequest::Children {
                path: path.to_string(),
            })
            .await?;
        expect_reply!(reply, Names)
    }

    async fn children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, WatchHandle), StoreError> {
        let reply = self
            .request(StoreRequest::ChildrenWatch {
                path: path.to_string(),
            })
            .await?;
        match reply {
            StoreReply::NamesWatch { names, watch_id } => {
                Ok((names, self.register_watch(watch_id)))
            }
            other => Err(StoreError::Io(format!("unexpected store reply: {other:?}"))),
        }
    }

    async fn data_watch(
        &self,
        path: &str,
    ) -> Result<(Option<Versioned>, WatchHandle), StoreError> {
        let reply = self
            .request(StoreRequest::DataWatch {
                path: path.to_string(),
            })
            .await?;
        match reply {
            StoreReply::DataWatch { current, watch_id } => {
                Ok((current, self.register_watch(watch_id)))
            }
            other => Err(StoreError::Io(format!("unexpected store reply: {other:?}"))),
        }
    }

    async fn exists_watch(&self, path: &str) -> Result<(bool, WatchHandle), StoreError> {
        let reply = self
            .request(StoreRequest::ExistsWatch {
                path: path.to_string(),
            })
            .await?;
        match reply {
            StoreReply::BoolWatch { value, watch_id } => {
                Ok((value, self.register_watch(watch_id)))
            }
            other => Err(StoreError::Io(format!("unexpected store reply: {other:?}"))),
        }
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }
}
