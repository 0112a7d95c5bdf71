//! Wire protocol between the query coordinator and worker nodes.
//!
//! Length-delimited bincode frames over TCP, one request per connection.
//! The coordinator closes the connection to cancel; the worker observes
//! closure while a request is in flight and abandons the work.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::engine::{Document, GlobalFreqs, SortSpec, SortValue};
use crate::error::ClusterError;
use crate::search::SearchService;

/// One per-shard scored entry on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitEntry {
    pub score: f32,
    pub doc_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_fields: Option<Vec<SortValue>>,
}

/// Search response: total hit count, the serving node, and the per-shard
/// top-K lists (each already ordered). The coordinator performs the global
/// merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hits {
    pub total_hits: u64,
    pub node: String,
    pub by_shard: HashMap<String, Vec<HitEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<u8>>,
    pub freqs: GlobalFreqs,
    pub shards: Vec<String>,
    pub timeout_ms: u64,
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeRequest {
    DocFreqs {
        query: Vec<u8>,
        shards: Vec<String>,
    },
    Search(SearchRequest),
    GetDetails {
        shards: Vec<String>,
        doc_ids: HashMap<String, Vec<u32>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Vec<String>>,
    },
    ResultCount {
        query: Vec<u8>,
        shards: Vec<String>,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcErrorKind {
    MalformedQuery,
    ShardUnavailable { shard: String },
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeResponse {
    DocFreqs(GlobalFreqs),
    Search(Hits),
    Details {
        by_shard: HashMap<String, Vec<Document>>,
    },
    Count(u64),
    Error {
        kind: RpcErrorKind,
        message: String,
    },
}

fn encode<T: Serialize>(value: &T) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> anyhow::Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Convert a service error to its wire form.
fn error_response(err: &ClusterError) -> NodeResponse {
    let kind = match err {
        ClusterError::MalformedQuery(_) => RpcErrorKind::MalformedQuery,
        ClusterError::ShardUnavailable { shard } => RpcErrorKind::ShardUnavailable {
            shard: shard.clone(),
        },
        _ => RpcErrorKind::Internal,
    };
    NodeResponse::Error {
        kind,
        message: err.to_string(),
    }
}

/// Serve search RPCs until aborted.
pub async fn serve(listener: TcpListener, service: Arc<SearchService>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true).ok();
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(socket, service).await {
                tracing::debug!(peer = %peer, error = %err, "search connection closed");
            }
        });
    }
}

async fn serve_connection(
    socket: TcpStream,
    service: Arc<SearchService>,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let request: NodeRequest = decode(&frame)?;
        let service = service.clone();
        let mut handler = tokio::spawn(async move { handle(service, request).await });

        // Poll the connection while the request runs so a client that gave
        // up (closed the socket) cancels the in-flight work.
        let response = tokio::select! {
            result = &mut handler => match result {
                Ok(response) => response,
                Err(err) => NodeResponse::Error {
                    kind: RpcErrorKind::Internal,
                    message: format!("handler failed: {err}"),
                },
            },
            closed = framed.next() => {
                handler.abort();
                match closed {
                    None | Some(Err(_)) => return Ok(()),
                    // Pipelined second request is not part of the protocol.
                    Some(Ok(_)) => anyhow::bail!("unexpected pipelined frame"),
                }
            }
        };
        framed.send(encode(&response)?).await?;
    }
    Ok(())
}

async fn handle(service: Arc<SearchService>, request: NodeRequest) -> NodeResponse {
    match request {
        NodeRequest::DocFreqs { query, shards } => {
            match service.doc_freqs(&query, &shards).await {
                Ok(freqs) => NodeResponse::DocFreqs(freqs),
                Err(err) => error_response(&err),
            }
        }
        NodeRequest::Search(request) => match service.search(request).await {
            Ok(hits) => NodeResponse::Search(hits),
            Err(err) => error_response(&err),
        },
        NodeRequest::GetDetails {
            shards,
            doc_ids,
            fields,
        } => match service.get_details(&shards, &doc_ids, fields.as_deref()).await {
            Ok(by_shard) => NodeResponse::Details { by_shard },
            Err(err) => error_response(&err),
        },
        NodeRequest::ResultCount {
            query,
            shards,
            timeout_ms,
        } => match service.result_count(&query, &shards, timeout_ms).await {
            Ok(count) => NodeResponse::Count(count),
            Err(err) => error_response(&err),
        },
    }
}

/// Client for one worker node's search RPCs. Connections are dialed per
/// call and closed by dropping, which doubles as cancellation.
#[derive(Clone, Debug)]
pub struct NodeClient {
    node: String,
    addr: SocketAddr,
    timeout: Duration,
}

impl NodeClient {
    pub fn new(node: impl Into<String>, addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            node: node.into(),
            addr,
            timeout: timeout.max(Duration::from_millis(1)),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    async fn call(&self, request: &NodeRequest) -> Result<NodeResponse, ClusterError> {
        let rpc_timeout = |message: String| ClusterError::RpcTimeout {
            node: self.node.clone(),
            message,
        };
        let exchange = async {
            let socket = TcpStream::connect(self.addr)
                .await
                .map_err(|err| rpc_timeout(format!("connect {}: {err}", self.addr)))?;
            socket.set_nodelay(true).ok();
            let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
            let bytes = encode(request)
                .map_err(|err| rpc_timeout(format!("encode request: {err}")))?;
            framed
                .send(bytes)
                .await
                .map_err(|err| rpc_timeout(format!("send request: {err}")))?;
            let frame = framed
                .next()
                .await
                .ok_or_else(|| rpc_timeout("connection closed before response".to_string()))?
                .map_err(|err| rpc_timeout(format!("read response: {err}")))?;
            decode::<NodeResponse>(&frame)
                .map_err(|err| rpc_timeout(format!("decode response: {err}")))
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| rpc_timeout(format!("timed out after {:?}", self.timeout)))??;

        match response {
            NodeResponse::Error { kind, message } => Err(match kind {
                RpcErrorKind::MalformedQuery => ClusterError::MalformedQuery(message),
                RpcErrorKind::ShardUnavailable { shard } => {
                    ClusterError::ShardUnavailable { shard }
                }
                RpcErrorKind::Internal => rpc_timeout(message),
            }),
            other => Ok(other),
        }
    }

    pub async fn doc_freqs(
        &self,
        query: &[u8],
        shards: &[String],
    ) -> Result<GlobalFreqs, ClusterError> {
        match self
            .call(&NodeRequest::DocFreqs {
                query: query.to_vec(),
                shards: shards.to_vec(),
            })
            .await?
        {
            NodeResponse::DocFreqs(freqs) => Ok(freqs),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<Hits, ClusterError> {
        match self.call(&NodeRequest::Search(request)).await? {
            NodeResponse::Search(hits) => Ok(hits),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn get_details(
        &self,
        shards: &[String],
        doc_ids: &HashMap<String, Vec<u32>>,
        fields: Option<&[String]>,
    ) -> Result<HashMap<String, Vec<Document>>, ClusterError> {
        match self
            .call(&NodeRequest::GetDetails {
                shards: shards.to_vec(),
                doc_ids: doc_ids.clone(),
                fields: fields.map(<[String]>::to_vec),
            })
            .await?
        {
            NodeResponse::Details { by_shard } => Ok(by_shard),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn result_count(
        &self,
        query: &[u8],
        shards: &[String],
        timeout_ms: u64,
    ) -> Result<u64, ClusterError> {
        match self
            .call(&NodeRequest::ResultCount {
                query: query.to_vec(),
                shards: shards.to_vec(),
                timeout_ms,
            })
            .await?
        {
            NodeResponse::Count(count) => Ok(count),
            other => Err(self.unexpected(&other)),
        }
    }

    fn unexpected(&self, response: &NodeResponse) -> ClusterError {
        ClusterError::RpcTimeout {
            node: self.node.clone(),
            message: format!("unexpected response variant: {response:?}"),
        }
    }
}
