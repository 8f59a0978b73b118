//! Send/receive abstraction between nodes.
//!
//! A request is a [`Route`] plus a [`Body`]; a reply is a [`Status`] plus a JSON body.
//! Physical bindings implement [`Connector`] / [`Connection`]; the in-process
//! [`MemoryNetwork`] is one of them.

mod memory;
mod pool;
mod sender;
mod server;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::codec::SnapshotStream;
use crate::error::{CodecError, TransportError};
use crate::message::AppendEntriesRequest;
use crate::types::{NodeConnectionInfo, NodeName, TopologyId};

pub use memory::{MemoryNetwork, MemoryNetworkConfig};
pub use pool::{AuthenticatorCache, ConnectionPool, PooledConnection, RequestExecutor};
pub use sender::{TransportOptions, TransportSender};
pub use server::{RequestHandler, ServerAuth};

/// JSON header of an AppendEntries request; the entries follow in the binary encoding.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AppendEntriesHeader {
    #[serde(flatten)]
    pub request: AppendEntriesRequest,
    pub entries_count: u64,
}

/// Consensus endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRoute {
    RequestVote,
    AppendEntries,
    CanInstallSnapshot,
    InstallSnapshot,
    TimeoutNow,
    DisconnectedFromCluster,
}

impl RaftRoute {
    fn name(&self) -> &'static str {
        match self {
            RaftRoute::RequestVote => "requestVote",
            RaftRoute::AppendEntries => "appendEntries",
            RaftRoute::CanInstallSnapshot => "canInstallSnapshot",
            RaftRoute::InstallSnapshot => "installSnapshot",
            RaftRoute::TimeoutNow => "timeoutNow",
            RaftRoute::DisconnectedFromCluster => "disconnectedFromCluster",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Destination of a request, rendered into a path by [`Route::path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Raft { route: RaftRoute, from: NodeName, term: u64 },
    /// Exchange of an api key for a token at `source`.
    OAuth { source: String },
    Join,
    CanJoin { topology_id: TopologyId },
    Leave { name: NodeName },
    ClusterConfiguration,
    DatabaseUpdate { name: String },
    DatabaseDelete { name: String, hard_delete: bool },
}

impl Route {
    pub fn method(&self) -> Method {
        match self {
            Route::Raft { .. } | Route::OAuth { .. } | Route::Join => Method::Post,
            Route::CanJoin { .. } | Route::Leave { .. } => Method::Get,
            Route::ClusterConfiguration | Route::DatabaseUpdate { .. } => Method::Put,
            Route::DatabaseDelete { .. } => Method::Delete,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Route::Raft { route, from, term } => {
                format!("raft/{}?from={}&term={}", route.name(), from, term)
            }
            Route::OAuth { source } => source.clone(),
            Route::Join => "admin/cluster/join".to_string(),
            Route::CanJoin { topology_id } => {
                format!("admin/cluster/canJoin?topologyId={}", topology_id)
            }
            Route::Leave { name } => format!("admin/cluster/leave?name={}", name),
            Route::ClusterConfiguration => "commands/cluster/configuration".to_string(),
            Route::DatabaseUpdate { name } => format!("commands/cluster/database/{}", name),
            Route::DatabaseDelete { name, hard_delete } => {
                format!(
                    "commands/cluster/database/{}?hardDelete={}",
                    name, hard_delete
                )
            }
        }
    }

    pub fn is_admin(&self) -> bool {
        !matches!(self, Route::Raft { .. } | Route::OAuth { .. })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.method(), self.path())
    }
}

pub enum Body {
    Empty,
    Json(Bytes),
    /// JSON header followed by binary payload.
    Binary { header: Bytes, payload: Bytes },
    /// JSON header followed by a framed chunk stream. Cannot be replayed.
    Stream { header: Bytes, chunks: SnapshotStream },
}

impl Body {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        Ok(Body::Json(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// The JSON part of the body; empty for [`Body::Empty`].
    pub fn header(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Json(bytes) => bytes,
            Body::Binary { header, .. } | Body::Stream { header, .. } => header,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(self.header())?)
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, Body::Stream { .. })
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Json(bytes) => write!(f, "Json({} bytes)", bytes.len()),
            Body::Binary { header, payload } => write!(
                f,
                "Binary(header {} bytes, payload {} bytes)",
                header.len(),
                payload.len()
            ),
            Body::Stream { header, .. } => write!(f, "Stream(header {} bytes)", header.len()),
        }
    }
}

#[derive(Debug)]
pub struct WireRequest {
    pub route: Route,
    pub body: Body,
    pub credential: Option<String>,
}

impl WireRequest {
    pub fn new(route: Route, body: Body) -> Self {
        Self {
            route,
            body,
            credential: None,
        }
    }

    /// Copy used to resend after re-authentication; `None` for streamed bodies.
    pub fn try_clone(&self) -> Option<Self> {
        let body = match &self.body {
            Body::Empty => Body::Empty,
            Body::Json(bytes) => Body::Json(bytes.clone()),
            Body::Binary { header, payload } => Body::Binary {
                header: header.clone(),
                payload: payload.clone(),
            },
            Body::Stream { .. } => return None,
        };
        Some(Self {
            route: self.route.clone(),
            body,
            credential: self.credential.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotModified,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    /// The peer processed the request and rejected it on protocol grounds.
    NotAcceptable,
    Conflict,
    InternalServerError,
    ServiceUnavailable,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NotModified => 304,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::NotAcceptable => 406,
            Status::Conflict => 409,
            Status::InternalServerError => 500,
            Status::ServiceUnavailable => 503,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.code(), self)
    }
}

#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: Status,
    /// Where to authenticate, set on Unauthorized replies.
    pub oauth_source: Option<String>,
    pub body: Bytes,
}

impl WireResponse {
    pub fn empty(status: Status) -> Self {
        Self {
            status,
            oauth_source: None,
            body: Bytes::new(),
        }
    }

    pub fn json<T: Serialize>(status: Status, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                oauth_source: None,
                body: Bytes::from(body),
            },
            Err(err) => Self::error(Status::InternalServerError, "Serialization", &err.to_string()),
        }
    }

    /// Error body in the `{"Type", "Message", "Error"}` shape administrative clients parse.
    pub fn error(status: Status, kind: &str, message: &str) -> Self {
        let body = serde_json::json!({
            "Type": kind,
            "Message": message,
            "Error": format!("{}: {}", kind, message),
        });
        Self {
            status,
            oauth_source: None,
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Default token endpoint of a node.
pub fn default_oauth_source(uri: &str) -> String {
    format!("{}/OAuth/API-Key", uri.trim_end_matches('/'))
}

/// One established channel to a node. Requests on it are sequential.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&mut self, request: WireRequest) -> Result<WireResponse, TransportError>;

    /// Broken connections are not returned to the pool.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Opens connections to nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &NodeConnectionInfo) -> Result<Box<dyn Connection>, TransportError>;
}
