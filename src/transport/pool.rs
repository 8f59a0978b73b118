//! Per-destination connection pool and credential cache.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Body, Connection, Connector, Route, Status, WireRequest, WireResponse, default_oauth_source};
use crate::error::TransportError;
use crate::types::{NodeConnectionInfo, NodeName};

struct PoolInner {
    connector: Arc<dyn Connector>,
    idle: DashMap<NodeName, Vec<Box<dyn Connection>>>,
    max_idle_per_node: usize,
}

/// Idle connections keyed by node name, created lazily on first use.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, max_idle_per_node: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                idle: DashMap::new(),
                max_idle_per_node,
            }),
        }
    }

    /// Reuses an idle connection to `node` or opens a new one.
    pub async fn acquire(&self, node: &NodeConnectionInfo) -> Result<PooledConnection, TransportError> {
        let reused = self
            .inner
            .idle
            .get_mut(&node.name)
            .and_then(|mut idle| idle.pop());
        let connection = match reused {
            Some(connection) => connection,
            None => {
                debug!("Opening connection to {} at {}", node.name, node.uri);
                self.inner.connector.connect(node).await?
            }
        };
        Ok(PooledConnection {
            connection: Some(connection),
            node: node.name.clone(),
            pool: self.inner.clone(),
            broken: false,
        })
    }

    /// Drops idle connections of a node that left the cluster.
    pub fn remove(&self, name: &str) {
        self.inner.idle.remove(name);
    }

    pub fn idle_count(&self, name: &str) -> usize {
        self.inner.idle.get(name).map(|idle| idle.len()).unwrap_or(0)
    }
}

/// Connection on loan from the pool; returned when dropped unless it broke.
pub struct PooledConnection {
    connection: Option<Box<dyn Connection>>,
    node: NodeName,
    pool: Arc<PoolInner>,
    broken: bool,
}

impl PooledConnection {
    pub async fn send(&mut self, request: WireRequest) -> Result<WireResponse, TransportError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(TransportError::Network("connection already released".into()));
        };
        let result = connection.send(request).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Keeps the connection out of the pool.
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if self.broken || !connection.is_healthy() {
            return;
        }
        let mut idle = self.pool.idle.entry(self.node.clone()).or_default();
        if idle.len() < self.pool.max_idle_per_node {
            idle.push(connection);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ApiKeyRequest {
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct TokenResponse {
    pub token: String,
}

/// Api key and current token of one destination.
struct Authenticator {
    api_key: Option<String>,
    token: RwLock<Option<String>>,
}

/// Authenticators keyed by node name.
#[derive(Clone, Default)]
pub struct AuthenticatorCache {
    entries: Arc<DashMap<NodeName, Arc<Authenticator>>>,
}

impl AuthenticatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, node: &NodeConnectionInfo) -> Arc<Authenticator> {
        self.entries
            .entry(node.name.clone())
            .or_insert_with(|| {
                Arc::new(Authenticator {
                    api_key: node.api_key.clone(),
                    token: RwLock::new(None),
                })
            })
            .clone()
    }

    pub fn token(&self, name: &str) -> Option<String> {
        self.entries
            .get(name)
            .and_then(|auth| auth.token.read().clone())
    }

    pub fn remove(&self, name: &str) {
        self.entries.remove(name);
    }
}

/// Runs requests through the pool, re-authenticating once on Unauthorized.
#[derive(Clone)]
pub struct RequestExecutor {
    pool: ConnectionPool,
    auth: AuthenticatorCache,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl RequestExecutor {
    pub fn new(
        pool: ConnectionPool,
        auth: AuthenticatorCache,
        request_timeout: Duration,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            auth,
            request_timeout,
            stream_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn auth(&self) -> &AuthenticatorCache {
        &self.auth
    }

    pub async fn execute(
        &self,
        node: &NodeConnectionInfo,
        mut request: WireRequest,
    ) -> Result<WireResponse, TransportError> {
        let authenticator = self.auth.get_or_create(node);
        request.credential = authenticator.token.read().clone();
        let retry = request.try_clone();

        let mut connection = self.pool.acquire(node).await?;
        let response = self.send_once(&mut connection, request).await?;
        if response.status != Status::Unauthorized {
            return Ok(response);
        }

        let Some(mut retry) = retry else {
            warn!(
                "Unauthorized streamed request to {}, cannot replay after authentication",
                node.name
            );
            return Err(TransportError::Unauthorized);
        };
        let source = response
            .oauth_source
            .clone()
            .unwrap_or_else(|| default_oauth_source(&node.uri));
        self.authenticate(&mut connection, node, &authenticator, source)
            .await?;

        retry.credential = authenticator.token.read().clone();
        let response = self.send_once(&mut connection, retry).await?;
        match response.status {
            Status::Unauthorized | Status::Forbidden => Err(TransportError::Forbidden(format!(
                "{} rejected credentials after re-authentication: {}",
                node.name,
                response.body_text()
            ))),
            _ => Ok(response),
        }
    }

    async fn send_once(
        &self,
        connection: &mut PooledConnection,
        request: WireRequest,
    ) -> Result<WireResponse, TransportError> {
        let limit = if request.body.is_replayable() {
            self.request_timeout
        } else {
            self.stream_timeout
        };
        match tokio::time::timeout(limit, connection.send(request)).await {
            Ok(result) => result,
            Err(_) => {
                connection.discard();
                Err(TransportError::Timeout)
            }
        }
    }

    async fn authenticate(
        &self,
        connection: &mut PooledConnection,
        node: &NodeConnectionInfo,
        authenticator: &Authenticator,
        source: String,
    ) -> Result<(), TransportError> {
        let Some(api_key) = authenticator.api_key.clone() else {
            return Err(TransportError::Forbidden(format!(
                "{} requires authentication but no api key is configured",
                node.name
            )));
        };
        info!("Authenticating with {} at {}", node.name, source);

        let body = Body::json(&ApiKeyRequest { api_key })?;
        let request = WireRequest::new(Route::OAuth { source }, body);
        let response = self.send_once(connection, request).await?;
        if response.status != Status::Ok {
            return Err(TransportError::Forbidden(format!(
                "{} refused the api key ({}): {}",
                node.name,
                response.status,
                response.body_text()
            )));
        }
        let token: TokenResponse = response.decode()?;
        *authenticator.token.write() = Some(token.token);
        Ok(())
    }
}
