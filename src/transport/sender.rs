//! Fire-and-forget outbound side of the consensus protocol.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::{
    AppendEntriesHeader, AuthenticatorCache, Body, ConnectionPool, Connector, RaftRoute, RequestExecutor, Route,
    Status, WireRequest, WireResponse,
};
use crate::bus::MessageBus;
use crate::codec::{SnapshotStream, encode_entries, frame_snapshot};
use crate::error::TransportError;
use crate::event::Event;
use crate::message::{
    AppendEntriesRequest, CanInstallSnapshotRequest, DisconnectedFromCluster,
    InstallSnapshotRequest, RequestVoteRequest, TimeoutNowRequest,
};
use crate::traits::Network;
use crate::types::{NodeConnectionInfo, NodeName};

/// 传输层配置
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub request_timeout: Duration,
    /// Limit for streamed snapshot transfers.
    pub snapshot_timeout: Duration,
    /// Sends beyond this many in flight are dropped.
    pub max_in_flight: usize,
    pub shutdown_grace_period: Duration,
    pub max_idle_connections_per_node: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(60),
            max_in_flight: 1024,
            shutdown_grace_period: Duration::from_secs(5),
            max_idle_connections_per_node: 4,
        }
    }
}

struct SenderInner {
    name: NodeName,
    executor: RequestExecutor,
    bus: MessageBus,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    permits: Arc<Semaphore>,
    options: TransportOptions,
}

/// Turns outbound consensus messages into independent send tasks whose replies are
/// published to the bus.
#[derive(Clone)]
pub struct TransportSender {
    inner: Arc<SenderInner>,
}

impl TransportSender {
    pub fn new(
        name: impl Into<NodeName>,
        connector: Arc<dyn Connector>,
        bus: MessageBus,
        options: TransportOptions,
    ) -> Self {
        let pool = ConnectionPool::new(connector, options.max_idle_connections_per_node);
        let executor = RequestExecutor::new(
            pool,
            AuthenticatorCache::new(),
            options.request_timeout,
            options.snapshot_timeout,
        );
        Self {
            inner: Arc::new(SenderInner {
                name: name.into(),
                executor,
                bus,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                permits: Arc::new(Semaphore::new(options.max_in_flight)),
                options,
            }),
        }
    }

    /// Executor sharing this sender's pool and credentials, for administrative calls.
    pub fn executor(&self) -> &RequestExecutor {
        &self.inner.executor
    }

    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Cancels pending sends and waits for them up to the grace period.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.tasks.close();
        let grace = inner.options.shutdown_grace_period;
        if tokio::time::timeout(grace, inner.tasks.wait()).await.is_err() {
            warn!(
                "Node {} transport still had {} sends after {:?}",
                inner.name,
                inner.tasks.len(),
                grace
            );
        } else {
            info!("Node {} transport stopped", inner.name);
        }
    }

    /// Spawns one tracked send. `on_reply` turns the peer's answer into a bus event.
    fn dispatch<F>(&self, dest: &NodeConnectionInfo, request: WireRequest, on_reply: F)
    where
        F: FnOnce(WireResponse) -> Result<Event, TransportError> + Send + 'static,
    {
        let inner = self.inner.clone();
        if inner.shutdown.is_cancelled() {
            debug!(
                "Node {} dropping {} to {}: transport is shut down",
                inner.name, request.route, dest.name
            );
            return;
        }
        let Ok(permit) = inner.permits.clone().try_acquire_owned() else {
            warn!(
                "Node {} dropping {} to {}: {} sends already in flight",
                inner.name, request.route, dest.name, inner.options.max_in_flight
            );
            return;
        };

        let dest = dest.clone();
        let task_inner = inner.clone();
        inner.tasks.spawn(async move {
            let inner = task_inner;
            let route = request.route.to_string();
            trace!("Node {} sending {} to {}", inner.name, route, dest.name);
            let result = tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    debug!("Node {} cancelled {} to {}", inner.name, route, dest.name);
                    return;
                }
                result = inner.executor.execute(&dest, request) => result,
            };
            drop(permit);
            match result.and_then(on_reply) {
                Ok(event) => {
                    inner.bus.publish(event);
                }
                Err(err) => {
                    warn!(
                        "Node {} failed {} to {}: {}",
                        inner.name, route, dest.name, err
                    );
                }
            }
        });
    }

    fn encode<Req: Serialize>(&self, route: RaftRoute, dest: &NodeConnectionInfo, request: &Req) -> Option<Bytes> {
        match serde_json::to_vec(request) {
            Ok(header) => Some(Bytes::from(header)),
            Err(err) => {
                warn!(
                    "Node {} failed to encode {:?} for {}: {}",
                    self.inner.name, route, dest.name, err
                );
                None
            }
        }
    }

    fn send_raft<Resp>(
        &self,
        dest: &NodeConnectionInfo,
        route: RaftRoute,
        term: u64,
        body: Body,
        wrap: fn(Resp) -> Event,
    ) where
        Resp: DeserializeOwned + 'static,
    {
        let route = Route::Raft {
            route,
            from: self.inner.name.clone(),
            term,
        };
        self.dispatch(dest, WireRequest::new(route, body), move |response| {
            Ok(wrap(decode_reply(response)?))
        });
    }

    /// Requests whose reply carries no payload; completion is still fed to the loop.
    fn send_notification<Req: Serialize>(
        &self,
        dest: &NodeConnectionInfo,
        route: RaftRoute,
        term: u64,
        request: &Req,
    ) {
        let Some(header) = self.encode(route, dest, request) else {
            return;
        };
        let body = Body::Json(header);
        let route = Route::Raft {
            route,
            from: self.inner.name.clone(),
            term,
        };
        self.dispatch(dest, WireRequest::new(route, body), |response| {
            match response.status {
                Status::Ok | Status::NotAcceptable => Ok(Event::NothingToDo),
                status => Err(unexpected(status, &response)),
            }
        });
    }
}

/// Ok and NotAcceptable both carry a protocol reply.
fn decode_reply<T: DeserializeOwned>(response: WireResponse) -> Result<T, TransportError> {
    match response.status {
        Status::Ok | Status::NotAcceptable => Ok(response.decode()?),
        Status::Unauthorized => Err(TransportError::Unauthorized),
        status => Err(unexpected(status, &response)),
    }
}

fn unexpected(status: Status, response: &WireResponse) -> TransportError {
    TransportError::Status {
        status: status.code(),
        message: response.body_text(),
    }
}

impl Network for TransportSender {
    fn send_request_vote(&self, dest: &NodeConnectionInfo, req: RequestVoteRequest) {
        if let Some(header) = self.encode(RaftRoute::RequestVote, dest, &req) {
            self.send_raft(
                dest,
                RaftRoute::RequestVote,
                req.term,
                Body::Json(header),
                Event::RequestVoteResponse,
            );
        }
    }

    fn send_append_entries(&self, dest: &NodeConnectionInfo, mut req: AppendEntriesRequest) {
        // Entries travel in the binary entry encoding after the JSON header.
        let entries = std::mem::take(&mut req.entries);
        let header = AppendEntriesHeader {
            entries_count: entries.len() as u64,
            request: req,
        };
        if let Some(header_bytes) = self.encode(RaftRoute::AppendEntries, dest, &header) {
            self.send_raft(
                dest,
                RaftRoute::AppendEntries,
                header.request.term,
                Body::Binary {
                    header: header_bytes,
                    payload: encode_entries(&entries),
                },
                Event::AppendEntriesResponse,
            );
        }
    }

    fn send_can_install_snapshot(&self, dest: &NodeConnectionInfo, req: CanInstallSnapshotRequest) {
        if let Some(header) = self.encode(RaftRoute::CanInstallSnapshot, dest, &req) {
            self.send_raft(
                dest,
                RaftRoute::CanInstallSnapshot,
                req.term,
                Body::Json(header),
                Event::CanInstallSnapshotResponse,
            );
        }
    }

    fn send_install_snapshot(
        &self,
        dest: &NodeConnectionInfo,
        req: InstallSnapshotRequest,
        body: SnapshotStream,
    ) {
        if let Some(header) = self.encode(RaftRoute::InstallSnapshot, dest, &req) {
            self.send_raft(
                dest,
                RaftRoute::InstallSnapshot,
                req.term,
                Body::Stream {
                    header,
                    chunks: frame_snapshot(body),
                },
                Event::InstallSnapshotResponse,
            );
        }
    }

    fn send_timeout_now(&self, dest: &NodeConnectionInfo, req: TimeoutNowRequest) {
        self.send_notification(dest, RaftRoute::TimeoutNow, req.term, &req);
    }

    fn send_disconnected_from_cluster(
        &self,
        dest: &NodeConnectionInfo,
        req: DisconnectedFromCluster,
    ) {
        self.send_notification(dest, RaftRoute::DisconnectedFromCluster, req.term, &req);
    }
}
