//! Receiving side: turns wire requests into bus events and waits for the loop's answer.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::pool::{ApiKeyRequest, TokenResponse};
use super::{AppendEntriesHeader, Body, RaftRoute, Route, Status, WireRequest, WireResponse};
use crate::bus::MessageBus;
use crate::cluster::AdminHandler;
use crate::codec::{decode_entries, unframe_snapshot};
use crate::event::{Event, Reply, SnapshotBody};
use crate::message::{
    AppendEntriesResponse, CanInstallSnapshotRequest, CanInstallSnapshotResponse,
    DisconnectedFromCluster, InstallSnapshotRequest, InstallSnapshotResponse, RequestVoteRequest,
    RequestVoteResponse, TimeoutNowRequest,
};
use crate::types::NodeName;

/// Credentials a node accepts: callers trade `api_key` for `token`.
#[derive(Debug, Clone)]
pub struct ServerAuth {
    pub api_key: String,
    pub token: String,
}

/// Reply status of a protocol answer.
trait Accepted {
    fn accepted(&self) -> bool;
}

impl Accepted for RequestVoteResponse {
    fn accepted(&self) -> bool {
        self.vote_granted
    }
}

impl Accepted for AppendEntriesResponse {
    fn accepted(&self) -> bool {
        self.success
    }
}

impl Accepted for CanInstallSnapshotResponse {
    fn accepted(&self) -> bool {
        self.success
    }
}

impl Accepted for InstallSnapshotResponse {
    fn accepted(&self) -> bool {
        self.success
    }
}

/// 节点请求入口
pub struct RequestHandler {
    name: NodeName,
    bus: MessageBus,
    reply_timeout: Duration,
    admin: Option<AdminHandler>,
    auth: Option<ServerAuth>,
}

impl RequestHandler {
    pub fn new(name: impl Into<NodeName>, bus: MessageBus) -> Self {
        Self {
            name: name.into(),
            bus,
            reply_timeout: Duration::from_secs(30),
            admin: None,
            auth: None,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_admin(mut self, admin: AdminHandler) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn with_auth(mut self, auth: ServerAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub async fn handle(&self, request: WireRequest) -> WireResponse {
        let WireRequest {
            route,
            body,
            credential,
        } = request;

        if let Route::OAuth { .. } = route {
            return self.issue_token(&body);
        }
        if let Some(auth) = &self.auth {
            if credential.as_deref() != Some(auth.token.as_str()) {
                debug!("Node {} rejecting unauthenticated {}", self.name, route);
                return WireResponse::empty(Status::Unauthorized);
            }
        }

        match route {
            Route::Raft { route, from, term } => {
                debug!(
                    "Node {} received {:?} from {} (term {})",
                    self.name, route, from, term
                );
                self.handle_raft(route, body).await
            }
            route => match &self.admin {
                Some(admin) => admin.handle(&route, body).await,
                None => WireResponse::error(
                    Status::NotFound,
                    "NotFound",
                    &format!("{} serves no administrative routes", self.name),
                ),
            },
        }
    }

    fn issue_token(&self, body: &Body) -> WireResponse {
        let Some(auth) = &self.auth else {
            return WireResponse::json(
                Status::Ok,
                &TokenResponse {
                    token: String::new(),
                },
            );
        };
        match body.decode::<ApiKeyRequest>() {
            Ok(request) if request.api_key == auth.api_key => {
                info!("Node {} issued a token", self.name);
                WireResponse::json(
                    Status::Ok,
                    &TokenResponse {
                        token: auth.token.clone(),
                    },
                )
            }
            Ok(_) => WireResponse::error(Status::Forbidden, "Forbidden", "Unknown api key"),
            Err(err) => WireResponse::error(Status::BadRequest, "BadRequest", &err.to_string()),
        }
    }

    async fn handle_raft(&self, route: RaftRoute, body: Body) -> WireResponse {
        match route {
            RaftRoute::RequestVote => match body.decode::<RequestVoteRequest>() {
                Ok(request) => {
                    self.ask(|reply| Event::RequestVoteRequest(request, reply))
                        .await
                }
                Err(err) => bad_request(err),
            },
            RaftRoute::AppendEntries => {
                let header = match body.decode::<AppendEntriesHeader>() {
                    Ok(header) => header,
                    Err(err) => return bad_request(err),
                };
                let payload = match body {
                    Body::Binary { payload, .. } => payload,
                    _ => Bytes::new(),
                };
                let mut request = header.request;
                request.entries = match decode_entries(payload, header.entries_count) {
                    Ok(entries) => entries,
                    Err(err) => return bad_request(err),
                };
                self.ask(|reply| Event::AppendEntriesRequest(request, reply))
                    .await
            }
            RaftRoute::CanInstallSnapshot => match body.decode::<CanInstallSnapshotRequest>() {
                Ok(request) => {
                    self.ask(|reply| Event::CanInstallSnapshotRequest(request, reply))
                        .await
                }
                Err(err) => bad_request(err),
            },
            RaftRoute::InstallSnapshot => {
                let request = match body.decode::<InstallSnapshotRequest>() {
                    Ok(request) => request,
                    Err(err) => return bad_request(err),
                };
                let Body::Stream { chunks, .. } = body else {
                    return WireResponse::error(
                        Status::BadRequest,
                        "BadRequest",
                        "InstallSnapshot requires a streamed body",
                    );
                };
                let snapshot = SnapshotBody(unframe_snapshot(chunks));
                self.ask(|reply| Event::InstallSnapshotRequest(request, snapshot, reply))
                    .await
            }
            RaftRoute::TimeoutNow => match body.decode::<TimeoutNowRequest>() {
                Ok(request) => self.notify(Event::TimeoutNow(request)),
                Err(err) => bad_request(err),
            },
            RaftRoute::DisconnectedFromCluster => match body.decode::<DisconnectedFromCluster>() {
                Ok(request) => self.notify(Event::DisconnectedFromCluster(request)),
                Err(err) => bad_request(err),
            },
        }
    }

    fn notify(&self, event: Event) -> WireResponse {
        if self.bus.publish(event) {
            WireResponse::empty(Status::Ok)
        } else {
            shutting_down(&self.name)
        }
    }

    /// Publishes the request and waits for the loop's answer.
    async fn ask<T, F>(&self, make: F) -> WireResponse
    where
        T: Serialize + Accepted,
        F: FnOnce(Reply<T>) -> Event,
    {
        let (reply, rx): (Reply<T>, oneshot::Receiver<T>) = Reply::channel();
        if !self.bus.publish(make(reply)) {
            return shutting_down(&self.name);
        }
        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(answer)) => {
                let status = if answer.accepted() {
                    Status::Ok
                } else {
                    Status::NotAcceptable
                };
                WireResponse::json(status, &answer)
            }
            Ok(Err(_)) => WireResponse::error(
                Status::InternalServerError,
                "NoReply",
                &format!("{} dropped the request without answering", self.name),
            ),
            Err(_) => {
                warn!(
                    "Node {} did not answer within {:?}",
                    self.name, self.reply_timeout
                );
                WireResponse::error(
                    Status::ServiceUnavailable,
                    "Timeout",
                    &format!("{} did not answer in time", self.name),
                )
            }
        }
    }
}

fn bad_request(err: impl std::fmt::Display) -> WireResponse {
    WireResponse::error(Status::BadRequest, "BadRequest", &err.to_string())
}

fn shutting_down(name: &NodeName) -> WireResponse {
    WireResponse::error(
        Status::ServiceUnavailable,
        "ShuttingDown",
        &format!("{} is shutting down", name),
    )
}
