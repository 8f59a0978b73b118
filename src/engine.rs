//! Engine handle: owns the event loop task that drives one [`RaftState`].
//!
//! All state mutation happens on the loop. The handle talks to it only through the
//! message bus and observes it through a `watch` channel of [`EngineStatus`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::bus::MessageBus;
use crate::error::ClientError;
use crate::event::{ClientResult, Command, Event};
use crate::state::{EngineStatus, RaftOptions, RaftState, RaftStateDeps};
use crate::timer::Timers;
use crate::topology::{Membership, Topology, TopologyChange};
use crate::traits::{Network, StateMachine, Storage};
use crate::types::{NodeConnectionInfo, NodeName};

/// Collaborators of a node.
pub struct EngineDeps {
    pub storage: Arc<dyn Storage>,
    pub state_machine: Arc<dyn StateMachine>,
    pub network: Arc<dyn Network>,
    /// Bus the transport publishes replies and inbound requests to.
    pub bus: MessageBus,
}

struct EngineInner {
    self_info: NodeConnectionInfo,
    bus: MessageBus,
    status: watch::Receiver<EngineStatus>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Cloneable handle to a running consensus node.
#[derive(Clone)]
pub struct RaftEngine {
    inner: Arc<EngineInner>,
}

impl RaftEngine {
    /// Loads persisted state, arms the timers and spawns the event loop.
    pub async fn start(
        options: RaftOptions,
        self_info: NodeConnectionInfo,
        deps: EngineDeps,
    ) -> anyhow::Result<Self> {
        let bus = deps.bus;
        let receiver = bus
            .subscribe()
            .ok_or_else(|| anyhow!("message bus of {} already has a consumer", self_info.name))?;

        let timers = Timers::new(bus.clone());
        let (status_tx, status_rx) = watch::channel(EngineStatus::initial(self_info.name.clone()));
        let mut state = RaftState::new(
            options,
            self_info.clone(),
            RaftStateDeps {
                storage: deps.storage,
                state_machine: deps.state_machine,
                network: deps.network,
                timers: Arc::new(timers.clone()),
                bus: bus.clone(),
                status: status_tx,
            },
        )
        .await?;
        state.start();

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn({
            let shutdown = shutdown.clone();
            async move { timers.run(shutdown).await }
        });
        tasks.spawn(run_loop(state, receiver, shutdown.clone()));
        tasks.close();

        info!("Node {} started at {}", self_info.name, self_info.uri);
        Ok(Self {
            inner: Arc::new(EngineInner {
                self_info,
                bus,
                status: status_rx,
                shutdown,
                tasks,
            }),
        })
    }

    pub fn name(&self) -> &NodeName {
        &self.inner.self_info.name
    }

    pub fn self_info(&self) -> &NodeConnectionInfo {
        &self.inner.self_info
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.status.borrow().is_leader()
    }

    pub fn leader(&self) -> Option<NodeName> {
        self.inner.status.borrow().leader.clone()
    }

    /// Connection info of the current leader as known from the committed topology.
    pub fn leader_node(&self) -> Option<NodeConnectionInfo> {
        let status = self.inner.status.borrow();
        let leader = status.leader.as_ref()?;
        status.topology.get_node(leader).cloned()
    }

    pub fn current_topology(&self) -> Arc<Topology> {
        self.inner.status.borrow().topology.clone()
    }

    /// Proposes `data` and resolves with its log index once it was applied.
    pub async fn append_command(&self, data: Vec<u8>) -> ClientResult<u64> {
        {
            let status = self.inner.status.borrow();
            if !status.is_leader() {
                return Err(ClientError::NotLeading {
                    leader: status.leader.clone(),
                });
            }
        }
        let (completion, rx) = oneshot::channel();
        self.request(Event::ClientPropose(Command { data, completion }), rx)
            .await
    }

    /// Adds or updates a member. Voters are first added as promotable.
    pub async fn add_to_cluster(
        &self,
        node: NodeConnectionInfo,
        membership: Membership,
    ) -> ClientResult<()> {
        let (completion, rx) = oneshot::channel();
        let change = TopologyChange::Add { node, membership };
        self.request(Event::ChangeTopology { change, completion }, rx)
            .await
    }

    pub async fn remove_from_cluster(&self, name: NodeName) -> ClientResult<()> {
        let (completion, rx) = oneshot::channel();
        let change = TopologyChange::Remove { name };
        self.request(Event::ChangeTopology { change, completion }, rx)
            .await
    }

    /// Hands leadership to the most up-to-date voter.
    pub async fn step_down(&self) -> ClientResult<()> {
        let (completion, rx) = oneshot::channel();
        self.request(Event::StepDown { completion }, rx).await
    }

    pub async fn transfer_leadership(&self, target: NodeName) -> ClientResult<()> {
        let (completion, rx) = oneshot::channel();
        self.request(
            Event::TransferLeadership {
                target: Some(target),
                completion,
            },
            rx,
        )
        .await
    }

    /// Asks the loop to snapshot the state machine and compact the log.
    pub fn create_snapshot(&self) -> ClientResult<()> {
        if self.inner.bus.publish(Event::CreateSnapshot) {
            Ok(())
        } else {
            Err(ClientError::ShuttingDown)
        }
    }

    /// Waits until some leader is known.
    pub async fn wait_for_leader(&self, timeout: Duration) -> ClientResult<NodeName> {
        let mut status = self.inner.status.clone();
        let wait = status.wait_for(|s| s.leader.is_some() || s.stopped);
        let status = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::ShuttingDown)?;
        status.leader.clone().ok_or(ClientError::ShuttingDown)
    }

    /// Waits until `predicate` holds for the published status.
    pub async fn wait_for_status(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&EngineStatus) -> bool,
    ) -> ClientResult<EngineStatus> {
        let mut status = self.inner.status.clone();
        let wait = status.wait_for(predicate);
        let status = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::ShuttingDown)?;
        Ok(status.clone())
    }

    /// Stops the loop and the timer task, failing everything still waiting.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Node {} shutdown requested", self.name());
        self.inner.shutdown.cancel();
        self.inner.tasks.wait().await;
    }

    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled() && !self.inner.status.borrow().stopped
    }

    async fn request<T>(
        &self,
        event: Event,
        rx: oneshot::Receiver<ClientResult<T>>,
    ) -> ClientResult<T> {
        if !self.inner.bus.publish(event) {
            return Err(ClientError::ShuttingDown);
        }
        rx.await.map_err(|_| ClientError::ShuttingDown)?
    }
}

async fn run_loop(
    mut state: RaftState,
    mut receiver: mpsc::UnboundedReceiver<Event>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => {
                let Some(event) = event else {
                    break;
                };
                state.handle_event(event).await;
                if state.is_stopped() {
                    error!("Node {} stopped after a fatal error", state.name);
                    break;
                }
            }
        }
    }

    state.shutdown();
    shutdown.cancel();

    // Whatever is still queued will never be processed.
    receiver.close();
    while let Ok(event) = receiver.try_recv() {
        reject(event);
    }
    debug!("Node {} event loop exited", state.name);
}

fn reject(event: Event) {
    match event {
        Event::ClientPropose(command) => {
            let _ = command.completion.send(Err(ClientError::ShuttingDown));
        }
        Event::ChangeTopology { completion, .. }
        | Event::StepDown { completion }
        | Event::TransferLeadership { completion, .. } => {
            let _ = completion.send(Err(ClientError::ShuttingDown));
        }
        _ => {}
    }
}
