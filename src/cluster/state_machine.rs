//! In-memory state machine for cluster commands.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use super::command::{ClusterCommand, ClusterConfiguration};
use crate::codec::SnapshotStream;
use crate::error::{ApplyError, SnapshotError};
use crate::message::SnapshotMeta;
use crate::traits::{ApplyResult, SnapshotReader, SnapshotResult, StateMachine};
use crate::types::NodeName;

/// Replicated cluster state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub configuration: ClusterConfiguration,
    pub databases: BTreeMap<String, serde_json::Value>,
    /// Deleted databases and whether their data was hard deleted.
    pub deleted: BTreeMap<String, bool>,
}

impl ClusterState {
    fn apply(&mut self, command: ClusterCommand) {
        match command {
            ClusterCommand::ClusterConfigurationUpdate { configuration } => {
                self.configuration = configuration;
            }
            ClusterCommand::DatabaseUpdate { name, document } => {
                self.deleted.remove(&name);
                self.databases.insert(name, document);
            }
            ClusterCommand::DatabaseDeleted { name, hard_delete } => {
                self.databases.remove(&name);
                self.deleted.insert(name, hard_delete);
            }
        }
    }

    fn into_records(self) -> impl Iterator<Item = SnapshotRecord> + Send + 'static {
        std::iter::once(SnapshotRecord::Configuration(self.configuration))
            .chain(
                self.databases
                    .into_iter()
                    .map(|(name, document)| SnapshotRecord::Database { name, document }),
            )
            .chain(
                self.deleted
                    .into_iter()
                    .map(|(name, hard_delete)| SnapshotRecord::Deleted { name, hard_delete }),
            )
    }

    fn restore(&mut self, record: SnapshotRecord) {
        match record {
            SnapshotRecord::Configuration(configuration) => self.configuration = configuration,
            SnapshotRecord::Database { name, document } => {
                self.databases.insert(name, document);
            }
            SnapshotRecord::Deleted { name, hard_delete } => {
                self.deleted.insert(name, hard_delete);
            }
        }
    }
}

/// One line of a snapshot body. Bodies are newline separated JSON records, so
/// a receiver only ever holds the record being decoded.
#[derive(Debug, Serialize, Deserialize)]
enum SnapshotRecord {
    Configuration(ClusterConfiguration),
    Database {
        name: String,
        document: serde_json::Value,
    },
    Deleted {
        name: String,
        hard_delete: bool,
    },
}

fn encode_record(record: &SnapshotRecord) -> std::io::Result<Bytes> {
    let mut line = serde_json::to_vec(record)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Decodes records from a chunk stream as they complete.
async fn restore_state(mut body: SnapshotStream) -> SnapshotResult<ClusterState> {
    let mut state = ClusterState::default();
    let mut pending = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let scanned = pending.len();
        pending.extend_from_slice(&chunk?);
        let mut from = scanned;
        while let Some(offset) = pending[from..].iter().position(|b| *b == b'\n') {
            let line = pending.split_to(from + offset + 1);
            let record: SnapshotRecord = serde_json::from_slice(&line[..line.len() - 1])
                .map_err(|err| SnapshotError::DataCorrupted(err.to_string()))?;
            state.restore(record);
            from = 0;
        }
    }
    if !pending.is_empty() {
        return Err(SnapshotError::DataCorrupted(format!(
            "snapshot ends inside a record ({} bytes left)",
            pending.len()
        )));
    }
    Ok(state)
}

struct Inner {
    state: ClusterState,
    last_applied: u64,
    snapshot: Option<(SnapshotMeta, ClusterState)>,
}

pub struct ClusterStateMachine {
    name: NodeName,
    inner: RwLock<Inner>,
    applied: watch::Sender<u64>,
}

impl ClusterStateMachine {
    pub fn new(name: impl Into<NodeName>) -> Self {
        let (applied, _) = watch::channel(0);
        Self {
            name: name.into(),
            inner: RwLock::new(Inner {
                state: ClusterState::default(),
                last_applied: 0,
                snapshot: None,
            }),
            applied,
        }
    }

    pub fn state(&self) -> ClusterState {
        self.inner.read().state.clone()
    }

    pub fn database(&self, name: &str) -> Option<serde_json::Value> {
        self.inner.read().state.databases.get(name).cloned()
    }

    /// Index of the last entry reflected in the state, including installed snapshots.
    pub fn subscribe_applied(&self) -> watch::Receiver<u64> {
        self.applied.subscribe()
    }

    pub fn snapshot_meta(&self) -> Option<SnapshotMeta> {
        self.inner.read().snapshot.as_ref().map(|(meta, _)| meta.clone())
    }
}

#[async_trait]
impl StateMachine for ClusterStateMachine {
    fn last_applied_index(&self) -> u64 {
        self.inner.read().last_applied
    }

    async fn apply(&self, index: u64, term: u64, data: &[u8]) -> ApplyResult<()> {
        let command = ClusterCommand::decode(data)
            .map_err(|err| ApplyError::InvalidCommand(index, err.to_string()))?;
        debug!(
            "Node {} applying {:?} at index {} (term {})",
            self.name, command, index, term
        );
        {
            let mut inner = self.inner.write();
            if index <= inner.last_applied {
                return Ok(());
            }
            inner.state.apply(command);
            inner.last_applied = index;
        }
        self.applied.send_replace(index);
        Ok(())
    }

    async fn create_snapshot(&self, meta: SnapshotMeta) -> SnapshotResult<()> {
        let mut inner = self.inner.write();
        let state = inner.state.clone();
        info!(
            "Node {} captured cluster state at index {} ({} databases)",
            self.name,
            meta.last_included_index,
            state.databases.len()
        );
        inner.snapshot = Some((meta, state));
        Ok(())
    }

    async fn read_snapshot(&self) -> SnapshotResult<Option<SnapshotReader>> {
        let Some((meta, state)) = self.inner.read().snapshot.clone() else {
            return Ok(None);
        };
        let body = stream::iter(state.into_records()).map(|record| encode_record(&record));
        Ok(Some(SnapshotReader {
            meta,
            body: body.boxed(),
        }))
    }

    async fn install_snapshot(
        &self,
        meta: SnapshotMeta,
        body: SnapshotStream,
    ) -> SnapshotResult<()> {
        let state = restore_state(body).await?;
        info!(
            "Node {} installed cluster state at index {} with {} databases",
            self.name,
            meta.last_included_index,
            state.databases.len()
        );
        let index = meta.last_included_index;
        {
            let mut inner = self.inner.write();
            inner.snapshot = Some((meta, state.clone()));
            inner.state = state;
            inner.last_applied = index;
        }
        self.applied.send_replace(index);
        Ok(())
    }
}
