//! Client request handling for Raft state machine

use tracing::{debug, error, warn};

use super::RaftState;
use crate::error::{ApplyError, ClientError};
use crate::event::{Command, Role};
use crate::message::LogEntry;
use crate::topology::Topology;

impl RaftState {
    /// 处理客户端提议
    pub(crate) async fn handle_client_propose(&mut self, command: Command) {
        let Command { data, completion } = command;

        if self.role != Role::Leader {
            debug!(
                "Node {} rejecting proposal: not leading (leader: {:?})",
                self.name, self.leader_id
            );
            let _ = completion.send(Err(ClientError::NotLeading {
                leader: self.leader_id.clone(),
            }));
            return;
        }

        if data.is_empty() {
            let _ = completion.send(Err(ClientError::BadRequest(
                "Empty commands cannot be proposed".to_string(),
            )));
            return;
        }

        let entry = LogEntry::new(self.last_log_index + 1, self.current_term, data);
        let index = entry.index;
        if !self.append_local(entry).await {
            let _ = completion.send(Err(ClientError::Internal(format!(
                "Failed to append entry {}",
                index
            ))));
            return;
        }
        debug!(
            "Node {} appended command at index {} in term {}",
            self.name, index, self.current_term
        );
        self.pending_commands.insert(index, completion);

        self.broadcast_append_entries().await;
        self.update_commit_index().await;
    }

    /// Appends an empty entry so entries from earlier terms can be committed.
    pub(crate) async fn append_noop(&mut self) {
        let entry = LogEntry::noop(self.last_log_index + 1, self.current_term);
        let index = entry.index;
        if self.append_local(entry).await {
            debug!("Node {} appended no-op at index {}", self.name, index);
        }
    }

    /// Appends one entry produced by this leader and advances the log tail.
    pub(crate) async fn append_local(&mut self, entry: LogEntry) -> bool {
        let (index, term) = (entry.index, entry.term);
        let result = self
            .storage
            .append_log_entries(std::slice::from_ref(&entry))
            .await;
        if !self
            .error_handler
            .handle_void(result, "append_log_entries", None)
        {
            error!("Node {} failed to append entry {}", self.name, index);
            return false;
        }
        self.last_log_index = index;
        self.last_log_term = term;
        true
    }

    /// 将已提交的日志应用到状态机
    pub(crate) async fn apply_committed_entries(&mut self) {
        while self.last_applied < self.commit_index && !self.is_stopped() {
            let low = self.last_applied + 1;
            let high = (low + self.options.apply_batch_size).min(self.commit_index + 1);
            let result = self.storage.get_log_entries(low, high).await;
            let Some(entries) = self.error_handler.handle(result, "get_log_entries", None) else {
                return;
            };
            if entries.is_empty() {
                warn!(
                    "Node {} found no entries in [{}, {}) to apply",
                    self.name, low, high
                );
                return;
            }

            for entry in entries {
                let outcome = if entry.is_topology_change {
                    match Topology::decode(&entry.data) {
                        Ok(topology) => {
                            self.commit_topology(entry.index, topology).await;
                            Ok(())
                        }
                        Err(err) => {
                            self.error_handler
                                .handle_void(Err(err), "decode_topology", None);
                            return;
                        }
                    }
                } else if entry.is_noop() {
                    Ok(())
                } else {
                    match self
                        .state_machine
                        .apply(entry.index, entry.term, &entry.data)
                        .await
                    {
                        Ok(()) => Ok(()),
                        Err(ApplyError::InvalidCommand(index, reason)) => {
                            warn!(
                                "Node {} skipped invalid command at {}: {}",
                                self.name, index, reason
                            );
                            Err(ClientError::BadRequest(reason))
                        }
                        Err(err) => {
                            // Retried on the next commit or heartbeat.
                            self.error_handler.handle_void(Err(err), "apply", None);
                            return;
                        }
                    }
                };

                self.last_applied = entry.index;
                if let Some(completion) = self.pending_commands.remove(&entry.index) {
                    let _ = completion.send(outcome.map(|()| entry.index));
                }
                if self
                    .pending_topology_change
                    .as_ref()
                    .is_some_and(|(index, _)| *index == entry.index)
                {
                    if let Some((_, completion)) = self.pending_topology_change.take() {
                        let _ = completion.send(Ok(()));
                    }
                }
            }
        }

        self.maybe_create_snapshot().await;
    }
}
