//! Election handling for Raft state machine

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info};

use super::{Election, RaftState};
use crate::event::Role;
use crate::message::{RequestVoteRequest, RequestVoteResponse};
use crate::types::TimerId;

impl RaftState {
    pub(crate) async fn handle_election_timeout(&mut self, timer: TimerId) {
        if self.election_timer != Some(timer) {
            return;
        }
        self.election_timer = None;

        if self.role == Role::Leader {
            return;
        }

        if !self.topology.is_voter(&self.name) {
            debug!(
                "Node {} is not a voting member and will not start an election",
                self.name
            );
            self.reset_election_timer();
            return;
        }

        if self.installing_snapshot.is_some() {
            debug!("Node {} is installing a snapshot, postponing election", self.name);
            self.reset_election_timer();
            return;
        }

        self.start_election(false).await;
    }

    /// Starts a trial round unless pre-vote is disabled or the election is forced.
    pub(crate) async fn start_election(&mut self, forced: bool) {
        if self.options.pre_vote_enabled && !forced {
            self.start_trial_election().await;
        } else {
            self.start_real_election(forced).await;
        }
    }

    /// Non-binding round: asks for votes for `current_term + 1` without touching the term.
    async fn start_trial_election(&mut self) {
        let term = self.current_term + 1;
        info!(
            "Node {} starting trial election for term {}",
            self.name, term
        );
        self.role = Role::Candidate;
        self.leader_id = None;
        self.election = Some(Election {
            term,
            trial: true,
            forced: false,
            votes: HashSet::from([self.name.clone()]),
        });
        self.reset_election_timer();
        self.send_vote_requests(term, true, false);

        if self.election_won() == Some(true) {
            self.start_real_election(false).await;
        }
    }

    async fn start_real_election(&mut self, forced: bool) {
        self.current_term += 1;
        self.voted_for = Some(self.name.clone());
        self.persist_hard_state().await;

        info!(
            "Node {} starting {}election for term {}",
            self.name,
            if forced { "forced " } else { "" },
            self.current_term
        );

        self.role = Role::Candidate;
        self.leader_id = None;
        self.election = Some(Election {
            term: self.current_term,
            trial: false,
            forced,
            votes: HashSet::from([self.name.clone()]),
        });
        self.reset_election_timer();
        self.send_vote_requests(self.current_term, false, forced);

        if self.election_won() == Some(false) {
            self.become_leader().await;
        }
    }

    fn send_vote_requests(&self, term: u64, trial_only: bool, forced_election: bool) {
        let request = RequestVoteRequest {
            term,
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
            trial_only,
            forced_election,
            from: self.name.clone(),
            cluster_topology_id: self.cluster_topology_id(),
        };
        for (name, node) in &self.topology.voting_nodes {
            if *name != self.name {
                self.network.send_request_vote(node, request.clone());
            }
        }
    }

    /// A leader is considered alive if it was heard from within the minimum election timeout.
    fn leader_is_alive(&self) -> bool {
        self.role == Role::Leader
            || (self.leader_id.is_some()
                && self.last_heartbeat.elapsed() < self.options.election_timeout_min)
    }

    fn vote_response(
        &self,
        request: &RequestVoteRequest,
        vote_granted: bool,
        message: String,
    ) -> RequestVoteResponse {
        RequestVoteResponse {
            term: self.current_term,
            vote_term: request.term,
            vote_granted,
            trial_only: request.trial_only,
            message,
            from: self.name.clone(),
            cluster_topology_id: self.cluster_topology_id(),
        }
    }

    /// 处理投票请求
    pub(crate) async fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> RequestVoteResponse {
        if !self.accepts_cluster(request.cluster_topology_id) {
            return self.vote_response(
                &request,
                false,
                format!(
                    "Cannot vote for {} from cluster {}, this node belongs to {}",
                    request.from,
                    request.cluster_topology_id,
                    self.cluster_topology_id()
                ),
            );
        }

        if !self.topology.is_voter(&request.from) {
            return self.vote_response(
                &request,
                false,
                format!("{} is not a voting member of the cluster", request.from),
            );
        }

        if request.term < self.current_term {
            return self.vote_response(
                &request,
                false,
                format!(
                    "Vote term {} is older than current term {}",
                    request.term, self.current_term
                ),
            );
        }

        if !request.forced_election && self.leader_is_alive() {
            let leader = self.leader_id.clone().unwrap_or_default();
            debug!(
                "Node {} rejecting vote for {}: leader {} is alive",
                self.name, request.from, leader
            );
            return self.vote_response(
                &request,
                false,
                format!("Leader {} is still alive", leader),
            );
        }

        let log_ok = self.is_log_up_to_date(request.last_log_index, request.last_log_term);

        if request.trial_only {
            let voted_other = request.term == self.current_term
                && self
                    .voted_for
                    .as_ref()
                    .is_some_and(|voted| *voted != request.from);
            let granted = log_ok && !voted_other;
            let message = if granted {
                "Trial vote granted".to_string()
            } else if !log_ok {
                "Candidate log is behind".to_string()
            } else {
                "Already voted in this term".to_string()
            };
            return self.vote_response(&request, granted, message);
        }

        if request.term > self.current_term {
            self.step_down_to_follower(Some(request.term)).await;
        }

        if let Some(voted) = self.voted_for.as_ref().filter(|v| **v != request.from) {
            let message = format!("Already voted for {} in term {}", voted, self.current_term);
            return self.vote_response(&request, false, message);
        }

        if !log_ok {
            return self.vote_response(&request, false, "Candidate log is behind".to_string());
        }

        self.voted_for = Some(request.from.clone());
        self.persist_hard_state().await;
        self.last_heartbeat = Instant::now();
        self.reset_election_timer();
        info!(
            "Node {} voted for {} in term {}",
            self.name, request.from, self.current_term
        );
        self.vote_response(&request, true, "Vote granted".to_string())
    }

    /// `(last_log_term, last_log_index)` compared lexicographically.
    pub(crate) fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        last_log_term > self.last_log_term
            || (last_log_term == self.last_log_term && last_log_index >= self.last_log_index)
    }

    pub(crate) async fn handle_request_vote_response(&mut self, response: RequestVoteResponse) {
        if response.term > self.current_term && !response.vote_granted {
            info!(
                "Node {} saw higher term {} from {} while campaigning",
                self.name, response.term, response.from
            );
            self.step_down_to_follower(Some(response.term)).await;
            return;
        }

        if self.role != Role::Candidate {
            return;
        }
        let Some(election) = self.election.as_mut() else {
            return;
        };
        if election.trial != response.trial_only || election.term != response.vote_term {
            debug!(
                "Node {} ignoring stale vote response from {}",
                self.name, response.from
            );
            return;
        }

        if !response.vote_granted {
            debug!(
                "Node {} vote rejected by {}: {}",
                self.name, response.from, response.message
            );
            return;
        }

        election.votes.insert(response.from.clone());
        debug!(
            "Node {} received {} vote from {} for term {}",
            self.name,
            if response.trial_only { "trial" } else { "real" },
            response.from,
            response.vote_term
        );

        match self.election_won() {
            Some(true) => {
                info!(
                    "Node {} won the trial election for term {}",
                    self.name, response.vote_term
                );
                self.start_real_election(false).await;
            }
            Some(false) => self.become_leader().await,
            None => {}
        }
    }

    /// `Some(trial)` once the current round holds a majority of the committed voters.
    fn election_won(&self) -> Option<bool> {
        let election = self.election.as_ref()?;
        self.topology
            .has_quorum(&election.votes)
            .then_some(election.trial)
    }

    async fn become_leader(&mut self) {
        info!(
            "Node {} became leader for term {}",
            self.name, self.current_term
        );

        self.role = Role::Leader;
        self.leader_id = Some(self.name.clone());
        self.election = None;
        if let Some(timer) = self.election_timer.take() {
            self.timers.del_timer(timer);
        }

        self.next_index.clear();
        self.match_index.clear();
        self.snapshot_states.clear();
        for peer in self.replication_peers() {
            self.next_index.insert(peer.name.clone(), self.last_log_index + 1);
            self.match_index.insert(peer.name, 0);
        }

        self.append_noop().await;
        self.broadcast_append_entries().await;
        self.update_commit_index().await;
        self.reset_heartbeat_timer();
    }

    pub(crate) fn reset_election_timer(&mut self) {
        if let Some(timer) = self.election_timer.take() {
            self.timers.del_timer(timer);
        }
        let (min, max) = (
            self.options.election_timeout_min,
            self.options.election_timeout_max.max(self.options.election_timeout_min),
        );
        let timeout = if max > min {
            let jitter = rand::rng().random_range(0..=(max - min).as_millis() as u64);
            min + Duration::from_millis(jitter)
        } else {
            min
        };
        self.election_timer = Some(self.timers.set_election_timer(timeout));
    }

    pub(crate) fn reset_heartbeat_timer(&mut self) {
        if let Some(timer) = self.heartbeat_timer.take() {
            self.timers.del_timer(timer);
        }
        self.heartbeat_timer = Some(
            self.timers
                .set_heartbeat_timer(self.options.heartbeat_interval),
        );
    }
}
