//! Raft consensus state machine.
//!
//! A pure state machine: inputs are timer firings, client proposals and peer
//! messages; outputs are messages to send, timer resets and committed entries. The
//! driver in `service.rs` owns the timers and the network.
//!
//! Applied entries can be folded into a snapshot of the lock state machine with
//! `compact`, after which the log only keeps the entries that follow it. A follower
//! whose next entry was compacted away receives the snapshot instead.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::lock::{CpCommand, LockStateMachine};
use crate::membership::types::NodeId;

pub type Term = u64;
pub type LogIndex = u64;

/// Upper bound on entries shipped in one AppendEntries.
const MAX_ENTRIES_PER_APPEND: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RaftRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: CpCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: Term,
        candidate: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    VoteResponse {
        term: Term,
        from: NodeId,
        granted: bool,
    },
    AppendEntries {
        term: Term,
        leader: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendResponse {
        term: Term,
        from: NodeId,
        success: bool,
        /// Last index known to match the leader (on success) or the follower's last
        /// index (on rejection).
        match_index: LogIndex,
    },
    InstallSnapshot {
        term: Term,
        leader: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        state: LockStateMachine,
    },
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. } => *term,
        }
    }

    pub fn from(&self) -> &NodeId {
        match self {
            RaftMessage::RequestVote { candidate, .. } => candidate,
            RaftMessage::VoteResponse { from, .. } => from,
            RaftMessage::AppendEntries { leader, .. } => leader,
            RaftMessage::AppendResponse { from, .. } => from,
            RaftMessage::InstallSnapshot { leader, .. } => leader,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RaftOutput {
    Send { to: NodeId, message: RaftMessage },
    ResetElectionTimer,
    ResetHeartbeatTimer,
    /// Entry committed by a majority, emitted in index order.
    Commit(LogEntry),
    /// Replace the applied state with a snapshot received from the leader.
    Restore(LockStateMachine),
    BecameLeader,
    SteppedDown,
}

#[derive(Debug)]
pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    quorum: usize,

    current_term: Term,
    voted_for: Option<NodeId>,
    /// `log[i]` holds index `snapshot_index + i + 1`.
    log: Vec<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    /// State after applying every entry up to `snapshot_index`.
    snapshot: LockStateMachine,

    role: RaftRole,
    commit_index: LogIndex,
    last_applied: LogIndex,

    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    votes: HashSet<NodeId>,
    leader: Option<NodeId>,
}

impl RaftNode {
    /// `members` is the whole group, this node included.
    pub fn new(id: NodeId, members: &[NodeId]) -> Self {
        let mut peers: Vec<NodeId> = members.iter().filter(|m| **m != id).cloned().collect();
        peers.sort();
        peers.dedup();
        let quorum = (peers.len() + 1) / 2 + 1;
        Self {
            id,
            peers,
            quorum,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            snapshot: LockStateMachine::default(),
            role: RaftRole::Follower,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            leader: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    /// Entries held in the log, the compacted prefix excluded.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn last_index(&self) -> LogIndex {
        self.snapshot_index + self.log.len() as LogIndex
    }

    fn last_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }

    /// 0 for indices inside the compacted prefix, except its last one.
    fn term_at(&self, index: LogIndex) -> Term {
        if index == self.snapshot_index {
            return self.snapshot_term;
        }
        self.entry(index).map(|e| e.term).unwrap_or(0)
    }

    fn has_entry(&self, index: LogIndex, term: Term) -> bool {
        index == 0 || (index <= self.last_index() && self.term_at(index) == term)
    }

    /// Folds the applied entries up to `through` into `state`, the lock state
    /// machine as of that index, and drops them from the log.
    pub fn compact(&mut self, through: LogIndex, state: LockStateMachine) {
        if through <= self.snapshot_index || through > self.last_applied {
            return;
        }
        let term = self.term_at(through);
        self.log.drain(..(through - self.snapshot_index) as usize);
        self.snapshot_index = through;
        self.snapshot_term = term;
        self.snapshot = state;
    }

    /// Candidate log at least as up-to-date as ours: compare last terms, then lengths.
    fn is_up_to_date(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        last_log_term > self.last_term()
            || (last_log_term == self.last_term() && last_log_index >= self.last_index())
    }

    pub fn handle_election_timeout(&mut self) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        if self.role == RaftRole::Leader {
            return outputs;
        }

        self.current_term += 1;
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.id.clone());
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.leader = None;

        outputs.push(RaftOutput::ResetElectionTimer);
        for peer in &self.peers {
            outputs.push(RaftOutput::Send {
                to: peer.clone(),
                message: RaftMessage::RequestVote {
                    term: self.current_term,
                    candidate: self.id.clone(),
                    last_log_index: self.last_index(),
                    last_log_term: self.last_term(),
                },
            });
        }

        // Single-member group.
        if self.votes.len() >= self.quorum {
            outputs.extend(self.become_leader());
        }
        outputs
    }

    pub fn handle_heartbeat_timeout(&mut self) -> Vec<RaftOutput> {
        if self.role != RaftRole::Leader {
            return Vec::new();
        }
        let mut outputs: Vec<RaftOutput> = self
            .peers
            .iter()
            .map(|peer| self.append_entries_for(peer))
            .collect();
        outputs.push(RaftOutput::ResetHeartbeatTimer);
        outputs
    }

    /// Appends a command to the leader's log. `None` if this node is not the leader.
    pub fn propose(&mut self, command: CpCommand) -> Option<(LogIndex, Term, Vec<RaftOutput>)> {
        if self.role != RaftRole::Leader {
            return None;
        }
        let index = self.last_index() + 1;
        self.log.push(LogEntry {
            term: self.current_term,
            index,
            command,
        });

        let mut outputs: Vec<RaftOutput> = self
            .peers
            .iter()
            .map(|peer| self.append_entries_for(peer))
            .collect();
        outputs.extend(self.try_advance_commit_index());
        Some((index, self.current_term, outputs))
    }

    pub fn handle_message(&mut self, message: RaftMessage) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        if message.term() > self.current_term {
            outputs.extend(self.step_down(message.term()));
        }

        match message {
            RaftMessage::RequestVote {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => outputs.extend(self.handle_request_vote(term, candidate, last_log_index, last_log_term)),
            RaftMessage::VoteResponse {
                term,
                from,
                granted,
            } => outputs.extend(self.handle_vote_response(term, from, granted)),
            RaftMessage::AppendEntries {
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => outputs.extend(self.handle_append_entries(
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            )),
            RaftMessage::AppendResponse {
                term,
                from,
                success,
                match_index,
            } => outputs.extend(self.handle_append_response(term, from, success, match_index)),
            RaftMessage::InstallSnapshot {
                term,
                leader,
                last_included_index,
                last_included_term,
                state,
            } => outputs.extend(self.handle_install_snapshot(
                term,
                leader,
                last_included_index,
                last_included_term,
                state,
            )),
        }
        outputs
    }

    fn step_down(&mut self, term: Term) -> Vec<RaftOutput> {
        let was_leader = self.role == RaftRole::Leader;
        self.current_term = term;
        self.role = RaftRole::Follower;
        self.voted_for = None;
        self.votes.clear();
        self.leader = None;
        if was_leader {
            vec![RaftOutput::SteppedDown]
        } else {
            Vec::new()
        }
    }

    fn handle_request_vote(
        &mut self,
        term: Term,
        candidate: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        let can_vote = match &self.voted_for {
            None => true,
            Some(id) => *id == candidate,
        };
        let granted = term >= self.current_term
            && can_vote
            && self.is_up_to_date(last_log_term, last_log_index);

        if granted {
            self.voted_for = Some(candidate.clone());
            outputs.push(RaftOutput::ResetElectionTimer);
        }
        outputs.push(RaftOutput::Send {
            to: candidate,
            message: RaftMessage::VoteResponse {
                term: self.current_term,
                from: self.id.clone(),
                granted,
            },
        });
        outputs
    }

    fn handle_vote_response(&mut self, term: Term, from: NodeId, granted: bool) -> Vec<RaftOutput> {
        if self.role != RaftRole::Candidate || term != self.current_term || !granted {
            return Vec::new();
        }
        self.votes.insert(from);
        if self.votes.len() >= self.quorum {
            return self.become_leader();
        }
        Vec::new()
    }

    /// Takes over as leader and appends a no-op so entries of earlier terms commit.
    fn become_leader(&mut self) -> Vec<RaftOutput> {
        self.role = RaftRole::Leader;
        self.leader = Some(self.id.clone());

        let next = self.last_index() + 1;
        for peer in &self.peers {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer.clone(), 0);
        }

        let mut outputs = vec![RaftOutput::BecameLeader, RaftOutput::ResetHeartbeatTimer];
        if let Some((_, _, appended)) = self.propose(CpCommand::Noop) {
            outputs.extend(appended);
        }
        outputs
    }

    fn handle_append_entries(
        &mut self,
        term: Term,
        leader: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if term < self.current_term {
            outputs.push(self.append_response(leader, false, self.last_index()));
            return outputs;
        }

        if self.role == RaftRole::Candidate {
            self.role = RaftRole::Follower;
            self.votes.clear();
        }
        self.leader = Some(leader.clone());
        outputs.push(RaftOutput::ResetElectionTimer);

        // Compacted entries were committed, so they match the leader's.
        let matches =
            prev_log_index < self.snapshot_index || self.has_entry(prev_log_index, prev_log_term);
        if !matches {
            let hint = self.last_index().min(prev_log_index.saturating_sub(1));
            outputs.push(self.append_response(leader, false, hint));
            return outputs;
        }

        let mut last_new = prev_log_index;
        for entry in entries {
            last_new = entry.index;
            if entry.index <= self.snapshot_index {
                continue;
            }
            if entry.index <= self.last_index() {
                if self.term_at(entry.index) == entry.term {
                    continue;
                }
                // Conflict: drop the entry and everything after it.
                self.log
                    .truncate((entry.index - self.snapshot_index - 1) as usize);
            }
            self.log.push(entry);
        }

        if leader_commit > self.commit_index {
            let new_commit = leader_commit.min(last_new.max(self.commit_index));
            outputs.extend(self.apply_committed(new_commit));
        }

        outputs.push(self.append_response(leader, true, last_new));
        outputs
    }

    fn handle_install_snapshot(
        &mut self,
        term: Term,
        leader: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        state: LockStateMachine,
    ) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if term < self.current_term {
            outputs.push(self.append_response(leader, false, self.last_index()));
            return outputs;
        }

        if self.role == RaftRole::Candidate {
            self.role = RaftRole::Follower;
            self.votes.clear();
        }
        self.leader = Some(leader.clone());
        outputs.push(RaftOutput::ResetElectionTimer);

        if last_included_index <= self.commit_index {
            outputs.push(self.append_response(leader, true, last_included_index));
            return outputs;
        }

        if self.has_entry(last_included_index, last_included_term) {
            self.log
                .drain(..(last_included_index - self.snapshot_index) as usize);
        } else {
            self.log.clear();
        }
        self.snapshot_index = last_included_index;
        self.snapshot_term = last_included_term;
        self.snapshot = state.clone();
        self.commit_index = last_included_index;
        self.last_applied = last_included_index;

        outputs.push(RaftOutput::Restore(state));
        outputs.push(self.append_response(leader, true, last_included_index));
        outputs
    }

    fn append_response(&self, to: NodeId, success: bool, match_index: LogIndex) -> RaftOutput {
        RaftOutput::Send {
            to,
            message: RaftMessage::AppendResponse {
                term: self.current_term,
                from: self.id.clone(),
                success,
                match_index,
            },
        }
    }

    fn handle_append_response(
        &mut self,
        term: Term,
        from: NodeId,
        success: bool,
        match_index: LogIndex,
    ) -> Vec<RaftOutput> {
        if self.role != RaftRole::Leader || term != self.current_term {
            return Vec::new();
        }

        if success {
            let known = self.match_index.get(&from).copied().unwrap_or(0);
            if match_index > known {
                self.match_index.insert(from.clone(), match_index);
            }
            self.next_index.insert(from, match_index.max(known) + 1);
            return self.try_advance_commit_index();
        }

        let next = self.next_index.get(&from).copied().unwrap_or(1);
        let retry = next.saturating_sub(1).min(match_index + 1).max(1);
        self.next_index.insert(from.clone(), retry);
        vec![self.append_entries_for(&from)]
    }

    fn append_entries_for(&self, peer: &NodeId) -> RaftOutput {
        let next = self.next_index.get(peer).copied().unwrap_or(1).max(1);
        if next <= self.snapshot_index {
            return RaftOutput::Send {
                to: peer.clone(),
                message: RaftMessage::InstallSnapshot {
                    term: self.current_term,
                    leader: self.id.clone(),
                    last_included_index: self.snapshot_index,
                    last_included_term: self.snapshot_term,
                    state: self.snapshot.clone(),
                },
            };
        }
        let prev_log_index = next - 1;
        let entries: Vec<LogEntry> = self
            .log
            .iter()
            .skip((prev_log_index - self.snapshot_index) as usize)
            .take(MAX_ENTRIES_PER_APPEND)
            .cloned()
            .collect();
        RaftOutput::Send {
            to: peer.clone(),
            message: RaftMessage::AppendEntries {
                term: self.current_term,
                leader: self.id.clone(),
                prev_log_index,
                prev_log_term: self.term_at(prev_log_index),
                entries,
                leader_commit: self.commit_index,
            },
        }
    }

    /// Commits the highest current-term index stored on a majority.
    fn try_advance_commit_index(&mut self) -> Vec<RaftOutput> {
        if self.role != RaftRole::Leader {
            return Vec::new();
        }
        let mut target = self.commit_index;
        for index in (self.commit_index + 1)..=self.last_index() {
            if self.term_at(index) != self.current_term {
                continue;
            }
            let replicas = 1 + self
                .peers
                .iter()
                .filter(|p| self.match_index.get(*p).is_some_and(|m| *m >= index))
                .count();
            if replicas >= self.quorum {
                target = index;
            }
        }
        self.apply_committed(target)
    }

    fn apply_committed(&mut self, new_commit: LogIndex) -> Vec<RaftOutput> {
        let new_commit = new_commit.min(self.last_index());
        if new_commit <= self.commit_index {
            return Vec::new();
        }
        self.commit_index = new_commit;

        let mut outputs = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            if let Some(entry) = self.entry(self.last_applied) {
                outputs.push(RaftOutput::Commit(entry.clone()));
            }
        }
        outputs
    }
}
