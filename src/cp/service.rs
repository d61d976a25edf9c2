//! Coordination service: sessions and fenced, re-entrant locks on top of Raft.
//!
//! Each member of the coordination group runs one driver task that owns the
//! `RaftNode`, the lock state machine and the Raft timers. Everything reaches the
//! driver through its inbox, so the state machine is only touched from one task.
//! Any node, member or not, can call the client API; requests are forwarded to the
//! leader.

use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::lock::{CpCommand, LockOutcome, LockState, LockStateMachine, SessionId};
use super::protocol::{CpRequest, CpResponse};
use super::raft::{LogIndex, RaftMessage, RaftNode, RaftOutput, RaftRole, Term};
use crate::config::CpConfig;
use crate::error::{GridError, GridResult};
use crate::membership::types::NodeId;
use crate::transport::ClusterTransport;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpStatus {
    pub role: RaftRole,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    /// Last index folded into the state machine snapshot.
    pub snapshot_index: LogIndex,
}

enum DriverInput {
    Raft(RaftMessage),
    Request {
        request: CpRequest,
        reply: oneshot::Sender<GridResult<CpResponse>>,
    },
}

struct Waiter {
    term: Term,
    reply: oneshot::Sender<GridResult<CpResponse>>,
}

pub struct CpService {
    local_id: NodeId,
    members: Vec<NodeId>,
    config: CpConfig,
    transport: Arc<dyn ClusterTransport>,
    inbox: Option<mpsc::UnboundedSender<DriverInput>>,
    status: watch::Receiver<CpStatus>,
    leader_hint: Mutex<Option<NodeId>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CpService {
    /// Starts the service. Members of the group spawn their Raft driver.
    pub fn start(
        local_id: NodeId,
        config: CpConfig,
        transport: Arc<dyn ClusterTransport>,
    ) -> Arc<Self> {
        let mut members = if config.members.is_empty() {
            vec![local_id.clone()]
        } else {
            config.members.clone()
        };
        members.sort();
        members.dedup();
        let is_member = members.contains(&local_id);

        let (status_tx, status_rx) = watch::channel(CpStatus::default());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let service = Arc::new(Self {
            local_id: local_id.clone(),
            members: members.clone(),
            config: config.clone(),
            transport: transport.clone(),
            inbox: is_member.then_some(inbox_tx),
            status: status_rx,
            leader_hint: Mutex::new(None),
            driver: Mutex::new(None),
        });

        if is_member {
            let driver = Driver::new(
                RaftNode::new(local_id, &members),
                config,
                transport,
                Arc::downgrade(&service),
                status_tx,
            );
            let handle = tokio::spawn(driver.run(inbox_rx));
            if let Ok(mut slot) = service.driver.lock() {
                *slot = Some(handle);
            }
            tracing::info!(members = members.len(), "Joined coordination group");
        } else {
            tracing::info!("Coordination group runs on {:?}", members);
        }
        service
    }

    pub fn is_member(&self) -> bool {
        self.inbox.is_some()
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn status(&self) -> CpStatus {
        self.status.borrow().clone()
    }

    fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.config.election_timeout_max_ms * 4)
    }

    /// How long a request keeps looking for a leader before giving up.
    fn leader_wait(&self) -> Duration {
        Duration::from_millis(self.config.election_timeout_max_ms * 10)
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.config.lock_retry_interval_ms.max(1))
    }

    fn known_leader(&self) -> Option<NodeId> {
        if self.is_member() {
            if let Some(leader) = self.status.borrow().leader.clone() {
                return Some(leader);
            }
        }
        self.leader_hint.lock().ok().and_then(|hint| hint.clone())
    }

    fn set_hint(&self, leader: Option<NodeId>) {
        if let Ok(mut hint) = self.leader_hint.lock() {
            *hint = leader;
        }
    }

    /// Feeds a Raft message from a peer to the local driver.
    pub fn handle_raft(&self, message: RaftMessage) {
        if let Some(inbox) = &self.inbox {
            let _ = inbox.send(DriverInput::Raft(message));
        }
    }

    /// Serves a request at this node. Non-leaders answer `NotLeader`.
    pub async fn handle_request(&self, request: CpRequest) -> GridResult<CpResponse> {
        let Some(inbox) = &self.inbox else {
            return Ok(CpResponse::NotLeader {
                leader: self.known_leader(),
            });
        };
        let wait = match &request {
            CpRequest::Propose { wait_ms, .. } => {
                self.commit_timeout().min(Duration::from_millis(*wait_ms))
            }
            _ => self.commit_timeout(),
        };
        let (reply, rx) = oneshot::channel();
        inbox
            .send(DriverInput::Request { request, reply })
            .map_err(|_| GridError::ShuttingDown)?;
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Err(GridError::ShuttingDown),
            Err(_) => Err(GridError::ConsensusUnavailable),
        }
    }

    fn default_deadline(&self) -> Instant {
        Instant::now() + self.leader_wait()
    }

    /// Sends `request` to the leader, following redirects, until `deadline`. The
    /// search for a leader never outlasts `leader_wait`.
    async fn call(&self, request: CpRequest, deadline: Instant) -> GridResult<CpResponse> {
        let deadline = deadline.min(self.default_deadline());
        let mut attempt = 0usize;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("No coordination leader answered in time");
                return Err(GridError::ConsensusUnavailable);
            }
            let target = self
                .known_leader()
                .unwrap_or_else(|| self.members[attempt % self.members.len()].clone());
            attempt += 1;

            let bounded = request.clone().bounded_by(remaining);
            let sent = async {
                if target == self.local_id {
                    self.handle_request(bounded).await
                } else {
                    self.transport.cp_request(&target, bounded).await
                }
            };
            let result = tokio::time::timeout(remaining, sent)
                .await
                .unwrap_or(Err(GridError::ConsensusUnavailable));

            match result {
                Ok(CpResponse::NotLeader { leader: Some(leader) }) if leader != target => {
                    self.set_hint(Some(leader));
                    continue;
                }
                Ok(CpResponse::NotLeader { .. }) | Err(GridError::Transport { .. }) => {
                    self.set_hint(None);
                }
                Ok(response) => {
                    if !self.is_member() {
                        self.set_hint(Some(target));
                    }
                    return Ok(response);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("No leader of the coordination group in time");
                return Err(GridError::ConsensusUnavailable);
            }
            tokio::time::sleep(self.retry_interval().min(deadline - now)).await;
        }
    }

    async fn propose(&self, command: CpCommand, deadline: Instant) -> GridResult<LockOutcome> {
        let request = CpRequest::Propose {
            command,
            wait_ms: self.commit_timeout().as_millis() as u64,
        };
        match self.call(request, deadline).await? {
            CpResponse::Outcome(outcome) => Ok(outcome),
            other => Err(GridError::Serialization(format!(
                "unexpected coordination response: {:?}",
                other
            ))),
        }
    }

    pub async fn create_session(&self) -> GridResult<SessionId> {
        let session = uuid::Uuid::new_v4().to_string();
        self.propose(
            CpCommand::CreateSession {
                session: session.clone(),
            },
            self.default_deadline(),
        )
        .await?;
        tracing::debug!("Created session {}", session);
        Ok(session)
    }

    /// Extends the session's lease. `false` if the session has expired.
    pub async fn heartbeat(&self, session: &str) -> GridResult<bool> {
        match self
            .call(
                CpRequest::Heartbeat {
                    session: session.to_string(),
                },
                self.default_deadline(),
            )
            .await?
        {
            CpResponse::Heartbeat(alive) => Ok(alive),
            other => Err(GridError::Serialization(format!(
                "unexpected coordination response: {:?}",
                other
            ))),
        }
    }

    /// Heartbeats `session` at a third of the lease until the task is aborted or the
    /// session expires.
    pub fn keep_alive(self: &Arc<Self>, session: &str) -> JoinHandle<()> {
        let service = self.clone();
        let session = session.to_string();
        let period = Duration::from_millis((self.config.session_lease_ms / 3).max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match service.heartbeat(&session).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("Session {} expired", session);
                        break;
                    }
                    Err(e) => tracing::debug!("Heartbeat of session {} failed: {}", session, e),
                }
            }
        })
    }

    /// Tries to take `lock` for `session`, retrying while another session holds it.
    /// Returns `false` if the lock was still held at the deadline, and
    /// `ConsensusUnavailable` if no leader with a quorum answered by then. Every
    /// attempt gets at least one election timeout, so `Duration::ZERO` still makes
    /// one attempt.
    pub async fn try_lock(&self, lock: &str, session: &str, timeout: Duration) -> GridResult<bool> {
        let deadline = Instant::now() + timeout;
        let floor = Duration::from_millis(self.config.election_timeout_max_ms.max(1));
        loop {
            let outcome = self
                .propose(
                    CpCommand::Acquire {
                        lock: lock.to_string(),
                        session: session.to_string(),
                        request_id: uuid::Uuid::new_v4().to_string(),
                    },
                    deadline.max(Instant::now() + floor),
                )
                .await?;
            match outcome {
                LockOutcome::Acquired { fence } => {
                    tracing::debug!(fence, "Session {} acquired '{}'", session, lock);
                    return Ok(true);
                }
                LockOutcome::Busy { .. } => {}
                LockOutcome::UnknownSession => {
                    return Err(GridError::Rejected {
                        reason: format!("session {} is not alive", session),
                    });
                }
                other => {
                    return Err(GridError::Rejected {
                        reason: format!("unexpected lock outcome {:?}", other),
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.retry_interval().min(deadline - now)).await;
        }
    }

    pub async fn unlock(&self, lock: &str, session: &str) -> GridResult<()> {
        let outcome = self
            .propose(
                CpCommand::Release {
                    lock: lock.to_string(),
                    session: session.to_string(),
                    request_id: uuid::Uuid::new_v4().to_string(),
                },
                self.default_deadline(),
            )
            .await?;
        match outcome {
            LockOutcome::Released { .. } => Ok(()),
            _ => Err(GridError::NotOwnerOfLock {
                lock: lock.to_string(),
                session: session.to_string(),
            }),
        }
    }

    /// Holder, hold count and fencing version of `lock`, as seen by the leader.
    pub async fn lock_state(&self, lock: &str) -> GridResult<LockState> {
        match self
            .call(
                CpRequest::LockState {
                    lock: lock.to_string(),
                },
                self.default_deadline(),
            )
            .await?
        {
            CpResponse::LockState(state) => Ok(state),
            other => Err(GridError::Serialization(format!(
                "unexpected coordination response: {:?}",
                other
            ))),
        }
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> GridResult<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.known_leader() {
                return Ok(leader);
            }
            if !self.is_member() {
                self.lock_state("").await?;
                continue;
            }
            if Instant::now() >= deadline {
                return Err(GridError::ConsensusUnavailable);
            }
            tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms.max(1))).await;
        }
    }

    pub fn shutdown(&self) {
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                handle.abort();
            }
        }
    }
}

/// Owner of the Raft node and the lock state machine of one member.
struct Driver {
    node: RaftNode,
    machine: LockStateMachine,
    config: CpConfig,
    transport: Arc<dyn ClusterTransport>,
    service: Weak<CpService>,
    status: watch::Sender<CpStatus>,
    waiters: HashMap<LogIndex, Waiter>,
    session_heartbeats: HashMap<SessionId, Instant>,
    expiring: HashSet<SessionId>,
    peer_contact: HashMap<NodeId, Instant>,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl Driver {
    fn new(
        node: RaftNode,
        config: CpConfig,
        transport: Arc<dyn ClusterTransport>,
        service: Weak<CpService>,
        status: watch::Sender<CpStatus>,
    ) -> Self {
        let now = Instant::now();
        // A single-member group elects itself at once.
        let election_deadline = if node.peers().is_empty() {
            now
        } else {
            now + random_election_timeout(&config)
        };
        Self {
            node,
            machine: LockStateMachine::new(),
            config,
            transport,
            service,
            status,
            waiters: HashMap::new(),
            session_heartbeats: HashMap::new(),
            expiring: HashSet::new(),
            peer_contact: HashMap::new(),
            election_deadline,
            heartbeat_deadline: now,
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<DriverInput>) {
        let mut maintenance =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms.max(1)));
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let leader = self.node.is_leader();
            tokio::select! {
                input = inbox.recv() => match input {
                    Some(DriverInput::Raft(message)) => {
                        self.peer_contact.insert(message.from().clone(), Instant::now());
                        let outputs = self.node.handle_message(message);
                        self.process(outputs);
                    }
                    Some(DriverInput::Request { request, reply }) => self.serve(request, reply),
                    None => break,
                },
                _ = tokio::time::sleep_until(self.election_deadline), if !leader => {
                    tracing::debug!(term = self.node.current_term() + 1, "Election timeout, starting election");
                    let outputs = self.node.handle_election_timeout();
                    self.process(outputs);
                }
                _ = tokio::time::sleep_until(self.heartbeat_deadline), if leader => {
                    let outputs = self.node.handle_heartbeat_timeout();
                    self.process(outputs);
                }
                _ = maintenance.tick() => self.expire_lapsed_sessions(),
            }
            self.publish_status();
        }
        tracing::debug!("Coordination driver stopped");
    }

    fn publish_status(&self) {
        let status = CpStatus {
            role: self.node.role(),
            term: self.node.current_term(),
            leader: self.node.leader().cloned(),
            commit_index: self.node.commit_index(),
            snapshot_index: self.node.snapshot_index(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn process(&mut self, outputs: Vec<RaftOutput>) {
        // Outputs raised while handling a commit go after the rest of the batch, so
        // the state machine applies entries in index order.
        let mut queue: VecDeque<RaftOutput> = outputs.into();
        while let Some(output) = queue.pop_front() {
            match output {
                RaftOutput::Send { to, message } => {
                    let transport = self.transport.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.send_raft(&to, message).await {
                            tracing::trace!("Raft message to {} dropped: {}", to, e);
                        }
                    });
                }
                RaftOutput::ResetElectionTimer => {
                    self.election_deadline = Instant::now() + random_election_timeout(&self.config);
                }
                RaftOutput::ResetHeartbeatTimer => {
                    self.heartbeat_deadline =
                        Instant::now() + Duration::from_millis(self.config.heartbeat_interval_ms);
                }
                RaftOutput::Commit(entry) => {
                    let outcome = self.machine.apply(&entry.command);
                    let follow_up = self.on_commit(entry.index, entry.term, entry.command, outcome);
                    queue.extend(follow_up);
                }
                RaftOutput::Restore(state) => {
                    tracing::info!(
                        index = self.node.snapshot_index(),
                        "Installed coordination snapshot from the leader"
                    );
                    self.machine = state;
                }
                RaftOutput::BecameLeader => {
                    tracing::info!(term = self.node.current_term(), "Became coordination leader");
                    let now = Instant::now();
                    for peer in self.node.peers() {
                        self.peer_contact.insert(peer.clone(), now);
                    }
                    // Sessions get a full lease from the new leader.
                    self.session_heartbeats = self
                        .machine
                        .sessions()
                        .map(|s| (s.clone(), now))
                        .collect();
                    self.expiring.clear();
                }
                RaftOutput::SteppedDown => {
                    tracing::info!(term = self.node.current_term(), "Stepped down as coordination leader");
                }
            }
        }
        self.maybe_compact();
    }

    /// `machine` reflects every entry up to `last_applied` once a batch of outputs
    /// has been processed.
    fn maybe_compact(&mut self) {
        let applied = self.node.last_applied();
        if applied - self.node.snapshot_index() < self.config.snapshot_threshold.max(1) {
            return;
        }
        self.node.compact(applied, self.machine.clone());
        tracing::debug!(index = applied, "Compacted coordination log");
    }

    fn on_commit(
        &mut self,
        index: LogIndex,
        term: Term,
        command: CpCommand,
        outcome: LockOutcome,
    ) -> Vec<RaftOutput> {
        match (&command, &outcome) {
            (CpCommand::CreateSession { session }, _) => {
                self.session_heartbeats.insert(session.clone(), Instant::now());
            }
            (CpCommand::ExpireSession { session }, LockOutcome::SessionExpired { released }) => {
                self.session_heartbeats.remove(session);
                self.expiring.remove(session);
                tracing::info!("Session {} expired, released {:?}", session, released);
            }
            _ => {}
        }

        let Some(waiter) = self.waiters.remove(&index) else {
            return Vec::new();
        };
        if waiter.term != term {
            // Our entry was overwritten by another leader's.
            let _ = waiter.reply.send(Err(GridError::ConsensusUnavailable));
            return Vec::new();
        }
        if waiter.reply.send(Ok(CpResponse::Outcome(outcome.clone()))).is_err() {
            return self.compensate(command, outcome);
        }
        Vec::new()
    }

    /// The caller of an acquire gave up before it committed: release that hold.
    fn compensate(&mut self, command: CpCommand, outcome: LockOutcome) -> Vec<RaftOutput> {
        let (CpCommand::Acquire { lock, session, .. }, LockOutcome::Acquired { .. }) =
            (command, outcome)
        else {
            return Vec::new();
        };
        tracing::info!("Releasing '{}' acquired by {} after its caller left", lock, session);
        let release = CpCommand::Release {
            lock,
            session,
            request_id: uuid::Uuid::new_v4().to_string(),
        };
        if let Some((_, _, outputs)) = self.node.propose(release.clone()) {
            return outputs;
        }
        let service = self.service.clone();
        tokio::spawn(async move {
            if let Some(service) = service.upgrade() {
                if let Err(e) = service.propose(release, service.default_deadline()).await {
                    tracing::warn!("Compensating release failed: {}", e);
                }
            }
        });
        Vec::new()
    }

    fn has_quorum(&self) -> bool {
        let window = Duration::from_millis(self.config.election_timeout_max_ms * 2);
        let now = Instant::now();
        let reachable = self
            .node
            .peers()
            .iter()
            .filter(|p| {
                self.peer_contact
                    .get(*p)
                    .is_some_and(|seen| now.duration_since(*seen) <= window)
            })
            .count();
        reachable + 1 >= self.node.quorum()
    }

    fn serve(&mut self, request: CpRequest, reply: oneshot::Sender<GridResult<CpResponse>>) {
        if !self.node.is_leader() {
            let _ = reply.send(Ok(CpResponse::NotLeader {
                leader: self.node.leader().cloned(),
            }));
            return;
        }
        if !self.has_quorum() {
            let _ = reply.send(Err(GridError::ConsensusUnavailable));
            return;
        }

        match request {
            CpRequest::Propose { command, .. } => {
                if let Some(outcome) = self.precheck(&command) {
                    let _ = reply.send(Ok(CpResponse::Outcome(outcome)));
                    return;
                }
                if let Some((index, term, outputs)) = self.node.propose(command) {
                    self.waiters.insert(index, Waiter { term, reply });
                    self.process(outputs);
                }
            }
            CpRequest::Heartbeat { session } => {
                let alive = self.machine.has_session(&session);
                if alive {
                    self.session_heartbeats.insert(session, Instant::now());
                }
                let _ = reply.send(Ok(CpResponse::Heartbeat(alive)));
            }
            CpRequest::LockState { lock } => {
                let _ = reply.send(Ok(CpResponse::LockState(self.machine.lock(&lock))));
            }
        }
    }

    /// Answers commands that would not change the state without appending them.
    fn precheck(&self, command: &CpCommand) -> Option<LockOutcome> {
        match command {
            CpCommand::Acquire { lock, session, .. } => {
                if !self.machine.has_session(session) {
                    return Some(LockOutcome::UnknownSession);
                }
                match self.machine.lock(lock).holder {
                    Some(holder) if &holder != session => Some(LockOutcome::Busy { holder }),
                    _ => None,
                }
            }
            CpCommand::Release { lock, session, .. } => {
                (self.machine.lock(lock).holder.as_ref() != Some(session)).then_some(LockOutcome::NotOwner)
            }
            _ => None,
        }
    }

    fn expire_lapsed_sessions(&mut self) {
        if !self.node.is_leader() {
            return;
        }
        let lease = Duration::from_millis(self.config.session_lease_ms);
        let now = Instant::now();
        let lapsed: Vec<SessionId> = self
            .machine
            .sessions()
            .filter(|s| !self.expiring.contains(*s))
            .filter(|s| {
                self.session_heartbeats
                    .get(*s)
                    .is_some_and(|last| now.duration_since(*last) > lease)
            })
            .cloned()
            .collect();

        for session in lapsed {
            tracing::info!("Session {} missed its lease, expiring", session);
            self.expiring.insert(session.clone());
            if let Some((_, _, outputs)) = self.node.propose(CpCommand::ExpireSession { session }) {
                self.process(outputs);
            }
        }
    }
}

fn random_election_timeout(config: &CpConfig) -> Duration {
    let min = config.election_timeout_min_ms;
    let max = config.election_timeout_max_ms.max(min + 1);
    Duration::from_millis(rand::thread_rng().gen_range(min..max))
}
