//! The replicated lock state machine.
//!
//! Applied in log order on every member of the coordination group, so every member
//! holds the same locks and sessions. A lock moves `FREE -> HELD(s)`, re-enters
//! `HELD(s) -> HELD(s)` and returns to `FREE` once its holder released every hold or
//! its session expired.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type SessionId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpCommand {
    CreateSession {
        session: SessionId,
    },
    Acquire {
        lock: String,
        session: SessionId,
        request_id: String,
    },
    Release {
        lock: String,
        session: SessionId,
        request_id: String,
    },
    ExpireSession {
        session: SessionId,
    },
    /// Appended by a new leader.
    Noop,
}

impl CpCommand {
    fn request(&self) -> Option<(&SessionId, &str)> {
        match self {
            CpCommand::Acquire {
                session,
                request_id,
                ..
            }
            | CpCommand::Release {
                session,
                request_id,
                ..
            } => Some((session, request_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOutcome {
    SessionCreated,
    /// `fence` grows with every grant of the lock to a new holder.
    Acquired { fence: u64 },
    Busy { holder: SessionId },
    Released { remaining_holds: u32 },
    NotOwner,
    UnknownSession,
    SessionExpired { released: Vec<String> },
    Noop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub holder: Option<SessionId>,
    pub hold_count: u32,
    pub acquisition_version: u64,
}

impl LockState {
    pub fn is_free(&self) -> bool {
        self.holder.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStateMachine {
    locks: BTreeMap<String, LockState>,
    sessions: BTreeSet<SessionId>,
    /// Latest request of each session and its outcome.
    last_request: HashMap<SessionId, (String, LockOutcome)>,
}

impl LockStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, command: &CpCommand) -> LockOutcome {
        if let Some((session, request_id)) = command.request() {
            if let Some((last_id, outcome)) = self.last_request.get(session) {
                if last_id == request_id {
                    return outcome.clone();
                }
            }
        }

        let outcome = match command {
            CpCommand::CreateSession { session } => {
                self.sessions.insert(session.clone());
                LockOutcome::SessionCreated
            }
            CpCommand::Acquire { lock, session, .. } => self.acquire(lock, session),
            CpCommand::Release { lock, session, .. } => self.release(lock, session),
            CpCommand::ExpireSession { session } => self.expire(session),
            CpCommand::Noop => LockOutcome::Noop,
        };

        if let Some((session, request_id)) = command.request() {
            if self.sessions.contains(session) {
                self.last_request
                    .insert(session.clone(), (request_id.to_string(), outcome.clone()));
            }
        }
        outcome
    }

    fn acquire(&mut self, lock: &str, session: &SessionId) -> LockOutcome {
        if !self.sessions.contains(session) {
            return LockOutcome::UnknownSession;
        }
        let state = self.locks.entry(lock.to_string()).or_default();
        match &state.holder {
            None => {
                state.holder = Some(session.clone());
                state.hold_count = 1;
                state.acquisition_version += 1;
                LockOutcome::Acquired {
                    fence: state.acquisition_version,
                }
            }
            Some(holder) if holder == session => {
                state.hold_count += 1;
                LockOutcome::Acquired {
                    fence: state.acquisition_version,
                }
            }
            Some(holder) => LockOutcome::Busy {
                holder: holder.clone(),
            },
        }
    }

    fn release(&mut self, lock: &str, session: &SessionId) -> LockOutcome {
        let Some(state) = self.locks.get_mut(lock) else {
            return LockOutcome::NotOwner;
        };
        if state.holder.as_ref() != Some(session) {
            return LockOutcome::NotOwner;
        }
        state.hold_count -= 1;
        if state.hold_count == 0 {
            state.holder = None;
        }
        LockOutcome::Released {
            remaining_holds: state.hold_count,
        }
    }

    fn expire(&mut self, session: &SessionId) -> LockOutcome {
        if !self.sessions.remove(session) {
            return LockOutcome::UnknownSession;
        }
        self.last_request.remove(session);
        let mut released = Vec::new();
        for (name, state) in self.locks.iter_mut() {
            if state.holder.as_ref() == Some(session) {
                state.holder = None;
                state.hold_count = 0;
                released.push(name.clone());
            }
        }
        LockOutcome::SessionExpired { released }
    }

    pub fn lock(&self, name: &str) -> LockState {
        self.locks.get(name).cloned().unwrap_or_default()
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.sessions.contains(session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.sessions.iter()
    }

    /// Names of the locks `session` holds.
    pub fn held_by(&self, session: &str) -> Vec<String> {
        self.locks
            .iter()
            .filter(|(_, s)| s.holder.as_deref() == Some(session))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
