//! Coordination (CP) Module
//!
//! Strongly consistent primitives for a small, fixed group of designated members.
//!
//! ## Components
//! - **`raft`**: Raft as an explicit Follower/Candidate/Leader state machine that
//!   turns inputs into outputs (messages, timer resets, commits).
//! - **`lock`**: the replicated state machine: sessions and re-entrant locks with
//!   fencing versions, deduplicated by request id.
//! - **`service`**: the driver task of each member and the client API
//!   (`try_lock`, `unlock`, `create_session`, `heartbeat`, `lock_state`).
//! - **`protocol`**: requests forwarded to the leader.

pub mod lock;
pub mod protocol;
pub mod raft;
pub mod service;

pub use lock::{CpCommand, LockOutcome, LockState, SessionId};
pub use protocol::{CpRequest, CpResponse};
pub use raft::RaftMessage;
pub use service::{CpService, CpStatus};
