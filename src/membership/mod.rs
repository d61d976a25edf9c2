//! Membership & Discovery Module
//!
//! Implements a Gossip-based membership protocol (inspired by SWIM) to manage the cluster topology.
//! Nodes use this service to discover each other, detect failures, and publish versioned
//! membership events that drive partition rebalancing.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Nodes periodically exchange status updates via UDP.
//! - **Failure Detection**: "Suspect" -> "Dead" transitions with timeouts.
//! - **Incarnation Numbers**: Resolve disputes about a node's state.
//! - **Membership Events**: Every change of the live set bumps a version and is broadcast
//!   to subscribers (`subscribe`). Embedded clusters use a detached service fed by
//!   `admit` / `mark_dead`.

pub mod service;
pub mod types;
