//! Fencekeeper - Cluster Fencing Coordinator
//!
//! Keeps the nodes of a fence domain in agreement on membership changes and
//! makes sure every failed node is fenced exactly once before the survivors
//! touch shared storage again.
//!
//! # Architecture
//!
//! Every change of the domain group's membership goes through the same
//! steps on every member: wait for the ring and quorum to settle, exchange
//! START messages, elect a master, and let the master fence the victims.
//! Fencing results are multicast so every member keeps the same history.
//!
//! # Features
//!
//! - Daemon protocol version negotiation with stateful-merge detection
//! - START matching across overlapping membership changes
//! - Post-join and post-fail delays that spare nodes rejoining cleanly
//! - Fence agent retries with administrator override over a FIFO
//! - External fencing notices and per-node fencing history queries

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod fencing;
pub mod protocol;
pub mod state;

pub use config::FenceConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{GroupEvent, GroupName, GroupTransport, NodeId, QuorumService};
    pub use crate::config::FenceConfig;
    pub use crate::coordinator::{Coordinator, CoordinatorHandle, Event};
    pub use crate::domain::{Domain, DomainInfo, NodeFilter, NodeInfo};
    pub use crate::error::{Error, Result};
    pub use crate::fencing::{FenceAgent, FenceOutcome, ManualOverride};
}

/// Wall clock seconds, the unit every history timestamp uses
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
