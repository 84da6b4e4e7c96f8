//! Cluster Module
//!
//! Seams to the services the coordinator runs on top of: the group
//! communication transport that delivers membership changes and messages,
//! and the quorum service that knows which configured nodes are cluster
//! members.

mod quorum;
mod transport;

pub use quorum::{ClusterNode, ClusterSnapshot, ClusterView, QuorumService};
pub use transport::{
    join_with_retry, send_with_retry, GroupAddress, GroupEvent, GroupName, GroupTransport,
    LeaveReason,
};

/// Cluster node identifier, zero is never a valid node
pub type NodeId = u32;
