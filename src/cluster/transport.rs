//! Group Communication Transport
//!
//! The transport provides reliable, agreed-order multicast within a named
//! group, plus membership change notifications. Implementations push
//! `GroupEvent`s into the coordinator's event channel.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use super::NodeId;
use crate::error::{Error, Result};

/// First pause after the transport pushes back
const SEND_RETRY_MIN: Duration = Duration::from_millis(1);
/// Longest pause between multicast retries
const SEND_RETRY_MAX: Duration = Duration::from_millis(100);
/// Multicast retries between error logs
const SEND_RETRY_LOG_EVERY: u32 = 100;

/// Pause between join attempts
const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Join retries between error logs
const JOIN_RETRY_LOG_EVERY: u32 = 10;

/// The groups a coordinator joins
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupName {
    /// Control group every daemon joins at startup
    Daemon,
    /// A fence domain
    Domain(String),
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupName::Daemon => write!(f, "fenced:daemon"),
            GroupName::Domain(name) => write!(f, "fenced:{}", name),
        }
    }
}

/// Why a node appears in a membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Join,
    /// Clean departure
    Leave,
    /// The node crashed or lost the network
    NodeDown,
    /// The daemon process died while the node stayed up
    ProcDown,
    NodeUp,
}

impl LeaveReason {
    /// Departures that make the node a fencing victim
    pub fn is_failure(&self) -> bool {
        matches!(self, LeaveReason::NodeDown | LeaveReason::ProcDown)
    }

    /// Wire-style reason code, used in logs
    pub fn code(&self) -> u32 {
        match self {
            LeaveReason::Join => 1,
            LeaveReason::Leave => 2,
            LeaveReason::NodeDown => 3,
            LeaveReason::NodeUp => 4,
            LeaveReason::ProcDown => 5,
        }
    }
}

/// A node in a membership change list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupAddress {
    pub node_id: NodeId,
    pub reason: LeaveReason,
}

impl GroupAddress {
    pub fn new(node_id: NodeId, reason: LeaveReason) -> Self {
        Self { node_id, reason }
    }

    pub fn member(node_id: NodeId) -> Self {
        Self::new(node_id, LeaveReason::Join)
    }
}

/// Callbacks from the transport, delivered in order per group
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// Membership change
    ConfChg {
        group: GroupName,
        members: Vec<GroupAddress>,
        left: Vec<GroupAddress>,
        joined: Vec<GroupAddress>,
    },
    /// A multicast message
    Deliver {
        group: GroupName,
        from: NodeId,
        data: Vec<u8>,
    },
    /// The underlying ring changed
    Ring {
        group: GroupName,
        ring_node: NodeId,
        ring_seq: u64,
    },
}

impl GroupEvent {
    pub fn group(&self) -> &GroupName {
        match self {
            GroupEvent::ConfChg { group, .. }
            | GroupEvent::Deliver { group, .. }
            | GroupEvent::Ring { group, .. } => group,
        }
    }
}

/// Group communication service.
///
/// Errors: `Error::TryAgain` for transient backpressure, anything else is
/// treated as a hard failure.
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// Join a group; our own join shows up as a `ConfChg`
    async fn join(&self, group: &GroupName) -> Result<()>;

    /// Leave a group
    async fn leave(&self, group: &GroupName) -> Result<()>;

    /// Multicast to every member of the group, ourselves included
    async fn multicast(&self, group: &GroupName, data: &[u8]) -> Result<()>;
}

/// Multicast, retrying transient backpressure with a capped exponential pause
pub async fn send_with_retry<T>(transport: &T, group: &GroupName, data: &[u8], what: &str) -> Result<()>
where
    T: GroupTransport + ?Sized,
{
    let mut retries: u32 = 0;
    let mut pause = SEND_RETRY_MIN;

    loop {
        match transport.multicast(group, data).await {
            Ok(()) => {
                if retries > 0 {
                    tracing::debug!("mcast {} retried {} {}", group, retries, what);
                }
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                retries += 1;
                if retries % SEND_RETRY_LOG_EVERY == 0 {
                    tracing::error!("mcast {} retry {} {}", group, retries, what);
                }
                tokio::time::sleep(pause).await;
                pause = (pause * 2).min(SEND_RETRY_MAX);
            }
            Err(e) => {
                tracing::error!("mcast {} error {} {}", group, e, what);
                return Err(e);
            }
        }
    }
}

/// Join a group, retrying once a second while the transport pushes back
pub async fn join_with_retry<T>(transport: &T, group: &GroupName) -> Result<()>
where
    T: GroupTransport + ?Sized,
{
    let mut retries: u32 = 0;

    loop {
        match transport.join(group).await {
            Ok(()) => {
                tracing::debug!("joined group {}", group);
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                retries += 1;
                if retries % JOIN_RETRY_LOG_EVERY == 0 {
                    tracing::error!("group join {} retry {}", group, retries);
                }
                tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(Error::JoinFailed {
                    group: group.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}
