//! Daemon Protocol Version Negotiation
//!
//! Every daemon advertises the highest protocol it speaks in the daemon
//! group. Once a version has been heard from every member, each node picks
//! the same minimum; a late joiner adopts the first running version it sees.
//! The same bookkeeping tells whether a node restarted cleanly: a node that
//! joined the daemon group and then sent a non-stateful protocol message
//! holds no uncontrolled shared-storage state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::error::{Error, Result};

/// Flag bit set once a daemon has completed a domain change
pub const PV_STATEFUL: u16 = 0x0001;

/// Highest protocol this build speaks
pub const DAEMON_MAX: ProtocolVersion = ProtocolVersion::new(1, 1, 1);

/// A protocol version triple plus flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub flags: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
            flags: 0,
        }
    }

    /// Zero major means "not set"
    pub fn is_set(&self) -> bool {
        self.major != 0
    }

    pub fn is_stateful(&self) -> bool {
        self.flags & PV_STATEFUL != 0
    }

    /// Same major and minor, which is what message compatibility requires
    pub fn compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Max and running versions of one daemon, as carried in PROTOCOL messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub max: ProtocolVersion,
    pub run: ProtocolVersion,
}

#[derive(Debug, Clone)]
struct DaemonNode {
    is_member: bool,
    killed: bool,
    join_time: u64,
    left_time: u64,
    /// Set once an acceptable (non-stateful-merge) proto arrived since join
    proto: Option<Protocol>,
}

impl DaemonNode {
    fn new() -> Self {
        Self {
            is_member: false,
            killed: false,
            join_time: 0,
            left_time: 0,
            proto: None,
        }
    }
}

/// What the caller must do after a PROTOCOL message was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolAction {
    /// Nothing beyond bookkeeping
    None,
    /// A stateful node merged back after a partition and must be evicted
    Kick(NodeId),
}

/// Membership and protocol state of the daemon group
pub struct DaemonGroup {
    our_node: NodeId,
    ours: Protocol,
    nodes: BTreeMap<NodeId, DaemonNode>,
    members: Vec<NodeId>,
    sent_proposal: bool,
}

impl DaemonGroup {
    /// Create the daemon group state for our node
    pub fn new(our_node: NodeId, max: ProtocolVersion) -> Self {
        Self {
            our_node,
            ours: Protocol {
                max,
                run: ProtocolVersion::default(),
            },
            nodes: BTreeMap::new(),
            members: Vec::new(),
            sent_proposal: false,
        }
    }

    /// Our protocol as advertised
    pub fn protocol(&self) -> Protocol {
        self.ours
    }

    /// The negotiated running version, once agreed
    pub fn running(&self) -> Option<ProtocolVersion> {
        self.ours.run.is_set().then_some(self.ours.run)
    }

    /// Mark ourselves stateful after completing a domain change
    pub fn set_stateful(&mut self) {
        self.ours.run.flags |= PV_STATEFUL;
    }

    /// Current daemon group members
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Apply a daemon group configuration change.
    ///
    /// Returns true when somebody joined and our protocol must be re-sent.
    pub fn on_confchg(&mut self, members: &[NodeId], joined: &[NodeId], now: u64) -> bool {
        self.members = members.to_vec();

        for id in members {
            self.nodes.entry(*id).or_insert_with(DaemonNode::new);
        }

        for (id, node) in self.nodes.iter_mut() {
            if members.contains(id) {
                if !node.is_member {
                    node.is_member = true;
                    node.join_time = now;
                }
            } else if node.is_member {
                node.is_member = false;
                node.killed = false;
                node.proto = None;
                node.left_time = now;
            }
        }

        !joined.is_empty()
    }

    /// Process a PROTOCOL message from `from`.
    ///
    /// `quorate_time` is when the local node last became quorate.
    pub fn receive_protocol(
        &mut self,
        from: NodeId,
        proto: Protocol,
        quorate: bool,
        quorate_time: u64,
    ) -> Result<ProtocolAction> {
        let max = proto.max;
        let run = proto.run;

        if max.major == 0 || max.minor == 0 || max.patch == 0 {
            return Err(Error::InvalidVersion {
                from,
                reason: format!("max value {}", max),
            });
        }

        if run.major != 0 && (run.minor == 0 || run.patch == 0) {
            return Err(Error::InvalidVersion {
                from,
                reason: format!("run value {}", run),
            });
        }

        let our_run = self.ours.run;
        let node = self
            .nodes
            .get_mut(&from)
            .ok_or_else(|| Error::Negotiation(format!("receive_protocol no node {}", from)))?;

        if !node.is_member {
            return Err(Error::Negotiation(format!(
                "receive_protocol node {} not member",
                from
            )));
        }

        tracing::debug!(
            "receive_protocol from {} max {}.{:x} run {}.{:x}",
            from,
            max,
            max.flags,
            run,
            run.flags
        );
        tracing::debug!(
            "daemon node {} join {} left {} local quorum {}",
            from,
            node.join_time,
            node.left_time,
            quorate_time
        );

        // A node that rejoined the daemon group while carrying state from
        // before a partition announces itself stateful. Its proto is not
        // saved so it never counts as a clean member.
        if from != self.our_node
            && node.proto.is_none()
            && run.is_stateful()
            && our_run.is_stateful()
        {
            tracing::debug!("daemon node {} stateful merge", from);

            let mut action = ProtocolAction::None;
            if quorate && node.left_time != 0 && quorate_time < node.left_time {
                tracing::debug!("daemon node {} kill due to stateful merge", from);
                if !node.killed {
                    action = ProtocolAction::Kick(from);
                }
                node.killed = true;
            }
            return Ok(action);
        }

        node.proto = Some(proto);

        if self.ours.run.is_set() {
            return Ok(ProtocolAction::None);
        }

        if run.is_set() {
            self.ours.run = ProtocolVersion {
                flags: self.ours.run.flags,
                ..run
            };
            tracing::debug!("run protocol from nodeid {}", from);
        }

        Ok(ProtocolAction::None)
    }

    /// True once a proto has been received from every current member
    pub fn all_protocol_messages(&self) -> bool {
        if self.members.is_empty() {
            return false;
        }

        self.members.iter().all(|id| match self.nodes.get(id) {
            Some(node) => node.proto.is_some(),
            None => {
                tracing::error!("all_protocol_messages no node {}", id);
                false
            }
        })
    }

    /// Component-wise minimum of the members' max versions
    pub fn pick_min_protocol(&self) -> Result<ProtocolVersion> {
        let maxes: Vec<ProtocolVersion> = self
            .members
            .iter()
            .map(|id| {
                self.nodes
                    .get(id)
                    .and_then(|n| n.proto)
                    .map(|p| p.max)
                    .ok_or_else(|| Error::Negotiation(format!("pick_min_protocol no node {}", id)))
            })
            .collect::<Result<_>>()?;

        let major = maxes.iter().map(|v| v.major).min().unwrap_or(0);
        if major == 0 {
            return Err(Error::Negotiation("pick_min_protocol zero major number".into()));
        }

        let minor = maxes
            .iter()
            .filter(|v| v.major == major)
            .map(|v| v.minor)
            .min()
            .unwrap_or(0);
        if minor == 0 {
            return Err(Error::Negotiation("pick_min_protocol zero minor number".into()));
        }

        let patch = maxes
            .iter()
            .filter(|v| v.major == major && v.minor == minor)
            .map(|v| v.patch)
            .min()
            .unwrap_or(0);
        if patch == 0 {
            return Err(Error::Negotiation("pick_min_protocol zero patch number".into()));
        }

        Ok(ProtocolVersion::new(major, minor, patch))
    }

    /// The one proposal we send, once everyone has been heard from
    pub fn next_proposal(&mut self) -> Result<Option<Protocol>> {
        if self.ours.run.is_set() || self.sent_proposal || !self.all_protocol_messages() {
            return Ok(None);
        }

        self.sent_proposal = true;
        let run = self.pick_min_protocol()?;

        tracing::debug!(
            "set_protocol member_count {} propose daemon {}",
            self.members.len(),
            run
        );

        Ok(Some(Protocol {
            max: self.ours.max,
            run,
        }))
    }

    /// Fail if the agreed version is one we cannot run
    pub fn check_compatible(&self) -> Result<()> {
        let run = self.ours.run;
        let max = self.ours.max;

        if run.major != max.major || run.minor > max.minor {
            return Err(Error::IncompatibleProtocol { run, max });
        }

        tracing::debug!("daemon run {} max {}", run, max);
        Ok(())
    }

    /// A daemon member that restarted cleanly and can be skipped for fencing
    pub fn is_clean_member(&self, node_id: NodeId) -> bool {
        match self.nodes.get(&node_id) {
            Some(node) if node.is_member => {
                if node.proto.is_some() {
                    tracing::debug!("daemon_member {} is clean", node_id);
                    true
                } else {
                    tracing::debug!("daemon_member {} zero proto", node_id);
                    false
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto(major: u16, minor: u16, patch: u16) -> Protocol {
        Protocol {
            max: ProtocolVersion::new(major, minor, patch),
            run: ProtocolVersion::default(),
        }
    }

    #[test]
    fn test_pick_min_protocol() {
        let mut group = DaemonGroup::new(1, DAEMON_MAX);
        group.on_confchg(&[1, 2, 3], &[1, 2, 3], 10);

        group.receive_protocol(1, proto(1, 3, 4), true, 0).unwrap();
        assert!(!group.all_protocol_messages());
        group.receive_protocol(2, proto(1, 2, 9), true, 0).unwrap();
        group.receive_protocol(3, proto(1, 2, 5), true, 0).unwrap();
        assert!(group.all_protocol_messages());

        assert_eq!(group.pick_min_protocol().unwrap(), ProtocolVersion::new(1, 2, 5));
    }

    #[test]
    fn test_minor_follows_chosen_major() {
        let mut group = DaemonGroup::new(1, DAEMON_MAX);
        group.on_confchg(&[1, 2], &[1, 2], 10);
        group.receive_protocol(1, proto(2, 1, 1), true, 0).unwrap();
        group.receive_protocol(2, proto(1, 7, 3), true, 0).unwrap();

        assert_eq!(group.pick_min_protocol().unwrap(), ProtocolVersion::new(1, 7, 3));
    }

    #[test]
    fn test_proposal_sent_once() {
        let mut group = DaemonGroup::new(1, DAEMON_MAX);
        group.on_confchg(&[1], &[1], 10);
        assert!(group.next_proposal().unwrap().is_none());

        group.receive_protocol(1, group.protocol(), true, 0).unwrap();
        let proposal = group.next_proposal().unwrap().unwrap();
        assert_eq!(proposal.run, DAEMON_MAX);
        assert!(group.next_proposal().unwrap().is_none());
    }

    #[test]
    fn test_late_joiner_adopts_running_version() {
        let mut group = DaemonGroup::new(3, DAEMON_MAX);
        group.on_confchg(&[1, 2, 3], &[3], 10);

        let existing = Protocol {
            max: ProtocolVersion::new(1, 1, 1),
            run: ProtocolVersion::new(1, 1, 1),
        };
        group.receive_protocol(1, existing, true, 0).unwrap();

        assert_eq!(group.running(), Some(ProtocolVersion::new(1, 1, 1)));
        assert!(group.check_compatible().is_ok());
    }

    #[test]
    fn test_incompatible_run_is_fatal() {
        let mut group = DaemonGroup::new(3, DAEMON_MAX);
        group.on_confchg(&[1, 3], &[3], 10);

        let existing = Protocol {
            max: ProtocolVersion::new(2, 1, 1),
            run: ProtocolVersion::new(2, 1, 1),
        };
        group.receive_protocol(1, existing, true, 0).unwrap();

        let err = group.check_compatible().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rejects_zero_max() {
        let mut group = DaemonGroup::new(1, DAEMON_MAX);
        group.on_confchg(&[1, 2], &[1, 2], 10);
        assert!(group.receive_protocol(2, proto(1, 0, 1), true, 0).is_err());
        assert!(group.receive_protocol(4, proto(1, 1, 1), true, 0).is_err());
    }

    #[test]
    fn test_clean_member_and_stateful_merge() {
        let mut group = DaemonGroup::new(1, DAEMON_MAX);
        group.on_confchg(&[1, 2], &[1, 2], 10);
        group.receive_protocol(1, group.protocol(), true, 0).unwrap();
        group.receive_protocol(2, proto(1, 1, 1), true, 0).unwrap();
        let proposal = group.next_proposal().unwrap().unwrap();
        group.receive_protocol(1, proposal, true, 0).unwrap();
        group.set_stateful();
        assert!(group.is_clean_member(2));

        // node 2 partitions away and merges back still carrying state
        group.on_confchg(&[1], &[], 20);
        assert!(!group.is_clean_member(2));
        group.on_confchg(&[1, 2], &[2], 30);

        let stateful = Protocol {
            max: DAEMON_MAX,
            run: ProtocolVersion {
                flags: PV_STATEFUL,
                ..DAEMON_MAX
            },
        };
        let action = group.receive_protocol(2, stateful, true, 5).unwrap();
        assert_eq!(action, ProtocolAction::Kick(2));
        assert!(!group.is_clean_member(2));

        // only kicked once
        let action = group.receive_protocol(2, stateful, true, 5).unwrap();
        assert_eq!(action, ProtocolAction::None);
    }
}
