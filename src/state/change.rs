//! Change Tracking
//!
//! Every domain membership change becomes a `Change`. Pending changes are
//! kept newest first; the newest one is the change the group is working
//! on, and when it is agreed it supersedes every older pending change.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::cluster::{GroupAddress, LeaveReason, NodeId};
use crate::error::{Error, Result};
use crate::protocol::{ChangeInfo, IdInfo, MessageFlags};
use crate::state::HistoryStore;

/// Progress of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeState {
    /// Waiting for ring agreement and quorum
    WaitConditions,
    /// START sent, waiting for every member's START
    WaitMessages,
    /// Master elected, victims being fenced
    WaitFencing,
}

impl std::fmt::Display for ChangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeState::WaitConditions => write!(f, "WAIT_CONDITIONS"),
            ChangeState::WaitMessages => write!(f, "WAIT_MESSAGES"),
            ChangeState::WaitFencing => write!(f, "WAIT_FENCING"),
        }
    }
}

/// A node's part in one change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub node_id: NodeId,
    /// Its START for this change was accepted
    pub start: bool,
    /// Joined in this change
    pub added: bool,
    /// Removed by failure rather than a clean leave
    pub failed: bool,
    /// Merged back from a partition, its STARTs are not counted
    pub disallowed: bool,
    /// Header flags of its START
    pub start_flags: MessageFlags,
}

impl Member {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            start: false,
            added: false,
            failed: false,
            disallowed: false,
            start_flags: MessageFlags::empty(),
        }
    }
}

/// One membership change of the domain group
#[derive(Debug, Clone)]
pub struct Change {
    pub seq: u32,
    pub state: ChangeState,
    pub members: Vec<Member>,
    pub removed: Vec<Member>,
    pub member_count: u32,
    pub joined_count: u32,
    pub removed_count: u32,
    pub failed_count: u32,
    pub we_joined: bool,
    pub sent_start: bool,
    pub create_time: u64,
}

impl Change {
    pub fn member(&self, node_id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.node_id == node_id)
    }

    pub fn member_mut(&mut self, node_id: NodeId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.node_id == node_id)
    }

    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.member(node_id).is_some()
    }

    /// Failed removed members, in removal order
    pub fn failed(&self) -> impl Iterator<Item = &Member> {
        self.removed.iter().filter(|m| m.failed)
    }

    /// The four counts a START is matched against
    pub fn counts(&self) -> (u32, u32, u32, u32) {
        (
            self.member_count,
            self.joined_count,
            self.removed_count,
            self.failed_count,
        )
    }

    /// Every member of `self` is also a member of `other`
    pub fn same_members(&self, other: &Change) -> bool {
        self.members.iter().all(|m| other.is_member(m.node_id))
    }

    /// Members still missing a START, and the member total
    pub fn starts_needed(&self) -> (usize, usize) {
        let need = self.members.iter().filter(|m| !m.start).count();
        (need, self.members.len())
    }

    /// Counts block for START/COMPLETE
    pub fn info(&self, started_count: u32) -> ChangeInfo {
        ChangeInfo {
            started_count,
            member_count: self.member_count,
            joined_count: self.joined_count,
            removed_count: self.removed_count,
            failed_count: self.failed_count,
        }
    }

    /// Per-node entries for START/COMPLETE: every known node, flagged if a member
    pub fn id_infos(&self, history: &HistoryStore) -> Vec<IdInfo> {
        history
            .iter()
            .map(|node| node.to_id_info(self.is_member(node.node_id)))
            .collect()
    }
}

/// Result of recording a membership change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedChange {
    pub seq: u32,
    /// Nodes whose daemon died while the node stayed up; evict them
    pub kick: Vec<NodeId>,
}

/// The pending change queue and started change bookkeeping
#[derive(Debug, Default)]
pub struct ChangeTracker {
    change_seq: u32,
    /// Newest first
    pending: VecDeque<Change>,
    started_change: Option<Change>,
    /// Changes this node has completed, zero means never started
    started_count: u32,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn change_seq(&self) -> u32 {
        self.change_seq
    }

    pub fn started_count(&self) -> u32 {
        self.started_count
    }

    pub fn started_change(&self) -> Option<&Change> {
        self.started_change.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// The change being worked on: the newest pending one
    pub fn current(&self) -> Option<&Change> {
        self.pending.front()
    }

    pub fn current_mut(&mut self) -> Option<&mut Change> {
        self.pending.front_mut()
    }

    /// Pending changes, newest first
    pub fn pending(&self) -> impl DoubleEndedIterator<Item = &Change> {
        self.pending.iter()
    }

    pub fn get_mut(&mut self, seq: u32) -> Option<&mut Change> {
        self.pending.iter_mut().find(|cg| cg.seq == seq)
    }

    /// Record a domain membership change
    pub fn add_change(
        &mut self,
        our_node: NodeId,
        members: &[GroupAddress],
        left: &[GroupAddress],
        joined: &[GroupAddress],
        history: &mut HistoryStore,
        now: u64,
    ) -> Result<AddedChange> {
        self.change_seq = self.change_seq.wrapping_add(1);
        let seq = self.change_seq;

        let mut cg = Change {
            seq,
            state: ChangeState::WaitConditions,
            members: members.iter().map(|a| Member::new(a.node_id)).collect(),
            removed: Vec::with_capacity(left.len()),
            member_count: members.len() as u32,
            joined_count: joined.len() as u32,
            removed_count: left.len() as u32,
            failed_count: 0,
            we_joined: false,
            sent_start: false,
            create_time: now,
        };

        let mut kick = Vec::new();

        for addr in left {
            let mut memb = Member::new(addr.node_id);
            memb.failed = addr.reason.is_failure();

            if memb.failed {
                cg.failed_count += 1;
                history.record_fail(addr.node_id, seq, now);
            } else {
                history.record_left(addr.node_id, seq, now);
            }

            tracing::debug!(
                "add_change cg {} remove nodeid {} reason {}",
                seq,
                addr.node_id,
                addr.reason.code()
            );

            if addr.reason == LeaveReason::ProcDown {
                kick.push(addr.node_id);
            }

            cg.removed.push(memb);
        }

        for addr in joined {
            let Some(memb) = cg.member_mut(addr.node_id) else {
                tracing::error!("no member {}", addr.node_id);
                return Err(Error::Invariant(format!(
                    "cg {} joined node {} is not a member",
                    seq, addr.node_id
                )));
            };
            memb.added = true;

            if addr.node_id == our_node {
                cg.we_joined = true;
            } else {
                history.ensure(addr.node_id);
            }

            tracing::debug!("add_change cg {} joined nodeid {}", seq, addr.node_id);
        }

        if cg.we_joined {
            for memb in &cg.members {
                history.ensure(memb.node_id);
            }
        }

        tracing::debug!(
            "add_change cg {} m {} j {} r {} f {}",
            seq,
            cg.member_count,
            cg.joined_count,
            cg.removed_count,
            cg.failed_count
        );

        self.pending.push_front(cg);
        Ok(AddedChange { seq, kick })
    }

    /// Make the current change the started change and drop the older ones
    pub fn retire_current(&mut self) -> Option<u32> {
        let cg = self.pending.pop_front()?;
        let seq = cg.seq;

        for old in self.pending.drain(..) {
            tracing::debug!("cleanup_changes drop cg {} superseded by {}", old.seq, seq);
        }

        self.started_change = Some(cg);

        // zero means never started
        self.started_count = self.started_count.wrapping_add(1);
        if self.started_count == 0 {
            self.started_count = 1;
        }

        Some(seq)
    }

    /// The node was added by some pending change
    pub fn is_added(&self, node_id: NodeId) -> bool {
        self.pending
            .iter()
            .any(|cg| cg.member(node_id).map(|m| m.added).unwrap_or(false))
    }

    /// Some pending change added nodes
    pub fn nodes_added(&self) -> bool {
        self.pending.iter().any(|cg| cg.joined_count > 0)
    }

    /// An older pending change without a START that peers could not tell
    /// apart from the current one
    pub fn duplicate_of_older(&self) -> Option<u32> {
        let cg = self.current()?;

        self.pending
            .iter()
            .filter(|old| !old.sent_start && old.seq < cg.seq)
            .filter(|old| old.counts() == cg.counts() && old.same_members(cg))
            .map(|old| {
                tracing::debug!("duplicate old cg {} new cg {}", old.seq, cg.seq);
                old.seq
            })
            .last()
    }
}
