//! Domain Queries
//!
//! Read-only snapshots of domain and node state for administrative tools.

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::state::ChangeState;

use super::Domain;

/// Summary of the domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub our_node: NodeId,
    /// Members of the current change, or of the last started one
    pub member_count: u32,
    /// None once every change has completed
    pub state: Option<ChangeState>,
    pub master: NodeId,
    pub victim_count: u32,
    /// Victim the master is working on, 0 when none
    pub current_victim: NodeId,
    pub init_complete: bool,
    /// No change has completed since we joined
    pub joining: bool,
    pub started_count: u32,
    pub change_seq: u32,
}

/// A node's standing in the domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    No,
    Yes,
    /// Member whose START was rejected after a partition merge
    Disallowed,
}

/// One node's membership and last fencing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub member: MemberStatus,
    pub victim: bool,
    pub last_fenced_master: NodeId,
    pub last_fenced_how: u32,
    /// Local time the fencing was learned of
    pub last_fenced_time: u64,
}

/// Which nodes a node query returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeFilter {
    /// Members of the last started change
    Members,
    /// Every node with history
    All,
}

impl Domain {
    pub fn info(&self) -> DomainInfo {
        let current = self.changes.current();
        let member_count = current
            .or_else(|| self.changes.started_change())
            .map(|cg| cg.member_count)
            .unwrap_or(0);

        DomainInfo {
            name: self.ctx.name.clone(),
            our_node: self.ctx.our_node,
            member_count,
            state: current.map(|cg| cg.state),
            master: self.master,
            victim_count: self.victims.len() as u32,
            current_victim: self.current_victim,
            init_complete: self.init_complete || self.local_init_complete,
            joining: self.joining_group,
            started_count: self.changes.started_count(),
            change_seq: self.changes.change_seq(),
        }
    }

    pub fn node_info(&self, node_id: NodeId) -> Option<NodeInfo> {
        let node = self.history.get(node_id)?;

        let cg = self
            .changes
            .current()
            .or_else(|| self.changes.started_change());
        let member = match cg.and_then(|cg| cg.member(node_id)) {
            None => MemberStatus::No,
            Some(m) if m.disallowed => MemberStatus::Disallowed,
            Some(_) => MemberStatus::Yes,
        };

        Some(NodeInfo {
            node_id,
            member,
            victim: self.victims.is_victim(node_id),
            last_fenced_master: node.fence_master,
            last_fenced_how: node.fence_how,
            last_fenced_time: node.fence_time_local,
        })
    }

    pub fn nodes(&self, filter: NodeFilter) -> Vec<NodeInfo> {
        let ids: Vec<NodeId> = match filter {
            NodeFilter::Members => self
                .changes
                .started_change()
                .map(|cg| cg.members.iter().map(|m| m.node_id).collect())
                .unwrap_or_default(),
            NodeFilter::All => self.history.iter().map(|n| n.node_id).collect(),
        };

        ids.into_iter().filter_map(|id| self.node_info(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::{GroupAddress, LeaveReason};
    use crate::config::FenceConfig;
    use crate::domain::DomainContext;

    #[test]
    fn test_info_and_nodes() {
        let mut d = Domain::new(DomainContext::new(Arc::new(FenceConfig::for_node(1, "node1"))));
        let all = [
            GroupAddress::member(1),
            GroupAddress::member(2),
            GroupAddress::member(3),
        ];
        d.on_confchg(&all, &[], &all, 1).unwrap();
        d.changes.retire_current();

        let info = d.info();
        assert_eq!(info.member_count, 3);
        assert_eq!(info.state, None);
        assert_eq!(info.started_count, 1);
        assert!(info.joining);
        assert_eq!(d.nodes(NodeFilter::Members).len(), 3);

        d.on_confchg(&all[..2], &[GroupAddress::new(3, LeaveReason::NodeDown)], &[], 2)
            .unwrap();

        let info = d.info();
        assert_eq!(info.member_count, 2);
        assert_eq!(info.state, Some(ChangeState::WaitConditions));
        assert_eq!(info.victim_count, 1);

        let three = d.node_info(3).unwrap();
        assert_eq!(three.member, MemberStatus::No);
        assert!(three.victim);

        assert_eq!(d.nodes(NodeFilter::All).len(), 3);
        assert!(d.node_info(9).is_none());
    }
}
