//! Quorum Service and Cluster View
//!
//! The quorum service reports the configured cluster nodes, which of them
//! are members, and whether the cluster is quorate. `ClusterView` keeps the
//! previous snapshot and turns each new one into history updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::NodeId;
use crate::error::Result;
use crate::state::HistoryStore;

/// One node as the quorum service sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: NodeId,
    pub name: String,
    pub member: bool,
    /// Bumped every time the node joins the cluster
    pub incarnation: u32,
}

/// Point-in-time cluster state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub quorate: bool,
    /// Ring generation, comparable with the group transport's ring seq
    pub ring_seq: u32,
    pub nodes: Vec<ClusterNode>,
}

impl ClusterSnapshot {
    pub fn node(&self, node_id: NodeId) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.node(node_id).map(|n| n.member).unwrap_or(false)
    }

    pub fn name_of(&self, node_id: NodeId) -> Option<&str> {
        self.node(node_id).map(|n| n.name.as_str())
    }
}

/// Cluster membership and quorum service
pub trait QuorumService: Send + Sync {
    /// Read the current cluster state
    fn snapshot(&self) -> Result<ClusterSnapshot>;

    /// Evict a node from the cluster
    fn kick(&self, node_id: NodeId) -> Result<()>;
}

/// Last known cluster state plus the transitions derived from it
#[derive(Debug, Default)]
pub struct ClusterView {
    quorate: bool,
    ring_seq: u32,
    /// When quorum was last regained
    quorate_time: u64,
    /// The last update both added nodes and regained quorum
    quorate_from_last_update: bool,
    nodes: BTreeMap<NodeId, ClusterNode>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quorate(&self) -> bool {
        self.quorate
    }

    pub fn ring_seq(&self) -> u32 {
        self.ring_seq
    }

    pub fn quorate_time(&self) -> u64 {
        self.quorate_time
    }

    pub fn quorate_from_last_update(&self) -> bool {
        self.quorate_from_last_update
    }

    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.nodes.get(&node_id).map(|n| n.member).unwrap_or(false)
    }

    pub fn name_of(&self, node_id: NodeId) -> Option<&str> {
        self.nodes.get(&node_id).map(|n| n.name.as_str())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    /// Replace the view with a new snapshot, stamping add/remove times
    pub fn update(&mut self, snapshot: ClusterSnapshot, history: &mut HistoryStore, now: u64) {
        let was_quorate = self.quorate;
        let old = std::mem::take(&mut self.nodes);

        self.ring_seq = snapshot.ring_seq;
        self.quorate = snapshot.quorate;
        self.nodes = snapshot
            .nodes
            .into_iter()
            .map(|n| (n.node_id, n))
            .collect();

        let regained = !was_quorate && self.quorate;
        if regained {
            self.quorate_time = now;
        }

        let mut removed = 0;
        let mut added = 0;

        for node in old.values().filter(|n| n.member) {
            if !self.is_member(node.node_id) {
                tracing::debug!("cluster node {} removed seq {}", node.node_id, self.ring_seq);
                history.cluster_remove(node.node_id, now);
                removed += 1;
            }
        }

        for node in self.nodes.values() {
            let was_member = old.get(&node.node_id).map(|o| o.member).unwrap_or(false);

            if node.member && !was_member {
                tracing::debug!("cluster node {} added seq {}", node.node_id, self.ring_seq);
                history.cluster_add(node.node_id, now);
                added += 1;
                continue;
            }

            // member in both snapshots, but left and rejoined in between
            let Some(prev) = old.get(&node.node_id) else {
                continue;
            };
            if prev.incarnation == node.incarnation {
                continue;
            }

            tracing::debug!(
                "cluster node {} removed and added seq {} old {} new {}",
                node.node_id,
                self.ring_seq,
                prev.incarnation,
                node.incarnation
            );
            history.cluster_remove(node.node_id, now);
            removed += 1;
            history.cluster_add(node.node_id, now);
            added += 1;
        }

        if removed > 0 {
            self.quorate_from_last_update = false;
        } else if added > 0 {
            self.quorate_from_last_update = regained;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_id: NodeId, member: bool, incarnation: u32) -> ClusterNode {
        ClusterNode {
            node_id,
            name: format!("node{}", node_id),
            member,
            incarnation,
        }
    }

    fn snapshot(quorate: bool, ring_seq: u32, nodes: Vec<ClusterNode>) -> ClusterSnapshot {
        ClusterSnapshot {
            quorate,
            ring_seq,
            nodes,
        }
    }

    #[test]
    fn test_add_and_remove_stamp_history() {
        let mut history = HistoryStore::new();
        let mut view = ClusterView::new();

        view.update(
            snapshot(true, 4, vec![node(1, true, 1), node(2, true, 1), node(3, false, 0)]),
            &mut history,
            100,
        );
        assert_eq!(history.get(1).unwrap().cluster_add_time, 100);
        assert_eq!(history.get(2).unwrap().cluster_add_time, 100);
        assert!(history.get(3).is_none());
        assert_eq!(view.quorate_time(), 100);
        assert!(view.quorate_from_last_update());

        view.update(
            snapshot(true, 8, vec![node(1, true, 1), node(2, false, 1), node(3, false, 0)]),
            &mut history,
            200,
        );
        assert_eq!(history.get(2).unwrap().cluster_remove_time, 200);
        assert!(!view.is_member(2));
        assert!(!view.quorate_from_last_update());
        assert_eq!(view.ring_seq(), 8);
    }

    #[test]
    fn test_incarnation_change_is_remove_and_add() {
        let mut history = HistoryStore::new();
        let mut view = ClusterView::new();

        view.update(snapshot(true, 1, vec![node(1, true, 1), node(2, true, 1)]), &mut history, 10);
        view.update(snapshot(true, 3, vec![node(1, true, 1), node(2, true, 2)]), &mut history, 50);

        let two = history.get(2).unwrap();
        assert_eq!(two.cluster_remove_time, 50);
        assert_eq!(two.cluster_add_time, 50);
        assert_eq!(history.get(1).unwrap().cluster_add_time, 10);
    }

    #[test]
    fn test_quorum_regained_by_adding_nodes() {
        let mut history = HistoryStore::new();
        let mut view = ClusterView::new();

        view.update(snapshot(false, 1, vec![node(1, true, 1)]), &mut history, 10);
        assert!(!view.quorate());
        assert!(!view.quorate_from_last_update());
        assert_eq!(view.quorate_time(), 0);

        view.update(snapshot(true, 2, vec![node(1, true, 1), node(2, true, 1)]), &mut history, 20);
        assert!(view.quorate_from_last_update());
        assert_eq!(view.quorate_time(), 20);

        // no membership change leaves the flag alone
        view.update(snapshot(true, 2, vec![node(1, true, 1), node(2, true, 1)]), &mut history, 30);
        assert!(view.quorate_from_last_update());
    }
}
