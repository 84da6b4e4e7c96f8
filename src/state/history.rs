//! Node History
//!
//! Per-node lifecycle ledger that outlives any single membership change.
//! Change matching and double-fence avoidance both read from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::error::{Error, Result};
use crate::protocol::IdInfo;

/// How a victim was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum FenceHow {
    /// Fenced by a fencing agent
    Agent = 1,
    /// Rejoined cleanly, no fencing needed
    Member = 2,
    /// An administrator declared it handled
    Override = 3,
    /// Fenced outside this coordinator
    External = 4,
}

impl FenceHow {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(FenceHow::Agent),
            2 => Some(FenceHow::Member),
            3 => Some(FenceHow::Override),
            4 => Some(FenceHow::External),
            _ => None,
        }
    }
}

impl std::fmt::Display for FenceHow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FenceHow::Agent => write!(f, "AGENT"),
            FenceHow::Member => write!(f, "MEMBER"),
            FenceHow::Override => write!(f, "OVERRIDE"),
            FenceHow::External => write!(f, "EXTERNAL"),
        }
    }
}

/// Lifecycle record of one node. Times are unix seconds, zero means never.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHistory {
    pub node_id: NodeId,
    pub add_time: u64,
    pub left_time: u64,
    pub fail_time: u64,
    pub fence_time: u64,
    pub fence_time_local: u64,
    pub fence_external_time: u64,
    pub cluster_add_time: u64,
    pub cluster_remove_time: u64,
    pub fence_external_node: NodeId,
    pub fence_master: NodeId,
    /// Raw `FenceHow` value, zero when never fenced
    pub fence_how: u32,
    pub last_match_seq: u32,
    pub fail_seq: u32,
    pub left_seq: u32,
}

impl NodeHistory {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Wire entry describing this node relative to a change
    pub fn to_id_info(&self, is_member: bool) -> IdInfo {
        IdInfo {
            node_id: self.node_id,
            flags: if is_member {
                crate::protocol::IDI_NODEID_IS_MEMBER
            } else {
                0
            },
            fence_external_node: self.fence_external_node,
            fence_master: self.fence_master,
            fence_how: self.fence_how,
            fence_time: self.fence_time,
            fence_external_time: self.fence_external_time,
        }
    }
}

/// All node histories of a domain, keyed by node id
#[derive(Debug, Default)]
pub struct HistoryStore {
    nodes: BTreeMap<NodeId, NodeHistory>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history entry if the node has none
    pub fn ensure(&mut self, node_id: NodeId) {
        self.nodes
            .entry(node_id)
            .or_insert_with(|| NodeHistory::new(node_id));
    }

    pub fn get(&self, node_id: NodeId) -> Option<&NodeHistory> {
        self.nodes.get(&node_id)
    }

    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut NodeHistory> {
        self.nodes.get_mut(&node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeHistory> {
        self.nodes.values()
    }

    fn lookup(&mut self, node_id: NodeId) -> Result<&mut NodeHistory> {
        self.nodes.get_mut(&node_id).ok_or(Error::UnknownNode(node_id))
    }

    /// Run `f` on an existing entry; a missing entry is a bug, logged and skipped
    fn update<F>(&mut self, op: &str, node_id: NodeId, f: F)
    where
        F: FnOnce(&mut NodeHistory),
    {
        match self.lookup(node_id) {
            Ok(node) => f(node),
            Err(e) => tracing::error!("node_history_{}: {}", op, e),
        }
    }

    /// The node sent a start we accepted
    pub fn record_start(&mut self, node_id: NodeId, now: u64) {
        self.update("start", node_id, |node| node.add_time = now);
    }

    /// The node left the group cleanly in change `seq`
    pub fn record_left(&mut self, node_id: NodeId, seq: u32, now: u64) {
        self.update("left", node_id, |node| {
            node.left_time = now;
            node.left_seq = node.left_seq.max(seq);
        });
    }

    /// The node failed in change `seq`
    pub fn record_fail(&mut self, node_id: NodeId, seq: u32, now: u64) {
        self.update("fail", node_id, |node| {
            node.fail_time = now;
            node.fail_seq = node.fail_seq.max(seq);
        });
    }

    /// Record who fenced the node, how and when (master's clock)
    pub fn record_fenced(&mut self, node_id: NodeId, master: NodeId, how: FenceHow, at: u64) {
        self.update("fence", node_id, |node| {
            node.fence_master = master;
            node.fence_time = at;
            node.fence_how = how as u32;
        });
    }

    /// Record a fencing reported over the wire, keeping the raw method value
    pub fn record_fenced_raw(&mut self, node_id: NodeId, master: NodeId, how: u32, at: u64) {
        self.update("fence", node_id, |node| {
            node.fence_master = master;
            node.fence_time = at;
            node.fence_how = how;
        });
    }

    /// Local time at which we learned the node was fenced
    pub fn record_fenced_local(&mut self, node_id: NodeId, now: u64) {
        self.update("fence_local", node_id, |node| node.fence_time_local = now);
    }

    /// Someone fenced the node outside our control
    pub fn record_external(&mut self, node_id: NodeId, by: NodeId, now: u64) {
        self.update("fence_external", node_id, |node| {
            node.fence_external_time = now;
            node.fence_external_node = by;
        });
    }

    /// True if an external fence notice post-dates the node's last add
    pub fn is_fenced_external(&self, node_id: NodeId) -> bool {
        match self.nodes.get(&node_id) {
            Some(node) => node.fence_external_time > node.add_time,
            None => {
                tracing::error!("is_fenced_external no nodeid {}", node_id);
                false
            }
        }
    }

    /// The quorum service saw the node become a cluster member
    pub fn cluster_add(&mut self, node_id: NodeId, now: u64) {
        self.ensure(node_id);
        self.update("cluster_add", node_id, |node| node.cluster_add_time = now);
    }

    /// The quorum service saw the node leave the cluster
    pub fn cluster_remove(&mut self, node_id: NodeId, now: u64) {
        self.update("cluster_remove", node_id, |node| {
            node.cluster_remove_time = now
        });
    }

    /// Take fencing history we lack from a peer's START payload
    pub fn merge_remote(&mut self, ids: &[IdInfo]) {
        for id in ids {
            self.ensure(id.node_id);

            let Some(node) = self.nodes.get_mut(&id.node_id) else {
                continue;
            };

            if node.fence_time == 0 && id.fence_time != 0 {
                node.fence_master = id.fence_master;
                node.fence_time = id.fence_time;
                node.fence_how = id.fence_how;
                tracing::debug!(
                    "save_history {} master {} time {} how {}",
                    node.node_id,
                    node.fence_master,
                    node.fence_time,
                    node.fence_how
                );
            }

            if node.fence_external_time == 0 && id.fence_external_time != 0 {
                node.fence_external_time = id.fence_external_time;
                node.fence_external_node = id.fence_external_node;
                tracing::debug!(
                    "save_history {} ext node {} ext time {}",
                    node.node_id,
                    node.fence_external_node,
                    node.fence_external_time
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_is_idempotent() {
        let mut store = HistoryStore::new();
        store.ensure(3);
        store.record_fail(3, 4, 100);
        store.ensure(3);

        assert_eq!(store.len(), 1);
        let node = store.get(3).unwrap();
        assert_eq!(node.fail_seq, 4);
    }

    #[test]
    fn test_seqs_never_decrease() {
        let mut store = HistoryStore::new();
        store.ensure(2);
        store.record_fail(2, 9, 100);
        store.record_fail(2, 5, 101);
        store.record_left(2, 7, 102);
        store.record_left(2, 3, 103);

        let node = store.get(2).unwrap();
        assert_eq!(node.fail_seq, 9);
        assert_eq!(node.left_seq, 7);
        assert_eq!(node.fail_time, 101);
    }

    #[test]
    fn test_unknown_node_is_skipped() {
        let mut store = HistoryStore::new();
        store.record_start(8, 100);
        store.record_fenced(8, 1, FenceHow::Agent, 100);
        assert!(store.get(8).is_none());
        assert!(!store.is_fenced_external(8));
        assert!(matches!(store.lookup(8), Err(Error::UnknownNode(8))));
    }

    #[test]
    fn test_external_fence_must_postdate_add() {
        let mut store = HistoryStore::new();
        store.ensure(5);
        store.record_start(5, 100);
        store.record_external(5, 2, 100);
        assert!(!store.is_fenced_external(5));

        store.record_external(5, 2, 150);
        assert!(store.is_fenced_external(5));

        // rejoining after the notice makes it stale
        store.record_start(5, 200);
        assert!(!store.is_fenced_external(5));
    }

    #[test]
    fn test_merge_remote_keeps_local_history() {
        let mut store = HistoryStore::new();
        store.ensure(1);
        store.record_fenced(1, 2, FenceHow::Agent, 500);

        let remote = vec![
            IdInfo {
                node_id: 1,
                fence_master: 3,
                fence_how: FenceHow::Override as u32,
                fence_time: 900,
                ..Default::default()
            },
            IdInfo {
                node_id: 4,
                fence_master: 3,
                fence_how: FenceHow::Agent as u32,
                fence_time: 800,
                fence_external_node: 2,
                fence_external_time: 700,
                ..Default::default()
            },
        ];
        store.merge_remote(&remote);

        let one = store.get(1).unwrap();
        assert_eq!(one.fence_master, 2);
        assert_eq!(one.fence_time, 500);

        let four = store.get(4).unwrap();
        assert_eq!(four.fence_master, 3);
        assert_eq!(four.fence_time, 800);
        assert_eq!(four.fence_external_node, 2);
        assert_eq!(four.fence_external_time, 700);
    }
}
