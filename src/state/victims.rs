//! Victim Set
//!
//! Nodes that must be fenced, or shown to be safe, before shared storage
//! can be used again.

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterView, NodeId};
use crate::state::Change;

/// A node awaiting fencing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Victim {
    pub node_id: NodeId,
    pub name: String,
    /// Assumed failed because it was absent when we joined
    pub init_victim: bool,
    /// We resolved it and are waiting for our own VICTIM_DONE
    pub local_victim_done: bool,
}

impl Victim {
    pub fn new(node_id: NodeId, name: String) -> Self {
        Self {
            node_id,
            name,
            init_victim: false,
            local_victim_done: false,
        }
    }
}

/// The domain's victims, in the order they became victims
#[derive(Debug, Default)]
pub struct VictimSet {
    victims: Vec<Victim>,
}

impl VictimSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.victims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Victim> {
        self.victims.iter()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.victims.iter().map(|v| v.node_id).collect()
    }

    pub fn is_victim(&self, node_id: NodeId) -> bool {
        self.get(node_id).is_some()
    }

    pub fn get(&self, node_id: NodeId) -> Option<&Victim> {
        self.victims.iter().find(|v| v.node_id == node_id)
    }

    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Victim> {
        self.victims.iter_mut().find(|v| v.node_id == node_id)
    }

    /// Add a victim; returns false if it already was one
    pub fn add(&mut self, victim: Victim) -> bool {
        if self.is_victim(victim.node_id) {
            return false;
        }
        self.victims.push(victim);
        true
    }

    pub fn remove(&mut self, node_id: NodeId) -> Option<Victim> {
        let pos = self.victims.iter().position(|v| v.node_id == node_id)?;
        Some(self.victims.remove(pos))
    }

    /// Failed members of a change become victims
    pub fn add_failed<F>(&mut self, cg: &Change, name_of: F) -> usize
    where
        F: Fn(NodeId) -> String,
    {
        let mut added = 0;

        for memb in cg.failed() {
            // a merged partition that is then killed finds the node
            // already a victim from an earlier partition
            if self.is_victim(memb.node_id) {
                tracing::debug!("add_victims node {} already victim", memb.node_id);
                continue;
            }

            self.victims.push(Victim::new(memb.node_id, name_of(memb.node_id)));
            tracing::debug!("add_victims node {}", memb.node_id);
            added += 1;
        }

        added
    }

    /// On joining with no state, assume every configured node that is
    /// neither a cluster member nor in the change has already failed
    pub fn add_init<'a, I>(&mut self, cg: &Change, configured: I, cluster: &ClusterView) -> usize
    where
        I: IntoIterator<Item = (NodeId, &'a str)>,
    {
        let mut added = 0;

        for (node_id, name) in configured {
            if cluster.is_member(node_id) || cg.is_member(node_id) || self.is_victim(node_id) {
                continue;
            }

            let mut victim = Victim::new(node_id, name.to_string());
            victim.init_victim = true;
            self.victims.push(victim);
            tracing::debug!("add_victims_init nodeid {}", node_id);
            added += 1;
        }

        added
    }

    /// Drop every victim, once a completed member told us it has none
    pub fn clear_all(&mut self) {
        for victim in self.victims.drain(..) {
            tracing::debug!(
                "receive_complete clear victim nodeid {} init {}",
                victim.node_id,
                victim.init_victim
            );
        }
    }

    /// Remove victims the probe says are safe, returning them
    pub fn reduce<P>(&mut self, mut is_safe: P) -> Vec<Victim>
    where
        P: FnMut(&Victim) -> bool,
    {
        let (safe, keep): (Vec<Victim>, Vec<Victim>) =
            self.victims.drain(..).partition(|v| is_safe(v));
        self.victims = keep;

        for victim in &safe {
            tracing::debug!("reduce victim {}", victim.name);
        }
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterNode, ClusterSnapshot, GroupAddress, LeaveReason};
    use crate::state::{ChangeTracker, HistoryStore};

    fn name(id: NodeId) -> String {
        format!("node{}", id)
    }

    fn failure_change(failed: &[NodeId]) -> ChangeTracker {
        let mut history = HistoryStore::new();
        let mut tracker = ChangeTracker::new();
        let left: Vec<GroupAddress> = failed
            .iter()
            .map(|id| GroupAddress::new(*id, LeaveReason::NodeDown))
            .chain(std::iter::once(GroupAddress::new(9, LeaveReason::Leave)))
            .collect();
        tracker
            .add_change(1, &[GroupAddress::member(1)], &left, &[], &mut history, 1)
            .unwrap();
        tracker
    }

    #[test]
    fn test_add_failed_is_idempotent() {
        let tracker = failure_change(&[2, 3]);
        let cg = tracker.current().unwrap();
        let mut victims = VictimSet::new();

        assert_eq!(victims.add_failed(cg, name), 2);
        assert_eq!(victims.add_failed(cg, name), 0);
        assert_eq!(victims.ids(), vec![2, 3]);
        assert!(!victims.is_victim(9));
        assert_eq!(victims.get(3).unwrap().name, "node3");
    }

    #[test]
    fn test_add_init_skips_members() {
        let mut history = HistoryStore::new();
        let mut tracker = ChangeTracker::new();
        tracker
            .add_change(
                1,
                &[GroupAddress::member(1), GroupAddress::member(2)],
                &[],
                &[GroupAddress::member(1)],
                &mut history,
                1,
            )
            .unwrap();

        let mut cluster = ClusterView::new();
        cluster.update(
            ClusterSnapshot {
                quorate: true,
                ring_seq: 1,
                nodes: vec![
                    ClusterNode { node_id: 1, name: "a".into(), member: true, incarnation: 1 },
                    ClusterNode { node_id: 3, name: "c".into(), member: true, incarnation: 1 },
                    ClusterNode { node_id: 4, name: "d".into(), member: false, incarnation: 0 },
                ],
            },
            &mut history,
            1,
        );

        let mut victims = VictimSet::new();
        victims.add(Victim::new(5, "e".into()));

        let configured = vec![(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")];
        let added = victims.add_init(tracker.current().unwrap(), configured, &cluster);

        assert_eq!(added, 1);
        assert_eq!(victims.ids(), vec![5, 4]);
        assert!(victims.get(4).unwrap().init_victim);
        assert!(!victims.get(5).unwrap().init_victim);
    }

    #[test]
    fn test_reduce_and_clear() {
        let tracker = failure_change(&[2, 3, 4]);
        let mut victims = VictimSet::new();
        victims.add_failed(tracker.current().unwrap(), name);

        let safe = victims.reduce(|v| v.node_id == 3);
        assert_eq!(safe.len(), 1);
        assert_eq!(safe[0].node_id, 3);
        assert_eq!(victims.ids(), vec![2, 4]);

        assert!(victims.remove(2).is_some());
        assert!(victims.remove(2).is_none());

        victims.clear_all();
        assert!(victims.is_empty());
    }
}
