//! START Matching
//!
//! A START carries no reference to the change it was sent for, only the
//! change's counts and member list. Matching it to one of our pending
//! changes relies on those details plus each node's history.
//!
//! Known gap: after a partition, a merge, a kill and a clean rejoin, a
//! node catching up late can send a START for an old change that is
//! indistinguishable from the rejoin change. Waiting for ring agreement
//! before sending STARTs makes this unlikely but not impossible.

use crate::cluster::NodeId;
use crate::protocol::{ChangeInfo, IdInfo, MessageFlags};
use crate::state::{Change, ChangeTracker, HistoryStore};

/// The parts of a received START that matching looks at
#[derive(Debug, Clone, Copy)]
pub struct StartRef<'a> {
    pub from: NodeId,
    /// Sender's seq for the change, only meaningful to the sender
    pub seq: u32,
    pub flags: MessageFlags,
    pub info: &'a ChangeInfo,
    pub ids: &'a [IdInfo],
}

impl<'a> StartRef<'a> {
    fn id(&self, node_id: NodeId) -> Option<&IdInfo> {
        self.ids.iter().find(|id| id.node_id == node_id)
    }
}

/// Does `msg` describe change `cg`? Records the match in the sender's history.
pub fn match_change(
    cg: &Change,
    msg: &StartRef<'_>,
    history: &mut HistoryStore,
    our_node: NodeId,
) -> bool {
    let from = msg.from;
    let seq = msg.seq;

    // seen after we join, for changes before the one that added us
    if !msg.id(our_node).map(|id| id.is_member()).unwrap_or(false) {
        tracing::debug!("match_change {}:{} skip cg {} we are not in members", from, seq, cg.seq);
        return false;
    }

    match cg.member(from) {
        None => {
            tracing::debug!("match_change {}:{} skip cg {} sender not member", from, seq, cg.seq);
            return false;
        }
        Some(memb) if memb.start => {
            tracing::debug!("match_change {}:{} skip cg {} already start", from, seq, cg.seq);
            return false;
        }
        Some(_) => {}
    }

    let Some(node) = history.get_mut(from) else {
        tracing::debug!("match_change {}:{} skip cg {} no node history", from, seq, cg.seq);
        return false;
    };

    // the sender joined the cluster after this change was created
    if node.cluster_add_time > cg.create_time {
        tracing::debug!(
            "match_change {}:{} skip cg {} created {} cluster add {}",
            from,
            seq,
            cg.seq,
            cg.create_time,
            node.cluster_add_time
        );
        return false;
    }

    // the sender failed or left after this change
    if node.fail_seq > cg.seq || node.left_seq > cg.seq {
        tracing::debug!(
            "match_change {}:{} skip cg {} fail cg {} left cg {}",
            from,
            seq,
            cg.seq,
            node.fail_seq,
            node.left_seq
        );
        return false;
    }

    // its previous START matched a later change
    if node.last_match_seq > cg.seq {
        tracing::debug!(
            "match_change {}:{} skip cg {} last matched cg {}",
            from,
            seq,
            cg.seq,
            node.last_match_seq
        );
        return false;
    }

    let info = msg.info;
    if (
        info.member_count,
        info.joined_count,
        info.removed_count,
        info.failed_count,
    ) != cg.counts()
    {
        tracing::debug!(
            "match_change {}:{} skip cg {} expect counts {} {} {} {}",
            from,
            seq,
            cg.seq,
            cg.member_count,
            cg.joined_count,
            cg.removed_count,
            cg.failed_count
        );
        return false;
    }

    if let Some(id) = msg
        .ids
        .iter()
        .find(|id| id.is_member() && !cg.is_member(id.node_id))
    {
        tracing::debug!(
            "match_change {}:{} skip cg {} no memb {}",
            from,
            seq,
            cg.seq,
            id.node_id
        );
        return false;
    }

    node.last_match_seq = cg.seq;

    tracing::debug!("match_change {}:{} matches cg {}", from, seq, cg.seq);
    true
}

/// Resolve a START to a pending change, returning its seq.
///
/// Pending changes are tried oldest first, the order a lagging sender
/// works through them. A START flagged DUPLICATE_CG belongs to the later
/// of two indistinguishable changes.
pub fn find_change(
    tracker: &ChangeTracker,
    msg: &StartRef<'_>,
    history: &mut HistoryStore,
    our_node: NodeId,
) -> Option<u32> {
    let duplicate = msg.flags.contains(MessageFlags::DUPLICATE_CG);
    let mut first: Option<u32> = None;

    for cg in tracker.pending().rev() {
        if !match_change(cg, msg, history, our_node) {
            continue;
        }

        if !duplicate {
            return Some(cg.seq);
        }

        match first {
            None => {
                tracing::debug!("find_change {}:{} match1 {} look for dup", msg.from, msg.seq, cg.seq);
                first = Some(cg.seq);
            }
            Some(seq1) => {
                tracing::debug!(
                    "find_change {}:{} match1 {} match2 {}",
                    msg.from,
                    msg.seq,
                    seq1,
                    cg.seq
                );
                return Some(cg.seq);
            }
        }
    }

    if first.is_none() {
        tracing::debug!("find_change {}:{} no match", msg.from, msg.seq);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{GroupAddress, LeaveReason};
    use crate::protocol::IDI_NODEID_IS_MEMBER;

    fn addrs(ids: &[NodeId]) -> Vec<GroupAddress> {
        ids.iter().map(|id| GroupAddress::member(*id)).collect()
    }

    fn ids(members: &[NodeId], others: &[NodeId]) -> Vec<IdInfo> {
        let mut out: Vec<IdInfo> = members
            .iter()
            .map(|id| IdInfo {
                node_id: *id,
                flags: IDI_NODEID_IS_MEMBER,
                ..Default::default()
            })
            .collect();
        out.extend(others.iter().map(|id| IdInfo {
            node_id: *id,
            ..Default::default()
        }));
        out
    }

    fn info(m: u32, j: u32, r: u32, f: u32) -> ChangeInfo {
        ChangeInfo {
            started_count: 0,
            member_count: m,
            joined_count: j,
            removed_count: r,
            failed_count: f,
        }
    }

    /// Node 1's view: A,B,C members, then C fails
    fn three_then_fail() -> (ChangeTracker, HistoryStore) {
        let mut history = HistoryStore::new();
        let mut tracker = ChangeTracker::new();
        tracker
            .add_change(1, &addrs(&[1, 2, 3]), &[], &addrs(&[1, 2, 3]), &mut history, 10)
            .unwrap();
        tracker.retire_current();
        tracker
            .add_change(
                1,
                &addrs(&[1, 2]),
                &[GroupAddress::new(3, LeaveReason::NodeDown)],
                &[],
                &mut history,
                20,
            )
            .unwrap();
        (tracker, history)
    }

    #[test]
    fn test_matches_on_counts_and_members() {
        let (tracker, mut history) = three_then_fail();
        let info = info(2, 0, 1, 1);
        let ids = ids(&[1, 2], &[3]);
        let msg = StartRef {
            from: 2,
            seq: 9,
            flags: MessageFlags::COMPLETE,
            info: &info,
            ids: &ids,
        };

        assert_eq!(find_change(&tracker, &msg, &mut history, 1), Some(2));
        assert_eq!(history.get(2).unwrap().last_match_seq, 2);
    }

    #[test]
    fn test_rejects_mismatches() {
        let (tracker, mut history) = three_then_fail();
        let cg = tracker.current().unwrap();

        // we are not a member in the sender's view
        let good = info(2, 0, 1, 1);
        let not_us = ids(&[2, 3], &[1]);
        let msg = StartRef { from: 2, seq: 1, flags: MessageFlags::empty(), info: &good, ids: &not_us };
        assert!(!match_change(cg, &msg, &mut history, 1));

        // counts differ
        let bad = info(2, 0, 1, 0);
        let members = ids(&[1, 2], &[3]);
        let msg = StartRef { from: 2, seq: 1, flags: MessageFlags::empty(), info: &bad, ids: &members };
        assert!(!match_change(cg, &msg, &mut history, 1));

        // sender is not a member of the change
        let msg = StartRef { from: 3, seq: 1, flags: MessageFlags::empty(), info: &good, ids: &members };
        assert!(!match_change(cg, &msg, &mut history, 1));

        // member lists differ
        let other = ids(&[1, 4], &[]);
        let msg = StartRef { from: 2, seq: 1, flags: MessageFlags::empty(), info: &good, ids: &other };
        assert!(!match_change(cg, &msg, &mut history, 1));

        assert_eq!(history.get(2).unwrap().last_match_seq, 0);
    }

    #[test]
    fn test_rejects_sender_added_to_cluster_after_change() {
        let (tracker, mut history) = three_then_fail();
        history.cluster_add(2, 25);

        let info = info(2, 0, 1, 1);
        let ids = ids(&[1, 2], &[3]);
        let msg = StartRef { from: 2, seq: 1, flags: MessageFlags::empty(), info: &info, ids: &ids };
        assert_eq!(find_change(&tracker, &msg, &mut history, 1), None);
    }

    #[test]
    fn test_rejects_after_sender_failed_later() {
        let (tracker, mut history) = three_then_fail();
        history.record_fail(2, 5, 30);

        let info = info(2, 0, 1, 1);
        let ids = ids(&[1, 2], &[3]);
        let msg = StartRef { from: 2, seq: 1, flags: MessageFlags::empty(), info: &info, ids: &ids };
        assert_eq!(find_change(&tracker, &msg, &mut history, 1), None);
    }

    #[test]
    fn test_never_matches_earlier_than_last_match() {
        let mut history = HistoryStore::new();
        let mut tracker = ChangeTracker::new();
        tracker
            .add_change(1, &addrs(&[1, 2]), &[], &addrs(&[1, 2]), &mut history, 1)
            .unwrap();
        history.get_mut(2).unwrap().last_match_seq = 4;

        let info = info(2, 2, 0, 0);
        let ids = ids(&[1, 2], &[]);
        let msg = StartRef { from: 2, seq: 1, flags: MessageFlags::empty(), info: &info, ids: &ids };
        assert_eq!(find_change(&tracker, &msg, &mut history, 1), None);
    }

    #[test]
    fn test_duplicate_flag_picks_second_match() {
        let mut history = HistoryStore::new();
        let mut tracker = ChangeTracker::new();
        history.ensure(2);
        history.ensure(3);

        // node 3 fails and rejoins before anything was started
        tracker
            .add_change(1, &addrs(&[1, 2, 3]), &[], &addrs(&[3]), &mut history, 1)
            .unwrap();
        tracker
            .add_change(
                1,
                &addrs(&[1, 2]),
                &[GroupAddress::new(3, LeaveReason::NodeDown)],
                &[],
                &mut history,
                2,
            )
            .unwrap();
        tracker
            .add_change(1, &addrs(&[1, 2, 3]), &[], &addrs(&[3]), &mut history, 3)
            .unwrap();

        let info = info(3, 1, 0, 0);
        let ids = ids(&[1, 2, 3], &[]);

        let plain = StartRef { from: 2, seq: 7, flags: MessageFlags::empty(), info: &info, ids: &ids };
        assert_eq!(find_change(&tracker, &plain, &mut history, 1), Some(1));

        history.get_mut(2).unwrap().last_match_seq = 0;
        let dup = StartRef {
            from: 2,
            seq: 8,
            flags: MessageFlags::DUPLICATE_CG,
            info: &info,
            ids: &ids,
        };
        assert_eq!(find_change(&tracker, &dup, &mut history, 1), Some(3));
        assert_eq!(history.get(2).unwrap().last_match_seq, 3);
    }

    #[test]
    fn test_duplicate_flag_falls_back_to_single_match() {
        let (tracker, mut history) = three_then_fail();
        let info = info(2, 0, 1, 1);
        let ids = ids(&[1, 2], &[3]);
        let msg = StartRef {
            from: 2,
            seq: 3,
            flags: MessageFlags::DUPLICATE_CG,
            info: &info,
            ids: &ids,
        };
        assert_eq!(find_change(&tracker, &msg, &mut history, 1), Some(2));
    }
}
