//! Domain message receivers

use crate::cluster::NodeId;
use crate::protocol::{ChangeInfo, IdInfo, MessageFlags};
use crate::state::{find_change, StartRef};

use super::Domain;

impl Domain {
    pub(super) fn receive_start(
        &mut self,
        from: NodeId,
        seq: u32,
        flags: MessageFlags,
        info: &ChangeInfo,
        ids: &[IdInfo],
        now: u64,
    ) {
        tracing::debug!("receive_start {}:{} ids {}", from, seq, ids.len());

        let msg = StartRef {
            from,
            seq,
            flags,
            info,
            ids,
        };
        let our_node = self.ctx.our_node;
        let Some(cg_seq) = find_change(&self.changes, &msg, &mut self.history, our_node) else {
            return;
        };

        let added = self.changes.is_added(from);
        let our_started = self.changes.started_count();

        let Some(memb) = self
            .changes
            .get_mut(cg_seq)
            .and_then(|cg| cg.member_mut(from))
        else {
            tracing::error!("receive_start no member {}", from);
            return;
        };
        memb.start_flags = flags;

        // both sides of a merged partition have started; neither accepts
        // the other until one side fails
        if added && info.started_count != 0 && our_started != 0 {
            tracing::error!(
                "receive_start {}:{} add node with started_count {}",
                from,
                seq,
                info.started_count
            );
            memb.disallowed = true;
            return;
        }

        memb.start = true;
        self.history.record_start(from, now);
        self.history.merge_remote(ids);
    }

    /// A member that has completed a change tells a joiner its victims
    /// were already handled.
    pub(crate) fn receive_complete(&mut self, from: NodeId, seq: u32, ids: &[IdInfo]) {
        tracing::debug!("receive_complete {}:{} ids {}", from, seq, ids.len());

        if self.init_complete {
            return;
        }

        let our_node = self.ctx.our_node;
        let listed = ids
            .iter()
            .any(|id| id.node_id == our_node && id.is_member());
        if !listed {
            tracing::debug!("receive_complete {}:{} we are not a member", from, seq);
            return;
        }

        self.init_complete = true;
        self.victims.clear_all();
    }

    pub(crate) fn receive_victim_done(
        &mut self,
        from: NodeId,
        seq: u32,
        flags: MessageFlags,
        id: &IdInfo,
        now: u64,
    ) {
        tracing::debug!("receive_victim_done {}:{} flags {:x}", from, seq, flags);

        let victim = id.node_id;
        if !self.victims.is_victim(victim) {
            // reduce can remove it before the message arrives
            tracing::debug!("receive_victim_done {}:{} no victim nodeid {}", from, seq, victim);
        }

        tracing::debug!(
            "receive_victim_done {}:{} remove victim {} time {} how {}",
            from,
            seq,
            victim,
            id.fence_time,
            id.fence_how
        );

        self.history.record_fenced_local(victim, now);

        if from == self.ctx.our_node {
            if let Some(v) = self.victims.get(victim) {
                if !v.local_victim_done {
                    tracing::error!("expect local_victim_done");
                }
            }
        } else {
            self.history
                .record_fenced_raw(victim, id.fence_master, id.fence_how, id.fence_time);
        }

        self.victims.remove(victim);
    }

    /// Another member fenced `victim` outside the coordinator
    pub fn receive_external(&mut self, from: NodeId, victim: NodeId, now: u64) {
        tracing::debug!("receive_external from {} victim nodeid {}", from, victim);
        self.history.record_external(victim, from, now);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cluster::GroupAddress;
    use crate::config::FenceConfig;
    use crate::domain::{Domain, DomainContext};
    use crate::protocol::{ChangeInfo, IdInfo, MessageFlags, IDI_NODEID_IS_MEMBER};

    fn domain(our: u32) -> Domain {
        Domain::new(DomainContext::new(Arc::new(FenceConfig::for_node(
            our,
            &format!("node{}", our),
        ))))
    }

    fn ids(members: &[u32]) -> Vec<IdInfo> {
        members
            .iter()
            .map(|id| IdInfo {
                node_id: *id,
                flags: IDI_NODEID_IS_MEMBER,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_start_marks_member() {
        let mut d = domain(1);
        let all = [GroupAddress::member(1), GroupAddress::member(2)];
        d.on_confchg(&all, &[], &all, 1).unwrap();

        let info = ChangeInfo {
            started_count: 0,
            member_count: 2,
            joined_count: 2,
            removed_count: 0,
            failed_count: 0,
        };
        d.receive_start(2, 1, MessageFlags::JOINING, &info, &ids(&[1, 2]), 5);

        let cg = d.changes().current().unwrap();
        let memb = cg.member(2).unwrap();
        assert!(memb.start);
        assert!(memb.start_flags.contains(MessageFlags::JOINING));
        assert_eq!(d.history().get(2).unwrap().add_time, 5);
    }

    #[test]
    fn test_start_from_merged_partition_disallowed() {
        let mut d = domain(1);
        let one = [GroupAddress::member(1)];
        d.on_confchg(&one, &[], &one, 1).unwrap();
        d.changes.retire_current();
        assert_eq!(d.changes().started_count(), 1);

        // node 2 appears as added, but has started elsewhere
        let both = [GroupAddress::member(1), GroupAddress::member(2)];
        d.on_confchg(&both, &[], &[GroupAddress::member(2)], 2).unwrap();

        let info = ChangeInfo {
            started_count: 3,
            member_count: 2,
            joined_count: 1,
            removed_count: 0,
            failed_count: 0,
        };
        d.receive_start(2, 7, MessageFlags::COMPLETE, &info, &ids(&[1, 2]), 5);

        let memb = d.changes().current().unwrap().member(2).unwrap().clone();
        assert!(memb.disallowed);
        assert!(!memb.start);
    }

    #[test]
    fn test_external_recorded() {
        let mut d = domain(1);
        let all = [GroupAddress::member(1), GroupAddress::member(2)];
        d.on_confchg(&all, &[], &all, 1).unwrap();

        d.receive_external(1, 2, 30);
        let node = d.history().get(2).unwrap();
        assert_eq!(node.fence_external_time, 30);
        assert_eq!(node.fence_external_node, 1);
        assert!(d.history().is_fenced_external(2));
    }

    #[test]
    fn test_victim_done_from_peer_records_master_details() {
        let mut d = domain(2);
        let all = [
            GroupAddress::member(1),
            GroupAddress::member(2),
            GroupAddress::member(3),
        ];
        d.on_confchg(&all, &[], &all, 1).unwrap();
        d.on_confchg(
            &all[..2],
            &[GroupAddress::new(3, crate::cluster::LeaveReason::NodeDown)],
            &[],
            2,
        )
        .unwrap();
        assert!(d.victims().is_victim(3));

        let id = IdInfo {
            node_id: 3,
            fence_master: 1,
            fence_how: 1,
            fence_time: 40,
            ..Default::default()
        };
        d.receive_victim_done(1, 2, MessageFlags::COMPLETE, &id, 45);

        assert!(!d.victims().is_victim(3));
        let node = d.history().get(3).unwrap();
        assert_eq!(node.fence_master, 1);
        assert_eq!(node.fence_time, 40);
        assert_eq!(node.fence_time_local, 45);
    }

    #[test]
    fn test_own_victim_done_without_local_done_still_removes() {
        let mut d = domain(1);
        let all = [GroupAddress::member(1), GroupAddress::member(2)];
        d.on_confchg(&all, &[], &all, 1).unwrap();
        d.on_confchg(
            &all[..1],
            &[GroupAddress::new(2, crate::cluster::LeaveReason::NodeDown)],
            &[],
            2,
        )
        .unwrap();

        let id = IdInfo {
            node_id: 2,
            fence_master: 1,
            fence_how: 1,
            fence_time: 40,
            ..Default::default()
        };
        d.receive_victim_done(1, 2, MessageFlags::empty(), &id, 45);

        assert!(d.victims().is_empty());
        // our own message does not overwrite history
        assert_eq!(d.history().get(2).unwrap().fence_time, 0);
    }
}
