//! Fence Domain
//!
//! The state machine of one fence domain. Every input (membership change,
//! ring change, cluster update, message, fencing progress) is applied
//! synchronously and returns the `Action`s the coordinator must carry out.
//! Nothing here does I/O.

mod query;
mod receive;

use std::sync::Arc;

use crate::cluster::{ClusterSnapshot, ClusterView, GroupAddress, NodeId};
use crate::config::FenceConfig;
use crate::error::Result;
use crate::protocol::{Envelope, Message, MessageFlags, MessageType};
use crate::state::{ChangeState, ChangeTracker, FenceHow, HistoryStore, VictimSet};

pub use query::{DomainInfo, MemberStatus, NodeFilter, NodeInfo};

/// Identity and configuration a domain runs with
#[derive(Debug, Clone)]
pub struct DomainContext {
    pub our_node: NodeId,
    pub our_name: String,
    /// Domain name, the group is "fenced:<name>"
    pub name: String,
    pub config: Arc<FenceConfig>,
}

impl DomainContext {
    pub fn new(config: Arc<FenceConfig>) -> Self {
        Self {
            our_node: config.node.id,
            our_name: config.node.name.clone(),
            name: config.domain.name.clone(),
            config,
        }
    }
}

/// Work the coordinator does on the domain's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Multicast to the domain group
    Send { flags: MessageFlags, message: Message },
    /// Evict a node from the cluster
    Kick(NodeId),
    /// We have completed a change; advertise stateful from now on
    SetStateful,
    /// We are master of the current change; run the fencing
    StartFencing { node_join: bool },
    /// Our own leave went through
    Left,
}

/// State of a fence domain on this node
pub struct Domain {
    ctx: DomainContext,
    history: HistoryStore,
    changes: ChangeTracker,
    victims: VictimSet,
    cluster: ClusterView,
    ring_node: NodeId,
    ring_seq: u64,
    master: NodeId,
    /// A completed member's COMPLETE listed us
    init_complete: bool,
    /// We completed a change as master
    local_init_complete: bool,
    joining_group: bool,
    leaving_group: bool,
    /// Victim the fencing run is working on, for queries
    current_victim: NodeId,
    /// Configured nodes, used once for startup victims when we join
    configured: Option<Vec<(NodeId, String)>>,
    /// A fencing run is outstanding for the current change
    fencing: bool,
}

impl Domain {
    pub fn new(ctx: DomainContext) -> Self {
        let mut history = HistoryStore::new();

        let configured = if ctx.config.domain.clean_start {
            tracing::debug!("clean start, skipping initial nodes");
            None
        } else {
            let nodes: Vec<(NodeId, String)> = ctx
                .config
                .domain
                .nodes
                .iter()
                .map(|n| (n.id, n.name.clone()))
                .collect();
            for (id, _) in &nodes {
                history.ensure(*id);
            }
            tracing::debug!("added {} nodes from config", nodes.len());
            Some(nodes)
        };

        Self {
            ctx,
            history,
            changes: ChangeTracker::new(),
            victims: VictimSet::new(),
            cluster: ClusterView::new(),
            ring_node: 0,
            ring_seq: 0,
            master: 0,
            init_complete: false,
            local_init_complete: false,
            joining_group: true,
            leaving_group: false,
            current_victim: 0,
            configured,
            fencing: false,
        }
    }

    pub fn context(&self) -> &DomainContext {
        &self.ctx
    }

    pub fn our_node(&self) -> NodeId {
        self.ctx.our_node
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn changes(&self) -> &ChangeTracker {
        &self.changes
    }

    pub fn victims(&self) -> &VictimSet {
        &self.victims
    }

    pub fn cluster(&self) -> &ClusterView {
        &self.cluster
    }

    pub fn master(&self) -> NodeId {
        self.master
    }

    pub fn is_fencing(&self) -> bool {
        self.fencing
    }

    pub fn init_complete(&self) -> bool {
        self.init_complete
    }

    pub fn local_init_complete(&self) -> bool {
        self.local_init_complete
    }

    /// Best known name for a node
    pub fn name_of(&self, node_id: NodeId) -> String {
        self.cluster
            .name_of(node_id)
            .or_else(|| self.ctx.config.node_name(node_id))
            .map(str::to_string)
            .unwrap_or_else(|| node_id.to_string())
    }

    /// We asked to leave the domain group
    pub fn set_leaving(&mut self) {
        self.leaving_group = true;
    }

    /// Flags every message we send carries
    fn complete_flag(&self) -> MessageFlags {
        if self.init_complete || self.local_init_complete {
            MessageFlags::COMPLETE
        } else {
            MessageFlags::empty()
        }
    }

    /// Domain group membership change
    pub fn on_confchg(
        &mut self,
        members: &[GroupAddress],
        left: &[GroupAddress],
        joined: &[GroupAddress],
        now: u64,
    ) -> Result<Vec<Action>> {
        let our_node = self.ctx.our_node;

        if self.leaving_group && left.iter().any(|a| a.node_id == our_node) {
            tracing::debug!("confchg for our leave");
            return Ok(vec![Action::Left]);
        }

        let added = self
            .changes
            .add_change(our_node, members, left, joined, &mut self.history, now)?;

        let mut actions: Vec<Action> = added.kick.into_iter().map(Action::Kick).collect();

        // failed nodes in this change become victims
        let names: Vec<(NodeId, String)> = self
            .changes
            .current()
            .map(|cg| cg.failed().map(|m| (m.node_id, self.name_of(m.node_id))).collect())
            .unwrap_or_default();

        if let Some(cg) = self.changes.current() {
            self.victims.add_failed(cg, |id| {
                names
                    .iter()
                    .find(|(n, _)| *n == id)
                    .map(|(_, name)| name.clone())
                    .unwrap_or_else(|| id.to_string())
            });

            // joining with no state: assume absent configured nodes failed,
            // until a COMPLETE from an existing member says otherwise
            if cg.we_joined {
                if let Some(configured) = self.configured.take() {
                    self.victims.add_init(
                        cg,
                        configured.iter().map(|(id, name)| (*id, name.as_str())),
                        &self.cluster,
                    );
                }
            }
        }

        actions.extend(self.apply_changes(now));
        Ok(actions)
    }

    /// The domain group's ring changed
    pub fn on_ring(&mut self, ring_node: NodeId, ring_seq: u64, now: u64) -> Vec<Action> {
        tracing::debug!("domain ring {}:{}", ring_node, ring_seq);
        self.ring_node = ring_node;
        self.ring_seq = ring_seq;
        self.apply_changes(now)
    }

    /// The quorum service reported a new cluster state
    pub fn on_cluster_update(&mut self, snapshot: ClusterSnapshot, now: u64) -> Vec<Action> {
        self.cluster.update(snapshot, &mut self.history, now);
        self.apply_changes(now)
    }

    /// A message from the domain group, already decoded
    pub fn on_message(&mut self, envelope: Envelope, now: u64) -> Vec<Action> {
        let from = envelope.header.sender;
        let flags = envelope.header.flags;

        match envelope.message {
            Message::Start { seq, info, ids } => {
                self.receive_start(from, seq, flags, &info, &ids, now)
            }
            Message::Complete { seq, ids, .. } => self.receive_complete(from, seq, &ids),
            Message::VictimDone { seq, id } => self.receive_victim_done(from, seq, flags, &id, now),
            Message::External { victim } => self.receive_external(from, victim, now),
            Message::Protocol(_) => {
                tracing::error!("unexpected protocol message from {} in domain group", from);
            }
        }

        self.apply_changes(now)
    }

    /// Ring and quorum agree with the group's view
    fn wait_conditions_done(&self) -> bool {
        let cluster_seq = self.cluster.ring_seq();

        if cluster_seq != self.ring_seq as u32 {
            tracing::debug!(
                "check_ringid cluster {} cpg {}:{}",
                cluster_seq,
                self.ring_node,
                self.ring_seq
            );
            return false;
        }
        tracing::debug!(
            "check_ringid done cluster {} cpg {}:{}",
            cluster_seq,
            self.ring_node,
            self.ring_seq
        );

        if !self.cluster.quorate() {
            tracing::debug!("check_quorum not quorate");
            return false;
        }
        tracing::debug!("check_quorum done");
        true
    }

    fn wait_messages_done(&self) -> bool {
        let Some(cg) = self.changes.current() else {
            return false;
        };

        let (need, total) = cg.starts_needed();
        if need > 0 {
            tracing::debug!("wait_messages cg {} need {} of {}", cg.seq, need, total);
            return false;
        }

        tracing::debug!("wait_messages cg {} got all {}", cg.seq, total);
        true
    }

    /// Lowest member that has completed a change, else lowest member
    fn set_master(&mut self) {
        let Some(cg) = self.changes.current() else {
            return;
        };

        let low = cg.members.iter().map(|m| m.node_id).min().unwrap_or(0);
        let complete = cg
            .members
            .iter()
            .filter(|m| m.start_flags.contains(MessageFlags::COMPLETE))
            .map(|m| m.node_id)
            .min();

        let (kind, master) = match complete {
            Some(id) => ("complete", id),
            None => ("low", low),
        };
        tracing::debug!("set_master from {} to {} node {}", self.master, kind, master);
        self.master = master;
    }

    /// Advance the current change as far as it can go
    pub fn apply_changes(&mut self, _now: u64) -> Vec<Action> {
        let mut actions = Vec::new();

        // the master finishes fencing before moving on
        if self.fencing {
            return actions;
        }

        let Some(state) = self.changes.current().map(|cg| cg.state) else {
            return actions;
        };

        match state {
            ChangeState::WaitConditions => {
                if self.wait_conditions_done() {
                    actions.extend(self.send_start());
                    if let Some(cg) = self.changes.current_mut() {
                        cg.state = ChangeState::WaitMessages;
                    }
                }
            }
            ChangeState::WaitMessages => {
                if self.wait_messages_done() {
                    actions.push(Action::SetStateful);
                    self.set_master();
                    if let Some(cg) = self.changes.current_mut() {
                        cg.state = ChangeState::WaitFencing;
                    }

                    if self.master == self.ctx.our_node {
                        self.fencing = true;
                        let node_join =
                            self.changes.nodes_added() || self.cluster.quorate_from_last_update();
                        actions.push(Action::StartFencing { node_join });
                    } else {
                        self.defer_fencing();
                        self.changes.retire_current();
                        self.joining_group = false;
                    }
                }
            }
            ChangeState::WaitFencing => {
                tracing::error!("apply_changes invalid state {}", state);
            }
        }

        actions
    }

    fn defer_fencing(&self) {
        if self.victims.is_empty() {
            return;
        }
        tracing::info!("fencing deferred to {}", self.name_of(self.master));
    }

    /// START (or COMPLETE) for the current change
    fn send_info(&self, kind: MessageType, extra: MessageFlags) -> Option<Action> {
        let cg = self.changes.current()?;

        let mut flags = extra | self.complete_flag();
        if cg.we_joined {
            flags.insert(MessageFlags::JOINING);
        }

        let started_count = self.changes.started_count();
        let info = cg.info(started_count);
        let ids = cg.id_infos(&self.history);

        tracing::debug!(
            "send_{} {}:{} flags {:x} started {} m {} j {} r {} f {}",
            kind.name(),
            self.ctx.our_node,
            cg.seq,
            flags,
            started_count,
            cg.member_count,
            cg.joined_count,
            cg.removed_count,
            cg.failed_count
        );

        let message = match kind {
            MessageType::Complete => Message::Complete {
                seq: cg.seq,
                info,
                ids,
            },
            _ => Message::Start {
                seq: cg.seq,
                info,
                ids,
            },
        };
        Some(Action::Send { flags, message })
    }

    fn send_start(&mut self) -> Option<Action> {
        // an older unsent change peers could confuse with this one
        let flags = if self.changes.duplicate_of_older().is_some() {
            MessageFlags::DUPLICATE_CG
        } else {
            MessageFlags::empty()
        };

        self.changes.current_mut()?.sent_start = true;
        self.send_info(MessageType::Start, flags)
    }

    fn send_victim_done(&self, victim: NodeId) -> Option<Action> {
        let seq = self.changes.current().map(|cg| cg.seq).unwrap_or(0);
        let flags = self.complete_flag();

        let Some(node) = self.history.get(victim) else {
            tracing::error!("send_victim_done no nodeid {}", victim);
            return None;
        };

        let mut id = node.to_id_info(false);
        id.fence_master = self.ctx.our_node;

        tracing::debug!(
            "send_victim_done cg {} flags {:x} victim nodeid {}",
            seq,
            flags,
            victim
        );

        Some(Action::Send {
            flags,
            message: Message::VictimDone { seq, id },
        })
    }

    /// Tell the domain a node was fenced outside the coordinator
    pub fn send_external(&self, victim: NodeId) -> Action {
        tracing::debug!("send_external victim nodeid {}", victim);
        Action::Send {
            flags: MessageFlags::empty(),
            message: Message::External { victim },
        }
    }

    /// The fencing run moved to a victim
    pub fn fencing_attempt(&mut self, node_id: NodeId) {
        self.current_victim = node_id;
    }

    /// The fencing run resolved a victim
    pub fn victim_resolved(
        &mut self,
        node_id: NodeId,
        how: FenceHow,
        reduced: bool,
        now: u64,
    ) -> Vec<Action> {
        self.history
            .record_fenced(node_id, self.ctx.our_node, how, now);

        if reduced {
            self.victims.remove(node_id);
        } else if let Some(victim) = self.victims.get_mut(node_id) {
            victim.local_victim_done = true;
        }

        self.send_victim_done(node_id).into_iter().collect()
    }

    /// The fencing run is over: announce completion and retire the change
    pub fn fencing_finished(&mut self, now: u64) -> Vec<Action> {
        if !self.fencing {
            tracing::error!("fencing finished with no fencing outstanding");
            return Vec::new();
        }

        self.current_victim = 0;
        let mut actions: Vec<Action> = self
            .send_info(MessageType::Complete, MessageFlags::empty())
            .into_iter()
            .collect();

        self.local_init_complete = true;
        self.fencing = false;
        self.changes.retire_current();
        self.joining_group = false;

        actions.extend(self.apply_changes(now));
        actions
    }
}
