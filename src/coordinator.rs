//! Coordinator
//!
//! Single-writer event loop tying the pieces together. The transport and
//! quorum service push events into the coordinator's channel; the loop
//! applies them to the daemon group and the fence domain, and carries out
//! whatever actions the domain asks for.
//!
//! While the master's fencing run is outstanding, domain group events are
//! held back and replayed in order once the run finishes. Daemon group and
//! cluster events keep flowing so the run sees current membership.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::cluster::{
    join_with_retry, send_with_retry, GroupAddress, GroupEvent, GroupName, GroupTransport, NodeId,
    QuorumService,
};
use crate::config::FenceConfig;
use crate::domain::{Action, Domain, DomainContext, DomainInfo, NodeFilter, NodeInfo};
use crate::error::{Error, Result};
use crate::fencing::{
    FenceAgent, FencingContext, FencingEvent, FencingRun, FencingSettings, FifoOverride,
    ManualOverride,
};
use crate::protocol::{
    DaemonGroup, Envelope, Header, Message, MessageFlags, ProtocolAction, ProtocolVersion,
    DAEMON_MAX,
};

/// Depth of the coordinator's event channel
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Everything the coordinator reacts to
#[derive(Debug, Clone)]
pub enum Event {
    /// From the group transport
    Group(GroupEvent),
    /// The quorum service has a new cluster state
    ClusterChanged,
    /// Progress of the fencing run
    Fencing(FencingEvent),
    /// An operator or tool fenced this node outside the coordinator
    ExternalFence(NodeId),
    Shutdown,
}

/// Cheap handle for queries and control from other tasks
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<Event>,
    domain: Arc<RwLock<Domain>>,
}

impl CoordinatorHandle {
    /// Channel the transport and quorum service push events into
    pub fn events(&self) -> mpsc::Sender<Event> {
        self.events.clone()
    }

    pub async fn domain_info(&self) -> DomainInfo {
        self.domain.read().await.info()
    }

    pub async fn node_info(&self, node_id: NodeId) -> Option<NodeInfo> {
        self.domain.read().await.node_info(node_id)
    }

    pub async fn nodes(&self, filter: NodeFilter) -> Vec<NodeInfo> {
        self.domain.read().await.nodes(filter)
    }

    /// Announce a node fenced by other means to every domain member
    pub async fn fence_external(&self, victim: NodeId) -> Result<()> {
        self.send(Event::ExternalFence(victim)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Event::Shutdown).await
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.events.send(event).await.map_err(|_| Error::ShuttingDown)
    }
}

/// The fencing coordinator of one node
pub struct Coordinator {
    config: Arc<FenceConfig>,
    transport: Arc<dyn GroupTransport>,
    quorum: Arc<dyn QuorumService>,
    agent: Arc<dyn FenceAgent>,
    manual: Option<Arc<dyn ManualOverride>>,
    domain: Arc<RwLock<Domain>>,
    daemon: Arc<RwLock<DaemonGroup>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    domain_group: GroupName,
    /// Domain events held back while fencing
    backlog: VecDeque<GroupEvent>,
    joined_domain: bool,
}

impl Coordinator {
    pub fn new(
        config: Arc<FenceConfig>,
        transport: Arc<dyn GroupTransport>,
        quorum: Arc<dyn QuorumService>,
        agent: Arc<dyn FenceAgent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let our_node = config.node.id;
        let domain_group = GroupName::Domain(config.domain.name.clone());
        let domain = Domain::new(DomainContext::new(Arc::clone(&config)));
        let manual = config
            .override_path()
            .map(|path| Arc::new(FifoOverride::new(path)) as Arc<dyn ManualOverride>);

        Self {
            config,
            transport,
            quorum,
            agent,
            manual,
            domain: Arc::new(RwLock::new(domain)),
            daemon: Arc::new(RwLock::new(DaemonGroup::new(our_node, DAEMON_MAX))),
            events_tx,
            events_rx,
            domain_group,
            backlog: VecDeque::new(),
            joined_domain: false,
        }
    }

    /// Replace the configured override channel
    pub fn with_manual_override(mut self, manual: Arc<dyn ManualOverride>) -> Self {
        self.manual = Some(manual);
        self
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            events: self.events_tx.clone(),
            domain: Arc::clone(&self.domain),
        }
    }

    fn our_node(&self) -> NodeId {
        self.config.node.id
    }

    /// Join the daemon group, negotiate, join the domain, then process
    /// events until shutdown
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            "fencekeeper node {} ({}) domain {}",
            self.our_node(),
            self.config.node.name,
            self.domain_group
        );

        self.refresh_cluster().await;
        join_with_retry(self.transport.as_ref(), &GroupName::Daemon).await?;

        while let Some(event) = self.events_rx.recv().await {
            let result = match event {
                Event::Group(ev) if *ev.group() == GroupName::Daemon => {
                    self.handle_daemon(ev).await
                }
                Event::Group(ev) if *ev.group() == self.domain_group => {
                    if self.domain.read().await.is_fencing() {
                        self.backlog.push_back(ev);
                        Ok(())
                    } else {
                        self.handle_domain(ev).await
                    }
                }
                Event::Group(ev) => {
                    tracing::debug!("event for unknown group {}", ev.group());
                    Ok(())
                }
                Event::ClusterChanged => {
                    self.refresh_cluster().await;
                    Ok(())
                }
                Event::Fencing(ev) => self.handle_fencing(ev).await,
                Event::ExternalFence(victim) => {
                    if self.joined_domain {
                        let action = self.domain.read().await.send_external(victim);
                        self.execute(vec![action]).await;
                    } else {
                        tracing::error!("fence_external {} not in domain", victim);
                    }
                    Ok(())
                }
                Event::Shutdown => {
                    tracing::info!("shutting down");
                    break;
                }
            };

            // only configuration and negotiation failures stop the node
            if let Err(e) = result {
                if e.is_fatal() {
                    tracing::error!("coordinator stopping: {}", e);
                    self.leave().await;
                    return Err(e);
                }
                tracing::error!("{}", e);
            }
        }

        self.leave().await;
        Ok(())
    }

    async fn leave(&mut self) {
        if self.joined_domain {
            self.domain.write().await.set_leaving();
            if let Err(e) = self.transport.leave(&self.domain_group).await {
                tracing::error!("leave {}: {}", self.domain_group, e);
            }
        }
        if let Err(e) = self.transport.leave(&GroupName::Daemon).await {
            tracing::error!("leave {}: {}", GroupName::Daemon, e);
        }
    }

    async fn refresh_cluster(&mut self) {
        let snapshot = match self.quorum.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("cluster update failed: {}", e);
                return;
            }
        };
        tracing::debug!(
            "cluster update quorate {} seq {} nodes {}",
            snapshot.quorate,
            snapshot.ring_seq,
            snapshot.nodes.len()
        );

        let actions = self
            .domain
            .write()
            .await
            .on_cluster_update(snapshot, crate::unix_now());
        self.execute(actions).await;
    }

    async fn handle_daemon(&mut self, ev: GroupEvent) -> Result<()> {
        match ev {
            GroupEvent::ConfChg {
                members, joined, ..
            } => {
                let members = node_ids(&members);
                let joined = node_ids(&joined);
                tracing::debug!("daemon confchg members {:?} joined {:?}", members, joined);

                let resend = self
                    .daemon
                    .write()
                    .await
                    .on_confchg(&members, &joined, crate::unix_now());
                if resend {
                    let proto = self.daemon.read().await.protocol();
                    if let Err(e) = self.send_protocol(proto).await {
                        tracing::error!("send protocol: {}", e);
                    }
                }
            }
            GroupEvent::Deliver { from, data, .. } => {
                let envelope = match Envelope::decode(&data, from, None) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::error!("deliver_cb_daemon {}", e);
                        return Ok(());
                    }
                };
                let Message::Protocol(proto) = envelope.message else {
                    tracing::error!(
                        "deliver_cb_daemon unknown msg type {}",
                        envelope.message.type_name()
                    );
                    return Ok(());
                };
                self.receive_protocol(from, proto).await?;
            }
            GroupEvent::Ring { ring_node, ring_seq, .. } => {
                tracing::debug!("daemon ring {}:{}", ring_node, ring_seq);
            }
        }
        Ok(())
    }

    async fn receive_protocol(
        &mut self,
        from: NodeId,
        proto: crate::protocol::Protocol,
    ) -> Result<()> {
        let (quorate, quorate_time) = {
            let domain = self.domain.read().await;
            (domain.cluster().quorate(), domain.cluster().quorate_time())
        };

        let action = {
            let mut daemon = self.daemon.write().await;
            daemon.receive_protocol(from, proto, quorate, quorate_time)
        };

        match action {
            Ok(ProtocolAction::Kick(node_id)) => self.kick(node_id),
            Ok(ProtocolAction::None) => {}
            Err(e) => {
                tracing::error!("receive_protocol {}", e);
                return Ok(());
            }
        }

        let proposal = self.daemon.write().await.next_proposal();
        match proposal {
            Ok(Some(proposal)) => {
                if let Err(e) = self.send_protocol(proposal).await {
                    tracing::error!("send protocol: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("{}", e),
        }

        if !self.joined_domain {
            let running = {
                let daemon = self.daemon.read().await;
                if daemon.running().is_some() {
                    daemon.check_compatible()?;
                }
                daemon.running()
            };

            if let Some(run) = running {
                tracing::info!("daemon protocol {} agreed, joining {}", run, self.domain_group);
                join_with_retry(self.transport.as_ref(), &self.domain_group).await?;
                self.joined_domain = true;
            }
        }

        Ok(())
    }

    async fn send_protocol(&self, proto: crate::protocol::Protocol) -> Result<()> {
        let envelope = Envelope::new(
            Header {
                version: ProtocolVersion::default(),
                sender: self.our_node(),
                target: 0,
                global_id: 0,
                flags: MessageFlags::empty(),
            },
            Message::Protocol(proto),
        );
        let data = envelope.encode()?;
        send_with_retry(self.transport.as_ref(), &GroupName::Daemon, &data, "protocol").await
    }

    async fn handle_domain(&mut self, ev: GroupEvent) -> Result<()> {
        let now = crate::unix_now();

        let actions = match ev {
            GroupEvent::ConfChg {
                members,
                left,
                joined,
                ..
            } => {
                let result = self
                    .domain
                    .write()
                    .await
                    .on_confchg(&members, &left, &joined, now);
                match result {
                    Ok(actions) => actions,
                    Err(e) => {
                        tracing::error!("domain confchg: {}", e);
                        return Ok(());
                    }
                }
            }
            GroupEvent::Deliver { from, data, .. } => {
                let running = self.daemon.read().await.running();
                let envelope = match Envelope::decode(&data, from, running.as_ref()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::error!("deliver_cb {}", e);
                        return Ok(());
                    }
                };
                tracing::debug!(
                    "deliver {} from {} flags {:x}",
                    envelope.message.type_name(),
                    from,
                    envelope.header.flags
                );
                self.domain.write().await.on_message(envelope, now)
            }
            GroupEvent::Ring {
                ring_node, ring_seq, ..
            } => self.domain.write().await.on_ring(ring_node, ring_seq, now),
        };

        self.execute(actions).await;
        Ok(())
    }

    async fn handle_fencing(&mut self, ev: FencingEvent) -> Result<()> {
        let now = crate::unix_now();

        let actions = {
            let mut domain = self.domain.write().await;
            match ev {
                FencingEvent::Attempt { node_id } => {
                    domain.fencing_attempt(node_id);
                    Vec::new()
                }
                FencingEvent::Resolved {
                    node_id,
                    how,
                    reduced,
                } => domain.victim_resolved(node_id, how, reduced, now),
                FencingEvent::Finished => domain.fencing_finished(now),
            }
        };
        self.execute(actions).await;

        // replay held back domain events until another run starts
        while !self.domain.read().await.is_fencing() {
            let Some(ev) = self.backlog.pop_front() else {
                break;
            };
            self.handle_domain(ev).await?;
        }
        Ok(())
    }

    fn kick(&self, node_id: NodeId) {
        tracing::info!("kick node {} from cluster", node_id);
        if let Err(e) = self.quorum.kick(node_id) {
            tracing::error!("kick_node_from_cluster {}: {}", node_id, e);
        }
    }

    /// Carry out domain actions; a failed send is logged and the rest still run
    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { flags, message } => {
                    if let Err(e) = self.send_domain(flags, message).await {
                        tracing::error!("send to {}: {}", self.domain_group, e);
                    }
                }
                Action::Kick(node_id) => self.kick(node_id),
                Action::SetStateful => self.daemon.write().await.set_stateful(),
                Action::StartFencing { node_join } => self.start_fencing(node_join),
                Action::Left => {
                    tracing::info!("left domain {}", self.domain_group);
                    self.joined_domain = false;
                }
            }
        }
    }

    async fn send_domain(&self, flags: MessageFlags, message: Message) -> Result<()> {
        let version = self.daemon.read().await.running().unwrap_or_default();
        let what = message.type_name();
        let envelope = Envelope::new(
            Header {
                version,
                sender: self.our_node(),
                target: 0,
                global_id: 0,
                flags,
            },
            message,
        );
        let data = envelope.encode()?;
        send_with_retry(self.transport.as_ref(), &self.domain_group, &data, what).await
    }

    fn start_fencing(&self, node_join: bool) {
        let ctx = FencingContext {
            domain: Arc::clone(&self.domain),
            daemon: Arc::clone(&self.daemon),
            quorum: Arc::clone(&self.quorum),
            agent: Arc::clone(&self.agent),
            manual: self.manual.clone(),
            events: self.events_tx.clone(),
        };
        let run = FencingRun::new(ctx, FencingSettings::from_config(&self.config), node_join);

        tracing::debug!("fencing run start node_join {}", node_join);
        tokio::spawn(async move {
            if let Err(e) = run.run().await {
                tracing::error!("fencing run: {}", e);
            }
        });
    }
}

fn node_ids(addrs: &[GroupAddress]) -> Vec<NodeId> {
    addrs.iter().map(|a| a.node_id).collect()
}
