//! Fencing Runner
//!
//! Runs on the master once a change has been agreed. It first delays to
//! give victims a chance to rejoin cleanly, then works through the victims
//! one at a time until each is fenced, overridden, or shown to be safe.
//!
//! The runner never mutates domain state. It reads through the shared
//! locks and reports every resolution to the coordinator as an event.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use super::{FenceAgent, FenceLogEntry, FenceOutcome, ManualOverride};
use crate::cluster::{NodeId, QuorumService};
use crate::config::FenceConfig;
use crate::coordinator::Event;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::protocol::DaemonGroup;
use crate::state::{FenceHow, Victim};

/// Retries after which identical failures stop being logged
const LOG_LIMIT_RETRIES: u32 = 2;
/// Retries between "still retrying" messages once logging is limited
const STILL_RETRYING_EVERY: u32 = 600;

/// Progress reports from a fencing run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FencingEvent {
    /// About to work on this victim
    Attempt { node_id: NodeId },
    /// The victim no longer needs fencing
    Resolved {
        node_id: NodeId,
        how: FenceHow,
        /// Found safe while delaying, before the victim loop
        reduced: bool,
    },
    /// Every victim has been dealt with
    Finished,
}

/// Delays and retry pacing for a run
#[derive(Debug, Clone)]
pub struct FencingSettings {
    pub post_join_delay: i32,
    pub post_fail_delay: i32,
    pub override_time: Duration,
    pub retry_interval: Duration,
    pub delay_poll: Duration,
}

impl FencingSettings {
    pub fn from_config(config: &FenceConfig) -> Self {
        Self {
            post_join_delay: config.fencing.post_join_delay,
            post_fail_delay: config.fencing.post_fail_delay,
            override_time: config.override_time(),
            retry_interval: config.retry_interval(),
            delay_poll: config.delay_poll(),
        }
    }
}

/// Collaborators a run needs
#[derive(Clone)]
pub struct FencingContext {
    pub domain: Arc<RwLock<Domain>>,
    pub daemon: Arc<RwLock<DaemonGroup>>,
    pub quorum: Arc<dyn QuorumService>,
    pub agent: Arc<dyn FenceAgent>,
    pub manual: Option<Arc<dyn ManualOverride>>,
    pub events: mpsc::Sender<Event>,
}

/// One master fencing run
pub struct FencingRun {
    ctx: FencingContext,
    settings: FencingSettings,
    /// Nodes were added by a pending change, or quorum was just regained
    node_join: bool,
    /// Victims we already reported, the coordinator may not have caught up
    resolved: HashSet<NodeId>,
}

impl FencingRun {
    pub fn new(ctx: FencingContext, settings: FencingSettings, node_join: bool) -> Self {
        Self {
            ctx,
            settings,
            node_join,
            resolved: HashSet::new(),
        }
    }

    /// Delay, fence every victim, then report `Finished`
    pub async fn run(mut self) -> Result<()> {
        self.delay().await?;
        self.fence_victims().await?;
        self.report(FencingEvent::Finished).await
    }

    async fn report(&self, event: FencingEvent) -> Result<()> {
        self.ctx
            .events
            .send(Event::Fencing(event))
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    async fn resolve(&mut self, node_id: NodeId, how: FenceHow, reduced: bool) -> Result<()> {
        self.resolved.insert(node_id);
        self.report(FencingEvent::Resolved {
            node_id,
            how,
            reduced,
        })
        .await
    }

    /// Victims not yet resolved by this run
    async fn victims(&self) -> Vec<Victim> {
        let domain = self.ctx.domain.read().await;
        domain
            .victims()
            .iter()
            .filter(|v| !self.resolved.contains(&v.node_id))
            .cloned()
            .collect()
    }

    async fn victim(&self, node_id: NodeId) -> Option<Victim> {
        if self.resolved.contains(&node_id) {
            return None;
        }
        self.ctx.domain.read().await.victims().get(node_id).cloned()
    }

    fn is_cluster_member(&self, node_id: NodeId) -> bool {
        match self.ctx.quorum.snapshot() {
            Ok(snapshot) => snapshot.is_member(node_id),
            Err(e) => {
                tracing::error!("cluster snapshot error {}", e);
                false
            }
        }
    }

    async fn is_clean_daemon_member(&self, node_id: NodeId) -> bool {
        self.ctx.daemon.read().await.is_clean_member(node_id)
    }

    /// Resolve victims that rejoined cleanly, returning how many remain
    async fn reduce(&mut self) -> Result<usize> {
        let victims = self.victims().await;
        let mut remaining = victims.len();

        for victim in victims {
            if self.is_cluster_member(victim.node_id)
                && self.is_clean_daemon_member(victim.node_id).await
            {
                tracing::debug!("reduce victim {}", victim.name);
                self.resolve(victim.node_id, FenceHow::Member, true).await?;
                remaining -= 1;
            }
        }

        Ok(remaining)
    }

    async fn delay(&mut self) -> Result<()> {
        if self.victims().await.is_empty() {
            return Ok(());
        }

        let post_join = self.settings.post_join_delay;
        let (mut delay, mut delay_type) = if self.node_join {
            (post_join, "post_join_delay")
        } else {
            (self.settings.post_fail_delay, "post_fail_delay")
        };

        tracing::debug!("delay {} {} node_join {}", delay_type, delay, self.node_join);

        if delay != 0 {
            let first = Instant::now();
            let mut start = first;
            let mut last_count = 0;
            let mut victim_count;

            loop {
                tokio::time::sleep(self.settings.delay_poll).await;

                victim_count = self.reduce().await?;
                if victim_count == 0 {
                    break;
                }

                if victim_count < last_count {
                    start = Instant::now();
                    if delay > 0 && post_join > delay {
                        delay = post_join;
                        delay_type = "post_join_delay (modified)";
                    }
                }
                last_count = victim_count;

                // negative delay means wait for every victim
                if delay < 0 {
                    continue;
                }

                if start.elapsed() >= Duration::from_secs(delay as u64) {
                    break;
                }
            }

            tracing::debug!(
                "delay of {}s leaves {} victims",
                first.elapsed().as_secs(),
                victim_count
            );
        }

        for victim in self.victims().await {
            tracing::debug!(
                "{} not a cluster member after {} sec {}",
                victim.name,
                delay,
                delay_type
            );
        }
        Ok(())
    }

    async fn fence_victims(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self.victims().await.iter().map(|v| v.node_id).collect();

        for node_id in ids {
            let Some(victim) = self.victim(node_id).await else {
                continue;
            };

            // set only once we resolved it, and then it is in `resolved`
            if victim.local_victim_done {
                tracing::error!("skip local_victim_done node {}", node_id);
                continue;
            }

            self.fence_victim(&victim).await?;
        }

        Ok(())
    }

    async fn fence_victim(&mut self, victim: &Victim) -> Result<()> {
        let node_id = victim.node_id;
        let name = victim.name.as_str();
        let mut retries: u32 = 0;
        let mut prev_log: Option<Vec<FenceLogEntry>> = None;

        loop {
            let limit = retries > LOG_LIMIT_RETRIES;
            if limit && retries % STILL_RETRYING_EVERY == 0 {
                tracing::info!("fencing node {} still retrying", name);
            }

            self.report(FencingEvent::Attempt { node_id }).await?;

            let cluster_member = self.is_cluster_member(node_id);
            let daemon_member = self.is_clean_daemon_member(node_id).await;
            let external = self
                .ctx
                .domain
                .read()
                .await
                .history()
                .is_fenced_external(node_id);

            if (cluster_member && daemon_member) || external {
                tracing::debug!(
                    "averting fence of node {} cluster member {} cpg member {} external {}",
                    name,
                    cluster_member,
                    daemon_member,
                    external
                );
                let how = if external {
                    FenceHow::External
                } else {
                    FenceHow::Member
                };
                return self.resolve(node_id, how, false).await;
            }

            if !limit {
                tracing::info!("fencing node {}", name);
            }

            let outcome = self.call_agent(name).await;

            let repeated = limit && !outcome.success && prev_log.as_ref() == Some(&outcome.log);
            if !repeated {
                log_outcome(name, &outcome);
                prev_log = Some(outcome.log.clone());
            }

            if outcome.success {
                return self.resolve(node_id, FenceHow::Agent, false).await;
            }

            match self.ctx.manual.clone() {
                None => tokio::time::sleep(self.settings.retry_interval).await,
                Some(manual) => {
                    let overridden = manual.wait_for(name, self.settings.override_time).await;
                    match overridden {
                        Ok(true) => {
                            tracing::warn!(
                                "fence {} overridden by administrator intervention",
                                name
                            );
                            return self.resolve(node_id, FenceHow::Override, false).await;
                        }
                        Ok(false) => {}
                        Err(e) => tracing::debug!("{}", e),
                    }
                }
            }

            retries += 1;
        }
    }

    async fn call_agent(&self, name: &str) -> FenceOutcome {
        let agent = Arc::clone(&self.ctx.agent);
        let victim = name.to_string();

        match tokio::task::spawn_blocking(move || agent.fence(&victim)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("fence {} agent task: {}", name, e);
                FenceOutcome::failed(Vec::new())
            }
        }
    }
}

fn log_outcome(name: &str, outcome: &FenceOutcome) {
    for entry in &outcome.log {
        let agent = if entry.agent.is_empty() {
            "none"
        } else {
            entry.agent.as_str()
        };
        if entry.error.is_success() {
            tracing::debug!(
                "fence {} dev {}.{} agent {} result: {}",
                name,
                entry.method,
                entry.device,
                agent,
                entry.error
            );
        } else {
            tracing::error!(
                "fence {} dev {}.{} agent {} result: {}",
                name,
                entry.method,
                entry.device,
                agent,
                entry.error
            );
        }
    }

    if outcome.success {
        tracing::info!("fence {} success", name);
    } else {
        tracing::error!("fence {} failed", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterNode, ClusterSnapshot, GroupAddress, LeaveReason};
    use crate::config::FenceConfig;
    use crate::domain::DomainContext;
    use crate::fencing::FenceError;
    use crate::protocol::DAEMON_MAX;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct StaticQuorum {
        members: Mutex<Vec<NodeId>>,
    }

    impl QuorumService for StaticQuorum {
        fn snapshot(&self) -> Result<ClusterSnapshot> {
            let members = self.members.lock().unwrap();
            Ok(ClusterSnapshot {
                quorate: true,
                ring_seq: 1,
                nodes: (1..=3)
                    .map(|id| ClusterNode {
                        node_id: id,
                        name: format!("node{}", id),
                        member: members.contains(&id),
                        incarnation: 1,
                    })
                    .collect(),
            })
        }

        fn kick(&self, _node_id: NodeId) -> Result<()> {
            Ok(())
        }
    }

    /// Fails `fail_first` times, then succeeds
    struct CountingAgent {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl FenceAgent for CountingAgent {
        fn fence(&self, _victim: &str) -> FenceOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                FenceOutcome::failed(vec![FenceLogEntry {
                    method: 1,
                    device: 1,
                    agent: "fence_ipmilan".into(),
                    error: FenceError::AgentError,
                }])
            } else {
                FenceOutcome::success()
            }
        }
    }

    struct AlwaysOverride;

    #[async_trait]
    impl ManualOverride for AlwaysOverride {
        async fn wait_for(&self, _victim: &str, _wait: Duration) -> Result<bool> {
            Ok(true)
        }
    }

    struct Fixture {
        ctx: FencingContext,
        rx: mpsc::Receiver<Event>,
        agent: Arc<CountingAgent>,
    }

    /// Node 1 is master of {1,2}; node 3 failed
    fn fixture(fail_first: u32, manual: Option<Arc<dyn ManualOverride>>) -> Fixture {
        let config = FenceConfig::for_node(1, "node1");
        let mut domain = Domain::new(DomainContext::new(Arc::new(config)));
        domain
            .on_confchg(
                &[GroupAddress::member(1), GroupAddress::member(2), GroupAddress::member(3)],
                &[],
                &[GroupAddress::member(1), GroupAddress::member(2), GroupAddress::member(3)],
                1,
            )
            .unwrap();
        domain
            .on_confchg(
                &[GroupAddress::member(1), GroupAddress::member(2)],
                &[GroupAddress::new(3, LeaveReason::NodeDown)],
                &[],
                2,
            )
            .unwrap();
        assert!(domain.victims().is_victim(3));

        let (tx, rx) = mpsc::channel(64);
        let agent = Arc::new(CountingAgent {
            calls: AtomicU32::new(0),
            fail_first,
        });
        let ctx = FencingContext {
            domain: Arc::new(RwLock::new(domain)),
            daemon: Arc::new(RwLock::new(DaemonGroup::new(1, DAEMON_MAX))),
            quorum: Arc::new(StaticQuorum {
                members: Mutex::new(vec![1, 2]),
            }),
            agent: agent.clone(),
            manual,
            events: tx,
        };
        Fixture { ctx, rx, agent }
    }

    fn settings() -> FencingSettings {
        FencingSettings {
            post_join_delay: 0,
            post_fail_delay: 0,
            override_time: Duration::from_secs(3),
            retry_interval: Duration::from_secs(5),
            delay_poll: Duration::from_secs(1),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<FencingEvent> {
        let mut out = Vec::new();
        while let Ok(Event::Fencing(ev)) = rx.try_recv() {
            if !matches!(ev, FencingEvent::Attempt { .. }) {
                out.push(ev);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_success() {
        let mut fx = fixture(0, None);
        FencingRun::new(fx.ctx.clone(), settings(), false).run().await.unwrap();

        assert_eq!(
            drain(&mut fx.rx),
            vec![
                FencingEvent::Resolved {
                    node_id: 3,
                    how: FenceHow::Agent,
                    reduced: false
                },
                FencingEvent::Finished
            ]
        );
        assert_eq!(fx.agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_agent_succeeds() {
        let mut fx = fixture(4, None);
        FencingRun::new(fx.ctx.clone(), settings(), false).run().await.unwrap();

        assert_eq!(fx.agent.calls.load(Ordering::SeqCst), 5);
        assert_eq!(drain(&mut fx.rx).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_after_failure() {
        let mut fx = fixture(u32::MAX, Some(Arc::new(AlwaysOverride)));
        FencingRun::new(fx.ctx.clone(), settings(), false).run().await.unwrap();

        assert_eq!(fx.agent.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            drain(&mut fx.rx)[0],
            FencingEvent::Resolved {
                node_id: 3,
                how: FenceHow::Override,
                reduced: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_fence_averts_agent() {
        let mut fx = fixture(0, None);
        {
            let mut domain = fx.ctx.domain.write().await;
            domain.receive_external(2, 3, 10);
        }

        FencingRun::new(fx.ctx.clone(), settings(), false).run().await.unwrap();
        assert_eq!(fx.agent.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            drain(&mut fx.rx)[0],
            FencingEvent::Resolved {
                node_id: 3,
                how: FenceHow::External,
                reduced: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_fail_delay_reduces_rejoined_victim() {
        let mut fx = fixture(0, None);

        // node 3 is back in the cluster and its daemon restarted cleanly
        {
            let mut daemon = fx.ctx.daemon.write().await;
            daemon.on_confchg(&[1, 2, 3], &[3], 5);
            daemon
                .receive_protocol(
                    3,
                    crate::protocol::Protocol {
                        max: DAEMON_MAX,
                        run: Default::default(),
                    },
                    true,
                    0,
                )
                .unwrap();
        }

        let quorum: Arc<dyn QuorumService> = Arc::new(StaticQuorum {
            members: Mutex::new(vec![1, 2, 3]),
        });
        fx.ctx.quorum = quorum;

        let mut s = settings();
        s.post_fail_delay = 10;
        FencingRun::new(fx.ctx.clone(), s, false).run().await.unwrap();

        assert_eq!(fx.agent.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            drain(&mut fx.rx),
            vec![
                FencingEvent::Resolved {
                    node_id: 3,
                    how: FenceHow::Member,
                    reduced: true
                },
                FencingEvent::Finished
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_expires_then_fences() {
        let mut fx = fixture(0, None);
        let mut s = settings();
        s.post_join_delay = 3;

        let started = Instant::now();
        FencingRun::new(fx.ctx.clone(), s, true).run().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(fx.agent.calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut fx.rx).len(), 2);
    }
}
