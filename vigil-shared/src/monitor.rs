//! Per-cluster monitor.
//!
//! One monitor task owns each cluster's nodes, proxies, status and
//! snapshots; nothing else mutates them. The fixed-period tick probes the
//! fleet, rebuilds the topology, runs the state machine, evaluates
//! triggers and refreshes proxies. A tick that overruns its period causes
//! the next one to be skipped, never queued.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::arbitration::{
    ArbitrationVerdict, Arbitrator, ControllerStatus, Heartbeat, SharedArbitrationState,
};
use crate::cluster::{
    degraded_reasons, primary_confirmed_down, ClusterState, ClusterStatus,
};
use crate::config::{ClusterConfig, FailoverMode};
use crate::driver::{NodeDriver, NodeDriverFactory};
use crate::events::{EventOrigin, EventRing, Severity};
use crate::exception::{VigilError, VigilResult};
use crate::failover::{Executor, ExecutorContext, FailoverChecks};
use crate::metrics::MonitorMetrics;
use crate::node::{Node, NodeId, NodeRole, ProbeReport};
use crate::proxy::{BackendSet, ProxyController, ProxyDriver};
use crate::rejoin::{rejoin_node, RejoinContext};
use crate::topology::{build_snapshot, TopologySnapshot};

/// Probe fan-out concurrency bound within one tick.
const PROBE_CONCURRENCY: usize = 16;

/// Operator and supervisor commands dispatched to a running monitor.
#[derive(Debug)]
pub enum MonitorCommand {
    /// Whole-object config swap; applied before the next tick.
    UpdateConfig(Box<ClusterConfig>),
    Switchover { target: Option<NodeId> },
    /// Drain a node out of the proxies and stop electing it.
    SetMaintenance { node: NodeId },
    Pause,
    Resume,
    Stop,
}

/// Read-only view published after every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    pub name: String,
    pub uuid: String,
    pub state: ClusterState,
    pub primary: Option<String>,
    pub hosts: u32,
    pub failed: u32,
    pub failover_count: u32,
    pub is_split_brain: bool,
}

impl ClusterView {
    fn from_status(status: &ClusterStatus, snapshot: Option<&TopologySnapshot>) -> Self {
        let (hosts, failed) = snapshot
            .map(|s| (s.nodes.len() as u32, s.failed.len() as u32))
            .unwrap_or((0, 0));
        Self {
            name: status.name.clone(),
            uuid: status.uuid.to_string(),
            state: status.state,
            primary: status.current_primary.as_ref().map(|p| p.address()),
            hosts,
            failed,
            failover_count: status.failover_count,
            is_split_brain: status.is_split_brain,
        }
    }

    /// Heartbeat payload peers and the arbitrator see for this cluster.
    pub fn heartbeat(&self, secret: &str, uid: u64, standby: bool) -> Heartbeat {
        Heartbeat {
            uuid: self.uuid.clone(),
            secret: secret.to_string(),
            cluster: self.name.clone(),
            master: self.primary.clone().unwrap_or_default(),
            uid,
            status: if standby {
                ControllerStatus::Standby
            } else {
                ControllerStatus::Active
            },
            hosts: self.hosts,
            failed: self.failed,
        }
    }
}

/// Handle held by the supervisor for a spawned monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCommand>,
    view: watch::Receiver<ClusterView>,
}

impl MonitorHandle {
    pub async fn update_config(&self, config: ClusterConfig) -> VigilResult<()> {
        self.send(MonitorCommand::UpdateConfig(Box::new(config))).await
    }

    pub async fn request_switchover(&self, target: Option<NodeId>) -> VigilResult<()> {
        self.send(MonitorCommand::Switchover { target }).await
    }

    pub async fn set_maintenance(&self, node: NodeId) -> VigilResult<()> {
        self.send(MonitorCommand::SetMaintenance { node }).await
    }

    pub async fn pause(&self) -> VigilResult<()> {
        self.send(MonitorCommand::Pause).await
    }

    pub async fn resume(&self) -> VigilResult<()> {
        self.send(MonitorCommand::Resume).await
    }

    pub async fn stop(&self) -> VigilResult<()> {
        self.send(MonitorCommand::Stop).await
    }

    pub fn view(&self) -> ClusterView {
        self.view.borrow().clone()
    }

    async fn send(&self, command: MonitorCommand) -> VigilResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| VigilError::internal("cluster monitor is gone"))
    }
}

pub struct ClusterMonitor {
    config: Arc<ClusterConfig>,
    status: ClusterStatus,
    nodes: BTreeMap<String, Node>,
    drivers: BTreeMap<String, Arc<dyn NodeDriver>>,
    driver_factory: Arc<dyn NodeDriverFactory>,
    executor: Executor,
    proxies: ProxyController,
    events: Arc<EventRing>,
    metrics: Arc<MonitorMetrics>,
    arbitration: Arc<SharedArbitrationState>,
    arbitrator: Option<Arc<dyn Arbitrator>>,
    last_snapshot: Option<TopologySnapshot>,
    prev_anomaly_codes: HashSet<String>,
    /// Set on the tick that enters Down; the failover trigger waits one
    /// full tick so the down state is observable before any action.
    defer_failover: bool,
    commands: mpsc::Receiver<MonitorCommand>,
    view_tx: watch::Sender<ClusterView>,
}

/// Sticky event markers that outlive a single tick's anomaly set; they
/// de-duplicate recurring condition events, not topology anomalies.
const STICKY_MARKERS: &[&str] = &["ERR00085", "ERR00012", "ERR00002"];

impl ClusterMonitor {
    pub fn new(
        config: ClusterConfig,
        driver_factory: Arc<dyn NodeDriverFactory>,
        proxy_drivers: Vec<Arc<dyn ProxyDriver>>,
        events: Arc<EventRing>,
        metrics: Arc<MonitorMetrics>,
        arbitration: Arc<SharedArbitrationState>,
        arbitrator: Option<Arc<dyn Arbitrator>>,
    ) -> VigilResult<(Self, MonitorHandle)> {
        let status = ClusterStatus::new(&config.name);
        let mut nodes = BTreeMap::new();
        let mut drivers = BTreeMap::new();
        for host in &config.hosts {
            let (host_name, port) = host
                .rsplit_once(':')
                .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h, p)))
                .ok_or_else(|| {
                    VigilError::configuration(format!(
                        "cluster {}: bad db-servers-hosts entry {host:?}",
                        config.name
                    ))
                })?;
            let id = NodeId::new(&config.name, host_name, port);
            let mut node = Node::new(id.clone());
            node.ignored = config.ignored_hosts.iter().any(|h| h == host);
            node.preferred_rank = config.prefered_master.iter().position(|h| h == host);
            drivers.insert(id.address(), driver_factory.driver_for(&id, &config.credential));
            nodes.insert(id.address(), node);
        }
        for ignored in &config.ignored_hosts {
            if !nodes.contains_key(ignored) {
                events.emit(
                    &config.name,
                    EventOrigin::Cluster,
                    Severity::Error,
                    "ERR00059",
                    ignored,
                );
            }
        }
        for preferred in &config.prefered_master {
            if !nodes.contains_key(preferred) {
                events.emit(
                    &config.name,
                    EventOrigin::Cluster,
                    Severity::Error,
                    "ERR00074",
                    preferred,
                );
            }
        }

        let proxies = ProxyController::new(&config.name, proxy_drivers);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (view_tx, view_rx) = watch::channel(ClusterView::from_status(&status, None));

        let monitor = Self {
            config: Arc::new(config),
            status,
            nodes,
            drivers,
            driver_factory,
            executor: Executor::new(),
            proxies,
            events,
            metrics,
            arbitration,
            arbitrator,
            last_snapshot: None,
            prev_anomaly_codes: HashSet::new(),
            defer_failover: false,
            commands: command_rx,
            view_tx,
        };
        let handle = MonitorHandle {
            commands: command_tx,
            view: view_rx,
        };
        Ok((monitor, handle))
    }

    pub fn status(&self) -> &ClusterStatus {
        &self.status
    }

    pub fn last_snapshot(&self) -> Option<&TopologySnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Drive the tick loop until stopped. Ticks are serialized here by
    /// construction; the interval skips, never queues, missed ticks.
    pub async fn run(mut self) {
        // Spread cluster ticks so a fleet of monitors does not probe in
        // lockstep.
        tokio::time::sleep(Duration::from_millis(fastrand::u64(0..250))).await;
        let mut interval = tokio::time::interval(self.config.monitoring_ticker);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(cluster = %self.config.name, "cluster monitor started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = tokio::time::Instant::now();
                    self.tick().await;
                    if started.elapsed() > self.config.monitoring_ticker {
                        self.metrics.record_tick_overflow();
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(MonitorCommand::UpdateConfig(config)) => {
                            info!(cluster = %self.config.name, "configuration swap received");
                            self.apply_config(*config);
                            interval = tokio::time::interval(self.config.monitoring_ticker);
                            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                        }
                        Some(MonitorCommand::Switchover { target }) => {
                            self.status.pending_switchover = Some(target);
                        }
                        Some(MonitorCommand::SetMaintenance { node }) => {
                            self.set_node_maintenance(&node).await;
                        }
                        Some(MonitorCommand::Pause) => {
                            self.status.transition(ClusterState::Paused);
                        }
                        Some(MonitorCommand::Resume) => {
                            if self.status.state == ClusterState::Paused {
                                let prev = self.status.prev_state;
                                self.status.transition(prev);
                            }
                        }
                        Some(MonitorCommand::Stop) | None => break,
                    }
                }
            }
        }
        info!(cluster = %self.config.name, "cluster monitor stopped");
    }

    /// One observation/decision/action round.
    pub async fn tick(&mut self) {
        self.metrics.record_tick();
        let config = Arc::clone(&self.config);

        self.probe_all(&config).await;

        // Paused inhibits everything but probing.
        if self.status.state == ClusterState::Paused {
            self.publish_view();
            return;
        }

        let snapshot = build_snapshot(
            &config,
            &mut self.nodes,
            self.status.last_known_primary.as_ref(),
        );
        self.emit_new_anomalies(&snapshot);

        self.status.current_primary = snapshot.primary.clone();
        if let Some(primary) = &snapshot.primary {
            self.status.last_known_primary = Some(primary.clone());
            self.prev_anomaly_codes.remove("ERR00012");
        }
        if self.status.state != ClusterState::Down {
            self.prev_anomaly_codes.remove("ERR00002");
        }

        self.apply_split_brain_flag();
        self.advance_state(&config, &snapshot).await;
        let promoted = self.evaluate_triggers(&config, &snapshot).await;

        // Proxies converge on whatever the tick concluded. On a tick that
        // promoted a new primary the executor already drove them; this
        // snapshot predates the promotion and must not be replayed.
        if !promoted {
            let backends = BackendSet::from_snapshot(&snapshot, &config);
            if backends.writer.is_some() && backends.readers.is_empty() {
                if !self.prev_anomaly_codes.contains("ERR00085") {
                    self.events.emit(
                        &config.name,
                        EventOrigin::Cluster,
                        Severity::Warn,
                        "ERR00085",
                        "",
                    );
                }
                self.prev_anomaly_codes.insert("ERR00085".to_string());
            } else {
                self.prev_anomaly_codes.remove("ERR00085");
            }
            self.proxies
                .refresh_all(&backends, &config, self.events.as_ref())
                .await;
        }

        self.last_snapshot = Some(snapshot);
        self.publish_view();
    }

    /// Bounded-concurrency probe fan-out; every probe carries the tick
    /// deadline. Errors are folded into node fail counts.
    async fn probe_all(&mut self, config: &ClusterConfig) {
        let deadline = config.probe_deadline();
        let semaphore = Arc::new(Semaphore::new(PROBE_CONCURRENCY));
        let mut join_set: JoinSet<(String, VigilResult<ProbeReport>)> = JoinSet::new();

        for (address, driver) in &self.drivers {
            let address = address.clone();
            let driver = Arc::clone(driver);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                // The semaphore is never closed; a failed acquire only
                // means shutdown, where the probe result is moot.
                let _permit = semaphore.acquire().await.ok();
                let result = match tokio::time::timeout(deadline, driver.probe()).await {
                    Ok(result) => result,
                    Err(_) => Err(VigilError::timeout(format!("probe {address}"))),
                };
                (address, result)
            });
        }

        let now = Utc::now();
        while let Some(joined) = join_set.join_next().await {
            let (address, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    warn!("probe task panicked: {e}");
                    continue;
                }
            };
            let Some(node) = self.nodes.get_mut(&address) else {
                continue;
            };
            match result {
                Ok(report) => node.apply_probe(report, now),
                Err(e) => {
                    debug!("probe miss on {address}: {e}");
                    self.metrics.record_probe_error();
                    node.apply_probe_failure(config.max_fail);
                }
            }
        }
    }

    /// Emit anomaly events on rising edge only; steady anomalies stay in
    /// the snapshot without re-flooding the ring.
    fn emit_new_anomalies(&mut self, snapshot: &TopologySnapshot) {
        let mut current: HashSet<String> = self
            .prev_anomaly_codes
            .iter()
            .filter(|code| STICKY_MARKERS.contains(&code.as_str()))
            .cloned()
            .collect();
        for anomaly in &snapshot.anomalies {
            let code = anomaly.code().to_string();
            if !self.prev_anomaly_codes.contains(&code) {
                self.events.emit(
                    &snapshot.cluster,
                    EventOrigin::Cluster,
                    Severity::Warn,
                    &code,
                    format!("{anomaly:?}"),
                );
            }
            current.insert(code);
        }
        self.prev_anomaly_codes = current;
    }

    fn apply_split_brain_flag(&mut self) {
        let split = self.arbitration.is_split_brain();
        self.status.is_split_brain = split;
        if split && self.status.state != ClusterState::SplitBrain {
            self.events.emit(
                &self.status.name,
                EventOrigin::Cluster,
                Severity::Warn,
                "WARN0079",
                "",
            );
            self.status.transition(ClusterState::SplitBrain);
        } else if !split && self.status.state == ClusterState::SplitBrain {
            let prev = self.status.prev_state;
            self.status.transition(prev);
        }
    }

    async fn advance_state(&mut self, config: &ClusterConfig, snapshot: &TopologySnapshot) {
        match self.status.state {
            ClusterState::Starting => {
                if snapshot.primary.is_some() && !snapshot.healthy_replicas().is_empty() {
                    self.status.transition(ClusterState::RunningOk);
                } else if snapshot.primary.is_none()
                    && !self.prev_anomaly_codes.contains("ERR00012")
                {
                    self.events.emit(
                        &snapshot.cluster,
                        EventOrigin::Cluster,
                        Severity::Error,
                        "ERR00012",
                        "",
                    );
                    self.prev_anomaly_codes.insert("ERR00012".to_string());
                }
            }
            ClusterState::RunningOk | ClusterState::Degraded => {
                if self.primary_is_down(config, snapshot) {
                    self.events.emit(
                        &snapshot.cluster,
                        EventOrigin::Cluster,
                        Severity::Warn,
                        "WARN0023",
                        "",
                    );
                    self.events.emit(
                        &snapshot.cluster,
                        EventOrigin::Cluster,
                        Severity::Error,
                        "ERR00021",
                        "",
                    );
                    self.status.transition(ClusterState::Down);
                    self.defer_failover = true;
                } else if snapshot.primary.is_some() {
                    let reasons = degraded_reasons(snapshot, config);
                    let next = if reasons.is_empty() {
                        ClusterState::RunningOk
                    } else {
                        ClusterState::Degraded
                    };
                    self.status.transition(next);
                }
            }
            ClusterState::Down => {
                // A primary reappearing (rejoined ex-primary or operator
                // repair) takes the cluster out of down without election.
                if snapshot.primary.is_some() {
                    self.status.transition(ClusterState::Degraded);
                }
            }
            // Transient and operator-driven states resolve elsewhere.
            ClusterState::FailingOver
            | ClusterState::SwitchingOver
            | ClusterState::Rejoining
            | ClusterState::Paused
            | ClusterState::SplitBrain => {}
        }
    }

    fn primary_is_down(&self, config: &ClusterConfig, snapshot: &TopologySnapshot) -> bool {
        let Some(primary) = self.status.last_known_primary.clone() else {
            return false;
        };
        let Some(node) = snapshot.nodes.get(&primary.address()) else {
            return false;
        };
        let threshold = config.max_fail.max(config.failover_falsepositive_ping_counter);
        node.role == NodeRole::Failed
            && node.fail_count >= threshold
            && primary_confirmed_down(snapshot, &primary)
            && !self.arbitration.is_split_brain()
    }

    /// Returns true when a promotion ran this tick (the executor already
    /// reconfigured the proxies against the post-promotion topology).
    async fn evaluate_triggers(
        &mut self,
        config: &ClusterConfig,
        snapshot: &TopologySnapshot,
    ) -> bool {
        if self.status.state.inhibits_actions() {
            return false;
        }

        // Operator switchover first; it only runs from healthy states.
        if let Some(target) = self.status.pending_switchover.take() {
            if self.status.state.allows_switchover() {
                let mut status = self.status.clone();
                let mut ctx = ExecutorContext {
                    config,
                    drivers: &self.drivers,
                    proxies: &mut self.proxies,
                    events: self.events.as_ref(),
                    metrics: self.metrics.as_ref(),
                };
                let result = self
                    .executor
                    .switchover(&mut ctx, &mut status, snapshot, target)
                    .await;
                self.status = status;
                return match result {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(cluster = %config.name, "switchover failed: {e}");
                        false
                    }
                };
            }
            self.events.emit(
                &config.name,
                EventOrigin::Cluster,
                Severity::Error,
                "ERR00022",
                format!("switchover refused in state {}", self.status.state),
            );
            return false;
        }

        if self.status.state == ClusterState::Down {
            // The down state stays observable for one full tick before
            // any promotion starts.
            if std::mem::take(&mut self.defer_failover) {
                return false;
            }
            if config.failover_mode == FailoverMode::Manual {
                if !self.prev_anomaly_codes.contains("ERR00002") {
                    self.events.emit(
                        &config.name,
                        EventOrigin::Cluster,
                        Severity::Warn,
                        "ERR00002",
                        "",
                    );
                    self.prev_anomaly_codes.insert("ERR00002".to_string());
                }
                return false;
            }
            let checks = self.gather_checks(config).await;
            let mut status = self.status.clone();
            let mut ctx = ExecutorContext {
                config,
                drivers: &self.drivers,
                proxies: &mut self.proxies,
                events: self.events.as_ref(),
                metrics: self.metrics.as_ref(),
            };
            let result = self.executor.failover(&mut ctx, &mut status, snapshot, &checks).await;
            self.status = status;
            return match result {
                Ok(report) => {
                    info!(
                        cluster = %config.name,
                        "failover promoted {} in {:?}",
                        report.new_primary,
                        report.duration
                    );
                    true
                }
                Err(e) => {
                    debug!(cluster = %config.name, "failover not executed: {e}");
                    false
                }
            };
        }

        // Rejoin: reachable standalones with no upstream while a primary
        // is up are former members wanting back in.
        if config.autorejoin
            && matches!(
                self.status.state,
                ClusterState::RunningOk | ClusterState::Degraded
            )
        {
            if let Some(primary) = snapshot.primary.clone() {
                let rejoinable: Vec<NodeId> = snapshot
                    .standalones
                    .iter()
                    .filter(|id| **id != primary)
                    .filter_map(|id| snapshot.node(id))
                    .filter(|n| {
                        n.fail_count == 0
                            && !n.rejoin_blocked
                            && n.last_probe
                                .as_ref()
                                .map(|r| r.upstream.is_none())
                                .unwrap_or(false)
                    })
                    .map(|n| n.id.clone())
                    .collect();
                if rejoinable.is_empty() {
                    return false;
                }
                let action_lock = self.executor.action_lock();
                let Ok(_guard) = action_lock.try_lock() else {
                    return false;
                };
                let primary_driver = match self.drivers.get(&primary.address()) {
                    Some(d) => Arc::clone(d),
                    None => return false,
                };
                self.status.transition(ClusterState::Rejoining);
                for id in rejoinable {
                    let Some(driver) = self.drivers.get(&id.address()).map(Arc::clone) else {
                        continue;
                    };
                    let Some(node) = self.nodes.get_mut(&id.address()) else {
                        continue;
                    };
                    let ctx = RejoinContext {
                        config,
                        events: self.events.as_ref(),
                        metrics: self.metrics.as_ref(),
                    };
                    if let Err(e) =
                        rejoin_node(&ctx, node, driver, &primary, Arc::clone(&primary_driver)).await
                    {
                        warn!(cluster = %config.name, "rejoin of {id} failed: {e}");
                    }
                }
                let prev = self.status.prev_state;
                self.status.transition(prev);
            }
        }
        false
    }

    /// Build the agreement inputs for a failover attempt.
    async fn gather_checks(&self, config: &ClusterConfig) -> FailoverChecks {
        let mut checks = FailoverChecks::default();
        if !config.arbitration || config.arbitration_peer_hosts.is_empty() {
            return checks;
        }
        if self.arbitration.is_split_brain() {
            checks.arbitration = ArbitrationVerdict::Lose;
            return checks;
        }
        if self.arbitration.peers_unreachable() {
            let verdict = match &self.arbitrator {
                Some(arbitrator) => {
                    let view = ClusterView::from_status(&self.status, self.last_snapshot.as_ref());
                    let heartbeat = view.heartbeat(
                        config.arbitration_external_secret.as_deref().unwrap_or(""),
                        config.arbitration_external_unique_id,
                        self.arbitration.is_standby(),
                    );
                    arbitrator.arbitrate(&config.name, &heartbeat).await
                }
                None => {
                    self.events.emit(
                        &config.name,
                        EventOrigin::Cluster,
                        Severity::Warn,
                        "WARN0090",
                        "no arbitrator configured",
                    );
                    ArbitrationVerdict::Lose
                }
            };
            if verdict.is_win() {
                self.events.emit(
                    &config.name,
                    EventOrigin::Cluster,
                    Severity::Info,
                    "WARN0083",
                    "",
                );
            } else {
                self.metrics.record_arbitration_loss();
            }
            checks.arbitration = verdict;
        }
        checks
    }

    fn publish_view(&self) {
        let view = ClusterView::from_status(&self.status, self.last_snapshot.as_ref());
        let _ = self.view_tx.send(view);
    }

    /// Whole-object config swap: node and driver tables follow the new
    /// host list; surviving nodes keep their observed state.
    fn apply_config(&mut self, config: ClusterConfig) {
        let mut nodes = BTreeMap::new();
        let mut drivers = BTreeMap::new();
        for host in &config.hosts {
            let Some((host_name, port)) = host
                .rsplit_once(':')
                .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h, p)))
            else {
                warn!(cluster = %config.name, "ignoring bad host entry {host:?} in config swap");
                continue;
            };
            let id = NodeId::new(&config.name, host_name, port);
            let address = id.address();
            let mut node = self
                .nodes
                .remove(&address)
                .unwrap_or_else(|| Node::new(id.clone()));
            node.ignored = config.ignored_hosts.iter().any(|h| h == host);
            node.preferred_rank = config.prefered_master.iter().position(|h| h == host);
            let driver = self
                .drivers
                .remove(&address)
                .unwrap_or_else(|| self.driver_factory.driver_for(&id, &config.credential));
            nodes.insert(address.clone(), node);
            drivers.insert(address, driver);
        }
        self.nodes = nodes;
        self.drivers = drivers;
        self.config = Arc::new(config);
    }

    /// Proxy maintenance passthrough for the operator surface.
    pub async fn set_node_maintenance(&mut self, node: &NodeId) {
        if let Some(record) = self.nodes.get_mut(&node.address()) {
            record.in_maintenance = true;
        }
        self.proxies.set_maintenance(node, self.events.as_ref()).await;
    }
}
