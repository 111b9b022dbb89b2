//! Failover and switchover execution.
//!
//! The executor owns the per-cluster action lock: no two plans run
//! concurrently for one cluster, and the monitor's mutating paths wait on
//! the same lock. Every plan step is bounded by a timeout; an aborted plan
//! leaves the cluster in a consistent state and always emits a terminal
//! event. Refused preconditions never touch the failover counter.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::arbitration::ArbitrationVerdict;
use crate::cluster::{ClusterState, ClusterStatus};
use crate::config::{ClusterConfig, FailoverMode};
use crate::driver::NodeDriver;
use crate::election::{run_election, ElectionKind};
use crate::events::{EventOrigin, EventRing, Severity};
use crate::exception::{VigilError, VigilResult};
use crate::gtid::{BinlogPos, ReplicationCoord};
use crate::metrics::MonitorMetrics;
use crate::node::NodeId;
use crate::proxy::{BackendSet, ProxyController};
use crate::topology::TopologySnapshot;

/// Agreement inputs gathered by the monitor before a failover may start.
#[derive(Debug, Clone)]
pub struct FailoverChecks {
    /// External API view of the primary; `None` when not configured.
    pub external_api_sees_primary: Option<bool>,
    /// Proxy-side view of the primary; `None` when not configured.
    pub proxies_see_primary: Option<bool>,
    pub arbitration: ArbitrationVerdict,
}

impl Default for FailoverChecks {
    fn default() -> Self {
        Self {
            external_api_sees_primary: None,
            proxies_see_primary: None,
            arbitration: ArbitrationVerdict::Win,
        }
    }
}

/// Outcome of a completed plan.
#[derive(Debug, Clone)]
pub struct FailoverReport {
    pub kind: ElectionKind,
    pub new_primary: NodeId,
    pub old_primary: Option<NodeId>,
    pub repointed: Vec<NodeId>,
    /// Replicas that could not be repointed; left for the rejoin path.
    pub failed_rejoin: Vec<NodeId>,
    pub duration: Duration,
}

/// Everything a plan needs besides the cluster's mutable status.
pub struct ExecutorContext<'a> {
    pub config: &'a ClusterConfig,
    pub drivers: &'a BTreeMap<String, Arc<dyn NodeDriver>>,
    pub proxies: &'a mut ProxyController,
    pub events: &'a EventRing,
    pub metrics: &'a MonitorMetrics,
}

impl<'a> ExecutorContext<'a> {
    fn driver(&self, id: &NodeId) -> VigilResult<Arc<dyn NodeDriver>> {
        self.drivers
            .get(&id.address())
            .cloned()
            .ok_or_else(|| VigilError::NodeNotFound {
                node_id: id.to_string(),
            })
    }
}

pub struct Executor {
    action_lock: Arc<Mutex<()>>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            action_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The per-cluster action lock, shared with the monitor's mutating
    /// paths.
    pub fn action_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.action_lock)
    }

    /// Validate every failover precondition. The first unmet one aborts
    /// with its stable code; the failover counter is untouched.
    pub fn check_preconditions(
        &self,
        config: &ClusterConfig,
        status: &mut ClusterStatus,
        snapshot: &TopologySnapshot,
        checks: &FailoverChecks,
    ) -> VigilResult<()> {
        let now = Utc::now();
        if status.state != ClusterState::Down {
            return Err(VigilError::precondition(
                "ERR00021",
                format!("cluster state is {}", status.state),
            ));
        }
        if config.failover_mode == FailoverMode::Manual {
            return Err(VigilError::precondition(
                "ERR00002",
                "failover-mode is manual",
            ));
        }
        if let Some(elapsed) = status.seconds_since_last_failover(now) {
            let required = config.time_between_failovers.as_secs() as i64;
            if elapsed < required {
                return Err(VigilError::precondition(
                    "ERR00029",
                    format!("{elapsed}s since last failover, minimum {required}s"),
                ));
            }
        }
        let in_window = status.failovers_in_window(config, now);
        if in_window >= config.failover_limit {
            return Err(VigilError::precondition(
                "ERR00027",
                format!("{in_window} failovers in window, limit {}", config.failover_limit),
            ));
        }
        if checks.external_api_sees_primary == Some(true) {
            return Err(VigilError::precondition(
                "ERR00031",
                "external check still reaches the master",
            ));
        }
        if checks.proxies_see_primary == Some(true) {
            return Err(VigilError::precondition(
                "ERR00030",
                "a proxy still reaches the master",
            ));
        }
        if !checks.arbitration.is_win() {
            return Err(VigilError::precondition("ERR00068", "arbitration lost"));
        }
        if let Some(primary) = &status.last_known_primary {
            let stalled_witness = snapshot
                .replicas
                .iter()
                .chain(snapshot.relays.iter())
                .filter_map(|id| snapshot.node(id))
                .any(|node| {
                    node.last_probe
                        .as_ref()
                        .and_then(|r| r.upstream.as_ref())
                        .map(|u| u.address() == primary.address())
                        .unwrap_or(false)
                        && node.heartbeats_stalled
                });
            if !stalled_witness {
                return Err(VigilError::precondition(
                    "ERR00028",
                    "no replica reports heartbeat progression stop",
                ));
            }
        }
        Ok(())
    }

    /// Unplanned promotion after primary failure.
    pub async fn failover(
        &self,
        ctx: &mut ExecutorContext<'_>,
        status: &mut ClusterStatus,
        snapshot: &TopologySnapshot,
        checks: &FailoverChecks,
    ) -> VigilResult<FailoverReport> {
        let guard = self.action_lock.try_lock().map_err(|_| {
            VigilError::internal("another executor run holds the action lock")
        })?;
        let started = Instant::now();

        if let Err(e) = self.check_preconditions(ctx.config, status, snapshot, checks) {
            if let VigilError::PreconditionUnmet { code, reason } = &e {
                ctx.events.emit(
                    &status.name,
                    EventOrigin::Cluster,
                    Severity::Error,
                    code,
                    reason.clone(),
                );
            }
            return Err(e);
        }

        status.transition(ClusterState::FailingOver);
        let old_primary = status.last_known_primary.clone();
        info!(cluster = %status.name, "starting failover, old primary {:?}", old_primary);

        let outcome = run_election(snapshot, ctx.config, ElectionKind::Failover, ctx.events);
        let successor = match outcome.winner() {
            Some(id) => id.clone(),
            None => {
                status.transition(ClusterState::Down);
                return Err(VigilError::NoCandidates);
            }
        };
        status.candidate = Some(successor.clone());

        run_hook(ctx.config.failover_pre_script.as_deref(), &status.name, "pre-failover").await;

        let result = self
            .promote_and_repoint(ctx, snapshot, &successor, old_primary.as_ref())
            .await;

        let report = match result {
            Ok((repointed, failed_rejoin)) => FailoverReport {
                kind: ElectionKind::Failover,
                new_primary: successor.clone(),
                old_primary: old_primary.clone(),
                repointed,
                failed_rejoin,
                duration: started.elapsed(),
            },
            Err(e) => {
                status.candidate = None;
                status.transition(ClusterState::Down);
                ctx.events.emit(
                    &status.name,
                    EventOrigin::Cluster,
                    Severity::Error,
                    "ERR00021",
                    format!("failover aborted: {e}"),
                );
                return Err(e);
            }
        };

        let backends = BackendSet {
            writer: Some(successor.clone()),
            readers: report.repointed.clone(),
        };
        ctx.proxies.failover_all(&backends, ctx.events).await;

        run_hook(ctx.config.failover_post_script.as_deref(), &status.name, "post-failover").await;

        status.record_failover(Utc::now());
        status.current_primary = Some(successor.clone());
        status.last_known_primary = Some(successor.clone());
        status.candidate = None;
        ctx.metrics.record_failover();
        let next_state = if report.failed_rejoin.is_empty() {
            ClusterState::RunningOk
        } else {
            ClusterState::Degraded
        };
        status.transition(next_state);
        ctx.events.push(crate::events::Event::new(
            &status.name,
            EventOrigin::Node(successor.address()),
            Severity::Info,
            "INFO0001",
            format!(
                "failover complete: new primary {} after {:?}, {} replicas repointed",
                successor,
                report.duration,
                report.repointed.len()
            ),
        ));
        drop(guard);
        Ok(report)
    }

    /// Planned, coordinated primary change with quiescence. `target`
    /// pins the successor; otherwise the election ranking decides.
    pub async fn switchover(
        &self,
        ctx: &mut ExecutorContext<'_>,
        status: &mut ClusterStatus,
        snapshot: &TopologySnapshot,
        target: Option<NodeId>,
    ) -> VigilResult<FailoverReport> {
        let guard = self.action_lock.try_lock().map_err(|_| {
            VigilError::internal("another executor run holds the action lock")
        })?;
        let started = Instant::now();

        if !status.state.allows_switchover() {
            let code = if status.state == ClusterState::Down {
                "ERR00021"
            } else {
                "ERR00022"
            };
            let err = VigilError::precondition(code, format!("cluster state is {}", status.state));
            ctx.events.emit(
                &status.name,
                EventOrigin::Cluster,
                Severity::Error,
                code,
                format!("switchover refused in state {}", status.state),
            );
            return Err(err);
        }
        let old_primary = match snapshot.primary.clone() {
            Some(id) => id,
            None => {
                ctx.events.emit(
                    &status.name,
                    EventOrigin::Cluster,
                    Severity::Error,
                    "ERR00012",
                    "",
                );
                return Err(VigilError::precondition("ERR00012", "no primary to demote"));
            }
        };

        status.transition(ClusterState::SwitchingOver);
        info!(cluster = %status.name, "starting switchover away from {old_primary}");
        let old_driver = ctx.driver(&old_primary)?;

        // Quiesce the primary before any election: read-only, kill what
        // lingers, then block writes until open transactions drain.
        let quiesce = async {
            old_driver.demote().await.map_err(|e| {
                VigilError::plan_step("demote-old-primary", e.to_string())
            })?;
            old_driver
                .kill_long_queries(ctx.config.switchover_wait_kill)
                .await
                .map_err(|e| VigilError::plan_step("kill-long-queries", e.to_string()))?;
            tokio::time::timeout(
                ctx.config.switchover_wait_trx,
                old_driver.flush_and_block_writes(),
            )
            .await
            .map_err(|_| VigilError::timeout("switchover-wait-trx"))?
            .map_err(|e| VigilError::plan_step("flush-and-block-writes", e.to_string()))
        };
        if let Err(e) = quiesce.await {
            return self
                .abort_switchover(ctx, status, &old_driver, e)
                .await;
        }

        let outcome = run_election(snapshot, ctx.config, ElectionKind::Switchover, ctx.events);
        let successor = match target {
            Some(requested) => {
                if outcome.candidates.contains(&requested) {
                    requested
                } else {
                    let err = VigilError::precondition(
                        "ERR00074",
                        format!("requested successor {requested} is not electable"),
                    );
                    ctx.events.emit(
                        &status.name,
                        EventOrigin::Node(requested.address()),
                        Severity::Error,
                        "ERR00074",
                        requested.to_string(),
                    );
                    return self.abort_switchover(ctx, status, &old_driver, err).await;
                }
            }
            None => match outcome.winner() {
                Some(id) => id.clone(),
                None => {
                    return self
                        .abort_switchover(ctx, status, &old_driver, VigilError::NoCandidates)
                        .await;
                }
            },
        };
        status.candidate = Some(successor.clone());

        // Candidate must reach the (now frozen) primary position before
        // the roles swap.
        let successor_driver = ctx.driver(&successor)?;
        let sync_wait = if ctx.config.switchover_at_equal_gtid {
            let target_gtid = old_driver
                .gtid_set()
                .await
                .map_err(|e| VigilError::plan_step("read-primary-gtid", e.to_string()))?;
            wait_for_gtid_equal(
                successor_driver.clone(),
                target_gtid,
                ctx.config.switchover_wait_write_query,
            )
            .await
        } else {
            let target = (
                match old_driver.gtid_set().await {
                    Ok(g) => g.weight(),
                    Err(_) => 0,
                },
                old_driver
                    .position()
                    .await
                    .map_err(|e| VigilError::plan_step("read-primary-position", e.to_string()))?,
            );
            wait_for_progress(
                successor_driver.clone(),
                target,
                ctx.config.switchover_wait_write_query,
            )
            .await
        };
        if let Err(e) = sync_wait {
            status.candidate = None;
            return self.abort_switchover(ctx, status, &old_driver, e).await;
        }

        let (mut repointed, failed_rejoin) = match self
            .promote_and_repoint(ctx, snapshot, &successor, Some(&old_primary))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                status.candidate = None;
                return self.abort_switchover(ctx, status, &old_driver, e).await;
            }
        };

        // The demoted primary rejoins as a replica of the successor.
        let coord = replication_coord(&successor_driver).await?;
        let rejoin_old = async {
            old_driver.stop_replication().await?;
            old_driver.set_replication_source(&successor, &coord).await?;
            old_driver.start_replication().await
        };
        match rejoin_old.await {
            Ok(()) => repointed.push(old_primary.clone()),
            Err(e) => {
                warn!(cluster = %status.name, "old primary {old_primary} failed to rejoin: {e}");
                ctx.events.emit(
                    &status.name,
                    EventOrigin::Node(old_primary.address()),
                    Severity::Warn,
                    "ERR00049",
                    old_primary.address(),
                );
            }
        }

        let backends = BackendSet {
            writer: Some(successor.clone()),
            readers: repointed.clone(),
        };
        ctx.proxies.failover_all(&backends, ctx.events).await;

        status.current_primary = Some(successor.clone());
        status.last_known_primary = Some(successor.clone());
        status.candidate = None;
        ctx.metrics.record_switchover();
        let next_state = if failed_rejoin.is_empty() {
            ClusterState::RunningOk
        } else {
            ClusterState::Degraded
        };
        status.transition(next_state);
        ctx.events.push(crate::events::Event::new(
            &status.name,
            EventOrigin::Node(successor.address()),
            Severity::Info,
            "INFO0002",
            format!("switchover complete: new primary {successor}, old primary {old_primary} rejoined"),
        ));
        drop(guard);
        Ok(FailoverReport {
            kind: ElectionKind::Switchover,
            new_primary: successor,
            old_primary: Some(old_primary),
            repointed,
            failed_rejoin,
            duration: started.elapsed(),
        })
    }

    /// Promote `successor` and repoint every other replica at it. Returns
    /// (repointed, failed_rejoin).
    async fn promote_and_repoint(
        &self,
        ctx: &mut ExecutorContext<'_>,
        snapshot: &TopologySnapshot,
        successor: &NodeId,
        old_primary: Option<&NodeId>,
    ) -> VigilResult<(Vec<NodeId>, Vec<NodeId>)> {
        let successor_driver = ctx.driver(successor)?;

        // Let the successor drain its relay log up to the furthest
        // progress any replica observed.
        let target = furthest_progress(snapshot);
        wait_for_progress(
            successor_driver.clone(),
            target,
            ctx.config.wait_apply_timeout,
        )
        .await?;

        successor_driver
            .promote()
            .await
            .map_err(|e| VigilError::plan_step("promote", e.to_string()))?;
        let coord = replication_coord(&successor_driver).await?;
        debug!("promoted {successor}, new coordinates {coord:?}");

        let mut repointed = Vec::new();
        let mut failed_rejoin = Vec::new();
        for id in snapshot.replicas.iter().chain(snapshot.relays.iter()) {
            if id == successor || Some(id) == old_primary {
                continue;
            }
            let driver = match ctx.driver(id) {
                Ok(d) => d,
                Err(_) => {
                    failed_rejoin.push(id.clone());
                    continue;
                }
            };
            let repoint = async {
                driver.stop_replication().await?;
                driver.set_replication_source(successor, &coord).await?;
                driver.start_replication().await
            };
            match repoint.await {
                Ok(()) => repointed.push(id.clone()),
                Err(e) => {
                    warn!("replica {id} failed to repoint: {e}");
                    ctx.events.emit(
                        &snapshot.cluster,
                        EventOrigin::Node(id.address()),
                        Severity::Warn,
                        "ERR00056",
                        format!("{}: {e}", id.address()),
                    );
                    failed_rejoin.push(id.clone());
                }
            }
        }

        Ok((repointed, failed_rejoin))
    }

    /// Restore the demoted primary to writable and surface the terminal
    /// event; the successor was not promoted when this path runs.
    async fn abort_switchover(
        &self,
        ctx: &mut ExecutorContext<'_>,
        status: &mut ClusterStatus,
        old_driver: &Arc<dyn NodeDriver>,
        error: VigilError,
    ) -> VigilResult<FailoverReport> {
        if let Err(e) = old_driver.promote().await {
            warn!(cluster = %status.name, "could not restore old primary writable: {e}");
        }
        let prev = status.prev_state;
        status.transition(prev);
        ctx.events.emit(
            &status.name,
            EventOrigin::Cluster,
            Severity::Error,
            "ERR00022",
            format!("switchover aborted: {error}"),
        );
        Err(error)
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

/// Best known coordinates of the successor for repointing others.
async fn replication_coord(driver: &Arc<dyn NodeDriver>) -> VigilResult<ReplicationCoord> {
    let gtid = driver
        .gtid_set()
        .await
        .map_err(|e| VigilError::plan_step("read-successor-gtid", e.to_string()))?;
    if !gtid.is_empty() {
        return Ok(ReplicationCoord::GtidAutoPosition(gtid));
    }
    let position = driver
        .position()
        .await
        .map_err(|e| VigilError::plan_step("read-successor-position", e.to_string()))?;
    Ok(ReplicationCoord::Positional(position))
}

/// Furthest progress observed across the replica pool.
fn furthest_progress(snapshot: &TopologySnapshot) -> (u64, BinlogPos) {
    snapshot
        .replicas
        .iter()
        .chain(snapshot.relays.iter())
        .filter_map(|id| snapshot.node(id))
        .filter_map(|n| n.last_probe.as_ref())
        .map(|r| (r.gtid.weight(), r.position.clone()))
        .max()
        .unwrap_or((0, BinlogPos::new("", 0)))
}

async fn wait_for_progress(
    driver: Arc<dyn NodeDriver>,
    target: (u64, BinlogPos),
    deadline: Duration,
) -> VigilResult<()> {
    tokio::time::timeout(deadline, async {
        loop {
            let gtid = driver.gtid_set().await?;
            let position = driver.position().await?;
            if (gtid.weight(), position) >= target {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .map_err(|_| VigilError::timeout("wait-apply"))?
}

async fn wait_for_gtid_equal(
    driver: Arc<dyn NodeDriver>,
    target: crate::gtid::GtidSet,
    deadline: Duration,
) -> VigilResult<()> {
    tokio::time::timeout(deadline, async {
        loop {
            let gtid = driver.gtid_set().await?;
            if gtid == target {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .map_err(|_| VigilError::timeout("switchover-at-equal-gtid"))?
}

/// External hook commands configured as pre/post scripts. Failures are
/// logged, never fatal to the plan.
async fn run_hook(script: Option<&str>, cluster: &str, stage: &str) {
    let Some(script) = script else { return };
    let result = tokio::time::timeout(
        Duration::from_secs(60),
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .arg(stage)
            .arg(cluster)
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            debug!(cluster, stage, "hook script succeeded");
        }
        Ok(Ok(output)) => {
            warn!(cluster, stage, code = ?output.status.code(), "hook script failed");
        }
        Ok(Err(e)) => warn!(cluster, stage, "hook script could not run: {e}"),
        Err(_) => warn!(cluster, stage, "hook script timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scripted::ScriptedFleet;
    use crate::driver::NodeDriverFactory;
    use crate::node::{Node, NodeId};
    use crate::proxy::scripted::ScriptedProxy;
    use crate::topology::build_snapshot;

    fn id(host: &str) -> NodeId {
        NodeId::new("c1", host, 3306)
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            name: "c1".to_string(),
            hosts: vec!["db1:3306".into(), "db2:3306".into(), "db3:3306".into()],
            failover_mode: FailoverMode::Automatic,
            failover_max_slave_delay: 10,
            wait_apply_timeout: Duration::from_secs(2),
            switchover_wait_write_query: Duration::from_secs(2),
            ..ClusterConfig::default()
        }
    }

    struct Rig {
        fleet: ScriptedFleet,
        drivers: BTreeMap<String, Arc<dyn NodeDriver>>,
        nodes: BTreeMap<String, Node>,
        status: ClusterStatus,
        events: EventRing,
        metrics: MonitorMetrics,
        proxy: ScriptedProxy,
        proxies: ProxyController,
    }

    /// Primary db1 with replicas db2 (lag 0) and db3 (lag 5), observed
    /// healthy once, then the primary goes dark for `max_fail` ticks.
    fn rig_with_dead_primary(config: &ClusterConfig) -> Rig {
        let fleet = ScriptedFleet::new();
        fleet.add_primary(id("db1"), 101, "0-101-500", BinlogPos::new("bin.000010", 500));
        fleet.add_replica(
            id("db2"),
            102,
            id("db1"),
            "0-101-500",
            BinlogPos::new("bin.000010", 500),
        );
        let db3 = fleet.add_replica(
            id("db3"),
            103,
            id("db1"),
            "0-101-495",
            BinlogPos::new("bin.000010", 450),
        );
        db3.update_report(|r| r.lag_seconds = Some(5));

        let mut nodes: BTreeMap<String, Node> = ["db1", "db2", "db3"]
            .iter()
            .map(|h| (format!("{h}:3306"), Node::new(id(h))))
            .collect();

        // First healthy round.
        for (address, node) in nodes.iter_mut() {
            let driver = fleet.node(address).unwrap();
            node.apply_probe(driver.report(), Utc::now());
        }
        build_snapshot(config, &mut nodes, None);

        // Primary dies; replicas stop receiving heartbeats.
        fleet.node("db1:3306").unwrap().set_reachable(false);
        for _ in 0..config.max_fail {
            nodes.get_mut("db1:3306").unwrap().apply_probe_failure(config.max_fail);
        }
        for address in ["db2:3306", "db3:3306"] {
            let report = fleet.node(address).unwrap().report();
            nodes.get_mut(address).unwrap().apply_probe(report.clone(), Utc::now());
            // Same heartbeat counter again: stalled.
            nodes.get_mut(address).unwrap().apply_probe(report, Utc::now());
        }

        let drivers: BTreeMap<String, Arc<dyn NodeDriver>> = ["db1", "db2", "db3"]
            .iter()
            .map(|h| {
                let node_id = id(h);
                (node_id.address(), fleet.driver_for(&node_id, ""))
            })
            .collect();

        let mut status = ClusterStatus::new("c1");
        status.last_known_primary = Some(id("db1"));
        status.transition(ClusterState::RunningOk);
        status.transition(ClusterState::Down);

        let proxy = ScriptedProxy::new("px1");
        let proxies = ProxyController::new("c1", vec![Arc::new(proxy.clone())]);

        Rig {
            fleet,
            drivers,
            nodes,
            status,
            events: EventRing::new(64),
            metrics: MonitorMetrics::new(),
            proxy,
            proxies,
        }
    }

    #[tokio::test]
    async fn clean_automatic_failover() {
        let config = config();
        let mut rig = rig_with_dead_primary(&config);
        let snapshot = build_snapshot(&config, &mut rig.nodes, Some(&id("db1")));

        let executor = Executor::new();
        let mut ctx = ExecutorContext {
            config: &config,
            drivers: &rig.drivers,
            proxies: &mut rig.proxies,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let report = executor
            .failover(&mut ctx, &mut rig.status, &snapshot, &FailoverChecks::default())
            .await
            .unwrap();

        // db2 wins on lag; db3 repoints to it.
        assert_eq!(report.new_primary, id("db2"));
        assert_eq!(report.repointed, vec![id("db3")]);
        assert!(report.failed_rejoin.is_empty());
        assert_eq!(rig.status.failover_count, 1);
        assert_eq!(rig.status.state, ClusterState::RunningOk);
        assert_eq!(rig.status.current_primary, Some(id("db2")));

        let db2 = rig.fleet.node("db2:3306").unwrap();
        assert!(!db2.report().read_only);
        assert_eq!(db2.calls().promotes, 1);
        let db3 = rig.fleet.node("db3:3306").unwrap();
        assert_eq!(
            db3.report().upstream.map(|u| u.address()),
            Some("db2:3306".to_string())
        );
        assert_eq!(rig.proxy.failover_calls(), 1);
        assert_eq!(rig.metrics.snapshot().failovers, 1);
    }

    #[tokio::test]
    async fn refused_failover_does_not_touch_counter() {
        let mut config = config();
        config.failover_limit = 1;
        config.time_between_failovers = Duration::from_secs(60);
        let mut rig = rig_with_dead_primary(&config);
        // One failover already executed 10 seconds ago.
        rig.status
            .record_failover(Utc::now() - chrono::Duration::seconds(10));
        let snapshot = build_snapshot(&config, &mut rig.nodes, Some(&id("db1")));

        let executor = Executor::new();
        let mut ctx = ExecutorContext {
            config: &config,
            drivers: &rig.drivers,
            proxies: &mut rig.proxies,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let err = executor
            .failover(&mut ctx, &mut rig.status, &snapshot, &FailoverChecks::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            VigilError::PreconditionUnmet { code: "ERR00029", .. }
        ));
        assert_eq!(rig.status.failover_count, 1);
        assert_eq!(rig.status.state, ClusterState::Down);
        assert_eq!(rig.metrics.snapshot().failovers, 0);
        assert!(rig.events.snapshot().iter().any(|e| e.code == "ERR00029"));
    }

    #[tokio::test]
    async fn failover_count_limit_refusal() {
        let mut config = config();
        config.failover_limit = 1;
        let mut rig = rig_with_dead_primary(&config);
        // Past the time-between gate but still inside the count window.
        rig.status
            .record_failover(Utc::now() - chrono::Duration::seconds(100));
        let snapshot = build_snapshot(&config, &mut rig.nodes, Some(&id("db1")));

        let executor = Executor::new();
        let mut ctx = ExecutorContext {
            config: &config,
            drivers: &rig.drivers,
            proxies: &mut rig.proxies,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let err = executor
            .failover(&mut ctx, &mut rig.status, &snapshot, &FailoverChecks::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VigilError::PreconditionUnmet { code: "ERR00027", .. }
        ));
        assert_eq!(rig.metrics.snapshot().failovers, 0);
    }

    #[tokio::test]
    async fn arbitration_loss_refuses_failover() {
        let config = config();
        let mut rig = rig_with_dead_primary(&config);
        let snapshot = build_snapshot(&config, &mut rig.nodes, Some(&id("db1")));

        let executor = Executor::new();
        let mut ctx = ExecutorContext {
            config: &config,
            drivers: &rig.drivers,
            proxies: &mut rig.proxies,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let checks = FailoverChecks {
            arbitration: ArbitrationVerdict::Lose,
            ..FailoverChecks::default()
        };
        let err = executor
            .failover(&mut ctx, &mut rig.status, &snapshot, &checks)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VigilError::PreconditionUnmet { code: "ERR00068", .. }
        ));
        assert_eq!(rig.status.failover_count, 0);
    }

    #[tokio::test]
    async fn replica_still_hearing_primary_refuses_failover() {
        let config = config();
        let mut rig = rig_with_dead_primary(&config);
        // db2's heartbeat counter advances again: primary is still writing.
        let db2 = rig.fleet.node("db2:3306").unwrap();
        db2.advance_heartbeats(1);
        rig.nodes
            .get_mut("db2:3306")
            .unwrap()
            .apply_probe(db2.report(), Utc::now());
        let db3 = rig.fleet.node("db3:3306").unwrap();
        db3.advance_heartbeats(1);
        rig.nodes
            .get_mut("db3:3306")
            .unwrap()
            .apply_probe(db3.report(), Utc::now());
        let snapshot = build_snapshot(&config, &mut rig.nodes, Some(&id("db1")));

        let executor = Executor::new();
        let mut ctx = ExecutorContext {
            config: &config,
            drivers: &rig.drivers,
            proxies: &mut rig.proxies,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let err = executor
            .failover(&mut ctx, &mut rig.status, &snapshot, &FailoverChecks::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VigilError::PreconditionUnmet { code: "ERR00028", .. }
        ));
    }

    #[tokio::test]
    async fn action_lock_excludes_concurrent_runs() {
        let config = config();
        let mut rig = rig_with_dead_primary(&config);
        let snapshot = build_snapshot(&config, &mut rig.nodes, Some(&id("db1")));

        let executor = Executor::new();
        let lock = executor.action_lock();
        let _held = lock.try_lock().unwrap();

        let mut ctx = ExecutorContext {
            config: &config,
            drivers: &rig.drivers,
            proxies: &mut rig.proxies,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let err = executor
            .failover(&mut ctx, &mut rig.status, &snapshot, &FailoverChecks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::Internal(_)));
        assert_eq!(rig.status.failover_count, 0);
    }

    #[tokio::test]
    async fn failed_replica_repoint_is_degraded_not_fatal() {
        let config = config();
        let mut rig = rig_with_dead_primary(&config);
        rig.fleet
            .node("db3:3306")
            .unwrap()
            .fail_next_replication_start(true);
        let snapshot = build_snapshot(&config, &mut rig.nodes, Some(&id("db1")));

        let executor = Executor::new();
        let mut ctx = ExecutorContext {
            config: &config,
            drivers: &rig.drivers,
            proxies: &mut rig.proxies,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let report = executor
            .failover(&mut ctx, &mut rig.status, &snapshot, &FailoverChecks::default())
            .await
            .unwrap();
        assert_eq!(report.failed_rejoin, vec![id("db3")]);
        assert_eq!(rig.status.state, ClusterState::Degraded);
        assert!(rig.events.snapshot().iter().any(|e| e.code == "ERR00056"));
    }

    #[tokio::test]
    async fn switchover_with_equal_gtid_quiesce() {
        let mut config = config();
        config.switchover_at_equal_gtid = true;
        let fleet = ScriptedFleet::new();
        fleet.add_primary(id("db1"), 101, "0-101-500", BinlogPos::new("bin.000010", 500));
        let db2 = fleet.add_replica(
            id("db2"),
            102,
            id("db1"),
            "0-101-500",
            BinlogPos::new("bin.000010", 500),
        );
        fleet.add_replica(
            id("db3"),
            103,
            id("db1"),
            "0-101-495",
            BinlogPos::new("bin.000010", 450),
        );

        let mut nodes: BTreeMap<String, Node> = ["db1", "db2", "db3"]
            .iter()
            .map(|h| (format!("{h}:3306"), Node::new(id(h))))
            .collect();
        for (address, node) in nodes.iter_mut() {
            node.apply_probe(fleet.node(address).unwrap().report(), Utc::now());
        }
        let snapshot = build_snapshot(&config, &mut nodes, None);

        let drivers: BTreeMap<String, Arc<dyn NodeDriver>> = ["db1", "db2", "db3"]
            .iter()
            .map(|h| {
                let node_id = id(h);
                (node_id.address(), fleet.driver_for(&node_id, ""))
            })
            .collect();
        let mut status = ClusterStatus::new("c1");
        status.current_primary = Some(id("db1"));
        status.last_known_primary = Some(id("db1"));
        status.transition(ClusterState::RunningOk);

        let events = EventRing::new(64);
        let metrics = MonitorMetrics::new();
        let proxy = ScriptedProxy::new("px1");
        let mut proxies = ProxyController::new("c1", vec![Arc::new(proxy.clone())]);

        let executor = Executor::new();
        let mut ctx = ExecutorContext {
            config: &config,
            drivers: &drivers,
            proxies: &mut proxies,
            events: &events,
            metrics: &metrics,
        };
        let report = executor
            .switchover(&mut ctx, &mut status, &snapshot, None)
            .await
            .unwrap();

        assert_eq!(report.new_primary, id("db2"));
        // Old primary quiesced then rejoined as replica of db2.
        let db1 = fleet.node("db1:3306").unwrap();
        assert!(db1.calls().demotes >= 1);
        assert!(db1.calls().write_blocks >= 1);
        assert_eq!(
            db1.report().upstream.map(|u| u.address()),
            Some("db2:3306".to_string())
        );
        assert!(report.repointed.contains(&id("db1")));
        assert!(report.repointed.contains(&id("db3")));
        // Switchover does not consume the failover budget.
        assert_eq!(status.failover_count, 0);
        assert_eq!(status.state, ClusterState::RunningOk);
        assert!(!db2.report().read_only);
        assert_eq!(metrics.snapshot().switchovers, 1);
    }

    #[tokio::test]
    async fn switchover_refused_outside_running_states() {
        let config = config();
        let mut rig = rig_with_dead_primary(&config);
        let snapshot = build_snapshot(&config, &mut rig.nodes, Some(&id("db1")));

        let executor = Executor::new();
        let mut ctx = ExecutorContext {
            config: &config,
            drivers: &rig.drivers,
            proxies: &mut rig.proxies,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let err = executor
            .switchover(&mut ctx, &mut rig.status, &snapshot, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VigilError::PreconditionUnmet { code: "ERR00021", .. }
        ));
    }
}
