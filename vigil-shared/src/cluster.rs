//! Cluster-level state: the per-cluster state machine, the failover
//! circuit breaker, and the degradation predicates evaluated each tick.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::node::{NodeId, NodeRole};
use crate::topology::TopologySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Starting,
    RunningOk,
    Degraded,
    Down,
    FailingOver,
    SwitchingOver,
    Rejoining,
    Paused,
    SplitBrain,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Starting => "starting",
            ClusterState::RunningOk => "running-ok",
            ClusterState::Degraded => "degraded",
            ClusterState::Down => "down",
            ClusterState::FailingOver => "failing-over",
            ClusterState::SwitchingOver => "switching-over",
            ClusterState::Rejoining => "rejoining",
            ClusterState::Paused => "paused",
            ClusterState::SplitBrain => "split-brain",
        }
    }

    /// Whether an operator switchover may start from this state.
    pub fn allows_switchover(&self) -> bool {
        matches!(self, ClusterState::RunningOk | ClusterState::Degraded)
    }

    /// States in which the monitor must not mutate the topology.
    pub fn inhibits_actions(&self) -> bool {
        matches!(self, ClusterState::Paused | ClusterState::SplitBrain)
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a running cluster is considered degraded this tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradedReason {
    ReplicaLagOverMax(NodeId),
    ReplicationThreadsBroken(NodeId),
    SemisyncUnsynced(NodeId),
    ErrantTransactions(NodeId),
    MultiPrimary,
    ForbiddenRelay(NodeId),
}

/// Evaluate the running-ok -> degraded predicates against a snapshot.
pub fn degraded_reasons(snapshot: &TopologySnapshot, config: &ClusterConfig) -> Vec<DegradedReason> {
    let mut reasons = Vec::new();

    for id in &snapshot.replicas {
        let node = match snapshot.node(id) {
            Some(n) => n,
            None => continue,
        };
        let report = match &node.last_probe {
            Some(r) => r,
            None => continue,
        };
        if let Some(lag) = report.lag_seconds {
            if lag > config.failover_max_slave_delay {
                reasons.push(DegradedReason::ReplicaLagOverMax(id.clone()));
            }
        }
        if !report.io_thread_running || !report.sql_thread_running {
            reasons.push(DegradedReason::ReplicationThreadsBroken(id.clone()));
        }
        if report.semisync_enabled && !report.semisync_synced {
            reasons.push(DegradedReason::SemisyncUnsynced(id.clone()));
        }
        if !node.errant.is_empty() {
            reasons.push(DegradedReason::ErrantTransactions(id.clone()));
        }
    }

    if snapshot.has_anomaly("ERR00011") {
        reasons.push(DegradedReason::MultiPrimary);
    }
    for id in &snapshot.relays {
        if snapshot.has_anomaly("ERR00045") {
            reasons.push(DegradedReason::ForbiddenRelay(id.clone()));
            break;
        }
    }

    reasons
}

/// The down predicate: the primary has been failed for at least one full
/// tick and no reachable replica still sees it alive. Arbitration agreement
/// is checked separately by the monitor.
pub fn primary_confirmed_down(snapshot: &TopologySnapshot, prior_primary: &NodeId) -> bool {
    let primary_failed = snapshot
        .nodes
        .get(&prior_primary.address())
        .map(|n| n.role == NodeRole::Failed)
        .unwrap_or(false);
    if !primary_failed {
        return false;
    }
    // A replica whose io thread still runs against the dead primary and
    // whose heartbeats keep arriving contradicts the failure.
    let replica_sees_primary = snapshot.replicas.iter().chain(snapshot.relays.iter()).any(|id| {
        snapshot
            .node(id)
            .and_then(|n| n.last_probe.as_ref().map(|r| (n, r)))
            .map(|(node, report)| {
                report.upstream.as_ref().map(|u| u.address()) == Some(prior_primary.address())
                    && report.io_thread_running
                    && !node.heartbeats_stalled
            })
            .unwrap_or(false)
    });
    !replica_sees_primary
}

/// Per-cluster control state owned by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub uuid: Uuid,
    pub state: ClusterState,
    pub prev_state: ClusterState,
    /// Primary per the latest snapshot; null while the cluster is down.
    pub current_primary: Option<NodeId>,
    /// Last primary this monitor confirmed; survives its failure so the
    /// failover path knows whose death it is reacting to.
    pub last_known_primary: Option<NodeId>,
    /// Successor being promoted while an election is in flight.
    pub candidate: Option<NodeId>,
    /// Monotonic within the process lifetime.
    pub failover_count: u32,
    pub last_failover: Option<DateTime<Utc>>,
    /// Successful failover timestamps inside the circuit-breaker window.
    recent_failovers: Vec<DateTime<Utc>>,
    pub is_split_brain: bool,
    /// Operator requested a planned primary change to this node (or to the
    /// best candidate when `None` inside `Some`).
    pub pending_switchover: Option<Option<NodeId>>,
}

impl ClusterStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            state: ClusterState::Starting,
            prev_state: ClusterState::Starting,
            current_primary: None,
            last_known_primary: None,
            candidate: None,
            failover_count: 0,
            last_failover: None,
            recent_failovers: Vec::new(),
            is_split_brain: false,
            pending_switchover: None,
        }
    }

    pub fn transition(&mut self, next: ClusterState) {
        if self.state != next {
            self.prev_state = self.state;
            self.state = next;
        }
    }

    /// Successful failovers inside the rolling window, pruning expired
    /// entries. The monotonic total is untouched by the pruning.
    pub fn failovers_in_window(&mut self, config: &ClusterConfig, now: DateTime<Utc>) -> u32 {
        let window = ChronoDuration::from_std(config.failover_time_limit)
            .unwrap_or_else(|_| ChronoDuration::seconds(3600));
        self.recent_failovers.retain(|t| now - *t < window);
        self.recent_failovers.len() as u32
    }

    pub fn record_failover(&mut self, now: DateTime<Utc>) {
        self.failover_count += 1;
        self.last_failover = Some(now);
        self.recent_failovers.push(now);
    }

    pub fn seconds_since_last_failover(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_failover.map(|t| (now - t).num_seconds())
    }
}
