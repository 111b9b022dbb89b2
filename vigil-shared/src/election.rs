//! Successor election.
//!
//! Given a classified topology and the cluster policy, filter the replica
//! pool down to electable candidates (each exclusion carries its stable
//! reason code) and rank what remains. The ranking is deterministic: equal
//! inputs always elect the same node.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::ClusterConfig;
use crate::events::{EventOrigin, EventRing, Severity};
use crate::gtid::BinlogPos;
use crate::node::{Node, NodeId, NodeRole};
use crate::topology::TopologySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionKind {
    Failover,
    Switchover,
}

/// Why a node was excluded from candidacy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionReason {
    InIgnoreList,
    Maintenance,
    IsRelay,
    MultiMasterAlreadyPrimary,
    NotElectable,
    NoBinlogs,
    IoThreadStoppedWithValidLeader,
    SqlThreadStopped,
    SemisyncUnsynced,
    LagOverMax { lag: u64, max: u64 },
    NoMasterLogFile,
    ErrantTransactions,
}

impl ExclusionReason {
    pub fn code(&self, kind: ElectionKind) -> &'static str {
        match self {
            ExclusionReason::InIgnoreList => "ERR00037",
            ExclusionReason::Maintenance => "ERR00047",
            ExclusionReason::IsRelay => "ERR00036",
            ExclusionReason::MultiMasterAlreadyPrimary => "ERR00035",
            ExclusionReason::NotElectable => match kind {
                ElectionKind::Failover => "ERR00039",
                ElectionKind::Switchover => "ERR00034",
            },
            ExclusionReason::NoBinlogs => "ERR00040",
            ExclusionReason::IoThreadStoppedWithValidLeader => "ERR00087",
            ExclusionReason::SqlThreadStopped => "ERR00042",
            ExclusionReason::SemisyncUnsynced => "ERR00043",
            ExclusionReason::LagOverMax { .. } => "ERR00041",
            ExclusionReason::NoMasterLogFile => "ERR00033",
            ExclusionReason::ErrantTransactions => "WARN0091",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub node: NodeId,
    pub reason: ExclusionReason,
}

/// Ordered candidate list; empty when nothing passed filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionOutcome {
    pub candidates: Vec<NodeId>,
    pub exclusions: Vec<Exclusion>,
}

impl ElectionOutcome {
    pub fn winner(&self) -> Option<&NodeId> {
        self.candidates.first()
    }
}

fn exclusion_for(
    node: &Node,
    snapshot: &TopologySnapshot,
    config: &ClusterConfig,
) -> Option<ExclusionReason> {
    if config.ignored_hosts.iter().any(|h| *h == node.id.address()) {
        return Some(ExclusionReason::InIgnoreList);
    }
    if node.in_maintenance || node.role == NodeRole::Maintenance {
        return Some(ExclusionReason::Maintenance);
    }
    if node.role == NodeRole::Relay && config.replication_no_relay {
        return Some(ExclusionReason::IsRelay);
    }
    if config.replication_multi_master && node.role == NodeRole::Primary {
        return Some(ExclusionReason::MultiMasterAlreadyPrimary);
    }
    let report = match &node.last_probe {
        Some(r) => r,
        // Never successfully probed: nothing to elect on.
        None => return Some(ExclusionReason::NotElectable),
    };
    if !report.binlog_enabled {
        return Some(ExclusionReason::NoBinlogs);
    }
    if report.master_log_file.is_none() {
        return Some(ExclusionReason::NoMasterLogFile);
    }
    if !report.io_thread_running {
        // An io thread stopped against a live leader hides real position;
        // with the leader gone it is the expected post-mortem state.
        let leader_alive = snapshot
            .primary_node()
            .map(|p| p.role == NodeRole::Primary)
            .unwrap_or(false);
        if leader_alive {
            return Some(ExclusionReason::IoThreadStoppedWithValidLeader);
        }
    }
    if !report.sql_thread_running {
        return Some(ExclusionReason::SqlThreadStopped);
    }
    if config.failover_at_sync && report.semisync_enabled && !report.semisync_synced {
        return Some(ExclusionReason::SemisyncUnsynced);
    }
    if let Some(lag) = report.lag_seconds {
        if lag > config.failover_max_slave_delay {
            return Some(ExclusionReason::LagOverMax {
                lag,
                max: config.failover_max_slave_delay,
            });
        }
    }
    if config.failover_check_errant && !node.errant.is_empty() {
        return Some(ExclusionReason::ErrantTransactions);
    }
    None
}

/// Replication progress as a comparable pair: GTID weight dominates, the
/// positional coordinates break ties for non-GTID topologies.
fn progress_of(node: &Node) -> (u64, BinlogPos) {
    match &node.last_probe {
        Some(report) => (report.gtid.weight(), report.position.clone()),
        None => (0, BinlogPos::new("", 0)),
    }
}

fn rank(a: &Node, b: &Node, config: &ClusterConfig) -> Ordering {
    let pref = |n: &Node| {
        config
            .prefered_master
            .iter()
            .position(|h| *h == n.id.address())
            .unwrap_or(usize::MAX)
    };
    pref(a)
        .cmp(&pref(b))
        .then_with(|| progress_of(b).cmp(&progress_of(a)))
        .then_with(|| {
            a.lag_seconds()
                .unwrap_or(u64::MAX)
                .cmp(&b.lag_seconds().unwrap_or(u64::MAX))
        })
        .then_with(|| a.server_id().cmp(&b.server_id()))
}

/// Run an election over the snapshot's replica pool. Exclusions are
/// emitted to the event ring with their stable codes; an empty outcome
/// emits `ERR00032`.
pub fn run_election(
    snapshot: &TopologySnapshot,
    config: &ClusterConfig,
    kind: ElectionKind,
    events: &EventRing,
) -> ElectionOutcome {
    let mut exclusions = Vec::new();
    let mut passed: Vec<&Node> = Vec::new();

    let pool = snapshot.replicas.iter().chain(snapshot.relays.iter());
    for id in pool {
        let node = match snapshot.node(id) {
            Some(n) => n,
            None => continue,
        };
        match exclusion_for(node, snapshot, config) {
            Some(reason) => {
                events.emit(
                    &snapshot.cluster,
                    EventOrigin::Node(node.id.address()),
                    Severity::Warn,
                    reason.code(kind),
                    node.id.address(),
                );
                exclusions.push(Exclusion {
                    node: node.id.clone(),
                    reason,
                });
            }
            None => passed.push(node),
        }
    }

    passed.sort_by(|a, b| rank(a, b, config));

    if passed.is_empty() {
        events.emit(
            &snapshot.cluster,
            EventOrigin::Cluster,
            Severity::Error,
            "ERR00032",
            "",
        );
    }

    ElectionOutcome {
        candidates: passed.into_iter().map(|n| n.id.clone()).collect(),
        exclusions,
    }
}
