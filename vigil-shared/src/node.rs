//! Database node model: identity, observed replication attributes, and the
//! suspect/failed lifecycle driven by probe results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::gtid::{BinlogPos, GtidSet};

/// Stable node identity derived from (cluster, host, port). The observable
/// `server_id` lives on the probe report since it can change under us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub cluster: String,
    pub host: String,
    pub port: u16,
}

impl NodeId {
    pub fn new(cluster: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            cluster: cluster.into(),
            host: host.into(),
            port,
        }
    }

    /// Address form handed to drivers and logs.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.cluster, self.host, self.port)
    }
}

/// Role a node currently holds in the replication topology. Health states
/// (suspect/failed) share the enum because a node holds exactly one
/// classification per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Primary,
    Replica,
    Relay,
    Standalone,
    Failed,
    Suspect,
    Maintenance,
}

impl Default for NodeRole {
    fn default() -> Self {
        NodeRole::Suspect
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Primary => "primary",
            NodeRole::Replica => "replica",
            NodeRole::Relay => "relay",
            NodeRole::Standalone => "standalone",
            NodeRole::Failed => "failed",
            NodeRole::Suspect => "suspect",
            NodeRole::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BinlogFormat {
    #[default]
    Row,
    Statement,
    Mixed,
}

/// Server capabilities that gate election and rejoin decisions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub gtid_strict: bool,
    pub log_slave_updates: bool,
    pub crash_safe: bool,
    pub row_annotate: bool,
}

/// Everything a successful probe observes on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub server_id: u64,
    /// Upstream this node replicates from, if any.
    pub upstream: Option<NodeId>,
    pub gtid: GtidSet,
    pub position: BinlogPos,
    /// Seconds behind upstream; `None` when replication is not configured.
    pub lag_seconds: Option<u64>,
    pub io_thread_running: bool,
    pub sql_thread_running: bool,
    pub read_only: bool,
    pub semisync_enabled: bool,
    pub semisync_synced: bool,
    pub binlog_format: BinlogFormat,
    pub binlog_enabled: bool,
    /// `Master_Log_File` from replica status; absent when the replica lost
    /// track of its source.
    pub master_log_file: Option<String>,
    /// Monotonic count of replication heartbeat events received from the
    /// upstream. A stall across ticks means the upstream stopped writing.
    pub heartbeats_received: u64,
    pub capabilities: CapabilityFlags,
}

impl ProbeReport {
    /// A report shaped like a healthy writable primary; tests and scripted
    /// drivers start from this.
    pub fn primary(server_id: u64, gtid: GtidSet, position: BinlogPos) -> Self {
        Self {
            server_id,
            upstream: None,
            gtid,
            position,
            lag_seconds: None,
            io_thread_running: false,
            sql_thread_running: false,
            read_only: false,
            semisync_enabled: false,
            semisync_synced: true,
            binlog_format: BinlogFormat::Row,
            binlog_enabled: true,
            master_log_file: None,
            heartbeats_received: 0,
            capabilities: CapabilityFlags::default(),
        }
    }

    /// A report shaped like a healthy replica of `upstream`.
    pub fn replica(server_id: u64, upstream: NodeId, gtid: GtidSet, position: BinlogPos) -> Self {
        Self {
            server_id,
            upstream: Some(upstream),
            gtid,
            position: position.clone(),
            lag_seconds: Some(0),
            io_thread_running: true,
            sql_thread_running: true,
            read_only: true,
            semisync_enabled: false,
            semisync_synced: true,
            binlog_format: BinlogFormat::Row,
            binlog_enabled: true,
            master_log_file: Some(position.file),
            heartbeats_received: 0,
            capabilities: CapabilityFlags::default(),
        }
    }
}

/// Per-node record owned by the cluster monitor. Mutated only on that
/// cluster's tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    pub prev_role: NodeRole,
    pub fail_count: u32,
    pub last_seen: Option<DateTime<Utc>>,
    /// Latest successful probe; kept across suspect ticks so election can
    /// still reason about the last known coordinates.
    pub last_probe: Option<ProbeReport>,
    /// Errant GTIDs computed against the current primary at topology build.
    pub errant: Vec<crate::gtid::Gtid>,
    /// Heartbeat counter from the previous tick, for stall detection.
    pub prev_heartbeats: Option<u64>,
    pub heartbeats_stalled: bool,
    /// Set when a rejoin attempt found divergence with no safe path; the
    /// node stays standalone until it restarts or config changes.
    pub rejoin_blocked: bool,
    /// Operator flags resolved from config at monitor build.
    pub ignored: bool,
    pub preferred_rank: Option<usize>,
    pub in_maintenance: bool,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            role: NodeRole::Suspect,
            prev_role: NodeRole::Suspect,
            fail_count: 0,
            last_seen: None,
            last_probe: None,
            errant: Vec::new(),
            prev_heartbeats: None,
            heartbeats_stalled: false,
            rejoin_blocked: false,
            ignored: false,
            preferred_rank: None,
            in_maintenance: false,
        }
    }

    pub fn server_id(&self) -> u64 {
        self.last_probe.as_ref().map(|p| p.server_id).unwrap_or(0)
    }

    pub fn lag_seconds(&self) -> Option<u64> {
        self.last_probe.as_ref().and_then(|p| p.lag_seconds)
    }

    pub fn gtid(&self) -> GtidSet {
        self.last_probe
            .as_ref()
            .map(|p| p.gtid.clone())
            .unwrap_or_default()
    }

    pub fn is_down(&self) -> bool {
        self.role == NodeRole::Failed
    }

    /// Fold a successful probe in. One success clears the fail count.
    pub fn apply_probe(&mut self, report: ProbeReport, now: DateTime<Utc>) {
        self.fail_count = 0;
        self.last_seen = Some(now);
        self.heartbeats_stalled = matches!(
            self.prev_heartbeats,
            Some(prev) if report.heartbeats_received <= prev && report.upstream.is_some()
        );
        self.prev_heartbeats = Some(report.heartbeats_received);
        self.last_probe = Some(report);
    }

    /// Fold a missed or errored probe in. `max_fail` consecutive misses
    /// demote the node from suspect to failed.
    pub fn apply_probe_failure(&mut self, max_fail: u32) {
        // A node that went away gets a fresh rejoin attempt on return.
        self.rejoin_blocked = false;
        self.fail_count = self.fail_count.saturating_add(1);
        self.set_role(if self.fail_count >= max_fail {
            NodeRole::Failed
        } else {
            NodeRole::Suspect
        });
    }

    pub fn set_role(&mut self, role: NodeRole) {
        if self.role != role {
            self.prev_role = self.role;
            self.role = role;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> NodeId {
        NodeId::new("c1", "db1", 3306)
    }

    #[test]
    fn node_id_display() {
        assert_eq!(test_id().to_string(), "c1/db1:3306");
        assert_eq!(test_id().address(), "db1:3306");
    }

    #[test]
    fn probe_failure_progression() {
        let mut node = Node::new(test_id());
        for _ in 0..4 {
            node.apply_probe_failure(5);
        }
        assert_eq!(node.role, NodeRole::Suspect);
        node.apply_probe_failure(5);
        assert_eq!(node.role, NodeRole::Failed);
        assert_eq!(node.prev_role, NodeRole::Suspect);
    }

    #[test]
    fn single_success_clears_fail_count() {
        let mut node = Node::new(test_id());
        node.apply_probe_failure(5);
        node.apply_probe_failure(5);
        assert_eq!(node.fail_count, 2);

        let report = ProbeReport::primary(101, GtidSet::new(), BinlogPos::new("bin.000001", 4));
        node.apply_probe(report, Utc::now());
        assert_eq!(node.fail_count, 0);
        assert!(node.last_seen.is_some());
    }

    #[test]
    fn heartbeat_stall_detection() {
        let mut node = Node::new(test_id());
        let upstream = NodeId::new("c1", "db0", 3306);
        let mut report = ProbeReport::replica(
            102,
            upstream,
            GtidSet::new(),
            BinlogPos::new("bin.000001", 4),
        );
        report.heartbeats_received = 10;
        node.apply_probe(report.clone(), Utc::now());
        assert!(!node.heartbeats_stalled);

        report.heartbeats_received = 11;
        node.apply_probe(report.clone(), Utc::now());
        assert!(!node.heartbeats_stalled);

        // Counter stops moving: upstream is no longer writing.
        node.apply_probe(report, Utc::now());
        assert!(node.heartbeats_stalled);
    }
}
