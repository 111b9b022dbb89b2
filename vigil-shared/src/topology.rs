//! Topology reconstruction.
//!
//! Each tick rebuilds an immutable snapshot of the replication graph from
//! the latest probe results: node classification, the derived replica ->
//! source edges, the elected current primary, and any anomalies the state
//! machine must react to.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::config::ClusterConfig;
use crate::gtid::Gtid;
use crate::node::{Node, NodeId, NodeRole};

/// Topology inconsistencies. Never auto-resolved unless a recovery policy
/// explicitly covers them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anomaly {
    /// More than one writable primary without multi-master policy.
    MultiPrimary(Vec<NodeId>),
    /// An intermediate relay exists while relay topologies are forbidden.
    ForbiddenRelay(NodeId),
    /// A replica carries transactions its primary never had.
    ErrantTransactions { node: NodeId, gtids: Vec<Gtid> },
    /// A replica points at a source outside the configured cluster.
    ExternalUpstream { node: NodeId, upstream: NodeId },
}

impl Anomaly {
    /// Stable event code for this anomaly.
    pub fn code(&self) -> &'static str {
        match self {
            Anomaly::MultiPrimary(_) => "ERR00011",
            Anomaly::ForbiddenRelay(_) => "ERR00045",
            Anomaly::ErrantTransactions { .. } => "WARN0091",
            Anomaly::ExternalUpstream { .. } => "ERR00064",
        }
    }
}

/// Immutable value produced at each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub cluster: String,
    /// All nodes keyed by address, as observed this tick.
    pub nodes: BTreeMap<String, Node>,
    pub primary: Option<NodeId>,
    pub replicas: Vec<NodeId>,
    pub relays: Vec<NodeId>,
    pub standalones: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub anomalies: Vec<Anomaly>,
}

impl TopologySnapshot {
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(&id.address())
    }

    pub fn primary_node(&self) -> Option<&Node> {
        self.primary.as_ref().and_then(|id| self.node(id))
    }

    /// Replicas eligible for read routing: healthy and not in maintenance.
    pub fn healthy_replicas(&self) -> Vec<&Node> {
        self.replicas
            .iter()
            .filter_map(|id| self.node(id))
            .filter(|n| n.role == NodeRole::Replica && !n.in_maintenance)
            .collect()
    }

    pub fn has_anomaly(&self, code: &str) -> bool {
        self.anomalies.iter().any(|a| a.code() == code)
    }
}

/// A node is considered observed this tick when its last probe succeeded.
fn is_reachable(node: &Node) -> bool {
    node.fail_count == 0 && node.last_probe.is_some()
}

fn is_writable_head(node: &Node) -> bool {
    match &node.last_probe {
        Some(report) => report.upstream.is_none() && report.binlog_enabled && !report.read_only,
        None => false,
    }
}

/// Rebuild the topology from the monitor's node table. Roles are written
/// back onto the nodes; the returned snapshot owns copies.
pub fn build_snapshot(
    config: &ClusterConfig,
    nodes: &mut BTreeMap<String, Node>,
    prior_primary: Option<&NodeId>,
) -> TopologySnapshot {
    let addresses: HashSet<String> = nodes.keys().cloned().collect();

    // Addresses that at least one reachable node replicates from; a node
    // that both has an upstream and feeds others is a relay.
    let mut upstream_of: HashSet<String> = HashSet::new();
    for node in nodes.values() {
        if !is_reachable(node) {
            continue;
        }
        if let Some(upstream) = node.last_probe.as_ref().and_then(|p| p.upstream.as_ref()) {
            upstream_of.insert(upstream.address());
        }
    }

    let mut anomalies = Vec::new();
    let mut heads: Vec<NodeId> = Vec::new();

    for node in nodes.values_mut() {
        if node.in_maintenance {
            node.set_role(NodeRole::Maintenance);
            continue;
        }
        if !is_reachable(node) {
            // apply_probe_failure already chose Suspect or Failed.
            continue;
        }
        let report = match node.last_probe.clone() {
            Some(r) => r,
            None => continue,
        };
        match &report.upstream {
            None => {
                if is_writable_head(node) {
                    heads.push(node.id.clone());
                    node.set_role(NodeRole::Primary);
                } else {
                    node.set_role(NodeRole::Standalone);
                }
            }
            Some(upstream) => {
                if !addresses.contains(&upstream.address()) {
                    anomalies.push(Anomaly::ExternalUpstream {
                        node: node.id.clone(),
                        upstream: upstream.clone(),
                    });
                    node.set_role(NodeRole::Standalone);
                } else if upstream_of.contains(&node.id.address()) {
                    node.set_role(NodeRole::Relay);
                } else {
                    node.set_role(NodeRole::Replica);
                }
            }
        }
    }

    let primary = choose_primary(config, nodes, prior_primary, &heads);

    if heads.len() > 1 && !config.replication_multi_master {
        anomalies.push(Anomaly::MultiPrimary(heads.clone()));
        // Only the tie-break winner keeps the primary role; the extra
        // heads are anomalous until an operator intervenes.
        for head in &heads {
            if Some(head) != primary.as_ref() {
                if let Some(node) = nodes.get_mut(&head.address()) {
                    node.set_role(NodeRole::Standalone);
                }
            }
        }
    }

    // Errant transactions are computed against the chosen primary.
    if let Some(primary_id) = &primary {
        let primary_gtid = nodes
            .get(&primary_id.address())
            .map(|n| n.gtid())
            .unwrap_or_default();
        for node in nodes.values_mut() {
            if node.id == *primary_id || !is_reachable(node) {
                node.errant.clear();
                continue;
            }
            node.errant = node.gtid().errant_against(&primary_gtid);
            if !node.errant.is_empty() {
                anomalies.push(Anomaly::ErrantTransactions {
                    node: node.id.clone(),
                    gtids: node.errant.clone(),
                });
            }
        }
    }

    let mut replicas = Vec::new();
    let mut relays = Vec::new();
    let mut standalones = Vec::new();
    let mut failed = Vec::new();
    for node in nodes.values() {
        match node.role {
            NodeRole::Replica => replicas.push(node.id.clone()),
            NodeRole::Relay => {
                relays.push(node.id.clone());
                if config.replication_no_relay && !config.replication_multi_tier_slave {
                    anomalies.push(Anomaly::ForbiddenRelay(node.id.clone()));
                }
            }
            NodeRole::Standalone => standalones.push(node.id.clone()),
            NodeRole::Failed => failed.push(node.id.clone()),
            _ => {}
        }
    }

    TopologySnapshot {
        cluster: config.name.clone(),
        nodes: nodes.clone(),
        primary,
        replicas,
        relays,
        standalones,
        failed,
        anomalies,
    }
}

/// Current primary: the prior one while it stays healthy and writable,
/// otherwise the best writable head by (preferred list, lag, errant count,
/// server id).
fn choose_primary(
    config: &ClusterConfig,
    nodes: &BTreeMap<String, Node>,
    prior: Option<&NodeId>,
    heads: &[NodeId],
) -> Option<NodeId> {
    if let Some(prior_id) = prior {
        if let Some(node) = nodes.get(&prior_id.address()) {
            if is_reachable(node) && is_writable_head(node) {
                return Some(prior_id.clone());
            }
        }
    }

    let mut ranked: Vec<&Node> = heads
        .iter()
        .filter_map(|id| nodes.get(&id.address()))
        .collect();
    ranked.sort_by_key(|node| {
        let preferred = config
            .prefered_master
            .iter()
            .position(|h| *h == node.id.address())
            .unwrap_or(usize::MAX);
        (
            preferred,
            node.lag_seconds().unwrap_or(0),
            node.errant.len(),
            node.server_id(),
        )
    });
    ranked.first().map(|node| node.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::{BinlogPos, GtidSet};
    use crate::node::ProbeReport;
    use chrono::Utc;

    fn config(hosts: &[&str]) -> ClusterConfig {
        ClusterConfig {
            name: "c1".to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..ClusterConfig::default()
        }
    }

    fn id(host: &str) -> NodeId {
        NodeId::new("c1", host, 3306)
    }

    fn primary_node(host: &str, server_id: u64, gtid: &str) -> Node {
        let mut node = Node::new(id(host));
        node.apply_probe(
            ProbeReport::primary(
                server_id,
                GtidSet::parse(gtid).unwrap(),
                BinlogPos::new("bin.000010", 500),
            ),
            Utc::now(),
        );
        node
    }

    fn replica_node(host: &str, server_id: u64, upstream: &str, gtid: &str) -> Node {
        let mut node = Node::new(id(host));
        node.apply_probe(
            ProbeReport::replica(
                server_id,
                id(upstream),
                GtidSet::parse(gtid).unwrap(),
                BinlogPos::new("bin.000010", 400),
            ),
            Utc::now(),
        );
        node
    }

    fn table(nodes: Vec<Node>) -> BTreeMap<String, Node> {
        nodes.into_iter().map(|n| (n.id.address(), n)).collect()
    }

    #[test]
    fn classifies_primary_and_replicas() {
        let config = config(&["db1:3306", "db2:3306", "db3:3306"]);
        let mut nodes = table(vec![
            primary_node("db1", 101, "0-101-500"),
            replica_node("db2", 102, "db1", "0-101-500"),
            replica_node("db3", 103, "db1", "0-101-495"),
        ]);
        let snapshot = build_snapshot(&config, &mut nodes, None);
        assert_eq!(snapshot.primary, Some(id("db1")));
        assert_eq!(snapshot.replicas.len(), 2);
        assert!(snapshot.anomalies.is_empty());
    }

    #[test]
    fn prior_primary_sticks_while_writable() {
        let config = config(&["db1:3306", "db2:3306"]);
        let prior = id("db1");
        let mut nodes = table(vec![
            primary_node("db1", 101, "0-101-500"),
            // A second writable head with a smaller server id would
            // otherwise win the tie-break.
            primary_node("db2", 42, "0-42-10"),
        ]);
        let snapshot = build_snapshot(&config, &mut nodes, Some(&prior));
        assert_eq!(snapshot.primary, Some(id("db1")));
    }

    #[test]
    fn multi_primary_without_policy_is_anomalous() {
        let config = config(&["db1:3306", "db2:3306"]);
        let mut nodes = table(vec![
            primary_node("db1", 101, "0-101-500"),
            primary_node("db2", 102, "0-102-400"),
        ]);
        let snapshot = build_snapshot(&config, &mut nodes, None);
        assert!(snapshot.has_anomaly("ERR00011"));
        // Tie-break still names a working primary; the loser is demoted
        // so at most one node holds the primary role.
        assert_eq!(snapshot.primary, Some(id("db1")));
        let primaries = snapshot
            .nodes
            .values()
            .filter(|n| n.role == NodeRole::Primary)
            .count();
        assert_eq!(primaries, 1);
        assert_eq!(snapshot.node(&id("db2")).unwrap().role, NodeRole::Standalone);
    }

    #[test]
    fn relay_classification_and_anomaly() {
        let mut cfg = config(&["db1:3306", "db2:3306", "db3:3306"]);
        cfg.replication_no_relay = true;
        let mut nodes = table(vec![
            primary_node("db1", 101, "0-101-500"),
            replica_node("db2", 102, "db1", "0-101-500"),
            replica_node("db3", 103, "db2", "0-101-480"),
        ]);
        let snapshot = build_snapshot(&cfg, &mut nodes, None);
        assert_eq!(snapshot.relays, vec![id("db2")]);
        assert!(snapshot.has_anomaly("ERR00045"));

        cfg.replication_no_relay = false;
        let mut nodes = table(vec![
            primary_node("db1", 101, "0-101-500"),
            replica_node("db2", 102, "db1", "0-101-500"),
            replica_node("db3", 103, "db2", "0-101-480"),
        ]);
        let snapshot = build_snapshot(&cfg, &mut nodes, None);
        assert!(!snapshot.has_anomaly("ERR00045"));
    }

    #[test]
    fn errant_transactions_flagged() {
        let config = config(&["db1:3306", "db2:3306"]);
        let mut nodes = table(vec![
            primary_node("db1", 101, "0-101-500"),
            replica_node("db2", 102, "db1", "0-101-480,7-102-3"),
        ]);
        let snapshot = build_snapshot(&config, &mut nodes, None);
        assert!(snapshot.has_anomaly("WARN0091"));
        let replica = snapshot.node(&id("db2")).unwrap();
        assert_eq!(replica.errant.len(), 1);
    }

    #[test]
    fn external_upstream_is_standalone() {
        let config = config(&["db1:3306", "db2:3306"]);
        let mut nodes = table(vec![
            primary_node("db1", 101, "0-101-500"),
            replica_node("db2", 102, "elsewhere", "0-101-480"),
        ]);
        let snapshot = build_snapshot(&config, &mut nodes, None);
        assert!(snapshot.has_anomaly("ERR00064"));
        assert_eq!(snapshot.standalones, vec![id("db2")]);
    }

    #[test]
    fn failed_nodes_listed() {
        let config = config(&["db1:3306", "db2:3306"]);
        let mut failed = Node::new(id("db1"));
        for _ in 0..5 {
            failed.apply_probe_failure(5);
        }
        let mut nodes = table(vec![failed, replica_node("db2", 102, "db1", "0-101-480")]);
        let snapshot = build_snapshot(&config, &mut nodes, None);
        assert_eq!(snapshot.failed, vec![id("db1")]);
        assert_eq!(snapshot.primary, None);
    }
}
