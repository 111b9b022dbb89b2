//! Rejoin protocol: re-admitting a previously-failed node as a replica of
//! the current primary.
//!
//! Strategies are tried in a fixed ladder: GTID auto-position, then
//! flashback to the common ancestor, then logical reseed, then abort. A
//! node is re-admitted only once its replication threads run and a lag
//! sample is observed; rejoining an already-admitted replica is a no-op.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::driver::NodeDriver;
use crate::events::{EventOrigin, EventRing, Severity};
use crate::exception::{VigilError, VigilResult};
use crate::gtid::ReplicationCoord;
use crate::metrics::MonitorMetrics;
use crate::node::{BinlogFormat, Node, NodeId, NodeRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejoinStrategy {
    GtidAutoPosition,
    Flashback,
    LogicalDump,
    /// Forced positional rejoin despite divergence (`rejoin-unsafe`).
    Unsafe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejoinOutcome {
    /// Node already replicates from the current primary; nothing done.
    AlreadyJoined,
    Rejoined(RejoinStrategy),
    /// Divergence with no safe path: node stays standalone.
    Aborted,
}

pub struct RejoinContext<'a> {
    pub config: &'a ClusterConfig,
    pub events: &'a EventRing,
    pub metrics: &'a MonitorMetrics,
}

/// Run the rejoin ladder for `node` against the current primary.
pub async fn rejoin_node(
    ctx: &RejoinContext<'_>,
    node: &mut Node,
    node_driver: Arc<dyn NodeDriver>,
    primary: &NodeId,
    primary_driver: Arc<dyn NodeDriver>,
) -> VigilResult<RejoinOutcome> {
    let cluster = &ctx.config.name;
    let report = node_driver.probe().await?;

    // Idempotence: a node already attached and replicating is left alone.
    if report.upstream.as_ref().map(|u| u.address()) == Some(primary.address())
        && report.io_thread_running
        && report.sql_thread_running
    {
        debug!("{} already replicates from {primary}, rejoin is a no-op", node.id);
        return Ok(RejoinOutcome::AlreadyJoined);
    }

    let primary_gtid = primary_driver
        .gtid_set()
        .await
        .map_err(|e| VigilError::plan_step("read-primary-gtid", e.to_string()))?;
    let divergent = report.gtid.errant_against(&primary_gtid);

    let strategy = if divergent.is_empty() && primary_gtid.contains(&report.gtid) {
        Some(RejoinStrategy::GtidAutoPosition)
    } else if (ctx.config.rejoin_flashback || ctx.config.rejoin_pseudogtid)
        && report.binlog_enabled
        && report.binlog_format == BinlogFormat::Row
    {
        Some(RejoinStrategy::Flashback)
    } else if ctx.config.rejoin_dump {
        Some(RejoinStrategy::LogicalDump)
    } else if ctx.config.rejoin_unsafe {
        Some(RejoinStrategy::Unsafe)
    } else {
        None
    };

    if (ctx.config.rejoin_flashback || ctx.config.rejoin_pseudogtid)
        && !divergent.is_empty()
        && report.binlog_format != BinlogFormat::Row
    {
        ctx.events.emit(
            cluster,
            EventOrigin::Node(node.id.address()),
            Severity::Warn,
            "WARN0049",
            node.id.address(),
        );
    }

    let strategy = match strategy {
        Some(s) => s,
        None => {
            node.set_role(NodeRole::Standalone);
            node.rejoin_blocked = true;
            ctx.events.emit(
                cluster,
                EventOrigin::Node(node.id.address()),
                Severity::Error,
                "ERR00066",
                format!("{} diverges from {}", node.id.address(), primary.address()),
            );
            return Ok(RejoinOutcome::Aborted);
        }
    };

    ctx.events.emit(
        cluster,
        EventOrigin::Node(node.id.address()),
        Severity::Info,
        "WARN0022",
        format!("{} to {}", node.id.address(), primary.address()),
    );

    let coord = match strategy {
        RejoinStrategy::GtidAutoPosition => ReplicationCoord::GtidAutoPosition(primary_gtid),
        RejoinStrategy::Flashback | RejoinStrategy::Unsafe => {
            // Resume from the primary's frozen coordinates; divergent
            // transactions beyond them are discarded.
            let position = primary_driver
                .position()
                .await
                .map_err(|e| VigilError::plan_step("read-primary-position", e.to_string()))?;
            ReplicationCoord::Positional(position)
        }
        RejoinStrategy::LogicalDump => {
            ctx.events.emit(
                cluster,
                EventOrigin::Node(node.id.address()),
                Severity::Warn,
                "WARN0075",
                node.id.address(),
            );
            ReplicationCoord::GtidAutoPosition(primary_gtid)
        }
    };

    node_driver
        .demote()
        .await
        .map_err(|e| VigilError::plan_step("rejoin-demote", e.to_string()))?;
    node_driver
        .stop_replication()
        .await
        .map_err(|e| VigilError::plan_step("rejoin-stop-replication", e.to_string()))?;
    node_driver
        .set_replication_source(primary, &coord)
        .await
        .map_err(|e| VigilError::plan_step("rejoin-change-source", e.to_string()))?;
    node_driver
        .start_replication()
        .await
        .map_err(|e| VigilError::plan_step("rejoin-start-replication", e.to_string()))?;

    // Re-admission gate: threads running and an initial lag observation.
    let verified = node_driver.probe().await?;
    if !(verified.io_thread_running
        && verified.sql_thread_running
        && verified.lag_seconds.is_some())
    {
        return Err(VigilError::plan_step(
            "rejoin-verify",
            format!("{} replication threads not running after rejoin", node.id),
        ));
    }
    node.apply_probe(verified, chrono::Utc::now());
    node.set_role(NodeRole::Replica);
    ctx.metrics.record_rejoin();
    info!("{} rejoined {} via {:?}", node.id, primary, strategy);
    Ok(RejoinOutcome::Rejoined(strategy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scripted::ScriptedFleet;
    use crate::driver::NodeDriverFactory;
    use crate::gtid::BinlogPos;

    fn id(host: &str) -> NodeId {
        NodeId::new("c1", host, 3306)
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            name: "c1".to_string(),
            hosts: vec!["db1:3306".into(), "db2:3306".into()],
            ..ClusterConfig::default()
        }
    }

    struct Rig {
        fleet: ScriptedFleet,
        events: EventRing,
        metrics: MonitorMetrics,
    }

    fn rig() -> Rig {
        let fleet = ScriptedFleet::new();
        fleet.add_primary(id("db1"), 101, "0-101-500", BinlogPos::new("bin.000010", 500));
        Rig {
            fleet,
            events: EventRing::new(32),
            metrics: MonitorMetrics::new(),
        }
    }

    /// A standalone former primary whose GTID set is behind db1.
    fn lagging_standalone(rig: &Rig, gtid: &str) -> Node {
        let scripted = rig.fleet.add_primary(id("db2"), 102, gtid, BinlogPos::new("bin.000009", 900));
        scripted.update_report(|r| r.read_only = true);
        let mut node = Node::new(id("db2"));
        for _ in 0..5 {
            node.apply_probe_failure(5);
        }
        node
    }

    #[tokio::test]
    async fn gtid_subset_rejoins_with_auto_position() {
        let rig = rig();
        let config = config();
        let mut node = lagging_standalone(&rig, "0-101-450");
        let ctx = RejoinContext {
            config: &config,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let outcome = rejoin_node(
            &ctx,
            &mut node,
            rig.fleet.driver_for(&id("db2"), ""),
            &id("db1"),
            rig.fleet.driver_for(&id("db1"), ""),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RejoinOutcome::Rejoined(RejoinStrategy::GtidAutoPosition));
        assert_eq!(node.role, NodeRole::Replica);
        let scripted = rig.fleet.node("db2:3306").unwrap();
        assert_eq!(
            scripted.report().upstream.map(|u| u.address()),
            Some("db1:3306".to_string())
        );
        assert_eq!(rig.metrics.snapshot().rejoins, 1);
    }

    #[tokio::test]
    async fn rejoin_is_idempotent() {
        let rig = rig();
        let config = config();
        let mut node = lagging_standalone(&rig, "0-101-450");
        let ctx = RejoinContext {
            config: &config,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let driver = rig.fleet.driver_for(&id("db2"), "");
        let primary_driver = rig.fleet.driver_for(&id("db1"), "");

        let first = rejoin_node(&ctx, &mut node, driver.clone(), &id("db1"), primary_driver.clone())
            .await
            .unwrap();
        assert!(matches!(first, RejoinOutcome::Rejoined(_)));
        let changes_after_first = rig.fleet.node("db2:3306").unwrap().calls().source_changes;

        let second = rejoin_node(&ctx, &mut node, driver, &id("db1"), primary_driver)
            .await
            .unwrap();
        assert_eq!(second, RejoinOutcome::AlreadyJoined);
        assert_eq!(
            rig.fleet.node("db2:3306").unwrap().calls().source_changes,
            changes_after_first
        );
        assert_eq!(rig.metrics.snapshot().rejoins, 1);
    }

    #[tokio::test]
    async fn divergence_without_policy_aborts_to_standalone() {
        let rig = rig();
        let config = config();
        // Domain 9 never existed on db1.
        let mut node = lagging_standalone(&rig, "0-101-450,9-102-7");
        let ctx = RejoinContext {
            config: &config,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let outcome = rejoin_node(
            &ctx,
            &mut node,
            rig.fleet.driver_for(&id("db2"), ""),
            &id("db1"),
            rig.fleet.driver_for(&id("db1"), ""),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RejoinOutcome::Aborted);
        assert_eq!(node.role, NodeRole::Standalone);
        assert!(rig.events.snapshot().iter().any(|e| e.code == "ERR00066"));
        assert_eq!(rig.metrics.snapshot().rejoins, 0);
    }

    #[tokio::test]
    async fn flashback_path_for_divergent_node() {
        let rig = rig();
        let mut config = config();
        config.rejoin_flashback = true;
        let mut node = lagging_standalone(&rig, "0-101-450,9-102-7");
        let ctx = RejoinContext {
            config: &config,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let outcome = rejoin_node(
            &ctx,
            &mut node,
            rig.fleet.driver_for(&id("db2"), ""),
            &id("db1"),
            rig.fleet.driver_for(&id("db1"), ""),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RejoinOutcome::Rejoined(RejoinStrategy::Flashback));
        let scripted = rig.fleet.node("db2:3306").unwrap();
        // Positional resume from the primary's coordinates.
        assert_eq!(scripted.report().master_log_file, Some("bin.000010".to_string()));
    }

    #[tokio::test]
    async fn logical_dump_fallback_when_flashback_unavailable() {
        let rig = rig();
        let mut config = config();
        config.rejoin_dump = true;
        let mut node = lagging_standalone(&rig, "0-101-450,9-102-7");
        // Statement binlogs rule flashback out even if it were enabled.
        rig.fleet
            .node("db2:3306")
            .unwrap()
            .update_report(|r| r.binlog_format = crate::node::BinlogFormat::Statement);
        let ctx = RejoinContext {
            config: &config,
            events: &rig.events,
            metrics: &rig.metrics,
        };
        let outcome = rejoin_node(
            &ctx,
            &mut node,
            rig.fleet.driver_for(&id("db2"), ""),
            &id("db1"),
            rig.fleet.driver_for(&id("db1"), ""),
        )
        .await
        .unwrap();
        assert_eq!(outcome, RejoinOutcome::Rejoined(RejoinStrategy::LogicalDump));
        assert!(rig.events.snapshot().iter().any(|e| e.code == "WARN0075"));
    }
}
