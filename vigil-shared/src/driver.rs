//! Node driver capability boundary.
//!
//! The core never speaks a vendor wire protocol; it drives nodes through
//! [`NodeDriver`]. Vendor implementations live outside this crate. The
//! [`scripted`] driver is an in-memory node used by the test suites and by
//! local simulation.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::exception::VigilResult;
use crate::gtid::{BinlogPos, GtidSet, ReplicationCoord};
use crate::node::{NodeId, ProbeReport};

/// Capability set the executor and monitor need from a database node.
#[async_trait]
pub trait NodeDriver: Send + Sync {
    /// One observation round-trip. Errors are absorbed into the node's
    /// fail count, never propagated past the monitor.
    async fn probe(&self) -> VigilResult<ProbeReport>;

    /// Make this node writable and detach it from any upstream.
    async fn promote(&self) -> VigilResult<()>;

    /// Make this node read-only.
    async fn demote(&self) -> VigilResult<()>;

    async fn set_replication_source(
        &self,
        source: &NodeId,
        coord: &ReplicationCoord,
    ) -> VigilResult<()>;

    async fn start_replication(&self) -> VigilResult<()>;

    async fn stop_replication(&self) -> VigilResult<()>;

    /// Kill client queries running longer than `older_than`.
    async fn kill_long_queries(&self, older_than: Duration) -> VigilResult<()>;

    /// Flush logs and block further writes; used during switchover
    /// quiescence.
    async fn flush_and_block_writes(&self) -> VigilResult<()>;

    async fn gtid_set(&self) -> VigilResult<GtidSet>;

    async fn position(&self) -> VigilResult<BinlogPos>;
}

/// Builds a driver for each configured node. Vendor selection happens
/// behind this seam.
pub trait NodeDriverFactory: Send + Sync {
    fn driver_for(&self, id: &NodeId, credential: &str) -> Arc<dyn NodeDriver>;
}

pub mod scripted {
    //! In-memory nodes with scriptable reachability and replication state.

    use super::*;
    use crate::exception::VigilError;
    use crate::node::BinlogFormat;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default, Clone)]
    pub struct CallCounts {
        pub promotes: u32,
        pub demotes: u32,
        pub source_changes: u32,
        pub replication_starts: u32,
        pub replication_stops: u32,
        pub long_query_kills: u32,
        pub write_blocks: u32,
    }

    struct ScriptedState {
        reachable: bool,
        report: ProbeReport,
        fail_replication_start: bool,
        calls: CallCounts,
    }

    /// A single scripted node. Clones share state.
    #[derive(Clone)]
    pub struct ScriptedNode {
        id: NodeId,
        state: Arc<Mutex<ScriptedState>>,
    }

    impl ScriptedNode {
        pub fn new(id: NodeId, report: ProbeReport) -> Self {
            Self {
                id,
                state: Arc::new(Mutex::new(ScriptedState {
                    reachable: true,
                    report,
                    fail_replication_start: false,
                    calls: CallCounts::default(),
                })),
            }
        }

        pub fn id(&self) -> &NodeId {
            &self.id
        }

        pub fn set_reachable(&self, reachable: bool) {
            self.lock().reachable = reachable;
        }

        /// Make the next `start_replication` fail, as a node with broken
        /// credentials or purged binlogs would.
        pub fn fail_next_replication_start(&self, fail: bool) {
            self.lock().fail_replication_start = fail;
        }

        pub fn update_report(&self, mutate: impl FnOnce(&mut ProbeReport)) {
            mutate(&mut self.lock().report);
        }

        /// Simulate upstream write progress reaching this replica.
        pub fn advance_heartbeats(&self, by: u64) {
            let mut state = self.lock();
            state.report.heartbeats_received += by;
        }

        pub fn report(&self) -> ProbeReport {
            self.lock().report.clone()
        }

        pub fn calls(&self) -> CallCounts {
            self.lock().calls.clone()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait]
    impl NodeDriver for ScriptedNode {
        async fn probe(&self) -> VigilResult<ProbeReport> {
            let state = self.lock();
            if !state.reachable {
                return Err(VigilError::probe(self.id.to_string(), "connection refused"));
            }
            Ok(state.report.clone())
        }

        async fn promote(&self) -> VigilResult<()> {
            let mut state = self.lock();
            state.calls.promotes += 1;
            state.report.read_only = false;
            state.report.upstream = None;
            state.report.io_thread_running = false;
            state.report.sql_thread_running = false;
            state.report.lag_seconds = None;
            state.report.master_log_file = None;
            Ok(())
        }

        async fn demote(&self) -> VigilResult<()> {
            let mut state = self.lock();
            state.calls.demotes += 1;
            state.report.read_only = true;
            Ok(())
        }

        async fn set_replication_source(
            &self,
            source: &NodeId,
            coord: &ReplicationCoord,
        ) -> VigilResult<()> {
            let mut state = self.lock();
            state.calls.source_changes += 1;
            state.report.upstream = Some(source.clone());
            if let ReplicationCoord::Positional(pos) = coord {
                state.report.master_log_file = Some(pos.file.clone());
            } else {
                state.report.master_log_file = Some(state.report.position.file.clone());
            }
            Ok(())
        }

        async fn start_replication(&self) -> VigilResult<()> {
            let mut state = self.lock();
            state.calls.replication_starts += 1;
            if state.fail_replication_start {
                return Err(VigilError::probe(
                    self.id.to_string(),
                    "replication authentication failed",
                ));
            }
            state.report.io_thread_running = true;
            state.report.sql_thread_running = true;
            state.report.lag_seconds = Some(0);
            Ok(())
        }

        async fn stop_replication(&self) -> VigilResult<()> {
            let mut state = self.lock();
            state.calls.replication_stops += 1;
            state.report.io_thread_running = false;
            state.report.sql_thread_running = false;
            Ok(())
        }

        async fn kill_long_queries(&self, _older_than: Duration) -> VigilResult<()> {
            self.lock().calls.long_query_kills += 1;
            Ok(())
        }

        async fn flush_and_block_writes(&self) -> VigilResult<()> {
            let mut state = self.lock();
            state.calls.write_blocks += 1;
            state.report.read_only = true;
            Ok(())
        }

        async fn gtid_set(&self) -> VigilResult<GtidSet> {
            Ok(self.lock().report.gtid.clone())
        }

        async fn position(&self) -> VigilResult<BinlogPos> {
            Ok(self.lock().report.position.clone())
        }
    }

    /// Factory over a fixed set of scripted nodes, keyed by address.
    #[derive(Default)]
    pub struct ScriptedFleet {
        nodes: Mutex<HashMap<String, ScriptedNode>>,
    }

    impl ScriptedFleet {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a healthy primary at `host:port`.
        pub fn add_primary(
            &self,
            id: NodeId,
            server_id: u64,
            gtid: &str,
            position: BinlogPos,
        ) -> ScriptedNode {
            let gtid = GtidSet::parse(gtid).unwrap_or_default();
            let mut report = ProbeReport::primary(server_id, gtid, position);
            report.binlog_format = BinlogFormat::Row;
            self.insert(id, report)
        }

        /// Register a healthy replica of `upstream` at `host:port`.
        pub fn add_replica(
            &self,
            id: NodeId,
            server_id: u64,
            upstream: NodeId,
            gtid: &str,
            position: BinlogPos,
        ) -> ScriptedNode {
            let gtid = GtidSet::parse(gtid).unwrap_or_default();
            let report = ProbeReport::replica(server_id, upstream, gtid, position);
            self.insert(id, report)
        }

        fn insert(&self, id: NodeId, report: ProbeReport) -> ScriptedNode {
            let node = ScriptedNode::new(id.clone(), report);
            self.nodes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.address(), node.clone());
            node
        }

        pub fn node(&self, address: &str) -> Option<ScriptedNode> {
            self.nodes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(address)
                .cloned()
        }
    }

    impl NodeDriverFactory for ScriptedFleet {
        fn driver_for(&self, id: &NodeId, _credential: &str) -> Arc<dyn NodeDriver> {
            let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            let node = nodes
                .entry(id.address())
                .or_insert_with(|| {
                    ScriptedNode::new(
                        id.clone(),
                        ProbeReport::primary(0, GtidSet::new(), BinlogPos::new("bin.000001", 4)),
                    )
                })
                .clone();
            Arc::new(node)
        }
    }
}
