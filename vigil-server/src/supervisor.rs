//! Supervisor: owns the set of cluster monitors, dispatches operator and
//! configuration commands to them, and runs the peer heartbeat loop that
//! feeds the shared arbitration state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use vigil_shared::arbitration::{evaluate_peers, Arbitrator, SharedArbitrationState};
use vigil_shared::config::ClusterConfig;
use vigil_shared::driver::NodeDriverFactory;
use vigil_shared::events::{EventOrigin, EventRing, Severity};
use vigil_shared::exception::{VigilError, VigilResult};
use vigil_shared::metrics::MonitorMetrics;
use vigil_shared::monitor::{ClusterMonitor, ClusterView, MonitorHandle};
use vigil_shared::node::NodeId;
use vigil_shared::proxy::ProxyDriver;

use crate::arbitration::{ExternalArbitrator, PeerClient};

/// Process-level configuration for one controller.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub bind_address: String,
    pub port: u16,
    /// Shared secret carried in heartbeats; peers with a different secret
    /// are ignored.
    pub secret: String,
    /// This controller's identity in arbitration.
    pub uid: u64,
    pub peer_hosts: Vec<String>,
    pub arbitrator_hosts: Vec<String>,
    pub heartbeat_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 10001,
            secret: String::new(),
            uid: 1,
            peer_hosts: Vec::new(),
            arbitrator_hosts: Vec::new(),
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

struct ClusterEntry {
    handle: MonitorHandle,
    task: JoinHandle<()>,
}

/// One supervisor per controller process. Cluster monitors run as
/// independent tasks; the registry here is the only shared mutable map.
pub struct Supervisor {
    pub uuid: Uuid,
    config: SupervisorConfig,
    clusters: Mutex<BTreeMap<String, ClusterEntry>>,
    events: Arc<EventRing>,
    metrics: Arc<MonitorMetrics>,
    arbitration: Arc<SharedArbitrationState>,
    peer_client: PeerClient,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        let peer_client = PeerClient::new(config.heartbeat_interval * 4, config.secret.clone());
        Arc::new(Self {
            uuid: Uuid::new_v4(),
            config,
            clusters: Mutex::new(BTreeMap::new()),
            events: Arc::new(EventRing::default()),
            metrics: Arc::new(MonitorMetrics::new()),
            arbitration: Arc::new(SharedArbitrationState::default()),
            peer_client,
        })
    }

    pub fn events(&self) -> Arc<EventRing> {
        Arc::clone(&self.events)
    }

    pub fn metrics(&self) -> Arc<MonitorMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn arbitration(&self) -> Arc<SharedArbitrationState> {
        Arc::clone(&self.arbitration)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start monitoring a cluster. A configuration error leaves the
    /// cluster out of the registry with a terminal event; it never takes
    /// the process down.
    pub async fn add_cluster(
        self: &Arc<Self>,
        config: ClusterConfig,
        driver_factory: Arc<dyn NodeDriverFactory>,
        proxy_drivers: Vec<Arc<dyn ProxyDriver>>,
    ) -> VigilResult<()> {
        let name = config.name.clone();
        let arbitrator: Option<Arc<dyn Arbitrator>> = if config.arbitration
            && !self.config.arbitrator_hosts.is_empty()
        {
            Some(Arc::new(ExternalArbitrator::new(
                self.config.arbitrator_hosts.clone(),
                config.arbitration_deadline(),
                Arc::clone(&self.events),
            )))
        } else {
            None
        };

        let (monitor, handle) = match ClusterMonitor::new(
            config,
            driver_factory,
            proxy_drivers,
            Arc::clone(&self.events),
            Arc::clone(&self.metrics),
            Arc::clone(&self.arbitration),
            arbitrator,
        ) {
            Ok(built) => built,
            Err(e) => {
                error!(cluster = %name, "cluster rejected at boot: {e}");
                self.events.emit(
                    &name,
                    EventOrigin::Cluster,
                    Severity::Error,
                    "ERR00021",
                    format!("cluster paused at boot: {e}"),
                );
                return Err(e);
            }
        };

        let task = tokio::spawn(monitor.run());
        let mut clusters = self.clusters.lock().await;
        if let Some(previous) = clusters.insert(name.clone(), ClusterEntry { handle, task }) {
            previous.task.abort();
        }
        info!(cluster = %name, "cluster registered");
        Ok(())
    }

    /// Whole-object config swap for a running cluster.
    pub async fn update_cluster(&self, name: &str, config: ClusterConfig) -> VigilResult<()> {
        let clusters = self.clusters.lock().await;
        let entry = clusters.get(name).ok_or_else(|| VigilError::ClusterNotFound {
            cluster: name.to_string(),
        })?;
        entry.handle.update_config(config).await
    }

    pub async fn request_switchover(
        &self,
        name: &str,
        target: Option<NodeId>,
    ) -> VigilResult<()> {
        let clusters = self.clusters.lock().await;
        let entry = clusters.get(name).ok_or_else(|| VigilError::ClusterNotFound {
            cluster: name.to_string(),
        })?;
        entry.handle.request_switchover(target).await
    }

    pub async fn set_maintenance(&self, name: &str, node: NodeId) -> VigilResult<()> {
        let clusters = self.clusters.lock().await;
        let entry = clusters.get(name).ok_or_else(|| VigilError::ClusterNotFound {
            cluster: name.to_string(),
        })?;
        entry.handle.set_maintenance(node).await
    }

    pub async fn pause_cluster(&self, name: &str) -> VigilResult<()> {
        let clusters = self.clusters.lock().await;
        let entry = clusters.get(name).ok_or_else(|| VigilError::ClusterNotFound {
            cluster: name.to_string(),
        })?;
        entry.handle.pause().await
    }

    pub async fn resume_cluster(&self, name: &str) -> VigilResult<()> {
        let clusters = self.clusters.lock().await;
        let entry = clusters.get(name).ok_or_else(|| VigilError::ClusterNotFound {
            cluster: name.to_string(),
        })?;
        entry.handle.resume().await
    }

    /// Latest per-cluster views, for the API surface and heartbeats.
    pub async fn views(&self) -> Vec<ClusterView> {
        let clusters = self.clusters.lock().await;
        clusters.values().map(|entry| entry.handle.view()).collect()
    }

    pub async fn view(&self, name: &str) -> Option<ClusterView> {
        let clusters = self.clusters.lock().await;
        clusters.get(name).map(|entry| entry.handle.view())
    }

    /// Heartbeat payload served to peers for `cluster`.
    pub async fn heartbeat_for(&self, cluster: Option<&str>) -> Option<vigil_shared::Heartbeat> {
        let views = self.views().await;
        let view = match cluster {
            Some(name) => views.into_iter().find(|v| v.name == name),
            None => views.into_iter().next(),
        }?;
        Some(view.heartbeat(
            &self.config.secret,
            self.config.uid,
            self.arbitration.is_standby(),
        ))
    }

    /// Peer negotiation round: one heartbeat GET per configured peer, then
    /// the split-brain and reachability flags are published to monitors.
    pub async fn heartbeat_round(&self) {
        if self.config.peer_hosts.is_empty() {
            return;
        }
        let was_split = self.arbitration.is_split_brain();
        let mut any_conflict = false;
        let mut all_unreachable = true;

        for view in self.views().await {
            let mut peers = Vec::with_capacity(self.config.peer_hosts.len());
            for peer in &self.config.peer_hosts {
                peers.push(self.peer_client.fetch(peer).await);
            }
            let (split, unreachable) =
                evaluate_peers(&view.name, view.primary.as_deref(), &peers);
            if split {
                any_conflict = true;
                if !was_split {
                    self.events.emit(
                        &view.name,
                        EventOrigin::Cluster,
                        Severity::Warn,
                        "WARN0079",
                        "peer reports a different primary",
                    );
                }
            }
            if !unreachable {
                all_unreachable = false;
            }
        }

        self.arbitration.set_split_brain(any_conflict);
        self.arbitration.set_peers_unreachable(all_unreachable);

        // Split brain without an external arbitrator: stand down rather
        // than risk a double promotion.
        if any_conflict && self.config.arbitrator_hosts.is_empty() {
            if !self.arbitration.is_standby() {
                warn!("split brain with no arbitrator configured, switching to standby");
                self.events.emit(
                    "controller",
                    EventOrigin::Cluster,
                    Severity::Warn,
                    "WARN0080",
                    "standing by until the peer conflict clears",
                );
            }
            self.arbitration.set_standby(true);
        } else if !any_conflict {
            self.arbitration.set_standby(false);
        }
    }

    /// Heartbeat loop, spawned alongside the API server.
    pub async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.heartbeat_round().await;
        }
    }

    /// Stop every cluster monitor and wait for each to reach its safe
    /// quiescent point.
    pub async fn stop(&self) {
        let mut clusters = self.clusters.lock().await;
        let entries: Vec<(String, ClusterEntry)> = std::mem::take(&mut *clusters)
            .into_iter()
            .collect();
        drop(clusters);
        for (name, entry) in entries {
            if entry.handle.stop().await.is_err() {
                entry.task.abort();
            }
            if let Err(e) = entry.task.await {
                if !e.is_cancelled() {
                    warn!(cluster = %name, "monitor task ended abnormally: {e}");
                }
            }
            info!(cluster = %name, "cluster monitor shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_shared::driver::scripted::ScriptedFleet;
    use vigil_shared::gtid::BinlogPos;

    fn cluster_config(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            hosts: vec!["db1:3306".into(), "db2:3306".into()],
            ..ClusterConfig::default()
        }
    }

    fn fleet() -> Arc<ScriptedFleet> {
        let fleet = Arc::new(ScriptedFleet::new());
        fleet.add_primary(
            NodeId::new("c1", "db1", 3306),
            101,
            "0-101-10",
            BinlogPos::new("bin.000001", 4),
        );
        fleet.add_replica(
            NodeId::new("c1", "db2", 3306),
            102,
            NodeId::new("c1", "db1", 3306),
            "0-101-10",
            BinlogPos::new("bin.000001", 4),
        );
        fleet
    }

    #[tokio::test]
    async fn add_and_stop_cluster() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        supervisor
            .add_cluster(cluster_config("c1"), fleet(), vec![])
            .await
            .unwrap();
        assert_eq!(supervisor.views().await.len(), 1);
        supervisor.stop().await;
        assert!(supervisor.views().await.is_empty());
    }

    #[tokio::test]
    async fn bad_cluster_config_is_contained() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        let bad = ClusterConfig {
            name: "broken".to_string(),
            hosts: vec!["not-a-host-port".into()],
            ..ClusterConfig::default()
        };
        let err = supervisor.add_cluster(bad, fleet(), vec![]).await.unwrap_err();
        assert!(matches!(err, VigilError::ConfigurationError(_)));
        assert!(supervisor.views().await.is_empty());
        assert!(supervisor
            .events()
            .snapshot()
            .iter()
            .any(|e| e.cluster == "broken"));
    }

    #[tokio::test]
    async fn unknown_cluster_commands_fail() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        let err = supervisor.request_switchover("ghost", None).await.unwrap_err();
        assert!(matches!(err, VigilError::ClusterNotFound { .. }));
    }

    #[tokio::test]
    async fn heartbeat_payload_reflects_cluster() {
        let supervisor = Supervisor::new(SupervisorConfig {
            secret: "s3cret".to_string(),
            uid: 7,
            ..SupervisorConfig::default()
        });
        supervisor
            .add_cluster(cluster_config("c1"), fleet(), vec![])
            .await
            .unwrap();
        let heartbeat = supervisor.heartbeat_for(Some("c1")).await.unwrap();
        assert_eq!(heartbeat.cluster, "c1");
        assert_eq!(heartbeat.secret, "s3cret");
        assert_eq!(heartbeat.uid, 7);
        supervisor.stop().await;
    }
}
