//! Proxy controller.
//!
//! Front-door routers are driven through the [`ProxyDriver`] capability
//! set; vendors are opaque to the core. After any topology change the
//! controller converges every proxy onto the backend set derived from the
//! latest snapshot. `refresh` must be idempotent: a converged proxy takes
//! zero further admin commands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::events::{EventOrigin, EventRing, Severity};
use crate::exception::VigilResult;
use crate::node::NodeId;
use crate::topology::TopologySnapshot;

/// Routing target derived from a topology snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSet {
    pub writer: Option<NodeId>,
    pub readers: Vec<NodeId>,
}

impl BackendSet {
    /// Map a snapshot onto backends: the primary takes writes, healthy
    /// replicas outside maintenance take reads. The primary serves reads
    /// only under `read-on-master`.
    pub fn from_snapshot(snapshot: &TopologySnapshot, config: &ClusterConfig) -> Self {
        let writer = snapshot.primary.clone();
        let mut readers: Vec<NodeId> = snapshot
            .healthy_replicas()
            .into_iter()
            .map(|n| n.id.clone())
            .collect();
        if config.read_on_master {
            if let Some(primary) = &writer {
                readers.push(primary.clone());
            }
        }
        Self { writer, readers }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyState {
    Running,
    Suspect,
    Failed,
}

/// Capability set each vendor driver implements.
#[async_trait]
pub trait ProxyDriver: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> &'static str;

    async fn init(&self, backends: &BackendSet) -> VigilResult<()>;

    /// Converge the proxy onto `backends`. Returns the number of mutating
    /// admin commands issued; zero when already converged.
    async fn refresh(&self, backends: &BackendSet) -> VigilResult<u32>;

    /// Drain `node` (maintenance-soft), then take it out (maintenance-hard).
    async fn set_maintenance(&self, node: &NodeId, hard: bool) -> VigilResult<()>;

    /// Single-shot reaction to a cluster failover; drivers without live
    /// reconfiguration may restart their process here.
    async fn failover(&self, backends: &BackendSet) -> VigilResult<()>;
}

struct ProxyHandle {
    driver: Arc<dyn ProxyDriver>,
    state: ProxyState,
    prev_state: ProxyState,
    fail_count: u32,
}

/// Per-cluster set of proxies, driven from the monitor tick and the
/// failover executor.
pub struct ProxyController {
    cluster: String,
    proxies: Vec<ProxyHandle>,
}

impl ProxyController {
    pub fn new(cluster: impl Into<String>, drivers: Vec<Arc<dyn ProxyDriver>>) -> Self {
        Self {
            cluster: cluster.into(),
            proxies: drivers
                .into_iter()
                .map(|driver| ProxyHandle {
                    driver,
                    state: ProxyState::Suspect,
                    prev_state: ProxyState::Suspect,
                    fail_count: 0,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn states(&self) -> Vec<(String, ProxyState)> {
        self.proxies
            .iter()
            .map(|p| (p.driver.id(), p.state))
            .collect()
    }

    pub async fn init_all(&mut self, backends: &BackendSet, events: &EventRing) {
        for proxy in &mut self.proxies {
            if let Err(e) = proxy.driver.init(backends).await {
                events.emit(
                    &self.cluster,
                    EventOrigin::Proxy(proxy.driver.id()),
                    Severity::Error,
                    "ERR00050",
                    e.to_string(),
                );
            }
        }
    }

    /// Refresh every proxy against the target backends, maintaining the
    /// suspect/failed progression on driver errors.
    pub async fn refresh_all(
        &mut self,
        backends: &BackendSet,
        config: &ClusterConfig,
        events: &EventRing,
    ) {
        for proxy in &mut self.proxies {
            match proxy.driver.refresh(backends).await {
                Ok(_commands) => {
                    proxy.fail_count = 0;
                    proxy.set_state(ProxyState::Running);
                }
                Err(e) => {
                    proxy.fail_count = proxy.fail_count.saturating_add(1);
                    if proxy.fail_count >= config.max_fail {
                        if proxy.fail_count == config.max_fail {
                            events.emit(
                                &self.cluster,
                                EventOrigin::Proxy(proxy.driver.id()),
                                Severity::Error,
                                "ERR00050",
                                format!("declaring proxy failed: {e}"),
                            );
                        }
                        proxy.set_state(ProxyState::Failed);
                    } else {
                        proxy.set_state(ProxyState::Suspect);
                    }
                }
            }
        }
    }

    /// One-shot proxy reconfiguration after a primary change.
    pub async fn failover_all(&mut self, backends: &BackendSet, events: &EventRing) {
        for proxy in &mut self.proxies {
            if let Err(e) = proxy.driver.failover(backends).await {
                events.emit(
                    &self.cluster,
                    EventOrigin::Proxy(proxy.driver.id()),
                    Severity::Error,
                    "ERR00050",
                    format!("failover sync failed: {e}"),
                );
            }
        }
    }

    /// Drain a backend on every proxy, then take it hard-down.
    pub async fn set_maintenance(&mut self, node: &NodeId, events: &EventRing) {
        for proxy in &mut self.proxies {
            for hard in [false, true] {
                if let Err(e) = proxy.driver.set_maintenance(node, hard).await {
                    events.emit(
                        &self.cluster,
                        EventOrigin::Proxy(proxy.driver.id()),
                        Severity::Error,
                        "ERR00050",
                        format!("maintenance on {node}: {e}"),
                    );
                }
            }
        }
    }
}

impl ProxyHandle {
    fn set_state(&mut self, state: ProxyState) {
        if self.state != state {
            self.prev_state = self.state;
            self.state = state;
        }
    }
}

pub mod scripted {
    //! In-memory proxy driver recording the admin commands it would issue.

    use super::*;
    use crate::exception::VigilError;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct ScriptedProxyState {
        applied: Option<BackendSet>,
        refresh_commands: Vec<u32>,
        failover_calls: u32,
        maintenance_calls: Vec<(NodeId, bool)>,
        failing: bool,
    }

    #[derive(Clone)]
    pub struct ScriptedProxy {
        id: String,
        state: Arc<Mutex<ScriptedProxyState>>,
    }

    impl ScriptedProxy {
        pub fn new(id: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                state: Arc::new(Mutex::new(ScriptedProxyState::default())),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.lock().failing = failing;
        }

        /// Command counts per refresh call, in order.
        pub fn refresh_commands(&self) -> Vec<u32> {
            self.lock().refresh_commands.clone()
        }

        pub fn failover_calls(&self) -> u32 {
            self.lock().failover_calls
        }

        pub fn maintenance_calls(&self) -> Vec<(NodeId, bool)> {
            self.lock().maintenance_calls.clone()
        }

        pub fn applied(&self) -> Option<BackendSet> {
            self.lock().applied.clone()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedProxyState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait]
    impl ProxyDriver for ScriptedProxy {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn init(&self, backends: &BackendSet) -> VigilResult<()> {
            self.lock().applied = Some(backends.clone());
            Ok(())
        }

        async fn refresh(&self, backends: &BackendSet) -> VigilResult<u32> {
            let mut state = self.lock();
            if state.failing {
                return Err(VigilError::ProxyError {
                    proxy_id: self.id.clone(),
                    reason: "admin port unreachable".to_string(),
                });
            }
            // One command per backend that differs from the applied set.
            let commands = match &state.applied {
                Some(applied) if applied == backends => 0,
                Some(applied) => {
                    let writer_changed = applied.writer != backends.writer;
                    let reader_diff = backends
                        .readers
                        .iter()
                        .filter(|r| !applied.readers.contains(r))
                        .count()
                        + applied
                            .readers
                            .iter()
                            .filter(|r| !backends.readers.contains(r))
                            .count();
                    writer_changed as u32 + reader_diff as u32
                }
                None => 1 + backends.readers.len() as u32,
            };
            state.applied = Some(backends.clone());
            state.refresh_commands.push(commands);
            Ok(commands)
        }

        async fn set_maintenance(&self, node: &NodeId, hard: bool) -> VigilResult<()> {
            self.lock().maintenance_calls.push((node.clone(), hard));
            Ok(())
        }

        async fn failover(&self, backends: &BackendSet) -> VigilResult<()> {
            let mut state = self.lock();
            if state.failing {
                return Err(VigilError::ProxyError {
                    proxy_id: self.id.clone(),
                    reason: "admin port unreachable".to_string(),
                });
            }
            state.failover_calls += 1;
            state.applied = Some(backends.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedProxy;
    use super::*;

    fn id(host: &str) -> NodeId {
        NodeId::new("c1", host, 3306)
    }

    fn backends(writer: &str, readers: &[&str]) -> BackendSet {
        BackendSet {
            writer: Some(id(writer)),
            readers: readers.iter().map(|r| id(r)).collect(),
        }
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            name: "c1".to_string(),
            hosts: vec!["db1:3306".into()],
            max_fail: 3,
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn second_refresh_with_same_backends_is_free() {
        let proxy = ScriptedProxy::new("px1");
        let mut controller = ProxyController::new("c1", vec![Arc::new(proxy.clone())]);
        let events = EventRing::new(16);
        let target = backends("db1", &["db2", "db3"]);

        controller.refresh_all(&target, &config(), &events).await;
        controller.refresh_all(&target, &config(), &events).await;

        let commands = proxy.refresh_commands();
        assert!(commands[0] > 0);
        assert_eq!(commands[1], 0);
    }

    #[tokio::test]
    async fn fail_count_progression_to_failed() {
        let proxy = ScriptedProxy::new("px1");
        proxy.set_failing(true);
        let mut controller = ProxyController::new("c1", vec![Arc::new(proxy.clone())]);
        let events = EventRing::new(16);
        let target = backends("db1", &["db2"]);
        let config = config();

        controller.refresh_all(&target, &config, &events).await;
        controller.refresh_all(&target, &config, &events).await;
        assert_eq!(controller.states()[0].1, ProxyState::Suspect);

        controller.refresh_all(&target, &config, &events).await;
        assert_eq!(controller.states()[0].1, ProxyState::Failed);
        assert!(events.snapshot().iter().any(|e| e.code == "ERR00050"));

        // Recovery clears the counter.
        proxy.set_failing(false);
        controller.refresh_all(&target, &config, &events).await;
        assert_eq!(controller.states()[0].1, ProxyState::Running);
    }

    #[tokio::test]
    async fn maintenance_goes_soft_then_hard() {
        let proxy = ScriptedProxy::new("px1");
        let mut controller = ProxyController::new("c1", vec![Arc::new(proxy.clone())]);
        let events = EventRing::new(16);

        controller.set_maintenance(&id("db2"), &events).await;
        let calls = proxy.maintenance_calls();
        assert_eq!(calls, vec![(id("db2"), false), (id("db2"), true)]);
    }

    #[tokio::test]
    async fn failover_is_single_shot_per_event() {
        let proxy = ScriptedProxy::new("px1");
        let mut controller = ProxyController::new("c1", vec![Arc::new(proxy.clone())]);
        let events = EventRing::new(16);

        controller
            .failover_all(&backends("db2", &["db3"]), &events)
            .await;
        assert_eq!(proxy.failover_calls(), 1);
        assert_eq!(proxy.applied(), Some(backends("db2", &["db3"])));
    }
}
