//! In-memory fleet used when no vendor node drivers are linked into the
//! build: the first configured host boots as the writable primary, the
//! rest as replicas at the same coordinates.

use std::sync::Arc;

use vigil_shared::config::ClusterConfig;
use vigil_shared::driver::scripted::ScriptedFleet;
use vigil_shared::gtid::BinlogPos;
use vigil_shared::node::NodeId;
use vigil_shared::proxy::scripted::ScriptedProxy;
use vigil_shared::proxy::ProxyDriver;

pub fn scripted_fleet_for(config: &ClusterConfig) -> Arc<ScriptedFleet> {
    let fleet = Arc::new(ScriptedFleet::new());
    let mut primary: Option<NodeId> = None;
    for (index, host) in config.hosts.iter().enumerate() {
        let Some((host_name, port)) = host
            .rsplit_once(':')
            .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h, p)))
        else {
            continue;
        };
        let id = NodeId::new(&config.name, host_name, port);
        let server_id = 100 + index as u64;
        match &primary {
            None => {
                fleet.add_primary(id.clone(), server_id, "0-100-100", BinlogPos::new("bin.000001", 1000));
                primary = Some(id);
            }
            Some(primary_id) => {
                let replica = fleet.add_replica(
                    id,
                    server_id,
                    primary_id.clone(),
                    "0-100-100",
                    BinlogPos::new("bin.000001", 1000),
                );
                // Heartbeats flow while the simulated primary is up.
                replica.advance_heartbeats(1);
            }
        }
    }
    fleet
}

pub fn scripted_proxies_for(config: &ClusterConfig) -> Vec<Arc<dyn ProxyDriver>> {
    config
        .proxies
        .iter()
        .map(|endpoint| {
            Arc::new(ScriptedProxy::new(format!(
                "{}-{}:{}",
                endpoint.kind, endpoint.host, endpoint.port
            ))) as Arc<dyn ProxyDriver>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_host_becomes_primary() {
        let config = ClusterConfig {
            name: "c1".to_string(),
            hosts: vec!["db1:3306".into(), "db2:3306".into()],
            ..ClusterConfig::default()
        };
        let fleet = scripted_fleet_for(&config);
        let primary = fleet.node("db1:3306").unwrap();
        assert!(!primary.report().read_only);
        let replica = fleet.node("db2:3306").unwrap();
        assert_eq!(
            replica.report().upstream.map(|u| u.address()),
            Some("db1:3306".to_string())
        );
    }
}
