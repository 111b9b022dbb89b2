//! Controller configuration file.
//!
//! One TOML file: a `[server]` table for the process, a `[default]` table
//! applied to every cluster, and one `[clusters.<name>]` table each.
//! Values flow into the layered key/value model from `vigil-shared`; an
//! optional saved-overrides file supplies the `saved` layer, and `-o`
//! command-line pairs the top layer. Discovery, git sync and secret
//! decryption happen outside this process.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use vigil_shared::config::{ClusterConfig, ConfigLayers};
use vigil_shared::exception::{VigilError, VigilResult};

use crate::supervisor::SupervisorConfig;

#[derive(Debug)]
pub struct Settings {
    pub supervisor: SupervisorConfig,
    pub clusters: Vec<ClusterConfig>,
}

fn value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

fn table_to_strings(table: &toml::value::Table) -> BTreeMap<String, String> {
    table
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect()
}

fn parse_override(pair: &str) -> VigilResult<(String, String)> {
    pair.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| {
            VigilError::configuration(format!("override {pair:?} is not key=value"))
        })
}

/// Load and resolve the controller configuration.
pub fn load(
    path: &Path,
    saved_path: Option<&Path>,
    overrides: &[String],
) -> VigilResult<Settings> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        VigilError::configuration(format!("read {}: {e}", path.display()))
    })?;
    let document: toml::Value = raw.parse().map_err(|e| {
        VigilError::configuration(format!("parse {}: {e}", path.display()))
    })?;

    let saved_document: Option<toml::Value> = match saved_path {
        Some(saved) if saved.exists() => {
            let raw = std::fs::read_to_string(saved).map_err(|e| {
                VigilError::configuration(format!("read {}: {e}", saved.display()))
            })?;
            Some(raw.parse().map_err(|e| {
                VigilError::configuration(format!("parse {}: {e}", saved.display()))
            })?)
        }
        _ => None,
    };

    let supervisor = supervisor_config(document.get("server"))?;

    let default_layer = document
        .get("default")
        .and_then(|v| v.as_table())
        .map(table_to_strings)
        .unwrap_or_default();

    let command_line: BTreeMap<String, String> = overrides
        .iter()
        .map(|pair| parse_override(pair))
        .collect::<VigilResult<_>>()?;

    let cluster_tables = document
        .get("clusters")
        .and_then(|v| v.as_table())
        .cloned()
        .unwrap_or_default();
    if cluster_tables.is_empty() {
        return Err(VigilError::configuration(
            "no [clusters.<name>] sections found",
        ));
    }

    let mut clusters = Vec::with_capacity(cluster_tables.len());
    for (name, value) in &cluster_tables {
        let table = value.as_table().ok_or_else(|| {
            VigilError::configuration(format!("[clusters.{name}] is not a table"))
        })?;
        let saved = saved_document
            .as_ref()
            .and_then(|d| d.get("clusters"))
            .and_then(|v| v.get(name.as_str()))
            .and_then(|v| v.as_table())
            .map(table_to_strings)
            .unwrap_or_default();
        let layers = ConfigLayers {
            default: default_layer.clone(),
            cluster: table_to_strings(table),
            saved,
            command_line: command_line.clone(),
        };
        clusters.push(ClusterConfig::from_resolved(name, &layers.resolve())?);
    }

    Ok(Settings {
        supervisor,
        clusters,
    })
}

fn supervisor_config(value: Option<&toml::Value>) -> VigilResult<SupervisorConfig> {
    let mut config = SupervisorConfig::default();
    let Some(table) = value.and_then(|v| v.as_table()) else {
        return Ok(config);
    };
    if let Some(bind) = table.get("bind").and_then(|v| v.as_str()) {
        config.bind_address = bind.to_string();
    }
    if let Some(port) = table.get("port").and_then(|v| v.as_integer()) {
        config.port = u16::try_from(port)
            .map_err(|_| VigilError::configuration(format!("server.port {port} out of range")))?;
    }
    if let Some(secret) = table.get("secret").and_then(|v| v.as_str()) {
        config.secret = secret.to_string();
    }
    if let Some(uid) = table.get("uid").and_then(|v| v.as_integer()) {
        config.uid = uid as u64;
    }
    if let Some(peers) = table.get("peers").and_then(|v| v.as_array()) {
        config.peer_hosts = peers
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect();
    }
    if let Some(hosts) = table.get("arbitrators").and_then(|v| v.as_array()) {
        config.arbitrator_hosts = hosts
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect();
    }
    if let Some(interval) = table.get("heartbeat-interval").and_then(|v| v.as_integer()) {
        config.heartbeat_interval = Duration::from_secs(interval.max(1) as u64);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vigil_shared::config::FailoverMode;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const BASE: &str = r#"
[server]
bind = "127.0.0.1"
port = 10005
secret = "s3cret"
uid = 3
peers = ["peer1:10001"]

[default]
maxdelay = 15
failover-mode = "manual"

[clusters.c1]
db-servers-hosts = "db1:3306,db2:3306"
db-servers-credential = "repl:pw"
failover-mode = "automatic"

[clusters.c2]
db-servers-hosts = "db9:3306,db10:3306"
db-servers-credential = "repl:pw"
"#;

    #[test]
    fn loads_default_and_cluster_layers() {
        let file = write_config(BASE);
        let settings = load(file.path(), None, &[]).unwrap();
        assert_eq!(settings.supervisor.port, 10005);
        assert_eq!(settings.supervisor.peer_hosts, vec!["peer1:10001"]);

        let c1 = settings.clusters.iter().find(|c| c.name == "c1").unwrap();
        assert_eq!(c1.failover_mode, FailoverMode::Automatic);
        assert_eq!(c1.failover_max_slave_delay, 15);

        let c2 = settings.clusters.iter().find(|c| c.name == "c2").unwrap();
        assert_eq!(c2.failover_mode, FailoverMode::Manual);
        assert_eq!(c2.hosts, vec!["db9:3306", "db10:3306"]);
    }

    #[test]
    fn saved_layer_respects_immutability() {
        let file = write_config(BASE);
        let saved = write_config(
            r#"
[clusters.c1]
db-servers-hosts = "evil:3306"
proxy-servers-hosts = "rogue-lb:3307"
maxdelay = 60
"#,
        );
        let settings = load(file.path(), Some(saved.path()), &[]).unwrap();
        let c1 = settings.clusters.iter().find(|c| c.name == "c1").unwrap();
        // Immutable keys kept out, even one no lower layer ever set;
        // dynamic key overridden.
        assert_eq!(c1.hosts, vec!["db1:3306", "db2:3306"]);
        assert!(c1.proxies.is_empty());
        assert_eq!(c1.failover_max_slave_delay, 60);
    }

    #[test]
    fn command_line_overrides_everything() {
        let file = write_config(BASE);
        let settings = load(file.path(), None, &["interactive=true".to_string()]).unwrap();
        for cluster in &settings.clusters {
            assert_eq!(cluster.failover_mode, FailoverMode::Manual);
        }
    }

    #[test]
    fn missing_clusters_section_is_fatal() {
        let file = write_config("[server]\nport = 10001\n");
        assert!(load(file.path(), None, &[]).is_err());
    }

    #[test]
    fn bad_override_is_rejected() {
        let file = write_config(BASE);
        let err = load(file.path(), None, &["not-a-pair".to_string()]).unwrap_err();
        assert!(matches!(err, VigilError::ConfigurationError(_)));
    }
}
