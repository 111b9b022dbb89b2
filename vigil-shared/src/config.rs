//! Per-cluster configuration model.
//!
//! Keys are case-insensitive and may arrive under historical alias names.
//! Each resolved key remembers its origin layer; the `saved` layer (runtime
//! overrides written back by the operator) may not override immutable keys.
//! The monitor receives a fully-resolved immutable `ClusterConfig` per tick;
//! runtime changes arrive as whole-object swaps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::exception::{VigilError, VigilResult};

/// Synonym table honoured when canonicalizing keys. Left side is the
/// historical short form, right side the canonical key.
const ALIASES: &[(&str, &str)] = &[
    ("prefmaster", "db-servers-prefered-master"),
    ("ignore-servers", "db-servers-ignored-hosts"),
    ("maxdelay", "failover-max-slave-delay"),
    ("interactive", "failover-mode"),
    ("gtidcheck", "switchover-at-equal-gtid"),
    ("ticker", "monitoring-ticker"),
    ("failcount", "failover-falsepositive-ping-counter"),
    ("fail-limit", "failover-limit"),
    ("fail-reset-time", "failover-time-limit"),
    ("time-between-failovers", "failover-time-between"),
    ("wait-kill", "switchover-wait-kill"),
    ("wait-trx", "switchover-wait-trx"),
    ("wait-write-query", "switchover-wait-write-query"),
    ("read-on-master", "proxy-read-on-master"),
    ("multimaster", "replication-multi-master"),
    ("multi-tier-slave", "replication-multi-tier-slave"),
];

/// Keys the `saved` layer is forbidden to override. These pin a cluster's
/// identity and connectivity; changing them requires a config merge.
const IMMUTABLE_KEYS: &[&str] = &[
    "db-servers-hosts",
    "db-servers-credential",
    "proxy-servers-hosts",
    "arbitration-peer-hosts",
    "arbitration-external-hosts",
    "cluster-name",
];

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOrigin {
    Default,
    Cluster,
    Saved,
    CommandLine,
}

/// Canonical form of a key: lowercase, aliases resolved.
pub fn canonical_key(key: &str) -> String {
    let lower = key.trim().to_ascii_lowercase();
    for (alias, canonical) in ALIASES {
        if lower == *alias {
            return (*canonical).to_string();
        }
    }
    lower
}

pub fn is_immutable_key(key: &str) -> bool {
    let canonical = canonical_key(key);
    IMMUTABLE_KEYS.contains(&canonical.as_str())
}

/// The four configuration layers, lowest precedence first.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    pub default: BTreeMap<String, String>,
    pub cluster: BTreeMap<String, String>,
    pub saved: BTreeMap<String, String>,
    pub command_line: BTreeMap<String, String>,
}

impl ConfigLayers {
    /// Merge the layers into canonical key -> (value, origin). The saved
    /// layer loses against immutable keys set lower in the stack; the
    /// command line wins over everything.
    pub fn resolve(&self) -> BTreeMap<String, (String, KeyOrigin)> {
        let mut out: BTreeMap<String, (String, KeyOrigin)> = BTreeMap::new();
        for (key, value) in &self.default {
            out.insert(canonical_key(key), (value.clone(), KeyOrigin::Default));
        }
        for (key, value) in &self.cluster {
            out.insert(canonical_key(key), (value.clone(), KeyOrigin::Cluster));
        }
        for (key, value) in &self.saved {
            let canonical = canonical_key(key);
            // Immutable keys never come from the saved layer, not even
            // when no lower layer set them.
            if is_immutable_key(&canonical) {
                continue;
            }
            out.insert(canonical, (value.clone(), KeyOrigin::Saved));
        }
        for (key, value) in &self.command_line {
            out.insert(canonical_key(key), (value.clone(), KeyOrigin::CommandLine));
        }
        out
    }
}

/// `manual` inhibits automatic failover, `automatic` permits it. The
/// historical `interactive = true|false` alias maps to manual|automatic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FailoverMode {
    #[default]
    Manual,
    Automatic,
}

/// One front-door proxy entry from config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub write_port: u16,
    pub read_port: u16,
    pub credential: Option<String>,
}

/// Fully-resolved per-cluster configuration handed to the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    /// `host:port` entries for the database servers.
    pub hosts: Vec<String>,
    /// `user:password` or a path-like secret reference resolved upstream.
    pub credential: String,
    pub proxies: Vec<ProxyEndpoint>,

    pub failover_mode: FailoverMode,
    pub failover_max_slave_delay: u64,
    /// Consecutive missed probes before the primary is declared failed.
    pub failover_falsepositive_ping_counter: u32,
    pub failover_pre_script: Option<String>,
    pub failover_post_script: Option<String>,
    /// Circuit breaker: max successful failovers per rolling window.
    pub failover_limit: u32,
    pub failover_time_limit: Duration,
    pub time_between_failovers: Duration,
    /// Refuse candidates whose semisync state reports unsynced.
    pub failover_at_sync: bool,
    /// Strict errant-transaction filtering during election; permissive
    /// when disabled.
    pub failover_check_errant: bool,

    pub replication_multi_master: bool,
    pub replication_multi_tier_slave: bool,
    pub replication_no_relay: bool,

    pub switchover_wait_kill: Duration,
    pub switchover_wait_trx: Duration,
    pub switchover_wait_write_query: Duration,
    pub switchover_at_equal_gtid: bool,

    pub autorejoin: bool,
    pub rejoin_semisync: bool,
    pub rejoin_flashback: bool,
    pub rejoin_unsafe: bool,
    pub rejoin_dump: bool,
    pub rejoin_pseudogtid: bool,

    pub prefered_master: Vec<String>,
    pub ignored_hosts: Vec<String>,

    pub monitoring_ticker: Duration,
    /// Consecutive probe misses before any node is declared failed.
    pub max_fail: u32,
    pub connect_timeout: Duration,
    pub wait_apply_timeout: Duration,
    pub read_on_master: bool,

    pub arbitration: bool,
    pub arbitration_peer_hosts: Vec<String>,
    pub arbitration_external_hosts: Vec<String>,
    pub arbitration_external_secret: Option<String>,
    pub arbitration_external_unique_id: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            hosts: Vec::new(),
            credential: String::new(),
            proxies: Vec::new(),
            failover_mode: FailoverMode::Manual,
            failover_max_slave_delay: 30,
            failover_falsepositive_ping_counter: 5,
            failover_pre_script: None,
            failover_post_script: None,
            failover_limit: 5,
            failover_time_limit: Duration::from_secs(3600),
            time_between_failovers: Duration::from_secs(0),
            failover_at_sync: false,
            failover_check_errant: true,
            replication_multi_master: false,
            replication_multi_tier_slave: false,
            replication_no_relay: true,
            switchover_wait_kill: Duration::from_secs(5),
            switchover_wait_trx: Duration::from_secs(10),
            switchover_wait_write_query: Duration::from_secs(10),
            switchover_at_equal_gtid: false,
            autorejoin: true,
            rejoin_semisync: false,
            rejoin_flashback: false,
            rejoin_unsafe: false,
            rejoin_dump: false,
            rejoin_pseudogtid: false,
            prefered_master: Vec::new(),
            ignored_hosts: Vec::new(),
            monitoring_ticker: Duration::from_secs(2),
            max_fail: 5,
            connect_timeout: Duration::from_secs(3),
            wait_apply_timeout: Duration::from_secs(120),
            read_on_master: false,
            arbitration: false,
            arbitration_peer_hosts: Vec::new(),
            arbitration_external_hosts: Vec::new(),
            arbitration_external_secret: None,
            arbitration_external_unique_id: 0,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "on" | "yes" | "1"
    )
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Proxy entries: `host:port` or `kind://host:port`, comma-separated.
fn parse_proxies(value: &str) -> Vec<ProxyEndpoint> {
    parse_list(value)
        .into_iter()
        .filter_map(|entry| {
            let (kind, address) = match entry.split_once("://") {
                Some((kind, address)) => (kind.to_string(), address.to_string()),
                None => ("external".to_string(), entry),
            };
            let (host, port) = address.rsplit_once(':')?;
            let port: u16 = port.parse().ok()?;
            Some(ProxyEndpoint {
                kind,
                host: host.to_string(),
                port,
                write_port: port,
                read_port: port,
                credential: None,
            })
        })
        .collect()
}

fn parse_secs(value: &str, key: &str) -> VigilResult<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| VigilError::configuration(format!("{key}: expected seconds, got {value:?}")))
}

impl ClusterConfig {
    /// Build a typed config from resolved key/value pairs. Unknown keys are
    /// ignored (forward compatibility with sections the core does not own).
    pub fn from_resolved(
        name: &str,
        resolved: &BTreeMap<String, (String, KeyOrigin)>,
    ) -> VigilResult<Self> {
        let mut config = ClusterConfig {
            name: name.to_string(),
            ..ClusterConfig::default()
        };
        for (key, (value, _origin)) in resolved {
            config.apply_key(key, value)?;
        }
        if config.hosts.is_empty() {
            return Err(VigilError::configuration(format!(
                "cluster {name}: db-servers-hosts is required"
            )));
        }
        Ok(config)
    }

    fn apply_key(&mut self, key: &str, value: &str) -> VigilResult<()> {
        match key {
            "db-servers-hosts" => self.hosts = parse_list(value),
            "db-servers-credential" => self.credential = value.to_string(),
            "db-servers-prefered-master" => self.prefered_master = parse_list(value),
            "db-servers-ignored-hosts" => self.ignored_hosts = parse_list(value),
            "db-servers-connect-timeout" => self.connect_timeout = parse_secs(value, key)?,
            "proxy-servers-hosts" => self.proxies = parse_proxies(value),
            "failover-mode" => {
                // Accept both mode names and the historical interactive bool.
                self.failover_mode = match value.trim().to_ascii_lowercase().as_str() {
                    "automatic" | "false" | "off" | "0" => FailoverMode::Automatic,
                    _ => FailoverMode::Manual,
                };
            }
            "failover-max-slave-delay" => {
                self.failover_max_slave_delay = value.trim().parse().map_err(|_| {
                    VigilError::configuration(format!("{key}: expected seconds, got {value:?}"))
                })?;
            }
            "failover-falsepositive-ping-counter" => {
                self.failover_falsepositive_ping_counter =
                    value.trim().parse().map_err(|_| {
                        VigilError::configuration(format!("{key}: expected count, got {value:?}"))
                    })?;
            }
            "failover-pre-script" => self.failover_pre_script = Some(value.to_string()),
            "failover-post-script" => self.failover_post_script = Some(value.to_string()),
            "failover-limit" => {
                self.failover_limit = value.trim().parse().map_err(|_| {
                    VigilError::configuration(format!("{key}: expected count, got {value:?}"))
                })?;
            }
            "failover-time-limit" => self.failover_time_limit = parse_secs(value, key)?,
            "failover-time-between" => self.time_between_failovers = parse_secs(value, key)?,
            "failover-at-sync" => self.failover_at_sync = parse_bool(value),
            "failover-check-errant-transactions" => self.failover_check_errant = parse_bool(value),
            "replication-multi-master" => self.replication_multi_master = parse_bool(value),
            "replication-multi-tier-slave" => self.replication_multi_tier_slave = parse_bool(value),
            "replication-no-relay" => self.replication_no_relay = parse_bool(value),
            "switchover-wait-kill" => self.switchover_wait_kill = parse_secs(value, key)?,
            "switchover-wait-trx" => self.switchover_wait_trx = parse_secs(value, key)?,
            "switchover-wait-write-query" => {
                self.switchover_wait_write_query = parse_secs(value, key)?
            }
            "switchover-at-equal-gtid" => self.switchover_at_equal_gtid = parse_bool(value),
            "autorejoin" => self.autorejoin = parse_bool(value),
            "autorejoin-semisync" => self.rejoin_semisync = parse_bool(value),
            "autorejoin-flashback" => self.rejoin_flashback = parse_bool(value),
            "autorejoin-unsafe" => self.rejoin_unsafe = parse_bool(value),
            "autorejoin-logical-backup" => self.rejoin_dump = parse_bool(value),
            "autorejoin-slave-positional-heartbeat" => self.rejoin_pseudogtid = parse_bool(value),
            "monitoring-ticker" => self.monitoring_ticker = parse_secs(value, key)?,
            "max-fail" => {
                self.max_fail = value.trim().parse().map_err(|_| {
                    VigilError::configuration(format!("{key}: expected count, got {value:?}"))
                })?;
            }
            "failover-wait-apply-timeout" => self.wait_apply_timeout = parse_secs(value, key)?,
            "proxy-read-on-master" => self.read_on_master = parse_bool(value),
            "arbitration" => self.arbitration = parse_bool(value),
            "arbitration-peer-hosts" => self.arbitration_peer_hosts = parse_list(value),
            "arbitration-external-hosts" => self.arbitration_external_hosts = parse_list(value),
            "arbitration-external-secret" => {
                self.arbitration_external_secret = Some(value.to_string())
            }
            "arbitration-external-unique-id" => {
                self.arbitration_external_unique_id = value.trim().parse().map_err(|_| {
                    VigilError::configuration(format!("{key}: expected id, got {value:?}"))
                })?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Probe deadline for one tick: the connect timeout, capped so the
    /// fan-out always converges inside the tick period.
    pub fn probe_deadline(&self) -> Duration {
        self.connect_timeout.min(self.monitoring_ticker)
    }

    /// Arbitration calls are synchronous and bounded at four tick periods.
    pub fn arbitration_deadline(&self) -> Duration {
        self.monitoring_ticker * 4
    }
}
