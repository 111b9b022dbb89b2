//! Structured event log.
//!
//! Events carry stable identifier codes for machine consumption; the code
//! dictionary below is fixed and codes are never reused. The ring is
//! process-wide, bounded, and append-only; within a cluster events are
//! totally ordered by their monotonic timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Stable description for an event code. Placeholders are informal; the
/// emitted message carries the concrete values.
pub fn code_text(code: &str) -> Option<&'static str> {
    let text = match code {
        "INFO0001" => "Failover complete on cluster",
        "INFO0002" => "Switchover complete on cluster",
        "ERR00002" => "Waiting for a user manual failover",
        "ERR00010" => "Could not find a slave in topology",
        "ERR00011" => "Found multiple masters in topology but not explicitely setup",
        "ERR00012" => "Could not find a master in topology",
        "ERR00013" => "Binary log disabled on slave",
        "ERR00016" => "Master is unreachable but slaves are replicating",
        "ERR00021" => "Cluster state down",
        "ERR00022" => "Running in passive mode",
        "ERR00027" => "Number of cluster failovers exceeded",
        "ERR00028" => "Slave can still communicate with the master",
        "ERR00029" => "Time between failovers too short",
        "ERR00030" => "Proxy can still communicate with the master",
        "ERR00031" => "External API can still communicate with the master",
        "ERR00032" => "No candidates found in slaves list",
        "ERR00033" => "Skip slave in election: no master log file, slave might have failed",
        "ERR00034" => "Skip slave in election: repl not electable for switchover",
        "ERR00035" => "Skip slave in election: multi-master and is already the master",
        "ERR00036" => "Skip slave in election: is relay",
        "ERR00037" => "Skip slave in election: in ignore list",
        "ERR00039" => "Skip slave in election: repl not electable",
        "ERR00040" => "Skip slave in election: does not ping or has no binlogs",
        "ERR00041" => "Skip slave in election: replication delay over maximum",
        "ERR00042" => "Skip slave in election: SQL thread is stopped",
        "ERR00043" => "Skip slave in election: semisync reports unsynced",
        "ERR00045" => "Found forbidden relay topology, trying to fix",
        "ERR00046" => "Can't fix relay topology: high replication delay",
        "ERR00047" => "Skip slave in election: maintenance mode",
        "ERR00050" => "Can't connect to proxy",
        "ERR00049" => "Waiting old master to rejoin in positional mode",
        "ERR00055" => "Arbitrator unreachable",
        "ERR00056" => "Master user is not defined on replication candidate",
        "ERR00059" => "Ignored server not found in configured server list",
        "ERR00064" => "Server is not a slave of declared master and no relay is enabled",
        "ERR00066" => "No crash found on current master when rejoining standalone",
        "ERR00068" => "Arbitration looser",
        "ERR00074" => "Prefered server not found in configured server list",
        "ERR00077" => "All databases state down",
        "ERR00084" => "Cluster have no master when slave was started",
        "ERR00085" => "No replica found for routing reads",
        "ERR00087" => "Skip slave in election: IO thread is stopped with valid leader",
        "WARN0022" => "Rejoining standalone server to master",
        "WARN0023" => "Number of failed master ping has been reached",
        "WARN0048" => "No semisync settings on slave",
        "WARN0049" => "No binlog format ROW on slave and flashback activated",
        "WARN0051" => "No GTID replication on slave",
        "WARN0057" => "No log-slave-updates on slave",
        "WARN0058" => "No GTID strict mode on slave",
        "WARN0075" => "Reseeding logical backup on server",
        "WARN0079" => "Cluster is split brain",
        "WARN0080" => "Cluster lost majority",
        "WARN0082" => "Cluster arbitrator error in arbitration",
        "WARN0083" => "Arbitration winner",
        "WARN0090" => "Cluster arbitrator unreachable",
        "WARN0091" => "Server as errant transaction",
        _ => return None,
    };
    Some(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// What the event is about: a node, a proxy, or the cluster itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrigin {
    Cluster,
    Node(String),
    Proxy(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub cluster: String,
    pub origin: EventOrigin,
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl Event {
    pub fn new(
        cluster: impl Into<String>,
        origin: EventOrigin,
        severity: Severity,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            cluster: cluster.into(),
            origin,
            severity,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Bounded rolling event log shared across clusters. Appends take a short
/// lock; readers get copies.
#[derive(Debug)]
pub struct EventRing {
    capacity: usize,
    entries: Mutex<VecDeque<Event>>,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an event, dropping the oldest entry at capacity, and mirror
    /// it to the log sink.
    pub fn push(&self, event: Event) {
        match event.severity {
            Severity::Info => info!(
                cluster = %event.cluster,
                code = %event.code,
                "{}", event.message
            ),
            Severity::Warn => warn!(
                cluster = %event.cluster,
                code = %event.code,
                "{}", event.message
            ),
            Severity::Error => error!(
                cluster = %event.cluster,
                code = %event.code,
                "{}", event.message
            ),
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Convenience: build and append an event whose message is the code's
    /// dictionary text plus detail.
    pub fn emit(
        &self,
        cluster: &str,
        origin: EventOrigin,
        severity: Severity,
        code: &str,
        detail: impl AsRef<str>,
    ) {
        let base = code_text(code).unwrap_or("unregistered event code");
        let detail = detail.as_ref();
        let message = if detail.is_empty() {
            base.to_string()
        } else {
            format!("{base}: {detail}")
        };
        self.push(Event::new(cluster, origin, severity, code, message));
    }

    pub fn snapshot(&self) -> Vec<Event> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn for_cluster(&self, cluster: &str) -> Vec<Event> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| e.cluster == cluster)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_have_text() {
        assert_eq!(
            code_text("ERR00012"),
            Some("Could not find a master in topology")
        );
        assert_eq!(code_text("ERR00032"), Some("No candidates found in slaves list"));
        assert_eq!(code_text("WARN0079"), Some("Cluster is split brain"));
        assert!(code_text("ERR99999").is_none());
    }

    #[test]
    fn ring_is_bounded() {
        let ring = EventRing::new(3);
        for i in 0..5 {
            ring.emit(
                "c1",
                EventOrigin::Cluster,
                Severity::Info,
                "ERR00021",
                format!("tick {i}"),
            );
        }
        let events = ring.snapshot();
        assert_eq!(events.len(), 3);
        assert!(events[0].message.contains("tick 2"));
        assert!(events[2].message.contains("tick 4"));
    }

    #[test]
    fn per_cluster_filter_and_order() {
        let ring = EventRing::new(16);
        ring.emit("c1", EventOrigin::Cluster, Severity::Warn, "WARN0079", "");
        ring.emit("c2", EventOrigin::Cluster, Severity::Error, "ERR00032", "");
        ring.emit(
            "c1",
            EventOrigin::Node("db1:3306".into()),
            Severity::Error,
            "ERR00029",
            "",
        );
        let c1 = ring.for_cluster("c1");
        assert_eq!(c1.len(), 2);
        assert!(c1[0].timestamp <= c1[1].timestamp);
        assert_eq!(c1[1].code, "ERR00029");
    }

    #[test]
    fn emit_without_detail_uses_dictionary_text() {
        let ring = EventRing::new(4);
        ring.emit("c1", EventOrigin::Cluster, Severity::Error, "ERR00027", "");
        assert_eq!(
            ring.snapshot()[0].message,
            "Number of cluster failovers exceeded"
        );
    }
}
