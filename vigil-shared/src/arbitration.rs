//! Arbitration types and the controller-side decision rules.
//!
//! The wire clients (peer heartbeat GET, external arbitrator) live in the
//! server crate; the core only sees peer views and verdicts through the
//! [`Arbitrator`] boundary so every decision path stays testable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Controller activity status carried in heartbeats: active or standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerStatus {
    #[serde(rename = "A")]
    Active,
    #[serde(rename = "S")]
    Standby,
}

/// Payload of `GET /heartbeat`, exchanged between peer controllers and
/// with the external arbitrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub uuid: String,
    pub secret: String,
    pub cluster: String,
    pub master: String,
    #[serde(rename = "id")]
    pub uid: u64,
    pub status: ControllerStatus,
    pub hosts: u32,
    pub failed: u32,
}

/// What we know about one configured peer after the latest heartbeat
/// round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerView {
    pub address: String,
    pub last_reply: Option<DateTime<Utc>>,
    /// Peer-reported heartbeat; `None` when unreachable or the payload
    /// did not parse.
    pub reported: Option<Heartbeat>,
}

impl PeerView {
    pub fn unreachable(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            last_reply: None,
            reported: None,
        }
    }

    pub fn replied(address: impl Into<String>, heartbeat: Heartbeat) -> Self {
        Self {
            address: address.into(),
            last_reply: Some(Utc::now()),
            reported: Some(heartbeat),
        }
    }
}

/// Outcome of an arbitration round. Anything that is not an explicit win
/// is a loss: unreachable arbitrator, timeout, or unexpected payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArbitrationVerdict {
    Win,
    Lose,
}

impl ArbitrationVerdict {
    pub fn is_win(&self) -> bool {
        matches!(self, ArbitrationVerdict::Win)
    }
}

/// Boundary to the external arbitrator. Implementations must bound the
/// call at four tick periods and return [`ArbitrationVerdict::Lose`] on
/// any failure.
#[async_trait]
pub trait Arbitrator: Send + Sync {
    async fn arbitrate(&self, cluster: &str, local: &Heartbeat) -> ArbitrationVerdict;
}

/// Peer state shared between the supervisor's heartbeat loop and the
/// cluster monitors. Written by the heartbeat loop, read at each tick.
#[derive(Debug, Default)]
pub struct SharedArbitrationState {
    split_brain: std::sync::atomic::AtomicBool,
    peers_unreachable: std::sync::atomic::AtomicBool,
    standby: std::sync::atomic::AtomicBool,
}

impl SharedArbitrationState {
    pub fn set_split_brain(&self, value: bool) {
        self.split_brain
            .store(value, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_split_brain(&self) -> bool {
        self.split_brain.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_peers_unreachable(&self, value: bool) {
        self.peers_unreachable
            .store(value, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn peers_unreachable(&self) -> bool {
        self.peers_unreachable
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_standby(&self, value: bool) {
        self.standby
            .store(value, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_standby(&self) -> bool {
        self.standby.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Split-brain rule: a reachable peer reporting the same cluster up with
/// a different primary contradicts the local view.
pub fn peer_conflicts(local_cluster: &str, local_master: Option<&str>, peer: &PeerView) -> bool {
    let heartbeat = match &peer.reported {
        Some(h) => h,
        None => return false,
    };
    if heartbeat.cluster != local_cluster || heartbeat.master.is_empty() {
        return false;
    }
    match local_master {
        Some(master) => heartbeat.master != master,
        // Peer sees a primary where we see none: their view wins, no
        // conflict to declare.
        None => false,
    }
}

/// Evaluate a heartbeat round. Returns `(split_brain, all_unreachable)`.
pub fn evaluate_peers(
    local_cluster: &str,
    local_master: Option<&str>,
    peers: &[PeerView],
) -> (bool, bool) {
    if peers.is_empty() {
        return (false, false);
    }
    let split_brain = peers
        .iter()
        .any(|p| peer_conflicts(local_cluster, local_master, p));
    let all_unreachable = peers.iter().all(|p| p.reported.is_none());
    (split_brain, all_unreachable)
}
