//! HTTP clients for peer controllers and the external arbitrator.
//!
//! Both calls are synchronous from the caller's point of view and bounded
//! at four tick periods. Anything other than a parseable, expected reply
//! counts against us: an unreachable peer is recorded as such, and an
//! arbitrator that fails, times out, or answers with an unexpected
//! payload makes this controller the loser.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use vigil_shared::arbitration::{ArbitrationVerdict, Arbitrator, Heartbeat, PeerView};
use vigil_shared::events::{EventOrigin, EventRing, Severity};

/// Client for `GET /heartbeat` on peer controllers.
#[derive(Clone)]
pub struct PeerClient {
    client: reqwest::Client,
    secret: String,
}

impl PeerClient {
    pub fn new(timeout: Duration, secret: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            secret: secret.into(),
        }
    }

    /// One peer round-trip. A reply with a mismatched secret is treated
    /// as unreachable rather than trusted.
    pub async fn fetch(&self, peer: &str) -> PeerView {
        let url = format!("http://{peer}/heartbeat");
        debug!("sending peer heartbeat request to {peer}");
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("peer {peer} unreachable: {e}");
                return PeerView::unreachable(peer);
            }
        };
        let heartbeat: Heartbeat = match response.json().await {
            Ok(h) => h,
            Err(e) => {
                debug!("peer {peer} returned an unparseable heartbeat: {e}");
                return PeerView::unreachable(peer);
            }
        };
        if !self.secret.is_empty() && heartbeat.secret != self.secret {
            warn!("peer {peer} heartbeat carries a mismatched secret, ignoring");
            return PeerView::unreachable(peer);
        }
        PeerView::replied(peer, heartbeat)
    }
}

#[derive(Debug, Deserialize)]
struct ArbitratorReply {
    arbitration: String,
}

/// Client for the external arbitrator, consulted when every peer is
/// unreachable. Fail-safe: any failure is a loss.
pub struct ExternalArbitrator {
    client: reqwest::Client,
    hosts: Vec<String>,
    events: Arc<EventRing>,
}

impl ExternalArbitrator {
    pub fn new(hosts: Vec<String>, timeout: Duration, events: Arc<EventRing>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            hosts,
            events,
        }
    }
}

#[async_trait]
impl Arbitrator for ExternalArbitrator {
    async fn arbitrate(&self, cluster: &str, local: &Heartbeat) -> ArbitrationVerdict {
        for host in &self.hosts {
            let url = format!("http://{host}/arbitrator");
            let response = match self.client.post(&url).json(local).send().await {
                Ok(r) => r,
                Err(e) => {
                    self.events.emit(
                        cluster,
                        EventOrigin::Cluster,
                        Severity::Error,
                        "ERR00055",
                        format!("{host}: {e}"),
                    );
                    continue;
                }
            };
            match response.json::<ArbitratorReply>().await {
                Ok(reply) if reply.arbitration == "winner" => {
                    return ArbitrationVerdict::Win;
                }
                Ok(reply) => {
                    debug!("arbitrator {host} ruled {:?} for {cluster}", reply.arbitration);
                    return ArbitrationVerdict::Lose;
                }
                Err(e) => {
                    // Unexpected payload: loser, same as unreachable.
                    self.events.emit(
                        cluster,
                        EventOrigin::Cluster,
                        Severity::Warn,
                        "WARN0082",
                        format!("{host}: {e}"),
                    );
                    return ArbitrationVerdict::Lose;
                }
            }
        }
        ArbitrationVerdict::Lose
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_peer_is_recorded_as_such() {
        let client = PeerClient::new(Duration::from_millis(200), "");
        let view = client.fetch("127.0.0.1:1").await;
        assert!(view.reported.is_none());
        assert_eq!(view.address, "127.0.0.1:1");
    }

    #[tokio::test]
    async fn unreachable_arbitrator_is_a_loss() {
        let events = Arc::new(EventRing::new(8));
        let arbitrator = ExternalArbitrator::new(
            vec!["127.0.0.1:1".to_string()],
            Duration::from_millis(200),
            events.clone(),
        );
        let local = Heartbeat {
            uuid: "u".into(),
            secret: "s".into(),
            cluster: "c1".into(),
            master: "db1:3306".into(),
            uid: 1,
            status: vigil_shared::arbitration::ControllerStatus::Active,
            hosts: 3,
            failed: 1,
        };
        let verdict = arbitrator.arbitrate("c1", &local).await;
        assert_eq!(verdict, ArbitrationVerdict::Lose);
        assert!(events.snapshot().iter().any(|e| e.code == "ERR00055"));
    }
}
