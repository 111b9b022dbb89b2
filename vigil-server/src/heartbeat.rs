//! Controller observation API.
//!
//! `GET /heartbeat` is the peer/arbitration contract; `/status`,
//! `/events` and `/metrics` are operator read surfaces. The full
//! authenticated API lives outside this repository.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use vigil_shared::exception::{VigilError, VigilResult};

use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<Supervisor>,
}

#[derive(Debug, Deserialize)]
pub struct ClusterQuery {
    pub cluster: Option<String>,
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/heartbeat", get(heartbeat_handler))
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(ApiState { supervisor })
}

/// Peer heartbeat contract: `{uuid, secret, cluster, master, id, status,
/// hosts, failed}` with status `A` or `S`.
async fn heartbeat_handler(
    State(state): State<ApiState>,
    Query(query): Query<ClusterQuery>,
) -> Result<Json<vigil_shared::Heartbeat>, StatusCode> {
    match state
        .supervisor
        .heartbeat_for(query.cluster.as_deref())
        .await
    {
        Some(heartbeat) => Ok(Json(heartbeat)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn status_handler(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let views = state.supervisor.views().await;
    let standby = state.supervisor.arbitration().is_standby();
    Json(json!({
        "uuid": state.supervisor.uuid.to_string(),
        "status": if standby { "S" } else { "A" },
        "split_brain": state.supervisor.arbitration().is_split_brain(),
        "clusters": views,
    }))
}

async fn events_handler(
    State(state): State<ApiState>,
    Query(query): Query<ClusterQuery>,
) -> Json<Vec<vigil_shared::Event>> {
    let events = state.supervisor.events();
    let list = match query.cluster.as_deref() {
        Some(cluster) => events.for_cluster(cluster),
        None => events.snapshot(),
    };
    Json(list)
}

async fn metrics_handler(State(state): State<ApiState>) -> Json<vigil_shared::MetricsSnapshot> {
    Json(state.supervisor.metrics().snapshot())
}

/// Bind and serve until the process exits. A bind failure is a process
/// error: it propagates and terminates with a non-zero exit.
pub async fn serve(supervisor: Arc<Supervisor>) -> VigilResult<()> {
    let address: SocketAddr = format!(
        "{}:{}",
        supervisor.config().bind_address,
        supervisor.config().port
    )
    .parse()
    .map_err(|e| VigilError::configuration(format!("bad bind address: {e}")))?;
    let app = router(supervisor);
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| VigilError::network(format!("bind {address}: {e}")))?;
    info!("controller API listening on {address}");
    axum::serve(listener, app)
        .await
        .map_err(|e| VigilError::network(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorConfig;
    use vigil_shared::arbitration::ControllerStatus;
    use vigil_shared::config::ClusterConfig;
    use vigil_shared::driver::scripted::ScriptedFleet;
    use vigil_shared::gtid::BinlogPos;
    use vigil_shared::node::NodeId;

    async fn test_supervisor() -> Arc<Supervisor> {
        let supervisor = Supervisor::new(SupervisorConfig {
            secret: "s".to_string(),
            ..SupervisorConfig::default()
        });
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
        supervisor
            .add_cluster(
                ClusterConfig {
                    name: "c1".to_string(),
                    hosts: vec!["db1:3306".into(), "db2:3306".into()],
                    ..ClusterConfig::default()
                },
                fleet,
                vec![],
            )
            .await
            .unwrap();
        supervisor
    }

    #[tokio::test]
    async fn heartbeat_handler_returns_cluster_payload() {
        let supervisor = test_supervisor().await;
        let state = ApiState {
            supervisor: supervisor.clone(),
        };
        let response = heartbeat_handler(
            State(state),
            Query(ClusterQuery {
                cluster: Some("c1".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.0.cluster, "c1");
        assert_eq!(response.0.status, ControllerStatus::Active);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn heartbeat_handler_404_for_unknown_cluster() {
        let supervisor = test_supervisor().await;
        let state = ApiState {
            supervisor: supervisor.clone(),
        };
        let result = heartbeat_handler(
            State(state),
            Query(ClusterQuery {
                cluster: Some("ghost".to_string()),
            }),
        )
        .await;
        assert_eq!(result.err(), Some(StatusCode::NOT_FOUND));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn status_handler_lists_clusters() {
        let supervisor = test_supervisor().await;
        let state = ApiState {
            supervisor: supervisor.clone(),
        };
        let response = status_handler(State(state)).await;
        assert_eq!(response.0["status"], "A");
        assert_eq!(response.0["clusters"].as_array().unwrap().len(), 1);
        supervisor.stop().await;
    }
}
