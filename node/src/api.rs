//! # Status API
//!
//! The axum router for the node's HTTP surface. It is read-only: directives
//! travel over the lattice, never over HTTP.
//!
//! | Method | Path       | Description                                 |
//! |--------|------------|---------------------------------------------|
//! | GET    | `/health`  | Liveness probe                              |
//! | GET    | `/status`  | Node, network, key and counter summary      |
//! | GET    | `/metrics` | Prometheus exposition                       |

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use lattice_protocol::node::NodeStatusReport;
use lattice_protocol::LatticeNode;

use crate::metrics::{metrics_handler, LatticeMetrics};

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub node: Arc<LatticeNode>,
    pub metrics: Arc<LatticeMetrics>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub node: NodeStatusReport,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /health`: 200 while the process is up, whether or not it has peers.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "node_id": state.node.node_id(),
        })),
    )
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: state.version.clone(),
        node: state.node.status(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use lattice_protocol::{LatticeConfig, LocalBus, NodeRole};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let bus = LocalBus::new();
        let config = LatticeConfig::for_node("api-test", NodeRole::Gateway);
        let node = LatticeNode::new(config, bus.transport("api-test")).unwrap();
        AppState {
            version: "0.1.0-test".into(),
            node: Arc::new(node),
            metrics: Arc::new(LatticeMetrics::new().unwrap()),
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_state());
        let (status, body) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["node_id"], "api-test");
    }

    #[tokio::test]
    async fn status_endpoint_reports_node() {
        let state = test_state();
        let public_key = state.node.public_key().to_hex();
        let router = create_router(state);
        let (status, body) = get(&router, "/status").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["version"], "0.1.0-test");
        assert_eq!(json["node_id"], "api-test");
        assert_eq!(json["public_key"], public_key);
        assert_eq!(json["running"], false);
        assert_eq!(json["network"]["role"], "gateway");
        assert_eq!(json["network"]["health"], 0.0);
        assert_eq!(json["stats"]["sent"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_reflects_engine_counters() {
        let state = test_state();
        state.node.trust("peer", lattice_protocol::LatticeKeypair::generate().public_key()).unwrap();
        let router = create_router(state);
        let (status, body) = get(&router, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("lattice_trusted_nodes 1"));
        assert!(text.contains("lattice_connected_nodes 0"));
        assert!(text.contains("lattice_messages_sent_total 0"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let router = create_router(test_state());
        let (status, _) = get(&router, "/rpc").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
