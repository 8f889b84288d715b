//! Route-level tests for the relay's plain HTTP surface, exercised
//! against a real `axum::Router` via `tower::ServiceExt::oneshot`
//! (spec §8 scenario coverage that needs a running router rather than
//! a bare function call).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

#[path = "../src/api.rs"]
mod api;
#[path = "../src/state.rs"]
mod state;

use state::{RelayConfig, RelayState};

fn test_state() -> RelayState {
    let config = RelayConfig {
        relay_id: "relay-test".into(),
        public_url: "wss://relay-test/tunnel".into(),
        internal_url: "ws://relay-test:7070/ws".into(),
        hostname: "relay-test".into(),
        max_connections: 10,
    };
    RelayState::new(config, None)
}

fn test_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/agents", get(api::list_agents))
        .with_state(state)
}

#[tokio::test]
async fn health_reports_ok() {
    let app = test_router(test_state());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn agent_listing_starts_empty_and_reflects_registered_agents() {
    let state = test_state();
    let app = test_router(state.clone());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/agents").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let agents: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert!(agents.is_empty());

    let (tx, _rx) = tokio::sync::mpsc::channel(state::MAX_SEND_QUEUE);
    state.agents.insert(
        "agent-1".into(),
        state::AgentHandle { conn_id: "c1".into(), tx, name: "host-1".into(), services: vec!["ssh".into()], mode: None },
    );

    let response = app
        .oneshot(Request::builder().uri("/api/agents").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let agents: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agent_id"], "agent-1");
    assert_eq!(agents[0]["name"], "host-1");
}
