//! # Manager (C4)
//!
//! The control-plane front door: agent directory and relay selection, the
//! browser-facing SSH/VNC/RDP consoles, the saturation sampler and the
//! sync-admission gate, and the mTLS certificate authority's HTTP front
//! end.
//!
//! ## Modules
//!
//! - [`auth`]          — admin authentication (mTLS OU or Django bearer token)
//! - [`state`]         — shared Redis/Postgres/Portainer handles
//! - [`tunnel_routes`] — relay selection, agent directory
//! - [`service_proxy`] — `WS /v1/private/tunnel/ws/agents/{id}` consoles
//! - [`ca_routes`]     — mTLS token/certificate/CRL routes
//! - [`availability`]  — saturation sampler, admission gate, sync drainer
//! - [`stream`]        — `/v1/private/stream` service-status SSE feed
//! - [`error`]         — the HTTP-facing error type every handler converges on

mod auth;
mod availability;
mod ca_routes;
mod error;
mod service_proxy;
mod state;
mod stream;
mod tunnel_routes;

use axum::routing::{delete, get, post};
use axum::Router;
use migasfree_core::{Config, PostgresClient, RedisDirectory};
use state::ManagerState;
use std::net::SocketAddr;
use swarm_monitor::PortainerClient;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "manager=info".into()),
        )
        .init();

    if dotenvy::dotenv().is_err() {
        warn!("no .env file found, relying on system environment variables");
    }

    let config = Config::from_env().expect("invalid configuration");

    let core = RedisDirectory::connect(&config.redis_url).await.expect("redis unreachable at startup");
    let postgres = PostgresClient::connect(&config.postgres_url(), 5).await.expect("postgres unreachable at startup");
    let portainer = PortainerClient::new(config.portainer_url.clone(), config.portainer_token_file.clone());

    let state = ManagerState::new(config, core, postgres, portainer);

    tokio::spawn(availability::run_metrics_loop(state.clone()));
    tokio::spawn(availability::run_sync_queue_loop(state.clone()));

    let reconciler_cancellation = tokio_util::sync::CancellationToken::new();
    {
        let portainer = state.portainer.clone();
        let services = state.services.clone();
        let stack = state.config.stack.clone();
        let events_tx = state.events_tx.clone();
        let cancellation = reconciler_cancellation.clone();
        tokio::spawn(async move {
            swarm_monitor::reconciler::run_reconciler_loop(
                portainer,
                services,
                stack,
                move |events| {
                    for event in events {
                        let _ = events_tx.send(event);
                    }
                },
                cancellation,
            )
            .await;
        });
    }

    let app = Router::new()
        .route("/v1/private/tunnel/register", post(tunnel_routes::register_tunnel))
        .route("/v1/private/tunnel/agents", get(tunnel_routes::list_agents))
        .route("/v1/private/tunnel/agents/{agent_id}", get(tunnel_routes::get_agent))
        .route("/v1/private/tunnel/ws/agents/{agent_id}", get(service_proxy::console_ws))
        .route("/v1/private/metrics/json", get(availability::metrics_json))
        .route("/v1/private/stream", get(stream::stream_services))
        .route("/v1/public/synchronizations/availability/", post(availability::check_availability))
        .route("/v1/private/mtls/admin-tokens", post(ca_routes::create_admin_token))
        .route("/v1/private/mtls/computer-tokens", post(ca_routes::create_computer_token))
        .route("/v1/public/mtls/admin-requests/{token}", get(ca_routes::render_admin_token_form))
        .route("/v1/public/mtls/computer-requests/{token}", get(ca_routes::render_computer_token_form))
        .route("/v1/public/mtls/admin-certificates", post(ca_routes::create_admin_certificate))
        .route("/v1/public/mtls/computer-certificates", post(ca_routes::create_computer_certificate))
        .route("/v1/private/mtls/admin-certificates", delete(ca_routes::revoke_admin_certificate))
        .route("/v1/private/mtls/computer-certificates", delete(ca_routes::revoke_computer_certificate))
        .route("/v1/public/crl", get(ca_routes::get_crl))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!(%addr, "manager listening");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
    reconciler_cancellation.cancel();
}
