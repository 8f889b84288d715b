//! # Tunnel Relay (C5)
//!
//! A WebSocket hub that terminates persistent agent connections,
//! multiplexes TCP tunnels and remote-exec fan-out between agents and
//! clients, and publishes liveness to Redis so the Manager can weight
//! relay selection by load.
//!
//! ## Modules
//!
//! - [`state`]    — agent/tunnel/exec registries
//! - [`handlers`] — WebSocket connection lifecycle and frame dispatch
//! - [`api`]      — `/health` and a debug agent listing

mod api;
mod handlers;
mod state;

use axum::routing::get;
use axum::Router;
use migasfree_core::{Config, RedisDirectory, RelayRecord};
use state::{RelayConfig, RelayState};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "relay=info".into()),
        )
        .init();

    if dotenvy::dotenv().is_err() {
        warn!("no .env file found, relying on system environment variables");
    }

    let config = Config::from_env().expect("invalid configuration");
    raise_fd_limit(config.tunnel_connections);

    let core = match RedisDirectory::connect(&config.redis_url).await {
        Ok(directory) => Some(directory),
        Err(e) => {
            warn!("redis unreachable at startup, starting in local-only mode: {e}");
            None
        }
    };

    let relay_id = std::env::var("RELAY_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let public_url = std::env::var("RELAY_PUBLIC_URL").unwrap_or_else(|_| format!("wss://{}/tunnel", config.fqdn));
    let internal_url = std::env::var("RELAY_INTERNAL_URL").unwrap_or_else(|_| "ws://relay:7070/ws".to_string());
    let hostname = hostname_or_default();

    let relay_config = RelayConfig {
        relay_id: relay_id.clone(),
        public_url: public_url.clone(),
        internal_url: internal_url.clone(),
        hostname: hostname.clone(),
        max_connections: config.tunnel_connections,
    };
    let state = RelayState::new(relay_config, core);

    spawn_heartbeat_task(state.clone());

    let app = Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/health", get(api::health))
        .route("/api/agents", get(api::list_agents))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 7070));
    info!(%addr, relay_id, "tunnel relay listening");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

/// Raises the soft file-descriptor limit to `2 × max_connections`,
/// clamped to the hard limit (spec §4.1 "Admission").
fn raise_fd_limit(max_connections: usize) {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let desired = (max_connections as u64).saturating_mul(2);
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) => {
            let target = desired.min(hard);
            if target > soft {
                if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, target, hard) {
                    warn!("failed to raise RLIMIT_NOFILE to {target}: {e}");
                } else {
                    info!("raised RLIMIT_NOFILE from {soft} to {target}");
                }
            }
        }
        Err(e) => warn!("could not read RLIMIT_NOFILE: {e}"),
    }
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "relay".to_string())
}

/// Every 5s, publish this relay's load and addresses so the Manager can
/// pick the least-loaded relay per agent (spec §3 "Relay record", §4.1
/// "Heartbeat and load reporting").
fn spawn_heartbeat_task(state: RelayState) {
    let Some(core) = state.core.clone() else {
        warn!("no redis connection; relay load will not be advertised to the manager");
        return;
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let record = RelayRecord {
                id: state.config.relay_id.clone(),
                url: state.config.public_url.clone(),
                internal_url: state.config.internal_url.clone(),
                hostname: state.config.hostname.clone(),
                load: state.load() as u64,
                max_connections: state.config.max_connections,
            };
            if let Err(e) = core.heartbeat_relay(&record).await {
                warn!("heartbeat to redis failed, will retry: {e}");
            }
        }
    });
}
