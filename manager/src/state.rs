//! Shared Manager state: the agent/relay directory, Postgres pool,
//! Portainer client, and a registry of locally-proxied SSH PTY sessions
//! that need a clean shutdown path (spec §4.2, §4.3, §4.5).

use dashmap::DashMap;
use migasfree_core::{Config, PostgresClient, RedisDirectory};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use swarm_monitor::{PortainerClient, ServiceStateCache, SseEvent};
use tokio::sync::broadcast;

/// Bounded so a burst of reconciler events can't grow unbounded memory;
/// a lagging SSE subscriber just misses the oldest events and is told so.
const EVENTS_CHANNEL_CAPACITY: usize = 256;

/// A live SSH console bridge (spec §4.2 point 4): one local TCP listener
/// plus a PTY-driven `ssh -tt`, torn down together on either leg closing.
pub struct SshSession {
    pub pid: Option<u32>,
}

#[derive(Clone)]
pub struct ManagerState {
    pub config: Arc<Config>,
    pub core: Arc<RedisDirectory>,
    pub postgres: Arc<PostgresClient>,
    pub portainer: Arc<PortainerClient>,
    pub services: Arc<ServiceStateCache>,
    pub http: reqwest::Client,
    pub ssh_sessions: Arc<DashMap<String, SshSession>>,
    pub sync_in_flight: Arc<AtomicU32>,
    /// Fans out reconciler [`SseEvent`]s to every `/v1/private/stream`
    /// subscriber (spec §4.5). `broadcast::Sender` is cheaply `Clone`,
    /// so no `Arc` wrapper is needed.
    pub events_tx: broadcast::Sender<SseEvent>,
}

impl ManagerState {
    pub fn new(
        config: Config,
        core: RedisDirectory,
        postgres: PostgresClient,
        portainer: PortainerClient,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            core: Arc::new(core),
            postgres: Arc::new(postgres),
            portainer: Arc::new(portainer),
            services: Arc::new(ServiceStateCache::new()),
            http: reqwest::Client::new(),
            ssh_sessions: Arc::new(DashMap::new()),
            sync_in_flight: Arc::new(AtomicU32::new(0)),
            events_tx,
        }
    }
}
