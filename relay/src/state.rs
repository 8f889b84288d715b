//! Shared relay state: agent registry, tunnel registry, exec-session
//! registry, and the per-connection outbound queues (spec §3, §4.1).
//!
//! All registries use [`DashMap`] for lock-free concurrent access, since
//! every WebSocket connection is handled by its own task.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tunnel_protocol::RelayFrame;

/// Bounded per-connection outbound queue (spec §8 backpressure: "Relay WS
/// send queues are bounded (100 messages)").
pub const MAX_SEND_QUEUE: usize = 100;

pub type ClientTx = mpsc::Sender<RelayFrame>;

#[derive(Clone)]
pub struct AgentHandle {
    pub conn_id: String,
    pub tx: ClientTx,
    pub name: String,
    pub services: Vec<String>,
    pub mode: Option<String>,
}

#[derive(Clone)]
pub struct TunnelRecord {
    pub tunnel_id: String,
    pub client_conn_id: String,
    pub agent_id: String,
    pub service: String,
    pub created_at: Instant,
    pub client_cn: Option<String>,
}

#[derive(Clone)]
pub struct ExecSession {
    pub exec_id: String,
    pub client_conn_id: String,
    pub agent_id: String,
    pub command: String,
}

pub struct RelayConfig {
    pub relay_id: String,
    pub public_url: String,
    pub internal_url: String,
    pub hostname: String,
    pub max_connections: usize,
}

#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    /// Every open WS connection (both agents and clients), keyed by a
    /// per-connection id, for routing relay frames back out.
    pub connections: Arc<DashMap<String, ClientTx>>,
    pub agents: Arc<DashMap<String, AgentHandle>>,
    pub tunnels: Arc<DashMap<String, TunnelRecord>>,
    pub exec_sessions: Arc<DashMap<String, ExecSession>>,
    /// `None` once Redis is judged unreachable — the directory then
    /// degrades to this relay's local-only registries instead of
    /// crashing (spec §4.1 "Failure semantics").
    pub core: Option<Arc<migasfree_core::RedisDirectory>>,
}

impl RelayState {
    pub fn new(config: RelayConfig, core: Option<migasfree_core::RedisDirectory>) -> Self {
        Self {
            config: Arc::new(config),
            connections: Arc::new(DashMap::new()),
            agents: Arc::new(DashMap::new()),
            tunnels: Arc::new(DashMap::new()),
            exec_sessions: Arc::new(DashMap::new()),
            core: core.map(Arc::new),
        }
    }

    /// Active agent count, i.e. this relay's current `load` (spec §3
    /// "Relay record").
    pub fn load(&self) -> usize {
        self.agents.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.load() < self.config.max_connections
    }

    pub fn remove_tunnels_for(&self, agent_id: &str, conn_id: &str) -> Vec<TunnelRecord> {
        let to_remove: Vec<String> = self
            .tunnels
            .iter()
            .filter(|t| t.agent_id == agent_id || t.client_conn_id == conn_id)
            .map(|t| t.tunnel_id.clone())
            .collect();
        to_remove
            .into_iter()
            .filter_map(|id| self.tunnels.remove(&id).map(|(_, v)| v))
            .collect()
    }

    pub fn remove_exec_sessions_for(&self, agent_id: &str, conn_id: &str) -> Vec<ExecSession> {
        let to_remove: Vec<String> = self
            .exec_sessions
            .iter()
            .filter(|e| e.agent_id == agent_id || e.client_conn_id == conn_id)
            .map(|e| e.exec_id.clone())
            .collect();
        to_remove
            .into_iter()
            .filter_map(|id| self.exec_sessions.remove(&id).map(|(_, v)| v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_tx() -> ClientTx {
        mpsc::channel(MAX_SEND_QUEUE).0
    }

    fn test_state(max_connections: usize) -> RelayState {
        let config = RelayConfig {
            relay_id: "relay-1".into(),
            public_url: "wss://relay-1/tunnel".into(),
            internal_url: "ws://relay-1:7070/ws".into(),
            hostname: "relay-1".into(),
            max_connections,
        };
        RelayState::new(config, None)
    }

    #[test]
    fn admission_respects_max_connections() {
        let state = test_state(1);
        assert!(state.has_capacity());
        state.agents.insert(
            "agent-1".into(),
            AgentHandle { conn_id: "c1".into(), tx: dummy_tx(), name: "h1".into(), services: vec![], mode: None },
        );
        assert!(!state.has_capacity());
    }

    #[test]
    fn tunnel_and_exec_cleanup_scopes_to_the_disconnecting_peer() {
        let state = test_state(10);
        state.tunnels.insert(
            "t1".into(),
            TunnelRecord { tunnel_id: "t1".into(), client_conn_id: "client-a".into(), agent_id: "agent-1".into(), service: "ssh".into(), created_at: Instant::now(), client_cn: None },
        );
        state.tunnels.insert(
            "t2".into(),
            TunnelRecord { tunnel_id: "t2".into(), client_conn_id: "client-b".into(), agent_id: "agent-2".into(), service: "vnc".into(), created_at: Instant::now(), client_cn: None },
        );

        let removed = state.remove_tunnels_for("agent-1", "unrelated-conn");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].tunnel_id, "t1");
        assert!(state.tunnels.contains_key("t2"));
        assert!(!state.tunnels.contains_key("t1"));
    }
}
