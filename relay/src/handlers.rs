//! WebSocket connection lifecycle and the agent/client message dispatch
//! (spec §4.1).

use crate::state::{AgentHandle, ClientTx, ExecSession, RelayState, TunnelRecord, MAX_SEND_QUEUE};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, warn};
use tunnel_protocol::{AgentSummary, RelayFrame, TunnelOrigin};
use uuid::Uuid;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

enum ConnRole {
    Unregistered,
    Agent(String),
    Client,
}

/// Drives one WebSocket connection end to end: splits the socket,
/// spawns an outbound drain task, processes inbound frames, and cleans
/// up every registry entry this connection touched on disconnect.
async fn handle_connection(socket: WebSocket, state: RelayState) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id, "new connection");

    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<RelayFrame>(MAX_SEND_QUEUE);

    state.connections.insert(conn_id.clone(), tx.clone());

    let ws_sink = Arc::new(AsyncMutex::new(ws_sink));
    let last_pong = Arc::new(std::sync::atomic::AtomicI64::new(now_millis()));

    let outbound_sink = ws_sink.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    warn!("serialize error: {e}");
                    continue;
                }
            };
            let mut sink = outbound_sink.lock().await;
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let ping_sink = ws_sink.clone();
    let ping_last_pong = last_pong.clone();
    let ping_conn_id = conn_id.clone();
    let ping_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        loop {
            ticker.tick().await;
            let elapsed = now_millis() - ping_last_pong.load(std::sync::atomic::Ordering::Relaxed);
            if elapsed > PONG_TIMEOUT.as_millis() as i64 {
                warn!(conn_id = %ping_conn_id, "pong timeout, closing connection");
                let _ = ping_sink.lock().await.send(Message::Close(None)).await;
                break;
            }
            if ping_sink.lock().await.send(Message::Ping(Vec::new().into())).await.is_err() {
                break;
            }
        }
    });

    let mut role = ConnRole::Unregistered;

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                if let Ok(frame) = serde_json::from_str::<RelayFrame>(&text) {
                    if !dispatch(&state, &conn_id, &tx, &mut role, frame).await {
                        break;
                    }
                }
            }
            Message::Pong(_) => {
                last_pong.store(now_millis(), std::sync::atomic::Ordering::Relaxed);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    outbound_task.abort();
    ping_task.abort();
    state.connections.remove(&conn_id);

    if let ConnRole::Agent(agent_id) = role {
        info!(agent_id, "agent disconnected");
        state.agents.remove(&agent_id);
        for tunnel in state.remove_tunnels_for(&agent_id, &conn_id) {
            notify_tunnel_closed(&state, &tunnel).await;
        }
        for _ in state.remove_exec_sessions_for(&agent_id, &conn_id) {}
    } else {
        for tunnel in state.remove_tunnels_for("", &conn_id) {
            notify_tunnel_closed(&state, &tunnel).await;
        }
        for _ in state.remove_exec_sessions_for("", &conn_id) {}
    }
}

fn now_millis() -> i64 {
    // Wall-clock reads are fine here (not part of replay-sensitive state);
    // monotonic Instant is used everywhere a duration is measured instead.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn notify_tunnel_closed(state: &RelayState, tunnel: &TunnelRecord) {
    let closed = RelayFrame::TunnelClosed { tunnel_id: tunnel.tunnel_id.clone() };
    if let Some(client_tx) = state.connections.get(&tunnel.client_conn_id) {
        let _ = client_tx.try_send(closed.clone());
    }
    if let Some(agent) = state.agents.get(&tunnel.agent_id) {
        let _ = agent.tx.try_send(closed);
    }
}

/// Returns `false` when the connection should be closed (admission
/// rejection).
async fn dispatch(
    state: &RelayState,
    conn_id: &str,
    tx: &ClientTx,
    role: &mut ConnRole,
    frame: RelayFrame,
) -> bool {
    match frame {
        RelayFrame::RegisterAgent { id, name, services, mode } => {
            if !state.has_capacity() {
                warn!(agent_id = %id, "relay at capacity, rejecting registration");
                let _ = tx.try_send(RelayFrame::Error { message: "relay at capacity".into() });
                return false;
            }

            state.agents.insert(
                id.clone(),
                AgentHandle { conn_id: conn_id.to_string(), tx: tx.clone(), name: name.clone(), services: services.clone(), mode },
            );
            *role = ConnRole::Agent(id.clone());

            // The relay only learns service *names* from the agent, not
            // the local ports behind them; those are reported to the
            // Manager out of band. Record them with a 0 placeholder so
            // directory listings at least show which services exist.
            let ports: HashMap<String, u16> = services.iter().map(|s| (s.clone(), 0u16)).collect();
            let agent_id = id.clone();
            let hostname = name.clone();
            if let Some(core) = state.core.clone() {
                tokio::spawn(async move {
                    if let Err(e) = core.register_agent_from_relay(&agent_id, &hostname, ports).await {
                        warn!("redis unavailable, agent directory degraded to local-only: {e}");
                    }
                });
            }

            info!(agent_id = %id, conn_id, "agent registered");
            let _ = tx.try_send(RelayFrame::RegistrationOk);
        }

        RelayFrame::ConnectClient { .. } => {
            *role = ConnRole::Client;
            let _ = tx.try_send(RelayFrame::ConnectionOk);
        }

        RelayFrame::ListAgents {} => {
            let agents = state
                .agents
                .iter()
                .map(|e| AgentSummary { id: e.key().clone(), name: e.name.clone(), services: e.services.clone() })
                .collect();
            let _ = tx.try_send(RelayFrame::AgentList { agents });
        }

        RelayFrame::StartTcpTunnel { id, tunnel_id, service, client_cn } => {
            match state.agents.get(&id) {
                Some(agent) => {
                    state.tunnels.insert(
                        tunnel_id.clone(),
                        TunnelRecord {
                            tunnel_id: tunnel_id.clone(),
                            client_conn_id: conn_id.to_string(),
                            agent_id: id.clone(),
                            service: service.clone(),
                            created_at: Instant::now(),
                            client_cn,
                        },
                    );
                    let _ = agent.tx.try_send(RelayFrame::StartTcpTunnel {
                        id: id.clone(),
                        tunnel_id: tunnel_id.clone(),
                        service: service.clone(),
                        client_cn: None,
                    });
                    let _ = tx.try_send(RelayFrame::TunnelStarted { tunnel_id, id, service });
                }
                None => {
                    let _ = tx.try_send(RelayFrame::Error { message: format!("agent '{id}' not registered on this relay") });
                }
            }
        }

        RelayFrame::TunnelData { tunnel_id, origin, data } => {
            if let Some(tunnel) = state.tunnels.get(&tunnel_id) {
                let forward = RelayFrame::TunnelData { tunnel_id: tunnel_id.clone(), origin, data };
                match origin {
                    TunnelOrigin::Client => {
                        if let Some(agent) = state.agents.get(&tunnel.agent_id) {
                            if agent.tx.try_send(forward).is_err() {
                                warn!(tunnel_id, "agent send queue full, dropping tunnel_data frame");
                            }
                        }
                    }
                    TunnelOrigin::Agent => {
                        if let Some(client_tx) = state.connections.get(&tunnel.client_conn_id) {
                            if client_tx.try_send(forward).is_err() {
                                warn!(tunnel_id, "client send queue full, dropping tunnel_data frame");
                            }
                        }
                    }
                }
            }
        }

        RelayFrame::TunnelClosed { tunnel_id } | RelayFrame::CloseTunnel { tunnel_id } => {
            if let Some((_, tunnel)) = state.tunnels.remove(&tunnel_id) {
                notify_tunnel_closed(state, &tunnel).await;
            }
        }

        RelayFrame::ExecuteCommand { id, exec_id, command, client_cn: _ } => {
            match state.agents.get(&id) {
                Some(agent) => {
                    state.exec_sessions.insert(
                        exec_id.clone(),
                        ExecSession { exec_id: exec_id.clone(), client_conn_id: conn_id.to_string(), agent_id: id.clone(), command: command.clone() },
                    );
                    let _ = agent.tx.try_send(RelayFrame::ExecuteCommand { id: id.clone(), exec_id: exec_id.clone(), command: command.clone(), client_cn: None });
                    let _ = tx.try_send(RelayFrame::ExecStarted { exec_id, id, command });
                }
                None => {
                    let _ = tx.try_send(RelayFrame::Error { message: format!("agent '{id}' not registered on this relay") });
                }
            }
        }

        RelayFrame::ExecOutput { exec_id, data } => {
            if let Some(session) = state.exec_sessions.get(&exec_id) {
                if let Some(client_tx) = state.connections.get(&session.client_conn_id) {
                    let _ = client_tx.try_send(RelayFrame::ExecOutput { exec_id: exec_id.clone(), data });
                }
            }
            // Unknown exec_id: silently dropped per spec §3 invariant.
        }

        RelayFrame::ExecComplete { exec_id } => {
            if let Some((_, session)) = state.exec_sessions.remove(&exec_id) {
                if let Some(client_tx) = state.connections.get(&session.client_conn_id) {
                    let _ = client_tx.try_send(RelayFrame::ExecComplete { exec_id });
                }
            }
        }

        RelayFrame::ExecError { exec_id, error } => {
            if let Some((_, session)) = state.exec_sessions.remove(&exec_id) {
                if let Some(client_tx) = state.connections.get(&session.client_conn_id) {
                    let _ = client_tx.try_send(RelayFrame::ExecError { exec_id, error });
                }
            }
        }

        RelayFrame::RegistrationOk
        | RelayFrame::ConnectionOk
        | RelayFrame::TunnelStarted { .. }
        | RelayFrame::ExecStarted { .. }
        | RelayFrame::AgentList { .. }
        | RelayFrame::Error { .. } => {
            // These are relay→peer-only frames; a peer sending one back is
            // a protocol violation we simply ignore rather than fault on.
        }
    }

    true
}
