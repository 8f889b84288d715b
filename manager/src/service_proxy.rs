//! `WS /v1/private/tunnel/ws/agents/{agent_id}`: the browser-facing SSH,
//! VNC, and RDP consoles (spec §4.2 point 4/5). The Manager dials the
//! agent's relay as an ordinary tunnel client, then either bridges a
//! PTY-backed `ssh -tt` subprocess (SSH) or relays bytes straight
//! through (VNC/RDP).

use crate::auth::authenticate_admin;
use crate::error::ManagerError;
use crate::state::{ManagerState, SshSession};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use nix::pty::openpty;
use nix::unistd::setsid;
use serde::Deserialize;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as RelayMessage;
use tracing::{info, warn};
use tunnel_protocol::{new_web_tunnel_id, ConsoleConnected, ConsoleFrame, RelayFrame, TunnelOrigin};

const RELAY_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SSH_KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct ConsoleQuery {
    #[serde(default = "default_service")]
    pub service: String,
    pub username: Option<String>,
}

fn default_service() -> String {
    "ssh".to_string()
}

pub async fn console_ws(
    ws: WebSocketUpgrade,
    State(state): State<ManagerState>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
    Query(query): Query<ConsoleQuery>,
) -> Result<impl IntoResponse, ManagerError> {
    authenticate_admin(&headers, &state.config.core_base_url, &state.http).await?;
    Ok(ws.on_upgrade(move |socket| run_console(socket, state, agent_id, query)))
}

async fn run_console(mut browser: WebSocket, state: ManagerState, agent_id: String, query: ConsoleQuery) {
    if !matches!(query.service.as_str(), "ssh" | "vnc" | "rdp" | "exec") {
        let _ = send_error(&mut browser, &format!("service {} not supported", query.service)).await;
        return;
    }
    let username = if query.service == "ssh" {
        query.username.clone().unwrap_or_else(|| "root".to_string())
    } else {
        query.username.clone().unwrap_or_default()
    };

    let agent = match state.core.get_agent(&agent_id).await {
        Ok(Some(a)) => a,
        Ok(None) => {
            let _ = send_error(&mut browser, "agent not found").await;
            return;
        }
        Err(e) => {
            warn!("console: redis unavailable: {e}");
            let _ = send_error(&mut browser, "internal service error (redis)").await;
            return;
        }
    };

    let target_url = match (&agent.server_ip, &agent.relay_url) {
        (Some(ip), _) => format!("ws://{ip}:7070/ws"),
        (None, Some(url)) => url.clone(),
        (None, None) => {
            let _ = send_error(&mut browser, "agent has no relay registered").await;
            return;
        }
    };

    info!(agent_id, service = %query.service, %username, "opening web console");

    let relay = match tokio::time::timeout(RELAY_DIAL_TIMEOUT, tokio_tungstenite::connect_async(&target_url)).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            let _ = send_error(&mut browser, &format!("failed to reach relay: {e}")).await;
            return;
        }
        Err(_) => {
            let _ = send_error(&mut browser, "timed out connecting to relay").await;
            return;
        }
    };
    let (mut relay_tx, mut relay_rx) = relay.split();

    if send_relay_frame(&mut relay_tx, &RelayFrame::ConnectClient { mode: None }).await.is_err() {
        let _ = send_error(&mut browser, "failed to identify with relay").await;
        return;
    }
    match recv_relay_frame(&mut relay_rx).await {
        Some(RelayFrame::ConnectionOk) => {}
        _ => {
            let _ = send_error(&mut browser, "relay rejected client identification").await;
            return;
        }
    }

    if query.service == "exec" {
        run_exec_console(browser, relay_tx, relay_rx).await;
        return;
    }

    let tunnel_id = new_web_tunnel_id();
    let start = RelayFrame::StartTcpTunnel {
        id: agent_id.clone(),
        tunnel_id: tunnel_id.clone(),
        service: query.service.clone(),
        client_cn: None,
    };
    if send_relay_frame(&mut relay_tx, &start).await.is_err() {
        let _ = send_error(&mut browser, "failed to request tunnel").await;
        return;
    }
    match recv_relay_frame(&mut relay_rx).await {
        Some(RelayFrame::TunnelStarted { .. }) => {}
        Some(RelayFrame::Error { message }) => {
            let _ = send_error(&mut browser, &message).await;
            return;
        }
        _ => {
            let _ = send_error(&mut browser, "failed to start tunnel").await;
            return;
        }
    }

    if query.service == "ssh" {
        run_ssh_console(browser, relay_tx, relay_rx, state, tunnel_id, username).await;
    } else {
        run_raw_console(browser, relay_tx, relay_rx, tunnel_id).await;
    }
}

async fn send_error(browser: &mut WebSocket, message: &str) {
    let _ = browser
        .send(WsMessage::Text(serde_json::json!({ "error": message }).to_string().into()))
        .await;
    let _ = browser.send(WsMessage::Close(None)).await;
}

type RelaySink = futures::stream::SplitSink<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, RelayMessage>;
type RelaySource = futures::stream::SplitStream<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>;

async fn send_relay_frame(tx: &mut RelaySink, frame: &RelayFrame) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    tx.send(RelayMessage::Text(text.into())).await.map_err(|_| ())
}

async fn recv_relay_frame(rx: &mut RelaySource) -> Option<RelayFrame> {
    while let Some(Ok(msg)) = rx.next().await {
        if let RelayMessage::Text(text) = msg {
            if let Ok(frame) = serde_json::from_str::<RelayFrame>(&text) {
                return Some(frame);
            }
        }
    }
    None
}

/// `exec` bridge: no tunnel is opened, the caller (the sync queue drainer,
/// or an admin console) speaks `RelayFrame` directly — `ExecuteCommand`
/// in, `ExecOutput`/`ExecComplete`/`ExecError` back out — so frames are
/// forwarded verbatim rather than re-encoded as [`ConsoleFrame`].
async fn run_exec_console(mut browser: WebSocket, mut relay_tx: RelaySink, mut relay_rx: RelaySource) {
    loop {
        tokio::select! {
            browser_msg = browser.next() => {
                match browser_msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<RelayFrame>(&text) {
                            if send_relay_frame(&mut relay_tx, &frame).await.is_err() { break; }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    _ => {}
                }
            }
            relay_msg = relay_rx.next() => {
                match relay_msg {
                    Some(Ok(RelayMessage::Text(text))) => {
                        let text = text.to_string();
                        if browser.send(WsMessage::Text(text.clone().into())).await.is_err() { break; }
                        if let Ok(frame) = serde_json::from_str::<RelayFrame>(&text) {
                            if matches!(frame, RelayFrame::ExecComplete { .. } | RelayFrame::ExecError { .. }) {
                                break;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
    let _ = browser.send(WsMessage::Close(None)).await;
}

/// Generic VNC/RDP bridge: browser bytes (binary or hex-in-JSON) flow
/// straight onto `tunnel_data`, and back, with no protocol awareness.
async fn run_raw_console(mut browser: WebSocket, mut relay_tx: RelaySink, mut relay_rx: RelaySource, tunnel_id: String) {
    let connected = ConsoleConnected::new(tunnel_id.clone());
    if browser.send(WsMessage::Text(serde_json::to_string(&connected).unwrap().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            browser_msg = browser.next() => {
                match browser_msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let frame = RelayFrame::TunnelData { tunnel_id: tunnel_id.clone(), origin: TunnelOrigin::Client, data: hex::encode(&data) };
                        if send_relay_frame(&mut relay_tx, &frame).await.is_err() { break; }
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) {
                            if let Some(hex_data) = v.get("data").and_then(|d| d.as_str()) {
                                let frame = RelayFrame::TunnelData { tunnel_id: tunnel_id.clone(), origin: TunnelOrigin::Client, data: hex_data.to_string() };
                                if send_relay_frame(&mut relay_tx, &frame).await.is_err() { break; }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    _ => {}
                }
            }
            relay_msg = relay_rx.next() => {
                match relay_msg {
                    Some(Ok(RelayMessage::Text(text))) => {
                        match serde_json::from_str::<RelayFrame>(&text) {
                            Ok(RelayFrame::TunnelData { data, .. }) => {
                                if let Ok(bytes) = hex::decode(&data) {
                                    if browser.send(WsMessage::Binary(bytes.into())).await.is_err() { break; }
                                }
                            }
                            Ok(RelayFrame::TunnelClosed { .. }) => break,
                            _ => {}
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }

    let _ = send_relay_frame(&mut relay_tx, &RelayFrame::CloseTunnel { tunnel_id: tunnel_id.clone() }).await;
    let _ = browser.send(WsMessage::Close(None)).await;
}

/// SSH console: a local TCP loopback + a PTY-attached `ssh -tt` bridge
/// the tunnel to, so the agent side only ever sees a normal SSH client
/// (spec §4.2 point 4).
async fn run_ssh_console(
    mut browser: WebSocket,
    mut relay_tx: RelaySink,
    mut relay_rx: RelaySource,
    state: ManagerState,
    tunnel_id: String,
    username: String,
) {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => {
            let _ = send_error(&mut browser, &format!("failed to open local proxy: {e}")).await;
            return;
        }
    };
    let local_port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(_) => {
            let _ = send_error(&mut browser, "failed to read local proxy port").await;
            return;
        }
    };

    let (master, slave) = match openpty(None, None) {
        Ok(pty) => (pty.master, pty.slave),
        Err(e) => {
            let _ = send_error(&mut browser, &format!("failed to allocate pty: {e}")).await;
            return;
        }
    };

    let mut cmd = tokio::process::Command::new("ssh");
    cmd.arg("-tt")
        .arg("-o").arg("StrictHostKeyChecking=no")
        .arg("-o").arg("UserKnownHostsFile=/dev/null")
        .arg("-o").arg("PreferredAuthentications=password,keyboard-interactive,publickey")
        .arg("-o").arg("ServerAliveInterval=30")
        .arg("-o").arg("ServerAliveCountMax=3")
        .arg("-p").arg(local_port.to_string())
        .arg(format!("{username}@127.0.0.1"))
        .env("TERM", "xterm-256color")
        .env("LANG", "C.UTF-8")
        .env("LC_ALL", "C.UTF-8")
        .stdin(dup_stdio(&slave))
        .stdout(dup_stdio(&slave))
        .stderr(dup_stdio(&slave));

    unsafe {
        cmd.pre_exec(|| {
            let _ = setsid();
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            let _ = send_error(&mut browser, &format!("failed to spawn ssh: {e}")).await;
            return;
        }
    };
    drop(slave);
    let pid = child.id();
    state.ssh_sessions.insert(tunnel_id.clone(), SshSession { pid: Some(pid) });

    let master_raw = master.as_raw_fd();
    let master_file = tokio::fs::File::from_std(std::fs::File::from(master));

    let connected = ConsoleConnected::new(tunnel_id.clone());
    if browser.send(WsMessage::Text(serde_json::to_string(&connected).unwrap().into())).await.is_err() {
        cleanup_ssh(&mut child, &state, &tunnel_id).await;
        return;
    }

    let (master_rd, mut master_wr) = tokio::io::split(master_file);
    let mut master_rd = master_rd;

    let accept_fut = listener.accept();
    tokio::pin!(accept_fut);

    let mut local_stream = None;
    let mut pty_buf = [0u8; 4096];
    let mut local_buf = [0u8; 4096];

    loop {
        tokio::select! {
            accepted = &mut accept_fut, if local_stream.is_none() => {
                match accepted {
                    Ok((stream, _)) => local_stream = Some(stream),
                    Err(e) => { warn!("ssh console: local accept failed: {e}"); break; }
                }
            }
            n = master_rd.read(&mut pty_buf) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = ConsoleFrame::Data { data: hex::encode(&pty_buf[..n]) };
                        if browser.send(WsMessage::Text(serde_json::to_string(&frame).unwrap().into())).await.is_err() { break; }
                    }
                }
            }
            n = async { match &mut local_stream { Some(s) => s.read(&mut local_buf).await, None => std::future::pending().await } }, if local_stream.is_some() => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = RelayFrame::TunnelData { tunnel_id: tunnel_id.clone(), origin: TunnelOrigin::Client, data: hex::encode(&local_buf[..n]) };
                        if send_relay_frame(&mut relay_tx, &frame).await.is_err() { break; }
                    }
                }
            }
            relay_msg = relay_rx.next() => {
                match relay_msg {
                    Some(Ok(RelayMessage::Text(text))) => {
                        match serde_json::from_str::<RelayFrame>(&text) {
                            Ok(RelayFrame::TunnelData { data, .. }) => {
                                if let (Some(stream), Ok(bytes)) = (&mut local_stream, hex::decode(&data)) {
                                    if stream.write_all(&bytes).await.is_err() { break; }
                                }
                            }
                            Ok(RelayFrame::TunnelClosed { .. }) => break,
                            _ => {}
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
            browser_msg = browser.next() => {
                match browser_msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ConsoleFrame>(&text) {
                            Ok(ConsoleFrame::Resize { cols, rows }) => resize_pty(master_raw, cols, rows),
                            Ok(ConsoleFrame::Data { data }) => {
                                if let Ok(bytes) = hex::decode(&data) {
                                    if master_wr.write_all(&bytes).await.is_err() { break; }
                                }
                            }
                            Err(_) => {}
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }

    let _ = send_relay_frame(&mut relay_tx, &RelayFrame::CloseTunnel { tunnel_id: tunnel_id.clone() }).await;
    let _ = browser.send(WsMessage::Close(None)).await;
    cleanup_ssh(&mut child, &state, &tunnel_id).await;
    info!(%username, %tunnel_id, "ssh console session ended");
}

async fn cleanup_ssh(child: &mut tokio::process::Child, state: &ManagerState, tunnel_id: &str) {

    let _ = child.start_kill();
    let _ = tokio::time::timeout(SSH_KILL_GRACE, child.wait()).await;
    state.ssh_sessions.remove(tunnel_id);
}

fn resize_pty(master_fd: std::os::unix::io::RawFd, cols: u16, rows: u16) {
    #[repr(C)]
    struct Winsize {
        ws_row: libc::c_ushort,
        ws_col: libc::c_ushort,
        ws_xpixel: libc::c_ushort,
        ws_ypixel: libc::c_ushort,
    }
    let ws = Winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };
    unsafe {
        libc::ioctl(master_fd, libc::TIOCSWINSZ, &ws as *const Winsize);
    }
}

fn dup_stdio(fd: &OwnedFd) -> std::process::Stdio {
    let cloned = fd.try_clone().expect("dup pty slave fd");
    std::process::Stdio::from(cloned)
}
