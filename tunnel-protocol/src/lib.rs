//! # Tunnel Wire Protocol
//!
//! JSON text frames exchanged over the three WebSocket legs of the control
//! plane: agent↔relay, client↔relay, and the Manager's own browser-facing
//! service console. Binary payloads are always carried as lowercase hex
//! strings under a `data` field — never raw WS binary frames on the
//! relay-facing legs, so every frame round-trips through `serde_json`
//! cleanly.
//!
//! [`RelayFrame`] is the exhaustive frame set for the agent/client/relay
//! triangle. [`ConsoleFrame`] is the narrower set used
//! between a browser and the Manager's `ws/agents/{id}` endpoint, which
//! speaks a slightly different vocabulary (`status`, `resize`, ...).
//!
//! Frames with an unrecognized `type` fail to deserialize; callers treat
//! that as "ignore this frame" rather than a fatal error, so the wire stays
//! forward-compatible with newer peers.

use serde::{Deserialize, Serialize};

/// All frames exchanged between agents, clients, and a relay.
///
/// Serialized with serde's internally-tagged representation: every frame
/// is a JSON object with a `"type"` field holding the snake_case variant
/// name, e.g. `RelayFrame::RegisterAgent { .. }` becomes
/// `{"type": "register_agent", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    // ── Agent → Relay ──────────────────────────────────────────────
    /// Agent announces itself and the local services it exposes.
    RegisterAgent {
        id: String,
        name: String,
        #[serde(default)]
        services: Vec<String>,
        #[serde(default)]
        mode: Option<String>,
    },
    /// Agent reports a completed remote command.
    ExecComplete { exec_id: String },
    /// Agent reports a failed remote command.
    ExecError { exec_id: String, error: String },
    /// Agent streams output from a running remote command.
    ExecOutput { exec_id: String, data: String },

    // ── Client → Relay ────────────────────────────────────────────
    /// Client identifies itself to the relay (no agent services).
    ConnectClient {
        #[serde(default)]
        mode: Option<String>,
    },
    /// Client asks the relay for its locally-registered agents.
    ListAgents {},
    /// Client asks the relay to open a tunnel to one of the agent's
    /// advertised services.
    StartTcpTunnel {
        id: String,
        tunnel_id: String,
        service: String,
        #[serde(default)]
        client_cn: Option<String>,
    },
    /// Client tears down a tunnel it owns.
    CloseTunnel { tunnel_id: String },
    /// Client asks the relay to fan a command out to an agent.
    ExecuteCommand {
        id: String,
        exec_id: String,
        command: String,
        #[serde(default)]
        client_cn: Option<String>,
    },

    // ── Either side, relayed strictly by `origin` ────────────────────
    /// Tunnel payload, hex-encoded. `origin` disambiguates direction when
    /// both peers share this one variant name.
    TunnelData {
        tunnel_id: String,
        origin: TunnelOrigin,
        data: String,
    },
    /// Either peer reports its half of the tunnel has closed.
    TunnelClosed { tunnel_id: String },

    // ── Relay → peer ──────────────────────────────────────────────
    RegistrationOk,
    ConnectionOk,
    TunnelStarted {
        tunnel_id: String,
        id: String,
        service: String,
    },
    ExecStarted {
        exec_id: String,
        id: String,
        command: String,
    },
    /// Answers a client's `list_agents` with this relay's local registry.
    AgentList { agents: Vec<AgentSummary> },
    Error {
        message: String,
    },
}

/// One entry in an [`RelayFrame::AgentList`] response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub services: Vec<String>,
}

/// Who produced a [`RelayFrame::TunnelData`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelOrigin {
    Agent,
    Client,
}

/// Frames exchanged between a browser (the SSH/VNC/RDP web console) and
/// the Manager's `WS /v1/private/tunnel/ws/agents/{agent_id}` endpoint.
///
/// This is a distinct, narrower vocabulary from [`RelayFrame`] — the
/// browser never speaks directly to a relay, only to the Manager, which
/// re-encodes onto `RelayFrame::TunnelData` on the agent-facing leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleFrame {
    /// PTY/tunnel bytes, hex-encoded, in either direction.
    Data { data: String },
    /// Browser requests a PTY window resize (SSH only).
    Resize { cols: u16, rows: u16 },
}

/// Non-tagged status frame the Manager sends once a console session is
/// live: `{"status": "connected", "tunnel_id": "..."}`. Kept separate from
/// [`ConsoleFrame`] because it uses a `status` discriminator, not `type`,
/// matching the original console's JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConnected {
    pub status: &'static str,
    pub tunnel_id: String,
}

impl ConsoleConnected {
    pub fn new(tunnel_id: impl Into<String>) -> Self {
        Self {
            status: "connected",
            tunnel_id: tunnel_id.into(),
        }
    }
}

/// Generates a fresh web-console tunnel id in the `web-<uuid>` shape,
/// without requiring callers to depend on `uuid` directly.
pub fn new_web_tunnel_id() -> String {
    format!("web-{}", generate_uuid_v4())
}

/// Generates a short, relay-local session id (8 lowercase hex chars) for
/// tunnel/stream/exec ids.
pub fn new_short_id() -> String {
    generate_uuid_v4().split('-').next().unwrap_or_default().to_string()
}

fn generate_uuid_v4() -> String {
    uuid_crate::Uuid::new_v4().to_string()
}

// Re-exported under a private alias so this crate doesn't force every
// downstream consumer to also depend on `uuid` just to call the two
// helpers above.
mod uuid_crate {
    pub use uuid::Uuid;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_agent_round_trips() {
        let frame = RelayFrame::RegisterAgent {
            id: "CID-42".into(),
            name: "host1".into(),
            services: vec!["ssh".into(), "vnc".into()],
            mode: Some("tcp_tunnel".into()),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"register_agent\""));
        let back: RelayFrame = serde_json::from_str(&json).unwrap();
        match back {
            RelayFrame::RegisterAgent { id, services, .. } => {
                assert_eq!(id, "CID-42");
                assert_eq!(services.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tunnel_data_preserves_origin() {
        let frame = RelayFrame::TunnelData {
            tunnel_id: "web-1".into(),
            origin: TunnelOrigin::Client,
            data: "deadbeef".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: RelayFrame = serde_json::from_str(&json).unwrap();
        matches!(back, RelayFrame::TunnelData { origin: TunnelOrigin::Client, .. });
    }

    #[test]
    fn unknown_type_fails_to_parse_but_does_not_panic() {
        let raw = r#"{"type":"some_future_frame","foo":"bar"}"#;
        let parsed: Result<RelayFrame, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn console_connected_uses_status_field() {
        let c = ConsoleConnected::new("web-abc");
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"status\":\"connected\""));
        assert!(json.contains("\"tunnel_id\":\"web-abc\""));
    }

    #[test]
    fn web_tunnel_id_has_expected_prefix() {
        assert!(new_web_tunnel_id().starts_with("web-"));
        assert_eq!(new_short_id().len(), 8);
    }
}
