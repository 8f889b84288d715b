//! `/v1/private/tunnel/*`: relay selection, agent directory listing
//! (spec §4.2, §6.3).

use crate::auth::authenticate_admin;
use crate::error::ManagerError;
use crate::state::ManagerState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use migasfree_core::AgentRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RegisterTunnelRequest {
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub server_ip: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterTunnelResponse {
    pub relay_url: String,
    pub internal_url: String,
}

/// A relay picks itself as least-loaded and asks the Manager to record
/// it as the agent's assigned relay — the sole writer of `relay_url`
/// and `server_ip` on an agent record (spec §4.2 invariant).
pub async fn register_tunnel(
    State(state): State<ManagerState>,
    headers: HeaderMap,
    Json(req): Json<RegisterTunnelRequest>,
) -> Result<Json<RegisterTunnelResponse>, ManagerError> {
    authenticate_admin(&headers, &state.config.core_base_url, &state.http).await?;

    // No relay has heartbeated yet: fall back to the HAProxy-fronted default
    // rather than failing the agent's registration outright (spec §8 Scenario 1).
    let (relay_url, internal_url) = match state.core.pick_least_loaded_relay().await? {
        Some(relay) => (relay.url, relay.internal_url),
        None => (state.config.default_relay_url.clone(), state.config.default_relay_url.clone()),
    };

    let mut record = state.core.get_agent(&req.agent_id).await?.unwrap_or_else(|| AgentRecord {
        agent_id: req.agent_id.clone(),
        hostname: req.hostname.clone(),
        info: serde_json::Value::Null,
        services: Default::default(),
        relay_url: None,
        server_ip: None,
    });
    record.hostname = req.hostname;
    record.relay_url = Some(relay_url.clone());
    record.server_ip = req.server_ip.or_else(|| Some(internal_url.clone()));

    state.core.put_agent(&record).await?;

    Ok(Json(RegisterTunnelResponse { relay_url, internal_url }))
}

#[derive(Debug, Deserialize)]
pub struct ListAgentsQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub q: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct ListAgentsResponse {
    pub agents: Vec<AgentRecord>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

pub async fn list_agents(
    State(state): State<ManagerState>,
    headers: HeaderMap,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<ListAgentsResponse>, ManagerError> {
    authenticate_admin(&headers, &state.config.core_base_url, &state.http).await?;

    let page = state.core.list_agents(query.page, query.limit, query.q.as_deref()).await?;
    Ok(Json(ListAgentsResponse { agents: page.agents, total: page.total, page: page.page, limit: page.limit }))
}

pub async fn get_agent(
    State(state): State<ManagerState>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentRecord>, ManagerError> {
    authenticate_admin(&headers, &state.config.core_base_url, &state.http).await?;

    state
        .core
        .get_agent(&agent_id)
        .await?
        .map(Json)
        .ok_or_else(|| ManagerError::NotFound(format!("agent '{agent_id}'")))
}
