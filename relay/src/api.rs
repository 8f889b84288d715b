//! Plain HTTP surface alongside the WebSocket hub: the health probe and
//! a debug agent listing (spec §4.1 "Health").

use crate::state::RelayState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

pub async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
pub struct AgentListItem {
    pub agent_id: String,
    pub name: String,
    pub services: Vec<String>,
}

pub async fn list_agents(State(state): State<RelayState>) -> Json<Vec<AgentListItem>> {
    let agents = state
        .agents
        .iter()
        .map(|e| AgentListItem { agent_id: e.key().clone(), name: e.name.clone(), services: e.services.clone() })
        .collect();
    Json(agents)
}
