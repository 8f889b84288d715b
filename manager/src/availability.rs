//! Saturation sampling, the sync-admission gate, and the adaptive
//! deferred-sync drainer (spec §4.3 "Saturation & Sync Admission
//! Controller").

use crate::state::ManagerState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use migasfree_core::{NodeStat, SaturationHistoryEntry, SaturationSnapshot};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use tunnel_protocol::RelayFrame;

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// Recovers the agent UUID from `/O=.../OU=.../CN=<uuid>_<cert-id>`.
fn uuid_from_ssl_client_cn(raw: &str) -> Option<String> {
    let cn = raw.split('/').find_map(|part| part.strip_prefix("CN="))?;
    cn.rsplit_once('_').map(|(uuid, _)| uuid.to_string())
}

/// `POST /v1/public/synchronizations/availability/` — every agent calls
/// this before `migasfree sync`. Saturation queues the caller instead of
/// admitting it (spec §4.3 points 1, 4).
pub async fn check_availability(State(state): State<ManagerState>, headers: HeaderMap) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(e) = state.core.increment_sync_attempt().await {
        warn!("failed to record sync attempt: {e}");
    }

    let saturated = match state.core.get_saturation().await {
        Ok(Some(snapshot)) => snapshot.saturated,
        Ok(None) => false,
        Err(e) => {
            warn!("saturation snapshot unavailable, admitting by default: {e}");
            false
        }
    };

    if !saturated {
        return (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })));
    }

    info!("server is saturated, queuing request");
    if let Some(raw_cn) = headers.get("x-ssl-client-cn").and_then(|v| v.to_str().ok()) {
        match uuid_from_ssl_client_cn(raw_cn) {
            Some(uuid) => match state.core.enqueue_sync_if_absent(&uuid).await {
                Ok(true) => info!(uuid, "queued sync request"),
                Ok(false) => info!(uuid, "uuid already queued"),
                Err(e) => error!("failed to enqueue sync request: {e}"),
            },
            None => warn!("could not parse uuid from X-SSL-Client-CN header"),
        }
    } else {
        debug!("no X-SSL-Client-CN header, skipping queueing");
    }

    let retry_after = state.config.sync_queue_process_interval * 5;
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({ "status": "saturated", "retry_after": retry_after })),
    )
}

/// Ticks every `METRICS_RECORDING_INTERVAL` seconds: Postgres latency,
/// Swarm CPU load for `_core`/`_database`, and (when fronted by
/// Pgpool-II) per-node query-rate accounting (spec §4.3 point 3).
pub async fn run_metrics_loop(state: ManagerState) {
    let mut ticker = tokio::time::interval(state.config.metrics_recording_interval_duration());
    loop {
        ticker.tick().await;
        if let Err(e) = record_metrics_tick(&state).await {
            error!("error recording metrics: {e}");
        }
    }
}

async fn record_metrics_tick(state: &ManagerState) -> Result<(), migasfree_core::CoreError> {
    let prev = state.core.get_saturation().await?;
    let prev_nodes: std::collections::HashMap<String, NodeStat> =
        prev.as_ref().map(|p| p.cluster_nodes.iter().map(|n| (n.id.clone(), n.clone())).collect()).unwrap_or_default();
    let prev_ts = prev.as_ref().map(|p| p.ts).unwrap_or(now_secs() - 10.0);

    let now_ts = now_secs();
    let elapsed = (now_ts - prev_ts).max(0.001);

    let db_latency = state.postgres.db_latency_probe().await;
    let core_load = state.portainer.cpu_load_for_suffix("_core").await;
    let db_load = state.portainer.cpu_load_for_suffix("_database").await;

    let saturated = db_latency > state.config.sync_max_db_latency || core_load.avg > state.config.sync_max_core_load;

    let cluster_nodes = if state.config.is_pgpool() {
        collect_pgpool_nodes(state, &prev_nodes, &db_load.nodes, elapsed).await.unwrap_or_else(|e| {
            warn!("could not fetch pgpool nodes status: {e}");
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let attempts = state.core.take_sync_attempts().await?;

    let snapshot = SaturationSnapshot {
        ts: now_ts,
        saturated,
        db_latency,
        core_cpu: core_load.avg,
        db_cpu: db_load.avg,
        cluster_nodes: cluster_nodes.clone(),
    };
    state.core.set_saturation(&snapshot).await?;

    let history_entry = SaturationHistoryEntry {
        ts: now_ts,
        saturated,
        db_latency,
        core_cpu: core_load.avg,
        db_cpu: db_load.avg,
        attempts,
        cluster_nodes,
    };
    state.core.append_history(&history_entry, state.config.metrics_retention_limit).await?;

    Ok(())
}

async fn collect_pgpool_nodes(
    state: &ManagerState,
    prev_nodes: &std::collections::HashMap<String, NodeStat>,
    db_node_loads: &std::collections::HashMap<String, f64>,
    elapsed: f64,
) -> Result<Vec<NodeStat>, migasfree_core::CoreError> {
    let nodes = state.postgres.show_pool_nodes().await?;
    let stats = state.postgres.show_pool_backend_stats().await?;

    let mut out = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let Some(node_id) = node.get("node_id") else { continue };
        let backend = stats.iter().find(|s| s.get("node_id") == Some(node_id));

        let current_selects = backend.map(|b| b.get_cnt(&["select_cnt", "select"])).unwrap_or(0);
        let current_writes = backend
            .map(|b| {
                b.get_cnt(&["insert_cnt", "insert"])
                    + b.get_cnt(&["update_cnt", "update"])
                    + b.get_cnt(&["delete_cnt", "delete"])
                    + b.get_cnt(&["ddl_cnt", "ddl"])
                    + b.get_cnt(&["copy_cnt", "copy"])
            })
            .unwrap_or(0);
        let current_errors = backend.map(|b| b.get_cnt(&["error_cnt", "error"])).unwrap_or(0);

        let prev = prev_nodes.get(node_id);
        let delta_sel = (current_selects - prev.map(|p| p.select_cnt).unwrap_or(current_selects)).max(0);
        let delta_wri = (current_writes - prev.map(|p| p.write_cnt).unwrap_or(current_writes)).max(0);
        let delta_err = (current_errors - prev.map(|p| p.error_cnt).unwrap_or(current_errors)).max(0);

        let hostname = node.get("hostname").map(str::to_string);
        let cpu_load = hostname.as_deref().and_then(|h| db_node_loads.get(h)).copied();

        out.push(NodeStat {
            id: node_id.to_string(),
            host: hostname,
            status: node.get("status").map(str::to_string),
            role: node.get("role").map(str::to_string),
            cpu_load: cpu_load.map(|v| (v * 10.0).round() / 10.0),
            select_cnt: current_selects,
            write_cnt: current_writes,
            error_cnt: current_errors,
            select_qpm: (delta_sel as f64 / elapsed * 60.0 * 100.0).round() / 100.0,
            write_wpm: (delta_wri as f64 / elapsed * 60.0 * 100.0).round() / 100.0,
            error_epm: (delta_err as f64 / elapsed * 60.0 * 100.0).round() / 100.0,
            replication_delay: node.get("replication_delay").and_then(|v| v.parse().ok()).unwrap_or(0),
        });
    }
    Ok(out)
}

/// Drains the deferred sync queue with a concurrency that shrinks as
/// core load rises toward `SYNC_MAX_CORE_LOAD` (spec §4.3 point 4).
pub async fn run_sync_queue_loop(state: ManagerState) {
    let mut ticker = tokio::time::interval(state.config.sync_queue_process_interval_duration());
    loop {
        ticker.tick().await;
        if let Err(e) = drain_sync_queue_tick(&state).await {
            error!("error in sync queue loop: {e}");
        }
    }
}

async fn drain_sync_queue_tick(state: &ManagerState) -> Result<(), migasfree_core::CoreError> {
    let Some(snapshot) = state.core.get_saturation().await? else { return Ok(()) };
    if snapshot.saturated {
        return Ok(());
    }

    let max_load = state.config.sync_max_core_load;
    let utilization_ratio = if max_load > 0.0 { snapshot.core_cpu / max_load } else { 1.0 };
    let capacity_factor = (1.0 - utilization_ratio).clamp(0.0, 1.0);
    let batch_size = if capacity_factor > 0.05 { ((state.config.sync_max_concurrency as f64 * capacity_factor) as usize).max(1) } else { 0 };

    if batch_size == 0 {
        return Ok(());
    }

    let uuids = state.core.drain_sync_queue(batch_size).await?;
    if uuids.is_empty() {
        return Ok(());
    }
    debug!(count = uuids.len(), load = snapshot.core_cpu, "draining sync queue");

    let mut handles = Vec::with_capacity(uuids.len());
    for uuid in uuids {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            match state.postgres.get_cid_from_uuid(&uuid).await {
                Ok(Some(cid)) => {
                    if let Err(e) = trigger_sync_via_websocket(&state, cid).await {
                        error!(cid, "error triggering sync: {e}");
                    } else {
                        info!(cid, "sync triggered");
                    }
                }
                Ok(None) => warn!(uuid, "could not resolve cid for uuid"),
                Err(e) => error!(uuid, "error resolving cid: {e}"),
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum SyncTriggerError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("remote reported an error: {0}")]
    Remote(String),
    #[error("connection closed before completion")]
    ClosedEarly,
}

/// Connects to the Manager's own exec console as a trusted admin client
/// and runs `migasfree sync` on the target computer (spec §4.3 point 4).
async fn trigger_sync_via_websocket(state: &ManagerState, cid: i64) -> Result<(), SyncTriggerError> {
    let url = format!("ws://127.0.0.1:8080/v1/private/tunnel/ws/agents/{cid}?service=exec");
    let mut request = url
        .into_client_request()
        .map_err(|e| SyncTriggerError::Dial(e.to_string()))?;
    request.headers_mut().insert(
        "X-SSL-Client-CN",
        "/O=migasfree/OU=ADMINS/CN=manager".parse().unwrap(),
    );

    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| SyncTriggerError::Dial(e.to_string()))?;

    let payload = RelayFrame::ExecuteCommand {
        id: cid.to_string(),
        exec_id: uuid::Uuid::new_v4().to_string(),
        command: "migasfree sync".to_string(),
        client_cn: None,
    };
    let text = serde_json::to_string(&payload).map_err(|e| SyncTriggerError::Dial(e.to_string()))?;
    use futures::SinkExt;
    ws.send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
        .await
        .map_err(|e| SyncTriggerError::Dial(e.to_string()))?;

    use futures::StreamExt;
    while let Some(Ok(msg)) = ws.next().await {
        if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
            match serde_json::from_str::<RelayFrame>(&text) {
                Ok(RelayFrame::ExecComplete { .. }) => return Ok(()),
                Ok(RelayFrame::ExecError { error, .. }) => return Err(SyncTriggerError::Remote(error)),
                _ => continue,
            }
        }
    }
    Err(SyncTriggerError::ClosedEarly)
}

use tokio_tungstenite::tungstenite::client::IntoClientRequest;

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub current: Option<SaturationSnapshot>,
    pub history: Vec<SaturationHistoryEntry>,
    pub limits: MetricsLimits,
}

#[derive(Debug, Serialize)]
pub struct MetricsLimits {
    pub db_latency: f64,
    pub core_cpu: f64,
    pub recording_interval: u64,
}

pub async fn metrics_json(State(state): State<ManagerState>) -> Result<Json<MetricsResponse>, crate::error::ManagerError> {
    let current = state.core.get_saturation().await?;
    let history = state.core.get_history().await?;
    Ok(Json(MetricsResponse {
        current,
        history,
        limits: MetricsLimits {
            db_latency: state.config.sync_max_db_latency,
            core_cpu: state.config.sync_max_core_load,
            recording_interval: state.config.metrics_recording_interval,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_from_cn_splits_on_last_underscore() {
        let dn = "/O=migasfree/OU=computers/CN=3f9e-uuid_cert-42";
        assert_eq!(uuid_from_ssl_client_cn(dn).as_deref(), Some("3f9e-uuid"));
    }

    #[test]
    fn uuid_from_cn_returns_none_without_a_cn() {
        assert_eq!(uuid_from_ssl_client_cn("/O=migasfree/OU=computers"), None);
    }
}
