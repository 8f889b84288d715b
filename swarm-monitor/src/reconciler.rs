//! The 5s polling reconciler. A Docker event subscription would shorten
//! reaction time between polls, but Portainer's proxy exposes the event
//! stream only as a long-lived chunked response, so a plain polling loop
//! is what's implemented here.

use crate::client::PortainerClient;
use crate::state::{ServiceState, ServiceStatus};
use serde_json::Value;

const RECONCILE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

pub async fn poll_once(client: &PortainerClient) -> Vec<ServiceState> {
    let services = match client.list_services().await {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::with_capacity(services.len());
    for svc in services {
        let Some(name) = svc.get("Spec").and_then(|s| s.get("Name")).and_then(Value::as_str) else { continue };
        let Some(id) = svc.get("ID").and_then(Value::as_str) else { continue };

        let mode_obj = svc.get("Spec").and_then(|s| s.get("Mode")).cloned().unwrap_or(Value::Null);
        let (mode, desired) = if let Some(replicated) = mode_obj.get("Replicated") {
            ("replicated", replicated.get("Replicas").and_then(Value::as_u64).unwrap_or(0) as u32)
        } else if mode_obj.get("Global").is_some() {
            ("global", 0)
        } else {
            ("unknown", 0)
        };

        let tasks = client.list_tasks_for_service(id).await.unwrap_or_default();
        let mut running = 0u32;
        let mut preparing = 0u32;
        let mut failed = 0u32;
        let mut nodes = Vec::new();
        let mut containers = Vec::new();

        for task in &tasks {
            let state = task
                .get("Status")
                .and_then(|s| s.get("State"))
                .and_then(Value::as_str)
                .unwrap_or("");
            match state {
                "running" => running += 1,
                "starting" | "preparing" | "assigning" | "pending" | "accepted" | "ready" => preparing += 1,
                "failed" | "rejected" => failed += 1,
                _ => {}
            }
            if let Some(node_id) = task.get("NodeID").and_then(Value::as_str) {
                if !nodes.contains(&node_id.to_string()) {
                    nodes.push(node_id.to_string());
                }
            }
            if let Some(cid) = task
                .get("Status")
                .and_then(|s| s.get("ContainerStatus"))
                .and_then(|c| c.get("ContainerID"))
                .and_then(Value::as_str)
            {
                containers.push(cid.to_string());
            }
        }

        let desired = if mode == "global" { tasks.len() as u32 } else { desired };
        let status = ServiceState::derive_status(running, desired, preparing);

        out.push(ServiceState {
            name: name.to_string(),
            running,
            desired,
            preparing,
            failed,
            status,
            mode: mode.to_string(),
            nodes,
            containers,
        });
    }

    out
}

/// Runs the reconciler loop until the given token is cancelled,
/// feeding every tick's events into `on_events`.
pub async fn run_reconciler_loop<F>(
    client: std::sync::Arc<PortainerClient>,
    cache: std::sync::Arc<crate::state::ServiceStateCache>,
    stack: String,
    mut on_events: F,
    cancellation: tokio_util::sync::CancellationToken,
) where
    F: FnMut(Vec<crate::state::SseEvent>) + Send,
{
    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let services = poll_once(&client).await;
                let events = cache.reconcile(&stack, services);
                if !events.is_empty() {
                    on_events(events);
                }
            }
            _ = cancellation.cancelled() => break,
        }
    }
}
