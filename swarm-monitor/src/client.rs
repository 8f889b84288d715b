//! Portainer's authenticated REST proxy onto the Swarm/Docker API (spec
//! §4.3 point 2, §4.5). Nothing here talks to the Docker socket directly
//! — every call is proxied through Portainer, including cross-node
//! container stats via `X-PortainerAgent-Target`.

use crate::error::MonitorError;
use dashmap::DashMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

const PORTAINER_TIMEOUT_SHORT_SECS: u64 = 5;
const PORTAINER_TIMEOUT_LONG_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub ip: Option<String>,
    pub hostname: Option<String>,
}

/// Delta-based CPU% for the containers of one Swarm service, keyed by
/// node IP where known. Mirrors `get_service_cpu_load_via_portainer`.
#[derive(Debug, Clone, Default)]
pub struct CpuLoadSample {
    pub avg: f64,
    pub nodes: std::collections::HashMap<String, f64>,
}

struct PrevStat {
    cpu: f64,
    system: f64,
}

pub struct PortainerClient {
    http: reqwest::Client,
    base_url: String,
    token_file: PathBuf,
    endpoint_id: AtomicI64,
    prev_stats: DashMap<String, PrevStat>,
}

impl PortainerClient {
    pub fn new(base_url: impl Into<String>, token_file: impl AsRef<Path>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token_file: token_file.as_ref().to_path_buf(),
            endpoint_id: AtomicI64::new(-1),
            prev_stats: DashMap::new(),
        }
    }

    async fn token(&self) -> Result<String, MonitorError> {
        tokio::fs::read_to_string(&self.token_file)
            .await
            .map(|s| s.trim().to_string())
            .map_err(|e| MonitorError::TokenUnavailable(e.to_string()))
    }

    async fn headers(&self) -> Result<reqwest::header::HeaderMap, MonitorError> {
        let token = self.token().await?;
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-API-Key",
            reqwest::header::HeaderValue::from_str(&token)
                .map_err(|e| MonitorError::TokenUnavailable(e.to_string()))?,
        );
        Ok(headers)
    }

    async fn endpoint_id(&self) -> Result<i64, MonitorError> {
        let cached = self.endpoint_id.load(Ordering::Relaxed);
        if cached >= 0 {
            return Ok(cached);
        }
        let headers = self.headers().await?;
        let resp = self
            .http
            .get(format!("{}/endpoints", self.base_url))
            .headers(headers)
            .timeout(std::time::Duration::from_secs(PORTAINER_TIMEOUT_SHORT_SECS))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(MonitorError::NoEndpoint);
        }
        let endpoints: Vec<Value> = resp.json().await?;
        for ep in &endpoints {
            let ty = ep.get("Type").and_then(Value::as_i64).unwrap_or(0);
            if ty == 1 || ty == 2 {
                if let Some(id) = ep.get("Id").and_then(Value::as_i64) {
                    self.endpoint_id.store(id, Ordering::Relaxed);
                    return Ok(id);
                }
            }
        }
        Err(MonitorError::NoEndpoint)
    }

    /// Maps Swarm node id → `{ip, hostname}`, best-effort (spec §9 open
    /// question: cross-node stats are best-effort, not guaranteed).
    pub async fn list_nodes(&self) -> std::collections::HashMap<String, NodeInfo> {
        let mut out = std::collections::HashMap::new();
        let Ok(endpoint_id) = self.endpoint_id().await else { return out };
        let Ok(headers) = self.headers().await else { return out };
        let Ok(resp) = self
            .http
            .get(format!("{}/endpoints/{endpoint_id}/docker/nodes", self.base_url))
            .headers(headers)
            .timeout(std::time::Duration::from_secs(PORTAINER_TIMEOUT_SHORT_SECS))
            .send()
            .await
        else {
            return out;
        };
        if !resp.status().is_success() {
            return out;
        }
        let Ok(nodes): Result<Vec<Value>, _> = resp.json().await else { return out };
        for n in nodes {
            let Some(id) = n.get("ID").and_then(Value::as_str) else { continue };
            let ip = n
                .get("Status")
                .and_then(|s| s.get("Addr"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let hostname = n
                .get("Description")
                .and_then(|d| d.get("Hostname"))
                .and_then(Value::as_str)
                .map(str::to_string);
            out.insert(id.to_string(), NodeInfo { ip, hostname });
        }
        out
    }

    pub async fn list_containers(&self, label_filter: &str) -> Result<Vec<Value>, MonitorError> {
        let endpoint_id = self.endpoint_id().await?;
        let headers = self.headers().await?;
        let filters = serde_json::json!({ "label": [label_filter] }).to_string();
        let resp = self
            .http
            .get(format!("{}/endpoints/{endpoint_id}/docker/containers/json", self.base_url))
            .headers(headers)
            .query(&[("filters", filters.as_str()), ("status", "running")])
            .timeout(std::time::Duration::from_secs(PORTAINER_TIMEOUT_LONG_SECS))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        Ok(resp.json().await.unwrap_or_default())
    }

    pub async fn list_services(&self) -> Result<Vec<Value>, MonitorError> {
        let endpoint_id = self.endpoint_id().await?;
        let headers = self.headers().await?;
        let resp = self
            .http
            .get(format!("{}/endpoints/{endpoint_id}/docker/services", self.base_url))
            .headers(headers)
            .timeout(std::time::Duration::from_secs(PORTAINER_TIMEOUT_LONG_SECS))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        Ok(resp.json().await.unwrap_or_default())
    }

    pub async fn list_tasks_for_service(&self, service_id: &str) -> Result<Vec<Value>, MonitorError> {
        let endpoint_id = self.endpoint_id().await?;
        let headers = self.headers().await?;
        let filters = serde_json::json!({ "service": [service_id] }).to_string();
        let resp = self
            .http
            .get(format!("{}/endpoints/{endpoint_id}/docker/tasks", self.base_url))
            .headers(headers)
            .query(&[("filters", filters.as_str())])
            .timeout(std::time::Duration::from_secs(PORTAINER_TIMEOUT_LONG_SECS))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        Ok(resp.json().await.unwrap_or_default())
    }

    async fn container_stats(&self, endpoint_id: i64, container_id: &str, node_hostname: Option<&str>) -> Option<Value> {
        let mut headers = self.headers().await.ok()?;
        if let Some(hostname) = node_hostname {
            headers.insert(
                "X-PortainerAgent-Target",
                reqwest::header::HeaderValue::from_str(hostname).ok()?,
            );
        }
        let resp = self
            .http
            .get(format!(
                "{}/endpoints/{endpoint_id}/docker/containers/{container_id}/stats",
                self.base_url
            ))
            .headers(headers)
            .query(&[("stream", "false")])
            .timeout(std::time::Duration::from_secs(PORTAINER_TIMEOUT_SHORT_SECS))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json().await.ok()
    }

    /// Average instantaneous CPU% across running containers of every
    /// service whose Swarm service name ends with `service_suffix`
    /// (e.g. `_core`, `_database`), computed from the delta between this
    /// call and the previous one. Returns `0.0` with no samples on a
    /// first call, since a CPU delta needs at least two samples.
    pub async fn cpu_load_for_suffix(&self, service_suffix: &str) -> CpuLoadSample {
        let mut result = CpuLoadSample::default();

        let Ok(endpoint_id) = self.endpoint_id().await else { return result };
        let nodes_map = self.list_nodes().await;

        let containers = match self.list_containers("com.docker.swarm.service.name").await {
            Ok(c) => c,
            Err(_) => return result,
        };

        let targets: Vec<&Value> = containers
            .iter()
            .filter(|c| {
                c.get("Labels")
                    .and_then(|l| l.get("com.docker.swarm.service.name"))
                    .and_then(Value::as_str)
                    .map(|name| name.ends_with(service_suffix))
                    .unwrap_or(false)
            })
            .collect();

        if targets.is_empty() {
            return result;
        }

        let mut total_load = 0.0;
        let mut valid_samples = 0;

        for container in targets {
            let Some(cid) = container.get("Id").and_then(Value::as_str) else { continue };
            let labels = container.get("Labels").cloned().unwrap_or(Value::Null);
            let node_id = labels.get("com.docker.swarm.node.id").and_then(Value::as_str);
            let node_info = node_id.and_then(|id| nodes_map.get(id));

            let mut node_ip = node_info.and_then(|n| n.ip.clone());
            let node_hostname = node_info.and_then(|n| n.hostname.clone());

            if node_ip.is_none() {
                node_ip = container
                    .get("NetworkSettings")
                    .and_then(|ns| ns.get("Networks"))
                    .and_then(|nets| nets.as_object())
                    .and_then(|nets| {
                        ["inv_network", "infra_network"]
                            .iter()
                            .find_map(|name| nets.get(*name))
                            .or_else(|| nets.values().next())
                    })
                    .and_then(|n| n.get("IPAddress"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }

            let Some(stats) = self.container_stats(endpoint_id, cid, node_hostname.as_deref()).await else { continue };
            let Some(cpu_stats) = stats.get("cpu_stats") else { continue };
            let cpu_usage_data = cpu_stats.get("cpu_usage").cloned().unwrap_or(Value::Null);
            let Some(cpu_usage) = cpu_usage_data.get("total_usage").and_then(Value::as_f64) else { continue };
            let Some(system_usage) = cpu_stats.get("system_cpu_usage").and_then(Value::as_f64) else { continue };

            let online_cpus = cpu_stats
                .get("online_cpus")
                .and_then(Value::as_f64)
                .filter(|v| *v > 0.0)
                .unwrap_or_else(|| {
                    cpu_usage_data
                        .get("percpu_usage")
                        .and_then(Value::as_array)
                        .map(|a| a.len() as f64)
                        .unwrap_or(1.0)
                });

            if let Some(prev) = self.prev_stats.get(cid) {
                let cpu_delta = cpu_usage - prev.cpu;
                let system_delta = system_usage - prev.system;
                if system_delta > 0.0 && cpu_delta >= 0.0 {
                    let load = (cpu_delta / system_delta) * online_cpus * 100.0;
                    total_load += load;
                    valid_samples += 1;
                    if let Some(ip) = &node_ip {
                        result.nodes.insert(ip.clone(), load);
                    }
                }
            }

            self.prev_stats.insert(cid.to_string(), PrevStat { cpu: cpu_usage, system: system_usage });
        }

        if valid_samples > 0 {
            result.avg = total_load / valid_samples as f64;
        }
        result
    }
}

pub type SharedPortainerClient = Arc<PortainerClient>;
