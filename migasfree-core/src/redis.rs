//! Redis-backed agent directory, relay heartbeats, saturation metrics, and
//! the deferred-sync queue (spec §3, §6.6).

use crate::error::CoreError;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const AGENT_TTL_SECS: u64 = 300;
const RELAY_TTL_SECS: u64 = 10;
const METRIC_KEY: &str = "manager:metric:actual";
const HISTORY_KEY: &str = "manager:metric:history";
const SYNC_QUEUE_KEY: &str = "manager:sync_queue";

/// An agent's directory entry, stored as JSON under `agent:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub info: serde_json::Value,
    /// Service name → locally open TCP port, as advertised by the agent.
    #[serde(default)]
    pub services: HashMap<String, u16>,
    /// Public relay URL a client should dial, chosen by `register_agent`.
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Overlay-network address of the relay this agent is attached to,
    /// used by the Manager in preference to `relay_url` when reachable.
    #[serde(default)]
    pub server_ip: Option<String>,
}

/// A relay's heartbeat record, stored as JSON under `tunnel:<relay_uuid>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    pub id: String,
    pub url: String,
    pub internal_url: String,
    pub hostname: String,
    pub load: u64,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStat {
    pub id: String,
    pub host: Option<String>,
    pub status: Option<String>,
    pub role: Option<String>,
    pub cpu_load: Option<f64>,
    pub select_cnt: i64,
    pub write_cnt: i64,
    pub error_cnt: i64,
    pub select_qpm: f64,
    pub write_wpm: f64,
    pub error_epm: f64,
    pub replication_delay: i64,
}

/// `manager:metric:actual` (spec §3 "Saturation state").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaturationSnapshot {
    pub ts: f64,
    pub saturated: bool,
    pub db_latency: f64,
    pub core_cpu: f64,
    pub db_cpu: f64,
    #[serde(default)]
    pub cluster_nodes: Vec<NodeStat>,
}

/// One entry appended to `manager:metric:history` per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaturationHistoryEntry {
    pub ts: f64,
    pub saturated: bool,
    pub db_latency: f64,
    pub core_cpu: f64,
    pub db_cpu: f64,
    pub attempts: i64,
    #[serde(default)]
    pub cluster_nodes: Vec<NodeStat>,
}

#[derive(Debug)]
pub struct AgentPage {
    pub agents: Vec<AgentRecord>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

#[derive(Clone)]
pub struct RedisDirectory {
    manager: ConnectionManager,
}

impl RedisDirectory {
    pub async fn connect(redis_url: &str) -> Result<Self, CoreError> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    // ── Agent directory ──────────────────────────────────────────

    /// Stores `agent:<id>` with a fresh 300s TTL. The sole writer of
    /// `relay_url` is the Manager's `register_agent` handler (spec §4.2
    /// invariant); callers elsewhere must not overwrite it.
    pub async fn put_agent(&self, agent: &AgentRecord) -> Result<(), CoreError> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(agent)
            .map_err(|e| CoreError::Config(format!("agent serialize: {e}")))?;
        let _: () = conn
            .set_ex(format!("agent:{}", agent.agent_id), payload, AGENT_TTL_SECS)
            .await?;
        Ok(())
    }

    /// Called by a relay on `register_agent` and on every TTL refresh
    /// while the WS stays open. Preserves `relay_url`/`server_ip` if
    /// already present — the Manager's `POST /v1/private/tunnel/register`
    /// is the sole writer of those two fields (spec §4.2 invariant).
    pub async fn register_agent_from_relay(
        &self,
        agent_id: &str,
        hostname: &str,
        services: HashMap<String, u16>,
    ) -> Result<(), CoreError> {
        let mut record = match self.get_agent(agent_id).await? {
            Some(existing) => existing,
            None => AgentRecord {
                agent_id: agent_id.to_string(),
                hostname: hostname.to_string(),
                info: serde_json::Value::Null,
                services: HashMap::new(),
                relay_url: None,
                server_ip: None,
            },
        };
        record.hostname = hostname.to_string();
        record.services = services;
        self.put_agent(&record).await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, CoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(format!("agent:{agent_id}")).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, CoreError> {
        let mut conn = self.conn();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Paginates `agent:*`. Mirrors the upstream pagination strategy: the
    /// page slice is taken from the full, unsorted key scan first, and an
    /// optional `q` substring filter is then applied only within that
    /// slice — so `total` always reflects the unfiltered directory size,
    /// and a search term can yield fewer than `limit` results on a given
    /// page even though later pages may still match. A secondary index
    /// would be needed to make search page-exact; out of scope here.
    pub async fn list_agents(
        &self,
        page: usize,
        limit: usize,
        q: Option<&str>,
    ) -> Result<AgentPage, CoreError> {
        let all_keys = self.scan_keys("agent:*").await?;
        let total = all_keys.len();

        let page = page.max(1);
        let start = (page - 1) * limit;
        let end = (start + limit).min(all_keys.len());
        let paged_keys: Vec<String> = if start < all_keys.len() {
            all_keys[start..end].to_vec()
        } else {
            Vec::new()
        };

        let mut agents = Vec::new();
        if !paged_keys.is_empty() {
            let mut conn = self.conn();
            let values: Vec<Option<String>> = conn.mget(&paged_keys).await?;
            for value in values.into_iter().flatten() {
                if let Ok(agent) = serde_json::from_str::<AgentRecord>(&value) {
                    match q {
                        Some(needle) if !needle.is_empty() => {
                            if agent.hostname.to_lowercase().contains(&needle.to_lowercase()) {
                                agents.push(agent);
                            }
                        }
                        _ => agents.push(agent),
                    }
                }
            }
        }

        Ok(AgentPage { agents, total, page, limit })
    }

    // ── Relay heartbeats ─────────────────────────────────────────

    pub async fn heartbeat_relay(&self, relay: &RelayRecord) -> Result<(), CoreError> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(relay)
            .map_err(|e| CoreError::Config(format!("relay serialize: {e}")))?;
        let _: () = conn
            .set_ex(format!("tunnel:{}", relay.id), payload, RELAY_TTL_SECS)
            .await?;
        Ok(())
    }

    pub async fn list_relays(&self) -> Result<Vec<RelayRecord>, CoreError> {
        let keys = self.scan_keys("tunnel:*").await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let values: Vec<Option<String>> = conn.mget(&keys).await?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|v| serde_json::from_str::<RelayRecord>(&v).ok())
            .collect())
    }

    /// Picks the relay with the smallest `load`, ties broken
    /// lexicographically by id (spec §4.2).
    pub async fn pick_least_loaded_relay(&self) -> Result<Option<RelayRecord>, CoreError> {
        let mut relays = self.list_relays().await?;
        relays.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)));
        Ok(relays.into_iter().next())
    }

    // ── Saturation metrics ───────────────────────────────────────

    pub async fn get_saturation(&self) -> Result<Option<SaturationSnapshot>, CoreError> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(METRIC_KEY).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let get_f64 = |k: &str| fields.get(k).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
        let cluster_nodes = fields
            .get("cluster_nodes")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        Ok(Some(SaturationSnapshot {
            ts: get_f64("ts"),
            saturated: fields.get("saturated").map(|v| v == "1").unwrap_or(false),
            db_latency: get_f64("db_latency"),
            core_cpu: get_f64("core_cpu"),
            db_cpu: get_f64("db_cpu"),
            cluster_nodes,
        }))
    }

    pub async fn set_saturation(&self, snapshot: &SaturationSnapshot) -> Result<(), CoreError> {
        let mut conn = self.conn();
        let cluster_nodes_json = serde_json::to_string(&snapshot.cluster_nodes)
            .map_err(|e| CoreError::Config(format!("cluster_nodes serialize: {e}")))?;
        let _: () = conn
            .hset_multiple(
                METRIC_KEY,
                &[
                    ("ts", snapshot.ts.to_string()),
                    ("saturated", if snapshot.saturated { "1" } else { "0" }.to_string()),
                    ("db_latency", snapshot.db_latency.to_string()),
                    ("core_cpu", snapshot.core_cpu.to_string()),
                    ("db_cpu", snapshot.db_cpu.to_string()),
                    ("cluster_nodes", cluster_nodes_json),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn increment_sync_attempt(&self) -> Result<(), CoreError> {
        let mut conn = self.conn();
        let _: i64 = conn.hincr(METRIC_KEY, "attempts", 1).await?;
        Ok(())
    }

    /// Atomically reads and zeroes the `attempts` counter, as done by the
    /// metrics tick before it writes the next snapshot (spec §3/§8).
    pub async fn take_sync_attempts(&self) -> Result<i64, CoreError> {
        let mut conn = self.conn();
        let (prev,): (Option<i64>,) = redis::pipe()
            .hget(METRIC_KEY, "attempts")
            .hset(METRIC_KEY, "attempts", 0)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(prev.unwrap_or(0))
    }

    pub async fn append_history(
        &self,
        entry: &SaturationHistoryEntry,
        retention_secs: u64,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(entry)
            .map_err(|e| CoreError::Config(format!("history entry serialize: {e}")))?;
        let cutoff = entry.ts - retention_secs as f64;
        let _: () = redis::pipe()
            .zadd(HISTORY_KEY, payload, entry.ts)
            .zrembyscore(HISTORY_KEY, "-inf", cutoff)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn get_history(&self) -> Result<Vec<SaturationHistoryEntry>, CoreError> {
        let mut conn = self.conn();
        let items: Vec<String> = conn.zrange(HISTORY_KEY, 0, -1).await?;
        Ok(items
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    // ── Sync queue ───────────────────────────────────────────────

    /// Pushes `uuid` onto the deferred sync queue unless it's already
    /// present, preserving the "enqueue at most once before a drain"
    /// invariant (spec §8).
    pub async fn enqueue_sync_if_absent(&self, uuid: &str) -> Result<bool, CoreError> {
        let mut conn = self.conn();
        let pos: Option<i64> = redis::cmd("LPOS")
            .arg(SYNC_QUEUE_KEY)
            .arg(uuid)
            .query_async(&mut conn)
            .await?;
        if pos.is_some() {
            return Ok(false);
        }
        let _: i64 = conn.rpush(SYNC_QUEUE_KEY, uuid).await?;
        Ok(true)
    }

    /// Pops up to `count` UUIDs from the front of the sync queue.
    pub async fn drain_sync_queue(&self, count: usize) -> Result<Vec<String>, CoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let popped: Option<Vec<String>> = conn.lpop(SYNC_QUEUE_KEY, std::num::NonZeroUsize::new(count)).await?;
        Ok(popped.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_record_round_trips_through_json() {
        let mut services = HashMap::new();
        services.insert("ssh".to_string(), 22);
        let record = AgentRecord {
            agent_id: "CID-1".into(),
            hostname: "h1".into(),
            info: serde_json::json!({"os": "linux"}),
            services,
            relay_url: Some("wss://fqdn/tunnel".into()),
            server_ip: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: AgentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent_id, "CID-1");
        assert_eq!(back.services.get("ssh"), Some(&22));
    }

    #[test]
    fn relay_sort_prefers_lowest_load_then_id() {
        let mut relays = vec![
            RelayRecord { id: "b".into(), url: "u".into(), internal_url: "i".into(), hostname: "h".into(), load: 3, max_connections: 100 },
            RelayRecord { id: "a".into(), url: "u".into(), internal_url: "i".into(), hostname: "h".into(), load: 3, max_connections: 100 },
            RelayRecord { id: "c".into(), url: "u".into(), internal_url: "i".into(), hostname: "h".into(), load: 1, max_connections: 100 },
        ];
        relays.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)));
        assert_eq!(relays[0].id, "c");
        assert_eq!(relays[1].id, "a");
    }
}
