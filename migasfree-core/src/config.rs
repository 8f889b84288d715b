//! Typed environment configuration, loaded once at process startup.
//!
//! Mirrors the env surface in spec §6.5. Every required variable is
//! validated eagerly so a misconfigured deployment fails at boot instead of
//! on the first request that needs it.

use crate::error::CoreError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub fqdn: String,
    pub stack: String,
    pub redis_url: String,
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_db: String,
    pub postgres_user: String,
    pub postgres_password: String,

    pub sync_max_db_latency: f64,
    pub sync_max_core_load: f64,
    pub sync_queue_process_interval: u64,
    pub sync_max_concurrency: usize,

    pub metrics_recording_interval: u64,
    pub metrics_retention_limit: u64,

    pub tunnel_connections: usize,

    /// `<cert_root>/<stack>/...` per spec §6.5. Defaults to
    /// `/mnt/cluster/certificates`, matching the original CA service.
    pub cert_root: PathBuf,
    pub max_token_age_hours: i64,

    /// Base URL of the external Django core, used for the auth proxy and
    /// for resolving a synced agent's `cid` (spec §4.3, §6.1).
    pub core_base_url: String,
    pub portainer_url: String,
    pub portainer_token_file: PathBuf,

    /// Relay URL handed back by `register_tunnel` when no relay has
    /// heartbeated into the directory yet (spec §8 Scenario 1), so an
    /// agent still gets a usable HAProxy-fronted tunnel endpoint instead
    /// of a hard failure. Defaults to `wss://<FQDN>/tunnel`.
    pub default_relay_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, CoreError> {
        let fqdn = require("FQDN")?;
        let default_relay_url = std::env::var("DEFAULT_RELAY_URL")
            .unwrap_or_else(|_| format!("wss://{fqdn}/tunnel"));

        Ok(Self {
            fqdn,
            stack: require("STACK")?,
            redis_url: require("REDIS_URL")?,
            postgres_host: require("POSTGRES_HOST")?,
            postgres_port: parse_opt("POSTGRES_PORT", 5432)?,
            postgres_db: require("POSTGRES_DB")?,
            postgres_user: require("POSTGRES_USER")?,
            postgres_password: require("POSTGRES_PASSWORD")?,

            sync_max_db_latency: parse_opt("SYNC_MAX_DB_LATENCY", 0.5)?,
            sync_max_core_load: parse_opt("SYNC_MAX_CORE_LOAD", 85.0)?,
            sync_queue_process_interval: parse_opt("SYNC_QUEUE_PROCESS_INTERVAL", 30)?,
            sync_max_concurrency: parse_opt("SYNC_MAX_CONCURRENCY", 10)?,

            metrics_recording_interval: parse_opt("METRICS_RECORDING_INTERVAL", 10)?,
            metrics_retention_limit: parse_opt("METRICS_RETENTION_LIMIT", 14_400)?,

            tunnel_connections: parse_opt("TUNNEL_CONNECTIONS", 1000)?,

            cert_root: std::env::var("CERT_ROOT")
                .unwrap_or_else(|_| "/mnt/cluster/certificates".to_string())
                .into(),
            max_token_age_hours: parse_opt("MAX_TOKEN_AGE_HOURS", 72)?,

            core_base_url: require("CORE_BASE_URL")?,
            portainer_url: require("PORTAINER_URL")?,
            portainer_token_file: std::env::var("PORTAINER_TOKEN_FILE")
                .unwrap_or_else(|_| "/run/secrets/portainer_token".to_string())
                .into(),
            default_relay_url,
        })
    }

    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres_user, self.postgres_password, self.postgres_host, self.postgres_port, self.postgres_db
        )
    }

    /// Whether the Postgres endpoint is fronted by Pgpool-II (spec §4.3
    /// point 3): decided by the conventional hostname value, exactly as
    /// the original `core/availability.py` does (`POSTGRES_HOST == "pgpool"`).
    pub fn is_pgpool(&self) -> bool {
        self.postgres_host.trim() == "pgpool"
    }

    pub fn metrics_recording_interval_duration(&self) -> Duration {
        Duration::from_secs(self.metrics_recording_interval)
    }

    pub fn sync_queue_process_interval_duration(&self) -> Duration {
        Duration::from_secs(self.sync_queue_process_interval)
    }
}

fn require(key: &str) -> Result<String, CoreError> {
    std::env::var(key).map_err(|_| CoreError::Config(format!("{key} is not set")))
}

fn parse_opt<T: std::str::FromStr>(key: &str, default: T) -> Result<T, CoreError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| CoreError::Config(format!("{key} has an invalid value: {v}"))),
        Err(_) => Ok(default),
    }
}
