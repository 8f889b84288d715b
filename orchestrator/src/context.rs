//! Cluster- and stack-level configuration context, persisted as flat
//! `KEY='value'` env files under the shared datashare path (spec §4.6).
//!
//! Grounded on `context.py`'s `ContextLoader`: a cluster-wide `env.py`
//! under `/mnt/cluster` plus one `env.py` per stack under
//! `/mnt/cluster/datashares/<stack>`. This port replaces the executable
//! Python module with a plain key=value text format parsed by hand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DATASHARES_DIR: &str = "/mnt/cluster/datashares";
const CLUSTER_ENV_FILE: &str = "/mnt/cluster/env";

/// Every directory under the datashare root is a provisioned stack name.
pub fn list_stacks() -> std::io::Result<Vec<String>> {
    std::fs::create_dir_all(DATASHARES_DIR)?;
    let mut stacks = Vec::new();
    for entry in std::fs::read_dir(DATASHARES_DIR)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                stacks.push(name.to_string());
            }
        }
    }
    stacks.sort();
    Ok(stacks)
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    values: BTreeMap<String, String>,
}

impl Context {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let mut values = BTreeMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('\'').trim_matches('"');
                values.insert(key.trim().to_string(), value.to_string());
            }
        }
        Ok(Self { values })
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        for (key, value) in &self.values {
            out.push_str(&format!("{key}='{value}'\n"));
        }
        std::fs::write(path, out)
    }

    /// Returns the existing value, or sets and returns `default` if absent
    /// — the `ContextLoader.default` behavior, minus the interactive prompt
    /// fallback (this CLI takes every value as a flag or env var instead
    /// of reading stdin).
    pub fn get_or_default(&mut self, key: &str, default: &str) -> String {
        self.values
            .entry(key.to_string())
            .or_insert_with(|| default.to_string())
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

pub fn cluster_env_path() -> PathBuf {
    PathBuf::from(CLUSTER_ENV_FILE)
}

pub fn stack_env_path(stack: &str) -> PathBuf {
    PathBuf::from(DATASHARES_DIR).join(stack).join("env")
}

/// Populates the minimal cluster-wide defaults (spec §4.6, `context.py`'s
/// `load()`).
pub fn load_cluster_context() -> std::io::Result<Context> {
    let path = cluster_env_path();
    let mut ctx = Context::load(&path)?;
    ctx.get_or_default("DATASHARE_FS", "local");
    ctx.save(&path)?;
    Ok(ctx)
}

/// Populates the minimal per-stack defaults (`context.py`'s `load_stack()`).
pub fn load_stack_context(stack: &str) -> std::io::Result<Context> {
    let path = stack_env_path(stack);
    let mut ctx = Context::load(&path)?;
    ctx.get_or_default("FQDN", &format!("{stack}.example.com"));
    ctx.get_or_default("TZ", "Europe/Madrid");
    ctx.get_or_default("EMAIL", "admin@domain.com");
    ctx.get_or_default("PORT_HTTP", "80");
    ctx.get_or_default("PORT_HTTPS", "443");
    ctx.get_or_default("HTTPSMODE", "manual");
    ctx.get_or_default("SUPERADMIN_NAME", "migasfree");
    ctx.get_or_default("REDIS_HOST", "datastore");
    ctx.get_or_default("REDIS_PORT", "6379");
    ctx.get_or_default("REDIS_DB", "0");
    ctx.get_or_default("POSTGRES_CRON", "00 00 * * *");
    ctx.get_or_default("POSTGRES_HOST", "database");
    ctx.get_or_default("POSTGRES_PORT", "5432");
    ctx.get_or_default("POSTGRES_DB", "migasfree");
    ctx.get_or_default("DATASHARE_MOUNT_PATH", "/mnt/datashare");
    ctx.get_or_default("PMS_ENABLED", "pms-apt,pms-yum");
    ctx.get_or_default("REPLICAS_console", "1");
    ctx.get_or_default("REPLICAS_core", "1");
    ctx.get_or_default("REPLICAS_public", "1");
    ctx.get_or_default("REPLICAS_worker", "1");
    ctx.save(&path)?;
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_quoted_key_value_format() {
        let dir = std::env::temp_dir().join(format!("orch-ctx-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("env");

        let mut ctx = Context::default();
        ctx.set("FQDN", "swarm.example.com");
        ctx.save(&path).unwrap();

        let loaded = Context::load(&path).unwrap();
        assert_eq!(loaded.get("FQDN"), Some("swarm.example.com"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn get_or_default_only_sets_when_absent() {
        let mut ctx = Context::default();
        assert_eq!(ctx.get_or_default("TZ", "Europe/Madrid"), "Europe/Madrid");
        ctx.set("TZ", "UTC");
        assert_eq!(ctx.get_or_default("TZ", "Europe/Madrid"), "UTC");
    }
}
