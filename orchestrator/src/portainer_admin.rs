//! Write-side Portainer calls the read-only [`swarm_monitor::PortainerClient`]
//! deliberately doesn't expose: secret/network creation and stack deploy
//! (spec §4.6, grounded on `portainer.py`'s `PortainerAPI`).

use serde_json::Value;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PortainerAdminError {
    #[error("portainer token unavailable: {0}")]
    Token(std::io::Error),
    #[error("portainer request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("no endpoint available in this portainer instance")]
    NoEndpoint,
}

pub struct PortainerAdmin {
    http: reqwest::Client,
    base_url: String,
    token: String,
    endpoint_id: i64,
}

impl PortainerAdmin {
    pub async fn connect(base_url: impl Into<String>, token_file: &Path) -> Result<Self, PortainerAdminError> {
        let base_url = base_url.into();
        let token = tokio::fs::read_to_string(token_file)
            .await
            .map(|s| s.trim().to_string())
            .map_err(PortainerAdminError::Token)?;
        let http = reqwest::Client::new();

        let resp: Vec<Value> = http
            .get(format!("{base_url}/endpoints"))
            .header("X-API-Key", &token)
            .send()
            .await?
            .json()
            .await?;
        let endpoint_id = resp
            .iter()
            .find(|ep| matches!(ep.get("Type").and_then(Value::as_i64), Some(1) | Some(2)))
            .and_then(|ep| ep.get("Id"))
            .and_then(Value::as_i64)
            .ok_or(PortainerAdminError::NoEndpoint)?;

        Ok(Self { http, base_url, token, endpoint_id })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/endpoints/{}{suffix}", self.base_url, self.endpoint_id)
    }

    pub async fn secret_exists(&self, name: &str) -> Result<bool, PortainerAdminError> {
        let secrets: Vec<Value> = self
            .http
            .get(self.url("/docker/secrets"))
            .header("X-API-Key", &self.token)
            .send()
            .await?
            .json()
            .await
            .unwrap_or_default();
        Ok(secrets
            .iter()
            .any(|s| s.get("Spec").and_then(|spec| spec.get("Name")).and_then(Value::as_str) == Some(name)))
    }

    /// Creates a Swarm secret holding `value`, unless one by that name
    /// already exists (`create_secret`/`exists_secret` in `portainer.py`).
    pub async fn create_secret(&self, name: &str, value: &str) -> Result<(), PortainerAdminError> {
        if self.secret_exists(name).await? {
            return Ok(());
        }
        use base64::Engine;
        let payload = serde_json::json!({
            "Name": name,
            "Data": base64::engine::general_purpose::STANDARD.encode(value),
        });
        self.http
            .post(self.url("/docker/secrets/create"))
            .header("X-API-Key", &self.token)
            .json(&payload)
            .send()
            .await?;
        Ok(())
    }

    pub async fn network_exists(&self, name: &str) -> Result<bool, PortainerAdminError> {
        let networks: Vec<Value> = self
            .http
            .get(self.url("/docker/networks"))
            .header("X-API-Key", &self.token)
            .send()
            .await?
            .json()
            .await
            .unwrap_or_default();
        Ok(networks.iter().any(|n| n.get("Name").and_then(Value::as_str) == Some(name)))
    }

    pub async fn create_overlay_network(&self, name: &str, internal: bool) -> Result<(), PortainerAdminError> {
        if self.network_exists(name).await? {
            return Ok(());
        }
        let payload = serde_json::json!({
            "Name": name,
            "Driver": "overlay",
            "Internal": internal,
            "Attachable": true,
        });
        self.http
            .post(self.url("/docker/networks/create"))
            .header("X-API-Key", &self.token)
            .json(&payload)
            .send()
            .await?;
        Ok(())
    }

    /// Deploys a rendered stack file as a Portainer "string" stack
    /// (`PortainerAPI.deploy` in `portainer.py`).
    pub async fn deploy_stack(&self, name: &str, compose: &str, env: &[(String, String)]) -> Result<(), PortainerAdminError> {
        let payload = serde_json::json!({
            "Name": name,
            "StackFileContent": compose,
            "Env": env.iter().map(|(k, v)| serde_json::json!({ "name": k, "value": v })).collect::<Vec<_>>(),
        });
        self.http
            .post(format!("{}/stacks?endpointId={}&method=string&type=1", self.base_url, self.endpoint_id))
            .header("X-API-Key", &self.token)
            .json(&payload)
            .send()
            .await?;
        Ok(())
    }

    /// Removes a deployed stack by name.
    pub async fn remove_stack(&self, name: &str) -> Result<(), PortainerAdminError> {
        let stacks: Vec<Value> = self
            .http
            .get(format!("{}/stacks", self.base_url))
            .header("X-API-Key", &self.token)
            .send()
            .await?
            .json()
            .await
            .unwrap_or_default();
        let Some(id) = stacks.iter().find(|s| s.get("Name").and_then(Value::as_str) == Some(name)).and_then(|s| s.get("Id")) else {
            return Ok(());
        };
        self.http
            .delete(format!("{}/stacks/{id}?endpointId={}", self.base_url, self.endpoint_id))
            .header("X-API-Key", &self.token)
            .send()
            .await?;
        Ok(())
    }
}
