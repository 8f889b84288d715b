//! Caller authentication for `/v1/private/*` routes: either an mTLS
//! `X-SSL-Client-CN` in `OU=ADMINS`, or a bearer token the external
//! Django core vouches for (spec §6.1).

use crate::error::ManagerError;
use axum::http::HeaderMap;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct AdminIdentity {
    pub common_name: String,
}

/// Parses `/O=.../OU=.../CN=<value>`, returning the CN's value.
pub fn parse_ssl_client_cn(raw: &str) -> Option<(String, String)> {
    let mut ou = None;
    let mut cn = None;
    for part in raw.split('/') {
        if let Some(value) = part.strip_prefix("OU=") {
            ou = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("CN=") {
            cn = Some(value.to_string());
        }
    }
    Some((ou?, cn?))
}

/// Splits `<uuid>_<cert-id>` on the *last* underscore, recovering the
/// agent UUID (spec §4.3 "Admission gate").
pub fn agent_uuid_from_cn(cn: &str) -> Option<&str> {
    cn.rsplit_once('_').map(|(uuid, _cert_id)| uuid)
}

#[derive(Debug, Deserialize)]
struct CoreUser {
    is_superuser: bool,
}

/// Validates the caller of a `/v1/private/*` route: an `OU=ADMINS` mTLS
/// CN is trusted outright; otherwise the bearer token must resolve to a
/// superuser via the external core's `/rest-auth/user/`.
pub async fn authenticate_admin(
    headers: &HeaderMap,
    core_base_url: &str,
    http: &reqwest::Client,
) -> Result<AdminIdentity, ManagerError> {
    if let Some(raw_cn) = headers.get("X-SSL-Client-CN").and_then(|v| v.to_str().ok()) {
        if let Some((ou, cn)) = parse_ssl_client_cn(raw_cn) {
            if ou == "ADMINS" {
                return Ok(AdminIdentity { common_name: cn });
            }
        }
    }

    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ManagerError::Unauthenticated)?;

    let resp = http
        .get(format!("{core_base_url}/rest-auth/user/"))
        .bearer_auth(bearer)
        .send()
        .await
        .map_err(|e| ManagerError::Upstream(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(ManagerError::Unauthenticated);
    }

    let user: CoreUser = resp.json().await.map_err(|e| ManagerError::Upstream(e.to_string()))?;
    if !user.is_superuser {
        return Err(ManagerError::Unauthenticated);
    }

    Ok(AdminIdentity { common_name: "bearer-admin".to_string() })
}

/// Proxies `username`/`password` to the core's `/rest-auth/login/` and
/// returns its `access_token` verbatim (spec §6.1 "Admin session").
pub async fn proxy_login(
    core_base_url: &str,
    http: &reqwest::Client,
    username: &str,
    password: &str,
) -> Result<String, ManagerError> {
    #[derive(Deserialize)]
    struct LoginResponse {
        key: Option<String>,
        access_token: Option<String>,
    }

    let resp = http
        .post(format!("{core_base_url}/rest-auth/login/"))
        .form(&[("username", username), ("password", password)])
        .send()
        .await
        .map_err(|e| ManagerError::Upstream(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(ManagerError::Unauthenticated);
    }

    let body: LoginResponse = resp.json().await.map_err(|e| ManagerError::Upstream(e.to_string()))?;
    body.access_token.or(body.key).ok_or(ManagerError::Unauthenticated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ou_and_cn_from_dn_string() {
        let (ou, cn) = parse_ssl_client_cn("/O=migasfree/OU=ADMINS/CN=alice").unwrap();
        assert_eq!(ou, "ADMINS");
        assert_eq!(cn, "alice");
    }

    #[test]
    fn recovers_uuid_by_splitting_on_last_underscore() {
        assert_eq!(agent_uuid_from_cn("3f9e_cert-42"), Some("3f9e"));
        assert_eq!(agent_uuid_from_cn("a1b2_c3d4_cert-1"), Some("a1b2_c3d4"));
    }
}
