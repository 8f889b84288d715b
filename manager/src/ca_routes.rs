//! `/v1/public/mtls/*` and `/v1/private/mtls/*`: token issuance,
//! certificate delivery, revocation, and CRL distribution (spec §4.4).
//! Admin routes additionally require an authenticated superuser/OU=ADMINS
//! caller; computer routes are reachable by any agent holding a valid
//! single-use token, matching the original split between `admin.py` and
//! `computer.py`.

use crate::auth::authenticate_admin;
use crate::error::ManagerError;
use crate::state::ManagerState;
use axum::body::Bytes;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use ca_service::{create_cert, issue_token, revoke_cert, CertKind, Resource, TokenValidator};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct TokenCreateRequest {
    pub common_name: String,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

fn default_validity_days() -> u32 {
    72
}

#[derive(Debug, Serialize)]
pub struct TokenCreateResponse {
    pub url: String,
}

async fn issue_resource_token(
    state: &ManagerState,
    resource: Resource,
    req: TokenCreateRequest,
) -> Result<TokenCreateResponse, ManagerError> {
    let token = issue_token(&state.config.cert_root, &state.config.stack, resource, &req.common_name, req.validity_days).await?;
    let path_segment = match resource {
        Resource::Admin => "admin-requests",
        Resource::Computer => "computer-requests",
    };
    Ok(TokenCreateResponse { url: format!("https://{}/v1/public/mtls/{path_segment}/{token}", state.config.fqdn) })
}

pub async fn create_admin_token(
    State(state): State<ManagerState>,
    headers: HeaderMap,
    Json(req): Json<TokenCreateRequest>,
) -> Result<(StatusCode, Json<TokenCreateResponse>), ManagerError> {
    authenticate_admin(&headers, &state.config.core_base_url, &state.http).await?;
    Ok((StatusCode::CREATED, Json(issue_resource_token(&state, Resource::Admin, req).await?)))
}

/// Computer token issuance is deliberately not auth-gated, matching the
/// original `computer.py` router: any caller that can reach the Manager
/// may request a one-time enrollment token for itself.
pub async fn create_computer_token(
    State(state): State<ManagerState>,
    Json(req): Json<TokenCreateRequest>,
) -> Result<(StatusCode, Json<TokenCreateResponse>), ManagerError> {
    Ok((StatusCode::CREATED, Json(issue_resource_token(&state, Resource::Computer, req).await?)))
}

async fn render_token_form(
    state: &ManagerState,
    resource: Resource,
    action_path: &str,
    token: &str,
) -> Result<impl IntoResponse, ManagerError> {
    let validator = TokenValidator::new(&state.config.cert_root, &state.config.stack, resource, token);
    // A validation failure here means the token never existed, already
    // expired, or was already consumed — a 404, not the 401 that the
    // blanket `CaError` conversion would otherwise produce.
    validator
        .validate(state.config.max_token_age_hours)
        .await
        .map_err(|_| ManagerError::NotFound(format!("token '{token}'")))?;

    let html = format!(
        r#"<!DOCTYPE html>
<html><head><title>migasfree-swarm certificate request</title></head>
<body>
<form method="post" action="{action_path}" enctype="multipart/form-data">
<input type="hidden" name="token" value="{token}">
<label>Email <input type="email" name="email" required></label>
<label>Password <input type="password" name="password"></label>
<button type="submit">Request certificate</button>
</form>
</body></html>"#
    );

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "text/html; charset=utf-8".parse().unwrap());
    Ok((headers, html))
}

pub async fn render_admin_token_form(
    State(state): State<ManagerState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ManagerError> {
    render_token_form(&state, Resource::Admin, "/v1/public/mtls/admin-certificates", &token).await
}

pub async fn render_computer_token_form(
    State(state): State<ManagerState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ManagerError> {
    render_token_form(&state, Resource::Computer, "/v1/public/mtls/computer-certificates", &token).await
}

#[derive(Debug, Deserialize)]
struct CertificateForm {
    token: String,
    email: String,
    password: Option<String>,
}

async fn parse_certificate_form(mut multipart: Multipart) -> Result<CertificateForm, ManagerError> {
    let mut token = None;
    let mut email = None;
    let mut password = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| ManagerError::BadRequest(e.to_string()))? {
        let name = field.name().unwrap_or_default().to_string();
        let text = field.text().await.map_err(|e| ManagerError::BadRequest(e.to_string()))?;
        match name.as_str() {
            "token" => token = Some(text),
            "email" => email = Some(text),
            "password" => password = Some(text),
            _ => {}
        }
    }
    Ok(CertificateForm {
        token: token.ok_or_else(|| ManagerError::BadRequest("missing token".into()))?,
        email: email.ok_or_else(|| ManagerError::BadRequest("missing email".into()))?,
        password,
    })
}

async fn issue_resource_certificate(state: &ManagerState, kind: CertKind, resource: Resource, form: CertificateForm) -> Result<impl IntoResponse, ManagerError> {
    let validator = TokenValidator::new(&state.config.cert_root, &state.config.stack, resource, &form.token);
    let (common_name, validity_days) = validator.validate(state.config.max_token_age_hours).await?;

    let tar_path = create_cert(
        kind,
        &state.config.cert_root,
        &state.config.fqdn,
        &state.config.fqdn,
        &state.config.stack,
        &common_name,
        form.password.as_deref().unwrap_or_default(),
        validity_days,
        &form.email,
    )
    .await?;

    let content = tokio::fs::read(&tar_path).await.map_err(|_| ca_service::CaError::NotFound)?;
    validator.consume().await?;
    let _ = tokio::fs::remove_file(&tar_path).await;

    let filename = format!("{common_name}_{}.tar", state.config.fqdn);
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/x-tar".parse().unwrap());
    headers.insert(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"").parse().unwrap());
    headers.insert(header::CACHE_CONTROL, "no-store, no-cache, must-revalidate".parse().unwrap());
    headers.insert(header::PRAGMA, "no-cache".parse().unwrap());

    Ok((headers, Bytes::from(content)))
}

pub async fn create_admin_certificate(State(state): State<ManagerState>, multipart: Multipart) -> Result<impl IntoResponse, ManagerError> {
    let form = parse_certificate_form(multipart).await?;
    issue_resource_certificate(&state, CertKind::Admin, Resource::Admin, form).await
}

pub async fn create_computer_certificate(State(state): State<ManagerState>, multipart: Multipart) -> Result<impl IntoResponse, ManagerError> {
    let form = parse_certificate_form(multipart).await?;
    issue_resource_certificate(&state, CertKind::Computer, Resource::Computer, form).await
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub common_name: String,
}

async fn revoke(state: &ManagerState, kind: CertKind, req: RevokeRequest) -> Result<StatusCode, ManagerError> {
    revoke_cert(kind, &state.config.cert_root, &state.config.stack, &req.common_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn revoke_admin_certificate(
    State(state): State<ManagerState>,
    headers: HeaderMap,
    Json(req): Json<RevokeRequest>,
) -> Result<StatusCode, ManagerError> {
    authenticate_admin(&headers, &state.config.core_base_url, &state.http).await?;
    revoke(&state, CertKind::Admin, req).await
}

pub async fn revoke_computer_certificate(
    State(state): State<ManagerState>,
    Json(req): Json<RevokeRequest>,
) -> Result<StatusCode, ManagerError> {
    revoke(&state, CertKind::Computer, req).await
}

pub async fn get_crl(State(state): State<ManagerState>) -> Result<impl IntoResponse, ManagerError> {
    let bytes = ca_service::crl::read_crl(&state.config.cert_root, &state.config.stack).await?;
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/pkix-crl".parse().unwrap());
    Ok((headers, Bytes::from(bytes)))
}
