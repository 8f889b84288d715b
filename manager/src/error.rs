//! HTTP-facing error type: every handler converges on this so status
//! codes stay consistent across the REST surface (spec §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("upstream unavailable: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<migasfree_core::CoreError> for ManagerError {
    fn from(e: migasfree_core::CoreError) -> Self {
        if e.is_upstream_unavailable() {
            ManagerError::Upstream(e.to_string())
        } else {
            ManagerError::Internal(e.to_string())
        }
    }
}

impl From<ca_service::CaError> for ManagerError {
    fn from(e: ca_service::CaError) -> Self {
        if e.is_unauthenticated() {
            ManagerError::Unauthenticated
        } else {
            match e {
                ca_service::CaError::NotFound => ManagerError::NotFound("certificate".into()),
                ca_service::CaError::InvalidStack(s) => ManagerError::BadRequest(s),
                other => ManagerError::Internal(other.to_string()),
            }
        }
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ManagerError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            ManagerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ManagerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ManagerError::Upstream(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ManagerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };
        (status, Json(json!({ "detail": message }))).into_response()
    }
}
