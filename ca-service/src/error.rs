use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid stack name: {0}")]
    InvalidStack(String),
    #[error("not found")]
    NotFound,
    #[error("certificate creation failed")]
    CreationFailed,
    #[error("certificate revocation failed")]
    RevocationFailed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaError {
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, CaError::InvalidToken | CaError::TokenExpired)
    }
}
