use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("portainer token unavailable: {0}")]
    TokenUnavailable(String),
    #[error("portainer endpoint discovery failed")]
    NoEndpoint,
    #[error("portainer request failed: {0}")]
    Http(#[from] reqwest::Error),
}
