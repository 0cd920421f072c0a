use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("backend rejected credentials: {0}")]
    Rejected(String),
    #[error("authentication request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("authentication transport error: {0}")]
    Transport(String),
    #[error("malformed authentication response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("user not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("lookup timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("lookup failed: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("invalid credential configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenRecordError {
    #[error("token expires at {expires_at} which is not after issue time {issued_at}")]
    NotAfterIssue {
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    #[error("empty token")]
    Empty,
}
