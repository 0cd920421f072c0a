use thiserror::Error;

use crate::jsonrpc::{JsonRpcError, error_codes};

/// Failure of a tool handler, converted to a JSON-RPC error by the dispatcher.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("authentication against backend failed: {0}")]
    AuthenticationFailed(String),
    #[error("backend did not answer in time: {0}")]
    UpstreamTimeout(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn code(&self) -> i64 {
        match self {
            HandlerError::UnknownTool(_) | HandlerError::InvalidArguments(_) => {
                error_codes::INVALID_PARAMS
            }
            HandlerError::AuthenticationFailed(_) => error_codes::AUTHENTICATION_FAILED,
            HandlerError::UpstreamTimeout(_) => error_codes::UPSTREAM_TIMEOUT,
            HandlerError::NotFound(_) => error_codes::NOT_FOUND,
            HandlerError::Upstream(_) => error_codes::UPSTREAM_ERROR,
            HandlerError::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// Short machine-readable kind, echoed in `error.data.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::UnknownTool(_) => "unknown_tool",
            HandlerError::InvalidArguments(_) => "invalid_arguments",
            HandlerError::AuthenticationFailed(_) => "authentication_failed",
            HandlerError::UpstreamTimeout(_) => "upstream_timeout",
            HandlerError::NotFound(_) => "not_found",
            HandlerError::Upstream(_) => "upstream_error",
            HandlerError::Internal(_) => "internal_error",
        }
    }

    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        let mut data = serde_json::json!({ "kind": self.kind() });
        if matches!(self, HandlerError::UpstreamTimeout(_)) {
            // The first call on a cold backend session is expected to be slow.
            data["retryable"] = serde_json::Value::Bool(true);
        }
        JsonRpcError {
            code: self.code(),
            message: self.to_string(),
            data: Some(data),
        }
    }
}
