use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::upstream::{pagination::AggregationError, UpstreamError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {message}")]
    BadRequest { code: &'static str, message: String },
    #[error("unauthorized: {message}")]
    Unauthorized {
        code: &'static str,
        message: &'static str,
    },
    #[error("forbidden: {message}")]
    Forbidden { code: &'static str, message: String },
    #[error("not found: {message}")]
    NotFound { code: &'static str, message: String },
    #[error("invalid or expired session")]
    InvalidSession { session_id: Option<String> },
    #[error("parse error")]
    Parse,
    #[error("invalid request: {message}")]
    InvalidRequest { message: &'static str },
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    #[error("rate limited: {message}")]
    RateLimited { message: String },
    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },
    #[error("upstream pagination contract violated: {message}")]
    PaginationViolated { message: String, partial_items: usize },
    #[error("request cancelled")]
    Cancelled,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("internal error")]
    Internal { code: &'static str, message: String },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub hint: &'static str,
    pub details: Value,
}

impl AppError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(code: &'static str, message: &'static str) -> Self {
        Self::Unauthorized { code, message }
    }

    pub fn invalid_session(session_id: Option<&str>) -> Self {
        Self::InvalidSession {
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }

    /// Machine-readable error category.
    pub fn category(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "invalid_input",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::InvalidSession { .. } => "invalid_session",
            Self::Parse => "parse_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::PaginationViolated { .. } => "pagination_contract_violated",
            Self::Cancelled => "cancelled",
            Self::ShuttingDown => "shutting_down",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Human-readable remediation hint.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "check the tool arguments against the tool's input schema",
            Self::Unauthorized { .. } => "send a valid bearer token in the Authorization header",
            Self::Forbidden { .. } => {
                "verify the upstream API key is valid and has the required scopes"
            }
            Self::NotFound { .. } => "verify the referenced id exists upstream",
            Self::InvalidSession { .. } => {
                "open a new session: reconnect the event stream or re-initialize"
            }
            Self::Parse => "send a well-formed JSON document",
            Self::InvalidRequest { .. } => "send a JSON-RPC 2.0 request envelope",
            Self::MethodNotFound { .. } => "call initialize, ping, tools/list or tools/call",
            Self::RateLimited { .. } => "wait for the upstream rate window to reset and retry",
            Self::UpstreamUnavailable { .. } => "retry later; the upstream API is not responding",
            Self::PaginationViolated { .. } => {
                "narrow the filters; the upstream returned a repeating page cursor"
            }
            Self::Cancelled => "re-issue the request if the result is still needed",
            Self::ShuttingDown => "reconnect once the server is back",
            Self::Internal { .. } => "retry the request; report the issue if it persists",
        }
    }

    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::Parse => -32700,
            Self::InvalidRequest { .. } => -32600,
            Self::MethodNotFound { .. } => -32601,
            Self::BadRequest { .. } | Self::NotFound { .. } => -32602,
            Self::Internal { .. } | Self::ShuttingDown => -32603,
            Self::Unauthorized { .. } | Self::Forbidden { .. } => -32001,
            Self::InvalidSession { .. } => -32002,
            Self::RateLimited { .. } => -32003,
            Self::UpstreamUnavailable { .. } => -32004,
            Self::PaginationViolated { .. } => -32005,
            Self::Cancelled => -32800,
        }
    }

    pub fn rpc_message(&self) -> &'static str {
        match self {
            Self::Parse => "Parse error",
            Self::InvalidRequest { .. } => "Invalid Request",
            Self::MethodNotFound { .. } => "Method not found",
            Self::BadRequest { .. } | Self::NotFound { .. } => "Invalid params",
            Self::Internal { .. } | Self::ShuttingDown => "Internal error",
            Self::Unauthorized { .. } | Self::Forbidden { .. } => "Unauthorized",
            Self::InvalidSession { .. } => "Invalid or expired session",
            Self::RateLimited { .. } => "Rate limited",
            Self::UpstreamUnavailable { .. } => "Upstream unavailable",
            Self::PaginationViolated { .. } => "Upstream pagination contract violated",
            Self::Cancelled => "Request cancelled",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. }
            | Self::Parse
            | Self::InvalidRequest { .. }
            | Self::MethodNotFound { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } | Self::InvalidSession { .. } => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable { .. } | Self::PaginationViolated { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::Cancelled => StatusCode::CONFLICT,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code and message safe to show to clients.
    pub fn public_parts(&self) -> (&'static str, String) {
        match self {
            Self::BadRequest { code, message }
            | Self::Forbidden { code, message }
            | Self::NotFound { code, message } => (*code, message.clone()),
            Self::Unauthorized { code, message } => (*code, message.to_string()),
            Self::Internal { code, .. } => (*code, "internal server error".to_string()),
            other => (other.category(), other.to_string()),
        }
    }

    pub fn details(&self) -> Value {
        match self {
            Self::InvalidSession { session_id } => json!({ "session": session_id }),
            Self::MethodNotFound { method } => json!({ "method": method }),
            Self::PaginationViolated { partial_items, .. } => {
                json!({ "partial_items": partial_items })
            }
            _ => json!({}),
        }
    }
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::InvalidInput { message, .. } => Self::BadRequest {
                code: "upstream_invalid_input",
                message,
            },
            UpstreamError::Forbidden { message, .. } => Self::Forbidden {
                code: "upstream_forbidden",
                message,
            },
            UpstreamError::NotFound { message } => Self::NotFound {
                code: "upstream_not_found",
                message,
            },
            UpstreamError::RateLimited { .. } | UpstreamError::BudgetExhausted { .. } => {
                Self::RateLimited {
                    message: err.to_string(),
                }
            }
            UpstreamError::Unavailable { .. } | UpstreamError::Decode(_) => {
                Self::UpstreamUnavailable {
                    message: err.to_string(),
                }
            }
            UpstreamError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<AggregationError> for AppError {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::DuplicateCursor { ref items, .. } => Self::PaginationViolated {
                partial_items: items.len(),
                message: err.to_string(),
            },
            AggregationError::Upstream { source, .. } => source.into(),
            AggregationError::Cancelled { .. } => Self::Cancelled,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Self::Internal { message, .. } = &self {
            tracing::error!(error = %message, "request failed with internal error");
        }

        let (code, message) = self.public_parts();
        (
            self.status(),
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                hint: self.hint(),
                details: self.details(),
            }),
        )
            .into_response()
    }
}
