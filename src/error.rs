use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Translation failed: {0}")]
    Translation(String),

    #[error("No credentials available for {provider}/{model}")]
    NoCredentials { provider: String, model: String },

    #[error("Upstream error ({status}): {message}")]
    Upstream {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Upstream request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stream aborted: no upstream activity within the idle timeout")]
    IdleAborted,

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Translation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoCredentials { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Network(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::IdleAborted => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire type string used in the JSON error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::Translation(_) => {
                "invalid_request_error"
            }
            GatewayError::NoCredentials { .. } => "no_credentials_error",
            GatewayError::Upstream { status, .. } if *status == 429 => "rate_limit_error",
            GatewayError::Upstream { .. } | GatewayError::Network(_) => "upstream_error",
            GatewayError::IdleAborted => "stream_idle_error",
            GatewayError::NotImplemented(_) => "not_implemented_error",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let mut headers = axum::http::HeaderMap::new();
        if let GatewayError::Upstream {
            retry_after: Some(delay),
            ..
        } = &self
        {
            if let Ok(v) = delay.as_secs().to_string().parse() {
                headers.insert(axum::http::header::RETRY_AFTER, v);
            }
        }

        let body = Json(json!({
            "error": {
                "type": self.error_type(),
                "code": status.as_u16(),
                "message": self.to_string(),
            }
        }));

        (status, headers, body).into_response()
    }
}
