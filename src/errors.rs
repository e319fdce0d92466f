//! Gateway error surface and upstream error classification.
//!
//! `AppError` is what handlers return; `IntoResponse` renders the OpenAI
//! dialect body. The `/v1/messages` handler re-renders through
//! [`AppError::into_anthropic_response`] so Anthropic clients get
//! `{"type":"error","error":{...}}` envelopes instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no upstream credential available")]
    NoCredentials,

    #[error("upstream circuit open")]
    CircuitOpen,

    #[error("upstream quota exhausted")]
    QuotaExhausted,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Status code plus the OpenAI/Anthropic error `type` string.
    pub fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "authentication_error"),
            AppError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
            AppError::InvalidRequest(_) | AppError::UnknownModel(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            // A fully exhausted pool reads as rate limiting to the caller.
            AppError::NoCredentials | AppError::QuotaExhausted => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error")
            }
            AppError::CircuitOpen => (
                StatusCode::from_u16(529).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
                "overloaded_error",
            ),
            AppError::Upstream(_) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error"),
            AppError::Storage(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::Storage(e) => {
                tracing::error!("storage error: {}", e);
                "internal server error".into()
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {:#}", e);
                "internal server error".into()
            }
            other => other.to_string(),
        }
    }

    /// Render as an Anthropic-dialect error response.
    pub fn into_anthropic_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let body = Json(json!({
            "type": "error",
            "error": { "type": kind, "message": self.public_message() },
        }));
        (status, body).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let body = Json(json!({
            "error": {
                "message": self.public_message(),
                "type": kind,
                "code": status.as_u16(),
            }
        }));
        (status, body).into_response()
    }
}

// ── Upstream error classification ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Banned,
    Quota,
    Auth,
    RateLimit,
    ContentTooLong,
    InvalidModel,
    Client,
    Server,
    Network,
    Unknown,
}

/// What the dispatcher should do about a classified failure.
#[derive(Debug, Clone, Copy)]
pub struct Disposition {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub refresh_token: bool,
    pub disable_credential: bool,
    pub suggested_delay_ms: u64,
}

const NETWORK_MARKERS: &[&str] = &[
    "econnreset",
    "etimedout",
    "enotfound",
    "eai_again",
    "epipe",
    "econnrefused",
    "fetch failed",
    "timeout",
    "timed out",
    "aborted",
    "connection closed",
    "dns error",
];

const BAN_MARKERS: &[&str] = &["banned", "suspended", "terms of service", "blocked"];
const QUOTA_MARKERS: &[&str] = &["quota", "limit reached", "insufficient credits"];
const CONTENT_LENGTH_MARKERS: &[&str] = &[
    "content length exceeds",
    "input is too long",
    "contentlengthexceeded",
    "improperly formed request", // Kiro's phrasing for an oversized history
];

/// Classify an upstream failure by status code and message substring.
pub fn classify(status: Option<u16>, message: &str) -> Disposition {
    let msg = message.to_lowercase();

    let category = match status {
        Some(402) => ErrorCategory::Quota,
        Some(401) | Some(403) => {
            if BAN_MARKERS.iter().any(|m| msg.contains(m)) {
                ErrorCategory::Banned
            } else {
                ErrorCategory::Auth
            }
        }
        Some(429) => {
            if QUOTA_MARKERS.iter().any(|m| msg.contains(m)) {
                ErrorCategory::Quota
            } else {
                ErrorCategory::RateLimit
            }
        }
        Some(400) => {
            if CONTENT_LENGTH_MARKERS.iter().any(|m| msg.contains(m)) {
                ErrorCategory::ContentTooLong
            } else if msg.contains("model") {
                ErrorCategory::InvalidModel
            } else {
                ErrorCategory::Client
            }
        }
        Some(s) if (400..500).contains(&s) => ErrorCategory::Client,
        Some(s) if s >= 500 => ErrorCategory::Server,
        Some(_) => ErrorCategory::Unknown,
        None => {
            if NETWORK_MARKERS.iter().any(|m| msg.contains(m)) {
                ErrorCategory::Network
            } else {
                ErrorCategory::Unknown
            }
        }
    };

    match category {
        ErrorCategory::Banned => Disposition {
            category,
            retryable: false,
            refresh_token: false,
            disable_credential: true,
            suggested_delay_ms: 0,
        },
        ErrorCategory::Quota => Disposition {
            category,
            retryable: false,
            refresh_token: false,
            disable_credential: false,
            suggested_delay_ms: 0,
        },
        ErrorCategory::Auth => Disposition {
            category,
            retryable: false,
            refresh_token: true,
            disable_credential: false,
            suggested_delay_ms: 0,
        },
        ErrorCategory::RateLimit => Disposition {
            category,
            retryable: true,
            refresh_token: false,
            disable_credential: false,
            suggested_delay_ms: 1_000,
        },
        ErrorCategory::ContentTooLong | ErrorCategory::Client | ErrorCategory::InvalidModel => {
            Disposition {
                category,
                retryable: false,
                refresh_token: false,
                disable_credential: false,
                suggested_delay_ms: 0,
            }
        }
        ErrorCategory::Server => Disposition {
            category,
            retryable: true,
            refresh_token: false,
            disable_credential: false,
            suggested_delay_ms: 500,
        },
        ErrorCategory::Network => Disposition {
            category,
            retryable: true,
            refresh_token: false,
            disable_credential: false,
            suggested_delay_ms: 250,
        },
        ErrorCategory::Unknown => Disposition {
            category,
            retryable: false,
            refresh_token: false,
            disable_credential: false,
            suggested_delay_ms: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_status() {
        assert_eq!(classify(Some(402), "").category, ErrorCategory::Quota);
        assert_eq!(classify(Some(401), "").category, ErrorCategory::Auth);
        assert_eq!(
            classify(Some(403), "account banned").category,
            ErrorCategory::Banned
        );
        assert_eq!(classify(Some(429), "slow down").category, ErrorCategory::RateLimit);
        assert_eq!(classify(Some(503), "").category, ErrorCategory::Server);
    }

    #[test]
    fn classifies_content_length() {
        let d = classify(Some(400), "Input is too long for requested model");
        assert_eq!(d.category, ErrorCategory::ContentTooLong);
        assert!(!d.retryable);
    }

    #[test]
    fn classifies_network_strings() {
        let d = classify(None, "error sending request: ECONNRESET");
        assert_eq!(d.category, ErrorCategory::Network);
        assert!(d.retryable);
    }
}
