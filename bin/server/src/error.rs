//! Error types for the server.
//!
//! [`ApiError`] maps the gateway's error taxonomy onto HTTP responses.
//! [`StartupError`] covers what can stop the process from coming up; `main`
//! wraps it in a rootcause report.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;
use thinkone_core::{InvalidOperation, ParseIdError};
use thinkone_dispatch::GatewayError;

/// An error returned from an API handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError(pub GatewayError);

impl ApiError {
    /// A malformed request.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self(GatewayError::InvalidOperation {
            reason: reason.into(),
        })
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl From<InvalidOperation> for ApiError {
    fn from(err: InvalidOperation) -> Self {
        Self(err.into())
    }
}

impl From<ParseIdError> for ApiError {
    fn from(err: ParseIdError) -> Self {
        Self::bad_request(err.to_string())
    }
}

/// HTTP status for each error kind.
#[must_use]
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::AccountNotFound { .. } => StatusCode::NOT_FOUND,
        GatewayError::AuthRevoked { .. } => StatusCode::UNAUTHORIZED,
        GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::TransportTransient { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::InvalidOperation { .. } => StatusCode::BAD_REQUEST,
        GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::warn!(code = err.code(), error = %err, "request failed");
        } else {
            tracing::debug!(code = err.code(), error = %err, "request refused");
        }

        let mut body = json!({
            "code": err.code(),
            "message": err.to_string(),
            "retryable": err.is_retryable(),
        });
        let retry_after = err.retry_after_secs();
        if let Some(secs) = retry_after {
            body["retry_after_secs"] = json!(secs);
        }

        let mut response = (status, Json(json!({ "error": body }))).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Reasons the server fails to start.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration is missing or invalid.
    Config { details: String },
    /// The account store could not be opened.
    Store { details: String },
    /// The credential encryption key could not be loaded.
    EncryptionKey { details: String },
    /// The Telegram client could not be built.
    TelegramClient { details: String },
    /// The listener could not be bound.
    Bind { addr: String, details: String },
    /// The server stopped with an error.
    Serve { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "invalid configuration: {details}"),
            Self::Store { details } => write!(f, "failed to open account store: {details}"),
            Self::EncryptionKey { details } => {
                write!(f, "failed to load encryption key: {details}")
            }
            Self::TelegramClient { details } => {
                write!(f, "failed to build telegram client: {details}")
            }
            Self::Bind { addr, details } => write!(f, "failed to bind {addr}: {details}"),
            Self::Serve { details } => write!(f, "server error: {details}"),
        }
    }
}

impl std::error::Error for StartupError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use thinkone_core::AccountKey;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let response = ApiError(GatewayError::RateLimited {
            retry_after: Duration::from_millis(2500),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("3"))
        );
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "rate_limited");
        assert_eq!(body["error"]["retryable"], true);
        assert_eq!(body["error"]["retry_after_secs"], 3);
    }

    #[tokio::test]
    async fn auth_revoked_is_unauthorized() {
        let account = AccountKey::new("acct1").expect("valid key");
        let response = ApiError(GatewayError::AuthRevoked { account }).into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "auth_revoked");
        assert_eq!(body["error"]["retryable"], false);
        assert!(body["error"].get("retry_after_secs").is_none());
    }

    #[test]
    fn every_kind_has_a_status() {
        let cases = [
            (GatewayError::TransportTransient { reason: String::new() }, 502),
            (GatewayError::StorageUnavailable { reason: String::new() }, 503),
            (GatewayError::InvalidOperation { reason: String::new() }, 400),
            (GatewayError::Timeout { after: Duration::from_secs(1) }, 504),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err).as_u16(), status, "{}", err.code());
        }
    }
}
