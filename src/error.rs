//! Error types for Fedicore
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! Response bodies carry a generic message only; details go to the log.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Covers the federation failure taxonomy (inbound authentication,
/// remote fetches, outbound delivery) plus the usual ambient failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Identifier is not hosted on this instance (404)
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Inbound request carries no Signature header (401)
    #[error("Missing HTTP signature")]
    SignatureMissing,

    /// Signature does not verify against the signer's key (401)
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// Signer's public key could not be resolved (401)
    #[error("Unresolvable signing key: {0}")]
    KeyUnresolvable(String),

    /// Date header outside the accepted clock-skew window (401)
    #[error("Stale request: {0}")]
    StaleRequest(String),

    /// Activity lacks required fields or is not an activity at all (400)
    #[error("Malformed activity: {0}")]
    MalformedActivity(String),

    /// Remote document fetch failed (502)
    #[error("Fetch error: {0}")]
    FetchError(String),

    /// Outbound delivery failed permanently
    #[error("Delivery to {inbox} failed: {reason}")]
    DeliveryFailed { inbox: String, reason: String },

    /// Outbound delivery gave up after exhausting retries
    #[error("Delivery to {inbox} exhausted after {attempts} attempts: {last_error}")]
    DeliveryExhausted {
        inbox: String,
        attempts: u32,
        last_error: String,
    },

    /// Destination refused by network policy (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Key-value persistence error (500)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key material error (500)
    #[error("Key error: {0}")]
    Key(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Whether this error is an inbound authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            AppError::SignatureMissing
                | AppError::SignatureInvalid(_)
                | AppError::KeyUnresolvable(_)
                | AppError::StaleRequest(_)
        )
    }

    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::UnknownIdentifier(_) => (StatusCode::NOT_FOUND, "unknown_identifier"),
            AppError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            AppError::SignatureMissing => (StatusCode::UNAUTHORIZED, "signature_missing"),
            AppError::SignatureInvalid(_) => (StatusCode::UNAUTHORIZED, "signature_invalid"),
            AppError::KeyUnresolvable(_) => (StatusCode::UNAUTHORIZED, "key_unresolvable"),
            AppError::StaleRequest(_) => (StatusCode::UNAUTHORIZED, "stale_request"),
            AppError::MalformedActivity(_) => (StatusCode::BAD_REQUEST, "malformed_activity"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::FetchError(_) => (StatusCode::BAD_GATEWAY, "fetch"),
            AppError::DeliveryFailed { .. } => (StatusCode::BAD_GATEWAY, "delivery_failed"),
            AppError::DeliveryExhausted { .. } => (StatusCode::BAD_GATEWAY, "delivery_exhausted"),
            AppError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Key(_) => (StatusCode::INTERNAL_SERVER_ERROR, "key"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to a status code and a generic JSON body.
    /// The detailed message is logged, never sent to the peer.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_type) = self.status_and_kind();

        if status.is_server_error() {
            tracing::error!(error = %self, kind = error_type, "Request failed");
        } else {
            tracing::debug!(error = %self, kind = error_type, "Request rejected");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let message = status
            .canonical_reason()
            .unwrap_or("Error")
            .to_string();
        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
