use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::webhooks::verification::VerificationError;

/// Error type returned by webhook handler callbacks.
///
/// Handlers can fail with anything that converts into `anyhow::Error`.
pub type HandlerError = anyhow::Error;

/// The main error type for the webhook inbox
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    /// The delivery could not be authenticated as a genuine provider event.
    #[error("Webhook verification failed: {0}")]
    Verification(#[from] VerificationError),

    /// The idempotency store could not be read or written.
    ///
    /// Callers cannot tell whether the event was processed when this occurs.
    #[error("Idempotency store error: {0}")]
    Store(String),

    /// The handler kept failing until the retry budget ran out.
    #[error("Handler for {event_type} failed after {attempts} attempts (event {event_id}): {source}")]
    HandlerExhausted {
        event_id: String,
        event_type: String,
        attempts: u32,
        #[source]
        source: HandlerError,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error body returned to webhook senders.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    error_id: String,
}

impl InboxError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// HTTP status the webhook endpoint should answer with.
    ///
    /// Providers treat 4xx as permanent and 5xx as "deliver again later".
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Verification(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) | Self::HandlerExhausted { .. } | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the provider should deliver this event again.
    pub fn is_retryable_by_provider(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Returns a message safe to send back to the caller.
    ///
    /// Verification failures are described; server-side failures are not,
    /// since handler errors may carry business data.
    fn safe_message(&self) -> String {
        match self {
            Self::Verification(err) => format!("Bad request: {}", err),
            Self::Store(_) => "Service unavailable".to_string(),
            Self::HandlerExhausted { .. } | Self::Config(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for InboxError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Webhook request failed"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Webhook request rejected"
            );
        }

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
        });

        (status, body).into_response()
    }
}

/// Result type alias for inbox operations
pub type Result<T> = std::result::Result<T, InboxError>;
