//! axum endpoint for provider deliveries

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{InboxError, Result};

use super::processor::{Disposition, WebhookProcessor};
use super::verification::VerificationError;

/// Header carrying the delivery signature
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Body returned for every accepted delivery
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub processed: bool,
    pub event_id: String,
    pub disposition: Disposition,
}

/// Creates the webhook router serving `POST path`
///
/// Verification failures answer 400 so the provider stops retrying; store and
/// handler failures answer 500 so it delivers again. A delivery that finds
/// another delivery's claim answers 409: the claim owner may still fail or
/// crash, so the provider must keep the event queued.
///
/// # Example
///
/// ```rust,ignore
/// let processor = Arc::new(WebhookProcessor::new(InboxConfig::from_env(), registry)?);
/// let app = Router::new().merge(webhook_routes("/webhooks/stripe", processor));
/// ```
pub fn webhook_routes(path: &str, processor: Arc<WebhookProcessor>) -> Router {
    Router::new()
        .route(path, post(webhook_handler))
        .with_state(processor)
}

/// Handler for the webhook endpoint
///
/// Takes the body as raw bytes: the signature covers the exact payload.
pub async fn webhook_handler(
    State(processor): State<Arc<WebhookProcessor>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>)> {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        tracing::debug!("Webhook delivery without a readable signature header");
        return Err(InboxError::Verification(VerificationError::SignatureMismatch));
    };

    let outcome = processor.process(&body, signature).await?;

    let status = if outcome.is_settled() {
        StatusCode::OK
    } else {
        tracing::debug!(event_id = %outcome.event_id, "Webhook event claimed by another delivery");
        StatusCode::CONFLICT
    };

    Ok((
        status,
        Json(WebhookResponse {
            received: true,
            processed: outcome.processed,
            event_id: outcome.event_id,
            disposition: outcome.disposition,
        }),
    ))
}
