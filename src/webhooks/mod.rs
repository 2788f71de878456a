//! Webhook delivery processing.
//!
//! Provides signature verification, idempotency records, a handler registry
//! and the processor that ties them together, plus an axum route for
//! receiving deliveries over HTTP.

pub mod event;
pub mod http;
pub mod idempotency;
pub mod processor;
pub mod registry;
pub mod verification;

pub use event::{WebhookEvent, WebhookEventData, idempotency_key};
pub use http::{SIGNATURE_HEADER, WebhookResponse, webhook_routes};
#[cfg(feature = "redis")]
pub use idempotency::RedisIdempotencyStore;
pub use idempotency::{IdempotencyStatus, IdempotencyStore, MemoryIdempotencyStore};
pub use processor::{
    Disposition, ExhaustedCallback, ProcessOutcome, WebhookProcessor, WebhookProcessorBuilder,
    handle_webhook_event,
};
pub use registry::{EventHandler, HandlerRegistry, WebhookHandler};
pub use verification::{
    Clock, FixedClock, SignatureVerifier, SystemClock, VerificationError, compute_signature,
    parse_signature_header, sign_payload, verify,
};
