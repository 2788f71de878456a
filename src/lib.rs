//! webhook-inbox - idempotent processing of payment provider webhooks
//!
//! Providers deliver events at least once, sometimes out of order and
//! sometimes concurrently. This crate authenticates each delivery, makes sure
//! every event's handler side effects happen at most once, and retries
//! transient handler failures without breaking that guarantee.
//!
//! # Features
//!
//! - **Verification**: HMAC-SHA256 signature headers with a replay window
//! - **Idempotency**: in-memory (moka) or Redis records with per-entry TTL
//! - **Dispatch**: event-type handler registry with bounded exponential retry
//! - **Claims**: optional atomic claims so concurrent deliveries run a handler once
//! - **HTTP**: ready-made axum route
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webhook_inbox::{ConfigBuilder, HandlerRegistry, WebhookProcessor, webhook_routes};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     webhook_inbox::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!
//!     let registry = HandlerRegistry::new().on("payment_intent.succeeded", |event| async move {
//!         tracing::info!(event_id = %event.id, "Payment succeeded");
//!         Ok(())
//!     });
//!
//!     let processor = WebhookProcessor::builder(config.inbox)
//!         .store(config.store.build_store()?)
//!         .registry(registry)
//!         .build()?;
//!
//!     let app = webhook_routes("/webhooks/stripe", Arc::new(processor));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
pub mod utils;
pub mod webhooks;

// Re-exports for public API
pub use config::{Config, ConfigBuilder, InboxConfig, LoggingConfig, StoreBackend, StoreConfig};
pub use error::{HandlerError, InboxError, Result};
#[cfg(feature = "redis")]
pub use webhooks::RedisIdempotencyStore;
pub use webhooks::{
    Clock, Disposition, FixedClock, HandlerRegistry, IdempotencyStatus, IdempotencyStore,
    MemoryIdempotencyStore, ProcessOutcome, SignatureVerifier, SystemClock, VerificationError,
    WebhookEvent, WebhookHandler, WebhookProcessor, WebhookProcessorBuilder, handle_webhook_event,
    sign_payload, verify, webhook_routes,
};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before building the processor.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "webhook_inbox=debug")
/// - `WEBHOOK_INBOX_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &LoggingConfig) {
    let env_filter = EnvFilter::new(&config.level);

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
