//! Delivery processor
//!
//! Turns one raw delivery into exactly one of: a skipped duplicate, an
//! `unhandled` record, a `processed` record after a successful handler run, or
//! an exhausted-retries error. A handler's side effects happen at most once
//! per event for as long as the idempotency record lives.

use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::InboxConfig;
use crate::error::{HandlerError, InboxError, Result};

use super::event::{WebhookEvent, idempotency_key};
use super::idempotency::{IdempotencyStatus, IdempotencyStore, MemoryIdempotencyStore};
use super::registry::{EventHandler, HandlerRegistry};
use super::verification::{Clock, SignatureVerifier};

/// Callback invoked once a handler has failed on every attempt
pub type ExhaustedCallback =
    Arc<dyn Fn(&WebhookEvent, &HandlerError) -> BoxFuture<'static, ()> + Send + Sync>;

/// How a delivery was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The handler ran successfully and the event is recorded as processed.
    Processed,
    /// The event was already processed or recorded as unhandled.
    Duplicate,
    /// No handler is registered; recorded as unhandled.
    Unhandled,
    /// The event type is not in the configured allow-list.
    Filtered,
    /// Another delivery of the same event holds the claim.
    ///
    /// Not a final answer: the claim owner may still exhaust its retries or
    /// crash, so this delivery must not be acknowledged to the provider.
    InFlight,
}

/// Result of processing one delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    /// Whether a handler ran to completion during this call
    pub processed: bool,
    pub event_id: String,
    pub disposition: Disposition,
}

impl ProcessOutcome {
    fn new(event_id: &str, disposition: Disposition) -> Self {
        Self {
            processed: disposition == Disposition::Processed,
            event_id: event_id.to_string(),
            disposition,
        }
    }

    /// Whether the delivery can be acknowledged to the provider
    pub fn is_settled(&self) -> bool {
        self.disposition != Disposition::InFlight
    }
}

/// Idempotent processor for provider webhook deliveries
///
/// Shared across requests behind an `Arc`; all methods take `&self`.
///
/// # Example
///
/// ```rust,ignore
/// let registry = HandlerRegistry::new().on("payment_intent.succeeded", |event| async move {
///     fulfil_order(&event).await?;
///     Ok(())
/// });
///
/// let processor = WebhookProcessor::builder(InboxConfig::from_env())
///     .registry(registry)
///     .store(StoreConfig::from_env().build_store()?)
///     .build()?;
///
/// let outcome = processor.process(&body, signature).await?;
/// ```
pub struct WebhookProcessor {
    verifier: SignatureVerifier,
    store: Arc<dyn IdempotencyStore>,
    registry: HandlerRegistry,
    allowed_event_types: Option<HashSet<String>>,
    max_retries: u32,
    idempotency_ttl: Duration,
    backoff_base: Duration,
    retry_jitter: Duration,
    claim_ttl: Option<Duration>,
    on_exhausted: Option<ExhaustedCallback>,
}

impl WebhookProcessor {
    /// Create a processor with an in-memory store
    pub fn new(config: InboxConfig, registry: HandlerRegistry) -> Result<Self> {
        Self::builder(config).registry(registry).build()
    }

    pub fn builder(config: InboxConfig) -> WebhookProcessorBuilder {
        WebhookProcessorBuilder::new(config)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Verify and process one raw delivery
    ///
    /// `payload` must be the exact request body bytes; re-serialized JSON will
    /// not verify. Verification failures are returned before the store is
    /// touched.
    pub async fn process(&self, payload: &[u8], signature_header: &str) -> Result<ProcessOutcome> {
        let event = self.verifier.verify(payload, signature_header).map_err(|e| {
            tracing::warn!(error = %e, "Rejected webhook delivery");
            InboxError::from(e)
        })?;

        self.process_event(event).await
    }

    /// Process an event whose authenticity was established elsewhere
    pub async fn process_event(&self, event: WebhookEvent) -> Result<ProcessOutcome> {
        if !self.is_allowed(&event.event_type) {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring webhook event type not in allow-list"
            );
            return Ok(ProcessOutcome::new(&event.id, Disposition::Filtered));
        }

        let key = event.idempotency_key();

        if let Some(disposition) = self.acquire(&key).await? {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                disposition = ?disposition,
                "Skipping webhook event"
            );
            return Ok(ProcessOutcome::new(&event.id, disposition));
        }

        let Some(handler) = self.registry.get(&event.event_type) else {
            self.store
                .set(&key, IdempotencyStatus::Unhandled.as_str(), self.idempotency_ttl)
                .await?;
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "No handler registered for webhook event"
            );
            return Ok(ProcessOutcome::new(&event.id, Disposition::Unhandled));
        };

        match self.run_with_retries(handler, &event).await {
            Ok(attempts) => {
                self.store
                    .set(&key, IdempotencyStatus::Processed.as_str(), self.idempotency_ttl)
                    .await?;
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempts,
                    "Webhook processed successfully"
                );
                Ok(ProcessOutcome::new(&event.id, Disposition::Processed))
            }
            Err((attempts, error)) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempts,
                    error = %error,
                    "Webhook handler exhausted retries"
                );

                if let Some(callback) = &self.on_exhausted {
                    callback(&event, &error).await;
                }

                if self.claim_ttl.is_some() {
                    // Let the provider's redelivery take a fresh claim
                    if let Err(e) = self.store.delete(&key).await {
                        tracing::warn!(
                            event_id = %event.id,
                            error = %e,
                            "Failed to release webhook claim"
                        );
                    }
                }

                Err(InboxError::HandlerExhausted {
                    event_id: event.id,
                    event_type: event.event_type,
                    attempts,
                    source: error,
                })
            }
        }
    }

    /// Current idempotency record for an event, if any
    pub async fn status(&self, event_id: &str) -> Result<Option<IdempotencyStatus>> {
        self.read_status(&idempotency_key(event_id)).await
    }

    fn is_allowed(&self, event_type: &str) -> bool {
        match &self.allowed_event_types {
            Some(allowed) => allowed.contains(event_type),
            None => true,
        }
    }

    /// Decide whether this delivery may dispatch.
    ///
    /// Returns `None` when it may, or the disposition to report otherwise.
    async fn acquire(&self, key: &str) -> Result<Option<Disposition>> {
        let Some(claim_ttl) = self.claim_ttl else {
            return Ok(self.read_status(key).await?.map(skip_disposition));
        };

        // A second round covers a claim released between our claim and read
        for _ in 0..2 {
            if self
                .store
                .set_if_absent(key, IdempotencyStatus::Processing.as_str(), claim_ttl)
                .await?
            {
                return Ok(None);
            }

            if let Some(status) = self.read_status(key).await? {
                return Ok(Some(skip_disposition(status)));
            }
        }

        Ok(Some(Disposition::InFlight))
    }

    async fn read_status(&self, key: &str) -> Result<Option<IdempotencyStatus>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };

        match raw.parse() {
            Ok(status) => Ok(Some(status)),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unrecognised idempotency record");
                Ok(None)
            }
        }
    }

    /// Run a handler until it succeeds or `max_retries` attempts fail.
    ///
    /// Returns the number of attempts made.
    async fn run_with_retries(
        &self,
        handler: &EventHandler,
        event: &WebhookEvent,
    ) -> std::result::Result<u32, (u32, HandlerError)> {
        let mut attempt = 1;

        loop {
            match handler(event.clone()).await {
                Ok(()) => return Ok(attempt),
                Err(error) if attempt >= self.max_retries => return Err((attempt, error)),
                Err(error) => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Webhook handler failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff after a failed attempt: `backoff_base * 2^attempt` plus jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_base.saturating_mul(2u32.saturating_pow(attempt));

        let jitter_ms = self.retry_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }

        delay.saturating_add(Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms)))
    }
}

fn skip_disposition(status: IdempotencyStatus) -> Disposition {
    if status.is_terminal() {
        Disposition::Duplicate
    } else {
        Disposition::InFlight
    }
}

impl std::fmt::Debug for WebhookProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookProcessor")
            .field("verifier", &self.verifier)
            .field("registry", &self.registry)
            .field("max_retries", &self.max_retries)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .field("claim_ttl", &self.claim_ttl)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WebhookProcessor`]
#[must_use = "builder does nothing until you call build()"]
pub struct WebhookProcessorBuilder {
    config: InboxConfig,
    store: Option<Arc<dyn IdempotencyStore>>,
    registry: HandlerRegistry,
    clock: Option<Arc<dyn Clock>>,
    on_exhausted: Option<ExhaustedCallback>,
}

impl WebhookProcessorBuilder {
    pub fn new(config: InboxConfig) -> Self {
        Self {
            config,
            store: None,
            registry: HandlerRegistry::new(),
            clock: None,
            on_exhausted: None,
        }
    }

    /// Use a specific idempotency store (defaults to in-memory)
    pub fn store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Override the clock used for the timestamp tolerance check
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Called with the event and last error when retries run out
    ///
    /// Runs before the error is returned to the caller. Use it for alerting or
    /// dead-lettering; it cannot change the outcome.
    pub fn on_exhausted<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(&WebhookEvent, &HandlerError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_exhausted = Some(Arc::new(move |event: &WebhookEvent, error: &HandlerError| {
            callback(event, error).boxed()
        }));
        self
    }

    /// Build the processor
    ///
    /// # Errors
    ///
    /// Returns [`InboxError::Config`] if the configuration fails validation.
    pub fn build(self) -> Result<WebhookProcessor> {
        self.config.validate()?;

        let secret = self
            .config
            .secret
            .clone()
            .ok_or_else(|| InboxError::config("webhook signing secret is required"))?;

        let mut verifier = SignatureVerifier::new(secret).with_tolerance(self.config.tolerance());
        if let Some(clock) = self.clock {
            verifier = verifier.with_clock(clock);
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryIdempotencyStore::default()));

        let allowed_event_types = self
            .config
            .allowed_event_types
            .as_ref()
            .filter(|types| !types.is_empty())
            .map(|types| types.iter().cloned().collect());

        Ok(WebhookProcessor {
            verifier,
            store,
            registry: self.registry,
            allowed_event_types,
            max_retries: self.config.max_retries,
            idempotency_ttl: self.config.idempotency_ttl(),
            backoff_base: self.config.backoff_base(),
            retry_jitter: self.config.retry_jitter(),
            claim_ttl: self.config.claim_ttl(),
            on_exhausted: self.on_exhausted,
        })
    }
}

/// Process a single delivery with default settings and an in-memory store
///
/// Convenient for serverless handlers and tests. Long-running services should
/// build one [`WebhookProcessor`] and share it, since the in-memory store
/// created here does not outlive the call.
pub async fn handle_webhook_event(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    registry: HandlerRegistry,
) -> Result<ProcessOutcome> {
    WebhookProcessor::new(InboxConfig::new(secret.to_string()), registry)?
        .process(payload, signature_header)
        .await
}
