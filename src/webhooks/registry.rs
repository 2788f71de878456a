//! Registry mapping event types to handler callbacks
//!
//! The registry is assembled once at startup and handed to the processor,
//! which only ever reads from it.

use crate::error::HandlerError;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::event::WebhookEvent;

/// Type alias for event handler callbacks
///
/// Handlers receive an owned copy of the event so the returned future can be
/// `'static` and retried independently.
pub type EventHandler =
    Arc<dyn Fn(WebhookEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Trait for handlers that carry their own state
///
/// # Example
///
/// ```rust,ignore
/// struct ActivateSubscription { db: DatabaseConnection }
///
/// #[async_trait]
/// impl WebhookHandler for ActivateSubscription {
///     async fn handle(&self, event: WebhookEvent) -> Result<(), HandlerError> {
///         let subscription_id = event.data.object["id"].as_str().unwrap_or_default();
///         activate(&self.db, subscription_id).await?;
///         Ok(())
///     }
/// }
///
/// let registry = HandlerRegistry::new()
///     .handler("customer.subscription.created", ActivateSubscription { db });
/// ```
#[async_trait]
pub trait WebhookHandler: Send + Sync + 'static {
    async fn handle(&self, event: WebhookEvent) -> Result<(), HandlerError>;
}

/// Registry for mapping event types to their handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, EventHandler>,
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for an event type
    ///
    /// Registering the same type twice replaces the earlier handler.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let registry = HandlerRegistry::new().on("invoice.paid", |event| async move {
    ///     tracing::info!(invoice = %event.data.object["id"], "Invoice paid");
    ///     Ok(())
    /// });
    /// ```
    pub fn on<F, Fut>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(WebhookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| handler(event).boxed());
        self.handlers.insert(event_type.into(), handler);
        self
    }

    /// Register a [`WebhookHandler`] implementation for an event type
    pub fn handler<H: WebhookHandler>(self, event_type: impl Into<String>, handler: H) -> Self {
        let handler = Arc::new(handler);
        self.on(event_type, move |event| {
            let handler = handler.clone();
            async move { handler.handle(event).await }
        })
    }

    /// Look up the handler for an event type
    pub fn get(&self, event_type: &str) -> Option<&EventHandler> {
        self.handlers.get(event_type)
    }

    /// Check if an event type is registered
    pub fn is_registered(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Get all registered event types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.registered_types())
            .finish()
    }
}
