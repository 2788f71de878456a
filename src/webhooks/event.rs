use serde::{Deserialize, Serialize};

/// Parsed provider event.
///
/// Only `id` takes part in deduplication; the provider guarantees the rest
/// of the payload is stable for a given id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Event ID (e.g. `evt_1NG8Du2eZvKYlo2CUI79vXWy`).
    pub id: String,
    /// Event type (e.g. `payment_intent.succeeded`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: WebhookEventData,
    /// Unix timestamp when the provider created the event.
    pub created: i64,
    /// Whether the event came from live mode.
    #[serde(default)]
    pub livemode: bool,
    /// Provider API version used to render the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// Webhook event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
    /// Values of changed fields before the update (`*.updated` events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_attributes: Option<serde_json::Value>,
}

impl WebhookEvent {
    /// Create an event with an empty data object
    pub fn new(id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            data: WebhookEventData {
                object: serde_json::json!({}),
                previous_attributes: None,
            },
            created: chrono::Utc::now().timestamp(),
            livemode: false,
            api_version: None,
        }
    }

    /// Replace the data object
    pub fn with_object(mut self, object: serde_json::Value) -> Self {
        self.data.object = object;
        self
    }

    /// Idempotency key for this event
    pub fn idempotency_key(&self) -> String {
        idempotency_key(&self.id)
    }
}

/// Idempotency key namespace shared by every store backend.
pub const IDEMPOTENCY_KEY_PREFIX: &str = "webhook:";

/// Derive the idempotency key for an event id
pub fn idempotency_key(event_id: &str) -> String {
    format!("{}{}", IDEMPOTENCY_KEY_PREFIX, event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_provider_payload() {
        let payload = r#"{
            "id": "evt_123",
            "object": "event",
            "api_version": "2024-11-20.acacia",
            "type": "payment_intent.succeeded",
            "created": 1700000000,
            "livemode": true,
            "pending_webhooks": 1,
            "data": {"object": {"id": "pi_123", "amount": 2000}}
        }"#;

        let event: WebhookEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.event_type, "payment_intent.succeeded");
        assert_eq!(event.created, 1_700_000_000);
        assert!(event.livemode);
        assert_eq!(event.api_version.as_deref(), Some("2024-11-20.acacia"));
        assert_eq!(event.data.object["amount"], 2000);
        assert!(event.data.previous_attributes.is_none());
    }

    #[test]
    fn test_livemode_defaults_to_false() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid","created":1,"data":{"object":{}}}"#;
        let event: WebhookEvent = serde_json::from_str(payload).unwrap();
        assert!(!event.livemode);
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let payload = r#"{"type":"invoice.paid","created":1,"data":{"object":{}}}"#;
        assert!(serde_json::from_str::<WebhookEvent>(payload).is_err());
    }

    #[test]
    fn test_idempotency_key() {
        let event = WebhookEvent::new("evt_1", "invoice.paid");
        assert_eq!(event.idempotency_key(), "webhook:evt_1");
        assert_eq!(idempotency_key("evt_2"), "webhook:evt_2");
    }
}
