use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::ServiceExt;

use webhook_inbox::webhooks::SIGNATURE_HEADER;
use webhook_inbox::{FixedClock, HandlerRegistry, InboxConfig, WebhookProcessor, sign_payload, webhook_routes};

const SECRET: &str = "whsec_http_secret";
const NOW: i64 = 1_700_000_000;
const PATH: &str = "/webhooks/stripe";

fn app(registry: HandlerRegistry, max_retries: u32) -> Router {
    let mut config = InboxConfig::new(SECRET);
    config.max_retries = max_retries;
    config.backoff_base_ms = 1;
    let processor = WebhookProcessor::builder(config)
        .registry(registry)
        .clock(Arc::new(FixedClock::new(NOW)))
        .build()
        .unwrap();
    webhook_routes(PATH, Arc::new(processor))
}

fn body(id: &str, event_type: &str) -> Vec<u8> {
    format!(r#"{{"id":"{}","type":"{}","created":{},"data":{{"object":{{}}}}}}"#, id, event_type, NOW).into_bytes()
}

fn signed_request(payload: Vec<u8>, header: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(PATH)
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, header)
        .body(Body::from(payload))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_duplicate_delivery_over_http() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let registry = HandlerRegistry::new().on("payment_intent.succeeded", move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let app = app(registry, 3);
    let payload = body("evt_1", "payment_intent.succeeded");
    let header = sign_payload(SECRET, &payload, NOW);

    let first = app.clone().oneshot(signed_request(payload.clone(), &header)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let json = json_body(first).await;
    assert_eq!(json["received"], true);
    assert_eq!(json["processed"], true);
    assert_eq!(json["event_id"], "evt_1");

    let second = app.oneshot(signed_request(payload, &header)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let json = json_body(second).await;
    assert_eq!(json["processed"], false);
    assert_eq!(json["disposition"], "duplicate");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bad_signature_is_400() {
    let app = app(HandlerRegistry::new(), 3);
    let payload = body("evt_2", "invoice.paid");
    let header = sign_payload("whsec_wrong", &payload, NOW);

    let response = app.oneshot(signed_request(payload, &header)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert!(json["error"].as_str().unwrap().contains("signature"));
    assert!(json["error_id"].is_string());
}

#[tokio::test]
async fn test_expired_signature_is_400() {
    let app = app(HandlerRegistry::new(), 3);
    let payload = body("evt_3", "invoice.paid");
    let header = sign_payload(SECRET, &payload, NOW - 600);

    let response = app.oneshot(signed_request(payload, &header)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_json_is_400() {
    let app = app(HandlerRegistry::new(), 3);
    let payload = b"{not json".to_vec();
    let header = sign_payload(SECRET, &payload, NOW);

    let response = app.oneshot(signed_request(payload, &header)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_exhausted_handler_is_500_without_details() {
    let registry = HandlerRegistry::new().on("invoice.paid", |_event| async {
        Err(anyhow::anyhow!("customer 42 has no ledger account"))
    });
    let app = app(registry, 2);
    let payload = body("evt_4", "invoice.paid");
    let header = sign_payload(SECRET, &payload, NOW);

    let response = app.oneshot(signed_request(payload, &header)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let json = json_body(response).await;
    assert_eq!(json["error"], "Internal server error");
    assert!(!json.to_string().contains("ledger"));
}

#[tokio::test]
async fn test_unhandled_type_is_200() {
    let app = app(HandlerRegistry::new(), 3);
    let payload = body("evt_5", "customer.created");
    let header = sign_payload(SECRET, &payload, NOW);

    let response = app.oneshot(signed_request(payload, &header)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["processed"], false);
    assert_eq!(json["disposition"], "unhandled");
}
