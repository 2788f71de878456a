//! Provider signature verification.
//!
//! Deliveries carry a header of the form
//! `t=<unix_timestamp>,v1=<hex_hmac>[,v1=<hex_hmac>...]`. Each `v1` value is an
//! HMAC-SHA256 of `"{timestamp}." ++ raw_body` keyed with the endpoint's
//! signing secret. Several `v1` entries appear while a secret is being rolled.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use subtle::ConstantTimeEq;

use super::event::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

/// Default replay window, matching the provider SDKs.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Why a delivery could not be authenticated.
///
/// All variants are permanent: the same bytes will never verify later, so
/// callers answer with a 4xx and nothing is recorded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// No signature in the header matches the payload.
    #[error("no signature matches the payload")]
    SignatureMismatch,

    /// The signed timestamp is outside the tolerance window.
    #[error("timestamp outside the tolerance window ({age_seconds} seconds old)")]
    Expired { age_seconds: i64 },

    /// The authenticated body is not a valid event.
    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },
}

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// Hex encoded `v1` digests, in header order.
    pub signatures: Vec<String>,
}

/// Parse a signature header.
///
/// Returns `None` when the header has no usable timestamp or no `v1` entry.
/// Unknown schemes such as `v0` are skipped.
pub fn parse_signature_header(header: &str) -> Option<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };

        match key.trim() {
            "t" => timestamp = value.trim().parse::<i64>().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    if signatures.is_empty() {
        return None;
    }

    Some(SignatureHeader {
        timestamp: timestamp?,
        signatures,
    })
}

fn mac_for(secret: &[u8], timestamp: i64, payload: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Compute the hex encoded `v1` digest for a payload
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mac = mac_for(secret.as_bytes(), timestamp, payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Build a complete signature header for a payload.
///
/// Mirrors the provider SDK helper for generating test headers.
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    format!("t={},v1={}", timestamp, compute_signature(secret, timestamp, payload))
}

/// Constant-time comparison to prevent timing attacks
///
/// Uses `subtle`, whose optimization barriers keep the comparison from being
/// turned back into an early-exit loop.
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Verifies deliveries against one signing secret.
///
/// The secret is stored using [`SecretString`] so it does not show up in
/// debug output.
pub struct SignatureVerifier {
    secret: SecretString,
    tolerance: Duration,
    clock: Arc<dyn Clock>,
}

impl SignatureVerifier {
    /// Create a verifier with the default 5 minute tolerance and the system clock
    pub fn new(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: DEFAULT_TOLERANCE,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Authenticate a delivery without parsing it.
    ///
    /// The timestamp is checked first, so a stale delivery is reported as
    /// [`VerificationError::Expired`] whether or not its digest is valid.
    /// Returns the signed timestamp.
    pub fn verify_signature(&self, payload: &[u8], header: &str) -> Result<i64, VerificationError> {
        let Some(parsed) = parse_signature_header(header) else {
            tracing::debug!("Webhook signature header missing timestamp or v1 signature");
            return Err(VerificationError::SignatureMismatch);
        };

        // `t` is unauthenticated and may be any i64
        let age_seconds = self.clock.now().saturating_sub(parsed.timestamp);
        if age_seconds.unsigned_abs() > self.tolerance.as_secs() {
            tracing::debug!(age_seconds, "Webhook timestamp outside tolerance");
            return Err(VerificationError::Expired { age_seconds });
        }

        let expected = mac_for(self.secret.expose_secret().as_bytes(), parsed.timestamp, payload)
            .finalize()
            .into_bytes();

        let matched = parsed
            .signatures
            .iter()
            .filter_map(|sig| hex::decode(sig).ok())
            .any(|provided| constant_time_compare(&expected, &provided));

        if !matched {
            tracing::debug!(candidates = parsed.signatures.len(), "Webhook signature verification failed");
            return Err(VerificationError::SignatureMismatch);
        }

        Ok(parsed.timestamp)
    }

    /// Authenticate a delivery and parse it into an event.
    pub fn verify(&self, payload: &[u8], header: &str) -> Result<WebhookEvent, VerificationError> {
        self.verify_signature(payload, header)?;

        // Detailed parse errors stay in the logs; callers get a generic message
        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "webhook_inbox::verification",
                error = %e,
                "Failed to parse webhook payload"
            );
            VerificationError::MalformedPayload {
                message: "malformed JSON payload".to_string(),
            }
        })
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

/// Verify a delivery in one call using the system clock.
pub fn verify(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_seconds: u64,
) -> Result<WebhookEvent, VerificationError> {
    SignatureVerifier::new(secret)
        .with_tolerance(Duration::from_secs(tolerance_seconds))
        .verify(payload, header)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;
    const PAYLOAD: &[u8] =
        br#"{"id":"evt_123","type":"payment_intent.succeeded","data":{"object":{}},"created":1700000000,"livemode":false}"#;

    fn verifier_at(now: i64) -> SignatureVerifier {
        SignatureVerifier::new(SECRET).with_clock(Arc::new(FixedClock::new(now)))
    }

    // ============ parse_signature_header tests ============

    #[test]
    fn test_parse_signature_header() {
        let parsed = parse_signature_header("t=1234567890,v1=abc123def456").unwrap();
        assert_eq!(parsed.timestamp, 1234567890);
        assert_eq!(parsed.signatures, vec!["abc123def456".to_string()]);
    }

    #[test]
    fn test_parse_signature_header_multiple_signatures() {
        let parsed = parse_signature_header("t=1, v1=aa, v0=legacy, v1=bb").unwrap();
        assert_eq!(parsed.timestamp, 1);
        assert_eq!(parsed.signatures, vec!["aa".to_string(), "bb".to_string()]);
    }

    #[test]
    fn test_parse_signature_header_invalid() {
        assert!(parse_signature_header("").is_none());
        assert!(parse_signature_header("invalid").is_none());
        assert!(parse_signature_header("t=123").is_none()); // no v1
        assert!(parse_signature_header("v1=abc").is_none()); // no timestamp
        assert!(parse_signature_header("t=abc,v1=abc").is_none()); // bad timestamp
    }

    // ============ constant_time_compare tests ============

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_compare(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_compare(&[1, 2], &[1, 2, 3]));
    }

    // ============ signing tests ============

    #[test]
    fn test_sign_payload_format() {
        let header = sign_payload(SECRET, PAYLOAD, NOW);
        assert!(header.starts_with("t=1700000000,v1="));
        assert_eq!(header.len(), "t=1700000000,v1=".len() + 64);
    }

    #[test]
    fn test_signature_covers_timestamp() {
        assert_ne!(
            compute_signature(SECRET, NOW, PAYLOAD),
            compute_signature(SECRET, NOW + 1, PAYLOAD)
        );
    }

    // ============ SignatureVerifier tests ============

    #[test]
    fn test_verify_valid_signature() {
        let header = sign_payload(SECRET, PAYLOAD, NOW);
        let event = verifier_at(NOW).verify(PAYLOAD, &header).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.event_type, "payment_intent.succeeded");
    }

    #[test]
    fn test_verify_wrong_secret() {
        let header = sign_payload("whsec_other", PAYLOAD, NOW);
        let result = verifier_at(NOW).verify(PAYLOAD, &header);
        assert_eq!(result, Err(VerificationError::SignatureMismatch));
    }

    #[test]
    fn test_verify_modified_payload() {
        let header = sign_payload(SECRET, PAYLOAD, NOW);
        let tampered = PAYLOAD.to_vec().into_iter().map(|b| if b == b'1' { b'2' } else { b }).collect::<Vec<_>>();
        let result = verifier_at(NOW).verify(&tampered, &header);
        assert_eq!(result, Err(VerificationError::SignatureMismatch));
    }

    #[test]
    fn test_verify_reserialized_payload_fails() {
        // Same JSON, different bytes
        let header = sign_payload(SECRET, PAYLOAD, NOW);
        let value: serde_json::Value = serde_json::from_slice(PAYLOAD).unwrap();
        let pretty = serde_json::to_vec_pretty(&value).unwrap();
        let result = verifier_at(NOW).verify(&pretty, &header);
        assert_eq!(result, Err(VerificationError::SignatureMismatch));
    }

    #[test]
    fn test_verify_any_matching_signature_accepted() {
        let valid = compute_signature(SECRET, NOW, PAYLOAD);
        let header = format!("t={},v1={},v1={}", NOW, "00".repeat(32), valid);
        assert!(verifier_at(NOW).verify(PAYLOAD, &header).is_ok());
    }

    #[test]
    fn test_verify_malformed_signatures() {
        let verifier = verifier_at(NOW);
        for sig in ["not-hex", "abc", "0g0g0g", ""] {
            let header = format!("t={},v1={}", NOW, sig);
            assert_eq!(
                verifier.verify(PAYLOAD, &header),
                Err(VerificationError::SignatureMismatch),
                "Malformed signature '{}' should fail",
                sig
            );
        }
    }

    #[test]
    fn test_verify_unparseable_header() {
        let result = verifier_at(NOW).verify(PAYLOAD, "garbage");
        assert_eq!(result, Err(VerificationError::SignatureMismatch));
    }

    #[test]
    fn test_verify_tolerance_boundary() {
        let header = sign_payload(SECRET, PAYLOAD, NOW);

        // Exactly at the edge is still accepted, in both directions
        assert!(verifier_at(NOW + 300).verify(PAYLOAD, &header).is_ok());
        assert!(verifier_at(NOW - 300).verify(PAYLOAD, &header).is_ok());

        assert_eq!(
            verifier_at(NOW + 301).verify(PAYLOAD, &header),
            Err(VerificationError::Expired { age_seconds: 301 })
        );
        assert_eq!(
            verifier_at(NOW - 301).verify(PAYLOAD, &header),
            Err(VerificationError::Expired { age_seconds: -301 })
        );
    }

    #[test]
    fn test_expired_reported_regardless_of_signature() {
        let bad_header = format!("t={},v1={}", NOW, "00".repeat(32));
        let result = verifier_at(NOW + 3600).verify(PAYLOAD, &bad_header);
        assert_eq!(result, Err(VerificationError::Expired { age_seconds: 3600 }));
    }

    #[test]
    fn test_extreme_timestamps_expire() {
        let verifier = verifier_at(NOW);
        let sig = "00".repeat(32);

        let header = format!("t={},v1={}", i64::MIN, sig);
        assert_eq!(
            verifier.verify(PAYLOAD, &header),
            Err(VerificationError::Expired { age_seconds: i64::MAX })
        );

        let header = format!("t={},v1={}", i64::MAX, sig);
        assert!(matches!(verifier.verify(PAYLOAD, &header), Err(VerificationError::Expired { .. })));
    }

    #[test]
    fn test_custom_tolerance() {
        let header = sign_payload(SECRET, PAYLOAD, NOW);
        let verifier = verifier_at(NOW + 10).with_tolerance(Duration::from_secs(5));
        assert!(matches!(verifier.verify(PAYLOAD, &header), Err(VerificationError::Expired { .. })));
    }

    #[test]
    fn test_clock_advances() {
        let clock = Arc::new(FixedClock::new(NOW));
        let verifier = SignatureVerifier::new(SECRET).with_clock(clock.clone());
        let header = sign_payload(SECRET, PAYLOAD, NOW);

        assert!(verifier.verify(PAYLOAD, &header).is_ok());
        clock.advance(301);
        assert!(matches!(verifier.verify(PAYLOAD, &header), Err(VerificationError::Expired { .. })));
    }

    #[test]
    fn test_verify_malformed_json() {
        let payload = b"not json at all";
        let header = sign_payload(SECRET, payload, NOW);
        let result = verifier_at(NOW).verify(payload, &header);
        assert!(matches!(result, Err(VerificationError::MalformedPayload { .. })));
    }

    #[test]
    fn test_verify_json_missing_fields() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload(SECRET, payload, NOW);
        let result = verifier_at(NOW).verify(payload, &header);
        assert!(matches!(result, Err(VerificationError::MalformedPayload { .. })));
    }

    #[test]
    fn test_verify_signature_only_skips_parsing() {
        let payload = b"opaque bytes";
        let header = sign_payload(SECRET, payload, NOW);
        assert_eq!(verifier_at(NOW).verify_signature(payload, &header), Ok(NOW));
    }

    #[test]
    fn test_free_function_uses_system_clock() {
        let now = chrono::Utc::now().timestamp();
        let header = sign_payload(SECRET, PAYLOAD, now);
        assert!(verify(PAYLOAD, &header, SECRET, 300).is_ok());

        let old = sign_payload(SECRET, PAYLOAD, 1_000_000_000);
        assert!(matches!(
            verify(PAYLOAD, &old, SECRET, 300),
            Err(VerificationError::Expired { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", SignatureVerifier::new(SECRET));
        assert!(!debug.contains(SECRET));
    }
}
