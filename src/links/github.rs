//! Verification of inbound GitHub webhook requests.

use axum::http::StatusCode;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::links::{RequestData, WebhookOutcome};

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
const EVENT_HEADER: &str = "X-GitHub-Event";
const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

pub fn webhook_handler(r: &RequestData) -> WebhookOutcome {
    let sig = r.header(SIGNATURE_HEADER);
    if sig.is_empty() {
        warn!(header = SIGNATURE_HEADER, "bad request: missing header");
        return WebhookOutcome::Status(StatusCode::FORBIDDEN);
    }

    let Some(secret) = r.link_secrets.get("webhook_secret").filter(|s| !s.is_empty()) else {
        warn!("webhook secret is not configured");
        return WebhookOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR);
    };

    if !verify_signature(secret, sig, &r.raw_payload) {
        warn!(signature = sig, "signature verification failed");
        return WebhookOutcome::Status(StatusCode::FORBIDDEN);
    }

    // TBD: Dispatch the event notification data to...?
    debug!(
        event = r.header(EVENT_HEADER),
        delivery = r.header(DELIVERY_HEADER),
        payload_bytes = r.raw_payload.len(),
        "received GitHub event notification",
    );

    WebhookOutcome::Status(StatusCode::OK)
}

/// Implements
/// <https://docs.github.com/en/webhooks/using-webhooks/validating-webhook-deliveries>:
/// the signature header carries `sha256=hex(HMAC-SHA256(secret, body))`.
fn verify_signature(secret: &str, want: &str, body: &[u8]) -> bool {
    let Some(want_hex) = want.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(want_bytes) = hex::decode(want_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&want_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::http::HeaderMap;
    use bytes::Bytes;

    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn request(sig: &str, body: &[u8]) -> RequestData {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());
        headers.insert(EVENT_HEADER, "push".parse().unwrap());

        RequestData {
            path_suffix: String::new(),
            headers,
            query_or_form: HashMap::new(),
            raw_payload: Bytes::copy_from_slice(body),
            json_payload: serde_json::from_slice(body).ok(),
            link_secrets: HashMap::from([(
                "webhook_secret".to_string(),
                "test-secret".to_string(),
            )]),
        }
    }

    #[test]
    fn accepts_a_correctly_signed_delivery() {
        let body = br#"{"action":"opened"}"#;
        let r = request(&sign("test-secret", body), body);
        assert!(matches!(
            webhook_handler(&r),
            WebhookOutcome::Status(StatusCode::OK)
        ));
    }

    #[test]
    fn rejects_a_bad_signature() {
        let body = br#"{"action":"opened"}"#;
        let r = request(&sign("other-secret", body), body);
        assert!(matches!(
            webhook_handler(&r),
            WebhookOutcome::Status(StatusCode::FORBIDDEN)
        ));
    }

    #[test]
    fn rejects_a_missing_signature() {
        let mut r = request("sha256=00", b"{}");
        r.headers.remove(SIGNATURE_HEADER);
        assert!(matches!(
            webhook_handler(&r),
            WebhookOutcome::Status(StatusCode::FORBIDDEN)
        ));
    }
}
