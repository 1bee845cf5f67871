//! Verification of inbound Slack webhook requests.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::links::{RequestData, WebhookOutcome};

const CONTENT_TYPE_HEADER: &str = "Content-Type";
const TIMESTAMP_HEADER: &str = "X-Slack-Request-Timestamp";
const SIGNATURE_HEADER: &str = "X-Slack-Signature";

/// Maximum shift we allow between an inbound request's timestamp and our
/// clock, to defend against replay attacks.
/// See <https://docs.slack.dev/authentication/verifying-requests-from-slack>.
const MAX_SKEW: Duration = Duration::from_secs(5 * 60);

/// Slack API implementation detail.
/// See <https://docs.slack.dev/authentication/verifying-requests-from-slack>.
const SIGNATURE_VERSION: &str = "v0";

pub fn webhook_handler(r: &RequestData) -> WebhookOutcome {
    if let Err(status) = check_content_type_header(r)
        .and_then(|()| check_timestamp_header(r))
        .and_then(|()| check_signature_header(r))
    {
        return WebhookOutcome::Status(status);
    }

    // https://docs.slack.dev/reference/events/url_verification
    if r.path_suffix == "event" {
        if let Some(payload) = &r.json_payload {
            if payload.get("type").and_then(|v| v.as_str()) == Some("url_verification") {
                debug!(event_type = "url_verification", "replied to Slack URL verification event");
                let challenge = payload
                    .get("challenge")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                return WebhookOutcome::Body {
                    content_type: "text/plain",
                    body: Bytes::from(challenge.to_string()),
                };
            }
        }
    }

    // TBD: dispatch the event notification data to...?
    debug!(
        path_suffix = %r.path_suffix,
        payload_bytes = r.raw_payload.len(),
        "received Slack event notification",
    );

    WebhookOutcome::Status(StatusCode::OK)
}

fn check_content_type_header(r: &RequestData) -> Result<(), StatusCode> {
    let expected = if r.path_suffix == "event" {
        "application/json"
    } else {
        "application/x-www-form-urlencoded"
    };

    let got = r.header(CONTENT_TYPE_HEADER);
    if got != expected {
        warn!(header = CONTENT_TYPE_HEADER, got, want = expected,
            "bad request: unexpected header value");
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok(())
}

fn check_timestamp_header(r: &RequestData) -> Result<(), StatusCode> {
    let ts = r.header(TIMESTAMP_HEADER);
    if ts.is_empty() {
        warn!(header = TIMESTAMP_HEADER, "bad request: missing header");
        return Err(StatusCode::BAD_REQUEST);
    }

    let Ok(secs) = ts.parse::<u64>() else {
        warn!(header = TIMESTAMP_HEADER, got = ts, "bad request: invalid header value");
        return Err(StatusCode::BAD_REQUEST);
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if now.abs_diff(secs) > MAX_SKEW.as_secs() {
        warn!(header = TIMESTAMP_HEADER, got = ts, "bad request: stale header value");
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok(())
}

fn check_signature_header(r: &RequestData) -> Result<(), StatusCode> {
    let sig = r.header(SIGNATURE_HEADER);
    if sig.is_empty() {
        warn!(header = SIGNATURE_HEADER, "bad request: missing header");
        return Err(StatusCode::FORBIDDEN);
    }

    let Some(secret) = r.link_secrets.get("signing_secret").filter(|s| !s.is_empty()) else {
        warn!("signing secret is not configured");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };

    let ts = r.header(TIMESTAMP_HEADER);
    if !verify_signature(secret, ts, sig, &r.raw_payload) {
        warn!(signature = sig, "signature verification failed");
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(())
}

/// Implements
/// <https://docs.slack.dev/authentication/verifying-requests-from-slack>:
/// the signature header carries `v0=hex(HMAC-SHA256(secret, "v0:ts:body"))`.
fn verify_signature(signing_secret: &str, ts: &str, want: &str, body: &[u8]) -> bool {
    let Some(want_hex) = want.strip_prefix("v0=") else {
        return false;
    };
    let Ok(want_bytes) = hex::decode(want_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(signing_secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{SIGNATURE_VERSION}:{ts}:").as_bytes());
    mac.update(body);
    mac.verify_slice(&want_bytes).is_ok()
}
