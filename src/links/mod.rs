//! Service-specific handlers, keyed by link template name.
//!
//! A *link* is an opaque identifier resolved against the secrets service to
//! a template name plus a secrets map; the template selects which handler
//! processes the link's inbound notifications.

pub mod github;
pub mod slack;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use once_cell::sync::Lazy;
use serde_json::Value;

/// Everything a webhook handler gets from an inbound HTTP request, already
/// decoded once so handlers don't repeat the work.
pub struct RequestData {
    /// Opaque path component after the link ID, for services that need
    /// multiple webhooks per connection.
    pub path_suffix: String,
    pub headers: HeaderMap,
    /// URL query parameters merged with form-body fields.
    pub query_or_form: HashMap<String, Vec<String>>,
    /// The undecoded body, retained for signature checks.
    pub raw_payload: Bytes,
    /// Decoded body when the request carried `application/json`.
    pub json_payload: Option<Value>,
    pub link_secrets: HashMap<String, String>,
}

impl RequestData {
    /// A request header as a string, or `""` when missing or non-ASCII.
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }
}

/// Identity and credentials resolved for a stateful connection.
#[derive(Clone, Debug)]
pub struct LinkData {
    pub id: String,
    pub template: String,
    pub secrets: HashMap<String, String>,
}

/// What a webhook handler wants sent back: a bare status code, or a small
/// response body (e.g. a challenge echo).
pub enum WebhookOutcome {
    Status(StatusCode),
    Body {
        content_type: &'static str,
        body: Bytes,
    },
}

pub type WebhookHandlerFn = fn(&RequestData) -> WebhookOutcome;

pub type ConnectionHandlerFn = fn(LinkData) -> Pin<Box<dyn Future<Output = StatusCode> + Send>>;

/// Stateless webhook handlers for all the link templates this daemon
/// supports.
pub static WEBHOOK_HANDLERS: Lazy<HashMap<&'static str, WebhookHandlerFn>> = Lazy::new(|| {
    HashMap::from([
        ("github-app-jwt", github::webhook_handler as WebhookHandlerFn),
        ("github-user-pat", github::webhook_handler as WebhookHandlerFn),
        ("github-webhook", github::webhook_handler as WebhookHandlerFn),
        ("slack-bot-token", slack::webhook_handler as WebhookHandlerFn),
        ("slack-oauth", slack::webhook_handler as WebhookHandlerFn),
        ("slack-oauth-gov", slack::webhook_handler as WebhookHandlerFn),
    ])
});

/// Stateful connection handlers for all the link templates this daemon
/// supports.
pub static CONNECTION_HANDLERS: Lazy<HashMap<&'static str, ConnectionHandlerFn>> =
    Lazy::new(|| {
        HashMap::from([(
            "slack-socket-mode",
            slack::connection_handler as ConnectionHandlerFn,
        )])
    });
