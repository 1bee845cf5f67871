//! Slack Socket Mode: short-lived WebSocket URLs for unpublished apps.
//!
//! Socket Mode URLs expire after a single use, so the supervisor's URL
//! producer calls `apps.connections.open` before every dial.
//! Based on <https://docs.slack.dev/reference/methods/apps.connections.open>.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::links::LinkData;
use crate::ws::{DataMessage, DialOptions, Registry, UrlProducer, WsError, WsResult};

const CONN_OPEN_URL: &str = "https://slack.com/api/apps.connections.open";
const TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct ConnOpenResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Generates a temporary Socket Mode WebSocket URL (`wss://...`) that an
/// unpublished Slack app can connect to.
pub async fn open_socket_url(http: &reqwest::Client, app_token: &str) -> WsResult<String> {
    let resp = http
        .post(CONN_OPEN_URL)
        .bearer_auth(app_token)
        .timeout(TIMEOUT)
        .send()
        .await
        .map_err(|e| WsError::Dial(format!("failed to send HTTP request: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(WsError::Dial(format!("Slack API HTTP status {status}")));
    }

    let decoded: ConnOpenResponse = resp
        .json()
        .await
        .map_err(|e| WsError::Dial(format!("failed to parse HTTP response body: {e}")))?;
    if !decoded.ok {
        return Err(WsError::Dial(format!(
            "Slack API error: {}",
            decoded.error.unwrap_or_default()
        )));
    }

    decoded
        .url
        .ok_or_else(|| WsError::Dial("Slack API response carries no URL".to_string()))
}

/// Opens (or reuses) the Socket Mode session for a link and spawns a
/// consumer of its event stream.
pub fn connection_handler(data: LinkData) -> Pin<Box<dyn Future<Output = StatusCode> + Send>> {
    Box::pin(async move {
        let Some(app_token) = data.secrets.get("app_token").cloned() else {
            warn!(link_id = %data.id, "link secrets are missing the app-level token");
            return StatusCode::INTERNAL_SERVER_ERROR;
        };

        let http = reqwest::Client::new();
        let url: UrlProducer = Arc::new(move || {
            let http = http.clone();
            let token = app_token.clone();
            Box::pin(async move { open_socket_url(&http, &token).await })
        });

        let client = match Registry::global()
            .acquire_or_reuse(url, &data.id, DialOptions::new())
            .await
        {
            Ok(client) => client,
            Err(err) => {
                error!(error = %err, link_id = %data.id, "failed to open Socket Mode session");
                return StatusCode::BAD_GATEWAY;
            }
        };

        let inbox = client.incoming_messages();
        let link_id = data.id.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                log_event(&link_id, &msg);
            }
            info!(link_id = %link_id, "Socket Mode session disposed");
        });

        StatusCode::OK
    })
}

fn log_event(link_id: &str, msg: &DataMessage) {
    match serde_json::from_slice::<Value>(&msg.data) {
        Ok(event) => debug!(
            link_id,
            event_type = event.get("type").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "received Socket Mode event",
        ),
        Err(err) => warn!(link_id, error = %err, "Socket Mode event is not valid JSON"),
    }
}
