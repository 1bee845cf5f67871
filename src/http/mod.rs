//! HTTP ingress: webhook receivers, manual connect/disconnect endpoints for
//! stateful links, and an optional passthrough proxy for OAuth callbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::links::{self, LinkData, RequestData, WebhookOutcome};
use crate::secrets::{LinkInfo, SecretsClient};

const PROXY_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_BODY_SIZE: usize = 10 << 20; // 10 MiB.

/// Alphabet of the short-UUID encoding used for link IDs: base57, i.e.
/// alphanumerics minus the lookalikes l, 1, I, O and 0.
const SHORT_UUID_ALPHABET: &str = "23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const SHORT_UUID_LEN: usize = 22;

struct AppState {
    secrets: SecretsClient,
    oauth_url: Option<Url>,
    proxy: reqwest::Client,
    connections: DashMap<String, LinkData>,
}

/// Starts the HTTP server. This blocks for the lifetime of the daemon.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let secrets = if cfg.dev {
        SecretsClient::plaintext(cfg.secrets_addr.as_str())
    } else {
        SecretsClient::with_tls(cfg.secrets_addr.as_str(), &cfg.secrets_tls)?
    };

    let oauth_url = cfg.oauth_base_addr.as_deref().and_then(base_url);
    if let Some(u) = &oauth_url {
        info!(url = %u, "HTTP passthrough for OAuth callbacks enabled");
    }

    let state = Arc::new(AppState {
        secrets,
        oauth_url,
        proxy: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(PROXY_TIMEOUT)
            .build()?,
        connections: DashMap::new(),
    });

    let mut router = Router::new()
        .route("/connect/:id", get(connect_handler))
        .route("/disconnect/:id", get(disconnect_handler))
        .route("/webhook/*id", get(webhook_handler).post(webhook_handler));
    if state.oauth_url.is_some() {
        router = router
            .route("/callback", get(oauth_passthrough))
            .route("/start", get(oauth_passthrough).post(oauth_passthrough))
            .route("/success", get(oauth_passthrough));
    }
    let app = router
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", cfg.webhook_port)).await?;
    info!(port = cfg.webhook_port, "HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Converts an address like `"localhost:14460"` into a base URL, forcing an
/// HTTP scheme and stripping any path, query, or fragment. Returns `None`
/// for empty or unparseable input.
fn base_url(addr: &str) -> Option<Url> {
    if addr.is_empty() {
        return None;
    }

    let addr = if let Some(rest) = addr.strip_prefix("https://") {
        format!("http://{rest}")
    } else if addr.starts_with("http://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };

    let mut u = Url::parse(&addr).ok()?;
    if u.host_str().is_none_or(str::is_empty) {
        return None;
    }
    u.set_path("");
    u.set_query(None);
    u.set_fragment(None);

    Some(u)
}

/// Splits the wildcard path tail into the link ID and an optional opaque
/// suffix, then validates the ID's short-UUID shape.
fn parse_link_path(raw: &str) -> Result<(String, String), StatusCode> {
    let (id, suffix) = match raw.split_once('/') {
        Some((id, suffix)) => (id, suffix),
        None => (raw, ""),
    };

    if id.is_empty() {
        warn!("bad request: missing ID");
        return Err(StatusCode::BAD_REQUEST);
    }
    if !is_short_uuid(id) {
        warn!(link_id = id, "bad request: ID is an invalid short UUID");
        return Err(StatusCode::NOT_FOUND);
    }

    Ok((id.to_string(), suffix.to_string()))
}

fn is_short_uuid(id: &str) -> bool {
    id.len() == SHORT_UUID_LEN && id.chars().all(|c| SHORT_UUID_ALPHABET.contains(c))
}

/// Shared gate on resolved link data: lookup errors are server faults,
/// unknown links and links whose auth flow never completed are not found.
fn check_link_data(result: anyhow::Result<Option<LinkInfo>>) -> Result<LinkInfo, StatusCode> {
    match result {
        Err(err) => {
            warn!(error = %err, "failed to get link data from the secrets service");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Ok(None) => {
            warn!("bad request: link not found");
            Err(StatusCode::NOT_FOUND)
        }
        Ok(Some(info)) if info.secrets.is_empty() => {
            warn!("bad request: link not initialized");
            Err(StatusCode::NOT_FOUND)
        }
        Ok(Some(info)) => Ok(info),
    }
}

/// Idempotent endpoint for manually starting a stateful (non-webhook)
/// connection for a link.
async fn connect_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> StatusCode {
    info!(http_method = "GET", link_id = %id, "received connection request");

    let (id, _) = match parse_link_path(&id) {
        Ok(parts) => parts,
        Err(status) => return status,
    };

    let info = match check_link_data(state.secrets.link_data(&id).await) {
        Ok(info) => info,
        Err(status) => return status,
    };

    let Some(handler) = links::CONNECTION_HANDLERS.get(info.template.as_str()) else {
        warn!(template = %info.template, "bad request: unsupported link template for connections");
        return StatusCode::NOT_IMPLEMENTED;
    };

    let data = LinkData {
        id: id.clone(),
        template: info.template,
        secrets: info.secrets,
    };
    let status = handler(data.clone()).await;
    state.connections.insert(id, data);
    status
}

/// Idempotent endpoint for manually stopping a stateful connection.
async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> StatusCode {
    info!(http_method = "GET", link_id = %id, "received disconnection request");

    let (id, _) = match parse_link_path(&id) {
        Ok(parts) => parts,
        Err(status) => return status,
    };

    match state.secrets.link_template(&id).await {
        Err(err) => {
            warn!(error = %err, "failed to get link template from the secrets service");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        Ok(None) => {
            warn!("bad request: link not found");
            return StatusCode::NOT_FOUND;
        }
        Ok(Some(_)) => {}
    }

    if !state.connections.contains_key(&id) {
        return StatusCode::OK;
    }

    StatusCode::NOT_IMPLEMENTED
}

/// Checks and processes incoming asynchronous event notifications over HTTP
/// from third-party services.
async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(raw_path): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    info!(http_method = %method, url_path = %raw_path, content_type = %content_type,
        "received HTTP request");

    let Ok((link_id, path_suffix)) = parse_link_path(&raw_path) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let info = match check_link_data(state.secrets.link_data(&link_id).await) {
        Ok(info) => info,
        Err(status) => return status.into_response(),
    };

    let json_payload = if method == Method::POST && content_type.starts_with("application/json") {
        match serde_json::from_slice(&body) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(error = %err, link_id = %link_id, "bad request: JSON decoding error");
                return StatusCode::BAD_REQUEST.into_response();
            }
        }
    } else {
        None
    };

    let mut query_or_form = parse_query(query.as_deref().unwrap_or_default());
    if method == Method::POST && content_type.starts_with("application/x-www-form-urlencoded") {
        for (k, vs) in parse_query(std::str::from_utf8(&body).unwrap_or_default()) {
            query_or_form.entry(k).or_default().extend(vs);
        }
    }

    // Forward the request's data to a service-specific handler.
    let Some(handler) = links::WEBHOOK_HANDLERS.get(info.template.as_str()) else {
        warn!(template = %info.template, link_id = %link_id,
            "bad request: unsupported link template for webhooks");
        return StatusCode::NOT_IMPLEMENTED.into_response();
    };

    let outcome = handler(&RequestData {
        path_suffix,
        headers,
        query_or_form,
        raw_payload: body,
        json_payload,
        link_secrets: info.secrets,
    });
    match outcome {
        WebhookOutcome::Status(status) => status.into_response(),
        WebhookOutcome::Body { content_type, body } => {
            (StatusCode::OK, [("Content-Type", content_type)], body).into_response()
        }
    }
}

fn parse_query(raw: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
        out.entry(k.into_owned()).or_default().push(v.into_owned());
    }
    out
}

/// Passes incoming requests (OAuth callbacks) through to a local OAuth
/// server, so both daemons can share a single HTTP tunnel in development
/// setups.
async fn oauth_passthrough(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!(http_method = %method, url_path = %uri.path(), "passing through OAuth request");

    // The configured base URL is present whenever this route is mounted.
    let Some(base) = state.oauth_url.clone() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut target = base;
    target.set_path(uri.path());
    target.set_query(uri.query());

    let request = state
        .proxy
        .request(method, target.as_str())
        .headers(headers)
        .body(body.to_vec());
    let upstream = match request.send().await {
        Ok(resp) => resp,
        Err(err) => {
            error!(error = %err, "failed to send OAuth passthrough request");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let status = upstream.status();
    let resp_headers = upstream.headers().clone();
    let resp_body = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "failed to read OAuth passthrough response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &resp_headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(resp_body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_rejects_unparseable_addresses() {
        assert!(base_url("").is_none());
        // "port" is not a number, so the authority fails to parse.
        assert!(base_url("host:port").is_none());
    }

    #[test]
    fn base_url_forces_http_and_strips_suffixes() {
        let u = base_url("localhost:14460").unwrap();
        assert_eq!(u.scheme(), "http");
        assert_eq!(u.host_str(), Some("localhost"));
        assert_eq!(u.port(), Some(14460));

        let u = base_url("https://example.com/path?q=1#frag").unwrap();
        assert_eq!(u.scheme(), "http");
        assert_eq!(u.host_str(), Some("example.com"));
        assert_eq!(u.query(), None);
        assert_eq!(u.fragment(), None);
    }

    #[test]
    fn link_path_splits_id_and_suffix() {
        let id = "NDBtRyodCAGzGzFczinvQW"; // 22 base57 chars
        assert_eq!(
            parse_link_path(id).unwrap(),
            (id.to_string(), String::new())
        );
        assert_eq!(
            parse_link_path(&format!("{id}/event")).unwrap(),
            (id.to_string(), "event".to_string())
        );
        assert_eq!(
            parse_link_path(&format!("{id}/a/b")).unwrap(),
            (id.to_string(), "a/b".to_string())
        );
    }

    #[test]
    fn link_path_rejects_bad_ids() {
        assert_eq!(parse_link_path("").unwrap_err(), StatusCode::BAD_REQUEST);
        assert_eq!(
            parse_link_path("/suffix-only").unwrap_err(),
            StatusCode::BAD_REQUEST
        );
        // Too short.
        assert_eq!(parse_link_path("abc").unwrap_err(), StatusCode::NOT_FOUND);
        // Right length, bad alphabet (contains l and 0).
        assert_eq!(
            parse_link_path("l0l0l0l0l0l0l0l0l0l0l0").unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn query_parsing_collects_repeated_keys() {
        let q = parse_query("a=1&b=2&a=3");
        assert_eq!(q["a"], vec!["1", "3"]);
        assert_eq!(q["b"], vec!["2"]);
    }
}
