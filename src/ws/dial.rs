//! HTTP upgrade handshake: nonce generation, response validation, and
//! adoption of the raw byte stream by a new [`Conn`].

use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rustls::pki_types::ServerName;
use sha1::{Digest, Sha1};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadBuf,
};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, trace};
use url::Url;

use crate::core::types::{DialOptions, WsError, WsResult};
use crate::ws::conn::Conn;

/// GUID the server hashes together with the nonce to prove it speaks
/// WebSocket (RFC 6455 section 4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const WS_VERSION: &str = "13";

/// Upper bound on the upgrade response head; anything larger is not a
/// WebSocket server worth talking to.
const MAX_RESPONSE_BYTES: usize = 16 * 1024;

/// Upper bound on how much of an error-response body gets drained before the
/// connection is dropped.
const MAX_DRAIN_BYTES: u64 = 64 * 1024;

/// Performs the upgrade handshake against `url` (`ws`, `wss`, `http`, or
/// `https` scheme) and returns the established connection.
///
/// Callers that need a deadline should wrap the future in
/// [`tokio::time::timeout`].
pub async fn dial(url: &str, opts: DialOptions) -> WsResult<Conn> {
    let parsed = Url::parse(url).map_err(|e| WsError::Dial(format!("invalid URL: {e}")))?;
    let ep = endpoint_from_url(&parsed)?;
    debug!(host = %ep.host_header, tls = ep.tls, "dialing WebSocket server");

    let tcp = TcpStream::connect((ep.host.as_str(), ep.port))
        .await
        .map_err(|e| WsError::Dial(e.to_string()))?;
    let stream = if ep.tls {
        let name = ServerName::try_from(ep.host.clone())
            .map_err(|e| WsError::Dial(format!("invalid server name: {e}")))?;
        let connector = TlsConnector::from(crate::tls::client_config());
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| WsError::Dial(e.to_string()))?;
        MaybeTlsStream::Tls(Box::new(tls))
    } else {
        MaybeTlsStream::Plain(tcp)
    };

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let nonce = BASE64.encode(opts.nonce.nonce());
    let request = build_request(&ep, &nonce, &opts.headers);
    write_half
        .write_all(request.as_bytes())
        .await
        .map_err(|e| WsError::Dial(e.to_string()))?;
    write_half
        .flush()
        .await
        .map_err(|e| WsError::Dial(e.to_string()))?;

    let resp = read_response(&mut reader).await?;
    if let Err(err) = check_handshake_response(&resp, &nonce) {
        drain_body(&mut reader, &resp).await;
        return Err(err);
    }

    trace!("upgrade handshake complete");
    Ok(Conn::spawn(reader, write_half))
}

/// Byte stream underlying a connection: plain TCP or TLS over TCP.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug)]
struct Endpoint {
    tls: bool,
    host: String,
    port: u16,
    host_header: String,
    request_target: String,
}

/// Maps a `ws`/`wss` (or already-HTTP) URL onto the transport endpoint and
/// the HTTP request target.
fn endpoint_from_url(u: &Url) -> WsResult<Endpoint> {
    let tls = match u.scheme() {
        "ws" | "http" => false,
        "wss" | "https" => true,
        other => return Err(WsError::Dial(format!("unsupported URL scheme {other:?}"))),
    };

    let host = u
        .host_str()
        .ok_or_else(|| WsError::Dial("URL has no host".to_string()))?
        .to_string();
    let port = u.port().unwrap_or(if tls { 443 } else { 80 });
    let host_header = match u.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.clone(),
    };

    let mut request_target = u.path().to_string();
    if request_target.is_empty() {
        request_target.push('/');
    }
    if let Some(query) = u.query() {
        request_target.push('?');
        request_target.push_str(query);
    }

    Ok(Endpoint {
        tls,
        host,
        port,
        host_header,
        request_target,
    })
}

fn build_request(ep: &Endpoint, nonce: &str, extra: &[(String, String)]) -> String {
    let mut req = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {nonce}\r\n\
         Sec-WebSocket-Version: {WS_VERSION}\r\n",
        ep.request_target, ep.host_header,
    );
    for (name, value) in extra {
        req.push_str(name);
        req.push_str(": ");
        req.push_str(value);
        req.push_str("\r\n");
    }
    req.push_str("\r\n");
    req
}

/// `base64(SHA-1(nonce || GUID))`, the value the server must echo in
/// `Sec-WebSocket-Accept`.
fn accept_key(nonce: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_response<R>(r: &mut R) -> WsResult<HttpResponse>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut total = 0usize;

    read_header_line(r, &mut line, &mut total).await?;
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WsError::Handshake(format!("malformed status line {:?}", line.trim_end())))?;

    let mut headers = Vec::new();
    loop {
        line.clear();
        read_header_line(r, &mut line, &mut total).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WsError::Handshake(format!("malformed header line {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(HttpResponse { status, headers })
}

async fn read_header_line<R>(r: &mut R, line: &mut String, total: &mut usize) -> WsResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let n = r
        .read_line(line)
        .await
        .map_err(|e| WsError::Dial(e.to_string()))?;
    if n == 0 {
        return Err(WsError::Dial("connection closed during handshake".to_string()));
    }
    *total += n;
    if *total > MAX_RESPONSE_BYTES {
        return Err(WsError::Handshake("oversized response header".to_string()));
    }
    Ok(())
}

fn check_handshake_response(resp: &HttpResponse, nonce: &str) -> WsResult<()> {
    if resp.status != 101 {
        return Err(WsError::Handshake(format!(
            "unexpected HTTP status {}",
            resp.status
        )));
    }

    check_http_header(resp, "Upgrade", "websocket")?;
    check_http_header(resp, "Connection", "upgrade")?;

    let want = accept_key(nonce);
    match resp.header("Sec-WebSocket-Accept") {
        Some(got) if got == want => Ok(()),
        Some(_) => Err(WsError::Handshake(
            "Sec-WebSocket-Accept digest mismatch".to_string(),
        )),
        None => Err(WsError::Handshake(
            "missing Sec-WebSocket-Accept header".to_string(),
        )),
    }
}

/// Header names and values are both compared case-insensitively.
fn check_http_header(resp: &HttpResponse, name: &str, want: &str) -> WsResult<()> {
    match resp.header(name) {
        Some(got) if got.eq_ignore_ascii_case(want) => Ok(()),
        Some(got) => Err(WsError::Handshake(format!(
            "header {name}: got {got:?}, want {want:?}"
        ))),
        None => Err(WsError::Handshake(format!("missing header {name}"))),
    }
}

/// Best-effort discard of a failed response's body, bounded by
/// [`MAX_DRAIN_BYTES`]. The connection is dropped right after, so errors
/// don't matter here.
async fn drain_body<R>(r: &mut R, resp: &HttpResponse)
where
    R: AsyncRead + Unpin,
{
    let len = resp
        .header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        .min(MAX_DRAIN_BYTES);
    if len > 0 {
        let _ = tokio::io::copy(&mut r.take(len), &mut tokio::io::sink()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> Endpoint {
        endpoint_from_url(&Url::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn ws_schemes_map_onto_http_endpoints() {
        for (url, tls, port) in [
            ("ws://example.com", false, 80),
            ("wss://example.com", true, 443),
            ("http://example.com", false, 80),
            ("https://example.com", true, 443),
            ("ws://example.com:9001/runCase?case=1", false, 9001),
        ] {
            let ep = endpoint(url);
            assert_eq!(ep.tls, tls, "{url}");
            assert_eq!(ep.port, port, "{url}");
        }

        let err = endpoint_from_url(&Url::parse("ftp://example.com").unwrap()).unwrap_err();
        assert!(matches!(err, WsError::Dial(_)));
    }

    #[test]
    fn host_header_keeps_explicit_ports_only() {
        assert_eq!(endpoint("ws://example.com").host_header, "example.com");
        assert_eq!(
            endpoint("ws://example.com:9001").host_header,
            "example.com:9001"
        );
    }

    #[test]
    fn request_carries_upgrade_headers_and_nonce() {
        let ep = endpoint("ws://example.com/chat?room=1");
        let req = build_request(
            &ep,
            "random",
            &[("Authorization".to_string(), "Bearer token".to_string())],
        );

        assert!(req.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.com\r\n"));
        assert!(req.contains("Upgrade: websocket\r\n"));
        assert!(req.contains("Connection: Upgrade\r\n"));
        assert!(req.contains("Sec-WebSocket-Key: random\r\n"));
        assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(req.contains("Authorization: Bearer token\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    fn response(status: u16, accept: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: vec![
                ("Upgrade".to_string(), "websocket".to_string()),
                ("Connection".to_string(), "upgrade".to_string()),
                ("Sec-WebSocket-Accept".to_string(), accept.to_string()),
            ],
        }
    }

    #[test]
    fn accepts_valid_upgrade_response() {
        let resp = response(101, &accept_key("nonce"));
        assert!(check_handshake_response(&resp, "nonce").is_ok());
        // Known-answer check against a fixed digest.
        assert_eq!(accept_key("nonce"), "aKdbWDF/eTHzEuUTppwBd/yfP8o=");
    }

    #[test]
    fn rejects_bad_status_and_bad_digest() {
        let resp = response(401, &accept_key("nonce"));
        assert!(matches!(
            check_handshake_response(&resp, "nonce"),
            Err(WsError::Handshake(_))
        ));

        let resp = response(101, "bm90IHRoZSByaWdodCBkaWdlc3Q=");
        assert!(matches!(
            check_handshake_response(&resp, "nonce"),
            Err(WsError::Handshake(_))
        ));
    }

    #[test]
    fn header_checks_are_case_insensitive() {
        let resp = HttpResponse {
            status: 101,
            headers: vec![("aaa".to_string(), "bbb".to_string())],
        };

        assert!(check_http_header(&resp, "aaa", "bbb").is_ok());
        assert!(check_http_header(&resp, "AAA", "bbb").is_ok());
        assert!(check_http_header(&resp, "aaa", "BBB").is_ok());
        assert!(check_http_header(&resp, "aaa", "ccc").is_err());
        assert!(check_http_header(&resp, "ccc", "ddd").is_err());
    }

    #[tokio::test]
    async fn parses_response_head() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
                    Upgrade: websocket\r\n\
                    Connection: Upgrade\r\n\
                    \r\n";
        let mut r = BufReader::new(&raw[..]);
        let resp = read_response(&mut r).await.unwrap();
        assert_eq!(resp.status, 101);
        assert_eq!(resp.header("upgrade"), Some("websocket"));
        assert_eq!(resp.header("missing"), None);
    }
}
