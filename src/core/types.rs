//! Shared types for the WebSocket client: data messages, the error surface,
//! and dial options.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;

use super::frame::Opcode;

/// Convenience result alias for WebSocket operations.
pub type WsResult<T> = Result<T, WsError>;

/// A complete data message: the ordered concatenation of one initial Text or
/// Binary frame payload and any Continuation payloads up to the FIN frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataMessage {
    /// Opcode of the first frame in the sequence (Text or Binary).
    pub opcode: Opcode,
    pub data: Bytes,
}

/// Canonical error surface for the WebSocket client.
#[derive(Debug, Error)]
pub enum WsError {
    /// TCP or TLS transport failure while establishing a connection.
    #[error("dial failed: {0}")]
    Dial(String),

    /// The HTTP upgrade exchange completed but its semantics were wrong:
    /// bad status, missing or mismatched headers, bad accept digest.
    #[error("upgrade handshake failed: {0}")]
    Handshake(String),

    /// A decoded frame violates the framing rules.
    #[error("bad frame: {0}")]
    BadFrame(&'static str),

    /// The transport ended in the middle of a frame.
    #[error("transport ended mid-frame")]
    ShortRead,

    /// A data write was attempted after the close handshake began.
    #[error("send on closed connection")]
    SendOnClosed,

    /// A reconnect dial failed; the supervisor backs off and retries.
    #[error("reconnect dial failed: {0}")]
    DialRetry(String),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of 16-byte handshake nonces. The default draws from the OS;
/// swapping it out is a test seam only.
pub trait NonceSource: Send + Sync {
    fn nonce(&self) -> [u8; 16];
}

pub(crate) struct OsNonce;

impl NonceSource for OsNonce {
    fn nonce(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes
    }
}

/// Options recognized by [`dial`](crate::ws::dial): extra request headers
/// (e.g. `Authorization`) and an overridable nonce source.
///
/// The dialer never follows redirects: it writes the upgrade request on the
/// raw stream and reads exactly one response, so any non-101 status fails the
/// dial.
#[derive(Clone)]
pub struct DialOptions {
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) nonce: Arc<dyn NonceSource>,
}

impl DialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request header to the upgrade request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replaces the handshake nonce source. Test seam only.
    pub fn nonce_source(mut self, source: Arc<dyn NonceSource>) -> Self {
        self.nonce = source;
        self
    }
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            nonce: Arc::new(OsNonce),
        }
    }
}

impl fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOptions")
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_nonce_source_is_random() {
        let source = OsNonce;
        assert_ne!(source.nonce(), source.nonce());
    }
}
