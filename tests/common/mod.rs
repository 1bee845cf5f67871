//! In-process WebSocket servers for exercising the client end to end over
//! loopback TCP. The server side of the protocol is implemented by hand
//! here, which doubles as an independent check on the client's framing.

// Each integration test crate compiles its own copy of this module and uses
// a different slice of it.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use ingressd::ws::NonceSource;

pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Nonce source pinned to the RFC 6455 sample value, so tests can assert the
/// exact bytes of the handshake.
pub struct SampleNonce;

impl NonceSource for SampleNonce {
    fn nonce(&self) -> [u8; 16] {
        *b"the sample nonce" // base64: dGhlIHNhbXBsZSBub25jZQ==
    }
}

pub fn nonce_source() -> Arc<dyn NonceSource> {
    Arc::new(SampleNonce)
}

pub fn accept_digest(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// One accepted server-side connection, post-upgrade.
pub struct ServerWs {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

/// A decoded frame as the server saw it on the wire.
#[derive(Debug)]
pub struct ServerFrame {
    pub fin: bool,
    pub opcode: u8,
    pub mask_key: [u8; 4],
    pub payload: Vec<u8>,
}

/// Accepts one TCP connection and completes the server side of the upgrade.
pub async fn accept_ws(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    upgrade(stream).await
}

/// Reads the upgrade request and answers 101 with the correct digest.
/// Returns the request head alongside the connection so tests can make
/// assertions about it.
pub async fn upgrade_with_request(stream: TcpStream) -> (ServerWs, String) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut head = String::new();
    let mut key = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line.trim_end().is_empty() {
            break;
        }
        if let Some((name, value)) = line.trim_end().split_once(':') {
            if name.trim().eq_ignore_ascii_case("sec-websocket-key") {
                key = value.trim().to_string();
            }
        }
        head.push_str(&line);
    }

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_digest(&key),
    );
    writer.write_all(response.as_bytes()).await.unwrap();

    (ServerWs { reader, writer }, head)
}

pub async fn upgrade(stream: TcpStream) -> ServerWs {
    upgrade_with_request(stream).await.0
}

/// Spawns a server that upgrades every connection and then discards
/// whatever the client sends. Good enough for registry tests, which only
/// care about the dials.
pub async fn spawn_upgrade_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut ws = upgrade(stream).await;
                let mut buf = [0u8; 1024];
                while matches!(ws.reader.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    addr
}

impl ServerWs {
    /// Writes one server-to-client (unmasked) frame.
    pub async fn send_frame(&mut self, fin: bool, opcode: u8, payload: &[u8]) {
        let mut wire = Vec::with_capacity(payload.len() + 10);
        wire.push(if fin { 0x80 | opcode } else { opcode });
        match payload.len() {
            n @ 0..=125 => wire.push(n as u8),
            n @ 126..=65535 => {
                wire.push(126);
                wire.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                wire.push(127);
                wire.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        wire.extend_from_slice(payload);
        self.writer.write_all(&wire).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send_close(&mut self, status: u16, reason: &[u8]) {
        let mut payload = status.to_be_bytes().to_vec();
        payload.extend_from_slice(reason);
        self.send_frame(true, 0x8, &payload).await;
    }

    /// Reads one client-to-server frame, asserting it is masked, and returns
    /// the unmasked payload.
    pub async fn read_frame(&mut self) -> ServerFrame {
        let mut head = [0u8; 2];
        self.reader.read_exact(&mut head).await.unwrap();

        let fin = head[0] & 0x80 != 0;
        let opcode = head[0] & 0x0F;
        assert_eq!(head[1] & 0x80, 0x80, "client frames must be masked");

        let len = match head[1] & 0x7F {
            n @ 0..=125 => u64::from(n),
            126 => {
                let mut ext = [0u8; 2];
                self.reader.read_exact(&mut ext).await.unwrap();
                u64::from(u16::from_be_bytes(ext))
            }
            _ => {
                let mut ext = [0u8; 8];
                self.reader.read_exact(&mut ext).await.unwrap();
                u64::from_be_bytes(ext)
            }
        };

        let mut mask_key = [0u8; 4];
        self.reader.read_exact(&mut mask_key).await.unwrap();

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload).await.unwrap();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask_key[i % 4];
        }

        ServerFrame {
            fin,
            opcode,
            mask_key,
            payload,
        }
    }
}
