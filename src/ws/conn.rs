//! One live WebSocket session: a reader task that decodes frames, handles
//! control frames in-line, and assembles data messages; a writer task that
//! serializes every outbound frame; and the close-handshake bookkeeping
//! shared between them.
//!
//! All transport I/O goes through the two tasks. Callers submit outbound
//! frames on a bounded channel and the writer processes them strictly in
//! submission order, so partial or interleaved frames cannot appear on the
//! wire no matter how many tasks send concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, trace, warn};

use crate::core::close::{parse_close, CloseStatus, MAX_CLOSE_REASON};
use crate::core::frame::{
    apply_mask, encode_header, read_frame_header, FrameHeader, Opcode, MAX_CONTROL_PAYLOAD,
    MAX_HEADER_LEN,
};
use crate::core::types::{DataMessage, WsError, WsResult};
use crate::ws::dial::MaybeTlsStream;

/// Inbound-message channel capacity; backpressures the reader task when
/// subscribers fall behind. Tuning knob, not part of the contract.
const INBOUND_CAPACITY: usize = 64;

/// Outbound-request channel capacity. Tuning knob, not part of the contract.
const OUTBOUND_CAPACITY: usize = 64;

type ConnReader = BufReader<ReadHalf<MaybeTlsStream>>;
type ConnWriter = BufWriter<WriteHalf<MaybeTlsStream>>;

/// A request submitted to the writer task. The reply channel can be used at
/// most once and is dropped right after.
struct WriteRequest {
    opcode: Opcode,
    payload: Vec<u8>,
    reply: oneshot::Sender<WsResult<()>>,
}

/// State shared between the connection handle, its reader task, and any
/// caller holding a send path.
#[derive(Debug)]
struct Shared {
    out_tx: mpsc::Sender<WriteRequest>,

    // Both flags change in one direction only (false to true).
    // `close_received` is written by the reader task alone; `close_sent` is
    // written only under `close_guard`, which serializes the test-and-set so
    // at most one close frame ever leaves this endpoint.
    close_received: AtomicBool,
    close_sent: AtomicBool,
    close_guard: Mutex<()>,
}

/// An open client connection to a WebSocket server.
///
/// Created by [`dial`](crate::ws::dial); destroyed by dropping the handle
/// after the close handshake completes (the writer drains pending sends and
/// exits once every sender is gone).
#[derive(Debug)]
pub struct Conn {
    shared: Arc<Shared>,
    in_rx: mpsc::Receiver<DataMessage>,
}

impl Conn {
    /// Adopts the buffered halves of an upgraded stream and starts the
    /// reader and writer tasks. Exactly one of each exists for the lifetime
    /// of the connection.
    pub(crate) fn spawn(reader: ConnReader, writer: WriteHalf<MaybeTlsStream>) -> Conn {
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let shared = Arc::new(Shared {
            out_tx,
            close_received: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            close_guard: Mutex::new(()),
        });

        tokio::spawn(write_loop(BufWriter::new(writer), out_rx));
        tokio::spawn(read_loop(reader, in_tx, Arc::clone(&shared)));

        Conn { shared, in_rx }
    }

    /// The channel publishing data messages as they arrive from the server.
    /// The channel closing means the connection has terminated and no
    /// further messages will arrive.
    pub fn incoming_messages(&mut self) -> &mut mpsc::Receiver<DataMessage> {
        &mut self.in_rx
    }

    /// Sends a UTF-8 text message to the server.
    ///
    /// Submission is asynchronous so any number of callers can send
    /// concurrently; the returned single-shot channel reports the write
    /// outcome for callers that want to block on it or race it against
    /// their own cancellation.
    pub async fn send_text_message(&self, data: Vec<u8>) -> oneshot::Receiver<WsResult<()>> {
        self.send_data(Opcode::Text, data).await
    }

    /// Sends a binary message to the server. Same submission contract as
    /// [`Conn::send_text_message`].
    pub async fn send_binary_message(&self, data: Vec<u8>) -> oneshot::Receiver<WsResult<()>> {
        self.send_data(Opcode::Binary, data).await
    }

    async fn send_data(&self, opcode: Opcode, data: Vec<u8>) -> oneshot::Receiver<WsResult<()>> {
        if self.shared.close_sent.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(WsError::SendOnClosed));
            return rx;
        }
        submit(&self.shared, opcode, data).await
    }

    /// Starts the close handshake with the given status. Idempotent: after
    /// the first call (or a close initiated by the server) this is a no-op.
    pub async fn close(&self, status: CloseStatus) {
        send_close(&self.shared, status, "").await;
    }

    /// True once a close frame has been both sent and received.
    pub fn is_closed(&self) -> bool {
        self.shared.close_received.load(Ordering::SeqCst)
            && self.shared.close_sent.load(Ordering::SeqCst)
    }

    /// True while the close handshake is underway in either direction.
    pub fn is_closing(&self) -> bool {
        (self.shared.close_received.load(Ordering::SeqCst)
            || self.shared.close_sent.load(Ordering::SeqCst))
            && !self.is_closed()
    }
}

/// Submits one frame to the writer task, blocking while the writer is busy.
/// If the writer is already gone the reply resolves immediately with an
/// error.
async fn submit(shared: &Shared, opcode: Opcode, payload: Vec<u8>) -> oneshot::Receiver<WsResult<()>> {
    let (tx, rx) = oneshot::channel();
    let req = WriteRequest {
        opcode,
        payload,
        reply: tx,
    };
    if let Err(mpsc::error::SendError(req)) = shared.out_tx.send(req).await {
        let _ = req.reply.send(Err(WsError::SendOnClosed));
    }
    rx
}

/// Sends a close control frame exactly once per connection.
///
/// The guard serializes the test-and-set of `close_sent` across the reader
/// task (mirroring a received close), `Conn::close` callers, and the
/// supervisor's disposal path.
async fn send_close(shared: &Shared, status: CloseStatus, reason: &str) {
    let _guard = shared.close_guard.lock().await;
    if shared.close_sent.load(Ordering::SeqCst) {
        return;
    }

    let mut reason = reason;
    if reason.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason = &reason[..cut];
    }

    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&status.as_u16().to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());

    match submit(shared, Opcode::Close, payload).await.await {
        Ok(Ok(())) => {
            trace!(close_status = %status, close_reason = reason, "sent close control frame");
        }
        Ok(Err(err)) => {
            warn!(error = %err, close_status = %status, "failed to send close control frame");
        }
        Err(_) => {
            warn!(close_status = %status, "writer task gone before close frame was written");
        }
    }

    shared.close_sent.store(true, Ordering::SeqCst);
}

/// Validates a frame header in the context of the current read state.
/// Returns the reason text used in the resulting close frame.
fn check_frame_header(h: &FrameHeader, msg_in_progress: bool) -> Result<(), &'static str> {
    if h.rsv1 || h.rsv2 || h.rsv3 {
        return Err("reserved bits are set");
    }
    // The server never masks; masked frames only flow client to server.
    if h.masked {
        return Err("masked frame from server");
    }
    if h.opcode.is_control() {
        if h.payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err("oversized control frame payload");
        }
        if !h.fin {
            return Err("fragmented control frame");
        }
    }
    if h.opcode == Opcode::Continuation && !msg_in_progress {
        return Err("continuation frame without a preceding data frame");
    }
    if matches!(h.opcode, Opcode::Text | Opcode::Binary) && msg_in_progress {
        return Err("new data message before the previous one finished");
    }
    Ok(())
}

/// The reader task: decodes frames until the connection closes, responding
/// to control frames (whether or not they're interleaved with a fragmented
/// message) and publishing assembled data messages on the inbound channel.
///
/// Terminating this loop drops `in_tx`, which closes the inbound channel —
/// the only way subscribers learn the connection is done.
async fn read_loop(mut reader: ConnReader, in_tx: mpsc::Sender<DataMessage>, shared: Arc<Shared>) {
    let mut scratch = [0u8; 8];
    let mut msg = BytesMut::new();
    let mut msg_opcode: Option<Opcode> = None;

    loop {
        let h = match read_frame_header(&mut reader, &mut scratch).await {
            Ok(h) => h,
            Err(err) => {
                error!(error = %err, "failed to read frame header");
                send_close(&shared, CloseStatus::INTERNAL_ERROR, "frame header reading error")
                    .await;
                return;
            }
        };
        trace!(opcode = %h.opcode, length = h.payload_len, "received frame");

        let mut data = vec![0u8; h.payload_len as usize];
        if h.payload_len > 0 {
            if let Err(err) = reader.read_exact(&mut data).await {
                error!(error = %err, "failed to read frame payload");
                send_close(&shared, CloseStatus::INTERNAL_ERROR, "frame payload reading error")
                    .await;
                return;
            }
        }

        if let Err(reason) = check_frame_header(&h, msg_opcode.is_some()) {
            error!(error = %WsError::BadFrame(reason), "protocol error due to invalid frame");
            send_close(&shared, CloseStatus::PROTOCOL_ERROR, reason).await;
            return;
        }

        match h.opcode {
            Opcode::Continuation | Opcode::Text | Opcode::Binary => {
                if h.opcode != Opcode::Continuation {
                    msg_opcode = Some(h.opcode);
                }
                msg.extend_from_slice(&data);

                if h.fin {
                    if let Some(opcode) = msg_opcode.take() {
                        let data = msg.split().freeze();
                        debug!(opcode = %opcode, length = data.len(), "received data message");
                        if in_tx.send(DataMessage { opcode, data }).await.is_err() {
                            // Every subscriber is gone; nothing left to do.
                            return;
                        }
                    }
                }
            }

            Opcode::Close => {
                let (status, reason) = parse_close(&data);
                trace!(close_status = %status, close_reason = %reason,
                    "received close control frame");
                shared.close_received.store(true, Ordering::SeqCst);
                send_close(&shared, status, &reason).await;
                // Not an error, but no further frames are expected.
                return;
            }

            Opcode::Ping => match submit(&shared, Opcode::Pong, data).await.await {
                Ok(Ok(())) => trace!("sent pong control frame"),
                Ok(Err(err)) => error!(error = %err, "failed to send pong control frame"),
                Err(_) => error!("writer task gone before pong was written"),
            },

            // This client never sends unsolicited pings, so pongs carry no
            // information.
            Opcode::Pong => {}
        }
    }
}

/// The writer task: the single owner of the transport's write half. Encodes
/// each request with a fresh masking key, flushes it, and reports the
/// outcome on the request's reply channel. Requests are processed strictly
/// in submission order.
async fn write_loop(mut writer: ConnWriter, mut out_rx: mpsc::Receiver<WriteRequest>) {
    let mut rng = SmallRng::from_entropy();
    let mut header_buf = [0u8; MAX_HEADER_LEN];

    while let Some(req) = out_rx.recv().await {
        let result = write_frame(&mut writer, &mut rng, &mut header_buf, req.opcode, req.payload)
            .await;
        if let Err(err) = &result {
            debug!(error = %err, opcode = %req.opcode, "frame write failed");
        }
        let _ = req.reply.send(result);
    }
}

async fn write_frame(
    writer: &mut ConnWriter,
    rng: &mut SmallRng,
    header_buf: &mut [u8; MAX_HEADER_LEN],
    opcode: Opcode,
    mut payload: Vec<u8>,
) -> WsResult<()> {
    let key: [u8; 4] = rng.gen();
    let header = FrameHeader::outbound(opcode, payload.len() as u64, key);
    let n = encode_header(&header, header_buf);
    apply_mask(key, &mut payload);

    writer.write_all(&header_buf[..n]).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_checks_reject_each_violation() {
        let base = FrameHeader {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: Opcode::Text,
            masked: false,
            payload_len: 0,
            mask_key: None,
        };

        assert!(check_frame_header(&base, false).is_ok());

        let mut h = base;
        h.rsv1 = true;
        assert!(check_frame_header(&h, false).is_err());

        let mut h = base;
        h.masked = true;
        h.mask_key = Some([0; 4]);
        assert!(check_frame_header(&h, false).is_err());

        let mut h = base;
        h.opcode = Opcode::Ping;
        h.payload_len = 126;
        assert!(check_frame_header(&h, false).is_err());

        let mut h = base;
        h.opcode = Opcode::Close;
        h.fin = false;
        assert!(check_frame_header(&h, false).is_err());

        let mut h = base;
        h.opcode = Opcode::Continuation;
        assert!(check_frame_header(&h, false).is_err());
        assert!(check_frame_header(&h, true).is_ok());

        // A second data message cannot start before the first finished.
        assert!(check_frame_header(&base, true).is_err());

        let mut h = base;
        h.opcode = Opcode::Ping;
        assert!(check_frame_header(&h, true).is_ok());
    }
}
