//! Base framing codec (RFC 6455 section 5.2).
//!
//! The codec is stateless and side-agnostic: masking direction is carried by
//! the header, and contextual validation (fragmentation state, masking
//! expectations) belongs to the connection that drives it.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Extended payload length continued, if payload len == 127  |
//! +---------------------------------------------------------------+
//! |                               | Masking-key, if MASK set to 1 |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +---------------------------------------------------------------+
//! ```

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{WsError, WsResult};

/// Largest control-frame payload the protocol allows.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible encoded header: 2 fixed bytes, 8 extended-length bytes,
/// 4 masking-key bytes.
pub const MAX_HEADER_LEN: usize = 14;

/// Frame opcode (4 bits). Values 0x3-0x7 and 0xB-0xF are reserved and
/// rejected during decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub const fn is_data(self) -> bool {
        matches!(self, Self::Continuation | Self::Text | Self::Binary)
    }

    fn from_bits(value: u8) -> WsResult<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WsError::BadFrame("reserved opcode")),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Continuation => "continuation",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
        })
    }
}

/// Decoded frame header. The payload itself is read separately by the caller,
/// which knows where it should land.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload_len: u64,
    pub mask_key: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Header for a single-frame message as sent by this client: FIN set,
    /// reserved bits clear, masked.
    pub fn outbound(opcode: Opcode, payload_len: u64, mask_key: [u8; 4]) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: true,
            payload_len,
            mask_key: Some(mask_key),
        }
    }
}

/// Reads and parses a frame header, using `scratch` for the extended length
/// and masking key so the hot path performs no allocations.
///
/// An EOF in the middle of the header is reported as [`WsError::ShortRead`].
pub async fn read_frame_header<R>(r: &mut R, scratch: &mut [u8; 8]) -> WsResult<FrameHeader>
where
    R: AsyncRead + Unpin,
{
    r.read_exact(&mut scratch[..2]).await.map_err(eof_is_short)?;
    let (b0, b1) = (scratch[0], scratch[1]);

    let opcode = Opcode::from_bits(b0 & 0x0F)?;
    let masked = b1 & 0x80 != 0;

    let payload_len = match b1 & 0x7F {
        n @ 0..=125 => u64::from(n),
        126 => {
            r.read_exact(&mut scratch[..2]).await.map_err(eof_is_short)?;
            u64::from(u16::from_be_bytes([scratch[0], scratch[1]]))
        }
        _ => {
            r.read_exact(&mut scratch[..8]).await.map_err(eof_is_short)?;
            let n = u64::from_be_bytes(*scratch);
            if n & (1 << 63) != 0 {
                return Err(WsError::BadFrame(
                    "64-bit payload length has its high bit set",
                ));
            }
            n
        }
    };

    let mask_key = if masked {
        r.read_exact(&mut scratch[..4]).await.map_err(eof_is_short)?;
        Some([scratch[0], scratch[1], scratch[2], scratch[3]])
    } else {
        None
    };

    Ok(FrameHeader {
        fin: b0 & 0x80 != 0,
        rsv1: b0 & 0x40 != 0,
        rsv2: b0 & 0x20 != 0,
        rsv3: b0 & 0x10 != 0,
        opcode,
        masked,
        payload_len,
        mask_key,
    })
}

/// Encodes a header into `buf` and returns the number of bytes written.
pub fn encode_header(h: &FrameHeader, buf: &mut [u8; MAX_HEADER_LEN]) -> usize {
    let mut b0 = h.opcode as u8;
    if h.fin {
        b0 |= 0x80;
    }
    if h.rsv1 {
        b0 |= 0x40;
    }
    if h.rsv2 {
        b0 |= 0x20;
    }
    if h.rsv3 {
        b0 |= 0x10;
    }
    buf[0] = b0;

    let mask_bit = if h.masked { 0x80 } else { 0 };
    let mut n = 2;
    match h.payload_len {
        len @ 0..=125 => buf[1] = mask_bit | len as u8,
        len @ 126..=65535 => {
            buf[1] = mask_bit | 126;
            buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            n = 4;
        }
        len => {
            buf[1] = mask_bit | 127;
            buf[2..10].copy_from_slice(&len.to_be_bytes());
            n = 10;
        }
    }

    if h.masked {
        if let Some(key) = h.mask_key {
            buf[n..n + 4].copy_from_slice(&key);
            n += 4;
        }
    }

    n
}

/// XORs the payload with the masking key in place. Masking is an involution,
/// so the same call both masks and unmasks.
pub fn apply_mask(key: [u8; 4], payload: &mut [u8]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn eof_is_short(err: std::io::Error) -> WsError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        WsError::ShortRead
    } else {
        WsError::Io(err)
    }
}
