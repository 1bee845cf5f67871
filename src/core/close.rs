//! Close-handshake status codes (RFC 6455 section 7.4) and close payload
//! parsing.

use std::fmt;

use super::frame::MAX_CONTROL_PAYLOAD;

/// Longest close reason that fits in a control frame next to the 2-byte
/// status code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// Close status code. The IANA-assigned 1000-1015 range renders by name;
/// everything else renders as its decimal value.
///
/// Ranges outside 1000-2999 are available to applications: 3000-3999 for
/// libraries and frameworks, 4000-4999 for private use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseStatus(pub u16);

impl CloseStatus {
    /// The purpose for which the connection was established has been
    /// fulfilled.
    pub const NORMAL_CLOSURE: CloseStatus = CloseStatus(1000);
    /// The endpoint is going away, e.g. a server going down.
    pub const GOING_AWAY: CloseStatus = CloseStatus(1001);
    /// The peer violated the framing protocol.
    pub const PROTOCOL_ERROR: CloseStatus = CloseStatus(1002);
    /// The endpoint received a type of data it cannot accept.
    pub const UNSUPPORTED_DATA: CloseStatus = CloseStatus(1003);
    /// Reserved pseudo-code: no status code was present in the close frame.
    /// MUST NOT be sent on the wire.
    pub const NOT_RECEIVED: CloseStatus = CloseStatus(1005);
    /// Reserved pseudo-code: the connection closed without a close frame.
    /// MUST NOT be sent on the wire.
    pub const CLOSED_ABNORMALLY: CloseStatus = CloseStatus(1006);
    /// Message data was inconsistent with its type (e.g. non-UTF-8 text).
    pub const INVALID_DATA: CloseStatus = CloseStatus(1007);
    /// Generic policy violation.
    pub const POLICY_VIOLATION: CloseStatus = CloseStatus(1008);
    /// Message too big to process.
    pub const MESSAGE_TOO_BIG: CloseStatus = CloseStatus(1009);
    /// The client expected the server to negotiate an extension.
    pub const MANDATORY_EXTENSION: CloseStatus = CloseStatus(1010);
    /// The endpoint hit an unexpected condition.
    pub const INTERNAL_ERROR: CloseStatus = CloseStatus(1011);
    pub const SERVICE_RESTART: CloseStatus = CloseStatus(1012);
    pub const TRY_AGAIN_LATER: CloseStatus = CloseStatus(1013);
    pub const BAD_GATEWAY: CloseStatus = CloseStatus(1014);
    /// Reserved pseudo-code: TLS handshake failure. MUST NOT be sent on the
    /// wire.
    pub const TLS_HANDSHAKE: CloseStatus = CloseStatus(1015);

    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NORMAL_CLOSURE => "normal closure",
            Self::GOING_AWAY => "going away",
            Self::PROTOCOL_ERROR => "protocol error",
            Self::UNSUPPORTED_DATA => "unsupported data",
            Self::NOT_RECEIVED => "status not received",
            Self::CLOSED_ABNORMALLY => "closed abnormally",
            Self::INVALID_DATA => "invalid data",
            Self::POLICY_VIOLATION => "policy violation",
            Self::MESSAGE_TOO_BIG => "message too big",
            Self::MANDATORY_EXTENSION => "expected extension negotiation",
            Self::INTERNAL_ERROR => "internal error",
            Self::SERVICE_RESTART => "service restart",
            Self::TRY_AGAIN_LATER => "try again later",
            Self::BAD_GATEWAY => "bad gateway",
            Self::TLS_HANDSHAKE => "TLS handshake",
            CloseStatus(other) => return write!(f, "{other}"),
        };
        f.write_str(name)
    }
}

/// Interprets an incoming close payload: an empty or 1-byte payload carries
/// no status, 2 bytes carry a status only, anything longer carries a status
/// followed by a UTF-8 reason (not validated here).
pub fn parse_close(payload: &[u8]) -> (CloseStatus, String) {
    match payload.len() {
        0 | 1 => (CloseStatus::NOT_RECEIVED, String::new()),
        2 => (
            CloseStatus(u16::from_be_bytes([payload[0], payload[1]])),
            String::new(),
        ),
        _ => (
            CloseStatus(u16::from_be_bytes([payload[0], payload[1]])),
            String::from_utf8_lossy(&payload[2..]).into_owned(),
        ),
    }
}
