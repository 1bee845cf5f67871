//! Hand-rolled WebSocket client: framing codec, upgrade handshake, one
//! reader/writer task pair per connection, and a supervisor that keeps a
//! logical session alive across reconnects.

pub mod client;
pub mod conn;
pub mod dial;

pub use crate::core::close::{CloseStatus, MAX_CLOSE_REASON};
pub use crate::core::frame::{Opcode, MAX_CONTROL_PAYLOAD};
pub use crate::core::types::{DataMessage, DialOptions, NonceSource, WsError, WsResult};

pub use client::{Client, Inbox, Registry, UrlProducer};
pub use conn::Conn;
pub use dial::dial;
