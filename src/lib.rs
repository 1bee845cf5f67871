//! Event-ingress daemon: listens for asynchronous notifications from
//! third-party services over HTTP webhooks and WebSocket connections.
//!
//! The heart of the crate is [`ws`], a hand-rolled WebSocket client (RFC
//! 6455, version 13, no extensions) with a supervisor that keeps logical
//! sessions alive across reconnects. The rest is the daemon around it:
//! webhook receivers, a link-handler registry, a secrets-service client,
//! and CLI/config plumbing.

pub mod config;
pub mod http;
pub mod links;
pub mod logging;
pub mod secrets;
pub mod tls;
pub mod ws;

mod core;
