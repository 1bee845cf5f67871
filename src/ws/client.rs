//! Long-lived client supervisor: one logical inbound stream per identity,
//! kept alive across any number of physical connections.
//!
//! A [`Client`] usually wraps a single [`Conn`]. When that connection closes
//! (or is about to), the relay task dials a successor and switches over, so
//! subscribers never observe a channel-close event — at most a pause while
//! the replacement comes up.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info};

use crate::core::close::CloseStatus;
use crate::core::reconnect::Backoff;
use crate::core::types::{DataMessage, DialOptions, WsError, WsResult};
use crate::ws::conn::Conn;
use crate::ws::dial::dial;

/// Produces the next WebSocket URL for a logical session. Called before
/// every dial because some servers (e.g. Slack Socket Mode) hand out
/// short-lived URLs through a separate API call.
pub type UrlProducer =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = WsResult<String>> + Send>> + Send + Sync>;

/// Fan-out channel capacity. Tuning knob, not part of the contract.
const OUTPUT_CAPACITY: usize = 64;

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// Owner of the identity-to-supervisor mapping.
///
/// Most call sites use the lazily-initialized process-wide instance via
/// [`Registry::global`]; tests and alternative entry points construct their
/// own.
#[derive(Default)]
pub struct Registry {
    clients: DashMap<String, Client>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Returns the cached supervisor for `id`, or constructs one (dialing a
    /// first connection eagerly) and registers it.
    ///
    /// When two callers race on the same identity, one construction wins the
    /// insert; the loser's connection is told we're going away and the
    /// winner is returned to both.
    pub async fn acquire_or_reuse(
        &self,
        url: UrlProducer,
        id: &str,
        opts: DialOptions,
    ) -> WsResult<Client> {
        let hashed = hash_id(id);
        if let Some(client) = self.clients.get(&hashed) {
            return Ok(client.clone());
        }

        let candidate = Client::connect(url, opts).await?;

        let winner = match self.clients.entry(hashed) {
            Entry::Occupied(existing) => Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(candidate.clone());
                None
            }
        };

        match winner {
            Some(winner) => {
                candidate.dispose(CloseStatus::GOING_AWAY).await;
                Ok(winner)
            }
            None => {
                candidate.spawn_relay();
                Ok(candidate)
            }
        }
    }

    /// Retires the supervisor for `id`, closing its connections. The
    /// supervisor's output channel closes as part of disposal.
    pub async fn dispose(&self, id: &str) {
        if let Some((_, client)) = self.clients.remove(&hash_id(id)) {
            client.dispose(CloseStatus::GOING_AWAY).await;
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Stable but irreversible digest of a caller-supplied identity, used as the
/// registry key so raw identities (which may embed credentials) are never
/// held in the map.
fn hash_id(id: &str) -> String {
    hex::encode(Sha256::digest(id.as_bytes()))
}

/// Shared handle to one logical session. Cloning is cheap; every clone
/// observes the same connection sequence and fan-out channel.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    inbox: Inbox,
    // Consumed by `spawn_relay` (winner) or `dispose` (race loser).
    relay_seed: Mutex<Option<RelayState>>,
    shutdown_tx: watch::Sender<bool>,
}

struct RelayState {
    url: UrlProducer,
    opts: DialOptions,
    conns: VecDeque<Conn>,
    out_tx: mpsc::Sender<DataMessage>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Client {
    async fn connect(url: UrlProducer, opts: DialOptions) -> WsResult<Client> {
        let first_url = (url)().await?;
        let conn = dial(&first_url, opts.clone()).await?;

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Client {
            shared: Arc::new(ClientShared {
                inbox: Inbox::new(out_rx),
                relay_seed: Mutex::new(Some(RelayState {
                    url,
                    opts,
                    conns: VecDeque::from([conn]),
                    out_tx,
                    shutdown_rx,
                })),
                shutdown_tx,
            }),
        })
    }

    /// The fan-out channel of data messages from whichever physical
    /// connection is current. It stays open across reconnects and closes
    /// only when the supervisor is disposed.
    pub fn incoming_messages(&self) -> Inbox {
        self.shared.inbox.clone()
    }

    fn spawn_relay(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Some(state) = shared.relay_seed.lock().await.take() {
                relay_loop(state).await;
            }
        });
    }

    async fn dispose(&self, status: CloseStatus) {
        // A client that never activated its relay still owns its lone
        // connection directly.
        if let Some(state) = self.shared.relay_seed.lock().await.take() {
            if let Some(conn) = state.conns.front() {
                conn.close(status).await;
            }
            return;
        }
        let _ = self.shared.shutdown_tx.send(true);
    }
}

/// Competing-consumer view of a supervisor's fan-out channel.
#[derive(Clone)]
pub struct Inbox {
    rx: Arc<Mutex<mpsc::Receiver<DataMessage>>>,
}

impl Inbox {
    fn new(rx: mpsc::Receiver<DataMessage>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Receives the next data message. `None` means the supervisor has been
    /// disposed; during reconnects this pauses rather than ending.
    pub async fn recv(&self) -> Option<DataMessage> {
        self.rx.lock().await.recv().await
    }
}

/// Routes data messages from the current head connection to the fan-out
/// channel, pruning and replacing connections as they close.
async fn relay_loop(mut state: RelayState) {
    let mut backoff = Backoff::default();
    let mut shutdown = state.shutdown_rx.clone();

    loop {
        if *shutdown.borrow() {
            break;
        }

        if state.conns.front().is_none() {
            if !replace_conn(&mut state, &mut backoff, &mut shutdown).await {
                break;
            }
            continue;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            msg = recv_from_head(&mut state.conns) => match msg {
                Some(msg) => {
                    if state.out_tx.send(msg).await.is_err() {
                        // Every subscriber handle is gone.
                        break;
                    }
                }
                None => prune_conns(&mut state.conns),
            }
        }
    }

    for conn in state.conns.iter() {
        conn.close(CloseStatus::GOING_AWAY).await;
    }
}

async fn recv_from_head(conns: &mut VecDeque<Conn>) -> Option<DataMessage> {
    match conns.front_mut() {
        Some(conn) => conn.incoming_messages().recv().await,
        None => None, // guarded by the caller
    }
}

/// Drops closed and closing connections from the front of the sequence. A
/// replacement appended behind them keeps serving once they're gone.
fn prune_conns(conns: &mut VecDeque<Conn>) {
    while conns
        .front()
        .is_some_and(|conn| conn.is_closed() || conn.is_closing())
    {
        conns.pop_front();
    }
}

/// Dials a replacement connection via the URL producer and appends it.
///
/// Failures (from the producer or the dial) are logged loudly and retried
/// with jittered exponential backoff; they are never surfaced to
/// subscribers. Returns `false` when shutdown interrupts the wait.
async fn replace_conn(
    state: &mut RelayState,
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let dialed = match (state.url)().await {
        Ok(url) => dial(&url, state.opts.clone()).await,
        Err(err) => Err(err),
    };

    match dialed {
        Ok(conn) => {
            info!("established replacement connection");
            backoff.reset();
            state.conns.push_back(conn);
            true
        }
        Err(err) => {
            // Scale the wait by 0.5-1.0 so a fleet of supervisors that lost
            // the same server doesn't redial in lockstep.
            let scale: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            let delay = backoff.next_delay().mul_f64(scale);
            error!(
                error = %WsError::DialRetry(err.to_string()),
                delay_ms = delay.as_millis() as u64,
                "replacement dial failed; backing off",
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = shutdown.changed() => false,
            }
        }
    }
}
