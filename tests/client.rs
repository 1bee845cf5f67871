mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;

use common::{accept_ws, spawn_upgrade_server};
use ingressd::ws::{DialOptions, Opcode, Registry, UrlProducer};

const DEADLINE: Duration = Duration::from_secs(5);

fn static_url(addr: std::net::SocketAddr) -> UrlProducer {
    let url = format!("ws://{addr}");
    Arc::new(move || {
        let url = url.clone();
        Box::pin(async move { Ok(url) })
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_acquires_share_one_supervisor_per_identity() {
    let addr = spawn_upgrade_server().await;
    let registry = Registry::new();

    let url1 = static_url(addr);
    let url2 = static_url(addr);
    let (a, b) = tokio::join!(
        registry.acquire_or_reuse(url1, "id1", DialOptions::new()),
        registry.acquire_or_reuse(url2, "id1", DialOptions::new()),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(registry.len(), 1);

    registry
        .acquire_or_reuse(static_url(addr), "id2", DialOptions::new())
        .await
        .unwrap();
    assert_eq!(registry.len(), 2);

    // Reacquiring a known identity returns the cached supervisor.
    registry
        .acquire_or_reuse(static_url(addr), "id1", DialOptions::new())
        .await
        .unwrap();
    assert_eq!(registry.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_forwards_messages_from_the_head_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Registry::new();

    let (client, mut ws) = tokio::join!(
        registry.acquire_or_reuse(static_url(addr), "relay-test", DialOptions::new()),
        accept_ws(&listener),
    );
    let client = client.unwrap();

    ws.send_frame(true, 0x1, b"first").await;

    let inbox = client.incoming_messages();
    let msg = timeout(DEADLINE, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(msg.opcode, Opcode::Text);
    assert_eq!(&msg.data[..], b"first");
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_is_seamless_for_subscribers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Registry::new();

    let dials = Arc::new(AtomicUsize::new(0));
    let url: UrlProducer = {
        let dials = Arc::clone(&dials);
        let url = format!("ws://{addr}");
        Arc::new(move || {
            dials.fetch_add(1, Ordering::SeqCst);
            let url = url.clone();
            Box::pin(async move { Ok(url) })
        })
    };

    let (client, mut ws) = tokio::join!(
        registry.acquire_or_reuse(url, "reconnect-test", DialOptions::new()),
        accept_ws(&listener),
    );
    let client = client.unwrap();
    let inbox = client.incoming_messages();

    ws.send_frame(true, 0x1, b"before").await;
    let msg = timeout(DEADLINE, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(&msg.data[..], b"before");

    // The server ends the first connection; the supervisor must dial a
    // successor via the URL producer without closing the fan-out channel.
    ws.send_close(1001, b"").await;
    let mut replacement = timeout(DEADLINE, accept_ws(&listener)).await.unwrap();

    replacement.send_frame(true, 0x1, b"after").await;
    let msg = timeout(DEADLINE, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(&msg.data[..], b"after");

    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn disposal_closes_the_fan_out_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Registry::new();

    let (client, mut ws) = tokio::join!(
        registry.acquire_or_reuse(static_url(addr), "dispose-test", DialOptions::new()),
        accept_ws(&listener),
    );
    let client = client.unwrap();
    let inbox = client.incoming_messages();

    registry.dispose("dispose-test").await;
    assert_eq!(registry.len(), 0);

    // The supervisor tells the server it is going away on its way out.
    let frame = timeout(DEADLINE, ws.read_frame()).await.unwrap();
    assert_eq!(frame.opcode, 0x8);
    assert_eq!(&frame.payload[..2], &1001u16.to_be_bytes());

    assert!(timeout(DEADLINE, inbox.recv()).await.unwrap().is_none());
}
