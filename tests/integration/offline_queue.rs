// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Outbound queue behavior across a network partition.
//!
//! Sends issued while the session is down are buffered, then replayed in
//! original enqueue order, exactly once each, when the session reconnects.
//!
//! ## Disconnect simulation
//!
//! Aborting the harness task does not close WebSocket connections already
//! handed to their own tasks. Instead a TCP proxy sits between the client
//! and the harness; killing the proxy severs every proxied connection
//! immediately, and re-creating it on the same port lets reconnection
//! attempts succeed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use chatsync::backend::{Backend, HttpBackend};
use chatsync::config::EngineConfig;
use chatsync::engine::{EngineCommand, EngineEvent, spawn_engine};
use chatsync_proto::message::{ChatTarget, MessageStatus, UserId};

// =============================================================================
// TCP proxy helper
// =============================================================================

/// Forwards traffic between a client-facing port and the harness. `kill()`
/// aborts all tracked connection tasks, dropping both ends of every proxied
/// TCP stream.
struct TcpProxy {
    client_addr: String,
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind port {proxy_port}: {e}"));
        let bound = listener.local_addr().unwrap();
        let client_addr = format!("127.0.0.1:{}", bound.port());
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            loop {
                let Ok((mut client_stream, _)) = listener.accept().await else {
                    break;
                };
                let backend = backend.clone();
                let conn = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    let _ =
                        tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                            .await;
                });
                tracked.lock().push(conn);
            }
        });

        Self {
            client_addr,
            accept_handle,
            conn_handles,
        }
    }

    fn kill(self) {
        self.accept_handle.abort();
        for handle in self.conn_handles.lock().iter() {
            handle.abort();
        }
    }
}

async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn wait_for<F>(
    rx: &mut mpsc::Receiver<EngineEvent>,
    description: &str,
    pred: F,
) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return evt,
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("event channel closed while waiting for {description}"),
            Err(_) => break,
        }
    }
    panic!("timeout waiting for {description}");
}

#[tokio::test]
async fn sends_while_disconnected_replay_in_order_exactly_once() {
    let (harness_addr, _handle) = chatsync_harness::server::start_server("127.0.0.1:0")
        .await
        .unwrap();

    // Alice's event channel goes through the proxy; HTTP goes direct.
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &harness_addr.to_string()).await;
    let alice_config = EngineConfig {
        ws_url: Some(format!("ws://{}/ws", proxy.client_addr)),
        http_url: Some(format!("http://{harness_addr}")),
        user_id: Some("alice".to_string()),
        reconnect_attempts: 20,
        reconnect_delay: Duration::from_millis(100),
        ..Default::default()
    };
    let (alice_cmd, mut alice_evt) = spawn_engine(
        alice_config,
        HttpBackend::new(format!("http://{harness_addr}")),
    )
    .await
    .unwrap();
    wait_for(&mut alice_evt, "alice connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;

    alice_cmd
        .send(EngineCommand::SelectConversation(ChatTarget::Direct(
            UserId::new("bob"),
        )))
        .await
        .unwrap();
    wait_for(&mut alice_evt, "alice window", |e| {
        matches!(e, EngineEvent::ConversationLoaded { .. })
    })
    .await;

    // Partition.
    proxy.kill();
    wait_for(&mut alice_evt, "reconnecting", |e| {
        matches!(e, EngineEvent::Reconnecting { .. })
    })
    .await;

    // Three sends while down: optimistic entries stay pending, the events
    // are queued.
    for i in 1..=3 {
        alice_cmd
            .send(EngineCommand::SendText {
                text: format!("queued {i}"),
            })
            .await
            .unwrap();
        let upserted = wait_for(&mut alice_evt, "pending upsert", |e| {
            matches!(e, EngineEvent::MessageUpserted { .. })
        })
        .await;
        let EngineEvent::MessageUpserted { message, .. } = upserted else {
            unreachable!()
        };
        assert_eq!(message.status, MessageStatus::Pending);
    }

    // Heal the partition; the supervisor reconnects and the queue flushes.
    let _proxy2 = TcpProxy::new(proxy_port, &harness_addr.to_string()).await;
    wait_for(&mut alice_evt, "reconnected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;

    // Bob connects afterwards and reads the history: all three messages,
    // exactly once, in the original order.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let backend = HttpBackend::new(format!("http://{harness_addr}"));
    let expected = vec![
        "queued 1".to_string(),
        "queued 2".to_string(),
        "queued 3".to_string(),
    ];
    loop {
        let page = backend
            .fetch_history(
                &UserId::new("bob"),
                &ChatTarget::Direct(UserId::new("alice")),
                1,
                50,
            )
            .await
            .unwrap();
        // Newest first from the backend; reverse to the send order.
        let contents: Vec<String> = page.iter().rev().map(|m| m.content.clone()).collect();
        if contents == expected {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queued messages not delivered in order: {contents:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The flush also upgrades the optimistic entries.
    wait_for(&mut alice_evt, "queued send marked sent", |e| {
        matches!(
            e,
            EngineEvent::StatusChanged {
                status: chatsync_proto::message::DisplayStatus::Direct(MessageStatus::Sent),
                ..
            }
        )
    })
    .await;
}
