// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! End-to-end direct message flow between two engines and a live harness.
//!
//! Verifies the full status lifecycle: the sender's local copy appears as
//! `pending`, advances to `sent` once the transport accepts the emit, the
//! recipient's engine acknowledges the displayed message automatically, and
//! the resulting read receipt advances the sender's copy to `read`.

use std::time::Duration;

use tokio::sync::mpsc;

use chatsync::backend::HttpBackend;
use chatsync::config::EngineConfig;
use chatsync::engine::{EngineCommand, EngineEvent, spawn_engine};
use chatsync_proto::message::{ChatTarget, DisplayStatus, MessageStatus, UserId};

async fn start_harness() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    chatsync_harness::server::start_server("127.0.0.1:0")
        .await
        .expect("failed to start harness")
}

async fn spawn_client(
    addr: std::net::SocketAddr,
    user: &str,
) -> (mpsc::Sender<EngineCommand>, mpsc::Receiver<EngineEvent>) {
    let config = EngineConfig {
        ws_url: Some(format!("ws://{addr}/ws")),
        http_url: Some(format!("http://{addr}")),
        user_id: Some(user.to_string()),
        reconnect_delay: Duration::from_millis(100),
        ..Default::default()
    };
    let backend = HttpBackend::new(format!("http://{addr}"));
    spawn_engine(config, backend).await.expect("spawn failed")
}

/// Wait for an event matching a predicate, skipping others.
async fn wait_for<F>(
    rx: &mut mpsc::Receiver<EngineEvent>,
    description: &str,
    pred: F,
) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
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
async fn direct_message_walks_pending_sent_read() {
    let (addr, _handle) = start_harness().await;

    let (alice_cmd, mut alice_evt) = spawn_client(addr, "alice").await;
    let (bob_cmd, mut bob_evt) = spawn_client(addr, "bob").await;

    wait_for(&mut alice_evt, "alice connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;
    wait_for(&mut bob_evt, "bob connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;

    // Both sides open the conversation; bob having it active is what makes
    // the read acknowledgment automatic.
    alice_cmd
        .send(EngineCommand::SelectConversation(ChatTarget::Direct(
            UserId::new("bob"),
        )))
        .await
        .unwrap();
    bob_cmd
        .send(EngineCommand::SelectConversation(ChatTarget::Direct(
            UserId::new("alice"),
        )))
        .await
        .unwrap();
    wait_for(&mut alice_evt, "alice window", |e| {
        matches!(e, EngineEvent::ConversationLoaded { .. })
    })
    .await;
    wait_for(&mut bob_evt, "bob window", |e| {
        matches!(e, EngineEvent::ConversationLoaded { .. })
    })
    .await;

    alice_cmd
        .send(EngineCommand::SendText { text: "hi".into() })
        .await
        .unwrap();

    // Optimistic entry first, in pending.
    let upserted = wait_for(&mut alice_evt, "alice optimistic upsert", |e| {
        matches!(e, EngineEvent::MessageUpserted { .. })
    })
    .await;
    let EngineEvent::MessageUpserted { message, .. } = upserted else {
        unreachable!()
    };
    assert_eq!(message.content, "hi");
    assert_eq!(message.status, MessageStatus::Pending);

    // Transport accepted the emit: sent. This is a transmission guarantee
    // only.
    let status = wait_for(&mut alice_evt, "alice sent status", |e| {
        matches!(e, EngineEvent::StatusChanged { .. })
    })
    .await;
    let EngineEvent::StatusChanged { status, .. } = status else {
        unreachable!()
    };
    assert_eq!(status, DisplayStatus::Direct(MessageStatus::Sent));

    // Bob sees the message; his engine acks it automatically.
    let received = wait_for(&mut bob_evt, "bob receives message", |e| {
        matches!(e, EngineEvent::MessageUpserted { message, .. } if message.sender == UserId::new("alice"))
    })
    .await;
    let EngineEvent::MessageUpserted { message, .. } = received else {
        unreachable!()
    };
    assert_eq!(message.content, "hi");

    // The receipt lands back at alice: read.
    let read = wait_for(&mut alice_evt, "alice read status", |e| {
        matches!(
            e,
            EngineEvent::StatusChanged {
                status: DisplayStatus::Direct(MessageStatus::Read),
                ..
            }
        )
    })
    .await;
    let EngineEvent::StatusChanged { message_id, .. } = read else {
        unreachable!()
    };
    // The receipt refers to the reconciled server id, not the provisional
    // one.
    assert_eq!(message_id, message.id);
}

#[tokio::test]
async fn duplicate_server_echo_does_not_duplicate_the_entry() {
    let (addr, _handle) = start_harness().await;

    let (alice_cmd, mut alice_evt) = spawn_client(addr, "alice").await;
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

    alice_cmd
        .send(EngineCommand::SendText {
            text: "only once".into(),
        })
        .await
        .unwrap();

    // The server echo reconciles the optimistic entry; the window must hold
    // exactly one copy afterwards. Re-selecting emits the current window.
    let echoed = wait_for(&mut alice_evt, "server echo", |e| {
        matches!(e, EngineEvent::MessageUpserted { message, .. } if message.tag.is_some() && message.status == MessageStatus::Sent)
    })
    .await;
    let EngineEvent::MessageUpserted { .. } = echoed else {
        unreachable!()
    };

    alice_cmd
        .send(EngineCommand::SelectConversation(ChatTarget::Direct(
            UserId::new("bob"),
        )))
        .await
        .unwrap();
    let window = wait_for(&mut alice_evt, "window after echo", |e| {
        matches!(e, EngineEvent::ConversationLoaded { .. })
    })
    .await;
    let EngineEvent::ConversationLoaded { messages, .. } = window else {
        unreachable!()
    };
    assert_eq!(messages.len(), 1, "echo must merge, not duplicate");
}

#[tokio::test]
async fn empty_send_is_blocked_with_a_notification() {
    let (addr, _handle) = start_harness().await;

    let (alice_cmd, mut alice_evt) = spawn_client(addr, "alice").await;
    wait_for(&mut alice_evt, "alice connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;

    // No conversation selected: blocked synchronously.
    alice_cmd
        .send(EngineCommand::SendText { text: "hi".into() })
        .await
        .unwrap();
    wait_for(&mut alice_evt, "no-selection notification", |e| {
        matches!(e, EngineEvent::NotificationPosted { .. })
    })
    .await;

    // Empty content with a conversation selected: also blocked.
    alice_cmd
        .send(EngineCommand::SelectConversation(ChatTarget::Direct(
            UserId::new("bob"),
        )))
        .await
        .unwrap();
    wait_for(&mut alice_evt, "window", |e| {
        matches!(e, EngineEvent::ConversationLoaded { .. })
    })
    .await;
    alice_cmd
        .send(EngineCommand::SendText {
            text: String::new(),
        })
        .await
        .unwrap();
    wait_for(&mut alice_evt, "empty-send notification", |e| {
        matches!(e, EngineEvent::NotificationPosted { .. })
    })
    .await;
}
