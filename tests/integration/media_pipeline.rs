// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Media sends: upload-then-emit sequencing, atomic abort on upload
//! failure, and voice clips with bounded duration resolution.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatsync::backend::HttpBackend;
use chatsync::config::EngineConfig;
use chatsync::engine::{EngineCommand, EngineEvent, spawn_engine};
use chatsync::media::FileAttachment;
use chatsync_harness::state::HarnessState;
use chatsync_proto::message::{ChatTarget, ContentKind, UserId};

async fn start_harness_with_cap(
    max_upload_size: u64,
) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let state = Arc::new(HarnessState::with_max_upload_size(max_upload_size));
    chatsync_harness::server::start_server_with_state("127.0.0.1:0", state)
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

async fn select_direct(
    cmd: &mpsc::Sender<EngineCommand>,
    evt: &mut mpsc::Receiver<EngineEvent>,
    other: &str,
) {
    cmd.send(EngineCommand::SelectConversation(ChatTarget::Direct(
        UserId::new(other),
    )))
    .await
    .unwrap();
    wait_for(evt, "window", |e| {
        matches!(e, EngineEvent::ConversationLoaded { .. })
    })
    .await;
}

/// Minimal PCM WAV: 16 kB/s byte rate, `data_len` bytes of audio.
fn wav_clip(data_len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; 44 + data_len];
    bytes[0..4].copy_from_slice(b"RIFF");
    bytes[8..12].copy_from_slice(b"WAVE");
    bytes[28..32].copy_from_slice(&16_000u32.to_le_bytes());
    bytes
}

#[tokio::test]
async fn upload_failure_aborts_the_send_atomically() {
    let (addr, _handle) = start_harness_with_cap(1024).await;
    let (alice_cmd, mut alice_evt) = spawn_client(addr, "alice").await;
    wait_for(&mut alice_evt, "connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;
    select_direct(&alice_cmd, &mut alice_evt, "bob").await;

    // Over the harness size cap: the single upload attempt fails.
    alice_cmd
        .send(EngineCommand::SendMedia {
            text: "look at this".into(),
            attachment: FileAttachment::new("huge.png", vec![0u8; 4096]),
        })
        .await
        .unwrap();

    wait_for(&mut alice_evt, "failure notification", |e| {
        matches!(e, EngineEvent::NotificationPosted { .. })
    })
    .await;

    // No message was appended anywhere -- not even a text-only fallback.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = alice_evt.try_recv() {
        assert!(
            !matches!(event, EngineEvent::MessageUpserted { .. }),
            "a failed media send must not emit a message"
        );
    }
}

#[tokio::test]
async fn successful_upload_emits_the_message_with_its_media_ref() {
    let (addr, _handle) = start_harness_with_cap(1024 * 1024).await;
    let (alice_cmd, mut alice_evt) = spawn_client(addr, "alice").await;
    let (_bob_cmd, mut bob_evt) = spawn_client(addr, "bob").await;
    wait_for(&mut alice_evt, "alice connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;
    wait_for(&mut bob_evt, "bob connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;
    select_direct(&alice_cmd, &mut alice_evt, "bob").await;

    alice_cmd
        .send(EngineCommand::SendMedia {
            text: "holiday photo".into(),
            attachment: FileAttachment::new("photo.png", vec![7u8; 2048]),
        })
        .await
        .unwrap();

    let received = wait_for(&mut bob_evt, "bob receives media message", |e| {
        matches!(e, EngineEvent::MessageUpserted { message, .. } if message.media.is_some())
    })
    .await;
    let EngineEvent::MessageUpserted { message, .. } = received else {
        unreachable!()
    };
    assert_eq!(message.kind, ContentKind::Image);
    assert_eq!(message.content, "holiday photo");
    let media = message.media.unwrap();
    assert!(media.url.starts_with("/uploads/"));
    assert_eq!(media.filename, "photo.png");
    assert_eq!(media.size, 2048);
}

#[tokio::test]
async fn voice_clip_carries_resolved_duration() {
    let (addr, _handle) = start_harness_with_cap(1024 * 1024).await;
    let (alice_cmd, mut alice_evt) = spawn_client(addr, "alice").await;
    let (_bob_cmd, mut bob_evt) = spawn_client(addr, "bob").await;
    wait_for(&mut alice_evt, "alice connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;
    wait_for(&mut bob_evt, "bob connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;
    select_direct(&alice_cmd, &mut alice_evt, "bob").await;

    // 32 kB of audio at 16 kB/s: a two-second clip.
    alice_cmd
        .send(EngineCommand::SendVoice {
            clip: FileAttachment::new("voice-note.wav", wav_clip(32_000)),
        })
        .await
        .unwrap();

    let received = wait_for(&mut bob_evt, "bob receives voice note", |e| {
        matches!(e, EngineEvent::MessageUpserted { message, .. } if message.media.is_some())
    })
    .await;
    let EngineEvent::MessageUpserted { message, .. } = received else {
        unreachable!()
    };
    assert_eq!(message.kind, ContentKind::Voice);
    assert_eq!(message.media.unwrap().duration_ms, Some(2000));
}

#[tokio::test]
async fn unsupported_attachment_is_blocked_before_any_network_call() {
    let (addr, _handle) = start_harness_with_cap(1024 * 1024).await;
    let (alice_cmd, mut alice_evt) = spawn_client(addr, "alice").await;
    wait_for(&mut alice_evt, "connected", |e| {
        matches!(e, EngineEvent::Connected)
    })
    .await;
    select_direct(&alice_cmd, &mut alice_evt, "bob").await;

    alice_cmd
        .send(EngineCommand::SendMedia {
            text: String::new(),
            attachment: FileAttachment::new("tool.exe", vec![1, 2, 3]),
        })
        .await
        .unwrap();

    wait_for(&mut alice_evt, "rejection notification", |e| {
        matches!(e, EngineEvent::NotificationPosted { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = alice_evt.try_recv() {
        assert!(!matches!(event, EngineEvent::MessageUpserted { .. }));
    }
}
