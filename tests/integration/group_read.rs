// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Group conversations: roster propagation and read aggregation.
//!
//! A group message's `read_by` set only ever grows; the sender's displayed
//! status is the count of acknowledging recipients ("Read by N"), not a
//! scalar status.

use std::time::Duration;

use tokio::sync::mpsc;

use chatsync::backend::HttpBackend;
use chatsync::config::EngineConfig;
use chatsync::engine::{EngineCommand, EngineEvent, spawn_engine};
use chatsync_proto::message::{ChatTarget, DisplayStatus, GroupId, UserId};
use chatsync_proto::notify::NotificationKind;

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

/// Wait until a roster update carries a group with the given name; return
/// its id.
async fn wait_for_group(rx: &mut mpsc::Receiver<EngineEvent>, name: &str) -> GroupId {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(EngineEvent::RosterUpdated { groups })) => {
                if let Some(group) = groups.iter().find(|g| g.name == name) {
                    return group.id;
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed while waiting for roster"),
            Err(_) => break,
        }
    }
    panic!("timeout waiting for group '{name}' in roster");
}

#[tokio::test]
async fn read_by_grows_and_sender_sees_read_by_n() {
    let (addr, _handle) = start_harness().await;

    let (alice_cmd, mut alice_evt) = spawn_client(addr, "alice").await;
    let (bob_cmd, mut bob_evt) = spawn_client(addr, "bob").await;
    let (carol_cmd, mut carol_evt) = spawn_client(addr, "carol").await;

    for (name, evt) in [
        ("alice", &mut alice_evt),
        ("bob", &mut bob_evt),
        ("carol", &mut carol_evt),
    ] {
        wait_for(evt, &format!("{name} connected"), |e| {
            matches!(e, EngineEvent::Connected)
        })
        .await;
    }

    // Alice creates the group; the creation notification drives a roster
    // re-fetch on every member's engine.
    alice_cmd
        .send(EngineCommand::CreateGroup {
            name: "team".into(),
            member_ids: vec![UserId::new("bob"), UserId::new("carol")],
        })
        .await
        .unwrap();

    let group_id = wait_for_group(&mut alice_evt, "team").await;
    assert_eq!(wait_for_group(&mut bob_evt, "team").await, group_id);
    assert_eq!(wait_for_group(&mut carol_evt, "team").await, group_id);

    // Everyone opens the group. Bob and carol having it active makes their
    // acknowledgments automatic on receipt.
    let target = ChatTarget::Group(group_id);
    for (cmd, evt) in [
        (&alice_cmd, &mut alice_evt),
        (&bob_cmd, &mut bob_evt),
        (&carol_cmd, &mut carol_evt),
    ] {
        cmd.send(EngineCommand::SelectConversation(target.clone()))
            .await
            .unwrap();
        wait_for(evt, "group window", |e| {
            matches!(e, EngineEvent::ConversationLoaded { .. })
        })
        .await;
    }

    alice_cmd
        .send(EngineCommand::SendText {
            text: "hello team".into(),
        })
        .await
        .unwrap();

    // Group messages display an aggregate, starting at zero readers.
    let sent = wait_for(&mut alice_evt, "alice sent status", |e| {
        matches!(e, EngineEvent::StatusChanged { .. })
    })
    .await;
    let EngineEvent::StatusChanged { status, .. } = sent else {
        unreachable!()
    };
    assert_eq!(status, DisplayStatus::ReadBy(0));

    wait_for(&mut bob_evt, "bob receives", |e| {
        matches!(e, EngineEvent::MessageUpserted { message, .. } if message.sender == UserId::new("alice"))
    })
    .await;
    wait_for(&mut carol_evt, "carol receives", |e| {
        matches!(e, EngineEvent::MessageUpserted { message, .. } if message.sender == UserId::new("alice"))
    })
    .await;

    // Receipts aggregate monotonically: 1 reader, then 2, never back.
    wait_for(&mut alice_evt, "read by one", |e| {
        matches!(
            e,
            EngineEvent::StatusChanged {
                status: DisplayStatus::ReadBy(1),
                ..
            }
        )
    })
    .await;
    wait_for(&mut alice_evt, "read by two", |e| {
        matches!(
            e,
            EngineEvent::StatusChanged {
                status: DisplayStatus::ReadBy(2),
                ..
            }
        )
    })
    .await;
}

#[tokio::test]
async fn membership_mutations_refresh_the_roster() {
    let (addr, _handle) = start_harness().await;

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

    alice_cmd
        .send(EngineCommand::CreateGroup {
            name: "duo".into(),
            member_ids: vec![UserId::new("bob")],
        })
        .await
        .unwrap();
    let group_id = wait_for_group(&mut alice_evt, "duo").await;

    // Adding carol triggers a group notification and a fresh roster on
    // every member's engine.
    alice_cmd
        .send(EngineCommand::AddMember {
            group_id,
            user_id: UserId::new("carol"),
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "carol never appeared in bob's roster"
        );
        match tokio::time::timeout(Duration::from_secs(5), bob_evt.recv()).await {
            Ok(Some(EngineEvent::RosterUpdated { groups })) => {
                let carol_in = groups
                    .iter()
                    .any(|g| g.id == group_id && g.members.contains(&UserId::new("carol")));
                if carol_in {
                    break;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => panic!("bob's event channel closed"),
            Err(_) => panic!("timed out waiting for bob's roster update"),
        }
    }

    // Removing a member as a non-creator admin fails and surfaces as a
    // notification, never a crash.
    alice_cmd
        .send(EngineCommand::RemoveMember {
            group_id,
            user_id: UserId::new("carol"),
            admin_id: Some(UserId::new("bob")),
        })
        .await
        .unwrap();
    wait_for(&mut alice_evt, "forbidden-removal notification", |e| {
        matches!(
            e,
            EngineEvent::NotificationPosted { notification }
                if matches!(notification.kind, NotificationKind::Error { .. })
        )
    })
    .await;
}
