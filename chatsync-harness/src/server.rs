//! Harness server: WebSocket event channel plus HTTP request/response
//! routes.
//!
//! The event channel speaks the postcard-encoded `ClientEvent`/`ServerEvent`
//! unions. Connection lifecycle per client:
//!
//! 1. Wait for a `Connect { user_id }` frame.
//! 2. Register the user and send `Welcome` back.
//! 3. Send a presence snapshot of everyone already online, broadcast the new
//!    arrival's presence to the others, and push an unread-count
//!    notification when anything is pending.
//! 4. Enter the event loop, routing messages, receipts, edits, and
//!    deletions.
//! 5. On disconnect, unregister and broadcast the departure.

use std::sync::Arc;

use axum::Json;
use axum::extract::ws::{Message as WsFrame, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use chatsync_proto::api::{
    CreateGroupRequest, ErrorBody, RemoveMemberRequest, UploadReceipt, content_kind_for_extension,
    file_extension,
};
use chatsync_proto::codec;
use chatsync_proto::event::{ClientEvent, ServerEvent};
use chatsync_proto::group::Group;
use chatsync_proto::message::{
    ChatTarget, GroupId, Message, MessageId, MessageStatus, Timestamp, UserId,
};
use chatsync_proto::notify::{Notification, NotificationKind};

use crate::state::{HarnessState, StateError};

/// Starts the harness on the given address with fresh state.
///
/// Returns the bound address and a join handle. This is the entry point used
/// by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(HarnessState::new())).await
}

/// Starts the harness with a pre-configured [`HarnessState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<HarnessState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/messages/{user}/{other}", axum::routing::get(get_history))
        .route("/upload", axum::routing::post(upload))
        .route("/groups", axum::routing::post(create_group))
        .route(
            "/groups/{id}",
            axum::routing::get(get_groups).delete(delete_group),
        )
        .route(
            "/groups/{id}/members/{user}",
            axum::routing::post(add_member),
        )
        .route("/groups/{id}/remove", axum::routing::post(remove_member))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "harness server error");
        }
    });

    Ok((bound_addr, handle))
}

// ---------------------------------------------------------------------------
// Event channel
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HarnessState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handles an upgraded WebSocket connection for a single user.
pub async fn handle_socket(socket: WebSocket, state: Arc<HarnessState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(user) = wait_for_connect(&mut ws_receiver).await else {
        tracing::warn!("connection closed before handshake");
        return;
    };
    tracing::info!(user = %user, "user connecting");

    let (tx, mut rx) = mpsc::unbounded_channel::<WsFrame>();
    if state.register(&user, tx).await.is_some() {
        tracing::info!(user = %user, "replaced existing connection");
    }

    let welcome = ServerEvent::Welcome {
        user_id: user.clone(),
    };
    if send_frame(&mut ws_sender, &welcome).await.is_err() {
        state.unregister(&user).await;
        return;
    }

    // Fresh presence snapshot for the newcomer, then announce them.
    for other in state.online_users().await {
        if other != user {
            let _ = send_frame(
                &mut ws_sender,
                &ServerEvent::Presence {
                    user_id: other,
                    online: true,
                },
            )
            .await;
        }
    }
    broadcast_presence(&state, &user, true).await;

    let (direct, group) = state.unread_counts(&user).await;
    if direct > 0 || group > 0 {
        let notification = Notification::new(NotificationKind::Unread {
            content: format!(
                "You have {direct} unread direct messages and {group} unread group messages"
            ),
            direct,
            group,
        });
        let _ = send_frame(&mut ws_sender, &ServerEvent::Notification(notification)).await;
    }

    // Writer task: forward frames from the per-user channel.
    let writer_user = user.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(frame).await.is_err() {
                tracing::warn!(user = %writer_user, "WebSocket write failed");
                break;
            }
        }
    });

    // Reader task: process client events.
    let reader_user = user.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = ws_receiver.next().await {
            match frame {
                WsFrame::Binary(data) => {
                    handle_client_event(&reader_user, &data, &reader_state).await;
                }
                WsFrame::Close(_) => {
                    tracing::info!(user = %reader_user, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(&user).await;
    broadcast_presence(&state, &user, false).await;
    tracing::info!(user = %user, "user disconnected");
}

/// Waits for the handshake `Connect` frame.
async fn wait_for_connect(
    receiver: &mut (impl StreamExt<Item = Result<WsFrame, axum::Error>> + Unpin),
) -> Option<UserId> {
    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            WsFrame::Binary(data) => match codec::decode_client(&data) {
                Ok(ClientEvent::Connect { user_id }) => {
                    if user_id.as_str().is_empty() {
                        tracing::warn!("handshake with empty user id");
                        return None;
                    }
                    return Some(user_id);
                }
                Ok(other) => {
                    tracing::warn!(event = ?other, "expected Connect during handshake");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed handshake frame");
                    return None;
                }
            },
            WsFrame::Close(_) => return None,
            _ => {
                // Skip non-binary frames during the handshake.
            }
        }
    }
    None
}

/// Processes one decoded client event.
async fn handle_client_event(user: &UserId, data: &[u8], state: &Arc<HarnessState>) {
    let event = match codec::decode_client(data) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(user = %user, error = %e, "failed to decode client event");
            return;
        }
    };

    match event {
        ClientEvent::SendMessage {
            tag,
            target,
            content,
            kind,
            media,
        } => {
            if let Some(media) = &media
                && !state.upload_exists(&media.url).await
            {
                send_error(state, user, "media file not found").await;
                return;
            }

            if let ChatTarget::Group(group_id) = &target {
                let Some(group) = state.find_group(*group_id).await else {
                    return;
                };
                if !group.is_member(user) {
                    return;
                }
            }

            let mut message = Message {
                id: MessageId::new(),
                tag: Some(tag),
                target,
                sender: user.clone(),
                content,
                kind,
                media,
                sent_at: Timestamp::now(),
                status: MessageStatus::Sent,
                read_by: std::collections::BTreeSet::new(),
                deleted: false,
            };
            message.read_by.insert(user.clone());
            state.insert_message(message.clone()).await;

            for recipient in recipients_for(state, &message).await {
                send_event(state, &recipient, &ServerEvent::Message(message.clone())).await;
            }
        }
        ClientEvent::MarkRead { message_id } => {
            let Some(updated) = state.mark_read(&message_id, user).await else {
                return;
            };
            let receipt = ServerEvent::ReadReceipt {
                message_id,
                reader: user.clone(),
                read_by: updated.read_by.clone(),
            };
            match &updated.target {
                ChatTarget::Group(_) => {
                    for recipient in recipients_for(state, &updated).await {
                        send_event(state, &recipient, &receipt).await;
                    }
                }
                ChatTarget::Direct(_) => {
                    send_event(state, &updated.sender, &receipt).await;
                }
            }
        }
        ClientEvent::JoinGroup { group_id } => {
            let member = state
                .find_group(group_id)
                .await
                .is_some_and(|g| g.is_member(user));
            if member {
                tracing::info!(user = %user, group_id = %group_id, "user joined group stream");
            }
        }
        ClientEvent::EditMessage {
            message_id,
            content,
        } => match state.edit_message(&message_id, user, &content).await {
            Ok(updated) => {
                let event = ServerEvent::MessageEdited {
                    message_id,
                    content,
                    edited_at: Timestamp::now(),
                };
                for recipient in recipients_for(state, &updated).await {
                    send_event(state, &recipient, &event).await;
                }
            }
            Err(e) => send_error(state, user, &e.to_string()).await,
        },
        ClientEvent::DeleteMessage {
            message_id,
            for_everyone,
        } => {
            if for_everyone {
                match state.delete_message(&message_id, user).await {
                    Ok(deleted) => {
                        let event = ServerEvent::MessageDeleted { message_id };
                        for recipient in recipients_for(state, &deleted).await {
                            send_event(state, &recipient, &event).await;
                        }
                    }
                    Err(e) => send_error(state, user, &e.to_string()).await,
                }
            } else {
                match state.hide_message(&message_id, user).await {
                    Ok(()) => {
                        send_event(state, user, &ServerEvent::MessageDeleted { message_id }).await;
                    }
                    Err(e) => send_error(state, user, &e.to_string()).await,
                }
            }
        }
        ClientEvent::Connect { .. } => {
            tracing::warn!(user = %user, "duplicate Connect from registered user");
        }
    }
}

/// Users an event about this message fans out to.
async fn recipients_for(state: &Arc<HarnessState>, message: &Message) -> Vec<UserId> {
    match &message.target {
        ChatTarget::Group(group_id) => state
            .find_group(*group_id)
            .await
            .map(|g| g.members)
            .unwrap_or_default(),
        ChatTarget::Direct(to) => vec![to.clone(), message.sender.clone()],
    }
}

/// Sends an event to a connected user via its writer channel.
async fn send_event(state: &Arc<HarnessState>, user: &UserId, event: &ServerEvent) {
    if let Some(sender) = state.get_sender(user).await
        && let Ok(bytes) = codec::encode_server(event)
    {
        let _ = sender.send(WsFrame::Binary(bytes.into()));
    }
}

/// Sends a request-scoped error event back to the acting user.
async fn send_error(state: &Arc<HarnessState>, user: &UserId, message: &str) {
    send_event(
        state,
        user,
        &ServerEvent::Error {
            message: message.to_string(),
        },
    )
    .await;
}

/// Broadcasts a presence change to everyone but the affected user.
async fn broadcast_presence(state: &Arc<HarnessState>, user: &UserId, online: bool) {
    let event = ServerEvent::Presence {
        user_id: user.clone(),
        online,
    };
    for other in state.online_users().await {
        if other != *user {
            send_event(state, &other, &event).await;
        }
    }
}

/// Encodes and sends an event directly on a WebSocket sender.
async fn send_frame(
    ws_sender: &mut (impl SinkExt<WsFrame, Error = axum::Error> + Unpin),
    event: &ServerEvent,
) -> Result<(), String> {
    let bytes = codec::encode_server(event).map_err(|e| e.to_string())?;
    ws_sender
        .send(WsFrame::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

// ---------------------------------------------------------------------------
// Request/response routes
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn state_error_response(err: &StateError) -> Response {
    let status = match err {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Forbidden(_) => StatusCode::FORBIDDEN,
        StateError::Invalid(_) => StatusCode::BAD_REQUEST,
    };
    error_response(status, err.to_string())
}

#[derive(Debug, serde::Deserialize)]
struct HistoryQuery {
    kind: Option<String>,
    page: Option<u32>,
    limit: Option<usize>,
}

async fn get_history(
    State(state): State<Arc<HarnessState>>,
    Path((user, other)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let user = UserId::new(user);
    let target = if query.kind.as_deref() == Some("group") {
        match other.parse::<Uuid>() {
            Ok(uuid) => ChatTarget::Group(GroupId::from_uuid(uuid)),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid group id"),
        }
    } else {
        ChatTarget::Direct(UserId::new(other))
    };
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    let messages = state.history(&user, &target, page, limit).await;
    Json(messages).into_response()
}

#[derive(Debug, serde::Deserialize)]
struct UploadQuery {
    filename: String,
}

async fn upload(
    State(state): State<Arc<HarnessState>>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Bytes,
) -> Response {
    if body.len() as u64 > state.max_upload_size {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "file too large: {} bytes (max {})",
                body.len(),
                state.max_upload_size
            ),
        );
    }

    let Some(kind) =
        file_extension(&query.filename).and_then(|ext| content_kind_for_extension(&ext))
    else {
        return error_response(StatusCode::BAD_REQUEST, "unsupported file type");
    };

    // Stored under a unique name; the original filename survives in the
    // receipt only.
    let ext = file_extension(&query.filename).unwrap_or_default();
    let url = format!("/uploads/{}.{ext}", Uuid::now_v7());
    state.record_upload(url.clone()).await;

    Json(UploadReceipt {
        url,
        kind,
        filename: query.filename,
        size: body.len() as u64,
    })
    .into_response()
}

async fn get_groups(State(state): State<Arc<HarnessState>>, Path(user): Path<String>) -> Response {
    let groups = state.groups_for(&UserId::new(user)).await;
    Json(groups).into_response()
}

async fn create_group(
    State(state): State<Arc<HarnessState>>,
    Json(request): Json<CreateGroupRequest>,
) -> Response {
    if request.name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "group name is empty");
    }
    let group = state
        .create_group(request.name, request.member_ids, request.created_by)
        .await;

    notify_group(
        &state,
        &group,
        None,
        format!("You have been added to group: {}", group.name),
    )
    .await;

    Json(group).into_response()
}

async fn add_member(
    State(state): State<Arc<HarnessState>>,
    Path((id, user)): Path<(String, String)>,
) -> Response {
    let Ok(uuid) = id.parse::<Uuid>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid group id");
    };
    let user = UserId::new(user);
    match state.add_member(GroupId::from_uuid(uuid), &user).await {
        Ok(group) => {
            notify_group(
                &state,
                &group,
                None,
                format!("{} was added to '{}'", user, group.name),
            )
            .await;
            StatusCode::OK.into_response()
        }
        Err(e) => state_error_response(&e),
    }
}

async fn remove_member(
    State(state): State<Arc<HarnessState>>,
    Path(id): Path<String>,
    Json(request): Json<RemoveMemberRequest>,
) -> Response {
    let Ok(uuid) = id.parse::<Uuid>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid group id");
    };
    let removed = request.user_id.clone();
    let voluntary = request.admin_id.is_none();
    match state
        .remove_member(
            GroupId::from_uuid(uuid),
            &request.user_id,
            request.admin_id.as_ref(),
        )
        .await
    {
        Ok(group) => {
            let content = if voluntary {
                format!("{} has left the group '{}'", removed, group.name)
            } else {
                format!("{} has been removed from the group '{}'", removed, group.name)
            };
            notify_group(&state, &group, Some(&removed), content).await;
            StatusCode::OK.into_response()
        }
        Err(e) => state_error_response(&e),
    }
}

async fn delete_group(State(state): State<Arc<HarnessState>>, Path(id): Path<String>) -> Response {
    let Ok(uuid) = id.parse::<Uuid>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid group id");
    };
    match state.delete_group(GroupId::from_uuid(uuid)).await {
        Ok(group) => {
            notify_group(
                &state,
                &group,
                None,
                format!("Group '{}' was deleted", group.name),
            )
            .await;
            StatusCode::OK.into_response()
        }
        Err(e) => state_error_response(&e),
    }
}

/// Pushes a group notification to every member (optionally skipping one).
async fn notify_group(
    state: &Arc<HarnessState>,
    group: &Group,
    skip: Option<&UserId>,
    content: String,
) {
    let notification = Notification::new(NotificationKind::Group {
        content,
        group_id: group.id,
    });
    for member in &group.members {
        if skip != Some(member) {
            send_event(
                state,
                member,
                &ServerEvent::Notification(notification.clone()),
            )
            .await;
        }
    }
}
