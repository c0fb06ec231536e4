//! The synchronization engine: one loop that owns all client state.
//!
//! [`SyncEngine`] is the application root. It holds the session manager, the
//! per-conversation stores, the presence tracker, the notification board,
//! the group roster, and the outbound queue -- an explicit context object, no
//! global mutable state. A single `select!` loop consumes, in arrival order:
//!
//! - UI commands ([`EngineCommand`])
//! - session events (the inbound tagged union, plus connection lifecycle)
//! - completions of in-flight backend calls (history pages, roster fetches,
//!   uploads)
//! - the notification-expiry timer
//!
//! Each completion applies its effect atomically before the next suspension
//! point. Multiple backend calls may be in flight at once; a history
//! response is discarded when its conversation tag no longer matches the
//! current selection, so a late-arriving page can never overwrite the view
//! of a different conversation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use chatsync_proto::api::{CreateGroupRequest, RemoveMemberRequest};
use chatsync_proto::event::{ClientEvent, ServerEvent};
use chatsync_proto::group::Group;
use chatsync_proto::message::{
    ChatTarget, ClientTag, ContentKind, DisplayStatus, GroupId, MediaRef, Message, MessageId,
    MessageStatus, Timestamp, UserId,
};
use chatsync_proto::notify::{Notification, NotificationId, NotificationKind};

use crate::backend::{Backend, BackendError};
use crate::config::EngineConfig;
use crate::media::{FileAttachment, UploadJob, UploadStatus, WavDurationProbe, resolve_duration};
use crate::notify::{NotificationBoard, UnreadCounters};
use crate::presence::PresenceTracker;
use crate::queue::OutboundQueue;
use crate::session::{SessionConfig, SessionError, SessionEvent, SessionManager};
use crate::store::ConversationStore;

/// Errors raised when spawning the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Required configuration fields are missing.
    #[error("incomplete configuration: {0}")]
    Config(&'static str),

    /// The initial session could not be established.
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// User actions, fed to the engine by the UI layer.
#[derive(Debug)]
pub enum EngineCommand {
    /// Make a conversation active and load its first page if needed.
    SelectConversation(ChatTarget),
    /// Send a text message to the active conversation.
    SendText {
        /// The message text.
        text: String,
    },
    /// Send a message with an attached file to the active conversation.
    ///
    /// The file is uploaded first; only on success is a message emitted.
    SendMedia {
        /// Caption text (may be empty).
        text: String,
        /// The attached file.
        attachment: FileAttachment,
    },
    /// Send a captured voice clip to the active conversation.
    SendVoice {
        /// The clip, as produced by the voice recorder.
        clip: FileAttachment,
    },
    /// Load the next (older) history page of the active conversation.
    LoadOlder,
    /// Replace the content of a previously sent message.
    EditMessage {
        /// The message to edit.
        message_id: MessageId,
        /// The new content.
        content: String,
    },
    /// Delete a message.
    DeleteMessage {
        /// The message to delete.
        message_id: MessageId,
        /// Delete for all participants (sender only) or just locally.
        for_everyone: bool,
    },
    /// Create a group.
    CreateGroup {
        /// Group name.
        name: String,
        /// Initial members besides the creator.
        member_ids: Vec<UserId>,
    },
    /// Add a member to a group.
    AddMember {
        /// The group.
        group_id: GroupId,
        /// The user to add.
        user_id: UserId,
    },
    /// Remove a member from a group (or leave it).
    RemoveMember {
        /// The group.
        group_id: GroupId,
        /// The user to remove.
        user_id: UserId,
        /// The requesting admin, when removing someone else.
        admin_id: Option<UserId>,
    },
    /// Delete a group.
    DeleteGroup {
        /// The group.
        group_id: GroupId,
    },
    /// Explicitly reconnect a terminally disconnected session.
    Reconnect,
    /// Stop the engine loop.
    Shutdown,
}

/// State changes, emitted to the UI layer.
#[derive(Debug)]
pub enum EngineEvent {
    /// The session (re-)entered `Connected`.
    Connected,
    /// A reconnection attempt is starting.
    Reconnecting {
        /// The attempt being made (1-based).
        attempt: u32,
        /// Total attempts in the budget.
        max_attempts: u32,
    },
    /// The retry budget is exhausted; an explicit reconnect is required.
    Disconnected,
    /// A conversation window was (re)loaded.
    ConversationLoaded {
        /// The conversation.
        target: ChatTarget,
        /// The full window, oldest first.
        messages: Vec<Message>,
        /// Whether an older page may exist.
        has_more: bool,
    },
    /// A message was inserted or updated in a conversation window.
    MessageUpserted {
        /// The conversation.
        target: ChatTarget,
        /// The stored message after merging.
        message: Message,
    },
    /// A message's displayed status advanced.
    StatusChanged {
        /// The message.
        message_id: MessageId,
        /// The new display status.
        status: DisplayStatus,
    },
    /// A message was edited.
    MessageEdited {
        /// The message.
        message_id: MessageId,
        /// The new content.
        content: String,
    },
    /// A message was deleted (tombstoned).
    MessageDeleted {
        /// The message.
        message_id: MessageId,
    },
    /// A participant's presence changed.
    PresenceChanged {
        /// The user.
        user_id: UserId,
        /// Whether they are now online.
        online: bool,
    },
    /// The group roster was replaced.
    RosterUpdated {
        /// The full roster.
        groups: Vec<Group>,
    },
    /// The unread counters were replaced by a backend snapshot.
    UnreadChanged {
        /// The new absolute counters.
        counters: UnreadCounters,
    },
    /// An upload job changed state.
    UploadStateChanged {
        /// The job, with its current status.
        job: UploadJob,
    },
    /// A notification went live.
    NotificationPosted {
        /// The notification.
        notification: Notification,
    },
    /// A notification's time-to-live elapsed.
    NotificationExpired {
        /// The expired notification.
        id: NotificationId,
    },
}

/// Why a history fetch was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryPurpose {
    /// Pagination: advance the cursor and prepend older messages.
    Page,
    /// Post-reconnect refresh: merge the newest page, cursor untouched.
    Refresh,
}

/// Completion of an in-flight backend call.
#[derive(Debug)]
enum IoDone {
    History {
        target: ChatTarget,
        purpose: HistoryPurpose,
        limit: usize,
        result: Result<Vec<Message>, BackendError>,
    },
    Groups {
        result: Result<Vec<Group>, BackendError>,
    },
    GroupCreated {
        result: Result<Group, BackendError>,
    },
    Mutation {
        label: &'static str,
        result: Result<(), BackendError>,
    },
    MediaReady {
        tag: ClientTag,
        target: ChatTarget,
        text: String,
        kind: ContentKind,
        media: MediaRef,
    },
    MediaFailed {
        tag: ClientTag,
        error: String,
    },
}

/// The synchronization engine. Owns all client-side state; see the module
/// docs for the loop structure.
pub struct SyncEngine<B: Backend + 'static> {
    user_id: UserId,
    config: EngineConfig,
    session: SessionManager,
    session_rx: mpsc::Receiver<SessionEvent>,
    backend: Arc<B>,
    stores: HashMap<ChatTarget, ConversationStore>,
    active: Option<ChatTarget>,
    groups: Vec<Group>,
    presence: PresenceTracker,
    board: NotificationBoard,
    counters: UnreadCounters,
    queue: OutboundQueue,
    uploads: HashMap<ClientTag, UploadJob>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    evt_tx: mpsc::Sender<EngineEvent>,
    io_tx: mpsc::Sender<IoDone>,
    io_rx: mpsc::Receiver<IoDone>,
}

/// Connects the session and spawns the engine loop.
///
/// Exactly one session is established per engine; switching between direct
/// and group conversations never opens a second one. Returns the command
/// sender and event receiver the UI layer drives the engine with.
///
/// # Errors
///
/// Returns [`EngineError::Config`] if the server URL or user id is missing,
/// or [`EngineError::Session`] if the initial connect fails.
pub async fn spawn_engine<B: Backend + 'static>(
    config: EngineConfig,
    backend: B,
) -> Result<(mpsc::Sender<EngineCommand>, mpsc::Receiver<EngineEvent>), EngineError> {
    let session_config: SessionConfig = config
        .to_session_config()
        .ok_or(EngineError::Config("server ws_url and user_id are required"))?;
    let user_id = session_config.user_id.clone();

    let (session, session_rx) = SessionManager::connect(session_config).await?;

    let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
    let (evt_tx, evt_rx) = mpsc::channel(config.channel_capacity);
    let (io_tx, io_rx) = mpsc::channel(config.channel_capacity);

    let engine = SyncEngine {
        user_id,
        board: NotificationBoard::new(config.notification_ttl),
        config,
        session,
        session_rx,
        backend: Arc::new(backend),
        stores: HashMap::new(),
        active: None,
        groups: Vec::new(),
        presence: PresenceTracker::new(),
        counters: UnreadCounters::default(),
        queue: OutboundQueue::new(),
        uploads: HashMap::new(),
        cmd_rx,
        evt_tx,
        io_tx,
        io_rx,
    };

    tokio::spawn(engine.run());

    Ok((cmd_tx, evt_rx))
}

impl<B: Backend + 'static> SyncEngine<B> {
    /// The dispatch loop. Runs until `Shutdown` or the command channel
    /// closes.
    async fn run(mut self) {
        loop {
            let deadline = self.board.next_deadline();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(EngineCommand::Shutdown) => {
                        tracing::info!("engine shutting down");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = self.session_rx.recv() => {
                    self.handle_session_event(event).await;
                }
                Some(done) = self.io_rx.recv() => {
                    self.handle_io(done).await;
                }
                () = sleep_until_opt(deadline) => {
                    self.expire_notifications().await;
                }
            }
        }
    }

    async fn emit(&self, event: EngineEvent) {
        let _ = self.evt_tx.send(event).await;
    }

    /// Raises a visible error notification. Every failure path ends here;
    /// nothing is silently dropped and nothing is fatal.
    async fn notify_error(&mut self, message: String) {
        tracing::warn!(%message, "surfacing error notification");
        let notification = Notification::error(message);
        self.board.post(notification.clone(), Instant::now());
        self.emit(EngineEvent::NotificationPosted { notification })
            .await;
    }

    fn store_mut(&mut self, target: &ChatTarget) -> &mut ConversationStore {
        self.stores
            .entry(target.clone())
            .or_insert_with(|| ConversationStore::new(target.clone()))
    }

    // -- session events --------------------------------------------------

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                // Presence is rebuilt from the fresh snapshot the backend
                // sends after every handshake.
                self.presence.reset();
                self.flush_queue().await;
                self.emit(EngineEvent::Connected).await;

                if let Some(target) = self.active.clone() {
                    self.request_history(target.clone(), HistoryPurpose::Refresh);
                    if target.is_group() {
                        self.request_groups();
                    }
                }
            }
            SessionEvent::Reconnecting {
                attempt,
                max_attempts,
            } => {
                self.emit(EngineEvent::Reconnecting {
                    attempt,
                    max_attempts,
                })
                .await;
            }
            SessionEvent::Disconnected => {
                self.emit(EngineEvent::Disconnected).await;
            }
            SessionEvent::Inbound(event) => self.handle_inbound(event).await,
        }
    }

    /// Replays queued sends in enqueue order, exactly once per entry. If the
    /// transport drops mid-flush, the unsent tail goes back to the queue
    /// head.
    async fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let mut entries = self.queue.drain();
        tracing::info!(count = entries.len(), "flushing outbound queue");

        let mut failed_at = None;
        let mut sent_tags = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            match self.session.send(&entry.event).await {
                Ok(()) => {
                    if let ClientEvent::SendMessage { tag, target, .. } = &entry.event {
                        sent_tags.push((*tag, target.clone()));
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "transport dropped during queue flush");
                    failed_at = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = failed_at {
            self.queue.requeue_front(entries.split_off(i));
        }

        // Optimistic entries for replayed sends advance to Sent.
        for (tag, target) in sent_tags {
            let id = tag.provisional_id();
            let status = {
                let Some(store) = self.stores.get_mut(&target) else {
                    continue;
                };
                if !store.mark_status(&id, MessageStatus::Sent) {
                    continue;
                }
                store.find(&id).map(Message::display_status)
            };
            if let Some(status) = status {
                self.emit(EngineEvent::StatusChanged {
                    message_id: id,
                    status,
                })
                .await;
            }
        }
    }

    // -- inbound events --------------------------------------------------

    async fn handle_inbound(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Message(message) => self.handle_message(message).await,
            ServerEvent::Notification(notification) => {
                self.handle_notification(notification).await;
            }
            ServerEvent::ReadReceipt {
                message_id,
                reader,
                read_by,
            } => {
                let status = self.stores.values_mut().find_map(|store| {
                    store
                        .apply_read_receipt(&message_id, &reader, &read_by)
                        .then(|| store.find(&message_id).map(Message::display_status))
                        .flatten()
                });
                if let Some(status) = status {
                    self.emit(EngineEvent::StatusChanged { message_id, status })
                        .await;
                }
            }
            ServerEvent::MessageEdited {
                message_id,
                content,
                ..
            } => {
                let applied = self
                    .stores
                    .values_mut()
                    .any(|store| store.apply_edit(&message_id, &content));
                if applied {
                    self.emit(EngineEvent::MessageEdited {
                        message_id,
                        content,
                    })
                    .await;
                }
            }
            ServerEvent::MessageDeleted { message_id } => {
                let applied = self
                    .stores
                    .values_mut()
                    .any(|store| store.apply_deleted(&message_id));
                if applied {
                    self.emit(EngineEvent::MessageDeleted { message_id }).await;
                }
            }
            ServerEvent::Presence { user_id, online } => {
                if self.presence.apply(&user_id, online) {
                    self.emit(EngineEvent::PresenceChanged { user_id, online })
                        .await;
                }
            }
            ServerEvent::Error { message } => {
                self.notify_error(message).await;
            }
            ServerEvent::Welcome { .. } => {
                // Handshake frames are consumed by the session manager.
            }
        }
    }

    /// Applies an inbound message: idempotent insert, correlation-tag
    /// reconciliation, unread accounting, and the automatic read
    /// acknowledgment -- a displayed message is, by definition, read.
    async fn handle_message(&mut self, message: Message) {
        let key = conversation_key(&self.user_id, &message);
        let from_me = message.sender == self.user_id;
        let is_active = self.active.as_ref() == Some(&key);
        let server_id = message.id;

        let stored = {
            let store = self.store_mut(&key);
            store.insert_live(message);
            if !from_me && !is_active {
                store.note_unread();
            }
            store.find(&server_id).cloned()
        };

        let Some(stored) = stored else { return };

        if !from_me && is_active {
            self.ack_read(server_id).await;
        }
        self.emit(EngineEvent::MessageUpserted {
            target: key,
            message: stored,
        })
        .await;
    }

    /// Sends the read acknowledgment for a viewed message, queueing it when
    /// the session is down.
    async fn ack_read(&mut self, message_id: MessageId) {
        let event = ClientEvent::MarkRead { message_id };
        if let Err(err) = self.session.send(&event).await {
            tracing::debug!(%message_id, %err, "queueing read acknowledgment");
            self.queue.push(ClientTag::new(), event);
        }
    }

    async fn handle_notification(&mut self, notification: Notification) {
        match &notification.kind {
            NotificationKind::Unread { direct, group, .. } => {
                // The counts are absolute: replace, never add.
                self.counters = UnreadCounters {
                    direct: *direct,
                    group: *group,
                };
                self.emit(EngineEvent::UnreadChanged {
                    counters: self.counters,
                })
                .await;
            }
            NotificationKind::Group { .. } => {
                // Full roster re-fetch instead of an incremental merge;
                // group counts are small.
                self.request_groups();
            }
            NotificationKind::Error { .. } => {}
        }

        self.board.post(notification.clone(), Instant::now());
        self.emit(EngineEvent::NotificationPosted { notification })
            .await;
    }

    async fn expire_notifications(&mut self) {
        for id in self.board.expire_due(Instant::now()) {
            self.emit(EngineEvent::NotificationExpired { id }).await;
        }
    }

    // -- commands --------------------------------------------------------

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::SelectConversation(target) => {
                self.select_conversation(target).await;
            }
            EngineCommand::SendText { text } => {
                self.send_text(text).await;
            }
            EngineCommand::SendMedia { text, attachment } => {
                self.send_media(text, attachment, false).await;
            }
            EngineCommand::SendVoice { clip } => {
                self.send_media(String::new(), clip, true).await;
            }
            EngineCommand::LoadOlder => {
                if let Some(target) = self.active.clone() {
                    if self.store_mut(&target).has_more() {
                        self.request_history(target, HistoryPurpose::Page);
                    }
                } else {
                    self.notify_error("no conversation selected".into()).await;
                }
            }
            EngineCommand::EditMessage {
                message_id,
                content,
            } => {
                self.send_or_queue(ClientEvent::EditMessage {
                    message_id,
                    content,
                })
                .await;
            }
            EngineCommand::DeleteMessage {
                message_id,
                for_everyone,
            } => {
                self.send_or_queue(ClientEvent::DeleteMessage {
                    message_id,
                    for_everyone,
                })
                .await;
            }
            EngineCommand::CreateGroup { name, member_ids } => {
                self.create_group(name, member_ids).await;
            }
            EngineCommand::AddMember { group_id, user_id } => {
                self.spawn_mutation("add member", move |backend| async move {
                    backend.add_member(group_id, &user_id).await
                });
            }
            EngineCommand::RemoveMember {
                group_id,
                user_id,
                admin_id,
            } => {
                self.spawn_mutation("remove member", move |backend| async move {
                    backend
                        .remove_member(group_id, RemoveMemberRequest { user_id, admin_id })
                        .await
                });
            }
            EngineCommand::DeleteGroup { group_id } => {
                self.spawn_mutation("delete group", move |backend| async move {
                    backend.delete_group(group_id).await
                });
            }
            EngineCommand::Reconnect => {
                if let Err(err) = self.session.reconnect().await {
                    self.notify_error(format!("reconnect failed: {err}")).await;
                }
            }
            EngineCommand::Shutdown => unreachable!("handled by the loop"),
        }
    }

    async fn select_conversation(&mut self, target: ChatTarget) {
        self.active = Some(target.clone());

        let (window, has_more, needs_load) = {
            let store = self.store_mut(&target);
            store.clear_unread();
            let needs_load = store.messages().is_empty() && store.next_page() == 1;
            (store.messages().to_vec(), store.has_more(), needs_load)
        };

        if let ChatTarget::Group(group_id) = &target {
            // Subscribe to the group's live stream; a failure here just
            // means the subscription rides along with the next reconnect.
            if let Err(err) = self
                .session
                .send(&ClientEvent::JoinGroup {
                    group_id: *group_id,
                })
                .await
            {
                tracing::debug!(%err, "join_group not sent");
            }
            self.request_groups();
        }

        if needs_load {
            self.request_history(target, HistoryPurpose::Page);
        } else {
            self.emit(EngineEvent::ConversationLoaded {
                target,
                messages: window,
                has_more,
            })
            .await;
        }
    }

    /// Sends a text message: optimistic pending entry first, then the emit,
    /// then the `Sent` upgrade -- never blocking the store on the network.
    async fn send_text(&mut self, text: String) {
        let Some(target) = self.active.clone() else {
            self.notify_error("no conversation selected".into()).await;
            return;
        };
        self.emit_message(ClientTag::new(), target, text, ContentKind::Text, None)
            .await;
    }

    /// Shared optimistic send path for text and (already uploaded) media.
    async fn emit_message(
        &mut self,
        tag: ClientTag,
        target: ChatTarget,
        text: String,
        kind: ContentKind,
        media: Option<MediaRef>,
    ) {
        let message = Message {
            id: tag.provisional_id(),
            tag: Some(tag),
            target: target.clone(),
            sender: self.user_id.clone(),
            content: text.clone(),
            kind,
            media: media.clone(),
            sent_at: Timestamp::now(),
            status: MessageStatus::Pending,
            read_by: BTreeSet::new(),
            deleted: false,
        };

        // Validation blocks the action synchronously, before any network
        // call.
        if let Err(err) = message.validate() {
            self.notify_error(format!("cannot send: {err}")).await;
            return;
        }

        self.store_mut(&target).insert_live(message.clone());
        self.emit(EngineEvent::MessageUpserted {
            target: target.clone(),
            message: message.clone(),
        })
        .await;

        let event = ClientEvent::SendMessage {
            tag,
            target: target.clone(),
            content: text,
            kind,
            media,
        };
        match self.session.send(&event).await {
            Ok(()) => {
                let status = {
                    let store = self.store_mut(&target);
                    if store.mark_status(&message.id, MessageStatus::Sent) {
                        store.find(&message.id).map(Message::display_status)
                    } else {
                        None
                    }
                };
                if let Some(status) = status {
                    self.emit(EngineEvent::StatusChanged {
                        message_id: message.id,
                        status,
                    })
                    .await;
                }
            }
            Err(err) => {
                // Not dropped: the entry stays Pending and the send replays
                // on reconnect.
                tracing::info!(%err, tag = %tag, "session unavailable, queueing send");
                self.queue.push(tag, event);
            }
        }
    }

    /// Starts the upload→emit sequence for a file or voice clip.
    ///
    /// A single bounded upload attempt; failure aborts the whole send and no
    /// message is ever appended. Voice clips additionally get a bounded
    /// duration probe before upload.
    async fn send_media(&mut self, text: String, attachment: FileAttachment, probe: bool) {
        let Some(target) = self.active.clone() else {
            self.notify_error("no conversation selected".into()).await;
            return;
        };
        if attachment.kind().is_none() {
            self.notify_error(format!("unsupported file type: {}", attachment.filename))
                .await;
            return;
        }

        let tag = ClientTag::new();
        let mut job = UploadJob::new(tag, &attachment.filename);
        job.status = UploadStatus::Uploading;
        self.uploads.insert(tag, job.clone());
        self.emit(EngineEvent::UploadStateChanged { job }).await;

        let backend = Arc::clone(&self.backend);
        let io_tx = self.io_tx.clone();
        let upload_timeout = self.config.upload_timeout;
        let probe_timeout = self.config.probe_timeout;

        tokio::spawn(async move {
            let FileAttachment { filename, bytes } = attachment;

            let duration_ms = if probe {
                resolve_duration(&WavDurationProbe, &bytes, probe_timeout).await
            } else {
                None
            };

            let uploaded =
                tokio::time::timeout(upload_timeout, backend.upload(&filename, bytes)).await;

            let done = match uploaded {
                Ok(Ok(receipt)) => IoDone::MediaReady {
                    tag,
                    target,
                    text,
                    kind: receipt.kind,
                    media: MediaRef {
                        url: receipt.url,
                        filename: receipt.filename,
                        size: receipt.size,
                        duration_ms,
                    },
                },
                Ok(Err(err)) => IoDone::MediaFailed {
                    tag,
                    error: err.to_string(),
                },
                Err(_) => IoDone::MediaFailed {
                    tag,
                    error: "upload timed out".into(),
                },
            };
            let _ = io_tx.send(done).await;
        });
    }

    async fn create_group(&mut self, name: String, member_ids: Vec<UserId>) {
        if name.is_empty() {
            self.notify_error("group name is empty".into()).await;
            return;
        }
        if member_ids.is_empty() {
            self.notify_error("no group members selected".into()).await;
            return;
        }
        let request = CreateGroupRequest {
            name,
            member_ids,
            created_by: self.user_id.clone(),
        };
        let backend = Arc::clone(&self.backend);
        let io_tx = self.io_tx.clone();
        tokio::spawn(async move {
            let result = backend.create_group(request).await;
            let _ = io_tx.send(IoDone::GroupCreated { result }).await;
        });
    }

    /// Spawns a fire-and-forget backend mutation; the result lands back in
    /// the loop as an [`IoDone::Mutation`].
    fn spawn_mutation<F, Fut>(&self, label: &'static str, call: F)
    where
        F: FnOnce(Arc<B>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let io_tx = self.io_tx.clone();
        tokio::spawn(async move {
            let result = call(backend).await;
            let _ = io_tx.send(IoDone::Mutation { label, result }).await;
        });
    }

    /// Emits a pass-through event, queueing it when the session is down.
    async fn send_or_queue(&mut self, event: ClientEvent) {
        if let Err(err) = self.session.send(&event).await {
            tracing::debug!(%err, "queueing action");
            self.queue.push(ClientTag::new(), event);
        }
    }

    // -- backend fetches -------------------------------------------------

    /// Issues a history fetch tagged with the conversation current at
    /// dispatch time. The completion is discarded if the selection has moved
    /// on -- switching conversations never cancels the fetch, it just makes
    /// its result inert.
    fn request_history(&mut self, target: ChatTarget, purpose: HistoryPurpose) {
        let page = match purpose {
            HistoryPurpose::Page => self.store_mut(&target).next_page(),
            HistoryPurpose::Refresh => 1,
        };
        let limit = self.config.page_size;
        let timeout = self.config.request_timeout;
        let user = self.user_id.clone();
        let backend = Arc::clone(&self.backend);
        let io_tx = self.io_tx.clone();

        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(timeout, backend.fetch_history(&user, &target, page, limit))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Transport("history fetch timed out".into())),
                };
            let _ = io_tx
                .send(IoDone::History {
                    target,
                    purpose,
                    limit,
                    result,
                })
                .await;
        });
    }

    fn request_groups(&self) {
        let user = self.user_id.clone();
        let timeout = self.config.request_timeout;
        let backend = Arc::clone(&self.backend);
        let io_tx = self.io_tx.clone();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, backend.fetch_groups(&user)).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Transport("group fetch timed out".into())),
            };
            let _ = io_tx.send(IoDone::Groups { result }).await;
        });
    }

    // -- completions -----------------------------------------------------

    async fn handle_io(&mut self, done: IoDone) {
        match done {
            IoDone::History {
                target,
                purpose,
                limit,
                result,
            } => {
                // Stale-response guard: apply only to the conversation that
                // is still selected.
                if self.active.as_ref() != Some(&target) {
                    tracing::debug!(%target, "discarding history for unselected conversation");
                    return;
                }
                match result {
                    Ok(batch) => {
                        let (messages, has_more) = {
                            let store = self.store_mut(&target);
                            match purpose {
                                HistoryPurpose::Page => store.apply_page(batch, limit),
                                HistoryPurpose::Refresh => store.apply_refresh(batch),
                            }
                            (store.messages().to_vec(), store.has_more())
                        };
                        self.emit(EngineEvent::ConversationLoaded {
                            target,
                            messages,
                            has_more,
                        })
                        .await;
                    }
                    Err(err) => {
                        // The existing window stays untouched.
                        self.notify_error(format!("failed to load messages: {err}"))
                            .await;
                    }
                }
            }
            IoDone::Groups { result } => match result {
                Ok(groups) => {
                    self.groups = groups.clone();
                    self.emit(EngineEvent::RosterUpdated { groups }).await;
                }
                Err(err) => {
                    self.notify_error(format!("failed to load groups: {err}"))
                        .await;
                }
            },
            IoDone::GroupCreated { result } => match result {
                Ok(group) => {
                    tracing::info!(group_id = %group.id, name = %group.name, "group created");
                    self.request_groups();
                }
                Err(err) => {
                    self.notify_error(format!("failed to create group: {err}"))
                        .await;
                }
            },
            IoDone::Mutation { label, result } => match result {
                Ok(()) => self.request_groups(),
                Err(err) => {
                    self.notify_error(format!("failed to {label}: {err}")).await;
                }
            },
            IoDone::MediaReady {
                tag,
                target,
                text,
                kind,
                media,
            } => {
                if let Some(mut job) = self.uploads.remove(&tag) {
                    job.status = UploadStatus::Uploaded;
                    self.emit(EngineEvent::UploadStateChanged { job }).await;
                }
                self.emit_message(tag, target, text, kind, Some(media)).await;
            }
            IoDone::MediaFailed { tag, error } => {
                // The send aborts atomically: no message was ever appended.
                if let Some(mut job) = self.uploads.remove(&tag) {
                    job.status = UploadStatus::Failed;
                    self.emit(EngineEvent::UploadStateChanged { job }).await;
                }
                self.notify_error(format!("media upload failed: {error}"))
                    .await;
            }
        }
    }
}

/// Sleeps until the deadline, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The conversation a message files under, from the local user's point of
/// view: group messages key by group; direct messages key by the *other*
/// participant.
fn conversation_key(local: &UserId, message: &Message) -> ChatTarget {
    match &message.target {
        ChatTarget::Group(_) => message.target.clone(),
        ChatTarget::Direct(to) => {
            if message.sender == *local {
                ChatTarget::Direct(to.clone())
            } else {
                ChatTarget::Direct(message.sender.clone())
            }
        }
    }
}
