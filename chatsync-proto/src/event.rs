//! The bidirectional event unions for the persistent channel.
//!
//! Every frame on the event channel is one of these two enums, so the
//! receiving side dispatches on a single tagged union in arrival order
//! instead of registering per-event callbacks.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::message::{
    ChatTarget, ClientTag, ContentKind, GroupId, MediaRef, Message, MessageId, Timestamp, UserId,
};
use crate::notify::Notification;

/// Events sent from the client engine to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Handshake: the first frame on every new connection.
    Connect {
        /// The authenticating user.
        user_id: UserId,
    },
    /// Emit a new message to a conversation.
    SendMessage {
        /// Correlation tag, echoed back on the confirmed message.
        tag: ClientTag,
        /// Destination conversation.
        target: ChatTarget,
        /// Text content.
        content: String,
        /// Content kind.
        kind: ContentKind,
        /// Media reference, already uploaded out-of-band.
        media: Option<MediaRef>,
    },
    /// Acknowledge that a message has been viewed.
    MarkRead {
        /// The message being acknowledged.
        message_id: MessageId,
    },
    /// Subscribe to a group's live message stream.
    JoinGroup {
        /// The group to join.
        group_id: GroupId,
    },
    /// Replace the content of a previously sent message.
    EditMessage {
        /// The message to edit.
        message_id: MessageId,
        /// The new content.
        content: String,
    },
    /// Delete a message, for everyone or only for the requesting user.
    DeleteMessage {
        /// The message to delete.
        message_id: MessageId,
        /// `true` removes it for all participants (sender only); `false`
        /// hides it for the requesting user.
        for_everyone: bool,
    },
}

/// Events pushed from the backend to the client engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Handshake acknowledgment.
    Welcome {
        /// The authenticated user.
        user_id: UserId,
    },
    /// A new or duplicate message delivery.
    Message(Message),
    /// An ephemeral notification.
    Notification(Notification),
    /// A recipient acknowledged a message.
    ReadReceipt {
        /// The acknowledged message.
        message_id: MessageId,
        /// Who acknowledged it.
        reader: UserId,
        /// The full read set after the acknowledgment.
        read_by: BTreeSet<UserId>,
    },
    /// A message's content was replaced by its author.
    MessageEdited {
        /// The edited message.
        message_id: MessageId,
        /// The new content.
        content: String,
        /// When the edit happened.
        edited_at: Timestamp,
    },
    /// A message was deleted; the client tombstones its entry.
    MessageDeleted {
        /// The deleted message.
        message_id: MessageId,
    },
    /// A participant connected or disconnected.
    Presence {
        /// The user whose presence changed.
        user_id: UserId,
        /// `true` when the user came online.
        online: bool,
    },
    /// A request-scoped error raised by the backend.
    Error {
        /// Description of the failure.
        message: String,
    },
}
