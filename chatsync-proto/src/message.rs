//! Message data model for the `ChatSync` protocol.
//!
//! All types in this module appear on the wire between the client engine and
//! the backend collaborator. They are designed to be serialized with postcard
//! on the event channel and with JSON on the request/response boundary.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed text content size in bytes (64 KB).
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Server-assigned unique identifier for a message, based on UUID v7 for
/// time-ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated correlation id attached to every locally-initiated send.
///
/// The backend echoes the tag back on the confirmed [`Message`] so the engine
/// can reconcile the optimistic entry with the server-assigned [`MessageId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientTag(Uuid);

impl ClientTag {
    /// Creates a new correlation tag (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Derives the provisional [`MessageId`] used for the optimistic store
    /// entry until the server-assigned id arrives.
    #[must_use]
    pub const fn provisional_id(&self) -> MessageId {
        MessageId::from_uuid(self.0)
    }
}

impl Default for ClientTag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a user by an opaque string id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a new user identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this user id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a group conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(Uuid);

impl GroupId {
    /// Creates a new group identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `GroupId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Addresses a conversation: a direct peer or a group.
///
/// Carries both the conversation identity and its kind; there is no separate
/// kind field to drift out of sync with the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatTarget {
    /// One-to-one conversation with the given user.
    Direct(UserId),
    /// Group conversation.
    Group(GroupId),
}

impl ChatTarget {
    /// Returns `true` for group conversations.
    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// Returns the kind as the wire string used on the HTTP boundary.
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Group(_) => "group",
        }
    }
}

impl std::fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(user) => write!(f, "direct:{user}"),
            Self::Group(group) => write!(f, "group:{group}"),
        }
    }
}

/// Kind of content carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    /// Plain text.
    Text,
    /// Image attachment.
    Image,
    /// Video attachment.
    Video,
    /// Generic file attachment.
    File,
    /// Voice note.
    Voice,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
            Self::File => write!(f, "file"),
            Self::Voice => write!(f, "voice"),
        }
    }
}

/// Reference to uploaded media backing a non-text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// URL the media can be fetched from.
    pub url: String,
    /// Original filename as selected by the user.
    pub filename: String,
    /// Size of the media in bytes.
    pub size: u64,
    /// Clip duration in milliseconds, when it could be resolved.
    pub duration_ms: Option<u64>,
}

/// Delivery lifecycle of a message.
///
/// The derived ordering is load-bearing: `Pending < Sent < Delivered < Read`.
/// Status transitions only ever move forward in this order; a later event
/// carrying an earlier status is a no-op.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MessageStatus {
    /// Created locally, not yet accepted by the transport.
    Pending,
    /// Accepted by the transport (transmission, not delivery, guarantee).
    Sent,
    /// Delivery confirmed by the backend.
    Delivered,
    /// Viewed by a recipient.
    Read,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// Status as presented to the sender, which differs by conversation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    /// Direct conversations show the scalar delivery status.
    Direct(MessageStatus),
    /// Group conversations show "Read by N" -- the number of recipients who
    /// have acknowledged the message.
    ReadBy(usize),
}

/// Error returned when a message fails validation before send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Text content is empty and no media is attached.
    #[error("message content is empty")]
    Empty,
    /// Content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// A chat message as held in the conversation store and carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id (provisional, tag-derived, while optimistic).
    pub id: MessageId,
    /// Correlation tag for locally-initiated sends, echoed by the backend.
    pub tag: Option<ClientTag>,
    /// Conversation this message belongs to.
    pub target: ChatTarget,
    /// Author of the message.
    pub sender: UserId,
    /// Text content (may be empty for pure media messages).
    pub content: String,
    /// Kind of the content.
    pub kind: ContentKind,
    /// Media reference for non-text kinds.
    pub media: Option<MediaRef>,
    /// Creation time.
    pub sent_at: Timestamp,
    /// Current delivery status.
    pub status: MessageStatus,
    /// Users who have read this message (group conversations). Grow-only.
    pub read_by: BTreeSet<UserId>,
    /// Tombstone: the message was deleted but the entry is retained.
    pub deleted: bool,
}

impl Message {
    /// Validates this message for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if the text is empty and no media
    /// is attached, or [`ValidationError::TooLarge`] if the content exceeds
    /// [`MAX_CONTENT_SIZE`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.is_empty() && self.media.is_none() {
            return Err(ValidationError::Empty);
        }
        let size = self.content.len();
        if size > MAX_CONTENT_SIZE {
            return Err(ValidationError::TooLarge {
                size,
                max: MAX_CONTENT_SIZE,
            });
        }
        Ok(())
    }

    /// Merges a second delivery of the same message into this entry.
    ///
    /// Invariants: `status` never regresses and `read_by` never shrinks.
    /// Media and tombstone information is adopted when the duplicate carries
    /// more of it.
    pub fn absorb(&mut self, other: &Self) {
        if other.status > self.status {
            self.status = other.status;
        }
        for reader in &other.read_by {
            self.read_by.insert(reader.clone());
        }
        if self.media.is_none() {
            self.media = other.media.clone();
        }
        self.deleted |= other.deleted;
    }

    /// Applies a status update, ignoring anything that is not strictly later
    /// in the delivery order.
    ///
    /// Returns `true` if the status changed.
    pub fn upgrade_status(&mut self, status: MessageStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }

    /// Status as displayed to the message author.
    ///
    /// Group messages aggregate: "Read by N" counts acknowledging users other
    /// than the sender. Direct messages show the scalar status.
    #[must_use]
    pub fn display_status(&self) -> DisplayStatus {
        match self.target {
            ChatTarget::Group(_) => {
                let readers = self
                    .read_by
                    .iter()
                    .filter(|reader| **reader != self.sender)
                    .count();
                DisplayStatus::ReadBy(readers)
            }
            ChatTarget::Direct(_) => DisplayStatus::Direct(self.status),
        }
    }
}
