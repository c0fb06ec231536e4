//! Notification payloads pushed by the backend collaborator.
//!
//! Notifications are ephemeral on the client: time-to-live bookkeeping is
//! applied by the engine's dispatcher and is not part of the wire format.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{GroupId, Timestamp};

/// Unique identifier for a notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(Uuid);

impl NotificationId {
    /// Creates a new time-ordered notification identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload kinds, handled distinctly by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Unread-count snapshot. The counts are absolute and *replace* the
    /// locally-held counters; they are never added to them.
    Unread {
        /// Human-readable summary.
        content: String,
        /// Total unread direct messages for this user.
        direct: u64,
        /// Total unread group messages for this user.
        group: u64,
    },
    /// Group membership changed; the client re-fetches the full roster.
    Group {
        /// Human-readable summary.
        content: String,
        /// The group the notification concerns.
        group_id: GroupId,
    },
    /// An error surfaced to the user.
    Error {
        /// Description of the failure.
        message: String,
    },
}

/// A notification event as pushed by the backend or raised locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique identifier, used for expiry bookkeeping.
    pub id: NotificationId,
    /// The payload.
    pub kind: NotificationKind,
    /// When the notification was created.
    pub sent_at: Timestamp,
}

impl Notification {
    /// Creates a notification with a fresh id, stamped now.
    #[must_use]
    pub fn new(kind: NotificationKind) -> Self {
        Self {
            id: NotificationId::new(),
            kind,
            sent_at: Timestamp::now(),
        }
    }

    /// Convenience constructor for locally-raised error notifications.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error {
            message: message.into(),
        })
    }
}
