//! Ephemeral notification board with per-entry expiry.
//!
//! Every notification lives for a fixed time-to-live and is then removed
//! autonomously, independent of the others -- no batching or coalescing by
//! kind. The board itself is passive: it tracks deadlines and the engine
//! loop sleeps until the earliest one.

use tokio::time::{Duration, Instant};

use chatsync_proto::notify::{Notification, NotificationId};

/// Default notification time-to-live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Process-wide unread counters, replaced wholesale by unread notifications.
///
/// The backend computes the totals; the values carried in the event are
/// absolute, never increments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounters {
    /// Total unread direct messages.
    pub direct: u64,
    /// Total unread group messages.
    pub group: u64,
}

/// Holds live notifications and their expiry deadlines.
#[derive(Debug)]
pub struct NotificationBoard {
    ttl: Duration,
    entries: Vec<(Notification, Instant)>,
}

impl NotificationBoard {
    /// Creates an empty board with the given time-to-live.
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Vec::new(),
        }
    }

    /// Posts a notification, to expire `ttl` from `now`.
    pub fn post(&mut self, notification: Notification, now: Instant) {
        self.entries.push((notification, now + self.ttl));
    }

    /// The earliest expiry deadline, if any notification is live.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|(_, deadline)| *deadline).min()
    }

    /// Removes and returns every notification whose deadline has passed.
    pub fn expire_due(&mut self, now: Instant) -> Vec<NotificationId> {
        let mut expired = Vec::new();
        self.entries.retain(|(notification, deadline)| {
            if *deadline <= now {
                expired.push(notification.id);
                false
            } else {
                true
            }
        });
        expired
    }

    /// Currently live notifications, oldest first.
    #[must_use]
    pub fn active(&self) -> Vec<&Notification> {
        self.entries.iter().map(|(n, _)| n).collect()
    }

    /// Number of live notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the board is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for NotificationBoard {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
