//! Process-wide presence tracking.
//!
//! The online set is rebuilt purely from live connection events pushed by the
//! backend; nothing is persisted. On reconnect the set resets to empty and
//! stays empty until the backend delivers a fresh snapshot, so presence is
//! always best-effort.

use std::collections::HashSet;

use chatsync_proto::group::Group;
use chatsync_proto::message::UserId;

/// Tracks which users are currently connected.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
}

impl PresenceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            online: HashSet::new(),
        }
    }

    /// Applies a presence event. Returns `true` if the set changed.
    pub fn apply(&mut self, user: &UserId, online: bool) -> bool {
        if online {
            self.online.insert(user.clone())
        } else {
            self.online.remove(user)
        }
    }

    /// Clears the set. Called on every reconnect; the backend re-delivers a
    /// snapshot afterwards.
    pub fn reset(&mut self) {
        self.online.clear();
    }

    /// Whether the given user is currently online.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.contains(user)
    }

    /// Members of the group that are currently online, in roster order.
    #[must_use]
    pub fn online_members(&self, group: &Group) -> Vec<UserId> {
        group
            .members
            .iter()
            .filter(|member| self.online.contains(member))
            .cloned()
            .collect()
    }

    /// Number of users currently online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.online.len()
    }
}
