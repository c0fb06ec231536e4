//! Shared harness state: user registry, message log, and group directory.
//!
//! Everything lives in memory behind [`tokio::sync::RwLock`]s. Deleted
//! messages and groups are tombstoned rather than removed so the event
//! history stays replayable for connected clients.

use std::collections::{HashMap, HashSet};

use axum::extract::ws::Message as WsFrame;
use tokio::sync::{RwLock, mpsc};

use chatsync_proto::api::MAX_UPLOAD_SIZE;
use chatsync_proto::group::Group;
use chatsync_proto::message::{
    ChatTarget, GroupId, Message, MessageId, MessageStatus, Timestamp, UserId,
};

/// Errors returned by state mutations, mapped to HTTP statuses or error
/// events by the server layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    /// The referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The requesting user may not perform this action.
    #[error("{0}")]
    Forbidden(&'static str),

    /// The request is structurally invalid.
    #[error("{0}")]
    Invalid(&'static str),
}

/// Shared harness state.
pub struct HarnessState {
    /// Maps a connected user to the sender feeding its WebSocket writer.
    connections: RwLock<HashMap<UserId, mpsc::UnboundedSender<WsFrame>>>,
    /// Append-only message log (tombstoned on deletion).
    messages: RwLock<Vec<Message>>,
    /// Per-user hidden messages ("delete for me").
    hidden: RwLock<HashMap<MessageId, HashSet<UserId>>>,
    /// Group directory (tombstoned on deletion).
    groups: RwLock<Vec<Group>>,
    /// URLs issued by the upload endpoint; sends referencing anything else
    /// are rejected.
    uploads: RwLock<HashSet<String>>,
    /// Maximum accepted upload size in bytes.
    pub max_upload_size: u64,
}

impl Default for HarnessState {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessState {
    /// Creates empty state with the default upload size cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_upload_size(MAX_UPLOAD_SIZE)
    }

    /// Creates empty state with a custom upload size cap.
    #[must_use]
    pub fn with_max_upload_size(max_upload_size: u64) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            hidden: RwLock::new(HashMap::new()),
            groups: RwLock::new(Vec::new()),
            uploads: RwLock::new(HashSet::new()),
            max_upload_size,
        }
    }

    // -- connections -----------------------------------------------------

    /// Registers a user's connection, replacing any previous one.
    pub async fn register(
        &self,
        user: &UserId,
        sender: mpsc::UnboundedSender<WsFrame>,
    ) -> Option<mpsc::UnboundedSender<WsFrame>> {
        self.connections.write().await.insert(user.clone(), sender)
    }

    /// Removes a user's connection.
    pub async fn unregister(&self, user: &UserId) -> Option<mpsc::UnboundedSender<WsFrame>> {
        self.connections.write().await.remove(user)
    }

    /// Returns the sender for a connected user.
    pub async fn get_sender(&self, user: &UserId) -> Option<mpsc::UnboundedSender<WsFrame>> {
        self.connections.read().await.get(user).cloned()
    }

    /// Users currently connected.
    pub async fn online_users(&self) -> Vec<UserId> {
        self.connections.read().await.keys().cloned().collect()
    }

    // -- uploads ---------------------------------------------------------

    /// Records an issued upload URL.
    pub async fn record_upload(&self, url: String) {
        self.uploads.write().await.insert(url);
    }

    /// Whether the URL was issued by the upload endpoint.
    pub async fn upload_exists(&self, url: &str) -> bool {
        self.uploads.read().await.contains(url)
    }

    // -- messages --------------------------------------------------------

    /// Appends a message to the log.
    pub async fn insert_message(&self, message: Message) {
        self.messages.write().await.push(message);
    }

    /// One history page for a conversation, newest first.
    ///
    /// Offset paging: page k skips `(k-1) * limit` entries. Fetching marks
    /// the page read for the requesting user (a fetched message is a viewed
    /// message), mirroring the read-on-load behavior of the live channel.
    pub async fn history(
        &self,
        user: &UserId,
        target: &ChatTarget,
        page: u32,
        limit: usize,
    ) -> Vec<Message> {
        let hidden = self.hidden.read().await;
        let mut messages = self.messages.write().await;

        let mut matching: Vec<&mut Message> = messages
            .iter_mut()
            .filter(|m| !m.deleted)
            .filter(|m| match target {
                ChatTarget::Group(_) => m.target == *target,
                ChatTarget::Direct(other) => {
                    (m.sender == *user && m.target == ChatTarget::Direct(other.clone()))
                        || (m.sender == *other && m.target == ChatTarget::Direct(user.clone()))
                }
            })
            .filter(|m| {
                !hidden
                    .get(&m.id)
                    .is_some_and(|users| users.contains(user))
            })
            .collect();

        // Newest first. The log is append-only, so reversing before the
        // stable sort makes insertion order the tiebreak for equal
        // timestamps.
        matching.reverse();
        matching.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));

        let offset = (page.saturating_sub(1) as usize) * limit;
        let mut out = Vec::new();
        for entry in matching.into_iter().skip(offset).take(limit) {
            // Mark read for the fetching user.
            match target {
                ChatTarget::Group(_) => {
                    entry.read_by.insert(user.clone());
                }
                ChatTarget::Direct(_) => {
                    if entry.sender != *user && entry.status < MessageStatus::Read {
                        entry.status = MessageStatus::Read;
                    }
                }
            }
            out.push(entry.clone());
        }
        out
    }

    /// Marks a message read by `user`; status upgrades and `read_by` grows.
    ///
    /// Returns the updated message.
    pub async fn mark_read(&self, id: &MessageId, user: &UserId) -> Option<Message> {
        let mut messages = self.messages.write().await;
        let entry = messages.iter_mut().find(|m| m.id == *id)?;
        if entry.status < MessageStatus::Read {
            entry.status = MessageStatus::Read;
        }
        entry.read_by.insert(user.clone());
        Some(entry.clone())
    }

    /// Replaces a message's content; only the author may edit.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the message is unknown or the requester is
    /// not its author.
    pub async fn edit_message(
        &self,
        id: &MessageId,
        user: &UserId,
        content: &str,
    ) -> Result<Message, StateError> {
        let mut messages = self.messages.write().await;
        let entry = messages
            .iter_mut()
            .find(|m| m.id == *id)
            .ok_or(StateError::NotFound("message"))?;
        if entry.sender != *user {
            return Err(StateError::Forbidden(
                "only the message author can edit this message",
            ));
        }
        entry.content = content.to_string();
        Ok(entry.clone())
    }

    /// Deletes a message for everyone (author only); the entry is
    /// tombstoned.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the message is unknown or the requester is
    /// not its author.
    pub async fn delete_message(
        &self,
        id: &MessageId,
        user: &UserId,
    ) -> Result<Message, StateError> {
        let mut messages = self.messages.write().await;
        let entry = messages
            .iter_mut()
            .find(|m| m.id == *id)
            .ok_or(StateError::NotFound("message"))?;
        if entry.sender != *user {
            return Err(StateError::Forbidden(
                "only the message author can delete this message",
            ));
        }
        entry.deleted = true;
        Ok(entry.clone())
    }

    /// Hides a message for one user only.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if the message is unknown.
    pub async fn hide_message(&self, id: &MessageId, user: &UserId) -> Result<(), StateError> {
        let messages = self.messages.read().await;
        if !messages.iter().any(|m| m.id == *id) {
            return Err(StateError::NotFound("message"));
        }
        drop(messages);
        self.hidden
            .write()
            .await
            .entry(*id)
            .or_default()
            .insert(user.clone());
        Ok(())
    }

    /// Unread totals for a user: direct messages addressed to them still at
    /// `Sent`, and group messages in their groups that they have not read.
    pub async fn unread_counts(&self, user: &UserId) -> (u64, u64) {
        let groups = self.groups.read().await;
        let my_groups: HashSet<GroupId> = groups
            .iter()
            .filter(|g| !g.deleted && g.is_member(user))
            .map(|g| g.id)
            .collect();
        drop(groups);

        let messages = self.messages.read().await;
        let mut direct = 0u64;
        let mut group = 0u64;
        for m in messages.iter().filter(|m| !m.deleted) {
            match &m.target {
                ChatTarget::Direct(to) => {
                    if *to == *user && m.status == MessageStatus::Sent {
                        direct += 1;
                    }
                }
                ChatTarget::Group(gid) => {
                    if my_groups.contains(gid) && !m.read_by.contains(user) {
                        group += 1;
                    }
                }
            }
        }
        (direct, group)
    }

    // -- groups ----------------------------------------------------------

    /// Groups a user belongs to (tombstoned groups excluded).
    pub async fn groups_for(&self, user: &UserId) -> Vec<Group> {
        self.groups
            .read()
            .await
            .iter()
            .filter(|g| !g.deleted && g.is_member(user))
            .cloned()
            .collect()
    }

    /// Looks up a live group.
    pub async fn find_group(&self, id: GroupId) -> Option<Group> {
        self.groups
            .read()
            .await
            .iter()
            .find(|g| g.id == id && !g.deleted)
            .cloned()
    }

    /// Creates a group; member ids are deduplicated and the creator is
    /// always included.
    pub async fn create_group(
        &self,
        name: String,
        member_ids: Vec<UserId>,
        created_by: UserId,
    ) -> Group {
        let mut members = Vec::new();
        for member in member_ids {
            if !members.contains(&member) {
                members.push(member);
            }
        }
        if !members.contains(&created_by) {
            members.push(created_by.clone());
        }
        let group = Group {
            id: GroupId::new(),
            name,
            members,
            created_by,
            created_at: Timestamp::now(),
            deleted: false,
        };
        self.groups.write().await.push(group.clone());
        group
    }

    /// Adds a user to a group.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if the group is unknown.
    pub async fn add_member(&self, id: GroupId, user: &UserId) -> Result<Group, StateError> {
        let mut groups = self.groups.write().await;
        let group = groups
            .iter_mut()
            .find(|g| g.id == id && !g.deleted)
            .ok_or(StateError::NotFound("group"))?;
        if !group.members.contains(user) {
            group.members.push(user.clone());
        }
        Ok(group.clone())
    }

    /// Removes a user from a group, enforcing the creator rules: only the
    /// creator may remove others, and the creator cannot leave (the group
    /// must be deleted instead).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the group or member is unknown or the
    /// rules forbid the removal.
    pub async fn remove_member(
        &self,
        id: GroupId,
        user: &UserId,
        admin: Option<&UserId>,
    ) -> Result<Group, StateError> {
        let mut groups = self.groups.write().await;
        let group = groups
            .iter_mut()
            .find(|g| g.id == id && !g.deleted)
            .ok_or(StateError::NotFound("group"))?;
        if !group.members.contains(user) {
            return Err(StateError::NotFound("member"));
        }
        if let Some(admin) = admin {
            if *admin != group.created_by {
                return Err(StateError::Forbidden(
                    "only the group creator can remove members",
                ));
            }
        } else if *user == group.created_by {
            return Err(StateError::Invalid(
                "the group creator cannot leave the group; delete it instead",
            ));
        }
        group.members.retain(|m| m != user);
        Ok(group.clone())
    }

    /// Tombstones a group.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if the group is unknown.
    pub async fn delete_group(&self, id: GroupId) -> Result<Group, StateError> {
        let mut groups = self.groups.write().await;
        let group = groups
            .iter_mut()
            .find(|g| g.id == id && !g.deleted)
            .ok_or(StateError::NotFound("group"))?;
        group.deleted = true;
        Ok(group.clone())
    }
}
