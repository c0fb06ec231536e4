//! Per-conversation ordered message cache.
//!
//! Each conversation owns a chronologically ascending window of messages, a
//! pagination cursor, and duplicate suppression by message id. History pages
//! arrive newest-first from the backend and are normalized and prepended;
//! live messages append in timestamp order. Applying the same inbound message
//! twice merges fields without regressing status or shrinking the read set.

use std::collections::{BTreeSet, HashSet};

use chatsync_proto::message::{ChatTarget, Message, MessageId, MessageStatus, UserId};

/// Outcome of applying a live message to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveInsert {
    /// A new entry was inserted.
    Inserted,
    /// The id was already present; fields were merged.
    Merged,
    /// An optimistic entry was reconciled with its server-confirmed form.
    Reconciled,
}

/// Ordered message window for one conversation.
#[derive(Debug)]
pub struct ConversationStore {
    target: ChatTarget,
    /// Ascending by `sent_at`; ties keep insertion order.
    window: Vec<Message>,
    ids: HashSet<MessageId>,
    /// Number of history pages loaded so far.
    page: u32,
    has_more: bool,
    unread: u64,
}

impl ConversationStore {
    /// Creates an empty store for the given conversation.
    #[must_use]
    pub fn new(target: ChatTarget) -> Self {
        Self {
            target,
            window: Vec::new(),
            ids: HashSet::new(),
            page: 0,
            has_more: true,
            unread: 0,
        }
    }

    /// The conversation this store belongs to.
    #[must_use]
    pub const fn target(&self) -> &ChatTarget {
        &self.target
    }

    /// The current window, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.window
    }

    /// The page number to request next (1-based).
    #[must_use]
    pub const fn next_page(&self) -> u32 {
        self.page + 1
    }

    /// Whether an older page may exist.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    /// Local unread counter for this conversation.
    #[must_use]
    pub const fn unread(&self) -> u64 {
        self.unread
    }

    /// Increments the local unread counter.
    pub const fn note_unread(&mut self) {
        self.unread += 1;
    }

    /// Clears the local unread counter (conversation selected).
    pub const fn clear_unread(&mut self) {
        self.unread = 0;
    }

    /// Looks up a message by id.
    #[must_use]
    pub fn find(&self, id: &MessageId) -> Option<&Message> {
        self.window.iter().find(|m| m.id == *id)
    }

    /// Applies a history page returned by the backend.
    ///
    /// The batch arrives newest-first and is normalized to ascending order,
    /// then prepended to the window (paging backward loads older history).
    /// Ids already present are skipped. `has_more` is inferred from the
    /// returned count equaling the requested `limit`.
    ///
    /// A failed load never reaches this method; the window stays untouched.
    pub fn apply_page(&mut self, batch: Vec<Message>, limit: usize) {
        self.has_more = batch.len() == limit;
        self.page += 1;

        let mut older: Vec<Message> = batch
            .into_iter()
            .rev()
            .filter(|msg| !self.ids.contains(&msg.id))
            .collect();
        for msg in &older {
            self.ids.insert(msg.id);
        }
        older.append(&mut self.window);
        self.window = older;
    }

    /// Merges a newest-first refresh batch without touching the pagination
    /// cursor.
    ///
    /// Used after a reconnect to catch up on messages missed while offline;
    /// entries route through [`Self::insert_live`], so duplicates merge and
    /// optimistic entries reconcile.
    pub fn apply_refresh(&mut self, newest_first: Vec<Message>) {
        for msg in newest_first.into_iter().rev() {
            self.insert_live(msg);
        }
    }

    /// Applies a live inbound (or optimistic outbound) message.
    ///
    /// Resolution order: by id (idempotent merge), then by correlation tag
    /// (replace the optimistic entry with the confirmed one), then insert in
    /// timestamp order.
    pub fn insert_live(&mut self, msg: Message) -> LiveInsert {
        if self.ids.contains(&msg.id) {
            if let Some(entry) = self.window.iter_mut().find(|m| m.id == msg.id) {
                entry.absorb(&msg);
            }
            return LiveInsert::Merged;
        }

        if let Some(tag) = msg.tag
            && let Some(entry) = self
                .window
                .iter_mut()
                .find(|m| m.tag == Some(tag) && m.sender == msg.sender)
        {
            // Server confirmation of an optimistic entry: adopt the assigned
            // id and server fields, keeping the most advanced status and the
            // union of read sets.
            let old_id = entry.id;
            let prior_status = entry.status;
            let prior_read_by = std::mem::take(&mut entry.read_by);

            *entry = msg;
            if prior_status > entry.status {
                entry.status = prior_status;
            }
            for reader in prior_read_by {
                entry.read_by.insert(reader);
            }

            self.ids.remove(&old_id);
            self.ids.insert(entry.id);
            return LiveInsert::Reconciled;
        }

        self.ids.insert(msg.id);
        let pos = self
            .window
            .partition_point(|existing| existing.sent_at <= msg.sent_at);
        self.window.insert(pos, msg);
        LiveInsert::Inserted
    }

    /// Applies a scalar status update; only strictly-later statuses land.
    ///
    /// Returns `true` if the status changed.
    pub fn mark_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        self.window
            .iter_mut()
            .find(|m| m.id == *id)
            .is_some_and(|entry| entry.upgrade_status(status))
    }

    /// Applies a read receipt: upgrades the status and grows the read set.
    ///
    /// Returns `true` if anything changed.
    pub fn apply_read_receipt(
        &mut self,
        id: &MessageId,
        reader: &UserId,
        read_by: &BTreeSet<UserId>,
    ) -> bool {
        let Some(entry) = self.window.iter_mut().find(|m| m.id == *id) else {
            return false;
        };
        let mut changed = entry.upgrade_status(MessageStatus::Read);
        changed |= entry.read_by.insert(reader.clone());
        for user in read_by {
            changed |= entry.read_by.insert(user.clone());
        }
        changed
    }

    /// Replaces a message's content after an edit event.
    ///
    /// Returns `true` if the message was found.
    pub fn apply_edit(&mut self, id: &MessageId, content: &str) -> bool {
        self.window
            .iter_mut()
            .find(|m| m.id == *id)
            .map(|entry| entry.content = content.to_string())
            .is_some()
    }

    /// Tombstones a message after a deletion event.
    ///
    /// The entry is retained with its `deleted` flag set; only explicit
    /// deletion events (or window eviction) ever remove a message.
    pub fn apply_deleted(&mut self, id: &MessageId) -> bool {
        self.window
            .iter_mut()
            .find(|m| m.id == *id)
            .map(|entry| entry.deleted = true)
            .is_some()
    }
}
