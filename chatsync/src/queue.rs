//! Outbound queue for actions issued while the session is not connected.
//!
//! Sends attempted in any session state but `Connected` land here, keyed by
//! the message's correlation tag, and are replayed in original enqueue order
//! exactly once per entry when the session transitions back to `Connected`.

use std::collections::VecDeque;

use chatsync_proto::event::ClientEvent;
use chatsync_proto::message::ClientTag;

/// A send buffered while disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedSend {
    /// Correlation tag of the buffered action.
    pub tag: ClientTag,
    /// The event to replay on reconnect.
    pub event: ClientEvent,
}

/// FIFO buffer of sends awaiting a live session.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedSend>,
}

impl OutboundQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Appends an event, unless an entry with the same tag is already queued.
    ///
    /// Tag-deduplication guards against a retry path enqueueing the same
    /// logical send twice; replay must be exactly once per entry.
    pub fn push(&mut self, tag: ClientTag, event: ClientEvent) {
        if self.entries.iter().any(|e| e.tag == tag) {
            tracing::debug!(tag = %tag, "send already queued, ignoring duplicate");
            return;
        }
        self.entries.push_back(QueuedSend { tag, event });
    }

    /// Removes and returns all entries in enqueue order.
    pub fn drain(&mut self) -> Vec<QueuedSend> {
        self.entries.drain(..).collect()
    }

    /// Returns entries to the front of the queue, preserving their order.
    ///
    /// Used when a flush is interrupted by the transport dropping again:
    /// unreplayed entries go back where they were, ahead of anything queued
    /// in the meantime.
    pub fn requeue_front(&mut self, entries: Vec<QueuedSend>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    /// Number of buffered sends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
