// Test-specific lint overrides: property tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Property tests for the message merge laws.
//!
//! Over arbitrary event orderings: delivery status never regresses through
//! the `pending < sent < delivered < read` order, and the read set never
//! loses a member.

use std::collections::BTreeSet;

use proptest::prelude::*;

use chatsync_proto::message::{
    ChatTarget, ClientTag, ContentKind, Message, MessageId, MessageStatus, Timestamp, UserId,
};

fn status_strategy() -> impl Strategy<Value = MessageStatus> {
    prop::sample::select(vec![
        MessageStatus::Pending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Read,
    ])
}

fn readers_strategy() -> impl Strategy<Value = BTreeSet<UserId>> {
    prop::collection::btree_set("[a-e]", 0..4)
        .prop_map(|names| names.into_iter().map(UserId::new).collect())
}

fn base_message() -> Message {
    Message {
        id: MessageId::new(),
        tag: Some(ClientTag::new()),
        target: ChatTarget::Direct(UserId::new("bob")),
        sender: UserId::new("alice"),
        content: "hello".into(),
        kind: ContentKind::Text,
        media: None,
        sent_at: Timestamp::from_millis(1_000),
        status: MessageStatus::Pending,
        read_by: BTreeSet::new(),
        deleted: false,
    }
}

proptest! {
    /// Applying any sequence of status updates leaves the status at the
    /// maximum seen, never lower.
    #[test]
    fn status_is_monotone_under_any_update_sequence(
        updates in prop::collection::vec(status_strategy(), 1..16)
    ) {
        let mut msg = base_message();
        let mut high_water = msg.status;

        for update in updates {
            let before = msg.status;
            msg.upgrade_status(update);
            prop_assert!(msg.status >= before, "status regressed");
            if update > high_water {
                high_water = update;
            }
            prop_assert_eq!(msg.status, high_water);
        }
    }

    /// Absorbing a duplicate delivery keeps the most advanced status and
    /// the union of read sets, regardless of order.
    #[test]
    fn absorb_takes_status_max_and_read_by_union(
        status_a in status_strategy(),
        status_b in status_strategy(),
        readers_a in readers_strategy(),
        readers_b in readers_strategy(),
    ) {
        let mut a = base_message();
        a.status = status_a;
        a.read_by = readers_a.clone();

        let mut b = base_message();
        b.id = a.id;
        b.status = status_b;
        b.read_by = readers_b.clone();

        let mut merged_ab = a.clone();
        merged_ab.absorb(&b);
        let mut merged_ba = b.clone();
        merged_ba.absorb(&a);

        let expected_status = status_a.max(status_b);
        prop_assert_eq!(merged_ab.status, expected_status);
        prop_assert_eq!(merged_ba.status, expected_status);

        let expected_readers: BTreeSet<UserId> =
            readers_a.union(&readers_b).cloned().collect();
        prop_assert_eq!(&merged_ab.read_by, &expected_readers);
        prop_assert_eq!(&merged_ba.read_by, &expected_readers);
    }

    /// Absorbing is idempotent: a second application changes nothing.
    #[test]
    fn absorb_is_idempotent(
        status in status_strategy(),
        readers in readers_strategy(),
    ) {
        let mut other = base_message();
        other.status = status;
        other.read_by = readers;

        let mut once = base_message();
        once.id = other.id;
        once.absorb(&other);
        let mut twice = once.clone();
        twice.absorb(&other);

        prop_assert_eq!(once, twice);
    }

    /// A sequence of absorbs never removes a reader observed earlier.
    #[test]
    fn read_by_never_loses_a_member(
        reader_sets in prop::collection::vec(readers_strategy(), 1..8)
    ) {
        let mut msg = base_message();
        let mut ever_seen: BTreeSet<UserId> = BTreeSet::new();

        for readers in reader_sets {
            let mut dup = msg.clone();
            dup.read_by = readers.clone();
            msg.absorb(&dup);
            ever_seen.extend(readers);

            for reader in &ever_seen {
                prop_assert!(
                    msg.read_by.contains(reader),
                    "previously-present reader disappeared"
                );
            }
        }
    }
}
