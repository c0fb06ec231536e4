//! Group conversation types.

use serde::{Deserialize, Serialize};

use crate::message::{GroupId, Timestamp, UserId};

/// A group conversation roster.
///
/// Groups are created and mutated only by backend responses; the client never
/// infers membership changes locally. Deleted groups are tombstoned rather
/// than removed so that references from the message window stay resolvable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Unique group identifier.
    pub id: GroupId,
    /// Human-readable group name.
    pub name: String,
    /// Ordered member list. Order is preserved as created/joined.
    pub members: Vec<UserId>,
    /// The user who created the group.
    pub created_by: UserId,
    /// When the group was created.
    pub created_at: Timestamp,
    /// Tombstone: the group was deleted but the entry is retained.
    pub deleted: bool,
}

impl Group {
    /// Returns `true` if the given user is a member of this group.
    #[must_use]
    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }
}
