//! Request/response bodies for the HTTP boundary.
//!
//! The event channel carries live traffic; history pages, uploads, and group
//! mutations go over plain request/response calls with JSON bodies. These
//! types are shared by the client backend and the server side.

use serde::{Deserialize, Serialize};

use crate::message::{ContentKind, UserId};

/// Default maximum upload size in bytes (5 MB).
pub const MAX_UPLOAD_SIZE: u64 = 5 * 1024 * 1024;

/// Response body of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// URL the uploaded media can be fetched from.
    pub url: String,
    /// Content kind derived from the file extension.
    pub kind: ContentKind,
    /// Original filename.
    pub filename: String,
    /// Stored size in bytes.
    pub size: u64,
}

/// Request body for creating a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    /// Group name.
    pub name: String,
    /// Initial members (deduplicated server-side).
    pub member_ids: Vec<UserId>,
    /// The creating user, always a member.
    pub created_by: UserId,
}

/// Request body for removing a member (or leaving a group).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveMemberRequest {
    /// The user to remove.
    pub user_id: UserId,
    /// When set, the requesting admin; only the group creator may remove
    /// other members. When unset, the user is leaving voluntarily.
    pub admin_id: Option<UserId>,
}

/// Error body returned by failing HTTP endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Description of the failure.
    pub error: String,
}

/// Maps a lowercase file extension to the content kind it is accepted as.
///
/// Returns `None` for unsupported extensions; such uploads are rejected.
#[must_use]
pub fn content_kind_for_extension(ext: &str) -> Option<ContentKind> {
    match ext {
        "jpg" | "jpeg" | "png" | "gif" => Some(ContentKind::Image),
        "mp4" | "mov" | "avi" => Some(ContentKind::Video),
        "pdf" | "doc" | "docx" => Some(ContentKind::File),
        "mp3" | "wav" | "ogg" | "m4a" | "webm" => Some(ContentKind::Voice),
        _ => None,
    }
}

/// Extracts the lowercase extension from a filename, if any.
#[must_use]
pub fn file_extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}
