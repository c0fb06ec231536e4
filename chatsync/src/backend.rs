//! Request/response boundary with the backend collaborator.
//!
//! The event channel carries live traffic; everything else -- history pages,
//! uploads, group fetches and mutations -- goes through the [`Backend`] trait.
//! [`HttpBackend`] is the real implementation (JSON over HTTP);
//! [`FixtureBackend`] is an in-memory double with failure and latency
//! injection for tests.

use chatsync_proto::api::{
    CreateGroupRequest, ErrorBody, RemoveMemberRequest, UploadReceipt, content_kind_for_extension,
    file_extension,
};
use chatsync_proto::group::Group;
use chatsync_proto::message::{ChatTarget, GroupId, Message, UserId};

/// Errors from request/response calls.
///
/// These are surfaced as ephemeral notifications and never auto-retried.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request never completed (connection refused, timeout, DNS).
    #[error("request transport failure: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("request rejected ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error description from the response body, if any.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("response decode failure: {0}")]
    Decode(String),
}

/// Async request/response calls to the backend collaborator.
pub trait Backend: Send + Sync {
    /// Fetches one history page, newest-first, for the given conversation.
    ///
    /// Pages are 1-based; page k skips `(k-1) * limit` messages. The caller
    /// infers `has_more` from the returned count equaling `limit`.
    fn fetch_history(
        &self,
        user: &UserId,
        target: &ChatTarget,
        page: u32,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, BackendError>> + Send;

    /// Uploads a file, returning the stored media reference data.
    fn upload(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<UploadReceipt, BackendError>> + Send;

    /// Fetches all groups the user belongs to.
    fn fetch_groups(
        &self,
        user: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<Group>, BackendError>> + Send;

    /// Creates a group and returns it.
    fn create_group(
        &self,
        request: CreateGroupRequest,
    ) -> impl std::future::Future<Output = Result<Group, BackendError>> + Send;

    /// Adds a member to a group.
    fn add_member(
        &self,
        group: GroupId,
        user: &UserId,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;

    /// Removes a member (or lets one leave), subject to creator rules.
    fn remove_member(
        &self,
        group: GroupId,
        request: RemoveMemberRequest,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;

    /// Deletes a group (tombstoned server-side).
    fn delete_group(
        &self,
        group: GroupId,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}

/// JSON-over-HTTP implementation of [`Backend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Creates a backend client for the given base URL (no trailing slash).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Maps a non-success response to [`BackendError::Status`], extracting
    /// the error body when present.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        Err(BackendError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn transport_err(err: &reqwest::Error) -> BackendError {
        BackendError::Transport(err.to_string())
    }

    /// Conversation peer path segment: the other user for direct chats, the
    /// group id for group chats.
    fn other_segment(target: &ChatTarget) -> String {
        match target {
            ChatTarget::Direct(user) => user.to_string(),
            ChatTarget::Group(group) => group.to_string(),
        }
    }
}

impl Backend for HttpBackend {
    async fn fetch_history(
        &self,
        user: &UserId,
        target: &ChatTarget,
        page: u32,
        limit: usize,
    ) -> Result<Vec<Message>, BackendError> {
        let url = format!(
            "{}/messages/{}/{}",
            self.base_url,
            user,
            Self::other_segment(target)
        );
        let response = self
            .client
            .get(url)
            .query(&[
                ("kind", target.kind_str().to_string()),
                ("page", page.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| Self::transport_err(&e))?;
        Self::check(response)
            .await?
            .json::<Vec<Message>>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn upload(&self, filename: &str, bytes: Vec<u8>) -> Result<UploadReceipt, BackendError> {
        let url = format!("{}/upload", self.base_url);
        let response = self
            .client
            .post(url)
            .query(&[("filename", filename)])
            .body(bytes)
            .send()
            .await
            .map_err(|e| Self::transport_err(&e))?;
        Self::check(response)
            .await?
            .json::<UploadReceipt>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn fetch_groups(&self, user: &UserId) -> Result<Vec<Group>, BackendError> {
        let url = format!("{}/groups/{}", self.base_url, user);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::transport_err(&e))?;
        Self::check(response)
            .await?
            .json::<Vec<Group>>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn create_group(&self, request: CreateGroupRequest) -> Result<Group, BackendError> {
        let url = format!("{}/groups", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::transport_err(&e))?;
        Self::check(response)
            .await?
            .json::<Group>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn add_member(&self, group: GroupId, user: &UserId) -> Result<(), BackendError> {
        let url = format!("{}/groups/{}/members/{}", self.base_url, group, user);
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| Self::transport_err(&e))?;
        Self::check(response).await.map(|_| ())
    }

    async fn remove_member(
        &self,
        group: GroupId,
        request: RemoveMemberRequest,
    ) -> Result<(), BackendError> {
        let url = format!("{}/groups/{}/remove", self.base_url, group);
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::transport_err(&e))?;
        Self::check(response).await.map(|_| ())
    }

    async fn delete_group(&self, group: GroupId) -> Result<(), BackendError> {
        let url = format!("{}/groups/{}", self.base_url, group);
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| Self::transport_err(&e))?;
        Self::check(response).await.map(|_| ())
    }
}

/// In-memory [`Backend`] double with scripted data, failure injection, and
/// artificial latency. For tests.
#[derive(Debug, Default)]
pub struct FixtureBackend {
    state: tokio::sync::Mutex<FixtureState>,
}

#[derive(Debug, Default)]
struct FixtureState {
    /// Full per-conversation logs, newest-first.
    history: std::collections::HashMap<ChatTarget, Vec<Message>>,
    groups: Vec<Group>,
    fail_uploads: bool,
    history_delay: Option<tokio::time::Duration>,
}

impl FixtureBackend {
    /// Creates an empty fixture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the full newest-first history for a conversation.
    pub async fn set_history(&self, target: ChatTarget, newest_first: Vec<Message>) {
        self.state.lock().await.history.insert(target, newest_first);
    }

    /// Scripts the group roster.
    pub async fn set_groups(&self, groups: Vec<Group>) {
        self.state.lock().await.groups = groups;
    }

    /// Makes every subsequent upload fail.
    pub async fn fail_uploads(&self, fail: bool) {
        self.state.lock().await.fail_uploads = fail;
    }

    /// Delays every history fetch by the given duration.
    pub async fn delay_history(&self, delay: tokio::time::Duration) {
        self.state.lock().await.history_delay = Some(delay);
    }
}

impl Backend for FixtureBackend {
    async fn fetch_history(
        &self,
        _user: &UserId,
        target: &ChatTarget,
        page: u32,
        limit: usize,
    ) -> Result<Vec<Message>, BackendError> {
        let (delay, page_items) = {
            let state = self.state.lock().await;
            let log = state.history.get(target).cloned().unwrap_or_default();
            let offset = (page.saturating_sub(1) as usize) * limit;
            let items: Vec<Message> = log.into_iter().skip(offset).take(limit).collect();
            (state.history_delay, items)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(page_items)
    }

    async fn upload(&self, filename: &str, bytes: Vec<u8>) -> Result<UploadReceipt, BackendError> {
        let state = self.state.lock().await;
        if state.fail_uploads {
            return Err(BackendError::Status {
                status: 500,
                message: "upload rejected".into(),
            });
        }
        let Some(kind) = file_extension(filename).and_then(|ext| content_kind_for_extension(&ext))
        else {
            return Err(BackendError::Status {
                status: 400,
                message: format!("unsupported file type: {filename}"),
            });
        };
        Ok(UploadReceipt {
            url: format!("/uploads/{filename}"),
            kind,
            filename: filename.to_string(),
            size: bytes.len() as u64,
        })
    }

    async fn fetch_groups(&self, user: &UserId) -> Result<Vec<Group>, BackendError> {
        let state = self.state.lock().await;
        Ok(state
            .groups
            .iter()
            .filter(|g| g.is_member(user) && !g.deleted)
            .cloned()
            .collect())
    }

    async fn create_group(&self, request: CreateGroupRequest) -> Result<Group, BackendError> {
        let mut members = request.member_ids;
        if !members.contains(&request.created_by) {
            members.push(request.created_by.clone());
        }
        let group = Group {
            id: GroupId::new(),
            name: request.name,
            members,
            created_by: request.created_by,
            created_at: chatsync_proto::message::Timestamp::now(),
            deleted: false,
        };
        self.state.lock().await.groups.push(group.clone());
        Ok(group)
    }

    async fn add_member(&self, group: GroupId, user: &UserId) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.groups.iter_mut().find(|g| g.id == group) else {
            return Err(BackendError::Status {
                status: 404,
                message: "group not found".into(),
            });
        };
        if !entry.members.contains(user) {
            entry.members.push(user.clone());
        }
        Ok(())
    }

    async fn remove_member(
        &self,
        group: GroupId,
        request: RemoveMemberRequest,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.groups.iter_mut().find(|g| g.id == group) else {
            return Err(BackendError::Status {
                status: 404,
                message: "group not found".into(),
            });
        };
        if let Some(admin) = &request.admin_id {
            if *admin != entry.created_by {
                return Err(BackendError::Status {
                    status: 403,
                    message: "only the group creator can remove members".into(),
                });
            }
        } else if request.user_id == entry.created_by {
            return Err(BackendError::Status {
                status: 400,
                message: "the group creator cannot leave; delete the group instead".into(),
            });
        }
        entry.members.retain(|m| *m != request.user_id);
        Ok(())
    }

    async fn delete_group(&self, group: GroupId) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.groups.iter_mut().find(|g| g.id == group) else {
            return Err(BackendError::Status {
                status: 404,
                message: "group not found".into(),
            });
        };
        entry.deleted = true;
        Ok(())
    }
}
