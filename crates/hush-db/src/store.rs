use anyhow::Result;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD as B64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use hush_types::models::{ConversationSummary, Message, NewUser, SummaryKey, User, UserId};

use crate::models::{from_micros, to_micros};

/// Per-user partitioned conversation storage.
///
/// The backend has no multi-row transactions and cannot update a key column
/// in place. Summary rows are therefore replaced, never updated: callers pass
/// the identity of the row being replaced explicitly to `upsert_summary`.
pub trait ConversationStore: Send + Sync {
    /// Ensure the owner's partition and both row families exist. Idempotent.
    fn provision(&self, owner: UserId) -> Result<()>;

    /// Secondary lookup by conversation id.
    fn find_summary_by_chat(&self, owner: UserId, conversation_id: Uuid) -> Result<Option<ConversationSummary>>;

    /// Secondary lookup by companion. There is at most one row per companion.
    fn find_summary_by_companion(&self, owner: UserId, companion: UserId) -> Result<Option<ConversationSummary>>;

    /// Delete the row stored under `prior` (if any), then insert `summary`.
    /// The two statements are not atomic with each other.
    fn upsert_summary(&self, owner: UserId, prior: Option<&SummaryKey>, summary: &ConversationSummary) -> Result<()>;

    /// Summaries ordered by last activity, most recent first.
    fn list_summaries(
        &self,
        owner: UserId,
        page_size: u32,
        after: Option<&PageCursor>,
        secured: Option<bool>,
    ) -> Result<SummaryPage>;

    /// Insert a message row. Re-appending the same message is a no-op.
    fn append_message(&self, owner: UserId, message: &Message) -> Result<()>;

    /// Messages of one conversation, newest first.
    fn list_messages(&self, owner: UserId, conversation_id: Uuid) -> Result<Vec<Message>>;

    /// Set the read flag and return the message's sender, or `None` when no
    /// such message exists.
    fn mark_read(
        &self,
        owner: UserId,
        conversation_id: Uuid,
        message_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Option<UserId>>;

    /// Record the public key message bodies for `user` are encrypted with.
    fn set_user_key(&self, user: UserId, public_key_pem: &str) -> Result<()>;

    fn user_key(&self, user: UserId) -> Result<Option<String>>;
}

/// Credential records. Owned by the identity service; consumed read-mostly.
pub trait IdentityStore: Send + Sync {
    fn find_by_login(&self, login: &str) -> Result<Option<User>>;
    fn find_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>>;
    fn count_by_handle_or_login(&self, handle: &str, login: &str) -> Result<u64>;
    fn create(&self, user: NewUser) -> Result<User>;
}

pub struct SummaryPage {
    pub summaries: Vec<ConversationSummary>,
    /// Position after the last returned row; `None` once a page comes back empty.
    pub next: Option<PageCursor>,
}

#[derive(Debug, Error)]
#[error("malformed page cursor")]
pub struct CursorError;

/// Keyset position in a summary listing. Opaque to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    #[serde(rename = "t")]
    pub last_updated: i64,
    #[serde(rename = "c")]
    pub companion_id: UserId,
    #[serde(rename = "id")]
    pub conversation_id: Uuid,
}

impl PageCursor {
    pub fn after(summary: &ConversationSummary) -> Self {
        Self {
            last_updated: to_micros(summary.last_updated),
            companion_id: summary.companion_id,
            conversation_id: summary.conversation_id,
        }
    }

    pub fn encode(&self) -> String {
        // Serializing three plain fields cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        B64.encode(json)
    }

    pub fn decode(encoded: &str) -> std::result::Result<Self, CursorError> {
        let json = B64.decode(encoded.trim()).map_err(|_| CursorError)?;
        let cursor: Self = serde_json::from_slice(&json).map_err(|_| CursorError)?;
        from_micros(cursor.last_updated).map_err(|_| CursorError)?;
        Ok(cursor)
    }
}
