use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationKind, ConversationSummary, ForwardRef, Message, UserId};

// -- Errors --

/// Body of every failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

// -- Key exchange --

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionKeyResponse {
    pub session_id: String,
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublicKeyResponse {
    pub public_key: String,
}

// -- Auth --

/// `login` and `password` are encrypted under the session's public key.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub session_id: String,
    pub name: String,
    pub surname: String,
    pub handle: String,
    pub login: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: UserId,
}

/// `login` and `password` are encrypted under the session's public key;
/// `public_key` is the client's own PEM key, used to encrypt the token
/// and every message body destined for this user.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub session_id: String,
    pub login: String,
    pub password: String,
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
    /// Session token encrypted for the client's public key.
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub companion_id: UserId,
    #[serde(default)]
    pub secured: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    pub conversation_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListConversationsQuery {
    pub cursor: Option<String>,
    pub page_size: Option<u32>,
    pub secured: Option<bool>,
}

/// A summary as returned to its owner, enriched with the companion's profile
/// when the identity store knows them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationView {
    pub conversation_id: Uuid,
    pub companion_id: UserId,
    pub kind: ConversationKind,
    pub secured: bool,
    pub muted: bool,
    pub unread_count: u32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub companion_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub companion_surname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub companion_handle: Option<String>,
}

impl From<&ConversationSummary> for ConversationView {
    fn from(s: &ConversationSummary) -> Self {
        Self {
            conversation_id: s.conversation_id,
            companion_id: s.companion_id,
            kind: s.kind,
            secured: s.secured,
            muted: s.muted,
            unread_count: s.unread_count,
            last_message_at: s.last_message_at,
            last_updated: s.last_updated,
            companion_name: None,
            companion_surname: None,
            companion_handle: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListConversationsResponse {
    pub summaries: Vec<ConversationView>,
    pub next_cursor: Option<String>,
}

// -- Messages --

/// If `session_id` is set, `text` is encrypted under that session's key.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostMessageRequest {
    pub text: String,
    pub session_id: Option<String>,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<ForwardRef>,
    pub temporary_message_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostMessageResponse {
    pub status: String,
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub sender_id: UserId,
    /// Ciphertext for the viewer, base64.
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<ForwardRef>,
    pub read: bool,
    pub is_my_message: bool,
}

impl MessageView {
    pub fn for_viewer(message: &Message, viewer: UserId) -> Self {
        Self {
            conversation_id: message.conversation_id,
            message_id: message.message_id,
            sender_id: message.sender_id,
            body: message.body.clone(),
            created_at: message.created_at,
            reply_to: message.reply_to,
            forwarded_from: message.forwarded_from,
            read: message.read,
            is_my_message: message.sender_id == viewer,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListMessagesResponse {
    pub messages: Vec<MessageView>,
}

// -- Live channel --

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    pub token: String,
    pub session_id: Option<String>,
}
