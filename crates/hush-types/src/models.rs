use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric user id assigned by the identity store.
pub type UserId = i64;

/// Credential record owned by the identity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub surname: String,
    pub handle: String,
    pub login: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
}

/// Fields needed to create a credential record. The id is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub surname: String,
    pub handle: String,
    pub login: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    #[default]
    Chat,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            other => Err(format!("unknown conversation kind '{}'", other)),
        }
    }
}

/// Store identity of a summary row inside its owner's partition.
///
/// `last_updated` is the ordering key. Because it is part of the identity,
/// changing it means deleting the row under this key and inserting a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryKey {
    pub last_updated: DateTime<Utc>,
    pub companion_id: UserId,
    pub conversation_id: Uuid,
}

/// One participant's view of a 1:1 conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub owner_id: UserId,
    pub companion_id: UserId,
    pub conversation_id: Uuid,
    pub kind: ConversationKind,
    pub secured: bool,
    pub muted: bool,
    pub unread_count: u32,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Ordering key: last activity time.
    pub last_updated: DateTime<Utc>,
    /// PEM public key used to encrypt message bodies destined for the owner.
    pub session_key: Option<String>,
}

impl ConversationSummary {
    pub fn key(&self) -> SummaryKey {
        SummaryKey {
            last_updated: self.last_updated,
            companion_id: self.companion_id,
            conversation_id: self.conversation_id,
        }
    }
}

/// Reference to the message a forwarded message was copied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRef {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}

/// A message row as stored in one participant's partition. The body is
/// ciphertext produced for that participant; the server never keeps plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<ForwardRef>,
    pub read: bool,
}
