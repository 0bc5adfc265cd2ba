/// Database row types — these map directly to SQLite rows.
/// Distinct from hush-types domain models to keep the DB layer's encoding
/// (microsecond integers, text uuids) in one place.
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use hush_types::models::{ConversationSummary, ForwardRef, Message, User, UserId};

pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub surname: String,
    pub handle: String,
    pub login: String,
    pub password: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            name: row.name,
            surname: row.surname,
            handle: row.handle,
            login: row.login,
            password_hash: row.password,
        }
    }
}

pub struct SummaryRow {
    pub owner_id: i64,
    pub last_updated: i64,
    pub companion_id: i64,
    pub chat_id: String,
    pub chat_type: String,
    pub secured: bool,
    pub muted: bool,
    pub new_msg_count: i64,
    pub last_msg_time: Option<i64>,
    pub session_key: Option<String>,
}

impl SummaryRow {
    pub fn into_summary(self) -> Result<ConversationSummary> {
        Ok(ConversationSummary {
            owner_id: self.owner_id as UserId,
            companion_id: self.companion_id as UserId,
            conversation_id: parse_uuid(&self.chat_id)?,
            kind: self.chat_type.parse().map_err(|e: String| anyhow!(e))?,
            secured: self.secured,
            muted: self.muted,
            unread_count: self.new_msg_count.max(0) as u32,
            last_message_at: self.last_msg_time.map(from_micros).transpose()?,
            last_updated: from_micros(self.last_updated)?,
            session_key: self.session_key,
        })
    }
}

pub struct MessageRow {
    pub chat_id: String,
    pub created_at: i64,
    pub message_id: String,
    pub sender_id: i64,
    pub body: String,
    pub reply_to: Option<String>,
    pub fwd_chat_id: Option<String>,
    pub fwd_message_id: Option<String>,
    pub read: bool,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        let forwarded_from = match (self.fwd_chat_id, self.fwd_message_id) {
            (Some(chat), Some(message)) => Some(ForwardRef {
                conversation_id: parse_uuid(&chat)?,
                message_id: parse_uuid(&message)?,
            }),
            _ => None,
        };

        Ok(Message {
            conversation_id: parse_uuid(&self.chat_id)?,
            message_id: parse_uuid(&self.message_id)?,
            sender_id: self.sender_id,
            body: self.body,
            created_at: from_micros(self.created_at)?,
            reply_to: self.reply_to.as_deref().map(parse_uuid).transpose()?,
            forwarded_from,
            read: self.read,
        })
    }
}

pub fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| anyhow!("Timestamp out of range: {}", micros))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    s.parse().map_err(|e| anyhow!("Corrupt uuid '{}': {}", s, e))
}
