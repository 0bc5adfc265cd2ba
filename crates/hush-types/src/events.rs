use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ConversationView, MessageView};
use crate::models::UserId;

/// Frames pushed to a user's open live channels.
///
/// Serialized as `{"type": "chat-update" | "new-message" | "read", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum LiveEvent {
    /// The receiving user's summary for a conversation changed
    ChatUpdate(ConversationView),

    /// A message landed in a conversation the receiving user takes part in
    NewMessage(NewMessage),

    /// A message was marked read by `reader_id`
    Read {
        conversation_id: Uuid,
        message_id: Uuid,
        reader_id: UserId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(flatten)]
    pub message: MessageView,
    /// Client-side id of the optimistic copy, echoed back to the sender.
    pub temporary_message_id: Option<String>,
}

impl LiveEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatUpdate(_) => "chat-update",
            Self::NewMessage(_) => "new-message",
            Self::Read { .. } => "read",
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::ChatUpdate(view) => view.conversation_id,
            Self::NewMessage(m) => m.message.conversation_id,
            Self::Read { conversation_id, .. } => *conversation_id,
        }
    }
}
