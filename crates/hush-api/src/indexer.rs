use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hush_crypto::keys::encrypt_for;
use hush_db::ConversationStore;
use hush_gateway::LiveChannel;
use hush_types::api::{ConversationView, MessageView};
use hush_types::events::{LiveEvent, NewMessage};
use hush_types::models::{ConversationKind, ConversationSummary, ForwardRef, Message, UserId};

use crate::error::{ServiceError, Side, SyncStep};

/// A message about to be sent. `text` is plaintext; it is encrypted once per
/// participant before anything is written.
#[derive(Debug, Clone)]
pub struct Draft {
    pub conversation_id: Uuid,
    pub text: String,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<ForwardRef>,
    pub temporary_message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Keeps both participants' summary rows consistent on every mutation.
///
/// The store cannot change a summary's ordering key in place and has no
/// cross-partition transactions. Every change is a replace that names the
/// prior row, and each side is written independently: a failure part way
/// aborts the rest and is reported as `ConversationSync`.
#[derive(Clone)]
pub struct ConversationIndexer {
    store: Arc<dyn ConversationStore>,
    live: LiveChannel,
}

impl ConversationIndexer {
    pub fn new(store: Arc<dyn ConversationStore>, live: LiveChannel) -> Self {
        Self { store, live }
    }

    /// Create (or re-create) the conversation between `caller` and `companion`
    /// and return its shared id.
    pub fn create(&self, caller: UserId, companion: UserId, secured: bool) -> Result<Uuid, ServiceError> {
        let own_prior = self
            .store
            .find_summary_by_companion(caller, companion)
            .map_err(ServiceError::sync(SyncStep::LoadSummary, Side::Sender))?;
        let their_prior = self
            .store
            .find_summary_by_companion(companion, caller)
            .map_err(ServiceError::sync(SyncStep::LoadSummary, Side::Recipient))?;

        let existing = own_prior.as_ref().or(their_prior.as_ref());
        let conversation_id = existing.map_or_else(Uuid::new_v4, |s| s.conversation_id);
        let secured = existing.map_or(secured, |s| s.secured);

        let own_key = self
            .store
            .user_key(caller)
            .map_err(ServiceError::sync(SyncStep::ResolveKey, Side::Sender))?;
        let their_key = self
            .store
            .user_key(companion)
            .map_err(ServiceError::sync(SyncStep::ResolveKey, Side::Recipient))?;

        let now = activity_time();
        let mine = reindexed(caller, companion, conversation_id, own_prior.as_ref(), secured, own_key, now);
        let theirs = reindexed(companion, caller, conversation_id, their_prior.as_ref(), secured, their_key, now);

        self.replace(own_prior.as_ref(), &mine, Side::Sender)?;
        self.replace(their_prior.as_ref(), &theirs, Side::Recipient)?;

        info!(
            "Conversation {} indexed for users {} and {} (new: {})",
            conversation_id,
            caller,
            companion,
            existing.is_none()
        );

        self.publish(caller, LiveEvent::ChatUpdate(ConversationView::from(&mine)));
        self.publish(companion, LiveEvent::ChatUpdate(ConversationView::from(&theirs)));
        Ok(conversation_id)
    }

    /// Store one message in both partitions and re-index both summaries.
    pub fn send(&self, sender: UserId, draft: Draft) -> Result<Sent, ServiceError> {
        let conversation_id = draft.conversation_id;

        // 1. Sender's row: companion, flags and the ordering key to delete.
        let own = self
            .store
            .find_summary_by_chat(sender, conversation_id)
            .map_err(ServiceError::sync(SyncStep::LoadSummary, Side::Sender))?
            .ok_or(ServiceError::NotFound("conversation"))?;
        let recipient = own.companion_id;

        // 2. Recipient's row by natural key: unread counter and ordering key.
        let theirs = self
            .store
            .find_summary_by_chat(recipient, conversation_id)
            .map_err(ServiceError::sync(SyncStep::LoadSummary, Side::Recipient))?;

        // 3. One ciphertext per participant.
        let own_key = self.message_key(sender, own.session_key.clone(), Side::Sender)?;
        let their_key = self.message_key(
            recipient,
            theirs.as_ref().and_then(|s| s.session_key.clone()),
            Side::Recipient,
        )?;
        let own_body = encrypt_for(&own_key, draft.text.as_bytes())?;
        let their_body = encrypt_for(&their_key, draft.text.as_bytes())?;

        // 4. Same id and timestamp on both sides.
        let message_id = Uuid::now_v7();
        let created_at = message_time(message_id).unwrap_or_else(activity_time);
        let own_copy = Message {
            conversation_id,
            message_id,
            sender_id: sender,
            body: own_body,
            created_at,
            reply_to: draft.reply_to,
            forwarded_from: draft.forwarded_from,
            read: false,
        };
        let their_copy = Message {
            body: their_body,
            ..own_copy.clone()
        };

        self.store
            .append_message(sender, &own_copy)
            .map_err(ServiceError::sync(SyncStep::AppendMessage, Side::Sender))?;
        self.store
            .append_message(recipient, &their_copy)
            .map_err(ServiceError::sync(SyncStep::AppendMessage, Side::Recipient))?;

        // 5. Sender has seen their own message.
        let own_next = ConversationSummary {
            unread_count: 0,
            last_message_at: Some(created_at),
            last_updated: created_at,
            ..own.clone()
        };
        self.replace(Some(&own), &own_next, Side::Sender)?;

        // 6. Recipient's counter is derived from the row read in step 2.
        let their_next = match &theirs {
            Some(prior) => ConversationSummary {
                unread_count: prior.unread_count.saturating_add(1),
                last_message_at: Some(created_at),
                last_updated: created_at,
                ..prior.clone()
            },
            None => {
                warn!(
                    "User {} has no summary for conversation {}, recreating it",
                    recipient, conversation_id
                );
                ConversationSummary {
                    owner_id: recipient,
                    companion_id: sender,
                    unread_count: 1,
                    last_message_at: Some(created_at),
                    last_updated: created_at,
                    session_key: Some(their_key),
                    ..own.clone()
                }
            }
        };
        self.replace(theirs.as_ref(), &their_next, Side::Recipient)?;

        debug!(
            "Message {} stored for {} and {} in conversation {}",
            message_id, sender, recipient, conversation_id
        );

        // 7. Fan out, each copy marked relative to its owner.
        self.publish(sender, LiveEvent::ChatUpdate(ConversationView::from(&own_next)));
        self.publish(recipient, LiveEvent::ChatUpdate(ConversationView::from(&their_next)));
        for (owner, copy) in [(sender, &own_copy), (recipient, &their_copy)] {
            self.publish(
                owner,
                LiveEvent::NewMessage(NewMessage {
                    message: MessageView::for_viewer(copy, owner),
                    temporary_message_id: draft.temporary_message_id.clone(),
                }),
            );
        }

        Ok(Sent {
            message_id,
            created_at,
        })
    }

    /// Mark a message read in both partitions and decrement the reader's
    /// unread counter, floored at zero.
    pub fn read(&self, reader: UserId, conversation_id: Uuid, message_id: Uuid) -> Result<(), ServiceError> {
        let created_at = message_time(message_id)
            .ok_or_else(|| ServiceError::Validation("message id is not a time-ordered id".into()))?;

        let own = self
            .store
            .find_summary_by_chat(reader, conversation_id)
            .map_err(ServiceError::sync(SyncStep::LoadSummary, Side::Sender))?
            .ok_or(ServiceError::NotFound("conversation"))?;
        let companion = own.companion_id;

        let sender = self
            .store
            .mark_read(reader, conversation_id, message_id, created_at)
            .map_err(ServiceError::sync(SyncStep::MarkRead, Side::Sender))?
            .ok_or(ServiceError::NotFound("message"))?;

        let mirrored = self
            .store
            .mark_read(companion, conversation_id, message_id, created_at)
            .map_err(ServiceError::sync(SyncStep::MarkRead, Side::Recipient))?;
        if mirrored.is_none() {
            warn!(
                "Message {} missing from user {}'s partition while marking read",
                message_id, companion
            );
        }

        // Reading is not activity: the ordering key stays where it is. Own
        // messages were never counted as unread.
        let own_next = if sender == reader {
            own.clone()
        } else {
            let next = ConversationSummary {
                unread_count: own.unread_count.saturating_sub(1),
                ..own.clone()
            };
            self.replace(Some(&own), &next, Side::Sender)?;
            next
        };

        let event = LiveEvent::Read {
            conversation_id,
            message_id,
            reader_id: reader,
        };
        self.publish(reader, event.clone());
        self.publish(reader, LiveEvent::ChatUpdate(ConversationView::from(&own_next)));
        self.publish(companion, event);
        Ok(())
    }

    /// Delete-then-insert under the prior row's identity.
    fn replace(
        &self,
        prior: Option<&ConversationSummary>,
        next: &ConversationSummary,
        side: Side,
    ) -> Result<(), ServiceError> {
        let prior_key = prior.map(ConversationSummary::key);
        self.store
            .upsert_summary(next.owner_id, prior_key.as_ref(), next)
            .map_err(ServiceError::sync(SyncStep::ReplaceSummary, side))
    }

    /// The key cached on the summary row, else the user's current key.
    fn message_key(&self, user: UserId, cached: Option<String>, side: Side) -> Result<String, ServiceError> {
        if let Some(key) = cached {
            return Ok(key);
        }
        self.store
            .user_key(user)
            .map_err(ServiceError::sync(SyncStep::ResolveKey, side))?
            .ok_or_else(|| ServiceError::Encryption(format!("no message key on record for user {}", user)))
    }

    fn publish(&self, user: UserId, event: LiveEvent) {
        let delivered = self.live.publish(user, &event);
        if delivered > 0 {
            debug!("{} event delivered to {} channel(s) of user {}", event.kind(), delivered, user);
        }
    }
}

fn reindexed(
    owner: UserId,
    companion: UserId,
    conversation_id: Uuid,
    prior: Option<&ConversationSummary>,
    secured: bool,
    key: Option<String>,
    now: DateTime<Utc>,
) -> ConversationSummary {
    match prior {
        Some(prior) => ConversationSummary {
            conversation_id,
            last_updated: now,
            session_key: key.or_else(|| prior.session_key.clone()),
            ..prior.clone()
        },
        None => ConversationSummary {
            owner_id: owner,
            companion_id: companion,
            conversation_id,
            kind: ConversationKind::Chat,
            secured,
            muted: false,
            unread_count: 0,
            last_message_at: None,
            last_updated: now,
            session_key: key,
        },
    }
}

/// Current time at message-id resolution, so create and send stamps compare
/// on the same scale.
fn activity_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Creation time embedded in a v7 message id.
pub fn message_time(message_id: Uuid) -> Option<DateTime<Utc>> {
    if message_id.get_version_num() != 7 {
        return None;
    }
    let (secs, nanos) = message_id.get_timestamp()?.to_unix();
    DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
}
