use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use hush_types::events::LiveEvent;
use hush_types::models::UserId;

pub type ChannelId = Uuid;

/// Sending half of one open push connection.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    tx: mpsc::UnboundedSender<LiveEvent>,
}

impl ChannelHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LiveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: Uuid::new_v4(), tx }, rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn deliver(&self, event: LiveEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Registry of open push connections per user.
///
/// One mutex guards the whole map. It is held to mutate the map or to take a
/// snapshot for publishing, never while an event is handed to a channel.
#[derive(Clone, Default)]
pub struct LiveChannel {
    inner: Arc<Mutex<HashMap<UserId, Vec<ChannelHandle>>>>,
}

impl LiveChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<UserId, Vec<ChannelHandle>>> {
        // The map holds no invariant a panicking holder could break halfway.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a channel to the user's list.
    pub fn register(&self, user_id: UserId, channel: ChannelHandle) {
        let mut channels = self.channels();
        let list = channels.entry(user_id).or_default();
        list.push(channel);
        debug!("User {} now has {} live channel(s)", user_id, list.len());
    }

    /// Create a channel, register it and return its id with the receiving half.
    pub fn open(&self, user_id: UserId) -> (ChannelId, mpsc::UnboundedReceiver<LiveEvent>) {
        let (handle, rx) = ChannelHandle::new();
        let id = handle.id();
        self.register(user_id, handle);
        (id, rx)
    }

    /// Remove a channel by identity. Returns false if it was not registered.
    pub fn unregister(&self, user_id: UserId, channel_id: ChannelId) -> bool {
        let mut channels = self.channels();
        let Some(list) = channels.get_mut(&user_id) else {
            return false;
        };

        let before = list.len();
        list.retain(|c| c.id != channel_id);
        let removed = list.len() != before;

        if list.is_empty() {
            channels.remove(&user_id);
        }
        removed
    }

    /// Deliver `event` to every channel registered for `user_id`.
    ///
    /// Best effort: a closed channel does not stop delivery to the others and
    /// is dropped from the registry. Returns the number of channels reached.
    pub fn publish(&self, user_id: UserId, event: &LiveEvent) -> usize {
        let snapshot: Vec<ChannelHandle> = match self.channels().get(&user_id) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for channel in &snapshot {
            if channel.deliver(event.clone()) {
                delivered += 1;
            } else {
                dead.push(channel.id);
            }
        }

        if !dead.is_empty() {
            warn!(
                "Dropping {} closed live channel(s) for user {} during {} on conversation {}",
                dead.len(),
                user_id,
                event.kind(),
                event.conversation_id()
            );
            for id in dead {
                self.unregister(user_id, id);
            }
        }

        delivered
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.channels().get(&user_id).map_or(0, Vec::len)
    }
}
