use std::sync::{Mutex, MutexGuard, PoisonError};

use colloquy_storage::{ConversationId, MessageId};
use tokio_util::sync::CancellationToken;

/// Identity of one assistant stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

impl StreamKey {
    pub fn new(conversation_id: ConversationId, message_id: MessageId) -> Self {
        Self {
            conversation_id,
            message_id,
        }
    }

    fn matches(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        &self.conversation_id == conversation_id && &self.message_id == message_id
    }
}

struct ActiveStream {
    key: StreamKey,
    cancel: CancellationToken,
    cancelled: bool,
}

/// Tracks the single active stream of the application.
///
/// Starting a new stream supersedes the current one: its token is cancelled
/// before the slot is handed over.
#[derive(Default)]
pub struct StreamManager {
    slot: Mutex<Option<ActiveStream>>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key` as the active stream and returns the superseded one, if any.
    pub fn start(&self, key: StreamKey, cancel: CancellationToken) -> Option<StreamKey> {
        let previous = self.slot().replace(ActiveStream {
            key: key.clone(),
            cancel,
            cancelled: false,
        })?;

        previous.cancel.cancel();
        tracing::debug!(
            conversation_id = %previous.key.conversation_id,
            message_id = %previous.key.message_id,
            superseded_by = %key.message_id,
            "superseded active stream"
        );
        Some(previous.key)
    }

    /// Marks the active stream as user-cancelled and cancels its token.
    pub fn stop(&self) -> Option<StreamKey> {
        let mut slot = self.slot();
        let active = slot.as_mut()?;
        active.cancelled = true;
        active.cancel.cancel();
        tracing::info!(
            conversation_id = %active.key.conversation_id,
            message_id = %active.key.message_id,
            "stream stop requested"
        );
        Some(active.key.clone())
    }

    /// True only while the given stream is active and `stop` was called on it.
    pub fn was_cancelled(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|active| active.cancelled && active.key.matches(conversation_id, message_id))
    }

    /// Empties the slot if it still holds the given stream.
    ///
    /// A superseded stream clearing late leaves the newer stream untouched.
    pub fn clear(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        let removed = {
            let mut slot = self.slot();
            let owns_slot = slot
                .as_ref()
                .is_some_and(|active| active.key.matches(conversation_id, message_id));
            if owns_slot { slot.take() } else { None }
        };

        match removed {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Option<StreamKey> {
        self.slot().as_ref().map(|active| active.key.clone())
    }

    pub fn is_active(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveStream>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(conversation: &str, message: &str) -> StreamKey {
        StreamKey::new(
            ConversationId::parse(conversation).unwrap(),
            MessageId::parse(message).unwrap(),
        )
    }

    #[test]
    fn starting_a_stream_cancels_the_previous_one() {
        let manager = StreamManager::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        assert_eq!(manager.start(key("c1", "m1"), first.clone()), None);
        assert_eq!(manager.start(key("c1", "m2"), second.clone()), Some(key("c1", "m1")));

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(manager.active(), Some(key("c1", "m2")));
    }

    #[test]
    fn stop_flags_only_the_active_stream() {
        let manager = StreamManager::new();
        let token = CancellationToken::new();
        manager.start(key("c1", "m1"), token.clone());

        assert_eq!(manager.stop(), Some(key("c1", "m1")));
        assert!(token.is_cancelled());

        let target = key("c1", "m1");
        assert!(manager.was_cancelled(&target.conversation_id, &target.message_id));
        let other = key("c1", "m9");
        assert!(!manager.was_cancelled(&other.conversation_id, &other.message_id));
    }

    #[test]
    fn stop_without_an_active_stream_does_nothing() {
        let manager = StreamManager::new();
        assert_eq!(manager.stop(), None);
        assert!(!manager.is_active());
    }

    #[test]
    fn clear_ignores_stale_identities() {
        let manager = StreamManager::new();
        let token = CancellationToken::new();
        manager.start(key("c1", "m2"), token.clone());

        let stale = key("c1", "m1");
        assert!(!manager.clear(&stale.conversation_id, &stale.message_id));
        assert!(manager.is_active());
        assert!(!token.is_cancelled());

        let current = key("c1", "m2");
        assert!(manager.clear(&current.conversation_id, &current.message_id));
        assert!(!manager.is_active());
        assert!(token.is_cancelled());
        assert!(!manager.was_cancelled(&current.conversation_id, &current.message_id));
    }
}
