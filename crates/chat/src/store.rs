use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use colloquy_storage::{
    Block, Conversation, ConversationId, ConversationRepository, ConversationSettings,
    ConversationSummary, Message, MessageId, MessageMetadata, MessageRole, unix_timestamp_millis,
};
use snafu::{ResultExt, ensure};

use crate::error::{
    DuplicateConversationSnafu, LoadConversationsSnafu, PersistConversationSnafu, StoreResult,
};
use crate::orchestrator::FINISH_REASON_ERROR;

/// Error recorded on placeholders that were still streaming when the store was last closed.
pub const INTERRUPTED_STREAM_MESSAGE: &str = "stream interrupted";

type ConversationEntry = Arc<Mutex<Conversation>>;

/// In-memory conversation state backed by a [`ConversationRepository`].
///
/// Each conversation sits behind its own lock, so mutations of one
/// conversation never wait on another. Persisted mutations are applied to a
/// draft first and only become visible once the repository accepted them.
pub struct ConversationStore {
    repository: Arc<dyn ConversationRepository>,
    entries: RwLock<HashMap<ConversationId, ConversationEntry>>,
}

impl ConversationStore {
    /// Loads every stored conversation, archived ones included.
    pub fn open(repository: Arc<dyn ConversationRepository>) -> StoreResult<Self> {
        let conversations = repository.list().context(LoadConversationsSnafu {
            stage: "store-open-list",
        })?;
        tracing::info!(count = conversations.len(), "loaded conversations");

        let entries = conversations
            .into_iter()
            .map(|mut conversation| {
                close_interrupted_streams(repository.as_ref(), &mut conversation);
                (conversation.id.clone(), Arc::new(Mutex::new(conversation)))
            })
            .collect();

        Ok(Self {
            repository,
            entries: RwLock::new(entries),
        })
    }

    pub fn create_conversation(
        &self,
        title: &str,
        settings: ConversationSettings,
    ) -> StoreResult<Conversation> {
        let conversation = Conversation::new(
            ConversationId::new_v7(),
            title,
            settings,
            unix_timestamp_millis(),
        );
        self.insert_conversation(conversation)
    }

    /// Persists and tracks a conversation built by the caller.
    pub fn insert_conversation(&self, conversation: Conversation) -> StoreResult<Conversation> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        ensure!(
            !entries.contains_key(&conversation.id),
            DuplicateConversationSnafu {
                stage: "store-insert-conversation",
                conversation_id: conversation.id.to_string(),
            }
        );

        self.repository
            .create(&conversation)
            .context(PersistConversationSnafu {
                stage: "store-insert-conversation",
                conversation_id: conversation.id.to_string(),
            })?;

        entries.insert(
            conversation.id.clone(),
            Arc::new(Mutex::new(conversation.clone())),
        );
        Ok(conversation)
    }

    pub fn get_conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.with_conversation(conversation_id, Conversation::clone)
    }

    /// Runs `read` against the live conversation while holding its lock.
    pub fn with_conversation<R>(
        &self,
        conversation_id: &ConversationId,
        read: impl FnOnce(&Conversation) -> R,
    ) -> Option<R> {
        let entry = self.entry(conversation_id)?;
        let conversation = lock_conversation(&entry);
        Some(read(&conversation))
    }

    /// Active conversations, most recently updated first.
    pub fn list_conversations(&self) -> Vec<ConversationSummary> {
        self.summaries(false)
    }

    /// Archived conversations, most recently updated first.
    pub fn list_deleted_conversations(&self) -> Vec<ConversationSummary> {
        self.summaries(true)
    }

    pub fn add_message(
        &self,
        conversation_id: &ConversationId,
        role: MessageRole,
        content: &str,
    ) -> Option<Message> {
        self.commit(conversation_id, "store-add-message", |conversation| {
            let created_at = conversation.next_message_timestamp(unix_timestamp_millis());
            let message = Message::complete(conversation.id.clone(), role, content, created_at);
            conversation.messages.push(message.clone());
            touch(conversation, created_at);
            Some(message)
        })
    }

    pub fn create_streaming_message(
        &self,
        conversation_id: &ConversationId,
        role: MessageRole,
    ) -> Option<Message> {
        self.commit(conversation_id, "store-create-streaming-message", |conversation| {
            let created_at = conversation.next_message_timestamp(unix_timestamp_millis());
            let message =
                Message::streaming_placeholder(conversation.id.clone(), role, created_at);
            conversation.messages.push(message.clone());
            touch(conversation, created_at);
            Some(message)
        })
    }

    /// Appends `delta` to a block of a streaming message, in memory only.
    ///
    /// `block_index` may address an existing block or the next one; the next
    /// index opens a new text block.
    pub fn append_to_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        block_index: usize,
        delta: &str,
    ) -> bool {
        let Some(entry) = self.entry(conversation_id) else {
            return false;
        };
        let mut conversation = lock_conversation(&entry);
        let Some(message) = conversation.message_mut(message_id) else {
            return false;
        };
        if !message.is_streaming {
            return false;
        }

        if let Some(block) = message.blocks.get_mut(block_index) {
            block.content.push_str(delta);
        } else if block_index == message.blocks.len() {
            message.blocks.push(Block::text(delta));
        } else {
            tracing::debug!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                block_index,
                "rejected append to non-adjacent block"
            );
            return false;
        }
        true
    }

    /// Ends streaming for a message, attaches metadata and persists the conversation.
    pub fn finalize_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        metadata: MessageMetadata,
    ) -> bool {
        self.commit(conversation_id, "store-finalize-message", |conversation| {
            let message = conversation.message_mut(message_id)?;
            if !message.is_streaming {
                return None;
            }
            message.is_streaming = false;
            message.metadata = Some(metadata);
            touch(conversation, unix_timestamp_millis());
            Some(())
        })
        .is_some()
    }

    pub fn set_conversation_title(&self, conversation_id: &ConversationId, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }

        self.commit(conversation_id, "store-set-title", |conversation| {
            conversation.title = title.to_string();
            touch(conversation, unix_timestamp_millis());
            Some(())
        })
        .is_some()
    }

    pub fn update_conversation_model(
        &self,
        conversation_id: &ConversationId,
        model: &str,
    ) -> Option<ConversationSettings> {
        self.commit(conversation_id, "store-update-model", |conversation| {
            conversation.settings.model = model.trim().to_string();
            touch(conversation, unix_timestamp_millis());
            Some(conversation.settings.clone())
        })
    }

    pub fn update_conversation_provider(
        &self,
        conversation_id: &ConversationId,
        provider: &str,
    ) -> Option<ConversationSettings> {
        self.commit(conversation_id, "store-update-provider", |conversation| {
            conversation.settings.provider = provider.trim().to_string();
            touch(conversation, unix_timestamp_millis());
            Some(conversation.settings.clone())
        })
    }

    /// Archives a conversation. It stays loadable and can be restored.
    pub fn delete_conversation(&self, conversation_id: &ConversationId) -> bool {
        self.set_archived(conversation_id, true, "store-archive-conversation")
    }

    pub fn restore_conversation(&self, conversation_id: &ConversationId) -> bool {
        self.set_archived(conversation_id, false, "store-restore-conversation")
    }

    /// Removes a conversation from memory and storage for good.
    pub fn purge_conversation(&self, conversation_id: &ConversationId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(conversation_id) {
            return false;
        }

        if let Err(error) = self.repository.delete(conversation_id) {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %error,
                "failed to purge conversation"
            );
            return false;
        }

        entries.remove(conversation_id);
        true
    }

    fn set_archived(&self, conversation_id: &ConversationId, archived: bool, stage: &'static str) -> bool {
        self.commit(conversation_id, stage, |conversation| {
            conversation.archived = archived;
            touch(conversation, unix_timestamp_millis());
            Some(())
        })
        .is_some()
    }

    fn entry(&self, conversation_id: &ConversationId) -> Option<ConversationEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
    }

    fn summaries(&self, archived: bool) -> Vec<ConversationSummary> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut summaries = entries
            .iter()
            .map(|entry| lock_conversation(entry).summary())
            .filter(|summary| summary.archived == archived)
            .collect::<Vec<_>>();
        summaries.sort_by(|left, right| {
            right
                .updated_at_unix_ms
                .cmp(&left.updated_at_unix_ms)
                .then_with(|| right.id.cmp(&left.id))
        });
        summaries
    }

    /// Applies `apply` to a draft copy, persists it, then publishes it.
    ///
    /// `apply` returning `None` or a failed write leaves the live state untouched.
    fn commit<R>(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
        apply: impl FnOnce(&mut Conversation) -> Option<R>,
    ) -> Option<R> {
        let entry = self.entry(conversation_id)?;
        let mut current = lock_conversation(&entry);
        let mut draft = current.clone();
        let result = apply(&mut draft)?;

        if let Err(error) = self.repository.update(&draft) {
            tracing::warn!(
                stage,
                conversation_id = %conversation_id,
                error = %error,
                "failed to persist conversation change"
            );
            return None;
        }

        *current = draft;
        Some(result)
    }
}

/// Marks placeholders left streaming by a previous run as failed and persists them.
fn close_interrupted_streams(repository: &dyn ConversationRepository, conversation: &mut Conversation) {
    let settings = conversation.settings.clone();
    let mut closed = 0_usize;
    for message in conversation
        .messages
        .iter_mut()
        .filter(|message| message.is_streaming)
    {
        message.is_streaming = false;
        message.metadata = Some(MessageMetadata {
            provider: settings.provider.clone(),
            model: settings.model.clone(),
            finish_reason: FINISH_REASON_ERROR.to_string(),
            error_message: Some(INTERRUPTED_STREAM_MESSAGE.to_string()),
            ..MessageMetadata::default()
        });
        closed += 1;
    }
    if closed == 0 {
        return;
    }

    tracing::warn!(
        conversation_id = %conversation.id,
        closed,
        "closed streams interrupted by a previous run"
    );
    if let Err(error) = repository.update(conversation) {
        tracing::warn!(
            conversation_id = %conversation.id,
            error = %error,
            "failed to persist closed streams"
        );
    }
}

fn lock_conversation(entry: &Mutex<Conversation>) -> MutexGuard<'_, Conversation> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn touch(conversation: &mut Conversation, now_unix_ms: u64) {
    conversation.updated_at_unix_ms = conversation.updated_at_unix_ms.max(now_unix_ms);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use colloquy_storage::{MemoryRepository, StorageError, StorageResult};

    use super::*;

    /// Memory repository whose writes can be switched to fail.
    #[derive(Default)]
    struct FlakyRepository {
        inner: MemoryRepository,
        fail_writes: AtomicBool,
    }

    impl FlakyRepository {
        fn check(&self) -> StorageResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::InvariantViolation {
                    stage: "flaky-write",
                    details: "disk full".to_string(),
                });
            }
            Ok(())
        }
    }

    impl ConversationRepository for FlakyRepository {
        fn create(&self, conversation: &Conversation) -> StorageResult<()> {
            self.check()?;
            self.inner.create(conversation)
        }

        fn get(&self, conversation_id: &ConversationId) -> StorageResult<Option<Conversation>> {
            self.inner.get(conversation_id)
        }

        fn list(&self) -> StorageResult<Vec<Conversation>> {
            self.inner.list()
        }

        fn update(&self, conversation: &Conversation) -> StorageResult<()> {
            self.check()?;
            self.inner.update(conversation)
        }

        fn delete(&self, conversation_id: &ConversationId) -> StorageResult<()> {
            self.check()?;
            self.inner.delete(conversation_id)
        }
    }

    fn conversation_id(raw: &str) -> ConversationId {
        ConversationId::parse(raw).unwrap()
    }

    fn store_with(raw_id: &str) -> (ConversationStore, Arc<FlakyRepository>) {
        let repository = Arc::new(FlakyRepository::default());
        let store = ConversationStore::open(repository.clone()).unwrap();
        store
            .insert_conversation(Conversation::new(
                conversation_id(raw_id),
                "",
                ConversationSettings::new("openai", "gpt-4o-mini"),
                1_000,
            ))
            .unwrap();
        (store, repository)
    }

    #[test]
    fn open_loads_existing_conversations() {
        let repository = Arc::new(MemoryRepository::new());
        repository
            .create(&Conversation::new(
                conversation_id("persisted"),
                "Kept",
                ConversationSettings::default(),
                10,
            ))
            .unwrap();

        let store = ConversationStore::open(repository).unwrap();
        let loaded = store.get_conversation(&conversation_id("persisted")).unwrap();
        assert_eq!(loaded.title, "Kept");
    }

    #[test]
    fn reopening_closes_streams_left_open() {
        let repository = Arc::new(MemoryRepository::new());
        let id = conversation_id("conv-1");
        let placeholder_id = {
            let store = ConversationStore::open(repository.clone()).unwrap();
            store
                .insert_conversation(Conversation::new(
                    id.clone(),
                    "",
                    ConversationSettings::new("openai", "gpt-4o-mini"),
                    1_000,
                ))
                .unwrap();
            store.add_message(&id, MessageRole::User, "Hello").unwrap();
            let placeholder = store
                .create_streaming_message(&id, MessageRole::Assistant)
                .unwrap();
            assert!(store.append_to_message(&id, &placeholder.id, 0, "partial"));
            placeholder.id
        };

        let store = ConversationStore::open(repository.clone()).unwrap();
        for conversation in [
            store.get_conversation(&id).unwrap(),
            repository.get(&id).unwrap().unwrap(),
        ] {
            let assistant = conversation.message(&placeholder_id).unwrap();
            assert!(!assistant.is_streaming);
            let metadata = assistant.metadata.as_ref().unwrap();
            assert_eq!(metadata.finish_reason, FINISH_REASON_ERROR);
            assert_eq!(metadata.error_message.as_deref(), Some(INTERRUPTED_STREAM_MESSAGE));
            assert_eq!(metadata.model, "gpt-4o-mini");
            assert!(conversation.messages[0].metadata.is_none());
        }
        assert!(!store.append_to_message(&id, &placeholder_id, 0, "late"));
    }

    #[test]
    fn duplicate_conversations_are_rejected() {
        let (store, _) = store_with("conv-1");
        let error = store
            .insert_conversation(Conversation::new(
                conversation_id("conv-1"),
                "again",
                ConversationSettings::default(),
                1,
            ))
            .unwrap_err();
        assert!(matches!(error, crate::StoreError::DuplicateConversation { .. }));
    }

    #[test]
    fn added_messages_are_persisted_in_order() {
        let (store, repository) = store_with("conv-1");
        let id = conversation_id("conv-1");

        let first = store.add_message(&id, MessageRole::User, "one").unwrap();
        let second = store.add_message(&id, MessageRole::User, "two").unwrap();
        assert!(second.created_at_unix_ms >= first.created_at_unix_ms);

        let stored = repository.get(&id).unwrap().unwrap();
        let texts = stored.messages.iter().map(Message::text).collect::<Vec<_>>();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn failed_writes_leave_memory_unchanged() {
        let (store, repository) = store_with("conv-1");
        let id = conversation_id("conv-1");
        repository.fail_writes.store(true, Ordering::SeqCst);

        assert!(store.add_message(&id, MessageRole::User, "lost").is_none());
        assert!(!store.set_conversation_title(&id, "Renamed"));

        let conversation = store.get_conversation(&id).unwrap();
        assert!(conversation.messages.is_empty());
        assert_eq!(conversation.title, "New Conversation");
    }

    #[test]
    fn appends_stay_in_memory_until_finalized() {
        let (store, repository) = store_with("conv-1");
        let id = conversation_id("conv-1");
        let placeholder = store
            .create_streaming_message(&id, MessageRole::Assistant)
            .unwrap();

        assert!(store.append_to_message(&id, &placeholder.id, 0, "Hel"));
        assert!(store.append_to_message(&id, &placeholder.id, 0, "lo"));
        assert!(!store.append_to_message(&id, &placeholder.id, 5, "gap"));

        let persisted = repository.get(&id).unwrap().unwrap();
        assert_eq!(persisted.messages[0].text(), "");

        let metadata = MessageMetadata {
            finish_reason: "stop".to_string(),
            ..MessageMetadata::default()
        };
        assert!(store.finalize_message(&id, &placeholder.id, metadata.clone()));
        assert!(!store.finalize_message(&id, &placeholder.id, metadata));
        assert!(!store.append_to_message(&id, &placeholder.id, 0, "late"));

        let persisted = repository.get(&id).unwrap().unwrap();
        assert_eq!(persisted.messages[0].text(), "Hello");
        assert!(!persisted.messages[0].is_streaming);
    }

    #[test]
    fn failed_finalize_keeps_the_message_streaming() {
        let (store, repository) = store_with("conv-1");
        let id = conversation_id("conv-1");
        let placeholder = store
            .create_streaming_message(&id, MessageRole::Assistant)
            .unwrap();
        repository.fail_writes.store(true, Ordering::SeqCst);

        assert!(!store.finalize_message(&id, &placeholder.id, MessageMetadata::default()));
        let conversation = store.get_conversation(&id).unwrap();
        assert!(conversation.messages[0].is_streaming);
    }

    #[test]
    fn archive_restore_and_purge() {
        let (store, repository) = store_with("conv-1");
        let id = conversation_id("conv-1");

        assert!(store.delete_conversation(&id));
        assert!(store.list_conversations().is_empty());
        assert_eq!(store.list_deleted_conversations().len(), 1);
        assert!(repository.get(&id).unwrap().unwrap().archived);

        assert!(store.restore_conversation(&id));
        assert_eq!(store.list_conversations().len(), 1);

        assert!(store.purge_conversation(&id));
        assert!(store.get_conversation(&id).is_none());
        assert!(repository.get(&id).unwrap().is_none());
        assert!(!store.purge_conversation(&id));
    }

    #[test]
    fn summaries_are_sorted_by_recent_activity() {
        let (store, _) = store_with("older");
        store
            .insert_conversation(Conversation::new(
                conversation_id("newer"),
                "",
                ConversationSettings::default(),
                9_000_000_000_000,
            ))
            .unwrap();

        let ids = store
            .list_conversations()
            .into_iter()
            .map(|summary| summary.id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["newer", "older"]);
    }

    #[test]
    fn settings_updates_are_trimmed() {
        let (store, _) = store_with("conv-1");
        let id = conversation_id("conv-1");

        let settings = store.update_conversation_model(&id, " gpt-4.1 ").unwrap();
        assert_eq!(settings.model, "gpt-4.1");
        let settings = store.update_conversation_provider(&id, "  ").unwrap();
        assert!(!settings.has_provider());
        assert!(store.update_conversation_model(&conversation_id("missing"), "x").is_none());
    }
}
