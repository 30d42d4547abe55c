use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use snafu::ensure;

use super::error::{ConflictSnafu, NotFoundSnafu, StorageResult};
use super::ids::ConversationId;
use super::types::Conversation;
use super::ConversationRepository;

/// Process-local repository. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    conversations: Mutex<BTreeMap<ConversationId, Conversation>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<ConversationId, Conversation>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConversationRepository for MemoryRepository {
    fn create(&self, conversation: &Conversation) -> StorageResult<()> {
        let mut entries = self.entries();
        ensure!(
            !entries.contains_key(&conversation.id),
            ConflictSnafu {
                stage: "memory-create-duplicate",
                entity: "conversation",
                details: format!("conversation '{}' already exists", conversation.id),
            }
        );
        entries.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    fn get(&self, conversation_id: &ConversationId) -> StorageResult<Option<Conversation>> {
        Ok(self.entries().get(conversation_id).cloned())
    }

    fn list(&self) -> StorageResult<Vec<Conversation>> {
        Ok(self.entries().values().cloned().collect())
    }

    fn update(&self, conversation: &Conversation) -> StorageResult<()> {
        let mut entries = self.entries();
        let Some(existing) = entries.get_mut(&conversation.id) else {
            return NotFoundSnafu {
                stage: "memory-update-missing",
                entity: "conversation",
                id: conversation.id.to_string(),
            }
            .fail();
        };
        *existing = conversation.clone();
        Ok(())
    }

    fn delete(&self, conversation_id: &ConversationId) -> StorageResult<()> {
        match self.entries().remove(conversation_id) {
            Some(_) => Ok(()),
            None => NotFoundSnafu {
                stage: "memory-delete-missing",
                entity: "conversation",
                id: conversation_id.to_string(),
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::types::{ConversationSettings, Message, MessageRole};

    fn conversation(raw_id: &str) -> Conversation {
        Conversation::new(
            ConversationId::parse(raw_id).unwrap(),
            "title",
            ConversationSettings::new("openai", "gpt-4o-mini"),
            1,
        )
    }

    #[test]
    fn create_rejects_duplicates() {
        let repository = MemoryRepository::new();
        repository.create(&conversation("conv-1")).unwrap();

        let error = repository.create(&conversation("conv-1")).unwrap_err();
        assert!(matches!(error, StorageError::Conflict { .. }));
        assert_eq!(repository.len(), 1);
    }

    #[test]
    fn update_replaces_the_stored_copy() {
        let repository = MemoryRepository::new();
        let mut stored = conversation("conv-1");
        repository.create(&stored).unwrap();

        stored.messages.push(Message::complete(
            stored.id.clone(),
            MessageRole::User,
            "hello",
            2,
        ));
        repository.update(&stored).unwrap();

        let loaded = repository.get(&stored.id).unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded, stored);
    }

    #[test]
    fn update_and_delete_report_missing_rows() {
        let repository = MemoryRepository::new();
        let missing = conversation("missing");

        assert!(matches!(
            repository.update(&missing).unwrap_err(),
            StorageError::NotFound { .. }
        ));
        assert!(matches!(
            repository.delete(&missing.id).unwrap_err(),
            StorageError::NotFound { .. }
        ));
        assert!(repository.is_empty());
    }
}
