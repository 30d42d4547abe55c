mod support;

use std::sync::Arc;

use colloquy_chat::{ChatChunk, ChatEvent, ConversationStore};
use colloquy_storage::{ConversationRepository, ConversationSettings, MessageRole, SqliteRepository};
use support::{Harness, Script, ctx};

async fn open_repository(dir: &tempfile::TempDir) -> Arc<dyn ConversationRepository> {
    let path = dir.path().join("colloquy.db");
    Arc::new(SqliteRepository::open(path.to_str().unwrap()).await.unwrap())
}

#[tokio::test]
async fn finalized_replies_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let conversation_id = {
        let mut harness = Harness::with_repository(
            open_repository(&dir).await,
            vec![Script::Chunks(vec![
                ChatChunk::content("Bonjour"),
                ChatChunk::finish("stop"),
            ])],
            true,
        );
        let conversation = harness
            .orchestrator
            .create_conversation("", ConversationSettings::new("openai", "gpt-4o-mini"))
            .unwrap();
        harness
            .orchestrator
            .send_message(&ctx(), conversation.id.as_str(), "Hello")
            .await
            .unwrap();
        let assistant_id = harness.started_message().await;
        harness.events_until_terminal(&assistant_id).await;
        conversation.id
    };

    let store = ConversationStore::open(open_repository(&dir).await).unwrap();
    let reloaded = store.get_conversation(&conversation_id).unwrap();
    assert_eq!(reloaded.title, "Hello");
    assert_eq!(reloaded.messages.len(), 2);

    let assistant = &reloaded.messages[1];
    assert_eq!(assistant.role, MessageRole::Assistant);
    assert_eq!(assistant.text(), "Bonjour");
    assert!(!assistant.is_streaming);
    let metadata = assistant.metadata.as_ref().unwrap();
    assert_eq!(metadata.provider, "openai");
    assert_eq!(metadata.model, "gpt-4o-mini");
    assert_eq!(metadata.finish_reason, "stop");
}

#[tokio::test]
async fn lifecycle_operations_are_persisted_and_signalled() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir).await;
    let mut harness = Harness::with_repository(repository.clone(), Vec::new(), true);

    let conversation = harness
        .orchestrator
        .create_conversation("Planning", ConversationSettings::new("openai", "gpt-4o-mini"))
        .unwrap();
    let id = conversation.id.as_str().to_string();

    harness.orchestrator.set_conversation_title(&id, "Trip planning").unwrap();
    harness.orchestrator.update_conversation_model(&id, "gpt-4.1").unwrap();
    harness.orchestrator.update_conversation_provider(&id, "local").unwrap();
    harness.orchestrator.delete_conversation(&id).unwrap();
    assert!(harness.orchestrator.list_conversations().is_empty());
    assert_eq!(harness.orchestrator.list_deleted_conversations().len(), 1);
    harness.orchestrator.restore_conversation(&id).unwrap();

    let stored = repository.get(&conversation.id).unwrap().unwrap();
    assert_eq!(stored.title, "Trip planning");
    assert_eq!(stored.settings.model, "gpt-4.1");
    assert_eq!(stored.settings.provider, "local");
    assert!(!stored.archived);

    harness.orchestrator.purge_conversation(&id).unwrap();
    assert!(repository.get(&conversation.id).unwrap().is_none());
    assert!(harness.orchestrator.get_conversation(&id).is_err());

    let names = harness
        .drain()
        .iter()
        .map(ChatEvent::name)
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![
            "conversation-created",
            "conversation-title-changed",
            "conversation-settings-changed",
            "conversation-settings-changed",
            "conversation-archived",
            "conversation-restored",
            "conversation-purged",
        ]
    );
}
