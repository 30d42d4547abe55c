#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colloquy_chat::{
    ChannelEventBus, ChatChunk, ChatChunkReceiver, ChatEvent, ChatGateway, ChatRequest,
    ConversationStore, GatewayError, GatewayResult, Orchestrator, SignalRegistry,
};
use colloquy_llm::BoxFuture;
use colloquy_storage::{
    Conversation, ConversationId, ConversationRepository, ConversationSettings, MemoryRepository,
    MessageId, StorageError, StorageResult,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the scripted gateway does for one `chat` call.
pub enum Script {
    /// Sends every chunk, then closes the channel.
    Chunks(Vec<ChatChunk>),
    /// Sends `first`, then waits for cancellation and sends `on_cancel` (if any) before closing.
    Hang {
        first: Vec<ChatChunk>,
        on_cancel: Option<ChatChunk>,
    },
    Fail(GatewayError),
    /// Hands out a receiver whose sender the test drives.
    Manual(ChatChunkReceiver),
    /// Never answers.
    Pending,
}

#[derive(Default)]
pub struct ScriptedGateway {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedGateway {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ChatGateway for ScriptedGateway {
    fn chat<'a>(
        &'a self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, GatewayResult<ChatChunkReceiver>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Chunks(Vec::new()));

            let (sender, receiver) = mpsc::unbounded_channel();
            match script {
                Script::Chunks(chunks) => {
                    for chunk in chunks {
                        let _ = sender.send(chunk);
                    }
                }
                Script::Hang { first, on_cancel } => {
                    for chunk in first {
                        let _ = sender.send(chunk);
                    }
                    tokio::spawn(async move {
                        cancel.cancelled().await;
                        if let Some(chunk) = on_cancel {
                            let _ = sender.send(chunk);
                        }
                    });
                }
                Script::Fail(error) => return Err(error),
                Script::Manual(manual) => return Ok(manual),
                Script::Pending => return std::future::pending().await,
            }
            Ok(receiver)
        })
    }
}

/// Memory repository whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyRepository {
    inner: MemoryRepository,
    pub fail_writes: AtomicBool,
}

impl FlakyRepository {
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

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

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub repository: Arc<dyn ConversationRepository>,
    pub gateway: Arc<ScriptedGateway>,
    pub events: mpsc::UnboundedReceiver<ChatEvent>,
}

impl Harness {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self::with_repository(Arc::new(MemoryRepository::new()), scripts, true)
    }

    pub fn without_gateway() -> Self {
        Self::with_repository(Arc::new(MemoryRepository::new()), Vec::new(), false)
    }

    pub fn with_repository(
        repository: Arc<dyn ConversationRepository>,
        scripts: Vec<Script>,
        attach_gateway: bool,
    ) -> Self {
        let gateway = Arc::new(ScriptedGateway::new(scripts));
        let (bus, events) = ChannelEventBus::new();
        let store = ConversationStore::open(repository.clone()).unwrap();
        let chat_gateway: Option<Arc<dyn ChatGateway>> = if attach_gateway {
            Some(gateway.clone())
        } else {
            None
        };

        Self {
            orchestrator: Arc::new(Orchestrator::new(
                Arc::new(store),
                chat_gateway,
                Arc::new(SignalRegistry::with_bus(Arc::new(bus))),
            )),
            repository,
            gateway,
            events,
        }
    }

    /// Adds a conversation directly through the store, without signals.
    pub fn add_conversation(&self, raw_id: &str, provider: &str) -> ConversationId {
        let id = ConversationId::parse(raw_id).unwrap();
        self.orchestrator
            .store()
            .insert_conversation(Conversation::new(
                id.clone(),
                "",
                ConversationSettings::new(provider, "m-default"),
                1_000,
            ))
            .unwrap();
        id
    }

    pub async fn next_event(&mut self) -> ChatEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a chat event")
            .expect("event bus closed")
    }

    /// Collects events up to and including the terminal one for `message_id`.
    pub async fn events_until_terminal(&mut self, message_id: &MessageId) -> Vec<ChatEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let terminal = matches!(
                &event,
                ChatEvent::StreamComplete(complete) if &complete.message_id == message_id
            ) || matches!(
                &event,
                ChatEvent::StreamError(error) if &error.message_id == message_id
            );
            seen.push(event);
            if terminal {
                return seen;
            }
        }
    }

    /// Waits for the next stream-started signal and returns its message id.
    pub async fn started_message(&mut self) -> MessageId {
        loop {
            if let ChatEvent::StreamStarted(started) = self.next_event().await {
                return started.message_id;
            }
        }
    }

    pub fn drain(&mut self) -> Vec<ChatEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

pub fn model_chunk(model: &str) -> ChatChunk {
    ChatChunk {
        model: Some(model.to_string()),
        ..ChatChunk::default()
    }
}

pub fn names(events: &[ChatEvent]) -> Vec<&'static str> {
    events.iter().map(ChatEvent::name).collect()
}

pub fn ctx() -> CancellationToken {
    CancellationToken::new()
}
