use std::sync::Arc;
use std::time::Instant;

use colloquy_llm::{ChunkError, StatusCode, Usage};
use colloquy_storage::{
    Conversation, ConversationId, ConversationSettings, ConversationSummary, Message,
    MessageMetadata, MessageRole,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio_util::sync::CancellationToken;

use crate::error::{
    ConversationArchivedSnafu, ConversationNotFoundSnafu, CreateConversationSnafu,
    EmptyInputSnafu, OrchestratorResult, PersistMessageSnafu, UpdateConversationSnafu,
};
use crate::gateway::{ChatChunkReceiver, ChatGateway, ChatMessage, ChatOptions, ChatRequest};
use crate::signals::{
    ConversationArchived, ConversationCreated, ConversationPurged, ConversationRestored,
    ConversationSettingsChanged, ConversationTitleChanged, MessageCreated, SignalRegistry,
    StreamChunk, StreamComplete, StreamError, StreamStarted,
};
use crate::store::ConversationStore;
use crate::stream_manager::{StreamKey, StreamManager};

pub const TITLE_MAX_CHARS: usize = 50;

pub const FINISH_REASON_STOP: &str = "stop";
pub const FINISH_REASON_CANCELLED: &str = "cancelled";
pub const FINISH_REASON_ERROR: &str = "error";

/// Error recorded when a send is dropped while the gateway call is still pending.
pub const STREAM_SETUP_ABANDONED: &str = "stream setup abandoned";

/// Coordinates sends, streaming and conversation lifecycle.
pub struct Orchestrator {
    store: Arc<ConversationStore>,
    gateway: Option<Arc<dyn ChatGateway>>,
    streams: Arc<StreamManager>,
    signals: Arc<SignalRegistry>,
}

impl Orchestrator {
    /// Registers every chat signal on `signals`.
    pub fn new(
        store: Arc<ConversationStore>,
        gateway: Option<Arc<dyn ChatGateway>>,
        signals: Arc<SignalRegistry>,
    ) -> Self {
        signals.register_all();
        Self {
            store,
            gateway,
            streams: Arc::new(StreamManager::new()),
            signals,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Persists a user message and, when the conversation has a provider,
    /// starts streaming the assistant reply in the background.
    ///
    /// Returns the persisted user message as soon as the stream is launched.
    /// Cancelling `ctx` cancels the stream; callers that want a deadline
    /// cancel it when the deadline passes.
    pub async fn send_message(
        &self,
        ctx: &CancellationToken,
        conversation_id: &str,
        content: &str,
    ) -> OrchestratorResult<Message> {
        let conversation_id = parse_conversation_id(conversation_id, "send-message-validate")?;
        ensure!(
            !content.trim().is_empty(),
            EmptyInputSnafu {
                stage: "send-message-validate",
                field: "content",
            }
        );
        self.require_active(&conversation_id, "send-message-load")?;

        let user_message = self
            .store
            .add_message(&conversation_id, MessageRole::User, content)
            .context(PersistMessageSnafu {
                stage: "send-message-add-user",
                conversation_id: conversation_id.to_string(),
            })?;

        let is_first = self
            .store
            .with_conversation(&conversation_id, |conversation| {
                conversation
                    .messages
                    .first()
                    .is_some_and(|message| message.id == user_message.id)
            })
            .unwrap_or(false);
        if is_first {
            let title = derive_title(user_message.first_text().unwrap_or(content));
            if self.store.set_conversation_title(&conversation_id, &title) {
                self.signals.publish(ConversationTitleChanged {
                    conversation_id: conversation_id.clone(),
                    title,
                });
            }
        }

        self.signals.publish(MessageCreated {
            conversation_id: conversation_id.clone(),
            message: user_message.clone(),
        });

        let Some(settings) = self
            .store
            .with_conversation(&conversation_id, |conversation| conversation.settings.clone())
        else {
            return Ok(user_message);
        };
        if !settings.has_provider() {
            tracing::debug!(conversation_id = %conversation_id, "no provider configured, skipping reply");
            return Ok(user_message);
        }

        let Some(placeholder) = self
            .store
            .create_streaming_message(&conversation_id, MessageRole::Assistant)
        else {
            tracing::warn!(conversation_id = %conversation_id, "failed to create assistant placeholder");
            return Ok(user_message);
        };

        self.signals.publish(StreamStarted {
            conversation_id: conversation_id.clone(),
            message_id: placeholder.id.clone(),
            provider: settings.provider.clone(),
            model: settings.model.clone(),
        });

        let job = StreamJob {
            key: StreamKey::new(conversation_id.clone(), placeholder.id.clone()),
            provider: settings.provider.clone(),
            model: settings.model.clone(),
            started: Instant::now(),
            store: self.store.clone(),
            streams: self.streams.clone(),
            signals: self.signals.clone(),
        };

        let Some(gateway) = self.gateway.clone() else {
            job.finish(
                StreamOutcome::Failed(StreamFailure::new("chat gateway is not configured", None)),
                &ObservedStream::default(),
            );
            return Ok(user_message);
        };

        let request = self.build_request(&job.key, &settings);
        let cancel = ctx.child_token();
        self.streams.start(job.key.clone(), cancel.clone());
        // From here the placeholder is finished even if this future is dropped.
        let pending = PendingStream::new(job);

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %placeholder.id,
            provider = %settings.provider,
            model = %settings.model,
            "starting assistant stream"
        );
        match gateway.chat(request, cancel).await {
            Ok(chunks) => pending.launch(chunks),
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "chat gateway rejected request"
                );
                pending.fail(StreamFailure::new(error.to_string(), error.status_code()));
            }
        }

        Ok(user_message)
    }

    /// Cancels the active stream, if any. Returns whether one was active.
    pub fn stop_stream(&self) -> bool {
        self.streams.stop().is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.streams.is_active()
    }

    pub fn active_stream(&self) -> Option<StreamKey> {
        self.streams.active()
    }

    pub fn create_conversation(
        &self,
        title: &str,
        settings: ConversationSettings,
    ) -> OrchestratorResult<Conversation> {
        let conversation = self
            .store
            .create_conversation(title, settings)
            .context(CreateConversationSnafu {
                stage: "create-conversation",
            })?;
        tracing::info!(conversation_id = %conversation.id, "created conversation");
        self.signals.publish(ConversationCreated {
            summary: conversation.summary(),
        });
        Ok(conversation)
    }

    pub fn get_conversation(&self, conversation_id: &str) -> OrchestratorResult<Conversation> {
        let conversation_id = parse_conversation_id(conversation_id, "get-conversation")?;
        self.store
            .get_conversation(&conversation_id)
            .context(ConversationNotFoundSnafu {
                stage: "get-conversation",
                conversation_id: conversation_id.to_string(),
            })
    }

    pub fn list_conversations(&self) -> Vec<ConversationSummary> {
        self.store.list_conversations()
    }

    pub fn list_deleted_conversations(&self) -> Vec<ConversationSummary> {
        self.store.list_deleted_conversations()
    }

    pub fn set_conversation_title(&self, conversation_id: &str, title: &str) -> OrchestratorResult<()> {
        let conversation_id = parse_conversation_id(conversation_id, "set-title")?;
        ensure!(
            !title.trim().is_empty(),
            EmptyInputSnafu {
                stage: "set-title",
                field: "title",
            }
        );
        self.require_active(&conversation_id, "set-title")?;

        ensure!(
            self.store.set_conversation_title(&conversation_id, title),
            UpdateConversationSnafu {
                stage: "set-title",
                conversation_id: conversation_id.to_string(),
            }
        );
        self.signals.publish(ConversationTitleChanged {
            conversation_id,
            title: title.trim().to_string(),
        });
        Ok(())
    }

    pub fn update_conversation_model(&self, conversation_id: &str, model: &str) -> OrchestratorResult<()> {
        let conversation_id = parse_conversation_id(conversation_id, "update-model")?;
        ensure!(
            !model.trim().is_empty(),
            EmptyInputSnafu {
                stage: "update-model",
                field: "model",
            }
        );
        self.require_active(&conversation_id, "update-model")?;

        let settings = self
            .store
            .update_conversation_model(&conversation_id, model)
            .context(UpdateConversationSnafu {
                stage: "update-model",
                conversation_id: conversation_id.to_string(),
            })?;
        self.signals.publish(ConversationSettingsChanged {
            conversation_id,
            settings,
        });
        Ok(())
    }

    /// Changes the provider. An empty provider disables assistant replies.
    pub fn update_conversation_provider(&self, conversation_id: &str, provider: &str) -> OrchestratorResult<()> {
        let conversation_id = parse_conversation_id(conversation_id, "update-provider")?;
        self.require_active(&conversation_id, "update-provider")?;

        let settings = self
            .store
            .update_conversation_provider(&conversation_id, provider)
            .context(UpdateConversationSnafu {
                stage: "update-provider",
                conversation_id: conversation_id.to_string(),
            })?;
        self.signals.publish(ConversationSettingsChanged {
            conversation_id,
            settings,
        });
        Ok(())
    }

    /// Archives a conversation; see [`Self::restore_conversation`].
    pub fn delete_conversation(&self, conversation_id: &str) -> OrchestratorResult<()> {
        let conversation_id = parse_conversation_id(conversation_id, "delete-conversation")?;
        self.require_existing(&conversation_id, "delete-conversation")?;

        ensure!(
            self.store.delete_conversation(&conversation_id),
            UpdateConversationSnafu {
                stage: "delete-conversation",
                conversation_id: conversation_id.to_string(),
            }
        );
        self.signals.publish(ConversationArchived { conversation_id });
        Ok(())
    }

    pub fn restore_conversation(&self, conversation_id: &str) -> OrchestratorResult<()> {
        let conversation_id = parse_conversation_id(conversation_id, "restore-conversation")?;
        self.require_existing(&conversation_id, "restore-conversation")?;

        ensure!(
            self.store.restore_conversation(&conversation_id),
            UpdateConversationSnafu {
                stage: "restore-conversation",
                conversation_id: conversation_id.to_string(),
            }
        );
        self.signals.publish(ConversationRestored { conversation_id });
        Ok(())
    }

    /// Permanently removes a conversation, stopping its stream first.
    pub fn purge_conversation(&self, conversation_id: &str) -> OrchestratorResult<()> {
        let conversation_id = parse_conversation_id(conversation_id, "purge-conversation")?;
        self.require_existing(&conversation_id, "purge-conversation")?;

        if self
            .streams
            .active()
            .is_some_and(|key| key.conversation_id == conversation_id)
        {
            self.streams.stop();
        }

        ensure!(
            self.store.purge_conversation(&conversation_id),
            UpdateConversationSnafu {
                stage: "purge-conversation",
                conversation_id: conversation_id.to_string(),
            }
        );
        tracing::info!(conversation_id = %conversation_id, "purged conversation");
        self.signals.publish(ConversationPurged { conversation_id });
        Ok(())
    }

    fn require_existing(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> OrchestratorResult<bool> {
        self.store
            .with_conversation(conversation_id, |conversation| conversation.archived)
            .context(ConversationNotFoundSnafu {
                stage,
                conversation_id: conversation_id.to_string(),
            })
    }

    fn require_active(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> OrchestratorResult<()> {
        let archived = self.require_existing(conversation_id, stage)?;
        ensure!(
            !archived,
            ConversationArchivedSnafu {
                stage,
                conversation_id: conversation_id.to_string(),
            }
        );
        Ok(())
    }

    fn build_request(&self, key: &StreamKey, settings: &ConversationSettings) -> ChatRequest {
        let messages = self
            .store
            .with_conversation(&key.conversation_id, |conversation| {
                conversation
                    .messages
                    .iter()
                    .filter(|message| message.id != key.message_id)
                    .map(|message| {
                        ChatMessage::new(
                            message.role.as_str(),
                            message.first_text().unwrap_or_default(),
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        ChatRequest {
            provider: settings.provider.clone(),
            model: settings.model.clone(),
            messages,
            options: ChatOptions {
                temperature: settings.temperature,
                max_tokens: settings.max_tokens,
                system_prompt: settings.system_prompt.clone(),
            },
            tools: Vec::new(),
        }
    }
}

/// First [`TITLE_MAX_CHARS`] characters of `content`, with "..." when cut.
pub fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    match trimmed.char_indices().nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn parse_conversation_id(raw: &str, stage: &'static str) -> OrchestratorResult<ConversationId> {
    ConversationId::parse(raw).ok().context(EmptyInputSnafu {
        stage,
        field: "conversation_id",
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamFailure {
    message: String,
    status_code: Option<u16>,
}

impl StreamFailure {
    fn new(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }

    fn from_chunk(error: &ChunkError) -> Self {
        Self::new(error.message.clone(), error.status_code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamOutcome {
    Completed { finish_reason: String },
    Cancelled,
    Failed(StreamFailure),
}

/// Last-seen stream facts.
#[derive(Debug, Default)]
struct ObservedStream {
    model: Option<String>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

/// Everything the background consumer needs, detached from the orchestrator.
struct StreamJob {
    key: StreamKey,
    provider: String,
    model: String,
    started: Instant,
    store: Arc<ConversationStore>,
    streams: Arc<StreamManager>,
    signals: Arc<SignalRegistry>,
}

/// Releases the stream slot even if the consumer unwinds.
struct SlotGuard {
    streams: Arc<StreamManager>,
    key: StreamKey,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.streams
            .clear(&self.key.conversation_id, &self.key.message_id);
    }
}

/// Owns a job between slot registration and the hand-off to its consumer.
///
/// Dropping it before the hand-off finishes the job as failed.
struct PendingStream {
    job: Option<StreamJob>,
}

impl PendingStream {
    fn new(job: StreamJob) -> Self {
        Self { job: Some(job) }
    }

    fn launch(mut self, chunks: ChatChunkReceiver) {
        if let Some(job) = self.job.take() {
            tokio::spawn(job.consume(chunks));
        }
    }

    fn fail(mut self, failure: StreamFailure) {
        if let Some(job) = self.job.take() {
            job.finish(StreamOutcome::Failed(failure), &ObservedStream::default());
        }
    }
}

impl Drop for PendingStream {
    fn drop(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        tracing::warn!(
            conversation_id = %job.key.conversation_id,
            message_id = %job.key.message_id,
            "stream setup abandoned before the gateway answered"
        );
        job.finish(
            StreamOutcome::Failed(StreamFailure::new(STREAM_SETUP_ABANDONED, None)),
            &ObservedStream::default(),
        );
    }
}

impl StreamJob {
    async fn consume(self, mut chunks: ChatChunkReceiver) {
        let _slot = SlotGuard {
            streams: self.streams.clone(),
            key: self.key.clone(),
        };
        let mut observed = ObservedStream::default();

        let outcome = loop {
            let Some(chunk) = chunks.recv().await else {
                break self.closed_outcome(&observed);
            };

            if let Some(model) = chunk.model.filter(|model| !model.trim().is_empty()) {
                observed.model = Some(model);
            }
            if let Some(usage) = chunk.usage {
                observed.usage = Some(usage);
            }
            if let Some(reason) = chunk.finish_reason.filter(|reason| !reason.trim().is_empty()) {
                observed.finish_reason = Some(reason);
            }

            if let Some(error) = chunk.error {
                break if error.is_cancellation() {
                    StreamOutcome::Cancelled
                } else {
                    StreamOutcome::Failed(StreamFailure::from_chunk(&error))
                };
            }

            if chunk.content.is_empty() {
                continue;
            }
            if !self.store.append_to_message(
                &self.key.conversation_id,
                &self.key.message_id,
                0,
                &chunk.content,
            ) {
                break StreamOutcome::Failed(StreamFailure::new(
                    "failed to append streamed content",
                    None,
                ));
            }
            self.signals.publish(StreamChunk {
                conversation_id: self.key.conversation_id.clone(),
                message_id: self.key.message_id.clone(),
                delta: chunk.content,
            });
        };

        self.finish(outcome, &observed);
    }

    fn closed_outcome(&self, observed: &ObservedStream) -> StreamOutcome {
        if let Some(finish_reason) = observed.finish_reason.clone() {
            return StreamOutcome::Completed { finish_reason };
        }
        if self
            .streams
            .was_cancelled(&self.key.conversation_id, &self.key.message_id)
        {
            StreamOutcome::Cancelled
        } else {
            StreamOutcome::Completed {
                finish_reason: FINISH_REASON_STOP.to_string(),
            }
        }
    }

    /// Finalizes the placeholder once and publishes the single terminal signal.
    fn finish(&self, outcome: StreamOutcome, observed: &ObservedStream) {
        let metadata = self.build_metadata(&outcome, observed);
        let finalized = self.store.finalize_message(
            &self.key.conversation_id,
            &self.key.message_id,
            metadata.clone(),
        );
        self.streams
            .clear(&self.key.conversation_id, &self.key.message_id);

        if !finalized
            && self
                .store
                .with_conversation(&self.key.conversation_id, |_| ())
                .is_none()
        {
            // The conversation-purged signal already told observers the reply is gone.
            tracing::info!(
                conversation_id = %self.key.conversation_id,
                message_id = %self.key.message_id,
                "conversation removed during stream, skipping terminal signal"
            );
            return;
        }

        tracing::info!(
            conversation_id = %self.key.conversation_id,
            message_id = %self.key.message_id,
            finish_reason = %metadata.finish_reason,
            latency_ms = metadata.latency_ms,
            finalized,
            "assistant stream finished"
        );

        let failure = match outcome {
            StreamOutcome::Failed(failure) => Some(failure),
            _ if !finalized => Some(StreamFailure::new("failed to save assistant message", None)),
            _ => None,
        };

        match failure {
            Some(failure) => self.signals.publish(StreamError {
                conversation_id: self.key.conversation_id.clone(),
                message_id: self.key.message_id.clone(),
                error: failure.message,
                status_code: failure.status_code,
            }),
            None => self.signals.publish(StreamComplete {
                conversation_id: self.key.conversation_id.clone(),
                message_id: self.key.message_id.clone(),
                metadata,
            }),
        }
    }

    fn build_metadata(&self, outcome: &StreamOutcome, observed: &ObservedStream) -> MessageMetadata {
        let usage = observed.usage.unwrap_or_default();
        let total_tokens = if usage.total_tokens == 0 {
            usage.prompt_tokens.saturating_add(usage.completion_tokens)
        } else {
            usage.total_tokens
        };

        let (finish_reason, status_code, error_message) = match outcome {
            StreamOutcome::Completed { finish_reason } => (finish_reason.clone(), None, None),
            StreamOutcome::Cancelled => (FINISH_REASON_CANCELLED.to_string(), None, None),
            StreamOutcome::Failed(failure) => (
                FINISH_REASON_ERROR.to_string(),
                failure.status_code,
                Some(failure.message.clone()),
            ),
        };

        MessageMetadata {
            provider: self.provider.clone(),
            model: observed.model.clone().unwrap_or_else(|| self.model.clone()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens,
            latency_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            finish_reason,
            status_code,
            error_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use colloquy_storage::{MemoryRepository, MessageId};

    use super::*;

    #[test]
    fn short_titles_are_kept_whole() {
        assert_eq!(derive_title("  Hello  "), "Hello");
        let exact = "x".repeat(TITLE_MAX_CHARS);
        assert_eq!(derive_title(&exact), exact);
    }

    #[test]
    fn long_titles_are_cut_on_char_boundaries() {
        let long = "é".repeat(TITLE_MAX_CHARS + 10);
        let title = derive_title(&long);
        assert_eq!(title, format!("{}...", "é".repeat(TITLE_MAX_CHARS)));
    }

    fn job() -> StreamJob {
        let store = ConversationStore::open(Arc::new(MemoryRepository::new())).unwrap();
        StreamJob {
            key: StreamKey::new(
                ConversationId::parse("conv-1").unwrap(),
                MessageId::parse("msg-1").unwrap(),
            ),
            provider: "openai".to_string(),
            model: "configured".to_string(),
            started: Instant::now(),
            store: Arc::new(store),
            streams: Arc::new(StreamManager::new()),
            signals: Arc::new(SignalRegistry::detached()),
        }
    }

    #[test]
    fn metadata_fills_total_tokens_and_falls_back_to_configured_model() {
        let observed = ObservedStream {
            model: None,
            usage: Some(Usage {
                prompt_tokens: 7,
                completion_tokens: 5,
                total_tokens: 0,
            }),
            finish_reason: None,
        };
        let metadata = job().build_metadata(
            &StreamOutcome::Completed {
                finish_reason: "length".to_string(),
            },
            &observed,
        );

        assert_eq!(metadata.model, "configured");
        assert_eq!(metadata.total_tokens, 12);
        assert_eq!(metadata.finish_reason, "length");
        assert_eq!(metadata.error_message, None);
    }

    #[test]
    fn failed_outcomes_carry_error_details() {
        let observed = ObservedStream {
            model: Some("served".to_string()),
            ..ObservedStream::default()
        };
        let metadata = job().build_metadata(
            &StreamOutcome::Failed(StreamFailure::new("rate limited", Some(429))),
            &observed,
        );

        assert_eq!(metadata.model, "served");
        assert_eq!(metadata.finish_reason, FINISH_REASON_ERROR);
        assert_eq!(metadata.status_code, Some(429));
        assert_eq!(metadata.error_message.as_deref(), Some("rate limited"));
    }

    #[test]
    fn closed_streams_without_finish_reason_depend_on_stop() {
        let job = job();
        assert_eq!(
            job.closed_outcome(&ObservedStream::default()),
            StreamOutcome::Completed {
                finish_reason: FINISH_REASON_STOP.to_string()
            }
        );

        job.streams.start(job.key.clone(), CancellationToken::new());
        job.streams.stop();
        assert_eq!(
            job.closed_outcome(&ObservedStream::default()),
            StreamOutcome::Cancelled
        );
    }
}
