use std::sync::Arc;

use futures::StreamExt;
use rig::completion::{
    CompletionModel, GetTokenUsage, Message as RigMessage, ToolDefinition as RigToolDefinition,
};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::provider::{
    API_KEY_FIELD, BASE_URL_FIELD, BoxFuture, ChatOptions, ChunkError, CompletionsFailedSnafu,
    CredentialField, EmptyMessageSetSnafu, EndpointStatusSnafu, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, ProviderChunk, ProviderConfig, ProviderError, ProviderFactory,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role, Usage,
    make_chunk_channel,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

const OPENAI_CREDENTIAL_FIELDS: &[CredentialField] = &[
    CredentialField {
        name: API_KEY_FIELD,
        label: "API key",
        secret: true,
        required: true,
    },
    CredentialField {
        name: BASE_URL_FIELD,
        label: "Base URL",
        secret: false,
        required: false,
    },
];

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Builds [`RigProviderAdapter`]s for OpenAI-compatible endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct RigOpenAiFactory;

impl ProviderFactory for RigOpenAiFactory {
    fn id(&self) -> &str {
        RIG_OPENAI_PROVIDER_ID
    }

    fn credential_fields(&self) -> &[CredentialField] {
        OPENAI_CREDENTIAL_FIELDS
    }

    fn create(&self, config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
        Ok(Arc::new(RigProviderAdapter::new(config)?))
    }
}

pub struct RigProviderAdapter {
    config: ProviderConfig,
    api_key: String,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        let api_key = config
            .api_key()
            .map(str::to_string)
            .context(MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            })?;

        Ok(Self { config, api_key })
    }

    fn build_client(config: &ProviderConfig, api_key: &str) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(api_key);
        if let Some(base_url) = config.base_url() {
            builder = builder.base_url(base_url);
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn probe_models_endpoint(config: ProviderConfig, api_key: String) -> ProviderResult<()> {
        let client = Self::build_client(&config, &api_key)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();

        if !status.is_success() {
            let body = http_client::text(response).await.context(HttpClientSnafu {
                stage: "read-model-response",
            })?;
            return EndpointStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(())
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
            // Tool output is replayed as user-visible context; rig's structured tool
            // results need the originating call, which transport history does not keep.
            Role::Tool => Some(RigMessage::user(match &message.tool_call_id {
                Some(call_id) => format!("[tool result {call_id}]\n{}", message.content),
                None => format!("[tool result]\n{}", message.content),
            })),
        }
    }

    fn merged_preamble(messages: &[ProviderMessage], options: &ChatOptions) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &options.system_prompt
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig exposes a single preamble field, so system-role messages are folded into it.
        for message in messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        api_key: &str,
        messages: &[ProviderMessage],
        options: &ChatOptions,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config, api_key)?;
        let model = client.completion_model(options.model.clone());

        let mut history = messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = history.pop() else {
            tracing::warn!(
                model_id = %options.model,
                total_message_count = messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                model: options.model.clone(),
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(history);

        if let Some(preamble) = Self::merged_preamble(messages, options) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = options.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = options.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        if !options.tools.is_empty() {
            builder = builder.tools(
                options
                    .tools
                    .iter()
                    .map(|tool| RigToolDefinition {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    })
                    .collect(),
            );
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<ProviderChunk>
    where
        R: Clone + Unpin + GetTokenUsage,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(ProviderChunk::content(text.text))
            }
            StreamedAssistantContent::Final(response) => {
                let usage = response.token_usage()?;
                Some(ProviderChunk {
                    usage: Some(Self::map_usage(usage)),
                    ..ProviderChunk::default()
                })
            }
            // Requests carry no tool definitions, and reasoning would need a second block.
            StreamedAssistantContent::Text(_)
            | StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. } => None,
        }
    }

    fn map_usage(usage: rig::completion::Usage) -> Usage {
        Usage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        api_key: String,
        messages: Vec<ProviderMessage>,
        options: ChatOptions,
        chunk_tx: mpsc::UnboundedSender<ProviderChunk>,
        cancel: CancellationToken,
    ) {
        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = chunk_tx.send(ProviderChunk::error(ChunkError::cancelled()));
                return;
            }
            opened = Self::open_stream(&config, &api_key, &messages, &options) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    model_id = %options.model,
                    error = %error,
                    "failed to open provider stream"
                );
                let _ = chunk_tx.send(ProviderChunk::error(ChunkError::provider(
                    error.to_string(),
                )));
                return;
            }
        };

        let mut announced_model = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(model_id = %options.model, "provider stream cancelled");
                    stream.cancel();
                    let _ = chunk_tx.send(ProviderChunk::error(ChunkError::cancelled()));
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            let Some(mut chunk) = Self::map_stream_item(item) else {
                                continue;
                            };
                            if !announced_model {
                                chunk.model = Some(options.model.clone());
                                announced_model = true;
                            }
                            if chunk_tx.send(chunk).is_err() {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %options.model,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            let _ = chunk_tx.send(ProviderChunk::error(ChunkError::provider(
                                error.to_string(),
                            )));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let mut finish = ProviderChunk::finish("stop");
        if !announced_model {
            finish.model = Some(options.model.clone());
        }
        let _ = chunk_tx.send(finish);
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn stream_chat(
        &self,
        messages: Vec<ProviderMessage>,
        options: ChatOptions,
        cancel: CancellationToken,
    ) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                model: options.model.clone(),
            }
        );

        let (chunk_tx, chunks) = make_chunk_channel();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            self.api_key.clone(),
            messages,
            options,
            chunk_tx,
            cancel,
        ));

        Ok(ProviderStreamHandle { chunks, worker })
    }

    fn test_connection<'a>(&'a self, cancel: CancellationToken) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(ProviderError::Cancelled {
                    stage: "test-connection",
                }),
                result = Self::probe_models_endpoint(self.config.clone(), self.api_key.clone()) => result,
            }
        })
    }
}
