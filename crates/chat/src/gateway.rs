use std::sync::Arc;

use colloquy_llm::{
    BoxFuture, ChatOptions as ProviderChatOptions, ChunkError, ChunkErrorKind, LlmProvider,
    ProviderChunk, ProviderError, ProviderMessage, ProviderRegistry, Role, StatusCode, ToolCall,
    ToolDefinition, Usage,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::secrets::{SecretError, SecretStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTool {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Transport-level request handed to a [`ChatGateway`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub options: ChatOptions,
    #[serde(default)]
    pub tools: Vec<ChatTool>,
}

/// Transport-level stream unit; mirrors [`ProviderChunk`] one to one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub error: Option<ChunkError>,
}

impl ChatChunk {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn finish(finish_reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(finish_reason.into()),
            ..Self::default()
        }
    }

    pub fn error(error: ChunkError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Converts a provider chunk, tagging provider failures seen after
    /// cancellation as cancellations.
    fn from_provider(chunk: ProviderChunk, cancel: &CancellationToken) -> Self {
        let error = chunk.error.map(|error| {
            if error.kind == ChunkErrorKind::Provider && cancel.is_cancelled() {
                ChunkError {
                    kind: ChunkErrorKind::Cancelled,
                    ..error
                }
            } else {
                error
            }
        });

        Self {
            content: chunk.content,
            model: chunk.model,
            tool_calls: chunk.tool_calls,
            finish_reason: chunk.finish_reason,
            usage: chunk.usage,
            error,
        }
    }
}

pub type ChatChunkReceiver = mpsc::UnboundedReceiver<ChatChunk>;
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GatewayError {
    #[snafu(display("provider '{provider}' could not be resolved: {source}"))]
    ResolveProvider {
        stage: &'static str,
        provider: String,
        source: ProviderError,
    },
    #[snafu(display("provider '{provider}' requires secret '{field}'"))]
    MissingSecret {
        stage: &'static str,
        provider: String,
        field: String,
    },
    #[snafu(display("failed to read secret '{field}' for provider '{provider}': {source}"))]
    ReadSecret {
        stage: &'static str,
        provider: String,
        field: String,
        source: SecretError,
    },
    #[snafu(display("unsupported message role '{role}'"))]
    UnsupportedRole { stage: &'static str, role: String },
    #[snafu(display("provider request failed on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
}

impl StatusCode for GatewayError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Provider { source, .. } => source.status_code(),
            Self::MissingSecret { .. } => Some(401),
            _ => None,
        }
    }
}

/// Opens streaming chats for the orchestrator.
///
/// The returned channel closes once the stream is over. Cancelling `cancel`
/// must end it promptly.
pub trait ChatGateway: Send + Sync {
    fn chat<'a>(
        &'a self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, GatewayResult<ChatChunkReceiver>>;
}

/// [`ChatGateway`] over the provider registry and a secret store.
pub struct ChatBridge {
    registry: ProviderRegistry,
    secrets: Arc<dyn SecretStore>,
}

impl ChatBridge {
    pub fn new(registry: ProviderRegistry, secrets: Arc<dyn SecretStore>) -> Self {
        Self { registry, secrets }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Builds the provider and probes it without opening a chat stream.
    pub async fn test_connection(
        &self,
        provider: &str,
        cancel: CancellationToken,
    ) -> GatewayResult<()> {
        let provider = self.connect(provider)?;
        provider
            .test_connection(cancel)
            .await
            .context(ProviderSnafu {
                stage: "bridge-test-connection",
            })
    }

    fn connect(&self, provider: &str) -> GatewayResult<Arc<dyn LlmProvider>> {
        let entry = self
            .registry
            .resolve(provider)
            .context(ResolveProviderSnafu {
                stage: "bridge-resolve-provider",
                provider: provider.to_string(),
            })?;

        let mut config = entry.base_config.clone();
        for field in entry
            .factory
            .credential_fields()
            .iter()
            .filter(|field| field.secret)
        {
            let secret = match self.secrets.get_provider_secret(&entry.name, field.name) {
                Ok(secret) => secret,
                Err(error) if field.required => {
                    return Err(error).context(ReadSecretSnafu {
                        stage: "bridge-hydrate-secret",
                        provider: entry.name.clone(),
                        field: field.name,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        provider = %entry.name,
                        field = field.name,
                        error = %error,
                        "skipping unreadable optional secret"
                    );
                    continue;
                }
            };

            match secret {
                Some(value) => config.set(field.name, value),
                None if field.required => {
                    return MissingSecretSnafu {
                        stage: "bridge-hydrate-secret",
                        provider: entry.name.clone(),
                        field: field.name,
                    }
                    .fail();
                }
                None => {
                    tracing::debug!(
                        provider = %entry.name,
                        field = field.name,
                        "optional secret not configured"
                    );
                }
            }
        }

        entry.factory.create(config).context(ProviderSnafu {
            stage: "bridge-create-provider",
        })
    }
}

impl ChatGateway for ChatBridge {
    fn chat<'a>(
        &'a self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, GatewayResult<ChatChunkReceiver>> {
        Box::pin(async move {
            let provider = self.connect(&request.provider)?;
            let messages = translate_messages(&request.messages)?;
            let options = ProviderChatOptions {
                model: request.model,
                temperature: request.options.temperature,
                max_tokens: request.options.max_tokens,
                system_prompt: request.options.system_prompt,
                tools: request
                    .tools
                    .into_iter()
                    .map(|tool| ToolDefinition {
                        name: tool.name,
                        description: tool.description,
                        parameters: tool.parameters,
                    })
                    .collect(),
            };

            tracing::debug!(
                provider = %provider.id(),
                model = %options.model,
                messages = messages.len(),
                "opening chat stream"
            );
            let handle = provider
                .stream_chat(messages, options, cancel.clone())
                .context(ProviderSnafu {
                    stage: "bridge-stream-chat",
                })?;

            tokio::spawn(handle.worker);
            let (sender, receiver) = mpsc::unbounded_channel();
            tokio::spawn(forward_chunks(handle.chunks, sender, cancel));
            Ok(receiver)
        })
    }
}

async fn forward_chunks(
    mut chunks: mpsc::UnboundedReceiver<ProviderChunk>,
    sender: mpsc::UnboundedSender<ChatChunk>,
    cancel: CancellationToken,
) {
    while let Some(chunk) = chunks.recv().await {
        if sender.send(ChatChunk::from_provider(chunk, &cancel)).is_err() {
            tracing::debug!("chat chunk receiver dropped, stopping forwarder");
            break;
        }
    }
}

/// Maps transport messages to provider messages, dropping blank ones.
pub fn translate_messages(messages: &[ChatMessage]) -> GatewayResult<Vec<ProviderMessage>> {
    messages
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| {
            let role = match message.role.trim().to_ascii_lowercase().as_str() {
                "system" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                _ => {
                    return UnsupportedRoleSnafu {
                        stage: "bridge-translate-role",
                        role: message.role.clone(),
                    }
                    .fail();
                }
            };

            Ok(ProviderMessage {
                role,
                content: message.content.clone(),
                tool_call_id: message.tool_call_id.clone(),
            })
        })
        .collect()
}
