use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const API_KEY_FIELD: &str = "api_key";
pub const BASE_URL_FIELD: &str = "base_url";

/// Provider-neutral speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkErrorKind {
    Cancelled,
    DeadlineExceeded,
    Provider,
}

/// Terminal error carried on a stream chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkError {
    pub kind: ChunkErrorKind,
    pub message: String,
    #[serde(default)]
    pub status_code: Option<u16>,
}

impl ChunkError {
    pub fn cancelled() -> Self {
        Self {
            kind: ChunkErrorKind::Cancelled,
            message: "stream cancelled".to_string(),
            status_code: None,
        }
    }

    pub fn deadline_exceeded() -> Self {
        Self {
            kind: ChunkErrorKind::DeadlineExceeded,
            message: "stream deadline exceeded".to_string(),
            status_code: None,
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self {
            kind: ChunkErrorKind::Provider,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status_code(mut self, status_code: Option<u16>) -> Self {
        self.status_code = status_code;
        self
    }

    /// Classifies a plain error string.
    ///
    /// Only for sources that cannot report a structured kind; it recognizes the
    /// usual "canceled"/"cancelled"/"deadline exceeded" wording and nothing else.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_ascii_lowercase();
        let kind = if lowered.contains("deadline exceeded") {
            ChunkErrorKind::DeadlineExceeded
        } else if lowered.contains("context canceled") || lowered.contains("cancelled") {
            ChunkErrorKind::Cancelled
        } else {
            ChunkErrorKind::Provider
        };

        Self {
            kind,
            message,
            status_code: None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.kind,
            ChunkErrorKind::Cancelled | ChunkErrorKind::DeadlineExceeded
        )
    }
}

/// One incremental unit of a provider stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderChunk {
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

impl ProviderChunk {
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
}

/// Declares one configuration value a provider needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialField {
    pub name: &'static str,
    pub label: &'static str,
    pub secret: bool,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderConfig {
    pub provider_id: String,
    values: BTreeMap<String, String>,
}

impl ProviderConfig {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(field.into(), value.into().trim().to_string());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.values
            .get(field)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.get(API_KEY_FIELD)
    }

    pub fn base_url(&self) -> Option<&str> {
        self.get(BASE_URL_FIELD)
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Extension point for lifting an HTTP-ish status out of an error.
pub trait StatusCode {
    fn status_code(&self) -> Option<u16>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("chat request for model '{model}' has no messages"))]
    EmptyMessageSet { stage: &'static str, model: String },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("provider endpoint returned status {status}: {body}"))]
    EndpointStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("operation cancelled on `{stage}`"))]
    Cancelled { stage: &'static str },
}

impl StatusCode for ProviderError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::EndpointStatus { status, .. } => Some(*status),
            Self::MissingApiKey { .. } => Some(401),
            _ => None,
        }
    }
}

impl StatusCode for ChunkError {
    fn status_code(&self) -> Option<u16> {
        self.status_code
    }
}

/// Receiving half of a provider stream plus the future that drives it.
///
/// The caller must spawn `worker`; the channel closes when it finishes.
pub struct ProviderStreamHandle {
    pub chunks: mpsc::UnboundedReceiver<ProviderChunk>,
    pub worker: ProviderWorker,
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// Starts a streaming completion. Cancelling `cancel` must end the stream
    /// with a [`ChunkErrorKind::Cancelled`] chunk.
    fn stream_chat(
        &self,
        messages: Vec<ProviderMessage>,
        options: ChatOptions,
        cancel: CancellationToken,
    ) -> ProviderResult<ProviderStreamHandle>;
    fn test_connection<'a>(&'a self, cancel: CancellationToken) -> BoxFuture<'a, ProviderResult<()>>;
}

/// Builds configured providers of one kind.
pub trait ProviderFactory: Send + Sync {
    fn id(&self) -> &str;
    fn credential_fields(&self) -> &[CredentialField];
    fn create(&self, config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>>;
}

pub fn make_chunk_channel() -> (
    mpsc::UnboundedSender<ProviderChunk>,
    mpsc::UnboundedReceiver<ProviderChunk>,
) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_messages_are_classified_conservatively() {
        assert_eq!(
            ChunkError::from_message("context canceled").kind,
            ChunkErrorKind::Cancelled
        );
        assert_eq!(
            ChunkError::from_message("context deadline exceeded").kind,
            ChunkErrorKind::DeadlineExceeded
        );
        assert_eq!(
            ChunkError::from_message("503 upstream unavailable").kind,
            ChunkErrorKind::Provider
        );
        assert!(ChunkError::cancelled().is_cancellation());
        assert!(!ChunkError::provider("boom").is_cancellation());
    }

    #[test]
    fn config_values_are_trimmed_and_blank_values_hidden() {
        let mut config = ProviderConfig::new(" openai ").with_value(API_KEY_FIELD, " sk-test ");
        config.set(BASE_URL_FIELD, "   ");

        assert_eq!(config.provider_id, "openai");
        assert_eq!(config.api_key(), Some("sk-test"));
        assert_eq!(config.base_url(), None);
    }

    #[test]
    fn status_codes_surface_from_errors() {
        let error = ProviderError::EndpointStatus {
            stage: "test",
            status: 429,
            body: "slow down".to_string(),
        };
        assert_eq!(error.status_code(), Some(429));
        assert_eq!(
            ChunkError::provider("x")
                .with_status_code(Some(500))
                .status_code(),
            Some(500)
        );
    }
}
