//! Provider-neutral streaming chat contract and the built-in providers.

mod provider;
mod registry;
mod rig_adapter;

pub use provider::{
    API_KEY_FIELD, BASE_URL_FIELD, BoxFuture, ChatOptions, ChunkError, ChunkErrorKind,
    CredentialField, LlmProvider, ProviderChunk, ProviderConfig, ProviderError, ProviderFactory,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StatusCode,
    ToolCall, ToolDefinition, Usage, make_chunk_channel,
};
pub use registry::{ProviderRegistry, RegisteredProvider};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigOpenAiFactory, RigProviderAdapter};
