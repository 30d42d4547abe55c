//! Conversation orchestration: the store, the single active stream, the
//! provider bridge and the signals published to the host.
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod secrets;
pub mod settings;
pub mod signals;
pub mod store;
pub mod stream_manager;

pub use error::{ErrorKind, OrchestratorError, OrchestratorResult, StoreError, StoreResult};
pub use gateway::{
    ChatBridge, ChatChunk, ChatChunkReceiver, ChatGateway, ChatMessage, ChatOptions, ChatRequest,
    ChatTool, GatewayError, GatewayResult, translate_messages,
};
pub use orchestrator::{
    FINISH_REASON_CANCELLED, FINISH_REASON_ERROR, FINISH_REASON_STOP, Orchestrator,
    STREAM_SETUP_ABANDONED, TITLE_MAX_CHARS, derive_title,
};
pub use secrets::{EnvSecretStore, MemorySecretStore, SecretError, SecretResult, SecretStore};
pub use settings::{AppSettings, ProviderEndpointSettings, SettingsError, SettingsStore};
pub use signals::{
    ChannelEventBus, ChatEvent, EventBus, SignalKind, SignalPayload, SignalRegistry,
    TracingEventBus,
};
pub use store::{ConversationStore, INTERRUPTED_STREAM_MESSAGE};
pub use stream_manager::{StreamKey, StreamManager};
