pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;
pub use types::{
    ActionExecution, ActionStatus, Artifact, Block, BlockKind, Conversation,
    ConversationSettings, ConversationSummary, DEFAULT_CONVERSATION_TITLE, Message,
    MessageMetadata, MessageRole, unix_timestamp_millis,
};

/// Persistence collaborator for whole conversations.
///
/// Implementations must round-trip settings, ordered messages and message
/// metadata. `delete` is permanent; archiving is an `update` of the flag.
pub trait ConversationRepository: Send + Sync {
    fn create(&self, conversation: &Conversation) -> StorageResult<()>;
    fn get(&self, conversation_id: &ConversationId) -> StorageResult<Option<Conversation>>;
    fn list(&self) -> StorageResult<Vec<Conversation>>;
    fn update(&self, conversation: &Conversation) -> StorageResult<()>;
    fn delete(&self, conversation_id: &ConversationId) -> StorageResult<()>;
}
