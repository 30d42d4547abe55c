use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId};

/// Title given to conversations created without an explicit one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Text,
    Code,
    Artifact,
    Thinking,
    Action,
    Error,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    pub status: ActionStatus,
    #[serde(default)]
    pub output: Option<String>,
}

/// One typed content unit of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionExecution>,
}

impl Block {
    pub fn new(kind: BlockKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            language: None,
            artifact: None,
            action: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(BlockKind::Text, content)
    }
}

/// Terminal record of one assistant generation. Written once, at finalization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: u64,
    pub finish_reason: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub blocks: Vec<Block>,
    pub created_at_unix_ms: u64,
    pub is_streaming: bool,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// Creates a finished single-text-block message.
    pub fn complete(
        conversation_id: ConversationId,
        role: MessageRole,
        content: impl Into<String>,
        created_at_unix_ms: u64,
    ) -> Self {
        Self {
            id: MessageId::new_v7(),
            conversation_id,
            role,
            blocks: vec![Block::text(content)],
            created_at_unix_ms,
            is_streaming: false,
            metadata: None,
        }
    }

    /// Creates an empty placeholder that streamed content is appended into.
    pub fn streaming_placeholder(
        conversation_id: ConversationId,
        role: MessageRole,
        created_at_unix_ms: u64,
    ) -> Self {
        Self {
            id: MessageId::new_v7(),
            conversation_id,
            role,
            blocks: Vec::new(),
            created_at_unix_ms,
            is_streaming: true,
            metadata: None,
        }
    }

    pub fn first_text(&self) -> Option<&str> {
        self.blocks
            .iter()
            .find(|block| block.kind == BlockKind::Text)
            .map(|block| block.content.as_str())
    }

    /// Concatenates every text block in order.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter(|block| block.kind == BlockKind::Text)
            .map(|block| block.content.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConversationSettings {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl ConversationSettings {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn has_provider(&self) -> bool {
        !self.provider.trim().is_empty()
    }
}

/// Conversation aggregate root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub messages: Vec<Message>,
    pub settings: ConversationSettings,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
    pub archived: bool,
}

impl Conversation {
    pub fn new(
        id: ConversationId,
        title: impl Into<String>,
        settings: ConversationSettings,
        created_at_unix_ms: u64,
    ) -> Self {
        let mut title = title.into();
        if title.trim().is_empty() {
            title = DEFAULT_CONVERSATION_TITLE.to_string();
        }

        Self {
            id,
            title,
            messages: Vec::new(),
            settings,
            created_at_unix_ms,
            updated_at_unix_ms: created_at_unix_ms,
            archived: false,
        }
    }

    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| &message.id == message_id)
    }

    /// Timestamp for the next appended message, never earlier than the tail.
    pub fn next_message_timestamp(&self, now_unix_ms: u64) -> u64 {
        self.messages
            .last()
            .map_or(now_unix_ms, |last| now_unix_ms.max(last.created_at_unix_ms))
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            provider: self.settings.provider.clone(),
            model: self.settings.model.clone(),
            message_count: self.messages.len(),
            updated_at_unix_ms: self.updated_at_unix_ms,
            archived: self.archived,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub provider: String,
    pub model: String,
    pub message_count: usize,
    pub updated_at_unix_ms: u64,
    pub archived: bool,
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}
