use colloquy_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("failed to load conversations on `{stage}`: {source}"))]
    LoadConversations {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to persist conversation '{conversation_id}' on `{stage}`: {source}"))]
    PersistConversation {
        stage: &'static str,
        conversation_id: String,
        source: StorageError,
    },
    #[snafu(display("conversation '{conversation_id}' already exists"))]
    DuplicateConversation {
        stage: &'static str,
        conversation_id: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse classification of [`OrchestratorError`] for callers that map errors to UI states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Archived,
    Persistence,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum OrchestratorError {
    #[snafu(display("{field} must not be empty"))]
    EmptyInput {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("conversation '{conversation_id}' is archived"))]
    ConversationArchived {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("failed to save message in conversation '{conversation_id}'"))]
    PersistMessage {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("failed to update conversation '{conversation_id}' on `{stage}`"))]
    UpdateConversation {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("failed to create conversation on `{stage}`: {source}"))]
    CreateConversation {
        stage: &'static str,
        source: StoreError,
    },
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyInput { .. } => ErrorKind::Validation,
            Self::ConversationNotFound { .. } => ErrorKind::NotFound,
            Self::ConversationArchived { .. } => ErrorKind::Archived,
            Self::PersistMessage { .. }
            | Self::UpdateConversation { .. }
            | Self::CreateConversation { .. } => ErrorKind::Persistence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_their_kind() {
        let empty = OrchestratorError::EmptyInput {
            stage: "test",
            field: "content",
        };
        assert_eq!(empty.kind(), ErrorKind::Validation);
        assert_eq!(empty.to_string(), "content must not be empty");

        let archived = OrchestratorError::ConversationArchived {
            stage: "test",
            conversation_id: "conv-1".to_string(),
        };
        assert_eq!(archived.kind(), ErrorKind::Archived);

        let duplicate = OrchestratorError::CreateConversation {
            stage: "test",
            source: StoreError::DuplicateConversation {
                stage: "test",
                conversation_id: "conv-1".to_string(),
            },
        };
        assert_eq!(duplicate.kind(), ErrorKind::Persistence);
    }
}
