//! Error types for the response orchestrator.

use parley_core::error::ParleyError;
use uuid::Uuid;

/// Errors from a chat turn and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("a turn is already in progress for conversation {0}")]
    TurnInProgress(Uuid),
    #[error("conversation not found: {0}")]
    ConversationNotFound(Uuid),
    #[error("message index {index} out of range for {len} messages")]
    MessageIndexOutOfRange { index: usize, len: usize },
    #[error("message {0} is not a user message")]
    NotUserMessage(usize),
    #[error("referenced files not found: {0}")]
    RetrievalNotFound(String),
    #[error("file processing failed: {0}")]
    RetrievalProcessingFailed(String),
    #[error("stream read failed: {0}")]
    StreamReadFailed(String),
    #[error("persistence rejected: stored record has {stored} messages, attempted {attempted}")]
    PersistenceRejected { stored: usize, attempted: usize },
    #[error("generation call failed: {0}")]
    GenerationCallFailed(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChatError {
    /// Actionable text for errors that are shown to the user.
    ///
    /// Returns `None` for failures that are only logged.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            ChatError::EmptyMessage => Some("Please enter a message or attach a file."),
            ChatError::TurnInProgress(_) => {
                Some("Please wait for the current response to finish.")
            }
            ChatError::RetrievalNotFound(_) => Some(
                "One or more attached files could not be found. Please upload them again.",
            ),
            ChatError::RetrievalProcessingFailed(_) => {
                Some("The attached files could not be processed. Please try again.")
            }
            ChatError::GenerationCallFailed(_) => {
                Some("There was an error contacting the server. Please try again.")
            }
            _ => None,
        }
    }

    /// Whether the error came from the retrieval call.
    pub fn is_retrieval(&self) -> bool {
        matches!(
            self,
            ChatError::RetrievalNotFound(_) | ChatError::RetrievalProcessingFailed(_)
        )
    }
}

impl From<ParleyError> for ChatError {
    fn from(err: ParleyError) -> Self {
        match err {
            ParleyError::NotFound(id) => ChatError::ConversationNotFound(id),
            other => ChatError::Storage(other.to_string()),
        }
    }
}
