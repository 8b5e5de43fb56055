use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{FileReference, TokenUsageSnapshot};

/// Named events exchanged between the orchestrator and UI collaborators.
///
/// Emitted on the event bus and consumed by:
/// - UI collaborators (model picker, citation toggle, workflow suggestions)
/// - The log, for audit and debugging
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DomainEvent {
    // =========================================================================
    // Signals to and from the UI
    // =========================================================================
    /// The active workflow implies a model other than the one on screen.
    ModelImplied {
        workflow_id: String,
        model_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The user toggled citations.
    CitationSettingChanged {
        enabled: bool,
        timestamp: DateTime<Utc>,
    },

    /// Files were attached to a turn; the UI may suggest matching workflows.
    FilesAttached {
        conversation_id: Uuid,
        files: Vec<FileReference>,
        has_audio: bool,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Turn lifecycle
    // =========================================================================
    /// A turn started streaming.
    TurnStarted {
        conversation_id: Uuid,
        model_id: String,
        retrieval_mode: String,
        timestamp: DateTime<Utc>,
    },

    /// A background retrieval failed and the turn continued without citations.
    RetrievalFailed {
        conversation_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Citations were attached to an assistant message.
    CitationsAttached {
        conversation_id: Uuid,
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A new token usage figure is available for display.
    TokenUsageUpdated {
        conversation_id: Uuid,
        usage: TokenUsageSnapshot,
        displayed: u64,
        timestamp: DateTime<Utc>,
    },

    /// The final republish of a turn was issued.
    TurnCompleted {
        conversation_id: Uuid,
        content_length: usize,
        interrupted: bool,
        timestamp: DateTime<Utc>,
    },

    /// Persisting a conversation failed; the local copy is ahead of the store.
    ConversationUnsynced {
        conversation_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Messages were sliced off a conversation before re-running a turn.
    ConversationTruncated {
        conversation_id: Uuid,
        remaining: usize,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Returns the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::ModelImplied { timestamp, .. }
            | DomainEvent::CitationSettingChanged { timestamp, .. }
            | DomainEvent::FilesAttached { timestamp, .. }
            | DomainEvent::TurnStarted { timestamp, .. }
            | DomainEvent::RetrievalFailed { timestamp, .. }
            | DomainEvent::CitationsAttached { timestamp, .. }
            | DomainEvent::TokenUsageUpdated { timestamp, .. }
            | DomainEvent::TurnCompleted { timestamp, .. }
            | DomainEvent::ConversationUnsynced { timestamp, .. }
            | DomainEvent::ConversationTruncated { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the event name used for subscriptions and logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            DomainEvent::ModelImplied { .. } => "model_implied",
            DomainEvent::CitationSettingChanged { .. } => "citation_setting_changed",
            DomainEvent::FilesAttached { .. } => "files_attached",
            DomainEvent::TurnStarted { .. } => "turn_started",
            DomainEvent::RetrievalFailed { .. } => "retrieval_failed",
            DomainEvent::CitationsAttached { .. } => "citations_attached",
            DomainEvent::TokenUsageUpdated { .. } => "token_usage_updated",
            DomainEvent::TurnCompleted { .. } => "turn_completed",
            DomainEvent::ConversationUnsynced { .. } => "conversation_unsynced",
            DomainEvent::ConversationTruncated { .. } => "conversation_truncated",
        }
    }
}
