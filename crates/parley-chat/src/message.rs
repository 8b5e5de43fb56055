//! Shared handle to the assistant message of an in-flight turn.
//!
//! The stream assembler and the citation injector both mutate the same
//! message through a `MessageHandle`. A handle identifies its target by
//! index plus `(role, timestamp)`; once the conversation is truncated past
//! that point every further update is dropped.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_core::types::{Citation, Conversation, Message, Role};

/// Why a message was republished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    Partial,
    Final,
    Citations,
}

/// A republished message state.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageUpdate {
    pub conversation_id: Uuid,
    pub index: usize,
    pub kind: UpdateKind,
    pub message: Message,
}

/// Receives every republished message state (the render layer).
pub trait Republisher: Send + Sync {
    fn republish(&self, update: MessageUpdate);
}

impl Republisher for mpsc::UnboundedSender<MessageUpdate> {
    fn republish(&self, update: MessageUpdate) {
        if self.send(update).is_err() {
            tracing::trace!("Republish receiver dropped");
        }
    }
}

#[derive(Clone)]
pub struct MessageHandle {
    conversation: Arc<Mutex<Conversation>>,
    conversation_id: Uuid,
    index: usize,
    role: Role,
    timestamp: DateTime<Utc>,
    republisher: Arc<dyn Republisher>,
}

impl MessageHandle {
    /// Bind a handle to the message currently at `index`.
    pub fn bind(
        conversation: Arc<Mutex<Conversation>>,
        index: usize,
        republisher: Arc<dyn Republisher>,
    ) -> Option<Self> {
        let (conversation_id, role, timestamp) = {
            let conv = conversation.lock().ok()?;
            let message = conv.messages.get(index)?;
            (conv.id, message.role, message.timestamp)
        };
        Some(Self {
            conversation,
            conversation_id,
            index,
            role,
            timestamp,
            republisher,
        })
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Current state of the target, or `None` if it was truncated away.
    pub fn snapshot(&self) -> Option<Message> {
        self.with_target(|m| m.clone())
    }

    /// Replace the content and republish.
    ///
    /// Content never shrinks; a shorter value is ignored. Returns whether the
    /// update was applied.
    pub fn set_content(&self, content: &str, kind: UpdateKind) -> bool {
        let updated = self.with_target(|m| {
            if content.len() < m.content.len() {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    current = m.content.len(),
                    offered = content.len(),
                    "Ignoring shrinking content update"
                );
                return None;
            }
            m.content.clear();
            m.content.push_str(content);
            Some(m.clone())
        });
        self.publish(updated.flatten(), kind)
    }

    /// Attach citations and republish. A message takes citations once; later
    /// calls are ignored.
    pub fn attach_citations(&self, citations: Vec<Citation>) -> bool {
        let updated = self.with_target(move |m| {
            if m.citations.is_some() {
                return None;
            }
            m.citations = Some(citations);
            Some(m.clone())
        });
        self.publish(updated.flatten(), UpdateKind::Citations)
    }

    fn with_target<R>(&self, f: impl FnOnce(&mut Message) -> R) -> Option<R> {
        let mut conv = match self.conversation.lock() {
            Ok(conv) => conv,
            Err(e) => {
                tracing::error!(error = %e, "Conversation lock poisoned");
                return None;
            }
        };
        match conv.messages.get_mut(self.index) {
            Some(message) if message.is_same(self.role, self.timestamp) => Some(f(message)),
            _ => {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    index = self.index,
                    "Message no longer present, dropping update"
                );
                None
            }
        }
    }

    fn publish(&self, message: Option<Message>, kind: UpdateKind) -> bool {
        match message {
            Some(message) => {
                self.republisher.republish(MessageUpdate {
                    conversation_id: self.conversation_id,
                    index: self.index,
                    kind,
                    message,
                });
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandle")
            .field("conversation_id", &self.conversation_id)
            .field("index", &self.index)
            .field("role", &self.role)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
