//! Persistence contracts used by the orchestrator.

use async_trait::async_trait;
use uuid::Uuid;

use parley_core::error::Result;
use parley_core::types::Conversation;

/// Result of a length-gated update.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// The record was overwritten; carries the canonical stored record.
    Updated(Conversation),
    /// The stored record holds more messages and was left alone.
    Rejected { stored: usize },
}

/// Remote conversation records.
///
/// `create` and `update_if_not_shorter` return the canonical stored record,
/// which callers use to refresh their local state.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<Conversation>>;
    async fn create(&self, conversation: &Conversation) -> Result<Conversation>;
    /// Overwrite an existing record unless it holds more messages than
    /// `conversation`. The length comparison and the write happen as one
    /// step, so a write prepared against an older record cannot shorten a
    /// newer one. Fails with `NotFound` if there is no record.
    async fn update_if_not_shorter(&self, conversation: &Conversation) -> Result<UpdateOutcome>;
    async fn list(&self) -> Result<Vec<Conversation>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// Session-scoped key-value storage for turns deferred across a navigation.
pub trait HandoffStore: Send + Sync {
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn delete(&self, key: &str) -> Result<()>;
}
