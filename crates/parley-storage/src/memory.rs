//! In-memory stores for tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use parley_core::error::{ParleyError, Result};
use parley_core::types::Conversation;

use crate::store::{ConversationStore, HandoffStore, UpdateOutcome};

fn poisoned(e: impl std::fmt::Display) -> ParleyError {
    ParleyError::Storage(format!("store lock poisoned: {}", e))
}

/// Conversation store backed by a `HashMap`.
#[derive(Clone, Default)]
pub struct InMemoryConversationStore {
    conversations: Arc<Mutex<HashMap<Uuid, Conversation>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.conversations.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, id: Uuid) -> Result<Option<Conversation>> {
        let store = self.conversations.lock().map_err(poisoned)?;
        Ok(store.get(&id).cloned())
    }

    async fn create(&self, conversation: &Conversation) -> Result<Conversation> {
        let mut store = self.conversations.lock().map_err(poisoned)?;
        store.insert(conversation.id, conversation.clone());
        Ok(conversation.clone())
    }

    async fn update_if_not_shorter(&self, conversation: &Conversation) -> Result<UpdateOutcome> {
        let mut store = self.conversations.lock().map_err(poisoned)?;
        match store.get_mut(&conversation.id) {
            Some(existing) if existing.messages.len() > conversation.messages.len() => {
                Ok(UpdateOutcome::Rejected {
                    stored: existing.messages.len(),
                })
            }
            Some(existing) => {
                *existing = conversation.clone();
                Ok(UpdateOutcome::Updated(conversation.clone()))
            }
            None => Err(ParleyError::NotFound(conversation.id)),
        }
    }

    async fn list(&self) -> Result<Vec<Conversation>> {
        let store = self.conversations.lock().map_err(poisoned)?;
        let mut result: Vec<Conversation> = store.values().cloned().collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut store = self.conversations.lock().map_err(poisoned)?;
        store.remove(&id);
        Ok(())
    }
}

/// Handoff store that lives as long as the process.
#[derive(Clone, Default)]
pub struct InMemoryHandoffStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryHandoffStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandoffStore for InMemoryHandoffStore {
    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_core::types::{Message, ModelCatalog};

    fn conversation(name: &str) -> Conversation {
        Conversation::new(name, ModelCatalog::builtin().baseline().clone())
    }

    #[tokio::test]
    async fn test_create_then_load() {
        let store = InMemoryConversationStore::new();
        let conv = conversation("a");
        store.create(&conv).await.unwrap();
        assert_eq!(store.load(conv.id).await.unwrap(), Some(conv));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemoryConversationStore::new();
        let err = store
            .update_if_not_shorter(&conversation("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_shorter_record() {
        let store = InMemoryConversationStore::new();
        let mut conv = conversation("a");
        for i in 0..3 {
            conv.messages
                .push(Message::user(&format!("m{}", i), vec![], Utc::now()));
        }
        store.create(&conv).await.unwrap();

        let mut stale = conv.clone();
        stale.messages.truncate(1);
        let outcome = store.update_if_not_shorter(&stale).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Rejected { stored: 3 });
        assert_eq!(store.load(conv.id).await.unwrap().unwrap().messages.len(), 3);

        conv.messages[0].content = "edited".into();
        let outcome = store.update_if_not_shorter(&conv).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated(conv));
    }

    #[tokio::test]
    async fn test_list_sorted_by_name() {
        let store = InMemoryConversationStore::new();
        store.create(&conversation("b")).await.unwrap();
        store.create(&conversation("a")).await.unwrap();
        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryConversationStore::new();
        let conv = conversation("a");
        store.create(&conv).await.unwrap();
        store.delete(conv.id).await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_handoff_put_get_delete() {
        let store = InMemoryHandoffStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.put("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }
}
