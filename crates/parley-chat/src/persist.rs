//! Conversation persistence and local list merging.

use std::sync::Arc;

use parley_core::error::ParleyError;
use parley_core::types::Conversation;
use parley_storage::{ConversationStore, UpdateOutcome};

use crate::error::ChatError;

/// Upserts finished turns into the conversation store.
///
/// An existing record is only overwritten by a message list at least as long
/// as the stored one. The store checks the length in the same step as the
/// write, so a slow write can never truncate a conversation that has grown
/// since. There is no version check beyond that.
#[derive(Clone)]
pub struct ConversationPersister {
    store: Arc<dyn ConversationStore>,
}

impl ConversationPersister {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Create or update `conversation`, returning the canonical stored record.
    pub async fn persist(&self, conversation: &Conversation) -> Result<Conversation, ChatError> {
        match self.store.update_if_not_shorter(conversation).await {
            Ok(UpdateOutcome::Updated(record)) => {
                tracing::debug!(
                    conversation_id = %conversation.id,
                    messages = conversation.messages.len(),
                    "Conversation updated"
                );
                Ok(record)
            }
            Ok(UpdateOutcome::Rejected { stored }) => Err(ChatError::PersistenceRejected {
                stored,
                attempted: conversation.messages.len(),
            }),
            Err(ParleyError::NotFound(_)) => {
                let record = self.store.create(conversation).await?;
                tracing::info!(
                    conversation_id = %conversation.id,
                    messages = conversation.messages.len(),
                    "Conversation created"
                );
                Ok(record)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for ConversationPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationPersister").finish()
    }
}

/// Replace the entry with the same id, or append it. Ordering is left to
/// the caller; see [`sort_by_name`].
pub fn merge(mut local: Vec<Conversation>, updated: Conversation) -> Vec<Conversation> {
    match local.iter_mut().find(|c| c.id == updated.id) {
        Some(existing) => *existing = updated,
        None => local.push(updated),
    }
    local
}

pub fn sort_by_name(list: &mut [Conversation]) {
    list.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use parley_core::error::Result;
    use parley_core::types::{Message, ModelCatalog};
    use parley_storage::InMemoryConversationStore;
    use tokio::sync::Notify;
    use uuid::Uuid;

    /// Holds the first update inside the store until `release` is notified.
    struct StallingStore {
        inner: InMemoryConversationStore,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl StallingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryConversationStore::new(),
                armed: AtomicBool::new(true),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl ConversationStore for StallingStore {
        async fn load(&self, id: Uuid) -> Result<Option<Conversation>> {
            self.inner.load(id).await
        }

        async fn create(&self, conversation: &Conversation) -> Result<Conversation> {
            self.inner.create(conversation).await
        }

        async fn update_if_not_shorter(&self, conversation: &Conversation) -> Result<UpdateOutcome> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.update_if_not_shorter(conversation).await
        }

        async fn list(&self) -> Result<Vec<Conversation>> {
            self.inner.list().await
        }

        async fn delete(&self, id: Uuid) -> Result<()> {
            self.inner.delete(id).await
        }
    }

    fn conversation(name: &str, messages: usize) -> Conversation {
        let mut conv = Conversation::new(name, ModelCatalog::builtin().baseline().clone());
        for i in 0..messages {
            conv.messages
                .push(Message::user(&format!("m{}", i), vec![], Utc::now()));
        }
        conv
    }

    // ---- persist ----

    #[tokio::test]
    async fn test_persist_creates_missing_record() {
        let store = Arc::new(InMemoryConversationStore::new());
        let persister = ConversationPersister::new(store.clone());
        let conv = conversation("a", 2);
        let record = persister.persist(&conv).await.unwrap();
        assert_eq!(record.id, conv.id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_updates_when_not_shorter() {
        let store = Arc::new(InMemoryConversationStore::new());
        let persister = ConversationPersister::new(store.clone());
        let mut conv = conversation("a", 2);
        persister.persist(&conv).await.unwrap();

        conv.messages[1].content = "same length, new content".into();
        let record = persister.persist(&conv).await.unwrap();
        assert_eq!(record.messages[1].content, "same length, new content");

        conv.messages.push(Message::user("more", vec![], Utc::now()));
        let record = persister.persist(&conv).await.unwrap();
        assert_eq!(record.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_persist_rejects_shorter_list() {
        let store = Arc::new(InMemoryConversationStore::new());
        let persister = ConversationPersister::new(store.clone());
        let mut conv = conversation("a", 4);
        persister.persist(&conv).await.unwrap();

        conv.messages.truncate(2);
        let err = persister.persist(&conv).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::PersistenceRejected {
                stored: 4,
                attempted: 2
            }
        ));
        let stored = store.load(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_stalled_write_cannot_shorten_newer_record() {
        let store = Arc::new(StallingStore::new());
        let base = conversation("a", 1);
        store.inner.create(&base).await.unwrap();

        let mut short = base.clone();
        short.messages.push(Message::user("slow", vec![], Utc::now()));
        let mut long = short.clone();
        for text in ["fast", "faster"] {
            long.messages.push(Message::user(text, vec![], Utc::now()));
        }

        let slow = {
            let persister = ConversationPersister::new(store.clone());
            tokio::spawn(async move { persister.persist(&short).await })
        };
        store.entered.notified().await;

        let persister = ConversationPersister::new(store.clone());
        let record = persister.persist(&long).await.unwrap();
        assert_eq!(record.messages.len(), 4);

        store.release.notify_one();
        let err = slow.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ChatError::PersistenceRejected {
                stored: 4,
                attempted: 2
            }
        ));
        let stored = store.load(base.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 4);
    }

    // ---- merge ----

    #[test]
    fn test_merge_inserts_new() {
        let list = vec![conversation("a", 0)];
        let merged = merge(list, conversation("b", 0));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_replaces_without_duplicates() {
        let mut conv = conversation("a", 1);
        let list = vec![conv.clone(), conversation("z", 0)];
        conv.messages.push(Message::user("new", vec![], Utc::now()));
        let merged = merge(list, conv.clone());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.iter().filter(|c| c.id == conv.id).count(), 1);
        assert_eq!(merged[0].messages.len(), 2);
    }

    #[test]
    fn test_sort_by_name_case_insensitive() {
        let mut list = vec![
            conversation("beta", 0),
            conversation("Alpha", 0),
            conversation("gamma", 0),
        ];
        sort_by_name(&mut list);
        let names: Vec<&str> = list.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "beta", "gamma"]);
    }
}
