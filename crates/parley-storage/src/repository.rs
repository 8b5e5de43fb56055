//! SQLite-backed implementations of the persistence contracts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use parley_core::error::{ParleyError, Result};
use parley_core::types::{Conversation, ModelDescriptor, WorkflowRef};

use crate::db::Database;
use crate::store::{ConversationStore, HandoffStore, UpdateOutcome};

const SELECT_CONVERSATION: &str =
    "SELECT id, name, model, workflow, prompt, messages FROM conversations";

/// Conversation records stored one row per conversation, with the message
/// list serialized as JSON.
pub struct SqliteConversationStore {
    db: Arc<Database>,
}

impl SqliteConversationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn load_sync(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("{} WHERE id = ?1", SELECT_CONVERSATION))
                .map_err(|e| ParleyError::Storage(e.to_string()))?;

            let row = stmt
                .query_row(rusqlite::params![id.to_string()], |row| {
                    Ok(ConversationRow::from_row(row))
                })
                .optional()
                .map_err(|e| ParleyError::Storage(e.to_string()))?;

            match row {
                Some(row) => Ok(Some(row?.into_conversation()?)),
                None => Ok(None),
            }
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn load(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.load_sync(id)
    }

    async fn create(&self, conversation: &Conversation) -> Result<Conversation> {
        let encoded = EncodedConversation::encode(conversation)?;
        let now = Utc::now().timestamp();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations
                    (id, name, model, workflow, prompt, messages, message_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                rusqlite::params![
                    conversation.id.to_string(),
                    conversation.name,
                    encoded.model,
                    encoded.workflow,
                    conversation.prompt,
                    encoded.messages,
                    conversation.messages.len() as i64,
                    now,
                ],
            )
            .map_err(|e| ParleyError::Storage(format!("Failed to create conversation: {}", e)))?;
            Ok(())
        })?;
        tracing::debug!(conversation_id = %conversation.id, "Conversation created");
        self.load_sync(conversation.id)?
            .ok_or(ParleyError::NotFound(conversation.id))
    }

    async fn update_if_not_shorter(&self, conversation: &Conversation) -> Result<UpdateOutcome> {
        let encoded = EncodedConversation::encode(conversation)?;
        let now = Utc::now().timestamp();
        let rejected = self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE conversations
                     SET name = ?2, model = ?3, workflow = ?4, prompt = ?5, messages = ?6,
                         message_count = ?7, updated_at = ?8
                     WHERE id = ?1 AND message_count <= ?7",
                    rusqlite::params![
                        conversation.id.to_string(),
                        conversation.name,
                        encoded.model,
                        encoded.workflow,
                        conversation.prompt,
                        encoded.messages,
                        conversation.messages.len() as i64,
                        now,
                    ],
                )
                .map_err(|e| ParleyError::Storage(format!("Failed to update conversation: {}", e)))?;
            if changed > 0 {
                return Ok(None);
            }
            let stored: Option<i64> = conn
                .query_row(
                    "SELECT message_count FROM conversations WHERE id = ?1",
                    rusqlite::params![conversation.id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| ParleyError::Storage(e.to_string()))?;
            match stored {
                Some(n) => Ok(Some(n.max(0) as usize)),
                None => Err(ParleyError::NotFound(conversation.id)),
            }
        })?;
        if let Some(stored) = rejected {
            tracing::debug!(conversation_id = %conversation.id, stored, "Update rejected, stored record is longer");
            return Ok(UpdateOutcome::Rejected { stored });
        }
        let record = self
            .load_sync(conversation.id)?
            .ok_or(ParleyError::NotFound(conversation.id))?;
        Ok(UpdateOutcome::Updated(record))
    }

    async fn list(&self) -> Result<Vec<Conversation>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("{} ORDER BY name ASC", SELECT_CONVERSATION))
                .map_err(|e| ParleyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| Ok(ConversationRow::from_row(row)))
                .map_err(|e| ParleyError::Storage(e.to_string()))?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| ParleyError::Storage(e.to_string()))??);
            }
            Ok(out)
        })?;
        rows.into_iter().map(ConversationRow::into_conversation).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM conversations WHERE id = ?1",
                rusqlite::params![id.to_string()],
            )
            .map_err(|e| ParleyError::Storage(format!("Failed to delete conversation: {}", e)))?;
            Ok(())
        })
    }
}

/// JSON columns of a conversation row.
struct EncodedConversation {
    model: String,
    workflow: Option<String>,
    messages: String,
}

impl EncodedConversation {
    fn encode(conversation: &Conversation) -> Result<Self> {
        Ok(Self {
            model: serde_json::to_string(&conversation.model)?,
            workflow: conversation
                .workflow
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            messages: serde_json::to_string(&conversation.messages)?,
        })
    }
}

/// Raw column values read from the `conversations` table.
struct ConversationRow {
    id: String,
    name: String,
    model: String,
    workflow: Option<String>,
    prompt: String,
    messages: String,
}

impl ConversationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self> {
        let get = |e: rusqlite::Error| ParleyError::Storage(e.to_string());
        Ok(Self {
            id: row.get(0).map_err(get)?,
            name: row.get(1).map_err(get)?,
            model: row.get(2).map_err(get)?,
            workflow: row.get(3).map_err(get)?,
            prompt: row.get(4).map_err(get)?,
            messages: row.get(5).map_err(get)?,
        })
    }

    fn into_conversation(self) -> Result<Conversation> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| ParleyError::Storage(format!("Invalid conversation id: {}", e)))?;
        let model: ModelDescriptor = serde_json::from_str(&self.model)?;
        let workflow: Option<WorkflowRef> = self
            .workflow
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Conversation {
            id,
            name: self.name,
            messages: serde_json::from_str(&self.messages)?,
            model,
            workflow,
            prompt: self.prompt,
        })
    }
}

/// Handoff entries kept in the `handoff` table.
pub struct SqliteHandoffStore {
    db: Arc<Database>,
}

impl SqliteHandoffStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl HandoffStore for SqliteHandoffStore {
    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO handoff (key, value, stored_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, stored_at = excluded.stored_at",
                rusqlite::params![key, value, Utc::now().timestamp()],
            )
            .map_err(|e| ParleyError::Storage(format!("Failed to store handoff: {}", e)))?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM handoff WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ParleyError::Storage(e.to_string()))
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM handoff WHERE key = ?1", rusqlite::params![key])
                .map_err(|e| ParleyError::Storage(format!("Failed to delete handoff: {}", e)))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::types::{Citation, Message, ModelCatalog, Role};

    fn store() -> SqliteConversationStore {
        SqliteConversationStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn conversation(name: &str) -> Conversation {
        let mut conv = Conversation::new(name, ModelCatalog::builtin().baseline().clone());
        let ts = conv.next_timestamp(Role::User, Utc::now());
        conv.messages.push(Message::user("What is VAT?", vec![], ts));
        conv
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let store = store();
        let conv = conversation("VAT");
        let created = store.create(&conv).await.unwrap();
        assert_eq!(created, conv);

        let loaded = store.load(conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].content, "What is VAT?");
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        assert!(store().load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_roundtrips_workflow_and_citations() {
        let store = store();
        let mut conv = conversation("VAT");
        store.create(&conv).await.unwrap();

        conv.workflow = Some(WorkflowRef {
            id: "tax".into(),
            name: "Tax advisor".into(),
            citation: true,
            ..WorkflowRef::default()
        });
        let mut reply = Message::assistant(conv.next_timestamp(Role::Assistant, Utc::now()));
        reply.content = "A consumption tax.".into();
        reply.citations = Some(vec![Citation::file("vat.pdf")]);
        conv.messages.push(reply);

        let updated = store.update_if_not_shorter(&conv).await.unwrap();
        assert_eq!(updated, UpdateOutcome::Updated(conv));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let err = store()
            .update_if_not_shorter(&conversation("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_never_shortens_stored_record() {
        let store = store();
        let mut conv = conversation("long");
        for text in ["one", "two", "three"] {
            let ts = conv.next_timestamp(Role::User, Utc::now());
            conv.messages.push(Message::user(text, vec![], ts));
        }
        store.create(&conv).await.unwrap();

        let mut stale = conv.clone();
        stale.messages.truncate(1);
        stale.name = "renamed".into();
        let outcome = store.update_if_not_shorter(&stale).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Rejected { stored: 3 });

        let stored = store.load(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 3);
        assert_eq!(stored.name, "long");
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let store = store();
        let conv = conversation("dup");
        store.create(&conv).await.unwrap();
        assert!(store.create(&conv).await.is_err());
    }

    #[tokio::test]
    async fn test_list_ordered_by_name_and_delete() {
        let store = store();
        let b = conversation("beta");
        let a = conversation("alpha");
        store.create(&b).await.unwrap();
        store.create(&a).await.unwrap();

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        store.delete(a.id).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[test]
    fn test_handoff_upsert() {
        let store = SqliteHandoffStore::new(Arc::new(Database::in_memory().unwrap()));
        store.put("pending", "one").unwrap();
        store.put("pending", "two").unwrap();
        assert_eq!(store.get("pending").unwrap().as_deref(), Some("two"));
        store.delete("pending").unwrap();
        assert!(store.get("pending").unwrap().is_none());
    }
}
