//! Turns deferred across a navigation boundary.
//!
//! A deferred turn is written to the session-scoped handoff store as JSON and
//! replayed by the orchestrator on the next start, with the model recorded at
//! deferral time used as an explicit override.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_core::types::{FileReference, WorkflowRef};
use parley_storage::HandoffStore;

use crate::error::ChatError;

/// Key of the single pending turn.
pub const PENDING_TURN_KEY: &str = "parley.pending_turn";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnHandoff {
    pub conversation_id: Option<Uuid>,
    pub text: String,
    #[serde(default)]
    pub files: Vec<FileReference>,
    #[serde(default)]
    pub workflow: Option<WorkflowRef>,
    pub model_id: String,
    #[serde(default)]
    pub citations_enabled: Option<bool>,
}

pub fn defer_turn(store: &dyn HandoffStore, handoff: &TurnHandoff) -> Result<(), ChatError> {
    let json = serde_json::to_string(handoff)
        .map_err(|e| ChatError::Storage(format!("Failed to encode handoff: {}", e)))?;
    store.put(PENDING_TURN_KEY, &json)?;
    tracing::info!(
        conversation_id = ?handoff.conversation_id,
        model = %handoff.model_id,
        "Turn deferred"
    );
    Ok(())
}

/// Remove and return the pending turn. An unreadable entry is discarded.
pub fn take_pending(store: &dyn HandoffStore) -> Result<Option<TurnHandoff>, ChatError> {
    let Some(json) = store.get(PENDING_TURN_KEY)? else {
        return Ok(None);
    };
    store.delete(PENDING_TURN_KEY)?;
    match serde_json::from_str(&json) {
        Ok(handoff) => Ok(Some(handoff)),
        Err(e) => {
            tracing::warn!(error = %e, "Discarding unreadable pending turn");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_storage::InMemoryHandoffStore;

    fn handoff() -> TurnHandoff {
        TurnHandoff {
            conversation_id: Some(Uuid::new_v4()),
            text: "Summarize the attachment".into(),
            files: vec![FileReference {
                storage_id: "blob".into(),
                display_name: "a.pdf".into(),
            }],
            workflow: None,
            model_id: "gpt-4o".into(),
            citations_enabled: Some(true),
        }
    }

    #[test]
    fn test_defer_then_take() {
        let store = InMemoryHandoffStore::new();
        let h = handoff();
        defer_turn(&store, &h).unwrap();
        assert_eq!(take_pending(&store).unwrap(), Some(h));
    }

    #[test]
    fn test_take_consumes_entry() {
        let store = InMemoryHandoffStore::new();
        defer_turn(&store, &handoff()).unwrap();
        take_pending(&store).unwrap();
        assert_eq!(take_pending(&store).unwrap(), None);
    }

    #[test]
    fn test_defer_overwrites_previous() {
        let store = InMemoryHandoffStore::new();
        defer_turn(&store, &handoff()).unwrap();
        let mut second = handoff();
        second.text = "second".into();
        defer_turn(&store, &second).unwrap();
        assert_eq!(take_pending(&store).unwrap().unwrap().text, "second");
    }

    #[test]
    fn test_unreadable_entry_discarded() {
        let store = InMemoryHandoffStore::new();
        store.put(PENDING_TURN_KEY, "{not json").unwrap();
        assert_eq!(take_pending(&store).unwrap(), None);
        assert_eq!(store.get(PENDING_TURN_KEY).unwrap(), None);
    }
}
