//! Boundary contracts for the generation and retrieval calls.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use parley_core::types::{Citation, FileReference, Message, WorkflowRef};

use crate::error::ChatError;

/// Incrementally delivered reply text. Concatenating every `Ok` item yields
/// the full response body.
pub type ChunkStream = BoxStream<'static, Result<String, ChatError>>;

/// Input shared by the generation and retrieval calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationPayload {
    pub model: String,
    pub messages: Vec<Message>,
    pub prompt: String,
    pub files: Vec<FileReference>,
    pub citation_enabled: bool,
    pub workflow: Option<WorkflowRef>,
}

/// Output of a successful retrieval call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    #[serde(default)]
    pub augmented_prompt: Option<String>,
    #[serde(default)]
    pub citations: Option<Vec<Citation>>,
}

impl RetrievalResult {
    /// The augmented prompt, if the backend returned a non-blank one.
    pub fn prompt(&self) -> Option<&str> {
        self.augmented_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
    }

    /// Citations worth attaching; an empty list counts as none.
    pub fn take_citations(&mut self) -> Option<Vec<Citation>> {
        self.citations.take().filter(|c| !c.is_empty())
    }
}

/// The primary language-model call.
///
/// Returns `Err(GenerationCallFailed)` when the call fails before any bytes
/// arrive. Failures after that are yielded inside the stream as
/// `StreamReadFailed`.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, payload: &GenerationPayload) -> Result<ChunkStream, ChatError>;
}

/// The retrieval-augmentation call.
///
/// Errors are classified as `RetrievalNotFound` (files missing from
/// storage) or `RetrievalProcessingFailed`.
#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    async fn retrieve(&self, payload: &GenerationPayload) -> Result<RetrievalResult, ChatError>;
}
