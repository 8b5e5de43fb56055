use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Author of a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Where a token count came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    /// Reported by the backend in a trailing usage record.
    Backend,
    /// Estimated from character counts.
    #[default]
    Heuristic,
}

// =============================================================================
// Models
// =============================================================================

/// A model the backend can generate with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub display_label: String,
    pub token_limit: u32,
    /// Models that only answer from retrieved documents.
    #[serde(default)]
    pub retrieval_dependent: bool,
}

impl ModelDescriptor {
    pub fn new(id: &str, display_label: &str, token_limit: u32) -> Self {
        Self {
            id: id.to_string(),
            display_label: display_label.to_string(),
            token_limit,
            retrieval_dependent: false,
        }
    }
}

/// Static catalog of known models with a baseline fallback.
#[derive(Clone, Debug)]
pub struct ModelCatalog {
    models: Vec<ModelDescriptor>,
    baseline: usize,
}

/// Identifier of the model used when nothing else applies.
pub const BASELINE_MODEL_ID: &str = "gpt-4o-mini";

impl ModelCatalog {
    /// The catalog shipped with Parley.
    pub fn builtin() -> Self {
        let models = vec![
            ModelDescriptor::new("gpt-4o-mini", "GPT-4o mini", 128_000),
            ModelDescriptor::new("gpt-4o", "GPT-4o", 128_000),
            ModelDescriptor::new("o3-mini", "o3-mini", 200_000),
            ModelDescriptor {
                retrieval_dependent: true,
                ..ModelDescriptor::new("gpt-4o-grounded", "GPT-4o (grounded)", 128_000)
            },
        ];
        Self::new(models, BASELINE_MODEL_ID)
    }

    /// Build a catalog. If `baseline_id` is not present the first model
    /// becomes the baseline; an empty list falls back to the builtin set.
    pub fn new(models: Vec<ModelDescriptor>, baseline_id: &str) -> Self {
        if models.is_empty() {
            return Self::builtin();
        }
        let baseline = models
            .iter()
            .position(|m| m.id == baseline_id)
            .unwrap_or(0);
        Self { models, baseline }
    }

    pub fn find(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn baseline(&self) -> &ModelDescriptor {
        &self.models[self.baseline]
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Canonical reference to an uploaded file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    pub storage_id: String,
    pub display_name: String,
}

/// A source document backing part of an answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl Citation {
    pub fn file(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            page: None,
            excerpt: None,
        }
    }
}

/// One chat message.
///
/// The timestamp serializes as an RFC 3339 string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileReference>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
}

impl Message {
    pub fn user(content: &str, files: Vec<FileReference>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
            timestamp,
            files: if files.is_empty() { None } else { Some(files) },
            citations: None,
        }
    }

    /// An empty assistant message, created when streaming starts.
    pub fn assistant(timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            timestamp,
            files: None,
            citations: None,
        }
    }

    /// Whether this message is identified by `(role, timestamp)`.
    pub fn is_same(&self, role: Role, timestamp: DateTime<Utc>) -> bool {
        self.role == role && self.timestamp == timestamp
    }
}

// =============================================================================
// Conversations
// =============================================================================

/// A named agent preset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRef {
    pub id: String,
    pub name: String,
    /// System prompt the workflow applies.
    #[serde(default)]
    pub prompt: String,
    /// Model hint, mapped through the workflow model table.
    #[serde(default)]
    pub model: Option<String>,
    /// Whether answers should carry citations.
    #[serde(default)]
    pub citation: bool,
    /// Whether generation should be grounded in retrieved documents.
    #[serde(default)]
    pub grounding: bool,
}

/// A chat thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub name: String,
    pub messages: Vec<Message>,
    pub model: ModelDescriptor,
    pub workflow: Option<WorkflowRef>,
    #[serde(default)]
    pub prompt: String,
}

/// Longest generated conversation name, in characters.
const MAX_NAME_CHARS: usize = 48;

impl Conversation {
    pub fn new(name: &str, model: ModelDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            messages: Vec::new(),
            model,
            workflow: None,
            prompt: String::new(),
        }
    }

    /// Derive a conversation name from the first user message.
    pub fn name_from(text: &str) -> String {
        let first_line = text.lines().next().unwrap_or("").trim();
        if first_line.is_empty() {
            return "New conversation".to_string();
        }
        let mut name: String = first_line.chars().take(MAX_NAME_CHARS).collect();
        if first_line.chars().count() > MAX_NAME_CHARS {
            name.push_str("...");
        }
        name
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// A millisecond-precision timestamp for a new message with `role` that
    /// does not collide with any existing message of the same role.
    pub fn next_timestamp(&self, role: Role, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut candidate = DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis())
            .unwrap_or(now);
        while self.messages.iter().any(|m| m.is_same(role, candidate)) {
            candidate += chrono::Duration::milliseconds(1);
        }
        candidate
    }
}

// =============================================================================
// Token usage
// =============================================================================

/// Token counts for one turn plus the running session total.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageSnapshot {
    pub input_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
    pub session_total_tokens: u64,
    pub source: UsageSource,
}
