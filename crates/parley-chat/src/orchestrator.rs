//! Turn orchestrator: central coordinator for one chat turn.
//!
//! Resolves the model, runs retrieval blocking or in parallel with
//! generation, assembles the streamed reply, joins late citations, updates
//! token usage and persists the result. At most one turn runs per
//! conversation at a time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use parley_core::config::ParleyConfig;
use parley_core::events::DomainEvent;
use parley_core::types::{
    Conversation, FileReference, Message, ModelDescriptor, Role, TokenUsageSnapshot,
    UsageSource, WorkflowRef,
};
use parley_storage::{ConversationStore, HandoffStore};

use crate::backend::{GenerationBackend, GenerationPayload, RetrievalBackend};
use crate::bus::EventBus;
use crate::citations::{CitationInjector, CitationSource};
use crate::clock::Clock;
use crate::error::ChatError;
use crate::files;
use crate::handoff::{self, TurnHandoff};
use crate::message::{MessageHandle, Republisher, UpdateKind};
use crate::model::ModelResolver;
use crate::persist::{self, ConversationPersister};
use crate::retrieval::{RetrievalCoordinator, RetrievalMode, RetrievalPlan};
use crate::stream::{AssembledReply, StreamAssembler, StreamUpdate};
use crate::tokens::{DisplayShield, Observation, ShieldState, TokenUsageEstimator, TokenUsageTracker};

/// Assistant text when the backend could not be reached at all.
const CONTACT_FAILED_TEXT: &str = "There was an error contacting the server.";

/// External collaborators the orchestrator calls into.
pub struct Collaborators {
    pub generation: Arc<dyn GenerationBackend>,
    pub retrieval: Arc<dyn RetrievalBackend>,
    pub store: Arc<dyn ConversationStore>,
    pub handoff: Arc<dyn HandoffStore>,
    pub republisher: Arc<dyn Republisher>,
}

/// Everything a turn needs from the UI, passed explicitly.
#[derive(Clone, Debug, Default)]
pub struct TurnRequest {
    /// `None` starts a new conversation.
    pub conversation_id: Option<Uuid>,
    pub text: String,
    /// Raw upload references; normalized before use.
    pub files: Vec<Value>,
    pub workflow: Option<WorkflowRef>,
    /// Override used when replaying a deferred turn.
    pub explicit_model: Option<String>,
    pub user_selected_model: Option<String>,
    /// `None` uses the current citation setting.
    pub citations_enabled: Option<bool>,
    /// Unsent text in the input box while the turn runs.
    pub typed_input: String,
}

impl TurnRequest {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }

    pub fn in_conversation(mut self, id: Uuid) -> Self {
        self.conversation_id = Some(id);
        self
    }
}

#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub conversation_id: Uuid,
    pub message_index: usize,
    /// Assistant message as it stood when the turn returned.
    pub message: Message,
    pub model: ModelDescriptor,
    pub retrieval_mode: RetrievalMode,
    pub usage: TokenUsageSnapshot,
    pub displayed_tokens: u64,
    /// The reply was cut short by a generation or stream failure.
    pub interrupted: bool,
    /// The stored record matches the local conversation.
    pub synced: bool,
}

struct Prepared {
    payload: GenerationPayload,
    model: ModelDescriptor,
    user_index: usize,
    user_timestamp: DateTime<Utc>,
    previous: ConversationSettings,
}

/// Conversation fields a turn overwrites before it can still be aborted.
struct ConversationSettings {
    model: ModelDescriptor,
    workflow: Option<WorkflowRef>,
    prompt: String,
}

#[derive(Default)]
struct SessionState {
    tracker: TokenUsageTracker,
    shield: ShieldState,
}

/// Marks a conversation as having a turn in flight for as long as it lives.
struct TurnGuard {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    conversation_id: Uuid,
}

impl TurnGuard {
    fn acquire(in_flight: &Arc<Mutex<HashSet<Uuid>>>, conversation_id: Uuid) -> Result<Self, ChatError> {
        if !lock(in_flight)?.insert(conversation_id) {
            return Err(ChatError::TurnInProgress(conversation_id));
        }
        Ok(Self {
            in_flight: in_flight.clone(),
            conversation_id,
        })
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.conversation_id);
        }
    }
}

pub struct TurnOrchestrator {
    resolver: ModelResolver,
    retrieval: RetrievalCoordinator,
    assembler: StreamAssembler,
    injector: CitationInjector,
    estimator: TokenUsageEstimator,
    persister: ConversationPersister,
    generation: Arc<dyn GenerationBackend>,
    handoff: Arc<dyn HandoffStore>,
    republisher: Arc<dyn Republisher>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    citation_wait: Duration,
    citations_enabled: Arc<AtomicBool>,
    live: Mutex<HashMap<Uuid, Arc<Mutex<Conversation>>>>,
    conversations: Mutex<Vec<Conversation>>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    session: Mutex<SessionState>,
}

impl TurnOrchestrator {
    pub fn new(
        config: &ParleyConfig,
        collaborators: Collaborators,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let citations_enabled = Arc::new(AtomicBool::new(config.retrieval.citations_by_default));
        let flag = citations_enabled.clone();
        bus.on("citation_setting_changed", move |event| {
            if let DomainEvent::CitationSettingChanged { enabled, .. } = event {
                flag.store(*enabled, Ordering::SeqCst);
            }
        });

        Self {
            resolver: ModelResolver::from_config(&config.models),
            retrieval: RetrievalCoordinator::new(
                collaborators.retrieval,
                &config.retrieval,
                bus.clone(),
            ),
            assembler: StreamAssembler::new(clock.clone(), &config.stream),
            injector: CitationInjector::new(bus.clone()),
            estimator: TokenUsageEstimator::new(&config.tokens),
            persister: ConversationPersister::new(collaborators.store),
            generation: collaborators.generation,
            handoff: collaborators.handoff,
            republisher: collaborators.republisher,
            bus,
            clock,
            citation_wait: Duration::from_millis(config.retrieval.citation_wait_ms),
            citations_enabled,
            live: Mutex::new(HashMap::new()),
            conversations: Mutex::new(Vec::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            session: Mutex::new(SessionState::default()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    pub fn citations_enabled(&self) -> bool {
        self.citations_enabled.load(Ordering::SeqCst)
    }

    /// Toggle citations the same way a UI collaborator would.
    pub fn set_citations(&self, enabled: bool) {
        self.bus.emit(DomainEvent::CitationSettingChanged {
            enabled,
            timestamp: Utc::now(),
        });
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    /// Local conversation list, sorted by name.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations
            .lock()
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let mut list = self.persister.store().list().await?;
        persist::sort_by_name(&mut list);
        *lock(&self.conversations)? = list.clone();
        Ok(list)
    }

    /// Current local state of a conversation.
    pub fn conversation(&self, id: Uuid) -> Option<Conversation> {
        let live = self.live.lock().ok()?.get(&id).cloned();
        match live {
            Some(conv) => conv.lock().ok().map(|c| c.clone()),
            None => self
                .conversations
                .lock()
                .ok()?
                .iter()
                .find(|c| c.id == id)
                .cloned(),
        }
    }

    /// Start over with a fresh session total. The displayed figure follows
    /// on the next observation.
    pub fn new_conversation(&self) {
        if let Ok(mut session) = self.session.lock() {
            session.tracker.reset();
        }
        tracing::debug!("Session token total reset");
    }

    /// Token figure to show for the current input box state.
    pub fn display_tokens(&self, typed_input: &str) -> u64 {
        let Ok(mut session) = self.session.lock() else {
            return 0;
        };
        let (state, shown) = DisplayShield::observe(
            session.shield,
            Observation {
                candidate: session.tracker.session_total(),
                typing: !typed_input.trim().is_empty(),
                backend_total: None,
            },
        );
        session.shield = state;
        shown
    }

    // =========================================================================
    // Truncating operations
    // =========================================================================

    /// Keep only the first `index` messages. Returns the remaining count.
    pub async fn truncate(&self, conversation_id: Uuid, index: usize) -> Result<usize, ChatError> {
        let conversation = self.live_conversation(conversation_id).await?;
        {
            let mut conv = lock(&conversation)?;
            let len = conv.messages.len();
            if index > len {
                return Err(ChatError::MessageIndexOutOfRange { index, len });
            }
            conv.messages.truncate(index);
        }
        tracing::info!(conversation_id = %conversation_id, remaining = index, "Conversation truncated");
        self.bus.emit(DomainEvent::ConversationTruncated {
            conversation_id,
            remaining: index,
            timestamp: Utc::now(),
        });
        Ok(index)
    }

    /// Remove the message at `index` and everything after it.
    pub async fn delete_message(&self, conversation_id: Uuid, index: usize) -> Result<usize, ChatError> {
        self.message_at(conversation_id, index).await?;
        self.truncate(conversation_id, index).await
    }

    /// Replace the user message at `index` and re-run the turn from there.
    pub async fn edit_message(
        &self,
        conversation_id: Uuid,
        index: usize,
        text: &str,
    ) -> Result<TurnOutcome, ChatError> {
        if lock(&self.in_flight)?.contains(&conversation_id) {
            return Err(ChatError::TurnInProgress(conversation_id));
        }
        let original = self.message_at(conversation_id, index).await?;
        if original.role != Role::User {
            return Err(ChatError::NotUserMessage(index));
        }
        self.truncate(conversation_id, index).await?;

        let conv = self
            .conversation(conversation_id)
            .ok_or(ChatError::ConversationNotFound(conversation_id))?;
        let request = TurnRequest {
            conversation_id: Some(conversation_id),
            text: text.to_string(),
            files: to_raw(&original.files.unwrap_or_default()),
            workflow: conv.workflow.clone(),
            user_selected_model: Some(conv.model.id.clone()),
            ..TurnRequest::default()
        };
        self.run_turn(request).await
    }

    /// Re-run the last user turn.
    pub async fn regenerate(&self, conversation_id: Uuid) -> Result<TurnOutcome, ChatError> {
        let conversation = self.live_conversation(conversation_id).await?;
        let (index, text) = {
            let conv = lock(&conversation)?;
            let len = conv.messages.len();
            let index = conv
                .messages
                .iter()
                .rposition(|m| m.role == Role::User)
                .ok_or(ChatError::MessageIndexOutOfRange { index: len, len })?;
            (index, conv.messages[index].content.clone())
        };
        self.edit_message(conversation_id, index, &text).await
    }

    // =========================================================================
    // Handoff
    // =========================================================================

    /// Store a turn to be replayed after a navigation, pinning the model it
    /// would use now.
    pub fn defer_turn(&self, request: &TurnRequest) -> Result<(), ChatError> {
        let conversation = request.conversation_id.and_then(|id| self.conversation(id));
        let resolution = self.resolver.resolve(
            request.explicit_model.as_deref(),
            request.workflow.as_ref(),
            conversation.as_ref(),
            request.user_selected_model.as_deref(),
        );
        let deferred = TurnHandoff {
            conversation_id: request.conversation_id,
            text: request.text.clone(),
            files: files::normalize(&request.files),
            workflow: request.workflow.clone(),
            model_id: resolution.model.id,
            citations_enabled: request.citations_enabled,
        };
        handoff::defer_turn(self.handoff.as_ref(), &deferred)
    }

    /// Run the deferred turn, if there is one.
    pub async fn replay_pending(&self) -> Result<Option<TurnOutcome>, ChatError> {
        let Some(deferred) = handoff::take_pending(self.handoff.as_ref())? else {
            return Ok(None);
        };

        let conversation_id = match deferred.conversation_id {
            Some(id) => match self.live_conversation(id).await {
                Ok(_) => Some(id),
                Err(ChatError::ConversationNotFound(_)) => {
                    tracing::warn!(conversation_id = %id, "Deferred conversation missing, starting a new one");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        tracing::info!(model = %deferred.model_id, "Replaying deferred turn");
        let request = TurnRequest {
            conversation_id,
            text: deferred.text,
            files: to_raw(&deferred.files),
            workflow: deferred.workflow,
            explicit_model: Some(deferred.model_id),
            citations_enabled: deferred.citations_enabled,
            ..TurnRequest::default()
        };
        self.run_turn(request).await.map(Some)
    }

    // =========================================================================
    // Turn
    // =========================================================================

    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome, ChatError> {
        let files = files::normalize(&request.files);
        if request.text.trim().is_empty() && files.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let (conversation, created) = match request.conversation_id {
            Some(id) => (self.live_conversation(id).await?, false),
            None => (self.start_conversation(&request, &files)?, true),
        };
        let conversation_id = lock(&conversation)?.id;
        let _guard = TurnGuard::acquire(&self.in_flight, conversation_id)?;

        let prepared = self.prepare(&conversation, &request, files)?;
        if !prepared.payload.files.is_empty() {
            self.bus.emit(DomainEvent::FilesAttached {
                conversation_id,
                files: prepared.payload.files.clone(),
                has_audio: prepared.payload.files.iter().any(files::is_audio),
                timestamp: Utc::now(),
            });
        }

        // Retrieval
        let plan = self
            .retrieval
            .maybe_retrieve(conversation_id, &prepared.payload, &prepared.model);
        let mode = plan.mode();
        let mut payload = prepared.payload;
        let citation_source = match plan {
            RetrievalPlan::Skip => None,
            RetrievalPlan::Parallel(task) => Some(CitationSource::Pending(task)),
            RetrievalPlan::Blocking(task) => match task.await {
                Ok(mut result) => {
                    if let Some(prompt) = result.prompt() {
                        payload.prompt = prompt.to_string();
                    }
                    result.take_citations().map(CitationSource::Resolved)
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %e,
                        "Blocking retrieval failed, aborting turn"
                    );
                    self.rollback(
                        &conversation,
                        prepared.user_index,
                        prepared.user_timestamp,
                        prepared.previous,
                        created,
                    )?;
                    return Err(e);
                }
            },
        };

        tracing::info!(
            conversation_id = %conversation_id,
            model = %prepared.model.id,
            retrieval = mode.as_str(),
            "Turn started"
        );
        self.bus.emit(DomainEvent::TurnStarted {
            conversation_id,
            model_id: prepared.model.id.clone(),
            retrieval_mode: mode.as_str().to_string(),
            timestamp: Utc::now(),
        });

        // Assistant message and citations
        let (message_index, assistant_timestamp) = {
            let mut conv = lock(&conversation)?;
            let timestamp = conv.next_timestamp(Role::Assistant, self.clock.now());
            conv.messages.push(Message::assistant(timestamp));
            (conv.messages.len() - 1, timestamp)
        };
        let handle = MessageHandle::bind(conversation.clone(), message_index, self.republisher.clone())
            .ok_or(ChatError::MessageIndexOutOfRange {
                index: message_index,
                len: message_index,
            })?;
        let pending_citations =
            citation_source.and_then(|source| self.injector.inject(handle.clone(), source));

        // Generation
        let reply = self.stream_reply(&handle, &payload).await;
        self.bus.emit(DomainEvent::TurnCompleted {
            conversation_id,
            content_length: reply.content.len(),
            interrupted: reply.interrupted,
            timestamp: Utc::now(),
        });

        let (usage, displayed_tokens) =
            self.record_usage(&reply.raw_body, &payload.messages, &request.typed_input)?;
        self.bus.emit(DomainEvent::TokenUsageUpdated {
            conversation_id,
            usage: usage.clone(),
            displayed: displayed_tokens,
            timestamp: Utc::now(),
        });

        if let Some(mut continuation) = pending_citations {
            if tokio::time::timeout(self.citation_wait, &mut continuation)
                .await
                .is_err()
            {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    "Citations still pending, persisting without them"
                );
            }
        }

        let synced = self.persist(&conversation).await?;

        let message = handle.snapshot().unwrap_or_else(|| Message {
            content: reply.content.clone(),
            ..Message::assistant(assistant_timestamp)
        });
        Ok(TurnOutcome {
            conversation_id,
            message_index,
            message,
            model: prepared.model,
            retrieval_mode: mode,
            usage,
            displayed_tokens,
            interrupted: reply.interrupted,
            synced,
        })
    }

    fn prepare(
        &self,
        conversation: &Arc<Mutex<Conversation>>,
        request: &TurnRequest,
        files: Vec<FileReference>,
    ) -> Result<Prepared, ChatError> {
        let (prepared, implied) = {
            let mut conv = lock(conversation)?;
            let previous = ConversationSettings {
                model: conv.model.clone(),
                workflow: conv.workflow.clone(),
                prompt: conv.prompt.clone(),
            };
            if let Some(workflow) = &request.workflow {
                conv.prompt = workflow.prompt.clone();
                conv.workflow = Some(workflow.clone());
            }
            let workflow = conv.workflow.clone();

            let resolution = self.resolver.resolve(
                request.explicit_model.as_deref(),
                workflow.as_ref(),
                Some(&*conv),
                request.user_selected_model.as_deref(),
            );
            tracing::debug!(
                model = %resolution.model.id,
                source = ?resolution.source,
                "Resolved model"
            );
            let implied = self.resolver.implied_event(&resolution, workflow.as_ref());
            conv.model = resolution.model.clone();

            let user_timestamp = conv.next_timestamp(Role::User, self.clock.now());
            conv.messages
                .push(Message::user(&request.text, files.clone(), user_timestamp));

            let citation_enabled = request
                .citations_enabled
                .unwrap_or_else(|| self.citations_enabled())
                || workflow.as_ref().map(|w| w.citation).unwrap_or(false);

            let prepared = Prepared {
                payload: GenerationPayload {
                    model: resolution.model.id.clone(),
                    messages: conv.messages.clone(),
                    prompt: conv.prompt.clone(),
                    files,
                    citation_enabled,
                    workflow,
                },
                model: resolution.model,
                user_index: conv.messages.len() - 1,
                user_timestamp,
                previous,
            };
            (prepared, implied)
        };

        // Bus handlers may read the conversation.
        if let Some(event) = implied {
            self.bus.emit(event);
        }
        Ok(prepared)
    }

    async fn stream_reply(&self, handle: &MessageHandle, payload: &GenerationPayload) -> AssembledReply {
        let source = match self.generation.generate(payload).await {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(
                    conversation_id = %handle.conversation_id(),
                    error = %e,
                    "Generation call failed"
                );
                let content = e.user_message().unwrap_or(CONTACT_FAILED_TEXT).to_string();
                handle.set_content(&content, UpdateKind::Final);
                return AssembledReply {
                    content,
                    raw_body: String::new(),
                    interrupted: true,
                    chunks: 0,
                };
            }
        };

        let mut updates = Box::pin(self.assembler.consume(source));
        let mut assembled = None;
        while let Some(update) = updates.next().await {
            match update {
                StreamUpdate::Partial(content) => {
                    handle.set_content(&content, UpdateKind::Partial);
                }
                StreamUpdate::Final(reply) => {
                    handle.set_content(&reply.content, UpdateKind::Final);
                    assembled = Some(reply);
                }
            }
        }
        assembled.unwrap_or(AssembledReply {
            content: String::new(),
            raw_body: String::new(),
            interrupted: true,
            chunks: 0,
        })
    }

    fn record_usage(
        &self,
        raw_body: &str,
        history: &[Message],
        typed_input: &str,
    ) -> Result<(TokenUsageSnapshot, u64), ChatError> {
        let mut session = lock(&self.session)?;
        let usage = self
            .estimator
            .estimate(raw_body, history, session.tracker.session_total());
        session.tracker.record(&usage);

        let backend_total =
            (usage.source == UsageSource::Backend).then_some(usage.session_total_tokens);
        let (state, shown) = DisplayShield::observe(
            session.shield,
            Observation {
                candidate: usage.session_total_tokens,
                typing: !typed_input.trim().is_empty(),
                backend_total,
            },
        );
        session.shield = state;
        Ok((usage, shown))
    }

    /// Persist the conversation as it stands. Failures leave the local state
    /// in place and are reported as `false`.
    async fn persist(&self, conversation: &Arc<Mutex<Conversation>>) -> Result<bool, ChatError> {
        let snapshot = lock(conversation)?.clone();
        match self.persister.persist(&snapshot).await {
            Ok(record) => {
                let mut list = lock(&self.conversations)?;
                let mut merged = persist::merge(std::mem::take(&mut *list), record);
                persist::sort_by_name(&mut merged);
                *list = merged;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %snapshot.id,
                    error = %e,
                    "Conversation not persisted, local copy is unsynced"
                );
                self.bus.emit(DomainEvent::ConversationUnsynced {
                    conversation_id: snapshot.id,
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                });
                Ok(false)
            }
        }
    }

    fn rollback(
        &self,
        conversation: &Arc<Mutex<Conversation>>,
        user_index: usize,
        user_timestamp: DateTime<Utc>,
        previous: ConversationSettings,
        created: bool,
    ) -> Result<(), ChatError> {
        let (id, empty) = {
            let mut conv = lock(conversation)?;
            let ours = conv
                .messages
                .get(user_index)
                .map(|m| m.is_same(Role::User, user_timestamp))
                .unwrap_or(false);
            if ours {
                conv.messages.truncate(user_index);
                conv.model = previous.model;
                conv.workflow = previous.workflow;
                conv.prompt = previous.prompt;
            }
            (conv.id, conv.is_empty())
        };
        if created && empty {
            lock(&self.live)?.remove(&id);
        }
        Ok(())
    }

    fn start_conversation(
        &self,
        request: &TurnRequest,
        files: &[FileReference],
    ) -> Result<Arc<Mutex<Conversation>>, ChatError> {
        let title = match files.first() {
            Some(file) if request.text.trim().is_empty() => file.display_name.clone(),
            _ => request.text.clone(),
        };
        let conv = Conversation::new(
            &Conversation::name_from(&title),
            self.resolver.catalog().baseline().clone(),
        );
        let id = conv.id;
        let conv = Arc::new(Mutex::new(conv));
        lock(&self.live)?.insert(id, conv.clone());
        tracing::info!(conversation_id = %id, "Conversation started");
        Ok(conv)
    }

    async fn live_conversation(&self, id: Uuid) -> Result<Arc<Mutex<Conversation>>, ChatError> {
        let cached = lock(&self.live)?.get(&id).cloned();
        if let Some(conv) = cached {
            return Ok(conv);
        }

        let loaded = self
            .persister
            .store()
            .load(id)
            .await?
            .ok_or(ChatError::ConversationNotFound(id))?;
        let mut live = lock(&self.live)?;
        let conv = live
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(loaded)))
            .clone();
        Ok(conv)
    }

    async fn message_at(&self, conversation_id: Uuid, index: usize) -> Result<Message, ChatError> {
        let conversation = self.live_conversation(conversation_id).await?;
        let conv = lock(&conversation)?;
        let found = conv.messages.get(index).cloned();
        found.ok_or(ChatError::MessageIndexOutOfRange {
            index,
            len: conv.messages.len(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, ChatError> {
    mutex
        .lock()
        .map_err(|e| ChatError::Storage(format!("state lock poisoned: {}", e)))
}

fn to_raw(files: &[FileReference]) -> Vec<Value> {
    files
        .iter()
        .filter_map(|f| serde_json::to_value(f).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChunkStream, RetrievalResult};
    use crate::clock::SystemClock;
    use crate::message::MessageUpdate;
    use async_trait::async_trait;
    use futures::stream;
    use parley_storage::{InMemoryConversationStore, InMemoryHandoffStore};
    use tokio::sync::mpsc;

    struct Echo {
        payloads: Mutex<Vec<GenerationPayload>>,
    }

    #[async_trait]
    impl GenerationBackend for Echo {
        async fn generate(&self, payload: &GenerationPayload) -> Result<ChunkStream, ChatError> {
            self.payloads.lock().unwrap().push(payload.clone());
            let last = payload
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let chunks: Vec<Result<String, ChatError>> =
                vec![Ok("echo: ".to_string()), Ok(last)];
            Ok(stream::iter(chunks).boxed())
        }
    }

    struct NoRetrieval;

    #[async_trait]
    impl RetrievalBackend for NoRetrieval {
        async fn retrieve(&self, _: &GenerationPayload) -> Result<RetrievalResult, ChatError> {
            Ok(RetrievalResult::default())
        }
    }

    struct Harness {
        orchestrator: TurnOrchestrator,
        generation: Arc<Echo>,
        store: Arc<InMemoryConversationStore>,
        _updates: mpsc::UnboundedReceiver<MessageUpdate>,
    }

    fn harness() -> Harness {
        let generation = Arc::new(Echo {
            payloads: Mutex::new(Vec::new()),
        });
        let store = Arc::new(InMemoryConversationStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = TurnOrchestrator::new(
            &ParleyConfig::default(),
            Collaborators {
                generation: generation.clone(),
                retrieval: Arc::new(NoRetrieval),
                store: store.clone(),
                handoff: Arc::new(InMemoryHandoffStore::new()),
                republisher: Arc::new(tx),
            },
            EventBus::new(),
            Arc::new(SystemClock),
        );
        Harness {
            orchestrator,
            generation,
            store,
            _updates: rx,
        }
    }

    // ---- basic turn ----

    #[tokio::test]
    async fn test_turn_starts_conversation_and_persists() {
        let h = harness();
        let outcome = h.orchestrator.run_turn(TurnRequest::new("hello")).await.unwrap();
        assert_eq!(outcome.message.content, "echo: hello");
        assert!(outcome.synced);
        assert!(!outcome.interrupted);
        assert_eq!(h.store.len(), 1);

        let list = h.orchestrator.conversations();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "hello");
        assert_eq!(list[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let h = harness();
        let err = h.orchestrator.run_turn(TurnRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyMessage));
    }

    #[tokio::test]
    async fn test_unknown_conversation_rejected() {
        let h = harness();
        let err = h
            .orchestrator
            .run_turn(TurnRequest::new("hi").in_conversation(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn test_turn_in_progress_fails_fast() {
        let h = harness();
        let first = h.orchestrator.run_turn(TurnRequest::new("one")).await.unwrap();
        let _held = TurnGuard::acquire(&h.orchestrator.in_flight, first.conversation_id).unwrap();
        let err = h
            .orchestrator
            .run_turn(TurnRequest::new("two").in_conversation(first.conversation_id))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::TurnInProgress(_)));
    }

    #[tokio::test]
    async fn test_guard_released_after_turn() {
        let h = harness();
        let first = h.orchestrator.run_turn(TurnRequest::new("one")).await.unwrap();
        let second = h
            .orchestrator
            .run_turn(TurnRequest::new("two").in_conversation(first.conversation_id))
            .await
            .unwrap();
        assert_eq!(second.message_index, 3);
    }

    // ---- truncation ----

    #[tokio::test]
    async fn test_regenerate_replaces_last_turn() {
        let h = harness();
        let first = h.orchestrator.run_turn(TurnRequest::new("one")).await.unwrap();
        let id = first.conversation_id;
        h.orchestrator
            .run_turn(TurnRequest::new("two").in_conversation(id))
            .await
            .unwrap();

        let outcome = h.orchestrator.regenerate(id).await.unwrap();
        assert_eq!(outcome.message_index, 3);
        assert!(outcome.synced);
        let conv = h.orchestrator.conversation(id).unwrap();
        assert_eq!(conv.messages.len(), 4);
        assert_eq!(conv.messages[2].content, "two");
    }

    #[tokio::test]
    async fn test_edit_rejects_assistant_message() {
        let h = harness();
        let first = h.orchestrator.run_turn(TurnRequest::new("one")).await.unwrap();
        let err = h
            .orchestrator
            .edit_message(first.conversation_id, 1, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotUserMessage(1)));
    }

    #[tokio::test]
    async fn test_edit_earlier_turn_is_unsynced() {
        let h = harness();
        let first = h.orchestrator.run_turn(TurnRequest::new("one")).await.unwrap();
        let id = first.conversation_id;
        h.orchestrator
            .run_turn(TurnRequest::new("two").in_conversation(id))
            .await
            .unwrap();

        // 4 stored messages; editing the first leaves 2 locally.
        let outcome = h.orchestrator.edit_message(id, 0, "uno").await.unwrap();
        assert!(!outcome.synced);
        let conv = h.orchestrator.conversation(id).unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[1].content, "echo: uno");
    }

    #[tokio::test]
    async fn test_delete_message_out_of_range() {
        let h = harness();
        let first = h.orchestrator.run_turn(TurnRequest::new("one")).await.unwrap();
        let err = h
            .orchestrator
            .delete_message(first.conversation_id, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::MessageIndexOutOfRange { index: 2, len: 2 }));

        let remaining = h
            .orchestrator
            .delete_message(first.conversation_id, 1)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    // ---- settings and handoff ----

    #[tokio::test]
    async fn test_citation_setting_follows_bus() {
        let h = harness();
        assert!(!h.orchestrator.citations_enabled());
        h.orchestrator.set_citations(true);
        assert!(h.orchestrator.citations_enabled());

        h.orchestrator.run_turn(TurnRequest::new("q")).await.unwrap();
        let payloads = h.generation.payloads.lock().unwrap();
        assert!(payloads[0].citation_enabled);
    }

    #[tokio::test]
    async fn test_defer_and_replay_uses_pinned_model() {
        let h = harness();
        let request = TurnRequest {
            user_selected_model: Some("o3-mini".into()),
            ..TurnRequest::new("later")
        };
        h.orchestrator.defer_turn(&request).unwrap();

        let outcome = h.orchestrator.replay_pending().await.unwrap().unwrap();
        assert_eq!(outcome.model.id, "o3-mini");
        assert_eq!(outcome.message.content, "echo: later");
        assert!(h.orchestrator.replay_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_conversation_resets_session_total() {
        let h = harness();
        let outcome = h.orchestrator.run_turn(TurnRequest::new("one")).await.unwrap();
        assert!(outcome.usage.session_total_tokens > 0);

        h.orchestrator.new_conversation();
        // Still typing: the old figure stays on screen.
        assert_eq!(
            h.orchestrator.display_tokens("draft"),
            outcome.displayed_tokens
        );
        // Input cleared: the reset total shows.
        assert_eq!(h.orchestrator.display_tokens(""), 0);
    }
}
