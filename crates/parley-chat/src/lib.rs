//! Response orchestration for Parley.
//!
//! Coordinates one chat turn end to end: model resolution, retrieval
//! augmentation (blocking or in parallel with generation), throttled stream
//! assembly, late citation injection, token usage estimation and
//! conversation persistence.

pub mod backend;
pub mod bus;
pub mod citations;
pub mod clock;
pub mod error;
pub mod files;
pub mod handoff;
pub mod message;
pub mod model;
pub mod orchestrator;
pub mod persist;
pub mod retrieval;
pub mod stream;
pub mod tokens;

pub use backend::{
    ChunkStream, GenerationBackend, GenerationPayload, RetrievalBackend, RetrievalResult,
};
pub use bus::EventBus;
pub use citations::{CitationInjector, CitationSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ChatError;
pub use handoff::TurnHandoff;
pub use message::{MessageHandle, MessageUpdate, Republisher, UpdateKind};
pub use model::{ModelResolver, ModelSource, Resolution};
pub use orchestrator::{Collaborators, TurnOrchestrator, TurnOutcome, TurnRequest};
pub use persist::ConversationPersister;
pub use retrieval::{RetrievalCoordinator, RetrievalMode, RetrievalPlan};
pub use stream::{AssembledReply, StreamAssembler, StreamUpdate, USAGE_MARKER};
pub use tokens::{DisplayShield, Observation, ShieldState, TokenUsageEstimator, TokenUsageTracker};
