//! Retrieval coordination: whether a turn needs augmentation, and whether
//! generation has to wait for it.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use parley_core::config::RetrievalConfig;
use parley_core::events::DomainEvent;
use parley_core::types::ModelDescriptor;

use crate::backend::{GenerationPayload, RetrievalBackend, RetrievalResult};
use crate::bus::EventBus;
use crate::error::ChatError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetrievalMode {
    Skip,
    Parallel,
    Blocking,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Skip => "skip",
            RetrievalMode::Parallel => "parallel",
            RetrievalMode::Blocking => "blocking",
        }
    }
}

/// A decided retrieval together with its task.
///
/// `Blocking` must be awaited before generation starts. `Parallel` is
/// already running; its failures are absorbed into an empty result.
pub enum RetrievalPlan {
    Skip,
    Blocking(BoxFuture<'static, Result<RetrievalResult, ChatError>>),
    Parallel(JoinHandle<RetrievalResult>),
}

impl RetrievalPlan {
    pub fn mode(&self) -> RetrievalMode {
        match self {
            RetrievalPlan::Skip => RetrievalMode::Skip,
            RetrievalPlan::Blocking(_) => RetrievalMode::Blocking,
            RetrievalPlan::Parallel(_) => RetrievalMode::Parallel,
        }
    }
}

impl std::fmt::Debug for RetrievalPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RetrievalPlan").field(&self.mode()).finish()
    }
}

pub struct RetrievalCoordinator {
    backend: Arc<dyn RetrievalBackend>,
    dependent_models: Vec<String>,
    bus: EventBus,
}

impl RetrievalCoordinator {
    pub fn new(backend: Arc<dyn RetrievalBackend>, config: &RetrievalConfig, bus: EventBus) -> Self {
        Self {
            backend,
            dependent_models: config.dependent_models.clone(),
            bus,
        }
    }

    /// Pure decision rule for a payload and its resolved model.
    pub fn decide(&self, payload: &GenerationPayload, model: &ModelDescriptor) -> RetrievalMode {
        let grounding = payload.workflow.as_ref().map(|w| w.grounding).unwrap_or(false);
        let dependent =
            model.retrieval_dependent || self.dependent_models.iter().any(|m| *m == model.id);
        let needed = payload.citation_enabled || grounding || !payload.files.is_empty() || dependent;

        if !needed {
            RetrievalMode::Skip
        } else if !payload.files.is_empty() {
            RetrievalMode::Blocking
        } else {
            RetrievalMode::Parallel
        }
    }

    /// Decide and launch. A parallel task starts running immediately.
    pub fn maybe_retrieve(
        &self,
        conversation_id: Uuid,
        payload: &GenerationPayload,
        model: &ModelDescriptor,
    ) -> RetrievalPlan {
        let mode = self.decide(payload, model);
        tracing::debug!(
            conversation_id = %conversation_id,
            mode = mode.as_str(),
            files = payload.files.len(),
            "Retrieval decided"
        );

        let backend = self.backend.clone();
        let payload = payload.clone();
        match mode {
            RetrievalMode::Skip => RetrievalPlan::Skip,
            RetrievalMode::Blocking => {
                RetrievalPlan::Blocking(async move { backend.retrieve(&payload).await }.boxed())
            }
            RetrievalMode::Parallel => {
                let bus = self.bus.clone();
                RetrievalPlan::Parallel(tokio::spawn(async move {
                    match backend.retrieve(&payload).await {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::warn!(
                                conversation_id = %conversation_id,
                                error = %e,
                                "Background retrieval failed, continuing without citations"
                            );
                            bus.emit(DomainEvent::RetrievalFailed {
                                conversation_id,
                                reason: e.to_string(),
                                timestamp: Utc::now(),
                            });
                            RetrievalResult::default()
                        }
                    }
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::types::{FileReference, ModelCatalog, WorkflowRef};

    struct Fixed(Result<RetrievalResult, &'static str>);

    #[async_trait]
    impl RetrievalBackend for Fixed {
        async fn retrieve(&self, _: &GenerationPayload) -> Result<RetrievalResult, ChatError> {
            self.0
                .clone()
                .map_err(|e| ChatError::RetrievalProcessingFailed(e.to_string()))
        }
    }

    fn coordinator(result: Result<RetrievalResult, &'static str>) -> RetrievalCoordinator {
        RetrievalCoordinator::new(
            Arc::new(Fixed(result)),
            &RetrievalConfig::default(),
            EventBus::new(),
        )
    }

    fn payload() -> GenerationPayload {
        GenerationPayload {
            model: "gpt-4o-mini".into(),
            messages: vec![],
            prompt: String::new(),
            files: vec![],
            citation_enabled: false,
            workflow: None,
        }
    }

    fn baseline() -> ModelDescriptor {
        ModelCatalog::builtin().baseline().clone()
    }

    fn pdf() -> FileReference {
        FileReference {
            storage_id: "a".into(),
            display_name: "a.pdf".into(),
        }
    }

    // ---- decision rule ----

    #[test]
    fn test_plain_turn_skips() {
        let c = coordinator(Ok(RetrievalResult::default()));
        assert_eq!(c.decide(&payload(), &baseline()), RetrievalMode::Skip);
    }

    #[test]
    fn test_files_block() {
        let c = coordinator(Ok(RetrievalResult::default()));
        let mut p = payload();
        p.files.push(pdf());
        assert_eq!(c.decide(&p, &baseline()), RetrievalMode::Blocking);

        p.citation_enabled = true;
        assert_eq!(c.decide(&p, &baseline()), RetrievalMode::Blocking);
    }

    #[test]
    fn test_citations_run_parallel() {
        let c = coordinator(Ok(RetrievalResult::default()));
        let mut p = payload();
        p.citation_enabled = true;
        assert_eq!(c.decide(&p, &baseline()), RetrievalMode::Parallel);
    }

    #[test]
    fn test_workflow_grounding_runs_parallel() {
        let c = coordinator(Ok(RetrievalResult::default()));
        let mut p = payload();
        p.workflow = Some(WorkflowRef {
            grounding: true,
            ..WorkflowRef::default()
        });
        assert_eq!(c.decide(&p, &baseline()), RetrievalMode::Parallel);

        p.workflow = Some(WorkflowRef::default());
        assert_eq!(c.decide(&p, &baseline()), RetrievalMode::Skip);
    }

    #[test]
    fn test_dependent_model_runs_parallel() {
        let c = coordinator(Ok(RetrievalResult::default()));
        let grounded = ModelCatalog::builtin().find("gpt-4o-grounded").unwrap().clone();
        assert_eq!(c.decide(&payload(), &grounded), RetrievalMode::Parallel);
    }

    #[test]
    fn test_configured_dependent_model() {
        let config = RetrievalConfig {
            dependent_models: vec!["o3-mini".into()],
            ..RetrievalConfig::default()
        };
        let c = RetrievalCoordinator::new(
            Arc::new(Fixed(Ok(RetrievalResult::default()))),
            &config,
            EventBus::new(),
        );
        let model = ModelCatalog::builtin().find("o3-mini").unwrap().clone();
        assert_eq!(c.decide(&payload(), &model), RetrievalMode::Parallel);
    }

    // ---- launching ----

    #[tokio::test]
    async fn test_blocking_task_propagates_error() {
        let c = coordinator(Err("ocr failed"));
        let mut p = payload();
        p.files.push(pdf());
        match c.maybe_retrieve(Uuid::new_v4(), &p, &baseline()) {
            RetrievalPlan::Blocking(task) => {
                let err = task.await.unwrap_err();
                assert!(matches!(err, ChatError::RetrievalProcessingFailed(_)));
            }
            other => panic!("expected blocking plan, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parallel_failure_is_swallowed_and_reported() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let c = RetrievalCoordinator::new(
            Arc::new(Fixed(Err("index down"))),
            &RetrievalConfig::default(),
            bus,
        );
        let mut p = payload();
        p.citation_enabled = true;
        let id = Uuid::new_v4();

        match c.maybe_retrieve(id, &p, &baseline()) {
            RetrievalPlan::Parallel(task) => {
                let result = task.await.unwrap();
                assert_eq!(result, RetrievalResult::default());
            }
            other => panic!("expected parallel plan, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            DomainEvent::RetrievalFailed {
                conversation_id, ..
            } => assert_eq!(conversation_id, id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_skip_has_no_task() {
        let c = coordinator(Ok(RetrievalResult::default()));
        let plan = c.maybe_retrieve(Uuid::new_v4(), &payload(), &baseline());
        assert_eq!(plan.mode(), RetrievalMode::Skip);
    }
}
