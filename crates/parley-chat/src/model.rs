//! Model resolution for a turn.

use std::collections::HashMap;

use chrono::Utc;

use parley_core::config::ModelsConfig;
use parley_core::events::DomainEvent;
use parley_core::types::{Conversation, ModelCatalog, ModelDescriptor, WorkflowRef};

/// Which candidate source decided the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelSource {
    Explicit,
    Workflow,
    Conversation,
    UserSelected,
    Baseline,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub model: ModelDescriptor,
    pub source: ModelSource,
}

/// Picks the active model from, in order: an explicit override, the active
/// workflow's model hint, the model bound to a non-empty conversation, and
/// the user's selection. Always produces a descriptor.
#[derive(Clone, Debug)]
pub struct ModelResolver {
    catalog: ModelCatalog,
    workflow_models: HashMap<String, String>,
}

impl ModelResolver {
    pub fn new(catalog: ModelCatalog, workflow_models: HashMap<String, String>) -> Self {
        Self {
            catalog,
            workflow_models,
        }
    }

    /// Build a resolver over the builtin catalog with the configured
    /// baseline and workflow lookup table.
    pub fn from_config(config: &ModelsConfig) -> Self {
        let builtin = ModelCatalog::builtin();
        let catalog = ModelCatalog::new(builtin.models().to_vec(), &config.default_model);
        Self::new(catalog, config.workflow_models.clone())
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn resolve(
        &self,
        explicit: Option<&str>,
        workflow: Option<&WorkflowRef>,
        conversation: Option<&Conversation>,
        user_selected: Option<&str>,
    ) -> Resolution {
        if let Some(id) = explicit {
            return Resolution {
                model: self.lookup_or_baseline(id),
                source: ModelSource::Explicit,
            };
        }

        if let Some(hint) = workflow.and_then(|w| w.model.as_deref()) {
            let model = self
                .workflow_models
                .get(hint)
                .and_then(|id| self.catalog.find(id))
                .cloned()
                .unwrap_or_else(|| self.catalog.baseline().clone());
            return Resolution {
                model,
                source: ModelSource::Workflow,
            };
        }

        if let Some(conv) = conversation.filter(|c| !c.is_empty()) {
            return Resolution {
                model: conv.model.clone(),
                source: ModelSource::Conversation,
            };
        }

        match user_selected.and_then(|id| self.catalog.find(id)) {
            Some(model) => Resolution {
                model: model.clone(),
                source: ModelSource::UserSelected,
            },
            None => Resolution {
                model: self.catalog.baseline().clone(),
                source: ModelSource::Baseline,
            },
        }
    }

    /// The event telling the UI that the workflow implied the model, if it
    /// did. Callers emit it once they hold no conversation lock.
    pub fn implied_event(
        &self,
        resolution: &Resolution,
        workflow: Option<&WorkflowRef>,
    ) -> Option<DomainEvent> {
        (resolution.source == ModelSource::Workflow).then(|| DomainEvent::ModelImplied {
            workflow_id: workflow.map(|w| w.id.clone()).unwrap_or_default(),
            model_id: resolution.model.id.clone(),
            timestamp: Utc::now(),
        })
    }

    fn lookup_or_baseline(&self, id: &str) -> ModelDescriptor {
        match self.catalog.find(id) {
            Some(model) => model.clone(),
            None => {
                tracing::warn!(model = id, "Unknown model id, using baseline");
                self.catalog.baseline().clone()
            }
        }
    }
}
