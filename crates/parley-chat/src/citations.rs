//! Citation injection into the in-flight assistant message.

use chrono::Utc;
use tokio::task::JoinHandle;

use parley_core::events::DomainEvent;
use parley_core::types::Citation;

use crate::backend::RetrievalResult;
use crate::bus::EventBus;
use crate::message::MessageHandle;

pub enum CitationSource {
    /// Retrieval finished before streaming started.
    Resolved(Vec<Citation>),
    /// Retrieval still running in the background.
    Pending(JoinHandle<RetrievalResult>),
}

#[derive(Clone, Debug)]
pub struct CitationInjector {
    bus: EventBus,
}

impl CitationInjector {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Attach citations to the message behind `handle`.
    ///
    /// Resolved citations are attached at once and `None` is returned. For a
    /// pending task a continuation is spawned and its handle returned; it
    /// resolves to whether citations were attached. The continuation works
    /// whether or not streaming has finished by then.
    pub fn inject(&self, handle: MessageHandle, source: CitationSource) -> Option<JoinHandle<bool>> {
        match source {
            CitationSource::Resolved(citations) => {
                attach(&self.bus, &handle, citations);
                None
            }
            CitationSource::Pending(task) => {
                let bus = self.bus.clone();
                Some(tokio::spawn(async move {
                    match task.await {
                        Ok(mut result) => match result.take_citations() {
                            Some(citations) => attach(&bus, &handle, citations),
                            None => false,
                        },
                        Err(e) => {
                            tracing::warn!(error = %e, "Retrieval task aborted");
                            false
                        }
                    }
                }))
            }
        }
    }
}

fn attach(bus: &EventBus, handle: &MessageHandle, citations: Vec<Citation>) -> bool {
    if citations.is_empty() {
        return false;
    }
    let count = citations.len();
    let attached = handle.attach_citations(citations);
    if attached {
        tracing::debug!(
            conversation_id = %handle.conversation_id(),
            count,
            "Citations attached"
        );
        bus.emit(DomainEvent::CitationsAttached {
            conversation_id: handle.conversation_id(),
            count,
            timestamp: Utc::now(),
        });
    }
    attached
}
