//! Publish/subscribe channel for signaling UI collaborators.
//!
//! Handlers registered with `on` run synchronously inside `emit`; broadcast
//! subscribers receive every event asynchronously. Delivery is best-effort
//! within the running session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use parley_core::events::DomainEvent;

/// Default broadcast capacity.
const CHANNEL_CAPACITY: usize = 256;

type Handler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
    handlers: Arc<Mutex<HashMap<String, Vec<Handler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a handler for events with the given `event_name()`.
    pub fn on<F>(&self, name: &str, handler: F)
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        match self.handlers.lock() {
            Ok(mut handlers) => handlers
                .entry(name.to_string())
                .or_default()
                .push(Arc::new(handler)),
            Err(e) => tracing::error!(event = name, error = %e, "Handler registry poisoned"),
        }
    }

    /// Publish an event to named handlers and broadcast subscribers.
    pub fn emit(&self, event: DomainEvent) {
        let name = event.event_name();
        tracing::debug!(event = name, "Emitting event");

        // Handlers may emit in turn, so the registry lock is released first.
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .map(|h| h.get(name).cloned().unwrap_or_default())
            .unwrap_or_default();
        for handler in handlers {
            handler(&event);
        }

        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
