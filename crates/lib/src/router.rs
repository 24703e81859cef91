//! Event routing: a registry of handlers keyed by event name, and the dispatcher the queue
//! consumer calls for every delivery.
//!
//! Deliveries for the same conversation (channel instance + remote endpoint) are handled one at
//! a time; deliveries for different conversations run concurrently.

use crate::queue::{EventEnvelope, Payload};
use crate::workflow::WorkflowError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

/// Processes one event kind. Implementations are registered in a [`HandlerRegistry`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event name this handler subscribes to, e.g. `MESSAGE-RECEIVED`.
    fn event_name(&self) -> &'static str;

    async fn handle(&self, payload: Payload) -> Result<(), WorkflowError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("more than one handler registered for event {0}")]
    Duplicate(String),
}

/// Immutable map from event name to handler.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn build(handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>) -> Result<Self, RegistryError> {
        let mut map: HashMap<&'static str, Arc<dyn EventHandler>> = HashMap::new();
        for h in handlers {
            let name = h.event_name();
            if map.insert(name, h).is_some() {
                return Err(RegistryError::Duplicate(name.to_string()));
            }
        }
        Ok(Self { handlers: map })
    }

    pub fn get(&self, event_name: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_name)
    }

    /// Registered event names, sorted.
    pub fn event_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler for the event name.
    Unroutable(String),
    /// Handler rejected the event for good; redelivery would not help.
    Dropped(String),
    /// Handler failed on something transient; the delivery should be retried.
    Failed(String),
}

/// Dispatches envelopes to their handler.
pub struct Router {
    registry: HandlerRegistry,
    locks: KeyedLocks,
}

impl Router {
    pub fn new(registry: HandlerRegistry) -> Self {
        log::info!("router: {} handler(s): {}", registry.len(), registry.event_names().join(", "));
        Self {
            registry,
            locks: KeyedLocks::default(),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run the handler for the envelope and wait for it.
    pub async fn dispatch(&self, envelope: EventEnvelope) -> DispatchOutcome {
        let EventEnvelope { event_name, payload } = envelope;
        let Some(handler) = self.registry.get(&event_name) else {
            log::warn!("router: no handler for event {}, dropping", event_name);
            return DispatchOutcome::Unroutable(event_name);
        };
        let _turn = match conversation_key(&payload) {
            Some(key) => Some(self.locks.lock(key).await),
            None => None,
        };
        log::debug!("router: dispatching {}", event_name);
        match handler.handle(payload).await {
            Ok(()) => DispatchOutcome::Handled,
            Err(e) if e.is_retryable() => {
                log::error!("router: {} failed: {}", event_name, e);
                DispatchOutcome::Failed(e.to_string())
            }
            Err(e) => {
                log::info!("router: {} dropped: {}", event_name, e);
                DispatchOutcome::Dropped(e.to_string())
            }
        }
    }

    /// Dispatch on its own task. A panicking handler yields `Failed` instead of tearing down the caller.
    pub fn spawn_dispatch(self: &Arc<Self>, envelope: EventEnvelope) -> JoinHandle<DispatchOutcome> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let event_name = envelope.event_name.clone();
            match tokio::spawn(async move { router.dispatch(envelope).await }).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("router: handler for {} crashed: {}", event_name, e);
                    DispatchOutcome::Failed(format!("handler crashed: {}", e))
                }
            }
        })
    }
}

/// Conversation a payload belongs to: `instance` + `data.key.remoteJid`.
fn conversation_key(payload: &Payload) -> Option<String> {
    let instance = payload.get("instance")?.as_str()?;
    let remote = payload.get("data")?.get("key")?.get("remoteJid")?.as_str()?;
    Some(format!("{}\u{0}{}", instance, remote))
}

/// One async mutex per key; slots are removed when nobody holds or waits on them.
#[derive(Default)]
struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    async fn lock(&self, key: String) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            slot,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.locks.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // map + this guard hold the only references
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}
