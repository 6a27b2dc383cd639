//! Handler strategies and the event type registry.
//!
//! Each event type has exactly one [`HandleStrategy`] responsible for it.
//! Strategies declare a typed payload; the registry erases the payload type
//! so the dispatch engine can route envelopes without knowing payload shapes.
//! Registration happens once at startup and is validated against duplicates;
//! the registry is immutable once handed to the engine.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use postbox_core::{
    models::{EventEnvelope, EventType, HandleOutcome},
    CoreError,
};
use serde::de::DeserializeOwned;

use crate::error::{DispatchError, Result};

/// Boxed error returned by handler implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A handler responsible for processing one event type.
///
/// One instance is registered per event type before dispatch begins. The
/// strategy receives its payload already deserialized; an envelope whose
/// payload does not match `Payload` never reaches the handler.
///
/// Returning `Err` signals an unexpected failure and is treated as
/// retryable. Expected outcomes, including permanent failures, are expressed
/// through [`HandleOutcome`].
pub trait HandleStrategy: Send + Sync + 'static {
    /// Typed payload this strategy consumes.
    type Payload: DeserializeOwned + Send;

    /// Event type this strategy handles.
    fn event_type(&self) -> EventType;

    /// Processes one payload and reports the outcome.
    fn handle(
        &self,
        payload: Self::Payload,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<HandleOutcome, BoxError>> + Send + '_>>;
}

/// Type-erased handler invoked by dispatch workers.
///
/// Produced by [`StrategyRegistry::register`]; deserializes the envelope
/// payload into the strategy's typed payload before delegating.
pub trait ErasedHandler: Send + Sync {
    /// Invokes the underlying strategy for one envelope.
    ///
    /// The returned future is `'static` so workers can run it on a spawned
    /// task for panic containment.
    fn invoke(
        &self,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<HandleOutcome>> + Send + 'static>>;
}

impl std::fmt::Debug for dyn ErasedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ErasedHandler")
    }
}

struct TypedHandler<S> {
    strategy: Arc<S>,
}

impl<S: HandleStrategy> ErasedHandler for TypedHandler<S> {
    fn invoke(
        &self,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<HandleOutcome>> + Send + 'static>> {
        let strategy = Arc::clone(&self.strategy);
        let payload = envelope.payload.clone();
        let event_id = envelope.id;

        Box::pin(async move {
            let typed: S::Payload = serde_json::from_value(payload)
                .map_err(|e| CoreError::payload_mismatch(event_id, e.to_string()))?;

            strategy
                .handle(typed)
                .await
                .map_err(|e| DispatchError::handler_failed(e.to_string()))
        })
    }
}

/// Registry mapping each event type to its single handler.
#[derive(Default)]
pub struct StrategyRegistry {
    handlers: HashMap<EventType, Arc<dyn ErasedHandler>>,
}

impl StrategyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a strategy for its declared event type.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateEventType` if a strategy for the same type is
    /// already registered. This is a configuration error and should abort
    /// startup.
    pub fn register<S: HandleStrategy>(&mut self, strategy: S) -> Result<()> {
        let event_type = strategy.event_type();
        if self.handlers.contains_key(&event_type) {
            return Err(CoreError::DuplicateEventType(event_type).into());
        }
        self.handlers.insert(event_type, Arc::new(TypedHandler { strategy: Arc::new(strategy) }));
        Ok(())
    }

    /// Resolves the handler for an event type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEventType` if no strategy is registered. Callers
    /// route the affected envelope to failed without retrying, since a
    /// missing handler cannot be fixed by retries.
    pub fn resolve(&self, event_type: &EventType) -> Result<Arc<dyn ErasedHandler>> {
        self.handlers
            .get(event_type)
            .cloned()
            .ok_or_else(|| CoreError::UnknownEventType(event_type.clone()).into())
    }

    /// Whether a strategy is registered for the given type.
    pub fn contains(&self, event_type: &EventType) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Number of registered strategies.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("event_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
