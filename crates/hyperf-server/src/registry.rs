//! Controller registration and event lookup.
//!
//! Controllers declare their event bindings as data; [`ControllerRegistry`]
//! collects them into one event-name → binding map. Registration completes
//! before the registry is handed to the dispatcher, after which it is only
//! read.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hyperf_core::errors::INTERNAL_KEY;
use hyperf_core::{ConnectionId, FieldErrors, Payload, Schema, SchemaError};
use serde::Serialize;
use serde_json::Value;

use crate::gateway::Gateway;
use crate::session::Session;

/// What a handler returns: response data, or a field-keyed domain error.
pub type HandlerResult = Result<Value, FieldErrors>;

/// Everything a handler may touch while it runs.
pub struct HandlerContext<'a> {
    pub connection_id: &'a ConnectionId,
    /// Exclusive for the duration of the call.
    pub session: &'a mut Session,
    pub gateway: &'a Gateway,
}

/// Handler for one event. Called only with a payload that passed its schema.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext<'_>) -> HandlerResult;
}

/// Serialize handler output into response data.
pub fn respond_with<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| {
        tracing::error!(error = %e, "failed to serialize handler response");
        FieldErrors::single(INTERNAL_KEY, "failed to encode response")
    })
}

/// Static association of an event name with its schema and handler.
pub struct EventBinding {
    event: String,
    schema: Schema,
    handler: Arc<dyn EventHandler>,
}

impl EventBinding {
    pub fn new(event: impl Into<String>, schema: Schema, handler: impl EventHandler + 'static) -> Self {
        Self {
            event: event.into(),
            schema,
            handler: Arc::new(handler),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }
}

/// A group of related event handlers.
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;

    fn bindings(&self) -> Vec<EventBinding>;

    /// Called once after a connection's last event has been handled, with
    /// the session as it was left.
    fn on_disconnect(&self, _session: &Session) {}
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("event `{event}` from controller `{controller}` is already bound by `{existing}`")]
    DuplicateEvent {
        event: String,
        controller: String,
        existing: String,
    },
    #[error("controller `{controller}` declares an empty event name")]
    InvalidEventName { controller: String },
    #[error("event `{event}` has an invalid schema: {source}")]
    InvalidSchema {
        event: String,
        #[source]
        source: SchemaError,
    },
}

struct Registered {
    binding: EventBinding,
    controller: String,
}

/// Event name → binding, across every registered controller.
#[derive(Default)]
pub struct ControllerRegistry {
    bindings: HashMap<String, Registered>,
    controllers: Vec<Arc<dyn Controller>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every binding `controller` declares.
    ///
    /// All-or-nothing: if any binding is rejected, none are added.
    pub fn register(&mut self, controller: Arc<dyn Controller>) -> Result<(), RegistryError> {
        let name = controller.name().to_string();
        let bindings = controller.bindings();

        for (i, binding) in bindings.iter().enumerate() {
            let event = binding.event();
            if event.trim().is_empty() {
                return Err(RegistryError::InvalidEventName { controller: name });
            }
            if let Some(existing) = self.bindings.get(event) {
                return Err(RegistryError::DuplicateEvent {
                    event: event.to_string(),
                    controller: name,
                    existing: existing.controller.clone(),
                });
            }
            if bindings[..i].iter().any(|b| b.event() == event) {
                return Err(RegistryError::DuplicateEvent {
                    event: event.to_string(),
                    controller: name.clone(),
                    existing: name,
                });
            }
            binding
                .schema()
                .check()
                .map_err(|source| RegistryError::InvalidSchema {
                    event: event.to_string(),
                    source,
                })?;
        }

        for binding in bindings {
            tracing::debug!(controller = %name, event = binding.event(), "bound event");
            self.bindings.insert(
                binding.event().to_string(),
                Registered {
                    binding,
                    controller: name.clone(),
                },
            );
        }
        self.controllers.push(controller);
        Ok(())
    }

    /// Look up the binding for `event`. `None` is an ordinary outcome.
    pub fn resolve(&self, event: &str) -> Option<&EventBinding> {
        self.bindings.get(event).map(|r| &r.binding)
    }

    /// Name of the controller that owns `event`.
    pub fn owner(&self, event: &str) -> Option<&str> {
        self.bindings.get(event).map(|r| r.controller.as_str())
    }

    /// Registered event names (sorted).
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn controllers(&self) -> &[Arc<dyn Controller>] {
        &self.controllers
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
