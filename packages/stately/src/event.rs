//! Events and the event-name grammar.
//!
//! An event name takes one of three forms:
//! - `name` is broadcast to every entity whose type handles `name`,
//! - `typeName:name` goes to every live entity of that type,
//! - `#entityId:name` goes to one entity.
//!
//! The top-level names `add` and `remove` are handled by the store itself.

use std::fmt::{self, Display};

use serde_json::Value;

use crate::error::StoreError;

/// Reserved event which adds an entity. The payload is the full entity.
pub const ADD: &str = "add";
/// Reserved event which removes an entity. The payload is its id.
pub const REMOVE: &str = "remove";
/// Handler run once on an entity when it enters the store.
pub const CREATE: &str = "create";
/// Handler run on an entity just before it leaves the store.
pub const DESTROY: &str = "destroy";

/// The engine's lifecycle companions to `add` and `remove`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Create,
    Destroy,
}

/// A single event.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    name: String,
    payload: Value,
    lifecycle: Option<Lifecycle>,
}

impl Event {
    /// Create a new event.
    pub fn new(name: impl Into<String>, payload: impl Into<Value>) -> Event {
        Event {
            name: name.into(),
            payload: payload.into(),
            lifecycle: None,
        }
    }

    /// Create a new event with no payload.
    pub fn named(name: impl Into<String>) -> Event {
        Event::new(name, Value::Null)
    }

    /// The `#id:create` companion queued when an entity enters the store.
    pub(crate) fn created(id: &str) -> Event {
        Event {
            name: format!("#{}:{}", id, CREATE),
            payload: Value::Null,
            lifecycle: Some(Lifecycle::Create),
        }
    }

    /// The `#id:destroy` companion queued when an entity leaves the store.
    pub(crate) fn destroyed(id: &str) -> Event {
        Event {
            name: format!("#{}:{}", id, DESTROY),
            payload: Value::Null,
            lifecycle: Some(Lifecycle::Destroy),
        }
    }

    /// The raw event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event payload. `Null` if there was none.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns true if the store queued this event as a lifecycle companion.
    ///
    /// Companions are inserted at the front of the pending queue.
    pub fn is_lifecycle(&self) -> bool {
        self.lifecycle.is_some()
    }

    pub(crate) fn lifecycle(&self) -> Option<Lifecycle> {
        self.lifecycle
    }

    /// Parse the name of this event.
    pub fn route(&self) -> Result<Route<'_>, StoreError> {
        Route::parse(&self.name)
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_null() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}({})", self.name, self.payload)
        }
    }
}

/// Which entities an event is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope<'a> {
    /// Every entity whose type declares the handler.
    Global,
    /// Every live entity of the named type.
    Type(&'a str),
    /// A single entity.
    Entity(&'a str),
}

/// A parsed event name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route<'a> {
    /// Who the event is for.
    pub scope: Scope<'a>,
    /// The handler to invoke.
    pub handler: &'a str,
}

impl<'a> Route<'a> {
    /// Parse a raw event name.
    ///
    /// Handler names never contain `:`, so the scope is everything up to the
    /// last `:`.
    pub fn parse(name: &'a str) -> Result<Route<'a>, StoreError> {
        let invalid = || StoreError::InvalidEventName(name.to_owned());

        let route = match name.rfind(':') {
            None => {
                if name.starts_with('#') {
                    return Err(invalid());
                }
                Route {
                    scope: Scope::Global,
                    handler: name,
                }
            }
            Some(split) => {
                let (scope, handler) = (&name[..split], &name[split + 1..]);
                let scope = match scope.strip_prefix('#') {
                    Some(id) if !id.is_empty() => Scope::Entity(id),
                    Some(_) => return Err(invalid()),
                    None if !scope.is_empty() => Scope::Type(scope),
                    None => return Err(invalid()),
                };
                Route {
                    scope,
                    handler,
                }
            }
        };

        if route.handler.is_empty() {
            return Err(invalid());
        }

        Ok(route)
    }

    /// Returns true if the event is broadcast.
    pub fn is_global(&self) -> bool {
        self.scope == Scope::Global
    }
}
