//! Systems: handlers which see the whole draft rather than one entity.
//!
//! A system is stateless. It is keyed by handler name like a type, but it is
//! not bound to any entity and the routing index never filters it. Systems run
//! for broadcast events, after every entity handler for that event, in the
//! order they were registered with the store.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use serde_json::Value;

use crate::error::StoreError;
use crate::facade::Facade;
use crate::snapshot::Draft;
use crate::types::validate_handler_name;

/// A system handler for one event.
pub type SystemHandler = Arc<dyn Fn(&Draft<'_>, &Value, &Facade) -> anyhow::Result<()> + Send + Sync>;

/// A named table of system handlers.
#[derive(Clone)]
pub struct System {
    name: String,
    handlers: BTreeMap<String, SystemHandler>,
}

impl System {
    /// Create a new system with no handlers.
    pub fn new(name: impl Into<String>) -> System {
        System {
            name: name.into(),
            handlers: BTreeMap::new(),
        }
    }

    /// Add a handler, builder style.
    pub fn on<F>(mut self, name: impl Into<String>, f: F) -> System
        where F: Fn(&Draft<'_>, &Value, &Facade) -> anyhow::Result<()> + Send + Sync + 'static
    {
        self.handlers.insert(name.into(), Arc::new(f));
        self
    }

    /// The name of this system, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a handler.
    pub fn handler(&self, name: &str) -> Option<&SystemHandler> {
        self.handlers.get(name)
    }

    /// Iterate over the handler names, in order.
    pub fn handler_names(&self) -> impl Iterator<Item=&str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Check that every handler name can be dispatched to.
    pub fn validate(&self) -> Result<(), StoreError> {
        self.handler_names().try_for_each(validate_handler_name)
    }
}

impl Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "System({}) ", self.name)?;
        f.debug_set().entries(self.handler_names()).finish()
    }
}
