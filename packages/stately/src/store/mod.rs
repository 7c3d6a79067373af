//! The store, and how one is configured and built.

use std::any::Any;
use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::entity::Entity;
use crate::error::{IndexError, StoreError};
use crate::event::Event;
use crate::facade::{Facade, Inbox};
use crate::snapshot::Snapshot;
use crate::system::System;
use crate::types::{Type, TypeDef, Types};

use self::engine::Core;
pub use self::surface::{Extras, Listener, Subscription, Surface, Wrapper};

pub(crate) mod engine;
pub mod surface;

/// When queued events are processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Every dispatch made outside a pass runs a pass straight away.
    Automatic,
    /// Events wait in the queue until `update` is called.
    Manual,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Automatic
    }
}

/// Store options.
///
/// Options can be read from configuration:
///
/// ```
/// # use stately::{Mode, Options};
/// let options: Options = serde_json::from_str(r#"{ "mode": "manual" }"#).unwrap();
/// assert_eq!(options.mode, Mode::Manual);
/// assert!(!options.auto_populate);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// When queued events are processed.
    pub mode: Mode,
    /// Create a stub entity, with the type name as its id, for every
    /// registered type that has no live entity whenever the state is set.
    pub auto_populate: bool,
}

/// Collects the configuration of a store.
#[derive(Default)]
pub struct StoreBuilder {
    types: Vec<(String, TypeDef)>,
    entities: Snapshot,
    systems: Vec<System>,
    wrappers: Vec<Box<dyn Wrapper>>,
    options: Options,
    error: Option<StoreError>,
}

impl StoreBuilder {
    /// Create a new builder with default options and nothing registered.
    pub fn new() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Register a type.
    pub fn type_def(mut self, name: impl Into<String>, def: impl Into<TypeDef>) -> Self {
        self.types.push((name.into(), def.into()));
        self
    }

    /// Set the initial entities. These are also what `Store::reset` restores.
    pub fn entities(mut self, entities: Snapshot) -> Self {
        self.entities = entities;
        self
    }

    /// Set the initial entities from JSON of the form `{ id: { type, ... } }`.
    ///
    /// A malformed value is reported by `build`.
    pub fn entities_json(mut self, entities: Value) -> Self {
        match Snapshot::from_json(entities) {
            Ok(entities) => self.entities = entities,
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Add a system. Systems run in the order they are added.
    pub fn system(mut self, system: System) -> Self {
        self.systems.push(system);
        self
    }

    /// Add a wrapper. The last wrapper added is the outermost.
    pub fn wrapper(mut self, wrapper: impl Wrapper + 'static) -> Self {
        self.wrappers.push(Box::new(wrapper));
        self
    }

    /// Add a wrapper written as a closure.
    pub fn wrap<F>(self, f: F) -> Self
        where F: FnOnce(Rc<dyn Surface>, &mut Extras) -> Rc<dyn Surface> + 'static
    {
        self.wrapper(f)
    }

    /// Replace the options.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Set when queued events are processed.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.options.mode = mode;
        self
    }

    /// Set whether missing singletons are created for every type.
    pub fn auto_populate(mut self, auto_populate: bool) -> Self {
        self.options.auto_populate = auto_populate;
        self
    }

    /// Validate the configuration and build the store.
    ///
    /// The initial entities are installed through the wrapped surface, so
    /// their `create` handlers run straight away in automatic mode and wait
    /// for the first `update` in manual mode.
    pub fn build(self) -> Result<Store, StoreError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let mut types = Types::new();
        for (name, def) in self.types.iter() {
            types.register(name, def)?;
        }
        for system in self.systems.iter() {
            system.validate()?;
        }

        let core = Rc::new(Core::new(types, self.systems, self.options));
        let mut extras = Extras::new();
        let mut surface: Rc<dyn Surface> = core.clone();
        for wrapper in self.wrappers {
            surface = wrapper.wrap(surface, &mut extras);
        }

        let extras = Rc::new(extras);
        core.install(Rc::downgrade(&surface), extras.clone());
        debug!(types = self.types.len(), entities = self.entities.len(), extras = extras.len(), "store built");

        surface.set_state(self.entities.clone())?;
        Ok(Store {
            core,
            surface,
            extras,
            initial: self.entities,
        })
    }
}

impl Debug for StoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("types", &self.types.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .field("entities", &self.entities.len())
            .field("systems", &self.systems)
            .field("wrappers", &self.wrappers.len())
            .field("options", &self.options)
            .finish()
    }
}

/// An entity-indexed, event-driven state container.
///
/// All calls go through the outermost wrapped surface.
pub struct Store {
    core: Rc<Core>,
    surface: Rc<dyn Surface>,
    extras: Rc<Extras>,
    initial: Snapshot,
}

impl Store {
    /// Start configuring a store.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Run a callback after every pass which processed at least one event.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
        where F: Fn(&Arc<Snapshot>) + 'static
    {
        self.surface.subscribe(Rc::new(listener))
    }

    /// Queue an event by name.
    pub fn notify(&self, name: &str, payload: impl Into<Value>) -> Result<(), StoreError> {
        self.surface.notify(name, payload.into())
    }

    /// Queue an event.
    pub fn dispatch(&self, event: Event) -> Result<(), StoreError> {
        self.surface.dispatch(event)
    }

    /// Process every queued event.
    pub fn update(&self) -> Result<(), StoreError> {
        self.surface.update()
    }

    /// The latest committed snapshot.
    pub fn state(&self) -> Arc<Snapshot> {
        self.surface.state()
    }

    /// Replace every entity.
    pub fn set_state(&self, next: Snapshot) -> Result<(), StoreError> {
        self.surface.set_state(next)
    }

    /// Restore the initial entities.
    pub fn reset(&self) -> Result<(), StoreError> {
        self.surface.set_state(self.initial.clone())
    }

    /// Look up a resolved type.
    pub fn get_type(&self, name: &str) -> Option<Arc<Type>> {
        self.surface.get_type(name)
    }

    /// Register or replace a type.
    pub fn set_type(&self, name: &str, def: impl Into<TypeDef>) -> Result<(), StoreError> {
        self.surface.set_type(name, def.into())
    }

    /// Get an entity by id.
    pub fn entity(&self, id: &str) -> Option<Arc<Entity>> {
        self.state().get(id).cloned()
    }

    /// Every entity. This is the snapshot itself, not a copy.
    pub fn entities(&self) -> Arc<Snapshot> {
        self.state()
    }

    /// Every entity of a type, ordered by id.
    pub fn entities_of(&self, type_name: &str) -> Vec<Arc<Entity>> {
        self.state().of_type(type_name).cloned().collect()
    }

    /// Run a selector against the latest snapshot.
    pub fn select<R>(&self, selector: impl FnOnce(&Arc<Snapshot>) -> R) -> R {
        selector(&self.state())
    }

    /// The facade handlers see.
    pub fn facade(&self) -> Facade {
        self.core.facade()
    }

    /// Get a value contributed by a wrapper.
    pub fn extra<T: Any>(&self) -> Option<&T> {
        self.extras.get::<T>()
    }

    /// The outermost surface.
    pub fn surface(&self) -> Rc<dyn Surface> {
        self.surface.clone()
    }

    /// Deliver the events raised by notifiers since the last pass.
    ///
    /// They join the back of the queue. In automatic mode this runs a pass.
    pub fn deliver(&self) -> Result<(), StoreError> {
        self.core.deliver()
    }

    /// A future which delivers notifier events as they arrive.
    ///
    /// Spawn it on the same thread as the store, for instance with
    /// `futures::executor::LocalPool`. In automatic mode each delivery runs a
    /// pass, so deferred work behaves like any other dispatch. The future
    /// finishes when the store is dropped, or with the error of a failed
    /// pass. Only one should be polled at a time.
    pub fn deliveries(&self) -> Deliveries {
        Deliveries {
            core: Rc::downgrade(&self.core),
            inbox: self.core.inbox().clone(),
        }
    }

    /// The number of events waiting to be processed.
    pub fn pending(&self) -> usize {
        self.core.pending()
    }

    /// The options the store was built with.
    pub fn options(&self) -> &Options {
        self.core.options()
    }

    /// Check the routing index against the current snapshot.
    pub fn verify(&self) -> Result<(), IndexError> {
        self.core.verify()
    }
}

impl Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("entities", &self.state().len())
            .field("pending", &self.pending())
            .field("options", self.options())
            .finish()
    }
}

/// Delivers notifier events to a store as they arrive.
///
/// Returned by `Store::deliveries`.
#[must_use = "futures do nothing unless polled"]
pub struct Deliveries {
    core: Weak<Core>,
    inbox: Arc<Inbox>,
}

impl Future for Deliveries {
    type Output = Result<(), StoreError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inbox.register(cx.waker());

        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return Poll::Ready(Ok(())),
        };
        if self.inbox.is_empty() {
            return Poll::Pending;
        }

        match core.deliver() {
            Ok(()) => Poll::Pending,
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl Debug for Deliveries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deliveries({} waiting)", self.inbox.len())
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::types::HandlerTable;

    use super::*;

    #[test]
    fn test_options_defaults() {
        let options: Options = serde_json::from_value(json!({})).unwrap();
        assert_eq!(options, Options::default());
        assert_eq!(options.mode, Mode::Automatic);

        let options: Options = serde_json::from_value(json!({ "mode": "manual", "auto_populate": true })).unwrap();
        assert_eq!(options.mode, Mode::Manual);
        assert!(options.auto_populate);

        assert!(serde_json::from_value::<Options>(json!({ "mode": "eventually" })).is_err());
    }

    #[test]
    fn test_build_rejects_unknown_type() {
        let result = Store::builder()
            .type_def("kitty", HandlerTable::new())
            .entities_json(json!({ "d1": { "type": "doggo" } }))
            .build();
        assert!(matches!(result, Err(StoreError::UnknownType { .. })));

        let result = Store::builder().entities_json(json!([1, 2])).build();
        assert!(matches!(result, Err(StoreError::InvalidEntity { .. })));
    }

    #[test]
    fn test_facade_outlives_store() {
        let store = Store::builder()
            .type_def("kitty", HandlerTable::new())
            .entities(Snapshot::empty().with(Entity::new("k1", "kitty")))
            .build()
            .unwrap();

        let facade = store.facade();
        assert!(facade.entity("k1").is_some());

        drop(store);
        assert!(facade.entity("k1").is_none());
        assert!(matches!(facade.notify("feed", Value::Null), Err(StoreError::Released)));
    }
}
