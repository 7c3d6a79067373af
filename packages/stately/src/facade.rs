//! The facade handed to every handler and system.
//!
//! The facade reads the live draft and routes everything it raises through
//! the outermost surface, so wrappers observe events raised from inside a
//! pass. It holds the surface weakly: a facade kept beyond the life of its
//! store reads as empty and refuses to dispatch.

use std::any::Any;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::Waker;

use crossbeam_queue::SegQueue;
use futures::task::AtomicWaker;
use serde_json::Value;

use crate::entity::Entity;
use crate::error::StoreError;
use crate::event::Event;
use crate::snapshot::Snapshot;
use crate::store::surface::{Extras, Surface};
use crate::types::{Type, TypeDef};

/// Events raised by notifiers, waiting to be delivered to the store.
#[derive(Debug, Default)]
pub(crate) struct Inbox {
    events: SegQueue<Event>,
    waker: AtomicWaker,
}

impl Inbox {
    pub(crate) fn new() -> Inbox {
        Inbox::default()
    }

    pub(crate) fn push(&self, event: Event) {
        self.events.push(event);
        self.waker.wake();
    }

    pub(crate) fn pop(&self) -> Option<Event> {
        self.events.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Wake this task on the next push.
    pub(crate) fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    pub(crate) fn wake(&self) {
        self.waker.wake();
    }
}

/// Access to the store from inside a handler.
#[derive(Clone)]
pub struct Facade {
    surface: Weak<dyn Surface>,
    extras: Rc<Extras>,
    inbox: Arc<Inbox>,
}

impl Facade {
    pub(crate) fn new(surface: Weak<dyn Surface>, extras: Rc<Extras>, inbox: Arc<Inbox>) -> Facade {
        Facade {
            surface,
            extras,
            inbox,
        }
    }

    /// A facade which is not attached to any store.
    #[cfg(test)]
    pub(crate) fn detached() -> Facade {
        let surface: Weak<dyn Surface> = Weak::<crate::store::engine::Core>::new();
        Facade::new(surface, Rc::new(Extras::new()), Arc::new(Inbox::new()))
    }

    fn surface(&self) -> Result<Rc<dyn Surface>, StoreError> {
        self.surface.upgrade().ok_or(StoreError::Released)
    }

    /// The latest snapshot. During a pass this is the live draft.
    pub fn state(&self) -> Arc<Snapshot> {
        match self.surface.upgrade() {
            Some(surface) => surface.state(),
            None => Snapshot::shared_empty(),
        }
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

    /// Queue an event by name.
    pub fn notify(&self, name: &str, payload: impl Into<Value>) -> Result<(), StoreError> {
        self.surface()?.notify(name, payload.into())
    }

    /// Queue an event.
    pub fn dispatch(&self, event: Event) -> Result<(), StoreError> {
        self.surface()?.dispatch(event)
    }

    /// Look up a resolved type.
    pub fn get_type(&self, name: &str) -> Option<Arc<Type>> {
        self.surface.upgrade().and_then(|surface| surface.get_type(name))
    }

    /// Register or replace a type.
    pub fn set_type(&self, name: &str, def: TypeDef) -> Result<(), StoreError> {
        self.surface()?.set_type(name, def)
    }

    /// Get a handle which can raise events from deferred work.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            inbox: self.inbox.clone(),
        }
    }

    /// Get a value contributed by a wrapper.
    pub fn extra<T: Any>(&self) -> Option<&T> {
        self.extras.get::<T>()
    }
}

/// Raises events from work which outlives the handler that started it.
///
/// Events are collected in a lock-free inbox and join the back of the queue
/// when they are delivered: by a running pass after the event it is
/// processing, by `Store::deliver`, or as soon as the future returned by
/// `Store::deliveries` is polled. In automatic mode delivery runs a pass. A
/// notifier may be sent to other threads.
#[derive(Clone, Debug)]
pub struct Notifier {
    inbox: Arc<Inbox>,
}

impl Notifier {
    /// Queue an event by name.
    pub fn notify(&self, name: impl Into<String>, payload: impl Into<Value>) {
        self.inbox.push(Event::new(name, payload));
    }

    /// Queue an event.
    pub fn dispatch(&self, event: Event) {
        self.inbox.push(event);
    }

    /// The number of events waiting to be delivered.
    pub fn len(&self) -> usize {
        self.inbox.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.inbox.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_detached() {
        let facade = Facade::detached();
        assert!(facade.entities().is_empty());
        assert!(facade.entity("k1").is_none());
        assert!(facade.entities_of("kitty").is_empty());
        assert!(facade.get_type("kitty").is_none());
        assert!(matches!(facade.notify("feed", Value::Null), Err(StoreError::Released)));
    }

    #[test]
    fn test_notifier_is_send() {
        fn assert_send_sync<T: Send + Sync>(_: &T) {}

        let notifier = Facade::detached().notifier();
        assert_send_sync(&notifier);

        let remote = notifier.clone();
        std::thread::spawn(move || remote.notify("fed", 1)).join().unwrap();
        notifier.dispatch(Event::named("tick"));
        assert_eq!(notifier.len(), 2);
    }
}
