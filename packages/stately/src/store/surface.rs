//! The store surface, and the wrappers layered over it.
//!
//! Every store exposes the same object-safe `Surface`. A wrapper receives the
//! surface below it and returns a new one; the store keeps the outermost
//! surface and routes its own self-calls through it, so a wrapper sees the
//! lifecycle companions and the events raised by handlers as well as the ones
//! raised from outside.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use serde_json::Value;

use crate::error::StoreError;
use crate::event::Event;
use crate::snapshot::Snapshot;
use crate::types::{Type, TypeDef};

/// A callback run after each pass with the committed snapshot.
pub type Listener = Rc<dyn Fn(&Arc<Snapshot>)>;

/// The operations shared by a store and every wrapper around it.
pub trait Surface {
    /// Register a listener which runs after each pass.
    fn subscribe(&self, listener: Listener) -> Subscription;

    /// Drain the pending queue.
    fn update(&self) -> Result<(), StoreError>;

    /// Queue an event.
    fn dispatch(&self, event: Event) -> Result<(), StoreError>;

    /// Queue an event by name.
    fn notify(&self, name: &str, payload: Value) -> Result<(), StoreError> {
        self.dispatch(Event::new(name, payload))
    }

    /// The latest snapshot. During a pass this is the live draft.
    fn state(&self) -> Arc<Snapshot>;

    /// Replace every entity, running `destroy` and `create` for the difference.
    fn set_state(&self, next: Snapshot) -> Result<(), StoreError>;

    /// Look up a resolved type.
    fn get_type(&self, name: &str) -> Option<Arc<Type>>;

    /// Register or replace a type. Live entities pick the new handlers up
    /// from the next event on.
    fn set_type(&self, name: &str, def: TypeDef) -> Result<(), StoreError>;
}

/// The listeners registered with a store.
#[derive(Default)]
pub(crate) struct Listeners {
    next: u64,
    entries: Vec<(u64, Listener)>,
}

impl Listeners {
    pub(crate) fn add(listeners: &Rc<RefCell<Listeners>>, listener: Listener) -> Subscription {
        let mut this = listeners.borrow_mut();
        let key = this.next;
        this.next += 1;
        this.entries.push((key, listener));

        Subscription {
            key,
            listeners: Rc::downgrade(listeners),
        }
    }

    /// Copy out the current listeners, so they can run with nothing borrowed.
    pub(crate) fn snapshot(&self) -> Vec<Listener> {
        self.entries.iter().map(|(_, l)| l.clone()).collect()
    }
}

/// A registered listener.
///
/// Dropping a subscription leaves the listener in place; call `unsubscribe`
/// to remove it.
#[must_use = "a subscription is needed to unsubscribe"]
pub struct Subscription {
    key: u64,
    listeners: Weak<RefCell<Listeners>>,
}

impl Subscription {
    /// Remove the listener. Does nothing if the store has been dropped.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let key = self.key;
            listeners.borrow_mut().entries.retain(|(k, _)| *k != key);
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscription({})", self.key)
    }
}

/// Values contributed by wrappers, keyed by type.
#[derive(Default)]
pub struct Extras {
    items: HashMap<TypeId, Box<dyn Any>>,
}

impl Extras {
    /// Create a new, empty, bag.
    pub fn new() -> Extras {
        Extras {
            items: HashMap::new(),
        }
    }

    /// Contribute a value, returning the one of the same type it replaced.
    pub fn insert<T: Any>(&mut self, value: T) -> Option<T> {
        self.items.insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Get the value of a type.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.items.get(&TypeId::of::<T>())
            .and_then(|item| item.downcast_ref::<T>())
    }

    /// The number of values contributed.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing has been contributed.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Debug for Extras {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extras({} items)", self.items.len())
    }
}

/// A layer over a store surface.
pub trait Wrapper {
    /// Wrap `inner`, optionally contributing to the facade's extras.
    fn wrap(self: Box<Self>, inner: Rc<dyn Surface>, extras: &mut Extras) -> Rc<dyn Surface>;
}

impl<F> Wrapper for F
    where F: FnOnce(Rc<dyn Surface>, &mut Extras) -> Rc<dyn Surface>
{
    fn wrap(self: Box<Self>, inner: Rc<dyn Surface>, extras: &mut Extras) -> Rc<dyn Surface> {
        (*self)(inner, extras)
    }
}
