//! A wrapper which records what passes through a store.
//!
//! The recorder sees every event dispatched through the outermost surface,
//! including lifecycle companions and everything raised by handlers and
//! systems, and keeps each snapshot committed at the end of a pass. The
//! `History` it fills is available from the store and from every facade.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::error::StoreError;
use crate::event::Event;
use crate::snapshot::Snapshot;
use crate::store::{Extras, Listener, Subscription, Surface, Wrapper};
use crate::types::{Type, TypeDef};

#[derive(Default)]
struct Log {
    events: Vec<String>,
    snapshots: Vec<Arc<Snapshot>>,
}

/// A shared handle onto what a `Recorder` has seen.
#[derive(Clone, Default)]
pub struct History {
    log: Rc<RefCell<Log>>,
}

impl History {
    /// The names of every event dispatched, in dispatch order.
    pub fn events(&self) -> Vec<String> {
        self.log.borrow().events.clone()
    }

    /// Every snapshot committed at the end of a pass.
    pub fn snapshots(&self) -> Vec<Arc<Snapshot>> {
        self.log.borrow().snapshots.clone()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        let mut log = self.log.borrow_mut();
        log.events.clear();
        log.snapshots.clear();
    }
}

impl Debug for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log = self.log.borrow();
        write!(f, "History({} events, {} snapshots)", log.events.len(), log.snapshots.len())
    }
}

/// Records events and snapshots into a `History`.
#[derive(Debug, Default)]
pub struct Recorder {
    history: History,
}

impl Recorder {
    /// Create a new recorder with an empty history.
    pub fn new() -> Recorder {
        Recorder::default()
    }

    /// The history this recorder will fill.
    pub fn history(&self) -> History {
        self.history.clone()
    }
}

impl Wrapper for Recorder {
    fn wrap(self: Box<Self>, inner: Rc<dyn Surface>, extras: &mut Extras) -> Rc<dyn Surface> {
        let log = self.history.log.clone();
        let _ = inner.subscribe(Rc::new(move |state: &Arc<Snapshot>| {
            log.borrow_mut().snapshots.push(state.clone());
        }));

        extras.insert(self.history.clone());
        Rc::new(Recorded {
            inner,
            history: self.history,
        })
    }
}

struct Recorded {
    inner: Rc<dyn Surface>,
    history: History,
}

impl Surface for Recorded {
    fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.subscribe(listener)
    }

    fn update(&self) -> Result<(), StoreError> {
        self.inner.update()
    }

    fn dispatch(&self, event: Event) -> Result<(), StoreError> {
        debug!(event = %event, "recorded");
        self.history.log.borrow_mut().events.push(event.name().to_owned());
        self.inner.dispatch(event)
    }

    fn state(&self) -> Arc<Snapshot> {
        self.inner.state()
    }

    fn set_state(&self, next: Snapshot) -> Result<(), StoreError> {
        self.inner.set_state(next)
    }

    fn get_type(&self, name: &str) -> Option<Arc<Type>> {
        self.inner.get_type(name)
    }

    fn set_type(&self, name: &str, def: TypeDef) -> Result<(), StoreError> {
        self.inner.set_type(name, def)
    }
}
