//! The engine at the centre of every store.
//!
//! The core owns the pending queue, the current snapshot, the type registry
//! and the routing index. A pass pops events one at a time and routes each to
//! the entities and systems that handle it; everything they raise joins the
//! queue and is processed in the same pass. Lifecycle companions jump to the
//! front of the queue so that an entity's `create` runs before anything else
//! is delivered to it.
//!
//! Passes never nest. An `update` made while a pass is running returns
//! straight away and the running pass picks the new events up.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use once_cell::unsync::OnceCell;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::entity::{Entity, EntityId, EntityMut};
use crate::error::{IndexError, StoreError};
use crate::event::{Event, Lifecycle, Scope, ADD, REMOVE};
use crate::facade::{Facade, Inbox};
use crate::routing::RoutingIndex;
use crate::snapshot::{Draft, Snapshot};
use crate::system::System;
use crate::types::{Type, TypeDef, Types};

use super::surface::{Extras, Listener, Listeners, Subscription, Surface};
use super::{Mode, Options};

/// Marks a pass as running for as long as it is alive.
struct PassGuard<'a> {
    running: &'a Cell<bool>,
}

impl<'a> PassGuard<'a> {
    fn enter(running: &'a Cell<bool>) -> PassGuard<'a> {
        running.set(true);
        PassGuard {
            running,
        }
    }
}

impl<'a> Drop for PassGuard<'a> {
    fn drop(&mut self) {
        self.running.set(false);
    }
}

fn handler_error(event: &Event, target: &str, source: anyhow::Error) -> StoreError {
    StoreError::Handler {
        event: event.name().to_owned(),
        target: target.to_owned(),
        source,
    }
}

pub(crate) struct Core {
    state: RefCell<Arc<Snapshot>>,
    types: RefCell<Types>,
    index: RefCell<RoutingIndex>,
    systems: Vec<System>,
    queue: RefCell<VecDeque<Event>>,
    front: Cell<usize>,
    retiring: RefCell<BTreeMap<EntityId, VecDeque<Arc<Entity>>>>,
    inbox: Arc<Inbox>,
    listeners: Rc<RefCell<Listeners>>,
    processing: Cell<bool>,
    options: Options,
    outer: OnceCell<Weak<dyn Surface>>,
    extras: OnceCell<Rc<Extras>>,
}

impl Core {
    pub(crate) fn new(types: Types, systems: Vec<System>, options: Options) -> Core {
        Core {
            state: RefCell::new(Snapshot::shared_empty()),
            types: RefCell::new(types),
            index: RefCell::new(RoutingIndex::new()),
            systems,
            queue: RefCell::new(VecDeque::new()),
            front: Cell::new(0),
            retiring: RefCell::new(BTreeMap::new()),
            inbox: Arc::new(Inbox::new()),
            listeners: Rc::new(RefCell::new(Listeners::default())),
            processing: Cell::new(false),
            options,
            outer: OnceCell::new(),
            extras: OnceCell::new(),
        }
    }

    /// Attach the outermost surface and the extras contributed by wrappers.
    ///
    /// Only the first call has any effect.
    pub(crate) fn install(&self, outer: Weak<dyn Surface>, extras: Rc<Extras>) {
        let _ = self.outer.set(outer);
        let _ = self.extras.set(extras);
    }

    fn outer(&self) -> Result<Rc<dyn Surface>, StoreError> {
        self.outer.get()
            .and_then(Weak::upgrade)
            .ok_or(StoreError::Released)
    }

    pub(crate) fn facade(&self) -> Facade {
        let surface = match self.outer.get() {
            Some(outer) => outer.clone(),
            None => {
                let detached: Weak<dyn Surface> = Weak::<Core>::new();
                detached
            }
        };
        let extras = self.extras.get().cloned().unwrap_or_default();
        Facade::new(surface, extras, self.inbox.clone())
    }

    pub(crate) fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    /// The number of events waiting, including those not yet drained from
    /// the inbox.
    pub(crate) fn pending(&self) -> usize {
        self.queue.borrow().len() + self.inbox.len()
    }

    pub(crate) fn verify(&self) -> Result<(), IndexError> {
        self.index.borrow().verify(&self.state.borrow(), &self.types.borrow())
    }

    fn enqueue(&self, event: Event) {
        let mut queue = self.queue.borrow_mut();
        if event.is_lifecycle() {
            let at = self.front.get().min(queue.len());
            queue.insert(at, event);
            self.front.set(at + 1);
        } else {
            queue.push_back(event);
        }
    }

    /// Hand events raised by notifiers to the outer surface. In automatic mode
    /// this runs a pass. A running pass delivers them itself.
    pub(crate) fn deliver(&self) -> Result<(), StoreError> {
        if self.processing.get() {
            return Ok(());
        }
        self.drain_inbox()
    }

    fn drain_inbox(&self) -> Result<(), StoreError> {
        if self.inbox.is_empty() {
            return Ok(());
        }

        let outer = self.outer()?;
        while let Some(event) = self.inbox.pop() {
            outer.dispatch(event)?;
        }
        Ok(())
    }

    fn emit(&self, state: &Arc<Snapshot>) {
        let listeners = self.listeners.borrow().snapshot();
        for listener in listeners {
            listener(state);
        }
    }

    fn process(&self, event: &Event, facade: &Facade) -> Result<(), StoreError> {
        if event.lifecycle() == Some(Lifecycle::Destroy) {
            return self.retire(event, facade);
        }

        match event.name() {
            ADD => self.add(event.payload()),
            REMOVE => self.remove(event.payload()),
            _ => self.route(event, facade),
        }
    }

    fn add(&self, payload: &Value) -> Result<(), StoreError> {
        let entity = Entity::from_json(payload.clone())?;
        let ty = self.types.borrow()
            .get(entity.type_name())
            .cloned()
            .ok_or_else(|| StoreError::UnknownType {
                entity: entity.id().to_owned(),
                type_name: entity.type_name().to_owned(),
            })?;

        if self.state.borrow().contains(entity.id()) {
            return Err(StoreError::DuplicateEntity(entity.id().to_owned()));
        }

        let id = entity.id().to_owned();
        Draft::new(&self.state).insert(Arc::new(entity));
        self.index.borrow_mut().register(&id, &ty);
        debug!(entity = %id, type_name = ty.name(), "entity added");

        self.outer()?.dispatch(Event::created(&id))
    }

    fn remove(&self, payload: &Value) -> Result<(), StoreError> {
        let id = payload.as_str()
            .ok_or_else(|| StoreError::InvalidEntity {
                reason: format!("remove expects an entity id, found {}", payload),
            })?;

        let removed = match Draft::new(&self.state).remove(id) {
            Some(removed) => removed,
            None => {
                warn!(entity = id, "remove of an entity which is not live");
                return Ok(());
            }
        };

        if let Some(ty) = self.types.borrow().get(removed.type_name()) {
            self.index.borrow_mut().unregister(id, ty);
        }
        debug!(entity = id, type_name = removed.type_name(), "entity removed");

        self.stash(removed);
        self.outer()?.dispatch(Event::destroyed(id))
    }

    /// Run the `destroy` handler of an entity which has already left the
    /// snapshot. Whatever the handler writes is discarded with the entity.
    fn retire(&self, event: &Event, facade: &Facade) -> Result<(), StoreError> {
        let route = event.route()?;
        let id = match route.scope {
            Scope::Entity(id) => id,
            _ => return Ok(()),
        };

        let retired = {
            let mut retiring = self.retiring.borrow_mut();
            let entity = retiring.get_mut(id).and_then(VecDeque::pop_front);
            if retiring.get(id).map_or(false, VecDeque::is_empty) {
                retiring.remove(id);
            }
            entity
        };
        let entity = match retired {
            Some(entity) => entity,
            None => return Ok(()),
        };

        let handler = self.types.borrow()
            .get(entity.type_name())
            .and_then(|ty| ty.handler(route.handler))
            .cloned();
        if let Some(handler) = handler {
            trace!(entity = id, handler = route.handler, "retiring");
            let mut handle = EntityMut::new(entity);
            handler(&mut handle, event.payload(), facade)
                .map_err(|source| handler_error(event, id, source))?;
        }

        Ok(())
    }

    fn stash(&self, entity: Arc<Entity>) {
        self.retiring.borrow_mut()
            .entry(entity.id().to_owned())
            .or_default()
            .push_back(entity);
    }

    /// Drop stashed entities whose `destroy` companion is no longer queued,
    /// such as when a wrapper swallowed it.
    fn prune_retiring(&self) {
        let mut queued = BTreeMap::<EntityId, usize>::new();
        for event in self.queue.borrow().iter() {
            if event.lifecycle() != Some(Lifecycle::Destroy) {
                continue;
            }
            if let Ok(route) = event.route() {
                if let Scope::Entity(id) = route.scope {
                    *queued.entry(id.to_owned()).or_insert(0) += 1;
                }
            }
        }

        self.retiring.borrow_mut().retain(|id, stash| {
            let keep = queued.get(id).copied().unwrap_or(0);
            while stash.len() > keep {
                stash.pop_front();
            }
            keep > 0
        });
    }

    fn route(&self, event: &Event, facade: &Facade) -> Result<(), StoreError> {
        let route = event.route()?;
        let targets = match route.scope {
            Scope::Global => self.index.borrow().subscribers(route.handler),
            Scope::Type(type_name) => self.index.borrow().of_type(type_name),
            Scope::Entity(id) => {
                if self.state.borrow().contains(id) {
                    vec![id.to_owned()]
                } else {
                    Vec::new()
                }
            }
        };
        trace!(event = %event, targets = targets.len(), "routing");

        for id in targets.iter() {
            self.invoke(id, route.handler, event, facade)?;
        }

        if route.is_global() {
            for system in self.systems.iter() {
                if let Some(handler) = system.handler(route.handler) {
                    trace!(system = system.name(), handler = route.handler, "invoking system");
                    let draft = Draft::new(&self.state);
                    handler(&draft, event.payload(), facade)
                        .map_err(|source| handler_error(event, system.name(), source))?;
                }
            }
        }

        Ok(())
    }

    fn invoke(&self, id: &str, handler_name: &str, event: &Event, facade: &Facade) -> Result<(), StoreError> {
        let entity = self.state.borrow().get(id).cloned();
        let entity = match entity {
            Some(entity) => entity,
            None => return Ok(()),
        };

        let handler = self.types.borrow()
            .get(entity.type_name())
            .and_then(|ty| ty.handler(handler_name))
            .cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => return Ok(()),
        };

        trace!(entity = id, handler = handler_name, "invoking");
        let mut handle = EntityMut::new(entity);
        let result = handler(&mut handle, event.payload(), facade);
        Draft::new(&self.state).commit(handle);

        result.map_err(|source| handler_error(event, id, source))
    }

    /// Add a stub entity, keyed by the type name, for every registered type
    /// with no live entity.
    fn populate(&self, next: &mut Snapshot) {
        let types = self.types.borrow();
        for name in types.names() {
            if next.of_type(name).next().is_none() && !next.contains(name) {
                next.insert(Entity::new(name, name));
            }
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        // Let a pending `Deliveries` future see that the store is gone.
        self.inbox.wake();
    }
}

impl Surface for Core {
    fn subscribe(&self, listener: Listener) -> Subscription {
        Listeners::add(&self.listeners, listener)
    }

    fn update(&self) -> Result<(), StoreError> {
        if self.processing.get() {
            return Ok(());
        }

        let guard = PassGuard::enter(&self.processing);
        let base = self.state();
        let facade = self.facade();
        let mut processed = 0usize;

        loop {
            self.drain_inbox()?;
            let next = self.queue.borrow_mut().pop_front();
            let event = match next {
                Some(event) => event,
                None => break,
            };

            self.front.set(0);
            processed += 1;
            self.process(&event, &facade)?;
        }
        drop(guard);

        debug_assert_eq!(self.verify(), Ok(()));
        if processed == 0 {
            return Ok(());
        }

        let state = self.state();
        debug!(processed, changed = !Arc::ptr_eq(&base, &state), "pass complete");
        self.emit(&state);
        Ok(())
    }

    fn dispatch(&self, event: Event) -> Result<(), StoreError> {
        trace!(event = %event, "queued");

        // Companions are queued by an operation which runs its own pass.
        let lifecycle = event.is_lifecycle();
        self.enqueue(event);
        if lifecycle || self.options.mode == Mode::Manual {
            return Ok(());
        }

        self.outer()?.update()
    }

    fn state(&self) -> Arc<Snapshot> {
        self.state.borrow().clone()
    }

    fn set_state(&self, next: Snapshot) -> Result<(), StoreError> {
        let outer = self.outer()?;
        let mut next = next;
        if self.options.auto_populate {
            self.populate(&mut next);
        }

        let index = RoutingIndex::build(&next, &self.types.borrow())?;
        let previous = Draft::new(&self.state).replace(Arc::new(next));
        *self.index.borrow_mut() = index;

        let current = self.state();
        let removed = previous.iter()
            .filter(|e| !current.contains(e.id()))
            .cloned()
            .collect::<Vec<_>>();
        let added = current.ids()
            .filter(|id| !previous.contains(id))
            .cloned()
            .collect::<Vec<_>>();
        debug!(removed = removed.len(), added = added.len(), entities = current.len(), "state replaced");

        // Outside a pass, queue behind companions still waiting from an
        // earlier call.
        if !self.processing.get() {
            let waiting = self.queue.borrow().iter().take_while(|e| e.is_lifecycle()).count();
            self.front.set(waiting);
        }

        self.prune_retiring();
        for entity in removed {
            let id = entity.id().to_owned();
            self.stash(entity);
            outer.dispatch(Event::destroyed(&id))?;
        }
        for id in added.iter() {
            outer.dispatch(Event::created(id))?;
        }

        match self.options.mode {
            Mode::Automatic => outer.update(),
            Mode::Manual => Ok(()),
        }
    }

    fn get_type(&self, name: &str) -> Option<Arc<Type>> {
        self.types.borrow().get(name).cloned()
    }

    fn set_type(&self, name: &str, def: TypeDef) -> Result<(), StoreError> {
        let resolved = Arc::new(Type::compose(name, &def)?);
        let old = self.types.borrow_mut().insert(resolved.clone());
        let migrated = self.index.borrow_mut().migrate(old.as_deref(), &resolved);
        debug!(type_name = name, migrated, replaced = old.is_some(), "type registered");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::types::HandlerTable;

    use super::*;

    fn core(mode: Mode, types: Types) -> (Rc<Core>, Rc<dyn Surface>) {
        let options = Options {
            mode,
            ..Options::default()
        };
        let core = Rc::new(Core::new(types, Vec::new(), options));
        let surface: Rc<dyn Surface> = core.clone();
        core.install(Rc::downgrade(&surface), Rc::new(Extras::new()));
        (core, surface)
    }

    #[test]
    fn test_companions_keep_order_at_front() {
        let (core, _surface) = core(Mode::Manual, Types::new());

        core.dispatch(Event::named("later")).unwrap();
        core.dispatch(Event::created("a")).unwrap();
        core.dispatch(Event::created("b")).unwrap();

        let names = core.queue.borrow().iter().map(|e| e.name().to_owned()).collect::<Vec<_>>();
        assert_eq!(names, vec!["#a:create", "#b:create", "later"]);
        assert_eq!(core.pending(), 3);
    }

    #[test]
    fn test_update_does_not_nest() {
        let mut types = Types::new();
        let def = TypeDef::from(HandlerTable::new().on("poke", |entity, _, facade| {
            let pokes = entity.get("pokes").and_then(Value::as_u64).unwrap_or(0);
            entity.set("pokes", pokes + 1);
            if pokes == 0 {
                facade.notify("poke", Value::Null)?;
            }
            Ok(())
        }));
        types.register("kitty", &def).unwrap();
        let (core, surface) = core(Mode::Automatic, types);

        surface.set_state(Snapshot::empty().with(Entity::new("k1", "kitty"))).unwrap();
        surface.notify("poke", Value::Null).unwrap();

        assert_eq!(core.state().get("k1").unwrap().get("pokes"), Some(&json!(2)));
        assert_eq!(core.pending(), 0);
        assert!(!core.processing.get());
    }

    /// Swallows `destroy` companions on their way to the core.
    struct Muted {
        core: Rc<Core>,
    }

    impl Surface for Muted {
        fn subscribe(&self, listener: Listener) -> Subscription {
            self.core.subscribe(listener)
        }

        fn update(&self) -> Result<(), StoreError> {
            self.core.update()
        }

        fn dispatch(&self, event: Event) -> Result<(), StoreError> {
            if event.lifecycle() == Some(Lifecycle::Destroy) {
                return Ok(());
            }
            self.core.dispatch(event)
        }

        fn state(&self) -> Arc<Snapshot> {
            self.core.state()
        }

        fn set_state(&self, next: Snapshot) -> Result<(), StoreError> {
            self.core.set_state(next)
        }

        fn get_type(&self, name: &str) -> Option<Arc<Type>> {
            self.core.get_type(name)
        }

        fn set_type(&self, name: &str, def: TypeDef) -> Result<(), StoreError> {
            self.core.set_type(name, def)
        }
    }

    #[test]
    fn test_swallowed_companion_releases_stash() {
        let mut types = Types::new();
        types.register("kitty", &TypeDef::new()).unwrap();
        let core = Rc::new(Core::new(types, Vec::new(), Options::default()));
        let surface: Rc<dyn Surface> = Rc::new(Muted {
            core: core.clone(),
        });
        core.install(Rc::downgrade(&surface), Rc::new(Extras::new()));

        surface.set_state(Snapshot::empty().with(Entity::new("k1", "kitty"))).unwrap();
        surface.set_state(Snapshot::empty()).unwrap();
        assert_eq!(core.retiring.borrow().len(), 1);

        surface.set_state(Snapshot::empty().with(Entity::new("k2", "kitty"))).unwrap();
        assert!(core.retiring.borrow().is_empty());
        assert_eq!(core.verify(), Ok(()));
    }

    #[test]
    fn test_stash_follows_queued_companions() {
        let mut types = Types::new();
        types.register("kitty", &TypeDef::new()).unwrap();
        let (core, surface) = core(Mode::Manual, types);
        let k1 = Snapshot::empty().with(Entity::new("k1", "kitty"));

        surface.set_state(k1.clone()).unwrap();
        surface.update().unwrap();
        surface.set_state(Snapshot::empty()).unwrap();
        surface.set_state(k1.clone()).unwrap();
        surface.set_state(Snapshot::empty()).unwrap();

        let names = core.queue.borrow().iter().map(|e| e.name().to_owned()).collect::<Vec<_>>();
        assert_eq!(names, vec!["#k1:destroy", "#k1:create", "#k1:destroy"]);
        assert_eq!(core.retiring.borrow().get("k1").map(VecDeque::len), Some(2));

        surface.update().unwrap();
        assert!(core.retiring.borrow().is_empty());
        assert!(core.state().is_empty());
    }

    #[test]
    fn test_released_outer_surface() {
        let core = Core::new(Types::new(), Vec::new(), Options::default());
        assert!(matches!(core.set_state(Snapshot::empty()), Err(StoreError::Released)));
        assert!(core.facade().entities().is_empty());
    }
}
