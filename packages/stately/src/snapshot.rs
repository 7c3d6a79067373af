//! Immutable snapshots of the store, and the draft used to evolve them.
//!
//! A `Snapshot` maps entity ids to shared entities. Snapshots are never
//! modified once they have been handed out: the store evolves them through a
//! `Draft`, which uses `Arc::make_mut` so that the first write of a pass copies
//! the map (bumping the reference counts of every entity) and each written
//! entity gets a fresh `Arc`. Entities nobody wrote to keep their reference.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use once_cell::sync::Lazy;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::entity::{Entity, EntityId, EntityMut};
use crate::error::StoreError;

static EMPTY: Lazy<Arc<Snapshot>> = Lazy::new(|| Arc::new(Snapshot::empty()));

/// A snapshot of every entity in the store.
#[derive(Clone, Default, PartialEq)]
pub struct Snapshot {
    entities: BTreeMap<EntityId, Arc<Entity>>,
}

impl Snapshot {
    /// Create a new snapshot with no entities.
    pub fn empty() -> Snapshot {
        Snapshot {
            entities: BTreeMap::new(),
        }
    }

    /// Get a shared empty snapshot.
    pub fn shared_empty() -> Arc<Snapshot> {
        EMPTY.clone()
    }

    /// Build a snapshot from a JSON object of the form `{ id: { type, ... } }`.
    pub fn from_json(value: Value) -> Result<Snapshot, StoreError> {
        let map = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(StoreError::InvalidEntity {
                    reason: format!("expected an object of entities, found {}", other),
                });
            }
        };

        let mut snapshot = Snapshot::empty();
        for (key, value) in map {
            let attrs = match value {
                Value::Object(attrs) => attrs,
                other => {
                    return Err(StoreError::InvalidEntity {
                        reason: format!("entity `{}` is not an object: {}", key, other),
                    });
                }
            };
            snapshot.insert(Entity::from_map(Some(&key), attrs)?);
        }

        Ok(snapshot)
    }

    /// Insert an entity, returning the entity it replaced.
    pub fn insert(&mut self, entity: impl Into<Arc<Entity>>) -> Option<Arc<Entity>> {
        let entity = entity.into();
        self.entities.insert(entity.id().to_owned(), entity)
    }

    /// Insert an entity, builder style.
    pub fn with(mut self, entity: impl Into<Arc<Entity>>) -> Snapshot {
        self.insert(entity);
        self
    }

    /// Remove an entity, returning it.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Entity>> {
        self.entities.remove(id)
    }

    /// Get an entity by id.
    pub fn get(&self, id: &str) -> Option<&Arc<Entity>> {
        self.entities.get(id)
    }

    /// Returns true if an entity with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// The number of entities in the snapshot.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if there are no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Iterate over the ids of all entities, in order.
    pub fn ids(&self) -> impl Iterator<Item=&EntityId> {
        self.entities.keys()
    }

    /// Iterate over all entities, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item=&Arc<Entity>> {
        self.entities.values()
    }

    /// Create a parallel iterator over all entities.
    pub fn par_iter(&self) -> impl ParallelIterator<Item=&Arc<Entity>> {
        self.entities.par_iter().map(|(_, entity)| entity)
    }

    /// Iterate over all entities of a given type.
    pub fn of_type<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item=&'a Arc<Entity>> + 'a {
        self.entities.values().filter(move |e| e.type_name() == type_name)
    }

    /// Convert this snapshot to its JSON form.
    pub fn to_json(&self) -> Value {
        let map = self.entities.iter()
            .map(|(id, entity)| (id.clone(), entity.to_json()))
            .collect::<Map<_, _>>();
        Value::Object(map)
    }
}

impl Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entities.iter().map(|(id, e)| (id, &**e)))
            .finish()
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.entities.iter().map(|(id, e)| (id, &**e)))
    }
}

/// A mutable view of the snapshot being built by a pass.
///
/// Systems receive a `Draft` so that they can read and update any entity.
/// Every read sees the latest writes made in the pass.
pub struct Draft<'a> {
    state: &'a RefCell<Arc<Snapshot>>,
}

impl<'a> Draft<'a> {
    pub(crate) fn new(state: &'a RefCell<Arc<Snapshot>>) -> Draft<'a> {
        Draft {
            state,
        }
    }

    /// Get the current state of the draft.
    ///
    /// The returned snapshot is frozen: further writes to the draft will copy.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.state.borrow().clone()
    }

    /// Get an entity by id.
    pub fn get(&self, id: &str) -> Option<Arc<Entity>> {
        self.state.borrow().get(id).cloned()
    }

    /// Returns true if the entity is live in the draft.
    pub fn contains(&self, id: &str) -> bool {
        self.state.borrow().contains(id)
    }

    /// Collect the ids of every live entity.
    pub fn ids(&self) -> Vec<EntityId> {
        self.state.borrow().ids().cloned().collect()
    }

    /// Collect the ids of every live entity of a given type.
    pub fn ids_of_type(&self, type_name: &str) -> Vec<EntityId> {
        self.state.borrow()
            .of_type(type_name)
            .map(|e| e.id().to_owned())
            .collect()
    }

    /// Update an entity through a tracked handle.
    ///
    /// Returns `None` if the entity is not live. The entity is only replaced
    /// if `f` wrote to it.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut EntityMut) -> R) -> Option<R> {
        let entity = self.get(id)?;
        let mut handle = EntityMut::new(entity);
        let result = f(&mut handle);
        self.commit(handle);
        Some(result)
    }

    /// Write a tracked handle back.
    ///
    /// Nothing is written unless the handle is dirty and the draft still holds
    /// the exact entity the handle started from.
    pub(crate) fn commit(&self, handle: EntityMut) -> bool {
        let (base, modified) = handle.into_parts();
        let modified = match modified {
            Some(modified) => modified,
            None => return false,
        };

        let mut state = self.state.borrow_mut();
        let live = state.get(base.id()).map_or(false, |e| Arc::ptr_eq(e, &base));
        if !live {
            return false;
        }

        Arc::make_mut(&mut *state).insert(modified);
        true
    }

    /// Insert a new entity.
    pub(crate) fn insert(&self, entity: Arc<Entity>) {
        let mut state = self.state.borrow_mut();
        Arc::make_mut(&mut *state).insert(entity);
    }

    /// Remove an entity, returning it.
    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Entity>> {
        let mut state = self.state.borrow_mut();
        if !state.contains(id) {
            return None;
        }

        Arc::make_mut(&mut *state).remove(id)
    }

    /// Replace the whole state, returning the previous one.
    pub(crate) fn replace(&self, next: Arc<Snapshot>) -> Arc<Snapshot> {
        std::mem::replace(&mut *self.state.borrow_mut(), next)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_from_json() {
        let snapshot = Snapshot::from_json(json!({
            "k1": { "type": "kitty" },
            "d1": { "id": "d1", "type": "doggo", "good": true },
        })).unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.ids().collect::<Vec<_>>(), vec!["d1", "k1"]);
        assert_eq!(snapshot.get("k1").unwrap().type_name(), "kitty");
        assert_eq!(serde_json::to_value(&snapshot).unwrap(), json!({
            "k1": { "id": "k1", "type": "kitty" },
            "d1": { "id": "d1", "type": "doggo", "good": true },
        }));
        assert_eq!(snapshot.to_json(), serde_json::to_value(&snapshot).unwrap());

        assert!(Snapshot::from_json(json!({ "k1": 3 })).is_err());
        assert!(Snapshot::from_json(json!([])).is_err());
        assert!(Snapshot::from_json(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_of_type() {
        let snapshot = Snapshot::empty()
            .with(Entity::new("a1", "a"))
            .with(Entity::new("b1", "b"))
            .with(Entity::new("a2", "a"));

        let ids = snapshot.of_type("a").map(|e| e.id()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert_eq!(snapshot.of_type("c").count(), 0);
        assert_eq!(snapshot.par_iter().filter(|e| e.type_name() == "a").count(), 2);
    }

    #[test]
    fn test_draft_copy_on_write() {
        let base = Arc::new(Snapshot::empty()
            .with(Entity::new("a", "t"))
            .with(Entity::new("b", "t")));
        let state = RefCell::new(base.clone());
        let draft = Draft::new(&state);

        // Reading does not copy anything.
        assert_eq!(draft.update("a", |e| e.get("x").cloned()), Some(None));
        assert!(Arc::ptr_eq(&base, &draft.snapshot()));

        draft.update("a", |e| { e.set("x", 1); });
        let next = draft.snapshot();
        assert!(!Arc::ptr_eq(&base, &next));
        assert!(!Arc::ptr_eq(base.get("a").unwrap(), next.get("a").unwrap()));
        assert!(Arc::ptr_eq(base.get("b").unwrap(), next.get("b").unwrap()));
        assert_eq!(base.get("a").unwrap().get("x"), None);
        assert_eq!(next.get("a").unwrap().get("x"), Some(&json!(1)));

        assert_eq!(draft.update("missing", |_| ()), None);
        let mut stale = EntityMut::new(base.get("b").unwrap().clone());
        stale.set("x", 2);
        assert!(draft.remove("b").is_some());
        assert!(!draft.commit(stale));
        assert_eq!(draft.ids(), vec!["a".to_owned()]);
    }
}
