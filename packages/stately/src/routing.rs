//! The routing index maps handler names to the entities which handle them.
//!
//! Broadcast events are resolved through this index rather than by scanning
//! every entity. The invariant is: an entity id is in the set for handler `H`
//! if and only if the entity is live and its resolved type declares `H`.
//!
//! The index is rebuilt whenever the whole snapshot is replaced and is
//! otherwise kept up to date as entities come and go and as types are
//! swapped. Membership is kept in sets, so registering or unregistering the
//! same entity twice is harmless.

use std::collections::{BTreeMap, BTreeSet};

use crate::entity::EntityId;
use crate::error::{IndexError, StoreError};
use crate::snapshot::Snapshot;
use crate::types::{Type, Types};

/// An index from handler name, and type name, to live entity ids.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutingIndex {
    handlers: BTreeMap<String, BTreeSet<EntityId>>,
    types: BTreeMap<String, BTreeSet<EntityId>>,
}

fn insert_member(sets: &mut BTreeMap<String, BTreeSet<EntityId>>, key: &str, id: &str) {
    match sets.get_mut(key) {
        Some(set) => {
            set.insert(id.to_owned());
        }
        None => {
            let mut set = BTreeSet::new();
            set.insert(id.to_owned());
            sets.insert(key.to_owned(), set);
        }
    }
}

fn remove_member(sets: &mut BTreeMap<String, BTreeSet<EntityId>>, key: &str, id: &str) {
    if let Some(set) = sets.get_mut(key) {
        set.remove(id);
        if set.is_empty() {
            sets.remove(key);
        }
    }
}

impl RoutingIndex {
    /// Create a new, empty, index.
    pub fn new() -> RoutingIndex {
        RoutingIndex {
            handlers: BTreeMap::new(),
            types: BTreeMap::new(),
        }
    }

    /// Build an index for a whole snapshot.
    ///
    /// Fails if any entity has a type which is not registered.
    pub fn build(snapshot: &Snapshot, types: &Types) -> Result<RoutingIndex, StoreError> {
        let mut index = RoutingIndex::new();
        for entity in snapshot.iter() {
            let ty = types.get(entity.type_name())
                .ok_or_else(|| StoreError::UnknownType {
                    entity: entity.id().to_owned(),
                    type_name: entity.type_name().to_owned(),
                })?;
            index.register(entity.id(), ty);
        }
        Ok(index)
    }

    /// Route every handler of `ty` to the entity.
    pub fn register(&mut self, id: &str, ty: &Type) {
        insert_member(&mut self.types, ty.name(), id);
        for handler in ty.handler_names() {
            insert_member(&mut self.handlers, handler, id);
        }
    }

    /// Remove every route `ty` gave the entity.
    pub fn unregister(&mut self, id: &str, ty: &Type) {
        remove_member(&mut self.types, ty.name(), id);
        for handler in ty.handler_names() {
            remove_member(&mut self.handlers, handler, id);
        }
    }

    /// Move every live entity of a type from its old handlers to its new ones.
    ///
    /// `old` is `None` if the type was not previously registered.
    pub fn migrate(&mut self, old: Option<&Type>, new: &Type) -> usize {
        let ids = self.of_type(new.name());
        for id in ids.iter() {
            if let Some(old) = old {
                self.unregister(id, old);
            }
            self.register(id, new);
        }
        ids.len()
    }

    /// The ids routed to a handler, in order.
    pub fn subscribers(&self, handler: &str) -> Vec<EntityId> {
        self.handlers.get(handler)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true if the entity is routed to the handler.
    pub fn is_subscribed(&self, handler: &str, id: &str) -> bool {
        self.handlers.get(handler).map_or(false, |set| set.contains(id))
    }

    /// The ids of every live entity of a type, in order.
    pub fn of_type(&self, type_name: &str) -> Vec<EntityId> {
        self.types.get(type_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Iterate over the handler names which have at least one subscriber.
    pub fn handler_names(&self) -> impl Iterator<Item=&str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Check the index against a snapshot and registry.
    pub fn verify(&self, snapshot: &Snapshot, types: &Types) -> Result<(), IndexError> {
        for entity in snapshot.iter() {
            let filed = self.types.get(entity.type_name())
                .map_or(false, |set| set.contains(entity.id()));
            if !filed {
                return Err(IndexError::WrongType {
                    entity: entity.id().to_owned(),
                });
            }

            if let Some(ty) = types.get(entity.type_name()) {
                for handler in ty.handler_names() {
                    if !self.is_subscribed(handler, entity.id()) {
                        return Err(IndexError::Missing {
                            entity: entity.id().to_owned(),
                            handler: handler.to_owned(),
                        });
                    }
                }
            }
        }

        for (type_name, ids) in self.types.iter() {
            for id in ids.iter() {
                let ok = snapshot.get(id).map_or(false, |e| e.type_name() == type_name);
                if !ok {
                    return Err(IndexError::WrongType {
                        entity: id.clone(),
                    });
                }
            }
        }

        for (handler, ids) in self.handlers.iter() {
            for id in ids.iter() {
                let declared = snapshot.get(id)
                    .and_then(|e| types.get(e.type_name()))
                    .map_or(false, |ty| ty.declares(handler));
                if !declared {
                    return Err(IndexError::Stale {
                        entity: id.clone(),
                        handler: handler.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
