//! Entities are the addressable units of state.
//!
//! An entity is an `id`, a `type` and an open map of attributes. The id and
//! type are fixed for the lifetime of the entity; the attributes are whatever
//! the handlers of its type write.

use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// The identifier of an entity. Unique within a snapshot.
pub type EntityId = String;

/// A single entity.
#[derive(Clone, PartialEq)]
pub struct Entity {
    id: EntityId,
    type_name: String,
    attrs: Map<String, Value>,
}

impl Entity {
    /// Create a new entity with no attributes.
    pub fn new(id: impl Into<EntityId>, type_name: impl Into<String>) -> Entity {
        Entity {
            id: id.into(),
            type_name: type_name.into(),
            attrs: Map::new(),
        }
    }

    /// Build an entity from a JSON object which carries `id` and `type`.
    pub fn from_json(value: Value) -> Result<Entity, StoreError> {
        match value {
            Value::Object(map) => Entity::from_map(None, map),
            other => Err(StoreError::InvalidEntity {
                reason: format!("expected an object, found {}", other),
            }),
        }
    }

    /// Build an entity from an attribute map.
    ///
    /// If `id` is given it is used when the map has no `id`, and must match
    /// the map's `id` when it does.
    pub(crate) fn from_map(id: Option<&str>, mut attrs: Map<String, Value>) -> Result<Entity, StoreError> {
        let id = match (id, attrs.remove("id")) {
            (Some(key), None) => key.to_owned(),
            (None, Some(Value::String(id))) => id,
            (Some(key), Some(Value::String(id))) if key == id => id,
            (Some(key), Some(Value::String(id))) => {
                return Err(StoreError::InvalidEntity {
                    reason: format!("entity keyed `{}` has id `{}`", key, id),
                });
            }
            (_, Some(other)) => {
                return Err(StoreError::InvalidEntity {
                    reason: format!("id must be a string, found {}", other),
                });
            }
            (None, None) => {
                return Err(StoreError::InvalidEntity {
                    reason: "missing id".to_owned(),
                });
            }
        };

        let type_name = match attrs.remove("type") {
            Some(Value::String(type_name)) => type_name,
            Some(other) => {
                return Err(StoreError::InvalidEntity {
                    reason: format!("type of `{}` must be a string, found {}", id, other),
                });
            }
            None => {
                return Err(StoreError::InvalidEntity {
                    reason: format!("entity `{}` has no type", id),
                });
            }
        };

        Ok(Entity {
            id,
            type_name,
            attrs,
        })
    }

    /// Set an attribute, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Entity {
        self.set(key, value);
        self
    }

    /// The id of this entity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The name of the type which handles events for this entity.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Fetch an attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// Set an attribute, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attrs.insert(key.into(), value.into())
    }

    /// Remove an attribute, returning it.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attrs.remove(key)
    }

    /// All attributes except `id` and `type`.
    pub fn attrs(&self) -> &Map<String, Value> {
        &self.attrs
    }

    /// Mutable access to the attributes.
    pub fn attrs_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.attrs
    }

    /// Convert this entity to its JSON form.
    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.attrs.len() + 2);
        map.insert("id".to_owned(), Value::String(self.id.clone()));
        map.insert("type".to_owned(), Value::String(self.type_name.clone()));
        for (key, value) in self.attrs.iter() {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}: {}) {:?}", self.id, self.type_name, self.attrs)
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.attrs.len() + 2))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", &self.type_name)?;
        for (key, value) in self.attrs.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A tracked handle onto an entity in a draft.
///
/// Reading goes straight to the shared entity. The first mutable access
/// copies it and marks the handle dirty; only dirty handles are written back,
/// so an entity which was merely looked at keeps its reference.
pub struct EntityMut {
    base: Arc<Entity>,
    owned: Option<Entity>,
}

impl EntityMut {
    /// Start tracking an entity.
    pub fn new(base: Arc<Entity>) -> EntityMut {
        EntityMut {
            base,
            owned: None,
        }
    }

    /// Returns true if the entity has been written to.
    pub fn is_dirty(&self) -> bool {
        self.owned.is_some()
    }

    /// Promote this handle to a mutable entity, copying it if this is the
    /// first write.
    pub fn make_mut(&mut self) -> &mut Entity {
        let base = &self.base;
        self.owned.get_or_insert_with(|| (**base).clone())
    }

    /// Set an attribute, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.make_mut().set(key, value)
    }

    /// Remove an attribute, returning it.
    ///
    /// Removing an attribute which is not present does not dirty the handle.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if self.get(key).is_none() {
            return None;
        }
        self.make_mut().remove(key)
    }

    /// Mutable access to the attributes.
    pub fn attrs_mut(&mut self) -> &mut Map<String, Value> {
        self.make_mut().attrs_mut()
    }

    /// Finish tracking, returning the new entity if it was written to.
    pub fn into_modified(self) -> Option<Arc<Entity>> {
        self.owned.map(Arc::new)
    }

    /// Finish tracking, returning the entity tracking started from and the
    /// new entity if it was written to.
    pub(crate) fn into_parts(self) -> (Arc<Entity>, Option<Arc<Entity>>) {
        (self.base, self.owned.map(Arc::new))
    }
}

impl Deref for EntityMut {
    type Target = Entity;

    fn deref(&self) -> &Self::Target {
        match &self.owned {
            Some(owned) => owned,
            None => &self.base,
        }
    }
}

impl Debug for EntityMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityMut(dirty: {}) {:?}", self.is_dirty(), self.deref())
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_from_json() {
        let entity = Entity::from_json(json!({ "id": "k1", "type": "kitty", "lives": 9 })).unwrap();
        assert_eq!(entity.id(), "k1");
        assert_eq!(entity.type_name(), "kitty");
        assert_eq!(entity.get("lives"), Some(&json!(9)));
        assert_eq!(entity.get("id"), None);
        assert_eq!(serde_json::to_value(&entity).unwrap(), json!({ "id": "k1", "type": "kitty", "lives": 9 }));
        assert_eq!(entity.to_json(), json!({ "id": "k1", "type": "kitty", "lives": 9 }));
    }

    #[test]
    fn test_from_json_rejects() {
        assert!(Entity::from_json(json!("k1")).is_err());
        assert!(Entity::from_json(json!({ "type": "kitty" })).is_err());
        assert!(Entity::from_json(json!({ "id": 3, "type": "kitty" })).is_err());
        assert!(Entity::from_json(json!({ "id": "k1" })).is_err());

        let map = json!({ "id": "k2", "type": "kitty" }).as_object().cloned().unwrap();
        assert!(Entity::from_map(Some("k1"), map).is_err());
    }

    #[test]
    fn test_tracked_handle() {
        let base = Arc::new(Entity::new("k1", "kitty").with("lives", 9));

        let mut handle = EntityMut::new(base.clone());
        assert_eq!(handle.get("lives"), Some(&json!(9)));
        assert_eq!(handle.remove("missing"), None);
        assert!(!handle.is_dirty());
        assert!(handle.into_modified().is_none());

        let mut handle = EntityMut::new(base.clone());
        handle.set("isFed", true);
        assert!(handle.is_dirty());
        let modified = handle.into_modified().unwrap();
        assert!(!Arc::ptr_eq(&base, &modified));
        assert_eq!(modified.get("isFed"), Some(&json!(true)));
        assert_eq!(base.get("isFed"), None);
    }
}
