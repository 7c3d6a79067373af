//! Types: named tables of event handlers, and how they are composed.
//!
//! A type is declared as an ordered list of layers. A layer is either a
//! `HandlerTable`, which is merged over everything before it, or a decorator,
//! which is handed everything composed so far and returns a table to merge on
//! top. Later layers win when handler names collide, so declare base behaviour
//! first and cross-cutting wrappers after.
//!
//! Composition happens once, when a type is registered, and produces a flat
//! `Type`. Handler names are validated at the same time.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use serde_json::Value;

use crate::entity::EntityMut;
use crate::error::StoreError;
use crate::event::{ADD, REMOVE};
use crate::facade::Facade;

/// A handler for one event on one entity.
///
/// Handlers mutate the entity in place through the tracked handle. To affect
/// anything else they notify through the facade.
pub type Handler = Arc<dyn Fn(&mut EntityMut, &Value, &Facade) -> anyhow::Result<()> + Send + Sync>;

/// A decorator receives the table composed so far and returns an extension.
pub type Decorator = Arc<dyn Fn(&HandlerTable) -> HandlerTable + Send + Sync>;

/// A mapping from handler name to handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<String, Handler>,
}

impl HandlerTable {
    /// Create a new, empty, handler table.
    pub fn new() -> HandlerTable {
        HandlerTable {
            handlers: BTreeMap::new(),
        }
    }

    /// Add a handler, builder style.
    pub fn on<F>(mut self, name: impl Into<String>, f: F) -> HandlerTable
        where F: Fn(&mut EntityMut, &Value, &Facade) -> anyhow::Result<()> + Send + Sync + 'static
    {
        self.insert(name, Arc::new(f));
        self
    }

    /// Add a handler, returning the one it replaced.
    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers.insert(name.into(), handler)
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    /// Returns true if the table has a handler with this name.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Iterate over the handler names, in order.
    pub fn names(&self) -> impl Iterator<Item=&str> {
        self.handlers.keys().map(String::as_str)
    }

    /// The number of handlers in the table.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if the table has no handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Merge another table over this one. The other table wins on collisions.
    pub fn merge(&mut self, other: &HandlerTable) {
        for (name, handler) in other.handlers.iter() {
            self.handlers.insert(name.clone(), handler.clone());
        }
    }

    /// Check that every handler name can be dispatched to.
    pub fn validate(&self) -> Result<(), StoreError> {
        self.names().try_for_each(validate_handler_name)
    }
}

impl Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Reject names which the event grammar could never route to a handler.
pub(crate) fn validate_handler_name(name: &str) -> Result<(), StoreError> {
    let reason = if name.is_empty() {
        "handler names cannot be empty"
    } else if name.contains(':') {
        "handler names cannot contain `:`"
    } else if name.starts_with('#') {
        "handler names cannot start with `#`"
    } else if name == ADD || name == REMOVE {
        "`add` and `remove` are handled by the store"
    } else {
        return Ok(());
    };

    Err(StoreError::InvalidHandlerName {
        name: name.to_owned(),
        reason,
    })
}

/// Reject type names which a scoped event could never name.
pub(crate) fn validate_type_name(name: &str) -> Result<(), StoreError> {
    let reason = if name.is_empty() {
        "type names cannot be empty"
    } else if name.contains(':') {
        "type names cannot contain `:`"
    } else if name.starts_with('#') {
        "type names cannot start with `#`"
    } else {
        return Ok(());
    };

    Err(StoreError::InvalidTypeName {
        name: name.to_owned(),
        reason,
    })
}

#[derive(Clone)]
enum Layer {
    Table(HandlerTable),
    Decorator(Decorator),
}

/// The declaration of a type: an ordered list of tables and decorators.
#[derive(Clone, Default)]
pub struct TypeDef {
    layers: Vec<Layer>,
}

impl TypeDef {
    /// Create a new type with no layers.
    pub fn new() -> TypeDef {
        TypeDef {
            layers: Vec::new(),
        }
    }

    /// Merge a handler table over the layers so far.
    pub fn with(mut self, table: HandlerTable) -> TypeDef {
        self.layers.push(Layer::Table(table));
        self
    }

    /// Add a decorator. It is given the table composed so far and its result
    /// is merged on top.
    pub fn decorate<F>(mut self, f: F) -> TypeDef
        where F: Fn(&HandlerTable) -> HandlerTable + Send + Sync + 'static
    {
        self.layers.push(Layer::Decorator(Arc::new(f)));
        self
    }

    /// Append all of the layers of another declaration.
    pub fn extend(mut self, other: TypeDef) -> TypeDef {
        self.layers.extend(other.layers);
        self
    }

    /// The number of layers in this declaration.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns true if this declaration has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Fold the layers into one table.
    pub fn compose(&self) -> Result<HandlerTable, StoreError> {
        let mut composed = HandlerTable::new();
        for layer in self.layers.iter() {
            match layer {
                Layer::Table(table) => composed.merge(table),
                Layer::Decorator(decorator) => {
                    let extension = decorator(&composed);
                    composed.merge(&extension);
                }
            }
        }

        composed.validate()?;
        Ok(composed)
    }
}

impl From<HandlerTable> for TypeDef {
    fn from(table: HandlerTable) -> Self {
        TypeDef::new().with(table)
    }
}

impl Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDef({} layers)", self.layers.len())
    }
}

/// A resolved type.
pub struct Type {
    name: String,
    handlers: HandlerTable,
}

impl Type {
    /// Compose a declaration into a type.
    pub fn compose(name: impl Into<String>, def: &TypeDef) -> Result<Type, StoreError> {
        let name = name.into();
        validate_type_name(&name)?;
        Ok(Type {
            name,
            handlers: def.compose()?,
        })
    }

    /// The name of this type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a handler.
    pub fn handler(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    /// Returns true if this type declares a handler.
    pub fn declares(&self, name: &str) -> bool {
        self.handlers.contains(name)
    }

    /// Iterate over the declared handler names.
    pub fn handler_names(&self) -> impl Iterator<Item=&str> {
        self.handlers.names()
    }

    /// The flat handler table.
    pub fn table(&self) -> &HandlerTable {
        &self.handlers
    }
}

impl Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({}) {:?}", self.name, self.handlers)
    }
}

/// The registry of resolved types, keyed by name.
#[derive(Clone, Default, Debug)]
pub struct Types {
    types: BTreeMap<String, Arc<Type>>,
}

impl Types {
    /// Create a new, empty, registry.
    pub fn new() -> Types {
        Types {
            types: BTreeMap::new(),
        }
    }

    /// Compose and register a type, returning the type it replaced.
    pub fn register(&mut self, name: &str, def: &TypeDef) -> Result<Option<Arc<Type>>, StoreError> {
        let resolved = Arc::new(Type::compose(name, def)?);
        Ok(self.insert(resolved))
    }

    /// Register an already resolved type, returning the type it replaced.
    pub fn insert(&mut self, ty: Arc<Type>) -> Option<Arc<Type>> {
        self.types.insert(ty.name().to_owned(), ty)
    }

    /// Look up a type by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Type>> {
        self.types.get(name)
    }

    /// Returns true if a type with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Iterate over the registered type names, in order.
    pub fn names(&self) -> impl Iterator<Item=&str> {
        self.types.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    fn noop(_: &mut EntityMut, _: &Value, _: &Facade) -> anyhow::Result<()> {
        Ok(())
    }

    fn marker(tag: &'static str) -> impl Fn(&mut EntityMut, &Value, &Facade) -> anyhow::Result<()> + Send + Sync {
        move |entity, _, _| {
            entity.set("by", tag);
            Ok(())
        }
    }

    #[test]
    fn test_later_layers_win() {
        let def = TypeDef::new()
            .with(HandlerTable::new().on("walk", marker("base")).on("eat", marker("base")))
            .with(HandlerTable::new().on("walk", marker("override")));

        let table = def.compose().unwrap();
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["eat", "walk"]);

        let a = Arc::new(crate::Entity::new("a", "t"));
        let facade = Facade::detached();
        let mut handle = EntityMut::new(a);
        table.get("walk").unwrap()(&mut handle, &Value::Null, &facade).unwrap();
        assert_eq!(handle.get("by").and_then(Value::as_str), Some("override"));
        table.get("eat").unwrap()(&mut handle, &Value::Null, &facade).unwrap();
        assert_eq!(handle.get("by").and_then(Value::as_str), Some("base"));
    }

    #[test]
    fn test_decorator_sees_accumulator() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_decorator = seen.clone();

        let def = TypeDef::from(HandlerTable::new().on("walk", noop).on("eat", noop))
            .decorate(move |so_far| {
                seen_in_decorator.lock().unwrap()
                    .extend(so_far.names().map(str::to_owned));

                let inner = so_far.get("walk").cloned();
                HandlerTable::new().on("walk", move |entity, payload, facade| {
                    if let Some(inner) = &inner {
                        inner(entity, payload, facade)?;
                    }
                    let steps = entity.get("steps").and_then(Value::as_u64).unwrap_or(0);
                    entity.set("steps", steps + 1);
                    Ok(())
                })
            })
            .with(HandlerTable::new().on("sleep", noop));

        let table = def.compose().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["eat".to_owned(), "walk".to_owned()]);
        assert_eq!(table.len(), 3);

        let facade = Facade::detached();
        let mut handle = EntityMut::new(Arc::new(crate::Entity::new("a", "t")));
        table.get("walk").unwrap()(&mut handle, &Value::Null, &facade).unwrap();
        table.get("walk").unwrap()(&mut handle, &Value::Null, &facade).unwrap();
        assert_eq!(handle.get("steps"), Some(&Value::from(2)));
    }

    #[test]
    fn test_rejects_handler_names() {
        for name in &["", "a:b", "#a", "add", "remove"] {
            let def = TypeDef::from(HandlerTable::new().on(*name, noop));
            assert!(def.compose().is_err(), "{:?} should be rejected", name);
        }

        let def = TypeDef::from(HandlerTable::new().on("create", noop).on("destroy", noop));
        assert!(def.compose().is_ok());
    }

    #[test]
    fn test_rejects_type_names() {
        let def = TypeDef::from(HandlerTable::new().on("walk", noop));
        let mut types = Types::new();
        for name in &["", "bug:walk", "#bug"] {
            assert!(matches!(types.register(name, &def), Err(StoreError::InvalidTypeName { .. })),
                "{:?} should be rejected", name);
        }
        assert_eq!(types.names().count(), 0);
        assert!(types.register("bug-2", &def).is_ok());
    }

    #[test]
    fn test_registry() {
        let mut types = Types::new();
        let def = TypeDef::from(HandlerTable::new().on("walk", noop));
        assert!(types.register("bug", &def).unwrap().is_none());
        assert!(types.register("bug", &def).unwrap().is_some());
        assert!(types.get("bug").unwrap().declares("walk"));
        assert!(!types.contains("kitty"));
        assert_eq!(types.names().collect::<Vec<_>>(), vec!["bug"]);
    }
}
