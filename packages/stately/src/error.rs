//! Errors raised by the store.
//!
//! Configuration mistakes (unknown types, malformed entities, bad handler
//! names) fail when they are wired in. Handler failures propagate out of the
//! `dispatch`/`update` call which triggered them.

use crate::entity::EntityId;

/// Errors produced by the store and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An entity names a type which is not in the registry.
    #[error("entity `{entity}` has unknown type `{type_name}`")]
    UnknownType {
        /// The offending entity.
        entity: EntityId,
        /// The type it asked for.
        type_name: String,
    },

    /// An entity description could not be turned into an entity.
    #[error("invalid entity: {reason}")]
    InvalidEntity {
        /// What was wrong with it.
        reason: String,
    },

    /// `add` was asked to create an entity whose id is already live.
    #[error("entity `{0}` already exists")]
    DuplicateEntity(EntityId),

    /// An event name does not follow the `name`, `type:name`, `#id:name` grammar.
    #[error("invalid event name `{0}`")]
    InvalidEventName(String),

    /// A handler table declared a name that can never be dispatched to it.
    #[error("invalid handler name `{name}`: {reason}")]
    InvalidHandlerName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A type name that the `typeName:event` form could never address.
    #[error("invalid type name `{name}`: {reason}")]
    InvalidTypeName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A handler or system failed while processing an event.
    #[error("handler for `{event}` failed on {target}")]
    Handler {
        /// The raw event name being processed.
        event: String,
        /// The entity id, or the system name for system handlers.
        target: String,
        /// The error returned by the handler.
        #[source]
        source: anyhow::Error,
    },

    /// The store owning this surface has been dropped.
    #[error("store has been released")]
    Released,
}

/// A violation of the routing index invariant.
///
/// These are never produced through the public store surface. They exist so
/// that the index can be checked against a snapshot in tests and debug builds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// A live entity declares a handler but is missing from its routing set.
    #[error("entity `{entity}` declares `{handler}` but is not routed to it")]
    Missing {
        /// The live entity.
        entity: EntityId,
        /// The handler name it declares.
        handler: String,
    },

    /// A routing set names an entity which is not live or no longer declares the handler.
    #[error("entity `{entity}` is routed to `{handler}` without declaring it")]
    Stale {
        /// The routed entity.
        entity: EntityId,
        /// The handler name.
        handler: String,
    },

    /// The by-type membership disagrees with the snapshot.
    #[error("entity `{entity}` is filed under the wrong type")]
    WrongType {
        /// The misfiled entity.
        entity: EntityId,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_handler_error_keeps_source() {
        use std::error::Error;

        let err = StoreError::Handler {
            event: "feed".to_owned(),
            target: "k1".to_owned(),
            source: anyhow::anyhow!("no food left"),
        };

        assert_eq!(err.to_string(), "handler for `feed` failed on k1");
        assert_eq!(err.source().map(|s| s.to_string()), Some("no food left".to_owned()));
    }
}
