//! An entity-indexed, event-driven state container.

pub use entity::{Entity, EntityId, EntityMut};
pub use error::{IndexError, StoreError};
pub use event::{Event, Route, Scope};
pub use facade::{Facade, Notifier};
pub use recorder::{History, Recorder};
pub use routing::RoutingIndex;
pub use select::{compute, Identity, Memo};
pub use snapshot::{Draft, Snapshot};
pub use store::{
    Deliveries,
    Extras,
    Mode,
    Options,
    Store,
    StoreBuilder,
    Subscription,
    Surface,
    Wrapper,
};
pub use system::System;
pub use types::{HandlerTable, Type, TypeDef, Types};

pub mod entity;
pub mod error;
pub mod event;
pub mod snapshot;

pub mod types;
pub mod system;
pub mod routing;

pub mod store;
mod facade;
pub mod select;
mod recorder;
