//! Object state management for entitystate.
//!
//! The tracker follows entity instances through their lifecycle:
//!
//! - [`StateManager`] owns every [`EntityEntry`] and relationship, indexed by
//!   key and by object identity
//! - [`EntityKey`] identifies an entity, temporarily while it is Added
//! - [`RelationshipEntry`] links two entries and sits in both entries'
//!   relationship lists
//! - fix-up keeps navigation properties and foreign key values in agreement
//! - [`StateManager::detect_changes`] finds changes made to plain objects
//! - [`TransactionManager`] scopes guard re-entrant operations
//!
//! Entities are dynamic: an [`EntityObject`] carries its
//! [`EntityType`](entitystate_core::EntityType) and member values, so one
//! tracker serves any model registered in a
//! [`MetadataWorkspace`](entitystate_core::MetadataWorkspace).

pub mod change_tracking;
pub mod detect_changes;
pub mod entity;
pub mod entity_key;
pub mod entry;
pub mod fixup;
pub mod lifecycle;
pub mod navigation;
pub mod records;
pub mod relationship;
pub mod state_manager;
pub mod transaction;

#[cfg(test)]
mod test_support;

pub use detect_changes::DetectChangesReport;
pub use entity::{ChangeTrackingFlags, ComplexObject, EntityFlavor, EntityObject, MemberValue, ObjectId};
pub use entity_key::{EntityKey, EntityKeyMember};
pub use entry::{EntityEntry, EntityState, EntryId, ModifiedFields};
pub use records::{RecordValue, ValueRecord};
pub use relationship::{RelationshipEntry, RelationshipId};
pub use state_manager::{
    EntrySnapshot, PropertyChange, RelationshipSnapshot, StateChange, StateManager,
    StateManagerConfig, StateManagerEvents, TrackerSnapshot,
};
pub use transaction::{Scope, ScopeGuard, TransactionManager};
