//! entitystate - change tracking for in-memory entity graphs.
//!
//! A [`StateManager`] tracks entities attached to a unit of work:
//!
//! - original and current member values, including nested complex objects
//! - the lifecycle state of every entity (`Added`, `Unchanged`, `Modified`,
//!   `Deleted`, `Detached`)
//! - relationships between entities, kept in agreement with navigation
//!   properties and foreign key values
//!
//! Models are described at runtime with a [`MetadataWorkspace`].
//!
//! # Quick Start
//!
//! ```ignore
//! use entitystate::prelude::*;
//! use std::sync::Arc;
//!
//! let customer = EntityType::new("Customer")
//!     .member(MemberMetadata::scalar("Id").key())
//!     .member(MemberMetadata::scalar("Name"));
//! let mut workspace = MetadataWorkspace::new();
//! workspace.add_entity_set(EntitySet::new("Customers", Arc::new(customer)))?;
//! let workspace = Arc::new(workspace);
//!
//! let mut tracker = StateManager::new(Arc::clone(&workspace));
//! let ada = EntityObject::new(workspace.entity_set("Customers")?.element_type())
//!     .with("Id", 1_i64)
//!     .with("Name", "Ada");
//! let id = tracker.attach("Customers", &ada)?;
//!
//! ada.set("Name", "Grace")?;
//! let report = tracker.detect_changes()?;
//! assert_eq!(tracker.state_of(id), EntityState::Modified);
//! assert_eq!(tracker.original_value(id, "Name")?, Value::from("Ada"));
//! ```

pub use entitystate_core::{
    ArgumentError, AssociationEnd, AssociationSet, ComplexType, EntitySet, EntityType, Error,
    InvalidOperationError, InvalidOperationKind, MemberKind, MemberMetadata, MetadataError,
    MetadataErrorKind, MetadataWorkspace, Multiplicity, NavigationProperty, OnDelete,
    ReferentialConstraint, Result, StructuralType, TypeError, Value,
};

pub use entitystate_tracking::{
    ChangeTrackingFlags, ComplexObject, DetectChangesReport, EntityEntry, EntityFlavor, EntityKey,
    EntityKeyMember, EntityObject, EntityState, EntrySnapshot, EntryId, MemberValue,
    ModifiedFields, ObjectId, PropertyChange, RecordValue, RelationshipEntry, RelationshipId,
    RelationshipSnapshot, Scope, ScopeGuard, StateChange, StateManager, StateManagerConfig,
    StateManagerEvents, TrackerSnapshot, TransactionManager, ValueRecord,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entitystate::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Metadata
        AssociationEnd,
        AssociationSet,
        ComplexObject,
        ComplexType,
        // Tracking
        DetectChangesReport,
        EntityKey,
        EntityObject,
        EntitySet,
        EntityState,
        EntityType,
        EntryId,
        Error,
        InvalidOperationKind,
        MemberMetadata,
        MetadataWorkspace,
        Multiplicity,
        NavigationProperty,
        ReferentialConstraint,
        Result,
        StateManager,
        StateManagerConfig,
        Value,
    };
}
