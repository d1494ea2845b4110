//! Core types for the entitystate change tracker.
//!
//! This crate provides the foundations the tracking engine consumes as a
//! read-only service:
//!
//! - `Value` for dynamically-typed scalar member values
//! - `Error` / `Result` shared by every entitystate crate
//! - `MemberMetadata`, `ComplexType`, `EntityType`, `EntitySet` for entity shapes
//! - `AssociationSet` and friends for relationships and referential constraints
//! - `MetadataWorkspace`, the validated registry of all of the above

pub mod association;
pub mod error;
pub mod metadata;
pub mod value;
pub mod workspace;

pub use association::{
    AssociationEnd, AssociationSet, Multiplicity, NavigationProperty, OnDelete,
    ReferentialConstraint,
};
pub use error::{
    ArgumentError, Error, InvalidOperationError, InvalidOperationKind, MetadataError,
    MetadataErrorKind, Result, TypeError,
};
pub use metadata::{ComplexType, EntitySet, EntityType, MemberKind, MemberMetadata, StructuralType};
pub use value::Value;
pub use workspace::{MetadataWorkspace, is_valid_identifier};
