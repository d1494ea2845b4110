//! Association metadata.
//!
//! An association set links two entity sets through two named ends. Each end
//! declares a multiplicity and an optional cascade-delete rule. An
//! association may carry a referential constraint, in which case it is a
//! *foreign key association*: the dependent end's properties hold the
//! principal end's key values and fix-up keeps the two in agreement.

use serde::{Deserialize, Serialize};

/// How many entities may sit at one end of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Multiplicity {
    /// Zero or one entity (`0..1`).
    ZeroOrOne,
    /// Exactly one entity (`1`).
    One,
    /// Any number of entities (`*`).
    Many,
}

impl Multiplicity {
    /// `true` for `One` and `ZeroOrOne` ends, which surface as references.
    pub const fn is_reference(self) -> bool {
        !matches!(self, Multiplicity::Many)
    }
}

/// What happens to entities at the *other* end when an entity at this end is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnDelete {
    /// Related entities are left alone (their relationships are removed).
    #[default]
    NoAction,
    /// Related entities at the other end are deleted too.
    Cascade,
}

/// One end of an association set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationEnd {
    /// Role name, unique within the association (e.g. `"Customer"`).
    pub role: String,

    /// Entity set the end's entities belong to.
    pub entity_set: String,

    /// Multiplicity of this end.
    pub multiplicity: Multiplicity,

    /// Delete rule applied when an entity at this end is deleted.
    pub on_delete: OnDelete,
}

impl AssociationEnd {
    #[must_use]
    pub fn new(
        role: impl Into<String>,
        entity_set: impl Into<String>,
        multiplicity: Multiplicity,
    ) -> Self {
        Self {
            role: role.into(),
            entity_set: entity_set.into(),
            multiplicity,
            on_delete: OnDelete::NoAction,
        }
    }

    /// Deleting an entity at this end deletes the related entities.
    #[must_use]
    pub fn cascade_delete(mut self) -> Self {
        self.on_delete = OnDelete::Cascade;
        self
    }
}

/// A principal/dependent property mapping.
///
/// `dependent_properties[i]` holds the value of `principal_properties[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferentialConstraint {
    pub principal_role: String,
    pub dependent_role: String,
    pub principal_properties: Vec<String>,
    pub dependent_properties: Vec<String>,
}

impl ReferentialConstraint {
    #[must_use]
    pub fn new(
        principal_role: impl Into<String>,
        dependent_role: impl Into<String>,
        principal_properties: &[&str],
        dependent_properties: &[&str],
    ) -> Self {
        Self {
            principal_role: principal_role.into(),
            dependent_role: dependent_role.into(),
            principal_properties: principal_properties.iter().map(|s| (*s).to_string()).collect(),
            dependent_properties: dependent_properties.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

/// A named association between two entity sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationSet {
    pub name: String,
    pub ends: [AssociationEnd; 2],
    pub constraint: Option<ReferentialConstraint>,
}

impl AssociationSet {
    #[must_use]
    pub fn new(name: impl Into<String>, end0: AssociationEnd, end1: AssociationEnd) -> Self {
        Self {
            name: name.into(),
            ends: [end0, end1],
            constraint: None,
        }
    }

    /// Attach a referential constraint, making this a foreign key association.
    #[must_use]
    pub fn with_constraint(mut self, constraint: ReferentialConstraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    pub fn is_foreign_key(&self) -> bool {
        self.constraint.is_some()
    }

    pub fn end(&self, index: usize) -> &AssociationEnd {
        &self.ends[index & 1]
    }

    /// Index (0 or 1) of the end with the given role.
    pub fn end_index(&self, role: &str) -> Option<usize> {
        self.ends.iter().position(|e| e.role == role)
    }

    /// Index of the principal end of the referential constraint.
    pub fn principal_index(&self) -> Option<usize> {
        self.constraint
            .as_ref()
            .and_then(|c| self.end_index(&c.principal_role))
    }

    /// Index of the dependent end of the referential constraint.
    pub fn dependent_index(&self) -> Option<usize> {
        self.constraint
            .as_ref()
            .and_then(|c| self.end_index(&c.dependent_role))
    }

    /// `true` when both ends belong to the same entity set.
    pub fn is_self_association(&self) -> bool {
        self.ends[0].entity_set == self.ends[1].entity_set
    }
}

/// A navigation property on an entity type.
///
/// `from_role` is the end the declaring entity sits at; `to_role` is the end
/// whose entities the property exposes. The multiplicity of `to_role`
/// decides whether the property is a reference or a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationProperty {
    pub name: String,
    pub association: String,
    pub from_role: String,
    pub to_role: String,
}

impl NavigationProperty {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        association: impl Into<String>,
        from_role: impl Into<String>,
        to_role: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            association: association.into(),
            from_role: from_role.into(),
            to_role: to_role.into(),
        }
    }
}
