//! Metadata registry.
//!
//! The workspace owns every entity set and association set a state manager
//! can track. Registration validates names and constraint shapes up front so
//! the tracker can treat lookups as infallible afterwards.
//!
//! # Example
//!
//! ```ignore
//! let mut ws = MetadataWorkspace::new();
//! ws.add_entity_set(EntitySet::new("Customers", customer_type))?;
//! ws.add_entity_set(EntitySet::new("Orders", order_type))?;
//! ws.add_association(order_customer)?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::association::{AssociationSet, NavigationProperty};
use crate::error::{Error, MetadataErrorKind, Result};
use crate::metadata::{EntitySet, MemberMetadata, StructuralType};

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn identifier_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(IDENTIFIER_PATTERN) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(
                    pattern = IDENTIFIER_PATTERN,
                    error = %e,
                    "Invalid identifier pattern, identifier checks disabled"
                );
                None
            }
        })
        .as_ref()
}

/// Check whether `name` is a valid metadata identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_none_or(|re| re.is_match(name))
}

fn check_identifier(what: &str, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(Error::metadata(
            MetadataErrorKind::InvalidIdentifier,
            format!("{} name '{}' is not a valid identifier", what, name),
        ))
    }
}

fn check_members(owner: &str, members: &[MemberMetadata]) -> Result<()> {
    for (i, member) in members.iter().enumerate() {
        check_identifier("member", member.name())?;
        if members[..i].iter().any(|m| m.name() == member.name()) {
            return Err(Error::metadata(
                MetadataErrorKind::Duplicate,
                format!("member '{}' declared twice on '{}'", member.name(), owner),
            ));
        }
        if let Some(complex) = member.complex_type() {
            if member.is_key() {
                return Err(Error::metadata(
                    MetadataErrorKind::InvalidDefinition,
                    format!(
                        "complex member '{}.{}' cannot be part of the key",
                        owner,
                        member.name()
                    ),
                ));
            }
            check_members(complex.type_name(), complex.members())?;
        }
    }
    Ok(())
}

/// Registry of entity sets and association sets.
#[derive(Debug, Default)]
pub struct MetadataWorkspace {
    entity_sets: Vec<Arc<EntitySet>>,
    associations: Vec<Arc<AssociationSet>>,
    set_index: HashMap<String, usize>,
    association_index: HashMap<String, usize>,
}

impl MetadataWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity set.
    ///
    /// The element type must declare at least one key member, key members
    /// must be scalar, and all names must be identifiers.
    pub fn add_entity_set(&mut self, set: EntitySet) -> Result<Arc<EntitySet>> {
        check_identifier("entity set", set.name())?;
        if self.set_index.contains_key(set.name()) {
            return Err(Error::metadata(
                MetadataErrorKind::Duplicate,
                format!("entity set '{}' already registered", set.name()),
            ));
        }
        let ty = set.element_type();
        check_identifier("entity type", ty.type_name())?;
        check_members(ty.type_name(), ty.members())?;
        if ty.key_ordinals().is_empty() {
            return Err(Error::metadata(
                MetadataErrorKind::InvalidDefinition,
                format!("entity type '{}' declares no key members", ty.type_name()),
            ));
        }
        for nav in ty.navigation_properties() {
            check_identifier("navigation property", &nav.name)?;
            if ty.ordinal_of(&nav.name).is_some() {
                return Err(Error::metadata(
                    MetadataErrorKind::Duplicate,
                    format!(
                        "navigation property '{}' clashes with a member of '{}'",
                        nav.name,
                        ty.type_name()
                    ),
                ));
            }
        }

        let set = Arc::new(set);
        tracing::debug!(
            entity_set = set.name(),
            entity_type = set.element_type().type_name(),
            fields = set.element_type().field_count(),
            "Registered entity set"
        );
        self.set_index
            .insert(set.name().to_string(), self.entity_sets.len());
        self.entity_sets.push(Arc::clone(&set));
        Ok(set)
    }

    /// Register an association set.
    ///
    /// Both end sets must already be registered. A referential constraint
    /// must name both roles, map principal key members one-to-one onto
    /// scalar dependent members, and the principal end may not be `Many`.
    pub fn add_association(&mut self, association: AssociationSet) -> Result<Arc<AssociationSet>> {
        check_identifier("association", &association.name)?;
        if self.association_index.contains_key(&association.name) {
            return Err(Error::metadata(
                MetadataErrorKind::Duplicate,
                format!("association '{}' already registered", association.name),
            ));
        }
        for end in &association.ends {
            check_identifier("role", &end.role)?;
            self.entity_set(&end.entity_set)?;
        }
        if association.ends[0].role == association.ends[1].role {
            return Err(Error::metadata(
                MetadataErrorKind::Duplicate,
                format!(
                    "association '{}' uses role '{}' for both ends",
                    association.name, association.ends[0].role
                ),
            ));
        }
        if let Some(constraint) = &association.constraint {
            self.check_constraint(&association, constraint)?;
        }

        let association = Arc::new(association);
        tracing::debug!(
            association = %association.name,
            foreign_key = association.is_foreign_key(),
            "Registered association set"
        );
        self.association_index
            .insert(association.name.clone(), self.associations.len());
        self.associations.push(Arc::clone(&association));
        Ok(association)
    }

    fn check_constraint(
        &self,
        association: &AssociationSet,
        constraint: &crate::association::ReferentialConstraint,
    ) -> Result<()> {
        let invalid = |message: String| Error::metadata(MetadataErrorKind::InvalidDefinition, message);

        let principal = association.end_index(&constraint.principal_role).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnknownMember,
                format!(
                    "constraint on '{}' names unknown principal role '{}'",
                    association.name, constraint.principal_role
                ),
            )
        })?;
        let dependent = association.end_index(&constraint.dependent_role).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnknownMember,
                format!(
                    "constraint on '{}' names unknown dependent role '{}'",
                    association.name, constraint.dependent_role
                ),
            )
        })?;
        if principal == dependent {
            return Err(invalid(format!(
                "constraint on '{}' uses the same end as principal and dependent",
                association.name
            )));
        }
        if !association.end(principal).multiplicity.is_reference() {
            return Err(invalid(format!(
                "principal end '{}' of '{}' cannot have multiplicity Many",
                constraint.principal_role, association.name
            )));
        }
        if constraint.principal_properties.is_empty()
            || constraint.principal_properties.len() != constraint.dependent_properties.len()
        {
            return Err(invalid(format!(
                "constraint on '{}' must map the same non-zero number of properties",
                association.name
            )));
        }

        let principal_type = self
            .entity_set(&association.end(principal).entity_set)?
            .element_type();
        let dependent_type = self
            .entity_set(&association.end(dependent).entity_set)?
            .element_type();
        let key_names = principal_type.key_member_names();
        if key_names.len() != constraint.principal_properties.len()
            || !constraint
                .principal_properties
                .iter()
                .all(|p| key_names.contains(&p.as_str()))
        {
            return Err(invalid(format!(
                "principal properties of '{}' must be exactly the key of '{}'",
                association.name,
                principal_type.type_name()
            )));
        }
        for prop in &constraint.dependent_properties {
            let member = dependent_type
                .ordinal_of(prop)
                .and_then(|o| StructuralType::member(dependent_type.as_ref(), o))
                .ok_or_else(|| {
                    Error::metadata(
                        MetadataErrorKind::UnknownMember,
                        format!(
                            "dependent property '{}' not found on '{}'",
                            prop,
                            dependent_type.type_name()
                        ),
                    )
                })?;
            if member.is_complex() {
                return Err(invalid(format!(
                    "dependent property '{}.{}' must be scalar",
                    dependent_type.type_name(),
                    prop
                )));
            }
        }
        Ok(())
    }

    /// Look up an entity set by name.
    pub fn entity_set(&self, name: &str) -> Result<&Arc<EntitySet>> {
        self.set_index
            .get(name)
            .map(|&i| &self.entity_sets[i])
            .ok_or_else(|| {
                Error::metadata(
                    MetadataErrorKind::UnknownEntitySet,
                    format!("entity set '{}' is not registered", name),
                )
            })
    }

    /// Look up an association set by name.
    pub fn association(&self, name: &str) -> Result<&Arc<AssociationSet>> {
        self.association_index
            .get(name)
            .map(|&i| &self.associations[i])
            .ok_or_else(|| {
                Error::metadata(
                    MetadataErrorKind::UnknownAssociation,
                    format!("association '{}' is not registered", name),
                )
            })
    }

    /// Entity sets in registration order.
    pub fn entity_sets(&self) -> impl Iterator<Item = &Arc<EntitySet>> {
        self.entity_sets.iter()
    }

    /// Association sets in registration order.
    pub fn associations(&self) -> impl Iterator<Item = &Arc<AssociationSet>> {
        self.associations.iter()
    }

    /// Every `(association, end index)` pair at which `set_name` participates.
    ///
    /// A self association yields one pair per end.
    pub fn association_ends_for(&self, set_name: &str) -> Vec<(Arc<AssociationSet>, usize)> {
        let mut ends = Vec::new();
        for assoc in &self.associations {
            for index in 0..2 {
                if assoc.end(index).entity_set == set_name {
                    ends.push((Arc::clone(assoc), index));
                }
            }
        }
        ends
    }

    /// Foreign key associations in which `set_name` is the dependent end.
    pub fn foreign_key_dependent_ends(&self, set_name: &str) -> Vec<Arc<AssociationSet>> {
        self.associations
            .iter()
            .filter(|a| {
                a.dependent_index()
                    .is_some_and(|d| a.end(d).entity_set == set_name)
            })
            .cloned()
            .collect()
    }

    /// Foreign key associations in which `set_name` is the principal end.
    pub fn foreign_key_principal_ends(&self, set_name: &str) -> Vec<Arc<AssociationSet>> {
        self.associations
            .iter()
            .filter(|a| {
                a.principal_index()
                    .is_some_and(|p| a.end(p).entity_set == set_name)
            })
            .cloned()
            .collect()
    }

    /// Foreign key associations whose dependent properties include `member`
    /// of an entity in `set_name`.
    pub fn foreign_keys_containing(&self, set_name: &str, member: &str) -> Vec<Arc<AssociationSet>> {
        self.foreign_key_dependent_ends(set_name)
            .into_iter()
            .filter(|a| {
                a.constraint
                    .as_ref()
                    .is_some_and(|c| c.dependent_properties.iter().any(|p| p == member))
            })
            .collect()
    }

    /// Navigation property declared on `set_name`'s type for the given
    /// association end.
    pub fn navigation_for_end(
        &self,
        set_name: &str,
        association: &AssociationSet,
        from_index: usize,
    ) -> Option<NavigationProperty> {
        let set = self.entity_set(set_name).ok()?;
        let from_role = &association.end(from_index).role;
        set.element_type()
            .navigation_properties()
            .iter()
            .find(|n| n.association == association.name && &n.from_role == from_role)
            .cloned()
    }

    /// Resolve a navigation property by name to its association and the
    /// index of the end the declaring entity sits at.
    pub fn resolve_navigation(
        &self,
        set_name: &str,
        navigation: &str,
    ) -> Result<(Arc<AssociationSet>, usize)> {
        let set = self.entity_set(set_name)?;
        let nav = set
            .element_type()
            .navigation_property(navigation)
            .ok_or_else(|| {
                Error::argument(
                    "navigation",
                    format!(
                        "'{}' is not a navigation property of '{}'",
                        navigation,
                        set.element_type().type_name()
                    ),
                )
            })?;
        let association = self.association(&nav.association)?;
        let from_index = association.end_index(&nav.from_role).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnknownMember,
                format!(
                    "navigation '{}' names unknown role '{}' of '{}'",
                    navigation, nav.from_role, association.name
                ),
            )
        })?;
        if association.end(1 - from_index).role != nav.to_role {
            return Err(Error::metadata(
                MetadataErrorKind::UnknownMember,
                format!(
                    "navigation '{}' names unknown target role '{}' of '{}'",
                    navigation, nav.to_role, association.name
                ),
            ));
        }
        Ok((Arc::clone(association), from_index))
    }
}
