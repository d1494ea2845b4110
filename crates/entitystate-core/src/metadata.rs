//! Member, complex type, entity type and entity set descriptors.
//!
//! These are the read-only shapes the tracker consults: ordinal lookup,
//! per-ordinal `{is_complex, is_key, nullable}` descriptors and field counts.
//! Everything here is immutable once registered with a
//! [`MetadataWorkspace`](crate::MetadataWorkspace).

use std::sync::Arc;

use crate::association::NavigationProperty;

/// Shape of a member value.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberKind {
    /// A single [`Value`](crate::Value).
    Scalar,
    /// A nested complex object of the given type.
    Complex(Arc<ComplexType>),
}

/// Descriptor for one mapped member of an entity or complex type.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberMetadata {
    name: String,
    kind: MemberKind,
    nullable: bool,
    key: bool,
}

impl MemberMetadata {
    /// A nullable scalar member.
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Scalar,
            nullable: true,
            key: false,
        }
    }

    /// A complex member holding an instance of `complex_type`.
    pub fn complex(name: impl Into<String>, complex_type: Arc<ComplexType>) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Complex(complex_type),
            nullable: false,
            key: false,
        }
    }

    /// Mark this member as part of the entity key. Key members are never nullable.
    pub fn key(mut self) -> Self {
        self.key = true;
        self.nullable = false;
        self
    }

    /// Set whether the member accepts NULL.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &MemberKind {
        &self.kind
    }

    pub fn is_key(&self) -> bool {
        self.key
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_complex(&self) -> bool {
        matches!(self.kind, MemberKind::Complex(_))
    }

    /// The nested type of a complex member.
    pub fn complex_type(&self) -> Option<&Arc<ComplexType>> {
        match &self.kind {
            MemberKind::Complex(ty) => Some(ty),
            MemberKind::Scalar => None,
        }
    }
}

/// Common view over entity and complex types: an ordered member list.
pub trait StructuralType: std::fmt::Debug {
    /// Name of the type.
    fn type_name(&self) -> &str;

    /// Members in ordinal order.
    fn members(&self) -> &[MemberMetadata];

    /// Number of mapped members.
    fn field_count(&self) -> usize {
        self.members().len()
    }

    /// Member at `ordinal`.
    fn member(&self, ordinal: usize) -> Option<&MemberMetadata> {
        self.members().get(ordinal)
    }

    /// Ordinal of the member called `name`.
    fn ordinal_of(&self, name: &str) -> Option<usize> {
        self.members().iter().position(|m| m.name() == name)
    }
}

/// A complex type: a named group of members with no identity of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexType {
    name: String,
    members: Vec<MemberMetadata>,
}

impl ComplexType {
    pub fn new(name: impl Into<String>, members: Vec<MemberMetadata>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }
}

impl StructuralType for ComplexType {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn members(&self) -> &[MemberMetadata] {
        &self.members
    }
}

/// An entity type: members, key members and navigation properties.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    name: String,
    members: Vec<MemberMetadata>,
    navigation: Vec<NavigationProperty>,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            navigation: Vec::new(),
        }
    }

    /// Append a member; ordinals follow declaration order.
    pub fn member(mut self, member: MemberMetadata) -> Self {
        self.members.push(member);
        self
    }

    /// Declare a navigation property.
    pub fn navigation(mut self, navigation: NavigationProperty) -> Self {
        self.navigation.push(navigation);
        self
    }

    /// Ordinals of the key members, in declaration order.
    pub fn key_ordinals(&self) -> Vec<usize> {
        self.members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_key())
            .map(|(i, _)| i)
            .collect()
    }

    /// Names of the key members, in declaration order.
    pub fn key_member_names(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| m.is_key())
            .map(MemberMetadata::name)
            .collect()
    }

    pub fn is_key_member(&self, ordinal: usize) -> bool {
        self.members.get(ordinal).is_some_and(MemberMetadata::is_key)
    }

    pub fn navigation_properties(&self) -> &[NavigationProperty] {
        &self.navigation
    }

    /// Navigation property called `name`.
    pub fn navigation_property(&self, name: &str) -> Option<&NavigationProperty> {
        self.navigation.iter().find(|n| n.name == name)
    }
}

impl StructuralType for EntityType {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn members(&self) -> &[MemberMetadata] {
        &self.members
    }
}

/// A named set of entities of one type. Keys are scoped to an entity set.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySet {
    name: String,
    element_type: Arc<EntityType>,
}

impl EntitySet {
    pub fn new(name: impl Into<String>, element_type: Arc<EntityType>) -> Self {
        Self {
            name: name.into(),
            element_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> &Arc<EntityType> {
        &self.element_type
    }
}
