//! Tracked object model.
//!
//! [`EntityObject`] and [`ComplexObject`] are shared handles
//! (`Rc<RefCell<..>>`): cloning a handle aliases the same object, and
//! identity (not value) is what the tracker uses to tell instances apart.
//! Member values are stored by ordinal following the type's member list.
//!
//! Navigation properties hold other entity handles. A navigation is a
//! *reference* (zero or one target) or a *collection*; which one is decided
//! by the association metadata, and the accessors here simply store what
//! they are given.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use entitystate_core::{
    ComplexType, EntityType, Error, MemberKind, MemberMetadata, Result, StructuralType, TypeError,
    Value,
};
use serde::{Deserialize, Serialize};

use crate::entity_key::EntityKey;

/// How an entity type participates in change tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityFlavor {
    /// Plain objects: every change must be found by snapshot comparison.
    #[default]
    Plain,
    /// Proxies that report scalar changes through notifications but hold
    /// plain complex objects.
    ChangeTrackingProxy,
    /// Objects that report every change through notifications.
    SelfTracking,
}

/// Which parts of detect-changes an entry needs, derived from its flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeTrackingFlags {
    pub requires_scalar_change_tracking: bool,
    pub requires_complex_change_tracking: bool,
    pub requires_any_change_tracking: bool,
}

impl EntityFlavor {
    pub const fn change_tracking_flags(self) -> ChangeTrackingFlags {
        match self {
            EntityFlavor::Plain => ChangeTrackingFlags {
                requires_scalar_change_tracking: true,
                requires_complex_change_tracking: true,
                requires_any_change_tracking: true,
            },
            EntityFlavor::ChangeTrackingProxy => ChangeTrackingFlags {
                requires_scalar_change_tracking: false,
                requires_complex_change_tracking: true,
                requires_any_change_tracking: true,
            },
            EntityFlavor::SelfTracking => ChangeTrackingFlags {
                requires_scalar_change_tracking: false,
                requires_complex_change_tracking: false,
                requires_any_change_tracking: false,
            },
        }
    }
}

/// Address-based identity of a tracked object, stable while the object is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

/// Value stored in one member slot.
#[derive(Debug, Clone)]
pub enum MemberValue {
    Scalar(Value),
    /// A complex member; `None` is representable so it can be rejected.
    Complex(Option<ComplexObject>),
}

impl MemberValue {
    /// Default value for a member: NULL scalars and fresh complex objects.
    fn default_for(member: &MemberMetadata) -> Self {
        match member.kind() {
            MemberKind::Scalar => MemberValue::Scalar(Value::Null),
            MemberKind::Complex(ty) => MemberValue::Complex(Some(ComplexObject::new(ty))),
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            MemberValue::Scalar(v) => Some(v),
            MemberValue::Complex(_) => None,
        }
    }

    pub fn as_complex(&self) -> Option<&ComplexObject> {
        match self {
            MemberValue::Complex(c) => c.as_ref(),
            MemberValue::Scalar(_) => None,
        }
    }

    /// Scalars compare by value, complex members by instance.
    pub(crate) fn same_as(&self, other: &MemberValue) -> bool {
        match (self, other) {
            (MemberValue::Scalar(a), MemberValue::Scalar(b)) => a == b,
            (MemberValue::Complex(Some(a)), MemberValue::Complex(Some(b))) => a.ptr_eq(b),
            (MemberValue::Complex(None), MemberValue::Complex(None)) => true,
            _ => false,
        }
    }
}

fn ordinal_for(ty: &dyn StructuralType, name: &str) -> Result<usize> {
    ty.ordinal_of(name).ok_or_else(|| {
        Error::argument(
            "member",
            format!("'{}' is not a mapped member of '{}'", name, ty.type_name()),
        )
    })
}

fn member_kind_mismatch(ty: &dyn StructuralType, name: &str, expected: &'static str, actual: &str) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.to_string(),
        member: Some(format!("{}.{}", ty.type_name(), name)),
    })
}

fn checked_scalar_ordinal(ty: &dyn StructuralType, name: &str) -> Result<usize> {
    let ordinal = ordinal_for(ty, name)?;
    if ty.members()[ordinal].is_complex() {
        return Err(member_kind_mismatch(ty, name, "scalar member", "complex member"));
    }
    Ok(ordinal)
}

fn checked_complex_ordinal(ty: &dyn StructuralType, name: &str) -> Result<usize> {
    let ordinal = ordinal_for(ty, name)?;
    if !ty.members()[ordinal].is_complex() {
        return Err(member_kind_mismatch(ty, name, "complex member", "scalar member"));
    }
    Ok(ordinal)
}

// ============================================================================
// Complex objects
// ============================================================================

struct ComplexData {
    complex_type: Arc<ComplexType>,
    values: Vec<MemberValue>,
}

/// Instance of a complex type. Has no key; identity is the instance itself.
#[derive(Clone)]
pub struct ComplexObject(Rc<RefCell<ComplexData>>);

impl ComplexObject {
    pub fn new(complex_type: &Arc<ComplexType>) -> Self {
        let values = complex_type
            .members()
            .iter()
            .map(MemberValue::default_for)
            .collect();
        Self(Rc::new(RefCell::new(ComplexData {
            complex_type: Arc::clone(complex_type),
            values,
        })))
    }

    /// Builder-style scalar assignment; unknown names are logged and ignored.
    #[must_use]
    pub fn with(self, name: &str, value: impl Into<Value>) -> Self {
        if let Err(e) = self.set(name, value) {
            tracing::warn!(member = name, error = %e, "Ignoring complex builder value");
        }
        self
    }

    pub fn complex_type(&self) -> Arc<ComplexType> {
        Arc::clone(&self.0.borrow().complex_type)
    }

    pub fn scalar(&self, name: &str) -> Option<Value> {
        let data = self.0.borrow();
        let ordinal = data.complex_type.ordinal_of(name)?;
        data.values[ordinal].as_scalar().cloned()
    }

    pub fn complex(&self, name: &str) -> Option<ComplexObject> {
        let data = self.0.borrow();
        let ordinal = data.complex_type.ordinal_of(name)?;
        data.values[ordinal].as_complex().cloned()
    }

    /// Assign a scalar member directly, without notifying any tracker.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let ty = self.complex_type();
        let ordinal = checked_scalar_ordinal(&*ty, name)?;
        self.0.borrow_mut().values[ordinal] = MemberValue::Scalar(value.into());
        Ok(())
    }

    /// Replace a nested complex member directly.
    pub fn set_complex(&self, name: &str, value: Option<ComplexObject>) -> Result<()> {
        let ty = self.complex_type();
        let ordinal = checked_complex_ordinal(&*ty, name)?;
        self.0.borrow_mut().values[ordinal] = MemberValue::Complex(value);
        Ok(())
    }

    pub fn ptr_eq(&self, other: &ComplexObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn id(&self) -> ObjectId {
        ObjectId(Rc::as_ptr(&self.0).cast::<()>() as usize)
    }

    pub(crate) fn value_at(&self, ordinal: usize) -> Option<MemberValue> {
        self.0.borrow().values.get(ordinal).cloned()
    }

    pub(crate) fn set_value_at(&self, ordinal: usize, value: MemberValue) {
        if let Some(slot) = self.0.borrow_mut().values.get_mut(ordinal) {
            *slot = value;
        }
    }
}

impl fmt::Debug for ComplexObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.borrow();
        let mut s = f.debug_struct(data.complex_type.type_name());
        for (member, value) in data.complex_type.members().iter().zip(&data.values) {
            s.field(member.name(), value);
        }
        s.finish()
    }
}

// ============================================================================
// Entity objects
// ============================================================================

#[derive(Clone)]
enum NavigationValue {
    Reference(Option<EntityObject>),
    Collection(Vec<EntityObject>),
}

struct EntityData {
    entity_type: Arc<EntityType>,
    flavor: EntityFlavor,
    values: Vec<MemberValue>,
    navigation: HashMap<String, NavigationValue>,
    entity_key: Option<EntityKey>,
    detached_keys: HashMap<String, EntityKey>,
}

/// A tracked entity instance.
#[derive(Clone)]
pub struct EntityObject(Rc<RefCell<EntityData>>);

impl EntityObject {
    /// A new plain entity with NULL scalars and default complex members.
    pub fn new(entity_type: &Arc<EntityType>) -> Self {
        let values = entity_type
            .members()
            .iter()
            .map(MemberValue::default_for)
            .collect();
        Self(Rc::new(RefCell::new(EntityData {
            entity_type: Arc::clone(entity_type),
            flavor: EntityFlavor::Plain,
            values,
            navigation: HashMap::new(),
            entity_key: None,
            detached_keys: HashMap::new(),
        })))
    }

    /// Set the tracking flavor. Takes effect the next time the entity is tracked.
    #[must_use]
    pub fn with_flavor(self, flavor: EntityFlavor) -> Self {
        self.0.borrow_mut().flavor = flavor;
        self
    }

    /// Builder-style scalar assignment; unknown names are logged and ignored.
    #[must_use]
    pub fn with(self, name: &str, value: impl Into<Value>) -> Self {
        if let Err(e) = self.set(name, value) {
            tracing::warn!(member = name, error = %e, "Ignoring entity builder value");
        }
        self
    }

    pub fn flavor(&self) -> EntityFlavor {
        self.0.borrow().flavor
    }

    pub fn entity_type(&self) -> Arc<EntityType> {
        Arc::clone(&self.0.borrow().entity_type)
    }

    /// Value of the member called `name`.
    pub fn get(&self, name: &str) -> Option<MemberValue> {
        let data = self.0.borrow();
        let ordinal = data.entity_type.ordinal_of(name)?;
        data.values.get(ordinal).cloned()
    }

    pub fn scalar(&self, name: &str) -> Option<Value> {
        self.get(name).and_then(|v| v.as_scalar().cloned())
    }

    pub fn complex(&self, name: &str) -> Option<ComplexObject> {
        self.get(name).and_then(|v| v.as_complex().cloned())
    }

    /// Assign a scalar member directly, without notifying any tracker.
    ///
    /// Plain entities are expected to be mutated this way; the change is
    /// found by detect-changes.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let ty = self.entity_type();
        let ordinal = checked_scalar_ordinal(&*ty, name)?;
        self.0.borrow_mut().values[ordinal] = MemberValue::Scalar(value.into());
        Ok(())
    }

    /// Replace a complex member directly.
    pub fn set_complex(&self, name: &str, value: Option<ComplexObject>) -> Result<()> {
        let ty = self.entity_type();
        let ordinal = checked_complex_ordinal(&*ty, name)?;
        self.0.borrow_mut().values[ordinal] = MemberValue::Complex(value);
        Ok(())
    }

    /// The key the tracker assigned to this entity, if it is tracked.
    pub fn entity_key(&self) -> Option<EntityKey> {
        self.0.borrow().entity_key.clone()
    }

    /// Key of a related entity that was detached while this reference pointed at it.
    pub fn detached_key(&self, navigation: &str) -> Option<EntityKey> {
        self.0.borrow().detached_keys.get(navigation).cloned()
    }

    /// Target of a reference navigation property.
    pub fn reference(&self, navigation: &str) -> Option<EntityObject> {
        match self.0.borrow().navigation.get(navigation) {
            Some(NavigationValue::Reference(target)) => target.clone(),
            _ => None,
        }
    }

    /// Point a reference navigation property at `target` (or clear it).
    pub fn set_reference(&self, navigation: &str, target: Option<EntityObject>) -> Result<()> {
        self.check_navigation(navigation)?;
        self.0
            .borrow_mut()
            .navigation
            .insert(navigation.to_string(), NavigationValue::Reference(target));
        Ok(())
    }

    /// Members of a collection navigation property.
    pub fn collection(&self, navigation: &str) -> Vec<EntityObject> {
        match self.0.borrow().navigation.get(navigation) {
            Some(NavigationValue::Collection(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Add `target` to a collection navigation property if not already present.
    pub fn add_to_collection(&self, navigation: &str, target: &EntityObject) -> Result<()> {
        self.check_navigation(navigation)?;
        let mut data = self.0.borrow_mut();
        let slot = data
            .navigation
            .entry(navigation.to_string())
            .or_insert_with(|| NavigationValue::Collection(Vec::new()));
        match slot {
            NavigationValue::Collection(items) => {
                if !items.iter().any(|e| e.ptr_eq(target)) {
                    items.push(target.clone());
                }
            }
            NavigationValue::Reference(_) => {
                *slot = NavigationValue::Collection(vec![target.clone()]);
            }
        }
        Ok(())
    }

    /// Remove `target` from a collection navigation property.
    pub fn remove_from_collection(&self, navigation: &str, target: &EntityObject) -> bool {
        let mut data = self.0.borrow_mut();
        match data.navigation.get_mut(navigation) {
            Some(NavigationValue::Collection(items)) => {
                let before = items.len();
                items.retain(|e| !e.ptr_eq(target));
                items.len() != before
            }
            _ => false,
        }
    }

    pub fn ptr_eq(&self, other: &EntityObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn id(&self) -> ObjectId {
        ObjectId(Rc::as_ptr(&self.0).cast::<()>() as usize)
    }

    fn check_navigation(&self, navigation: &str) -> Result<()> {
        let ty = self.entity_type();
        if ty.navigation_property(navigation).is_none() {
            return Err(Error::argument(
                "navigation",
                format!(
                    "'{}' is not a navigation property of '{}'",
                    navigation,
                    ty.type_name()
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn value_at(&self, ordinal: usize) -> Option<MemberValue> {
        self.0.borrow().values.get(ordinal).cloned()
    }

    pub(crate) fn set_value_at(&self, ordinal: usize, value: MemberValue) {
        if let Some(slot) = self.0.borrow_mut().values.get_mut(ordinal) {
            *slot = value;
        }
    }

    pub(crate) fn set_entity_key(&self, key: Option<EntityKey>) {
        self.0.borrow_mut().entity_key = key;
    }

    pub(crate) fn set_detached_key(&self, navigation: &str, key: Option<EntityKey>) {
        let mut data = self.0.borrow_mut();
        match key {
            Some(key) => {
                data.detached_keys.insert(navigation.to_string(), key);
            }
            None => {
                data.detached_keys.remove(navigation);
            }
        }
    }

    /// Entities currently held by a navigation property.
    pub(crate) fn navigation_targets(&self, navigation: &str) -> Vec<EntityObject> {
        match self.0.borrow().navigation.get(navigation) {
            Some(NavigationValue::Reference(Some(target))) => vec![target.clone()],
            Some(NavigationValue::Collection(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn navigation_contains(&self, navigation: &str, target: &EntityObject) -> bool {
        match self.0.borrow().navigation.get(navigation) {
            Some(NavigationValue::Reference(Some(current))) => current.ptr_eq(target),
            Some(NavigationValue::Collection(items)) => items.iter().any(|e| e.ptr_eq(target)),
            _ => false,
        }
    }

    /// Store `target` in a navigation property, as a reference or collection member.
    pub(crate) fn link_navigation(&self, navigation: &str, target: &EntityObject, is_reference: bool) {
        let mut data = self.0.borrow_mut();
        if is_reference {
            data.navigation.insert(
                navigation.to_string(),
                NavigationValue::Reference(Some(target.clone())),
            );
            data.detached_keys.remove(navigation);
        } else {
            let slot = data
                .navigation
                .entry(navigation.to_string())
                .or_insert_with(|| NavigationValue::Collection(Vec::new()));
            if let NavigationValue::Collection(items) = slot {
                if !items.iter().any(|e| e.ptr_eq(target)) {
                    items.push(target.clone());
                }
            } else {
                *slot = NavigationValue::Collection(vec![target.clone()]);
            }
        }
    }

    /// Remove `target` from a navigation property. Returns whether it was present.
    pub(crate) fn unlink_navigation(&self, navigation: &str, target: &EntityObject) -> bool {
        let mut data = self.0.borrow_mut();
        match data.navigation.get_mut(navigation) {
            Some(NavigationValue::Reference(current)) => {
                if current.as_ref().is_some_and(|c| c.ptr_eq(target)) {
                    *current = None;
                    true
                } else {
                    false
                }
            }
            Some(NavigationValue::Collection(items)) => {
                let before = items.len();
                items.retain(|e| !e.ptr_eq(target));
                items.len() != before
            }
            None => false,
        }
    }
}

impl fmt::Debug for EntityObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Navigation values are left out: graphs are usually cyclic.
        let data = self.0.borrow();
        let mut s = f.debug_struct(data.entity_type.type_name());
        for (member, value) in data.entity_type.members().iter().zip(&data.values) {
            s.field(member.name(), value);
        }
        s.finish_non_exhaustive()
    }
}

// ============================================================================
// Owner references
// ============================================================================

/// An object that owns member slots: the entity itself or a nested complex object.
#[derive(Clone, Debug)]
pub(crate) enum ObjectRef {
    Entity(EntityObject),
    Complex(ComplexObject),
}

impl ObjectRef {
    pub(crate) fn id(&self) -> ObjectId {
        match self {
            ObjectRef::Entity(e) => e.id(),
            ObjectRef::Complex(c) => c.id(),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.id() == other.id()
    }

    pub(crate) fn structural_type(&self) -> Arc<dyn StructuralType> {
        match self {
            ObjectRef::Entity(e) => {
                let ty: Arc<dyn StructuralType> = e.entity_type();
                ty
            }
            ObjectRef::Complex(c) => {
                let ty: Arc<dyn StructuralType> = c.complex_type();
                ty
            }
        }
    }

    pub(crate) fn value_at(&self, ordinal: usize) -> Option<MemberValue> {
        match self {
            ObjectRef::Entity(e) => e.value_at(ordinal),
            ObjectRef::Complex(c) => c.value_at(ordinal),
        }
    }

    pub(crate) fn set_value_at(&self, ordinal: usize, value: MemberValue) {
        match self {
            ObjectRef::Entity(e) => e.set_value_at(ordinal, value),
            ObjectRef::Complex(c) => c.set_value_at(ordinal, value),
        }
    }
}
