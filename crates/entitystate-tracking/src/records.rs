//! Original and current value records.
//!
//! A [`ValueRecord`] is a read-only copy of an entity's member values, in
//! member order. Complex members become nested records that remember the
//! top-level ordinal they live under; writing through
//! [`StateManager::set_current_value`] with the same dotted path marks that
//! top-level member modified.

use entitystate_core::{Error, InvalidOperationKind, Result, StructuralType, Value};
use serde::Serialize;

use crate::entity::{ComplexObject, EntityObject, MemberValue, ObjectRef};
use crate::entry::{EntityEntry, EntityState, EntryId};
use crate::state_manager::StateManager;

/// A member value inside a [`ValueRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecordValue {
    Scalar(Value),
    Record(ValueRecord),
}

impl RecordValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            RecordValue::Scalar(v) => Some(v),
            RecordValue::Record(_) => None,
        }
    }

    pub fn as_record(&self) -> Option<&ValueRecord> {
        match self {
            RecordValue::Record(r) => Some(r),
            RecordValue::Scalar(_) => None,
        }
    }
}

/// Member values of an entity or complex object, by name and ordinal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueRecord {
    type_name: String,
    /// Top-level member this record projects; `None` for the entity itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_ordinal: Option<usize>,
    names: Vec<String>,
    values: Vec<RecordValue>,
}

impl ValueRecord {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn parent_ordinal(&self) -> Option<usize> {
        self.parent_ordinal
    }

    /// Number of members.
    pub fn field_count(&self) -> usize {
        self.values.len()
    }

    /// Member value by ordinal.
    pub fn get(&self, ordinal: usize) -> Option<&RecordValue> {
        self.values.get(ordinal)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&RecordValue> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    /// Scalar value at a dotted path such as `Address.City`.
    pub fn value(&self, path: &str) -> Option<&Value> {
        let mut record = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let value = record.get_by_name(segment)?;
            if segments.peek().is_none() {
                return value.as_scalar();
            }
            record = value.as_record()?;
        }
        None
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RecordValue)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }
}

impl StateManager {
    /// Values as of the last accept or attach.
    ///
    /// Members without a stored original report their current value.
    pub fn original_values(&self, id: EntryId) -> Result<ValueRecord> {
        let entry = self.tracked(id)?;
        let entity = self.entity_of(id)?;
        if entry.state == EntityState::Added {
            return Err(Error::invalid_operation(
                InvalidOperationKind::InvalidState,
                format!("{} is Added and has no original values", entry.key),
            ));
        }
        Ok(entity_record(&entity, Some(entry)))
    }

    /// Values currently held by the entity.
    pub fn current_values(&self, id: EntryId) -> Result<ValueRecord> {
        let entry = self.tracked(id)?;
        let entity = self.entity_of(id)?;
        if entry.state == EntityState::Deleted {
            return Err(Error::invalid_operation(
                InvalidOperationKind::InvalidState,
                format!("{} is Deleted and has no current values", entry.key),
            ));
        }
        Ok(entity_record(&entity, None))
    }
}

/// Record of `entity`; with `originals`, stored originals replace live values.
fn entity_record(entity: &EntityObject, originals: Option<&EntityEntry>) -> ValueRecord {
    let ty = entity.entity_type();
    let owner = ObjectRef::Entity(entity.clone());
    let mut names = Vec::with_capacity(ty.field_count());
    let mut values = Vec::with_capacity(ty.field_count());
    for (ordinal, member) in ty.members().iter().enumerate() {
        names.push(member.name().to_string());
        values.push(member_value(&owner, ordinal, ordinal, originals));
    }
    ValueRecord {
        type_name: ty.type_name().to_string(),
        parent_ordinal: None,
        names,
        values,
    }
}

fn complex_record(
    object: &ComplexObject,
    parent_ordinal: usize,
    originals: Option<&EntityEntry>,
) -> ValueRecord {
    let ty = object.complex_type();
    let owner = ObjectRef::Complex(object.clone());
    let mut names = Vec::with_capacity(ty.field_count());
    let mut values = Vec::with_capacity(ty.field_count());
    for (ordinal, member) in ty.members().iter().enumerate() {
        names.push(member.name().to_string());
        values.push(member_value(&owner, ordinal, parent_ordinal, originals));
    }
    ValueRecord {
        type_name: ty.type_name().to_string(),
        parent_ordinal: Some(parent_ordinal),
        names,
        values,
    }
}

fn member_value(
    owner: &ObjectRef,
    ordinal: usize,
    parent_ordinal: usize,
    originals: Option<&EntityEntry>,
) -> RecordValue {
    match owner.value_at(ordinal) {
        Some(MemberValue::Scalar(live)) => {
            let original = originals
                .and_then(|e| e.find_original(owner.id(), ordinal).map(|i| &e.original_values[i]))
                .map(|o| o.value.clone());
            RecordValue::Scalar(original.unwrap_or(live))
        }
        Some(MemberValue::Complex(live)) => {
            let object = originals
                .and_then(|e| e.original_complex(owner.id(), ordinal).cloned())
                .or(live);
            match object {
                Some(object) => RecordValue::Record(complex_record(&object, parent_ordinal, originals)),
                None => RecordValue::Scalar(Value::Null),
            }
        }
        None => RecordValue::Scalar(Value::Null),
    }
}
