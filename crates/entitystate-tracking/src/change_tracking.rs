//! Property-level change tracking.
//!
//! Three kinds of entity feed this module differently:
//!
//! - Plain entities are snapshotted when they become Unchanged: every scalar
//!   leaf is recorded as an original value and every complex instance is
//!   remembered. Detection compares live values against that snapshot.
//! - Change-tracking proxies report top-level scalar changes through
//!   [`StateManager::entity_member_changing`] and
//!   [`StateManager::entity_member_changed`]; only their complex members are
//!   snapshotted and compared.
//! - Self-tracking entities report everything through notifications.
//!
//! Members are addressed by dotted paths (`Address.City`). A change anywhere
//! under a complex member marks that member's top-level ordinal modified.

use std::collections::HashMap;

use entitystate_core::{Error, InvalidOperationKind, MemberMetadata, Result, StructuralType, Value};

use crate::entity::{ComplexObject, EntityObject, MemberValue, ObjectId, ObjectRef};
use crate::entry::{ComplexSnapshot, EntityState, EntryId, ModifiedFields, OriginalValue, PendingChange};
use crate::state_manager::StateManager;

/// A member slot addressed by a dotted path.
#[derive(Debug, Clone)]
pub(crate) struct MemberSlot {
    pub(crate) owner: ObjectRef,
    pub(crate) ordinal: usize,
    /// Top-level entity ordinal the slot lives under.
    pub(crate) parent_ordinal: usize,
    pub(crate) member: MemberMetadata,
}

/// Resolve `path` against `entity`.
pub(crate) fn resolve_path(entity: &EntityObject, path: &str) -> Result<MemberSlot> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let ty = entity.entity_type();
    let unknown = |name: &str, owner: &str| {
        Error::argument(
            "member",
            format!("'{}' is not a mapped member of '{}' (path '{}')", name, owner, path),
        )
    };
    let parent_ordinal = ty
        .ordinal_of(first)
        .ok_or_else(|| unknown(first, ty.type_name()))?;
    let mut slot = MemberSlot {
        owner: ObjectRef::Entity(entity.clone()),
        ordinal: parent_ordinal,
        parent_ordinal,
        member: <entitystate_core::EntityType as StructuralType>::member(&ty, parent_ordinal)
            .cloned()
            .ok_or_else(|| unknown(first, ty.type_name()))?,
    };
    for segment in segments {
        let holder = match slot.owner.value_at(slot.ordinal) {
            Some(MemberValue::Complex(Some(c))) => c,
            Some(MemberValue::Complex(None)) => {
                return Err(Error::invalid_operation(
                    InvalidOperationKind::NullComplexProperty,
                    format!("complex member '{}' on path '{}' is null", slot.member.name(), path),
                ));
            }
            _ => {
                return Err(Error::argument(
                    "member",
                    format!("'{}' on path '{}' is not a complex member", slot.member.name(), path),
                ));
            }
        };
        let complex_type = holder.complex_type();
        let ordinal = complex_type
            .ordinal_of(segment)
            .ok_or_else(|| unknown(segment, complex_type.type_name()))?;
        let member = complex_type
            .member(ordinal)
            .cloned()
            .ok_or_else(|| unknown(segment, complex_type.type_name()))?;
        slot = MemberSlot {
            owner: ObjectRef::Complex(holder),
            ordinal,
            parent_ordinal,
            member,
        };
    }
    Ok(slot)
}

/// Whether `candidate` occupies any complex slot of `entity` other than `except`.
fn complex_used_elsewhere(
    entity: &EntityObject,
    candidate: &ComplexObject,
    except: (ObjectId, usize),
) -> bool {
    fn walk(owner: &ObjectRef, candidate: &ComplexObject, except: (ObjectId, usize)) -> bool {
        let ty = owner.structural_type();
        for ordinal in 0..ty.field_count() {
            if let Some(MemberValue::Complex(Some(c))) = owner.value_at(ordinal) {
                if (owner.id(), ordinal) != except && c.ptr_eq(candidate) {
                    return true;
                }
                if walk(&ObjectRef::Complex(c), candidate, except) {
                    return true;
                }
            }
        }
        false
    }
    walk(&ObjectRef::Entity(entity.clone()), candidate, except)
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

impl StateManager {
    // ========================================================================
    // Validation
    // ========================================================================

    /// Entity of `id` if its properties may be edited: not a stub, Added or Deleted.
    fn editable_entity(&self, id: EntryId, operation: &str) -> Result<EntityObject> {
        let entry = self.tracked(id)?;
        if entry.is_key_entry() {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyEntry,
                format!("cannot {} on key entry {}", operation, entry.key),
            ));
        }
        if matches!(entry.state, EntityState::Added | EntityState::Deleted) {
            return Err(Error::invalid_operation(
                InvalidOperationKind::InvalidState,
                format!("cannot {} on an entry in state {}", operation, entry.state),
            ));
        }
        self.entity_of(id)
    }

    fn top_level_ordinal(entity: &EntityObject, name: &str) -> Result<(usize, MemberMetadata)> {
        let ty = entity.entity_type();
        ty.ordinal_of(name)
            .and_then(|o| <entitystate_core::EntityType as StructuralType>::member(&ty, o).cloned().map(|m| (o, m)))
            .ok_or_else(|| {
                Error::argument(
                    "member",
                    format!("'{}' is not a mapped member of '{}'", name, ty.type_name()),
                )
            })
    }

    // ========================================================================
    // Original values and modified bits
    // ========================================================================

    /// Record `value` as the original of `slot` unless one is already
    /// recorded. Added entries keep no originals.
    pub(crate) fn record_original(&mut self, id: EntryId, slot: &MemberSlot, value: Value) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.state == EntityState::Added || entry.find_original(slot.owner.id(), slot.ordinal).is_some() {
            return;
        }
        entry.original_values.push(OriginalValue {
            member: slot.member.clone(),
            owner: slot.owner.clone(),
            ordinal: slot.ordinal,
            parent_ordinal: slot.parent_ordinal,
            value,
        });
    }

    /// Record originals for every leaf under `object` that has none, and
    /// remember its nested complex instances.
    fn record_subtree_originals(&mut self, id: EntryId, object: &ComplexObject, parent_ordinal: usize) {
        let ty = object.complex_type();
        let owner = ObjectRef::Complex(object.clone());
        for (ordinal, member) in ty.members().iter().enumerate() {
            match object.value_at(ordinal) {
                Some(MemberValue::Scalar(value)) => {
                    let slot = MemberSlot {
                        owner: owner.clone(),
                        ordinal,
                        parent_ordinal,
                        member: member.clone(),
                    };
                    self.record_original(id, &slot, value);
                }
                Some(MemberValue::Complex(Some(child))) => {
                    let known = self
                        .entries
                        .get(&id)
                        .is_some_and(|e| e.original_complex(owner.id(), ordinal).is_some());
                    if !known {
                        self.set_complex_snapshot(id, &owner, ordinal, &child);
                    }
                    self.record_subtree_originals(id, &child, parent_ordinal);
                }
                _ => {}
            }
        }
    }

    fn set_complex_snapshot(&mut self, id: EntryId, owner: &ObjectRef, ordinal: usize, object: &ComplexObject) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry
                .original_complex_objects
                .entry(owner.id())
                .or_insert_with(|| ComplexSnapshot {
                    owner: owner.clone(),
                    objects: HashMap::new(),
                })
                .objects
                .insert(ordinal, object.clone());
        }
    }

    /// Move originals and snapshots recorded against `old` (and its nested
    /// instances) onto the matching instances under `new`.
    fn rekey_complex_subtree(&mut self, id: EntryId, old: &ComplexObject, new: &ComplexObject) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let old_id = old.id();
        for original in &mut entry.original_values {
            if original.owner.id() == old_id {
                original.owner = ObjectRef::Complex(new.clone());
            }
        }
        let mut pairs = Vec::new();
        if let Some(snapshot) = entry.original_complex_objects.remove(&old_id) {
            let mut moved = ComplexSnapshot {
                owner: ObjectRef::Complex(new.clone()),
                objects: HashMap::new(),
            };
            for (ordinal, old_child) in snapshot.objects {
                if let Some(MemberValue::Complex(Some(new_child))) = new.value_at(ordinal) {
                    if !old_child.ptr_eq(&new_child) {
                        pairs.push((old_child, new_child.clone()));
                    }
                    moved.objects.insert(ordinal, new_child);
                }
            }
            entry.original_complex_objects.insert(new.id(), moved);
        }
        for (old_child, new_child) in pairs {
            self.rekey_complex_subtree(id, &old_child, &new_child);
        }
    }

    /// Set the modified bit for top-level `ordinal`, moving an Unchanged entry
    /// to Modified. Added, Deleted and stub entries are left alone.
    pub(crate) fn mark_member_modified(&mut self, id: EntryId, ordinal: usize, path: &str) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if entry.is_key_entry() || !matches!(entry.state, EntityState::Unchanged | EntityState::Modified) {
            return;
        }
        if entry.state == EntityState::Unchanged {
            self.set_entry_state(id, EntityState::Modified);
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let count = entry.field_count();
        let bits = entry.modified_fields.get_or_insert_with(|| ModifiedFields::new(count));
        if bits.get(ordinal) {
            return;
        }
        bits.set(ordinal);
        self.fire_property_changed(id, path);
    }

    /// Set every non-key bit without validation.
    pub(crate) fn mark_all_modified(&mut self, id: EntryId) -> Result<()> {
        let entity = self.entity_of(id)?;
        let ty = entity.entity_type();
        for (ordinal, member) in ty.members().iter().enumerate() {
            if member.is_key() {
                continue;
            }
            self.ensure_original_recorded(id, &entity, ordinal, member);
            self.mark_member_modified(id, ordinal, member.name());
        }
        Ok(())
    }

    /// Make sure the top-level member at `ordinal` has originals to revert to.
    fn ensure_original_recorded(
        &mut self,
        id: EntryId,
        entity: &EntityObject,
        ordinal: usize,
        member: &MemberMetadata,
    ) {
        let owner = ObjectRef::Entity(entity.clone());
        match entity.value_at(ordinal) {
            Some(MemberValue::Scalar(value)) => {
                let slot = MemberSlot {
                    owner,
                    ordinal,
                    parent_ordinal: ordinal,
                    member: member.clone(),
                };
                self.record_original(id, &slot, value);
            }
            Some(MemberValue::Complex(Some(object))) => {
                let known = self
                    .entries
                    .get(&id)
                    .is_some_and(|e| e.original_complex(owner.id(), ordinal).is_some());
                if !known {
                    self.set_complex_snapshot(id, &owner, ordinal, &object);
                }
                self.record_subtree_originals(id, &object, ordinal);
            }
            _ => {}
        }
    }

    /// Write a top-level scalar through the tracker: the previous value is
    /// kept as the original and the member is marked modified.
    pub(crate) fn write_tracked_scalar(&mut self, id: EntryId, name: &str, value: Value) -> Result<()> {
        let entity = self.entity_of(id)?;
        let (ordinal, member) = Self::top_level_ordinal(&entity, name)?;
        let current = entity.value_at(ordinal);
        if let Some(MemberValue::Scalar(old)) = &current {
            if old.is_identical(&value) {
                return Ok(());
            }
        }
        let slot = MemberSlot {
            owner: ObjectRef::Entity(entity.clone()),
            ordinal,
            parent_ordinal: ordinal,
            member,
        };
        if let Some(MemberValue::Scalar(old)) = current {
            self.record_original(id, &slot, old);
        }
        entity.set_value_at(ordinal, MemberValue::Scalar(value));
        self.mark_member_modified(id, ordinal, name);
        tracing::trace!(entry = %id, member = name, "Wrote tracked value");
        Ok(())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Capture the values detection will compare against, according to the
    /// entity's flavor, and cache its foreign keys.
    pub(crate) fn take_snapshot(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let Some(entity) = entry.entity.clone() else {
            return;
        };
        let state = entry.state;
        let flags = entry.flags;
        if state != EntityState::Added {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.original_values.clear();
                entry.original_complex_objects.clear();
            }
            if flags.requires_complex_change_tracking {
                let owner = ObjectRef::Entity(entity.clone());
                let ty = entity.entity_type();
                for (ordinal, member) in ty.members().iter().enumerate() {
                    match entity.value_at(ordinal) {
                        Some(MemberValue::Scalar(value)) if flags.requires_scalar_change_tracking => {
                            let slot = MemberSlot {
                                owner: owner.clone(),
                                ordinal,
                                parent_ordinal: ordinal,
                                member: member.clone(),
                            };
                            self.record_original(id, &slot, value);
                        }
                        Some(MemberValue::Complex(Some(object))) => {
                            self.set_complex_snapshot(id, &owner, ordinal, &object);
                            self.record_subtree_originals(id, &object, ordinal);
                        }
                        _ => {}
                    }
                }
            }
        }
        self.take_snapshot_of_foreign_keys(id);
        tracing::trace!(entry = %id, state = %state, "Took snapshot");
    }

    /// Cache the current foreign key of every dependent association, unless
    /// the cached key is a conceptual null.
    pub(crate) fn take_snapshot_of_foreign_keys(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let Some(entity) = entry.entity.clone() else {
            return;
        };
        let set_name = entry.entity_set.name().to_string();
        for association in self.workspace.foreign_key_dependent_ends(&set_name) {
            let held_null = self
                .entries
                .get(&id)
                .and_then(|e| e.foreign_keys.get(&association.name))
                .is_some_and(|k| k.is_conceptual_null());
            if held_null {
                continue;
            }
            let fk = self.foreign_key_for(&entity, &association).ok().flatten();
            if let Some(entry) = self.entries.get_mut(&id) {
                match fk {
                    Some(fk) => {
                        entry.foreign_keys.insert(association.name.clone(), fk);
                    }
                    None => {
                        entry.foreign_keys.remove(&association.name);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Detection
    // ========================================================================

    /// Compare `id`'s live values against its originals.
    ///
    /// Returns the dotted paths that differ. With `mark`, differing members
    /// are marked modified (Deleted entries never are). With `only_complex`,
    /// top-level scalars are skipped. A differing key member is an error.
    pub(crate) fn detect_changes_in_properties(
        &mut self,
        id: EntryId,
        only_complex: bool,
        mark: bool,
    ) -> Result<Vec<String>> {
        let entry = self.tracked(id)?;
        let Some(entity) = entry.entity.clone() else {
            return Ok(Vec::new());
        };
        if entry.state == EntityState::Added {
            return Ok(Vec::new());
        }
        let flags = entry.flags;
        let scalars = !only_complex && flags.requires_scalar_change_tracking;
        if !scalars && !flags.requires_complex_change_tracking {
            return Ok(Vec::new());
        }
        let mark = mark && entry.state != EntityState::Deleted;
        let mut changed = Vec::new();
        self.detect_in_owner(
            id,
            &entity,
            &ObjectRef::Entity(entity.clone()),
            None,
            "",
            scalars,
            mark,
            &mut changed,
        )?;
        Ok(changed)
    }

    /// Refresh complex snapshots: detect complex swaps and nested changes only.
    pub(crate) fn detect_changes_in_complex_properties(&mut self, id: EntryId) -> Result<Vec<String>> {
        self.detect_changes_in_properties(id, true, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn detect_in_owner(
        &mut self,
        id: EntryId,
        entity: &EntityObject,
        owner: &ObjectRef,
        parent: Option<usize>,
        prefix: &str,
        top_scalars: bool,
        mark: bool,
        changed: &mut Vec<String>,
    ) -> Result<()> {
        let ty = owner.structural_type();
        let complex_tracked = self
            .entries
            .get(&id)
            .is_some_and(|e| e.flags.requires_complex_change_tracking);
        for (ordinal, member) in ty.members().iter().enumerate() {
            let top = parent.unwrap_or(ordinal);
            let path = join_path(prefix, member.name());
            match owner.value_at(ordinal) {
                Some(MemberValue::Complex(None)) => {
                    return Err(Error::invalid_operation(
                        InvalidOperationKind::NullComplexProperty,
                        format!("complex member '{}' of {} is null", path, id),
                    ));
                }
                Some(MemberValue::Complex(Some(current))) => {
                    if !complex_tracked {
                        continue;
                    }
                    let snapshot = self
                        .entries
                        .get(&id)
                        .and_then(|e| e.original_complex(owner.id(), ordinal).cloned());
                    match snapshot {
                        Some(original) if original.ptr_eq(&current) => {}
                        snapshot => {
                            if complex_used_elsewhere(entity, &current, (owner.id(), ordinal)) {
                                return Err(Error::invalid_operation(
                                    InvalidOperationKind::DuplicateComplexObject,
                                    format!(
                                        "the complex object assigned to '{}' of {} is already used by another member",
                                        path, id
                                    ),
                                ));
                            }
                            let slot = MemberSlot {
                                owner: owner.clone(),
                                ordinal,
                                parent_ordinal: top,
                                member: member.clone(),
                            };
                            self.replace_complex_snapshot(id, &slot, snapshot.as_ref(), &current, &path, mark);
                            tracing::trace!(entry = %id, path = %path, "Detected complex object swap");
                            changed.push(path.clone());
                        }
                    }
                    self.detect_in_owner(
                        id,
                        entity,
                        &ObjectRef::Complex(current),
                        Some(top),
                        &path,
                        top_scalars,
                        mark,
                        changed,
                    )?;
                }
                Some(MemberValue::Scalar(current)) => {
                    if parent.is_none() && !top_scalars {
                        continue;
                    }
                    let original = self.entries.get(&id).and_then(|e| {
                        e.find_original(owner.id(), ordinal)
                            .map(|i| e.original_values[i].value.clone())
                    });
                    let Some(original) = original else {
                        continue;
                    };
                    if member.is_key() && parent.is_none() {
                        if !original.is_identical(&current) {
                            return Err(Error::invalid_operation(
                                InvalidOperationKind::KeyModified,
                                format!("key member '{}' of {} was changed", path, id),
                            ));
                        }
                        continue;
                    }
                    if !original.is_equivalent(&current) {
                        tracing::trace!(entry = %id, path = %path, "Detected property change");
                        if mark {
                            self.mark_member_modified(id, top, &path);
                        }
                        changed.push(path);
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// A complex slot now holds `current` instead of `original`: keep the
    /// old subtree's values as originals, move them onto the new instance
    /// and point the snapshot at it.
    fn replace_complex_snapshot(
        &mut self,
        id: EntryId,
        slot: &MemberSlot,
        original: Option<&ComplexObject>,
        current: &ComplexObject,
        path: &str,
        mark: bool,
    ) {
        if self.state_of(id) == EntityState::Added {
            self.set_complex_snapshot(id, &slot.owner, slot.ordinal, current);
            return;
        }
        if let Some(original) = original {
            self.record_subtree_originals(id, original, slot.parent_ordinal);
            self.rekey_complex_subtree(id, original, current);
        }
        self.set_complex_snapshot(id, &slot.owner, slot.ordinal, current);
        if mark {
            self.mark_member_modified(id, slot.parent_ordinal, path);
        }
    }

    // ========================================================================
    // Modified properties
    // ========================================================================

    /// Mark the top-level member `name` modified.
    ///
    /// Fails on key stubs, Added and Deleted entries, unmapped names and key
    /// members. An Unchanged entry becomes Modified.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_modified_property(&mut self, id: EntryId, name: &str) -> Result<()> {
        let entity = self.editable_entity(id, "set a modified property")?;
        let (ordinal, member) = Self::top_level_ordinal(&entity, name)?;
        if member.is_key() {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyModified,
                format!("key member '{}' cannot be marked modified", name),
            ));
        }
        self.ensure_original_recorded(id, &entity, ordinal, &member);
        self.mark_member_modified(id, ordinal, name);
        Ok(())
    }

    /// Mark every non-key member modified.
    pub fn set_modified_all(&mut self, id: EntryId) -> Result<()> {
        self.editable_entity(id, "set modified properties")?;
        self.mark_all_modified(id)
    }

    /// Undo the change to top-level member `name`.
    ///
    /// A no-op on Unchanged entries. On a Modified entry the live value is
    /// restored from the original and the bit cleared; with no bits left the
    /// entry returns to Unchanged.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reject_property_changes(&mut self, id: EntryId, name: &str) -> Result<()> {
        let entity = self.editable_entity(id, "reject property changes")?;
        let (ordinal, member) = Self::top_level_ordinal(&entity, name)?;
        if self.state_of(id) != EntityState::Modified {
            return Ok(());
        }
        self.detect_changes_in_complex_properties(id)?;
        let Some(bits) = self.entries.get(&id).and_then(|e| e.modified_fields.as_ref()) else {
            return Ok(());
        };
        if !bits.get(ordinal) {
            return Ok(());
        }
        let last_bit = bits.iter().all(|o| o == ordinal);
        if last_bit && self.has_conceptual_null(id) {
            return Err(Error::invalid_operation(
                InvalidOperationKind::ConceptualNull,
                format!(
                    "cannot reject '{}' on {}: a required relationship still has a nulled foreign key",
                    name, id
                ),
            ));
        }
        self.restore_member(id, &entity, ordinal, &member)?;
        let remaining = self
            .entries
            .get_mut(&id)
            .and_then(|e| e.modified_fields.as_mut())
            .map_or(false, |bits| {
                bits.clear(ordinal);
                bits.any()
            });
        if !remaining {
            self.accept_changes(id)?;
        }
        Ok(())
    }

    /// Copy the original value(s) of top-level member `ordinal` back into
    /// the live entity.
    fn restore_member(
        &mut self,
        id: EntryId,
        entity: &EntityObject,
        ordinal: usize,
        member: &MemberMetadata,
    ) -> Result<()> {
        let Some(entry) = self.entries.get(&id) else {
            return Ok(());
        };
        if member.is_complex() {
            let restores: Vec<(ObjectRef, usize, Value)> = entry
                .original_values
                .iter()
                .filter(|o| o.parent_ordinal == ordinal && !matches!(o.owner, ObjectRef::Entity(_)))
                .map(|o| (o.owner.clone(), o.ordinal, o.value.clone()))
                .collect();
            for (owner, slot, value) in restores {
                owner.set_value_at(slot, MemberValue::Scalar(value));
            }
        } else if let Some(i) = entry.find_original(entity.id(), ordinal) {
            let value = entry.original_values[i].value.clone();
            entity.set_value_at(ordinal, MemberValue::Scalar(value));
            self.fixup_foreign_key_member_changed(id, member.name())?;
        }
        Ok(())
    }

    /// Names of the members set in a Modified entry's bitmap.
    pub fn modified_properties(&self, id: EntryId) -> Result<Vec<String>> {
        let entry = self.tracked(id)?;
        if entry.state != EntityState::Modified {
            return Ok(Vec::new());
        }
        Ok(self.modified_names(entry))
    }

    /// Whether top-level member `name` is modified or differs from its original.
    pub fn is_property_changed(&mut self, id: EntryId, name: &str) -> Result<bool> {
        let entry = self.tracked(id)?;
        let Some(entity) = entry.entity.clone() else {
            return Ok(false);
        };
        let (ordinal, _) = Self::top_level_ordinal(&entity, name)?;
        if !matches!(entry.state, EntityState::Modified | EntityState::Unchanged) {
            return Ok(false);
        }
        if entry.modified_fields.as_ref().is_some_and(|bits| bits.get(ordinal)) {
            return Ok(true);
        }
        let changed = self.detect_changes_in_properties(id, false, false)?;
        Ok(changed
            .iter()
            .any(|p| p == name || p.starts_with(&format!("{}.", name))))
    }

    // ========================================================================
    // Values by path
    // ========================================================================

    /// Live value at `path`. Not available for Deleted entries.
    pub fn current_value(&self, id: EntryId, path: &str) -> Result<Value> {
        let entry = self.tracked(id)?;
        if entry.state == EntityState::Deleted {
            return Err(Error::invalid_operation(
                InvalidOperationKind::InvalidState,
                "current values are not available for a deleted entry",
            ));
        }
        let entity = self.entity_of(id)?;
        let slot = resolve_path(&entity, path)?;
        match slot.owner.value_at(slot.ordinal) {
            Some(MemberValue::Scalar(v)) => Ok(v),
            _ => Err(Error::argument("path", format!("'{}' is not a scalar member", path))),
        }
    }

    /// Original value at `path`: the recorded original, or the live value
    /// if the member never diverged. Not available for Added entries.
    pub fn original_value(&self, id: EntryId, path: &str) -> Result<Value> {
        let entry = self.tracked(id)?;
        if entry.state == EntityState::Added {
            return Err(Error::invalid_operation(
                InvalidOperationKind::InvalidState,
                "original values are not available for an added entry",
            ));
        }
        let entity = self.entity_of(id)?;
        let slot = Self::original_slot(&entity, path)?;
        if let Some(i) = entry.find_original(slot.owner.id(), slot.ordinal) {
            return Ok(entry.original_values[i].value.clone());
        }
        match slot.owner.value_at(slot.ordinal) {
            Some(MemberValue::Scalar(v)) => Ok(v),
            _ => Err(Error::argument("path", format!("'{}' is not a scalar member", path))),
        }
    }

    /// Resolve `path` to a scalar slot. Originals of swapped complex objects
    /// are re-keyed onto the live instance, so the live chain is also the
    /// chain originals are recorded against.
    fn original_slot(entity: &EntityObject, path: &str) -> Result<MemberSlot> {
        let slot = resolve_path(entity, path)?;
        if slot.member.is_complex() {
            return Err(Error::argument("path", format!("'{}' is not a scalar member", path)));
        }
        Ok(slot)
    }

    /// Assign the live value at `path` through the tracker.
    ///
    /// The previous value becomes the original, the member is marked
    /// modified and a changed foreign key is fixed up.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub fn set_current_value(&mut self, id: EntryId, path: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let entry = self.tracked(id)?;
        if entry.is_key_entry() {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyEntry,
                format!("cannot set values on key entry {}", entry.key),
            ));
        }
        if entry.state == EntityState::Deleted {
            return Err(Error::invalid_operation(
                InvalidOperationKind::InvalidState,
                "cannot set values on a deleted entry",
            ));
        }
        let state = entry.state;
        let entity = self.entity_of(id)?;
        let slot = resolve_path(&entity, path)?;
        let Some(MemberValue::Scalar(current)) = slot.owner.value_at(slot.ordinal) else {
            return Err(Error::argument("path", format!("'{}' is not a scalar member", path)));
        };
        if slot.member.is_key() && state != EntityState::Added && !current.is_identical(&value) {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyModified,
                format!("key member '{}' of {} cannot be changed", path, id),
            ));
        }
        let unchanged = if slot.member.is_key() {
            current.is_identical(&value)
        } else {
            current.is_equivalent(&value)
        };
        if unchanged {
            return Ok(());
        }
        self.record_original(id, &slot, current);
        slot.owner.set_value_at(slot.ordinal, MemberValue::Scalar(value));
        self.mark_member_modified(id, slot.parent_ordinal, path);
        if matches!(slot.owner, ObjectRef::Entity(_)) {
            self.fixup_foreign_key_member_changed(id, slot.member.name())?;
        }
        Ok(())
    }

    /// Overwrite the original value at `path` and mark the member modified.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub fn set_original_value(&mut self, id: EntryId, path: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let entity = self.editable_entity(id, "set original values")?;
        let slot = resolve_path(&entity, path)?;
        let Some(MemberValue::Scalar(current)) = slot.owner.value_at(slot.ordinal) else {
            return Err(Error::argument("path", format!("'{}' is not a scalar member", path)));
        };
        if slot.member.is_key() {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyModified,
                format!("the original value of key member '{}' cannot be changed", path),
            ));
        }
        self.record_original(id, &slot, current);
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(i) = entry.find_original(slot.owner.id(), slot.ordinal) {
                entry.original_values[i].value = value;
            }
        }
        self.mark_member_modified(id, slot.parent_ordinal, path);
        Ok(())
    }

    // ========================================================================
    // Change notifications
    // ========================================================================

    /// A tracked entity is about to change the member at `path`.
    ///
    /// Must be paired with [`entity_member_changed`](Self::entity_member_changed)
    /// for the same path before any other member notification.
    pub fn entity_member_changing(&mut self, id: EntryId, path: &str) -> Result<()> {
        let entry = self.tracked(id)?;
        if entry.is_key_entry() {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyEntry,
                format!("key entry {} cannot report changes", entry.key),
            ));
        }
        if entry.state == EntityState::Deleted {
            return Err(Error::invalid_operation(
                InvalidOperationKind::InvalidState,
                format!("{} is deleted and cannot be changed", entry.key),
            ));
        }
        if let Some(pending) = &entry.pending_change {
            return Err(Error::invalid_operation(
                InvalidOperationKind::ChangeNotificationMismatch,
                format!(
                    "'{}' is changing while '{}' has not reported its change",
                    path, pending.path
                ),
            ));
        }
        let entity = self.entity_of(id)?;
        let slot = resolve_path(&entity, path)?;
        let old_value = slot
            .owner
            .value_at(slot.ordinal)
            .unwrap_or(MemberValue::Scalar(Value::Null));
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.pending_change = Some(PendingChange {
                path: path.to_string(),
                owner: slot.owner,
                ordinal: slot.ordinal,
                parent_ordinal: slot.parent_ordinal,
                old_value,
            });
        }
        tracing::trace!(entry = %id, path, "Member changing");
        Ok(())
    }

    /// A tracked entity changed the member at `path`.
    pub fn entity_member_changed(&mut self, id: EntryId, path: &str) -> Result<()> {
        let entry = self.tracked_mut(id)?;
        let pending = match entry.pending_change.take() {
            Some(p) if p.path == path => p,
            other => {
                let expected = other.as_ref().map(|p| p.path.clone());
                entry.pending_change = other;
                return Err(Error::invalid_operation(
                    InvalidOperationKind::ChangeNotificationMismatch,
                    match expected {
                        Some(expected) => format!("'{}' changed but '{}' was changing", path, expected),
                        None => format!("'{}' changed without a changing notification", path),
                    },
                ));
            }
        };
        let state = entry.state;
        let entity = self.entity_of(id)?;
        let ty = pending.owner.structural_type();
        let Some(member) = ty.member(pending.ordinal).cloned() else {
            return Ok(());
        };
        let new_value = pending
            .owner
            .value_at(pending.ordinal)
            .unwrap_or(MemberValue::Scalar(Value::Null));
        let slot = MemberSlot {
            owner: pending.owner.clone(),
            ordinal: pending.ordinal,
            parent_ordinal: pending.parent_ordinal,
            member: member.clone(),
        };
        tracing::trace!(entry = %id, path, "Member changed");

        match (&pending.old_value, &new_value) {
            (MemberValue::Scalar(old), MemberValue::Scalar(new)) => {
                if member.is_key() && state != EntityState::Added && !old.is_identical(new) {
                    return Err(Error::invalid_operation(
                        InvalidOperationKind::KeyModified,
                        format!("key member '{}' of {} was changed", path, id),
                    ));
                }
                if state == EntityState::Added {
                    if matches!(pending.owner, ObjectRef::Entity(_)) {
                        self.fixup_foreign_key_member_changed(id, member.name())?;
                    }
                    return Ok(());
                }
                self.record_original(id, &slot, old.clone());
                self.mark_member_modified(id, pending.parent_ordinal, path);
                if matches!(pending.owner, ObjectRef::Entity(_)) {
                    self.fixup_foreign_key_member_changed(id, member.name())?;
                }
            }
            (MemberValue::Complex(old), MemberValue::Complex(new)) => {
                let Some(new) = new else {
                    return Err(Error::invalid_operation(
                        InvalidOperationKind::NullComplexProperty,
                        format!("complex member '{}' of {} was set to null", path, id),
                    ));
                };
                if complex_used_elsewhere(&entity, new, (pending.owner.id(), pending.ordinal)) {
                    return Err(Error::invalid_operation(
                        InvalidOperationKind::DuplicateComplexObject,
                        format!(
                            "the complex object assigned to '{}' of {} is already used by another member",
                            path, id
                        ),
                    ));
                }
                let original = self
                    .entries
                    .get(&id)
                    .and_then(|e| e.original_complex(pending.owner.id(), pending.ordinal).cloned())
                    .or_else(|| old.clone());
                self.replace_complex_snapshot(id, &slot, original.as_ref(), new, path, true);
            }
            _ => {}
        }
        Ok(())
    }

    /// Changing notification for `member` of the complex object at `complex_path`.
    pub fn entity_complex_member_changing(
        &mut self,
        id: EntryId,
        complex_path: &str,
        member: &str,
    ) -> Result<()> {
        self.entity_member_changing(id, &join_path(complex_path, member))
    }

    /// Changed notification for `member` of the complex object at `complex_path`.
    pub fn entity_complex_member_changed(
        &mut self,
        id: EntryId,
        complex_path: &str,
        member: &str,
    ) -> Result<()> {
        self.entity_member_changed(id, &join_path(complex_path, member))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::entity::EntityFlavor;
    use crate::test_support::{address, customer, line, order, order_customer_workspace};

    #[test]
    fn test_resolve_nested_path() {
        let ws = order_customer_workspace();
        let c = customer(&ws, 1, "Ada");
        let slot = resolve_path(&c, "Address.Geo.Lat").unwrap();
        assert_eq!(slot.member.name(), "Lat");
        assert_eq!(slot.parent_ordinal, 2);
        assert!(resolve_path(&c, "Address.Nope").unwrap_err().is_argument());
        assert!(resolve_path(&c, "Name.X").unwrap_err().is_argument());
        c.set_complex("Address", None).unwrap();
        let err = resolve_path(&c, "Address.City").unwrap_err();
        assert_eq!(
            err.invalid_operation_kind(),
            Some(InvalidOperationKind::NullComplexProperty)
        );
    }

    #[test]
    fn test_set_modified_property_moves_to_modified() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        sm.set_modified_property(id, "Name").unwrap();
        assert_eq!(sm.state_of(id), EntityState::Modified);
        assert_eq!(sm.modified_properties(id).unwrap(), vec!["Name"]);
        let err = sm.set_modified_property(id, "Id").unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::KeyModified));
        assert!(sm.set_modified_property(id, "Nope").unwrap_err().is_argument());
    }

    #[test]
    fn test_detects_plain_scalar_change() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        c.set("Name", "Grace").unwrap();
        let changed = sm.detect_changes_in_properties(id, false, true).unwrap();
        assert_eq!(changed, vec!["Name"]);
        assert_eq!(sm.state_of(id), EntityState::Modified);
        assert_eq!(sm.original_value(id, "Name").unwrap(), Value::from("Ada"));
        assert_eq!(sm.current_value(id, "Name").unwrap(), Value::from("Grace"));
    }

    #[test]
    fn test_changed_key_is_rejected() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        c.set("Id", 2_i64).unwrap();
        let err = sm.detect_changes_in_properties(id, false, true).unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::KeyModified));
    }

    #[test]
    fn test_complex_swap_rekeys_originals() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        c.set_complex("Address", Some(address("Oslo"))).unwrap();
        let id = sm.attach("Customers", &c).unwrap();
        let replacement = address("Bergen");
        c.set_complex("Address", Some(replacement.clone())).unwrap();
        let changed = sm.detect_changes_in_properties(id, false, true).unwrap();
        assert_eq!(changed, vec!["Address", "Address.City"]);
        let entry = sm.entry(id).unwrap();
        let owner = c.id();
        assert!(entry.original_complex(owner, 2).is_some_and(|o| o.ptr_eq(&replacement)));
        assert_eq!(sm.original_value(id, "Address.City").unwrap(), Value::from("Oslo"));
    }

    #[test]
    fn test_reject_restores_and_returns_unchanged() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        sm.set_current_value(id, "Name", "Grace").unwrap();
        assert_eq!(sm.state_of(id), EntityState::Modified);
        sm.reject_property_changes(id, "Name").unwrap();
        assert_eq!(c.scalar("Name"), Some(Value::from("Ada")));
        assert_eq!(sm.state_of(id), EntityState::Unchanged);
        assert!(sm.entry(id).unwrap().modified_fields().is_none());
    }

    #[test]
    fn test_reject_complex_restores_leaves() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        c.set_complex("Address", Some(address("Oslo"))).unwrap();
        let id = sm.attach("Customers", &c).unwrap();
        sm.set_current_value(id, "Address.City", "Bergen").unwrap();
        sm.reject_property_changes(id, "Address").unwrap();
        assert_eq!(
            c.complex("Address").unwrap().scalar("City"),
            Some(Value::from("Oslo"))
        );
        assert_eq!(sm.state_of(id), EntityState::Unchanged);
    }

    #[test]
    fn test_self_tracking_notifications() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada").with_flavor(EntityFlavor::SelfTracking);
        let id = sm.attach("Customers", &c).unwrap();
        assert_eq!(sm.entry(id).unwrap().original_value_count(), 0);

        sm.entity_member_changing(id, "Name").unwrap();
        c.set("Name", "Grace").unwrap();
        sm.entity_member_changed(id, "Name").unwrap();
        assert_eq!(sm.modified_properties(id).unwrap(), vec!["Name"]);
        assert_eq!(sm.original_value(id, "Name").unwrap(), Value::from("Ada"));

        sm.entity_complex_member_changing(id, "Address", "City").unwrap();
        c.complex("Address").unwrap().set("City", "Oslo").unwrap();
        sm.entity_complex_member_changed(id, "Address", "City").unwrap();
        assert_eq!(sm.modified_properties(id).unwrap(), vec!["Name", "Address"]);
    }

    #[test]
    fn test_notification_pairing_is_enforced() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada").with_flavor(EntityFlavor::SelfTracking);
        let id = sm.attach("Customers", &c).unwrap();
        let err = sm.entity_member_changed(id, "Name").unwrap_err();
        assert_eq!(
            err.invalid_operation_kind(),
            Some(InvalidOperationKind::ChangeNotificationMismatch)
        );
        sm.entity_member_changing(id, "Name").unwrap();
        assert!(sm.entity_member_changing(id, "Address").is_err());
        assert!(sm.entity_member_changed(id, "Address").is_err());
        sm.entity_member_changed(id, "Name").unwrap();
    }

    #[test]
    fn test_null_complex_notification_rejected() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada").with_flavor(EntityFlavor::SelfTracking);
        let id = sm.attach("Customers", &c).unwrap();
        sm.entity_member_changing(id, "Address").unwrap();
        c.set_complex("Address", None).unwrap();
        let err = sm.entity_member_changed(id, "Address").unwrap_err();
        assert_eq!(
            err.invalid_operation_kind(),
            Some(InvalidOperationKind::NullComplexProperty)
        );
    }

    #[test]
    fn test_set_original_value_marks_modified() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        sm.set_original_value(id, "Name", "Old").unwrap();
        assert_eq!(sm.original_value(id, "Name").unwrap(), Value::from("Old"));
        assert_eq!(sm.state_of(id), EntityState::Modified);
        assert!(sm.is_property_changed(id, "Name").unwrap());
        assert!(!sm.is_property_changed(id, "Address").unwrap());
    }

    #[test]
    fn test_reject_last_change_fails_on_conceptual_null_without_mutating() {
        let ws = order_customer_workspace();
        let config = crate::StateManagerConfig::new().cascade_deletes(false);
        let mut sm = StateManager::with_config(Arc::clone(&ws), config);
        let order_id = sm.attach("Orders", &order(&ws, 10, None)).unwrap();
        let l = line(&ws, 100, 10);
        let line_id = sm.attach("Lines", &l).unwrap();
        sm.delete_object(order_id).unwrap();
        assert!(sm.has_conceptual_null(line_id));
        assert_eq!(sm.modified_properties(line_id).unwrap(), vec!["OrderId".to_string()]);

        let err = sm.reject_property_changes(line_id, "OrderId").unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::ConceptualNull));
        assert_eq!(sm.state_of(line_id), EntityState::Modified);
        assert_eq!(sm.modified_properties(line_id).unwrap(), vec!["OrderId".to_string()]);
        assert!(sm.has_conceptual_null(line_id));

        // Rejecting a member that is not the last change still works.
        sm.set_current_value(line_id, "Qty", 5_i64).unwrap();
        sm.reject_property_changes(line_id, "Qty").unwrap();
        assert_eq!(sm.current_value(line_id, "Qty").unwrap(), Value::BigInt(1));
        assert_eq!(sm.modified_properties(line_id).unwrap(), vec!["OrderId".to_string()]);
    }
}
