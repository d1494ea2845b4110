//! Foreign key fix-up.
//!
//! In a foreign key association the dependent entity carries the principal's
//! key in its own scalar members. Fix-up keeps three things in agreement:
//! those values, the relationship entry linking the two entries, and the
//! navigation values on both entities.
//!
//! Each dependent entry caches the foreign key it was last fixed up with,
//! per association. A dependent whose foreign key names a principal that is
//! not tracked is parked in the dangling index under that key; tracking the
//! principal later finds and relates it.
//!
//! A foreign key that must be null but whose members are not nullable is
//! recorded as a *conceptual null*: the member values are left alone, the
//! cached key becomes a conceptual-null key and the entry is remembered.
//! Committing such an entry fails until the user assigns a real value or
//! deletes it.

use std::sync::Arc;

use entitystate_core::{
    AssociationSet, Error, InvalidOperationKind, Result, StructuralType, Value,
};

use crate::entity::EntityObject;
use crate::entity_key::{EntityKey, EntityKeyMember};
use crate::entry::{EntityState, EntryId};
use crate::relationship::RelationshipId;
use crate::state_manager::StateManager;
use crate::transaction::Scope;

impl StateManager {
    // ========================================================================
    // Foreign key values
    // ========================================================================

    /// Foreign key members of `entity` for `association`, named after the
    /// principal's key members, in principal key order. Values may be NULL.
    pub(crate) fn foreign_key_members(
        &self,
        entity: &EntityObject,
        association: &AssociationSet,
    ) -> Result<Vec<EntityKeyMember>> {
        let Some(constraint) = association.constraint.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(principal) = association.principal_index() else {
            return Ok(Vec::new());
        };
        let principal_set = self.entity_set_named(&association.end(principal).entity_set)?;
        let mut members = Vec::with_capacity(constraint.principal_properties.len());
        for name in principal_set.element_type().key_member_names() {
            let Some(i) = constraint.principal_properties.iter().position(|p| p == name) else {
                continue;
            };
            let value = entity
                .scalar(&constraint.dependent_properties[i])
                .unwrap_or(Value::Null);
            members.push(EntityKeyMember::new(name, value));
        }
        Ok(members)
    }

    /// Key of the principal named by `entity`'s foreign key values, or `None`
    /// if any of them is NULL.
    pub(crate) fn foreign_key_for(
        &self,
        entity: &EntityObject,
        association: &AssociationSet,
    ) -> Result<Option<EntityKey>> {
        let members = self.foreign_key_members(entity, association)?;
        if members.is_empty() || members.iter().any(|m| m.value.is_null()) {
            return Ok(None);
        }
        let Some(principal) = association.principal_index() else {
            return Ok(None);
        };
        EntityKey::new(&association.end(principal).entity_set, members).map(Some)
    }

    /// Current key values of a principal entry: the key of a stub, or the
    /// entity's key members (which may differ from a temporary entry key).
    pub(crate) fn principal_key_values(&self, principal: EntryId) -> Option<Vec<EntityKeyMember>> {
        let entry = self.entries.get(&principal)?;
        match &entry.entity {
            None => Some(entry.key.members().to_vec()),
            Some(entity) => Some(
                entry
                    .entity_set
                    .element_type()
                    .key_member_names()
                    .into_iter()
                    .map(|name| {
                        EntityKeyMember::new(name, entity.scalar(name).unwrap_or(Value::Null))
                    })
                    .collect(),
            ),
        }
    }

    /// Whether `principal` is the entity `key` names, by entry key or by
    /// current key values.
    pub(crate) fn principal_matches_key(&self, principal: EntryId, key: &EntityKey) -> bool {
        let Some(entry) = self.entries.get(&principal) else {
            return false;
        };
        if entry.key == *key {
            return true;
        }
        self.principal_key_values(principal).is_some_and(|values| {
            values.len() == key.members().len()
                && values
                    .iter()
                    .zip(key.members())
                    .all(|(a, b)| a.name == b.name && a.value.is_identical(&b.value))
        })
    }

    /// Copy the principal's current key values into `dependent`'s foreign
    /// key members. Only members whose value differs are written.
    pub(crate) fn write_foreign_key(
        &mut self,
        dependent: EntryId,
        association: &AssociationSet,
        principal_values: &[EntityKeyMember],
    ) -> Result<()> {
        let Some(constraint) = association.constraint.clone() else {
            return Ok(());
        };
        let entity = self.entity_of(dependent)?;
        let _scope = self.transaction.enter(Scope::ForeignKeyUpdate);
        for (principal_prop, dependent_prop) in constraint
            .principal_properties
            .iter()
            .zip(&constraint.dependent_properties)
        {
            let Some(value) = principal_values
                .iter()
                .find(|m| &m.name == principal_prop)
                .map(|m| m.value.clone())
            else {
                continue;
            };
            let current = entity.scalar(dependent_prop).unwrap_or(Value::Null);
            if !current.is_identical(&value) {
                self.write_tracked_scalar(dependent, dependent_prop, value)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Dangling index and conceptual nulls
    // ========================================================================

    pub(crate) fn add_to_dangling_index(&mut self, key: EntityKey, dependent: EntryId) {
        tracing::trace!(entry = %dependent, principal = %key, "Parked dangling foreign key");
        self.dangling_foreign_keys
            .entry(key)
            .or_default()
            .insert(dependent);
    }

    pub(crate) fn remove_from_dangling_index(&mut self, dependent: EntryId) {
        self.dangling_foreign_keys.retain(|_, deps| {
            deps.remove(&dependent);
            !deps.is_empty()
        });
    }

    pub(crate) fn remove_dangling(&mut self, key: &EntityKey, dependent: EntryId) {
        if let Some(deps) = self.dangling_foreign_keys.get_mut(key) {
            deps.remove(&dependent);
            if deps.is_empty() {
                self.dangling_foreign_keys.remove(key);
            }
        }
    }

    /// Entries whose foreign key names `key` but which are not related to it.
    pub fn dangling_dependents(&self, key: &EntityKey) -> Vec<EntryId> {
        self.dangling_foreign_keys
            .get(key)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `id` holds a conceptual-null foreign key.
    pub fn has_conceptual_null(&self, id: EntryId) -> bool {
        self.conceptual_nulls.contains(&id)
    }

    /// Drop `id` from the conceptual-null set once none of its cached keys is
    /// a conceptual null. With `reset_all`, the cached conceptual nulls are
    /// discarded first.
    pub(crate) fn forget_conceptual_null(&mut self, id: EntryId, reset_all: bool) {
        let still_null = match self.entries.get_mut(&id) {
            Some(entry) => {
                if reset_all {
                    entry.foreign_keys.retain(|_, k| !k.is_conceptual_null());
                }
                entry.foreign_keys.values().any(EntityKey::is_conceptual_null)
            }
            None => false,
        };
        if !still_null && self.conceptual_nulls.remove(&id) {
            tracing::debug!(entry = %id, "Forgot conceptual null");
        }
    }

    /// Replace the cached key `id` holds for `association`, unparking `id`
    /// from the dangling bucket of the key it replaces.
    pub(crate) fn cache_foreign_key(&mut self, id: EntryId, association: &str, key: Option<EntityKey>) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let old = match key {
            Some(key) => entry.foreign_keys.insert(association.to_string(), key),
            None => entry.foreign_keys.remove(association),
        };
        if let Some(old) = old {
            self.remove_dangling(&old, id);
        }
    }

    // ========================================================================
    // Fix-up by foreign key
    // ========================================================================

    /// The live relationship relating dependent `id` to its principal in
    /// `association`, and the principal entry.
    pub(crate) fn principal_of(
        &self,
        id: EntryId,
        association: &AssociationSet,
    ) -> Option<(RelationshipId, EntryId)> {
        let dependent = association.dependent_index()?;
        self.live_relationships_at(id, &association.name, dependent)
            .into_iter()
            .next()
    }

    /// Relate `id` to every principal its foreign keys name, or park it in
    /// the dangling index; then relate dependents already waiting for `id`.
    pub(crate) fn fixup_references_by_foreign_keys(&mut self, id: EntryId, replace: bool) -> Result<()> {
        let entry = self.tracked(id)?;
        if entry.is_key_entry() {
            return Ok(());
        }
        let set_name = entry.entity_set.name().to_string();
        let key = entry.key.clone();
        let set_is_loaded = !(self.transaction.is_active(Scope::Adding)
            || self.transaction.is_active(Scope::Attaching));

        for association in self.workspace.foreign_key_dependent_ends(&set_name) {
            let cached_null = self
                .entries
                .get(&id)
                .and_then(|e| e.foreign_keys.get(&association.name))
                .is_some_and(EntityKey::is_conceptual_null);
            if cached_null {
                continue;
            }
            let entity = self.entity_of(id)?;
            let fk = self.foreign_key_for(&entity, &association)?;
            self.fixup_entity_reference_to_principal(id, &association, fk, set_is_loaded, replace)?;
        }

        if key.is_permanent() {
            if let Some(waiting) = self.dangling_foreign_keys.remove(&key) {
                for dependent in waiting {
                    if !self.entries.contains_key(&dependent) || dependent == id {
                        continue;
                    }
                    let dep_set = self.tracked(dependent)?.entity_set.name().to_string();
                    for association in self.workspace.foreign_key_dependent_ends(&dep_set) {
                        let principal_set = association
                            .principal_index()
                            .map(|p| association.end(p).entity_set.clone());
                        if principal_set.as_deref() != Some(set_name.as_str()) {
                            continue;
                        }
                        let entity = self.entity_of(dependent)?;
                        let fk = self.foreign_key_for(&entity, &association)?;
                        self.fixup_entity_reference_to_principal(
                            dependent,
                            &association,
                            fk,
                            set_is_loaded,
                            false,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Point dependent `id`'s reference in `association` at the principal
    /// named by `foreign_key`.
    ///
    /// The foreign key is cached on the entry. An untracked, stub or Deleted
    /// principal parks the dependent in the dangling index instead. An
    /// existing reference is only replaced with `replace`, or when the swap
    /// cannot steal a one-to-one reference from another dependent.
    #[tracing::instrument(level = "trace", skip(self, association), fields(association = %association.name))]
    pub(crate) fn fixup_entity_reference_to_principal(
        &mut self,
        id: EntryId,
        association: &Arc<AssociationSet>,
        foreign_key: Option<EntityKey>,
        set_is_loaded: bool,
        replace: bool,
    ) -> Result<()> {
        let Some(dependent_index) = association.dependent_index() else {
            return Ok(());
        };
        let existing = self.principal_of(id, association);
        let can_modify = !self.transaction.is_active(Scope::ForeignKeyUpdate)
            || existing.is_none_or(|(_, p)| self.state_of(p) != EntityState::Added);
        let navigation = self.dependent_navigation(id, association);

        self.cache_foreign_key(id, &association.name, foreign_key.clone());
        self.forget_conceptual_null(id, false);

        let Some(fk) = foreign_key else {
            if can_modify {
                if replace {
                    if let Some((rel, _)) = existing {
                        self.delete_relationship(rel);
                    }
                }
                if set_is_loaded {
                    self.mark_loaded(id, &navigation);
                }
            }
            return Ok(());
        };

        if let Some((_, current)) = existing {
            if self.principal_matches_key(current, &fk) {
                if set_is_loaded && self.state_of(current) != EntityState::Added {
                    self.mark_loaded(id, &navigation);
                }
                return Ok(());
            }
        }

        let principal = self.key_index.get(&fk).copied().filter(|p| {
            self.entries
                .get(p)
                .is_some_and(|e| !e.is_key_entry() && e.state != EntityState::Deleted)
        });
        let principal = match principal {
            Some(p) if replace => Some(p),
            Some(p) => self.will_not_ref_steal(id, association, p)?.then_some(p),
            None => None,
        };
        match principal {
            Some(principal) => {
                if can_modify {
                    if let Some((rel, _)) = existing {
                        self.delete_relationship(rel);
                    }
                    let state = if self.state_of(id) == EntityState::Added
                        || self.state_of(principal) == EntityState::Added
                    {
                        EntityState::Added
                    } else {
                        EntityState::Unchanged
                    };
                    self.relate_entries(id, association, dependent_index, principal, state)?;
                    tracing::debug!(entry = %id, principal = %principal, key = %fk, "Fixed up reference by foreign key");
                }
                if set_is_loaded && self.state_of(principal) != EntityState::Added {
                    self.mark_loaded(id, &navigation);
                }
            }
            None => {
                self.add_to_dangling_index(fk, id);
                if can_modify && replace {
                    if let Some((rel, _)) = existing {
                        self.delete_relationship(rel);
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether relating dependent `id` to `principal` leaves every other
    /// reference alone.
    ///
    /// Returns `Ok(false)` when the dependent already has a principal and the
    /// association is one-to-many, and fails when the swap would take a
    /// one-to-one reference away from another dependent.
    pub(crate) fn will_not_ref_steal(
        &self,
        id: EntryId,
        association: &AssociationSet,
        principal: EntryId,
    ) -> Result<bool> {
        let (Some(dependent_index), Some(principal_index)) =
            (association.dependent_index(), association.principal_index())
        else {
            return Ok(true);
        };
        let ref_to_principal = self
            .live_relationships_at(id, &association.name, dependent_index)
            .first()
            .map(|(_, p)| *p);
        let one_to_one = association.end(dependent_index).multiplicity.is_reference();
        let ref_to_dependent = if one_to_one {
            self.live_relationships_at(principal, &association.name, principal_index)
                .first()
                .map(|(_, d)| *d)
        } else {
            None
        };

        if ref_to_principal.is_none() && (!one_to_one || ref_to_dependent.is_none()) {
            return Ok(true);
        }
        if one_to_one && ref_to_dependent == Some(id) {
            return Ok(true);
        }
        if !one_to_one || ref_to_principal == Some(principal) {
            return Ok(false);
        }
        Err(Error::invalid_operation(
            InvalidOperationKind::ReferenceSteal,
            format!(
                "'{}' allows only one '{}' per '{}'; relating {} to {} would take it from another entity",
                association.name,
                association.end(dependent_index).role,
                association.end(principal_index).role,
                id,
                principal
            ),
        ))
    }

    /// A foreign key member of `id` changed outside fix-up: re-point the
    /// reference to the principal it now names.
    pub(crate) fn fixup_foreign_key_member_changed(&mut self, id: EntryId, member: &str) -> Result<()> {
        if self.transaction.is_active(Scope::DetectChanges)
            || self.transaction.is_active(Scope::ForeignKeyUpdate)
        {
            return Ok(());
        }
        let set_name = self.tracked(id)?.entity_set.name().to_string();
        for association in self.workspace.foreign_keys_containing(&set_name, member) {
            self.fixup_entity_reference_by_foreign_key(id, &association)?;
        }
        Ok(())
    }

    /// Re-run fix-up for one association after its foreign key values changed.
    pub(crate) fn fixup_entity_reference_by_foreign_key(
        &mut self,
        id: EntryId,
        association: &Arc<AssociationSet>,
    ) -> Result<()> {
        let navigation = self.dependent_navigation(id, association);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.loaded.remove(&navigation);
        }
        let entity = self.entity_of(id)?;
        let fk = self.foreign_key_for(&entity, association)?;
        let existing = self.principal_of(id, association);
        let need_to_set = match (&fk, existing) {
            (Some(fk), Some((_, principal))) => !self.principal_matches_key(principal, fk),
            _ => true,
        };
        if need_to_set {
            self.fixup_entity_reference_to_principal(id, association, fk, false, true)
        } else {
            self.cache_foreign_key(id, &association.name, fk);
            self.forget_conceptual_null(id, false);
            Ok(())
        }
    }

    fn dependent_navigation(&self, id: EntryId, association: &AssociationSet) -> String {
        let set_name = self
            .entries
            .get(&id)
            .map(|e| e.entity_set.name().to_string())
            .unwrap_or_default();
        association
            .dependent_index()
            .and_then(|d| self.workspace.navigation_for_end(&set_name, association, d))
            .map_or_else(
                || {
                    association
                        .principal_index()
                        .map(|p| association.end(p).role.clone())
                        .unwrap_or_default()
                },
                |nav| nav.name,
            )
    }

    fn mark_loaded(&mut self, id: EntryId, navigation: &str) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.loaded.insert(navigation.to_string());
        }
    }

    // ========================================================================
    // Fix-up by reference
    // ========================================================================

    /// Copy principal key values into foreign keys along `id`'s relationships,
    /// resolving Added principals first.
    ///
    /// Runs before an Added entry is committed. Fails on a cycle of one-to-one
    /// constraints between Added entries.
    pub(crate) fn fixup_foreign_keys_by_reference(&mut self, id: EntryId) -> Result<()> {
        let mut visited = Vec::new();
        self.fixup_foreign_keys_by_reference_from(id, &mut visited)
    }

    fn fixup_foreign_keys_by_reference_from(
        &mut self,
        id: EntryId,
        visited: &mut Vec<EntryId>,
    ) -> Result<()> {
        let set_name = self.tracked(id)?.entity_set.name().to_string();
        for association in self.workspace.foreign_key_dependent_ends(&set_name) {
            let Some(dependent_index) = association.dependent_index() else {
                continue;
            };
            let one_to_one = association.end(dependent_index).multiplicity.is_reference();
            let Some((_, principal)) = self.principal_of(id, &association) else {
                continue;
            };
            let principal_added = self.state_of(principal) == EntityState::Added
                && self.entries.get(&principal).is_some_and(|e| !e.is_key_entry());
            if principal_added && (principal != id || one_to_one) {
                if visited.contains(&id) {
                    if one_to_one {
                        return Err(Error::invalid_operation(
                            InvalidOperationKind::CircularConstraint,
                            format!(
                                "'{}' forms a cycle of referential constraints between added entities",
                                association.name
                            ),
                        ));
                    }
                } else {
                    visited.push(id);
                    self.fixup_foreign_keys_by_reference_from(principal, visited)?;
                    visited.pop();
                }
            }
            let principal_is_temp_stub = self
                .entries
                .get(&principal)
                .is_some_and(|e| e.is_key_entry() && !e.key.is_permanent());
            if principal_is_temp_stub {
                continue;
            }
            if let Some(values) = self.principal_key_values(principal) {
                if values.iter().all(|m| !m.value.is_null()) {
                    self.write_foreign_key(id, &association, &values)?;
                }
            }
        }

        for association in self.workspace.foreign_key_principal_ends(&set_name) {
            let Some(principal_index) = association.principal_index() else {
                continue;
            };
            let Some(values) = self.principal_key_values(id) else {
                continue;
            };
            if values.iter().any(|m| m.value.is_null()) {
                continue;
            }
            let dependents = self.live_relationships_at(id, &association.name, principal_index);
            for (_, dependent) in dependents {
                let eligible = self.entries.get(&dependent).is_some_and(|e| {
                    !e.is_key_entry()
                        && (e.state == EntityState::Added
                            || !self.foreign_key_overlaps_key(&association, &e.entity_set))
                });
                if eligible {
                    self.write_foreign_key(dependent, &association, &values)?;
                }
            }
        }
        Ok(())
    }

    fn foreign_key_overlaps_key(
        &self,
        association: &AssociationSet,
        dependent_set: &entitystate_core::EntitySet,
    ) -> bool {
        let ty = dependent_set.element_type();
        association.constraint.as_ref().is_some_and(|c| {
            c.dependent_properties
                .iter()
                .filter_map(|p| ty.ordinal_of(p))
                .any(|o| ty.is_key_member(o))
        })
    }

    // ========================================================================
    // Nulling foreign keys
    // ========================================================================

    /// Null `dependent`'s foreign key for `association`.
    ///
    /// Nullable members are set to NULL. If any member is not nullable the
    /// values stay, those members are marked modified and the cached key
    /// becomes a conceptual null. While detaching, the dependent is parked
    /// in the dangling index instead.
    pub(crate) fn null_foreign_key(
        &mut self,
        dependent: EntryId,
        association: &Arc<AssociationSet>,
    ) -> Result<()> {
        if self.entries.get(&dependent).is_none_or(|e| e.is_key_entry()) {
            return Ok(());
        }
        let entity = self.entity_of(dependent)?;
        if self.transaction.is_active(Scope::Detaching) {
            if let Some(fk) = self.foreign_key_for(&entity, association)? {
                self.add_to_dangling_index(fk, dependent);
            }
            return Ok(());
        }
        if self.transaction.is_active(Scope::ForeignKeyUpdate) {
            return Ok(());
        }
        let Some(constraint) = association.constraint.clone() else {
            return Ok(());
        };
        let members = self.foreign_key_members(&entity, association)?;
        let ty = self.tracked(dependent)?.entity_set.element_type().clone();
        let state = self.state_of(dependent);
        let can_set_modified = matches!(state, EntityState::Unchanged | EntityState::Modified);

        let _scope = self.transaction.enter(Scope::ForeignKeyUpdate);
        let mut unable_to_null = false;
        for prop in &constraint.dependent_properties {
            let Some(ordinal) = ty.ordinal_of(prop) else {
                continue;
            };
            let nullable = <entitystate_core::EntityType as StructuralType>::member(&ty, ordinal).is_some_and(|m| m.is_nullable());
            if nullable {
                let current = entity.scalar(prop).unwrap_or(Value::Null);
                if !current.is_null() {
                    self.write_tracked_scalar(dependent, prop, Value::Null)?;
                }
            } else {
                unable_to_null = true;
                if can_set_modified {
                    self.mark_member_modified(dependent, ordinal, prop);
                }
            }
        }

        if unable_to_null {
            let principal_set = association
                .principal_index()
                .map(|p| association.end(p).entity_set.clone())
                .unwrap_or_default();
            let null_key = EntityKey::conceptual_null(&principal_set, members);
            self.cache_foreign_key(dependent, &association.name, Some(null_key));
            self.conceptual_nulls.insert(dependent);
            tracing::debug!(entry = %dependent, association = %association.name, "Recorded conceptual null");
        } else {
            self.cache_foreign_key(dependent, &association.name, None);
        }
        Ok(())
    }

    /// Null every foreign key `id` holds as a dependent.
    pub(crate) fn null_all_foreign_keys(&mut self, id: EntryId) -> Result<()> {
        let set_name = self.tracked(id)?.entity_set.name().to_string();
        for association in self.workspace.foreign_key_dependent_ends(&set_name) {
            if self.principal_of(id, &association).is_some() || self.has_foreign_key_values(id, &association)? {
                self.null_foreign_key(id, &association)?;
            }
        }
        Ok(())
    }

    fn has_foreign_key_values(&self, id: EntryId, association: &AssociationSet) -> Result<bool> {
        let entity = self.entity_of(id)?;
        Ok(self.foreign_key_for(&entity, association)?.is_some())
    }

    /// Null the foreign keys of every dependent related to principal `id`.
    pub(crate) fn null_foreign_keys_in_dependents(&mut self, id: EntryId) -> Result<()> {
        let set_name = self.tracked(id)?.entity_set.name().to_string();
        for association in self.workspace.foreign_key_principal_ends(&set_name) {
            let Some(principal_index) = association.principal_index() else {
                continue;
            };
            for (_, dependent) in self.live_relationships_at(id, &association.name, principal_index) {
                if dependent == id || self.state_of(dependent) == EntityState::Deleted {
                    continue;
                }
                self.null_foreign_key(dependent, &association)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Constraint checks
    // ========================================================================

    /// Verify that every foreign key `id` holds agrees with the principal it
    /// is related to.
    pub(crate) fn check_referential_constraints(&self, id: EntryId) -> Result<()> {
        let entry = self.tracked(id)?;
        let Some(entity) = entry.entity.clone() else {
            return Ok(());
        };
        for association in self.workspace.foreign_key_dependent_ends(entry.entity_set.name()) {
            let Some((_, principal)) = self.principal_of(id, &association) else {
                continue;
            };
            let Some(expected) = self.principal_key_values(principal) else {
                continue;
            };
            if expected.iter().any(|m| m.value.is_null()) {
                continue;
            }
            let actual = self.foreign_key_members(&entity, &association)?;
            let agrees = expected.len() == actual.len()
                && expected
                    .iter()
                    .zip(&actual)
                    .all(|(a, b)| a.value.is_identical(&b.value));
            if !agrees {
                return Err(Error::invalid_operation(
                    InvalidOperationKind::ReferentialConstraint,
                    format!(
                        "the foreign key of {} in '{}' does not match the key of the related principal {}",
                        entry.key,
                        association.name,
                        self.entries.get(&principal).map_or_else(String::new, |p| p.key.to_string())
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Bring the foreign key behind relationship `rel` in line with its
    /// principal while a graph is being added or attached.
    ///
    /// Adding copies the principal's key values into the dependent. Attaching
    /// two existing entities requires the values to agree already.
    pub(crate) fn align_graph_foreign_key(&mut self, rel: RelationshipId) -> Result<()> {
        let Some(relationship) = self.relationships.get(&rel) else {
            return Ok(());
        };
        let association = Arc::clone(&relationship.association);
        let (Some(dependent_index), Some(principal_index)) =
            (association.dependent_index(), association.principal_index())
        else {
            return Ok(());
        };
        let keys = relationship.keys.clone();
        let (Some(dependent), Some(principal)) = (
            self.key_index.get(&keys[dependent_index]).copied(),
            self.key_index.get(&keys[principal_index]).copied(),
        ) else {
            return Ok(());
        };
        if self.entries.get(&dependent).is_none_or(|e| e.is_key_entry()) {
            return Ok(());
        }
        let Some(values) = self.principal_key_values(principal) else {
            return Ok(());
        };
        let attaching = self.transaction.is_active(Scope::Attaching);
        let both_existing = self.state_of(dependent) != EntityState::Added
            && self.state_of(principal) != EntityState::Added;
        if attaching && both_existing {
            return self.check_referential_constraints(dependent);
        }
        if values.iter().any(|m| m.value.is_null()) {
            return Ok(());
        }
        self.write_foreign_key(dependent, &association, &values)?;
        if self.entries.get(&principal).is_some_and(|e| e.key.is_permanent()) {
            let key = self.entries.get(&principal).map(|e| e.key.clone());
            self.cache_foreign_key(dependent, &association.name, key);
        }
        Ok(())
    }
}
