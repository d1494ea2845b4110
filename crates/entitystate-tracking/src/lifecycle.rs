//! Entry lifecycle: accept, delete, detach and explicit state changes.
//!
//! | From \ To | Added | Unchanged | Modified | Deleted | Detached |
//! |---|---|---|---|---|---|
//! | Added | relationships for add | accept | accept, all bits | delete without fix-up | detach |
//! | Unchanged | temporary key | no-op | all bits | delete | detach |
//! | Modified | temporary key | accept | all bits | delete | detach |
//! | Deleted | not related, temporary key | not related, snapshot | not related, all bits | no-op | detach |
//!
//! Detaching an entity that sits at a reference end of a live relationship
//! with a full partner leaves a key stub in its place, so the partner keeps
//! its relationship.

use std::collections::HashSet;
use std::sync::Arc;

use entitystate_core::{AssociationSet, Error, InvalidOperationKind, OnDelete, Result};

use crate::entity::ChangeTrackingFlags;
use crate::entity_key::EntityKey;
use crate::entry::{EntityState, EntryId};
use crate::relationship::RelationshipId;
use crate::state_manager::StateManager;
use crate::transaction::Scope;

impl StateManager {
    fn key_entry_error(&self, id: EntryId, operation: &str) -> Error {
        let key = self
            .entries
            .get(&id)
            .map_or_else(String::new, |e| e.key.to_string());
        Error::invalid_operation(
            InvalidOperationKind::KeyEntry,
            format!("cannot {} for key entry {}", operation, key),
        )
    }

    fn is_full_entry(&self, id: EntryId) -> bool {
        self.entries.get(&id).is_some_and(|e| !e.is_key_entry())
    }

    // ========================================================================
    // Accept
    // ========================================================================

    /// Commit `id`'s pending changes.
    ///
    /// Added entries get a permanent key from their current key values and
    /// become Unchanged; Modified entries become Unchanged; Deleted entries
    /// are detached. Fails while the entry holds a conceptual null.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn accept_changes(&mut self, id: EntryId) -> Result<()> {
        let entry = self.tracked(id)?;
        if entry.is_key_entry() {
            return Ok(());
        }
        let state = entry.state;
        if state != EntityState::Deleted && self.conceptual_nulls.contains(&id) {
            return Err(Error::invalid_operation(
                InvalidOperationKind::ConceptualNull,
                format!(
                    "{} has a required relationship whose foreign key was nulled; set a new principal or delete the entity",
                    entry.key
                ),
            ));
        }
        match state {
            EntityState::Deleted => self.accept_deleted(id),
            EntityState::Added => self.accept_added(id),
            EntityState::Modified => self.accept_modified(id),
            EntityState::Unchanged | EntityState::Detached => Ok(()),
        }
    }

    fn accept_deleted(&mut self, id: EntryId) -> Result<()> {
        let entity = self.entity_of(id)?;
        for rel in self.relationship_ends(id) {
            if self.relationships.get(&rel).is_some_and(|r| r.state == EntityState::Deleted) {
                self.accept_relationship(rel);
            }
        }
        self.remove_entry(id);
        entity.set_entity_key(None);
        Ok(())
    }

    fn accept_added(&mut self, id: EntryId) -> Result<()> {
        self.fixup_foreign_keys_by_reference(id)?;
        let entity = self.entity_of(id)?;
        let set = Arc::clone(&self.tracked(id)?.entity_set);
        let key = Self::key_from_values(&set, &entity)?;
        self.fixup_key(id, key)?;
        self.check_referential_constraints(id)?;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.clear_original_state();
        }
        self.set_entry_state(id, EntityState::Unchanged);
        self.take_snapshot(id);
        self.accept_foreign_key_relationships(id);
        self.fixup_references_by_foreign_keys(id, false)
    }

    fn accept_modified(&mut self, id: EntryId) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.clear_original_state();
        }
        self.set_entry_state(id, EntityState::Unchanged);
        self.fixup_references_by_foreign_keys(id, false)?;
        self.check_referential_constraints(id)?;
        self.take_snapshot(id);
        self.accept_foreign_key_relationships(id);
        Ok(())
    }

    /// Accept the foreign key relationships of `id` whose partner is not Added.
    fn accept_foreign_key_relationships(&mut self, id: EntryId) {
        for rel in self.relationship_ends(id) {
            let Some(relationship) = self.relationships.get(&rel) else {
                continue;
            };
            if !relationship.association.is_foreign_key()
                || !matches!(relationship.state, EntityState::Added | EntityState::Deleted)
            {
                continue;
            }
            let partner_added = self
                .other_end(rel, id)
                .is_some_and(|p| p != id && self.state_of(p) == EntityState::Added);
            if !partner_added {
                self.accept_relationship(rel);
            }
        }
    }

    /// Give Added entry `id` its permanent `key`.
    ///
    /// A key stub registered under the same key is absorbed: its
    /// relationships move to `id`. Another full entry with the key is a
    /// conflict.
    fn fixup_key(&mut self, id: EntryId, key: EntityKey) -> Result<()> {
        let stub = match self.key_index.get(&key).copied() {
            Some(existing) if existing == id => return Ok(()),
            Some(existing) if self.is_full_entry(existing) => {
                return Err(Error::invalid_operation(
                    InvalidOperationKind::KeyConflict,
                    format!("accepting {} would duplicate key {}", id, key),
                ));
            }
            other => other,
        };

        let entity = self.entity_of(id)?;
        let old_key = self.tracked(id)?.key.clone();
        self.key_index.remove(&old_key);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.key = key.clone();
        }
        self.key_index.insert(key.clone(), id);
        entity.set_entity_key(Some(key.clone()));
        self.update_relationship_ends(id, &old_key, None);

        if let Some(stub) = stub {
            let stub_key = self.tracked(stub)?.key.clone();
            if let Some(entry) = self.entries.get_mut(&stub) {
                entry.key = key.clone();
            }
            self.update_relationship_ends(stub, &stub_key, Some(id));
            self.entries.remove(&stub);
            self.key_index.insert(key.clone(), id);
            for rel in self.relationship_ends(id) {
                if self.relationships.get(&rel).is_some_and(|r| r.is_live()) {
                    self.link_navigations(rel);
                }
            }
            tracing::debug!(entry = %id, stub = %stub, "Absorbed key entry");
        }
        tracing::debug!(entry = %id, old_key = %old_key, key = %key, "Fixed up key");
        Ok(())
    }

    /// Commit every pending change in the manager.
    ///
    /// Fails before changing anything if any entry holds a conceptual null.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn accept_all_changes(&mut self) -> Result<()> {
        if let Some(id) = self.conceptual_nulls.iter().next().copied() {
            let key = self
                .entries
                .get(&id)
                .map_or_else(String::new, |e| e.key.to_string());
            return Err(Error::invalid_operation(
                InvalidOperationKind::ConceptualNull,
                format!("cannot accept changes: {} holds a conceptual null foreign key", key),
            ));
        }

        let deleted_relationships = self.relationships_in(EntityState::Deleted);
        for rel in deleted_relationships {
            self.accept_relationship(rel);
        }
        for id in self.full_entries_in(EntityState::Deleted) {
            if self.state_of(id) == EntityState::Deleted {
                self.accept_changes(id)?;
            }
        }
        for id in self.full_entries_in(EntityState::Added) {
            if self.state_of(id) == EntityState::Added {
                self.accept_changes(id)?;
            }
        }
        let added_relationships = self.relationships_in(EntityState::Added);
        for rel in added_relationships {
            self.accept_relationship(rel);
        }
        for id in self.full_entries_in(EntityState::Modified) {
            if self.state_of(id) == EntityState::Modified {
                self.accept_changes(id)?;
            }
        }
        tracing::info!(entries = self.entries.len(), relationships = self.relationships.len(), "Accepted all changes");
        Ok(())
    }

    fn relationships_in(&self, state: EntityState) -> Vec<RelationshipId> {
        self.relationships
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.id)
            .collect()
    }

    fn full_entries_in(&self, state: EntityState) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| !e.is_key_entry() && e.state == state)
            .map(|e| e.id)
            .collect()
    }

    // ========================================================================
    // Explicit state changes
    // ========================================================================

    /// Move `id` to `state`, with the relationship and key side effects of
    /// each transition.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn change_state(&mut self, id: EntryId, state: EntityState) -> Result<()> {
        let entry = self.tracked(id)?;
        if entry.is_key_entry() {
            if state == EntityState::Unchanged {
                return Ok(());
            }
            return Err(self.key_entry_error(id, "change the state"));
        }
        let current = entry.state;
        match (current, state) {
            (_, EntityState::Detached) => self.detach(id),

            (EntityState::Added, EntityState::Added) => {
                self.transition_relationships_for_add(id);
                Ok(())
            }
            (EntityState::Added, EntityState::Unchanged) => self.accept_changes(id),
            (EntityState::Added, EntityState::Modified) => {
                self.accept_changes(id)?;
                self.mark_all_modified(id)
            }
            (EntityState::Added, EntityState::Deleted) => {
                self.forget_conceptual_null(id, true);
                self.delete_entry(id, false)
            }

            (EntityState::Unchanged | EntityState::Modified, EntityState::Added) => {
                self.replace_key_with_temporary_key(id)?;
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.clear_original_state();
                }
                self.set_entry_state(id, EntityState::Added);
                self.transition_relationships_for_add(id);
                Ok(())
            }
            (EntityState::Unchanged, EntityState::Unchanged)
            | (EntityState::Deleted, EntityState::Deleted) => Ok(()),
            (EntityState::Modified, EntityState::Unchanged) => self.accept_changes(id),
            (EntityState::Unchanged | EntityState::Modified, EntityState::Modified) => {
                self.mark_all_modified(id)
            }
            (EntityState::Unchanged | EntityState::Modified, EntityState::Deleted) => {
                self.delete_entry(id, true)
            }

            (EntityState::Deleted, EntityState::Added) => {
                self.verify_is_not_related(id)?;
                self.transition_relationships_for_add(id);
                self.replace_key_with_temporary_key(id)?;
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.clear_original_state();
                }
                self.set_entry_state(id, EntityState::Added);
                self.fixup_references_by_foreign_keys(id, false)
            }
            (EntityState::Deleted, EntityState::Unchanged) => {
                self.verify_is_not_related(id)?;
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.clear_original_state();
                }
                self.set_entry_state(id, EntityState::Unchanged);
                self.take_snapshot(id);
                self.fixup_references_by_foreign_keys(id, false)
            }
            (EntityState::Deleted, EntityState::Modified) => {
                self.verify_is_not_related(id)?;
                self.set_entry_state(id, EntityState::Modified);
                self.mark_all_modified(id)?;
                self.fixup_references_by_foreign_keys(id, false)
            }

            (EntityState::Detached, _) => Err(Error::invalid_operation(
                InvalidOperationKind::Detached,
                format!("entry {} is detached", id),
            )),
        }
    }

    /// Unchanged relationships of `id` become Added; Deleted ones are detached.
    fn transition_relationships_for_add(&mut self, id: EntryId) {
        for rel in self.relationship_ends(id) {
            match self.relationships.get(&rel).map(|r| r.state) {
                Some(EntityState::Unchanged) => {
                    if let Some(relationship) = self.relationships.get_mut(&rel) {
                        relationship.state = EntityState::Added;
                    }
                }
                Some(EntityState::Deleted) => self.detach_relationship_and_orphans(rel),
                _ => {}
            }
        }
    }

    /// Fail if a relationship that is not Deleted still touches `id`.
    fn verify_is_not_related(&self, id: EntryId) -> Result<()> {
        let related = self
            .relationship_ends(id)
            .into_iter()
            .filter(|rel| self.relationships.get(rel).is_some_and(|r| r.is_live()))
            .count();
        if related > 0 {
            let key = self.tracked(id)?.key.clone();
            return Err(Error::invalid_operation(
                InvalidOperationKind::RelatedEntries,
                format!(
                    "{} still has {} relationship(s) that are not deleted; remove them before changing its state",
                    key, related
                ),
            ));
        }
        Ok(())
    }

    fn replace_key_with_temporary_key(&mut self, id: EntryId) -> Result<()> {
        let entity = self.entity_of(id)?;
        let entry = self.tracked(id)?;
        let old_key = entry.key.clone();
        let temp = EntityKey::temporary(entry.entity_set.name());
        if self.key_index.get(&old_key) == Some(&id) {
            self.key_index.remove(&old_key);
        }
        self.key_index.insert(temp.clone(), id);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.key = temp.clone();
        }
        entity.set_entity_key(Some(temp));
        self.update_relationship_ends(id, &old_key, None);
        Ok(())
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Mark `id` Deleted, nulling the foreign keys that point at it or that
    /// it holds and deleting its relationships. Added entries are detached.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn delete(&mut self, id: EntryId) -> Result<()> {
        self.delete_entry(id, true)
    }

    /// Delete `id` and, when cascade deletes are configured, every entity
    /// related through an association end of `id` that declares cascade.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn delete_object(&mut self, id: EntryId) -> Result<()> {
        if self.tracked(id)?.is_key_entry() {
            return Err(self.key_entry_error(id, "delete"));
        }
        if self.config.cascade_deletes {
            let mut visited = HashSet::new();
            visited.insert(id);
            self.cascade_delete(id, &mut visited)?;
        }
        self.delete_entry(id, true)
    }

    fn cascade_delete(&mut self, id: EntryId, visited: &mut HashSet<EntryId>) -> Result<()> {
        let set_name = self.tracked(id)?.entity_set.name().to_string();
        for (association, index) in self.workspace.association_ends_for(&set_name) {
            if association.end(index).on_delete != OnDelete::Cascade {
                continue;
            }
            for (_, partner) in self.live_relationships_at(id, &association.name, index) {
                if !self.is_full_entry(partner)
                    || self.state_of(partner) == EntityState::Deleted
                    || !visited.insert(partner)
                {
                    continue;
                }
                tracing::debug!(entry = %id, dependent = %partner, association = %association.name, "Cascading delete");
                self.cascade_delete(partner, visited)?;
                self.delete_entry(partner, true)?;
            }
        }
        Ok(())
    }

    pub(crate) fn delete_entry(&mut self, id: EntryId, do_fixup: bool) -> Result<()> {
        let entry = self.tracked(id)?;
        if entry.is_key_entry() {
            return Err(self.key_entry_error(id, "delete"));
        }
        let state = entry.state;
        if do_fixup && state != EntityState::Deleted {
            self.null_foreign_keys_in_dependents(id)?;
            self.null_all_foreign_keys(id)?;
            for rel in self.relationship_ends(id) {
                if self.relationships.get(&rel).is_some_and(|r| r.is_live()) {
                    self.delete_relationship(rel);
                }
            }
        }

        match state {
            EntityState::Added => {
                let entity = self.entity_of(id)?;
                self.remove_entry(id);
                entity.set_entity_key(None);
            }
            EntityState::Unchanged | EntityState::Modified => {
                if !do_fixup {
                    for rel in self.relationship_ends(id) {
                        let to_stub = self
                            .other_end(rel, id)
                            .is_some_and(|p| !self.is_full_entry(p));
                        if to_stub {
                            self.delete_relationship(rel);
                        }
                    }
                }
                self.set_entry_state(id, EntityState::Deleted);
                self.forget_conceptual_null(id, true);
            }
            EntityState::Deleted | EntityState::Detached => {}
        }
        Ok(())
    }

    // ========================================================================
    // Detach
    // ========================================================================

    /// Stop tracking `id`.
    ///
    /// Navigation values pointing at the entity are cleared. If the entity
    /// sits at a reference end of a relationship with a full partner, and is
    /// not Added, its entry is degraded to a key stub that keeps those
    /// relationships.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detach(&mut self, id: EntryId) -> Result<()> {
        let entry = self.tracked(id)?;
        if entry.is_key_entry() {
            return Err(self.key_entry_error(id, "detach"));
        }
        let state = entry.state;
        let key = entry.key.clone();
        let set_name = entry.entity_set.name().to_string();
        let entity = self.entity_of(id)?;
        let _scope = self.transaction.enter(Scope::Detaching);

        let create_key_entry = state != EntityState::Added
            && self.relationship_ends(id).into_iter().any(|rel| {
                let Some(relationship) = self.relationships.get(&rel) else {
                    return false;
                };
                let Some(index) = self.end_of(rel, id) else {
                    return false;
                };
                relationship.association.end(index).multiplicity.is_reference()
                    && self.other_end(rel, id).is_some_and(|p| self.is_full_entry(p))
            });

        for rel in self.relationship_ends(id) {
            let Some(relationship) = self.relationships.get(&rel) else {
                continue;
            };
            if !relationship.is_live() {
                continue;
            }
            let association = Arc::clone(&relationship.association);
            let (Some(index), Some(partner)) = (self.end_of(rel, id), self.other_end(rel, id)) else {
                continue;
            };
            if !self.is_full_entry(partner) {
                continue;
            }
            let partner_key = self.tracked(partner)?.key.clone();
            if association.principal_index() == Some(index) && partner != id {
                self.null_foreign_key(partner, &association)?;
            }
            self.unlink_navigations(rel);

            let own_end_many = !association.end(index).multiplicity.is_reference();
            if state == EntityState::Added || own_end_many {
                self.remove_relationship(rel);
                if !association.is_foreign_key()
                    && association.end(1 - index).multiplicity.is_reference()
                    && partner_key.is_permanent()
                {
                    if let Some(nav) = self.workspace.navigation_for_end(&set_name, &association, index) {
                        entity.set_detached_key(&nav.name, Some(partner_key));
                    }
                }
            } else {
                self.set_partner_detached_key(partner, &association, index, &key);
            }
        }

        for rel in self.relationship_ends(id) {
            let Some(relationship) = self.relationships.get(&rel) else {
                continue;
            };
            let association = Arc::clone(&relationship.association);
            let live = relationship.is_live();
            let rel_state = relationship.state;
            let (Some(index), Some(partner)) = (self.end_of(rel, id), self.other_end(rel, id)) else {
                continue;
            };
            if !self.is_full_entry(partner) {
                if live && association.end(1 - index).multiplicity.is_reference() {
                    if let Some(nav) = self.workspace.navigation_for_end(&set_name, &association, index) {
                        let stub_key = self.tracked(partner)?.key.clone();
                        entity.set_detached_key(&nav.name, Some(stub_key));
                    }
                }
                self.detach_relationship_and_orphans(rel);
            } else if rel_state == EntityState::Deleted
                && !association.end(index).multiplicity.is_reference()
            {
                self.remove_relationship(rel);
            }
        }

        if create_key_entry {
            self.degrade(id);
        } else {
            self.remove_entry(id);
        }
        if state == EntityState::Added {
            entity.set_entity_key(None);
        }
        tracing::debug!(entry = %id, key = %key, degraded = create_key_entry, "Detached entry");
        Ok(())
    }

    /// Record `key` as the detached key of the partner's navigation toward
    /// end `index` of `association`.
    fn set_partner_detached_key(
        &self,
        partner: EntryId,
        association: &AssociationSet,
        index: usize,
        key: &EntityKey,
    ) {
        let Some(entry) = self.entries.get(&partner) else {
            return;
        };
        let Some(entity) = entry.entity.as_ref() else {
            return;
        };
        if let Some(nav) = self
            .workspace
            .navigation_for_end(entry.entity_set.name(), association, 1 - index)
        {
            entity.set_detached_key(&nav.name, Some(key.clone()));
        }
    }

    /// Turn full entry `id` into a key stub, keeping its key and relationships.
    fn degrade(&mut self, id: EntryId) {
        self.remove_from_dangling_index(id);
        self.conceptual_nulls.remove(&id);
        if self.state_of(id) != EntityState::Unchanged {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.clear_original_state();
            }
            self.set_entry_state(id, EntityState::Unchanged);
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.clear_original_state();
        if let Some(entity) = entry.entity.take() {
            if self.object_index.get(&entity.id()) == Some(&id) {
                self.object_index.remove(&entity.id());
            }
        }
        entry.flags = ChangeTrackingFlags::default();
        entry.loaded.clear();
        entry.foreign_keys.clear();
        tracing::debug!(entry = %id, key = %entry.key, "Degraded entry to key entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{customer, employee, line, order, order_customer_workspace};
    use entitystate_core::Value;

    #[test]
    fn test_added_to_deleted_detaches() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.add_object("Customers", &c).unwrap();
        sm.change_state(id, EntityState::Deleted).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Detached);
        assert!(sm.entry(id).is_none());
        assert!(c.entity_key().is_none());
        assert!(sm.entry_for(&c).is_none());
    }

    #[test]
    fn test_accept_added_assigns_permanent_key() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 5, "Ada");
        let id = sm.add_object("Customers", &c).unwrap();
        sm.accept_changes(id).unwrap();
        let entry = sm.entry(id).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        let key = EntityKey::single("Customers", "Id", 5_i64).unwrap();
        assert_eq!(*entry.key(), key);
        assert_eq!(sm.find_entry(&key), Some(id));
        assert_eq!(c.entity_key(), Some(key));
        // Accepting again changes nothing.
        sm.accept_changes(id).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Unchanged);
    }

    #[test]
    fn test_accept_added_absorbs_key_entry() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let manager_key = EntityKey::single("Employees", "Id", 1_i64).unwrap();
        let report = employee(&ws, 2);
        let report_id = sm.attach("Employees", &report).unwrap();
        let stub = sm.add_key_entry(&manager_key).unwrap();
        sm.change_relationship_state(report_id, "Manager", stub, EntityState::Unchanged)
            .unwrap();

        let manager = employee(&ws, 1);
        let manager_id = sm.add_object("Employees", &manager).unwrap();
        sm.accept_changes(manager_id).unwrap();

        assert!(sm.entry(stub).is_none());
        assert_eq!(sm.find_entry(&manager_key), Some(manager_id));
        assert_eq!(sm.entry(manager_id).unwrap().relationship_count(), 1);
        assert!(report.reference("Manager").is_some_and(|m| m.ptr_eq(&manager)));
    }

    #[test]
    fn test_accept_added_key_conflict() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        sm.attach("Customers", &customer(&ws, 1, "Ada")).unwrap();
        let id = sm.add_object("Customers", &customer(&ws, 1, "Twin")).unwrap();
        let err = sm.accept_changes(id).unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::KeyConflict));
    }

    #[test]
    fn test_delete_nulls_dependent_foreign_keys() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let o = order(&ws, 10, Some(1));
        let customer_id = sm.attach("Customers", &c).unwrap();
        let order_id = sm.attach("Orders", &o).unwrap();
        assert!(o.reference("Customer").is_some());

        sm.delete(customer_id).unwrap();
        assert_eq!(sm.state_of(customer_id), EntityState::Deleted);
        assert_eq!(o.scalar("CustomerId"), Some(Value::Null));
        assert_eq!(sm.state_of(order_id), EntityState::Modified);
        assert!(o.reference("Customer").is_none());
        let rels = sm.relationships_for(customer_id);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].state(), EntityState::Deleted);
    }

    #[test]
    fn test_delete_object_cascades() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let o = order(&ws, 10, None);
        let order_id = sm.attach("Orders", &o).unwrap();
        let l1 = sm.attach("Lines", &line(&ws, 100, 10)).unwrap();
        let l2 = sm.attach("Lines", &line(&ws, 101, 10)).unwrap();

        sm.delete_object(order_id).unwrap();
        assert_eq!(sm.state_of(order_id), EntityState::Deleted);
        assert_eq!(sm.state_of(l1), EntityState::Deleted);
        assert_eq!(sm.state_of(l2), EntityState::Deleted);
        assert!(sm.conceptual_null_entries().is_empty());

        sm.accept_all_changes().unwrap();
        assert!(sm.is_empty());
        assert_eq!(sm.relationships().count(), 0);
    }

    #[test]
    fn test_delete_without_cascade_leaves_conceptual_null() {
        let ws = order_customer_workspace();
        let config = crate::StateManagerConfig::new().cascade_deletes(false);
        let mut sm = StateManager::with_config(Arc::clone(&ws), config);
        let order_id = sm.attach("Orders", &order(&ws, 10, None)).unwrap();
        let l = line(&ws, 100, 10);
        let line_id = sm.attach("Lines", &l).unwrap();

        sm.delete_object(order_id).unwrap();
        assert_eq!(sm.state_of(line_id), EntityState::Modified);
        assert!(sm.has_conceptual_null(line_id));
        // The non-nullable value stays.
        assert_eq!(l.scalar("OrderId"), Some(Value::BigInt(10)));

        let err = sm.accept_all_changes().unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::ConceptualNull));
        assert_eq!(sm.state_of(order_id), EntityState::Deleted);

        sm.delete(line_id).unwrap();
        assert!(sm.conceptual_null_entries().is_empty());
        sm.accept_all_changes().unwrap();
        assert!(sm.is_empty());
    }

    #[test]
    fn test_detach_principal_leaves_key_entry() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let o = order(&ws, 10, None);
        let order_id = sm.attach("Orders", &o).unwrap();
        let l = line(&ws, 100, 10);
        let line_id = sm.attach("Lines", &l).unwrap();
        assert!(l.reference("Order").is_some());

        sm.detach(order_id).unwrap();
        let stub = sm.entry(order_id).unwrap();
        assert!(stub.is_key_entry());
        assert_eq!(stub.state(), EntityState::Unchanged);
        assert!(sm.entry_for(&o).is_none());

        // The line keeps its relationship, now to the stub.
        assert_eq!(sm.state_of(line_id), EntityState::Unchanged);
        let rels = sm.relationships_for(line_id);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].state(), EntityState::Unchanged);
        assert!(l.reference("Order").is_none());
        assert_eq!(l.detached_key("Order"), Some(stub.key().clone()));
        assert_eq!(sm.dangling_dependents(stub.key()), vec![line_id]);

        // Attaching the order again promotes the stub.
        assert_eq!(sm.attach("Orders", &o).unwrap(), order_id);
        assert!(l.reference("Order").is_some_and(|r| r.ptr_eq(&o)));
    }

    #[test]
    fn test_detach_dependent_removes_entry() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let o = order(&ws, 10, Some(1));
        let customer_id = sm.attach("Customers", &c).unwrap();
        let order_id = sm.attach("Orders", &o).unwrap();

        sm.detach(order_id).unwrap();
        assert!(sm.entry(order_id).is_none());
        assert!(c.collection("Orders").is_empty());
        assert_eq!(sm.entry(customer_id).unwrap().relationship_count(), 0);
        // Unchanged entities keep their key when detached.
        assert!(o.entity_key().is_some());
    }

    #[test]
    fn test_detach_remembers_independent_reference() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let boss = employee(&ws, 1);
        let report = employee(&ws, 2);
        report.set_reference("Manager", Some(boss.clone())).unwrap();
        let report_id = sm.attach("Employees", &report).unwrap();
        let boss_id = sm.entry_for(&boss).unwrap();

        sm.detach(report_id).unwrap();
        assert!(sm.entry(report_id).is_none());
        assert!(boss.collection("Reports").is_empty());
        let boss_key = sm.entry(boss_id).unwrap().key().clone();
        assert_eq!(report.detached_key("Manager"), Some(boss_key));

        // Re-attaching restores the relationship from the hint.
        let again = sm.attach("Employees", &report).unwrap();
        assert_eq!(sm.related(again, "Manager").unwrap(), vec![boss_id]);
        assert!(report.detached_key("Manager").is_none());
    }

    #[test]
    fn test_change_state_table() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();

        sm.change_state(id, EntityState::Modified).unwrap();
        assert_eq!(sm.modified_properties(id).unwrap(), vec!["Name", "Address"]);

        sm.change_state(id, EntityState::Unchanged).unwrap();
        assert!(sm.modified_properties(id).unwrap().is_empty());

        sm.change_state(id, EntityState::Added).unwrap();
        assert!(sm.entry(id).unwrap().key().is_temporary());

        sm.change_state(id, EntityState::Unchanged).unwrap();
        assert!(sm.entry(id).unwrap().key().is_permanent());

        sm.change_state(id, EntityState::Deleted).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Deleted);

        sm.change_state(id, EntityState::Modified).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Modified);

        sm.change_state(id, EntityState::Detached).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Detached);
    }

    #[test]
    fn test_deleted_to_unchanged_takes_current_values() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        c.set("Name", "Grace").unwrap();
        sm.delete(id).unwrap();
        sm.change_state(id, EntityState::Unchanged).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Unchanged);
        assert_eq!(sm.original_value(id, "Name").unwrap(), Value::from("Grace"));
    }

    #[test]
    fn test_key_entry_state_changes() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let key = EntityKey::single("Customers", "Id", 3_i64).unwrap();
        let stub = sm.add_key_entry(&key).unwrap();
        sm.change_state(stub, EntityState::Unchanged).unwrap();
        let err = sm.change_state(stub, EntityState::Deleted).unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::KeyEntry));
        assert!(sm.detach(stub).is_err());
        assert!(sm.delete(stub).is_err());
    }

    #[test]
    fn test_unchanged_to_added_moves_relationships() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let o = order(&ws, 10, Some(1));
        let customer_id = sm.attach("Customers", &c).unwrap();
        sm.attach("Orders", &o).unwrap();

        sm.change_state(customer_id, EntityState::Added).unwrap();
        let rels = sm.relationships_for(customer_id);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].state(), EntityState::Added);
        assert!(rels[0].keys().iter().any(EntityKey::is_temporary));
    }
}
