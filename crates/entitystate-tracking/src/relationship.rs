//! Relationship entries and the per-entry relationship list.
//!
//! A [`RelationshipEntry`] links the keys at the two ends of an association.
//! Instead of a collection per entity entry, every relationship carries two
//! `next` slots, one per end, and each entity entry keeps only the head of
//! its list and a count. The same relationship is therefore threaded into
//! two independent singly-linked lists.
//!
//! # Slot selection
//!
//! When a list is walked from an entry's key, the slot belonging to that key
//! is chosen by reference identity first and value equality second:
//!
//! 1. `keys[0]` is the same key instance: slot 0
//! 2. `keys[1]` is the same key instance: slot 1
//! 3. `keys[0] == key`: slot 0
//! 4. `keys[1] == key`: slot 1
//!
//! A relationship whose two ends are the same entry is threaded into that
//! entry's list once, through slot 0. Adding, removing and walking all use
//! this one rule, so the `next` pointer of the other end is never touched.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use entitystate_core::{AssociationSet, Error, InvalidOperationKind, Result};
use serde::{Deserialize, Serialize};

use crate::entity_key::EntityKey;
use crate::entry::{EntityState, EntryId};
use crate::state_manager::StateManager;

/// Handle of a relationship entry inside one state manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipId(pub(crate) u64);

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A link between the entities at the two ends of an association.
#[derive(Debug, Clone)]
pub struct RelationshipEntry {
    pub(crate) id: RelationshipId,
    pub(crate) association: Arc<AssociationSet>,
    pub(crate) keys: [EntityKey; 2],
    pub(crate) next: [Option<RelationshipId>; 2],
    pub(crate) state: EntityState,
}

impl RelationshipEntry {
    pub fn id(&self) -> RelationshipId {
        self.id
    }

    pub fn association(&self) -> &Arc<AssociationSet> {
        &self.association
    }

    /// Key at association end `index` (0 or 1).
    pub fn key(&self, index: usize) -> &EntityKey {
        &self.keys[index & 1]
    }

    pub fn keys(&self) -> &[EntityKey; 2] {
        &self.keys
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Slot owned by `key` in this relationship.
    pub(crate) fn slot_for(&self, key: &EntityKey) -> Option<usize> {
        if self.keys[0].same_instance(key) {
            Some(0)
        } else if self.keys[1].same_instance(key) {
            Some(1)
        } else if self.keys[0] == *key {
            Some(0)
        } else if self.keys[1] == *key {
            Some(1)
        } else {
            None
        }
    }

    /// Key at the end opposite `key`.
    pub fn other_key(&self, key: &EntityKey) -> Option<&EntityKey> {
        self.slot_for(key).map(|slot| &self.keys[1 - slot])
    }

    /// Whether the entity with `key` sits at association end `index`.
    pub(crate) fn has_key_at(&self, key: &EntityKey, index: usize) -> bool {
        self.keys[index & 1] == *key
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state != EntityState::Deleted
    }

    pub(crate) fn wrapper(&self) -> RelationshipWrapper {
        RelationshipWrapper {
            association: self.association.name.clone(),
            keys: self.keys.clone(),
        }
    }
}

/// Identity of a relationship: association name plus both end keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RelationshipWrapper {
    pub(crate) association: String,
    pub(crate) keys: [EntityKey; 2],
}

impl RelationshipWrapper {
    pub(crate) fn new(association: &str, keys: [EntityKey; 2]) -> Self {
        Self {
            association: association.to_string(),
            keys,
        }
    }
}

impl StateManager {
    /// Relationship entry by id.
    pub fn relationship(&self, id: RelationshipId) -> Option<&RelationshipEntry> {
        self.relationships.get(&id)
    }

    /// All relationship entries, oldest first.
    pub fn relationships(&self) -> impl Iterator<Item = &RelationshipEntry> {
        self.relationships.values()
    }

    /// Relationship entries threaded through `entry`'s list, most recently
    /// added first.
    pub fn relationships_for(&self, entry: EntryId) -> Vec<&RelationshipEntry> {
        self.relationship_ends(entry)
            .into_iter()
            .filter_map(|id| self.relationships.get(&id))
            .collect()
    }

    /// The relationship in `association` linking `keys`, if any.
    pub(crate) fn find_relationship(
        &self,
        association: &str,
        keys: &[EntityKey; 2],
    ) -> Option<RelationshipId> {
        self.relationship_index
            .get(&RelationshipWrapper::new(association, keys.clone()))
            .copied()
    }

    // ========================================================================
    // List maintenance
    // ========================================================================

    /// Walk `entry`'s list from its head. Does not check the count.
    pub(crate) fn walk_relationship_list(&self, entry: EntryId) -> Vec<RelationshipId> {
        let Some(owner) = self.entries.get(&entry) else {
            return Vec::new();
        };
        let mut ids = Vec::with_capacity(owner.relationship_count);
        let mut cursor = owner.relationship_head;
        while let Some(id) = cursor {
            let Some(rel) = self.relationships.get(&id) else {
                tracing::error!(entry = %entry, relationship = %id, "Dangling relationship list link");
                break;
            };
            ids.push(id);
            cursor = rel.slot_for(&owner.key).and_then(|slot| rel.next[slot]);
            if ids.len() > self.relationships.len() {
                tracing::error!(entry = %entry, "Cycle in relationship list");
                break;
            }
        }
        ids
    }

    /// Relationship ids in `entry`'s list, checked against the maintained count.
    pub(crate) fn relationship_ends(&self, entry: EntryId) -> Vec<RelationshipId> {
        let ids = self.walk_relationship_list(entry);
        if let Some(owner) = self.entries.get(&entry) {
            debug_assert_eq!(
                ids.len(),
                owner.relationship_count,
                "relationship list of {} walks {} links but counts {}",
                entry,
                ids.len(),
                owner.relationship_count
            );
        }
        ids
    }

    fn list_contains(&self, entry: EntryId, relationship: RelationshipId) -> bool {
        self.walk_relationship_list(entry).contains(&relationship)
    }

    fn check_relationship_list(&self, entry: EntryId) {
        if !self.config.validate_relationship_lists {
            return;
        }
        let walked = self.walk_relationship_list(entry).len();
        let counted = self
            .entries
            .get(&entry)
            .map_or(0, |e| e.relationship_count);
        if walked != counted {
            tracing::error!(
                entry = %entry,
                walked,
                counted,
                "Relationship list count diverged"
            );
        }
        debug_assert_eq!(walked, counted, "relationship list of {} diverged", entry);
    }

    /// Push `relationship` onto the head of `entry`'s list.
    pub(crate) fn add_relationship_end(&mut self, entry: EntryId, relationship: RelationshipId) {
        debug_assert!(
            !self.list_contains(entry, relationship),
            "relationship {} already in list of {}",
            relationship,
            entry
        );
        let Some(owner) = self.entries.get_mut(&entry) else {
            return;
        };
        let Some(rel) = self.relationships.get_mut(&relationship) else {
            return;
        };
        let slot = rel.slot_for(&owner.key);
        debug_assert!(slot.is_some(), "relationship {} does not touch {}", relationship, owner.key);
        let Some(slot) = slot else {
            return;
        };
        rel.next[slot] = owner.relationship_head;
        owner.relationship_head = Some(relationship);
        owner.relationship_count += 1;
        tracing::trace!(entry = %entry, relationship = %relationship, slot, "Added relationship end");
        self.check_relationship_list(entry);
    }

    /// Unlink `relationship` from `entry`'s list.
    pub(crate) fn remove_relationship_end(&mut self, entry: EntryId, relationship: RelationshipId) {
        let Some(owner_key) = self.entries.get(&entry).map(|e| e.key.clone()) else {
            return;
        };
        let mut previous: Option<RelationshipId> = None;
        let mut cursor = self.entries.get(&entry).and_then(|e| e.relationship_head);
        let mut found = false;
        while let Some(id) = cursor {
            let next = self
                .relationships
                .get(&id)
                .and_then(|rel| rel.slot_for(&owner_key).and_then(|slot| rel.next[slot]));
            if id == relationship {
                match previous {
                    None => {
                        if let Some(owner) = self.entries.get_mut(&entry) {
                            owner.relationship_head = next;
                        }
                    }
                    Some(prev) => {
                        if let Some(prev_rel) = self.relationships.get_mut(&prev) {
                            if let Some(slot) = prev_rel.slot_for(&owner_key) {
                                prev_rel.next[slot] = next;
                            }
                        }
                    }
                }
                if let Some(rel) = self.relationships.get_mut(&id) {
                    if let Some(slot) = rel.slot_for(&owner_key) {
                        rel.next[slot] = None;
                    }
                }
                if let Some(owner) = self.entries.get_mut(&entry) {
                    owner.relationship_count = owner.relationship_count.saturating_sub(1);
                }
                tracing::trace!(entry = %entry, relationship = %relationship, "Removed relationship end");
                found = true;
                break;
            }
            previous = Some(id);
            cursor = next;
        }
        debug_assert!(found, "relationship {} not in list of {}", relationship, entry);
        self.check_relationship_list(entry);
    }

    /// Re-point every relationship in `entry`'s list from `old_key` to the
    /// entry's current key.
    ///
    /// With `promoted`, the relationships are moved to that entry's list
    /// instead (skipping ones already present there) and `entry`'s list is
    /// emptied.
    pub(crate) fn update_relationship_ends(
        &mut self,
        entry: EntryId,
        old_key: &EntityKey,
        promoted: Option<EntryId>,
    ) {
        let Some(new_key) = self.entries.get(&entry).map(|e| e.key.clone()) else {
            return;
        };
        let mut cursor = self.entries.get(&entry).and_then(|e| e.relationship_head);
        let mut visited = 0usize;
        while let Some(id) = cursor {
            let next = self
                .relationships
                .get(&id)
                .and_then(|rel| rel.slot_for(old_key).and_then(|slot| rel.next[slot]));
            self.change_related_end(id, old_key, &new_key);
            if let Some(target) = promoted {
                if !self.list_contains(target, id) {
                    self.add_relationship_end(target, id);
                }
            }
            cursor = next;
            visited += 1;
            if visited > self.relationships.len() {
                tracing::error!(entry = %entry, "Cycle while updating relationship ends");
                break;
            }
        }
        if promoted.is_some() {
            if let Some(owner) = self.entries.get_mut(&entry) {
                owner.relationship_head = None;
                owner.relationship_count = 0;
            }
        }
        tracing::debug!(entry = %entry, old_key = %old_key, new_key = %new_key, "Updated relationship ends");
    }

    /// Replace `old_key` with `new_key` at whichever end(s) hold it.
    fn change_related_end(&mut self, relationship: RelationshipId, old_key: &EntityKey, new_key: &EntityKey) {
        let Some(rel) = self.relationships.get_mut(&relationship) else {
            return;
        };
        let old_wrapper = rel.wrapper();
        if rel.keys[0] == *old_key && rel.keys[1] == *old_key {
            rel.keys = [new_key.clone(), new_key.clone()];
        } else if rel.keys[0] == *old_key {
            rel.keys[0] = new_key.clone();
        } else {
            rel.keys[1] = new_key.clone();
        }
        let new_wrapper = rel.wrapper();
        if self.relationship_index.get(&old_wrapper) == Some(&relationship) {
            self.relationship_index.remove(&old_wrapper);
            self.relationship_index.insert(new_wrapper, relationship);
        }
    }

    // ========================================================================
    // Relationship lifetime
    // ========================================================================

    /// Create a relationship between the entries registered under `keys`.
    ///
    /// Both keys must resolve to entries (full or stub). The relationship
    /// stores the entries' own key instances.
    pub(crate) fn add_relationship(
        &mut self,
        association: &Arc<AssociationSet>,
        keys: [EntityKey; 2],
        state: EntityState,
    ) -> Result<RelationshipId> {
        let mut ends = [EntryId(0); 2];
        let mut stored: Vec<EntityKey> = Vec::with_capacity(2);
        for (index, key) in keys.iter().enumerate() {
            let id = self.key_index.get(key).copied().ok_or_else(|| {
                Error::invalid_operation(
                    InvalidOperationKind::Detached,
                    format!(
                        "cannot relate {} in '{}': the entity is not tracked",
                        key, association.name
                    ),
                )
            })?;
            let Some(entry) = self.entries.get(&id) else {
                return Err(Error::invalid_operation(
                    InvalidOperationKind::Detached,
                    format!("entry {} for {} is no longer tracked", id, key),
                ));
            };
            ends[index] = id;
            stored.push(entry.key.clone());
        }
        let keys = [stored[0].clone(), stored[1].clone()];
        let wrapper = RelationshipWrapper::new(&association.name, keys.clone());
        if self.relationship_index.contains_key(&wrapper) {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyConflict,
                format!(
                    "a relationship in '{}' between {} and {} already exists",
                    association.name, keys[0], keys[1]
                ),
            ));
        }
        let id = RelationshipId(self.next_relationship_id);
        self.next_relationship_id += 1;
        self.relationships.insert(
            id,
            RelationshipEntry {
                id,
                association: Arc::clone(association),
                keys,
                next: [None, None],
                state,
            },
        );
        self.relationship_index.insert(wrapper, id);
        self.add_relationship_end(ends[0], id);
        if ends[1] != ends[0] {
            self.add_relationship_end(ends[1], id);
        }
        tracing::debug!(
            relationship = %id,
            association = %association.name,
            state = %state,
            "Created relationship"
        );
        Ok(id)
    }

    /// Remove a relationship from both lists, the index and the arena.
    pub(crate) fn remove_relationship(&mut self, relationship: RelationshipId) {
        let Some(rel) = self.relationships.get(&relationship) else {
            return;
        };
        let wrapper = rel.wrapper();
        let keys = rel.keys.clone();
        let mut owners: Vec<EntryId> = keys
            .iter()
            .filter_map(|k| self.key_index.get(k).copied())
            .collect();
        owners.dedup();
        for owner in owners {
            self.remove_relationship_end(owner, relationship);
        }
        if self.relationship_index.get(&wrapper) == Some(&relationship) {
            self.relationship_index.remove(&wrapper);
        }
        self.relationships.remove(&relationship);
        tracing::debug!(relationship = %relationship, association = %wrapper.association, "Detached relationship");
    }

    /// Remove a relationship, then any key stub it leaves without relationships.
    pub(crate) fn detach_relationship_and_orphans(&mut self, relationship: RelationshipId) {
        let Some(keys) = self.relationships.get(&relationship).map(|r| r.keys.clone()) else {
            return;
        };
        self.unlink_navigations(relationship);
        self.remove_relationship(relationship);
        let mut seen = HashSet::new();
        for key in &keys {
            let Some(id) = self.key_index.get(key).copied() else {
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            let orphan = self
                .entries
                .get(&id)
                .is_some_and(|e| e.is_key_entry() && e.relationship_count == 0);
            if orphan {
                self.remove_entry(id);
            }
        }
    }

    /// Delete a relationship: Added ones are detached, Unchanged ones become
    /// Deleted. Navigation values are unlinked either way.
    pub(crate) fn delete_relationship(&mut self, relationship: RelationshipId) {
        let Some(state) = self.relationships.get(&relationship).map(|r| r.state) else {
            return;
        };
        match state {
            EntityState::Added => self.detach_relationship_and_orphans(relationship),
            EntityState::Unchanged | EntityState::Modified => {
                self.unlink_navigations(relationship);
                if let Some(rel) = self.relationships.get_mut(&relationship) {
                    rel.state = EntityState::Deleted;
                }
                tracing::debug!(relationship = %relationship, "Deleted relationship");
            }
            EntityState::Deleted | EntityState::Detached => {}
        }
    }

    /// Commit a relationship: Added becomes Unchanged, Deleted is detached.
    pub(crate) fn accept_relationship(&mut self, relationship: RelationshipId) {
        let Some(state) = self.relationships.get(&relationship).map(|r| r.state) else {
            return;
        };
        match state {
            EntityState::Added | EntityState::Modified => {
                if let Some(rel) = self.relationships.get_mut(&relationship) {
                    rel.state = EntityState::Unchanged;
                }
            }
            EntityState::Deleted => self.detach_relationship_and_orphans(relationship),
            EntityState::Unchanged | EntityState::Detached => {}
        }
    }

    /// Bring a Deleted relationship back to Unchanged and relink navigation values.
    pub(crate) fn revert_relationship_delete(&mut self, relationship: RelationshipId) {
        let reverted = match self.relationships.get_mut(&relationship) {
            Some(rel) if rel.state == EntityState::Deleted => {
                rel.state = EntityState::Unchanged;
                true
            }
            _ => false,
        };
        if reverted {
            self.link_navigations(relationship);
        }
    }

    /// Entry at the end of `relationship` opposite `entry`.
    pub(crate) fn other_end(&self, relationship: RelationshipId, entry: EntryId) -> Option<EntryId> {
        let rel = self.relationships.get(&relationship)?;
        let owner = self.entries.get(&entry)?;
        let other = rel.other_key(&owner.key)?;
        self.key_index.get(other).copied()
    }

    /// Index of the end `entry` occupies in `relationship`.
    pub(crate) fn end_of(&self, relationship: RelationshipId, entry: EntryId) -> Option<usize> {
        let rel = self.relationships.get(&relationship)?;
        let owner = self.entries.get(&entry)?;
        rel.slot_for(&owner.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitystate_core::{AssociationEnd, Multiplicity};

    fn association() -> Arc<AssociationSet> {
        Arc::new(AssociationSet::new(
            "Employee_Manager",
            AssociationEnd::new("Manager", "Employees", Multiplicity::ZeroOrOne),
            AssociationEnd::new("Report", "Employees", Multiplicity::Many),
        ))
    }

    fn relationship(keys: [EntityKey; 2]) -> RelationshipEntry {
        RelationshipEntry {
            id: RelationshipId(1),
            association: association(),
            keys,
            next: [None, None],
            state: EntityState::Unchanged,
        }
    }

    #[test]
    fn test_slot_prefers_instance_identity() {
        let a = EntityKey::single("Employees", "Id", 1_i64).unwrap();
        let a_copy = EntityKey::single("Employees", "Id", 1_i64).unwrap();
        let rel = relationship([a_copy.clone(), a.clone()]);
        // Equal by value at both ends: the reference-equal slot wins.
        assert_eq!(rel.slot_for(&a), Some(1));
        assert_eq!(rel.slot_for(&a_copy), Some(0));
        let other_instance = EntityKey::single("Employees", "Id", 1_i64).unwrap();
        assert_eq!(rel.slot_for(&other_instance), Some(0));
    }

    #[test]
    fn test_slot_for_unrelated_key() {
        let a = EntityKey::single("Employees", "Id", 1_i64).unwrap();
        let b = EntityKey::single("Employees", "Id", 2_i64).unwrap();
        let c = EntityKey::single("Employees", "Id", 3_i64).unwrap();
        let rel = relationship([a.clone(), b.clone()]);
        assert_eq!(rel.slot_for(&b), Some(1));
        assert_eq!(rel.slot_for(&c), None);
        assert_eq!(rel.other_key(&a), Some(&b));
        assert!(rel.has_key_at(&a, 0));
        assert!(!rel.has_key_at(&a, 1));
    }

    #[test]
    fn test_wrapper_identity() {
        let a = EntityKey::single("Employees", "Id", 1_i64).unwrap();
        let b = EntityKey::single("Employees", "Id", 2_i64).unwrap();
        let rel = relationship([a.clone(), b.clone()]);
        assert_eq!(rel.wrapper(), RelationshipWrapper::new("Employee_Manager", [a.clone(), b.clone()]));
        assert_ne!(rel.wrapper(), RelationshipWrapper::new("Employee_Manager", [b, a]));
    }
}
