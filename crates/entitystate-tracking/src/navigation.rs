//! Relationship manager operations.
//!
//! Navigation values on entity objects mirror the live relationship entries
//! of the state manager. The functions here create, remove and change the
//! state of relationships, and they keep navigation values and foreign key
//! values in step with them.

use std::sync::Arc;

use entitystate_core::{AssociationSet, Error, InvalidOperationKind, Result};

use crate::entity_key::EntityKey;
use crate::entry::{EntityState, EntryId};
use crate::relationship::RelationshipId;
use crate::state_manager::StateManager;

impl StateManager {
    /// Live relationships in `association` where `entry` sits at end
    /// `index`, with the entry at the other end.
    pub(crate) fn live_relationships_at(
        &self,
        entry: EntryId,
        association: &str,
        index: usize,
    ) -> Vec<(RelationshipId, EntryId)> {
        let Some(owner) = self.entries.get(&entry) else {
            return Vec::new();
        };
        self.walk_relationship_list(entry)
            .into_iter()
            .filter_map(|id| {
                let rel = self.relationships.get(&id)?;
                if rel.association.name != association
                    || !rel.is_live()
                    || !rel.has_key_at(&owner.key, index)
                {
                    return None;
                }
                let other = self.key_index.get(&rel.keys[1 - index])?;
                Some((id, *other))
            })
            .collect()
    }

    /// Entries currently related to `entry` through `navigation`.
    pub fn related(&self, entry: EntryId, navigation: &str) -> Result<Vec<EntryId>> {
        let set_name = self.tracked(entry)?.entity_set.name().to_string();
        let (association, index) = self.workspace.resolve_navigation(&set_name, navigation)?;
        Ok(self
            .live_relationships_at(entry, &association.name, index)
            .into_iter()
            .map(|(_, other)| other)
            .collect())
    }

    // ========================================================================
    // Navigation values
    // ========================================================================

    /// Store each end's entity in the other end's navigation property.
    pub(crate) fn link_navigations(&mut self, relationship: RelationshipId) {
        self.for_each_navigation(relationship, |entity, nav, target, is_reference| {
            entity.link_navigation(nav, target, is_reference);
        });
    }

    /// Remove each end's entity from the other end's navigation property.
    pub(crate) fn unlink_navigations(&mut self, relationship: RelationshipId) {
        self.for_each_navigation(relationship, |entity, nav, target, _| {
            entity.unlink_navigation(nav, target);
        });
    }

    fn for_each_navigation(
        &self,
        relationship: RelationshipId,
        mut f: impl FnMut(&crate::entity::EntityObject, &str, &crate::entity::EntityObject, bool),
    ) {
        let Some(rel) = self.relationships.get(&relationship) else {
            return;
        };
        let entities: Vec<_> = rel
            .keys
            .iter()
            .map(|k| {
                self.key_index
                    .get(k)
                    .and_then(|id| self.entries.get(id))
                    .and_then(|e| e.entity.clone().map(|entity| (e.entity_set.name().to_string(), entity)))
            })
            .collect();
        for index in 0..2 {
            let (Some((set_name, entity)), Some((_, target))) = (&entities[index], &entities[1 - index])
            else {
                continue;
            };
            let Some(nav) = self
                .workspace
                .navigation_for_end(set_name, &rel.association, index)
            else {
                continue;
            };
            let is_reference = rel.association.end(1 - index).multiplicity.is_reference();
            f(entity, &nav.name, target, is_reference);
        }
    }

    // ========================================================================
    // Relating entries
    // ========================================================================

    /// Create (or revive) the relationship in `association` with `a` at end
    /// `index` and `b` at the other end, and link navigation values.
    ///
    /// A reference end that already holds a different entity is an error.
    pub(crate) fn relate_entries(
        &mut self,
        a: EntryId,
        association: &Arc<AssociationSet>,
        index: usize,
        b: EntryId,
        state: EntityState,
    ) -> Result<RelationshipId> {
        let key_a = self.tracked(a)?.key.clone();
        let key_b = self.tracked(b)?.key.clone();
        let keys: [EntityKey; 2] = if index == 0 {
            [key_a, key_b]
        } else {
            [key_b, key_a]
        };
        if let Some(existing) = self.find_relationship(&association.name, &keys) {
            if self.relationships.get(&existing).is_some_and(|r| !r.is_live()) {
                self.revert_relationship_delete(existing);
            } else {
                self.link_navigations(existing);
            }
            return Ok(existing);
        }

        let other = 1 - index;
        if association.end(other).multiplicity.is_reference()
            && self
                .live_relationships_at(a, &association.name, index)
                .iter()
                .any(|(_, e)| *e != b)
        {
            return Err(self.multiplicity_error(association, other, a));
        }
        if association.end(index).multiplicity.is_reference()
            && self
                .live_relationships_at(b, &association.name, other)
                .iter()
                .any(|(_, e)| *e != a)
        {
            return Err(self.multiplicity_error(association, index, b));
        }

        let rel = self.add_relationship(association, keys, state)?;
        self.link_navigations(rel);
        Ok(rel)
    }

    fn multiplicity_error(&self, association: &AssociationSet, end: usize, owner: EntryId) -> Error {
        let key = self
            .entries
            .get(&owner)
            .map_or_else(String::new, |e| e.key.to_string());
        Error::invalid_operation(
            InvalidOperationKind::ReferenceSteal,
            format!(
                "{} already has a '{}' in '{}'; the end allows at most one",
                key,
                association.end(end).role,
                association.name
            ),
        )
    }

    /// Resolve `navigation` on `entry` and check that `target` belongs at its
    /// other end.
    fn navigation_ends(
        &self,
        entry: EntryId,
        navigation: &str,
        target: EntryId,
    ) -> Result<(Arc<AssociationSet>, usize)> {
        let set_name = self.tracked(entry)?.entity_set.name().to_string();
        let (association, index) = self.workspace.resolve_navigation(&set_name, navigation)?;
        let target_set = self.tracked(target)?.entity_set.name().to_string();
        if association.end(1 - index).entity_set != target_set {
            return Err(Error::argument(
                "target",
                format!(
                    "'{}' relates to '{}', not '{}'",
                    navigation,
                    association.end(1 - index).entity_set,
                    target_set
                ),
            ));
        }
        Ok((association, index))
    }

    /// Dependent and principal entries of an FK relationship between `a` at
    /// end `index` and `b`.
    pub(crate) fn foreign_key_roles(
        association: &AssociationSet,
        a: EntryId,
        index: usize,
        b: EntryId,
    ) -> Option<(EntryId, EntryId)> {
        let dependent = association.dependent_index()?;
        Some(if dependent == index { (a, b) } else { (b, a) })
    }

    /// Relate `entry` to `target` through `navigation`, as a caller setting a
    /// reference or adding to a collection would.
    ///
    /// Reference ends that already point elsewhere are released first. In a
    /// foreign key association the dependent's foreign key takes the
    /// principal's key values.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn relate(&mut self, entry: EntryId, navigation: &str, target: EntryId) -> Result<RelationshipId> {
        let (association, index) = self.navigation_ends(entry, navigation, target)?;
        if self.tracked(entry)?.is_key_entry() {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyEntry,
                "cannot relate from a key entry",
            ));
        }
        for id in [entry, target] {
            if self.state_of(id) == EntityState::Deleted {
                return Err(Error::invalid_operation(
                    InvalidOperationKind::InvalidState,
                    format!("cannot relate {}: the entity is deleted", id),
                ));
            }
        }

        let other = 1 - index;
        let mut released: Vec<(RelationshipId, EntryId, usize, EntryId)> = Vec::new();
        if association.end(other).multiplicity.is_reference() {
            for (rel, e) in self.live_relationships_at(entry, &association.name, index) {
                if e != target {
                    released.push((rel, entry, index, e));
                }
            }
        }
        if association.end(index).multiplicity.is_reference() {
            for (rel, e) in self.live_relationships_at(target, &association.name, other) {
                if e != entry {
                    released.push((rel, target, other, e));
                }
            }
        }
        for (rel, a, a_index, b) in released {
            if let Some((dependent, _)) = Self::foreign_key_roles(&association, a, a_index, b) {
                if dependent != entry && dependent != target {
                    self.null_foreign_key(dependent, &association)?;
                }
            }
            self.delete_relationship(rel);
        }

        let rel = self.relate_entries(entry, &association, index, target, EntityState::Added)?;
        if let Some((dependent, principal)) = Self::foreign_key_roles(&association, entry, index, target) {
            self.sync_foreign_key_to_principal(dependent, &association, principal)?;
        }
        tracing::debug!(relationship = %rel, association = %association.name, "Related entities");
        Ok(rel)
    }

    /// Copy `principal`'s key into `dependent`'s foreign key and cache it.
    pub(crate) fn sync_foreign_key_to_principal(
        &mut self,
        dependent: EntryId,
        association: &Arc<AssociationSet>,
        principal: EntryId,
    ) -> Result<()> {
        if self.entries.get(&dependent).is_none_or(|e| e.is_key_entry()) {
            return Ok(());
        }
        let Some(values) = self.principal_key_values(principal) else {
            return Ok(());
        };
        if values.iter().all(|m| !m.value.is_null()) {
            self.write_foreign_key(dependent, association, &values)?;
        }
        let principal_key = self
            .entries
            .get(&principal)
            .map(|e| e.key.clone())
            .filter(EntityKey::is_permanent);
        if let Some(key) = &principal_key {
            self.remove_dangling(key, dependent);
        }
        self.cache_foreign_key(dependent, &association.name, principal_key);
        self.forget_conceptual_null(dependent, false);
        Ok(())
    }

    /// Remove the relationship between `entry` and `target` through
    /// `navigation`, nulling the dependent's foreign key in a foreign key
    /// association.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn unrelate(&mut self, entry: EntryId, navigation: &str, target: EntryId) -> Result<()> {
        let (association, index) = self.navigation_ends(entry, navigation, target)?;
        let Some((rel, _)) = self
            .live_relationships_at(entry, &association.name, index)
            .into_iter()
            .find(|(_, e)| *e == target)
        else {
            return Err(Error::argument(
                "target",
                format!("{} is not related to {} through '{}'", target, entry, navigation),
            ));
        };
        if let Some((dependent, _)) = Self::foreign_key_roles(&association, entry, index, target) {
            self.null_foreign_key(dependent, &association)?;
        }
        self.delete_relationship(rel);
        Ok(())
    }

    /// Move the relationship between `entry` and `target` through
    /// `navigation` to `state`, creating it if needed.
    ///
    /// Only independent associations have relationship state of their own;
    /// foreign key associations are changed through their foreign key.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn change_relationship_state(
        &mut self,
        entry: EntryId,
        navigation: &str,
        target: EntryId,
        state: EntityState,
    ) -> Result<Option<RelationshipId>> {
        let (association, index) = self.navigation_ends(entry, navigation, target)?;
        if association.is_foreign_key() {
            return Err(Error::invalid_operation(
                InvalidOperationKind::InvalidState,
                format!(
                    "'{}' is a foreign key association; change the foreign key instead",
                    association.name
                ),
            ));
        }
        let states = [self.state_of(entry), self.state_of(target)];
        let any_deleted = states.contains(&EntityState::Deleted);
        let any_added = states.contains(&EntityState::Added);
        let invalid = match state {
            EntityState::Added => any_deleted,
            EntityState::Unchanged => any_deleted || any_added,
            EntityState::Deleted => any_added,
            EntityState::Detached => false,
            EntityState::Modified => {
                return Err(Error::argument(
                    "state",
                    "relationships cannot be Modified",
                ));
            }
        };
        if invalid {
            return Err(Error::invalid_operation(
                InvalidOperationKind::InvalidState,
                format!(
                    "cannot move a relationship between {} ({}) and {} ({}) to {}",
                    entry, states[0], target, states[1], state
                ),
            ));
        }

        let key_entry = self.tracked(entry)?.key.clone();
        let key_target = self.tracked(target)?.key.clone();
        let keys = if index == 0 {
            [key_entry, key_target]
        } else {
            [key_target, key_entry]
        };
        let existing = self.find_relationship(&association.name, &keys);

        match state {
            EntityState::Added | EntityState::Unchanged => {
                let rel = match existing {
                    Some(rel) => {
                        self.revert_relationship_delete(rel);
                        rel
                    }
                    None => self.relate_entries(entry, &association, index, target, state)?,
                };
                if let Some(r) = self.relationships.get_mut(&rel) {
                    r.state = state;
                }
                Ok(Some(rel))
            }
            EntityState::Deleted => {
                let rel = existing.ok_or_else(|| {
                    Error::argument(
                        "target",
                        format!("{} is not related to {} through '{}'", target, entry, navigation),
                    )
                })?;
                self.delete_relationship(rel);
                Ok(self.relationships.contains_key(&rel).then_some(rel))
            }
            EntityState::Detached => {
                if let Some(rel) = existing {
                    self.detach_relationship_and_orphans(rel);
                }
                Ok(None)
            }
            EntityState::Modified => Ok(None),
        }
    }
}
