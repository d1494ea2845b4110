//! Batch change detection for entities that do not report their own changes.
//!
//! [`StateManager::detect_changes`] compares every tracked entity against
//! what the tracker last saw: scalar and complex members against their
//! snapshots, navigation properties against the live relationships, and
//! foreign key values against the keys cached at the last fix-up. It then
//! brings relationships and foreign keys back into agreement.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use entitystate_core::{AssociationSet, Error, InvalidOperationKind, Result};
use serde::Serialize;

use crate::entity::EntityObject;
use crate::entity_key::EntityKey;
use crate::entry::{EntityState, EntryId};
use crate::relationship::RelationshipId;
use crate::state_manager::{PropertyChange, StateManager};
use crate::transaction::Scope;

/// What one [`StateManager::detect_changes`] pass found and changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectChangesReport {
    /// Members found to differ from their originals.
    pub property_changes: Vec<PropertyChange>,
    pub added_relationships: Vec<RelationshipId>,
    /// Relationships deleted or removed while aligning.
    pub removed_relationships: Vec<RelationshipId>,
    /// Entities reached through a navigation property and added.
    pub added_entities: Vec<EntryId>,
}

impl DetectChangesReport {
    pub fn is_empty(&self) -> bool {
        self.property_changes.is_empty()
            && self.added_relationships.is_empty()
            && self.removed_relationships.is_empty()
            && self.added_entities.is_empty()
    }
}

/// A navigation property holds an entity it has no live relationship to.
struct NavigationAdd {
    entry: EntryId,
    navigation: String,
    association: Arc<AssociationSet>,
    index: usize,
    target: EntityObject,
}

/// A live relationship whose partner is missing from the navigation property.
struct NavigationRemove {
    relationship: RelationshipId,
    association: Arc<AssociationSet>,
    entry: EntryId,
    index: usize,
    partner: EntryId,
}

/// A dependent whose foreign key no longer matches the cached key.
#[derive(Clone)]
struct ForeignKeyChange {
    dependent: EntryId,
    association: Arc<AssociationSet>,
}

impl ForeignKeyChange {
    fn is_for(&self, dependent: EntryId, association: &AssociationSet) -> bool {
        self.dependent == dependent && self.association.name == association.name
    }
}

impl StateManager {
    /// Find changes made directly to tracked entities and align the graph
    /// with them.
    ///
    /// A nested call while a pass is already running does nothing and
    /// returns an empty report.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detect_changes(&mut self) -> Result<DetectChangesReport> {
        let Some(_scope) = self.transaction.try_enter(Scope::DetectChanges) else {
            tracing::debug!("Change detection already running; nested call skipped");
            return Ok(DetectChangesReport::default());
        };
        let live_before = self.live_relationship_ids();
        let first_new_entry = self.next_entry_id;

        let candidates: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| {
                !e.is_key_entry()
                    && matches!(
                        e.state,
                        EntityState::Added | EntityState::Unchanged | EntityState::Modified
                    )
            })
            .map(|e| e.id)
            .collect();

        let (adds, removes) = self.detect_navigation_changes(&candidates);

        let mut report = DetectChangesReport::default();
        for &id in &candidates {
            if !matches!(self.state_of(id), EntityState::Unchanged | EntityState::Modified) {
                continue;
            }
            for property in self.detect_changes_in_properties(id, false, true)? {
                report.property_changes.push(PropertyChange { entry: id, property });
            }
        }

        let changed_foreign_keys = self.detect_foreign_key_changes(&candidates)?;
        let foreign_key_fixups = self.check_conflicting_changes(&adds, &changed_foreign_keys)?;

        self.align_navigation_removals(&removes, &adds, &changed_foreign_keys)?;
        self.align_navigation_adds(adds)?;
        for change in foreign_key_fixups {
            if self.entries.get(&change.dependent).is_some_and(|e| !e.is_key_entry()) {
                self.fixup_entity_reference_by_foreign_key(change.dependent, &change.association)?;
            }
        }

        let live_after = self.live_relationship_ids();
        report.added_relationships = live_after.difference(&live_before).copied().collect();
        report.removed_relationships = live_before.difference(&live_after).copied().collect();
        report.added_entities = self
            .entries
            .values()
            .filter(|e| e.id.0 >= first_new_entry && !e.is_key_entry())
            .map(|e| e.id)
            .collect();

        tracing::debug!(
            properties = report.property_changes.len(),
            added = report.added_relationships.len(),
            removed = report.removed_relationships.len(),
            entities = report.added_entities.len(),
            "Detected changes"
        );
        Ok(report)
    }

    fn live_relationship_ids(&self) -> BTreeSet<RelationshipId> {
        self.relationships
            .values()
            .filter(|r| r.is_live())
            .map(|r| r.id)
            .collect()
    }

    fn detect_navigation_changes(&self, ids: &[EntryId]) -> (Vec<NavigationAdd>, Vec<NavigationRemove>) {
        let mut adds = Vec::new();
        let mut removes: Vec<NavigationRemove> = Vec::new();
        for &id in ids {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            let Some(entity) = entry.entity.clone() else {
                continue;
            };
            let set_name = entry.entity_set.name().to_string();
            for (association, index) in self.workspace.association_ends_for(&set_name) {
                let Some(nav) = self.workspace.navigation_for_end(&set_name, &association, index) else {
                    continue;
                };
                let targets = entity.navigation_targets(&nav.name);
                let live: Vec<(RelationshipId, EntryId, EntityObject)> = self
                    .live_relationships_at(id, &association.name, index)
                    .into_iter()
                    .filter_map(|(rel, partner)| {
                        let partner_entity = self.entries.get(&partner)?.entity.clone()?;
                        Some((rel, partner, partner_entity))
                    })
                    .collect();

                for target in &targets {
                    if !live.iter().any(|(_, _, e)| e.ptr_eq(target)) {
                        adds.push(NavigationAdd {
                            entry: id,
                            navigation: nav.name.clone(),
                            association: Arc::clone(&association),
                            index,
                            target: target.clone(),
                        });
                    }
                }
                for (rel, partner, partner_entity) in live {
                    if targets.iter().any(|t| t.ptr_eq(&partner_entity)) {
                        continue;
                    }
                    if removes.iter().any(|r| r.relationship == rel) {
                        continue;
                    }
                    removes.push(NavigationRemove {
                        relationship: rel,
                        association: Arc::clone(&association),
                        entry: id,
                        index,
                        partner,
                    });
                }
            }
        }
        (adds, removes)
    }

    /// Dependents whose foreign key values no longer name the principal
    /// the tracker last related them to.
    fn detect_foreign_key_changes(&self, ids: &[EntryId]) -> Result<Vec<ForeignKeyChange>> {
        let mut changes = Vec::new();
        for &id in ids {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            let Some(entity) = entry.entity.clone() else {
                continue;
            };
            let set_name = entry.entity_set.name().to_string();
            for association in self.workspace.foreign_key_dependent_ends(&set_name) {
                let current = self.foreign_key_for(&entity, &association)?;
                let cached = entry.cached_foreign_key(&association.name);
                let changed = match (cached, &current) {
                    (Some(cached), current) if cached.is_conceptual_null() => {
                        current.as_ref().is_some_and(|k| cached.conceptual_null_changed(k))
                    }
                    (None, None) => false,
                    (Some(cached), Some(current)) => cached != current,
                    _ => true,
                };
                if !changed {
                    continue;
                }
                // An Added principal leaves no cached key; a foreign key that
                // still names the related principal has not moved.
                if let Some(key) = &current {
                    if self
                        .principal_of(id, &association)
                        .is_some_and(|(_, principal)| self.principal_matches_key(principal, key))
                    {
                        continue;
                    }
                }
                changes.push(ForeignKeyChange {
                    dependent: id,
                    association,
                });
            }
        }
        Ok(changes)
    }

    /// Fail if a navigation change and a foreign key change on the same
    /// dependent name different principals. Foreign key changes a
    /// navigation change already covers are dropped from the result.
    fn check_conflicting_changes(
        &self,
        adds: &[NavigationAdd],
        changes: &[ForeignKeyChange],
    ) -> Result<Vec<ForeignKeyChange>> {
        let mut remaining = changes.to_vec();
        for add in adds {
            let Some(dependent_index) = add.association.dependent_index() else {
                continue;
            };
            let Some(entry_entity) = self.entries.get(&add.entry).and_then(|e| e.entity.clone()) else {
                continue;
            };
            let (dependent, dependent_entity, principal_entity) = if dependent_index == add.index {
                (Some(add.entry), entry_entity, add.target.clone())
            } else {
                (self.entry_for(&add.target), add.target.clone(), entry_entity)
            };
            let Some(dependent) = dependent else {
                continue;
            };
            let Some(pos) = remaining.iter().position(|c| c.is_for(dependent, &add.association)) else {
                continue;
            };
            let agrees = match self.foreign_key_for(&dependent_entity, &add.association)? {
                Some(key) => entity_has_key(&principal_entity, &key),
                None => false,
            };
            if !agrees {
                return Err(Error::invalid_operation(
                    InvalidOperationKind::ConflictingChanges,
                    format!(
                        "{} has conflicting navigation and foreign key changes in '{}'",
                        dependent, add.association.name
                    ),
                ));
            }
            remaining.remove(pos);
        }
        Ok(remaining)
    }

    fn align_navigation_removals(
        &mut self,
        removes: &[NavigationRemove],
        adds: &[NavigationAdd],
        changed_foreign_keys: &[ForeignKeyChange],
    ) -> Result<()> {
        for remove in removes {
            if !self.relationships.get(&remove.relationship).is_some_and(|r| r.is_live()) {
                continue;
            }
            if let Some((dependent, _)) =
                Self::foreign_key_roles(&remove.association, remove.entry, remove.index, remove.partner)
            {
                let foreign_key_moved = changed_foreign_keys
                    .iter()
                    .any(|c| c.is_for(dependent, &remove.association));
                let repointed = adds
                    .iter()
                    .any(|a| a.entry == dependent && a.association.name == remove.association.name);
                if !foreign_key_moved && !repointed {
                    self.null_foreign_key(dependent, &remove.association)?;
                }
            }
            self.delete_relationship(remove.relationship);
            tracing::debug!(
                relationship = %remove.relationship,
                association = %remove.association.name,
                "Removed relationship missing from navigation"
            );
        }
        Ok(())
    }

    fn align_navigation_adds(&mut self, adds: Vec<NavigationAdd>) -> Result<()> {
        let mut seen: HashSet<(EntryId, EntryId, String)> = HashSet::new();
        for add in adds {
            if self.entries.get(&add.entry).is_none_or(|e| e.is_key_entry()) {
                continue;
            }
            let target = match self.entry_for(&add.target) {
                Some(target) => target,
                None => {
                    let set = add.association.end(1 - add.index).entity_set.clone();
                    self.add_object(&set, &add.target)?
                }
            };
            if self.state_of(target) == EntityState::Deleted {
                return Err(Error::invalid_operation(
                    InvalidOperationKind::InvalidState,
                    format!(
                        "'{}' of {} refers to deleted {}",
                        add.navigation, add.entry, target
                    ),
                ));
            }
            if !seen.insert((add.entry, target, add.association.name.clone())) {
                continue;
            }
            if self
                .live_relationships_at(add.entry, &add.association.name, add.index)
                .iter()
                .any(|(_, partner)| *partner == target)
            {
                continue;
            }
            self.relate(add.entry, &add.navigation, target)?;
        }
        Ok(())
    }
}

/// Whether `entity`'s key members carry the values in `key`.
fn entity_has_key(entity: &EntityObject, key: &EntityKey) -> bool {
    key.members().iter().all(|m| {
        entity
            .scalar(&m.name)
            .is_some_and(|value| value.is_identical(&m.value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{customer, line, order, order_customer_workspace};
    use entitystate_core::Value;
    use std::rc::Rc;

    #[test]
    fn test_detects_property_changes() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        c.set("Name", "Grace").unwrap();

        let report = sm.detect_changes().unwrap();
        assert_eq!(
            report.property_changes,
            vec![PropertyChange {
                entry: id,
                property: "Name".to_string()
            }]
        );
        assert_eq!(sm.state_of(id), EntityState::Modified);
    }

    #[test]
    fn test_collection_add_relates_and_sets_foreign_key() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let o = order(&ws, 10, None);
        let customer_id = sm.attach("Customers", &c).unwrap();
        let order_id = sm.attach("Orders", &o).unwrap();

        c.add_to_collection("Orders", &o).unwrap();
        let report = sm.detect_changes().unwrap();

        assert_eq!(report.added_relationships.len(), 1);
        assert_eq!(sm.related(customer_id, "Orders").unwrap(), vec![order_id]);
        assert_eq!(o.scalar("CustomerId"), Some(Value::from(1_i64)));
        assert!(o.reference("Customer").is_some_and(|r| r.ptr_eq(&c)));
        assert_eq!(sm.state_of(order_id), EntityState::Modified);
    }

    #[test]
    fn test_cleared_reference_nulls_foreign_key() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let o = order(&ws, 10, Some(1));
        let customer_id = sm.attach("Customers", &c).unwrap();
        let order_id = sm.attach("Orders", &o).unwrap();

        o.set_reference("Customer", None).unwrap();
        let report = sm.detect_changes().unwrap();

        assert_eq!(report.removed_relationships.len(), 1);
        assert_eq!(o.scalar("CustomerId"), Some(Value::Null));
        assert!(c.collection("Orders").is_empty());
        assert!(sm.related(customer_id, "Orders").unwrap().is_empty());
        assert_eq!(sm.state_of(order_id), EntityState::Modified);
    }

    #[test]
    fn test_foreign_key_change_moves_reference() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c1 = customer(&ws, 1, "Ada");
        let c2 = customer(&ws, 2, "Grace");
        let o = order(&ws, 10, Some(1));
        sm.attach("Customers", &c1).unwrap();
        let second = sm.attach("Customers", &c2).unwrap();
        let order_id = sm.attach("Orders", &o).unwrap();

        o.set("CustomerId", 2_i64).unwrap();
        let report = sm.detect_changes().unwrap();

        assert!(report
            .property_changes
            .iter()
            .any(|p| p.entry == order_id && p.property == "CustomerId"));
        assert!(o.reference("Customer").is_some_and(|r| r.ptr_eq(&c2)));
        assert!(c1.collection("Orders").is_empty());
        assert_eq!(sm.related(order_id, "Customer").unwrap(), vec![second]);
    }

    #[test]
    fn test_matching_reference_and_foreign_key_changes() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c1 = customer(&ws, 1, "Ada");
        let c2 = customer(&ws, 2, "Grace");
        let o = order(&ws, 10, Some(1));
        sm.attach("Customers", &c1).unwrap();
        let second = sm.attach("Customers", &c2).unwrap();
        let order_id = sm.attach("Orders", &o).unwrap();

        o.set("CustomerId", 2_i64).unwrap();
        o.set_reference("Customer", Some(c2.clone())).unwrap();
        sm.detect_changes().unwrap();

        assert_eq!(sm.related(order_id, "Customer").unwrap(), vec![second]);
        assert_eq!(o.scalar("CustomerId"), Some(Value::from(2_i64)));
        assert!(c1.collection("Orders").is_empty());
    }

    #[test]
    fn test_conflicting_reference_and_foreign_key_changes() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c1 = customer(&ws, 1, "Ada");
        let c3 = customer(&ws, 3, "Linus");
        let o = order(&ws, 10, Some(1));
        sm.attach("Customers", &c1).unwrap();
        sm.attach("Customers", &customer(&ws, 2, "Grace")).unwrap();
        sm.attach("Customers", &c3).unwrap();
        sm.attach("Orders", &o).unwrap();

        o.set("CustomerId", 2_i64).unwrap();
        o.set_reference("Customer", Some(c3)).unwrap();
        let err = sm.detect_changes().unwrap_err();
        assert_eq!(
            err.invalid_operation_kind(),
            Some(InvalidOperationKind::ConflictingChanges)
        );
    }

    #[test]
    fn test_untracked_target_is_added() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let o = order(&ws, 10, None);
        let order_id = sm.attach("Orders", &o).unwrap();
        let l = line(&ws, 100, 0);

        o.add_to_collection("Lines", &l).unwrap();
        let report = sm.detect_changes().unwrap();

        assert_eq!(report.added_entities.len(), 1);
        let line_id = report.added_entities[0];
        assert_eq!(sm.state_of(line_id), EntityState::Added);
        assert_eq!(sm.entry_for(&l), Some(line_id));
        assert_eq!(l.scalar("OrderId"), Some(Value::from(10_i64)));
        assert_eq!(sm.related(order_id, "Lines").unwrap(), vec![line_id]);
    }

    #[test]
    fn test_deleted_target_is_rejected() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let o = order(&ws, 10, None);
        sm.attach("Customers", &c).unwrap();
        let order_id = sm.attach("Orders", &o).unwrap();
        sm.delete(order_id).unwrap();

        c.add_to_collection("Orders", &o).unwrap();
        let err = sm.detect_changes().unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::InvalidState));
    }

    #[test]
    fn test_nested_detect_changes_is_skipped() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        c.set("Name", "Grace").unwrap();

        let transaction = Rc::clone(sm.transaction());
        {
            let _running = transaction.enter(Scope::DetectChanges);
            assert!(sm.detect_changes().unwrap().is_empty());
            assert_eq!(sm.state_of(id), EntityState::Unchanged);
        }
        assert!(!sm.detect_changes().unwrap().is_empty());
        assert_eq!(sm.state_of(id), EntityState::Modified);
    }

    #[test]
    fn test_enumeration_runs_detection() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        c.set("Name", "Grace").unwrap();
        assert_eq!(sm.entries_in(&[EntityState::Modified]).unwrap(), vec![id]);
    }

    #[test]
    fn test_report_serializes() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        sm.attach("Customers", &c).unwrap();
        c.set("Name", "Grace").unwrap();
        let json = serde_json::to_value(sm.detect_changes().unwrap()).unwrap();
        assert_eq!(json["property_changes"][0]["property"], "Name");
        assert!(json["added_entities"].as_array().is_some_and(Vec::is_empty));
    }
}
