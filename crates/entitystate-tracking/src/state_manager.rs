//! The object state manager.
//!
//! [`StateManager`] is the authoritative registry of entity entries for one
//! unit of work. It owns:
//!
//! - entries by [`EntryId`], by [`EntityKey`] and by object identity
//! - the relationship arena and its `(association, keys)` index
//! - the dangling foreign key index: dependents whose principal is not tracked
//! - the set of entries holding a conceptual-null foreign key
//! - the [`TransactionManager`] scopes that change fix-up behaviour
//!
//! The operations are split across modules by concern; this module holds
//! the registry itself, graph add/attach and key stubs.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use entitystate_core::{
    EntitySet, Error, InvalidOperationKind, MetadataWorkspace, Result, StructuralType,
};
use serde::Serialize;

use crate::entity::{ChangeTrackingFlags, EntityObject, ObjectId};
use crate::entity_key::{EntityKey, EntityKeyMember};
use crate::entry::{EntityEntry, EntityState, EntryId};
use crate::relationship::{RelationshipEntry, RelationshipId, RelationshipWrapper};
use crate::transaction::{Scope, TransactionManager};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for state manager behaviour.
#[derive(Debug, Clone)]
pub struct StateManagerConfig {
    /// Run detect-changes before enumerating entries by a state that
    /// property changes can affect (Unchanged or Modified).
    pub detect_changes_before_enumeration: bool,
    /// Follow cascade-delete rules of associations in `delete_object`.
    pub cascade_deletes: bool,
    /// Walk and count relationship lists after every list mutation.
    pub validate_relationship_lists: bool,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            detect_changes_before_enumeration: true,
            cascade_deletes: true,
            validate_relationship_lists: cfg!(debug_assertions),
        }
    }
}

impl StateManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn detect_changes_before_enumeration(mut self, value: bool) -> Self {
        self.detect_changes_before_enumeration = value;
        self
    }

    #[must_use]
    pub fn cascade_deletes(mut self, value: bool) -> Self {
        self.cascade_deletes = value;
        self
    }

    #[must_use]
    pub fn validate_relationship_lists(mut self, value: bool) -> Self {
        self.validate_relationship_lists = value;
        self
    }
}

// ============================================================================
// Events
// ============================================================================

/// An entry moved from one state to another.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub entry: EntryId,
    pub key: EntityKey,
    pub from: EntityState,
    pub to: EntityState,
}

/// A member of a tracked entity was found or reported changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyChange {
    pub entry: EntryId,
    /// Dotted member path, e.g. `Address.City`.
    pub property: String,
}

type StateChangedFn = Box<dyn FnMut(&StateChange)>;
type PropertyChangedFn = Box<dyn FnMut(&PropertyChange)>;

/// Callbacks fired by the state manager.
#[derive(Default)]
pub struct StateManagerEvents {
    state_changed: Vec<StateChangedFn>,
    property_changed: Vec<PropertyChangedFn>,
}

impl fmt::Debug for StateManagerEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManagerEvents")
            .field("state_changed", &self.state_changed.len())
            .field("property_changed", &self.property_changed.len())
            .finish()
    }
}

impl StateManagerEvents {
    /// Register a callback fired after every entry state transition.
    pub fn on_state_changed(&mut self, f: impl FnMut(&StateChange) + 'static) {
        self.state_changed.push(Box::new(f));
    }

    /// Register a callback fired when a member is marked modified.
    pub fn on_property_changed(&mut self, f: impl FnMut(&PropertyChange) + 'static) {
        self.property_changed.push(Box::new(f));
    }

    fn fire_state_changed(&mut self, change: &StateChange) {
        for cb in &mut self.state_changed {
            cb(change);
        }
    }

    fn fire_property_changed(&mut self, change: &PropertyChange) {
        for cb in &mut self.property_changed {
            cb(change);
        }
    }
}

// ============================================================================
// Debug snapshot
// ============================================================================

/// Serializable dump of the tracker, for debugging and tests.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub entries: Vec<EntrySnapshot>,
    pub relationships: Vec<RelationshipSnapshot>,
    pub conceptual_nulls: Vec<EntryId>,
    pub dangling_foreign_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub entity_set: String,
    pub key: String,
    pub state: EntityState,
    pub is_key_entry: bool,
    pub modified_properties: Vec<String>,
    pub relationship_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipSnapshot {
    pub id: RelationshipId,
    pub association: String,
    pub keys: [String; 2],
    pub state: EntityState,
}

// ============================================================================
// State manager
// ============================================================================

/// Registry of tracked entities and their relationships.
pub struct StateManager {
    pub(crate) workspace: Arc<MetadataWorkspace>,
    pub(crate) config: StateManagerConfig,
    pub(crate) transaction: Rc<TransactionManager>,
    pub(crate) entries: BTreeMap<EntryId, EntityEntry>,
    pub(crate) key_index: HashMap<EntityKey, EntryId>,
    pub(crate) object_index: HashMap<ObjectId, EntryId>,
    pub(crate) relationships: BTreeMap<RelationshipId, RelationshipEntry>,
    pub(crate) relationship_index: HashMap<RelationshipWrapper, RelationshipId>,
    /// Principal key -> dependents whose foreign key points at it but which
    /// are not related to a tracked principal.
    pub(crate) dangling_foreign_keys: HashMap<EntityKey, BTreeSet<EntryId>>,
    pub(crate) conceptual_nulls: BTreeSet<EntryId>,
    pub(crate) next_entry_id: u64,
    pub(crate) next_relationship_id: u64,
    events: StateManagerEvents,
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("entries", &self.entries.len())
            .field("relationships", &self.relationships.len())
            .field("conceptual_nulls", &self.conceptual_nulls.len())
            .field("config", &self.config)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl StateManager {
    pub fn new(workspace: Arc<MetadataWorkspace>) -> Self {
        Self::with_config(workspace, StateManagerConfig::default())
    }

    pub fn with_config(workspace: Arc<MetadataWorkspace>, config: StateManagerConfig) -> Self {
        Self {
            workspace,
            config,
            transaction: TransactionManager::new(),
            entries: BTreeMap::new(),
            key_index: HashMap::new(),
            object_index: HashMap::new(),
            relationships: BTreeMap::new(),
            relationship_index: HashMap::new(),
            dangling_foreign_keys: HashMap::new(),
            conceptual_nulls: BTreeSet::new(),
            next_entry_id: 1,
            next_relationship_id: 1,
            events: StateManagerEvents::default(),
        }
    }

    pub fn workspace(&self) -> &Arc<MetadataWorkspace> {
        &self.workspace
    }

    pub fn config(&self) -> &StateManagerConfig {
        &self.config
    }

    /// Register event callbacks.
    pub fn events_mut(&mut self) -> &mut StateManagerEvents {
        &mut self.events
    }

    pub fn transaction(&self) -> &Rc<TransactionManager> {
        &self.transaction
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn entry(&self, id: EntryId) -> Option<&EntityEntry> {
        self.entries.get(&id)
    }

    /// State of `id`; entries no longer tracked are Detached.
    pub fn state_of(&self, id: EntryId) -> EntityState {
        self.entries
            .get(&id)
            .map_or(EntityState::Detached, |e| e.state)
    }

    /// Entry tracking `entity`, if any.
    pub fn entry_for(&self, entity: &EntityObject) -> Option<EntryId> {
        self.object_index.get(&entity.id()).copied()
    }

    /// Entry (full or key stub) registered under `key`.
    pub fn find_entry(&self, key: &EntityKey) -> Option<EntryId> {
        self.key_index.get(key).copied()
    }

    /// Every entry, in creation order.
    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full entries (not key stubs) in any of `states`, in creation order.
    ///
    /// When configured, runs detect-changes first if the filter includes a
    /// state that property changes can affect.
    pub fn entries_in(&mut self, states: &[EntityState]) -> Result<Vec<EntryId>> {
        if self.config.detect_changes_before_enumeration
            && states
                .iter()
                .any(|s| matches!(s, EntityState::Unchanged | EntityState::Modified))
        {
            self.detect_changes()?;
        }
        Ok(self
            .entries
            .values()
            .filter(|e| !e.is_key_entry() && states.contains(&e.state))
            .map(|e| e.id)
            .collect())
    }

    /// Entries holding an unresolved conceptual-null foreign key.
    pub fn conceptual_null_entries(&self) -> Vec<EntryId> {
        self.conceptual_nulls.iter().copied().collect()
    }

    /// Dump the tracker for debugging.
    pub fn snapshot(&self) -> TrackerSnapshot {
        let entries = self
            .entries
            .values()
            .map(|e| EntrySnapshot {
                id: e.id,
                entity_set: e.entity_set.name().to_string(),
                key: e.key.to_string(),
                state: e.state,
                is_key_entry: e.is_key_entry(),
                modified_properties: self.modified_names(e),
                relationship_count: e.relationship_count,
            })
            .collect();
        let relationships = self
            .relationships
            .values()
            .map(|r| RelationshipSnapshot {
                id: r.id,
                association: r.association.name.clone(),
                keys: [r.keys[0].to_string(), r.keys[1].to_string()],
                state: r.state,
            })
            .collect();
        let mut dangling: Vec<String> = self
            .dangling_foreign_keys
            .keys()
            .map(ToString::to_string)
            .collect();
        dangling.sort();
        TrackerSnapshot {
            entries,
            relationships,
            conceptual_nulls: self.conceptual_null_entries(),
            dangling_foreign_keys: dangling,
        }
    }

    pub(crate) fn modified_names(&self, entry: &EntityEntry) -> Vec<String> {
        let ty = entry.entity_set.element_type();
        entry
            .modified_fields
            .as_ref()
            .map(|bits| {
                bits.iter()
                    .filter_map(|o| <entitystate_core::EntityType as StructuralType>::member(ty, o).map(|m| m.name().to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Internal registry helpers
    // ========================================================================

    /// The entry for `id`, failing if it is no longer tracked.
    pub(crate) fn tracked(&self, id: EntryId) -> Result<&EntityEntry> {
        self.entries.get(&id).ok_or_else(|| {
            Error::invalid_operation(
                InvalidOperationKind::Detached,
                format!("entry {} is not tracked by this state manager", id),
            )
        })
    }

    pub(crate) fn tracked_mut(&mut self, id: EntryId) -> Result<&mut EntityEntry> {
        self.entries.get_mut(&id).ok_or_else(|| {
            Error::invalid_operation(
                InvalidOperationKind::Detached,
                format!("entry {} is not tracked by this state manager", id),
            )
        })
    }

    /// The entity behind `id`, failing for key stubs.
    pub(crate) fn entity_of(&self, id: EntryId) -> Result<EntityObject> {
        let entry = self.tracked(id)?;
        entry.entity.clone().ok_or_else(|| {
            Error::invalid_operation(
                InvalidOperationKind::KeyEntry,
                format!("{} is a key entry and has no entity", entry.key),
            )
        })
    }

    pub(crate) fn entity_set_named(&self, name: &str) -> Result<Arc<EntitySet>> {
        self.workspace.entity_set(name).map(Arc::clone)
    }

    /// Permanent key built from the entity's current key member values.
    pub(crate) fn key_from_values(set: &EntitySet, entity: &EntityObject) -> Result<EntityKey> {
        let members = set
            .element_type()
            .key_member_names()
            .into_iter()
            .map(|name| {
                EntityKeyMember::new(name, entity.scalar(name).unwrap_or(entitystate_core::Value::Null))
            })
            .collect();
        EntityKey::new(set.name(), members)
    }

    /// Move `id` to `state` and notify listeners.
    pub(crate) fn set_entry_state(&mut self, id: EntryId, state: EntityState) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let from = entry.state;
        if from == state {
            return;
        }
        entry.state = state;
        let change = StateChange {
            entry: id,
            key: entry.key.clone(),
            from,
            to: state,
        };
        tracing::debug!(entry = %id, key = %change.key, from = %from, to = %state, "Entry state changed");
        self.events.fire_state_changed(&change);
    }

    pub(crate) fn fire_property_changed(&mut self, id: EntryId, property: &str) {
        let change = PropertyChange {
            entry: id,
            property: property.to_string(),
        };
        tracing::trace!(entry = %id, property, "Property changed");
        self.events.fire_property_changed(&change);
    }

    /// Register a new entry for `entity`.
    fn track_entity(
        &mut self,
        set: &Arc<EntitySet>,
        entity: &EntityObject,
        key: EntityKey,
        state: EntityState,
    ) -> EntryId {
        let id = EntryId(self.next_entry_id);
        self.next_entry_id += 1;
        let entry = EntityEntry::new(
            id,
            Some(entity.clone()),
            key.clone(),
            Arc::clone(set),
            EntityState::Detached,
        );
        self.entries.insert(id, entry);
        self.key_index.insert(key.clone(), id);
        self.object_index.insert(entity.id(), id);
        entity.set_entity_key(Some(key));
        self.set_entry_state(id, state);
        id
    }

    /// Remove `id` from every index. Relationships still in its list are
    /// removed as well.
    pub(crate) fn remove_entry(&mut self, id: EntryId) {
        for rel in self.walk_relationship_list(id) {
            self.unlink_navigations(rel);
            self.remove_relationship(rel);
        }
        self.set_entry_state(id, EntityState::Detached);
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        if self.key_index.get(&entry.key) == Some(&id) {
            self.key_index.remove(&entry.key);
        }
        if let Some(entity) = &entry.entity {
            if self.object_index.get(&entity.id()) == Some(&id) {
                self.object_index.remove(&entity.id());
            }
        }
        self.remove_from_dangling_index(id);
        self.conceptual_nulls.remove(&id);
        tracing::debug!(entry = %id, key = %entry.key, "Removed entry");
    }

    fn check_entity_type(set: &EntitySet, entity: &EntityObject) -> Result<()> {
        let ty = entity.entity_type();
        if ty.type_name() != set.element_type().type_name() {
            return Err(Error::argument(
                "entity",
                format!(
                    "an entity of type '{}' cannot be tracked in '{}' of '{}'",
                    ty.type_name(),
                    set.name(),
                    set.element_type().type_name()
                ),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Key stubs
    // ========================================================================

    /// Register a key stub for `key`.
    ///
    /// Fails if the key is not permanent, its entity set is unknown or an
    /// entry already exists for it.
    pub fn add_key_entry(&mut self, key: &EntityKey) -> Result<EntryId> {
        if !key.is_permanent() {
            return Err(Error::argument(
                "key",
                format!("key entries need a permanent key, got {}", key),
            ));
        }
        let set = self.entity_set_named(key.entity_set())?;
        if let Some(existing) = self.key_index.get(key) {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyConflict,
                format!("{} is already tracked as entry {}", key, existing),
            ));
        }
        let id = EntryId(self.next_entry_id);
        self.next_entry_id += 1;
        self.entries.insert(
            id,
            EntityEntry::new(id, None, key.clone(), set, EntityState::Unchanged),
        );
        self.key_index.insert(key.clone(), id);
        tracing::debug!(entry = %id, key = %key, "Created key entry");
        Ok(id)
    }

    /// The entry registered under `key`, creating a key stub if there is none.
    pub fn get_or_add_key_entry(&mut self, key: &EntityKey) -> Result<EntryId> {
        match self.key_index.get(key) {
            Some(id) => Ok(*id),
            None => self.add_key_entry(key),
        }
    }

    /// Turn key stub `stub` into a full entry for `entity`.
    pub(crate) fn promote_key_entry(&mut self, stub: EntryId, entity: &EntityObject) -> Result<()> {
        let entry = self.tracked_mut(stub)?;
        if !entry.is_key_entry() {
            return Err(Error::invalid_operation(
                InvalidOperationKind::KeyConflict,
                format!("{} is already tracked with an entity", entry.key),
            ));
        }
        entry.entity = Some(entity.clone());
        entry.flags = entity.flavor().change_tracking_flags();
        entity.set_entity_key(Some(entry.key.clone()));
        let key = entry.key.clone();
        self.object_index.insert(entity.id(), stub);
        self.take_snapshot(stub);
        for rel in self.relationship_ends(stub) {
            let live = self.relationships.get(&rel).is_some_and(RelationshipEntry::is_live);
            if live {
                self.link_navigations(rel);
            }
        }
        tracing::debug!(entry = %stub, key = %key, "Promoted key entry");
        Ok(())
    }

    // ========================================================================
    // Add and attach
    // ========================================================================

    /// Track `entity` and every untracked entity reachable from its
    /// navigation properties as Added.
    ///
    /// Adding an entity that is already Added is a no-op; adding one tracked
    /// in any other state fails.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn add_object(&mut self, entity_set: &str, entity: &EntityObject) -> Result<EntryId> {
        let set = self.entity_set_named(entity_set)?;
        Self::check_entity_type(&set, entity)?;
        if let Some(id) = self.entry_for(entity) {
            return match self.state_of(id) {
                EntityState::Added => Ok(id),
                state => Err(Error::invalid_operation(
                    InvalidOperationKind::KeyConflict,
                    format!("the entity is already tracked as {} in state {}", id, state),
                )),
            };
        }
        let _scope = self.transaction.enter(Scope::Adding);
        let first_new = (self.next_entry_id, self.next_relationship_id);
        let id = self.track_added(&set, entity);
        let mut visited = vec![id];
        if let Err(e) = self.track_graph(&mut visited) {
            self.roll_back_tracking(&visited, first_new);
            return Err(e);
        }
        Ok(id)
    }

    /// Track `entity` and every untracked entity reachable from it as
    /// Unchanged. Key members must be set.
    ///
    /// An entity whose key matches a key stub promotes the stub.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn attach(&mut self, entity_set: &str, entity: &EntityObject) -> Result<EntryId> {
        let set = self.entity_set_named(entity_set)?;
        Self::check_entity_type(&set, entity)?;
        if let Some(id) = self.entry_for(entity) {
            return Ok(id);
        }
        let _scope = self.transaction.enter(Scope::Attaching);
        let first_new = (self.next_entry_id, self.next_relationship_id);
        let id = self.track_attached(&set, entity)?;
        let mut visited = vec![id];
        if let Err(e) = self.track_graph(&mut visited) {
            self.roll_back_tracking(&visited, first_new);
            return Err(e);
        }
        Ok(id)
    }

    fn track_added(&mut self, set: &Arc<EntitySet>, entity: &EntityObject) -> EntryId {
        let key = EntityKey::temporary(set.name());
        self.track_entity(set, entity, key, EntityState::Added)
    }

    fn track_attached(&mut self, set: &Arc<EntitySet>, entity: &EntityObject) -> Result<EntryId> {
        let key = Self::key_from_values(set, entity)?;
        if let Some(existing) = self.key_index.get(&key).copied() {
            let is_stub = self.entries.get(&existing).is_some_and(EntityEntry::is_key_entry);
            if !is_stub {
                return Err(Error::invalid_operation(
                    InvalidOperationKind::KeyConflict,
                    format!("another entity with key {} is already tracked", key),
                ));
            }
            self.promote_key_entry(existing, entity)?;
            return Ok(existing);
        }
        let id = self.track_entity(set, entity, key, EntityState::Unchanged);
        self.take_snapshot(id);
        Ok(id)
    }

    /// Walk navigation values from `root`, tracking untracked entities in
    /// the current add/attach mode and creating relationships for every
    /// link. Foreign key fix-up runs once every reachable entity is tracked.
    ///
    /// `visited` starts with the root and collects every entry reached.
    fn track_graph(&mut self, visited: &mut Vec<EntryId>) -> Result<()> {
        let adding = self.transaction.is_active(Scope::Adding);
        let mut queue: VecDeque<EntryId> = visited.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            let entity = self.entity_of(id)?;
            let set_name = self.tracked(id)?.entity_set.name().to_string();
            for (association, index) in self.workspace.association_ends_for(&set_name) {
                let Some(nav) = self.workspace.navigation_for_end(&set_name, &association, index)
                else {
                    continue;
                };
                let targets = entity.navigation_targets(&nav.name);
                if targets.is_empty() && !adding {
                    self.relate_to_detached_key(id, &entity, &association, index, &nav.name)?;
                    continue;
                }
                for target in targets {
                    let target_id = match self.entry_for(&target) {
                        Some(existing) => existing,
                        None => {
                            let target_set =
                                self.entity_set_named(&association.end(1 - index).entity_set)?;
                            Self::check_entity_type(&target_set, &target)?;
                            let tracked = if adding {
                                self.track_added(&target_set, &target)
                            } else {
                                self.track_attached(&target_set, &target)?
                            };
                            if !visited.contains(&tracked) {
                                visited.push(tracked);
                                queue.push_back(tracked);
                            }
                            tracked
                        }
                    };
                    let either_added = self.state_of(id) == EntityState::Added
                        || self.state_of(target_id) == EntityState::Added;
                    let state = if adding || either_added {
                        EntityState::Added
                    } else {
                        EntityState::Unchanged
                    };
                    let rel = self.relate_entries(id, &association, index, target_id, state)?;
                    self.align_graph_foreign_key(rel)?;
                }
            }
        }
        for id in visited.clone() {
            self.fixup_references_by_foreign_keys(id, false)?;
        }
        Ok(())
    }

    /// Undo a failed add or attach. Entries created by the call are removed
    /// and promoted stubs go back to being stubs. Navigation values on the
    /// caller's objects are left as they were.
    fn roll_back_tracking(&mut self, visited: &[EntryId], first_new: (u64, u64)) {
        let (first_entry, first_relationship) = first_new;
        for &id in visited.iter().rev() {
            for rel in self.walk_relationship_list(id) {
                if rel.0 >= first_relationship {
                    self.remove_relationship(rel);
                }
            }
            if id.0 >= first_entry {
                let entity = self.entries.get(&id).and_then(|e| e.entity.clone());
                self.remove_entry(id);
                if let Some(entity) = entity {
                    entity.set_entity_key(None);
                }
            } else if let Some(entry) = self.entries.get_mut(&id) {
                if let Some(entity) = entry.entity.take() {
                    self.object_index.remove(&entity.id());
                    entity.set_entity_key(None);
                }
                entry.flags = ChangeTrackingFlags::default();
                entry.clear_original_state();
            }
        }
        tracing::debug!(entries = visited.len(), "Rolled back graph tracking");
    }

    /// On attach, restore a relationship recorded as a detached key hint on
    /// an empty reference of an independent association.
    fn relate_to_detached_key(
        &mut self,
        id: EntryId,
        entity: &EntityObject,
        association: &Arc<entitystate_core::AssociationSet>,
        index: usize,
        navigation: &str,
    ) -> Result<()> {
        if association.is_foreign_key() || !association.end(1 - index).multiplicity.is_reference() {
            return Ok(());
        }
        let Some(key) = entity.detached_key(navigation) else {
            return Ok(());
        };
        let target = self.get_or_add_key_entry(&key)?;
        self.relate_entries(id, association, index, target, EntityState::Unchanged)?;
        entity.set_detached_key(navigation, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{order_customer_workspace, customer, order};
    use std::cell::RefCell;

    #[test]
    fn test_config_builders() {
        let config = StateManagerConfig::new()
            .cascade_deletes(false)
            .detect_changes_before_enumeration(false)
            .validate_relationship_lists(true);
        assert!(!config.cascade_deletes);
        assert!(!config.detect_changes_before_enumeration);
        assert!(config.validate_relationship_lists);
        assert!(StateManagerConfig::default().cascade_deletes);
    }

    #[test]
    fn test_attach_registers_entry() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.attach("Customers", &c).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Unchanged);
        assert_eq!(sm.entry_for(&c), Some(id));
        let key = EntityKey::single("Customers", "Id", 1_i64).unwrap();
        assert_eq!(sm.find_entry(&key), Some(id));
        assert_eq!(c.entity_key(), Some(key));
        // Attaching again is a no-op.
        assert_eq!(sm.attach("Customers", &c).unwrap(), id);
    }

    #[test]
    fn test_attach_requires_key_values() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = EntityObject::new(ws.entity_set("Customers").unwrap().element_type());
        assert!(sm.attach("Customers", &c).unwrap_err().is_argument());
        assert!(sm.is_empty());
    }

    #[test]
    fn test_attach_duplicate_key_conflicts() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        sm.attach("Customers", &customer(&ws, 1, "Ada")).unwrap();
        let err = sm.attach("Customers", &customer(&ws, 1, "Other")).unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::KeyConflict));
    }

    #[test]
    fn test_add_object_uses_temporary_key() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let id = sm.add_object("Customers", &c).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Added);
        assert!(sm.entry(id).unwrap().key().is_temporary());
        assert_eq!(sm.add_object("Customers", &c).unwrap(), id);
    }

    #[test]
    fn test_add_object_rejects_wrong_set() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        assert!(sm.add_object("Orders", &c).unwrap_err().is_argument());
        assert!(sm.add_object("Nope", &c).is_err());
    }

    #[test]
    fn test_add_graph_tracks_reachable_entities() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let c = customer(&ws, 1, "Ada");
        let o = order(&ws, 10, None);
        c.add_to_collection("Orders", &o).unwrap();
        let id = sm.add_object("Customers", &c).unwrap();
        let order_id = sm.entry_for(&o).unwrap();
        assert_eq!(sm.state_of(order_id), EntityState::Added);
        let rels = sm.relationships_for(id);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].state(), EntityState::Added);
        assert!(o.reference("Customer").is_some_and(|r| r.ptr_eq(&c)));
        // The dependent's foreign key follows the principal.
        assert_eq!(o.scalar("CustomerId"), Some(entitystate_core::Value::BigInt(1)));
    }

    #[test]
    fn test_key_entries() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let key = EntityKey::single("Customers", "Id", 7_i64).unwrap();
        let stub = sm.add_key_entry(&key).unwrap();
        assert!(sm.entry(stub).unwrap().is_key_entry());
        assert_eq!(sm.state_of(stub), EntityState::Unchanged);
        assert_eq!(sm.get_or_add_key_entry(&key).unwrap(), stub);
        assert!(sm.add_key_entry(&key).is_err());
        let temp = EntityKey::temporary("Customers");
        assert!(sm.add_key_entry(&temp).unwrap_err().is_argument());
    }

    #[test]
    fn test_attach_promotes_key_entry() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let key = EntityKey::single("Customers", "Id", 7_i64).unwrap();
        let stub = sm.add_key_entry(&key).unwrap();
        let c = customer(&ws, 7, "Grace");
        let id = sm.attach("Customers", &c).unwrap();
        assert_eq!(id, stub);
        let entry = sm.entry(id).unwrap();
        assert!(!entry.is_key_entry());
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert!(entry.key().same_instance(&key) || *entry.key() == key);
    }

    #[test]
    fn test_state_change_events() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        sm.events_mut()
            .on_state_changed(move |c| sink.borrow_mut().push((c.from, c.to)));
        let c = customer(&ws, 1, "Ada");
        sm.attach("Customers", &c).unwrap();
        assert_eq!(
            seen.borrow().as_slice(),
            &[(EntityState::Detached, EntityState::Unchanged)]
        );
        assert!(format!("{:?}", sm.events_mut()).contains("state_changed: 1"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let ws = order_customer_workspace();
        let mut sm = StateManager::new(Arc::clone(&ws));
        sm.attach("Customers", &customer(&ws, 1, "Ada")).unwrap();
        let snap = sm.snapshot();
        assert_eq!(snap.entries.len(), 1);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"state\":\"Unchanged\""));
        assert!(json.contains("Customers(Id=1)"));
    }
}
