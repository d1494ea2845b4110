//! Entity entries.
//!
//! An [`EntityEntry`] is the per-entity record kept by the
//! [`StateManager`](crate::StateManager): the entity handle (absent for key
//! stubs), its key and entity set, the lifecycle state, the modified-field
//! bitmap, recorded original values, complex-object snapshots and the head
//! of the intrusive relationship list.
//!
//! Entries are owned by the state manager and addressed by [`EntryId`]. All
//! mutation goes through the manager; the accessors here are read-only.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use entitystate_core::{EntitySet, MemberMetadata, StructuralType, Value};
use serde::{Deserialize, Serialize};

use crate::entity::{ChangeTrackingFlags, ComplexObject, EntityObject, MemberValue, ObjectId, ObjectRef};
use crate::entity_key::EntityKey;
use crate::relationship::RelationshipId;

/// Handle of an entry inside one state manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub(crate) u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an entity or relationship entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    Detached,
    Unchanged,
    Added,
    Deleted,
    Modified,
}

impl EntityState {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Detached => "Detached",
            EntityState::Unchanged => "Unchanged",
            EntityState::Added => "Added",
            EntityState::Deleted => "Deleted",
            EntityState::Modified => "Modified",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Modified field bitmap
// ============================================================================

/// Fixed-size bit vector with one bit per top-level member ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedFields {
    words: Vec<u64>,
    len: usize,
}

impl ModifiedFields {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, ordinal: usize) -> bool {
        ordinal < self.len && self.words[ordinal / 64] & (1 << (ordinal % 64)) != 0
    }

    pub fn set(&mut self, ordinal: usize) {
        if ordinal < self.len {
            self.words[ordinal / 64] |= 1 << (ordinal % 64);
        }
    }

    pub fn clear(&mut self, ordinal: usize) {
        if ordinal < self.len {
            self.words[ordinal / 64] &= !(1 << (ordinal % 64));
        }
    }

    /// `true` if any bit is set.
    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set ordinals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| self.get(*i))
    }
}

// ============================================================================
// Original values and complex snapshots
// ============================================================================

/// The value a scalar member had before it diverged.
///
/// `owner` is the entity or the nested complex object holding the member;
/// `parent_ordinal` is the top-level entity ordinal the member lives under,
/// which is the bit that gets marked when the member changes.
#[derive(Debug, Clone)]
pub(crate) struct OriginalValue {
    pub(crate) member: MemberMetadata,
    pub(crate) owner: ObjectRef,
    pub(crate) ordinal: usize,
    pub(crate) parent_ordinal: usize,
    pub(crate) value: Value,
}

/// Last known original complex instances held by one owner, by ordinal.
#[derive(Debug, Clone)]
pub(crate) struct ComplexSnapshot {
    pub(crate) owner: ObjectRef,
    pub(crate) objects: HashMap<usize, ComplexObject>,
}

/// State captured by a changing notification and consumed by the matching
/// changed notification.
#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
    pub(crate) path: String,
    pub(crate) owner: ObjectRef,
    pub(crate) ordinal: usize,
    pub(crate) parent_ordinal: usize,
    pub(crate) old_value: MemberValue,
}

// ============================================================================
// Entries
// ============================================================================

/// Tracking record for one entity, or a key stub standing in for one.
#[derive(Debug)]
pub struct EntityEntry {
    pub(crate) id: EntryId,
    pub(crate) entity: Option<EntityObject>,
    pub(crate) key: EntityKey,
    pub(crate) entity_set: Arc<EntitySet>,
    pub(crate) state: EntityState,
    pub(crate) flags: ChangeTrackingFlags,
    pub(crate) modified_fields: Option<ModifiedFields>,
    pub(crate) original_values: Vec<OriginalValue>,
    pub(crate) original_complex_objects: HashMap<ObjectId, ComplexSnapshot>,
    pub(crate) relationship_head: Option<RelationshipId>,
    pub(crate) relationship_count: usize,
    /// Foreign key values as last fixed up, by association name.
    pub(crate) foreign_keys: HashMap<String, EntityKey>,
    /// Navigation properties whose related ends are known to be loaded.
    pub(crate) loaded: HashSet<String>,
    pub(crate) pending_change: Option<PendingChange>,
}

impl EntityEntry {
    pub(crate) fn new(
        id: EntryId,
        entity: Option<EntityObject>,
        key: EntityKey,
        entity_set: Arc<EntitySet>,
        state: EntityState,
    ) -> Self {
        let flags = entity
            .as_ref()
            .map(|e| e.flavor().change_tracking_flags())
            .unwrap_or_default();
        Self {
            id,
            entity,
            key,
            entity_set,
            state,
            flags,
            modified_fields: None,
            original_values: Vec::new(),
            original_complex_objects: HashMap::new(),
            relationship_head: None,
            relationship_count: 0,
            foreign_keys: HashMap::new(),
            loaded: HashSet::new(),
            pending_change: None,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    /// The tracked entity; `None` for key stubs.
    pub fn entity(&self) -> Option<&EntityObject> {
        self.entity.as_ref()
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn entity_set(&self) -> &Arc<EntitySet> {
        &self.entity_set
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// `true` for a key stub: an entry that holds only a key.
    pub fn is_key_entry(&self) -> bool {
        self.entity.is_none()
    }

    pub fn change_tracking_flags(&self) -> ChangeTrackingFlags {
        self.flags
    }

    pub fn modified_fields(&self) -> Option<&ModifiedFields> {
        self.modified_fields.as_ref()
    }

    /// Number of relationship entries threaded through this entry's list.
    pub fn relationship_count(&self) -> usize {
        self.relationship_count
    }

    /// Number of recorded original values.
    pub fn original_value_count(&self) -> usize {
        self.original_values.len()
    }

    /// Whether the related end reached through `navigation` is marked loaded.
    pub fn is_loaded(&self, navigation: &str) -> bool {
        self.loaded.contains(navigation)
    }

    /// The foreign key cached for `association` at the last fix-up.
    pub fn cached_foreign_key(&self, association: &str) -> Option<&EntityKey> {
        self.foreign_keys.get(association)
    }

    /// Original complex instance currently recorded for `owner`'s member at `ordinal`.
    pub(crate) fn original_complex(&self, owner: ObjectId, ordinal: usize) -> Option<&ComplexObject> {
        self.original_complex_objects
            .get(&owner)
            .and_then(|s| s.objects.get(&ordinal))
    }

    pub(crate) fn find_original(&self, owner: ObjectId, ordinal: usize) -> Option<usize> {
        self.original_values
            .iter()
            .position(|o| o.owner.id() == owner && o.ordinal == ordinal)
    }

    /// Number of top-level members of the entity set's element type.
    pub(crate) fn field_count(&self) -> usize {
        self.entity_set.element_type().field_count()
    }

    /// Forget every recorded original value and snapshot.
    pub(crate) fn clear_original_state(&mut self) {
        self.modified_fields = None;
        self.original_values.clear();
        self.original_complex_objects.clear();
        self.pending_change = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified_fields_bits() {
        let mut bits = ModifiedFields::new(70);
        assert!(!bits.any());
        bits.set(3);
        bits.set(65);
        bits.set(70);
        assert!(bits.get(3) && bits.get(65));
        assert!(!bits.get(70));
        assert_eq!(bits.count(), 2);
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![3, 65]);
        bits.clear(3);
        bits.clear(65);
        assert!(!bits.any());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EntityState::Modified.to_string(), "Modified");
        assert_eq!(EntryId(4).to_string(), "#4");
    }

    #[test]
    fn test_state_serializes_as_name() {
        let json = serde_json::to_string(&EntityState::Added).unwrap();
        assert_eq!(json, "\"Added\"");
    }
}
