//! Entity keys.
//!
//! An [`EntityKey`] identifies an entity within an entity set. Three kinds
//! exist:
//!
//! - **Permanent** keys hold the key member values and compare by value.
//! - **Temporary** keys are handed to Added entities until their real key
//!   is known; each one is unique.
//! - **Conceptual null** keys stand in for a non-nullable foreign key that
//!   must be treated as null. They remember the foreign key values that were
//!   current when they were created so later detection can tell whether the
//!   user has since assigned a real value.
//!
//! Keys are cheap to clone and carry reference identity
//! ([`EntityKey::same_instance`]), which the relationship list uses as its
//! first tie-break before falling back to value equality.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use entitystate_core::{Error, Result, Value};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

fn next_key_id() -> u64 {
    NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed)
}

/// One `name = value` pair of a key.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityKeyMember {
    pub name: String,
    pub value: Value,
}

impl EntityKeyMember {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug)]
enum KeyKind {
    Temporary(u64),
    Permanent(Vec<EntityKeyMember>),
    ConceptualNull { id: u64, values: Vec<EntityKeyMember> },
}

#[derive(Debug)]
struct KeyData {
    entity_set: String,
    kind: KeyKind,
}

/// Identity of an entity within an entity set.
#[derive(Clone)]
pub struct EntityKey(Arc<KeyData>);

impl EntityKey {
    /// A fresh temporary key for an Added entity.
    pub fn temporary(entity_set: &str) -> Self {
        Self(Arc::new(KeyData {
            entity_set: entity_set.to_string(),
            kind: KeyKind::Temporary(next_key_id()),
        }))
    }

    /// A permanent key from member values.
    ///
    /// Fails with an argument error when no members are given or any value
    /// is NULL.
    pub fn new(entity_set: &str, members: Vec<EntityKeyMember>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::argument(
                "members",
                format!("a key for '{}' needs at least one member", entity_set),
            ));
        }
        if let Some(m) = members.iter().find(|m| m.value.is_null()) {
            return Err(Error::argument(
                "members",
                format!(
                    "key member '{}' of '{}' cannot be NULL",
                    m.name, entity_set
                ),
            ));
        }
        Ok(Self(Arc::new(KeyData {
            entity_set: entity_set.to_string(),
            kind: KeyKind::Permanent(members),
        })))
    }

    /// A permanent single-member key.
    pub fn single(entity_set: &str, name: &str, value: impl Into<Value>) -> Result<Self> {
        Self::new(entity_set, vec![EntityKeyMember::new(name, value)])
    }

    /// A conceptual null standing in for the foreign key `values`.
    pub(crate) fn conceptual_null(entity_set: &str, values: Vec<EntityKeyMember>) -> Self {
        Self(Arc::new(KeyData {
            entity_set: entity_set.to_string(),
            kind: KeyKind::ConceptualNull {
                id: next_key_id(),
                values,
            },
        }))
    }

    /// Name of the entity set the key belongs to.
    pub fn entity_set(&self) -> &str {
        &self.0.entity_set
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.0.kind, KeyKind::Temporary(_))
    }

    pub fn is_conceptual_null(&self) -> bool {
        matches!(self.0.kind, KeyKind::ConceptualNull { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self.0.kind, KeyKind::Permanent(_))
    }

    /// Key members of a permanent key; empty for the other kinds.
    pub fn members(&self) -> &[EntityKeyMember] {
        match &self.0.kind {
            KeyKind::Permanent(members) => members,
            _ => &[],
        }
    }

    /// Value of the key member called `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.members()
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.value)
    }

    /// `true` if both handles point at the same key instance.
    pub fn same_instance(&self, other: &EntityKey) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// For a conceptual null: whether `current` carries different foreign
    /// key values than the ones recorded when the null was created.
    pub(crate) fn conceptual_null_changed(&self, current: &EntityKey) -> bool {
        match &self.0.kind {
            KeyKind::ConceptualNull { values, .. } => {
                let now = current.members();
                values.len() != now.len()
                    || values
                        .iter()
                        .zip(now)
                        .any(|(a, b)| a.name != b.name || !a.value.is_identical(&b.value))
            }
            _ => false,
        }
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        if self.same_instance(other) {
            return true;
        }
        if self.0.entity_set != other.0.entity_set {
            return false;
        }
        match (&self.0.kind, &other.0.kind) {
            (KeyKind::Temporary(a), KeyKind::Temporary(b)) => a == b,
            (KeyKind::Permanent(a), KeyKind::Permanent(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|(x, y)| x.name == y.name && x.value.is_identical(&y.value))
            }
            (KeyKind::ConceptualNull { id: a, .. }, KeyKind::ConceptualNull { id: b, .. }) => {
                a == b
            }
            _ => false,
        }
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.entity_set.hash(state);
        match &self.0.kind {
            KeyKind::Temporary(id) => {
                state.write_u8(0);
                state.write_u64(*id);
            }
            KeyKind::Permanent(members) => {
                state.write_u8(1);
                for member in members {
                    member.name.hash(state);
                    member.value.hash_into(state);
                }
            }
            KeyKind::ConceptualNull { id, .. } => {
                state.write_u8(2);
                state.write_u64(*id);
            }
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            KeyKind::Temporary(id) => write!(f, "{}(temporary #{})", self.0.entity_set, id),
            KeyKind::ConceptualNull { .. } => write!(f, "{}(conceptual null)", self.0.entity_set),
            KeyKind::Permanent(members) => {
                write!(f, "{}(", self.0.entity_set)?;
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", m.name, m.value)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_permanent_keys_compare_by_value() {
        let a = EntityKey::single("Orders", "Id", 1_i64).unwrap();
        let b = EntityKey::single("Orders", "Id", 1_i64).unwrap();
        assert_eq!(a, b);
        assert!(!a.same_instance(&b));
        assert!(a.same_instance(&a.clone()));

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_keys_are_scoped_to_entity_set() {
        let a = EntityKey::single("Orders", "Id", 1_i64).unwrap();
        let b = EntityKey::single("Customers", "Id", 1_i64).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_temporary_keys_are_unique() {
        let a = EntityKey::temporary("Orders");
        let b = EntityKey::temporary("Orders");
        assert!(a.is_temporary());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.members().is_empty());
    }

    #[test]
    fn test_null_key_value_rejected() {
        let err = EntityKey::single("Orders", "Id", Value::Null).unwrap_err();
        assert!(err.is_argument());
        assert!(EntityKey::new("Orders", Vec::new()).unwrap_err().is_argument());
    }

    #[test]
    fn test_conceptual_null_change_detection() {
        let cn = EntityKey::conceptual_null(
            "Customers",
            vec![EntityKeyMember::new("Id", 5_i64)],
        );
        assert!(cn.is_conceptual_null());
        let same = EntityKey::single("Customers", "Id", 5_i64).unwrap();
        let other = EntityKey::single("Customers", "Id", 6_i64).unwrap();
        assert!(!cn.conceptual_null_changed(&same));
        assert!(cn.conceptual_null_changed(&other));
        assert_ne!(cn, same);
    }

    #[test]
    fn test_display() {
        let key = EntityKey::new(
            "Lines",
            vec![
                EntityKeyMember::new("OrderId", 1_i64),
                EntityKeyMember::new("LineNo", 2_i32),
            ],
        )
        .unwrap();
        assert_eq!(key.to_string(), "Lines(OrderId=1, LineNo=2)");
        assert_eq!(key.value("LineNo"), Some(&Value::Int(2)));
    }
}
