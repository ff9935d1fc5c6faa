//! Identity map: at most one live instance per database row.
//!
//! The map stores handles, not instances. The arena owns the instances and
//! the map can always be rebuilt from it, which is what rollback does.

use crate::attributes::{Instance, InstanceId};
use relmap_core::error::IdentityConflictError;
use relmap_core::{EntityDescriptor, Error, Result, Value};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Entity name plus primary key values.
///
/// Equality uses [`Value::same_as`], so `Int(1)` and `BigInt(1)` name the
/// same row.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    entity: String,
    values: Vec<Value>,
}

impl IdentityKey {
    /// Build a key. Keys with no values or with a NULL component do not name
    /// a row and yield `None`.
    pub fn new(entity: impl Into<String>, values: Vec<Value>) -> Option<Self> {
        let unusable = |v: &Value| matches!(v, Value::Null | Value::Default);
        if values.is_empty() || values.iter().any(unusable) {
            return None;
        }
        Some(Self {
            entity: entity.into(),
            values,
        })
    }

    /// Key from an instance's current primary key attributes.
    pub fn of(descriptor: &EntityDescriptor, instance: &Instance) -> Option<Self> {
        let values = descriptor
            .primary_key()
            .map(|c| instance.value(&c.name).cloned())
            .collect::<Option<Vec<_>>>()?;
        Self::new(descriptor.name.clone(), values)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.same_as(b))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        for v in &self.values {
            v.hash_into(state);
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.entity, self.values)
    }
}

/// Map from identity key to the one live instance holding it.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, InstanceId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &IdentityKey) -> Option<InstanceId> {
        self.entries.get(key).copied()
    }

    /// Register `id` under `key`.
    ///
    /// Re-registering the same instance is a no-op; a different instance
    /// under an occupied key is an identity conflict.
    pub fn add(&mut self, key: IdentityKey, id: InstanceId) -> Result<()> {
        match self.entries.get(&key) {
            Some(existing) if *existing == id => Ok(()),
            Some(existing) => Err(Error::IdentityConflict(IdentityConflictError {
                entity: key.entity.clone(),
                key: key.values.clone(),
                message: format!(
                    "instance {} cannot claim {}: already held by {}",
                    id, key, existing
                ),
            })),
            None => {
                tracing::trace!(key = %key, instance = %id, "Identity registered");
                self.entries.insert(key, id);
                Ok(())
            }
        }
    }

    /// Unregister `key` if it is held by `id`.
    pub fn remove(&mut self, key: &IdentityKey, id: InstanceId) -> bool {
        if self.entries.get(key) == Some(&id) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.entries.values().copied()
    }
}
