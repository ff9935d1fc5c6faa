//! Per-instance attribute state.
//!
//! Every attribute of a tracked instance lives in an [`AttributeSlot`] that
//! keeps the current value next to the committed baseline, the value the
//! database is believed to hold. A missing slot means nothing is known about
//! the attribute: it was never loaded, or it was expired.
//!
//! Relationship values hold [`InstanceId`] handles into the session's arena
//! rather than owning the related instances, so a graph with cycles is just
//! a set of ids.

use crate::identity_map::IdentityKey;
use relmap_core::error::DetachedAccessError;
use relmap_core::{EntityDescriptor, Error, RelationshipKind, Result, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Handle of an instance in a session's arena.
///
/// Ids are never reused within a session and increase in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an instance relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Not in any session, no database identity.
    Transient,
    /// Added to the session, INSERT not yet flushed.
    Pending,
    /// Has a database identity and is registered in the identity map.
    Persistent,
    /// Marked for deletion, DELETE not yet flushed.
    Deleted,
    /// Has (or had) a database identity but is no longer tracked.
    Detached,
}

impl InstanceState {
    /// Whether the session tracks instances in this state.
    pub const fn in_session(self) -> bool {
        matches!(
            self,
            InstanceState::Pending | InstanceState::Persistent | InstanceState::Deleted
        )
    }
}

/// Value of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Scalar(Value),
    /// Many-to-one or one-to-one reference.
    Reference(Option<InstanceId>),
    /// One-to-many or many-to-many collection, in insertion order.
    Collection(Vec<InstanceId>),
}

impl AttrValue {
    /// Equality used for dirty detection. Scalars compare with
    /// [`Value::same_as`], relationships by instance identity.
    pub fn same_as(&self, other: &AttrValue) -> bool {
        match (self, other) {
            (AttrValue::Scalar(a), AttrValue::Scalar(b)) => a.same_as(b),
            (AttrValue::Reference(a), AttrValue::Reference(b)) => a == b,
            (AttrValue::Collection(a), AttrValue::Collection(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            AttrValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<Option<InstanceId>> {
        match self {
            AttrValue::Reference(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&[InstanceId]> {
        match self {
            AttrValue::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// Instances this value points at.
    pub fn referenced(&self) -> Vec<InstanceId> {
        match self {
            AttrValue::Scalar(_) => Vec::new(),
            AttrValue::Reference(r) => r.iter().copied().collect(),
            AttrValue::Collection(c) => c.clone(),
        }
    }

    pub fn is_relationship(&self) -> bool {
        !matches!(self, AttrValue::Scalar(_))
    }
}

/// Current value and committed baseline of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSlot {
    pub current: AttrValue,
    /// `None` when the database value is unknown (new instance, or the
    /// attribute was set before it was ever loaded).
    pub committed: Option<AttrValue>,
}

impl AttributeSlot {
    /// A slot populated from the database.
    pub fn loaded(value: AttrValue) -> Self {
        Self {
            committed: Some(value.clone()),
            current: value,
        }
    }

    /// A slot set by the application with no known baseline.
    pub fn assigned(value: AttrValue) -> Self {
        Self {
            current: value,
            committed: None,
        }
    }

    pub fn is_modified(&self) -> bool {
        self.committed
            .as_ref()
            .is_none_or(|committed| !committed.same_as(&self.current))
    }

    /// Make the current value the new baseline.
    pub fn reset(&mut self) {
        self.committed = Some(self.current.clone());
    }
}

/// Result of reading an attribute without touching the database.
#[derive(Debug, Clone, PartialEq)]
pub enum Read {
    Value(AttrValue),
    /// The attribute has to be loaded first.
    NeedsLoad,
}

/// One tracked object: entity name, lifecycle state and attribute slots.
///
/// Instances are usually created through the session, but a free-standing
/// `Instance` can be built with [`Instance::new`] and [`Instance::with`] to
/// hand detached state to `Session::import` or `Session::merge_instance`.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    entity: String,
    state: InstanceState,
    key: Option<IdentityKey>,
    attrs: BTreeMap<String, AttributeSlot>,
}

impl Instance {
    /// A transient instance with no attributes set.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            state: InstanceState::Transient,
            key: None,
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style scalar assignment.
    pub fn with(mut self, attr: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(
            attr.to_string(),
            AttributeSlot::assigned(AttrValue::Scalar(value.into())),
        );
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn key(&self) -> Option<&IdentityKey> {
        self.key.as_ref()
    }

    pub fn slot(&self, attr: &str) -> Option<&AttributeSlot> {
        self.attrs.get(attr)
    }

    pub fn is_loaded(&self, attr: &str) -> bool {
        self.attrs.contains_key(attr)
    }

    /// Current scalar value, if loaded.
    pub fn value(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr).and_then(|s| s.current.as_scalar())
    }

    pub fn slots(&self) -> impl Iterator<Item = (&str, &AttributeSlot)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether any loaded attribute differs from its baseline.
    pub fn is_modified(&self) -> bool {
        self.attrs.values().any(AttributeSlot::is_modified)
    }

    pub(crate) fn set_state(&mut self, state: InstanceState) {
        self.state = state;
    }

    pub(crate) fn set_key(&mut self, key: Option<IdentityKey>) {
        self.key = key;
    }

    pub(crate) fn slot_mut(&mut self, attr: &str) -> Option<&mut AttributeSlot> {
        self.attrs.get_mut(attr)
    }

    /// Set the current value, creating an unbaselined slot if needed.
    pub(crate) fn assign(&mut self, attr: &str, value: AttrValue) {
        match self.attrs.get_mut(attr) {
            Some(slot) => slot.current = value,
            None => {
                self.attrs
                    .insert(attr.to_string(), AttributeSlot::assigned(value));
            }
        }
    }

    /// Set current and baseline together.
    pub(crate) fn load(&mut self, attr: &str, value: AttrValue) {
        self.attrs
            .insert(attr.to_string(), AttributeSlot::loaded(value));
    }

    pub(crate) fn expire(&mut self, attr: &str) -> bool {
        self.attrs.remove(attr).is_some()
    }

    pub(crate) fn expire_all(&mut self) {
        self.attrs.clear();
    }

    pub(crate) fn reset_all(&mut self) {
        for slot in self.attrs.values_mut() {
            slot.reset();
        }
    }

    /// Forget relationship state. Handles only mean something inside the
    /// session that issued them.
    pub(crate) fn drop_relationships(&mut self) {
        self.attrs.retain(|_, slot| !slot.current.is_relationship());
    }

    pub(crate) fn retain_slots(&mut self, mut keep: impl FnMut(&str, &AttributeSlot) -> bool) {
        self.attrs.retain(|k, v| keep(k, v));
    }

    /// Resolve a read against local state only.
    ///
    /// New instances fall back to defaults without recording them; persistent
    /// instances report [`Read::NeedsLoad`]; detached instances cannot load.
    pub fn read(&self, descriptor: &EntityDescriptor, attr: &str) -> Result<Read> {
        if let Some(slot) = self.attrs.get(attr) {
            return Ok(Read::Value(slot.current.clone()));
        }
        match self.state {
            InstanceState::Transient | InstanceState::Pending => {
                Ok(Read::Value(default_value(descriptor, attr)?))
            }
            InstanceState::Persistent | InstanceState::Deleted => {
                attribute_exists(descriptor, attr)?;
                Ok(Read::NeedsLoad)
            }
            InstanceState::Detached => {
                attribute_exists(descriptor, attr)?;
                Err(Error::DetachedAccess(DetachedAccessError {
                    entity: self.entity.clone(),
                    attribute: attr.to_string(),
                }))
            }
        }
    }
}

fn attribute_exists(descriptor: &EntityDescriptor, attr: &str) -> Result<()> {
    if descriptor.find_column(attr).is_some() || descriptor.find_relationship(attr).is_some() {
        Ok(())
    } else {
        Err(Error::invalid_request(format!(
            "{} has no attribute '{}'",
            descriptor.name, attr
        )))
    }
}

/// Value an attribute of a new instance reads as before it is set.
pub fn default_value(descriptor: &EntityDescriptor, attr: &str) -> Result<AttrValue> {
    if let Some(column) = descriptor.find_column(attr) {
        return Ok(AttrValue::Scalar(
            column.default.clone().unwrap_or(Value::Null),
        ));
    }
    if let Some(rel) = descriptor.find_relationship(attr) {
        return Ok(match rel.kind {
            RelationshipKind::ManyToOne => AttrValue::Reference(None),
            RelationshipKind::OneToMany if !rel.uselist => AttrValue::Reference(None),
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany => {
                AttrValue::Collection(Vec::new())
            }
        });
    }
    Err(Error::invalid_request(format!(
        "{} has no attribute '{}'",
        descriptor.name, attr
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{ColumnDescriptor, RelationshipDescriptor};

    fn user() -> EntityDescriptor {
        EntityDescriptor::new("User", "users")
            .column(ColumnDescriptor::new("id").primary_key())
            .column(ColumnDescriptor::new("name"))
            .column(ColumnDescriptor::new("active").default_value(true))
            .relationship(RelationshipDescriptor::one_to_many(
                "posts",
                "Post",
                &["user_id"],
            ))
    }

    #[test]
    fn test_slot_dirty_tracking() {
        let mut slot = AttributeSlot::loaded(AttrValue::Scalar(Value::Int(1)));
        assert!(!slot.is_modified());

        slot.current = AttrValue::Scalar(Value::BigInt(1));
        assert!(!slot.is_modified(), "integer width does not matter");

        slot.current = AttrValue::Scalar(Value::BigInt(2));
        assert!(slot.is_modified());

        slot.reset();
        assert!(!slot.is_modified());

        assert!(AttributeSlot::assigned(AttrValue::Scalar(Value::Null)).is_modified());
    }

    #[test]
    fn test_transient_reads_defaults_without_recording() {
        let desc = user();
        let inst = Instance::new("User");
        assert_eq!(
            inst.read(&desc, "active").unwrap(),
            Read::Value(AttrValue::Scalar(Value::Bool(true)))
        );
        assert_eq!(
            inst.read(&desc, "posts").unwrap(),
            Read::Value(AttrValue::Collection(Vec::new()))
        );
        assert!(!inst.is_loaded("active"));
        assert!(inst.read(&desc, "missing").is_err());
    }

    #[test]
    fn test_persistent_and_detached_reads() {
        let desc = user();
        let mut inst = Instance::new("User");
        inst.set_state(InstanceState::Persistent);
        assert_eq!(inst.read(&desc, "name").unwrap(), Read::NeedsLoad);

        inst.set_state(InstanceState::Detached);
        let err = inst.read(&desc, "name").unwrap_err();
        assert!(matches!(err, Error::DetachedAccess(_)));

        inst.load("name", AttrValue::Scalar(Value::from("ann")));
        assert_eq!(
            inst.read(&desc, "name").unwrap(),
            Read::Value(AttrValue::Scalar(Value::from("ann")))
        );
    }

    #[test]
    fn test_drop_relationships_keeps_scalars() {
        let mut inst = Instance::new("User").with("name", "ann");
        inst.load("posts", AttrValue::Collection(vec![InstanceId::new(4)]));
        inst.drop_relationships();
        assert!(inst.is_loaded("name"));
        assert!(!inst.is_loaded("posts"));
    }
}
