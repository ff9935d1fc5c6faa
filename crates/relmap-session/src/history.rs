//! Attribute history: what was added, kept and removed since the baseline.
//!
//! History is computed from slot state alone. An attribute with no slot was
//! never loaded and has an empty history; nothing here touches the database.

use crate::attributes::{AttrValue, AttributeSlot, InstanceId};
use relmap_core::Value;

/// Added, unchanged and deleted values of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct History<T> {
    pub added: Vec<T>,
    pub unchanged: Vec<T>,
    pub deleted: Vec<T>,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            unchanged: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T> History<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.unchanged.is_empty() && self.deleted.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.deleted.is_empty()
    }
}

/// Order-preserving difference of `current` against `committed`.
fn diff<T: Clone>(current: &[T], committed: &[T], eq: impl Fn(&T, &T) -> bool) -> History<T> {
    let mut history = History::default();
    for item in current {
        if committed.iter().any(|c| eq(c, item)) {
            history.unchanged.push(item.clone());
        } else {
            history.added.push(item.clone());
        }
    }
    history.deleted = committed
        .iter()
        .filter(|c| !current.iter().any(|item| eq(item, c)))
        .cloned()
        .collect();
    history
}

/// History of a column attribute.
pub fn scalar_history(slot: Option<&AttributeSlot>) -> History<Value> {
    let Some(slot) = slot else {
        return History::default();
    };
    let Some(current) = slot.current.as_scalar() else {
        return History::default();
    };
    match slot.committed.as_ref().and_then(AttrValue::as_scalar) {
        None => History {
            added: vec![current.clone()],
            ..History::default()
        },
        Some(committed) => diff(
            std::slice::from_ref(current),
            std::slice::from_ref(committed),
            Value::same_as,
        ),
    }
}

/// History of a relationship attribute, by instance identity.
///
/// An empty reference contributes nothing, so re-pointing a reference from
/// `a` to nothing reports only `a` as deleted.
pub fn related_history(slot: Option<&AttributeSlot>) -> History<InstanceId> {
    let Some(slot) = slot else {
        return History::default();
    };
    if !slot.current.is_relationship() {
        return History::default();
    }
    let current = slot.current.referenced();
    match &slot.committed {
        None => History {
            added: current,
            ..History::default()
        },
        Some(committed) => diff(&current, &committed.referenced(), |a, b| a == b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> InstanceId {
        InstanceId::new(n)
    }

    #[test]
    fn test_unloaded_attribute_has_no_history() {
        assert!(scalar_history(None).is_empty());
        assert!(related_history(None).is_empty());
    }

    #[test]
    fn test_scalar_change() {
        let mut slot = AttributeSlot::loaded(AttrValue::Scalar(Value::from("old")));
        let h = scalar_history(Some(&slot));
        assert_eq!(h.unchanged, vec![Value::from("old")]);
        assert!(!h.has_changes());

        slot.current = AttrValue::Scalar(Value::from("new"));
        let h = scalar_history(Some(&slot));
        assert_eq!(h.added, vec![Value::from("new")]);
        assert_eq!(h.deleted, vec![Value::from("old")]);
    }

    #[test]
    fn test_new_value_is_all_added() {
        let slot = AttributeSlot::assigned(AttrValue::Collection(vec![id(1), id(2)]));
        let h = related_history(Some(&slot));
        assert_eq!(h.added, vec![id(1), id(2)]);
        assert!(h.deleted.is_empty());
    }

    #[test]
    fn test_collection_diff_keeps_order() {
        let mut slot = AttributeSlot::loaded(AttrValue::Collection(vec![id(1), id(2), id(3)]));
        slot.current = AttrValue::Collection(vec![id(3), id(4), id(1)]);
        let h = related_history(Some(&slot));
        assert_eq!(h.added, vec![id(4)]);
        assert_eq!(h.unchanged, vec![id(3), id(1)]);
        assert_eq!(h.deleted, vec![id(2)]);
    }

    #[test]
    fn test_reference_cleared() {
        let mut slot = AttributeSlot::loaded(AttrValue::Reference(Some(id(7))));
        slot.current = AttrValue::Reference(None);
        let h = related_history(Some(&slot));
        assert!(h.added.is_empty());
        assert_eq!(h.deleted, vec![id(7)]);
    }
}
