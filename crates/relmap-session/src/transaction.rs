//! Transaction state and the rollback journal.
//!
//! The journal keeps one frame per open transaction level. The root frame
//! covers the whole transaction; `begin_nested` pushes a frame tied to a
//! savepoint. The first time an instance is touched inside a frame its full
//! state is snapshotted there, so rolling a frame back restores exactly the
//! instances touched since it opened.

use crate::attributes::{Instance, InstanceId};
use std::collections::BTreeMap;

/// Session transaction state machine.
///
/// `NoTransaction -> Active -> Flushing -> Active | Invalid`, and
/// `Invalid -> NoTransaction` only through rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NoTransaction,
    Active,
    Flushing,
    /// A flush failed; only rollback is accepted.
    Invalid,
}

#[derive(Debug, Default)]
pub(crate) struct Frame {
    pub(crate) savepoint: Option<String>,
    pub(crate) snapshots: BTreeMap<InstanceId, Instance>,
}

#[derive(Debug)]
pub(crate) struct Journal {
    frames: Vec<Frame>,
}

impl Default for Journal {
    fn default() -> Self {
        Self {
            frames: vec![Frame::default()],
        }
    }
}

impl Journal {
    /// Snapshot `instance` in the innermost frame unless it already has one.
    pub(crate) fn touch(&mut self, id: InstanceId, instance: &Instance) {
        if let Some(frame) = self.frames.last_mut() {
            frame
                .snapshots
                .entry(id)
                .or_insert_with(|| instance.clone());
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub(crate) fn push(&mut self, savepoint: String) {
        self.frames.push(Frame {
            savepoint: Some(savepoint),
            snapshots: BTreeMap::new(),
        });
    }

    /// Name of the innermost savepoint, if a nested frame is open.
    pub(crate) fn current_savepoint(&self) -> Option<&str> {
        self.frames.last().and_then(|f| f.savepoint.as_deref())
    }

    /// Pop the innermost nested frame. The root frame is never popped.
    pub(crate) fn pop(&mut self) -> Option<Frame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    /// Fold the innermost nested frame into its parent, keeping the parent's
    /// older snapshots.
    pub(crate) fn merge_into_parent(&mut self) -> bool {
        let Some(frame) = self.pop() else {
            return false;
        };
        if let Some(parent) = self.frames.last_mut() {
            for (id, snapshot) in frame.snapshots {
                parent.snapshots.entry(id).or_insert(snapshot);
            }
        }
        true
    }

    /// Remove every frame, newest first, leaving an empty root.
    pub(crate) fn drain(&mut self) -> Vec<Frame> {
        let mut frames = std::mem::replace(&mut self.frames, vec![Frame::default()]);
        frames.reverse();
        frames
    }

    pub(crate) fn clear(&mut self) {
        self.frames = vec![Frame::default()];
    }

    /// Stop tracking an instance that left the session.
    pub(crate) fn forget(&mut self, id: InstanceId) {
        for frame in &mut self.frames {
            frame.snapshots.remove(&id);
        }
    }

    pub(crate) fn is_tracked(&self, id: InstanceId) -> bool {
        self.frames.iter().any(|f| f.snapshots.contains_key(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::Value;

    fn id(n: u64) -> InstanceId {
        InstanceId::new(n)
    }

    #[test]
    fn test_first_touch_wins() {
        let mut journal = Journal::default();
        journal.touch(id(1), &Instance::new("User").with("name", "a"));
        journal.touch(id(1), &Instance::new("User").with("name", "b"));

        let frames = journal.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].snapshots[&id(1)].value("name"),
            Some(&Value::from("a"))
        );
        assert!(!journal.is_tracked(id(1)));
    }

    #[test]
    fn test_nested_merge_keeps_older_snapshot() {
        let mut journal = Journal::default();
        journal.touch(id(1), &Instance::new("User").with("name", "root"));
        journal.push("sp_1".to_string());
        assert_eq!(journal.current_savepoint(), Some("sp_1"));
        journal.touch(id(1), &Instance::new("User").with("name", "nested"));
        journal.touch(id(2), &Instance::new("User").with("name", "new"));

        assert!(journal.merge_into_parent());
        assert_eq!(journal.depth(), 0);
        let frames = journal.drain();
        assert_eq!(
            frames[0].snapshots[&id(1)].value("name"),
            Some(&Value::from("root"))
        );
        assert!(frames[0].snapshots.contains_key(&id(2)));
    }

    #[test]
    fn test_root_frame_is_never_popped() {
        let mut journal = Journal::default();
        assert!(journal.pop().is_none());
        assert!(!journal.merge_into_parent());
        assert_eq!(journal.current_savepoint(), None);
    }

    #[test]
    fn test_forget_removes_from_all_frames() {
        let mut journal = Journal::default();
        journal.touch(id(1), &Instance::new("User"));
        journal.push("sp_1".to_string());
        journal.touch(id(1), &Instance::new("User"));
        journal.forget(id(1));
        assert!(!journal.is_tracked(id(1)));
    }
}
