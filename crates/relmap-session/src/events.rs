//! Session hooks.
//!
//! Hooks are kept in one ordered list and dispatched by their tag. They run
//! synchronously inside the session state machine; an `Err` returned from a
//! `BeforeFlush`, `BeforeCommit` or `AttributeSet` hook vetoes the operation.

use crate::attributes::{AttrValue, InstanceId};
use crate::flush::FlushResult;
use relmap_core::Result;
use std::fmt;

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// Fired before flush plans pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (before its implicit flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
    /// Fired before an attribute assignment is applied.
    AttributeSet,
}

/// Payload of an `AttributeSet` hook.
#[derive(Debug)]
pub struct AttributeSetEvent<'a> {
    pub instance: InstanceId,
    pub entity: &'a str,
    pub attribute: &'a str,
    pub value: &'a AttrValue,
}

type LifecycleFn = Box<dyn FnMut() -> Result<()> + Send>;
type FlushFn = Box<dyn FnMut(&FlushResult) -> Result<()> + Send>;
type AttributeFn = Box<dyn FnMut(&AttributeSetEvent<'_>) -> Result<()> + Send>;

/// A registered callback, tagged with the event it listens to.
pub enum Hook {
    BeforeFlush(LifecycleFn),
    AfterFlush(FlushFn),
    BeforeCommit(LifecycleFn),
    AfterCommit(LifecycleFn),
    AfterRollback(LifecycleFn),
    AttributeSet(AttributeFn),
}

impl Hook {
    pub fn event(&self) -> SessionEvent {
        match self {
            Hook::BeforeFlush(_) => SessionEvent::BeforeFlush,
            Hook::AfterFlush(_) => SessionEvent::AfterFlush,
            Hook::BeforeCommit(_) => SessionEvent::BeforeCommit,
            Hook::AfterCommit(_) => SessionEvent::AfterCommit,
            Hook::AfterRollback(_) => SessionEvent::AfterRollback,
            Hook::AttributeSet(_) => SessionEvent::AttributeSet,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook::{:?}", self.event())
    }
}

/// Ordered hook list owned by a session.
#[derive(Debug, Default)]
pub struct SessionHooks {
    hooks: Vec<Hook>,
}

impl SessionHooks {
    pub fn register(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn count(&self, event: SessionEvent) -> usize {
        self.hooks.iter().filter(|h| h.event() == event).count()
    }

    /// Run the payload-free hooks for `event` in registration order,
    /// stopping at the first error.
    pub(crate) fn fire(&mut self, event: SessionEvent) -> Result<()> {
        for hook in &mut self.hooks {
            match (event, hook) {
                (SessionEvent::BeforeFlush, Hook::BeforeFlush(f))
                | (SessionEvent::BeforeCommit, Hook::BeforeCommit(f))
                | (SessionEvent::AfterCommit, Hook::AfterCommit(f))
                | (SessionEvent::AfterRollback, Hook::AfterRollback(f)) => f()?,
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn fire_after_flush(&mut self, result: &FlushResult) -> Result<()> {
        for hook in &mut self.hooks {
            if let Hook::AfterFlush(f) = hook {
                f(result)?;
            }
        }
        Ok(())
    }

    pub(crate) fn fire_attribute_set(&mut self, event: &AttributeSetEvent<'_>) -> Result<()> {
        for hook in &mut self.hooks {
            if let Hook::AttributeSet(f) = hook {
                f(event)?;
            }
        }
        Ok(())
    }
}
