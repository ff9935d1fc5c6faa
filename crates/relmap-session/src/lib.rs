//! Session and unit of work for relmap.
//!
//! `relmap-session` tracks in-memory instances against a relational store and
//! turns their changes into an ordered, minimal sequence of INSERT, UPDATE and
//! DELETE statements.
//!
//! # Role In The Architecture
//!
//! - **Arena**: every instance lives in the session and is addressed by an
//!   [`InstanceId`]. Relationships hold ids, so cyclic graphs need no shared
//!   ownership.
//! - **Identity map**: at most one live instance per primary key.
//! - **Change tracking**: each attribute keeps its committed baseline next to
//!   its current value; history is a pure diff of the two.
//! - **Flush**: cascades, relationship synchronisation, dependency ordering
//!   with cycle breaking, batched execution, then bookkeeping.
//! - **Transactions**: a rollback journal restores instance state on
//!   `rollback()` and `rollback_nested()`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(conn, Arc::new(registry));
//!
//! let parent = session.new_instance("Parent")?;
//! session.set(parent, "name", "p1")?;
//! let child = session.new_instance("Child")?;
//! session.set_related(child, "parent", Some(parent))?;
//! session.add(child)?;
//!
//! // Parent is inserted first; the child row receives its generated id.
//! session.commit(&cx).await?;
//! ```

macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            ::relmap_core::Outcome::Ok(v) => v,
            ::relmap_core::Outcome::Err(e) => return ::relmap_core::Outcome::Err(e),
            ::relmap_core::Outcome::Cancelled(r) => return ::relmap_core::Outcome::Cancelled(r),
            ::relmap_core::Outcome::Panicked(p) => return ::relmap_core::Outcome::Panicked(p),
        }
    };
}

macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return ::relmap_core::Outcome::Err(e),
        }
    };
}

pub mod attributes;
mod cascade;
pub mod config;
pub mod dependency;
pub mod events;
pub mod flush;
pub mod history;
pub mod identity_map;
mod loading;
pub mod merge;
mod relationships;
pub mod transaction;

pub use attributes::{AttrValue, AttributeSlot, Instance, InstanceId, InstanceState, Read};
pub use config::{IdentityConflictPolicy, SessionConfig, UnloadedCollectionPolicy};
pub use dependency::{Component, DependencyGraph};
pub use events::{AttributeSetEvent, Hook, SessionEvent, SessionHooks};
pub use flush::{FlushPlan, FlushResult, OperationKind, Param, PendingOperation};
pub use history::History;
pub use identity_map::{IdentityKey, IdentityMap};
pub use merge::{MergeOptions, MergePolicy};
pub use transaction::TransactionState;

use flush::{FlushOutput, FlushPlanner};
use relmap_core::error::IdentityConflictError;
use relmap_core::{
    Connection, Cx, Error, Mapper, Outcome, Result, TransactionErrorKind, Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use transaction::Journal;

fn invalid_transaction() -> Error {
    Error::transaction(
        TransactionErrorKind::Invalid,
        "this session's transaction was aborted by a failed flush; call rollback() first",
    )
}

// ============================================================================
// Session
// ============================================================================

/// The unit of work.
///
/// A session owns its connection, its arena of instances and the identity
/// map over them. It is driven by one flow of control: every mutating
/// operation takes `&mut self`.
pub struct Session<C: Connection> {
    connection: C,
    mapper: Arc<dyn Mapper>,
    config: SessionConfig,
    state: TransactionState,
    instances: BTreeMap<InstanceId, Instance>,
    identity_map: IdentityMap,
    next_id: u64,
    journal: Journal,
    hooks: SessionHooks,
    savepoint_seq: u64,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("instances", &self.instances.len())
            .field("identity_map", &self.identity_map.len())
            .field("nested", &self.journal.depth())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a session with the default configuration.
    pub fn new(connection: C, mapper: Arc<dyn Mapper>) -> Self {
        Self::with_config(connection, mapper, SessionConfig::default())
    }

    pub fn with_config(connection: C, mapper: Arc<dyn Mapper>, config: SessionConfig) -> Self {
        Self {
            connection,
            mapper,
            config,
            state: TransactionState::NoTransaction,
            instances: BTreeMap::new(),
            identity_map: IdentityMap::new(),
            next_id: 1,
            journal: Journal::default(),
            hooks: SessionHooks::default(),
            savepoint_seq: 0,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn mapper(&self) -> &dyn Mapper {
        self.mapper.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.state
    }

    pub fn in_transaction(&self) -> bool {
        self.state != TransactionState::NoTransaction
    }

    /// Number of open `begin_nested` levels.
    pub fn nested_depth(&self) -> usize {
        self.journal.depth()
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a hook. Hooks of one event run in registration order.
    pub fn on(&mut self, hook: Hook) {
        self.hooks.register(hook);
    }

    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.hooks.register(Hook::BeforeFlush(Box::new(f)));
    }

    pub fn on_after_flush(&mut self, f: impl FnMut(&FlushResult) -> Result<()> + Send + 'static) {
        self.hooks.register(Hook::AfterFlush(Box::new(f)));
    }

    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.hooks.register(Hook::BeforeCommit(Box::new(f)));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.hooks.register(Hook::AfterCommit(Box::new(f)));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.hooks.register(Hook::AfterRollback(Box::new(f)));
    }

    /// Called before every attribute assignment; an `Err` rejects it.
    pub fn on_attribute_set(
        &mut self,
        f: impl FnMut(&AttributeSetEvent<'_>) -> Result<()> + Send + 'static,
    ) {
        self.hooks.register(Hook::AttributeSet(Box::new(f)));
    }

    // ========================================================================
    // Arena Access
    // ========================================================================

    fn allocate(&mut self, instance: Instance) -> InstanceId {
        let id = InstanceId::new(self.next_id);
        self.next_id += 1;
        self.instances.insert(id, instance);
        id
    }

    pub fn instance(&self, id: InstanceId) -> Result<&Instance> {
        self.instances
            .get(&id)
            .ok_or_else(|| Error::invalid_request(format!("unknown instance {}", id)))
    }

    fn instance_mut(&mut self, id: InstanceId) -> Result<&mut Instance> {
        self.instances
            .get_mut(&id)
            .ok_or_else(|| Error::invalid_request(format!("unknown instance {}", id)))
    }

    pub fn state(&self, id: InstanceId) -> Result<InstanceState> {
        self.instance(id).map(Instance::state)
    }

    pub fn identity_key(&self, id: InstanceId) -> Option<&IdentityKey> {
        self.instances.get(&id).and_then(Instance::key)
    }

    /// Snapshot an instance in the rollback journal before changing it.
    fn touch(&mut self, id: InstanceId) {
        if let Some(instance) = self.instances.get(&id) {
            self.journal.touch(id, instance);
        }
    }

    fn set_state(&mut self, id: InstanceId, state: InstanceState) -> Result<()> {
        self.touch(id);
        self.instance_mut(id)?.set_state(state);
        Ok(())
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Create a transient instance in the arena.
    ///
    /// The instance is not part of the unit of work until [`Session::add`].
    pub fn new_instance(&mut self, entity: &str) -> Result<InstanceId> {
        self.mapper.require(entity)?;
        Ok(self.allocate(Instance::new(entity)))
    }

    /// Move an owned instance into the arena.
    ///
    /// Instances carrying an identity key arrive detached, others transient.
    /// Relationship state is dropped: handles from another session mean
    /// nothing here.
    pub fn import(&mut self, mut instance: Instance) -> Result<InstanceId> {
        let descriptor = self.mapper.require(instance.entity())?;
        let key = instance
            .key()
            .cloned()
            .or_else(|| match instance.state() {
                InstanceState::Transient => None,
                _ => IdentityKey::of(descriptor, &instance),
            });
        instance.set_state(if key.is_some() {
            InstanceState::Detached
        } else {
            InstanceState::Transient
        });
        instance.set_key(key);
        instance.drop_relationships();
        Ok(self.allocate(instance))
    }

    /// Move an instance out of the session as an owned value.
    ///
    /// A tracked instance is expunged first. Slots of other instances that
    /// point at it are unloaded.
    pub fn take(&mut self, id: InstanceId) -> Result<Instance> {
        if self.instance(id)?.state().in_session() {
            self.expunge_one(id)?;
        }
        let mut instance = self
            .instances
            .remove(&id)
            .ok_or_else(|| Error::invalid_request(format!("unknown instance {}", id)))?;
        instance.drop_relationships();
        for other in self.instances.values_mut() {
            other.retain_slots(|_, slot| {
                !slot.current.referenced().contains(&id)
                    && !slot
                        .committed
                        .as_ref()
                        .is_some_and(|c| c.referenced().contains(&id))
            });
        }
        Ok(instance)
    }

    /// Place an instance in the session.
    ///
    /// Transient instances become pending; detached instances with an
    /// identity are re-attached as persistent. Cascades save-update.
    pub fn add(&mut self, id: InstanceId) -> Result<()> {
        let instance = self.instance(id)?;
        match instance.state() {
            InstanceState::Transient => {
                tracing::debug!(instance = %id, entity = instance.entity(), "Adding instance");
                self.set_state(id, InstanceState::Pending)?;
            }
            InstanceState::Detached => {
                let key = instance.key().cloned().ok_or_else(|| {
                    Error::invalid_request(format!("detached instance {} has no identity", id))
                })?;
                self.identity_map.add(key, id)?;
                tracing::debug!(instance = %id, "Re-attaching detached instance");
                self.set_state(id, InstanceState::Persistent)?;
            }
            InstanceState::Deleted => {
                return Err(Error::invalid_request(format!(
                    "instance {} is marked for deletion",
                    id
                )));
            }
            InstanceState::Pending | InstanceState::Persistent => {}
        }
        self.cascade_save_update(id)?;
        Ok(())
    }

    pub fn add_all(&mut self, ids: impl IntoIterator<Item = InstanceId>) -> Result<()> {
        for id in ids {
            self.add(id)?;
        }
        Ok(())
    }

    /// Mark an instance for deletion.
    ///
    /// Persistent instances become deleted and cascade delete along loaded
    /// relationships. Pending instances are simply taken back out of the
    /// unit of work.
    ///
    /// When deleted rows reference each other, the flush orders their
    /// DELETEs from the foreign key values it has loaded. If the foreign key
    /// attribute of a self-referencing row is expired, that row gets no
    /// ordering constraint, and the delete then relies on the database's own
    /// foreign key handling (for example `ON DELETE CASCADE` or a deferred
    /// constraint). Load or refresh the foreign key before deleting such
    /// rows to get child-first ordering.
    pub fn delete(&mut self, id: InstanceId) -> Result<()> {
        match self.instance(id)?.state() {
            InstanceState::Persistent => {
                tracing::debug!(instance = %id, "Marking instance deleted");
                self.set_state(id, InstanceState::Deleted)?;
                self.cascade_delete(id)
            }
            InstanceState::Pending => self.expunge_one(id),
            InstanceState::Deleted => Ok(()),
            InstanceState::Transient | InstanceState::Detached => Err(Error::invalid_request(
                format!("instance {} is not persisted in this session", id),
            )),
        }
    }

    /// Whether the instance is pending, persistent or deleted here.
    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances
            .get(&id)
            .is_some_and(|i| i.state().in_session())
    }

    /// Remove an instance from the session, cascading along relationships
    /// configured with `expunge`.
    ///
    /// Expunging is not undone by rollback.
    pub fn expunge(&mut self, id: InstanceId) -> Result<()> {
        if !self.contains(id) {
            return Err(Error::invalid_request(format!(
                "instance {} is not present in this session",
                id
            )));
        }
        let mut queue = vec![id];
        let mut seen = BTreeSet::new();
        while let Some(next) = queue.pop() {
            if !seen.insert(next) || !self.contains(next) {
                continue;
            }
            for rel in self.relationships_of(next)? {
                if rel.cascade.expunge {
                    if let Some(slot) = self.instance(next)?.slot(&rel.name) {
                        queue.extend(slot.current.referenced());
                    }
                }
            }
            self.expunge_one(next)?;
        }
        Ok(())
    }

    pub fn expunge_all(&mut self) {
        for instance in self.instances.values_mut() {
            match instance.state() {
                InstanceState::Pending => instance.set_state(InstanceState::Transient),
                InstanceState::Persistent | InstanceState::Deleted => {
                    instance.set_state(InstanceState::Detached);
                }
                InstanceState::Transient | InstanceState::Detached => {}
            }
        }
        self.identity_map.clear();
        self.journal.clear();
    }

    fn expunge_one(&mut self, id: InstanceId) -> Result<()> {
        let instance = self.instance_mut(id)?;
        let state = match instance.state() {
            InstanceState::Pending => InstanceState::Transient,
            _ => InstanceState::Detached,
        };
        instance.set_state(state);
        if let Some(key) = instance.key().cloned() {
            self.identity_map.remove(&key, id);
        }
        self.journal.forget(id);
        tracing::trace!(instance = %id, "Expunged");
        Ok(())
    }

    /// Release clean persistent instances nothing else refers to.
    ///
    /// Returns the number of instances removed from the arena.
    pub fn prune(&mut self) -> usize {
        let referenced: BTreeSet<InstanceId> = self
            .instances
            .values()
            .flat_map(|i| {
                i.slots()
                    .flat_map(|(_, slot)| {
                        let mut ids = slot.current.referenced();
                        if let Some(committed) = &slot.committed {
                            ids.extend(committed.referenced());
                        }
                        ids
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        let doomed: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(id, i)| {
                i.state() == InstanceState::Persistent
                    && !i.is_modified()
                    && !referenced.contains(id)
                    && !self.journal.is_tracked(**id)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            if let Some(instance) = self.instances.remove(id) {
                if let Some(key) = instance.key() {
                    self.identity_map.remove(key, *id);
                }
            }
        }
        if !doomed.is_empty() {
            tracing::debug!(pruned = doomed.len(), "Pruned unreferenced instances");
        }
        doomed.len()
    }

    // ========================================================================
    // Dirty Checking
    // ========================================================================

    /// Pending instances, in creation order.
    pub fn new_instances(&self) -> Vec<InstanceId> {
        self.ids_where(|i| i.state() == InstanceState::Pending)
    }

    /// Persistent instances with unflushed changes.
    pub fn dirty(&self) -> Vec<InstanceId> {
        self.ids_where(|i| i.state() == InstanceState::Persistent && i.is_modified())
    }

    pub fn deleted(&self) -> Vec<InstanceId> {
        self.ids_where(|i| i.state() == InstanceState::Deleted)
    }

    fn ids_where(&self, pred: impl Fn(&Instance) -> bool) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|(_, i)| pred(i))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_modified(&self, id: InstanceId) -> Result<bool> {
        self.instance(id).map(Instance::is_modified)
    }

    /// History of a column attribute.
    pub fn history(&self, id: InstanceId, attr: &str) -> Result<History<Value>> {
        let instance = self.instance(id)?;
        let descriptor = self.mapper.require(instance.entity())?;
        if descriptor.find_column(attr).is_none() {
            return Err(Error::invalid_request(format!(
                "{} has no column '{}'",
                descriptor.name, attr
            )));
        }
        Ok(history::scalar_history(instance.slot(attr)))
    }

    /// History of a relationship attribute.
    pub fn related_history(&self, id: InstanceId, attr: &str) -> Result<History<InstanceId>> {
        let instance = self.instance(id)?;
        let descriptor = self.mapper.require(instance.entity())?;
        if descriptor.find_relationship(attr).is_none() {
            return Err(Error::invalid_request(format!(
                "{} has no relationship '{}'",
                descriptor.name, attr
            )));
        }
        Ok(history::related_history(instance.slot(attr)))
    }

    fn relationships_of(&self, id: InstanceId) -> Result<Vec<relmap_core::RelationshipDescriptor>> {
        let entity = self.instance(id)?.entity();
        Ok(self.mapper.relationships(entity)?.to_vec())
    }

    // ========================================================================
    // Scalar Attributes
    // ========================================================================

    /// Assign a column value.
    pub fn set(&mut self, id: InstanceId, attr: &str, value: impl Into<Value>) -> Result<()> {
        let mapper = Arc::clone(&self.mapper);
        let descriptor = mapper.require(self.instance(id)?.entity())?;
        if descriptor.find_column(attr).is_none() {
            return Err(Error::invalid_request(format!(
                "{} has no column '{}'",
                descriptor.name, attr
            )));
        }
        self.assign_attribute(id, &descriptor.name, attr, AttrValue::Scalar(value.into()))
    }

    /// Run hooks, journal and apply one assignment.
    fn assign_attribute(
        &mut self,
        id: InstanceId,
        entity: &str,
        attr: &str,
        value: AttrValue,
    ) -> Result<()> {
        self.hooks.fire_attribute_set(&AttributeSetEvent {
            instance: id,
            entity,
            attribute: attr,
            value: &value,
        })?;
        if self.contains(id) {
            self.touch(id);
        }
        tracing::trace!(instance = %id, attribute = attr, "Attribute set");
        self.instance_mut(id)?.assign(attr, value);
        Ok(())
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction explicitly.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.state {
            TransactionState::NoTransaction => {}
            TransactionState::Invalid => return Outcome::Err(invalid_transaction()),
            TransactionState::Active | TransactionState::Flushing => {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::AlreadyActive,
                    "a transaction is already in progress",
                ));
            }
        }
        match self.connection.begin(cx).await {
            Outcome::Ok(()) => {
                self.state = TransactionState::Active;
                tracing::info!("Transaction started");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Make sure a transaction is open before touching the database.
    async fn ensure_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.state {
            TransactionState::Active | TransactionState::Flushing => Outcome::Ok(()),
            TransactionState::Invalid => Outcome::Err(invalid_transaction()),
            TransactionState::NoTransaction if self.config.autobegin => self.begin(cx).await,
            TransactionState::NoTransaction => Outcome::Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "no transaction is active and autobegin is disabled",
            )),
        }
    }

    /// Flush all pending changes to the database.
    ///
    /// Executes INSERT, UPDATE and DELETE statements but does not commit.
    /// Any failure leaves the transaction invalid until `rollback()`.
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        self.flush_scope(cx, None).await
    }

    /// Flush only the given instances.
    ///
    /// Pending instances they reference must be included as well.
    pub async fn flush_instances(
        &mut self,
        cx: &Cx,
        ids: &[InstanceId],
    ) -> Outcome<FlushResult, Error> {
        self.flush_scope(cx, Some(ids.iter().copied().collect()))
            .await
    }

    async fn flush_scope(
        &mut self,
        cx: &Cx,
        scope: Option<BTreeSet<InstanceId>>,
    ) -> Outcome<FlushResult, Error> {
        match self.state {
            TransactionState::Invalid => return Outcome::Err(invalid_transaction()),
            TransactionState::Flushing => {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::Flushing,
                    "flush is already in progress",
                ));
            }
            TransactionState::NoTransaction | TransactionState::Active => {}
        }

        if let Err(e) = self.hooks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        let has_work = self.instances.iter().any(|(id, i)| {
            scope.as_ref().is_none_or(|s| s.contains(id))
                && match i.state() {
                    InstanceState::Pending | InstanceState::Deleted => true,
                    InstanceState::Persistent => i.is_modified(),
                    InstanceState::Transient | InstanceState::Detached => false,
                }
        });
        if !has_work {
            tracing::debug!("Nothing to flush");
            return Outcome::Ok(FlushResult::default());
        }

        try_outcome!(self.ensure_transaction(cx).await);
        self.state = TransactionState::Flushing;

        match self.flush_inner(cx, scope.as_ref()).await {
            Outcome::Ok(result) => {
                self.state = TransactionState::Active;
                if let Err(e) = self.hooks.fire_after_flush(&result) {
                    return Outcome::Err(e);
                }
                Outcome::Ok(result)
            }
            Outcome::Err(e) => {
                self.state = TransactionState::Invalid;
                tracing::warn!(error = %e, "Flush failed; session requires rollback");
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.state = TransactionState::Invalid;
                tracing::warn!("Flush cancelled; session requires rollback");
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.state = TransactionState::Invalid;
                Outcome::Panicked(p)
            }
        }
    }

    #[tracing::instrument(level = "info", skip(self, cx, scope))]
    async fn flush_inner(
        &mut self,
        cx: &Cx,
        scope: Option<&BTreeSet<InstanceId>>,
    ) -> Outcome<FlushResult, Error> {
        try_result!(self.cascade_all_save_update(scope));
        try_result!(self.resolve_orphans(scope));
        try_result!(self.cascade_deletes(scope));
        try_outcome!(self.load_version_tokens(cx, scope).await);
        try_result!(self.check_identity_conflicts(scope));

        let plan = try_result!(
            FlushPlanner::new(
                self.mapper.as_ref(),
                &self.instances,
                &self.identity_map,
                &self.config,
                scope,
            )
            .plan()
        );
        let output = try_outcome!(
            plan.execute(cx, &self.connection, self.config.batch_statements)
                .await
        );
        Outcome::Ok(try_result!(self.apply_flush(&plan, output)))
    }

    /// Pending instances whose key is already claimed by another instance.
    fn check_identity_conflicts(&self, scope: Option<&BTreeSet<InstanceId>>) -> Result<()> {
        let mut claimed: HashMap<IdentityKey, InstanceId> = HashMap::new();
        for (&id, instance) in &self.instances {
            if instance.state() != InstanceState::Pending || scope.is_some_and(|s| !s.contains(&id))
            {
                continue;
            }
            let descriptor = self.mapper.require(instance.entity())?;
            let Some(key) = IdentityKey::of(descriptor, instance) else {
                continue;
            };
            let holder = self
                .identity_map
                .lookup(&key)
                .filter(|h| *h != id)
                .or_else(|| claimed.get(&key).copied());
            if let Some(holder) = holder {
                match self.config.identity_conflict {
                    IdentityConflictPolicy::Error => {
                        return Err(Error::IdentityConflict(IdentityConflictError {
                            entity: key.entity().to_string(),
                            key: key.values().to_vec(),
                            message: format!(
                                "pending instance {} has the same identity as {}",
                                id, holder
                            ),
                        }));
                    }
                    IdentityConflictPolicy::Warn => {
                        tracing::warn!(
                            instance = %id,
                            holder = %holder,
                            key = %key,
                            "Pending instance shares an identity key; deferring to the database"
                        );
                    }
                }
            }
            claimed.insert(key, id);
        }
        Ok(())
    }

    /// Bookkeeping after every statement of a plan succeeded.
    fn apply_flush(&mut self, plan: &FlushPlan, output: FlushOutput) -> Result<FlushResult> {
        let mapper = Arc::clone(&self.mapper);
        for &id in plan.flushed.iter().chain(&plan.deleted) {
            self.touch(id);
        }

        for &id in &plan.flushed {
            self.instance_mut(id)?.reset_all();
        }
        for (&id, writes) in &plan.writes {
            for (column, param) in writes {
                let value = output.resolve(param)?;
                self.instance_mut(id)?
                    .load(column, AttrValue::Scalar(value));
            }
        }

        for &id in &plan.deleted {
            let instance = self.instance_mut(id)?;
            instance.set_state(InstanceState::Detached);
            if let Some(key) = instance.key().cloned() {
                self.identity_map.remove(&key, id);
            }
        }

        for &id in &plan.inserted {
            let instance = self.instance(id)?;
            let descriptor = mapper.require(instance.entity())?;
            let key = IdentityKey::of(descriptor, instance).ok_or_else(|| {
                Error::Custom(format!("inserted instance {} has no primary key", id))
            })?;
            if let Some(older) = self.identity_map.lookup(&key).filter(|o| *o != id) {
                if self.config.identity_conflict == IdentityConflictPolicy::Error {
                    return Err(Error::IdentityConflict(IdentityConflictError {
                        entity: key.entity().to_string(),
                        key: key.values().to_vec(),
                        message: format!("inserted instance {} collides with {}", id, older),
                    }));
                }
                tracing::warn!(
                    instance = %id,
                    older = %older,
                    key = %key,
                    "Detaching older instance replaced by an insert"
                );
                self.touch(older);
                self.instance_mut(older)?.set_state(InstanceState::Detached);
                self.identity_map.remove(&key, older);
            }
            self.identity_map.add(key.clone(), id)?;
            let instance = self.instance_mut(id)?;
            instance.set_state(InstanceState::Persistent);
            instance.set_key(Some(key));
        }

        // Primary key changes move the instance in the identity map.
        for &id in &plan.flushed {
            let instance = self.instance(id)?;
            if instance.state() != InstanceState::Persistent {
                continue;
            }
            let descriptor = mapper.require(instance.entity())?;
            let (Some(old), Some(new)) = (instance.key().cloned(), IdentityKey::of(descriptor, instance))
            else {
                continue;
            };
            if old != new {
                tracing::debug!(instance = %id, from = %old, to = %new, "Identity changed");
                self.identity_map.remove(&old, id);
                self.identity_map.add(new.clone(), id)?;
                self.instance_mut(id)?.set_key(Some(new));
            }
        }

        Ok(output.result)
    }

    /// Flush, then commit the transaction.
    ///
    /// With `expire_on_commit` every persistent instance is expired, so the
    /// next read reloads from the database.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state == TransactionState::Invalid {
            return Outcome::Err(invalid_transaction());
        }
        if let Err(e) = self.hooks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        try_outcome!(self.flush(cx).await);

        if self.state == TransactionState::Active {
            match self.connection.commit(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    self.state = TransactionState::Invalid;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.state = TransactionState::Invalid;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            tracing::info!("Transaction committed");
        }
        self.state = TransactionState::NoTransaction;
        self.journal.clear();

        if self.config.expire_on_commit {
            for instance in self.instances.values_mut() {
                if instance.state() == InstanceState::Persistent {
                    instance.expire_all();
                }
            }
        }

        if let Err(e) = self.hooks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Roll back the transaction and restore every instance touched since it
    /// began.
    ///
    /// Instances added in the transaction revert to transient, deleted ones
    /// come back, and untouched instances keep their loaded state.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let outcome = if self.state == TransactionState::NoTransaction {
            Outcome::Ok(())
        } else {
            self.connection.rollback(cx).await
        };

        let mut reverted = BTreeSet::new();
        for frame in self.journal.drain() {
            reverted.extend(self.restore(frame.snapshots));
        }
        self.after_restore(&reverted);
        self.state = TransactionState::NoTransaction;
        tracing::info!(restored = reverted.len(), "Transaction rolled back");

        match outcome {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Err(e) = self.hooks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Open a savepoint. Pending changes are flushed into the enclosing
    /// level first.
    pub async fn begin_nested(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.ensure_transaction(cx).await);
        try_outcome!(self.flush(cx).await);
        self.savepoint_seq += 1;
        let name = format!("sp_{}", self.savepoint_seq);
        try_outcome!(self.connection.savepoint(cx, &name).await);
        tracing::debug!(savepoint = %name, "Nested transaction started");
        self.journal.push(name);
        Outcome::Ok(())
    }

    /// Flush and release the innermost savepoint.
    pub async fn commit_nested(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let Some(name) = self.journal.current_savepoint().map(str::to_string) else {
            return Outcome::Err(no_savepoint());
        };
        try_outcome!(self.flush(cx).await);
        try_outcome!(self.connection.release(cx, &name).await);
        self.journal.merge_into_parent();
        tracing::debug!(savepoint = %name, "Nested transaction committed");
        Outcome::Ok(())
    }

    /// Roll back to the innermost savepoint.
    ///
    /// Only instances touched since the savepoint are restored. A session
    /// invalidated by a failed flush inside the savepoint becomes usable
    /// again.
    pub async fn rollback_nested(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let Some(name) = self.journal.current_savepoint().map(str::to_string) else {
            return Outcome::Err(no_savepoint());
        };
        try_outcome!(self.connection.rollback_to(cx, &name).await);
        try_outcome!(self.connection.release(cx, &name).await);

        let mut reverted = BTreeSet::new();
        if let Some(frame) = self.journal.pop() {
            reverted = self.restore(frame.snapshots);
        }
        self.after_restore(&reverted);
        if matches!(
            self.state,
            TransactionState::Invalid | TransactionState::Flushing
        ) {
            self.state = TransactionState::Active;
        }
        tracing::debug!(savepoint = %name, restored = reverted.len(), "Nested transaction rolled back");
        Outcome::Ok(())
    }

    /// Roll back any open transaction and detach everything.
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state != TransactionState::NoTransaction {
            try_outcome!(self.rollback(cx).await);
        }
        self.expunge_all();
        tracing::debug!("Session closed");
        Outcome::Ok(())
    }

    /// Put snapshots back into the arena. Returns the restored ids.
    fn restore(&mut self, snapshots: BTreeMap<InstanceId, Instance>) -> BTreeSet<InstanceId> {
        let mut restored = BTreeSet::new();
        for (id, snapshot) in snapshots {
            if self.instances.contains_key(&id) {
                self.instances.insert(id, snapshot);
                restored.insert(id);
            }
        }
        restored
    }

    /// Rebuild the identity map and unload relationship slots of untouched
    /// instances that point at instances which left the session.
    fn after_restore(&mut self, restored: &BTreeSet<InstanceId>) {
        self.identity_map.clear();
        for (&id, instance) in &self.instances {
            if matches!(
                instance.state(),
                InstanceState::Persistent | InstanceState::Deleted
            ) {
                if let Some(key) = instance.key() {
                    if let Err(e) = self.identity_map.add(key.clone(), id) {
                        tracing::warn!(error = %e, "Identity map rebuild skipped an instance");
                    }
                }
            }
        }

        let gone: BTreeSet<InstanceId> = restored
            .iter()
            .copied()
            .filter(|id| self.instances.get(id).is_some_and(|i| !i.state().in_session()))
            .collect();
        if gone.is_empty() {
            return;
        }
        for (id, instance) in &mut self.instances {
            if restored.contains(id) || !instance.state().in_session() {
                continue;
            }
            instance.retain_slots(|_, slot| {
                let points_at_gone = |v: &AttrValue| v.referenced().iter().any(|r| gone.contains(r));
                !points_at_gone(&slot.current) && !slot.committed.as_ref().is_some_and(points_at_gone)
            });
        }
    }
}

fn no_savepoint() -> Error {
    Error::transaction(
        TransactionErrorKind::SavepointNotFound,
        "no nested transaction is active",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::{ColumnDescriptor, EntityDescriptor, MapperRegistry, RelationshipDescriptor};
    use relmap_memory::MemoryConnection;
    use std::sync::Mutex;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn registry() -> Arc<MapperRegistry> {
        Arc::new(
            MapperRegistry::builder()
                .entity(
                    EntityDescriptor::new("Author", "author")
                        .column(ColumnDescriptor::new("id").primary_key().auto_increment())
                        .column(ColumnDescriptor::new("name").not_null())
                        .relationship(
                            RelationshipDescriptor::one_to_many("books", "Book", &["author_id"])
                                .back_populates("author"),
                        ),
                )
                .entity(
                    EntityDescriptor::new("Book", "book")
                        .column(ColumnDescriptor::new("id").primary_key().auto_increment())
                        .column(ColumnDescriptor::new("title"))
                        .column(ColumnDescriptor::new("author_id"))
                        .relationship(
                            RelationshipDescriptor::many_to_one("author", "Author", &["author_id"])
                                .back_populates("books"),
                        ),
                )
                .build()
                .unwrap(),
        )
    }

    fn session() -> Session<MemoryConnection> {
        let mapper = registry();
        Session::new(MemoryConnection::new(mapper.as_ref()), mapper)
    }

    fn run<T>(f: impl std::future::Future<Output = T>) -> T {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    #[test]
    fn test_add_and_delete_lifecycle() {
        let mut session = session();
        let author = session.new_instance("Author").unwrap();
        assert_eq!(session.state(author).unwrap(), InstanceState::Transient);
        assert!(!session.contains(author));

        session.add(author).unwrap();
        assert_eq!(session.new_instances(), vec![author]);

        session.delete(author).unwrap();
        assert_eq!(session.state(author).unwrap(), InstanceState::Transient);
        assert!(session.new_instances().is_empty());
    }

    #[test]
    fn test_unknown_entity_and_column_are_rejected() {
        let mut session = session();
        assert!(session.new_instance("Nope").is_err());
        let author = session.new_instance("Author").unwrap();
        let err = session.set(author, "nope", 1).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_flush_inserts_and_resets_history() {
        let mut session = session();
        let cx = Cx::for_testing();
        let author = session.new_instance("Author").unwrap();
        session.set(author, "name", "Le Guin").unwrap();
        session.add(author).unwrap();

        run(async {
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.inserted, 1);
        });

        assert_eq!(session.state(author).unwrap(), InstanceState::Persistent);
        assert_eq!(
            session.identity_key(author).unwrap().values(),
            &[Value::BigInt(1)]
        );
        assert!(!session.history(author, "name").unwrap().has_changes());
        assert!(session.dirty().is_empty());
    }

    #[test]
    fn test_failed_flush_requires_rollback() {
        let mut session = session();
        let cx = Cx::for_testing();
        let author = session.new_instance("Author").unwrap();
        session.add(author).unwrap();

        run(async {
            // name is NOT NULL
            assert!(matches!(session.flush(&cx).await, Outcome::Err(_)));
            assert_eq!(session.transaction_state(), TransactionState::Invalid);

            let err = match session.flush(&cx).await {
                Outcome::Err(e) => e,
                _ => panic!("flush should be refused"),
            };
            assert!(err.requires_rollback());

            unwrap_outcome(session.rollback(&cx).await);
        });
        assert_eq!(session.transaction_state(), TransactionState::NoTransaction);
        assert_eq!(session.state(author).unwrap(), InstanceState::Transient);
    }

    #[test]
    fn test_hooks_fire_around_commit() {
        let mut session = session();
        let cx = Cx::for_testing();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (event, tag) in [
            (SessionEvent::BeforeCommit, "before_commit"),
            (SessionEvent::BeforeFlush, "before_flush"),
            (SessionEvent::AfterCommit, "after_commit"),
        ] {
            let seen = Arc::clone(&seen);
            let f: Box<dyn FnMut() -> Result<()> + Send> = Box::new(move || {
                seen.lock().unwrap().push(tag);
                Ok(())
            });
            session.on(match event {
                SessionEvent::BeforeCommit => Hook::BeforeCommit(f),
                SessionEvent::BeforeFlush => Hook::BeforeFlush(f),
                _ => Hook::AfterCommit(f),
            });
        }
        let flushed = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&flushed);
        session.on_after_flush(move |result| {
            *counter.lock().unwrap() += result.inserted;
            Ok(())
        });

        let author = session.new_instance("Author").unwrap();
        session.set(author, "name", "a").unwrap();
        session.add(author).unwrap();
        run(async { unwrap_outcome(session.commit(&cx).await) });

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["before_commit", "before_flush", "after_commit"]
        );
        assert_eq!(*flushed.lock().unwrap(), 1);
    }

    #[test]
    fn test_attribute_hook_can_veto() {
        let mut session = session();
        session.on_attribute_set(|event| {
            if event.attribute == "name" && event.value.as_scalar().is_some_and(Value::is_null) {
                return Err(Error::invalid_request("name is required"));
            }
            Ok(())
        });
        let author = session.new_instance("Author").unwrap();
        assert!(session.set(author, "name", Value::Null).is_err());
        assert!(!session.instance(author).unwrap().is_loaded("name"));
        session.set(author, "name", "ok").unwrap();
    }

    #[test]
    fn test_commit_expires_persistent_instances() {
        let mut session = session();
        let cx = Cx::for_testing();
        let author = session.new_instance("Author").unwrap();
        session.set(author, "name", "a").unwrap();
        session.add(author).unwrap();

        run(async {
            unwrap_outcome(session.commit(&cx).await);
            assert!(!session.instance(author).unwrap().is_loaded("name"));
            let name = unwrap_outcome(session.get_attr(&cx, author, "name").await);
            assert_eq!(name, AttrValue::Scalar(Value::from("a")));
        });
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let mut session = session();
        let cx = Cx::for_testing();
        run(async {
            unwrap_outcome(session.begin(&cx).await);
            assert!(matches!(session.begin(&cx).await, Outcome::Err(_)));
            assert!(matches!(session.commit_nested(&cx).await, Outcome::Err(_)));
            unwrap_outcome(session.rollback(&cx).await);
        });
    }

    #[test]
    fn test_prune_releases_clean_unreferenced_instances() {
        let mut session = session();
        let cx = Cx::for_testing();
        session
            .connection()
            .seed("author", &[("id", Value::BigInt(1)), ("name", Value::from("a"))])
            .unwrap();
        run(async {
            let id = unwrap_outcome(session.get(&cx, "Author", &[Value::BigInt(1)]).await);
            assert!(id.is_some());
        });
        assert_eq!(session.identity_map().len(), 1);
        assert_eq!(session.prune(), 1);
        assert!(session.identity_map().is_empty());
    }
}
