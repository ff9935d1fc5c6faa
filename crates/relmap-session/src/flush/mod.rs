//! Flush planning and execution.
//!
//! A flush turns session state into an ordered list of
//! [`PendingOperation`]s:
//!
//! 1. Collect rows: pending instances become INSERTs, persistent instances
//!    with changes become UPDATEs, deleted instances become DELETEs.
//! 2. Synchronise relationships: many-to-one references and one-to-many
//!    collections become foreign key assignments on the dependent row;
//!    many-to-many collection history becomes link table INSERT/DELETEs.
//! 3. Order: entity-level save/delete groups are sorted by foreign key
//!    dependencies. Cyclic groups are expanded into rows; a row cycle is
//!    broken on a nullable foreign key with a post-update (insert NULL, then
//!    UPDATE) or, for deletes, by clearing the column before the deletes.
//! 4. Execute in order, batching consecutive statements of identical shape.
//!
//! Keys generated by the store are only known while the flush runs, so
//! parameters that depend on them are [`Param::Key`] references resolved at
//! execution time.

mod execute;
mod materialize;

pub(crate) use execute::FlushOutput;

use crate::attributes::{AttrValue, Instance, InstanceId, InstanceState};
use crate::config::SessionConfig;
use crate::dependency::DependencyGraph;
use crate::history::related_history;
use crate::identity_map::{IdentityKey, IdentityMap};
use relmap_core::error::{CascadeConfigurationError, CycleError};
use relmap_core::{
    EntityDescriptor, Error, Mapper, RelationshipDescriptor, RelationshipKind, Result, Statement,
    Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// Operations
// ============================================================================

/// Kind of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    /// Second UPDATE that sets a foreign key once both rows exist.
    PostUpdate,
    /// UPDATE that nulls a foreign key so a delete cycle can proceed.
    ClearForeignKey,
    /// Link table INSERT.
    Link,
    /// Link table DELETE.
    Unlink,
}

/// Statement parameter, possibly resolved only during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Value(Value),
    /// Primary key component of an instance inserted earlier in this flush.
    Key { instance: InstanceId, index: usize },
    /// Version counter of an instance as of this statement.
    Version(InstanceId),
    /// Version counter plus one.
    NextVersion(InstanceId),
}

/// One statement of a flush plan.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub kind: OperationKind,
    /// Entity name, or link table name for link operations.
    pub entity: String,
    pub instance: Option<InstanceId>,
    pub statement: Statement,
    /// Parameters in statement order.
    pub params: Vec<Param>,
    /// Primary key of the target row, for error reports.
    pub key: Vec<Param>,
    /// Rows the statement must affect, when checked.
    pub expected_rows: Option<u64>,
    /// Success increments the tracked version of `instance`.
    pub bumps_version: bool,
}

impl PendingOperation {
    fn returns_key(&self) -> bool {
        matches!(
            self.statement,
            Statement::Insert {
                returning: Some(_),
                ..
            }
        )
    }

    fn batches_with(&self, other: &PendingOperation) -> bool {
        self.kind == other.kind && self.statement == other.statement && !self.returns_key()
    }
}

/// Counts reported by a completed flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Post-updates and foreign key clears.
    pub post_updates: usize,
    pub linked: usize,
    pub unlinked: usize,
    /// `execute_many` calls.
    pub batches: usize,
}

impl FlushResult {
    /// Number of statements executed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.post_updates + self.linked + self.unlinked
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn record(&mut self, kind: OperationKind) {
        match kind {
            OperationKind::Insert => self.inserted += 1,
            OperationKind::Update => self.updated += 1,
            OperationKind::Delete => self.deleted += 1,
            OperationKind::PostUpdate | OperationKind::ClearForeignKey => self.post_updates += 1,
            OperationKind::Link => self.linked += 1,
            OperationKind::Unlink => self.unlinked += 1,
        }
    }
}

/// Ordered operations plus what the session must apply once they succeed.
#[derive(Debug, Default)]
pub struct FlushPlan {
    pub operations: Vec<PendingOperation>,
    /// Version counters before the first statement.
    pub(crate) versions: HashMap<InstanceId, i64>,
    pub(crate) inserted: Vec<InstanceId>,
    pub(crate) deleted: Vec<InstanceId>,
    /// Instances whose baselines are reset after success.
    pub(crate) flushed: BTreeSet<InstanceId>,
    /// Final column values written per instance.
    pub(crate) writes: BTreeMap<InstanceId, BTreeMap<String, Param>>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.flushed.is_empty()
    }

    pub fn statements(&self) -> impl Iterator<Item = (&Statement, &[Param])> {
        self.operations
            .iter()
            .map(|op| (&op.statement, op.params.as_slice()))
    }
}

// ============================================================================
// Cascade validation
// ============================================================================

/// Reject cascade combinations the flush cannot honour.
pub(crate) fn validate_cascade(entity: &EntityDescriptor, rel: &RelationshipDescriptor) -> Result<()> {
    if !rel.cascade.delete_orphan {
        return Ok(());
    }
    let problem = match rel.kind {
        RelationshipKind::ManyToMany => Some("delete-orphan is not supported on many-to-many"),
        RelationshipKind::ManyToOne if !rel.single_parent => {
            Some("delete-orphan on many-to-one requires single_parent")
        }
        _ => None,
    };
    match problem {
        Some(message) => Err(Error::CascadeConfiguration(CascadeConfigurationError {
            entity: entity.name.clone(),
            relationship: rel.name.clone(),
            message: message.to_string(),
        })),
        None => Ok(()),
    }
}

// ============================================================================
// Planning
// ============================================================================

/// A foreign key dependency between two entities, derived from a
/// relationship on either side.
#[derive(Debug, Clone)]
pub(crate) struct ForeignKeyLink {
    pub(crate) dependent: String,
    pub(crate) parent: String,
    pub(crate) columns: Vec<String>,
    pub(crate) post_update: bool,
    pub(crate) nullable: bool,
}

/// All foreign key dependencies of a mapper, one per (dependent, columns).
pub(crate) fn foreign_key_links(mapper: &dyn Mapper) -> Vec<ForeignKeyLink> {
    let mut links: Vec<ForeignKeyLink> = Vec::new();
    for entity in mapper.entities() {
        for rel in &entity.relationships {
            let (dependent, parent) = match rel.kind {
                RelationshipKind::ManyToOne => (entity.name.as_str(), rel.target.as_str()),
                RelationshipKind::OneToMany => (rel.target.as_str(), entity.name.as_str()),
                RelationshipKind::ManyToMany => continue,
            };
            let nullable = mapper.entity(dependent).is_some_and(|d| {
                rel.foreign_key
                    .iter()
                    .all(|c| d.find_column(c).is_some_and(|col| col.nullable))
            });
            if let Some(existing) = links
                .iter_mut()
                .find(|l| l.dependent == dependent && l.columns == rel.foreign_key)
            {
                existing.post_update |= rel.post_update;
                continue;
            }
            links.push(ForeignKeyLink {
                dependent: dependent.to_string(),
                parent: parent.to_string(),
                columns: rel.foreign_key.clone(),
                post_update: rel.post_update,
                nullable,
            });
        }
    }
    links
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct RowChange {
    id: InstanceId,
    entity: usize,
    kind: RowKind,
}

/// Foreign key value a relationship wants on a dependent row.
#[derive(Debug, Clone)]
struct Assignment {
    parent: Option<InstanceId>,
    /// Written by a post-update instead of the row's own statement.
    post: bool,
    nullable: bool,
}

type AssignKey = (InstanceId, Vec<String>);

/// One link table row to insert or delete.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct LinkRow {
    table: String,
    /// (column, instance whose key fills it, key index), sorted by column
    columns: Vec<(String, InstanceId, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Node {
    Save(usize),
    Links(usize),
    Delete(usize),
}

impl Node {
    fn priority(self) -> (u8, usize) {
        match self {
            Node::Save(e) => (0, e),
            Node::Links(t) => (1, t),
            Node::Delete(e) => (2, e),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Row(usize),
    Links(usize),
}

#[derive(Debug, Clone)]
struct EdgeReason {
    child: InstanceId,
    columns: Vec<String>,
    nullable: bool,
}

/// Builds a [`FlushPlan`] from session state without touching it.
pub(crate) struct FlushPlanner<'a> {
    mapper: &'a dyn Mapper,
    instances: &'a BTreeMap<InstanceId, Instance>,
    identity_map: &'a IdentityMap,
    config: &'a SessionConfig,
    scope: Option<&'a BTreeSet<InstanceId>>,
    links: Vec<ForeignKeyLink>,
}

impl<'a> FlushPlanner<'a> {
    pub(crate) fn new(
        mapper: &'a dyn Mapper,
        instances: &'a BTreeMap<InstanceId, Instance>,
        identity_map: &'a IdentityMap,
        config: &'a SessionConfig,
        scope: Option<&'a BTreeSet<InstanceId>>,
    ) -> Self {
        Self {
            mapper,
            instances,
            identity_map,
            config,
            scope,
            links: foreign_key_links(mapper),
        }
    }

    fn in_scope(&self, id: InstanceId) -> bool {
        self.scope.is_none_or(|s| s.contains(&id))
    }

    fn instance(&self, id: InstanceId) -> Result<&'a Instance> {
        self.instances
            .get(&id)
            .ok_or_else(|| Error::invalid_request(format!("unknown instance {}", id)))
    }

    fn descriptor(&self, instance: &Instance) -> Result<&'a EntityDescriptor> {
        self.mapper.require(instance.entity())
    }

    /// Pending or persistent, and part of this flush.
    fn is_live(&self, id: InstanceId) -> bool {
        self.in_scope(id)
            && self.instances.get(&id).is_some_and(|i| {
                matches!(
                    i.state(),
                    InstanceState::Pending | InstanceState::Persistent
                )
            })
    }

    fn link_for(&self, dependent: &str, columns: &[String]) -> Option<&ForeignKeyLink> {
        self.links
            .iter()
            .find(|l| l.dependent == dependent && l.columns == columns)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn plan(&self) -> Result<FlushPlan> {
        for entity in self.mapper.entities() {
            for rel in &entity.relationships {
                validate_cascade(entity, rel)?;
            }
        }

        let mut assignments = self.sync_relationships()?;
        let (unlinks, link_rows) = self.sync_many_to_many()?;
        let rows = self.collect_rows(&assignments)?;

        let mut clears: Vec<AssignKey> = Vec::new();
        self.post_update_clears(&rows, &mut clears)?;

        let mut link_tables: Vec<String> = Vec::new();
        for row in unlinks.iter().chain(&link_rows) {
            if !link_tables.contains(&row.table) {
                link_tables.push(row.table.clone());
            }
        }

        let steps = self.order(&rows, &link_tables, &mut assignments, &mut clears)?;
        self.materialize(&rows, &steps, &assignments, &clears, &link_tables, &unlinks, &link_rows)
    }

    /// Foreign key assignments implied by relationship changes.
    fn sync_relationships(&self) -> Result<BTreeMap<AssignKey, Assignment>> {
        let mut assigned: BTreeMap<AssignKey, Assignment> = BTreeMap::new();
        let mut cleared: Vec<(InstanceId, String, Vec<String>)> = Vec::new();

        for (&id, instance) in self.instances {
            if !self.in_scope(id) || !instance.state().in_session() {
                continue;
            }
            let descriptor = self.descriptor(instance)?;
            let deleted = instance.state() == InstanceState::Deleted;

            for rel in &descriptor.relationships {
                let Some(slot) = instance.slot(&rel.name) else {
                    continue;
                };
                match rel.kind {
                    RelationshipKind::ManyToOne => {
                        if deleted {
                            continue;
                        }
                        let target = slot.current.as_reference().flatten();
                        let history = related_history(Some(slot));
                        let new_reference =
                            instance.state() == InstanceState::Pending && target.is_some();
                        if history.has_changes() || new_reference {
                            let link = self.link_for(&descriptor.name, &rel.foreign_key);
                            tracing::trace!(
                                instance = %id,
                                relationship = %rel.name,
                                parent = ?target,
                                "Many-to-one assignment"
                            );
                            assigned.insert(
                                (id, rel.foreign_key.clone()),
                                Assignment {
                                    parent: target,
                                    post: link.is_some_and(|l| l.post_update),
                                    nullable: link.is_some_and(|l| l.nullable),
                                },
                            );
                        }
                    }
                    RelationshipKind::OneToMany => {
                        if deleted {
                            for child in slot.current.referenced() {
                                if self.is_live(child) {
                                    cleared.push((child, rel.target.clone(), rel.foreign_key.clone()));
                                }
                            }
                            continue;
                        }
                        let history = related_history(Some(slot));
                        let link = self.link_for(&rel.target, &rel.foreign_key);
                        for child in history.added {
                            if self.is_live(child) {
                                assigned.insert(
                                    (child, rel.foreign_key.clone()),
                                    Assignment {
                                        parent: Some(id),
                                        post: link.is_some_and(|l| l.post_update),
                                        nullable: link.is_some_and(|l| l.nullable),
                                    },
                                );
                            }
                        }
                        for child in history.deleted {
                            if self.is_live(child) {
                                cleared.push((child, rel.target.clone(), rel.foreign_key.clone()));
                            }
                        }
                    }
                    RelationshipKind::ManyToMany => {}
                }
            }
        }

        for (child, dependent, columns) in cleared {
            let link = self.link_for(&dependent, &columns);
            assigned.entry((child, columns)).or_insert(Assignment {
                parent: None,
                post: false,
                nullable: link.is_some_and(|l| l.nullable),
            });
        }
        Ok(assigned)
    }

    /// Link table deletes and inserts, deduplicated across both sides of a
    /// bidirectional many-to-many.
    fn sync_many_to_many(&self) -> Result<(Vec<LinkRow>, Vec<LinkRow>)> {
        let mut unlinks: Vec<LinkRow> = Vec::new();
        let mut links: Vec<LinkRow> = Vec::new();

        for (&id, instance) in self.instances {
            if !self.in_scope(id) || !instance.state().in_session() {
                continue;
            }
            let descriptor = self.descriptor(instance)?;
            for rel in descriptor.relationships.iter().filter(|r| r.is_many_to_many()) {
                let (Some(link), Some(slot)) = (&rel.link, instance.slot(&rel.name)) else {
                    continue;
                };
                let row = |target: InstanceId| {
                    let mut columns: Vec<(String, InstanceId, usize)> = link
                        .local_columns
                        .iter()
                        .enumerate()
                        .map(|(k, c)| (c.clone(), id, k))
                        .chain(
                            link.remote_columns
                                .iter()
                                .enumerate()
                                .map(|(k, c)| (c.clone(), target, k)),
                        )
                        .collect();
                    columns.sort();
                    LinkRow {
                        table: link.table.clone(),
                        columns,
                    }
                };

                if instance.state() == InstanceState::Deleted {
                    let committed = slot
                        .committed
                        .as_ref()
                        .map(AttrValue::referenced)
                        .unwrap_or_default();
                    for target in committed {
                        let r = row(target);
                        if !unlinks.contains(&r) {
                            unlinks.push(r);
                        }
                    }
                    continue;
                }

                let history = related_history(Some(slot));
                for target in history.deleted {
                    let r = row(target);
                    if !unlinks.contains(&r) {
                        unlinks.push(r);
                    }
                }
                for target in history.added {
                    let r = row(target);
                    if !links.contains(&r) {
                        links.push(r);
                    }
                }
            }
        }
        Ok((unlinks, links))
    }

    fn collect_rows(&self, assignments: &BTreeMap<AssignKey, Assignment>) -> Result<Vec<RowChange>> {
        let assigned: BTreeSet<InstanceId> = assignments.keys().map(|(id, _)| *id).collect();
        let mut rows = Vec::new();
        for (&id, instance) in self.instances {
            if !self.in_scope(id) {
                continue;
            }
            let kind = match instance.state() {
                InstanceState::Pending => RowKind::Insert,
                InstanceState::Deleted => RowKind::Delete,
                InstanceState::Persistent => {
                    let descriptor = self.descriptor(instance)?;
                    let scalar_change = descriptor.columns.iter().any(|c| {
                        !c.version && instance.slot(&c.name).is_some_and(|s| s.is_modified())
                    });
                    if scalar_change || assigned.contains(&id) {
                        RowKind::Update
                    } else {
                        continue;
                    }
                }
                InstanceState::Transient | InstanceState::Detached => continue,
            };
            let entity = self
                .mapper
                .registration_index(instance.entity())
                .ok_or_else(|| {
                    Error::invalid_request(format!("unknown entity '{}'", instance.entity()))
                })?;
            rows.push(RowChange { id, entity, kind });
        }
        Ok(rows)
    }

    /// Parent a row pointed at in the database, judged from committed
    /// foreign key values.
    fn committed_parent(&self, instance: &Instance, link: &ForeignKeyLink) -> Option<InstanceId> {
        let values = link
            .columns
            .iter()
            .map(|c| {
                instance
                    .slot(c)
                    .and_then(|s| s.committed.as_ref())
                    .and_then(AttrValue::as_scalar)
                    .cloned()
            })
            .collect::<Option<Vec<_>>>()?;
        let key = IdentityKey::new(link.parent.clone(), values)?;
        self.identity_map.lookup(&key)
    }

    /// Deleted rows referencing other deleted rows through a post-update
    /// relationship get their foreign key cleared first.
    fn post_update_clears(&self, rows: &[RowChange], clears: &mut Vec<AssignKey>) -> Result<()> {
        let deleted: BTreeSet<InstanceId> = rows
            .iter()
            .filter(|r| r.kind == RowKind::Delete)
            .map(|r| r.id)
            .collect();
        for row in rows.iter().filter(|r| r.kind == RowKind::Delete) {
            let instance = self.instance(row.id)?;
            for link in self
                .links
                .iter()
                .filter(|l| l.post_update && l.dependent == instance.entity())
            {
                if let Some(parent) = self.committed_parent(instance, link) {
                    let key = (row.id, link.columns.clone());
                    if parent != row.id && deleted.contains(&parent) && !clears.contains(&key) {
                        clears.push(key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Dependency order of rows and link groups.
    fn order(
        &self,
        rows: &[RowChange],
        link_tables: &[String],
        assignments: &mut BTreeMap<AssignKey, Assignment>,
        clears: &mut Vec<AssignKey>,
    ) -> Result<Vec<Step>> {
        let mut nodes: Vec<Node> = Vec::new();
        for row in rows {
            let node = match row.kind {
                RowKind::Insert | RowKind::Update => Node::Save(row.entity),
                RowKind::Delete => Node::Delete(row.entity),
            };
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }
        nodes.extend((0..link_tables.len()).map(Node::Links));
        nodes.sort();

        let index_of = |node: Node| nodes.iter().position(|n| *n == node);
        let entity_index = |name: &str| self.mapper.registration_index(name);
        let mut graph = DependencyGraph::new(nodes.len());
        let edge = |graph: &mut DependencyGraph, a: Option<Node>, b: Option<Node>| {
            if let (Some(a), Some(b)) = (a.and_then(index_of), b.and_then(index_of)) {
                graph.add_edge(a, b);
            }
        };

        for link in &self.links {
            let (Some(d), Some(p)) = (entity_index(&link.dependent), entity_index(&link.parent))
            else {
                continue;
            };
            if !link.post_update {
                edge(&mut graph, Some(Node::Save(p)), Some(Node::Save(d)));
                edge(&mut graph, Some(Node::Delete(d)), Some(Node::Delete(p)));
            }
            edge(&mut graph, Some(Node::Save(d)), Some(Node::Delete(p)));
        }
        for e in 0..self.mapper.entities().len() {
            edge(&mut graph, Some(Node::Save(e)), Some(Node::Delete(e)));
        }
        for entity in self.mapper.entities() {
            for rel in entity.relationships.iter().filter(|r| r.is_many_to_many()) {
                let Some(link) = &rel.link else { continue };
                let Some(t) = link_tables.iter().position(|name| *name == link.table) else {
                    continue;
                };
                for side in [entity_index(&entity.name), entity_index(&rel.target)]
                    .into_iter()
                    .flatten()
                {
                    edge(&mut graph, Some(Node::Save(side)), Some(Node::Links(t)));
                    edge(&mut graph, Some(Node::Links(t)), Some(Node::Delete(side)));
                }
            }
        }

        let priority: Vec<(u8, usize)> = nodes.iter().map(|n| n.priority()).collect();
        let mut steps = Vec::new();
        for component in graph.order(&priority) {
            let members: Vec<usize> = rows
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    component.nodes.iter().any(|&n| match nodes[n] {
                        Node::Save(e) => e == r.entity && r.kind != RowKind::Delete,
                        Node::Delete(e) => e == r.entity && r.kind == RowKind::Delete,
                        Node::Links(_) => false,
                    })
                })
                .map(|(i, _)| i)
                .collect();

            if component.cyclic {
                let saves = members.first().is_some_and(|&i| rows[i].kind != RowKind::Delete);
                tracing::debug!(
                    rows = members.len(),
                    saves,
                    "Expanding cyclic dependency group into rows"
                );
                for i in self.order_rows(rows, &members, saves, assignments, clears)? {
                    steps.push(Step::Row(i));
                }
            } else {
                for &n in &component.nodes {
                    if let Node::Links(t) = nodes[n] {
                        steps.push(Step::Links(t));
                    }
                }
                steps.extend(members.into_iter().map(Step::Row));
            }
        }
        Ok(steps)
    }

    /// Row-level order inside a cyclic entity group, breaking row cycles on
    /// nullable foreign keys.
    fn order_rows(
        &self,
        rows: &[RowChange],
        members: &[usize],
        saves: bool,
        assignments: &mut BTreeMap<AssignKey, Assignment>,
        clears: &mut Vec<AssignKey>,
    ) -> Result<Vec<usize>> {
        let position: HashMap<InstanceId, usize> = members
            .iter()
            .enumerate()
            .map(|(local, &i)| (rows[i].id, local))
            .collect();
        let mut graph = DependencyGraph::new(members.len());
        let mut reasons: BTreeMap<(usize, usize), Vec<EdgeReason>> = BTreeMap::new();

        if saves {
            for ((child, columns), assignment) in assignments.iter() {
                let Some(parent) = assignment.parent else {
                    continue;
                };
                if assignment.post {
                    continue;
                }
                let (Some(&p), Some(&c)) = (position.get(&parent), position.get(child)) else {
                    continue;
                };
                if rows[members[p]].kind != RowKind::Insert {
                    continue;
                }
                graph.add_edge(p, c);
                reasons.entry((p, c)).or_default().push(EdgeReason {
                    child: *child,
                    columns: columns.clone(),
                    nullable: assignment.nullable,
                });
            }
        } else {
            for (c, &i) in members.iter().enumerate() {
                let instance = self.instance(rows[i].id)?;
                for link in self
                    .links
                    .iter()
                    .filter(|l| !l.post_update && l.dependent == instance.entity())
                {
                    let Some(parent) = self.committed_parent(instance, link) else {
                        continue;
                    };
                    let Some(&p) = position.get(&parent) else {
                        continue;
                    };
                    graph.add_edge(c, p);
                    reasons.entry((c, p)).or_default().push(EdgeReason {
                        child: rows[i].id,
                        columns: link.columns.clone(),
                        nullable: link.nullable,
                    });
                }
            }
        }

        let priority: Vec<InstanceId> = members.iter().map(|&i| rows[i].id).collect();
        loop {
            let order = graph.order(&priority);
            let Some(cycle) = order.iter().find(|c| c.cyclic) else {
                return Ok(order
                    .iter()
                    .flat_map(|c| c.nodes.iter().map(|&n| members[n]))
                    .collect());
            };

            let inside: BTreeSet<usize> = cycle.nodes.iter().copied().collect();
            let breakable = reasons
                .iter()
                .find(|((a, b), why)| {
                    inside.contains(a)
                        && inside.contains(b)
                        && graph.has_edge(*a, *b)
                        && why.iter().all(|r| r.nullable)
                })
                .map(|(edge, why)| (*edge, why.clone()));

            let Some(((a, b), why)) = breakable else {
                let mut entities: Vec<(usize, String)> = cycle
                    .nodes
                    .iter()
                    .filter_map(|&n| {
                        let row = rows[members[n]];
                        self.instances
                            .get(&row.id)
                            .map(|i| (row.entity, i.entity().to_string()))
                    })
                    .collect();
                entities.sort();
                entities.dedup();
                return Err(Error::UnresolvableCycle(CycleError {
                    entities: entities.into_iter().map(|(_, name)| name).collect(),
                    message: format!(
                        "{} rows depend on each other through non-nullable foreign keys",
                        cycle.nodes.len()
                    ),
                }));
            };

            graph.remove_edge(a, b);
            for reason in why {
                tracing::debug!(
                    instance = %reason.child,
                    columns = ?reason.columns,
                    saves,
                    "Breaking dependency cycle with a post-update"
                );
                let key = (reason.child, reason.columns);
                if saves {
                    if let Some(assignment) = assignments.get_mut(&key) {
                        assignment.post = true;
                    }
                } else if !clears.contains(&key) {
                    clears.push(key);
                }
            }
        }
    }
}
