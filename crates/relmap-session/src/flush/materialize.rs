//! Statement construction for a flush plan.
//!
//! Rows are turned into INSERT, UPDATE and DELETE operations in step order.
//! Foreign keys whose value depends on a key generated in the same flush
//! become [`Param::Key`] references; version counters become
//! [`Param::Version`]/[`Param::NextVersion`] and are resolved as the plan
//! executes.

use super::{
    AssignKey, Assignment, FlushPlan, FlushPlanner, LinkRow, OperationKind, Param,
    PendingOperation, RowChange, RowKind, Step,
};
use crate::attributes::{AttrValue, Instance, InstanceId, InstanceState};
use relmap_core::{EntityDescriptor, Error, Result, Statement, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Queue an UPDATE that runs outside a row's own statement. When it moves
/// the version counter, the final counter is written back with the other
/// columns.
fn push_followup(plan: &mut FlushPlan, descriptor: &EntityDescriptor, op: PendingOperation) {
    if let (true, Some(id), Some(version)) =
        (op.bumps_version, op.instance, descriptor.version_column())
    {
        plan.writes
            .entry(id)
            .or_default()
            .insert(version.name.clone(), Param::Version(id));
    }
    plan.operations.push(op);
}

impl FlushPlanner<'_> {
    /// Parameter for component `index` of `id`'s primary key as it will be
    /// once its own statement ran.
    fn key_param(&self, id: InstanceId, index: usize) -> Result<Param> {
        let instance = self.instance(id)?;
        let descriptor = self.descriptor(instance)?;
        let column = descriptor
            .primary_key()
            .nth(index)
            .ok_or_else(|| Error::invalid_request(format!("{} has no key component {}", id, index)))?;
        if let Some(v) = instance.value(&column.name).filter(|v| !v.is_null()) {
            return Ok(Param::Value(v.clone()));
        }
        if let Some(key) = instance.key() {
            return Ok(Param::Value(key.values()[index].clone()));
        }
        if instance.state() == InstanceState::Pending && descriptor.generated_key().is_some() {
            return Ok(Param::Key {
                instance: id,
                index,
            });
        }
        Err(Error::invalid_request(format!(
            "{} {} has no primary key value",
            descriptor.name, id
        )))
    }

    fn own_key(&self, id: InstanceId, descriptor: &EntityDescriptor) -> Result<Vec<Param>> {
        (0..descriptor.primary_key().count())
            .map(|k| self.key_param(id, k))
            .collect()
    }

    /// Key the row has in the database right now.
    fn identity_params(&self, instance: &Instance, id: InstanceId) -> Result<Vec<Param>> {
        instance
            .key()
            .map(|k| k.values().iter().cloned().map(Param::Value).collect())
            .ok_or_else(|| {
                Error::invalid_request(format!("{} {} has no identity", instance.entity(), id))
            })
    }

    fn assignment_param(&self, assignment: &Assignment, index: usize) -> Result<Param> {
        match assignment.parent {
            Some(parent) if !assignment.post => self.key_param(parent, index),
            _ => Ok(Param::Value(Value::Null)),
        }
    }

    fn committed_version(&self, instance: &Instance, column: &str) -> Result<i64> {
        instance
            .slot(column)
            .and_then(|s| s.committed.as_ref().or(Some(&s.current)))
            .and_then(AttrValue::as_scalar)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                Error::invalid_request(format!(
                    "version column {}.{} is not loaded",
                    instance.entity(),
                    column
                ))
            })
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn materialize(
        &self,
        rows: &[RowChange],
        steps: &[Step],
        assignments: &BTreeMap<AssignKey, Assignment>,
        clears: &[AssignKey],
        link_tables: &[String],
        unlinks: &[LinkRow],
        link_rows: &[LinkRow],
    ) -> Result<FlushPlan> {
        let mut plan = FlushPlan::default();
        let deleted: BTreeSet<InstanceId> = rows
            .iter()
            .filter(|r| r.kind == RowKind::Delete)
            .map(|r| r.id)
            .collect();

        for row in rows {
            let instance = self.instance(row.id)?;
            let descriptor = self.descriptor(instance)?;
            if let Some(version) = descriptor.version_column() {
                let value = match row.kind {
                    RowKind::Insert => instance
                        .value(&version.name)
                        .and_then(Value::as_i64)
                        .or_else(|| version.default.as_ref().and_then(Value::as_i64))
                        .unwrap_or(1),
                    RowKind::Update | RowKind::Delete => {
                        self.committed_version(instance, &version.name)?
                    }
                };
                plan.versions.insert(row.id, value);
            }
        }

        // Foreign keys of doomed rows are cleared before anything else runs.
        for (id, columns) in clears {
            let instance = self.instance(*id)?;
            let descriptor = self.descriptor(instance)?;
            let set = columns
                .iter()
                .map(|c| (c.clone(), Param::Value(Value::Null)))
                .collect();
            let key = self.identity_params(instance, *id)?;
            let writes = plan.writes.entry(*id).or_default();
            for column in columns {
                writes.insert(column.clone(), Param::Value(Value::Null));
            }
            let op = self.update_operation(
                OperationKind::ClearForeignKey,
                descriptor,
                *id,
                set,
                key,
                &plan.versions,
            );
            push_followup(&mut plan, descriptor, op);
        }

        let mut post_updates: Vec<(InstanceId, Vec<String>, InstanceId)> = Vec::new();
        for step in steps {
            match *step {
                Step::Links(t) => {
                    let table = &link_tables[t];
                    for row in unlinks.iter().filter(|r| r.table == *table) {
                        plan.operations.push(self.link_operation(row, false)?);
                    }
                    for row in link_rows.iter().filter(|r| r.table == *table) {
                        plan.operations.push(self.link_operation(row, true)?);
                    }
                }
                Step::Row(i) => {
                    let row = rows[i];
                    let instance = self.instance(row.id)?;
                    let descriptor = self.descriptor(instance)?;
                    let mine: Vec<(&Vec<String>, &Assignment)> = assignments
                        .iter()
                        .filter(|((id, _), _)| *id == row.id)
                        .map(|((_, cols), a)| (cols, a))
                        .collect();
                    for (columns, assignment) in &mine {
                        if let (true, Some(parent)) = (assignment.post, assignment.parent) {
                            post_updates.push((row.id, (*columns).clone(), parent));
                        }
                    }
                    match row.kind {
                        RowKind::Insert => {
                            let op = self.insert_operation(row.id, instance, descriptor, &mine, &mut plan)?;
                            plan.operations.push(op);
                            plan.inserted.push(row.id);
                        }
                        RowKind::Update => {
                            if let Some(op) =
                                self.main_update(row.id, instance, descriptor, &mine, &deleted, &mut plan)?
                            {
                                plan.operations.push(op);
                            }
                        }
                        RowKind::Delete => {
                            let key = self.identity_params(instance, row.id)?;
                            plan.operations
                                .push(self.delete_operation(descriptor, row.id, key, &plan.versions));
                            plan.deleted.push(row.id);
                        }
                    }
                    plan.flushed.insert(row.id);
                }
            }
        }

        for (id, columns, parent) in post_updates {
            let instance = self.instance(id)?;
            let descriptor = self.descriptor(instance)?;
            let mut set = Vec::with_capacity(columns.len());
            for (k, column) in columns.iter().enumerate() {
                let param = self.key_param(parent, k)?;
                plan.writes
                    .entry(id)
                    .or_default()
                    .insert(column.clone(), param.clone());
                set.push((column.clone(), param));
            }
            let key = self.own_key(id, descriptor)?;
            let op = self.update_operation(
                OperationKind::PostUpdate,
                descriptor,
                id,
                set,
                key,
                &plan.versions,
            );
            push_followup(&mut plan, descriptor, op);
        }

        // Instances with only relationship changes still need new baselines.
        for (&id, instance) in self.instances {
            if self.in_scope(id)
                && matches!(
                    instance.state(),
                    InstanceState::Pending | InstanceState::Persistent
                )
                && instance.is_modified()
            {
                plan.flushed.insert(id);
            }
        }

        tracing::debug!(
            operations = plan.operations.len(),
            inserts = plan.inserted.len(),
            deletes = plan.deleted.len(),
            "Flush plan built"
        );
        Ok(plan)
    }

    fn insert_operation(
        &self,
        id: InstanceId,
        instance: &Instance,
        descriptor: &EntityDescriptor,
        assignments: &[(&Vec<String>, &Assignment)],
        plan: &mut FlushPlan,
    ) -> Result<PendingOperation> {
        let mut columns = Vec::new();
        let mut params = Vec::new();
        let mut returning = None;
        let writes = plan.writes.entry(id).or_default();

        for column in &descriptor.columns {
            let assigned = assignments.iter().find_map(|(cols, a)| {
                cols.iter().position(|c| *c == column.name).map(|k| (*a, k))
            });
            let param = if let Some((assignment, k)) = assigned {
                self.assignment_param(assignment, k)?
            } else if column.version {
                Param::Version(id)
            } else if let Some(v) = instance.value(&column.name).filter(|v| !v.is_null()) {
                Param::Value(v.clone())
            } else if column.primary_key && column.auto_increment {
                returning = Some(column.name.clone());
                writes.insert(column.name.clone(), Param::Key { instance: id, index: 0 });
                continue;
            } else if let Some(v) = instance.value(&column.name) {
                Param::Value(v.clone())
            } else if let Some(default) = &column.default {
                Param::Value(default.clone())
            } else {
                continue;
            };
            writes.insert(column.name.clone(), param.clone());
            columns.push(column.name.clone());
            params.push(param);
        }

        let key = self.own_key(id, descriptor)?;
        Ok(PendingOperation {
            kind: OperationKind::Insert,
            entity: descriptor.name.clone(),
            instance: Some(id),
            statement: Statement::Insert {
                table: descriptor.table.clone(),
                columns,
                returning,
            },
            params,
            key,
            expected_rows: None,
            bumps_version: false,
        })
    }

    fn main_update(
        &self,
        id: InstanceId,
        instance: &Instance,
        descriptor: &EntityDescriptor,
        assignments: &[(&Vec<String>, &Assignment)],
        deleted: &BTreeSet<InstanceId>,
        plan: &mut FlushPlan,
    ) -> Result<Option<PendingOperation>> {
        let mut set: Vec<(String, Param)> = Vec::new();

        for column in descriptor.columns.iter().filter(|c| !c.version) {
            let slot = instance.slot(&column.name);
            let assigned = assignments.iter().find_map(|(cols, a)| {
                cols.iter().position(|c| *c == column.name).map(|k| (*a, k, *cols))
            });
            let param = match assigned {
                Some((assignment, k, cols)) => {
                    if assignment.post && assignment.parent.is_some() {
                        // Only null the old reference if its target is going away.
                        let leaving_deleted_parent = self
                            .link_for(&descriptor.name, cols)
                            .and_then(|l| self.committed_parent(instance, l))
                            .is_some_and(|p| deleted.contains(&p));
                        if !leaving_deleted_parent {
                            continue;
                        }
                    }
                    let param = self.assignment_param(assignment, k)?;
                    let unchanged = match (&param, slot.and_then(|s| s.committed.as_ref())) {
                        (Param::Value(v), Some(AttrValue::Scalar(committed))) => v.same_as(committed),
                        _ => false,
                    };
                    if unchanged {
                        continue;
                    }
                    param
                }
                None => match slot {
                    Some(s) if s.is_modified() => match s.current.as_scalar() {
                        Some(v) => Param::Value(v.clone()),
                        None => continue,
                    },
                    _ => continue,
                },
            };
            set.push((column.name.clone(), param));
        }

        if set.is_empty() {
            return Ok(None);
        }
        let writes = plan.writes.entry(id).or_default();
        for (column, param) in &set {
            writes.insert(column.clone(), param.clone());
        }
        if let Some(version) = descriptor.version_column() {
            writes.insert(version.name.clone(), Param::Version(id));
        }
        let key = self.identity_params(instance, id)?;
        Ok(Some(self.update_operation(
            OperationKind::Update,
            descriptor,
            id,
            set,
            key,
            &plan.versions,
        )))
    }

    /// UPDATE by primary key, with a version check and bump when versioned.
    fn update_operation(
        &self,
        kind: OperationKind,
        descriptor: &EntityDescriptor,
        id: InstanceId,
        mut set: Vec<(String, Param)>,
        key: Vec<Param>,
        versions: &HashMap<InstanceId, i64>,
    ) -> PendingOperation {
        let mut filter = descriptor.primary_key_names();
        let mut filter_params = key.clone();
        let versioned = descriptor
            .version_column()
            .filter(|_| versions.contains_key(&id));
        if let Some(version) = versioned {
            set.push((version.name.clone(), Param::NextVersion(id)));
            filter.push(version.name.clone());
            filter_params.push(Param::Version(id));
        }
        let (columns, mut params): (Vec<String>, Vec<Param>) = set.into_iter().unzip();
        params.extend(filter_params);
        PendingOperation {
            kind,
            entity: descriptor.name.clone(),
            instance: Some(id),
            statement: Statement::Update {
                table: descriptor.table.clone(),
                set: columns,
                filter,
            },
            params,
            key,
            expected_rows: Some(1),
            bumps_version: versioned.is_some(),
        }
    }

    fn delete_operation(
        &self,
        descriptor: &EntityDescriptor,
        id: InstanceId,
        key: Vec<Param>,
        versions: &HashMap<InstanceId, i64>,
    ) -> PendingOperation {
        let mut filter = descriptor.primary_key_names();
        let mut params = key.clone();
        let versioned = descriptor
            .version_column()
            .filter(|_| versions.contains_key(&id));
        if let Some(version) = versioned {
            filter.push(version.name.clone());
            params.push(Param::Version(id));
        }
        let check = versioned.is_some() || self.config.confirm_deleted_rows;
        PendingOperation {
            kind: OperationKind::Delete,
            entity: descriptor.name.clone(),
            instance: Some(id),
            statement: Statement::Delete {
                table: descriptor.table.clone(),
                filter,
            },
            params,
            key,
            expected_rows: check.then_some(1),
            bumps_version: false,
        }
    }

    fn link_operation(&self, row: &LinkRow, insert: bool) -> Result<PendingOperation> {
        let columns: Vec<String> = row.columns.iter().map(|(c, _, _)| c.clone()).collect();
        let params = row
            .columns
            .iter()
            .map(|(_, id, k)| self.key_param(*id, *k))
            .collect::<Result<Vec<_>>>()?;
        let (kind, statement, expected_rows) = if insert {
            (
                OperationKind::Link,
                Statement::Insert {
                    table: row.table.clone(),
                    columns,
                    returning: None,
                },
                None,
            )
        } else {
            (
                OperationKind::Unlink,
                Statement::Delete {
                    table: row.table.clone(),
                    filter: columns,
                },
                self.config.confirm_deleted_rows.then_some(1),
            )
        };
        Ok(PendingOperation {
            kind,
            entity: row.table.clone(),
            instance: None,
            statement,
            key: params.clone(),
            params,
            expected_rows,
            bumps_version: false,
        })
    }
}
