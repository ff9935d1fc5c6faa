//! Running a plan against a connection.
//!
//! Consecutive operations of the same shape go to the store as one batch.
//! Generated keys and version counters are collected in a [`FlushOutput`]
//! so later parameters can refer to them.

use super::{FlushPlan, FlushResult, OperationKind, Param, PendingOperation};
use crate::attributes::InstanceId;
use relmap_core::error::{StaleDataError, StaleOperation};
use relmap_core::{Connection, Cx, Error, ExecuteResult, Outcome, Result, Value};
use std::collections::HashMap;

/// State learned while executing a plan.
#[derive(Debug, Default)]
pub(crate) struct FlushOutput {
    pub(crate) keys: HashMap<InstanceId, Vec<Value>>,
    pub(crate) versions: HashMap<InstanceId, i64>,
    pub(crate) result: FlushResult,
}

impl FlushOutput {
    pub(crate) fn resolve(&self, param: &Param) -> Result<Value> {
        match param {
            Param::Value(v) => Ok(v.clone()),
            Param::Key { instance, index } => self
                .keys
                .get(instance)
                .and_then(|k| k.get(*index))
                .cloned()
                .ok_or_else(|| {
                    Error::invalid_request(format!(
                        "primary key of {} is not known; is it part of this flush?",
                        instance
                    ))
                }),
            Param::Version(id) => self.version(*id).map(Value::BigInt),
            Param::NextVersion(id) => self.version(*id).map(|v| Value::BigInt(v + 1)),
        }
    }

    fn version(&self, id: InstanceId) -> Result<i64> {
        self.versions
            .get(&id)
            .copied()
            .ok_or_else(|| Error::invalid_request(format!("no version tracked for {}", id)))
    }

    fn resolve_all(&self, params: &[Param]) -> Result<Vec<Value>> {
        params.iter().map(|p| self.resolve(p)).collect()
    }

    fn stale(&self, op: &PendingOperation, actual: u64) -> Error {
        let operation = match op.kind {
            OperationKind::Delete | OperationKind::Unlink => StaleOperation::Delete,
            _ => StaleOperation::Update,
        };
        let version = op
            .instance
            .and_then(|id| self.versions.get(&id).copied())
            .map(Value::BigInt);
        Error::StaleData(StaleDataError {
            entity: op.entity.clone(),
            key: op
                .key
                .iter()
                .map(|p| self.resolve(p).unwrap_or(Value::Null))
                .collect(),
            operation,
            expected_rows: op.expected_rows.unwrap_or(1),
            actual_rows: actual,
            version,
        })
    }

    /// Check one statement's result and record what it taught us.
    fn absorb(&mut self, op: &PendingOperation, result: &ExecuteResult) -> Result<()> {
        if let Some(expected) = op.expected_rows {
            if result.rowcount != expected {
                return Err(self.stale(op, result.rowcount));
            }
        }
        if op.returns_key() {
            let (Some(id), Some(key)) = (op.instance, result.generated_keys.first()) else {
                return Err(Error::Custom(format!(
                    "INSERT into {} did not report a generated key",
                    op.entity
                )));
            };
            self.keys.insert(id, vec![key.clone()]);
        }
        if op.bumps_version {
            if let Some(id) = op.instance {
                let next = self.version(id)? + 1;
                self.versions.insert(id, next);
            }
        }
        self.result.record(op.kind);
        Ok(())
    }
}

impl FlushPlan {
    /// Execute every operation in order, stopping at the first failure.
    #[tracing::instrument(level = "info", skip(self, cx, conn), fields(operations = self.operations.len()))]
    pub(crate) async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        batch: bool,
    ) -> Outcome<FlushOutput, Error> {
        tracing::info!(operations = self.operations.len(), "Executing flush plan");

        let mut output = FlushOutput {
            versions: self.versions.clone(),
            ..FlushOutput::default()
        };

        let ops = &self.operations;
        let mut i = 0;
        while i < ops.len() {
            let mut end = i + 1;
            if batch {
                while end < ops.len() && ops[i].batches_with(&ops[end]) {
                    end += 1;
                }
            }
            let group = &ops[i..end];

            if group.len() == 1 {
                let op = &group[0];
                let params = try_result!(output.resolve_all(&op.params));
                tracing::debug!(
                    kind = ?op.kind,
                    entity = %op.entity,
                    instance = ?op.instance,
                    sql = %op.statement.to_sql(),
                    "Executing flush operation"
                );
                let result = try_outcome!(conn.execute(cx, &op.statement, &params).await);
                try_result!(output.absorb(op, &result));
            } else {
                let mut rows = Vec::with_capacity(group.len());
                for op in group {
                    rows.push(try_result!(output.resolve_all(&op.params)));
                }
                tracing::debug!(
                    kind = ?group[0].kind,
                    entity = %group[0].entity,
                    rows = group.len(),
                    sql = %group[0].statement.to_sql(),
                    "Executing batched flush operation"
                );
                let results = try_outcome!(conn.execute_many(cx, &group[0].statement, &rows).await);
                if results.len() != group.len() {
                    return Outcome::Err(Error::Custom(format!(
                        "batch of {} statements reported {} results",
                        group.len(),
                        results.len()
                    )));
                }
                output.result.batches += 1;
                for (op, result) in group.iter().zip(&results) {
                    try_result!(output.absorb(op, result));
                }
            }
            i = end;
        }

        tracing::info!(
            inserted = output.result.inserted,
            updated = output.result.updated,
            deleted = output.result.deleted,
            post_updates = output.result.post_updates,
            linked = output.result.linked,
            unlinked = output.result.unlinked,
            "Flush complete"
        );
        Outcome::Ok(output)
    }
}
