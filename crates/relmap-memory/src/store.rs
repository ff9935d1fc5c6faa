//! Tables, rows and constraint enforcement.

#![allow(clippy::result_large_err)]

use relmap_core::error::{Error, QueryError, QueryErrorKind};
use relmap_core::{Mapper, RelationshipKind, Row, Statement, Value};
use std::collections::BTreeMap;

/// A foreign key constraint enforced on insert, update and delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub table: String,
    pub ref_columns: Vec<String>,
}

/// Shape of one table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub auto_increment: Option<String>,
    pub not_null: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            auto_increment: None,
            not_null: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    fn add_foreign_key(&mut self, fk: ForeignKey) {
        if !self.foreign_keys.contains(&fk) {
            self.foreign_keys.push(fk);
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub(crate) schema: TableSchema,
    pub(crate) rows: Vec<Vec<Value>>,
    next_id: i64,
}

/// The whole database. Cloned wholesale for transaction snapshots.
#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    pub(crate) tables: BTreeMap<String, Table>,
}

fn not_found(message: String, statement: Option<&Statement>) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        sql: statement.map(Statement::to_sql),
        message,
        source: None,
    })
}

fn constraint(message: String, statement: &Statement) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Constraint,
        sql: Some(statement.to_sql()),
        message,
        source: None,
    })
}

/// SQL equality: NULL matches nothing.
fn row_matches(row: &[Value], filter: &[(usize, &Value)]) -> bool {
    filter
        .iter()
        .all(|(i, v)| !v.is_null() && !row[*i].is_null() && row[*i].same_as(v))
}

impl Store {
    /// Derive tables from entity descriptors, including many-to-many link tables.
    pub(crate) fn from_mapper(mapper: &dyn Mapper) -> Self {
        let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();
        let table_of = |entity: &str| mapper.entity(entity).map(|e| e.table.clone());

        for entity in mapper.entities() {
            let mut schema = TableSchema::new(entity.table.clone());
            for col in &entity.columns {
                schema.columns.push(col.name.clone());
                if col.primary_key {
                    schema.primary_key.push(col.name.clone());
                }
                if col.auto_increment {
                    schema.auto_increment = Some(col.name.clone());
                }
                if !col.nullable {
                    schema.not_null.push(col.name.clone());
                }
                if let Some((target, target_col)) = &col.foreign_key {
                    if let Some(table) = table_of(target) {
                        schema.add_foreign_key(ForeignKey {
                            columns: vec![col.name.clone()],
                            table,
                            ref_columns: vec![target_col.clone()],
                        });
                    }
                }
            }
            tables.insert(entity.table.clone(), schema);
        }

        for entity in mapper.entities() {
            for rel in &entity.relationships {
                let Some(target) = mapper.entity(&rel.target) else {
                    continue;
                };
                match rel.kind {
                    RelationshipKind::ManyToOne => {
                        if let Some(schema) = tables.get_mut(&entity.table) {
                            schema.add_foreign_key(ForeignKey {
                                columns: rel.foreign_key.clone(),
                                table: target.table.clone(),
                                ref_columns: target.primary_key_names(),
                            });
                        }
                    }
                    RelationshipKind::OneToMany => {
                        if let Some(schema) = tables.get_mut(&target.table) {
                            schema.add_foreign_key(ForeignKey {
                                columns: rel.foreign_key.clone(),
                                table: entity.table.clone(),
                                ref_columns: entity.primary_key_names(),
                            });
                        }
                    }
                    RelationshipKind::ManyToMany => {
                        let Some(link) = &rel.link else { continue };
                        let schema = tables
                            .entry(link.table.clone())
                            .or_insert_with(|| TableSchema::new(link.table.clone()));
                        for col in link.local_columns.iter().chain(&link.remote_columns) {
                            if schema.index_of(col).is_none() {
                                schema.columns.push(col.clone());
                                schema.primary_key.push(col.clone());
                                schema.not_null.push(col.clone());
                            }
                        }
                        schema.add_foreign_key(ForeignKey {
                            columns: link.local_columns.clone(),
                            table: entity.table.clone(),
                            ref_columns: entity.primary_key_names(),
                        });
                        schema.add_foreign_key(ForeignKey {
                            columns: link.remote_columns.clone(),
                            table: target.table.clone(),
                            ref_columns: target.primary_key_names(),
                        });
                    }
                }
            }
        }

        Store {
            tables: tables
                .into_iter()
                .map(|(name, schema)| {
                    (
                        name,
                        Table {
                            schema,
                            rows: Vec::new(),
                            next_id: 1,
                        },
                    )
                })
                .collect(),
        }
    }

    fn table(&self, name: &str, statement: Option<&Statement>) -> Result<&Table, Error> {
        self.tables
            .get(name)
            .ok_or_else(|| not_found(format!("no such table: {}", name), statement))
    }

    fn table_mut(&mut self, name: &str, statement: &Statement) -> Result<&mut Table, Error> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| not_found(format!("no such table: {}", name), Some(statement)))
    }

    fn resolve_filter<'a>(
        table: &Table,
        columns: &[String],
        values: &'a [Value],
        statement: &Statement,
    ) -> Result<Vec<(usize, &'a Value)>, Error> {
        columns
            .iter()
            .zip(values)
            .map(|(c, v)| {
                table
                    .schema
                    .index_of(c)
                    .map(|i| (i, v))
                    .ok_or_else(|| {
                        not_found(
                            format!("no such column: {}.{}", table.schema.name, c),
                            Some(statement),
                        )
                    })
            })
            .collect()
    }

    /// Check NOT NULL and outgoing foreign keys of a candidate row.
    fn check_row(&self, table: &Table, row: &[Value], statement: &Statement) -> Result<(), Error> {
        for col in &table.schema.not_null {
            if let Some(i) = table.schema.index_of(col) {
                if row[i].is_null() {
                    return Err(constraint(
                        format!("NOT NULL constraint failed: {}.{}", table.schema.name, col),
                        statement,
                    ));
                }
            }
        }
        for fk in &table.schema.foreign_keys {
            let values: Vec<&Value> = fk
                .columns
                .iter()
                .filter_map(|c| table.schema.index_of(c).map(|i| &row[i]))
                .collect();
            if values.len() != fk.columns.len() || values.iter().any(|v| v.is_null()) {
                continue;
            }
            let parent = self.table(&fk.table, Some(statement))?;
            let filter: Vec<(usize, &Value)> = fk
                .ref_columns
                .iter()
                .zip(values.iter().copied())
                .filter_map(|(c, v)| parent.schema.index_of(c).map(|i| (i, v)))
                .collect();
            if !parent
                .rows
                .iter()
                .any(|r| row_matches(r, &filter))
            {
                return Err(constraint(
                    format!(
                        "FOREIGN KEY constraint failed: {}({}) -> {}",
                        table.schema.name,
                        fk.columns.join(", "),
                        fk.table
                    ),
                    statement,
                ));
            }
        }
        Ok(())
    }

    fn check_unique_pk(
        table: &Table,
        row: &[Value],
        skip: Option<usize>,
        statement: &Statement,
    ) -> Result<(), Error> {
        let filter: Vec<(usize, &Value)> = table
            .schema
            .primary_key
            .iter()
            .filter_map(|c| table.schema.index_of(c).map(|i| (i, &row[i])))
            .collect();
        let clash = table
            .rows
            .iter()
            .enumerate()
            .any(|(n, r)| Some(n) != skip && row_matches(r, &filter));
        if clash {
            return Err(constraint(
                format!(
                    "UNIQUE constraint failed: {}({})",
                    table.schema.name,
                    table.schema.primary_key.join(", ")
                ),
                statement,
            ));
        }
        Ok(())
    }

    /// Fail if any row elsewhere still references `row` of `table_name`.
    fn check_not_referenced(
        &self,
        table_name: &str,
        row: &[Value],
        statement: &Statement,
    ) -> Result<(), Error> {
        let Some(table) = self.tables.get(table_name) else {
            return Ok(());
        };
        for child in self.tables.values() {
            for fk in child.schema.foreign_keys.iter().filter(|fk| fk.table == table_name) {
                let filter: Vec<(usize, &Value)> = fk
                    .columns
                    .iter()
                    .zip(&fk.ref_columns)
                    .filter_map(|(c, rc)| {
                        let ci = child.schema.index_of(c)?;
                        let ri = table.schema.index_of(rc)?;
                        Some((ci, &row[ri]))
                    })
                    .collect();
                if child
                    .rows
                    .iter()
                    .any(|r| row_matches(r, &filter))
                {
                    return Err(constraint(
                        format!(
                            "FOREIGN KEY constraint failed: {} row still referenced by {}",
                            table_name, child.schema.name
                        ),
                        statement,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Insert one row; returns the value of `returning`, if requested.
    pub(crate) fn insert(
        &mut self,
        statement: &Statement,
        columns: &[String],
        returning: Option<&String>,
        params: &[Value],
    ) -> Result<Option<Value>, Error> {
        let table = self.table(statement.table(), Some(statement))?;
        let mut row = vec![Value::Null; table.schema.columns.len()];
        for (i, v) in Self::resolve_filter(table, columns, params, statement)? {
            row[i] = if matches!(v, Value::Default) {
                Value::Null
            } else {
                v.clone()
            };
        }

        let mut next_id = table.next_id;
        if let Some(auto) = &table.schema.auto_increment {
            if let Some(i) = table.schema.index_of(auto) {
                match row[i].as_i64() {
                    Some(explicit) => next_id = next_id.max(explicit + 1),
                    None if row[i].is_null() => {
                        row[i] = Value::BigInt(next_id);
                        next_id += 1;
                    }
                    None => {}
                }
            }
        }

        Self::check_unique_pk(table, &row, None, statement)?;
        self.check_row(table, &row, statement)?;

        let returned = returning.and_then(|c| table.schema.index_of(c).map(|i| row[i].clone()));
        let table = self.table_mut(statement.table(), statement)?;
        table.next_id = next_id;
        table.rows.push(row);
        Ok(returned)
    }

    pub(crate) fn update(
        &mut self,
        statement: &Statement,
        set: &[String],
        filter: &[String],
        params: &[Value],
    ) -> Result<u64, Error> {
        let (set_values, filter_values) = params.split_at(set.len().min(params.len()));
        let table = self.table(statement.table(), Some(statement))?;
        let assignments = Self::resolve_filter(table, set, set_values, statement)?;
        let predicate = Self::resolve_filter(table, filter, filter_values, statement)?;

        let mut changed = Vec::new();
        for (n, row) in table.rows.iter().enumerate() {
            if row_matches(row, &predicate) {
                let mut new_row = row.clone();
                for (i, v) in &assignments {
                    new_row[*i] = (*v).clone();
                }
                Self::check_unique_pk(table, &new_row, Some(n), statement)?;
                self.check_row(table, &new_row, statement)?;
                changed.push((n, new_row));
            }
        }

        let count = changed.len() as u64;
        let table = self.table_mut(statement.table(), statement)?;
        for (n, row) in changed {
            table.rows[n] = row;
        }
        Ok(count)
    }

    pub(crate) fn delete(
        &mut self,
        statement: &Statement,
        filter: &[String],
        params: &[Value],
    ) -> Result<u64, Error> {
        let table = self.table(statement.table(), Some(statement))?;
        let predicate = Self::resolve_filter(table, filter, params, statement)?;
        let doomed: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| row_matches(r, &predicate))
            .map(|(n, _)| n)
            .collect();

        // Rows deleted by this statement may reference each other.
        let mut scratch = self.clone();
        if let Some(t) = scratch.tables.get_mut(statement.table()) {
            let mut n = 0;
            t.rows.retain(|_| {
                let keep = !doomed.contains(&n);
                n += 1;
                keep
            });
        }
        for &n in &doomed {
            scratch.check_not_referenced(statement.table(), &table.rows[n], statement)?;
        }

        let count = doomed.len() as u64;
        *self = scratch;
        Ok(count)
    }

    pub(crate) fn select(
        &self,
        statement: &Statement,
        columns: &[String],
        filter: &[String],
        params: &[Value],
    ) -> Result<Vec<Row>, Error> {
        let table = self.table(statement.table(), Some(statement))?;
        let predicate = Self::resolve_filter(table, filter, params, statement)?;
        let projection: Vec<usize> = columns
            .iter()
            .map(|c| {
                table.schema.index_of(c).ok_or_else(|| {
                    not_found(
                        format!("no such column: {}.{}", table.schema.name, c),
                        Some(statement),
                    )
                })
            })
            .collect::<Result<_, _>>()?;
        let info = std::sync::Arc::new(relmap_core::ColumnInfo::new(columns.to_vec()));
        Ok(table
            .rows
            .iter()
            .filter(|r| row_matches(r, &predicate))
            .map(|r| {
                Row::with_columns(
                    std::sync::Arc::clone(&info),
                    projection.iter().map(|&i| r[i].clone()).collect(),
                )
            })
            .collect())
    }

    pub(crate) fn all_rows(&self, table: &str) -> Result<Vec<Row>, Error> {
        let t = self.table(table, None)?;
        let info = std::sync::Arc::new(relmap_core::ColumnInfo::new(t.schema.columns.clone()));
        Ok(t.rows
            .iter()
            .map(|r| Row::with_columns(std::sync::Arc::clone(&info), r.clone()))
            .collect())
    }
}
