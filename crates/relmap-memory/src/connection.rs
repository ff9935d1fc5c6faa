//! `MemoryConnection` implementing `relmap_core::Connection`.
//!
//! All state lives in an `Arc<Mutex<>>`, so clones of a connection share one
//! database. Tests keep a clone to inspect rows, read the statement log,
//! inject failures and simulate writes from a concurrent client while a
//! session owns the other handle.

#![allow(clippy::result_large_err)]

use crate::store::Store;
use relmap_core::error::{Error, QueryError, QueryErrorKind};
use relmap_core::{Connection, Cx, ExecuteResult, Mapper, Outcome, Row, Statement, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};

/// One entry of the statement log.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl LoggedStatement {
    /// Whether this entry is an INSERT, UPDATE or DELETE.
    pub fn is_dml(&self) -> bool {
        ["INSERT", "UPDATE", "DELETE"]
            .iter()
            .any(|verb| self.sql.starts_with(verb))
    }
}

#[derive(Debug, Clone)]
struct FailRule {
    table: String,
    verb: &'static str,
    message: String,
}

struct Frame {
    savepoint: Option<String>,
    snapshot: Store,
}

struct MemoryInner {
    store: Store,
    /// Empty when not in a transaction; the first frame is the BEGIN snapshot.
    frames: Vec<Frame>,
    log: Vec<LoggedStatement>,
    batch_calls: usize,
    failures: Vec<FailRule>,
}

/// An in-memory relational database shaped by a mapper's descriptors.
#[derive(Clone)]
pub struct MemoryConnection {
    inner: Arc<Mutex<MemoryInner>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("MemoryConnection")
            .field("tables", &inner.store.tables.len())
            .field("in_transaction", &!inner.frames.is_empty())
            .finish()
    }
}

fn txn_error(message: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Database,
        sql: None,
        message: message.to_string(),
        source: None,
    })
}

impl MemoryConnection {
    /// Create an empty database with one table per entity and link table.
    pub fn new(mapper: &dyn Mapper) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                store: Store::from_mapper(mapper),
                frames: Vec::new(),
                log: Vec::new(),
                batch_calls: 0,
                failures: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Execute a statement synchronously.
    pub fn execute_sync(&self, statement: &Statement, params: &[Value]) -> Result<ExecuteResult, Error> {
        let mut inner = self.lock();
        inner.log.push(LoggedStatement {
            sql: statement.to_sql(),
            params: params.to_vec(),
        });

        if let Some(pos) = inner
            .failures
            .iter()
            .position(|f| f.table == statement.table() && f.verb == statement.verb())
        {
            let rule = inner.failures.remove(pos);
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: Some(statement.to_sql()),
                message: rule.message,
                source: None,
            }));
        }

        if params.len() != statement.param_count() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: Some(statement.to_sql()),
                message: format!(
                    "expected {} parameter(s), got {}",
                    statement.param_count(),
                    params.len()
                ),
                source: None,
            }));
        }

        let result = match statement {
            Statement::Insert {
                columns, returning, ..
            } => {
                let key = inner
                    .store
                    .insert(statement, columns, returning.as_ref(), params)?;
                ExecuteResult {
                    rowcount: 1,
                    generated_keys: key.into_iter().collect(),
                }
            }
            Statement::Update { set, filter, .. } => {
                ExecuteResult::affected(inner.store.update(statement, set, filter, params)?)
            }
            Statement::Delete { filter, .. } => {
                ExecuteResult::affected(inner.store.delete(statement, filter, params)?)
            }
            Statement::Select { .. } => {
                return Err(txn_error("SELECT passed to execute; use query"));
            }
        };
        tracing::trace!(
            sql = %statement.to_sql(),
            rowcount = result.rowcount,
            "memory: executed"
        );
        Ok(result)
    }

    /// Run a SELECT synchronously.
    pub fn query_sync(&self, statement: &Statement, params: &[Value]) -> Result<Vec<Row>, Error> {
        let mut inner = self.lock();
        inner.log.push(LoggedStatement {
            sql: statement.to_sql(),
            params: params.to_vec(),
        });
        match statement {
            Statement::Select {
                columns, filter, ..
            } => inner.store.select(statement, columns, filter, params),
            _ => Err(txn_error("query requires a SELECT statement")),
        }
    }

    fn log_control(inner: &mut MemoryInner, sql: String) {
        inner.log.push(LoggedStatement {
            sql,
            params: Vec::new(),
        });
    }

    pub fn begin_sync(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if !inner.frames.is_empty() {
            return Err(txn_error("Already in a transaction"));
        }
        Self::log_control(&mut inner, "BEGIN".to_string());
        let snapshot = inner.store.clone();
        inner.frames.push(Frame {
            savepoint: None,
            snapshot,
        });
        Ok(())
    }

    pub fn commit_sync(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.frames.is_empty() {
            return Err(txn_error("Not in a transaction"));
        }
        Self::log_control(&mut inner, "COMMIT".to_string());
        inner.frames.clear();
        Ok(())
    }

    pub fn rollback_sync(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.frames.is_empty() {
            return Err(txn_error("Not in a transaction"));
        }
        Self::log_control(&mut inner, "ROLLBACK".to_string());
        let first = inner.frames.swap_remove(0);
        inner.store = first.snapshot;
        inner.frames.clear();
        Ok(())
    }

    pub fn savepoint_sync(&self, name: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.frames.is_empty() {
            return Err(txn_error("SAVEPOINT requires an open transaction"));
        }
        Self::log_control(&mut inner, format!("SAVEPOINT {}", name));
        let snapshot = inner.store.clone();
        inner.frames.push(Frame {
            savepoint: Some(name.to_string()),
            snapshot,
        });
        Ok(())
    }

    fn find_savepoint(inner: &MemoryInner, name: &str) -> Result<usize, Error> {
        inner
            .frames
            .iter()
            .rposition(|f| f.savepoint.as_deref() == Some(name))
            .ok_or_else(|| txn_error(&format!("no such savepoint: {}", name)))
    }

    pub fn rollback_to_sync(&self, name: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        let pos = Self::find_savepoint(&inner, name)?;
        Self::log_control(&mut inner, format!("ROLLBACK TO SAVEPOINT {}", name));
        inner.frames.truncate(pos + 1);
        inner.store = inner.frames[pos].snapshot.clone();
        Ok(())
    }

    pub fn release_sync(&self, name: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        let pos = Self::find_savepoint(&inner, name)?;
        Self::log_control(&mut inner, format!("RELEASE SAVEPOINT {}", name));
        inner.frames.truncate(pos);
        Ok(())
    }

    // ── Test and inspection helpers ──────────────────────────────────────

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        !self.lock().frames.is_empty()
    }

    /// All rows of a table, every column, in insertion order.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>, Error> {
        self.lock().store.all_rows(table)
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).map_or(0, |rows| rows.len())
    }

    /// Insert a row directly, bypassing the log and failure rules.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) -> Result<(), Error> {
        let statement = Statement::Insert {
            table: table.to_string(),
            columns: values.iter().map(|(c, _)| (*c).to_string()).collect(),
            returning: None,
        };
        let params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
        let mut inner = self.lock();
        if let Statement::Insert { columns, .. } = &statement {
            inner.store.insert(&statement, columns, None, &params)?;
        }
        Ok(())
    }

    /// Update rows directly, the way a concurrent client would.
    pub fn external_update(
        &self,
        table: &str,
        filter: &[(&str, Value)],
        set: &[(&str, Value)],
    ) -> Result<u64, Error> {
        let set_cols: Vec<String> = set.iter().map(|(c, _)| (*c).to_string()).collect();
        let filter_cols: Vec<String> = filter.iter().map(|(c, _)| (*c).to_string()).collect();
        let statement = Statement::Update {
            table: table.to_string(),
            set: set_cols.clone(),
            filter: filter_cols.clone(),
        };
        let params: Vec<Value> = set
            .iter()
            .chain(filter)
            .map(|(_, v)| v.clone())
            .collect();
        self.lock()
            .store
            .update(&statement, &set_cols, &filter_cols, &params)
    }

    /// Make the next `verb` ("INSERT", "UPDATE", "DELETE") on `table` fail.
    pub fn fail_next(&self, table: &str, verb: &'static str, message: &str) {
        self.lock().failures.push(FailRule {
            table: table.to_string(),
            verb,
            message: message.to_string(),
        });
    }

    /// Every statement and transaction command seen so far.
    pub fn statement_log(&self) -> Vec<LoggedStatement> {
        self.lock().log.clone()
    }

    /// INSERT, UPDATE and DELETE statements seen so far.
    pub fn dml_log(&self) -> Vec<LoggedStatement> {
        self.lock()
            .log
            .iter()
            .filter(|s| s.is_dml())
            .cloned()
            .collect()
    }

    /// Number of `execute_many` calls received.
    pub fn batch_calls(&self) -> usize {
        self.lock().batch_calls
    }

    pub fn clear_log(&self) {
        let mut inner = self.lock();
        inner.log.clear();
        inner.batch_calls = 0;
    }
}

// ── Connection trait impl ─────────────────────────────────────────────────

macro_rules! ready {
    ($cx:expr, $body:expr) => {{
        let result = match $cx.cancel_reason() {
            Some(reason) => Outcome::Cancelled(reason),
            None => match $body {
                Ok(v) => Outcome::Ok(v),
                Err(e) => Outcome::Err(e),
            },
        };
        async move { result }
    }};
}

impl Connection for MemoryConnection {
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<ExecuteResult, Error>> + Send {
        ready!(cx, self.execute_sync(statement, params))
    }

    fn execute_many(
        &self,
        cx: &Cx,
        statement: &Statement,
        param_sets: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<ExecuteResult>, Error>> + Send {
        ready!(cx, {
            self.lock().batch_calls += 1;
            param_sets
                .iter()
                .map(|params| self.execute_sync(statement, params))
                .collect::<Result<Vec<_>, Error>>()
        })
    }

    fn query(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        ready!(cx, self.query_sync(statement, params))
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready!(cx, self.begin_sync())
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready!(cx, self.commit_sync())
    }

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready!(cx, self.rollback_sync())
    }

    fn savepoint(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready!(cx, self.savepoint_sync(name))
    }

    fn rollback_to(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready!(cx, self.rollback_to_sync(name))
    }

    fn release(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready!(cx, self.release_sync(name))
    }
}
