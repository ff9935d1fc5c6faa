//! The connection service consumed by the session.
//!
//! All operations are async and take a `Cx` context for cancellation and
//! budget handling. Transaction control is explicit: the session owns the
//! transaction lifecycle and drives it through `begin`/`commit`/`rollback`
//! and named savepoints.

use crate::row::Row;
use crate::statement::{ExecuteResult, Statement};
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A database connection capable of executing statement shapes.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
pub trait Connection: Send + Sync {
    /// Execute an INSERT, UPDATE or DELETE with one parameter set.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<ExecuteResult, crate::Error>> + Send;

    /// Execute one statement shape once per parameter set.
    ///
    /// Returns one result per parameter set, in order. Drivers with a native
    /// batch API should override this; the default runs sets sequentially and
    /// stops at the first failure.
    fn execute_many(
        &self,
        cx: &Cx,
        statement: &Statement,
        param_sets: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<ExecuteResult>, crate::Error>> + Send {
        async move {
            let mut results = Vec::with_capacity(param_sets.len());
            for params in param_sets {
                match self.execute(cx, statement, params).await {
                    Outcome::Ok(result) => results.push(result),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            Outcome::Ok(results)
        }
    }

    /// Execute a SELECT and return all rows.
    fn query(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Commit the current transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll back the current transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Create a savepoint inside the current transaction.
    fn savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll back to a savepoint, keeping the savepoint itself.
    fn rollback_to(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Release a savepoint.
    fn release(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}
