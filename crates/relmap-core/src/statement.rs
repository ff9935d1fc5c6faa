//! Statement shapes emitted by the unit of work.
//!
//! The session never builds SQL text itself. It hands a [`Statement`] (table,
//! column lists, equality filter) plus positional parameters to the
//! [`Connection`](crate::Connection), which is free to compile it for its
//! dialect. [`Statement::to_sql`] renders a portable ANSI form used for
//! logging and by simple drivers.
//!
//! Parameter order:
//!
//! - `Insert`: one value per entry in `columns`
//! - `Update`: `set` values followed by `filter` values
//! - `Delete`, `Select`: `filter` values

use std::fmt::Write as _;

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them.
///
/// ```
/// use relmap_core::quote_ident;
///
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A parameterized statement shape.
///
/// Two statements that compare equal can share one `execute_many` call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Statement {
    Insert {
        table: String,
        columns: Vec<String>,
        /// Column whose generated value the connection must report back
        returning: Option<String>,
    },
    Update {
        table: String,
        set: Vec<String>,
        filter: Vec<String>,
    },
    Delete {
        table: String,
        filter: Vec<String>,
    },
    Select {
        table: String,
        columns: Vec<String>,
        filter: Vec<String>,
    },
}

impl Statement {
    /// Target table name.
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. }
            | Statement::Select { table, .. } => table,
        }
    }

    /// Short verb for logs and errors.
    pub const fn verb(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "INSERT",
            Statement::Update { .. } => "UPDATE",
            Statement::Delete { .. } => "DELETE",
            Statement::Select { .. } => "SELECT",
        }
    }

    /// Number of positional parameters the statement expects.
    pub fn param_count(&self) -> usize {
        match self {
            Statement::Insert { columns, .. } => columns.len(),
            Statement::Update { set, filter, .. } => set.len() + filter.len(),
            Statement::Delete { filter, .. } | Statement::Select { filter, .. } => filter.len(),
        }
    }

    /// Render ANSI SQL with `$n` placeholders.
    pub fn to_sql(&self) -> String {
        let mut sql = String::new();
        let mut next = 1usize;
        match self {
            Statement::Insert {
                table,
                columns,
                returning,
            } => {
                let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
                let placeholders: Vec<String> =
                    (1..=columns.len()).map(|i| format!("${}", i)).collect();
                if columns.is_empty() {
                    let _ = write!(sql, "INSERT INTO {} DEFAULT VALUES", quote_ident(table));
                } else {
                    let _ = write!(
                        sql,
                        "INSERT INTO {} ({}) VALUES ({})",
                        quote_ident(table),
                        cols.join(", "),
                        placeholders.join(", ")
                    );
                }
                if let Some(col) = returning {
                    let _ = write!(sql, " RETURNING {}", quote_ident(col));
                }
            }
            Statement::Update { table, set, filter } => {
                let assignments: Vec<String> = set
                    .iter()
                    .map(|c| {
                        let s = format!("{} = ${}", quote_ident(c), next);
                        next += 1;
                        s
                    })
                    .collect();
                let _ = write!(
                    sql,
                    "UPDATE {} SET {}",
                    quote_ident(table),
                    assignments.join(", ")
                );
                push_where(&mut sql, filter, next);
            }
            Statement::Delete { table, filter } => {
                let _ = write!(sql, "DELETE FROM {}", quote_ident(table));
                push_where(&mut sql, filter, next);
            }
            Statement::Select {
                table,
                columns,
                filter,
            } => {
                let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
                let _ = write!(
                    sql,
                    "SELECT {} FROM {}",
                    cols.join(", "),
                    quote_ident(table)
                );
                push_where(&mut sql, filter, next);
            }
        }
        sql
    }
}

fn push_where(sql: &mut String, filter: &[String], first_param: usize) {
    if filter.is_empty() {
        return;
    }
    let clauses: Vec<String> = filter
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(c), first_param + i))
        .collect();
    let _ = write!(sql, " WHERE {}", clauses.join(" AND "));
}

/// Result of executing one parameter set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteResult {
    /// Rows matched by the statement
    pub rowcount: u64,
    /// Value of the `returning` column for each inserted row
    pub generated_keys: Vec<crate::Value>,
}

impl ExecuteResult {
    pub fn affected(rowcount: u64) -> Self {
        Self {
            rowcount,
            generated_keys: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_insert_sql() {
        let stmt = Statement::Insert {
            table: "child".to_string(),
            columns: cols(&["name", "parent_id"]),
            returning: Some("id".to_string()),
        };
        assert_eq!(
            stmt.to_sql(),
            "INSERT INTO \"child\" (\"name\", \"parent_id\") VALUES ($1, $2) RETURNING \"id\""
        );
        assert_eq!(stmt.param_count(), 2);
    }

    #[test]
    fn test_insert_without_columns_uses_defaults() {
        let stmt = Statement::Insert {
            table: "node".to_string(),
            columns: Vec::new(),
            returning: Some("id".to_string()),
        };
        assert_eq!(
            stmt.to_sql(),
            "INSERT INTO \"node\" DEFAULT VALUES RETURNING \"id\""
        );
    }

    #[test]
    fn test_update_numbers_filter_after_set() {
        let stmt = Statement::Update {
            table: "account".to_string(),
            set: cols(&["balance", "version"]),
            filter: cols(&["id", "version"]),
        };
        assert_eq!(
            stmt.to_sql(),
            "UPDATE \"account\" SET \"balance\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
        );
        assert_eq!(stmt.param_count(), 4);
    }

    #[test]
    fn test_delete_and_select_sql() {
        let delete = Statement::Delete {
            table: "parent".to_string(),
            filter: cols(&["id"]),
        };
        assert_eq!(delete.to_sql(), "DELETE FROM \"parent\" WHERE \"id\" = $1");
        assert_eq!(delete.verb(), "DELETE");

        let select = Statement::Select {
            table: "child".to_string(),
            columns: cols(&["id", "name"]),
            filter: cols(&["parent_id"]),
        };
        assert_eq!(
            select.to_sql(),
            "SELECT \"id\", \"name\" FROM \"child\" WHERE \"parent_id\" = $1"
        );
        assert_eq!(select.table(), "child");
    }

    #[test]
    fn test_same_shape_statements_compare_equal() {
        let a = Statement::Delete {
            table: "t".to_string(),
            filter: cols(&["id"]),
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
