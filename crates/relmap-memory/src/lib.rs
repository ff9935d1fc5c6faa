//! In-memory driver for relmap.
//!
//! `relmap-memory` is a small relational store that implements the
//! `Connection` trait from `relmap-core`. Its tables are derived from a
//! mapper's entity descriptors and it enforces the constraints a real
//! database would reject a badly ordered flush with:
//!
//! - NOT NULL columns
//! - primary key uniqueness, with auto-increment keys reported back
//! - foreign keys, checked immediately on INSERT/UPDATE and as RESTRICT on DELETE
//!
//! Transactions and savepoints are snapshot based. Every statement is logged
//! so tests can assert on exactly what a flush emitted.

pub mod connection;
pub mod store;

pub use connection::{LoggedStatement, MemoryConnection};
pub use store::{ForeignKey, TableSchema};

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::{
        ColumnDescriptor, Connection, Cx, EntityDescriptor, Error, LinkTable, MapperRegistry,
        Outcome, RelationshipDescriptor, Statement, Value,
    };

    fn registry() -> MapperRegistry {
        MapperRegistry::builder()
            .entity(
                EntityDescriptor::new("Parent", "parent")
                    .column(ColumnDescriptor::new("id").primary_key().auto_increment())
                    .column(ColumnDescriptor::new("name").not_null())
                    .relationship(
                        RelationshipDescriptor::one_to_many("children", "Child", &["parent_id"]),
                    )
                    .relationship(RelationshipDescriptor::many_to_many(
                        "tags",
                        "Tag",
                        LinkTable::new("parent_tag", &["parent_id"], &["tag_id"]),
                    )),
            )
            .entity(
                EntityDescriptor::new("Child", "child")
                    .column(ColumnDescriptor::new("id").primary_key().auto_increment())
                    .column(ColumnDescriptor::new("parent_id").not_null()),
            )
            .entity(
                EntityDescriptor::new("Tag", "tag")
                    .column(ColumnDescriptor::new("id").primary_key()),
            )
            .build()
            .unwrap()
    }

    fn insert(table: &str, cols: &[&str]) -> Statement {
        Statement::Insert {
            table: table.to_string(),
            columns: cols.iter().map(|c| (*c).to_string()).collect(),
            returning: Some("id".to_string()).filter(|_| table != "parent_tag"),
        }
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    #[test]
    fn insert_reports_generated_keys() {
        let conn = MemoryConnection::new(&registry());
        let stmt = insert("parent", &["name"]);

        let first = conn.execute_sync(&stmt, &[Value::from("a")]).unwrap();
        let second = conn.execute_sync(&stmt, &[Value::from("b")]).unwrap();

        assert_eq!(first.generated_keys, vec![Value::BigInt(1)]);
        assert_eq!(second.generated_keys, vec![Value::BigInt(2)]);
        assert_eq!(conn.row_count("parent"), 2);
    }

    #[test]
    fn enforces_not_null_and_foreign_keys() {
        let conn = MemoryConnection::new(&registry());

        let err = conn
            .execute_sync(&insert("parent", &["name"]), &[Value::Null])
            .unwrap_err();
        assert!(err.is_constraint_violation());

        let err = conn
            .execute_sync(&insert("child", &["parent_id"]), &[Value::BigInt(99)])
            .unwrap_err();
        assert!(err.to_string().contains("FOREIGN KEY"));
    }

    #[test]
    fn delete_is_restricted_while_referenced() {
        let conn = MemoryConnection::new(&registry());
        conn.execute_sync(&insert("parent", &["name"]), &[Value::from("p")])
            .unwrap();
        conn.execute_sync(&insert("child", &["parent_id"]), &[Value::BigInt(1)])
            .unwrap();

        let delete_parent = Statement::Delete {
            table: "parent".to_string(),
            filter: vec!["id".to_string()],
        };
        assert!(
            conn.execute_sync(&delete_parent, &[Value::BigInt(1)])
                .unwrap_err()
                .is_constraint_violation()
        );

        let delete_child = Statement::Delete {
            table: "child".to_string(),
            filter: vec!["id".to_string()],
        };
        assert_eq!(
            conn.execute_sync(&delete_child, &[Value::BigInt(1)])
                .unwrap()
                .rowcount,
            1
        );
        assert_eq!(
            conn.execute_sync(&delete_parent, &[Value::BigInt(1)])
                .unwrap()
                .rowcount,
            1
        );
    }

    #[test]
    fn link_table_is_created_for_many_to_many() {
        let conn = MemoryConnection::new(&registry());
        conn.execute_sync(&insert("parent", &["name"]), &[Value::from("p")])
            .unwrap();
        conn.seed("tag", &[("id", Value::BigInt(7))]).unwrap();

        let link = insert("parent_tag", &["parent_id", "tag_id"]);
        conn.execute_sync(&link, &[Value::BigInt(1), Value::BigInt(7)])
            .unwrap();
        assert!(
            conn.execute_sync(&link, &[Value::BigInt(1), Value::BigInt(7)])
                .unwrap_err()
                .to_string()
                .contains("UNIQUE")
        );
    }

    #[test]
    fn update_rowcount_reflects_filter() {
        let conn = MemoryConnection::new(&registry());
        conn.execute_sync(&insert("parent", &["name"]), &[Value::from("p")])
            .unwrap();

        let stmt = Statement::Update {
            table: "parent".to_string(),
            set: vec!["name".to_string()],
            filter: vec!["id".to_string(), "name".to_string()],
        };
        let miss = conn
            .execute_sync(&stmt, &[Value::from("q"), Value::BigInt(1), Value::from("zzz")])
            .unwrap();
        assert_eq!(miss.rowcount, 0);

        let hit = conn
            .execute_sync(&stmt, &[Value::from("q"), Value::BigInt(1), Value::from("p")])
            .unwrap();
        assert_eq!(hit.rowcount, 1);
    }

    #[test]
    fn transactions_and_savepoints() {
        let conn = MemoryConnection::new(&registry());
        let stmt = insert("parent", &["name"]);

        conn.begin_sync().unwrap();
        conn.execute_sync(&stmt, &[Value::from("kept")]).unwrap();
        conn.savepoint_sync("sp1").unwrap();
        conn.execute_sync(&stmt, &[Value::from("dropped")]).unwrap();
        conn.rollback_to_sync("sp1").unwrap();
        conn.release_sync("sp1").unwrap();
        conn.commit_sync().unwrap();

        let rows = conn.rows("parent").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("name"), Some(&Value::from("kept")));

        conn.begin_sync().unwrap();
        conn.execute_sync(&stmt, &[Value::from("gone")]).unwrap();
        conn.rollback_sync().unwrap();
        assert_eq!(conn.row_count("parent"), 1);
        assert!(!conn.in_transaction());
    }

    #[test]
    fn injected_failure_fires_once() {
        let conn = MemoryConnection::new(&registry());
        conn.fail_next("parent", "INSERT", "disk full");
        let stmt = insert("parent", &["name"]);

        let err = conn.execute_sync(&stmt, &[Value::from("a")]).unwrap_err();
        assert!(err.to_string().contains("disk full"));
        conn.execute_sync(&stmt, &[Value::from("a")]).unwrap();
        assert_eq!(conn.dml_log().len(), 2);
    }

    #[test]
    fn async_surface_counts_batches() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MemoryConnection::new(&registry());

        rt.block_on(async {
            let stmt = insert("parent", &["name"]);
            let results = unwrap_outcome(
                conn.execute_many(
                    &cx,
                    &stmt,
                    &[vec![Value::from("a")], vec![Value::from("b")]],
                )
                .await,
            );
            assert_eq!(results.len(), 2);

            let select = Statement::Select {
                table: "parent".to_string(),
                columns: vec!["name".to_string()],
                filter: vec!["id".to_string()],
            };
            let rows = unwrap_outcome(conn.query(&cx, &select, &[Value::BigInt(2)]).await);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get(0), Some(&Value::from("b")));
        });

        assert_eq!(conn.batch_calls(), 1);
    }
}
