//! Core types and traits for relmap.
//!
//! This crate provides the contracts shared by the session engine and the
//! drivers underneath it:
//!
//! - `Value` and `Row` for column data
//! - `Statement` shapes and the `Connection` trait that executes them
//! - `Mapper` and the `MapperRegistry` of entity descriptors
//! - `Error` with one variant per failure the unit of work can report
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod mapper;
pub mod row;
pub mod statement;
pub mod value;

pub use connection::Connection;
pub use error::{
    CascadeConfigurationError, ConfigError, ConnectionError, ConnectionErrorKind, CycleError,
    DetachedAccessError, Error, IdentityConflictError, QueryError, QueryErrorKind, Result,
    StaleDataError, StaleOperation, TransactionError, TransactionErrorKind, TypeError,
};
pub use mapper::{
    Cascade, ColumnDescriptor, EntityDescriptor, LinkTable, Mapper, MapperRegistry,
    MapperRegistryBuilder, RelationshipDescriptor, RelationshipKind,
};
pub use row::{ColumnInfo, Row};
pub use statement::{ExecuteResult, Statement, quote_ident};
pub use value::Value;
