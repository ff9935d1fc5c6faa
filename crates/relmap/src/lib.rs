//! relmap - a unit-of-work session engine for object-relational mapping.
//!
//! relmap keeps in-memory instances of mapped entities consistent with a
//! relational store:
//!
//! - Identity map: one live instance per primary key
//! - Attribute change tracking with committed baselines
//! - Flush ordering by foreign-key dependencies, with cycle breaking
//! - Optimistic concurrency through version columns
//! - Cascades (save-update, merge, delete, delete-orphan, expunge, refresh-expire)
//! - Transactions, savepoints and an in-memory rollback journal
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! let mapper = Arc::new(
//!     MapperRegistry::builder()
//!         .entity(
//!             EntityDescriptor::new("User", "users")
//!                 .column(ColumnDescriptor::new("id").primary_key().auto_increment())
//!                 .column(ColumnDescriptor::new("name").not_null()),
//!         )
//!         .build()?,
//! );
//! let conn = MemoryConnection::new(mapper.as_ref());
//! let mut session = Session::new(conn, mapper);
//!
//! let user = session.new_instance("User")?;
//! session.set(user, "name", "Alice")?;
//! session.add(user)?;
//! session.commit(&cx).await?;
//! ```

pub use relmap_core::{
    Cascade, ColumnDescriptor, ColumnInfo, Connection, Cx, EntityDescriptor, Error,
    ExecuteResult, LinkTable, Mapper, MapperRegistry, MapperRegistryBuilder, Outcome,
    RelationshipDescriptor, RelationshipKind, Result, Row, Statement, Value,
};
pub use relmap_core::{
    CascadeConfigurationError, ConfigError, CycleError, DetachedAccessError,
    IdentityConflictError, StaleDataError, StaleOperation, TransactionError,
    TransactionErrorKind,
};
pub use relmap_memory::MemoryConnection;
pub use relmap_session::{
    AttrValue, FlushPlan, FlushResult, History, Hook, IdentityConflictPolicy, IdentityKey,
    Instance, InstanceId, InstanceState, MergeOptions, MergePolicy, OperationKind, Session,
    SessionConfig, SessionEvent, TransactionState, UnloadedCollectionPolicy,
};

/// Everything needed to declare a mapping and drive a session.
pub mod prelude {
    pub use crate::{
        AttrValue, ColumnDescriptor, Connection, Cx, EntityDescriptor, Error, FlushResult,
        InstanceId, InstanceState, LinkTable, Mapper, MapperRegistry, MemoryConnection,
        MergeOptions, Outcome, RelationshipDescriptor, Result, Session, SessionConfig, Value,
    };
    pub use std::sync::Arc;
}
