//! Error types for relmap operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors reported by a `Connection` implementation
    Connection(ConnectionError),
    /// Statement execution errors reported by a `Connection` implementation
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Two live instances claim the same identity key
    IdentityConflict(IdentityConflictError),
    /// Unloaded attribute read on a detached instance
    DetachedAccess(DetachedAccessError),
    /// Version check or expected row count mismatch during flush
    StaleData(StaleDataError),
    /// Dependency cycle with no nullable foreign key to break it
    UnresolvableCycle(CycleError),
    /// Invalid cascade configuration detected at plan time
    CascadeConfiguration(CascadeConfigurationError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Mapper registry or session configuration errors
    Config(ConfigError),
    /// API misuse: unknown entity or attribute, stale handle, wrong lifecycle state
    InvalidRequest(String),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection was closed by the caller
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock or serialization failure
    Serialization,
    /// Cancelled
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct IdentityConflictError {
    pub entity: String,
    pub key: Vec<Value>,
    pub message: String,
}

#[derive(Debug)]
pub struct DetachedAccessError {
    pub entity: String,
    pub attribute: String,
}

/// Which statement kind observed the stale row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleOperation {
    Update,
    Delete,
    /// Reloading a persistent row found it missing
    Load,
}

#[derive(Debug)]
pub struct StaleDataError {
    pub entity: String,
    pub key: Vec<Value>,
    pub operation: StaleOperation,
    pub expected_rows: u64,
    pub actual_rows: u64,
    /// Version value used in the WHERE clause, if the entity is versioned
    pub version: Option<Value>,
}

#[derive(Debug)]
pub struct CycleError {
    /// Entity names participating in the cycle, in registration order
    pub entities: Vec<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct CascadeConfigurationError {
    pub entity: String,
    pub relationship: String,
    pub message: String,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A previous flush failed; only rollback is accepted
    Invalid,
    /// No transaction is in progress
    NotActive,
    /// A transaction is already in progress
    AlreadyActive,
    /// Savepoint not found
    SavepointNotFound,
    /// Operation not permitted while a flush is executing
    Flushing,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Shorthand for an `InvalidRequest` error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    /// Shorthand for a configuration error without a source.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for a transaction error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Is this a stale-data error from a version check or row count mismatch?
    pub fn is_stale_data(&self) -> bool {
        matches!(self, Error::StaleData(_))
    }

    /// Is this a constraint violation reported by the store?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Constraint)
    }

    /// Does the session need a `rollback()` before it accepts more work?
    pub fn requires_rollback(&self) -> bool {
        matches!(
            self,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::Invalid,
                ..
            })
        )
    }

    /// Is this a retryable error (serialization failure, deadlock)?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Serialization)
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::IdentityConflict(e) => write!(f, "Identity conflict: {}", e),
            Error::DetachedAccess(e) => write!(f, "Detached instance: {}", e),
            Error::StaleData(e) => write!(f, "Stale data: {}", e),
            Error::UnresolvableCycle(e) => write!(f, "Unresolvable cycle: {}", e),
            Error::CascadeConfiguration(e) => write!(f, "Cascade configuration error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} (statement: {})", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}: {}", self.entity, self.key, self.message)
    }
}

impl fmt::Display for DetachedAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attribute '{}' of {} is not loaded and the instance is not bound to a session",
            self.attribute, self.entity
        )
    }
}

impl fmt::Display for StaleDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operation {
            StaleOperation::Update => "UPDATE",
            StaleOperation::Delete => "DELETE",
            StaleOperation::Load => "LOAD",
        };
        write!(
            f,
            "{} of {} {:?} expected to match {} row(s), matched {}",
            op, self.entity, self.key, self.expected_rows, self.actual_rows
        )?;
        if let Some(version) = &self.version {
            write!(f, " (version {:?})", version)?;
        }
        Ok(())
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message, self.entities.join(", "))
    }
}

impl fmt::Display for CascadeConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.entity, self.relationship, self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<IdentityConflictError> for Error {
    fn from(err: IdentityConflictError) -> Self {
        Error::IdentityConflict(err)
    }
}

impl From<DetachedAccessError> for Error {
    fn from(err: DetachedAccessError) -> Self {
        Error::DetachedAccess(err)
    }
}

impl From<StaleDataError> for Error {
    fn from(err: StaleDataError) -> Self {
        Error::StaleData(err)
    }
}

impl From<CycleError> for Error {
    fn from(err: CycleError) -> Self {
        Error::UnresolvableCycle(err)
    }
}

impl From<CascadeConfigurationError> for Error {
    fn from(err: CascadeConfigurationError) -> Self {
        Error::CascadeConfiguration(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
