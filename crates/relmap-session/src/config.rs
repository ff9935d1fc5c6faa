//! Session configuration.

use relmap_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// What to do when a pending instance's primary key is already claimed by a
/// live instance in the identity map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityConflictPolicy {
    /// Fail the flush before any statement is sent.
    #[default]
    Error,
    /// Log a warning and let the database decide. If the INSERT succeeds the
    /// older instance is detached so the identity map stays unique.
    Warn,
}

/// How `merge` treats a collection the source instance never loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadedCollectionPolicy {
    /// Leave the target's collection untouched.
    #[default]
    DeferToDatabase,
    /// Replace the target's collection with an empty one. With delete-orphan
    /// cascade this deletes the target's current children.
    TreatUnloadedAsEmpty,
}

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Open a transaction on first database access.
    pub autobegin: bool,
    /// Flush before `get` misses the identity map.
    pub autoflush: bool,
    /// Expire all loaded state after commit.
    pub expire_on_commit: bool,
    pub identity_conflict: IdentityConflictPolicy,
    pub unloaded_collections: UnloadedCollectionPolicy,
    /// Send consecutive statements of identical shape through `execute_many`.
    pub batch_statements: bool,
    /// Treat a DELETE that matches no row as stale data even without a
    /// version column.
    pub confirm_deleted_rows: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autobegin: true,
            autoflush: false,
            expire_on_commit: true,
            identity_conflict: IdentityConflictPolicy::Error,
            unloaded_collections: UnloadedCollectionPolicy::DeferToDatabase,
            batch_statements: true,
            confirm_deleted_rows: true,
        }
    }
}

impl SessionConfig {
    pub fn autobegin(mut self, value: bool) -> Self {
        self.autobegin = value;
        self
    }

    pub fn autoflush(mut self, value: bool) -> Self {
        self.autoflush = value;
        self
    }

    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    pub fn identity_conflict(mut self, policy: IdentityConflictPolicy) -> Self {
        self.identity_conflict = policy;
        self
    }

    pub fn unloaded_collections(mut self, policy: UnloadedCollectionPolicy) -> Self {
        self.unloaded_collections = policy;
        self
    }

    pub fn batch_statements(mut self, value: bool) -> Self {
        self.batch_statements = value;
        self
    }

    pub fn confirm_deleted_rows(mut self, value: bool) -> Self {
        self.confirm_deleted_rows = value;
        self
    }

    /// Parse a configuration document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(relmap_core::ConfigError {
                message: "invalid session configuration".to_string(),
                source: Some(Box::new(e)),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert!(config.autobegin);
        assert!(!config.autoflush);
        assert!(config.expire_on_commit);
        assert_eq!(config.identity_conflict, IdentityConflictPolicy::Error);
        assert_eq!(
            config.unloaded_collections,
            UnloadedCollectionPolicy::DeferToDatabase
        );
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = SessionConfig::from_json(
            r#"{"autoflush": true, "identity_conflict": "warn", "unloaded_collections": "treat_unloaded_as_empty"}"#,
        )
        .unwrap();
        assert!(config.autoflush);
        assert!(config.autobegin);
        assert_eq!(config.identity_conflict, IdentityConflictPolicy::Warn);
        assert_eq!(
            config.unloaded_collections,
            UnloadedCollectionPolicy::TreatUnloadedAsEmpty
        );
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = SessionConfig::from_json(r#"{"autobegin": "yes"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
