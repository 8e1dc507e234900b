//! Error types for the replicated table store
//!
//! Every mutation either succeeds or returns one of these errors with the
//! table left at its previous published version. Local filesystem and engine
//! failures are wrapped with the operation and table they occurred in.

use crate::backup::BackupError;
use strata_duckdb::EngineError;
use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by the replicated table store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Table {0} is a view and cannot be modified in place")]
    NotPhysical(String),

    #[error("Invalid table name {name:?}: {reason}")]
    InvalidTableName { name: String, reason: String },

    #[error("Corrupted table {table}: {detail}")]
    Corrupted { table: String, detail: String },

    #[error("IO error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Store is closed")]
    Closed,

    #[error("{op} {table:?} failed: {source}")]
    Operation {
        op: &'static str,
        table: String,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Wrap an IO error with a description of what was being done
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a corruption error for a table
    pub fn corrupted(table: impl Into<String>, detail: impl Into<String>) -> Self {
        StoreError::Corrupted {
            table: table.into(),
            detail: detail.into(),
        }
    }

    /// Create an invalid-name error
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::InvalidTableName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Attach operation and table context.
    ///
    /// Not-found errors are returned bare so callers can always match on them.
    ///
    /// # Example
    /// ```ignore
    /// StoreError::TableNotFound("t".into()).during("insert", "t")
    /// // stays TableNotFound("t")
    /// ```
    pub fn during(self, op: &'static str, table: impl Into<String>) -> Self {
        match self {
            e @ (StoreError::TableNotFound(_) | StoreError::Operation { .. }) => e,
            e => StoreError::Operation {
                op,
                table: table.into(),
                source: Box::new(e),
            },
        }
    }

    /// Returns `true` if this error (or the one it wraps) is a missing table
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::TableNotFound(_) => true,
            StoreError::Operation { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The innermost error, skipping operation context
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Operation { source, .. } => source.root(),
            e => e,
        }
    }
}

/// Extension for attaching operation context to results
pub(crate) trait ResultExt<T> {
    fn during(self, op: &'static str, table: &str) -> Result<T>;
}

impl<T, E: Into<StoreError>> ResultExt<T> for std::result::Result<T, E> {
    fn during(self, op: &'static str, table: &str) -> Result<T> {
        self.map_err(|e| e.into().during(op, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_passes_through_context() {
        let err = StoreError::TableNotFound("t".into()).during("drop", "t");
        assert!(matches!(err, StoreError::TableNotFound(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_context_wraps_once() {
        let err = StoreError::Config("x".into())
            .during("insert", "t")
            .during("outer", "t");
        match &err {
            StoreError::Operation { op, .. } => assert_eq!(*op, "insert"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(err.root(), StoreError::Config(_)));
    }

    #[test]
    fn test_display_includes_table_and_phase() {
        let err = StoreError::io(
            "write version pointer",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        )
        .during("create", "events");
        let msg = err.to_string();
        assert!(msg.contains("create"));
        assert!(msg.contains("events"));
        assert!(msg.contains("disk full"));
    }
}
