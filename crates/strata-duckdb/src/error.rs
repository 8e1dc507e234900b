//! Error types for the embedded DuckDB engine wrapper.
//!
//! Covers SQL execution failures, invalid engine settings and malformed
//! statements. Callers in the store wrap these with table and phase context.

/// Errors from the embedded engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A general engine error that is not a DuckDB failure.
    #[error("Engine error: {0}")]
    Engine(String),

    /// An engine settings error (e.g. an unparseable memory size).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The SQL statement could not be parsed or bound by DuckDB.
    ///
    /// The inner string contains the DuckDB diagnostic message.
    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    /// A DuckDB operation failed (wrapper around the duckdb crate error).
    #[error("DuckDB error: {0}")]
    DuckDb(String),
}

impl EngineError {
    /// Create an `InvalidSql` error that carries a preview of the statement.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata_duckdb::EngineError;
    ///
    /// let err = EngineError::invalid_sql("SELECT * FORM t", "syntax error near 'FORM'");
    /// assert!(err.to_string().contains("syntax error"));
    /// ```
    pub fn invalid_sql(sql: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        // Truncate very long statements in the error message
        let sql_preview = if sql.len() > 120 {
            let mut end = 120;
            while !sql.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &sql[..end])
        } else {
            sql.to_string()
        };
        Self::InvalidSql(format!("{} (query: {})", detail, sql_preview))
    }

    /// Wrap a raw DuckDB error string.
    pub fn duckdb(detail: impl Into<String>) -> Self {
        Self::DuckDb(detail.into())
    }

    /// Create a settings error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config(detail.into())
    }
}

impl From<duckdb::Error> for EngineError {
    fn from(e: duckdb::Error) -> Self {
        let msg = e.to_string();
        // Heuristic: DuckDB syntax / parse errors
        if msg.contains("Parser Error") || msg.contains("Binder Error") {
            EngineError::InvalidSql(msg)
        } else {
            EngineError::DuckDb(msg)
        }
    }
}

/// A specialised `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
