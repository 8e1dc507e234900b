//! A single physical DuckDB instance.
//!
//! The store opens one [`Engine`] per side: an in-memory instance that
//! attaches every table's current data file read-only and serves queries,
//! and a short-lived instance that holds the write lock and attaches the
//! files it mutates. Tables are never stored in the engine's own catalog;
//! each table lives in its own attached file and is exposed through a view
//! of the same name.
//!
//! # Examples
//!
//! ```no_run
//! use strata_duckdb::{Engine, EngineSettings};
//!
//! let engine = Engine::open(None, &EngineSettings::default(), &[])?;
//! let result = engine.query("SELECT 42 AS answer")?;
//! assert_eq!(result.row_count, 1);
//! # Ok::<(), strata_duckdb::EngineError>(())
//! ```

use crate::error::{EngineError, Result};
use crate::settings::EngineSettings;
use crate::sql::{quote_ident, quote_literal};
use duckdb::{types::ValueRef, Connection};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use tracing::{debug, warn};

/// One open DuckDB database.
///
/// Safe to share across threads (`Send + Sync`).
pub struct Engine {
    /// Primary connection.
    /// Note: Using Mutex because DuckDB Connection contains RefCell which is not Sync.
    connection: Mutex<Connection>,
}

/// The result of executing a SQL query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in the result set.
    pub columns: Vec<String>,

    /// Rows returned by the query.
    pub rows: Vec<QueryResultRow>,

    /// Number of rows in `rows`.
    pub row_count: usize,
}

/// A single row in query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultRow {
    /// Column values encoded as JSON.
    pub values: Vec<JsonValue>,
}

impl Engine {
    /// Open an engine, in memory when `path` is `None`, and run the init statements.
    pub fn open(
        path: Option<&Path>,
        settings: &EngineSettings,
        init_statements: &[String],
    ) -> Result<Self> {
        let config = settings.to_duckdb_config()?;
        let connection = match path {
            Some(path) => Connection::open_with_flags(path, config),
            None => Connection::open_in_memory_with_flags(config),
        }
        .map_err(|e| EngineError::duckdb(format!("Failed to open DuckDB: {}", e)))?;

        for statement in init_statements {
            connection.execute_batch(statement).map_err(|e| {
                EngineError::duckdb(format!("Init statement {:?} failed: {}", statement, e))
            })?;
        }

        debug!(path = ?path, "DuckDB engine opened");
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Execute one statement, returning the number of changed rows.
    pub fn execute(&self, sql: &str) -> Result<usize> {
        let conn = self.connection.lock();
        Ok(conn.execute(sql, [])?)
    }

    /// Execute one or more statements separated by semicolons.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.connection.lock();
        Ok(conn.execute_batch(sql)?)
    }

    /// Execute a query and collect every row as JSON values.
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        let conn = self.connection.lock();
        query_rows(&conn, sql)
    }

    /// Run `f` against the primary connection.
    pub fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.connection.lock();
        f(&conn)
    }

    /// Run `f` inside one transaction, rolling back if it fails.
    pub fn transaction<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.connection.lock();
        conn.execute_batch("BEGIN TRANSACTION")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Open another connection to the same database.
    pub fn connect(&self) -> Result<Connection> {
        let conn = self.connection.lock();
        conn.try_clone()
            .map_err(|e| EngineError::duckdb(format!("Failed to clone connection: {}", e)))
    }

    /// Attach a database file under `alias`.
    pub fn attach(&self, file: &Path, alias: &str, read_only: bool) -> Result<()> {
        let mode = if read_only { " (READ_ONLY)" } else { "" };
        let sql = format!(
            "ATTACH {} AS {}{}",
            quote_literal(&file.to_string_lossy()),
            quote_ident(alias),
            mode
        );
        self.execute_batch(&sql)
    }

    /// Detach `alias` if it is attached.
    pub fn detach_if_exists(&self, alias: &str) -> Result<()> {
        self.execute_batch(&format!("DETACH DATABASE IF EXISTS {}", quote_ident(alias)))
    }

    /// Create or replace the view `name` over `select_sql`.
    pub fn create_or_replace_view(&self, name: &str, select_sql: &str) -> Result<()> {
        let sql = format!(
            "CREATE OR REPLACE VIEW {} AS ({}\n)",
            quote_ident(name),
            select_sql
        );
        self.execute_batch(&sql)
            .map_err(|e| EngineError::invalid_sql(select_sql, e.to_string()))
    }
}

/// Execute `sql` on `conn` and collect every row as JSON values.
pub fn query_rows(conn: &Connection, sql: &str) -> Result<QueryResult> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| EngineError::invalid_sql(sql, e.to_string()))?;

    let mut rows_result = stmt
        .query([])
        .map_err(|e| EngineError::DuckDb(format!("Failed to execute query: {}", e)))?;

    // Read the column count from each row; stmt.column_names() is only
    // reachable once the Rows borrow is released.
    let mut rows = Vec::new();
    while let Some(row) = rows_result
        .next()
        .map_err(|e| EngineError::DuckDb(format!("Failed to fetch row: {}", e)))?
    {
        let mut values = Vec::new();
        for i in 0.. {
            match row.get_ref(i) {
                Ok(value) => values.push(duckdb_value_to_json(value)),
                Err(_) => break,
            }
        }
        rows.push(QueryResultRow { values });
    }
    drop(rows_result);

    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    Ok(QueryResult {
        columns,
        row_count: rows.len(),
        rows,
    })
}

/// Convert a DuckDB `ValueRef` to a `serde_json::Value`.
fn duckdb_value_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Boolean(b) => JsonValue::Bool(b),
        ValueRef::TinyInt(i) => JsonValue::Number(i.into()),
        ValueRef::SmallInt(i) => JsonValue::Number(i.into()),
        ValueRef::Int(i) => JsonValue::Number(i.into()),
        ValueRef::BigInt(i) => JsonValue::Number(i.into()),
        ValueRef::HugeInt(i) => {
            // Fall back to a string for values outside i64.
            if let Ok(n) = i64::try_from(i) {
                JsonValue::Number(n.into())
            } else {
                JsonValue::String(i.to_string())
            }
        }
        ValueRef::UTinyInt(i) => JsonValue::Number(i.into()),
        ValueRef::USmallInt(i) => JsonValue::Number(i.into()),
        ValueRef::UInt(i) => JsonValue::Number(i.into()),
        ValueRef::UBigInt(i) => JsonValue::Number(i.into()),
        ValueRef::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Double(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(s) => JsonValue::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => JsonValue::String(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b,
        )),
        _ => JsonValue::String(format!("{:?}", value)),
    }
}
