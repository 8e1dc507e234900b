//! Read side: a snapshot engine over the read tree
//!
//! A [`ReadEngine`] is built from scratch after every write and swapped in
//! wholesale; it is never mutated after construction. Readers hold a shared
//! lock on the live engine for as long as their [`ReadConnection`] lives.

use crate::attach::attach_tables;
use crate::error::{Result, StoreError};
use crate::version_dir::TableDirectory;
use std::ops::Deref;
use std::sync::Arc;
use strata_duckdb::duckdb::Connection;
use strata_duckdb::{query_rows, Engine, EngineSettings, QueryResult};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error};

/// Live read engine, `None` once the store is closed
pub(crate) type ReadHandle = Arc<RwLock<Option<ReadEngine>>>;

/// The read-side DuckDB instance
pub(crate) struct ReadEngine {
    engine: Engine,
}

impl ReadEngine {
    /// Open a new in-memory instance with every table attached read-only.
    ///
    /// Files come from `read`, current versions from `write`.
    pub(crate) fn build(
        read: &TableDirectory,
        write: &TableDirectory,
        settings: &EngineSettings,
        init_statements: &[String],
    ) -> Result<Self> {
        let engine = Engine::open(None, settings, init_statements)?;
        let failures = attach_tables(&engine, read, write, true)?;
        for failure in &failures {
            error!(
                table = %failure.table,
                error = %failure.error,
                "View does not bind, it is unavailable to readers"
            );
        }
        debug!(views_skipped = failures.len(), "Read engine built");
        Ok(Self { engine })
    }

    fn connect(&self) -> Result<Connection> {
        Ok(self.engine.connect()?)
    }
}

/// A connection to the current read snapshot.
///
/// Dereferences to a DuckDB [`Connection`]. Only run `SELECT`s or create
/// temporary tables on it. The read lock is released when it is dropped.
pub struct ReadConnection {
    // dropped before the guard
    conn: Connection,
    _guard: OwnedRwLockReadGuard<Option<ReadEngine>>,
}

impl ReadConnection {
    pub(crate) async fn acquire(handle: &ReadHandle) -> Result<Self> {
        let guard = Arc::clone(handle).read_owned().await;
        let conn = match guard.as_ref() {
            Some(engine) => engine.connect()?,
            None => return Err(StoreError::Closed),
        };
        Ok(Self {
            conn,
            _guard: guard,
        })
    }

    /// Run a query and collect the rows as JSON values
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        Ok(query_rows(&self.conn, sql)?)
    }
}

impl Deref for ReadConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for ReadConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadConnection").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version_dir::{write_meta, TableMeta, Version};
    use serde_json::json;
    use tempfile::tempdir;

    fn publish_physical(tree: &TableDirectory, table: &str, version: u64, query: &str) {
        let version = Version::from(version);
        let dir = tree.create_version_dir(table, version).unwrap();
        let engine = Engine::open(None, &EngineSettings::default(), &[]).unwrap();
        engine
            .attach(&tree.data_file(table, version), "staging", false)
            .unwrap();
        engine
            .execute_batch(&format!("CREATE TABLE staging.\"default\" AS ({query})"))
            .unwrap();
        drop(engine);
        write_meta(&dir, &TableMeta::physical()).unwrap();
        tree.publish_version(table, version).unwrap();
    }

    #[tokio::test]
    async fn test_connection_reads_snapshot() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        publish_physical(&tree, "t", 1, "SELECT 1 AS x");

        let engine = ReadEngine::build(&tree, &tree, &EngineSettings::default(), &[]).unwrap();
        let handle: ReadHandle = Arc::new(RwLock::new(Some(engine)));
        let conn = ReadConnection::acquire(&handle).await.unwrap();
        let result = conn.query("SELECT x FROM t").unwrap();
        assert_eq!(result.rows[0].values[0], json!(1));

        // deref exposes the raw connection
        let x: i32 = conn.query_row("SELECT x FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(x, 1);
    }

    #[tokio::test]
    async fn test_read_side_rejects_writes() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        publish_physical(&tree, "t", 1, "SELECT 1 AS x");

        let engine = ReadEngine::build(&tree, &tree, &EngineSettings::default(), &[]).unwrap();
        let handle: ReadHandle = Arc::new(RwLock::new(Some(engine)));
        let conn = ReadConnection::acquire(&handle).await.unwrap();
        assert!(conn
            .execute("INSERT INTO \"t__data__db\".\"default\" VALUES (2)", [])
            .is_err());
        // temporary tables are allowed
        conn.execute_batch("CREATE TEMP TABLE scratch AS SELECT 1").unwrap();
    }

    #[tokio::test]
    async fn test_closed_handle() {
        let handle: ReadHandle = Arc::new(RwLock::new(None));
        assert!(matches!(
            ReadConnection::acquire(&handle).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_swap_waits_for_readers() {
        let dir = tempdir().unwrap();
        let tree = TableDirectory::new(dir.path());
        publish_physical(&tree, "t", 1, "SELECT 1 AS x");
        let build = || ReadEngine::build(&tree, &tree, &EngineSettings::default(), &[]).unwrap();

        let handle: ReadHandle = Arc::new(RwLock::new(Some(build())));
        let reader = ReadConnection::acquire(&handle).await.unwrap();
        assert!(handle.try_write().is_err());
        drop(reader);
        let old = handle.try_write().unwrap().replace(build());
        assert!(old.is_some());
    }
}
