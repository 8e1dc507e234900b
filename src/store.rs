//! The replicated table store
//!
//! [`ReplicatedStore`] keeps a set of named tables, each backed by its own
//! DuckDB file (or a stored view definition), in two local trees:
//!
//! - `write/` always holds the latest committed version of every table
//! - `read/` holds the copies attached by the live read engine
//!
//! Every mutation goes through one exclusive write lock, produces a new
//! version, publishes it locally, replicates it to the optional backup and
//! then swaps in a fresh read engine. Readers never wait for a write except
//! for the instant of the swap.
//!
//! # Example
//!
//! ```no_run
//! use strata::{CreateTableOptions, ReplicatedStore, StoreConfig};
//!
//! # async fn run() -> strata::Result<()> {
//! let store = ReplicatedStore::open(StoreConfig::new("analytics", "/var/lib/strata")).await?;
//! store
//!     .create_table_as_select("t", "SELECT 1 AS x", CreateTableOptions::default())
//!     .await?;
//!
//! let conn = store.acquire_read_connection().await?;
//! let rows = conn.query("SELECT * FROM t")?;
//! assert_eq!(rows.row_count, 1);
//! # Ok(())
//! # }
//! ```

use crate::backup::BackupStore;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::read::{ReadConnection, ReadHandle};
use crate::version_dir::{read_meta, TableDirectory, Version, VersionClock};
use crate::write::{CreateTableOptions, InsertTableOptions, WriteConnection};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use strata_duckdb::EngineSettings;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Whether a table is materialized or a stored query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Physical,
    View,
}

/// A table as currently published in the write tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub version: Version,
    pub format: TableFormat,
}

/// State guarded by the write lock
#[derive(Debug)]
pub(crate) struct WriteState {
    /// The write tree may be ahead of or behind the backup
    pub(crate) dirty: bool,
    /// Tables published locally whose replication has not succeeded
    pub(crate) unreplicated: BTreeSet<String>,
    pub(crate) closed: bool,
}

impl WriteState {
    pub(crate) fn mark_unreplicated(&mut self, table: &str) {
        self.unreplicated.insert(table.to_string());
        self.dirty = true;
    }
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) write_tree: TableDirectory,
    pub(crate) read_tree: TableDirectory,
    pub(crate) temp_dir: PathBuf,
    pub(crate) backup: Option<BackupStore>,
    pub(crate) clock: VersionClock,
    pub(crate) read_settings: EngineSettings,
    pub(crate) write_settings: EngineSettings,
    pub(crate) write: Mutex<WriteState>,
    pub(crate) read: ReadHandle,
}

/// Versioned, replicated set of tables.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct ReplicatedStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("db_identifier", &self.inner.config.db_identifier)
            .field("local_path", &self.inner.config.local_path)
            .field("backup", &self.inner.backup)
            .finish()
    }
}

impl ReplicatedStore {
    /// Open the store, connecting to the configured backup
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let backup = match &config.backup {
            Some(backup) => Some(BackupStore::from_config(backup, config.backup_prefix())?),
            None => None,
        };
        Self::open_with_backup(config, backup).await
    }

    /// Open the store with an explicit backup (or none), ignoring `config.backup`.
    ///
    /// Restores the write tree from the backup where it is stale and builds
    /// the first read engine before returning.
    #[tracing::instrument(skip_all, fields(db = %config.db_identifier))]
    pub async fn open_with_backup(config: StoreConfig, backup: Option<BackupStore>) -> Result<Self> {
        config.validate()?;
        let (read_settings, write_settings) = config.resolve_engine_settings()?;

        if config.clean {
            if let Some(backup) = &backup {
                backup.delete_all().await?;
            }
            match std::fs::remove_dir_all(&config.local_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StoreError::io(
                        format!("clean {}", config.local_path.display()),
                        e,
                    ))
                }
            }
            info!("Starting from a clean state");
        }

        let write_tree = TableDirectory::new(config.write_path());
        let read_tree = TableDirectory::new(config.read_path());
        write_tree.ensure_root()?;
        read_tree.ensure_root()?;
        let temp_dir = config.local_path.join("tmp");
        if let Err(e) = std::fs::remove_dir_all(&temp_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to clear engine temp directory");
            }
        }

        let inner = StoreInner {
            config,
            write_tree,
            read_tree,
            temp_dir,
            backup,
            clock: VersionClock::new(),
            read_settings,
            write_settings,
            write: Mutex::new(WriteState {
                dirty: true,
                unreplicated: BTreeSet::new(),
                closed: false,
            }),
            read: Arc::new(RwLock::new(None)),
        };

        inner.prune_orphans()?;
        {
            let mut state = inner.write.lock().await;
            inner.sync_write(&mut state).await?;
            inner.sync_read().await?;
        }

        info!(
            tables = inner.write_tree.list_tables()?.len(),
            backup = inner.backup.is_some(),
            "Store opened"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// The configuration the store was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Take a connection to the current read snapshot.
    ///
    /// Any number may be held at once. A write's read swap waits until every
    /// connection acquired before it is dropped, so do not hold one while
    /// writing from the same task.
    pub async fn acquire_read_connection(&self) -> Result<ReadConnection> {
        ReadConnection::acquire(&self.inner.read).await
    }

    /// Take the write lock, reconcile with the backup and open a write engine
    pub async fn acquire_write_connection(&self) -> Result<WriteConnection<'_>> {
        WriteConnection::acquire(&self.inner, true).await
    }

    async fn writer(&self) -> Result<WriteConnection<'_>> {
        WriteConnection::acquire(&self.inner, false).await
    }

    /// Create or replace `name` from the result of `query`
    pub async fn create_table_as_select(
        &self,
        name: &str,
        query: &str,
        opts: CreateTableOptions,
    ) -> Result<()> {
        self.writer()
            .await?
            .create_table_as_select(name, query, opts)
            .await
    }

    /// Insert the result of `query` into `name`
    pub async fn insert_table_as_select(
        &self,
        name: &str,
        query: &str,
        opts: InsertTableOptions,
    ) -> Result<()> {
        self.writer()
            .await?
            .insert_table_as_select(name, query, opts)
            .await
    }

    /// Drop `name` locally and from the backup
    pub async fn drop_table(&self, name: &str) -> Result<()> {
        self.writer().await?.drop_table(name).await
    }

    /// Rename `old` to `new`
    pub async fn rename_table(&self, old: &str, new: &str) -> Result<()> {
        self.writer().await?.rename_table(old, new).await
    }

    /// Add a column to a physical table
    pub async fn add_table_column(&self, table: &str, column: &str, typ: &str) -> Result<()> {
        self.writer()
            .await?
            .add_table_column(table, column, typ)
            .await
    }

    /// Change a column's type in a physical table
    pub async fn alter_table_column(
        &self,
        table: &str,
        column: &str,
        new_type: &str,
    ) -> Result<()> {
        self.writer()
            .await?
            .alter_table_column(table, column, new_type)
            .await
    }

    /// Bytes used by the current data files in the read tree.
    ///
    /// Tables named with the staging prefix are not counted.
    pub async fn size(&self) -> Result<u64> {
        let guard = self.inner.read.read().await;
        if guard.is_none() {
            return Err(StoreError::Closed);
        }
        let prefix = &self.inner.config.staging_table_prefix;
        let tree = &self.inner.read_tree;
        Ok(tree
            .list_tables()?
            .iter()
            .filter(|table| prefix.is_empty() || !table.starts_with(prefix.as_str()))
            .map(|table| tree.data_size(table))
            .sum())
    }

    /// Current tables, as published in the write tree
    pub async fn tables(&self) -> Result<Vec<TableInfo>> {
        let state = self.inner.write.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        let tree = &self.inner.write_tree;
        let mut tables = Vec::new();
        for name in tree.list_tables()? {
            let Some(version) = tree.current_version(&name)? else {
                continue;
            };
            let meta = read_meta(&tree.version_dir(&name, version))?;
            tables.push(TableInfo {
                name,
                version,
                format: if meta.is_view() {
                    TableFormat::View
                } else {
                    TableFormat::Physical
                },
            });
        }
        Ok(tables)
    }

    /// Close the store.
    ///
    /// Waits for the write lock and for every read connection, then closes
    /// the read engine. Later calls fail with [`StoreError::Closed`].
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.write.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let engine = self.inner.read.write().await.take();
        drop(engine);
        if !state.unreplicated.is_empty() {
            warn!(
                tables = ?state.unreplicated,
                "Closing with tables not replicated to the backup"
            );
        }
        info!(db = %self.inner.config.db_identifier, "Store closed");
        Ok(())
    }
}
