//! Write side: the single writer and its connection
//!
//! A [`WriteConnection`] holds the store's write lock for its whole lifetime.
//! Its CRUD methods stage every change in a version directory the readers
//! have never seen, publish it, replicate it, and finally rebuild the read
//! side. The underlying [`WriteEngine`] is closed (checkpointing every
//! attached file) before a version is published and reopened on next use.

use crate::attach::{attach_tables, data_relation};
use crate::config::RenamePolicy;
use crate::error::{Result, ResultExt, StoreError};
use crate::store::{StoreInner, WriteState};
use crate::version_dir::{read_meta, validate_table_name, write_meta, TableMeta, Version};
use strata_duckdb::duckdb::Connection;
use strata_duckdb::sql::{quote_ident, quote_literal};
use strata_duckdb::{Engine, QueryResult};
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Options for [`WriteConnection::create_table_as_select`]
#[derive(Debug, Clone, Default)]
pub struct CreateTableOptions {
    /// Store the query as a view instead of materializing it
    pub view: bool,
}

/// How inserted rows are combined with existing ones
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InsertStrategy {
    /// Add every row
    #[default]
    Append,
    /// Replace rows whose unique key matches an incoming row
    Merge,
}

/// Options for [`WriteConnection::insert_table_as_select`]
#[derive(Debug, Clone, Default)]
pub struct InsertTableOptions {
    /// Match columns by name rather than position
    pub by_name: bool,
    pub strategy: InsertStrategy,
    /// Key columns for [`InsertStrategy::Merge`]
    pub unique_key: Vec<String>,
}

impl InsertTableOptions {
    pub fn append() -> Self {
        Self::default()
    }

    pub fn merge<I, S>(unique_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            by_name: false,
            strategy: InsertStrategy::Merge,
            unique_key: unique_key.into_iter().map(Into::into).collect(),
        }
    }

    pub fn by_name(mut self) -> Self {
        self.by_name = true;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.strategy == InsertStrategy::Merge && self.unique_key.is_empty() {
            return Err(StoreError::Config(
                "merge strategy requires at least one unique key column".into(),
            ));
        }
        Ok(())
    }
}

/// The write-side DuckDB instance.
///
/// In memory, with the current version of every table attached read-write.
pub(crate) struct WriteEngine {
    engine: Engine,
    staging_prefix: String,
}

impl WriteEngine {
    pub(crate) fn open(inner: &StoreInner) -> Result<Self> {
        std::fs::create_dir_all(&inner.temp_dir).map_err(|e| {
            StoreError::io(format!("create {}", inner.temp_dir.display()), e)
        })?;
        let engine = Engine::open(None, &inner.write_settings, &inner.config.init_statements)?;
        engine.execute_batch(&format!(
            "SET temp_directory = {}",
            quote_literal(&inner.temp_dir.to_string_lossy())
        ))?;

        let failures = attach_tables(&engine, &inner.write_tree, &inner.write_tree, false)?;
        for failure in failures {
            warn!(
                table = %failure.table,
                error = %failure.error,
                "View no longer binds, leaving it out of the write engine"
            );
        }
        debug!(db = %inner.config.db_identifier, "Write engine opened");
        Ok(Self {
            engine,
            staging_prefix: inner.config.staging_table_prefix.clone(),
        })
    }

    /// Materialize `query` into a new physical file
    fn create_physical(
        &self,
        table: &str,
        version: Version,
        file: &std::path::Path,
        query: &str,
    ) -> Result<()> {
        let alias = format!("{table}__{version}__db");
        self.engine.attach(file, &alias, false)?;
        let created = self.engine.execute_batch(&format!(
            "CREATE OR REPLACE TABLE {}.\"default\" AS ({}\n)",
            quote_ident(&alias),
            query
        ));
        let detached = self.engine.detach_if_exists(&alias);
        created?;
        detached?;
        Ok(())
    }

    /// Check that `query` binds as a view named `table`
    fn create_view(&self, table: &str, query: &str) -> Result<()> {
        Ok(self.engine.create_or_replace_view(table, query)?)
    }

    /// Insert into the attached file of `table`.
    ///
    /// Returns `false` when a merge found nothing to stage and left the table untouched.
    fn insert(&self, table: &str, query: &str, opts: &InsertTableOptions) -> Result<bool> {
        let target = data_relation(table);
        let by_name = if opts.by_name { " BY NAME" } else { "" };
        match opts.strategy {
            InsertStrategy::Append => {
                self.engine
                    .execute_batch(&format!("INSERT INTO {target}{by_name} ({query}\n)"))?;
                Ok(true)
            }
            InsertStrategy::Merge => {
                let staged = quote_ident(&format!(
                    "{}{}",
                    self.staging_prefix,
                    Uuid::new_v4().simple()
                ));
                self.engine
                    .execute_batch(&format!("CREATE TEMPORARY TABLE {staged} AS ({query}\n)"))?;
                let merged = self.merge_staged(&target, &staged, by_name, &opts.unique_key);
                let dropped = self
                    .engine
                    .execute_batch(&format!("DROP TABLE IF EXISTS {staged}"));
                let changed = merged?;
                dropped?;
                Ok(changed)
            }
        }
    }

    fn merge_staged(
        &self,
        target: &str,
        staged: &str,
        by_name: &str,
        unique_key: &[String],
    ) -> Result<bool> {
        // An empty stage would infer column types from nothing
        let empty = self.engine.with_connection(|conn| {
            Ok(conn.query_row(
                &format!("SELECT count(*) = 0 FROM {staged}"),
                [],
                |row| row.get::<_, bool>(0),
            )?)
        })?;
        if empty {
            return Ok(false);
        }

        let predicate = unique_key
            .iter()
            .map(|key| {
                let key = quote_ident(key);
                format!("base.{key} IS NOT DISTINCT FROM tmp.{key}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        self.engine.transaction(|conn| {
            conn.execute_batch(&format!(
                "DELETE FROM {target} base WHERE EXISTS (SELECT 1 FROM {staged} tmp WHERE {predicate})"
            ))?;
            conn.execute_batch(&format!("INSERT INTO {target}{by_name} SELECT * FROM {staged}"))?;
            Ok(())
        })?;
        Ok(true)
    }

    fn add_column(&self, table: &str, column: &str, typ: &str) -> Result<()> {
        self.engine.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            data_relation(table),
            quote_ident(column),
            typ
        ))?;
        Ok(())
    }

    fn alter_column(&self, table: &str, column: &str, new_type: &str) -> Result<()> {
        self.engine.execute_batch(&format!(
            "ALTER TABLE {} ALTER {} TYPE {}",
            data_relation(table),
            quote_ident(column),
            new_type
        ))?;
        Ok(())
    }
}

/// Exclusive access to the write side.
///
/// Obtained from [`ReplicatedStore::acquire_write_connection`](crate::ReplicatedStore::acquire_write_connection).
/// Dropping it releases the write lock. Several operations and raw
/// statements can be chained on one connection.
pub struct WriteConnection<'a> {
    inner: &'a StoreInner,
    state: MutexGuard<'a, WriteState>,
    engine: Option<WriteEngine>,
}

impl<'a> WriteConnection<'a> {
    pub(crate) async fn acquire(inner: &'a StoreInner, open_engine: bool) -> Result<Self> {
        let mut state = inner.write.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        inner.sync_write(&mut state).await?;
        let engine = if open_engine {
            Some(WriteEngine::open(inner)?)
        } else {
            None
        };
        Ok(Self {
            inner,
            state,
            engine,
        })
    }

    fn engine(&mut self) -> Result<&WriteEngine> {
        let engine = match self.engine.take() {
            Some(engine) => engine,
            None => WriteEngine::open(self.inner)?,
        };
        Ok(self.engine.insert(engine))
    }

    fn close_engine(&mut self) {
        self.engine = None;
    }

    /// Execute a raw statement on the write engine
    pub fn execute(&mut self, sql: &str) -> Result<usize> {
        Ok(self.engine()?.engine.execute(sql)?)
    }

    /// Run a query on the write engine
    pub fn query(&mut self, sql: &str) -> Result<QueryResult> {
        Ok(self.engine()?.engine.query(sql)?)
    }

    /// Run `f` against the write engine's connection
    pub fn with_connection<R>(
        &mut self,
        f: impl FnOnce(&Connection) -> strata_duckdb::Result<R>,
    ) -> Result<R> {
        Ok(self.engine()?.engine.with_connection(f)?)
    }

    /// Create or replace `name` from the result of `query`
    pub async fn create_table_as_select(
        &mut self,
        name: &str,
        query: &str,
        opts: CreateTableOptions,
    ) -> Result<()> {
        debug!(db = %self.inner.config.db_identifier, table = name, view = opts.view, "Create table");
        validate_table_name(name)?;
        if let Some(existing) = self.find_table(name)?.filter(|t| t != name) {
            return Err(StoreError::TableExists(existing));
        }
        let inner = self.inner;
        let previous = inner.write_tree.current_version(name).during("create", name)?;
        let version = inner.clock.next_after(previous);

        if let Err(e) = self.stage_create(name, version, query, opts.view) {
            self.close_engine();
            let cleanup = match previous {
                Some(_) => inner.write_tree.remove_version(name, version),
                None => inner.write_tree.remove_table(name),
            };
            if let Err(cleanup) = cleanup {
                warn!(table = name, version = %version, error = %cleanup, "Failed to remove staged version");
            }
            return Err(e.during("create", name));
        }
        self.state.mark_unreplicated(name);
        info!(
            db = %inner.config.db_identifier,
            table = name,
            version = %version,
            view = opts.view,
            "Created table"
        );
        self.finish(&[name], "create").await
    }

    fn stage_create(&mut self, name: &str, version: Version, query: &str, view: bool) -> Result<()> {
        let inner = self.inner;
        let dir = inner.write_tree.create_version_dir(name, version)?;
        let engine = self.engine()?;
        if view {
            engine.create_view(name, query)?;
            write_meta(&dir, &TableMeta::view(query))?;
        } else {
            engine.create_physical(name, version, &inner.write_tree.data_file(name, version), query)?;
            write_meta(&dir, &TableMeta::physical())?;
        }
        self.close_engine();
        inner.write_tree.publish_version(name, version)
    }

    /// Insert the result of `query` into the physical table `name`
    pub async fn insert_table_as_select(
        &mut self,
        name: &str,
        query: &str,
        opts: InsertTableOptions,
    ) -> Result<()> {
        debug!(db = %self.inner.config.db_identifier, table = name, strategy = ?opts.strategy, "Insert into table");
        opts.validate()?;
        let current = self.physical_version(name, "insert")?;
        let changed = self
            .engine()
            .and_then(|engine| engine.insert(name, query, &opts))
            .during("insert", name)?;
        if !changed {
            debug!(table = name, "Merge source is empty, table unchanged");
            return Ok(());
        }
        self.bump_version(name, current, "insert").await
    }

    /// Add a column of type `typ` to the physical table `table`
    pub async fn add_table_column(&mut self, table: &str, column: &str, typ: &str) -> Result<()> {
        debug!(table, column, typ, "Add column");
        let current = self.physical_version(table, "add column")?;
        self.engine()
            .and_then(|engine| engine.add_column(table, column, typ))
            .during("add column", table)?;
        self.bump_version(table, current, "add column").await
    }

    /// Change the type of `column` in the physical table `table`
    pub async fn alter_table_column(
        &mut self,
        table: &str,
        column: &str,
        new_type: &str,
    ) -> Result<()> {
        debug!(table, column, new_type, "Alter column");
        let current = self.physical_version(table, "alter column")?;
        self.engine()
            .and_then(|engine| engine.alter_column(table, column, new_type))
            .during("alter column", table)?;
        self.bump_version(table, current, "alter column").await
    }

    /// Remove `name` everywhere, backup first
    pub async fn drop_table(&mut self, name: &str) -> Result<()> {
        debug!(db = %self.inner.config.db_identifier, table = name, "Drop table");
        let inner = self.inner;
        if inner.write_tree.current_version(name).during("drop", name)?.is_none() {
            return Err(StoreError::TableNotFound(name.to_string()));
        }
        self.close_engine();
        if let Some(backup) = &inner.backup {
            backup.delete_table(name).await.during("drop", name)?;
        }
        inner.write_tree.remove_table(name).during("drop", name)?;
        self.state.unreplicated.remove(name);
        info!(db = %inner.config.db_identifier, table = name, "Dropped table");
        inner.sync_read().await.during("drop", name)
    }

    /// Rename `old` to `new`, giving it a fresh version
    pub async fn rename_table(&mut self, old: &str, new: &str) -> Result<()> {
        debug!(db = %self.inner.config.db_identifier, from = old, to = new, "Rename table");
        validate_table_name(new)?;
        if old.eq_ignore_ascii_case(new) {
            return Err(StoreError::invalid_name(
                new,
                format!("same name as the table being renamed ({old})"),
            ));
        }
        let inner = self.inner;
        let tree = &inner.write_tree;
        let current = tree
            .current_version(old)
            .during("rename", old)?
            .ok_or_else(|| StoreError::TableNotFound(old.to_string()))?;

        let replaced = match self.find_table(new)? {
            Some(dest) if inner.config.rename_policy == RenamePolicy::ErrorIfExists => {
                return Err(StoreError::TableExists(dest));
            }
            Some(dest) => {
                let version = tree.current_version(&dest).during("rename", &dest)?;
                Some((dest, version))
            }
            None => None,
        };

        self.close_engine();
        if let Some((dest, _)) = &replaced {
            tree.remove_table(dest).during("rename", dest)?;
        }
        tree.rename_table(old, new).during("rename", old)?;
        let floor = replaced
            .as_ref()
            .and_then(|(_, v)| *v)
            .map_or(current, |v| v.max(current));
        let version = inner.clock.next_after(Some(floor));
        tree.rename_version(new, current, version).during("rename", new)?;
        tree.publish_version(new, version).during("rename", new)?;

        let mut touched = vec![new, old];
        if let Some((dest, _)) = &replaced {
            if dest != new {
                touched.push(dest.as_str());
            }
        }
        for table in &touched {
            self.state.mark_unreplicated(table);
        }
        info!(
            db = %inner.config.db_identifier,
            from = old,
            to = new,
            version = %version,
            replaced = replaced.is_some(),
            "Renamed table"
        );
        self.finish(&touched, "rename").await
    }

    /// Existing table whose name equals `name` ignoring case
    fn find_table(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .write_tree
            .list_tables()?
            .into_iter()
            .find(|t| {
                t.eq_ignore_ascii_case(name)
                    && matches!(self.inner.write_tree.current_version(t), Ok(Some(_)))
            }))
    }

    fn physical_version(&self, name: &str, op: &'static str) -> Result<Version> {
        let tree = &self.inner.write_tree;
        let version = tree
            .current_version(name)
            .during(op, name)?
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))?;
        let meta = read_meta(&tree.version_dir(name, version)).during(op, name)?;
        if meta.is_view() {
            return Err(StoreError::NotPhysical(name.to_string()).during(op, name));
        }
        Ok(version)
    }

    /// Move a mutated version directory to a fresh version and publish it
    async fn bump_version(&mut self, name: &str, current: Version, op: &'static str) -> Result<()> {
        self.close_engine();
        let inner = self.inner;
        let version = inner.clock.next_after(Some(current));
        inner
            .write_tree
            .rename_version(name, current, version)
            .during(op, name)?;
        if let Err(e) = inner.write_tree.publish_version(name, version) {
            if let Err(undo) = inner.write_tree.rename_version(name, version, current) {
                warn!(table = name, error = %undo, "Failed to restore version directory");
            }
            return Err(e.during(op, name));
        }
        self.state.mark_unreplicated(name);
        info!(db = %inner.config.db_identifier, table = name, version = %version, op, "Published new version");
        self.finish(&[name], op).await
    }

    /// Replicate the touched tables, reclaim superseded local versions, swap readers.
    ///
    /// A replication failure is returned after the read side has caught up;
    /// the new local version stays current and is pushed on the next sync.
    async fn finish(&mut self, tables: &[&str], op: &'static str) -> Result<()> {
        let inner = self.inner;
        let mut failure = None;
        for table in tables {
            match inner.replicate(table).await {
                Ok(()) => {
                    self.state.unreplicated.remove(*table);
                    inner.prune_local(table);
                }
                Err(e) => {
                    warn!(table = *table, error = %e, "Replication failed, backup is behind");
                    failure.get_or_insert(e);
                }
            }
        }
        self.state.dirty = !self.state.unreplicated.is_empty();
        inner.sync_read().await.during(op, tables[0])?;
        match failure {
            Some(e) => Err(e.during(op, tables[0])),
            None => Ok(()),
        }
    }
}
